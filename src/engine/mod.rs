mod allocator;
mod catalog;
mod error;
mod lifecycle;

pub use error::EngineError;
pub use lifecycle::NewReservation;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::hours::LocalZone;
use crate::model::*;
use crate::store::Store;

/// The booking core. Owns no data itself: everything lives behind the `Store`,
/// which may be in-memory or durable.
pub struct Engine {
    store: Arc<dyn Store>,
    zone: LocalZone,
    /// Held across the final overlap check and the insert of a reservation,
    /// so two creates on the same table can't both pass the check.
    table_locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, zone: LocalZone) -> Self {
        Self {
            store,
            zone,
            table_locks: DashMap::new(),
        }
    }

    pub(super) async fn lock_table(&self, table_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self
            .table_locks
            .entry(table_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        // The DashMap shard guard is gone before we await.
        lock.lock_owned().await
    }

    pub(super) async fn require_restaurant(&self, id: Ulid) -> Result<Restaurant, EngineError> {
        self.store.get_restaurant(id).await?.ok_or(EngineError::NotFound(id))
    }
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Shape checks shared by create and availability: a positive duration inside the
/// supported timestamp range and no longer than the longest allowed stay.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if end <= start {
        return Err(EngineError::invalid("end must be after start"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::invalid("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(EngineError::invalid("reservation too long"));
    }
    Ok(span)
}

pub(crate) fn validate_guests(guests: i64) -> Result<u32, EngineError> {
    if guests <= 0 {
        return Err(EngineError::invalid("guests must be positive"));
    }
    if guests > crate::limits::MAX_GUESTS as i64 {
        return Err(EngineError::invalid("too many guests"));
    }
    Ok(guests as u32)
}
