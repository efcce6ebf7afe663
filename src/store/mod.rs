//! Storage collaborator.
//!
//! The booking engine only ever talks to a `Store` trait object; which backend
//! sits behind it is decided once at startup.

mod durable;
mod log;
mod memory;

pub use durable::WalStore;
pub use log::EventLog;
pub use memory::{MemoryStore, TableLedger};

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_restaurant(&self, restaurant: Restaurant) -> Result<(), StoreError>;
    async fn get_restaurant(&self, id: Ulid) -> Result<Option<Restaurant>, StoreError>;
    async fn list_restaurants(&self) -> Result<Vec<Restaurant>, StoreError>;

    async fn insert_table(&self, table: Table) -> Result<(), StoreError>;
    async fn get_table(&self, id: Ulid) -> Result<Option<Table>, StoreError>;
    /// Tables of one restaurant, in no particular order.
    async fn list_tables(&self, restaurant_id: Ulid) -> Result<Vec<Table>, StoreError>;

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError>;
    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;
    /// Mark a reservation cancelled and return it. Already-cancelled is not an error.
    async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, StoreError>;
    /// Every reservation of a user, any status, ascending by start then id.
    async fn list_reservations_by_user(&self, user_id: &str) -> Result<Vec<Reservation>, StoreError>;
    /// Active reservations matching `filter`, ascending by start then id.
    async fn list_overlap(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, StoreError>;
}

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::Io(e) => write!(f, "storage I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

pub(crate) fn by_start_then_id(a: &Reservation, b: &Reservation) -> std::cmp::Ordering {
    a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id))
}
