use std::io;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::log::EventLog;
use super::memory::MemoryStore;
use super::{Store, StoreError};

type Ack = oneshot::Sender<io::Result<()>>;

enum LogCommand {
    Append { event: Event, ack: Ack },
    Rewrite { events: Vec<Event>, ack: Ack },
    Stats { reply: oneshot::Sender<u64> },
}

/// Owns the `EventLog` on its own task. Appends that queue up while one fsync
/// is in flight are written together and share the next fsync.
struct LogWriter {
    log: EventLog,
    rx: mpsc::Receiver<LogCommand>,
}

impl LogWriter {
    async fn run(mut self) {
        let mut pending: Vec<(Event, Ack)> = Vec::new();
        while let Some(cmd) = self.rx.recv().await {
            let mut deferred = None;
            match cmd {
                LogCommand::Append { event, ack } => {
                    pending.push((event, ack));
                    while let Ok(next) = self.rx.try_recv() {
                        match next {
                            LogCommand::Append { event, ack } => pending.push((event, ack)),
                            other => {
                                deferred = Some(other);
                                break;
                            }
                        }
                    }
                    self.commit(&mut pending);
                }
                other => deferred = Some(other),
            }
            if let Some(cmd) = deferred {
                self.control(cmd);
            }
        }
        debug!("event log writer stopped");
    }

    fn commit(&mut self, pending: &mut Vec<(Event, Ack)>) {
        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(pending.len() as f64);
        let started = Instant::now();

        // The batch lands whole or not at all; a failed sync rolls the file back itself.
        let result = match pending.iter().try_for_each(|(event, _)| self.log.push(event)) {
            Ok(()) => self.log.sync(),
            Err(e) => {
                self.log.discard();
                Err(e)
            }
        };

        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        for (_, ack) in pending.drain(..) {
            let _ = ack.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }
    }

    fn control(&mut self, cmd: LogCommand) {
        match cmd {
            LogCommand::Rewrite { events, ack } => {
                let _ = ack.send(self.log.rewrite(&events));
            }
            LogCommand::Stats { reply } => {
                let _ = reply.send(self.log.appends_since_rewrite());
            }
            LogCommand::Append { event, ack } => {
                let mut one = vec![(event, ack)];
                self.commit(&mut one);
            }
        }
    }
}

/// Durable store: an in-memory index rebuilt from, and kept in step with, an
/// fsynced event log. A write is acknowledged only after its record is synced.
pub struct WalStore {
    memory: MemoryStore,
    log_tx: mpsc::Sender<LogCommand>,
    /// Writers hold it shared; compaction holds it exclusively so no event can
    /// land between taking the snapshot and swapping the file.
    gate: RwLock<()>,
}

impl WalStore {
    /// Replay the log at `path` and start its writer task. Must run inside a tokio runtime.
    pub async fn open(path: &Path) -> io::Result<Self> {
        let replay = EventLog::replay(path)?;
        let events = &replay.events;
        let memory = MemoryStore::new();
        let mut skipped = 0usize;
        for event in events {
            if let Err(e) = memory.apply(event).await {
                // A record of a lost duplicate-id race. The live process refused it too.
                debug!(error = %e, "skipping unappliable event during replay");
                skipped += 1;
            }
        }
        info!(
            path = %path.display(),
            events = events.len(),
            skipped,
            restaurants = memory.restaurant_count(),
            reservations = memory.reservation_count(),
            "event log replayed"
        );

        let log = EventLog::open(path, replay.valid_len)?;
        let (log_tx, rx) = mpsc::channel(4096);
        tokio::spawn(LogWriter { log, rx }.run());

        Ok(Self {
            memory,
            log_tx,
            gate: RwLock::new(()),
        })
    }

    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        let (ack, rx) = oneshot::channel();
        self.log_tx
            .send(LogCommand::Append { event: event.clone(), ack })
            .await
            .map_err(|_| StoreError::Io("event log writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("event log writer dropped response".into()))??;
        Ok(())
    }

    async fn persist(&self, event: Event) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        self.memory.check(&event)?;
        self.append(&event).await?;
        self.memory.apply(&event).await
    }

    /// Rewrite the log as the minimal event list for the current state.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let _exclusive = self.gate.write().await;
        let events = self.memory.snapshot().await;
        let count = events.len();
        let (ack, rx) = oneshot::channel();
        self.log_tx
            .send(LogCommand::Rewrite { events, ack })
            .await
            .map_err(|_| StoreError::Io("event log writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("event log writer dropped response".into()))??;
        Ok(count)
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (reply, rx) = oneshot::channel();
        if self.log_tx.send(LogCommand::Stats { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Store for WalStore {
    async fn insert_restaurant(&self, restaurant: Restaurant) -> Result<(), StoreError> {
        self.persist(Event::RestaurantCreated(restaurant)).await
    }

    async fn get_restaurant(&self, id: Ulid) -> Result<Option<Restaurant>, StoreError> {
        self.memory.get_restaurant(id).await
    }

    async fn list_restaurants(&self) -> Result<Vec<Restaurant>, StoreError> {
        self.memory.list_restaurants().await
    }

    async fn insert_table(&self, table: Table) -> Result<(), StoreError> {
        self.persist(Event::TableCreated(table)).await
    }

    async fn get_table(&self, id: Ulid) -> Result<Option<Table>, StoreError> {
        self.memory.get_table(id).await
    }

    async fn list_tables(&self, restaurant_id: Ulid) -> Result<Vec<Table>, StoreError> {
        self.memory.list_tables(restaurant_id).await
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.persist(Event::ReservationCreated(reservation)).await
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        self.memory.get_reservation(id).await
    }

    async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, StoreError> {
        // Cancelling twice would only add a redundant record.
        match self.memory.get_reservation(id).await? {
            None => return Err(StoreError::NotFound(id)),
            Some(r) if !r.is_active() => return Ok(r),
            Some(_) => {}
        }
        self.persist(Event::ReservationCancelled { id }).await?;
        self.memory.get_reservation(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn list_reservations_by_user(&self, user_id: &str) -> Result<Vec<Reservation>, StoreError> {
        self.memory.list_reservations_by_user(user_id).await
    }

    async fn list_overlap(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, StoreError> {
        self.memory.list_overlap(filter).await
    }
}
