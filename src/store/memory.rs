use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::{by_start_then_id, Store, StoreError};

/// Every reservation ever made on one table, sorted by `(span.start, id)`.
#[derive(Debug, Clone)]
pub struct TableLedger {
    pub table_id: Ulid,
    pub restaurant_id: Ulid,
    pub reservations: Vec<Reservation>,
}

pub type SharedLedger = Arc<RwLock<TableLedger>>;

impl TableLedger {
    pub fn new(table_id: Ulid, restaurant_id: Ulid) -> Self {
        Self {
            table_id,
            restaurant_id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `(span.start, id)`.
    pub fn insert(&mut self, reservation: Reservation) {
        let key = (reservation.span.start, reservation.id);
        let pos = self
            .reservations
            .partition_point(|r| (r.span.start, r.id) < key);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations matching `filter`. Everything from the first reservation
    /// starting at or after `window_end` onwards can't overlap, so it is skipped.
    pub fn overlapping<'a>(&'a self, filter: &'a ReservationFilter) -> impl Iterator<Item = &'a Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < filter.window_end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| filter.matches(r))
    }
}

/// In-process store. Also the materialized state behind `WalStore`.
pub struct MemoryStore {
    restaurants: DashMap<Ulid, Restaurant>,
    tables: DashMap<Ulid, Table>,
    tables_by_restaurant: DashMap<Ulid, Vec<Ulid>>,
    /// Table id → that table's reservations.
    ledgers: DashMap<Ulid, SharedLedger>,
    /// Reverse lookup: reservation id → table id.
    reservation_to_table: DashMap<Ulid, Ulid>,
    by_user: DashMap<String, Vec<Ulid>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            restaurants: DashMap::new(),
            tables: DashMap::new(),
            tables_by_restaurant: DashMap::new(),
            ledgers: DashMap::new(),
            reservation_to_table: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    fn ledger(&self, table_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(table_id).map(|e| e.value().clone())
    }

    fn ledger_or_create(&self, table_id: Ulid, restaurant_id: Ulid) -> SharedLedger {
        self.ledgers
            .entry(table_id)
            .or_insert_with(|| Arc::new(RwLock::new(TableLedger::new(table_id, restaurant_id))))
            .value()
            .clone()
    }

    /// Would `event` apply cleanly to the current state?
    pub fn check(&self, event: &Event) -> Result<(), StoreError> {
        match event {
            Event::RestaurantCreated(r) if self.restaurants.contains_key(&r.id) => {
                Err(StoreError::AlreadyExists(r.id))
            }
            Event::TableCreated(t) if self.tables.contains_key(&t.id) => {
                Err(StoreError::AlreadyExists(t.id))
            }
            Event::ReservationCreated(r) if self.reservation_to_table.contains_key(&r.id) => {
                Err(StoreError::AlreadyExists(r.id))
            }
            Event::ReservationCancelled { id } if !self.reservation_to_table.contains_key(id) => {
                Err(StoreError::NotFound(*id))
            }
            _ => Ok(()),
        }
    }

    /// Apply an event. Duplicate creations are refused, so replaying a log
    /// that recorded a lost race ends in the same state as the live process.
    pub async fn apply(&self, event: &Event) -> Result<(), StoreError> {
        match event {
            Event::RestaurantCreated(r) => {
                match self.restaurants.entry(r.id) {
                    dashmap::Entry::Occupied(_) => return Err(StoreError::AlreadyExists(r.id)),
                    dashmap::Entry::Vacant(slot) => {
                        slot.insert(r.clone());
                    }
                }
            }
            Event::TableCreated(t) => {
                match self.tables.entry(t.id) {
                    dashmap::Entry::Occupied(_) => return Err(StoreError::AlreadyExists(t.id)),
                    dashmap::Entry::Vacant(slot) => {
                        slot.insert(t.clone());
                    }
                }
                self.tables_by_restaurant
                    .entry(t.restaurant_id)
                    .or_default()
                    .push(t.id);
                self.ledger_or_create(t.id, t.restaurant_id);
            }
            Event::ReservationCreated(r) => {
                match self.reservation_to_table.entry(r.id) {
                    dashmap::Entry::Occupied(_) => return Err(StoreError::AlreadyExists(r.id)),
                    dashmap::Entry::Vacant(slot) => {
                        slot.insert(r.table_id);
                    }
                }
                self.by_user.entry(r.user_id.clone()).or_default().push(r.id);
                let ledger = self.ledger_or_create(r.table_id, r.restaurant_id);
                ledger.write().await.insert(r.clone());
            }
            Event::ReservationCancelled { id } => {
                let table_id = self
                    .reservation_to_table
                    .get(id)
                    .map(|e| *e.value())
                    .ok_or(StoreError::NotFound(*id))?;
                let ledger = self.ledger(&table_id).ok_or(StoreError::NotFound(*id))?;
                let mut guard = ledger.write().await;
                let reservation = guard.get_mut(*id).ok_or(StoreError::NotFound(*id))?;
                reservation.status = ReservationStatus::Cancelled;
            }
        }
        Ok(())
    }

    /// Events that recreate the current state from nothing.
    pub async fn snapshot(&self) -> Vec<Event> {
        let mut restaurants: Vec<Restaurant> = self.restaurants.iter().map(|e| e.value().clone()).collect();
        restaurants.sort_by_key(|r| r.id);
        let mut tables: Vec<Table> = self.tables.iter().map(|e| e.value().clone()).collect();
        tables.sort_by_key(|t| t.id);

        let mut events: Vec<Event> = restaurants.into_iter().map(Event::RestaurantCreated).collect();
        events.extend(tables.into_iter().map(Event::TableCreated));

        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        for ledger in ledgers {
            let guard = ledger.read().await;
            events.extend(guard.reservations.iter().cloned().map(Event::ReservationCreated));
        }
        events
    }

    pub fn restaurant_count(&self) -> usize {
        self.restaurants.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservation_to_table.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_restaurant(&self, restaurant: Restaurant) -> Result<(), StoreError> {
        self.apply(&Event::RestaurantCreated(restaurant)).await
    }

    async fn get_restaurant(&self, id: Ulid) -> Result<Option<Restaurant>, StoreError> {
        Ok(self.restaurants.get(&id).map(|e| e.value().clone()))
    }

    async fn list_restaurants(&self) -> Result<Vec<Restaurant>, StoreError> {
        Ok(self.restaurants.iter().map(|e| e.value().clone()).collect())
    }

    async fn insert_table(&self, table: Table) -> Result<(), StoreError> {
        self.apply(&Event::TableCreated(table)).await
    }

    async fn get_table(&self, id: Ulid) -> Result<Option<Table>, StoreError> {
        Ok(self.tables.get(&id).map(|e| e.value().clone()))
    }

    async fn list_tables(&self, restaurant_id: Ulid) -> Result<Vec<Table>, StoreError> {
        let ids = self
            .tables_by_restaurant
            .get(&restaurant_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.tables.get(id).map(|e| e.value().clone()))
            .collect())
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        self.apply(&Event::ReservationCreated(reservation)).await
    }

    async fn get_reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        let Some(table_id) = self.reservation_to_table.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(ledger) = self.ledger(&table_id) else {
            return Ok(None);
        };
        let guard = ledger.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, StoreError> {
        self.apply(&Event::ReservationCancelled { id }).await?;
        self.get_reservation(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn list_reservations_by_user(&self, user_id: &str) -> Result<Vec<Reservation>, StoreError> {
        let ids = self
            .by_user
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.get_reservation(id).await? {
                out.push(r);
            }
        }
        out.sort_by(by_start_then_id);
        Ok(out)
    }

    async fn list_overlap(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, StoreError> {
        // Narrow to the fewest ledgers the scope allows before taking any locks.
        let ledgers: Vec<SharedLedger> = if let Some(table_id) = filter.table_id {
            self.ledger(&table_id).into_iter().collect()
        } else if let Some(restaurant_id) = filter.restaurant_id {
            let ids = self
                .tables_by_restaurant
                .get(&restaurant_id)
                .map(|e| e.value().clone())
                .unwrap_or_default();
            ids.iter().filter_map(|id| self.ledger(id)).collect()
        } else {
            self.ledgers.iter().map(|e| e.value().clone()).collect()
        };

        let mut out = Vec::new();
        for ledger in ledgers {
            let guard = ledger.read().await;
            out.extend(guard.overlapping(filter).cloned());
        }
        out.sort_by(by_start_then_id);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn table(restaurant_id: Ulid, capacity: u32) -> Table {
        Table {
            id: Ulid::new(),
            restaurant_id,
            name: format!("T{capacity}"),
            capacity,
            created_at: 0,
        }
    }

    fn reservation(t: &Table, user: &str, start: Ms, end: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            restaurant_id: t.restaurant_id,
            table_id: t.id,
            user_id: user.into(),
            span: Span::new(start, end),
            guests: 2,
            status: ReservationStatus::Confirmed,
            created_at: 0,
        }
    }

    #[test]
    fn ledger_keeps_start_order() {
        let t = table(Ulid::new(), 4);
        let mut ledger = TableLedger::new(t.id, t.restaurant_id);
        ledger.insert(reservation(&t, "a", 3 * H, 4 * H));
        ledger.insert(reservation(&t, "a", H, 2 * H));
        ledger.insert(reservation(&t, "a", 2 * H, 3 * H));
        let starts: Vec<Ms> = ledger.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![H, 2 * H, 3 * H]);
    }

    #[test]
    fn ledger_overlapping_skips_past_and_future() {
        let t = table(Ulid::new(), 4);
        let mut ledger = TableLedger::new(t.id, t.restaurant_id);
        ledger.insert(reservation(&t, "a", 100, 200));
        let hit = reservation(&t, "a", 450, 600);
        ledger.insert(hit.clone());
        ledger.insert(reservation(&t, "a", 1000, 1100));

        let filter = ReservationFilter::window(500, 800);
        let hits: Vec<_> = ledger.overlapping(&filter).collect();
        assert_eq!(hits, vec![&hit]);
    }

    #[tokio::test]
    async fn overlap_mirrors_reference_semantics() {
        // window 1.5h-2.5h overlaps the first reservation only; 2h-3h overlaps nothing
        let store = MemoryStore::new();
        let rid = Ulid::new();
        let t = table(rid, 4);
        store.insert_table(t.clone()).await.unwrap();
        let r1 = reservation(&t, "u1", H, 2 * H);
        let r2 = reservation(&t, "u2", 3 * H, 4 * H);
        store.insert_reservation(r1.clone()).await.unwrap();
        store.insert_reservation(r2).await.unwrap();

        let filter = ReservationFilter {
            restaurant_id: Some(rid),
            table_id: Some(t.id),
            ..ReservationFilter::window(90 * 60_000, 150 * 60_000)
        };
        let hits = store.list_overlap(&filter).await.unwrap();
        assert_eq!(hits, vec![r1]);

        let filter = ReservationFilter {
            table_id: Some(t.id),
            ..ReservationFilter::window(2 * H, 3 * H)
        };
        assert!(store.list_overlap(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlap_scopes_and_orders() {
        let store = MemoryStore::new();
        let rid = Ulid::new();
        let a = table(rid, 2);
        let b = table(rid, 4);
        let elsewhere = table(Ulid::new(), 4);
        for t in [&a, &b, &elsewhere] {
            store.insert_table(t.clone()).await.unwrap();
        }
        let late = reservation(&a, "u1", 2 * H, 3 * H);
        let early = reservation(&b, "u2", H, 3 * H);
        let other = reservation(&elsewhere, "u1", H, 2 * H);
        for r in [&late, &early, &other] {
            store.insert_reservation(r.clone()).await.unwrap();
        }

        let in_restaurant = ReservationFilter {
            restaurant_id: Some(rid),
            ..ReservationFilter::window(0, 10 * H)
        };
        let hits = store.list_overlap(&in_restaurant).await.unwrap();
        assert_eq!(hits, vec![early.clone(), late.clone()]);

        let by_user = ReservationFilter {
            user_id: Some("u1".into()),
            ..ReservationFilter::window(0, 10 * H)
        };
        let hits = store.list_overlap(&by_user).await.unwrap();
        assert_eq!(hits, vec![other, late]);
    }

    #[tokio::test]
    async fn cancelled_reservations_stop_overlapping() {
        let store = MemoryStore::new();
        let t = table(Ulid::new(), 4);
        store.insert_table(t.clone()).await.unwrap();
        let r = reservation(&t, "u1", H, 2 * H);
        store.insert_reservation(r.clone()).await.unwrap();

        let cancelled = store.cancel_reservation(r.id).await.unwrap();
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);

        let filter = ReservationFilter {
            table_id: Some(t.id),
            ..ReservationFilter::window(0, 10 * H)
        };
        assert!(store.list_overlap(&filter).await.unwrap().is_empty());

        // Still listed for its owner, and still retrievable.
        let mine = store.list_reservations_by_user("u1").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert!(store.get_reservation(r.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancel_twice_is_not_an_error() {
        let store = MemoryStore::new();
        let t = table(Ulid::new(), 4);
        let r = reservation(&t, "u1", H, 2 * H);
        store.insert_reservation(r.clone()).await.unwrap();
        store.cancel_reservation(r.id).await.unwrap();
        let again = store.cancel_reservation(r.id).await.unwrap();
        assert_eq!(again.status, ReservationStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_unknown_is_not_found() {
        let store = MemoryStore::new();
        let id = Ulid::new();
        assert!(matches!(
            store.cancel_reservation(id).await,
            Err(StoreError::NotFound(got)) if got == id
        ));
    }

    #[tokio::test]
    async fn duplicate_ids_are_refused() {
        let store = MemoryStore::new();
        let t = table(Ulid::new(), 4);
        store.insert_table(t.clone()).await.unwrap();
        assert!(matches!(
            store.insert_table(t.clone()).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(store.list_tables(t.restaurant_id).await.unwrap().len(), 1);

        let r = reservation(&t, "u1", H, 2 * H);
        store.insert_reservation(r.clone()).await.unwrap();
        assert!(store.check(&Event::ReservationCreated(r.clone())).is_err());
        assert!(matches!(
            store.insert_reservation(r).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(store.reservation_count(), 1);
    }

    #[tokio::test]
    async fn list_by_user_sorted_by_start() {
        let store = MemoryStore::new();
        let t = table(Ulid::new(), 4);
        let later = reservation(&t, "u1", 5 * H, 6 * H);
        let sooner = reservation(&t, "u1", H, 2 * H);
        store.insert_reservation(later.clone()).await.unwrap();
        store.insert_reservation(sooner.clone()).await.unwrap();
        store.insert_reservation(reservation(&t, "u2", 3 * H, 4 * H)).await.unwrap();

        let mine = store.list_reservations_by_user("u1").await.unwrap();
        assert_eq!(mine, vec![sooner, later]);
    }

    #[tokio::test]
    async fn snapshot_rebuilds_state() {
        let store = MemoryStore::new();
        let restaurant = Restaurant {
            id: Ulid::new(),
            name: "Bistro".into(),
            address: "1 Main St".into(),
            open_time: "10:00".into(),
            close_time: "22:00".into(),
            created_at: 0,
        };
        store.insert_restaurant(restaurant.clone()).await.unwrap();
        let t = table(restaurant.id, 4);
        store.insert_table(t.clone()).await.unwrap();
        let r = reservation(&t, "u1", H, 2 * H);
        store.insert_reservation(r.clone()).await.unwrap();
        store.cancel_reservation(r.id).await.unwrap();

        let rebuilt = MemoryStore::new();
        for event in store.snapshot().await {
            rebuilt.apply(&event).await.unwrap();
        }
        assert_eq!(rebuilt.get_restaurant(restaurant.id).await.unwrap(), Some(restaurant));
        assert_eq!(rebuilt.list_tables(t.restaurant_id).await.unwrap(), vec![t]);
        let got = rebuilt.get_reservation(r.id).await.unwrap().unwrap();
        assert_eq!(got.status, ReservationStatus::Cancelled);
    }
}
