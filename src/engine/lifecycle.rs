use tracing::{debug, info};
use ulid::Ulid;

use crate::hours::is_within_operating_hours;
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{now_ms, validate_guests, validate_window, Engine, EngineError};

/// A booking request as it arrives from the transport.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub id: Ulid,
    pub restaurant_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub guests: i64,
    /// `None` lets the allocator pick.
    pub table_id: Option<Ulid>,
}

impl Engine {
    pub async fn create_reservation(
        &self,
        caller: &Caller,
        req: NewReservation,
    ) -> Result<Reservation, EngineError> {
        match self.admit(caller, &req).await {
            Ok(reservation) => {
                metrics::counter!(observability::RESERVATIONS_CREATED_TOTAL).increment(1);
                info!(
                    reservation = %reservation.id,
                    restaurant = %reservation.restaurant_id,
                    table = %reservation.table_id,
                    user = %reservation.user_id,
                    guests = reservation.guests,
                    "reservation confirmed"
                );
                Ok(reservation)
            }
            Err(e) => {
                metrics::counter!(observability::RESERVATIONS_REJECTED_TOTAL, "reason" => e.reason())
                    .increment(1);
                debug!(restaurant = %req.restaurant_id, user = %caller.user_id, "reservation rejected: {e}");
                Err(e)
            }
        }
    }

    async fn admit(&self, caller: &Caller, req: &NewReservation) -> Result<Reservation, EngineError> {
        if caller.user_id.is_empty() || caller.user_id.len() > MAX_USER_ID_LEN {
            return Err(EngineError::invalid("caller identity missing or too long"));
        }
        let restaurant = self.require_restaurant(req.restaurant_id).await?;
        let span = validate_window(req.start, req.end)?;
        let guests = validate_guests(req.guests)?;

        if !is_within_operating_hours(&restaurant, span, &self.zone) {
            return Err(EngineError::OutOfHours);
        }

        let draft = |table_id: Ulid| Reservation {
            id: req.id,
            restaurant_id: restaurant.id,
            table_id,
            user_id: caller.user_id.clone(),
            span,
            guests,
            status: ReservationStatus::Confirmed,
            created_at: now_ms(),
        };

        if let Some(table_id) = req.table_id {
            let table = self.validate_table(restaurant.id, table_id).await?;
            if table.capacity < guests {
                return Err(EngineError::Unavailable(format!(
                    "table {table_id} seats {}, party of {guests}",
                    table.capacity
                )));
            }
            let _guard = self.lock_table(table.id).await;
            if !self.is_table_free(&table, span).await? {
                return Err(EngineError::Unavailable(format!(
                    "table {table_id} is already booked for that time"
                )));
            }
            let reservation = draft(table.id);
            self.store.insert_reservation(reservation.clone()).await?;
            return Ok(reservation);
        }

        // Candidates were free when ranked; whichever still is under its lock wins.
        let candidates = self.ranked_free_tables(restaurant.id, span, guests).await?;
        for table in candidates {
            let _guard = self.lock_table(table.id).await;
            if !self.is_table_free(&table, span).await? {
                debug!(table = %table.id, "candidate taken before commit, trying next");
                continue;
            }
            let reservation = draft(table.id);
            self.store.insert_reservation(reservation.clone()).await?;
            return Ok(reservation);
        }
        Err(EngineError::Unavailable(
            "no table available for the requested time and party size".into(),
        ))
    }

    /// Owner or admin only. Cancelling an already-cancelled reservation succeeds
    /// and returns it unchanged.
    pub async fn cancel_reservation(&self, caller: &Caller, id: Ulid) -> Result<Reservation, EngineError> {
        let existing = self
            .store
            .get_reservation(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if existing.user_id != caller.user_id && !caller.is_admin() {
            debug!(reservation = %id, user = %caller.user_id, "cancel refused: not owner");
            return Err(EngineError::Forbidden);
        }
        if !existing.is_active() {
            debug!(reservation = %id, "already cancelled");
            return Ok(existing);
        }

        let cancelled = self.store.cancel_reservation(id).await?;
        metrics::counter!(observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        info!(reservation = %id, table = %cancelled.table_id, by = %caller.user_id, "reservation cancelled");
        Ok(cancelled)
    }

    /// The caller's reservations of any status, soonest first.
    pub async fn list_my_reservations(&self, caller: &Caller) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.store.list_reservations_by_user(&caller.user_id).await?)
    }

    pub async fn get_reservation(&self, caller: &Caller, id: Ulid) -> Result<Reservation, EngineError> {
        let reservation = self
            .store
            .get_reservation(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if reservation.user_id != caller.user_id && !caller.is_admin() {
            return Err(EngineError::Forbidden);
        }
        Ok(reservation)
    }

    /// Active reservations intersecting the filter's window. Non-admins only
    /// ever see their own.
    pub async fn find_overlapping(
        &self,
        caller: &Caller,
        mut filter: ReservationFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        if filter.window_end.saturating_sub(filter.window_start) > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::invalid("query window too wide"));
        }
        if !caller.is_admin() {
            filter.user_id = Some(caller.user_id.clone());
        }
        Ok(self.store.list_overlap(&filter).await?)
    }
}
