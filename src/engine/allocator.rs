use ulid::Ulid;

use crate::model::*;

use super::{validate_guests, validate_window, Engine, EngineError};

impl Engine {
    /// An explicitly requested table must exist and belong to the restaurant.
    pub async fn validate_table(&self, restaurant_id: Ulid, table_id: Ulid) -> Result<Table, EngineError> {
        let table = self
            .store
            .get_table(table_id)
            .await?
            .ok_or(EngineError::NotFound(table_id))?;
        if table.restaurant_id != restaurant_id {
            return Err(EngineError::invalid(format!(
                "table {table_id} does not belong to restaurant {restaurant_id}"
            )));
        }
        Ok(table)
    }

    /// Does `table` have no active reservation overlapping `span`?
    pub(super) async fn is_table_free(&self, table: &Table, span: Span) -> Result<bool, EngineError> {
        let filter = ReservationFilter::for_table(table.restaurant_id, table.id, span);
        Ok(self.store.list_overlap(&filter).await?.is_empty())
    }

    /// Every free table that seats `guests`, best fit first: ascending
    /// `capacity - guests`, ties by table id.
    pub(super) async fn ranked_free_tables(
        &self,
        restaurant_id: Ulid,
        span: Span,
        guests: u32,
    ) -> Result<Vec<Table>, EngineError> {
        let mut candidates = self.store.list_tables(restaurant_id).await?;
        candidates.retain(|t| t.capacity >= guests);
        candidates.sort_by(|a, b| {
            (a.capacity - guests)
                .cmp(&(b.capacity - guests))
                .then(a.id.cmp(&b.id))
        });

        let mut free = Vec::with_capacity(candidates.len());
        for table in candidates {
            if self.is_table_free(&table, span).await? {
                free.push(table);
            }
        }
        Ok(free)
    }

    /// The best-fitting free table, or `None`.
    pub async fn find_best_table(
        &self,
        restaurant_id: Ulid,
        span: Span,
        guests: u32,
    ) -> Result<Option<Table>, EngineError> {
        Ok(self
            .ranked_free_tables(restaurant_id, span, guests)
            .await?
            .into_iter()
            .next())
    }

    pub async fn list_available_tables(
        &self,
        restaurant_id: Ulid,
        start: Ms,
        end: Ms,
        guests: i64,
    ) -> Result<Vec<AvailableTable>, EngineError> {
        self.require_restaurant(restaurant_id).await?;
        let span = validate_window(start, end)?;
        let guests = validate_guests(guests)?;
        Ok(self
            .ranked_free_tables(restaurant_id, span, guests)
            .await?
            .into_iter()
            .map(|t| AvailableTable {
                table_id: t.id,
                capacity: t.capacity,
            })
            .collect())
    }
}
