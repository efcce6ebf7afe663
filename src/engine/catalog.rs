use tracing::info;
use ulid::Ulid;

use crate::hours::OperatingHours;
use crate::limits::*;
use crate::model::*;

use super::{now_ms, Engine, EngineError};

fn require_admin(caller: &Caller) -> Result<(), EngineError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden)
    }
}

fn clean_name(name: &str, what: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::invalid(format!("{what} name is required")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::invalid(format!("{what} name too long")));
    }
    Ok(name.to_string())
}

impl Engine {
    pub async fn create_restaurant(
        &self,
        caller: &Caller,
        id: Ulid,
        name: &str,
        address: &str,
        open_time: &str,
        close_time: &str,
    ) -> Result<Restaurant, EngineError> {
        require_admin(caller)?;
        let name = clean_name(name, "restaurant")?;
        let address = address.trim();
        if address.len() > MAX_ADDRESS_LEN {
            return Err(EngineError::invalid("address too long"));
        }
        let (open_time, close_time) = (open_time.trim(), close_time.trim());
        if OperatingHours::parse(open_time, close_time).is_none() {
            return Err(EngineError::invalid("open_time and close_time must be HH:MM"));
        }

        let restaurant = Restaurant {
            id,
            name,
            address: address.to_string(),
            open_time: open_time.to_string(),
            close_time: close_time.to_string(),
            created_at: now_ms(),
        };
        self.store.insert_restaurant(restaurant.clone()).await?;
        info!(
            restaurant = %id,
            name = %restaurant.name,
            hours = %format!("{}-{}", restaurant.open_time, restaurant.close_time),
            "restaurant created"
        );
        Ok(restaurant)
    }

    pub async fn get_restaurant(&self, id: Ulid) -> Result<Restaurant, EngineError> {
        self.require_restaurant(id).await
    }

    /// All restaurants by name, then id.
    pub async fn list_restaurants(&self) -> Result<Vec<Restaurant>, EngineError> {
        let mut all = self.store.list_restaurants().await?;
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    pub async fn create_table(
        &self,
        caller: &Caller,
        id: Ulid,
        restaurant_id: Ulid,
        name: &str,
        capacity: i64,
    ) -> Result<Table, EngineError> {
        require_admin(caller)?;
        let name = clean_name(name, "table")?;
        if capacity <= 0 {
            return Err(EngineError::invalid("capacity must be positive"));
        }
        if capacity > i64::from(MAX_TABLE_CAPACITY) {
            return Err(EngineError::invalid("capacity too large"));
        }
        let capacity = capacity as u32;
        self.require_restaurant(restaurant_id).await?;
        if self.store.list_tables(restaurant_id).await?.len() >= MAX_TABLES_PER_RESTAURANT {
            return Err(EngineError::invalid("too many tables in restaurant"));
        }

        let table = Table {
            id,
            restaurant_id,
            name,
            capacity,
            created_at: now_ms(),
        };
        self.store.insert_table(table.clone()).await?;
        info!(table = %id, restaurant = %restaurant_id, capacity, "table created");
        Ok(table)
    }

    /// Tables of a restaurant by ascending capacity, then id.
    pub async fn list_tables(
        &self,
        restaurant_id: Ulid,
        min_capacity: Option<u32>,
    ) -> Result<Vec<Table>, EngineError> {
        self.require_restaurant(restaurant_id).await?;
        let mut tables = self.store.list_tables(restaurant_id).await?;
        if let Some(min) = min_capacity {
            tables.retain(|t| t.capacity >= min);
        }
        tables.sort_by(|a, b| a.capacity.cmp(&b.capacity).then(a.id.cmp(&b.id)));
        Ok(tables)
    }
}
