pub mod auth;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod hours;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod store;
pub mod wire;
