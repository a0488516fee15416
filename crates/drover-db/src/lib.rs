//! Postgres persistence layer for drover: row models, connection pool,
//! migrations, and query functions.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
