mod database;
mod postgres;

pub use database::{DatabasePool, PoolConfig};
pub use postgres::PostgresStore;
