mod pool;
pub(crate) mod schema;

pub use pool::{DatabasePool, PoolConfig};
