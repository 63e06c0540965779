//! Backend connection pooling.

mod pool;

pub use pool::{ConnectionPool, PoolError, PooledConn};
