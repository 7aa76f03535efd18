//! Failover-aware management of the single active streaming connection.

mod endpoint_pool;
mod health;

pub use endpoint_pool::{EndpointPool, ReconnectCallback, ReconnectFuture};
pub use health::{EndpointHealth, EndpointStatus};
