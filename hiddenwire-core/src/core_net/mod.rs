//! Peer-level networking: identifier routing, delivery retries and idle expiry
//! on top of the channel layer.

pub mod connection_manager;
pub mod dispatch_queue;
pub mod errors;
pub mod metrics;
pub mod ttl_manager;

pub use connection_manager::{ConnectionManager, Delivery, ManagerEvent};
pub use dispatch_queue::{Dispatch, DispatchQueue, DispatchTarget, PendingSend};
pub use errors::ConnectionError;
pub use ttl_manager::TtlManager;
