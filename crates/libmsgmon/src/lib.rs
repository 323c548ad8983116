pub mod buffer;
pub mod config;
pub mod error;
pub mod filter;
pub mod log;
pub mod publisher;
pub mod router;

#[cfg(test)]
mod testutil;

pub use buffer::BoundedBuffer;
pub use config::MonitorConfig;
pub use error::MonitorError;
pub use filter::{FilterListener, FilterNotice, FilterScope, MessageFilter};
pub use log::{LogHandle, LogSnapshot, SessionLog};
pub use publisher::{BroadcastPublisher, ObservedPublisher, UpdatePublisher};
pub use router::{Router, RouterBuilder};
