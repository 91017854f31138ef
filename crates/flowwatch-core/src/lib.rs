pub mod config;
pub mod error;
pub mod events;
pub mod io;
pub mod metrics;
pub mod monitor;
pub mod paths;
pub mod registry;
pub mod sink;
pub mod store;
pub mod types;
pub mod workflow;

pub use error::{MonitorError, Result};
pub use events::{ChangeKind, EventPayload, MonitorEvent, Notification, StateChange};
pub use monitor::{Monitor, MonitorHealth};
