pub mod events;
pub mod metrics;
pub mod stream;
pub mod workflows;
