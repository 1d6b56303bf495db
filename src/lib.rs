pub mod broker;
pub mod config;
pub mod daemon;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod transport;
