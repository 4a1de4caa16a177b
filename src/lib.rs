pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod gpu;
pub mod identity;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
pub mod status;
pub mod worker;
