pub mod config;
pub mod db;
pub mod error;
pub mod lease;
pub mod lock;
pub mod metrics;
pub mod node;
pub mod periodic;
pub mod ranking;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;
