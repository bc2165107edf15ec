pub mod config;
pub mod error;
pub mod events;
pub mod hardware;
pub mod health;
pub mod ingest;
pub mod logging;
pub mod messages;
pub mod metrics;
pub mod parser;
pub mod prometheus_metrics;
pub mod receipt;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod signing;
pub mod store;
pub mod sync;
pub mod transport;
pub mod verifier;
