pub mod config;
pub mod identity;
pub mod match_state;
pub mod rendezvous;
pub mod replication;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transport;
