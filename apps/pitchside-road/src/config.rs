use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("pending pairing ttl must be at least one second")]
    ZeroTtl,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "pitchside-road")]
#[command(about = "Signaling server for Pitchside network matches")]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "PITCHSIDE_ROAD_BIND", default_value = "0.0.0.0:8787")]
    pub bind: SocketAddr,

    /// Seconds an unclaimed pairing code stays valid
    #[arg(long, env = "PITCHSIDE_ROAD_PENDING_TTL", default_value_t = 600)]
    pub pending_ttl_secs: u64,
}

impl ServerConfig {
    pub fn pending_ttl(&self) -> Result<Duration, ConfigError> {
        if self.pending_ttl_secs == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        Ok(Duration::from_secs(self.pending_ttl_secs))
    }
}
