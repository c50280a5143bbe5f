use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use super::config::WebRtcConfig;
use super::relay::{self, RelayClient};
use super::{Establisher, Role, TransportError, webrtc};
use crate::identity::NetworkLocalState;
use crate::replication::ReplicationHandle;
use crate::store::Collection;

const TARGET: &str = "pitchside::transport";

/// Relay-signaled WebRTC transport feeding a collection replication.
pub struct WebRtcEstablisher {
    signaling_url: Url,
    config: WebRtcConfig,
}

impl WebRtcEstablisher {
    pub fn new(signaling_url: Url, config: WebRtcConfig) -> Self {
        Self {
            signaling_url,
            config,
        }
    }

    async fn establish_inner(
        &self,
        keys: &NetworkLocalState,
        collection: Collection,
    ) -> Result<ReplicationHandle, TransportError> {
        let room = relay::room_url(&self.signaling_url, &keys.gid)?;
        let role = Role::for_pair(&keys.uid, &keys.oid)?;
        tracing::info!(target: TARGET, session = %keys.gid, ?role, "establishing peer transport");

        let relay = RelayClient::connect(&room).await?;
        let link = webrtc::connect(&self.config, relay, role).await?;
        ReplicationHandle::start(keys.gid, collection, Arc::new(link), self.config.establish_timeout)
            .await
    }
}

#[async_trait]
impl Establisher for WebRtcEstablisher {
    async fn establish(
        &self,
        keys: &NetworkLocalState,
        collection: Collection,
    ) -> Result<ReplicationHandle, TransportError> {
        match tokio::time::timeout(
            self.config.establish_timeout,
            self.establish_inner(keys, collection),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(target: TARGET, session = %keys.gid, "peer transport timed out");
                Err(TransportError::Timeout("establishing peer transport"))
            }
        }
    }
}
