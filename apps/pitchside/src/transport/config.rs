use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const MATCH_CHANNEL_LABEL: &str = "pitchside-match";

/// Configuration for the peer connection carrying match state.
#[derive(Clone, Debug)]
pub struct WebRtcConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
    /// Data channel label
    pub data_channel_label: String,
    /// Whether the data channel should be ordered
    pub ordered: bool,
    /// Upper bound on the whole establish step, initial sync included
    pub establish_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_SERVER.to_string()],
                ..Default::default()
            }],
            data_channel_label: MATCH_CHANNEL_LABEL.to_string(),
            ordered: true,
            establish_timeout: Duration::from_secs(30),
        }
    }
}

impl WebRtcConfig {
    /// Host candidates only; for two peers on one machine or LAN.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    pub fn with_stun_urls(mut self, urls: Vec<String>) -> Self {
        self.ice_servers = if urls.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls,
                ..Default::default()
            }]
        };
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            username,
            credential,
            ..Default::default()
        });
        self
    }

    pub fn with_establish_timeout(mut self, timeout: Duration) -> Self {
        self.establish_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_public_stun() {
        let config = WebRtcConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert!(config.ordered);
    }

    #[test]
    fn empty_stun_list_means_host_candidates_only() {
        let config = WebRtcConfig::default().with_stun_urls(vec![]);
        assert!(config.ice_servers.is_empty());
        assert!(WebRtcConfig::localhost().ice_servers.is_empty());
    }

    #[test]
    fn turn_credentials_are_appended() {
        let config = WebRtcConfig::localhost().add_ice_server_with_credentials(
            vec!["turn:turn.example.com:3478".into()],
            "user".into(),
            "secret".into(),
        );
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username, "user");
    }
}
