use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::rendezvous::RendezvousTimeouts;
use crate::transport::WebRtcConfig;
use crate::transport::config::DEFAULT_STUN_SERVER;
use crate::transport::relay::websocket_base;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8787";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Optional overrides read from `config.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    signaling_url: Option<String>,
    data_dir: Option<PathBuf>,
    handshake_timeout_ms: Option<u64>,
    peer_wait_timeout_ms: Option<u64>,
    sync_timeout_ms: Option<u64>,
    ice_servers: Option<Vec<String>>,
    localhost_only: Option<bool>,
}

/// Pitchside client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the signaling server
    pub signaling_url: Url,
    /// Directory holding the durable store
    pub data_dir: PathBuf,
    pub handshake_timeout: Duration,
    pub peer_wait_timeout: Duration,
    pub sync_timeout: Duration,
    /// STUN/TURN urls; ignored when `localhost_only` is set
    pub ice_servers: Vec<String>,
    pub localhost_only: bool,
}

impl Config {
    /// Defaults, then the config file, then environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = match env::var_os("PITCHSIDE_CONFIG") {
            Some(path) => Some(PathBuf::from(path)),
            None => project_dirs().map(|dirs| dirs.config_dir().join("config.toml")),
        };
        let file = match path {
            Some(path) if path.exists() => read_file(&path)?,
            _ => FileConfig::default(),
        };
        Self::resolve(file)
    }

    /// Like [`Config::load`] but with an explicit file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::resolve(read_file(path)?)
    }

    fn resolve(file: FileConfig) -> Result<Self, ConfigError> {
        let signaling_url = env_string("PITCHSIDE_SIGNALING_URL")
            .or(file.signaling_url)
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        let signaling_url = parse_signaling_url(&signaling_url)?;

        let data_dir = match env_string("PITCHSIDE_DATA_DIR").map(PathBuf::from).or(file.data_dir) {
            Some(dir) => dir,
            None => project_dirs()
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or_else(|| ConfigError::Invalid("no home directory for data_dir".into()))?,
        };

        let handshake_timeout = millis(
            "PITCHSIDE_HANDSHAKE_TIMEOUT_MS",
            file.handshake_timeout_ms,
            10_000,
        )?;
        let peer_wait_timeout = millis(
            "PITCHSIDE_PEER_WAIT_TIMEOUT_MS",
            file.peer_wait_timeout_ms,
            300_000,
        )?;
        let sync_timeout = millis("PITCHSIDE_SYNC_TIMEOUT_MS", file.sync_timeout_ms, 30_000)?;

        let ice_servers = match env_string("PITCHSIDE_ICE_SERVERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect(),
            None => file
                .ice_servers
                .unwrap_or_else(|| vec![DEFAULT_STUN_SERVER.to_string()]),
        };
        let localhost_only = match env_string("PITCHSIDE_LOCALHOST_ONLY") {
            Some(raw) => parse_bool("PITCHSIDE_LOCALHOST_ONLY", &raw)?,
            None => file.localhost_only.unwrap_or(false),
        };

        Ok(Self {
            signaling_url,
            data_dir,
            handshake_timeout,
            peer_wait_timeout,
            sync_timeout,
            ice_servers,
            localhost_only,
        })
    }

    pub fn with_signaling_url(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.signaling_url = parse_signaling_url(raw)?;
        Ok(self)
    }

    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = dir;
        self
    }

    /// `<signaling_url>/handshake`
    pub fn handshake_url(&self) -> Result<Url, ConfigError> {
        let mut url = websocket_base(&self.signaling_url)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| ConfigError::Invalid("signaling url cannot be a base".into()))?
            .pop_if_empty()
            .push("handshake");
        Ok(url)
    }

    pub fn rendezvous_timeouts(&self) -> RendezvousTimeouts {
        RendezvousTimeouts {
            response: self.handshake_timeout,
            peer_wait: self.peer_wait_timeout,
        }
    }

    pub fn webrtc_config(&self) -> WebRtcConfig {
        let config = if self.localhost_only {
            WebRtcConfig::localhost()
        } else {
            WebRtcConfig::default().with_stun_urls(self.ice_servers.clone())
        };
        config.with_establish_timeout(self.sync_timeout)
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "pitchside")
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_signaling_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|err| ConfigError::Invalid(format!("signaling_url {raw:?}: {err}")))?;
    websocket_base(&url).map_err(|err| ConfigError::Invalid(err.to_string()))?;
    Ok(url)
}

fn millis(key: &str, file: Option<u64>, default: u64) -> Result<Duration, ConfigError> {
    let value = match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid(format!("{key} must be milliseconds, got {raw:?}")))?,
        None => file.unwrap_or(default),
    };
    if value == 0 {
        return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
    }
    Ok(Duration::from_millis(value))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{key} must be a boolean, got {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not interleave.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const KEYS: &[&str] = &[
        "PITCHSIDE_SIGNALING_URL",
        "PITCHSIDE_DATA_DIR",
        "PITCHSIDE_HANDSHAKE_TIMEOUT_MS",
        "PITCHSIDE_PEER_WAIT_TIMEOUT_MS",
        "PITCHSIDE_SYNC_TIMEOUT_MS",
        "PITCHSIDE_ICE_SERVERS",
        "PITCHSIDE_LOCALHOST_ONLY",
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe {
                env::remove_var(key);
            }
        }
    }

    fn config_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_apply_without_file_or_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("PITCHSIDE_DATA_DIR", "/tmp/pitchside-test");
        }
        let config = Config::resolve(FileConfig::default()).unwrap();
        assert_eq!(config.signaling_url.as_str(), "ws://127.0.0.1:8787/");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/pitchside-test"));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.peer_wait_timeout, Duration::from_secs(300));
        assert_eq!(config.sync_timeout, Duration::from_secs(30));
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(
            config.handshake_url().unwrap().as_str(),
            "ws://127.0.0.1:8787/handshake"
        );
        clear_env();
    }

    #[test]
    fn env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let file = config_file(
            r#"
signaling_url = "https://signal.example.com/pitch"
data_dir = "/var/lib/pitchside"
sync_timeout_ms = 5000
ice_servers = ["stun:stun.example.com:3478"]
"#,
        );
        unsafe {
            env::set_var("PITCHSIDE_SYNC_TIMEOUT_MS", "1500");
            env::set_var("PITCHSIDE_LOCALHOST_ONLY", "true");
        }
        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/pitchside"));
        assert_eq!(config.sync_timeout, Duration::from_millis(1500));
        assert!(config.localhost_only);
        assert!(config.webrtc_config().ice_servers.is_empty());
        assert_eq!(
            config.handshake_url().unwrap().as_str(),
            "wss://signal.example.com/pitch/handshake"
        );
        clear_env();
    }

    #[test]
    fn ice_server_list_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("PITCHSIDE_DATA_DIR", "/tmp/pitchside-test");
            env::set_var("PITCHSIDE_ICE_SERVERS", "stun:a.example:3478, stun:b.example:3478,");
        }
        let config = Config::resolve(FileConfig::default()).unwrap();
        assert_eq!(
            config.ice_servers,
            vec!["stun:a.example:3478".to_string(), "stun:b.example:3478".to_string()]
        );
        assert_eq!(config.webrtc_config().ice_servers[0].urls.len(), 2);
        clear_env();
    }

    #[test]
    fn invalid_values_are_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("PITCHSIDE_DATA_DIR", "/tmp/pitchside-test");
            env::set_var("PITCHSIDE_HANDSHAKE_TIMEOUT_MS", "soon");
        }
        assert!(matches!(
            Config::resolve(FileConfig::default()),
            Err(ConfigError::Invalid(_))
        ));
        unsafe {
            env::set_var("PITCHSIDE_HANDSHAKE_TIMEOUT_MS", "0");
        }
        assert!(Config::resolve(FileConfig::default()).is_err());
        clear_env();

        unsafe {
            env::set_var("PITCHSIDE_DATA_DIR", "/tmp/pitchside-test");
            env::set_var("PITCHSIDE_SIGNALING_URL", "ftp://example.com");
        }
        assert!(Config::resolve(FileConfig::default()).is_err());
        clear_env();
    }

    #[test]
    fn unknown_file_keys_fail_to_parse() {
        let file = config_file("signalling_url = \"ws://typo\"\n");
        assert!(matches!(
            Config::load_from(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
