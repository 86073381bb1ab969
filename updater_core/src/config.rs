use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "lanup";
const APP_NAME: &str = "updater";
const CONFIG_FILE: &str = "config.json";

/// Well-known TCP port the device listens on for folder transfers
pub const TRANSFER_PORT: u16 = 12345;
/// Well-known UDP port the device answers discovery broadcasts on
pub const DISCOVERY_PORT: u16 = 54321;
/// ASCII token broadcast by the updater looking for a device
pub const DISCOVERY_REQUEST: &[u8] = b"DISCOVER_SERVER";
/// ASCII token a device replies with; must match byte for byte
pub const DISCOVERY_RESPONSE: &[u8] = b"SERVER_HERE";

/// Protocol constants shared by both ends of the discovery and transfer
/// protocol. Passed explicitly to every component instead of living as
/// module-level globals, so tests and embedders can rebind ports.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub tcp_port: u16,
    pub udp_port: u16,
    pub broadcast_addr: IpAddr,
    pub discovery_request: &'static [u8],
    pub discovery_response: &'static [u8],
    /// Bound on the single discovery receive attempt
    pub discovery_timeout: Duration,
    /// Pause after connecting, before the first frame byte
    pub connect_grace: Duration,
    /// Pause between file frames so the peer can drain its buffer
    pub inter_file_delay: Duration,
    /// Deadline applied to connect and each frame write. `None` preserves
    /// the historical behavior of blocking indefinitely on a hung peer.
    pub io_timeout: Option<Duration>,
    /// When set, the first per-file read/send error fails the whole
    /// session instead of skipping the file.
    pub abort_on_file_error: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            tcp_port: TRANSFER_PORT,
            udp_port: DISCOVERY_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_request: DISCOVERY_REQUEST,
            discovery_response: DISCOVERY_RESPONSE,
            discovery_timeout: Duration::from_secs(3),
            connect_grace: Duration::from_secs(1),
            inter_file_delay: Duration::from_millis(50),
            io_timeout: None,
            abort_on_file_error: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Repository ("owner/name") release archives are pulled from
    pub release_repo: Option<String>,
    /// Override for the update staging directory
    pub update_path: Option<PathBuf>,
}

impl AppConfig {
    /// Get the config file path
    fn get_config_path() -> Option<PathBuf> {
        if let Ok(test_path) = std::env::var("UPDATER_TEST_CONFIG_DIR") {
            return Some(PathBuf::from(test_path).join(CONFIG_FILE));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        let path = match Self::get_config_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) {
        let path = match Self::get_config_path() {
            Some(p) => p,
            None => return,
        };

        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        if let Ok(json) = serde_json::to_string_pretty(self) {
            let _ = fs::write(path, json);
        }
    }
}

/// Resolve the update staging directory: the config override if set,
/// otherwise a fixed location under the platform data dir.
pub fn get_update_dir() -> PathBuf {
    if let Some(path) = AppConfig::load().update_path {
        return path;
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.data_local_dir().join("update"))
        .unwrap_or_else(|| PathBuf::from("update"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_protocol_ports() {
        let cfg = ProtocolConfig::default();
        assert_eq!(cfg.tcp_port, TRANSFER_PORT);
        assert_eq!(cfg.udp_port, DISCOVERY_PORT);
        assert_eq!(cfg.discovery_request, b"DISCOVER_SERVER");
        assert_eq!(cfg.discovery_response, b"SERVER_HERE");
        assert!(cfg.io_timeout.is_none());
        assert!(!cfg.abort_on_file_error);
    }

    #[test]
    fn test_app_config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        // SAFETY: single-threaded test process section; the var is only read
        // by get_config_path
        unsafe {
            std::env::set_var("UPDATER_TEST_CONFIG_DIR", dir.path());
        }

        let config = AppConfig {
            release_repo: Some("acme/fielddeploy".to_string()),
            update_path: Some(PathBuf::from("/opt/updates")),
        };
        config.save();

        let loaded = AppConfig::load();
        assert_eq!(loaded.release_repo.as_deref(), Some("acme/fielddeploy"));
        assert_eq!(loaded.update_path, Some(PathBuf::from("/opt/updates")));

        unsafe {
            std::env::remove_var("UPDATER_TEST_CONFIG_DIR");
        }
    }
}
