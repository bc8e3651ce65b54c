use sfs_cluster::{ServerConfig, SessionConfig};
use sfs_core::{LeasePolicy, Result, ShareError};
use sfs_lease::LeaseConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server ordinal this node announces when it takes the server role.
    pub node_id: u32,
    pub listen_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    #[serde(default)]
    pub filesystem: FilesystemSettings,
    #[serde(default)]
    pub lease: LeasePolicy,
    #[serde(default)]
    pub session: SessionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemSettings {
    pub name: String,
    pub fsid: u32,
    /// Allow concurrent direct I/O writers on one file.
    pub multihost_write: bool,
    /// Blocks reported free by `statfs`.
    pub capacity_blocks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Longest a take over waits for known clients to resync before
    /// resuming normal service without them.
    pub resync_timeout_ms: u64,
    pub queue_depth: usize,
    pub read_chunk: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: "0.0.0.0:7300"
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 7300))),
            metrics_addr: "0.0.0.0:9090"
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9090))),
            filesystem: FilesystemSettings::default(),
            lease: LeasePolicy::default(),
            session: SessionSettings::default(),
        }
    }
}

impl Default for FilesystemSettings {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            name: server.fs_name,
            fsid: server.fsid,
            multihost_write: false,
            capacity_blocks: server.capacity_blocks,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            resync_timeout_ms: 60_000,
            queue_depth: session.queue_depth,
            read_chunk: session.read_chunk,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| ShareError::Config(format!("TOML parse error: {}", e))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| ShareError::Config(format!("JSON parse error: {}", e))),
            _ => Err(ShareError::Config(format!(
                "Unknown config file extension: {}",
                ext
            ))),
        }
    }

    pub fn from_args(args: &super::Args) -> Self {
        let defaults = FilesystemSettings::default();
        Self {
            node_id: args.node_id,
            listen_addr: args.listen,
            metrics_addr: args.metrics,
            filesystem: FilesystemSettings {
                name: args.fs_name.clone(),
                fsid: args.fsid,
                multihost_write: args.multihost_write,
                ..defaults
            },
            ..Default::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            fs_name: self.filesystem.name.clone(),
            fsid: self.filesystem.fsid,
            server_ord: self.node_id,
            lease: LeaseConfig::default()
                .with_policy(self.lease)
                .with_multihost_write(self.filesystem.multihost_write),
            capacity_blocks: self.filesystem.capacity_blocks,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_queue_depth(self.session.queue_depth)
            .with_read_chunk(self.session.read_chunk)
    }

    #[inline]
    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.session.resync_timeout_ms)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(ShareError::Config("node_id must be non-zero".into()));
        }
        if self.filesystem.name.is_empty() {
            return Err(ShareError::Config("filesystem.name is empty".into()));
        }
        if self.lease.min_secs > self.lease.max_secs {
            return Err(ShareError::Config(format!(
                "lease.min_secs ({}) exceeds lease.max_secs ({})",
                self.lease.min_secs, self.lease.max_secs
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.listen_addr.port(), 7300);
        assert_eq!(config.metrics_addr.port(), 9090);
        assert_eq!(config.filesystem.name, "sfs0");
        assert!(!config.filesystem.multihost_write);
        assert_eq!(config.lease, LeasePolicy::default());
        assert_eq!(config.resync_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("sfsd.toml");

        let toml_content = r#"
node_id = 2
listen_addr = "127.0.0.1:7301"
metrics_addr = "127.0.0.1:9091"

[filesystem]
name = "shared1"
fsid = 9
multihost_write = true

[lease]
mul = 3
min_secs = 30
max_secs = 900
lease_timeout_secs = 5

[session]
resync_timeout_ms = 1500
"#;

        std::fs::write(&config_path, toml_content).unwrap();

        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.listen_addr.port(), 7301);
        assert_eq!(config.filesystem.name, "shared1");
        assert_eq!(config.filesystem.fsid, 9);
        assert!(config.filesystem.multihost_write);
        assert_eq!(config.lease.mul, 3);
        assert_eq!(config.lease.add, 0);
        assert_eq!(config.lease.lease_timeout_secs, 5);
        assert_eq!(config.resync_timeout(), Duration::from_millis(1500));
        assert_eq!(config.session.queue_depth, SessionConfig::default().queue_depth);

        let server = config.server_config();
        assert_eq!(server.server_ord, 2);
        assert_eq!(server.fsid, 9);
        assert_eq!(server.lease.policy.max_secs, 900);
        assert!(server.lease.multihost_write);
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("sfsd.json");

        let json_content = r#"{
            "node_id": 4,
            "listen_addr": "127.0.0.1:7304",
            "metrics_addr": "127.0.0.1:9094",
            "filesystem": {"name": "jsonfs"}
        }"#;

        std::fs::write(&config_path, json_content).unwrap();

        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.node_id, 4);
        assert_eq!(config.filesystem.name, "jsonfs");
        assert_eq!(config.filesystem.fsid, FilesystemSettings::default().fsid);
    }

    #[test]
    fn test_config_unknown_extension() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("sfsd.yaml");
        std::fs::write(&config_path, "node_id: 1").unwrap();

        let result = Config::from_file(&config_path);
        assert!(matches!(result, Err(ShareError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = Config::default();
        config.lease.min_secs = 100;
        config.lease.max_secs = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.node_id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_sizes_clamped() {
        let mut config = Config::default();
        config.session.queue_depth = 0;
        config.session.read_chunk = 1;
        let session = config.session_config();
        assert_eq!(session.queue_depth, 1);
        assert_eq!(session.read_chunk, 512);
    }
}
