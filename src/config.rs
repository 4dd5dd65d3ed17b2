//! Runtime configuration
//!
//! The caller loads and saves this however it likes (the binary uses YAML-ish
//! defaults from flags); the library only defines the recognised option set
//! and its defaults. Field names follow the settings file keys.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Process exit code when the local blockchain fails integrity checks.
pub const EXIT_BLOCKCHAIN_CORRUPT: i32 = 2;

/// Process exit code for any other fatal initialization error.
pub const EXIT_INIT_FAILURE: i32 = 1;

/// A bootstrap seed: known public key plus its addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedPeer {
    /// Compressed public key, hex.
    pub public_key: String,
    /// `ip:port` endpoints.
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log file path; empty logs to stderr only.
    pub log_file: Option<PathBuf>,

    /// Storage paths handed to the external collaborators.
    pub blockchain_main: Option<PathBuf>,
    pub blockchain_global: Option<PathBuf>,
    pub warehouse_main: Option<PathBuf>,
    pub search_index: Option<PathBuf>,
    pub geo_ip_database: Option<PathBuf>,

    /// Explicit `ip[:port]` listens. Empty means every adapter on the
    /// default port.
    pub listen: Vec<String>,
    pub listen_workers: usize,
    pub listen_workers_lite: usize,

    /// Node private key, hex. Empty generates a fresh identity.
    pub private_key: String,

    pub seed_list: Vec<SeedPeer>,
    pub auto_update_seed_list: bool,
    pub seed_list_version: u32,

    pub enable_upnp: bool,
    /// Assume the local firewall blocks unsolicited inbound.
    pub local_firewall: bool,
    /// Manually forwarded external port. Non-zero disables UPnP.
    pub port_forward: u16,

    /// Admission thresholds for the blockchain cache collaborator. This
    /// crate transports them; enforcement lives with the storage engine.
    pub cache_max_block_size: u64,
    pub cache_max_block_count: u64,
    pub limit_total_records: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_file: None,
            blockchain_main: None,
            blockchain_global: None,
            warehouse_main: None,
            search_index: None,
            geo_ip_database: None,
            listen: Vec::new(),
            listen_workers: 2,
            listen_workers_lite: 2,
            private_key: String::new(),
            seed_list: Vec::new(),
            auto_update_seed_list: false,
            seed_list_version: 0,
            enable_upnp: false,
            local_firewall: false,
            port_forward: 0,
            cache_max_block_size: 1024 * 1024,
            cache_max_block_count: 10_000,
            limit_total_records: 100_000,
        }
    }
}

impl Config {
    /// Parse the `listen` entries into socket addresses. A bare IP takes
    /// the default port.
    pub fn listen_addrs(&self, default_port: u16) -> Vec<SocketAddr> {
        self.listen
            .iter()
            .filter_map(|entry| {
                if let Ok(addr) = entry.parse::<SocketAddr>() {
                    return Some(addr);
                }
                entry
                    .parse::<std::net::IpAddr>()
                    .ok()
                    .map(|ip| SocketAddr::new(ip, default_port))
            })
            .collect()
    }

    /// UPnP is active only when enabled and no manual forward overrides it.
    pub fn upnp_active(&self) -> bool {
        self.enable_upnp && self.port_forward == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.listen_workers, 2);
        assert_eq!(c.listen_workers_lite, 2);
        assert_eq!(c.port_forward, 0);
        assert!(c.listen.is_empty());
    }

    #[test]
    fn listen_parsing_accepts_bare_ip() {
        let c = Config {
            listen: vec!["127.0.0.1:4000".into(), "10.0.0.1".into(), "bogus".into()],
            ..Default::default()
        };
        let addrs = c.listen_addrs(112);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0], "127.0.0.1:4000".parse().unwrap());
        assert_eq!(addrs[1], "10.0.0.1:112".parse().unwrap());
    }

    #[test]
    fn manual_port_forward_disables_upnp() {
        let c = Config { enable_upnp: true, port_forward: 8000, ..Default::default() };
        assert!(!c.upnp_active());
        let c = Config { enable_upnp: true, ..Default::default() };
        assert!(c.upnp_active());
    }

    #[test]
    fn serde_round_trip() {
        let c = Config {
            private_key: "ab".repeat(32),
            seed_list: vec![SeedPeer {
                public_key: "02".repeat(16),
                addresses: vec!["1.2.3.4:112".into()],
            }],
            ..Default::default()
        };
        let bytes = bincode::serialize(&c).unwrap();
        let back: Config = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.private_key, c.private_key);
        assert_eq!(back.seed_list, c.seed_list);
    }
}
