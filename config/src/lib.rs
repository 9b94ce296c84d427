//! # Harbor configuration library.
//!
//! This is the library code for reading and validating the configuration
//! read from an external data source. External data sources and their
//! format are handled through different loaders, see the
//! `harbor_config::loaders` module for more information.
//!
//! No matter which data source you use, ultimately all of them will load
//! the configuration as an instance of the `Config` struct which is
//! composed of other, more specialized, structs such as `StorageConfig`
//! and `ConnectionsConfig`. This instance is the one you use in your Rust
//! code to interact with the loaded configuration.

#![deny(rust_2018_idioms)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![deny(missing_docs)]

use std::default::Default;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod loaders;

/// The entire configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Connections-specific configuration
    #[serde(default = "Config::default_connections")]
    pub connections: ConnectionsConfig,
    /// Storage-specific configuration
    #[serde(default = "Config::default_storage")]
    pub storage: StorageConfig,
}

/// Connections-specific configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ConnectionsConfig {
    /// Bootstrap peer addresses fed to the address book at startup
    #[serde(default = "ConnectionsConfig::default_known_peers")]
    pub known_peers: Vec<SocketAddr>,
    /// Maximum number of outbound connections, held to distinct address groups
    #[serde(default = "ConnectionsConfig::default_outbound_limit")]
    pub outbound_limit: u16,
    /// Accept private-range peer addresses (test environments only)
    #[serde(default = "ConnectionsConfig::default_allow_private_addresses")]
    pub allow_private_addresses: bool,
    /// Seconds between address book snapshots to storage
    #[serde(default = "ConnectionsConfig::default_storage_peers_period_seconds")]
    pub storage_peers_period_seconds: u64,
    /// Seconds between cleanup passes over the address book
    #[serde(default = "ConnectionsConfig::default_cleanup_peers_period_seconds")]
    pub cleanup_peers_period_seconds: u64,
    /// Seconds since the last attempt before a failing record qualifies for cleanup
    #[serde(default = "ConnectionsConfig::default_cleanup_max_age_seconds")]
    pub cleanup_max_age_seconds: i64,
    /// Consecutive failures before a record qualifies for cleanup
    #[serde(default = "ConnectionsConfig::default_cleanup_max_failures")]
    pub cleanup_max_failures: u32,
    /// Penalty in seconds applied to peer timestamps relayed by other full
    /// nodes. Addresses learned from an introducer are already stale and
    /// take no penalty.
    #[serde(default = "ConnectionsConfig::default_peer_source_time_penalty_seconds")]
    pub peer_source_time_penalty_seconds: i64,
}

/// Storage-specific configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StorageConfig {
    /// Path of the directory holding the peers database
    #[serde(default = "StorageConfig::default_db_path")]
    pub db_path: PathBuf,
}

impl Config {
    fn default_connections() -> ConnectionsConfig {
        ConnectionsConfig::default()
    }

    fn default_storage() -> StorageConfig {
        StorageConfig::default()
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            connections: Self::default_connections(),
            storage: Self::default_storage(),
        }
    }
}

impl ConnectionsConfig {
    fn default_known_peers() -> Vec<SocketAddr> {
        Vec::default()
    }

    fn default_outbound_limit() -> u16 {
        8
    }

    fn default_allow_private_addresses() -> bool {
        false
    }

    fn default_storage_peers_period_seconds() -> u64 {
        300
    }

    fn default_cleanup_peers_period_seconds() -> u64 {
        1800
    }

    fn default_cleanup_max_age_seconds() -> i64 {
        7 * 24 * 60 * 60
    }

    fn default_cleanup_max_failures() -> u32 {
        5
    }

    fn default_peer_source_time_penalty_seconds() -> i64 {
        2 * 60 * 60
    }
}

impl Default for ConnectionsConfig {
    fn default() -> ConnectionsConfig {
        ConnectionsConfig {
            known_peers: Self::default_known_peers(),
            outbound_limit: Self::default_outbound_limit(),
            allow_private_addresses: Self::default_allow_private_addresses(),
            storage_peers_period_seconds: Self::default_storage_peers_period_seconds(),
            cleanup_peers_period_seconds: Self::default_cleanup_peers_period_seconds(),
            cleanup_max_age_seconds: Self::default_cleanup_max_age_seconds(),
            cleanup_max_failures: Self::default_cleanup_max_failures(),
            peer_source_time_penalty_seconds: Self::default_peer_source_time_penalty_seconds(),
        }
    }
}

impl StorageConfig {
    fn default_db_path() -> PathBuf {
        PathBuf::from(".harbor")
    }
}

impl Default for StorageConfig {
    fn default() -> StorageConfig {
        StorageConfig {
            db_path: Self::default_db_path(),
        }
    }
}
