//! Load the configuration from a file or a `String` written in [Toml format](https://en.wikipedia.org/wiki/TOML)

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::Config;

/// `toml::de::Error`, but loading that configuration from a file
/// might also fail with a `std::io::Error`.
#[derive(Debug, Error)]
pub enum Error {
    /// There was an error when trying to load configuration from a file.
    #[error("Error reading config file: {0}")]
    Io(#[from] io::Error),
    /// Indicates there was an error when trying to build a
    /// `harbor_config::Config` instance out of the Toml string given.
    #[error("Error parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load configuration from a file written in Toml format.
pub fn from_file<S: AsRef<Path>>(file: S) -> Result<Config, Error> {
    let f = file.as_ref();

    log::debug!("Loading config from `{}`", f.to_string_lossy());

    let contents = std::fs::read_to_string(f)?;
    from_str(&contents).map_err(Error::Parse)
}

/// Load configuration from a string written in Toml format.
pub fn from_str(contents: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(contents)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::{Config, ConnectionsConfig, StorageConfig};

    #[test]
    fn test_load_empty_config() {
        let config = super::from_str("").unwrap();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_configure_connections() {
        let empty_config = super::from_str("[connections]").unwrap();
        let config = super::from_str(
            r"
[connections]
known_peers = ['192.168.1.12:1234']
outbound_limit = 16
allow_private_addresses = true
    ",
        )
        .unwrap();

        assert_eq!(empty_config.connections, ConnectionsConfig::default());
        assert_eq!(empty_config.connections.known_peers.len(), 0);
        assert_eq!(
            config.connections.known_peers,
            vec!["192.168.1.12:1234".parse().unwrap()]
        );
        assert_eq!(config.connections.outbound_limit, 16);
        assert!(config.connections.allow_private_addresses);
    }

    #[test]
    fn test_configure_storage() {
        let empty_config = super::from_str("[storage]").unwrap();
        let config = super::from_str(
            r"
[storage]
db_path = 'dbfiles'
    ",
        )
        .unwrap();

        assert_eq!(empty_config.storage, StorageConfig::default());
        assert_eq!(config.storage.db_path, PathBuf::from("dbfiles"));
    }

    #[test]
    fn test_load_periods() {
        let empty_config = super::from_str("[connections]").unwrap();
        let config = super::from_str(
            r"
[connections]
storage_peers_period_seconds = 7
cleanup_peers_period_seconds = 11
cleanup_max_age_seconds = 3600
cleanup_max_failures = 3
    ",
        )
        .unwrap();

        // Check default values in empty config
        assert_eq!(
            empty_config.connections.storage_peers_period_seconds,
            ConnectionsConfig::default().storage_peers_period_seconds
        );
        assert_eq!(
            empty_config.connections.cleanup_max_failures,
            ConnectionsConfig::default().cleanup_max_failures
        );

        // Check values in initialized config
        assert_eq!(config.connections.storage_peers_period_seconds, 7);
        assert_eq!(config.connections.cleanup_peers_period_seconds, 11);
        assert_eq!(config.connections.cleanup_max_age_seconds, 3600);
        assert_eq!(config.connections.cleanup_max_failures, 3);
    }

    #[test]
    fn test_load_config_from_missing_file() {
        let result = super::from_file("does-not-exist.toml");

        assert!(matches!(result, Err(super::Error::Io(_))));
    }
}
