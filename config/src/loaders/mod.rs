//! Loaders for the different supported configuration data sources.

pub mod toml;
