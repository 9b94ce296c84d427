//! Node-side services wiring the peer address book to configuration and
//! storage.

#![deny(rust_2018_idioms)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![deny(missing_docs)]

/// Peers manager service
pub mod peers_manager;
