//! The `util` package contains small helpers that can be easily used across
//! the whole harbor project.

#![deny(rust_2018_idioms)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![deny(missing_docs)]

/// Timestamp as UTC
pub mod timestamp;
