//! Harbor storage module that persists the peer address book into a small
//! relational store and rehydrates it on startup.

#![deny(rust_2018_idioms)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![deny(missing_docs)]

pub mod error;
pub mod store;
