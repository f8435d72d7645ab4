//! # gnosis
//!
//! Server and CLI around [`gnosis_core`]. The HTTP surface carries signed
//! messages between planes and the core; the CLI inspects and maintains a
//! redb database.

pub mod api;
pub mod cli;
pub mod config;
