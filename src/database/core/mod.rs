//! Core database infrastructure
//!
//! This module provides the foundational database components used throughout hexstat:
//! - `DatabaseConn`: Core SQLite connection wrapper with configuration
//! - `SchemaManager`: Schema initialization and upgrades
//! - `SchemaStatus`: Schema state enumeration

mod connection;
mod schema;

pub use connection::DatabaseConn;
pub use schema::{SchemaDefinitions, SchemaManager, SchemaStatus, SCHEMA_VERSION};
