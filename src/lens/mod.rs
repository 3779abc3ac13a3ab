//! Lens module
//!
//! Lenses hold the business logic of the pipeline and are shared by the
//! CLI and by any orchestrator embedding the library.
//!
//! | Lens | Component | Key Dependencies |
//! |------|-----------|------------------|
//! | `hex` | `HexIndexer`, `HexLens` | h3o |
//! | `archive` | `ArchiveDownloader` | ureq, sha2, md-5, subtle, zip, tokio-util |
//! | `parse` | `RecordParser` | csv, sha1, zip, tokio-util |
//! | `ingest` | `BatchInserter`, `IngestPipeline` | (database only) |
//! | `aggregate` | `AggregationEngine`, `AggregateCache` | rayon, lru |
//! | `time` | `Period`, `TimeOfDay`, `TimeLens` | chrono, dateparser |
//!
//! # Architecture
//!
//! Each lens module exports:
//! - The **component struct** (e.g., `AggregationEngine`, `HexLens`), the entry point
//! - **Args structs**, the CLI-facing input arguments
//! - **Output types** that serialize to the JSON shapes callers consume
//!
//! # Usage
//!
//! ```rust,ignore
//! use hexstat::lens::ingest::IngestPipeline;
//! use hexstat::lens::aggregate::{AggregateArgs, AggregationEngine};
//! use hexstat::lens::hex::{HexLens, HexCellArgs};
//! ```

pub mod utils;

pub mod time;

pub mod hex;

pub mod archive;

pub mod parse;

pub mod ingest;

pub mod aggregate;
