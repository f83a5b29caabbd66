//! Database module
//!
//! Pool setup, schema creation and row-level queries for the scan pipeline.

pub mod core;
pub mod pages;
pub mod scans;

pub use core::{
    create_core_tables, init_db, BiasSnapshot, BiasSnapshotByDocset, FileProcessingHistory, Page,
    PageStatus, ProcessingUrl, Scan, ScanStatus, Snippet,
};
