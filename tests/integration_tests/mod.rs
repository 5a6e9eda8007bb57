//! Integration tests module
//!
//! End-to-end tests for the fit orchestrator, including:
//! - Two instances over overlapping candidate sets (memory and SQLite catalogs)
//! - Complete select → claim → fit → record batches
//! - Catalog failures, panicking fitters and write failures

pub mod batch_test;
pub mod concurrency_test;
pub mod error_scenarios;
pub mod fixtures;
