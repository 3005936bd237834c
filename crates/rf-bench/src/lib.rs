//! # rf-bench
//!
//! Performance benchmarks for the disk streaming engine.
//!
//! ## Benchmark Categories
//!
//! - **Ring Buffer Benchmarks**: bulk copy in/out, peeks, rewinds
//! - **Streaming Benchmarks**: playlist refills and process-thread cycles
//!
//! ## Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench -p rf-bench
//!
//! # Run specific benchmark
//! cargo bench -p rf-bench -- refill
//!
//! # With baseline comparison
//! cargo bench -p rf-bench -- --save-baseline main
//! cargo bench -p rf-bench -- --baseline main
//! ```

pub mod generators;

pub use generators::*;
