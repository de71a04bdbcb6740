//! HTTP client for the remote IoT timeseries API.
//!
//! The remote service exposes cursor-paginated, time-windowed sample reads
//! per site. This crate owns the wire contract: bearer authentication,
//! retry/backoff for transient failures, tolerant parsing of the sample
//! payload, and data-quality filtering (null/NaN/infinite values are dropped
//! and counted, never surfaced to callers).
//!
//! Workers depend on the [`TimeseriesApi`] trait rather than the concrete
//! [`ApiClient`] so they can be driven by scripted fakes in tests.

pub mod client;
pub mod error;
pub mod retry;

pub use client::{ApiClient, ApiClientConfig, Page, TimeseriesApi};
pub use error::{Error, Result};
pub use retry::{RetryConfig, with_retry};
