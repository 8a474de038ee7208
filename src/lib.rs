//! Client-side data access layer for the tracking API.
//!
//! - [`api`]: executes HTTP requests and classifies failures
//! - [`query`]: caches results by key, retries, deduplicates and expires them
//! - [`config`] / [`telemetry`]: YAML configuration and tracing setup

pub mod api;
pub mod config;
pub mod query;
pub mod telemetry;

pub use api::{ApiClient, ApiError, ErrorRecord, On401, QueryFetcher};
pub use config::Config;
pub use query::{QueryClient, QueryKey, QueryState, QueryStatus, QuerySubscription, RetryPolicy};
