//! HTTP access to the tracking API: request execution, error classification and
//! read-side fetching.

mod client;
mod error;
mod fetcher;

pub use client::{extract_error_message, ApiClient};
pub use error::{ApiError, ErrorKind, ErrorRecord};
pub use fetcher::{query_fn, FetchResult, On401, QueryFetcher, QueryFn};
