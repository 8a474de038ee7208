//! Keyed query cache with staleness, retry, deduplication and garbage collection.
//!
//! Inspired by TanStack Query: views subscribe to a [`QueryKey`], the
//! [`QueryClient`] decides when to hit the network and every subscriber of a key
//! observes the same [`QueryState`].

mod client;
mod key;
mod retry;
mod state;

pub use client::{QueryClient, QuerySubscription};
pub use key::{KeyPart, QueryKey};
pub use retry::{OperationKind, RetryLimits, RetryPolicy};
pub use state::{QueryState, QueryStatus};
