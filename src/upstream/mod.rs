//! Upstream source the cached artifact is fetched from.

mod client;

pub use client::HttpFetcher;
