//! Shared primitives for the WideSky ingestion pipeline.
//!
//! Nothing in this crate knows about the AT Protocol. It provides the
//! retry policy used by every network-facing stage and a composable
//! async [`Resolver`](resolver::Resolver) abstraction with caching and
//! in-flight deduplication layers.

pub mod resolver;
pub mod retry;
