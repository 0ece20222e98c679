//! The WideSky ingestion pipeline.
//!
//! Consumes the Bluesky firehose, classifies repository operations
//! into typed social-media records and persists them idempotently
//! into Postgres for downstream research analysis.
//!
//! Stages, in data-flow order: a connection task owning the websocket
//! session ([`pipeline`]), frame decoding and commit interpretation
//! (`widesky-firehose`), record classification ([`classifier`]),
//! handle resolution ([`identity`]) and per-table batched upserts
//! ([`storage`]). Stages are joined by bounded queues; a full queue
//! slows the stages above it all the way back to the socket read,
//! which is the pipeline's backpressure mechanism.

pub mod classifier;
pub mod config;
pub mod error;
pub mod identity;
pub mod pipeline;
pub mod storage;
