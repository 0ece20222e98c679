//! Error taxonomy for the pipeline.
//!
//! Failures are contained at the stage where they occur: a bad frame,
//! operation or record is logged and skipped, never aborting sibling
//! work. Only an unrecoverable startup problem (the database being
//! unreachable at boot) is allowed to take the process down.

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use widesky_firehose::client::ClientError;
use widesky_firehose::commit::CommitError;
use widesky_firehose::frames::FrameError;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("frame decode failed: {0}")]
    Decode(#[from] FrameError),
    #[error("commit interpretation failed: {0}")]
    Commit(#[from] CommitError),
    #[error("firehose connection failed: {0}")]
    Connection(#[from] ClientError),
    #[error("firehose transport failed: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("firehose stream closed by the server")]
    StreamClosed,
    #[error("firehose read timed out")]
    ReadTimeout,
    #[error("firehose connect timed out")]
    ConnectTimeout,
    #[error("identity lookup failed: {0}")]
    Lookup(#[from] crate::identity::LookupError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("flush timed out")]
    Timeout,
}
