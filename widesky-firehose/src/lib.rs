//! Wire-level handling of the Bluesky firehose.
//!
//! The firehose is a websocket subscription
//! (`com.atproto.sync.subscribeRepos`) emitting binary frames, each of
//! which is two concatenated DAG-CBOR values: a small header naming
//! the event kind, and a body whose shape depends on that kind.
//!
//! - [`frames`] splits and types the header/body pair (no AT Protocol
//!   semantics).
//! - [`commit`] interprets a typed body into a [`commit::RepoCommit`]
//!   with its ordered operations and record bytes.
//! - [`client`] establishes the websocket session, optionally resuming
//!   from a sequence cursor.

pub mod client;
pub mod commit;
pub mod frames;
