//! Interpreting frame bodies into typed repository events.
//!
//! A `#commit` body carries the commit metadata, the operation list
//! and a CAR-encoded block section holding the record bodies. The
//! interpreter joins each operation to its record bytes by CID; the
//! records themselves are decoded later, by the classifier, so that
//! one undecodable record cannot discard its siblings.


use std::collections::BTreeMap;

use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("CAR decoding error: {0}")]
    Car(#[from] rs_car::CarDecodeError),
    #[error("dag-cbor decoding error: {0}")]
    Decode(#[from] serde_ipld_dagcbor::DecodeError<std::convert::Infallible>),
}

/// Every event kind the firehose currently emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Commit,
    Identity,
    Account,
    Handle,
    Migrate,
    Tombstone,
    Info,
}

impl EventKind {
    pub fn from_tag(t: &str) -> Option<Self> {
        match t {
            "#commit" => Some(Self::Commit),
            "#identity" => Some(Self::Identity),
            "#account" => Some(Self::Account),
            "#handle" => Some(Self::Handle),
            "#migrate" => Some(Self::Migrate),
            "#tombstone" => Some(Self::Tombstone),
            "#info" => Some(Self::Info),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "#commit",
            Self::Identity => "#identity",
            Self::Account => "#account",
            Self::Handle => "#handle",
            Self::Migrate => "#migrate",
            Self::Tombstone => "#tombstone",
            Self::Info => "#info",
        }
    }
}

/// One atomic change to one actor's repository.
#[derive(Debug, Clone)]
pub struct RepoCommit {
    pub seq: i64,
    pub did: String,
    pub rev: String,
    pub commit: Cid,
    /// In the order they appear in the source frame.
    pub ops: Vec<Operation>,
}

/// One record operation within a commit, with the record body bytes
/// already joined from the block section.
#[derive(Debug, Clone)]
pub struct Operation {
    pub action: String,
    pub path: String,
    pub cid: Option<Cid>,
    pub record: Option<Vec<u8>>,
}

/// A successfully interpreted frame body.
#[derive(Debug, Clone)]
pub enum FirehoseEvent {
    Commit(RepoCommit),
    /// Recognized but not converted into domain records; carries the
    /// sequence number so the resumption cursor stays accurate.
    Passive { kind: EventKind, seq: Option<i64> },
}

impl FirehoseEvent {
    pub fn seq(&self) -> Option<i64> {
        match self {
            Self::Commit(commit) => Some(commit.seq),
            Self::Passive { seq, .. } => *seq,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitBody {
    seq: i64,
    repo: String,
    rev: String,
    commit: Cid,
    #[serde(default, with = "serde_bytes")]
    blocks: Vec<u8>,
    // Kept opaque so one malformed entry cannot fail the whole commit.
    #[serde(default)]
    ops: Vec<Ipld>,
    #[serde(default)]
    too_big: bool,
}

fn decode_op(raw: Ipld) -> Option<(String, String, Option<Cid>)> {
    let Ipld::Map(mut map) = raw else { return None };
    let Some(Ipld::String(action)) = map.remove("action") else { return None };
    let Some(Ipld::String(path)) = map.remove("path") else { return None };
    let cid = match map.remove("cid") {
        Some(Ipld::Link(cid)) => Some(cid),
        _ => None,
    };
    Some((action, path, cid))
}

/// The sequence-bearing prefix shared by every non-`#info` body.
#[derive(Debug, Clone, Deserialize)]
struct SeqProbe {
    seq: i64,
}

/// Interprets a frame body given its header tag.
///
/// Returns `Ok(None)` for unknown tags ("clients should ignore frames
/// with headers that have unknown op or t values",
/// <https://atproto.com/specs/event-stream>).
pub async fn interpret(tag: &str, body: &[u8]) -> Result<Option<FirehoseEvent>, CommitError> {
    let Some(kind) = EventKind::from_tag(tag) else {
        return Ok(None);
    };
    if kind != EventKind::Commit {
        let seq = serde_ipld_dagcbor::from_slice::<SeqProbe>(body).ok().map(|probe| probe.seq);
        return Ok(Some(FirehoseEvent::Passive { kind, seq }));
    }

    let commit: CommitBody = serde_ipld_dagcbor::from_slice(body)?;
    // A commit marked `tooBig` is sent without blocks and ops.
    let ops = if commit.too_big {
        Vec::new()
    } else {
        let mut cursor = futures::io::Cursor::new(commit.blocks);
        let (blocks, _) = rs_car::car_read_all(&mut cursor, true).await?;
        let records =
            blocks.into_iter().filter_map(compat_cid).collect::<BTreeMap<Cid, Vec<u8>>>();
        commit
            .ops
            .into_iter()
            .filter_map(|raw| {
                let Some((action, path, cid)) = decode_op(raw) else {
                    tracing::warn!(seq = commit.seq, "skipping malformed commit operation");
                    return None;
                };
                let record = cid.as_ref().and_then(|cid| records.get(cid).cloned());
                Some(Operation { action, path, cid, record })
            })
            .collect()
    };

    Ok(Some(FirehoseEvent::Commit(RepoCommit {
        seq: commit.seq,
        did: commit.repo,
        rev: commit.rev,
        commit: commit.commit,
        ops,
    })))
}

// `rs_car` carries its own cid version; re-parse through the bytes
// representation to get an `ipld_core` Cid.
fn compat_cid((cid, data): (rs_car::Cid, Vec<u8>)) -> Option<(Cid, Vec<u8>)> {
    Cid::try_from(cid.to_bytes().as_slice()).ok().map(|cid| (cid, data))
}
