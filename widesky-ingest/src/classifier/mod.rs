//! Maps commit operations onto typed domain records.
//!
//! Dispatch is on the collection segment of the operation path. Only
//! `create` actions are classified; a record body that fails to decode
//! degrades to [`DecodedRecord::Unhandled`] so one bad operation never
//! discards the rest of its commit.

#[cfg(test)]
mod tests;

use base64::Engine;
use chrono::{DateTime, Utc};
use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use serde::Deserialize;
use widesky_firehose::commit::{Operation, RepoCommit};

use crate::storage::{FollowRow, LikeRow, PostRow, RepostRow};

pub const POST_COLLECTION: &str = "app.bsky.feed.post";
pub const LIKE_COLLECTION: &str = "app.bsky.feed.like";
pub const REPOST_COLLECTION: &str = "app.bsky.feed.repost";
pub const FOLLOW_COLLECTION: &str = "app.bsky.graph.follow";

/// One classified operation, routed by variant to its destination
/// table. Follows are typed but have no table yet; `Unhandled` is a
/// counted gap, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedRecord {
    Post(PostRow),
    Like(LikeRow),
    Repost(RepostRow),
    Follow(FollowRow),
    Unhandled { collection: String },
}

/// Classifies one operation of a commit. Returns `None` for non-create
/// actions, which are out of scope for this revision.
pub fn classify(commit: &RepoCommit, op: &Operation) -> Option<DecodedRecord> {
    if op.action != "create" {
        tracing::debug!(action = %op.action, path = %op.path, "dropping non-create operation");
        return None;
    }
    let collection = op.path.split('/').next().unwrap_or_default();
    Some(classify_create(commit, op, collection))
}

fn classify_create(commit: &RepoCommit, op: &Operation, collection: &str) -> DecodedRecord {
    let unhandled = DecodedRecord::Unhandled { collection: collection.to_owned() };
    let (Some(cid), Some(bytes)) = (&op.cid, &op.record) else {
        tracing::debug!(path = %op.path, "create operation without a record block");
        return unhandled;
    };
    match collection {
        POST_COLLECTION => match serde_ipld_dagcbor::from_slice::<PostRecord>(bytes) {
            Ok(record) => DecodedRecord::Post(post_row(cid, record, commit)),
            Err(err) => decode_gap(op, err, unhandled),
        },
        LIKE_COLLECTION => match serde_ipld_dagcbor::from_slice::<SubjectRecord>(bytes) {
            Ok(record) => DecodedRecord::Like(LikeRow {
                cid: cid.to_string(),
                created_at: parse_datetime(record.created_at.as_deref()),
                did: commit.did.clone(),
                commit: commit.commit.to_string(),
                subject_cid: record.subject.cid,
                subject_url: record.subject.uri,
            }),
            Err(err) => decode_gap(op, err, unhandled),
        },
        REPOST_COLLECTION => match serde_ipld_dagcbor::from_slice::<SubjectRecord>(bytes) {
            Ok(record) => DecodedRecord::Repost(RepostRow {
                cid: cid.to_string(),
                created_at: parse_datetime(record.created_at.as_deref()),
                did: commit.did.clone(),
                commit: commit.commit.to_string(),
                subject_cid: record.subject.cid,
                subject_uri: record.subject.uri,
            }),
            Err(err) => decode_gap(op, err, unhandled),
        },
        FOLLOW_COLLECTION => match serde_ipld_dagcbor::from_slice::<FollowRecord>(bytes) {
            Ok(record) => DecodedRecord::Follow(FollowRow {
                cid: cid.to_string(),
                created_at: parse_datetime(record.created_at.as_deref()),
                did: commit.did.clone(),
                commit: commit.commit.to_string(),
                subject_did: record.subject,
            }),
            Err(err) => decode_gap(op, err, unhandled),
        },
        _ => unhandled,
    }
}

fn decode_gap(
    op: &Operation,
    err: serde_ipld_dagcbor::DecodeError<std::convert::Infallible>,
    unhandled: DecodedRecord,
) -> DecodedRecord {
    tracing::warn!(path = %op.path, error = %err, "record body failed to decode");
    unhandled
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostRecord {
    created_at: Option<String>,
    #[serde(default)]
    text: String,
    langs: Option<Vec<String>>,
    facets: Option<Ipld>,
    reply: Option<ReplyRef>,
    embed: Option<Ipld>,
}

#[derive(Debug, Deserialize)]
struct ReplyRef {
    root: StrongRef,
    parent: StrongRef,
}

#[derive(Debug, Deserialize)]
struct StrongRef {
    cid: String,
    uri: String,
}

/// Shared shape of like and repost records.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubjectRecord {
    created_at: Option<String>,
    subject: StrongRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FollowRecord {
    created_at: Option<String>,
    subject: String,
}

fn post_row(cid: &Cid, record: PostRecord, commit: &RepoCommit) -> PostRow {
    let embed = record.embed.as_ref().map(extract_embed).unwrap_or_default();
    let reply = record.reply.as_ref();
    PostRow {
        cid: cid.to_string(),
        created_at: parse_datetime(record.created_at.as_deref()),
        did: commit.did.clone(),
        commit: commit.commit.to_string(),
        text: record.text,
        langs: record.langs,
        facets: record.facets.as_ref().map(ipld_to_json),
        has_embed: embed.has_embed,
        embed_type: embed.embed_type,
        embed_refs: embed.embed_refs,
        external_uri: embed.external_uri,
        has_record: embed.has_record,
        record_cid: embed.record_cid,
        record_uri: embed.record_uri,
        is_reply: reply.is_some(),
        reply_root_cid: reply.map(|r| r.root.cid.clone()),
        reply_root_uri: reply.map(|r| r.root.uri.clone()),
        reply_parent_cid: reply.map(|r| r.parent.cid.clone()),
        reply_parent_uri: reply.map(|r| r.parent.uri.clone()),
    }
}

fn parse_datetime(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// The coarse embed columns of a post row. Default is "no embed".
#[derive(Debug, Default, PartialEq)]
struct EmbedDetail {
    has_embed: bool,
    embed_type: Option<String>,
    embed_refs: Option<Vec<String>>,
    external_uri: Option<String>,
    has_record: bool,
    record_cid: Option<String>,
    record_uri: Option<String>,
}

/// Flattens an embed value into the coarse detail columns. The tag is
/// the last dot segment of the `$type` NSID, so `app.bsky.embed.images`
/// lands as `images`. Quoted records carry the media tag when present.
fn extract_embed(embed: &Ipld) -> EmbedDetail {
    let mut detail = EmbedDetail::default();
    let Some(full_type) = lookup(embed, "$type").and_then(as_str) else {
        return detail;
    };
    let tag = full_type.rsplit('.').next().unwrap_or_default();
    match tag {
        "images" => {
            detail.has_embed = true;
            detail.embed_type = Some(tag.to_owned());
            detail.embed_refs = lookup(embed, tag).map(image_refs);
        }
        "video" => {
            detail.has_embed = true;
            detail.embed_type = Some(tag.to_owned());
            detail.embed_refs =
                blob_ref(lookup(embed, tag)).map(|link| vec![link]);
        }
        "external" => {
            detail.has_embed = true;
            detail.embed_type = Some(tag.to_owned());
            detail.external_uri = lookup(embed, tag)
                .and_then(|external| lookup(external, "uri"))
                .and_then(as_str)
                .map(str::to_owned);
        }
        "record" => {
            // A bare quote post carries no media of its own.
            detail.has_record = true;
            detail.embed_type = Some(tag.to_owned());
            let subject = lookup(embed, tag);
            detail.record_cid = strong_ref_field(subject, "cid");
            detail.record_uri = strong_ref_field(subject, "uri");
        }
        "recordWithMedia" => {
            detail.has_embed = true;
            detail.has_record = true;
            let subject = lookup(embed, "record").and_then(|outer| lookup(outer, "record"));
            detail.record_cid = strong_ref_field(subject, "cid");
            detail.record_uri = strong_ref_field(subject, "uri");
            if let Some(media) = lookup(embed, "media") {
                extract_media(media, &mut detail);
            }
        }
        "" => {}
        other => {
            tracing::warn!(embed_type = other, "embed type not implemented");
            detail.embed_type = Some(other.to_owned());
        }
    }
    detail
}

fn extract_media(media: &Ipld, detail: &mut EmbedDetail) {
    let Some(full_type) = lookup(media, "$type").and_then(as_str) else {
        return;
    };
    let tag = full_type.rsplit('.').next().unwrap_or_default();
    detail.embed_type = Some(tag.to_owned());
    match tag {
        "images" => detail.embed_refs = lookup(media, tag).map(image_refs),
        "video" => {
            detail.embed_refs = blob_ref(lookup(media, tag)).map(|link| vec![link]);
        }
        "external" => {
            detail.external_uri = lookup(media, "external")
                .and_then(|external| lookup(external, "uri"))
                .and_then(as_str)
                .map(str::to_owned);
        }
        other => tracing::warn!(media_type = other, "media type not implemented"),
    }
}

fn image_refs(images: &Ipld) -> Vec<String> {
    let Ipld::List(items) = images else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| blob_ref(lookup(item, "image")))
        .collect()
}

/// The `ref` link inside a blob value, rendered as a CID string.
fn blob_ref(blob: Option<&Ipld>) -> Option<String> {
    match blob.and_then(|value| lookup(value, "ref")) {
        Some(Ipld::Link(cid)) => Some(cid.to_string()),
        _ => None,
    }
}

fn strong_ref_field(subject: Option<&Ipld>, field: &str) -> Option<String> {
    subject.and_then(|value| lookup(value, field)).and_then(as_str).map(str::to_owned)
}

fn lookup<'a>(value: &'a Ipld, key: &str) -> Option<&'a Ipld> {
    match value {
        Ipld::Map(map) => map.get(key),
        _ => None,
    }
}

fn as_str(value: &Ipld) -> Option<&str> {
    match value {
        Ipld::String(string) => Some(string),
        _ => None,
    }
}

/// Renders an opaque structured value as JSON for storage. Links become
/// CID strings, bytes base64.
pub fn ipld_to_json(value: &Ipld) -> serde_json::Value {
    match value {
        Ipld::Null => serde_json::Value::Null,
        Ipld::Bool(flag) => serde_json::Value::Bool(*flag),
        Ipld::Integer(integer) => i64::try_from(*integer)
            .map(|fits| serde_json::Value::Number(fits.into()))
            .unwrap_or_else(|_| serde_json::Value::String(integer.to_string())),
        Ipld::Float(float) => serde_json::Number::from_f64(*float)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Ipld::String(string) => serde_json::Value::String(string.clone()),
        Ipld::Bytes(bytes) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        Ipld::List(items) => serde_json::Value::Array(items.iter().map(ipld_to_json).collect()),
        Ipld::Map(map) => serde_json::Value::Object(
            map.iter().map(|(key, item)| (key.clone(), ipld_to_json(item))).collect(),
        ),
        Ipld::Link(cid) => serde_json::Value::String(cid.to_string()),
    }
}
