//! Postgres persistence: schema, row types and idempotent bulk
//! upserts.
//!
//! Every content table is keyed by `cid`; re-delivery of the same cid
//! overwrites the non-key columns instead of creating a duplicate
//! row. The `users` table is the one exception: `first_known_as` is
//! write-once, only `also_known_as` follows later resolutions.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::PersistenceError;
use crate::identity::Identity;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new().max_connections(max_connections).connect(database_url).await
}

const TABLES: [&str; 4] = ["users", "posts", "likes", "reposts"];

pub async fn ensure_schema(pool: &PgPool, reset: bool) -> Result<(), sqlx::Error> {
    if reset {
        for table in TABLES {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}")).execute(pool).await?;
        }
        tracing::warn!("dropped all tables before recreating them");
    }
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            did TEXT PRIMARY KEY,
            first_known_as TEXT,
            also_known_as TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS posts (
            cid TEXT PRIMARY KEY,
            created_at TIMESTAMPTZ,
            did TEXT,
            commit TEXT,
            text TEXT,
            langs TEXT[],
            facets JSONB,
            has_embed BOOL,
            embed_type TEXT,
            embed_refs TEXT[],
            external_uri TEXT,
            has_record BOOL,
            record_cid TEXT,
            record_uri TEXT,
            is_reply BOOL,
            reply_root_cid TEXT,
            reply_root_uri TEXT,
            reply_parent_cid TEXT,
            reply_parent_uri TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS likes (
            cid TEXT PRIMARY KEY,
            created_at TIMESTAMPTZ,
            did TEXT,
            commit TEXT,
            subject_cid TEXT,
            subject_url TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS reposts (
            cid TEXT PRIMARY KEY,
            created_at TIMESTAMPTZ,
            did TEXT,
            commit TEXT,
            subject_cid TEXT,
            subject_uri TEXT
        )",
    )
    .execute(pool)
    .await?;
    tracing::info!("ensured all tables exist");
    Ok(())
}

/// One destination table: a primary key for in-batch deduplication and
/// a bulk upsert. An empty batch is a no-op.
pub trait TableRow: Sized + Send + Sync + 'static {
    const TABLE: &'static str;

    fn key(&self) -> &str;

    fn insert_batch(
        pool: &PgPool,
        rows: &[Self],
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;
}

/// Destination-agnostic flush target, so the batching writer can be
/// exercised without a live database.
pub trait FlushSink<T>: Send + Sync {
    fn flush(&self, rows: &[T]) -> impl Future<Output = Result<(), PersistenceError>> + Send;
}

/// A [`FlushSink`] writing to one Postgres table.
pub struct PgSink<T> {
    pool: PgPool,
    _row: PhantomData<fn() -> T>,
}

impl<T> PgSink<T> {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, _row: PhantomData }
    }
}

impl<T: TableRow> FlushSink<T> for PgSink<T> {
    async fn flush(&self, rows: &[T]) -> Result<(), PersistenceError> {
        T::insert_batch(&self.pool, rows).await?;
        Ok(())
    }
}

/// `ON CONFLICT DO UPDATE` cannot affect the same row twice within one
/// statement, so a batch is deduplicated by key first, keeping the
/// latest occurrence.
fn dedupe_by_key<T: TableRow>(rows: &[T]) -> Vec<&T> {
    let mut by_key: HashMap<&str, &T> = HashMap::with_capacity(rows.len());
    for row in rows {
        by_key.insert(row.key(), row);
    }
    let mut deduped: Vec<&T> = by_key.into_values().collect();
    // Deterministic statement order across flush retries.
    deduped.sort_by(|a, b| a.key().cmp(b.key()));
    deduped
}

fn user_upsert(rows: &[Identity]) -> QueryBuilder<'static, Postgres> {
    let rows = dedupe_by_key(rows);
    let mut builder: QueryBuilder<Postgres> =
        QueryBuilder::new("INSERT INTO users (did, first_known_as, also_known_as) ");
    builder.push_values(rows, |mut values, row| {
        values
            .push_bind(row.did.clone())
            .push_bind(row.first_known_as.clone())
            .push_bind(row.also_known_as.clone());
    });
    // first_known_as is write-once; a NULL left by a degraded
    // lookup may still be filled in later.
    builder.push(
        " ON CONFLICT (did) DO UPDATE SET \
         first_known_as = COALESCE(users.first_known_as, EXCLUDED.first_known_as), \
         also_known_as = COALESCE(EXCLUDED.also_known_as, users.also_known_as)",
    );
    builder
}

impl TableRow for Identity {
    const TABLE: &'static str = "users";

    fn key(&self) -> &str {
        &self.did
    }

    async fn insert_batch(pool: &PgPool, rows: &[Self]) -> Result<(), sqlx::Error> {
        // push_values with no rows would render invalid SQL.
        if rows.is_empty() {
            return Ok(());
        }
        user_upsert(rows).build().execute(pool).await?;
        Ok(())
    }
}

/// One row of the `posts` table.
#[derive(Debug, Clone, PartialEq)]
pub struct PostRow {
    pub cid: String,
    pub created_at: Option<DateTime<Utc>>,
    pub did: String,
    pub commit: String,
    pub text: String,
    pub langs: Option<Vec<String>>,
    pub facets: Option<serde_json::Value>,
    pub has_embed: bool,
    pub embed_type: Option<String>,
    pub embed_refs: Option<Vec<String>>,
    pub external_uri: Option<String>,
    pub has_record: bool,
    pub record_cid: Option<String>,
    pub record_uri: Option<String>,
    pub is_reply: bool,
    pub reply_root_cid: Option<String>,
    pub reply_root_uri: Option<String>,
    pub reply_parent_cid: Option<String>,
    pub reply_parent_uri: Option<String>,
}

impl TableRow for PostRow {
    const TABLE: &'static str = "posts";

    fn key(&self) -> &str {
        &self.cid
    }

    async fn insert_batch(pool: &PgPool, rows: &[Self]) -> Result<(), sqlx::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let rows = dedupe_by_key(rows);
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO posts (cid, created_at, did, commit, text, langs, facets, \
             has_embed, embed_type, embed_refs, external_uri, has_record, record_cid, \
             record_uri, is_reply, reply_root_cid, reply_root_uri, reply_parent_cid, \
             reply_parent_uri) ",
        );
        builder.push_values(rows, |mut values, row| {
            values
                .push_bind(row.cid.clone())
                .push_bind(row.created_at)
                .push_bind(row.did.clone())
                .push_bind(row.commit.clone())
                .push_bind(row.text.clone())
                .push_bind(row.langs.clone())
                .push_bind(row.facets.clone())
                .push_bind(row.has_embed)
                .push_bind(row.embed_type.clone())
                .push_bind(row.embed_refs.clone())
                .push_bind(row.external_uri.clone())
                .push_bind(row.has_record)
                .push_bind(row.record_cid.clone())
                .push_bind(row.record_uri.clone())
                .push_bind(row.is_reply)
                .push_bind(row.reply_root_cid.clone())
                .push_bind(row.reply_root_uri.clone())
                .push_bind(row.reply_parent_cid.clone())
                .push_bind(row.reply_parent_uri.clone());
        });
        builder.push(
            " ON CONFLICT (cid) DO UPDATE SET \
             created_at = EXCLUDED.created_at, did = EXCLUDED.did, \
             commit = EXCLUDED.commit, text = EXCLUDED.text, langs = EXCLUDED.langs, \
             facets = EXCLUDED.facets, has_embed = EXCLUDED.has_embed, \
             embed_type = EXCLUDED.embed_type, embed_refs = EXCLUDED.embed_refs, \
             external_uri = EXCLUDED.external_uri, has_record = EXCLUDED.has_record, \
             record_cid = EXCLUDED.record_cid, record_uri = EXCLUDED.record_uri, \
             is_reply = EXCLUDED.is_reply, reply_root_cid = EXCLUDED.reply_root_cid, \
             reply_root_uri = EXCLUDED.reply_root_uri, \
             reply_parent_cid = EXCLUDED.reply_parent_cid, \
             reply_parent_uri = EXCLUDED.reply_parent_uri",
        );
        builder.build().execute(pool).await?;
        Ok(())
    }
}

/// One row of the `likes` table.
#[derive(Debug, Clone, PartialEq)]
pub struct LikeRow {
    pub cid: String,
    pub created_at: Option<DateTime<Utc>>,
    pub did: String,
    pub commit: String,
    pub subject_cid: String,
    pub subject_url: String,
}

impl TableRow for LikeRow {
    const TABLE: &'static str = "likes";

    fn key(&self) -> &str {
        &self.cid
    }

    async fn insert_batch(pool: &PgPool, rows: &[Self]) -> Result<(), sqlx::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let rows = dedupe_by_key(rows);
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO likes (cid, created_at, did, commit, subject_cid, subject_url) ",
        );
        builder.push_values(rows, |mut values, row| {
            values
                .push_bind(row.cid.clone())
                .push_bind(row.created_at)
                .push_bind(row.did.clone())
                .push_bind(row.commit.clone())
                .push_bind(row.subject_cid.clone())
                .push_bind(row.subject_url.clone());
        });
        builder.push(
            " ON CONFLICT (cid) DO UPDATE SET \
             created_at = EXCLUDED.created_at, did = EXCLUDED.did, \
             commit = EXCLUDED.commit, subject_cid = EXCLUDED.subject_cid, \
             subject_url = EXCLUDED.subject_url",
        );
        builder.build().execute(pool).await?;
        Ok(())
    }
}

/// One row of the `reposts` table.
#[derive(Debug, Clone, PartialEq)]
pub struct RepostRow {
    pub cid: String,
    pub created_at: Option<DateTime<Utc>>,
    pub did: String,
    pub commit: String,
    pub subject_cid: String,
    pub subject_uri: String,
}

impl TableRow for RepostRow {
    const TABLE: &'static str = "reposts";

    fn key(&self) -> &str {
        &self.cid
    }

    async fn insert_batch(pool: &PgPool, rows: &[Self]) -> Result<(), sqlx::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let rows = dedupe_by_key(rows);
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO reposts (cid, created_at, did, commit, subject_cid, subject_uri) ",
        );
        builder.push_values(rows, |mut values, row| {
            values
                .push_bind(row.cid.clone())
                .push_bind(row.created_at)
                .push_bind(row.did.clone())
                .push_bind(row.commit.clone())
                .push_bind(row.subject_cid.clone())
                .push_bind(row.subject_uri.clone());
        });
        builder.push(
            " ON CONFLICT (cid) DO UPDATE SET \
             created_at = EXCLUDED.created_at, did = EXCLUDED.did, \
             commit = EXCLUDED.commit, subject_cid = EXCLUDED.subject_cid, \
             subject_uri = EXCLUDED.subject_uri",
        );
        builder.build().execute(pool).await?;
        Ok(())
    }
}

/// A follow, classified for completeness but not persisted: there is
/// no follows table in the outbound schema yet.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowRow {
    pub cid: String,
    pub created_at: Option<DateTime<Utc>>,
    pub did: String,
    pub commit: String,
    pub subject_did: String,
}
