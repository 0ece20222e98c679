//! Pipeline orchestration.
//!
//! One long-lived task owns the firehose connection and reads frames
//! sequentially, so frame order from a single connection is never
//! reordered. Frames flow through a bounded queue into a pool of
//! classifier workers, and classified records through bounded queues
//! into one writer per destination table. Full queues block the
//! producer, which slows frame consumption from the firehose itself.
//!
//! Shutdown cascades through channel closure: cancelling the token
//! stops the connection task, which drops the frame sender; workers
//! drain the frame queue and exit, dropping the record senders; each
//! writer then performs a final flush and exits.

pub mod writer;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use widesky_common::resolver::Resolver;
use widesky_firehose::client::{FirehoseClient, WsStream};
use widesky_firehose::commit::{interpret, FirehoseEvent, RepoCommit};
use widesky_firehose::frames::Frame;

use crate::classifier::{classify, DecodedRecord};
use crate::config::Config;
use crate::error::{IngestError, PersistenceError};
use crate::identity::{Identity, IdentityResolver};
use crate::storage::{self, LikeRow, PgSink, PostRow, RepostRow};
use writer::{run_writer, WriterConfig};

/// Observability counters, logged at shutdown.
#[derive(Debug, Default)]
struct Counters {
    commits: AtomicU64,
    unhandled: AtomicU64,
    follows: AtomicU64,
}

/// Record senders, one per destination table. Cloned into every
/// classifier worker; the writers exit once all clones are gone.
#[derive(Clone)]
struct Routes {
    users: mpsc::Sender<Identity>,
    posts: mpsc::Sender<PostRow>,
    likes: mpsc::Sender<LikeRow>,
    reposts: mpsc::Sender<RepostRow>,
}

/// Runs the pipeline until the token is cancelled. Only an
/// unreachable database at boot is fatal.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), IngestError> {
    let pool = storage::connect(&config.database_url, config.db_max_connections)
        .await
        .map_err(PersistenceError::from)?;
    storage::ensure_schema(&pool, config.reset_schema).await.map_err(PersistenceError::from)?;

    let resolver = Arc::new(crate::identity::identity_resolver(
        &config.plc_url,
        config.lookup_policy(),
    )?);
    let cursor = Arc::new(AtomicI64::new(config.cursor.unwrap_or(-1)));
    let counters = Arc::new(Counters::default());

    let writer_config = WriterConfig {
        batch_size: config.batch_size,
        flush_interval: config.flush_interval(),
        retry: config.flush_policy(),
        flush_timeout: config.flush_timeout(),
    };
    let (users_tx, users_rx) = mpsc::channel(config.queue_capacity);
    let (posts_tx, posts_rx) = mpsc::channel(config.queue_capacity);
    let (likes_tx, likes_rx) = mpsc::channel(config.queue_capacity);
    let (reposts_tx, reposts_rx) = mpsc::channel(config.queue_capacity);
    let writers = vec![
        tokio::spawn(run_writer("users", users_rx, PgSink::new(pool.clone()), writer_config.clone())),
        tokio::spawn(run_writer("posts", posts_rx, PgSink::new(pool.clone()), writer_config.clone())),
        tokio::spawn(run_writer("likes", likes_rx, PgSink::new(pool.clone()), writer_config.clone())),
        tokio::spawn(run_writer("reposts", reposts_rx, PgSink::new(pool), writer_config)),
    ];
    let routes = Routes { users: users_tx, posts: posts_tx, likes: likes_tx, reposts: reposts_tx };

    let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(config.queue_capacity);
    let frame_rx = Arc::new(Mutex::new(frame_rx));
    let mut workers = Vec::with_capacity(config.workers);
    for id in 0..config.workers {
        workers.push(tokio::spawn(classify_worker(
            id,
            frame_rx.clone(),
            resolver.clone(),
            routes.clone(),
            cursor.clone(),
            counters.clone(),
        )));
    }
    drop(routes);

    connection_loop(&config, frame_tx, &cursor, shutdown).await;

    for worker in workers {
        let _ = worker.await;
    }
    for writer in writers {
        let _ = writer.await;
    }
    tracing::info!(
        commits = counters.commits.load(Ordering::Relaxed),
        unhandled = counters.unhandled.load(Ordering::Relaxed),
        follows = counters.follows.load(Ordering::Relaxed),
        last_sequence = cursor.load(Ordering::Acquire),
        "pipeline stopped",
    );
    Ok(())
}

/// Owns the firehose connection, reconnecting with capped backoff
/// until shutdown. The failure counter resets only after a session has
/// streamed for the configured dwell, so neither a server that accepts
/// and immediately drops sessions nor a slow failing connect can
/// defeat the backoff.
async fn connection_loop(
    config: &Config,
    frame_tx: mpsc::Sender<Vec<u8>>,
    cursor: &AtomicI64,
    shutdown: CancellationToken,
) {
    let client = FirehoseClient::new(config.firehose_host.clone());
    let mut backoff = config.backoff_policy().backoff();
    let stable_after = config.stable_connection();
    while !shutdown.is_cancelled() {
        let resume = match cursor.load(Ordering::Acquire) {
            seq if seq >= 0 => Some(seq),
            _ => None,
        };
        let (streamed, err) = match open_session(config, &client, resume, &shutdown).await {
            Ok(Some(stream)) => {
                tracing::info!(host = %config.firehose_host, ?resume, "subscribed to the firehose");
                // The dwell clock starts after the handshake; time
                // spent connecting does not count as streaming.
                let started = tokio::time::Instant::now();
                match stream_frames(config, stream, &frame_tx, &shutdown).await {
                    Ok(()) => break,
                    Err(err) => (Some(started.elapsed()), err),
                }
            }
            Ok(None) => break,
            Err(err) => (None, err),
        };
        if shutdown.is_cancelled() {
            break;
        }
        if sustained_streaming(streamed, stable_after) {
            backoff.reset();
        }
        // next_delay is unbounded here; reconnect forever.
        let delay = backoff.next_delay().unwrap_or_default();
        tracing::warn!(error = %err, ?delay, "firehose connection lost, reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    tracing::info!("connection task exited");
}

/// Opens one websocket session under a connect timeout. `Ok(None)`
/// means shutdown arrived while connecting.
async fn open_session(
    config: &Config,
    client: &FirehoseClient,
    resume: Option<i64>,
    shutdown: &CancellationToken,
) -> Result<Option<WsStream>, IngestError> {
    tokio::select! {
        connected = tokio::time::timeout(config.connect_timeout(), client.connect(resume)) => {
            match connected {
                Ok(Ok(stream)) => Ok(Some(stream)),
                Ok(Err(err)) => Err(err.into()),
                Err(_) => Err(IngestError::ConnectTimeout),
            }
        }
        _ = shutdown.cancelled() => Ok(None),
    }
}

/// Whether a session lived long enough to count as healthy. A failed
/// connect never did, however long it stalled (`streamed` is `None`).
fn sustained_streaming(streamed: Option<Duration>, stable_after: Duration) -> bool {
    streamed.is_some_and(|spent| spent >= stable_after)
}

/// Reads one established session to completion. Returns `Ok(())` only
/// on shutdown; every other exit is an error that triggers a reconnect.
async fn stream_frames(
    config: &Config,
    mut stream: WsStream,
    frame_tx: &mpsc::Sender<Vec<u8>>,
    shutdown: &CancellationToken,
) -> Result<(), IngestError> {
    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(config.read_timeout(), stream.next()) => next,
            _ = shutdown.cancelled() => {
                let _ = stream.close(None).await;
                return Ok(());
            }
        };
        let message = match next {
            Ok(Some(message)) => message?,
            Ok(None) => return Err(IngestError::StreamClosed),
            Err(_) => return Err(IngestError::ReadTimeout),
        };
        match message {
            Message::Binary(payload) => {
                // A full queue blocks here, which is the backpressure
                // propagating up to the firehose read.
                if frame_tx.send(payload).await.is_err() {
                    return Ok(());
                }
            }
            Message::Close(_) => return Err(IngestError::StreamClosed),
            // Tungstenite answers pings itself on the next read.
            _ => {}
        }
    }
}

/// One classifier worker: pulls raw frames off the shared queue until
/// it closes.
async fn classify_worker(
    id: usize,
    frame_rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    resolver: Arc<IdentityResolver>,
    routes: Routes,
    cursor: Arc<AtomicI64>,
    counters: Arc<Counters>,
) {
    loop {
        let frame = {
            let mut rx = frame_rx.lock().await;
            rx.recv().await
        };
        let Some(frame) = frame else { break };
        if let Err(err) = process_frame(frame, &resolver, &routes, &cursor, &counters).await {
            tracing::warn!(worker = id, error = %err, "frame dropped");
        }
    }
    tracing::debug!(worker = id, "classifier worker exited");
}

async fn process_frame(
    payload: Vec<u8>,
    resolver: &IdentityResolver,
    routes: &Routes,
    cursor: &AtomicI64,
    counters: &Counters,
) -> Result<(), IngestError> {
    let (tag, body) = match Frame::try_from(payload)? {
        Frame::Message { t, body } => (t, body),
        Frame::Error { .. } => {
            tracing::warn!("received an error frame from the firehose");
            return Ok(());
        }
    };
    let Some(event) = interpret(&tag, &body).await? else {
        return Ok(());
    };
    if let Some(seq) = event.seq() {
        cursor.fetch_max(seq, Ordering::AcqRel);
    }
    let commit = match event {
        FirehoseEvent::Commit(commit) => commit,
        FirehoseEvent::Passive { .. } => return Ok(()),
    };
    counters.commits.fetch_add(1, Ordering::Relaxed);
    process_commit(commit, resolver, routes, counters).await
}

async fn process_commit(
    commit: RepoCommit,
    resolver: &IdentityResolver,
    routes: &Routes,
    counters: &Counters,
) -> Result<(), IngestError> {
    let identity = match resolver.resolve(&commit.did).await {
        Ok(Some(identity)) => identity,
        Ok(None) => Identity::unresolved(&commit.did),
        Err(err) => {
            // Not cached, so the next sighting of this DID retries.
            tracing::warn!(did = %commit.did, error = %err, "handle resolution degraded");
            Identity::unresolved(&commit.did)
        }
    };
    if routes.users.send(identity).await.is_err() {
        return Ok(());
    }
    for op in &commit.ops {
        let Some(record) = classify(&commit, op) else {
            continue;
        };
        let sent = match record {
            DecodedRecord::Post(post) => routes.posts.send(post).await.is_ok(),
            DecodedRecord::Like(like) => routes.likes.send(like).await.is_ok(),
            DecodedRecord::Repost(repost) => routes.reposts.send(repost).await.is_ok(),
            DecodedRecord::Follow(_) => {
                // No follows table yet; observed but not persisted.
                counters.follows.fetch_add(1, Ordering::Relaxed);
                true
            }
            DecodedRecord::Unhandled { collection } => {
                tracing::debug!(%collection, "unhandled collection");
                counters.unhandled.fetch_add(1, Ordering::Relaxed);
                true
            }
        };
        if !sent {
            return Ok(());
        }
    }
    Ok(())
}
