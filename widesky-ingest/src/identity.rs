//! Handle resolution against the DID directory.
//!
//! A DID is resolved at most once per process: the lookup is wrapped
//! in an in-flight deduplication layer (N concurrent callers for the
//! same DID share one HTTP call) and a never-evicting cache. Lookups
//! retry transient failures with a bounded backoff; on exhaustion the
//! caller persists the DID with empty handle fields, and backfilling
//! is left to a future crawler.

use serde::Deserialize;
use widesky_common::resolver::{CacheConfig, Cached, Resolver, Shared};
use widesky_common::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("lookup retries exhausted for {0}")]
    Exhausted(String),
}

/// The pipeline's view of one actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub did: String,
    /// Handle at first observation; write-once in the store.
    pub first_known_as: Option<String>,
    /// Current handle; follows later resolutions.
    pub also_known_as: Option<String>,
}

impl Identity {
    /// A DID whose handles could not be resolved. Still persisted, so
    /// the actor is never withheld from the store.
    pub fn unresolved(did: &str) -> Self {
        Self { did: did.to_owned(), first_known_as: None, also_known_as: None }
    }
}

/// The subset of a DID document the pipeline cares about.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidDocument {
    #[serde(default)]
    also_known_as: Vec<String>,
}

/// Fetches an actor's handle aliases from the directory, retrying
/// transient failures within a bounded attempt budget.
pub struct DirectoryLookup {
    http: reqwest::Client,
    base_url: String,
    policy: RetryPolicy,
}

impl DirectoryLookup {
    pub fn new(base_url: &str, policy: RetryPolicy) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_owned(), policy })
    }

    async fn fetch(&self, did: &str) -> Result<Option<Identity>, LookupError> {
        let response = self.http.get(format!("{}/{did}", self.base_url)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(LookupError::Status(response.status()));
        }
        let document: DidDocument = response.json().await?;
        // Aliases come scheme-qualified, e.g. "at://jay.bsky.team".
        let handle = document
            .also_known_as
            .first()
            .map(|alias| alias.strip_prefix("at://").unwrap_or(alias).to_owned());
        Ok(Some(Identity {
            did: did.to_owned(),
            first_known_as: handle.clone(),
            also_known_as: handle,
        }))
    }
}

impl Resolver for DirectoryLookup {
    type Input = String;
    type Output = Identity;
    type Error = LookupError;

    async fn resolve(&self, did: &String) -> Result<Option<Identity>, LookupError> {
        let mut backoff = self.policy.backoff();
        loop {
            match self.fetch(did).await {
                Ok(found) => return Ok(found),
                Err(err) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::debug!(%did, error = %err, ?delay, "directory lookup failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(LookupError::Exhausted(did.clone())),
                },
            }
        }
    }
}

/// The full resolution stack: cache over in-flight dedup over the
/// retrying directory lookup.
pub type IdentityResolver = Cached<Shared<DirectoryLookup>>;

pub fn identity_resolver(
    base_url: &str,
    policy: RetryPolicy,
) -> Result<IdentityResolver, LookupError> {
    let lookup = DirectoryLookup::new(base_url, policy)?;
    Ok(Cached::new(Shared::new(lookup), CacheConfig::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2))
            .with_max_attempts(max_attempts)
    }

    const DID: &str = "did:plc:ewvi7nxzyoun6zhxrhs64oiz";

    #[tokio::test]
    async fn resolves_the_first_alias_as_the_handle() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", format!("/{DID}").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"did:plc:ewvi7nxzyoun6zhxrhs64oiz","alsoKnownAs":["at://atproto.com","at://bsky.app"]}"#)
            .create_async()
            .await;

        let lookup =
            DirectoryLookup::new(&server.url(), quick_policy(1)).expect("failed to build lookup");
        let identity = lookup
            .resolve(&DID.to_string())
            .await
            .expect("failed to resolve")
            .expect("expected an identity");
        assert_eq!(identity.did, DID);
        assert_eq!(identity.first_known_as.as_deref(), Some("atproto.com"));
        assert_eq!(identity.also_known_as.as_deref(), Some("atproto.com"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_did_resolves_to_nothing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", format!("/{DID}").as_str())
            .with_status(404)
            .create_async()
            .await;

        let lookup =
            DirectoryLookup::new(&server.url(), quick_policy(1)).expect("failed to build lookup");
        let found = lookup.resolve(&DID.to_string()).await.expect("failed to resolve");
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn server_errors_exhaust_the_retry_budget() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", format!("/{DID}").as_str())
            .with_status(503)
            .expect(3) // initial call plus two retries
            .create_async()
            .await;

        let lookup =
            DirectoryLookup::new(&server.url(), quick_policy(2)).expect("failed to build lookup");
        let result = lookup.resolve(&DID.to_string()).await;
        assert!(matches!(result, Err(LookupError::Exhausted(did)) if did == DID));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn concurrent_resolutions_share_one_directory_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", format!("/{DID}").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"alsoKnownAs":["at://atproto.com"]}"#)
            .expect(1)
            .create_async()
            .await;

        let resolver = Arc::new(
            identity_resolver(&server.url(), quick_policy(1)).expect("failed to build resolver"),
        );
        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move { resolver.resolve(&DID.to_string()).await }));
        }
        for handle in handles {
            let identity = handle
                .await
                .expect("task panicked")
                .expect("failed to resolve")
                .expect("expected an identity");
            assert_eq!(identity.also_known_as.as_deref(), Some("atproto.com"));
        }
        mock.assert_async().await;
    }
}
