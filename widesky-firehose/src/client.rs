//! Websocket session establishment for the firehose subscription.

use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

/// NSID of the repository event stream.
pub const SUBSCRIBE_REPOS_NSID: &str = "com.atproto.sync.subscribeRepos";

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("parsing parameters failed: {0}")]
    ParsingParameters(#[from] serde_html_form::ser::Error),
    #[error("connection error: {0}")]
    Connection(#[from] tungstenite::Error),
}

#[derive(Serialize)]
struct SubscribeReposParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<i64>,
}

/// Opens websocket sessions against one firehose host.
#[derive(Debug, Clone)]
pub struct FirehoseClient {
    host: String,
}

impl FirehoseClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// The subscription URI, with a resumption cursor when one is
    /// known.
    pub fn subscription_uri(&self, cursor: Option<i64>) -> Result<String, ClientError> {
        let mut uri = format!("wss://{}/xrpc/{}", self.host, SUBSCRIBE_REPOS_NSID);
        let query = serde_html_form::to_string(SubscribeReposParams { cursor })?;
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query);
        }
        Ok(uri)
    }

    pub async fn connect(&self, cursor: Option<i64>) -> Result<WsStream, ClientError> {
        let (stream, _) = connect_async(self.subscription_uri(cursor)?).await?;
        Ok(stream)
    }
}
