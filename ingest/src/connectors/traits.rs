use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::cursor::CursorPayload;
use super::error::ConnectorError;
use super::sync::SyncStream;
use super::types::*;

/// Main trait that all connectors must implement
#[async_trait]
pub trait Connector: Send + Sync {
    /// Returns the connector type string (e.g. `dropbox`)
    fn connector_type(&self) -> &str;

    fn source_id(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// One cheap authenticated call against the provider
    async fn validate(&self, cancel: &CancellationToken) -> Result<(), ConnectorError>;

    /// Enumerates the whole corpus. Drain the stream, then read the terminal value.
    fn full_sync(&self, cancel: CancellationToken) -> SyncStream<RawDocument>;

    /// Changes since `cursor`, which must come from an earlier run
    fn incremental_sync(&self, cancel: CancellationToken, cursor: &str) -> SyncStream<RawDocumentChange>;

    /// Provider push notifications
    async fn watch(
        &self,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<RawDocumentChange>, ConnectorError>;

    /// Idempotent; every later operation fails with `Closed`
    fn close(&self) -> Result<(), ConnectorError>;
}

/// Factory trait for creating connector instances
pub trait ConnectorFactory: Send + Sync {
    fn connector_type(&self) -> &str;

    fn create(
        &self,
        source: Source,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Box<dyn Connector>, ConnectorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    OAuth2,
    ApiKey,
    None,
}

/// Supplies bearer tokens for one source. Acquisition and refresh happen
/// elsewhere; connectors only ask for a token per call.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self, cancel: &CancellationToken) -> Result<String, ConnectorError>;

    fn authorization_id(&self) -> &str;

    fn auth_method(&self) -> AuthMethod;

    fn is_authenticated(&self) -> bool;
}

/// Provider wire glue driven by [`super::sync::SyncConnector`].
///
/// Implementations only translate requests and responses. Pagination,
/// rate limiting, filtering, content fetching, cursor bookkeeping and retries
/// live in the shared sync loop.
#[async_trait]
pub trait SyncProvider: Send + Sync + 'static {
    type Payload: CursorPayload;

    fn connector_type(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    async fn validate(&self, bearer: &str) -> Result<(), ConnectorError>;

    /// Failure here aborts the run.
    async fn list_sub_resources(&self, bearer: &str) -> Result<Vec<SubResource>, ConnectorError>;

    /// Resume token captured before listing, for providers whose listing
    /// does not hand one back.
    async fn start_token(
        &self,
        _bearer: &str,
        _sub: &SubResource,
    ) -> Result<Option<String>, ConnectorError> {
        Ok(None)
    }

    /// `page_token` is `None` for the first page.
    async fn list_page(
        &self,
        bearer: &str,
        sub: &SubResource,
        page_token: Option<&str>,
    ) -> Result<Page<RemoteItem>, ConnectorError>;

    /// `token` is a stored resume token or the `next_page` of the previous call.
    async fn changes_page(
        &self,
        bearer: &str,
        sub: &SubResource,
        token: &str,
    ) -> Result<Page<RemoteChange>, ConnectorError>;

    fn include(&self, _item: &RemoteItem) -> bool {
        true
    }

    /// `Ok(None)` when the body is larger than `max_bytes`. Implementations
    /// stop reading at the ceiling instead of buffering the whole body.
    async fn fetch_content(
        &self,
        _bearer: &str,
        _item: &RemoteItem,
        _max_bytes: u64,
    ) -> Result<Option<Vec<u8>>, ConnectorError> {
        Err(ConnectorError::NotImplemented(format!(
            "{} content download",
            self.connector_type()
        )))
    }
}
