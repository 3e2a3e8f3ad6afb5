use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::cursor::SingleToken;
use super::error::{ConnectorError, ConnectorResult};
use super::http;
use super::rate_limiter::RateLimitConfig;
use super::sync::SyncConnector;
use super::traits::{Connector, ConnectorFactory, CredentialProvider, SyncProvider};
use super::types::*;
use crate::config::IngestConfig;

pub const CONNECTOR_TYPE: &str = "dropbox";
pub const DROPBOX_API_BASE: &str = "https://api.dropboxapi.com/2";
pub const DROPBOX_CONTENT_BASE: &str = "https://content.dropboxapi.com/2";

const DEFAULT_PAGE_SIZE: u32 = 500;
const MAX_PAGE_SIZE: u32 = 2000;

/// Dropbox API connector.
///
/// Documents are addressed as `dropbox://files/<id>`. Dropbox deletion
/// entries carry no file id, so a `Deleted` change is addressed as
/// `dropbox://paths<path_lower>` instead and never equals the URI of the
/// document it removes. Match deletions against the `path_lower`
/// metadata that every emitted document and every deletion carries.
pub type DropboxConnector = SyncConnector<DropboxProvider>;

#[derive(Debug, Serialize, Deserialize)]
struct DropboxEntry {
    #[serde(rename = ".tag")]
    tag: String,
    #[serde(default)]
    name: String,
    /// Absent on deleted entries
    id: Option<String>,
    #[serde(default)]
    path_lower: String,
    #[serde(default)]
    path_display: String,
    size: Option<u64>,
    server_modified: Option<String>,
    content_hash: Option<String>,
    rev: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DropboxListFolderResult {
    entries: Vec<DropboxEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct DropboxListFolderRequest<'a> {
    path: &'a str,
    recursive: bool,
    include_deleted: bool,
    include_media_info: bool,
    limit: u32,
}

/// Wire glue for `files/list_folder` and `files/download`.
pub struct DropboxProvider {
    client: Client,
    api_base: String,
    content_base: String,
    /// `""` is the account root
    root_path: String,
    page_size: u32,
    filters: SyncFilters,
}

impl DropboxProvider {
    pub fn new(source: &Source, config: &IngestConfig) -> ConnectorResult<Self> {
        let root_path = match source.setting("root_path") {
            None | Some("/") => String::new(),
            Some(path) if path.starts_with('/') => path.trim_end_matches('/').to_string(),
            Some(path) => {
                return Err(ConnectorError::InvalidConfiguration(format!(
                    "Dropbox root_path must start with '/': {}",
                    path
                )))
            }
        };

        Ok(Self {
            client: http::build_client(config)?,
            api_base: http::base_url(source, "api_base_url", DROPBOX_API_BASE),
            content_base: http::base_url(source, "content_base_url", DROPBOX_CONTENT_BASE),
            root_path,
            page_size: source.page_size(DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE),
            filters: SyncFilters::from_source(source),
        })
    }

    pub fn factory(config: IngestConfig) -> DropboxConnectorFactory {
        DropboxConnectorFactory { config }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    async fn rpc(&self, bearer: &str, endpoint: &str, body: &impl Serialize) -> ConnectorResult<Response> {
        let response = self
            .client
            .post(format!("{}/{}", self.api_base, endpoint))
            .bearer_auth(bearer)
            .json(body)
            .send()
            .await?;
        check(response, endpoint).await
    }

    async fn list_folder(&self, bearer: &str, cursor: Option<&str>) -> ConnectorResult<DropboxListFolderResult> {
        let response = match cursor {
            Some(cursor) => {
                self.rpc(bearer, "files/list_folder/continue", &serde_json::json!({ "cursor": cursor }))
                    .await?
            }
            None => {
                let request = DropboxListFolderRequest {
                    path: &self.root_path,
                    recursive: true,
                    include_deleted: false,
                    include_media_info: false,
                    limit: self.page_size,
                };
                self.rpc(bearer, "files/list_folder", &request).await?
            }
        };
        Ok(response.json().await?)
    }

    fn to_item(&self, entry: DropboxEntry) -> RemoteItem {
        let id = entry.id.unwrap_or_default();
        let mime_type = mime_guess::from_path(&entry.name)
            .first_or_octet_stream()
            .to_string();

        let mut item = RemoteItem::new(format!("dropbox://files/{}", id), mime_type)
            .with_meta("tag", entry.tag.as_str())
            .with_meta("name", entry.name.as_str())
            .with_meta("path_lower", entry.path_lower.as_str())
            .with_meta("path_display", entry.path_display.as_str());
        for (key, value) in [
            ("server_modified", entry.server_modified),
            ("content_hash", entry.content_hash),
            ("rev", entry.rev),
        ] {
            if let Some(value) = value {
                item.metadata.insert(key.to_string(), value);
            }
        }

        item.parent_uri = Some(format!("dropbox://folders{}", parent_path(&entry.path_display)));
        item.size = entry.size;
        if entry.tag == "file" {
            item.content_ref = Some(id);
        }
        item
    }

    fn to_change(&self, entry: DropboxEntry) -> RemoteChange {
        if entry.tag == "deleted" {
            // Tombstones carry no id
            let mut metadata = std::collections::HashMap::new();
            metadata.insert("path_lower".to_string(), entry.path_lower.clone());
            return RemoteChange::Removed {
                uri: format!("dropbox://paths{}", entry.path_lower),
                metadata,
            };
        }
        RemoteChange::updated(self.to_item(entry))
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn into_page<T>(result_cursor: String, has_more: bool, items: Vec<T>) -> Page<T> {
    if has_more {
        Page::more(items, result_cursor)
    } else {
        Page::last(items, Some(result_cursor))
    }
}

/// Dropbox reports an unusable cursor as 409 with a `reset` summary.
async fn check(response: Response, context: &str) -> ConnectorResult<Response> {
    if response.status() != StatusCode::CONFLICT {
        return http::check_response(response, context).await;
    }

    let body = response.text().await.unwrap_or_default();
    if body.contains("reset") {
        return Err(ConnectorError::CursorExpired(format!("{}: {}", context, body)));
    }
    Err(ConnectorError::HttpError(format!(
        "{} failed with {}: {}",
        context,
        StatusCode::CONFLICT,
        body
    )))
}

#[async_trait]
impl SyncProvider for DropboxProvider {
    type Payload = SingleToken;

    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            incremental: true,
            hierarchy: true,
            binary_content: true,
            requires_auth: true,
            pagination: true,
            rate_limiting: true,
        }
    }

    async fn validate(&self, bearer: &str) -> ConnectorResult<()> {
        // Takes no arguments: the body must be the JSON literal `null`
        self.rpc(bearer, "users/get_current_account", &serde_json::Value::Null)
            .await?;
        Ok(())
    }

    async fn list_sub_resources(&self, _bearer: &str) -> ConnectorResult<Vec<SubResource>> {
        let name = if self.root_path.is_empty() { "/" } else { &self.root_path };
        Ok(vec![SubResource::new("root", name)])
    }

    async fn list_page(
        &self,
        bearer: &str,
        _sub: &SubResource,
        page_token: Option<&str>,
    ) -> ConnectorResult<Page<RemoteItem>> {
        let result = self.list_folder(bearer, page_token).await?;
        let items = result.entries.into_iter().map(|e| self.to_item(e)).collect();
        Ok(into_page(result.cursor, result.has_more, items))
    }

    async fn changes_page(
        &self,
        bearer: &str,
        _sub: &SubResource,
        token: &str,
    ) -> ConnectorResult<Page<RemoteChange>> {
        let result = self.list_folder(bearer, Some(token)).await?;
        let changes = result.entries.into_iter().map(|e| self.to_change(e)).collect();
        Ok(into_page(result.cursor, result.has_more, changes))
    }

    fn include(&self, item: &RemoteItem) -> bool {
        if item.meta("tag") != Some("file") {
            return false;
        }
        self.filters.matches(
            item.meta("path_display").unwrap_or(""),
            item.meta("name").unwrap_or(""),
            item.size,
        )
    }

    async fn fetch_content(
        &self,
        bearer: &str,
        item: &RemoteItem,
        max_bytes: u64,
    ) -> ConnectorResult<Option<Vec<u8>>> {
        let path = item
            .content_ref
            .as_deref()
            .ok_or_else(|| ConnectorError::HttpError(format!("{} has no download path", item.uri)))?;

        let response = self
            .client
            .post(format!("{}/files/download", self.content_base))
            .bearer_auth(bearer)
            .header("Dropbox-API-Arg", serde_json::to_string(&serde_json::json!({ "path": path }))?)
            .send()
            .await?;
        let response = check(response, "files/download").await?;
        http::read_capped(response, max_bytes).await
    }
}

/// Factory for creating Dropbox connectors
pub struct DropboxConnectorFactory {
    config: IngestConfig,
}

impl ConnectorFactory for DropboxConnectorFactory {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn create(
        &self,
        source: Source,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        let provider = DropboxProvider::new(&source, &self.config)?;
        let limits = RateLimitConfig::from_source(&source, RateLimitConfig::dropbox());
        info!(source_id = %source.id, page_size = provider.page_size, "Creating Dropbox connector");

        Ok(Box::new(SyncConnector::new(
            source,
            provider,
            credentials,
            limits,
            self.config.max_content_bytes,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn provider_with(pairs: &[(&str, &str)]) -> DropboxProvider {
        let config: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        DropboxProvider::new(&Source::new("s", CONNECTOR_TYPE, config, "a"), &IngestConfig::default()).unwrap()
    }

    fn entry(tag: &str, path: &str) -> DropboxEntry {
        DropboxEntry {
            tag: tag.to_string(),
            name: path.rsplit('/').next().unwrap_or("").to_string(),
            id: (tag != "deleted").then(|| format!("id:{}", path.len())),
            path_lower: path.to_lowercase(),
            path_display: path.to_string(),
            size: Some(3),
            server_modified: None,
            content_hash: None,
            rev: None,
        }
    }

    #[test]
    fn test_page_size_defaults_and_caps() {
        assert_eq!(provider_with(&[]).page_size(), 500);
        assert_eq!(provider_with(&[("page_size", "0")]).page_size(), 500);
        assert_eq!(provider_with(&[("page_size", "9999")]).page_size(), 2000);
    }

    #[test]
    fn test_root_path_must_be_absolute() {
        let source = Source::new(
            "s",
            CONNECTOR_TYPE,
            [("root_path".to_string(), "docs".to_string())].into_iter().collect(),
            "a",
        );
        assert!(matches!(
            DropboxProvider::new(&source, &IngestConfig::default()),
            Err(ConnectorError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_entry_mapping() {
        let provider = provider_with(&[]);
        let item = provider.to_item(entry("file", "/Docs/Plan.txt"));

        assert!(item.uri.starts_with("dropbox://files/id:"));
        assert_eq!(item.mime_type, "text/plain");
        assert_eq!(item.parent_uri.as_deref(), Some("dropbox://folders/Docs"));
        assert_eq!(item.meta("path_lower"), Some("/docs/plan.txt"));
        assert!(item.content_ref.is_some());
        assert!(provider.include(&item));

        let top = provider.to_item(entry("file", "/a.txt"));
        assert_eq!(top.parent_uri.as_deref(), Some("dropbox://folders/"));

        let folder = provider.to_item(entry("folder", "/Docs"));
        assert!(!provider.include(&folder));
    }

    #[test]
    fn test_deleted_entries_become_path_tombstones() {
        let provider = provider_with(&[]);
        match provider.to_change(entry("deleted", "/Docs/Old.md")) {
            RemoteChange::Removed { uri, metadata } => {
                assert_eq!(uri, "dropbox://paths/docs/old.md");
                assert_eq!(metadata.get("path_lower").map(String::as_str), Some("/docs/old.md"));
            }
            other => panic!("expected tombstone, got {:?}", other),
        }
    }
}
