use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Response};
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

pub const CONNECTOR_TYPE: &str = "google_drive";
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_PAGE_SIZE: u32 = 1000;

const FILE_FIELDS: &str = "id,name,mimeType,createdTime,modifiedTime,size,webViewLink,parents,trashed,md5Checksum";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const GOOGLE_APPS_PREFIX: &str = "application/vnd.google-apps.";

/// Google Drive connector
pub type GoogleDriveConnector = SyncConnector<GoogleDriveProvider>;

#[derive(Debug, Serialize, Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    #[serde(rename = "createdTime")]
    created_time: Option<String>,
    #[serde(rename = "modifiedTime")]
    modified_time: Option<String>,
    /// Drive sends sizes as strings
    size: Option<String>,
    #[serde(rename = "webViewLink")]
    web_view_link: Option<String>,
    parents: Option<Vec<String>>,
    #[serde(default)]
    trashed: bool,
    #[serde(rename = "md5Checksum")]
    md5_checksum: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveChange {
    #[serde(rename = "fileId")]
    file_id: String,
    #[serde(default)]
    removed: bool,
    file: Option<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveChangeList {
    #[serde(default)]
    changes: Vec<DriveChange>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "newStartPageToken")]
    new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartPageToken {
    #[serde(rename = "startPageToken")]
    start_page_token: String,
}

/// Export format for native Google documents, `None` for types that have
/// no text rendition (forms, sites, shortcuts, ...).
fn export_mime(google_mime: &str) -> Option<&'static str> {
    match google_mime {
        "application/vnd.google-apps.document" => Some("text/plain"),
        "application/vnd.google-apps.spreadsheet" => Some("text/csv"),
        "application/vnd.google-apps.presentation" => Some("text/plain"),
        _ => None,
    }
}

/// Wire glue for `files.list` and `changes.list`.
pub struct GoogleDriveProvider {
    client: Client,
    api_base: String,
    /// Limits the corpus to direct children of this folder
    folder_id: Option<String>,
    page_size: u32,
    filters: SyncFilters,
}

impl GoogleDriveProvider {
    pub fn new(source: &Source, config: &IngestConfig) -> ConnectorResult<Self> {
        Ok(Self {
            client: http::build_client(config)?,
            api_base: http::base_url(source, "api_base_url", DRIVE_API_BASE),
            folder_id: source.setting("folder_id").map(str::to_string),
            page_size: source.page_size(DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE),
            filters: SyncFilters::from_source(source),
        })
    }

    pub fn factory(config: IngestConfig) -> GoogleDriveConnectorFactory {
        GoogleDriveConnectorFactory { config }
    }

    async fn get(&self, bearer: &str, path: &str, query: &[(&str, &str)], context: &str) -> ConnectorResult<Response> {
        let response = self
            .client
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(bearer)
            .query(query)
            .send()
            .await?;
        http::check_response(response, context).await
    }

    fn to_item(&self, file: DriveFile) -> RemoteItem {
        let export = export_mime(&file.mime_type);
        let mime_type = export
            .map(str::to_string)
            .unwrap_or_else(|| file.mime_type.clone());

        let mut item = RemoteItem::new(format!("gdrive://files/{}", file.id), mime_type)
            .with_meta("file_id", file.id.as_str())
            .with_meta("name", file.name.as_str())
            .with_meta("google_mime_type", file.mime_type.as_str());
        if let Some(export) = export {
            item = item.with_meta("export_mime_type", export);
        }
        if file.trashed {
            item = item.with_meta("trashed", "true");
        }
        for (key, value) in [
            ("created_at", file.created_time),
            ("modified_at", file.modified_time),
            ("web_view_link", file.web_view_link),
            ("md5_checksum", file.md5_checksum),
        ] {
            if let Some(value) = value {
                item.metadata.insert(key.to_string(), value);
            }
        }

        let parents = file.parents.unwrap_or_default();
        if !parents.is_empty() {
            item.metadata.insert("parents".to_string(), parents.join(","));
        }
        item.parent_uri = parents.first().map(|p| format!("gdrive://files/{}", p));
        item.size = file.size.and_then(|s| s.parse().ok());
        item.content_ref = Some(file.id);
        item
    }

    fn to_change(&self, change: DriveChange) -> RemoteChange {
        match change.file {
            Some(file) if !change.removed && !file.trashed => RemoteChange::updated(self.to_item(file)),
            _ => {
                let mut metadata = HashMap::new();
                metadata.insert("file_id".to_string(), change.file_id.clone());
                RemoteChange::Removed {
                    uri: format!("gdrive://files/{}", change.file_id),
                    metadata,
                }
            }
        }
    }

    fn list_query(&self) -> String {
        match &self.folder_id {
            Some(folder) => format!("trashed = false and '{}' in parents", folder.replace('\'', "\\'")),
            None => "trashed = false".to_string(),
        }
    }
}

#[async_trait]
impl SyncProvider for GoogleDriveProvider {
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
        self.get(bearer, "/about", &[("fields", "user")], "about").await?;
        Ok(())
    }

    async fn list_sub_resources(&self, _bearer: &str) -> ConnectorResult<Vec<SubResource>> {
        let sub = match &self.folder_id {
            Some(folder) => SubResource::new(folder.clone(), folder.clone()),
            None => SubResource::new("root", "My Drive"),
        };
        Ok(vec![sub])
    }

    async fn start_token(&self, bearer: &str, _sub: &SubResource) -> ConnectorResult<Option<String>> {
        let response = self
            .get(bearer, "/changes/startPageToken", &[], "changes/startPageToken")
            .await?;
        let token: StartPageToken = response.json().await?;
        Ok(Some(token.start_page_token))
    }

    async fn list_page(
        &self,
        bearer: &str,
        _sub: &SubResource,
        page_token: Option<&str>,
    ) -> ConnectorResult<Page<RemoteItem>> {
        let page_size = self.page_size.to_string();
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let q = self.list_query();
        let mut query = vec![
            ("pageSize", page_size.as_str()),
            ("fields", fields.as_str()),
            ("q", q.as_str()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let list: DriveFileList = self.get(bearer, "/files", &query, "files.list").await?.json().await?;
        let items = list.files.into_iter().map(|f| self.to_item(f)).collect();
        Ok(match list.next_page_token {
            Some(next) => Page::more(items, next),
            // Resume from the token captured before listing
            None => Page::last(items, None),
        })
    }

    async fn changes_page(
        &self,
        bearer: &str,
        _sub: &SubResource,
        token: &str,
    ) -> ConnectorResult<Page<RemoteChange>> {
        let page_size = self.page_size.to_string();
        let fields = format!(
            "nextPageToken,newStartPageToken,changes(fileId,removed,file({}))",
            FILE_FIELDS
        );
        let query = [
            ("pageToken", token),
            ("pageSize", page_size.as_str()),
            ("fields", fields.as_str()),
            ("includeRemoved", "true"),
        ];

        let list: DriveChangeList = self.get(bearer, "/changes", &query, "changes.list").await?.json().await?;
        let changes = list.changes.into_iter().map(|c| self.to_change(c)).collect();
        Ok(match list.next_page_token {
            Some(next) => Page::more(changes, next),
            None => Page::last(changes, list.new_start_page_token),
        })
    }

    fn include(&self, item: &RemoteItem) -> bool {
        let google_mime = item.meta("google_mime_type").unwrap_or("");
        if google_mime == FOLDER_MIME || item.meta("trashed") == Some("true") {
            return false;
        }
        if google_mime.starts_with(GOOGLE_APPS_PREFIX) && item.meta("export_mime_type").is_none() {
            return false;
        }
        if let Some(folder) = &self.folder_id {
            let in_folder = item
                .meta("parents")
                .map(|p| p.split(',').any(|id| id == folder))
                .unwrap_or(false);
            if !in_folder {
                return false;
            }
        }

        let name = item.meta("name").unwrap_or("");
        self.filters.matches(name, name, item.size)
    }

    async fn fetch_content(
        &self,
        bearer: &str,
        item: &RemoteItem,
        max_bytes: u64,
    ) -> ConnectorResult<Option<Vec<u8>>> {
        let id = item
            .content_ref
            .as_deref()
            .ok_or_else(|| ConnectorError::HttpError(format!("{} has no file id", item.uri)))?;
        let path = format!("/files/{}", urlencoding::encode(id));

        let response = match item.meta("export_mime_type") {
            Some(export) => {
                self.get(bearer, &format!("{}/export", path), &[("mimeType", export)], "files.export")
                    .await?
            }
            None => self.get(bearer, &path, &[("alt", "media")], "files.get").await?,
        };
        http::read_capped(response, max_bytes).await
    }
}

/// Factory for creating Google Drive connectors
pub struct GoogleDriveConnectorFactory {
    config: IngestConfig,
}

impl ConnectorFactory for GoogleDriveConnectorFactory {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn create(
        &self,
        source: Source,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        let provider = GoogleDriveProvider::new(&source, &self.config)?;
        let limits = RateLimitConfig::from_source(&source, RateLimitConfig::google_drive());
        info!(
            source_id = %source.id,
            folder_id = ?provider.folder_id,
            page_size = provider.page_size,
            "Creating Google Drive connector"
        );

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

    fn provider_with(pairs: &[(&str, &str)]) -> GoogleDriveProvider {
        let config = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        GoogleDriveProvider::new(&Source::new("s", CONNECTOR_TYPE, config, "a"), &IngestConfig::default()).unwrap()
    }

    fn file(value: serde_json::Value) -> DriveFile {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_google_docs_are_exported() {
        let provider = provider_with(&[]);
        let item = provider.to_item(file(serde_json::json!({
            "id": "doc1",
            "name": "Roadmap",
            "mimeType": "application/vnd.google-apps.document",
            "parents": ["folderA"]
        })));

        assert_eq!(item.uri, "gdrive://files/doc1");
        assert_eq!(item.mime_type, "text/plain");
        assert_eq!(item.meta("export_mime_type"), Some("text/plain"));
        assert_eq!(item.parent_uri.as_deref(), Some("gdrive://files/folderA"));
        assert!(provider.include(&item));
    }

    #[test]
    fn test_folders_and_unexportable_types_excluded() {
        let provider = provider_with(&[]);
        let folder = provider.to_item(file(serde_json::json!({
            "id": "f1", "name": "Team", "mimeType": FOLDER_MIME
        })));
        let form = provider.to_item(file(serde_json::json!({
            "id": "x1", "name": "Survey", "mimeType": "application/vnd.google-apps.form"
        })));
        let pdf = provider.to_item(file(serde_json::json!({
            "id": "p1", "name": "a.pdf", "mimeType": "application/pdf", "size": "2048"
        })));

        assert!(!provider.include(&folder));
        assert!(!provider.include(&form));
        assert!(provider.include(&pdf));
        assert_eq!(pdf.size, Some(2048));
    }

    #[test]
    fn test_removed_or_trashed_changes_are_deletions() {
        let provider = provider_with(&[]);
        let removed = provider.to_change(DriveChange {
            file_id: "gone".into(),
            removed: true,
            file: None,
        });
        assert!(matches!(removed, RemoteChange::Removed { ref uri, .. } if uri == "gdrive://files/gone"));

        let trashed = provider.to_change(DriveChange {
            file_id: "t1".into(),
            removed: false,
            file: Some(file(serde_json::json!({"id": "t1", "name": "old.txt", "mimeType": "text/plain", "trashed": true}))),
        });
        assert!(matches!(trashed, RemoteChange::Removed { .. }));
    }

    #[test]
    fn test_folder_scope() {
        let provider = provider_with(&[("folder_id", "folderA")]);
        assert_eq!(provider.list_query(), "trashed = false and 'folderA' in parents");

        let outside = provider.to_item(file(serde_json::json!({
            "id": "o1", "name": "x.txt", "mimeType": "text/plain", "parents": ["elsewhere"]
        })));
        assert!(!provider.include(&outside));
    }
}
