use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use super::cursor::TokenMap;
use super::error::{ConnectorError, ConnectorResult};
use super::graph::{self, GraphClient, GraphPage, Recipient};
use super::rate_limiter::RateLimitConfig;
use super::sync::SyncConnector;
use super::traits::{Connector, ConnectorFactory, CredentialProvider, SyncProvider};
use super::types::*;
use crate::config::IngestConfig;

pub const CONNECTOR_TYPE: &str = "outlook";

const MESSAGE_FIELDS: &str = "subject,from,receivedDateTime,conversationId,internetMessageId,webLink,hasAttachments,isDraft,createdDateTime,lastModifiedDateTime";

/// Outlook mail connector
pub type OutlookConnector = SyncConnector<OutlookProvider>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailFolder {
    id: String,
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
    subject: Option<String>,
    from: Option<Recipient>,
    received_date_time: Option<String>,
    conversation_id: Option<String>,
    internet_message_id: Option<String>,
    web_link: Option<String>,
    has_attachments: Option<bool>,
    is_draft: Option<bool>,
    created_date_time: Option<String>,
    last_modified_date_time: Option<String>,
}

/// Wire glue for `messages/delta`, one delta token per mail folder.
pub struct OutlookProvider {
    graph: GraphClient,
    /// Folder ids or well-known names (`inbox`, `sentitems`, ...)
    mail_folders: Vec<String>,
}

impl OutlookProvider {
    pub fn new(source: &Source, config: &IngestConfig) -> ConnectorResult<Self> {
        let mut mail_folders = source.list_setting("mail_folders");
        if mail_folders.is_empty() {
            mail_folders.push("inbox".to_string());
        }

        Ok(Self {
            graph: GraphClient::new(source, config)?,
            mail_folders,
        })
    }

    pub fn factory(config: IngestConfig) -> OutlookConnectorFactory {
        OutlookConnectorFactory { config }
    }

    async fn delta_page(&self, bearer: &str, url: &str) -> ConnectorResult<GraphPage<GraphMessage>> {
        self.graph.get_json(bearer, url, "messages/delta").await
    }
}

fn message_uri(id: &str) -> String {
    format!("outlook://messages/{}", id)
}

fn to_item(folder_id: &str, message: GraphMessage) -> RemoteItem {
    let mut metadata = HashMap::new();
    metadata.insert("folder_id".to_string(), folder_id.to_string());
    metadata.insert("message_id".to_string(), message.id.clone());
    let optional = [
        ("subject", message.subject),
        ("from", message.from.as_ref().and_then(|f| f.address().map(str::to_string))),
        ("received_at", message.received_date_time),
        ("conversation_id", message.conversation_id.clone()),
        ("internet_message_id", message.internet_message_id),
        ("web_link", message.web_link),
        ("has_attachments", message.has_attachments.map(|v| v.to_string())),
        ("is_draft", message.is_draft.map(|v| v.to_string())),
        ("created_at", message.created_date_time),
        ("modified_at", message.last_modified_date_time),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            metadata.insert(key.to_string(), value);
        }
    }

    RemoteItem {
        uri: message_uri(&message.id),
        mime_type: "message/rfc822".to_string(),
        metadata,
        parent_uri: message
            .conversation_id
            .map(|c| format!("outlook://conversations/{}", c)),
        size: None,
        content_ref: Some(message.id),
        inline_content: None,
    }
}

fn to_change(folder_id: &str, message: GraphMessage) -> RemoteChange {
    if message.removed.is_some() {
        let mut metadata = HashMap::new();
        metadata.insert("folder_id".to_string(), folder_id.to_string());
        return RemoteChange::Removed {
            uri: message_uri(&message.id),
            metadata,
        };
    }

    let change_type = graph::change_type(
        message.created_date_time.as_deref(),
        message.last_modified_date_time.as_deref(),
    );
    RemoteChange::Upsert {
        change_type,
        item: to_item(folder_id, message),
    }
}

#[async_trait]
impl SyncProvider for OutlookProvider {
    type Payload = TokenMap;

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
        self.graph.me(bearer).await
    }

    async fn list_sub_resources(&self, bearer: &str) -> ConnectorResult<Vec<SubResource>> {
        let mut subs = Vec::with_capacity(self.mail_folders.len());
        for name in &self.mail_folders {
            let url = self.graph.url(&format!(
                "/me/mailFolders/{}?$select=id,displayName",
                urlencoding::encode(name)
            ));
            match self.graph.get_json::<MailFolder>(bearer, &url, "mailFolders").await {
                Ok(folder) => subs.push(SubResource::new(folder.id, folder.display_name)),
                Err(ConnectorError::NotFound(_)) => {
                    warn!(folder = %name, "Mail folder not found, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(subs)
    }

    async fn list_page(
        &self,
        bearer: &str,
        sub: &SubResource,
        page_token: Option<&str>,
    ) -> ConnectorResult<Page<RemoteItem>> {
        let url = match page_token {
            Some(link) => link.to_string(),
            None => self.graph.url(&format!(
                "/me/mailFolders/{}/messages/delta?$select={}",
                urlencoding::encode(&sub.id),
                MESSAGE_FIELDS
            )),
        };
        let page = self.delta_page(bearer, &url).await?;
        Ok(page.into_page(|message| {
            let removed = message.removed.is_some();
            let item = to_item(&sub.id, message);
            if removed {
                item.with_meta("removed", "true")
            } else {
                item
            }
        }))
    }

    async fn changes_page(
        &self,
        bearer: &str,
        sub: &SubResource,
        token: &str,
    ) -> ConnectorResult<Page<RemoteChange>> {
        let page = self.delta_page(bearer, token).await?;
        Ok(page.into_page(|message| to_change(&sub.id, message)))
    }

    fn include(&self, item: &RemoteItem) -> bool {
        item.meta("removed") != Some("true")
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
            .ok_or_else(|| ConnectorError::HttpError(format!("{} has no message id", item.uri)))?;
        let url = self
            .graph
            .url(&format!("/me/messages/{}/$value", urlencoding::encode(id)));
        self.graph
            .get_bytes(bearer, &url, "messages/$value", max_bytes)
            .await
    }
}

/// Factory for creating Outlook mail connectors
pub struct OutlookConnectorFactory {
    config: IngestConfig,
}

impl ConnectorFactory for OutlookConnectorFactory {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn create(
        &self,
        source: Source,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        let provider = OutlookProvider::new(&source, &self.config)?;
        let limits = RateLimitConfig::from_source(&source, RateLimitConfig::microsoft_graph());
        info!(source_id = %source.id, folders = ?provider.mail_folders, "Creating Outlook connector");

        Ok(Box::new(SyncConnector::new(
            source,
            provider,
            credentials,
            limits,
            self.config.max_content_bytes,
        )))
    }
}
