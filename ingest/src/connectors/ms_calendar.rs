use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use super::cursor::TokenMap;
use super::error::{ConnectorError, ConnectorResult};
use super::graph::{self, GraphClient, GraphPage, Recipient};
use super::rate_limiter::RateLimitConfig;
use super::sync::SyncConnector;
use super::traits::{Connector, ConnectorFactory, CredentialProvider, SyncProvider};
use super::types::*;
use crate::config::IngestConfig;

pub const CONNECTOR_TYPE: &str = "ms_calendar";

const DEFAULT_WINDOW_DAYS: u32 = 365;

/// Microsoft 365 calendar connector
pub type MsCalendarConnector = SyncConnector<MsCalendarProvider>;

#[derive(Debug, Deserialize)]
struct GraphCalendar {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DateTimeTimeZone {
    date_time: String,
    time_zone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Location {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphEvent {
    id: String,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
    subject: Option<String>,
    body: Option<ItemBody>,
    start: Option<DateTimeTimeZone>,
    end: Option<DateTimeTimeZone>,
    location: Option<Location>,
    organizer: Option<Recipient>,
    web_link: Option<String>,
    is_cancelled: Option<bool>,
    is_all_day: Option<bool>,
    series_master_id: Option<String>,
    #[serde(rename = "type")]
    event_type: Option<String>,
    created_date_time: Option<String>,
    last_modified_date_time: Option<String>,
}

/// Wire glue for `calendarView/delta`, one delta token per calendar.
pub struct MsCalendarProvider {
    graph: GraphClient,
    calendar_ids: Vec<String>,
    window_days_past: u32,
    window_days_future: u32,
}

impl MsCalendarProvider {
    pub fn new(source: &Source, config: &IngestConfig) -> ConnectorResult<Self> {
        Ok(Self {
            graph: GraphClient::new(source, config)?,
            calendar_ids: source.list_setting("calendar_ids"),
            window_days_past: source.positive_setting("window_days_past", DEFAULT_WINDOW_DAYS),
            window_days_future: source.positive_setting("window_days_future", DEFAULT_WINDOW_DAYS),
        })
    }

    pub fn factory(config: IngestConfig) -> MsCalendarConnectorFactory {
        MsCalendarConnectorFactory { config }
    }

    fn initial_delta_url(&self, calendar_id: &str) -> String {
        let now = Utc::now();
        let start = (now - Duration::days(self.window_days_past as i64)).to_rfc3339_opts(SecondsFormat::Secs, true);
        let end = (now + Duration::days(self.window_days_future as i64)).to_rfc3339_opts(SecondsFormat::Secs, true);

        self.graph.url(&format!(
            "/me/calendars/{}/calendarView/delta?startDateTime={}&endDateTime={}",
            urlencoding::encode(calendar_id),
            start,
            end
        ))
    }

    async fn delta_page(&self, bearer: &str, url: &str) -> ConnectorResult<GraphPage<GraphEvent>> {
        self.graph.get_json(bearer, url, "calendarView/delta").await
    }
}

fn event_uri(calendar_id: &str, event_id: &str) -> String {
    format!("mscal://{}/events/{}", calendar_id, event_id)
}

fn to_item(calendar_id: &str, event: GraphEvent) -> RemoteItem {
    let (mime_type, inline_content) = match event.body {
        Some(ItemBody {
            content_type,
            content: Some(content),
        }) => {
            let mime = match content_type.as_deref() {
                Some(t) if t.eq_ignore_ascii_case("html") => "text/html",
                _ => "text/plain",
            };
            (mime, Some(content.into_bytes()))
        }
        _ => ("text/plain", None),
    };

    let mut metadata = HashMap::new();
    metadata.insert("calendar_id".to_string(), calendar_id.to_string());
    metadata.insert("event_id".to_string(), event.id.clone());
    let optional = [
        ("subject", event.subject),
        ("web_link", event.web_link),
        ("event_type", event.event_type),
        ("created_at", event.created_date_time),
        ("modified_at", event.last_modified_date_time),
        ("location", event.location.and_then(|l| l.display_name)),
        ("organizer", event.organizer.as_ref().and_then(|o| o.address().map(str::to_string))),
        ("start", event.start.as_ref().map(|s| s.date_time.clone())),
        ("start_time_zone", event.start.and_then(|s| s.time_zone)),
        ("end", event.end.as_ref().map(|e| e.date_time.clone())),
        ("end_time_zone", event.end.and_then(|e| e.time_zone)),
        ("is_all_day", event.is_all_day.map(|v| v.to_string())),
        ("is_cancelled", event.is_cancelled.map(|v| v.to_string())),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            metadata.insert(key.to_string(), value);
        }
    }

    let parent_uri = match &event.series_master_id {
        Some(master) => event_uri(calendar_id, master),
        None => format!("mscal://{}", calendar_id),
    };

    RemoteItem {
        uri: event_uri(calendar_id, &event.id),
        mime_type: mime_type.to_string(),
        metadata,
        parent_uri: Some(parent_uri),
        size: None,
        content_ref: None,
        inline_content,
    }
}

fn to_change(calendar_id: &str, event: GraphEvent) -> RemoteChange {
    if event.removed.is_some() || event.is_cancelled == Some(true) {
        let mut metadata = HashMap::new();
        metadata.insert("calendar_id".to_string(), calendar_id.to_string());
        if let Some(reason) = event
            .removed
            .as_ref()
            .and_then(|r| r.get("reason"))
            .and_then(|r| r.as_str())
        {
            metadata.insert("removed_reason".to_string(), reason.to_string());
        }
        return RemoteChange::Removed {
            uri: event_uri(calendar_id, &event.id),
            metadata,
        };
    }

    let change_type = graph::change_type(
        event.created_date_time.as_deref(),
        event.last_modified_date_time.as_deref(),
    );
    RemoteChange::Upsert {
        change_type,
        item: to_item(calendar_id, event),
    }
}

#[async_trait]
impl SyncProvider for MsCalendarProvider {
    type Payload = TokenMap;

    fn connector_type(&self) -> &'static str {
        CONNECTOR_TYPE
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            incremental: true,
            hierarchy: true,
            binary_content: false,
            requires_auth: true,
            pagination: true,
            rate_limiting: true,
        }
    }

    async fn validate(&self, bearer: &str) -> ConnectorResult<()> {
        self.graph.me(bearer).await
    }

    async fn list_sub_resources(&self, bearer: &str) -> ConnectorResult<Vec<SubResource>> {
        let calendars: Vec<GraphCalendar> = self
            .graph
            .get_all(bearer, self.graph.url("/me/calendars?$select=id,name"), "calendars")
            .await?;

        let subs: Vec<SubResource> = calendars
            .into_iter()
            .filter(|c| self.calendar_ids.is_empty() || self.calendar_ids.contains(&c.id))
            .map(|c| SubResource::new(c.id, c.name))
            .collect();
        debug!(calendars = subs.len(), "Resolved calendars");
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
            None => self.initial_delta_url(&sub.id),
        };
        let page = self.delta_page(bearer, &url).await?;
        Ok(page.into_page(|event| {
            let removed = event.removed.is_some();
            let item = to_item(&sub.id, event);
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
        Ok(page.into_page(|event| to_change(&sub.id, event)))
    }

    fn include(&self, item: &RemoteItem) -> bool {
        item.meta("removed") != Some("true") && item.meta("is_cancelled") != Some("true")
    }
}

/// Factory for creating Microsoft calendar connectors
pub struct MsCalendarConnectorFactory {
    config: IngestConfig,
}

impl ConnectorFactory for MsCalendarConnectorFactory {
    fn connector_type(&self) -> &str {
        CONNECTOR_TYPE
    }

    fn create(
        &self,
        source: Source,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        let provider = MsCalendarProvider::new(&source, &self.config)?;
        let limits = RateLimitConfig::from_source(&source, RateLimitConfig::microsoft_graph());
        info!(
            source_id = %source.id,
            calendars = ?provider.calendar_ids,
            page_size = provider.graph.page_size(),
            "Creating Microsoft calendar connector"
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
