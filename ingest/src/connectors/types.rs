use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A configured remote origin. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: String,
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    pub authorization_id: String,
}

impl Source {
    pub fn new(
        id: impl Into<String>,
        source_type: impl Into<String>,
        config: HashMap<String, String>,
        authorization_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_type: source_type.into(),
            config,
            authorization_id: authorization_id.into(),
        }
    }

    /// Non-empty setting value, trimmed.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Positive page size capped at `max`. Zero, negative or non-numeric
    /// values fall back to `default`.
    pub fn page_size(&self, default: u32, max: u32) -> u32 {
        self.setting("page_size")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .map(|v| v.min(max as i64) as u32)
            .unwrap_or(default)
            .min(max)
    }

    /// Positive integer setting, `default` otherwise.
    pub fn positive_setting(&self, key: &str, default: u32) -> u32 {
        self.setting(key)
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(default)
    }

    /// Comma separated list setting.
    pub fn list_setting(&self, key: &str) -> Vec<String> {
        self.setting(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Path / type / size filters read from a source's settings
/// (`include_paths`, `exclude_paths`, `file_types`, `max_file_size`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncFilters {
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    /// Extensions without the dot; `*` matches anything
    pub file_types: Vec<String>,
    pub max_file_size: Option<u64>,
}

impl SyncFilters {
    pub fn from_source(source: &Source) -> Self {
        Self {
            include_paths: source.list_setting("include_paths"),
            exclude_paths: source.list_setting("exclude_paths"),
            file_types: source
                .list_setting("file_types")
                .into_iter()
                .map(|t| t.trim_start_matches('.').to_lowercase())
                .collect(),
            max_file_size: source
                .setting("max_file_size")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0),
        }
    }

    pub fn matches(&self, path: &str, name: &str, size: Option<u64>) -> bool {
        if !self.include_paths.is_empty() && !self.include_paths.iter().any(|p| path.contains(p.as_str())) {
            return false;
        }

        if self.exclude_paths.iter().any(|p| path.contains(p.as_str())) {
            return false;
        }

        if !self.file_types.is_empty() {
            let extension = std::path::Path::new(name)
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("")
                .to_lowercase();
            if !self.file_types.iter().any(|ft| *ft == extension || ft == "*") {
                return false;
            }
        }

        match (self.max_file_size, size) {
            (Some(max), Some(size)) => size <= max,
            _ => true,
        }
    }
}

/// Declarative capability flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub incremental: bool,
    pub hierarchy: bool,
    pub binary_content: bool,
    pub requires_auth: bool,
    pub pagination: bool,
    pub rate_limiting: bool,
}

/// One synced item. Ownership passes downstream once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub source_id: String,
    /// Provider-prefixed URI, unique within the source and stable across runs
    pub uri: String,
    pub mime_type: String,
    /// Absent above the size ceiling or when the fetch failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Folder, thread, series or conversation this item belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uri: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocumentChange {
    pub change_type: ChangeType,
    pub document: RawDocument,
}

/// Counts reported with every successful run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Documents or upsert changes pushed downstream
    pub emitted: usize,
    /// Deletion changes pushed downstream
    pub deleted: usize,
    /// Items dropped by the inclusion filter
    pub filtered: usize,
    pub content_fetch_failures: usize,
    pub content_skipped_oversize: usize,
    pub sub_resources_synced: usize,
    pub sub_resources_failed: Vec<String>,
    /// Sub-resources re-enumerated after their resume token expired
    pub sub_resources_reset: Vec<String>,
}

/// Successful terminal value of a sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncComplete {
    /// Encoded cursor to persist for the next incremental run
    pub cursor: String,
    pub stats: SyncStats,
}

/// Provider-side partition of a source's corpus with its own resume token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubResource {
    pub id: String,
    pub name: String,
}

impl SubResource {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// An item as listed by a provider, before filtering and content fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteItem {
    pub uri: String,
    pub mime_type: String,
    pub metadata: HashMap<String, String>,
    pub parent_uri: Option<String>,
    /// Advertised size in bytes, if the provider reports one
    pub size: Option<u64>,
    /// Provider handle used to download content (id, path, ...)
    pub content_ref: Option<String>,
    /// Content delivered with the listing itself (event bodies)
    pub inline_content: Option<Vec<u8>>,
}

impl RemoteItem {
    pub fn new(uri: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mime_type: mime_type.into(),
            ..Default::default()
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub(crate) fn into_document(self, source_id: &str, content: Option<Vec<u8>>) -> RawDocument {
        RawDocument {
            source_id: source_id.to_string(),
            uri: self.uri,
            mime_type: self.mime_type,
            content,
            metadata: self.metadata,
            parent_uri: self.parent_uri,
        }
    }
}

/// One entry of a provider change query.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Upsert {
        change_type: ChangeType,
        item: RemoteItem,
    },
    /// Tombstone: only the URI (and whatever metadata the provider sent)
    Removed {
        uri: String,
        metadata: HashMap<String, String>,
    },
}

impl RemoteChange {
    pub fn updated(item: RemoteItem) -> Self {
        RemoteChange::Upsert {
            change_type: ChangeType::Updated,
            item,
        }
    }

    pub fn removed(uri: impl Into<String>) -> Self {
        RemoteChange::Removed {
            uri: uri.into(),
            metadata: HashMap::new(),
        }
    }
}

/// One page of a listing or change query.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Continue with this token; `None` when the query is exhausted
    pub next_page: Option<String>,
    /// New resume token, delivered with the final page
    pub resume_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>, resume_token: Option<String>) -> Self {
        Self {
            items,
            next_page: None,
            resume_token,
        }
    }

    pub fn more(items: Vec<T>, next_page: impl Into<String>) -> Self {
        Self {
            items,
            next_page: Some(next_page.into()),
            resume_token: None,
        }
    }
}
