//! Connector sync engine.
//!
//! Pulls documents from remote content providers (Dropbox, Google Drive,
//! Microsoft 365 calendars and mail) through one [`connectors::Connector`]
//! contract: full enumeration, resumable incremental sync via an opaque
//! versioned cursor, per-connector rate limiting, and cancellation.

pub mod config;
pub mod connectors;

pub use config::IngestConfig;
pub use connectors::{
    Connector, ConnectorError, ConnectorRegistry, CredentialProvider, RawDocument, RawDocumentChange, Source,
    SyncComplete, SyncStream,
};
