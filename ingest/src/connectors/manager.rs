use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::dropbox::DropboxProvider;
use super::error::ConnectorError;
use super::google_drive::GoogleDriveProvider;
use super::ms_calendar::MsCalendarProvider;
use super::outlook::OutlookProvider;
use super::traits::{Connector, ConnectorFactory, CredentialProvider};
use super::types::Source;
use crate::config::IngestConfig;

/// Maps a source type string to the factory that builds its connector.
///
/// Populated at startup and read-mostly afterwards; safe to share.
pub struct ConnectorRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ConnectorFactory>>>,
}

impl ConnectorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with every built-in connector
    pub fn with_defaults(config: &IngestConfig) -> Self {
        let registry = Self::new();
        info!("Registering default connectors");

        registry.register(Arc::new(DropboxProvider::factory(config.clone())));
        registry.register(Arc::new(GoogleDriveProvider::factory(config.clone())));
        registry.register(Arc::new(MsCalendarProvider::factory(config.clone())));
        registry.register(Arc::new(OutlookProvider::factory(config.clone())));

        info!(count = registry.factories.read().len(), "Registered connectors");
        registry
    }

    /// Add or replace the factory for its connector type
    pub fn register(&self, factory: Arc<dyn ConnectorFactory>) {
        let connector_type = factory.connector_type().to_string();
        debug!(connector_type = %connector_type, "Registering connector factory");
        self.factories.write().insert(connector_type, factory);
    }

    /// Registered type strings, sorted
    pub fn available_connectors(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_registered(&self, connector_type: &str) -> bool {
        self.factories.read().contains_key(connector_type)
    }

    /// Build a connector for `source`, chosen by `source.source_type`
    pub fn create_connector(
        &self,
        source: Source,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        let factory = self
            .factories
            .read()
            .get(&source.source_type)
            .cloned()
            .ok_or_else(|| ConnectorError::UnsupportedSourceType(source.source_type.clone()))?;

        factory.create(source, credentials)
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::credentials::StaticTokenProvider;

    fn credentials() -> Arc<dyn CredentialProvider> {
        Arc::new(StaticTokenProvider::new("auth-1", "token"))
    }

    #[test]
    fn test_defaults_registered() {
        let registry = ConnectorRegistry::with_defaults(&IngestConfig::default());
        assert_eq!(
            registry.available_connectors(),
            vec!["dropbox", "google_drive", "ms_calendar", "outlook"]
        );
        assert!(registry.is_registered("outlook"));
        assert!(!ConnectorRegistry::new().is_registered("outlook"));
    }

    #[test]
    fn test_unknown_type_is_named_in_error() {
        let registry = ConnectorRegistry::with_defaults(&IngestConfig::default());
        let source = Source::new("s1", "sharepoint", HashMap::new(), "auth-1");

        match registry.create_connector(source, credentials()) {
            Err(ConnectorError::UnsupportedSourceType(t)) => assert_eq!(t, "sharepoint"),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("sharepoint should not be registered"),
        }
    }

    #[test]
    fn test_creates_connector_for_source() {
        let registry = ConnectorRegistry::with_defaults(&IngestConfig::default());
        let source = Source::new("s1", "ms_calendar", HashMap::new(), "auth-1");

        let connector = registry.create_connector(source, credentials()).unwrap();
        assert_eq!(connector.connector_type(), "ms_calendar");
        assert_eq!(connector.source_id(), "s1");
        assert!(connector.capabilities().incremental);
        assert!(!connector.capabilities().binary_content);
    }
}
