use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::ConnectorError;
use super::traits::{AuthMethod, CredentialProvider};

/// Fixed bearer token, e.g. a long-lived API key or a token minted upstream.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    authorization_id: String,
    token: String,
    method: AuthMethod,
}

impl StaticTokenProvider {
    pub fn new(authorization_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            authorization_id: authorization_id.into(),
            token: token.into(),
            method: AuthMethod::OAuth2,
        }
    }

    pub fn with_method(mut self, method: AuthMethod) -> Self {
        self.method = method;
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn get_token(&self, cancel: &CancellationToken) -> Result<String, ConnectorError> {
        if cancel.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }
        if self.token.is_empty() {
            return Err(ConnectorError::AuthRequired(format!(
                "no token for authorization {}",
                self.authorization_id
            )));
        }
        Ok(self.token.clone())
    }

    fn authorization_id(&self) -> &str {
        &self.authorization_id
    }

    fn auth_method(&self) -> AuthMethod {
        self.method
    }

    fn is_authenticated(&self) -> bool {
        !self.token.is_empty()
    }
}
