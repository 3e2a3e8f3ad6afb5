pub mod credentials;
pub mod cursor;
pub mod error;
pub mod graph;
pub mod http;
pub mod manager;
pub mod rate_limiter;
pub mod sync;
pub mod traits;
pub mod types;

pub mod dropbox;
pub mod google_drive;
pub mod ms_calendar;
pub mod outlook;

pub use credentials::StaticTokenProvider;
pub use cursor::{Cursor, CursorPayload, SingleToken, TokenMap, CURSOR_VERSION};
pub use error::{ConnectorError, ConnectorResult};
pub use manager::ConnectorRegistry;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use sync::{SyncConnector, SyncOutcome, SyncStream, MAX_EXPIRED_TOKEN_RETRIES, MAX_THROTTLE_RETRIES};
pub use traits::{AuthMethod, Connector, ConnectorFactory, CredentialProvider, SyncProvider};
pub use types::*;

pub use dropbox::DropboxConnector;
pub use google_drive::GoogleDriveConnector;
pub use ms_calendar::MsCalendarConnector;
pub use outlook::OutlookConnector;
