use std::collections::HashMap;
use std::sync::Arc;

use conhub_ingest::connectors::{
    ChangeType, Connector, ConnectorError, ConnectorRegistry, Cursor, Source, StaticTokenProvider, TokenMap,
};
use conhub_ingest::IngestConfig;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn connector_for(server: &MockServer, config: IngestConfig, folders: &str) -> Box<dyn Connector> {
    let mut settings: HashMap<String, String> = HashMap::new();
    settings.insert("api_base_url".into(), server.uri());
    settings.insert("rate_limit_per_second".into(), "1000".into());
    settings.insert("rate_limit_burst".into(), "1000".into());
    settings.insert("mail_folders".into(), folders.into());

    ConnectorRegistry::with_defaults(&config)
        .create_connector(
            Source::new("mail-1", "outlook", settings, "auth-1"),
            Arc::new(StaticTokenProvider::new("auth-1", "token")),
        )
        .unwrap()
}

fn message(id: &str, subject: &str) -> serde_json::Value {
    json!({
        "id": id,
        "subject": subject,
        "conversationId": "conv-1",
        "from": {"emailAddress": {"name": "Ana", "address": "ana@example.com"}},
        "createdDateTime": "2024-05-01T08:00:00Z",
        "lastModifiedDateTime": "2024-05-02T08:00:00Z"
    })
}

async fn mount_inbox(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/me/mailFolders/inbox"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "inbox-id",
            "displayName": "Inbox"
        })))
        .mount(server)
        .await;
}

async fn mount_mime(server: &MockServer, id: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!("/me/messages/{}/$value", id)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn full_sync_pages_delta_and_skips_missing_folders() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_inbox(&server).await;

    Mock::given(method("GET"))
        .and(path("/me/mailFolders/archive"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"code": "ErrorItemNotFound"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/me/mailFolders/inbox-id/messages/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [message("m1", "Hello")],
            "@odata.nextLink": format!("{}/inbox/page2", base)
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/inbox/page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [message("m2", "Re: Hello"), {"id": "m0", "@removed": {"reason": "deleted"}}],
            "@odata.deltaLink": format!("{}/inbox/delta1", base)
        })))
        .expect(1)
        .mount(&server)
        .await;

    mount_mime(&server, "m1", b"Subject: Hello\r\n\r\nhi".to_vec()).await;
    mount_mime(&server, "m2", b"Subject: Re: Hello\r\n\r\nyo".to_vec()).await;

    let connector = connector_for(&server, IngestConfig::default(), "inbox,archive");
    let (docs, outcome) = connector.full_sync(CancellationToken::new()).collect().await;
    let done = outcome.unwrap();

    let uris: Vec<_> = docs.iter().map(|d| d.uri.as_str()).collect();
    assert_eq!(uris, vec!["outlook://messages/m1", "outlook://messages/m2"]);
    assert_eq!(docs[0].mime_type, "message/rfc822");
    assert_eq!(docs[0].content.as_deref(), Some(&b"Subject: Hello\r\n\r\nhi"[..]));
    assert_eq!(docs[0].parent_uri.as_deref(), Some("outlook://conversations/conv-1"));
    assert_eq!(done.stats.filtered, 1);
    assert_eq!(done.stats.sub_resources_synced, 1);

    let cursor = Cursor::<TokenMap>::decode(&done.cursor).unwrap();
    assert_eq!(cursor.token("inbox-id"), format!("{}/inbox/delta1", base));
    assert_eq!(cursor.token("archive"), "");
}

#[tokio::test]
async fn server_error_naming_404_is_not_a_missing_folder() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/me/mailFolders/inbox"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream returned 404"))
        .mount(&server)
        .await;

    let connector = connector_for(&server, IngestConfig::default(), "inbox");
    let (docs, outcome) = connector.full_sync(CancellationToken::new()).collect().await;

    assert!(docs.is_empty());
    assert!(matches!(outcome, Err(ConnectorError::HttpError(_))));
}

#[tokio::test]
async fn oversized_mime_body_is_not_kept() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_inbox(&server).await;

    Mock::given(method("GET"))
        .and(path("/me/mailFolders/inbox-id/messages/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [message("big", "Attachment"), message("small", "Note")],
            "@odata.deltaLink": format!("{}/inbox/delta1", base)
        })))
        .mount(&server)
        .await;

    mount_mime(&server, "big", vec![b'a'; 4 * 1024 * 1024]).await;
    mount_mime(&server, "small", b"tiny".to_vec()).await;

    let config = IngestConfig {
        max_content_bytes: 16,
        ..IngestConfig::default()
    };
    let connector = connector_for(&server, config, "inbox");
    let (docs, outcome) = connector.full_sync(CancellationToken::new()).collect().await;
    let done = outcome.unwrap();

    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].content, None);
    assert_eq!(docs[1].content.as_deref(), Some(&b"tiny"[..]));
    assert_eq!(done.stats.content_skipped_oversize, 1);
    assert_eq!(done.stats.content_fetch_failures, 0);
}

#[tokio::test]
async fn incremental_emits_deletions_and_updates_per_folder() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_inbox(&server).await;

    Mock::given(method("GET"))
        .and(path("/inbox/delta1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"id": "m1", "@removed": {"reason": "deleted"}}, message("m2", "Edited")],
            "@odata.deltaLink": format!("{}/inbox/delta2", base)
        })))
        .expect(1)
        .mount(&server)
        .await;

    mount_mime(&server, "m2", b"edited".to_vec()).await;

    let connector = connector_for(&server, IngestConfig::default(), "inbox");
    let prior = Cursor::with_payload(TokenMap::from_pairs([("inbox-id", format!("{}/inbox/delta1", base))])).encode();
    let (changes, outcome) = connector
        .incremental_sync(CancellationToken::new(), &prior)
        .collect()
        .await;
    let done = outcome.unwrap();

    let seen: Vec<_> = changes
        .iter()
        .map(|c| (c.change_type, c.document.uri.as_str()))
        .collect();
    assert_eq!(
        seen,
        vec![
            (ChangeType::Deleted, "outlook://messages/m1"),
            (ChangeType::Updated, "outlook://messages/m2"),
        ]
    );
    assert_eq!(changes[0].document.content, None);
    assert_eq!(changes[1].document.content.as_deref(), Some(&b"edited"[..]));

    let cursor = Cursor::<TokenMap>::decode(&done.cursor).unwrap();
    assert_eq!(cursor.token("inbox-id"), format!("{}/inbox/delta2", base));
}
