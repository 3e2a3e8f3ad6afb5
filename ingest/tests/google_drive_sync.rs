use std::collections::HashMap;
use std::sync::Arc;

use conhub_ingest::connectors::{
    ChangeType, Connector, ConnectorRegistry, Cursor, SingleToken, Source, StaticTokenProvider,
};
use conhub_ingest::IngestConfig;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn connector_for(server: &MockServer, config: IngestConfig) -> Box<dyn Connector> {
    let mut settings: HashMap<String, String> = HashMap::new();
    settings.insert("api_base_url".into(), server.uri());
    settings.insert("rate_limit_per_second".into(), "1000".into());
    settings.insert("rate_limit_burst".into(), "1000".into());

    ConnectorRegistry::with_defaults(&config)
        .create_connector(
            Source::new("drive-1", "google_drive", settings, "auth-1"),
            Arc::new(StaticTokenProvider::new("auth-1", "token")),
        )
        .unwrap()
}

fn google_doc(id: &str, name: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "mimeType": "application/vnd.google-apps.document",
        "parents": ["root"],
        "modifiedTime": "2024-05-01T10:00:00Z"
    })
}

fn pdf(id: &str, name: &str, size: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "mimeType": "application/pdf",
        "size": size,
        "parents": ["root"]
    })
}

#[tokio::test]
async fn full_sync_exports_docs_and_resumes_from_start_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/changes/startPageToken"))
        .and(header("authorization", "Bearer token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"startPageToken": "s1"})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files"))
        .and(query_param("q", "trashed = false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [
                google_doc("doc1", "Plan"),
                {"id": "dir1", "name": "Reports", "mimeType": "application/vnd.google-apps.folder"}
            ],
            "nextPageToken": "p2"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files"))
        .and(query_param("pageToken", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [pdf("pdf1", "report.pdf", "4")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files/doc1/export"))
        .and(query_param("mimeType", "text/plain"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"plan text".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files/pdf1"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let connector = connector_for(&server, IngestConfig::default());
    let (docs, outcome) = connector.full_sync(CancellationToken::new()).collect().await;
    let done = outcome.unwrap();

    let uris: Vec<_> = docs.iter().map(|d| d.uri.as_str()).collect();
    assert_eq!(uris, vec!["gdrive://files/doc1", "gdrive://files/pdf1"]);
    assert_eq!(docs[0].mime_type, "text/plain");
    assert_eq!(docs[0].content.as_deref(), Some(&b"plan text"[..]));
    assert_eq!(docs[0].parent_uri.as_deref(), Some("gdrive://files/root"));
    assert_eq!(docs[1].content.as_deref(), Some(&b"%PDF"[..]));
    assert_eq!(done.stats.filtered, 1);

    let resumed = Cursor::<SingleToken>::decode(&done.cursor).unwrap();
    assert_eq!(resumed.payload.token, "s1");

    let requests = server.received_requests().await.unwrap();
    let position = |p: &str| requests.iter().position(|r| r.url.path() == p).unwrap();
    assert!(position("/changes/startPageToken") < position("/files"));
}

#[tokio::test]
async fn incremental_follows_changes_to_new_start_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/changes"))
        .and(query_param("pageToken", "s1"))
        .and(query_param("includeRemoved", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [
                {"fileId": "gone1", "removed": true},
                {"fileId": "bin1", "removed": false, "file": {
                    "id": "bin1", "name": "old.pdf", "mimeType": "application/pdf", "trashed": true
                }}
            ],
            "nextPageToken": "c2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/changes"))
        .and(query_param("pageToken", "c2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [
                {"fileId": "pdf2", "removed": false, "file": pdf("pdf2", "new.pdf", "3")}
            ],
            "newStartPageToken": "s2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files/pdf2"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"v2!".to_vec()))
        .mount(&server)
        .await;

    let connector = connector_for(&server, IngestConfig::default());
    let prior = Cursor::with_payload(SingleToken { token: "s1".into() }).encode();
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
            (ChangeType::Deleted, "gdrive://files/gone1"),
            (ChangeType::Deleted, "gdrive://files/bin1"),
            (ChangeType::Updated, "gdrive://files/pdf2"),
        ]
    );
    assert_eq!(changes[2].document.content.as_deref(), Some(&b"v2!"[..]));
    assert_eq!(Cursor::<SingleToken>::decode(&done.cursor).unwrap().payload.token, "s2");
}

#[tokio::test]
async fn unsized_export_over_ceiling_is_metadata_only() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/changes/startPageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"startPageToken": "s1"})))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [google_doc("doc1", "Huge")]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files/doc1/export"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4096]))
        .expect(1)
        .mount(&server)
        .await;

    let config = IngestConfig {
        max_content_bytes: 16,
        ..IngestConfig::default()
    };
    let connector = connector_for(&server, config);
    let (docs, outcome) = connector.full_sync(CancellationToken::new()).collect().await;
    let done = outcome.unwrap();

    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].content, None);
    assert_eq!(done.stats.content_skipped_oversize, 1);
    assert_eq!(done.stats.content_fetch_failures, 0);
}
