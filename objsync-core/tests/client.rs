use std::time::Duration;

use objsync_core::{
    ApiErrorClass, Credentials, StoreClient, StoreEndpoints, StoreError, Zone, encode_entry,
};
use reqwest::StatusCode;
use serde_json::json;
use wiremock::matchers::{header, header_regex, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn make_client(server: &MockServer) -> StoreClient {
    StoreClient::with_endpoints(
        Credentials::new("access-key", "secret-key"),
        "photos",
        StoreEndpoints::single(&server.uri()).unwrap(),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test]
async fn list_page_sends_signed_management_header() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("bucket", "photos"))
        .and(query_param("prefix", "docs/"))
        .and(query_param("limit", "10"))
        .and(header_regex("authorization", "^QBox access-key:[A-Za-z0-9_=-]+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "marker": "",
            "items": [
                {
                    "key": "docs/a.txt",
                    "fsize": 10,
                    "putTime": 17_000_000_000_000_000i64,
                    "hash": "Fh8xVqod2MQ1mocfI4S4KpRL6D98",
                    "mimeType": "text/plain"
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = make_client(&server);
    let page = client.list_page("docs/", None, 10).await.unwrap();

    assert_eq!(page.items.len(), 1);
    assert_eq!(page.next_marker(), None);
    let entry = &page.items[0];
    assert_eq!(entry.key, "docs/a.txt");
    assert_eq!(entry.size, 10);
    assert_eq!(entry.mod_time_nanos(), 1_700_000_000_000_000_000);
}

#[tokio::test]
async fn list_all_follows_markers_until_exhausted() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/list"))
        .and(query_param("marker", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "key": "b.txt", "fsize": 2, "putTime": 1 }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "marker": "page-2",
            "items": [{ "key": "a.txt", "fsize": 1, "putTime": 1 }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = make_client(&server);
    let items = client.list_all("").await.unwrap();
    let keys: Vec<_> = items.iter().map(|item| item.key.as_str()).collect();

    assert_eq!(keys, vec!["a.txt", "b.txt"]);
}

#[tokio::test]
async fn list_failure_surfaces_status() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
        .mount(&server)
        .await;

    let client = make_client(&server);
    let err = client.list_all("").await.unwrap_err();

    assert!(matches!(
        err,
        StoreError::Api { status, .. } if status == StatusCode::UNAUTHORIZED
    ));
    assert_eq!(err.classification(), Some(ApiErrorClass::Auth));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn delete_posts_encoded_entry() {
    let server = MockServer::start().await;
    let entry = encode_entry("photos", "docs/a.txt");

    Mock::given(method("POST"))
        .and(path(format!("/delete/{entry}")))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(header_regex("authorization", "^QBox access-key:"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = make_client(&server);
    client.delete("docs/a.txt").await.unwrap();
}

#[tokio::test]
async fn delete_of_missing_key_is_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(612).set_body_json(json!({
            "error": "no such file or directory"
        })))
        .mount(&server)
        .await;

    let client = make_client(&server);
    client.delete("gone.txt").await.unwrap();
}

#[tokio::test]
async fn delete_server_error_is_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = make_client(&server);
    let err = client.delete("a.txt").await.unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::Transient));
    assert!(err.is_retryable());
}

#[test]
fn upload_target_points_at_upload_host() {
    let client = StoreClient::with_endpoints(
        Credentials::new("access-key", "secret-key"),
        "photos",
        StoreEndpoints::new("https://up.example", "https://rsf.example", "https://rs.example")
            .unwrap(),
        Duration::from_secs(5),
    )
    .unwrap();

    let target = client.upload_target("docs/a.txt", 1_700_000_000).unwrap();

    assert_eq!(target.url.as_str(), "https://up.example/");
    assert_eq!(target.key, "docs/a.txt");
    assert!(target.token.starts_with("access-key:"));
    assert_eq!(target.token.split(':').count(), 3);
}

#[tokio::test]
async fn endpoints_with_path_keep_it_for_list_and_delete() {
    let server = MockServer::start().await;
    let base = format!("{}/gateway", server.uri());
    let entry = encode_entry("photos", "a.txt");

    Mock::given(method("GET"))
        .and(path("/gateway/list"))
        .and(query_param("bucket", "photos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "marker": "", "items": [] })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/gateway/delete/{entry}")))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = StoreClient::with_endpoints(
        Credentials::new("access-key", "secret-key"),
        "photos",
        StoreEndpoints::single(&base).unwrap(),
        Duration::from_secs(5),
    )
    .unwrap();

    assert!(client.list_page("", None, 10).await.unwrap().items.is_empty());
    client.delete("a.txt").await.unwrap();
    let target = client.upload_target("a.txt", 1_700_000_000).unwrap();
    assert_eq!(target.url.path(), "/gateway/");
}

#[test]
fn zone_parses_english_and_legacy_labels() {
    assert_eq!(Zone::parse("north").unwrap(), Zone::North);
    assert_eq!(Zone::parse("华南").unwrap(), Zone::South);
    assert_eq!(Zone::parse("").unwrap(), Zone::East);
    assert!(matches!(
        Zone::parse("mars"),
        Err(StoreError::UnknownZone(zone)) if zone == "mars"
    ));

    let endpoints = Zone::NorthAmerica.endpoints().unwrap();
    assert_eq!(endpoints.upload.as_str(), "https://up-na0.qiniup.com/");
}
