//! `MailApiSource` against a mock mailbox API.

use std::{sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::json;
use threadline_core::record::{Channel, Direction};
use threadline_sync::{
  RateLimitedClient, RetryPolicy, SourceAdapter, SourceError,
  source::{MailApiSource, StaticToken},
};
use wiremock::{
  Mock, MockServer, ResponseTemplate,
  matchers::{header, method, path, query_param},
};

fn quick_retries() -> RetryPolicy {
  RetryPolicy {
    max_attempts: 3,
    base_delay:   Duration::from_millis(1),
    multiplier:   1.0,
    max_delay:    Duration::from_millis(5),
  }
}

fn source(server: &MockServer) -> MailApiSource {
  MailApiSource::new(
    server.uri(),
    Arc::new(StaticToken::new("secret-token")),
    RateLimitedClient::new(6_000, quick_retries()),
  )
  .unwrap()
}

fn b64(s: &str) -> String { URL_SAFE_NO_PAD.encode(s) }

fn message_json(id: &str, labels: &[&str]) -> serde_json::Value {
  json!({
    "id": id,
    "threadId": "thread-9",
    "labelIds": labels,
    "internalDate": "1700000000000",
    "payload": {
      "mimeType": "multipart/mixed",
      "headers": [
        { "name": "From", "value": "\"Ann Buyer\" <Ann@Example.com>" },
        { "name": "To", "value": "agent@example.com, \"Legal\" <legal@example.com>" },
        { "name": "Subject", "value": "Offer on 12 Elm St" }
      ],
      "parts": [
        {
          "mimeType": "multipart/alternative",
          "parts": [
            { "mimeType": "text/html", "body": { "data": b64("<p>ignored</p>") } },
            { "mimeType": "text/plain", "body": { "data": b64("We accept the offer.") } }
          ]
        },
        {
          "mimeType": "application/pdf",
          "filename": "contract.pdf",
          "body": { "attachmentId": "att-7", "size": 2048 }
        }
      ]
    }
  })
}

#[tokio::test]
async fn lists_and_decodes_messages() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/users/me/messages"))
    .and(header("authorization", "Bearer secret-token"))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({
      "messages": [{ "id": "m1" }, { "id": "m2" }],
      "nextPageToken": "page-2"
    })))
    .mount(&server)
    .await;
  Mock::given(method("GET"))
    .and(path("/users/me/messages/m1"))
    .and(query_param("format", "full"))
    .respond_with(ResponseTemplate::new(200).set_body_json(message_json("m1", &["INBOX"])))
    .mount(&server)
    .await;
  Mock::given(method("GET"))
    .and(path("/users/me/messages/m2"))
    .respond_with(ResponseTemplate::new(200).set_body_json(message_json("m2", &["SENT"])))
    .mount(&server)
    .await;

  let page = source(&server).fetch_raw_records(None).await.unwrap();
  assert_eq!(page.next_cursor.as_deref(), Some("page-2"));
  assert_eq!(page.records.len(), 2);

  let first = &page.records[0];
  assert_eq!(first.external_id, "m1");
  assert_eq!(first.conversation_id.as_deref(), Some("thread-9"));
  assert_eq!(first.channel, Channel::Email);
  assert_eq!(first.direction, Direction::Inbound);
  assert_eq!(first.sender.as_deref(), Some("Ann@Example.com"));
  assert_eq!(first.recipients, vec!["agent@example.com", "legal@example.com"]);
  assert_eq!(first.subject.as_deref(), Some("Offer on 12 Elm St"));
  assert_eq!(first.raw_body.as_deref(), Some("We accept the offer."));
  assert_eq!(first.sent_at.timestamp(), 1_700_000_000);

  let attachment = &first.attachment_refs[0];
  assert_eq!(attachment.external_id, "m1/att-7");
  assert_eq!(attachment.filename.as_deref(), Some("contract.pdf"));
  assert_eq!(attachment.size_hint, Some(2048));

  assert_eq!(page.records[1].direction, Direction::Outbound);
}

#[tokio::test]
async fn page_token_is_forwarded() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/users/me/messages"))
    .and(query_param("pageToken", "page-2"))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
    .expect(1)
    .mount(&server)
    .await;

  let page = source(&server).fetch_raw_records(Some("page-2")).await.unwrap();
  assert!(page.records.is_empty());
  assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn attachment_bytes_are_decoded() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/users/me/messages/m1/attachments/att-7"))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": b64("%PDF-1.7"), "size": 8 })))
    .mount(&server)
    .await;

  let src = source(&server);
  let bytes = src.attachment_bytes("m1/att-7").await.unwrap();
  assert_eq!(&bytes[..], b"%PDF-1.7");
  assert!(matches!(
    src.attachment_bytes("no-separator").await,
    Err(SourceError::AttachmentNotFound(_))
  ));
}

#[tokio::test]
async fn too_many_requests_is_retried_after_the_directive() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/users/me/messages"))
    .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
    .up_to_n_times(1)
    .with_priority(1)
    .mount(&server)
    .await;
  Mock::given(method("GET"))
    .and(path("/users/me/messages"))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "messages": [] })))
    .mount(&server)
    .await;

  let page = source(&server).fetch_raw_records(None).await.unwrap();
  assert!(page.records.is_empty());
  assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn persistent_rate_limiting_surfaces_after_exhaustion() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
    .mount(&server)
    .await;

  let result = source(&server).fetch_raw_records(None).await;
  assert!(matches!(result, Err(SourceError::RateLimited { attempts: 3 })));
  assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn invalid_credentials_are_not_retried() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .respond_with(ResponseTemplate::new(401))
    .mount(&server)
    .await;

  let result = source(&server).fetch_raw_records(None).await;
  assert!(matches!(result, Err(SourceError::InvalidCredentials)));
  assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_quota_is_not_retried() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .respond_with(ResponseTemplate::new(403).set_body_json(json!({
      "error": { "code": 403, "errors": [{ "reason": "dailyLimitExceeded" }] }
    })))
    .mount(&server)
    .await;

  let result = source(&server).fetch_raw_records(None).await;
  assert!(matches!(result, Err(SourceError::QuotaExhausted(_))));
  assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn server_errors_are_retried_then_reported_unavailable() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .respond_with(ResponseTemplate::new(503))
    .mount(&server)
    .await;

  let result = source(&server).fetch_raw_records(None).await;
  assert!(matches!(result, Err(SourceError::Unavailable(_))));
  assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

async fn page_with_unreadable_first_message(bad: ResponseTemplate) -> MockServer {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/users/me/messages"))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({
      "messages": [{ "id": "bad" }, { "id": "good" }]
    })))
    .mount(&server)
    .await;
  Mock::given(method("GET"))
    .and(path("/users/me/messages/bad"))
    .respond_with(bad)
    .mount(&server)
    .await;
  Mock::given(method("GET"))
    .and(path("/users/me/messages/good"))
    .respond_with(ResponseTemplate::new(200).set_body_json(message_json("good", &["INBOX"])))
    .mount(&server)
    .await;
  server
}

#[tokio::test]
async fn undecodable_message_is_skipped() {
  let server =
    page_with_unreadable_first_message(ResponseTemplate::new(200).set_body_json(json!({ "id": 5 })))
      .await;
  let page = source(&server).fetch_raw_records(None).await.unwrap();
  let ids: Vec<_> = page.records.iter().map(|r| r.external_id.as_str()).collect();
  assert_eq!(ids, vec!["good"]);
}

#[tokio::test]
async fn message_deleted_after_listing_is_skipped() {
  let server = page_with_unreadable_first_message(ResponseTemplate::new(404)).await;
  let page = source(&server).fetch_raw_records(None).await.unwrap();
  let ids: Vec<_> = page.records.iter().map(|r| r.external_id.as_str()).collect();
  assert_eq!(ids, vec!["good"]);
}

#[tokio::test]
async fn credential_failure_on_a_message_still_fails_the_page() {
  let server = page_with_unreadable_first_message(ResponseTemplate::new(401)).await;
  let result = source(&server).fetch_raw_records(None).await;
  assert!(matches!(result, Err(SourceError::InvalidCredentials)));
}
