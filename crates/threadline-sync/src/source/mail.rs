//! Cloud mailbox reader (Gmail REST v1 shape).
//!
//! Lists `users/me/messages` a page at a time, fetches each message with
//! `format=full`, and serves attachments from
//! `users/me/messages/{id}/attachments/{attachment_id}`. Every HTTP call goes
//! through the adapter's [`RateLimitedClient`].

use std::{sync::Arc, sync::OnceLock, time::Duration};

use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use mailparse::MailAddr;
use regex::Regex;
use reqwest::{StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, de::DeserializeOwned};
use threadline_core::record::{AttachmentRef, Channel, Direction, RawRecord, SourceKind};

use super::{Page, SourceAdapter, SourceError};
use crate::ratelimit::{ApiFailure, RateLimitedClient};

pub const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 120;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SENT_LABEL: &str = "SENT";

const RATE_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];
const QUOTA_REASONS: &[&str] = &["quotaExceeded", "dailyLimitExceeded"];

// ─── Credentials ─────────────────────────────────────────────────────────────

/// Supplies the bearer token for each request. Token acquisition and refresh
/// happen elsewhere.
pub trait CredentialProvider: Send + Sync {
  fn bearer_token(&self) -> Result<String, SourceError>;
}

/// A fixed token, e.g. from configuration.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
  pub fn new(token: impl Into<String>) -> Self { Self(token.into()) }
}

impl CredentialProvider for StaticToken {
  fn bearer_token(&self) -> Result<String, SourceError> {
    if self.0.trim().is_empty() {
      return Err(SourceError::InvalidCredentials);
    }
    Ok(self.0.clone())
  }
}

// ─── API response types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
  #[serde(default)]
  messages:        Vec<MessageStub>,
  #[serde(default)]
  next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
  id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
  id:            String,
  #[serde(default)]
  thread_id:     Option<String>,
  #[serde(default)]
  label_ids:     Vec<String>,
  #[serde(default)]
  internal_date: Option<String>,
  #[serde(default)]
  payload:       Option<Payload>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
  #[serde(default)]
  mime_type: String,
  #[serde(default)]
  filename:  String,
  #[serde(default)]
  headers:   Vec<Header>,
  #[serde(default)]
  body:      Option<PayloadBody>,
  #[serde(default)]
  parts:     Vec<Payload>,
}

#[derive(Debug, Deserialize)]
struct Header {
  #[serde(default)]
  name:  String,
  #[serde(default)]
  value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadBody {
  #[serde(default)]
  data:          Option<String>,
  #[serde(default)]
  attachment_id: Option<String>,
  #[serde(default)]
  size:          u64,
}

#[derive(Debug, Deserialize)]
struct AttachmentResponse {
  #[serde(default)]
  data: String,
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Addresses in an address-list header, display names dropped.
pub fn extract_addresses(header: &str) -> Vec<String> {
  match mailparse::addrparse(header) {
    Ok(list) => list
      .iter()
      .flat_map(|addr| match addr {
        MailAddr::Single(info) => vec![info.addr.clone()],
        MailAddr::Group(group) => group.addrs.iter().map(|i| i.addr.clone()).collect(),
      })
      .filter(|a| !a.trim().is_empty())
      .collect(),
    Err(_) => header
      .split(',')
      .map(str::trim)
      .filter(|s| s.contains('@'))
      .map(|s| s.trim_matches(|c| c == '<' || c == '>').to_owned())
      .collect(),
  }
}

/// Decode URL-safe base64, with or without padding.
fn decode_url_safe_base64(data: &str) -> Option<Vec<u8>> {
  base64::engine::general_purpose::URL_SAFE_NO_PAD
    .decode(data.trim().trim_end_matches('='))
    .ok()
}

fn decode_text(data: &str) -> Option<String> {
  decode_url_safe_base64(data).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Depth-first search for the first body with `target_mime`.
fn extract_body_text(payload: &Payload, target_mime: &str) -> Option<String> {
  if payload.mime_type.eq_ignore_ascii_case(target_mime) && payload.filename.is_empty() {
    if let Some(text) = payload.body.as_ref().and_then(|b| b.data.as_deref()).and_then(decode_text) {
      return Some(text);
    }
  }
  payload.parts.iter().find_map(|p| extract_body_text(p, target_mime))
}

fn re_tag() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"(?s)<(script|style)[^>]*>.*?</(script|style)>|<[^>]*>").expect("tag pattern is valid"))
}

fn re_space() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

/// Crude HTML to text: tags dropped, common entities decoded, whitespace
/// collapsed.
fn html_to_text(html: &str) -> String {
  let stripped = re_tag().replace_all(html, " ");
  let decoded = stripped
    .replace("&nbsp;", " ")
    .replace("&lt;", "<")
    .replace("&gt;", ">")
    .replace("&quot;", "\"")
    .replace("&#39;", "'")
    .replace("&amp;", "&");
  re_space().replace_all(decoded.trim(), " ").into_owned()
}

fn collect_attachments(message_id: &str, payload: &Payload, out: &mut Vec<AttachmentRef>) {
  if let Some(attachment_id) = payload.body.as_ref().and_then(|b| b.attachment_id.as_deref()) {
    if !payload.filename.is_empty() {
      out.push(AttachmentRef {
        external_id: format!("{message_id}/{attachment_id}"),
        filename:    Some(payload.filename.clone()),
        mime_type:   Some(payload.mime_type.clone()).filter(|m| !m.is_empty()),
        size_hint:   payload.body.as_ref().map(|b| b.size).filter(|s| *s > 0),
      });
    }
  }
  for part in &payload.parts {
    collect_attachments(message_id, part, out);
  }
}

impl MessageDetail {
  fn header(&self, name: &str) -> Option<&str> {
    self
      .payload
      .as_ref()?
      .headers
      .iter()
      .find(|h| h.name.eq_ignore_ascii_case(name))
      .map(|h| h.value.as_str())
  }

  fn sent_at(&self) -> Option<DateTime<Utc>> {
    self
      .internal_date
      .as_deref()
      .and_then(|ms| ms.parse::<i64>().ok())
      .and_then(DateTime::from_timestamp_millis)
      .or_else(|| {
        let secs = mailparse::dateparse(self.header("Date")?).ok()?;
        DateTime::from_timestamp(secs, 0)
      })
  }

  fn into_record(self) -> Result<RawRecord, SourceError> {
    let sent_at = self
      .sent_at()
      .ok_or_else(|| SourceError::Parse(format!("message {} has no usable date", self.id)))?;

    let mut record = RawRecord::new(SourceKind::Mail, self.id.clone(), sent_at);
    record.conversation_id = self.thread_id.clone();
    record.channel = Channel::Email;
    record.direction = if self.label_ids.iter().any(|l| l == SENT_LABEL) {
      Direction::Outbound
    } else {
      Direction::Inbound
    };
    record.sender = self.header("From").and_then(|h| extract_addresses(h).into_iter().next());
    record.recipients = ["To", "Cc", "Bcc"]
      .iter()
      .filter_map(|name| self.header(name))
      .flat_map(extract_addresses)
      .collect();
    record.subject = self.header("Subject").map(str::to_owned).filter(|s| !s.trim().is_empty());

    let payload = self.payload.unwrap_or_default();
    record.raw_body = extract_body_text(&payload, "text/plain")
      .or_else(|| extract_body_text(&payload, "text/html").map(|h| html_to_text(&h)));
    collect_attachments(&self.id, &payload, &mut record.attachment_refs);

    Ok(record)
  }
}

// ─── Failure classification ──────────────────────────────────────────────────

fn classify_transport(e: reqwest::Error) -> ApiFailure<SourceError> {
  if e.is_timeout() || e.is_connect() {
    ApiFailure::Transient(e.into())
  } else {
    ApiFailure::Fatal(e.into())
  }
}

/// Map a non-success response onto the retry taxonomy.
pub fn classify_status(
  status: StatusCode,
  retry_after: Option<Duration>,
  body: &str,
) -> ApiFailure<SourceError> {
  let described = || format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
  match status {
    StatusCode::UNAUTHORIZED => ApiFailure::Fatal(SourceError::InvalidCredentials),
    StatusCode::TOO_MANY_REQUESTS => ApiFailure::RateLimited {
      retry_after,
      error: SourceError::Unavailable(described()),
    },
    StatusCode::FORBIDDEN if RATE_REASONS.iter().any(|r| body.contains(r)) => {
      ApiFailure::RateLimited { retry_after, error: SourceError::Unavailable(described()) }
    }
    StatusCode::FORBIDDEN if QUOTA_REASONS.iter().any(|r| body.contains(r)) => {
      ApiFailure::Fatal(SourceError::QuotaExhausted(described()))
    }
    StatusCode::REQUEST_TIMEOUT => ApiFailure::Transient(SourceError::Unavailable(described())),
    s if s.is_server_error() => ApiFailure::Transient(SourceError::Unavailable(described())),
    s if s.is_client_error() => ApiFailure::Fatal(SourceError::Rejected(described())),
    _ => ApiFailure::Fatal(SourceError::Unavailable(described())),
  }
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

pub struct MailApiSource {
  http:        reqwest::Client,
  base_url:    String,
  credentials: Arc<dyn CredentialProvider>,
  client:      RateLimitedClient,
  page_size:   u32,
  query:       Option<String>,
}

impl MailApiSource {
  pub fn new(
    base_url: impl Into<String>,
    credentials: Arc<dyn CredentialProvider>,
    client: RateLimitedClient,
  ) -> Result<Self, SourceError> {
    let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    Ok(Self {
      http,
      base_url: base_url.into().trim_end_matches('/').to_owned(),
      credentials,
      client,
      page_size: DEFAULT_PAGE_SIZE,
      query: None,
    })
  }

  pub fn with_page_size(mut self, page_size: u32) -> Self {
    self.page_size = page_size.clamp(1, 500);
    self
  }

  /// Mailbox search expression, e.g. `newer_than:30d`.
  pub fn with_query(mut self, query: impl Into<String>) -> Self {
    self.query = Some(query.into()).filter(|q| !q.trim().is_empty());
    self
  }

  pub fn client(&self) -> &RateLimitedClient { &self.client }

  async fn get_json<T: DeserializeOwned>(
    &self,
    url: &str,
    query: &[(&str, String)],
  ) -> Result<T, SourceError> {
    Ok(self.client.execute(|| self.request::<T>(url, query)).await?)
  }

  async fn request<T: DeserializeOwned>(
    &self,
    url: &str,
    query: &[(&str, String)],
  ) -> Result<T, ApiFailure<SourceError>> {
    let token = self.credentials.bearer_token().map_err(ApiFailure::Fatal)?;
    let response = self
      .http
      .get(url)
      .bearer_auth(token)
      .query(query)
      .send()
      .await
      .map_err(classify_transport)?;

    let status = response.status();
    if status.is_success() {
      return response
        .json::<T>()
        .await
        .map_err(|e| ApiFailure::Fatal(SourceError::Parse(e.to_string())));
    }

    let retry_after = response
      .headers()
      .get(RETRY_AFTER)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.trim().parse::<u64>().ok())
      .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, retry_after, &body))
  }
}

impl SourceAdapter for MailApiSource {
  fn kind(&self) -> SourceKind { SourceKind::Mail }

  async fn fetch_raw_records(&self, cursor: Option<&str>) -> Result<Page, SourceError> {
    let mut query = vec![("maxResults", self.page_size.to_string())];
    if let Some(q) = &self.query {
      query.push(("q", q.clone()));
    }
    if let Some(token) = cursor {
      query.push(("pageToken", token.to_owned()));
    }

    let list: MessageListResponse = self
      .get_json(&format!("{}/users/me/messages", self.base_url), &query)
      .await?;

    let detail_query = [("format", "full".to_owned())];
    let mut records = Vec::with_capacity(list.messages.len());
    for stub in list.messages {
      let detail: MessageDetail = match self
        .get_json(&format!("{}/users/me/messages/{}", self.base_url, stub.id), &detail_query)
        .await
      {
        Ok(detail) => detail,
        // Deleted since listing, or a body that doesn't decode.
        Err(error @ (SourceError::Rejected(_) | SourceError::Parse(_))) => {
          tracing::warn!(message = %stub.id, %error, "skipping unreadable message");
          continue;
        }
        Err(error) => return Err(error),
      };
      match detail.into_record() {
        Ok(record) => records.push(record),
        Err(error) => tracing::warn!(message = %stub.id, %error, "skipping undecodable message"),
      }
    }

    let next_cursor = list.next_page_token.filter(|t| !t.is_empty());
    tracing::debug!(records = records.len(), more = next_cursor.is_some(), "mailbox page read");
    Ok(Page { records, next_cursor })
  }

  async fn attachment_bytes(&self, external_attachment_id: &str) -> Result<Bytes, SourceError> {
    let (message_id, attachment_id) = external_attachment_id
      .split_once('/')
      .ok_or_else(|| SourceError::AttachmentNotFound(external_attachment_id.to_owned()))?;

    let response: AttachmentResponse = self
      .get_json(
        &format!("{}/users/me/messages/{message_id}/attachments/{attachment_id}", self.base_url),
        &[],
      )
      .await?;

    decode_url_safe_base64(&response.data)
      .map(Bytes::from)
      .ok_or_else(|| SourceError::Parse(format!("attachment {external_attachment_id} is not base64")))
  }
}
