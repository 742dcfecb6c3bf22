//! REST collaborators: chat persistence, blob upload and protected media retrieval

use crate::error::{ChatError, Result};
use crate::events::{Sender, WireMessage};
use crate::media_cache::{FetchedMedia, MediaFetcher};
use crate::upload_manager::{BlobStorage, ProgressFn, StoredBlob, UploadFile};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

/// Bytes handed to the HTTP body per progress report
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Chat REST endpoints the core talks to
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `POST /message` - persist a finalized message
    async fn post_message(&self, message: &WireMessage) -> Result<()>;

    /// `GET /messages` - history of one conversation
    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<WireMessage>>;

    /// `POST /message-seen` - mark the other side's messages read
    async fn mark_seen(&self, conversation_id: &str, by: Sender) -> Result<()>;
}

/// Shared plumbing: base URL, bearer credential and status mapping
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
    bearer: Arc<Mutex<Option<String>>>,
}

impl RestClient {
    /// `base_url` is the API root, e.g. `http://localhost:5000/api/`
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            base: normalize_base(base_url)?,
            bearer: Arc::new(Mutex::new(None)),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Replace the bearer credential used on every request
    pub fn set_bearer(&self, token: Option<String>) {
        *self.bearer.lock() = token;
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.bearer.lock().as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, "Request rejected");
        Err(ChatError::Http {
            status: status.as_u16(),
            message: body,
        })
    }
}

/// Make sure relative joins land under the API root
pub(crate) fn normalize_base(base_url: &str) -> Result<Url> {
    let mut base = Url::parse(base_url)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SeenRequest<'a> {
    conversation_id: &'a str,
    by: Sender,
}

/// `GET /messages` answers either with a bare array or wrapped in `messages`
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    List(Vec<WireMessage>),
    Wrapped { messages: Vec<WireMessage> },
}

/// [`ChatApi`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: RestClient,
}

impl HttpChatApi {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    #[instrument(skip(self, message), fields(conversation_id = %message.conversation_id))]
    async fn post_message(&self, message: &WireMessage) -> Result<()> {
        let url = self.client.endpoint("message")?;
        let response = self
            .client
            .authorize(self.client.http.post(url))
            .json(message)
            .send()
            .await?;
        RestClient::check(response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<WireMessage>> {
        let mut url = self.client.endpoint("messages")?;
        url.query_pairs_mut()
            .append_pair("conversationId", conversation_id);
        let response = self
            .client
            .authorize(self.client.http.get(url))
            .send()
            .await?;
        let history = RestClient::check(response)
            .await?
            .json::<HistoryResponse>()
            .await?;
        let messages = match history {
            HistoryResponse::List(messages) | HistoryResponse::Wrapped { messages } => messages,
        };
        debug!(count = messages.len(), "Fetched history");
        Ok(messages)
    }

    async fn mark_seen(&self, conversation_id: &str, by: Sender) -> Result<()> {
        let url = self.client.endpoint("message-seen")?;
        let response = self
            .client
            .authorize(self.client.http.post(url))
            .json(&SeenRequest {
                conversation_id,
                by,
            })
            .send()
            .await?;
        RestClient::check(response).await?;
        Ok(())
    }
}

/// [`BlobStorage`] backed by the multipart `POST /upload` endpoint
#[derive(Debug, Clone)]
pub struct HttpBlobStorage {
    client: RestClient,
}

impl HttpBlobStorage {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobStorage for HttpBlobStorage {
    #[instrument(skip_all, fields(file = %file.name, size = file.size()))]
    async fn upload(
        &self,
        file: &UploadFile,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<StoredBlob> {
        let total = file.bytes.len();
        let chunks: Vec<Bytes> = (0..total)
            .step_by(UPLOAD_CHUNK_SIZE)
            .map(|start| file.bytes.slice(start..(start + UPLOAD_CHUNK_SIZE).min(total)))
            .collect();

        let mut sent = 0usize;
        let body = futures::stream::iter(chunks).map(move |chunk| {
            sent += chunk.len();
            progress(percent(sent, total));
            Ok::<Bytes, std::io::Error>(chunk)
        });

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(body), total as u64)
            .file_name(file.name.clone())
            .mime_str(&file.content_type)?;
        let form = Form::new().part("file", part);

        let url = self.client.endpoint("upload")?;
        let request = self
            .client
            .authorize(self.client.http.post(url))
            .multipart(form)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Canceled),
            response = request => response?,
        };
        let blob = RestClient::check(response)
            .await?
            .json::<StoredBlob>()
            .await?;
        Ok(blob)
    }
}

fn percent(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((sent as u128 * 100) / total as u128).min(100) as u8
}

/// [`MediaFetcher`] for the auth-gated `GET /file/:key` endpoint
#[derive(Debug, Clone, Default)]
pub struct HttpMediaFetcher {
    http: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &Url, bearer: Option<&str>) -> Result<FetchedMedia> {
        let mut request = self.http.get(url.clone());
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = RestClient::check(request.send().await?).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        Ok(FetchedMedia {
            bytes,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MessageKind;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RestClient {
        let client = RestClient::new(&format!("{}/api", server.uri())).unwrap();
        client.set_bearer(Some("token-1".to_string()));
        client
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let base = normalize_base("http://localhost:5000/api").unwrap();
        assert_eq!(
            base.join("message").unwrap().as_str(),
            "http://localhost:5000/api/message"
        );
    }

    #[test]
    fn test_percent_bounds() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(5, 3), 100);
    }

    #[tokio::test]
    async fn test_fetch_history_accepts_wrapped_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/messages"))
            .and(query_param("conversationId", "u42"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{
                    "conversationId": "u42",
                    "sender": "user",
                    "content": "hi",
                    "type": "text",
                    "timestamp": 5
                }]
            })))
            .mount(&server)
            .await;

        let api = HttpChatApi::new(client(&server));
        let history = api.fetch_history("u42").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, MessageKind::Text);
    }

    #[tokio::test]
    async fn test_mark_seen_posts_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/message-seen"))
            .and(body_json(serde_json::json!({
                "conversationId": "u42",
                "by": "support"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = HttpChatApi::new(client(&server));
        api.mark_seen("u42", Sender::Support).await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_maps_to_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/message"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let api = HttpChatApi::new(client(&server));
        let message = WireMessage {
            local_id: Some("l-1".to_string()),
            conversation_id: "u1".to_string(),
            sender: Sender::User,
            content: "Hello".to_string(),
            kind: MessageKind::Text,
            attachment: None,
            timestamp: 1000,
            status: None,
        };
        let err = api.post_message(&message).await.unwrap_err();
        assert!(matches!(err, ChatError::Http { status: 500, ref message } if message == "boom"));
    }

    #[tokio::test]
    async fn test_upload_reports_progress_and_parses_keys() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/upload"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"file": "f-1", "thumb": "t-1"})),
            )
            .mount(&server)
            .await;

        let storage = HttpBlobStorage::new(client(&server));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let progress: ProgressFn = Arc::new(move |p| recorder.lock().push(p));
        let file = UploadFile::new("a.png", "image/png", vec![7u8; UPLOAD_CHUNK_SIZE * 2 + 10]);

        let blob = storage
            .upload(&file, progress, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(blob.file_key.as_deref(), Some("f-1"));

        let seen = seen.lock().clone();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_media_fetch_sends_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/file/k-1"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![1u8, 2, 3]),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/api/file/k-1", server.uri())).unwrap();
        let media = HttpMediaFetcher::new()
            .fetch(&url, Some("secret"))
            .await
            .unwrap();
        assert_eq!(media.bytes.as_ref(), &[1, 2, 3]);
        assert_eq!(media.content_type.as_deref(), Some("image/png"));
    }
}
