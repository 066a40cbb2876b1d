//! `reqwest` implementation of [`RemoteTransferProtocol`].

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{multipart, Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::ProtocolError;
use crate::protocol::{
    CompleteTransferRequest, CompletedPart, FileInfo, InitTransferRequest, InitTransferResponse,
    PartTarget, ProgressFn, RemoteTransferProtocol,
};
use crate::source::ContentHandle;

const DEFAULT_STREAM_CHUNK: u64 = 256 * 1024;

/// Endpoint names, appended to `base_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub init: String,
    pub part_url: String,
    pub complete: String,
    pub direct: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            init: "upload_init".into(),
            part_url: "upload_part_url".into(),
            complete: "upload_complete".into(),
            direct: "upload_direct".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Replaces scheme, host and port of every presigned part URL.
    pub acceleration_url: Option<String>,
    pub endpoints: Endpoints,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    /// Piece size when streaming a direct upload body.
    pub stream_chunk_size: u64,
}

impl HttpConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            acceleration_url: None,
            endpoints: Endpoints::default(),
            pool_max_idle_per_host: 4,
            pool_idle_timeout: Duration::from_secs(90),
            stream_chunk_size: DEFAULT_STREAM_CHUNK,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_acceleration(mut self, url: impl Into<String>) -> Self {
        self.acceleration_url = Some(url.into());
        self
    }
}

// --- WIRE FORMAT ---

#[derive(Deserialize, Debug)]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum ApiErrorBody {
    Message(String),
    Detailed {
        #[serde(default)]
        code: Option<serde_json::Value>,
        message: String,
    },
}

impl ApiErrorBody {
    fn into_message(self) -> String {
        match self {
            ApiErrorBody::Message(message) => message,
            ApiErrorBody::Detailed {
                code: Some(code),
                message,
            } => format!("{message} ({code})"),
            ApiErrorBody::Detailed { message, .. } => message,
        }
    }
}

impl<T> ApiEnvelope<T> {
    fn into_result(self) -> Result<Option<T>, ProtocolError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(ProtocolError::Api(
                self.error
                    .map(ApiErrorBody::into_message)
                    .unwrap_or_else(|| "request rejected without a message".to_string()),
            ))
        }
    }
}

#[derive(Serialize)]
struct InitBody<'a> {
    filename: &'a str,
    filesize: u64,
    rel_path: &'a str,
    destination: &'a str,
    part_size: u64,
}

#[derive(Deserialize)]
struct InitData {
    upload_id: String,
    storage_key: String,
    part_size: u64,
    total_parts: u32,
}

#[derive(Serialize)]
struct PartUrlBody<'a> {
    upload_id: &'a str,
    storage_key: &'a str,
    part_number: u32,
}

#[derive(Deserialize)]
struct PartUrlData {
    presigned_url: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Serialize)]
struct CompleteBody<'a> {
    upload_id: &'a str,
    storage_key: &'a str,
    parts: &'a [CompletedPart],
    filename: &'a str,
    filesize: u64,
    rel_path: &'a str,
    destination: &'a str,
}

fn snippet(body: &str) -> String {
    const MAX: usize = 500;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

fn strip_etag(raw: &str) -> String {
    raw.replace('"', "")
}

// --- THE CLIENT ---

#[derive(Clone)]
pub struct HttpTransferClient {
    client: Client,
    config: HttpConfig,
    acceleration: Option<Url>,
}

impl HttpTransferClient {
    pub fn new(config: HttpConfig) -> Result<Self, ProtocolError> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Some(config.pool_idle_timeout))
            .build()?;

        let acceleration = config
            .acceleration_url
            .as_deref()
            .map(|raw| {
                Url::parse(raw).map_err(|e| {
                    ProtocolError::Malformed(format!("invalid acceleration URL {raw}: {e}"))
                })
            })
            .transpose()?;

        Ok(Self {
            client,
            config,
            acceleration,
        })
    }

    pub fn set_token(&mut self, token: String) {
        self.config.token = Some(token);
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Points a presigned URL at the acceleration host, when one is set.
    pub fn accelerate(&self, raw: &str) -> Result<String, ProtocolError> {
        let Some(base) = &self.acceleration else {
            return Ok(raw.to_string());
        };
        let invalid = || ProtocolError::Malformed(format!("cannot accelerate part URL {raw}"));

        let mut url = Url::parse(raw)
            .map_err(|e| ProtocolError::Malformed(format!("invalid part URL {raw}: {e}")))?;
        url.set_scheme(base.scheme()).map_err(|()| invalid())?;
        url.set_host(base.host_str()).map_err(|_| invalid())?;
        url.set_port(base.port()).map_err(|()| invalid())?;
        Ok(url.to_string())
    }

    async fn read_envelope<T: DeserializeOwned>(
        response: Response,
    ) -> Result<Option<T>, ProtocolError> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ProtocolError::Status {
                code: status.as_u16(),
                body: snippet(&text),
            });
        }
        let envelope: ApiEnvelope<T> = serde_json::from_str(&text)
            .map_err(|e| ProtocolError::Malformed(format!("{e}: {}", snippet(&text))))?;
        envelope.into_result()
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<Option<T>, ProtocolError> {
        let url = self.api_url(endpoint);
        debug!("POST {url}");
        let response = self.authorize(self.client.post(&url)).json(body).send().await?;
        Self::read_envelope(response).await
    }

    async fn post_required<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ProtocolError> {
        self.post_json(endpoint, body)
            .await?
            .ok_or_else(|| ProtocolError::Malformed(format!("{endpoint} returned no data")))
    }
}

#[async_trait]
impl RemoteTransferProtocol for HttpTransferClient {
    async fn init_transfer(
        &self,
        request: &InitTransferRequest,
    ) -> Result<InitTransferResponse, ProtocolError> {
        let body = InitBody {
            filename: &request.file.name,
            filesize: request.file.total_bytes,
            rel_path: &request.file.relative_path,
            destination: &request.file.destination,
            part_size: request.chunk_size_hint,
        };
        let data: InitData = self.post_required(&self.config.endpoints.init, &body).await?;
        Ok(InitTransferResponse {
            transfer_id: data.upload_id,
            storage_key: data.storage_key,
            chunk_size: data.part_size,
            total_parts: data.total_parts,
        })
    }

    async fn part_target(
        &self,
        transfer_id: &str,
        storage_key: &str,
        part_number: u32,
    ) -> Result<PartTarget, ProtocolError> {
        let body = PartUrlBody {
            upload_id: transfer_id,
            storage_key,
            part_number,
        };
        let data: PartUrlData = self
            .post_required(&self.config.endpoints.part_url, &body)
            .await?;
        Ok(PartTarget {
            part_number,
            url: self.accelerate(&data.presigned_url)?,
            expires_in: data.expires_in,
        })
    }

    async fn upload_part(&self, target: &PartTarget, data: Bytes) -> Result<String, ProtocolError> {
        debug!("PUT part {} ({} bytes)", target.part_number, data.len());
        let response = self.client.put(&target.url).body(data).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProtocolError::Status {
                code: status.as_u16(),
                body: snippet(&body),
            });
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(strip_etag)
            .unwrap_or_default();
        if etag.is_empty() {
            return Err(ProtocolError::Malformed(format!(
                "part {} accepted without an ETag",
                target.part_number
            )));
        }
        Ok(etag)
    }

    async fn complete_transfer(
        &self,
        request: &CompleteTransferRequest,
    ) -> Result<(), ProtocolError> {
        let body = CompleteBody {
            upload_id: &request.transfer_id,
            storage_key: &request.storage_key,
            parts: &request.parts,
            filename: &request.file.name,
            filesize: request.file.total_bytes,
            rel_path: &request.file.relative_path,
            destination: &request.file.destination,
        };
        self.post_json::<_, serde_json::Value>(&self.config.endpoints.complete, &body)
            .await?;
        Ok(())
    }

    async fn direct_upload(
        &self,
        file: &FileInfo,
        content: ContentHandle,
        progress: ProgressFn,
    ) -> Result<(), ProtocolError> {
        let total = content.len();
        let piece = self.config.stream_chunk_size.max(1);

        // Read lazily so only one piece is in memory at a time.
        let stream = futures::stream::try_unfold((content, 0u64), move |(content, offset)| {
            let progress = progress.clone();
            async move {
                if offset >= total {
                    return Ok::<_, std::io::Error>(None);
                }
                let len = piece.min(total - offset);
                let bytes = content.read_range(offset, len).await?;
                progress(offset + len);
                Ok(Some((bytes, (content, offset + len))))
            }
        });
        let body = reqwest::Body::wrap_stream(stream);

        let part = multipart::Part::stream_with_length(body, total)
            .file_name(file.name.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;

        let form = multipart::Form::new()
            .text("filename", file.name.clone())
            .text("filesize", total.to_string())
            .text("rel_path", file.relative_path.clone())
            .text("destination", file.destination.clone())
            .part("file", part);

        let url = self.api_url(&self.config.endpoints.direct);
        debug!("POST {url} ({total} bytes)");
        let response = self
            .authorize(self.client.post(&url))
            .multipart(form)
            .send()
            .await?;
        Self::read_envelope::<serde_json::Value>(response).await?;
        Ok(())
    }
}
