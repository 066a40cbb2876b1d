//! Remote side of a transfer: the calls a worker makes and what they carry.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ProtocolError;
use crate::source::ContentHandle;

/// Called with the cumulative number of bytes handed to the transport.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Metadata shared by every call about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub relative_path: String,
    pub destination: String,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitTransferRequest {
    pub file: FileInfo,
    pub chunk_size_hint: u64,
}

/// The remote's multi-part plan. Its `chunk_size` is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitTransferResponse {
    pub transfer_id: String,
    pub storage_key: String,
    pub chunk_size: u64,
    pub total_parts: u32,
}

/// Where to send one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTarget {
    pub part_number: u32,
    pub url: String,
    /// Seconds the target stays valid, when the remote says.
    pub expires_in: Option<u64>,
}

/// A part's completion token as the remote expects it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

impl CompletedPart {
    /// Pairs tokens with 1-based part numbers.
    pub fn from_tokens(tokens: &[String]) -> Vec<Self> {
        tokens
            .iter()
            .zip(1u32..)
            .map(|(etag, part_number)| Self {
                part_number,
                etag: etag.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteTransferRequest {
    pub file: FileInfo,
    pub transfer_id: String,
    pub storage_key: String,
    pub parts: Vec<CompletedPart>,
}

/// Operations a transfer worker needs from the remote store.
///
/// Every call may be abandoned mid-flight when the owning task is paused or
/// cancelled; implementations must not assume they run to completion.
#[async_trait]
pub trait RemoteTransferProtocol: Send + Sync {
    /// Opens a multi-part session.
    async fn init_transfer(
        &self,
        request: &InitTransferRequest,
    ) -> Result<InitTransferResponse, ProtocolError>;

    /// Resolves the upload target of a 1-based part.
    async fn part_target(
        &self,
        transfer_id: &str,
        storage_key: &str,
        part_number: u32,
    ) -> Result<PartTarget, ProtocolError>;

    /// Sends one part and returns its completion token.
    async fn upload_part(&self, target: &PartTarget, data: Bytes) -> Result<String, ProtocolError>;

    /// Assembles the parts into the final object.
    async fn complete_transfer(&self, request: &CompleteTransferRequest) -> Result<(), ProtocolError>;

    /// Uploads a whole file in one request, reporting progress as it goes.
    async fn direct_upload(
        &self,
        file: &FileInfo,
        content: ContentHandle,
        progress: ProgressFn,
    ) -> Result<(), ProtocolError>;
}
