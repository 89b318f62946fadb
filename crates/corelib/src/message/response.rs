//! Network response envelope.

use crate::message::metadata::MessageMetadata;
use crate::message::result_code::ResultCode;

/// A response to a [`super::NetworkRequest`].
///
/// Failures are responses too: a timeout, a closed channel or a missing route
/// all produce a response with the matching [`ResultCode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkResponse {
    request_id: String,
    result_code: ResultCode,
    content: Vec<u8>,
    metadata: MessageMetadata,
}

impl NetworkResponse {
    pub fn new(request_id: impl Into<String>, result_code: ResultCode, content: Vec<u8>, metadata: MessageMetadata) -> Self {
        Self {
            request_id: request_id.into(),
            result_code,
            content,
            metadata,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn result_code(&self) -> ResultCode {
        self.result_code
    }

    pub fn is_success(&self) -> bool {
        self.result_code.is_success()
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MessageMetadata {
        &mut self.metadata
    }

    /// Error marker or message carried by a failure response, if any.
    pub fn error_text(&self) -> Option<String> {
        if self.is_success() || self.content.is_empty() {
            return None;
        }
        String::from_utf8(self.content.clone()).ok()
    }
}
