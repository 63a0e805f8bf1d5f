//! Output stream client abstraction
//!
//! The processor never talks to a log backend directly. It creates named
//! output streams through a [`StreamClient`] and writes text lines or
//! datagrams to the returned [`OutputStream`] handles.

pub mod filesystem;
pub mod memory;
pub mod name;

pub use filesystem::FilesystemClient;
pub use memory::{MemoryClient, MemoryStreamRecord};
pub use name::StreamName;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Content type of text streams
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Content type of step annotation datagram streams
pub const CONTENT_TYPE_ANNOTATIONS: &str = "text/x-chrome-infra-annotations; version=2";

/// Framing of an output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Text,
    Datagram,
}

/// Template for new streams; cloned and completed with a name and timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamArchetype {
    pub content_type: &'static str,
    pub stream_type: StreamType,
}

impl StreamArchetype {
    /// Archetype for plain text content and log streams
    pub const TEXT: StreamArchetype = StreamArchetype {
        content_type: CONTENT_TYPE_TEXT,
        stream_type: StreamType::Text,
    };

    /// Archetype for the per-step annotation (metadata) stream
    pub const ANNOTATIONS: StreamArchetype = StreamArchetype {
        content_type: CONTENT_TYPE_ANNOTATIONS,
        stream_type: StreamType::Datagram,
    };

    pub fn properties(&self, name: StreamName, timestamp: DateTime<Utc>) -> StreamProperties {
        StreamProperties {
            name,
            content_type: self.content_type.to_string(),
            stream_type: self.stream_type,
            timestamp,
        }
    }
}

/// Everything a client needs to open a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProperties {
    pub name: StreamName,
    pub content_type: String,
    pub stream_type: StreamType,
    pub timestamp: DateTime<Utc>,
}

/// An open output stream
#[async_trait]
pub trait OutputStream: Send {
    fn name(&self) -> &StreamName;

    /// Write one line of text; the terminator is appended by the stream
    async fn write_line(&mut self, line: &str) -> Result<(), StreamError>;

    /// Write one opaque datagram
    async fn write_datagram(&mut self, data: &[u8]) -> Result<(), StreamError>;

    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Creates output streams against some backend
#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn new_stream(
        &self,
        properties: StreamProperties,
    ) -> Result<Box<dyn OutputStream>, StreamError>;
}
