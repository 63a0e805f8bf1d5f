//! Stream client that writes every stream into a local directory
//!
//! Text streams become `<name>.txt`, datagram streams `<name>.datagrams`
//! with one datagram per line. Each stream also gets a
//! `<name>.properties.json` describing how it was opened.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::{OutputStream, StreamClient, StreamName, StreamProperties, StreamType};
use crate::error::StreamError;

pub struct FilesystemClient {
    root: PathBuf,
}

impl FilesystemClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &StreamName, extension: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in name.segments() {
            path.push(segment);
        }
        let file_name = format!("{}.{}", name.last_segment(), extension);
        path.set_file_name(file_name);
        path
    }
}

#[async_trait]
impl StreamClient for FilesystemClient {
    async fn new_stream(
        &self,
        properties: StreamProperties,
    ) -> Result<Box<dyn OutputStream>, StreamError> {
        let extension = match properties.stream_type {
            StreamType::Text => "txt",
            StreamType::Datagram => "datagrams",
        };
        let path = self.path_for(&properties.name, extension);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::try_exists(&path).await? {
            return Err(StreamError::AlreadyExists(properties.name));
        }

        let metadata = serde_json::to_vec_pretty(&properties)?;
        fs::write(self.path_for(&properties.name, "properties.json"), metadata).await?;

        let file = File::create(&path).await?;
        tracing::debug!(stream = %properties.name, path = %path.display(), "Created stream file");
        Ok(Box::new(FileStream {
            name: properties.name,
            stream_type: properties.stream_type,
            writer: Some(BufWriter::new(file)),
        }))
    }
}

struct FileStream {
    name: StreamName,
    stream_type: StreamType,
    writer: Option<BufWriter<File>>,
}

impl FileStream {
    async fn write_record(
        &mut self,
        expected: StreamType,
        operation: &'static str,
        data: &[u8],
    ) -> Result<(), StreamError> {
        if self.stream_type != expected {
            return Err(StreamError::WrongType {
                name: self.name.clone(),
                operation,
            });
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StreamError::Closed(self.name.clone()))?;
        writer.write_all(data).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }
}

#[async_trait]
impl OutputStream for FileStream {
    fn name(&self) -> &StreamName {
        &self.name
    }

    async fn write_line(&mut self, line: &str) -> Result<(), StreamError> {
        self.write_record(StreamType::Text, "text lines", line.as_bytes())
            .await
    }

    async fn write_datagram(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.write_record(StreamType::Datagram, "datagrams", data)
            .await
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| StreamError::Closed(self.name.clone()))?;
        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamArchetype;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writes_text_stream_to_nested_file() {
        let dir = TempDir::new().unwrap();
        let client = FilesystemClient::new(dir.path());
        let name = StreamName::new("annotee/steps/compile/stdout").unwrap();

        let mut stream = client
            .new_stream(StreamArchetype::TEXT.properties(name, Utc::now()))
            .await
            .unwrap();
        stream.write_line("hello").await.unwrap();
        stream.write_line("world").await.unwrap();
        stream.close().await.unwrap();

        let base = dir.path().join("annotee/steps/compile");
        let content = std::fs::read_to_string(base.join("stdout.txt")).unwrap();
        assert_eq!(content, "hello\nworld\n");

        let props: StreamProperties = serde_json::from_str(
            &std::fs::read_to_string(base.join("stdout.properties.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(props.stream_type, StreamType::Text);
    }

    #[tokio::test]
    async fn test_datagram_stream_and_duplicate_rejection() {
        let dir = TempDir::new().unwrap();
        let client = FilesystemClient::new(dir.path());
        let name = StreamName::new("annotee/annotations").unwrap();

        let mut stream = client
            .new_stream(StreamArchetype::ANNOTATIONS.properties(name.clone(), Utc::now()))
            .await
            .unwrap();
        stream.write_datagram(br#"{"a":1}"#).await.unwrap();
        assert!(stream.write_line("text").await.is_err());
        stream.close().await.unwrap();
        assert!(stream.close().await.is_err());

        let content =
            std::fs::read_to_string(dir.path().join("annotee/annotations.datagrams")).unwrap();
        assert_eq!(content, "{\"a\":1}\n");

        assert!(matches!(
            client
                .new_stream(StreamArchetype::ANNOTATIONS.properties(name, Utc::now()))
                .await,
            Err(StreamError::AlreadyExists(_))
        ));
    }
}
