//! In-memory stream client
//!
//! Records everything written to every stream so callers can inspect the
//! result after a run. Failures can be scripted per stream name.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{OutputStream, StreamClient, StreamName, StreamProperties, StreamType};
use crate::error::StreamError;

/// Everything recorded for one stream
#[derive(Debug, Clone)]
pub struct MemoryStreamRecord {
    pub properties: StreamProperties,
    pub lines: Vec<String>,
    pub datagrams: Vec<Vec<u8>>,
    pub close_count: usize,
}

impl MemoryStreamRecord {
    pub fn is_closed(&self) -> bool {
        self.close_count > 0
    }
}

#[derive(Default)]
struct MemoryState {
    streams: HashMap<StreamName, MemoryStreamRecord>,
    fail_create: HashSet<StreamName>,
    fail_write: HashSet<StreamName>,
}

#[derive(Clone, Default)]
pub struct MemoryClient {
    state: Arc<Mutex<MemoryState>>,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make creation of the named stream fail
    pub fn fail_create(&self, name: StreamName) {
        lock(&self.state).fail_create.insert(name);
    }

    /// Make every write to the named stream fail
    pub fn fail_writes(&self, name: StreamName) {
        lock(&self.state).fail_write.insert(name);
    }

    pub fn stream(&self, name: &str) -> Option<MemoryStreamRecord> {
        let state = lock(&self.state);
        state
            .streams
            .iter()
            .find(|(k, _)| k.as_str() == name)
            .map(|(_, v)| v.clone())
    }

    pub fn lines(&self, name: &str) -> Vec<String> {
        self.stream(name).map(|s| s.lines).unwrap_or_default()
    }

    pub fn datagrams(&self, name: &str) -> Vec<Vec<u8>> {
        self.stream(name).map(|s| s.datagrams).unwrap_or_default()
    }
}

#[async_trait]
impl StreamClient for MemoryClient {
    async fn new_stream(
        &self,
        properties: StreamProperties,
    ) -> Result<Box<dyn OutputStream>, StreamError> {
        let mut state = lock(&self.state);
        let name = properties.name.clone();
        if state.fail_create.contains(&name) {
            return Err(StreamError::Rejected {
                name,
                message: "creation refused".to_string(),
            });
        }
        if state.streams.contains_key(&name) {
            return Err(StreamError::AlreadyExists(name));
        }
        let stream_type = properties.stream_type;
        state.streams.insert(
            name.clone(),
            MemoryStreamRecord {
                properties,
                lines: Vec::new(),
                datagrams: Vec::new(),
                close_count: 0,
            },
        );
        Ok(Box::new(MemoryStream {
            name,
            stream_type,
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct MemoryStream {
    name: StreamName,
    stream_type: StreamType,
    state: Arc<Mutex<MemoryState>>,
    closed: bool,
}

impl MemoryStream {
    fn record<F>(&self, operation: &'static str, expected: StreamType, f: F) -> Result<(), StreamError>
    where
        F: FnOnce(&mut MemoryStreamRecord),
    {
        if self.closed {
            return Err(StreamError::Closed(self.name.clone()));
        }
        if self.stream_type != expected {
            return Err(StreamError::WrongType {
                name: self.name.clone(),
                operation,
            });
        }
        let mut state = lock(&self.state);
        if state.fail_write.contains(&self.name) {
            return Err(StreamError::Rejected {
                name: self.name.clone(),
                message: "write refused".to_string(),
            });
        }
        match state.streams.get_mut(&self.name) {
            Some(record) => {
                f(record);
                Ok(())
            }
            None => Err(StreamError::Closed(self.name.clone())),
        }
    }
}

#[async_trait]
impl OutputStream for MemoryStream {
    fn name(&self) -> &StreamName {
        &self.name
    }

    async fn write_line(&mut self, line: &str) -> Result<(), StreamError> {
        self.record("text lines", StreamType::Text, |r| {
            r.lines.push(line.to_string())
        })
    }

    async fn write_datagram(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.record("datagrams", StreamType::Datagram, |r| {
            r.datagrams.push(data.to_vec())
        })
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        let mut state = lock(&self.state);
        if let Some(record) = state.streams.get_mut(&self.name) {
            record.close_count += 1;
        }
        if self.closed {
            return Err(StreamError::Closed(self.name.clone()));
        }
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamArchetype;
    use chrono::Utc;

    fn props(name: &str, archetype: &StreamArchetype) -> StreamProperties {
        archetype.properties(StreamName::new(name).unwrap(), Utc::now())
    }

    #[tokio::test]
    async fn test_records_lines_and_close() {
        let client = MemoryClient::new();
        let mut s = client
            .new_stream(props("a/stdout", &StreamArchetype::TEXT))
            .await
            .unwrap();
        s.write_line("one").await.unwrap();
        s.write_line("two").await.unwrap();
        s.close().await.unwrap();

        let record = client.stream("a/stdout").unwrap();
        assert_eq!(record.lines, vec!["one", "two"]);
        assert_eq!(record.close_count, 1);
        assert!(s.write_line("three").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_wrong_type() {
        let client = MemoryClient::new();
        let mut s = client
            .new_stream(props("a/annotations", &StreamArchetype::ANNOTATIONS))
            .await
            .unwrap();
        assert!(matches!(
            client
                .new_stream(props("a/annotations", &StreamArchetype::ANNOTATIONS))
                .await,
            Err(StreamError::AlreadyExists(_))
        ));
        assert!(matches!(
            s.write_line("text").await,
            Err(StreamError::WrongType { .. })
        ));
        s.write_datagram(b"{}").await.unwrap();
        assert_eq!(client.datagrams("a/annotations"), vec![b"{}".to_vec()]);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let client = MemoryClient::new();
        client.fail_create(StreamName::new("bad").unwrap());
        client.fail_writes(StreamName::new("flaky").unwrap());

        assert!(client
            .new_stream(props("bad", &StreamArchetype::TEXT))
            .await
            .is_err());
        let mut s = client
            .new_stream(props("flaky", &StreamArchetype::TEXT))
            .await
            .unwrap();
        assert!(s.write_line("x").await.is_err());
        assert!(client.lines("flaky").is_empty());
    }
}
