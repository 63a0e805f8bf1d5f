use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::stream::StreamName;

/// Errors reported by a stream client or an open output stream
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid stream name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Stream {0} already exists")]
    AlreadyExists(StreamName),

    #[error("Stream {0} is closed")]
    Closed(StreamName),

    #[error("Stream {name} does not accept {operation}")]
    WrongType {
        name: StreamName,
        operation: &'static str,
    },

    #[error("Stream {name} rejected by client: {message}")]
    Rejected { name: StreamName, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while interpreting an annotation payload
#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error("Unknown annotation command: {0}")]
    UnknownCommand(String),

    #[error("Annotation {command} is missing parameter {parameter}")]
    MissingParameter {
        command: &'static str,
        parameter: &'static str,
    },

    #[error("No step named {0:?}")]
    UnknownStep(String),

    #[error("The root step cannot be closed by annotation")]
    CloseRoot,
}

/// Errors raised by a step handler
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Refusing to get stream {stream} for closed handler {step}")]
    Closed { step: StreamName, stream: StreamName },

    #[error("Stream {stream} of step {step} failed: {source}")]
    Stream {
        step: StreamName,
        stream: StreamName,
        #[source]
        source: StreamError,
    },

    #[error("Failed to serialize state of step {step}: {source}")]
    Snapshot {
        step: StreamName,
        #[source]
        source: serde_json::Error,
    },
}

/// A single input stream that terminated with a read error
#[derive(Debug)]
pub struct StreamFailure {
    pub stream: StreamName,
    pub error: std::io::Error,
}

impl fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stream, self.error)
    }
}

/// Every input stream that failed during one `run_streams` pass
#[derive(Debug, Default)]
pub struct StreamFailures(pub Vec<StreamFailure>);

impl StreamFailures {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamFailure> {
        self.0.iter()
    }
}

impl fmt::Display for StreamFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stream(s) failed", self.0.len())?;
        for (i, failure) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

/// Errors returned by the stream processor
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("Failed to tee line for stream {stream}: {source}")]
    Tee {
        stream: StreamName,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Streams(StreamFailures),
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_failures_display_lists_each_stream() {
        let failures = StreamFailures(vec![
            StreamFailure {
                stream: StreamName::new("stdout").unwrap(),
                error: std::io::Error::other("boom"),
            },
            StreamFailure {
                stream: StreamName::new("stderr").unwrap(),
                error: std::io::Error::other("bang"),
            },
        ]);
        assert_eq!(
            failures.to_string(),
            "2 stream(s) failed: stdout: boom; stderr: bang"
        );
    }

    #[test]
    fn test_handler_closed_message() {
        let err = HandlerError::Closed {
            step: StreamName::new("annotee/steps/compile").unwrap(),
            stream: StreamName::new("annotee/steps/compile/stdout").unwrap(),
        };
        assert!(err.to_string().contains("closed handler annotee/steps/compile"));
    }
}
