//! Link generation for output streams
//!
//! When a new stream is opened for a step, a `STEP_LINK` annotation pointing
//! at a viewer for that stream can be injected into the step's output.

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::stream::StreamName;

/// Produces a human-navigable link for one or more streams
pub trait LinkGenerator: Send + Sync {
    /// Returns `None` when no link can be generated
    fn link(&self, streams: &[StreamName]) -> Option<String>;
}

/// Generates log viewer links of the form
/// `https://<host>/v/?s=<project>/<prefix>/+/<stream>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerLinkGenerator {
    pub host: String,
    pub project: String,
    pub prefix: String,
}

impl ViewerLinkGenerator {
    pub fn new(
        host: impl Into<String>,
        project: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            project: project.into(),
            prefix: prefix.into(),
        }
    }
}

impl LinkGenerator for ViewerLinkGenerator {
    fn link(&self, streams: &[StreamName]) -> Option<String> {
        if self.host.is_empty() || self.project.is_empty() || streams.is_empty() {
            return None;
        }
        let mut query = form_urlencoded::Serializer::new(String::new());
        for stream in streams {
            query.append_pair(
                "s",
                &format!("{}/{}/+/{}", self.project, self.prefix, stream),
            );
        }
        Some(format!("https://{}/v/?{}", self.host, query.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_stream_link() {
        let generator = ViewerLinkGenerator::new("logs.example.com", "chromium", "bb/123");
        let link = generator
            .link(&[StreamName::new("annotee/steps/compile/stdout").unwrap()])
            .unwrap();
        assert_eq!(
            link,
            "https://logs.example.com/v/?s=chromium%2Fbb%2F123%2F%2B%2Fannotee%2Fsteps%2Fcompile%2Fstdout"
        );
    }

    #[test]
    fn test_multiple_streams_and_missing_configuration() {
        let generator = ViewerLinkGenerator::new("host", "proj", "p");
        let link = generator
            .link(&[
                StreamName::new("a/stdout").unwrap(),
                StreamName::new("a/stderr").unwrap(),
            ])
            .unwrap();
        assert_eq!(link.matches("s=").count(), 2);

        assert!(generator.link(&[]).is_none());
        let unconfigured = ViewerLinkGenerator::new("", "proj", "p");
        assert!(unconfigured
            .link(&[StreamName::new("a/stdout").unwrap()])
            .is_none());
    }
}
