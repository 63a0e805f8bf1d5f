//! Step annotation protocol
//!
//! Build processes embed commands in their output as lines framed by `@@@`,
//! for example `@@@BUILD_STEP compile@@@` or `@@@STEP_LOG_LINE@junit@ok@@@`.
//! This module recognizes those frames, parses the command they carry, and
//! maintains the resulting step tree (see [`state`]).

pub mod state;

pub use state::{
    AnnotationState, Execution, StateSnapshot, StepCallbacks, StepId, StepLink, StepLog, StepRef,
    StepSnapshot, StepStatus, SubstepRef,
};

use crate::error::AnnotationError;

/// Sentinel framing an annotation on both ends
pub const SENTINEL: &str = "@@@";

/// Extract the payload of an annotation frame.
///
/// Returns `None` for lines that are not framed or carry an empty payload.
pub fn extract_annotation(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.len() <= 2 * SENTINEL.len()
        || !(line.starts_with(SENTINEL) && line.ends_with(SENTINEL))
    {
        return None;
    }
    let payload = line[SENTINEL.len()..line.len() - SENTINEL.len()].trim();
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

/// Build an annotation frame from a command name and its parameters
pub fn build_annotation<S: AsRef<str>>(name: &str, params: &[S]) -> String {
    let mut out = String::from(SENTINEL);
    out.push_str(name);
    for param in params {
        out.push('@');
        out.push_str(param.as_ref());
    }
    out.push_str(SENTINEL);
    out
}

/// A parsed annotation command
#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    SeedStep(String),
    StepCursor(String),
    StepStarted,
    BuildStep(String),
    StepClosed,
    StepWarnings,
    StepFailure,
    StepException,
    StepText(String),
    StepSummaryText(String),
    StepLink { label: String, url: String },
    StepLogLine { label: String, line: String },
    StepLogEnd(String),
    SetBuildProperty { name: String, value: serde_json::Value },
    HaltOnFailure,
    HonorZeroReturnCode,
}

struct Params<'a> {
    command: &'static str,
    values: Vec<&'a str>,
}

impl<'a> Params<'a> {
    fn split(rest: Option<(char, &'a str)>, max: usize, command: &'static str) -> Self {
        let values = match rest {
            None => Vec::new(),
            Some(('@', rest)) => rest.splitn(max, '@').collect(),
            Some((_, rest)) => vec![rest.trim()],
        };
        Self { command, values }
    }

    fn get(&self, index: usize, parameter: &'static str) -> Result<String, AnnotationError> {
        match self.values.get(index) {
            Some(value) if !value.is_empty() => Ok((*value).to_string()),
            _ => Err(AnnotationError::MissingParameter {
                command: self.command,
                parameter,
            }),
        }
    }

    /// Like `get`, but an empty value is allowed
    fn text(&self, index: usize, parameter: &'static str) -> Result<String, AnnotationError> {
        self.values
            .get(index)
            .map(|v| (*v).to_string())
            .ok_or(AnnotationError::MissingParameter {
                command: self.command,
                parameter,
            })
    }
}

impl Annotation {
    /// Parse an annotation payload (the text between the sentinels)
    pub fn parse(payload: &str) -> Result<Self, AnnotationError> {
        let payload = payload.trim();
        let (command, rest) = match payload.find(['@', ' ']) {
            Some(i) => {
                let sep = payload[i..].chars().next().unwrap_or('@');
                (&payload[..i], Some((sep, &payload[i + 1..])))
            }
            None => (payload, None),
        };

        let annotation = match command {
            "SEED_STEP" => Self::SeedStep(Params::split(rest, 1, "SEED_STEP").get(0, "name")?),
            "STEP_CURSOR" => {
                Self::StepCursor(Params::split(rest, 1, "STEP_CURSOR").get(0, "name")?)
            }
            "STEP_STARTED" => Self::StepStarted,
            "BUILD_STEP" => Self::BuildStep(Params::split(rest, 1, "BUILD_STEP").get(0, "name")?),
            "STEP_CLOSED" => Self::StepClosed,
            "STEP_WARNINGS" => Self::StepWarnings,
            "STEP_FAILURE" => Self::StepFailure,
            "STEP_EXCEPTION" => Self::StepException,
            "STEP_TEXT" => Self::StepText(Params::split(rest, 1, "STEP_TEXT").text(0, "text")?),
            "STEP_SUMMARY_TEXT" => Self::StepSummaryText(
                Params::split(rest, 1, "STEP_SUMMARY_TEXT").text(0, "text")?,
            ),
            "STEP_LINK" => {
                let p = Params::split(rest, 2, "STEP_LINK");
                Self::StepLink {
                    label: p.get(0, "label")?,
                    url: p.get(1, "url")?,
                }
            }
            "STEP_LOG_LINE" => {
                let p = Params::split(rest, 2, "STEP_LOG_LINE");
                Self::StepLogLine {
                    label: p.get(0, "label")?,
                    line: p.text(1, "line")?,
                }
            }
            "STEP_LOG_END" => {
                Self::StepLogEnd(Params::split(rest, 1, "STEP_LOG_END").get(0, "label")?)
            }
            "SET_BUILD_PROPERTY" => {
                let p = Params::split(rest, 2, "SET_BUILD_PROPERTY");
                let name = p.get(0, "name")?;
                let raw = p.text(1, "value")?;
                let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
                Self::SetBuildProperty { name, value }
            }
            "HALT_ON_FAILURE" => Self::HaltOnFailure,
            "HONOR_ZERO_RETURN_CODE" => Self::HonorZeroReturnCode,
            other => return Err(AnnotationError::UnknownCommand(other.to_string())),
        };
        Ok(annotation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_annotation() {
        assert_eq!(extract_annotation("  @@@FOO@bar@@@  "), Some("FOO@bar"));
        assert_eq!(extract_annotation("@@@ BUILD_STEP compile @@@"), Some("BUILD_STEP compile"));
        assert_eq!(extract_annotation("@@@@@@"), None);
        assert_eq!(extract_annotation("@@@ @@@"), None);
        assert_eq!(extract_annotation("@@@FOO"), None);
        assert_eq!(extract_annotation("FOO@@@"), None);
        assert_eq!(extract_annotation("plain output"), None);
        assert_eq!(extract_annotation(""), None);
    }

    #[test]
    fn test_build_annotation() {
        assert_eq!(
            build_annotation("STEP_LINK", &["logdog-->stdio", "https://example.com/x"]),
            "@@@STEP_LINK@logdog-->stdio@https://example.com/x@@@"
        );
        let no_params: [&str; 0] = [];
        assert_eq!(build_annotation("STEP_CLOSED", &no_params), "@@@STEP_CLOSED@@@");
    }

    #[test]
    fn test_build_then_extract_then_parse() {
        let line = build_annotation("STEP_LINK", &["label", "http://host/path?a=b"]);
        let payload = extract_annotation(&line).unwrap();
        assert_eq!(
            Annotation::parse(payload).unwrap(),
            Annotation::StepLink {
                label: "label".to_string(),
                url: "http://host/path?a=b".to_string()
            }
        );
    }

    #[test]
    fn test_parse_space_and_at_syntax() {
        assert_eq!(
            Annotation::parse("BUILD_STEP compile all").unwrap(),
            Annotation::BuildStep("compile all".to_string())
        );
        assert_eq!(
            Annotation::parse("BUILD_STEP@compile").unwrap(),
            Annotation::BuildStep("compile".to_string())
        );
        assert_eq!(Annotation::parse("STEP_CLOSED").unwrap(), Annotation::StepClosed);
    }

    #[test]
    fn test_parse_log_line_keeps_at_signs_in_line() {
        assert_eq!(
            Annotation::parse("STEP_LOG_LINE@junit@user@example.com failed").unwrap(),
            Annotation::StepLogLine {
                label: "junit".to_string(),
                line: "user@example.com failed".to_string()
            }
        );
        assert_eq!(
            Annotation::parse("STEP_LOG_LINE@junit@").unwrap(),
            Annotation::StepLogLine {
                label: "junit".to_string(),
                line: String::new()
            }
        );
    }

    #[test]
    fn test_parse_build_property_values() {
        assert_eq!(
            Annotation::parse("SET_BUILD_PROPERTY@count@3").unwrap(),
            Annotation::SetBuildProperty {
                name: "count".to_string(),
                value: serde_json::json!(3)
            }
        );
        assert_eq!(
            Annotation::parse("SET_BUILD_PROPERTY@branch@main").unwrap(),
            Annotation::SetBuildProperty {
                name: "branch".to_string(),
                value: serde_json::json!("main")
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Annotation::parse("NOT_A_COMMAND@x"),
            Err(AnnotationError::UnknownCommand(c)) if c == "NOT_A_COMMAND"
        ));
        assert!(matches!(
            Annotation::parse("BUILD_STEP"),
            Err(AnnotationError::MissingParameter { command: "BUILD_STEP", .. })
        ));
        assert!(matches!(
            Annotation::parse("STEP_LINK@only-label"),
            Err(AnnotationError::MissingParameter { parameter: "url", .. })
        ));
    }
}
