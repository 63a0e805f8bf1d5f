//! Run a command and process its output
//!
//! The [`Executor`] spawns the child with piped stdout/stderr, feeds both
//! into a [`Processor`], optionally tees them to this process's own output,
//! and returns the child's exit code together with the final step state.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::annotation::{Execution, StateSnapshot};
use crate::processor::{Processor, ProcessorOptions, Stream, DEFAULT_BUFFER_SIZE};
use crate::stream::StreamName;

/// How annotations in the child's output are treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationMode {
    /// Annotations are ordinary output
    None,
    /// Annotations are interpreted and still teed
    #[default]
    Tee,
    /// Annotations are interpreted and omitted from the tee
    Strip,
}

#[derive(Debug)]
pub struct ExecutionResult {
    /// `None` when the child was terminated by a signal
    pub exit_code: Option<i32>,
    pub snapshot: StateSnapshot,
}

pub struct Executor {
    command: Vec<String>,
    options: ProcessorOptions,
    annotate: AnnotationMode,
    tee: bool,
    buffer_size: usize,
    current_dir: Option<PathBuf>,
}

impl Executor {
    pub fn new(command: Vec<String>, options: ProcessorOptions) -> Self {
        Self {
            command,
            options,
            annotate: AnnotationMode::default(),
            tee: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            current_dir: None,
        }
    }

    pub fn annotate(mut self, mode: AnnotationMode) -> Self {
        self.annotate = mode;
        self
    }

    /// Copy the child's stdout and stderr to our own
    pub fn tee(mut self, tee: bool) -> Self {
        self.tee = tee;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub async fn run(self) -> Result<ExecutionResult> {
        let execution = self.execution_descriptor();
        let Some((program, args)) = self.command.split_first() else {
            bail!("No command to execute");
        };

        let mut options = self.options;
        options.execution = execution;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;
        info!(command = ?self.command, pid = ?child.id(), "Started process");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr"))?;

        let annotate = self.annotate != AnnotationMode::None;
        let strip = self.annotate == AnnotationMode::Strip;
        let mut stdout = Stream::new(StreamName::new("stdout")?, stdout)
            .annotate(annotate)
            .strip_annotations(strip)
            .buffer_size(self.buffer_size);
        let mut stderr = Stream::new(StreamName::new("stderr")?, stderr)
            .annotate(annotate)
            .strip_annotations(strip)
            .buffer_size(self.buffer_size);
        if self.tee {
            stdout = stdout.with_tee(tokio::io::stdout());
            stderr = stderr.with_tee(tokio::io::stderr());
        }

        let processor = Processor::new(options);
        let (streams, status) =
            tokio::join!(processor.run_streams(vec![stdout, stderr]), child.wait());

        // Steps are closed even when the child or a stream failed.
        let snapshot = processor.finish().await;
        let status = status.context("Failed to wait for process")?;
        if let Err(e) = &streams {
            warn!(error = %e, "Output processing failed");
        }
        streams.context("Failed to process output streams")?;

        debug!(?status, steps = snapshot.steps.len(), "Process finished");
        Ok(ExecutionResult {
            exit_code: status.code(),
            snapshot,
        })
    }

    fn execution_descriptor(&self) -> Execution {
        let cwd = self
            .current_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .map(|dir| dir.display().to_string());
        Execution {
            name: self.command.first().cloned().unwrap_or_default(),
            command: self.command.clone(),
            cwd,
            ..Default::default()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::annotation::StepStatus;
    use crate::processor::MeterPolicy;
    use crate::stream::MemoryClient;
    use std::sync::Arc;

    fn executor(client: &MemoryClient, script: &str) -> Executor {
        let mut options =
            ProcessorOptions::new(StreamName::new("annotee").unwrap(), Arc::new(client.clone()));
        options.meter = MeterPolicy::EndpointsOnly;
        Executor::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            options,
        )
        .tee(false)
    }

    #[tokio::test]
    async fn test_runs_command_and_tracks_steps() {
        let client = MemoryClient::new();
        let result = executor(
            &client,
            "echo '@@@BUILD_STEP compile@@@'; echo building; echo '@@@STEP_FAILURE@@@'; exit 3",
        )
        .run()
        .await
        .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert_eq!(
            client.lines("annotee/steps/compile/stdout"),
            vec!["@@@BUILD_STEP compile@@@", "building", "@@@STEP_FAILURE@@@"]
        );
        let compile = result.snapshot.step("annotee/steps/compile").unwrap();
        assert_eq!(compile.status, StepStatus::Failure);

        let execution = &result.snapshot.execution;
        assert_eq!(execution.name, "sh");
        assert_eq!(execution.command.len(), 3);
    }

    #[tokio::test]
    async fn test_annotations_ignored_without_mode() {
        let client = MemoryClient::new();
        let result = executor(&client, "echo '@@@BUILD_STEP compile@@@'")
            .annotate(AnnotationMode::None)
            .run()
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.snapshot.steps.len(), 1);
        assert_eq!(
            client.lines("annotee/stdout"),
            vec!["@@@BUILD_STEP compile@@@"]
        );
    }

    #[tokio::test]
    async fn test_current_dir_is_used_and_recorded() {
        let client = MemoryClient::new();
        let dir = tempfile::TempDir::new().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let result = executor(&client, "pwd -P")
            .current_dir(canonical.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        let expected = canonical.display().to_string();
        assert_eq!(client.lines("annotee/stdout"), vec![expected.clone()]);
        assert_eq!(result.snapshot.execution.cwd, Some(expected));
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let client = MemoryClient::new();
        let err = Executor::new(
            vec!["/nonexistent/annotee-test-binary".to_string()],
            ProcessorOptions::new(StreamName::new("annotee").unwrap(), Arc::new(client)),
        )
        .run()
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn test_empty_command_fails() {
        let client = MemoryClient::new();
        let result = Executor::new(
            Vec::new(),
            ProcessorOptions::new(StreamName::new("annotee").unwrap(), Arc::new(client)),
        )
        .run()
        .await;
        assert!(result.is_err());
    }
}
