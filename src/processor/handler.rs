//! Per-step output handling
//!
//! A [`StepHandler`] owns every output stream opened on behalf of one step:
//! the annotation stream (held by the meter task), one base stream per input
//! stream, and one stream per named log. It also queues lines to be injected
//! into the step's output ahead of the next ingested line.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::meter::{run_meter, MeterPolicy};
use crate::annotation::{build_annotation, StepId, StepRef};
use crate::clock::Clock;
use crate::error::{HandlerError, StreamError};
use crate::link::LinkGenerator;
use crate::stream::{OutputStream, StreamArchetype, StreamClient, StreamName};

/// Shared, immutable configuration for all handlers of a processor
pub(crate) struct HandlerContext {
    pub client: Arc<dyn StreamClient>,
    pub link_generator: Option<Arc<dyn LinkGenerator>>,
    pub clock: Arc<dyn Clock>,
    pub meter: MeterPolicy,
}

/// Result of resolving a stream by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLookup {
    /// The stream was already open
    Existing,
    /// The stream was opened by this call
    Created,
    /// The stream is not open and no archetype was given
    Absent,
}

pub struct StepHandler {
    step: StreamName,
    step_id: StepId,
    ctx: Arc<HandlerContext>,
    streams: HashMap<StreamName, Box<dyn OutputStream>>,
    injected_lines: Vec<String>,
    annotation_tx: Option<mpsc::Sender<Vec<u8>>>,
    meter: Option<JoinHandle<Box<dyn OutputStream>>>,
    closed: bool,
}

impl StepHandler {
    /// Open the step's annotation stream, start its meter and publish the
    /// initial snapshot.
    pub(crate) async fn new(
        ctx: Arc<HandlerContext>,
        step: StepRef<'_>,
    ) -> Result<Self, HandlerError> {
        let canonical = step.canonical_name().clone();
        let name = step.annotation_stream();
        let properties = StreamArchetype::ANNOTATIONS.properties(name.clone(), ctx.clock.now());
        let stream = ctx.client.new_stream(properties).await.map_err(|source| {
            error!(step = %canonical, error = %source, "Failed to create annotation stream");
            HandlerError::Stream {
                step: canonical.clone(),
                stream: name,
                source,
            }
        })?;

        // Capacity 1 is the smallest tokio allows; senders wait on the meter.
        let (tx, rx) = mpsc::channel(1);
        let meter = tokio::spawn(run_meter(stream, rx, ctx.meter, canonical.clone()));
        debug!(step = %canonical, "Created step handler");

        let mut handler = Self {
            step: canonical,
            step_id: step.id(),
            ctx,
            streams: HashMap::new(),
            injected_lines: Vec::new(),
            annotation_tx: Some(tx),
            meter: Some(meter),
            closed: false,
        };
        handler.updated(step).await;
        Ok(handler)
    }

    pub fn step_id(&self) -> StepId {
        self.step_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Serialize the step now and hand the snapshot to the meter
    pub async fn updated(&mut self, step: StepRef<'_>) {
        if self.closed {
            return;
        }
        let data = match serde_json::to_vec(&step.snapshot()) {
            Ok(data) => data,
            Err(source) => {
                let err = HandlerError::Snapshot {
                    step: self.step.clone(),
                    source,
                };
                error!(error = %err, "Failed to marshal state");
                return;
            }
        };
        if let Some(tx) = &self.annotation_tx {
            if tx.send(data).await.is_err() {
                warn!(step = %self.step, "Annotation meter is no longer running");
            }
        }
    }

    /// Stop the meter and close every stream. Safe to call more than once.
    ///
    /// `changed` reports whether closing the step altered its state, in which
    /// case one final snapshot is published first.
    pub async fn close(&mut self, step: StepRef<'_>, changed: bool) {
        if self.closed {
            return;
        }
        if changed {
            self.updated(step).await;
        }

        self.annotation_tx.take();
        if let Some(meter) = self.meter.take() {
            match meter.await {
                Ok(stream) => close_output(&self.step, stream).await,
                Err(e) => error!(step = %self.step, error = %e, "Annotation meter task failed"),
            }
        }

        self.close_all_streams().await;
        self.closed = true;
        debug!(step = %self.step, "Closed step handler");
    }

    /// Look up an open stream, opening it from `archetype` when absent
    pub async fn resolve_stream(
        &mut self,
        name: &StreamName,
        archetype: Option<&StreamArchetype>,
    ) -> Result<StreamLookup, HandlerError> {
        if self.closed {
            return Err(HandlerError::Closed {
                step: self.step.clone(),
                stream: name.clone(),
            });
        }
        if self.streams.contains_key(name) {
            return Ok(StreamLookup::Existing);
        }
        let Some(archetype) = archetype else {
            return Ok(StreamLookup::Absent);
        };

        let properties = archetype.properties(name.clone(), self.ctx.clock.now());
        let stream = self
            .ctx
            .client
            .new_stream(properties)
            .await
            .map_err(|source| self.stream_error(name, source))?;
        self.streams.insert(name.clone(), stream);
        Ok(StreamLookup::Created)
    }

    pub async fn write_line(&mut self, name: &StreamName, line: &str) -> Result<(), HandlerError> {
        let result = match self.streams.get_mut(name) {
            Some(stream) => stream.write_line(line).await,
            None => Err(StreamError::Closed(name.clone())),
        };
        result.map_err(|source| self.stream_error(name, source))
    }

    /// Write a line of input stream `input` to this step's base stream for it.
    ///
    /// `alias` names the stream in the link injected when the base stream is
    /// first opened.
    pub async fn write_base_stream(
        &mut self,
        step: StepRef<'_>,
        input: &StreamName,
        alias: Option<&str>,
        line: &str,
    ) -> Result<(), HandlerError> {
        let name = step.base_stream(input);
        if self
            .resolve_stream(&name, Some(&StreamArchetype::TEXT))
            .await?
            == StreamLookup::Created
        {
            let text = alias.unwrap_or_else(|| input.last_segment());
            self.maybe_inject_link("stdio", text, &[name.clone()]);
        }
        self.write_line(&name, line).await
    }

    /// Write a line to one of the step's named logs, opening it on first use
    pub(crate) async fn write_log_line(&mut self, name: &StreamName, label: &str, line: &str) {
        match self.resolve_stream(name, Some(&StreamArchetype::TEXT)).await {
            Ok(StreamLookup::Created) => self.maybe_inject_link(label, "logdog", &[name.clone()]),
            Ok(_) => {}
            Err(e) => {
                error!(step = %self.step, stream = %name, error = %e, "Failed to get log substream");
                return;
            }
        }
        if let Err(e) = self.write_line(name, line).await {
            error!(stream = %name, error = %e, "Failed to export log line");
        }
    }

    /// Close and forget one stream; no-op if it is not open
    pub async fn close_stream(&mut self, name: &StreamName) {
        if let Some(stream) = self.streams.remove(name) {
            close_output(&self.step, stream).await;
        }
    }

    async fn close_all_streams(&mut self) {
        let streams: Vec<_> = self.streams.drain().map(|(_, s)| s).collect();
        for stream in streams {
            close_output(&self.step, stream).await;
        }
    }

    pub fn inject_lines<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.injected_lines
            .extend(lines.into_iter().map(Into::into));
    }

    /// Take every queued injected line, leaving the queue empty
    pub fn flush_injected_lines(&mut self) -> Vec<String> {
        std::mem::take(&mut self.injected_lines)
    }

    fn maybe_inject_link(&mut self, base: &str, text: &str, names: &[StreamName]) {
        let link = self
            .ctx
            .link_generator
            .as_ref()
            .and_then(|generator| generator.link(names))
            .filter(|link| !link.is_empty());
        if let Some(link) = link {
            let line = build_annotation("STEP_LINK", &[format!("{}-->{}", text, base), link]);
            self.inject_lines([line]);
        }
    }

    fn stream_error(&self, name: &StreamName, source: StreamError) -> HandlerError {
        HandlerError::Stream {
            step: self.step.clone(),
            stream: name.clone(),
            source,
        }
    }
}

async fn close_output(step: &StreamName, mut stream: Box<dyn OutputStream>) {
    if let Err(e) = stream.close().await {
        error!(step = %step, stream = %stream.name(), error = %e, "Failed to close step stream");
    }
}

impl std::fmt::Debug for StepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepHandler")
            .field("step", &self.step)
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .field("injected_lines", &self.injected_lines.len())
            .field("closed", &self.closed)
            .finish()
    }
}
