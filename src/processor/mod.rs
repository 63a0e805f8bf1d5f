//! Annotation stream processor
//!
//! The [`Processor`] consumes any number of process output streams, feeds
//! annotations found in them into the step state, and forwards every line to
//! the output stream belonging to the step that was current when the line
//! was read.

pub mod handler;
pub mod line_reader;
pub mod meter;
mod registry;


pub use handler::{StepHandler, StreamLookup};
pub use line_reader::LineReader;
pub use meter::{run_meter, MeterPolicy};

use futures::future::join_all;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::annotation::{extract_annotation, AnnotationState, Execution, StateSnapshot};
use crate::clock::{Clock, SystemClock};
use crate::error::{ProcessorError, StreamFailure, StreamFailures};
use crate::link::LinkGenerator;
use crate::stream::{StreamClient, StreamName};
use handler::HandlerContext;
use registry::StepRegistry;

/// Read buffer size used when a stream does not specify one
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One process output stream to be consumed
pub struct Stream {
    /// Processed until it reports end of input or an error
    pub reader: BoxedReader,
    /// Logical name, e.g. `stdout`; used to name the per-step base streams
    pub name: StreamName,
    /// Receives every consumed line when set
    pub tee: Option<BoxedWriter>,
    /// Display name used in injected links instead of the last name segment
    pub alias: Option<String>,
    /// Interpret annotations found in this stream
    pub annotate: bool,
    /// Do not forward annotation lines to `tee`
    pub strip_annotations: bool,
    /// Read buffer size; zero selects [`DEFAULT_BUFFER_SIZE`]
    pub buffer_size: usize,
}

impl Stream {
    pub fn new(name: StreamName, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            name,
            tee: None,
            alias: None,
            annotate: false,
            strip_annotations: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_tee(mut self, tee: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.tee = Some(Box::new(tee));
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn annotate(mut self, annotate: bool) -> Self {
        self.annotate = annotate;
        self
    }

    pub fn strip_annotations(mut self, strip: bool) -> Self {
        self.strip_annotations = strip;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    fn take_reader(&mut self) -> BoxedReader {
        std::mem::replace(&mut self.reader, Box::new(tokio::io::empty()))
    }
}

/// Fixed configuration of a processor
pub struct ProcessorOptions {
    /// Prepended to every generated stream name
    pub base: StreamName,
    /// When set, links to newly opened streams are injected into the output
    pub link_generator: Option<Arc<dyn LinkGenerator>>,
    pub client: Arc<dyn StreamClient>,
    pub execution: Execution,
    pub meter: MeterPolicy,
    pub clock: Arc<dyn Clock>,
}

impl ProcessorOptions {
    pub fn new(base: StreamName, client: Arc<dyn StreamClient>) -> Self {
        Self {
            base,
            link_generator: None,
            client,
            execution: Execution::default(),
            meter: MeterPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

struct Core {
    state: AnnotationState<StepRegistry>,
}

impl Core {
    async fn ingest_line(&mut self, stream: &mut Stream, line: &str) -> Result<(), ProcessorError> {
        let annotation = extract_annotation(line);
        if let Some(annotation) = annotation {
            debug!(stream = %stream.name, annotation, "Annotation");
        }

        let step_id = if stream.annotate {
            if let Some(annotation) = annotation {
                if let Err(e) = self.state.append(annotation).await {
                    error!(stream = %stream.name, annotation, error = %e, "Failed to process annotation");
                }
            }
            self.state.current_step().id()
        } else {
            self.state.root_step().id()
        };

        let (step, registry) = self.state.step_and_callbacks(step_id);
        let handler = registry.handler(step).await?;

        let mut output = handler.flush_injected_lines();
        output.push(line.to_string());

        let mut first_error = None;
        for line in &output {
            let strip = stream.strip_annotations && extract_annotation(line).is_some();
            if let Some(tee) = stream.tee.as_mut().filter(|_| !strip) {
                if let Err(source) = write_text_line(tee, line).await {
                    warn!(stream = %stream.name, error = %source, "Failed to tee line");
                    first_error.get_or_insert(ProcessorError::Tee {
                        stream: stream.name.clone(),
                        source,
                    });
                }
            }

            if let Err(e) = handler
                .write_base_stream(step, &stream.name, stream.alias.as_deref(), line)
                .await
            {
                warn!(stream = %stream.name, error = %e, "Failed to send line to stream");
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn finish(&mut self) -> StateSnapshot {
        for name in self.state.callbacks().names() {
            // Step-closed callbacks may already have removed this handler.
            let Some(mut handler) = self.state.callbacks_mut().take(&name) else {
                continue;
            };
            let step_id = handler.step_id();
            let changed = self.state.close_step(step_id).await;
            let step = self.state.step(step_id);
            handler.close(step, changed).await;
        }
        self.state.snapshot()
    }
}

async fn write_text_line(w: &mut BoxedWriter, line: &str) -> io::Result<()> {
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await
}

/// Consumes process streams and forwards them to per-step output streams.
///
/// Cloning yields another handle to the same processor.
#[derive(Clone)]
pub struct Processor {
    core: Arc<Mutex<Core>>,
}

impl Processor {
    pub fn new(options: ProcessorOptions) -> Self {
        let registry = StepRegistry::new(HandlerContext {
            client: options.client,
            link_generator: options.link_generator,
            clock: Arc::clone(&options.clock),
            meter: options.meter,
        });
        let state = AnnotationState::new(options.base, options.execution, options.clock, registry);
        Self {
            core: Arc::new(Mutex::new(Core { state })),
        }
    }

    /// Consume every stream until it ends, ingesting lines as they arrive.
    ///
    /// Streams are read concurrently; a failing stream does not stop the
    /// others. Every failed stream is listed in the returned error.
    pub async fn run_streams(&self, streams: Vec<Stream>) -> Result<(), ProcessorError> {
        let mut names = Vec::with_capacity(streams.len());
        let mut tasks = Vec::with_capacity(streams.len());
        for stream in streams {
            names.push(stream.name.clone());
            let core = Arc::clone(&self.core);
            tasks.push(tokio::spawn(consume_stream(core, stream)));
        }

        let mut failures = Vec::new();
        for (name, result) in names.into_iter().zip(join_all(tasks).await) {
            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(join_error) => io::Error::other(join_error.to_string()),
            };
            error!(stream = %name, error = %error, "Stream terminated with error");
            failures.push(StreamFailure {
                stream: name,
                error,
            });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProcessorError::Streams(StreamFailures(failures)))
        }
    }

    /// Ingest a single line read from `stream`, responding to any annotation
    /// it carries.
    ///
    /// Processing continues past individual write failures; the first one is
    /// returned. Failure to create the step's annotation stream is returned
    /// without writing anything.
    pub async fn ingest_line(&self, stream: &mut Stream, line: &str) -> Result<(), ProcessorError> {
        self.core.lock().await.ingest_line(stream, line).await
    }

    /// Close every outstanding step handler and return the final state.
    ///
    /// Call once all streams have been consumed.
    pub async fn finish(&self) -> StateSnapshot {
        self.core.lock().await.finish().await
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.core.lock().await.state.snapshot()
    }

    /// Number of step handlers that have not been closed yet
    pub async fn open_handlers(&self) -> usize {
        self.core.lock().await.state.callbacks().len()
    }
}

async fn consume_stream(core: Arc<Mutex<Core>>, mut stream: Stream) -> io::Result<()> {
    let buffer_size = match stream.buffer_size {
        0 => DEFAULT_BUFFER_SIZE,
        n => n,
    };
    let mut reader = LineReader::new(stream.take_reader(), buffer_size);
    while let Some(line) = reader.next_line().await? {
        let mut core = core.lock().await;
        if let Err(e) = core.ingest_line(&mut stream, &line).await {
            error!(stream = %stream.name, line, error = %e, "Failed to ingest line");
        }
    }
    Ok(())
}
