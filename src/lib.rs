//! # Annotee
//!
//! Translates step annotations embedded in a process's output into
//! structured, per-step log streams.
//!
//! A build script marks its progress with lines such as
//! `@@@BUILD_STEP compile@@@`. Annotee reads the process's stdout and stderr,
//! tracks a tree of steps from those annotations, and routes every output
//! line to a stream belonging to the step that was running when the line was
//! written. Each step also gets a datagram stream carrying JSON snapshots of
//! its state, published at a bounded rate.
//!
//! ## Usage
//!
//! ```bash
//! annotee --output-dir out/ --annotate strip -- ./build.sh
//! ```
//!
//! ## Modules
//!
//! - `annotation` - Annotation frames and the step state they drive
//! - `processor` - Stream ingestion, per-step handlers and snapshot metering
//! - `stream` - Output stream names and clients (memory, filesystem)
//! - `link` - Viewer links injected for newly opened streams
//! - `executor` - Runs a command and wires its output into a processor
//! - `config` - TOML configuration for the binary
pub mod annotation;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod link;
pub mod logging;
pub mod processor;
pub mod stream;

pub use annotation::{AnnotationState, StateSnapshot, StepSnapshot, StepStatus};
pub use error::{AnnotationError, ConfigError, HandlerError, ProcessorError, StreamError};
pub use processor::{Processor, ProcessorOptions, Stream};
pub use stream::{MemoryClient, StreamClient, StreamName};
