//! Registry of live step handlers
//!
//! The registry is the processor's implementation of [`StepCallbacks`]: the
//! annotation state owns it and notifies it whenever a step changes.

use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

use super::handler::{HandlerContext, StepHandler};
use crate::annotation::{StepCallbacks, StepRef};
use crate::error::HandlerError;
use crate::stream::StreamName;

pub(crate) struct StepRegistry {
    ctx: Arc<HandlerContext>,
    handlers: HashMap<StreamName, StepHandler>,
}

impl StepRegistry {
    pub(crate) fn new(ctx: HandlerContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            handlers: HashMap::new(),
        }
    }

    /// Handler for `step`, created on first use
    pub(crate) async fn handler(
        &mut self,
        step: StepRef<'_>,
    ) -> Result<&mut StepHandler, HandlerError> {
        match self.handlers.entry(step.canonical_name().clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let handler = StepHandler::new(Arc::clone(&self.ctx), step)
                    .await
                    .inspect_err(|e| {
                        error!(step = %step.canonical_name(), error = %e, "Failed to create step handler");
                    })?;
                Ok(entry.insert(handler))
            }
        }
    }

    pub(crate) fn existing(&mut self, step: StepRef<'_>) -> Option<&mut StepHandler> {
        self.handlers.get_mut(step.canonical_name())
    }

    /// Remove a handler so its close sequence runs exactly once
    pub(crate) fn take(&mut self, name: &StreamName) -> Option<StepHandler> {
        self.handlers.remove(name)
    }

    pub(crate) fn names(&self) -> Vec<StreamName> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait]
impl StepCallbacks for StepRegistry {
    async fn step_closed(&mut self, step: StepRef<'_>) {
        if let Some(mut handler) = self.take(step.canonical_name()) {
            handler.close(step, false).await;
        }
    }

    async fn updated(&mut self, step: StepRef<'_>) {
        if let Some(handler) = self.existing(step) {
            handler.updated(step).await;
        }
    }

    async fn step_log_line(
        &mut self,
        step: StepRef<'_>,
        stream: &StreamName,
        label: &str,
        line: &str,
    ) {
        if let Ok(handler) = self.handler(step).await {
            handler.write_log_line(stream, label, line).await;
        }
    }

    async fn step_log_end(&mut self, step: StepRef<'_>, stream: &StreamName) {
        if let Some(handler) = self.existing(step) {
            handler.close_stream(stream).await;
        }
    }
}
