//! Hierarchical step state driven by annotation commands
//!
//! The tree always has a root step, named after the naming base. Steps are
//! stored in an arena and addressed by [`StepId`]; readers get a borrowed
//! [`StepRef`] view. Every state change is reported synchronously through
//! the [`StepCallbacks`] registered at construction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::Annotation;
use crate::clock::Clock;
use crate::error::AnnotationError;
use crate::stream::StreamName;

const STEPS_SEGMENT: &str = "steps";
const LOGS_SEGMENT: &str = "logs";
const ANNOTATIONS_SEGMENT: &str = "annotations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(usize);

/// Describes the process whose output is being annotated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub name: String,
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Step status, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Warning,
    Failure,
    Exception,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLink {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLog {
    pub label: String,
    pub stream: StreamName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstepRef {
    pub name: String,
    pub annotation_stream: StreamName,
}

/// Serializable view of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub name: String,
    pub canonical_name: StreamName,
    pub status: StepStatus,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<StepLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<StepLog>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub substeps: Vec<SubstepRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<Execution>,
}

/// Serializable view of the whole tree, steps in creation order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub execution: Execution,
    pub steps: Vec<StepSnapshot>,
}

impl StateSnapshot {
    pub fn step(&self, canonical_name: &str) -> Option<&StepSnapshot> {
        self.steps
            .iter()
            .find(|s| s.canonical_name.as_str() == canonical_name)
    }
}

#[derive(Debug)]
struct Step {
    parent: Option<StepId>,
    name: String,
    canonical: StreamName,
    status: StepStatus,
    started: Option<DateTime<Utc>>,
    ended: Option<DateTime<Utc>>,
    text: Vec<String>,
    summary: Option<String>,
    links: Vec<StepLink>,
    logs: Vec<StepLog>,
    properties: BTreeMap<String, serde_json::Value>,
    children: Vec<StepId>,
    closed: bool,
}

#[derive(Debug)]
struct StepTree {
    steps: Vec<Step>,
    execution: Execution,
}

impl StepTree {
    const ROOT: StepId = StepId(0);

    fn get(&self, id: StepId) -> &Step {
        &self.steps[id.0]
    }

    fn get_mut(&mut self, id: StepId) -> &mut Step {
        &mut self.steps[id.0]
    }

    fn view(&self, id: StepId) -> StepRef<'_> {
        StepRef { tree: self, id }
    }

    fn add(&mut self, parent: StepId, name: String) -> StepId {
        let prefix = self.get(parent).canonical.child(STEPS_SEGMENT);
        let base = StreamName::normalize(&name);
        let mut canonical = prefix.join(&base);
        let mut n = 1;
        while self.steps.iter().any(|s| s.canonical == canonical) {
            canonical = prefix.child(&format!("{}_{}", base, n));
            n += 1;
        }

        let id = StepId(self.steps.len());
        self.steps.push(Step {
            parent: Some(parent),
            name,
            canonical,
            status: StepStatus::Pending,
            started: None,
            ended: None,
            text: Vec::new(),
            summary: None,
            links: Vec::new(),
            logs: Vec::new(),
            properties: BTreeMap::new(),
            children: Vec::new(),
            closed: false,
        });
        self.get_mut(parent).children.push(id);
        id
    }

    /// Open steps of the subtree rooted at `id`, descendants before ancestors
    fn open_subtree_post_order(&self, id: StepId) -> Vec<StepId> {
        let mut out = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                out.push(current);
                continue;
            }
            stack.push((current, true));
            for &child in self.get(current).children.iter().rev() {
                if !self.get(child).closed {
                    stack.push((child, false));
                }
            }
        }
        out
    }
}

/// Borrowed view of a single step
#[derive(Clone, Copy)]
pub struct StepRef<'a> {
    tree: &'a StepTree,
    id: StepId,
}

impl<'a> StepRef<'a> {
    fn step(&self) -> &'a Step {
        self.tree.get(self.id)
    }

    pub fn id(&self) -> StepId {
        self.id
    }

    pub fn name(&self) -> &'a str {
        &self.step().name
    }

    /// Unique hierarchical name, e.g. `annotee/steps/compile`
    pub fn canonical_name(&self) -> &'a StreamName {
        &self.step().canonical
    }

    pub fn status(&self) -> StepStatus {
        self.step().status
    }

    pub fn is_closed(&self) -> bool {
        self.step().closed
    }

    pub fn is_root(&self) -> bool {
        self.id == StepTree::ROOT
    }

    pub fn annotation_stream(&self) -> StreamName {
        self.canonical_name().child(ANNOTATIONS_SEGMENT)
    }

    /// Stream carrying this step's share of an input stream
    pub fn base_stream(&self, stream: &StreamName) -> StreamName {
        self.canonical_name().join(stream)
    }

    pub fn log_stream(&self, label: &str) -> StreamName {
        self.canonical_name()
            .child(LOGS_SEGMENT)
            .join(&StreamName::normalize(label))
    }

    pub fn snapshot(&self) -> StepSnapshot {
        let step = self.step();
        StepSnapshot {
            name: step.name.clone(),
            canonical_name: step.canonical.clone(),
            status: step.status,
            started: step.started,
            ended: step.ended,
            text: step.text.clone(),
            summary: step.summary.clone(),
            links: step.links.clone(),
            logs: step.logs.clone(),
            properties: step.properties.clone(),
            substeps: step
                .children
                .iter()
                .map(|&child| {
                    let child = self.tree.view(child);
                    SubstepRef {
                        name: child.name().to_string(),
                        annotation_stream: child.annotation_stream(),
                    }
                })
                .collect(),
            execution: self.is_root().then(|| self.tree.execution.clone()),
        }
    }
}

impl std::fmt::Debug for StepRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StepRef").field(self.canonical_name()).finish()
    }
}

/// Lifecycle notifications emitted while the state is mutated
#[async_trait]
pub trait StepCallbacks: Send {
    /// The step (and all of its descendants, reported first) was closed
    async fn step_closed(&mut self, step: StepRef<'_>);

    /// The step's serializable state changed
    async fn updated(&mut self, step: StepRef<'_>);

    /// A line was emitted to one of the step's named logs
    async fn step_log_line(
        &mut self,
        step: StepRef<'_>,
        stream: &StreamName,
        label: &str,
        line: &str,
    );

    /// A named log of the step has ended
    async fn step_log_end(&mut self, step: StepRef<'_>, stream: &StreamName);
}

/// Step tree plus the cursor identifying the step currently receiving output
pub struct AnnotationState<C> {
    tree: StepTree,
    cursor: StepId,
    clock: Arc<dyn Clock>,
    callbacks: C,
}

impl<C: StepCallbacks> AnnotationState<C> {
    pub fn new(base: StreamName, execution: Execution, clock: Arc<dyn Clock>, callbacks: C) -> Self {
        let root = Step {
            parent: None,
            name: base.last_segment().to_string(),
            canonical: base,
            status: StepStatus::Running,
            started: Some(clock.now()),
            ended: None,
            text: Vec::new(),
            summary: None,
            links: Vec::new(),
            logs: Vec::new(),
            properties: BTreeMap::new(),
            children: Vec::new(),
            closed: false,
        };
        Self {
            tree: StepTree {
                steps: vec![root],
                execution,
            },
            cursor: StepTree::ROOT,
            clock,
            callbacks,
        }
    }

    pub fn root_step(&self) -> StepRef<'_> {
        self.tree.view(StepTree::ROOT)
    }

    pub fn current_step(&self) -> StepRef<'_> {
        self.tree.view(self.cursor)
    }

    pub fn step(&self, id: StepId) -> StepRef<'_> {
        self.tree.view(id)
    }

    pub fn steps(&self) -> impl Iterator<Item = StepRef<'_>> {
        (0..self.tree.steps.len()).map(move |i| self.tree.view(StepId(i)))
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    /// Borrow a step and the callbacks at the same time
    pub fn step_and_callbacks(&mut self, id: StepId) -> (StepRef<'_>, &mut C) {
        (self.tree.view(id), &mut self.callbacks)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            execution: self.tree.execution.clone(),
            steps: self.steps().map(|s| s.snapshot()).collect(),
        }
    }

    /// Apply one annotation payload to the tree
    pub async fn append(&mut self, payload: &str) -> Result<(), AnnotationError> {
        let cursor = self.cursor;
        match Annotation::parse(payload)? {
            Annotation::SeedStep(name) => {
                if self.find_pending_child(StepTree::ROOT, &name).is_none() {
                    self.tree.add(StepTree::ROOT, name);
                    self.fire_updated(StepTree::ROOT).await;
                }
            }
            Annotation::StepCursor(name) => {
                self.cursor = self
                    .tree
                    .steps
                    .iter()
                    .rposition(|s| s.name == name && !s.closed)
                    .map(StepId)
                    .ok_or(AnnotationError::UnknownStep(name))?;
            }
            Annotation::StepStarted => {
                self.start(cursor);
                self.fire_updated(cursor).await;
            }
            Annotation::BuildStep(name) => {
                if cursor != StepTree::ROOT {
                    self.close_step(cursor).await;
                }
                let id = match self.find_pending_child(StepTree::ROOT, &name) {
                    Some(id) => id,
                    None => {
                        let id = self.tree.add(StepTree::ROOT, name);
                        self.fire_updated(StepTree::ROOT).await;
                        id
                    }
                };
                self.start(id);
                self.cursor = id;
                self.fire_updated(id).await;
            }
            Annotation::StepClosed => {
                if cursor == StepTree::ROOT {
                    return Err(AnnotationError::CloseRoot);
                }
                self.close_step(cursor).await;
            }
            Annotation::StepWarnings => self.raise_status(cursor, StepStatus::Warning).await,
            Annotation::StepFailure => self.raise_status(cursor, StepStatus::Failure).await,
            Annotation::StepException => self.raise_status(cursor, StepStatus::Exception).await,
            Annotation::StepText(text) => {
                self.tree.get_mut(cursor).text.push(text);
                self.fire_updated(cursor).await;
            }
            Annotation::StepSummaryText(text) => {
                self.tree.get_mut(cursor).summary = Some(text);
                self.fire_updated(cursor).await;
            }
            Annotation::StepLink { label, url } => {
                self.tree.get_mut(cursor).links.push(StepLink { label, url });
                self.fire_updated(cursor).await;
            }
            Annotation::StepLogLine { label, line } => {
                let stream = self.tree.view(cursor).log_stream(&label);
                let step = self.tree.get_mut(cursor);
                let added = !step.logs.iter().any(|l| l.stream == stream);
                if added {
                    step.logs.push(StepLog {
                        label: label.clone(),
                        stream: stream.clone(),
                    });
                }
                self.callbacks
                    .step_log_line(self.tree.view(cursor), &stream, &label, &line)
                    .await;
                if added {
                    self.fire_updated(cursor).await;
                }
            }
            Annotation::StepLogEnd(label) => {
                let stream = self.tree.view(cursor).log_stream(&label);
                self.callbacks
                    .step_log_end(self.tree.view(cursor), &stream)
                    .await;
            }
            Annotation::SetBuildProperty { name, value } => {
                self.tree.get_mut(cursor).properties.insert(name, value);
                self.fire_updated(cursor).await;
            }
            Annotation::HaltOnFailure | Annotation::HonorZeroReturnCode => {}
        }
        Ok(())
    }

    /// Close a step and its open descendants.
    ///
    /// Returns `false` if the step was already closed. Each closed step is
    /// reported with `updated` followed by `step_closed`.
    pub async fn close_step(&mut self, id: StepId) -> bool {
        if self.tree.get(id).closed {
            return false;
        }
        for step_id in self.tree.open_subtree_post_order(id) {
            let now = self.clock.now();
            let step = self.tree.get_mut(step_id);
            step.closed = true;
            step.ended = Some(now);
            if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                step.status = StepStatus::Success;
            }
            if self.cursor == step_id {
                self.cursor = step.parent.unwrap_or(StepTree::ROOT);
            }
            self.fire_updated(step_id).await;
            self.callbacks.step_closed(self.tree.view(step_id)).await;
        }
        true
    }

    fn find_pending_child(&self, parent: StepId, name: &str) -> Option<StepId> {
        self.tree
            .get(parent)
            .children
            .iter()
            .copied()
            .find(|&id| {
                let s = self.tree.get(id);
                s.name == name && s.status == StepStatus::Pending && !s.closed
            })
    }

    fn start(&mut self, id: StepId) {
        let now = self.clock.now();
        let step = self.tree.get_mut(id);
        if step.started.is_none() {
            step.started = Some(now);
        }
        if step.status == StepStatus::Pending {
            step.status = StepStatus::Running;
        }
    }

    async fn raise_status(&mut self, id: StepId, status: StepStatus) {
        let step = self.tree.get_mut(id);
        if status > step.status {
            step.status = status;
        }
        self.fire_updated(id).await;
    }

    async fn fire_updated(&mut self, id: StepId) {
        self.callbacks.updated(self.tree.view(id)).await;
    }
}
