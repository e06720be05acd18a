use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};

use crate::pipeline::job::Job;
use crate::pipeline::stage::{Stage, StageOptions};
use crate::record::Record;
use crate::stages::opener::Opener;
use crate::stages::passthrough::Passthrough;
use crate::stages::source::InStream;
use crate::stages::transform::{Transform, TransformFn};

/// A `(stage, options)` pair, frozen once the pipeline is built.
#[derive(Clone)]
pub struct StageDescriptor {
    stage: Arc<dyn Stage>,
    options: StageOptions,
}

impl StageDescriptor {
    pub fn stage(&self) -> &Arc<dyn Stage> {
        &self.stage
    }

    pub fn options(&self) -> StageOptions {
        self.options
    }
}

/// An ordered, append-only list of stage descriptors.
///
/// Appending resolves options, runs the new stage's add hook against the
/// nearest prior targetable stage, and honors no-op elision. `build`
/// snapshots the list into a [`Job`].
#[derive(Default)]
pub struct Pipeline {
    descriptors: Vec<StageDescriptor>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shortcut for a pipeline that starts by opening `path`.
    ///
    /// A directory path emits every contained file; narrow the set with
    /// [`Select`](crate::stages::select::Select).
    pub fn open(path: impl Into<std::path::PathBuf>) -> Self {
        Self::new().then(Opener::new(path))
    }

    /// Append a stage, resolving options from its defaults hook.
    pub fn then(self, stage: impl Stage) -> Self {
        self.then_shared(Arc::new(stage), None)
    }

    /// Append a stage with explicit options.
    pub fn then_with(self, stage: impl Stage, options: StageOptions) -> Self {
        self.then_shared(Arc::new(stage), Some(options))
    }

    /// Append an already-shared stage. The caller keeps its handle, which is
    /// how tests and add hooks observe a stage after the run.
    pub fn then_shared(mut self, stage: Arc<dyn Stage>, options: Option<StageOptions>) -> Self {
        let options = options.unwrap_or_else(|| stage.default_options());

        if let Some(prev) = self.last_targetable() {
            stage.on_add(prev.as_ref());
        }

        if stage.elide() {
            return self;
        }

        self.descriptors.push(StageDescriptor { stage, options });
        self
    }

    /// Append a pass-through tee that forwards each record to `out` and, when
    /// a downstream stage exists, downstream as well.
    pub fn stream_to(self, out: Sender<Record>) -> Self {
        self.then(Passthrough::new(out))
    }

    /// Append a tee with a name and close behavior.
    pub fn stream_to_with(self, out: Sender<Record>, opts: StreamToOpts) -> Self {
        let mut stage = Passthrough::new(out).no_close(opts.no_close);
        if let Some(name) = opts.name {
            stage = stage.named(name);
        }
        self.then(stage)
    }

    /// Append a transform stage applying `f` to every record. A non-`Ok`
    /// return fails the pipeline.
    pub fn for_each(self, f: impl TransformFn) -> Self {
        self.then(Transform::new(f))
    }

    /// Append a named transform stage.
    pub fn for_each_named(self, f: impl TransformFn, name: impl Into<String>) -> Self {
        self.then(Transform::new(f).named(name))
    }

    /// Append an in-stream source reading records from `input`.
    pub fn source_from(self, input: Receiver<Record>, name: impl Into<String>) -> Self {
        self.then(InStream::new(name, input))
    }

    /// The descriptor list as appended so far.
    pub fn descriptors(&self) -> &[StageDescriptor] {
        &self.descriptors
    }

    /// Snapshot the descriptor list into a runnable [`Job`].
    pub fn build(self) -> Job {
        Job::new(self.descriptors)
    }

    /// The most recently appended stage that is targetable by add hooks.
    fn last_targetable(&self) -> Option<&Arc<dyn Stage>> {
        self.descriptors
            .iter()
            .rev()
            .map(|d| &d.stage)
            .find(|s| s.targetable())
    }
}

/// Options for [`Pipeline::stream_to_with`].
#[derive(Default)]
pub struct StreamToOpts {
    /// Name used in log events.
    pub name: Option<String>,
    /// Keep the external sender open once the stage has finished, so the
    /// channel can be reused across jobs.
    pub no_close: bool,
}
