use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::error::Result;
use crate::pipeline::abort::AbortAck;
use crate::record::Record;

/// Per-stage buffer configuration, declared at append time.
///
/// A zero buffer size means "rendezvous": the intermediate channel is
/// allocated with the minimum capacity of one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOptions {
    /// Capacity of the channel feeding into this stage.
    pub in_buffer: usize,
    /// Capacity of the channel this stage emits on.
    pub out_buffer: usize,
}

/// The per-run handle a stage receives.
///
/// `input` is `None` for the first stage and `output` is `None` for the
/// last. The abort channel delivers ack senders: replying couples the abort
/// request and its acknowledgement in a single hand-off.
///
/// Dropping the context (or just its `output` sender) when `run` returns is
/// what closes the downstream channel; a stage must not stash a clone of the
/// sender anywhere that outlives its `run`.
pub struct StageContext {
    pub input: Option<Receiver<Record>>,
    pub output: Option<Sender<Record>>,
    pub abort: Receiver<AbortAck>,
}

/// One unit of pipeline work.
///
/// `run` is the whole contract; everything else is an optional capability a
/// stage may opt into. A stage's main loop must `select!` its abort channel
/// alongside every receive and send so the job can always unblock it.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Human-readable stage name, used in errors and log events.
    fn name(&self) -> &str;

    /// Process records until the input closes, the work is finished, or an
    /// abort arrives.
    async fn run(&self, ctx: StageContext) -> Result<()>;

    /// Preferred buffer sizes, used when the caller supplies none.
    fn default_options(&self) -> StageOptions {
        StageOptions::default()
    }

    /// Invoked synchronously at append time with the nearest prior
    /// targetable stage. Used to back-configure an earlier stage.
    fn on_add(&self, _prev: &dyn Stage) {}

    /// Invoked after every stage worker has returned, in pipeline order.
    async fn on_done(&self) -> Result<()> {
        Ok(())
    }

    /// When true, the job treats an abort as complete once delivered and
    /// does not wait for an ack reply.
    fn skip_abort_ack(&self) -> bool {
        false
    }

    /// When true, the stage is not appended at all; it exists only for its
    /// add hook.
    fn elide(&self) -> bool {
        false
    }

    /// When false, the stage is skipped by the add-hook "previous stage"
    /// lookup (pass-through tees).
    fn targetable(&self) -> bool {
        true
    }

    /// Selection capability handle, if the stage supports one.
    fn as_selectable(&self) -> Option<&dyn Selectable> {
        None
    }

    /// Spool capability handle, if the stage can materialize payloads to a
    /// directory on behalf of a later stage.
    fn as_spool_target(&self) -> Option<&dyn SpoolTarget> {
        None
    }
}

/// A stage whose notion of "items" (file names, record paths) can be
/// narrowed by selection patterns.
pub trait Selectable: Send + Sync {
    /// Apply selection patterns.
    ///
    /// # Panics
    ///
    /// Implementations that compile patterns (e.g. as regexes) panic on an
    /// invalid pattern, mirroring the append-time contract of
    /// [`Select`](crate::stages::select::Select).
    fn set_selection(&self, patterns: &[String]);
}

/// A stage that can be asked, at append time, to materialize its payloads
/// under a spool directory so a later stage gets random access to them.
pub trait SpoolTarget: Send + Sync {
    /// Request spooling into `dir`. A stage already configured with a spool
    /// directory keeps its own.
    fn request_spool_dir(&self, dir: &Path);
}
