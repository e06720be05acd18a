use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch, Barrier};
use tracing::{warn, Instrument};

use crate::error::{Error, Result};
use crate::pipeline::abort::{abort_timeout, AbortAck, AbortResult};
use crate::pipeline::builder::StageDescriptor;
use crate::pipeline::stage::StageContext;
use crate::record::Record;

/// The runtime binding of a pipeline to live channels, workers and error
/// state.
///
/// A `Job` is a cheap-clone handle; every clone controls the same run.
/// `start` spawns one worker per stage plus a completion watcher and a hook
/// watcher, then returns. `wait` blocks until both watchers have finished
/// and returns the first recorded error.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

struct JobInner {
    descriptors: Vec<StageDescriptor>,
    started: AtomicBool,
    error: Mutex<Option<Error>>,
    run_states: Mutex<Vec<RunState>>,
    workers_done: watch::Sender<bool>,
    hooks_done: watch::Sender<bool>,
}

/// Per-stage runtime record: the stage's abort channel and how the job
/// should treat its ack. Created at start, cleared after all workers return.
#[derive(Clone)]
struct RunState {
    name: String,
    abort: mpsc::Sender<AbortAck>,
    skip_ack: bool,
}

impl Job {
    pub(crate) fn new(descriptors: Vec<StageDescriptor>) -> Self {
        Self {
            inner: Arc::new(JobInner {
                descriptors,
                started: AtomicBool::new(false),
                error: Mutex::new(None),
                run_states: Mutex::new(Vec::new()),
                workers_done: watch::channel(false).0,
                hooks_done: watch::channel(false).0,
            }),
        }
    }

    /// Launch every stage worker and both watchers, then return.
    ///
    /// A job starts at most once; a second call is a no-op. Build a fresh
    /// job from the pipeline to run the same stages again.
    pub fn start(&self) -> &Self {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return self;
        }

        let n = inner.descriptors.len();
        if n == 0 {
            let _ = inner.workers_done.send(true);
            let _ = inner.hooks_done.send(true);
            return self;
        }

        // Intermediate channel i feeds stage i+1; its capacity follows the
        // downstream stage's in_buffer option.
        let mut inputs: Vec<Option<mpsc::Receiver<Record>>> = Vec::with_capacity(n);
        let mut outputs: Vec<Option<mpsc::Sender<Record>>> = Vec::with_capacity(n);
        inputs.push(None);
        for descriptor in &inner.descriptors[1..] {
            let capacity = descriptor.options().in_buffer.max(1);
            let (tx, rx) = mpsc::channel(capacity);
            outputs.push(Some(tx));
            inputs.push(Some(rx));
        }
        outputs.push(None);

        let barrier = Arc::new(Barrier::new(n + 2));

        let mut states = inner.run_states.lock().expect("run state lock poisoned");
        for (i, descriptor) in inner.descriptors.iter().enumerate() {
            let stage = Arc::clone(descriptor.stage());
            let (abort_tx, abort_rx) = mpsc::channel::<AbortAck>(1);
            states.push(RunState {
                name: stage.name().to_string(),
                abort: abort_tx,
                skip_ack: stage.skip_abort_ack(),
            });

            let ctx = StageContext {
                input: inputs[i].take(),
                output: outputs[i].take(),
                abort: abort_rx,
            };
            let shared = Arc::clone(inner);
            let barrier = Arc::clone(&barrier);
            let span = tracing::info_span!("weir.stage", stage = %stage.name());
            tokio::spawn(
                async move {
                    // The context (and with it the sole output sender) drops
                    // when run returns, closing the downstream channel.
                    if let Err(err) = stage.run(ctx).await {
                        shared.fold_error(err);
                    }
                    barrier.wait().await;
                }
                .instrument(span),
            );
        }
        drop(states);

        let shared = Arc::clone(inner);
        let completion_barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            completion_barrier.wait().await;
            shared
                .run_states
                .lock()
                .expect("run state lock poisoned")
                .clear();
            let _ = shared.workers_done.send(true);
        });

        let shared = Arc::clone(inner);
        tokio::spawn(async move {
            barrier.wait().await;
            for descriptor in &shared.descriptors {
                let stage = descriptor.stage();
                if let Err(err) = stage.on_done().await {
                    shared.fold_error(Error::hook(stage.name(), err.to_string()));
                }
            }
            let _ = shared.hooks_done.send(true);
        });

        self
    }

    /// Block until all workers and all done hooks have finished, then return
    /// the first recorded error. Waiting on a job that was never started
    /// returns immediately.
    pub async fn wait(&self) -> Result<()> {
        if self.inner.started.load(Ordering::SeqCst) {
            let mut workers = self.inner.workers_done.subscribe();
            let _ = workers.wait_for(|done| *done).await;
            let mut hooks = self.inner.hooks_done.subscribe();
            let _ = hooks.wait_for(|done| *done).await;
        }
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Start the job and wait for it to complete.
    pub async fn run(&self) -> Result<()> {
        self.start();
        self.wait().await
    }

    /// Run the job on a background task. The returned channel carries the
    /// single result and closes after it.
    pub fn run_async(&self) -> mpsc::Receiver<Result<()>> {
        let (tx, rx) = mpsc::channel(1);
        let job = self.clone();
        tokio::spawn(async move {
            let result = job.run().await;
            let _ = tx.send(result).await;
        });
        rx
    }

    /// The first error recorded anywhere in the run, if any. Repeated calls
    /// return the same value.
    pub fn error(&self) -> Option<Error> {
        self.inner.error.lock().expect("error cell poisoned").clone()
    }

    /// Deliver an abort to every running stage in parallel.
    ///
    /// Returns a stream with one entry per stage: `Ok` once the stage
    /// accepted the abort (and acked, unless it suppresses acks), or the
    /// delivery/ack failure. The stream closes when every per-stage attempt
    /// has finished. Aborting a finished job yields an empty stream, and
    /// aborting twice produces the same visible outcome as once.
    pub fn abort(&self) -> mpsc::Receiver<AbortResult> {
        let states: Vec<RunState> = self
            .inner
            .run_states
            .lock()
            .expect("run state lock poisoned")
            .clone();

        let (tx, rx) = mpsc::channel(states.len().max(1));
        let timeout = abort_timeout();
        for state in states {
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = deliver_abort(state, timeout).await;
                let _ = tx.send(result).await;
            });
        }
        // The last per-stage sender drop closes the stream.
        rx
    }
}

impl JobInner {
    /// Write-once error folding: the first error wins, later ones are
    /// logged and discarded.
    fn fold_error(&self, err: Error) {
        let mut cell = self.error.lock().expect("error cell poisoned");
        if cell.is_none() {
            *cell = Some(err);
        } else {
            warn!(error = %err, "weir.error.discarded");
        }
    }
}

async fn deliver_abort(state: RunState, timeout: Duration) -> AbortResult {
    let (ack_tx, ack_rx) = oneshot::channel();
    match state.abort.send_timeout(ack_tx, timeout).await {
        Err(SendTimeoutError::Timeout(_)) => Err(Error::NotAbortable {
            stage: state.name,
            timeout,
        }),
        // The stage already returned; nothing left to abort.
        Err(SendTimeoutError::Closed(_)) => Ok(()),
        Ok(()) => {
            if state.skip_ack {
                return Ok(());
            }
            match tokio::time::timeout(timeout, ack_rx).await {
                Err(_) => {
                    // The abort channel has one slot; zero free capacity
                    // means the stage never consumed the request.
                    if state.abort.capacity() == 0 {
                        Err(Error::NotAbortable {
                            stage: state.name,
                            timeout,
                        })
                    } else {
                        Err(Error::AbortAckTimeout {
                            stage: state.name,
                            timeout,
                        })
                    }
                }
                // Ack sender dropped without a reply: the worker returned.
                Ok(Err(_)) => Ok(()),
                Ok(Ok(None)) => Ok(()),
                Ok(Ok(Some(err))) => Err(err),
            }
        }
    }
}
