#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;
use weir::error::{Error, Result};
use weir::pipeline::{AbortAck, Stage, StageContext, StageOptions};
use weir::record::Record;

/// How a [`MockStage`] reacts to an abort request.
#[derive(Clone, Copy, PartialEq)]
pub enum AbortBehavior {
    /// Reply on the ack channel as soon as the abort arrives.
    Reply,
    /// Sleep before replying.
    ReplyAfter(Duration),
    /// Consume the abort but keep the ack pending forever.
    HoldAck,
    /// Never look at the abort channel.
    Ignore,
}

/// A configurable stage for exercising the scheduler: it can wait, drain its
/// input, emit records, fail, and misbehave on abort in several ways.
pub struct MockStage {
    name: String,
    wait: Duration,
    fail_with: Option<Error>,
    emit: Mutex<Option<Vec<Record>>>,
    abort_behavior: AbortBehavior,
    skip_ack: bool,
    defaults: Option<StageOptions>,
    pub started: AtomicBool,
    pub aborted: AtomicBool,
}

impl MockStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            wait: Duration::ZERO,
            fail_with: None,
            emit: Mutex::new(None),
            abort_behavior: AbortBehavior::Reply,
            skip_ack: false,
            defaults: None,
            started: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn fail_with(mut self, err: Error) -> Self {
        self.fail_with = Some(err);
        self
    }

    pub fn emit(self, records: Vec<Record>) -> Self {
        *self.emit.lock().expect("emit lock") = Some(records);
        self
    }

    pub fn abort_behavior(mut self, behavior: AbortBehavior) -> Self {
        self.abort_behavior = behavior;
        self
    }

    pub fn skip_ack(mut self, skip: bool) -> Self {
        self.skip_ack = skip;
        self
    }

    pub fn with_defaults(mut self, options: StageOptions) -> Self {
        self.defaults = Some(options);
        self
    }

    pub fn was_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn finish(&self) -> Result<()> {
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn on_abort(&self, ack: Option<AbortAck>) -> Result<()> {
        self.aborted.store(true, Ordering::SeqCst);
        match self.abort_behavior {
            AbortBehavior::Reply => {
                if let Some(ack) = ack {
                    let _ = ack.send(self.fail_with.clone());
                }
            }
            AbortBehavior::ReplyAfter(delay) => {
                tokio::time::sleep(delay).await;
                if let Some(ack) = ack {
                    let _ = ack.send(self.fail_with.clone());
                }
            }
            AbortBehavior::HoldAck => {
                let _hold = ack;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            AbortBehavior::Ignore => unreachable!("ignored aborts are never received"),
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for MockStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: StageContext) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        let StageContext {
            input,
            output,
            mut abort,
        } = ctx;

        if self.abort_behavior == AbortBehavior::Ignore {
            tokio::time::sleep(self.wait).await;
            return self.finish();
        }

        if !self.wait.is_zero() {
            tokio::select! {
                ack = abort.recv() => return self.on_abort(ack).await,
                _ = tokio::time::sleep(self.wait) => {}
            }
        }

        if let Some(mut input) = input {
            loop {
                tokio::select! {
                    ack = abort.recv() => return self.on_abort(ack).await,
                    msg = input.recv() => {
                        if msg.is_none() {
                            break;
                        }
                    }
                }
            }
        }

        let records = self.emit.lock().expect("emit lock").take().unwrap_or_default();
        if let Some(output) = output {
            for record in records {
                tokio::select! {
                    ack = abort.recv() => return self.on_abort(ack).await,
                    sent = output.send(record) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        self.finish()
    }

    fn default_options(&self) -> StageOptions {
        self.defaults.unwrap_or_default()
    }

    fn skip_abort_ack(&self) -> bool {
        self.skip_ack
    }
}

/// A sink that reads every byte-bearing record into a string.
pub struct FileSink {
    pub contents: Arc<Mutex<Vec<String>>>,
}

impl FileSink {
    pub fn new(contents: Arc<Mutex<Vec<String>>>) -> Self {
        Self { contents }
    }
}

#[async_trait]
impl Stage for FileSink {
    fn name(&self) -> &str {
        "file-sink"
    }

    async fn run(&self, ctx: StageContext) -> Result<()> {
        let StageContext {
            input, mut abort, ..
        } = ctx;
        let Some(mut input) = input else {
            return Ok(());
        };
        loop {
            tokio::select! {
                _ = abort.recv() => return Ok(()),
                msg = input.recv() => {
                    let Some(record) = msg else { return Ok(()) };
                    let bytes = record.into_bytes().await?;
                    self.contents
                        .lock()
                        .expect("contents lock")
                        .push(String::from_utf8_lossy(&bytes).into_owned());
                }
            }
        }
    }

    fn skip_abort_ack(&self) -> bool {
        true
    }
}

/// Decoded integer records, for quick sources.
pub fn ints(values: impl IntoIterator<Item = i64>) -> Vec<Record> {
    values.into_iter().map(Record::decoded).collect()
}

/// Drain a tee channel, unpacking every record as a decoded `T`.
pub async fn collect_decoded<T>(mut rx: Receiver<Record>) -> Vec<T>
where
    T: Clone + Send + Sync + 'static,
{
    let mut out = Vec::new();
    while let Some(record) = rx.recv().await {
        out.push(
            record
                .downcast_ref::<T>()
                .expect("unexpected record variant")
                .clone(),
        );
    }
    out
}
