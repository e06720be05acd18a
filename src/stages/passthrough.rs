use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::error::{Error, Result};
use crate::pipeline::abort::AbortAck;
use crate::pipeline::stage::{Stage, StageContext};
use crate::record::Record;

/// Forwards each record to an external channel and, when a downstream stage
/// exists, downstream as well.
///
/// The external sender is dropped when the stage finishes unless `no_close`
/// is set, in which case it stays in the stage for reuse across jobs. The
/// stage is not targetable, so add hooks look straight through it.
pub struct Passthrough {
    name: String,
    out: Mutex<Option<Sender<Record>>>,
    no_close: bool,
}

impl Passthrough {
    pub fn new(out: Sender<Record>) -> Self {
        Self {
            name: "passthrough".to_string(),
            out: Mutex::new(Some(out)),
            no_close: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn no_close(mut self, no_close: bool) -> Self {
        self.no_close = no_close;
        self
    }

    async fn forward(
        &self,
        mut input: Receiver<Record>,
        downstream: Option<Sender<Record>>,
        abort: &mut Receiver<AbortAck>,
        out: Sender<Record>,
    ) -> Result<()> {
        loop {
            let record = tokio::select! {
                _ = abort.recv() => return Ok(()),
                msg = input.recv() => {
                    match msg {
                        Some(record) => record,
                        None => return Ok(()),
                    }
                }
            };

            match &downstream {
                Some(downstream) => {
                    let Some(external) = record.try_clone() else {
                        return Err(Error::stage(
                            &self.name,
                            format!("record {record:?} cannot be duplicated for tee"),
                        ));
                    };
                    tokio::select! {
                        _ = abort.recv() => return Ok(()),
                        sent = out.send(external) => {
                            if sent.is_err() {
                                return Err(Error::pipeline("external channel closed"));
                            }
                        }
                    }
                    tokio::select! {
                        _ = abort.recv() => return Ok(()),
                        sent = downstream.send(record) => {
                            if sent.is_err() {
                                return Err(Error::pipeline("output channel closed"));
                            }
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = abort.recv() => return Ok(()),
                        sent = out.send(record) => {
                            if sent.is_err() {
                                return Err(Error::pipeline("external channel closed"));
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Stage for Passthrough {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: StageContext) -> Result<()> {
        let StageContext {
            input,
            output,
            mut abort,
        } = ctx;
        let Some(input) = input else {
            return Ok(());
        };
        let out = self
            .out
            .lock()
            .expect("tee lock poisoned")
            .clone()
            .ok_or_else(|| Error::stage(&self.name, "tee channel already released"))?;

        let result = self.forward(input, output, &mut abort, out).await;

        if !self.no_close {
            self.out.lock().expect("tee lock poisoned").take();
        }
        result
    }

    fn skip_abort_ack(&self) -> bool {
        true
    }

    fn targetable(&self) -> bool {
        false
    }
}
