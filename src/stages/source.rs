use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;

use crate::error::{Error, Result};
use crate::pipeline::stage::{Stage, StageContext};
use crate::record::Record;

/// Forwards records from a caller-supplied channel to the downstream stage.
///
/// Returns when the external channel closes or an abort arrives.
pub struct InStream {
    name: String,
    input: Mutex<Option<Receiver<Record>>>,
}

impl InStream {
    pub fn new(name: impl Into<String>, input: Receiver<Record>) -> Self {
        Self {
            name: name.into(),
            input: Mutex::new(Some(input)),
        }
    }
}

#[async_trait]
impl Stage for InStream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: StageContext) -> Result<()> {
        let StageContext {
            output, mut abort, ..
        } = ctx;
        let Some(output) = output else {
            return Ok(());
        };
        let mut input = self
            .input
            .lock()
            .expect("in-stream lock poisoned")
            .take()
            .ok_or_else(|| Error::stage(&self.name, "in-stream source already consumed"))?;

        loop {
            tokio::select! {
                _ = abort.recv() => return Ok(()),
                msg = input.recv() => {
                    let Some(record) = msg else { return Ok(()) };
                    tokio::select! {
                        _ = abort.recv() => return Ok(()),
                        sent = output.send(record) => {
                            // A downstream that closed due to abort or its
                            // own completion is a graceful stop for a source.
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    fn skip_abort_ack(&self) -> bool {
        true
    }
}

/// Emits a fixed set of records, then returns.
pub struct RecordsSource {
    name: String,
    records: Mutex<Option<Vec<Record>>>,
}

impl RecordsSource {
    /// Source from a sequence of records.
    pub fn from_records(records: Vec<Record>) -> Self {
        Self {
            name: "records".to_string(),
            records: Mutex::new(Some(records)),
        }
    }

    /// Source from a single value.
    pub fn from_value(record: impl Into<Record>) -> Self {
        Self::from_records(vec![record.into()])
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Stage for RecordsSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: StageContext) -> Result<()> {
        let StageContext {
            output, mut abort, ..
        } = ctx;
        let Some(output) = output else {
            return Ok(());
        };
        let records = self
            .records
            .lock()
            .expect("records lock poisoned")
            .take()
            .ok_or_else(|| Error::stage(&self.name, "record source already consumed"))?;

        for record in records {
            tokio::select! {
                _ = abort.recv() => return Ok(()),
                sent = output.send(record) => {
                    // A downstream that closed due to abort or its own
                    // completion is a graceful stop for a source.
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn skip_abort_ack(&self) -> bool {
        true
    }
}
