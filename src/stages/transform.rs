use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::pipeline::stage::{Stage, StageContext};
use crate::record::Record;

/// The function a [`Transform`] stage applies to every record.
pub trait TransformFn: Fn(Record) -> Result<Record> + Send + Sync + 'static {}

impl<F> TransformFn for F where F: Fn(Record) -> Result<Record> + Send + Sync + 'static {}

/// Applies a caller function to each record and forwards the result.
///
/// A non-`Ok` return fails the pipeline.
pub struct Transform {
    name: String,
    f: Box<dyn TransformFn>,
}

impl Transform {
    pub fn new(f: impl TransformFn) -> Self {
        Self {
            name: "transform".to_string(),
            f: Box::new(f),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Stage for Transform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: StageContext) -> Result<()> {
        let StageContext {
            input,
            output,
            mut abort,
        } = ctx;
        let Some(mut input) = input else {
            return Ok(());
        };

        loop {
            tokio::select! {
                _ = abort.recv() => return Ok(()),
                msg = input.recv() => {
                    let Some(record) = msg else { return Ok(()) };
                    let record = (self.f)(record)?;
                    let Some(output) = output.as_ref() else { continue };
                    tokio::select! {
                        _ = abort.recv() => return Ok(()),
                        sent = output.send(record) => {
                            if sent.is_err() {
                                return Err(Error::pipeline("output channel closed"));
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
