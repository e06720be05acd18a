//! # weir
//!
//! **Streaming data-ingestion pipelines in Rust.**
//!
//! `weir` is a crate for composing linear ingestion pipelines: an opener,
//! a decoder, some transforms and a sink, assembled at build time and run
//! as a single job. Records stream from stage to stage over bounded Tokio
//! channels while every stage runs concurrently.
//!
//! ## Core model
//!
//! A pipeline is an ordered list of stages:
//!
//! ```text
//! Opener → Decode → Transform → Tee
//! ```
//!
//! Each stage implements the [`Stage`] trait and exchanges [`Record`]
//! payloads (byte buffers, text, open files, byte streams, or decoded
//! values) with its neighbors. Building a [`Pipeline`] freezes the stage
//! list into a [`Job`], which wires the channels, launches one worker per
//! stage, collects the first error, runs the done hooks and joins.
//!
//! ## Example
//!
//! Decode a directory of CSV files into typed rows and collect them:
//!
//! ```no_run
//! use tokio::sync::mpsc;
//! use weir::decode::{CsvDecoder, CsvField, CsvRecord};
//! use weir::pipeline::Pipeline;
//! use weir::record::Record;
//! use weir::stages::Select;
//!
//! #[derive(Default)]
//! struct Person {
//!     id: i64,
//!     name: String,
//! }
//!
//! impl CsvRecord for Person {
//!     fn csv_fields() -> Vec<CsvField<Self>> {
//!         vec![
//!             CsvField::new("user_id", |p: &mut Person| &mut p.id),
//!             CsvField::new("name", |p: &mut Person| &mut p.name),
//!         ]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> weir::error::Result<()> {
//!     let (tx, mut rx) = mpsc::channel::<Record>(16);
//!
//!     let job = Pipeline::open("data/")
//!         .then(Select::new(["people.*\\.csv"]))
//!         .then(CsvDecoder::<Person>::new())
//!         .stream_to(tx)
//!         .build();
//!
//!     job.start();
//!     while let Some(record) = rx.recv().await {
//!         let person = record.downcast_ref::<Person>().unwrap();
//!         println!("{} {}", person.id, person.name);
//!     }
//!     job.wait().await
//! }
//! ```
//!
//! ## Abort
//!
//! Cancellation is cooperative. [`Job::abort`] delivers an abort request to
//! every stage in parallel; the request carries a reply channel so a stage
//! acknowledges in the same hand-off. Delivery and acknowledgement are each
//! bounded by a process-wide timeout (default 10 s, see
//! [`set_abort_timeout`](pipeline::set_abort_timeout)). A stage that never
//! accepts the abort is reported as not abortable and left to finish on its
//! own; no kill signal exists.
//!
//! ```no_run
//! # async fn demo(job: weir::pipeline::Job) {
//! job.start();
//! let mut outcomes = job.abort();
//! while let Some(outcome) = outcomes.recv().await {
//!     println!("{outcome:?}");
//! }
//! # }
//! ```
//!
//! ## API contracts
//!
//! - Bounded memory: every inter-stage hand-off is a bounded channel sized
//!   by the downstream stage's [`StageOptions`].
//! - One close per channel: a stage's output closes exactly once, when its
//!   worker returns and drops the sender.
//! - First error wins: `run`, `wait` and `error` all report the first
//!   failure recorded anywhere in the run; later errors are logged at warn
//!   level and discarded.
//! - Abort is idempotent and returns its outcomes on a separate stream,
//!   one entry per stage.
//! - Stage order is preserved between adjacent stages. The CSV and JSON
//!   decoders run internal worker pools and reorder their output; configure
//!   one decoder worker when order matters.
//!
//! ## Stage authoring
//!
//! A stage implements [`Stage::run`] against a [`StageContext`] and may opt
//! into capabilities: default buffer options, an append-time add hook for
//! back-configuring an earlier stage, a done hook that runs after the whole
//! pipeline finishes, selection patterns, abort-ack suppression, no-op
//! elision, and non-targetability. See the [`pipeline::stage`] module.
//!
//! ## Observability
//!
//! `weir` emits `tracing` events (`weir.stage` spans, `weir.csv.row_skipped`,
//! `weir.json.value_skipped`, `weir.error.discarded`) with a `stage` field.
//! Install any `tracing-subscriber` to see them.
//!
//! [`Stage`]: pipeline::stage::Stage
//! [`StageContext`]: pipeline::stage::StageContext
//! [`StageOptions`]: pipeline::stage::StageOptions
//! [`Pipeline`]: pipeline::builder::Pipeline
//! [`Job`]: pipeline::job::Job
//! [`Job::abort`]: pipeline::job::Job::abort
//! [`Record`]: record::Record

pub mod decode;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod stages;

pub mod prelude {
    //! Convenient imports for most `weir` users.

    pub use crate::decode::{CsvDecoder, CsvField, CsvRecord, JsonDecoder};
    pub use crate::error::{Error, Result};
    pub use crate::pipeline::{Job, Pipeline, Stage, StageContext, StageOptions};
    pub use crate::record::Record;
    pub use crate::stages::{InStream, Opener, Passthrough, RecordsSource, Select, Transform};
}
