pub mod abort;
pub mod builder;
pub mod job;
pub mod stage;

pub use abort::{abort_timeout, set_abort_timeout, AbortAck, AbortResult};
pub use builder::{Pipeline, StageDescriptor, StreamToOpts};
pub use job::Job;
pub use stage::{Selectable, SpoolTarget, Stage, StageContext, StageOptions};
