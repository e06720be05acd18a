use async_trait::async_trait;

use crate::error::Result;
use crate::pipeline::stage::{Stage, StageContext};

/// A marker stage that applies selection patterns to the prior stage.
///
/// The marker is never scheduled: it elides itself at append time and exists
/// only for its add hook, which hands the patterns to the nearest prior
/// targetable stage.
///
/// # Panics
///
/// Appending a `Select` after a stage that is not selectable panics.
pub struct Select {
    patterns: Vec<String>,
}

impl Select {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Stage for Select {
    fn name(&self) -> &str {
        "select"
    }

    async fn run(&self, _ctx: StageContext) -> Result<()> {
        Ok(())
    }

    fn on_add(&self, prev: &dyn Stage) {
        let selectable = prev
            .as_selectable()
            .unwrap_or_else(|| panic!("stage {:?} is not selectable", prev.name()));
        selectable.set_selection(&self.patterns);
    }

    fn elide(&self) -> bool {
        true
    }
}
