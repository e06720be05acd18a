use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use weir::error::{Error, Result};
use weir::pipeline::{Pipeline, Stage, StageContext};
use weir::stages::Opener;

mod common;
use common::FileSink;

/// A stage whose done hook records ordering and whether it ran before every
/// worker had returned.
struct HookStage {
    name: String,
    wait: Duration,
    order: Arc<Mutex<Vec<String>>>,
    returned: Arc<AtomicUsize>,
    expected_workers: usize,
    premature: Arc<AtomicBool>,
    fail: Option<Error>,
}

#[async_trait]
impl Stage for HookStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: StageContext) -> Result<()> {
        let StageContext {
            input, mut abort, ..
        } = ctx;
        if !self.wait.is_zero() {
            tokio::time::sleep(self.wait).await;
        }
        if let Some(mut input) = input {
            loop {
                tokio::select! {
                    _ = abort.recv() => break,
                    msg = input.recv() => {
                        if msg.is_none() {
                            break;
                        }
                    }
                }
            }
        }
        self.returned.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_done(&self) -> Result<()> {
        if self.returned.load(Ordering::SeqCst) != self.expected_workers {
            self.premature.store(true, Ordering::SeqCst);
        }
        self.order
            .lock()
            .expect("order lock")
            .push(self.name.clone());
        match &self.fail {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn skip_abort_ack(&self) -> bool {
        true
    }
}

fn hook_stage(
    name: &str,
    wait: Duration,
    order: &Arc<Mutex<Vec<String>>>,
    returned: &Arc<AtomicUsize>,
    premature: &Arc<AtomicBool>,
) -> HookStage {
    HookStage {
        name: name.to_string(),
        wait,
        order: order.clone(),
        returned: returned.clone(),
        expected_workers: 3,
        premature: premature.clone(),
        fail: None,
    }
}

#[tokio::test]
async fn done_hooks_run_in_pipeline_order_after_all_workers() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let returned = Arc::new(AtomicUsize::new(0));
    let premature = Arc::new(AtomicBool::new(false));

    let job = Pipeline::new()
        .then(hook_stage(
            "a",
            Duration::from_millis(30),
            &order,
            &returned,
            &premature,
        ))
        .then(hook_stage("b", Duration::ZERO, &order, &returned, &premature))
        .then(hook_stage("c", Duration::ZERO, &order, &returned, &premature))
        .build();

    job.run().await.expect("clean run");

    assert_eq!(
        &*order.lock().expect("order lock"),
        &["a".to_string(), "b".to_string(), "c".to_string()]
    );
    assert!(
        !premature.load(Ordering::SeqCst),
        "a done hook ran before every worker had returned"
    );
}

#[tokio::test]
async fn done_hook_failure_is_folded_into_the_job_error() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let returned = Arc::new(AtomicUsize::new(0));
    let premature = Arc::new(AtomicBool::new(false));

    let mut stage = hook_stage("cleanup", Duration::ZERO, &order, &returned, &premature);
    stage.expected_workers = 1;
    stage.fail = Some(Error::stage("cleanup", "teardown failed"));

    let job = Pipeline::new().then(stage).build();
    let err = job.run().await.expect_err("hook failure surfaces");
    assert!(matches!(err, Error::Hook { .. }));
    assert!(err.to_string().contains("teardown failed"));
}

#[tokio::test]
async fn spool_directory_is_removed_after_wait() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data = dir.path().join("data.txt");
    tokio::fs::write(&data, "hello spool").await.expect("write");
    let spool = dir.path().join("spool");

    let contents = Arc::new(Mutex::new(Vec::new()));
    let job = Pipeline::new()
        .then(Opener::new(&data).spool_to(&spool))
        .then(FileSink::new(contents.clone()))
        .build();

    job.run().await.expect("clean run");

    assert_eq!(
        &*contents.lock().expect("contents lock"),
        &["hello spool".to_string()]
    );
    assert!(
        !spool.exists(),
        "the done hook should remove the spool directory"
    );
}

/// A stage that asks the opener to spool at append time, the way an archive
/// extractor needs random access to a fully materialized file.
struct NeedsSpool {
    dir: PathBuf,
}

#[async_trait]
impl Stage for NeedsSpool {
    fn name(&self) -> &str {
        "needs-spool"
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
                    let Some(output) = output.as_ref() else { continue };
                    if output.send(record).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn on_add(&self, prev: &dyn Stage) {
        prev.as_spool_target()
            .expect("previous stage cannot spool")
            .request_spool_dir(&self.dir);
    }

    fn skip_abort_ack(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn add_hook_back_configures_the_opener_spool() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data = dir.path().join("payload.txt");
    tokio::fs::write(&data, "spooled payload").await.expect("write");

    // Pre-seed the requested spool directory with a sentinel: teardown of
    // the whole directory proves the back-configuration took effect.
    let spool = dir.path().join("spool");
    tokio::fs::create_dir_all(&spool).await.expect("mkdir");
    tokio::fs::write(spool.join("sentinel"), "x").await.expect("sentinel");

    let contents = Arc::new(Mutex::new(Vec::new()));
    let job = Pipeline::new()
        .then(Opener::new(&data))
        .then(NeedsSpool { dir: spool.clone() })
        .then(FileSink::new(contents.clone()))
        .build();

    job.run().await.expect("clean run");

    assert_eq!(
        &*contents.lock().expect("contents lock"),
        &["spooled payload".to_string()]
    );
    assert!(!spool.exists(), "spool directory should be torn down");
}
