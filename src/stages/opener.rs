use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::Receiver;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pipeline::abort::AbortAck;
use crate::pipeline::stage::{Selectable, SpoolTarget, Stage, StageContext};
use crate::record::Record;

/// Bytes copied per block while spooling, so the copy loop can observe an
/// abort between blocks.
const SPOOL_BLOCK_BYTES: usize = 8 * 1024;

/// Opens a path and emits file records.
///
/// A file path emits a single open file. A directory is walked recursively
/// and every contained file is emitted, narrowed by selection patterns when
/// any are set (see [`Select`](crate::stages::select::Select)).
///
/// With a spool directory configured, each opened file is first copied there
/// and the copy is emitted instead; the whole directory is removed by the
/// done hook once the pipeline has finished. Later stages that need random
/// access to their input request spooling through the [`SpoolTarget`] hook.
pub struct Opener {
    path: PathBuf,
    spool_dir: Mutex<Option<PathBuf>>,
    filters: Mutex<Vec<Regex>>,
}

impl Opener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            spool_dir: Mutex::new(None),
            filters: Mutex::new(Vec::new()),
        }
    }

    /// Copy every opened file into `dir` before emitting it.
    pub fn spool_to(self, dir: impl Into<PathBuf>) -> Self {
        *self.spool_dir.lock().expect("spool lock poisoned") = Some(dir.into());
        self
    }

    fn matches(&self, path: &Path) -> bool {
        let filters = self.filters.lock().expect("filter lock poisoned");
        if filters.is_empty() {
            return true;
        }
        let name = path.to_string_lossy();
        filters.iter().any(|f| f.is_match(&name))
    }

    /// Abort-aware block copy of `src` into the spool directory. Returns
    /// `None` when an abort arrived mid-copy (already acked).
    async fn spool_file(
        &self,
        mut src: File,
        path: &Path,
        dir: &Path,
        abort: &mut Receiver<AbortAck>,
    ) -> Result<Option<File>> {
        let name = path
            .file_name()
            .ok_or_else(|| Error::stage("opener", format!("no file name in {path:?}")))?;
        let dest_path = dir.join(name);
        let mut dest = File::create(&dest_path).await?;
        let mut buf = vec![0_u8; SPOOL_BLOCK_BYTES];

        loop {
            tokio::select! {
                ack = abort.recv() => {
                    if let Some(ack) = ack {
                        let _ = ack.send(None);
                    }
                    return Ok(None);
                }
                read = src.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    dest.write_all(&buf[..n]).await?;
                }
            }
        }
        dest.flush().await?;
        drop(dest);

        Ok(Some(File::open(&dest_path).await?))
    }
}

#[async_trait]
impl Stage for Opener {
    fn name(&self) -> &str {
        "opener"
    }

    async fn run(&self, ctx: StageContext) -> Result<()> {
        let StageContext {
            output, mut abort, ..
        } = ctx;
        let Some(output) = output else {
            // Nothing downstream to emit to.
            return Ok(());
        };

        let meta = tokio::fs::metadata(&self.path).await?;
        let mut paths = Vec::new();
        if meta.is_dir() {
            collect_files(&self.path, &mut paths).await?;
            paths.retain(|p| self.matches(p));
            paths.sort();
        } else {
            paths.push(self.path.clone());
        }

        let spool = self.spool_dir.lock().expect("spool lock poisoned").clone();
        if let Some(dir) = &spool {
            tokio::fs::create_dir_all(dir).await?;
        }

        for path in paths {
            debug!(stage = "opener", file = %path.display(), "weir.opener.emit");
            let file = File::open(&path).await?;
            let file = match &spool {
                Some(dir) => match self.spool_file(file, &path, dir, &mut abort).await? {
                    Some(spooled) => spooled,
                    None => return Ok(()),
                },
                None => file,
            };
            tokio::select! {
                ack = abort.recv() => {
                    if let Some(ack) = ack {
                        let _ = ack.send(None);
                    }
                    return Ok(());
                }
                sent = output.send(Record::File(file)) => {
                    if sent.is_err() {
                        return Err(Error::pipeline("output channel closed"));
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_done(&self) -> Result<()> {
        let dir = self.spool_dir.lock().expect("spool lock poisoned").clone();
        if let Some(dir) = dir {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn as_selectable(&self) -> Option<&dyn Selectable> {
        Some(self)
    }

    fn as_spool_target(&self) -> Option<&dyn SpoolTarget> {
        Some(self)
    }
}

impl Selectable for Opener {
    fn set_selection(&self, patterns: &[String]) {
        let mut filters = self.filters.lock().expect("filter lock poisoned");
        for pattern in patterns {
            let regex = Regex::new(pattern)
                .unwrap_or_else(|err| panic!("invalid selection pattern {pattern:?}: {err}"));
            filters.push(regex);
        }
    }
}

impl SpoolTarget for Opener {
    fn request_spool_dir(&self, dir: &Path) {
        let mut spool = self.spool_dir.lock().expect("spool lock poisoned");
        if spool.is_none() {
            *spool = Some(dir.to_path_buf());
        }
    }
}

/// Iterative recursive directory walk.
async fn collect_files(root: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else {
                out.push(entry.path());
            }
        }
    }
    Ok(())
}
