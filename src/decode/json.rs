use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{Error, Result};
use crate::pipeline::stage::{Selectable, Stage, StageContext};
use crate::record::Record;

/// Decodes JSON payloads into exemplar instances.
///
/// A payload is either a top-level stream of concatenated values or, with a
/// selector configured, the values found beneath a dot-separated path.
/// Selector segments name object keys; the literal `*` matches an array's
/// opening bracket and descends into its elements. Navigation scans tokens
/// forward, so a matching string value along the way also advances a
/// segment, exactly like the loose scan it reproduces.
///
/// Each incoming payload is handled by its own worker task, bounded by a
/// semaphore of `decoders` permits. Values from one payload arrive in file
/// order; order across payloads is unspecified.
pub struct JsonDecoder<T> {
    decoders: usize,
    selector: Mutex<Option<String>>,
    abort_on_failed_value: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            decoders: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            selector: Mutex::new(None),
            abort_on_failed_value: false,
            _marker: PhantomData,
        }
    }

    pub fn decoders(mut self, n: usize) -> Self {
        self.decoders = n.max(1);
        self
    }

    pub fn selector(self, selector: impl Into<String>) -> Self {
        *self.selector.lock().expect("selector lock poisoned") = Some(selector.into());
        self
    }

    /// Fail the pipeline on the first value that cannot be decoded, instead
    /// of logging and skipping it.
    pub fn abort_on_failed_value(mut self, abort: bool) -> Self {
        self.abort_on_failed_value = abort;
        self
    }
}

impl<T> Default for JsonDecoder<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<T> Stage for JsonDecoder<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "json"
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

        let selector = self
            .selector
            .lock()
            .expect("selector lock poisoned")
            .clone();
        let abort_on_failed_value = self.abort_on_failed_value;
        let semaphore = Arc::new(Semaphore::new(self.decoders));
        let (out_tx, mut out_rx) = mpsc::channel::<T>(self.decoders);
        let (err_tx, mut err_rx) = mpsc::channel::<Error>(self.decoders);

        // The keepers hold the channels open while input still flows; once
        // input closes they drop, and the outward channel closes after the
        // last in-flight handler.
        let mut out_keeper = Some(out_tx);
        let mut err_keeper = Some(err_tx);

        let mut input_open = true;
        let mut errs_open = true;
        loop {
            tokio::select! {
                _ = abort.recv() => return Ok(()),
                err = err_rx.recv(), if errs_open => {
                    match err {
                        Some(err) if abort_on_failed_value => return Err(err),
                        Some(err) => warn!(stage = "json", error = %err, "weir.json.value_skipped"),
                        None => errs_open = false,
                    }
                }
                value = out_rx.recv() => {
                    let Some(value) = value else {
                        if abort_on_failed_value {
                            if let Ok(err) = err_rx.try_recv() {
                                return Err(err);
                            }
                        }
                        return Ok(());
                    };
                    let Some(output) = output.as_ref() else { continue };
                    tokio::select! {
                        _ = abort.recv() => return Ok(()),
                        sent = output.send(Record::decoded(value)) => {
                            if sent.is_err() {
                                return Err(Error::pipeline("output channel closed"));
                            }
                        }
                    }
                }
                msg = input.recv(), if input_open => {
                    match msg {
                        Some(record) => {
                            // The permit is acquired inside the handler so
                            // the main loop keeps draining decoded values;
                            // otherwise a handler blocked on a full outward
                            // channel could never release its permit.
                            let semaphore = Arc::clone(&semaphore);
                            let out = out_keeper
                                .clone()
                                .expect("outward channel released while input open");
                            let errs = err_keeper
                                .clone()
                                .expect("error channel released while input open");
                            let selector = selector.clone();
                            tokio::spawn(async move {
                                let Ok(_permit) = semaphore.acquire_owned().await else {
                                    return;
                                };
                                handle_payload::<T>(record, selector.as_deref(), out, errs)
                                    .await;
                            });
                        }
                        None => {
                            input_open = false;
                            out_keeper.take();
                            err_keeper.take();
                        }
                    }
                }
            }
        }
    }

    fn skip_abort_ack(&self) -> bool {
        true
    }

    fn as_selectable(&self) -> Option<&dyn Selectable> {
        Some(self)
    }
}

impl<T> Selectable for JsonDecoder<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn set_selection(&self, patterns: &[String]) {
        if let Some(first) = patterns.first() {
            *self.selector.lock().expect("selector lock poisoned") = Some(first.clone());
        }
    }
}

/// Decode one payload: navigate the selector, then emit successive values
/// from the current position until the enclosing structure or input ends.
async fn handle_payload<T>(
    record: Record,
    selector: Option<&str>,
    out: mpsc::Sender<T>,
    errs: mpsc::Sender<Error>,
) where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let buf = match record.into_bytes().await {
        Ok(buf) => buf,
        Err(err) => {
            let _ = errs.send(err).await;
            return;
        }
    };

    let mut pos = 0;
    if let Some(selector) = selector {
        match navigate(&buf, selector) {
            Ok(found) => pos = found,
            Err(err) => {
                let _ = errs.send(err).await;
                return;
            }
        }
    }

    loop {
        match next_value::<T>(&buf, pos) {
            Step::End => return,
            Step::Value(value, next) => {
                pos = next;
                if out.send(value).await.is_err() {
                    // The outward channel only closes when the stage itself
                    // is done; the error channel is closed with it, so this
                    // report is best effort.
                    let _ = errs.send(Error::pipeline("output channel closed")).await;
                    return;
                }
            }
            Step::Skipped(next, err) => {
                pos = next;
                if errs.send(err).await.is_err() {
                    return;
                }
            }
            Step::Fatal(err) => {
                let _ = errs.send(err).await;
                return;
            }
        }
    }
}

/// Consume tokens until every selector segment has been matched; the
/// returned offset is where value decoding resumes.
fn navigate(buf: &[u8], selector: &str) -> Result<usize> {
    let mut segments = selector.split('.').collect::<Vec<_>>();
    segments.reverse();
    let mut lexer = Lexer::new(buf);

    while let Some(segment) = segments.last() {
        let Some(token) = lexer.next_token()? else {
            return Err(Error::decode(format!(
                "selector {selector:?} not found in document"
            )));
        };
        match token {
            Token::Str(name) if name == *segment => {
                segments.pop();
            }
            Token::Delim(b'[') if *segment == "*" => {
                segments.pop();
            }
            _ => {}
        }
    }
    Ok(lexer.pos())
}

enum Step<T> {
    /// A decoded value and the offset after it.
    Value(T, usize),
    /// A malformed value was skipped; the offset after it and the cause.
    Skipped(usize, Error),
    /// The payload cannot be advanced past this point.
    Fatal(Error),
    End,
}

fn next_value<T: DeserializeOwned>(buf: &[u8], mut pos: usize) -> Step<T> {
    while let Some(&b) = buf.get(pos) {
        match b {
            b' ' | b'\t' | b'\r' | b'\n' | b',' | b':' => pos += 1,
            b']' | b'}' => return Step::End,
            _ => break,
        }
    }
    if pos >= buf.len() {
        return Step::End;
    }

    let mut stream = serde_json::Deserializer::from_slice(&buf[pos..]).into_iter::<T>();
    match stream.next() {
        None => Step::End,
        Some(Ok(value)) => Step::Value(value, pos + stream.byte_offset()),
        Some(Err(err)) => {
            // Re-scan the malformed value as raw JSON to find its extent, so
            // decoding can continue on the next value.
            let mut raw =
                serde_json::Deserializer::from_slice(&buf[pos..]).into_iter::<serde_json::Value>();
            match raw.next() {
                Some(Ok(_)) => Step::Skipped(pos + raw.byte_offset(), Error::decode(err.to_string())),
                _ => Step::Fatal(Error::decode(err.to_string())),
            }
        }
    }
}

enum Token {
    Delim(u8),
    Str(String),
    Scalar,
}

/// A minimal JSON tokenizer used only for selector navigation. Structural
/// separators are skipped; scalars are consumed without interpretation.
struct Lexer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        while let Some(&b) = self.buf.get(self.pos) {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' | b',' | b':' => self.pos += 1,
                _ => break,
            }
        }
        let Some(&b) = self.buf.get(self.pos) else {
            return Ok(None);
        };
        match b {
            b'{' | b'}' | b'[' | b']' => {
                self.pos += 1;
                Ok(Some(Token::Delim(b)))
            }
            b'"' => {
                let start = self.pos;
                let end = string_end(self.buf, start)?;
                self.pos = end;
                let name: String = serde_json::from_slice(&self.buf[start..end])
                    .map_err(|err| Error::decode(format!("malformed string token: {err}")))?;
                Ok(Some(Token::Str(name)))
            }
            _ => {
                while let Some(&c) = self.buf.get(self.pos) {
                    match c {
                        b'{' | b'}' | b'[' | b']' | b',' | b':' | b'"' | b' ' | b'\t' | b'\r'
                        | b'\n' => break,
                        _ => self.pos += 1,
                    }
                }
                Ok(Some(Token::Scalar))
            }
        }
    }
}

/// Offset just past the closing quote of the string starting at `start`.
fn string_end(buf: &[u8], start: usize) -> Result<usize> {
    let mut i = start + 1;
    while i < buf.len() {
        match buf[i] {
            b'\\' => i += 2,
            b'"' => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(Error::decode("unterminated string in document"))
}
