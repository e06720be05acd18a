use std::collections::HashMap;
use std::io::Cursor;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::warn;

use crate::error::{Error, Result};
use crate::pipeline::abort::AbortAck;
use crate::pipeline::stage::{Stage, StageContext};
use crate::record::Record;

/// Coercion context handed to every field setter.
#[derive(Clone)]
pub struct CsvContext {
    pub trim_spaces: bool,
    pub date_format: String,
}

/// A value that can be coerced from one CSV cell.
pub trait FromCsvField: Sized {
    fn from_field(raw: &str, ctx: &CsvContext) -> Result<Self>;
}

impl FromCsvField for String {
    fn from_field(raw: &str, ctx: &CsvContext) -> Result<Self> {
        if ctx.trim_spaces {
            Ok(raw.trim().to_string())
        } else {
            Ok(raw.to_string())
        }
    }
}

macro_rules! numeric_from_csv_field {
    ($($ty:ty => $what:literal),* $(,)?) => {
        $(impl FromCsvField for $ty {
            fn from_field(raw: &str, _ctx: &CsvContext) -> Result<Self> {
                raw.parse::<$ty>()
                    .map_err(|_| Error::decode(format!(concat!("error parsing ", $what, ": {}"), raw)))
            }
        })*
    };
}

numeric_from_csv_field! {
    f32 => "float",
    i64 => "int",
    i8 => "int",
    u8 => "uint",
    u16 => "uint",
    u32 => "uint",
}

impl FromCsvField for NaiveDate {
    fn from_field(raw: &str, ctx: &CsvContext) -> Result<Self> {
        NaiveDate::parse_from_str(raw, &ctx.date_format)
            .map_err(|_| Error::decode(format!("error parsing date: {raw}")))
    }
}

impl FromCsvField for NaiveDateTime {
    fn from_field(raw: &str, ctx: &CsvContext) -> Result<Self> {
        NaiveDateTime::parse_from_str(raw, &ctx.date_format)
            .map_err(|_| Error::decode(format!("error parsing date: {raw}")))
    }
}

type Assign<T> = Arc<dyn Fn(&mut T, &str, &CsvContext) -> Result<()> + Send + Sync>;

/// One column of an exemplar's setter table: the header name it answers to
/// and the coercing assignment into the record.
pub struct CsvField<T> {
    column: &'static str,
    assign: Assign<T>,
}

impl<T> Clone for CsvField<T> {
    fn clone(&self) -> Self {
        Self {
            column: self.column,
            assign: Arc::clone(&self.assign),
        }
    }
}

impl<T: 'static> CsvField<T> {
    /// A leaf field reached through `accessor` and coerced via
    /// [`FromCsvField`].
    pub fn new<V: FromCsvField + 'static>(
        column: &'static str,
        accessor: fn(&mut T) -> &mut V,
    ) -> Self {
        Self {
            column,
            assign: Arc::new(move |record, raw, ctx| {
                *accessor(record) = V::from_field(raw, ctx)?;
                Ok(())
            }),
        }
    }

    /// Flatten an embedded composite's table through a projection, so its
    /// columns map as if they were declared on the parent.
    pub fn embedded<C: CsvRecord>(accessor: fn(&mut T) -> &mut C) -> Vec<CsvField<T>> {
        C::csv_fields()
            .into_iter()
            .map(|field| {
                let assign = field.assign;
                CsvField {
                    column: field.column,
                    assign: Arc::new(move |record: &mut T, raw: &str, ctx: &CsvContext| {
                        assign(accessor(record), raw, ctx)
                    }),
                }
            })
            .collect()
    }

    pub fn column(&self) -> &'static str {
        self.column
    }
}

/// The exemplar protocol driving row decoding: a pre-built column→setter
/// table, computed once per decoder.
pub trait CsvRecord: Default + Send + Sync + 'static {
    fn csv_fields() -> Vec<CsvField<Self>>;

    /// Default decoder options for this exemplar, overridable per stage.
    fn csv_options() -> CsvOptions {
        CsvOptions::default()
    }
}

/// Options for a [`CsvDecoder`].
#[derive(Clone)]
pub struct CsvOptions {
    /// Number of parallel decoder workers.
    pub decoders: usize,
    /// Format string for date/timestamp coercions.
    pub date_format: String,
    /// Trim surrounding whitespace on string fields.
    pub trim_spaces: bool,
    /// Explicit column-index to column-name map, used when no header row is
    /// decoded. A parsed header replaces it.
    pub field_map: Option<HashMap<usize, String>>,
    /// Do not consume a header row.
    pub skip_header: bool,
    /// Fail the payload on the first row that cannot be framed or decoded,
    /// instead of logging and skipping it.
    pub abort_on_failed_row: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            decoders: default_decoders(),
            date_format: "%m/%d/%Y".to_string(),
            trim_spaces: false,
            field_map: None,
            skip_header: false,
            abort_on_failed_row: false,
        }
    }
}

fn default_decoders() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Decodes delimited text payloads into exemplar instances.
///
/// Consumes any byte-bearing record variant; emits one
/// [`Record::Decoded`] per row. The worker pool is unordered: set
/// `decoders(1)` when row order must be preserved.
pub struct CsvDecoder<T> {
    opts: CsvOptions,
    fields: Arc<Vec<CsvField<T>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: CsvRecord> CsvDecoder<T> {
    pub fn new() -> Self {
        Self {
            opts: T::csv_options(),
            fields: Arc::new(T::csv_fields()),
            _marker: PhantomData,
        }
    }

    pub fn decoders(mut self, n: usize) -> Self {
        self.opts.decoders = n.max(1);
        self
    }

    pub fn date_format(mut self, format: impl Into<String>) -> Self {
        self.opts.date_format = format.into();
        self
    }

    pub fn trim_spaces(mut self, trim: bool) -> Self {
        self.opts.trim_spaces = trim;
        self
    }

    pub fn field_map(mut self, map: HashMap<usize, String>) -> Self {
        self.opts.field_map = Some(map);
        self
    }

    pub fn skip_header(mut self, skip: bool) -> Self {
        self.opts.skip_header = skip;
        self
    }

    pub fn abort_on_failed_row(mut self, abort: bool) -> Self {
        self.opts.abort_on_failed_row = abort;
        self
    }

    fn coerce_context(&self) -> CsvContext {
        CsvContext {
            trim_spaces: self.opts.trim_spaces,
            date_format: self.opts.date_format.clone(),
        }
    }

    /// Map header names (trimmed) onto the setter table. Unmapped columns
    /// stay `None` and are skipped at decode time.
    fn map_from_header(&self, header: &csv::StringRecord) -> Vec<Option<Assign<T>>> {
        header
            .iter()
            .map(|name| {
                let name = name.trim();
                self.fields
                    .iter()
                    .find(|f| f.column == name)
                    .map(|f| Arc::clone(&f.assign))
            })
            .collect()
    }

    fn map_from_explicit(&self, map: &HashMap<usize, String>) -> Vec<Option<Assign<T>>> {
        let len = map.keys().copied().max().map_or(0, |m| m + 1);
        let mut out: Vec<Option<Assign<T>>> = vec![None; len];
        for (index, name) in map {
            out[*index] = self
                .fields
                .iter()
                .find(|f| f.column == name.as_str())
                .map(|f| Arc::clone(&f.assign));
        }
        out
    }

    /// Frame and decode one payload: a blocking framer task feeds a bounded
    /// row channel, a pool of decoder workers shares it and feeds the
    /// outward channel, and the main loop pumps decoded rows downstream.
    async fn decode_payload(
        &self,
        buf: Bytes,
        output: Option<&Sender<Record>>,
        abort: &mut Receiver<AbortAck>,
    ) -> Result<PayloadOutcome> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(Cursor::new(buf));

        let column_map: Arc<Vec<Option<Assign<T>>>> = if self.opts.skip_header {
            match &self.opts.field_map {
                Some(map) => Arc::new(self.map_from_explicit(map)),
                None => Arc::new(Vec::new()),
            }
        } else {
            let mut header = csv::StringRecord::new();
            match reader.read_record(&mut header) {
                Ok(true) => Arc::new(self.map_from_header(&header)),
                Ok(false) => return Ok(PayloadOutcome::Completed),
                Err(err) => return Err(Error::decode(err.to_string())),
            }
        };

        let workers = self.opts.decoders;
        let abort_on_failed_row = self.opts.abort_on_failed_row;
        let (row_tx, row_rx) = mpsc::channel::<csv::StringRecord>(workers);
        let (err_tx, mut err_rx) = mpsc::channel::<Error>(workers + 1);
        let (out_tx, mut out_rx) = mpsc::channel::<T>(workers);

        let framer_err = err_tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut row = csv::StringRecord::new();
            loop {
                match reader.read_record(&mut row) {
                    Ok(false) => return,
                    Ok(true) => {
                        if row_tx.blocking_send(row.clone()).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let unequal =
                            matches!(err.kind(), csv::ErrorKind::UnequalLengths { .. });
                        if unequal && !abort_on_failed_row {
                            warn!(stage = "csv", error = %err, "weir.csv.row_skipped");
                            continue;
                        }
                        let _ = framer_err.blocking_send(Error::decode(err.to_string()));
                        return;
                    }
                }
            }
        });

        let shared_rows = Arc::new(tokio::sync::Mutex::new(row_rx));
        let ctx = self.coerce_context();
        for _ in 0..workers {
            let rows = Arc::clone(&shared_rows);
            let out = out_tx.clone();
            let errs = err_tx.clone();
            let map = Arc::clone(&column_map);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                loop {
                    let row = rows.lock().await.recv().await;
                    let Some(row) = row else { return };
                    match decode_row::<T>(&row, &map, &ctx) {
                        Ok(value) => {
                            if out.send(value).await.is_err() {
                                return;
                            }
                        }
                        Err(err) if abort_on_failed_row => {
                            let _ = errs.send(err).await;
                            return;
                        }
                        Err(err) => {
                            warn!(stage = "csv", error = %err, "weir.csv.row_skipped");
                        }
                    }
                }
            });
        }
        drop(out_tx);
        drop(err_tx);

        let mut errs_open = true;
        loop {
            tokio::select! {
                _ = abort.recv() => return Ok(PayloadOutcome::Aborted),
                err = err_rx.recv(), if errs_open => {
                    match err {
                        Some(err) => return Err(err),
                        None => errs_open = false,
                    }
                }
                value = out_rx.recv() => {
                    let Some(value) = value else {
                        // Workers finished; pick up a trailing framer error.
                        if let Ok(err) = err_rx.try_recv() {
                            return Err(err);
                        }
                        return Ok(PayloadOutcome::Completed);
                    };
                    let Some(output) = output else { continue };
                    tokio::select! {
                        _ = abort.recv() => return Ok(PayloadOutcome::Aborted),
                        sent = output.send(Record::decoded(value)) => {
                            if sent.is_err() {
                                return Err(Error::pipeline("output channel closed"));
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<T: CsvRecord> Default for CsvDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

enum PayloadOutcome {
    Completed,
    Aborted,
}

#[async_trait::async_trait]
impl<T: CsvRecord> Stage for CsvDecoder<T> {
    fn name(&self) -> &str {
        "csv"
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
                    let buf = record.into_bytes().await?;
                    match self.decode_payload(buf, output.as_ref(), &mut abort).await? {
                        PayloadOutcome::Completed => {}
                        PayloadOutcome::Aborted => return Ok(()),
                    }
                }
            }
        }
    }

    fn skip_abort_ack(&self) -> bool {
        true
    }
}

fn decode_row<T: CsvRecord>(
    row: &csv::StringRecord,
    map: &[Option<Assign<T>>],
    ctx: &CsvContext,
) -> Result<T> {
    if map.is_empty() {
        return Err(Error::decode("no field map configured"));
    }
    let mut instance = T::default();
    for (column, raw) in row.iter().enumerate() {
        // Unmapped columns and empty cells keep the field's default value.
        if raw.is_empty() {
            continue;
        }
        let Some(Some(assign)) = map.get(column) else {
            continue;
        };
        assign(&mut instance, raw, ctx)?;
    }
    Ok(instance)
}
