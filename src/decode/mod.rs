pub mod csv;
pub mod json;

pub use csv::{CsvContext, CsvDecoder, CsvField, CsvOptions, CsvRecord, FromCsvField};
pub use json::JsonDecoder;
