use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunError>;

/// Failures of a single download, reported after all retry attempts are spent.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("response too small: {got} bytes, need at least {min}")]
    TooSmall { got: usize, min: usize },
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{tool} exited with status {status}: {detail}")]
    ToolFailed {
        tool: String,
        status: i32,
        detail: String,
    },
    #[error("{tool} still running after {limit_secs}s, killed")]
    TimedOut { tool: String, limit_secs: u64 },
    #[error("archive entry escapes extraction directory: {0}")]
    UnsafeEntry(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no DBF found after extracting archive")]
    NoTables,
    #[error("no DBF matches the required fields; sample '{sample}' has fields {fields:?}")]
    NoMatch { sample: String, fields: Vec<String> },
}

#[derive(Debug, Error)]
pub enum DbfError {
    #[error("file too short for a DBF header ({0} bytes)")]
    Truncated(usize),
    #[error("header length {header_len} inconsistent with file size {file_len}")]
    BadHeader { header_len: usize, file_len: usize },
    #[error("field descriptors overrun the stated record length {record_len}")]
    BadLayout { record_len: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid CSV in {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("{path}: missing column '{column}'")]
    MissingColumn { path: PathBuf, column: String },
    #[error("{path} row {row}: {detail}")]
    BadRow {
        path: PathBuf,
        row: usize,
        detail: String,
    },
    #[error("unknown form code: {0}")]
    UnknownForm(String),
    #[error("form {form}: {detail}")]
    BadForm { form: String, detail: String },
    #[error("form {form}: role '{role}' has no field candidates")]
    EmptyRole { form: String, role: &'static str },
    #[error("form {form}: unsupported encoding '{encoding}'")]
    UnknownEncoding { form: String, encoding: String },
    #[error("no formulas configured for form {0}")]
    NoFormulas(String),
    #[error("formula '{name}': unknown extra key '{key}'")]
    UnknownExtraKey { name: String, key: String },
    #[error("formula '{name}': bad section value '{value}'")]
    BadSection { name: String, value: String },
    #[error("formula '{name}': expression has no usable code")]
    EmptyExpression { name: String },
}

/// One report date failed; the run carries on with the next date.
#[derive(Debug, Error)]
pub enum DateError {
    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("table selection failed: {0}")]
    Select(#[from] SelectError),
    #[error("table decode failed: {0}")]
    Decode(#[from] DbfError),
    #[error("scratch I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cancelled")]
    Cancelled,
}

/// Failures that abort a whole form run rather than a single date.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no archive tool found; tried {0}")]
    NoTool(String),
    #[error("scratch directory unavailable: {0}")]
    Scratch(#[source] std::io::Error),
    #[error("worker pool: {0}")]
    Pool(String),
    #[error("export failed: {0}")]
    Export(#[from] csv::Error),
    #[error("snapshot failed: {0}")]
    Snapshot(#[from] DbfError),
    #[error("run cancelled")]
    Cancelled,
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
