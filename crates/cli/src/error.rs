//! Errors surfaced by `wt` commands.

use std::path::PathBuf;

use snafu::Snafu;

/// A failed `wt` command.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    /// The engine refused an operation.
    #[snafu(display("{source}"), context(false))]
    Store {
        /// Engine error.
        source: cellar_store::Error,
    },

    /// Reading or writing a file failed.
    #[snafu(display("{}: {source}", path.display()))]
    File {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Writing output failed.
    #[snafu(display("write failed: {source}"), context(false))]
    Output {
        /// Underlying error.
        source: std::io::Error,
    },

    /// A JSON document could not be parsed or written.
    #[snafu(display("JSON: {source}"), context(false))]
    Json {
        /// Underlying error.
        source: serde_json::Error,
    },

    /// A dump file is malformed.
    #[snafu(display("line {line}: {message}"))]
    DumpFormat {
        /// One-based line number.
        line: usize,
        /// What is wrong.
        message: String,
    },

    /// The command line asked for something impossible.
    #[snafu(display("{message}"))]
    Usage {
        /// Explanation.
        message: String,
    },
}

impl CliError {
    /// Reserved engine code name (`WT_NOTFOUND`, ...) when one applies.
    pub fn code_name(&self) -> Option<&'static str> {
        match self {
            CliError::Store { source } => source.code().map(|c| c.name()),
            _ => None,
        }
    }
}

/// Result alias for `wt` commands.
pub type Result<T> = std::result::Result<T, CliError>;
