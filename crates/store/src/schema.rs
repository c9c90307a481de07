//! Schema objects and URIs.
//!
//! Every object an application can name is recorded in the metadata image
//! as a [`SchemaEntry`] under its URI:
//!
//! | URI                       | Object                                   |
//! |---------------------------|------------------------------------------|
//! | `table:<name>`            | a table, backed by `file:<name>.cdb`      |
//! | `colgroup:<table>:<name>` | a projection of a table's value columns  |
//! | `index:<table>:<name>`    | a secondary index with its own file      |
//! | `file:<name>`             | a raw btree file                         |
//! | `layered:<name>`          | an ingest tree over a shared stable tree |

use cellar_types::{Format, config::CreateConfig};
use serde::{Deserialize, Serialize};

use crate::{
    btree::{TreeKind, TreeParams},
    error::{Error, Result},
};

/// Extension of btree files.
pub const FILE_SUFFIX: &str = ".cdb";

/// A parsed object URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Uri {
    Table(String),
    Colgroup { table: String, name: String },
    Index { table: String, name: String },
    File(String),
    Layered(String),
    Metadata,
    Statistics(Option<String>),
    Backup,
    PreparedDiscover,
}

impl Uri {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri.split_once(':').ok_or_else(|| Error::invalid(format!("invalid URI '{uri}'")))?;
        let name = |rest: &str| -> Result<String> {
            if rest.is_empty() {
                return Err(Error::invalid(format!("URI '{uri}' has no object name")));
            }
            Ok(rest.to_string())
        };
        let pair = |rest: &str| -> Result<(String, String)> {
            match rest.split_once(':') {
                Some((table, name)) if !table.is_empty() && !name.is_empty() => Ok((table.into(), name.into())),
                _ => Err(Error::invalid(format!("URI '{uri}' must name a table and an object"))),
            }
        };
        Ok(match scheme {
            "table" => Uri::Table(name(rest)?),
            "colgroup" => {
                let (table, name) = pair(rest)?;
                Uri::Colgroup { table, name }
            },
            "index" => {
                let (table, name) = pair(rest)?;
                Uri::Index { table, name }
            },
            "file" => Uri::File(name(rest)?),
            "layered" => Uri::Layered(name(rest)?),
            "metadata" => Uri::Metadata,
            "statistics" => Uri::Statistics((!rest.is_empty()).then(|| rest.to_string())),
            "backup" => Uri::Backup,
            "prepared_discover" => Uri::PreparedDiscover,
            _ => return Err(Error::invalid(format!("unknown URI scheme '{scheme}'"))),
        })
    }
}

/// Btree file name for a table.
pub(crate) fn table_file(table: &str) -> String {
    format!("{table}{FILE_SUFFIX}")
}

/// Btree file name for an index.
pub(crate) fn index_file(table: &str, index: &str) -> String {
    format!("{table}_{index}{FILE_SUFFIX}")
}

/// What a schema entry describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum EntryKind {
    Table {
        /// URI of the primary file.
        file: String,
        colgroups: Vec<String>,
        /// Index URIs.
        indices: Vec<String>,
    },
    File {
        id: u64,
        file_name: String,
        key_format: String,
        value_format: String,
        logged: bool,
        leaf_page_max: u64,
        memory_page_max: u64,
        allocation_size: u64,
    },
    Colgroup {
        table: String,
        columns: Vec<String>,
    },
    Index {
        table: String,
        /// Indexed columns, in key order.
        columns: Vec<String>,
        /// URI of the index file.
        file: String,
    },
    Layered {
        /// URI of the in-memory ingest file.
        ingest: String,
        /// URI of the shared stable file.
        stable: String,
    },
}

/// One schema object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SchemaEntry {
    pub uri: String,
    /// Configuration string the object was created with, as `metadata:` shows it.
    pub config: String,
    /// Column names: key columns first, then value columns.
    pub columns: Vec<String>,
    pub key_format: String,
    pub value_format: String,
    pub app_metadata: String,
    pub kind: EntryKind,
}

impl SchemaEntry {
    /// Btree id for file entries.
    pub fn file_id(&self) -> Option<u64> {
        match self.kind {
            EntryKind::File { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn key(&self) -> Result<Format> {
        Ok(Format::parse(&self.key_format)?)
    }

    pub fn value(&self) -> Result<Format> {
        Ok(Format::parse(&self.value_format)?)
    }

    pub fn tree_kind(&self) -> Result<TreeKind> {
        Ok(TreeKind::from_formats(&self.key()?, &self.value()?))
    }

    /// Position of `column` among the value columns.
    pub fn value_column(&self, column: &str) -> Result<usize> {
        let key_fields = self.key()?.fields().len();
        self.columns
            .iter()
            .skip(key_fields)
            .position(|c| c == column)
            .ok_or_else(|| Error::invalid(format!("{}: no value column named '{column}'", self.uri)))
    }

    /// Position of `column` among all columns.
    pub fn column(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| Error::invalid(format!("{}: no column named '{column}'", self.uri)))
    }

    /// Parameters to open this file's btree with.
    pub fn tree_params(&self, readonly: bool) -> Result<TreeParams> {
        let EntryKind::File { id, logged, leaf_page_max, memory_page_max, .. } = &self.kind else {
            return Err(Error::invalid(format!("{} is not a btree file", self.uri)));
        };
        Ok(TreeParams {
            id: *id,
            name: self.uri.clone(),
            kind: self.tree_kind()?,
            logged: *logged,
            readonly,
            leaf_page_max: *leaf_page_max,
            memory_page_max: *memory_page_max,
        })
    }

    /// Regenerates the configuration string after an alter.
    pub fn render_config(&mut self, logged: bool) {
        let mut parts = vec![format!("key_format={}", self.key_format), format!("value_format={}", self.value_format)];
        if !self.columns.is_empty() {
            parts.push(format!("columns=({})", self.columns.join(",")));
        }
        if let EntryKind::Table { colgroups, .. } = &self.kind {
            if !colgroups.is_empty() {
                parts.push(format!("colgroups=({})", colgroups.join(",")));
            }
        }
        if let EntryKind::File { leaf_page_max, memory_page_max, allocation_size, .. } = &self.kind {
            parts.push(format!("allocation_size={allocation_size}"));
            parts.push(format!("leaf_page_max={leaf_page_max}"));
            parts.push(format!("memory_page_max={memory_page_max}"));
        }
        parts.push(format!("log=(enabled={logged})"));
        if !self.app_metadata.is_empty() {
            parts.push(format!("app_metadata=\"{}\"", self.app_metadata));
        }
        self.config = parts.join(",");
    }
}

/// Builds the file entry for a new btree.
pub(crate) fn file_entry(uri: &str, id: u64, file_name: &str, cfg: &CreateConfig) -> SchemaEntry {
    let mut entry = SchemaEntry {
        uri: uri.to_string(),
        config: String::new(),
        columns: cfg.columns.clone(),
        key_format: cfg.key_format.clone(),
        value_format: cfg.value_format.clone(),
        app_metadata: cfg.app_metadata.clone(),
        kind: EntryKind::File {
            id,
            file_name: file_name.to_string(),
            key_format: cfg.key_format.clone(),
            value_format: cfg.value_format.clone(),
            logged: cfg.log_enabled,
            leaf_page_max: cfg.leaf_page_max,
            memory_page_max: cfg.memory_page_max,
            allocation_size: cfg.allocation_size,
        },
    };
    entry.render_config(cfg.log_enabled);
    entry
}

/// Builds the entry for an object that wraps other entries.
pub(crate) fn wrapper_entry(uri: &str, cfg: &CreateConfig, kind: EntryKind) -> SchemaEntry {
    let mut entry = SchemaEntry {
        uri: uri.to_string(),
        config: String::new(),
        columns: cfg.columns.clone(),
        key_format: cfg.key_format.clone(),
        value_format: cfg.value_format.clone(),
        app_metadata: cfg.app_metadata.clone(),
        kind,
    };
    entry.render_config(cfg.log_enabled);
    entry
}
