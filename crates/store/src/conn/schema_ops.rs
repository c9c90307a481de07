//! Schema changes and cursor targets.
//!
//! Every schema change runs under the schema lock, updates the metadata
//! image and commits it before the change becomes visible through the
//! tree map. Changes to objects with open cursors fail with busy.

use std::{fs, sync::Arc};

use cellar_types::{
    Format, Row,
    config::{AlterConfig, ConfigSection, CreateConfig, DropConfig, ParsedConfig},
    pack::FieldType,
};
use tracing::{debug, info};

use super::{ConnInner, open::StoreSource};
use crate::{
    btree::{Btree, Expect, KeyRange, WriteCtx},
    disagg::layered_entries,
    error::{Error, Result},
    meta::DEFAULT_CHECKPOINT,
    schema::{EntryKind, FILE_SUFFIX, SchemaEntry, Uri, file_entry, index_file, table_file, wrapper_entry},
    txn::Reader,
    update::UpdateKind,
};

/// A secondary index maintained alongside its table.
#[derive(Debug, Clone)]
pub(crate) struct IndexTarget {
    pub uri: String,
    pub tree: Arc<Btree>,
    /// Positions of the indexed columns among the table's key and value columns.
    pub columns: Vec<usize>,
    /// Index key format: indexed columns followed by the primary key.
    pub format: Format,
}

impl IndexTarget {
    /// Packed index key for one table row.
    pub fn index_key(&self, key: &Row, value: &Row) -> Result<Vec<u8>> {
        let all: Vec<_> = key.items().iter().chain(value.items()).collect();
        let mut row = Row::default();
        for &col in &self.columns {
            let item = all.get(col).ok_or_else(|| Error::invalid(format!("{}: column {col} out of range", self.uri)))?;
            row.push((*item).clone());
        }
        for item in key.items() {
            row.push(item.clone());
        }
        Ok(self.format.pack(&row)?)
    }

    /// Splits an unpacked index key into the indexed columns and the primary key.
    pub fn split(&self, row: Row) -> (Row, Row) {
        let mut items = row.into_items();
        let primary = items.split_off(self.columns.len().min(items.len()));
        (Row::new(items), Row::new(primary))
    }
}

/// The two halves of a layered table.
#[derive(Debug, Clone)]
pub(crate) struct Layered {
    pub ingest: Arc<Btree>,
    pub stable: Arc<Btree>,
}

/// How a cursor maps its target onto trees.
#[derive(Debug, Clone)]
pub(crate) enum TargetKind {
    /// A table or file read and written directly.
    Plain,
    /// Read-only projection of some value columns.
    Colgroup { columns: Vec<usize>, format: Format },
    /// Scans an index; values come from the primary tree.
    Index(IndexTarget),
    /// Ingest layered over stable.
    Layered(Layered),
}

/// Everything a data cursor needs to know about its object.
#[derive(Debug, Clone)]
pub(crate) struct DataTarget {
    pub uri: String,
    /// Tree written by the cursor (and read for plain targets).
    pub tree: Arc<Btree>,
    pub key_format: Format,
    pub value_format: Format,
    pub kind: TargetKind,
    /// Indices updated on every write.
    pub indices: Vec<IndexTarget>,
}

impl DataTarget {
    /// Ids of every tree the target touches.
    pub fn tree_ids(&self) -> Vec<u64> {
        let mut ids = vec![self.tree.id];
        ids.extend(self.indices.iter().map(|i| i.tree.id));
        match &self.kind {
            TargetKind::Index(index) => ids.push(index.tree.id),
            TargetKind::Layered(layered) => {
                ids.push(layered.ingest.id);
                ids.push(layered.stable.id);
            },
            TargetKind::Plain | TargetKind::Colgroup { .. } => {},
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Format of the value the cursor presents.
    pub fn presented_value(&self) -> &Format {
        match &self.kind {
            TargetKind::Colgroup { format, .. } => format,
            _ => &self.value_format,
        }
    }

    /// Format of the key the cursor presents.
    pub fn presented_key(&self) -> Result<Format> {
        match &self.kind {
            TargetKind::Index(index) => {
                Ok(Format::from_fields(&index.format.fields()[..index.columns.len()])?)
            },
            _ => Ok(self.key_format.clone()),
        }
    }
}

/// `columns` and friends for index and colgroup creation.
struct ProjectionConfig {
    columns: Vec<String>,
    exclusive: bool,
    app_metadata: String,
}

impl ProjectionConfig {
    fn parse(config: &str) -> Result<Self> {
        let parsed = ParsedConfig::parse(config)?;
        let mut r = parsed.reader();
        let columns = r.list("columns")?.unwrap_or_default();
        let exclusive = r.bool("exclusive", false)?;
        let app_metadata = r.string("app_metadata")?.unwrap_or_default();
        r.finish()?;
        if columns.is_empty() {
            return Err(Error::invalid("columns must name at least one column"));
        }
        Ok(Self { columns, exclusive, app_metadata })
    }
}

fn file_name_of(entry: &SchemaEntry) -> Option<&str> {
    match &entry.kind {
        EntryKind::File { file_name, .. } => Some(file_name),
        _ => None,
    }
}

impl ConnInner {
    fn store_source(&self) -> StoreSource<'_> {
        StoreSource {
            home: &self.home,
            env: &self.env,
            disagg: self.disagg.as_ref(),
            live_restore: self.live_restore.as_ref(),
        }
    }

    fn check_writable_schema(&self) -> Result<()> {
        self.check_open()?;
        if self.readonly() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Creates a tree for a new file entry, replacing any orphaned file.
    fn new_tree(&self, entry: &SchemaEntry, shared: bool) -> Result<Arc<Btree>> {
        let EntryKind::File { file_name, allocation_size, logged, .. } = &entry.kind else {
            return Err(Error::invalid(format!("{} is not a btree file", entry.uri)));
        };
        let local = !self.env.config().in_memory && !shared && !crate::disagg::is_ingest(file_name);
        if local && self.live_restore.is_none() {
            let path = self.home.join(file_name);
            if path.exists() {
                fs::remove_file(&path)?;
                debug!(file = %file_name, "removed orphaned file");
            }
        }
        let store = self.store_source().open(file_name, *allocation_size, shared, None)?;
        let tree = Btree::create(entry.tree_params(false)?, store, self.env.clone());
        let config = self.env.config();
        tree.set_logged(*logged && config.log.enabled && !config.in_memory && !crate::disagg::is_ingest(file_name));
        Ok(Arc::new(tree))
    }

    /// Creates a schema object.
    pub fn create(&self, uri: &str, config: &str) -> Result<()> {
        self.check_writable_schema()?;
        let parsed = Uri::parse(uri)?;
        let _schema = self.schema_lock.lock();
        let mut meta = self.meta.lock();
        let exists = meta.image.schema.contains_key(uri);

        let mut entries = Vec::new();
        let mut trees = Vec::new();
        match parsed {
            Uri::Table(name) => {
                let cfg = CreateConfig::parse(config)?;
                if exists {
                    return if cfg.exclusive { Err(Error::invalid(format!("{uri}: already exists"))) } else { Ok(()) };
                }
                let id = meta.image.next_btree_id;
                let file_uri = format!("file:{}", table_file(&name));
                let file = file_entry(&file_uri, id, &table_file(&name), &cfg);
                trees.push(self.new_tree(&file, false)?);
                let table = wrapper_entry(uri, &cfg, EntryKind::Table {
                    file: file_uri,
                    colgroups: cfg.colgroups.clone(),
                    indices: Vec::new(),
                });
                entries.push(table);
                entries.push(file);
                meta.image.next_btree_id += 1;
            },
            Uri::File(name) => {
                let cfg = CreateConfig::parse(config)?;
                if exists {
                    return if cfg.exclusive { Err(Error::invalid(format!("{uri}: already exists"))) } else { Ok(()) };
                }
                if !name.ends_with(FILE_SUFFIX) && name.contains('/') {
                    return Err(Error::invalid(format!("{uri}: file names may not contain '/'")));
                }
                let id = meta.image.next_btree_id;
                let file = file_entry(uri, id, &name, &cfg);
                trees.push(self.new_tree(&file, false)?);
                entries.push(file);
                meta.image.next_btree_id += 1;
            },
            Uri::Colgroup { table, name } => {
                let cfg = ProjectionConfig::parse(config)?;
                if exists {
                    return if cfg.exclusive { Err(Error::invalid(format!("{uri}: already exists"))) } else { Ok(()) };
                }
                let table_uri = format!("table:{table}");
                let table_entry = meta
                    .image
                    .schema
                    .get(&table_uri)
                    .ok_or_else(|| Error::invalid(format!("{uri}: table {table_uri} does not exist")))?;
                let EntryKind::Table { colgroups, .. } = &table_entry.kind else {
                    return Err(Error::invalid(format!("{table_uri} is not a table")));
                };
                if !colgroups.contains(&name) {
                    return Err(Error::invalid(format!("{uri}: column group not declared by {table_uri}")));
                }
                for column in &cfg.columns {
                    table_entry.value_column(column)?;
                }
                let create = CreateConfig {
                    key_format: table_entry.key_format.clone(),
                    value_format: table_entry.value_format.clone(),
                    app_metadata: cfg.app_metadata,
                    ..CreateConfig::default()
                };
                entries.push(wrapper_entry(uri, &create, EntryKind::Colgroup { table: table_uri, columns: cfg.columns }));
            },
            Uri::Index { table, name } => {
                let cfg = ProjectionConfig::parse(config)?;
                if exists {
                    return if cfg.exclusive { Err(Error::invalid(format!("{uri}: already exists"))) } else { Ok(()) };
                }
                let table_uri = format!("table:{table}");
                let table_entry = meta
                    .image
                    .schema
                    .get(&table_uri)
                    .cloned()
                    .ok_or_else(|| Error::invalid(format!("{uri}: table {table_uri} does not exist")))?;
                let EntryKind::Table { file: primary_uri, .. } = &table_entry.kind else {
                    return Err(Error::invalid(format!("{table_uri} is not a table")));
                };
                let key = table_entry.key()?;
                let value = table_entry.value()?;
                let all_fields: Vec<FieldType> = key.fields().iter().chain(value.fields()).copied().collect();
                let mut fields = Vec::new();
                for column in &cfg.columns {
                    let field = all_fields.get(table_entry.column(column)?).copied();
                    fields.push(field.ok_or_else(|| Error::invalid(format!("{uri}: column '{column}' has no format")))?);
                }
                fields.extend(key.fields().iter().copied());
                let format = Format::from_fields(&fields)?;

                let id = meta.image.next_btree_id;
                let file_name = index_file(&table, &name);
                let file_uri = format!("file:{file_name}");
                let logged = match meta.image.schema.get(primary_uri).map(|e| &e.kind) {
                    Some(EntryKind::File { logged, .. }) => *logged,
                    _ => true,
                };
                let create = CreateConfig {
                    key_format: format.as_str().to_string(),
                    value_format: "u".to_string(),
                    log_enabled: logged,
                    app_metadata: cfg.app_metadata,
                    ..CreateConfig::default()
                };
                let file = file_entry(&file_uri, id, &file_name, &create);
                let tree = self.new_tree(&file, false)?;
                let primary_id = meta.image.schema.get(primary_uri).and_then(SchemaEntry::file_id);
                let columns = cfg
                    .columns
                    .iter()
                    .map(|c| table_entry.column(c))
                    .collect::<Result<Vec<usize>>>()?;
                if let Some(primary_id) = primary_id {
                    let index = IndexTarget { uri: uri.to_string(), tree: tree.clone(), columns: columns.clone(), format };
                    let filled = self.fill_index(&*self.tree(primary_id)?, &key, &value, &index)?;
                    debug!(index = uri, filled, "populated index");
                }
                let mut updated_table = table_entry.clone();
                if let EntryKind::Table { indices, .. } = &mut updated_table.kind {
                    indices.push(uri.to_string());
                }
                entries.push(updated_table);
                entries.push(wrapper_entry(uri, &create, EntryKind::Index {
                    table: table_uri,
                    columns: cfg.columns,
                    file: file_uri,
                }));
                entries.push(file);
                trees.push(tree);
                meta.image.next_btree_id += 1;
            },
            Uri::Layered(name) => {
                let cfg = CreateConfig::parse(config)?;
                if exists {
                    return if cfg.exclusive { Err(Error::invalid(format!("{uri}: already exists"))) } else { Ok(()) };
                }
                let Some(disagg) = &self.disagg else {
                    return Err(Error::invalid(format!("{uri}: layered tables require disaggregated storage")));
                };
                if !disagg.is_leader() {
                    return Err(Error::invalid(format!("{uri}: layered tables are created by the leader")));
                }
                let ingest_id = meta.image.next_btree_id;
                let [wrapper, ingest, stable] = layered_entries(&name, ingest_id, ingest_id + 1, &cfg);
                trees.push(self.new_tree(&ingest, false)?);
                trees.push(self.new_tree(&stable, true)?);
                entries.extend([wrapper, ingest, stable]);
                meta.image.next_btree_id += 2;
            },
            _ => return Err(Error::invalid(format!("create: unsupported URI '{uri}'"))),
        }

        for entry in entries {
            meta.image.schema.insert(entry.uri.clone(), entry);
        }
        meta.commit()?;
        drop(meta);
        let mut open = self.trees.write();
        for tree in trees {
            open.insert(tree.id, tree);
        }
        info!(uri, "created");
        Ok(())
    }

    /// Writes index entries for every row already in `primary`.
    fn fill_index(&self, primary: &Btree, key: &Format, value: &Format, index: &IndexTarget) -> Result<u64> {
        let reader = Reader::global();
        let range = KeyRange::default();
        let ctx = WriteCtx::global();
        let mut from: Option<Vec<u8>> = None;
        let mut count = 0;
        while let Some((k, v)) = primary.walk(from.as_deref(), true, &range, &reader, Some(&self.hs))? {
            let index_key = index.index_key(&key.unpack(&k)?, &value.unpack(&v)?)?;
            index.tree.write(&index_key, UpdateKind::Standard(Vec::new()), &ctx, Expect::Any)?;
            count += 1;
            from = Some(k);
        }
        Ok(count)
    }

    /// Changes logging, application metadata or the access hint of an object.
    pub fn alter(&self, uri: &str, config: &str) -> Result<()> {
        self.check_writable_schema()?;
        let cfg = AlterConfig::parse(config)?;
        let _schema = self.schema_lock.lock();
        let mut meta = self.meta.lock();
        let entry = meta.image.schema.get(uri).cloned().ok_or(Error::NotFound)?;
        let files = self.entry_files(&meta.image.schema, &entry);
        for file in &files {
            if let Some(id) = meta.image.schema.get(file).and_then(SchemaEntry::file_id) {
                if self.handle_open(id) {
                    return Err(Error::busy(format!("alter: {uri} has open cursors")));
                }
            }
        }
        let config_now = self.env.config();
        if let Some(enabled) = cfg.log_enabled {
            for file in &files {
                let Some(file_entry) = meta.image.schema.get_mut(file) else { continue };
                if let EntryKind::File { id, logged, file_name, .. } = &mut file_entry.kind {
                    *logged = enabled;
                    if let Ok(tree) = self.tree(*id) {
                        tree.set_logged(enabled && config_now.log.enabled && !crate::disagg::is_ingest(file_name));
                    }
                }
                file_entry.render_config(enabled);
            }
        }
        if let Some(app_metadata) = cfg.app_metadata {
            if let Some(entry) = meta.image.schema.get_mut(uri) {
                entry.app_metadata = app_metadata;
            }
        }
        let logged = files
            .first()
            .and_then(|f| meta.image.schema.get(f))
            .is_some_and(|e| matches!(e.kind, EntryKind::File { logged: true, .. }));
        if let Some(entry) = meta.image.schema.get_mut(uri) {
            entry.render_config(logged);
            if let Some(hint) = cfg.access_pattern_hint {
                entry.config.push_str(&format!(",access_pattern_hint={hint:?}").to_lowercase());
            }
        }
        meta.commit()?;
        info!(uri, config, "altered");
        Ok(())
    }

    /// File entry URIs backing `entry`.
    fn entry_files(
        &self,
        schema: &std::collections::BTreeMap<String, SchemaEntry>,
        entry: &SchemaEntry,
    ) -> Vec<String> {
        match &entry.kind {
            EntryKind::Table { file, indices, .. } => {
                let mut files = vec![file.clone()];
                for index in indices {
                    if let Some(EntryKind::Index { file, .. }) = schema.get(index).map(|e| &e.kind) {
                        files.push(file.clone());
                    }
                }
                files
            },
            EntryKind::File { .. } => vec![entry.uri.clone()],
            EntryKind::Index { file, .. } => vec![file.clone()],
            EntryKind::Colgroup { .. } => Vec::new(),
            EntryKind::Layered { ingest, stable } => vec![ingest.clone(), stable.clone()],
        }
    }

    /// Drops a schema object and its files.
    pub fn drop_object(&self, uri: &str, config: &str) -> Result<()> {
        self.check_writable_schema()?;
        let cfg = DropConfig::parse(config)?;
        let _ckpt = if cfg.checkpoint_wait {
            self.checkpoint_lock.lock()
        } else {
            self.checkpoint_lock.try_lock().ok_or_else(|| Error::busy("drop: a checkpoint is running"))?
        };
        let _schema = self.schema_lock.lock();
        let mut meta = self.meta.lock();
        let Some(entry) = meta.image.schema.get(uri).cloned() else {
            return if cfg.force { Ok(()) } else { Err(Error::NotFound) };
        };

        let mut uris = vec![uri.to_string()];
        let files = self.entry_files(&meta.image.schema, &entry);
        match &entry.kind {
            EntryKind::Table { colgroups, indices, .. } => {
                let name = uri.trim_start_matches("table:");
                uris.extend(colgroups.iter().map(|cg| format!("colgroup:{name}:{cg}")));
                uris.extend(indices.iter().cloned());
            },
            EntryKind::Index { table, .. } => {
                if let Some(EntryKind::Table { indices, .. }) = meta.image.schema.get_mut(table).map(|e| &mut e.kind) {
                    indices.retain(|i| i != uri);
                }
            },
            EntryKind::File { .. } => {
                let owned = meta.image.schema.values().any(|e| match &e.kind {
                    EntryKind::Table { file, .. } | EntryKind::Index { file, .. } => file == uri,
                    EntryKind::Layered { ingest, stable } => ingest == uri || stable == uri,
                    _ => false,
                });
                if owned {
                    return Err(Error::invalid(format!("drop: {uri} belongs to another object")));
                }
            },
            EntryKind::Colgroup { .. } | EntryKind::Layered { .. } => {},
        }
        uris.extend(files.iter().cloned());

        let mut ids = Vec::new();
        for file in &files {
            let Some(file_entry) = meta.image.schema.get(file) else { continue };
            let Some(id) = file_entry.file_id() else { continue };
            if self.handle_open(id) {
                return Err(Error::busy(format!("drop: {uri} has open cursors")));
            }
            ids.push((id, file_name_of(file_entry).unwrap_or_default().to_string()));
        }
        if ids.iter().any(|(id, _)| {
            meta.image.checkpoints.get(id).is_some_and(|c| c.keys().any(|name| self.checkpoint_pinned(name)))
        }) {
            return Err(Error::busy(format!("drop: a checkpoint cursor is open on {uri}")));
        }

        let shared = crate::disagg::stable_files(&meta.image.schema);
        for u in &uris {
            meta.image.schema.remove(u);
        }
        for (id, _) in &ids {
            meta.image.checkpoints.remove(id);
        }
        for (_, file_name) in &ids {
            meta.image.live_restore.remove(file_name);
        }
        meta.commit()?;
        drop(meta);

        for (id, file_name) in &ids {
            let tree = self.trees.write().remove(id);
            if let Some(tree) = tree {
                tree.close();
            }
            let removed = self.hs.remove_tree(*id)?;
            if let Some(restore) = &self.live_restore {
                restore.finish_file(file_name)?;
            }
            let is_shared = files.iter().any(|f| shared.contains(f) && f.ends_with(file_name.as_str()));
            if cfg.remove_files && !is_shared && !self.env.config().in_memory {
                let path = self.home.join(file_name);
                if path.exists() {
                    fs::remove_file(&path)?;
                }
            }
            debug!(id, file = %file_name, hs_removed = removed, "dropped btree");
        }
        info!(uri, "dropped");
        Ok(())
    }

    /// Renames a table or file.
    pub fn rename(&self, uri: &str, new_uri: &str, config: &str) -> Result<()> {
        self.check_writable_schema()?;
        ParsedConfig::parse(config)?.reader().finish()?;
        let (old_name, new_name, is_table) = match (Uri::parse(uri)?, Uri::parse(new_uri)?) {
            (Uri::Table(a), Uri::Table(b)) => (a, b, true),
            (Uri::File(a), Uri::File(b)) => (a, b, false),
            _ => return Err(Error::invalid(format!("rename: cannot rename {uri} to {new_uri}"))),
        };
        if self.env.config().in_memory {
            return Err(Error::unsupported("rename of an in-memory object"));
        }
        let _schema = self.schema_lock.lock();
        let mut meta = self.meta.lock();
        let entry = meta.image.schema.get(uri).cloned().ok_or(Error::NotFound)?;
        if meta.image.schema.contains_key(new_uri) {
            return Err(Error::invalid(format!("rename: {new_uri} already exists")));
        }
        let files = self.entry_files(&meta.image.schema, &entry);
        for file in &files {
            if let Some(id) = meta.image.schema.get(file).and_then(SchemaEntry::file_id) {
                if self.handle_open(id) {
                    return Err(Error::busy(format!("rename: {uri} has open cursors")));
                }
            }
        }

        // Plan (old uri -> new entry) for every affected entry.
        let mut moves: Vec<(String, SchemaEntry)> = Vec::new();
        let mut file_moves: Vec<(String, String)> = Vec::new();
        let rename_file = |entry: &SchemaEntry, new_file_name: &str| -> SchemaEntry {
            let mut renamed = entry.clone();
            renamed.uri = format!("file:{new_file_name}");
            if let EntryKind::File { file_name, .. } = &mut renamed.kind {
                *file_name = new_file_name.to_string();
            }
            renamed
        };
        if is_table {
            let EntryKind::Table { file, colgroups, indices } = &entry.kind else {
                return Err(Error::invalid(format!("{uri} is not a table")));
            };
            let file_entry =
                meta.image.schema.get(file).ok_or_else(|| Error::corrupt(format!("{uri}: missing {file}")))?;
            let new_file = table_file(&new_name);
            file_moves.push((file_name_of(file_entry).unwrap_or_default().to_string(), new_file.clone()));
            moves.push((file.clone(), rename_file(file_entry, &new_file)));

            let mut new_indices = Vec::new();
            for index_uri in indices {
                let Some(index_entry) = meta.image.schema.get(index_uri) else { continue };
                let EntryKind::Index { columns, file: index_file_uri, .. } = &index_entry.kind else { continue };
                let index_name = index_uri.rsplit(':').next().unwrap_or_default();
                let new_index_uri = format!("index:{new_name}:{index_name}");
                let new_index_file = index_file(&new_name, index_name);
                if let Some(f) = meta.image.schema.get(index_file_uri) {
                    file_moves.push((file_name_of(f).unwrap_or_default().to_string(), new_index_file.clone()));
                    moves.push((index_file_uri.clone(), rename_file(f, &new_index_file)));
                }
                let mut renamed = index_entry.clone();
                renamed.uri = new_index_uri.clone();
                renamed.kind = EntryKind::Index {
                    table: new_uri.to_string(),
                    columns: columns.clone(),
                    file: format!("file:{new_index_file}"),
                };
                moves.push((index_uri.clone(), renamed));
                new_indices.push(new_index_uri);
            }
            for cg in colgroups {
                let cg_uri = format!("colgroup:{old_name}:{cg}");
                if let Some(cg_entry) = meta.image.schema.get(&cg_uri) {
                    let mut renamed = cg_entry.clone();
                    renamed.uri = format!("colgroup:{new_name}:{cg}");
                    if let EntryKind::Colgroup { table, .. } = &mut renamed.kind {
                        *table = new_uri.to_string();
                    }
                    moves.push((cg_uri, renamed));
                }
            }
            let mut table = entry.clone();
            table.uri = new_uri.to_string();
            table.kind = EntryKind::Table {
                file: format!("file:{new_file}"),
                colgroups: colgroups.clone(),
                indices: new_indices,
            };
            moves.push((uri.to_string(), table));
        } else {
            let owned = meta.image.schema.values().any(|e| match &e.kind {
                EntryKind::Table { file, .. } | EntryKind::Index { file, .. } => file == uri,
                EntryKind::Layered { ingest, stable } => ingest == uri || stable == uri,
                _ => false,
            });
            if owned {
                return Err(Error::invalid(format!("rename: {uri} belongs to another object")));
            }
            file_moves.push((old_name.clone(), new_name.clone()));
            moves.push((uri.to_string(), rename_file(&entry, &new_name)));
        }

        for (from, to) in &file_moves {
            if self.home.join(to).exists() {
                return Err(Error::invalid(format!("rename: file {to} already exists")));
            }
            if let Some(restore) = &self.live_restore {
                restore.finish_file(from)?;
            }
        }
        for (from, to) in &file_moves {
            fs::rename(self.home.join(from), self.home.join(to))?;
            if let Some(progress) = meta.image.live_restore.remove(from) {
                meta.image.live_restore.insert(to.clone(), progress);
            }
        }
        for (old, _) in &moves {
            meta.image.schema.remove(old);
        }
        for (_, entry) in moves {
            meta.image.schema.insert(entry.uri.clone(), entry);
        }
        meta.commit()?;
        info!(from = uri, to = new_uri, "renamed");
        Ok(())
    }

    /// Resolves a data URI into a cursor target.
    pub fn data_target(&self, uri: &str) -> Result<DataTarget> {
        let meta = self.meta.lock();
        let schema = &meta.image.schema;
        let entry = schema.get(uri).ok_or_else(|| Error::invalid(format!("{uri}: no such object")))?;
        let file_tree = |file_uri: &str| -> Result<Arc<Btree>> {
            let id = schema
                .get(file_uri)
                .and_then(SchemaEntry::file_id)
                .ok_or_else(|| Error::corrupt(format!("{uri}: missing file entry {file_uri}")))?;
            self.tree(id)
        };
        let index_target = |index_uri: &str| -> Result<IndexTarget> {
            let index_entry = schema
                .get(index_uri)
                .ok_or_else(|| Error::corrupt(format!("{uri}: missing index entry {index_uri}")))?;
            let EntryKind::Index { table, columns, file } = &index_entry.kind else {
                return Err(Error::corrupt(format!("{index_uri} is not an index")));
            };
            let table_entry =
                schema.get(table).ok_or_else(|| Error::corrupt(format!("{index_uri}: missing table {table}")))?;
            let positions = columns.iter().map(|c| table_entry.column(c)).collect::<Result<Vec<usize>>>()?;
            Ok(IndexTarget {
                uri: index_uri.to_string(),
                tree: file_tree(file)?,
                columns: positions,
                format: Format::parse(&index_entry.key_format)?,
            })
        };

        match &entry.kind {
            EntryKind::Table { file, indices, .. } => Ok(DataTarget {
                uri: uri.to_string(),
                tree: file_tree(file)?,
                key_format: entry.key()?,
                value_format: entry.value()?,
                kind: TargetKind::Plain,
                indices: indices.iter().map(|i| index_target(i)).collect::<Result<Vec<_>>>()?,
            }),
            EntryKind::File { id, .. } => Ok(DataTarget {
                uri: uri.to_string(),
                tree: self.tree(*id)?,
                key_format: entry.key()?,
                value_format: entry.value()?,
                kind: TargetKind::Plain,
                indices: Vec::new(),
            }),
            EntryKind::Colgroup { table, columns } => {
                let table_entry =
                    schema.get(table).ok_or_else(|| Error::corrupt(format!("{uri}: missing table {table}")))?;
                let EntryKind::Table { file, .. } = &table_entry.kind else {
                    return Err(Error::corrupt(format!("{table} is not a table")));
                };
                let value = table_entry.value()?;
                let positions = columns.iter().map(|c| table_entry.value_column(c)).collect::<Result<Vec<usize>>>()?;
                let fields: Vec<FieldType> = positions.iter().map(|&p| value.fields()[p]).collect();
                Ok(DataTarget {
                    uri: uri.to_string(),
                    tree: file_tree(file)?,
                    key_format: table_entry.key()?,
                    value_format: value,
                    kind: TargetKind::Colgroup { columns: positions, format: Format::from_fields(&fields)? },
                    indices: Vec::new(),
                })
            },
            EntryKind::Index { table, .. } => {
                let table_entry =
                    schema.get(table).ok_or_else(|| Error::corrupt(format!("{uri}: missing table {table}")))?;
                let EntryKind::Table { file, .. } = &table_entry.kind else {
                    return Err(Error::corrupt(format!("{table} is not a table")));
                };
                Ok(DataTarget {
                    uri: uri.to_string(),
                    tree: file_tree(file)?,
                    key_format: table_entry.key()?,
                    value_format: table_entry.value()?,
                    kind: TargetKind::Index(index_target(uri)?),
                    indices: Vec::new(),
                })
            },
            EntryKind::Layered { ingest, stable } => {
                let layered = Layered { ingest: file_tree(ingest)?, stable: file_tree(stable)? };
                let leader = self.disagg.as_ref().is_some_and(|d| d.is_leader());
                let tree = if leader { layered.stable.clone() } else { layered.ingest.clone() };
                Ok(DataTarget {
                    uri: uri.to_string(),
                    tree,
                    key_format: entry.key()?,
                    value_format: entry.value()?,
                    kind: TargetKind::Layered(layered),
                    indices: Vec::new(),
                })
            },
        }
    }

    /// A read-only target over the checkpoint `name` of a table or file.
    pub fn checkpoint_target(&self, uri: &str, name: &str) -> Result<DataTarget> {
        let live = self.data_target(uri)?;
        if !matches!(live.kind, TargetKind::Plain | TargetKind::Layered(_)) {
            return Err(Error::unsupported(format!("checkpoint cursor on {uri}")));
        }
        let source = match &live.kind {
            TargetKind::Layered(layered) => layered.stable.clone(),
            _ => live.tree.clone(),
        };
        let meta = self.meta.lock();
        let ckpt = meta
            .image
            .checkpoint(source.id, name)
            .ok_or_else(|| Error::invalid(format!("{uri}: no checkpoint named {name}")))?;
        let entry = meta
            .image
            .schema
            .values()
            .find(|e| e.file_id() == Some(source.id))
            .ok_or_else(|| Error::corrupt(format!("{uri}: missing file entry")))?;
        let tree = Btree::open(entry.tree_params(true)?, source.store().clone(), self.env.clone(), ckpt.root.as_ref())?;
        debug!(uri, checkpoint = name, "opened checkpoint tree");
        Ok(DataTarget {
            uri: uri.to_string(),
            tree: Arc::new(tree),
            key_format: live.key_format,
            value_format: live.value_format,
            kind: TargetKind::Plain,
            indices: Vec::new(),
        })
    }

    /// Resolves the checkpoint name a cursor asked for.
    pub fn checkpoint_name(name: &str) -> &str {
        if name.is_empty() { DEFAULT_CHECKPOINT } else { name }
    }
}
