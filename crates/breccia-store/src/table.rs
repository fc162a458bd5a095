//! The tenant-scoped table store.
//!
//! One [`TableStore`] per registered projection. Rows are kept in memory
//! keyed by `(tenant, primary_key)`; durability comes from the journal.
//! The contract that matters is in [`TableStore::apply_grouped`]: ops and
//! checkpoint advance are one journal entry and one fsync — a crash leaves
//! the table exactly at some previously committed checkpoint.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use breccia_types::{GlobalPos, TenantId};

use crate::journal::{self, JournalEntry, Manifest};
use crate::value::{Row, Schema, Value};
use crate::{Result, StoreError};

/// Journal entries between snapshot compactions.
const DEFAULT_COMPACT_THRESHOLD: usize = 8192;

/// A single operation against a projection table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableOp {
    /// Insert or fully replace the row at `key`.
    Upsert { key: Value, row: Row },
    /// Remove the row at `key`, if present.
    Delete { key: Value },
}

/// A projection's materialised table: schema, rows, checkpoint.
#[derive(Debug)]
pub struct TableStore {
    name: String,
    path: PathBuf,
    schema: Schema,
    file: File,
    rows: HashMap<(TenantId, Value), Row>,
    checkpoint: Option<GlobalPos>,
    entries_since_snapshot: usize,
    compact_threshold: usize,
}

impl TableStore {
    /// Opens `<dir>/<name>.table`, creating it with `schema` if absent.
    ///
    /// An existing file must carry the identical schema; replay rebuilds
    /// rows and checkpoint, truncating any torn journal tail. A journal
    /// past the compaction threshold is compacted immediately.
    pub fn open(dir: &Path, name: &str, schema: Schema) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{name}.table"));

        if !path.exists() {
            let manifest = Manifest {
                name: name.to_string(),
                schema: schema.clone(),
            };
            let mut buf = Vec::new();
            journal::encode_manifest(&manifest, &mut buf);
            let mut file = File::create(&path)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }

        let data = fs::read(&path)?;
        let (manifest, journal_start) = journal::decode_manifest(name, &data)?;
        if manifest.name != name {
            return Err(StoreError::Corrupted {
                table: name.to_string(),
                offset: 0,
            });
        }
        if manifest.schema != schema {
            return Err(StoreError::SchemaMismatch(name.to_string()));
        }

        let (entries, durable_len) = journal::replay(&data, journal_start);
        if durable_len < data.len() {
            tracing::warn!(
                table = name,
                truncate_at = durable_len,
                lost_bytes = data.len() - durable_len,
                "torn journal tail found, truncating table file"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(durable_len as u64)?;
            file.sync_all()?;
        }

        let mut store = Self {
            name: name.to_string(),
            file: OpenOptions::new().append(true).open(&path)?,
            path,
            schema,
            rows: HashMap::new(),
            checkpoint: None,
            entries_since_snapshot: 0,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        };

        let entry_count = entries.len();
        for entry in entries {
            store.apply_in_memory(entry);
        }
        store.entries_since_snapshot = entry_count;
        if store.entries_since_snapshot >= store.compact_threshold {
            store.compact()?;
        }

        Ok(store)
    }

    /// The projection name this table belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registered schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Highest global position durably applied, if any.
    pub fn checkpoint(&self) -> Option<GlobalPos> {
        self.checkpoint
    }

    /// Atomically applies ops for one tenant and advances the checkpoint.
    pub fn apply_batch(
        &mut self,
        tenant_id: &TenantId,
        ops: Vec<TableOp>,
        last_global_pos: GlobalPos,
    ) -> Result<()> {
        self.apply_grouped(vec![(tenant_id.clone(), ops)], last_global_pos)
    }

    /// Atomically applies ops grouped by tenant and advances the
    /// checkpoint to `last_global_pos`.
    ///
    /// The checkpoint must strictly increase; otherwise nothing is written
    /// and [`StoreError::CheckpointRegression`] is returned. All ops are
    /// schema-checked before the journal entry is written, so a rejected
    /// batch leaves no trace.
    pub fn apply_grouped(
        &mut self,
        groups: Vec<(TenantId, Vec<TableOp>)>,
        last_global_pos: GlobalPos,
    ) -> Result<()> {
        if self.checkpoint.is_some_and(|current| last_global_pos <= current) {
            return Err(StoreError::CheckpointRegression {
                proposed: last_global_pos,
                current: self.checkpoint,
            });
        }

        for (_, ops) in &groups {
            for op in ops {
                if let TableOp::Upsert { key, row } = op {
                    self.schema.check_upsert(&self.name, key, row)?;
                }
            }
        }

        let entry = JournalEntry::Batch {
            checkpoint: last_global_pos,
            groups,
        };
        journal::append_entry(&mut self.file, &entry)?;
        self.apply_in_memory(entry);
        self.entries_since_snapshot += 1;

        if self.entries_since_snapshot >= self.compact_threshold {
            self.compact()?;
        }
        Ok(())
    }

    /// Reads the row at `(tenant, key)`.
    ///
    /// The returned row always carries the primary-key column.
    pub fn read_row(&self, tenant_id: &TenantId, key: &Value) -> Option<Row> {
        self.rows
            .get(&(tenant_id.clone(), key.clone()))
            .map(|row| {
                let mut row = row.clone();
                row.entry(self.schema.primary_key().name.clone())
                    .or_insert_with(|| key.clone());
                row
            })
    }

    /// Number of rows stored for `tenant`.
    pub fn tenant_row_count(&self, tenant_id: &TenantId) -> u64 {
        self.rows.keys().filter(|(t, _)| t == tenant_id).count() as u64
    }

    /// Erases every row of one tenant. Durable, but independent of the
    /// checkpoint (erasure requests arrive out-of-band of the log).
    pub fn delete_tenant(&mut self, tenant_id: &TenantId) -> Result<u64> {
        let deleted = self.tenant_row_count(tenant_id);
        let entry = JournalEntry::Purge {
            tenant_id: tenant_id.clone(),
        };
        journal::append_entry(&mut self.file, &entry)?;
        self.apply_in_memory(entry);
        self.entries_since_snapshot += 1;

        tracing::info!(
            table = %self.name,
            tenant_id = %tenant_id,
            rows = deleted,
            "tenant erased from projection"
        );
        Ok(deleted)
    }

    fn apply_in_memory(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Batch { checkpoint, groups } => {
                for (tenant_id, ops) in groups {
                    for op in ops {
                        match op {
                            TableOp::Upsert { key, row } => {
                                self.rows.insert((tenant_id.clone(), key), row);
                            }
                            TableOp::Delete { key } => {
                                self.rows.remove(&(tenant_id.clone(), key));
                            }
                        }
                    }
                }
                self.checkpoint = Some(checkpoint);
            }
            JournalEntry::Purge { tenant_id } => {
                self.rows.retain(|(t, _), _| t != &tenant_id);
            }
            JournalEntry::Snapshot { checkpoint, rows } => {
                self.rows = rows
                    .into_iter()
                    .map(|(tenant, key, row)| ((tenant, key), row))
                    .collect();
                self.checkpoint = checkpoint;
            }
        }
    }

    /// Folds the journal into a single snapshot entry.
    ///
    /// Writes a fresh file beside the live one and renames it into place;
    /// a crash mid-compaction leaves either the old or the new file, both
    /// complete.
    fn compact(&mut self) -> Result<()> {
        let mut buf = Vec::new();
        journal::encode_manifest(
            &Manifest {
                name: self.name.clone(),
                schema: self.schema.clone(),
            },
            &mut buf,
        );
        let snapshot = JournalEntry::Snapshot {
            checkpoint: self.checkpoint,
            rows: self
                .rows
                .iter()
                .map(|((tenant, key), row)| (tenant.clone(), key.clone(), row.clone()))
                .collect(),
        };
        journal::encode_entry(&snapshot, &mut buf);

        let tmp = self.path.with_extension("table.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.entries_since_snapshot = 0;

        tracing::info!(
            table = %self.name,
            rows = self.rows.len(),
            bytes = buf.len(),
            "compacted projection journal"
        );
        Ok(())
    }

    #[cfg(test)]
    fn set_compact_threshold(&mut self, threshold: usize) {
        self.compact_threshold = threshold;
    }
}
