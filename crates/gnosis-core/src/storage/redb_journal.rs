//! # redb-backed Journal
//!
//! A disk-backed journal using the redb embedded database.
//!
//! redb gives us ACID write transactions and copy-on-write crash safety, so
//! one commit batch maps to one redb write transaction: the entity log rows
//! and the latest-index rows land together or not at all.
//!
//! Values are postcard-encoded.

use super::Journal;
use crate::audit::AuditRecord;
use crate::primitives::{FORMAT_VERSION, MAGIC_BYTES};
use crate::registry::PluginInfo;
use crate::types::{Entity, EntityId, GnosisError};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;

/// Table for the entity log: seq(u64) -> serialized Entity bytes
const ENTITY_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("entity_log");

/// Table for the latest-version index: EntityId(u128) -> version(u64)
const LATEST_INDEX: TableDefinition<u128, u64> = TableDefinition::new("latest_index");

/// Table for plugins: operation name -> serialized PluginInfo bytes
const PLUGINS: TableDefinition<&str, &[u8]> = TableDefinition::new("plugins");

/// Table for the audit log: seq(u64) -> serialized AuditRecord bytes
const AUDIT_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("audit_log");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const NEXT_ENTITY_SEQ: &str = "next_entity_seq";
const FORMAT_KEY: &str = "format_version";
const MAGIC_KEY: &str = "magic";

fn magic() -> u64 {
    u64::from(u32::from_be_bytes(*MAGIC_BYTES))
}

fn io_err(e: impl std::fmt::Display) -> GnosisError {
    GnosisError::Storage(e.to_string())
}

fn ser_err(e: impl std::fmt::Display) -> GnosisError {
    GnosisError::Serialization(e.to_string())
}

/// A disk-backed journal.
pub struct RedbJournal {
    db: Database,
}

impl std::fmt::Debug for RedbJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbJournal").finish_non_exhaustive()
    }
}

impl RedbJournal {
    /// Open or create a journal database at the given path.
    ///
    /// A fresh database is stamped with the magic bytes and format version.
    /// Fails with `Storage` if the file is not a journal (missing or foreign
    /// magic) or was written by an incompatible format version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GnosisError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(io_err)?;
            let _ = write_txn.open_table(ENTITY_LOG).map_err(io_err)?;
            let _ = write_txn.open_table(LATEST_INDEX).map_err(io_err)?;
            let _ = write_txn.open_table(PLUGINS).map_err(io_err)?;
            let _ = write_txn.open_table(AUDIT_LOG).map_err(io_err)?;
            {
                let fresh = write_txn
                    .open_table(ENTITY_LOG)
                    .map_err(io_err)?
                    .is_empty()
                    .map_err(io_err)?;
                let mut meta = write_txn.open_table(METADATA).map_err(io_err)?;
                let stamp = meta.get(MAGIC_KEY).map_err(io_err)?.map(|v| v.value());
                let stored = meta.get(FORMAT_KEY).map_err(io_err)?.map(|v| v.value());
                match (stamp, stored) {
                    (None, None) if fresh => {
                        meta.insert(MAGIC_KEY, magic()).map_err(io_err)?;
                        meta.insert(FORMAT_KEY, u64::from(FORMAT_VERSION))
                            .map_err(io_err)?;
                    }
                    (Some(stamp), _) if stamp == magic() => {}
                    _ => {
                        return Err(GnosisError::Storage(format!(
                            "{} is not a gnosis journal",
                            path.as_ref().display()
                        )));
                    }
                }
                match stored {
                    None => {
                        meta.insert(FORMAT_KEY, u64::from(FORMAT_VERSION))
                            .map_err(io_err)?;
                    }
                    Some(version) if version == u64::from(FORMAT_VERSION) => {}
                    Some(version) => {
                        return Err(GnosisError::Storage(format!(
                            "unsupported journal format version {} (expected {})",
                            version, FORMAT_VERSION
                        )));
                    }
                }
            }
            write_txn.commit().map_err(io_err)?;
        }

        Ok(Self { db })
    }
}

impl Journal for RedbJournal {
    fn append_entities(&self, entities: &[Entity]) -> Result<(), GnosisError> {
        if entities.is_empty() {
            return Ok(());
        }

        // Encode before opening the write transaction so a bad payload never
        // leaves a half-written batch behind.
        let encoded = entities
            .iter()
            .map(|entity| postcard::to_allocvec(entity).map_err(ser_err))
            .collect::<Result<Vec<_>, _>>()?;

        let write_txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut log = write_txn.open_table(ENTITY_LOG).map_err(io_err)?;
            let mut latest = write_txn.open_table(LATEST_INDEX).map_err(io_err)?;
            let mut meta = write_txn.open_table(METADATA).map_err(io_err)?;

            let mut seq = meta
                .get(NEXT_ENTITY_SEQ)
                .map_err(io_err)?
                .map(|v| v.value())
                .unwrap_or(0);

            for (entity, bytes) in entities.iter().zip(&encoded) {
                log.insert(seq, bytes.as_slice()).map_err(io_err)?;
                latest
                    .insert(entity.id.as_u128(), entity.version)
                    .map_err(io_err)?;
                seq = seq.saturating_add(1);
            }

            meta.insert(NEXT_ENTITY_SEQ, seq).map_err(io_err)?;
        }
        write_txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn load_entities(&self) -> Result<Vec<Entity>, GnosisError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let table = read_txn.open_table(ENTITY_LOG).map_err(io_err)?;

        let mut entities = Vec::new();
        for entry in table.iter().map_err(io_err)? {
            let (_, value) = entry.map_err(io_err)?;
            let entity: Entity = postcard::from_bytes(value.value()).map_err(ser_err)?;
            entities.push(entity);
        }
        Ok(entities)
    }

    fn load_latest_index(&self) -> Result<BTreeMap<EntityId, u64>, GnosisError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let table = read_txn.open_table(LATEST_INDEX).map_err(io_err)?;

        let mut index = BTreeMap::new();
        for entry in table.iter().map_err(io_err)? {
            let (key, value) = entry.map_err(io_err)?;
            index.insert(EntityId::from_u128(key.value()), value.value());
        }
        Ok(index)
    }

    fn store_latest_index(&self, index: &BTreeMap<EntityId, u64>) -> Result<(), GnosisError> {
        let write_txn = self.db.begin_write().map_err(io_err)?;
        write_txn.delete_table(LATEST_INDEX).map_err(io_err)?;
        {
            let mut latest = write_txn.open_table(LATEST_INDEX).map_err(io_err)?;
            for (id, version) in index {
                latest.insert(id.as_u128(), *version).map_err(io_err)?;
            }
        }
        write_txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn append_audit(&self, record: &AuditRecord) -> Result<(), GnosisError> {
        let bytes = postcard::to_allocvec(record).map_err(ser_err)?;
        let write_txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = write_txn.open_table(AUDIT_LOG).map_err(io_err)?;
            table.insert(record.seq, bytes.as_slice()).map_err(io_err)?;
        }
        write_txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn load_audit(&self) -> Result<Vec<AuditRecord>, GnosisError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let table = read_txn.open_table(AUDIT_LOG).map_err(io_err)?;

        let mut records = Vec::new();
        for entry in table.iter().map_err(io_err)? {
            let (_, value) = entry.map_err(io_err)?;
            records.push(postcard::from_bytes(value.value()).map_err(ser_err)?);
        }
        Ok(records)
    }

    fn put_plugin(&self, operation: &str, info: &PluginInfo) -> Result<(), GnosisError> {
        let bytes = postcard::to_allocvec(info).map_err(ser_err)?;
        let write_txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut table = write_txn.open_table(PLUGINS).map_err(io_err)?;
            table.insert(operation, bytes.as_slice()).map_err(io_err)?;
        }
        write_txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn load_plugins(&self) -> Result<Vec<(String, PluginInfo)>, GnosisError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let table = read_txn.open_table(PLUGINS).map_err(io_err)?;

        let mut plugins = Vec::new();
        for entry in table.iter().map_err(io_err)? {
            let (key, value) = entry.map_err(io_err)?;
            let info: PluginInfo = postcard::from_bytes(value.value()).map_err(ser_err)?;
            plugins.push((key.value().to_string(), info));
        }
        Ok(plugins)
    }
}
