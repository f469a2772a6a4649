//! redb table definitions and the local store
//!
//! One database file holds every collection, their secondary-index entries,
//! the sync queue, and store metadata. Composite byte keys with a `0x00`
//! separator allow per-collection prefix scans.

use std::path::PathBuf;

use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::schema::{CollectionSpec, delivery_schema, encode_index_value};

/// Schema version written into the meta table on first open.
pub const SCHEMA_VERSION: u64 = 1;

// Table definitions
// Key: (collection, 0x00, record_id), Value: JSON record bytes
pub(crate) const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

// Key: (collection, 0x00, index, 0x00, value, 0x00, record_id), Value: record_id bytes
pub(crate) const INDEX_ENTRIES: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("index_entries");

// Key: entry sequence number, Value: serialized QueueEntry
pub(crate) const SYNC_QUEUE: TableDefinition<u64, &[u8]> = TableDefinition::new("sync_queue");

// Key: meta field name, Value: u64
pub(crate) const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub(crate) const META_SCHEMA_VERSION: &str = "schema_version";
pub(crate) const META_QUEUE_SEQ: &str = "queue_seq";

const SEP: u8 = 0x00;

/// Configuration for the local store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Declared collections and their indexes
    pub schema: Vec<CollectionSpec>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/waybill.redb"),
            schema: delivery_schema(),
        }
    }
}

/// Durable, transactional on-device store.
///
/// Holds typed record collections plus the reserved sync-queue table. The
/// store is a cache of server-originated records; the backend owns the
/// authoritative version. Every public operation is one redb transaction,
/// so a multi-record `put_many` is all-or-nothing.
pub struct LocalStore {
    db: Database,
    config: StoreConfig,
}

impl LocalStore {
    /// Open or create the store at the configured path.
    ///
    /// Declares all tables idempotently and records the schema version on
    /// first creation. Fails with [`StoreError::Unavailable`] when the
    /// database cannot be opened at all, and with
    /// [`StoreError::SchemaVersion`] when the on-disk version is newer than
    /// this build supports.
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::unavailable(e.to_string()))?;
        }

        let db = Database::create(&config.db_path)
            .map_err(|e| StoreError::unavailable(e.to_string()))?;

        info!("Opened local store");

        let store = Self { db, config };
        store.init_tables()?;

        Ok(store)
    }

    /// Declare tables and check the schema version.
    fn init_tables(&self) -> Result<(), StoreError> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::database(e.to_string()))?;

        {
            write_txn
                .open_table(RECORDS)
                .map_err(|e| StoreError::database(e.to_string()))?;
            write_txn
                .open_table(INDEX_ENTRIES)
                .map_err(|e| StoreError::database(e.to_string()))?;
            write_txn
                .open_table(SYNC_QUEUE)
                .map_err(|e| StoreError::database(e.to_string()))?;

            let mut meta = write_txn
                .open_table(META)
                .map_err(|e| StoreError::database(e.to_string()))?;

            let found = meta
                .get(META_SCHEMA_VERSION)
                .map_err(|e| StoreError::database(e.to_string()))?
                .map(|v| v.value());

            match found {
                None => {
                    meta.insert(META_SCHEMA_VERSION, SCHEMA_VERSION)
                        .map_err(|e| StoreError::database(e.to_string()))?;
                }
                Some(v) if v > SCHEMA_VERSION => {
                    return Err(StoreError::SchemaVersion {
                        found: v,
                        supported: SCHEMA_VERSION,
                    });
                }
                Some(v) if v < SCHEMA_VERSION => {
                    // Tables and indexes are declared idempotently above, so
                    // upgrading is just recording the new version.
                    meta.insert(META_SCHEMA_VERSION, SCHEMA_VERSION)
                        .map_err(|e| StoreError::database(e.to_string()))?;
                    info!(from = v, to = SCHEMA_VERSION, "Upgraded store schema");
                }
                Some(_) => {}
            }
        }

        write_txn
            .commit()
            .map_err(|e| StoreError::database(e.to_string()))?;

        debug!("Initialized store tables");
        Ok(())
    }

    /// Get the configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Get a reference to the database
    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    /// Look up a declared collection spec.
    pub fn spec(&self, collection: &str) -> Result<&CollectionSpec, StoreError> {
        self.config
            .schema
            .iter()
            .find(|c| c.name == collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))
    }

    /// The key field of a declared collection.
    pub fn key_field(&self, collection: &str) -> Result<&str, StoreError> {
        Ok(self.spec(collection)?.key_field.as_str())
    }

    /// The schema version recorded in the store.
    pub fn schema_version(&self) -> Result<u64, StoreError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::database(e.to_string()))?;
        let meta = read_txn
            .open_table(META)
            .map_err(|e| StoreError::database(e.to_string()))?;
        let version = meta
            .get(META_SCHEMA_VERSION)
            .map_err(|e| StoreError::database(e.to_string()))?
            .map(|v| v.value())
            .unwrap_or(0);
        Ok(version)
    }

    /// Upsert one record by identity.
    pub fn put(&self, collection: &str, record: &Value) -> Result<(), StoreError> {
        self.put_many(collection, std::slice::from_ref(record))
    }

    /// Upsert a batch of records in one transaction (all-or-nothing).
    ///
    /// Secondary-index entries are maintained in the same transaction:
    /// stale entries from a previous version of each record are removed
    /// before the new ones are written. A record missing an indexed field
    /// is warned about and left out of that index only.
    pub fn put_many(&self, collection: &str, records: &[Value]) -> Result<(), StoreError> {
        let spec = self.spec(collection)?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::database(e.to_string()))?;

        {
            let mut records_table = write_txn
                .open_table(RECORDS)
                .map_err(|e| StoreError::database(e.to_string()))?;
            let mut index_table = write_txn
                .open_table(INDEX_ENTRIES)
                .map_err(|e| StoreError::database(e.to_string()))?;

            for record in records {
                let id = spec
                    .record_id(record)
                    .ok_or_else(|| StoreError::MissingKey {
                        collection: collection.to_string(),
                        key_field: spec.key_field.clone(),
                    })?
                    .to_string();

                let key = record_key(collection, &id);

                let previous = records_table
                    .get(key.as_slice())
                    .map_err(|e| StoreError::database(e.to_string()))?
                    .map(|v| v.value().to_vec());

                if let Some(prev_bytes) = previous {
                    remove_index_entries(&mut index_table, spec, &id, &prev_bytes)?;
                }

                let bytes = serde_json::to_vec(record)
                    .map_err(|e| StoreError::serialization(e.to_string()))?;
                records_table
                    .insert(key.as_slice(), bytes.as_slice())
                    .map_err(|e| StoreError::database(e.to_string()))?;

                for index in &spec.indexes {
                    match record.get(&index.field) {
                        Some(value) => {
                            let ikey =
                                index_key(collection, &index.name, &encode_index_value(value), &id);
                            index_table
                                .insert(ikey.as_slice(), id.as_bytes())
                                .map_err(|e| StoreError::database(e.to_string()))?;
                        }
                        None => {
                            warn!(
                                collection,
                                index = %index.name,
                                record_id = %id,
                                "Record missing indexed field; absent from index"
                            );
                        }
                    }
                }
            }
        }

        write_txn
            .commit()
            .map_err(|e| StoreError::database(e.to_string()))?;

        Ok(())
    }

    /// Get one record by identity. Absence is `Ok(None)`, not an error.
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.spec(collection)?;

        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::database(e.to_string()))?;
        let table = read_txn
            .open_table(RECORDS)
            .map_err(|e| StoreError::database(e.to_string()))?;

        let key = record_key(collection, id);
        let bytes = table
            .get(key.as_slice())
            .map_err(|e| StoreError::database(e.to_string()))?
            .map(|v| v.value().to_vec());

        match bytes {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::deserialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Get all records in a collection.
    ///
    /// Corrupt records are warned about and skipped rather than failing the
    /// whole scan.
    pub fn all(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        self.spec(collection)?;

        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::database(e.to_string()))?;
        let table = read_txn
            .open_table(RECORDS)
            .map_err(|e| StoreError::database(e.to_string()))?;

        let prefix = collection_prefix(collection);
        let mut records = Vec::new();

        let range = table
            .range(prefix.as_slice()..)
            .map_err(|e| StoreError::database(e.to_string()))?;

        for entry in range {
            let (key, value) = entry.map_err(|e| StoreError::database(e.to_string()))?;
            if !key.value().starts_with(prefix.as_slice()) {
                break;
            }
            match serde_json::from_slice(value.value()) {
                Ok(record) => records.push(record),
                Err(e) => warn!(collection, error = %e, "Skipping corrupt record"),
            }
        }

        Ok(records)
    }

    /// Get all records whose indexed field equals `value`.
    ///
    /// Returns an empty vector when nothing matches.
    pub fn get_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> Result<Vec<Value>, StoreError> {
        let spec = self.spec(collection)?;
        if spec.index(index).is_none() {
            return Err(StoreError::UnknownIndex {
                collection: collection.to_string(),
                index: index.to_string(),
            });
        }

        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::database(e.to_string()))?;
        let index_table = read_txn
            .open_table(INDEX_ENTRIES)
            .map_err(|e| StoreError::database(e.to_string()))?;
        let records_table = read_txn
            .open_table(RECORDS)
            .map_err(|e| StoreError::database(e.to_string()))?;

        let prefix = index_prefix(collection, index, &encode_index_value(value));
        let mut records = Vec::new();

        let range = index_table
            .range(prefix.as_slice()..)
            .map_err(|e| StoreError::database(e.to_string()))?;

        for entry in range {
            let (key, id_bytes) = entry.map_err(|e| StoreError::database(e.to_string()))?;
            if !key.value().starts_with(prefix.as_slice()) {
                break;
            }

            let id = String::from_utf8_lossy(id_bytes.value()).to_string();
            let record_bytes = records_table
                .get(record_key(collection, &id).as_slice())
                .map_err(|e| StoreError::database(e.to_string()))?
                .map(|v| v.value().to_vec());

            match record_bytes {
                Some(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(collection, record_id = %id, error = %e, "Skipping corrupt record"),
                },
                None => {
                    warn!(collection, index, record_id = %id, "Dangling index entry");
                }
            }
        }

        Ok(records)
    }

    /// Delete a record by identity. Idempotent: deleting an absent record
    /// succeeds.
    pub fn remove(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let spec = self.spec(collection)?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::database(e.to_string()))?;

        {
            let mut records_table = write_txn
                .open_table(RECORDS)
                .map_err(|e| StoreError::database(e.to_string()))?;
            let mut index_table = write_txn
                .open_table(INDEX_ENTRIES)
                .map_err(|e| StoreError::database(e.to_string()))?;

            let key = record_key(collection, id);
            let previous = records_table
                .remove(key.as_slice())
                .map_err(|e| StoreError::database(e.to_string()))?
                .map(|v| v.value().to_vec());

            if let Some(prev_bytes) = previous {
                remove_index_entries(&mut index_table, spec, id, &prev_bytes)?;
            }
        }

        write_txn
            .commit()
            .map_err(|e| StoreError::database(e.to_string()))?;

        Ok(())
    }

    /// Count records in a collection.
    pub fn count(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self.all(collection)?.len())
    }
}

/// Remove all index entries pointing at a stored record version.
fn remove_index_entries(
    index_table: &mut redb::Table<'_, &[u8], &[u8]>,
    spec: &CollectionSpec,
    id: &str,
    record_bytes: &[u8],
) -> Result<(), StoreError> {
    let record: Value = match serde_json::from_slice(record_bytes) {
        Ok(record) => record,
        Err(e) => {
            warn!(collection = %spec.name, record_id = %id, error = %e,
                "Cannot decode previous record version; stale index entries may remain");
            return Ok(());
        }
    };

    for index in &spec.indexes {
        if let Some(value) = record.get(&index.field) {
            let ikey = index_key(&spec.name, &index.name, &encode_index_value(value), id);
            index_table
                .remove(ikey.as_slice())
                .map_err(|e| StoreError::database(e.to_string()))?;
        }
    }

    Ok(())
}

/// Make the key for a record
pub(crate) fn record_key(collection: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(collection.len() + 1 + id.len());
    key.extend_from_slice(collection.as_bytes());
    key.push(SEP);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Make the prefix covering all records of a collection
pub(crate) fn collection_prefix(collection: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(collection.len() + 1);
    prefix.extend_from_slice(collection.as_bytes());
    prefix.push(SEP);
    prefix
}

/// Make the key for a secondary-index entry
pub(crate) fn index_key(collection: &str, index: &str, value: &[u8], id: &str) -> Vec<u8> {
    let mut key = index_prefix(collection, index, value);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Make the prefix covering all entries of one index value
pub(crate) fn index_prefix(collection: &str, index: &str, value: &[u8]) -> Vec<u8> {
    let mut prefix =
        Vec::with_capacity(collection.len() + index.len() + value.len() + 3);
    prefix.extend_from_slice(collection.as_bytes());
    prefix.push(SEP);
    prefix.extend_from_slice(index.as_bytes());
    prefix.push(SEP);
    prefix.extend_from_slice(value);
    prefix.push(SEP);
    prefix
}
