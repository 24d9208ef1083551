//! Database facade: named tables and indexes over one data directory.
//!
//! Table and index files live in the directory managed by a
//! [`DiskManager`]. Which file belongs to which table or index is recorded in
//! `catalog.json` next to them, rewritten after every catalog change.

use crate::index_scan::{IndexScanOperator, PredicateOperator};
use crate::join::JoinAlgorithm;
use crate::operator::{QueryOperator, SequentialScanOperator};
use crate::temp::TempSpace;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_common::{DataBox, DatabaseConfig, Result, StrataError};
use strata_storage::{
    BPlusTree, DiskManager, DiskManagerConfig, HeapTable, PageStore, Record, RecordId, Schema,
};

const CATALOG_FILE: &str = "catalog.json";

/// Persisted mapping from names to file ids.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    next_file_id: u32,
    tables: BTreeMap<String, u32>,
    indexes: Vec<IndexEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    table: String,
    column: String,
    file_id: u32,
}

impl Catalog {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StrataError::Catalog(format!("{}: {}", path.display(), e)))
    }

    /// Writes the catalog through a temporary file so a crash leaves either
    /// the old or the new version.
    fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| StrataError::Catalog(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn allocate_file_id(&mut self) -> u32 {
        let id = self.next_file_id;
        self.next_file_id += 1;
        id
    }
}

/// A set of named heap tables and their B+ tree indexes.
pub struct Database {
    config: DatabaseConfig,
    disk: Arc<DiskManager>,
    temp: Arc<TempSpace>,
    catalog_path: PathBuf,
    /// Held while the catalog and the open-object maps change together.
    catalog: Mutex<Catalog>,
    tables: RwLock<HashMap<String, Arc<HeapTable>>>,
    /// Keyed by (table, column) with the column's declared name.
    indexes: RwLock<HashMap<(String, String), Arc<BPlusTree>>>,
}

impl Database {
    /// Opens the database in `config.storage.data_dir`, creating it if empty.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let disk = Arc::new(DiskManager::new(DiskManagerConfig {
            data_dir: config.storage.data_dir.clone(),
            fsync_enabled: config.storage.fsync_enabled,
        })?);
        let catalog_path = config.storage.data_dir.join(CATALOG_FILE);
        let catalog = Catalog::load(&catalog_path)?;
        let store: Arc<dyn PageStore> = disk.clone();

        let mut tables = HashMap::new();
        for (name, file_id) in &catalog.tables {
            let table = HeapTable::open(Arc::clone(&store), *file_id, name.as_str())?;
            tables.insert(name.clone(), Arc::new(table));
        }
        let mut indexes = HashMap::new();
        for entry in &catalog.indexes {
            let tree = BPlusTree::open(Arc::clone(&store), entry.file_id)?;
            indexes.insert((entry.table.clone(), entry.column.clone()), Arc::new(tree));
        }
        info!(
            "Opened database at {} ({} tables, {} indexes)",
            config.storage.data_dir.display(),
            tables.len(),
            indexes.len()
        );

        Ok(Self {
            config,
            disk,
            temp: Arc::new(TempSpace::new()),
            catalog_path,
            catalog: Mutex::new(catalog),
            tables: RwLock::new(tables),
            indexes: RwLock::new(indexes),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Scratch space used by joins and sorts.
    pub fn temp_space(&self) -> &Arc<TempSpace> {
        &self.temp
    }

    /// Forces every open table and index file to disk.
    pub fn flush(&self) -> Result<()> {
        self.disk.flush()
    }

    fn store(&self) -> Arc<dyn PageStore> {
        self.disk.clone()
    }

    // =========================================================================
    // Tables
    // =========================================================================

    pub fn create_table(&self, name: &str, schema: Schema) -> Result<Arc<HeapTable>> {
        let mut catalog = self.catalog.lock();
        if catalog.tables.contains_key(name) {
            return Err(StrataError::TableAlreadyExists(name.to_string()));
        }
        let file_id = catalog.allocate_file_id();
        let table = Arc::new(HeapTable::create(self.store(), file_id, name, schema)?);
        catalog.tables.insert(name.to_string(), file_id);
        catalog.save(&self.catalog_path)?;
        self.tables.write().insert(name.to_string(), Arc::clone(&table));
        info!("Created table {} ({}) in file {}", name, table.schema(), file_id);
        Ok(table)
    }

    pub fn table(&self, name: &str) -> Result<Arc<HeapTable>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::TableNotFound(name.to_string()))
    }

    /// Names of all tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.catalog.lock().tables.keys().cloned().collect()
    }

    /// Removes a table, its indexes and their files.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut catalog = self.catalog.lock();
        let file_id = catalog
            .tables
            .remove(name)
            .ok_or_else(|| StrataError::TableNotFound(name.to_string()))?;
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut catalog.indexes)
            .into_iter()
            .partition(|entry| entry.table == name);
        catalog.indexes = kept;
        catalog.save(&self.catalog_path)?;

        self.tables.write().remove(name);
        let mut indexes = self.indexes.write();
        for entry in &dropped {
            indexes.remove(&(entry.table.clone(), entry.column.clone()));
            self.disk.delete_file(entry.file_id)?;
        }
        self.disk.delete_file(file_id)?;
        info!("Dropped table {} and {} indexes", name, dropped.len());
        Ok(())
    }

    // =========================================================================
    // Indexes
    // =========================================================================

    /// Builds a B+ tree over `column` of `table` from the table's current
    /// records. Later inserts through [`Database::add_record`] keep it current.
    pub fn create_index(&self, table: &str, column: &str) -> Result<Arc<BPlusTree>> {
        let heap = self.table(table)?;
        let position = column_position(&heap, column)?;
        let column = heap.schema().field_names()[position].clone();
        let key_type = heap.schema().field_types()[position];

        let mut catalog = self.catalog.lock();
        let key = (table.to_string(), column.clone());
        if self.indexes.read().contains_key(&key) {
            return Err(StrataError::IndexAlreadyExists(format!("{}.{}", table, column)));
        }
        let file_id = catalog.allocate_file_id();
        let tree = Arc::new(BPlusTree::create(
            self.store(),
            file_id,
            key_type,
            self.config.storage.btree_order,
        )?);
        for item in heap.cursor() {
            let (rid, record) = item?;
            tree.insert(record.values()[position].clone(), rid)?;
        }

        catalog.indexes.push(IndexEntry {
            table: table.to_string(),
            column: column.clone(),
            file_id,
        });
        catalog.save(&self.catalog_path)?;
        self.indexes.write().insert(key, Arc::clone(&tree));
        info!(
            "Created index on {}.{} in file {} ({} entries, height {})",
            table,
            column,
            file_id,
            heap.num_records(),
            tree.height()
        );
        Ok(tree)
    }

    pub fn index(&self, table: &str, column: &str) -> Result<Arc<BPlusTree>> {
        let heap = self.table(table)?;
        let position = column_position(&heap, column)?;
        let column = &heap.schema().field_names()[position];
        self.indexes
            .read()
            .get(&(table.to_string(), column.clone()))
            .cloned()
            .ok_or_else(|| StrataError::IndexNotFound(format!("{}.{}", table, column)))
    }

    /// Indexes on `table` with the position of the column each one covers.
    fn indexes_on(&self, heap: &HeapTable) -> Result<Vec<(usize, Arc<BPlusTree>)>> {
        let indexes = self.indexes.read();
        indexes
            .iter()
            .filter(|((table, _), _)| table == heap.name())
            .map(|((_, column), tree)| Ok((column_position(heap, column)?, Arc::clone(tree))))
            .collect()
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Inserts a record and adds it to every index on the table.
    pub fn add_record(&self, table: &str, values: Vec<DataBox>) -> Result<RecordId> {
        let heap = self.table(table)?;
        let record = heap.schema().verify(values)?;
        let rid = heap.add_record(record.values().to_vec())?;
        for (position, index) in self.indexes_on(&heap)? {
            add_index_entry(&index, &record.values()[position], rid)?;
        }
        Ok(rid)
    }

    pub fn get_record(&self, table: &str, rid: RecordId) -> Result<Record> {
        self.table(table)?.get_record(rid)
    }

    /// Overwrites a record and returns the previous values.
    ///
    /// Indexed columns that changed get a new index entry. The entry for the
    /// old value stays and is skipped by index scans.
    pub fn update_record(
        &self,
        table: &str,
        values: Vec<DataBox>,
        rid: RecordId,
    ) -> Result<Record> {
        let heap = self.table(table)?;
        let record = heap.schema().verify(values)?;
        let old = heap.update_record(record.values().to_vec(), rid)?;
        for (position, index) in self.indexes_on(&heap)? {
            let value = &record.values()[position];
            if old.value(position) != Some(value) {
                add_index_entry(&index, value, rid)?;
            }
        }
        Ok(old)
    }

    /// Deletes a record. Index entries pointing at it are left in place.
    pub fn delete_record(&self, table: &str, rid: RecordId) -> Result<Record> {
        self.table(table)?.delete_record(rid)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn scan(&self, table: &str) -> Result<SequentialScanOperator> {
        Ok(SequentialScanOperator::new(self.table(table)?))
    }

    /// Scans `table` through the index on `column`.
    pub fn index_scan(
        &self,
        table: &str,
        column: &str,
        predicate: PredicateOperator,
        value: DataBox,
    ) -> Result<IndexScanOperator> {
        let heap = self.table(table)?;
        let index = self.index(table, column)?;
        IndexScanOperator::new(heap, index, column, predicate, value)
    }

    /// Joins two operators with the configured buffer budget.
    pub fn join(
        &self,
        algorithm: JoinAlgorithm,
        left: Box<dyn QueryOperator>,
        right: Box<dyn QueryOperator>,
        left_column: &str,
        right_column: &str,
    ) -> Result<Box<dyn QueryOperator>> {
        debug!(
            "Building {} join on {} = {} with {} buffer pages",
            algorithm, left_column, right_column, self.config.execution.buffer_pages
        );
        algorithm.build(
            left,
            right,
            left_column,
            right_column,
            self.config.execution.buffer_pages,
            Arc::clone(&self.temp),
        )
    }
}

fn column_position(table: &HeapTable, column: &str) -> Result<usize> {
    table
        .schema()
        .field_index(column)
        .ok_or_else(|| StrataError::ColumnNotFound(format!("{}.{}", table.name(), column)))
}

/// Adds `(key, rid)` unless the index already holds that exact pair, which
/// happens when a slot is reused for a record with the same key.
fn add_index_entry(index: &BPlusTree, key: &DataBox, rid: RecordId) -> Result<()> {
    if !index.lookup_key(key)?.contains(&rid) {
        index.insert(key.clone(), rid)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::DataType;
    use tempfile::tempdir;

    fn config(dir: &Path) -> DatabaseConfig {
        let mut config = DatabaseConfig::with_data_dir(dir);
        config.storage.fsync_enabled = false;
        config.storage.btree_order = Some(2);
        config.execution.buffer_pages = 4;
        config
    }

    fn schema() -> Schema {
        Schema::new([("id", DataType::Int), ("name", DataType::String(8))])
    }

    fn row(id: i32, name: &str) -> Vec<DataBox> {
        vec![DataBox::Int(id), DataBox::string(name, 8)]
    }

    #[test]
    fn test_create_and_lookup_table() {
        let dir = tempdir().unwrap();
        let db = Database::open(config(dir.path())).unwrap();
        db.create_table("users", schema()).unwrap();

        assert_eq!(db.table_names(), ["users"]);
        assert!(matches!(
            db.create_table("users", schema()),
            Err(StrataError::TableAlreadyExists(_))
        ));
        assert!(matches!(db.table("nope"), Err(StrataError::TableNotFound(_))));
        assert!(dir.path().join(CATALOG_FILE).exists());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.execution.buffer_pages = 1;
        assert!(matches!(
            Database::open(config),
            Err(StrataError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_index_is_maintained_on_insert() {
        let dir = tempdir().unwrap();
        let db = Database::open(config(dir.path())).unwrap();
        db.create_table("users", schema()).unwrap();
        db.add_record("users", row(1, "ann")).unwrap();

        let index = db.create_index("users", "name").unwrap();
        let rid = db.add_record("users", row(2, "bob")).unwrap();
        assert_eq!(index.lookup_key(&DataBox::string("bob", 8)).unwrap(), [rid]);
        assert_eq!(index.lookup_key(&DataBox::string("ann", 8)).unwrap().len(), 1);

        assert!(matches!(
            db.create_index("users", "users.name"),
            Err(StrataError::IndexAlreadyExists(_))
        ));
        assert!(matches!(db.index("users", "id"), Err(StrataError::IndexNotFound(_))));
        assert!(matches!(
            db.create_index("users", "age"),
            Err(StrataError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_slot_reuse_does_not_duplicate_index_entries() {
        let dir = tempdir().unwrap();
        let db = Database::open(config(dir.path())).unwrap();
        db.create_table("users", schema()).unwrap();
        db.create_index("users", "id").unwrap();

        let rid = db.add_record("users", row(5, "a")).unwrap();
        db.delete_record("users", rid).unwrap();
        let again = db.add_record("users", row(5, "b")).unwrap();
        assert_eq!(rid, again);

        let found: Vec<Record> = db
            .index_scan("users", "id", PredicateOperator::Equals, DataBox::Int(5))
            .unwrap()
            .iter()
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(found, [Record::new(row(5, "b"))]);
    }

    #[test]
    fn test_drop_table_removes_files() {
        let dir = tempdir().unwrap();
        let db = Database::open(config(dir.path())).unwrap();
        let table = db.create_table("t", schema()).unwrap();
        let index = db.create_index("t", "id").unwrap();
        let files = [table.file_id(), index.file_id()];
        drop((table, index));

        db.drop_table("t").unwrap();
        assert!(db.table_names().is_empty());
        for file_id in files {
            assert!(!dir.path().join(format!("{:08}.dat", file_id)).exists());
        }
        assert!(matches!(db.drop_table("t"), Err(StrataError::TableNotFound(_))));
        // The name can be reused.
        db.create_table("t", schema()).unwrap();
    }

    #[test]
    fn test_handles_outliving_drop_table_fail() {
        let dir = tempdir().unwrap();
        let db = Database::open(config(dir.path())).unwrap();
        let table = db.create_table("t", schema()).unwrap();
        let index = db.create_index("t", "id").unwrap();
        let rid = db.add_record("t", row(1, "a")).unwrap();
        let files = [table.file_id(), index.file_id()];

        db.drop_table("t").unwrap();

        assert!(matches!(
            table.add_record(row(2, "b")),
            Err(StrataError::FileNotFound(_))
        ));
        assert!(matches!(
            table.get_record(rid),
            Err(StrataError::FileNotFound(_))
        ));
        assert!(matches!(
            index.insert(DataBox::Int(2), rid),
            Err(StrataError::FileNotFound(_))
        ));
        for file_id in files {
            assert!(!dir.path().join(format!("{:08}.dat", file_id)).exists());
        }
    }
}
