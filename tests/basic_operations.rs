//! Tests for basic transaction operations on tables stored on the local filesystem.
use std::sync::Arc;

use uuid::Uuid;

use evolake::{Table, TableError, TableIdent, TableLoader};
use evolake::schema::{Schema, Field, PrimitiveType, SchemaChange, SchemaType};
use evolake::datafile::{DataFile, DataFileFormat};
use evolake::storage::{TableStorage, StoragePath};
use evolake::store::{MetadataStore, ObjectStoreMetadataStore, StoreError};
use evolake::transaction::AppendFilesOperation;

/// Wraps Table with temporary directory creation and deletion and a few
/// helper functions.
struct TestTable {
    path: std::path::PathBuf,
    storage: Arc<TableStorage>,
    store: Arc<ObjectStoreMetadataStore>,
    table: Table,
}

impl TestTable {
    fn schema() -> Schema {
        Schema::new(0, vec![
            Field::new_primitive(1, "id", true, PrimitiveType::Long),
            Field::new_primitive(2, "ts", false, PrimitiveType::Timestamp),
            Field::new_primitive(3, "name", false, PrimitiveType::String),
        ])
    }

    fn ident() -> TableIdent {
        TableIdent::parse("db.events").unwrap()
    }

    fn new_datafile(
        &self,
        record_count: i64,
        file_size_in_bytes: i64,
    ) -> DataFile {
        let path = self.ident_path()
            .child("data")
            .child(&format!("{}.json", Uuid::new_v4()));

        DataFile::builder(
            &self.storage.to_uri(&path),
            DataFileFormat::Json,
            record_count,
            file_size_in_bytes
        ).build()
    }

    fn ident_path(&self) -> StoragePath {
        Self::ident().storage_path()
    }

    async fn new() -> Self {
        let mut path = std::env::temp_dir();
        path.push("evolake");
        path.push(format!("wh-{}", Uuid::new_v4().to_string()));

        let storage = Arc::new(TableStorage::from_url(
            &format!("file://{}", path.to_str().unwrap()),
            Default::default()
        ).unwrap());
        let store = Arc::new(ObjectStoreMetadataStore::new(storage.clone()));

        let table = TableLoader::new(store.clone(), &Self::ident())
            .with_location(&storage.to_uri(&Self::ident().storage_path()))
            .create(Self::schema(), Vec::new())
            .await
            .unwrap();

        Self { path, storage, store, table }
    }

    async fn append(&mut self, files: Vec<DataFile>) {
        let base = self.table.current_head().map(|s| s.snapshot_id);
        let mut op = AppendFilesOperation::new(base, 0, 0);
        op.append_files(files);

        let mut transaction = self.table.new_transaction();
        transaction.add_operation(Box::new(op));
        transaction.commit().await.unwrap();
    }
}

impl Drop for TestTable {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

impl std::ops::Deref for TestTable {
    type Target = Table;

    fn deref(&self) -> &Self::Target {
        &self.table
    }
}

impl std::ops::DerefMut for TestTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.table
    }
}

#[tokio::test]
async fn append_operation() {
    let mut table = TestTable::new().await;

    let datafile1 = table.new_datafile(1111, 10111);
    let datafile2 = table.new_datafile(2222, 20222);

    // Append the files in two operations, to create two snapshots.
    table.append(vec![datafile1.clone()]).await;
    table.append(vec![datafile2.clone()]).await;

    let history = table.history().unwrap();
    assert_eq!(history.len(), 2);

    assert_eq!(history[0].sequence_number, 2);
    assert_eq!(history[0].parent_snapshot_id, Some(history[1].snapshot_id));
    assert_eq!(history[0].added_files, vec![datafile2.clone()]);
    assert_eq!(history[0].record_count(), 3333);
    assert_eq!(history[0].summary.stat("added-records"), Some(2222));

    assert_eq!(history[1].sequence_number, 1);
    assert_eq!(history[1].parent_snapshot_id, None);
    assert_eq!(history[1].record_count(), 1111);

    let files = table.metadata().files_at(history[1].snapshot_id).unwrap();
    assert_eq!(files, vec![&datafile1]);
    let files = table.metadata().files_at(history[0].snapshot_id).unwrap();
    assert_eq!(files, vec![&datafile1, &datafile2]);
}

#[tokio::test]
async fn metadata_versions_are_files() {
    let mut table = TestTable::new().await;
    assert_eq!(table.version(), 1);

    let datafile = table.new_datafile(10, 100);
    table.append(vec![datafile]).await;
    assert_eq!(table.version(), 2);

    let metadata_dir = table.ident_path().child("metadata");
    let mut names = table.storage.list(Some(&metadata_dir))
        .await
        .unwrap()
        .into_iter()
        .filter_map(|meta| meta.location.filename().map(String::from))
        .collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec![
        "v0000000001.metadata.json".to_string(),
        "v0000000002.metadata.json".to_string(),
    ]);

    // The first version is still readable and has no snapshots.
    let first = table.store.load_version(&TestTable::ident(), 1).await.unwrap();
    assert!(first.current_snapshot().is_none());

    // A fresh handle over the same directory sees the latest version.
    let storage = Arc::new(TableStorage::from_url(
        &format!("file://{}", table.path.to_str().unwrap()),
        Default::default()
    ).unwrap());
    let reopened = Table::load(
        &TestTable::ident(),
        Arc::new(ObjectStoreMetadataStore::new(storage))
    ).await.unwrap();
    assert_eq!(reopened.version(), 2);
    assert_eq!(reopened.metadata(), table.metadata());
}

#[tokio::test]
async fn stale_append_is_rejected() {
    let mut table = TestTable::new().await;
    let mut other = Table::load(&TestTable::ident(), table.store.clone()).await.unwrap();

    let datafile = table.new_datafile(10, 100);
    table.append(vec![datafile]).await;

    // `other` still sees the empty table, so its append names the wrong head.
    let mut op = AppendFilesOperation::new(None, 0, 0);
    op.append_file(table.new_datafile(20, 200));
    let mut transaction = other.new_transaction();
    transaction.add_operation(Box::new(op));

    let result = transaction.commit().await;
    assert!(matches!(
        result,
        Err(TableError::Store(StoreError::ConcurrentModification { .. }))
    ));
    // The failed commit refreshed the handle.
    assert_eq!(other.version(), 2);
    assert_eq!(other.history().unwrap().len(), 1);
}

#[tokio::test]
async fn schema_evolution_is_persisted() {
    let mut table = TestTable::new().await;

    let schema_id = table.evolve_schema(vec![
        SchemaChange::drop_column("ts"),
        SchemaChange::add_column("city", SchemaType::Primitive(PrimitiveType::String)),
    ]).await.unwrap();
    assert_eq!(schema_id, 1);

    let reloaded = Table::load(&TestTable::ident(), table.store.clone()).await.unwrap();
    let schema = reloaded.current_schema().unwrap();
    assert_eq!(schema.get_field_by_name("city").unwrap().id(), 4);
    assert!(schema.get_field_by_name("ts").is_none());
    assert_eq!(reloaded.metadata().last_column_id, 4);
    assert_eq!(reloaded.metadata().schemas.len(), 2);
}
