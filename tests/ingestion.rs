//! End to end ingestion of evolving batches.
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use evolake::{Table, TableError, TableIdent, TableResult, Warehouse};
use evolake::value::Value;
use evolake::schema::{Schema, SchemaType, Field, PrimitiveType, SchemaChange};
use evolake::partition::{PartitionSpecChange, PartitionTransform};
use evolake::datafile::DataFile;
use evolake::snapshot::SnapshotRef;
use evolake::storage::TableStorage;
use evolake::store::{MetadataStore, MemoryMetadataStore};
use evolake::writer::{FileWriter, JsonFileWriter, WriteTask};
use evolake::reconcile::{Batch, BatchField};
use evolake::ingest::{
    EvolutionPolicy, IngestConfig, IngestReport, IngestionCoordinator, IngestionError
};

/// Something another writer does to the table while a batch is being written.
enum Interference {
    EvolveSchema(Vec<SchemaChange>),
    Ingest(Batch),
}

/// A file writer that lets another writer commit between writing the files of
/// a batch and committing them.
struct InterferingWriter {
    inner: Arc<JsonFileWriter>,
    store: Arc<dyn MetadataStore>,
    ident: TableIdent,
    interference: Mutex<Option<Interference>>,
    written: Mutex<Vec<DataFile>>,
}

impl InterferingWriter {
    fn interfere(&self, interference: Interference) {
        *self.interference.lock() = Some(interference);
    }
}

#[async_trait]
impl FileWriter for InterferingWriter {
    async fn write(&self, task: WriteTask<'_>) -> TableResult<DataFile> {
        let file = self.inner.write(task).await?;
        self.written.lock().push(file.clone());

        let interference = self.interference.lock().take();
        match interference {
            Some(Interference::EvolveSchema(changes)) => {
                let mut table = Table::load(&self.ident, self.store.clone()).await?;
                table.evolve_schema(changes).await?;
            },
            Some(Interference::Ingest(batch)) => {
                IngestionCoordinator::new(self.store.clone(), self.inner.clone())
                    .ingest(&self.ident, &batch, EvolutionPolicy::Strict)
                    .await?;
            },
            None => {}
        }

        Ok(file)
    }

    async fn read(&self, file: &DataFile, schema: &Schema) -> TableResult<Vec<Vec<Option<Value>>>> {
        self.inner.read(file, schema).await
    }

    async fn delete(&self, file: &DataFile) -> TableResult<()> {
        self.inner.delete(file).await
    }
}

struct TestWarehouse {
    warehouse: Warehouse,
    writer: Arc<InterferingWriter>,
    ident: TableIdent,
}

impl TestWarehouse {
    fn schema() -> Schema {
        Schema::new(0, vec![
            Field::new_primitive(1, "name", true, PrimitiveType::String),
            Field::new_primitive(2, "age", false, PrimitiveType::Int),
        ])
    }

    async fn new() -> Self {
        let storage = Arc::new(TableStorage::in_memory());
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let ident = TableIdent::parse("db.individual").unwrap();

        let writer = Arc::new(InterferingWriter {
            inner: Arc::new(JsonFileWriter::new(storage.clone())),
            store: store.clone(),
            ident: ident.clone(),
            interference: Mutex::new(None),
            written: Mutex::new(Vec::new()),
        });

        let config = IngestConfig {
            base_delay_ms: 1,
            max_delay_ms: 10,
            ..Default::default()
        };
        let warehouse = Warehouse::new(storage, store, writer.clone(), Some(config));
        warehouse.create_table(&ident, Self::schema(), Vec::new()).await.unwrap();

        Self { warehouse, writer, ident }
    }

    async fn ingest(&self, batch: Batch, policy: EvolutionPolicy) -> TableResult<IngestReport> {
        self.warehouse.ingest(&self.ident, batch, policy).await
    }

    async fn rows(&self, snapshot_ref: SnapshotRef) -> Vec<Vec<Option<Value>>> {
        let scan = self.warehouse.read_as_of(&self.ident, snapshot_ref).await.unwrap();
        self.warehouse.read_rows(&scan).await.unwrap()
    }

    async fn table(&self) -> Table {
        self.warehouse.load_table(&self.ident).await.unwrap()
    }
}

fn string(value: &str) -> Option<Value> {
    Some(Value::String(value.to_string()))
}

fn int(value: i32) -> Option<Value> {
    Some(Value::Int(value))
}

fn name_age(rows: &[(&str, i32)]) -> Batch {
    Batch::new(
        vec![
            BatchField::primitive("name", PrimitiveType::String),
            BatchField::primitive("age", PrimitiveType::Int),
        ],
        rows.iter().map(|(name, age)| vec![string(name), int(*age)]).collect()
    )
}

fn ingestion_error(result: TableResult<IngestReport>) -> IngestionError {
    match result {
        Err(TableError::Ingestion(e)) => e,
        other => panic!("expected an ingestion error, got {:?}", other),
    }
}

#[tokio::test]
async fn snapshots_accumulate() {
    let wh = TestWarehouse::new().await;

    let first = wh.ingest(name_age(&[("Alice", 30), ("Bob", 40)]), EvolutionPolicy::Strict)
        .await
        .unwrap();
    assert_eq!(first.attempts, 1);
    assert_eq!(first.record_count(), 2);
    assert!(first.schema_changes.is_empty());

    let second = wh.ingest(
        name_age(&[("Carol", 50), ("Dave", 60), ("Eve", 70)]),
        EvolutionPolicy::Strict
    ).await.unwrap();

    let scan = wh.warehouse.read_as_of(&wh.ident, SnapshotRef::Id(first.snapshot_id)).await.unwrap();
    assert_eq!(scan.record_count(), 2);
    let scan = wh.warehouse.read_as_of(&wh.ident, SnapshotRef::Latest).await.unwrap();
    assert_eq!(scan.record_count(), 5);
    assert_eq!(scan.snapshot().unwrap().snapshot_id, second.snapshot_id);
    assert_eq!(scan.snapshot().unwrap().parent_snapshot_id, Some(first.snapshot_id));

    let history = wh.warehouse.history(&wh.ident).await.unwrap();
    let sequence = history.iter().map(|s| s.sequence_number).collect::<Vec<_>>();
    assert_eq!(sequence, vec![2, 1]);
}

#[tokio::test]
async fn column_order_is_irrelevant() {
    let wh = TestWarehouse::new().await;

    wh.ingest(name_age(&[("Alice", 30)]), EvolutionPolicy::Strict).await.unwrap();
    let reordered = Batch::new(
        vec![
            BatchField::primitive("age", PrimitiveType::Int),
            BatchField::primitive("name", PrimitiveType::String),
        ],
        vec![vec![int(30), string("Alice")]]
    );
    wh.ingest(reordered, EvolutionPolicy::Strict).await.unwrap();

    let rows = wh.rows(SnapshotRef::Latest).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], rows[1]);
    assert_eq!(rows[0], vec![string("Alice"), int(30)]);
}

#[tokio::test]
async fn missing_required_column() {
    let wh = TestWarehouse::new().await;
    let ages = || Batch::new(
        vec![BatchField::primitive("age", PrimitiveType::Int)],
        vec![vec![int(30)], vec![int(41)]]
    );

    let error = ingestion_error(wh.ingest(ages(), EvolutionPolicy::AddColumns).await);
    assert_eq!(error, IngestionError::MissingRequiredColumn { name: "name".to_string() });
    assert!(wh.table().await.current_head().is_none());

    wh.warehouse.evolve_schema(&wh.ident, vec![SchemaChange::make_optional("name")])
        .await
        .unwrap();
    wh.ingest(ages(), EvolutionPolicy::Strict).await.unwrap();

    let rows = wh.rows(SnapshotRef::Latest).await;
    assert_eq!(rows, vec![vec![None, int(30)], vec![None, int(41)]]);
}

#[tokio::test]
async fn new_columns_follow_the_policy() {
    let wh = TestWarehouse::new().await;
    let with_city = || Batch::new(
        vec![
            BatchField::primitive("name", PrimitiveType::String),
            BatchField::primitive("city", PrimitiveType::String),
        ],
        vec![vec![string("Alice"), string("Paris")]]
    );

    let error = ingestion_error(wh.ingest(with_city(), EvolutionPolicy::Strict).await);
    assert!(matches!(
        error,
        IngestionError::SchemaEvolutionRequired { ref columns, .. } if columns == &["city"]
    ));
    assert_eq!(wh.table().await.metadata().current_schema_id, 0);

    let report = wh.ingest(with_city(), EvolutionPolicy::AddColumns).await.unwrap();
    assert_eq!(report.schema_changes, vec![
        SchemaChange::add_column("city", SchemaType::Primitive(PrimitiveType::String))
    ]);

    let table = wh.table().await;
    let schema = table.current_schema().unwrap();
    assert_eq!(schema.id(), 1);
    assert_eq!(schema.get_field_by_name("city").unwrap().id(), 3);
    assert!(!schema.get_field_by_name("city").unwrap().required());
    assert_eq!(table.current_head().unwrap().schema_id, 1);

    let rows = wh.rows(SnapshotRef::Latest).await;
    assert_eq!(rows, vec![vec![string("Alice"), None, string("Paris")]]);
}

#[tokio::test]
async fn dropped_ids_are_never_reused() {
    let wh = TestWarehouse::new().await;
    let first = wh.ingest(name_age(&[("Alice", 30)]), EvolutionPolicy::Strict).await.unwrap();

    wh.warehouse.evolve_schema(&wh.ident, vec![SchemaChange::drop_column("age")])
        .await
        .unwrap();
    wh.warehouse.evolve_schema(&wh.ident, vec![
        SchemaChange::add_column("age", SchemaType::Primitive(PrimitiveType::Long))
    ]).await.unwrap();

    let table = wh.table().await;
    let age = table.current_schema().unwrap().get_field_by_name("age").unwrap();
    assert_eq!(age.id(), 3);
    assert_eq!(table.metadata().last_column_id, 3);

    // The historical snapshot still resolves field 2 to its original type.
    let scan = wh.warehouse.read_as_of(&wh.ident, SnapshotRef::Id(first.snapshot_id))
        .await
        .unwrap();
    let old_age = scan.schema().get_field_by_id(2).unwrap();
    assert_eq!(old_age.name(), "age");
    assert_eq!(old_age.schema_type(), &SchemaType::Primitive(PrimitiveType::Int));
    assert_eq!(wh.warehouse.read_rows(&scan).await.unwrap(), vec![vec![string("Alice"), int(30)]]);

    // Under the current schema the old values belong to a different column.
    let batch = Batch::new(
        vec![
            BatchField::primitive("name", PrimitiveType::String),
            BatchField::primitive("age", PrimitiveType::Int),
        ],
        vec![vec![string("Bob"), int(40)]]
    );
    wh.ingest(batch, EvolutionPolicy::Strict).await.unwrap();
    let rows = wh.rows(SnapshotRef::Latest).await;
    assert_eq!(rows, vec![
        vec![string("Alice"), None],
        vec![string("Bob"), Some(Value::Long(40))],
    ]);
}

#[tokio::test]
async fn concurrent_append_is_rebased() {
    let wh = TestWarehouse::new().await;
    let head = wh.ingest(name_age(&[("Alice", 30)]), EvolutionPolicy::Strict).await.unwrap();

    wh.writer.interfere(Interference::Ingest(name_age(&[("Bob", 40), ("Carol", 50)])));
    let report = wh.ingest(name_age(&[("Dave", 60)]), EvolutionPolicy::Strict).await.unwrap();
    assert_eq!(report.attempts, 2);

    let history = wh.warehouse.history(&wh.ident).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].snapshot_id, report.snapshot_id);
    assert_eq!(history[0].sequence_number, 3);
    assert_eq!(history[1].sequence_number, 2);
    assert_eq!(history[1].parent_snapshot_id, Some(head.snapshot_id));
    assert_eq!(history[0].parent_snapshot_id, Some(history[1].snapshot_id));
    assert_eq!(history[0].record_count(), 4);
}

#[tokio::test]
async fn concurrent_ingestions_both_commit() {
    let wh = TestWarehouse::new().await;

    let (left, right) = tokio::join!(
        wh.ingest(name_age(&[("Alice", 30), ("Bob", 40)]), EvolutionPolicy::Strict),
        wh.ingest(name_age(&[("Carol", 50)]), EvolutionPolicy::Strict)
    );
    let (left, right) = (left.unwrap(), right.unwrap());
    assert_ne!(left.snapshot_id, right.snapshot_id);

    let history = wh.warehouse.history(&wh.ident).await.unwrap();
    let sequence = history.iter().map(|s| s.sequence_number).collect::<Vec<_>>();
    assert_eq!(sequence, vec![2, 1]);
    assert_eq!(history[0].record_count(), 3);
}

#[tokio::test]
async fn compatible_schema_change_keeps_written_files() {
    let wh = TestWarehouse::new().await;

    wh.writer.interfere(Interference::EvolveSchema(vec![
        SchemaChange::add_column("zip", SchemaType::Primitive(PrimitiveType::String))
    ]));
    let report = wh.ingest(name_age(&[("Alice", 30)]), EvolutionPolicy::Strict).await.unwrap();
    assert_eq!(report.attempts, 2);

    let table = wh.table().await;
    assert_eq!(table.current_head().unwrap().schema_id, 1);

    let rows = wh.rows(SnapshotRef::Latest).await;
    assert_eq!(rows, vec![vec![string("Alice"), int(30), None]]);
}

#[tokio::test]
async fn stale_reconciliation_aborts() {
    let wh = TestWarehouse::new().await;

    wh.writer.interfere(Interference::EvolveSchema(vec![
        SchemaChange::rename_column("age", "years")
    ]));
    let error = ingestion_error(
        wh.ingest(name_age(&[("Alice", 30)]), EvolutionPolicy::Strict).await
    );
    assert!(matches!(error, IngestionError::StaleReconciliation { .. }));

    // Nothing was committed and the written file is gone.
    let table = wh.table().await;
    assert!(table.current_head().is_none());
    assert_eq!(table.metadata().current_schema_id, 1);

    let written = wh.writer.written.lock().clone();
    assert_eq!(written.len(), 1);
    assert!(wh.writer.read(&written[0], &TestWarehouse::schema()).await.is_err());
}

#[tokio::test]
async fn invalid_rows_abort_before_writing() {
    let wh = TestWarehouse::new().await;
    let batch = Batch::new(
        vec![
            BatchField::primitive("name", PrimitiveType::String),
            BatchField::primitive("age", PrimitiveType::Int),
        ],
        vec![vec![string("Alice"), int(30)], vec![None, int(40)]]
    );

    let error = ingestion_error(wh.ingest(batch, EvolutionPolicy::Strict).await);
    assert_eq!(error, IngestionError::NullInRequiredColumn { name: "name".to_string(), row: 1 });
    assert!(wh.writer.written.lock().is_empty());
}

#[tokio::test]
async fn invalid_rows_leave_the_schema_unchanged() {
    let wh = TestWarehouse::new().await;
    let batch = Batch::new(
        vec![
            BatchField::primitive("name", PrimitiveType::String),
            BatchField::primitive("city", PrimitiveType::String),
        ],
        vec![vec![None, string("Paris")]]
    );

    let error = ingestion_error(wh.ingest(batch, EvolutionPolicy::AddColumns).await);
    assert_eq!(error, IngestionError::NullInRequiredColumn { name: "name".to_string(), row: 0 });

    let table = wh.table().await;
    assert_eq!(table.metadata().current_schema_id, 0);
    assert_eq!(table.metadata().last_column_id, 2);
    assert!(table.current_schema().unwrap().get_field_by_name("city").is_none());
    assert!(table.current_head().is_none());
    assert!(wh.writer.written.lock().is_empty());
}

#[tokio::test]
async fn empty_batch_commits_empty_snapshot() {
    let wh = TestWarehouse::new().await;

    let report = wh.ingest(name_age(&[]), EvolutionPolicy::Strict).await.unwrap();
    assert!(report.data_files.is_empty());

    let scan = wh.warehouse.read_as_of(&wh.ident, SnapshotRef::Latest).await.unwrap();
    assert_eq!(scan.snapshot().unwrap().snapshot_id, report.snapshot_id);
    assert_eq!(scan.record_count(), 0);
}

#[tokio::test]
async fn partition_evolution() {
    let wh = TestWarehouse::new().await;
    let first = wh.ingest(name_age(&[("Alice", 30)]), EvolutionPolicy::Strict).await.unwrap();
    assert_eq!(first.data_files[0].spec_id, 0);

    let spec_id = wh.warehouse.evolve_partition_spec(&wh.ident, vec![
        PartitionSpecChange::add_field("name", PartitionTransform::Identity)
    ]).await.unwrap();
    assert_eq!(spec_id, 1);

    let second = wh.ingest(name_age(&[("Bob", 40), ("Carol", 50), ("Bob", 41)]), EvolutionPolicy::Strict)
        .await
        .unwrap();
    assert_eq!(second.data_files.len(), 2);
    assert!(second.data_files[0].file_path.contains("/name=Bob/"));
    assert_eq!(second.data_files[0].record_count, 2);
    assert!(second.data_files[1].file_path.contains("/name=Carol/"));
    assert!(second.data_files.iter().all(|file| file.spec_id == 1));

    let scan = wh.warehouse.read_as_of(&wh.ident, SnapshotRef::Latest).await.unwrap();
    assert_eq!(scan.partition_spec().spec_id(), 1);
    assert_eq!(scan.partition_spec().fields()[0].field_id, 1000);
    assert_eq!(scan.files().len(), 3);
    assert_eq!(scan.files()[0].spec_id, 0);

    // Files written before the evolution keep the spec they were written with.
    let scan = wh.warehouse.read_as_of(&wh.ident, SnapshotRef::Id(first.snapshot_id)).await.unwrap();
    assert!(scan.partition_spec().is_unpartitioned());

    // Dropping the source column leaves the spec in place with null values.
    wh.warehouse.evolve_schema(&wh.ident, vec![
        SchemaChange::drop_column("name"),
    ]).await.unwrap();
    let ages = Batch::new(
        vec![BatchField::primitive("age", PrimitiveType::Int)],
        vec![vec![int(60)]]
    );
    let third = wh.ingest(ages, EvolutionPolicy::Strict).await.unwrap();
    assert!(third.data_files[0].file_path.contains("/name=null/"));
}
