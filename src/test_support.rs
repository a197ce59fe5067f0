//! 테스트용 이벤트 스트림/스키마 빌더

use crate::events::{
    BinlogEvent, BinlogEventData, CellValue, DeleteRowsData, GtidEventData, QueryEventData,
    RotateEventData, TableMapData, UpdateRowsData, WriteRowsData, XidEventData,
};
use crate::filter::Filter;
use crate::heartbeat::heartbeat_table;
use crate::offset::{BinlogPosition, BINLOG_START_OFFSET};
use crate::schema::{
    CaseSensitivity, ColumnDef, Database, DdlResolver, MemorySchemaRepository, Schema,
    SchemaStore, SchemaStoreConfig, StaticSchemaCapturer, Table,
};
use crate::source::VecEventSource;
use std::sync::Arc;

pub(crate) const FILE: &str = "mysql-bin.000001";
pub(crate) const META_DB: &str = "cdc_meta";
pub(crate) const SERVER_ID: u64 = 1;

const EVENT_LEN: u64 = 50;

/// 순서대로 오프셋을 매기며 이벤트를 쌓는 빌더
#[derive(Debug, Clone)]
pub(crate) struct EventScript {
    file: String,
    offset: u64,
    timestamp: u32,
    server_id: u32,
    events: Vec<BinlogEvent>,
}

impl EventScript {
    pub fn new(file: &str) -> Self {
        EventScript::starting_at(file, BINLOG_START_OFFSET)
    }

    pub fn starting_at(file: &str, offset: u64) -> Self {
        EventScript {
            file: file.to_string(),
            offset,
            timestamp: 1_700_000_000,
            server_id: SERVER_ID as u32,
            events: Vec::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn push(mut self, data: BinlogEventData) -> Self {
        let mut event = BinlogEvent::new(
            self.timestamp,
            BinlogPosition::new(self.file.clone(), self.offset),
            BinlogPosition::new(self.file.clone(), self.offset + EVENT_LEN),
            data,
        );
        event.header.server_id = self.server_id;
        self.offset += EVENT_LEN;
        self.timestamp += 1;
        self.events.push(event);
        self
    }

    pub fn query(self, database: &str, sql: &str) -> Self {
        self.push(BinlogEventData::Query(QueryEventData {
            thread_id: 7,
            exec_time: 0,
            database: database.to_string(),
            query: sql.to_string(),
        }))
    }

    pub fn begin(self) -> Self {
        self.query("", "BEGIN")
    }

    pub fn commit(self, xid: u64) -> Self {
        self.push(BinlogEventData::Xid(XidEventData { xid }))
    }

    pub fn gtid(self, gtid: &str) -> Self {
        self.push(BinlogEventData::Gtid(GtidEventData {
            gtid: gtid.to_string(),
        }))
    }

    pub fn table_map(self, table_id: u64, database: &str, table: &str) -> Self {
        self.push(BinlogEventData::TableMap(TableMapData {
            table_id,
            database: database.to_string(),
            table: table.to_string(),
            column_types: Vec::new(),
        }))
    }

    pub fn insert(self, table_id: u64, rows: Vec<Vec<CellValue>>) -> Self {
        self.push(BinlogEventData::WriteRows(WriteRowsData {
            table_id,
            columns_present: Vec::new(),
            rows,
        }))
    }

    pub fn update(self, table_id: u64, rows: Vec<(Vec<CellValue>, Vec<CellValue>)>) -> Self {
        self.push(BinlogEventData::UpdateRows(UpdateRowsData {
            table_id,
            columns_present: Vec::new(),
            columns_changed: Vec::new(),
            rows,
        }))
    }

    pub fn delete(self, table_id: u64, rows: Vec<Vec<CellValue>>) -> Self {
        self.push(BinlogEventData::DeleteRows(DeleteRowsData {
            table_id,
            columns_present: Vec::new(),
            rows,
        }))
    }

    pub fn rows_query(self, sql: &str) -> Self {
        self.push(BinlogEventData::RowsQuery(sql.to_string()))
    }

    pub fn rotate(mut self, next_file: &str) -> Self {
        self = self.push(BinlogEventData::Rotate(RotateEventData {
            next_binlog_name: next_file.to_string(),
            position: BINLOG_START_OFFSET,
        }));
        self.file = next_file.to_string();
        self.offset = BINLOG_START_OFFSET;
        self
    }

    /// 한 행짜리 heartbeats 트랜잭션
    pub fn heartbeat(self, table_id: u64, client_id: &str, value: i64) -> Self {
        self.begin()
            .table_map(table_id, META_DB, "heartbeats")
            .insert(
                table_id,
                vec![vec![
                    CellValue::UInt64(SERVER_ID),
                    CellValue::String(client_id.to_string()),
                    CellValue::Int64(value),
                ]],
            )
            .commit(value as u64)
    }

    /// `(id, v)` 한 행을 넣는 트랜잭션
    pub fn insert_tx(self, table_id: u64, database: &str, table: &str, id: i32, v: &str, xid: u64) -> Self {
        self.begin()
            .table_map(table_id, database, table)
            .insert(table_id, vec![row(id, v)])
            .commit(xid)
    }

    pub fn events(&self) -> Vec<BinlogEvent> {
        self.events.clone()
    }

    pub fn into_events(self) -> Vec<BinlogEvent> {
        self.events
    }

    pub fn into_source(self) -> VecEventSource {
        VecEventSource::new(self.events)
    }
}

pub(crate) fn row(id: i32, v: &str) -> Vec<CellValue> {
    vec![CellValue::Int32(id), CellValue::String(v.to_string())]
}

/// `db.table (id int PK, v varchar)`
pub(crate) fn simple_table(database: &str, table: &str) -> Table {
    Table::new(
        database,
        table,
        vec![
            ColumnDef::new("id", "int"),
            ColumnDef::new("v", "varchar").with_charset("utf8mb4"),
        ],
    )
    .with_pk(["id"])
}

/// 테이블들을 데이터베이스별로 묶은 스키마 (메타 DB 의 heartbeats 포함)
pub(crate) fn schema_with(tables: Vec<Table>) -> Schema {
    let mut databases: Vec<Database> = Vec::new();
    for table in tables.into_iter().chain(std::iter::once(heartbeat_table(META_DB))) {
        match databases.iter_mut().find(|d| d.name == table.database) {
            Some(db) => db.tables.push(table),
            None => {
                let mut db = Database::new(table.database.clone(), Some("utf8mb4".to_string()));
                db.tables.push(table);
                databases.push(db);
            }
        }
    }
    Schema::new(databases, "utf8mb4", CaseSensitivity::CaseSensitive)
}

/// 메모리 저장소 + 고정 캡처로 만든 스키마 저장소
pub(crate) fn schema_store(
    live: Schema,
    resolver: impl DdlResolver + 'static,
    filter: Option<Arc<Filter>>,
) -> (SchemaStore, MemorySchemaRepository) {
    let repository = MemorySchemaRepository::new();
    let store = SchemaStore::new(
        SERVER_ID,
        Arc::new(repository.clone()),
        Arc::new(StaticSchemaCapturer::new(live)),
        Arc::new(resolver),
        filter,
        SchemaStoreConfig::default(),
    );
    (store, repository)
}
