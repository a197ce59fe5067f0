//! 출력 단위인 행 변경 레코드
//!
//! insert / update / delete / ddl / heartbeat 를 하나의 구조체와 payload 합 타입으로
//! 표현합니다. `position` 은 이 레코드 *다음*부터 재시작할 수 있는 위치입니다.

pub mod buffer;

pub use buffer::RowBuffer;

use crate::config::OutputConfig;
use crate::offset::Position;
use crate::schema::SchemaChange;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// 행 데이터 (테이블 컬럼 순서 유지)
pub type RowData = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowOperation {
    Insert,
    Update,
    Delete,
    Ddl,
    Heartbeat,
}

impl RowOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowOperation::Insert => "insert",
            RowOperation::Update => "update",
            RowOperation::Delete => "delete",
            RowOperation::Ddl => "ddl",
            RowOperation::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for RowOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 연산별 내용
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RowPayload {
    Insert { data: RowData },
    /// old_data 에는 값이 바뀐 컬럼만 들어감
    Update { data: RowData, old_data: RowData },
    Delete { data: RowData },
    Ddl { change: SchemaChange, sql: String },
    Heartbeat { heartbeat: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowEvent {
    pub database: String,
    pub table: Option<String>,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub pk_columns: Vec<String>,
    pub position: Position,
    #[serde(default)]
    pub xid: Option<u64>,
    #[serde(default)]
    pub xoffset: u64,
    #[serde(default)]
    pub tx_commit: bool,
    #[serde(default)]
    pub server_id: Option<u64>,
    #[serde(default)]
    pub thread_id: Option<u64>,
    #[serde(default)]
    pub schema_id: Option<u64>,
    #[serde(default)]
    pub row_query: Option<String>,
    pub payload: RowPayload,
}

impl RowEvent {
    pub fn new(
        payload: RowPayload,
        database: impl Into<String>,
        table: Option<String>,
        timestamp_ms: i64,
        position: Position,
    ) -> Self {
        RowEvent {
            database: database.into(),
            table,
            timestamp_ms,
            pk_columns: Vec::new(),
            position,
            xid: None,
            xoffset: 0,
            tx_commit: false,
            server_id: None,
            thread_id: None,
            schema_id: None,
            row_query: None,
            payload,
        }
    }

    pub fn insert(database: &str, table: &str, data: RowData, timestamp_ms: i64, position: Position) -> Self {
        RowEvent::new(
            RowPayload::Insert { data },
            database,
            Some(table.to_string()),
            timestamp_ms,
            position,
        )
    }

    pub fn update(
        database: &str,
        table: &str,
        data: RowData,
        old_data: RowData,
        timestamp_ms: i64,
        position: Position,
    ) -> Self {
        RowEvent::new(
            RowPayload::Update { data, old_data },
            database,
            Some(table.to_string()),
            timestamp_ms,
            position,
        )
    }

    pub fn delete(database: &str, table: &str, data: RowData, timestamp_ms: i64, position: Position) -> Self {
        RowEvent::new(
            RowPayload::Delete { data },
            database,
            Some(table.to_string()),
            timestamp_ms,
            position,
        )
    }

    pub fn ddl(change: SchemaChange, sql: impl Into<String>, timestamp_ms: i64, position: Position) -> Self {
        let database = change.database().to_string();
        let table = change.table().map(str::to_string);
        RowEvent::new(
            RowPayload::Ddl {
                change,
                sql: sql.into(),
            },
            database,
            table,
            timestamp_ms,
            position,
        )
    }

    /// 하트비트 마커. position.last_heartbeat 도 같은 값으로 맞춤
    pub fn heartbeat(database: impl Into<String>, heartbeat: i64, timestamp_ms: i64, position: &Position) -> Self {
        RowEvent::new(
            RowPayload::Heartbeat { heartbeat },
            database,
            None,
            timestamp_ms,
            position.with_heartbeat(heartbeat),
        )
    }

    pub fn with_pk_columns(mut self, pk_columns: Vec<String>) -> Self {
        self.pk_columns = pk_columns;
        self
    }

    pub fn operation(&self) -> RowOperation {
        match self.payload {
            RowPayload::Insert { .. } => RowOperation::Insert,
            RowPayload::Update { .. } => RowOperation::Update,
            RowPayload::Delete { .. } => RowOperation::Delete,
            RowPayload::Ddl { .. } => RowOperation::Ddl,
            RowPayload::Heartbeat { .. } => RowOperation::Heartbeat,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.payload, RowPayload::Heartbeat { .. })
    }

    pub fn is_ddl(&self) -> bool {
        matches!(self.payload, RowPayload::Ddl { .. })
    }

    pub fn data(&self) -> Option<&RowData> {
        match &self.payload {
            RowPayload::Insert { data } | RowPayload::Update { data, .. } | RowPayload::Delete { data } => {
                Some(data)
            }
            _ => None,
        }
    }

    pub fn old_data(&self) -> Option<&RowData> {
        match &self.payload {
            RowPayload::Update { old_data, .. } => Some(old_data),
            _ => None,
        }
    }

    /// 이 레코드를 넘긴 뒤 위치를 저장해도 되는지
    ///
    /// 트랜잭션 중간 행은 저장하면 재시작 시 트랜잭션 절반을 잃으므로 false.
    pub fn should_advance_position(&self) -> bool {
        self.tx_commit || self.is_ddl() || self.is_heartbeat()
    }

    /// 파티션 키용 PK JSON. PK 가 없으면 임의 UUID
    pub fn pk_to_json(&self) -> Value {
        let mut key = Map::new();
        key.insert("database".to_string(), json!(self.database));
        key.insert("table".to_string(), json!(self.table));

        match self.data() {
            Some(data) if !self.pk_columns.is_empty() => {
                for column in &self.pk_columns {
                    let value = data.get(column).cloned().unwrap_or(Value::Null);
                    key.insert(format!("pk.{}", column.to_lowercase()), value);
                }
            }
            _ => {
                key.insert("_uuid".to_string(), json!(uuid::Uuid::new_v4().to_string()));
            }
        }
        Value::Object(key)
    }

    /// sink 로 보낼 JSON
    pub fn to_json(&self, output: &OutputConfig) -> Value {
        let mut out = Map::new();
        out.insert("database".to_string(), json!(self.database));
        out.insert("table".to_string(), json!(self.table));

        match &self.payload {
            RowPayload::Ddl { change, sql } => {
                out.insert("type".to_string(), json!(change.kind()));
                out.insert("ts".to_string(), json!(self.timestamp_ms / 1000));
                out.insert("sql".to_string(), json!(sql));
                out.insert(
                    "def".to_string(),
                    serde_json::to_value(change).unwrap_or(Value::Null),
                );
                if output.include_position {
                    out.insert("position".to_string(), json!(self.position.to_string()));
                }
                if output.include_schema_id {
                    out.insert("schema_id".to_string(), json!(self.schema_id));
                }
                return Value::Object(out);
            }
            RowPayload::Heartbeat { heartbeat } => {
                out.insert("type".to_string(), json!("heartbeat"));
                out.insert("ts".to_string(), json!(self.timestamp_ms / 1000));
                out.insert("heartbeat".to_string(), json!(heartbeat));
                return Value::Object(out);
            }
            _ => {}
        }

        out.insert("type".to_string(), json!(self.operation().as_str()));
        out.insert("ts".to_string(), json!(self.timestamp_ms / 1000));

        if output.include_row_query {
            if let Some(query) = &self.row_query {
                out.insert("query".to_string(), json!(query));
            }
        }
        if output.include_xid {
            if let Some(xid) = self.xid {
                out.insert("xid".to_string(), json!(xid));
                out.insert("xoffset".to_string(), json!(self.xoffset));
            }
        }
        if output.include_commit_info && self.tx_commit {
            out.insert("commit".to_string(), json!(true));
        }
        if output.include_position {
            out.insert("position".to_string(), json!(self.position.to_string()));
        }
        if output.include_server_id {
            out.insert("server_id".to_string(), json!(self.server_id));
        }
        if output.include_thread_id {
            out.insert("thread_id".to_string(), json!(self.thread_id));
        }
        if output.include_schema_id {
            out.insert("schema_id".to_string(), json!(self.schema_id));
        }
        if output.include_primary_key {
            out.insert("primary_key_columns".to_string(), json!(self.pk_columns));
        }

        let strip_nulls = |data: &RowData| -> Value {
            if output.include_nulls {
                Value::Object(data.clone())
            } else {
                Value::Object(
                    data.iter()
                        .filter(|(_, v)| !v.is_null())
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
            }
        };

        if let Some(data) = self.data() {
            out.insert("data".to_string(), strip_nulls(data));
        }
        if let Some(old) = self.old_data() {
            // NULL 로 바뀐 것도 변경이므로 old 는 항상 전부 포함
            out.insert("old".to_string(), Value::Object(old.clone()));
        }
        Value::Object(out)
    }

    pub fn to_json_string(&self, output: &OutputConfig) -> String {
        self.to_json(output).to_string()
    }
}
