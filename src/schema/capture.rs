//! 원본 DB 의 현재 스키마 읽기 (부트스트랩/복구 전용)

use super::model::{CaseSensitivity, ColumnDef, Database, Schema, Table};
use crate::error::{CdcError, Result};
use crate::filter::Filter;
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::Pool;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// 스키마 캡처 기능
#[async_trait]
pub trait SchemaCapturer: Send + Sync {
    async fn capture(&self) -> Result<Schema>;
}

/// 캡처 대상에서 항상 빠지는 데이터베이스
const IGNORED_DATABASES: [&str; 2] = ["information_schema", "performance_schema"];

/// `enum('a','b''c')` → ["a", "b'c"]
pub fn parse_enum_values(column_type: &str) -> Vec<String> {
    let start = match column_type.find('(') {
        Some(i) => i + 1,
        None => return Vec::new(),
    };
    let end = column_type.rfind(')').unwrap_or(column_type.len());
    let body: Vec<char> = column_type[start..end.max(start)].chars().collect();

    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut i = 0;
    while i < body.len() {
        let c = body[i];
        if in_quote {
            if c == '\'' {
                if body.get(i + 1) == Some(&'\'') {
                    current.push('\'');
                    i += 1;
                } else {
                    in_quote = false;
                    values.push(std::mem::take(&mut current));
                }
            } else {
                current.push(c);
            }
        } else if c == '\'' {
            in_quote = true;
        }
        i += 1;
    }
    values
}

/// information_schema 기반 캡처
pub struct MysqlSchemaCapturer {
    pool: Pool,
    filter: Option<Arc<Filter>>,
}

type ColumnRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<u64>,
);

impl MysqlSchemaCapturer {
    pub fn new(pool: Pool, filter: Option<Arc<Filter>>) -> Self {
        MysqlSchemaCapturer { pool, filter }
    }

    fn skip_database(&self, name: &str) -> bool {
        IGNORED_DATABASES.contains(&name.to_lowercase().as_str())
            || self
                .filter
                .as_ref()
                .is_some_and(|f| f.is_database_blacklisted(name))
    }
}

#[async_trait]
impl SchemaCapturer for MysqlSchemaCapturer {
    async fn capture(&self) -> Result<Schema> {
        info!("Capturing schema from information_schema");
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

        let lower_case: Option<u8> = conn.query_first("SELECT @@lower_case_table_names").await?;
        let sensitivity = CaseSensitivity::from_lower_case_table_names(lower_case.unwrap_or(0));
        let charset: Option<String> = conn.query_first("SELECT @@character_set_server").await?;

        let db_rows: Vec<(String, String)> = conn
            .query(
                "SELECT SCHEMA_NAME, DEFAULT_CHARACTER_SET_NAME \
                 FROM information_schema.SCHEMATA ORDER BY SCHEMA_NAME",
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query databases: {}", e)))?;

        let mut databases: BTreeMap<String, Database> = BTreeMap::new();
        for (name, db_charset) in db_rows {
            if self.skip_database(&name) {
                continue;
            }
            databases.insert(name.clone(), Database::new(name, Some(db_charset)));
        }

        let table_rows: Vec<(String, String, Option<String>)> = conn
            .query(
                "SELECT t.TABLE_SCHEMA, t.TABLE_NAME, c.CHARACTER_SET_NAME \
                 FROM information_schema.TABLES t \
                 LEFT JOIN information_schema.COLLATION_CHARACTER_SET_APPLICABILITY c \
                   ON t.TABLE_COLLATION = c.COLLATION_NAME \
                 WHERE t.TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY t.TABLE_SCHEMA, t.TABLE_NAME",
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query tables: {}", e)))?;

        let mut tables: BTreeMap<(String, String), Table> = BTreeMap::new();
        for (db, name, table_charset) in table_rows {
            if !databases.contains_key(&db) {
                continue;
            }
            let mut table = Table::new(db.clone(), name.clone(), Vec::new());
            table.charset = table_charset;
            tables.insert((db, name), table);
        }

        let column_rows: Vec<ColumnRow> = conn
            .query(
                "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME, DATA_TYPE, CHARACTER_SET_NAME, \
                        COLUMN_TYPE, DATETIME_PRECISION \
                 FROM information_schema.COLUMNS \
                 ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION",
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query columns: {}", e)))?;

        for (db, table_name, column, data_type, column_charset, column_type, precision) in column_rows {
            let Some(table) = tables.get_mut(&(db, table_name)) else {
                continue;
            };
            let mut def = ColumnDef::new(column, data_type);
            def.charset = column_charset;
            def.signed = !column_type.to_lowercase().contains("unsigned");
            if def.column_type == "enum" || def.column_type == "set" {
                def.enum_values = Some(parse_enum_values(&column_type));
            }
            if matches!(def.column_type.as_str(), "datetime" | "timestamp" | "time") {
                def.column_length = precision;
            }
            def.position = table.columns.len();
            table.columns.push(def);
        }

        let pk_rows: Vec<(String, String, String)> = conn
            .query(
                "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME \
                 FROM information_schema.KEY_COLUMN_USAGE \
                 WHERE CONSTRAINT_NAME = 'PRIMARY' \
                 ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION",
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query primary keys: {}", e)))?;

        for (db, table_name, column) in pk_rows {
            if let Some(table) = tables.get_mut(&(db, table_name)) {
                table.pk_columns.push(column);
            }
        }

        for ((db, _), table) in tables {
            if let Some(database) = databases.get_mut(&db) {
                database.tables.push(table);
            }
        }

        let schema = Schema::new(
            databases.into_values().collect(),
            charset.unwrap_or_else(|| "utf8mb4".to_string()),
            sensitivity,
        );
        debug!(
            "Captured {} databases, {} tables",
            schema.databases.len(),
            schema.table_count()
        );
        Ok(schema)
    }
}

/// 고정된 (또는 테스트에서 바꿔 끼우는) 스키마를 돌려주는 캡처
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaCapturer {
    schema: Arc<Mutex<Schema>>,
}

impl StaticSchemaCapturer {
    pub fn new(schema: Schema) -> Self {
        StaticSchemaCapturer {
            schema: Arc::new(Mutex::new(schema)),
        }
    }

    /// "라이브" 스키마 교체
    pub fn set(&self, schema: Schema) {
        *self.schema.lock() = schema;
    }
}

#[async_trait]
impl SchemaCapturer for StaticSchemaCapturer {
    async fn capture(&self) -> Result<Schema> {
        Ok(self.schema.lock().clone())
    }
}
