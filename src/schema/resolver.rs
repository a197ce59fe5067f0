//! DDL 해석기 경계
//!
//! SQL 문법 파싱은 외부 구성요소가 담당합니다. 엔진은 `DdlResolver` 가 돌려준
//! 구조화된 변경만 적용합니다.

use super::change::SchemaChange;
use super::model::Schema;
use crate::error::{CdcError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// SQL 텍스트 → 스키마 변경 목록
pub trait DdlResolver: Send + Sync {
    /// 스키마와 무관한 문장은 빈 목록을 돌려줌
    fn resolve(&self, sql: &str, database: &str, schema: &Schema) -> Result<Vec<SchemaChange>>;
}

const DDL_PATTERN: &str =
    r"(?is)^\s*(/\*.*?\*/\s*)*(CREATE|ALTER|DROP|RENAME)\s+(TEMPORARY\s+)?(TABLE|DATABASE|SCHEMA)\b";

fn ddl_regex() -> Option<&'static Regex> {
    static DDL: OnceLock<Option<Regex>> = OnceLock::new();
    DDL.get_or_init(|| Regex::new(DDL_PATTERN).ok()).as_ref()
}

fn create_table_regex() -> Option<&'static Regex> {
    static CREATE: OnceLock<Option<Regex>> = OnceLock::new();
    CREATE
        .get_or_init(|| Regex::new(r"(?i)^\s*CREATE\s+TABLE\b").ok())
        .as_ref()
}

/// 스키마를 바꿀 수 있는 문장인지
pub fn is_schema_ddl(sql: &str) -> bool {
    ddl_regex().is_some_and(|re| re.is_match(sql)) && !is_temporary_table_ddl(sql)
}

/// 트랜잭션 안에서도 DDL 로 처리해야 하는 CREATE TABLE
pub fn is_create_table(sql: &str) -> bool {
    create_table_regex().is_some_and(|re| re.is_match(sql))
}

/// 임시 테이블은 binlog 행 이벤트를 만들지 않으므로 추적하지 않음
pub fn is_temporary_table_ddl(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    upper.starts_with("CREATE TEMPORARY TABLE") || upper.starts_with("DROP TEMPORARY TABLE")
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 미리 등록한 SQL → 변경 매핑 (리플레이 및 테스트용)
#[derive(Debug, Clone, Default)]
pub struct StaticDdlResolver {
    changes: HashMap<String, Vec<SchemaChange>>,
}

impl StaticDdlResolver {
    pub fn new() -> Self {
        StaticDdlResolver::default()
    }

    pub fn register(mut self, sql: &str, changes: Vec<SchemaChange>) -> Self {
        self.changes.insert(normalize_sql(sql), changes);
        self
    }

    /// `{ "<sql>": [<change>, ...], ... }` 형식 JSON 파일
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let raw: HashMap<String, Vec<SchemaChange>> = serde_json::from_str(&text)?;
        Ok(StaticDdlResolver {
            changes: raw
                .into_iter()
                .map(|(sql, changes)| (normalize_sql(&sql), changes))
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl DdlResolver for StaticDdlResolver {
    fn resolve(&self, sql: &str, _database: &str, _schema: &Schema) -> Result<Vec<SchemaChange>> {
        if let Some(changes) = self.changes.get(&normalize_sql(sql)) {
            return Ok(changes.clone());
        }
        if is_schema_ddl(sql) {
            return Err(CdcError::InvalidSchema(format!("Unable to resolve DDL: {}", sql)));
        }
        Ok(Vec::new())
    }
}
