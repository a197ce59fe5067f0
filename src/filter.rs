//! 데이터베이스/테이블/컬럼 값 필터
//!
//! - include / exclude: 행 출력만 막음 (스키마 추적은 계속)
//! - blacklist: 행 출력, DDL 출력, 스키마 반영까지 모두 건너뜀
//! - 시스템 블랙리스트 (RDS/HA 헬스체크 테이블)는 항상 적용
//!
//! 패턴은 리터럴, `*`/`?` glob, `/정규식/` 세 가지를 받습니다.

use crate::error::{CdcError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 필터 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub include_databases: Vec<String>,
    #[serde(default)]
    pub exclude_databases: Vec<String>,
    /// `table` 또는 `db.table`
    #[serde(default)]
    pub include_tables: Vec<String>,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
    /// `db` 또는 `db.table`
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// `db.table.column=value` 또는 `column=value`
    #[serde(default)]
    pub include_column_values: Vec<String>,
}

#[derive(Debug, Clone)]
struct Pattern {
    regex: Regex,
}

impl Pattern {
    fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let source = if text.len() >= 2 && text.starts_with('/') && text.ends_with('/') {
            text[1..text.len() - 1].to_string()
        } else {
            let escaped = regex::escape(text);
            format!("^{}$", escaped.replace(r"\*", ".*").replace(r"\?", "."))
        };
        let regex = Regex::new(&source)
            .map_err(|e| CdcError::Config(format!("Invalid filter pattern {}: {}", text, e)))?;
        Ok(Pattern { regex })
    }

    fn matches(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

/// `db.table` 형태 규칙 (table 이 없으면 db 전체)
#[derive(Debug, Clone)]
struct TableRule {
    database: Option<Pattern>,
    table: Option<Pattern>,
}

impl TableRule {
    /// bare_is_table: 점 없는 항목을 테이블로 볼지 데이터베이스로 볼지
    fn parse(text: &str, bare_is_table: bool) -> Result<Self> {
        let text = text.trim();
        let is_regex = text.starts_with('/') && text.ends_with('/') && text.len() >= 2;
        match text.split_once('.') {
            Some((db, table)) if !is_regex => Ok(TableRule {
                database: Some(Pattern::parse(db)?),
                table: Some(Pattern::parse(table)?),
            }),
            _ if bare_is_table => Ok(TableRule {
                database: None,
                table: Some(Pattern::parse(text)?),
            }),
            _ => Ok(TableRule {
                database: Some(Pattern::parse(text)?),
                table: None,
            }),
        }
    }

    fn matches(&self, database: &str, table: &str) -> bool {
        self.database.as_ref().map_or(true, |p| p.matches(database))
            && self.table.as_ref().map_or(true, |p| p.matches(table))
    }

    fn covers_database(&self, database: &str) -> bool {
        let whole_db = match &self.table {
            None => true,
            Some(p) => p.regex.as_str() == "^.*$",
        };
        whole_db && self.database.as_ref().map_or(false, |p| p.matches(database))
    }
}

#[derive(Debug, Clone)]
struct ColumnValueRule {
    table: Option<TableRule>,
    column: String,
    value: String,
}

impl ColumnValueRule {
    fn parse(text: &str) -> Result<Self> {
        let (target, value) = text
            .split_once('=')
            .ok_or_else(|| CdcError::Config(format!("Invalid column filter: {}", text)))?;
        let parts: Vec<&str> = target.trim().split('.').collect();
        let (table, column) = match parts.as_slice() {
            [column] => (None, column.to_string()),
            [db, table, column] => (
                Some(TableRule {
                    database: Some(Pattern::parse(db)?),
                    table: Some(Pattern::parse(table)?),
                }),
                column.to_string(),
            ),
            _ => return Err(CdcError::Config(format!("Invalid column filter: {}", text))),
        };
        Ok(ColumnValueRule {
            table,
            column,
            value: value.trim().to_string(),
        })
    }
}

/// 컴파일된 필터
#[derive(Debug, Clone, Default)]
pub struct Filter {
    include_databases: Vec<Pattern>,
    exclude_databases: Vec<Pattern>,
    include_tables: Vec<TableRule>,
    exclude_tables: Vec<TableRule>,
    blacklist: Vec<TableRule>,
    column_values: Vec<ColumnValueRule>,
}

impl Filter {
    pub fn new(config: &FilterConfig) -> Result<Self> {
        let patterns = |items: &[String]| -> Result<Vec<Pattern>> {
            items.iter().map(|s| Pattern::parse(s)).collect()
        };
        let rules = |items: &[String], bare_is_table: bool| -> Result<Vec<TableRule>> {
            items.iter().map(|s| TableRule::parse(s, bare_is_table)).collect()
        };

        Ok(Filter {
            include_databases: patterns(&config.include_databases)?,
            exclude_databases: patterns(&config.exclude_databases)?,
            include_tables: rules(&config.include_tables, true)?,
            exclude_tables: rules(&config.exclude_tables, true)?,
            blacklist: rules(&config.blacklist, false)?,
            column_values: config
                .include_column_values
                .iter()
                .map(|s| ColumnValueRule::parse(s))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    /// 아무것도 거르지 않는 필터
    pub fn allow_all() -> Self {
        Filter::default()
    }

    /// 행 출력 대상 테이블인지 (블랙리스트 포함)
    pub fn includes(&self, database: &str, table: &str) -> bool {
        if self.is_table_blacklisted(database, table) {
            return false;
        }
        if self.exclude_databases.iter().any(|p| p.matches(database)) {
            return false;
        }
        if !self.include_databases.is_empty()
            && !self.include_databases.iter().any(|p| p.matches(database))
        {
            return false;
        }
        if self.exclude_tables.iter().any(|r| r.matches(database, table)) {
            return false;
        }
        self.include_tables.is_empty() || self.include_tables.iter().any(|r| r.matches(database, table))
    }

    pub fn is_database_blacklisted(&self, database: &str) -> bool {
        self.blacklist.iter().any(|r| r.covers_database(database))
    }

    pub fn is_table_blacklisted(&self, database: &str, table: &str) -> bool {
        Self::is_system_blacklisted(database, table)
            || self.blacklist.iter().any(|r| r.matches(database, table))
    }

    /// 클라우드 헬스체크 테이블: 설정과 관계없이 항상 제외
    pub fn is_system_blacklisted(database: &str, table: &str) -> bool {
        (database == "mysql" && table == "ha_health_check") || table.starts_with("rds_heartbeat")
    }

    /// 컬럼 값 규칙 확인. 규칙 컬럼이 행에 없으면 통과
    pub fn matches_values(&self, database: &str, table: &str, data: &Map<String, Value>) -> bool {
        self.column_values
            .iter()
            .filter(|rule| rule.table.as_ref().map_or(true, |t| t.matches(database, table)))
            .all(|rule| match data.get(&rule.column) {
                None => true,
                Some(Value::String(s)) => *s == rule.value,
                Some(Value::Null) => rule.value.eq_ignore_ascii_case("null"),
                Some(other) => other.to_string() == rule.value,
            })
    }

    /// 필터 없음(None)이면 전부 출력
    pub fn should_output(
        filter: Option<&Filter>,
        database: &str,
        table: &str,
        data: &Map<String, Value>,
    ) -> bool {
        if Self::is_system_blacklisted(database, table) {
            return false;
        }
        match filter {
            Some(f) => f.includes(database, table) && f.matches_values(database, table, data),
            None => true,
        }
    }
}
