//! Database → Table → Column 스키마 트리
//!
//! 변경 스트림의 컬럼은 위치(인덱스)로 식별되므로 컬럼 순서가 곧 의미입니다.
//! 모든 변경 후 `position` 을 0부터 연속으로 다시 매깁니다.

use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};

/// 테이블/데이터베이스 이름 대소문자 처리 (`lower_case_table_names`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseSensitivity {
    /// 0: 저장도 비교도 그대로
    #[default]
    CaseSensitive,
    /// 1: 소문자로 저장, 비교
    ConvertToLower,
    /// 2: 그대로 저장, 비교는 대소문자 무시
    ConvertOnCompare,
}

impl CaseSensitivity {
    pub fn from_lower_case_table_names(value: u8) -> Self {
        match value {
            1 => CaseSensitivity::ConvertToLower,
            2 => CaseSensitivity::ConvertOnCompare,
            _ => CaseSensitivity::CaseSensitive,
        }
    }

    pub fn matches(&self, a: &str, b: &str) -> bool {
        match self {
            CaseSensitivity::CaseSensitive => a == b,
            _ => a.eq_ignore_ascii_case(b),
        }
    }

    pub fn normalize(&self, name: &str) -> String {
        match self {
            CaseSensitivity::ConvertToLower => name.to_lowercase(),
            _ => name.to_string(),
        }
    }
}

/// 컬럼 추가/이동 위치
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnPosition {
    /// 맨 뒤
    #[default]
    Default,
    First,
    After(String),
}

/// 컬럼 정의
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// 소문자 기본 타입명 (int, varchar, enum, ...)
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(default = "default_signed")]
    pub signed: bool,
    /// ENUM / SET 값 목록
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_length: Option<u64>,
    #[serde(default)]
    pub position: usize,
}

fn default_signed() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        ColumnDef {
            name: name.into(),
            column_type: column_type.into().to_lowercase(),
            charset: None,
            signed: true,
            enum_values: None,
            column_length: None,
            position: 0,
        }
    }

    pub fn unsigned(mut self) -> Self {
        self.signed = false;
        self
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn with_enum_values<S: Into<String>>(mut self, values: impl IntoIterator<Item = S>) -> Self {
        self.enum_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.column_length = Some(length);
        self
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.column_type.as_str(),
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint"
        )
    }

    pub fn is_string(&self) -> bool {
        matches!(
            self.column_type.as_str(),
            "char" | "varchar" | "text" | "tinytext" | "mediumtext" | "longtext"
        )
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self.column_type.as_str(),
            "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" | "bit"
                | "geometry" | "point"
        )
    }

    /// 문자열 계열 컬럼에 테이블 charset 상속
    fn inherit_charset(&mut self, table_charset: Option<&str>) {
        if self.charset.is_none() && (self.is_string() || self.column_type == "enum" || self.column_type == "set") {
            self.charset = table_charset.map(str::to_string);
        }
    }
}

/// 테이블 정의
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub database: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(default)]
    pub pk_columns: Vec<String>,
    pub columns: Vec<ColumnDef>,
}

impl Table {
    pub fn new(database: impl Into<String>, name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        let mut table = Table {
            database: database.into(),
            name: name.into(),
            charset: None,
            pk_columns: Vec::new(),
            columns,
        };
        table.renumber();
        table
    }

    pub fn with_pk<S: Into<String>>(mut self, pk: impl IntoIterator<Item = S>) -> Self {
        self.pk_columns = pk.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// 컬럼명은 MySQL 에서 항상 대소문자 무시
    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDef> {
        self.find_column_index(name).map(|i| &self.columns[i])
    }

    fn renumber(&mut self) {
        for (i, column) in self.columns.iter_mut().enumerate() {
            column.position = i;
        }
    }

    /// 상속 charset 정리 (CREATE TABLE 이후)
    pub fn apply_default_charset(&mut self) {
        let charset = self.charset.clone();
        for column in &mut self.columns {
            column.inherit_charset(charset.as_deref());
        }
    }

    fn insert_index(&self, position: &ColumnPosition) -> Result<usize> {
        match position {
            ColumnPosition::Default => Ok(self.columns.len()),
            ColumnPosition::First => Ok(0),
            ColumnPosition::After(name) => self
                .find_column_index(name)
                .map(|i| i + 1)
                .ok_or_else(|| {
                    CdcError::InvalidSchema(format!(
                        "Column {} not found in {}",
                        name,
                        self.full_name()
                    ))
                }),
        }
    }

    pub fn add_column(&mut self, column: ColumnDef, position: &ColumnPosition) -> Result<()> {
        if self.find_column_index(&column.name).is_some() {
            return Err(CdcError::InvalidSchema(format!(
                "Duplicate column {} in {}",
                column.name,
                self.full_name()
            )));
        }
        let index = self.insert_index(position)?;
        let mut column = column;
        column.inherit_charset(self.charset.as_deref());
        self.columns.insert(index, column);
        self.renumber();
        Ok(())
    }

    pub fn remove_column(&mut self, name: &str) -> Result<ColumnDef> {
        let index = self.find_column_index(name).ok_or_else(|| {
            CdcError::InvalidSchema(format!("Column {} not found in {}", name, self.full_name()))
        })?;
        let removed = self.columns.remove(index);
        self.pk_columns.retain(|pk| !pk.eq_ignore_ascii_case(name));
        self.renumber();
        Ok(removed)
    }

    /// CHANGE / MODIFY COLUMN: 제거 후 새 정의를 원하는 위치에 삽입
    pub fn change_column(
        &mut self,
        old_name: &str,
        column: ColumnDef,
        position: &ColumnPosition,
    ) -> Result<()> {
        let old_index = self.find_column_index(old_name).ok_or_else(|| {
            CdcError::InvalidSchema(format!(
                "Column {} not found in {}",
                old_name,
                self.full_name()
            ))
        })?;
        self.columns.remove(old_index);

        let index = match position {
            ColumnPosition::Default => old_index,
            other => self.insert_index(other)?,
        };
        for pk in self.pk_columns.iter_mut() {
            if pk.eq_ignore_ascii_case(old_name) {
                *pk = column.name.clone();
            }
        }
        let mut column = column;
        column.inherit_charset(self.charset.as_deref());
        self.columns.insert(index, column);
        self.renumber();
        Ok(())
    }

    pub fn set_pk(&mut self, pk: Vec<String>) -> Result<()> {
        for name in &pk {
            if self.find_column_index(name).is_none() {
                return Err(CdcError::InvalidSchema(format!(
                    "Primary key column {} not found in {}",
                    name,
                    self.full_name()
                )));
            }
        }
        self.pk_columns = pk;
        Ok(())
    }

    fn diff(&self, other: &Table, out: &mut Vec<String>) {
        let name = self.full_name();
        if self.charset != other.charset {
            out.push(format!("{}: charset {:?} != {:?}", name, self.charset, other.charset));
        }
        if self.pk_columns != other.pk_columns {
            out.push(format!("{}: pk {:?} != {:?}", name, self.pk_columns, other.pk_columns));
        }
        if self.columns.len() != other.columns.len() {
            out.push(format!(
                "{}: {} columns != {} columns",
                name,
                self.columns.len(),
                other.columns.len()
            ));
        }
        for (a, b) in self.columns.iter().zip(other.columns.iter()) {
            if a != b {
                out.push(format!("{}: column {:?} != {:?}", name, a, b));
            }
        }
    }
}

/// 데이터베이스
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(default)]
    pub tables: Vec<Table>,
}

impl Database {
    pub fn new(name: impl Into<String>, charset: Option<String>) -> Self {
        Database {
            name: name.into(),
            charset,
            tables: Vec::new(),
        }
    }

    pub fn find_table(&self, name: &str, sensitivity: CaseSensitivity) -> Option<&Table> {
        self.tables.iter().find(|t| sensitivity.matches(&t.name, name))
    }

    pub fn find_table_mut(&mut self, name: &str, sensitivity: CaseSensitivity) -> Option<&mut Table> {
        self.tables.iter_mut().find(|t| sensitivity.matches(&t.name, name))
    }

    pub fn has_table(&self, name: &str, sensitivity: CaseSensitivity) -> bool {
        self.find_table(name, sensitivity).is_some()
    }

    pub fn remove_table(&mut self, name: &str, sensitivity: CaseSensitivity) -> Option<Table> {
        let index = self.tables.iter().position(|t| sensitivity.matches(&t.name, name))?;
        Some(self.tables.remove(index))
    }
}

/// 전체 스키마 (하나의 스키마 버전 내용)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub databases: Vec<Database>,
    pub charset: String,
    #[serde(default)]
    pub sensitivity: CaseSensitivity,
}

impl Schema {
    pub fn new(databases: Vec<Database>, charset: impl Into<String>, sensitivity: CaseSensitivity) -> Self {
        Schema {
            databases,
            charset: charset.into(),
            sensitivity,
        }
    }

    pub fn find_database(&self, name: &str) -> Option<&Database> {
        self.databases
            .iter()
            .find(|d| self.sensitivity.matches(&d.name, name))
    }

    pub fn find_database_mut(&mut self, name: &str) -> Option<&mut Database> {
        let sensitivity = self.sensitivity;
        self.databases
            .iter_mut()
            .find(|d| sensitivity.matches(&d.name, name))
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.find_database(name).is_some()
    }

    pub fn find_table(&self, database: &str, table: &str) -> Option<&Table> {
        self.find_database(database)
            .and_then(|d| d.find_table(table, self.sensitivity))
    }

    pub fn remove_database(&mut self, name: &str) -> Option<Database> {
        let sensitivity = self.sensitivity;
        let index = self
            .databases
            .iter()
            .position(|d| sensitivity.matches(&d.name, name))?;
        Some(self.databases.remove(index))
    }

    pub fn table_count(&self) -> usize {
        self.databases.iter().map(|d| d.tables.len()).sum()
    }

    /// 사람이 읽을 수 있는 차이 목록 (같으면 빈 목록)
    pub fn diff(&self, other: &Schema) -> Vec<String> {
        let mut out = Vec::new();
        if self.charset != other.charset {
            out.push(format!("schema charset {} != {}", self.charset, other.charset));
        }
        for db in &self.databases {
            match other.find_database(&db.name) {
                None => out.push(format!("database {} missing on right", db.name)),
                Some(other_db) => {
                    if db.charset != other_db.charset {
                        out.push(format!(
                            "database {}: charset {:?} != {:?}",
                            db.name, db.charset, other_db.charset
                        ));
                    }
                    for table in &db.tables {
                        match other_db.find_table(&table.name, self.sensitivity) {
                            None => out.push(format!("table {} missing on right", table.full_name())),
                            Some(other_table) => table.diff(other_table, &mut out),
                        }
                    }
                    for table in &other_db.tables {
                        if !db.has_table(&table.name, self.sensitivity) {
                            out.push(format!("table {} missing on left", table.full_name()));
                        }
                    }
                }
            }
        }
        for db in &other.databases {
            if !self.has_database(&db.name) {
                out.push(format!("database {} missing on left", db.name));
            }
        }
        out
    }
}
