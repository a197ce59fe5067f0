//! 구조화된 스키마 변경 (DDL 해석 결과)
//!
//! `apply` 는 입력 스키마를 건드리지 않고 새 스키마 값을 만듭니다.

use super::model::{ColumnDef, ColumnPosition, Database, Schema, Table};
use crate::error::{CdcError, Result};
use crate::filter::Filter;
use serde::{Deserialize, Serialize};

/// 다른 테이블 참조 (CREATE TABLE ... LIKE)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

/// ALTER TABLE 의 컬럼 단위 변경
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ColumnMod {
    Add {
        column: ColumnDef,
        #[serde(default)]
        position: ColumnPosition,
    },
    Change {
        name: String,
        column: ColumnDef,
        #[serde(default)]
        position: ColumnPosition,
    },
    Remove {
        name: String,
        #[serde(default)]
        if_exists: bool,
    },
}

/// 해석이 끝난 스키마 변경 하나
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SchemaChange {
    DatabaseCreate {
        database: String,
        #[serde(default)]
        charset: Option<String>,
        #[serde(default)]
        if_not_exists: bool,
    },
    DatabaseAlter {
        database: String,
        charset: String,
    },
    DatabaseDrop {
        database: String,
        #[serde(default)]
        if_exists: bool,
    },
    TableCreate {
        table: Table,
        #[serde(default)]
        like: Option<TableRef>,
        #[serde(default)]
        if_not_exists: bool,
    },
    TableDrop {
        database: String,
        table: String,
        #[serde(default)]
        if_exists: bool,
    },
    TableAlter {
        database: String,
        table: String,
        #[serde(default)]
        new_database: Option<String>,
        #[serde(default)]
        new_table: Option<String>,
        #[serde(default)]
        column_mods: Vec<ColumnMod>,
        #[serde(default)]
        charset: Option<String>,
        #[serde(default)]
        pk: Option<Vec<String>>,
    },
}

impl SchemaChange {
    pub fn kind(&self) -> &'static str {
        match self {
            SchemaChange::DatabaseCreate { .. } => "database-create",
            SchemaChange::DatabaseAlter { .. } => "database-alter",
            SchemaChange::DatabaseDrop { .. } => "database-drop",
            SchemaChange::TableCreate { .. } => "table-create",
            SchemaChange::TableDrop { .. } => "table-drop",
            SchemaChange::TableAlter { .. } => "table-alter",
        }
    }

    pub fn database(&self) -> &str {
        match self {
            SchemaChange::DatabaseCreate { database, .. }
            | SchemaChange::DatabaseAlter { database, .. }
            | SchemaChange::DatabaseDrop { database, .. }
            | SchemaChange::TableDrop { database, .. }
            | SchemaChange::TableAlter { database, .. } => database,
            SchemaChange::TableCreate { table, .. } => &table.database,
        }
    }

    pub fn table(&self) -> Option<&str> {
        match self {
            SchemaChange::TableCreate { table, .. } => Some(&table.name),
            SchemaChange::TableDrop { table, .. } | SchemaChange::TableAlter { table, .. } => {
                Some(table)
            }
            _ => None,
        }
    }

    /// 블랙리스트 대상이면 스키마에 반영하지도, 출력하지도 않음
    pub fn is_blacklisted(&self, filter: &Filter) -> bool {
        let database = self.database();
        if filter.is_database_blacklisted(database) {
            return true;
        }
        match self {
            SchemaChange::TableAlter {
                table,
                new_database,
                new_table,
                ..
            } => {
                let target_db = new_database.as_deref().unwrap_or(database);
                let target_table = new_table.as_deref().unwrap_or(table);
                filter.is_table_blacklisted(database, table)
                    || filter.is_table_blacklisted(target_db, target_table)
            }
            _ => self
                .table()
                .map(|t| filter.is_table_blacklisted(database, t))
                .unwrap_or(false),
        }
    }

    /// 새 스키마 생성 (입력은 변경하지 않음)
    pub fn apply(&self, schema: &Schema) -> Result<Schema> {
        let mut next = schema.clone();
        let sensitivity = next.sensitivity;

        match self {
            SchemaChange::DatabaseCreate {
                database,
                charset,
                if_not_exists,
            } => {
                if next.has_database(database) {
                    if *if_not_exists {
                        return Ok(next);
                    }
                    return Err(CdcError::InvalidSchema(format!(
                        "Database {} already exists",
                        database
                    )));
                }
                let charset = charset.clone().unwrap_or_else(|| next.charset.clone());
                next.databases.push(Database::new(
                    sensitivity.normalize(database),
                    Some(charset),
                ));
            }

            SchemaChange::DatabaseAlter { database, charset } => {
                let db = next
                    .find_database_mut(database)
                    .ok_or_else(|| missing_database(database))?;
                db.charset = Some(charset.clone());
            }

            SchemaChange::DatabaseDrop {
                database,
                if_exists,
            } => {
                if next.remove_database(database).is_none() && !*if_exists {
                    return Err(missing_database(database));
                }
            }

            SchemaChange::TableCreate {
                table,
                like,
                if_not_exists,
            } => {
                let mut created = match like {
                    Some(source) => {
                        let mut copy = next
                            .find_table(&source.database, &source.table)
                            .cloned()
                            .ok_or_else(|| missing_table(&source.database, &source.table))?;
                        copy.database = table.database.clone();
                        copy.name = table.name.clone();
                        copy
                    }
                    None => table.clone(),
                };
                created.name = sensitivity.normalize(&created.name);

                let schema_charset = next.charset.clone();
                let db = next
                    .find_database_mut(&table.database)
                    .ok_or_else(|| missing_database(&table.database))?;
                if db.has_table(&created.name, sensitivity) {
                    if *if_not_exists {
                        return Ok(next);
                    }
                    return Err(CdcError::InvalidSchema(format!(
                        "Table {}.{} already exists",
                        table.database, table.name
                    )));
                }

                created.database = db.name.clone();
                if created.charset.is_none() {
                    created.charset = Some(db.charset.clone().unwrap_or(schema_charset));
                }
                created.apply_default_charset();
                let pk = std::mem::take(&mut created.pk_columns);
                created.set_pk(pk)?;
                db.tables.push(created);
            }

            SchemaChange::TableDrop {
                database,
                table,
                if_exists,
            } => {
                let removed = next
                    .find_database_mut(database)
                    .and_then(|db| db.remove_table(table, sensitivity));
                if removed.is_none() && !*if_exists {
                    return Err(missing_table(database, table));
                }
            }

            SchemaChange::TableAlter {
                database,
                table,
                new_database,
                new_table,
                column_mods,
                charset,
                pk,
            } => {
                let original = next
                    .find_table(database, table)
                    .cloned()
                    .ok_or_else(|| missing_table(database, table))?;

                let mut altered = original;
                if let Some(charset) = charset {
                    altered.charset = Some(charset.clone());
                }
                for column_mod in column_mods {
                    apply_column_mod(&mut altered, column_mod)?;
                }
                if let Some(pk) = pk {
                    altered.set_pk(pk.clone())?;
                }

                let target_db = new_database.as_deref().unwrap_or(database);
                let target_name = new_table
                    .as_deref()
                    .map(|n| sensitivity.normalize(n))
                    .unwrap_or_else(|| altered.name.clone());
                let renamed = !sensitivity.matches(target_db, database)
                    || !sensitivity.matches(&target_name, &altered.name);

                if renamed {
                    let target = next
                        .find_database(target_db)
                        .ok_or_else(|| missing_database(target_db))?;
                    if target.has_table(&target_name, sensitivity) {
                        return Err(CdcError::InvalidSchema(format!(
                            "Table {}.{} already exists",
                            target_db, target_name
                        )));
                    }
                    if let Some(db) = next.find_database_mut(database) {
                        db.remove_table(table, sensitivity);
                    }
                    let db = next
                        .find_database_mut(target_db)
                        .ok_or_else(|| missing_database(target_db))?;
                    altered.database = db.name.clone();
                    altered.name = target_name;
                    db.tables.push(altered);
                } else if let Some(slot) = next
                    .find_database_mut(database)
                    .and_then(|db| db.find_table_mut(table, sensitivity))
                {
                    *slot = altered;
                }
            }
        }

        Ok(next)
    }
}

fn apply_column_mod(table: &mut Table, column_mod: &ColumnMod) -> Result<()> {
    match column_mod {
        ColumnMod::Add { column, position } => table.add_column(column.clone(), position),
        ColumnMod::Change {
            name,
            column,
            position,
        } => table.change_column(name, column.clone(), position),
        ColumnMod::Remove { name, if_exists } => {
            if table.find_column_index(name).is_none() && *if_exists {
                return Ok(());
            }
            table.remove_column(name).map(|_| ())
        }
    }
}

fn missing_database(database: &str) -> CdcError {
    CdcError::InvalidSchema(format!("Couldn't find database {}", database))
}

fn missing_table(database: &str, table: &str) -> CdcError {
    CdcError::InvalidSchema(format!("Couldn't find table {}.{}", database, table))
}
