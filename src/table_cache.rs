//! 스트림 로컬 table_id → 테이블 정의 캐시
//!
//! Replicator 루프만 접근합니다. DDL 이나 binlog 로테이션이 지나면 table_id 가
//! 다른 테이블을 가리킬 수 있으므로 그때마다 통째로 비웁니다.

use crate::error::{CdcError, Result};
use crate::events::TableMapData;
use crate::filter::Filter;
use crate::schema::{Schema, Table};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct TableCache {
    tables: HashMap<u64, Arc<Table>>,
    blacklisted: HashMap<u64, String>,
}

impl TableCache {
    pub fn new() -> Self {
        TableCache::default()
    }

    pub fn upsert(&mut self, table_id: u64, table: Arc<Table>) {
        self.blacklisted.remove(&table_id);
        self.tables.insert(table_id, table);
    }

    pub fn get(&self, table_id: u64) -> Option<&Arc<Table>> {
        self.tables.get(&table_id)
    }

    pub fn is_blacklisted(&self, table_id: u64) -> bool {
        self.blacklisted.contains_key(&table_id)
    }

    /// 블랙리스트로 기록된 테이블의 `db.table` 이름
    pub fn blacklisted_name(&self, table_id: u64) -> Option<&str> {
        self.blacklisted.get(&table_id).map(String::as_str)
    }

    pub fn contains(&self, table_id: u64) -> bool {
        self.tables.contains_key(&table_id) || self.blacklisted.contains_key(&table_id)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.blacklisted.is_empty()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
        self.blacklisted.clear();
    }

    /// TABLE_MAP 이벤트 반영
    ///
    /// 이미 아는 id 는 무시합니다. 스키마에 없는 테이블은 `ignore_missing` 이면
    /// 경고만 남기고 건너뛰고, 아니면 `InvalidSchema` 입니다.
    pub fn process_table_map(
        &mut self,
        data: &TableMapData,
        schema: &Schema,
        filter: Option<&Filter>,
        ignore_missing: bool,
    ) -> Result<()> {
        if self.contains(data.table_id) {
            return Ok(());
        }

        let blacklisted = Filter::is_system_blacklisted(&data.database, &data.table)
            || filter.is_some_and(|f| f.is_table_blacklisted(&data.database, &data.table));
        if blacklisted {
            debug!("Table {}.{} is blacklisted (id {})", data.database, data.table, data.table_id);
            self.blacklisted
                .insert(data.table_id, format!("{}.{}", data.database, data.table));
            return Ok(());
        }

        match schema.find_table(&data.database, &data.table) {
            Some(table) => {
                self.tables.insert(data.table_id, Arc::new(table.clone()));
                Ok(())
            }
            None if ignore_missing => {
                warn!(
                    "Couldn't find table {}.{} in schema, ignoring its rows",
                    data.database, data.table
                );
                Ok(())
            }
            None => Err(CdcError::InvalidSchema(format!(
                "Couldn't find table {}.{} (table id {})",
                data.database, data.table, data.table_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterConfig;
    use crate::schema::{CaseSensitivity, ColumnDef, Database};

    fn schema() -> Schema {
        let mut db = Database::new("shop", None);
        db.tables.push(Table::new("shop", "orders", vec![ColumnDef::new("id", "int")]));
        db.tables.push(Table::new("shop", "secrets", vec![ColumnDef::new("id", "int")]));
        Schema::new(vec![db], "utf8mb4", CaseSensitivity::CaseSensitive)
    }

    fn map(table_id: u64, database: &str, table: &str) -> TableMapData {
        TableMapData {
            table_id,
            database: database.to_string(),
            table: table.to_string(),
            column_types: Vec::new(),
        }
    }

    #[test]
    fn test_resolves_against_schema() {
        let mut cache = TableCache::new();
        cache.process_table_map(&map(7, "shop", "orders"), &schema(), None, false).unwrap();
        assert_eq!(cache.get(7).unwrap().name, "orders");
        assert!(!cache.is_blacklisted(7));
    }

    #[test]
    fn test_known_id_is_ignored() {
        let mut cache = TableCache::new();
        let s = schema();
        cache.process_table_map(&map(7, "shop", "orders"), &s, None, false).unwrap();
        // 같은 id 가 다른 이름으로 다시 와도 다음 경계 전까지는 첫 정의 유지
        cache.process_table_map(&map(7, "shop", "secrets"), &s, None, false).unwrap();
        assert_eq!(cache.get(7).unwrap().name, "orders");
    }

    #[test]
    fn test_blacklisted_tables_are_recorded_by_name() {
        let filter = Filter::new(&FilterConfig {
            blacklist: vec!["shop.secrets".into()],
            ..Default::default()
        })
        .unwrap();
        let mut cache = TableCache::new();
        let s = schema();
        cache.process_table_map(&map(8, "shop", "secrets"), &s, Some(&filter), false).unwrap();
        cache.process_table_map(&map(9, "mysql", "rds_heartbeat2"), &s, None, false).unwrap();

        assert!(cache.is_blacklisted(8));
        assert_eq!(cache.blacklisted_name(8), Some("shop.secrets"));
        assert!(cache.is_blacklisted(9));
        assert!(cache.get(8).is_none());
    }

    #[test]
    fn test_missing_table() {
        let mut cache = TableCache::new();
        let err = cache
            .process_table_map(&map(3, "shop", "ghost"), &schema(), None, false)
            .unwrap_err();
        assert!(err.is_schema_error());

        cache.process_table_map(&map(3, "shop", "ghost"), &schema(), None, true).unwrap();
        assert!(cache.get(3).is_none());
    }

    #[test]
    fn test_clear() {
        let mut cache = TableCache::new();
        cache.process_table_map(&map(7, "shop", "orders"), &schema(), None, false).unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }
}
