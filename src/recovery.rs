//! 마스터 교체 후 위치 복구
//!
//! 저장된 위치는 이전 서버의 binlog 좌표라 새 서버에서는 의미가 없습니다.
//! 대신 저장 당시 마지막으로 읽은 하트비트 값을 새 서버의 binlog 에서 찾아,
//! 그 하트비트 행 바로 다음 위치를 새 시작 위치로 씁니다.
//! 하트비트 테이블 쓰기가 복제되어 새 서버 binlog 에도 남아 있다는 가정에 기대는
//! 최선 노력 방식입니다.

use crate::codec::DefaultColumnCodec;
use crate::config::ReplicatorConfig;
use crate::error::{CdcError, Result};
use crate::filter::{Filter, FilterConfig};
use crate::heartbeat::{heartbeat_table, HeartbeatMonitor};
use crate::offset::{BinlogPosition, Position};
use crate::position_store::RecoveryInfo;
use crate::replicator::{NextRow, Replicator};
use crate::row::RowPayload;
use crate::schema::{
    CaseSensitivity, Database, MemorySchemaRepository, Schema, SchemaStore, SchemaStoreConfig,
    StaticDdlResolver, StaticSchemaCapturer,
};
use crate::source::SourceConnector;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCAN_POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct Recovery {
    connector: Arc<dyn SourceConnector>,
    meta_database: String,
    client_id: String,
    sensitivity: CaseSensitivity,
}

impl Recovery {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        meta_database: impl Into<String>,
        client_id: impl Into<String>,
        sensitivity: CaseSensitivity,
    ) -> Self {
        Recovery {
            connector,
            meta_database: meta_database.into(),
            client_id: client_id.into(),
            sensitivity,
        }
    }

    /// 최신 binlog 부터 거꾸로 훑으며 info.heartbeat 를 찾음
    pub async fn recover(&self, info: &RecoveryInfo) -> Result<Position> {
        info!(
            "Attempting to recover {} from server {} using heartbeat {}",
            info.position, info.server_id, info.heartbeat
        );

        let files = self.connector.binlog_files().await?;
        for file in files.iter().rev() {
            debug!("Scanning {} for heartbeat {}", file, info.heartbeat);
            if let Some(position) = self.scan_file(file, info.heartbeat).await? {
                info!("Recovered position {} from heartbeat {}", position, info.heartbeat);
                return Ok(position);
            }
        }

        warn!(
            "Could not find heartbeat {} in {} binlogs of the new master",
            info.heartbeat,
            files.len()
        );
        Err(CdcError::RecoveryImpossible {
            client_id: info.client_id.clone(),
            position: info.position.to_string(),
        })
    }

    /// 하트비트 테이블만 아는 스키마로 파일 하나를 끝까지 읽음
    async fn scan_file(&self, file: &str, heartbeat: i64) -> Result<Option<Position>> {
        let start = BinlogPosition::start_of(file);
        let source = self.connector.open(&start, true).await?;
        let server_id = self.connector.server_id().await?;

        let mut config = ReplicatorConfig::new(self.client_id.clone()).with_meta_database(self.meta_database.clone());
        config.ignore_missing_schema = true;
        config.skip_ddl_errors = true;
        config.poll_timeout = SCAN_POLL_TIMEOUT;

        // 메타 DB 밖의 행은 볼 필요가 없음
        let filter = Arc::new(Filter::new(&FilterConfig {
            include_databases: vec![self.meta_database.clone()],
            ..Default::default()
        })?);
        let mut replicator = Replicator::new(
            config,
            source,
            self.scan_schema_store(server_id),
            Arc::new(DefaultColumnCodec),
            Arc::new(HeartbeatMonitor::new()),
            Position::new(start, None),
        )?
        .with_filter(filter);

        loop {
            match replicator.get_row(SCAN_POLL_TIMEOUT).await? {
                NextRow::Row(row) => {
                    if let RowPayload::Heartbeat { heartbeat: seen } = row.payload {
                        if seen == heartbeat {
                            return Ok(Some(row.position));
                        }
                    }
                }
                NextRow::Idle => continue,
                NextRow::Eof => return Ok(None),
            }
        }
    }

    fn scan_schema_store(&self, server_id: u64) -> SchemaStore {
        let mut meta = Database::new(self.meta_database.clone(), None);
        meta.tables.push(heartbeat_table(&self.meta_database));
        let schema = Schema::new(vec![meta], "utf8mb4", self.sensitivity);

        SchemaStore::new(
            server_id,
            Arc::new(MemorySchemaRepository::new()),
            Arc::new(StaticSchemaCapturer::new(schema)),
            Arc::new(StaticDdlResolver::new()),
            None,
            SchemaStoreConfig::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySourceConnector;
    use crate::test_support::*;
    use tokio_test::assert_err;

    fn connector() -> Arc<dyn SourceConnector> {
        let mut events = EventScript::new("mysql-bin.000007")
            .heartbeat(50, "a", 100)
            .insert_tx(10, "shop", "t", 1, "x", 1)
            .into_events();
        events.extend(
            EventScript::new("mysql-bin.000008")
                .query("shop", "ALTER TABLE t ADD COLUMN z int")
                .heartbeat(50, "a", 200)
                .heartbeat(50, "b", 300)
                .insert_tx(10, "shop", "t", 2, "y", 2)
                .into_events(),
        );
        Arc::new(MemorySourceConnector::with_events(2, events))
    }

    fn info(client_id: &str, heartbeat: i64) -> RecoveryInfo {
        RecoveryInfo {
            position: Position::at("old-bin.000042", 1234).with_heartbeat(heartbeat),
            heartbeat,
            server_id: 1,
            client_id: client_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_recovers_position_after_heartbeat() {
        let recovery = Recovery::new(connector(), META_DB, "a", CaseSensitivity::CaseSensitive);

        let position = recovery.recover(&info("a", 200)).await.unwrap();
        assert_eq!(position.file(), "mysql-bin.000008");
        // ALTER(1) + heartbeat 트랜잭션(4) 다음
        assert_eq!(position.offset(), 4 + 50 * 5);
        assert_eq!(position.last_heartbeat, Some(200));

        let older = recovery.recover(&info("a", 100)).await.unwrap();
        assert_eq!(older.file(), "mysql-bin.000007");
    }

    #[tokio::test]
    async fn test_other_clients_heartbeats_are_not_matched() {
        let recovery = Recovery::new(connector(), META_DB, "a", CaseSensitivity::CaseSensitive);
        let err = assert_err!(recovery.recover(&info("a", 300)).await);
        assert!(matches!(err, CdcError::RecoveryImpossible { ref client_id, .. } if client_id == "a"));
    }
}
