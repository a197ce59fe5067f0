//! MySQL 메타 데이터베이스 기반 위치 저장소

use super::{pick_recovery_info, PositionStore, RecoveryInfo};
use crate::error::{CdcError, Result};
use crate::heartbeat::HEARTBEATS_TABLE;
use crate::offset::{BinlogPosition, Position};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Pool};
use parking_lot::Mutex;
use tracing::{debug, info};

/// 중복 키 에러 코드
const ER_DUP_ENTRY: u16 = 1062;

const POSITION_TABLES_DDL: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS `{db}`.`positions` (\
       server_id BIGINT UNSIGNED NOT NULL, \
       client_id VARCHAR(255) CHARACTER SET latin1 NOT NULL DEFAULT 'cdc', \
       binlog_file VARCHAR(255), \
       binlog_position BIGINT UNSIGNED, \
       gtid_set VARCHAR(4096), \
       last_heartbeat_read BIGINT NULL DEFAULT NULL, \
       PRIMARY KEY (server_id, client_id))",
    "CREATE TABLE IF NOT EXISTS `{db}`.`heartbeats` (\
       server_id BIGINT UNSIGNED NOT NULL, \
       client_id VARCHAR(255) CHARACTER SET latin1 NOT NULL DEFAULT 'cdc', \
       heartbeat BIGINT NOT NULL, \
       PRIMARY KEY (server_id, client_id))",
];

type PositionRow = (u64, String, u64, Option<String>, Option<i64>);

fn position_from_row(file: String, offset: u64, gtid_set: Option<String>, heartbeat: Option<i64>) -> Position {
    let mut binlog = BinlogPosition::new(file, offset);
    binlog.gtid_set = gtid_set;
    Position::new(binlog, heartbeat)
}

pub struct MysqlPositionStore {
    pool: Pool,
    database: String,
    server_id: u64,
    client_id: String,
    last_heartbeat: Mutex<Option<i64>>,
}

impl MysqlPositionStore {
    pub fn new(pool: Pool, database: impl Into<String>, server_id: u64, client_id: impl Into<String>) -> Self {
        MysqlPositionStore {
            pool,
            database: database.into(),
            server_id,
            client_id: client_id.into(),
            last_heartbeat: Mutex::new(None),
        }
    }

    fn table(&self, name: &str) -> String {
        format!("`{}`.`{}`", self.database, name)
    }

    async fn conn(&self) -> Result<Conn> {
        self.pool
            .get_conn()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))
    }

    pub async fn ensure_tables(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.query_drop(format!("CREATE DATABASE IF NOT EXISTS `{}`", self.database))
            .await?;
        for ddl in POSITION_TABLES_DDL {
            conn.query_drop(ddl.replace("{db}", &self.database)).await?;
        }
        info!("Position store tables ready in {}", self.database);
        Ok(())
    }

    async fn insert_heartbeat(&self, conn: &mut Conn, value: i64) -> Result<()> {
        let result = conn
            .exec_drop(
                format!(
                    "INSERT INTO {} SET heartbeat = ?, server_id = ?, client_id = ?",
                    self.table(HEARTBEATS_TABLE)
                ),
                (value, self.server_id, self.client_id.clone()),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(mysql_async::Error::Server(ref e)) if e.code == ER_DUP_ENTRY => {
                Err(CdcError::DuplicateProcess {
                    client_id: self.client_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PositionStore for MysqlPositionStore {
    fn server_id(&self) -> u64 {
        self.server_id
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn set(&self, position: &Position) -> Result<()> {
        let mut conn = self.conn().await?;
        debug!("Writing position {} (last heartbeat {:?})", position, position.last_heartbeat);
        conn.exec_drop(
            format!(
                "INSERT INTO {} (server_id, client_id, binlog_file, binlog_position, gtid_set, last_heartbeat_read) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON DUPLICATE KEY UPDATE binlog_file = VALUES(binlog_file), \
                 binlog_position = VALUES(binlog_position), gtid_set = VALUES(gtid_set), \
                 last_heartbeat_read = COALESCE(VALUES(last_heartbeat_read), last_heartbeat_read)",
                self.table("positions")
            ),
            (
                self.server_id,
                self.client_id.clone(),
                position.binlog.file.clone(),
                position.binlog.offset,
                position.binlog.gtid_set.clone(),
                position.last_heartbeat,
            ),
        )
        .await?;
        Ok(())
    }

    async fn get(&self) -> Result<Option<Position>> {
        let mut conn = self.conn().await?;
        let row: Option<(String, u64, Option<String>, Option<i64>)> = conn
            .exec_first(
                format!(
                    "SELECT binlog_file, binlog_position, gtid_set, last_heartbeat_read \
                     FROM {} WHERE server_id = ? AND client_id = ?",
                    self.table("positions")
                ),
                (self.server_id, self.client_id.clone()),
            )
            .await?;
        Ok(row.map(|(file, offset, gtid, hb)| position_from_row(file, offset, gtid, hb)))
    }

    async fn heartbeat(&self) -> Result<i64> {
        let mut conn = self.conn().await?;
        let now = chrono::Utc::now().timestamp_millis();
        let cached = *self.last_heartbeat.lock();

        let expected = match cached {
            Some(value) => value,
            None => {
                let stored: Option<i64> = conn
                    .exec_first(
                        format!(
                            "SELECT heartbeat FROM {} WHERE server_id = ? AND client_id = ?",
                            self.table(HEARTBEATS_TABLE)
                        ),
                        (self.server_id, self.client_id.clone()),
                    )
                    .await?;
                match stored {
                    Some(value) => value,
                    None => {
                        self.insert_heartbeat(&mut conn, now).await?;
                        *self.last_heartbeat.lock() = Some(now);
                        return Ok(now);
                    }
                }
            }
        };

        let next = now.max(expected + 1);
        debug!("Writing heartbeat {} (last written {})", next, expected);
        conn.exec_drop(
            format!(
                "UPDATE {} SET heartbeat = ? WHERE server_id = ? AND client_id = ? AND heartbeat = ?",
                self.table(HEARTBEATS_TABLE)
            ),
            (next, self.server_id, self.client_id.clone(), expected),
        )
        .await?;

        if conn.affected_rows() != 1 {
            return Err(CdcError::DuplicateProcess {
                client_id: self.client_id.clone(),
            });
        }
        *self.last_heartbeat.lock() = Some(next);
        Ok(next)
    }

    async fn other_client_position(&self) -> Result<Option<Position>> {
        let mut conn = self.conn().await?;
        let row: Option<(String, u64, Option<String>, Option<i64>)> = conn
            .exec_first(
                format!(
                    "SELECT binlog_file, binlog_position, gtid_set, last_heartbeat_read \
                     FROM {} WHERE server_id = ? AND client_id <> ? \
                     ORDER BY last_heartbeat_read DESC LIMIT 1",
                    self.table("positions")
                ),
                (self.server_id, self.client_id.clone()),
            )
            .await?;
        Ok(row.map(|(file, offset, gtid, hb)| position_from_row(file, offset, gtid, hb)))
    }

    async fn recovery_info(&self) -> Result<Option<RecoveryInfo>> {
        let mut conn = self.conn().await?;
        let rows: Vec<PositionRow> = conn
            .exec(
                format!(
                    "SELECT server_id, binlog_file, binlog_position, gtid_set, last_heartbeat_read \
                     FROM {} WHERE client_id = ? ORDER BY server_id",
                    self.table("positions")
                ),
                (self.client_id.clone(),),
            )
            .await?;
        Ok(pick_recovery_info(
            &self.client_id,
            rows.into_iter().map(|(server_id, file, offset, gtid, hb)| {
                (server_id, position_from_row(file, offset, gtid, hb))
            }),
        ))
    }

    async fn delete_foreign_positions(&self, server_id: u64) -> Result<usize> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            format!(
                "DELETE FROM {} WHERE client_id = ? AND server_id <> ?",
                self.table("positions")
            ),
            (self.client_id.clone(), server_id),
        )
        .await?;
        Ok(conn.affected_rows() as usize)
    }

    async fn delete(&self, server_id: u64) -> Result<usize> {
        let mut conn = self.conn().await?;
        conn.exec_drop(
            format!(
                "DELETE FROM {} WHERE server_id = ? AND client_id = ?",
                self.table("positions")
            ),
            (server_id, self.client_id.clone()),
        )
        .await?;
        Ok(conn.affected_rows() as usize)
    }
}
