//! 하트비트 감시
//!
//! 위치 저장 태스크가 메타 DB 에 하트비트 값을 쓰면, 그 쓰기가 binlog 를 타고
//! 돌아옵니다. Replicator 가 돌아온 값을 여기에 기록하고, 기다리는 쪽은
//! `wait_for` 로 "지금까지 따라잡았다"는 것을 확인합니다.

use crate::error::{CdcError, Result};
use crate::schema::{ColumnDef, Table};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// 메타 DB 하트비트 테이블 이름
pub const HEARTBEATS_TABLE: &str = "heartbeats";

/// 하트비트 테이블 정의 (복구 스캔용 최소 스키마에도 사용)
pub fn heartbeat_table(meta_database: &str) -> Table {
    Table::new(
        meta_database,
        HEARTBEATS_TABLE,
        vec![
            ColumnDef::new("server_id", "bigint").unsigned(),
            ColumnDef::new("client_id", "varchar").with_charset("utf8mb4"),
            ColumnDef::new("heartbeat", "bigint"),
        ],
    )
    .with_pk(["server_id", "client_id"])
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    tx: watch::Sender<Option<i64>>,
    last_read_at: Mutex<Option<Instant>>,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        HeartbeatMonitor::new()
    }
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        HeartbeatMonitor {
            tx,
            last_read_at: Mutex::new(None),
        }
    }

    /// 스트림에서 읽은 하트비트 기록. 값은 줄어들지 않음
    pub fn heartbeat(&self, value: i64) {
        *self.last_read_at.lock() = Some(Instant::now());
        let advanced = self.tx.send_if_modified(|current| match *current {
            Some(prev) if prev >= value => false,
            _ => {
                *current = Some(value);
                true
            }
        });
        if advanced {
            debug!("Heartbeat {} read back from stream", value);
        }
    }

    pub fn last_heartbeat(&self) -> Option<i64> {
        *self.tx.borrow()
    }

    /// 마지막 하트비트를 읽은 뒤 지난 시간 (지연 측정용)
    pub fn since_last_read(&self) -> Option<Duration> {
        self.last_read_at.lock().map(|at| at.elapsed())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<i64>> {
        self.tx.subscribe()
    }

    /// value 이상이 관측될 때까지 대기
    pub async fn wait_for(&self, value: i64, timeout: Duration) -> Result<i64> {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|current| current.is_some_and(|h| h >= value)),
        )
        .await
        .map_err(|_| CdcError::Timeout)?;

        match waited {
            Ok(seen) => Ok((*seen).unwrap_or(value)),
            Err(_) => Err(CdcError::ChannelClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_heartbeat_never_decreases() {
        let monitor = HeartbeatMonitor::new();
        assert_eq!(monitor.last_heartbeat(), None);
        monitor.heartbeat(10);
        monitor.heartbeat(7);
        assert_eq!(monitor.last_heartbeat(), Some(10));
        monitor.heartbeat(12);
        assert_eq!(monitor.last_heartbeat(), Some(12));
        assert!(monitor.since_last_read().is_some());
    }

    #[test]
    fn test_heartbeat_table_shape() {
        let table = heartbeat_table("cdc_meta");
        assert_eq!(table.column_names(), vec!["server_id", "client_id", "heartbeat"]);
        assert_eq!(table.pk_columns, vec!["server_id", "client_id"]);
    }

    #[tokio::test]
    async fn test_wait_for() {
        let monitor = Arc::new(HeartbeatMonitor::new());
        let writer = monitor.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.heartbeat(5);
        });
        let seen = monitor.wait_for(5, Duration::from_secs(2)).await.unwrap();
        assert_eq!(seen, 5);
        handle.await.unwrap();

        let err = monitor.wait_for(6, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, CdcError::Timeout));
    }
}
