//! 재시작 위치와 하트비트 영속화
//!
//! (server_id, client_id) 마다 살아있는 위치 행은 하나입니다. 하트비트는
//! 마지막으로 쓴 값과 비교하는 낙관적 갱신이라, 같은 client_id 로 두 프로세스가
//! 돌면 먼저 진 쪽이 `DuplicateProcess` 로 멈춥니다.

pub mod flusher;
pub mod mysql;

pub use flusher::{PositionFlusher, PositionTracker};
pub use mysql::MysqlPositionStore;

use crate::error::{CdcError, Result};
use crate::offset::Position;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 다른 서버에서 저장된 위치로부터 복구할 때 필요한 정보
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryInfo {
    pub position: Position,
    /// 저장 시점에 마지막으로 읽은 하트비트
    pub heartbeat: i64,
    pub server_id: u64,
    pub client_id: String,
}

impl RecoveryInfo {
    /// 하트비트 없는 위치로는 복구할 수 없음
    pub fn from_position(position: Position, server_id: u64, client_id: impl Into<String>) -> Option<Self> {
        let heartbeat = position.last_heartbeat?;
        Some(RecoveryInfo {
            position,
            heartbeat,
            server_id,
            client_id: client_id.into(),
        })
    }
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    fn server_id(&self) -> u64;

    fn client_id(&self) -> &str;

    async fn set(&self, position: &Position) -> Result<()>;

    async fn get(&self) -> Result<Option<Position>>;

    /// 현재 시각(ms)을 하트비트로 기록하고 그 값을 돌려줌
    async fn heartbeat(&self) -> Result<i64>;

    /// 같은 서버에서 다른 client_id 가 저장한 위치 중 하트비트가 가장 최근인 것
    ///
    /// 처음 뜨는 client 는 여기서 시작해야 그 사이의 스키마 변경을 놓치지 않습니다.
    async fn other_client_position(&self) -> Result<Option<Position>>;

    /// 이 client_id 의 위치 행이 (어느 서버든) 정확히 하나일 때만 Some
    async fn recovery_info(&self) -> Result<Option<RecoveryInfo>>;

    /// server_id 가 아닌 서버로 저장된 이 client 의 위치 삭제
    async fn delete_foreign_positions(&self, server_id: u64) -> Result<usize>;

    /// 이 client 의 server_id 위치 삭제 (복구 후 이전 서버 행 정리)
    async fn delete(&self, server_id: u64) -> Result<usize>;
}

/// 여러 행에서 복구 정보 고르기 (MySQL 구현과 공유)
pub(crate) fn pick_recovery_info(
    client_id: &str,
    rows: impl IntoIterator<Item = (u64, Position)>,
) -> Option<RecoveryInfo> {
    let mut info: Option<RecoveryInfo> = None;
    for (server_id, position) in rows {
        if position.last_heartbeat.is_none() {
            warn!("Recovery is ignoring position {} with no heartbeat", position);
            continue;
        }
        if let Some(existing) = &info {
            warn!(
                "Found positions for servers {} and {}, not attempting recovery",
                existing.server_id, server_id
            );
            return None;
        }
        info = RecoveryInfo::from_position(position, server_id, client_id);
    }
    info
}

#[derive(Debug, Default)]
struct MemoryPositions {
    positions: HashMap<(u64, String), Position>,
    heartbeats: HashMap<(u64, String), i64>,
}

/// 메모리 위치 저장소
///
/// `share` 로 같은 저장 공간을 보는 다른 (server_id, client_id) 또는 다른
/// 프로세스를 흉내 낼 수 있습니다.
#[derive(Debug, Clone)]
pub struct MemoryPositionStore {
    storage: Arc<Mutex<MemoryPositions>>,
    server_id: u64,
    client_id: String,
    last_heartbeat: Arc<Mutex<Option<i64>>>,
}

impl MemoryPositionStore {
    pub fn new(server_id: u64, client_id: impl Into<String>) -> Self {
        MemoryPositionStore {
            storage: Arc::new(Mutex::new(MemoryPositions::default())),
            server_id,
            client_id: client_id.into(),
            last_heartbeat: Arc::new(Mutex::new(None)),
        }
    }

    /// 같은 저장 공간, 새 프로세스 상태
    pub fn share(&self, server_id: u64, client_id: impl Into<String>) -> Self {
        MemoryPositionStore {
            storage: self.storage.clone(),
            server_id,
            client_id: client_id.into(),
            last_heartbeat: Arc::new(Mutex::new(None)),
        }
    }

    fn key(&self) -> (u64, String) {
        (self.server_id, self.client_id.clone())
    }

    /// 저장된 하트비트 값 (테스트 확인용)
    pub fn stored_heartbeat(&self) -> Option<i64> {
        self.storage.lock().heartbeats.get(&self.key()).copied()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    fn server_id(&self) -> u64 {
        self.server_id
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn set(&self, position: &Position) -> Result<()> {
        debug!("Storing position {} for {}", position, self.client_id);
        let mut storage = self.storage.lock();
        let entry = storage.positions.entry(self.key()).or_insert_with(|| position.clone());
        let last_heartbeat = position.last_heartbeat.or(entry.last_heartbeat);
        *entry = position.clone();
        entry.last_heartbeat = last_heartbeat;
        Ok(())
    }

    async fn get(&self) -> Result<Option<Position>> {
        Ok(self.storage.lock().positions.get(&self.key()).cloned())
    }

    async fn heartbeat(&self) -> Result<i64> {
        let key = self.key();
        let mut storage = self.storage.lock();
        let mut last = self.last_heartbeat.lock();

        let expected = match *last {
            Some(value) => Some(value),
            None => storage.heartbeats.get(&key).copied(),
        };
        let now = chrono::Utc::now().timestamp_millis();
        let next = expected.map_or(now, |prev| now.max(prev + 1));

        if let Some(expected) = expected {
            if storage.heartbeats.get(&key) != Some(&expected) {
                return Err(CdcError::DuplicateProcess {
                    client_id: self.client_id.clone(),
                });
            }
        }
        storage.heartbeats.insert(key, next);
        *last = Some(next);
        Ok(next)
    }

    async fn other_client_position(&self) -> Result<Option<Position>> {
        let storage = self.storage.lock();
        Ok(storage
            .positions
            .iter()
            .filter(|((server, client), _)| *server == self.server_id && *client != self.client_id)
            .max_by_key(|(_, position)| position.last_heartbeat)
            .map(|(_, position)| position.clone()))
    }

    async fn recovery_info(&self) -> Result<Option<RecoveryInfo>> {
        let storage = self.storage.lock();
        let mut rows: Vec<(u64, Position)> = storage
            .positions
            .iter()
            .filter(|((_, client), _)| *client == self.client_id)
            .map(|((server, _), position)| (*server, position.clone()))
            .collect();
        rows.sort_by_key(|(server, _)| *server);
        Ok(pick_recovery_info(&self.client_id, rows))
    }

    async fn delete_foreign_positions(&self, server_id: u64) -> Result<usize> {
        let mut storage = self.storage.lock();
        let before = storage.positions.len();
        let client_id = self.client_id.clone();
        storage
            .positions
            .retain(|(server, client), _| *client != client_id || *server == server_id);
        Ok(before - storage.positions.len())
    }

    async fn delete(&self, server_id: u64) -> Result<usize> {
        let mut storage = self.storage.lock();
        Ok(storage
            .positions
            .remove(&(server_id, self.client_id.clone()))
            .map_or(0, |_| 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryPositionStore::new(1, "a");
        assert!(store.get().await.unwrap().is_none());
        let pos = Position::at("mysql-bin.000001", 120).with_heartbeat(5);
        assert_ok!(store.set(&pos).await);
        assert_eq!(store.get().await.unwrap(), Some(pos.clone()));

        // 하트비트 없는 위치가 와도 이전 하트비트는 유지
        assert_ok!(store.set(&Position::at("mysql-bin.000001", 300)).await);
        let stored = store.get().await.unwrap().unwrap();
        assert_eq!(stored.offset(), 300);
        assert_eq!(stored.last_heartbeat, Some(5));
    }

    #[tokio::test]
    async fn test_heartbeat_detects_duplicate_process() {
        let first = MemoryPositionStore::new(1, "a");
        let h1 = first.heartbeat().await.unwrap();
        let h2 = first.heartbeat().await.unwrap();
        assert!(h2 > h1);

        let second = first.share(1, "a");
        // 두 번째 프로세스는 저장된 값을 읽고 이어서 씀
        assert_ok!(second.heartbeat().await);
        let err = assert_err!(first.heartbeat().await);
        assert!(matches!(err, CdcError::DuplicateProcess { .. }));
    }

    #[tokio::test]
    async fn test_recovery_info_requires_single_row_with_heartbeat() {
        let old = MemoryPositionStore::new(1, "a");
        let current = old.share(2, "a");
        assert!(current.recovery_info().await.unwrap().is_none());

        old.set(&Position::at("mysql-bin.000004", 900)).await.unwrap();
        assert!(current.recovery_info().await.unwrap().is_none());

        old.set(&Position::at("mysql-bin.000004", 900).with_heartbeat(77)).await.unwrap();
        let info = current.recovery_info().await.unwrap().unwrap();
        assert_eq!((info.server_id, info.heartbeat), (1, 77));
        assert_eq!(info.client_id, "a");

        let third = old.share(3, "a");
        third.set(&Position::at("mysql-bin.000001", 4).with_heartbeat(1)).await.unwrap();
        assert!(current.recovery_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_other_client_position_prefers_latest_heartbeat() {
        let a = MemoryPositionStore::new(1, "a");
        assert!(a.other_client_position().await.unwrap().is_none());

        a.set(&Position::at("mysql-bin.000009", 4).with_heartbeat(900)).await.unwrap();
        assert!(a.other_client_position().await.unwrap().is_none());

        let b = a.share(1, "b");
        let c = a.share(1, "c");
        let other_server = a.share(2, "d");
        b.set(&Position::at("mysql-bin.000002", 4).with_heartbeat(10)).await.unwrap();
        c.set(&Position::at("mysql-bin.000001", 4).with_heartbeat(20)).await.unwrap();
        other_server.set(&Position::at("mysql-bin.000007", 4).with_heartbeat(99)).await.unwrap();

        let found = a.other_client_position().await.unwrap().unwrap();
        assert_eq!(found.file(), "mysql-bin.000001");
        assert_eq!(found.last_heartbeat, Some(20));
    }

    #[tokio::test]
    async fn test_delete_foreign_and_delete() {
        let a1 = MemoryPositionStore::new(1, "a");
        let a2 = a1.share(2, "a");
        let b1 = a1.share(1, "b");
        for store in [&a1, &a2, &b1] {
            store.set(&Position::at("mysql-bin.000001", 4)).await.unwrap();
        }
        assert_eq!(a2.delete_foreign_positions(2).await.unwrap(), 1);
        assert!(a1.get().await.unwrap().is_none());
        assert!(b1.get().await.unwrap().is_some());
        assert_eq!(a2.delete(2).await.unwrap(), 1);
        assert_eq!(a2.delete(2).await.unwrap(), 0);
    }
}
