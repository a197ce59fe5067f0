//! 스키마 버전 영속화 경계
//!
//! 저장된 스냅샷은 불변입니다. 삭제는 `deleted` 표시(soft delete)로만 하고,
//! 실제 행 제거는 `scavenge` 가 배치 단위로 나중에 합니다.

use super::model::Schema;
use crate::error::Result;
use crate::offset::Position;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;

/// 저장 형식 버전
pub const SCHEMA_STORE_VERSION: u32 = 1;

/// 위치가 찍힌 스키마 스냅샷
#[derive(Debug, Clone, PartialEq)]
pub struct SavedSchema {
    /// 저장 전에는 None
    pub schema_id: Option<u64>,
    pub server_id: u64,
    /// 이 버전이 유효해지는 위치
    pub position: Position,
    pub schema: Schema,
    pub version: u32,
}

impl SavedSchema {
    pub fn new(server_id: u64, position: Position, schema: Schema) -> Self {
        SavedSchema {
            schema_id: None,
            server_id,
            position,
            schema,
            version: SCHEMA_STORE_VERSION,
        }
    }

    pub fn position_sha(&self) -> String {
        self.position.sha(self.server_id)
    }
}

/// activation 위치가 target 이하인지 (같은 binlog 위치면 하트비트로 비교)
pub fn activates_before(activation: &Position, target: &Position) -> bool {
    match activation.stream_cmp(target) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => activation.last_heartbeat.unwrap_or(0) <= target.last_heartbeat.unwrap_or(0),
    }
}

/// GTID 모드 비교. 둘 다 GTID 집합이 있을 때만 Some
pub fn gtid_activates_before(activation: &Position, target: &Position) -> Option<bool> {
    let activation_set = activation.binlog.parsed_gtid_set().ok().flatten()?;
    let target_set = target.binlog.parsed_gtid_set().ok().flatten()?;
    Some(activation_set.is_contained_within(&target_set))
}

/// 스키마 스냅샷 저장소
#[async_trait]
pub trait SchemaRepository: Send + Sync {
    /// 같은 position sha 가 이미 있으면 그 id 를 돌려줌
    async fn save(&self, saved: &SavedSchema) -> Result<u64>;

    /// activation ≤ target 인 가장 최근 버전
    async fn find_schema_id(&self, server_id: u64, target: &Position) -> Result<Option<u64>>;

    async fn load(&self, schema_id: u64) -> Result<Option<SavedSchema>>;

    /// 가장 최근 keep_last_n 개를 제외하고 삭제 표시
    async fn soft_delete_older_than(&self, server_id: u64, keep_last_n: usize) -> Result<usize>;

    /// 다른 server_id 의 버전 삭제 표시
    async fn soft_delete_foreign(&self, server_id: u64) -> Result<usize>;

    /// 삭제 표시된 행을 최대 batch_size 개까지 실제로 제거
    async fn scavenge(&self, batch_size: usize) -> Result<u64>;
}

#[derive(Debug, Clone)]
struct StoredSchema {
    saved: SavedSchema,
    sha: String,
    deleted: bool,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: u64,
    rows: Vec<StoredSchema>,
}

/// 프로세스 메모리에만 두는 저장소 (테스트, 리플레이, 복구 스캔용)
#[derive(Debug, Clone, Default)]
pub struct MemorySchemaRepository {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySchemaRepository {
    pub fn new() -> Self {
        MemorySchemaRepository::default()
    }

    /// 삭제 표시되지 않은 버전 수
    pub fn live_count(&self) -> usize {
        self.inner.lock().rows.iter().filter(|r| !r.deleted).count()
    }

    /// 물리적으로 남아 있는 행 수 (삭제 표시 포함)
    pub fn stored_count(&self) -> usize {
        self.inner.lock().rows.len()
    }
}

#[async_trait]
impl SchemaRepository for MemorySchemaRepository {
    async fn save(&self, saved: &SavedSchema) -> Result<u64> {
        let mut inner = self.inner.lock();
        let sha = saved.position_sha();
        if let Some(existing) = inner.rows.iter().find(|r| r.sha == sha && !r.deleted) {
            if let Some(id) = existing.saved.schema_id {
                return Ok(id);
            }
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let mut stored = saved.clone();
        stored.schema_id = Some(id);
        inner.rows.push(StoredSchema {
            saved: stored,
            sha,
            deleted: false,
        });
        Ok(id)
    }

    async fn find_schema_id(&self, server_id: u64, target: &Position) -> Result<Option<u64>> {
        let inner = self.inner.lock();
        let candidates = inner
            .rows
            .iter()
            .filter(|r| !r.deleted && r.saved.server_id == server_id);

        let mut best: Option<&StoredSchema> = None;
        for row in candidates {
            let eligible = gtid_activates_before(&row.saved.position, target)
                .unwrap_or_else(|| activates_before(&row.saved.position, target));
            if !eligible {
                continue;
            }
            best = match best {
                None => Some(row),
                Some(current) => {
                    let newer = match row.saved.position.stream_cmp(&current.saved.position) {
                        Ordering::Greater => true,
                        Ordering::Less => false,
                        Ordering::Equal => row.saved.schema_id > current.saved.schema_id,
                    };
                    if newer {
                        Some(row)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        Ok(best.and_then(|r| r.saved.schema_id))
    }

    async fn load(&self, schema_id: u64) -> Result<Option<SavedSchema>> {
        let inner = self.inner.lock();
        Ok(inner
            .rows
            .iter()
            .find(|r| r.saved.schema_id == Some(schema_id) && !r.deleted)
            .map(|r| r.saved.clone()))
    }

    async fn soft_delete_older_than(&self, server_id: u64, keep_last_n: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut ids: Vec<u64> = inner
            .rows
            .iter()
            .filter(|r| !r.deleted && r.saved.server_id == server_id)
            .filter_map(|r| r.saved.schema_id)
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let doomed: Vec<u64> = ids.into_iter().skip(keep_last_n.max(1)).collect();

        for row in inner.rows.iter_mut() {
            if row.saved.schema_id.is_some_and(|id| doomed.contains(&id)) {
                row.deleted = true;
            }
        }
        Ok(doomed.len())
    }

    async fn soft_delete_foreign(&self, server_id: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut count = 0;
        for row in inner.rows.iter_mut() {
            if !row.deleted && row.saved.server_id != server_id {
                row.deleted = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn scavenge(&self, batch_size: usize) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut removed = 0u64;
        inner.rows.retain(|r| {
            if r.deleted && (removed as usize) < batch_size {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn saved(server_id: u64, file: &str, offset: u64) -> SavedSchema {
        SavedSchema::new(server_id, Position::at(file, offset), Schema::default())
    }

    #[test]
    fn test_activates_before() {
        let a = Position::at("mysql-bin.000001", 100);
        assert!(activates_before(&a, &Position::at("mysql-bin.000001", 100)));
        assert!(activates_before(&a, &Position::at("mysql-bin.000002", 4)));
        assert!(!activates_before(&a, &Position::at("mysql-bin.000001", 99)));
        assert!(!activates_before(&a.with_heartbeat(5), &a.with_heartbeat(4)));
    }

    #[tokio::test]
    async fn test_save_dedups_by_position() {
        let repo = MemorySchemaRepository::new();
        let first = assert_ok!(repo.save(&saved(1, "mysql-bin.000001", 100)).await);
        let again = assert_ok!(repo.save(&saved(1, "mysql-bin.000001", 100)).await);
        let other = assert_ok!(repo.save(&saved(1, "mysql-bin.000001", 200)).await);
        assert_eq!(first, again);
        assert!(other > first);
        assert_eq!(repo.live_count(), 2);
    }

    #[tokio::test]
    async fn test_find_greatest_not_after_target() {
        let repo = MemorySchemaRepository::new();
        let a = repo.save(&saved(1, "mysql-bin.000001", 100)).await.unwrap();
        let b = repo.save(&saved(1, "mysql-bin.000002", 50)).await.unwrap();
        repo.save(&saved(2, "mysql-bin.000002", 60)).await.unwrap();

        let at = |f: &str, o: u64| Position::at(f, o);
        assert_eq!(repo.find_schema_id(1, &at("mysql-bin.000001", 99)).await.unwrap(), None);
        assert_eq!(repo.find_schema_id(1, &at("mysql-bin.000001", 100)).await.unwrap(), Some(a));
        assert_eq!(repo.find_schema_id(1, &at("mysql-bin.000002", 49)).await.unwrap(), Some(a));
        assert_eq!(repo.find_schema_id(1, &at("mysql-bin.000009", 4)).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn test_find_by_gtid_containment() {
        let uuid = "550e8400-e29b-41d4-a716-446655440000";
        let repo = MemorySchemaRepository::new();
        let mut s = saved(1, "mysql-bin.000001", 100);
        s.position.binlog = s.position.binlog.with_gtid_set(format!("{}:1-10", uuid));
        let id = repo.save(&s).await.unwrap();

        let mut target = Position::at("mysql-bin.000001", 50);
        target.binlog = target.binlog.with_gtid_set(format!("{}:1-12", uuid));
        // GTID 포함 관계가 파일 오프셋보다 우선
        assert_eq!(repo.find_schema_id(1, &target).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_gc_and_scavenge() {
        let repo = MemorySchemaRepository::new();
        for offset in [100, 200, 300, 400] {
            repo.save(&saved(1, "mysql-bin.000001", offset)).await.unwrap();
        }
        assert_eq!(repo.soft_delete_older_than(1, 2).await.unwrap(), 2);
        assert_eq!(repo.live_count(), 2);
        assert_eq!(repo.stored_count(), 4);

        assert_eq!(repo.scavenge(1).await.unwrap(), 1);
        assert_eq!(repo.scavenge(10).await.unwrap(), 1);
        assert_eq!(repo.stored_count(), 2);

        let latest = repo
            .find_schema_id(1, &Position::at("mysql-bin.000002", 4))
            .await
            .unwrap();
        assert_eq!(latest, Some(4));
    }

    #[tokio::test]
    async fn test_soft_delete_foreign() {
        let repo = MemorySchemaRepository::new();
        repo.save(&saved(1, "mysql-bin.000001", 100)).await.unwrap();
        repo.save(&saved(2, "mysql-bin.000001", 100)).await.unwrap();
        assert_eq!(repo.soft_delete_foreign(2).await.unwrap(), 1);
        assert_eq!(
            repo.find_schema_id(1, &Position::at("mysql-bin.000002", 4)).await.unwrap(),
            None
        );
    }
}
