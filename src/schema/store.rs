//! 버전 관리되는 스키마 저장소
//!
//! 실행 중에는 Replicator 가 단독으로 소유합니다. GC 는 저장 직후에만 돌고
//! 복원과 동시에 실행되지 않습니다.

use super::capture::SchemaCapturer;
use super::change::SchemaChange;
use super::model::Schema;
use super::repository::{SavedSchema, SchemaRepository};
use super::resolver::DdlResolver;
use crate::error::{CdcError, Result};
use crate::filter::Filter;
use crate::offset::Position;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 스키마 저장소 설정
#[derive(Debug, Clone)]
pub struct SchemaStoreConfig {
    /// 저장 후 최근 N 개 버전만 남김 (None 이면 GC 안 함)
    pub keep_last_n: Option<usize>,
    /// scavenge 한 번에 지우는 최대 행 수
    pub scavenge_batch_size: usize,
    /// 복원할 버전이 없으면 capture + save 로 시작
    pub bootstrap_if_missing: bool,
}

impl Default for SchemaStoreConfig {
    fn default() -> Self {
        SchemaStoreConfig {
            keep_last_n: None,
            scavenge_batch_size: 500,
            bootstrap_if_missing: true,
        }
    }
}

pub struct SchemaStore {
    server_id: u64,
    repository: Arc<dyn SchemaRepository>,
    capturer: Arc<dyn SchemaCapturer>,
    resolver: Arc<dyn DdlResolver>,
    filter: Option<Arc<Filter>>,
    config: SchemaStoreConfig,
    current: Option<SavedSchema>,
}

impl SchemaStore {
    pub fn new(
        server_id: u64,
        repository: Arc<dyn SchemaRepository>,
        capturer: Arc<dyn SchemaCapturer>,
        resolver: Arc<dyn DdlResolver>,
        filter: Option<Arc<Filter>>,
        config: SchemaStoreConfig,
    ) -> Self {
        SchemaStore {
            server_id,
            repository,
            capturer,
            resolver,
            filter,
            config,
            current: None,
        }
    }

    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    pub fn current(&self) -> Option<&SavedSchema> {
        self.current.as_ref()
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.current.as_ref().map(|s| &s.schema)
    }

    pub fn schema_id(&self) -> Option<u64> {
        self.current.as_ref().and_then(|s| s.schema_id)
    }

    pub fn position(&self) -> Option<&Position> {
        self.current.as_ref().map(|s| &s.position)
    }

    /// 원본 DB 의 현재 구조
    pub async fn capture(&self) -> Result<Schema> {
        self.capturer.capture().await
    }

    /// target 이하에서 활성화된 가장 최근 버전. 없으면 Ok(None)
    pub async fn restore(&self, target: &Position) -> Result<Option<SavedSchema>> {
        match self.repository.find_schema_id(self.server_id, target).await? {
            Some(id) => self.repository.load(id).await,
            None => Ok(None),
        }
    }

    pub async fn restore_required(&self, target: &Position) -> Result<SavedSchema> {
        self.restore(target)
            .await?
            .ok_or_else(|| CdcError::SchemaNotFound {
                server_id: self.server_id,
                position: target.to_string(),
            })
    }

    /// 시작 위치에 맞는 스키마 적재. 없으면 설정에 따라 부트스트랩
    pub async fn initialize(&mut self, position: &Position) -> Result<&SavedSchema> {
        match self.restore(position).await? {
            Some(saved) => {
                info!(
                    "Restored schema {:?} (active from {}) for {}",
                    saved.schema_id, saved.position, position
                );
                self.current = Some(saved);
            }
            None if self.config.bootstrap_if_missing => {
                info!("No stored schema for {}, capturing live schema", position);
                let schema = self.capture().await?;
                self.save(schema, position.clone()).await?;
            }
            None => {
                return Err(CdcError::SchemaNotFound {
                    server_id: self.server_id,
                    position: position.to_string(),
                })
            }
        }

        self.current.as_ref().ok_or_else(|| {
            CdcError::Other("Schema store has no current schema after initialize".to_string())
        })
    }

    /// 새 스냅샷 저장 후 현재 버전으로 설정
    pub async fn save(&mut self, schema: Schema, position: Position) -> Result<u64> {
        let mut saved = SavedSchema::new(self.server_id, position, schema);
        let schema_id = self.repository.save(&saved).await?;
        saved.schema_id = Some(schema_id);
        debug!("Schema {} active from {}", schema_id, saved.position);
        self.current = Some(saved);

        if let Some(keep) = self.config.keep_last_n {
            self.garbage_collect(keep).await?;
        }
        Ok(schema_id)
    }

    /// 입력을 바꾸지 않는 순수 적용
    pub fn apply_change(schema: &Schema, change: &SchemaChange) -> Result<Schema> {
        change.apply(schema)
    }

    /// DDL 문장을 해석, 적용하고 position 에서 활성화되는 새 버전 저장
    ///
    /// 반환값은 실제로 적용된 (블랙리스트가 아닌) 변경 목록입니다.
    pub async fn process_sql(
        &mut self,
        sql: &str,
        database: &str,
        position: &Position,
    ) -> Result<Vec<SchemaChange>> {
        let current = self
            .schema()
            .cloned()
            .ok_or_else(|| CdcError::Other("Schema store is not initialized".to_string()))?;

        let changes = self.resolver.resolve(sql, database, &current)?;
        if changes.is_empty() {
            return Ok(changes);
        }

        let mut schema = current;
        let mut applied = Vec::with_capacity(changes.len());
        for change in changes {
            if self.filter.as_ref().is_some_and(|f| change.is_blacklisted(f)) {
                debug!("Skipping blacklisted {} on {}", change.kind(), change.database());
                continue;
            }
            schema = Self::apply_change(&schema, &change)?;
            applied.push(change);
        }

        if !applied.is_empty() {
            self.save(schema, position.clone()).await?;
        }
        Ok(applied)
    }

    /// 최근 keep_last_n 개보다 오래된 버전 삭제
    pub async fn garbage_collect(&self, keep_last_n: usize) -> Result<usize> {
        let deleted = self
            .repository
            .soft_delete_older_than(self.server_id, keep_last_n)
            .await?;
        if deleted > 0 {
            let removed = self
                .repository
                .scavenge(self.config.scavenge_batch_size)
                .await?;
            debug!("Schema GC marked {} versions, removed {} rows", deleted, removed);
        }
        Ok(deleted)
    }

    /// 다른 server_id 로 저장된 버전 정리 (마스터가 바뀐 경우)
    pub async fn handle_topology_change(&self) -> Result<usize> {
        let deleted = self.repository.soft_delete_foreign(self.server_id).await?;
        if deleted > 0 {
            warn!(
                "Master identity changed, removed {} schema versions of other servers",
                deleted
            );
        }
        Ok(deleted)
    }

    /// 장애 조치 후: 이전 서버의 스키마를 현재 server_id 로 복사
    pub async fn clone_from_server(
        &mut self,
        from_server_id: u64,
        from_position: &Position,
        to_position: Position,
    ) -> Result<u64> {
        let schema_id = self
            .repository
            .find_schema_id(from_server_id, from_position)
            .await?;
        let source = match schema_id {
            Some(id) => self.repository.load(id).await?,
            None => None,
        }
        .ok_or_else(|| CdcError::SchemaNotFound {
            server_id: from_server_id,
            position: from_position.to_string(),
        })?;

        info!(
            "Cloning schema {:?} of server {} to server {} at {}",
            source.schema_id, from_server_id, self.server_id, to_position
        );
        self.save(source.schema, to_position).await
    }
}
