//! CDC 엔진 - 시작 위치 결정과 실행 구성
//!
//! 엔진은 다음 순서로 진행됩니다:
//! 1. 시작 위치 결정 (저장된 위치 → 마스터 교체 복구 → 다른 client 위치 → 현재 마스터 위치)
//! 2. 스키마 복원, 위치 저장 태스크 시작
//! 3. Replicator 실행, 종료 시 마지막 위치 저장

use crate::codec::ColumnCodec;
use crate::config::CdcConfig;
use crate::error::Result;
use crate::filter::Filter;
use crate::heartbeat::HeartbeatMonitor;
use crate::offset::Position;
use crate::position_store::{PositionFlusher, PositionStore, PositionTracker};
use crate::producer::{Producer, ProducerContext};
use crate::recovery::Recovery;
use crate::replicator::Replicator;
use crate::schema::{CaseSensitivity, DdlResolver, SchemaCapturer, SchemaRepository, SchemaStore};
use crate::source::SourceConnector;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// 엔진이 쓰는 외부 구성 요소 묶음
pub struct EngineParts {
    pub connector: Arc<dyn SourceConnector>,
    pub position_store: Arc<dyn PositionStore>,
    pub schema_repository: Arc<dyn SchemaRepository>,
    pub capturer: Arc<dyn SchemaCapturer>,
    pub resolver: Arc<dyn DdlResolver>,
    pub codec: Arc<dyn ColumnCodec>,
    pub producer: Box<dyn Producer>,
}

/// 실행 중인 엔진에 정지를 요청하는 핸들
#[derive(Debug, Clone)]
pub struct EngineStopHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl EngineStopHandle {
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }
}

/// MySQL CDC 엔진
pub struct CdcEngine {
    config: CdcConfig,
    parts: EngineParts,
    filter: Arc<Filter>,
    heartbeats: Arc<HeartbeatMonitor>,
    sensitivity: CaseSensitivity,
    stop: Arc<watch::Sender<bool>>,
}

impl CdcEngine {
    pub fn new(config: CdcConfig, parts: EngineParts) -> Result<Self> {
        let filter = Arc::new(Filter::new(&config.filter)?);
        let (stop, _) = watch::channel(false);
        Ok(CdcEngine {
            config,
            parts,
            filter,
            heartbeats: Arc::new(HeartbeatMonitor::new()),
            sensitivity: CaseSensitivity::CaseSensitive,
            stop: Arc::new(stop),
        })
    }

    /// 원본 서버의 lower_case_table_names 에 맞춘 이름 비교
    pub fn with_case_sensitivity(mut self, sensitivity: CaseSensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn stop_handle(&self) -> EngineStopHandle {
        EngineStopHandle {
            stop: self.stop.clone(),
        }
    }

    pub fn heartbeats(&self) -> Arc<HeartbeatMonitor> {
        self.heartbeats.clone()
    }

    fn schema_store(&self, server_id: u64) -> SchemaStore {
        SchemaStore::new(
            server_id,
            self.parts.schema_repository.clone(),
            self.parts.capturer.clone(),
            self.parts.resolver.clone(),
            Some(self.filter.clone()),
            self.config.schema_store.clone(),
        )
    }

    /// 시작 위치 결정. 저장소에서 오지 않은 위치는 바로 저장해 둠
    pub async fn initial_position(&self, schema_store: &mut SchemaStore) -> Result<Position> {
        let store = &self.parts.position_store;

        if let Some(position) = store.get().await? {
            info!("Resuming from stored position {}", position);
            return self.finish_initial_position(schema_store, position, false).await;
        }

        if self.config.recover {
            if let Some(position) = self.attempt_recovery(schema_store).await? {
                return self.finish_initial_position(schema_store, position, true).await;
            }
        }

        if let Some(other) = store.other_client_position().await? {
            info!("Found previous client position {}", other);
            // 하트비트는 그 client 의 값이라 가져오지 않음
            let position = Position::new(other.binlog, None);
            return self.finish_initial_position(schema_store, position, true).await;
        }

        let binlog = self.parts.connector.current_position().await?;
        let position = Position::new(binlog, None);
        info!("No stored position, starting at current master position {}", position);
        self.finish_initial_position(schema_store, position, true).await
    }

    async fn finish_initial_position(
        &self,
        schema_store: &SchemaStore,
        position: Position,
        store_it: bool,
    ) -> Result<Position> {
        if store_it {
            self.parts.position_store.set(&position).await?;
        }
        schema_store.handle_topology_change().await?;
        let deleted = self
            .parts
            .position_store
            .delete_foreign_positions(schema_store.server_id())
            .await?;
        if deleted > 0 {
            warn!("Removed {} positions stored under other server ids", deleted);
        }
        Ok(position)
    }

    /// 복구할 위치 행이 없으면 None. 찾을 수 없는 하트비트는 시작 실패
    async fn attempt_recovery(&self, schema_store: &mut SchemaStore) -> Result<Option<Position>> {
        let Some(info) = self.parts.position_store.recovery_info().await? else {
            return Ok(None);
        };

        let recovery = Recovery::new(
            self.parts.connector.clone(),
            self.config.replicator.meta_database.clone(),
            self.config.replicator.client_id.clone(),
            self.sensitivity,
        );
        let recovered = recovery.recover(&info).await?;

        schema_store
            .clone_from_server(info.server_id, &info.position, recovered.clone())
            .await?;
        self.parts.position_store.delete(info.server_id).await?;
        info!(
            "Recovered from server {} position {} to {}",
            info.server_id, info.position, recovered
        );
        Ok(Some(recovered))
    }

    /// 정지 요청, EOF, 또는 치명적 에러까지 실행
    pub async fn run(mut self) -> Result<()> {
        let server_id = self.parts.connector.server_id().await?;
        let mut schema_store = self.schema_store(server_id);
        let initial = self.initial_position(&mut schema_store).await?;
        info!(
            "mysql_cdc is booting (client {}), starting at {}",
            self.config.replicator.client_id, initial
        );

        let source = self.parts.connector.open(&initial.binlog, false).await?;
        let mut replicator = Replicator::new(
            self.config.replicator.clone(),
            source,
            schema_store,
            self.parts.codec.clone(),
            self.heartbeats.clone(),
            initial.clone(),
        )?
        .with_filter(self.filter.clone());
        replicator.start().await?;

        let tracker = Arc::new(PositionTracker::new(Some(initial)));
        let ctx = ProducerContext::new(tracker.clone(), self.config.producer_failure);
        let mut flusher = PositionFlusher::spawn(
            self.parts.position_store.clone(),
            tracker.clone(),
            self.config.position_store.clone(),
        );

        let replicator_stop = replicator.stop_handle();
        let mut stop_rx = self.stop.subscribe();
        if *stop_rx.borrow_and_update() {
            replicator_stop.request_stop();
        }
        let producer = self.parts.producer.as_mut();
        let result = {
            let run = replicator.run(producer, &ctx);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    result = &mut run => break result,
                    e = flusher.failure() => break Err(e),
                    Ok(()) = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            replicator_stop.request_stop();
                        }
                    }
                }
            }
        };

        let flushed = flusher.shutdown().await;
        match (result, flushed) {
            (Err(e), _) | (Ok(()), Err(e)) => {
                error!("Fatal error: {}", e);
                match tracker.stored_position() {
                    Some(position) => error!("Last safe position: {}", position),
                    None => error!("No position was stored"),
                }
                Err(e)
            }
            (Ok(()), Ok(())) => {
                info!("mysql_cdc stopped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultColumnCodec;
    use crate::error::CdcError;
    use crate::connection::ConnectionConfig;
    use crate::position_store::MemoryPositionStore;
    use crate::producer::BufferedProducer;
    use crate::schema::{MemorySchemaRepository, SavedSchema, StaticDdlResolver, StaticSchemaCapturer};
    use crate::source::MemorySourceConnector;
    use crate::test_support::*;
    use std::time::Duration;

    fn config(recover: bool) -> CdcConfig {
        let mut config = CdcConfig::new(ConnectionConfig::default(), "test");
        config.replicator.meta_database = META_DB.to_string();
        config.replicator.poll_timeout = Duration::from_millis(1);
        config.position_store.flush_interval = Duration::from_millis(5);
        config.recover = recover;
        config
    }

    fn parts(
        connector: MemorySourceConnector,
        positions: MemoryPositionStore,
        repository: MemorySchemaRepository,
        producer: BufferedProducer,
    ) -> EngineParts {
        EngineParts {
            connector: Arc::new(connector),
            position_store: Arc::new(positions),
            schema_repository: Arc::new(repository),
            capturer: Arc::new(StaticSchemaCapturer::new(schema_with(vec![simple_table("shop", "t")]))),
            resolver: Arc::new(StaticDdlResolver::new()),
            codec: Arc::new(DefaultColumnCodec),
            producer: Box::new(producer),
        }
    }

    fn stream() -> Vec<crate::events::BinlogEvent> {
        EventScript::new(FILE)
            .insert_tx(10, "shop", "t", 1, "a", 1)
            .insert_tx(10, "shop", "t", 2, "b", 2)
            .into_events()
    }

    #[tokio::test]
    async fn test_run_from_stored_position_stores_final_position() {
        let events = stream();
        let second_tx_start = events[4].position.offset;
        let end = events.last().unwrap().next_position.offset;

        let positions = MemoryPositionStore::new(SERVER_ID, "test");
        positions.set(&Position::at(FILE, second_tx_start)).await.unwrap();
        let producer = BufferedProducer::new();

        let engine = CdcEngine::new(
            config(false),
            parts(
                MemorySourceConnector::with_events(SERVER_ID, events),
                positions.clone(),
                MemorySchemaRepository::new(),
                producer.clone(),
            ),
        )
        .unwrap();
        engine.run().await.unwrap();

        let rows = producer.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data().unwrap()["id"], 2);
        assert_eq!(positions.get().await.unwrap().unwrap().offset(), end);
    }

    #[tokio::test]
    async fn test_fresh_start_uses_master_position() {
        let positions = MemoryPositionStore::new(SERVER_ID, "test");
        let engine = CdcEngine::new(
            config(false),
            parts(
                MemorySourceConnector::with_events(SERVER_ID, stream()),
                positions.clone(),
                MemorySchemaRepository::new(),
                BufferedProducer::new(),
            ),
        )
        .unwrap();

        let mut store = engine.schema_store(SERVER_ID);
        let initial = engine.initial_position(&mut store).await.unwrap();
        let master = engine.parts.connector.current_position().await.unwrap();
        assert_eq!(initial.binlog, master);
        assert_eq!(positions.get().await.unwrap(), Some(initial));
    }

    #[tokio::test]
    async fn test_recovery_after_master_swap() {
        let new_server = 2;
        let events = EventScript::new(FILE)
            .insert_tx(10, "shop", "t", 1, "a", 1)
            .heartbeat(50, "test", 777)
            .insert_tx(10, "shop", "t", 2, "b", 2)
            .into_events();
        let after_heartbeat = events[7].next_position.offset;

        // 이전 서버(1)에 하트비트 777 까지 읽은 위치와 스키마가 저장돼 있음
        let old_store = MemoryPositionStore::new(SERVER_ID, "test");
        let old_position = Position::at("old-bin.000003", 900).with_heartbeat(777);
        old_store.set(&old_position).await.unwrap();
        let repository = MemorySchemaRepository::new();
        repository
            .save(&SavedSchema::new(
                SERVER_ID,
                Position::at("old-bin.000001", 4),
                schema_with(vec![simple_table("shop", "t")]),
            ))
            .await
            .unwrap();

        let positions = old_store.share(new_server, "test");
        let producer = BufferedProducer::new();
        let engine = CdcEngine::new(
            config(true),
            parts(
                MemorySourceConnector::with_events(new_server, events),
                positions.clone(),
                repository.clone(),
                producer.clone(),
            ),
        )
        .unwrap();
        engine.run().await.unwrap();

        let rows = producer.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data().unwrap()["id"], 2);
        assert!(rows[0].position.offset() > after_heartbeat);
        assert!(old_store.get().await.unwrap().is_none());
        assert!(repository.live_count() >= 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_master_swap_fails_startup() {
        let new_server = 2;
        let old_store = MemoryPositionStore::new(SERVER_ID, "test");
        let old_position = Position::at("old-bin.000003", 900).with_heartbeat(999_999);
        old_store.set(&old_position).await.unwrap();

        let positions = old_store.share(new_server, "test");
        let producer = BufferedProducer::new();
        let engine = CdcEngine::new(
            config(true),
            parts(
                MemorySourceConnector::with_events(new_server, stream()),
                positions.clone(),
                MemorySchemaRepository::new(),
                producer.clone(),
            ),
        )
        .unwrap();

        let mut store = engine.schema_store(new_server);
        let err = engine.initial_position(&mut store).await.unwrap_err();
        assert!(matches!(err, CdcError::RecoveryImpossible { .. }));
        assert!(positions.get().await.unwrap().is_none());
        assert_eq!(old_store.get().await.unwrap(), Some(old_position));

        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, CdcError::RecoveryImpossible { .. }));
        assert!(producer.is_empty());
    }

    #[tokio::test]
    async fn test_new_client_starts_at_other_client_position() {
        let events = stream();
        let second_tx_start = events[4].position.offset;

        let other = MemoryPositionStore::new(SERVER_ID, "other");
        other
            .set(&Position::at(FILE, second_tx_start).with_heartbeat(42))
            .await
            .unwrap();
        let positions = other.share(SERVER_ID, "test");
        let engine = CdcEngine::new(
            config(false),
            parts(
                MemorySourceConnector::with_events(SERVER_ID, events),
                positions.clone(),
                MemorySchemaRepository::new(),
                BufferedProducer::new(),
            ),
        )
        .unwrap();

        let mut store = engine.schema_store(SERVER_ID);
        let initial = engine.initial_position(&mut store).await.unwrap();
        assert_eq!(initial.binlog, Position::at(FILE, second_tx_start).binlog);
        assert_eq!(initial.last_heartbeat, None);
        assert_eq!(positions.get().await.unwrap(), Some(initial));
        // 다른 client 의 행은 그대로
        assert!(other.get().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stop_handle_stops_idle_engine() {
        let mut connector = MemorySourceConnector::new(SERVER_ID);
        connector.push_events(stream());
        let engine = CdcEngine::new(
            config(false),
            parts(
                connector,
                MemoryPositionStore::new(SERVER_ID, "test"),
                MemorySchemaRepository::new(),
                BufferedProducer::new(),
            ),
        )
        .unwrap();
        let stop = engine.stop_handle();
        stop.request_stop();
        tokio::time::timeout(Duration::from_secs(2), engine.run())
            .await
            .unwrap()
            .unwrap();
    }
}
