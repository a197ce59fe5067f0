/// mysql_cdc 실행 파일
///
/// 설정은 환경 변수(`CDC_*`)에서 읽습니다. `CDC_REPLAY_FILE` 이 있으면 그 파일의
/// 디코딩된 이벤트를 메모리 저장소로 재생하고, 없으면 MySQL 메타 DB 에 위치와
/// 스키마를 저장합니다.
use mysql_cdc::cdc_engine::{CdcEngine, EngineParts};
use mysql_cdc::codec::DefaultColumnCodec;
use mysql_cdc::config::CdcConfig;
use mysql_cdc::connection::MysqlSourceConnector;
use mysql_cdc::error::{CdcError, Result};
use mysql_cdc::filter::Filter;
use mysql_cdc::position_store::{MemoryPositionStore, MysqlPositionStore, PositionStore};
use mysql_cdc::producer::StdoutProducer;
use mysql_cdc::schema::{
    CaseSensitivity, DdlResolver, MemorySchemaRepository, MysqlSchemaCapturer, MysqlSchemaRepository,
    Schema, StaticDdlResolver, StaticSchemaCapturer,
};
use mysql_cdc::source::{MemorySourceConnector, SourceConnector};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 재생 파일 이벤트의 원본 server_id
const REPLAY_SERVER_ID: u64 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("mysql_cdc exiting: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<()> {
    let config = CdcConfig::from_env()?;

    let resolver: Arc<dyn DdlResolver> = match &config.ddl_file {
        Some(path) => {
            let resolver = StaticDdlResolver::from_json_file(path)?;
            info!("Loaded {} DDL mappings from {}", resolver.len(), path.display());
            Arc::new(resolver)
        }
        None => Arc::new(StaticDdlResolver::new()),
    };
    let producer = Box::new(StdoutProducer::new(config.replicator.output.clone()));

    let engine = match config.replay_file.clone() {
        Some(path) => {
            info!("Replaying events from {}", path.display());
            let connector = MemorySourceConnector::from_json_lines(REPLAY_SERVER_ID, &path).await?;
            // 재생은 빈 스키마에서 시작해 파일의 DDL 로 쌓아 올림
            let capturer = Arc::new(StaticSchemaCapturer::new(Schema::new(
                Vec::new(),
                "utf8mb4",
                CaseSensitivity::CaseSensitive,
            )));
            let parts = EngineParts {
                connector: Arc::new(connector),
                position_store: Arc::new(MemoryPositionStore::new(
                    REPLAY_SERVER_ID,
                    config.replicator.client_id.clone(),
                )),
                schema_repository: Arc::new(MemorySchemaRepository::new()),
                capturer,
                resolver,
                codec: Arc::new(DefaultColumnCodec),
                producer,
            };
            CdcEngine::new(config, parts)?
        }
        None => {
            let connector = MysqlSourceConnector::new(config.connection.clone())?;
            connector.check_binlog_format().await?;
            let sensitivity = connector.case_sensitivity().await?;
            let server_id = connector.server_id().await?;
            let pool = connector.pool().clone();
            let meta = config.replicator.meta_database.clone();

            let positions = MysqlPositionStore::new(pool.clone(), meta.clone(), server_id, config.replicator.client_id.clone());
            positions.ensure_tables().await?;
            let schemas = MysqlSchemaRepository::new(pool.clone(), meta);
            schemas.ensure_tables().await?;
            let filter = Arc::new(Filter::new(&config.filter)?);

            let parts = EngineParts {
                connector: Arc::new(connector),
                position_store: Arc::new(positions) as Arc<dyn PositionStore>,
                schema_repository: Arc::new(schemas),
                capturer: Arc::new(MysqlSchemaCapturer::new(pool, Some(filter))),
                resolver,
                codec: Arc::new(DefaultColumnCodec),
                producer,
            };
            CdcEngine::new(config, parts)?.with_case_sensitivity(sensitivity)
        }
    };

    let stop = engine.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, stopping");
                stop.request_stop();
            }
            Err(e) => warn!("Unable to listen for shutdown signal: {}", e),
        }
    });

    engine.run().await.map_err(|e| match e {
        CdcError::DuplicateProcess { .. } => {
            error!("Another process is running with the same client id");
            e
        }
        e => e,
    })
}
