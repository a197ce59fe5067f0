//! 엔진 설정
//!
//! 모든 설정은 `Default` 를 가진 일반 구조체이고, 바이너리는 환경 변수에서
//! `CdcConfig::from_env` 로 읽어 들입니다.

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::filter::FilterConfig;
use crate::schema::SchemaStoreConfig;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 기본 메타 데이터베이스 이름
pub const DEFAULT_META_DATABASE: &str = "cdc_meta";

/// 트랜잭션 버퍼가 메모리에 들고 있는 최대 행 수
pub const DEFAULT_MAX_TX_ELEMENTS: usize = 10_000;

/// 출력 JSON 에 포함할 필드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub include_xid: bool,
    pub include_commit_info: bool,
    pub include_position: bool,
    pub include_server_id: bool,
    pub include_thread_id: bool,
    pub include_schema_id: bool,
    pub include_row_query: bool,
    pub include_primary_key: bool,
    /// false 면 NULL 컬럼을 data 에서 생략
    pub include_nulls: bool,
    /// DDL 이벤트를 producer 로 내보낼지
    pub output_ddl: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            include_xid: true,
            include_commit_info: true,
            include_position: false,
            include_server_id: false,
            include_thread_id: false,
            include_schema_id: false,
            include_row_query: false,
            include_primary_key: false,
            include_nulls: true,
            output_ddl: false,
        }
    }
}

/// 컬럼 값 변환 실패 시 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CastFailurePolicy {
    /// 실행 중단
    #[default]
    Abort,
    /// 로그 남기고 해당 행만 버림
    SkipRow,
}

/// producer 전송 실패 시 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProducerFailurePolicy {
    #[default]
    Terminate,
    LogAndContinue,
}

#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub client_id: String,
    pub meta_database: String,
    pub max_tx_elements: usize,
    pub output: OutputConfig,
    pub cast_failure: CastFailurePolicy,
    /// 해석/적용 실패한 DDL 을 건너뛸지 (기본은 중단)
    pub skip_ddl_errors: bool,
    /// 스키마에 없는 테이블의 행을 무시할지
    pub ignore_missing_schema: bool,
    /// 이 하트비트를 읽으면 run 종료
    pub stop_at_heartbeat: Option<i64>,
    pub poll_timeout: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        ReplicatorConfig {
            client_id: "cdc".to_string(),
            meta_database: DEFAULT_META_DATABASE.to_string(),
            max_tx_elements: DEFAULT_MAX_TX_ELEMENTS,
            output: OutputConfig::default(),
            cast_failure: CastFailurePolicy::default(),
            skip_ddl_errors: false,
            ignore_missing_schema: false,
            stop_at_heartbeat: None,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

impl ReplicatorConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        ReplicatorConfig {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn with_meta_database(mut self, meta_database: impl Into<String>) -> Self {
        self.meta_database = meta_database.into();
        self
    }

    pub fn with_max_tx_elements(mut self, max_tx_elements: usize) -> Self {
        self.max_tx_elements = max_tx_elements;
        self
    }

    pub fn with_output(mut self, output: OutputConfig) -> Self {
        self.output = output;
        self
    }
}

/// 위치 저장 주기와 하트비트 조건
#[derive(Debug, Clone)]
pub struct PositionStoreConfig {
    pub flush_interval: Duration,
    pub heartbeat_interval: Duration,
    /// 마지막 하트비트 이후 오프셋이 이만큼 넘게 움직이면 하트비트
    pub heartbeat_offset_delta: u64,
}

impl Default for PositionStoreConfig {
    fn default() -> Self {
        PositionStoreConfig {
            flush_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_offset_delta: 3000,
        }
    }
}

/// 전체 설정
#[derive(Debug, Clone, Default)]
pub struct CdcConfig {
    pub connection: ConnectionConfig,
    pub replicator: ReplicatorConfig,
    pub position_store: PositionStoreConfig,
    pub schema_store: SchemaStoreConfig,
    pub filter: FilterConfig,
    pub producer_failure: ProducerFailurePolicy,
    /// 저장된 위치가 없을 때 다른 서버의 위치로부터 복구 시도
    pub recover: bool,
    /// JSON lines 이벤트 파일 (설정되면 MySQL 대신 이 파일을 재생)
    pub replay_file: Option<PathBuf>,
    /// 리플레이용 SQL → 스키마 변경 매핑 파일
    pub ddl_file: Option<PathBuf>,
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_list(name: &str) -> Vec<String> {
    env_string(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CdcError::Config(format!("Invalid value for {}: {}", name, raw))),
        None => Ok(None),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    match env_string(name) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(CdcError::Config(format!("Invalid boolean for {}: {}", name, raw))),
        },
        None => Ok(None),
    }
}

impl CdcConfig {
    pub fn new(connection: ConnectionConfig, client_id: impl Into<String>) -> Self {
        CdcConfig {
            connection,
            replicator: ReplicatorConfig::new(client_id),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filter = filter;
        self
    }

    /// 환경 변수에서 설정 읽기 (없는 값은 기본값)
    pub fn from_env() -> Result<Self> {
        let mut config = CdcConfig::default();

        let connection = &mut config.connection;
        if let Some(host) = env_string("CDC_HOST") {
            connection.hostname = host;
        }
        if let Some(port) = env_parse("CDC_PORT")? {
            connection.port = port;
        }
        if let Some(user) = env_string("CDC_USER") {
            connection.username = user;
        }
        if let Some(password) = env_string("CDC_PASSWORD") {
            connection.password = password;
        }
        if let Some(server_id) = env_parse("CDC_REPLICA_SERVER_ID")? {
            connection.server_id = server_id;
        }

        let replicator = &mut config.replicator;
        if let Some(client_id) = env_string("CDC_CLIENT_ID") {
            replicator.client_id = client_id;
        }
        if let Some(meta) = env_string("CDC_META_DATABASE") {
            replicator.meta_database = meta;
        }
        if let Some(max) = env_parse::<usize>("CDC_MAX_TX_ELEMENTS")? {
            replicator.max_tx_elements = max.max(1);
        }
        if let Some(output_ddl) = env_bool("CDC_OUTPUT_DDL")? {
            replicator.output.output_ddl = output_ddl;
        }
        if let Some(skip) = env_bool("CDC_SKIP_DDL_ERRORS")? {
            replicator.skip_ddl_errors = skip;
        }
        if let Some(ignore) = env_bool("CDC_IGNORE_MISSING_SCHEMA")? {
            replicator.ignore_missing_schema = ignore;
        }
        if let Some(skip_rows) = env_bool("CDC_SKIP_CAST_ERRORS")? {
            replicator.cast_failure = if skip_rows {
                CastFailurePolicy::SkipRow
            } else {
                CastFailurePolicy::Abort
            };
        }

        if let Some(keep) = env_parse("CDC_SCHEMA_KEEP_LAST")? {
            config.schema_store.keep_last_n = Some(keep);
        }
        if let Some(ms) = env_parse::<u64>("CDC_HEARTBEAT_INTERVAL_MS")? {
            config.position_store.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(continue_on_error) = env_bool("CDC_IGNORE_PRODUCER_ERRORS")? {
            config.producer_failure = if continue_on_error {
                ProducerFailurePolicy::LogAndContinue
            } else {
                ProducerFailurePolicy::Terminate
            };
        }

        config.filter = FilterConfig {
            include_databases: env_list("CDC_INCLUDE_DBS"),
            exclude_databases: env_list("CDC_EXCLUDE_DBS"),
            include_tables: env_list("CDC_INCLUDE_TABLES"),
            exclude_tables: env_list("CDC_EXCLUDE_TABLES"),
            blacklist: env_list("CDC_BLACKLIST"),
            include_column_values: env_list("CDC_INCLUDE_COLUMN_VALUES"),
        };

        config.recover = env_bool("CDC_RECOVER")?.unwrap_or(false);
        config.replay_file = env_string("CDC_REPLAY_FILE").map(PathBuf::from);
        config.ddl_file = env_string("CDC_DDL_FILE").map(PathBuf::from);

        Ok(config)
    }
}
