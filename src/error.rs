//! CDC 관련 에러 타입

use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("유효하지 않은 이벤트: {0}")]
    InvalidEvent(String),

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("설정 에러: {0}")]
    Config(String),

    /// 복원할 스키마 기준점이 없음 (capture + save 로 부트스트랩 필요)
    #[error("서버 {server_id}의 {position} 위치에 해당하는 스키마가 없습니다")]
    SchemaNotFound { server_id: u64, position: String },

    /// DDL 이 알 수 없는 데이터베이스/테이블/컬럼을 참조함
    #[error("스키마 불일치: {0}")]
    InvalidSchema(String),

    #[error("복구 불가: client_id={client_id}, position={position}")]
    RecoveryImpossible { client_id: String, position: String },

    #[error("컬럼 변환 실패: {value} ({column_type}) -> {database}.{table}.{column}")]
    ColumnCast {
        database: String,
        table: String,
        column: String,
        column_type: String,
        value: String,
    },

    /// 같은 client_id 로 다른 프로세스가 하트비트를 쓰고 있음
    #[error("중복 프로세스 감지: client_id={client_id}")]
    DuplicateProcess { client_id: String },

    #[error("{0:?} 안에 정상 종료되지 않았습니다")]
    StopTimeout(Duration),

    #[error("Producer 전송 에러: {0}")]
    ProducerDelivery(String),

    #[error("Timeout 에러")]
    Timeout,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        CdcError::QueryError(err.to_string())
    }
}

impl CdcError {
    /// 스키마가 더 이상 신뢰할 수 없는 상태인지 (실행 중단 대상)
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            CdcError::InvalidSchema(_) | CdcError::SchemaNotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
