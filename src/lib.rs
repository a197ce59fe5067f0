//! MySQL CDC (Change Data Capture) 복제 + 스키마 추적 엔진
//!
//! 디코딩된 binlog 이벤트를 받아 스키마가 붙은 행 변경 레코드로 바꾸고,
//! 안전한 재시작 위치를 저장합니다.
//! 주요 기능:
//! - 트랜잭션 단위 행 버퍼링 (큰 트랜잭션은 임시 파일로)
//! - DDL 에 따른 스키마 버전 관리
//! - 위치/하트비트 저장과 마스터 교체 복구
//! - GTID (Global Transaction ID) 관리

pub mod cdc_engine;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod filter;
pub mod gtid;
pub mod heartbeat;
pub mod offset;
pub mod position_store;
pub mod producer;
pub mod recovery;
pub mod replicator;
pub mod row;
pub mod schema;
pub mod source;
pub mod table_cache;

#[cfg(test)]
mod test_support;

pub use cdc_engine::{CdcEngine, EngineParts};
pub use config::CdcConfig;
pub use error::{CdcError, Result};
pub use events::{BinlogEvent, BinlogEventData, EventType};
pub use gtid::GtidSet;
pub use offset::{BinlogPosition, Position};
pub use producer::{Producer, ProducerContext};
pub use replicator::{NextRow, Replicator, StopHandle};
pub use row::{RowEvent, RowPayload};
