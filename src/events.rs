//! 디코딩된 Binlog 이벤트 모델
//!
//! 와이어 디코더가 만들어 주는 타입 이벤트입니다. 엔진은 바이트를 직접 해석하지 않고
//! 여기 정의된 구조체만 소비합니다.

use crate::offset::BinlogPosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (BEGIN, COMMIT, DDL)
    QueryEvent = 2,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// XID 이벤트 (트랜잭션 커밋)
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 29,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            4 => EventType::RotateEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 | 30 => EventType::WriteRowsEvent,
            24 | 31 => EventType::UpdateRowsEvent,
            25 | 32 => EventType::DeleteRowsEvent,
            29 => EventType::RowsQueryEvent,
            33 => EventType::GtidEvent,
            _ => EventType::Unknown,
        }
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타임스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// 이벤트를 기록한 MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 플래그
    #[serde(default)]
    pub flags: u16,
}

impl EventHeader {
    pub fn new(event_type: EventType, timestamp: u32, server_id: u32) -> Self {
        EventHeader {
            timestamp,
            event_type,
            server_id,
            flags: 0,
        }
    }
}

/// 테이블 맵 정보
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    /// 스트림 로컬 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입들
    #[serde(default)]
    pub column_types: Vec<u8>,
}

/// WRITE_ROWS 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRowsData {
    pub table_id: u64,
    /// 사용된 컬럼 비트맵 (비어 있으면 전체 컬럼)
    #[serde(default)]
    pub columns_present: Vec<u8>,
    /// 행 데이터들, 컬럼 인덱스 순서
    pub rows: Vec<Vec<CellValue>>,
}

/// UPDATE_ROWS 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRowsData {
    pub table_id: u64,
    /// 변경 전 이미지에 포함된 컬럼
    #[serde(default)]
    pub columns_present: Vec<u8>,
    /// 변경 후 이미지에 포함된 컬럼
    #[serde(default)]
    pub columns_changed: Vec<u8>,
    /// 변경 전후 데이터 쌍들
    pub rows: Vec<(Vec<CellValue>, Vec<CellValue>)>,
}

/// DELETE_ROWS 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRowsData {
    pub table_id: u64,
    #[serde(default)]
    pub columns_present: Vec<u8>,
    pub rows: Vec<Vec<CellValue>>,
}

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Date(String),
    Time(String),
    Decimal(String),
    Json(serde_json::Value),
    /// ENUM 인덱스 (1부터 시작, 0 은 빈 값)
    Enum(u32),
    /// SET 비트마스크
    Set(u64),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// 부호 있는 정수로 읽기
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            CellValue::Int8(v) => Some(v as i64),
            CellValue::Int16(v) => Some(v as i64),
            CellValue::Int32(v) => Some(v as i64),
            CellValue::Int64(v) => Some(v),
            CellValue::UInt8(v) => Some(v as i64),
            CellValue::UInt16(v) => Some(v as i64),
            CellValue::UInt32(v) => Some(v as i64),
            CellValue::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            CellValue::String(s) => Some(s.clone()),
            CellValue::Int64(i) => Some(i.to_string()),
            CellValue::UInt64(u) => Some(u.to_string()),
            CellValue::Double(d) => Some(d.to_string()),
            CellValue::DateTime(dt) => Some(dt.to_rfc3339()),
            CellValue::Null => Some("NULL".to_string()),
            _ => None,
        }
    }
}

/// GTID 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtidEventData {
    /// GTID 문자열 (format: uuid:sequence-number)
    pub gtid: String,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    /// 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    #[serde(default)]
    pub exec_time: u32,
    /// 현재 데이터베이스
    pub database: String,
    /// 쿼리 문자열
    pub query: String,
}

/// XID 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XidEventData {
    pub xid: u64,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// 모든 Binlog 이벤트를 포함하는 열거형
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BinlogEventData {
    TableMap(TableMapData),
    WriteRows(WriteRowsData),
    UpdateRows(UpdateRowsData),
    DeleteRows(DeleteRowsData),
    Query(QueryEventData),
    Xid(XidEventData),
    Rotate(RotateEventData),
    Gtid(GtidEventData),
    RowsQuery(String),
    Unknown(Vec<u8>),
}

impl BinlogEventData {
    pub fn event_type(&self) -> EventType {
        match self {
            BinlogEventData::TableMap(_) => EventType::TableMapEvent,
            BinlogEventData::WriteRows(_) => EventType::WriteRowsEvent,
            BinlogEventData::UpdateRows(_) => EventType::UpdateRowsEvent,
            BinlogEventData::DeleteRows(_) => EventType::DeleteRowsEvent,
            BinlogEventData::Query(_) => EventType::QueryEvent,
            BinlogEventData::Xid(_) => EventType::XidEvent,
            BinlogEventData::Rotate(_) => EventType::RotateEvent,
            BinlogEventData::Gtid(_) => EventType::GtidEvent,
            BinlogEventData::RowsQuery(_) => EventType::RowsQueryEvent,
            BinlogEventData::Unknown(_) => EventType::Unknown,
        }
    }

    pub fn is_rows(&self) -> bool {
        matches!(
            self,
            BinlogEventData::WriteRows(_)
                | BinlogEventData::UpdateRows(_)
                | BinlogEventData::DeleteRows(_)
        )
    }

    pub fn table_id(&self) -> Option<u64> {
        match self {
            BinlogEventData::TableMap(d) => Some(d.table_id),
            BinlogEventData::WriteRows(d) => Some(d.table_id),
            BinlogEventData::UpdateRows(d) => Some(d.table_id),
            BinlogEventData::DeleteRows(d) => Some(d.table_id),
            _ => None,
        }
    }
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogEvent {
    /// 이벤트 헤더
    pub header: EventHeader,
    /// 이벤트 시작 위치
    pub position: BinlogPosition,
    /// 이 이벤트 바로 다음 위치 (여기서 재시작하면 이 이벤트 이후부터 읽음)
    pub next_position: BinlogPosition,
    /// 이벤트 데이터
    pub data: BinlogEventData,
}

impl BinlogEvent {
    pub fn new(
        timestamp: u32,
        position: BinlogPosition,
        next_position: BinlogPosition,
        data: BinlogEventData,
    ) -> Self {
        BinlogEvent {
            header: EventHeader::new(data.event_type(), timestamp, 0),
            position,
            next_position,
            data,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.header.timestamp as i64 * 1000
    }

    /// 쿼리 이벤트의 SQL (앞뒤 공백 제거)
    pub fn sql(&self) -> Option<&str> {
        match &self.data {
            BinlogEventData::Query(q) => Some(q.query.trim()),
            _ => None,
        }
    }

    pub fn is_begin(&self) -> bool {
        self.sql().is_some_and(|sql| sql.eq_ignore_ascii_case("BEGIN"))
    }

    /// XID 또는 COMMIT 쿼리
    pub fn is_commit(&self) -> bool {
        match &self.data {
            BinlogEventData::Xid(_) => true,
            BinlogEventData::Query(q) => q.query.trim().eq_ignore_ascii_case("COMMIT"),
            _ => false,
        }
    }
}

/// 컬럼 비트맵에서 i 번째 컬럼이 포함되어 있는지 (빈 비트맵은 전체 포함)
pub fn column_included(bitmap: &[u8], index: usize) -> bool {
    if bitmap.is_empty() {
        return true;
    }
    bitmap
        .get(index / 8)
        .map(|byte| byte & (1 << (index % 8)) != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_from_u8() {
        assert_eq!(EventType::from_u8(30), EventType::WriteRowsEvent);
        assert_eq!(EventType::from_u8(23), EventType::WriteRowsEvent);
        assert_eq!(EventType::from_u8(16), EventType::XidEvent);
        assert_eq!(EventType::from_u8(200), EventType::Unknown);
    }

    #[test]
    fn test_column_bitmap() {
        assert!(column_included(&[], 12));
        let bitmap = [0b0000_0101u8];
        assert!(column_included(&bitmap, 0));
        assert!(!column_included(&bitmap, 1));
        assert!(column_included(&bitmap, 2));
        assert!(!column_included(&bitmap, 9));
    }

    #[test]
    fn test_begin_and_commit_detection() {
        let pos = BinlogPosition::new("mysql-bin.000001", 4);
        let begin = BinlogEvent::new(
            0,
            pos.clone(),
            pos.clone(),
            BinlogEventData::Query(QueryEventData {
                thread_id: 1,
                exec_time: 0,
                database: "shop".to_string(),
                query: "BEGIN".to_string(),
            }),
        );
        assert!(begin.is_begin());
        assert!(!begin.is_commit());

        let xid = BinlogEvent::new(0, pos.clone(), pos, BinlogEventData::Xid(XidEventData { xid: 9 }));
        assert!(xid.is_commit());
        assert_eq!(xid.header.event_type, EventType::XidEvent);
    }

    #[test]
    fn test_cell_value_as_i64() {
        assert_eq!(CellValue::Int8(-3).as_i64(), Some(-3));
        assert_eq!(CellValue::UInt64(u64::MAX).as_i64(), None);
        assert_eq!(CellValue::String("1".into()).as_i64(), None);
    }
}
