//! 복제 스트림 위치 추적
//!
//! Binlog 파일명 + 오프셋으로 정확한 재시작 지점을 표현합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치
//!
//! `Position` 은 여기에 마지막으로 읽은 하트비트 값을 더한 것입니다.
//! 하트비트는 메타데이터일 뿐 순서 비교에는 사용하지 않습니다.

use crate::error::Result;
use crate::gtid::GtidSet;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt;

/// MySQL binlog 은 4 바이트 매직 헤더 뒤에서 시작
pub const BINLOG_START_OFFSET: u64 = 4;

/// Binlog 파일 위치 정보
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub file: String,
    /// 바이트 위치
    pub offset: u64,
    /// 이 위치까지 실행된 GTID 집합 (GTID 모드일 때만)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid_set: Option<String>,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        BinlogPosition {
            file: file.into(),
            offset,
            gtid_set: None,
        }
    }

    pub fn with_gtid_set(mut self, gtid_set: impl Into<String>) -> Self {
        self.gtid_set = Some(gtid_set.into());
        self
    }

    /// 파일 시작 위치
    pub fn start_of(file: impl Into<String>) -> Self {
        BinlogPosition::new(file, BINLOG_START_OFFSET)
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.file.rsplit('.').next().and_then(|s| s.parse().ok())
    }

    pub fn parsed_gtid_set(&self) -> Result<Option<GtidSet>> {
        self.gtid_set.as_deref().map(GtidSet::parse).transpose()
    }

    /// 파일 시퀀스, 파일명, 오프셋 순으로 비교
    pub fn stream_cmp(&self, other: &BinlogPosition) -> Ordering {
        match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) if a != b => a.cmp(&b),
            _ => self
                .file
                .cmp(&other.file)
                .then(self.offset.cmp(&other.offset)),
        }
    }
}

impl PartialEq for BinlogPosition {
    fn eq(&self, other: &Self) -> bool {
        self.file == other.file && self.offset == other.offset
    }
}

impl Eq for BinlogPosition {}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stream_cmp(other)
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// 스트림 위치 + 마지막 하트비트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub binlog: BinlogPosition,
    #[serde(default)]
    pub last_heartbeat: Option<i64>,
}

impl Position {
    pub fn new(binlog: BinlogPosition, last_heartbeat: Option<i64>) -> Self {
        Position {
            binlog,
            last_heartbeat,
        }
    }

    pub fn at(file: impl Into<String>, offset: u64) -> Self {
        Position::new(BinlogPosition::new(file, offset), None)
    }

    pub fn with_heartbeat(&self, heartbeat: i64) -> Self {
        Position {
            binlog: self.binlog.clone(),
            last_heartbeat: Some(heartbeat),
        }
    }

    pub fn file(&self) -> &str {
        &self.binlog.file
    }

    pub fn offset(&self) -> u64 {
        self.binlog.offset
    }

    /// 스트림 순서 비교 (하트비트 무시)
    pub fn stream_cmp(&self, other: &Position) -> Ordering {
        self.binlog.stream_cmp(&other.binlog)
    }

    /// 저장할 가치가 있는 더 새로운 위치인지
    ///
    /// 같은 binlog 위치라도 하트비트가 더 크면 새 위치로 취급합니다.
    pub fn newer_than(&self, other: &Position) -> bool {
        match self.stream_cmp(other) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.last_heartbeat.unwrap_or(0) > other.last_heartbeat.unwrap_or(0),
        }
    }

    /// 스키마 저장 중복 제거용 SHA-1
    pub fn sha(&self, server_id: u64) -> String {
        let key = format!(
            "{}/{}/{}/{}",
            server_id,
            self.binlog.file,
            self.binlog.offset,
            self.last_heartbeat.unwrap_or(0)
        );
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "file": self.binlog.file,
            "offset": self.binlog.offset,
            "gtid_set": self.binlog.gtid_set,
            "last_heartbeat": self.last_heartbeat,
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.binlog)?;
        if let Some(ref gtid) = self.binlog.gtid_set {
            write!(f, "[{}]", gtid)?;
        }
        Ok(())
    }
}
