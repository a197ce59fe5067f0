//! GTID (Global Transaction ID) 관리
//!
//! GTID 형식: UUID:sequence-number
//! 여러 서버의 GTID 집합을 추적: "uuid1:1-100:120,uuid2:1-50"
//!
//! GTID 모드에서는 스키마 복원과 위치 비교에 GTID 집합 포함 관계를 사용합니다.

use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(CdcError::GtidError(format!(
                "Invalid range: {} > {}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let invalid = || CdcError::GtidError(format!("Invalid range: {}", text));
        match text.split_once('-') {
            Some((start, end)) => {
                let start = start.parse::<u64>().map_err(|_| invalid())?;
                let end = end.parse::<u64>().map_err(|_| invalid())?;
                GtidRange::new(start, end)
            }
            None => {
                let seq = text.parse::<u64>().map_err(|_| invalid())?;
                Ok(GtidRange { start: seq, end: seq })
            }
        }
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    pub fn covers(&self, other: &GtidRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// 겹치거나 연접한 범위 병합
    pub fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// UUID별 GTID 범위들 (항상 정렬 + 병합된 상태 유지)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidGtidSet {
    pub uuid: String,
    pub ranges: Vec<GtidRange>,
}

impl UuidGtidSet {
    pub fn new(uuid: impl Into<String>) -> Self {
        UuidGtidSet {
            uuid: uuid.into(),
            ranges: Vec::new(),
        }
    }

    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.ranges.sort();

        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) => match last.merge(&range) {
                    Some(m) => *last = m,
                    None => merged.push(range),
                },
                None => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    pub fn add_gtid(&mut self, sequence: u64) {
        self.add_range(GtidRange {
            start: sequence,
            end: sequence,
        });
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(sequence))
    }

    fn is_contained_within(&self, other: &UuidGtidSet) -> bool {
        self.ranges
            .iter()
            .all(|r| other.ranges.iter().any(|o| o.covers(r)))
    }
}

impl fmt::Display for UuidGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)?;
        for range in &self.ranges {
            write!(f, ":{}", range)?;
        }
        Ok(())
    }
}

/// 전체 GTID 집합 (여러 UUID)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    pub sets: BTreeMap<String, UuidGtidSet>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet {
            sets: BTreeMap::new(),
        }
    }

    /// GTID 문자열 파싱
    ///
    /// MySQL 표준 형식(`uuid:1-5:7`)과 콤마로 이어지는 범위(`uuid:1-5,7`)를 모두 받습니다.
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();
        let trimmed = gtid_str.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NULL") {
            return Ok(gtid_set);
        }

        let mut current: Option<String> = None;
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let mut pieces = part.split(':');
            let first = pieces.next().unwrap_or_default().trim();

            if part.contains(':') {
                let uuid = first.to_lowercase();
                let entry = gtid_set
                    .sets
                    .entry(uuid.clone())
                    .or_insert_with(|| UuidGtidSet::new(uuid.clone()));
                for range in pieces {
                    entry.add_range(GtidRange::parse(range)?);
                }
                current = Some(uuid);
            } else {
                let uuid = current.as_ref().ok_or_else(|| {
                    CdcError::GtidError(format!("Range without server uuid: {}", part))
                })?;
                if let Some(entry) = gtid_set.sets.get_mut(uuid) {
                    entry.add_range(GtidRange::parse(first)?);
                }
            }
        }

        Ok(gtid_set)
    }

    /// 단일 GTID 추가 ("uuid:sequence")
    pub fn add_gtid(&mut self, gtid: &str) -> Result<()> {
        let (uuid, sequence) = split_gtid(gtid)?;
        self.sets
            .entry(uuid.clone())
            .or_insert_with(|| UuidGtidSet::new(uuid))
            .add_gtid(sequence);
        Ok(())
    }

    pub fn contains(&self, gtid: &str) -> bool {
        match split_gtid(gtid) {
            Ok((uuid, sequence)) => self
                .sets
                .get(&uuid)
                .map(|set| set.contains(sequence))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// self 의 모든 트랜잭션이 other 에 포함되는지
    pub fn is_contained_within(&self, other: &GtidSet) -> bool {
        self.sets.iter().all(|(uuid, set)| {
            set.ranges.is_empty()
                || other
                    .sets
                    .get(uuid)
                    .map(|o| set.is_contained_within(o))
                    .unwrap_or(false)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|set| set.ranges.is_empty())
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .sets
            .values()
            .filter(|set| !set.ranges.is_empty())
            .map(|set| set.to_string())
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

fn split_gtid(gtid: &str) -> Result<(String, u64)> {
    let (uuid, sequence) = gtid
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| CdcError::GtidError(format!("Invalid GTID format: {}", gtid)))?;
    let sequence = sequence
        .parse::<u64>()
        .map_err(|_| CdcError::GtidError(format!("Invalid sequence: {}", sequence)))?;
    Ok((uuid.to_lowercase(), sequence))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "550e8400-e29b-41d4-a716-446655440000";

    #[test]
    fn test_gtid_parse() {
        let gtid_set = GtidSet::parse(&format!("{}:1-100,200,300-400", UUID)).unwrap();
        let set = &gtid_set.sets[UUID];
        assert_eq!(set.ranges.len(), 3);
        assert!(gtid_set.contains(&format!("{}:200", UUID)));
    }

    #[test]
    fn test_gtid_parse_mysql_format() {
        let text = format!("{}:1-5:7-9,6f4b2c3a-0000-0000-0000-000000000001:1-3", UUID);
        let gtid_set = GtidSet::parse(&text).unwrap();
        assert_eq!(gtid_set.sets.len(), 2);
        assert_eq!(gtid_set.to_string(), text);
    }

    #[test]
    fn test_gtid_contains() {
        let mut gtid_set = GtidSet::new();
        gtid_set.add_gtid(&format!("{}:50", UUID)).unwrap();
        assert!(gtid_set.contains(&format!("{}:50", UUID)));
        assert!(!gtid_set.contains(&format!("{}:51", UUID)));
    }

    #[test]
    fn test_add_gtid_merges_adjacent() {
        let mut gtid_set = GtidSet::parse(&format!("{}:1-4:6", UUID)).unwrap();
        gtid_set.add_gtid(&format!("{}:5", UUID)).unwrap();
        assert_eq!(gtid_set.to_string(), format!("{}:1-6", UUID));
    }

    #[test]
    fn test_is_contained_within() {
        let small = GtidSet::parse(&format!("{}:1-10", UUID)).unwrap();
        let big = GtidSet::parse(&format!("{}:1-20", UUID)).unwrap();
        assert!(small.is_contained_within(&big));
        assert!(!big.is_contained_within(&small));
        assert!(GtidSet::new().is_contained_within(&small));
    }

    #[test]
    fn test_invalid_range() {
        assert!(GtidSet::parse(&format!("{}:9-3", UUID)).is_err());
        assert!(GtidSet::parse("5-7").is_err());
    }
}
