//! 트랜잭션 행 버퍼 (메모리 + 임시 파일 2단 FIFO)
//!
//! 메모리에는 최대 `max_in_memory` 개만 두고, 넘치면 가장 오래된 행부터
//! 임시 파일 끝에 붙입니다. 파일에 있는 행은 항상 메모리의 행보다 오래됐으므로
//! 꺼낼 때는 파일 → 메모리 순서로 읽으면 원래 순서가 유지됩니다.
//!
//! 파일 프레임: `[u32 LE 길이][JSON]`

use super::RowEvent;
use crate::error::{CdcError, Result};
use bytes::{BufMut, BytesMut};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use tempfile::NamedTempFile;
use tracing::debug;

struct SpillFile {
    writer: NamedTempFile,
    reader: BufReader<File>,
    pending: usize,
}

impl SpillFile {
    fn create() -> Result<Self> {
        let writer = NamedTempFile::new()?;
        let reader = BufReader::new(writer.reopen()?);
        debug!("Transaction buffer spilling to {}", writer.path().display());
        Ok(SpillFile {
            writer,
            reader,
            pending: 0,
        })
    }

    fn push(&mut self, row: &RowEvent) -> Result<()> {
        let body = serde_json::to_vec(row)?;
        let mut frame = BytesMut::with_capacity(body.len() + 4);
        frame.put_u32_le(body.len() as u32);
        frame.put_slice(&body);
        self.writer.as_file_mut().write_all(&frame)?;
        self.pending += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<RowEvent>> {
        if self.pending == 0 {
            return Ok(None);
        }
        let len = self
            .reader
            .read_u32::<LittleEndian>()
            .map_err(|e| CdcError::IoError(format!("Failed to read spilled row length: {}", e)))?;
        let mut body = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut body)
            .map_err(|e| CdcError::IoError(format!("Failed to read spilled row: {}", e)))?;
        self.pending -= 1;
        Ok(Some(serde_json::from_slice(&body)?))
    }
}

/// 한 트랜잭션의 행들. 한 번만 읽히고, drop 되면 임시 파일도 지워짐
pub struct RowBuffer {
    memory: VecDeque<RowEvent>,
    max_in_memory: usize,
    spill: Option<SpillFile>,
    xid: Option<u64>,
    xoffset: u64,
    server_id: Option<u64>,
    thread_id: Option<u64>,
    schema_id: Option<u64>,
}

impl RowBuffer {
    pub fn new(max_in_memory: usize) -> Self {
        RowBuffer {
            memory: VecDeque::new(),
            max_in_memory: max_in_memory.max(1),
            spill: None,
            xid: None,
            xoffset: 0,
            server_id: None,
            thread_id: None,
            schema_id: None,
        }
    }

    pub fn add(&mut self, row: RowEvent) -> Result<()> {
        self.memory.push_back(row);
        while self.memory.len() > self.max_in_memory {
            let Some(oldest) = self.memory.pop_front() else {
                break;
            };
            if self.spill.is_none() {
                self.spill = Some(SpillFile::create()?);
            }
            if let Some(spill) = self.spill.as_mut() {
                spill.push(&oldest)?;
            }
        }
        Ok(())
    }

    /// 가장 오래된 행 꺼내기. 트랜잭션 메타데이터를 찍어서 돌려줌
    pub fn pop(&mut self) -> Result<Option<RowEvent>> {
        let spilled = match self.spill.as_mut() {
            Some(spill) => spill.pop()?,
            None => None,
        };
        let row = match spilled {
            Some(row) => Some(row),
            None => self.memory.pop_front(),
        };

        Ok(row.map(|mut row| {
            row.xid = self.xid;
            row.xoffset = self.xoffset;
            self.xoffset += 1;
            if self.server_id.is_some() {
                row.server_id = self.server_id;
            }
            if self.thread_id.is_some() {
                row.thread_id = self.thread_id;
            }
            if self.schema_id.is_some() {
                row.schema_id = self.schema_id;
            }
            row
        }))
    }

    /// 가장 최근에 넣은 행 (커밋 표시용). 최신 행은 항상 메모리에 있음
    pub fn last_mut(&mut self) -> Option<&mut RowEvent> {
        self.memory.back_mut()
    }

    pub fn len(&self) -> usize {
        self.memory.len() + self.spilled_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spilled_len(&self) -> usize {
        self.spill.as_ref().map_or(0, |s| s.pending)
    }

    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    pub fn set_xid(&mut self, xid: Option<u64>) {
        self.xid = xid;
    }

    pub fn set_server_id(&mut self, server_id: u64) {
        self.server_id = Some(server_id);
    }

    pub fn set_thread_id(&mut self, thread_id: u64) {
        self.thread_id = Some(thread_id);
    }

    pub fn set_schema_id(&mut self, schema_id: Option<u64>) {
        self.schema_id = schema_id;
    }
}

impl std::fmt::Debug for RowBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowBuffer")
            .field("in_memory", &self.memory.len())
            .field("spilled", &self.spilled_len())
            .field("xid", &self.xid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::Position;
    use crate::row::RowData;
    use serde_json::json;

    fn row(id: u64) -> RowEvent {
        let mut data = RowData::new();
        data.insert("id".into(), json!(id));
        RowEvent::insert("shop", "t", data, 0, Position::at("mysql-bin.000001", 100 + id))
    }

    fn id_of(row: &RowEvent) -> u64 {
        row.data().and_then(|d| d["id"].as_u64()).unwrap()
    }

    #[test]
    fn test_spill_preserves_order() {
        let mut buffer = RowBuffer::new(3);
        for id in 0..10 {
            buffer.add(row(id)).unwrap();
        }
        assert!(buffer.is_spilled());
        assert_eq!(buffer.spilled_len(), 7);
        assert_eq!(buffer.len(), 10);

        buffer.last_mut().unwrap().tx_commit = true;
        buffer.set_xid(Some(42));

        let mut seen = Vec::new();
        while let Some(r) = buffer.pop().unwrap() {
            assert_eq!(r.xid, Some(42));
            assert_eq!(r.xoffset, seen.len() as u64);
            assert_eq!(r.tx_commit, id_of(&r) == 9);
            seen.push(id_of(&r));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_interleaved_add_and_pop() {
        let mut buffer = RowBuffer::new(1);
        buffer.add(row(0)).unwrap();
        buffer.add(row(1)).unwrap();
        assert_eq!(id_of(&buffer.pop().unwrap().unwrap()), 0);
        buffer.add(row(2)).unwrap();
        buffer.add(row(3)).unwrap();
        let rest: Vec<u64> = std::iter::from_fn(|| buffer.pop().unwrap())
            .map(|r| id_of(&r))
            .collect();
        assert_eq!(rest, vec![1, 2, 3]);
    }

    #[test]
    fn test_metadata_stamped_on_pop() {
        let mut buffer = RowBuffer::new(0);
        buffer.set_server_id(5);
        buffer.set_thread_id(11);
        buffer.set_schema_id(Some(3));
        buffer.add(row(1)).unwrap();
        let r = buffer.pop().unwrap().unwrap();
        assert_eq!((r.server_id, r.thread_id, r.schema_id), (Some(5), Some(11), Some(3)));
        assert!(buffer.pop().unwrap().is_none());
    }
}
