//! 디코딩된 이벤트 공급원
//!
//! 와이어 디코더는 자기 태스크에서 돌면서 bounded 채널로 이벤트를 넘깁니다.
//! 채널이 가득 차면 put 이 기다리므로 메모리 대신 네트워크 리더 쪽에 배압이 걸립니다.

use crate::error::{CdcError, Result};
use crate::events::{BinlogEvent, BinlogEventData, RotateEventData};
use crate::offset::{BinlogPosition, BINLOG_START_OFFSET};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

/// 기본 이벤트 큐 크기
pub const DEFAULT_QUEUE_CAPACITY: usize = 5000;

/// poll 결과
#[derive(Debug)]
pub enum SourcePoll {
    Event(BinlogEvent),
    /// timeout 안에 준비된 이벤트 없음
    Idle,
    /// 스트림 종료
    Closed,
}

/// 디코딩된 이벤트를 하나씩 내주는 공급원
#[async_trait]
pub trait EventSource: Send {
    async fn poll(&mut self, timeout: Duration) -> Result<SourcePoll>;
}

/// 채널 수신 측
pub struct ChannelEventSource {
    rx: mpsc::Receiver<BinlogEvent>,
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn poll(&mut self, timeout: Duration) -> Result<SourcePoll> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => Ok(SourcePoll::Event(event)),
            Ok(None) => Ok(SourcePoll::Closed),
            Err(_) => Ok(SourcePoll::Idle),
        }
    }
}

/// put 결과
#[derive(Debug)]
pub enum PutOutcome {
    Sent,
    /// 취소됨, 이벤트는 호출자에게 돌려줌
    Cancelled(BinlogEvent),
}

/// 디코더 태스크가 쥐는 송신 측
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<BinlogEvent>,
    retry_interval: Duration,
}

impl EventSender {
    /// 큐에 자리가 날 때까지 기다렸다 넣기
    pub async fn put(&self, event: BinlogEvent) -> Result<()> {
        let mut event = event;
        loop {
            match self.tx.send_timeout(event, self.retry_interval).await {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    debug!("Event queue full, retrying put at {}", returned.position);
                    event = returned;
                }
                Err(SendTimeoutError::Closed(_)) => return Err(CdcError::ChannelClosed),
            }
        }
    }

    /// cancel 이 먼저 끝나면 이벤트를 잃지 않고 돌려줌
    pub async fn put_cancellable<F>(&self, event: BinlogEvent, cancel: F) -> Result<PutOutcome>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::select! {
            permit = self.tx.reserve() => {
                let permit = permit.map_err(|_| CdcError::ChannelClosed)?;
                permit.send(event);
                Ok(PutOutcome::Sent)
            }
            _ = cancel => Ok(PutOutcome::Cancelled(event)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// bounded 이벤트 채널 생성
pub fn event_channel(capacity: usize) -> (EventSender, ChannelEventSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            retry_interval: Duration::from_millis(100),
        },
        ChannelEventSource { rx },
    )
}

/// 미리 정해진 이벤트 목록을 순서대로 내주는 공급원
pub struct VecEventSource {
    events: VecDeque<BinlogEvent>,
    idle_when_drained: bool,
}

impl VecEventSource {
    pub fn new(events: Vec<BinlogEvent>) -> Self {
        VecEventSource {
            events: events.into(),
            idle_when_drained: false,
        }
    }

    /// 다 읽은 뒤 Closed 대신 Idle 반환 (살아있는 스트림 흉내)
    pub fn idle_when_drained(mut self) -> Self {
        self.idle_when_drained = true;
        self
    }
}

#[async_trait]
impl EventSource for VecEventSource {
    async fn poll(&mut self, _timeout: Duration) -> Result<SourcePoll> {
        match self.events.pop_front() {
            Some(event) => Ok(SourcePoll::Event(event)),
            None if self.idle_when_drained => Ok(SourcePoll::Idle),
            None => Ok(SourcePoll::Closed),
        }
    }
}

/// 복제 원본 서버에 대한 관리 기능 + 스트림 열기
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn server_id(&self) -> Result<u64>;

    /// 현재 마스터 위치
    async fn current_position(&self) -> Result<BinlogPosition>;

    /// 보관 중인 binlog 파일 목록, 오래된 것부터
    async fn binlog_files(&self) -> Result<Vec<String>>;

    /// start 부터 읽는 스트림. stop_at_eof 면 그 파일 끝에서 닫힘
    async fn open(&self, start: &BinlogPosition, stop_at_eof: bool) -> Result<Box<dyn EventSource>>;
}

/// 파일별 이벤트를 메모리에 들고 있는 커넥터 (리플레이/테스트용)
#[derive(Debug, Clone, Default)]
pub struct MemorySourceConnector {
    server_id: u64,
    files: BTreeMap<u64, (String, Vec<BinlogEvent>)>,
}

impl MemorySourceConnector {
    pub fn new(server_id: u64) -> Self {
        MemorySourceConnector {
            server_id,
            files: BTreeMap::new(),
        }
    }

    /// 이벤트를 시작 위치의 파일별로 묶어 추가
    pub fn push_events(&mut self, events: impl IntoIterator<Item = BinlogEvent>) {
        for event in events {
            let file = event.position.file.clone();
            let seq = event.position.file_sequence().unwrap_or(0);
            self.files
                .entry(seq)
                .or_insert_with(|| (file, Vec::new()))
                .1
                .push(event);
        }
    }

    pub fn with_events(server_id: u64, events: impl IntoIterator<Item = BinlogEvent>) -> Self {
        let mut connector = MemorySourceConnector::new(server_id);
        connector.push_events(events);
        connector
    }

    /// 한 줄에 이벤트 하나씩 JSON 으로 기록된 파일 읽기
    pub async fn from_json_lines(server_id: u64, path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let mut lines = tokio::io::BufReader::new(file).lines();
        let mut events = Vec::new();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let event: BinlogEvent = serde_json::from_str(line).map_err(|e| {
                CdcError::InvalidEvent(format!("line {}: {}", line_no, e))
            })?;
            events.push(event);
        }

        debug!("Loaded {} replay events", events.len());
        Ok(MemorySourceConnector::with_events(server_id, events))
    }
}

#[async_trait]
impl SourceConnector for MemorySourceConnector {
    async fn server_id(&self) -> Result<u64> {
        Ok(self.server_id)
    }

    async fn current_position(&self) -> Result<BinlogPosition> {
        match self.files.values().next_back() {
            Some((file, events)) => Ok(events
                .last()
                .map(|e| e.next_position.clone())
                .unwrap_or_else(|| BinlogPosition::start_of(file.clone()))),
            None => Err(CdcError::QueryError("No binary logs available".to_string())),
        }
    }

    async fn binlog_files(&self) -> Result<Vec<String>> {
        Ok(self.files.values().map(|(file, _)| file.clone()).collect())
    }

    async fn open(&self, start: &BinlogPosition, stop_at_eof: bool) -> Result<Box<dyn EventSource>> {
        let start_seq = start.file_sequence().unwrap_or(0);
        if !self.files.contains_key(&start_seq) && start.offset > BINLOG_START_OFFSET {
            warn!("Binlog {} not found in replay source", start.file);
        }

        let mut out = Vec::new();
        let mut files = self.files.range(start_seq..).peekable();
        while let Some((seq, (_, events))) = files.next() {
            out.extend(
                events
                    .iter()
                    .filter(|e| *seq != start_seq || e.position.offset >= start.offset)
                    .cloned(),
            );
            if stop_at_eof {
                break;
            }
            if let (Some(last), Some((_, (next_file, _)))) = (events.last(), files.peek()) {
                out.push(BinlogEvent::new(
                    last.header.timestamp,
                    last.next_position.clone(),
                    BinlogPosition::start_of(next_file.clone()),
                    BinlogEventData::Rotate(RotateEventData {
                        next_binlog_name: next_file.clone(),
                        position: BINLOG_START_OFFSET,
                    }),
                ));
            }
        }

        Ok(Box::new(VecEventSource::new(out)))
    }
}
