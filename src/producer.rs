//! Producer (sink) 경계와 기본 구현
//!
//! 동기 producer 는 `push` 가 돌아오면 전달이 끝난 것으로 보고 바로 위치를 올립니다.
//! 비동기 producer 는 `InflightMessages` 로 보낸 메시지를 추적하다가, 앞선 메시지가
//! 전부 확인된 안전한 위치만 `PositionTracker` 에 넘깁니다.

use crate::config::{OutputConfig, ProducerFailurePolicy};
use crate::error::{CdcError, Result};
use crate::offset::Position;
use crate::position_store::PositionTracker;
use crate::row::RowEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[async_trait]
pub trait Producer: Send {
    async fn push(&mut self, row: RowEvent) -> Result<()>;

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// true 면 위치 전진은 producer 가 확인(ack) 시점에 직접 처리
    fn acknowledges_later(&self) -> bool {
        false
    }

    /// 출력 없이 위치만 전진 (하트비트, 걸러진 트랜잭션, 출력 안 하는 DDL)
    fn advance_position(&mut self, position: &Position, ctx: &ProducerContext) {
        ctx.advance(position, true);
    }
}

/// producer 와 replicator 가 공유하는 전달 상태
#[derive(Debug, Clone)]
pub struct ProducerContext {
    tracker: Arc<PositionTracker>,
    policy: ProducerFailurePolicy,
    failure: Arc<Mutex<Option<String>>>,
}

impl ProducerContext {
    pub fn new(tracker: Arc<PositionTracker>, policy: ProducerFailurePolicy) -> Self {
        ProducerContext {
            tracker,
            policy,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    pub fn tracker(&self) -> &Arc<PositionTracker> {
        &self.tracker
    }

    pub fn policy(&self) -> ProducerFailurePolicy {
        self.policy
    }

    /// 전달 완료. 위치를 저장해도 되는 행이면 tracker 를 올림
    pub fn mark_delivered(&self, row: &RowEvent) -> bool {
        self.advance(&row.position, row.should_advance_position())
    }

    pub fn advance(&self, position: &Position, safe: bool) -> bool {
        safe && self.tracker.set_position(position.clone())
    }

    /// 전달 실패 처리
    ///
    /// `Terminate` 면 실패를 기록하고 에러를 돌려주며, `LogAndContinue` 면
    /// 경고만 남기고 그 행을 전달된 것으로 취급합니다.
    pub fn delivery_failed(&self, row: &RowEvent, err: CdcError) -> Result<()> {
        self.failed_at(&row.position, row.should_advance_position(), err)
    }

    /// 행을 이미 넘겨버린 뒤의 실패 (위치 정보만 남은 경우)
    pub fn failed_at(&self, position: &Position, safe: bool, err: CdcError) -> Result<()> {
        self.apply_failure_policy(position, err)?;
        self.advance(position, safe);
        Ok(())
    }

    /// 정책만 적용하고 위치는 건드리지 않음
    pub fn apply_failure_policy(&self, position: &Position, err: CdcError) -> Result<()> {
        match self.policy {
            ProducerFailurePolicy::Terminate => {
                error!("Failed to deliver row at {}: {}", position, err);
                let message = err.to_string();
                *self.failure.lock() = Some(message.clone());
                Err(CdcError::ProducerDelivery(message))
            }
            ProducerFailurePolicy::LogAndContinue => {
                warn!("Dropping undeliverable row at {}: {}", position, err);
                Ok(())
            }
        }
    }

    /// 비동기 쪽에서 기록된 치명적 실패가 있으면 에러
    pub fn check(&self) -> Result<()> {
        match self.failure.lock().as_ref() {
            Some(message) => Err(CdcError::ProducerDelivery(message.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
struct InflightMessage {
    position: Position,
    safe: bool,
    done: bool,
}

/// 아직 확인되지 않은 전송 목록 (보낸 순서대로)
#[derive(Debug, Default)]
pub struct InflightMessages {
    next_ticket: u64,
    messages: BTreeMap<u64, InflightMessage>,
}

impl InflightMessages {
    pub fn new() -> Self {
        InflightMessages::default()
    }

    pub fn add(&mut self, position: Position, safe: bool) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.messages.insert(
            ticket,
            InflightMessage {
                position,
                safe,
                done: false,
            },
        );
        ticket
    }

    /// 확인 처리. 앞선 메시지가 모두 끝났다면 그 구간의 가장 새로운 안전 위치를 돌려줌
    pub fn complete(&mut self, ticket: u64) -> Option<Position> {
        match self.messages.get_mut(&ticket) {
            Some(message) => message.done = true,
            None => {
                warn!("Unknown inflight ticket {}", ticket);
                return None;
            }
        }

        let mut newest = None;
        while let Some(entry) = self.messages.first_entry() {
            if !entry.get().done {
                break;
            }
            let message = entry.remove();
            if message.safe {
                newest = Some(message.position);
            }
        }
        newest
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// 한 줄에 JSON 하나씩 표준 출력으로
pub struct StdoutProducer {
    output: OutputConfig,
    out: tokio::io::Stdout,
}

impl StdoutProducer {
    pub fn new(output: OutputConfig) -> Self {
        StdoutProducer {
            output,
            out: tokio::io::stdout(),
        }
    }
}

#[async_trait]
impl Producer for StdoutProducer {
    async fn push(&mut self, row: RowEvent) -> Result<()> {
        let mut line = row.to_json_string(&self.output);
        line.push('\n');
        self.out.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.out.flush().await?;
        Ok(())
    }
}

/// 받은 행을 공유 메모리에 모아두는 producer
#[derive(Debug, Clone, Default)]
pub struct BufferedProducer {
    rows: Arc<Mutex<Vec<RowEvent>>>,
}

impl BufferedProducer {
    pub fn new() -> Self {
        BufferedProducer::default()
    }

    pub fn rows(&self) -> Vec<RowEvent> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// 모아둔 행을 꺼내고 비움
    pub fn drain(&self) -> Vec<RowEvent> {
        std::mem::take(&mut *self.rows.lock())
    }
}

#[async_trait]
impl Producer for BufferedProducer {
    async fn push(&mut self, row: RowEvent) -> Result<()> {
        self.rows.lock().push(row);
        Ok(())
    }
}

/// 채널로 넘어간 행과 그 확인 티켓
#[derive(Debug)]
pub struct Delivery {
    pub row: RowEvent,
    ticket: u64,
}

/// 행을 tokio 채널로 넘기고 소비 측 확인을 기다리는 비동기 producer
pub struct ChannelProducer {
    tx: mpsc::Sender<Delivery>,
    inflight: Arc<Mutex<InflightMessages>>,
}

/// ChannelProducer 의 소비 측
pub struct ChannelConsumer {
    rx: mpsc::Receiver<Delivery>,
    inflight: Arc<Mutex<InflightMessages>>,
    ctx: ProducerContext,
}

impl ChannelProducer {
    pub fn new(capacity: usize, ctx: ProducerContext) -> (ChannelProducer, ChannelConsumer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let inflight = Arc::new(Mutex::new(InflightMessages::new()));
        (
            ChannelProducer {
                tx,
                inflight: inflight.clone(),
            },
            ChannelConsumer { rx, inflight, ctx },
        )
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }
}

#[async_trait]
impl Producer for ChannelProducer {
    async fn push(&mut self, row: RowEvent) -> Result<()> {
        let ticket = self
            .inflight
            .lock()
            .add(row.position.clone(), row.should_advance_position());
        self.tx
            .send(Delivery { row, ticket })
            .await
            .map_err(|_| CdcError::ChannelClosed)
    }

    fn acknowledges_later(&self) -> bool {
        true
    }

    /// 앞서 보낸 메시지가 확인되기 전에는 위치를 넘기지 않음
    fn advance_position(&mut self, position: &Position, ctx: &ProducerContext) {
        let released = {
            let mut inflight = self.inflight.lock();
            let ticket = inflight.add(position.clone(), true);
            inflight.complete(ticket)
        };
        if let Some(position) = released {
            ctx.advance(&position, true);
        }
    }
}

impl ChannelConsumer {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    fn complete(&self, ticket: u64) {
        let position = self.inflight.lock().complete(ticket);
        if let Some(position) = position {
            if self.ctx.advance(&position, true) {
                debug!("Acknowledged through {}", position);
            }
        }
    }

    pub fn ack(&self, delivery: &Delivery) {
        self.complete(delivery.ticket);
    }

    /// 전송 실패 보고. 정책이 계속 진행이면 확인된 것으로 처리
    ///
    /// 위치는 `complete` 를 거쳐서만 올라가므로 앞선 미확인 전송을 넘어서지 않습니다.
    pub fn nack(&self, delivery: &Delivery, err: CdcError) -> Result<()> {
        self.ctx.apply_failure_policy(&delivery.row.position, err)?;
        self.complete(delivery.ticket);
        Ok(())
    }
}
