//! 안전한 위치 추적과 주기적 저장
//!
//! producer 가 전달을 확인한 위치만 `PositionTracker` 에 들어갑니다.
//! `PositionFlusher` 는 별도 태스크에서 그 위치를 저장하고 하트비트를 씁니다.

use super::PositionStore;
use crate::config::PositionStoreConfig;
use crate::error::{CdcError, Result};
use crate::offset::Position;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Default)]
struct TrackerState {
    position: Option<Position>,
    stored: Option<Position>,
}

/// 넘겨준 것이 확인된 가장 새로운 위치
#[derive(Debug, Default)]
pub struct PositionTracker {
    state: Mutex<TrackerState>,
}

impl PositionTracker {
    pub fn new(initial: Option<Position>) -> Self {
        PositionTracker {
            state: Mutex::new(TrackerState {
                position: initial.clone(),
                stored: initial,
            }),
        }
    }

    /// 더 새로운 위치일 때만 반영 (절대 뒤로 가지 않음)
    pub fn set_position(&self, position: Position) -> bool {
        let mut state = self.state.lock();
        let newer = state
            .position
            .as_ref()
            .map_or(true, |current| position.newer_than(current));
        if newer {
            state.position = Some(position);
        }
        newer
    }

    pub fn position(&self) -> Option<Position> {
        self.state.lock().position.clone()
    }

    pub fn stored_position(&self) -> Option<Position> {
        self.state.lock().stored.clone()
    }

    /// 아직 저장되지 않은 새 위치
    fn unstored(&self) -> Option<Position> {
        let state = self.state.lock();
        match (&state.position, &state.stored) {
            (Some(position), Some(stored)) if !position.newer_than(stored) => None,
            (position, _) => position.clone(),
        }
    }

    fn mark_stored(&self, position: Position) {
        let mut state = self.state.lock();
        let newer = state
            .stored
            .as_ref()
            .map_or(true, |stored| position.newer_than(stored));
        if newer {
            state.stored = Some(position);
        }
    }
}

struct HeartbeatSchedule {
    config: PositionStoreConfig,
    last_sent_at: Option<Instant>,
    last_sent_from: Option<Position>,
}

impl HeartbeatSchedule {
    fn due(&self, position: Option<&Position>, now: Instant) -> bool {
        let (Some(sent_at), Some(sent_from)) = (self.last_sent_at, self.last_sent_from.as_ref()) else {
            return true;
        };
        if now.duration_since(sent_at) >= self.config.heartbeat_interval {
            return true;
        }
        match position {
            Some(position) => {
                position.file() != sent_from.file()
                    || position.offset().saturating_sub(sent_from.offset())
                        > self.config.heartbeat_offset_delta
            }
            None => false,
        }
    }
}

async fn flush_once(store: &dyn PositionStore, tracker: &PositionTracker) -> Result<()> {
    if let Some(position) = tracker.unstored() {
        store.set(&position).await?;
        debug!("Stored position {}", position);
        tracker.mark_stored(position);
    }
    Ok(())
}

/// 위치 저장 태스크 핸들
pub struct PositionFlusher {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl PositionFlusher {
    pub fn spawn(
        store: Arc<dyn PositionStore>,
        tracker: Arc<PositionTracker>,
        config: PositionStoreConfig,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut schedule = HeartbeatSchedule {
                config,
                last_sent_at: None,
                last_sent_from: None,
            };

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = flush_once(store.as_ref(), &tracker).await {
                            error!("Failed to store position: {}", e);
                            return Err(e);
                        }

                        let position = tracker.position();
                        let now = Instant::now();
                        if schedule.due(position.as_ref(), now) {
                            let value = store.heartbeat().await.map_err(|e| {
                                error!("Failed to write heartbeat: {}", e);
                                e
                            })?;
                            debug!("Wrote heartbeat {}", value);
                            schedule.last_sent_at = Some(now);
                            schedule.last_sent_from = position;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            flush_once(store.as_ref(), &tracker).await?;
                            if let Some(position) = tracker.stored_position() {
                                info!("Final position stored: {}", position);
                            }
                            return Ok(());
                        }
                    }
                }
            }
        });

        PositionFlusher {
            shutdown,
            handle: Some(handle),
        }
    }

    /// 태스크가 스스로 끝날 때까지 대기 (저장 실패 감지용)
    pub async fn failure(&mut self) -> CdcError {
        let Some(handle) = self.handle.as_mut() else {
            return std::future::pending().await;
        };
        let result = handle.await;
        self.handle = None;
        match result {
            Ok(Err(e)) => e,
            Ok(Ok(())) => CdcError::Other("Position flusher stopped unexpectedly".to_string()),
            Err(e) => CdcError::Other(format!("Position flusher panicked: {}", e)),
        }
    }

    /// 마지막 위치를 저장하고 종료
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| CdcError::Other(format!("Position flusher panicked: {}", e)))?,
            None => Ok(()),
        }
    }
}
