//! 복제 실행 루프
//!
//! 디코딩된 이벤트를 받아 트랜잭션 단위로 행을 모으고, 스키마와 위치를 붙여 한 번에
//! 하나씩 내놓습니다. 테이블 캐시, 스키마 저장소, 스트림 위치는 이 루프만 씁니다.
//!
//! 위치 규칙:
//! - 행의 위치는 "여기서 재시작하면 이 행 다음부터 읽는" 위치입니다.
//! - 트랜잭션 중간 행은 행 이벤트 바로 다음 위치, 커밋 행은 XID/COMMIT 다음 위치를 가집니다.
//! - 저장해도 되는 위치는 커밋 행, DDL, 하트비트뿐입니다.

use crate::codec::ColumnCodec;
use crate::config::{CastFailurePolicy, ReplicatorConfig};
use crate::error::{CdcError, Result};
use crate::events::{column_included, BinlogEvent, BinlogEventData, CellValue, QueryEventData, TableMapData};
use crate::filter::Filter;
use crate::gtid::GtidSet;
use crate::heartbeat::{HeartbeatMonitor, HEARTBEATS_TABLE};
use crate::offset::{BinlogPosition, Position};
use crate::producer::{Producer, ProducerContext};
use crate::row::{RowBuffer, RowData, RowEvent, RowOperation, RowPayload};
use crate::schema::resolver::is_create_table;
use crate::schema::{SchemaStore, Table};
use crate::source::{EventSource, SourcePoll};
use crate::table_cache::TableCache;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    Idle,
    Starting,
    Running,
    /// 열린 트랜잭션을 마저 내보내는 중
    StopRequested,
    Stopped,
}

/// 다른 태스크에서 협조적 정지를 요청하는 핸들
#[derive(Debug, Clone)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
    state: watch::Receiver<ReplicatorState>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("Replicator stop requested");
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state.borrow()
    }

    /// Stopped 가 될 때까지 대기. 시간 안에 멈추지 않으면 `StopTimeout`
    pub async fn wait_stopped(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state.clone();
        // 보내는 쪽이 사라진 경우도 멈춘 것으로 봄
        let stopped = tokio::time::timeout(timeout, rx.wait_for(|s| *s == ReplicatorState::Stopped))
            .await
            .is_ok();
        if stopped {
            Ok(())
        } else {
            Err(CdcError::StopTimeout(timeout))
        }
    }
}

/// `get_row` 결과
#[derive(Debug)]
pub enum NextRow {
    Row(RowEvent),
    /// timeout 안에 준비된 행 없음
    Idle,
    /// 스트림 종료
    Eof,
}

struct OpenTransaction {
    buffer: RowBuffer,
    row_query: Option<String>,
    /// 메타 DB 밖의 (내보낼) 행 수
    output_rows: usize,
}

/// 커밋되어 내보내는 중인 트랜잭션
struct CommittedTransaction {
    buffer: RowBuffer,
    /// 아직 꺼내지 않은 출력 행 수
    output_rows: usize,
    position: Position,
}

pub struct Replicator {
    config: ReplicatorConfig,
    source: Box<dyn EventSource>,
    schema_store: SchemaStore,
    filter: Option<Arc<Filter>>,
    codec: Arc<dyn ColumnCodec>,
    heartbeats: Arc<HeartbeatMonitor>,
    table_cache: TableCache,

    tx: Option<OpenTransaction>,
    ready: Option<CommittedTransaction>,
    /// 트랜잭션 밖 DDL 행
    ready_rows: VecDeque<RowEvent>,
    /// 트랜잭션 시작으로 간주하고 다시 처리할 이벤트
    replay: Option<BinlogEvent>,

    position: Position,
    pending_position: Option<Position>,
    last_heartbeat: Option<i64>,
    gtid_set: Option<GtidSet>,
    current_gtid: Option<String>,

    state: watch::Sender<ReplicatorState>,
    stop_requested: Arc<AtomicBool>,
}

impl Replicator {
    pub fn new(
        config: ReplicatorConfig,
        source: Box<dyn EventSource>,
        schema_store: SchemaStore,
        codec: Arc<dyn ColumnCodec>,
        heartbeats: Arc<HeartbeatMonitor>,
        initial: Position,
    ) -> Result<Self> {
        let gtid_set = initial.binlog.parsed_gtid_set()?;
        let (state, _) = watch::channel(ReplicatorState::Idle);
        Ok(Replicator {
            config,
            source,
            schema_store,
            filter: None,
            codec,
            heartbeats,
            table_cache: TableCache::new(),
            tx: None,
            ready: None,
            ready_rows: VecDeque::new(),
            replay: None,
            last_heartbeat: initial.last_heartbeat,
            position: initial,
            pending_position: None,
            gtid_set,
            current_gtid: None,
            state,
            stop_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_filter(mut self, filter: Arc<Filter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            requested: self.stop_requested.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> ReplicatorState {
        *self.state.borrow()
    }

    /// 마지막으로 내보낸 위치
    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn last_heartbeat(&self) -> Option<i64> {
        self.last_heartbeat
    }

    pub fn schema_store(&self) -> &SchemaStore {
        &self.schema_store
    }

    pub fn table_cache(&self) -> &TableCache {
        &self.table_cache
    }

    pub fn heartbeats(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeats
    }

    /// 아직 끝까지 내보내지 않은 트랜잭션이 있는지
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
            || self.replay.is_some()
            || !self.ready_rows.is_empty()
            || self.ready.as_ref().is_some_and(|tx| !tx.buffer.is_empty())
    }

    fn set_state(&self, state: ReplicatorState) {
        self.state.send_replace(state);
    }

    /// 시작 위치에 맞는 스키마 복원 (없으면 설정에 따라 부트스트랩)
    pub async fn start(&mut self) -> Result<()> {
        self.set_state(ReplicatorState::Starting);
        let position = self.position.clone();
        match self.schema_store.initialize(&position).await {
            Ok(saved) => {
                info!(
                    "Replicator starting at {} with schema {:?} ({} tables)",
                    position,
                    saved.schema_id,
                    saved.schema.table_count()
                );
                self.set_state(ReplicatorState::Running);
                Ok(())
            }
            Err(e) => {
                self.set_state(ReplicatorState::Stopped);
                Err(e)
            }
        }
    }

    /// 출력 없이 위치만 전진해야 하는 지점 (걸러진 트랜잭션, 출력하지 않는 DDL 등)
    pub fn take_pending_position(&mut self) -> Option<Position> {
        let position = self.pending_position.take()?;
        if position.newer_than(&self.position) {
            self.position = position.clone();
        }
        Some(position)
    }

    fn set_pending(&mut self, position: Position) {
        let newer = self
            .pending_position
            .as_ref()
            .map_or(true, |pending| position.newer_than(pending));
        if newer {
            self.pending_position = Some(position);
        }
    }

    fn emit(&mut self, row: RowEvent) -> NextRow {
        if row.position.newer_than(&self.position) {
            self.position = row.position.clone();
        }
        NextRow::Row(row)
    }

    /// 다음 행 하나. 버퍼가 비어 있을 때만 스트림에서 새 이벤트를 읽음
    pub async fn get_row(&mut self, timeout: Duration) -> Result<NextRow> {
        if self.schema_store.schema().is_none() {
            self.start().await?;
        }

        loop {
            if let Some(row) = self.ready_rows.pop_front() {
                return Ok(self.emit(row));
            }

            if let Some(ready) = self.ready.as_mut() {
                match ready.buffer.pop()? {
                    Some(mut row) => {
                        if row.database != self.config.meta_database {
                            ready.output_rows = ready.output_rows.saturating_sub(1);
                            // 뒤에 메타 행만 남았으면 이 행이 커밋 표시를 받음
                            if ready.output_rows == 0 && !row.tx_commit {
                                row.tx_commit = true;
                                row.position = ready.position.clone();
                            }
                        }
                        if let Some(row) = self.intercept(row) {
                            return Ok(self.emit(row));
                        }
                        continue;
                    }
                    None => self.ready = None,
                }
            }

            let polled = match self.replay.take() {
                Some(event) => SourcePoll::Event(event),
                None => self.source.poll(timeout).await?,
            };
            match polled {
                SourcePoll::Event(event) => self.process_event(event).await?,
                SourcePoll::Idle => return Ok(NextRow::Idle),
                SourcePoll::Closed => {
                    if let Some(tx) = self.tx.take() {
                        warn!(
                            "Event stream closed inside a transaction, discarding {} buffered rows",
                            tx.buffer.len()
                        );
                    }
                    return Ok(NextRow::Eof);
                }
            }
        }
    }

    async fn process_event(&mut self, event: BinlogEvent) -> Result<()> {
        if self.tx.is_some() {
            return self.process_transaction_event(event).await;
        }

        if event.data.is_rows() {
            warn!("Started replication stream inside a transaction at {}", event.position);
            warn!("Assuming new transaction at unexpected {:?}", event.header.event_type);
            self.begin_transaction(&event, None);
            self.replay = Some(event);
            return Ok(());
        }

        match &event.data {
            BinlogEventData::TableMap(data) => self.process_table_map(data),
            BinlogEventData::Query(q) if event.is_begin() => {
                self.begin_transaction(&event, Some(q.thread_id));
                Ok(())
            }
            BinlogEventData::Query(_) if event.is_commit() => Ok(()),
            BinlogEventData::Query(q) => self.process_query_event(&event, q).await,
            BinlogEventData::Rotate(rotate) => {
                debug!("Rotating to {}", rotate.next_binlog_name);
                self.table_cache.clear();
                Ok(())
            }
            BinlogEventData::Gtid(gtid) => {
                self.current_gtid = Some(gtid.gtid.clone());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn process_transaction_event(&mut self, event: BinlogEvent) -> Result<()> {
        if event.is_commit() {
            return self.commit_transaction(&event);
        }

        match &event.data {
            BinlogEventData::TableMap(data) => self.process_table_map(data),
            BinlogEventData::WriteRows(_)
            | BinlogEventData::UpdateRows(_)
            | BinlogEventData::DeleteRows(_) => self.buffer_rows(&event),
            BinlogEventData::RowsQuery(query) => {
                if let Some(tx) = self.tx.as_mut() {
                    tx.row_query = Some(query.clone());
                }
                Ok(())
            }
            BinlogEventData::Query(q) => self.process_statement_in_transaction(&event, q).await,
            _ => Ok(()),
        }
    }

    fn begin_transaction(&mut self, event: &BinlogEvent, thread_id: Option<u32>) {
        let mut buffer = RowBuffer::new(self.config.max_tx_elements);
        buffer.set_server_id(event.header.server_id as u64);
        if let Some(thread_id) = thread_id {
            buffer.set_thread_id(thread_id as u64);
        }
        self.tx = Some(OpenTransaction {
            buffer,
            row_query: None,
            output_rows: 0,
        });
    }

    fn commit_transaction(&mut self, event: &BinlogEvent) -> Result<()> {
        let Some(mut tx) = self.tx.take() else {
            return Ok(());
        };
        self.fold_gtid()?;
        let position = self.position_at(&event.next_position);

        let xid = match &event.data {
            BinlogEventData::Xid(x) => Some(x.xid),
            _ => None,
        };
        tx.buffer.set_xid(xid);
        tx.buffer.set_schema_id(self.schema_store.schema_id());

        match tx.buffer.last_mut() {
            Some(last) => {
                last.tx_commit = true;
                last.position = position.clone();
                self.ready = Some(CommittedTransaction {
                    buffer: tx.buffer,
                    output_rows: tx.output_rows,
                    position,
                });
            }
            None => {
                debug!("Transaction at {} produced no output", position);
                self.set_pending(position);
            }
        }
        Ok(())
    }

    async fn process_statement_in_transaction(
        &mut self,
        event: &BinlogEvent,
        q: &QueryEventData,
    ) -> Result<()> {
        let sql = q.query.trim();
        let upper = sql.to_uppercase();

        if upper.starts_with("SAVEPOINT") {
            debug!("Ignoring SAVEPOINT in transaction: {}", sql);
        } else if is_create_table(sql) {
            // CREATE TABLE ... SELECT 는 트랜잭션 안에 들어옴
            return self.process_query_event(event, q).await;
        } else if upper.starts_with("INSERT INTO MYSQL.RDS_")
            || upper.starts_with("DELETE FROM MYSQL.RDS_")
            || upper.starts_with("DROP TEMPORARY TABLE")
            || upper.starts_with("# DUMMY EVENT")
        {
            debug!("Ignoring statement in transaction: {}", sql);
        } else {
            warn!("Unhandled query at {} inside transaction: {}", event.position, sql);
        }
        Ok(())
    }

    /// DDL 처리: 스키마 반영, 테이블 캐시 비우기, DDL 행 생성
    async fn process_query_event(&mut self, event: &BinlogEvent, q: &QueryEventData) -> Result<()> {
        if self.tx.is_none() {
            self.fold_gtid()?;
        }
        let position = self.position_at(&event.next_position);
        let sql = q.query.trim();

        let changes = match self.schema_store.process_sql(sql, &q.database, &position).await {
            Ok(changes) => changes,
            Err(e) if self.config.skip_ddl_errors => {
                warn!("Skipping DDL at {} that failed to apply ({}): {}", position, e, sql);
                Vec::new()
            }
            Err(e) => {
                error!("Failed to process DDL at {}: {}", position, sql);
                return Err(e);
            }
        };
        self.table_cache.clear();
        if changes.is_empty() {
            return Ok(());
        }
        info!("Applied {} schema changes at {}", changes.len(), position);

        let schema_id = self.schema_store.schema_id();
        let mut rows = Vec::new();
        if self.config.output.output_ddl {
            for change in changes {
                if change.database() == self.config.meta_database {
                    continue;
                }
                let mut row = RowEvent::ddl(change, sql, event.timestamp_ms(), position.clone());
                row.server_id = Some(event.header.server_id as u64);
                row.thread_id = Some(q.thread_id as u64);
                row.schema_id = schema_id;
                rows.push(row);
            }
        }

        match self.tx.as_mut() {
            Some(tx) => {
                tx.output_rows += rows.len();
                for row in rows {
                    tx.buffer.add(row)?;
                }
            }
            None if rows.is_empty() => self.set_pending(position),
            None => self.ready_rows.extend(rows),
        }
        Ok(())
    }

    fn process_table_map(&mut self, data: &TableMapData) -> Result<()> {
        let schema = self
            .schema_store
            .schema()
            .ok_or_else(|| CdcError::Other("Replicator has no schema loaded".to_string()))?;
        self.table_cache.process_table_map(
            data,
            schema,
            self.filter.as_deref(),
            self.config.ignore_missing_schema,
        )
    }

    /// 메타 DB 의 heartbeats 는 필터와 무관하게 통과
    fn should_output_table(&self, database: &str, table: &str) -> bool {
        if Filter::is_system_blacklisted(database, table) {
            return false;
        }
        if database == self.config.meta_database && table == HEARTBEATS_TABLE {
            return true;
        }
        self.filter.as_ref().map_or(true, |f| f.includes(database, table))
    }

    fn buffer_rows(&mut self, event: &BinlogEvent) -> Result<()> {
        let Some(table_id) = event.data.table_id() else {
            return Ok(());
        };
        let Some(table) = self.table_cache.get(table_id).cloned() else {
            if let Some(name) = self.table_cache.blacklisted_name(table_id) {
                debug!("Skipping rows of blacklisted table {}", name);
            } else {
                debug!("Skipping rows of unmapped table id {}", table_id);
            }
            return Ok(());
        };
        if !self.should_output_table(&table.database, &table.name) {
            return Ok(());
        }

        let position = self.position_at(&event.next_position);
        let row_query = self.tx.as_ref().and_then(|tx| tx.row_query.clone());
        let rows = self.materialize(event, &table, &position, row_query)?;

        let is_meta = table.database == self.config.meta_database;
        let filter = self.filter.as_deref();
        let Some(tx) = self.tx.as_mut() else {
            return Ok(());
        };
        for row in rows {
            let keep = is_meta
                || match (filter, row.data()) {
                    (Some(f), Some(data)) => f.matches_values(&table.database, &table.name, data),
                    _ => true,
                };
            if keep {
                if !is_meta {
                    tx.output_rows += 1;
                }
                tx.buffer.add(row)?;
            }
        }
        Ok(())
    }

    fn materialize(
        &self,
        event: &BinlogEvent,
        table: &Table,
        position: &Position,
        row_query: Option<String>,
    ) -> Result<Vec<RowEvent>> {
        let ts = event.timestamp_ms();
        let (db, name) = (table.database.as_str(), table.name.as_str());
        let mut out = Vec::new();

        match &event.data {
            BinlogEventData::WriteRows(d) => {
                for cells in &d.rows {
                    let row = self
                        .row_data(table, &d.columns_present, cells)
                        .map(|data| RowEvent::insert(db, name, data, ts, position.clone()));
                    self.collect_row(row, &mut out)?;
                }
            }
            BinlogEventData::DeleteRows(d) => {
                for cells in &d.rows {
                    let row = self
                        .row_data(table, &d.columns_present, cells)
                        .map(|data| RowEvent::delete(db, name, data, ts, position.clone()));
                    self.collect_row(row, &mut out)?;
                }
            }
            BinlogEventData::UpdateRows(d) => {
                for (before, after) in &d.rows {
                    let row = self.row_data(table, &d.columns_present, before).and_then(|old| {
                        let data = self.row_data(table, &d.columns_changed, after)?;
                        let old_data: RowData = old
                            .into_iter()
                            .filter(|(column, value)| data.get(column).is_some_and(|new| new != value))
                            .collect();
                        Ok(RowEvent::update(db, name, data, old_data, ts, position.clone()))
                    });
                    self.collect_row(row, &mut out)?;
                }
            }
            _ => {}
        }

        for row in out.iter_mut() {
            row.pk_columns = table.pk_columns.clone();
            row.row_query = row_query.clone();
        }
        Ok(out)
    }

    fn collect_row(&self, row: Result<RowEvent>, out: &mut Vec<RowEvent>) -> Result<()> {
        match row {
            Ok(row) => {
                out.push(row);
                Ok(())
            }
            Err(e @ CdcError::ColumnCast { .. })
                if self.config.cast_failure == CastFailurePolicy::SkipRow =>
            {
                warn!("Skipping row: {}", e);
                Ok(())
            }
            Err(e) => {
                error!("{}", e);
                Err(e)
            }
        }
    }

    /// 셀 값을 컬럼 이름과 짝지음. 셀은 비트맵에 포함된 컬럼만 순서대로 들어 있음
    fn row_data(&self, table: &Table, bitmap: &[u8], cells: &[CellValue]) -> Result<RowData> {
        let indexes: Vec<usize> = (0..table.columns.len())
            .filter(|i| column_included(bitmap, *i))
            .collect();
        if indexes.len() != cells.len() {
            return Err(CdcError::InvalidSchema(format!(
                "{} has {} columns in schema but the row event carries {}",
                table.full_name(),
                indexes.len(),
                cells.len()
            )));
        }

        let mut data = RowData::new();
        for (index, cell) in indexes.into_iter().zip(cells) {
            let column = &table.columns[index];
            let value = self
                .codec
                .to_json(column, cell)
                .map_err(|e| e.into_error(&table.database, &table.name))?;
            data.insert(column.name.clone(), value);
        }
        Ok(data)
    }

    /// 메타 DB 행 처리: 우리 하트비트는 하트비트 행으로, 나머지는 버림
    fn intercept(&mut self, row: RowEvent) -> Option<RowEvent> {
        if row.database != self.config.meta_database {
            return Some(row);
        }

        let heartbeat = match (row.table.as_deref(), row.operation(), row.data()) {
            (Some(HEARTBEATS_TABLE), RowOperation::Insert | RowOperation::Update, Some(data)) => {
                let ours = data.get("client_id").and_then(Value::as_str) == Some(self.config.client_id.as_str());
                data.get("heartbeat").and_then(Value::as_i64).filter(|_| ours)
            }
            _ => None,
        };

        match heartbeat {
            Some(value) => {
                debug!("Replicator picked up heartbeat {}", value);
                self.last_heartbeat = Some(value);
                self.heartbeats.heartbeat(value);
                let mut marker = RowEvent::heartbeat(row.database, value, row.timestamp_ms, &row.position);
                marker.xid = row.xid;
                marker.server_id = row.server_id;
                Some(marker)
            }
            None => {
                if row.should_advance_position() {
                    self.set_pending(row.position);
                }
                None
            }
        }
    }

    fn fold_gtid(&mut self) -> Result<()> {
        let gtid = self.current_gtid.take();
        if let (Some(set), Some(gtid)) = (self.gtid_set.as_mut(), gtid) {
            set.add_gtid(&gtid)?;
        }
        Ok(())
    }

    fn position_at(&self, binlog: &BinlogPosition) -> Position {
        let mut binlog = binlog.clone();
        if let Some(set) = &self.gtid_set {
            binlog.gtid_set = Some(set.to_string());
        }
        Position::new(binlog, self.last_heartbeat)
    }

    /// producer 로 행을 넘기는 메인 루프
    ///
    /// 정지 요청은 열린 트랜잭션을 다 내보낸 뒤에만 받아들입니다.
    pub async fn run(&mut self, producer: &mut dyn Producer, ctx: &ProducerContext) -> Result<()> {
        if self.schema_store.schema().is_none() {
            self.start().await?;
        }
        self.set_state(ReplicatorState::Running);

        let result = self.run_loop(producer, ctx).await;
        let flushed = producer.flush().await;
        self.set_state(ReplicatorState::Stopped);
        result?;
        flushed
    }

    async fn run_loop(&mut self, producer: &mut dyn Producer, ctx: &ProducerContext) -> Result<()> {
        loop {
            ctx.check()?;

            if self.stop_requested.load(Ordering::SeqCst) {
                if !self.in_transaction() {
                    info!("Replicator stopping at {}", self.position);
                    return Ok(());
                }
                if self.state() != ReplicatorState::StopRequested {
                    info!("Finishing open transaction before stopping");
                    self.set_state(ReplicatorState::StopRequested);
                }
            }

            let next = self.get_row(self.config.poll_timeout).await?;
            if let Some(position) = self.take_pending_position() {
                producer.advance_position(&position, ctx);
            }

            match next {
                NextRow::Eof => {
                    info!("Event stream ended at {}", self.position);
                    return Ok(());
                }
                NextRow::Idle => {}
                NextRow::Row(row) => {
                    if let RowPayload::Heartbeat { heartbeat } = row.payload {
                        producer.advance_position(&row.position, ctx);
                        if self.config.stop_at_heartbeat.is_some_and(|stop| heartbeat >= stop) {
                            info!("Read final heartbeat {}, stopping replicator", heartbeat);
                            return Ok(());
                        }
                        continue;
                    }
                    self.deliver(producer, ctx, row).await?;
                }
            }
        }
    }

    async fn deliver(&mut self, producer: &mut dyn Producer, ctx: &ProducerContext, row: RowEvent) -> Result<()> {
        let position = row.position.clone();
        let safe = row.should_advance_position();
        match producer.push(row).await {
            Ok(()) if producer.acknowledges_later() => Ok(()),
            Ok(()) => {
                ctx.advance(&position, safe);
                Ok(())
            }
            // 비동기 producer 의 위치는 확인 순서로만 올라감
            Err(e) if producer.acknowledges_later() => ctx.apply_failure_policy(&position, e),
            Err(e) => ctx.failed_at(&position, safe, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultColumnCodec;
    use crate::config::{OutputConfig, ProducerFailurePolicy};
    use crate::filter::FilterConfig;
    use crate::position_store::PositionTracker;
    use crate::producer::BufferedProducer;
    use crate::schema::{ColumnDef, Database, SchemaChange, StaticDdlResolver};
    use crate::test_support::*;
    use serde_json::json;
    use tokio_test::assert_err;

    const POLL: Duration = Duration::from_millis(1);

    fn config() -> ReplicatorConfig {
        ReplicatorConfig::new("test").with_meta_database(META_DB)
    }

    fn replicator(
        config: ReplicatorConfig,
        script: EventScript,
        live: crate::schema::Schema,
        resolver: StaticDdlResolver,
        filter: Option<Arc<Filter>>,
    ) -> Replicator {
        let (store, _) = schema_store(live, resolver, filter.clone());
        let replicator = Replicator::new(
            config,
            Box::new(script.into_source()),
            store,
            Arc::new(DefaultColumnCodec),
            Arc::new(HeartbeatMonitor::new()),
            Position::at(FILE, 4),
        )
        .unwrap();
        match filter {
            Some(filter) => replicator.with_filter(filter),
            None => replicator,
        }
    }

    async fn drain(replicator: &mut Replicator) -> Vec<RowEvent> {
        let mut rows = Vec::new();
        loop {
            match replicator.get_row(POLL).await.unwrap() {
                NextRow::Row(row) => rows.push(row),
                NextRow::Idle => continue,
                NextRow::Eof => return rows,
            }
        }
    }

    fn context() -> (ProducerContext, Arc<PositionTracker>) {
        let tracker = Arc::new(PositionTracker::new(None));
        (
            ProducerContext::new(tracker.clone(), ProducerFailurePolicy::Terminate),
            tracker,
        )
    }

    fn shop_schema(tables: Vec<Table>) -> crate::schema::Schema {
        let mut schema = schema_with(tables);
        if !schema.has_database("shop") {
            schema
                .databases
                .push(Database::new("shop", Some("utf8mb4".to_string())));
        }
        schema
    }

    #[tokio::test]
    async fn test_basic_insert_after_create_table() {
        let create = "CREATE TABLE t (id int, v varchar(10), PRIMARY KEY (id))";
        let resolver = StaticDdlResolver::new().register(
            create,
            vec![SchemaChange::TableCreate {
                table: simple_table("shop", "t"),
                like: None,
                if_not_exists: false,
            }],
        );
        let script = EventScript::new(FILE)
            .query("shop", create)
            .insert_tx(10, "shop", "t", 1, "a", 100);
        let mut config = config();
        config.output.output_ddl = true;
        let mut replicator = replicator(config, script, shop_schema(vec![]), resolver, None);

        let rows = drain(&mut replicator).await;
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_ddl());
        assert_eq!(rows[0].table.as_deref(), Some("t"));

        let insert = &rows[1];
        assert_eq!(insert.operation(), RowOperation::Insert);
        assert_eq!(insert.data(), json!({"id": 1, "v": "a"}).as_object());
        assert_eq!(insert.pk_columns, vec!["id"]);
        assert!(insert.tx_commit);
        assert_eq!(insert.xid, Some(100));
        assert!(insert.position.newer_than(&rows[0].position));
        assert!(replicator.schema_store().schema().unwrap().find_table("shop", "t").is_some());
    }

    #[tokio::test]
    async fn test_update_diff_only_changed_columns() {
        let script = EventScript::new(FILE)
            .begin()
            .table_map(10, "shop", "t")
            .update(10, vec![(row(1, "a"), row(1, "b"))])
            .commit(5);
        let mut replicator = replicator(
            config(),
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );

        let rows = drain(&mut replicator).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data(), json!({"id": 1, "v": "b"}).as_object());
        assert_eq!(rows[0].old_data(), json!({"v": "a"}).as_object());
    }

    #[tokio::test]
    async fn test_transaction_atomicity_and_position_monotonicity() {
        let script = EventScript::new(FILE)
            .begin()
            .table_map(10, "shop", "t")
            .insert(10, vec![row(1, "a"), row(2, "b")])
            .delete(10, vec![row(3, "c")])
            .commit(1)
            .begin()
            .table_map(10, "shop", "t")
            .insert(10, vec![row(4, "d")])
            .commit(2)
            .rotate("mysql-bin.000002")
            .insert_tx(11, "shop", "t", 5, "e", 3);
        let mut replicator = replicator(
            config(),
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );

        let rows = drain(&mut replicator).await;
        assert_eq!(rows.len(), 5);
        for pair in rows.windows(2) {
            assert!(pair[1].position.stream_cmp(&pair[0].position).is_ge());
        }

        let xids: Vec<_> = rows.iter().map(|r| r.xid).collect();
        assert_eq!(xids, vec![Some(1), Some(1), Some(1), Some(2), Some(3)]);
        let commits: Vec<_> = rows.iter().map(|r| r.tx_commit).collect();
        assert_eq!(commits, vec![false, false, true, true, true]);
        let xoffsets: Vec<_> = rows.iter().map(|r| r.xoffset).collect();
        assert_eq!(xoffsets, vec![0, 1, 2, 0, 0]);
        assert_eq!(rows[4].position.file(), "mysql-bin.000002");
        assert_eq!(rows[0].thread_id, Some(7));
        assert_eq!(rows[0].server_id, Some(SERVER_ID));
    }

    #[tokio::test]
    async fn test_large_transaction_spills_in_order() {
        let values: Vec<_> = (1..=7).map(|i| row(i, "x")).collect();
        let script = EventScript::new(FILE)
            .begin()
            .table_map(10, "shop", "t")
            .insert(10, values)
            .commit(9);
        let mut replicator = replicator(
            config().with_max_tx_elements(2),
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );

        let rows = drain(&mut replicator).await;
        let ids: Vec<_> = rows.iter().map(|r| r.data().unwrap()["id"].clone()).collect();
        assert_eq!(ids, (1..=7).map(|i| json!(i)).collect::<Vec<_>>());
        assert_eq!(rows.iter().filter(|r| r.tx_commit).count(), 1);
        assert!(rows[6].tx_commit);
    }

    #[tokio::test]
    async fn test_orphan_rows_at_stream_start() {
        let script = EventScript::starting_at(FILE, 400)
            .table_map(10, "shop", "t")
            .insert(10, vec![row(1, "a")])
            .commit(3)
            .insert_tx(10, "shop", "t", 2, "b", 4);
        let mut replicator = replicator(
            config(),
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );

        let rows = drain(&mut replicator).await;
        assert_eq!(rows.len(), 2);
        assert!(rows[0].tx_commit);
        assert_eq!(rows[0].xid, Some(3));
    }

    #[tokio::test]
    async fn test_heartbeat_is_intercepted_and_never_pushed() {
        let script = EventScript::new(FILE)
            .heartbeat(50, "other", 111)
            .heartbeat(50, "test", 222)
            .insert_tx(10, "shop", "t", 1, "a", 9);
        let mut replicator = replicator(
            config(),
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );
        let (ctx, tracker) = context();
        let producer = BufferedProducer::new();
        let mut sink = producer.clone();

        replicator.run(&mut sink, &ctx).await.unwrap();

        let rows = producer.rows();
        assert_eq!(rows.len(), 1);
        assert!(rows.iter().all(|r| !r.is_heartbeat() && r.database != META_DB));
        assert_eq!(replicator.heartbeats().last_heartbeat(), Some(222));
        assert_eq!(replicator.last_heartbeat(), Some(222));
        // 하트비트 이후 행의 위치에도 마지막 하트비트가 실림
        assert_eq!(rows[0].position.last_heartbeat, Some(222));
        assert_eq!(tracker.position(), Some(rows[0].position.clone()));
        assert_eq!(replicator.state(), ReplicatorState::Stopped);
    }

    #[tokio::test]
    async fn test_commit_flag_moves_past_trailing_heartbeat() {
        let script = EventScript::new(FILE)
            .begin()
            .table_map(10, "shop", "t")
            .insert(10, vec![row(1, "a"), row(2, "b")])
            .table_map(50, META_DB, "heartbeats")
            .insert(
                50,
                vec![vec![
                    CellValue::UInt64(SERVER_ID),
                    CellValue::String("test".to_string()),
                    CellValue::Int64(333),
                ]],
            )
            .commit(5);
        let commit_offset = script.events().last().unwrap().next_position.offset;
        let mut replicator = replicator(
            config(),
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );
        let (ctx, tracker) = context();
        let producer = BufferedProducer::new();
        let mut sink = producer.clone();

        replicator.run(&mut sink, &ctx).await.unwrap();

        let rows = producer.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|r| r.tx_commit).count(), 1);
        assert!(rows[1].tx_commit);
        assert_eq!(rows[1].position.offset(), commit_offset);
        assert_eq!(replicator.last_heartbeat(), Some(333));
        assert_eq!(tracker.position().unwrap().offset(), commit_offset);
    }

    #[tokio::test]
    async fn test_stop_at_heartbeat() {
        let script = EventScript::new(FILE)
            .insert_tx(10, "shop", "t", 1, "a", 1)
            .heartbeat(50, "test", 500)
            .insert_tx(10, "shop", "t", 2, "b", 2);
        let mut config = config();
        config.stop_at_heartbeat = Some(500);
        let mut replicator = replicator(
            config,
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );
        let (ctx, tracker) = context();
        let producer = BufferedProducer::new();
        let mut sink = producer.clone();

        replicator.run(&mut sink, &ctx).await.unwrap();
        assert_eq!(producer.len(), 1);
        assert_eq!(tracker.position().unwrap().last_heartbeat, Some(500));
    }

    #[tokio::test]
    async fn test_blacklist_suppresses_ddl_but_exclusion_only_rows() {
        let alter_hidden = "ALTER TABLE hidden ADD COLUMN extra int";
        let alter_secret = "ALTER TABLE s ADD COLUMN extra int";
        let add_extra = |db: &str, table: &str| SchemaChange::TableAlter {
            database: db.to_string(),
            table: table.to_string(),
            new_database: None,
            new_table: None,
            column_mods: vec![crate::schema::ColumnMod::Add {
                column: ColumnDef::new("extra", "int"),
                position: Default::default(),
            }],
            charset: None,
            pk: None,
        };
        let resolver = StaticDdlResolver::new()
            .register(alter_hidden, vec![add_extra("shop", "hidden")])
            .register(alter_secret, vec![add_extra("secret", "s")]);
        let filter = Arc::new(
            Filter::new(&FilterConfig {
                exclude_tables: vec!["shop.hidden".to_string()],
                blacklist: vec!["secret".to_string()],
                ..Default::default()
            })
            .unwrap(),
        );
        let script = EventScript::new(FILE)
            .query("shop", alter_hidden)
            .query("secret", alter_secret)
            .begin()
            .table_map(10, "shop", "hidden")
            .insert(10, vec![vec![CellValue::Int32(1), CellValue::String("a".into()), CellValue::Int32(5)]])
            .table_map(11, "secret", "s")
            .insert(11, vec![row(2, "b")])
            .commit(1);
        let mut config = config();
        config.output.output_ddl = true;
        let live = shop_schema(vec![simple_table("shop", "hidden"), simple_table("secret", "s")]);
        let mut replicator = replicator(config, script, live, resolver, Some(filter));

        let rows = drain(&mut replicator).await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_ddl());
        assert_eq!(rows[0].table.as_deref(), Some("hidden"));

        let schema = replicator.schema_store().schema().unwrap();
        assert_eq!(schema.find_table("shop", "hidden").unwrap().columns.len(), 3);
        assert_eq!(schema.find_table("secret", "s").unwrap().columns.len(), 2);
        assert!(replicator.table_cache().is_blacklisted(11));
        // 전부 걸러진 트랜잭션도 위치는 전진
        assert_eq!(replicator.take_pending_position().unwrap().offset(), 4 + 50 * 8);
    }

    #[tokio::test]
    async fn test_filtered_transaction_advances_tracker() {
        let filter = Arc::new(
            Filter::new(&FilterConfig {
                include_databases: vec!["other".to_string()],
                ..Default::default()
            })
            .unwrap(),
        );
        let script = EventScript::new(FILE).insert_tx(10, "shop", "t", 1, "a", 1);
        let end = script.offset();
        let mut replicator = replicator(
            config(),
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            Some(filter),
        );
        let (ctx, tracker) = context();
        let producer = BufferedProducer::new();
        let mut sink = producer.clone();

        replicator.run(&mut sink, &ctx).await.unwrap();
        assert!(producer.is_empty());
        assert_eq!(tracker.position().unwrap().offset(), end);
    }

    #[tokio::test]
    async fn test_ignored_statements_inside_transaction() {
        let script = EventScript::new(FILE)
            .begin()
            .query("shop", "SAVEPOINT sp1")
            .query("", "INSERT INTO mysql.rds_heartbeat2(id, value) values (1, 2)")
            .query("shop", "DROP TEMPORARY TABLE IF EXISTS tmp")
            .table_map(10, "shop", "t")
            .rows_query("insert into t values (1, 'a')")
            .insert(10, vec![row(1, "a")])
            .commit(1);
        let mut replicator = replicator(
            config(),
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );

        let rows = drain(&mut replicator).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_query.as_deref(), Some("insert into t values (1, 'a')"));
    }

    #[tokio::test]
    async fn test_cast_failure_policy() {
        let bad = || {
            EventScript::new(FILE)
                .begin()
                .table_map(10, "shop", "t")
                .insert(10, vec![vec![CellValue::String("abc".into()), CellValue::String("a".into())]])
                .insert(10, vec![row(2, "b")])
                .commit(1)
        };
        let schema = || shop_schema(vec![simple_table("shop", "t")]);

        let mut strict = replicator(config(), bad(), schema(), StaticDdlResolver::new(), None);
        let err = assert_err!(strict.get_row(POLL).await);
        assert!(matches!(err, CdcError::ColumnCast { ref column, .. } if column == "id"));

        let mut lenient_config = config();
        lenient_config.cast_failure = CastFailurePolicy::SkipRow;
        let mut lenient = replicator(lenient_config, bad(), schema(), StaticDdlResolver::new(), None);
        let rows = drain(&mut lenient).await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].tx_commit);
    }

    #[tokio::test]
    async fn test_missing_table_and_column_mismatch() {
        let script = EventScript::new(FILE).insert_tx(10, "shop", "unknown", 1, "a", 1);
        let mut r = replicator(config(), script, shop_schema(vec![]), StaticDdlResolver::new(), None);
        let err = assert_err!(r.get_row(POLL).await);
        assert!(err.is_schema_error());

        let script = EventScript::new(FILE)
            .begin()
            .table_map(10, "shop", "t")
            .insert(10, vec![vec![CellValue::Int32(1)]])
            .commit(1);
        let mut r = replicator(
            config(),
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );
        let err = assert_err!(r.get_row(POLL).await);
        assert!(matches!(err, CdcError::InvalidSchema(_)));
    }

    #[tokio::test]
    async fn test_unresolvable_ddl_is_fatal_unless_skipped() {
        let script = || EventScript::new(FILE).query("shop", "ALTER TABLE t ADD COLUMN z int");
        let schema = || shop_schema(vec![simple_table("shop", "t")]);

        let mut strict = replicator(config(), script(), schema(), StaticDdlResolver::new(), None);
        assert_err!(strict.get_row(POLL).await);

        let mut skip_config = config();
        skip_config.skip_ddl_errors = true;
        let mut lenient = replicator(skip_config, script(), schema(), StaticDdlResolver::new(), None);
        assert!(matches!(lenient.get_row(POLL).await.unwrap(), NextRow::Eof));
    }

    #[tokio::test]
    async fn test_gtid_folded_into_commit_position() {
        let uuid = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
        let script = EventScript::new(FILE)
            .gtid(&format!("{}:6", uuid))
            .insert_tx(10, "shop", "t", 1, "a", 1);
        let (store, _) = schema_store(
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );
        let mut start = Position::at(FILE, 4);
        start.binlog.gtid_set = Some(format!("{}:1-5", uuid));
        let mut replicator = Replicator::new(
            config(),
            Box::new(script.into_source()),
            store,
            Arc::new(DefaultColumnCodec),
            Arc::new(HeartbeatMonitor::new()),
            start,
        )
        .unwrap();

        let rows = drain(&mut replicator).await;
        assert_eq!(rows[0].position.binlog.gtid_set.as_deref(), Some(format!("{}:1-6", uuid).as_str()));
    }

    #[tokio::test]
    async fn test_stop_handle() {
        let script = EventScript::new(FILE).insert_tx(10, "shop", "t", 1, "a", 1);
        let mut replicator = replicator(
            config(),
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );
        let handle = replicator.stop_handle();
        assert_eq!(handle.state(), ReplicatorState::Idle);
        let err = assert_err!(handle.wait_stopped(Duration::from_millis(10)).await);
        assert!(matches!(err, CdcError::StopTimeout(_)));

        handle.request_stop();
        let (ctx, _) = context();
        let producer = BufferedProducer::new();
        let mut sink = producer.clone();
        replicator.run(&mut sink, &ctx).await.unwrap();
        handle.wait_stopped(Duration::from_millis(10)).await.unwrap();
        assert!(producer.is_empty());
    }

    #[tokio::test]
    async fn test_output_config_applies_to_rows() {
        let script = EventScript::new(FILE).insert_tx(10, "shop", "t", 1, "a", 42);
        let mut replicator = replicator(
            config(),
            script,
            shop_schema(vec![simple_table("shop", "t")]),
            StaticDdlResolver::new(),
            None,
        );
        let rows = drain(&mut replicator).await;
        let json = rows[0].to_json(&OutputConfig::default());
        assert_eq!(json["type"], "insert");
        assert_eq!(json["xid"], 42);
        assert_eq!(json["commit"], true);
    }
}
