mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{engine_config, Harness};
use spindit_allocator::clock::ManualClock;
use spindit_allocator::engine::EngineContext;
use spindit_allocator::intake::{
    EventSource, IntakeConfig, IntakeError, IntakeResult, IntakeWorker, OutboxRow,
};
use spindit_allocator::store::{PoolStore, PoolTx, StoreError, StoreResult};
use spindit_events::{LockerStatus, RequestStatus};
use spindit_id::{EventId, RequestId};
use tokio::sync::watch;

/// An outbox held in memory.
#[derive(Default)]
struct VecSource {
    rows: Mutex<Vec<OutboxRow>>,
    checkpoint: Mutex<EventId>,
}

impl VecSource {
    fn push(&self, event_type: &str, request_id: &str, from: Option<&str>, to: Option<&str>) {
        let mut rows = self.rows.lock().unwrap();
        let event_id = EventId::new(rows.len() as i64 + 1);
        rows.push(OutboxRow {
            event_id,
            event_type: event_type.to_string(),
            request_id: request_id.to_string(),
            from_status: from.map(str::to_string),
            to_status: to.map(str::to_string),
            occurred_at: Utc::now(),
        });
    }

    fn saved(&self) -> EventId {
        *self.checkpoint.lock().unwrap()
    }
}

#[async_trait]
impl EventSource for VecSource {
    async fn checkpoint(&self) -> IntakeResult<EventId> {
        Ok(self.saved())
    }

    async fn fetch_after(&self, cursor: EventId, limit: i64) -> IntakeResult<Vec<OutboxRow>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.event_id > cursor)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn save_checkpoint(&self, event_id: EventId) -> IntakeResult<()> {
        *self.checkpoint.lock().unwrap() = event_id;
        Ok(())
    }
}

fn config() -> IntakeConfig {
    IntakeConfig {
        batch_size: 2,
        poll_interval: Duration::from_millis(10),
        max_attempts: 3,
    }
}

/// A store whose transactions never start.
struct BrokenStore {
    conflict: bool,
}

#[async_trait]
impl PoolStore for BrokenStore {
    async fn begin(&self) -> StoreResult<Box<dyn PoolTx>> {
        if self.conflict {
            Err(StoreError::Conflict("rows changed underneath".to_string()))
        } else {
            Err(StoreError::Decode {
                table: "lockers",
                message: "status 'melted'".to_string(),
            })
        }
    }
}

fn broken_context(conflict: bool) -> EngineContext {
    EngineContext::new(
        Arc::new(BrokenStore { conflict }),
        Arc::new(ManualClock::new(common::start())),
        engine_config(),
    )
}

#[tokio::test]
async fn events_are_dispatched_in_order_and_checkpointed() {
    let h = Harness::new();
    h.store.seed_pool(&["A"], 3);
    let request = h.store.insert_request(h.request());
    let id = request.id.to_string();

    let source = VecSource::default();
    source.push("request.created", &id, None, Some("pending"));
    source.push("request.deleted", &id, None, None);
    source.push("request.status_changed", &id, Some("pending"), Some("reserved"));

    let worker = IntakeWorker::new(source, h.ctx.clone(), config());
    let mut cursor = EventId::default();

    assert_eq!(worker.poll_once(&mut cursor).await.unwrap(), 2);
    assert_eq!(cursor, EventId::new(2));
    assert_eq!(h.store.request(request.id).unwrap().status, RequestStatus::Reserved);

    assert_eq!(worker.poll_once(&mut cursor).await.unwrap(), 1);
    assert_eq!(worker.poll_once(&mut cursor).await.unwrap(), 0);
    assert_eq!(cursor, EventId::new(3));
    assert_eq!(h.store.assignments().len(), 1);
}

#[tokio::test]
async fn replayed_events_are_harmless() {
    let h = Harness::new();
    h.store.seed_pool(&["A"], 3);
    let request = h.store.insert_request(h.request());
    let id = request.id.to_string();

    let source = VecSource::default();
    source.push("request.created", &id, None, Some("pending"));
    source.push("request.created", &id, None, Some("pending"));
    let worker = IntakeWorker::new(source, h.ctx.clone(), config());

    let mut cursor = EventId::default();
    worker.poll_once(&mut cursor).await.unwrap();

    assert_eq!(h.store.assignments().len(), 1);
    assert_eq!(
        h.store.lockers().iter().filter(|l| l.status == LockerStatus::Reserved).count(),
        1
    );
}

#[tokio::test]
async fn the_worker_resumes_from_its_checkpoint_and_stops_on_shutdown() {
    let h = Harness::new();
    h.store.seed_pool(&["A"], 3);
    let skipped = h.store.insert_request(h.request());
    let wanted = h.store.insert_request(h.request());

    let source = VecSource::default();
    source.push("request.created", &skipped.id.to_string(), None, Some("pending"));
    source.push("request.created", &wanted.id.to_string(), None, Some("pending"));
    *source.checkpoint.lock().unwrap() = EventId::new(1);

    let worker = IntakeWorker::new(source, h.ctx.clone(), config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.store.assignment_for_request(wanted.id).is_none() {
        assert!(tokio::time::Instant::now() < deadline, "event never dispatched");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stops")
        .unwrap()
        .unwrap();
    assert!(h.store.assignment_for_request(skipped.id).is_none());
    assert_eq!(h.store.request(skipped.id).unwrap().status, RequestStatus::Pending);
}

#[tokio::test]
async fn events_for_unknown_requests_move_the_checkpoint() {
    let h = Harness::new();
    let source = VecSource::default();
    source.push("request.created", &RequestId::new().to_string(), None, Some("pending"));
    let worker = IntakeWorker::new(source, h.ctx.clone(), config());

    let mut cursor = EventId::default();
    assert_eq!(worker.poll_once(&mut cursor).await.unwrap(), 1);
    assert_eq!(cursor, EventId::new(1));
}

#[tokio::test]
async fn a_persistently_failing_event_is_skipped_after_max_attempts() {
    let source = VecSource::default();
    source.push("request.created", &RequestId::new().to_string(), None, Some("pending"));
    source.push("request.created", &RequestId::new().to_string(), None, Some("pending"));
    let worker = IntakeWorker::new(source, broken_context(false), config());

    let mut cursor = EventId::default();
    for _ in 0..2 {
        let err = worker.poll_once(&mut cursor).await.unwrap_err();
        assert!(matches!(err, IntakeError::Engine(_)), "{err:?}");
        assert_eq!(cursor, EventId::default());
    }

    // Third strike: the first event is passed over, the second starts failing.
    assert!(worker.poll_once(&mut cursor).await.is_err());
    assert_eq!(cursor, EventId::new(1));
}

#[tokio::test]
async fn conflicts_are_retried_without_limit() {
    let source = VecSource::default();
    source.push("request.created", &RequestId::new().to_string(), None, Some("pending"));
    let worker = IntakeWorker::new(source, broken_context(true), config());

    let mut cursor = EventId::default();
    for _ in 0..10 {
        assert!(worker.poll_once(&mut cursor).await.is_err());
    }
    assert_eq!(cursor, EventId::default());
}
