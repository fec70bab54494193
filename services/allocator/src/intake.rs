//! Request event intake.
//!
//! A trigger on `requests` appends a row to the `request_events` outbox for
//! every insert and every status change. The intake worker polls the outbox
//! after its durable checkpoint, turns each row into a [`LifecycleEvent`] and
//! hands it to [`dispatch`]:
//!
//! 1. Fetch the next batch after the checkpoint
//! 2. Dispatch each event in order
//! 3. Advance the checkpoint after each successful dispatch
//! 4. Sleep if the outbox is drained, then repeat
//!
//! Delivery is at-least-once. A crash between dispatch and checkpoint replays
//! the event, which the handlers tolerate. A failed dispatch stops the batch;
//! the same event is retried after the poll interval. Conflicts are retried
//! indefinitely. Any other failure is retried `max_attempts` times, then the
//! event is logged and passed over so later requests keep flowing.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spindit_events::{EventEnvelope, EventError, LifecycleEvent};
use spindit_id::EventId;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{dispatch, EngineContext, EngineError};

/// Checkpoint row owned by the engine's intake worker.
pub const CHECKPOINT_NAME: &str = "allocator";

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("outbox query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type IntakeResult<T> = Result<T, IntakeError>;

/// One outbox row, undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRow {
    pub event_id: EventId,
    pub event_type: String,
    pub request_id: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl OutboxRow {
    pub fn decode(&self) -> Result<EventEnvelope, EventError> {
        let event = LifecycleEvent::from_parts(
            &self.event_type,
            &self.request_id,
            self.from_status.as_deref(),
            self.to_status.as_deref(),
        )?;
        Ok(EventEnvelope {
            event_id: self.event_id,
            occurred_at: self.occurred_at,
            event,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: EventId::new(row.try_get("event_id")?),
            event_type: row.try_get("event_type")?,
            request_id: row.try_get("request_id")?,
            from_status: row.try_get("from_status")?,
            to_status: row.try_get("to_status")?,
            occurred_at: row.try_get("occurred_at")?,
        })
    }
}

/// Where outbox rows and the checkpoint live.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn checkpoint(&self) -> IntakeResult<EventId>;

    async fn fetch_after(&self, cursor: EventId, limit: i64) -> IntakeResult<Vec<OutboxRow>>;

    async fn save_checkpoint(&self, event_id: EventId) -> IntakeResult<()>;
}

/// The `request_events` outbox in Postgres.
#[derive(Clone)]
pub struct PgEventSource {
    pool: PgPool,
}

impl PgEventSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSource for PgEventSource {
    async fn checkpoint(&self) -> IntakeResult<EventId> {
        let last: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT last_event_id
            FROM intake_checkpoints
            WHERE name = $1
            "#,
        )
        .bind(CHECKPOINT_NAME)
        .fetch_optional(&self.pool)
        .await?;
        Ok(EventId::new(last.unwrap_or(0)))
    }

    async fn fetch_after(&self, cursor: EventId, limit: i64) -> IntakeResult<Vec<OutboxRow>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT event_id, event_type, request_id, from_status, to_status, occurred_at
            FROM request_events
            WHERE event_id > $1
            ORDER BY event_id ASC
            LIMIT $2
            "#,
        )
        .bind(cursor.value())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn save_checkpoint(&self, event_id: EventId) -> IntakeResult<()> {
        sqlx::query(
            r#"
            INSERT INTO intake_checkpoints (name, last_event_id, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (name)
            DO UPDATE SET last_event_id = EXCLUDED.last_event_id, updated_at = now()
            "#,
        )
        .bind(CHECKPOINT_NAME)
        .bind(event_id.value())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Configuration for the intake worker.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Maximum number of events to fetch per batch.
    pub batch_size: i64,

    /// How long to sleep when the outbox is drained or a dispatch failed.
    pub poll_interval: Duration,

    /// Failed dispatches of one event before it is skipped.
    pub max_attempts: u32,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

/// Consecutive failures of the event at the head of the outbox.
#[derive(Debug, Default)]
struct Failures {
    event_id: EventId,
    count: u32,
}

pub struct IntakeWorker<S> {
    source: S,
    ctx: EngineContext,
    config: IntakeConfig,
    failures: Mutex<Failures>,
}

impl<S: EventSource> IntakeWorker<S> {
    pub fn new(source: S, ctx: EngineContext, config: IntakeConfig) -> Self {
        Self {
            source,
            ctx,
            config,
            failures: Mutex::new(Failures::default()),
        }
    }

    /// Run the worker until the shutdown signal is received.
    #[instrument(skip(self, shutdown), name = "intake_worker")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> IntakeResult<()> {
        let mut cursor = self.source.checkpoint().await?;
        info!(checkpoint = %cursor, "Starting intake worker");

        let mut events_processed: u64 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let handled = match self.poll_once(&mut cursor).await {
                Ok(handled) => handled,
                Err(e) => {
                    error!(error = %e, checkpoint = %cursor, "Intake batch failed; retrying");
                    0
                }
            };
            events_processed += handled as u64;

            if handled == 0 {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(events_processed, "Intake worker stopped");
        Ok(())
    }

    /// Handles one batch. Returns how many events moved the checkpoint.
    pub async fn poll_once(&self, cursor: &mut EventId) -> IntakeResult<usize> {
        let rows = self
            .source
            .fetch_after(*cursor, self.config.batch_size)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        debug!(count = rows.len(), "Processing outbox batch");

        let mut handled = 0;
        for row in rows {
            match row.decode() {
                Ok(envelope) => {
                    if let Err(e) = dispatch(&self.ctx, &envelope.event).await {
                        if e.is_conflict() || !self.exhausted(row.event_id) {
                            return Err(e.into());
                        }
                        error!(
                            event_id = %row.event_id,
                            event_type = %row.event_type,
                            request_id = %row.request_id,
                            attempts = self.config.max_attempts,
                            error = %e,
                            "Dispatch keeps failing; skipping event"
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        event_id = %row.event_id,
                        event_type = %row.event_type,
                        error = %e,
                        "Skipping undecodable outbox row"
                    );
                }
            }
            self.source.save_checkpoint(row.event_id).await?;
            *cursor = row.event_id;
            handled += 1;
        }
        Ok(handled)
    }

    /// Records a failed dispatch of `event_id`; true once it has failed
    /// `max_attempts` times in a row.
    fn exhausted(&self, event_id: EventId) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if failures.event_id == event_id {
            failures.count += 1;
        } else {
            *failures = Failures { event_id, count: 1 };
        }
        failures.count >= self.config.max_attempts
    }
}
