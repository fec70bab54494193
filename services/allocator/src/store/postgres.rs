//! Postgres pool store.
//!
//! IDs and statuses are stored as text. Status writes are compare-and-set
//! `UPDATE ... WHERE id = $1 AND status = $2`; a concurrent writer on the same
//! row blocks until the first commits and then sees the new status, so the
//! update matches nothing and reports `false`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spindit_events::{LockerStatus, RenewalStatus, RequestStatus, StatusMachine};
use spindit_id::{AssignmentId, LockerId, RenewalId, RequestId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

use super::{
    AssignmentQuery, LockerQuery, PoolStore, PoolTx, RenewalQuery, StoreError, StoreResult,
};
use crate::model::{Assignment, Locker, Notification, Renewal, Request};

/// Connection settings for the locker database. Only the URL and pool bounds
/// are exposed through the environment.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/spindit".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> StoreResult<Self> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to locker database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    /// Applies the schema and the seeded pool. The binary may run from the
    /// workspace root or the crate directory, so several locations are tried.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/allocator/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator
                        .run(&self.pool)
                        .await
                        .map_err(StoreError::Migration)?;
                    info!("Locker schema up to date");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(StoreError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Pool store over this connection pool.
    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}

/// Pool store backed by Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PoolStore for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn PoolTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

// Row types. Decoding stays with sqlx; turning text columns into typed values
// happens in the `TryFrom` impls so a bad value names its table.

struct LockerRow {
    id: String,
    zone_id: String,
    number: i32,
    status: String,
    note: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for LockerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            zone_id: row.try_get("zone_id")?,
            number: row.try_get("number")?,
            status: row.try_get("status")?,
            note: row.try_get("note")?,
        })
    }
}

impl TryFrom<LockerRow> for Locker {
    type Error = StoreError;

    fn try_from(row: LockerRow) -> StoreResult<Self> {
        Ok(Locker {
            id: parse_column("lockers", &row.id)?,
            zone_id: parse_column("lockers", &row.zone_id)?,
            number: row.number,
            status: parse_column("lockers", &row.status)?,
            note: row.note,
        })
    }
}

struct RequestRow {
    id: String,
    user_id: String,
    school_year: String,
    preferred_locker: Option<String>,
    preferred_zone: Option<String>,
    status: String,
    submitted_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for RequestRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            school_year: row.try_get("school_year")?,
            preferred_locker: row.try_get("preferred_locker")?,
            preferred_zone: row.try_get("preferred_zone")?,
            status: row.try_get("status")?,
            submitted_at: row.try_get("submitted_at")?,
        })
    }
}

impl TryFrom<RequestRow> for Request {
    type Error = StoreError;

    fn try_from(row: RequestRow) -> StoreResult<Self> {
        Ok(Request {
            id: parse_column("requests", &row.id)?,
            user_id: parse_column("requests", &row.user_id)?,
            school_year: parse_column("requests", &row.school_year)?,
            preferred_locker: row.preferred_locker,
            preferred_zone: row.preferred_zone,
            status: parse_column("requests", &row.status)?,
            submitted_at: row.submitted_at,
        })
    }
}

struct AssignmentRow {
    id: String,
    request_id: String,
    locker_id: String,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AssignmentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            request_id: row.try_get("request_id")?,
            locker_id: row.try_get("locker_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = StoreError;

    fn try_from(row: AssignmentRow) -> StoreResult<Self> {
        Ok(Assignment {
            id: parse_column("assignments", &row.id)?,
            request_id: parse_column("assignments", &row.request_id)?,
            locker_id: parse_column("assignments", &row.locker_id)?,
            created_at: row.created_at,
        })
    }
}

struct RenewalRow {
    id: String,
    assignment_id: String,
    request_id: String,
    locker_id: String,
    school_year: String,
    status: String,
    deadline: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for RenewalRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            assignment_id: row.try_get("assignment_id")?,
            request_id: row.try_get("request_id")?,
            locker_id: row.try_get("locker_id")?,
            school_year: row.try_get("school_year")?,
            status: row.try_get("status")?,
            deadline: row.try_get("deadline")?,
            confirmed_at: row.try_get("confirmed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<RenewalRow> for Renewal {
    type Error = StoreError;

    fn try_from(row: RenewalRow) -> StoreResult<Self> {
        Ok(Renewal {
            id: parse_column("renewals", &row.id)?,
            assignment_id: parse_column("renewals", &row.assignment_id)?,
            request_id: parse_column("renewals", &row.request_id)?,
            locker_id: parse_column("renewals", &row.locker_id)?,
            school_year: parse_column("renewals", &row.school_year)?,
            status: parse_column("renewals", &row.status)?,
            deadline: row.deadline,
            confirmed_at: row.confirmed_at,
            created_at: row.created_at,
        })
    }
}

fn parse_column<T>(table: &'static str, raw: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| StoreError::decode(table, format!("'{raw}': {e}")))
}

fn decode_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

const REQUEST_COLUMNS: &str = "id, user_id, school_year, preferred_locker, preferred_zone, \
                               status, submitted_at";

#[async_trait]
impl PoolTx for PgTx {
    async fn locker(&mut self, id: LockerId) -> StoreResult<Option<Locker>> {
        let row = sqlx::query_as::<_, LockerRow>(
            "SELECT id, zone_id, number, status, note FROM lockers WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Locker::try_from).transpose()
    }

    async fn find_lockers(&mut self, query: &LockerQuery) -> StoreResult<Vec<Locker>> {
        let rows = query
            .build()
            .build_query_as::<LockerRow>()
            .fetch_all(&mut *self.tx)
            .await?;
        decode_all(rows)
    }

    async fn transition_locker(
        &mut self,
        id: LockerId,
        from: LockerStatus,
        to: LockerStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE lockers SET status = $3, updated_at = now() WHERE id = $1 AND status = $2",
        )
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn request(&mut self, id: RequestId) -> StoreResult<Option<Request>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1");
        let row = sqlx::query_as::<_, RequestRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(Request::try_from).transpose()
    }

    async fn transition_request(
        &mut self,
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE requests SET status = $3, updated_at = now() WHERE id = $1 AND status = $2",
        )
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn assignment(&mut self, id: AssignmentId) -> StoreResult<Option<Assignment>> {
        let row = sqlx::query_as::<_, AssignmentRow>(
            "SELECT id, request_id, locker_id, created_at FROM assignments WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Assignment::try_from).transpose()
    }

    async fn assignment_for_request(&mut self, id: RequestId) -> StoreResult<Option<Assignment>> {
        let row = sqlx::query_as::<_, AssignmentRow>(
            "SELECT id, request_id, locker_id, created_at FROM assignments WHERE request_id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Assignment::try_from).transpose()
    }

    async fn find_assignments(&mut self, query: &AssignmentQuery) -> StoreResult<Vec<Assignment>> {
        let rows = query
            .build()
            .build_query_as::<AssignmentRow>()
            .fetch_all(&mut *self.tx)
            .await?;
        decode_all(rows)
    }

    async fn insert_assignment(&mut self, assignment: &Assignment) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO assignments (id, request_id, locker_id, created_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(assignment.id.to_string())
        .bind(assignment.request_id.to_string())
        .bind(assignment.locker_id.to_string())
        .bind(assignment.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_assignment(&mut self, id: AssignmentId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM assignments WHERE id = $1")
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn renewal(&mut self, id: RenewalId) -> StoreResult<Option<Renewal>> {
        let row = sqlx::query_as::<_, RenewalRow>(
            "SELECT id, assignment_id, request_id, locker_id, school_year, status, \
             deadline, confirmed_at, created_at FROM renewals WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Renewal::try_from).transpose()
    }

    async fn find_renewals(&mut self, query: &RenewalQuery) -> StoreResult<Vec<Renewal>> {
        let rows = query
            .build()
            .build_query_as::<RenewalRow>()
            .fetch_all(&mut *self.tx)
            .await?;
        decode_all(rows)
    }

    async fn insert_renewal(&mut self, renewal: &Renewal) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO renewals \
             (id, assignment_id, request_id, locker_id, school_year, status, deadline, \
              confirmed_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (assignment_id, school_year) DO NOTHING",
        )
        .bind(renewal.id.to_string())
        .bind(renewal.assignment_id.to_string())
        .bind(renewal.request_id.to_string())
        .bind(renewal.locker_id.to_string())
        .bind(renewal.school_year.to_string())
        .bind(renewal.status.as_str())
        .bind(renewal.deadline)
        .bind(renewal.confirmed_at)
        .bind(renewal.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn transition_renewal(
        &mut self,
        id: RenewalId,
        from: RenewalStatus,
        to: RenewalStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE renewals SET status = $3, \
             confirmed_at = CASE WHEN $3 = 'confirmed' THEN now() ELSE confirmed_at END \
             WHERE id = $1 AND status = $2",
        )
        .bind(id.to_string())
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn enqueue_notification(&mut self, notification: &Notification) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO notifications \
             (id, recipient, subject, template, payload, status, error, sent_at, \
              dedupe_key, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (dedupe_key) DO NOTHING",
        )
        .bind(notification.id.to_string())
        .bind(&notification.recipient)
        .bind(&notification.subject)
        .bind(notification.template.as_str())
        .bind(&notification.payload)
        .bind(notification.status.as_str())
        .bind(&notification.error)
        .bind(notification.sent_at)
        .bind(&notification.dedupe_key)
        .bind(notification.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
