//! Postgres-backed store.
//!
//! Conditional updates compile the typed filter/update model into a single
//! parameterized statement; the claim path additionally uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never block each other on
//! the same candidate row.
//!
//! Optional filter fields use the `($n IS NULL OR column = $n)` pattern so
//! every operation is one fixed statement with a fixed bind order.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chronos_core::{
    ErrorCode, ExecutionLog, ExecutionStatus, Job, JobId, JobKind, JobStatus, LogId, NewJob,
    WorkerId,
};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::filter::{JobFilter, JobQuery, JobSort, JobUpdate, LockFilter, LockUpdate};
use crate::job_store::{
    JobPage, JobStore, Lock, LockStore, LogUpdate, StoreError, StoreResult, JOB_SEQUENCE,
};
use crate::stats::{HourlyBucket, JobStats};

const JOB_COLUMNS: &str = "id, seq, name, description, tags, timezone, created_by, kind, \
     schedule, start_time, end_time, task_type, payload, priority, status, next_run_at, \
     last_run_at, retry_count, execution_duration_ms, last_error, last_error_stack, \
     last_result, retry, locked_by, locked_at, lock_timeout_ms, depends_on, is_active, \
     paused_at, expire_at, created_at, updated_at";

// Filter binds $1..$9, update binds $10..$30; both fragments always bind
// every parameter so the statement shape never changes.
const FILTER_SQL: &str = "($1::uuid IS NULL OR id = $1) \
     AND ($2::text[] IS NULL OR status = ANY($2)) \
     AND ($3::timestamptz IS NULL OR (next_run_at IS NOT NULL AND next_run_at <= $3)) \
     AND ($4::boolean IS NULL OR is_active = $4) \
     AND ($5::text IS NULL OR locked_by = $5) \
     AND ($6::uuid IS NULL OR depends_on = $6) \
     AND ($7::integer = 0 \
          OR ($7 = 1 AND (locked_by IS NULL OR locked_at IS NULL \
               OR locked_at < $8 - make_interval(secs => lock_timeout_ms::double precision / 1000.0))) \
          OR ($7 = 2 AND locked_by IS NOT NULL AND locked_at IS NOT NULL \
               AND locked_at < $8 - make_interval(secs => COALESCE($9, lock_timeout_ms)::double precision / 1000.0)) \
          OR ($7 = 3 AND locked_by IS NOT NULL))";

const UPDATE_SQL: &str = "status = COALESCE($10, status), \
     locked_by = CASE $11::integer WHEN 1 THEN $12 WHEN 2 THEN NULL ELSE locked_by END, \
     locked_at = CASE $11::integer WHEN 1 THEN $13 WHEN 2 THEN NULL ELSE locked_at END, \
     next_run_at = CASE WHEN $14 THEN $15 ELSE next_run_at END, \
     last_run_at = COALESCE($16, last_run_at), \
     retry_count = CASE WHEN $17 THEN retry_count + 1 ELSE retry_count END, \
     execution_duration_ms = COALESCE($18, execution_duration_ms), \
     last_error = CASE WHEN $19 THEN $20 ELSE last_error END, \
     last_error_stack = CASE WHEN $21 THEN $22 ELSE last_error_stack END, \
     last_result = CASE WHEN $23 THEN $24 ELSE last_result END, \
     expire_at = CASE WHEN $25 THEN $26 ELSE expire_at END, \
     paused_at = CASE WHEN $27 THEN $28 ELSE paused_at END, \
     is_active = COALESCE($29, is_active), \
     updated_at = $30";

/// Durable store on a `PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("run_migrations", e))?;
        }
        tracing::info!("job store schema ready");
        Ok(())
    }
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

fn bind_filter<'q>(q: PgQuery<'q>, filter: &JobFilter) -> PgQuery<'q> {
    let statuses: Option<Vec<String>> = filter
        .status_in
        .as_ref()
        .map(|s| s.iter().map(|st| st.to_string()).collect());
    let (lock_mode, as_of, threshold_ms): (i32, Option<DateTime<Utc>>, Option<i64>) =
        match &filter.lock {
            LockFilter::Any => (0, None, None),
            LockFilter::FreeOrStale { as_of } => (1, Some(*as_of), None),
            LockFilter::Stale { as_of, threshold_ms } => (2, Some(*as_of), *threshold_ms),
            LockFilter::Locked => (3, None, None),
        };

    q.bind(filter.id.map(|id| *id.as_uuid()))
        .bind(statuses)
        .bind(filter.due_before)
        .bind(filter.is_active)
        .bind(filter.locked_by.as_ref().map(|w| w.as_str().to_string()))
        .bind(filter.depends_on.map(|id| *id.as_uuid()))
        .bind(lock_mode)
        .bind(as_of)
        .bind(threshold_ms)
}

fn bind_update<'q>(q: PgQuery<'q>, update: &JobUpdate, now: DateTime<Utc>) -> PgQuery<'q> {
    let (lock_mode, lock_worker, lock_at): (i32, Option<String>, Option<DateTime<Utc>>) =
        match &update.lock {
            None => (0, None, None),
            Some(LockUpdate::Set { worker, at }) => (1, Some(worker.as_str().to_string()), Some(*at)),
            Some(LockUpdate::Clear) => (2, None, None),
        };

    q.bind(update.status.map(|s| s.to_string()))
        .bind(lock_mode)
        .bind(lock_worker)
        .bind(lock_at)
        .bind(update.next_run_at.is_some())
        .bind(update.next_run_at.flatten())
        .bind(update.last_run_at)
        .bind(update.increment_retry_count)
        .bind(update.execution_duration_ms.map(|ms| ms as i64))
        .bind(update.last_error.is_some())
        .bind(update.last_error.clone().flatten())
        .bind(update.last_error_stack.is_some())
        .bind(update.last_error_stack.clone().flatten())
        .bind(update.last_result.is_some())
        .bind(update.last_result.clone().flatten())
        .bind(update.expire_at.is_some())
        .bind(update.expire_at.flatten())
        .bind(update.paused_at.is_some())
        .bind(update.paused_at.flatten())
        .bind(update.is_active)
        .bind(now)
}

fn sort_clause(sort: Option<JobSort>) -> &'static str {
    match sort {
        Some(JobSort::PriorityThenDue) => "priority ASC, next_run_at ASC NULLS LAST",
        Some(JobSort::CreatedDesc) => "created_at DESC",
        None => "seq ASC",
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert_job(&self, new_job: NewJob) -> StoreResult<Job> {
        // Duplicate seq can only happen if the counter row was reset by an
        // operator; one re-mint is enough to move past it.
        for attempt in 0..2 {
            let seq = self.next_sequence(JOB_SEQUENCE).await?;
            let job = new_job.clone().into_job(JobId::new(), seq, Utc::now())?;
            match insert_job_row(&self.pool, &job).await {
                Ok(()) => return Ok(job),
                Err(StoreError::Duplicate(_)) if attempt == 0 => {
                    tracing::warn!(seq, "job sequence collision, re-minting");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Duplicate("job sequence".to_string()))
    }

    async fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn find_one_and_update(
        &self,
        filter: JobFilter,
        update: JobUpdate,
        sort: Option<JobSort>,
    ) -> StoreResult<Option<Job>> {
        let sql = format!(
            "UPDATE jobs SET {UPDATE_SQL} \
             WHERE id = (SELECT id FROM jobs WHERE {FILTER_SQL} \
                         ORDER BY {} LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING {JOB_COLUMNS}",
            sort_clause(sort),
        );
        let q = bind_update(bind_filter(sqlx::query(&sql), &filter), &update, Utc::now());
        let row = q
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_one_and_update", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn update_many(&self, filter: JobFilter, update: JobUpdate) -> StoreResult<u64> {
        let sql = format!("UPDATE jobs SET {UPDATE_SQL} WHERE {FILTER_SQL}");
        let q = bind_update(bind_filter(sqlx::query(&sql), &filter), &update, Utc::now());
        let result = q
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_many", e))?;
        Ok(result.rows_affected())
    }

    async fn query_jobs(&self, query: JobQuery) -> StoreResult<JobPage> {
        let where_sql = "($1::text IS NULL OR status = $1) \
             AND ($2::text IS NULL OR task_type = $2) \
             AND ($3::text IS NULL OR $3 = ANY(tags)) \
             AND ($4::text IS NULL OR name ILIKE '%' || $4 || '%' \
                  OR description ILIKE '%' || $4 || '%') \
             AND ($5::boolean OR is_active)";

        let count_sql = format!("SELECT COUNT(*) AS total FROM jobs WHERE {where_sql}");
        let count_row = sqlx::query(&count_sql)
            .bind(query.status.map(|s| s.to_string()))
            .bind(query.task_type.clone())
            .bind(query.tag.clone())
            .bind(query.text.clone())
            .bind(query.include_inactive)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs_query", e))?;
        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| StoreError::Serialization(format!("failed to read count: {e}")))?;

        let limit = if query.limit == 0 { i64::MAX } else { query.limit as i64 };
        let page_sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE {where_sql} \
             ORDER BY created_at DESC, seq DESC LIMIT $6 OFFSET $7"
        );
        let rows = sqlx::query(&page_sql)
            .bind(query.status.map(|s| s.to_string()))
            .bind(query.task_type)
            .bind(query.tag)
            .bind(query.text)
            .bind(query.include_inactive)
            .bind(limit)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("query_jobs", e))?;

        let jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<StoreResult<Vec<Job>>>()?;
        Ok(JobPage {
            jobs,
            total: total as u64,
        })
    }

    async fn count_jobs(&self, filter: JobFilter) -> StoreResult<u64> {
        let sql = format!("SELECT COUNT(*) AS total FROM jobs WHERE {FILTER_SQL}");
        let row = bind_filter(sqlx::query(&sql), &filter)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| StoreError::Serialization(format!("failed to read count: {e}")))?;
        Ok(total as u64)
    }

    async fn append_log(&self, log: ExecutionLog) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO execution_logs (id, job_id, job_name, job_kind, task_type, \
                 scheduled_for, started_at, finished_at, duration_ms, status, attempt, \
                 is_retry, error, error_stack, error_code, worker_id, worker_host, \
                 payload_snapshot, result, metadata, expire_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                 $16, $17, $18, $19, $20, $21)",
        )
        .bind(log.id.as_uuid())
        .bind(log.job_id.as_uuid())
        .bind(&log.job_name)
        .bind(log.job_kind.to_string())
        .bind(&log.task_type)
        .bind(log.scheduled_for)
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(log.duration_ms.map(|ms| ms as i64))
        .bind(log.status.to_string())
        .bind(log.attempt as i32)
        .bind(log.is_retry)
        .bind(&log.error)
        .bind(&log.error_stack)
        .bind(log.error_code.map(|c| c.to_string()))
        .bind(log.worker_id.as_str())
        .bind(&log.worker_host)
        .bind(&log.payload_snapshot)
        .bind(&log.result)
        .bind(&log.metadata)
        .bind(log.expire_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_log", e))?;
        Ok(())
    }

    async fn update_log(&self, id: LogId, update: LogUpdate) -> StoreResult<()> {
        sqlx::query(
            "UPDATE execution_logs SET \
                 status = COALESCE($2, status), \
                 finished_at = COALESCE($3, finished_at), \
                 duration_ms = COALESCE($4, duration_ms), \
                 error = COALESCE($5, error), \
                 error_stack = COALESCE($6, error_stack), \
                 error_code = COALESCE($7, error_code), \
                 result = COALESCE($8, result), \
                 metadata = COALESCE($9, metadata) \
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(update.status.map(|s| s.to_string()))
        .bind(update.finished_at)
        .bind(update.duration_ms.map(|ms| ms as i64))
        .bind(update.error)
        .bind(update.error_stack)
        .bind(update.error_code.map(|c| c.to_string()))
        .bind(update.result)
        .bind(update.metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_log", e))?;
        Ok(())
    }

    async fn logs_for_job(&self, job_id: JobId, limit: usize) -> StoreResult<Vec<ExecutionLog>> {
        let limit = if limit == 0 { i64::MAX } else { limit as i64 };
        let rows = sqlx::query(
            "SELECT id, job_id, job_name, job_kind, task_type, scheduled_for, started_at, \
                 finished_at, duration_ms, status, attempt, is_retry, error, error_stack, \
                 error_code, worker_id, worker_host, payload_snapshot, result, metadata, \
                 expire_at \
             FROM execution_logs WHERE job_id = $1 ORDER BY started_at DESC LIMIT $2",
        )
        .bind(job_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("logs_for_job", e))?;

        rows.iter().map(log_from_row).collect()
    }

    async fn job_stats(&self) -> StoreResult<JobStats> {
        let mut stats = JobStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats_by_status", e))?;
        for row in rows {
            let status: String = try_column(&row, "status")?;
            let n: i64 = try_column(&row, "n")?;
            stats.total += n as u64;
            stats.by_status.insert(status, n as u64);
        }

        let rows = sqlx::query("SELECT task_type, COUNT(*) AS n FROM jobs GROUP BY task_type")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats_by_task_type", e))?;
        for row in rows {
            let task_type: String = try_column(&row, "task_type")?;
            let n: i64 = try_column(&row, "n")?;
            stats.by_task_type.insert(task_type, n as u64);
        }

        let rows = sqlx::query(
            "SELECT date_trunc('hour', started_at) AS hour, \
                 COUNT(*) AS executions, \
                 COUNT(*) FILTER (WHERE status IN ('FAILED', 'TIMEOUT')) AS failures \
             FROM execution_logs \
             WHERE started_at >= NOW() - INTERVAL '24 hours' \
             GROUP BY 1 ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats_hourly", e))?;
        for row in rows {
            stats.hourly.push(HourlyBucket {
                hour: try_column(&row, "hour")?,
                executions: try_column::<i64>(&row, "executions")? as u64,
                failures: try_column::<i64>(&row, "failures")? as u64,
            });
        }

        Ok(stats)
    }

    async fn next_sequence(&self, name: &str) -> StoreResult<i64> {
        let row = sqlx::query(
            "INSERT INTO counters (name, value) VALUES ($1, 1) \
             ON CONFLICT (name) DO UPDATE SET value = counters.value + 1 \
             RETURNING value",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("next_sequence", e))?;
        try_column(&row, "value")
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let jobs = sqlx::query("DELETE FROM jobs WHERE expire_at IS NOT NULL AND expire_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired_jobs", e))?;
        let logs = sqlx::query("DELETE FROM execution_logs WHERE expire_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired_logs", e))?;
        Ok(jobs.rows_affected() + logs.rows_affected())
    }
}

#[async_trait]
impl LockStore for PostgresJobStore {
    async fn upsert_lock(
        &self,
        lock_id: &str,
        holder: &WorkerId,
        ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Lock> {
        let expires_at = now + chrono::Duration::milliseconds(ttl_ms);
        let row = sqlx::query(
            "INSERT INTO locks (lock_id, holder, acquired_at, expires_at, renew_count) \
             VALUES ($1, $2, $3, $4, 0) \
             ON CONFLICT (lock_id) DO UPDATE SET \
                 holder = CASE WHEN locks.expires_at < $3 OR locks.holder = $2 \
                               THEN EXCLUDED.holder ELSE locks.holder END, \
                 acquired_at = CASE WHEN locks.expires_at < $3 \
                               THEN EXCLUDED.acquired_at ELSE locks.acquired_at END, \
                 expires_at = CASE WHEN locks.expires_at < $3 OR locks.holder = $2 \
                               THEN EXCLUDED.expires_at ELSE locks.expires_at END, \
                 renew_count = CASE WHEN locks.expires_at < $3 THEN 0 \
                               WHEN locks.holder = $2 THEN locks.renew_count + 1 \
                               ELSE locks.renew_count END \
             RETURNING lock_id, holder, acquired_at, expires_at, renew_count",
        )
        .bind(lock_id)
        .bind(holder.as_str())
        .bind(now)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_lock", e))?;
        lock_from_row(&row)
    }

    async fn delete_lock(&self, lock_id: &str, holder: &WorkerId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE lock_id = $1 AND holder = $2")
            .bind(lock_id)
            .bind(holder.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_lock", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew_lock(
        &self,
        lock_id: &str,
        holder: &WorkerId,
        ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE locks SET expires_at = $3, renew_count = renew_count + 1 \
             WHERE lock_id = $1 AND holder = $2",
        )
        .bind(lock_id)
        .bind(holder.as_str())
        .bind(now + chrono::Duration::milliseconds(ttl_ms))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_lock", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_lock(&self, lock_id: &str) -> StoreResult<Option<Lock>> {
        let row = sqlx::query(
            "SELECT lock_id, holder, acquired_at, expires_at, renew_count \
             FROM locks WHERE lock_id = $1",
        )
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_lock", e))?;
        row.map(|r| lock_from_row(&r)).transpose()
    }

    async fn purge_expired_locks(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM locks WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired_locks", e))?;
        Ok(result.rows_affected())
    }
}

async fn insert_job_row(pool: &PgPool, job: &Job) -> StoreResult<()> {
    let schedule = serde_json::to_value(&job.schedule)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let retry = serde_json::to_value(&job.retry)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    sqlx::query(
        "INSERT INTO jobs (id, seq, name, description, tags, timezone, created_by, kind, \
             schedule, start_time, end_time, task_type, payload, priority, status, \
             next_run_at, last_run_at, retry_count, execution_duration_ms, last_error, \
             last_error_stack, last_result, retry, locked_by, locked_at, lock_timeout_ms, \
             depends_on, is_active, paused_at, expire_at, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32)",
    )
    .bind(job.id.as_uuid())
    .bind(job.seq)
    .bind(&job.name)
    .bind(&job.description)
    .bind(&job.tags)
    .bind(&job.timezone)
    .bind(&job.created_by)
    .bind(job.kind.to_string())
    .bind(schedule)
    .bind(job.start_time)
    .bind(job.end_time)
    .bind(&job.task_type)
    .bind(&job.payload)
    .bind(job.priority as i16)
    .bind(job.status.to_string())
    .bind(job.next_run_at)
    .bind(job.last_run_at)
    .bind(job.retry_count as i32)
    .bind(job.execution_duration_ms.map(|ms| ms as i64))
    .bind(&job.last_error)
    .bind(&job.last_error_stack)
    .bind(&job.last_result)
    .bind(retry)
    .bind(job.locked_by.as_ref().map(|w| w.as_str().to_string()))
    .bind(job.locked_at)
    .bind(job.lock_timeout_ms)
    .bind(job.depends_on.map(|id| *id.as_uuid()))
    .bind(job.is_active)
    .bind(job.paused_at)
    .bind(job.expire_at)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

fn try_column<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Serialization(format!("column '{name}': {e}")))
}

fn job_from_row(row: &PgRow) -> StoreResult<Job> {
    let kind: String = try_column(row, "kind")?;
    let status: String = try_column(row, "status")?;
    let schedule: serde_json::Value = try_column(row, "schedule")?;
    let retry: serde_json::Value = try_column(row, "retry")?;
    let locked_by: Option<String> = try_column(row, "locked_by")?;
    let depends_on: Option<Uuid> = try_column(row, "depends_on")?;
    let priority: i16 = try_column(row, "priority")?;
    let retry_count: i32 = try_column(row, "retry_count")?;
    let duration: Option<i64> = try_column(row, "execution_duration_ms")?;

    Ok(Job {
        id: JobId::from_uuid(try_column(row, "id")?),
        seq: try_column(row, "seq")?,
        name: try_column(row, "name")?,
        description: try_column(row, "description")?,
        tags: try_column(row, "tags")?,
        timezone: try_column(row, "timezone")?,
        created_by: try_column(row, "created_by")?,
        kind: JobKind::from_str(&kind).map_err(|e| StoreError::Serialization(e.to_string()))?,
        schedule: serde_json::from_value(schedule)
            .map_err(|e| StoreError::Serialization(format!("schedule: {e}")))?,
        start_time: try_column(row, "start_time")?,
        end_time: try_column(row, "end_time")?,
        task_type: try_column(row, "task_type")?,
        payload: try_column(row, "payload")?,
        priority: priority as u8,
        status: JobStatus::from_str(&status)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        next_run_at: try_column(row, "next_run_at")?,
        last_run_at: try_column(row, "last_run_at")?,
        retry_count: retry_count as u32,
        execution_duration_ms: duration.map(|ms| ms as u64),
        last_error: try_column(row, "last_error")?,
        last_error_stack: try_column(row, "last_error_stack")?,
        last_result: try_column(row, "last_result")?,
        retry: serde_json::from_value(retry)
            .map_err(|e| StoreError::Serialization(format!("retry: {e}")))?,
        locked_by: locked_by.map(WorkerId::new),
        locked_at: try_column(row, "locked_at")?,
        lock_timeout_ms: try_column(row, "lock_timeout_ms")?,
        depends_on: depends_on.map(JobId::from_uuid),
        is_active: try_column(row, "is_active")?,
        paused_at: try_column(row, "paused_at")?,
        expire_at: try_column(row, "expire_at")?,
        created_at: try_column(row, "created_at")?,
        updated_at: try_column(row, "updated_at")?,
    })
}

fn log_from_row(row: &PgRow) -> StoreResult<ExecutionLog> {
    let kind: String = try_column(row, "job_kind")?;
    let status: String = try_column(row, "status")?;
    let error_code: Option<String> = try_column(row, "error_code")?;
    let attempt: i32 = try_column(row, "attempt")?;
    let duration: Option<i64> = try_column(row, "duration_ms")?;

    Ok(ExecutionLog {
        id: LogId::from_uuid(try_column(row, "id")?),
        job_id: JobId::from_uuid(try_column(row, "job_id")?),
        job_name: try_column(row, "job_name")?,
        job_kind: JobKind::from_str(&kind).map_err(|e| StoreError::Serialization(e.to_string()))?,
        task_type: try_column(row, "task_type")?,
        scheduled_for: try_column(row, "scheduled_for")?,
        started_at: try_column(row, "started_at")?,
        finished_at: try_column(row, "finished_at")?,
        duration_ms: duration.map(|ms| ms as u64),
        status: parse_execution_status(&status)?,
        attempt: attempt as u32,
        is_retry: try_column(row, "is_retry")?,
        error: try_column(row, "error")?,
        error_stack: try_column(row, "error_stack")?,
        error_code: error_code
            .map(|c| ErrorCode::from_str(&c))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        worker_id: WorkerId::new(try_column::<String>(row, "worker_id")?),
        worker_host: try_column(row, "worker_host")?,
        payload_snapshot: try_column(row, "payload_snapshot")?,
        result: try_column(row, "result")?,
        metadata: try_column(row, "metadata")?,
        expire_at: try_column(row, "expire_at")?,
    })
}

fn lock_from_row(row: &PgRow) -> StoreResult<Lock> {
    let renew_count: i32 = try_column(row, "renew_count")?;
    Ok(Lock {
        lock_id: try_column(row, "lock_id")?,
        holder: WorkerId::new(try_column::<String>(row, "holder")?),
        acquired_at: try_column(row, "acquired_at")?,
        expires_at: try_column(row, "expires_at")?,
        renew_count: renew_count as u32,
    })
}

fn parse_execution_status(s: &str) -> StoreResult<ExecutionStatus> {
    match s {
        "SUCCESS" => Ok(ExecutionStatus::Success),
        "FAILED" => Ok(ExecutionStatus::Failed),
        "TIMEOUT" => Ok(ExecutionStatus::Timeout),
        "SKIPPED" => Ok(ExecutionStatus::Skipped),
        "RUNNING" => Ok(ExecutionStatus::Running),
        other => Err(StoreError::Serialization(format!(
            "unknown execution status '{other}'"
        ))),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation
                Some("23505") => StoreError::Duplicate(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

const SCHEMA: &str = r#"
CREATE EXTENSION IF NOT EXISTS pg_trgm;

CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    seq BIGINT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    description TEXT,
    tags TEXT[] NOT NULL DEFAULT '{}',
    timezone TEXT NOT NULL DEFAULT 'UTC',
    created_by TEXT,
    kind TEXT NOT NULL,
    schedule JSONB NOT NULL,
    start_time TIMESTAMPTZ,
    end_time TIMESTAMPTZ,
    task_type TEXT NOT NULL,
    payload JSONB NOT NULL DEFAULT 'null',
    priority SMALLINT NOT NULL DEFAULT 5,
    status TEXT NOT NULL,
    next_run_at TIMESTAMPTZ,
    last_run_at TIMESTAMPTZ,
    retry_count INTEGER NOT NULL DEFAULT 0,
    execution_duration_ms BIGINT,
    last_error TEXT,
    last_error_stack TEXT,
    last_result JSONB,
    retry JSONB NOT NULL,
    locked_by TEXT,
    locked_at TIMESTAMPTZ,
    lock_timeout_ms BIGINT NOT NULL,
    depends_on UUID,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    paused_at TIMESTAMPTZ,
    expire_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (status, next_run_at, is_active);
CREATE INDEX IF NOT EXISTS idx_jobs_lock ON jobs (locked_by, locked_at);
CREATE INDEX IF NOT EXISTS idx_jobs_tags ON jobs USING GIN (tags);
CREATE INDEX IF NOT EXISTS idx_jobs_text
    ON jobs USING GIN (name gin_trgm_ops, description gin_trgm_ops);
CREATE INDEX IF NOT EXISTS idx_jobs_listing ON jobs (is_active, status, updated_at);
CREATE INDEX IF NOT EXISTS idx_jobs_expire ON jobs (expire_at);

CREATE TABLE IF NOT EXISTS execution_logs (
    id UUID PRIMARY KEY,
    job_id UUID NOT NULL,
    job_name TEXT NOT NULL,
    job_kind TEXT NOT NULL,
    task_type TEXT NOT NULL,
    scheduled_for TIMESTAMPTZ,
    started_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ,
    duration_ms BIGINT,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    is_retry BOOLEAN NOT NULL,
    error TEXT,
    error_stack TEXT,
    error_code TEXT,
    worker_id TEXT NOT NULL,
    worker_host TEXT NOT NULL,
    payload_snapshot JSONB NOT NULL DEFAULT 'null',
    result JSONB,
    metadata JSONB NOT NULL DEFAULT 'null',
    expire_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_job ON execution_logs (job_id, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_logs_expire ON execution_logs (expire_at);

CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS locks (
    lock_id TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    renew_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_locks_expiry ON locks (expires_at)
"#;
