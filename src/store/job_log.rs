// =============================================================================
// Job Log — append-only audit of scheduler activity
// =============================================================================
//
// Every scheduled invocation writes one row: created with status `running`
// at job start, finalized with the terminal status, duration, error message
// and processed-record count at job end. These rows are the authoritative
// scorecard; monitoring reads them instead of parsing logs.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use tracing::debug;

use crate::error::StoreError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to an open job-log row. Owned by the job that created it; nothing
/// else writes to the row.
#[derive(Debug)]
pub struct JobHandle {
    pub id: i64,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
}

/// A finalized (or still-running) job-log row as read back.
#[derive(Debug, Clone)]
pub struct JobRunRow {
    pub id: i64,
    pub job_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub status: String,
    pub error_message: Option<String>,
    pub records_processed: Option<i64>,
}

fn fmt_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Unavailable(format!("corrupt time column {s:?}: {e}")))
}

impl Store {
    /// Open a job-log row with status `running`.
    pub async fn begin_job(
        &self,
        job_name: &str,
        started_at: DateTime<Utc>,
    ) -> Result<JobHandle, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_log (job_name, start_time, status)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(job_name)
        .bind(fmt_time(&started_at))
        .bind(JobStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(job = job_name, id, "job-log row opened");
        Ok(JobHandle {
            id,
            job_name: job_name.to_string(),
            started_at,
        })
    }

    /// Finalize a job-log row with its terminal status.
    pub async fn end_job(
        &self,
        handle: &JobHandle,
        status: JobStatus,
        error_message: Option<&str>,
        records_processed: i64,
    ) -> Result<(), StoreError> {
        let ended_at = Utc::now();
        let duration = (ended_at - handle.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        sqlx::query(
            r#"
            UPDATE job_log
            SET end_time = ?,
                duration_seconds = ?,
                status = ?,
                error_message = ?,
                records_processed = ?
            WHERE id = ?
            "#,
        )
        .bind(fmt_time(&ended_at))
        .bind(duration)
        .bind(status.as_str())
        .bind(error_message)
        .bind(records_processed)
        .bind(handle.id)
        .execute(&self.pool)
        .await?;

        debug!(
            job = handle.job_name,
            id = handle.id,
            status = %status,
            records = records_processed,
            "job-log row finalized"
        );
        Ok(())
    }

    /// Most recent runs for a job, newest-first.
    pub async fn get_job_runs(
        &self,
        job_name: &str,
        limit: u32,
    ) -> Result<Vec<JobRunRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_name, start_time, end_time, duration_seconds,
                   status, error_message, records_processed
            FROM job_log
            WHERE job_name = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(job_name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let end_raw: Option<String> = row.get("end_time");
            out.push(JobRunRow {
                id: row.get("id"),
                job_name: row.get::<String, _>("job_name"),
                start_time: parse_time(row.get("start_time"))?,
                end_time: end_raw.as_deref().map(parse_time).transpose()?,
                duration_seconds: row.get("duration_seconds"),
                status: row.get::<String, _>("status"),
                error_message: row.get("error_message"),
                records_processed: row.get("records_processed"),
            });
        }
        Ok(out)
    }
}
