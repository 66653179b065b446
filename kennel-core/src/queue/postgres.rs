use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kennel_model::{
    CascadeSpec, EnvVar, FindingsSummary, Job, JobId, JobMetadata, JobState,
    UploadedFile,
};
use sqlx::{PgConnection, PgPool, Postgres, Transaction, types::Json};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ClaimRequest, CompletionRecord, FindingsRecord, ParseJob, QueueService,
};
use crate::error::{Result, ScanError};

const JOB_COLUMNS: &str = "id, job_type, tenant, parameters, state, metadata, \
     cascades, env, claimed_by, locked_at, workload, completed_at, \
     uploaded_files, parsed_files, findings, cascade_evaluated_at, created_at";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    tenant: String,
    parameters: Json<Vec<String>>,
    state: String,
    metadata: Json<JobMetadata>,
    cascades: Option<Json<CascadeSpec>>,
    env: Json<Vec<EnvVar>>,
    claimed_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    workload: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    uploaded_files: Json<Vec<UploadedFile>>,
    parsed_files: Json<Vec<UploadedFile>>,
    findings: Option<Json<FindingsSummary>>,
    cascade_evaluated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = ScanError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: JobId(row.id),
            job_type: row.job_type,
            tenant: row.tenant,
            parameters: row.parameters.0,
            created_at: row.created_at,
            state: row.state.parse::<JobState>()?,
            metadata: row.metadata.0,
            cascades: row.cascades.map(|c| c.0),
            env: row.env.0,
            claimed_by: row.claimed_by,
            locked_at: row.locked_at,
            workload: row.workload,
            completed_at: row.completed_at,
            uploaded_files: row.uploaded_files.0,
            parsed_files: row.parsed_files.0,
            findings: row.findings.map(|f| f.0),
            cascade_evaluated_at: row.cascade_evaluated_at,
        })
    }
}

/// Durable queue backed by Postgres.
#[derive(Clone)]
pub struct PostgresQueueService {
    pool: PgPool,
}

impl fmt::Debug for PostgresQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresQueueService")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresQueueService {
    /// Create a new Postgres-backed queue service and verify DB health + schema.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                ScanError::QueueUnavailable(format!(
                    "queue failed Postgres health check: {e}"
                ))
            })?;
        info!("Queue service connected to Postgres");

        let idx_exists = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM pg_indexes WHERE indexname = $1 LIMIT 1",
        )
        .bind("idx_scan_jobs_queued")
        .fetch_optional(&pool)
        .await?
        .is_some();

        if !idx_exists {
            return Err(ScanError::Internal(
                "Required index idx_scan_jobs_queued is missing; run migrations"
                    .into(),
            ));
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        id: JobId,
    ) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ScanError::NotFound(id))?;
        Job::try_from(row)
    }
}

fn unavailable(err: sqlx::Error) -> ScanError {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_) => ScanError::QueueUnavailable(err.to_string()),
        other => ScanError::Database(other),
    }
}

async fn insert_job(conn: &mut PgConnection, job: &Job) -> Result<()> {
    if job.state != JobState::Queued {
        return Err(ScanError::InvalidJob(format!(
            "job {} must be Queued to enqueue, is {}",
            job.id, job.state
        )));
    }
    sqlx::query(
        r#"
        INSERT INTO scan_jobs
            (id, job_type, tenant, parameters, state, metadata, cascades,
             env, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(job.id.to_uuid())
    .bind(&job.job_type)
    .bind(&job.tenant)
    .bind(Json(&job.parameters))
    .bind(job.state.as_str())
    .bind(Json(&job.metadata))
    .bind(job.cascades.as_ref().map(Json))
    .bind(Json(&job.env))
    .bind(job.created_at)
    .execute(conn)
    .await
    .map_err(unavailable)?;
    Ok(())
}

async fn insert_all(
    tx: &mut Transaction<'_, Postgres>,
    jobs: &[Job],
) -> Result<Vec<JobId>> {
    let mut ids = Vec::with_capacity(jobs.len());
    for job in jobs {
        insert_job(&mut **tx, job).await?;
        ids.push(job.id);
    }
    Ok(ids)
}

#[async_trait]
impl QueueService for PostgresQueueService {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let mut conn = self.pool.acquire().await.map_err(unavailable)?;
        insert_job(&mut conn, &job).await?;
        Ok(job.id)
    }

    async fn enqueue_many(&self, jobs: Vec<Job>) -> Result<Vec<JobId>> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let ids = insert_all(&mut tx, &jobs).await?;
        tx.commit().await.map_err(unavailable)?;
        Ok(ids)
    }

    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Job>> {
        if request.job_types.is_empty() {
            return Ok(None);
        }
        // One statement: the row lock taken by SKIP LOCKED is held until the
        // UPDATE commits, so racing claimants move on to the next row.
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            WITH next AS (
                SELECT id
                FROM scan_jobs
                WHERE state = 'Queued'
                  AND tenant = $1
                  AND job_type = ANY($2::text[])
                ORDER BY array_position($2::text[], job_type), seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scan_jobs j
            SET state = 'Locked',
                claimed_by = $3,
                locked_at = NOW(),
                updated_at = NOW()
            FROM next
            WHERE j.id = next.id
            RETURNING {cols}
            "#,
            cols = JOB_COLUMNS
                .split(", ")
                .map(|c| format!("j.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(&request.tenant)
        .bind(&request.job_types)
        .bind(request.claimant.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        match row {
            Some(row) => {
                let job = Job::try_from(row)?;
                debug!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    "claimed job"
                );
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?
        .map(Job::try_from)
        .transpose()
    }

    async fn mark_running(&self, id: JobId, workload: &str) -> Result<Job> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let mut job = Self::lock_row(&mut tx, id).await?;
        if job.state == JobState::Completed {
            return Ok(job);
        }
        job.transition(JobState::Running)?;
        job.workload = Some(workload.to_string());

        sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = $2, workload = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .bind(job.state.as_str())
        .bind(workload)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn complete(
        &self,
        id: JobId,
        files: Vec<UploadedFile>,
        parse_jobs: Vec<ParseJob>,
    ) -> Result<CompletionRecord> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let mut job = Self::lock_row(&mut tx, id).await?;
        job.transition(JobState::Completed)?;
        job.uploaded_files = files;
        let completed_at = Utc::now();
        job.completed_at = Some(completed_at);

        let mut new_jobs = Vec::with_capacity(parse_jobs.len());
        for ParseJob { file, job: parse_job } in parse_jobs {
            if job.has_parse_job(&file) {
                continue;
            }
            job.parsed_files.push(file);
            new_jobs.push(parse_job);
        }
        let parse_jobs = insert_all(&mut tx, &new_jobs).await?;

        sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = $2, uploaded_files = $3, parsed_files = $4,
                completed_at = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .bind(job.state.as_str())
        .bind(Json(&job.uploaded_files))
        .bind(Json(&job.parsed_files))
        .bind(completed_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.map_err(unavailable)?;

        Ok(CompletionRecord { job, parse_jobs })
    }

    async fn record_findings(
        &self,
        id: JobId,
        summary: FindingsSummary,
        follow_ups: Vec<Job>,
    ) -> Result<FindingsRecord> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let mut job = Self::lock_row(&mut tx, id).await?;
        let first_report = job.cascade_evaluated_at.is_none();
        let cascaded = if first_report {
            job.cascade_evaluated_at = Some(Utc::now());
            insert_all(&mut tx, &follow_ups).await?
        } else {
            Vec::new()
        };
        job.findings = Some(summary);

        sqlx::query(
            r#"
            UPDATE scan_jobs
            SET findings = $2, cascade_evaluated_at = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .bind(job.findings.as_ref().map(Json))
        .bind(job.cascade_evaluated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.map_err(unavailable)?;

        Ok(FindingsRecord {
            job,
            first_report,
            cascaded,
        })
    }

    async fn queue_depth(&self, tenant: &str, job_type: &str) -> Result<usize> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM scan_jobs
            WHERE state = 'Queued' AND tenant = $1 AND job_type = $2
            "#,
        )
        .bind(tenant)
        .bind(job_type)
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
