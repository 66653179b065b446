use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use kennel_model::{FindingsSummary, Job, JobId, JobState, UploadedFile};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    ClaimRequest, CompletionRecord, FindingsRecord, ParseJob, QueueService,
};
use crate::error::{Result, ScanError};

type QueueKey = (String, String);

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    queues: HashMap<QueueKey, VecDeque<JobId>>,
}

impl QueueState {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(&id).ok_or(ScanError::NotFound(id))
    }

    /// Checks every job before storing any, so a rejected batch leaves the
    /// state untouched.
    fn enqueue_all(&mut self, jobs: Vec<Job>) -> Result<Vec<JobId>> {
        let mut ids = HashSet::with_capacity(jobs.len());
        for job in &jobs {
            if job.state != JobState::Queued {
                return Err(ScanError::InvalidJob(format!(
                    "job {} must be Queued to enqueue, is {}",
                    job.id, job.state
                )));
            }
            if self.jobs.contains_key(&job.id) || !ids.insert(job.id) {
                return Err(ScanError::InvalidJob(format!(
                    "job {} already exists",
                    job.id
                )));
            }
        }
        let mut queued = Vec::with_capacity(jobs.len());
        for job in jobs {
            let key = (job.tenant.clone(), job.job_type.clone());
            queued.push(job.id);
            self.queues.entry(key).or_default().push_back(job.id);
            self.jobs.insert(job.id, job);
        }
        Ok(queued)
    }
}

/// Process-local queue. Every operation runs under one mutex, so popping
/// a queue head and locking the job happen as a single step.
#[derive(Clone, Default)]
pub struct InMemoryQueueService {
    state: Arc<Mutex<QueueState>>,
}

impl fmt::Debug for InMemoryQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryQueueService");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("jobs", &state.jobs.len())
                    .field("queues", &state.queues.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryQueueService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let mut state = self.state.lock().await;
        let id = job.id;
        state.enqueue_all(vec![job])?;
        Ok(id)
    }

    async fn enqueue_many(&self, jobs: Vec<Job>) -> Result<Vec<JobId>> {
        self.state.lock().await.enqueue_all(jobs)
    }

    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        for job_type in &request.job_types {
            let key = (request.tenant.clone(), job_type.clone());
            let Some(id) =
                state.queues.get_mut(&key).and_then(VecDeque::pop_front)
            else {
                continue;
            };
            let job = state.job_mut(id)?;
            job.transition(JobState::Locked)?;
            job.claimed_by = request.claimant.clone();
            job.locked_at = Some(Utc::now());
            debug!(
                job_id = %id,
                job_type = %job_type,
                "claimed job from memory queue"
            );
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn mark_running(&self, id: JobId, workload: &str) -> Result<Job> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        if job.state == JobState::Completed {
            return Ok(job.clone());
        }
        job.transition(JobState::Running)?;
        job.workload = Some(workload.to_string());
        Ok(job.clone())
    }

    async fn complete(
        &self,
        id: JobId,
        files: Vec<UploadedFile>,
        parse_jobs: Vec<ParseJob>,
    ) -> Result<CompletionRecord> {
        let mut state = self.state.lock().await;
        let mut job =
            state.jobs.get(&id).cloned().ok_or(ScanError::NotFound(id))?;
        job.transition(JobState::Completed)?;
        job.uploaded_files = files;
        job.completed_at = Some(Utc::now());

        let mut new_jobs = Vec::with_capacity(parse_jobs.len());
        for ParseJob { file, job: parse_job } in parse_jobs {
            if job.has_parse_job(&file) {
                continue;
            }
            job.parsed_files.push(file);
            new_jobs.push(parse_job);
        }
        let parse_jobs = state.enqueue_all(new_jobs)?;
        state.jobs.insert(id, job.clone());
        Ok(CompletionRecord { job, parse_jobs })
    }

    async fn record_findings(
        &self,
        id: JobId,
        summary: FindingsSummary,
        follow_ups: Vec<Job>,
    ) -> Result<FindingsRecord> {
        let mut state = self.state.lock().await;
        let mut job =
            state.jobs.get(&id).cloned().ok_or(ScanError::NotFound(id))?;
        job.findings = Some(summary);
        let first_report = job.cascade_evaluated_at.is_none();
        let cascaded = if first_report {
            job.cascade_evaluated_at = Some(Utc::now());
            state.enqueue_all(follow_ups)?
        } else {
            Vec::new()
        };
        state.jobs.insert(id, job.clone());
        Ok(FindingsRecord {
            job,
            first_report,
            cascaded,
        })
    }

    async fn queue_depth(&self, tenant: &str, job_type: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(&(tenant.to_string(), job_type.to_string()))
            .map_or(0, VecDeque::len))
    }
}
