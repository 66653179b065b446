//! Postgres queue behavior. Needs `DATABASE_URL` and
//! `--features postgres-tests`.
#![cfg(feature = "postgres-tests")]

use std::collections::HashSet;

use kennel_core::{
    ClaimRequest, ParseJob, PostgresQueueService, QueueService, ScanError,
};
use kennel_model::{
    EnvVar, FindingsSummary, Job, JobId, JobState, JobSubmission, UploadedFile,
};
use sqlx::PgPool;

fn job(job_type: &str, tenant: &str) -> Job {
    Job::from_submission(JobSubmission::new(
        job_type,
        tenant,
        vec!["-Pn".into()],
    ))
}

fn parse_job(file: UploadedFile) -> ParseJob {
    ParseJob {
        file,
        job: job("parse:nmap-xml", "default"),
    }
}

fn claim(types: &[&str]) -> ClaimRequest {
    ClaimRequest::new(
        types.iter().map(|t| t.to_string()).collect(),
        "default",
        Some("cluster-a".into()),
    )
}

fn file(name: &str, size: u64) -> UploadedFile {
    UploadedFile {
        file_name: name.into(),
        upload_size: size,
        result_type: Some("nmap-xml".into()),
    }
}

#[sqlx::test(migrator = "kennel_core::MIGRATOR")]
async fn empty_queue_claims_nothing(pool: PgPool) {
    let queue = PostgresQueueService::new(pool).await.unwrap();
    assert!(queue.claim_next(&claim(&["nmap"])).await.unwrap().is_none());
    assert!(queue.claim_next(&claim(&[])).await.unwrap().is_none());
}

#[sqlx::test(migrator = "kennel_core::MIGRATOR")]
async fn claims_follow_candidate_order_then_fifo(pool: PgPool) {
    let queue = PostgresQueueService::new(pool).await.unwrap();
    let first_nmap = queue.enqueue(job("nmap", "default")).await.unwrap();
    let second_nmap = queue.enqueue(job("nmap", "default")).await.unwrap();
    let zap = queue.enqueue(job("zap", "default")).await.unwrap();
    queue.enqueue(job("nmap", "team-b")).await.unwrap();

    let request = claim(&["zap", "nmap"]);
    let mut order = Vec::new();
    while let Some(claimed) = queue.claim_next(&request).await.unwrap() {
        assert_eq!(claimed.state, JobState::Locked);
        assert_eq!(claimed.claimed_by.as_deref(), Some("cluster-a"));
        order.push(claimed.id);
    }
    assert_eq!(order, vec![zap, first_nmap, second_nmap]);
    assert_eq!(queue.queue_depth("team-b", "nmap").await.unwrap(), 1);
}

#[sqlx::test(migrator = "kennel_core::MIGRATOR")]
async fn concurrent_claims_are_exclusive(pool: PgPool) {
    let queue = PostgresQueueService::new(pool).await.unwrap();
    let n = 24;
    for _ in 0..n {
        queue.enqueue(job("nmap", "default")).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..n + 4 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.claim_next(&claim(&["nmap"])).await
        }));
    }

    let mut seen: HashSet<JobId> = HashSet::new();
    let mut empty = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Some(job) => {
                assert!(seen.insert(job.id), "job {} claimed twice", job.id)
            }
            None => empty += 1,
        }
    }
    assert_eq!(seen.len(), n);
    assert_eq!(empty, 4);
}

#[sqlx::test(migrator = "kennel_core::MIGRATOR")]
async fn submitted_env_is_stored(pool: PgPool) {
    let queue = PostgresQueueService::new(pool).await.unwrap();
    let env = vec![EnvVar::new("NMAP_TIMING", "T2")];
    let id = queue
        .enqueue(Job::from_submission(
            JobSubmission::new("nmap", "default", vec![]).with_env(env.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(queue.get(id).await.unwrap().unwrap().env, env);
}

#[sqlx::test(migrator = "kennel_core::MIGRATOR")]
async fn completion_overwrites_previous_files(pool: PgPool) {
    let queue = PostgresQueueService::new(pool).await.unwrap();
    let id = queue.enqueue(job("nmap", "default")).await.unwrap();
    queue.claim_next(&claim(&["nmap"])).await.unwrap();
    let running = queue.mark_running(id, "nmap-workload").await.unwrap();
    assert_eq!(running.state, JobState::Running);

    let first = queue
        .complete(id, vec![file("a.xml", 1)], vec![parse_job(file("a.xml", 1))])
        .await
        .unwrap();
    assert_eq!(first.parse_jobs.len(), 1);
    let second = queue
        .complete(
            id,
            vec![file("a.xml", 1), file("b.xml", 2)],
            vec![parse_job(file("a.xml", 1)), parse_job(file("b.xml", 2))],
        )
        .await
        .unwrap();
    assert_eq!(second.parse_jobs.len(), 1);
    assert_eq!(queue.queue_depth("default", "parse:nmap-xml").await.unwrap(), 2);

    let stored = queue.get(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.uploaded_files, vec![file("a.xml", 1), file("b.xml", 2)]);
    assert_eq!(stored.parsed_files.len(), 2);
    assert_eq!(stored.workload.as_deref(), Some("nmap-workload"));

    // A late workload report does not reopen the job.
    let late = queue.mark_running(id, "other").await.unwrap();
    assert_eq!(late.state, JobState::Completed);
}

#[sqlx::test(migrator = "kennel_core::MIGRATOR")]
async fn queued_job_cannot_complete(pool: PgPool) {
    let queue = PostgresQueueService::new(pool).await.unwrap();
    let id = queue.enqueue(job("nmap", "default")).await.unwrap();
    let err = queue
        .complete(id, vec![], vec![parse_job(file("a.xml", 1))])
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidTransition(_)));
    assert_eq!(queue.queue_depth("default", "parse:nmap-xml").await.unwrap(), 0);

    let missing = queue
        .complete(JobId::new(), vec![], vec![])
        .await
        .unwrap_err();
    assert!(matches!(missing, ScanError::NotFound(_)));
}

#[sqlx::test(migrator = "kennel_core::MIGRATOR")]
async fn follow_ups_are_queued_with_the_first_report_only(pool: PgPool) {
    let queue = PostgresQueueService::new(pool).await.unwrap();
    let id = queue.enqueue(job("nmap", "default")).await.unwrap();
    let first = queue
        .record_findings(
            id,
            FindingsSummary::default(),
            vec![job("sslyze", "default")],
        )
        .await
        .unwrap();
    let second = queue
        .record_findings(
            id,
            FindingsSummary::default(),
            vec![job("sslyze", "default")],
        )
        .await
        .unwrap();
    assert!(first.first_report);
    assert_eq!(first.cascaded.len(), 1);
    assert!(!second.first_report);
    assert!(second.cascaded.is_empty());
    assert!(second.job.cascade_evaluated_at.is_some());
    assert_eq!(queue.queue_depth("default", "sslyze").await.unwrap(), 1);
}

#[sqlx::test(migrator = "kennel_core::MIGRATOR")]
async fn rejected_follow_ups_roll_back_the_first_report(pool: PgPool) {
    let queue = PostgresQueueService::new(pool).await.unwrap();
    let id = queue.enqueue(job("nmap", "default")).await.unwrap();
    let mut locked = job("sslyze", "default");
    locked.transition(JobState::Locked).unwrap();

    let err = queue
        .record_findings(
            id,
            FindingsSummary::default(),
            vec![job("sslyze", "default"), locked],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::InvalidJob(_)));
    let stored = queue.get(id).await.unwrap().unwrap();
    assert!(stored.cascade_evaluated_at.is_none());
    assert!(stored.findings.is_none());
    assert_eq!(queue.queue_depth("default", "sslyze").await.unwrap(), 0);

    let retry = queue
        .record_findings(
            id,
            FindingsSummary::default(),
            vec![job("sslyze", "default")],
        )
        .await
        .unwrap();
    assert!(retry.first_report);
    assert_eq!(retry.cascaded.len(), 1);
}
