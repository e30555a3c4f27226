//! Prometheus-style metrics for queue monitoring.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! application installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total messages pushed.
    pub const MESSAGES_PUSHED_TOTAL: &str = "quay_messages_pushed_total";
    /// Total messages leased by a pop.
    pub const MESSAGES_POPPED_TOTAL: &str = "quay_messages_popped_total";
    /// Total jobs whose execute callback succeeded.
    pub const JOBS_COMPLETED_TOTAL: &str = "quay_jobs_completed_total";
    /// Total jobs whose execute callback failed.
    pub const JOBS_FAILED_TOTAL: &str = "quay_jobs_failed_total";
    /// Total messages released back to the queue.
    pub const MESSAGES_RELEASED_TOTAL: &str = "quay_messages_released_total";
    /// Total messages buried.
    pub const MESSAGES_BURIED_TOTAL: &str = "quay_messages_buried_total";
    /// Total messages deleted.
    pub const MESSAGES_DELETED_TOTAL: &str = "quay_messages_deleted_total";
    /// Total messages that could not be decoded or resolved.
    pub const MESSAGES_UNDELIVERABLE_TOTAL: &str = "quay_messages_undeliverable_total";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "quay_job_duration_seconds";

    /// Resident memory seen by the worker loop, in megabytes.
    pub const WORKER_MEMORY_MB: &str = "quay_worker_memory_mb";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::MESSAGES_PUSHED_TOTAL, "Total number of messages pushed");
    describe_counter!(
        names::MESSAGES_POPPED_TOTAL,
        "Total number of messages leased by a pop"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed");
    describe_counter!(
        names::MESSAGES_RELEASED_TOTAL,
        "Total number of messages released for retry"
    );
    describe_counter!(names::MESSAGES_BURIED_TOTAL, "Total number of messages buried");
    describe_counter!(names::MESSAGES_DELETED_TOTAL, "Total number of messages deleted");
    describe_counter!(
        names::MESSAGES_UNDELIVERABLE_TOTAL,
        "Total number of undecodable or unresolvable messages"
    );

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );

    describe_gauge!(
        names::WORKER_MEMORY_MB,
        "Resident memory of the worker process in megabytes"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a message pushed.
    pub fn pushed(queue: &str) {
        counter!(names::MESSAGES_PUSHED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a message popped.
    pub fn popped(queue: &str) {
        counter!(names::MESSAGES_POPPED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a job completed.
    pub fn completed(queue: &str, job_name: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job failed.
    pub fn failed(queue: &str, job_name: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a release.
    pub fn released(queue: &str, attempt: u32) {
        counter!(
            names::MESSAGES_RELEASED_TOTAL,
            "queue" => queue.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a bury.
    pub fn buried(queue: &str) {
        counter!(names::MESSAGES_BURIED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a delete.
    pub fn deleted(queue: &str) {
        counter!(names::MESSAGES_DELETED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record an undeliverable message.
    pub fn undeliverable(queue: &str, reason: &str) {
        counter!(
            names::MESSAGES_UNDELIVERABLE_TOTAL,
            "queue" => queue.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Update resident memory.
    pub fn memory(queue: &str, megabytes: u64) {
        gauge!(names::WORKER_MEMORY_MB, "queue" => queue.to_string()).set(megabytes as f64);
    }
}
