//! Outcome accounting and the end-of-run report.
//!
//! Every job lands in exactly one of the task-level outcome lists, and
//! script failures at the surrounding levels are recorded in their own
//! lists, so the final report can group failures by where they happened.

use std::sync::Arc;

use tracing::{debug, info};

use crate::job::Job;

/// Outcome categories. Task-level outcomes partition the job list; the
/// remaining categories record failures of the surrounding prepare/restore
/// levels against the job that was current at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    TaskDone,
    TaskError,
    TaskAbort,
    TaskPrepareError,
    TaskRestoreError,
    SuitePrepareError,
    SuiteRestoreError,
    BackendPrepareError,
    BackendRestoreError,
    ProjectPrepareError,
    ProjectRestoreError,
}

/// Append-only outcome lists, guarded by the runner mutex.
#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) task_done: Vec<Arc<Job>>,
    pub(crate) task_error: Vec<Arc<Job>>,
    pub(crate) task_abort: Vec<Arc<Job>>,
    pub(crate) task_prepare_error: Vec<Arc<Job>>,
    pub(crate) task_restore_error: Vec<Arc<Job>>,
    pub(crate) suite_prepare_error: Vec<Arc<Job>>,
    pub(crate) suite_restore_error: Vec<Arc<Job>>,
    pub(crate) backend_prepare_error: Vec<Arc<Job>>,
    pub(crate) backend_restore_error: Vec<Arc<Job>>,
    pub(crate) project_prepare_error: Vec<Arc<Job>>,
    pub(crate) project_restore_error: Vec<Arc<Job>>,
}

impl Stats {
    pub(crate) fn record(&mut self, outcome: Outcome, job: Arc<Job>) {
        self.list_mut(outcome).push(job);
    }

    pub(crate) fn list(&self, outcome: Outcome) -> &[Arc<Job>] {
        match outcome {
            Outcome::TaskDone => &self.task_done,
            Outcome::TaskError => &self.task_error,
            Outcome::TaskAbort => &self.task_abort,
            Outcome::TaskPrepareError => &self.task_prepare_error,
            Outcome::TaskRestoreError => &self.task_restore_error,
            Outcome::SuitePrepareError => &self.suite_prepare_error,
            Outcome::SuiteRestoreError => &self.suite_restore_error,
            Outcome::BackendPrepareError => &self.backend_prepare_error,
            Outcome::BackendRestoreError => &self.backend_restore_error,
            Outcome::ProjectPrepareError => &self.project_prepare_error,
            Outcome::ProjectRestoreError => &self.project_restore_error,
        }
    }

    fn list_mut(&mut self, outcome: Outcome) -> &mut Vec<Arc<Job>> {
        match outcome {
            Outcome::TaskDone => &mut self.task_done,
            Outcome::TaskError => &mut self.task_error,
            Outcome::TaskAbort => &mut self.task_abort,
            Outcome::TaskPrepareError => &mut self.task_prepare_error,
            Outcome::TaskRestoreError => &mut self.task_restore_error,
            Outcome::SuitePrepareError => &mut self.suite_prepare_error,
            Outcome::SuiteRestoreError => &mut self.suite_restore_error,
            Outcome::BackendPrepareError => &mut self.backend_prepare_error,
            Outcome::BackendRestoreError => &mut self.backend_restore_error,
            Outcome::ProjectPrepareError => &mut self.project_prepare_error,
            Outcome::ProjectRestoreError => &mut self.project_restore_error,
        }
    }

    /// Logs the end-of-run summary: totals first, then every non-empty
    /// failure category as a sorted name list.
    pub(crate) fn log_report(&self) {
        info!("Successful tasks: {}", self.task_done.len());
        info!("Aborted tasks: {}", self.task_abort.len());

        log_names("Failed tasks", &self.task_error, task_name);
        log_names("Failed task prepare", &self.task_prepare_error, task_name);
        log_names("Failed task restore", &self.task_restore_error, task_name);
        log_names("Failed suite prepare", &self.suite_prepare_error, suite_name);
        log_names("Failed suite restore", &self.suite_restore_error, suite_name);
        log_names(
            "Failed backend prepare",
            &self.backend_prepare_error,
            backend_name,
        );
        log_names(
            "Failed backend restore",
            &self.backend_restore_error,
            backend_name,
        );
        log_names(
            "Failed project prepare",
            &self.project_prepare_error,
            project_name,
        );
        log_names(
            "Failed project restore",
            &self.project_restore_error,
            project_name,
        );
    }

    pub(crate) fn report(&self) -> RunReport {
        RunReport {
            done: self.task_done.len(),
            aborted: self.task_abort.len(),
            failed: self.task_error.len()
                + self.task_prepare_error.len()
                + self.task_restore_error.len()
                + self.suite_prepare_error.len()
                + self.suite_restore_error.len()
                + self.backend_prepare_error.len()
                + self.backend_restore_error.len()
                + self.project_prepare_error.len()
                + self.project_restore_error.len(),
        }
    }
}

/// Summary of an entire run, for callers that need an exit status.
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    /// Tasks that executed successfully.
    pub done: usize,
    /// Jobs never executed because of an upstream condition.
    pub aborted: usize,
    /// Script failures across all levels.
    pub failed: usize,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.aborted == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

fn project_name(_job: &Job) -> String {
    "project".to_string()
}

fn backend_name(job: &Job) -> String {
    job.backend.name.clone()
}

fn suite_name(job: &Job) -> String {
    job.suite.name.clone()
}

fn task_name(job: &Job) -> String {
    job.task_name()
}

/// Renders `backend:system:<name>` entries sorted, as an indented list.
fn names_block(jobs: &[Arc<Job>], name: fn(&Job) -> String) -> Option<(usize, String)> {
    if jobs.is_empty() {
        return None;
    }
    let mut names: Vec<String> = jobs
        .iter()
        .map(|job| format!("{}:{}:{}", job.backend.name, job.system, name(job)))
        .collect();
    names.sort();
    Some((names.len(), names.join("\n    - ")))
}

fn log_names(prefix: &str, jobs: &[Arc<Job>], name: fn(&Job) -> String) {
    if let Some((count, block)) = names_block(jobs, name) {
        info!("{}: {}\n    - {}", prefix, count, block);
    }
}

/// Like [`log_names`] but at debug level, for supervisor traces.
pub(crate) fn debug_names(prefix: &str, jobs: &[Arc<Job>]) {
    if let Some((count, block)) = names_block(jobs, task_name) {
        debug!("{}: {}\n    - {}", prefix, count, block);
    }
}
