//! The worker loop: one machine, a stream of jobs, symmetric restores.
//!
//! Each worker owns one acquired client for its whole life. It keeps a
//! nested preparation stack — project, backend, suite, task — entering a
//! level the first time a job needs it and restoring levels in reverse
//! order on the way out. Failures are contained to the narrowest level
//! that can absorb them: a bad suite is blacklisted on this worker only,
//! while project/backend damage stops the worker altogether.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{error, info};

use super::{Outcome, Runner, suite_key};
use crate::client::Client;
use crate::job::{Job, Level};
use crate::project::{Backend, Suite};

/// What a script invocation is doing, for messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Preparing,
    Executing,
    Restoring,
}

impl Verb {
    fn title(self) -> &'static str {
        match self {
            Verb::Preparing => "Preparing",
            Verb::Executing => "Executing",
            Verb::Restoring => "Restoring",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Verb::Preparing => "preparing",
            Verb::Executing => "executing",
            Verb::Restoring => "restoring",
        };
        f.write_str(verb)
    }
}

/// One worker slot bound to a (backend, system) pair.
pub(crate) struct Worker {
    runner: Arc<Runner>,
    backend: Arc<Backend>,
    system: String,
}

impl Worker {
    pub(crate) fn new(runner: Arc<Runner>, backend: Arc<Backend>, system: String) -> Worker {
        Worker {
            runner,
            backend,
            system,
        }
    }

    /// Drives jobs until none remain for this (backend, system), the
    /// project goes bad, abend strikes, or the run is cancelled. Always
    /// releases its server on the way out.
    pub(crate) async fn run(self) {
        let Some(mut client) = super::acquire::acquire(&self.runner, &self.backend, &self.system)
            .await
        else {
            return;
        };

        let restore_only = self.runner.options.restore;

        let mut abend = false;
        let mut bad_project = false;
        let mut bad_suites: HashSet<String> = HashSet::new();

        let mut inside_project = false;
        let mut inside_backend = false;
        let mut inside_suite: Option<Arc<Suite>> = None;

        let mut job: Option<Arc<Job>> = None;
        let mut last: Option<Arc<Job>> = None;

        loop {
            let picked = {
                let mut state = self.runner.state();
                if let Some(previous) = job.take() {
                    *state.suite_workers.entry(suite_key(&previous)).or_insert(0) -= 1;
                }
                if bad_project || abend || self.runner.cancel.is_cancelled() {
                    None
                } else {
                    let next = state.next_job(
                        &self.backend,
                        &self.system,
                        inside_suite.as_ref().map(|suite| suite.name.as_str()),
                    );
                    if let Some(next) = &next {
                        *state.suite_workers.entry(suite_key(next)).or_insert(0) += 1;
                    }
                    next
                }
            };
            let Some(current) = picked else { break };
            job = Some(current.clone());

            if bad_suites.contains(&current.suite.name) {
                self.record(Outcome::TaskAbort, &current);
                continue;
            }

            // Leaving a suite restores it before anything else happens.
            if let Some(previous) = inside_suite.clone() {
                if previous.name != current.suite.name {
                    let Some(previous_job) = last.clone() else {
                        break;
                    };
                    if !self
                        .run_script(
                            &mut client,
                            &previous_job,
                            Verb::Restoring,
                            Level::Suite,
                            &previous.restore,
                            &mut abend,
                        )
                        .await
                    {
                        self.record(Outcome::SuiteRestoreError, &previous_job);
                        self.record(Outcome::TaskAbort, &current);
                        bad_project = true;
                        continue;
                    }
                    inside_suite = None;
                }
            }

            last = Some(current.clone());

            // Restore mode enters no level at all: the preparation stack
            // stays empty and the exit unwind has nothing to restore.
            if !restore_only && !inside_project {
                inside_project = true;
                if !self
                    .run_script(
                        &mut client,
                        &current,
                        Verb::Preparing,
                        Level::Project,
                        &self.runner.project.prepare,
                        &mut abend,
                    )
                    .await
                {
                    self.record(Outcome::ProjectPrepareError, &current);
                    self.record(Outcome::TaskAbort, &current);
                    bad_project = true;
                    continue;
                }

                inside_backend = true;
                if !self
                    .run_script(
                        &mut client,
                        &current,
                        Verb::Preparing,
                        Level::Backend,
                        &self.backend.prepare,
                        &mut abend,
                    )
                    .await
                {
                    self.record(Outcome::BackendPrepareError, &current);
                    self.record(Outcome::TaskAbort, &current);
                    bad_project = true;
                    continue;
                }
            }

            let entering = inside_suite
                .as_ref()
                .is_none_or(|suite| suite.name != current.suite.name);
            if !restore_only && entering {
                inside_suite = Some(current.suite.clone());
                if !self
                    .run_script(
                        &mut client,
                        &current,
                        Verb::Preparing,
                        Level::Suite,
                        &current.suite.prepare,
                        &mut abend,
                    )
                    .await
                {
                    self.record(Outcome::SuitePrepareError, &current);
                    self.record(Outcome::TaskAbort, &current);
                    bad_suites.insert(current.suite.name.clone());
                    continue;
                }
            }

            if restore_only {
                // Restore mode: no task prepare, no execute.
            } else if !self
                .run_script(
                    &mut client,
                    &current,
                    Verb::Preparing,
                    Level::Task,
                    &current.task.prepare,
                    &mut abend,
                )
                .await
            {
                self.record(Outcome::TaskPrepareError, &current);
                self.record(Outcome::TaskAbort, &current);
            } else if self
                .run_script(
                    &mut client,
                    &current,
                    Verb::Executing,
                    Level::Task,
                    &current.task.execute,
                    &mut abend,
                )
                .await
            {
                self.record(Outcome::TaskDone, &current);
            } else {
                self.record(Outcome::TaskError, &current);
            }

            // The task restore runs even when prepare or execute failed;
            // a failure here taints the whole project for this worker.
            if !abend
                && !self
                    .run_script(
                        &mut client,
                        &current,
                        Verb::Restoring,
                        Level::Task,
                        &current.task.restore,
                        &mut abend,
                    )
                    .await
            {
                self.record(Outcome::TaskRestoreError, &current);
                bad_project = true;
            }
        }

        // Unwind the levels that were entered, innermost first. Each
        // failure is recorded but does not stop the remaining restores;
        // abend stops them all.
        if let Some(last_job) = last {
            if !abend {
                if let Some(suite) = inside_suite.take() {
                    if !self
                        .run_script(
                            &mut client,
                            &last_job,
                            Verb::Restoring,
                            Level::Suite,
                            &suite.restore,
                            &mut abend,
                        )
                        .await
                    {
                        self.record(Outcome::SuiteRestoreError, &last_job);
                    }
                }
            }
            if !abend && inside_backend {
                if !self
                    .run_script(
                        &mut client,
                        &last_job,
                        Verb::Restoring,
                        Level::Backend,
                        &self.backend.restore,
                        &mut abend,
                    )
                    .await
                {
                    self.record(Outcome::BackendRestoreError, &last_job);
                }
            }
            if !abend && inside_project {
                if !self
                    .run_script(
                        &mut client,
                        &last_job,
                        Verb::Restoring,
                        Level::Project,
                        &self.runner.project.restore,
                        &mut abend,
                    )
                    .await
                {
                    self.record(Outcome::ProjectRestoreError, &last_job);
                }
            }
        }

        let server = client.server();
        client.close().await;
        if !self.runner.options.keep {
            info!("Discarding {}...", server.label());
            if let Err(e) = server.discard().await {
                error!("Error discarding {}: {}", server.label(), e);
            }
        }
    }

    fn record(&self, outcome: Outcome, job: &Arc<Job>) {
        self.runner.state().stats.record(outcome, job.clone());
    }

    /// Runs one script for `job` at `level`. Empty scripts trivially
    /// succeed. A failure logs the error, optionally opens a debug shell,
    /// latches `abend` from the options, and returns false.
    async fn run_script(
        &self,
        client: &mut Box<dyn Client>,
        job: &Arc<Job>,
        verb: Verb,
        level: Level,
        script: &str,
        abend: &mut bool,
    ) -> bool {
        let script = script.trim();
        if script.is_empty() {
            return true;
        }
        let context = job.string_for(level);
        info!("{} {}...", verb.title(), context);

        let dir = match level {
            Level::Project | Level::Backend => self.runner.project.remote_path.clone(),
            Level::Suite | Level::Task => {
                format!("{}/{}", self.runner.project.remote_path, job.task.name)
            }
        };

        if self.runner.options.shell && verb == Verb::Executing {
            info!("Starting shell instead of executing {}...", job);
            if let Err(e) = client.shell("/bin/bash", &dir, &self.shell_env(job)).await {
                error!("Error running shell: {}", e);
            }
            info!("Continuing...");
            return true;
        }

        match client.trace(script, &dir, &job.environment).await {
            Ok(_) => true,
            Err(e) => {
                error!("Error {} {}: {}", verb, context, e);
                if self.runner.options.debug {
                    info!("Starting shell to debug...");
                    if let Err(e) = client.shell("/bin/bash", &dir, &self.shell_env(job)).await {
                        error!("Error running debug shell: {}", e);
                    }
                    info!("Continuing...");
                }
                *abend = self.runner.options.abend;
                false
            }
        }
    }

    /// Environment for interactive shells: the job environment plus a home
    /// at the project tree and a prompt naming the machine.
    fn shell_env(&self, job: &Job) -> HashMap<String, String> {
        let mut env = job.environment.clone();
        env.insert("HOME".to_string(), self.runner.project.remote_path.clone());
        env.insert(
            "PS1".to_string(),
            format!("{}:{} \\w\\$ ", self.backend.name, job.system),
        );
        env
    }
}
