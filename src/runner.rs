//! The runner: a worker pool executing jobs across provisioned machines.
//!
//! One [`Runner`] owns a whole run. It sizes a worker pool per
//! backend/system, hands each worker its next job so as to minimize suite
//! transitions, and collects every outcome. Workers share nothing but the
//! state behind the runner's single mutex; the mutex is only ever held for
//! short synchronous sections, never across remote I/O.
//!
//! ```no_run
//! use stampede::config::load_config;
//! use stampede::runner::{Options, Runner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let project = load_config(std::path::Path::new("stampede.toml"))?;
//!     let runner = Runner::new(project, Options::default())?;
//!     let report = runner.run().await;
//!     std::process::exit(report.exit_code());
//! }
//! ```

mod acquire;
pub mod stats;
mod worker;


use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{Dialer, SshDialer};
use crate::job::{Filter, Job};
use crate::project::{Backend, Project};
use crate::provider::{Provider, Server, providers_for};

pub use stats::{Outcome, RunReport};

use stats::{Stats, debug_names};
use worker::Worker;

/// The recognized run options.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Root credential passed to providers and used when dialing.
    pub password: String,
    /// Narrows which jobs enter the pending list.
    pub filter: Option<Filter>,
    /// Backend name → addresses to reconnect to instead of allocating.
    pub reuse: HashMap<String, Vec<String>>,
    /// Do not discard servers at the end; print the reuse hint instead.
    pub keep: bool,
    /// Drop into an interactive shell after a script fails.
    pub debug: bool,
    /// Substitute an interactive shell for every execute phase.
    pub shell: bool,
    /// After any failure, skip every further restore on that worker.
    pub abend: bool,
    /// Run only the restore chain for each job.
    pub restore: bool,
    /// For reused servers, wipe and re-upload the project data.
    pub resend: bool,
    /// Recognized for the command line; core scheduling ignores it.
    pub discard: bool,
}

/// Key of the per-suite worker counters: (backend, system, suite).
pub(crate) type SuiteKey = (String, String, String);

pub(crate) fn suite_key(job: &Job) -> SuiteKey {
    (
        job.backend.name.clone(),
        job.system.clone(),
        job.suite.name.clone(),
    )
}

/// Everything workers share, guarded by the runner mutex.
pub(crate) struct RunnerState {
    /// Job slots in scheduling order; a claimed slot is `None`.
    pub(crate) pending: Vec<Option<Arc<Job>>>,
    /// How many workers are currently inside each suite.
    pub(crate) suite_workers: HashMap<SuiteKey, isize>,
    /// Every server acquired during the run, for the reuse hint.
    pub(crate) servers: Vec<Arc<dyn Server>>,
    /// Reuse addresses already claimed by some worker.
    pub(crate) reused: HashSet<String>,
    pub(crate) stats: Stats,
}

impl RunnerState {
    /// Picks the next pending job for a worker on `backend`/`system`.
    ///
    /// Suite continuity dominates: the first pending job of the worker's
    /// current suite wins outright. Failing that, the job whose suite has
    /// the fewest workers right now is taken, earliest index breaking
    /// ties. The chosen slot is cleared so no other worker sees it.
    pub(crate) fn next_job(
        &mut self,
        backend: &Backend,
        system: &str,
        current_suite: Option<&str>,
    ) -> Option<Arc<Job>> {
        let mut best: Option<usize> = None;
        let mut best_workers = isize::MAX;
        for (index, slot) in self.pending.iter().enumerate() {
            let Some(job) = slot else { continue };
            if job.backend.name != backend.name || job.system != system {
                continue;
            }
            if current_suite == Some(job.suite.name.as_str()) {
                best = Some(index);
                break;
            }
            let workers = self
                .suite_workers
                .get(&suite_key(job))
                .copied()
                .unwrap_or(0);
            if workers < best_workers {
                best = Some(index);
                best_workers = workers;
            }
        }
        best.and_then(|index| self.pending[index].take())
    }
}

/// Supervisor of one run. There is exactly one per run; workers receive it
/// as an `Arc` rather than reaching for globals.
pub struct Runner {
    pub(crate) project: Arc<Project>,
    pub(crate) options: Options,
    pub(crate) providers: HashMap<String, Arc<dyn Provider>>,
    pub(crate) dialer: Arc<dyn Dialer>,
    state: Mutex<RunnerState>,
    pub(crate) cancel: CancellationToken,
}

impl Runner {
    /// Builds a runner for the project, constructing one provider per
    /// backend from its declared type.
    ///
    /// # Errors
    ///
    /// Fails when a backend declares an unsupported type.
    pub fn new(project: Arc<Project>, options: Options) -> Result<Arc<Runner>> {
        let providers = providers_for(&project)?;
        Ok(Runner::with_collaborators(
            project,
            options,
            providers,
            Arc::new(SshDialer),
        ))
    }

    /// Builds a runner around explicit collaborators. This is how tests
    /// substitute in-memory providers and clients.
    pub fn with_collaborators(
        project: Arc<Project>,
        options: Options,
        providers: HashMap<String, Arc<dyn Provider>>,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<Runner> {
        let pending = Job::generate(&project, options.filter.as_ref())
            .into_iter()
            .map(Some)
            .collect();
        Arc::new(Runner {
            project,
            options,
            providers,
            dialer,
            state: Mutex::new(RunnerState {
                pending,
                suite_workers: HashMap::new(),
                servers: Vec::new(),
                reused: HashSet::new(),
                stats: Stats::default(),
            }),
            cancel: CancellationToken::new(),
        })
    }

    /// Requests a cooperative stop: workers finish their in-flight script
    /// and exit at the next loop top; retry loops abort promptly.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs every pending job to completion and returns the summary.
    ///
    /// Spawns `min(cap, matching jobs)` workers per (backend, system),
    /// waits for all of them, then accounts for jobs nobody claimed and
    /// logs the report.
    pub async fn run(self: Arc<Self>) -> RunReport {
        let (counts, alive) = {
            let state = self.state();
            worker_counts(&self.project, &state.pending)
        };

        {
            let state = self.state();
            let pending: Vec<Arc<Job>> = state.pending.iter().flatten().cloned().collect();
            debug_names(
                &format!(
                    "Starting {} worker{} for the following jobs",
                    alive,
                    if alive == 1 { "" } else { "s" }
                ),
                &pending,
            );
        }

        let (done_tx, mut done_rx) = mpsc::channel::<()>(alive.max(1));
        for backend in self.project.backends.values() {
            for system in &backend.systems {
                let key = (backend.name.clone(), system.clone());
                let slots = counts.get(&key).copied().unwrap_or(0);
                for _ in 0..slots {
                    let worker = Worker::new(self.clone(), backend.clone(), system.clone());
                    let done = done_tx.clone();
                    tokio::spawn(async move {
                        worker.run().await;
                        let _ = done.send(()).await;
                    });
                }
            }
        }
        drop(done_tx);

        let mut alive = alive;
        while alive > 0 {
            // `recv` returning `None` means a worker task died without
            // signalling; count it as terminated rather than hang.
            match done_rx.recv().await {
                Some(()) => {
                    alive -= 1;
                    if alive > 0 {
                        debug!("Worker terminated. {} still alive.", alive);
                    } else {
                        debug!("Worker terminated.");
                    }
                }
                None => break,
            }
        }

        self.finish()
    }

    /// Accounts for unclaimed jobs, logs the report, and prints the reuse
    /// hint when servers were kept.
    fn finish(&self) -> RunReport {
        let mut state = self.state();
        let leftovers: Vec<Arc<Job>> = state
            .pending
            .iter_mut()
            .filter_map(Option::take)
            .collect();
        debug_names("Pending jobs after workers returned", &leftovers);
        for job in leftovers {
            state.stats.record(Outcome::TaskAbort, job);
        }
        state.stats.log_report();
        if self.options.keep && !state.servers.is_empty() {
            for server in &state.servers {
                info!("Keeping {} at {}", server.label(), server.address());
            }
            info!(
                "Reuse with: stampede {}",
                reuse_args(&self.options, &state.servers)
            );
        }
        state.stats.report()
    }
}

/// Computes how many workers each (backend, system) pair needs: one per
/// matching pending job, capped by the backend's per-system limit. Returns
/// the per-pair counts and their total.
fn worker_counts(
    project: &Project,
    pending: &[Option<Arc<Job>>],
) -> (HashMap<(String, String), usize>, usize) {
    let mut counts: HashMap<(String, String), usize> = HashMap::new();
    let mut alive = 0;
    for backend in project.backends.values() {
        for system in &backend.systems {
            let key = (backend.name.clone(), system.clone());
            for slot in pending {
                let Some(job) = slot else { continue };
                if job.backend.name != backend.name || &job.system != system {
                    continue;
                }
                let count = counts.entry(key.clone()).or_insert(0);
                if backend.workers_for(system) > *count {
                    *count += 1;
                    alive += 1;
                } else {
                    break;
                }
            }
        }
    }
    (counts, alive)
}

/// Renders the command-line fragment that reproduces this run against the
/// surviving servers: `-pass=... -reuse=backend:addr,... [-keep] [mode]`.
fn reuse_args(options: &Options, servers: &[Arc<dyn Server>]) -> String {
    let mut groups: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for server in servers {
        groups
            .entry(server.backend_name())
            .or_default()
            .push(server.address());
    }
    let clause = groups
        .iter_mut()
        .map(|(backend, addresses)| {
            addresses.sort_unstable();
            format!("{}:{}", backend, addresses.join(","))
        })
        .collect::<Vec<String>>()
        .join(" ");

    let mut args = format!("-pass={} -reuse=", options.password);
    if groups.len() > 1 {
        args.push_str(&format!("'{clause}'"));
    } else {
        args.push_str(&clause);
    }
    if options.keep {
        args.push_str(" -keep");
    }
    if options.debug {
        args.push_str(" -debug");
    } else if options.shell {
        args.push_str(" -shell");
    } else if options.abend {
        args.push_str(" -abend");
    } else if options.restore {
        args.push_str(" -restore");
    }
    args
}
