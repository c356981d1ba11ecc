//! # stampede
//!
//! A distributed script orchestrator: stampede provisions ephemeral
//! machines across cloud/container backends, dispatches prepare/execute/
//! restore scripts (jobs) to them through a suite-aware worker pool, and
//! reports a structured outcome.
//!
//! ## Overview
//!
//! A project declares backends (where machines come from), suites (groups
//! of tasks sharing prepare/restore scripts), and tasks (the leaf script
//! sequences). Every task is crossed with every backend/system into a
//! job, and a pool of workers — one machine each — drains the job list:
//!
//! - **Suite continuity**: a worker keeps taking jobs from its current
//!   suite while any remain, avoiding restore/prepare churn; when forced
//!   to switch it picks the suite with the fewest workers on it.
//! - **Nested preparation**: project, backend, suite and task scripts are
//!   prepared on the way in and restored symmetrically on every exit
//!   path, so machines stay reusable.
//! - **Server lifecycle**: allocation with bounded retry, reuse of
//!   machines kept by a previous run, and discard on the way out.
//!
//! ## Architecture
//!
//! - [`config`] — TOML project definitions
//! - [`project`] / [`job`] — the immutable domain model and job list
//! - [`provider`] — machine provisioning (`lxd`, `linode`)
//! - [`client`] — remote sessions over SSH
//! - [`runner`] — the worker-pool scheduler itself
//!
//! ## Quick start
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

pub mod client;
pub mod config;
pub mod job;
pub mod project;
pub mod provider;
pub mod runner;

pub use config::load_config;
pub use job::{Filter, Job};
pub use project::{Backend, Project, Suite, Task};
pub use runner::{Options, RunReport, Runner};
