//! Jobs: the atomic scheduling units of a run.
//!
//! A [`Job`] pairs one task with the backend/system it must run on, plus
//! the suite it belongs to and an optional variant discriminator.
//! [`Job::generate`] materializes the ordered pending list the runner
//! schedules from; [`Filter`] narrows that list from command-line patterns.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;

use crate::project::{Backend, Project, Suite, Task};

/// The preparation level a script runs at, selecting its working directory
/// and how the job is described in messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Project,
    Backend,
    Suite,
    Task,
}

/// An atomic scheduling unit: one task bound to a backend/system.
///
/// Identity is positional within the pending list; the `variant` string
/// participates only in naming.
#[derive(Debug)]
pub struct Job {
    pub backend: Arc<Backend>,
    pub system: String,
    pub suite: Arc<Suite>,
    pub task: Arc<Task>,
    pub variant: Option<String>,
    /// Project → backend → suite → task environment, merged; jobs with a
    /// variant additionally carry `VARIANT`.
    pub environment: HashMap<String, String>,
}

impl Job {
    /// Materializes the pending list: every task of every suite crossed
    /// with every backend/system, expanded per variant, in deterministic
    /// name order, narrowed by `filter` when present.
    pub fn generate(project: &Project, filter: Option<&Filter>) -> Vec<Arc<Job>> {
        let mut jobs = Vec::new();
        for backend in project.backends.values() {
            for system in &backend.systems {
                for suite in project.suites.values() {
                    for task in suite.tasks.values() {
                        let variants: Vec<Option<String>> = if task.variants.is_empty() {
                            vec![None]
                        } else {
                            task.variants.iter().cloned().map(Some).collect()
                        };
                        for variant in variants {
                            let job = Arc::new(Job {
                                backend: backend.clone(),
                                system: system.clone(),
                                suite: suite.clone(),
                                task: task.clone(),
                                environment: merged_environment(
                                    project,
                                    backend,
                                    suite,
                                    task,
                                    variant.as_deref(),
                                ),
                                variant,
                            });
                            if filter.is_none_or(|f| f.matches(&job)) {
                                jobs.push(job);
                            }
                        }
                    }
                }
            }
        }
        jobs
    }

    /// Task name with the variant suffix, e.g. `smoke:b`.
    pub fn task_name(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}:{}", self.task.name, variant),
            None => self.task.name.clone(),
        }
    }

    /// Fully-qualified name: `backend:system:suite/task[:variant]`.
    pub fn name(&self) -> String {
        format!(
            "{}:{}:{}/{}",
            self.backend.name,
            self.system,
            self.suite.name,
            self.task_name()
        )
    }

    /// How the job reads in a message about a script at `level`.
    pub fn string_for(&self, level: Level) -> String {
        match level {
            Level::Project => format!("project on {}:{}", self.backend.name, self.system),
            Level::Backend => format!("{}:{}", self.backend.name, self.system),
            Level::Suite => format!("{}:{}:{}", self.backend.name, self.system, self.suite.name),
            Level::Task => format!("{}:{}:{}", self.backend.name, self.system, self.task_name()),
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

fn merged_environment(
    project: &Project,
    backend: &Backend,
    suite: &Suite,
    task: &Task,
    variant: Option<&str>,
) -> HashMap<String, String> {
    let mut env = project.environment.clone();
    env.extend(backend.environment.clone());
    env.extend(suite.environment.clone());
    env.extend(task.environment.clone());
    if let Some(variant) = variant {
        env.insert("VARIANT".to_string(), variant.to_string());
    }
    env
}

/// Command-line job selection: glob patterns matched against the task
/// name, `suite/task`, and the fully-qualified job name, each with and
/// without the variant suffix.
#[derive(Debug, Clone)]
pub struct Filter {
    patterns: Vec<Regex>,
}

impl Filter {
    /// Compiles glob patterns (`*` and `?` wildcards). Returns `None` when
    /// no patterns were given, so an absent filter stays cheap to test.
    pub fn new(patterns: &[String]) -> Result<Option<Filter>> {
        if patterns.is_empty() {
            return Ok(None);
        }
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&glob_to_regex(p)).with_context(|| format!("invalid filter {p:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Filter { patterns }))
    }

    pub fn matches(&self, job: &Job) -> bool {
        let qualified = format!("{}/{}", job.suite.name, job.task_name());
        let bare = format!("{}/{}", job.suite.name, job.task.name);
        let candidates = [
            job.task.name.clone(),
            job.task_name(),
            bare,
            qualified,
            job.name(),
        ];
        self.patterns
            .iter()
            .any(|p| candidates.iter().any(|c| p.is_match(c)))
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            _ => regex.push_str(&regex::escape(&ch.to_string())),
        }
    }
    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    fn sample_project() -> Arc<Project> {
        load_config_str(
            r#"
            [project]
            remote-path = "/root/project"

            [project.environment]
            STAGE = "test"

            [backends.garden]
            type = "lxd"
            systems = ["noble", "jammy"]

            [suites.core]
            [suites.core.tasks.smoke]
            execute = "./smoke"

            [suites.core.tasks.full]
            execute = "./full"
            variants = ["a", "b"]

            [suites.core.tasks.full.environment]
            MODE = "deep"

            [suites.extra]
            [suites.extra.tasks.bench]
            execute = "./bench"
        "#,
        )
        .unwrap()
    }

    #[test]
    fn test_generate_orders_and_expands_variants() {
        let project = sample_project();
        let jobs = Job::generate(&project, None);
        // 2 systems x (full:a, full:b, smoke, bench) each.
        assert_eq!(jobs.len(), 8);
        let names: Vec<String> = jobs.iter().map(|j| j.name()).collect();
        assert_eq!(
            names,
            vec![
                "garden:noble:core/full:a",
                "garden:noble:core/full:b",
                "garden:noble:core/smoke",
                "garden:noble:extra/bench",
                "garden:jammy:core/full:a",
                "garden:jammy:core/full:b",
                "garden:jammy:core/smoke",
                "garden:jammy:extra/bench",
            ]
        );
    }

    #[test]
    fn test_environment_merging() {
        let project = sample_project();
        let jobs = Job::generate(&project, None);
        let full_a = &jobs[0];
        assert_eq!(full_a.environment.get("STAGE"), Some(&"test".to_string()));
        assert_eq!(full_a.environment.get("MODE"), Some(&"deep".to_string()));
        assert_eq!(full_a.environment.get("VARIANT"), Some(&"a".to_string()));
        let smoke = &jobs[2];
        assert_eq!(smoke.environment.get("VARIANT"), None);
        assert_eq!(smoke.environment.get("MODE"), None);
    }

    #[test]
    fn test_filter_matches_task_and_suite_forms() {
        let project = sample_project();

        let filter = Filter::new(&["smoke".to_string()]).unwrap().unwrap();
        let jobs = Job::generate(&project, Some(&filter));
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.task.name == "smoke"));

        let filter = Filter::new(&["core/*".to_string()]).unwrap().unwrap();
        let jobs = Job::generate(&project, Some(&filter));
        assert_eq!(jobs.len(), 6);

        let filter = Filter::new(&["full:b".to_string()]).unwrap().unwrap();
        let jobs = Job::generate(&project, Some(&filter));
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.variant.as_deref() == Some("b")));

        let filter = Filter::new(&["garden:noble:*".to_string()]).unwrap().unwrap();
        let jobs = Job::generate(&project, Some(&filter));
        assert_eq!(jobs.len(), 4);
    }

    #[test]
    fn test_empty_filter_is_none() {
        assert!(Filter::new(&[]).unwrap().is_none());
    }

    #[test]
    fn test_string_for_levels() {
        let project = sample_project();
        let jobs = Job::generate(&project, None);
        let job = &jobs[0];
        assert_eq!(job.string_for(Level::Project), "project on garden:noble");
        assert_eq!(job.string_for(Level::Backend), "garden:noble");
        assert_eq!(job.string_for(Level::Suite), "garden:noble:core");
        assert_eq!(job.string_for(Level::Task), "garden:noble:full:a");
    }
}
