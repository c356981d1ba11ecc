//! Configuration loading for stampede.
//!
//! Runs are described by a TOML file (`stampede.toml` by default) holding
//! the project scripts, the backends to provision on, and the suite/task
//! tree. [`load_config`] parses and validates the file and returns the
//! immutable domain model from [`crate::project`].
//!
//! ```toml
//! [project]
//! remote-path = "/root/project"
//! prepare = "apt-get update"
//!
//! [backends.garden]
//! type = "lxd"
//! systems = ["ubuntu-24.04"]
//!
//! [suites.core]
//! [suites.core.tasks.smoke]
//! execute = "./run-checks"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::project::{Backend, Project, Suite, Task};

/// Raw TOML schema, converted into [`Project`] after parsing.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    project: RawProject,
    backends: BTreeMap<String, RawBackend>,
    suites: BTreeMap<String, RawSuite>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProject {
    /// Local source tree; `~` is expanded. Defaults to the current directory.
    #[serde(default = "default_path")]
    path: String,

    /// Directory on the remote where the tree is placed.
    #[serde(rename = "remote-path")]
    remote_path: String,

    #[serde(default = "default_include")]
    include: Vec<String>,

    #[serde(default)]
    exclude: Vec<String>,

    #[serde(default)]
    prepare: String,

    #[serde(default)]
    restore: String,

    #[serde(default)]
    environment: HashMap<String, String>,
}

fn default_path() -> String {
    ".".to_string()
}

fn default_include() -> Vec<String> {
    vec!["**".to_string()]
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBackend {
    #[serde(rename = "type")]
    kind: String,

    systems: Vec<String>,

    /// Per-system worker cap; systems without an entry get 1.
    #[serde(default)]
    workers: HashMap<String, usize>,

    #[serde(default)]
    prepare: String,

    #[serde(default)]
    restore: String,

    #[serde(default)]
    environment: HashMap<String, String>,

    #[serde(default = "default_location")]
    location: String,

    #[serde(default = "default_plan")]
    plan: String,
}

fn default_location() -> String {
    "us-east".to_string()
}

fn default_plan() -> String {
    "g6-nanode-1".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSuite {
    #[serde(default)]
    prepare: String,

    #[serde(default)]
    restore: String,

    #[serde(default)]
    environment: HashMap<String, String>,

    #[serde(default)]
    tasks: BTreeMap<String, RawTask>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTask {
    #[serde(default)]
    prepare: String,

    #[serde(default)]
    execute: String,

    #[serde(default)]
    restore: String,

    #[serde(default)]
    environment: HashMap<String, String>,

    #[serde(default)]
    variants: Vec<String>,
}

/// Loads a project definition from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains invalid TOML, or
/// fails validation (no backends, a backend without systems, an empty
/// suite, or a worker cap of zero).
pub fn load_config(path: &Path) -> Result<Arc<Project>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;
    load_config_str(&content).with_context(|| format!("cannot load {}", path.display()))
}

/// Loads a project definition from a TOML string.
pub fn load_config_str(content: &str) -> Result<Arc<Project>> {
    let raw: RawConfig = toml::from_str(content).context("cannot parse config")?;
    validate(&raw)?;

    let path = PathBuf::from(shellexpand::tilde(&raw.project.path).into_owned());

    let backends = raw
        .backends
        .into_iter()
        .map(|(name, b)| {
            let backend = Backend {
                name: name.clone(),
                kind: b.kind,
                systems: b.systems,
                workers: b.workers,
                prepare: b.prepare,
                restore: b.restore,
                environment: b.environment,
                location: b.location,
                plan: b.plan,
            };
            (name, Arc::new(backend))
        })
        .collect();

    let suites = raw
        .suites
        .into_iter()
        .map(|(name, s)| {
            let tasks = s
                .tasks
                .into_iter()
                .map(|(tname, t)| {
                    let task = Task {
                        name: tname.clone(),
                        prepare: t.prepare,
                        execute: t.execute,
                        restore: t.restore,
                        environment: t.environment,
                        variants: t.variants,
                    };
                    (tname, Arc::new(task))
                })
                .collect();
            let suite = Suite {
                name: name.clone(),
                prepare: s.prepare,
                restore: s.restore,
                environment: s.environment,
                tasks,
            };
            (name, Arc::new(suite))
        })
        .collect();

    Ok(Arc::new(Project {
        path,
        remote_path: raw.project.remote_path,
        include: raw.project.include,
        exclude: raw.project.exclude,
        prepare: raw.project.prepare,
        restore: raw.project.restore,
        environment: raw.project.environment,
        backends,
        suites,
    }))
}

fn validate(raw: &RawConfig) -> Result<()> {
    if raw.project.remote_path.is_empty() {
        bail!("project remote-path must not be empty");
    }
    if raw.backends.is_empty() {
        bail!("at least one backend must be defined");
    }
    for (name, backend) in &raw.backends {
        if backend.systems.is_empty() {
            bail!("backend {name} has no systems");
        }
        for (system, cap) in &backend.workers {
            if *cap == 0 {
                bail!("backend {name} has a zero worker cap for {system}");
            }
            if !backend.systems.contains(system) {
                bail!("backend {name} caps workers for unknown system {system}");
            }
        }
    }
    if raw.suites.is_empty() {
        bail!("at least one suite must be defined");
    }
    for (name, suite) in &raw.suites {
        if suite.tasks.is_empty() {
            bail!("suite {name} has no tasks");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
        [project]
        remote-path = "/root/project"
        prepare = "apt-get update"
        exclude = [".git"]

        [project.environment]
        STAGE = "test"

        [backends.garden]
        type = "lxd"
        systems = ["ubuntu-24.04", "ubuntu-22.04"]
        prepare = "true"

        [backends.garden.workers]
        "ubuntu-24.04" = 2

        [suites.core]
        prepare = "make deps"

        [suites.core.tasks.smoke]
        execute = "./smoke"
        variants = ["a", "b"]

        [suites.core.tasks.full]
        execute = "./full"
    "#;

    #[test]
    fn test_load_basic_config() {
        let project = load_config_str(BASIC).unwrap();
        assert_eq!(project.remote_path, "/root/project");
        assert_eq!(project.prepare, "apt-get update");
        assert_eq!(project.exclude, vec![".git".to_string()]);
        assert_eq!(project.environment.get("STAGE"), Some(&"test".to_string()));

        let backend = &project.backends["garden"];
        assert_eq!(backend.kind, "lxd");
        assert_eq!(backend.workers_for("ubuntu-24.04"), 2);
        assert_eq!(backend.workers_for("ubuntu-22.04"), 1);

        let suite = &project.suites["core"];
        assert_eq!(suite.prepare, "make deps");
        assert_eq!(suite.tasks.len(), 2);
        assert_eq!(suite.tasks["smoke"].variants, vec!["a", "b"]);
    }

    #[test]
    fn test_backend_defaults() {
        let project = load_config_str(
            r#"
            [project]
            remote-path = "/root/p"

            [backends.cloud]
            type = "linode"
            systems = ["debian-12"]

            [suites.s]
            [suites.s.tasks.t]
            execute = "true"
        "#,
        )
        .unwrap();
        let backend = &project.backends["cloud"];
        assert_eq!(backend.location, "us-east");
        assert_eq!(backend.plan, "g6-nanode-1");
        assert_eq!(project.include, vec!["**".to_string()]);
    }

    #[test]
    fn test_rejects_backend_without_systems() {
        let err = load_config_str(
            r#"
            [project]
            remote-path = "/root/p"

            [backends.empty]
            type = "lxd"
            systems = []

            [suites.s]
            [suites.s.tasks.t]
            execute = "true"
        "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("no systems"));
    }

    #[test]
    fn test_rejects_zero_worker_cap() {
        let err = load_config_str(
            r#"
            [project]
            remote-path = "/root/p"

            [backends.b]
            type = "lxd"
            systems = ["sys"]

            [backends.b.workers]
            "sys" = 0

            [suites.s]
            [suites.s.tasks.t]
            execute = "true"
        "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("zero worker cap"));
    }

    #[test]
    fn test_rejects_missing_suites() {
        let err = load_config_str(
            r#"
            [project]
            remote-path = "/root/p"

            [backends.b]
            type = "lxd"
            systems = ["sys"]

            [suites]
        "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("at least one suite"));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = load_config_str(
            r#"
            [project]
            remote-path = "/root/p"
            bogus = true

            [backends.b]
            type = "lxd"
            systems = ["sys"]

            [suites.s]
            [suites.s.tasks.t]
            execute = "true"
        "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("cannot parse config"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stampede.toml");
        std::fs::write(&path, BASIC).unwrap();
        let project = load_config(&path).unwrap();
        assert_eq!(project.backends.len(), 1);

        let missing = dir.path().join("missing.toml");
        let err = load_config(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("cannot read config file"));
    }
}
