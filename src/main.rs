//! stampede CLI - distributed script orchestrator.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{Level, warn};
use tracing_subscriber::FmtSubscriber;

use stampede::config::load_config;
use stampede::job::Filter;
use stampede::runner::{Options, Runner};

#[derive(Parser)]
#[command(name = "stampede")]
#[command(about = "Run prepare/execute/restore jobs across provisioned machines", long_about = None)]
#[command(version)]
struct Cli {
    /// Project definition file
    #[arg(short, long, default_value = "stampede.toml")]
    config: PathBuf,

    /// Root credential passed to providers and SSH
    #[arg(long = "pass", default_value = "")]
    password: String,

    /// Servers to reuse instead of allocating, as
    /// "backend:addr1,addr2 backend2:addr3"
    #[arg(long)]
    reuse: Option<String>,

    /// Keep servers after the run and print how to reuse them
    #[arg(long)]
    keep: bool,

    /// Drop into an interactive shell after a script fails
    #[arg(long)]
    debug: bool,

    /// Substitute an interactive shell for every execute phase
    #[arg(long)]
    shell: bool,

    /// After any failure, skip all further restore scripts
    #[arg(long)]
    abend: bool,

    /// Run only the restore chain for each matched job
    #[arg(long)]
    restore: bool,

    /// For reused servers, wipe and re-upload the project data
    #[arg(long)]
    resend: bool,

    /// Discard matched servers instead of keeping them around
    #[arg(long)]
    discard: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Patterns selecting which jobs to run (globs over task names)
    filter: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let project = load_config(&cli.config)
        .with_context(|| format!("cannot load project from {}", cli.config.display()))?;

    let options = Options {
        password: cli.password,
        filter: Filter::new(&cli.filter)?,
        reuse: parse_reuse(cli.reuse.as_deref())?,
        keep: cli.keep,
        debug: cli.debug,
        shell: cli.shell,
        abend: cli.abend,
        restore: cli.restore,
        resend: cli.resend,
        discard: cli.discard,
    };

    let runner = Runner::new(project, options)?;

    // First interrupt asks for a graceful stop: workers finish their
    // in-flight script and unwind. A second interrupt kills the process.
    let stopper = runner.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping workers...");
            stopper.stop();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    let report = runner.run().await;
    std::process::exit(report.exit_code());
}

/// Parses the reuse flag: whitespace-separated `backend:addr1,addr2`
/// groups.
fn parse_reuse(value: Option<&str>) -> Result<HashMap<String, Vec<String>>> {
    let mut reuse: HashMap<String, Vec<String>> = HashMap::new();
    let Some(value) = value else {
        return Ok(reuse);
    };
    for group in value.split_whitespace() {
        let Some((backend, addresses)) = group.split_once(':') else {
            bail!("invalid reuse group {group:?}, expected backend:addr1,addr2");
        };
        if backend.is_empty() {
            bail!("invalid reuse group {group:?}, empty backend name");
        }
        let addresses: Vec<String> = addresses
            .split(',')
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        if addresses.is_empty() {
            bail!("invalid reuse group {group:?}, no addresses");
        }
        reuse.entry(backend.to_string()).or_default().extend(addresses);
    }
    Ok(reuse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reuse_groups() {
        let reuse = parse_reuse(Some("garden:10.0.0.1,10.0.0.2 orchard:10.0.1.1")).unwrap();
        assert_eq!(
            reuse["garden"],
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
        );
        assert_eq!(reuse["orchard"], vec!["10.0.1.1".to_string()]);
    }

    #[test]
    fn test_parse_reuse_empty() {
        assert!(parse_reuse(None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_reuse_rejects_malformed_groups() {
        assert!(parse_reuse(Some("garden")).is_err());
        assert!(parse_reuse(Some(":10.0.0.1")).is_err());
        assert!(parse_reuse(Some("garden:")).is_err());
    }
}
