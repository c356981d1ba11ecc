//! Server acquisition: reuse-or-allocate, dial with retry, project sync.
//!
//! A worker calls [`acquire`] exactly once. The function loops until it
//! hands back a connected client with the project data in place, or until
//! allocation is hopeless, the reuse pool is exhausted, or the run is
//! cancelled. Retries are bounded by wall-clock deadlines and re-log an
//! error only when its message changes, to damp the noise of a machine
//! that is merely slow to come up.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::Runner;
use crate::client::Client;
use crate::project::Backend;
use crate::provider::{Provider, Server, UnknownServer};

/// Well-known path on every machine holding the identity blob a later run
/// needs to reclaim it.
pub(crate) const REUSE_DATA_PATH: &str = "/.spread.yaml";

const ALLOCATE_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_TICK: Duration = Duration::from_secs(5);
const RELOG_TICK: Duration = Duration::from_secs(8);

/// Why a retry loop gave up.
enum RetryAbort {
    /// The provider declared the error unrecoverable.
    Fatal,
    /// The wall-clock deadline passed.
    Expired,
    /// The run was cancelled.
    Cancelled,
}

/// Obtains a connected client for one worker, or `None` when the worker
/// should exit without running anything.
pub(crate) async fn acquire(
    runner: &Arc<Runner>,
    backend: &Arc<Backend>,
    system: &str,
) -> Option<Box<dyn Client>> {
    let provider = runner.providers.get(&backend.name)?;

    while !runner.cancel.is_cancelled() {
        // Claim the first configured address nobody holds yet.
        let mut reused = false;
        let mut claimed: Option<Arc<dyn Server>> = None;
        {
            let mut state = runner.state();
            if let Some(addresses) = runner.options.reuse.get(&backend.name) {
                for address in addresses {
                    if state.reused.contains(address) {
                        continue;
                    }
                    state.reused.insert(address.clone());
                    info!("Reusing {}:{} at {}...", backend.name, system, address);
                    claimed = Some(Arc::new(UnknownServer::new(
                        backend.name.clone(),
                        address.clone(),
                    )));
                    reused = true;
                    break;
                }
            }
        }

        let server = match claimed {
            Some(server) => server,
            None => {
                if !runner.options.reuse.is_empty() {
                    info!(
                        "Reuse requested but none left for {}:{}, aborting.",
                        backend.name, system
                    );
                    return None;
                }
                match allocate_with_retry(runner, provider, backend, system).await {
                    Ok(server) => server,
                    Err(RetryAbort::Fatal | RetryAbort::Cancelled) => return None,
                    Err(RetryAbort::Expired) => continue,
                }
            }
        };

        info!("Connecting to {}...", server.label());
        let mut client = match dial_with_retry(runner, server.clone()).await {
            Ok(client) => client,
            Err(_) => {
                if reused {
                    warn!("Cannot connect to {}", server.label());
                } else {
                    warn!("Discarding {}, cannot connect", server.label());
                    if let Err(e) = server.discard().await {
                        debug!("Cannot discard {}: {}", server.label(), e);
                    }
                }
                continue;
            }
        };

        if !reused {
            if let Err(e) = client.write_file(REUSE_DATA_PATH, &server.reuse_data()).await {
                warn!(
                    "Discarding {}, cannot write reuse data: {}",
                    server.label(),
                    e
                );
                if let Err(e) = server.discard().await {
                    debug!("Cannot discard {}: {}", server.label(), e);
                }
                continue;
            }
        }

        // A reused address is still anonymous; recover its identity from
        // the blob the earlier run left behind and re-seat the client.
        let server = if reused {
            let data = match client.read_file(REUSE_DATA_PATH).await {
                Ok(data) => data,
                Err(e) => {
                    warn!("Cannot read reuse data for {}: {}", server.label(), e);
                    continue;
                }
            };
            match provider.reuse(&data, &runner.options.password).await {
                Ok(typed) => {
                    client.set_server(typed.clone());
                    typed
                }
                Err(e) => {
                    warn!("Cannot reuse {} on {}: {}", server.label(), backend.name, e);
                    continue;
                }
            }
        } else {
            server
        };

        info!("Connected to {}.", server.label());

        let mut send = true;
        if reused && runner.options.resend {
            info!(
                "Removing project data from {} at {}...",
                server.label(),
                runner.project.remote_path
            );
            if let Err(e) = client.remove_all(&runner.project.remote_path).await {
                warn!("Cannot remove project data from {}: {}", server.label(), e);
            }
        } else if reused {
            match client.missing_or_empty(&runner.project.remote_path).await {
                Ok(empty) => send = empty,
                Err(e) => {
                    warn!("Cannot send project data to {}: {}", server.label(), e);
                    continue;
                }
            }
        }

        if send {
            info!("Sending project data to {}...", server.label());
            if let Err(e) = client
                .send(
                    &runner.project.path,
                    &runner.project.remote_path,
                    &runner.project.include,
                    &runner.project.exclude,
                )
                .await
            {
                if reused {
                    warn!("Cannot send project data to {}: {}", server.label(), e);
                } else {
                    warn!("Discarding {}, cannot send project data: {}", server.label(), e);
                    if let Err(e) = server.discard().await {
                        debug!("Cannot discard {}: {}", server.label(), e);
                    }
                }
                continue;
            }
        } else {
            info!("Reusing project data on {}...", server.label());
        }

        runner.state().servers.push(server.clone());
        return Some(client);
    }

    None
}

/// Allocates a machine, retrying every 5 s for up to 30 s. An error is
/// logged when it first appears and again every 8 s while it persists
/// unchanged; a fatal error aborts immediately.
async fn allocate_with_retry(
    runner: &Arc<Runner>,
    provider: &Arc<dyn Provider>,
    backend: &Arc<Backend>,
    system: &str,
) -> Result<Arc<dyn Server>, RetryAbort> {
    info!("Allocating {}:{}...", backend.name, system);

    let deadline = tokio::time::sleep(ALLOCATE_TIMEOUT);
    tokio::pin!(deadline);
    let mut retry = tokio::time::interval(RETRY_TICK);
    retry.tick().await;
    let mut relog = tokio::time::interval(RELOG_TICK);
    relog.tick().await;

    let mut last_error: Option<String> = None;
    loop {
        match provider.allocate(system, &runner.options.password).await {
            Ok(server) => return Ok(server),
            Err(e) => {
                let message = e.to_string();
                if last_error.as_deref() != Some(message.as_str()) {
                    warn!("Cannot allocate {}:{}: {}", backend.name, system, message);
                    if e.is_fatal() {
                        return Err(RetryAbort::Fatal);
                    }
                }
                last_error = Some(message);
            }
        }

        tokio::select! {
            _ = retry.tick() => {}
            _ = relog.tick() => {
                if let Some(message) = &last_error {
                    warn!("Cannot allocate {}:{}: {}", backend.name, system, message);
                }
            }
            _ = &mut deadline => return Err(RetryAbort::Expired),
            _ = runner.cancel.cancelled() => return Err(RetryAbort::Cancelled),
        }
    }
}

/// Dials a server, retrying every 5 s for up to 60 s with the same
/// relog-on-change policy as allocation.
async fn dial_with_retry(
    runner: &Arc<Runner>,
    server: Arc<dyn Server>,
) -> Result<Box<dyn Client>, RetryAbort> {
    let deadline = tokio::time::sleep(DIAL_TIMEOUT);
    tokio::pin!(deadline);
    let mut retry = tokio::time::interval(RETRY_TICK);
    retry.tick().await;
    let mut relog = tokio::time::interval(RELOG_TICK);
    relog.tick().await;

    let mut last_error: Option<String> = None;
    loop {
        match runner
            .dialer
            .dial(server.clone(), &runner.options.password)
            .await
        {
            Ok(client) => return Ok(client),
            Err(e) => {
                let message = e.to_string();
                if last_error.as_deref() != Some(message.as_str()) {
                    debug!("Cannot connect to {}: {}", server.label(), message);
                }
                last_error = Some(message);
            }
        }

        tokio::select! {
            _ = retry.tick() => {}
            _ = relog.tick() => {
                if let Some(message) = &last_error {
                    debug!("Cannot connect to {}: {}", server.label(), message);
                }
            }
            _ = &mut deadline => return Err(RetryAbort::Expired),
            _ = runner.cancel.cancelled() => return Err(RetryAbort::Cancelled),
        }
    }
}
