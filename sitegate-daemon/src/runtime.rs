use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use sitegate_core::store::STORAGE_FILE;
use sitegate_core::{config, Domain, GateConfig, LogFormat};

use crate::clock::SystemClock;
use crate::error::{io_err, DaemonError, GateError};
use crate::gate::{self, GateHandle, GateRequest, SiteGate};
use crate::notifier::Notifier;
use crate::paths::{sitegate_root, socket_path, storage_path, DEBOUNCE_WINDOW};
use crate::protocol::{
    DaemonRequest, DaemonResponse, CMD_ADD_SITE, CMD_CHECK_SITE_BLOCKED, CMD_FORCE_UNBLOCK_SITE,
    CMD_GET_BLOCKED_SITES, CMD_GET_SITES, CMD_GET_SITE_STATUS, CMD_REMOVE_SITE, CMD_STATUS,
    CMD_STOP, CMD_TOGGLE_SITE, CMD_WATCH,
};
use crate::repository::{FileRepository, SiteRepository};

/// Load `config.yaml`, start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    let config = config::load_at(home)?;
    init_tracing(&config);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Run the daemon runtime: recover timers, then serve until `stop` or ctrl-c.
pub async fn run(home: PathBuf, config: GateConfig) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let started_at_unix = unix_seconds_now();
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let notifier = Notifier::default();
    let repo: Arc<dyn SiteRepository> = Arc::new(FileRepository::new(&home));
    let (mut site_gate, events) =
        SiteGate::new(repo, Arc::new(SystemClock), notifier.clone(), &config);

    let report = site_gate.recover().await?;
    tracing::info!(
        rearmed = report.rearmed.len(),
        finalized = report.finalized.len(),
        grace_period_secs = config.grace_period_secs,
        "site gate recovered",
    );

    let (gate_handle, gate_task) = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        gate::spawn(site_gate, events, async move {
            let _ = shutdown_rx.recv().await;
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let gate_handle = gate_handle.clone();
        let enabled = config.watch_store;
        tokio::spawn(async move {
            if !enabled {
                tracing::debug!("store watcher disabled by config");
                return Ok(());
            }
            let result = store_watcher_task(home, gate_handle, shutdown.subscribe()).await;
            if result.is_err() {
                let _ = shutdown.send(());
            }
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let server = SocketContext {
            home: home.clone(),
            gate: gate_handle.clone(),
            notifier,
            shutdown_tx: shutdown.clone(),
            started_at_unix,
        };
        tokio::spawn(async move {
            let result = socket_server_task(server, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };
    drop(gate_handle);

    let (gate_result, watcher_result, socket_result, signal_result) =
        tokio::join!(gate_task, watcher_handle, socket_handle, signal_handle);

    handle_join("gate", gate_result.map(Ok))?;
    handle_join("store_watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

/// Reconcile timers whenever `storage.json` is rewritten by someone else.
async fn store_watcher_task(
    home: PathBuf,
    gate: GateHandle,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let root = sitegate_root(&home);
    let root = fs::canonicalize(&root).unwrap_or(root);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&root, RecursiveMode::NonRecursive)?;
    tracing::info!(dir = %root.display(), "watching site store");

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                for path in event.paths {
                    if !is_storage_file(&path) {
                        continue;
                    }
                    if !should_process_event(&mut debounce, &path, Instant::now()) {
                        continue;
                    }

                    match gate.reconcile().await {
                        Ok(report) if report.is_empty() => {
                            tracing::debug!("store changed; timers already consistent");
                        }
                        Ok(report) => {
                            tracing::info!(
                                rearmed = report.rearmed.len(),
                                finalized = report.finalized.len(),
                                cancelled = report.cancelled.len(),
                                "store changed; timers reconciled",
                            );
                        }
                        Err(GateError::ChannelClosed(_)) => return Ok(()),
                        Err(err) => {
                            tracing::error!(error = %err, "store reconcile failed");
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

#[derive(Clone)]
struct SocketContext {
    home: PathBuf,
    gate: GateHandle,
    notifier: Notifier,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
}

async fn socket_server_task(
    context: SocketContext,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&context.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, context).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    context: SocketContext,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            CMD_STATUS => match build_status_payload(&context).await {
                Ok(payload) => DaemonResponse::ok(payload),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            CMD_STOP => {
                let _ = context.shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            CMD_WATCH => {
                let host = request.host.clone();
                write_response(&mut writer, &DaemonResponse::ok(json!({ "watching": host.as_deref() })))
                    .await?;
                // The connection belongs to the stream from here on.
                return stream_notifications(&context, host, &mut lines, &mut writer).await;
            }
            _ => match gate_request_for(&request) {
                Ok(gate_request) => match context.gate.request(gate_request).await {
                    Ok(reply) => DaemonResponse::ok(serde_json::to_value(&reply)?),
                    Err(err) => DaemonResponse::error(err.to_string()),
                },
                Err(err) => DaemonResponse::error(err.to_string()),
            },
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == CMD_STOP {
            break;
        }
    }

    Ok(())
}

async fn stream_notifications(
    context: &SocketContext,
    host: Option<String>,
    lines: &mut tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
) -> Result<(), DaemonError> {
    let mut subscription = context.notifier.subscribe(host.clone());
    let mut shutdown_rx = context.shutdown_tx.subscribe();
    tracing::debug!(host = ?host, "observer attached");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            line = lines.next_line() => {
                // Observers never send anything else; EOF or error means detach.
                if !matches!(line, Ok(Some(_))) {
                    break;
                }
            }
            notification = subscription.recv() => {
                let Some(notification) = notification else { break };
                let payload = serde_json::to_string(&notification)?;
                let written = async {
                    writer.write_all(payload.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                }
                .await;
                if let Err(err) = written {
                    tracing::debug!(error = %err, "observer went away");
                    break;
                }
            }
        }
    }

    tracing::debug!(host = ?host, "observer detached");
    Ok(())
}

/// Map a socket request onto a gate operation. Domains are normalized here so
/// `https://www.Example.com/` and `example.com` address the same record.
fn gate_request_for(request: &DaemonRequest) -> Result<GateRequest, DaemonError> {
    let domain = || -> Result<Domain, DaemonError> {
        let raw = request.domain.as_deref().ok_or_else(|| {
            DaemonError::Protocol(format!("command '{}' requires a domain", request.cmd))
        })?;
        Ok(Domain::parse(raw).map_err(GateError::from)?)
    };

    let gate_request = match request.cmd.as_str() {
        CMD_GET_SITES => GateRequest::GetSites,
        CMD_TOGGLE_SITE => {
            let enabled = request.enabled.ok_or_else(|| {
                DaemonError::Protocol("command 'toggle_site' requires 'enabled'".to_string())
            })?;
            GateRequest::ToggleSite {
                domain: domain()?,
                enabled,
            }
        }
        CMD_GET_SITE_STATUS => GateRequest::GetSiteStatus { domain: domain()? },
        CMD_GET_BLOCKED_SITES => GateRequest::GetBlockedSites,
        CMD_CHECK_SITE_BLOCKED => {
            let host = request
                .host
                .clone()
                .or_else(|| request.domain.clone())
                .ok_or_else(|| {
                    DaemonError::Protocol(
                        "command 'check_site_blocked' requires a host".to_string(),
                    )
                })?;
            GateRequest::CheckSiteBlocked { host }
        }
        CMD_FORCE_UNBLOCK_SITE => GateRequest::ForceUnblockSite { domain: domain()? },
        CMD_ADD_SITE => GateRequest::AddSite { domain: domain()? },
        CMD_REMOVE_SITE => GateRequest::RemoveSite { domain: domain()? },
        other => return Err(DaemonError::Protocol(format!("unknown command '{other}'"))),
    };
    Ok(gate_request)
}

async fn build_status_payload(context: &SocketContext) -> Result<Value, DaemonError> {
    let info = context.gate.info().await?;
    let now = unix_seconds_now();
    Ok(json!({
        "running": true,
        "pid": std::process::id(),
        "started_at_unix": context.started_at_unix,
        "uptime_secs": now.saturating_sub(context.started_at_unix),
        "socket": socket_path(&context.home).display().to_string(),
        "storage": storage_path(&context.home).display().to_string(),
        "grace_period_secs": info.grace_period_secs,
        "pending_delays": info.pending_delays,
        "observers": info.observers,
    }))
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn is_storage_file(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == STORAGE_FILE)
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
) -> bool {
    should_process_event_with_threshold(debounce, path, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = sitegate_root(home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    set_dir_permissions(&root)
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing(config: &GateConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    let _ = match config.log_format {
        LogFormat::Pretty => fmt().with_env_filter(filter).with_target(false).try_init(),
        LogFormat::Json => fmt().json().with_env_filter(filter).try_init(),
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
