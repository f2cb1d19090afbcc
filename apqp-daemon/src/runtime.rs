use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use apqp_core::config::{self, Config};
use apqp_core::paths::{list_project_keys, projects_root};
use apqp_core::types::ProjectKey;
use apqp_sync::{with_backoff, SqliteStore, SyncOrchestrator, SyncResponse};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;
use crate::protocol::{DaemonRequest, DaemonResponse};

/// State shared by every connection.
struct Daemon {
    home: PathBuf,
    config: Config,
    orchestrator: SyncOrchestrator<SqliteStore>,
    started_at_unix: u64,
}

/// The bound socket file; removed again when the daemon exits.
#[derive(Debug)]
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

/// Build a multi-threaded runtime and run the daemon on it until it stops.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("apqp-daemon")
        .build()
        .map_err(|e| io_err("tokio runtime", e))?
        .block_on(run(home.to_path_buf()))
}

/// Serve `<home>/.apqp/daemon.sock` until a `stop` request or ctrl-c.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let projects = projects_root(&home);
    fs::create_dir_all(&projects).map_err(|e| io_err(&projects, e))?;
    let config = config::load_at(&home)?;

    let (listener, socket) = bind_socket(&socket_path(&home))?;
    let daemon = Arc::new(Daemon {
        orchestrator: SyncOrchestrator::open_at(&home),
        config,
        started_at_unix: unix_seconds_now(),
        home,
    });
    let (stop_tx, mut stop_rx) = broadcast::channel::<()>(4);
    tracing::info!(socket = %socket.0.display(), "daemon listening");

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::info!("stop requested");
                break;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| io_err("ctrl-c handler", e))?;
                tracing::info!("received ctrl-c");
                break;
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket.0, e))?;
                let daemon = Arc::clone(&daemon);
                let stop_tx = stop_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, daemon, stop_tx).await {
                        tracing::warn!(error = %err, "connection closed with error");
                    }
                });
            }
        }
    }

    drop(socket);
    tracing::info!("daemon stopped");
    Ok(())
}

/// Bind the socket, replacing a stale file but refusing a live daemon.
fn bind_socket(path: &Path) -> Result<(UnixListener, SocketFile), DaemonError> {
    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(DaemonError::Protocol(format!(
                "another daemon is already listening on {}",
                path.display()
            )));
        }
        tracing::warn!(socket = %path.display(), "replacing stale daemon socket");
        match fs::remove_file(path) {
            Err(err) if err.kind() != ErrorKind::NotFound => return Err(io_err(path, err)),
            _ => {}
        }
    }

    let listener = UnixListener::bind(path).map_err(|e| io_err(path, e))?;
    let socket = SocketFile(path.to_path_buf());
    restrict_to_owner(path)?;
    Ok((listener, socket))
}

/// One request per line in, one response per line out, in order.
async fn serve_connection(
    stream: UnixStream,
    daemon: Arc<Daemon>,
    stop_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket", e))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let (response, stop) = match serde_json::from_str::<DaemonRequest>(&line) {
            Err(err) => (DaemonResponse::error(format!("malformed request: {err}")), false),
            Ok(request) if request.cmd == "stop" => {
                (DaemonResponse::ok(json!({ "stopping": true })), true)
            }
            Ok(request) => {
                tracing::debug!(cmd = %request.cmd, project = ?request.project, "request");
                (dispatch(&daemon, request).await, false)
            }
        };

        let mut frame = serde_json::to_vec(&response)?;
        frame.push(b'\n');
        writer
            .write_all(&frame)
            .await
            .map_err(|e| io_err("daemon socket", e))?;
        if stop {
            let _ = stop_tx.send(());
            break;
        }
    }
    Ok(())
}

async fn dispatch(daemon: &Daemon, request: DaemonRequest) -> DaemonResponse {
    let orchestrator = &daemon.orchestrator;
    match request.cmd.as_str() {
        "status" => match request.project {
            Some(project) => reply(orchestrator.status(&project).await),
            None => reply(overview(daemon).await),
        },
        "sync" => {
            let Some(sync) = request.sync else {
                return DaemonResponse::error("sync needs a 'sync' body");
            };
            let outcome = with_backoff(
                daemon.config.provision_retries,
                daemon.config.retry_backoff(),
                || orchestrator.sync(&sync),
            )
            .await;
            match outcome {
                Ok(response) => reply(Ok::<_, DaemonError>(response)),
                Err(err) => match serde_json::to_value(SyncResponse::from_error(&err)) {
                    Ok(failed) => DaemonResponse::failed_with(err.to_string(), failed),
                    Err(encode) => DaemonResponse::error(encode.to_string()),
                },
            }
        }
        "log" => match request.log {
            Some(query) => reply(orchestrator.query_log(query).await),
            None => DaemonResponse::error("log needs a 'log' query"),
        },
        "conflicts" => match request.project {
            Some(project) => reply(orchestrator.pending_conflicts(&project, request.direction).await),
            None => DaemonResponse::error("conflicts needs 'project'"),
        },
        "resolve" => {
            let (Some(project), Some(resolutions)) = (request.project, request.resolutions) else {
                return DaemonResponse::error("resolve needs 'project' and 'resolutions'");
            };
            let timeout = request
                .timeout_ms
                .map_or_else(|| daemon.config.timeout(), Duration::from_millis);
            reply(orchestrator.submit_resolutions(&project, resolutions, timeout).await)
        }
        other => DaemonResponse::error(format!("unsupported command '{other}'")),
    }
}

fn reply<T: Serialize, E: std::fmt::Display>(result: Result<T, E>) -> DaemonResponse {
    let encoded = result
        .map_err(|err| err.to_string())
        .and_then(|value| serde_json::to_value(value).map_err(|err| err.to_string()));
    match encoded {
        Ok(data) => DaemonResponse::ok(data),
        Err(message) => DaemonResponse::error(message),
    }
}

/// Daemon facts plus the status of every provisioned project.
async fn overview(daemon: &Daemon) -> Result<Value, DaemonError> {
    let home = daemon.home.clone();
    let keys: Vec<ProjectKey> = tokio::task::spawn_blocking(move || list_project_keys(&home))
        .await
        .map_err(|err| DaemonError::Protocol(format!("project listing task failed: {err}")))?
        .map_err(|e| io_err(projects_root(&daemon.home), e))?;

    let mut projects = Vec::with_capacity(keys.len());
    for key in &keys {
        projects.push(serde_json::to_value(daemon.orchestrator.status(key).await?)?);
    }

    Ok(json!({
        "running": true,
        "started_at_unix": daemon.started_at_unix,
        "socket": socket_path(&daemon.home).display().to_string(),
        "projects_root": projects_root(&daemon.home).display().to_string(),
        "projects": projects,
    }))
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Install the global subscriber: `RUST_LOG` filter (default `info`), JSON
/// lines when `APQP_LOG_FORMAT=json`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = match std::env::var("APQP_LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().try_init(),
        _ => builder.try_init(),
    };
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
