use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use apqp_core::types::{ConflictResolution, Direction, ProjectKey, SyncConflict};
use apqp_sync::{LogPage, LogQuery, ResolutionResult, SyncRequest, SyncResponse};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request. `cmd` selects which optional fields apply:
///
/// | cmd         | fields                                   |
/// |-------------|------------------------------------------|
/// | `status`    | `project` (optional)                     |
/// | `sync`      | `sync`                                   |
/// | `log`       | `log`                                    |
/// | `conflicts` | `project`, `direction` (optional)        |
/// | `resolve`   | `project`, `resolutions`, `timeout_ms`   |
/// | `stop`      | -                                        |
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolutions: Option<Vec<ConflictResolution>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// A failure that still carries a payload (a `Failed` sync response).
    pub fn failed_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            ok: false,
            data: Some(data),
            error: Some(message.into()),
        }
    }
}

/// Send one request and read its response line.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    let stream = UnixStream::connect(&socket).map_err(|err| match err.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        }
        _ => io_err(&socket, err),
    })?;

    let mut frame = serde_json::to_vec(request)?;
    frame.push(b'\n');
    (&stream).write_all(&frame).map_err(|e| io_err(&socket, e))?;

    let mut line = String::new();
    BufReader::new(&stream)
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if line.trim().is_empty() {
        return Err(DaemonError::Protocol(format!(
            "no response to '{}' before the daemon hung up",
            request.cmd
        )));
    }
    Ok(serde_json::from_str(&line)?)
}

/// Daemon overview, or one project's status. A daemon that is still binding
/// its socket gets a few short retries.
pub fn request_status(home: &Path, project: Option<ProjectKey>) -> Result<Value, DaemonError> {
    const ATTEMPTS: u32 = 5;
    let request = DaemonRequest {
        project,
        ..DaemonRequest::new("status")
    };

    let mut attempt = 1;
    loop {
        match send_request(home, &request) {
            Err(DaemonError::DaemonNotRunning { .. }) if attempt < ATTEMPTS => {
                sleep(Duration::from_millis(100));
                attempt += 1;
            }
            other => return other.and_then(into_data),
        }
    }
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    send_request(home, &DaemonRequest::new("stop"))
        .and_then(into_data)
        .map(drop)
}

/// Run a sync through the daemon. A failed sync still yields a
/// [`SyncResponse`] with outcome `Failed`.
pub fn request_sync(home: &Path, sync: SyncRequest) -> Result<SyncResponse, DaemonError> {
    let request = DaemonRequest {
        sync: Some(sync),
        ..DaemonRequest::new("sync")
    };
    let response = send_request(home, &request)?;
    match (response.data, response.error) {
        (Some(data), _) => Ok(serde_json::from_value(data)?),
        (None, error) => Err(DaemonError::Protocol(
            error.unwrap_or_else(|| "sync reply carried no response".to_string()),
        )),
    }
}

pub fn request_log(home: &Path, query: LogQuery) -> Result<LogPage, DaemonError> {
    let request = DaemonRequest {
        log: Some(query),
        ..DaemonRequest::new("log")
    };
    decode(send_request(home, &request)?)
}

pub fn request_conflicts(
    home: &Path,
    project: ProjectKey,
    direction: Option<Direction>,
) -> Result<Vec<SyncConflict>, DaemonError> {
    let request = DaemonRequest {
        project: Some(project),
        direction,
        ..DaemonRequest::new("conflicts")
    };
    decode(send_request(home, &request)?)
}

pub fn request_resolve(
    home: &Path,
    project: ProjectKey,
    resolutions: Vec<ConflictResolution>,
    timeout_ms: u64,
) -> Result<ResolutionResult, DaemonError> {
    let request = DaemonRequest {
        project: Some(project),
        resolutions: Some(resolutions),
        timeout_ms: Some(timeout_ms),
        ..DaemonRequest::new("resolve")
    };
    decode(send_request(home, &request)?)
}

fn decode<T: DeserializeOwned>(response: DaemonResponse) -> Result<T, DaemonError> {
    Ok(serde_json::from_value(into_data(response)?)?)
}

fn into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    match response {
        DaemonResponse { ok: true, data, .. } => Ok(data.unwrap_or(Value::Null)),
        DaemonResponse { error, .. } => Err(DaemonError::Protocol(
            error.unwrap_or_else(|| "daemon reported an unspecified error".to_string()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apqp_core::config::Config;
    use tempfile::TempDir;

    #[test]
    fn unused_fields_are_omitted_on_the_wire() {
        let encoded = serde_json::to_string(&DaemonRequest::new("stop")).expect("encode");
        assert_eq!(encoded, r#"{"cmd":"stop"}"#);
    }

    #[test]
    fn sync_request_travels_in_camel_case() {
        let request = DaemonRequest {
            sync: Some(SyncRequest::new(
                ProjectKey::from("brake"),
                Direction::PfmeaToControlPlan,
                &Config::default(),
            )),
            ..DaemonRequest::new("sync")
        };
        let value = serde_json::to_value(&request).expect("encode");
        assert_eq!(value["sync"]["projectKey"], "brake");
        assert_eq!(value["sync"]["allowDeletions"], false);
        assert_eq!(value["sync"]["timeoutMs"], 30_000);
    }

    #[test]
    fn missing_socket_reports_not_running() {
        let home = TempDir::new().expect("home");
        let err = send_request(home.path(), &DaemonRequest::new("status")).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let err = into_data(DaemonResponse::error("boom")).unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(message) if message == "boom"));
    }
}
