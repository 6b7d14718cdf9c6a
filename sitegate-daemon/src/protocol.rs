use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::notifier::Notification;
use crate::paths::socket_path;

pub const CMD_GET_SITES: &str = "get_sites";
pub const CMD_TOGGLE_SITE: &str = "toggle_site";
pub const CMD_GET_SITE_STATUS: &str = "get_site_status";
pub const CMD_GET_BLOCKED_SITES: &str = "get_blocked_sites";
pub const CMD_CHECK_SITE_BLOCKED: &str = "check_site_blocked";
pub const CMD_FORCE_UNBLOCK_SITE: &str = "force_unblock_site";
pub const CMD_ADD_SITE: &str = "add_site";
pub const CMD_REMOVE_SITE: &str = "remove_site";
pub const CMD_STATUS: &str = "status";
pub const CMD_STOP: &str = "stop";
pub const CMD_WATCH: &str = "watch";

/// JSON newline-delimited request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
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
}

fn connect(home: &Path) -> Result<UnixStream, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })
}

fn write_request(
    home: &Path,
    stream: &mut UnixStream,
    request: &DaemonRequest,
) -> Result<(), DaemonError> {
    let socket = socket_path(home);
    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))
}

fn read_line(
    home: &Path,
    reader: &mut BufReader<UnixStream>,
) -> Result<Option<String>, DaemonError> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(socket_path(home), e))?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end().to_string()))
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let mut stream = connect(home)?;
    write_request(home, &mut stream, request)?;

    let mut reader = BufReader::new(stream);
    let line = read_line(home, &mut reader)?.ok_or_else(|| {
        DaemonError::Protocol("daemon closed connection before responding".to_string())
    })?;

    let response: DaemonResponse = serde_json::from_str(&line)?;
    Ok(response)
}

pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new(CMD_STATUS);

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::new(CMD_STOP))?;
    response_into_data(response).map(|_| ())
}

/// Send `request` and unwrap the `data` payload, turning `ok: false` into an error.
pub fn request_data(home: &Path, request: &DaemonRequest) -> Result<Value, DaemonError> {
    let response = send_request(home, request)?;
    response_into_data(response)
}

/// Subscribe to notifications and hand each one to `on_event` until it returns
/// `false` or the daemon closes the stream.
pub fn watch<F>(home: &Path, host: Option<&str>, mut on_event: F) -> Result<(), DaemonError>
where
    F: FnMut(Notification) -> bool,
{
    let mut request = DaemonRequest::new(CMD_WATCH);
    if let Some(host) = host {
        request = request.with_host(host);
    }

    let mut stream = connect(home)?;
    write_request(home, &mut stream, &request)?;
    let mut reader = BufReader::new(stream);

    let ack = read_line(home, &mut reader)?.ok_or_else(|| {
        DaemonError::Protocol("daemon closed connection before responding".to_string())
    })?;
    response_into_data(serde_json::from_str(&ack)?)?;

    while let Some(line) = read_line(home, &mut reader)? {
        if line.is_empty() {
            continue;
        }
        let notification: Notification = serde_json::from_str(&line)?;
        if !on_event(notification) {
            break;
        }
    }
    Ok(())
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
