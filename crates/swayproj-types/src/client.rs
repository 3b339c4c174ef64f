use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::{Request, Response, METHOD_PING};

/// Issue one request on a fresh connection and return the daemon's response.
pub fn request(socket_path: &Path, method: &str, params: Value) -> Result<Response> {
    let stream = UnixStream::connect(socket_path)
        .with_context(|| format!("failed to connect to socket {}", socket_path.display()))?;
    let mut writer = BufWriter::new(
        stream
            .try_clone()
            .context("failed to clone socket stream")?,
    );
    let mut reader = BufReader::new(stream);

    let req = Request {
        id: 1,
        method: method.to_string(),
        params,
    };

    serde_json::to_writer(&mut writer, &req).context("failed to serialize request")?;
    writer
        .write_all(b"\n")
        .context("failed to write request newline")?;
    writer.flush().context("failed to flush request")?;

    let mut line = String::new();
    reader
        .read_line(&mut line)
        .context("failed to read daemon response")?;
    if line.trim().is_empty() {
        bail!("daemon returned empty response");
    }

    serde_json::from_str::<Response>(&line).context("failed to parse daemon response")
}

pub fn parse_ok_response<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    if let Some(error) = response.error {
        bail!("daemon returned error [{}]: {}", error.code, error.message);
    }
    serde_json::from_value(response.result.unwrap_or(Value::Null))
        .context("failed to parse daemon response body")
}

pub fn wait_for_ping(socket_path: &Path, timeout: Duration) -> Result<Response> {
    let attempts = (timeout.as_millis() / 100).max(1) as usize;
    let mut last_error: Option<anyhow::Error> = None;

    for _ in 0..attempts {
        match request(socket_path, METHOD_PING, Value::Null) {
            Ok(response) => return Ok(response),
            Err(err) => {
                last_error = Some(err);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("timed out waiting for daemon")))
}
