//! Task execution: shell commands via a subprocess, api calls via HTTP.
//! Output is streamed as raw frames; the final frame always carries the
//! exit code in its last 5 bytes.

use std::collections::HashMap;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::catalog::TaskKind;
use crate::error::{CronmeshError, Result};

/// Exit code reported when the real one could not be determined.
pub const DEFAULT_EXIT_CODE: i32 = -1;

/// Width of the exit-code suffix on the final frame.
const EXIT_CODE_WIDTH: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellPayload {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPayload {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Render the trailing exit-code frame: the decimal code right-justified
/// to 5 bytes with spaces. Controller and worker both rely on this exact
/// layout.
pub fn exit_code_frame(code: i32) -> Vec<u8> {
    format!("{code:>5}").into_bytes()
}

/// Parse the exit code out of a final frame's last 5 bytes.
pub fn parse_exit_code(frame: &[u8]) -> Option<i32> {
    if frame.len() < EXIT_CODE_WIDTH {
        return None;
    }
    std::str::from_utf8(&frame[frame.len() - EXIT_CODE_WIDTH..])
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Run one task payload, streaming output frames into `frames` and
/// always ending with the exit-code frame.
pub async fn execute(kind: TaskKind, payload: Vec<u8>, frames: mpsc::Sender<Vec<u8>>) {
    let outcome = match kind {
        TaskKind::Shell => run_shell(&payload, &frames).await,
        TaskKind::Api => run_api(&payload, &frames).await,
    };
    let code = match outcome {
        Ok(code) => code,
        Err(e) => {
            let _ = frames.send(format!("{e}\n").into_bytes()).await;
            DEFAULT_EXIT_CODE
        }
    };
    let _ = frames.send(exit_code_frame(code)).await;
}

async fn run_shell(payload: &[u8], frames: &mpsc::Sender<Vec<u8>>) -> Result<i32> {
    let shell: ShellPayload = serde_json::from_slice(payload)?;
    tracing::info!(command = %shell.command, "executing shell task");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&shell.command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CronmeshError::Internal(format!("spawn failed: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CronmeshError::Internal("child stdout missing".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CronmeshError::Internal("child stderr missing".to_string()))?;
    let out_pump = tokio::spawn(pump_lines(stdout, frames.clone()));
    let err_pump = tokio::spawn(pump_lines(stderr, frames.clone()));

    // a dropped receiver means the controller cancelled the stream
    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| CronmeshError::Internal(format!("wait failed: {e}")))?
        }
        _ = frames.closed() => {
            let _ = child.kill().await;
            return Err(CronmeshError::Canceled);
        }
    };
    let _ = out_pump.await;
    let _ = err_pump.await;

    // signal-killed processes carry no code
    Ok(status.code().unwrap_or(DEFAULT_EXIT_CODE))
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, frames: mpsc::Sender<Vec<u8>>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut frame = line.into_bytes();
        frame.push(b'\n');
        if frames.send(frame).await.is_err() {
            // receiver gone: the stream was cancelled
            return;
        }
    }
}

async fn run_api(payload: &[u8], frames: &mpsc::Sender<Vec<u8>>) -> Result<i32> {
    let api: ApiPayload = serde_json::from_slice(payload)?;
    tracing::info!(url = %api.url, method = %api.method, "executing api task");

    let method = reqwest::Method::from_bytes(api.method.as_bytes())
        .map_err(|e| CronmeshError::Internal(format!("bad http method {}: {e}", api.method)))?;
    let mut request = reqwest::Client::new().request(method, &api.url);
    for (key, value) in &api.headers {
        request = request.header(key.as_str(), value.as_str());
    }
    if !api.body.is_empty() {
        request = request.body(api.body.clone());
    }

    let response = request
        .send()
        .await
        .map_err(|e| CronmeshError::Internal(format!("api request failed: {e}")))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| CronmeshError::Internal(format!("api response read failed: {e}")))?;
    if !body.is_empty() {
        let _ = frames.send(body.to_vec()).await;
    }

    Ok(if status.is_success() {
        0
    } else {
        i32::from(status.as_u16())
    })
}
