//! Automation bridge backend.
//!
//! The host spreadsheet application is driven by a separate bridge process
//! that speaks newline-delimited JSON on stdin/stdout. One request per
//! line, one response per line, strictly in order:
//!
//! ```text
//! -> {"id":1,"op":"open","path":"data/reactor.xlsx","sheet":"Reactor"}
//! <- {"id":1,"ok":true}
//! -> {"id":2,"op":"write","cell":"B12","value":47.31}
//! <- {"id":2,"ok":true}
//! -> {"id":3,"op":"calc_state"}
//! <- {"id":3,"ok":true,"value":0}
//! -> {"id":4,"op":"read","cell":"B20"}
//! <- {"id":4,"ok":true,"value":"VALID"}
//! -> {"id":5,"op":"read","cell":"ZZ9"}
//! <- {"id":5,"ok":false,"error":"cell out of used range"}
//! -> {"id":6,"op":"close"}
//! <- {"id":6,"ok":true}
//! ```
//!
//! `calc_state` returns the host's calculation state; `0` means idle.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::Workbook;
use crate::config::BridgeConfig;
use crate::types::{CellAddress, CellValue, SweepError};

/// Calculation state reported by the host when nothing is pending.
const CALC_STATE_IDLE: i64 = 0;

/// How long to wait for the bridge process to exit after `close`.
const EXIT_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Op<'a> {
    Open { path: &'a Path, sheet: &'a str },
    Write { cell: &'a str, value: &'a CellValue },
    Read { cell: &'a str },
    CalcState,
    Close,
}

impl Op<'_> {
    fn name(&self) -> &'static str {
        match self {
            Op::Open { .. } => "open",
            Op::Write { .. } => "write",
            Op::Read { .. } => "read",
            Op::CalcState => "calc_state",
            Op::Close => "close",
        }
    }
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    #[serde(flatten)]
    op: Op<'a>,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    ok: bool,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A workbook held open by an external bridge process.
pub struct BridgeWorkbook<R, W> {
    reader: R,
    writer: W,
    next_id: u64,
    request_timeout: Duration,
    child: Option<Child>,
    closed: bool,
}

impl BridgeWorkbook<BufReader<ChildStdout>, ChildStdin> {
    /// Start the bridge process and open `path` / `sheet` in it.
    pub async fn spawn(config: &BridgeConfig, path: &Path, sheet: &str) -> Result<Self> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start bridge process: {}", config.command))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Bridge process has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Bridge process has no stdout"))?;

        info!(
            command = %config.command,
            pid = ?child.id(),
            "Bridge process started"
        );

        let mut workbook = Self::connect(
            BufReader::new(stdout),
            stdin,
            Duration::from_millis(config.request_timeout_ms),
        );
        workbook.child = Some(child);
        workbook.open(path, sheet).await?;
        Ok(workbook)
    }
}

impl<R, W> BridgeWorkbook<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap an already-connected bridge stream pair.
    pub fn connect(reader: R, writer: W, request_timeout: Duration) -> Self {
        Self {
            reader,
            writer,
            next_id: 1,
            request_timeout,
            child: None,
            closed: false,
        }
    }

    /// Ask the bridge to open a workbook and select a sheet.
    pub async fn open(&mut self, path: &Path, sheet: &str) -> Result<()> {
        self.request(Op::Open { path, sheet }).await?;
        info!(path = %path.display(), sheet, "Workbook opened");
        Ok(())
    }

    async fn request(&mut self, op: Op<'_>) -> Result<serde_json::Value> {
        if self.closed {
            return Err(bridge_error(op.name(), "workbook already closed").into());
        }

        let id = self.next_id;
        self.next_id += 1;
        let op_name = op.name();

        let mut line = serde_json::to_string(&Request { id, op })
            .context("Failed to serialise bridge request")?;
        line.push('\n');

        let writer = &mut self.writer;
        let reader = &mut self.reader;
        let exchange = async move {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
            let mut reply = String::new();
            let n = reader.read_line(&mut reply).await?;
            Ok::<_, std::io::Error>((n, reply))
        };

        let limit = self.request_timeout;
        let (n, reply) = tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| {
                bridge_error(op_name, format!("no response within {} ms", limit.as_millis()))
            })?
            .with_context(|| format!("Bridge I/O failed during {op_name}"))?;

        if n == 0 {
            return Err(bridge_error(op_name, "bridge closed its output").into());
        }

        let response: Response = serde_json::from_str(reply.trim_end())
            .with_context(|| format!("Malformed bridge response to {op_name}: {}", reply.trim_end()))?;

        if response.id != id {
            return Err(bridge_error(
                op_name,
                format!("response id {} does not match request id {id}", response.id),
            )
            .into());
        }

        if !response.ok {
            let message = response.error.unwrap_or_else(|| "unspecified error".to_string());
            return Err(bridge_error(op_name, message).into());
        }

        debug!(id, op = op_name, "Bridge request complete");
        Ok(response.value)
    }

    async fn reap_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Bridge process exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for bridge process"),
            Err(_) => {
                warn!("Bridge process did not exit in time, killing it");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill bridge process");
                }
            }
        }
    }
}

fn bridge_error(op: &str, message: impl Into<String>) -> SweepError {
    SweepError::Bridge {
        op: op.to_string(),
        message: message.into(),
    }
}

#[async_trait]
impl<R, W> Workbook for BridgeWorkbook<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn write_cell(&mut self, cell: &CellAddress, value: CellValue) -> Result<()> {
        self.request(Op::Write {
            cell: cell.as_str(),
            value: &value,
        })
        .await?;
        Ok(())
    }

    async fn read_cell(&mut self, cell: &CellAddress) -> Result<CellValue> {
        let raw = self.request(Op::Read { cell: cell.as_str() }).await?;
        serde_json::from_value(raw)
            .with_context(|| format!("Bridge returned a non-scalar value for {cell}"))
    }

    async fn is_idle(&mut self) -> Result<bool> {
        let raw = self.request(Op::CalcState).await?;
        let state = raw
            .as_i64()
            .ok_or_else(|| bridge_error("calc_state", format!("expected an integer, got {raw}")))?;
        Ok(state == CALC_STATE_IDLE)
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        let result = self.request(Op::Close).await.map(|_| ());
        self.closed = true;

        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "Bridge stdin already closed");
        }
        self.reap_child().await;

        if result.is_ok() {
            info!("Workbook closed");
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
