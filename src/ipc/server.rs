//! Local socket server behind `storyloop-ctl`.
//!
//! Each connection carries newline-delimited JSON: one [`IpcRequest`] per
//! line in, one [`IpcResponse`] per line out.
//!
//! ```json
//! {"command": "skip"}
//! {"ok": true, "data": {"queued": "skip"}}
//! ```
//!
//! `status` is answered from the scheduler's watch channel. Every other
//! verb becomes a [`Control`] queued for the scheduler, which drains the
//! queue only between iterations.

use std::sync::Arc;

use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
use interprocess::local_socket::{GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::engine::controls::Control;
use crate::engine::EngineStatus;
use crate::observer::QueueSnapshot;
use crate::{AppError, Result};

/// Channels the server reads from and writes to.
#[derive(Debug, Clone)]
pub struct IpcContext {
    /// Queue drained by the scheduler between iterations.
    pub controls: mpsc::Sender<Control>,
    /// Latest scheduler status.
    pub status: watch::Receiver<EngineStatus>,
    /// Latest queue snapshot when the observer is running.
    pub snapshot: Option<watch::Receiver<QueueSnapshot>>,
}

/// One command line sent by `storyloop-ctl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    /// `status`, `pause`, `resume`, `skip`, or `quit`.
    pub command: String,
}

/// Reply to one [`IpcRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command was accepted.
    pub ok: bool,
    /// Payload of an accepted command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Reason a command was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn accepted(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(reason.into()),
        }
    }

    fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"unserializable response"}"#.to_owned());
        line.push('\n');
        line
    }
}

fn control_for(verb: &str) -> Option<Control> {
    match verb {
        "pause" => Some(Control::Pause),
        "resume" => Some(Control::Resume),
        "skip" => Some(Control::Skip),
        "quit" => Some(Control::Quit),
        _ => None,
    }
}

/// Bind the socket `name` and serve connections until `cancel` fires.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the name is invalid or the socket cannot be
/// bound (for instance because another engine already owns it).
pub fn spawn_ipc_server(
    name: &str,
    ctx: IpcContext,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let listener = bind(name)?;
    info!(ipc_name = name, "control socket listening");

    let ctx = Arc::new(ctx);
    let span = info_span!("ipc_server", ipc_name = name);
    Ok(tokio::spawn(accept_loop(listener, ctx, cancel).instrument(span)))
}

fn bind(name: &str) -> Result<Listener> {
    let ns_name = name
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("bad socket name '{name}': {err}")))?;
    ListenerOptions::new()
        .name(ns_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("cannot bind control socket '{name}': {err}")))
}

async fn accept_loop(listener: Listener, ctx: Arc<IpcContext>, cancel: CancellationToken) {
    let mut next_conn: u64 = 0;
    loop {
        let stream = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%err, "control socket accept failed");
                    continue;
                }
            },
        };
        next_conn += 1;
        let span = info_span!("ipc_conn", conn = next_conn);
        tokio::spawn(serve_connection(stream, Arc::clone(&ctx)).instrument(span));
    }
    info!("control socket closed");
}

async fn serve_connection(stream: Stream, ctx: Arc<IpcContext>) {
    let (reader, mut writer) = stream.split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!(%err, "control connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => dispatch_command(&request, &ctx).await,
            Err(err) => IpcResponse::rejected(format!("malformed request: {err}")),
        };
        if let Err(err) = writer.write_all(response.to_line().as_bytes()).await {
            debug!(%err, "control connection write failed");
            break;
        }
    }
}

/// Answer `status` or queue the control named by `request`.
pub async fn dispatch_command(request: &IpcRequest, ctx: &IpcContext) -> IpcResponse {
    let verb = request.command.trim();
    if verb == "status" {
        return status_response(ctx);
    }

    let Some(control) = control_for(verb) else {
        return IpcResponse::rejected(format!("unknown command: {verb}"));
    };

    if ctx.controls.send(control).await.is_err() {
        return IpcResponse::rejected("engine is no longer accepting controls");
    }
    info!(?control, "control queued");
    IpcResponse::accepted(json!({ "queued": control }))
}

fn status_response(ctx: &IpcContext) -> IpcResponse {
    let status = ctx.status.borrow().clone();
    let queue = ctx.snapshot.as_ref().map(|rx| rx.borrow().clone());
    IpcResponse::accepted(json!({ "status": status, "queue": queue }))
}
