//! The MCP server loop.
//!
//! ## Concurrency
//!
//! ```text
//! reader loop ──▶ handle frame ──┬─▶ immediate reply ─────────────┐
//!                                └─▶ tools/call task (semaphore) ─┤
//!                                                                 ▼
//!                                              mpsc ──▶ single writer task
//! ```
//!
//! The reader never waits on a tool call. Each `tools/call` runs on its own
//! task and holds a semaphore permit while it works, so at most
//! `request_concurrency` calls touch the pipeline at once. Replies are
//! written in completion order by one writer, so frames never interleave.
//!
//! Every in-flight call owns a child of the server's shutdown token.
//! `notifications/cancelled` cancels one call; end of input cancels all of
//! them, waits for their (cancelled) replies and then drains the writer.

use super::dispatcher::{into_tool_result, tool_definitions, validate, Dispatcher};
use super::protocol::{
    CancelledParams, IncomingMessage, InitializeResult, JsonRpcError, JsonRpcNotification,
    JsonRpcResponse, MessageKind, Outgoing, RequestId, ServerInfo, ToolCallParams,
};
use super::transport::{LineReader, LineWriter};
use crate::error::{CaptionError, DocQaError, Stage};
use crate::orchestrator::RunContext;
use crate::progress::{describe_stage, ProgressObserver};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const SERVER_NAME: &str = "gemini-search-mcp";

type InFlight = Arc<Mutex<HashMap<RequestId, CancellationToken>>>;

fn lock_in_flight(map: &InFlight) -> MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
    limiter: Arc<Semaphore>,
    request_timeout: Duration,
    in_flight: InFlight,
    shutdown: CancellationToken,
}

impl McpServer {
    pub fn new(dispatcher: Arc<Dispatcher>, request_concurrency: usize) -> Self {
        let request_timeout = dispatcher.request_timeout();
        Self {
            dispatcher,
            limiter: Arc::new(Semaphore::new(request_concurrency.max(1))),
            request_timeout,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the reader and every in-flight call.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve over the process's stdin and stdout.
    pub async fn run_stdio(self) -> io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve until end of input or shutdown.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let writer_task = tokio::spawn(async move {
            let mut writer = LineWriter::new(writer);
            while let Some(message) = rx.recv().await {
                if let Err(e) = writer.write_frame(&message).await {
                    error!("Failed to write to the client: {}", e);
                    return Err(e);
                }
            }
            Ok(())
        });

        let mut reader = LineReader::new(reader);
        let mut tasks = JoinSet::new();
        info!("{} {} ready on stdio", SERVER_NAME, env!("CARGO_PKG_VERSION"));

        let read_result = loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                frame = reader.next_frame() => frame,
            };
            match frame {
                Ok(Some(frame)) => self.handle_frame(&frame, &tx, &mut tasks),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!("Tool task ended abnormally: {}", e);
                }
            }
        };

        // ── Shutdown: cancel in-flight calls, wait for their replies ─────
        let pending = {
            let in_flight = lock_in_flight(&self.in_flight);
            for token in in_flight.values() {
                token.cancel();
            }
            in_flight.len()
        };
        if pending > 0 {
            info!("Input closed; cancelling {} in-flight call(s)", pending);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Tool task ended abnormally: {}", e);
            }
        }
        drop(tx);

        let write_result = writer_task
            .await
            .map_err(|e| io::Error::other(format!("writer task failed: {e}")))?;
        read_result.and(write_result)
    }

    fn handle_frame(
        &self,
        frame: &str,
        tx: &mpsc::UnboundedSender<Outgoing>,
        tasks: &mut JoinSet<()>,
    ) {
        let message: IncomingMessage = match serde_json::from_str(frame) {
            Ok(m) => m,
            Err(e) => {
                warn!("Unparsable frame: {}", e);
                send(tx, JsonRpcResponse::failure(None, JsonRpcError::parse_error(e)));
                return;
            }
        };

        match message.classify() {
            MessageKind::Request { id, method, params } => {
                debug!("Request {} {}", id, method);
                match method.as_str() {
                    "initialize" => {
                        let result = InitializeResult::negotiate(
                            params.as_ref(),
                            ServerInfo {
                                name: SERVER_NAME.into(),
                                version: env!("CARGO_PKG_VERSION").into(),
                            },
                        );
                        reply(tx, id, json!(result));
                    }
                    "ping" => reply(tx, id, json!({})),
                    "tools/list" => reply(tx, id, json!({ "tools": tool_definitions() })),
                    "tools/call" => self.spawn_tool_call(id, params, tx, tasks),
                    other => send(
                        tx,
                        JsonRpcResponse::failure(Some(id), JsonRpcError::method_not_found(other)),
                    ),
                }
            }
            MessageKind::Notification { method, params } => match method.as_str() {
                "notifications/initialized" => debug!("Client initialized"),
                "notifications/cancelled" => self.cancel_request(params),
                other => debug!("Ignoring notification {}", other),
            },
            MessageKind::Response => debug!("Ignoring client response"),
            MessageKind::Invalid { id, reason } => {
                send(tx, JsonRpcResponse::failure(id, JsonRpcError::invalid_request(reason)));
            }
        }
    }

    fn cancel_request(&self, params: Option<Value>) {
        let parsed = params.and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
        let Some(cancel) = parsed else {
            warn!("notifications/cancelled without a usable requestId");
            return;
        };
        match lock_in_flight(&self.in_flight).get(&cancel.request_id) {
            Some(token) => {
                info!(
                    "Cancelling request {} ({})",
                    cancel.request_id,
                    cancel.reason.as_deref().unwrap_or("no reason given")
                );
                token.cancel();
            }
            None => debug!("Cancel for unknown or finished request {}", cancel.request_id),
        }
    }

    fn spawn_tool_call(
        &self,
        id: RequestId,
        params: Option<Value>,
        tx: &mpsc::UnboundedSender<Outgoing>,
        tasks: &mut JoinSet<()>,
    ) {
        // ── Validate before anything is scheduled ───────────────────────
        let params: ToolCallParams =
            match serde_json::from_value(params.unwrap_or(Value::Null)) {
                Ok(p) => p,
                Err(e) => {
                    send(
                        tx,
                        JsonRpcResponse::failure(
                            Some(id),
                            JsonRpcError::validation(format!("invalid tools/call params: {e}")),
                        ),
                    );
                    return;
                }
            };
        let call = match validate(&params) {
            Ok(call) => call,
            Err(e) => {
                send(
                    tx,
                    JsonRpcResponse::failure(Some(id), JsonRpcError::validation(e.to_string())),
                );
                return;
            }
        };

        let token = self.shutdown.child_token();
        {
            let mut in_flight = lock_in_flight(&self.in_flight);
            if in_flight.contains_key(&id) {
                let message = format!("request id {id} is already in flight");
                drop(in_flight);
                warn!("{}", message);
                send(
                    tx,
                    JsonRpcResponse::failure(Some(id), JsonRpcError::validation(message)),
                );
                return;
            }
            in_flight.insert(id.clone(), token.clone());
        }

        let observer = Arc::new(NotifyingObserver::new(
            id.clone(),
            params.progress_token(),
            tx.clone(),
        ));
        let dispatcher = self.dispatcher.clone();
        let limiter = self.limiter.clone();
        let in_flight = self.in_flight.clone();
        let budget = self.request_timeout;
        let tx = tx.clone();

        tasks.spawn(async move {
            let tool = call.tool().as_str();
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = limiter.acquire_owned() => permit.ok(),
            };
            let outcome = match permit {
                Some(_permit) => {
                    let ctx = RunContext::new(budget)
                        .with_cancel(token)
                        .with_observer(observer);
                    dispatcher.execute(call, &ctx).await
                }
                None => Err(DocQaError::Cancelled),
            };
            match &outcome {
                Ok(_) => info!("Request {} ({}) completed", id, tool),
                Err(e) => warn!("Request {} ({}) failed: [{}] {}", id, tool, e.code(), e),
            }
            lock_in_flight(&in_flight).remove(&id);
            reply(&tx, id, json!(into_tool_result(outcome)));
        });
    }
}

fn send(tx: &mpsc::UnboundedSender<Outgoing>, response: JsonRpcResponse) {
    if tx.send(Outgoing::Response(response)).is_err() {
        warn!("Writer closed; dropping response");
    }
}

fn reply(tx: &mpsc::UnboundedSender<Outgoing>, id: RequestId, result: Value) {
    send(tx, JsonRpcResponse::success(id, result));
}

// ── Progress forwarding ──────────────────────────────────────────────────

/// Forwards pipeline events to the client as `notifications/message`, and
/// as `notifications/progress` when the call carried a progress token.
struct NotifyingObserver {
    request_id: RequestId,
    progress_token: Option<Value>,
    tx: mpsc::UnboundedSender<Outgoing>,
    steps: AtomicU64,
}

impl NotifyingObserver {
    fn new(
        request_id: RequestId,
        progress_token: Option<Value>,
        tx: mpsc::UnboundedSender<Outgoing>,
    ) -> Self {
        Self {
            request_id,
            progress_token,
            tx,
            steps: AtomicU64::new(0),
        }
    }

    fn log(&self, level: &str, message: String) {
        let params = json!({
            "level": level,
            "logger": SERVER_NAME,
            "data": { "requestId": self.request_id, "message": message },
        });
        let _ = self.tx.send(Outgoing::Notification(JsonRpcNotification::new(
            "notifications/message",
            params,
        )));
    }

    fn progress(&self, message: &str) {
        let Some(token) = &self.progress_token else {
            return;
        };
        let step = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        let params = json!({
            "progressToken": token,
            "progress": step,
            "message": message,
        });
        let _ = self.tx.send(Outgoing::Notification(JsonRpcNotification::new(
            "notifications/progress",
            params,
        )));
    }
}

impl ProgressObserver for NotifyingObserver {
    fn on_stage_start(&self, stage: Stage) {
        let message = describe_stage(stage);
        self.log("info", message.to_string());
        self.progress(message);
    }

    fn on_stage_complete(&self, stage: Stage, cached: bool) {
        if cached {
            self.log("debug", format!("{stage}: reused cached result"));
        }
    }

    fn on_images_found(&self, total: usize, unique: usize) {
        self.log(
            "info",
            format!("Found {total} embedded image(s), {unique} distinct"),
        );
    }

    fn on_caption_complete(&self, index: usize, unique_total: usize, cached: bool) {
        let origin = if cached { " (cached)" } else { "" };
        self.log(
            "debug",
            format!("Captioned image {}{} of {}", index + 1, origin, unique_total),
        );
    }

    fn on_caption_error(&self, error: &CaptionError) {
        self.log("warning", format!("[{}] {}", CaptionError::CODE, error));
    }
}
