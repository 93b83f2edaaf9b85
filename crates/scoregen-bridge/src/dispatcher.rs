//! Request dispatcher: one stdin line in, one awaited outcome out.
//!
//! The worker protocol carries no request ids, so the dispatcher serializes
//! requests: a request holds the dispatch slot from before its line is
//! written until its outcome is decided. Later callers queue on the slot in
//! arrival order.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tracing::{debug, info, warn};

use scoregen_core::protocol::{RequestLine, is_valid_command_name};

use crate::error::BridgeError;
use crate::matcher::{Matcher, Verdict};
use crate::worker::WorkerHandle;

/// A command invocation before validation.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: String,
    pub payload: Option<Value>,
    pub matcher: Matcher,
    pub timeout: Duration,
}

/// A validated request with its wire line already encoded.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    command: String,
    line: String,
    matcher: Matcher,
    timeout: Duration,
}

/// Successful outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub command: String,
    /// Id of the worker instance that served the request.
    pub worker_id: String,
    /// Everything the worker wrote to stdout for this request.
    pub output: String,
    pub elapsed: Duration,
}

impl Request {
    pub fn new(
        command: impl Into<String>,
        payload: Option<Value>,
        matcher: Matcher,
        timeout: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            payload,
            matcher,
            timeout,
        }
    }

    /// Validate and encode. Performs no I/O.
    pub fn prepare(self) -> Result<PreparedRequest, BridgeError> {
        let payload = match self.payload {
            None | Some(Value::Null) => {
                return Err(BridgeError::InvalidPayload {
                    command: self.command,
                });
            }
            Some(payload) => payload,
        };
        if !is_valid_command_name(&self.command) {
            return Err(BridgeError::InvalidCommand {
                command: self.command,
                reason: "command must be a non-empty token without whitespace".into(),
            });
        }
        if let Some(reason) = self.matcher.problem() {
            return Err(BridgeError::InvalidCommand {
                command: self.command,
                reason: reason.into(),
            });
        }
        if self.timeout.is_zero() {
            return Err(BridgeError::InvalidCommand {
                command: self.command,
                reason: "timeout must be positive".into(),
            });
        }

        let line = RequestLine {
            command: self.command.clone(),
            payload,
        }
        .encode()
        .map_err(|e| BridgeError::InvalidCommand {
            command: self.command.clone(),
            reason: e.to_string(),
        })?;

        Ok(PreparedRequest {
            command: self.command,
            line,
            matcher: self.matcher,
            timeout: self.timeout,
        })
    }
}

impl PreparedRequest {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The exact line written to the worker, newline included.
    pub fn line(&self) -> &str {
        &self.line
    }
}

/// Serializes requests to a worker and correlates output back to them.
#[derive(Debug, Default)]
pub struct Dispatcher {
    slot: Mutex<()>,
}

/// Exclusive right to run one request; held for the request's lifetime.
pub struct DispatchSlot<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the dispatch slot.
    pub async fn lock(&self) -> DispatchSlot<'_> {
        DispatchSlot {
            _guard: self.slot.lock().await,
        }
    }

    /// Validate, wait for the slot, then run `request` against `handle`.
    pub async fn send(
        &self,
        handle: &WorkerHandle,
        request: Request,
    ) -> Result<Completion, BridgeError> {
        let prepared = request.prepare()?;
        let mut slot = self.lock().await;
        slot.dispatch(handle, &prepared).await
    }
}

impl DispatchSlot<'_> {
    /// Write the request line and wait for its outcome.
    ///
    /// The output subscription is taken before the write and released when
    /// this returns, whichever way it returns.
    pub async fn dispatch(
        &mut self,
        handle: &WorkerHandle,
        request: &PreparedRequest,
    ) -> Result<Completion, BridgeError> {
        if !handle.is_usable() {
            return Err(BridgeError::unavailable(format!(
                "worker {} is not accepting input ({:?})",
                handle.id(),
                handle.status()
            )));
        }

        let started = Instant::now();
        let deadline = deadline_after(request.timeout);
        let mut output = handle.subscribe_output();

        debug!(
            command = %request.command,
            worker_id = %handle.id(),
            request_bytes = request.line.len(),
            "Writing request to worker"
        );
        handle.write_line(request.line.clone()).await?;

        let mut pending = Pending {
            request,
            buf: Vec::new(),
        };
        let mut tracker = request.matcher.tracker();
        let exited = handle.exited();
        tokio::pin!(exited);
        let timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                biased;
                chunk = output.recv() => match chunk {
                    Ok(chunk) => {
                        pending.buf.extend_from_slice(&chunk);
                        match tracker.observe(&pending.buf) {
                            Some(Verdict::Success) => {
                                let elapsed = started.elapsed();
                                info!(
                                    command = %request.command,
                                    worker_id = %handle.id(),
                                    elapsed_ms = millis(elapsed),
                                    "Request completed"
                                );
                                return Ok(Completion {
                                    command: request.command.clone(),
                                    worker_id: handle.id().to_string(),
                                    output: pending.output(),
                                    elapsed,
                                });
                            }
                            Some(Verdict::Failure) => {
                                warn!(
                                    command = %request.command,
                                    worker_id = %handle.id(),
                                    "Worker reported failure"
                                );
                                return Err(BridgeError::WorkerReportedFailure {
                                    command: request.command.clone(),
                                    output: pending.output(),
                                });
                            }
                            None => {}
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // A dropped chunk may have held the completion marker.
                        warn!(
                            command = %request.command,
                            worker_id = %handle.id(),
                            skipped,
                            "Output subscriber lagged; failing request"
                        );
                        return Err(BridgeError::OutputLost {
                            command: request.command.clone(),
                            skipped,
                            output: pending.output(),
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(pending.exited(handle.status().exit_code()));
                    }
                },
                code = &mut exited => {
                    warn!(
                        command = %request.command,
                        worker_id = %handle.id(),
                        code = ?code,
                        "Worker exited mid-request"
                    );
                    return Err(pending.exited(code));
                }
                () = &mut timeout => {
                    warn!(
                        command = %request.command,
                        worker_id = %handle.id(),
                        timeout_ms = millis(request.timeout),
                        "Request timed out"
                    );
                    return Err(BridgeError::Timeout {
                        command: request.command.clone(),
                        timeout_ms: millis(request.timeout),
                        output: pending.output(),
                    });
                }
            }
        }
    }
}

/// Output accumulated for the in-flight request. Only ever grows.
struct Pending<'a> {
    request: &'a PreparedRequest,
    buf: Vec<u8>,
}

impl Pending<'_> {
    fn output(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    fn exited(&self, code: Option<i32>) -> BridgeError {
        BridgeError::WorkerExited {
            command: self.request.command.clone(),
            code,
            output: self.output(),
        }
    }
}

/// Deadline `timeout` from now. Timeouts too large to represent never fire.
fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Roughly thirty years, as tokio uses for an unbounded sleep.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::worker::WorkerHarness;
    use serde_json::json;
    use std::sync::Arc;

    fn request(payload: Option<Value>) -> Request {
        Request::new(
            "processAudio",
            payload,
            Matcher::sentinel("OK", "FAIL"),
            Duration::from_millis(1000),
        )
    }

    fn spawn_send(
        dispatcher: &Arc<Dispatcher>,
        handle: &Arc<WorkerHandle>,
        req: Request,
    ) -> tokio::task::JoinHandle<Result<Completion, BridgeError>> {
        let dispatcher = Arc::clone(dispatcher);
        let handle = Arc::clone(handle);
        tokio::spawn(async move { dispatcher.send(&handle, req).await })
    }

    #[tokio::test]
    async fn writes_exactly_one_line() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let call = spawn_send(&dispatcher, &handle, request(Some(json!({"take": 1}))));

        let line = worker.next_line().await.unwrap();
        assert_eq!(line, "processAudio {\"take\":1}\n");
        worker.emit("OK\n");
        call.await.unwrap().unwrap();
        assert!(worker.try_next_line().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_with_accumulated_output() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let call = spawn_send(&dispatcher, &handle, request(Some(json!({"take": 1}))));

        worker.next_line().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.emit("working...\n");
        worker.emit("OK\n");

        let completion = call.await.unwrap().unwrap();
        assert_eq!(completion.output, "working...\nOK\n");
        assert_eq!(completion.worker_id, handle.id());
        assert_eq!(completion.command, "processAudio");
    }

    #[tokio::test]
    async fn failure_sentinel_rejects_with_output() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let call = spawn_send(&dispatcher, &handle, request(Some(json!({"take": 1}))));

        worker.next_line().await.unwrap();
        worker.emit("FAIL: bad header\n");

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::WorkerReportedFailure { .. }));
        assert!(err.to_string().contains("bad header"));
        assert_eq!(err.output(), Some("FAIL: bad header\n"));
    }

    #[tokio::test]
    async fn split_sentinel_still_resolves() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let req = Request::new(
            "processAudio",
            Some(json!({})),
            Matcher::sentinel("complete", "failed"),
            Duration::from_secs(1),
        );
        let call = spawn_send(&dispatcher, &handle, req);

        worker.next_line().await.unwrap();
        worker.emit("...compl");
        worker.emit("ete...");
        assert_eq!(call.await.unwrap().unwrap().output, "...complete...");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_releases_subscription() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let call = spawn_send(&dispatcher, &handle, request(Some(json!({"take": 1}))));

        worker.next_line().await.unwrap();
        worker.emit("working...\n");
        assert_eq!(handle.output_subscribers(), 1);

        let err = call.await.unwrap().unwrap_err();
        match &err {
            BridgeError::Timeout { timeout_ms, output, .. } => {
                assert_eq!(*timeout_ms, 1000);
                assert_eq!(output, "working...\n");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(handle.output_subscribers(), 0);

        // Late output reaches nobody.
        worker.emit("OK\n");
        assert_eq!(handle.output_subscribers(), 0);
    }

    #[tokio::test]
    async fn null_payload_is_rejected_without_io() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Dispatcher::new();

        let err = dispatcher.send(&handle, request(Some(Value::Null))).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPayload { .. }));
        let err = dispatcher.send(&handle, request(None)).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPayload { .. }));

        assert!(worker.try_next_line().is_none());
        assert_eq!(handle.output_subscribers(), 0);
    }

    #[tokio::test]
    async fn closed_stdin_is_unavailable_without_write() {
        let (handle, mut worker) = WorkerHarness::new(1);
        worker.close_stdin();
        let dispatcher = Dispatcher::new();

        let err = dispatcher.send(&handle, request(Some(json!({})))).await.unwrap_err();
        assert!(matches!(err, BridgeError::WorkerUnavailable { .. }));
        assert_eq!(handle.output_subscribers(), 0);
    }

    #[tokio::test]
    async fn exited_worker_is_unavailable() {
        let (handle, mut worker) = WorkerHarness::new(1);
        worker.exit(Some(1));
        let dispatcher = Dispatcher::new();

        let err = dispatcher.send(&handle, request(Some(json!({})))).await.unwrap_err();
        assert!(matches!(err, BridgeError::WorkerUnavailable { .. }));
        assert!(worker.try_next_line().is_none());
    }

    #[tokio::test]
    async fn exit_mid_request_fails_promptly() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let call = spawn_send(&dispatcher, &handle, request(Some(json!({"take": 2}))));

        worker.next_line().await.unwrap();
        worker.emit("decoding temp.wav\n");
        worker.exit(Some(139));

        match call.await.unwrap().unwrap_err() {
            BridgeError::WorkerExited { code, output, .. } => {
                assert_eq!(code, Some(139));
                assert_eq!(output, "decoding temp.wav\n");
            }
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_matcher_and_command_are_rejected() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Dispatcher::new();

        let bad_name = Request::new(
            "process audio",
            Some(json!({})),
            Matcher::sentinel("OK", "FAIL"),
            Duration::from_secs(1),
        );
        assert!(matches!(
            dispatcher.send(&handle, bad_name).await,
            Err(BridgeError::InvalidCommand { .. })
        ));
        let bad_matcher = Request::new(
            "processAudio",
            Some(json!({})),
            Matcher::sentinel("", "FAIL"),
            Duration::from_secs(1),
        );
        assert!(matches!(
            dispatcher.send(&handle, bad_matcher).await,
            Err(BridgeError::InvalidCommand { .. })
        ));
        assert!(worker.try_next_line().is_none());
    }

    #[tokio::test]
    async fn overlapping_requests_are_serialized() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let first = spawn_send(&dispatcher, &handle, request(Some(json!({"take": 1}))));
        let line = worker.next_line().await.unwrap();
        assert!(line.contains("\"take\":1"));

        let second = spawn_send(&dispatcher, &handle, request(Some(json!({"take": 2}))));
        tokio::task::yield_now().await;
        // The second line is not written while the first is in flight.
        assert!(worker.try_next_line().is_none());

        worker.emit("take 1 OK\n");
        assert_eq!(first.await.unwrap().unwrap().output, "take 1 OK\n");

        let line = worker.next_line().await.unwrap();
        assert!(line.contains("\"take\":2"));
        worker.emit("take 2 OK\n");
        assert_eq!(second.await.unwrap().unwrap().output, "take 2 OK\n");
    }

    #[tokio::test]
    async fn framed_request_ignores_sentinel_like_chatter() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let req = Request::new(
            "generatePDF",
            Some(json!({})),
            Matcher::Framed,
            Duration::from_secs(1),
        );
        let call = spawn_send(&dispatcher, &handle, req);

        worker.next_line().await.unwrap();
        worker.emit("PDF successfully generated? not yet\n");
        worker.emit("@@scoregen {\"kind\":\"success\",\"message\":\"score.pdf\"}\n");
        let completion = call.await.unwrap().unwrap();
        assert!(completion.output.ends_with("\"score.pdf\"}\n"));
    }

    #[tokio::test]
    async fn huge_timeout_does_not_overflow_deadline() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let req = Request::new(
            "processAudio",
            Some(json!({"take": 1})),
            Matcher::sentinel("OK", "FAIL"),
            Duration::from_secs(u64::MAX),
        );
        let call = spawn_send(&dispatcher, &handle, req);

        worker.next_line().await.unwrap();
        worker.emit("OK\n");
        assert_eq!(call.await.unwrap().unwrap().output, "OK\n");
    }

    #[tokio::test]
    async fn lagging_subscriber_fails_instead_of_dropping_output() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let call = spawn_send(&dispatcher, &handle, request(Some(json!({"take": 1}))));

        worker.next_line().await.unwrap();
        // Overrun the 64-chunk buffer before the request task reads anything.
        worker.emit("step\n");
        worker.emit("OK\n");
        for i in 0..100 {
            worker.emit(&format!("log line {i}\n"));
        }

        match call.await.unwrap().unwrap_err() {
            BridgeError::OutputLost { skipped, .. } => assert!(skipped > 0),
            other => panic!("expected lost output, got {other:?}"),
        }
        assert_eq!(handle.output_subscribers(), 0);
    }

    #[tokio::test]
    async fn stderr_text_never_completes_a_request() {
        let (handle, mut worker) = WorkerHarness::new(1);
        let dispatcher = Arc::new(Dispatcher::new());
        let mut diagnostics = handle.subscribe_diagnostics();
        let call = spawn_send(&dispatcher, &handle, request(Some(json!({"take": 1}))));

        worker.next_line().await.unwrap();
        worker.emit_diagnostic("FAIL would be fatal here, but this is stderr");
        assert_eq!(
            diagnostics.recv().await.unwrap(),
            "FAIL would be fatal here, but this is stderr"
        );
        worker.emit("OK\n");
        assert_eq!(call.await.unwrap().unwrap().output, "OK\n");
    }
}
