#![allow(dead_code)]

use async_trait::async_trait;
use scriptd_client::protocol::{
    CancelScriptCommand, CapabilitiesResponse, CompleteScriptCommand, CompleteScriptCommandV2,
    DownloadFileRequest, FILE_TRANSFER_SERVICE, ProcessOutput, ProcessOutputSource, ProcessState,
    SCRIPT_SERVICE_V1, SCRIPT_SERVICE_V2, SCRIPT_SERVICE_V3_ALPHA, ScriptStatusRequest,
    ScriptStatusResponse, ScriptTicket, StartScriptCommand, StartScriptCommandV2,
    UploadFileRequest, UploadResult, exit_codes,
};
use scriptd_client::{
    CapabilitiesService, ClientError, ClientObserver, ClientOperationMetrics, ClientOptions,
    ClientResult, ClientTaskLog, FileTransferService, RemoteServices, RpcCallMetrics,
    ScriptClient, ScriptServiceV1, ScriptServiceV2, ScriptServiceV3Alpha,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scriptd_client=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// What one call to a fake service does.
pub enum Step<T> {
    Reply(T),
    Fail(ClientError),
    /// Blocks until the call's token is cancelled, then fails the way an aborted transport does.
    Hang,
    /// Replies after a delay unless the call's token is cancelled first.
    Delayed(Duration, T),
}

/// Queue of scripted steps; calls past the end of the queue get the default reply.
pub struct Script<T> {
    steps: Mutex<VecDeque<Step<T>>>,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> Script<T> {
    pub fn push(&self, step: Step<T>) {
        self.steps.lock().expect("script lock").push_back(step);
    }

    pub fn push_all(&self, steps: impl IntoIterator<Item = Step<T>>) {
        self.steps.lock().expect("script lock").extend(steps);
    }

    async fn next(&self, cancel: CancellationToken, default: impl FnOnce() -> T) -> ClientResult<T> {
        let step = self.steps.lock().expect("script lock").pop_front();
        match step {
            None => Ok(default()),
            Some(Step::Reply(value)) => Ok(value),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) => {
                cancel.cancelled().await;
                Err(ClientError::transferring("call aborted"))
            }
            Some(Step::Delayed(delay, value)) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(value),
                    _ = cancel.cancelled() => Err(ClientError::transferring("call aborted")),
                }
            }
        }
    }
}

/// In-memory worker speaking every script service version.
///
/// By default it advertises all versions, reports a started script as running and
/// complete with exit code 0 on the first status poll.
#[derive(Default)]
pub struct FakeWorker {
    pub capabilities: Script<CapabilitiesResponse>,
    pub v1_start: Script<ScriptTicket>,
    pub start: Script<ScriptStatusResponse>,
    pub status: Script<ScriptStatusResponse>,
    pub cancel: Script<ScriptStatusResponse>,
    pub v1_complete: Script<ScriptStatusResponse>,
    pub complete: Script<()>,
    pub upload: Script<UploadResult>,
    pub download: Script<Vec<u8>>,
    calls: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    status_requests: Mutex<Vec<ScriptStatusRequest>>,
    started: Mutex<Vec<StartScriptCommandV2>>,
}

impl FakeWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Calls received so far, as `Service.Method`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn status_requests(&self) -> Vec<ScriptStatusRequest> {
        self.status_requests.lock().expect("status lock").clone()
    }

    pub fn started(&self) -> Vec<StartScriptCommandV2> {
        self.started.lock().expect("started lock").clone()
    }

    /// Contents written by uploads that reached the worker, even when the reply was lost.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().expect("files lock").get(path).cloned()
    }

    fn record(&self, service: &str, method: &str) {
        self.calls
            .lock()
            .expect("calls lock")
            .push(format!("{service}.{method}"));
    }

    async fn start_ticketed(
        &self,
        service: &str,
        command: StartScriptCommandV2,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.record(service, "StartScript");
        let ticket = command.script_ticket.clone();
        self.started.lock().expect("started lock").push(command);
        self.start
            .next(cancel, || response(&ticket, ProcessState::Running, None, &[], 0))
            .await
    }

    async fn poll_status(
        &self,
        service: &str,
        request: ScriptStatusRequest,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.record(service, "GetStatus");
        let ticket = request.ticket.clone();
        let sequence = request.last_log_sequence;
        self.status_requests
            .lock()
            .expect("status lock")
            .push(request);
        self.status
            .next(cancel, || {
                response(&ticket, ProcessState::Complete, Some(0), &[], sequence)
            })
            .await
    }

    async fn cancel_running(
        &self,
        service: &str,
        command: CancelScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.record(service, "CancelScript");
        let ticket = command.ticket;
        let sequence = command.last_log_sequence;
        self.cancel
            .next(cancel, || {
                response(
                    &ticket,
                    ProcessState::Complete,
                    Some(exit_codes::CANCELED),
                    &[],
                    sequence,
                )
            })
            .await
    }
}

pub fn response(
    ticket: &ScriptTicket,
    state: ProcessState,
    exit_code: Option<i32>,
    lines: &[&str],
    next_log_sequence: u64,
) -> ScriptStatusResponse {
    ScriptStatusResponse {
        ticket: ticket.clone(),
        state,
        exit_code,
        logs: lines
            .iter()
            .map(|line| ProcessOutput::new(ProcessOutputSource::StdOut, *line, 0))
            .collect(),
        next_log_sequence,
    }
}

pub fn running(ticket: &ScriptTicket, lines: &[&str], next_log_sequence: u64) -> ScriptStatusResponse {
    response(ticket, ProcessState::Running, None, lines, next_log_sequence)
}

pub fn complete(
    ticket: &ScriptTicket,
    exit_code: i32,
    lines: &[&str],
    next_log_sequence: u64,
) -> ScriptStatusResponse {
    response(
        ticket,
        ProcessState::Complete,
        Some(exit_code),
        lines,
        next_log_sequence,
    )
}

pub fn all_versions() -> CapabilitiesResponse {
    CapabilitiesResponse::new([SCRIPT_SERVICE_V1, SCRIPT_SERVICE_V2, SCRIPT_SERVICE_V3_ALPHA])
}

pub fn up_to_v2() -> CapabilitiesResponse {
    CapabilitiesResponse::new([SCRIPT_SERVICE_V1, SCRIPT_SERVICE_V2])
}

#[async_trait]
impl CapabilitiesService for FakeWorker {
    async fn get_capabilities(&self, cancel: CancellationToken) -> ClientResult<CapabilitiesResponse> {
        self.record("CapabilitiesServiceV2", "GetCapabilities");
        self.capabilities.next(cancel, all_versions).await
    }
}

#[async_trait]
impl ScriptServiceV1 for FakeWorker {
    async fn start_script(
        &self,
        _command: StartScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptTicket> {
        self.record(SCRIPT_SERVICE_V1, "StartScript");
        self.v1_start
            .next(cancel, || ScriptTicket::new("v1-ticket"))
            .await
    }

    async fn get_status(
        &self,
        request: ScriptStatusRequest,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.poll_status(SCRIPT_SERVICE_V1, request, cancel).await
    }

    async fn cancel_script(
        &self,
        command: CancelScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.cancel_running(SCRIPT_SERVICE_V1, command, cancel).await
    }

    async fn complete_script(
        &self,
        command: CompleteScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.record(SCRIPT_SERVICE_V1, "CompleteScript");
        let ticket = command.ticket;
        let sequence = command.last_log_sequence;
        self.v1_complete
            .next(cancel, || complete(&ticket, 0, &[], sequence))
            .await
    }
}

#[async_trait]
impl ScriptServiceV2 for FakeWorker {
    async fn start_script(
        &self,
        command: StartScriptCommandV2,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.start_ticketed(SCRIPT_SERVICE_V2, command, cancel).await
    }

    async fn get_status(
        &self,
        request: ScriptStatusRequest,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.poll_status(SCRIPT_SERVICE_V2, request, cancel).await
    }

    async fn cancel_script(
        &self,
        command: CancelScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.cancel_running(SCRIPT_SERVICE_V2, command, cancel).await
    }

    async fn complete_script(
        &self,
        _command: CompleteScriptCommandV2,
        cancel: CancellationToken,
    ) -> ClientResult<()> {
        self.record(SCRIPT_SERVICE_V2, "CompleteScript");
        self.complete.next(cancel, || ()).await
    }
}

#[async_trait]
impl ScriptServiceV3Alpha for FakeWorker {
    async fn start_script(
        &self,
        command: StartScriptCommandV2,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.start_ticketed(SCRIPT_SERVICE_V3_ALPHA, command, cancel)
            .await
    }

    async fn get_status(
        &self,
        request: ScriptStatusRequest,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.poll_status(SCRIPT_SERVICE_V3_ALPHA, request, cancel).await
    }

    async fn cancel_script(
        &self,
        command: CancelScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        self.cancel_running(SCRIPT_SERVICE_V3_ALPHA, command, cancel).await
    }

    async fn complete_script(
        &self,
        _command: CompleteScriptCommandV2,
        cancel: CancellationToken,
    ) -> ClientResult<()> {
        self.record(SCRIPT_SERVICE_V3_ALPHA, "CompleteScript");
        self.complete.next(cancel, || ()).await
    }
}

#[async_trait]
impl FileTransferService for FakeWorker {
    async fn upload_file(
        &self,
        request: UploadFileRequest,
        cancel: CancellationToken,
    ) -> ClientResult<UploadResult> {
        self.record(FILE_TRANSFER_SERVICE, "UploadFile");
        let uploaded = UploadResult {
            full_path: request.remote_path.clone(),
            hash: format!("{:016x}", request.contents.iter().map(|b| u64::from(*b)).sum::<u64>()),
            length: request.contents.len() as u64,
        };
        self.files
            .lock()
            .expect("files lock")
            .insert(request.remote_path, request.contents);
        self.upload.next(cancel, || uploaded).await
    }

    async fn download_file(
        &self,
        request: DownloadFileRequest,
        cancel: CancellationToken,
    ) -> ClientResult<Vec<u8>> {
        self.record(FILE_TRANSFER_SERVICE, "DownloadFile");
        let stored = self.file(&request.remote_path).unwrap_or_default();
        self.download.next(cancel, || stored).await
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    rpc_calls: Mutex<Vec<RpcCallMetrics>>,
    operations: Mutex<Vec<ClientOperationMetrics>>,
}

impl RecordingObserver {
    pub fn rpc_calls(&self) -> Vec<RpcCallMetrics> {
        self.rpc_calls.lock().expect("observer lock").clone()
    }

    pub fn rpc_call_names(&self) -> Vec<String> {
        self.rpc_calls()
            .iter()
            .map(|m| m.rpc_call().to_string())
            .collect()
    }

    pub fn operations(&self) -> Vec<ClientOperationMetrics> {
        self.operations.lock().expect("observer lock").clone()
    }
}

impl ClientObserver for RecordingObserver {
    fn rpc_call_completed(&self, metrics: &RpcCallMetrics, _log: &dyn ClientTaskLog) {
        self.rpc_calls
            .lock()
            .expect("observer lock")
            .push(metrics.clone());
    }

    fn client_operation_completed(&self, metrics: &ClientOperationMetrics, _log: &dyn ClientTaskLog) {
        self.operations
            .lock()
            .expect("observer lock")
            .push(metrics.clone());
    }
}

#[derive(Default)]
pub struct RecordingLog {
    infos: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
}

impl RecordingLog {
    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().expect("log lock").clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().expect("log lock").clone()
    }
}

impl ClientTaskLog for RecordingLog {
    fn info(&self, message: &str) {
        self.infos.lock().expect("log lock").push(message.to_string());
    }

    fn verbose(&self, _message: &str) {}

    fn warn(&self, message: &str) {
        self.warnings
            .lock()
            .expect("log lock")
            .push(message.to_string());
    }
}

pub struct Harness {
    pub worker: Arc<FakeWorker>,
    pub observer: Arc<RecordingObserver>,
    pub log: Arc<RecordingLog>,
    pub client: ScriptClient,
}

pub fn harness(options: ClientOptions) -> Harness {
    init_tracing();
    let worker = FakeWorker::new();
    let observer = Arc::new(RecordingObserver::default());
    let log = Arc::new(RecordingLog::default());
    let client = ScriptClient::new(
        RemoteServices::from_worker(worker.clone()),
        options,
        observer.clone(),
        log.clone(),
    );
    Harness {
        worker,
        observer,
        log,
        client,
    }
}

pub fn options(toml: &str) -> ClientOptions {
    ClientOptions::from_toml_str(toml).expect("valid client options")
}
