use scriptd_protocol::{
    DownloadFileRequest, ExecuteScriptCommand, FILE_TRANSFER_SERVICE, ProcessState,
    ScriptServiceVersion, UploadFileRequest, UploadResult,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::{DefaultScriptObserverBackoffStrategy, ScriptObserverBackoffStrategy};
use crate::config::ClientOptions;
use crate::error::{ClientError, ClientResult};
use crate::executor::RpcCallExecutor;
use crate::log::ClientTaskLog;
use crate::metrics::{ClientOperationMetricsBuilder, RpcCall};
use crate::observer::ClientObserver;
use crate::retry::RetryEngine;
use crate::scripts::{
    CANCEL_SCRIPT, CommandContext, ExecutorParts, ScriptOperationResult, ScriptServiceExecutor,
    ScriptStatus, StartScriptIsBeingReAttempted, executor_for,
};
use crate::selector::ScriptServiceVersionSelector;
use crate::transport::RemoteServices;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptExecutionResult {
    pub state: ProcessState,
    pub exit_code: Option<i32>,
}

impl ScriptExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.state == ProcessState::Complete && self.exit_code == Some(0)
    }
}

/// Runs scripts on one remote worker over the best protocol both sides support.
///
/// Cheap to clone; clones share the remote proxies, observer and log.
#[derive(Clone)]
pub struct ScriptClient {
    services: RemoteServices,
    options: Arc<ClientOptions>,
    rpc: RpcCallExecutor,
    observer: Arc<dyn ClientObserver>,
    log: Arc<dyn ClientTaskLog>,
    backoff: Arc<dyn ScriptObserverBackoffStrategy>,
}

impl ScriptClient {
    pub fn new(
        services: RemoteServices,
        options: ClientOptions,
        observer: Arc<dyn ClientObserver>,
        log: Arc<dyn ClientTaskLog>,
    ) -> Self {
        let rpc = RpcCallExecutor::new(
            RetryEngine::new(options.retry_duration()),
            Arc::clone(&observer),
        );
        Self {
            services,
            options: Arc::new(options),
            rpc,
            observer,
            log,
            backoff: Arc::new(DefaultScriptObserverBackoffStrategy::default()),
        }
    }

    /// Replaces the spacing between status polls in [`Self::execute_script`].
    pub fn with_backoff_strategy(mut self, backoff: Arc<dyn ScriptObserverBackoffStrategy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Negotiates a protocol version and starts the script on it.
    pub async fn start_script(
        &self,
        command: &ExecuteScriptCommand,
        reattempt: StartScriptIsBeingReAttempted,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let mut metrics = ClientOperationMetricsBuilder::start();
        let result = async {
            let version = self.determine_version(&mut metrics, cancel).await?;
            self.executor(version)
                .start_script(command, reattempt, &mut metrics, cancel)
                .await
        }
        .await;
        self.report(&mut metrics, &result);
        result
    }

    pub async fn get_status(
        &self,
        context: &CommandContext,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let mut metrics = ClientOperationMetricsBuilder::start();
        let result = self
            .executor(context.version_used())
            .get_status(context, &mut metrics, cancel)
            .await;
        self.report(&mut metrics, &result);
        result
    }

    /// Asks the remote to stop the script. Not cancellable: it is how remote work gets stopped.
    pub async fn cancel_script(&self, context: &CommandContext) -> ClientResult<ScriptOperationResult> {
        let mut metrics = ClientOperationMetricsBuilder::start();
        let result = self
            .executor(context.version_used())
            .cancel_script(context, &mut metrics, &CancellationToken::new())
            .await;
        self.report(&mut metrics, &result);
        result
    }

    /// Releases the remote's resources for the script. Failures are logged, not returned.
    pub async fn complete_script(
        &self,
        context: &CommandContext,
        cancel: &CancellationToken,
    ) -> Option<ScriptStatus> {
        let mut metrics = ClientOperationMetricsBuilder::start();
        let status = self
            .executor(context.version_used())
            .complete_script(context, &mut metrics, cancel)
            .await;
        self.report::<()>(&mut metrics, &Ok(()));
        status
    }

    /// Writes `contents` to `remote_path` on the worker. `file_name` only labels the log.
    pub async fn upload_file(
        &self,
        file_name: &str,
        remote_path: &str,
        contents: Vec<u8>,
        cancel: &CancellationToken,
    ) -> ClientResult<UploadResult> {
        let mut metrics = ClientOperationMetricsBuilder::start();
        self.log
            .info(&format!("Beginning upload of {file_name} to the worker"));
        let service = self.services.file_transfer.as_ref();
        let request = UploadFileRequest::new(remote_path, contents);
        let result = self
            .rpc
            .execute(
                self.options.retries_enabled(),
                RpcCall::new(FILE_TRANSFER_SERVICE, "UploadFile"),
                |ct| {
                    let request = request.clone();
                    async move { service.upload_file(request, ct).await }
                },
                |_| {},
                self.log.as_ref(),
                &mut metrics,
                cancel,
            )
            .await;
        if let Ok(uploaded) = &result {
            tracing::debug!(path = %uploaded.full_path, length = uploaded.length, "upload finished");
            self.log.info(&format!(
                "Upload complete: {} bytes written to {}",
                uploaded.length, uploaded.full_path
            ));
        }
        self.report(&mut metrics, &result);
        result
    }

    pub async fn download_file(
        &self,
        remote_path: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<u8>> {
        let mut metrics = ClientOperationMetricsBuilder::start();
        let service = self.services.file_transfer.as_ref();
        let request = DownloadFileRequest {
            remote_path: remote_path.to_string(),
        };
        let result = self
            .rpc
            .execute(
                self.options.retries_enabled(),
                RpcCall::new(FILE_TRANSFER_SERVICE, "DownloadFile"),
                |ct| {
                    let request = request.clone();
                    async move { service.download_file(request, ct).await }
                },
                |_| {},
                self.log.as_ref(),
                &mut metrics,
                cancel,
            )
            .await;
        if let Ok(contents) = &result {
            tracing::debug!(path = remote_path, length = contents.len(), "download finished");
        }
        self.report(&mut metrics, &result);
        result
    }

    /// Starts the script, polls it to completion and cleans it up.
    ///
    /// Cancelling `cancel` asks the remote to stop the script and keeps polling until it
    /// has; if it has not within the configured abandonment window, this gives up with
    /// [`ClientError::Abandoned`]. Otherwise a cancelled run ends in [`ClientError::Cancelled`].
    ///
    /// `on_completed` runs once the script has finished, before the remote cleans it up. It
    /// receives `cancel` so cleanup can tell a cancelled run from one that ran to the end.
    pub async fn execute_script<S, C, Fut>(
        &self,
        command: &ExecuteScriptCommand,
        mut on_status: S,
        on_completed: C,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptExecutionResult>
    where
        S: FnMut(&ScriptStatus) + Send,
        C: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let mut metrics = ClientOperationMetricsBuilder::start();
        let result = self
            .run_to_completion(command, &mut on_status, on_completed, &mut metrics, cancel)
            .await;
        self.report(&mut metrics, &result);
        result
    }

    async fn run_to_completion<S, C, Fut>(
        &self,
        command: &ExecuteScriptCommand,
        on_status: &mut S,
        on_completed: C,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptExecutionResult>
    where
        S: FnMut(&ScriptStatus) + Send,
        C: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let version = self.determine_version(metrics, cancel).await?;
        let executor = self.executor(version);
        let started = executor
            .start_script(
                command,
                StartScriptIsBeingReAttempted::FirstAttempt,
                metrics,
                cancel,
            )
            .await?;
        on_status(&started.status);

        let last = self
            .observe_until_complete(executor.as_ref(), started, on_status, metrics, cancel)
            .await?;

        on_completed(cancel.clone()).await;

        // V1 reports a final status on completion; later versions leave the last poll as final.
        let status = match executor.complete_script(&last.context, metrics, cancel).await {
            Some(status) => {
                on_status(&status);
                status
            }
            None => last.status,
        };

        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        Ok(ScriptExecutionResult {
            state: status.process_state,
            exit_code: status.exit_code,
        })
    }

    async fn observe_until_complete<S>(
        &self,
        executor: &dyn ScriptServiceExecutor,
        started: ScriptOperationResult,
        on_status: &mut S,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult>
    where
        S: FnMut(&ScriptStatus) + Send,
    {
        let abandon_after = self.options.on_cancellation_abandon_complete_script_after();
        let abandon = CancellationToken::new();
        let mut abandon_at: Option<Instant> = None;
        let mut iteration = 0;
        let mut cancel_iteration = 0;
        let mut last = started;

        while !last.status.is_complete() {
            if cancel.is_cancelled() {
                let deadline = *abandon_at.get_or_insert_with(|| Instant::now() + abandon_after);
                let cancelled = run_until(
                    deadline,
                    &abandon,
                    executor.cancel_script(&last.context, metrics, &abandon),
                )
                .await;
                last = match cancelled {
                    Ok(result) => result,
                    Err(_) if abandon.is_cancelled() => return Err(self.abandoned(&last.context)),
                    Err(err) => return Err(err),
                };
            } else {
                match executor.get_status(&last.context, metrics, cancel).await {
                    Ok(result) => last = result,
                    // Cancelled mid-poll: go round again and ask the remote to stop.
                    Err(_) if cancel.is_cancelled() => continue,
                    Err(err) => {
                        self.cancel_in_background(last.context.clone());
                        return Err(err);
                    }
                }
            }

            on_status(&last.status);
            if last.status.is_complete() {
                break;
            }

            if cancel.is_cancelled() {
                cancel_iteration += 1;
                let deadline = *abandon_at.get_or_insert_with(|| Instant::now() + abandon_after);
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff.backoff(cancel_iteration)) => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(self.abandoned(&last.context));
                    }
                }
            } else {
                iteration += 1;
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff.backoff(iteration)) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }

        Ok(last)
    }

    /// Best-effort stop for a script whose status can no longer be read.
    fn cancel_in_background(&self, context: CommandContext) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(err) = client.cancel_script(&context).await {
                tracing::debug!(ticket = %context.script_ticket(), err = %err, "background cancel failed");
            }
        });
    }

    fn abandoned(&self, context: &CommandContext) -> ClientError {
        let after = self.options.on_cancellation_abandon_complete_script_after();
        tracing::warn!(
            ticket = %context.script_ticket(),
            after_ms = after.as_millis() as u64,
            "abandoning script that has not acknowledged cancellation"
        );
        self.log.warn(&format!(
            "The script did not stop within {} seconds of being cancelled. It is no longer being waited for and may still be running.",
            after.as_secs()
        ));
        ClientError::Abandoned {
            operation: CANCEL_SCRIPT.to_string(),
            after_ms: after.as_millis() as u64,
        }
    }

    async fn determine_version(
        &self,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptServiceVersion> {
        ScriptServiceVersionSelector::new(
            self.services.capabilities.as_ref(),
            &self.rpc,
            &self.options,
            self.log.as_ref(),
        )
        .determine_version_to_use(metrics, cancel)
        .await
    }

    fn executor(&self, version: ScriptServiceVersion) -> Box<dyn ScriptServiceExecutor + '_> {
        executor_for(
            version,
            ExecutorParts {
                services: &self.services,
                rpc: &self.rpc,
                options: &self.options,
                log: self.log.as_ref(),
            },
        )
    }

    fn report<T>(&self, metrics: &mut ClientOperationMetricsBuilder, result: &ClientResult<T>) {
        if let Err(err) = result {
            metrics.with_failure(err);
        }
        self.observer
            .client_operation_completed(&metrics.build(), self.log.as_ref());
    }
}

/// Awaits `fut`, cancelling `token` at `deadline` and then waiting for `fut` to wind down.
async fn run_until<F: Future>(deadline: Instant, token: &CancellationToken, fut: F) -> F::Output {
    tokio::pin!(fut);
    let finished = tokio::select! {
        out = &mut fut => Some(out),
        _ = tokio::time::sleep_until(deadline) => None,
    };
    match finished {
        Some(out) => out,
        None => {
            token.cancel();
            fut.await
        }
    }
}
