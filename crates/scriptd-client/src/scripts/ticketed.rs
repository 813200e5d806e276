use async_trait::async_trait;
use scriptd_protocol::{
    CancelScriptCommand, CompleteScriptCommandV2, ExecuteScriptCommand, ScriptServiceVersion,
    ScriptStatusRequest, ScriptStatusResponse, StartScriptCommandV2,
};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;

use super::{
    CANCEL_SCRIPT, COMPLETE_SCRIPT, CommandContext, ExecutorParts, GET_STATUS, START_SCRIPT,
    ScriptOperationResult, ScriptServiceExecutor, ScriptStatus, StartScriptIsBeingReAttempted,
};
use crate::error::{ClientError, ClientResult};
use crate::metrics::{ClientOperationMetricsBuilder, RpcCall};
use crate::transport::{ScriptServiceV2, ScriptServiceV3Alpha};

#[derive(Clone, Copy)]
enum TicketedService<'a> {
    V2(&'a dyn ScriptServiceV2),
    V3Alpha(&'a dyn ScriptServiceV3Alpha),
}

impl TicketedService<'_> {
    fn version(&self) -> ScriptServiceVersion {
        match self {
            Self::V2(_) => ScriptServiceVersion::V2,
            Self::V3Alpha(_) => ScriptServiceVersion::V3Alpha,
        }
    }

    fn start_command(&self, command: &ExecuteScriptCommand) -> StartScriptCommandV2 {
        match self {
            Self::V2(_) => command.to_v2(),
            Self::V3Alpha(_) => command.to_v3_alpha(),
        }
    }

    async fn start_script(
        &self,
        command: StartScriptCommandV2,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        match self {
            Self::V2(service) => service.start_script(command, cancel).await,
            Self::V3Alpha(service) => service.start_script(command, cancel).await,
        }
    }

    async fn get_status(
        &self,
        request: ScriptStatusRequest,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        match self {
            Self::V2(service) => service.get_status(request, cancel).await,
            Self::V3Alpha(service) => service.get_status(request, cancel).await,
        }
    }

    async fn cancel_script(
        &self,
        command: CancelScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        match self {
            Self::V2(service) => service.cancel_script(command, cancel).await,
            Self::V3Alpha(service) => service.cancel_script(command, cancel).await,
        }
    }

    async fn complete_script(
        &self,
        command: CompleteScriptCommandV2,
        cancel: CancellationToken,
    ) -> ClientResult<()> {
        match self {
            Self::V2(service) => service.complete_script(command, cancel).await,
            Self::V3Alpha(service) => service.complete_script(command, cancel).await,
        }
    }
}

/// V2 and V3Alpha: the client owns the ticket and the remote deduplicates starts on it,
/// which makes every call safe to retry.
pub(crate) struct TicketedScriptExecutor<'a> {
    service: TicketedService<'a>,
    parts: ExecutorParts<'a>,
}

impl<'a> TicketedScriptExecutor<'a> {
    pub(crate) fn v2(parts: ExecutorParts<'a>) -> Self {
        Self {
            service: TicketedService::V2(parts.services.script_v2.as_ref()),
            parts,
        }
    }

    pub(crate) fn v3_alpha(parts: ExecutorParts<'a>) -> Self {
        Self {
            service: TicketedService::V3Alpha(parts.services.script_v3_alpha.as_ref()),
            parts,
        }
    }

    fn rpc_call(&self, name: &str) -> RpcCall {
        RpcCall::new(self.service.version().service_name(), name)
    }

    fn retries_enabled(&self) -> bool {
        self.parts.options.retries_enabled()
    }
}

#[async_trait]
impl ScriptServiceExecutor for TicketedScriptExecutor<'_> {
    async fn start_script(
        &self,
        command: &ExecuteScriptCommand,
        reattempt: StartScriptIsBeingReAttempted,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let version = self.service.version();
        if reattempt == StartScriptIsBeingReAttempted::PossiblyBeingReAttempted {
            self.parts.log.verbose(&format!(
                "Re-sending start for script {}; the remote deduplicates on the ticket",
                command.script_ticket
            ));
        }

        let service = self.service;
        let start = service.start_command(command);
        // Attempts that may have reached the remote. Attempts that failed while
        // connecting are taken back out.
        let maybe_delivered = AtomicU32::new(0);
        let rpc = self.parts.rpc.with_minimum_attempts(
            self.parts
                .options
                .minimum_attempts_for_interrupted_long_running_calls(),
        );

        let started = rpc
            .execute(
                self.retries_enabled(),
                self.rpc_call(START_SCRIPT),
                |ct| {
                    maybe_delivered.fetch_add(1, Ordering::SeqCst);
                    let start = start.clone();
                    async move { service.start_script(start, ct).await }
                },
                |err: &ClientError| {
                    if err.never_connected() {
                        maybe_delivered.fetch_sub(1, Ordering::SeqCst);
                    }
                },
                self.parts.log,
                metrics,
                cancel,
            )
            .await;

        match started {
            Ok(response) => Ok(ScriptOperationResult::from_response(response, version)),
            Err(_) if cancel.is_cancelled() => {
                if maybe_delivered.load(Ordering::SeqCst) == 0 {
                    return Err(ClientError::Cancelled);
                }
                self.parts
                    .log
                    .verbose("Script execution was cancelled after the script may have started");
                Ok(ScriptOperationResult::potentially_started(CommandContext::new(
                    command.script_ticket.clone(),
                    0,
                    version,
                )))
            }
            Err(err) => Err(err),
        }
    }

    async fn get_status(
        &self,
        context: &CommandContext,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let service = self.service;
        let request = ScriptStatusRequest {
            ticket: context.script_ticket().clone(),
            last_log_sequence: context.next_log_sequence(),
        };
        let response = self
            .parts
            .rpc
            .execute(
                self.retries_enabled(),
                self.rpc_call(GET_STATUS),
                |ct| {
                    let request = request.clone();
                    async move { service.get_status(request, ct).await }
                },
                |_| {},
                self.parts.log,
                metrics,
                cancel,
            )
            .await?;
        Ok(ScriptOperationResult::from_response(
            response,
            context.version_used(),
        ))
    }

    async fn cancel_script(
        &self,
        context: &CommandContext,
        metrics: &mut ClientOperationMetricsBuilder,
        abandon: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let service = self.service;
        let command = CancelScriptCommand {
            ticket: context.script_ticket().clone(),
            last_log_sequence: context.next_log_sequence(),
        };
        let response = self
            .parts
            .rpc
            .execute(
                self.retries_enabled(),
                self.rpc_call(CANCEL_SCRIPT),
                |ct| {
                    let command = command.clone();
                    async move { service.cancel_script(command, ct).await }
                },
                |_| {},
                self.parts.log,
                metrics,
                abandon,
            )
            .await?;
        Ok(ScriptOperationResult::from_response(
            response,
            context.version_used(),
        ))
    }

    async fn complete_script(
        &self,
        context: &CommandContext,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> Option<ScriptStatus> {
        let service = self.service;
        let command = CompleteScriptCommandV2 {
            ticket: context.script_ticket().clone(),
        };
        let abandon_after = self
            .parts
            .options
            .on_cancellation_abandon_complete_script_after();
        let complete_token = CancellationToken::new();

        let call = self.parts.rpc.execute_with_no_retries(
            self.rpc_call(COMPLETE_SCRIPT),
            |ct| {
                let command = command.clone();
                async move { service.complete_script(command, ct).await }
            },
            self.parts.log,
            metrics,
            &complete_token,
        );
        tokio::pin!(call);

        // Once the caller cancels, cleanup gets `abandon_after` before it is given up on.
        let finished = tokio::select! {
            result = &mut call => Some(result),
            _ = async {
                cancel.cancelled().await;
                tokio::time::sleep(abandon_after).await;
            } => None,
        };
        let completed = match finished {
            Some(result) => result,
            None => {
                complete_token.cancel();
                call.await
            }
        };

        if let Err(err) = completed {
            tracing::warn!(ticket = %context.script_ticket(), err = %err, "complete script failed");
            self.parts
                .log
                .warn("Failed to cleanup the script working directory on the remote");
            self.parts.log.verbose(&err.to_string());
        }
        None
    }
}
