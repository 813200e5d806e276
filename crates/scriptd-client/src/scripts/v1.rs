use async_trait::async_trait;
use scriptd_protocol::{
    CancelScriptCommand, CompleteScriptCommand, ExecuteScriptCommand, ProcessOutput,
    ProcessOutputSource, ProcessState, SCRIPT_SERVICE_V1, ScriptServiceVersion, ScriptStatusRequest,
    ScriptStatusResponse, exit_codes,
};
use tokio_util::sync::CancellationToken;

use super::{
    CANCEL_SCRIPT, COMPLETE_SCRIPT, CommandContext, ExecutorParts, GET_STATUS, START_SCRIPT,
    ScriptOperationResult, ScriptServiceExecutor, ScriptStatus, StartScriptIsBeingReAttempted,
};
use crate::error::ClientResult;
use crate::metrics::{ClientOperationMetricsBuilder, RpcCall};

const VERSION: ScriptServiceVersion = ScriptServiceVersion::V1;

/// The first protocol generation: the remote allocates tickets and nothing is deduplicated,
/// so no call is ever retried.
pub(crate) struct ScriptServiceV1Executor<'a> {
    parts: ExecutorParts<'a>,
}

impl<'a> ScriptServiceV1Executor<'a> {
    pub(crate) fn new(parts: ExecutorParts<'a>) -> Self {
        Self { parts }
    }

    fn rpc_call(name: &str) -> RpcCall {
        RpcCall::new(SCRIPT_SERVICE_V1, name)
    }

    async fn fetch_status(
        &self,
        context: &CommandContext,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptStatusResponse> {
        let service = self.parts.services.script_v1.as_ref();
        let request = ScriptStatusRequest {
            ticket: context.script_ticket().clone(),
            last_log_sequence: context.next_log_sequence(),
        };
        self.parts
            .rpc
            .execute_with_no_retries(
                Self::rpc_call(GET_STATUS),
                |ct| service.get_status(request.clone(), ct),
                self.parts.log,
                metrics,
                cancel,
            )
            .await
    }

    /// Stand-in result for a start that might have run already.
    fn unknown_outcome(command: &ExecuteScriptCommand) -> ScriptOperationResult {
        ScriptOperationResult {
            status: ScriptStatus {
                process_state: ProcessState::Complete,
                exit_code: Some(exit_codes::FATAL),
                logs: vec![ProcessOutput::new(
                    ProcessOutputSource::StdErr,
                    "The script may already have been started and the remote cannot say whether it ran. It was not started again.",
                    0,
                )],
            },
            context: CommandContext::new(command.script_ticket.clone(), 0, VERSION),
        }
    }
}

#[async_trait]
impl ScriptServiceExecutor for ScriptServiceV1Executor<'_> {
    async fn start_script(
        &self,
        command: &ExecuteScriptCommand,
        reattempt: StartScriptIsBeingReAttempted,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        if reattempt == StartScriptIsBeingReAttempted::PossiblyBeingReAttempted {
            self.parts.log.warn(
                "Script service V1 cannot detect duplicate starts; not starting a script that may already have run",
            );
            return Ok(Self::unknown_outcome(command));
        }

        let service = self.parts.services.script_v1.as_ref();
        let start = command.to_v1();
        let ticket = self
            .parts
            .rpc
            .execute_with_no_retries(
                Self::rpc_call(START_SCRIPT),
                |ct| service.start_script(start.clone(), ct),
                self.parts.log,
                metrics,
                cancel,
            )
            .await?;

        Ok(ScriptOperationResult {
            status: ScriptStatus {
                process_state: ProcessState::Pending,
                exit_code: None,
                logs: Vec::new(),
            },
            context: CommandContext::new(ticket, 0, VERSION),
        })
    }

    async fn get_status(
        &self,
        context: &CommandContext,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let first = self.fetch_status(context, metrics, cancel).await?;
        if first.state != ProcessState::Complete {
            return Ok(ScriptOperationResult::from_response(first, VERSION));
        }

        // Output can land between the read that saw completion and the exit; read once more.
        let next = context.with_next_log_sequence(first.next_log_sequence);
        let mut last = self.fetch_status(&next, metrics, cancel).await?;
        let mut logs = first.logs;
        logs.append(&mut last.logs);
        last.logs = logs;
        Ok(ScriptOperationResult::from_response(last, VERSION))
    }

    async fn cancel_script(
        &self,
        context: &CommandContext,
        metrics: &mut ClientOperationMetricsBuilder,
        abandon: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult> {
        let service = self.parts.services.script_v1.as_ref();
        let command = CancelScriptCommand {
            ticket: context.script_ticket().clone(),
            last_log_sequence: context.next_log_sequence(),
        };
        let response = self
            .parts
            .rpc
            .execute_with_no_retries(
                Self::rpc_call(CANCEL_SCRIPT),
                |ct| service.cancel_script(command.clone(), ct),
                self.parts.log,
                metrics,
                abandon,
            )
            .await?;
        Ok(ScriptOperationResult::from_response(response, VERSION))
    }

    async fn complete_script(
        &self,
        context: &CommandContext,
        metrics: &mut ClientOperationMetricsBuilder,
        _cancel: &CancellationToken,
    ) -> Option<ScriptStatus> {
        let service = self.parts.services.script_v1.as_ref();
        let command = CompleteScriptCommand {
            ticket: context.script_ticket().clone(),
            last_log_sequence: context.next_log_sequence(),
        };
        let completed = self
            .parts
            .rpc
            .execute_with_no_retries(
                Self::rpc_call(COMPLETE_SCRIPT),
                |ct| service.complete_script(command.clone(), ct),
                self.parts.log,
                metrics,
                &CancellationToken::new(),
            )
            .await;

        match completed {
            Ok(response) => Some(response.into()),
            Err(err) => {
                tracing::warn!(ticket = %context.script_ticket(), err = %err, "complete script failed");
                self.parts
                    .log
                    .warn("Failed to cleanup the script working directory on the remote");
                self.parts.log.verbose(&err.to_string());
                None
            }
        }
    }
}
