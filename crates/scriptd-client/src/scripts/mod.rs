//! Per-version script orchestration.
//!
//! A script's protocol version is chosen once, at start, and recorded in its
//! [`CommandContext`]. Every later call is routed to the executor for that
//! version without consulting the remote's capabilities again.

mod ticketed;
mod v1;

use async_trait::async_trait;
use scriptd_protocol::{
    ExecuteScriptCommand, ProcessOutput, ProcessState, ScriptServiceVersion, ScriptStatusResponse,
    ScriptTicket,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ClientOptions;
use crate::error::ClientResult;
use crate::executor::RpcCallExecutor;
use crate::log::ClientTaskLog;
use crate::metrics::ClientOperationMetricsBuilder;
use crate::transport::RemoteServices;

pub(crate) use ticketed::TicketedScriptExecutor;
pub(crate) use v1::ScriptServiceV1Executor;

pub(crate) const START_SCRIPT: &str = "StartScript";
pub(crate) const GET_STATUS: &str = "GetStatus";
pub(crate) const CANCEL_SCRIPT: &str = "CancelScript";
pub(crate) const COMPLETE_SCRIPT: &str = "CompleteScript";

/// Whether a start call may be repeating one that already reached the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartScriptIsBeingReAttempted {
    FirstAttempt,
    PossiblyBeingReAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStatus {
    pub process_state: ProcessState,
    pub exit_code: Option<i32>,
    pub logs: Vec<ProcessOutput>,
}

impl ScriptStatus {
    pub fn is_complete(&self) -> bool {
        self.process_state == ProcessState::Complete
    }
}

impl From<ScriptStatusResponse> for ScriptStatus {
    fn from(response: ScriptStatusResponse) -> Self {
        Self {
            process_state: response.state,
            exit_code: response.exit_code,
            logs: response.logs,
        }
    }
}

/// Continuation handle threaded between the calls made for one script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandContext {
    script_ticket: ScriptTicket,
    next_log_sequence: u64,
    version_used: ScriptServiceVersion,
}

impl CommandContext {
    pub fn new(
        script_ticket: ScriptTicket,
        next_log_sequence: u64,
        version_used: ScriptServiceVersion,
    ) -> Self {
        Self {
            script_ticket,
            next_log_sequence,
            version_used,
        }
    }

    pub fn script_ticket(&self) -> &ScriptTicket {
        &self.script_ticket
    }

    pub fn next_log_sequence(&self) -> u64 {
        self.next_log_sequence
    }

    pub fn version_used(&self) -> ScriptServiceVersion {
        self.version_used
    }

    /// Same script and version, resuming logs from `next_log_sequence`.
    pub fn with_next_log_sequence(&self, next_log_sequence: u64) -> Self {
        Self {
            next_log_sequence,
            ..self.clone()
        }
    }
}

/// Status reported by a call, plus the context for the next call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOperationResult {
    pub status: ScriptStatus,
    pub context: CommandContext,
}

impl ScriptOperationResult {
    pub(crate) fn from_response(
        response: ScriptStatusResponse,
        version: ScriptServiceVersion,
    ) -> Self {
        let context = CommandContext::new(
            response.ticket.clone(),
            response.next_log_sequence,
            version,
        );
        Self {
            status: response.into(),
            context,
        }
    }

    /// A start whose outcome is unknown: treated as running so the caller cancels and completes it.
    pub(crate) fn potentially_started(context: CommandContext) -> Self {
        Self {
            status: ScriptStatus {
                process_state: ProcessState::Pending,
                exit_code: None,
                logs: Vec::new(),
            },
            context,
        }
    }
}

/// One implementation per script protocol version.
#[async_trait]
pub(crate) trait ScriptServiceExecutor: Send + Sync {
    async fn start_script(
        &self,
        command: &ExecuteScriptCommand,
        reattempt: StartScriptIsBeingReAttempted,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult>;

    async fn get_status(
        &self,
        context: &CommandContext,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult>;

    /// Never runs under the caller's token, since it is what stops the remote work.
    /// `abandon` fires only when the caller has given up waiting on the remote.
    async fn cancel_script(
        &self,
        context: &CommandContext,
        metrics: &mut ClientOperationMetricsBuilder,
        abandon: &CancellationToken,
    ) -> ClientResult<ScriptOperationResult>;

    /// Best-effort cleanup. Never fails; returns a final status only where the protocol has one.
    async fn complete_script(
        &self,
        context: &CommandContext,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> Option<ScriptStatus>;
}

/// Shared collaborators every version's executor needs.
#[derive(Clone, Copy)]
pub(crate) struct ExecutorParts<'a> {
    pub(crate) services: &'a RemoteServices,
    pub(crate) rpc: &'a RpcCallExecutor,
    pub(crate) options: &'a ClientOptions,
    pub(crate) log: &'a dyn ClientTaskLog,
}

pub(crate) fn executor_for<'a>(
    version: ScriptServiceVersion,
    parts: ExecutorParts<'a>,
) -> Box<dyn ScriptServiceExecutor + 'a> {
    match version {
        ScriptServiceVersion::V1 => Box::new(ScriptServiceV1Executor::new(parts)),
        ScriptServiceVersion::V2 => Box::new(TicketedScriptExecutor::v2(parts)),
        ScriptServiceVersion::V3Alpha => Box::new(TicketedScriptExecutor::v3_alpha(parts)),
    }
}
