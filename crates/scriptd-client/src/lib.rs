//! Client side of the remote script protocol.
//!
//! [`ScriptClient`] negotiates a script service version with a worker, starts
//! scripts on it, polls them to completion and cleans up afterwards. It also moves
//! files to and from the worker. Every remote call goes through [`RpcCallExecutor`],
//! which retries transient network failures within a time budget and reports
//! per-call metrics to a [`ClientObserver`].

mod backoff;
mod client;
mod command;
mod config;
mod error;
mod executor;
mod log;
mod metrics;
mod observer;
mod retry;
mod scripts;
mod selector;
mod transport;

pub use scriptd_protocol as protocol;

pub use backoff::{DefaultScriptObserverBackoffStrategy, ScriptObserverBackoffStrategy, retry_backoff};
pub use client::{ScriptClient, ScriptExecutionResult};
pub use command::ExecuteScriptCommandBuilder;
pub use config::{ClientConfig, ClientOptions};
pub use error::{ClientError, ClientResult, ConnectionPhase};
pub use executor::RpcCallExecutor;
pub use log::{ClientTaskLog, TracingTaskLog};
pub use metrics::{
    ClientOperationMetrics, ClientOperationMetricsBuilder, RpcCall, RpcCallMetrics, TimedOperation,
};
pub use observer::{ClientObserver, NoopClientObserver, TracingClientObserver};
pub use retry::{
    AttemptOutcome, AttemptResult, FailureClass, RetryClassify, RetryEngine, RetryEvent,
    RetryHooks, TimeoutEvent,
};
pub use scripts::{
    CommandContext, ScriptOperationResult, ScriptStatus, StartScriptIsBeingReAttempted,
};
pub use selector::{ScriptServiceVersionSelector, resolve_version};
pub use transport::{
    CapabilitiesService, FileTransferService, RemoteServices, ScriptServiceV1, ScriptServiceV2,
    ScriptServiceV3Alpha,
};
