//! Remote service proxies. Implementations own the wire; they must honour the
//! cancellation token and classify failures into [`ClientError`] variants.

use async_trait::async_trait;
use scriptd_protocol::{
    CancelScriptCommand, CapabilitiesResponse, CompleteScriptCommand, CompleteScriptCommandV2,
    DownloadFileRequest, ScriptStatusRequest, ScriptStatusResponse, ScriptTicket,
    StartScriptCommand, StartScriptCommandV2, UploadFileRequest, UploadResult,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ClientResult;

#[async_trait]
pub trait CapabilitiesService: Send + Sync {
    /// Fails with `UnsupportedOperation` on remotes that predate capability negotiation.
    async fn get_capabilities(&self, cancel: CancellationToken) -> ClientResult<CapabilitiesResponse>;
}

#[async_trait]
pub trait ScriptServiceV1: Send + Sync {
    async fn start_script(
        &self,
        command: StartScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptTicket>;

    async fn get_status(
        &self,
        request: ScriptStatusRequest,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse>;

    async fn cancel_script(
        &self,
        command: CancelScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse>;

    async fn complete_script(
        &self,
        command: CompleteScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse>;
}

#[async_trait]
pub trait ScriptServiceV2: Send + Sync {
    async fn start_script(
        &self,
        command: StartScriptCommandV2,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse>;

    async fn get_status(
        &self,
        request: ScriptStatusRequest,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse>;

    async fn cancel_script(
        &self,
        command: CancelScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse>;

    async fn complete_script(
        &self,
        command: CompleteScriptCommandV2,
        cancel: CancellationToken,
    ) -> ClientResult<()>;
}

#[async_trait]
pub trait ScriptServiceV3Alpha: Send + Sync {
    async fn start_script(
        &self,
        command: StartScriptCommandV2,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse>;

    async fn get_status(
        &self,
        request: ScriptStatusRequest,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse>;

    async fn cancel_script(
        &self,
        command: CancelScriptCommand,
        cancel: CancellationToken,
    ) -> ClientResult<ScriptStatusResponse>;

    async fn complete_script(
        &self,
        command: CompleteScriptCommandV2,
        cancel: CancellationToken,
    ) -> ClientResult<()>;
}

#[async_trait]
pub trait FileTransferService: Send + Sync {
    /// Writes the contents to the path on the remote, replacing any existing file.
    async fn upload_file(
        &self,
        request: UploadFileRequest,
        cancel: CancellationToken,
    ) -> ClientResult<UploadResult>;

    async fn download_file(
        &self,
        request: DownloadFileRequest,
        cancel: CancellationToken,
    ) -> ClientResult<Vec<u8>>;
}

/// Every proxy a client needs to talk to one remote worker.
#[derive(Clone)]
pub struct RemoteServices {
    pub capabilities: Arc<dyn CapabilitiesService>,
    pub script_v1: Arc<dyn ScriptServiceV1>,
    pub script_v2: Arc<dyn ScriptServiceV2>,
    pub script_v3_alpha: Arc<dyn ScriptServiceV3Alpha>,
    pub file_transfer: Arc<dyn FileTransferService>,
}

impl RemoteServices {
    /// Uses a single object implementing every service.
    pub fn from_worker<W>(worker: Arc<W>) -> Self
    where
        W: CapabilitiesService
            + ScriptServiceV1
            + ScriptServiceV2
            + ScriptServiceV3Alpha
            + FileTransferService
            + 'static,
    {
        Self {
            capabilities: worker.clone(),
            script_v1: worker.clone(),
            script_v2: worker.clone(),
            script_v3_alpha: worker.clone(),
            file_transfer: worker,
        }
    }
}
