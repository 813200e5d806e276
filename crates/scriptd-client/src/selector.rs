use scriptd_protocol::{CAPABILITIES_SERVICE_V2, CapabilitiesResponse, ScriptServiceVersion};
use tokio_util::sync::CancellationToken;

use crate::config::ClientOptions;
use crate::error::{ClientError, ClientResult};
use crate::executor::RpcCallExecutor;
use crate::log::ClientTaskLog;
use crate::metrics::{ClientOperationMetricsBuilder, RpcCall};
use crate::transport::CapabilitiesService;

/// Picks the script protocol for one script execution from what the remote advertises.
pub struct ScriptServiceVersionSelector<'a> {
    capabilities: &'a dyn CapabilitiesService,
    rpc: &'a RpcCallExecutor,
    options: &'a ClientOptions,
    log: &'a dyn ClientTaskLog,
}

impl<'a> ScriptServiceVersionSelector<'a> {
    pub fn new(
        capabilities: &'a dyn CapabilitiesService,
        rpc: &'a RpcCallExecutor,
        options: &'a ClientOptions,
        log: &'a dyn ClientTaskLog,
    ) -> Self {
        Self {
            capabilities,
            rpc,
            options,
            log,
        }
    }

    pub async fn determine_version_to_use(
        &self,
        metrics: &mut ClientOperationMetricsBuilder,
        cancel: &CancellationToken,
    ) -> ClientResult<ScriptServiceVersion> {
        self.log.verbose("Determining script service version to use");

        let capabilities_result = self
            .rpc
            .execute(
                self.options.retries_enabled(),
                RpcCall::new(CAPABILITIES_SERVICE_V2, "GetCapabilities"),
                |ct| self.capabilities.get_capabilities(ct),
                |_| {},
                self.log,
                metrics,
                cancel,
            )
            .await;

        let capabilities = match capabilities_result {
            Ok(capabilities) => capabilities,
            Err(err) if err.is_unsupported_operation() => {
                self.log
                    .verbose("Remote does not support capability negotiation, assuming script service V1");
                CapabilitiesResponse::v1_only()
            }
            Err(_) if cancel.is_cancelled() => return Err(ClientError::Cancelled),
            Err(err) => return Err(err),
        };

        let version = resolve_version(&capabilities, self.options);
        tracing::debug!(
            version = %version,
            advertised = ?capabilities.supported_capabilities,
            "selected script service version"
        );
        self.log.verbose(&format!("Using script service {version}"));
        Ok(version)
    }
}

/// Newest version both advertised and allowed, falling back to V1.
pub fn resolve_version(
    capabilities: &CapabilitiesResponse,
    options: &ClientOptions,
) -> ScriptServiceVersion {
    [ScriptServiceVersion::V3Alpha, ScriptServiceVersion::V2]
        .into_iter()
        .find(|version| capabilities.supports(*version) && options.allows(*version))
        .unwrap_or(ScriptServiceVersion::V1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use scriptd_protocol::{SCRIPT_SERVICE_V1, SCRIPT_SERVICE_V2, SCRIPT_SERVICE_V3_ALPHA};

    fn options(config: ClientConfig) -> ClientOptions {
        ClientOptions::try_from(config).expect("valid options")
    }

    fn all_versions() -> CapabilitiesResponse {
        CapabilitiesResponse::new([SCRIPT_SERVICE_V1, SCRIPT_SERVICE_V2, SCRIPT_SERVICE_V3_ALPHA])
    }

    #[test]
    fn prefers_newest_advertised_version() {
        assert_eq!(
            resolve_version(&all_versions(), &ClientOptions::default()),
            ScriptServiceVersion::V3Alpha
        );
        assert_eq!(
            resolve_version(
                &CapabilitiesResponse::new([SCRIPT_SERVICE_V1, SCRIPT_SERVICE_V2]),
                &ClientOptions::default()
            ),
            ScriptServiceVersion::V2
        );
        assert_eq!(
            resolve_version(&CapabilitiesResponse::v1_only(), &ClientOptions::default()),
            ScriptServiceVersion::V1
        );
    }

    #[test]
    fn disabled_versions_are_skipped() {
        let opts = options(ClientConfig {
            disabled_script_service_versions: vec![ScriptServiceVersion::V3Alpha],
            ..ClientConfig::default()
        });
        assert_eq!(resolve_version(&all_versions(), &opts), ScriptServiceVersion::V2);

        let opts = options(ClientConfig {
            disabled_script_service_versions: vec![
                ScriptServiceVersion::V3Alpha,
                ScriptServiceVersion::V2,
            ],
            ..ClientConfig::default()
        });
        assert_eq!(resolve_version(&all_versions(), &opts), ScriptServiceVersion::V1);
    }

    #[test]
    fn max_version_caps_selection() {
        let opts = options(ClientConfig {
            max_script_service_version: ScriptServiceVersion::V2,
            ..ClientConfig::default()
        });
        assert_eq!(resolve_version(&all_versions(), &opts), ScriptServiceVersion::V2);

        let opts = options(ClientConfig {
            max_script_service_version: ScriptServiceVersion::V1,
            ..ClientConfig::default()
        });
        assert_eq!(resolve_version(&all_versions(), &opts), ScriptServiceVersion::V1);
    }
}
