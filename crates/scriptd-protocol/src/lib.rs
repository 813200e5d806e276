use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Service name advertised by remotes speaking the first script protocol generation.
pub const SCRIPT_SERVICE_V1: &str = "ScriptService";
pub const SCRIPT_SERVICE_V2: &str = "ScriptServiceV2";
pub const SCRIPT_SERVICE_V3_ALPHA: &str = "ScriptServiceV3Alpha";
pub const CAPABILITIES_SERVICE_V2: &str = "CapabilitiesServiceV2";
pub const FILE_TRANSFER_SERVICE: &str = "FileTransferService";

/// Exit codes the remote reports for scripts that did not exit on their own.
pub mod exit_codes {
    pub const FATAL: i32 = -41;
    pub const POWERSHELL_INVOCATION_ERROR: i32 = -42;
    pub const CANCELED: i32 = -43;
    pub const TIMEOUT: i32 = -44;
}

/// Remote script protocol generations, ordered oldest first.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScriptServiceVersion {
    V1,
    V2,
    V3Alpha,
}

impl ScriptServiceVersion {
    pub const ALL: [ScriptServiceVersion; 3] = [Self::V1, Self::V2, Self::V3Alpha];

    /// Name under which a remote advertises this version in its capabilities.
    pub fn service_name(self) -> &'static str {
        match self {
            Self::V1 => SCRIPT_SERVICE_V1,
            Self::V2 => SCRIPT_SERVICE_V2,
            Self::V3Alpha => SCRIPT_SERVICE_V3_ALPHA,
        }
    }

    pub fn from_service_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.service_name() == name)
    }
}

impl fmt::Display for ScriptServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => f.write_str("V1"),
            Self::V2 => f.write_str("V2"),
            Self::V3Alpha => f.write_str("V3Alpha"),
        }
    }
}

/// Correlates every call made for one remote script execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ScriptTicket(String);

impl ScriptTicket {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// A fresh ticket, unique per script execution.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Pending,
    Running,
    Complete,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOutputSource {
    StdOut,
    StdErr,
    Debug,
}

/// One line of script output as recorded by the remote.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub source: ProcessOutputSource,
    pub text: String,
    pub occurred_at_ms: u64,
}

impl ProcessOutput {
    pub fn new(source: ProcessOutputSource, text: impl Into<String>, occurred_at_ms: u64) -> Self {
        Self {
            source,
            text: text.into(),
            occurred_at_ms,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScriptIsolationLevel {
    #[default]
    NoIsolation,
    FullIsolation,
}

/// How the remote serialises concurrently running scripts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptIsolationConfiguration {
    pub isolation_level: ScriptIsolationLevel,
    pub mutex_name: String,
    /// `None` waits for the mutex forever.
    #[serde(default)]
    pub mutex_timeout_ms: Option<u64>,
}

impl Default for ScriptIsolationConfiguration {
    fn default() -> Self {
        Self {
            isolation_level: ScriptIsolationLevel::default(),
            mutex_name: "RunningScript".to_string(),
            mutex_timeout_ms: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    Bash,
    PowerShell,
    Python,
    CSharp,
    FSharp,
}

/// A file shipped alongside the script into its working directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
}

impl ScriptFile {
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// Version-independent description of a script to run remotely.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecuteScriptCommand {
    pub script_ticket: ScriptTicket,
    pub task_id: String,
    pub script_body: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub files: Vec<ScriptFile>,
    #[serde(default)]
    pub additional_scripts: BTreeMap<ScriptType, String>,
    #[serde(default)]
    pub isolation: ScriptIsolationConfiguration,
    /// How long V3Alpha remotes hold a start call open waiting for a short script to finish.
    #[serde(default)]
    pub duration_to_wait_for_script_to_finish_ms: Option<u64>,
}

impl ExecuteScriptCommand {
    pub fn to_v1(&self) -> StartScriptCommand {
        StartScriptCommand {
            task_id: self.task_id.clone(),
            script_body: self.script_body.clone(),
            arguments: self.arguments.clone(),
            files: self.files.clone(),
            additional_scripts: self.additional_scripts.clone(),
            isolation: self.isolation.clone(),
        }
    }

    pub fn to_v2(&self) -> StartScriptCommandV2 {
        StartScriptCommandV2 {
            script_ticket: self.script_ticket.clone(),
            task_id: self.task_id.clone(),
            script_body: self.script_body.clone(),
            arguments: self.arguments.clone(),
            files: self.files.clone(),
            additional_scripts: self.additional_scripts.clone(),
            isolation: self.isolation.clone(),
            duration_to_wait_for_script_to_finish_ms: None,
        }
    }

    pub fn to_v3_alpha(&self) -> StartScriptCommandV2 {
        StartScriptCommandV2 {
            duration_to_wait_for_script_to_finish_ms: self.duration_to_wait_for_script_to_finish_ms,
            ..self.to_v2()
        }
    }
}

/// V1 start: the remote allocates the ticket, so a re-sent command starts a second script.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StartScriptCommand {
    pub task_id: String,
    pub script_body: String,
    pub arguments: Vec<String>,
    pub files: Vec<ScriptFile>,
    pub additional_scripts: BTreeMap<ScriptType, String>,
    pub isolation: ScriptIsolationConfiguration,
}

/// V2 and V3Alpha start: the client supplies the ticket and the remote dedups on it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StartScriptCommandV2 {
    pub script_ticket: ScriptTicket,
    pub task_id: String,
    pub script_body: String,
    pub arguments: Vec<String>,
    pub files: Vec<ScriptFile>,
    pub additional_scripts: BTreeMap<ScriptType, String>,
    pub isolation: ScriptIsolationConfiguration,
    #[serde(default)]
    pub duration_to_wait_for_script_to_finish_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptStatusRequest {
    pub ticket: ScriptTicket,
    pub last_log_sequence: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CancelScriptCommand {
    pub ticket: ScriptTicket,
    pub last_log_sequence: u64,
}

/// V1 completion also drains any output written since the last poll.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CompleteScriptCommand {
    pub ticket: ScriptTicket,
    pub last_log_sequence: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CompleteScriptCommandV2 {
    pub ticket: ScriptTicket,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScriptStatusResponse {
    pub ticket: ScriptTicket,
    pub state: ProcessState,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub logs: Vec<ProcessOutput>,
    pub next_log_sequence: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilitiesResponse {
    pub supported_capabilities: Vec<String>,
}

impl CapabilitiesResponse {
    pub fn new(capabilities: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            supported_capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }

    /// What a remote without capability negotiation implicitly offers.
    pub fn v1_only() -> Self {
        Self::new([SCRIPT_SERVICE_V1])
    }

    pub fn has(&self, capability: &str) -> bool {
        self.supported_capabilities.iter().any(|c| c == capability)
    }

    pub fn supports(&self, version: ScriptServiceVersion) -> bool {
        self.has(version.service_name())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadFileRequest {
    pub remote_path: String,
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
}

impl UploadFileRequest {
    pub fn new(remote_path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            remote_path: remote_path.into(),
            contents: contents.into(),
        }
    }
}

/// Where an uploaded file ended up, as reported by the remote.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub full_path: String,
    pub hash: String,
    pub length: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadFileRequest {
    pub remote_path: String,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_order_oldest_first() {
        assert!(ScriptServiceVersion::V1 < ScriptServiceVersion::V2);
        assert!(ScriptServiceVersion::V2 < ScriptServiceVersion::V3Alpha);
        assert_eq!(
            ScriptServiceVersion::ALL.iter().max(),
            Some(&ScriptServiceVersion::V3Alpha)
        );
    }

    #[test]
    fn service_names_map_back_to_versions() {
        for version in ScriptServiceVersion::ALL {
            assert_eq!(
                ScriptServiceVersion::from_service_name(version.service_name()),
                Some(version)
            );
        }
        assert_eq!(ScriptServiceVersion::from_service_name("FileTransferService"), None);
    }

    #[test]
    fn script_file_contents_travel_as_base64() {
        let file = ScriptFile::new("payload.bin", vec![0u8, 159, 146, 150]);
        let json = serde_json::to_value(&file).expect("serialize");
        assert_eq!(json["contents"], "AJ+Slg==");

        let back: ScriptFile = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, file);
    }

    #[test]
    fn upload_request_carries_contents_as_base64() {
        let request = UploadFileRequest::new("/work/package.zip", b"Hello".to_vec());
        let json = serde_json::to_value(&request).expect("serialize");
        assert_eq!(json["remote_path"], "/work/package.zip");
        assert_eq!(json["contents"], "SGVsbG8=");
    }

    #[test]
    fn status_response_defaults_missing_logs_and_exit_code() {
        let json = r#"{"ticket":"t-1","state":"running","next_log_sequence":4}"#;
        let resp: ScriptStatusResponse = serde_json::from_str(json).expect("deserialize");
        assert_eq!(resp.ticket, ScriptTicket::new("t-1"));
        assert_eq!(resp.state, ProcessState::Running);
        assert_eq!(resp.exit_code, None);
        assert!(resp.logs.is_empty());
    }

    #[test]
    fn v3_alpha_start_keeps_wait_duration_but_v2_drops_it() {
        let command = ExecuteScriptCommand {
            script_ticket: ScriptTicket::new("abc"),
            task_id: "ServerTasks-1".to_string(),
            script_body: "echo hello".to_string(),
            arguments: vec!["--verbose".to_string()],
            files: Vec::new(),
            additional_scripts: BTreeMap::new(),
            isolation: ScriptIsolationConfiguration::default(),
            duration_to_wait_for_script_to_finish_ms: Some(2_000),
        };

        assert_eq!(command.to_v2().duration_to_wait_for_script_to_finish_ms, None);
        let v3 = command.to_v3_alpha();
        assert_eq!(v3.duration_to_wait_for_script_to_finish_ms, Some(2_000));
        assert_eq!(v3.script_ticket, command.script_ticket);
        assert_eq!(command.to_v1().arguments, command.arguments);
    }

    #[test]
    fn capabilities_report_supported_versions() {
        let caps = CapabilitiesResponse::new([SCRIPT_SERVICE_V1, SCRIPT_SERVICE_V2]);
        assert!(caps.supports(ScriptServiceVersion::V2));
        assert!(!caps.supports(ScriptServiceVersion::V3Alpha));
        assert!(CapabilitiesResponse::v1_only().supports(ScriptServiceVersion::V1));
    }

    #[test]
    fn generated_tickets_are_unique() {
        assert_ne!(ScriptTicket::generate(), ScriptTicket::generate());
    }
}
