use scriptd_protocol::{
    ExecuteScriptCommand, ScriptFile, ScriptIsolationConfiguration, ScriptIsolationLevel,
    ScriptTicket, ScriptType,
};
use std::collections::BTreeMap;
use std::time::Duration;

/// Builds an [`ExecuteScriptCommand`] with a freshly generated ticket.
#[derive(Debug, Clone)]
pub struct ExecuteScriptCommandBuilder {
    task_id: String,
    script_body: String,
    arguments: Vec<String>,
    files: Vec<ScriptFile>,
    additional_scripts: BTreeMap<ScriptType, String>,
    isolation: ScriptIsolationConfiguration,
    wait_for_script_to_finish: Option<Duration>,
    ticket: Option<ScriptTicket>,
}

impl ExecuteScriptCommandBuilder {
    pub fn new(task_id: impl Into<String>, script_body: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            script_body: script_body.into(),
            arguments: Vec::new(),
            files: Vec::new(),
            additional_scripts: BTreeMap::new(),
            isolation: ScriptIsolationConfiguration::default(),
            wait_for_script_to_finish: None,
            ticket: None,
        }
    }

    pub fn argument(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self
    }

    pub fn file(mut self, file: ScriptFile) -> Self {
        self.files.push(file);
        self
    }

    /// Replaces the body used when the remote runs `script_type` instead of the default shell.
    pub fn additional_script(mut self, script_type: ScriptType, body: impl Into<String>) -> Self {
        self.additional_scripts.insert(script_type, body.into());
        self
    }

    pub fn isolation(mut self, isolation_level: ScriptIsolationLevel) -> Self {
        self.isolation.isolation_level = isolation_level;
        self
    }

    pub fn mutex(mut self, name: impl Into<String>, timeout: Option<Duration>) -> Self {
        self.isolation.mutex_name = name.into();
        self.isolation.mutex_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Only honoured by V3Alpha remotes.
    pub fn wait_for_script_to_finish(mut self, duration: Duration) -> Self {
        self.wait_for_script_to_finish = Some(duration);
        self
    }

    /// Reuses a ticket, e.g. when resuming a script started by an earlier process.
    pub fn ticket(mut self, ticket: ScriptTicket) -> Self {
        self.ticket = Some(ticket);
        self
    }

    pub fn build(self) -> ExecuteScriptCommand {
        ExecuteScriptCommand {
            script_ticket: self.ticket.unwrap_or_else(ScriptTicket::generate),
            task_id: self.task_id,
            script_body: self.script_body,
            arguments: self.arguments,
            files: self.files,
            additional_scripts: self.additional_scripts,
            isolation: self.isolation,
            duration_to_wait_for_script_to_finish_ms: self
                .wait_for_script_to_finish
                .map(|d| d.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_generate_ticket_and_no_isolation() {
        let command = ExecuteScriptCommandBuilder::new("task-1", "echo hi").build();
        assert_eq!(command.task_id, "task-1");
        assert_eq!(command.script_body, "echo hi");
        assert!(!command.script_ticket.as_str().is_empty());
        assert_eq!(command.isolation, ScriptIsolationConfiguration::default());
        assert_eq!(command.duration_to_wait_for_script_to_finish_ms, None);
    }

    #[test]
    fn each_build_gets_its_own_ticket() {
        let builder = ExecuteScriptCommandBuilder::new("task-1", "echo hi");
        let a = builder.clone().build();
        let b = builder.build();
        assert_ne!(a.script_ticket, b.script_ticket);
    }

    #[test]
    fn carries_every_setting() {
        let command = ExecuteScriptCommandBuilder::new("task-2", "./deploy.sh")
            .argument("--env")
            .arguments(["prod", "--verbose"])
            .file(ScriptFile::new("package.zip", vec![1, 2, 3]))
            .additional_script(ScriptType::Python, "print('hi')")
            .isolation(ScriptIsolationLevel::FullIsolation)
            .mutex("deploy", Some(Duration::from_secs(30)))
            .wait_for_script_to_finish(Duration::from_secs(2))
            .ticket(ScriptTicket::new("fixed"))
            .build();

        assert_eq!(command.script_ticket, ScriptTicket::new("fixed"));
        assert_eq!(command.arguments, vec!["--env", "prod", "--verbose"]);
        assert_eq!(command.files.len(), 1);
        assert_eq!(
            command.additional_scripts.get(&ScriptType::Python).map(String::as_str),
            Some("print('hi')")
        );
        assert_eq!(command.isolation.isolation_level, ScriptIsolationLevel::FullIsolation);
        assert_eq!(command.isolation.mutex_name, "deploy");
        assert_eq!(command.isolation.mutex_timeout_ms, Some(30_000));
        assert_eq!(command.duration_to_wait_for_script_to_finish_ms, Some(2_000));
        assert_eq!(command.to_v2().duration_to_wait_for_script_to_finish_ms, None);
        assert_eq!(
            command.to_v3_alpha().duration_to_wait_for_script_to_finish_ms,
            Some(2_000)
        );
    }
}
