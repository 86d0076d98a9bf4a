//! Shell command execution and output caching

use std::collections::HashMap;
use std::sync::Arc;

use tokio::process::Command;
use tracing::trace;

use crate::{GatewayError, Result};

/// Exit code and combined output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub code: i32,
    pub output: String,
}

/// Runs free-text commands.
#[async_trait::async_trait]
pub trait Shell: Send + Sync + 'static {
    /// Run a command to completion. `Err` means it could not be run at all; a
    /// non-zero exit is reported through [`ShellOutput::code`].
    async fn exec(&self, command: &str) -> Result<ShellOutput>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct SystemShell;

#[async_trait::async_trait]
impl Shell for SystemShell {
    async fn exec(&self, command: &str) -> Result<ShellOutput> {
        trace!("exec: {}", command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| GatewayError::io_error(format!("exec {command}"), e))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        // Killed by a signal has no exit code.
        Ok(ShellOutput { code: output.status.code().unwrap_or(-1), output: text })
    }
}

/// Last successful output per key.
pub struct OutputCache {
    shell: Arc<dyn Shell>,
    outputs: HashMap<String, String>,
}

impl OutputCache {
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self { shell, outputs: HashMap::new() }
    }

    pub fn shell(&self) -> &Arc<dyn Shell> {
        &self.shell
    }

    /// Output of `command`, served from the cache under `key` unless `refresh`
    /// is set. Only zero exits are cached; a non-zero exit surfaces as
    /// [`GatewayError::Shell`] and a command that cannot run as the error from
    /// the shell.
    pub async fn get(&mut self, key: &str, command: &str, refresh: bool) -> Result<String> {
        if refresh {
            self.outputs.remove(key);
        }

        if let Some(output) = self.outputs.get(key) {
            return Ok(output.clone());
        }

        let result = self.shell.exec(command).await?;
        if result.code == 0 {
            self.outputs.insert(key.to_string(), result.output.clone());
            Ok(result.output)
        } else {
            Err(GatewayError::Shell {
                command: command.to_string(),
                code: result.code,
                output: result.output,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedShell;

    #[tokio::test]
    async fn refresh_replaces_cached_output() {
        let shell = Arc::new(ScriptedShell::new());
        let mut cache = OutputCache::new(shell.clone());

        shell.respond("test", 0, "first");
        assert_eq!(cache.get("test", "test", true).await.unwrap(), "first");

        shell.respond("test", 0, "second");
        assert_eq!(cache.get("test", "test", true).await.unwrap(), "second");

        shell.respond("test", 0, "third");
        assert_eq!(cache.get("test", "test", false).await.unwrap(), "second");

        assert_eq!(shell.snapshot(), vec!["test", "test"]);
    }

    #[tokio::test]
    async fn failed_commands_are_not_cached() {
        let shell = Arc::new(ScriptedShell::new());
        let mut cache = OutputCache::new(shell.clone());

        shell.respond("test", 1, "first");
        match cache.get("test", "test", true).await {
            Err(GatewayError::Shell { code, output, .. }) => {
                assert_eq!(code, 1);
                assert_eq!(output, "first");
            }
            other => panic!("expected shell error, got {other:?}"),
        }

        shell.respond("test", 0, "second");
        assert_eq!(cache.get("test", "test", false).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn commands_that_cannot_run_surface_as_errors() {
        let shell = Arc::new(ScriptedShell::new());
        let mut cache = OutputCache::new(shell);

        let err = cache.get("pppstats", "pppstats", true).await.unwrap_err();
        assert!(err.to_string().contains("no response found: pppstats"));
    }

    #[tokio::test]
    async fn system_shell_reports_exit_codes() {
        let shell = SystemShell;
        let ok = shell.exec("echo hello").await.unwrap();
        assert_eq!(ok, ShellOutput { code: 0, output: "hello\n".into() });

        let failed = shell.exec("exit 3").await.unwrap();
        assert_eq!(failed.code, 3);
    }
}
