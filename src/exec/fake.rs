//! Scripted in-memory runner for orchestration tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CommandOutput, CommandRunner, Privilege};
use crate::errors::TransportError;

/// Records every command and file write; answers commands from a rule list.
///
/// Rules are `(needle, output)` pairs checked in order: the first rule whose
/// needle is a substring of the command wins. Unmatched commands succeed with
/// empty output.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<(String, CommandOutput)>>,
    pub commands: Mutex<Vec<String>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub uploads: Mutex<Vec<(String, String)>>,
    fail_writes_under: Mutex<Option<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, needle: &str, exit_code: i32, stdout: &str, stderr: &str) -> &Self {
        self.rules.lock().unwrap().push((
            needle.to_string(),
            CommandOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    pub fn fail(&self, needle: &str, stderr: &str) -> &Self {
        self.respond(needle, 1, "", stderr)
    }

    /// Make every `write_file` under `prefix` fail with a transfer error.
    pub fn fail_writes_under(&self, prefix: &str) {
        *self.fail_writes_under.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    fn describe(&self) -> String {
        "fake".to_string()
    }

    async fn run(
        &self,
        command: &str,
        _privilege: Privilege,
    ) -> Result<CommandOutput, TransportError> {
        self.commands.lock().unwrap().push(command.to_string());
        let rules = self.rules.lock().unwrap();
        Ok(rules
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        _privilege: Privilege,
    ) -> Result<(), TransportError> {
        if let Some(prefix) = self.fail_writes_under.lock().unwrap().as_deref() {
            if path.starts_with(prefix) {
                return Err(TransportError::Transfer {
                    path: path.to_string(),
                    message: "Read-only file system".to_string(),
                });
            }
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.uploads
            .lock()
            .unwrap()
            .push((local.display().to_string(), remote.to_string()));
        Ok(())
    }

    async fn upload_dir(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.upload_file(local, remote).await
    }
}
