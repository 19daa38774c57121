use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::config::RemoteConfig;
use crate::maintenance::backend::{BackendError, RemoteExecutor, RemoteOutput};

/// Restarts the database service over `ssh` with a fixed command template.
#[derive(Debug, Clone)]
pub struct SshRemote {
    binary: String,
    user: String,
    service: String,
    connect_timeout_s: u32,
}

impl SshRemote {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            binary: config.ssh_binary.clone(),
            user: config.ssh_user.clone(),
            service: config.service.clone(),
            connect_timeout_s: config.connect_timeout_s,
        }
    }

    /// Arguments passed to the ssh binary for `host`.
    pub fn arguments(&self, host: &str) -> Vec<String> {
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout_s),
            format!("{}@{}", self.user, host),
            "sudo".into(),
            "systemctl".into(),
            "restart".into(),
            self.service.clone(),
        ]
    }
}

#[async_trait]
impl RemoteExecutor for SshRemote {
    #[instrument(skip(self))]
    async fn restart_service(&self, host: &str) -> Result<RemoteOutput, BackendError> {
        info!(service = %self.service, "issuing remote restart");
        let output = Command::new(&self.binary)
            .args(self.arguments(host))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| BackendError::new(format!("failed to start {}: {err}", self.binary)))?;

        Ok(RemoteOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
