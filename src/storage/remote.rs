use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

use crate::cli::config::RemoteSettings;
use crate::storage::registry::{RemoteConnection, RemoteConnector};
use crate::storage::StorageError;

/// A remote storage destination, `ssh://[user@]host[:port]/path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    /// Directory on the remote host results are stored under
    pub path: String,
}

impl RemoteHost {
    pub fn from_url(url: &Url) -> Result<Self, StorageError> {
        if !matches!(url.scheme(), "ssh" | "scp") {
            return Err(StorageError::InvalidDestination(url.to_string()));
        }
        let host = url.host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| StorageError::InvalidDestination(url.to_string()))?;

        let path = match url.path() {
            "" | "/" => ".".to_string(),
            path => path.to_string(),
        };

        Ok(Self {
            user: Some(url.username()).filter(|u| !u.is_empty()).map(str::to_string),
            host: host.to_string(),
            port: url.port(),
            path,
        })
    }

    /// Identifies the connection: one per user, host and port
    pub fn key(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.target(), port),
            None => self.target(),
        }
    }

    /// `user@host` as understood by ssh and scp
    pub fn target(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

/// Opens OpenSSH control-master connections
pub struct SshConnector {
    ssh_binary: String,
    scp_binary: String,
    control_dir: PathBuf,
}

impl SshConnector {
    pub fn new(settings: &RemoteSettings) -> Self {
        Self {
            ssh_binary: settings.ssh_binary.clone(),
            scp_binary: settings.scp_binary.clone(),
            control_dir: settings.control_dir.clone(),
        }
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(&self, host: &RemoteHost) -> Result<Box<dyn RemoteConnection>, StorageError> {
        tokio::fs::create_dir_all(&self.control_dir).await
            .map_err(|e| StorageError::io(format!("Failed to create {}", self.control_dir.display()), e))?;

        let socket = self.control_dir.join(format!("{}.sock", host.key().replace(['@', ':', '/'], "_")));

        let mut cmd = Command::new(&self.ssh_binary);
        cmd.arg("-M")
            .arg("-S").arg(&socket)
            .arg("-o").arg("BatchMode=yes")
            .arg("-o").arg("ControlPersist=yes")
            .arg("-fN");
        if let Some(port) = host.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(host.target());

        // The backgrounded master keeps inherited pipes open, so only wait on the status
        let status = cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| StorageError::io("Failed to open SSH connection", e))?;
        if !status.success() {
            return Err(StorageError::Remote(format!(
                "Failed to open SSH connection to {}: ssh exited with {}",
                host.key(),
                status
            )));
        }
        info!("Opened SSH connection to {}", host.key());

        Ok(Box::new(SshConnection {
            host: host.clone(),
            socket,
            ssh_binary: self.ssh_binary.clone(),
            scp_binary: self.scp_binary.clone(),
        }))
    }
}

/// A live control-master connection; transfers are multiplexed over it
pub struct SshConnection {
    host: RemoteHost,
    socket: PathBuf,
    ssh_binary: String,
    scp_binary: String,
}

impl SshConnection {
    fn ssh(&self) -> Command {
        let mut cmd = Command::new(&self.ssh_binary);
        cmd.arg("-S").arg(&self.socket);
        if let Some(port) = self.host.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd
    }
}

#[async_trait]
impl RemoteConnection for SshConnection {
    async fn upload(&self, local_dir: &Path, remote_parent: &str) -> Result<(), StorageError> {
        let mut mkdir = self.ssh();
        mkdir.arg(self.host.target()).arg("mkdir").arg("-p").arg(remote_parent);
        run(&mut mkdir, "create remote directory").await?;

        let mut scp = Command::new(&self.scp_binary);
        scp.arg("-o").arg(format!("ControlPath={}", self.socket.display()))
            .arg("-r");
        if let Some(port) = self.host.port {
            scp.arg("-P").arg(port.to_string());
        }
        scp.arg(local_dir)
            .arg(format!("{}:{}/", self.host.target(), remote_parent));
        run(&mut scp, "copy results").await?;

        debug!("Uploaded {} to {}:{}", local_dir.display(), self.host.key(), remote_parent);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut cmd = self.ssh();
        cmd.arg("-O").arg("exit").arg(self.host.target());
        run(&mut cmd, "close SSH connection").await?;
        Ok(())
    }
}

async fn run(cmd: &mut Command, what: &str) -> Result<Output, StorageError> {
    let output = cmd.kill_on_drop(true)
        .output()
        .await
        .map_err(|e| StorageError::io(format!("Failed to {}", what), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StorageError::Remote(format!("Failed to {}: {}", what, stderr.trim())));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(raw: &str) -> RemoteHost {
        RemoteHost::from_url(&Url::parse(raw).unwrap()).unwrap()
    }

    #[test]
    fn test_host_parts() {
        let remote = host("ssh://crawler@storage.example.com:2222/srv/results");
        assert_eq!(remote.user.as_deref(), Some("crawler"));
        assert_eq!(remote.target(), "crawler@storage.example.com");
        assert_eq!(remote.key(), "crawler@storage.example.com:2222");
        assert_eq!(remote.path, "/srv/results");
    }

    #[test]
    fn test_empty_path_means_home_directory() {
        let remote = host("ssh://storage.example.com");
        assert_eq!(remote.user, None);
        assert_eq!(remote.path, ".");
        assert_eq!(remote.key(), "storage.example.com");
    }

    #[tokio::test]
    async fn test_failing_command_is_a_remote_error() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo refused >&2; exit 255");

        match run(&mut cmd, "open SSH connection").await {
            Err(StorageError::Remote(message)) => assert!(message.contains("refused")),
            other => panic!("unexpected result: {:?}", other.map(|o| o.status)),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_io_error() {
        let settings = RemoteSettings {
            ssh_binary: "/nonexistent/ssh".to_string(),
            control_dir: std::env::temp_dir().join("crawler-ssh-test"),
            ..RemoteSettings::default()
        };
        let connector = SshConnector::new(&settings);

        let result = connector.connect(&host("ssh://storage.example.com/srv")).await;
        assert!(matches!(result, Err(StorageError::Io { .. })));
    }
}
