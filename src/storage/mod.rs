pub mod analytics;
pub mod backoff;
pub mod local;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod stage;

use std::path::PathBuf;
use thiserror::Error;
use url::Url;

// Re-export common types
pub use backoff::Backoff;
pub use queue::TaskQueue;
pub use registry::ConnectionRegistry;
pub use remote::{RemoteHost, SshConnector};
pub use stage::{StorageStage, StorageTally};

/// File names inside a stored result directory
pub const RESOURCE_METADATA_FILE: &str = "resource_metadata.json";
pub const SCRIPT_METADATA_FILE: &str = "script_metadata.json";

/// Errors reported by the storage backends
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Output directory already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("{what} requested but {path} does not exist")]
    MissingArtifacts { what: &'static str, path: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize metadata: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote storage error: {0}")]
    Remote(String),

    #[error("Invalid output destination '{0}'")]
    InvalidDestination(String),

    #[error("Storage cancelled")]
    Cancelled,
}

impl StorageError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }
}

/// Where the results of a task go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A directory on the local filesystem
    Local(PathBuf),

    /// A directory on a remote host reached over SSH
    Remote(RemoteHost),
}

impl Destination {
    /// Classify an output path: anything with a host component is remote
    ///
    /// `file://` URLs name local directories.
    pub fn parse(output_path: &str) -> Result<Self, StorageError> {
        match Url::parse(output_path) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(Self::Local)
                .map_err(|_| StorageError::InvalidDestination(output_path.to_string())),
            Ok(url) if url.host_str().map_or(false, |h| !h.is_empty()) => {
                RemoteHost::from_url(&url).map(Self::Remote)
            }
            _ => Ok(Self::Local(PathBuf::from(output_path))),
        }
    }
}

/// Directory name for results of a URL: its host, with ':' replaced by '_'
pub fn dir_name_from_url(raw: &str) -> Result<String, StorageError> {
    let url = Url::parse(raw).map_err(|_| StorageError::InvalidDestination(raw.to_string()))?;
    let host = url.host_str().ok_or_else(|| StorageError::InvalidDestination(raw.to_string()))?;

    let name = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    Ok(name.replace(':', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_destinations() {
        assert_eq!(Destination::parse("results").unwrap(), Destination::Local(PathBuf::from("results")));
        assert_eq!(Destination::parse("/data/out").unwrap(), Destination::Local(PathBuf::from("/data/out")));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_url_destination() {
        assert_eq!(Destination::parse("file:///data/out").unwrap(), Destination::Local(PathBuf::from("/data/out")));
        assert!(matches!(
            Destination::parse("file://storage.example.com/data/out"),
            Err(StorageError::InvalidDestination(_))
        ));
    }

    #[test]
    fn test_remote_destination() {
        let Destination::Remote(host) = Destination::parse("ssh://crawler@storage.example.com:2222/srv/results").unwrap() else {
            panic!("expected a remote destination");
        };
        assert_eq!(host.host, "storage.example.com");
        assert_eq!(host.port, Some(2222));
        assert_eq!(host.path, "/srv/results");
    }

    #[test]
    fn test_unsupported_remote_scheme() {
        assert!(matches!(
            Destination::parse("http://example.com/out"),
            Err(StorageError::InvalidDestination(_))
        ));
    }

    #[test]
    fn test_dir_name_from_url() {
        assert_eq!(dir_name_from_url("https://example.com/page").unwrap(), "example.com");
        assert_eq!(dir_name_from_url("http://example.com:8080/").unwrap(), "example.com_8080");
        assert_eq!(dir_name_from_url("http://[::1]/").unwrap(), "[__1]");
        assert!(dir_name_from_url("not a url").is_err());
    }
}
