use std::path::PathBuf;

use base64::Engine;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ReceiverError;

/// Request shape of the agent's eBPF object fetch.
#[derive(Debug, Clone, Default)]
pub struct EbpfFileRequest {
    pub agent_version: String,
    pub os_version: String,
    pub os_distribution: String,
    pub arch: String,
    pub kernel_version: String,
}

impl EbpfFileRequest {
    /// The v1 layout keys on distribution and architecture; older agents
    /// only report an os version.
    fn is_v1(&self) -> bool {
        !self.os_distribution.is_empty() && !self.arch.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct CenterFileResponse {
    #[serde(rename = "fileName", default)]
    file_name: String,
    #[serde(rename = "fileContent", default)]
    file_content: String,
}

/// Serves kernel-specific eBPF objects to agents: local disk first, the
/// center server as fallback, caching fetched objects on disk.
pub struct EbpfFileServer {
    center_server: String,
    root_dir: PathBuf,
    client: reqwest::Client,
}

impl EbpfFileServer {
    pub fn new(center_server: &str, root_dir: impl Into<PathBuf>) -> EbpfFileServer {
        EbpfFileServer {
            center_server: center_server.to_string(),
            root_dir: root_dir.into(),
            client: reqwest::Client::new(),
        }
    }

    fn local_path(&self, request: &EbpfFileRequest) -> PathBuf {
        let mut path = self.root_dir.join(&request.agent_version);
        if request.is_v1() {
            path = path.join(&request.os_distribution).join(&request.arch);
        } else {
            path = path.join(&request.os_version);
        }
        path.join(format!("{}.o", request.kernel_version))
    }

    pub async fn get_file(
        &self,
        request: &EbpfFileRequest,
    ) -> Result<(String, Vec<u8>), ReceiverError> {
        let file_name = format!("{}.o", request.kernel_version);
        let path = self.local_path(request);
        match tokio::fs::read(&path).await {
            Ok(content) => {
                info!(path = %path.display(), "serve cached ebpf object");
                return Ok((file_name, content));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let content = self.fetch_from_center(request).await?;
        if content.is_empty() {
            return Err(ReceiverError::Other(format!(
                "no ebpf object found for kernel {}",
                request.kernel_version
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &content).await?;
        info!(path = %path.display(), "fetched ebpf object from center");
        Ok((file_name, content))
    }

    async fn fetch_from_center(
        &self,
        request: &EbpfFileRequest,
    ) -> Result<Vec<u8>, ReceiverError> {
        if self.center_server.is_empty() {
            return Ok(Vec::new());
        }
        // The v1 endpoint is preferred; fall back to the legacy one when the
        // center has no v1 entry for this kernel.
        if request.is_v1() {
            let content = self.fetch(&self.v1_url(request)).await?;
            if !content.is_empty() {
                return Ok(content);
            }
        }
        self.fetch(&self.legacy_url(request)).await
    }

    fn v1_url(&self, request: &EbpfFileRequest) -> String {
        format!(
            "http://{}/ebpffile/v1/download?agentVersion={}&osDistribution={}&arch={}&kernelVersion={}",
            self.center_server,
            request.agent_version,
            request.os_distribution,
            request.arch,
            request.kernel_version
        )
    }

    fn legacy_url(&self, request: &EbpfFileRequest) -> String {
        format!(
            "http://{}/ebpffile/download?agentVersion={}&osVersion={}&kernelVersion={}",
            self.center_server, request.agent_version, request.os_version, request.kernel_version
        )
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ReceiverError> {
        let response: CenterFileResponse = self.client.get(url).send().await?.json().await?;
        if response.file_content.is_empty() {
            return Ok(Vec::new());
        }
        match base64::engine::general_purpose::STANDARD.decode(&response.file_content) {
            Ok(bytes) => Ok(bytes),
            Err(err) => {
                warn!(file = response.file_name, %err, "bad base64 object from center");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(v1: bool) -> EbpfFileRequest {
        EbpfFileRequest {
            agent_version: "v1.2.0".to_string(),
            os_version: "ubuntu-22.04".to_string(),
            os_distribution: if v1 { "ubuntu".to_string() } else { String::new() },
            arch: if v1 { "x86_64".to_string() } else { String::new() },
            kernel_version: "5.15.0-89-generic".to_string(),
        }
    }

    #[test]
    fn test_layout_paths() {
        let server = EbpfFileServer::new("", "/opt");
        assert_eq!(
            server.local_path(&request(true)),
            PathBuf::from("/opt/v1.2.0/ubuntu/x86_64/5.15.0-89-generic.o")
        );
        assert_eq!(
            server.local_path(&request(false)),
            PathBuf::from("/opt/v1.2.0/ubuntu-22.04/5.15.0-89-generic.o")
        );
    }

    #[tokio::test]
    async fn test_serves_cached_object() {
        let dir = tempfile::tempdir().unwrap();
        let server = EbpfFileServer::new("", dir.path());
        let request = request(true);
        let path = server.local_path(&request);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, b"elf-object").await.unwrap();

        let (name, content) = server.get_file(&request).await.unwrap();
        assert_eq!(name, "5.15.0-89-generic.o");
        assert_eq!(content, b"elf-object");
    }

    #[tokio::test]
    async fn test_missing_object_errors() {
        let dir = tempfile::tempdir().unwrap();
        let server = EbpfFileServer::new("", dir.path());
        let err = server.get_file(&request(true)).await.unwrap_err();
        assert!(err.to_string().contains("no ebpf object"));
    }
}
