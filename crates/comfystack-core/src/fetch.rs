//! HTTP download of model assets.
//!
//! Files are streamed to `<dest>.part` and renamed into place only once the
//! body has been fully written, so an interrupted download never leaves a
//! file the prober would count as present.

use crate::collaborators::AssetFetcher;
use crate::error::CollaboratorError;
use crate::request::SecretToken;
use crate::stage::AssetSpec;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Downloads assets with a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("comfystack/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpFetcher { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        HttpFetcher { client }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(
        &self,
        asset: &AssetSpec,
        token: Option<&SecretToken>,
    ) -> Result<u64, CollaboratorError> {
        if let Some(parent) = asset.dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut request = self.client.get(&asset.url);
        if let Some(token) = token {
            request = request.bearer_auth(token.expose());
        }
        debug!(url = %asset.url, "requesting asset");
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(CollaboratorError::Http(format!(
                "{} returned {}",
                asset.url,
                response.status()
            )));
        }

        let part = partial_path(&asset.dest);
        let mut file = fs::File::create(&part).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        drop(file);

        fs::rename(&part, &asset.dest).await?;
        info!(file = %asset.repo_path, bytes = written, "downloaded");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelGroup;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response and hands back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    fn asset(url: String, dest: PathBuf) -> AssetSpec {
        AssetSpec {
            group: ModelGroup::Vae,
            repo_path: "split_files/vae/wan2.2_vae.safetensors".to_string(),
            url,
            dest,
        }
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/m/vae/a.safetensors")),
            PathBuf::from("/m/vae/a.safetensors.part")
        );
    }

    #[tokio::test]
    async fn test_fetch_writes_file_and_sends_token() {
        let (base, server) = serve_once("200 OK", "weights").await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("vae").join("wan2.2_vae.safetensors");
        let fetcher = HttpFetcher::new().unwrap();
        let token = SecretToken::new("hf_secret");

        let bytes = fetcher
            .fetch(&asset(format!("{base}/file"), dest.clone()), token.as_ref())
            .await
            .unwrap();

        assert_eq!(bytes, 7);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "weights");
        assert!(!partial_path(&dest).exists());
        let raw = server.await.unwrap().to_ascii_lowercase();
        assert!(raw.contains("authorization: bearer hf_secret"));
    }

    #[tokio::test]
    async fn test_error_status_leaves_no_file() {
        let (base, _server) = serve_once("404 Not Found", "").await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("missing.safetensors");
        let fetcher = HttpFetcher::new().unwrap();

        let err = fetcher
            .fetch(&asset(format!("{base}/file"), dest.clone()), None)
            .await
            .unwrap_err();

        assert!(matches!(err, CollaboratorError::Http(_)));
        assert!(!dest.exists());
    }
}
