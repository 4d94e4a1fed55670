//! Asynchronous HTTP client for the build-service source API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode, Url};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::parser::{build_filelist, build_package_meta, parse_directory, parse_entry_names};
use super::signature::{SignatureChallenge, SshSigner};
use super::BuildService;
use crate::errors::{MetadataError, RemoteError};
use crate::models::{Directory, FileEntry, Revision};

/// Attempts per request when the failure is retryable.
const MAX_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Build-service API client using basic or SSH signature authentication.
#[derive(Clone)]
pub struct ObsClient {
    http: reqwest::Client,
    url: Url,
    username: String,
    password: String,
    signer: Option<SshSigner>,
    /// Last `Signature` authorization, shared by clones.
    signature: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for ObsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObsClient")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .field("ssh", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl ObsClient {
    pub fn new(
        url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        verify_ssl: bool,
    ) -> Result<Self, RemoteError> {
        let parsed = Url::parse(url).map_err(|e| RemoteError::Transport {
            url: url.to_string(),
            detail: format!("invalid API URL: {}", e),
            retryable: false,
        })?;
        if parsed.cannot_be_a_base() {
            return Err(RemoteError::Transport {
                url: url.to_string(),
                detail: "API URL cannot be a base URL".into(),
                retryable: false,
            });
        }
        if !verify_ssl {
            warn!(url, "TLS certificate verification disabled");
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("obsgit/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .map_err(|e| RemoteError::Transport {
                url: url.to_string(),
                detail: e.to_string(),
                retryable: false,
            })?;
        let client = Self {
            http,
            url: parsed,
            username: username.into(),
            password: password.into(),
            signer: None,
            signature: Arc::new(Mutex::new(None)),
        };
        info!(url = %client.url, username = %client.username, "created ObsClient");
        Ok(client)
    }

    /// Authenticate with an SSH key instead of basic auth. The password
    /// becomes the key passphrase.
    pub fn with_ssh_key(mut self, key: impl Into<PathBuf>) -> Self {
        let signer = SshSigner::new(key, self.password.clone());
        debug!(signer = ?signer, "using SSH signature authentication");
        self.signer = Some(signer);
        self
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// `<api>/source/<segments...>`, each segment percent-encoded.
    fn source_url(&self, segments: &[&str]) -> Url {
        let mut url = self.url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("source").extend(segments);
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, RemoteError> {
        let mut attempt = 0;
        let mut signed = false;
        loop {
            attempt += 1;
            let mut req = self.http.request(method.clone(), url.clone()).query(query);
            req = match self.signer {
                Some(_) => match self.signature.lock().await.clone() {
                    Some(authorization) => req.header(AUTHORIZATION, authorization),
                    None => req,
                },
                None => req.basic_auth(&self.username, Some(&self.password)),
            };
            if let Some(ref body) = body {
                req = req.body(body.clone());
            }

            debug!(%method, url = %url, attempt, "sending request");
            let result = match req.send().await {
                Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED && !signed => {
                    match (&self.signer, signature_challenge(&resp)) {
                        (Some(signer), Some(challenge)) => {
                            let created = chrono::Utc::now().timestamp();
                            let authorization =
                                signer.authorize(&self.username, &challenge, created).await?;
                            *self.signature.lock().await = Some(authorization);
                            signed = true;
                            attempt -= 1;
                            continue;
                        }
                        _ => check_status(resp),
                    }
                }
                Ok(resp) => check_status(resp),
                Err(e) => Err(RemoteError::Transport {
                    url: url.to_string(),
                    detail: e.to_string(),
                    retryable: e.is_timeout() || e.is_connect(),
                }),
            };
            match result {
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    warn!(url = %url, attempt, error = %e, "request failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    async fn get_bytes(&self, url: Url, query: &[(&str, &str)]) -> Result<Vec<u8>, RemoteError> {
        let resp = self.send(Method::GET, url.clone(), query, None).await?;
        let bytes = resp.bytes().await.map_err(|e| RemoteError::Transport {
            url: url.to_string(),
            detail: e.to_string(),
            retryable: false,
        })?;
        Ok(bytes.to_vec())
    }

    async fn get_text(&self, url: Url, query: &[(&str, &str)]) -> Result<String, RemoteError> {
        let bytes = self.get_bytes(url, query).await?;
        String::from_utf8(bytes)
            .map_err(|e| RemoteError::Response(MetadataError::malformed("response", e.to_string())))
    }

    async fn get_optional(&self, url: Url) -> Result<Option<Vec<u8>>, RemoteError> {
        match self.get_bytes(url, &[]).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, url: Url) -> Result<bool, RemoteError> {
        match self.send(Method::HEAD, url, &[], None).await {
            Ok(_) => Ok(true),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// The first `Signature` challenge of a `401` answer.
fn signature_challenge(resp: &reqwest::Response) -> Option<SignatureChallenge> {
    resp.headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(SignatureChallenge::parse)
}

fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound(url));
    }
    Err(RemoteError::Http {
        status: status.as_u16(),
        url,
    })
}

#[async_trait]
impl BuildService for ObsClient {
    #[instrument(skip(self))]
    async fn project_exists(&self, project: &str) -> Result<bool, RemoteError> {
        self.exists(self.source_url(&[project])).await
    }

    #[instrument(skip(self))]
    async fn package_exists(&self, project: &str, package: &str) -> Result<bool, RemoteError> {
        self.exists(self.source_url(&[project, package])).await
    }

    #[instrument(skip(self))]
    async fn list_packages(&self, project: &str) -> Result<Vec<String>, RemoteError> {
        let body = self.get_text(self.source_url(&[project]), &[]).await?;
        let packages = parse_entry_names(&body)?;
        debug!(count = packages.len(), "listed packages");
        Ok(packages)
    }

    #[instrument(skip(self))]
    async fn get_project_meta(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        self.get_optional(self.source_url(&[project, name])).await
    }

    #[instrument(skip(self))]
    async fn get_package_meta(
        &self,
        project: &str,
        package: &str,
        name: &str,
    ) -> Result<Option<Vec<u8>>, RemoteError> {
        self.get_optional(self.source_url(&[project, package, name]))
            .await
    }

    #[instrument(skip(self))]
    async fn get_file_list(
        &self,
        project: &str,
        package: &str,
        rev: &Revision,
    ) -> Result<Directory, RemoteError> {
        let body = self
            .get_text(self.source_url(&[project, package]), &[("rev", rev.as_query())])
            .await?;
        Ok(parse_directory(&body)?)
    }

    #[instrument(skip(self))]
    async fn get_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        rev: &Revision,
    ) -> Result<Vec<u8>, RemoteError> {
        self.get_bytes(
            self.source_url(&[project, package, name]),
            &[("rev", rev.as_query())],
        )
        .await
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put_project_meta(
        &self,
        project: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.send(Method::PUT, self.source_url(&[project, name]), &[], Some(data))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put_package_meta(
        &self,
        project: &str,
        package: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.send(
            Method::PUT,
            self.source_url(&[project, package, name]),
            &[],
            Some(data),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.send(
            Method::PUT,
            self.source_url(&[project, package, name]),
            &[("rev", "repository")],
            Some(data),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_file(
        &self,
        project: &str,
        package: &str,
        name: &str,
    ) -> Result<(), RemoteError> {
        self.send(
            Method::DELETE,
            self.source_url(&[project, package, name]),
            &[("rev", "repository")],
            None,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_package(&self, project: &str, package: &str) -> Result<(), RemoteError> {
        self.send(Method::DELETE, self.source_url(&[project, package]), &[], None)
            .await?;
        info!(project, package, "deleted remote package");
        Ok(())
    }

    #[instrument(skip(self, entries), fields(count = entries.len()))]
    async fn commit_filelist(
        &self,
        project: &str,
        package: &str,
        entries: &[FileEntry],
        comment: &str,
    ) -> Result<(), RemoteError> {
        let body = build_filelist(entries).into_bytes();
        self.send(
            Method::POST,
            self.source_url(&[project, package]),
            &[
                ("cmd", "commitfilelist"),
                ("user", self.username.as_str()),
                ("comment", comment),
            ],
            Some(body),
        )
        .await?;
        debug!(project, package, "committed file list");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_package(
        &self,
        project: &str,
        package: &str,
        disabled: bool,
    ) -> Result<(), RemoteError> {
        let meta = build_package_meta(project, package, disabled).into_bytes();
        self.put_package_meta(project, package, "_meta", meta).await?;
        info!(project, package, disabled, "created remote package");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_construction() {
        let client = ObsClient::new("https://api.example.org", "alice", "pw", true).unwrap();
        assert_eq!(client.url(), "https://api.example.org/");
        assert_eq!(client.username(), "alice");
    }

    #[test]
    fn test_ssh_key_replaces_basic_auth() {
        let client = ObsClient::new("https://api.example.org", "alice", "secret", true)
            .unwrap()
            .with_ssh_key("/home/alice/.ssh/id_ed25519");
        assert!(client.signer.is_some());
        let shown = format!("{:?}", client);
        assert!(shown.contains("ssh: true"));
        assert!(!shown.contains("secret"));
        assert!(!format!("{:?}", client.signer).contains("secret"));
    }

    #[test]
    fn test_invalid_url_is_not_retryable() {
        let err = ObsClient::new("not a url", "alice", "pw", true).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_source_url_encodes_segments() {
        let client = ObsClient::new("https://api.example.org/obs/", "a", "b", true).unwrap();
        let url = client.source_url(&["home:alice", "my pkg", "_meta"]);
        assert_eq!(
            url.as_str(),
            "https://api.example.org/obs/source/home:alice/my%20pkg/_meta"
        );
    }

    #[test]
    fn test_debug_hides_password() {
        let client = ObsClient::new("https://api.example.org", "alice", "s3cret", true).unwrap();
        assert!(!format!("{:?}", client).contains("s3cret"));
    }
}
