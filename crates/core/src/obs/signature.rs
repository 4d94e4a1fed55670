//! SSH signature authentication.
//!
//! A build service that accepts SSH keys answers an unauthenticated request
//! with `401` and a `WWW-Authenticate: Signature realm="...",headers="(created)"`
//! challenge. The client signs `(created): <unix time>` with `ssh-keygen -Y
//! sign`, using the realm as namespace, and repeats the request with a
//! `Signature` authorization header.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::RemoteError;

const DEFAULT_REALM: &str = "Use your developer account";
const BEGIN_SIGNATURE: &str = "-----BEGIN SSH SIGNATURE-----";
const END_SIGNATURE: &str = "-----END SSH SIGNATURE-----";

/// A `Signature` challenge from a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureChallenge {
    pub realm: String,
    pub headers: Vec<String>,
}

impl SignatureChallenge {
    /// Parse one `WWW-Authenticate` value. Returns `None` for other schemes
    /// and for challenges that ask for anything besides `(created)`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let scheme_end = value.find(char::is_whitespace).unwrap_or(value.len());
        if !value[..scheme_end].eq_ignore_ascii_case("signature") {
            return None;
        }

        let mut realm = DEFAULT_REALM.to_string();
        let mut headers = vec!["(created)".to_string()];
        for (key, val) in auth_params(&value[scheme_end..]) {
            match key.as_str() {
                "realm" => realm = val,
                "headers" => headers = val.split_whitespace().map(str::to_string).collect(),
                _ => {}
            }
        }
        if headers != ["(created)"] {
            return None;
        }
        Some(Self { realm, headers })
    }
}

/// `key="value"` pairs of an auth challenge, keys lowercased.
fn auth_params(s: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = s.trim();
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();
        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            rest = quoted.get(end + 1..).unwrap_or("");
            quoted[..end].to_string()
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };
        params.push((key, value));
        rest = rest.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

/// The `Authorization` value answering a `(created)` challenge.
pub fn authorization_header(key_id: &str, created: i64, signature: &str) -> String {
    format!(
        r#"Signature keyId="{}",algorithm="ssh",headers="(created)",created={},signature="{}""#,
        key_id, created, signature
    )
}

/// Base64 body of an armored SSH signature, header and footer removed.
pub fn armored_signature(output: &str) -> Option<String> {
    let mut lines = output
        .lines()
        .map(str::trim)
        .skip_while(|line| *line != BEGIN_SIGNATURE);
    lines.next()?;
    let mut body = String::new();
    for line in lines {
        if line == END_SIGNATURE {
            return (!body.is_empty()).then_some(body);
        }
        body.push_str(line);
    }
    None
}

/// Signs challenges with a private key through `ssh-keygen`.
#[derive(Clone)]
pub struct SshSigner {
    key: PathBuf,
    passphrase: String,
}

impl std::fmt::Debug for SshSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSigner")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl SshSigner {
    pub fn new(key: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            passphrase: passphrase.into(),
        }
    }

    /// Sign `challenge` for `key_id` at `created` and return the header value.
    pub async fn authorize(
        &self,
        key_id: &str,
        challenge: &SignatureChallenge,
        created: i64,
    ) -> Result<String, RemoteError> {
        let data = format!("(created): {}", created);
        let signature = self.sign(&challenge.realm, &data).await?;
        debug!(key = %self.key.display(), realm = %challenge.realm, "signed challenge");
        Ok(authorization_header(key_id, created, &signature))
    }

    async fn sign(&self, namespace: &str, data: &str) -> Result<String, RemoteError> {
        let mut cmd = Command::new("ssh-keygen");
        cmd.args(["-Y", "sign", "-q", "-n", namespace, "-f"])
            .arg(&self.key);
        if !self.passphrase.is_empty() {
            cmd.arg("-P").arg(&self.passphrase);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| RemoteError::Auth(format!("cannot run ssh-keygen: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(data.as_bytes())
                .await
                .map_err(|e| RemoteError::Auth(format!("cannot write to ssh-keygen: {}", e)))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RemoteError::Auth(format!("ssh-keygen did not finish: {}", e)))?;
        if !output.status.success() {
            return Err(RemoteError::Auth(format!(
                "ssh-keygen failed for {}: {}",
                self.key.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        armored_signature(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| RemoteError::Auth("ssh-keygen printed no signature".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = SignatureChallenge::parse(
            r#"Signature realm="Use your developer account",headers="(created)""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "Use your developer account");
        assert_eq!(challenge.headers, vec!["(created)"]);

        let spaced = SignatureChallenge::parse(r#"signature realm = "build", headers="(created)""#)
            .unwrap();
        assert_eq!(spaced.realm, "build");
    }

    #[test]
    fn test_parse_challenge_rejects_other_schemes() {
        assert_eq!(SignatureChallenge::parse(r#"Basic realm="obs""#), None);
        assert_eq!(
            SignatureChallenge::parse(r#"Signature realm="obs",headers="(created) digest""#),
            None
        );
        assert_eq!(SignatureChallenge::parse(""), None);
    }

    #[test]
    fn test_authorization_header() {
        assert_eq!(
            authorization_header("alice", 1700000000, "U1NIU0lH"),
            r#"Signature keyId="alice",algorithm="ssh",headers="(created)",created=1700000000,signature="U1NIU0lH""#
        );
    }

    #[test]
    fn test_armored_signature() {
        let output = "-----BEGIN SSH SIGNATURE-----\nU1NIU0lH\nAAAAAQ==\n-----END SSH SIGNATURE-----\n";
        assert_eq!(armored_signature(output).as_deref(), Some("U1NIU0lHAAAAAQ=="));
        assert_eq!(armored_signature("Enter passphrase:\n"), None);
        assert_eq!(
            armored_signature("-----BEGIN SSH SIGNATURE-----\nU1NI\n"),
            None
        );
    }

    #[tokio::test]
    async fn test_sign_with_missing_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let signer = SshSigner::new(dir.path().join("no_such_key"), "");
        let challenge = SignatureChallenge::parse(r#"Signature realm="obs",headers="(created)""#)
            .unwrap();
        let err = signer.authorize("alice", &challenge, 1).await.unwrap_err();
        assert!(matches!(err, RemoteError::Auth(_)), "{err}");
    }
}
