use base64::{engine::general_purpose, Engine as _};
use russh_keys::{key, PublicKeyBase64};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("could not read authorized key '{path}'; {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed authorized key; {0}")]
    Malformed(String),
}

/// A public key in SSH wire format together with the algorithm name it claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyBlob {
    pub algorithm: String,
    pub blob: Vec<u8>,
}

impl PublicKeyBlob {
    /// OpenSSH style `SHA256:` fingerprint.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!("SHA256:{}", general_purpose::STANDARD_NO_PAD.encode(digest))
    }
}

impl From<&key::PublicKey> for PublicKeyBlob {
    fn from(key: &key::PublicKey) -> Self {
        Self {
            algorithm: key_type(key).to_string(),
            blob: key.public_key_bytes(),
        }
    }
}

/// The key type as written in `authorized_keys`. RSA keys report their signature hash as their name.
fn key_type(key: &key::PublicKey) -> &'static str {
    match key.name() {
        "rsa-sha2-256" | "rsa-sha2-512" => "ssh-rsa",
        name => name,
    }
}

/// Parses the first key out of OpenSSH `authorized_keys` formatted text.
///
/// Options before the key type and the trailing comment are skipped.
pub fn parse_authorized_key(contents: &str) -> Result<PublicKeyBlob, AuthError> {
    let line = contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or_else(|| AuthError::Malformed("no key found".into()))?;

    let tokens: Vec<&str> = line.split_whitespace().collect();

    let (declared, key) = tokens
        .windows(2)
        .find_map(|pair| {
            russh_keys::parse_public_key_base64(pair[1])
                .ok()
                .map(|key| (pair[0], key))
        })
        .ok_or_else(|| AuthError::Malformed("no base64 encoded public key found".into()))?;

    let key = PublicKeyBlob::from(&key);
    if key.algorithm != declared {
        return Err(AuthError::Malformed(format!(
            "key type '{declared}' does not match encoded key type '{}'",
            key.algorithm
        )));
    }

    Ok(key)
}

/// The grant handed out for an accepted key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key: PublicKeyBlob,
    pub extensions: BTreeMap<String, String>,
}

impl Identity {
    fn new(key: PublicKeyBlob) -> Self {
        Self {
            key,
            extensions: BTreeMap::from([("user".to_string(), crate::git::RECEIVE_USER.to_string())]),
        }
    }

    pub fn user(&self) -> &str {
        self.extensions
            .get("user")
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Checks presented keys against the single authorized key on disk.
///
/// The file is read on every attempt so a rotated key takes effect without a restart.
#[derive(Debug, Clone)]
pub struct AuthGate {
    authorized_key_path: PathBuf,
}

impl AuthGate {
    pub fn new(authorized_key_path: &Path) -> Self {
        Self {
            authorized_key_path: authorized_key_path.to_path_buf(),
        }
    }

    async fn authorized_key(&self) -> Result<PublicKeyBlob, AuthError> {
        let contents = tokio::fs::read_to_string(&self.authorized_key_path)
            .await
            .map_err(|source| AuthError::Unreadable {
                path: self.authorized_key_path.clone(),
                source,
            })?;

        parse_authorized_key(&contents)
    }

    pub async fn authenticate(&self, presented: &PublicKeyBlob) -> Option<Identity> {
        let authorized = match self.authorized_key().await {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "Rejecting all keys; authorized key is unusable");
                return None;
            }
        };

        if authorized.algorithm != presented.algorithm {
            debug!(
                presented = %presented.algorithm,
                authorized = %authorized.algorithm,
                "Rejected key; algorithm mismatch"
            );
            return None;
        }

        if !bool::from(authorized.blob.ct_eq(&presented.blob)) {
            debug!(fingerprint = %presented.fingerprint(), "Rejected key; not the authorized key");
            return None;
        }

        Some(Identity::new(presented.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const BUILDER_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAoQU9q3BdiyWHqNEQwwRQ43rbBBGM3aeAAsZ7h42+8G builder@example.com";
    const BUILDER_FINGERPRINT: &str = "SHA256:vvfPQkxdN+yAq8p4w4a8UdrvXRpfcQgayw/Wd+FC5E8";
    const OTHER_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIO8gDDl/zB8nd8Y42cc2FMVI9nOXlQ6tSQ7uLfdwu1JW other@example.com";

    fn presented(line: &str) -> PublicKeyBlob {
        parse_authorized_key(line).unwrap()
    }

    struct TestHarness {
        gate: AuthGate,
        _key_file: tempfile::NamedTempFile,
    }

    impl TestHarness {
        fn new(contents: &str) -> Self {
            let mut key_file = tempfile::NamedTempFile::new().unwrap();
            key_file.write_all(contents.as_bytes()).unwrap();

            Self {
                gate: AuthGate::new(key_file.path()),
                _key_file: key_file,
            }
        }
    }

    #[tokio::test]
    async fn identical_key_is_granted() {
        let harness = TestHarness::new(BUILDER_KEY);
        let key = presented(BUILDER_KEY);

        let identity = harness.gate.authenticate(&key).await.unwrap();

        assert_eq!(identity.user(), "builder");
        assert_eq!(identity.key, key);
    }

    #[tokio::test]
    async fn other_key_is_rejected() {
        let harness = TestHarness::new(BUILDER_KEY);

        assert!(harness
            .gate
            .authenticate(&presented(OTHER_KEY))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn single_bit_flip_is_rejected() {
        let harness = TestHarness::new(BUILDER_KEY);

        let mut flipped = presented(BUILDER_KEY);
        let last = flipped.blob.len() - 1;
        flipped.blob[last] ^= 0x01;

        assert!(harness.gate.authenticate(&flipped).await.is_none());
    }

    #[tokio::test]
    async fn algorithm_mismatch_is_rejected() {
        let harness = TestHarness::new(BUILDER_KEY);

        let presented = PublicKeyBlob {
            algorithm: "ssh-rsa".into(),
            blob: presented(BUILDER_KEY).blob,
        };

        assert!(harness.gate.authenticate(&presented).await.is_none());
    }

    #[tokio::test]
    async fn unreadable_authorized_key_rejects_everyone() {
        let gate = AuthGate::new(Path::new("/nonexistent/builder-key.pub"));

        assert!(gate.authenticate(&presented(BUILDER_KEY)).await.is_none());
    }

    #[tokio::test]
    async fn malformed_authorized_key_rejects_everyone() {
        let harness = TestHarness::new("ssh-ed25519 not-base64!!\n");

        assert!(harness
            .gate
            .authenticate(&presented(BUILDER_KEY))
            .await
            .is_none());
    }

    #[test]
    fn authorized_key_options_and_comments_are_skipped() {
        let contents = format!("# deploy key\n\nno-pty,no-port-forwarding {BUILDER_KEY}\n{OTHER_KEY}\n");

        let key = parse_authorized_key(&contents).unwrap();

        assert_eq!(key.algorithm, "ssh-ed25519");
        assert_eq!(key, presented(BUILDER_KEY));
    }

    #[test]
    fn declared_type_must_match_encoded_type() {
        let line = BUILDER_KEY.replacen("ssh-ed25519", "ssh-rsa", 1);

        assert!(matches!(
            parse_authorized_key(&line),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn fingerprint_matches_ssh_keygen() {
        assert_eq!(presented(BUILDER_KEY).fingerprint(), BUILDER_FINGERPRINT);
        assert_ne!(presented(OTHER_KEY).fingerprint(), BUILDER_FINGERPRINT);
    }
}
