// src/gpg.rs

//! GPG verification of Debian repository signatures.
//!
//! `InRelease` files are clear-signed; the legacy `Release` file comes with
//! a detached armored signature in `Release.gpg`. Verification uses
//! sequoia-openpgp. The keyring starts out empty (or restored from an
//! optional Swift cache container) and fetches unknown public keys by their
//! 64-bit key ID from a configurable list of keyserver URL patterns,
//! falling back from one server to the next.

use sequoia_openpgp as openpgp;

use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::{Cert, Packet, PacketPile};
use sha2::{Digest, Sha256};
use std::sync::{Arc, LazyLock, RwLock};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::sources::GetConditions;
use crate::swift::{GetOutcome, ObjectStore, UploadHeaders};

/// First line of a clear-signed message
pub const CLEARSIGN_HEADER: &[u8] = b"-----BEGIN PGP SIGNED MESSAGE-----";

const SIGNATURE_HEADER: &str = "-----BEGIN PGP SIGNATURE-----";
const SIGNATURE_FOOTER: &str = "-----END PGP SIGNATURE-----";

/// Keyservers consulted when no others are configured
const DEFAULT_KEYSERVER_URL_PATTERNS: &[&str] = &[
    "https://keyserver.ubuntu.com/pks/lookup?search=0x{keyid}&options=mr&op=get",
    "https://pgp.mit.edu/pks/lookup?search=0x{keyid}&options=mr&op=get",
];

/// Keyserver "no such key" replies are plain text rather than an HTTP error
static NO_PUBLIC_KEY_FOUND_RX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"no(t)?.*found").expect("static regex"));

/// Optional persistent key cache in a Swift container
pub struct KeyCache {
    pub store: Arc<dyn ObjectStore>,
    pub container: String,
}

/// A keyring that discovers public keys on demand.
///
/// Reads (signature checks) take the shared lock; a fetch of an unknown key
/// upgrades to the exclusive lock briefly.
pub struct GpgKeyring {
    certs: RwLock<Vec<Cert>>,
    policy: StandardPolicy<'static>,
    keyserver_url_patterns: Vec<String>,
    http: reqwest::Client,
    cache: Option<KeyCache>,
}

impl GpgKeyring {
    /// Create a keyring, restoring previously discovered keys from the
    /// cache container if one is configured
    pub async fn new(
        keyserver_url_patterns: Vec<String>,
        http: reqwest::Client,
        cache: Option<KeyCache>,
    ) -> Result<Self> {
        let keyserver_url_patterns = if keyserver_url_patterns.is_empty() {
            DEFAULT_KEYSERVER_URL_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            keyserver_url_patterns
        };

        let keyring = Self {
            certs: RwLock::new(Vec::new()),
            policy: StandardPolicy::new(),
            keyserver_url_patterns,
            http,
            cache,
        };
        keyring.restore_cached_keys().await?;
        Ok(keyring)
    }

    async fn restore_cached_keys(&self) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        cache.store.create_container(&cache.container).await?;

        info!("restoring GPG public keys from {}", cache.container);
        let entries = cache.store.list_objects(&cache.container, "", None).await?;
        let mut restored = Vec::new();
        for entry in entries {
            let outcome = cache
                .store
                .get_object(&cache.container, &entry.name, &GetConditions::default())
                .await?;
            let GetOutcome::Found { mut body, .. } = outcome else {
                continue;
            };
            let mut data = Vec::new();
            body.read_to_end(&mut data)
                .await
                .map_err(|e| Error::Io(format!("cannot read cached key {}: {e}", entry.name)))?;
            match Cert::from_bytes(&data) {
                // don't restore expired keys
                Ok(cert) => {
                    let alive = cert
                        .with_policy(&self.policy, None)
                        .and_then(|valid| valid.alive())
                        .is_ok();
                    if alive {
                        debug!("restored {}/{}", cache.container, entry.name);
                        restored.push(cert);
                    } else {
                        warn!("ignoring expired cached key {}", entry.name);
                    }
                }
                Err(e) => warn!("ignoring cached key {}: {}", entry.name, e),
            }
        }
        self.certs
            .write()
            .expect("keyring lock poisoned")
            .extend(restored);
        Ok(())
    }

    /// Verify a clear-signed message and return the embedded plaintext
    pub async fn verify_clearsigned(&self, data: &[u8]) -> Result<Vec<u8>> {
        let (message, signature) = split_clearsigned(data)?;
        self.verify(&canonical_text(&message), &signature).await?;
        Ok(message)
    }

    /// Verify a message against its detached armored signature
    pub async fn verify_detached(&self, message: &[u8], armored_signature: &[u8]) -> Result<()> {
        self.verify(message, armored_signature).await
    }

    async fn verify(&self, message: &[u8], signature_bytes: &[u8]) -> Result<()> {
        let pile = PacketPile::from_bytes(signature_bytes)
            .map_err(|e| Error::Parse(format!("cannot parse signature: {e}")))?;

        let mut signatures = Vec::new();
        for packet in pile.descendants() {
            if let Packet::Signature(signature) = packet {
                signatures.push(signature.clone());
            }
        }
        if signatures.is_empty() {
            return Err(Error::GpgVerification(
                "signature block contains no signature packets".to_string(),
            ));
        }

        // fetch issuer keys that the keyring does not hold yet
        for signature in &signatures {
            for issuer in signature.issuers() {
                self.ensure_key_available(issuer).await?;
            }
        }

        let certs = self.certs.read().expect("keyring lock poisoned");
        for signature in &signatures {
            for cert in certs.iter() {
                for key in cert.keys().with_policy(&self.policy, None) {
                    if key.for_signing() && signature.verify_message(key.key(), message).is_ok() {
                        return Ok(());
                    }
                }
            }
        }

        Err(Error::GpgVerification(
            "no valid signature found for any known public key".to_string(),
        ))
    }

    /// Make sure the keyring holds the key with the given ID, fetching it
    /// from the keyservers if necessary
    async fn ensure_key_available(&self, key_id: &openpgp::KeyID) -> Result<()> {
        {
            let certs = self.certs.read().expect("keyring lock poisoned");
            let known = certs
                .iter()
                .any(|cert| cert.keys().any(|key| &key.key().keyid() == key_id));
            if known {
                return Ok(());
            }
        }

        let key_bytes = self.fetch_public_key(&key_id.to_hex()).await?;
        let cert = Cert::from_bytes(&key_bytes)
            .map_err(|e| Error::Parse(format!("cannot parse public key {key_id}: {e}")))?;
        self.certs
            .write()
            .expect("keyring lock poisoned")
            .push(cert);
        Ok(())
    }

    /// Download a public key by ID, trying each configured keyserver in
    /// turn, and store it in the cache container for future runs
    async fn fetch_public_key(&self, key_id: &str) -> Result<Vec<u8>> {
        info!("retrieving public key for ID {:?}", key_id);

        let server_count = self.keyserver_url_patterns.len();
        for (index, pattern) in self.keyserver_url_patterns.iter().enumerate() {
            let url = pattern.replace("{keyid}", key_id);
            match self.fetch_key_from_server(&url).await {
                Ok(key_bytes) => {
                    self.cache_public_key(&key_bytes).await;
                    return Ok(key_bytes);
                }
                Err(e) if index + 1 == server_count => {
                    error!(
                        "could not retrieve public key for ID {:?} from {}: {} (no more servers to try)",
                        key_id, url, e
                    );
                }
                Err(e) => {
                    error!(
                        "could not retrieve public key for ID {:?} from {}: {} (will try next server)",
                        key_id, url, e
                    );
                }
            }
        }

        Err(Error::GpgVerification(format!(
            "no such public key: {key_id}"
        )))
    }

    async fn fetch_key_from_server(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Download(format!("GET failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Download(format!(
                "GET returned status {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Download(format!("GET failed: {e}")))?;

        let text = String::from_utf8_lossy(&body).to_lowercase();
        if NO_PUBLIC_KEY_FOUND_RX.is_match(&text) {
            return Err(Error::Download("no such public key".to_string()));
        }
        Ok(body.to_vec())
    }

    /// Best-effort upload of a freshly discovered key to the cache container
    async fn cache_public_key(&self, key_bytes: &[u8]) {
        let Some(cache) = &self.cache else {
            return;
        };
        let object_name = format!("{:x}.asc", Sha256::digest(key_bytes));
        let body = Box::new(std::io::Cursor::new(key_bytes.to_vec()));
        if let Err(e) = cache
            .store
            .put_object(&cache.container, &object_name, &UploadHeaders::default(), body)
            .await
        {
            warn!("could not cache public key in {}: {}", cache.container, e);
        }
    }
}

/// Split a clear-signed document into the embedded message and the armored
/// signature block.
///
/// The message is returned with `\n` line endings and dash-escaping
/// removed, ready for control-file parsing.
pub fn split_clearsigned(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let text = std::str::from_utf8(data)
        .map_err(|e| Error::Parse(format!("clear-signed message is not valid UTF-8: {e}")))?;

    #[derive(PartialEq)]
    enum State {
        BeforeMessage,
        ArmorHeaders,
        Message,
        Signature,
    }

    let mut state = State::BeforeMessage;
    let mut message_lines: Vec<&str> = Vec::new();
    let mut signature_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        match state {
            State::BeforeMessage => {
                if line.trim_end() == "-----BEGIN PGP SIGNED MESSAGE-----" {
                    state = State::ArmorHeaders;
                }
            }
            State::ArmorHeaders => {
                // "Hash: SHA256" etc., terminated by an empty line
                if line.trim().is_empty() {
                    state = State::Message;
                }
            }
            State::Message => {
                if line.trim_end() == SIGNATURE_HEADER {
                    signature_lines.push(line);
                    state = State::Signature;
                } else {
                    // undo dash-escaping
                    message_lines.push(line.strip_prefix("- ").unwrap_or(line));
                }
            }
            State::Signature => {
                signature_lines.push(line);
                if line.trim_end() == SIGNATURE_FOOTER {
                    break;
                }
            }
        }
    }

    if state != State::Signature {
        return Err(Error::Parse(
            "malformed clear-signed message: signature block not found".to_string(),
        ));
    }

    let mut message = message_lines.join("\n");
    message.push('\n');
    let mut signature = signature_lines.join("\n");
    signature.push('\n');
    Ok((message.into_bytes(), signature.into_bytes()))
}

/// Canonical text form used for clearsign digests: trailing whitespace
/// stripped, CRLF line endings, no trailing line break
fn canonical_text(message: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(message);
    text.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\r\n")
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEARSIGNED: &str = "\
-----BEGIN PGP SIGNED MESSAGE-----
Hash: SHA256

Origin: Ubuntu
Components: main
- -- dash-escaped line
-----BEGIN PGP SIGNATURE-----

iQEzBAEBCAAdFiEE
-----END PGP SIGNATURE-----
";

    #[test]
    fn test_split_clearsigned() {
        let (message, signature) = split_clearsigned(CLEARSIGNED.as_bytes()).unwrap();
        let message = String::from_utf8(message).unwrap();
        assert!(message.starts_with("Origin: Ubuntu\n"));
        assert!(message.contains("-- dash-escaped line"));
        assert!(!message.contains("- --"));

        let signature = String::from_utf8(signature).unwrap();
        assert!(signature.starts_with(SIGNATURE_HEADER));
        assert!(signature.trim_end().ends_with(SIGNATURE_FOOTER));
    }

    #[test]
    fn test_split_clearsigned_rejects_plain_text() {
        assert!(split_clearsigned(b"Origin: Ubuntu\n").is_err());
        assert!(split_clearsigned(b"-----BEGIN PGP SIGNED MESSAGE-----\nHash: x\n\nbody\n").is_err());
    }

    #[test]
    fn test_canonical_text() {
        let canonical = canonical_text(b"a  \nb\n");
        assert_eq!(canonical, b"a\r\nb");
    }
}
