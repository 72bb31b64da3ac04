use base64::Engine;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::SigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use sha2::Sha256;

use crate::errors::{AgentError, AgentResult};

/// Per-request RSA-PSS signer. Holds the private key for the process
/// lifetime; loading a bad key is fatal at startup, never at request time.
pub struct Signer {
    access_key_id: String,
    signing_key: SigningKey<Sha256>,
}

pub struct AuthHeaders {
    pub access_key_id: String,
    pub signature_b64: String,
    pub timestamp_ms: i64,
}

impl Signer {
    /// Loads a PKCS#8 PEM private key from disk. Failure here is `Fatal`:
    /// the process must not start without a working signer.
    pub fn load(access_key_id: impl Into<String>, private_key_path: &str) -> AgentResult<Self> {
        let pem = std::fs::read_to_string(private_key_path)
            .map_err(|e| AgentError::Fatal(format!("reading private key {}: {}", private_key_path, e)))?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| AgentError::Fatal(format!("parsing private key {}: {}", private_key_path, e)))?;
        let signing_key = SigningKey::<Sha256>::new(private_key);
        Ok(Self { access_key_id: access_key_id.into(), signing_key })
    }

    /// Signs `ascii(ts_ms) ‖ METHOD ‖ path` with RSA-PSS/MGF1-SHA-256 and
    /// maximum salt length, fresh every call. Never caches a signature.
    pub fn sign(&self, method: &str, path: &str, now_ms: i64) -> AuthHeaders {
        let message = format!("{}{}{}", now_ms, method, path);
        let mut rng = rand::thread_rng();
        let signature = self.signing_key.sign_with_rng(&mut rng, message.as_bytes());
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature.to_bytes());
        AuthHeaders {
            access_key_id: self.access_key_id.clone(),
            signature_b64,
            timestamp_ms: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;

    fn test_signer() -> Signer {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pem = key.to_pkcs8_pem(Default::default()).unwrap();
        let path = std::env::temp_dir().join(format!("signer-test-{}.pem", uuid::Uuid::new_v4()));
        std::fs::write(&path, pem.as_bytes()).unwrap();
        let signer = Signer::load("test-key", path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();
        signer
    }

    #[test]
    fn signs_with_fresh_nonce_every_call() {
        let signer = test_signer();
        let a = signer.sign("GET", "/markets", 1_700_000_000_000);
        let b = signer.sign("GET", "/markets", 1_700_000_000_000);
        // PSS padding is randomized, so repeated signs over identical input differ.
        assert_ne!(a.signature_b64, b.signature_b64);
        assert_eq!(a.access_key_id, "test-key");
        assert_eq!(a.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn different_paths_produce_different_signatures() {
        let signer = test_signer();
        let a = signer.sign("GET", "/markets", 1_700_000_000_000);
        let b = signer.sign("GET", "/portfolio/balance", 1_700_000_000_000);
        assert_ne!(a.signature_b64, b.signature_b64);
    }

    #[test]
    fn missing_key_file_is_fatal() {
        let result = Signer::load("k", "/nonexistent/path/to/key.pem");
        assert!(matches!(result, Err(AgentError::Fatal(_))));
    }
}
