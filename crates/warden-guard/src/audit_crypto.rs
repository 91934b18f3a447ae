//! Signing and encryption primitives for audit events.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::AuditError;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// HMAC-SHA256 signer for canonical event bytes.
#[derive(Clone)]
pub struct EventSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for EventSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventSigner(..)")
    }
}

impl EventSigner {
    /// Create a signer from a shared secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, AuditError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(AuditError::Encryption("signing secret is empty".into()));
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(secret)
            .map_err(|e| AuditError::Encryption(e.to_string()))?;
        Ok(Self { mac })
    }

    /// Hex-encoded HMAC over the message.
    pub fn sign(&self, message: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a hex signature.
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> bool {
        let expected = match hex::decode(signature_hex) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let mut mac = self.mac.clone();
        mac.update(message);
        mac.verify_slice(&expected).is_ok()
    }
}

/// SHA-256 link hash over an event's canonical bytes and signature.
pub fn chain_hash(canonical: &[u8], signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical);
    hasher.update(signature.as_bytes());
    hex::encode(hasher.finalize())
}

/// ChaCha20-Poly1305 cipher for event details.
///
/// Output is base64 of `nonce || ciphertext`.
#[derive(Clone)]
pub struct DetailCipher {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for DetailCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DetailCipher(..)")
    }
}

impl DetailCipher {
    /// Cipher from a raw 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Cipher from a hex-encoded 32-byte key.
    pub fn from_hex(key_hex: &str) -> Result<Self, AuditError> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| AuditError::Encryption(format!("invalid key hex: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AuditError::Encryption("key must be 32 bytes".into()))?;
        Ok(Self::new(&key))
    }

    /// Encrypt and encode.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, AuditError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| AuditError::Encryption("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decode and decrypt.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, AuditError> {
        let raw = BASE64
            .decode(sealed)
            .map_err(|e| AuditError::Encryption(format!("invalid base64: {e}")))?;
        if raw.len() < NONCE_LEN {
            return Err(AuditError::Encryption("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuditError::Encryption("decryption failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let signer = EventSigner::new(b"secret").unwrap();
        let sig = signer.sign(b"payload");
        assert!(signer.verify(b"payload", &sig));
        assert!(!signer.verify(b"payload2", &sig));
        assert!(!signer.verify(b"payload", "not-hex"));

        let other = EventSigner::new(b"other").unwrap();
        assert!(!other.verify(b"payload", &sig));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(EventSigner::new(b"").is_err());
    }

    #[test]
    fn test_seal_open() {
        let cipher = DetailCipher::new(&[7u8; 32]);
        let sealed = cipher.seal(b"{\"email\":\"a@b.c\"}").unwrap();
        assert!(!sealed.contains("email"));
        assert_eq!(cipher.open(&sealed).unwrap(), b"{\"email\":\"a@b.c\"}");

        let wrong = DetailCipher::new(&[8u8; 32]);
        assert!(wrong.open(&sealed).is_err());
        assert!(cipher.open("AAAA").is_err());
    }

    #[test]
    fn test_key_from_hex() {
        assert!(DetailCipher::from_hex(&"ab".repeat(32)).is_ok());
        assert!(DetailCipher::from_hex("abcd").is_err());
        assert!(DetailCipher::from_hex("zz").is_err());
    }

    #[test]
    fn test_chain_hash_depends_on_signature() {
        assert_ne!(chain_hash(b"x", "a"), chain_hash(b"x", "b"));
    }
}
