//! Secret handling: authenticated-at-rest encryption for account credentials
//! and deterministic fingerprinting for inbound API keys.

use aes::Aes256;
use aes::cipher::{KeyIvInit, block_padding::Pkcs7};
use base64::Engine;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut};
use rand::RngCore;
use scrypt::Params;
use sha2::{Digest, Sha256};

use crate::error::RelayError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// SHA-256(cleartext || process secret), lowercase hex — the deterministic
/// fingerprint an inbound API key is looked up by.
pub fn fingerprint_key(cleartext: &str, process_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cleartext.as_bytes());
    hasher.update(process_secret.as_bytes());
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// AES-256-CBC secret cipher. The key is derived once via `scrypt` from the
/// process secret and then held read-only for the process lifetime.
pub struct SecretCipher {
    key: [u8; KEY_LEN],
}

impl SecretCipher {
    /// Derives the key from `process_secret`. Expensive (scrypt); call once
    /// and share the result rather than re-deriving per request.
    pub fn derive(process_secret: &str) -> Self {
        // Fixed salt: the process secret itself is the only per-deployment
        // entropy source available to the core; a random salt would need to
        // be persisted somewhere the core does not own.
        let params = Params::new(14, 8, 1, KEY_LEN).expect("valid scrypt params");
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(process_secret.as_bytes(), b"relay-core-secret-cipher", &params, &mut key)
            .expect("scrypt key derivation");
        Self { key }
    }

    /// Encrypts `plaintext`, returning `base64(iv || ciphertext)`.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let enc = Aes256CbcEnc::new(&self.key.into(), &iv.into());
        let ciphertext = enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        base64::engine::general_purpose::STANDARD.encode(out)
    }

    /// Inverse of [`Self::encrypt`].
    pub fn decrypt(&self, encoded: &str) -> Result<String, RelayError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| RelayError::Repository(format!("malformed ciphertext: {e}")))?;
        if raw.len() < IV_LEN {
            return Err(RelayError::Repository("ciphertext shorter than IV".into()));
        }
        let (iv, ciphertext) = raw.split_at(IV_LEN);

        let dec = Aes256CbcDec::new(self.key.as_slice().into(), iv.into());
        let plaintext = dec
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| RelayError::Repository(format!("decryption failed: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| RelayError::Repository(format!("decrypted secret not utf-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_is_identity() {
        let cipher = SecretCipher::derive("process-secret-for-tests");
        for plaintext in ["sk-ant-abc123", "", "a much longer api key value here", "🔑"] {
            let encrypted = cipher.encrypt(plaintext);
            assert_eq!(cipher.decrypt(&encrypted).unwrap(), plaintext);
        }
    }

    #[test]
    fn encryption_is_nondeterministic_but_decrypts_equal() {
        let cipher = SecretCipher::derive("seed");
        let a = cipher.encrypt("same-plaintext");
        let b = cipher.encrypt("same-plaintext");
        assert_ne!(a, b, "random IV should vary ciphertext");
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }

    #[test]
    fn fingerprint_is_deterministic_and_hex32bytes() {
        let fp1 = fingerprint_key("sk-live-xyz", "secret");
        let fp2 = fingerprint_key("sk-live-xyz", "secret");
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);
        assert!(fp1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn fingerprint_differs_by_secret() {
        let fp1 = fingerprint_key("sk-live-xyz", "secret-a");
        let fp2 = fingerprint_key("sk-live-xyz", "secret-b");
        assert_ne!(fp1, fp2);
    }
}
