use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ENCRYPTION_KEY must decode to 32 bytes (base64 or hex)")]
    BadKey,
    #[error("sealed value is malformed")]
    BadCiphertext,
    #[error("decryption failed")]
    DecryptFailed,
}

/// Seals upstream credentials and revealable api-key plaintext with
/// AES-256-GCM. Wire format: `base64(nonce || ciphertext)`.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
    digest_key: [u8; 32],
}

impl CredentialCipher {
    pub fn from_key_material(material: &str) -> Result<Self, CryptoError> {
        let key_bytes = decode_key(material)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let digest_key = blake3::derive_key("autorouter api-key digest v1", &key_bytes);
        Ok(Self { cipher, digest_key })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::DecryptFailed)?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CryptoError> {
        let raw = BASE64
            .decode(sealed.trim())
            .map_err(|_| CryptoError::BadCiphertext)?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::BadCiphertext);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::BadCiphertext)
    }

    /// Stable keyed digest of a downstream api key; the lookup column and
    /// the constant-time verification value are the same hex string.
    pub fn key_digest(&self, secret: &str) -> String {
        blake3::keyed_hash(&self.digest_key, secret.as_bytes())
            .to_hex()
            .to_string()
    }
}

fn decode_key(material: &str) -> Result<[u8; 32], CryptoError> {
    let material = material.trim();

    if material.len() == 64
        && material.chars().all(|c| c.is_ascii_hexdigit())
        && let Ok(bytes) = hex_decode(material)
    {
        return bytes.try_into().map_err(|_| CryptoError::BadKey);
    }

    let decoded = BASE64.decode(material).map_err(|_| CryptoError::BadKey)?;
    decoded.try_into().map_err(|_| CryptoError::BadKey)
}

fn hex_decode(input: &str) -> Result<Vec<u8>, CryptoError> {
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).map_err(|_| CryptoError::BadKey))
        .collect()
}
