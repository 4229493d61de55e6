//! At-rest envelope encryption for chat message bodies (§4.9, supplemented
//! feature 2). Mirrors `encryption_service.py`: message bodies are
//! encrypted with a single master key; a per-room key is additionally
//! derived and stored encrypted, ready for a future per-room E2EE scheme
//! that does not exist yet and is not wired into message encryption today.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

const NONCE_LEN: usize = 12;

/// Encrypts and decrypts message bodies with a single 32-byte master key.
/// Disabled (`enabled: false`) means `encrypt`/`decrypt` are identity
/// functions, matching the original's behaviour when
/// `MESSAGE_ENCRYPTION_AT_REST` is off.
pub struct EncryptionService {
    key: Option<Aes256Gcm>,
    master_key_bytes: Option<[u8; 32]>,
}

impl EncryptionService {
    /// `master_key` is the base64-encoded 32-byte key from
    /// [`crate::config::CoreConfig::message_encryption_master_key`].
    /// `enabled = false` builds a no-op service regardless of `master_key`.
    pub fn new(master_key: Option<&str>, enabled: bool) -> CoreResult<Self> {
        if !enabled {
            return Ok(Self { key: None, master_key_bytes: None });
        }
        let raw = master_key.ok_or_else(|| {
            CoreError::FatalConfig("message encryption enabled but no master key configured".into())
        })?;
        let bytes = BASE64
            .decode(raw)
            .map_err(|e| CoreError::FatalConfig(format!("master key is not valid base64: {e}")))?;
        if bytes.len() != 32 {
            return Err(CoreError::FatalConfig(format!(
                "master key must decode to 32 bytes, got {}",
                bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&bytes)
            .map_err(|e| CoreError::FatalConfig(format!("invalid master key: {e}")))?;
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&bytes);
        Ok(Self { key: Some(cipher), master_key_bytes: Some(key_bytes) })
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Returns `content` unchanged when encryption is disabled. On an
    /// encrypt failure, falls back to returning the plaintext as-is rather
    /// than failing the send, matching the original's fail-open policy for
    /// this path (a dropped message is worse than an unencrypted one the
    /// caller already accepted over an authenticated channel).
    pub fn encrypt_message(&self, content: &str) -> String {
        let Some(cipher) = &self.key else {
            return content.to_string();
        };
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        match cipher.encrypt(nonce, content.as_bytes()) {
            Ok(ciphertext) => {
                let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                payload.extend_from_slice(&nonce_bytes);
                payload.extend_from_slice(&ciphertext);
                BASE64.encode(payload)
            }
            Err(e) => {
                log::warn!("message encryption failed, storing plaintext: {e}");
                content.to_string()
            }
        }
    }

    /// Returns `stored` unchanged when encryption is disabled. On a decrypt
    /// failure (corrupt payload, or a plaintext row left over from before
    /// encryption was enabled), falls back to returning `stored` as-is,
    /// matching the original's "might be legacy plaintext" fallback.
    pub fn decrypt_message(&self, stored: &str) -> String {
        let Some(cipher) = &self.key else {
            return stored.to_string();
        };
        let decode_and_open = || -> Option<String> {
            let payload = BASE64.decode(stored).ok()?;
            if payload.len() < NONCE_LEN {
                return None;
            }
            let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
            let nonce = Nonce::from_slice(nonce_bytes);
            let plaintext = cipher.decrypt(nonce, ciphertext).ok()?;
            String::from_utf8(plaintext).ok()
        };
        decode_and_open().unwrap_or_else(|| {
            log::error!("message decryption failed, returning stored value as-is");
            stored.to_string()
        })
    }

    /// Derives a per-room key from the master key via HMAC-SHA256 with
    /// `room_id` as domain-separation context (an HKDF-extract step, not a
    /// full HKDF-expand — one room-sized key is all this needs). Returns
    /// `None` when encryption is disabled, matching the original's
    /// `derive_room_key`. The derived key is not used to encrypt messages
    /// today; it exists so a future per-room E2EE scheme has a key to
    /// adopt without a storage migration.
    pub fn derive_room_key(&self, room_id: Uuid) -> Option<[u8; 32]> {
        let master_bytes = self.master_key_bytes.as_ref()?;
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(master_bytes).ok()?;
        mac.update(room_id.as_bytes());
        mac.update(b"room-key-v1");
        Some(mac.finalize().into_bytes().into())
    }

    /// Encrypts a derived room key for storage, using the same master-key
    /// cipher as message bodies (mirrors `encrypt_room_key` wrapping the
    /// derived key before it is persisted).
    pub fn encrypt_room_key(&self, room_key: &[u8; 32]) -> Option<String> {
        let cipher = self.key.as_ref()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, room_key.as_slice()).ok()?;
        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&ciphertext);
        Some(BASE64.encode(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_service() -> EncryptionService {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let encoded = BASE64.encode(key);
        EncryptionService::new(Some(&encoded), true).unwrap()
    }

    #[test]
    fn disabled_service_is_identity() {
        let service = EncryptionService::new(None, false).unwrap();
        assert_eq!(service.encrypt_message("hello"), "hello");
        assert_eq!(service.decrypt_message("hello"), "hello");
        assert!(service.derive_room_key(Uuid::new_v4()).is_none());
    }

    #[test]
    fn enabled_service_round_trips() {
        let service = enabled_service();
        let ciphertext = service.encrypt_message("hi there");
        assert_ne!(ciphertext, "hi there");
        assert_eq!(service.decrypt_message(&ciphertext), "hi there");
    }

    #[test]
    fn decrypting_garbage_falls_back_to_input() {
        let service = enabled_service();
        assert_eq!(service.decrypt_message("not base64 ciphertext"), "not base64 ciphertext");
    }

    #[test]
    fn room_key_derivation_is_deterministic_per_room() {
        let service = enabled_service();
        let room_id = Uuid::new_v4();
        let k1 = service.derive_room_key(room_id).unwrap();
        let k2 = service.derive_room_key(room_id).unwrap();
        assert_eq!(k1, k2);
        assert_ne!(k1, service.derive_room_key(Uuid::new_v4()).unwrap());
    }
}
