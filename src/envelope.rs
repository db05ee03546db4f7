//! End-to-end encryption for session traffic.
//!
//! Each side of a session holds an ephemeral X25519 key pair. A pairwise
//! shared key is derived per peer (Diffie–Hellman, then SHA-256), and every
//! inner [`Message`] is sealed into an [`Envelope`] with XSalsa20-Poly1305
//! under a fresh 24-byte nonce. The relay never holds key material; it sees
//! only the envelope's cleartext session id.
//!
//! # Wire Format
//!
//! ```json
//! { "version": 1, "sessionId": "ABCDEF", "nonce": "<base64>",
//!   "ciphertext": "<base64>", "timestamp": 1700000000000 }
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use crypto_secretbox::{
    aead::{Aead, KeyInit},
    Nonce, XSalsa20Poly1305,
};
use rand::{rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{PROTOCOL_VERSION, SESSION_ID_ALPHABET, SESSION_ID_LEN};
use crate::protocol::{Envelope, Message};

/// Nonce size for XSalsa20-Poly1305 (24 bytes).
const NONCE_SIZE: usize = 24;

/// Cryptographic operation failure.
#[derive(Debug)]
pub enum CryptoError {
    /// Peer public key failed to decode or was not 32 bytes.
    InvalidPublicKey,
    /// Internal failure while sealing.
    EncryptionFailed(String),
    /// MAC did not verify, or the plaintext was not a valid message.
    DecryptionFailed,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPublicKey => write!(f, "invalid public key"),
            Self::EncryptionFailed(msg) => write!(f, "encryption failed: {msg}"),
            Self::DecryptionFailed => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// An ephemeral X25519 key pair.
///
/// The secret half never leaves this struct and is zeroed on drop.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh key pair.
    #[must_use]
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a key pair from stored secret bytes.
    #[must_use]
    pub fn from_secret(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half, base64-encoded (32 bytes).
    #[must_use]
    pub fn public_key(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Compute the pairwise shared key with a peer's base64 public key.
    ///
    /// The raw Diffie–Hellman output is hashed with SHA-256 before use as
    /// a cipher key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the key does not decode
    /// to exactly 32 bytes.
    pub fn establish(&self, peer_public_base64: &str) -> Result<SharedKey, CryptoError> {
        let peer_bytes: [u8; 32] = BASE64
            .decode(peer_public_base64)
            .map_err(|_| CryptoError::InvalidPublicKey)?
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;

        let peer_public = PublicKey::from(peer_bytes);
        let dh = self.secret.diffie_hellman(&peer_public);

        let mut hasher = Sha256::new();
        hasher.update(dh.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();

        Ok(SharedKey { key })
    }
}

impl Default for KeyPair {
    fn default() -> Self {
        Self::new()
    }
}

/// The DH-derived symmetric key for a single CLI↔peer pair.
///
/// Zeroed on drop; entries are removed from the per-peer map when the peer
/// disconnects.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedKey {
    key: [u8; 32],
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey").finish_non_exhaustive()
    }
}

impl SharedKey {
    /// Seal an inner message into an envelope with a fresh random nonce.
    ///
    /// Identical plaintexts produce distinct ciphertexts because the nonce
    /// is drawn fresh for every call.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] on serialization or seal
    /// failure.
    pub fn encrypt(&self, message: &Message, session_id: &str) -> Result<Envelope, CryptoError> {
        let plaintext = serde_json::to_vec(message)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let cipher = XSalsa20Poly1305::new((&self.key).into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        Ok(Envelope {
            version: PROTOCOL_VERSION,
            session_id: session_id.to_string(),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Open an envelope and parse the inner message.
    ///
    /// The envelope's cleartext session id is routing metadata only: if the
    /// integrity-protected inner id disagrees with it, the message is
    /// rejected as tampered.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if the MAC does not verify,
    /// the plaintext is not a valid message, or the inner session id
    /// disagrees with the envelope.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<Message, CryptoError> {
        let nonce_bytes: [u8; NONCE_SIZE] = BASE64
            .decode(&envelope.nonce)
            .map_err(|_| CryptoError::DecryptionFailed)?
            .try_into()
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let cipher = XSalsa20Poly1305::new((&self.key).into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let message: Message =
            serde_json::from_slice(&plaintext).map_err(|_| CryptoError::DecryptionFailed)?;

        if let Some(inner_id) = &message.session_id {
            if inner_id != &envelope.session_id {
                return Err(CryptoError::DecryptionFailed);
            }
        }

        Ok(message)
    }
}

/// Generate a six-character session id from the unambiguous alphabet.
///
/// Each character is `random_byte % 32`. Collisions are possible and
/// accepted: the session store re-checks on create.
#[must_use]
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| {
            let byte: u8 = rng.gen();
            SESSION_ID_ALPHABET[(byte % 32) as usize] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;

    fn pair_of_keys() -> (SharedKey, SharedKey) {
        let cli = KeyPair::new();
        let web = KeyPair::new();
        let cli_side = cli.establish(&web.public_key()).unwrap();
        let web_side = web.establish(&cli.public_key()).unwrap();
        (cli_side, web_side)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (cli_side, web_side) = pair_of_keys();
        let msg = Message::terminal_output("a.txt\n", 1, "ABCDEF");

        let envelope = cli_side.encrypt(&msg, "ABCDEF").unwrap();
        assert_eq!(envelope.version, 1);
        assert_eq!(envelope.session_id, "ABCDEF");

        let decrypted = web_side.decrypt(&envelope).unwrap();
        assert_eq!(decrypted, msg);
        assert_eq!(decrypted.kind, MessageKind::TerminalOutput);
    }

    #[test]
    fn test_both_directions_derive_same_key() {
        let (cli_side, web_side) = pair_of_keys();
        let msg = Message::terminal_input("ls\n", 1, "ABCDEF");

        let from_web = web_side.encrypt(&msg, "ABCDEF").unwrap();
        assert_eq!(cli_side.decrypt(&from_web).unwrap(), msg);
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let (cli_side, _) = pair_of_keys();
        let msg = Message::terminal_output("same", 1, "ABCDEF");

        let a = cli_side.encrypt(&msg, "ABCDEF").unwrap();
        let b = cli_side.encrypt(&msg, "ABCDEF").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (cli_side, web_side) = pair_of_keys();
        let msg = Message::terminal_output("secret", 1, "ABCDEF");
        let mut envelope = cli_side.encrypt(&msg, "ABCDEF").unwrap();

        let mut raw = BASE64.decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0x01;
        envelope.ciphertext = BASE64.encode(raw);

        assert!(matches!(
            web_side.decrypt(&envelope),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_nonce_rejected() {
        let (cli_side, web_side) = pair_of_keys();
        let msg = Message::terminal_output("secret", 1, "ABCDEF");
        let mut envelope = cli_side.encrypt(&msg, "ABCDEF").unwrap();

        let mut raw = BASE64.decode(&envelope.nonce).unwrap();
        raw[0] ^= 0x01;
        envelope.nonce = BASE64.encode(raw);

        assert!(web_side.decrypt(&envelope).is_err());
    }

    #[test]
    fn test_relabeled_envelope_rejected() {
        let (cli_side, web_side) = pair_of_keys();
        let msg = Message::terminal_output("data", 1, "ABCDEF");
        let mut envelope = cli_side.encrypt(&msg, "ABCDEF").unwrap();

        // A hostile relay rewrites the routing id; the inner id disagrees.
        envelope.session_id = "ZZZZZZ".into();
        assert!(web_side.decrypt(&envelope).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let (cli_side, _) = pair_of_keys();
        let (_, other_web) = pair_of_keys();
        let msg = Message::terminal_output("data", 1, "ABCDEF");
        let envelope = cli_side.encrypt(&msg, "ABCDEF").unwrap();

        assert!(other_web.decrypt(&envelope).is_err());
    }

    #[test]
    fn test_establish_rejects_bad_keys() {
        let kp = KeyPair::new();
        assert!(matches!(
            kp.establish("not base64 !!"),
            Err(CryptoError::InvalidPublicKey)
        ));
        // Valid base64, wrong length.
        let short = BASE64.encode([0u8; 16]);
        assert!(matches!(
            kp.establish(&short),
            Err(CryptoError::InvalidPublicKey)
        ));
    }

    #[test]
    fn test_from_secret_restores_public_key() {
        let original = KeyPair::new();
        let restored = KeyPair::from_secret(original.secret.to_bytes());
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn test_public_key_is_32_bytes() {
        let kp = KeyPair::new();
        let decoded = BASE64.decode(kp.public_key()).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn test_session_id_alphabet_and_length() {
        for _ in 0..200 {
            let id = generate_session_id();
            assert_eq!(id.len(), SESSION_ID_LEN);
            for ch in id.bytes() {
                assert!(SESSION_ID_ALPHABET.contains(&ch), "bad char {ch}");
            }
        }
    }

    #[test]
    fn test_session_id_collisions_are_rare() {
        let ids: std::collections::HashSet<String> =
            (0..1000).map(|_| generate_session_id()).collect();
        // 32^6 ≈ 1.07e9 values; 1000 draws should collide at most once.
        assert!(ids.len() >= 999, "unexpected collision rate: {}", ids.len());
    }
}
