//! ECDH session establishment and authenticated encryption.
//!
//! [`SessionCrypto`] owns the device's ephemeral Curve25519 keypair,
//! performs key agreement with the peer, derives the symmetric session
//! keys and encrypts/decrypts framed messages.
//!
//! # Key schedule
//!
//! ```text
//! shared  = X25519(device_secret, peer_public)
//! PRK     = SHA-256(shared)             shared wiped immediately
//! enc_key = HKDF-Expand(PRK, "wible v1 enc", 32)
//! mac_key = HKDF-Expand(PRK, "wible v1 mac", 32)
//! ```
//!
//! Messages are AES-256-CBC with PKCS#7 padding and a fresh random IV
//! per call; an HMAC-SHA256 tag over IV ‖ ciphertext is verified in
//! constant time before any decryption happens (encrypt-then-MAC).
//! Renewal ratchets the PRK (`PRK' = SHA-256(PRK)`) without touching
//! the asymmetric keypair.

use std::fmt;
use std::time::{Duration, Instant};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use super::message::{EncryptedMessage, IV_LEN, MAX_PLAINTEXT_LEN, PUBLIC_KEY_LEN, TAG_LEN};
use crate::config::ProvisioningConfig;
use crate::error::ErrorKind;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Symmetric key length (AES-256 and HMAC-SHA256).
const KEY_LEN: usize = 32;

/// AES block size.
const BLOCK_LEN: usize = 16;

/// Random bytes behind a session id.
const SESSION_ID_LEN: usize = 16;

/// HKDF info label for the cipher key.
const HKDF_INFO_ENC: &[u8] = b"wible v1 enc";

/// HKDF info label for the MAC key.
const HKDF_INFO_MAC: &[u8] = b"wible v1 mac";

/// Errors raised by the crypto subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Entropy source could not provide seed material.
    InitFailed(String),
    /// No valid ECDH keypair exists.
    NoKeypair,
    /// Key agreement with the peer failed.
    KeyExchangeFailed(String),
    /// No session is established.
    NoSession,
    /// The session key has expired.
    SessionExpired,
    /// Integrity check, padding or length validation failed.
    DecryptFailed,
    /// A frame did not match the wire format.
    MalformedFrame,
    /// Plaintext exceeds the protocol bound.
    PlaintextTooLong { len: usize, max: usize },
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InitFailed(_) => ErrorKind::CryptoInitFailed,
            Self::NoKeypair | Self::KeyExchangeFailed(_) => ErrorKind::CryptoKeyExchangeFailed,
            Self::NoSession | Self::SessionExpired | Self::DecryptFailed | Self::MalformedFrame => {
                ErrorKind::CryptoDecryptFailed
            }
            Self::PlaintextTooLong { .. } => ErrorKind::UnknownError,
        }
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitFailed(msg) => write!(f, "crypto init failed: {}", msg),
            Self::NoKeypair => write!(f, "no ECDH keypair available"),
            Self::KeyExchangeFailed(msg) => write!(f, "key exchange failed: {}", msg),
            Self::NoSession => write!(f, "no session established"),
            Self::SessionExpired => write!(f, "session expired"),
            Self::DecryptFailed => write!(f, "decryption failed"),
            Self::MalformedFrame => write!(f, "malformed frame"),
            Self::PlaintextTooLong { len, max } => {
                write!(f, "plaintext too long: {} bytes (max {})", len, max)
            }
        }
    }
}

impl std::error::Error for CryptoError {}

/// Ephemeral Curve25519 keypair.
///
/// The private scalar is zeroized by `x25519-dalek` when the pair is
/// dropped or replaced.
struct EcdhKeyPair {
    secret: StaticSecret,
    public: PublicKey,
    generated_at: Instant,
}

/// Derived symmetric session material.
struct SessionKey {
    cipher_key: [u8; KEY_LEN],
    mac_key: [u8; KEY_LEN],
    iv_seed: [u8; IV_LEN],
    session_id: String,
    created_at: Instant,
    expires_at: Instant,
}

impl SessionKey {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Zero all key material in place.
    fn clear(&mut self) {
        self.cipher_key.zeroize();
        self.mac_key.zeroize();
        self.iv_seed.zeroize();
        self.session_id.zeroize();
    }
}

/// ECDH key agreement plus authenticated symmetric encryption for one
/// provisioning session.
pub struct SessionCrypto {
    keypair: Option<EcdhKeyPair>,
    shared_secret: Option<Zeroizing<[u8; KEY_LEN]>>,
    prk: Option<Zeroizing<[u8; KEY_LEN]>>,
    session: Option<SessionKey>,
    session_timeout: Duration,
    enable_pfs: bool,
    pin_code: String,
    next_message_id: u64,
}

impl SessionCrypto {
    /// Initialize the crypto subsystem.
    ///
    /// Draws a 32-byte self-check from the platform entropy source so
    /// a broken DRBG is caught at init rather than at key generation.
    pub fn new(config: &ProvisioningConfig) -> Result<Self, CryptoError> {
        let mut probe = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut probe)
            .map_err(|e| CryptoError::InitFailed(e.to_string()))?;
        probe.zeroize();

        info!("session crypto initialized");
        Ok(Self {
            keypair: None,
            shared_secret: None,
            prk: None,
            session: None,
            session_timeout: Duration::from_millis(u64::from(config.session_timeout_ms)),
            enable_pfs: config.enable_pfs,
            pin_code: config.pin_code.clone(),
            next_message_id: 0,
        })
    }

    /// Generate a fresh ECDH keypair, replacing any previous one.
    pub fn generate_keypair(&mut self) {
        // Replacing the option drops the old pair, which zeroizes the
        // previous private scalar before the new one is stored.
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        self.keypair = Some(EcdhKeyPair {
            secret,
            public,
            generated_at: Instant::now(),
        });
        debug!("generated fresh ECDH keypair");
    }

    /// Public key for transmission, or `None` without a valid keypair.
    pub fn public_key(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        self.keypair.as_ref().map(|kp| *kp.public.as_bytes())
    }

    /// Age of the current keypair.
    pub fn keypair_age(&self) -> Option<Duration> {
        self.keypair.as_ref().map(|kp| kp.generated_at.elapsed())
    }

    /// Run X25519 against the peer's public key.
    ///
    /// Rejects keys of the wrong length and peer points that produce a
    /// non-contributory (all-zero) shared secret, such as the identity
    /// or other low-order points.
    pub fn compute_shared_secret(&mut self, peer_public: &[u8]) -> Result<(), CryptoError> {
        let keypair = self.keypair.as_ref().ok_or(CryptoError::NoKeypair)?;
        let peer: [u8; PUBLIC_KEY_LEN] = peer_public.try_into().map_err(|_| {
            CryptoError::KeyExchangeFailed(format!(
                "peer key must be {} bytes, got {}",
                PUBLIC_KEY_LEN,
                peer_public.len()
            ))
        })?;

        let shared = keypair.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            warn!("rejected low-order peer public key");
            return Err(CryptoError::KeyExchangeFailed(
                "peer key is a low-order point".into(),
            ));
        }

        self.shared_secret = Some(Zeroizing::new(*shared.as_bytes()));
        Ok(())
    }

    /// Derive the symmetric session keys from the shared secret.
    ///
    /// The shared secret is consumed and wiped; on success the session
    /// is established and [`encrypt`](Self::encrypt)/
    /// [`decrypt`](Self::decrypt) become available.
    pub fn derive_session_key(&mut self) -> Result<(), CryptoError> {
        let shared = self
            .shared_secret
            .take()
            .ok_or_else(|| CryptoError::KeyExchangeFailed("no shared secret computed".into()))?;
        let prk = Zeroizing::new(<[u8; KEY_LEN]>::from(Sha256::digest(&shared[..])));
        drop(shared); // wiped here

        let session = self.expand_session(&prk)?;
        info!("session established (id {})", session.session_id);
        self.session = Some(session);
        self.prk = Some(prk);
        self.next_message_id = 0;
        Ok(())
    }

    /// Whether a session key currently exists (it may still expire).
    pub fn is_established(&self) -> bool {
        self.session.is_some()
    }

    /// Current session id, if established.
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.session_id.as_str())
    }

    /// Time since the session key was derived.
    pub fn session_age(&self) -> Option<Duration> {
        self.session.as_ref().map(|s| s.created_at.elapsed())
    }

    /// Encrypt a plaintext under the current session.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(CryptoError::PlaintextTooLong {
                len: plaintext.len(),
                max: MAX_PLAINTEXT_LEN,
            });
        }
        self.next_message_id += 1;
        let message_id = self.next_message_id;
        let session = self.live_session()?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new((&session.cipher_key).into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let auth_tag = compute_tag(&session.mac_key, &iv, &ciphertext);

        Ok(EncryptedMessage {
            ciphertext,
            iv,
            auth_tag: Some(auth_tag),
            message_id,
            timestamp: Instant::now(),
        })
    }

    /// Decrypt a message under the current session.
    ///
    /// The tag is verified in constant time before the cipher runs, so
    /// padding never acts as an oracle. The plaintext is returned in a
    /// self-wiping buffer.
    pub fn decrypt(&self, message: &EncryptedMessage) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let session = self.live_session()?;
        let tag = message.auth_tag.ok_or(CryptoError::DecryptFailed)?;

        let mut mac = HmacSha256::new_from_slice(&session.mac_key)
            .expect("HMAC accepts keys of any length");
        mac.update(&message.iv);
        mac.update(&message.ciphertext);
        if mac.verify_slice(&tag).is_err() {
            warn!("message authentication failed");
            return Err(CryptoError::DecryptFailed);
        }

        if message.ciphertext.is_empty() || message.ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CryptoError::DecryptFailed);
        }

        let plaintext = Aes256CbcDec::new((&session.cipher_key).into(), (&message.iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(&message.ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Re-derive session material without touching the keypair.
    ///
    /// Ratchets the PRK forward so previous traffic keys are
    /// unrecoverable; issues a fresh session id and expiry.
    pub fn renew_session_key(&mut self) -> Result<(), CryptoError> {
        if self.session.is_none() {
            return Err(CryptoError::NoSession);
        }
        let old_prk = self.prk.take().ok_or(CryptoError::NoSession)?;
        let new_prk = Zeroizing::new(<[u8; KEY_LEN]>::from(Sha256::digest(&old_prk[..])));
        drop(old_prk);

        let new_session = self.expand_session(&new_prk)?;
        if let Some(old) = self.session.as_mut() {
            old.clear();
        }
        info!("session key renewed (id {})", new_session.session_id);
        self.session = Some(new_session);
        self.prk = Some(new_prk);
        Ok(())
    }

    /// Tear down the session: wipe symmetric keys, IV seed and session
    /// id. With PFS enabled the ECDH keypair is regenerated as well.
    pub fn terminate_session(&mut self) {
        let _ = self.take_terminated_session();
    }

    /// Constant-time PIN comparison.
    pub fn verify_pin(&self, candidate: &str) -> bool {
        // Hashing both sides first makes the comparison length-blind.
        let expected: [u8; KEY_LEN] = Sha256::digest(self.pin_code.as_bytes()).into();
        let provided: [u8; KEY_LEN] = Sha256::digest(candidate.as_bytes()).into();
        expected.as_slice().ct_eq(provided.as_slice()).into()
    }

    fn live_session(&self) -> Result<&SessionKey, CryptoError> {
        let session = self.session.as_ref().ok_or(CryptoError::NoSession)?;
        if session.is_expired() {
            return Err(CryptoError::SessionExpired);
        }
        Ok(session)
    }

    fn expand_session(&self, prk: &Zeroizing<[u8; KEY_LEN]>) -> Result<SessionKey, CryptoError> {
        let hk = Hkdf::<Sha256>::from_prk(&prk[..])
            .map_err(|_| CryptoError::KeyExchangeFailed("invalid PRK length".into()))?;
        let mut cipher_key = [0u8; KEY_LEN];
        let mut mac_key = [0u8; KEY_LEN];
        hk.expand(HKDF_INFO_ENC, &mut cipher_key)
            .map_err(|_| CryptoError::KeyExchangeFailed("HKDF expand failed".into()))?;
        hk.expand(HKDF_INFO_MAC, &mut mac_key)
            .map_err(|_| CryptoError::KeyExchangeFailed("HKDF expand failed".into()))?;

        let mut iv_seed = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv_seed);
        let mut id_bytes = [0u8; SESSION_ID_LEN];
        OsRng.fill_bytes(&mut id_bytes);

        let now = Instant::now();
        Ok(SessionKey {
            cipher_key,
            mac_key,
            iv_seed,
            session_id: BASE64.encode(id_bytes),
            created_at: now,
            expires_at: now + self.session_timeout,
        })
    }

    /// Wipe and detach the session; returns the cleared buffers so
    /// tests can verify zeroization.
    fn take_terminated_session(&mut self) -> Option<SessionKey> {
        let mut session = self.session.take();
        if let Some(s) = session.as_mut() {
            s.clear();
        }
        self.prk = None;
        self.shared_secret = None;
        self.next_message_id = 0;
        if self.enable_pfs && self.keypair.is_some() {
            self.generate_keypair();
        }
        debug!("session terminated");
        session
    }

    /// Force the current session to read as expired.
    #[cfg(test)]
    fn expire_session_now(&mut self) {
        if let Some(s) = self.session.as_mut() {
            s.expires_at = Instant::now();
        }
    }
}

fn compute_tag(mac_key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], ciphertext: &[u8]) -> [u8; TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(mac_key).expect("HMAC accepts keys of any length");
    mac.update(iv);
    mac.update(ciphertext);
    mac.finalize().into_bytes().into()
}
