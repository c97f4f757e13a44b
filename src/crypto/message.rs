//! Encrypted-message container and on-wire frame codec.
//!
//! Everything that crosses the credentials or status characteristic
//! is a tagged frame:
//!
//! ```text
//! [0x00][public key: 32]                      key-exchange bootstrap
//! [0x01][IV: 16][ciphertext: 16*n][tag: 32]   encrypted payload
//! ```
//!
//! The bootstrap frame is the only plaintext the protocol ever emits;
//! every `0x01` frame carries an HMAC-SHA256 tag over IV ‖ ciphertext
//! that is verified before any cipher work happens.

use std::time::Instant;

use super::session::CryptoError;

/// Frame tag for the plaintext public-key exchange.
pub const FRAME_PUBLIC_KEY: u8 = 0x00;

/// Frame tag for an encrypted payload.
pub const FRAME_CIPHERTEXT: u8 = 0x01;

/// AES-CBC initialization vector length.
pub const IV_LEN: usize = 16;

/// HMAC-SHA256 tag length.
pub const TAG_LEN: usize = 32;

/// X25519 public key length.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Upper bound on a single encrypted plaintext.
pub const MAX_PLAINTEXT_LEN: usize = 256;

/// AES block size; ciphertext length is always a multiple of this.
const BLOCK_LEN: usize = 16;

/// A parsed on-wire frame.
#[derive(Debug, PartialEq, Eq)]
pub enum WireFrame<'a> {
    /// Peer's raw X25519 public key.
    PublicKey([u8; PUBLIC_KEY_LEN]),
    /// Body of an encrypted frame (`IV ‖ ciphertext ‖ tag`).
    Ciphertext(&'a [u8]),
}

impl<'a> WireFrame<'a> {
    /// Parse the tag byte and split off the frame body.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, CryptoError> {
        let (&tag, body) = bytes.split_first().ok_or(CryptoError::MalformedFrame)?;
        match tag {
            FRAME_PUBLIC_KEY => {
                let key: [u8; PUBLIC_KEY_LEN] =
                    body.try_into().map_err(|_| CryptoError::MalformedFrame)?;
                Ok(Self::PublicKey(key))
            }
            FRAME_CIPHERTEXT => Ok(Self::Ciphertext(body)),
            _ => Err(CryptoError::MalformedFrame),
        }
    }
}

/// Build the plaintext bootstrap frame carrying a public key.
pub fn public_key_frame(key: &[u8; PUBLIC_KEY_LEN]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + PUBLIC_KEY_LEN);
    frame.push(FRAME_PUBLIC_KEY);
    frame.extend_from_slice(key);
    frame
}

/// One encrypted on-wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// AES-256-CBC ciphertext (PKCS#7 padded).
    pub ciphertext: Vec<u8>,
    /// Per-message IV, fresh for every encryption.
    pub iv: [u8; IV_LEN],
    /// HMAC-SHA256 over IV ‖ ciphertext.
    pub auth_tag: Option<[u8; TAG_LEN]>,
    /// Sender-local sequence number.
    pub message_id: u64,
    /// When this message was produced or received.
    pub timestamp: Instant,
}

impl EncryptedMessage {
    /// Serialize to a tagged `0x01` frame for transmission.
    pub fn to_wire(&self) -> Vec<u8> {
        let tag_len = if self.auth_tag.is_some() { TAG_LEN } else { 0 };
        let mut frame = Vec::with_capacity(1 + IV_LEN + self.ciphertext.len() + tag_len);
        frame.push(FRAME_CIPHERTEXT);
        frame.extend_from_slice(&self.iv);
        frame.extend_from_slice(&self.ciphertext);
        if let Some(tag) = &self.auth_tag {
            frame.extend_from_slice(tag);
        }
        frame
    }

    /// Deserialize the body of a `0x01` frame (`IV ‖ ciphertext ‖ tag`).
    ///
    /// Rejects bodies that cannot hold an IV, a tag and at least one
    /// cipher block, and bodies whose ciphertext is not block-aligned.
    pub fn from_wire(body: &[u8]) -> Result<Self, CryptoError> {
        if body.len() <= IV_LEN {
            return Err(CryptoError::MalformedFrame);
        }
        let (iv_bytes, rest) = body.split_at(IV_LEN);
        if rest.len() < TAG_LEN + BLOCK_LEN {
            return Err(CryptoError::MalformedFrame);
        }
        let (ciphertext, tag_bytes) = rest.split_at(rest.len() - TAG_LEN);
        if ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CryptoError::MalformedFrame);
        }

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(iv_bytes);
        let mut auth_tag = [0u8; TAG_LEN];
        auth_tag.copy_from_slice(tag_bytes);

        Ok(Self {
            ciphertext: ciphertext.to_vec(),
            iv,
            auth_tag: Some(auth_tag),
            message_id: 0,
            timestamp: Instant::now(),
        })
    }
}
