//! Session cryptography.
//!
//! This module owns everything that touches key material: ECDH key
//! agreement on Curve25519, session-key derivation, authenticated
//! encryption of framed messages, and secure wiping on teardown.
//!
//! # Components
//!
//! - `session` - ECDH keypair and session lifecycle, encrypt/decrypt
//! - `message` - encrypted-message container and on-wire frame codec

mod message;
mod session;

pub use message::{
    public_key_frame, EncryptedMessage, WireFrame, FRAME_CIPHERTEXT, FRAME_PUBLIC_KEY, IV_LEN,
    MAX_PLAINTEXT_LEN, PUBLIC_KEY_LEN, TAG_LEN,
};
pub use session::{CryptoError, SessionCrypto};
