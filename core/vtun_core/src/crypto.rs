//! Shared-key derivation and payload encryption
//!
//! Both ends derive their key material from the same password: the
//! SHA-256 digest of the password supplies the 16-byte auth key carried in
//! every message header, and the full 32 bytes key the optional AEAD cipher.
//!
//! Sealed datagrams are laid out as `ciphertext || tag || nonce`. The nonce
//! is random per datagram; no sequence numbers are kept.

use std::fmt;
use std::str::FromStr;

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

use crate::protocol::{AuthKey, AUTH_KEY_LEN};

/// Length of derived key material
pub const KEY_MATERIAL_LEN: usize = 32;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material rejected by the algorithm
    InvalidKey,
    /// Could not draw a nonce from the system RNG
    Random,
    /// Sealing failed
    Seal,
    /// Datagram too short or tag did not verify
    Open,
    /// Cipher name not recognised
    UnknownCipher(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidKey => write!(f, "invalid key material"),
            CryptoError::Random => write!(f, "system RNG failure"),
            CryptoError::Seal => write!(f, "seal failed"),
            CryptoError::Open => write!(f, "authentication tag mismatch"),
            CryptoError::UnknownCipher(name) => write!(f, "unknown cipher: {}", name),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Key Material
// ============================================================================

/// Key material derived from the shared password
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey {
    material: [u8; KEY_MATERIAL_LEN],
}

impl SharedKey {
    /// Derive from an optional password; without one every byte is zero
    pub fn from_password(password: Option<&str>) -> Self {
        let mut material = [0u8; KEY_MATERIAL_LEN];
        if let Some(password) = password {
            let hash = digest::digest(&digest::SHA256, password.as_bytes());
            material.copy_from_slice(hash.as_ref());
        }
        SharedKey { material }
    }

    /// The 16 bytes placed in every message header
    pub fn auth_key(&self) -> AuthKey {
        let mut key = [0u8; AUTH_KEY_LEN];
        key.copy_from_slice(&self.material[..AUTH_KEY_LEN]);
        key
    }

    pub fn material(&self) -> &[u8; KEY_MATERIAL_LEN] {
        &self.material
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

// ============================================================================
// Cipher Selection
// ============================================================================

/// Supported AEAD algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    pub fn name(self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "aes-128",
            CipherKind::Aes256Gcm => "aes-256",
            CipherKind::ChaCha20Poly1305 => "chacha20",
        }
    }

    fn algorithm(self) -> &'static aead::Algorithm {
        match self {
            CipherKind::Aes128Gcm => &aead::AES_128_GCM,
            CipherKind::Aes256Gcm => &aead::AES_256_GCM,
            CipherKind::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }
}

impl FromStr for CipherKind {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128" | "aes128" | "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256" | "aes256" | "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            _ => Err(CryptoError::UnknownCipher(s.to_string())),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Cipher
// ============================================================================

/// Symmetric cipher applied to whole wire messages
pub trait Cipher {
    /// Bytes added to a message by `seal`
    fn overhead(&self) -> usize;

    /// Encrypt `buf` in place, appending whatever the wire layout needs
    fn seal(&self, buf: &mut Vec<u8>) -> Result<(), CryptoError>;

    /// Decrypt `buf` in place, returning the plaintext part of it
    fn open<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8], CryptoError>;
}

/// ring AEAD cipher with a random nonce appended to each datagram
pub struct AeadCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AeadCipher {
    pub fn new(kind: CipherKind, shared: &SharedKey) -> Result<Self, CryptoError> {
        let algorithm = kind.algorithm();
        let key_bytes = &shared.material()[..algorithm.key_len()];
        let unbound = UnboundKey::new(algorithm, key_bytes).map_err(|_| CryptoError::InvalidKey)?;

        Ok(AeadCipher {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    fn tag_len(&self) -> usize {
        self.key.algorithm().tag_len()
    }
}

impl Cipher for AeadCipher {
    fn overhead(&self) -> usize {
        self.tag_len() + NONCE_LEN
    }

    fn seal(&self, buf: &mut Vec<u8>) -> Result<(), CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Random)?;

        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), buf)
            .map_err(|_| CryptoError::Seal)?;

        buf.extend_from_slice(&nonce_bytes);
        Ok(())
    }

    fn open<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8], CryptoError> {
        if buf.len() < self.overhead() {
            return Err(CryptoError::Open);
        }

        let split = buf.len() - NONCE_LEN;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&buf[split..]);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        self.key
            .open_in_place(nonce, Aad::empty(), &mut buf[..split])
            .map_err(|_| CryptoError::Open)
    }
}

// ============================================================================
// Tests
// ============================================================================
