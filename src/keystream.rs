//! Passphrase-derived deterministic randomness.
//!
//! A 256-bit key is derived from the passphrase with Argon2id over a fixed
//! all-zero salt; every emulated randomness request is then served from the
//! start of the ChaCha20 keystream under that key with an all-zero nonce.
//! The bytes a tracee receives are a pure function of the passphrase and
//! the request length.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20Legacy, LegacyNonce};
use zeroize::Zeroize;

use crate::{Error, Result};

/// Argon2id cost parameters, the moderate interactive profile.
const KDF_MEM_KIB: u32 = 256 * 1024;
const KDF_PASSES: u32 = 3;
const KDF_LANES: u32 = 1;

const SALT: [u8; 16] = [0; 16];
const NONCE: [u8; 8] = [0; 8];

/// A derived 256-bit keystream key, zeroised when dropped.
pub struct Key([u8; 32]);

impl Zeroize for Key {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Derive the keystream key from a passphrase.
///
/// The salt is fixed to all zeros, so the same passphrase always yields the
/// same key and therefore the same keystream.
pub fn derive(passphrase: &[u8]) -> Result<Key> {
    let params = Params::new(KDF_MEM_KIB, KDF_PASSES, KDF_LANES, Some(32)).map_err(Error::Kdf)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase, &SALT, &mut key)
        .map_err(Error::Kdf)?;
    Ok(Key(key))
}

/// Fill `out` with keystream bytes, starting from cipher offset zero.
///
/// Every call restarts the cipher, so two requests of the same length
/// receive the same bytes. Prior contents of `out` are overwritten.
pub fn fill(key: &Key, out: &mut [u8]) {
    let mut cipher = ChaCha20Legacy::new(
        chacha20::Key::from_slice(&key.0),
        LegacyNonce::from_slice(&NONCE),
    );
    out.fill(0);
    cipher.apply_keystream(out);
}
