//! Ticket authentication: the password encrypted to the server's RSA key.

use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};

use crate::error::SpiceError;

/// Encrypt `password` plus a trailing NUL under the DER SubjectPublicKeyInfo
/// the server sent in its link reply.
///
/// Uses RSA-OAEP with SHA-1. The result is as long as the key modulus.
pub fn encrypt_ticket(pubkey_der: &[u8], password: &str) -> Result<Vec<u8>, SpiceError> {
    let key = RsaPublicKey::from_public_key_der(pubkey_der)
        .map_err(|e| SpiceError::Auth(format!("invalid server public key: {e}")))?;

    let mut plain = Vec::with_capacity(password.len() + 1);
    plain.extend_from_slice(password.as_bytes());
    plain.push(0);

    let mut rng = rand::thread_rng();
    Ok(key.encrypt(&mut rng, Oaep::new::<sha1::Sha1>(), &plain)?)
}
