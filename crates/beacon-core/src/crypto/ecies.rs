//! ECIES over G2 used to send DKG deals to their recipient only

use crate::{Error, Result};
use bls12_381::{G2Affine, G2Projective, Scalar};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ff::Field;
use group::Curve;
use rand_core::{CryptoRng, RngCore};

use super::g2_from_bytes;

const KDF_CONTEXT: &str = "beacon-core 2024 dkg deal encryption";
const POINT_LEN: usize = 96;
const NONCE_LEN: usize = 12;

fn derive_key(shared: &G2Affine, ephemeral: &[u8]) -> [u8; 32] {
    let mut material = shared.to_compressed().to_vec();
    material.extend_from_slice(ephemeral);
    blake3::derive_key(KDF_CONTEXT, &material)
}

/// Encrypt `plaintext` to the holder of `public`.
///
/// Output layout: ephemeral point || nonce || ciphertext.
pub fn encrypt<R: RngCore + CryptoRng>(public: &[u8], plaintext: &[u8], rng: &mut R) -> Result<Vec<u8>> {
    let public = g2_from_bytes(public)?;
    let r = Scalar::random(&mut *rng);
    let ephemeral = (G2Projective::generator() * r).to_affine().to_compressed();
    let shared = (G2Projective::from(public) * r).to_affine();
    let key = derive_key(&shared, &ephemeral);

    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(POINT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&ephemeral);
    out.extend_from_slice(&nonce);
    out.extend(ciphertext);
    Ok(out)
}

/// Decrypt a ciphertext produced by [`encrypt`] with the matching secret
pub fn decrypt(secret: &Scalar, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < POINT_LEN + NONCE_LEN {
        return Err(Error::Crypto("ciphertext too short".into()));
    }
    let (ephemeral, rest) = ciphertext.split_at(POINT_LEN);
    let (nonce, body) = rest.split_at(NONCE_LEN);
    let point = g2_from_bytes(ephemeral)?;
    let shared = (G2Projective::from(point) * secret).to_affine();
    let key = derive_key(&shared, ephemeral);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|e| Error::Crypto(format!("decryption failed: {}", e)))
}
