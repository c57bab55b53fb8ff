//! BLS12-381 signatures, threshold shares and polynomial commitments

use crate::types::{DistPublic, Share};
use crate::{Error, Result};
use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::Curve;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Domain separation for hashing messages onto G1
const HASH_DST: &[u8] = b"BEACON_BLS12381G1_SHA-256_TAI_";

/// Length of the index prefix of a partial signature
const INDEX_LEN: usize = 2;

/// Sample a uniformly random scalar
pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    Scalar::random(rng)
}

/// Parse a canonical little endian scalar
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("invalid scalar length".into()))?;
    Option::<Scalar>::from(Scalar::from_bytes(&array))
        .ok_or_else(|| Error::Crypto("non canonical scalar".into()))
}

/// Parse a compressed G1 point
pub fn g1_from_bytes(bytes: &[u8]) -> Result<G1Affine> {
    let array: [u8; 48] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("invalid G1 point length".into()))?;
    Option::<G1Affine>::from(G1Affine::from_compressed(&array))
        .ok_or_else(|| Error::Crypto("invalid G1 point".into()))
}

/// Parse a compressed G2 point
pub fn g2_from_bytes(bytes: &[u8]) -> Result<G2Affine> {
    let array: [u8; 96] = bytes
        .try_into()
        .map_err(|_| Error::Crypto("invalid G2 point length".into()))?;
    Option::<G2Affine>::from(G2Affine::from_compressed(&array))
        .ok_or_else(|| Error::Crypto("invalid G2 point".into()))
}

/// Public key of a secret scalar, compressed
pub fn public_from_secret(secret: &Scalar) -> Vec<u8> {
    (G2Projective::generator() * secret)
        .to_affine()
        .to_compressed()
        .to_vec()
}

/// Hash a message onto G1 by try-and-increment with cofactor clearing
pub fn hash_to_g1(msg: &[u8]) -> G1Affine {
    let mut counter = 0u32;
    loop {
        let mut candidate = [0u8; 48];
        for (i, chunk) in candidate.chunks_mut(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(HASH_DST);
            hasher.update(counter.to_be_bytes());
            hasher.update([i as u8]);
            hasher.update(msg);
            let digest = hasher.finalize();
            chunk.copy_from_slice(&digest[..chunk.len()]);
        }
        let sign = candidate[47] & 0x20;
        // compression flag, no infinity flag, sign bit taken from the hash
        candidate[0] = (candidate[0] & 0x1f) | 0x80 | sign;

        if let Some(point) = Option::<G1Affine>::from(G1Affine::from_compressed_unchecked(&candidate)) {
            let cleared = G1Projective::from(point).clear_cofactor();
            if !bool::from(cleared.is_identity()) {
                return cleared.to_affine();
            }
        }
        counter += 1;
    }
}

/// Plain BLS signature
pub fn sign(secret: &Scalar, msg: &[u8]) -> Vec<u8> {
    (G1Projective::from(hash_to_g1(msg)) * secret)
        .to_affine()
        .to_compressed()
        .to_vec()
}

/// Verify a plain BLS signature against a compressed public key
pub fn verify(public: &[u8], msg: &[u8], signature: &[u8]) -> Result<()> {
    let public = g2_from_bytes(public)?;
    verify_point(&public, msg, signature)
}

fn verify_point(public: &G2Affine, msg: &[u8], signature: &[u8]) -> Result<()> {
    let sig = g1_from_bytes(signature)?;
    let hashed = hash_to_g1(msg);
    if pairing(&sig, &G2Affine::generator()) == pairing(&hashed, public) {
        Ok(())
    } else {
        Err(Error::Crypto("invalid signature".into()))
    }
}

/// Random polynomial with `threshold` coefficients, optionally fixing
/// the constant term
pub fn random_poly<R: RngCore + CryptoRng>(
    secret: Option<Scalar>,
    threshold: usize,
    rng: &mut R,
) -> Vec<Scalar> {
    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(secret.unwrap_or_else(|| Scalar::random(&mut *rng)));
    for _ in 1..threshold {
        coefficients.push(Scalar::random(&mut *rng));
    }
    coefficients
}

/// Evaluate a polynomial at the evaluation point of `index` (index + 1)
pub fn eval_poly(coefficients: &[Scalar], index: u32) -> Scalar {
    let x = Scalar::from(index as u64 + 1);
    let mut result = Scalar::ZERO;
    for coeff in coefficients.iter().rev() {
        result = result * x + coeff;
    }
    result
}

/// Feldman commitments to every coefficient
pub fn commit_poly(coefficients: &[Scalar]) -> Vec<Vec<u8>> {
    coefficients.iter().map(public_from_secret).collect()
}

/// Evaluate commitments at the evaluation point of `index`
pub fn eval_commits(commits: &[Vec<u8>], index: u32) -> Result<G2Affine> {
    let x = Scalar::from(index as u64 + 1);
    let mut x_power = Scalar::ONE;
    let mut acc = G2Projective::identity();
    for commit in commits {
        acc += G2Projective::from(g2_from_bytes(commit)?) * x_power;
        x_power *= x;
    }
    Ok(acc.to_affine())
}

/// Public key share of `index` under a distributed public key
pub fn public_share(public: &DistPublic, index: u32) -> Result<G2Affine> {
    eval_commits(&public.coefficients, index)
}

/// Lagrange coefficient at zero for the node at `index` among `indices`
pub fn lagrange_coefficient(index: u32, indices: &[u32]) -> Result<Scalar> {
    let x_i = Scalar::from(index as u64 + 1);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for &j in indices {
        if j == index {
            continue;
        }
        let x_j = Scalar::from(j as u64 + 1);
        numerator *= x_j;
        denominator *= x_j - x_i;
    }
    Option::<Scalar>::from(denominator.invert())
        .map(|inv| numerator * inv)
        .ok_or_else(|| Error::Crypto("duplicate index in interpolation".into()))
}

/// Partial signature of a share: index (big endian u16) followed by the
/// signature point
pub fn sign_partial(share: &Share, msg: &[u8]) -> Result<Vec<u8>> {
    let secret = scalar_from_bytes(&share.secret)?;
    let index = u16::try_from(share.index)
        .map_err(|_| Error::Crypto(format!("share index {} too large", share.index)))?;
    let mut partial = index.to_be_bytes().to_vec();
    partial.extend(sign(&secret, msg));
    Ok(partial)
}

/// Signer index of a partial signature
pub fn partial_index(partial: &[u8]) -> Result<u32> {
    if partial.len() <= INDEX_LEN {
        return Err(Error::Crypto("partial signature too short".into()));
    }
    Ok(u16::from_be_bytes([partial[0], partial[1]]) as u32)
}

/// Verify a partial signature against the distributed public key
pub fn verify_partial(public: &DistPublic, msg: &[u8], partial: &[u8]) -> Result<()> {
    let index = partial_index(partial)?;
    let key = public_share(public, index)?;
    verify_point(&key, msg, &partial[INDEX_LEN..])
}

/// Combine `threshold` distinct partial signatures into the full one
pub fn recover(partials: &[Vec<u8>], threshold: usize) -> Result<Vec<u8>> {
    let mut by_index = BTreeMap::new();
    for partial in partials {
        let index = partial_index(partial)?;
        by_index
            .entry(index)
            .or_insert(g1_from_bytes(&partial[INDEX_LEN..])?);
    }
    if by_index.len() < threshold {
        return Err(Error::ThresholdNotMet {
            required: threshold,
            actual: by_index.len(),
        });
    }

    let selected: Vec<(u32, G1Affine)> = by_index.into_iter().take(threshold).collect();
    let indices: Vec<u32> = selected.iter().map(|(i, _)| *i).collect();
    let mut acc = G1Projective::identity();
    for (index, sig) in &selected {
        acc += G1Projective::from(*sig) * lagrange_coefficient(*index, &indices)?;
    }
    Ok(acc.to_affine().to_compressed().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn shares(threshold: usize, n: u32) -> (Vec<Share>, DistPublic) {
        let poly = random_poly(None, threshold, &mut OsRng);
        let public = DistPublic {
            coefficients: commit_poly(&poly),
        };
        let shares = (0..n)
            .map(|index| Share {
                index,
                secret: eval_poly(&poly, index).to_bytes().to_vec(),
                commits: public.clone(),
            })
            .collect();
        (shares, public)
    }

    #[test]
    fn test_sign_verify() {
        let secret = random_scalar(&mut OsRng);
        let public = public_from_secret(&secret);
        let sig = sign(&secret, b"hello");

        assert!(verify(&public, b"hello", &sig).is_ok());
        assert!(verify(&public, b"other", &sig).is_err());
    }

    #[test]
    fn test_lagrange_sums_to_one() {
        let indices = vec![0, 1, 2];
        let sum = indices
            .iter()
            .map(|i| lagrange_coefficient(*i, &indices).unwrap())
            .fold(Scalar::ZERO, |acc, l| acc + l);
        assert_eq!(sum, Scalar::ONE);
    }

    #[test]
    fn test_threshold_recover() {
        let (shares, public) = shares(2, 3);
        let msg = b"round 1";

        let partials: Vec<Vec<u8>> = shares
            .iter()
            .map(|s| sign_partial(s, msg).unwrap())
            .collect();
        for partial in &partials {
            assert!(verify_partial(&public, msg, partial).is_ok());
        }

        let full_a = recover(&partials[..2], 2).unwrap();
        let full_b = recover(&partials[1..], 2).unwrap();
        assert_eq!(full_a, full_b);
        assert!(verify(public.key(), msg, &full_a).is_ok());
    }

    #[test]
    fn test_recover_needs_distinct_signers() {
        let (shares, _) = shares(2, 3);
        let partial = sign_partial(&shares[0], b"m").unwrap();
        let result = recover(&[partial.clone(), partial], 2);
        assert!(matches!(result, Err(Error::ThresholdNotMet { required: 2, actual: 1 })));
    }

    #[test]
    fn test_partial_with_wrong_index_fails() {
        let (shares, public) = shares(2, 3);
        let mut partial = sign_partial(&shares[0], b"m").unwrap();
        partial[1] = 2;
        assert!(verify_partial(&public, b"m", &partial).is_err());
    }
}
