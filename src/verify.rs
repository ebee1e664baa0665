// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image authentication.
//!
//! An image is trusted if, and only if:
//!
//! 1. The SHA-256 of its header and payload, as they sit in flash right now,
//!    matches its digest record.
//! 2. Its public-key hint, if it has one, is the hash of our key.
//! 3. Its signature record is a valid signature of that digest under our key.
//!
//! The signature scheme is fixed at build time by a `sign-*` feature. The
//! public key is provisioned by the board and is never read from the image.

use sha2::{Digest, Sha256};

use crate::flash::{Flash, FlashAreas};
use crate::image::{AuthScheme, Field, ImageHeader, ParsedImage};
use crate::{AreaId, Error};

/// Size of a SHA-256 digest.
pub const DIGEST_LEN: usize = 32;

/// Largest signature record we'll read.
const MAX_SIGNATURE_LEN: usize = 128;

/// Flash is hashed through a buffer of this size.
const HASH_CHUNK: usize = 256;

/// Why an image wasn't trusted. Useful for logs, never for decisions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Untrusted {
    /// The digest record isn't the size of a SHA-256 digest.
    DigestLength,
    /// The image's contents don't match its digest record.
    DigestMismatch,
    /// The image names a different signing key.
    KeyHintMismatch,
    /// The provisioned key couldn't be decoded.
    BadKey,
    /// The signature record couldn't be decoded.
    BadSignatureEncoding,
    BadSignature,
}

/// A signature algorithm, applied to a precomputed digest.
pub trait SignatureScheme {
    /// How images signed this way mark their header.
    const AUTH: AuthScheme;

    fn verify(public_key: &[u8], digest: &[u8; DIGEST_LEN], signature: &[u8]) -> Result<(), Untrusted>;
}

/// ECDSA over NIST P-256. Keys are SEC1-encoded points; signatures are the
/// fixed 64-byte `r || s` form.
#[cfg(feature = "sign-ecc256")]
pub enum Ecc256 {}

#[cfg(feature = "sign-ecc256")]
impl SignatureScheme for Ecc256 {
    const AUTH: AuthScheme = AuthScheme::EcdsaP256;

    fn verify(public_key: &[u8], digest: &[u8; DIGEST_LEN], signature: &[u8]) -> Result<(), Untrusted> {
        use p256::ecdsa::signature::hazmat::PrehashVerifier;
        use p256::ecdsa::{Signature, VerifyingKey};

        let key = VerifyingKey::from_sec1_bytes(public_key).map_err(|_| Untrusted::BadKey)?;
        let signature = Signature::from_slice(signature).map_err(|_| Untrusted::BadSignatureEncoding)?;
        key.verify_prehash(digest, &signature).map_err(|_| Untrusted::BadSignature)
    }
}

/// Ed25519, signing the 32-byte digest as its message.
#[cfg(feature = "sign-ed25519")]
pub enum Ed25519 {}

#[cfg(feature = "sign-ed25519")]
impl SignatureScheme for Ed25519 {
    const AUTH: AuthScheme = AuthScheme::Ed25519;

    fn verify(public_key: &[u8], digest: &[u8; DIGEST_LEN], signature: &[u8]) -> Result<(), Untrusted> {
        use ed25519_dalek::{Signature, VerifyingKey};

        let key: &[u8; 32] = public_key.try_into().map_err(|_| Untrusted::BadKey)?;
        let key = VerifyingKey::from_bytes(key).map_err(|_| Untrusted::BadKey)?;
        let signature: &[u8; 64] = signature.try_into().map_err(|_| Untrusted::BadSignatureEncoding)?;
        let signature = Signature::from_bytes(signature);
        key.verify_strict(digest, &signature).map_err(|_| Untrusted::BadSignature)
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "sign-ecc256")] {
        /// The scheme this build verifies with.
        pub type Scheme = Ecc256;
    } else if #[cfg(feature = "sign-ed25519")] {
        /// The scheme this build verifies with.
        pub type Scheme = Ed25519;
    }
}

/// Proof that an image passed verification.
///
/// This can only be made by [`verify`]. Operations that move an image into
/// BOOT ask for one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TrustedImage {
    area: AreaId,
    header: ImageHeader,
}

impl TrustedImage {
    pub fn area(&self) -> AreaId {
        self.area
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }
}

pub fn verify<F: Flash>(
    areas: &mut FlashAreas<F>,
    image: &ParsedImage,
    public_key: &[u8],
) -> Result<TrustedImage, Error> {
    verify_with::<F, Scheme>(areas, image, public_key)
}

/// [`verify`], with the signature scheme spelled out.
pub fn verify_with<F: Flash, S: SignatureScheme>(
    areas: &mut FlashAreas<F>,
    image: &ParsedImage,
    public_key: &[u8],
) -> Result<TrustedImage, Error> {
    if usize::from(image.digest.len) != DIGEST_LEN {
        return Err(Untrusted::DigestLength.into());
    }
    let computed = hash_range(areas, image.area, image.signed_len())?;
    let recorded = read_digest(areas, image.area, image.digest)?;
    if computed != recorded {
        return Err(Untrusted::DigestMismatch.into());
    }

    if let Some(hint) = image.key_hint {
        if usize::from(hint.len) != DIGEST_LEN {
            return Err(Untrusted::KeyHintMismatch.into());
        }
        let expected: [u8; DIGEST_LEN] = Sha256::digest(public_key).into();
        if read_digest(areas, image.area, hint)? != expected {
            return Err(Untrusted::KeyHintMismatch.into());
        }
    }

    let len = usize::from(image.signature.len);
    if len > MAX_SIGNATURE_LEN {
        return Err(Untrusted::BadSignatureEncoding.into());
    }
    let mut signature = [0; MAX_SIGNATURE_LEN];
    areas.read(image.area, image.signature.offset, &mut signature[..len])?;
    S::verify(public_key, &computed, &signature[..len])?;

    Ok(TrustedImage { area: image.area, header: image.header })
}

/// SHA-256 of the first `len` bytes of an area.
fn hash_range<F: Flash>(areas: &mut FlashAreas<F>, area: AreaId, len: u32) -> Result<[u8; DIGEST_LEN], Error> {
    let mut hasher = Sha256::new();
    let mut buf = [0; HASH_CHUNK];
    let mut pos = 0;
    while pos < len {
        let n = core::cmp::min(HASH_CHUNK as u32, len - pos);
        let chunk = &mut buf[..n as usize];
        areas.read(area, pos, chunk)?;
        hasher.update(&*chunk);
        pos += n;
    }
    Ok(hasher.finalize().into())
}

fn read_digest<F: Flash>(areas: &mut FlashAreas<F>, area: AreaId, field: Field) -> Result<[u8; DIGEST_LEN], Error> {
    let mut value = [0; DIGEST_LEN];
    areas.read(area, field.offset, &mut value)?;
    Ok(value)
}
