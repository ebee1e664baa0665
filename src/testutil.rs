// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for tests: a small flash layout, and signed test images.

use std::vec;
use std::vec::Vec;

use hex_literal::hex;
use sha2::{Digest, Sha256};
use zerocopy::AsBytes;

use crate::flash::{Area, Flash, FlashAreas, Layout, INTERNAL_FLASH};
use crate::image::{tlv, AuthScheme, ImageHeader, ImageKind, IMAGE_MAGIC};
use crate::AreaId;

pub const SECTOR: u32 = 1024;

/// BOOT, UPDATE and SWAP back to back on device 0, with `image_sectors`
/// image-bearing sectors in BOOT and UPDATE.
pub fn layout(image_sectors: u32) -> Layout {
    let size = (image_sectors + 1) * SECTOR;
    Layout::new(
        Area::new(AreaId::Boot, INTERNAL_FLASH, 0, size, SECTOR),
        Area::new(AreaId::Update, INTERNAL_FLASH, size, size, SECTOR),
        Area::new(AreaId::Swap, INTERNAL_FLASH, 2 * size, SECTOR, SECTOR),
    )
    .unwrap()
}

/// Bytes of memory needed to back `layout(image_sectors)`.
pub fn flash_size(image_sectors: u32) -> usize {
    ((2 * (image_sectors + 1) + 1) * SECTOR) as usize
}

/// Erases the image-bearing part of an area and programs `image` at its start.
pub fn install<F: Flash>(areas: &mut FlashAreas<F>, id: AreaId, image: &[u8]) {
    let capacity = areas.layout().image_capacity();
    areas.erase(id, 0, capacity).unwrap();
    areas.write(id, 0, image).unwrap();
}

/// The image-bearing part of an area.
pub fn image_area<F: Flash>(areas: &mut FlashAreas<F>, id: AreaId) -> Vec<u8> {
    let mut buf = vec![0; areas.layout().image_capacity() as usize];
    areas.read(id, 0, &mut buf).unwrap();
    buf
}

cfg_if::cfg_if! {
    if #[cfg(feature = "sign-ecc256")] {
        const AUTH: AuthScheme = AuthScheme::EcdsaP256;

        const SIGNING_KEY: [u8; 32] =
            hex!("c9afa9d845ba75166b5c215767b1d6934e50c3db36e89b127b8a622b120f6721");
        const OTHER_KEY: [u8; 32] =
            hex!("0f56db78ca460b055c500064824bed999a25aaf48ebb519ac201537b85479813");

        fn signing_key(secret: &[u8; 32]) -> p256::ecdsa::SigningKey {
            p256::ecdsa::SigningKey::from_bytes(secret.into()).unwrap()
        }

        fn public_key_of(secret: &[u8; 32]) -> Vec<u8> {
            signing_key(secret)
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec()
        }

        fn sign(secret: &[u8; 32], digest: &[u8; 32]) -> Vec<u8> {
            use p256::ecdsa::signature::hazmat::PrehashSigner;
            let signature: p256::ecdsa::Signature = signing_key(secret).sign_prehash(digest).unwrap();
            signature.to_bytes().to_vec()
        }
    } else if #[cfg(feature = "sign-ed25519")] {
        const AUTH: AuthScheme = AuthScheme::Ed25519;

        const SIGNING_KEY: [u8; 32] =
            hex!("9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60");
        const OTHER_KEY: [u8; 32] =
            hex!("4ccd089b28ff96da9db6c346ec114e0f5b8a319f35aba624da8cf6ed4fb8a6fb");

        fn public_key_of(secret: &[u8; 32]) -> Vec<u8> {
            ed25519_dalek::SigningKey::from_bytes(secret)
                .verifying_key()
                .to_bytes()
                .to_vec()
        }

        fn sign(secret: &[u8; 32], digest: &[u8; 32]) -> Vec<u8> {
            use ed25519_dalek::Signer;
            ed25519_dalek::SigningKey::from_bytes(secret)
                .sign(digest)
                .to_bytes()
                .to_vec()
        }
    }
}

/// The key test images are signed with, as the bootloader would have it
/// provisioned.
pub fn public_key() -> Vec<u8> {
    public_key_of(&SIGNING_KEY)
}

/// A valid key that signed nothing.
pub fn other_public_key() -> Vec<u8> {
    public_key_of(&OTHER_KEY)
}

pub struct ImageBuilder {
    version: u32,
    header_len: u32,
    payload_len: u32,
    load_address: u32,
    image_type: u16,
    digest: bool,
    signature: bool,
    key_hint: bool,
    corrupt_signature: bool,
    extra: Vec<(u16, Vec<u8>)>,
}

impl ImageBuilder {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            header_len: 64,
            payload_len: 2000,
            load_address: 0,
            image_type: ImageHeader::image_type(ImageKind::App, AUTH),
            digest: true,
            signature: true,
            key_hint: true,
            corrupt_signature: false,
            extra: Vec::new(),
        }
    }

    pub fn header_len(mut self, len: u32) -> Self {
        self.header_len = len;
        self
    }

    pub fn payload_len(mut self, len: u32) -> Self {
        self.payload_len = len;
        self
    }

    pub fn load_address(mut self, address: u32) -> Self {
        self.load_address = address;
        self
    }

    pub fn image_type(mut self, image_type: u16) -> Self {
        self.image_type = image_type;
        self
    }

    /// Marks the image as a bootloader replacement.
    pub fn bootloader(self) -> Self {
        self.image_type(ImageHeader::image_type(ImageKind::Bootloader, AUTH))
    }

    pub fn without_digest(mut self) -> Self {
        self.digest = false;
        self
    }

    pub fn without_signature(mut self) -> Self {
        self.signature = false;
        self
    }

    pub fn without_key_hint(mut self) -> Self {
        self.key_hint = false;
        self
    }

    /// Signs correctly, then flips a bit of the signature.
    pub fn corrupt_signature(mut self) -> Self {
        self.corrupt_signature = true;
        self
    }

    /// Appends a record after the standard ones.
    pub fn extra_record(mut self, kind: u16, value: &[u8]) -> Self {
        self.extra.push((kind, value.to_vec()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            header_len: self.header_len,
            payload_size: self.payload_len,
            version: self.version,
            load_address: self.load_address,
            image_type: self.image_type,
            reserved: 0,
        };
        let mut image = header.as_bytes().to_vec();
        image.resize(self.header_len as usize, 0);
        // Varies with the version so that different images differ throughout.
        image.extend((0..self.payload_len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(self.version as u8)));

        let digest: [u8; 32] = Sha256::digest(&image).into();
        let mut signature = sign(&SIGNING_KEY, &digest);
        if self.corrupt_signature {
            signature[5] ^= 0x10;
        }
        let hint: [u8; 32] = Sha256::digest(public_key()).into();

        if self.digest {
            push_record(&mut image, tlv::DIGEST, &digest);
        }
        if self.key_hint {
            push_record(&mut image, tlv::PUBKEY_HINT, &hint);
        }
        if self.signature {
            push_record(&mut image, tlv::SIGNATURE, &signature);
        }
        for (kind, value) in &self.extra {
            push_record(&mut image, *kind, value);
        }
        push_record(&mut image, tlv::END, &[]);
        image
    }
}

fn push_record(image: &mut Vec<u8>, kind: u16, value: &[u8]) {
    image.extend_from_slice(&kind.to_le_bytes());
    image.extend_from_slice(&(value.len() as u16).to_le_bytes());
    image.extend_from_slice(value);
}
