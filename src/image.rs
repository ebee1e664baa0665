// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image format.
//!
//! An image occupies the start of BOOT or UPDATE:
//!
//! ```text
//! [ header (header_len bytes) ][ payload (payload_size bytes) ][ TLV records ]
//! ```
//!
//! The header starts with the fixed 24-byte `ImageHeader`; anything between
//! that and `header_len` is padding, which lets images keep their payload
//! aligned however the target needs. The TLV records that follow the payload
//! carry the digest and signature. The digest covers the header and payload,
//! i.e. everything before the first record.
//!
//! Nothing in here trusts what it reads. Parsing only establishes that the
//! image is internally consistent and fits its area, and records *where* the
//! interesting fields are; [`crate::verify`] decides whether to believe them.

use core::mem::size_of;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::flash::{Flash, FlashAreas};
use crate::{AreaId, Error};

pub const IMAGE_MAGIC: u32 = 0xDEAD_BEEF;

/// Size of the fixed part of the header, and so the smallest legal
/// `header_len`.
pub const HEADER_SIZE: u32 = size_of::<ImageHeader>() as u32;

/// Bytes taken by a record's type and length fields.
const TLV_HEADER_SIZE: u32 = 4;

/// TLV record types.
pub mod tlv {
    /// Marks the end of the record list.
    pub const END: u16 = 0x0000;
    /// SHA-256 of header and payload.
    pub const DIGEST: u16 = 0x0001;
    /// Signature over the digest.
    pub const SIGNATURE: u16 = 0x0002;
    /// SHA-256 of the public key the image was signed with.
    pub const PUBKEY_HINT: u16 = 0x0003;
    /// What an unprogrammed record reads as; also ends the list.
    pub const ERASED: u16 = 0xFFFF;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, AsBytes, FromBytes)]
#[repr(C)]
pub struct ImageHeader {
    pub magic: u32,
    pub header_len: u32,
    pub payload_size: u32,
    pub version: u32,
    /// Where the image wants to run from, or 0 to run it where it sits.
    pub load_address: u32,
    /// Low byte [`ImageKind`], high byte [`AuthScheme`].
    pub image_type: u16,
    pub reserved: u16,
}

const_assert_eq!(size_of::<ImageHeader>(), 24);

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum ImageKind {
    /// A replacement for the bootloader itself.
    Bootloader = 0x00,
    App = 0x01,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum AuthScheme {
    Ed25519 = 0x01,
    EcdsaP256 = 0x02,
}

impl ImageHeader {
    pub fn kind(&self) -> Option<ImageKind> {
        ImageKind::from_u16(self.image_type & 0xFF)
    }

    pub fn auth(&self) -> Option<AuthScheme> {
        AuthScheme::from_u16(self.image_type >> 8)
    }

    pub fn image_type(kind: ImageKind, auth: AuthScheme) -> u16 {
        (auth as u16) << 8 | kind as u16
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImageError {
    BadMagic,
    /// `header_len` is shorter than the fixed header or longer than the area.
    BadHeaderLength,
    /// Header plus payload don't fit in the area.
    TooLarge,
    /// A TLV record runs past the end of the area.
    TrailerOverrun,
    /// Offsets in the header overflow.
    Overflow,
    MissingDigest,
    MissingSignature,
    /// A record type that may only appear once appeared again.
    Duplicate(u16),
}

/// Location of a TLV value within its area. We keep locations rather than
/// copies so nothing is buffered before it's needed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Field {
    pub offset: u32,
    pub len: u16,
}

/// An image that holds together structurally. Not trusted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ParsedImage {
    pub area: AreaId,
    pub header: ImageHeader,
    pub digest: Field,
    pub signature: Field,
    pub key_hint: Option<Field>,
}

impl ParsedImage {
    pub fn version(&self) -> u32 {
        self.header.version
    }

    /// Length of the digested range starting at offset 0. Checked against
    /// the area during parsing, so this can't overflow.
    pub fn signed_len(&self) -> u32 {
        self.header.header_len + self.header.payload_size
    }
}

/// Reads just the fixed header of the image in `area`, checking the magic.
pub fn read_header<F: Flash>(areas: &mut FlashAreas<F>, area: AreaId) -> Result<ImageHeader, Error> {
    let mut raw = [0; size_of::<ImageHeader>()];
    areas.read(area, 0, &mut raw)?;
    let header = ImageHeader::read_from(&raw[..]).ok_or(ImageError::BadHeaderLength)?;
    if header.magic != IMAGE_MAGIC {
        return Err(ImageError::BadMagic.into());
    }
    Ok(header)
}

pub fn parse<F: Flash>(areas: &mut FlashAreas<F>, area: AreaId) -> Result<ParsedImage, Error> {
    let header = read_header(areas, area)?;
    let capacity = areas.layout().image_capacity();

    if header.header_len < HEADER_SIZE || header.header_len > capacity {
        return Err(ImageError::BadHeaderLength.into());
    }
    let trailer = header
        .header_len
        .checked_add(header.payload_size)
        .ok_or(ImageError::Overflow)?;
    if trailer > capacity {
        return Err(ImageError::TooLarge.into());
    }

    let mut digest = None;
    let mut signature = None;
    let mut key_hint = None;

    let mut pos = trailer;
    // A list that runs into the end of the area without a terminator simply
    // ends there.
    while capacity - pos >= TLV_HEADER_SIZE {
        let mut raw = [0; TLV_HEADER_SIZE as usize];
        areas.read(area, pos, &mut raw)?;
        let kind = u16::from_le_bytes([raw[0], raw[1]]);
        let len = u16::from_le_bytes([raw[2], raw[3]]);
        if kind == tlv::END || kind == tlv::ERASED {
            break;
        }

        let value = pos + TLV_HEADER_SIZE;
        let end = value.checked_add(u32::from(len)).ok_or(ImageError::TrailerOverrun)?;
        if end > capacity {
            return Err(ImageError::TrailerOverrun.into());
        }

        let field = Field { offset: value, len };
        let slot = match kind {
            tlv::DIGEST => Some(&mut digest),
            tlv::SIGNATURE => Some(&mut signature),
            tlv::PUBKEY_HINT => Some(&mut key_hint),
            _ => None,
        };
        if let Some(slot) = slot {
            if slot.replace(field).is_some() {
                return Err(ImageError::Duplicate(kind).into());
            }
        }
        pos = end;
    }

    Ok(ParsedImage {
        area,
        header,
        digest: digest.ok_or(ImageError::MissingDigest)?,
        signature: signature.ok_or(ImageError::MissingSignature)?,
        key_hint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramflash::RamFlash;
    use crate::testutil::{flash_size, install, layout, ImageBuilder, SECTOR};
    use std::vec;
    use std::vec::Vec;

    fn parse_bytes(image: &[u8]) -> Result<ParsedImage, Error> {
        let mut mem = vec![0xFF; flash_size(4)];
        let mut areas = FlashAreas::new(RamFlash::new(&mut mem, SECTOR), layout(4));
        install(&mut areas, AreaId::Update, image);
        parse(&mut areas, AreaId::Update)
    }

    fn set_u32(image: &mut [u8], offset: usize, value: u32) {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn well_formed_image_parses() {
        let image = ImageBuilder::new(3).payload_len(1000).build();
        let parsed = parse_bytes(&image).unwrap();
        assert_eq!(parsed.area, AreaId::Update);
        assert_eq!(parsed.version(), 3);
        assert_eq!(parsed.header.payload_size, 1000);
        assert_eq!(parsed.signed_len(), parsed.header.header_len + 1000);
        assert_eq!(parsed.header.kind(), Some(ImageKind::App));
        assert_eq!(parsed.digest.len, 32);
        assert!(parsed.key_hint.is_some());
        // Records follow the payload directly.
        assert_eq!(parsed.digest.offset, parsed.signed_len() + TLV_HEADER_SIZE);
    }

    #[test]
    fn padded_header_is_accepted() {
        let image = ImageBuilder::new(1).header_len(256).build();
        let parsed = parse_bytes(&image).unwrap();
        assert_eq!(parsed.header.header_len, 256);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut image = ImageBuilder::new(1).build();
        set_u32(&mut image, 0, 0xFEEB_DAED);
        assert_eq!(parse_bytes(&image), Err(Error::Malformed(ImageError::BadMagic)));

        assert_eq!(parse_bytes(&[]), Err(Error::Malformed(ImageError::BadMagic)));
    }

    #[test]
    fn header_length_is_bounded() {
        let mut image = ImageBuilder::new(1).build();
        set_u32(&mut image, 4, HEADER_SIZE - 1);
        assert_eq!(parse_bytes(&image), Err(Error::Malformed(ImageError::BadHeaderLength)));

        set_u32(&mut image, 4, 4 * SECTOR + 1);
        assert_eq!(parse_bytes(&image), Err(Error::Malformed(ImageError::BadHeaderLength)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut image = ImageBuilder::new(1).build();
        set_u32(&mut image, 8, 4 * SECTOR);
        assert_eq!(parse_bytes(&image), Err(Error::Malformed(ImageError::TooLarge)));

        set_u32(&mut image, 8, u32::MAX - 8);
        assert_eq!(parse_bytes(&image), Err(Error::Malformed(ImageError::Overflow)));
    }

    #[test]
    fn unknown_records_are_skipped() {
        let image = ImageBuilder::new(1).extra_record(0x0042, &[1, 2, 3]).build();
        let parsed = parse_bytes(&image).unwrap();
        assert_eq!(parsed.version(), 1);
    }

    #[test]
    fn mandatory_records_are_required_once() {
        let image = ImageBuilder::new(1).without_signature().build();
        assert_eq!(parse_bytes(&image), Err(Error::Malformed(ImageError::MissingSignature)));

        let image = ImageBuilder::new(1).without_digest().build();
        assert_eq!(parse_bytes(&image), Err(Error::Malformed(ImageError::MissingDigest)));

        let image = ImageBuilder::new(1).extra_record(tlv::DIGEST, &[0; 32]).build();
        assert_eq!(
            parse_bytes(&image),
            Err(Error::Malformed(ImageError::Duplicate(tlv::DIGEST)))
        );
    }

    #[test]
    fn every_record_length_is_bounded() {
        // An unknown record placed first in the trailer, with every possible
        // length. Parsing must either skip it and keep going or refuse the
        // image; it must never read past the image-bearing part of the area.
        let image = ImageBuilder::new(1).payload_len(100).build();
        let trailer = trailer_start(&image);
        let mut base: Vec<u8> = image[..trailer].to_vec();
        base.extend_from_slice(&[0x42, 0x00, 0x00, 0x00]);

        let layout = layout(4);
        let capacity = layout.image_capacity();
        let mut mem = vec![0xFF; flash_size(4)];
        {
            let mut areas = FlashAreas::new(RamFlash::new(&mut mem, SECTOR), layout);
            install(&mut areas, AreaId::Update, &base);
        }
        let update = layout.area(AreaId::Update).offset as usize;
        let len_at = update + trailer + 2;

        for len in 0..=u16::MAX {
            mem[len_at..len_at + 2].copy_from_slice(&len.to_le_bytes());
            let mut areas = FlashAreas::new(RamFlash::new(&mut mem, SECTOR), layout);
            let result = parse(&mut areas, AreaId::Update);
            let end = trailer as u32 + TLV_HEADER_SIZE + u32::from(len);
            if end > capacity {
                assert_eq!(result, Err(Error::Malformed(ImageError::TrailerOverrun)), "len {}", len);
            } else {
                // Whatever follows is erased flash: the list ends without
                // the mandatory records.
                assert_eq!(result, Err(Error::Malformed(ImageError::MissingDigest)), "len {}", len);
            }
        }
    }

    fn trailer_start(image: &[u8]) -> usize {
        let header = ImageHeader::read_from_prefix(image).unwrap();
        (header.header_len + header.payload_size) as usize
    }
}
