// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signed-image verification and power-loss-safe A/B image exchange for a
//! bootloader.
//!
//! Flash is split into three areas:
//!
//! - BOOT holds the image that runs.
//! - UPDATE holds a candidate image (or, after an update, the previous one).
//! - SWAP is a single sector of scratch space.
//!
//! An update exchanges BOOT and UPDATE sector by sector through SWAP. Progress
//! is recorded in flash after every copy, so that power can be lost at any
//! point and the next boot picks up exactly where the last one stopped. Since
//! the exchange leaves the previous image in UPDATE, running it again in the
//! other direction is a rollback.
//!
//! Nothing is moved into BOOT unless it carries a valid signature from the
//! provisioned key, and nothing is booted without the same check.
//!
//! The crate is `no_std` and does no allocation. Hardware is reached only
//! through the [`flash::Flash`] and [`bsp::Bsp`] traits.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod boot;
pub mod bsp;
pub mod control;
pub mod flash;
pub mod image;
pub mod ramflash;
pub mod state;
pub mod update;
pub mod verify;

#[cfg(test)]
mod testutil;

use num_derive::FromPrimitive;
use static_assertions::const_assert;

pub use boot::{BootConfig, BootTarget, Bootloader};
pub use flash::{Area, Flash, FlashAreas, FlashError, Layout, LayoutError, Region};
pub use image::{ImageError, ParsedImage};
pub use state::{Phase, UpdateState};
pub use update::{Rejection, RunningBootloader};
pub use verify::{TrustedImage, Untrusted};

// Image headers and state records are read straight out of flash as native
// integers.
const_assert!(cfg!(target_endian = "little"));

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum AreaId {
    Boot = 0,
    Update = 1,
    Swap = 2,
}

/// Everything that can stop the bootloader from making progress.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// An image's header or trailer doesn't hold together.
    Malformed(ImageError),
    /// An image is well-formed but failed verification.
    Untrusted(Untrusted),
    /// Flash access failed, or was out of bounds.
    Flash(FlashError),
    /// The image under test has used up its boot attempts.
    Exhausted,
    /// A verified candidate was refused by policy.
    Rejected(Rejection),
    /// Neither area holds anything we're willing to run.
    NoBootableImage,
}

impl Error {
    /// True for failures that condemn a candidate image, as opposed to
    /// failures of the device.
    pub fn is_candidate_fault(&self) -> bool {
        matches!(self, Error::Malformed(_) | Error::Untrusted(_) | Error::Rejected(_))
    }
}

impl From<ImageError> for Error {
    fn from(e: ImageError) -> Self {
        Error::Malformed(e)
    }
}

impl From<Untrusted> for Error {
    fn from(e: Untrusted) -> Self {
        Error::Untrusted(e)
    }
}

impl From<FlashError> for Error {
    fn from(e: FlashError) -> Self {
        Error::Flash(e)
    }
}

impl From<Rejection> for Error {
    fn from(e: Rejection) -> Self {
        Error::Rejected(e)
    }
}
