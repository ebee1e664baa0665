// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types and hooks for implementing Board Support Packages (BSPs).
//!
//! The core doesn't care much about the board. It needs a way to reach flash,
//! to know where the three areas are, the key to check images against, and a
//! way to leave. The exact properties are in the `Bsp` trait below.
//!
//! To implement a BSP:
//!
//! 1. Create a crate (or a module in your firmware) named after your board.
//! 2. Define a type called `Board`. This type will never be instantiated, so
//!    it can be arbitrary; an empty enum is easy.
//! 3. Implement `Flash` for your flash controller, and `Bsp` for `Board`.
//! 4. Call `swapboot::boot::start::<Board>()` from your reset handler.

use crate::boot::{BootConfig, BootTarget};
use crate::flash::{Flash, Layout, LayoutError};
use crate::update::RunningBootloader;

/// Requirements placed upon a BSP type.
pub trait Bsp {
    type Flash: Flash;

    /// Set up whatever needs setting up before flash can be read: clocks,
    /// the flash controller, a debug UART for the log.
    fn hal_init() {}

    /// Takes the flash device(s). Called once.
    fn flash() -> Self::Flash;

    /// Where BOOT, UPDATE and SWAP live. This is usually a constant, but goes
    /// through `Layout::new` so that a bad one stops us before any flash is
    /// touched.
    fn layout() -> Result<Layout, LayoutError>;

    /// The key images must be signed with, encoded for the build's signature
    /// scheme.
    fn public_key() -> &'static [u8];

    fn config() -> BootConfig {
        BootConfig::default()
    }

    /// Where this bootloader is stored and its version, if it may be
    /// replaced by a bootloader image staged in UPDATE. The region must lie
    /// outside BOOT, UPDATE and SWAP.
    fn bootloader() -> Option<RunningBootloader> {
        None
    }

    /// Restarts the device, e.g. into a freshly written bootloader.
    fn reset() -> !;

    /// Last chance to act before the jump, e.g. copying an image with a load
    /// address into RAM or turning off peripherals the image doesn't expect
    /// to find on.
    fn prepare_boot(_target: &BootTarget) {}

    /// Transfers control to the verified image. Does not return.
    fn jump_to(entry: u32) -> !;

    /// Called when there's nothing we're willing to boot. Generally speaking
    /// there's not much more to do than indicate a fault and spin.
    fn halt() -> !;
}
