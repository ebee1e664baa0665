// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Calls for the running application.
//!
//! An application takes part in updates in two ways. After writing a new
//! image into UPDATE, it calls [`trigger_update`]; the swap happens on the
//! next reset. And after an update, once it's satisfied that it works, it
//! calls [`confirm_boot`]. An image that never confirms is rolled back after
//! its boot attempts run out.
//!
//! Neither call verifies anything. That is left to the bootloader.

use log::info;

use crate::flash::{Flash, FlashAreas};
use crate::image;
use crate::state::{self, Direction, PartitionState};
use crate::{AreaId, Error};

/// Flags the image in UPDATE for installation at the next boot.
pub fn trigger_update<F: Flash>(areas: &mut FlashAreas<F>) -> Result<(), Error> {
    state::request(areas, Direction::Install)?;
    info!("update requested");
    Ok(())
}

/// Marks the image in BOOT as good.
pub fn confirm_boot<F: Flash>(areas: &mut FlashAreas<F>) -> Result<(), Error> {
    state::set_partition_state(areas, AreaId::Boot, PartitionState::Success)?;
    info!("boot confirmed");
    Ok(())
}

/// Erases UPDATE: its state record first, so any pending request is dropped
/// before the image goes, then the image sectors. Use it to clear out a
/// candidate the bootloader refused, or to give up the previous image once a
/// new one is confirmed.
pub fn erase_update<F: Flash>(areas: &mut FlashAreas<F>) -> Result<(), Error> {
    state::reset(areas, AreaId::Update)?;
    let capacity = areas.layout().image_capacity();
    areas.erase(AreaId::Update, 0, capacity)?;
    info!("UPDATE erased");
    Ok(())
}

/// Version of the image in BOOT, if it has a readable header.
pub fn current_version<F: Flash>(areas: &mut FlashAreas<F>) -> Result<Option<u32>, Error> {
    version_of(areas, AreaId::Boot)
}

/// Version of the image in UPDATE, if it has a readable header.
pub fn update_version<F: Flash>(areas: &mut FlashAreas<F>) -> Result<Option<u32>, Error> {
    version_of(areas, AreaId::Update)
}

fn version_of<F: Flash>(areas: &mut FlashAreas<F>, area: AreaId) -> Result<Option<u32>, Error> {
    match image::read_header(areas, area) {
        Ok(header) => Ok(Some(header.version)),
        Err(Error::Malformed(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
