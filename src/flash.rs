// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash areas and the hardware capability underneath them.
//!
//! Everything above this module talks about flash in terms of an [`AreaId`]
//! and an offset relative to the start of that area. This module is the only
//! place that turns those into physical addresses, and the only place that
//! calls into the board's [`Flash`] implementation to change the contents of
//! the medium.
//!
//! Every access is bounds-checked against the owning area before it reaches
//! hardware. An out-of-bounds request fails as a whole; nothing is partially
//! read or written.

use num_traits::FromPrimitive;

use crate::AreaId;

/// Identifies a physical flash device on boards with more than one (say, an
/// internal array plus a SPI part).
pub type DeviceId = u8;

/// The device ID used by boards with a single flash array.
pub const INTERNAL_FLASH: DeviceId = 0;

/// Size of the bounce buffer used when copying between areas.
const COPY_CHUNK: usize = 256;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashError {
    /// The requested area identifier does not name a configured area.
    NotFound,
    /// The request would touch bytes outside its area.
    OutOfBounds,
    /// The hardware reported a failure (or, in simulation, lost power).
    HardwareFault,
}

/// Flash operations a board must provide.
///
/// Addresses are absolute within `device`. Implementations may assume that
/// the core only writes to bytes it has erased since they were last written,
/// and that erase requests are sector-aligned. Writes on NOR flash can only
/// clear bits; the core relies on nothing stronger than that.
///
/// `write` and `erase` are only issued between `unlock` and `lock` for the
/// same device.
pub trait Flash {
    fn read(&mut self, device: DeviceId, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;
    fn write(&mut self, device: DeviceId, address: u32, data: &[u8]) -> Result<(), FlashError>;
    fn erase(&mut self, device: DeviceId, address: u32, len: u32) -> Result<(), FlashError>;
    fn unlock(&mut self, device: DeviceId);
    fn lock(&mut self, device: DeviceId);
}

/// A named, fixed region of a flash device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Area {
    pub id: AreaId,
    pub device: DeviceId,
    /// Offset of the area from the base of its device.
    pub offset: u32,
    pub size: u32,
    pub sector_size: u32,
}

impl Area {
    pub const fn new(
        id: AreaId,
        device: DeviceId,
        offset: u32,
        size: u32,
        sector_size: u32,
    ) -> Self {
        Self { id, device, offset, size, sector_size }
    }

    pub fn sector_count(&self) -> u32 {
        self.size / self.sector_size
    }

    fn overlaps(&self, other: &Area) -> bool {
        self.device == other.device
            && u64::from(self.offset) < u64::from(other.offset) + u64::from(other.size)
            && u64::from(other.offset) < u64::from(self.offset) + u64::from(self.size)
    }

    /// Checks that `len` bytes at `offset` are inside the area and returns the
    /// absolute address of the first one.
    fn locate(&self, offset: u32, len: usize) -> Result<u32, FlashError> {
        let len = u32::try_from(len).map_err(|_| FlashError::OutOfBounds)?;
        let end = offset.checked_add(len).ok_or(FlashError::OutOfBounds)?;
        if end > self.size {
            return Err(FlashError::OutOfBounds);
        }
        self.offset.checked_add(offset).ok_or(FlashError::OutOfBounds)
    }
}

/// A stretch of flash outside the layout, such as the one the bootloader
/// itself runs from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub device: DeviceId,
    pub offset: u32,
    pub size: u32,
    pub sector_size: u32,
}

impl Region {
    fn overlaps(&self, area: &Area) -> bool {
        self.device == area.device
            && u64::from(self.offset) < u64::from(area.offset) + u64::from(area.size)
            && u64::from(area.offset) < u64::from(self.offset) + u64::from(self.size)
    }
}

/// The erase unit containing some offset of an area.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Sector {
    /// Offset of the sector relative to the start of its area.
    pub offset: u32,
    pub size: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LayoutError {
    /// An area was passed in the wrong position (e.g. the SWAP area as BOOT).
    WrongRole(AreaId),
    /// BOOT and UPDATE differ in size.
    SizeMismatch,
    /// The areas don't share a sector size, so sectors can't be exchanged.
    SectorMismatch,
    /// SWAP must be exactly one sector.
    SwapNotOneSector,
    /// An area isn't a whole number of sectors, or has zero-sized sectors.
    Misaligned(AreaId),
    /// BOOT/UPDATE need at least one image sector plus the state sector.
    TooSmall,
    /// Two areas on the same device share bytes.
    Overlap(AreaId, AreaId),
    /// The state sector can't hold a step flag for every image sector.
    StateSectorTooSmall,
}

/// The partition layout of a board: where BOOT, UPDATE and SWAP live.
///
/// The last sector of BOOT and of UPDATE is reserved for that area's
/// persisted update state (see [`crate::state`]); images and the exchange only
/// ever cover the sectors before it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Layout {
    boot: Area,
    update: Area,
    swap: Area,
}

impl Layout {
    pub fn new(boot: Area, update: Area, swap: Area) -> Result<Self, LayoutError> {
        for (area, role) in [(&boot, AreaId::Boot), (&update, AreaId::Update), (&swap, AreaId::Swap)] {
            if area.id != role {
                return Err(LayoutError::WrongRole(area.id));
            }
            if area.sector_size == 0 || area.size % area.sector_size != 0 {
                return Err(LayoutError::Misaligned(area.id));
            }
            if u64::from(area.offset) + u64::from(area.size) > u64::from(u32::MAX) + 1 {
                return Err(LayoutError::Misaligned(area.id));
            }
        }
        if boot.size != update.size {
            return Err(LayoutError::SizeMismatch);
        }
        if boot.sector_size != update.sector_size || boot.sector_size != swap.sector_size {
            return Err(LayoutError::SectorMismatch);
        }
        if swap.size != swap.sector_size {
            return Err(LayoutError::SwapNotOneSector);
        }
        if boot.sector_count() < 2 {
            return Err(LayoutError::TooSmall);
        }
        for (a, b) in [(&boot, &update), (&boot, &swap), (&update, &swap)] {
            if a.overlaps(b) {
                return Err(LayoutError::Overlap(a.id, b.id));
            }
        }
        let layout = Self { boot, update, swap };
        if crate::state::flag_capacity(boot.sector_size) < layout.image_sectors() {
            return Err(LayoutError::StateSectorTooSmall);
        }
        Ok(layout)
    }

    pub fn area(&self, id: AreaId) -> &Area {
        match id {
            AreaId::Boot => &self.boot,
            AreaId::Update => &self.update,
            AreaId::Swap => &self.swap,
        }
    }

    pub fn sector_size(&self) -> u32 {
        self.swap.sector_size
    }

    /// Number of sectors of BOOT/UPDATE that carry image bytes and take part
    /// in the exchange.
    pub fn image_sectors(&self) -> u32 {
        self.boot.sector_count() - 1
    }

    /// Largest image (header + payload + TLV trailer) an area can carry.
    pub fn image_capacity(&self) -> u32 {
        self.image_sectors() * self.sector_size()
    }

    /// Offset of the reserved state sector within BOOT and UPDATE.
    pub fn state_offset(&self) -> u32 {
        self.image_capacity()
    }
}

/// Keeps a device unlocked for programming and relocks it when dropped, so
/// that every exit path (including `?` on a hardware fault) restores the lock.
struct Unlocked<'a, F: Flash> {
    flash: &'a mut F,
    device: DeviceId,
}

impl<'a, F: Flash> Unlocked<'a, F> {
    fn new(flash: &'a mut F, device: DeviceId) -> Self {
        flash.unlock(device);
        Self { flash, device }
    }
}

impl<F: Flash> Drop for Unlocked<'_, F> {
    fn drop(&mut self) {
        self.flash.lock(self.device);
    }
}

/// A flash device (or set of devices) viewed through a partition [`Layout`].
pub struct FlashAreas<F> {
    flash: F,
    layout: Layout,
}

impl<F: Flash> FlashAreas<F> {
    pub fn new(flash: F, layout: Layout) -> Self {
        Self { flash, layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    /// Resolves a raw area identifier, as it might arrive from a tool or a
    /// stored setting.
    pub fn open(&self, id: u8) -> Result<Area, FlashError> {
        let id = AreaId::from_u8(id).ok_or(FlashError::NotFound)?;
        Ok(*self.layout.area(id))
    }

    pub fn area(&self, id: AreaId) -> Area {
        *self.layout.area(id)
    }

    /// Returns the sector containing `offset`. Offsets past the end of the
    /// area still produce the sector they would fall in; this does no I/O and
    /// no bounds checking.
    pub fn sector_at(&self, id: AreaId, offset: u32) -> Sector {
        let size = self.layout.area(id).sector_size;
        Sector { offset: offset - offset % size, size }
    }

    /// Physical address of `offset` within an area. This is the only way the
    /// rest of the crate learns an absolute address, and it is only used for
    /// handing off to a booted image.
    pub fn address_of(&self, id: AreaId, offset: u32) -> Result<u32, FlashError> {
        self.layout.area(id).locate(offset, 0)
    }

    pub fn read(&mut self, id: AreaId, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let area = *self.layout.area(id);
        let address = area.locate(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        self.flash.read(area.device, address, buf)
    }

    /// Programs `data` at `offset`. The covering sectors must have been erased
    /// by the caller.
    pub fn write(&mut self, id: AreaId, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let area = *self.layout.area(id);
        let address = area.locate(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        let guard = Unlocked::new(&mut self.flash, area.device);
        guard.flash.write(area.device, address, data)
    }

    /// Erases every sector touched by `[offset, offset + len)`.
    pub fn erase(&mut self, id: AreaId, offset: u32, len: u32) -> Result<(), FlashError> {
        if len == 0 {
            return Ok(());
        }
        let area = *self.layout.area(id);
        let ss = area.sector_size;
        let start = offset - offset % ss;
        let end = offset
            .checked_add(len)
            .and_then(|end| end.checked_add(ss - 1))
            .map(|end| end - end % ss)
            .ok_or(FlashError::OutOfBounds)?;
        let address = area.locate(start, (end - start) as usize)?;
        let guard = Unlocked::new(&mut self.flash, area.device);
        guard.flash.erase(area.device, address, end - start)
    }

    /// Replaces the sector at `dst_offset` in `dst` with the sector at
    /// `src_offset` in `src`. The source is left intact, which is what lets an
    /// interrupted copy simply be run again.
    pub fn copy_sector(
        &mut self,
        src: AreaId,
        src_offset: u32,
        dst: AreaId,
        dst_offset: u32,
    ) -> Result<(), FlashError> {
        let size = self.layout.sector_size();
        self.erase(dst, dst_offset, size)?;

        let mut buf = [0; COPY_CHUNK];
        let mut pos = 0;
        while pos < size {
            let n = core::cmp::min(COPY_CHUNK as u32, size - pos);
            let chunk = &mut buf[..n as usize];
            self.read(src, src_offset + pos, chunk)?;
            // Erased flash needs no programming.
            if chunk.iter().any(|&b| b != 0xFF) {
                self.write(dst, dst_offset + pos, chunk)?;
            }
            pos += n;
        }
        Ok(())
    }

    /// Erases all of `dst`, then programs it with `len` bytes of `src`
    /// starting at `src_offset`. `dst` may not share bytes with any area of
    /// the layout.
    pub fn copy_to_region(
        &mut self,
        src: AreaId,
        src_offset: u32,
        len: u32,
        dst: &Region,
    ) -> Result<(), FlashError> {
        self.layout.area(src).locate(src_offset, len as usize)?;
        if dst.sector_size == 0 || dst.size % dst.sector_size != 0 || len > dst.size {
            return Err(FlashError::OutOfBounds);
        }
        dst.offset.checked_add(dst.size).ok_or(FlashError::OutOfBounds)?;
        for id in [AreaId::Boot, AreaId::Update, AreaId::Swap] {
            if dst.overlaps(self.layout.area(id)) {
                return Err(FlashError::OutOfBounds);
            }
        }

        {
            let guard = Unlocked::new(&mut self.flash, dst.device);
            guard.flash.erase(dst.device, dst.offset, dst.size)?;
        }

        let mut buf = [0; COPY_CHUNK];
        let mut pos = 0;
        while pos < len {
            let n = core::cmp::min(COPY_CHUNK as u32, len - pos);
            let chunk = &mut buf[..n as usize];
            self.read(src, src_offset + pos, chunk)?;
            if chunk.iter().any(|&b| b != 0xFF) {
                let guard = Unlocked::new(&mut self.flash, dst.device);
                guard.flash.write(dst.device, dst.offset + pos, chunk)?;
            }
            pos += n;
        }
        Ok(())
    }
}
