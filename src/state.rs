// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persisted update state.
//!
//! BOOT and UPDATE each reserve their last sector for a small state record:
//!
//! ```text
//! +0  magic "BOOT" (u32)     present iff the record has been initialized
//! +4  partition state (u8)   see `PartitionState`
//! +5  boot attempts (u8)     one cleared bit per attempt
//! +6  reserved (2 bytes)
//! +8  step flags             one nibble per image sector, low nibble first
//! ```
//!
//! The encoding is chosen so that, once the sector has been erased, every
//! change we ever make moves bits from 1 to 0. Each change is therefore a
//! single flash write with no erase, and a write that is cut short by power
//! loss leaves a value whose bits are a superset of the new value and a subset
//! of the old one. We decode such values as the *earlier* of the two states,
//! which is always safe: it means redoing work rather than skipping it.
//!
//! BOOT's record carries whether the image in BOOT is under test or confirmed,
//! and how many times it has been started while under test. UPDATE's record
//! carries whether an exchange has been requested, which way, and how far it
//! has got.

use core::mem::size_of;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::flash::{Flash, FlashAreas, FlashError};
use crate::AreaId;

/// "BOOT", little-endian.
pub const STATE_MAGIC: u32 = 0x544F_4F42;

/// Upper bound on the boot-attempt budget; the counter is a single byte of
/// unary.
pub const MAX_BOOT_ATTEMPTS: u8 = 8;

const FLAGS_OFFSET: u32 = size_of::<RecordHeader>() as u32;

#[derive(Copy, Clone, Debug, AsBytes, FromBytes)]
#[repr(C)]
struct RecordHeader {
    magic: u32,
    state: u8,
    attempts: u8,
    _reserved: [u8; 2],
}

const_assert_eq!(size_of::<RecordHeader>(), 8);

/// Number of image sectors whose step flags fit in a state sector of
/// `sector_size` bytes.
pub fn flag_capacity(sector_size: u32) -> u32 {
    sector_size.saturating_sub(FLAGS_OFFSET).saturating_mul(2)
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum PartitionState {
    /// Erased or never initialized.
    New = 0xFF,
    /// UPDATE: install the candidate in UPDATE into BOOT.
    Updating = 0x70,
    /// UPDATE: put the previous image (now in UPDATE) back into BOOT.
    Reverting = 0x30,
    /// BOOT: freshly installed, waiting for the image to confirm itself.
    Testing = 0x10,
    /// BOOT: confirmed good.
    Success = 0x00,
}

impl PartitionState {
    fn decode(raw: u8) -> Self {
        Self::from_u8(raw).unwrap_or_else(|| {
            settle(
                raw,
                &[
                    (0x00, Self::Success),
                    (0x10, Self::Testing),
                    (0x30, Self::Reverting),
                    (0x70, Self::Updating),
                ],
                Self::New,
            )
        })
    }
}

/// How far the exchange of one sector has got. Each value is recorded after
/// the copy it names has completed.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum StepFlag {
    /// Nothing done yet.
    New = 0xF,
    /// The destination sector has been saved into SWAP.
    Backup = 0x7,
    /// The source sector has been copied over the destination.
    Installed = 0x3,
    /// The saved sector has been copied over the source.
    Done = 0x0,
}

impl StepFlag {
    fn decode(nibble: u8) -> Self {
        Self::from_u8(nibble).unwrap_or_else(|| {
            settle(
                nibble,
                &[(0x0, Self::Done), (0x3, Self::Installed), (0x7, Self::Backup)],
                Self::New,
            )
        })
    }
}

/// Picks the most progressed known encoding whose set bits include all of
/// `raw`'s set bits, i.e. the state a write was heading away from. `known` is
/// ordered from most to least progressed; `erased` covers everything else.
fn settle<T: Copy>(raw: u8, known: &[(u8, T)], erased: T) -> T {
    known
        .iter()
        .find(|(bits, _)| bits & raw == raw)
        .map_or(erased, |&(_, v)| v)
}

/// Which way an exchange moves images. The exchange itself is symmetric;
/// direction only decides which area is the source and what BOOT is marked as
/// afterwards.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// UPDATE's candidate goes into BOOT and is put under test.
    Install,
    /// The previous image, parked in UPDATE by an install, goes back into BOOT
    /// and is trusted as before.
    Revert,
}

impl Direction {
    /// `(source, destination)`: the destination's sectors are the ones saved
    /// to SWAP before being overwritten.
    pub fn areas(self) -> (AreaId, AreaId) {
        match self {
            Direction::Install => (AreaId::Update, AreaId::Boot),
            Direction::Revert => (AreaId::Boot, AreaId::Update),
        }
    }

    fn request(self) -> PartitionState {
        match self {
            Direction::Install => PartitionState::Updating,
            Direction::Revert => PartitionState::Reverting,
        }
    }
}

/// Position of an exchange: every sector below `cursor` is done, and sector
/// `cursor` is at `step`. A cursor equal to the number of image sectors means
/// the exchange only needs finalizing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Progress {
    pub direction: Direction,
    pub cursor: u32,
    pub step: StepFlag,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    /// No update pending, and BOOT has never been through an update.
    BootOnly,
    /// A candidate in UPDATE has been flagged, nothing has been checked or
    /// moved yet.
    UpdateStaged,
    /// An exchange has started (or only needs finalizing).
    SwapInProgress(Progress),
    /// BOOT holds a newly installed image that has not confirmed itself.
    SwapCompleteUnconfirmed { attempts: u8 },
    /// BOOT holds an image that has confirmed itself.
    Confirmed,
    /// A revert has been requested, nothing has been moved yet.
    RollbackRequested,
}

/// The update state as read back from flash.
///
/// This is a plain value. Transitions in [`crate::update`] take it by `&mut`,
/// persist their change through [`FlashAreas`], and then update it, so it
/// always matches what [`UpdateState::load`] would return.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UpdateState {
    pub(crate) boot: PartitionState,
    pub(crate) update: PartitionState,
    pub(crate) attempts: u8,
    pub(crate) sectors: u32,
    pub(crate) phase: Phase,
}

impl UpdateState {
    pub fn load<F: Flash>(areas: &mut FlashAreas<F>) -> Result<Self, FlashError> {
        let boot = read_header(areas, AreaId::Boot)?;
        let update = read_header(areas, AreaId::Update)?;
        let sectors = areas.layout().image_sectors();

        let boot_state = boot.map_or(PartitionState::New, |h| PartitionState::decode(h.state));
        let attempts = boot.map_or(0, |h| h.attempts.count_zeros() as u8);
        let update_state = update.map_or(PartitionState::New, |h| PartitionState::decode(h.state));

        let direction = match update_state {
            PartitionState::Updating => Some(Direction::Install),
            PartitionState::Reverting => Some(Direction::Revert),
            _ => None,
        };

        let phase = if let Some(direction) = direction {
            let (cursor, step) = find_cursor(areas, sectors)?;
            match (direction, cursor, step) {
                (Direction::Install, 0, StepFlag::New) => Phase::UpdateStaged,
                (Direction::Revert, 0, StepFlag::New) => Phase::RollbackRequested,
                _ => Phase::SwapInProgress(Progress { direction, cursor, step }),
            }
        } else {
            match boot_state {
                PartitionState::Testing => Phase::SwapCompleteUnconfirmed { attempts },
                PartitionState::Success => Phase::Confirmed,
                _ => Phase::BootOnly,
            }
        };

        Ok(Self { boot: boot_state, update: update_state, attempts, sectors, phase })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn boot_state(&self) -> PartitionState {
        self.boot
    }

    pub fn update_state(&self) -> PartitionState {
        self.update
    }

    /// Boots consumed by the image in BOOT while under test.
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// The swap cursor, if an exchange is underway or requested.
    pub fn cursor(&self) -> Option<u32> {
        match self.phase {
            Phase::UpdateStaged | Phase::RollbackRequested => Some(0),
            Phase::SwapInProgress(p) => Some(p.cursor),
            _ => None,
        }
    }

    /// Number of sectors an exchange walks through.
    pub fn sectors(&self) -> u32 {
        self.sectors
    }
}

fn find_cursor<F: Flash>(areas: &mut FlashAreas<F>, sectors: u32) -> Result<(u32, StepFlag), FlashError> {
    for sector in 0..sectors {
        let flag = step_flag(areas, sector)?;
        if flag != StepFlag::Done {
            return Ok((sector, flag));
        }
    }
    Ok((sectors, StepFlag::Done))
}

fn read_header<F: Flash>(areas: &mut FlashAreas<F>, id: AreaId) -> Result<Option<RecordHeader>, FlashError> {
    let offset = areas.layout().state_offset();
    let mut raw = [0; size_of::<RecordHeader>()];
    areas.read(id, offset, &mut raw)?;
    Ok(RecordHeader::read_from(&raw[..]).filter(|h| h.magic == STATE_MAGIC))
}

/// Erases an area's state record. BOOT and UPDATE read as `New` afterwards.
pub fn reset<F: Flash>(areas: &mut FlashAreas<F>, id: AreaId) -> Result<(), FlashError> {
    let offset = areas.layout().state_offset();
    let size = areas.layout().sector_size();
    areas.erase(id, offset, size)
}

/// Starts a fresh record holding `state`: attempts and step flags are cleared.
pub fn init<F: Flash>(areas: &mut FlashAreas<F>, id: AreaId, state: PartitionState) -> Result<(), FlashError> {
    reset(areas, id)?;
    let header = RecordHeader {
        magic: STATE_MAGIC,
        state: state as u8,
        attempts: 0xFF,
        _reserved: [0xFF; 2],
    };
    // State first, then the magic that makes it count. A record cut off
    // between the two still reads as New.
    let offset = areas.layout().state_offset();
    areas.write(id, offset + 4, &header.as_bytes()[4..])?;
    areas.write(id, offset, &header.as_bytes()[..4])
}

/// Moves an area's record to `state`, by clearing bits if that is enough and
/// by starting a fresh record otherwise.
pub fn set_partition_state<F: Flash>(
    areas: &mut FlashAreas<F>,
    id: AreaId,
    state: PartitionState,
) -> Result<(), FlashError> {
    let new = state as u8;
    match read_header(areas, id)? {
        Some(h) if h.state == new => Ok(()),
        Some(h) if h.state & new == new => {
            let offset = areas.layout().state_offset();
            areas.write(id, offset + 4, &[new])
        }
        _ => init(areas, id, state),
    }
}

pub fn partition_state<F: Flash>(areas: &mut FlashAreas<F>, id: AreaId) -> Result<PartitionState, FlashError> {
    Ok(read_header(areas, id)?.map_or(PartitionState::New, |h| PartitionState::decode(h.state)))
}

/// Requests an exchange in `direction`. This starts a fresh UPDATE record,
/// so any previous progress is forgotten.
pub fn request<F: Flash>(areas: &mut FlashAreas<F>, direction: Direction) -> Result<(), FlashError> {
    init(areas, AreaId::Update, direction.request())
}

/// Step flag of image sector `sector`, from UPDATE's record.
pub fn step_flag<F: Flash>(areas: &mut FlashAreas<F>, sector: u32) -> Result<StepFlag, FlashError> {
    let (offset, high) = flag_position(areas, sector);
    let mut byte = [0];
    areas.read(AreaId::Update, offset, &mut byte)?;
    let nibble = if high { byte[0] >> 4 } else { byte[0] & 0x0F };
    Ok(StepFlag::decode(nibble))
}

pub fn set_step_flag<F: Flash>(areas: &mut FlashAreas<F>, sector: u32, flag: StepFlag) -> Result<(), FlashError> {
    let (offset, high) = flag_position(areas, sector);
    let mut byte = [0];
    areas.read(AreaId::Update, offset, &mut byte)?;
    let old = byte[0];
    let new = if high {
        (old & 0x0F) | ((flag as u8) << 4)
    } else {
        (old & 0xF0) | flag as u8
    };
    if new == old {
        return Ok(());
    }
    areas.write(AreaId::Update, offset, &[new])
}

fn flag_position<F: Flash>(areas: &FlashAreas<F>, sector: u32) -> (u32, bool) {
    let offset = areas.layout().state_offset() + FLAGS_OFFSET + sector / 2;
    (offset, sector % 2 == 1)
}

/// Counts one start of the image under test in BOOT's record. Saturates once
/// every bit has been used.
pub fn record_boot_attempt<F: Flash>(areas: &mut FlashAreas<F>) -> Result<u8, FlashError> {
    let offset = areas.layout().state_offset() + 5;
    let mut byte = [0];
    areas.read(AreaId::Boot, offset, &mut byte)?;
    let raw = byte[0];
    if raw != 0 {
        // Clear the lowest set bit.
        areas.write(AreaId::Boot, offset, &[raw & raw.wrapping_sub(1)])?;
    }
    Ok(core::cmp::min(raw.count_zeros() as u8 + 1, MAX_BOOT_ATTEMPTS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramflash::RamFlash;
    use crate::testutil::{flash_size, layout, SECTOR};
    use std::vec;

    #[test]
    fn torn_values_decode_to_the_earlier_state() {
        // 0xF -> 0x7 cut short.
        assert_eq!(StepFlag::decode(0xB), StepFlag::New);
        // 0x7 -> 0x3 cut short.
        assert_eq!(StepFlag::decode(0x5), StepFlag::Backup);
        // 0x3 -> 0x0 cut short.
        assert_eq!(StepFlag::decode(0x1), StepFlag::Installed);
        assert_eq!(StepFlag::decode(0x2), StepFlag::Installed);

        assert_eq!(PartitionState::decode(0x10), PartitionState::Testing);
        assert_eq!(PartitionState::decode(0x50), PartitionState::Updating);
        assert_eq!(PartitionState::decode(0xF0), PartitionState::New);
        assert_eq!(PartitionState::decode(0x20), PartitionState::Reverting);
    }

    #[test]
    fn fresh_flash_is_boot_only() {
        let mut mem = vec![0xFF; flash_size(4)];
        let mut areas = FlashAreas::new(RamFlash::new(&mut mem, SECTOR), layout(4));
        let state = UpdateState::load(&mut areas).unwrap();
        assert_eq!(state.phase(), Phase::BootOnly);
        assert_eq!(state.cursor(), None);
        assert_eq!(state.sectors(), 4);
    }

    #[test]
    fn garbage_record_reads_as_new() {
        let mut mem = vec![0xEE; flash_size(4)];
        let mut areas = FlashAreas::new(RamFlash::new(&mut mem, SECTOR), layout(4));
        assert_eq!(partition_state(&mut areas, AreaId::Boot), Ok(PartitionState::New));
        assert_eq!(UpdateState::load(&mut areas).unwrap().phase(), Phase::BootOnly);
    }

    #[test]
    fn state_changes_clear_bits_in_place() {
        let mut mem = vec![0xFF; flash_size(4)];
        let mut areas = FlashAreas::new(RamFlash::new(&mut mem, SECTOR), layout(4));

        set_partition_state(&mut areas, AreaId::Boot, PartitionState::Testing).unwrap();
        let ops = areas.flash().ops();
        set_partition_state(&mut areas, AreaId::Boot, PartitionState::Success).unwrap();
        // One byte written, no erase.
        assert_eq!(areas.flash().ops(), ops + 1);
        assert_eq!(partition_state(&mut areas, AreaId::Boot), Ok(PartitionState::Success));

        // Going back to Testing needs a fresh record.
        set_partition_state(&mut areas, AreaId::Boot, PartitionState::Testing).unwrap();
        assert_eq!(partition_state(&mut areas, AreaId::Boot), Ok(PartitionState::Testing));
    }

    #[test]
    fn step_flags_pack_two_per_byte() {
        let mut mem = vec![0xFF; flash_size(4)];
        let mut areas = FlashAreas::new(RamFlash::new(&mut mem, SECTOR), layout(4));
        request(&mut areas, Direction::Install).unwrap();
        assert_eq!(UpdateState::load(&mut areas).unwrap().phase(), Phase::UpdateStaged);

        set_step_flag(&mut areas, 0, StepFlag::Done).unwrap();
        set_step_flag(&mut areas, 1, StepFlag::Backup).unwrap();
        assert_eq!(step_flag(&mut areas, 0), Ok(StepFlag::Done));
        assert_eq!(step_flag(&mut areas, 1), Ok(StepFlag::Backup));
        assert_eq!(step_flag(&mut areas, 2), Ok(StepFlag::New));

        let state = UpdateState::load(&mut areas).unwrap();
        assert_eq!(
            state.phase(),
            Phase::SwapInProgress(Progress {
                direction: Direction::Install,
                cursor: 1,
                step: StepFlag::Backup,
            })
        );
        assert_eq!(state.cursor(), Some(1));
    }

    #[test]
    fn revert_request_is_rollback_requested() {
        let mut mem = vec![0xFF; flash_size(4)];
        let mut areas = FlashAreas::new(RamFlash::new(&mut mem, SECTOR), layout(4));
        request(&mut areas, Direction::Revert).unwrap();
        assert_eq!(UpdateState::load(&mut areas).unwrap().phase(), Phase::RollbackRequested);
    }

    #[test]
    fn boot_attempts_count_up_and_saturate() {
        let mut mem = vec![0xFF; flash_size(4)];
        let mut areas = FlashAreas::new(RamFlash::new(&mut mem, SECTOR), layout(4));
        init(&mut areas, AreaId::Boot, PartitionState::Testing).unwrap();

        for expected in 1..=MAX_BOOT_ATTEMPTS {
            assert_eq!(record_boot_attempt(&mut areas), Ok(expected));
            let state = UpdateState::load(&mut areas).unwrap();
            assert_eq!(state.phase(), Phase::SwapCompleteUnconfirmed { attempts: expected });
        }
        assert_eq!(record_boot_attempt(&mut areas), Ok(MAX_BOOT_ATTEMPTS));
    }

    #[test]
    fn record_without_magic_is_ignored() {
        let mut mem = vec![0xFF; flash_size(4)];
        let mut areas = FlashAreas::new(RamFlash::new(&mut mem, SECTOR), layout(4));
        // A state byte with no magic, as left by an init cut short.
        let offset = areas.layout().state_offset();
        areas.write(AreaId::Update, offset + 4, &[PartitionState::Updating as u8]).unwrap();
        assert_eq!(partition_state(&mut areas, AreaId::Update), Ok(PartitionState::New));
        assert_eq!(UpdateState::load(&mut areas).unwrap().phase(), Phase::BootOnly);
    }
}
