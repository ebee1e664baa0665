// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Update state transitions and the sector exchange.
//!
//! Installing an update and rolling one back are the same operation: exchange
//! the image sectors of BOOT and UPDATE, one sector at a time, using SWAP to
//! hold whichever sector is about to be overwritten. Each sector takes three
//! copies:
//!
//! ```text
//!   destination -> SWAP          then mark Backup
//!   source      -> destination   then mark Installed
//!   SWAP        -> source        then mark Done
//! ```
//!
//! At every point, the data each remaining copy needs is still intact
//! somewhere, and the marks say which copy to (re)do next. So the exchange can
//! be cut off anywhere and resumed from flash alone.
//!
//! Nothing is exchanged until the image headed for BOOT has been verified.
//! Once marks exist past the first sector's `New`, that has happened, which is
//! why resuming needs no fresh proof: a half-exchanged image can't be checked,
//! and doesn't need to be.

use log::{debug, info, warn};

use crate::flash::{Flash, FlashAreas, Region};
use crate::image::{self, ImageKind};
use crate::state::{self, Direction, PartitionState, Phase, Progress, StepFlag, UpdateState, MAX_BOOT_ATTEMPTS};
use crate::verify::{self, SignatureScheme, TrustedImage};
use crate::{AreaId, Error};

/// A verified candidate that we decline to install.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Rejection {
    /// The candidate's version isn't newer than the running image's.
    NotNewer { candidate: u32, current: u32 },
    /// The candidate isn't the kind of image expected, or isn't for this
    /// build's signature scheme.
    WrongImageType(u16),
    /// A bootloader image whose payload is bigger than the bootloader region.
    DoesNotFit { size: u32, capacity: u32 },
}

/// Which candidate versions are acceptable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VersionPolicy {
    /// Only versions strictly newer than the one in BOOT.
    Newer,
    /// Anything. Used for rollback and recovery, where the point is to get
    /// back to a known image whatever its version.
    Any,
}

impl VersionPolicy {
    /// Policy for ordinary updates in this build.
    pub fn for_updates() -> Self {
        if cfg!(feature = "allow-downgrade") {
            VersionPolicy::Any
        } else {
            VersionPolicy::Newer
        }
    }

    pub fn check(self, candidate: u32, current: u32) -> Result<(), Rejection> {
        match self {
            VersionPolicy::Newer if candidate <= current => Err(Rejection::NotNewer { candidate, current }),
            _ => Ok(()),
        }
    }
}

/// Version of the image in BOOT, or 0 if BOOT doesn't hold a well-formed
/// image.
pub fn boot_version<F: Flash>(areas: &mut FlashAreas<F>) -> Result<u32, Error> {
    match image::read_header(areas, AreaId::Boot) {
        Ok(header) => Ok(header.version),
        Err(Error::Malformed(_)) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Parses and verifies the image in `area`, and checks it is something we
/// would put in BOOT.
pub fn check_candidate<F: Flash>(
    areas: &mut FlashAreas<F>,
    area: AreaId,
    public_key: &[u8],
    policy: VersionPolicy,
) -> Result<TrustedImage, Error> {
    let trusted = check_image(areas, area, public_key, ImageKind::App)?;
    policy.check(trusted.version(), boot_version(areas)?)?;
    Ok(trusted)
}

fn check_image<F: Flash>(
    areas: &mut FlashAreas<F>,
    area: AreaId,
    public_key: &[u8],
    kind: ImageKind,
) -> Result<TrustedImage, Error> {
    let parsed = image::parse(areas, area)?;
    let trusted = verify::verify(areas, &parsed, public_key)?;

    let header = trusted.header();
    if header.kind() != Some(kind) || header.auth() != Some(verify::Scheme::AUTH) {
        return Err(Rejection::WrongImageType(header.image_type).into());
    }
    Ok(trusted)
}

/// Where the running bootloader lives, and which version it is.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RunningBootloader {
    pub region: Region,
    pub version: u32,
}

/// True if an update has been requested and UPDATE's header says it's a
/// bootloader image. Nothing is verified yet.
pub fn bootloader_staged<F: Flash>(areas: &mut FlashAreas<F>, state: &UpdateState) -> Result<bool, Error> {
    if state.phase() != Phase::UpdateStaged {
        return Ok(false);
    }
    match image::read_header(areas, AreaId::Update) {
        Ok(header) => Ok(header.kind() == Some(ImageKind::Bootloader)),
        Err(Error::Malformed(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Replaces the running bootloader with the payload of the bootloader image
/// in UPDATE, then drops the request. The candidate must verify and be
/// strictly newer than `running`, whatever the build's downgrade policy.
///
/// A refused candidate drops the request and leaves the region alone. If
/// power is lost while the region is rewritten, the request is still there
/// and the rewrite starts over.
pub fn update_bootloader<F: Flash>(
    areas: &mut FlashAreas<F>,
    state: &mut UpdateState,
    public_key: &[u8],
    running: &RunningBootloader,
) -> Result<(), Error> {
    let checked = check_image(areas, AreaId::Update, public_key, ImageKind::Bootloader).and_then(|trusted| {
        VersionPolicy::Newer.check(trusted.version(), running.version)?;
        let size = trusted.header().payload_size;
        if size > running.region.size {
            return Err(Rejection::DoesNotFit { size, capacity: running.region.size }.into());
        }
        Ok(trusted)
    });
    let candidate = match checked {
        Ok(trusted) => trusted,
        Err(e) => {
            if e.is_candidate_fault() {
                warn!("discarding bootloader update: {:?}", e);
                discard(areas, state)?;
            }
            return Err(e);
        }
    };
    info!("updating bootloader to version {} (was {})", candidate.version(), running.version);
    write_bootloader(areas, &candidate, &running.region)?;
    discard(areas, state)
}

fn write_bootloader<F: Flash>(areas: &mut FlashAreas<F>, image: &TrustedImage, region: &Region) -> Result<(), Error> {
    let header = image.header();
    areas.copy_to_region(image.area(), header.header_len, header.payload_size, region)?;
    Ok(())
}

/// Installs the candidate in UPDATE. `state` may be `UpdateStaged`, or any
/// state with no exchange pending for an emergency install.
///
/// If the candidate is refused, the request is dropped and the error
/// returned. Neither BOOT nor the candidate's bytes are touched.
pub fn install<F: Flash>(
    areas: &mut FlashAreas<F>,
    state: &mut UpdateState,
    public_key: &[u8],
    policy: VersionPolicy,
) -> Result<(), Error> {
    let candidate = match check_candidate(areas, AreaId::Update, public_key, policy) {
        Ok(trusted) => trusted,
        Err(e) => {
            if e.is_candidate_fault() {
                warn!("discarding update: {:?}", e);
                discard(areas, state)?;
            }
            return Err(e);
        }
    };
    info!("installing version {} (was {})", candidate.version(), boot_version(areas)?);
    if state.phase() != Phase::UpdateStaged {
        begin(areas, state, Direction::Install)?;
    }
    exchange(areas, state, Direction::Install, &candidate)
}

/// Puts the previous image, in UPDATE, back into BOOT. `state` must be
/// `RollbackRequested`; see [`request_rollback`].
///
/// As with [`install`], a refused image drops the request.
pub fn revert<F: Flash>(
    areas: &mut FlashAreas<F>,
    state: &mut UpdateState,
    public_key: &[u8],
) -> Result<(), Error> {
    let previous = match check_candidate(areas, AreaId::Update, public_key, VersionPolicy::Any) {
        Ok(trusted) => trusted,
        Err(e) => {
            if e.is_candidate_fault() {
                warn!("cannot roll back: {:?}", e);
                discard(areas, state)?;
            }
            return Err(e);
        }
    };
    info!("rolling back to version {}", previous.version());
    if state.phase() != Phase::RollbackRequested {
        begin(areas, state, Direction::Revert)?;
    }
    exchange(areas, state, Direction::Revert, &previous)
}

/// Continues an exchange cut off by a reset.
pub fn resume<F: Flash>(areas: &mut FlashAreas<F>, state: &mut UpdateState) -> Result<(), Error> {
    let progress = match state.phase() {
        Phase::SwapInProgress(progress) => progress,
        _ => return Ok(()),
    };
    info!(
        "resuming {:?} at sector {} of {} ({:?})",
        progress.direction, progress.cursor, state.sectors, progress.step
    );
    run(areas, state, progress)
}

/// Asks for a rollback on the next call to [`revert`]. Any pending request is
/// replaced.
pub fn request_rollback<F: Flash>(areas: &mut FlashAreas<F>, state: &mut UpdateState) -> Result<(), Error> {
    begin(areas, state, Direction::Revert)
}

/// Drops a pending update or rollback request by clearing UPDATE's state
/// record. Only valid before any sector has moved.
pub fn discard<F: Flash>(areas: &mut FlashAreas<F>, state: &mut UpdateState) -> Result<(), Error> {
    state::reset(areas, AreaId::Update)?;
    state.update = PartitionState::New;
    state.phase = match state.boot {
        PartitionState::Testing => Phase::SwapCompleteUnconfirmed { attempts: state.attempts },
        PartitionState::Success => Phase::Confirmed,
        _ => Phase::BootOnly,
    };
    Ok(())
}

/// Counts one start of the image under test. Fails with
/// [`Error::Exhausted`], without counting, once `max_attempts` have been used.
pub fn record_attempt<F: Flash>(
    areas: &mut FlashAreas<F>,
    state: &mut UpdateState,
    max_attempts: u8,
) -> Result<u8, Error> {
    let max = max_attempts.clamp(1, MAX_BOOT_ATTEMPTS);
    if state.attempts >= max {
        return Err(Error::Exhausted);
    }
    let attempts = state::record_boot_attempt(areas)?;
    state.attempts = attempts;
    state.phase = Phase::SwapCompleteUnconfirmed { attempts };
    Ok(attempts)
}

fn begin<F: Flash>(areas: &mut FlashAreas<F>, state: &mut UpdateState, direction: Direction) -> Result<(), Error> {
    state::request(areas, direction)?;
    let (update, phase) = match direction {
        Direction::Install => (PartitionState::Updating, Phase::UpdateStaged),
        Direction::Revert => (PartitionState::Reverting, Phase::RollbackRequested),
    };
    state.update = update;
    state.phase = phase;
    Ok(())
}

/// Starts the exchange requested in `state`, now that `image`, the one headed
/// for BOOT, has been verified.
fn exchange<F: Flash>(
    areas: &mut FlashAreas<F>,
    state: &mut UpdateState,
    direction: Direction,
    image: &TrustedImage,
) -> Result<(), Error> {
    debug!("exchanging with verified {:?} image", image.area());
    run(areas, state, Progress { direction, cursor: 0, step: StepFlag::New })
}

fn run<F: Flash>(areas: &mut FlashAreas<F>, state: &mut UpdateState, from: Progress) -> Result<(), Error> {
    let direction = from.direction;
    let (src, dst) = direction.areas();
    let size = areas.layout().sector_size();

    let mut cursor = from.cursor;
    let mut step = from.step;
    while cursor < state.sectors {
        let offset = cursor * size;
        if step == StepFlag::New {
            areas.copy_sector(dst, offset, AreaId::Swap, 0)?;
            step = mark(areas, state, direction, cursor, StepFlag::Backup)?;
        }
        if step == StepFlag::Backup {
            areas.copy_sector(src, offset, dst, offset)?;
            step = mark(areas, state, direction, cursor, StepFlag::Installed)?;
        }
        if step == StepFlag::Installed {
            areas.copy_sector(AreaId::Swap, 0, src, offset)?;
            mark(areas, state, direction, cursor, StepFlag::Done)?;
        }
        debug!("sector {} exchanged", cursor);

        cursor += 1;
        if cursor < state.sectors {
            step = state::step_flag(areas, cursor)?;
            state.phase = Phase::SwapInProgress(Progress { direction, cursor, step });
        }
    }

    finalize(areas, state, direction)
}

fn mark<F: Flash>(
    areas: &mut FlashAreas<F>,
    state: &mut UpdateState,
    direction: Direction,
    cursor: u32,
    step: StepFlag,
) -> Result<StepFlag, Error> {
    state::set_step_flag(areas, cursor, step)?;
    state.phase = Phase::SwapInProgress(Progress { direction, cursor, step });
    Ok(step)
}

/// Records the outcome of a finished exchange. SWAP is cleared, then BOOT's
/// record is written: if we're cut off before UPDATE's is cleared, the next
/// boot sees an exchange with every sector done and simply finalizes again.
fn finalize<F: Flash>(areas: &mut FlashAreas<F>, state: &mut UpdateState, direction: Direction) -> Result<(), Error> {
    let boot = match direction {
        Direction::Install => PartitionState::Testing,
        Direction::Revert => PartitionState::Success,
    };
    let swap = areas.layout().sector_size();
    areas.erase(AreaId::Swap, 0, swap)?;
    state::init(areas, AreaId::Boot, boot)?;
    state::reset(areas, AreaId::Update)?;

    state.boot = boot;
    state.update = PartitionState::New;
    state.attempts = 0;
    state.phase = match direction {
        Direction::Install => Phase::SwapCompleteUnconfirmed { attempts: 0 },
        Direction::Revert => Phase::Confirmed,
    };
    info!("{:?} complete, BOOT is now {:?}", direction, boot);
    Ok(())
}
