// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reset-time decision: finish whatever the update state says is pending,
//! then pick an image we trust and hand off to it.

use log::{error, info, warn};

use crate::bsp::Bsp;
use crate::flash::{Flash, FlashAreas};
use crate::image;
use crate::state::{Phase, UpdateState, MAX_BOOT_ATTEMPTS};
use crate::update::{self, RunningBootloader, VersionPolicy};
use crate::verify::{self, TrustedImage};
use crate::{AreaId, Error};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootConfig {
    /// Boots an unconfirmed image gets before it is rolled back. Clamped to
    /// `1..=MAX_BOOT_ATTEMPTS`.
    pub max_boot_attempts: u8,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self { max_boot_attempts: 3 }
    }
}

/// Where to jump, and what we're jumping into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootTarget {
    pub entry: u32,
    pub version: u32,
}

pub struct Bootloader<'k, F> {
    areas: FlashAreas<F>,
    public_key: &'k [u8],
    config: BootConfig,
    running: Option<RunningBootloader>,
}

impl<'k, F: Flash> Bootloader<'k, F> {
    pub fn new(areas: FlashAreas<F>, public_key: &'k [u8], config: BootConfig) -> Self {
        Self { areas, public_key, config, running: None }
    }

    /// Lets bootloader images staged in UPDATE replace `running`. Without
    /// this, they're refused like any other image of the wrong type.
    pub fn with_self_update(self, running: RunningBootloader) -> Self {
        Self { running: Some(running), ..self }
    }

    pub fn areas(&mut self) -> &mut FlashAreas<F> {
        &mut self.areas
    }

    pub fn into_areas(self) -> FlashAreas<F> {
        self.areas
    }

    /// Installs a newer bootloader staged in UPDATE. Returns true if the
    /// bootloader region was rewritten, in which case the board must reset
    /// into it rather than carry on with [`Self::run`].
    pub fn check_self_update(&mut self) -> Result<bool, Error> {
        let running = match self.running {
            Some(running) => running,
            None => return Ok(false),
        };
        let mut state = UpdateState::load(&mut self.areas)?;
        if !update::bootloader_staged(&mut self.areas, &state)? {
            return Ok(false);
        }
        match update::update_bootloader(&mut self.areas, &mut state, self.public_key, &running) {
            Ok(()) => Ok(true),
            Err(e) if e.is_candidate_fault() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Runs the boot sequence. On success, BOOT holds a verified image and
    /// the caller should jump to it.
    pub fn run(&mut self) -> Result<BootTarget, Error> {
        let mut state = UpdateState::load(&mut self.areas)?;
        info!("update state: {:?}", state.phase());

        match state.phase() {
            Phase::SwapInProgress(_) => update::resume(&mut self.areas, &mut state)?,
            Phase::UpdateStaged => keep_going(update::install(
                &mut self.areas,
                &mut state,
                self.public_key,
                VersionPolicy::for_updates(),
            ))?,
            Phase::RollbackRequested => keep_going(update::revert(&mut self.areas, &mut state, self.public_key))?,
            _ => {}
        }

        let mut image = self.check_boot()?;
        if image.is_none() && !under_test(&state) {
            image = self.recover(&mut state)?;
        }

        if under_test(&state) {
            let max = self.config.max_boot_attempts;
            let tried = match image {
                Some(_) => update::record_attempt(&mut self.areas, &mut state, max),
                None => Err(Error::NoBootableImage),
            };
            match tried {
                Ok(n) => info!("starting unconfirmed image, attempt {} of {}", n, max.clamp(1, MAX_BOOT_ATTEMPTS)),
                Err(e @ (Error::Exhausted | Error::NoBootableImage)) => {
                    warn!("image under test failed ({:?}), rolling back", e);
                    image = self.roll_back(&mut state, image)?;
                }
                Err(e) => return Err(e),
            }
        }

        let image = image.ok_or(Error::NoBootableImage)?;
        let header = image.header();
        let entry = match header.load_address {
            0 => self.areas.address_of(AreaId::Boot, header.header_len)?,
            address => address,
        };
        info!("booting version {} at {:#010x}", image.version(), entry);
        Ok(BootTarget { entry, version: image.version() })
    }

    /// Verifies BOOT. An untrustworthy image is `None`; only device faults
    /// are errors.
    fn check_boot(&mut self) -> Result<Option<TrustedImage>, Error> {
        let result = image::parse(&mut self.areas, AreaId::Boot)
            .and_then(|parsed| verify::verify(&mut self.areas, &parsed, self.public_key));
        match result {
            Ok(trusted) => Ok(Some(trusted)),
            Err(e) if e.is_candidate_fault() => {
                warn!("BOOT image not trusted: {:?}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Reverts to the image in UPDATE. If there's nothing trustworthy to go
    /// back to, `current` stays and flash isn't touched.
    fn roll_back(
        &mut self,
        state: &mut UpdateState,
        current: Option<TrustedImage>,
    ) -> Result<Option<TrustedImage>, Error> {
        match update::check_candidate(&mut self.areas, AreaId::Update, self.public_key, VersionPolicy::Any) {
            Ok(_) => {}
            Err(e) if e.is_candidate_fault() => {
                warn!("nothing to roll back to: {:?}", e);
                return Ok(current);
            }
            Err(e) => return Err(e),
        }
        update::request_rollback(&mut self.areas, state)?;
        match update::revert(&mut self.areas, state, self.public_key) {
            Ok(()) => self.check_boot(),
            Err(e) if e.is_candidate_fault() => Ok(current),
            Err(e) => Err(e),
        }
    }

    /// Installs whatever trustworthy image UPDATE holds, regardless of
    /// version, to replace a BOOT image that can't be run.
    fn recover(&mut self, state: &mut UpdateState) -> Result<Option<TrustedImage>, Error> {
        warn!("attempting recovery from UPDATE");
        match update::install(&mut self.areas, state, self.public_key, VersionPolicy::Any) {
            Ok(()) => self.check_boot(),
            Err(e) if e.is_candidate_fault() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn under_test(state: &UpdateState) -> bool {
    matches!(state.phase(), Phase::SwapCompleteUnconfirmed { .. })
}

/// A refused candidate has already been dropped; boot continues without it.
fn keep_going(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_candidate_fault() => Ok(()),
        other => other,
    }
}

/// Bootloader main for board `B`.
pub fn start<B: Bsp>() -> ! {
    B::hal_init();
    let layout = match B::layout() {
        Ok(layout) => layout,
        Err(e) => {
            error!("bad flash layout: {:?}", e);
            B::halt()
        }
    };
    let mut loader = Bootloader::new(FlashAreas::new(B::flash(), layout), B::public_key(), B::config());
    if let Some(running) = B::bootloader() {
        loader = loader.with_self_update(running);
    }
    match loader.check_self_update() {
        Ok(true) => B::reset(),
        Ok(false) => {}
        Err(e) => {
            error!("bootloader update failed: {:?}", e);
            B::halt()
        }
    }
    match loader.run() {
        Ok(target) => {
            B::prepare_boot(&target);
            B::jump_to(target.entry)
        }
        Err(e) => {
            error!("nothing to boot: {:?}", e);
            B::halt()
        }
    }
}
