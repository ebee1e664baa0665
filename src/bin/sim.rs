// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs the bootloader on the host, over a file that stands in for flash.
//! Built with `--features sim`.
//!
//! A typical session:
//!
//! ```text
//! swapboot-sim init
//! swapboot-sim install --area boot v1.bin
//! swapboot-sim install --area update v2.bin
//! swapboot-sim trigger
//! swapboot-sim boot --pubkey key.sec1 --power-fail-after 40
//! swapboot-sim boot --pubkey key.sec1
//! swapboot-sim confirm
//! ```

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use simple_logger::SimpleLogger;

use swapboot::flash::{Area, FlashAreas, Layout, INTERNAL_FLASH};
use swapboot::ramflash::RamFlash;
use swapboot::{control, AreaId, BootConfig, Bootloader, Error, FlashError, UpdateState};

#[derive(Debug, Parser)]
#[clap(about = "Exercise the bootloader against a flash image file")]
struct Args {
    /// Flash image file.
    #[clap(long, env = "SWAPBOOT_FLASH", default_value = "flash.bin")]
    flash: PathBuf,

    /// Erase sector size, shared by all areas.
    #[clap(long, env = "SWAPBOOT_SECTOR_SIZE", default_value_t = 4096)]
    sector_size: u32,

    /// Image-bearing sectors in each of BOOT and UPDATE. Each also gets one
    /// more sector for its state record.
    #[clap(long, env = "SWAPBOOT_IMAGE_SECTORS", default_value_t = 32)]
    image_sectors: u32,

    /// One of off, error, warn, info, debug, trace.
    #[clap(long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Creates an erased flash image.
    Init,
    /// Programs an image file at the start of an area.
    Install {
        #[clap(long, value_enum)]
        area: AreaArg,
        file: PathBuf,
    },
    /// Flags the image in UPDATE for installation, as an application would.
    Trigger,
    /// Confirms the image in BOOT, as an application would.
    Confirm,
    /// Erases UPDATE and any pending request, as an application would.
    EraseUpdate,
    /// Shows the update state and image versions.
    Status,
    /// Runs the boot sequence.
    Boot {
        /// Public key, encoded for the build's signature scheme.
        #[clap(long, env = "SWAPBOOT_PUBKEY")]
        pubkey: PathBuf,
        #[clap(long, default_value_t = BootConfig::default().max_boot_attempts)]
        max_boot_attempts: u8,
        /// Cut power during flash write/erase number N+1. Whatever state
        /// flash is left in is saved.
        #[clap(long)]
        power_fail_after: Option<u32>,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum AreaArg {
    Boot,
    Update,
}

impl From<AreaArg> for AreaId {
    fn from(a: AreaArg) -> Self {
        match a {
            AreaArg::Boot => AreaId::Boot,
            AreaArg::Update => AreaId::Update,
        }
    }
}

fn layout(sector_size: u32, image_sectors: u32) -> Result<Layout> {
    let size = image_sectors
        .checked_add(1)
        .and_then(|n| n.checked_mul(sector_size))
        .ok_or_else(|| anyhow!("area size overflows"))?;
    Layout::new(
        Area::new(AreaId::Boot, INTERNAL_FLASH, 0, size, sector_size),
        Area::new(AreaId::Update, INTERNAL_FLASH, size, size, sector_size),
        Area::new(AreaId::Swap, INTERNAL_FLASH, 2 * size, sector_size, sector_size),
    )
    .map_err(|e| anyhow!("bad layout: {:?}", e))
}

fn flash_size(layout: &Layout) -> usize {
    let swap = layout.area(AreaId::Swap);
    (swap.offset + swap.size) as usize
}

fn load(path: &Path, size: usize) -> Result<Vec<u8>> {
    let mem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if mem.len() != size {
        bail!(
            "{} is {} bytes, but the layout needs {}; run `init` again?",
            path.display(),
            mem.len(),
            size
        );
    }
    Ok(mem)
}

fn lib_err(e: Error) -> anyhow::Error {
    anyhow!("{:?}", e)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level: log::LevelFilter = args
        .log_level
        .parse()
        .map_err(|_| anyhow!("unknown log level {:?}", args.log_level))?;
    SimpleLogger::new().with_level(level).init()?;

    let layout = layout(args.sector_size, args.image_sectors)?;
    let size = flash_size(&layout);

    let mut mem = match args.cmd {
        Cmd::Init => vec![0xFF; size],
        _ => load(&args.flash, size)?,
    };
    let result = run(args.cmd, &mut mem, layout, args.sector_size);
    // Flash keeps whatever happened to it, success or not.
    std::fs::write(&args.flash, &mem).with_context(|| format!("writing {}", args.flash.display()))?;
    result
}

fn run(cmd: Cmd, mem: &mut [u8], layout: Layout, sector_size: u32) -> Result<()> {
    match cmd {
        Cmd::Init => {
            mem.fill(0xFF);
            info!("erased {} bytes of flash", mem.len());
        }
        Cmd::Install { area, file } => {
            let image = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let capacity = layout.image_capacity();
            if image.len() > capacity as usize {
                bail!("{} is {} bytes; areas hold {}", file.display(), image.len(), capacity);
            }
            let mut areas = FlashAreas::new(RamFlash::new(mem, sector_size), layout);
            let id = AreaId::from(area);
            areas.erase(id, 0, capacity).map_err(|e| lib_err(e.into()))?;
            areas.write(id, 0, &image).map_err(|e| lib_err(e.into()))?;
            info!("wrote {} bytes to {:?}", image.len(), id);
        }
        Cmd::Trigger => {
            let mut areas = FlashAreas::new(RamFlash::new(mem, sector_size), layout);
            control::trigger_update(&mut areas).map_err(lib_err)?;
        }
        Cmd::Confirm => {
            let mut areas = FlashAreas::new(RamFlash::new(mem, sector_size), layout);
            control::confirm_boot(&mut areas).map_err(lib_err)?;
        }
        Cmd::EraseUpdate => {
            let mut areas = FlashAreas::new(RamFlash::new(mem, sector_size), layout);
            control::erase_update(&mut areas).map_err(lib_err)?;
        }
        Cmd::Status => {
            let mut areas = FlashAreas::new(RamFlash::new(mem, sector_size), layout);
            let state = UpdateState::load(&mut areas).map_err(|e| lib_err(e.into()))?;
            let show = |v: Option<u32>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
            let boot = control::current_version(&mut areas).map_err(lib_err)?;
            let update = control::update_version(&mut areas).map_err(lib_err)?;
            println!("phase:    {:?}", state.phase());
            println!("BOOT:     {:?}, version {}", state.boot_state(), show(boot));
            println!("UPDATE:   {:?}, version {}", state.update_state(), show(update));
            println!("attempts: {}", state.attempts());
        }
        Cmd::Boot { pubkey, max_boot_attempts, power_fail_after } => {
            let key = std::fs::read(&pubkey).with_context(|| format!("reading {}", pubkey.display()))?;
            let flash = match power_fail_after {
                Some(n) => RamFlash::with_power_budget(mem, sector_size, n),
                None => RamFlash::new(mem, sector_size),
            };
            let config = BootConfig { max_boot_attempts };
            let mut loader = Bootloader::new(FlashAreas::new(flash, layout), &key, config);
            match loader.run() {
                Ok(target) => {
                    // Stands in for the jump.
                    info!("handing off to version {} at {:#010x}", target.version, target.entry);
                    println!("booted version {}", target.version);
                }
                Err(Error::Flash(FlashError::HardwareFault)) if !loader.areas().flash().powered() => {
                    warn!("power lost after {} flash operations", loader.areas().flash().ops());
                    println!("power failure");
                }
                Err(e) => bail!("boot failed: {:?}", e),
            }
        }
    }
    Ok(())
}
