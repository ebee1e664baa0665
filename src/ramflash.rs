// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A NOR flash model over a caller-provided byte buffer.
//!
//! This behaves the way the core assumes real parts behave, and no better:
//!
//! - Programming can only clear bits. Writing `0xFF` over `0x00` leaves
//!   `0x00`.
//! - Erase works on whole sectors and sets them to `0xFF`.
//! - Programming or erasing while the device is locked is a hardware fault.
//!
//! It can also simulate losing power. Given a budget of N mutating operations,
//! the (N+1)th one is torn (an erase leaves garbage, a write lands only its
//! first half) and reports a hardware fault, as does everything after it. To
//! "reboot", build a fresh `RamFlash` over the same buffer.

use crate::flash::{DeviceId, Flash, FlashError};

/// What a torn erase leaves behind.
const TORN_ERASE_FILL: u8 = 0xEE;

pub struct RamFlash<'a> {
    mem: &'a mut [u8],
    device: DeviceId,
    erase_size: u32,
    locked: bool,
    ops: u32,
    budget: Option<u32>,
    powered: bool,
}

impl<'a> RamFlash<'a> {
    /// Models device 0 as `mem`, with `erase_size`-byte sectors.
    pub fn new(mem: &'a mut [u8], erase_size: u32) -> Self {
        Self {
            mem,
            device: crate::flash::INTERNAL_FLASH,
            erase_size,
            locked: true,
            ops: 0,
            budget: None,
            powered: true,
        }
    }

    /// Like `new`, but power is lost during mutating operation number
    /// `budget + 1`.
    pub fn with_power_budget(mem: &'a mut [u8], erase_size: u32, budget: u32) -> Self {
        Self { budget: Some(budget), ..Self::new(mem, erase_size) }
    }

    /// Number of writes and erases that completed.
    pub fn ops(&self) -> u32 {
        self.ops
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// False once simulated power has been lost.
    pub fn powered(&self) -> bool {
        self.powered
    }

    fn range(&self, device: DeviceId, address: u32, len: usize) -> Result<core::ops::Range<usize>, FlashError> {
        if device != self.device {
            return Err(FlashError::HardwareFault);
        }
        let start = address as usize;
        let end = start.checked_add(len).ok_or(FlashError::HardwareFault)?;
        if end > self.mem.len() {
            return Err(FlashError::HardwareFault);
        }
        Ok(start..end)
    }

    /// Accounts for one mutating operation. Returns `Ok(true)` if this is the
    /// operation that loses power.
    fn spend(&mut self) -> Result<bool, FlashError> {
        if !self.powered || self.locked {
            return Err(FlashError::HardwareFault);
        }
        match self.budget {
            Some(0) => {
                self.powered = false;
                Ok(true)
            }
            Some(ref mut n) => {
                *n -= 1;
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

impl Flash for RamFlash<'_> {
    fn read(&mut self, device: DeviceId, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(device, address, buf.len())?;
        buf.copy_from_slice(&self.mem[range]);
        Ok(())
    }

    fn write(&mut self, device: DeviceId, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let range = self.range(device, address, data.len())?;
        let torn = self.spend()?;
        let landed = if torn { data.len() / 2 } else { data.len() };
        for (cell, &byte) in self.mem[range].iter_mut().zip(&data[..landed]) {
            *cell &= byte;
        }
        if torn {
            return Err(FlashError::HardwareFault);
        }
        self.ops += 1;
        Ok(())
    }

    fn erase(&mut self, device: DeviceId, address: u32, len: u32) -> Result<(), FlashError> {
        if address % self.erase_size != 0 || len % self.erase_size != 0 {
            return Err(FlashError::HardwareFault);
        }
        let range = self.range(device, address, len as usize)?;
        let torn = self.spend()?;
        if torn {
            self.mem[range].fill(TORN_ERASE_FILL);
            return Err(FlashError::HardwareFault);
        }
        self.mem[range].fill(0xFF);
        self.ops += 1;
        Ok(())
    }

    fn unlock(&mut self, _device: DeviceId) {
        self.locked = false;
    }

    fn lock(&mut self, _device: DeviceId) {
        self.locked = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    #[test]
    fn writes_only_clear_bits() {
        let mut mem = vec![0xFF; 64];
        let mut flash = RamFlash::new(&mut mem, 16);
        flash.unlock(0);
        flash.write(0, 0, &[0x70]).unwrap();
        flash.write(0, 0, &[0x1F]).unwrap();
        flash.lock(0);
        let mut b = [0];
        flash.read(0, 0, &mut b).unwrap();
        assert_eq!(b, [0x10]);
    }

    #[test]
    fn locked_device_refuses_mutation() {
        let mut mem = vec![0xFF; 64];
        let mut flash = RamFlash::new(&mut mem, 16);
        assert_eq!(flash.write(0, 0, &[0]), Err(FlashError::HardwareFault));
        assert_eq!(flash.erase(0, 0, 16), Err(FlashError::HardwareFault));
        assert_eq!(flash.ops(), 0);
    }

    #[test]
    fn power_loss_tears_and_sticks() {
        let mut mem = vec![0x00; 64];
        {
            let mut flash = RamFlash::with_power_budget(&mut mem, 16, 1);
            flash.unlock(0);
            flash.erase(0, 0, 16).unwrap();
            assert_eq!(flash.erase(0, 16, 16), Err(FlashError::HardwareFault));
            assert!(!flash.powered());
            assert_eq!(flash.erase(0, 32, 16), Err(FlashError::HardwareFault));
        }
        assert!(mem[..16].iter().all(|&b| b == 0xFF));
        assert!(mem[16..32].iter().all(|&b| b == TORN_ERASE_FILL));
        assert!(mem[32..].iter().all(|&b| b == 0x00));
    }
}
