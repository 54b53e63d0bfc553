// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The bcache backing-device layer: a superblock in the first 8 KiB,
// payload at dev.data.first_sector.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::{
    engine::{cmd, device::devpath_from_sysdir, BlockDevice},
    shift::{ShiftError, ShiftResult},
};

/// The bcache superblock magic, found at offset 4096 + 24.
pub const BCACHE_MAGIC: [u8; 16] = [
    0xc6, 0x85, 0x73, 0xf6, 0x4e, 0x1a, 0x45, 0xca, 0x82, 0x65, 0xf5, 0x7f, 0x48, 0xba, 0x6d,
    0x81,
];

/// Superblock versions this tool accepts for backing devices. Whitelisted
/// in case newer backing formats are too different to edit safely.
const BACKING_VERSIONS: [u64; 2] = [1, 4];

#[derive(Debug)]
pub struct BcacheBacking {
    device: BlockDevice,
    offset: Option<u64>,
    version: Option<u64>,
}

impl BcacheBacking {
    pub fn new(device: BlockDevice) -> BcacheBacking {
        BcacheBacking {
            device,
            offset: None,
            version: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_offset(device: BlockDevice, offset: u64) -> BcacheBacking {
        BcacheBacking {
            device,
            offset: Some(offset),
            version: Some(1),
        }
    }

    pub fn device(&self) -> &BlockDevice {
        &self.device
    }

    /// Offset from the start of the backing device to the payload, in
    /// bytes. Valid after read_superblock.
    pub fn offset(&self) -> ShiftResult<u64> {
        self.offset.ok_or_else(|| {
            ShiftError::Msg(format!(
                "bcache superblock of {} has not been read",
                self.device.devpath().display()
            ))
        })
    }

    /// Populate version and payload offset from the on-disk superblock.
    pub fn read_superblock(&mut self) -> ShiftResult<()> {
        let shown = cmd::bcache_super_show(self.device.devpath())?;
        let first_sector = shown.first_sector.ok_or_else(|| {
            ShiftError::Msg(format!(
                "no dev.data.first_sector for {}; not a backing device?",
                self.device.devpath().display()
            ))
        })?;
        if first_sector == 0 {
            return Err(ShiftError::UnsupportedSuperblock {
                device: self.device.devpath().to_owned(),
                details: "bcache payload offset is zero".to_owned(),
            });
        }
        self.version = Some(shown.version);
        self.offset = Some(first_sector * 512);
        Ok(())
    }

    /// Whether the superblock identifies a backing device of a version
    /// this tool can edit.
    pub fn is_backing(&self) -> bool {
        self.version
            .map(|v| BACKING_VERSIONS.contains(&v))
            .unwrap_or(false)
    }

    /// Whether the kernel has the device attached as a bcache backing
    /// device.
    pub fn is_activated(&self) -> ShiftResult<bool> {
        Ok(self.device.sysfspath()?.join("bcache").exists())
    }

    /// The /dev/bcacheN device exposing the payload, registering the
    /// backing device with the kernel first if necessary.
    pub fn cached_device(&mut self) -> ShiftResult<BlockDevice> {
        if !self.is_activated()? {
            register(self.device.devpath())?;
            cmd::udev_settle()?;
        }
        let devpath = devpath_from_sysdir(&self.device.sysfspath()?.join("bcache/dev"))?;
        Ok(BlockDevice::new(devpath))
    }

    /// Detach the backing device from the kernel.
    pub fn deactivate(&mut self) -> ShiftResult<()> {
        let stop_path = self.device.sysfspath()?.join("bcache/stop");
        let mut stop_file = OpenOptions::new().write(true).open(stop_path)?;
        stop_file.write_all(b"stop\n")?;
        drop(stop_file);
        // The stop is asynchronous; give udev a chance to process the
        // departure before checking.
        cmd::udev_settle()?;
        if self.is_activated()? {
            return Err(ShiftError::Msg(format!(
                "could not deactivate bcache device {}",
                self.device.devpath().display()
            )));
        }
        Ok(())
    }

    /// Grow the backing layer; bcache only supports following the device
    /// to its full size.
    pub fn grow_nonrec(&mut self, upper_bound: u64) -> ShiftResult<u64> {
        if upper_bound != self.device.size()? {
            return Err(ShiftError::Msg(format!(
                "bcache backing devices only resize to the device size, not {}",
                upper_bound
            )));
        }
        if !self.is_activated()? {
            // Nothing to do, bcache picks up the size on activation.
            return Ok(upper_bound);
        }
        let resize_path = self.device.sysfspath()?.join("bcache/resize");
        let mut resize_file = OpenOptions::new().write(true).open(resize_path)?;
        resize_file.write_all(b"max\n")?;
        drop(resize_file);

        let mut cached = self.cached_device()?;
        cached.reset_size();
        if cached.size()? + self.offset()? != upper_bound {
            return Err(ShiftError::Msg(format!(
                "bcache resize of {} did not reach the device size",
                self.device.devpath().display()
            )));
        }
        Ok(upper_bound)
    }

    /// The backing layer has no end-area bookkeeping of its own; the
    /// payload simply ends where the inner content ends.
    pub fn reserve_end_area_nonrec(&mut self, pos: u64) -> ShiftResult<u64> {
        Ok(pos)
    }
}

/// Ask the kernel to attach a backing or cache device.
fn register(devpath: &Path) -> ShiftResult<()> {
    let mut register_file = OpenOptions::new()
        .write(true)
        .open("/sys/fs/bcache/register")?;
    writeln!(register_file, "{}", devpath.display())?;
    Ok(())
}
