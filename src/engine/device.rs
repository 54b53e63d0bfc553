// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// A handle on a block device node with memoized probe results.

use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    os::unix::{fs::FileExt, fs::OpenOptionsExt, io::AsRawFd},
    path::{Path, PathBuf},
};

use nix::sys::stat::{major, minor, stat, SFlag};

use crate::{
    engine::{bcache::BCACHE_MAGIC, cmd, dm},
    shift::{ShiftError, ShiftResult},
};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// The size of the block device backing an open file, in bytes.
pub fn blkdev_size(file: &File) -> ShiftResult<u64> {
    let mut val: u64 = 0;
    unsafe { blkgetsize64(file.as_raw_fd(), &mut val) }?;
    Ok(val)
}

/// Read DEVNAME from a sysfs device directory's uevent file and turn it
/// into a /dev path.
pub fn devpath_from_sysdir(sysdir: &Path) -> ShiftResult<PathBuf> {
    let uevent = std::fs::read_to_string(sysdir.join("uevent"))?;
    for line in uevent.lines() {
        if let Some(devname) = line.strip_prefix("DEVNAME=") {
            return Ok(Path::new("/dev").join(devname));
        }
    }
    Err(ShiftError::Msg(format!(
        "no DEVNAME in {}/uevent",
        sysdir.display()
    )))
}

/// A path in /dev naming a block device. Expensive probes are computed
/// lazily and cached; reset_size() invalidates the cached size after the
/// caller mutates the underlying device.
#[derive(Debug)]
pub struct BlockDevice {
    devpath: PathBuf,
    size: Option<u64>,
    superblock_type: Option<Option<String>>,
    ptable_type: Option<Option<String>>,
    has_bcache_superblock: Option<bool>,
    is_dm: Option<bool>,
    is_lv: Option<bool>,
    is_partition: Option<bool>,
}

impl BlockDevice {
    pub fn new<P: Into<PathBuf>>(devpath: P) -> BlockDevice {
        BlockDevice {
            devpath: devpath.into(),
            size: None,
            superblock_type: None,
            ptable_type: None,
            has_bcache_superblock: None,
            is_dm: None,
            is_lv: None,
            is_partition: None,
        }
    }

    /// Look a device up by filesystem UUID.
    pub fn by_uuid(fsuuid: &str) -> ShiftResult<BlockDevice> {
        Ok(BlockDevice::new(cmd::blkid_resolve_uuid(fsuuid)?))
    }

    pub fn devpath(&self) -> &Path {
        &self.devpath
    }

    /// The device basename, e.g. "sda1" for /dev/sda1.
    pub fn basename(&self) -> ShiftResult<String> {
        self.devpath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ShiftError::Msg(format!("device path {} has no basename", self.devpath.display()))
            })
    }

    /// Open the device exclusively for byte-level edits.
    ///
    /// O_EXCL on a block device takes the device lock, exclusive against
    /// mounts and other exclusive openers; O_SYNC makes the edits durable.
    /// A refused open is reported as DeviceBusy, distinct from other I/O
    /// errors.
    pub fn open_excl(&self) -> ShiftResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_EXCL | libc::O_SYNC)
            .open(&self.devpath)
            .map_err(|err| {
                if err.raw_os_error() == Some(libc::EBUSY) {
                    ShiftError::DeviceBusy(self.devpath.clone())
                } else {
                    ShiftError::Io(err)
                }
            })
    }

    /// The device size in bytes; always a multiple of the sector size.
    pub fn size(&mut self) -> ShiftResult<u64> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let file = File::open(&self.devpath)?;
        let size = blkdev_size(&file)?;
        if size % 512 != 0 {
            return Err(ShiftError::Msg(format!(
                "device {} size {} is not a multiple of 512",
                self.devpath.display(),
                size
            )));
        }
        self.size = Some(size);
        Ok(size)
    }

    /// Drop the cached size after a partition or LV resize.
    pub fn reset_size(&mut self) {
        self.size = None;
    }

    /// The superblock type at offset 0, as classified by blkid;
    /// None when nothing is recognized.
    pub fn superblock_type(&mut self) -> ShiftResult<Option<String>> {
        if let Some(ref cached) = self.superblock_type {
            return Ok(cached.clone());
        }
        let probed = cmd::blkid_probe_value(&self.devpath, "TYPE", None)?;
        self.superblock_type = Some(probed.clone());
        Ok(probed)
    }

    /// Probe for a superblock at a non-zero offset; not memoized.
    pub fn superblock_at(&self, offset: u64) -> ShiftResult<Option<String>> {
        cmd::blkid_probe_value(&self.devpath, "TYPE", Some(offset))
    }

    /// The partition-table type (e.g. "gpt"), if any.
    pub fn ptable_type(&mut self) -> ShiftResult<Option<String>> {
        if let Some(ref cached) = self.ptable_type {
            return Ok(cached.clone());
        }
        let probed = cmd::blkid_probe_value(&self.devpath, "PTTYPE", None)?;
        self.ptable_type = Some(probed.clone());
        Ok(probed)
    }

    /// blkid doesn't detect bcache, so special-case it: read the 16-byte
    /// magic directly. Detection must not require bcache-tools; the tools
    /// are only required after a successful detection.
    pub fn has_bcache_superblock(&mut self) -> ShiftResult<bool> {
        if let Some(cached) = self.has_bcache_superblock {
            return Ok(cached);
        }
        let detected = if self.size()? <= 8192 {
            false
        } else {
            let file = File::open(&self.devpath)?;
            let mut magic = [0u8; 16];
            match file.read_exact_at(&mut magic, 4096 + 24) {
                Ok(()) => magic == BCACHE_MAGIC,
                Err(ref err) if err.kind() == ErrorKind::UnexpectedEof => false,
                Err(err) => return Err(ShiftError::Io(err)),
            }
        };
        self.has_bcache_superblock = Some(detected);
        Ok(detected)
    }

    /// Major and minor numbers of the device node.
    pub fn devnum(&self) -> ShiftResult<(u32, u32)> {
        let st = stat(&self.devpath)?;
        if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFBLK {
            return Err(ShiftError::Msg(format!(
                "{} is not a block device",
                self.devpath.display()
            )));
        }
        Ok((major(st.st_rdev) as u32, minor(st.st_rdev) as u32))
    }

    /// The device's directory under /sys/dev/block.
    pub fn sysfspath(&self) -> ShiftResult<PathBuf> {
        let (major, minor) = self.devnum()?;
        Ok(PathBuf::from(format!("/sys/dev/block/{}:{}", major, minor)))
    }

    /// Devices that hold this one open, per sysfs.
    pub fn iter_holders(&self) -> ShiftResult<Vec<BlockDevice>> {
        let holders_path = self.sysfspath()?.join("holders");
        let mut holders = Vec::new();
        if !holders_path.exists() {
            return Ok(holders);
        }
        for entry in std::fs::read_dir(holders_path)? {
            let entry = entry?;
            holders.push(BlockDevice::new(
                Path::new("/dev").join(entry.file_name()),
            ));
        }
        Ok(holders)
    }

    /// Whether this is a device-mapper device.
    pub fn is_dm(&mut self) -> ShiftResult<bool> {
        if let Some(cached) = self.is_dm {
            return Ok(cached);
        }
        let result = self.sysfspath()?.join("dm").exists();
        self.is_dm = Some(result);
        Ok(result)
    }

    /// Whether this is an LVM logical volume: a dm device that lvs knows.
    pub fn is_lv(&mut self) -> ShiftResult<bool> {
        if let Some(cached) = self.is_lv {
            return Ok(cached);
        }
        let result = self.is_dm()? && cmd::lvs_extent_size(&self.devpath).is_ok();
        self.is_lv = Some(result);
        Ok(result)
    }

    /// Whether this is a partition of a larger device.
    pub fn is_partition(&mut self) -> ShiftResult<bool> {
        if let Some(cached) = self.is_partition {
            return Ok(cached);
        }
        let partition_path = self.sysfspath()?.join("partition");
        let result = match std::fs::read_to_string(partition_path) {
            Ok(content) => {
                let content = content.trim();
                !content.is_empty() && content != "0"
            }
            Err(ref err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => return Err(ShiftError::Io(err)),
        };
        self.is_partition = Some(result);
        Ok(result)
    }

    /// The dm name of this device, from sysfs.
    pub fn dm_name(&self) -> ShiftResult<String> {
        let name = std::fs::read_to_string(self.sysfspath()?.join("dm/name"))?;
        Ok(name.trim().to_owned())
    }

    /// The device-mapper table of this device, rendered one target per
    /// line in "start length type params" form.
    pub fn dm_table(&self) -> ShiftResult<String> {
        dm::table_of(&self.dm_name()?)
    }

    /// The containing disk and this partition's byte offset on it.
    pub fn partition_context(&mut self) -> ShiftResult<(PathBuf, u64)> {
        if !self.is_partition()? {
            return Err(ShiftError::Msg(format!(
                "{} is not a partition",
                self.devpath.display()
            )));
        }
        let sysfs = self.sysfspath()?;
        let disk_path = devpath_from_sysdir(&sysfs.join(".."))?;
        let start: u64 = std::fs::read_to_string(sysfs.join("start"))?
            .trim()
            .parse()?;
        Ok((disk_path, start * 512))
    }

    /// Resize the underlying partition or LV. Shrinking must be explicit,
    /// it is the dangerous direction.
    pub fn dev_resize(&mut self, newsize: u64, shrink: bool) -> ShiftResult<u64> {
        let newsize = crate::engine::shared::align_up(newsize, 512);
        if self.is_partition()? {
            let (disk, part_start) = self.partition_context()?;
            let mut table = crate::engine::partition::PartitionTable::read(&disk)?;
            table.part_resize(part_start, newsize, shrink)?;
        } else if self.is_lv()? {
            cmd::lvresize(&self.devpath, newsize, shrink)?;
        } else {
            return Err(ShiftError::Msg(format!(
                "only partitions and LVs can be resized, not {}",
                self.devpath.display()
            )));
        }
        self.reset_size();
        self.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devpath_from_sysdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("uevent"),
            "MAJOR=8\nMINOR=1\nDEVNAME=sda1\nDEVTYPE=partition\n",
        )
        .unwrap();
        assert_eq!(
            devpath_from_sysdir(dir.path()).unwrap(),
            PathBuf::from("/dev/sda1")
        );
    }

    #[test]
    fn test_devpath_from_sysdir_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("uevent"), "MAJOR=8\nMINOR=0\n").unwrap();
        assert_matches!(devpath_from_sysdir(dir.path()), Err(ShiftError::Msg(_)));
    }

    #[test]
    fn test_basename() {
        let dev = BlockDevice::new("/dev/sda1");
        assert_eq!(dev.basename().unwrap(), "sda1");
    }
}
