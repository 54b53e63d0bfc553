// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Filesystem adapters: one per supported on-disk format, dispatched as a
// tagged variant. Each knows how to read its geometry and how to drive
// its resize tool.

use std::{
    fs::File,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use chrono::NaiveDateTime;
use nix::mount::{mount, umount, MsFlags};
use tempfile::TempDir;

use crate::{
    engine::{cmd, shared::align_down, BlockDevice},
    shift::{ShiftError, ShiftResult},
};

const TUNE2FS_TIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// A private temporary mount, unmounted and removed when dropped.
pub struct TempMount {
    dir: TempDir,
    mounted: bool,
}

impl TempMount {
    pub fn new(devpath: &Path, vfstype: &str) -> ShiftResult<TempMount> {
        let dir = tempfile::Builder::new().prefix("privmnt-").tempdir()?;
        mount(
            Some(devpath),
            dir.path(),
            Some(vfstype),
            MsFlags::MS_NOATIME | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None::<&str>,
        )?;
        Ok(TempMount { dir, mounted: true })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for TempMount {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(err) = umount(self.dir.path()) {
                warn!(
                    "could not unmount temporary mount {}: {}",
                    self.dir.path().display(),
                    err
                );
            }
            self.mounted = false;
        }
    }
}

/// Filesystem geometry common to every adapter, from the superblock.
#[derive(Debug, Clone, Copy, Default)]
struct Geometry {
    block_size: u64,
    /// Either a block count or a byte size, depending on what the
    /// filesystem's own tools report.
    block_count: u64,
    size_bytes: u64,
    sb_size_in_bytes: bool,
}

impl Geometry {
    fn fssize(&self) -> ShiftResult<u64> {
        if self.block_size == 0 {
            return Err(ShiftError::Msg(
                "filesystem superblock has not been read".to_owned(),
            ));
        }
        if self.sb_size_in_bytes {
            if self.size_bytes % self.block_size != 0 {
                return Err(ShiftError::Msg(format!(
                    "filesystem size {} is not a multiple of its block size {}",
                    self.size_bytes, self.block_size
                )));
            }
            Ok(self.size_bytes)
        } else {
            Ok(self.block_size * self.block_count)
        }
    }
}

#[derive(Debug)]
pub struct ExtFs {
    geometry: Geometry,
    state: String,
    mount_time: Option<NaiveDateTime>,
    check_time: Option<NaiveDateTime>,
}

#[derive(Debug)]
pub struct Xfs {
    geometry: Geometry,
}

#[derive(Debug)]
pub struct BtrFs {
    geometry: Geometry,
    devid: u64,
}

#[derive(Debug)]
pub struct Nilfs2 {
    geometry: Geometry,
}

#[derive(Debug)]
pub struct ReiserFs {
    geometry: Geometry,
}

#[derive(Debug)]
pub struct Swap {
    geometry: Geometry,
    big_endian: bool,
    version: u32,
}

#[derive(Debug)]
enum FsKind {
    Ext(ExtFs),
    Xfs(Xfs),
    Btrfs(BtrFs),
    Nilfs(Nilfs2),
    Reiser(ReiserFs),
    Swap(Swap),
}

#[derive(Debug)]
pub struct Filesystem {
    device: BlockDevice,
    kind: FsKind,
}

impl Filesystem {
    /// Build the adapter matching a blkid TYPE value; None when the type
    /// is not a filesystem this tool can handle.
    pub fn from_superblock_type(device: BlockDevice, sbtype: &str) -> Option<Filesystem> {
        let kind = match sbtype {
            "ext2" | "ext3" | "ext4" => FsKind::Ext(ExtFs {
                geometry: Geometry::default(),
                state: String::new(),
                mount_time: None,
                check_time: None,
            }),
            "xfs" => FsKind::Xfs(Xfs {
                geometry: Geometry::default(),
            }),
            "btrfs" => FsKind::Btrfs(BtrFs {
                geometry: Geometry {
                    sb_size_in_bytes: true,
                    ..Geometry::default()
                },
                devid: 0,
            }),
            "nilfs2" => FsKind::Nilfs(Nilfs2 {
                geometry: Geometry {
                    sb_size_in_bytes: true,
                    ..Geometry::default()
                },
            }),
            "reiserfs" => FsKind::Reiser(ReiserFs {
                geometry: Geometry::default(),
            }),
            "swap" => FsKind::Swap(Swap {
                geometry: Geometry::default(),
                big_endian: false,
                version: 0,
            }),
            _ => return None,
        };
        Some(Filesystem { device, kind })
    }

    pub fn device(&self) -> &BlockDevice {
        &self.device
    }

    pub fn vfstype(&self) -> &'static str {
        match self.kind {
            FsKind::Ext(_) => "ext4",
            FsKind::Xfs(_) => "xfs",
            FsKind::Btrfs(_) => "btrfs",
            FsKind::Nilfs(_) => "nilfs2",
            FsKind::Reiser(_) => "reiserfs",
            FsKind::Swap(_) => "swap",
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(self.kind, FsKind::Ext(_))
    }

    pub fn can_shrink(&self) -> bool {
        match self.kind {
            FsKind::Xfs(_) => false,
            FsKind::Ext(_)
            | FsKind::Btrfs(_)
            | FsKind::Nilfs(_)
            | FsKind::Reiser(_)
            | FsKind::Swap(_) => true,
        }
    }

    fn resize_needs_mpoint(&self) -> bool {
        match self.kind {
            FsKind::Xfs(_) | FsKind::Nilfs(_) => true,
            // btrfs arranges its own mount; the rest resize offline.
            FsKind::Btrfs(_)
            | FsKind::Ext(_)
            | FsKind::Reiser(_)
            | FsKind::Swap(_) => false,
        }
    }

    fn geometry(&self) -> &Geometry {
        match self.kind {
            FsKind::Ext(ref fs) => &fs.geometry,
            FsKind::Xfs(ref fs) => &fs.geometry,
            FsKind::Btrfs(ref fs) => &fs.geometry,
            FsKind::Nilfs(ref fs) => &fs.geometry,
            FsKind::Reiser(ref fs) => &fs.geometry,
            FsKind::Swap(ref fs) => &fs.geometry,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.geometry().block_size
    }

    /// The filesystem's own idea of its size in bytes.
    pub fn fssize(&self) -> ShiftResult<u64> {
        self.geometry().fssize()
    }

    pub fn fslabel(&self) -> ShiftResult<Option<String>> {
        cmd::blkid_value(self.device.devpath(), "LABEL")
    }

    pub fn fsuuid(&self) -> ShiftResult<Option<String>> {
        cmd::blkid_value(self.device.devpath(), "UUID")
    }

    /// Populate geometry (and adapter-specific state) from the on-disk
    /// superblock; idempotent.
    pub fn read_superblock(&mut self) -> ShiftResult<()> {
        let devpath = self.device.devpath().to_owned();
        match self.kind {
            FsKind::Ext(ref mut fs) => {
                fs.state.clear();
                fs.mount_time = None;
                fs.check_time = None;
                for (key, value) in cmd::tune2fs_list(&devpath)? {
                    match key.as_str() {
                        "Block size" => fs.geometry.block_size = value.parse()?,
                        "Block count" => fs.geometry.block_count = value.parse()?,
                        "Filesystem state" => fs.state = value,
                        "Last mount time" => {
                            fs.mount_time = parse_tune2fs_time(&value);
                        }
                        "Last checked" => {
                            fs.check_time = parse_tune2fs_time(&value);
                        }
                        _ => (),
                    }
                }
            }
            FsKind::Xfs(ref mut fs) => {
                let (dblocks, blocksize) = cmd::xfs_db_geometry(&devpath)?;
                fs.geometry.block_count = dblocks;
                fs.geometry.block_size = blocksize;
            }
            FsKind::Btrfs(ref mut fs) => {
                let dumped = cmd::btrfs_dump_super(&devpath)?;
                fs.geometry.block_size = dumped.sectorsize;
                fs.geometry.size_bytes = dumped.total_bytes;
                fs.devid = dumped.devid;
            }
            FsKind::Nilfs(ref mut fs) => {
                let (block_size, device_size) = cmd::nilfs_tune_geometry(&devpath)?;
                fs.geometry.block_size = block_size;
                fs.geometry.size_bytes = device_size;
            }
            FsKind::Reiser(ref mut fs) => {
                let (block_size, block_count) = cmd::reiserfstune_geometry(&devpath)?;
                fs.geometry.block_size = block_size;
                fs.geometry.block_count = block_count;
            }
            FsKind::Swap(ref mut fs) => {
                let dev_file = self.device.open_excl()?;
                let header = read_swap_header(&dev_file, &devpath)?;
                fs.geometry.block_size = 4096;
                fs.geometry.block_count = u64::from(header.last_page) + 1;
                fs.big_endian = header.big_endian;
                fs.version = header.version;
            }
        }
        if self.geometry().block_size == 0 {
            return Err(ShiftError::UnsupportedSuperblock {
                device: devpath,
                details: format!("no block size reported for a {} filesystem", self.vfstype()),
            });
        }
        Ok(())
    }

    /// Whether some mount of this device exists, per mountinfo.
    pub fn is_mounted(&self) -> ShiftResult<bool> {
        if let FsKind::Swap(_) = self.kind {
            return swap_is_active(self.device.devpath());
        }
        Ok(self.mount_point()?.is_some())
    }

    /// The first mount point of this device, if mounted.
    fn mount_point(&self) -> ShiftResult<Option<PathBuf>> {
        let (major, minor) = self.device.devnum()?;
        let device_id = format!("{}:{}", major, minor);
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
        for line in mountinfo.lines() {
            let items = line.split_whitespace().collect::<Vec<_>>();
            if items.len() > 4 && items[2] == device_id {
                return Ok(Some(PathBuf::from(items[4])));
            }
        }
        Ok(None)
    }

    /// Run the type-specific resize, mounting first when the tool needs a
    /// mount point, then re-read the superblock and insist on the exact
    /// target.
    fn mount_and_resize(&mut self, target_size: u64) -> ShiftResult<()> {
        if self.resize_needs_mpoint() && !self.is_mounted()? {
            let mnt = TempMount::new(self.device.devpath(), self.vfstype())?;
            self.resize_inner(target_size, Some(mnt.path().to_owned()))?;
        } else {
            let mpoint = if self.resize_needs_mpoint() {
                self.mount_point()?
            } else {
                None
            };
            self.resize_inner(target_size, mpoint)?;
        }

        self.read_superblock()?;
        if self.fssize()? != target_size {
            return Err(ShiftError::Msg(format!(
                "resize of {} missed the target: {} != {}",
                self.device.devpath().display(),
                self.fssize()?,
                target_size
            )));
        }
        Ok(())
    }

    fn resize_inner(&mut self, target_size: u64, mpoint: Option<PathBuf>) -> ShiftResult<()> {
        let block_size = self.block_size();
        if target_size % block_size != 0 {
            return Err(ShiftError::Msg(format!(
                "resize target {} is not a multiple of the block size {}",
                target_size, block_size
            )));
        }
        let devpath = self.device.devpath().to_owned();
        match self.kind {
            FsKind::Ext(ref fs) => {
                // resize2fs requires a checked filesystem. -n would be
                // read-only and not update the check stamp, so a real
                // check run is needed.
                let needs_check = fs.state != "clean"
                    || match (fs.check_time, fs.mount_time) {
                        (Some(check), Some(mount)) => check < mount,
                        (None, Some(_)) => true,
                        _ => false,
                    };
                if !self.is_mounted()? && needs_check {
                    info!("checking the filesystem before resizing it");
                    cmd::e2fsck_force(&devpath, false)?;
                }
                cmd::resize2fs(&devpath, target_size / block_size)?;
            }
            FsKind::Xfs(_) => {
                let mpoint = mpoint.ok_or_else(|| {
                    ShiftError::Msg("xfs_growfs needs a mount point".to_owned())
                })?;
                cmd::xfs_growfs(&mpoint, target_size / block_size)?;
            }
            FsKind::Btrfs(ref fs) => {
                // The device stays busy for a while after unmounting;
                // introduced in Linux 3.0, fixed in 3.9.
                let mnt = TempMount::new(&devpath, "btrfs")?;
                cmd::btrfs_resize(mnt.path(), fs.devid, target_size)?;
            }
            FsKind::Nilfs(_) => {
                cmd::nilfs_resize(&devpath, target_size)?;
            }
            FsKind::Reiser(_) => {
                cmd::resize_reiserfs(&devpath, target_size)?;
            }
            FsKind::Swap(ref fs) => {
                // mkswap and swaplabel would drop metadata; rewrite the
                // (version, last_page) pair in place instead.
                let last_page = (target_size / fs.geometry.block_size - 1) as u32;
                let dev_file = self.device.open_excl()?;
                write_swap_geometry(&dev_file, fs.big_endian, fs.version, last_page)?;
            }
        }
        Ok(())
    }

    /// Shrink (or leave alone) this layer so it ends at or before pos,
    /// aligned down to a block boundary that does not encroach.
    pub fn reserve_end_area_nonrec(&mut self, pos: u64) -> ShiftResult<u64> {
        let fssize = self.fssize()?;
        let pos = align_down(pos, self.block_size());
        if fssize <= pos {
            return Ok(pos);
        }
        if !self.can_shrink() {
            return Err(ShiftError::CantShrink(format!(
                "a {} filesystem cannot shrink",
                self.vfstype()
            )));
        }
        self.mount_and_resize(pos)?;
        Ok(pos)
    }

    /// Grow the filesystem up to upper_bound, aligned down to its block
    /// size.
    pub fn grow_nonrec(&mut self, upper_bound: u64) -> ShiftResult<u64> {
        let fssize = self.fssize()?;
        let newsize = align_down(upper_bound, self.block_size());
        if fssize > newsize {
            return Err(ShiftError::Msg(format!(
                "grow target {} is below the current size {}",
                newsize, fssize
            )));
        }
        if fssize == newsize {
            return Ok(newsize);
        }
        self.mount_and_resize(newsize)?;
        Ok(newsize)
    }
}

fn parse_tune2fs_time(value: &str) -> Option<NaiveDateTime> {
    if value == "n/a" {
        return None;
    }
    NaiveDateTime::parse_from_str(value, TUNE2FS_TIME_FORMAT).ok()
}

/// Whether the device is an active swap area, per /proc/swaps.
fn swap_is_active(devpath: &Path) -> ShiftResult<bool> {
    let swaps = std::fs::read_to_string("/proc/swaps")?;
    Ok(swaps
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .any(|swap_path| Path::new(swap_path) == devpath))
}

#[derive(Debug, Clone, Copy)]
struct SwapHeader {
    big_endian: bool,
    version: u32,
    last_page: u32,
}

/// Read the swap signature page: "SWAPSPACE2" at the end of the first
/// 4 KiB page, (version, last_page) at offset 1024 in whichever
/// endianness mkswap used.
fn read_swap_header(dev_file: &File, devpath: &Path) -> ShiftResult<SwapHeader> {
    let mut magic = [0u8; 10];
    dev_file.read_exact_at(&mut magic, 4096 - 10)?;
    if &magic != b"SWAPSPACE2" {
        return Err(ShiftError::UnsupportedSuperblock {
            device: devpath.to_owned(),
            details: format!("bad swap magic {:?}", String::from_utf8_lossy(&magic)),
        });
    }

    let mut fields = [0u8; 8];
    dev_file.read_exact_at(&mut fields, 1024)?;
    let version_fields: [u8; 4] = fields[..4].try_into().expect("slice length is 4");
    let page_fields: [u8; 4] = fields[4..].try_into().expect("slice length is 4");

    let (big_endian, version, last_page) = if u32::from_be_bytes(version_fields) == 1 {
        (
            true,
            u32::from_be_bytes(version_fields),
            u32::from_be_bytes(page_fields),
        )
    } else if u32::from_le_bytes(version_fields) == 1 {
        (
            false,
            u32::from_le_bytes(version_fields),
            u32::from_le_bytes(page_fields),
        )
    } else {
        return Err(ShiftError::UnsupportedSuperblock {
            device: devpath.to_owned(),
            details: format!(
                "unsupported swap version {}",
                u32::from_le_bytes(version_fields).min(u32::from_be_bytes(version_fields))
            ),
        });
    };

    if last_page == 0 {
        return Err(ShiftError::UnsupportedSuperblock {
            device: devpath.to_owned(),
            details: "swap area has no pages".to_owned(),
        });
    }
    Ok(SwapHeader {
        big_endian,
        version,
        last_page,
    })
}

/// Rewrite the (version, last_page) pair, preserving the original
/// endianness.
fn write_swap_geometry(
    dev_file: &File,
    big_endian: bool,
    version: u32,
    last_page: u32,
) -> ShiftResult<()> {
    let mut fields = [0u8; 8];
    if big_endian {
        fields[..4].copy_from_slice(&version.to_be_bytes());
        fields[4..].copy_from_slice(&last_page.to_be_bytes());
    } else {
        fields[..4].copy_from_slice(&version.to_le_bytes());
        fields[4..].copy_from_slice(&last_page.to_le_bytes());
    }
    dev_file.write_all_at(&fields, 1024)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn swap_scratch(big_endian: bool, last_page: u32) -> tempfile::NamedTempFile {
        let mut scratch = tempfile::NamedTempFile::new().unwrap();
        let mut page = vec![0u8; 4096];
        if big_endian {
            page[1024..1028].copy_from_slice(&1u32.to_be_bytes());
            page[1028..1032].copy_from_slice(&last_page.to_be_bytes());
        } else {
            page[1024..1028].copy_from_slice(&1u32.to_le_bytes());
            page[1028..1032].copy_from_slice(&last_page.to_le_bytes());
        }
        page[4096 - 10..].copy_from_slice(b"SWAPSPACE2");
        scratch.write_all(&page).unwrap();
        scratch
    }

    #[test]
    fn test_read_swap_header_both_endiannesses() {
        for big_endian in [false, true] {
            let scratch = swap_scratch(big_endian, 25599);
            let header = read_swap_header(scratch.as_file(), scratch.path()).unwrap();
            assert_eq!(header.big_endian, big_endian);
            assert_eq!(header.version, 1);
            assert_eq!(header.last_page, 25599);
        }
    }

    #[test]
    fn test_read_swap_header_bad_magic() {
        let mut scratch = tempfile::NamedTempFile::new().unwrap();
        scratch.write_all(&vec![0u8; 4096]).unwrap();
        assert_matches!(
            read_swap_header(scratch.as_file(), scratch.path()),
            Err(ShiftError::UnsupportedSuperblock { .. })
        );
    }

    #[test]
    fn test_swap_resize_preserves_endianness() {
        let scratch = swap_scratch(true, 25599);
        write_swap_geometry(scratch.as_file(), true, 1, 12799).unwrap();
        let header = read_swap_header(scratch.as_file(), scratch.path()).unwrap();
        assert!(header.big_endian);
        assert_eq!(header.last_page, 12799);
    }

    #[test]
    fn test_parse_tune2fs_time() {
        let parsed = parse_tune2fs_time("Tue Apr  4 12:30:00 2023").unwrap();
        assert_eq!(parsed.format("%Y-%m-%d %H:%M").to_string(), "2023-04-04 12:30");
        assert_eq!(parse_tune2fs_time("n/a"), None);
    }

    #[test]
    fn test_from_superblock_type() {
        let fs = Filesystem::from_superblock_type(BlockDevice::new("/dev/null"), "ext4").unwrap();
        assert!(fs.is_ext());
        assert!(fs.can_shrink());

        let fs = Filesystem::from_superblock_type(BlockDevice::new("/dev/null"), "xfs").unwrap();
        assert!(!fs.can_shrink());

        assert!(
            Filesystem::from_superblock_type(BlockDevice::new("/dev/null"), "vfat").is_none()
        );
    }

    #[test]
    fn test_geometry_fssize() {
        let by_blocks = Geometry {
            block_size: 4096,
            block_count: 25600,
            size_bytes: 0,
            sb_size_in_bytes: false,
        };
        assert_eq!(by_blocks.fssize().unwrap(), 100 * 1024 * 1024);

        let by_bytes = Geometry {
            block_size: 4096,
            block_count: 0,
            size_bytes: 100 * 1024 * 1024,
            sb_size_in_bytes: true,
        };
        assert_eq!(by_bytes.fssize().unwrap(), 100 * 1024 * 1024);

        let misaligned = Geometry {
            block_size: 4096,
            block_count: 0,
            size_bytes: 4097,
            sb_size_in_bytes: true,
        };
        assert_matches!(misaligned.fssize(), Err(ShiftError::Msg(_)));
    }
}
