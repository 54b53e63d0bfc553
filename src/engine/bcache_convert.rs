// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The bcache retrofit pipelines. Three ways onto the same ending: the
// device gains a bcache backing superblock ahead of its payload, and the
// payload is not moved.
//
//   LUKS volume     shift the LUKS header forward by 8 KiB and point its
//                   payload-offset field back at the unmoved payload.
//   partition       steal 1 MiB of free space before the partition and
//                   slide the table entry left over it.
//   logical volume  free one PE at the end, write the superblock there,
//                   then rotate that PE to the front of the LV.

use crate::{
    engine::{
        bcache::BcacheBacking,
        cmd,
        get_block_stack,
        luks::Luks,
        lvm::rotate::{rotate_lv, Direction},
        partition::PartitionTable,
        shared::bytes_to_sectors,
        synth::{SyntheticDevice, SyntheticImage},
        BlockDevice,
    },
    shift::{ShiftError, ShiftResult},
};

/// The smallest data offset make-bcache accepts: the superblock lives in
/// sectors 8..16, so 16 sectors is the tightest legal fit and the most
/// compatible choice for the LUKS shift.
pub const LUKS_SHIFT_BY: u64 = 512 * 16;

/// Let make-bcache format a backing superblock inside a sandbox sized
/// like the target, and keep the written bytes. The read-back offset is
/// checked against the requested one before anything touches a real
/// device.
fn make_bcache_image(
    bsb_size: u64,
    data_size: u64,
    join: Option<&str>,
) -> ShiftResult<SyntheticImage> {
    let synth = SyntheticDevice::new(bsb_size, data_size, 0)?;
    cmd::make_bcache_backing(synth.devpath(), bytes_to_sectors(bsb_size)?, join)?;

    let mut backing = BcacheBacking::new(BlockDevice::new(synth.devpath()));
    backing.read_superblock()?;
    if backing.offset()? != bsb_size {
        return Err(ShiftError::Msg(format!(
            "make-bcache placed the payload at {} bytes, requested {}",
            backing.offset()?,
            bsb_size
        )));
    }
    synth.capture()
}

/// Convert a LUKS volume: the superblock area ends well before the
/// payload, so the whole header moves forward by 8 KiB and bcache takes
/// the vacated first sectors.
pub fn luks_to_bcache(device: &mut BlockDevice, join: Option<&str>) -> ShiftResult<()> {
    let mut luks = Luks::new(BlockDevice::new(device.devpath()));
    luks.read_superblock()?;
    luks.deactivate()?;

    let dev_file = device.open_excl()?;
    luks.read_superblock_ll(&dev_file)?;

    if luks.sb_end()? + LUKS_SHIFT_BY > luks.offset()? {
        return Err(ShiftError::Msg(format!(
            "LUKS superblock of {} ends at {}, no room for an {} byte shift",
            device.devpath().display(),
            luks.sb_end()?,
            LUKS_SHIFT_BY
        )));
    }

    let data_size = device.size()? - LUKS_SHIFT_BY;
    let image = make_bcache_image(LUKS_SHIFT_BY, data_size, join)?;

    eprintln!(
        "Shifting the LUKS header of {}. If this is interrupted, the header \
         must be restored from a LUKS header backup before the volume can be \
         opened again.",
        device.devpath().display()
    );
    info!("shifting and editing the LUKS superblock");
    luks.shift_sb(&dev_file, LUKS_SHIFT_BY)?;

    info!("copying the bcache superblock");
    image.copy_to_physical(&dev_file, 0, 0, false)?;
    Ok(())
}

/// Convert a partition: reserve free space before it, write the
/// superblock there, then redefine the partition to start on it.
pub fn part_to_bcache(device: &mut BlockDevice, join: Option<&str>) -> ShiftResult<()> {
    // parted aligns to 1 MiB; a superblock of that size never makes
    // alignment worse.
    let bsb_size: u64 = 1024 * 1024;
    let data_size = device.size()?;

    let (disk_path, part_start) = device.partition_context()?;
    let mut table = PartitionTable::read(&disk_path)?;
    table.reserve_space_before(part_start, bsb_size)?;
    let new_start = part_start - bsb_size;

    let image = make_bcache_image(bsb_size, data_size, join)?;

    let mut disk = BlockDevice::new(&disk_path);
    {
        let disk_file = disk.open_excl()?;
        info!("copying the bcache superblock");
        image.copy_to_physical(&disk_file, new_start as i64, 0, true)?;
    }

    // The partition itself must be idle too, or the kernel will refuse
    // to take the updated table.
    drop(device.open_excl()?);

    info!("shifting the partition to start on the bcache superblock");
    table.shift_left(part_start, new_start)?;
    device.reset_size();
    disk.reset_size();
    Ok(())
}

/// Convert a logical volume: shrink the content by one PE, write the
/// superblock into the freed last PE, then rotate that PE to the front
/// so it sits at logical offset 0.
pub fn lv_to_bcache(device: &mut BlockDevice, join: Option<&str>) -> ShiftResult<()> {
    let pe_size = cmd::lvs_extent_size(device.devpath())?;
    let dev_size = device.size()?;
    if dev_size % pe_size != 0 {
        return Err(ShiftError::Msg(format!(
            "LV size {} is not a multiple of its extent size {}",
            dev_size, pe_size
        )));
    }
    let data_size = dev_size - pe_size;

    let mut stack = get_block_stack(BlockDevice::new(device.devpath()))?;
    stack.read_superblocks()?;
    stack.stack_reserve_end_area(data_size)?;
    stack.deactivate()?;

    let image = make_bcache_image(pe_size, data_size, join)?;
    {
        let dev_file = device.open_excl()?;
        info!("copying the bcache superblock");
        image.copy_to_physical(&dev_file, -(pe_size as i64), 0, false)?;
    }

    rotate_lv(device, dev_size, Direction::Backward)
}

/// Dispatch a to-bcache conversion by device class and activate the
/// result, preserving the filesystem identity end to end.
pub fn cmd_to_bcache(device: &mut BlockDevice, join: Option<&str>) -> ShiftResult<()> {
    cmd::require_bcache_tools()?;

    if device.is_partition()? {
        part_to_bcache(device, join)?;
    } else if device.is_lv()? {
        lv_to_bcache(device, join)?;
    } else if device.superblock_type()?.as_deref() == Some("crypto_LUKS") {
        luks_to_bcache(device, join)?;
    } else {
        return Err(ShiftError::UnsupportedLayout(format!(
            "{} is not a partition, a logical volume, or a LUKS volume",
            device.devpath().display()
        )));
    }

    let mut backing = BcacheBacking::new(BlockDevice::new(device.devpath()));
    backing.read_superblock()?;
    let cached = backing.cached_device()?;
    info!(
        "bcache backing device active, contents at {}",
        cached.devpath().display()
    );
    Ok(())
}
