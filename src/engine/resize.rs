// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The stacked resize driver and the standalone rotate command.

use crate::{
    engine::{
        cmd,
        get_block_stack,
        lvm::rotate::{rotate_lv, Direction},
        BlockDevice,
    },
    shift::{ShiftError, ShiftResult},
};

/// Resize the contents of a layered device, optionally resizing the
/// partition or LV under it as well. Grows enlarge the device before the
/// contents; shrinks contract the contents before the device.
pub fn cmd_resize(
    device: &mut BlockDevice,
    mut newsize: u64,
    resize_device: bool,
) -> ShiftResult<()> {
    let mut stack = get_block_stack(BlockDevice::new(device.devpath()))?;

    let device_delta = newsize as i64 - device.size()? as i64;
    if device_delta > 0 && resize_device {
        // The new size may be rounded up for partition alignment, and
        // LVM rounds to extents; trust the device, not the argument.
        newsize = device.dev_resize(newsize, false)?;
    }

    stack.read_superblocks()?;
    let total_data_size = stack.total_data_size()?;
    let device_size = device.size()?;
    if total_data_size > device_size {
        let devpath = device.devpath().display().to_string();
        return Err(ShiftError::Msg(format!(
            "the stack on {} claims {} bytes but the device has only {}",
            devpath,
            total_data_size,
            device_size
        )));
    }
    let data_delta = newsize as i64 - total_data_size as i64;
    stack.stack_resize(newsize, data_delta < 0)?;

    if device_delta < 0 && resize_device {
        let target = stack.total_data_size()?;
        // LVM can reload in-use devices, but the kernel's partition
        // handling can't.
        if device.is_partition()? {
            stack.deactivate()?;
        }
        device.dev_resize(target, true)?;
    }
    Ok(())
}

/// Rotate an LV produced by the LVM retrofit so its content starts at
/// extent 0 again: only meaningful when the second PE carries the
/// filesystem superblock.
pub fn cmd_rotate(device: &mut BlockDevice) -> ShiftResult<()> {
    let pe_size = cmd::lvs_extent_size(device.devpath())?;
    if device.superblock_at(pe_size)?.is_none() {
        return Err(ShiftError::UnsupportedLayout(format!(
            "no superblock on the second PE of {}, nothing to rotate",
            device.devpath().display()
        )));
    }
    let size = device.size()?;
    rotate_lv(device, size, Direction::Forward)
}
