// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Process-wide devicemapper context and table-level helpers.

use devicemapper::{DevId, DmFlags, DmName, DmOptions, DM};

use crate::{
    engine::cmd,
    shift::{ShiftError, ShiftResult},
};

lazy_static! {
    static ref DM_CONTEXT: Result<DM, devicemapper::DmError> = DM::new();
}

pub fn get_dm() -> ShiftResult<&'static DM> {
    match *DM_CONTEXT {
        Ok(ref context) => Ok(context),
        Err(ref err) => Err(ShiftError::Msg(format!(
            "could not obtain a devicemapper context: {}",
            err
        ))),
    }
}

/// One target line of a dm table: start and length in sectors, target
/// type, and the target's parameter string.
pub type DmTargetLine = (u64, u64, String, String);

/// Create, load and resume a dm device with the given table. Creation is
/// retried once after settling udev; device nodes can be claimed briefly
/// by the udev probes that creation itself triggers.
pub fn mk_dm(name: &str, targets: &[DmTargetLine], readonly: bool) -> ShiftResult<()> {
    let dm = get_dm()?;
    let dm_name = DmName::new(name)?;
    let dev_id = DevId::Name(dm_name);
    let options = if readonly {
        DmOptions::default().set_flags(DmFlags::DM_READONLY)
    } else {
        DmOptions::default()
    };

    if let Err(first_err) = dm.device_create(dm_name, None, options) {
        warn!(
            "dm create of {} failed ({}), settling udev and retrying",
            name, first_err
        );
        cmd::udev_settle()?;
        dm.device_create(dm_name, None, options)?;
    }

    let load = dm
        .table_load(&dev_id, targets, options)
        .and_then(|_| dm.device_suspend(&dev_id, DmOptions::default()));
    if let Err(err) = load {
        // Never leave a created-but-unloaded node behind.
        if let Err(remove_err) = dm.device_remove(&dev_id, DmOptions::default()) {
            warn!(
                "could not remove partially created dm device {}: {}",
                name, remove_err
            );
        }
        return Err(ShiftError::Dm(err));
    }
    Ok(())
}

/// Remove a dm device, settling udev first so transient openers from
/// event processing do not make the removal fail spuriously.
pub fn remove_dm(name: &str) -> ShiftResult<()> {
    let dm = get_dm()?;
    let dm_name = DmName::new(name)?;
    let dev_id = DevId::Name(dm_name);
    if let Err(first_err) = dm.device_remove(&dev_id, DmOptions::default()) {
        warn!(
            "dm remove of {} failed ({}), settling udev and retrying",
            name, first_err
        );
        cmd::udev_settle()?;
        dm.device_remove(&dev_id, DmOptions::default())?;
    }
    Ok(())
}

/// The loaded table of a dm device, rendered one target per line in
/// "start length type params" form, matching the kernel's table listing.
pub fn table_of(name: &str) -> ShiftResult<String> {
    let dm = get_dm()?;
    let dm_name = DmName::new(name)?;
    let dev_id = DevId::Name(dm_name);
    let (_, table) = dm.table_status(
        &dev_id,
        DmOptions::default().set_flags(DmFlags::DM_STATUS_TABLE),
    )?;
    let mut rendered = String::new();
    for (start, length, target_type, params) in table {
        let line = if params.is_empty() {
            format!("{} {} {}\n", start, length, target_type)
        } else {
            format!("{} {} {} {}\n", start, length, target_type, params)
        };
        rendered.push_str(&line);
    }
    Ok(rendered)
}

/// List dm device names left over from a previous crashed run: sandbox
/// devices are recognizable by their name prefix.
pub fn stale_sandbox_devices() -> ShiftResult<Vec<String>> {
    let dm = get_dm()?;
    let mut stale = Vec::new();
    for (name, _, _) in dm.list_devices()? {
        let name = name.to_string();
        if name.starts_with("rozeros-") || name.starts_with("synthetic-") {
            stale.push(name);
        }
    }
    Ok(stale)
}
