// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The LVM retrofit pipeline: shrink the filesystem by one physical
// extent, displace the first PE to the freed space at the end, then
// install LVM metadata that maps logical extent 0 onto the displaced
// copy and the rest of the LV onto the untouched extents.

use std::{fs::File, os::unix::fs::FileExt, path::Path};

use uuid::Uuid;

use crate::{
    engine::{
        cmd,
        get_block_stack,
        shared::{name_is_whitelisted, LVM_PE_SIZE},
        synth::SyntheticDevice,
        BlockDevice,
    },
    shift::{ShiftError, ShiftResult},
};

#[derive(Debug, Default)]
pub struct ToLvmOptions {
    /// Verbatim VG name to create.
    pub vgname: Option<String>,
    /// Existing VG to join; implies that VG's extent size and a
    /// throwaway name merged away at the end.
    pub join: Option<String>,
}

#[derive(Debug)]
pub struct ToLvmReport {
    pub vgname: String,
    pub lvname: String,
    pub fsuuid: Option<String>,
}

/// The LV is named after the filesystem label when the label is usable
/// as an LVM name, else after the device, else generically.
fn choose_lv_name(fslabel: Option<&str>, basename: &str) -> String {
    let candidate = match fslabel {
        Some(label) if !label.is_empty() => label,
        _ => basename,
    };
    if name_is_whitelisted(candidate) {
        candidate.to_owned()
    } else {
        "lv1".to_owned()
    }
}

/// The complete restore-file text for a VG of one PV carrying one
/// two-segment linear LV: logical extent 0 lives at the end of the PV
/// (the displaced first PE), everything else stays in place.
#[allow(clippy::too_many_arguments)]
fn format_metadata(
    vgname: &str,
    vg_uuid: &str,
    pv_uuid: &str,
    lvname: &str,
    lv_uuid: &str,
    pe_sectors: u64,
    pe_count: u64,
) -> String {
    format!(
        "contents = \"Text Format Volume Group\"\n\
         version = 1\n\
         \n\
         {vgname} {{\n\
         \tid = \"{vg_uuid}\"\n\
         \tseqno = 0\n\
         \tstatus = [\"RESIZEABLE\", \"READ\", \"WRITE\"]\n\
         \textent_size = {pe_sectors}\n\
         \tmax_lv = 0\n\
         \tmax_pv = 0\n\
         \n\
         \tphysical_volumes {{\n\
         \t\tpv0 {{\n\
         \t\t\tid = \"{pv_uuid}\"\n\
         \t\t\tstatus = [\"ALLOCATABLE\"]\n\
         \n\
         \t\t\tpe_start = {pe_sectors}\n\
         \t\t\tpe_count = {pe_count}\n\
         \t\t\tba_start = 2048\n\
         \t\t\tba_size = 2048\n\
         \t\t}}\n\
         \t}}\n\
         \n\
         \tlogical_volumes {{\n\
         \t\t{lvname} {{\n\
         \t\t\tid = \"{lv_uuid}\"\n\
         \t\t\tstatus = [\"READ\", \"WRITE\", \"VISIBLE\"]\n\
         \t\t\tsegment_count = 2\n\
         \n\
         \t\t\tsegment1 {{\n\
         \t\t\t\tstart_extent = 0\n\
         \t\t\t\textent_count = 1\n\
         \t\t\t\ttype = \"striped\"\n\
         \t\t\t\tstripe_count = 1\t# linear\n\
         \t\t\t\tstripes = [\n\
         \t\t\t\t\t\"pv0\", {last_extent}\n\
         \t\t\t\t]\n\
         \t\t\t}}\n\
         \t\t\tsegment2 {{\n\
         \t\t\t\tstart_extent = 1\n\
         \t\t\t\textent_count = {rest_extents}\n\
         \t\t\t\ttype = \"striped\"\n\
         \t\t\t\tstripe_count = 1\t# linear\n\
         \t\t\t\tstripes = [\n\
         \t\t\t\t\t\"pv0\", 0\n\
         \t\t\t\t]\n\
         \t\t\t}}\n\
         \t\t}}\n\
         \t}}\n\
         }}\n",
        vgname = vgname,
        vg_uuid = vg_uuid,
        pv_uuid = pv_uuid,
        lvname = lvname,
        lv_uuid = lv_uuid,
        pe_sectors = pe_sectors,
        pe_count = pe_count,
        last_extent = pe_count - 1,
        rest_extents = pe_count - 1,
    )
}

/// The --config value that restricts LVM to the synthetic device, so the
/// metadata-writing commands cannot touch the real one.
fn lvm_config_for(synth_path: &Path) -> String {
    format!(
        "devices{{filter=[\"a|^{}$|\",\"r|.*|\"]}}activation{{verify_udev_operations=1}}",
        synth_path.display()
    )
}

/// Convert a device holding a filesystem stack into an LVM2 physical
/// volume in place, preserving the filesystem.
pub fn cmd_to_lvm(device: &mut BlockDevice, options: &ToLvmOptions) -> ShiftResult<ToLvmReport> {
    cmd::require_lvm()?;

    let (vgname, pe_size, join_target) = match (&options.join, &options.vgname) {
        (Some(join), _) => {
            let target = cmd::vgs_identity(join)?;
            // A random name for now; vgmerge folds it into the target.
            (Uuid::new_v4().to_string(), target.extent_size, Some(target))
        }
        (None, Some(vgname)) => (vgname.clone(), LVM_PE_SIZE, None),
        (None, None) => (
            format!("vg.{}", device.basename()?),
            LVM_PE_SIZE,
            None,
        ),
    };
    if !name_is_whitelisted(&vgname) {
        return Err(ShiftError::Msg(format!(
            "VG name '{}' contains characters outside the alphanumeric+dot whitelist",
            vgname
        )));
    }

    let dev_size = device.size()?;
    if pe_size < 4096 || pe_size % 512 != 0 {
        return Err(ShiftError::Msg(format!(
            "unusable extent size {}",
            pe_size
        )));
    }
    if dev_size % pe_size != 0 {
        return Err(ShiftError::Msg(format!(
            "device size {} is not a multiple of the extent size {}",
            dev_size, pe_size
        )));
    }

    let pe_sectors = pe_size / 512;
    let pe_count = dev_size / pe_size - 1;
    let pe_newpos = pe_count * pe_size;
    if pe_count < 2 {
        return Err(ShiftError::Msg(format!(
            "device of {} bytes is too small to hold metadata and data extents",
            dev_size
        )));
    }
    debug!(
        "pe {} pe_newpos {} devsize {}",
        pe_size, pe_newpos, dev_size
    );

    let mut stack = get_block_stack(BlockDevice::new(device.devpath()))?;
    stack.read_superblocks()?;
    let lvname = choose_lv_name(stack.fslabel()?.as_deref(), &device.basename()?);

    if stack.fs().is_ext() {
        // resize2fs insists on a clean filesystem; an unattended run
        // cannot stop to answer fsck prompts.
        info!("checking the filesystem before resizing it");
        cmd::e2fsck_force(stack.fs().device().devpath(), true)?;
    }
    stack.stack_reserve_end_area(pe_newpos)?;

    let fsuuid = stack.fsuuid()?;
    stack.deactivate()?;

    {
        let dev_file = device.open_excl()?;
        info!(
            "copying {} bytes from position 0 to position {}",
            pe_size, pe_newpos
        );
        let mut pe_data = vec![0u8; pe_size as usize];
        dev_file.read_exact_at(&mut pe_data, 0)?;
        dev_file.write_all_at(&pe_data, pe_newpos)?;
        // The exclusive open must not outlive this block; LVM needs the
        // device reachable while it scans the synthetic sandbox.
    }

    info!("preparing LVM metadata");
    let pv_uuid = Uuid::new_v4().to_string();
    let metadata = format_metadata(
        &vgname,
        &Uuid::new_v4().to_string(),
        &pv_uuid,
        &lvname,
        &Uuid::new_v4().to_string(),
        pe_sectors,
        pe_count,
    );
    let workdir = tempfile::Builder::new().prefix("blockshift-lvm-").tempdir()?;
    let restorefile = workdir.path().join("vg.cfg");
    std::fs::write(&restorefile, &metadata)?;

    let synth = SyntheticDevice::new(pe_size, dev_size - 2 * pe_size, pe_size)?;
    let lvm_config = lvm_config_for(synth.devpath());
    cmd::pvcreate_restore(synth.devpath(), &restorefile, &pv_uuid, &lvm_config)?;
    cmd::vgcfgrestore(&vgname, &restorefile, Some(&lvm_config))?;
    let image = synth.capture()?;

    eprintln!(
        "If the next stage is interrupted, it can be reverted with:\n    \
         dd if={devpath} of={devpath} bs={pe} count=1 skip={last} conv=notrunc",
        devpath = device.devpath().display(),
        pe = pe_size,
        last = pe_count,
    );

    info!("installing LVM metadata");
    let dev_file = device.open_excl()?;
    install_head(&dev_file, image.head())?;
    drop(dev_file);

    info!("activating volume group {}", vgname);
    cmd::udev_settle()?;
    cmd::vgchange_activate(&vgname)?;

    let vgname = match join_target {
        Some(target) => {
            cmd::vgmerge(&target.name, &vgname)?;
            target.name
        }
        None => vgname,
    };

    info!(
        "volume group {}, logical volume {}, filesystem uuid {}",
        vgname,
        lvname,
        fsuuid.as_deref().unwrap_or("unknown")
    );
    Ok(ToLvmReport {
        vgname,
        lvname,
        fsuuid,
    })
}

/// Write the formatted metadata extent over the head of the real device
/// and read it back; a mismatch means the write tore.
fn install_head(dev_file: &File, head: &[u8]) -> ShiftResult<()> {
    dev_file.write_all_at(head, 0)?;
    let mut read_back = vec![0u8; head.len()];
    dev_file.read_exact_at(&mut read_back, 0)?;
    if read_back != head {
        return Err(ShiftError::Msg(format!(
            "read-back mismatch after writing {} metadata bytes at offset 0",
            head.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lvm::config;

    #[test]
    fn test_choose_lv_name() {
        assert_eq!(choose_lv_name(Some("root"), "sda1"), "root");
        assert_eq!(choose_lv_name(None, "sda1"), "sda1");
        assert_eq!(choose_lv_name(Some(""), "sda1"), "sda1");
        // A label with a slash cannot be an LV name.
        assert_eq!(choose_lv_name(Some("var/log"), "sda1"), "lv1");
        assert_eq!(choose_lv_name(Some("has space"), "dm-0"), "lv1");
    }

    #[test]
    fn test_format_metadata_parses_back() {
        let text = format_metadata(
            "vg.sda1",
            "11111111-1111-1111-1111-111111111111",
            "22222222-2222-2222-2222-222222222222",
            "root",
            "33333333-3333-3333-3333-333333333333",
            8192,
            24,
        );
        let tree = config::parse(&text).unwrap();
        assert_eq!(tree.str("contents").unwrap(), "Text Format Volume Group");
        assert_eq!(tree.int("version").unwrap(), 1);

        let vg = tree.section("vg.sda1").unwrap();
        assert_eq!(vg.int("extent_size").unwrap(), 8192);
        assert_eq!(vg.int("seqno").unwrap(), 0);

        let pv = vg.section("physical_volumes").unwrap().section("pv0").unwrap();
        assert_eq!(pv.int("pe_start").unwrap(), 8192);
        assert_eq!(pv.int("pe_count").unwrap(), 24);
        assert_eq!(pv.int("ba_start").unwrap(), 2048);
        assert_eq!(pv.int("ba_size").unwrap(), 2048);

        let lv = vg.section("logical_volumes").unwrap().section("root").unwrap();
        assert_eq!(lv.int("segment_count").unwrap(), 2);
        let first = lv.section("segment1").unwrap();
        assert_eq!(first.int("start_extent").unwrap(), 0);
        assert_eq!(first.int("extent_count").unwrap(), 1);
        let second = lv.section("segment2").unwrap();
        assert_eq!(second.int("start_extent").unwrap(), 1);
        assert_eq!(second.int("extent_count").unwrap(), 23);
    }

    #[test]
    fn test_metadata_segments_cover_all_extents() {
        let text = format_metadata("vg0", "u1", "u2", "lv", "u3", 8192, 24);
        let tree = config::parse(&text).unwrap();
        let lv = tree
            .section("vg0")
            .unwrap()
            .section("logical_volumes")
            .unwrap()
            .section("lv")
            .unwrap();
        let mut mapped = 0;
        for index in 1..=lv.int("segment_count").unwrap() {
            mapped += lv
                .section(&format!("segment{}", index))
                .unwrap()
                .int("extent_count")
                .unwrap();
        }
        assert_eq!(mapped, 24);
    }

    #[test]
    fn test_lvm_config_filter_pins_synth_path() {
        let config = lvm_config_for(Path::new("/dev/mapper/synthetic-x"));
        assert!(config.contains("a|^/dev/mapper/synthetic-x$|"));
        assert!(config.contains("r|.*|"));
    }
}
