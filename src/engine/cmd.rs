// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Handles invoking external binaries.
// This module assumes that, for a given machine, there is only one place
// where a desired executable might be installed. The absolute path of
// each binary is identified once, lazily; the existence of the file is
// re-checked before every invocation so that an uninstall between calls
// produces an explicit error instead of a spawn failure.
//
// Every wrapper returns structured values parsed from stdout with strict
// expectations; stderr is carried in errors only and never parsed for
// control flow.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use devicemapper::Sectors;

use crate::shift::{ShiftError, ShiftResult};

/// Find the binary with the given name by looking in likely locations.
/// Return None if no binary was found.
fn find_binary(name: &str) -> Option<PathBuf> {
    ["/usr/sbin", "/sbin", "/usr/bin", "/bin"]
        .iter()
        .map(|pre| [pre, name].iter().collect::<PathBuf>())
        .find(|path| path.exists())
}

lazy_static! {
    static ref BLKID_BIN: Option<PathBuf> = find_binary("blkid");
    static ref LVM_BIN: Option<PathBuf> = find_binary("lvm");
    static ref CRYPTSETUP_BIN: Option<PathBuf> = find_binary("cryptsetup");
    static ref MAKE_BCACHE_BIN: Option<PathBuf> = find_binary("make-bcache");
    static ref BCACHE_SUPER_SHOW_BIN: Option<PathBuf> = find_binary("bcache-super-show");
    static ref PARTED_BIN: Option<PathBuf> = find_binary("parted");
    static ref UDEVADM_BIN: Option<PathBuf> = find_binary("udevadm");
    static ref E2FSCK_BIN: Option<PathBuf> = find_binary("e2fsck");
    static ref RESIZE2FS_BIN: Option<PathBuf> = find_binary("resize2fs");
    static ref TUNE2FS_BIN: Option<PathBuf> = find_binary("tune2fs");
    static ref XFS_DB_BIN: Option<PathBuf> = find_binary("xfs_db");
    static ref XFS_GROWFS_BIN: Option<PathBuf> = find_binary("xfs_growfs");
    static ref BTRFS_BIN: Option<PathBuf> = find_binary("btrfs");
    static ref NILFS_TUNE_BIN: Option<PathBuf> = find_binary("nilfs-tune");
    static ref NILFS_RESIZE_BIN: Option<PathBuf> = find_binary("nilfs-resize");
    static ref REISERFSTUNE_BIN: Option<PathBuf> = find_binary("reiserfstune");
    static ref RESIZE_REISERFS_BIN: Option<PathBuf> = find_binary("resize_reiserfs");
    static ref MAINTBOOT_BIN: Option<PathBuf> = find_binary("maintboot");
}

/// Resolve a lazily located binary, naming the package to install when it
/// is absent.
fn binary(
    bin: &'static Option<PathBuf>,
    cmd: &'static str,
    pkg: &'static str,
) -> ShiftResult<&'static Path> {
    match bin.as_deref() {
        Some(path) if path.exists() => Ok(path),
        _ => Err(ShiftError::MissingRequirement {
            cmd: cmd.to_owned(),
            pkg: pkg.to_owned(),
        }),
    }
}

/// Fail early with the package name when lvm is not installed.
pub fn require_lvm() -> ShiftResult<()> {
    binary(&LVM_BIN, "lvm", "lvm2").map(|_| ())
}

/// Fail early with the package name when bcache-tools is not installed.
pub fn require_bcache_tools() -> ShiftResult<()> {
    binary(&MAKE_BCACHE_BIN, "make-bcache", "bcache-tools")?;
    binary(&BCACHE_SUPER_SHOW_BIN, "bcache-super-show", "bcache-tools").map(|_| ())
}

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

fn argv_of(cmd: &Command) -> Vec<OsString> {
    let mut argv = vec![cmd.get_program().to_owned()];
    argv.extend(cmd.get_args().map(|a| a.to_owned()));
    argv
}

/// Run a command to completion with stdin closed, capturing its output.
/// Exit codes in ok_codes are treated as success; anything else maps to
/// ShiftError::Command with the captured stderr.
fn execute_with_codes(cmd: &mut Command, ok_codes: &[i32]) -> ShiftResult<(i32, CommandOutput)> {
    debug!("running {:?}", argv_of(cmd));
    let result = cmd.stdin(Stdio::null()).output()?;
    let stdout = String::from_utf8_lossy(&result.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&result.stderr).into_owned();
    match result.status.code() {
        Some(code) if ok_codes.contains(&code) => Ok((code, CommandOutput { stdout, stderr })),
        code => Err(ShiftError::Command {
            argv: argv_of(cmd),
            status: code,
            stderr,
        }),
    }
}

/// Run a command to completion, capturing stdout and stderr; any non-zero
/// exit is an error.
pub fn execute_cmd(cmd: &mut Command) -> ShiftResult<CommandOutput> {
    execute_with_codes(cmd, &[0]).map(|(_, output)| output)
}

/// Run a command with the terminal attached so it can prompt the user,
/// e.g. cryptsetup asking for a passphrase.
fn execute_interactive(cmd: &mut Command) -> ShiftResult<()> {
    debug!("running (interactive) {:?}", argv_of(cmd));
    let status = cmd.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(ShiftError::Command {
            argv: argv_of(cmd),
            status: status.code(),
            stderr: String::new(),
        })
    }
}

/// Parse "Key: value" lines, keeping declaration order.
fn parse_colon_pairs(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        })
        .collect()
}

// blkid

/// Probe the superblock tag at the given offset; None when blkid finds
/// nothing it recognizes (exit code 2).
pub fn blkid_probe_value(
    devpath: &Path,
    tag: &str,
    offset: Option<u64>,
) -> ShiftResult<Option<String>> {
    let blkid = binary(&BLKID_BIN, "blkid", "util-linux")?;
    let mut cmd = Command::new(blkid);
    cmd.arg("-p").arg("-o").arg("value").arg("-s").arg(tag);
    if let Some(offset) = offset {
        cmd.arg("-O").arg(offset.to_string());
    }
    cmd.arg("--").arg(devpath);
    let (code, output) = execute_with_codes(&mut cmd, &[0, 2])?;
    if code == 2 {
        return Ok(None);
    }
    let value = output.stdout.trim();
    Ok(if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    })
}

/// Read a cached token (LABEL, UUID) without low-level probing; None when
/// the device carries no such token.
pub fn blkid_value(devpath: &Path, tag: &str) -> ShiftResult<Option<String>> {
    let blkid = binary(&BLKID_BIN, "blkid", "util-linux")?;
    let mut cmd = Command::new(blkid);
    cmd.arg("-o")
        .arg("value")
        .arg("-s")
        .arg(tag)
        .arg("--")
        .arg(devpath);
    let (code, output) = execute_with_codes(&mut cmd, &[0, 2])?;
    if code == 2 {
        return Ok(None);
    }
    let value = output.stdout.trim();
    Ok(if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    })
}

/// Resolve a filesystem UUID to a device path.
pub fn blkid_resolve_uuid(fsuuid: &str) -> ShiftResult<PathBuf> {
    let blkid = binary(&BLKID_BIN, "blkid", "util-linux")?;
    let mut cmd = Command::new(blkid);
    cmd.arg("-U").arg(fsuuid);
    let output = execute_cmd(&mut cmd)?;
    let path = output.stdout.trim();
    if path.is_empty() {
        Err(ShiftError::Msg(format!(
            "no device found for filesystem uuid {}",
            fsuuid
        )))
    } else {
        Ok(PathBuf::from(path))
    }
}

// lvm

const LVM_REPORT_ARGS: [&str; 5] = [
    "--noheadings",
    "--units=b",
    "--nosuffix",
    "--separator=|",
    "-o",
];

/// Run one lvm report (lvs or vgs) for a single target and return the
/// requested fields from its first row.
fn lvm_report_single(report: &str, target: &Path, fields: &[&str]) -> ShiftResult<Vec<String>> {
    let lvm = binary(&LVM_BIN, "lvm", "lvm2")?;
    let mut cmd = Command::new(lvm);
    cmd.arg(report)
        .args(LVM_REPORT_ARGS)
        .arg(fields.join(","))
        .arg("--")
        .arg(target);
    let output = execute_cmd(&mut cmd)?;
    let line = output
        .stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| {
            ShiftError::Msg(format!(
                "lvm {} returned no rows for {}",
                report,
                target.display()
            ))
        })?;
    let values = line
        .split('|')
        .map(|v| v.trim().to_owned())
        .collect::<Vec<_>>();
    if values.len() != fields.len() {
        return Err(ShiftError::Msg(format!(
            "lvm {} returned {} fields, expected {}",
            report,
            values.len(),
            fields.len()
        )));
    }
    Ok(values)
}

/// The extent size of the VG holding the given LV, in bytes.
pub fn lvs_extent_size(devpath: &Path) -> ShiftResult<u64> {
    let fields = lvm_report_single("lvs", devpath, &["vg_extent_size"])?;
    Ok(fields[0].parse()?)
}

#[derive(Debug)]
pub struct LvIdentity {
    pub vg_name: String,
    pub vg_uuid: String,
    pub lv_name: String,
    pub lv_uuid: String,
    pub active: bool,
}

/// Identify the VG and LV behind an LV device node.
pub fn lvs_identity(devpath: &Path) -> ShiftResult<LvIdentity> {
    let fields = lvm_report_single(
        "lvs",
        devpath,
        &["vg_name", "vg_uuid", "lv_name", "lv_uuid", "lv_attr"],
    )?;
    let attr = &fields[4];
    Ok(LvIdentity {
        vg_name: fields[0].clone(),
        vg_uuid: fields[1].clone(),
        lv_name: fields[2].clone(),
        lv_uuid: fields[3].clone(),
        active: attr.as_bytes().get(4) == Some(&b'a'),
    })
}

#[derive(Debug)]
pub struct VgIdentity {
    pub name: String,
    pub uuid: String,
    pub extent_size: u64,
}

/// Identify a VG by name: its UUID and extent size in bytes.
pub fn vgs_identity(vgname: &str) -> ShiftResult<VgIdentity> {
    let fields = lvm_report_single(
        "vgs",
        Path::new(vgname),
        &["vg_name", "vg_uuid", "vg_extent_size"],
    )?;
    Ok(VgIdentity {
        name: fields[0].clone(),
        uuid: fields[1].clone(),
        extent_size: fields[2].parse()?,
    })
}

/// Back up the textual metadata of a VG to a file.
pub fn vgcfgbackup(vgname: &str, file: &Path) -> ShiftResult<()> {
    let lvm = binary(&LVM_BIN, "lvm", "lvm2")?;
    let mut cmd = Command::new(lvm);
    cmd.arg("vgcfgbackup")
        .arg("--file")
        .arg(file)
        .arg("--")
        .arg(vgname);
    execute_cmd(&mut cmd).map(|_| ())
}

/// Restore VG metadata from a file; lvm_config, when given, is passed as
/// --config (used to restrict devices.filter to a synthetic path).
pub fn vgcfgrestore(vgname: &str, file: &Path, lvm_config: Option<&str>) -> ShiftResult<()> {
    let lvm = binary(&LVM_BIN, "lvm", "lvm2")?;
    let mut cmd = Command::new(lvm);
    cmd.arg("vgcfgrestore");
    if let Some(config) = lvm_config {
        cmd.arg("--config").arg(config);
    }
    cmd.arg("--file").arg(file).arg("--").arg(vgname);
    execute_cmd(&mut cmd).map(|_| ())
}

/// pvcreate with a known UUID against a restore file, zeroing old labels.
pub fn pvcreate_restore(
    devpath: &Path,
    restorefile: &Path,
    pv_uuid: &str,
    lvm_config: &str,
) -> ShiftResult<()> {
    let lvm = binary(&LVM_BIN, "lvm", "lvm2")?;
    let mut cmd = Command::new(lvm);
    cmd.arg("pvcreate")
        .arg("--config")
        .arg(lvm_config)
        .arg("--restorefile")
        .arg(restorefile)
        .arg("--uuid")
        .arg(pv_uuid)
        .arg("--zero")
        .arg("y")
        .arg("--")
        .arg(devpath);
    execute_cmd(&mut cmd).map(|_| ())
}

/// Activate all LVs of a VG.
pub fn vgchange_activate(vgname: &str) -> ShiftResult<()> {
    let lvm = binary(&LVM_BIN, "lvm", "lvm2")?;
    let mut cmd = Command::new(lvm);
    cmd.arg("vgchange").arg("-ay").arg("--").arg(vgname);
    execute_cmd(&mut cmd).map(|_| ())
}

/// Activate every VG the system can see; used when coming up in a
/// maintenance boot.
pub fn vgchange_activate_all() -> ShiftResult<()> {
    let lvm = binary(&LVM_BIN, "lvm", "lvm2")?;
    let mut cmd = Command::new(lvm);
    cmd.arg("vgchange").arg("-ay");
    execute_cmd(&mut cmd).map(|_| ())
}

/// Merge the source VG into the destination VG.
pub fn vgmerge(destination: &str, source: &str) -> ShiftResult<()> {
    let lvm = binary(&LVM_BIN, "lvm", "lvm2")?;
    let mut cmd = Command::new(lvm);
    cmd.arg("vgmerge").arg("--").arg(destination).arg(source);
    execute_cmd(&mut cmd).map(|_| ())
}

#[derive(Debug, Clone, Copy)]
pub enum LvChange {
    Activate,
    Deactivate,
    Refresh,
}

/// lvchange on vg/lv.
pub fn lvchange(vg_lv: &str, change: LvChange) -> ShiftResult<()> {
    let lvm = binary(&LVM_BIN, "lvm", "lvm2")?;
    let mut cmd = Command::new(lvm);
    cmd.arg("lvchange");
    match change {
        LvChange::Activate => cmd.arg("-ay"),
        LvChange::Deactivate => cmd.arg("-an"),
        LvChange::Refresh => cmd.arg("--refresh"),
    };
    cmd.arg("--").arg(vg_lv);
    execute_cmd(&mut cmd).map(|_| ())
}

/// Resize an LV to an exact byte size. Shrinking must be explicit, it is
/// the dangerous direction.
pub fn lvresize(devpath: &Path, newsize: u64, shrink: bool) -> ShiftResult<()> {
    let lvm = binary(&LVM_BIN, "lvm", "lvm2")?;
    let mut cmd = Command::new(lvm);
    if shrink {
        cmd.arg("lvreduce").arg("-f");
    } else {
        cmd.arg("lvextend");
    }
    cmd.arg(format!("--size={}b", newsize)).arg("--").arg(devpath);
    execute_cmd(&mut cmd).map(|_| ())
}

// cryptsetup

/// The payload offset of a LUKS volume in sectors, from luksDump.
pub fn cryptsetup_payload_offset(devpath: &Path) -> ShiftResult<Sectors> {
    let cryptsetup = binary(&CRYPTSETUP_BIN, "cryptsetup", "cryptsetup-bin")?;
    let mut cmd = Command::new(cryptsetup);
    cmd.arg("luksDump").arg("--").arg(devpath);
    let output = execute_cmd(&mut cmd)?;
    for (key, value) in parse_colon_pairs(&output.stdout) {
        if key == "Payload offset" {
            return Ok(Sectors(value.parse()?));
        }
    }
    Err(ShiftError::Msg(format!(
        "no payload offset in luksDump output for {}",
        devpath.display()
    )))
}

/// Open a LUKS volume under the given dm name. Interactive: cryptsetup
/// may prompt for a passphrase.
pub fn cryptsetup_open(devpath: &Path, dmname: &str) -> ShiftResult<()> {
    let cryptsetup = binary(&CRYPTSETUP_BIN, "cryptsetup", "cryptsetup-bin")?;
    let mut cmd = Command::new(cryptsetup);
    cmd.arg("luksOpen").arg("--").arg(devpath).arg(dmname);
    execute_interactive(&mut cmd)
}

/// Tear down a dm-crypt mapping.
pub fn cryptsetup_remove(mapped: &Path) -> ShiftResult<()> {
    let cryptsetup = binary(&CRYPTSETUP_BIN, "cryptsetup", "cryptsetup-bin")?;
    let mut cmd = Command::new(cryptsetup);
    cmd.arg("remove").arg("--").arg(mapped);
    execute_cmd(&mut cmd).map(|_| ())
}

/// Resize an open dm-crypt mapping to the given cleartext sector count.
pub fn cryptsetup_resize(mapped: &Path, sectors: Sectors) -> ShiftResult<()> {
    let cryptsetup = binary(&CRYPTSETUP_BIN, "cryptsetup", "cryptsetup-bin")?;
    let mut cmd = Command::new(cryptsetup);
    cmd.arg("resize")
        .arg(format!("--size={}", *sectors))
        .arg("--")
        .arg(mapped);
    execute_cmd(&mut cmd).map(|_| ())
}

// bcache-tools

#[derive(Debug)]
pub struct BcacheSuperShow {
    pub version: u64,
    pub first_sector: Option<u64>,
}

/// Dump a bcache superblock: its version and, for backing devices, the
/// first data sector.
pub fn bcache_super_show(devpath: &Path) -> ShiftResult<BcacheSuperShow> {
    let super_show = binary(&BCACHE_SUPER_SHOW_BIN, "bcache-super-show", "bcache-tools")?;
    let mut cmd = Command::new(super_show);
    cmd.arg("--").arg(devpath);
    let output = execute_cmd(&mut cmd)?;
    let mut version = None;
    let mut first_sector = None;
    for line in output.stdout.lines() {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("sb.version") => {
                version = words.next().and_then(|w| w.parse().ok());
            }
            Some("dev.data.first_sector") => {
                first_sector = words.next().and_then(|w| w.parse().ok());
            }
            _ => (),
        }
    }
    match version {
        Some(version) => Ok(BcacheSuperShow {
            version,
            first_sector,
        }),
        None => Err(ShiftError::Msg(format!(
            "no sb.version in bcache-super-show output for {}",
            devpath.display()
        ))),
    }
}

/// Format a backing-device superblock with the payload starting at
/// data_offset sectors; optionally pre-attached to a cache set.
pub fn make_bcache_backing(
    devpath: &Path,
    data_offset: Sectors,
    cset_uuid: Option<&str>,
) -> ShiftResult<()> {
    let make_bcache = binary(&MAKE_BCACHE_BIN, "make-bcache", "bcache-tools")?;
    let mut cmd = Command::new(make_bcache);
    if let Some(cset) = cset_uuid {
        cmd.arg("--cset-uuid").arg(cset);
    }
    cmd.arg("--bdev")
        .arg("--data_offset")
        .arg(data_offset.to_string())
        .arg(devpath);
    execute_cmd(&mut cmd).map(|_| ())
}

// parted

/// Machine-readable parted output for a disk, with free space listed.
pub fn parted_print_free(disk: &Path) -> ShiftResult<String> {
    let parted = binary(&PARTED_BIN, "parted", "parted")?;
    let mut cmd = Command::new(parted);
    cmd.arg("--machine")
        .arg("--script")
        .arg("--")
        .arg(disk)
        .arg("unit")
        .arg("B")
        .arg("print")
        .arg("free");
    Ok(execute_cmd(&mut cmd)?.stdout)
}

/// Run one scripted parted editing command against a disk.
pub fn parted_script(disk: &Path, args: &[&str]) -> ShiftResult<()> {
    let parted = binary(&PARTED_BIN, "parted", "parted")?;
    let mut cmd = Command::new(parted);
    cmd.arg("--script").arg("--").arg(disk).args(args);
    execute_cmd(&mut cmd).map(|_| ())
}

// udev

/// Wait for udev event processing to quiesce; used where device-mapper
/// and LVM activation race with udev event delivery.
pub fn udev_settle() -> ShiftResult<()> {
    let udevadm = binary(&UDEVADM_BIN, "udevadm", "udev")?;
    let mut cmd = Command::new(udevadm);
    cmd.arg("settle").arg("--timeout=30");
    execute_cmd(&mut cmd).map(|_| ())
}

// filesystem tools

/// Force-check an ext filesystem. Exit code 1 (errors corrected) counts
/// as success; assume_yes adds -y for unattended repair.
pub fn e2fsck_force(devpath: &Path, assume_yes: bool) -> ShiftResult<()> {
    let e2fsck = binary(&E2FSCK_BIN, "e2fsck", "e2fsprogs")?;
    let mut cmd = Command::new(e2fsck);
    cmd.arg("-f");
    if assume_yes {
        cmd.arg("-y");
    }
    cmd.arg("--").arg(devpath);
    execute_with_codes(&mut cmd, &[0, 1]).map(|_| ())
}

/// Resize an ext filesystem to an explicit block count.
pub fn resize2fs(devpath: &Path, block_count: u64) -> ShiftResult<()> {
    let resize2fs = binary(&RESIZE2FS_BIN, "resize2fs", "e2fsprogs")?;
    let mut cmd = Command::new(resize2fs);
    cmd.arg("--").arg(devpath).arg(block_count.to_string());
    execute_cmd(&mut cmd).map(|_| ())
}

/// The tune2fs -l listing as ordered key/value pairs.
pub fn tune2fs_list(devpath: &Path) -> ShiftResult<Vec<(String, String)>> {
    let tune2fs = binary(&TUNE2FS_BIN, "tune2fs", "e2fsprogs")?;
    let mut cmd = Command::new(tune2fs);
    cmd.arg("-l").arg("--").arg(devpath);
    let output = execute_cmd(&mut cmd)?;
    Ok(parse_colon_pairs(&output.stdout))
}

/// XFS geometry from xfs_db: (block_count, block_size).
pub fn xfs_db_geometry(devpath: &Path) -> ShiftResult<(u64, u64)> {
    let xfs_db = binary(&XFS_DB_BIN, "xfs_db", "xfsprogs")?;
    let mut cmd = Command::new(xfs_db);
    cmd.arg("-c")
        .arg("sb 0")
        .arg("-c")
        .arg("p dblocks blocksize")
        .arg("--")
        .arg(devpath);
    let output = execute_cmd(&mut cmd)?;
    let mut dblocks = None;
    let mut blocksize = None;
    for line in output.stdout.lines() {
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "dblocks" => dblocks = Some(value.trim().parse()?),
                "blocksize" => blocksize = Some(value.trim().parse()?),
                _ => (),
            }
        }
    }
    match (dblocks, blocksize) {
        (Some(dblocks), Some(blocksize)) => Ok((dblocks, blocksize)),
        _ => Err(ShiftError::Msg(format!(
            "xfs_db geometry incomplete for {}",
            devpath.display()
        ))),
    }
}

/// Grow a mounted XFS filesystem to an explicit data block count.
pub fn xfs_growfs(mpoint: &Path, block_count: u64) -> ShiftResult<()> {
    let xfs_growfs = binary(&XFS_GROWFS_BIN, "xfs_growfs", "xfsprogs")?;
    let mut cmd = Command::new(xfs_growfs);
    cmd.arg("-D").arg(block_count.to_string()).arg("--").arg(mpoint);
    execute_cmd(&mut cmd).map(|_| ())
}

#[derive(Debug)]
pub struct BtrfsSuper {
    pub sectorsize: u64,
    pub total_bytes: u64,
    pub devid: u64,
}

/// Superblock fields of a btrfs device.
pub fn btrfs_dump_super(devpath: &Path) -> ShiftResult<BtrfsSuper> {
    let btrfs = binary(&BTRFS_BIN, "btrfs", "btrfs-progs")?;
    let mut cmd = Command::new(btrfs);
    cmd.arg("inspect-internal")
        .arg("dump-super")
        .arg("--")
        .arg(devpath);
    let output = execute_cmd(&mut cmd)?;
    let mut sectorsize = None;
    let mut total_bytes = None;
    let mut devid = None;
    for line in output.stdout.lines() {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("sectorsize") => sectorsize = words.next().and_then(|w| w.parse().ok()),
            Some("dev_item.total_bytes") => {
                total_bytes = words.next().and_then(|w| w.parse().ok())
            }
            Some("dev_item.devid") => devid = words.next().and_then(|w| w.parse().ok()),
            _ => (),
        }
    }
    match (sectorsize, total_bytes, devid) {
        (Some(sectorsize), Some(total_bytes), Some(devid)) => Ok(BtrfsSuper {
            sectorsize,
            total_bytes,
            devid,
        }),
        _ => Err(ShiftError::Msg(format!(
            "btrfs superblock dump incomplete for {}",
            devpath.display()
        ))),
    }
}

/// Resize one device of a mounted btrfs filesystem, addressed by devid.
pub fn btrfs_resize(mpoint: &Path, devid: u64, size: u64) -> ShiftResult<()> {
    let btrfs = binary(&BTRFS_BIN, "btrfs", "btrfs-progs")?;
    let mut cmd = Command::new(btrfs);
    cmd.arg("filesystem")
        .arg("resize")
        .arg(format!("{}:{}", devid, size))
        .arg(mpoint);
    execute_cmd(&mut cmd).map(|_| ())
}

/// NilFS2 geometry from nilfs-tune: (block_size, device_size_bytes).
pub fn nilfs_tune_geometry(devpath: &Path) -> ShiftResult<(u64, u64)> {
    let nilfs_tune = binary(&NILFS_TUNE_BIN, "nilfs-tune", "nilfs-tools")?;
    let mut cmd = Command::new(nilfs_tune);
    cmd.arg("-l").arg("--").arg(devpath);
    let output = execute_cmd(&mut cmd)?;
    let mut block_size = None;
    let mut device_size = None;
    for (key, value) in parse_colon_pairs(&output.stdout) {
        match key.as_str() {
            "Block size" => block_size = Some(value.parse()?),
            "Device size" => device_size = Some(value.parse()?),
            _ => (),
        }
    }
    match (block_size, device_size) {
        (Some(block_size), Some(device_size)) => Ok((block_size, device_size)),
        _ => Err(ShiftError::Msg(format!(
            "nilfs-tune geometry incomplete for {}",
            devpath.display()
        ))),
    }
}

/// Resize a mounted NilFS2 filesystem to an explicit byte size.
pub fn nilfs_resize(devpath: &Path, size: u64) -> ShiftResult<()> {
    let nilfs_resize = binary(&NILFS_RESIZE_BIN, "nilfs-resize", "nilfs-tools")?;
    let mut cmd = Command::new(nilfs_resize);
    cmd.arg("--yes").arg("--").arg(devpath).arg(size.to_string());
    execute_cmd(&mut cmd).map(|_| ())
}

/// ReiserFS geometry from reiserfstune: (block_size, block_count).
pub fn reiserfstune_geometry(devpath: &Path) -> ShiftResult<(u64, u64)> {
    let reiserfstune = binary(&REISERFSTUNE_BIN, "reiserfstune", "reiserfsprogs")?;
    let mut cmd = Command::new(reiserfstune);
    cmd.arg("--").arg(devpath);
    let output = execute_cmd(&mut cmd)?;
    let mut block_size = None;
    let mut block_count = None;
    for (key, value) in parse_colon_pairs(&output.stdout) {
        match key.as_str() {
            "Blocksize" => block_size = Some(value.parse()?),
            "Count of blocks on the device" => block_count = Some(value.parse()?),
            _ => (),
        }
    }
    match (block_size, block_count) {
        (Some(block_size), Some(block_count)) => Ok((block_size, block_count)),
        _ => Err(ShiftError::Msg(format!(
            "reiserfstune geometry incomplete for {}",
            devpath.display()
        ))),
    }
}

/// Resize a ReiserFS filesystem to an explicit byte size.
pub fn resize_reiserfs(devpath: &Path, size: u64) -> ShiftResult<()> {
    let resize_reiserfs = binary(&RESIZE_REISERFS_BIN, "resize_reiserfs", "reiserfsprogs")?;
    let mut cmd = Command::new(resize_reiserfs);
    cmd.arg("-q")
        .arg("-s")
        .arg(size.to_string())
        .arg("--")
        .arg(devpath);
    execute_cmd(&mut cmd).map(|_| ())
}

// maintboot

/// Hand the running conversion over to a maintenance boot; args travels
/// in the kernel command line as an environment assignment.
pub fn maintboot_invoke(pkgs: &str, initscript: &Path, env_assignment: &str) -> ShiftResult<()> {
    let maintboot = binary(&MAINTBOOT_BIN, "maintboot", "maintboot")?;
    let mut cmd = Command::new(maintboot);
    cmd.arg("--pkgs")
        .arg(pkgs)
        .arg("--initscript")
        .arg(initscript)
        .arg("--append")
        .arg(env_assignment);
    execute_cmd(&mut cmd).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_colon_pairs() {
        let pairs = parse_colon_pairs("Block count:  25600\nFilesystem state:   clean\n");
        assert_eq!(
            pairs,
            vec![
                ("Block count".to_owned(), "25600".to_owned()),
                ("Filesystem state".to_owned(), "clean".to_owned()),
            ]
        );
    }

    #[test]
    fn test_parse_colon_pairs_keeps_later_colons() {
        let pairs = parse_colon_pairs("Last mount time:    Tue Apr  4 12:00:00 2023\n");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "Last mount time");
        assert_eq!(pairs[0].1, "Tue Apr  4 12:00:00 2023");
    }
}
