// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{env, path::Path, process::exit};

use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;

use blockshift::{
    engine::{
        bcache_convert::cmd_to_bcache,
        lvm::convert::{cmd_to_lvm, ToLvmOptions},
        maintboot::{call_maintboot, cmd_maintboot_impl, BLOCKS_ARGS_VAR},
        resize::{cmd_rotate, cmd_resize},
        shared::parse_size_arg,
        BlockDevice,
    },
    shift::{ShiftError, VERSION},
};

fn parse_args() -> Command<'static> {
    Command::new("blockshift")
        .version(VERSION)
        .about("Convert block devices to LVM or bcache in place, and resize layered stacks")
        .arg(
            Arg::new("debug")
                .long("--debug")
                .takes_value(false)
                .global(true)
                .help("Print additional output for debugging"),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommands(vec![
            Command::new("to-lvm")
                .visible_alias("lvmify")
                .about("Convert a device to an LVM physical volume, preserving its contents")
                .arg(
                    Arg::new("vg_name")
                        .long("--vg-name")
                        .takes_value(true)
                        .conflicts_with("join")
                        .help("Name for the new volume group"),
                )
                .arg(
                    Arg::new("join")
                        .long("--join")
                        .takes_value(true)
                        .help("Join an existing volume group"),
                )
                .arg(Arg::new("device").required(true)),
            Command::new("to-bcache")
                .about("Convert a device to a bcache backing device, preserving its contents")
                .arg(
                    Arg::new("join")
                        .long("--join")
                        .takes_value(true)
                        .help("Attach to an existing cache set (UUID)"),
                )
                .arg(
                    Arg::new("maintboot")
                        .long("--maintboot")
                        .takes_value(false)
                        .help("Perform the conversion from a maintenance boot"),
                )
                .arg(Arg::new("device").required(true)),
            Command::new("resize")
                .about("Resize a device stack, shrinking or growing every layer coherently")
                .arg(
                    Arg::new("resize_device")
                        .long("--resize-device")
                        .takes_value(false)
                        .help("Resize the partition or LV as well, not just the contents"),
                )
                .arg(Arg::new("device").required(true))
                .arg(
                    Arg::new("size")
                        .required(true)
                        .help("New size: a decimal integer with an optional bkmgtpe suffix"),
                ),
            Command::new("rotate")
                .about("Rotate LV contents so they start at the first extent")
                .arg(Arg::new("device").required(true)),
            Command::new("maintboot-impl").hide(true),
        ])
}

fn device_arg(matches: &ArgMatches) -> Result<BlockDevice, i32> {
    let devpath = matches.value_of("device").expect("device is required");
    if !Path::new(devpath).exists() {
        eprintln!("Device {} does not exist", devpath);
        return Err(1);
    }
    Ok(BlockDevice::new(devpath))
}

/// Returns the process exit code: 0 on success, 1 for user errors caught
/// up front. Internal failures are returned as errors and exit 2.
fn run(matches: &ArgMatches) -> Result<i32, ShiftError> {
    match matches.subcommand() {
        Some(("to-lvm", sub)) => {
            let mut device = match device_arg(sub) {
                Ok(device) => device,
                Err(code) => return Ok(code),
            };
            if device.superblock_type()?.as_deref() == Some("LVM2_member") {
                eprintln!(
                    "Device {} already is an LVM physical volume",
                    device.devpath().display()
                );
                return Ok(1);
            }
            let options = ToLvmOptions {
                vgname: sub.value_of("vg_name").map(str::to_owned),
                join: sub.value_of("join").map(str::to_owned),
            };
            let report = cmd_to_lvm(&mut device, &options)?;
            println!("Volume group name: {}", report.vgname);
            println!("Logical volume name: {}", report.lvname);
            println!(
                "Filesystem uuid: {}",
                report.fsuuid.as_deref().unwrap_or("unknown")
            );
            Ok(0)
        }
        Some(("to-bcache", sub)) => {
            let mut device = match device_arg(sub) {
                Ok(device) => device,
                Err(code) => return Ok(code),
            };
            if device.has_bcache_superblock()? {
                eprintln!(
                    "Device {} already has a bcache super block",
                    device.devpath().display()
                );
                return Ok(1);
            }
            let join = sub.value_of("join");
            if sub.is_present("maintboot") {
                call_maintboot(
                    &mut device,
                    "to-bcache",
                    join,
                    matches.is_present("debug"),
                )?;
                return Ok(0);
            }
            match cmd_to_bcache(&mut device, join) {
                Ok(()) => Ok(0),
                Err(ShiftError::UnsupportedLayout(msg)) => {
                    eprintln!("{}", msg);
                    Ok(1)
                }
                Err(err) => Err(err),
            }
        }
        Some(("resize", sub)) => {
            let mut device = match device_arg(sub) {
                Ok(device) => device,
                Err(code) => return Ok(code),
            };
            let newsize = match parse_size_arg(sub.value_of("size").expect("size is required")) {
                Ok(newsize) => newsize,
                Err(err) => {
                    eprintln!("{}", err);
                    return Ok(1);
                }
            };
            cmd_resize(&mut device, newsize, sub.is_present("resize_device"))?;
            Ok(0)
        }
        Some(("rotate", sub)) => {
            let mut device = match device_arg(sub) {
                Ok(device) => device,
                Err(code) => return Ok(code),
            };
            match cmd_rotate(&mut device) {
                Ok(()) => Ok(0),
                Err(ShiftError::UnsupportedLayout(msg)) => {
                    eprintln!("{}", msg);
                    Ok(1)
                }
                Err(err) => Err(err),
            }
        }
        Some(("maintboot-impl", _)) => {
            let raw = match env::var(BLOCKS_ARGS_VAR) {
                Ok(raw) => raw,
                Err(_) => {
                    eprintln!("{} is not set", BLOCKS_ARGS_VAR);
                    return Ok(1);
                }
            };
            cmd_maintboot_impl(&raw)?;
            Ok(0)
        }
        _ => unreachable!("a subcommand is required"),
    }
}

fn main() {
    let matches = match parse_args().try_get_matches() {
        Ok(matches) => matches,
        Err(err)
            if matches!(
                err.kind(),
                clap::ErrorKind::DisplayHelp | clap::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            exit(0);
        }
        Err(err) => {
            let _ = err.print();
            exit(1);
        }
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Info);
    if matches.is_present("debug") {
        builder.filter(Some("blockshift"), LevelFilter::Debug);
    } else if let Ok(filters) = env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();

    match run(&matches) {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{}", err);
            exit(2);
        }
    }
}
