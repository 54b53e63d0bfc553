// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Hand-off to a maintenance boot for conversions that cannot run on a
// mounted system device. The arguments travel to the maintenance
// environment as URL-encoded JSON in the BLOCKS_ARGS variable of the
// kernel command line; the device is addressed by filesystem UUID, since
// device names do not survive the reboot.

use std::path::Path;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{json, Value};

use crate::{
    engine::{bcache_convert, cmd, BlockDevice},
    shift::{ShiftError, ShiftResult},
};

/// Packages the maintenance initramfs needs for any conversion this
/// tool performs.
const MAINTBOOT_PKGS: &str = "blockshift util-linux dash mount base-files libc-bin \
     nilfs-tools reiserfsprogs xfsprogs e2fsprogs btrfs-progs lvm2 \
     cryptsetup-bin bcache-tools";

const MAINTBOOT_INITSCRIPT: &str = "/usr/share/blockshift/maintboot.init";

pub const BLOCKS_ARGS_VAR: &str = "BLOCKS_ARGS";

#[derive(Debug)]
pub struct MaintbootArgs {
    pub command: String,
    pub fsuuid: String,
    pub join: Option<String>,
    pub debug: bool,
}

/// Re-invoke the given command from a maintenance boot, addressing the
/// device by its filesystem UUID.
pub fn call_maintboot(
    device: &mut BlockDevice,
    command: &str,
    join: Option<&str>,
    debug: bool,
) -> ShiftResult<()> {
    let fsuuid = cmd::blkid_value(device.devpath(), "UUID")?.ok_or_else(|| {
        ShiftError::Msg(format!(
            "device {} doesn't have a filesystem UUID to find it by after reboot",
            device.devpath().display()
        ))
    })?;

    let args = json!({
        "command": command,
        "device": fsuuid,
        "join": join,
        "debug": debug,
    });
    let encoded =
        utf8_percent_encode(&serde_json::to_string(&args)?, NON_ALPHANUMERIC).to_string();
    cmd::maintboot_invoke(
        MAINTBOOT_PKGS,
        Path::new(MAINTBOOT_INITSCRIPT),
        &format!("{}={}", BLOCKS_ARGS_VAR, encoded),
    )
}

/// Decode BLOCKS_ARGS from the environment of a maintenance boot.
pub fn parse_maintboot_args(raw: &str) -> ShiftResult<MaintbootArgs> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|err| ShiftError::Msg(format!("undecodable {}: {}", BLOCKS_ARGS_VAR, err)))?;
    let parsed: Value = serde_json::from_str(&decoded)?;
    let field = |key: &str| -> ShiftResult<String> {
        parsed
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ShiftError::Msg(format!("{} is missing '{}'", BLOCKS_ARGS_VAR, key)))
    };
    Ok(MaintbootArgs {
        command: field("command")?,
        fsuuid: field("device")?,
        join: parsed
            .get("join")
            .and_then(Value::as_str)
            .map(str::to_owned),
        debug: parsed
            .get("debug")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// The maintenance-boot side: settle the device zoo, activate LVM, find
/// the device by UUID and run the requested conversion.
pub fn cmd_maintboot_impl(raw_args: &str) -> ShiftResult<()> {
    let args = parse_maintboot_args(raw_args)?;

    cmd::udev_settle()?;
    cmd::vgchange_activate_all()?;
    cmd::udev_settle()?;

    let mut device = BlockDevice::by_uuid(&args.fsuuid)?;
    match args.command.as_str() {
        "to-bcache" => bcache_convert::cmd_to_bcache(&mut device, args.join.as_deref()),
        other => Err(ShiftError::Msg(format!(
            "unknown maintboot command '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_round_trip() {
        let args = json!({
            "command": "to-bcache",
            "device": "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9",
            "join": "cset-uuid",
            "debug": true,
        });
        let encoded =
            utf8_percent_encode(&serde_json::to_string(&args).unwrap(), NON_ALPHANUMERIC)
                .to_string();
        // Everything outside [0-9A-Za-z] is escaped, as kernel command
        // lines demand.
        assert!(!encoded.contains('"'));
        assert!(!encoded.contains(' '));

        let parsed = parse_maintboot_args(&encoded).unwrap();
        assert_eq!(parsed.command, "to-bcache");
        assert_eq!(parsed.fsuuid, "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9");
        assert_eq!(parsed.join.as_deref(), Some("cset-uuid"));
        assert!(parsed.debug);
    }

    #[test]
    fn test_args_missing_fields() {
        let encoded =
            utf8_percent_encode("{\"command\": \"to-bcache\"}", NON_ALPHANUMERIC).to_string();
        assert_matches!(parse_maintboot_args(&encoded), Err(ShiftError::Msg(_)));
    }

    #[test]
    fn test_args_join_null_is_absent() {
        let args = json!({
            "command": "to-bcache",
            "device": "u1",
            "join": null,
        });
        let encoded =
            utf8_percent_encode(&serde_json::to_string(&args).unwrap(), NON_ALPHANUMERIC)
                .to_string();
        let parsed = parse_maintboot_args(&encoded).unwrap();
        assert_eq!(parsed.join, None);
        assert!(!parsed.debug);
    }
}
