// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Small helpers shared across the engine.

use devicemapper::{Sectors, SECTOR_SIZE};

use crate::shift::{ShiftError, ShiftResult};

/// Default physical extent size; 4 MiB keeps converted volume groups
/// mergeable with stock LVM ones.
pub const LVM_PE_SIZE: u64 = 4 * 1024 * 1024;

/// Characters accepted in VG and LV names without quoting concerns.
const ASCII_ALNUM_WHITELIST: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789.";

/// True if every character of name is in the alphanumeric+dot whitelist.
pub fn name_is_whitelisted(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| ASCII_ALNUM_WHITELIST.contains(c))
}

/// Convert a byte count to sectors; the count must be sector-aligned.
pub fn bytes_to_sectors(bytes: u64) -> ShiftResult<Sectors> {
    if bytes % SECTOR_SIZE as u64 != 0 {
        return Err(ShiftError::Msg(format!(
            "byte count {} is not a multiple of the sector size",
            bytes
        )));
    }
    Ok(Sectors(bytes / SECTOR_SIZE as u64))
}

/// Round size down to a multiple of align.
pub fn align_down(size: u64, align: u64) -> u64 {
    (size / align) * align
}

/// Round size up to a multiple of align.
pub fn align_up(size: u64, align: u64) -> u64 {
    ((size + align - 1) / align) * align
}

/// Parse a size argument: a decimal integer with an optional one-letter
/// 1024-based suffix (b, k, m, g, t, p, e).
pub fn parse_size_arg(arg: &str) -> ShiftResult<u64> {
    let arg = arg.to_ascii_lowercase();
    let (digits, suffix) = match arg.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => arg.split_at(pos),
        None => (arg.as_str(), ""),
    };
    if digits.is_empty() {
        return Err(ShiftError::Msg(format!(
            "size must be a decimal integer with an optional bkmgtpe suffix, got '{}'",
            arg
        )));
    }
    let val: u64 = digits.parse()?;
    let multiplier = match suffix {
        "" | "b" => 1u64,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        "p" => 1 << 50,
        "e" => 1 << 60,
        _ => {
            return Err(ShiftError::Msg(format!(
                "unknown size suffix '{}'",
                suffix
            )))
        }
    };
    val.checked_mul(multiplier)
        .ok_or_else(|| ShiftError::Msg(format!("size '{}' overflows", arg)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_down(5000, 512), 4608);
        assert_eq!(align_up(5000, 512), 5120);
        assert_eq!(align_down(4096, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
    }

    #[test]
    fn test_whitelist() {
        assert!(name_is_whitelisted("vg.sda1"));
        assert!(name_is_whitelisted("lv1"));
        assert!(!name_is_whitelisted("has/slash"));
        assert!(!name_is_whitelisted("has space"));
        assert!(!name_is_whitelisted(""));
    }

    #[test]
    fn test_bytes_to_sectors() {
        assert_eq!(bytes_to_sectors(8192).unwrap(), Sectors(16));
        assert_matches!(bytes_to_sectors(8191), Err(ShiftError::Msg(_)));
    }

    #[test]
    fn test_parse_size_arg() {
        assert_eq!(parse_size_arg("512").unwrap(), 512);
        assert_eq!(parse_size_arg("512b").unwrap(), 512);
        assert_eq!(parse_size_arg("4k").unwrap(), 4096);
        assert_eq!(parse_size_arg("100m").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_size_arg("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size_arg("1t").unwrap(), 1 << 40);
        assert_matches!(parse_size_arg("12q"), Err(_));
        assert_matches!(parse_size_arg("m"), Err(_));
        assert_matches!(parse_size_arg("12 k"), Err(_));
    }

    proptest! {
        #[test]
        fn parse_size_suffixes_multiply(n in 0u64..1 << 30) {
            let plain = parse_size_arg(&format!("{}", n)).unwrap();
            let kilo = parse_size_arg(&format!("{}k", n)).unwrap();
            prop_assert_eq!(kilo, plain * 1024);
        }
    }
}
