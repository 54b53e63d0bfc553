// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The LUKS1 container layer. High-level reads go through cryptsetup;
// the header shift for bcache conversion edits the superblock directly.

use std::{
    fs::File,
    io::Cursor,
    os::unix::fs::FileExt,
    path::PathBuf,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use regex::Regex;
use uuid::Uuid;

use crate::{
    engine::{cmd, shared::bytes_to_sectors, BlockDevice},
    shift::{ShiftError, ShiftResult},
};

const LUKS_MAGIC: &[u8; 6] = b"LUKS\xba\xbe";

/// Header layout constants from the LUKS1 on-disk format.
const PAYLOAD_OFFSET_FIELD: u64 = 104;
const KEY_SLOT_BASE: usize = 208;
const KEY_SLOT_STRIDE: usize = 48;
const KEY_SLOT_COUNT: usize = 8;
const HEADER_FIXED_END: u64 = 592;

lazy_static! {
    // Fairly strict; snooping an incorrect mapping would be bad.
    static ref DM_CRYPT_RE: Regex = Regex::new(
        r"^0 (\d+) crypt [a-z0-9:-]+ 0+ 0 (\d+):(\d+) (\d+)( [^\n]*)?\n$"
    )
    .expect("regex is valid");
}

/// Geometry parsed from a LUKS1 header by the low-level reader.
#[derive(Debug, Clone, Copy)]
struct LuksGeometry {
    payload_start: u64,
    sb_end: u64,
}

#[derive(Debug)]
pub struct Luks {
    device: BlockDevice,
    offset: Option<u64>,
    sb_end: Option<u64>,
    cleartext_path: Option<PathBuf>,
}

impl Luks {
    pub fn new(device: BlockDevice) -> Luks {
        Luks {
            device,
            offset: None,
            sb_end: None,
            cleartext_path: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_offset(device: BlockDevice, offset: u64) -> Luks {
        Luks {
            device,
            offset: Some(offset),
            sb_end: None,
            cleartext_path: None,
        }
    }

    pub fn device(&self) -> &BlockDevice {
        &self.device
    }

    /// Offset from the cyphertext start to the cleartext payload, in
    /// bytes. Valid after read_superblock.
    pub fn offset(&self) -> ShiftResult<u64> {
        self.offset.ok_or_else(|| {
            ShiftError::Msg(format!(
                "LUKS superblock of {} has not been read",
                self.device.devpath().display()
            ))
        })
    }

    /// End of the superblock area (header plus key material), in bytes.
    /// Valid after read_superblock_ll.
    pub fn sb_end(&self) -> ShiftResult<u64> {
        self.sb_end.ok_or_else(|| {
            ShiftError::Msg(format!(
                "LUKS key slots of {} have not been read",
                self.device.devpath().display()
            ))
        })
    }

    /// Read the payload offset through cryptsetup; idempotent.
    pub fn read_superblock(&mut self) -> ShiftResult<()> {
        let payload_sectors = cmd::cryptsetup_payload_offset(self.device.devpath())?;
        if *payload_sectors == 0 {
            return Err(ShiftError::UnsupportedSuperblock {
                device: self.device.devpath().to_owned(),
                details: "LUKS payload offset is zero".to_owned(),
            });
        }
        self.offset = Some(*payload_sectors * 512);
        Ok(())
    }

    /// Open the cyphertext under a throwaway dm name; cryptsetup prompts
    /// for the passphrase.
    fn activate(&self, dmname: &str) -> ShiftResult<()> {
        cmd::cryptsetup_open(self.device.devpath(), dmname)
    }

    /// Find an already-open dm-crypt mapping of this device: a holder
    /// whose crypt table points back at it with the superblock's payload
    /// offset.
    fn snoop_activated(&mut self) -> ShiftResult<Option<BlockDevice>> {
        if self.offset.is_none() {
            self.read_superblock()?;
        }
        let offset_sectors = bytes_to_sectors(self.offset()?)?;
        for holder in self.device.iter_holders()? {
            let table = holder.dm_table()?;
            if let Some(captures) = DM_CRYPT_RE.captures(&table) {
                let table_offset: u64 = captures[4].parse()?;
                if table_offset == *offset_sectors {
                    return Ok(Some(holder));
                }
            }
        }
        Ok(None)
    }

    /// The cleartext device, opening the LUKS volume if no mapping is
    /// already active.
    pub fn cleartext_device(&mut self) -> ShiftResult<BlockDevice> {
        if let Some(ref path) = self.cleartext_path {
            return Ok(BlockDevice::new(path.clone()));
        }
        let dev = match self.snoop_activated()? {
            Some(dev) => dev,
            None => {
                let dmname = format!("cleartext-{}", Uuid::new_v4());
                self.activate(&dmname)?;
                BlockDevice::new(PathBuf::from("/dev/mapper").join(dmname))
            }
        };
        self.cleartext_path = Some(dev.devpath().to_owned());
        Ok(dev)
    }

    /// Tear down every dm-crypt mapping of this device.
    pub fn deactivate(&mut self) -> ShiftResult<()> {
        while let Some(dev) = self.snoop_activated()? {
            cmd::cryptsetup_remove(dev.devpath())?;
        }
        self.cleartext_path = None;
        Ok(())
    }

    /// Low-level header read under an exclusive open: verify magic and
    /// version, cross-check the payload offset, and compute where the
    /// superblock area ends by walking the key slots.
    pub fn read_superblock_ll(&mut self, dev_file: &File) -> ShiftResult<()> {
        let mut header = [0u8; HEADER_FIXED_END as usize];
        dev_file.read_exact_at(&mut header, 0)?;
        let geometry = parse_header(&header, self.device.devpath())?;
        if let Some(offset) = self.offset {
            if geometry.payload_start != offset {
                return Err(ShiftError::Msg(format!(
                    "LUKS payload offset mismatch on {}: header says {}, cryptsetup said {}",
                    self.device.devpath().display(),
                    geometry.payload_start,
                    offset
                )));
            }
        } else {
            self.offset = Some(geometry.payload_start);
        }
        self.sb_end = Some(geometry.sb_end);
        Ok(())
    }

    /// Move the superblock forward by shift_by bytes, rewriting its
    /// payload-offset field so the cleartext stays where it is. The head
    /// of the device is zeroed. Not atomic: a crash mid-write leaves the
    /// header unreadable until restored by hand.
    pub fn shift_sb(&mut self, dev_file: &File, shift_by: u64) -> ShiftResult<()> {
        let offset = self.offset()?;
        let sb_end = self.sb_end()?;
        if shift_by == 0 || shift_by % 512 != 0 || offset % 512 != 0 {
            return Err(ShiftError::Msg(format!(
                "LUKS shift of {} bytes is not sector-aligned",
                shift_by
            )));
        }
        if sb_end + shift_by > offset {
            return Err(ShiftError::Msg(format!(
                "no room to shift the LUKS superblock: {} + {} > {}",
                sb_end, shift_by, offset
            )));
        }

        let mut sb = vec![0u8; sb_end as usize];
        dev_file.read_exact_at(&mut sb, 0)?;

        let new_offset_sectors = ((offset - shift_by) / 512) as u32;
        let mut field = Cursor::new(&mut sb[PAYLOAD_OFFSET_FIELD as usize..]);
        field.write_u32::<BigEndian>(new_offset_sectors)?;

        // One write covering the zeroed head and the shifted superblock.
        let mut combined = vec![0u8; shift_by as usize];
        combined.extend_from_slice(&sb);
        dev_file.write_all_at(&combined, 0)?;

        // The key-slot geometry no longer applies at offset 0; the
        // payload offset stays meaningful for the caller.
        self.sb_end = None;
        Ok(())
    }

    pub fn grow_nonrec(&mut self, upper_bound: u64) -> ShiftResult<u64> {
        self.reserve_end_area_nonrec(upper_bound)
    }

    /// Resize the cleartext mapping so the cyphertext ends at pos;
    /// cryptsetup works in inner (cleartext) sectors.
    pub fn reserve_end_area_nonrec(&mut self, pos: u64) -> ShiftResult<u64> {
        let inner_size = pos - self.offset()?;
        let sectors = bytes_to_sectors(inner_size)?;
        let cleartext = self.cleartext_device()?;
        cmd::cryptsetup_resize(cleartext.devpath(), sectors)?;

        if let Some(mut activated) = self.snoop_activated()? {
            activated.reset_size();
            if activated.size()? != inner_size {
                return Err(ShiftError::Msg(format!(
                    "LUKS resize of {} did not take: cleartext size != {}",
                    self.device.devpath().display(),
                    inner_size
                )));
            }
        }
        Ok(pos)
    }
}

/// Parse the fixed part of a LUKS1 header.
fn parse_header(header: &[u8; HEADER_FIXED_END as usize], devpath: &std::path::Path) -> ShiftResult<LuksGeometry> {
    if &header[..6] != LUKS_MAGIC {
        return Err(ShiftError::UnsupportedSuperblock {
            device: devpath.to_owned(),
            details: "bad LUKS magic".to_owned(),
        });
    }
    let mut cursor = Cursor::new(&header[6..8]);
    let version = cursor.read_u16::<BigEndian>()?;
    if version != 1 {
        return Err(ShiftError::UnsupportedSuperblock {
            device: devpath.to_owned(),
            details: format!("LUKS version {} (only 1 is supported)", version),
        });
    }

    let mut cursor = Cursor::new(&header[PAYLOAD_OFFSET_FIELD as usize..]);
    let payload_start_sectors = cursor.read_u32::<BigEndian>()?;
    let key_bytes = cursor.read_u32::<BigEndian>()?;

    let mut sb_end = HEADER_FIXED_END;
    for key_slot in 0..KEY_SLOT_COUNT {
        let slot = KEY_SLOT_BASE + KEY_SLOT_STRIDE * key_slot;
        let mut cursor = Cursor::new(&header[slot + 40..slot + 48]);
        let key_offset = cursor.read_u32::<BigEndian>()?;
        let key_stripes = cursor.read_u32::<BigEndian>()?;
        if key_stripes != 4000 {
            return Err(ShiftError::UnsupportedSuperblock {
                device: devpath.to_owned(),
                details: format!("key slot {} has {} stripes, expected 4000", key_slot, key_stripes),
            });
        }
        let key_end = u64::from(key_offset) * 512 + u64::from(key_stripes) * u64::from(key_bytes);
        sb_end = sb_end.max(key_end);
    }

    let payload_start = u64::from(payload_start_sectors) * 512;
    if payload_start < sb_end {
        return Err(ShiftError::UnsupportedSuperblock {
            device: devpath.to_owned(),
            details: format!(
                "payload starts at {} inside the superblock area ending at {}",
                payload_start, sb_end
            ),
        });
    }
    Ok(LuksGeometry {
        payload_start,
        sb_end,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// A syntactically valid LUKS1 header: payload at the given sector,
    /// one populated key slot per the usual cryptsetup layout.
    fn sample_header(payload_sectors: u32, key_bytes: u32) -> [u8; HEADER_FIXED_END as usize] {
        let mut header = [0u8; HEADER_FIXED_END as usize];
        header[..6].copy_from_slice(LUKS_MAGIC);
        header[6..8].copy_from_slice(&1u16.to_be_bytes());
        header[104..108].copy_from_slice(&payload_sectors.to_be_bytes());
        header[108..112].copy_from_slice(&key_bytes.to_be_bytes());
        for key_slot in 0..KEY_SLOT_COUNT {
            let slot = KEY_SLOT_BASE + KEY_SLOT_STRIDE * key_slot;
            let key_offset = 8u32 + key_slot as u32 * 504;
            header[slot + 40..slot + 44].copy_from_slice(&key_offset.to_be_bytes());
            header[slot + 44..slot + 48].copy_from_slice(&4000u32.to_be_bytes());
        }
        header
    }

    #[test]
    fn test_parse_header() {
        let header = sample_header(4096, 32);
        let geometry = parse_header(&header, std::path::Path::new("/dev/test")).unwrap();
        assert_eq!(geometry.payload_start, 4096 * 512);
        // Last slot: offset (8 + 7*504)*512 + 4000*32.
        assert_eq!(geometry.sb_end, (8 + 7 * 504) * 512 + 4000 * 32);
    }

    #[test]
    fn test_parse_header_bad_magic() {
        let mut header = sample_header(4096, 32);
        header[0] = b'X';
        assert_matches!(
            parse_header(&header, std::path::Path::new("/dev/test")),
            Err(ShiftError::UnsupportedSuperblock { .. })
        );
    }

    #[test]
    fn test_parse_header_bad_version() {
        let mut header = sample_header(4096, 32);
        header[6..8].copy_from_slice(&2u16.to_be_bytes());
        assert_matches!(
            parse_header(&header, std::path::Path::new("/dev/test")),
            Err(ShiftError::UnsupportedSuperblock { .. })
        );
    }

    #[test]
    fn test_parse_header_bad_stripes() {
        let mut header = sample_header(4096, 32);
        header[KEY_SLOT_BASE + 44..KEY_SLOT_BASE + 48].copy_from_slice(&2u32.to_be_bytes());
        assert_matches!(
            parse_header(&header, std::path::Path::new("/dev/test")),
            Err(ShiftError::UnsupportedSuperblock { .. })
        );
    }

    #[test]
    fn test_parse_header_payload_inside_header() {
        // Payload claimed at sector 1, far below the key material.
        let header = sample_header(1, 32);
        assert_matches!(
            parse_header(&header, std::path::Path::new("/dev/test")),
            Err(ShiftError::UnsupportedSuperblock { .. })
        );
    }

    #[test]
    fn test_shift_sb_on_file() {
        // 4 MiB scratch standing in for a LUKS device.
        let payload_sectors = 4096u32;
        let header = sample_header(payload_sectors, 32);
        let mut scratch = tempfile::NamedTempFile::new().unwrap();
        scratch.write_all(&header).unwrap();
        scratch
            .as_file()
            .set_len(u64::from(payload_sectors) * 512 + 4096)
            .unwrap();

        let mut luks = Luks::new(BlockDevice::new(scratch.path()));
        luks.offset = Some(u64::from(payload_sectors) * 512);
        luks.read_superblock_ll(scratch.as_file()).unwrap();

        let shift_by = 8192u64;
        luks.shift_sb(scratch.as_file(), shift_by).unwrap();

        // Head is zeroed.
        let mut head = [0u8; 8192];
        scratch.as_file().read_exact_at(&mut head, 0).unwrap();
        assert!(head.iter().all(|b| *b == 0));

        // The shifted copy parses, with the payload moved up by the shift.
        let mut moved = [0u8; HEADER_FIXED_END as usize];
        scratch.as_file().read_exact_at(&mut moved, shift_by).unwrap();
        let geometry = parse_header(&moved, std::path::Path::new("/dev/test")).unwrap();
        assert_eq!(
            geometry.payload_start,
            u64::from(payload_sectors) * 512 - shift_by
        );
    }

    #[test]
    fn test_dm_crypt_re() {
        let table = "0 204800 crypt aes-xts-plain64 0000000000000000000000000000000000000000000000000000000000000000 0 253:0 4096\n";
        let captures = DM_CRYPT_RE.captures(table).unwrap();
        assert_eq!(&captures[1], "204800");
        assert_eq!(&captures[4], "4096");

        // Options after the offset are tolerated.
        let with_options = "0 204800 crypt aes-xts-plain64 0000 0 253:0 4096 1 allow_discards\n";
        assert!(DM_CRYPT_RE.captures(with_options).is_some());

        // A linear table must not match.
        let linear = "0 204800 linear 253:0 0\n";
        assert!(DM_CRYPT_RE.captures(linear).is_none());
    }
}
