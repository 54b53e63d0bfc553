// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The synthetic device: a device-mapper construction that lets a tool
// which insists on owning a whole block device write its metadata into a
// sandbox. The head (and optionally the tail) are backed by a small
// loopback scratch file; the interior is an error target, so reads of
// untouched space fail instead of fabricating data, and stray writes
// fail instead of being silently dropped.

use std::{
    fs::File,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use loopdev::{LoopControl, LoopDevice};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::{
    engine::{
        dm,
        shared::bytes_to_sectors,
    },
    shift::{ShiftError, ShiftResult},
};

/// An assembled sandbox device at /dev/mapper/synthetic-<uuid>.
/// Teardown is deterministic and LIFO on every exit path: the dm
/// sandwich, then the error device, then the loopback, then the scratch
/// file.
#[derive(Debug)]
pub struct SyntheticDevice {
    devpath: PathBuf,
    head_size: u64,
    middle_size: u64,
    tail_size: u64,
    scratch: Option<NamedTempFile>,
    loop_dev: Option<LoopDevice>,
    synth_name: Option<String>,
    rozeros_name: Option<String>,
}

impl SyntheticDevice {
    /// Assemble a synthetic device presenting head + middle + tail bytes.
    /// All three sizes must be sector-aligned; the scratch file holds
    /// head + tail bytes.
    pub fn new(head_size: u64, middle_size: u64, tail_size: u64) -> ShiftResult<SyntheticDevice> {
        let head_sectors = bytes_to_sectors(head_size)?;
        let middle_sectors = bytes_to_sectors(middle_size)?;
        let tail_sectors = bytes_to_sectors(tail_size)?;

        reap_stale_sandboxes();

        let scratch = NamedTempFile::new()?;
        scratch.as_file().set_len(head_size + tail_size)?;

        let mut synth = SyntheticDevice {
            devpath: PathBuf::new(),
            head_size,
            middle_size,
            tail_size,
            scratch: Some(scratch),
            loop_dev: None,
            synth_name: None,
            rozeros_name: None,
        };

        let loop_control = LoopControl::open()?;
        let loop_dev = loop_control.next_free()?;
        loop_dev.attach_file(
            synth
                .scratch
                .as_ref()
                .expect("scratch was just created")
                .path(),
        )?;
        let loop_path = loop_dev.path().ok_or_else(|| {
            ShiftError::Msg("loopback device has no path after attach".to_owned())
        })?;
        synth.loop_dev = Some(loop_dev);

        let rozeros_name = format!("rozeros-{}", Uuid::new_v4());
        dm::mk_dm(
            &rozeros_name,
            &[(0, *middle_sectors, "error".to_owned(), String::new())],
            true,
        )?;
        synth.rozeros_name = Some(rozeros_name.clone());

        let mut table = vec![
            (
                0,
                *head_sectors,
                "linear".to_owned(),
                format!("{} 0", loop_path.display()),
            ),
            (
                *head_sectors,
                *middle_sectors,
                "linear".to_owned(),
                format!("/dev/mapper/{} 0", rozeros_name),
            ),
        ];
        if tail_size != 0 {
            table.push((
                *head_sectors + *middle_sectors,
                *tail_sectors,
                "linear".to_owned(),
                format!("{} {}", loop_path.display(), *head_sectors),
            ));
        }

        let synth_name = format!("synthetic-{}", Uuid::new_v4());
        dm::mk_dm(&synth_name, &table, false)?;
        synth.devpath = PathBuf::from("/dev/mapper").join(&synth_name);
        synth.synth_name = Some(synth_name);

        Ok(synth)
    }

    pub fn devpath(&self) -> &Path {
        &self.devpath
    }

    /// Total size presented to the formatting tool.
    pub fn size(&self) -> u64 {
        self.head_size + self.middle_size + self.tail_size
    }

    fn teardown(&mut self) -> ShiftResult<()> {
        if let Some(name) = self.synth_name.take() {
            dm::remove_dm(&name)?;
        }
        if let Some(name) = self.rozeros_name.take() {
            dm::remove_dm(&name)?;
        }
        if let Some(loop_dev) = self.loop_dev.take() {
            loop_dev.detach()?;
        }
        Ok(())
    }

    /// Tear the sandbox down and keep only the bytes the tool wrote:
    /// the scratch file holds the head region followed by the tail
    /// region.
    pub fn capture(mut self) -> ShiftResult<SyntheticImage> {
        self.teardown()?;
        let scratch = self
            .scratch
            .take()
            .expect("scratch file lives until capture or drop");

        let mut head = vec![0u8; self.head_size as usize];
        scratch.as_file().read_exact_at(&mut head, 0)?;
        let mut tail = vec![0u8; self.tail_size as usize];
        scratch.as_file().read_exact_at(&mut tail, self.head_size)?;

        Ok(SyntheticImage {
            head,
            tail,
            middle_size: self.middle_size,
        })
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!("synthetic device teardown failed: {}", err);
        }
    }
}

/// A crash can leave sandbox nodes behind whose loopback backing is
/// gone; remove what can be removed before building a new sandbox.
fn reap_stale_sandboxes() {
    match dm::stale_sandbox_devices() {
        Ok(stale) => {
            for name in stale {
                info!("removing stale sandbox device {}", name);
                if let Err(err) = dm::remove_dm(&name) {
                    warn!("could not remove stale sandbox device {}: {}", name, err);
                }
            }
        }
        Err(err) => warn!("could not scan for stale sandbox devices: {}", err),
    }
}

/// The bytes an external tool wrote into a synthetic device, ready to be
/// spliced onto a real device.
#[derive(Debug)]
pub struct SyntheticImage {
    head: Vec<u8>,
    tail: Vec<u8>,
    middle_size: u64,
}

impl SyntheticImage {
    #[cfg(test)]
    pub(crate) fn from_parts(head: Vec<u8>, tail: Vec<u8>, middle_size: u64) -> SyntheticImage {
        SyntheticImage {
            head,
            tail,
            middle_size,
        }
    }

    pub fn head(&self) -> &[u8] {
        &self.head
    }

    fn head_size(&self) -> u64 {
        self.head.len() as u64
    }

    fn tail_size(&self) -> u64 {
        self.tail.len() as u64
    }

    /// Splice the head and tail onto a device: two positioned writes at
    /// shift_by and shift_by + head + middle, each read back and
    /// compared to detect torn writes.
    ///
    /// A negative shift_by wraps relative to the synthetic size and is
    /// only meaningful when writing back to a device of that same size
    /// (other_device is false). When reserved_area is non-zero, both
    /// write positions must land at or beyond it.
    pub fn copy_to_physical(
        &self,
        dev_file: &File,
        shift_by: i64,
        reserved_area: u64,
        other_device: bool,
    ) -> ShiftResult<()> {
        let size = self.head_size() + self.middle_size + self.tail_size();

        let shift = if shift_by < 0 {
            if other_device {
                return Err(ShiftError::Msg(
                    "a negative shift only wraps on the device of origin".to_owned(),
                ));
            }
            let wrapped = shift_by + size as i64;
            if wrapped < 0 {
                return Err(ShiftError::Msg(format!(
                    "shift {} wraps past the start of a {} byte device",
                    shift_by, size
                )));
            }
            wrapped as u64
        } else {
            shift_by as u64
        };
        let wrend_offset = shift + self.head_size() + self.middle_size;

        if reserved_area != 0 && (shift < reserved_area || wrend_offset < reserved_area) {
            return Err(ShiftError::Msg(format!(
                "write at {} would fall inside the reserved area of {} bytes",
                shift.min(wrend_offset),
                reserved_area
            )));
        }
        if !other_device {
            if shift + self.head_size() > size {
                return Err(ShiftError::Msg(format!(
                    "head write at {} overruns the {} byte device",
                    shift, size
                )));
            }
            if self.tail_size() != 0 && wrend_offset + self.tail_size() > size {
                return Err(ShiftError::Msg(format!(
                    "tail write at {} overruns the {} byte device",
                    wrend_offset, size
                )));
            }
        }

        debug!(
            "writing {} bytes at offset {}",
            self.head_size(),
            shift
        );
        dev_file.write_all_at(&self.head, shift)?;
        let mut read_back = vec![0u8; self.head.len()];
        dev_file.read_exact_at(&mut read_back, shift)?;
        if read_back != self.head {
            return Err(ShiftError::Msg(format!(
                "read-back mismatch after writing {} bytes at {}",
                self.head_size(),
                shift
            )));
        }

        if !self.tail.is_empty() {
            debug!(
                "writing {} bytes at offset {}",
                self.tail_size(),
                wrend_offset
            );
            dev_file.write_all_at(&self.tail, wrend_offset)?;
            let mut read_back = vec![0u8; self.tail.len()];
            dev_file.read_exact_at(&mut read_back, wrend_offset)?;
            if read_back != self.tail {
                return Err(ShiftError::Msg(format!(
                    "read-back mismatch after writing {} bytes at {}",
                    self.tail_size(),
                    wrend_offset
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A scratch file playing the role of the physical device, with a
    /// recognizable background pattern.
    fn scratch_device(size: usize) -> NamedTempFile {
        let scratch = NamedTempFile::new().unwrap();
        let pattern = (0..size).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        scratch.as_file().write_all_at(&pattern, 0).unwrap();
        scratch
    }

    fn read_all(file: &File, size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size];
        file.read_exact_at(&mut buf, 0).unwrap();
        buf
    }

    #[test]
    fn test_copy_covers_head_and_tail_only() {
        let size = 8192usize;
        let scratch = scratch_device(size);
        let before = read_all(scratch.as_file(), size);

        let image = SyntheticImage::from_parts(vec![0xAA; 512], vec![0xBB; 512], 1024);
        image
            .copy_to_physical(scratch.as_file(), 512, 0, true)
            .unwrap();

        let after = read_all(scratch.as_file(), size);
        assert_eq!(&after[512..1024], &[0xAA; 512][..]);
        assert_eq!(&after[512 + 512 + 1024..512 + 512 + 1024 + 512], &[0xBB; 512][..]);
        // Everything outside the two regions is untouched.
        assert_eq!(&after[..512], &before[..512]);
        assert_eq!(&after[1024..2048], &before[1024..2048]);
        assert_eq!(&after[2560..], &before[2560..]);
    }

    #[test]
    fn test_copy_negative_shift_wraps() {
        // Image size 2048; shift -512 should write the head at 1536.
        let scratch = scratch_device(4096);
        let image = SyntheticImage::from_parts(vec![0xCC; 512], Vec::new(), 1536);
        image
            .copy_to_physical(scratch.as_file(), -512, 0, false)
            .unwrap();
        let after = read_all(scratch.as_file(), 4096);
        assert_eq!(&after[1536..2048], &[0xCC; 512][..]);
    }

    #[test]
    fn test_copy_negative_shift_rejected_on_other_device() {
        let scratch = scratch_device(4096);
        let image = SyntheticImage::from_parts(vec![0u8; 512], Vec::new(), 512);
        assert_matches!(
            image.copy_to_physical(scratch.as_file(), -512, 0, true),
            Err(ShiftError::Msg(_))
        );
    }

    #[test]
    fn test_copy_respects_reserved_area() {
        let scratch = scratch_device(8192);
        let image = SyntheticImage::from_parts(vec![0u8; 512], Vec::new(), 512);
        assert_matches!(
            image.copy_to_physical(scratch.as_file(), 512, 1024, true),
            Err(ShiftError::Msg(_))
        );
        image
            .copy_to_physical(scratch.as_file(), 1024, 1024, true)
            .unwrap();
    }

    #[test]
    fn test_copy_rejects_overrun_on_origin_device() {
        let scratch = scratch_device(4096);
        // Image is 1024 bytes; a shift of 768 pushes the head past it.
        let image = SyntheticImage::from_parts(vec![0u8; 512], Vec::new(), 512);
        assert_matches!(
            image.copy_to_physical(scratch.as_file(), 768, 0, false),
            Err(ShiftError::Msg(_))
        );
    }
}
