// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The partition-table layer, driven by parted's machine-readable output.
// Edits go through parted as well, which reloads the kernel's view of
// the table as a side effect.

use std::path::{Path, PathBuf};

use crate::{
    engine::cmd,
    shift::{ShiftError, ShiftResult},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionKind {
    Free,
    Partition {
        number: u32,
        fstype: String,
        name: String,
    },
}

/// One row of the table: a partition or a free gap, in byte units with
/// parted's inclusive end convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub kind: RegionKind,
}

impl Region {
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    fn is_free(&self) -> bool {
        self.kind == RegionKind::Free
    }
}

#[derive(Debug)]
pub struct PartitionTable {
    disk: PathBuf,
    label: String,
    regions: Vec<Region>,
}

impl PartitionTable {
    /// Read the table of a disk, free gaps included.
    pub fn read(disk: &Path) -> ShiftResult<PartitionTable> {
        let output = cmd::parted_print_free(disk)?;
        let (label, regions) = parse_machine_output(&output)?;
        Ok(PartitionTable {
            disk: disk.to_owned(),
            label,
            regions,
        })
    }

    /// Refresh the cached rows after an edit.
    fn reload(&mut self) -> ShiftResult<()> {
        let output = cmd::parted_print_free(&self.disk)?;
        let (label, regions) = parse_machine_output(&output)?;
        self.label = label;
        self.regions = regions;
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn partition_at(&self, part_start: u64) -> ShiftResult<&Region> {
        self.regions
            .iter()
            .find(|region| !region.is_free() && region.start == part_start)
            .ok_or_else(|| {
                ShiftError::Msg(format!(
                    "no partition starts at byte {} of {}",
                    part_start,
                    self.disk.display()
                ))
            })
    }

    /// Editing an MBR logical partition would also move the EBR chain;
    /// that is out of scope.
    fn check_not_logical(&self, region: &Region) -> ShiftResult<()> {
        if let RegionKind::Partition { number, .. } = region.kind {
            if self.label == "msdos" && number > 4 {
                return Err(ShiftError::UnsupportedLayout(format!(
                    "partition {} of {} is an MBR logical partition",
                    number,
                    self.disk.display()
                )));
            }
        }
        Ok(())
    }

    /// Check that length bytes directly before the partition are free,
    /// so a superblock can be placed there. Occupied space fails with
    /// OverlappingPartition.
    pub fn reserve_space_before(&self, part_start: u64, length: u64) -> ShiftResult<()> {
        let partition = self.partition_at(part_start)?;
        self.check_not_logical(partition)?;
        if part_start < length {
            return Err(ShiftError::OverlappingPartition(format!(
                "only {} bytes before the partition at {}",
                part_start,
                self.disk.display()
            )));
        }
        let wanted_start = part_start - length;
        let preceding = self
            .regions
            .iter()
            .find(|region| region.is_free() && region.end + 1 == part_start);
        match preceding {
            Some(gap) if gap.start <= wanted_start => Ok(()),
            _ => Err(ShiftError::OverlappingPartition(format!(
                "the {} bytes before byte {} of {} are not free",
                length,
                part_start,
                self.disk.display()
            ))),
        }
    }

    /// Resize the partition starting at part_start to newsize bytes.
    /// The direction must be stated; shrink is the dangerous one.
    pub fn part_resize(&mut self, part_start: u64, newsize: u64, shrink: bool) -> ShiftResult<u64> {
        let partition = self.partition_at(part_start)?.clone();
        self.check_not_logical(&partition)?;
        let number = match partition.kind {
            RegionKind::Partition { number, .. } => number,
            RegionKind::Free => unreachable!("partition_at never returns free regions"),
        };
        if shrink != (newsize < partition.size()) {
            return Err(ShiftError::Msg(format!(
                "resize direction mismatch: {} -> {} bytes with shrink={}",
                partition.size(),
                newsize,
                shrink
            )));
        }
        if !shrink {
            // The space taken must be ours to take.
            let wanted_end = part_start + newsize - 1;
            let following = self
                .regions
                .iter()
                .find(|region| region.is_free() && region.start == partition.end + 1);
            let available_end = match following {
                Some(gap) => gap.end,
                None => partition.end,
            };
            if wanted_end > available_end {
                return Err(ShiftError::OverlappingPartition(format!(
                    "no room to grow partition {} to {} bytes",
                    number, newsize
                )));
            }
        }
        cmd::parted_script(
            &self.disk,
            &[
                "resizepart",
                &number.to_string(),
                &format!("{}B", part_start + newsize - 1),
            ],
        )?;
        self.reload()?;
        Ok(self.partition_at(part_start)?.size())
    }

    /// Redefine the partition to start at new_start while keeping its
    /// end, by removing and recreating the entry. Only the table entry
    /// moves; no data is copied.
    pub fn shift_left(&mut self, part_start: u64, new_start: u64) -> ShiftResult<()> {
        if new_start >= part_start {
            return Err(ShiftError::Msg(format!(
                "shift_left goes left: {} -> {}",
                part_start, new_start
            )));
        }
        self.reserve_space_before(part_start, part_start - new_start)?;
        let partition = self.partition_at(part_start)?.clone();
        let (number, fstype, name) = match partition.kind {
            RegionKind::Partition {
                number,
                ref fstype,
                ref name,
            } => (number, fstype.clone(), name.clone()),
            RegionKind::Free => unreachable!("partition_at never returns free regions"),
        };

        cmd::parted_script(&self.disk, &["rm", &number.to_string()])?;
        let mkpart_name = match self.label.as_str() {
            // GPT names the partition; MBR wants a partition type.
            "gpt" => {
                if name.is_empty() {
                    String::from("\"\"")
                } else {
                    name
                }
            }
            _ => String::from("primary"),
        };
        let start_arg = format!("{}B", new_start);
        let end_arg = format!("{}B", partition.end);
        let mut args = vec!["mkpart", mkpart_name.as_str()];
        if !fstype.is_empty() {
            args.push(fstype.as_str());
        }
        args.push(start_arg.as_str());
        args.push(end_arg.as_str());
        cmd::parted_script(&self.disk, &args)?;
        self.reload()
    }
}

/// Parse `parted --machine ... unit B print free` output: a "BYT;"
/// marker, a disk description line, then one line per region with
/// colon-separated byte-suffixed fields.
fn parse_machine_output(output: &str) -> ShiftResult<(String, Vec<Region>)> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some("BYT;") => (),
        other => {
            return Err(ShiftError::Msg(format!(
                "unexpected parted output prelude: {:?}",
                other
            )))
        }
    }
    let disk_line = lines
        .next()
        .ok_or_else(|| ShiftError::Msg("parted output has no disk line".to_owned()))?;
    let disk_fields = disk_line.trim_end_matches(';').split(':').collect::<Vec<_>>();
    if disk_fields.len() < 6 {
        return Err(ShiftError::Msg(format!(
            "malformed parted disk line: {}",
            disk_line
        )));
    }
    let label = disk_fields[5].to_owned();

    let mut regions = Vec::new();
    for line in lines {
        let fields = line.trim_end_matches(';').split(':').collect::<Vec<_>>();
        if fields.len() < 5 {
            return Err(ShiftError::Msg(format!(
                "malformed parted region line: {}",
                line
            )));
        }
        let start = parse_bytes_field(fields[1])?;
        let end = parse_bytes_field(fields[2])?;
        let kind = if fields[4] == "free" {
            RegionKind::Free
        } else {
            RegionKind::Partition {
                number: fields[0].parse()?,
                fstype: fields[4].to_owned(),
                name: fields.get(5).copied().unwrap_or("").to_owned(),
            }
        };
        regions.push(Region { start, end, kind });
    }
    Ok((label, regions))
}

fn parse_bytes_field(field: &str) -> ShiftResult<u64> {
    field
        .strip_suffix('B')
        .ok_or_else(|| ShiftError::Msg(format!("expected a byte field, got '{}'", field)))?
        .parse()
        .map_err(ShiftError::ParseInt)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "BYT;\n\
        /dev/sdz:268435456000B:scsi:512:512:gpt:Test Disk:;\n\
        1:17408B:1048575B:1031168B:free;\n\
        1:1048576B:2097151B:1048576B:ext4:boot:;\n\
        1:2097152B:3145727B:1048576B:free;\n\
        2:3145728B:268434341887B:268431196160B:ext4:root:;\n";

    fn sample_table() -> PartitionTable {
        let (label, regions) = parse_machine_output(SAMPLE).unwrap();
        PartitionTable {
            disk: PathBuf::from("/dev/sdz"),
            label,
            regions,
        }
    }

    #[test]
    fn test_parse_machine_output() {
        let table = sample_table();
        assert_eq!(table.label(), "gpt");
        assert_eq!(table.regions.len(), 4);
        assert_eq!(
            table.regions[1].kind,
            RegionKind::Partition {
                number: 1,
                fstype: "ext4".to_owned(),
                name: "boot".to_owned(),
            }
        );
        assert_eq!(table.regions[2].size(), 1048576);
        assert!(table.regions[2].is_free());
    }

    #[test]
    fn test_reserve_space_before_free_gap() {
        let table = sample_table();
        // 1 MiB of free space precedes partition 2.
        table.reserve_space_before(3145728, 1048576).unwrap();
    }

    #[test]
    fn test_reserve_space_before_occupied() {
        let table = sample_table();
        // Partition 1 starts right after a gap that is too small for 2 MiB.
        assert_matches!(
            table.reserve_space_before(3145728, 2 * 1048576),
            Err(ShiftError::OverlappingPartition(_))
        );
    }

    #[test]
    fn test_reserve_space_before_no_gap() {
        let mut table = sample_table();
        // Remove the gap so partition 2 is preceded by partition 1 directly.
        table.regions.remove(2);
        assert_matches!(
            table.reserve_space_before(3145728, 1048576),
            Err(ShiftError::OverlappingPartition(_))
        );
    }

    #[test]
    fn test_partition_at_misses_free_regions() {
        let table = sample_table();
        assert_matches!(table.partition_at(17408), Err(ShiftError::Msg(_)));
        assert!(table.partition_at(1048576).is_ok());
    }

    #[test]
    fn test_logical_partition_refused() {
        let (_, regions) = parse_machine_output(SAMPLE).unwrap();
        let table = PartitionTable {
            disk: PathBuf::from("/dev/sdz"),
            label: "msdos".to_owned(),
            regions: regions
                .into_iter()
                .map(|mut region| {
                    if let RegionKind::Partition { ref mut number, .. } = region.kind {
                        *number += 4;
                    }
                    region
                })
                .collect(),
        };
        let partition = table.partition_at(3145728).unwrap();
        assert_matches!(
            table.check_not_logical(partition),
            Err(ShiftError::UnsupportedLayout(_))
        );
    }
}
