// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Rotation of a linear LV by one physical extent: a structural edit of
// the VG metadata that moves the first PE to the end (forward) or the
// last PE to the front (backward) without copying any data. Segments
// are split and merged as needed, so forward and backward are exact
// inverses on normalized metadata.

use crate::{
    engine::{
        cmd::{self, LvChange},
        lvm::config::{self, Node, Section, Value},
        shared::name_is_whitelisted,
        BlockDevice,
    },
    shift::{ShiftError, ShiftResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Move the first PE to the end.
    Forward,
    /// Move the last PE to the front.
    Backward,
}

/// One linear segment of an LV: extent_count extents starting at logical
/// extent start_extent, mapped at pv_offset extents into pv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start_extent: i64,
    pub extent_count: i64,
    pub pv: String,
    pub pv_offset: i64,
}

impl Segment {
    fn follows(&self, other: &Segment) -> bool {
        self.pv == other.pv && other.pv_offset + other.extent_count == self.pv_offset
    }
}

/// Check the segments describe one gapless linear mapping and return the
/// extent total.
fn validate_segments(segments: &[Segment]) -> ShiftResult<i64> {
    let mut expected_start = 0;
    for segment in segments {
        if segment.start_extent != expected_start {
            return Err(ShiftError::UnsupportedLayout(format!(
                "segment at extent {} does not follow the previous one at {}",
                segment.start_extent, expected_start
            )));
        }
        if segment.extent_count <= 0 {
            return Err(ShiftError::UnsupportedLayout(format!(
                "segment at extent {} has extent_count {}",
                segment.start_extent, segment.extent_count
            )));
        }
        expected_start += segment.extent_count;
    }
    Ok(expected_start)
}

/// Rotate a linear LV's segment list by one PE. Pure: operates on the
/// parsed segment list only.
pub fn rotate_segments(segments: &[Segment], direction: Direction) -> ShiftResult<Vec<Segment>> {
    let extent_total = validate_segments(segments)?;
    if extent_total <= 1 {
        return Err(ShiftError::UnsupportedLayout(
            "rotating a single-extent LV is meaningless".to_owned(),
        ));
    }
    let mut segments = segments.to_vec();

    match direction {
        Direction::Forward => {
            for segment in segments.iter_mut().skip(1) {
                segment.start_extent -= 1;
            }
            let first = &mut segments[0];
            let moved = Segment {
                start_extent: extent_total - 1,
                extent_count: 1,
                pv: first.pv.clone(),
                pv_offset: first.pv_offset,
            };
            first.extent_count -= 1;
            first.pv_offset += 1;
            if first.extent_count == 0 {
                segments.remove(0);
            }
            let last = segments.last_mut().expect("extent_total > 1");
            if moved.follows(last) {
                last.extent_count += 1;
            } else {
                segments.push(moved);
            }
        }
        Direction::Backward => {
            for segment in segments.iter_mut() {
                segment.start_extent += 1;
            }
            let last = segments.last_mut().expect("validated non-empty");
            last.extent_count -= 1;
            let moved = Segment {
                start_extent: 0,
                extent_count: 1,
                pv: last.pv.clone(),
                pv_offset: last.pv_offset + last.extent_count,
            };
            if last.extent_count == 0 {
                segments.pop();
            }
            let first = segments.first_mut().expect("extent_total > 1");
            if first.follows(&moved) {
                first.start_extent = 0;
                first.extent_count += 1;
                first.pv_offset -= 1;
            } else {
                segments.insert(0, moved);
            }
        }
    }
    Ok(segments)
}

/// Pull the segmentN sections out of an LV section.
fn read_segments(lv: &Section) -> ShiftResult<Vec<Segment>> {
    let segment_count = lv.int("segment_count")?;
    let mut segments = Vec::with_capacity(segment_count as usize);
    for index in 1..=segment_count {
        let segment = lv.section(&format!("segment{}", index))?;
        if segment.str("type")? != "striped" || segment.int("stripe_count")? != 1 {
            return Err(ShiftError::UnsupportedLayout(format!(
                "segment{} is not linear single-stripe",
                index
            )));
        }
        let stripes = match segment.get("stripes") {
            Some(Node::Value(Value::List(items))) => items,
            _ => {
                return Err(ShiftError::UnsupportedLayout(format!(
                    "segment{} has no stripes list",
                    index
                )))
            }
        };
        let (pv, pv_offset) = match stripes.as_slice() {
            [Value::Str(pv), Value::Int(offset)] => (pv.clone(), *offset),
            _ => {
                return Err(ShiftError::UnsupportedLayout(format!(
                    "segment{} stripes are not a single (pv, offset) pair",
                    index
                )))
            }
        };
        segments.push(Segment {
            start_extent: segment.int("start_extent")?,
            extent_count: segment.int("extent_count")?,
            pv,
            pv_offset,
        });
    }
    Ok(segments)
}

/// Replace the segmentN sections of an LV with the given list, keeping
/// their position within the section.
fn write_segments(lv: &mut Section, segments: &[Segment]) -> ShiftResult<()> {
    let old_count = lv.int("segment_count")?;
    let insert_at = lv
        .index_of("segment1")
        .ok_or_else(|| ShiftError::Msg("LV has no segment1".to_owned()))?;
    for index in 1..=old_count {
        lv.remove(&format!("segment{}", index));
    }
    for (offset, segment) in segments.iter().enumerate() {
        let mut section = Section::new();
        section.set_int("start_extent", segment.start_extent);
        section.set_int("extent_count", segment.extent_count);
        section.set("type", Node::Value(Value::Str("striped".to_owned())));
        section.set_int("stripe_count", 1);
        section.set(
            "stripes",
            Node::Value(Value::List(vec![
                Value::Str(segment.pv.clone()),
                Value::Int(segment.pv_offset),
            ])),
        );
        lv.insert(
            insert_at + offset,
            &format!("segment{}", offset + 1),
            Node::Section(section),
        );
    }
    lv.set_int("segment_count", segments.len() as i64);
    Ok(())
}

/// Rotate the named LV inside a parsed VG config tree, checking the LV's
/// extent total against its device size.
pub fn rotate_tree(
    tree: &mut Section,
    vgname: &str,
    lvname: &str,
    size_bytes: u64,
    direction: Direction,
) -> ShiftResult<()> {
    let vg = tree.section(vgname)?;
    let extent_size = vg.int("extent_size")?;
    let lv = tree
        .section_mut(vgname)?
        .section_mut("logical_volumes")?
        .section_mut(lvname)?;
    let segments = read_segments(lv)?;
    let extent_total = validate_segments(&segments)?;
    if (extent_total * extent_size) as u64 != size_bytes / 512 {
        return Err(ShiftError::UnsupportedLayout(format!(
            "LV {}/{} maps {} extents of {} sectors but the device has {} sectors",
            vgname,
            lvname,
            extent_total,
            extent_size,
            size_bytes / 512
        )));
    }
    let rotated = rotate_segments(&segments, direction)?;
    write_segments(lv, &rotated)
}

/// Rotate a logical volume by a single PE and poke LVM to refresh the
/// mapping. The edit is verified by applying the inverse rotation and
/// comparing serializations before anything is restored.
pub fn rotate_lv(device: &mut BlockDevice, size: u64, direction: Direction) -> ShiftResult<()> {
    let identity = cmd::lvs_identity(device.devpath())?;
    if !name_is_whitelisted(&identity.vg_name) || !name_is_whitelisted(&identity.lv_name) {
        return Err(ShiftError::Msg(format!(
            "VG or LV name of {} needs quoting, refusing to edit metadata",
            device.devpath().display()
        )));
    }
    let vg_lv = format!("{}/{}", identity.vg_name, identity.lv_name);

    // Make sure the volume isn't mapped while its metadata changes.
    cmd::lvchange(&vg_lv, LvChange::Deactivate)?;

    let workdir = tempfile::Builder::new().prefix("blockshift-vgcfg-").tempdir()?;
    let vgcfg_path = workdir.path().join("vg.cfg");
    info!("loading LVM metadata for {}", vg_lv);
    cmd::vgcfgbackup(&identity.vg_name, &vgcfg_path)?;

    let text = std::fs::read_to_string(&vgcfg_path)?;
    let tree = config::parse(&text)?;

    let mut rotated = tree.clone();
    rotate_tree(
        &mut rotated,
        &identity.vg_name,
        &identity.lv_name,
        size,
        direction,
    )?;

    // Undo once on a copy; an edit that does not invert cleanly must not
    // reach vgcfgrestore.
    let mut back_again = rotated.clone();
    let inverse = match direction {
        Direction::Forward => Direction::Backward,
        Direction::Backward => Direction::Forward,
    };
    rotate_tree(
        &mut back_again,
        &identity.vg_name,
        &identity.lv_name,
        size,
        inverse,
    )?;
    if config::serialize(&back_again) != config::serialize(&tree) {
        return Err(ShiftError::Msg(format!(
            "rotation of {} is not stable under undo, refusing to restore",
            vg_lv
        )));
    }

    let rotated_path = workdir.path().join("vg-rotated.cfg");
    std::fs::write(&rotated_path, config::serialize(&rotated))?;

    match direction {
        Direction::Forward => info!("rotating the first extent to be the last"),
        Direction::Backward => info!("rotating the last extent to be the first"),
    }
    cmd::vgcfgrestore(&identity.vg_name, &rotated_path, None)?;
    cmd::lvchange(&vg_lv, LvChange::Refresh)?;
    if identity.active {
        cmd::lvchange(&vg_lv, LvChange::Activate)?;
    }
    device.reset_size();
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::engine::lvm::config::tests::SAMPLE_VG;

    fn segment(start: i64, count: i64, pv: &str, pv_offset: i64) -> Segment {
        Segment {
            start_extent: start,
            extent_count: count,
            pv: pv.to_owned(),
            pv_offset,
        }
    }

    #[test]
    fn test_forward_rotation_splits_first_segment() {
        let input = vec![segment(0, 3, "pv0", 0), segment(3, 5, "pv0", 10)];
        let rotated = rotate_segments(&input, Direction::Forward).unwrap();
        assert_eq!(
            rotated,
            vec![
                segment(0, 2, "pv0", 1),
                segment(2, 5, "pv0", 10),
                segment(7, 1, "pv0", 0),
            ]
        );
        let back = rotate_segments(&rotated, Direction::Backward).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn test_forward_rotation_single_segment() {
        let input = vec![segment(0, 8, "pv0", 4)];
        let rotated = rotate_segments(&input, Direction::Forward).unwrap();
        assert_eq!(
            rotated,
            vec![segment(0, 7, "pv0", 5), segment(7, 1, "pv0", 4)]
        );
        assert_eq!(
            rotate_segments(&rotated, Direction::Backward).unwrap(),
            input
        );
    }

    #[test]
    fn test_backward_rotation_single_segment() {
        let input = vec![segment(0, 8, "pv0", 4)];
        let rotated = rotate_segments(&input, Direction::Backward).unwrap();
        assert_eq!(
            rotated,
            vec![segment(0, 1, "pv0", 11), segment(1, 7, "pv0", 4)]
        );
        assert_eq!(
            rotate_segments(&rotated, Direction::Forward).unwrap(),
            input
        );
    }

    #[test]
    fn test_forward_rotation_drops_emptied_first_segment() {
        let input = vec![segment(0, 1, "pv0", 20), segment(1, 4, "pv0", 0)];
        let rotated = rotate_segments(&input, Direction::Forward).unwrap();
        assert_eq!(
            rotated,
            vec![segment(0, 4, "pv0", 0), segment(4, 1, "pv0", 20)]
        );
        assert_eq!(
            rotate_segments(&rotated, Direction::Backward).unwrap(),
            input
        );
    }

    #[test]
    fn test_single_extent_lv_is_rejected() {
        let input = vec![segment(0, 1, "pv0", 0)];
        assert_matches!(
            rotate_segments(&input, Direction::Forward),
            Err(ShiftError::UnsupportedLayout(_))
        );
    }

    #[test]
    fn test_gap_is_rejected() {
        let input = vec![segment(0, 3, "pv0", 0), segment(4, 2, "pv0", 10)];
        assert_matches!(
            rotate_segments(&input, Direction::Forward),
            Err(ShiftError::UnsupportedLayout(_))
        );
    }

    #[test]
    fn test_rotate_tree_on_sample_config() {
        let mut tree = config::parse(SAMPLE_VG).unwrap();
        // 8 extents of 8192 sectors each.
        let size_bytes = 8 * 8192 * 512;
        rotate_tree(&mut tree, "vg0", "lv0", size_bytes, Direction::Forward).unwrap();

        let lv = tree
            .section("vg0")
            .unwrap()
            .section("logical_volumes")
            .unwrap()
            .section("lv0")
            .unwrap();
        assert_eq!(lv.int("segment_count").unwrap(), 3);
        let third = lv.section("segment3").unwrap();
        assert_eq!(third.int("start_extent").unwrap(), 7);
        assert_eq!(third.int("extent_count").unwrap(), 1);

        // Undo reproduces the parsed original, byte for byte.
        let mut back = tree.clone();
        rotate_tree(&mut back, "vg0", "lv0", size_bytes, Direction::Backward).unwrap();
        let original = config::parse(SAMPLE_VG).unwrap();
        assert_eq!(config::serialize(&back), config::serialize(&original));
    }

    #[test]
    fn test_rotate_tree_size_mismatch() {
        let mut tree = config::parse(SAMPLE_VG).unwrap();
        assert_matches!(
            rotate_tree(&mut tree, "vg0", "lv0", 512, Direction::Forward),
            Err(ShiftError::UnsupportedLayout(_))
        );
    }

    /// Segment lists as LVM would store them: gapless starts, and no two
    /// adjacent segments contiguous on the PV (those would have been
    /// merged at allocation time).
    fn normalized_segments() -> impl Strategy<Value = Vec<Segment>> {
        prop::collection::vec((1i64..5, 0i64..4), 1..6).prop_map(|pieces| {
            let mut segments = Vec::new();
            let mut start = 0;
            let mut base_offset = 0;
            for (count, gap) in pieces {
                segments.push(Segment {
                    start_extent: start,
                    extent_count: count,
                    pv: "pv0".to_owned(),
                    pv_offset: base_offset + gap + 1,
                });
                start += count;
                // The next segment begins past this one's PV range, so
                // adjacent segments never merge.
                base_offset += gap + 1 + count;
            }
            segments
        })
    }

    proptest! {
        #[test]
        fn rotation_is_an_involution(segments in normalized_segments()) {
            let total: i64 = segments.iter().map(|s| s.extent_count).sum();
            prop_assume!(total > 1);

            let forward = rotate_segments(&segments, Direction::Forward).unwrap();
            let round = rotate_segments(&forward, Direction::Backward).unwrap();
            prop_assert_eq!(&round, &segments);

            let backward = rotate_segments(&segments, Direction::Backward).unwrap();
            let round = rotate_segments(&backward, Direction::Forward).unwrap();
            prop_assert_eq!(&round, &segments);
        }

        #[test]
        fn rotation_preserves_extent_total(segments in normalized_segments()) {
            let total: i64 = segments.iter().map(|s| s.extent_count).sum();
            prop_assume!(total > 1);

            for direction in [Direction::Forward, Direction::Backward] {
                let rotated = rotate_segments(&segments, direction).unwrap();
                prop_assert_eq!(validate_segments(&rotated).unwrap(), total);
            }
        }
    }
}
