// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The layered block model: a stack of container wrappers over one
// filesystem leaf, built by walking superblocks downward from the target
// device.

use crate::{
    engine::{
        bcache::BcacheBacking, filesystem::Filesystem, luks::Luks, shared::align_down,
        BlockDevice,
    },
    shift::{ShiftError, ShiftResult},
};

/// A one-to-one wrapper layer with a fixed offset from its own start to
/// its content's start.
#[derive(Debug)]
pub enum Container {
    Luks(Luks),
    Bcache(BcacheBacking),
}

impl Container {
    pub fn device(&self) -> &BlockDevice {
        match *self {
            Container::Luks(ref luks) => luks.device(),
            Container::Bcache(ref bcache) => bcache.device(),
        }
    }

    /// Bytes between the start of this layer and the start of its
    /// content.
    pub fn offset(&self) -> ShiftResult<u64> {
        match *self {
            Container::Luks(ref luks) => luks.offset(),
            Container::Bcache(ref bcache) => bcache.offset(),
        }
    }

    pub fn read_superblock(&mut self) -> ShiftResult<()> {
        match *self {
            Container::Luks(ref mut luks) => luks.read_superblock(),
            Container::Bcache(ref mut bcache) => bcache.read_superblock(),
        }
    }

    pub fn grow_nonrec(&mut self, upper_bound: u64) -> ShiftResult<u64> {
        match *self {
            Container::Luks(ref mut luks) => luks.grow_nonrec(upper_bound),
            Container::Bcache(ref mut bcache) => bcache.grow_nonrec(upper_bound),
        }
    }

    pub fn reserve_end_area_nonrec(&mut self, pos: u64) -> ShiftResult<u64> {
        match *self {
            Container::Luks(ref mut luks) => luks.reserve_end_area_nonrec(pos),
            Container::Bcache(ref mut bcache) => bcache.reserve_end_area_nonrec(pos),
        }
    }

    pub fn deactivate(&mut self) -> ShiftResult<()> {
        match *self {
            Container::Luks(ref mut luks) => luks.deactivate(),
            Container::Bcache(ref mut bcache) => bcache.deactivate(),
        }
    }
}

/// An ordered wrapper stack over a filesystem leaf. Single-use:
/// deactivate() consumes the stack, since every contained devpath is
/// invalid afterwards.
#[derive(Debug)]
pub struct BlockStack {
    wrappers: Vec<Container>,
    fs: Filesystem,
}

impl BlockStack {
    pub fn new(wrappers: Vec<Container>, fs: Filesystem) -> BlockStack {
        BlockStack { wrappers, fs }
    }

    pub fn fs(&self) -> &Filesystem {
        &self.fs
    }

    pub fn fsuuid(&self) -> ShiftResult<Option<String>> {
        self.fs.fsuuid()
    }

    pub fn fslabel(&self) -> ShiftResult<Option<String>> {
        self.fs.fslabel()
    }

    /// Total of the wrapper offsets: bytes of the outer device that hold
    /// container metadata rather than filesystem content.
    pub fn overhead(&self) -> ShiftResult<u64> {
        let mut total = 0;
        for wrapper in &self.wrappers {
            total += wrapper.offset()?;
        }
        Ok(total)
    }

    /// The position of outer_pos within each layer, walking inward: each
    /// wrapper's offset moves the origin forward.
    pub fn iter_pos(&self, outer_pos: u64) -> ShiftResult<Vec<u64>> {
        let mut positions = Vec::with_capacity(self.wrappers.len() + 1);
        let mut pos = outer_pos;
        for wrapper in &self.wrappers {
            positions.push(pos);
            pos -= wrapper.offset()?;
        }
        positions.push(pos);
        Ok(positions)
    }

    /// Filesystem size plus wrapper overhead: the bytes of the outer
    /// device that are in use.
    pub fn total_data_size(&self) -> ShiftResult<u64> {
        Ok(self.fs.fssize()? + self.overhead()?)
    }

    pub fn read_superblocks(&mut self) -> ShiftResult<()> {
        for wrapper in &mut self.wrappers {
            wrapper.read_superblock()?;
        }
        self.fs.read_superblock()
    }

    pub fn stack_resize(&mut self, pos: u64, shrink: bool) -> ShiftResult<()> {
        if shrink {
            self.stack_reserve_end_area(pos)
        } else {
            self.stack_grow(pos)
        }
    }

    /// Grow outermost-first: each layer must enlarge before the content
    /// inside it can expand.
    pub fn stack_grow(&mut self, newsize: u64) -> ShiftResult<()> {
        let mut upper_bound = newsize;
        for wrapper in &mut self.wrappers {
            upper_bound = wrapper.grow_nonrec(upper_bound)?;
            upper_bound -= wrapper.offset()?;
        }
        self.fs.grow_nonrec(upper_bound)?;
        Ok(())
    }

    /// Shrink the stack so that everything fits in [0, pos) of the outer
    /// device, innermost-first: the filesystem must contract before the
    /// wrappers around it may.
    pub fn stack_reserve_end_area(&mut self, pos: u64) -> ShiftResult<()> {
        let fssize = self.fs.fssize()?;
        let inner_pos = align_down(pos - self.overhead()?, self.fs.block_size());
        let fstype = self.fs.vfstype();

        if fssize > inner_pos {
            if self.fs.can_shrink() {
                info!(
                    "will shrink the filesystem ({}) by {} bytes",
                    fstype,
                    fssize - inner_pos
                );
            } else {
                return Err(ShiftError::CantShrink(format!(
                    "can't shrink filesystem ({}), but need another {} bytes at the end",
                    fstype,
                    fssize - inner_pos
                )));
            }
        } else {
            info!(
                "the filesystem ({}) leaves enough room, no need to shrink it",
                fstype
            );
        }

        // Even when the filesystem already fits, the wrapper layers
        // must record the new end position.
        let positions = self.iter_pos(pos)?;
        let fs_pos = *positions.last().expect("iter_pos returns wrappers + 1 entries");
        self.fs.reserve_end_area_nonrec(fs_pos)?;
        for (wrapper, wrapper_pos) in self
            .wrappers
            .iter_mut()
            .zip(positions)
            .rev()
        {
            wrapper.reserve_end_area_nonrec(wrapper_pos)?;
        }
        Ok(())
    }

    /// Tear containers down innermost-outward and salt the earth: the
    /// stack's devpaths are all obsolete afterwards.
    pub fn deactivate(mut self) -> ShiftResult<()> {
        for wrapper in self.wrappers.iter_mut().rev() {
            wrapper.deactivate()?;
        }
        Ok(())
    }
}

/// Classify the device's superblock and walk downward through container
/// layers until a filesystem is reached.
pub fn get_block_stack(device: BlockDevice) -> ShiftResult<BlockStack> {
    let mut wrappers = Vec::new();
    let mut device = device;

    loop {
        let mut dev = device;
        let superblock_type = dev.superblock_type()?;

        if superblock_type.as_deref() == Some("crypto_LUKS") {
            let mut wrapper = Luks::new(dev);
            wrapper.read_superblock()?;
            let cleartext = wrapper.cleartext_device()?;
            wrappers.push(Container::Luks(wrapper));
            device = cleartext;
            continue;
        }

        if dev.has_bcache_superblock()? {
            let mut wrapper = BcacheBacking::new(dev);
            wrapper.read_superblock()?;
            if !wrapper.is_backing() {
                return Err(ShiftError::UnsupportedSuperblock {
                    device: wrapper.device().devpath().to_owned(),
                    details: "bcache device isn't a backing device".to_owned(),
                });
            }
            let cached = wrapper.cached_device()?;
            wrappers.push(Container::Bcache(wrapper));
            device = cached;
            continue;
        }

        let devpath = dev.devpath().to_owned();
        return match superblock_type {
            Some(ref sbtype) => match Filesystem::from_superblock_type(dev, sbtype) {
                Some(fs) => Ok(BlockStack::new(wrappers, fs)),
                None => Err(ShiftError::UnsupportedSuperblock {
                    device: devpath,
                    details: format!("unsupported superblock type: {}", sbtype),
                }),
            },
            None => Err(ShiftError::UnsupportedSuperblock {
                device: devpath,
                details: "unrecognised superblock".to_owned(),
            }),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{bcache::BcacheBacking, luks::Luks};

    fn sample_stack() -> BlockStack {
        let luks = Luks::with_offset(BlockDevice::new("/dev/test-outer"), 2 * 1024 * 1024);
        let bcache = BcacheBacking::with_offset(BlockDevice::new("/dev/test-mid"), 8192);
        let fs = Filesystem::from_superblock_type(BlockDevice::new("/dev/test-inner"), "ext4")
            .expect("ext4 is supported");
        BlockStack::new(
            vec![Container::Luks(luks), Container::Bcache(bcache)],
            fs,
        )
    }

    #[test]
    fn test_overhead() {
        let stack = sample_stack();
        assert_eq!(stack.overhead().unwrap(), 2 * 1024 * 1024 + 8192);
    }

    #[test]
    fn test_iter_pos_subtracts_cumulatively() {
        let stack = sample_stack();
        let outer = 100 * 1024 * 1024;
        let positions = stack.iter_pos(outer).unwrap();
        assert_eq!(
            positions,
            vec![
                outer,
                outer - 2 * 1024 * 1024,
                outer - 2 * 1024 * 1024 - 8192,
            ]
        );
    }

    #[test]
    fn test_iter_pos_no_wrappers() {
        let fs = Filesystem::from_superblock_type(BlockDevice::new("/dev/test"), "ext4").unwrap();
        let stack = BlockStack::new(Vec::new(), fs);
        assert_eq!(stack.iter_pos(4096).unwrap(), vec![4096]);
        assert_eq!(stack.overhead().unwrap(), 0);
    }
}
