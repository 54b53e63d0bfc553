// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub mod bcache;
pub mod bcache_convert;
pub mod cmd;
pub mod device;
pub mod dm;
pub mod filesystem;
pub mod luks;
pub mod lvm;
pub mod maintboot;
pub mod partition;
pub mod resize;
pub mod shared;
pub mod stack;
pub mod synth;

pub use self::{
    device::BlockDevice,
    stack::{get_block_stack, BlockStack},
};
