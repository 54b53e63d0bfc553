// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, ffi::OsString, fmt, io, num, path::PathBuf, str};

pub type ShiftResult<T> = Result<T, ShiftError>;

#[derive(Debug)]
pub enum ShiftError {
    Msg(String),
    /// The device probe found nothing recognizable, or a superblock
    /// version outside the accepted set.
    UnsupportedSuperblock {
        device: PathBuf,
        details: String,
    },
    /// A recognized layout this tool refuses to edit, e.g. an LVM
    /// segment that is not linear single-stripe.
    UnsupportedLayout(String),
    /// The filesystem is full or of a kind that cannot shrink.
    CantShrink(String),
    /// Space before a partition is occupied by another partition.
    OverlappingPartition(String),
    /// A required external tool is not installed.
    MissingRequirement {
        cmd: String,
        pkg: String,
    },
    /// An exclusive open was refused; the device is held by a mount or
    /// another process.
    DeviceBusy(PathBuf),
    /// A spawned utility exited non-zero.
    Command {
        argv: Vec<OsString>,
        status: Option<i32>,
        stderr: String,
    },

    Io(io::Error),
    Nix(nix::Error),
    Dm(devicemapper::DmError),
    Uuid(uuid::Error),
    Serde(serde_json::Error),
    Utf8(str::Utf8Error),
    ParseInt(num::ParseIntError),
}

impl fmt::Display for ShiftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ShiftError::Msg(ref s) => write!(f, "{}", s),
            ShiftError::UnsupportedSuperblock {
                ref device,
                ref details,
            } => write!(
                f,
                "unsupported superblock on {}: {}",
                device.display(),
                details
            ),
            ShiftError::UnsupportedLayout(ref s) => write!(f, "unsupported layout: {}", s),
            ShiftError::CantShrink(ref s) => write!(f, "can't shrink: {}", s),
            ShiftError::OverlappingPartition(ref s) => {
                write!(f, "overlapping partition: {}", s)
            }
            ShiftError::MissingRequirement { ref cmd, ref pkg } => write!(
                f,
                "command '{}' not found, please install the {} package",
                cmd, pkg
            ),
            ShiftError::DeviceBusy(ref dev) => {
                write!(f, "device {} is in use", dev.display())
            }
            ShiftError::Command {
                ref argv,
                status,
                ref stderr,
            } => {
                let rendered = argv
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join(" ");
                match status {
                    Some(code) => write!(
                        f,
                        "command '{}' failed with status {}: {}",
                        rendered, code, stderr
                    ),
                    None => write!(f, "command '{}' killed by signal: {}", rendered, stderr),
                }
            }
            ShiftError::Io(ref err) => write!(f, "IO error: {}", err),
            ShiftError::Nix(ref err) => write!(f, "Nix error: {}", err),
            ShiftError::Dm(ref err) => write!(f, "DM error: {}", err),
            ShiftError::Uuid(ref err) => write!(f, "Uuid error: {}", err),
            ShiftError::Serde(ref err) => write!(f, "Serde error: {}", err),
            ShiftError::Utf8(ref err) => write!(f, "Utf8 error: {}", err),
            ShiftError::ParseInt(ref err) => write!(f, "integer parse error: {}", err),
        }
    }
}

impl Error for ShiftError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            ShiftError::Io(ref err) => Some(err),
            ShiftError::Nix(ref err) => Some(err),
            ShiftError::Dm(ref err) => Some(err),
            ShiftError::Uuid(ref err) => Some(err),
            ShiftError::Serde(ref err) => Some(err),
            ShiftError::Utf8(ref err) => Some(err),
            ShiftError::ParseInt(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ShiftError {
    fn from(err: io::Error) -> ShiftError {
        ShiftError::Io(err)
    }
}

impl From<nix::Error> for ShiftError {
    fn from(err: nix::Error) -> ShiftError {
        ShiftError::Nix(err)
    }
}

impl From<devicemapper::DmError> for ShiftError {
    fn from(err: devicemapper::DmError) -> ShiftError {
        ShiftError::Dm(err)
    }
}

impl From<uuid::Error> for ShiftError {
    fn from(err: uuid::Error) -> ShiftError {
        ShiftError::Uuid(err)
    }
}

impl From<serde_json::Error> for ShiftError {
    fn from(err: serde_json::Error) -> ShiftError {
        ShiftError::Serde(err)
    }
}

impl From<str::Utf8Error> for ShiftError {
    fn from(err: str::Utf8Error) -> ShiftError {
        ShiftError::Utf8(err)
    }
}

impl From<num::ParseIntError> for ShiftError {
    fn from(err: num::ParseIntError) -> ShiftError {
        ShiftError::ParseInt(err)
    }
}
