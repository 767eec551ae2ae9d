/*!
 * Core Types
 * Common types used across the kernel
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID type
pub type Pid = u64;

/// Guest thread ID type
pub type Tid = u64;

/// Opaque per-process handle value
pub type Handle = u32;

/// Guest virtual address
pub type VAddr = u64;

/// Size type for guest memory operations
pub type Size = u64;

/// Thread priority (0-63, lower is more important)
pub type Priority = u8;

/// Bitmask of cores a thread may run on
pub type CoreMask = u64;

/// Common result type for kernel operations
pub type KernelResult<T> = Result<T, super::errors::KernelError>;

/// Firmware version the guest expects, packed as major.minor.micro
///
/// Command tables are built against this value so that versioned IPC
/// commands resolve to the handler the guest firmware would see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub micro: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8, micro: u8) -> Self {
        Self {
            major,
            minor,
            micro,
        }
    }

    /// Packed representation used in logs and GetInfo queries
    pub const fn packed(&self) -> u32 {
        ((self.major as u32) << 16) | ((self.minor as u32) << 8) | self.micro as u32
    }

    /// Parse a dotted version string such as "16.0.0" or "11.0"
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map(str::parse::<u8>).transpose().ok()?.unwrap_or(0);
        let micro = parts.next().map(str::parse::<u8>).transpose().ok()?.unwrap_or(0);
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, micro))
    }
}

impl Default for FirmwareVersion {
    fn default() -> Self {
        Self::new(16, 0, 0)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl Serialize for FirmwareVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FirmwareVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        FirmwareVersion::parse(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid firmware version '{}'", text)))
    }
}

/// Inclusive firmware range a versioned command is available in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionRange {
    pub min: Option<FirmwareVersion>,
    pub max: Option<FirmwareVersion>,
}

impl VersionRange {
    /// Available on every firmware
    pub const ALL: VersionRange = VersionRange {
        min: None,
        max: None,
    };

    pub const fn since(min: FirmwareVersion) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub const fn until(max: FirmwareVersion) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }

    pub const fn between(min: FirmwareVersion, max: FirmwareVersion) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn contains(&self, version: FirmwareVersion) -> bool {
        self.min.map_or(true, |min| version >= min) && self.max.map_or(true, |max| version <= max)
    }
}
