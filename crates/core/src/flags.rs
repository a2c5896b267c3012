//! Event and stream-creation flag sets
//!
//! Both sets are plain `u32` bit-fields whose bit values match the native
//! FSEvents constants. Values combine with `|` and are never mutated in
//! place by this module. The textual form lists every recognized bit name
//! in lexicographic order joined by `|`; unrecognized bits are ignored.

use crate::error::{Error, Result};
use bitflags::bitflags;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator used by the textual form
pub const FLAG_SEPARATOR: char = '|';

bitflags! {
    /// Kind(s) of change a record represents
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventFlags: u32 {
        /// Events were coalesced hierarchically; rescan the subtree.
        const MUST_SCAN_SUB_DIRS = 0x0000_0001;
        const USER_DROPPED = 0x0000_0002;
        const KERNEL_DROPPED = 0x0000_0004;
        /// The 64-bit event id counter wrapped around.
        const EVENT_IDS_WRAPPED = 0x0000_0008;
        /// Sentinel marking the end of a history replay.
        const HISTORY_DONE = 0x0000_0010;
        /// A directory along the watched path changed.
        const ROOT_CHANGED = 0x0000_0020;
        const MOUNT = 0x0000_0040;
        const UNMOUNT = 0x0000_0080;
        const ITEM_CREATED = 0x0000_0100;
        const ITEM_REMOVED = 0x0000_0200;
        const ITEM_INODE_META_MOD = 0x0000_0400;
        const ITEM_RENAMED = 0x0000_0800;
        const ITEM_MODIFIED = 0x0000_1000;
        const ITEM_FINDER_INFO_MOD = 0x0000_2000;
        const ITEM_CHANGE_OWNER = 0x0000_4000;
        const ITEM_XATTR_MOD = 0x0000_8000;
        const ITEM_IS_FILE = 0x0001_0000;
        const ITEM_IS_DIR = 0x0002_0000;
        const ITEM_IS_SYMLINK = 0x0004_0000;
        /// Generated by the current process (requires `MarkSelf`).
        const OWN_EVENT = 0x0008_0000;
        const ITEM_IS_HARDLINK = 0x0010_0000;
        const ITEM_IS_LAST_HARDLINK = 0x0020_0000;
        const ITEM_CLONED = 0x0040_0000;
    }
}

bitflags! {
    /// Options controlling how a native subscription is created
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CreateFlags: u32 {
        /// Accepted for completeness; paths are always decoded as C strings.
        const USE_CF_TYPES = 0x0000_0001;
        /// Deliver on the leading edge instead of after the latency window.
        const NO_DEFER = 0x0000_0002;
        /// Report changes to directories along the watched paths.
        const WATCH_ROOT = 0x0000_0004;
        /// Suppress events generated by this process.
        const IGNORE_SELF = 0x0000_0008;
        /// Report individual files instead of directories.
        const FILE_EVENTS = 0x0000_0010;
        /// Tag events generated by this process with `OwnEvent`.
        const MARK_SELF = 0x0000_0020;
        const FULL_HISTORY = 0x0000_0080;
    }
}

// Both tables are kept in lexicographic order; `to_names` relies on it.
const EVENT_FLAG_NAMES: &[(&str, u32)] = &[
    ("EventIDsWrapped", EventFlags::EVENT_IDS_WRAPPED.bits()),
    ("HistoryDone", EventFlags::HISTORY_DONE.bits()),
    ("ItemChangeOwner", EventFlags::ITEM_CHANGE_OWNER.bits()),
    ("ItemCloned", EventFlags::ITEM_CLONED.bits()),
    ("ItemCreated", EventFlags::ITEM_CREATED.bits()),
    ("ItemFinderInfoMod", EventFlags::ITEM_FINDER_INFO_MOD.bits()),
    ("ItemInodeMetaMod", EventFlags::ITEM_INODE_META_MOD.bits()),
    ("ItemIsDir", EventFlags::ITEM_IS_DIR.bits()),
    ("ItemIsFile", EventFlags::ITEM_IS_FILE.bits()),
    ("ItemIsHardlink", EventFlags::ITEM_IS_HARDLINK.bits()),
    ("ItemIsLastHardlink", EventFlags::ITEM_IS_LAST_HARDLINK.bits()),
    ("ItemIsSymlink", EventFlags::ITEM_IS_SYMLINK.bits()),
    ("ItemModified", EventFlags::ITEM_MODIFIED.bits()),
    ("ItemRemoved", EventFlags::ITEM_REMOVED.bits()),
    ("ItemRenamed", EventFlags::ITEM_RENAMED.bits()),
    ("ItemXattrMod", EventFlags::ITEM_XATTR_MOD.bits()),
    ("KernelDropped", EventFlags::KERNEL_DROPPED.bits()),
    ("Mount", EventFlags::MOUNT.bits()),
    ("MustScanSubDirs", EventFlags::MUST_SCAN_SUB_DIRS.bits()),
    ("OwnEvent", EventFlags::OWN_EVENT.bits()),
    ("RootChanged", EventFlags::ROOT_CHANGED.bits()),
    ("Unmount", EventFlags::UNMOUNT.bits()),
    ("UserDropped", EventFlags::USER_DROPPED.bits()),
];

const CREATE_FLAG_NAMES: &[(&str, u32)] = &[
    ("FileEvents", CreateFlags::FILE_EVENTS.bits()),
    ("FullHistory", CreateFlags::FULL_HISTORY.bits()),
    ("IgnoreSelf", CreateFlags::IGNORE_SELF.bits()),
    ("MarkSelf", CreateFlags::MARK_SELF.bits()),
    ("NoDefer", CreateFlags::NO_DEFER.bits()),
    ("UseCFTypes", CreateFlags::USE_CF_TYPES.bits()),
    ("WatchRoot", CreateFlags::WATCH_ROOT.bits()),
];

fn names_of(bits: u32, table: &'static [(&'static str, u32)]) -> Vec<&'static str> {
    table
        .iter()
        .filter(|(_, mask)| bits & mask != 0)
        .map(|(name, _)| *name)
        .collect()
}

fn parse_names(s: &str, table: &[(&str, u32)]) -> Result<u32> {
    let mut bits = 0;
    for name in s.split(FLAG_SEPARATOR).map(str::trim).filter(|n| !n.is_empty()) {
        let (_, mask) = table
            .iter()
            .find(|(known, _)| *known == name)
            .ok_or_else(|| Error::UnknownFlag(name.to_string()))?;
        bits |= mask;
    }
    Ok(bits)
}

fn write_names(f: &mut fmt::Formatter<'_>, names: &[&str]) -> fmt::Result {
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", FLAG_SEPARATOR)?;
        }
        f.write_str(name)?;
    }
    Ok(())
}

impl EventFlags {
    /// Wrap a raw native value, keeping unrecognized bits untouched
    pub const fn from_raw(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }

    /// Combine with `mask`, producing a new value
    #[must_use]
    pub const fn with(self, mask: Self) -> Self {
        Self::from_bits_retain(self.bits() | mask.bits())
    }

    /// True if any bit of `mask` is set
    pub const fn has(self, mask: Self) -> bool {
        self.bits() & mask.bits() != 0
    }

    /// Names of the recognized bits, lexicographically ordered
    pub fn to_names(self) -> Vec<&'static str> {
        names_of(self.bits(), EVENT_FLAG_NAMES)
    }

    /// Names joined by `|`
    pub fn render(self) -> String {
        self.to_string()
    }

    /// Inverse of [`EventFlags::render`]
    pub fn parse(s: &str) -> Result<Self> {
        parse_names(s, EVENT_FLAG_NAMES).map(Self::from_bits_retain)
    }

    /// Flags that ask the consumer to rescan rather than trust the path list
    pub const fn must_rescan(self) -> bool {
        self.has(
            Self::MUST_SCAN_SUB_DIRS
                .union(Self::USER_DROPPED)
                .union(Self::KERNEL_DROPPED)
                .union(Self::ROOT_CHANGED),
        )
    }
}

impl fmt::Display for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_names(f, &self.to_names())
    }
}

impl FromStr for EventFlags {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl CreateFlags {
    #[must_use]
    pub const fn with(self, mask: Self) -> Self {
        Self::from_bits_retain(self.bits() | mask.bits())
    }

    pub const fn has(self, mask: Self) -> bool {
        self.bits() & mask.bits() != 0
    }

    pub fn to_names(self) -> Vec<&'static str> {
        names_of(self.bits(), CREATE_FLAG_NAMES)
    }

    pub fn render(self) -> String {
        self.to_string()
    }

    pub fn parse(s: &str) -> Result<Self> {
        parse_names(s, CREATE_FLAG_NAMES).map(Self::from_bits_retain)
    }
}

impl fmt::Display for CreateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_names(f, &self.to_names())
    }
}

impl FromStr for CreateFlags {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Default for CreateFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Serialized as a list of names, e.g. `["FileEvents", "NoDefer"]`
impl Serialize for CreateFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let names = self.to_names();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for CreateFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct NamesVisitor;

        impl<'de> Visitor<'de> for NamesVisitor {
            type Value = CreateFlags;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of create flag names or a `|`-separated string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<CreateFlags, E> {
                CreateFlags::parse(v).map_err(E::custom)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<CreateFlags, A::Error> {
                let mut flags = CreateFlags::empty();
                while let Some(name) = seq.next_element::<String>()? {
                    flags = flags.with(CreateFlags::parse(&name).map_err(de::Error::custom)?);
                }
                Ok(flags)
            }
        }

        deserializer.deserialize_any(NamesVisitor)
    }
}
