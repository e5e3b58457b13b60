//! Ref entries and per-view deltas.
//!
//! A ref entry binds a path within a view to a content digest plus
//! metadata. Entries are immutable; "changing a file" records a new entry
//! in a new view. Each view physically holds a delta (entries written at
//! that view) and a hide set (paths present in an ancestor but absent
//! from this view on).

use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;
use chrono::{DateTime, TimeZone, Utc};

use crate::codec::{self, PayloadReader, PayloadWriter, RecordIter, TAG_REF_ENTRY};
use crate::digest::ContentDigest;
use crate::errors::{GeofsError, GeofsResult};

/// What a ref entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    File,
    Directory,
    Symlink,
    Device,
}

impl RefKind {
    pub fn as_u8(self) -> u8 {
        match self {
            RefKind::File => 0,
            RefKind::Directory => 1,
            RefKind::Symlink => 2,
            RefKind::Device => 3,
        }
    }

    pub fn from_u8(raw: u8) -> GeofsResult<Self> {
        Ok(match raw {
            0 => RefKind::File,
            1 => RefKind::Directory,
            2 => RefKind::Symlink,
            3 => RefKind::Device,
            other => {
                return Err(GeofsError::Corrupt(format!(
                    "unknown ref kind {other:#04x}"
                )));
            }
        })
    }
}

bitflags! {
    /// Advisory per-entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RefFlags: u32 {
        /// Entry is an executable payload.
        const EXECUTABLE = 1 << 0;
        /// Entry was produced by the governor's audit path.
        const AUDIT = 1 << 1;
    }
}

/// The binding from a path to content at one view.
#[derive(Debug, Clone, PartialEq)]
pub struct RefEntry {
    pub kind: RefKind,
    pub digest: ContentDigest,
    pub size: u64,
    /// Advisory wall-clock hint; never authoritative for ordering.
    pub mtime: DateTime<Utc>,
    pub flags: RefFlags,
}

impl RefEntry {
    pub fn file(digest: ContentDigest, size: u64) -> Self {
        Self {
            kind: RefKind::File,
            digest,
            size,
            mtime: Utc::now(),
            flags: RefFlags::empty(),
        }
    }

    pub fn directory() -> Self {
        Self {
            kind: RefKind::Directory,
            digest: ContentDigest::empty(),
            size: 0,
            mtime: Utc::now(),
            flags: RefFlags::empty(),
        }
    }

    pub fn symlink(digest: ContentDigest, size: u64) -> Self {
        Self {
            kind: RefKind::Symlink,
            digest,
            size,
            mtime: Utc::now(),
            flags: RefFlags::empty(),
        }
    }
}

/// Outcome of probing a single delta for a path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeltaLookup<'a> {
    /// Path written at this view.
    Entry(&'a RefEntry),
    /// Path hidden at this view; resolution stops with not-found.
    Hidden,
    /// This view says nothing; consult the parent.
    Absent,
}

/// The mutable body of one view: entries written here plus the hide set.
///
/// Within a single view the hide set and the entry map are disjoint: a
/// hide erases an entry written earlier in the same view, and a write
/// lifts an earlier hide.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    entries: BTreeMap<String, RefEntry>,
    hidden: BTreeSet<String>,
}

impl Delta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: String, entry: RefEntry) {
        self.hidden.remove(&path);
        self.entries.insert(path, entry);
    }

    pub fn hide(&mut self, path: String) {
        self.entries.remove(&path);
        self.hidden.insert(path);
    }

    pub fn lookup(&self, path: &str) -> DeltaLookup<'_> {
        if self.hidden.contains(path) {
            return DeltaLookup::Hidden;
        }
        match self.entries.get(path) {
            Some(entry) => DeltaLookup::Entry(entry),
            None => DeltaLookup::Absent,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.hidden.is_empty()
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Sum of entry sizes; feeds the volume's logical-byte accounting.
    pub fn logical_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &RefEntry)> {
        self.entries.iter()
    }

    pub fn hidden(&self) -> impl Iterator<Item = &String> {
        self.hidden.iter()
    }

    /// Serialize the entry map as tagged ref-entry records, ordered by
    /// path byte value.
    pub fn encode_entries(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (path, entry) in &self.entries {
            let mut payload = PayloadWriter::new();
            payload
                .put_str(path)
                .put_u8(entry.kind.as_u8())
                .put_digest(&entry.digest)
                .put_u64(entry.size)
                .put_i64(entry.mtime.timestamp_millis())
                .put_u32(entry.flags.bits());
            codec::write_record(&mut out, TAG_REF_ENTRY, &payload.finish());
        }
        out
    }

    /// The hide set, newline-separated.
    pub fn encode_hidden(&self) -> Vec<u8> {
        let mut out = String::new();
        for path in &self.hidden {
            out.push_str(path);
            out.push('\n');
        }
        out.into_bytes()
    }

    pub fn decode(entry_bytes: &[u8], hidden_bytes: &[u8]) -> GeofsResult<Self> {
        let mut delta = Delta::new();

        let mut iter = RecordIter::new(entry_bytes);
        while let Some((tag, payload)) = iter.next_record()? {
            if tag != TAG_REF_ENTRY {
                return Err(GeofsError::Corrupt(format!(
                    "unexpected tag {tag:#04x} in delta file"
                )));
            }
            let mut r = PayloadReader::new(payload);
            let path = r.take_str()?.to_string();
            let kind = RefKind::from_u8(r.take_u8()?)?;
            let digest = r.take_digest()?;
            let size = r.take_u64()?;
            let mtime_millis = r.take_i64()?;
            let flags = RefFlags::from_bits_retain(r.take_u32()?);
            let mtime = Utc
                .timestamp_millis_opt(mtime_millis)
                .single()
                .ok_or_else(|| {
                    GeofsError::Corrupt(format!("mtime {mtime_millis} out of range"))
                })?;
            delta.entries.insert(
                path,
                RefEntry {
                    kind,
                    digest,
                    size,
                    mtime,
                    flags,
                },
            );
        }

        let hidden_text = std::str::from_utf8(hidden_bytes)
            .map_err(|e| GeofsError::Corrupt(format!("hide set is not utf-8: {e}")))?;
        for line in hidden_text.lines() {
            if !line.is_empty() {
                delta.hidden.insert(line.to_string());
            }
        }

        Ok(delta)
    }
}
