//! The view graph: immutable named snapshots ("strata") with parent links.
//!
//! View ids are 64-bit, strictly increasing within a volume, never
//! reused. A sealed view never changes; the only mutation the graph
//! permits is appending a newly sealed view whose parent is already
//! sealed. `views/index` holds a tagged header (format version + digest
//! algorithm) followed by one record per sealed view in creation order.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};

use crate::codec::{
    self, PayloadReader, PayloadWriter, RecordIter, TAG_INDEX_HEADER, TAG_VIEW_RECORD,
};
use crate::digest::DIGEST_ALGORITHM;
use crate::errors::{GeofsError, GeofsResult};
use crate::refs::{Delta, DeltaLookup, RefEntry};

/// On-disk index format version.
pub const INDEX_FORMAT_VERSION: u32 = 1;

const INDEX_MAGIC: &str = "geology-index";

/// Sentinel parent id for the root view in the on-disk encoding.
const NO_PARENT: u64 = u64::MAX;

/// Identifier of a view, monotonic within its volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewId(pub u64);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Metadata of one sealed view.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRecord {
    pub id: ViewId,
    pub parent: Option<ViewId>,
    pub label: String,
    pub created: DateTime<Utc>,
}

/// A sealed view: its record plus the delta and hide set captured at
/// seal time.
#[derive(Debug, Clone)]
pub struct SealedView {
    pub record: ViewRecord,
    pub delta: Delta,
}

/// Append-only arena of sealed views keyed by id.
#[derive(Default)]
pub struct ViewGraph {
    views: BTreeMap<u64, SealedView>,
    /// Creation order; parallel to the index file.
    order: Vec<ViewId>,
}

impl ViewGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: ViewId) -> bool {
        self.views.contains_key(&id.0)
    }

    pub fn get(&self, id: ViewId) -> GeofsResult<&SealedView> {
        self.views
            .get(&id.0)
            .ok_or_else(|| GeofsError::not_found(format!("view {id}")))
    }

    pub fn parent_of(&self, id: ViewId) -> GeofsResult<Option<ViewId>> {
        Ok(self.get(id)?.record.parent)
    }

    /// Sealed views in creation order.
    pub fn records(&self) -> impl Iterator<Item = &ViewRecord> {
        self.order.iter().map(|id| &self.views[&id.0].record)
    }

    pub fn len(&self) -> u64 {
        self.order.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Highest id ever sealed, if any.
    pub fn max_id(&self) -> Option<ViewId> {
        self.views.keys().next_back().copied().map(ViewId)
    }

    /// Append a freshly sealed view. The id must be new and greater than
    /// every sealed id, and the parent (if any) must already be sealed.
    pub fn append(&mut self, view: SealedView) -> GeofsResult<()> {
        let id = view.record.id;
        if self.contains(id) {
            return Err(GeofsError::SealedView(id.0));
        }
        if let Some(max) = self.max_id() {
            if id.0 <= max.0 {
                return Err(GeofsError::Corrupt(format!(
                    "view id {id} is not greater than sealed maximum {max}"
                )));
            }
        }
        if let Some(parent) = view.record.parent {
            if !self.contains(parent) {
                return Err(GeofsError::Corrupt(format!(
                    "view {id} names unsealed parent {parent}"
                )));
            }
        }
        self.views.insert(id.0, view);
        self.order.push(id);
        Ok(())
    }

    /// Resolve `path` at sealed view `at`, walking the parent chain.
    /// A hide at any level stops the walk with not-found.
    pub fn resolve(&self, at: ViewId, path: &str) -> GeofsResult<Option<RefEntry>> {
        let mut cursor = Some(at);
        while let Some(id) = cursor {
            let view = self.get(id)?;
            match view.delta.lookup(path) {
                DeltaLookup::Entry(entry) => return Ok(Some(entry.clone())),
                DeltaLookup::Hidden => return Ok(None),
                DeltaLookup::Absent => cursor = view.record.parent,
            }
        }
        Ok(None)
    }

    /// Chain of deltas from `at` back to the root, nearest first.
    pub fn chain(&self, at: ViewId) -> GeofsResult<Vec<&Delta>> {
        let mut out = Vec::new();
        let mut cursor = Some(at);
        while let Some(id) = cursor {
            let view = self.get(id)?;
            out.push(&view.delta);
            cursor = view.record.parent;
        }
        Ok(out)
    }

    /// Total ref entries recorded across all sealed deltas.
    pub fn total_entries(&self) -> u64 {
        self.views.values().map(|v| v.delta.entry_count()).sum()
    }

    /// Sum of entry sizes across all sealed deltas.
    pub fn total_logical_bytes(&self) -> u64 {
        self.views.values().map(|v| v.delta.logical_bytes()).sum()
    }

    /// Serialize the index: header record, then view records in creation
    /// order.
    pub fn encode_index(&self) -> Vec<u8> {
        self.encode_records(self.records())
    }

    /// Serialize the index with one not-yet-appended record at the end.
    /// Used at seal time so the graph mutates only after the index is
    /// durable.
    pub fn encode_index_with(&self, extra: &ViewRecord) -> Vec<u8> {
        self.encode_records(self.records().chain(std::iter::once(extra)))
    }

    fn encode_records<'a>(&self, records: impl Iterator<Item = &'a ViewRecord>) -> Vec<u8> {
        let mut out = Vec::new();

        let mut header = PayloadWriter::new();
        header
            .put_str(INDEX_MAGIC)
            .put_u32(INDEX_FORMAT_VERSION)
            .put_str(DIGEST_ALGORITHM);
        codec::write_record(&mut out, TAG_INDEX_HEADER, &header.finish());

        for record in records {
            let mut payload = PayloadWriter::new();
            payload
                .put_u64(record.id.0)
                .put_u64(record.parent.map(|p| p.0).unwrap_or(NO_PARENT))
                .put_str(&record.label)
                .put_i64(record.created.timestamp_millis());
            codec::write_record(&mut out, TAG_VIEW_RECORD, &payload.finish());
        }
        out
    }

    /// Decode the index file into the ordered record list. Delta bodies
    /// are loaded separately by the volume.
    pub fn decode_index(bytes: &[u8]) -> GeofsResult<Vec<ViewRecord>> {
        let mut iter = RecordIter::new(bytes);

        let Some((tag, payload)) = iter.next_record()? else {
            return Err(GeofsError::Corrupt("index file is empty".to_string()));
        };
        if tag != TAG_INDEX_HEADER {
            return Err(GeofsError::Corrupt(format!(
                "index does not start with a header record (tag {tag:#04x})"
            )));
        }
        let mut header = PayloadReader::new(payload);
        let magic = header.take_str()?;
        if magic != INDEX_MAGIC {
            return Err(GeofsError::Corrupt(format!("bad index magic {magic:?}")));
        }
        let version = header.take_u32()?;
        if version != INDEX_FORMAT_VERSION {
            return Err(GeofsError::Corrupt(format!(
                "unsupported index format version {version}"
            )));
        }
        let algorithm = header.take_str()?;
        if algorithm != DIGEST_ALGORITHM {
            return Err(GeofsError::Corrupt(format!(
                "volume was written with digest algorithm {algorithm:?}, \
                 this engine uses {DIGEST_ALGORITHM:?}"
            )));
        }

        let mut records = Vec::new();
        while let Some((tag, payload)) = iter.next_record()? {
            if tag != TAG_VIEW_RECORD {
                return Err(GeofsError::Corrupt(format!(
                    "unexpected tag {tag:#04x} in index"
                )));
            }
            let mut r = PayloadReader::new(payload);
            let id = ViewId(r.take_u64()?);
            let parent_raw = r.take_u64()?;
            let parent = (parent_raw != NO_PARENT).then_some(ViewId(parent_raw));
            let label = r.take_str()?.to_string();
            let created_millis = r.take_i64()?;
            let created = Utc
                .timestamp_millis_opt(created_millis)
                .single()
                .ok_or_else(|| {
                    GeofsError::Corrupt(format!("created {created_millis} out of range"))
                })?;
            records.push(ViewRecord {
                id,
                parent,
                label,
                created,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::ContentDigest;

    fn sealed(id: u64, parent: Option<u64>, label: &str, delta: Delta) -> SealedView {
        SealedView {
            record: ViewRecord {
                id: ViewId(id),
                parent: parent.map(ViewId),
                label: label.to_string(),
                created: Utc::now(),
            },
            delta,
        }
    }

    fn entry(content: &[u8]) -> RefEntry {
        RefEntry::file(ContentDigest::compute(content), content.len() as u64)
    }

    #[test]
    fn test_append_and_parent_chain() {
        let mut graph = ViewGraph::new();
        graph.append(sealed(0, None, "bedrock", Delta::new())).unwrap();
        graph.append(sealed(1, Some(0), "v1", Delta::new())).unwrap();
        graph.append(sealed(2, Some(1), "v2", Delta::new())).unwrap();

        assert_eq!(graph.parent_of(ViewId(2)).unwrap(), Some(ViewId(1)));
        assert_eq!(graph.parent_of(ViewId(1)).unwrap(), Some(ViewId(0)));
        assert_eq!(graph.parent_of(ViewId(0)).unwrap(), None);
        let order: Vec<u64> = graph.records().map(|r| r.id.0).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_id_reuse_rejected() {
        let mut graph = ViewGraph::new();
        graph.append(sealed(0, None, "bedrock", Delta::new())).unwrap();
        assert!(matches!(
            graph.append(sealed(0, None, "again", Delta::new())),
            Err(GeofsError::SealedView(0))
        ));
    }

    #[test]
    fn test_unsealed_parent_rejected() {
        let mut graph = ViewGraph::new();
        graph.append(sealed(0, None, "bedrock", Delta::new())).unwrap();
        assert!(graph.append(sealed(5, Some(3), "orphan", Delta::new())).is_err());
    }

    #[test]
    fn test_resolution_walks_parents() {
        let mut graph = ViewGraph::new();
        let mut d0 = Delta::new();
        d0.insert("/a".into(), entry(b"one"));
        graph.append(sealed(0, None, "bedrock", d0)).unwrap();
        graph.append(sealed(1, Some(0), "v1", Delta::new())).unwrap();

        let found = graph.resolve(ViewId(1), "/a").unwrap().unwrap();
        assert_eq!(found.digest, ContentDigest::compute(b"one"));
    }

    #[test]
    fn test_hide_stops_resolution_for_descendants() {
        let mut graph = ViewGraph::new();
        let mut d0 = Delta::new();
        d0.insert("/x".into(), entry(b"one"));
        graph.append(sealed(0, None, "bedrock", d0)).unwrap();

        let mut d1 = Delta::new();
        d1.hide("/x".into());
        graph.append(sealed(1, Some(0), "hidden", d1)).unwrap();
        graph.append(sealed(2, Some(1), "later", Delta::new())).unwrap();

        // ancestor unaffected, descendant chain sees not-found
        assert!(graph.resolve(ViewId(0), "/x").unwrap().is_some());
        assert!(graph.resolve(ViewId(1), "/x").unwrap().is_none());
        assert!(graph.resolve(ViewId(2), "/x").unwrap().is_none());
    }

    #[test]
    fn test_reintroduction_after_hide() {
        let mut graph = ViewGraph::new();
        let mut d0 = Delta::new();
        d0.insert("/x".into(), entry(b"one"));
        graph.append(sealed(0, None, "bedrock", d0)).unwrap();
        let mut d1 = Delta::new();
        d1.hide("/x".into());
        graph.append(sealed(1, Some(0), "hidden", d1)).unwrap();
        let mut d2 = Delta::new();
        d2.insert("/x".into(), entry(b"two"));
        graph.append(sealed(2, Some(1), "back", d2)).unwrap();

        let found = graph.resolve(ViewId(2), "/x").unwrap().unwrap();
        assert_eq!(found.digest, ContentDigest::compute(b"two"));
    }

    #[test]
    fn test_index_round_trip() {
        let mut graph = ViewGraph::new();
        graph.append(sealed(0, None, "bedrock", Delta::new())).unwrap();
        graph.append(sealed(1, Some(0), "first light", Delta::new())).unwrap();

        let encoded = graph.encode_index();
        let records = ViewGraph::decode_index(&encoded).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, ViewId(0));
        assert_eq!(records[1].parent, Some(ViewId(0)));
        assert_eq!(records[1].label, "first light");
    }

    #[test]
    fn test_index_rejects_wrong_header() {
        let mut buf = Vec::new();
        crate::codec::write_record(&mut buf, TAG_VIEW_RECORD, b"");
        assert!(matches!(
            ViewGraph::decode_index(&buf),
            Err(GeofsError::Corrupt(_))
        ));
        assert!(matches!(
            ViewGraph::decode_index(b""),
            Err(GeofsError::Corrupt(_))
        ));
    }
}
