//! Audit record serialization.
//!
//! One record per decision, written into the geology and never updated.
//! Re-submission of a known code digest produces a fresh record that
//! cites the prior one.

use chrono::{DateTime, TimeZone, Utc};

use crate::codec::{self, PayloadReader, RecordIter, TAG_AUDIT_RECORD};
use crate::digest::ContentDigest;
use crate::errors::{GeofsError, GeofsResult};

use super::policy::Capability;

/// Terminal outcome kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    Approve,
    Decline,
    Modify,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionKind::Approve => "approve",
            DecisionKind::Decline => "decline",
            DecisionKind::Modify => "modify",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DecisionKind::Approve => 0,
            DecisionKind::Decline => 1,
            DecisionKind::Modify => 2,
        }
    }

    fn from_u8(raw: u8) -> GeofsResult<Self> {
        Ok(match raw {
            0 => DecisionKind::Approve,
            1 => DecisionKind::Decline,
            2 => DecisionKind::Modify,
            other => {
                return Err(GeofsError::Corrupt(format!(
                    "unknown decision kind {other}"
                )));
            }
        })
    }
}

const NO_PRIOR: u64 = u64::MAX;

/// The immutable audit record behind one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub id: u64,
    pub decision: DecisionKind,
    pub code_digest: ContentDigest,
    pub requested: Capability,
    pub granted: Capability,
    pub reason: String,
    pub created: DateTime<Utc>,
    pub actor: String,
    /// Most recent earlier record for the same code digest.
    pub prior: Option<u64>,
}

impl AuditRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = codec::PayloadWriter::new();
        payload
            .put_u64(self.id)
            .put_u8(self.decision.as_u8())
            .put_digest(&self.code_digest)
            .put_u32(self.requested.bits())
            .put_u32(self.granted.bits())
            .put_str(&self.reason)
            .put_i64(self.created.timestamp_millis())
            .put_str(&self.actor)
            .put_u64(self.prior.unwrap_or(NO_PRIOR));
        let mut out = Vec::new();
        codec::write_record(&mut out, TAG_AUDIT_RECORD, &payload.finish());
        out
    }

    pub fn decode(bytes: &[u8]) -> GeofsResult<Self> {
        let mut iter = RecordIter::new(bytes);
        let Some((tag, payload)) = iter.next_record()? else {
            return Err(GeofsError::Corrupt("empty audit record".to_string()));
        };
        if tag != TAG_AUDIT_RECORD {
            return Err(GeofsError::Corrupt(format!(
                "unexpected tag {tag:#04x} in audit record"
            )));
        }
        let mut r = PayloadReader::new(payload);
        let id = r.take_u64()?;
        let decision = DecisionKind::from_u8(r.take_u8()?)?;
        let code_digest = r.take_digest()?;
        let requested = Capability::from_bits_retain(r.take_u32()?);
        let granted = Capability::from_bits_retain(r.take_u32()?);
        let reason = r.take_str()?.to_string();
        let created_millis = r.take_i64()?;
        let created = Utc
            .timestamp_millis_opt(created_millis)
            .single()
            .ok_or_else(|| GeofsError::Corrupt(format!("created {created_millis} out of range")))?;
        let actor = r.take_str()?.to_string();
        let prior_raw = r.take_u64()?;
        Ok(Self {
            id,
            decision,
            code_digest,
            requested,
            granted,
            reason,
            created,
            actor,
            prior: (prior_raw != NO_PRIOR).then_some(prior_raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let record = AuditRecord {
            id: 7,
            decision: DecisionKind::Decline,
            code_digest: ContentDigest::compute(b"payload"),
            requested: Capability::STORAGE_WRITE | Capability::KILL,
            granted: Capability::empty(),
            reason: "forbidden-capability".to_string(),
            created: Utc::now(),
            actor: "operator".to_string(),
            prior: Some(3),
        };
        let decoded = AuditRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.decision, DecisionKind::Decline);
        assert_eq!(decoded.code_digest, record.code_digest);
        assert_eq!(decoded.requested, record.requested);
        assert_eq!(decoded.prior, Some(3));
        assert_eq!(
            decoded.created.timestamp_millis(),
            record.created.timestamp_millis()
        );
    }

    #[test]
    fn test_no_prior_round_trip() {
        let record = AuditRecord {
            id: 1,
            decision: DecisionKind::Approve,
            code_digest: ContentDigest::compute(b"ok"),
            requested: Capability::STORAGE_READ,
            granted: Capability::STORAGE_READ,
            reason: String::new(),
            created: Utc::now(),
            actor: "cli".to_string(),
            prior: None,
        };
        let decoded = AuditRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.prior, None);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(AuditRecord::decode(b"not a record").is_err());
        assert!(AuditRecord::decode(b"").is_err());
    }
}
