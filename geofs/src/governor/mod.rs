//! The governor: code admission and audit.
//!
//! Every executable payload is evaluated against the constitution before
//! it may run: its declared capability vector is screened for
//! destructive capabilities and its bytes are scanned against the
//! destructive-pattern table. Evaluation is side-effect free; `submit`
//! couples it with a durable audit record written into the geology, and
//! a decision without its record is not actionable. Because the store
//! never deletes, no later payload can truncate the trail.

mod policy;
mod record;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::digest::ContentDigest;
use crate::errors::{GeofsError, GeofsResult};
use crate::views::ViewId;
use crate::volume::Volume;

pub use policy::{Capability, PatternRule, PatternTable};
pub use record::{AuditRecord, DecisionKind};

/// Reserved audit subtree in the volume namespace.
pub const AUDIT_PREFIX: &str = "/governor/audit";

/// The versioned policy asset.
pub const POLICY_PATH: &str = "/governor/policy/patterns";

/// Outcome of evaluating one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Run, with the intersection of the request and the allow-list.
    Approve { granted: Capability },
    /// Never run.
    Decline { reason: DeclineReason },
    /// Run the substitute instead of the submitted bytes.
    Modify { substitute: Vec<u8> },
}

impl Decision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::Approve { .. } => DecisionKind::Approve,
            Decision::Decline { .. } => DecisionKind::Decline,
            Decision::Modify { .. } => DecisionKind::Modify,
        }
    }
}

/// Why a payload was declined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclineReason {
    /// The capability vector declares a destructive capability.
    ForbiddenCapability,
    /// A destructive byte pattern with no safe rewrite matched.
    DestructivePattern { rule: String },
}

impl DeclineReason {
    pub fn code(&self) -> &'static str {
        match self {
            DeclineReason::ForbiddenCapability => "forbidden-capability",
            DeclineReason::DestructivePattern { .. } => "destructive-pattern",
        }
    }
}

/// Pure decision function over (code bytes, pattern table, capability
/// vector). No filesystem state is consulted beyond the table passed in.
pub fn evaluate(code: &[u8], requested: Capability, table: &PatternTable) -> Decision {
    if requested.intersects(Capability::DESTRUCTIVE) {
        return Decision::Decline {
            reason: DeclineReason::ForbiddenCapability,
        };
    }

    let matches = table.scan(code);
    if !matches.is_empty() {
        if let Some(fatal) = matches.iter().find(|rule| rule.substitute.is_none()) {
            return Decision::Decline {
                reason: DeclineReason::DestructivePattern {
                    rule: fatal.name.clone(),
                },
            };
        }
        return Decision::Modify {
            substitute: table.rewrite(code),
        };
    }

    Decision::Approve {
        granted: requested & Capability::ALLOWED,
    }
}

/// A decision together with its durable record id.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub decision: Decision,
    pub record_id: u64,
}

/// The admission component. Owns no persistent state of its own; it
/// writes into the volume it was initialized with.
pub struct Governor {
    volume: Volume,
    table: RwLock<PatternTable>,
    next_record: AtomicU64,
    /// Latest record id per code digest, for citing re-submissions.
    last_seen: Mutex<HashMap<ContentDigest, u64>>,
}

impl Governor {
    /// Initialize against a volume. On first boot the builtin pattern
    /// table is installed at the policy path and sealed; on later boots
    /// the policy and the audit high-water mark are reloaded.
    pub fn init(volume: Volume) -> GeofsResult<Self> {
        let table = match volume.read(POLICY_PATH) {
            Ok(bytes) => PatternTable::decode(&bytes)?,
            Err(GeofsError::NotFound(_)) => {
                let table = PatternTable::builtin();
                volume.write(POLICY_PATH, &table.encode())?;
                volume.snapshot("governor-policy-v1")?;
                tracing::info!(rules = table.rules().len(), "installed builtin policy");
                table
            }
            Err(e) => return Err(e),
        };

        let mut next_record = 1u64;
        let mut last_seen = HashMap::new();
        match volume.list(AUDIT_PREFIX) {
            Ok(entries) => {
                for (name, _) in entries {
                    let bytes = volume.read(&format!("{AUDIT_PREFIX}/{name}"))?;
                    let record = AuditRecord::decode(&bytes)?;
                    next_record = next_record.max(record.id + 1);
                    let slot = last_seen.entry(record.code_digest).or_insert(record.id);
                    *slot = (*slot).max(record.id);
                }
            }
            Err(GeofsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        tracing::debug!(next_record, "governor initialized");

        Ok(Self {
            volume,
            table: RwLock::new(table),
            next_record: AtomicU64::new(next_record),
            last_seen: Mutex::new(last_seen),
        })
    }

    /// Evaluate without recording. Side-effect free.
    pub fn evaluate(&self, code: &[u8], requested: Capability) -> Decision {
        evaluate(code, requested, &self.table.read())
    }

    /// Evaluate and persist the audit record. The decision is returned
    /// only once the record is durable; on a record failure the caller
    /// must treat the code as declined.
    pub fn submit(
        &self,
        code: &[u8],
        requested: Capability,
        actor: &str,
    ) -> GeofsResult<Submission> {
        let decision = self.evaluate(code, requested);
        let code_digest = ContentDigest::compute(code);
        let id = self.next_record.fetch_add(1, Ordering::SeqCst);
        let prior = self.last_seen.lock().get(&code_digest).copied();

        let (granted, reason) = match &decision {
            Decision::Approve { granted } => (*granted, String::new()),
            Decision::Decline { reason } => (Capability::empty(), reason.code().to_string()),
            Decision::Modify { .. } => (
                requested & Capability::ALLOWED,
                "destructive-pattern rewritten".to_string(),
            ),
        };

        let record = AuditRecord {
            id,
            decision: decision.kind(),
            code_digest,
            requested,
            granted,
            reason,
            created: chrono::Utc::now(),
            actor: actor.to_string(),
            prior,
        };

        self.volume
            .write(&Self::record_path(id), &record.encode())?;
        self.last_seen.lock().insert(code_digest, id);

        tracing::info!(
            record = id,
            decision = decision.kind().as_str(),
            digest = %code_digest,
            actor,
            "recorded governor decision"
        );

        Ok(Submission {
            decision,
            record_id: id,
        })
    }

    /// Audit records in id order, read back through the ordinary
    /// volume API.
    pub fn records(&self) -> GeofsResult<Vec<AuditRecord>> {
        let entries = match self.volume.list(AUDIT_PREFIX) {
            Ok(entries) => entries,
            Err(GeofsError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut records = Vec::with_capacity(entries.len());
        for (name, _) in entries {
            let bytes = self.volume.read(&format!("{AUDIT_PREFIX}/{name}"))?;
            records.push(AuditRecord::decode(&bytes)?);
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Replace the pattern table. The new policy is written and sealed
    /// as its own view, so earlier evaluations remain reproducible.
    pub fn install_policy(&self, table: PatternTable, label: &str) -> GeofsResult<ViewId> {
        self.volume.write(POLICY_PATH, &table.encode())?;
        let view = self.volume.snapshot(label)?;
        *self.table.write() = table;
        tracing::info!(view = %view, label, "installed new policy");
        Ok(view)
    }

    fn record_path(id: u64) -> String {
        format!("{AUDIT_PREFIX}/{id:08}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn governor() -> (tempfile::TempDir, Volume, Governor) {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path().join("vol")).unwrap();
        let gov = Governor::init(volume.clone()).unwrap();
        (dir, volume, gov)
    }

    #[test]
    fn test_policy_asset_installed_on_first_boot() {
        let (_dir, volume, _gov) = governor();
        let bytes = volume.read(POLICY_PATH).unwrap();
        let table = PatternTable::decode(&bytes).unwrap();
        assert_eq!(table, PatternTable::builtin());
        // installation sealed its own view
        assert!(volume.list_views().iter().any(|r| r.label == "governor-policy-v1"));
    }

    #[test]
    fn test_clean_payload_approved_with_intersection() {
        let (_dir, _volume, gov) = governor();
        let requested = Capability::STORAGE_READ | Capability::SNAPSHOT;
        match gov.evaluate(b"fn main() { read_things() }", requested) {
            Decision::Approve { granted } => assert_eq!(granted, requested),
            other => panic!("expected approve, got {other:?}"),
        }
    }

    #[test]
    fn test_forbidden_capability_declined() {
        let (_dir, _volume, gov) = governor();
        let decision = gov.evaluate(b"innocent bytes", Capability::STORAGE_READ | Capability::KILL);
        match decision {
            Decision::Decline { reason } => {
                assert_eq!(reason.code(), "forbidden-capability");
            }
            other => panic!("expected decline, got {other:?}"),
        }
    }

    #[test]
    fn test_destructive_pattern_declined() {
        let (_dir, _volume, gov) = governor();
        let decision = gov.evaluate(b"system(\"rmdir(target)\")", Capability::STORAGE_READ);
        match decision {
            Decision::Decline { reason } => {
                assert_eq!(reason.code(), "destructive-pattern");
            }
            other => panic!("expected decline, got {other:?}"),
        }
    }

    #[test]
    fn test_rewritable_pattern_modified() {
        let (_dir, _volume, gov) = governor();
        match gov.evaluate(b"unlink(victim)", Capability::STORAGE_WRITE) {
            Decision::Modify { substitute } => {
                assert_eq!(substitute, b"hide_path(victim)");
            }
            other => panic!("expected modify, got {other:?}"),
        }
    }

    #[test]
    fn test_mixed_patterns_decline_wins() {
        let (_dir, _volume, gov) = governor();
        // one rewritable and one fatal pattern: the fatal one decides
        match gov.evaluate(b"unlink(a); kill(b)", Capability::empty()) {
            Decision::Decline { reason } => assert_eq!(reason.code(), "destructive-pattern"),
            other => panic!("expected decline, got {other:?}"),
        }
    }

    #[test]
    fn test_submit_writes_durable_record() {
        let (_dir, volume, gov) = governor();
        let code = b"truncate(everything)";
        let digest = ContentDigest::compute(code);

        let submission = gov.submit(code, Capability::STORAGE_READ, "tester").unwrap();
        assert_eq!(submission.decision.kind(), DecisionKind::Decline);

        let listed = volume.list(AUDIT_PREFIX).unwrap();
        assert_eq!(listed.len(), 1);
        let record =
            AuditRecord::decode(&volume.read(&format!("{AUDIT_PREFIX}/{}", listed[0].0)).unwrap())
                .unwrap();
        assert_eq!(record.decision, DecisionKind::Decline);
        assert_eq!(record.code_digest, digest);
        assert_eq!(record.reason, "destructive-pattern");
        assert_eq!(record.prior, None);
    }

    #[test]
    fn test_resubmission_gets_fresh_record_citing_prior() {
        let (_dir, _volume, gov) = governor();
        let code = b"truncate(everything)";

        let first = gov.submit(code, Capability::empty(), "tester").unwrap();
        let second = gov.submit(code, Capability::empty(), "tester").unwrap();
        assert_ne!(first.record_id, second.record_id);

        let records = gov.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].prior, Some(first.record_id));
        assert_eq!(records[0].code_digest, records[1].code_digest);
    }

    #[test]
    fn test_audit_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("vol");
        let first_id;
        let code = b"kill(process)";
        {
            let volume = Volume::create(&root).unwrap();
            let gov = Governor::init(volume.clone()).unwrap();
            first_id = gov.submit(code, Capability::empty(), "boot-1").unwrap().record_id;
            // make the audit write durable before the "crash"
            volume.snapshot("audit-flush").unwrap();
        }
        {
            let volume = Volume::open(&root).unwrap();
            let gov = Governor::init(volume).unwrap();
            let again = gov.submit(code, Capability::empty(), "boot-2").unwrap();
            assert!(again.record_id > first_id);
            let records = gov.records().unwrap();
            assert_eq!(records.last().unwrap().prior, Some(first_id));
        }
    }

    #[test]
    fn test_install_policy_seals_new_view() {
        let (_dir, volume, gov) = governor();
        let views_before = volume.list_views().len();
        let table = PatternTable::new(vec![PatternRule {
            name: "purge-verb".to_string(),
            pattern: b"purge(".to_vec(),
            substitute: None,
        }]);
        gov.install_policy(table, "governor-policy-v2").unwrap();
        assert_eq!(volume.list_views().len(), views_before + 1);

        // old pattern set no longer applies, new one does
        match gov.evaluate(b"unlink(x)", Capability::empty()) {
            Decision::Approve { .. } => {}
            other => panic!("expected approve under new policy, got {other:?}"),
        }
        match gov.evaluate(b"purge(x)", Capability::empty()) {
            Decision::Decline { .. } => {}
            other => panic!("expected decline under new policy, got {other:?}"),
        }
    }

    #[test]
    fn test_audit_readable_through_plain_read() {
        let (_dir, volume, gov) = governor();
        gov.submit(b"plain payload", Capability::STORAGE_READ, "tester")
            .unwrap();
        // the subtree is ordinary namespace: list + read work unprivileged
        let names: Vec<String> = volume
            .list("/governor/audit")
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].parse::<u64>().is_ok());
    }
}
