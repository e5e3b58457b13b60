//! The destructive-pattern table and capability vocabulary.
//!
//! The table is data, not code: a versioned asset stored in the geology
//! at the policy path, so historical evaluations stay reproducible
//! against the policy in force when they were recorded. Evaluation
//! itself is a pure function of (code bytes, table, capability vector).

use bitflags::bitflags;

use crate::codec::{self, PayloadReader, RecordIter, TAG_PATTERN_RULE};
use crate::errors::{GeofsError, GeofsResult};

bitflags! {
    /// Capabilities a payload may declare.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capability: u32 {
        const STORAGE_READ  = 1 << 0;
        const STORAGE_WRITE = 1 << 1;
        const SNAPSHOT      = 1 << 2;
        const VIEW_SWITCH   = 1 << 3;
        const DEVICE_IO     = 1 << 4;
        const PROC_READ     = 1 << 5;

        // destructive; declaring any of these is an automatic decline
        const UNLINK   = 1 << 8;
        const TRUNCATE = 1 << 9;
        const KILL     = 1 << 10;
        const ERASE    = 1 << 11;
    }
}

impl Capability {
    /// Capabilities no payload is ever granted.
    pub const DESTRUCTIVE: Capability = Capability::UNLINK
        .union(Capability::TRUNCATE)
        .union(Capability::KILL)
        .union(Capability::ERASE);

    /// The allow-list; approvals grant the intersection of the request
    /// with this set.
    pub const ALLOWED: Capability = Capability::STORAGE_READ
        .union(Capability::STORAGE_WRITE)
        .union(Capability::SNAPSHOT)
        .union(Capability::VIEW_SWITCH)
        .union(Capability::DEVICE_IO)
        .union(Capability::PROC_READ);

    const NAMES: [(&'static str, Capability); 10] = [
        ("storage-read", Capability::STORAGE_READ),
        ("storage-write", Capability::STORAGE_WRITE),
        ("snapshot", Capability::SNAPSHOT),
        ("view-switch", Capability::VIEW_SWITCH),
        ("device-io", Capability::DEVICE_IO),
        ("proc-read", Capability::PROC_READ),
        ("unlink", Capability::UNLINK),
        ("truncate", Capability::TRUNCATE),
        ("kill", Capability::KILL),
        ("erase", Capability::ERASE),
    ];

    /// Parse a comma-separated capability list, e.g.
    /// `"storage-read,snapshot"`.
    pub fn parse_list(text: &str) -> GeofsResult<Capability> {
        let mut caps = Capability::empty();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let flag = Self::NAMES
                .into_iter()
                .find_map(|(name, flag)| (name == part).then_some(flag))
                .ok_or_else(|| GeofsError::invalid(format!("unknown capability {part:?}")))?;
            caps |= flag;
        }
        Ok(caps)
    }

    /// Human-readable comma-separated names.
    pub fn describe(self) -> String {
        let names: Vec<&str> = Self::NAMES
            .into_iter()
            .filter_map(|(name, flag)| self.contains(flag).then_some(name))
            .collect();
        if names.is_empty() {
            "none".to_string()
        } else {
            names.join(",")
        }
    }
}

/// One destructive pattern; a rule with a substitute supports the
/// `modify` decision instead of an outright decline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternRule {
    pub name: String,
    pub pattern: Vec<u8>,
    pub substitute: Option<Vec<u8>>,
}

/// The ordered rule set a payload is scanned against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternTable {
    rules: Vec<PatternRule>,
}

impl PatternTable {
    pub fn new(rules: Vec<PatternRule>) -> Self {
        Self { rules }
    }

    /// The policy shipped with a fresh volume. Unlink-family calls have
    /// a safe rewrite onto `hide_path`; everything else declines.
    pub fn builtin() -> Self {
        fn rule(name: &str, pattern: &[u8], substitute: Option<&[u8]>) -> PatternRule {
            PatternRule {
                name: name.to_string(),
                pattern: pattern.to_vec(),
                substitute: substitute.map(|s| s.to_vec()),
            }
        }
        Self::new(vec![
            rule("unlink-call", b"unlink(", Some(b"hide_path(")),
            rule("remove-call", b"remove(", Some(b"hide_path(")),
            rule("rmdir-call", b"rmdir(", None),
            rule("truncate-call", b"truncate(", None),
            rule("kill-call", b"kill(", None),
            rule("erase-verb", b"erase_all", None),
            rule("format-verb", b"mkfs.", None),
            rule("shred-verb", b"shred ", None),
        ])
    }

    pub fn rules(&self) -> &[PatternRule] {
        &self.rules
    }

    /// Rules whose byte pattern occurs in `code`.
    pub fn scan<'a>(&'a self, code: &[u8]) -> Vec<&'a PatternRule> {
        self.rules
            .iter()
            .filter(|rule| find(code, &rule.pattern).is_some())
            .collect()
    }

    /// Apply every rewrite rule that matches, in table order.
    pub fn rewrite(&self, code: &[u8]) -> Vec<u8> {
        let mut out = code.to_vec();
        for rule in &self.rules {
            if let Some(substitute) = &rule.substitute {
                out = replace_all(&out, &rule.pattern, substitute);
            }
        }
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for rule in &self.rules {
            let mut payload = codec::PayloadWriter::new();
            payload.put_str(&rule.name).put_bytes(&rule.pattern);
            match &rule.substitute {
                Some(sub) => {
                    payload.put_u8(1).put_bytes(sub);
                }
                None => {
                    payload.put_u8(0);
                }
            }
            codec::write_record(&mut out, TAG_PATTERN_RULE, &payload.finish());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> GeofsResult<Self> {
        let mut rules = Vec::new();
        let mut iter = RecordIter::new(bytes);
        while let Some((tag, payload)) = iter.next_record()? {
            if tag != TAG_PATTERN_RULE {
                return Err(GeofsError::Corrupt(format!(
                    "unexpected tag {tag:#04x} in pattern table"
                )));
            }
            let mut r = PayloadReader::new(payload);
            let name = r.take_str()?.to_string();
            let pattern = r.take_bytes()?.to_vec();
            let substitute = match r.take_u8()? {
                0 => None,
                1 => Some(r.take_bytes()?.to_vec()),
                other => {
                    return Err(GeofsError::Corrupt(format!(
                        "bad substitute marker {other}"
                    )));
                }
            };
            rules.push(PatternRule {
                name,
                pattern,
                substitute,
            });
        }
        Ok(Self { rules })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(idx) = find(rest, needle) {
        out.extend_from_slice(&rest[..idx]);
        out.extend_from_slice(replacement);
        rest = &rest[idx + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}
