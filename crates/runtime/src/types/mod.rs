//! Core types and data structures for the defender runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod error;

pub use error::*;

/// A single IDS finding as received by the ingest layer.
///
/// `raw_text` is never mutated after persist; the parsed facets obtained via
/// [`crate::alerts::parse`] are a derived view, not a source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Opaque alert text exactly as produced by the detector.
    pub raw_text: String,
    /// Experiment tag this alert belongs to.
    pub run_id: String,
    /// Wall-clock receipt time.
    pub received_at: DateTime<Utc>,
    /// Position in the alert store; monotonic within a run.
    pub offset: u64,
}

impl Alert {
    pub fn new(raw_text: impl Into<String>, run_id: impl Into<String>, offset: u64) -> Self {
        Self {
            raw_text: raw_text.into(),
            run_id: run_id.into(),
            received_at: Utc::now(),
            offset,
        }
    }
}

/// Severity reported by the upstream detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    /// Case-insensitive parse; unknown words yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Self::Info),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facets extracted from an alert's raw text.
///
/// `Structured` carries whatever the extractor could recover; any field may
/// still be absent. `Unparsed` means nothing recognisable was found and the
/// fingerprint falls back to a hash of the normalised raw text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedFacets {
    Structured {
        source_ip: Option<String>,
        destination_ip: Option<String>,
        confidence: Option<f64>,
        threat_level: Option<ThreatLevel>,
        attack_class: Option<&'static str>,
    },
    Unparsed,
}

impl ParsedFacets {
    pub fn attack_class(&self) -> Option<&'static str> {
        match self {
            Self::Structured { attack_class, .. } => *attack_class,
            Self::Unparsed => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            Self::Structured { confidence, .. } => *confidence,
            Self::Unparsed => None,
        }
    }

    pub fn threat_level(&self) -> Option<ThreatLevel> {
        match self {
            Self::Structured { threat_level, .. } => *threat_level,
            Self::Unparsed => None,
        }
    }
}

/// Canonical deduplication key for a threat within a run.
///
/// Derived from `(source_ip | "-", destination_ip | "-", attack_class)`;
/// when no attack class could be parsed the third component is a hash prefix
/// of the normalised raw text. Derivation is pure: equal inputs produce equal
/// fingerprints across processes and machines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Derive the fingerprint for an alert from its parsed facets.
    pub fn derive(facets: &ParsedFacets, raw_text: &str) -> Self {
        let canonical = match facets {
            ParsedFacets::Structured {
                source_ip,
                destination_ip,
                attack_class,
                ..
            } => {
                let class = match attack_class {
                    Some(c) => (*c).to_string(),
                    None => raw_hash_prefix(raw_text),
                };
                format!(
                    "{}|{}|{}",
                    source_ip.as_deref().unwrap_or("-"),
                    destination_ip.as_deref().unwrap_or("-"),
                    class
                )
            }
            ParsedFacets::Unparsed => format!("-|-|{}", raw_hash_prefix(raw_text)),
        };
        Self(hex_digest(canonical.as_bytes()))
    }

    /// Full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex chars; used as the journal correlation tag.
    pub fn prefix(&self) -> &str {
        &self.0[..8]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One remediation instruction set for one host, produced by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Back-reference to the alert this plan answers.
    pub fingerprint: Fingerprint,
    /// Host the plan must be executed on.
    pub executor_host_ip: String,
    /// Natural-language instructions for the coder agent.
    pub plan_text: String,
    /// LLM that produced the plan.
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Identifier of one `(fingerprint, host)` execution; stable within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn derive(fingerprint: &Fingerprint, executor_host_ip: &str) -> Self {
        let canonical = format!("{}|{}", fingerprint.as_str(), executor_host_ip);
        Self(hex_digest(canonical.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn prefix(&self) -> &str {
        &self.0[..8]
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal outcome of one plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
    ConnectError,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::ConnectError => "connect_error",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final record of a plan execution, one per `(fingerprint, host)` per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub executor_host_ip: String,
    pub status: ExecutionStatus,
    pub attempts_used: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Session digest of the final attempt.
    pub digest: crate::exec::SessionDigest,
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash prefix of normalised raw text, used when facet parsing fails.
fn raw_hash_prefix(raw_text: &str) -> String {
    let normalised = normalise_raw(raw_text);
    hex_digest(normalised.as_bytes())[..16].to_string()
}

/// Lowercase and collapse whitespace so cosmetic differences in detector
/// output do not split one incident into many fingerprints.
fn normalise_raw(raw_text: &str) -> String {
    raw_text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structured(
        source_ip: Option<&str>,
        destination_ip: Option<&str>,
        attack_class: Option<&'static str>,
    ) -> ParsedFacets {
        ParsedFacets::Structured {
            source_ip: source_ip.map(String::from),
            destination_ip: destination_ip.map(String::from),
            confidence: None,
            threat_level: None,
            attack_class,
        }
    }

    #[test]
    fn fingerprint_is_pure() {
        let facets = structured(Some("10.0.0.5"), None, Some("port_scan"));
        let a = Fingerprint::derive(&facets, "raw");
        let b = Fingerprint::derive(&facets, "raw");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_hosts() {
        let a = Fingerprint::derive(&structured(Some("10.0.0.5"), None, Some("port_scan")), "x");
        let b = Fingerprint::derive(&structured(Some("10.0.0.6"), None, Some("port_scan")), "x");
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_unparsed_normalises_whitespace_and_case() {
        let a = Fingerprint::derive(&ParsedFacets::Unparsed, "Some  Raw\tAlert");
        let b = Fingerprint::derive(&ParsedFacets::Unparsed, "some raw alert");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_prefix_is_eight_hex_chars() {
        let fp = Fingerprint::derive(&ParsedFacets::Unparsed, "alert");
        assert_eq!(fp.prefix().len(), 8);
        assert!(fp.prefix().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn execution_id_depends_on_host() {
        let fp = Fingerprint::derive(&ParsedFacets::Unparsed, "alert");
        let a = ExecutionId::derive(&fp, "10.0.0.5");
        let b = ExecutionId::derive(&fp, "10.0.0.6");
        assert_ne!(a, b);
        assert_eq!(a, ExecutionId::derive(&fp, "10.0.0.5"));
    }

    #[test]
    fn threat_level_parse_is_case_insensitive() {
        assert_eq!(ThreatLevel::parse("HIGH"), Some(ThreatLevel::High));
        assert_eq!(ThreatLevel::parse(" critical "), Some(ThreatLevel::Critical));
        assert_eq!(ThreatLevel::parse("bogus"), None);
    }

    #[test]
    fn threat_level_ordering() {
        assert!(ThreatLevel::High > ThreatLevel::Medium);
        assert!(ThreatLevel::Critical > ThreatLevel::High);
    }
}
