//! Alert classification
//!
//! Decides which alerts merit remediation. Acceptance requires a recognised
//! attack class plus either a high/critical threat level or a confidence at
//! or above the configured threshold, and the text must not be one of the
//! upstream watcher's control messages.

use crate::alerts::parse;
use crate::types::{Alert, ParsedFacets, ThreatLevel};

/// Markers the upstream watcher emits for its own lifecycle; never alerts.
const CONTROL_MARKERS: &[&str] = &["heartbeat", "queued:", "completed:", "processing pcap"];

/// Filter verdict for one alert.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// High-confidence threat; carries the parsed facets the decision used.
    Process(ParsedFacets),
    Ignore,
    Malformed,
}

/// Tunable thresholds. Defaults follow the strict policy: high/critical
/// levels, or confidence ≥ 0.8.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub min_confidence: f64,
    pub min_threat_level: ThreatLevel,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.8,
            min_threat_level: ThreatLevel::High,
        }
    }
}

/// Classify an alert. Deterministic for a fixed configuration.
pub fn classify(alert: &Alert, config: &FilterConfig) -> Classification {
    if alert.raw_text.trim().is_empty() {
        return Classification::Malformed;
    }

    if is_control_message(&alert.raw_text) {
        return Classification::Ignore;
    }

    let facets = parse::parse(&alert.raw_text);

    if facets.attack_class().is_none() {
        return Classification::Ignore;
    }

    let by_level = facets
        .threat_level()
        .is_some_and(|level| level >= config.min_threat_level);
    let by_confidence = facets
        .confidence()
        .is_some_and(|c| c >= config.min_confidence);

    if by_level || by_confidence {
        Classification::Process(facets)
    } else {
        Classification::Ignore
    }
}

fn is_control_message(raw_text: &str) -> bool {
    let haystack = raw_text.to_ascii_lowercase();
    CONTROL_MARKERS.iter().any(|m| haystack.contains(m))
}
