//! Alert facet extraction
//!
//! A single pure function turns a raw detector line into [`ParsedFacets`].
//! Extraction is best-effort: detectors emit semi-structured prose, so every
//! facet is optional and fingerprinting copes with all of them missing.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{ParsedFacets, ThreatLevel};

/// Ordered attack-class pattern table.
///
/// Case-insensitive substring matches evaluated top to bottom; the first
/// needle that appears in the raw text wins and fixes the attack class.
/// Order is part of the contract — reordering changes classification of
/// texts matching several classes.
pub const ATTACK_PATTERNS: &[(&str, &[&str])] = &[
    ("port_scan", &["vertical port scan", "horizontal port scan", "port scan", "port sweep"]),
    ("dos", &["denial of service", "ddos", "dos attack", "syn flood"]),
    ("brute_force", &["brute force", "brute-force", "bruteforce"]),
    ("password_guessing", &["password guessing", "password spray", "many failed login"]),
    ("dns_exfil", &["high entropy dns", "dns exfiltration", "suspicious dns answer", "high entropy answer"]),
    ("data_exfiltration", &["exfiltration", "data upload to", "unusually large upload"]),
];

fn source_ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:src|source)\s*ip\.?[:\s]+(\d{1,3}(?:\.\d{1,3}){3})").unwrap()
    })
}

fn destination_ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:dst|dest|destination|to)\s*ip\.?[:\s]+(\d{1,3}(?:\.\d{1,3}){3})")
            .unwrap()
    })
}

fn confidence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bconfidence[:\s]+([01](?:\.\d+)?)").unwrap())
}

fn threat_level_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bthreat[\s_]*level[:\s]+([a-z]+)").unwrap())
}

/// Extract facets from raw alert text. Pure: same input, same output.
pub fn parse(raw_text: &str) -> ParsedFacets {
    let source_ip = capture(source_ip_re(), raw_text);
    let destination_ip = capture(destination_ip_re(), raw_text);
    let confidence = capture(confidence_re(), raw_text).and_then(|s| s.parse::<f64>().ok());
    let threat_level =
        capture(threat_level_re(), raw_text).and_then(|s| ThreatLevel::parse(&s));
    let attack_class = match_attack_class(raw_text);

    if source_ip.is_none()
        && destination_ip.is_none()
        && confidence.is_none()
        && threat_level.is_none()
        && attack_class.is_none()
    {
        return ParsedFacets::Unparsed;
    }

    ParsedFacets::Structured {
        source_ip,
        destination_ip,
        confidence,
        threat_level,
        attack_class,
    }
}

/// First matching attack class in table order, or `None`.
pub fn match_attack_class(raw_text: &str) -> Option<&'static str> {
    let haystack = raw_text.to_ascii_lowercase();
    for (class, needles) in ATTACK_PATTERNS {
        if needles.iter().any(|needle| haystack.contains(needle)) {
            return Some(class);
        }
    }
    None
}

fn capture(re: &Regex, raw_text: &str) -> Option<String> {
    re.captures(raw_text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
