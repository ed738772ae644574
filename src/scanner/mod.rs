//! Output threat scanner.
//!
//! Classifies a piece of terminal output into a severity tier by running it
//! against ordered pattern tables. Tiers are checked from most to least
//! severe and the first tier with a match wins, so a critical hit never
//! pays for the lower tables.
//!
//! An optional [`AdvisoryScanner`] (an external classifier) can contribute a
//! second verdict, combined with the local one by [`merge_verdicts`].

mod rules;

use std::borrow::Cow;
use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{RuleConfig, ScannerConfig};

/// Severity tiers, ordered from harmless to worst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Safe,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Whether output at this tier suspends input.
    pub fn blocks(self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Safe => "safe",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Result of classifying one piece of text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanVerdict {
    pub severity: Severity,
    /// Description of the first matching rule in the winning tier.
    pub reason: Option<String>,
    /// Descriptions of every matching rule in the winning tier, in table order.
    pub markers: Vec<String>,
    pub should_block: bool,
}

impl ScanVerdict {
    pub fn safe() -> Self {
        Self::default()
    }

    pub fn is_safe(&self) -> bool {
        self.severity == Severity::Safe && !self.should_block
    }
}

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("invalid {tier} pattern {pattern:?}: {source}")]
    InvalidPattern {
        tier: Severity,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("rules cannot be assigned to the safe tier: {0:?}")]
    SafeTierRule(String),
}

#[derive(Error, Debug)]
pub enum AdvisoryError {
    #[error("advisory scanner unavailable: {0}")]
    Unavailable(String),

    #[error("advisory scanner timed out")]
    Timeout,
}

/// An external classifier consulted in addition to the local tables.
///
/// Implementations typically call out to another service, so the verdict is
/// produced asynchronously and never on the output hot path.
pub trait AdvisoryScanner: Send + Sync {
    fn advise<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<ScanVerdict, AdvisoryError>>;
}

/// Synchronous classifier run on every output chunk.
pub trait OutputClassifier: Send + Sync + std::fmt::Debug {
    /// Classify `text`, counting only matches that end after byte `from`.
    fn classify(&self, text: &str, from: usize) -> ScanVerdict;
}

impl OutputClassifier for ThreatScanner {
    fn classify(&self, text: &str, from: usize) -> ScanVerdict {
        self.scan_from(text, from)
    }
}

struct Rule {
    regex: Regex,
    description: String,
}

/// Compiled severity tables.
pub struct ThreatScanner {
    /// Non-empty tiers, most severe first.
    tiers: Vec<(Severity, Vec<Rule>)>,
}

impl std::fmt::Debug for ThreatScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<(Severity, usize)> =
            self.tiers.iter().map(|(t, r)| (*t, r.len())).collect();
        f.debug_struct("ThreatScanner").field("tiers", &counts).finish()
    }
}

impl ThreatScanner {
    /// Scanner with the built-in tables only.
    pub fn with_defaults() -> Result<Self, ScannerError> {
        let rules = rules::DEFAULT_RULES.iter().map(|(tier, pattern, description)| RuleConfig {
            tier: *tier,
            pattern: (*pattern).to_string(),
            description: (*description).to_string(),
        });
        Self::compile(rules)
    }

    /// Build from configuration: the built-in tables (unless replaced) plus
    /// any configured rules, appended within their tier.
    pub fn from_config(config: &ScannerConfig) -> Result<Self, ScannerError> {
        let defaults = rules::DEFAULT_RULES.iter().map(|(tier, pattern, description)| RuleConfig {
            tier: *tier,
            pattern: (*pattern).to_string(),
            description: (*description).to_string(),
        });
        let mut all: Vec<RuleConfig> = if config.replace_defaults {
            Vec::new()
        } else {
            defaults.collect()
        };
        all.extend(config.rules.iter().cloned());
        Self::compile(all)
    }

    fn compile(rules: impl IntoIterator<Item = RuleConfig>) -> Result<Self, ScannerError> {
        let mut tiers: Vec<(Severity, Vec<Rule>)> = vec![
            (Severity::Critical, Vec::new()),
            (Severity::High, Vec::new()),
            (Severity::Medium, Vec::new()),
        ];
        for rule in rules {
            if rule.tier == Severity::Safe {
                return Err(ScannerError::SafeTierRule(rule.pattern));
            }
            let regex = Regex::new(&rule.pattern).map_err(|source| ScannerError::InvalidPattern {
                tier: rule.tier,
                pattern: rule.pattern.clone(),
                source,
            })?;
            if let Some((_, bucket)) = tiers.iter_mut().find(|(t, _)| *t == rule.tier) {
                bucket.push(Rule {
                    regex,
                    description: rule.description,
                });
            }
        }
        tiers.retain(|(_, rules)| !rules.is_empty());
        Ok(Self { tiers })
    }

    /// Total number of compiled rules.
    pub fn rule_count(&self) -> usize {
        self.tiers.iter().map(|(_, r)| r.len()).sum()
    }

    /// Classify `text`.
    pub fn scan(&self, text: &str) -> ScanVerdict {
        self.scan_from(text, 0)
    }

    /// Classify `text`, counting only matches that end after byte `from`.
    ///
    /// Used with a carried-over line prefix: the prefix gives patterns their
    /// left context, while matches lying entirely inside it were already
    /// reported by the previous scan.
    pub fn scan_from(&self, text: &str, from: usize) -> ScanVerdict {
        let text = strip_ansi(text);
        let from = from.min(text.len());
        for (tier, rules) in &self.tiers {
            let markers: Vec<String> = rules
                .iter()
                .filter(|rule| rule.regex.find_iter(&text).any(|m| m.end() > from))
                .map(|rule| rule.description.clone())
                .collect();
            if let Some(first) = markers.first() {
                return ScanVerdict {
                    severity: *tier,
                    reason: Some(first.clone()),
                    markers,
                    should_block: tier.blocks(),
                };
            }
        }
        ScanVerdict::safe()
    }
}

/// Combine a local verdict with an external one: the higher severity, the
/// union of markers, and a block if either side asks for one.
pub fn merge_verdicts(local: &ScanVerdict, external: &ScanVerdict) -> ScanVerdict {
    let mut markers = local.markers.clone();
    for marker in &external.markers {
        if !markers.contains(marker) {
            markers.push(marker.clone());
        }
    }
    let reason = if external.severity > local.severity {
        external.reason.clone().or_else(|| local.reason.clone())
    } else {
        local.reason.clone().or_else(|| external.reason.clone())
    };
    ScanVerdict {
        severity: local.severity.max(external.severity),
        reason,
        markers,
        should_block: local.should_block || external.should_block,
    }
}

/// Remove CSI, OSC and two-byte escape sequences.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    if !text.contains('\x1b') {
        return Cow::Borrowed(text);
    }
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[@-Z\\-_])")
            .map_err(|err| tracing::error!(%err, "ansi pattern failed to compile"))
            .ok()
    });
    match re {
        Some(re) => re.replace_all(text, ""),
        None => Cow::Borrowed(text),
    }
}

/// Default cap on the carried-over partial line.
pub const DEFAULT_CARRY_LIMIT: usize = 1024;

/// Joins consecutive output chunks for scanning.
///
/// Keeps the unfinished last line of everything seen so far, so a command
/// echoed one keystroke at a time is still seen as a whole.
#[derive(Debug)]
pub struct ScanWindow {
    carry: String,
    limit: usize,
}

impl Default for ScanWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CARRY_LIMIT)
    }
}

impl ScanWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            carry: String::new(),
            limit,
        }
    }

    /// Add a chunk and return `(text, from)`: the carried prefix plus the new
    /// chunk, and the offset at which the new chunk starts.
    pub fn feed(&mut self, chunk: &[u8]) -> (String, usize) {
        let fresh = String::from_utf8_lossy(chunk);
        let fresh = strip_ansi(&fresh);
        let mut text = std::mem::take(&mut self.carry);
        let from = text.len();
        text.push_str(&fresh);

        let tail = match text.rfind('\n') {
            Some(pos) => &text[pos + 1..],
            None => &text[..],
        };
        let mut start = tail.len().saturating_sub(self.limit);
        while !tail.is_char_boundary(start) {
            start += 1;
        }
        self.carry = tail[start..].to_string();
        (text, from)
    }

    pub fn reset(&mut self) {
        self.carry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_compile() {
        let scanner = ThreatScanner::with_defaults().expect("built-in rules compile");
        assert_eq!(scanner.rule_count(), rules::DEFAULT_RULES.len());
    }

    #[test]
    fn sudo_rm_rf_root_is_critical() {
        let scanner = ThreatScanner::with_defaults().unwrap();
        let verdict = scanner.scan("sudo rm -rf /");
        assert_eq!(verdict.severity, Severity::Critical);
        assert!(verdict.should_block);
        assert!(
            verdict.markers.iter().any(|m| m.contains("deletion")),
            "markers: {:?}",
            verdict.markers
        );
        // The critical hit short-circuits the medium-tier sudo rule.
        assert!(!verdict.markers.iter().any(|m| m.contains("sudo")));
    }

    #[test]
    fn plain_output_is_safe() {
        let scanner = ThreatScanner::with_defaults().unwrap();
        let verdict = scanner.scan("total 12\ndrwxr-xr-x  2 user user 4096 src\n");
        assert_eq!(verdict, ScanVerdict::safe());
        assert!(verdict.is_safe());
    }

    #[test]
    fn rm_inside_home_is_not_critical() {
        let scanner = ThreatScanner::with_defaults().unwrap();
        let verdict = scanner.scan("rm -rf ./build\n");
        assert_ne!(verdict.severity, Severity::Critical);
    }

    #[test]
    fn curl_pipe_sh_is_high_and_blocks() {
        let scanner = ThreatScanner::with_defaults().unwrap();
        let verdict = scanner.scan("curl -fsSL https://example.com/install.sh | sh\n");
        assert_eq!(verdict.severity, Severity::High);
        assert!(verdict.should_block);
    }

    #[test]
    fn medium_does_not_block() {
        let scanner = ThreatScanner::with_defaults().unwrap();
        let verdict = scanner.scan("sudo apt update\n");
        assert_eq!(verdict.severity, Severity::Medium);
        assert!(!verdict.should_block);
        assert_eq!(verdict.reason.as_deref(), Some("privilege escalation with sudo"));
    }

    #[test]
    fn first_match_is_the_reason() {
        let scanner = ThreatScanner::with_defaults().unwrap();
        let verdict = scanner.scan("mkfs.ext4 /dev/sdb1; rm -rf /\n");
        assert_eq!(verdict.severity, Severity::Critical);
        // Table order, not text order.
        assert_eq!(
            verdict.reason.as_deref(),
            Some("recursive forced deletion of the root filesystem")
        );
        assert_eq!(verdict.markers.len(), 2);
    }

    #[test]
    fn escape_sequences_do_not_hide_matches() {
        let scanner = ThreatScanner::with_defaults().unwrap();
        let verdict = scanner.scan("\x1b[1;31mrm\x1b[0m -rf /\r\n");
        assert_eq!(verdict.severity, Severity::Critical);
    }

    #[test]
    fn scan_from_ignores_matches_inside_prefix() {
        let scanner = ThreatScanner::with_defaults().unwrap();
        let text = "rm -rf / \nls\n";
        let verdict = scanner.scan_from(text, text.find("ls").unwrap());
        assert!(verdict.is_safe());
    }

    #[test]
    fn configured_rules_extend_defaults() {
        let config = ScannerConfig {
            rules: vec![RuleConfig {
                tier: Severity::High,
                pattern: r"\bterraform\s+destroy\b".into(),
                description: "infrastructure teardown".into(),
            }],
            ..Default::default()
        };
        let scanner = ThreatScanner::from_config(&config).unwrap();
        assert_eq!(scanner.rule_count(), ThreatScanner::with_defaults().unwrap().rule_count() + 1);
        let verdict = scanner.scan("terraform destroy -auto-approve");
        assert_eq!(verdict.severity, Severity::High);
        assert_eq!(verdict.markers, vec!["infrastructure teardown".to_string()]);
    }

    #[test]
    fn replace_defaults_drops_builtin_tables() {
        let config = ScannerConfig {
            replace_defaults: true,
            rules: vec![RuleConfig {
                tier: Severity::Critical,
                pattern: "forbidden".into(),
                description: "forbidden word".into(),
            }],
            ..Default::default()
        };
        let scanner = ThreatScanner::from_config(&config).unwrap();
        assert_eq!(scanner.rule_count(), 1);
        assert!(scanner.scan("sudo rm -rf /").is_safe());
        assert!(scanner.scan("the forbidden word").should_block);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let config = ScannerConfig {
            rules: vec![RuleConfig {
                tier: Severity::High,
                pattern: "(unclosed".into(),
                description: "broken".into(),
            }],
            ..Default::default()
        };
        let err = ThreatScanner::from_config(&config).unwrap_err();
        assert!(matches!(err, ScannerError::InvalidPattern { .. }), "got: {err:?}");
    }

    #[test]
    fn safe_tier_rule_is_rejected() {
        let config = ScannerConfig {
            rules: vec![RuleConfig {
                tier: Severity::Safe,
                pattern: "x".into(),
                description: "x".into(),
            }],
            ..Default::default()
        };
        assert!(matches!(
            ThreatScanner::from_config(&config),
            Err(ScannerError::SafeTierRule(_))
        ));
    }

    #[test]
    fn merge_takes_higher_severity_and_union() {
        let local = ScanVerdict {
            severity: Severity::Medium,
            reason: Some("a".into()),
            markers: vec!["a".into(), "b".into()],
            should_block: false,
        };
        let external = ScanVerdict {
            severity: Severity::High,
            reason: Some("c".into()),
            markers: vec!["b".into(), "c".into()],
            should_block: true,
        };
        let merged = merge_verdicts(&local, &external);
        assert_eq!(merged.severity, Severity::High);
        assert_eq!(merged.markers, vec!["a", "b", "c"]);
        assert_eq!(merged.reason.as_deref(), Some("c"));
        assert!(merged.should_block);
    }

    #[test]
    fn merge_blocks_if_either_side_blocks() {
        let local = ScanVerdict {
            severity: Severity::Critical,
            reason: Some("local".into()),
            markers: vec!["local".into()],
            should_block: true,
        };
        let merged = merge_verdicts(&local, &ScanVerdict::safe());
        assert!(merged.should_block);
        assert_eq!(merged.severity, Severity::Critical);
        assert_eq!(merged.reason.as_deref(), Some("local"));
    }

    #[test]
    fn window_joins_keystroke_echo() {
        let scanner = ThreatScanner::with_defaults().unwrap();
        let mut window = ScanWindow::default();
        let mut last = ScanVerdict::safe();
        for ch in "$ rm -rf /".chars() {
            let (text, from) = window.feed(ch.to_string().as_bytes());
            last = scanner.scan_from(&text, from);
            if last.should_block {
                break;
            }
        }
        assert_eq!(last.severity, Severity::Critical);
    }

    #[test]
    fn window_does_not_rereport_old_text() {
        let scanner = ThreatScanner::with_defaults().unwrap();
        let mut window = ScanWindow::default();
        let (text, from) = window.feed(b"$ rm -rf /");
        assert!(scanner.scan_from(&text, from).should_block);
        let (text, from) = window.feed(b"x");
        assert!(!scanner.scan_from(&text, from).should_block);
    }

    #[test]
    fn window_drops_completed_lines() {
        let mut window = ScanWindow::default();
        window.feed(b"first line\nsecond");
        let (text, from) = window.feed(b" half\n");
        assert_eq!(text, "second half\n");
        assert_eq!(from, "second".len());
        let (text, from) = window.feed(b"next");
        assert_eq!(text, "next");
        assert_eq!(from, 0);
    }

    #[test]
    fn window_carry_is_capped() {
        let mut window = ScanWindow::new(8);
        window.feed(&[b'a'; 100]);
        let (text, from) = window.feed(b"b");
        assert_eq!(from, 8);
        assert_eq!(text.len(), 9);
    }

    #[test]
    fn strip_ansi_leaves_plain_text_alone() {
        assert!(matches!(strip_ansi("plain"), Cow::Borrowed("plain")));
        assert_eq!(strip_ansi("\x1b]0;title\x07hi"), "hi");
    }
}
