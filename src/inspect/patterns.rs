//! Signature-based classification of request text.
//!
//! Every category owns an ordered table of case-insensitive rules compiled
//! once at start-up. Rules are compiled with the `regex` crate, which
//! guarantees matching in time linear in the input, so adversarial fragments
//! cannot trigger catastrophic backtracking.

use std::collections::BTreeSet;
use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::ThreatRulesConfig;
use crate::error::{Result, TurnstileError};

/// Compiled program size limit per rule.
const RULE_SIZE_LIMIT: usize = 1 << 20;

/// Built-in structured-query manipulation signatures.
const INJECTION_RULES: &[&str] = &[
    r"(?s)\bunion\b.*\bselect\b",
    r"(?s)\b(?:select|insert|update|delete|drop)\b.*\b(?:from|into|set|table)\b",
    r#"\bor\b\s*['"]?\w+['"]?\s*=\s*['"]?\w+"#,
    r#"['";]|--|/\*|\*/|#"#,
    r"\b(?:exec|execute)\b\s+(?:sp|xp)_\w+",
];

/// Built-in markup and script-URI signatures.
const SCRIPT_INJECTION_RULES: &[&str] = &[
    r"<\s*/?\s*script\b",
    r"\b(?:java|vb)script\s*:",
    r"\bon[a-z]+\s*=",
    r"<\s*(?:iframe|object|embed)\b",
];

/// Built-in parent-directory signatures, raw and percent-encoded.
const PATH_TRAVERSAL_RULES: &[&str] = &[
    r"(?:\.|%2e){2}(?:/|\\|%2f|%5c)",
    r"(?:/|\\|%2f|%5c)(?:\.|%2e){2}$",
    r"^(?:\.|%2e){2}$",
    r"(?:%252e){2}",
    r"(?:%c0%ae){2}",
];

/// Class of payload-level attack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    /// Structured-query injection
    Injection,
    /// Script or markup injection
    ScriptInjection,
    /// Directory traversal
    PathTraversal,
}

impl ThreatCategory {
    /// All categories in evaluation order.
    pub const ALL: [ThreatCategory; 3] = [
        ThreatCategory::Injection,
        ThreatCategory::ScriptInjection,
        ThreatCategory::PathTraversal,
    ];

    /// Stable snake_case name, as used in configuration and events.
    pub fn name(&self) -> &'static str {
        match self {
            ThreatCategory::Injection => "injection",
            ThreatCategory::ScriptInjection => "script_injection",
            ThreatCategory::PathTraversal => "path_traversal",
        }
    }

    /// The rule table shipped with the crate for this category.
    pub fn default_rules(&self) -> &'static [&'static str] {
        match self {
            ThreatCategory::Injection => INJECTION_RULES,
            ThreatCategory::ScriptInjection => SCRIPT_INJECTION_RULES,
            ThreatCategory::PathTraversal => PATH_TRAVERSAL_RULES,
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single compiled signature.
#[derive(Debug, Clone)]
struct PatternRule {
    source: String,
    regex: Regex,
}

impl PatternRule {
    fn compile(category: ThreatCategory, pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(RULE_SIZE_LIMIT)
            .build()
            .map_err(|source| TurnstileError::InvalidPattern {
                category,
                pattern: pattern.to_string(),
                source,
            })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }
}

/// Stateless classifier over immutable, per-category rule tables.
#[derive(Debug, Clone)]
pub struct ThreatDetector {
    tables: Vec<(ThreatCategory, Vec<PatternRule>)>,
}

impl ThreatDetector {
    /// Build a detector from the built-in rule tables.
    pub fn new() -> Result<Self> {
        Self::from_tables(
            ThreatCategory::ALL
                .iter()
                .map(|c| (*c, c.default_rules().iter().map(|r| r.to_string()).collect())),
        )
    }

    /// Build a detector from configuration; categories without an override
    /// keep their built-in table.
    pub fn from_config(config: &ThreatRulesConfig) -> Result<Self> {
        Self::from_tables(ThreatCategory::ALL.iter().map(|c| {
            let rules = config
                .overrides(*c)
                .map(|r| r.to_vec())
                .unwrap_or_else(|| c.default_rules().iter().map(|r| r.to_string()).collect());
            (*c, rules)
        }))
    }

    /// Compile explicit rule tables. Any rule that fails to compile refuses
    /// construction.
    pub fn from_tables<I>(tables: I) -> Result<Self>
    where
        I: IntoIterator<Item = (ThreatCategory, Vec<String>)>,
    {
        let mut compiled = Vec::new();
        for (category, patterns) in tables {
            let rules = patterns
                .iter()
                .map(|p| PatternRule::compile(category, p))
                .collect::<Result<Vec<_>>>()?;
            compiled.push((category, rules));
        }
        compiled.sort_by_key(|(category, _)| *category);

        Ok(Self { tables: compiled })
    }

    /// Classify a percent-decoded fragment.
    ///
    /// Returns every category with at least one matching rule; an empty set
    /// means the fragment is clean.
    pub fn classify(&self, fragment: &str) -> BTreeSet<ThreatCategory> {
        let mut found = BTreeSet::new();
        if fragment.is_empty() {
            return found;
        }

        for (category, rules) in &self.tables {
            if let Some(rule) = rules.iter().find(|r| r.regex.is_match(fragment)) {
                trace!(
                    category = %category,
                    rule = %rule.source,
                    "Fragment matched threat rule"
                );
                found.insert(*category);
            }
        }

        found
    }

    /// Number of compiled rules for a category.
    pub fn rule_count(&self, category: ThreatCategory) -> usize {
        self.tables
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, rules)| rules.len())
            .unwrap_or(0)
    }
}
