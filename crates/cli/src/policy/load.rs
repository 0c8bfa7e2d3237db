// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Policy loader: YAML → schema validation → regex compilation →
//! constraint validation → content hash.
//!
//! Everything that can be rejected is rejected here, at load time — the
//! evaluator never validates. Load failures carry the offending field in
//! the error message and map to the configuration exit code.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::Fault;
use crate::prompt::{Confidence, PromptType};

use super::{
    AutonomyMode, DefaultAction, Defaults, Policy, Rule, RuleAction, RuleMatch, TextMatcher,
};

/// Raw document shape. Unknown fields are rejected so typos surface as
/// load errors instead of silently-dead criteria.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDoc {
    policy_version: String,
    #[serde(default)]
    name: Option<String>,
    autonomy_mode: AutonomyMode,
    /// Experimental inheritance — present in the wild, unsupported here.
    #[serde(default)]
    extends: Option<serde_yaml::Value>,
    #[serde(default)]
    rules: Vec<RuleDoc>,
    #[serde(default)]
    defaults: Option<DefaultsDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDoc {
    id: String,
    #[serde(rename = "match", default)]
    matcher: Option<MatchDoc>,
    action: ActionDoc,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MatchDoc {
    #[serde(default)]
    tool_id: Option<String>,
    #[serde(default)]
    repo_prefix: Option<String>,
    #[serde(default)]
    prompt_types: Option<Vec<String>>,
    #[serde(default)]
    contains: Option<String>,
    #[serde(default)]
    contains_regex: Option<String>,
    #[serde(default)]
    min_confidence: Option<String>,
    #[serde(default)]
    max_confidence: Option<String>,
    #[serde(default)]
    session_tag: Option<String>,
    #[serde(default)]
    any_of: Vec<MatchDoc>,
    #[serde(default)]
    none_of: Vec<MatchDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
enum ActionDoc {
    AutoReply {
        value: String,
        #[serde(default)]
        max_length: Option<usize>,
        #[serde(default)]
        allowed_choices: Option<Vec<String>>,
        #[serde(default)]
        numeric_only: bool,
    },
    RequireHuman {
        #[serde(default)]
        message: Option<String>,
    },
    Deny {
        #[serde(default)]
        reason: Option<String>,
    },
    NotifyOnly,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsDoc {
    #[serde(default)]
    no_match: Option<String>,
    #[serde(default)]
    low_confidence: Option<String>,
}

/// Load and validate a policy file.
pub fn load_policy(path: &Path) -> anyhow::Result<Policy> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| Fault::config(format!("reading policy {}: {e}", path.display())))?;
    parse_policy(&source)
}

/// Parse and validate policy source text.
pub fn parse_policy(source: &str) -> anyhow::Result<Policy> {
    let doc: PolicyDoc = serde_yaml::from_str(source)
        .map_err(|e| Fault::config(format!("policy schema: {e}")))?;

    if doc.policy_version != "0" && doc.policy_version != "1" {
        return Err(Fault::config(format!(
            "policy_version: expected \"0\" or \"1\", got {:?}",
            doc.policy_version
        )));
    }
    if doc.extends.is_some() {
        return Err(Fault::config(
            "extends: policy inheritance is not supported; inline the parent rules",
        ));
    }

    let mut seen_ids = HashSet::new();
    let mut rules = Vec::with_capacity(doc.rules.len());
    for rule in doc.rules {
        if rule.id.trim().is_empty() {
            return Err(Fault::config("rules: rule id must be non-empty"));
        }
        if !seen_ids.insert(rule.id.clone()) {
            return Err(Fault::config(format!("rules: duplicate rule id {:?}", rule.id)));
        }
        let matcher = compile_match(&rule.id, rule.matcher.unwrap_or_default())?;
        let action = validate_action(&rule.id, rule.action)?;
        rules.push(Rule { id: rule.id, matcher, action });
    }

    let defaults = match doc.defaults {
        Some(d) => Defaults {
            no_match: parse_default("defaults.no_match", d.no_match.as_deref())?,
            low_confidence: parse_default("defaults.low_confidence", d.low_confidence.as_deref())?,
        },
        None => Defaults::default(),
    };

    let digest = Sha256::digest(source.as_bytes());
    Ok(Policy {
        dsl_version: doc.policy_version,
        name: doc.name.unwrap_or_else(|| "unnamed".to_owned()),
        autonomy_mode: doc.autonomy_mode,
        rules,
        defaults,
        content_hash: format!("sha256:{}", hex::encode(digest)),
    })
}

fn compile_match(rule_id: &str, doc: MatchDoc) -> anyhow::Result<RuleMatch> {
    let contains = match (doc.contains, doc.contains_regex) {
        (Some(_), Some(_)) => {
            return Err(Fault::config(format!(
                "rule {rule_id}: contains and contains_regex are mutually exclusive"
            )));
        }
        (Some(literal), None) => {
            if literal.is_empty() {
                return Err(Fault::config(format!(
                    "rule {rule_id}: contains must be non-empty"
                )));
            }
            Some(TextMatcher::Literal(literal))
        }
        (None, Some(pattern)) => {
            let re = Regex::new(&pattern).map_err(|e| {
                Fault::config(format!("rule {rule_id}: contains_regex: {e}"))
            })?;
            if re.is_match("") {
                return Err(Fault::config(format!(
                    "rule {rule_id}: contains_regex matches the empty string"
                )));
            }
            Some(TextMatcher::Pattern(re))
        }
        (None, None) => None,
    };

    let prompt_types = match doc.prompt_types {
        Some(raw) => {
            let mut kinds = Vec::with_capacity(raw.len());
            for name in raw {
                let kind = PromptType::parse(&name).ok_or_else(|| {
                    Fault::config(format!("rule {rule_id}: unknown prompt type {name:?}"))
                })?;
                kinds.push(kind);
            }
            Some(kinds)
        }
        None => None,
    };

    let min_confidence = doc
        .min_confidence
        .as_deref()
        .map(|s| parse_confidence(rule_id, "min_confidence", s))
        .transpose()?;
    let max_confidence = doc
        .max_confidence
        .as_deref()
        .map(|s| parse_confidence(rule_id, "max_confidence", s))
        .transpose()?;
    if let (Some(min), Some(max)) = (min_confidence, max_confidence) {
        if min > max {
            return Err(Fault::config(format!(
                "rule {rule_id}: min_confidence exceeds max_confidence"
            )));
        }
    }

    let any_of = doc
        .any_of
        .into_iter()
        .map(|m| compile_match(rule_id, m))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let none_of = doc
        .none_of
        .into_iter()
        .map(|m| compile_match(rule_id, m))
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(RuleMatch {
        tool: doc.tool_id,
        repo_prefix: doc.repo_prefix,
        prompt_types,
        contains,
        min_confidence,
        max_confidence,
        session_tag: doc.session_tag,
        any_of,
        none_of,
    })
}

fn parse_confidence(rule_id: &str, field: &str, s: &str) -> anyhow::Result<Confidence> {
    Confidence::parse(s)
        .ok_or_else(|| Fault::config(format!("rule {rule_id}: {field}: unknown level {s:?}")))
}

fn validate_action(rule_id: &str, action: ActionDoc) -> anyhow::Result<RuleAction> {
    match action {
        ActionDoc::AutoReply { value, max_length, allowed_choices, numeric_only } => {
            if let Some(max) = max_length {
                if value.chars().count() > max {
                    return Err(Fault::config(format!(
                        "rule {rule_id}: auto_reply value exceeds max_length {max}"
                    )));
                }
            }
            if numeric_only && value.trim().parse::<i64>().is_err() {
                return Err(Fault::config(format!(
                    "rule {rule_id}: auto_reply value {value:?} is not numeric"
                )));
            }
            if let Some(allowed) = allowed_choices {
                if !allowed.iter().any(|a| a == &value) {
                    return Err(Fault::config(format!(
                        "rule {rule_id}: auto_reply value {value:?} not in allowed_choices"
                    )));
                }
            }
            Ok(RuleAction::AutoReply { value })
        }
        ActionDoc::RequireHuman { message } => Ok(RuleAction::RequireHuman { message }),
        ActionDoc::Deny { reason } => Ok(RuleAction::Deny { reason }),
        ActionDoc::NotifyOnly => Ok(RuleAction::NotifyOnly),
    }
}

fn parse_default(field: &str, value: Option<&str>) -> anyhow::Result<DefaultAction> {
    match value {
        None | Some("escalate") | Some("require_human") => Ok(DefaultAction::Escalate),
        Some("deny") => Ok(DefaultAction::Deny),
        Some("notify_only") => Ok(DefaultAction::NotifyOnly),
        Some("auto_reply") => {
            Err(Fault::config(format!("{field}: auto_reply is not permitted as a default")))
        }
        Some(other) => Err(Fault::config(format!("{field}: unknown default {other:?}"))),
    }
}

#[cfg(test)]
#[path = "load_tests.rs"]
mod tests;
