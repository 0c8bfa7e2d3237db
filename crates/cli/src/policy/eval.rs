// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pure first-match evaluation. No side effects, no I/O, no clock.

use sha2::{Digest, Sha256};

use crate::prompt::{Confidence, PromptEvent};

use super::{AutonomyMode, DefaultAction, Policy, RuleAction, RuleMatch};

/// Session attributes a rule may match on.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub tool: String,
    pub repo: String,
    pub tag: Option<String>,
}

/// What the router should do with a prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    AutoReply { value: String },
    /// Relay to the human. `suggestion` carries a downgraded auto-reply
    /// value in assist mode so the channel can offer it as a button.
    Escalate { message: Option<String>, suggestion: Option<String> },
    Deny { reason: Option<String> },
    NotifyOnly,
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AutoReply { .. } => "auto_reply",
            Self::Escalate { .. } => "escalate",
            Self::Deny { .. } => "deny",
            Self::NotifyOnly => "notify_only",
        }
    }

    fn value(&self) -> Option<&str> {
        match self {
            Self::AutoReply { value } => Some(value),
            Self::Escalate { suggestion, .. } => suggestion.as_deref(),
            _ => None,
        }
    }
}

/// Decision plus provenance: which rule fired, why, and the stable key
/// that makes replays identical.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    pub matched_rule: Option<String>,
    pub explain: Vec<String>,
    pub idempotency_key: String,
}

/// Evaluate `event` against `policy` in declared rule order.
pub fn evaluate(policy: &Policy, event: &PromptEvent, meta: &SessionMeta) -> Evaluation {
    let mut explain = Vec::new();

    if policy.autonomy_mode == AutonomyMode::Off {
        explain.push("autonomy_mode off: every prompt escalates".to_owned());
        let decision = default_decision(policy.defaults.no_match);
        return finish(policy, event, None, decision, explain);
    }

    for rule in &policy.rules {
        if rule_matches(&rule.matcher, event, meta, &rule.id, &mut explain) {
            explain.push(format!("rule {}: matched", rule.id));
            let decision = gate_action(policy.autonomy_mode, &rule.action, &mut explain);
            return finish(policy, event, Some(rule.id.clone()), decision, explain);
        }
    }

    let (default, which) = if event.confidence == Confidence::Low {
        (policy.defaults.low_confidence, "low_confidence")
    } else {
        (policy.defaults.no_match, "no_match")
    };
    explain.push(format!("no rule matched: applying defaults.{which}"));
    finish(policy, event, None, default_decision(default), explain)
}

/// Apply the autonomy-mode gate to a matched action.
fn gate_action(mode: AutonomyMode, action: &RuleAction, explain: &mut Vec<String>) -> Decision {
    match (mode, action) {
        (AutonomyMode::Full, RuleAction::AutoReply { value }) => {
            Decision::AutoReply { value: value.clone() }
        }
        (AutonomyMode::Assist, RuleAction::AutoReply { value }) => {
            explain.push("assist mode: auto_reply downgraded to escalate with suggestion".into());
            Decision::Escalate { message: None, suggestion: Some(value.clone()) }
        }
        (AutonomyMode::Assist, RuleAction::Deny { reason }) => {
            explain.push("assist mode: deny downgraded to escalate".into());
            Decision::Escalate { message: reason.clone(), suggestion: None }
        }
        (AutonomyMode::Full, RuleAction::Deny { reason }) => {
            Decision::Deny { reason: reason.clone() }
        }
        (_, RuleAction::RequireHuman { message }) => {
            Decision::Escalate { message: message.clone(), suggestion: None }
        }
        (_, RuleAction::NotifyOnly) => Decision::NotifyOnly,
        // Off never reaches here; keep the arm total for safety.
        (AutonomyMode::Off, RuleAction::AutoReply { .. } | RuleAction::Deny { .. }) => {
            Decision::Escalate { message: None, suggestion: None }
        }
    }
}

fn default_decision(default: DefaultAction) -> Decision {
    match default {
        DefaultAction::Escalate => Decision::Escalate { message: None, suggestion: None },
        DefaultAction::Deny => Decision::Deny { reason: None },
        DefaultAction::NotifyOnly => Decision::NotifyOnly,
    }
}

/// Evaluate criteria in a fixed order so explain output is stable:
/// tool, repo_prefix, prompt_types, contains, min/max confidence,
/// session_tag, any_of, none_of.
fn rule_matches(
    matcher: &RuleMatch,
    event: &PromptEvent,
    meta: &SessionMeta,
    rule_id: &str,
    explain: &mut Vec<String>,
) -> bool {
    if let Some(ref tool) = matcher.tool {
        if tool != &meta.tool {
            explain.push(format!("rule {rule_id}: tool_id {tool:?} != {:?}", meta.tool));
            return false;
        }
    }
    if let Some(ref prefix) = matcher.repo_prefix {
        if !meta.repo.starts_with(prefix.as_str()) {
            explain.push(format!("rule {rule_id}: repo {:?} lacks prefix {prefix:?}", meta.repo));
            return false;
        }
    }
    if let Some(ref kinds) = matcher.prompt_types {
        if !kinds.contains(&event.kind) {
            explain.push(format!("rule {rule_id}: prompt type {} not listed", event.kind));
            return false;
        }
    }
    if let Some(ref text) = matcher.contains {
        if !text.matches(&event.excerpt) {
            explain.push(format!("rule {rule_id}: excerpt fails {}", text.describe()));
            return false;
        }
    }
    if let Some(min) = matcher.min_confidence {
        if event.confidence < min {
            explain.push(format!("rule {rule_id}: confidence {} below {min}", event.confidence));
            return false;
        }
    }
    if let Some(max) = matcher.max_confidence {
        if event.confidence > max {
            explain.push(format!("rule {rule_id}: confidence {} above {max}", event.confidence));
            return false;
        }
    }
    if let Some(ref tag) = matcher.session_tag {
        if meta.tag.as_deref() != Some(tag.as_str()) {
            explain.push(format!("rule {rule_id}: session tag {tag:?} absent"));
            return false;
        }
    }
    if !matcher.any_of.is_empty() {
        let mut scratch = Vec::new();
        if !matcher.any_of.iter().any(|m| rule_matches(m, event, meta, rule_id, &mut scratch)) {
            explain.push(format!("rule {rule_id}: no any_of alternative matched"));
            return false;
        }
    }
    for negated in &matcher.none_of {
        let mut scratch = Vec::new();
        if rule_matches(negated, event, meta, rule_id, &mut scratch) {
            explain.push(format!("rule {rule_id}: a none_of criterion matched"));
            return false;
        }
    }
    true
}

fn finish(
    policy: &Policy,
    event: &PromptEvent,
    matched_rule: Option<String>,
    decision: Decision,
    explain: Vec<String>,
) -> Evaluation {
    let idempotency_key = decision_key(policy, event, matched_rule.as_deref(), &decision);
    Evaluation { decision, matched_rule, explain, idempotency_key }
}

/// Stable hash of (session, prompt, rule, action kind, action value).
fn decision_key(
    _policy: &Policy,
    event: &PromptEvent,
    rule_id: Option<&str>,
    decision: &Decision,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.session_id.as_bytes());
    hasher.update(event.prompt_id.as_bytes());
    hasher.update(rule_id.unwrap_or("").as_bytes());
    hasher.update(decision.kind().as_bytes());
    hasher.update(decision.value().unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
#[path = "eval_tests.rs"]
mod tests;
