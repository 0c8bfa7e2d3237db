// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `atlasbridge policy` — validate a policy file or dry-run it against a
//! synthetic prompt.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use serde_json::json;
use uuid::Uuid;

use crate::error::Fault;
use crate::prompt::{now_us, Confidence, Constraints, PromptEvent, PromptType};

use super::eval::{evaluate, SessionMeta};
use super::load_policy;

#[derive(Debug, Args)]
pub struct PolicyArgs {
    #[command(subcommand)]
    pub cmd: PolicyCmd,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCmd {
    /// Validate a policy file and print its summary.
    Validate {
        /// Path to the policy YAML.
        #[arg(long, env = "ATLASBRIDGE_POLICY_FILE")]
        policy: PathBuf,
        /// Machine-readable output.
        #[arg(long)]
        json: bool,
    },
    /// Evaluate the policy against a synthetic prompt.
    Test {
        /// Path to the policy YAML.
        #[arg(long, env = "ATLASBRIDGE_POLICY_FILE")]
        policy: PathBuf,
        /// Prompt excerpt to classify against.
        #[arg(long)]
        prompt: String,
        /// Prompt type (yes_no, confirm_enter, multiple_choice, free_text, unknown).
        #[arg(long = "type", default_value = "yes_no")]
        prompt_type: String,
        /// Detection confidence (low, medium, high).
        #[arg(long, default_value = "high")]
        confidence: String,
        /// Tool id for the synthetic session.
        #[arg(long, default_value = "claude")]
        tool: String,
        /// Print the full explanation trace.
        #[arg(long)]
        explain: bool,
        /// Machine-readable output.
        #[arg(long)]
        json: bool,
    },
}

pub fn run(args: &PolicyArgs) -> anyhow::Result<()> {
    match &args.cmd {
        PolicyCmd::Validate { policy, json } => {
            let loaded = load_policy(policy)?;
            if *json {
                println!(
                    "{}",
                    json!({
                        "ok": true,
                        "name": loaded.name,
                        "policy_version": loaded.dsl_version,
                        "autonomy_mode": loaded.autonomy_mode.as_str(),
                        "rules": loaded.rules.len(),
                        "content_hash": loaded.content_hash,
                    })
                );
            } else {
                println!("policy ok: {} ({} rules)", loaded.name, loaded.rules.len());
                println!("  autonomy_mode: {}", loaded.autonomy_mode);
                println!("  content_hash:  {}", loaded.content_hash);
            }
            Ok(())
        }
        PolicyCmd::Test { policy, prompt, prompt_type, confidence, tool, explain, json } => {
            let loaded = load_policy(policy)?;
            let kind = PromptType::parse(prompt_type)
                .ok_or_else(|| Fault::config(format!("unknown prompt type {prompt_type:?}")))?;
            let confidence = Confidence::parse(confidence)
                .ok_or_else(|| Fault::config(format!("unknown confidence {confidence:?}")))?;

            let event = PromptEvent::new(
                Uuid::new_v4(),
                kind,
                confidence,
                prompt,
                vec![],
                Constraints::default(),
                300_000_000,
                now_us(),
            );
            let meta = SessionMeta { tool: tool.clone(), repo: String::new(), tag: None };
            let evaluation = evaluate(&loaded, &event, &meta);

            if *json {
                println!(
                    "{}",
                    json!({
                        "decision": evaluation.decision.kind(),
                        "matched_rule": evaluation.matched_rule,
                        "idempotency_key": evaluation.idempotency_key,
                        "explain": if *explain { Some(&evaluation.explain) } else { None },
                    })
                );
            } else {
                match &evaluation.matched_rule {
                    Some(rule) => {
                        println!("decision: {} (rule {rule})", evaluation.decision.kind());
                    }
                    None => println!("decision: {} (no rule)", evaluation.decision.kind()),
                }
                if *explain {
                    for line in &evaluation.explain {
                        println!("  {line}");
                    }
                }
            }
            Ok(())
        }
    }
}
