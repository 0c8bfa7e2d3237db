// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use atlasbridge::config::Config;
use atlasbridge::control::CtlArgs;
use atlasbridge::error;
use atlasbridge::policy::cmd::PolicyArgs;
use atlasbridge::prompt::SessionStatus;

#[derive(Parser)]
#[command(
    name = "atlasbridge",
    version,
    about = "Supervise an interactive AI agent and relay its prompts to chat."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Launch a supervised session: `atlasbridge run -- <tool> [args]`.
    Run(Config),
    /// Pause the autopilot; every prompt escalates to the channel.
    Pause(CtlArgs),
    /// Resume the autopilot with the loaded policy.
    Resume(CtlArgs),
    /// Validate or dry-run a policy file.
    Policy(PolicyArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run(config) => run_command(config).await,
        Commands::Pause(args) => simple_command(|| atlasbridge::control::pause(&args)),
        Commands::Resume(args) => simple_command(|| atlasbridge::control::resume(&args)),
        Commands::Policy(args) => simple_command(|| atlasbridge::policy::cmd::run(&args)),
    };
    std::process::exit(code);
}

async fn run_command(config: Config) -> i32 {
    let json = config.json;
    match atlasbridge::run::run(config).await {
        Ok(result) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "session_id": result.session_id,
                        "status": result.session_status.as_str(),
                        "exit_code": result.status.code,
                        "signal": result.status.signal,
                        "channel": result.health,
                    })
                );
            }
            if result.session_status == SessionStatus::Terminated {
                130
            } else {
                result.status.effective_code()
            }
        }
        Err(e) => {
            error!("fatal: {e:#}");
            eprintln!("error: {e:#}");
            error::exit_code_for(&e)
        }
    }
}

fn simple_command(run: impl FnOnce() -> anyhow::Result<()>) -> i32 {
    match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e:#}");
            error::exit_code_for(&e)
        }
    }
}
