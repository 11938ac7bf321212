// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::Result;
use mountfix_cli::{Cli, Commands, Parser};
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    cli.logging.init("mountfix-cli")?;

    // Sets the component field for everything logged by this invocation
    let span = tracing::info_span!("mountfix", component = "mountfix-cli");
    let _enter = span.enter();

    let settings = cli.settings.resolve();
    debug!(operation = "resolve_config", settings = ?settings, "configuration resolved");

    match cli.command {
        Commands::Init(args) => args.run(&settings),
        Commands::Apply(args) => args.run(&settings),
        Commands::Reap(args) => args.run(&settings).await,
        Commands::Schedule(args) => args.run(&settings),
        Commands::Classify(args) => args.run(),
        Commands::Status(args) => args.run(&settings),
    }
}
