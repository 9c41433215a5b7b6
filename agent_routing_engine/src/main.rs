//! Main entry point for the routing engine CLI.

use agent_routing_engine::{batch, builtin, cli, orchestrator::MultiAgentSystem, server, settings::Settings, telemetry};
use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let settings = Settings::load()?;
    telemetry::init(&settings.logging)?;

    let engine = Arc::new(MultiAgentSystem::new(&settings)?);
    builtin::register_configured_agents(&engine, &settings.agents)?;

    match args.command {
        cli::Commands::Serve { addr } => server::serve(engine, &settings, addr).await,
        cli::Commands::Run { config } => {
            let result = batch::run(config, engine.clone()).await;
            engine.shutdown().await;
            result
        }
        cli::Commands::Exec { function, params, context } => {
            let parameters: Value = serde_json::from_str(&params).context("--params is not valid JSON")?;
            let context = context
                .map(|c| serde_json::from_str::<Value>(&c))
                .transpose()
                .context("--context is not valid JSON")?;
            let result = engine.execute_function(&function, parameters, context).await;
            engine.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&result?)?);
            Ok(())
        }
    }
}
