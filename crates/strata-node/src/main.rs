use anyhow::Result;

use strata_engine::EngineConfig;
use strata_node::{node, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init("strata-node")?;
    node::run(EngineConfig::from_env()).await
}
