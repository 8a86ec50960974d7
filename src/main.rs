use anyhow::Result;
use clap::Parser;

use wait0::{cli::Cli, config, logging, run};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logger(cli.log)?;
    let config = config::load(&cli.config)?;
    run(config).await
}
