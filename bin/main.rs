use std::path::PathBuf;

use clap::Parser;

use mailsink::{config::Config, logging, server::Server};

#[derive(Parser)]
#[command(name = "mailsink", version, about = "An SMTP mail-receiving daemon")]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config", default_value = "./mailsink.config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    logging::init(&config.log.level);

    let server = Server::new(config, Some(args.config))?;
    server.run().await
}
