#[macro_use(debug, info, warn, error)]
extern crate tracing;

mod bridge;
mod comm;
mod generate;
mod model;
mod params;
mod server;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(version, about = "Serve a chat model over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    Serve(server::ServeArgs),
    Generate(generate::GenerateArgs),
}

fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "palma=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true)
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let amain = async {
        match cli.command {
            Commands::Serve(args) => server::serve_main(args).await,
            Commands::Generate(args) => generate::generate_main(args).await,
        }
    };

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(amain)
}
