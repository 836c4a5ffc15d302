//! backhaul - Multiplexed, authenticated TCP tunnel through a public relay.

use backhaul::{generate_keypair, run_client, run_forward, run_server, BuildInfo, Cli, Command, Error, ExitCode};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Server(args) => {
            tracing::debug!(?args, "Server arguments");
            block_on(run_server(&args))
        }
        Command::Client(args) => {
            tracing::debug!(?args, "Client arguments");
            block_on(run_client(&args))
        }
        Command::Forward(args) => {
            tracing::debug!(?args, "Forward arguments");
            block_on(run_forward(&args))
        }
        Command::Keygen => generate_keypair().map_err(Error::from).map(|(private, public)| {
            println!("Private key: {}", private);
            println!("Public key: {}", public);
        }),
        Command::Version => {
            let info = BuildInfo::get();
            println!("{}", info.format());
            Ok(())
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "backhaul error");
        std::process::exit(e.exit_code().into());
    }
    std::process::exit(ExitCode::Success.into());
}

fn block_on<F>(future: F) -> backhaul::Result<()>
where
    F: std::future::Future<Output = backhaul::Result<()>>,
{
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(future)
}
