use std::{io::Write, sync::Arc};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use storage_server::{
    cli::{Cli, Command},
    client::Client,
    config::Settings,
    host::{LogNotifier, SystemClock},
    server::Server,
};

fn init_tracing(settings: &Settings) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter()));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings;
    init_tracing(&settings);

    match cli.command {
        Command::Serve(args) => {
            let mode = args.mode.unwrap_or_else(|| settings.server_mode());
            let server = Server::bind(&settings, mode, Arc::new(SystemClock), &LogNotifier).await?;
            let endpoint = server.local_endpoint()?;

            let mut stdout = std::io::stdout();
            writeln!(stdout, "storage server listening on {endpoint}")?;
            stdout.flush()?;

            match server.run_until_ctrl_c().await {
                Ok(report) => info!(requests = report.requests_served, "storage server closed down"),
                Err(err) => {
                    warn!("storage server exited with error: {err:?}");
                    return Err(err);
                }
            }
        }
        Command::Get(args) => {
            let client = Client::from_settings(&settings, &args.table);
            println!("{}", client.get(&args.name).await);
        }
        Command::GetMulti(args) => {
            let client = Client::from_settings(&settings, &args.table);
            for value in client.get_multi(&args.prefix, &args.items).await {
                println!("{value}");
            }
        }
        Command::Set(args) => {
            let client = Client::from_settings(&settings, &args.table);
            client.set(&args.name, &args.data).await;
        }
        Command::Del(args) => {
            let client = Client::from_settings(&settings, &args.table);
            client.delete(&args.name).await;
        }
        Command::Lock(args) => {
            let client = Client::from_settings(&settings, &args.table);
            println!("{}", client.lock(&args.name).await);
        }
        Command::Unlock(args) => {
            let client = Client::from_settings(&settings, &args.table);
            println!("{}", client.unlock(&args.name).await);
        }
    }

    Ok(())
}
