mod config;
mod serve;
mod signals;
mod terminator;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Administrative HTTP trigger that terminates non-essential Postgres
/// connections. One reserved session is opened at startup and used for
/// nothing else; callers authorise with a shared secret.
#[derive(Parser)]
#[command(name = "pg-terminator", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "terminator.toml")]
    config: PathBuf,

    /// Postgres connection string
    #[arg(long, env = "POSTGRES_URL", hide_env_values = true)]
    postgres_url: Option<String>,

    /// Shared secret expected in the X-Secret-Key header
    #[arg(long, env = "SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Listen port (overrides config)
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(long, env = "BIND")]
    bind: Option<String>,

    /// Validate config and print resolved settings, don't connect or listen
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            postgres_url: self.postgres_url.clone(),
            secret_key: self.secret_key.clone(),
            port: self.port,
            bind: self.bind.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pg_terminator=info,tower_http=debug".into()),
        )
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let file = config::load_file(&cli.config)?;
    let settings = config::Settings::resolve(file, cli.overrides())?;

    if cli.dry_run {
        println!("{settings:#?}");
        return Ok(());
    }

    let terminator = Arc::new(
        terminator::PgTerminator::connect(&settings.postgres_url, &settings.application_name)
            .await?,
    );

    let served = serve_until_shutdown(&settings, Arc::clone(&terminator)).await;

    // Release happens however serving ended: signal, drain timeout, bind failure,
    // or I/O error.
    terminator.release(settings.release_timeout).await;

    served?;
    tracing::info!("shut down");
    Ok(())
}

async fn serve_until_shutdown(
    settings: &config::Settings,
    terminator: Arc<terminator::PgTerminator>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(settings.listen_addr).await?;
    let app = serve::router(terminator, &settings.secret_key);
    serve::run(
        listener,
        app,
        signals::shutdown_signal(),
        settings.drain_timeout,
    )
    .await
}
