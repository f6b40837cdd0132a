use anyhow::Result;
use cc_manager::app::tasks::shutdown_on_signal;
use cc_manager::app::Application;
use cc_manager::config::Cli;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

/// Parse arguments; `--help` and `--version` exit with 0, invalid
/// arguments with 1.
fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => e.exit(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = parse_cli();
    let _guard = utils::logging::init(cli.debug, cli.log_path.as_deref())?;

    tracing::info!("Starting cc-manager {}", &**version::VERSION);

    let app = Application::from_cli(&cli).await?;

    let shutdown = CancellationToken::new();
    shutdown_on_signal(shutdown.clone())?;

    app.run(shutdown).await
}
