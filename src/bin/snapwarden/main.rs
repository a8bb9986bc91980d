use anyhow::Result;
use env_logger::Env;
use log::error;

mod cli;
mod cmd_daemon;
mod cmd_prune;
mod cmd_reconcile;
mod cmd_run;
mod cmd_status;

fn main() {
    let cli = cli::Cli::parse();
    init_logger(cli.verbose);

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: cli::Cli) -> Result<()> {
    let cfg = cli::load_config(&cli)?;
    match cli.cmd {
        cli::Cmd::Run => cmd_run::exec(cfg),

        cli::Cmd::Daemon => cmd_daemon::exec(cfg),

        cli::Cmd::Reconcile => cmd_reconcile::exec(cfg),

        // Status supports --json flag
        cli::Cmd::Status { json } => cmd_status::exec(cfg, json),

        cli::Cmd::Prune { dry_run } => cmd_prune::exec(cfg, dry_run),
    }
}

/// RUST_LOG, если задан, иначе уровень от -v: 0 = warn, 1 = info, 2+ = debug.
fn init_logger(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .init();
}
