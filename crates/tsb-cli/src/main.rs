use clap::Parser;
use tsb_cli::{
    config::{Cli, Command},
    runtime,
};

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Input(args) => {
            init_tracing(&args.log_level);
            let running = runtime::install_ctrlc_flag();
            runtime::run_input(args, || running.load(std::sync::atomic::Ordering::SeqCst))
        }
        Command::Compute(args) => {
            init_tracing(&args.log_level);
            let running = runtime::install_ctrlc_flag();
            runtime::run_compute(args, || running.load(std::sync::atomic::Ordering::SeqCst))
        }
    };

    if let Err(err) = result {
        tracing::error!(%err, fatal = err.is_fatal(), "node exited with an error");
        std::process::exit(1);
    }
}
