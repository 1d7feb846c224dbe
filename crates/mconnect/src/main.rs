use tracing_subscriber::EnvFilter;

mod app;
mod commands;

fn main() {
    let app = app::build_cli();
    let matches = app.get_matches();

    let verbose = matches.get_flag("verbose");
    init_logging(!verbose);

    if let Err(e) = commands::run_command(&matches) {
        // Error already printed to the user via eprintln! in command
        // handlers; exit non-zero without the Debug representation.
        drop(e);
        std::process::exit(1);
    }
}

/// Quiet by default; `--verbose` emits JSON logs on stderr.
fn init_logging(quiet: bool) {
    let default_filter = if quiet { "error" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
