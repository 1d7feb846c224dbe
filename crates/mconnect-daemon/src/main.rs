use tracing::{error, info};

fn main() {
    // The CLI sets MCONNECT_DAEMON=1 when it spawns the detached daemon;
    // anything else is a foreground run with stderr logging.
    let daemonized = std::env::var("MCONNECT_DAEMON").is_ok_and(|v| v == "1");
    mconnect_daemon::logging::init_daemon_logging(!daemonized);
    info!(event = "daemon.start_started", daemonized = daemonized);

    let exit_code = match run() {
        Ok(()) => {
            info!(event = "daemon.start_completed");
            0
        }
        Err(e) => {
            error!(event = "daemon.start_failed", error = %e);
            eprintln!("mconnect-daemon: {}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = mconnect_daemon::load_daemon_config().map_err(|e| {
        error!(event = "daemon.config_load_failed", error = %e);
        e
    })?;

    let rt = tokio::runtime::Runtime::new().map_err(|e| {
        error!(event = "daemon.runtime_init_failed", error = %e);
        e
    })?;

    rt.block_on(async {
        mconnect_daemon::run_server(config).await.map_err(|e| {
            error!(event = "daemon.server_failed", error = %e);
            e
        })
    })?;

    Ok(())
}
