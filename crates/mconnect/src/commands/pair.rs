use clap::ArgMatches;
use mconnect_protocol::{ClientRequest, DaemonResponse};
use tracing::info;

use super::helpers;

pub(crate) fn handle_pair_command(
    matches: &ArgMatches,
) -> Result<(), Box<dyn std::error::Error>> {
    let session_id = matches
        .get_one::<String>("session")
        .ok_or("Session argument is required")?;

    info!(event = "cli.pair_started", session_id = %session_id);

    match helpers::request(&ClientRequest::PairCode {
        session_id: session_id.clone(),
    })? {
        DaemonResponse::PairingCode {
            code,
            expires_at,
            port,
            ..
        } => {
            println!("Pairing code: {}", code);
            println!("On your phone, open http://<this-machine>:{}/ and enter the code.", port);
            let now = unix_now_ms();
            let remaining_secs = expires_at.saturating_sub(now) / 1_000;
            println!("The code is single-use and expires in {} s.", remaining_secs);
            info!(event = "cli.pair_completed", session_id = %session_id);
            Ok(())
        }
        other => {
            helpers::print_error(&format!("unexpected response: {:?}", other));
            Err("Unexpected daemon response".into())
        }
    }
}

fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
