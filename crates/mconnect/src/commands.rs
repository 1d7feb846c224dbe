mod attach;
mod daemon;
mod doctor;
mod helpers;
mod pair;
mod session;

use clap::ArgMatches;

pub fn run_command(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    match matches.subcommand() {
        Some(("daemon", sub)) => daemon::handle_daemon_command(sub),
        Some(("session", sub)) => session::handle_session_command(sub),
        Some(("pair", sub)) => pair::handle_pair_command(sub),
        Some(("doctor", _)) => doctor::handle_doctor_command(),
        _ => Err("Unknown command".into()),
    }
}
