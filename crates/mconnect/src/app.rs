use clap::{Arg, ArgAction, Command};

/// Build the CLI command tree.
pub fn build_cli() -> Command {
    Command::new("mconnect")
        .about("Remote terminal sessions for your PC and phone")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .help("Emit JSON logs on stderr")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(daemon_command())
        .subcommand(session_command())
        .subcommand(
            Command::new("pair")
                .about("Mint a pairing code for a session")
                .arg(Arg::new("session").required(true).help("Session id")),
        )
        .subcommand(Command::new("doctor").about("Check the local MConnect installation"))
}

fn daemon_command() -> Command {
    Command::new("daemon")
        .about("Manage the background daemon")
        .subcommand_required(true)
        .subcommand(
            Command::new("start")
                .about("Start the daemon")
                .arg(
                    Arg::new("foreground")
                        .long("foreground")
                        .help("Run in the foreground instead of detaching")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("port")
                        .long("port")
                        .value_name("N")
                        .value_parser(clap::value_parser!(u16))
                        .help("HTTP/WebSocket port override"),
                )
                .arg(
                    Arg::new("ipc-path")
                        .long("ipc-path")
                        .value_name("P")
                        .help("IPC socket path override"),
                ),
        )
        .subcommand(
            Command::new("stop")
                .about("Stop the daemon")
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help("SIGKILL the daemon if it does not stop in time")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .value_name("MS")
                        .value_parser(clap::value_parser!(u64))
                        .help("Milliseconds to wait for a graceful stop"),
                ),
        )
        .subcommand(Command::new("restart").about("Restart the daemon"))
        .subcommand(
            Command::new("status").about("Show daemon status").arg(
                Arg::new("json")
                    .long("json")
                    .help("Machine-readable output")
                    .action(ArgAction::SetTrue),
            ),
        )
        .subcommand(
            Command::new("logs")
                .about("Show daemon logs")
                .arg(
                    Arg::new("lines")
                        .long("lines")
                        .short('n')
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .help("Number of trailing lines to print"),
                )
                .arg(
                    Arg::new("follow")
                        .long("follow")
                        .short('f')
                        .help("Keep printing as the log grows")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("install")
                .about("Install the daemon as a user service")
                .arg(
                    Arg::new("no-start")
                        .long("no-start")
                        .help("Write the service manifest without enabling it")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("uninstall").about("Remove the daemon user service"))
}

fn session_command() -> Command {
    Command::new("session")
        .about("Manage terminal sessions")
        .subcommand_required(true)
        .subcommand(
            Command::new("list").about("List sessions").arg(
                Arg::new("json")
                    .long("json")
                    .help("Machine-readable output")
                    .action(ArgAction::SetTrue),
            ),
        )
        .subcommand(
            Command::new("create")
                .about("Create a session")
                .arg(
                    Arg::new("cwd")
                        .long("cwd")
                        .value_name("DIR")
                        .help("Working directory (defaults to the current directory)"),
                )
                .arg(
                    Arg::new("agent-config")
                        .long("agent-config")
                        .value_name("JSON")
                        .help("Agent configuration blob"),
                ),
        )
        .subcommand(
            Command::new("kill")
                .about("Terminate a session")
                .arg(Arg::new("session").required(true).help("Session id"))
                .arg(
                    Arg::new("force")
                        .long("force")
                        .help("SIGKILL the session's process")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("export")
                .about("Export a session's scrollback")
                .arg(Arg::new("session").required(true).help("Session id"))
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .value_name("FILE")
                        .help("Write to a file instead of stdout"),
                ),
        )
        .subcommand(
            Command::new("attach")
                .about("Attach this terminal to a session")
                .arg(Arg::new("session").required(true).help("Session id")),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_daemon_start() {
        let matches = build_cli()
            .try_get_matches_from(["mconnect", "daemon", "start", "--foreground", "--port", "9000"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "daemon");
        let (name, sub) = sub.subcommand().unwrap();
        assert_eq!(name, "start");
        assert!(sub.get_flag("foreground"));
        assert_eq!(sub.get_one::<u16>("port"), Some(&9000));
    }

    #[test]
    fn test_cli_parses_session_verbs() {
        for verb in ["kill", "export", "attach"] {
            let matches = build_cli()
                .try_get_matches_from(["mconnect", "session", verb, "abc123"])
                .unwrap();
            let (_, sub) = matches.subcommand().unwrap();
            let (name, sub) = sub.subcommand().unwrap();
            assert_eq!(name, verb);
            assert_eq!(sub.get_one::<String>("session").unwrap(), "abc123");
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(build_cli().try_get_matches_from(["mconnect"]).is_err());
    }

    #[test]
    fn test_cli_parses_stop_timeout() {
        let matches = build_cli()
            .try_get_matches_from(["mconnect", "daemon", "stop", "--force", "--timeout", "2000"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        let (_, sub) = sub.subcommand().unwrap();
        assert!(sub.get_flag("force"));
        assert_eq!(sub.get_one::<u64>("timeout"), Some(&2000));
    }
}
