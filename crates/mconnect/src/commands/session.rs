use clap::ArgMatches;
use mconnect_protocol::{ClientRequest, DaemonResponse, SessionSummary};
use tracing::info;

use super::{attach, helpers};

pub(crate) fn handle_session_command(
    matches: &ArgMatches,
) -> Result<(), Box<dyn std::error::Error>> {
    match matches.subcommand() {
        Some(("list", sub)) => handle_list(sub),
        Some(("create", sub)) => handle_create(sub),
        Some(("kill", sub)) => handle_kill(sub),
        Some(("export", sub)) => handle_export(sub),
        Some(("attach", sub)) => attach::handle_attach_command(sub),
        _ => Err("Unknown session subcommand".into()),
    }
}

fn handle_list(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let json = matches.get_flag("json");
    info!(event = "cli.session.list_started");

    let sessions = match helpers::request(&ClientRequest::SessionList)? {
        DaemonResponse::SessionList { sessions } => sessions,
        other => {
            helpers::print_error(&format!("unexpected response: {:?}", other));
            return Err("Unexpected daemon response".into());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    println!(
        "{:<38} {:<10} {:<8} {}",
        "SESSION", "STATE", "CLIENTS", "WORKDIR"
    );
    for session in &sessions {
        println!(
            "{:<38} {:<10} {:<8} {}",
            session.id,
            session.state,
            session.client_count.unwrap_or(0),
            session.working_directory,
        );
    }
    info!(event = "cli.session.list_completed", count = sessions.len());
    Ok(())
}

fn handle_create(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let working_directory = match matches.get_one::<String>("cwd") {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?.to_string_lossy().to_string(),
    };
    let agent_config: serde_json::Value = match matches.get_one::<String>("agent-config") {
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            helpers::print_error(&format!("invalid --agent-config JSON: {}", e));
            e
        })?,
        None => serde_json::Value::Null,
    };

    info!(event = "cli.session.create_started", working_directory = %working_directory);

    match helpers::request(&ClientRequest::SessionCreate {
        working_directory,
        agent_config,
    })? {
        DaemonResponse::SessionCreated { id } => {
            println!("Created session {}", id);
            println!("Attach: mconnect session attach {}", id);
            println!("Pair a phone: mconnect pair {}", id);
            info!(event = "cli.session.create_completed", session_id = %id);
            Ok(())
        }
        other => {
            helpers::print_error(&format!("unexpected response: {:?}", other));
            Err("Unexpected daemon response".into())
        }
    }
}

fn handle_kill(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let session_id = matches
        .get_one::<String>("session")
        .ok_or("Session argument is required")?;
    let force = matches.get_flag("force");

    info!(event = "cli.session.kill_started", session_id = %session_id, force = force);

    match helpers::request(&ClientRequest::SessionKill {
        session_id: session_id.clone(),
        force,
    })? {
        DaemonResponse::Killed { killed: true } => {
            println!("Session {} terminated", session_id);
            info!(event = "cli.session.kill_completed", session_id = %session_id);
            Ok(())
        }
        DaemonResponse::Killed { killed: false } => {
            helpers::print_error(&format!("no such session: {}", session_id));
            Err("Session not found".into())
        }
        other => {
            helpers::print_error(&format!("unexpected response: {:?}", other));
            Err("Unexpected daemon response".into())
        }
    }
}

fn handle_export(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let session_id = matches
        .get_one::<String>("session")
        .ok_or("Session argument is required")?;

    info!(event = "cli.session.export_started", session_id = %session_id);

    match helpers::request(&ClientRequest::SessionExport {
        session_id: session_id.clone(),
    })? {
        DaemonResponse::Exported {
            lines, total_lines, ..
        } => {
            let mut body = lines.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            match matches.get_one::<String>("output") {
                Some(path) => {
                    std::fs::write(path, body)?;
                    eprintln!("Exported {} lines to {}", total_lines, path);
                }
                None => {
                    print!("{}", body);
                }
            }
            info!(
                event = "cli.session.export_completed",
                session_id = %session_id,
                lines = total_lines,
            );
            Ok(())
        }
        other => {
            helpers::print_error(&format!("unexpected response: {:?}", other));
            Err("Unexpected daemon response".into())
        }
    }
}
