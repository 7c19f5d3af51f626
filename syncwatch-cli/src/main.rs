//! Syncwatch - headless client
//!
//! Joins a room and keeps a local mpv or VLC instance in sync with it. Lines
//! typed on stdin are sent as chat; `/help` lists the commands.
//!
//! Usage:
//!   mpv --input-ipc-server=/tmp/mpv.sock &
//!   syncwatch --name alice --room movie-night --socket /tmp/mpv.sock
//!   vlc --extraintf rc --rc-unix /tmp/vlc.sock &
//!   syncwatch --name alice --player vlc --socket /tmp/vlc.sock
//!   syncwatch --host example.org --port 8999 --no-tls --media-dir ~/Videos

use std::path::PathBuf;
use std::sync::Arc;

use syncwatch_core::{
    init_tracing, Advisory, ChatKind, ChatRecord, Client, ClientCallback, ClientConfig, ConnectionState,
    Member, PlayerStatus, PlaylistState, SessionIdentity,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const USAGE: &str = "\
usage: syncwatch --name <user> [--room <room>] [--host <host>] [--port <port>]
                 [--password <password>] [--player <path>] [--socket <path>]
                 [--media-dir <dir>]...
                 [--controller] [--no-tls] [--pause-on-leave]";

/// Prints everything the client reports to the log
struct LogCallback;

impl ClientCallback for LogCallback {
    fn on_connection_state_changed(&self, state: ConnectionState) {
        info!("Connection: {:?}", state);
    }

    fn on_roster_changed(&self, members: Vec<Member>) {
        let names: Vec<String> = members
            .iter()
            .map(|m| match m.is_ready {
                Some(true) => format!("{} (ready)", m.username),
                _ => m.username.clone(),
            })
            .collect();
        info!("Room: {}", names.join(", "));
    }

    fn on_chat(&self, record: ChatRecord) {
        let time = record.timestamp.format("%H:%M:%S");
        match (record.kind, &record.username) {
            (ChatKind::User, Some(user)) => println!("[{}] <{}> {}", time, user, record.text),
            (ChatKind::Error, _) => println!("[{}] ! {}", time, record.text),
            _ => println!("[{}] * {}", time, record.text),
        }
    }

    fn on_playlist_changed(&self, playlist: PlaylistState) {
        info!(
            "Playlist: {} item(s), current {:?}",
            playlist.len(),
            playlist.current_item()
        );
    }

    fn on_player_state(&self, _status: PlayerStatus) {}

    fn on_advisory(&self, advisory: Advisory) {
        // Already echoed into chat as an error record
        if let Advisory::SessionError { fatal: true, .. } = advisory {
            error!("The server ended the session");
        }
    }
}

#[derive(Debug)]
struct Args {
    config: ClientConfig,
    identity: SessionIdentity,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut config = ClientConfig::default();
    let mut name = None;
    let mut room = "default".to_string();
    let mut password = None;
    let mut controller = false;

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().ok_or_else(|| format!("{} needs a value", flag));
        match arg.as_str() {
            "--name" | "-n" => name = Some(value(&arg)?),
            "--room" | "-r" => room = value(&arg)?,
            "--host" => config.server.host = value(&arg)?,
            "--port" => {
                let port = value(&arg)?;
                config.server.port = port.parse().map_err(|_| format!("invalid port: {}", port))?;
            }
            "--password" => password = Some(value(&arg)?),
            "--player" => config.player.player_path = Some(value(&arg)?),
            "--socket" => config.player.socket_path = Some(PathBuf::from(value(&arg)?)),
            "--media-dir" => config.player.media_directories.push(PathBuf::from(value(&arg)?)),
            "--controller" => controller = true,
            "--no-tls" => config.server.use_tls = false,
            "--pause-on-leave" => config.sync.pause_on_leave = true,
            "--help" | "-h" => return Err(USAGE.to_string()),
            other => return Err(format!("unknown argument: {}\n{}", other, USAGE)),
        }
    }

    let name = name.ok_or_else(|| format!("--name is required\n{}", USAGE))?;
    let mut identity = SessionIdentity::new(name, room).with_controller(controller);
    if let Some(password) = password {
        identity = identity.with_password(password);
    }
    Ok(Args { config, identity })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Args { config, identity } = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };

    init_tracing();
    let has_player = config.player.socket_path.is_some();
    let client = Client::new(config, identity)?;
    client.set_callback(Arc::new(LogCallback));
    if has_player {
        client.start_player_supervisor();
    }

    client.connect().await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = client.send_chat_input(&line) {
                        warn!("{}", e);
                    }
                }
                // stdin closed; keep syncing until interrupted
                Ok(None) => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => {
                    warn!("Reading stdin failed: {}", e);
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncwatch_core::PlayerKind;

    fn parse(line: &str) -> Result<Args, String> {
        parse_args(line.split_whitespace().map(str::to_string))
    }

    #[test]
    fn test_parse_full_command_line() {
        let args = parse("--name alice --room cinema --port 9000 --no-tls --controller --media-dir /a --media-dir /b")
            .unwrap();
        assert_eq!(args.identity.username, "alice");
        assert_eq!(args.identity.room, "cinema");
        assert!(args.identity.controller);
        assert_eq!(args.config.server.port, 9000);
        assert!(!args.config.server.use_tls);
        assert_eq!(args.config.player.media_directories.len(), 2);
        assert_eq!(args.config.player.resolved_kind(), PlayerKind::Mpv);
    }

    #[test]
    fn test_player_path_picks_the_dialect() {
        let args = parse("--name alice --player /usr/bin/vlc --socket /tmp/vlc.sock").unwrap();
        assert_eq!(args.config.player.resolved_kind(), PlayerKind::Vlc);
        assert!(args.config.validate().is_ok());

        let args = parse("--name alice --player mpc-hc64.exe").unwrap();
        assert!(args.config.validate().is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("--room cinema").unwrap_err().contains("--name is required"));
        assert!(parse("--name alice --port nope").unwrap_err().contains("invalid port"));
        assert!(parse("--name").unwrap_err().contains("needs a value"));
        assert!(parse("--name alice --bogus").unwrap_err().contains("unknown argument"));
    }
}
