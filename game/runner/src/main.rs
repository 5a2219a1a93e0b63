mod config;
mod term_host;

use clap::Parser;
use config::RunnerConfig;
use flint::logging;
use grabcore::game_state::{GameState, ModifiedEvent};
use grabcore::host::Host;
use grabcore::invite;
use grabcore::main_thread::MainThread;
use grabcore::net::connection::Connection;
use grabcore::net::event::EventKind;
use grabcore::worker::Worker;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use term_host::TermHost;

/// Terminal client for the Wordgrab anagram game.
#[derive(Parser)]
#[command(name = "wordgrab", version)]
struct Args {
    /// Server host name
    #[arg(short = 's', long = "server")]
    server: Option<String>,

    /// Server port
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Room to join for a new game
    #[arg(short = 'r', long = "room")]
    room: Option<String>,

    /// Player name
    #[arg(short = 'n', long = "name")]
    player_name: Option<String>,

    /// An invite URL of a game to join
    #[arg(short = 'u', long = "url")]
    invite_url: Option<String>,

    /// Optional TOML configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

enum Input {
    /// The main-thread queue has callbacks due.
    Flush,
    Line(String),
    Eof,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = Args::parse();
    let log = logging::term_logger();

    let config = match &args.config {
        Some(path) => match RunnerConfig::load(path) {
            Ok(config) => config,
            Err(message) => {
                logging::error!(log, "{}", message; "context" => "startup");
                return 1;
            }
        },
        None => RunnerConfig::default(),
    };

    let host = args.server.unwrap_or(config.net.host);
    let port = args.port.unwrap_or(config.net.port);

    let conversation_id = match &args.invite_url {
        Some(url) => match invite::decode(url) {
            Some(id) => Some(id),
            None => {
                logging::error!(log, "invite URL invalid"; "context" => "startup", "url" => %url);
                return 1;
            }
        },
        None => None,
    };

    logging::info!(log, "starting client";
                   "context" => "startup",
                   "server" => %host,
                   "port" => port,
                   "started_at" => flint::time::timestamp_secs());

    let mut connection = Connection::new(&log);

    if let Some(room) = &args.room {
        connection.set_room(room);
    }

    let worker = match Worker::new(connection, &log) {
        Ok(worker) => Arc::new(worker),
        Err(err) => {
            logging::error!(log, "error creating worker"; "context" => "startup", "error" => %err);
            return 1;
        }
    };

    let (tx, rx) = mpsc::channel();

    let wakeup_tx = tx.clone();
    let main_thread = MainThread::new(Box::new(move || {
        drop(wakeup_tx.send(Input::Flush));
    }));

    let game_state = GameState::new(main_thread.clone(), worker.clone(), "en");
    let term_host = Arc::new(TermHost::new(&log));

    install_listeners(&game_state, &term_host);

    worker.queue_address_resolve(&host, port);

    if let Some(conversation_id) = conversation_id {
        // Joining an invited game; the reset pins the id and starts the
        // engine.
        game_state.reset_for_conversation_id(conversation_id);
    } else {
        worker.lock().set_running(true);
    }

    if let Some(player_name) = &args.player_name {
        game_state.set_player_name(player_name);
        game_state.close_dialog();
    } else {
        term_host.request_name();
    }

    let stdin_tx = tx;
    thread::Builder::new()
        .name("StdinReader".to_owned())
        .spawn(move || {
            let stdin = std::io::stdin();

            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if stdin_tx.send(Input::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }

            drop(stdin_tx.send(Input::Eof));
        })
        .expect("Error creating stdin thread");

    for input in rx {
        match input {
            Input::Flush => main_thread.flush_idle_events(),
            Input::Line(line) => {
                if !handle_line(&game_state, &term_host, &line) {
                    break;
                }
            }
            Input::Eof => break,
        }
    }

    game_state.leave();

    0
}

fn install_listeners(game_state: &GameState, term_host: &Arc<TermHost>) {
    let event_host = term_host.clone();
    game_state.event_signal().add(move |event| {
        if let EventKind::Message { player_num, text } = &event.kind {
            event_host.print(&format!("<player {}> {}", player_num, text));
        }
    });

    let modified_host = term_host.clone();
    game_state.modified_signal().add(move |modified| {
        match modified {
            ModifiedEvent::Note { text } => modified_host.print(text),
            ModifiedEvent::Connected => modified_host.queue_redraw(),
            ModifiedEvent::Reset => modified_host.print("(game over, starting fresh)"),
            _ => modified_host.queue_redraw(),
        }
    });
}

/// Maps one input line onto the game-state API. Returns false to quit.
fn handle_line(game_state: &GameState, term_host: &Arc<TermHost>, line: &str) -> bool {
    let line = line.trim();

    if line.is_empty() {
        return true;
    }

    if !line.starts_with('/') {
        game_state.send_message(line);
        return true;
    }

    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or("");

    match command {
        "/quit" => return false,
        "/leave" => game_state.leave(),
        "/shout" => game_state.shout(),
        "/turn" => game_state.turn(),
        "/name" => {
            let name = words.collect::<Vec<_>>().join(" ");

            if name.is_empty() {
                term_host.print("usage: /name <player name>");
            } else {
                game_state.set_player_name(&name);
                game_state.close_dialog();
            }
        }
        "/tiles" => match words.next().and_then(|n| n.parse().ok()) {
            Some(n_tiles) => game_state.set_n_tiles(n_tiles),
            None => term_host.print("usage: /tiles <count>"),
        },
        "/lang" => match words.next() {
            Some(code) => game_state.set_language(code),
            None => term_host.print("usage: /lang <code>"),
        },
        "/move" => {
            let parsed = (
                words.next().and_then(|w| w.parse().ok()),
                words.next().and_then(|w| w.parse().ok()),
                words.next().and_then(|w| w.parse().ok()),
            );

            match parsed {
                (Some(num), Some(x), Some(y)) => game_state.move_tile(num, x, y),
                _ => term_host.print("usage: /move <tile> <x> <y>"),
            }
        }
        "/invite" => match game_state.get_conversation_id() {
            Some(conversation_id) => {
                term_host.share_link(&invite::encode(conversation_id), (0, 0, 0, 0));
            }
            None => term_host.print("no game to invite to yet"),
        },
        "/state" => term_host.print(&game_state.save_instance_state()),
        "/version" => {
            let version = term_host.get_app_version();
            term_host.print(&version);
        }
        _ => term_host.print("commands: /quit /leave /shout /turn /name /tiles /lang /move /invite /state /version"),
    }

    true
}
