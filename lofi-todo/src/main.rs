//! Collaborative terminal todo list.
//!
//! Runs against a relay (see the `lofi-relay` binary) and a local
//! RocksDB store, so the list syncs live with other participants and
//! survives restarts. Commands:
//!
//! ```text
//! add <text>     append an item
//! done <n>       mark item n completed
//! open <n>       mark item n not completed
//! edit <n> <t>   rewrite item n
//! rm <n>         remove item n
//! clear          drop completed items
//! who            show who else is here
//! quit           exit
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lofi_replica::observe::ObserveKind;
use lofi_replica::persistence::{StoreConfig, UpdateStore};
use lofi_replica::presence::{Payload, PresenceOptions};
use lofi_replica::scope::{ManagerConfig, ScopeEvent, ScopeManager, SHARED_SCOPE};
use tokio::io::{AsyncBufReadExt, BufReader};

use lofi_todo::TodoList;

struct Args {
    endpoint: String,
    data_dir: PathBuf,
    name: String,
}

fn parse_args() -> Args {
    let mut endpoint = "ws://127.0.0.1:4444".to_string();
    let mut data_dir = PathBuf::from("lofi_data");
    let mut name = whoami();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--relay" => {
                if let Some(v) = args.next() {
                    endpoint = v;
                }
            }
            "--data" => {
                if let Some(v) = args.next() {
                    data_dir = PathBuf::from(v);
                }
            }
            "--name" => {
                if let Some(v) = args.next() {
                    name = v;
                }
            }
            other => {
                eprintln!("unknown argument: {other}");
                eprintln!("usage: lofi-todo [--relay ws://host:port] [--data dir] [--name who]");
                std::process::exit(2);
            }
        }
    }

    Args {
        endpoint,
        data_dir,
        name,
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = parse_args();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(UpdateStore::open(StoreConfig {
        path: args.data_dir.clone(),
        ..StoreConfig::default()
    })?);

    let manager = ScopeManager::new(ManagerConfig {
        store: Some(store),
        endpoints: vec![args.endpoint.clone()],
        ..ManagerConfig::default()
    });

    let scope = manager.acquire(SHARED_SCOPE);
    let todos = TodoList::new(&scope)?;
    let observation = todos.observe(ObserveKind::Shallow);

    let presence = scope.presence()?;
    let mut payload = Payload::new();
    payload.insert("name".into(), serde_json::Value::String(args.name.clone()));
    presence.set_local(payload);
    let roster = presence.observe(PresenceOptions::default());

    println!("lofi-todo — '{}' as {}", SHARED_SCOPE, args.name);
    println!("type 'help' for commands");
    render(&todos);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(50));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for event in scope.poll()? {
                    match event {
                        ScopeEvent::Connected => println!("* connected to {}", args.endpoint),
                        ScopeEvent::ConnectFailed(reason) => {
                            println!("* offline ({reason}); edits are kept locally")
                        }
                        ScopeEvent::Disconnected => println!("* connection lost"),
                        ScopeEvent::Hydrated { updates } => {
                            log::debug!("hydrated from {updates} stored updates")
                        }
                        ScopeEvent::StoreFailed(e) => println!("* persistence error: {e}"),
                        ScopeEvent::RemoteApplied { .. } | ScopeEvent::PresenceChanged => {}
                    }
                }
                if observation.take() {
                    render(&todos);
                }
                if roster.changed() {
                    let names: Vec<String> = roster
                        .snapshot()
                        .into_iter()
                        .filter_map(|(_, p)| {
                            p.get("name").and_then(|v| v.as_str()).map(str::to_string)
                        })
                        .collect();
                    if !names.is_empty() {
                        println!("* here now: {}", names.join(", "));
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !dispatch(line.trim(), &todos, &roster) {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Returns false when the user asked to quit.
fn dispatch(line: &str, todos: &TodoList, roster: &lofi_replica::presence::PresenceView) -> bool {
    let (command, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "add" if !rest.is_empty() => todos.add(rest),
        "done" | "open" => match rest.parse::<u32>() {
            Ok(n) => todos.set_done(n, command == "done"),
            Err(_) => println!("usage: {command} <index>"),
        },
        "edit" => match rest.split_once(' ') {
            Some((n, text)) => match n.parse::<u32>() {
                Ok(n) if !text.trim().is_empty() => todos.edit(n, text.trim()),
                _ => println!("usage: edit <index> <text>"),
            },
            None => println!("usage: edit <index> <text>"),
        },
        "rm" => match rest.parse::<u32>() {
            Ok(n) => todos.remove(n),
            Err(_) => println!("usage: rm <index>"),
        },
        "clear" => {
            let removed = todos.clear_completed();
            println!("* cleared {removed} completed item(s)");
        }
        "who" => {
            let roster = roster.snapshot();
            if roster.is_empty() {
                println!("* nobody else is here");
            } else {
                for (id, payload) in roster {
                    let name = payload
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("anonymous");
                    println!("* {name} ({id})");
                }
            }
        }
        "help" => {
            println!("add <text> | done <n> | open <n> | edit <n> <text> | rm <n>");
            println!("clear | who | quit");
        }
        "quit" | "exit" => return false,
        _ => println!("unknown command (try 'help')"),
    }
    true
}

fn render(todos: &TodoList) {
    let items = todos.items();
    if items.is_empty() {
        println!("  (empty)");
        return;
    }
    for (i, item) in items.iter().enumerate() {
        let mark = if item.done { "x" } else { " " };
        println!("  {i:>3} [{mark}] {}", item.text);
    }
}
