//! Command-line argument parsing for dagchat.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default directory holding the node's RocksDB state.
pub const DEFAULT_DATA_DIR: &str = "./dagchat-data";

/// Default listen address for `serve`.
pub const DEFAULT_BIND: &str = "127.0.0.1:7420";

/// Number of messages `read` prints when no limit is given.
pub const DEFAULT_READ_LIMIT: usize = 20;

/// How long `join` waits for an invite when no timeout is given.
pub const DEFAULT_INVITE_TIMEOUT_SECS: u64 = 300;

/// Command-line interface commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init {
        name: String,
    },
    Create {
        channel: String,
    },
    Channels,
    Post {
        channel: String,
        body: String,
    },
    Read {
        channel: String,
        limit: usize,
    },
    Serve {
        bind: SocketAddr,
        peers: Vec<SocketAddr>,
    },
    Join {
        bind: SocketAddr,
        timeout: Duration,
    },
    Invite {
        channel: String,
        request: String,
        name: String,
        peer: SocketAddr,
    },
    Help,
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub data_dir: PathBuf,
    pub command: Command,
}

fn usage_error(msg: impl std::fmt::Display) -> Error {
    Error::config(msg)
}

fn parse_positive(flag: &str, value: Option<String>) -> Result<u64> {
    let value = value.ok_or_else(|| usage_error(format!("{} requires a number", flag)))?;
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(usage_error(format!("{} must be a positive number, got '{}'", flag, value))),
    }
}

fn parse_addr(flag: &str, value: Option<String>) -> Result<SocketAddr> {
    let value = value.ok_or_else(|| usage_error(format!("{} requires an address", flag)))?;
    value
        .parse()
        .map_err(|e| usage_error(format!("Invalid address '{}' for {}: {}", value, flag, e)))
}

/// Parse command line arguments (without the program name).
pub fn parse_args<I>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = String>,
{
    let mut data_dir = PathBuf::from(DEFAULT_DATA_DIR);
    let mut positional = Vec::new();
    let mut limit = None;
    let mut timeout = None;
    let mut bind = None;
    let mut peers = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => {
                data_dir = args
                    .next()
                    .map(PathBuf::from)
                    .ok_or_else(|| usage_error("--data-dir requires a path"))?;
            }
            "--limit" => limit = Some(parse_positive("--limit", args.next())? as usize),
            "--timeout" => {
                timeout = Some(Duration::from_secs(parse_positive("--timeout", args.next())?))
            }
            "--bind" => bind = Some(parse_addr("--bind", args.next())?),
            "--peer" => peers.push(parse_addr("--peer", args.next())?),
            "-h" | "--help" => {
                return Ok(Invocation {
                    data_dir,
                    command: Command::Help,
                })
            }
            flag if flag.starts_with("--") => {
                return Err(usage_error(format!("Unknown option '{}'", flag)));
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let name = positional.next().unwrap_or_else(|| "help".to_string());
    let mut required = |what: &str| {
        positional
            .next()
            .ok_or_else(|| usage_error(format!("{} requires {}", name, what)))
    };

    let bind = match bind {
        Some(addr) => addr,
        None => parse_addr("--bind", Some(DEFAULT_BIND.to_string()))?,
    };

    let command = match name.as_str() {
        "init" => Command::Init {
            name: required("an identity name")?,
        },
        "create" => Command::Create {
            channel: required("a channel name")?,
        },
        "channels" => Command::Channels,
        "post" => {
            let channel = required("a channel name")?;
            let body = required("a JSON body")?;
            Command::Post { channel, body }
        }
        "read" => Command::Read {
            channel: required("a channel name")?,
            limit: limit.unwrap_or(DEFAULT_READ_LIMIT),
        },
        "serve" => Command::Serve { bind, peers },
        "join" => Command::Join {
            bind,
            timeout: timeout.unwrap_or(Duration::from_secs(DEFAULT_INVITE_TIMEOUT_SECS)),
        },
        "invite" => {
            let channel = required("a channel name")?;
            let request = required("an invite request")?;
            let name = required("a display name")?;
            let peer = match peers.as_slice() {
                [peer] => *peer,
                _ => return Err(usage_error("invite requires exactly one --peer")),
            };
            Command::Invite {
                channel,
                request,
                name,
                peer,
            }
        }
        "help" => Command::Help,
        other => return Err(usage_error(format!("Unknown command '{}'", other))),
    };

    Ok(Invocation { data_dir, command })
}

/// Print usage information
pub fn print_usage() {
    println!("dagchat - end-to-end encrypted group messaging over a message DAG");
    println!();
    println!("Usage: dagchat [--data-dir DIR] <command> [args...]");
    println!();
    println!("Commands:");
    println!("  init <name>                          Create the local identity");
    println!("  create <channel>                     Create a channel rooted at the local identity");
    println!("  channels                             List held channels");
    println!("  post <channel> <json>                Post a JSON body to a channel");
    println!("  read <channel> [--limit N]           Print the latest messages of a channel");
    println!("  serve [--bind ADDR] [--peer ADDR]... Accept peers and sync held channels");
    println!("  join [--bind ADDR] [--timeout SECS]  Print an invite request and wait for the invite");
    println!("  invite <channel> <request> <name> --peer ADDR");
    println!("                                       Delegate posting rights to a joining node");
    println!();
    println!("Options:");
    println!("  --data-dir DIR   State directory (default {})", DEFAULT_DATA_DIR);
    println!();
    println!("Examples:");
    println!("  dagchat init alice");
    println!("  dagchat create general");
    println!("  dagchat post general '{{\"text\":\"hello\"}}'");
    println!("  dagchat serve --bind 0.0.0.0:7420 --peer 10.0.0.2:7420");
    println!("  dagchat join --bind 0.0.0.0:7421");
    println!("  dagchat invite general <request> bob --peer 10.0.0.3:7421");
}
