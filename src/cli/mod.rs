//! Command-line interface for dagchat.
//!
//! A small node: create an identity, create channels rooted at it, join
//! other nodes' channels by invite, post and read, and serve held channels to
//! peers over TCP.

pub mod args;
pub mod commands;
pub mod utils;

use crate::Result;

pub use args::{Command, Invocation};
pub use utils::NodeConfig;

/// Main entry point for the CLI application
pub async fn run() -> Result<()> {
    let invocation = args::parse_args(std::env::args().skip(1))?;
    let config = NodeConfig::new(&invocation.data_dir);

    match invocation.command {
        Command::Init { name } => commands::init(&config, &name).await,
        Command::Create { channel } => commands::create(&config, &channel).await,
        Command::Channels => commands::channels(&config).await,
        Command::Post { channel, body } => commands::post(&config, &channel, &body).await,
        Command::Read { channel, limit } => commands::read(&config, &channel, limit).await,
        Command::Serve { bind, peers } => {
            commands::serve(&config.for_server(), bind, &peers).await
        }
        Command::Join { bind, timeout } => commands::join(&config, bind, timeout).await,
        Command::Invite {
            channel,
            request,
            name,
            peer,
        } => commands::invite(&config, &channel, &request, &name, peer).await,
        Command::Help => {
            args::print_usage();
            Ok(())
        }
    }
}
