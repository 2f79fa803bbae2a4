//! CLI module for minik8s
//!
//! - `minik8s serve` - Run the control plane relay (store, bus, watch registry, API)
//! - `minik8s put|get|delete` - Read and write keys on a running control plane
//! - `minik8s watch` - List a key and follow its changes through the relay

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "minik8s")]
#[command(about = "Cluster state store with a shared change-notification relay")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.minik8s/config.yaml)
    #[arg(long, global = true, env = "MINIK8S_CONFIG")]
    pub config: Option<PathBuf>,

    /// Control plane URL for client commands (overrides the config file)
    #[arg(long, global = true, env = "MINIK8S_SERVER")]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control plane
    Serve(ServeArgs),

    /// Write a key
    Put(PutArgs),

    /// Read a key or every key under a prefix
    Get(GetArgs),

    /// Delete a key
    Delete(DeleteArgs),

    /// Follow changes to a collection or a single object
    Watch(WatchArgs),
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Bind address for the server
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Port to listen on (default: 8282)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Seconds before a disconnected store watch is re-opened
    #[arg(long)]
    pub reopen_backoff: Option<u64>,
}

/// Arguments for the put command
#[derive(Parser, Debug)]
pub struct PutArgs {
    /// Full key, e.g. /registry/pod/default/web
    pub key: String,

    /// Value to store
    pub value: String,
}

/// Arguments for the get command
#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Key or key prefix
    pub key: String,

    /// Treat the key as a prefix and list everything under it
    #[arg(long)]
    pub prefix: bool,

    /// Print raw JSON instead of a table
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for the delete command
#[derive(Parser, Debug)]
pub struct DeleteArgs {
    /// Key to delete
    pub key: String,
}

/// Arguments for the watch command
#[derive(Parser, Debug)]
pub struct WatchArgs {
    /// Resource kind, e.g. pod
    pub kind: String,

    /// Namespace
    #[arg(short, long, default_value = "default")]
    pub namespace: String,

    /// Watch a single object instead of the whole collection
    pub name: Option<String>,

    /// Keep a reconciled cache and print cache changes instead of raw events
    #[arg(long)]
    pub informer: bool,
}

impl Cli {
    /// Apply command-line overrides on top of file configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(server) = &self.server {
            config.control_plane = server.trim_end_matches('/').to_string();
        }
        if let Commands::Serve(args) = &self.command {
            if let Some(bind_addr) = &args.bind_addr {
                config.server.bind_addr = bind_addr.clone();
            }
            if let Some(port) = args.port {
                config.server.port = port;
            }
            if let Some(secs) = args.reopen_backoff {
                config.watch.reopen_backoff_secs = secs;
            }
        }
    }
}
