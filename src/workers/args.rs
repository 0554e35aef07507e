//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`config.toml` in the working directory, or `--conf`)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::NodeConfig;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

pub const DEFAULT_ROOM: &str = "lobby";

/// Sealdrop - encrypted P2P messaging over WebRTC.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// WebSocket URL of the signaling relay.
    #[clap(short, long)]
    pub signaling: Option<String>,

    /// Room to join.
    #[clap(short, long)]
    pub room: Option<String>,

    /// File to send once a peer connects.
    #[clap(long)]
    pub send: Option<PathBuf>,

    /// Only send to this peer id. Defaults to every peer in the room.
    #[clap(long)]
    pub to: Option<Uuid>,

    /// Directory completed incoming messages are written to.
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// Identity key file. Defaults to ~/.sealdrop/identity.key
    #[clap(long)]
    pub identity: Option<PathBuf>,

    /// Configuration file. Defaults to ./config.toml
    #[clap(long)]
    pub conf: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Transfer tuning, only settable from the `[node]` table of the file.
    #[clap(skip)]
    pub node: NodeConfig,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        cli_args.send = cli_args.send.map(Self::resolve_path);
        cli_args.output = cli_args.output.map(Self::resolve_path);
        cli_args.identity = cli_args.identity.map(Self::resolve_path);

        let path = cli_args
            .conf
            .clone()
            .unwrap_or_else(|| PathBuf::from("config.toml"));
        if let Some(file_args) = Self::from_file(&path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    pub fn room(&self) -> &str {
        self.room.as_deref().unwrap_or(DEFAULT_ROOM)
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load args from a TOML file. A present but unreadable file is reported
    /// and ignored.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str::<Args>(&content) {
            Ok(args) => Some(args),
            Err(e) => {
                warn!(event = "config_invalid", path = %path.display(), error = %e, "Ignoring config file");
                None
            }
        }
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.signaling.is_some() {
            file.signaling = cli.signaling;
        }
        if cli.room.is_some() {
            file.room = cli.room;
        }
        if cli.send.is_some() {
            file.send = cli.send;
        }
        if cli.to.is_some() {
            file.to = cli.to;
        }
        if cli.output.is_some() {
            file.output = cli.output;
        }
        if cli.identity.is_some() {
            file.identity = cli.identity;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        file.conf = cli.conf;
        file
    }
}
