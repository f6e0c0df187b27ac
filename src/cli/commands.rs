use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "agent-chat")]
#[command(about = "Chat with a remote autonomous agent from the terminal", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Agent service base URL (overrides the config file)
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one message and stream the answer
    Send {
        /// Message text
        text: String,
        /// Continue this session instead of starting a new one
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Interactive chat (/new, /load <id>, /sessions, /quit)
    Chat {
        /// Session to continue
        #[arg(short, long)]
        session: Option<String>,
    },
    /// List sessions
    Sessions {
        /// Only show sessions whose title or id contains this text
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Show the merged timeline of a session
    History {
        /// Session ID
        session_id: String,
    },
    /// Rename a session
    Rename {
        /// Session ID
        session_id: String,
        /// New title
        title: String,
    },
    /// Delete a session
    Delete {
        /// Session ID
        session_id: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// List models available to the agent
    Models,
    /// Download a model and follow its progress
    Pull {
        /// Model name, e.g. llama3:8b
        name: String,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the config file, including any --server override
        #[arg(long)]
        save: bool,
    },
}
