//! CLI argument definitions for rago.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// rago -- a local RAG knowledge base with a tool-using agent.
#[derive(Parser, Debug)]
#[command(
    name = "rago",
    version,
    about = "rago -- local RAG knowledge base and agent runtime",
    long_about = "Index documents into a local vector store, query them, and run an agent \
                  that plans and executes multi-step goals with the knowledge base, memory \
                  and MCP tools."
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Path to a rago.toml (defaults to ./rago.toml, then ~/.rago/rago.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the knowledge base.
    Rag {
        #[command(subcommand)]
        action: RagAction,
    },

    /// Run the agent.
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum RagAction {
    /// List indexed documents.
    List {
        /// Show each document's metadata.
        #[arg(long, short)]
        metadata: bool,

        /// One line per document.
        #[arg(long, short)]
        compact: bool,
    },

    /// Index files, or inline text with --text.
    Ingest {
        /// Files to index.
        paths: Vec<PathBuf>,

        /// Index this text instead of files.
        #[arg(long, conflicts_with = "paths")]
        text: Option<String>,

        /// Source label stored with inline text.
        #[arg(long)]
        source: Option<String>,

        /// Metadata as key=value, repeatable.
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },

    /// Search the knowledge base.
    Query {
        query: String,

        /// Number of chunks to return (defaults to sqvect.top_k).
        #[arg(long, short = 'k')]
        top_k: Option<usize>,

        /// Only print the matched chunks, skip answer synthesis.
        #[arg(long)]
        no_answer: bool,

        /// Print the response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete every document and chunk.
    Reset {
        /// Skip the confirmation prompt.
        #[arg(long, short)]
        yes: bool,
    },

    /// Load documents from an export file.
    Import { file: PathBuf },

    /// Write every document and chunk as JSON (stdout when no file is given).
    Export { file: Option<PathBuf> },
}

#[derive(Subcommand, Debug)]
pub enum AgentAction {
    /// Run a goal to completion and print the answer.
    Run {
        goal: String,

        /// Resume an existing session.
        #[arg(long, short)]
        session: Option<String>,

        /// Ask the LLM to verify the answer against the goal.
        #[arg(long)]
        verify: bool,
    },

    /// Interactive chat.
    Chat {
        /// Resume an existing session.
        #[arg(long, short)]
        session: Option<String>,
    },

    /// Create and store a plan without running it.
    Plan {
        goal: String,

        /// Plan in the context of this session.
        #[arg(long, short)]
        session: Option<String>,

        /// Print the plan as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Execute a stored plan.
    Execute {
        plan_id: String,

        /// Print the finished plan as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List stored sessions.
    Sessions {
        /// Delete this session instead of listing.
        #[arg(long, value_name = "ID")]
        delete: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// List stored plans.
    Plans {
        /// Only plans of this session.
        #[arg(long, short)]
        session: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Print the plans as JSON.
        #[arg(long)]
        json: bool,
    },
}
