use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "clipforge")]
#[command(author, version, about = "Durable queue-driven video transcoding")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run worker loops until interrupted
    Worker {
        /// Number of worker loops (overrides worker.concurrency)
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,

        /// Process a single batch and exit
        #[arg(long)]
        once: bool,
    },

    /// Create a job for a source already in blob storage
    Enqueue {
        /// Owner of the job
        #[arg(long)]
        owner: String,

        /// Blob key of the source video
        source_ref: String,
    },

    /// Upload a local video and create a job for it
    Upload {
        /// Owner of the job
        #[arg(long)]
        owner: String,

        /// Video file to upload
        file: PathBuf,

        /// MIME type (guessed from the extension if omitted)
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Show the status of one job
    Status {
        #[arg(long)]
        owner: String,

        job_id: String,

        /// Also print a signed download link
        #[arg(long)]
        link: bool,
    },

    /// List an owner's jobs
    List {
        #[arg(long)]
        owner: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List every job (admin)
    Jobs {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Put a failed job back on the queue
    Requeue {
        #[arg(long)]
        owner: String,

        job_id: String,
    },

    /// Delete a job and its stored files (admin)
    Delete {
        #[arg(long)]
        owner: String,

        job_id: String,
    },

    /// Record and dispose of dead-lettered messages
    DrainDlq {
        /// Messages to take per receive (1-10)
        #[arg(long, default_value = "10")]
        batch: u32,

        /// What to do with each message after recording it
        #[arg(long, value_enum, default_value = "inspect")]
        mode: DrainModeArg,

        /// Keep draining until the dead-letter queue is empty
        #[arg(long)]
        all: bool,
    },

    /// Show dead-letter records written by previous drains
    DeadLetters {
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Summarize jobs and queue depths
    Report {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum DrainModeArg {
    Inspect,
    Requeue,
}
