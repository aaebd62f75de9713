//! Command-line surface for `conjure`.

use clap::{Args, Parser, Subcommand};

use conjure_storage::gc::{DEFAULT_GC_INTERVAL_MS, DEFAULT_GC_PAGE_SIZE, DEFAULT_GC_WAIT_PAGES};

#[derive(Parser, Debug)]
#[command(name = "conjure", version, about = "Maintain and inspect a conjure invalidation index", long_about = None)]
pub struct Cli {
    /// Store URL
    #[arg(long, env = "CONJURE_REDIS_URL", default_value = conjure_core::config::DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Override the host part of the store URL
    #[arg(long)]
    pub host: Option<String>,

    /// Keys carry `{tag}` routing prefixes
    #[arg(long, env = "CONJURE_CLUSTERED")]
    pub clustered: bool,

    /// Emit logs and reports as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Prune stale members from conjunction sets (LRU deployments only)
    Gc(GcArgs),
    /// Report the largest sets or payloads, or one table's index shape
    Top(TopArgs),
    /// Count keys per routing tag
    Tags(ScanArgs),
}

/// Paging shared by every scanning command.
#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// Stop after this many pages
    #[arg(long)]
    pub pages: Option<u64>,

    /// Count hint for each scan call
    #[arg(long, default_value_t = DEFAULT_GC_PAGE_SIZE)]
    pub page_size: usize,
}

#[derive(Args, Debug)]
pub struct GcArgs {
    #[command(flatten)]
    pub scan: ScanArgs,

    /// Milliseconds to pause after every `--wait-pages` pages
    #[arg(long, default_value_t = DEFAULT_GC_INTERVAL_MS)]
    pub interval_ms: u64,

    /// Pages to process between pauses
    #[arg(long, default_value_t = DEFAULT_GC_WAIT_PAGES)]
    pub wait_pages: u64,

    /// Sweep only this conjunction set
    #[arg(long)]
    pub conj: Option<String>,

    /// The store evicts keys itself
    #[arg(long, env = "CONJURE_LRU")]
    pub lru: bool,

    /// Keep running, sweeping every this many seconds until interrupted
    #[arg(long)]
    pub every_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct TopArgs {
    #[command(flatten)]
    pub scan: ScanArgs,

    /// Number of items to display
    #[arg(long, default_value_t = 20)]
    pub display: usize,

    #[command(subcommand)]
    pub target: TopTarget,
}

#[derive(Subcommand, Debug)]
pub enum TopTarget {
    /// Conjunction sets with the most members
    Sets,
    /// Cached payloads with the most bytes
    Keys,
    /// Set and member counts for one table
    Table {
        /// Table name
        table: String,
    },
}
