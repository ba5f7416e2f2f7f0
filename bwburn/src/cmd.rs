use core::num::NonZero;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Saturates network egress by downloading the given URLs in an endless
/// loop, discarding the bodies and reporting aggregate throughput.
#[derive(Debug, Clone, Parser)]
#[command(version = build_version(), about)]
pub struct Cmd {
    /// Target URLs.
    ///
    /// When no URL is given on the command line the list is loaded from the
    /// file specified by --file.
    pub urls: Vec<String>,
    /// Number of concurrent downloads.
    #[clap(short, long, default_value_t = NonZero::<usize>::new(32).unwrap(), env = "CONCURRENCY")]
    pub concurrency: NonZero<usize>,
    /// Runtime in seconds before the process stops on its own (0 disables
    /// the deadline).
    #[clap(short, long, default_value_t = 0, env = "TIMEOUT")]
    pub timeout: u64,
    /// Reuse connections between requests instead of reconnecting for every
    /// download.
    #[clap(short, long, env = "KeepAlives")]
    pub keep_alive: bool,
    /// Fixed User-Agent header.
    ///
    /// When not given, every request carries a freshly randomized one.
    #[clap(long, env = "UserAgent")]
    pub user_agent: Option<String>,
    /// Custom header in 'Key: Value' form, overriding any same-named header
    /// (can be specified multiple times).
    #[clap(short = 'H', long = "header", value_name = "KEY: VALUE")]
    pub headers: Vec<String>,
    /// Force connections to HOST:PORT onto the given IP, bypassing name
    /// resolution (can be specified multiple times, format 'host:port:ip'
    /// or 'host::ip' where the port defaults to 80).
    #[clap(long, value_name = "HOST:PORT:IP")]
    pub resolve: Vec<String>,
    /// Path to a newline-delimited URL list.
    ///
    /// Blank lines and lines starting with '#' are skipped, surrounding
    /// whitespace is trimmed.
    #[clap(short, long, env = "DOWN_FILE", value_name = "PATH")]
    pub file: Option<PathBuf>,
    /// Be verbose in terms of logging.
    #[clap(short, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Version plus build identifier, e.g. "0.4.0 (1f2e3d4)".
pub fn build_version() -> String {
    let commit = option_env!("BWBURN_COMMIT").unwrap_or("unknown");

    format!("{} ({})", env!("CARGO_PKG_VERSION"), commit)
}
