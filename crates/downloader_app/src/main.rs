mod host;

use std::path::PathBuf;

use clap::Parser;
use host::logging::{self, LogDestination};
use log::LevelFilter;

/// Download audio from direct links or media pages.
#[derive(Debug, Parser)]
#[command(name = "downloader", version)]
pub struct Cli {
    /// RON settings file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Source that resolves the inputs (`direct_url` or `media`).
    #[arg(long, value_name = "ID")]
    pub source: Option<String>,

    /// Audio preset for media sources, e.g. `flac` or `mp3-320`.
    #[arg(long, value_name = "KEY")]
    pub preset: Option<String>,

    /// Print the download history and exit.
    #[arg(long)]
    pub history: bool,

    /// Where log output goes.
    #[arg(long, value_enum, default_value_t = LogDestination::File)]
    pub log: LogDestination,

    /// Log at debug level.
    #[arg(short, long)]
    pub verbose: bool,

    /// URLs or search queries.
    #[arg(required_unless_present = "history")]
    pub inputs: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    logging::initialize(cli.log, level);
    host::app::run(cli)
}
