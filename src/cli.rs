use clap::Parser;
use std::path::PathBuf;

// Build version with target info
const VERSION_INFO: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\nRenderer: external process (melt compatible)"
);

/// Pre-render a timeline into cached preview chunks
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Scene description handed to the renderer (copied into the cache per batch)
    #[arg(short = 's', long = "scene", value_name = "FILE")]
    pub scene: PathBuf,

    /// Timeline length in frames
    #[arg(short = 'd', long = "duration", value_name = "FRAMES")]
    pub duration: i32,

    /// Document id the cache is keyed by (default: derived from the scene file name)
    #[arg(long = "document-id", value_name = "ID")]
    pub document_id: Option<String>,

    /// Frame range to preview (default: whole timeline)
    #[arg(long = "range", value_names = ["START", "END"], num_args = 2)]
    pub range: Option<Vec<i32>>,

    /// Revoke the range instead of rendering it (whole cache without --range)
    #[arg(long = "clear")]
    pub clear: bool,

    /// Render engine executable
    #[arg(short = 'r', long = "renderer", value_name = "PATH")]
    pub renderer: Option<PathBuf>,

    /// Consumer parameters, space separated
    #[arg(long = "params", value_name = "STR")]
    pub params: Option<String>,

    /// Chunk file extension
    #[arg(long = "ext", value_name = "EXT")]
    pub extension: Option<String>,

    /// Frames per chunk
    #[arg(long = "chunk-size", value_name = "N")]
    pub chunk_size: Option<i32>,

    /// Preview cache root (overrides PREVIEW_CACHE_DIR and platform default)
    #[arg(long = "cache-dir", value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Enable logging to file (default: preview-cache.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl Args {
    /// Requested range as an ordered pair.
    pub fn frame_range(&self) -> Option<(i32, i32)> {
        match self.range.as_deref() {
            Some([a, b]) => Some(((*a).min(*b), (*a).max(*b))),
            _ => None,
        }
    }
}
