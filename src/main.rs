use preview_cache::cli::Args;
use preview_cache::config::{DocumentSettings, PreviewConfig};
use preview_cache::core::events::{ChunkRendered, RenderFailed, RenderProgress};
use preview_cache::core::{ChunkId, FileScene, PlaylistDirHost, PreviewScheduler, ProcessEngine};
use preview_cache::paths::{self, PathConfig};
use preview_cache::EventBus;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

const CONFIG_FILE: &str = "preview.json";
const LOG_FILE: &str = "preview-cache.log";
const CHUNKS_FILE: &str = "chunks.json";
const TRACKS_DIR: &str = "tracks";

/// Chunk lists saved between runs, ids as strings
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ChunkRecord {
    rendered: Vec<String>,
    dirty: Vec<String>,
}

impl ChunkRecord {
    fn load(path: &Path) -> Self {
        let Ok(json) = std::fs::read_to_string(path) else {
            debug!("No chunk record at {}", path.display());
            return Self::default();
        };
        serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!("Ignoring unreadable chunk record {}: {}", path.display(), e);
            Self::default()
        })
    }

    fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize chunk record")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn ids(list: &[String]) -> Vec<ChunkId> {
        list.iter()
            .filter_map(|s| match s.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!("Skipping invalid chunk id {:?}", s);
                    None
                }
            })
            .collect()
    }
}

/// Document id from the scene file name, reduced to path-safe characters.
fn document_id_for(scene: &Path) -> String {
    let stem = scene.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let id: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if id.is_empty() { "untitled".to_string() } else { id }
}

fn init_logging(args: &Args, path_config: &PathConfig) {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| paths::data_file(LOG_FILE, path_config));

        match std::fs::File::create(&log_path) {
            Ok(file) => {
                env_logger::Builder::new()
                    .filter_level(log_level)
                    .format_timestamp_millis()
                    .target(env_logger::Target::Pipe(Box::new(file)))
                    .init();
                info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
                return;
            }
            Err(e) => eprintln!("Warning: Failed to create log file {}: {}", log_path.display(), e),
        }
    }

    // Console logging (respects RUST_LOG if set)
    let default_level = match args.verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

/// Returns false when the render batch failed.
fn run(args: &Args, path_config: &PathConfig) -> Result<bool> {
    if args.duration <= 0 {
        bail!("Timeline duration must be positive, got {}", args.duration);
    }
    if !args.scene.is_file() {
        bail!("Scene file not found: {}", args.scene.display());
    }

    let mut config = PreviewConfig::load(&paths::config_file(CONFIG_FILE, path_config))?;
    if let Some(size) = args.chunk_size {
        config.chunk_size = size.max(1);
    }
    if let Some(renderer) = &args.renderer {
        config.renderer = renderer.clone();
    }
    // Rendering is driven synchronously below
    config.autopreview = false;

    let mut document = DocumentSettings::new(args.document_id.clone().unwrap_or_else(|| document_id_for(&args.scene)));
    document.saved = true;
    if let Some(params) = &args.params {
        document.preview_parameters = params.clone();
    }
    if let Some(ext) = &args.extension {
        document.preview_extension = ext.clone();
    }
    // Chunks rendered before the scene last changed are stale
    document.last_saved = std::fs::metadata(&args.scene).and_then(|m| m.modified()).ok();

    let cache_root = paths::cache_root(path_config);
    let doc_dir = cache_root.join(&document.document_id);
    let record_path = doc_dir.join(CHUNKS_FILE);
    let tracks_dir = doc_dir.join(TRACKS_DIR);
    let record = ChunkRecord::load(&record_path);

    let bus = EventBus::new();
    bus.subscribe::<ChunkRendered, _>(|e| info!("Chunk {} ready: {}", e.id, e.path.display()));
    bus.subscribe::<RenderProgress, _>(|e| debug!("Progress {}/1000", e.permille));
    bus.subscribe::<RenderFailed, _>(|e| eprintln!("Rendering chunk {} failed:\n{}", e.chunk, e.log));

    let engine = Arc::new(ProcessEngine::new());
    let scheduler = PreviewScheduler::new(
        config,
        &document,
        &cache_root,
        engine,
        Arc::new(FileScene::new(&args.scene, args.duration)),
        Box::new(PlaylistDirHost::new(&tracks_dir)?),
        bus,
    )
    .context("Failed to initialize timeline preview")?;

    scheduler.load_chunks(
        &ChunkRecord::ids(&record.rendered),
        &ChunkRecord::ids(&record.dirty),
        document.last_saved,
    );

    let (start, end) = args.frame_range().unwrap_or((0, args.duration - 1));
    if args.clear {
        if args.range.is_some() {
            scheduler.add_preview_range(start, end, false);
        } else {
            scheduler.clear_preview_range(true);
        }
    } else {
        scheduler.add_preview_range(start, end, true);
        scheduler.start_render();
        scheduler.wait_idle();
    }

    let failure = scheduler.take_failure();
    let (rendered, dirty) = scheduler.preview_chunks();
    println!("Cache:    {}", scheduler.store().primary_dir().display());
    println!("Rendered: {} chunks", rendered.len());
    println!("Dirty:    {} chunks", dirty.len());

    ChunkRecord { rendered, dirty }.save(&record_path)?;
    drop(scheduler);
    // Track files were detached with the scheduler
    let _ = std::fs::remove_dir(&tracks_dir);

    match failure {
        Some(e) => {
            error!("{}", e);
            Ok(false)
        }
        None => Ok(true),
    }
}

fn main() -> ExitCode {
    // Parse command-line arguments first (needed for log setup)
    let args = Args::parse();

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone(), args.cache_dir.clone());
    if let Err(e) = paths::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }

    init_logging(&args, &path_config);
    info!("Timeline preview cache starting...");
    debug!("Command-line args: {:?}", args);

    match run(&args, &path_config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
