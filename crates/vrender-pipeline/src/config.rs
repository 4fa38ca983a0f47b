//! Controller and render configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;
use vrender_models::{FlagValue, FrameChunk, FrameName, ImageType};
use vrender_storage::join_address;

use crate::error::{PipelineError, PipelineResult};

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound between two queue state samples
    pub poll_interval: Duration,
    /// How long the fleet may have zero live workers before the run aborts
    pub no_worker_timeout: Duration,
    /// Command starting a local broker when none is reachable
    pub bootstrap_command: Vec<String>,
    /// Connection attempts after bootstrapping the broker
    pub connect_attempts: u32,
    /// Worker executable spawned for local replicas
    pub worker_binary: String,
    /// Worker spec, `host[:replicas]` comma separated
    pub workers: String,
    /// Directory receiving local worker logs
    pub worker_log_dir: Option<PathBuf>,
    /// Assume workers are already running
    pub skip_setup: bool,
    /// Draw progress bars
    pub show_progress: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            no_worker_timeout: Duration::from_secs(180),
            bootstrap_command: vec![
                "redis-server".to_string(),
                "--daemonize".to_string(),
                "yes".to_string(),
                "--appendonly".to_string(),
                "yes".to_string(),
            ],
            connect_attempts: 10,
            worker_binary: "vrender-worker".to_string(),
            workers: "127.0.0.1".to_string(),
            worker_log_dir: None,
            skip_setup: false,
            show_progress: true,
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_parse("PIPELINE_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            no_worker_timeout: env_parse("PIPELINE_NO_WORKER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.no_worker_timeout),
            bootstrap_command: env_string("PIPELINE_BROKER_BOOTSTRAP")
                .map(|cmd| cmd.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.bootstrap_command),
            connect_attempts: env_parse("PIPELINE_CONNECT_ATTEMPTS").unwrap_or(defaults.connect_attempts),
            worker_binary: env_string("PIPELINE_WORKER_BINARY").unwrap_or(defaults.worker_binary),
            workers: env_string("PIPELINE_WORKERS").unwrap_or(defaults.workers),
            worker_log_dir: env_string("PIPELINE_WORKER_LOG_DIR").map(PathBuf::from),
            skip_setup: env_parse("PIPELINE_SKIP_SETUP").unwrap_or(defaults.skip_setup),
            show_progress: env_parse("PIPELINE_PROGRESS").unwrap_or(defaults.show_progress),
        }
    }
}

/// Which stages of the standard pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageToggles {
    pub precompute_resizes: bool,
    pub generate_foreground_masks: bool,
    pub precompute_resizes_foreground: bool,
    pub depth_estimation: bool,
    pub convert_to_binary: bool,
    pub fusion: bool,
    pub simple_mesh_renderer: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            precompute_resizes: true,
            generate_foreground_masks: true,
            precompute_resizes_foreground: true,
            depth_estimation: true,
            convert_to_binary: true,
            fusion: true,
            simple_mesh_renderer: true,
        }
    }
}

impl StageToggles {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            precompute_resizes: env_parse("RENDER_RUN_PRECOMPUTE_RESIZES").unwrap_or(defaults.precompute_resizes),
            generate_foreground_masks: env_parse("RENDER_RUN_GENERATE_FOREGROUND_MASKS")
                .unwrap_or(defaults.generate_foreground_masks),
            precompute_resizes_foreground: env_parse("RENDER_RUN_PRECOMPUTE_RESIZES_FOREGROUND")
                .unwrap_or(defaults.precompute_resizes_foreground),
            depth_estimation: env_parse("RENDER_RUN_DEPTH_ESTIMATION").unwrap_or(defaults.depth_estimation),
            convert_to_binary: env_parse("RENDER_RUN_CONVERT_TO_BINARY").unwrap_or(defaults.convert_to_binary),
            fusion: env_parse("RENDER_RUN_FUSION").unwrap_or(defaults.fusion),
            simple_mesh_renderer: env_parse("RENDER_RUN_SIMPLE_MESH_RENDERER")
                .unwrap_or(defaults.simple_mesh_renderer),
        }
    }
}

/// Everything one render needs. The base of every job message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderConfig {
    pub input_root: String,
    pub output_root: String,
    /// Rig calibration; defaults to `<input_root>/rig.json`
    pub rig: String,
    pub first: FrameName,
    pub last: FrameName,
    /// Frames per dispatched job
    pub chunk_size: u32,
    pub background_frame: Option<FrameName>,
    pub color_type: ImageType,
    /// `disparity` renders the foreground, `background_disp` the background plate
    pub disparity_type: ImageType,
    /// `6dof` produces binaries and a fused stream, anything else a mesh export
    pub format: String,
    pub file_type: String,
    pub output_formats: Option<String>,
    /// Output width in pixels
    pub resolution: u32,
    pub level_start: Option<u32>,
    pub level_end: Option<u32>,
    /// Coarsest levels estimated together in one job; 0 disables batching
    pub coarsest_batch_levels: u32,
    pub time_radius: u32,
    pub do_temporal_filter: bool,
    pub do_temporal_masking: bool,
    pub use_foreground_masks: bool,
    pub force_recompute: bool,
    pub stages: StageToggles,
    /// Passthrough binary flags
    pub flags: BTreeMap<String, FlagValue>,
}

impl RenderConfig {
    pub fn new(input_root: impl Into<String>, output_root: impl Into<String>, first: FrameName, last: FrameName) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
            rig: String::new(),
            first,
            last,
            chunk_size: 1,
            background_frame: None,
            color_type: ImageType::Color,
            disparity_type: ImageType::Disparity,
            format: "6dof".to_string(),
            file_type: "png".to_string(),
            output_formats: None,
            resolution: 2048,
            level_start: None,
            level_end: None,
            coarsest_batch_levels: 0,
            time_radius: 2,
            do_temporal_filter: true,
            do_temporal_masking: false,
            use_foreground_masks: false,
            force_recompute: false,
            stages: StageToggles::default(),
            flags: BTreeMap::new(),
        }
    }

    /// Create config from `RENDER_*` environment variables.
    ///
    /// `RENDER_FLAGFILE` names a gflags-style file whose `--name=value` lines
    /// become passthrough flags.
    pub fn from_env() -> PipelineResult<Self> {
        let input_root = env_string("RENDER_INPUT_ROOT").unwrap_or_default();
        let output_root = env_string("RENDER_OUTPUT_ROOT").unwrap_or_default();
        let first = env_string("RENDER_FIRST").unwrap_or_else(|| "000000".to_string()).parse()?;
        let last = env_string("RENDER_LAST").unwrap_or_else(|| "000000".to_string()).parse()?;

        let mut config = Self::new(input_root, output_root, first, last);
        let defaults = config.clone();

        config.rig = env_string("RENDER_RIG").unwrap_or_default();
        config.chunk_size = env_parse("RENDER_CHUNK_SIZE").unwrap_or(defaults.chunk_size);
        config.background_frame = env_string("RENDER_BACKGROUND_FRAME")
            .map(|s| s.parse())
            .transpose()?;
        config.color_type = env_string("RENDER_COLOR_TYPE")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(defaults.color_type);
        config.disparity_type = env_string("RENDER_DISPARITY_TYPE")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(defaults.disparity_type);
        config.format = env_string("RENDER_FORMAT").unwrap_or(defaults.format);
        config.file_type = env_string("RENDER_FILE_TYPE").unwrap_or(defaults.file_type);
        config.output_formats = env_string("RENDER_OUTPUT_FORMATS");
        config.resolution = env_parse("RENDER_RESOLUTION").unwrap_or(defaults.resolution);
        config.level_start = env_parse("RENDER_LEVEL_START");
        config.level_end = env_parse("RENDER_LEVEL_END");
        config.coarsest_batch_levels = env_parse("RENDER_COARSEST_BATCH_LEVELS").unwrap_or(0);
        config.time_radius = env_parse("RENDER_TIME_RADIUS").unwrap_or(defaults.time_radius);
        config.do_temporal_filter = env_parse("RENDER_DO_TEMPORAL_FILTER").unwrap_or(defaults.do_temporal_filter);
        config.do_temporal_masking = env_parse("RENDER_DO_TEMPORAL_MASKING").unwrap_or(defaults.do_temporal_masking);
        config.use_foreground_masks =
            env_parse("RENDER_USE_FOREGROUND_MASKS").unwrap_or(defaults.use_foreground_masks);
        config.force_recompute = env_parse("RENDER_FORCE_RECOMPUTE").unwrap_or(defaults.force_recompute);
        config.stages = StageToggles::from_env();

        if let Some(path) = env_string("RENDER_FLAGFILE") {
            config.flags = read_flagfile(Path::new(&path))?;
        }
        Ok(config)
    }

    /// Check the configuration and fill in derived defaults.
    pub fn validate(&mut self) -> PipelineResult<()> {
        if self.input_root.trim().is_empty() {
            return Err(PipelineError::config_error("input_root cannot be empty"));
        }
        if self.output_root.trim().is_empty() {
            return Err(PipelineError::config_error("output_root cannot be empty"));
        }
        if self.rig.is_empty() {
            self.rig = join_address(&self.input_root, "rig.json");
        }
        for image_type in [
            ImageType::Color,
            ImageType::BackgroundDisp,
            ImageType::BackgroundColor,
            ImageType::ForegroundMasks,
        ] {
            let default_path = join_address(&self.input_root, image_type.relative_path());
            let flag = self
                .flags
                .entry(image_type.as_str().to_string())
                .or_insert_with(|| FlagValue::Text(String::new()));
            if flag.is_empty() {
                *flag = FlagValue::Text(default_path);
            }
        }

        if self.first > self.last {
            return Err(PipelineError::config_error(format!(
                "first ({}) must be <= last ({})",
                self.first, self.last
            )));
        }
        if self.chunk_size == 0 {
            return Err(PipelineError::config_error("chunk_size must be positive"));
        }
        match self.disparity_type {
            ImageType::Disparity => {}
            ImageType::BackgroundDisp if self.background_frame.is_some() => {}
            ImageType::BackgroundDisp => {
                return Err(PipelineError::config_error(
                    "background_disp renders require a background frame",
                ))
            }
            other => {
                return Err(PipelineError::config_error(format!("Invalid disparity type: {other}")));
            }
        }

        if self.stages.depth_estimation && self.do_temporal_filter {
            if self.time_radius == 0 {
                return Err(PipelineError::config_error("Temporal filter radius must be > 0"));
            }
            let num_frames = self.last.number() - self.first.number() + 1;
            if num_frames < 2 * self.time_radius - 1 {
                warn!(
                    num_frames,
                    time_radius = self.time_radius,
                    "Not enough frames for temporal filtering, disabling it"
                );
                self.do_temporal_filter = false;
                self.time_radius = 0;
            }
            if num_frames <= self.time_radius {
                return Err(PipelineError::config_error(format!(
                    "Number of frames ({num_frames}) must be greater than temporal range ({})",
                    self.time_radius
                )));
            }
        }
        Ok(())
    }

    /// The render range split into dispatch chunks.
    pub fn frame_chunks(&self) -> PipelineResult<Vec<FrameChunk>> {
        Ok(FrameChunk::split(&self.first, &self.last, self.chunk_size)?)
    }

    /// Single-frame chunk of the background frame.
    pub fn background_chunk(&self) -> Option<FrameChunk> {
        self.background_frame.clone().map(FrameChunk::single)
    }
}

/// Read a gflags-style flagfile.
pub fn read_flagfile(path: &Path) -> PipelineResult<BTreeMap<String, FlagValue>> {
    let contents = std::fs::read_to_string(path)?;
    parse_flagfile(&contents)
}

/// Parse `--name=value` lines. `--name` alone is `true`, `--noname` is `false`.
///
/// Blank lines and `#` comments are skipped.
pub fn parse_flagfile(contents: &str) -> PipelineResult<BTreeMap<String, FlagValue>> {
    let mut flags = BTreeMap::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let body = line
            .strip_prefix("--")
            .or_else(|| line.strip_prefix('-'))
            .ok_or_else(|| PipelineError::config_error(format!("flagfile line {}: expected --name=value", number + 1)))?;

        match body.split_once('=') {
            Some((name, value)) => {
                flags.insert(name.trim().to_string(), FlagValue::parse(value.trim()));
            }
            None => match body.strip_prefix("no") {
                Some(name) if !name.is_empty() => {
                    flags.insert(name.to_string(), FlagValue::Bool(false));
                }
                _ => {
                    flags.insert(body.to_string(), FlagValue::Bool(true));
                }
            },
        }
    }
    Ok(flags)
}
