//! Pipeline stages and the jobs each one dispatches.
//!
//! A stage expands into one or more [`Dispatch`]es: a message template and the
//! chunks it is published for. Dispatches of a stage run strictly in order,
//! each draining the queue before the next starts.

use std::fmt;

use vrender_models::{
    finest_level_for, num_levels, FrameChunk, FrameName, ImageType, JobMessage, LevelSpec, StageKind,
    PYRAMID_WIDTHS,
};
use vrender_storage::join_address;

use crate::config::RenderConfig;
use crate::error::{PipelineError, PipelineResult};

/// Threshold binarising resized foreground masks.
pub const FOREGROUND_MASK_THRESHOLD: u32 = 127;

/// Widened read window of the temporal filter, clamped to the render range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterWindow {
    pub radius: u32,
    pub first: FrameName,
    pub last: FrameName,
}

impl FilterWindow {
    /// Frames read around `chunk`.
    pub fn around(&self, chunk: &FrameChunk) -> (FrameName, FrameName) {
        let first = chunk.first.number().saturating_sub(self.radius).max(self.first.number());
        let last = chunk.last.number().saturating_add(self.radius).min(self.last.number());
        (FrameName::new(first), FrameName::new(last))
    }
}

/// One drain cycle: `message` published once per chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub message: JobMessage,
    pub chunks: Vec<FrameChunk>,
    pub window: Option<FilterWindow>,
}

impl Dispatch {
    pub fn new(message: JobMessage, chunks: Vec<FrameChunk>) -> Self {
        Self {
            message,
            chunks,
            window: None,
        }
    }

    /// Message published for `chunk`.
    pub fn job(&self, chunk: &FrameChunk) -> JobMessage {
        let mut msg = self.message.for_chunk(chunk);
        if let Some(window) = &self.window {
            let (first, last) = window.around(chunk);
            msg.filter_first = Some(first);
            msg.filter_last = Some(last);
        }
        msg
    }
}

/// Named steps of the standard render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    PrecomputeResizes,
    GenerateForegroundMasks,
    PrecomputeResizesForeground,
    DepthEstimation,
    ConvertToBinary,
    Fusion,
    SimpleMeshRenderer,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::PrecomputeResizes => "precompute_resizes",
            Stage::GenerateForegroundMasks => "generate_foreground_masks",
            Stage::PrecomputeResizesForeground => "precompute_resizes_foreground",
            Stage::DepthEstimation => "depth_estimation",
            Stage::ConvertToBinary => "convert_to_binary",
            Stage::Fusion => "fusion",
            Stage::SimpleMeshRenderer => "simple_mesh_renderer",
        }
    }

    /// Dispatches of this stage, in execution order.
    pub fn plan(&self, config: &RenderConfig) -> PipelineResult<Vec<Dispatch>> {
        match self {
            Stage::PrecomputeResizes => precompute_resizes(config),
            Stage::GenerateForegroundMasks => generate_foreground_masks(config).map(|d| vec![d]),
            Stage::PrecomputeResizesForeground => precompute_resizes_foreground(config).map(|d| vec![d]),
            Stage::DepthEstimation => depth_estimation(config),
            Stage::ConvertToBinary => convert_to_binary(config).map(|d| vec![d]),
            Stage::Fusion => fusion(config).map(|d| vec![d]),
            Stage::SimpleMeshRenderer => simple_mesh_renderer(config).map(|d| vec![d]),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The standard render, with disabled stages left out.
///
/// `6dof` renders end in binary conversion and fusion, anything else in a
/// mesh export.
pub fn standard_stages(config: &RenderConfig) -> Vec<Stage> {
    let toggles = &config.stages;
    let mut stages = vec![
        (Stage::PrecomputeResizes, toggles.precompute_resizes),
        (Stage::GenerateForegroundMasks, toggles.generate_foreground_masks),
        (
            Stage::PrecomputeResizesForeground,
            toggles.precompute_resizes_foreground && config.use_foreground_masks,
        ),
        (Stage::DepthEstimation, toggles.depth_estimation),
    ];
    if config.format == "6dof" {
        stages.push((Stage::ConvertToBinary, toggles.convert_to_binary));
        stages.push((Stage::Fusion, toggles.fusion));
    } else {
        stages.push((Stage::SimpleMeshRenderer, toggles.simple_mesh_renderer));
    }

    stages
        .into_iter()
        .filter_map(|(stage, enabled)| enabled.then_some(stage))
        .collect()
}

/// Message carrying the render-wide parameters every stage starts from.
pub fn base_message(config: &RenderConfig, app: impl Into<String>) -> PipelineResult<JobMessage> {
    let range = FrameChunk::new(config.first.clone(), config.last.clone())?;
    let mut msg = JobMessage::new(
        app,
        &range,
        config.input_root.clone(),
        config.output_root.clone(),
        config.rig.clone(),
    );
    msg.color_type = config.color_type;
    msg.disparity_type = config.disparity_type;
    msg.background_frame = config.background_frame.clone();
    msg.force_recompute = config.force_recompute;
    msg.use_foreground_masks = config.use_foreground_masks;
    msg.output_formats = config.output_formats.clone();
    msg.file_type = Some(config.file_type.clone());
    msg.format = Some(config.format.clone());
    msg.resolution = Some(config.resolution);
    msg.time_radius = Some(config.time_radius);
    msg.flags = config.flags.clone();
    Ok(msg)
}

fn background_chunks(config: &RenderConfig) -> PipelineResult<Vec<FrameChunk>> {
    config
        .background_chunk()
        .map(|chunk| vec![chunk])
        .ok_or_else(|| PipelineError::config_error("background frame required"))
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn resize_job(
    config: &RenderConfig,
    image_type: ImageType,
    chunks: Vec<FrameChunk>,
    threshold: Option<u32>,
) -> PipelineResult<Dispatch> {
    let app = format!("{}: {}", StageKind::Resize, capitalize(image_type.as_str()));
    let mut msg = base_message(config, app)?;
    msg.image_type = Some(image_type);
    msg.threshold = threshold;
    msg.dst_image_type = Some(image_type);
    msg.dst_level = LevelSpec::all_levels();
    Ok(Dispatch::new(msg, chunks))
}

/// Pyramid resizes of the color input and, when present, the background plate.
pub fn precompute_resizes(config: &RenderConfig) -> PipelineResult<Vec<Dispatch>> {
    match config.disparity_type {
        ImageType::BackgroundDisp => Ok(vec![resize_job(
            config,
            ImageType::BackgroundColor,
            background_chunks(config)?,
            None,
        )?]),
        ImageType::Disparity => {
            let mut dispatches = vec![resize_job(config, ImageType::Color, config.frame_chunks()?, None)?];
            if config.background_frame.is_some() {
                for image_type in [ImageType::BackgroundColor, ImageType::BackgroundDisp] {
                    dispatches.push(resize_job(config, image_type, background_chunks(config)?, None)?);
                }
            }
            Ok(dispatches)
        }
        other => Err(PipelineError::config_error(format!("Invalid disparity type: {other}"))),
    }
}

pub fn precompute_resizes_foreground(config: &RenderConfig) -> PipelineResult<Dispatch> {
    resize_job(
        config,
        ImageType::ForegroundMasks,
        config.frame_chunks()?,
        Some(FOREGROUND_MASK_THRESHOLD),
    )
}

pub fn generate_foreground_masks(config: &RenderConfig) -> PipelineResult<Dispatch> {
    let mut msg = base_message(config, StageKind::GenerateForegroundMasks.app_name())?;
    msg.level = Some(0);
    msg.dst_level = LevelSpec::None;
    msg.dst_image_type = Some(ImageType::ForegroundMasks);
    Ok(Dispatch::new(msg, config.frame_chunks()?))
}

fn transfer(
    base: &JobMessage,
    src: (ImageType, Option<u32>),
    dst: (ImageType, Option<u32>),
) -> JobMessage {
    let mut msg = base.clone();
    msg.app = StageKind::Transfer.app_name().to_string();
    msg.src_image_type = Some(src.0);
    msg.src_level = src.1;
    msg.dst_image_type = Some(dst.0);
    msg.dst_level = dst.1.into();
    msg
}

/// Coarse-to-fine disparity estimation.
///
/// Each level reads the disparity of the next coarser one, so levels run as
/// separate dispatches from `level_start` (default the coarsest) down to
/// `level_end` (default the finest level that fits the output resolution).
/// The result is then upsampled or transferred to the full-size type.
pub fn depth_estimation(config: &RenderConfig) -> PipelineResult<Vec<Dispatch>> {
    let chunks = config.frame_chunks()?;
    let disparity_type = config.disparity_type;
    let input = |image_type: ImageType| join_address(&config.input_root, image_type.relative_path());

    let mut post_resize = base_message(config, StageKind::DepthEstimation.app_name())?;
    match disparity_type {
        ImageType::Disparity => {
            post_resize.set_flag(ImageType::Color.as_str(), input(ImageType::ColorLevels));
            post_resize.set_flag(ImageType::ForegroundMasks.as_str(), input(ImageType::ForegroundMasksLevels));
            post_resize.set_flag(ImageType::BackgroundDisp.as_str(), input(ImageType::BackgroundDispLevels));
        }
        ImageType::BackgroundDisp => {
            post_resize.set_flag(ImageType::Color.as_str(), input(ImageType::ColorLevels));
        }
        other => return Err(PipelineError::config_error(format!("Invalid disparity type: {other}"))),
    }

    let coarsest = num_levels() - 1;
    let start = config.level_start.unwrap_or(coarsest);
    let end = config.level_end.unwrap_or_else(|| finest_level_for(config.resolution));
    if start > coarsest || end > start {
        return Err(PipelineError::config_error(format!(
            "Invalid depth level range {start}..{end}, levels run from {coarsest} (coarsest) to 0"
        )));
    }

    let depth_job = |app: String, level_start: u32, level_end: u32, dst_level: LevelSpec| {
        let mut msg = post_resize.clone();
        msg.app = app;
        msg.level_start = Some(level_start);
        msg.level_end = Some(level_end);
        msg.image_type = Some(disparity_type);
        msg.dst_image_type = Some(disparity_type);
        msg.dst_level = dst_level;
        msg
    };

    let mut dispatches = Vec::new();

    // Levels still to estimate one at a time, coarsest first
    let mut remaining = Some(start);
    if config.coarsest_batch_levels > 0 {
        let batch_end = end.max((start + 1).saturating_sub(config.coarsest_batch_levels));
        let mut msg = depth_job(
            format!("{}: Levels {start}-{batch_end}", StageKind::DepthEstimation),
            start,
            batch_end,
            LevelSpec::Many((batch_end..=start).collect()),
        );
        msg.output_formats = Some("pfm".to_string());
        dispatches.push(Dispatch::new(msg, chunks.clone()));
        remaining = batch_end.checked_sub(1).filter(|level| *level >= end);
    }

    let window = FilterWindow {
        radius: config.time_radius,
        first: config.first.clone(),
        last: config.last.clone(),
    };
    let levels: Vec<u32> = remaining.map(|next| (end..=next).rev().collect()).unwrap_or_default();
    for level in levels {
        let mut msg = depth_job(
            format!("{}: Level {level}", StageKind::DepthEstimation),
            level,
            level,
            LevelSpec::One(level),
        );
        if level != end {
            msg.output_formats = Some("pfm".to_string());
        }
        dispatches.push(Dispatch::new(msg, chunks.clone()));

        if config.do_temporal_filter {
            let mut filter = post_resize.clone();
            filter.app = StageKind::TemporalFilter.app_name().to_string();
            filter.level = Some(level);
            filter.use_foreground_masks = config.do_temporal_masking;
            filter.dst_level = LevelSpec::One(level);
            filter.dst_image_type = Some(ImageType::DisparityTimeFiltered);
            dispatches.push(Dispatch {
                message: filter,
                chunks: chunks.clone(),
                window: Some(window.clone()),
            });

            let mut back = transfer(
                &post_resize,
                (ImageType::DisparityTimeFiltered, Some(level)),
                (ImageType::Disparity, Some(level)),
            );
            back.force_recompute = true;
            dispatches.push(Dispatch::new(back, chunks.clone()));
        }
    }

    let finest_width = PYRAMID_WIDTHS.get(end as usize).copied().unwrap_or_default();
    if config.resolution > finest_width {
        let upsample_chunks = match disparity_type {
            ImageType::BackgroundDisp => background_chunks(config)?,
            _ => chunks,
        };

        let mut upsample = base_message(config, StageKind::UpsampleDisparity.app_name())?;
        upsample.level = Some(end);
        upsample.image_type = Some(disparity_type);
        upsample.dst_level = end.checked_sub(1).into();
        upsample.dst_image_type = Some(ImageType::DisparityUpsample);
        dispatches.push(Dispatch::new(upsample, upsample_chunks.clone()));

        let full_size = transfer(
            &post_resize,
            (ImageType::DisparityUpsample, None),
            (disparity_type, None),
        );
        dispatches.push(Dispatch::new(full_size, upsample_chunks));
    } else {
        let full_size = transfer(&post_resize, (disparity_type, Some(end)), (disparity_type, None));
        dispatches.push(Dispatch::new(full_size, chunks));
    }

    Ok(dispatches)
}

/// Per-frame meshing into binaries.
pub fn convert_to_binary(config: &RenderConfig) -> PipelineResult<Dispatch> {
    let mut msg = base_message(config, format!("{}: Meshing", StageKind::ConvertToBinary))?;
    msg.level = None;
    msg.clear_flag(ImageType::ForegroundMasks.as_str());
    msg.run_conversion = true;
    msg.dst_level = LevelSpec::None;
    msg.dst_image_type = Some(ImageType::Bin);
    Ok(Dispatch::new(msg, config.frame_chunks()?))
}

/// Striping of every binary into one fused stream, as a single job.
pub fn fusion(config: &RenderConfig) -> PipelineResult<Dispatch> {
    let mut msg = base_message(config, format!("{}: Striping", StageKind::ConvertToBinary))?;
    msg.run_conversion = false;
    msg.dst_level = LevelSpec::None;
    msg.dst_image_type = Some(ImageType::Fused);
    let whole = FrameChunk::new(config.first.clone(), config.last.clone())?;
    Ok(Dispatch::new(msg, vec![whole]))
}

pub fn simple_mesh_renderer(config: &RenderConfig) -> PipelineResult<Dispatch> {
    let export: ImageType = format!("exports_{}", config.format).parse()?;
    let mut msg = base_message(config, StageKind::SimpleMeshRenderer.app_name())?;
    msg.level = None;
    msg.dst_level = LevelSpec::None;
    msg.dst_image_type = Some(export);
    Ok(Dispatch::new(msg, config.frame_chunks()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrender_models::FlagValue;

    fn config(first: u32, last: u32) -> RenderConfig {
        let mut config = RenderConfig::new("/data/shot", "/data/shot/output", FrameName::new(first), FrameName::new(last));
        config.validate().unwrap();
        config
    }

    fn apps(dispatches: &[Dispatch]) -> Vec<&str> {
        dispatches.iter().map(|d| d.message.app.as_str()).collect()
    }

    #[test]
    fn test_standard_stage_order() {
        let mut config = config(0, 9);
        assert_eq!(
            standard_stages(&config),
            vec![
                Stage::PrecomputeResizes,
                Stage::GenerateForegroundMasks,
                Stage::DepthEstimation,
                Stage::ConvertToBinary,
                Stage::Fusion,
            ]
        );

        config.use_foreground_masks = true;
        config.format = "eqrcolor".to_string();
        config.stages.generate_foreground_masks = false;
        assert_eq!(
            standard_stages(&config),
            vec![
                Stage::PrecomputeResizes,
                Stage::PrecomputeResizesForeground,
                Stage::DepthEstimation,
                Stage::SimpleMeshRenderer,
            ]
        );
    }

    #[test]
    fn test_precompute_resizes_per_mode() {
        let mut config = config(0, 3);
        let plan = precompute_resizes(&config).unwrap();
        assert_eq!(apps(&plan), vec!["Resize: Color"]);
        assert_eq!(plan[0].chunks.len(), 4);
        assert_eq!(plan[0].message.dst_level, LevelSpec::all_levels());

        config.background_frame = Some(FrameName::new(100));
        let plan = precompute_resizes(&config).unwrap();
        assert_eq!(
            apps(&plan),
            vec!["Resize: Color", "Resize: Background_color", "Resize: Background_disp"]
        );
        assert_eq!(plan[2].chunks, vec![FrameChunk::single(FrameName::new(100))]);

        config.disparity_type = ImageType::BackgroundDisp;
        let plan = precompute_resizes(&config).unwrap();
        assert_eq!(apps(&plan), vec!["Resize: Background_color"]);
    }

    #[test]
    fn test_foreground_resize_is_thresholded() {
        let dispatch = precompute_resizes_foreground(&config(0, 1)).unwrap();
        assert_eq!(dispatch.message.app, "Resize: Foreground_masks");
        assert_eq!(dispatch.message.threshold, Some(FOREGROUND_MASK_THRESHOLD));
        assert_eq!(dispatch.message.dst_image_type, Some(ImageType::ForegroundMasks));
    }

    #[test]
    fn test_depth_estimation_level_sequence() {
        let mut config = config(0, 9);
        config.level_start = Some(3);
        config.do_temporal_filter = false;

        let plan = depth_estimation(&config).unwrap();
        assert_eq!(
            apps(&plan),
            vec!["DerpCLI: Level 3", "DerpCLI: Level 2", "DerpCLI: Level 1", "DerpCLI: Level 0", "Transfer"]
        );
        assert_eq!(plan[0].message.output_formats.as_deref(), Some("pfm"));
        assert_eq!(plan[3].message.output_formats, None);
        assert_eq!(plan[1].message.level_start, Some(2));
        assert_eq!(plan[1].message.dst_level, LevelSpec::One(2));
        assert_eq!(
            plan[0].message.flag("color"),
            Some(&FlagValue::from("/data/shot/video/color_levels"))
        );

        let transfer = &plan[4].message;
        assert_eq!(transfer.src_image_type, Some(ImageType::Disparity));
        assert_eq!(transfer.src_level, Some(0));
        assert_eq!(transfer.dst_level, LevelSpec::None);
    }

    #[test]
    fn test_depth_estimation_temporal_filter_windows() {
        let mut config = config(0, 9);
        config.level_start = Some(1);
        config.chunk_size = 4;

        let plan = depth_estimation(&config).unwrap();
        assert_eq!(
            apps(&plan),
            vec![
                "DerpCLI: Level 1",
                "TemporalBilateralFilter",
                "Transfer",
                "DerpCLI: Level 0",
                "TemporalBilateralFilter",
                "Transfer",
                "Transfer",
            ]
        );

        let filter = &plan[1];
        let job = filter.job(&filter.chunks[1]);
        assert_eq!(job.first, FrameName::new(4));
        assert_eq!(job.filter_first, Some(FrameName::new(2)));
        assert_eq!(job.filter_last, Some(FrameName::new(9)));
        let job = filter.job(&filter.chunks[0]);
        assert_eq!(job.filter_first, Some(FrameName::new(0)));
        assert_eq!(job.filter_last, Some(FrameName::new(5)));

        assert!(plan[2].message.force_recompute);
        assert_eq!(plan[2].message.src_image_type, Some(ImageType::DisparityTimeFiltered));
    }

    #[test]
    fn test_depth_estimation_batches_coarsest_levels_once() {
        let mut config = config(0, 9);
        config.coarsest_batch_levels = 3;
        config.level_end = Some(5);
        config.do_temporal_filter = false;

        let plan = depth_estimation(&config).unwrap();
        let expected = vec![
            "DerpCLI: Levels 9-7",
            "DerpCLI: Level 6",
            "DerpCLI: Level 5",
            "UpsampleDisparity",
            "Transfer",
        ];
        assert_eq!(apps(&plan), expected);
        assert_eq!(plan[0].message.dst_level, LevelSpec::Many(vec![7, 8, 9]));
        assert_eq!(plan[0].message.level_end, Some(7));

        let upsample = &plan[3].message;
        assert_eq!(upsample.level, Some(5));
        assert_eq!(upsample.dst_level, LevelSpec::One(4));
        assert_eq!(upsample.dst_image_type, Some(ImageType::DisparityUpsample));
    }

    #[test]
    fn test_depth_estimation_batch_covering_every_level() {
        let mut config = config(0, 9);
        config.coarsest_batch_levels = 20;
        config.do_temporal_filter = false;

        let plan = depth_estimation(&config).unwrap();
        assert_eq!(apps(&plan), vec!["DerpCLI: Levels 9-0", "Transfer"]);
    }

    #[test]
    fn test_background_upsample_uses_background_frame() {
        let mut config = config(0, 9);
        config.disparity_type = ImageType::BackgroundDisp;
        config.background_frame = Some(FrameName::new(42));
        config.resolution = 4096;
        config.level_start = Some(0);
        config.do_temporal_filter = false;

        let plan = depth_estimation(&config).unwrap();
        assert_eq!(apps(&plan), vec!["DerpCLI: Level 0", "UpsampleDisparity", "Transfer"]);
        assert_eq!(plan[1].chunks, vec![FrameChunk::single(FrameName::new(42))]);
        assert_eq!(plan[1].message.dst_level, LevelSpec::None);
        assert_eq!(plan[2].message.dst_image_type, Some(ImageType::BackgroundDisp));
        assert!(plan[0].message.flag("foreground_masks").unwrap().as_str().unwrap().ends_with("video/foreground_masks"));
    }

    #[test]
    fn test_invalid_level_range_is_rejected() {
        let mut config = config(0, 9);
        config.level_start = Some(2);
        config.level_end = Some(4);
        assert!(depth_estimation(&config).is_err());
    }

    #[test]
    fn test_output_stages() {
        let config = config(0, 9);

        let meshing = convert_to_binary(&config).unwrap();
        assert_eq!(meshing.message.app, "ConvertToBinary: Meshing");
        assert!(meshing.message.run_conversion);
        assert!(meshing.message.flag("foreground_masks").unwrap().is_empty());

        let striping = fusion(&config).unwrap();
        assert_eq!(striping.message.dst_image_type, Some(ImageType::Fused));
        assert_eq!(
            striping.chunks,
            vec![FrameChunk::new(FrameName::new(0), FrameName::new(9)).unwrap()]
        );

        let mut config = config;
        config.format = "tbstereo".to_string();
        let export = simple_mesh_renderer(&config).unwrap();
        assert_eq!(export.message.dst_image_type, Some(ImageType::ExportsTbstereo));
    }
}
