//! Image types, pyramid levels and their canonical storage layout.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Widths of the pyramid levels, from largest (level 0) to smallest.
pub const PYRAMID_WIDTHS: [u32; 10] = [2048, 1024, 512, 256, 200, 128, 100, 80, 60, 50];

/// Number of pyramid levels.
pub fn num_levels() -> u32 {
    PYRAMID_WIDTHS.len() as u32
}

/// Finest level whose width fits in `resolution`.
///
/// Falls back to the coarsest level when `resolution` is smaller than every width.
pub fn finest_level_for(resolution: u32) -> u32 {
    PYRAMID_WIDTHS
        .iter()
        .position(|&width| resolution >= width)
        .unwrap_or(PYRAMID_WIDTHS.len() - 1) as u32
}

/// Which root an image type is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RootKind {
    /// Source-side data (captures, resized inputs, masks).
    Input,
    /// Result-side data (disparities, meshes, exports).
    Output,
}

/// Logical data product with a canonical relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    BackgroundColor,
    BackgroundColorLevels,
    BackgroundDisp,
    BackgroundDispLevels,
    BackgroundDispUpsample,
    Bin,
    Color,
    ColorLevels,
    Confidence,
    Cost,
    Disparity,
    DisparityUpsample,
    DisparityLevels,
    DisparityTimeFiltered,
    DisparityTimeFilteredLevels,
    Exports,
    ExportsCubecolor,
    ExportsCubedisp,
    ExportsEqrcolor,
    ExportsEqrdisp,
    ExportsLr180,
    ExportsTb3dof,
    ExportsTbstereo,
    ForegroundMasks,
    ForegroundMasksLevels,
    Fused,
    Mismatches,
}

impl ImageType {
    pub const ALL: [ImageType; 27] = [
        ImageType::BackgroundColor,
        ImageType::BackgroundColorLevels,
        ImageType::BackgroundDisp,
        ImageType::BackgroundDispLevels,
        ImageType::BackgroundDispUpsample,
        ImageType::Bin,
        ImageType::Color,
        ImageType::ColorLevels,
        ImageType::Confidence,
        ImageType::Cost,
        ImageType::Disparity,
        ImageType::DisparityUpsample,
        ImageType::DisparityLevels,
        ImageType::DisparityTimeFiltered,
        ImageType::DisparityTimeFilteredLevels,
        ImageType::Exports,
        ImageType::ExportsCubecolor,
        ImageType::ExportsCubedisp,
        ImageType::ExportsEqrcolor,
        ImageType::ExportsEqrdisp,
        ImageType::ExportsLr180,
        ImageType::ExportsTb3dof,
        ImageType::ExportsTbstereo,
        ImageType::ForegroundMasks,
        ImageType::ForegroundMasksLevels,
        ImageType::Fused,
        ImageType::Mismatches,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::BackgroundColor => "background_color",
            ImageType::BackgroundColorLevels => "background_color_levels",
            ImageType::BackgroundDisp => "background_disp",
            ImageType::BackgroundDispLevels => "background_disp_levels",
            ImageType::BackgroundDispUpsample => "background_disp_upsample",
            ImageType::Bin => "bin",
            ImageType::Color => "color",
            ImageType::ColorLevels => "color_levels",
            ImageType::Confidence => "confidence",
            ImageType::Cost => "cost",
            ImageType::Disparity => "disparity",
            ImageType::DisparityUpsample => "disparity_upsample",
            ImageType::DisparityLevels => "disparity_levels",
            ImageType::DisparityTimeFiltered => "disparity_time_filtered",
            ImageType::DisparityTimeFilteredLevels => "disparity_time_filtered_levels",
            ImageType::Exports => "exports",
            ImageType::ExportsCubecolor => "exports_cubecolor",
            ImageType::ExportsCubedisp => "exports_cubedisp",
            ImageType::ExportsEqrcolor => "exports_eqrcolor",
            ImageType::ExportsEqrdisp => "exports_eqrdisp",
            ImageType::ExportsLr180 => "exports_lr180",
            ImageType::ExportsTb3dof => "exports_tb3dof",
            ImageType::ExportsTbstereo => "exports_tbstereo",
            ImageType::ForegroundMasks => "foreground_masks",
            ImageType::ForegroundMasksLevels => "foreground_masks_levels",
            ImageType::Fused => "fused",
            ImageType::Mismatches => "mismatches",
        }
    }

    /// Canonical path relative to the root this type lives under.
    pub fn relative_path(&self) -> &'static str {
        match self {
            ImageType::BackgroundColor => "background/color",
            ImageType::BackgroundColorLevels => "background/color_levels",
            ImageType::BackgroundDisp => "background/disparity",
            ImageType::BackgroundDispLevels => "background/disparity_levels",
            ImageType::BackgroundDispUpsample => "background/disparity_upsample",
            ImageType::Color => "video/color",
            ImageType::ColorLevels => "video/color_levels",
            ImageType::ForegroundMasks => "video/foreground_masks",
            ImageType::ForegroundMasksLevels => "video/foreground_masks_levels",
            ImageType::ExportsCubecolor => "exports/cubecolor",
            ImageType::ExportsCubedisp => "exports/cubedisp",
            ImageType::ExportsEqrcolor => "exports/eqrcolor",
            ImageType::ExportsEqrdisp => "exports/eqrdisp",
            ImageType::ExportsLr180 => "exports/lr180",
            ImageType::ExportsTb3dof => "exports/tb3dof",
            ImageType::ExportsTbstereo => "exports/tbstereo",
            other => other.as_str(),
        }
    }

    pub fn root(&self) -> RootKind {
        match self {
            ImageType::BackgroundColor
            | ImageType::BackgroundColorLevels
            | ImageType::BackgroundDisp
            | ImageType::BackgroundDispLevels
            | ImageType::BackgroundDispUpsample
            | ImageType::Color
            | ImageType::ColorLevels
            | ImageType::ForegroundMasks
            | ImageType::ForegroundMasksLevels => RootKind::Input,
            _ => RootKind::Output,
        }
    }

    /// Variant holding per-level subdirectories `level_0..level_N`.
    pub fn leveled(&self) -> Option<ImageType> {
        match self {
            ImageType::BackgroundDisp => Some(ImageType::BackgroundDispLevels),
            ImageType::BackgroundColor => Some(ImageType::BackgroundColorLevels),
            ImageType::Color => Some(ImageType::ColorLevels),
            ImageType::Disparity => Some(ImageType::DisparityLevels),
            ImageType::DisparityTimeFiltered => Some(ImageType::DisparityTimeFilteredLevels),
            ImageType::ForegroundMasks => Some(ImageType::ForegroundMasksLevels),
            _ => None,
        }
    }

    /// Variant holding upsampled full-size output.
    pub fn upsampled(&self) -> Option<ImageType> {
        match self {
            ImageType::Disparity => Some(ImageType::DisparityUpsample),
            ImageType::BackgroundDisp => Some(ImageType::BackgroundDispUpsample),
            _ => None,
        }
    }

    /// Type that holds the requested level of this type.
    ///
    /// `None` resolves to the full-size type itself.
    pub fn at_level(&self, level: Option<u32>) -> ModelResult<ImageType> {
        match level {
            None => Ok(*self),
            Some(_) => self
                .leveled()
                .ok_or_else(|| ModelError::NotLeveled(self.as_str().to_string())),
        }
    }

    /// Exports are stored as plain files and never packed into frame archives.
    pub fn is_export(&self) -> bool {
        self.as_str().starts_with("exports")
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageType {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        ImageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ModelError::UnknownImageType(s.to_string()))
    }
}

/// Pyramid level(s) a stage reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(untagged)]
pub enum LevelSpec {
    One(u32),
    Many(Vec<u32>),
    /// Full-size, unleveled data.
    #[default]
    None,
}

impl LevelSpec {
    /// Every pyramid level, finest first.
    pub fn all_levels() -> Self {
        LevelSpec::Many((0..num_levels()).collect())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, LevelSpec::None)
    }

    /// Levels as a list; `[None]` for full-size data.
    pub fn levels(&self) -> Vec<Option<u32>> {
        match self {
            LevelSpec::One(level) => vec![Some(*level)],
            LevelSpec::Many(levels) => levels.iter().map(|l| Some(*l)).collect(),
            LevelSpec::None => vec![None],
        }
    }

    /// Single level, if exactly one is requested.
    pub fn single(&self) -> Option<u32> {
        match self {
            LevelSpec::One(level) => Some(*level),
            _ => None,
        }
    }
}

impl From<Option<u32>> for LevelSpec {
    fn from(level: Option<u32>) -> Self {
        level.map_or(LevelSpec::None, LevelSpec::One)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_type_names_round_trip_through_serde() {
        for image_type in ImageType::ALL {
            let json = serde_json::to_value(image_type).unwrap();
            assert_eq!(json, serde_json::Value::String(image_type.as_str().to_string()));
            assert_eq!(image_type.as_str().parse::<ImageType>().unwrap(), image_type);
        }
    }

    #[test]
    fn test_roots_and_paths() {
        assert_eq!(ImageType::Color.root(), RootKind::Input);
        assert_eq!(ImageType::Color.relative_path(), "video/color");
        assert_eq!(ImageType::Disparity.root(), RootKind::Output);
        assert_eq!(ImageType::Disparity.relative_path(), "disparity");
        assert_eq!(ImageType::BackgroundDispLevels.relative_path(), "background/disparity_levels");
        assert_eq!(ImageType::ExportsEqrcolor.relative_path(), "exports/eqrcolor");
    }

    #[test]
    fn test_leveled_variants() {
        assert_eq!(ImageType::Color.at_level(Some(3)).unwrap(), ImageType::ColorLevels);
        assert_eq!(ImageType::Color.at_level(None).unwrap(), ImageType::Color);
        assert!(ImageType::Bin.at_level(Some(0)).is_err());
        assert_eq!(ImageType::Disparity.upsampled(), Some(ImageType::DisparityUpsample));
    }

    #[test]
    fn test_exports_are_flagged() {
        assert!(ImageType::ExportsTbstereo.is_export());
        assert!(!ImageType::Fused.is_export());
    }

    #[test]
    fn test_finest_level_for_resolution() {
        assert_eq!(finest_level_for(4096), 0);
        assert_eq!(finest_level_for(2048), 0);
        assert_eq!(finest_level_for(1500), 1);
        assert_eq!(finest_level_for(256), 3);
        assert_eq!(finest_level_for(10), 9);
    }

    #[test]
    fn test_level_spec_wire_format() {
        assert_eq!(serde_json::to_string(&LevelSpec::None).unwrap(), "null");
        assert_eq!(serde_json::to_string(&LevelSpec::One(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&LevelSpec::Many(vec![0, 1])).unwrap(), "[0,1]");
        assert_eq!(serde_json::from_str::<LevelSpec>("[2,3]").unwrap(), LevelSpec::Many(vec![2, 3]));
        assert_eq!(serde_json::from_str::<LevelSpec>("null").unwrap(), LevelSpec::None);
        assert_eq!(LevelSpec::all_levels().levels().len(), PYRAMID_WIDTHS.len());
    }
}
