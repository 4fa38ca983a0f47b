//! Closed set of pipeline stages.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// A pipeline step, identified on the wire by the `app` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum StageKind {
    GenerateForegroundMasks,
    Resize,
    /// Coarse-to-fine depth estimation (`DerpCLI`).
    DepthEstimation,
    /// Temporal bilateral filtering of disparities.
    TemporalFilter,
    /// Copy of frames between image types and levels, no binary involved.
    Transfer,
    UpsampleDisparity,
    /// Upsampling followed by a merge with the background layer.
    UpsampleLayer,
    ConvertToBinary,
    SimpleMeshRenderer,
}

impl StageKind {
    pub const ALL: [StageKind; 9] = [
        StageKind::GenerateForegroundMasks,
        StageKind::Resize,
        StageKind::DepthEstimation,
        StageKind::TemporalFilter,
        StageKind::Transfer,
        StageKind::UpsampleDisparity,
        StageKind::UpsampleLayer,
        StageKind::ConvertToBinary,
        StageKind::SimpleMeshRenderer,
    ];

    /// Identifier used as the `app` prefix.
    pub fn app_name(&self) -> &'static str {
        match self {
            StageKind::GenerateForegroundMasks => "GenerateForegroundMasks",
            StageKind::Resize => "Resize",
            StageKind::DepthEstimation => "DerpCLI",
            StageKind::TemporalFilter => "TemporalBilateralFilter",
            StageKind::Transfer => "Transfer",
            StageKind::UpsampleDisparity => "UpsampleDisparity",
            StageKind::UpsampleLayer => "UpsampleLayer",
            StageKind::ConvertToBinary => "ConvertToBinary",
            StageKind::SimpleMeshRenderer => "SimpleMeshRenderer",
        }
    }

    /// External binary invoked first by this stage, if any.
    pub fn binary(&self) -> Option<&'static str> {
        match self {
            StageKind::Transfer => None,
            StageKind::UpsampleLayer => Some("UpsampleDisparity"),
            other => Some(other.app_name()),
        }
    }

    /// Parse a stage identifier such as `"DerpCLI: Level 3"`.
    ///
    /// Only the text before the first `:` is significant.
    pub fn from_app(app: &str) -> ModelResult<Self> {
        let prefix = app.split(':').next().unwrap_or_default().trim();
        StageKind::ALL
            .iter()
            .copied()
            .find(|stage| stage.app_name() == prefix)
            .ok_or_else(|| ModelError::UnknownStage(app.to_string()))
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.app_name())
    }
}

impl FromStr for StageKind {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        Self::from_app(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_app_uses_prefix_only() {
        assert_eq!(StageKind::from_app("DerpCLI: Level 3").unwrap(), StageKind::DepthEstimation);
        assert_eq!(StageKind::from_app("Resize: Color").unwrap(), StageKind::Resize);
        assert_eq!(
            StageKind::from_app("ConvertToBinary: Striping").unwrap(),
            StageKind::ConvertToBinary
        );
        assert_eq!(StageKind::from_app("Transfer").unwrap(), StageKind::Transfer);
    }

    #[test]
    fn test_upsample_layer_is_not_confused_with_upsample() {
        assert_eq!(StageKind::from_app("UpsampleLayer").unwrap(), StageKind::UpsampleLayer);
        assert_eq!(StageKind::from_app("UpsampleDisparity").unwrap(), StageKind::UpsampleDisparity);
    }

    #[test]
    fn test_unknown_stage_is_rejected() {
        assert!(StageKind::from_app("Unknown: thing").is_err());
        assert!(StageKind::from_app("").is_err());
    }

    #[test]
    fn test_every_stage_round_trips_through_app_name() {
        for stage in StageKind::ALL {
            assert_eq!(StageKind::from_app(stage.app_name()).unwrap(), stage);
        }
        assert_eq!(StageKind::Transfer.binary(), None);
        assert_eq!(StageKind::TemporalFilter.binary(), Some("TemporalBilateralFilter"));
    }
}
