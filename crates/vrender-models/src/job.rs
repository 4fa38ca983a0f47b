//! Job messages exchanged between the controller and workers.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::frame::{frame_range, FrameChunk, FrameName};
use crate::image_type::{num_levels, ImageType, LevelSpec};
use crate::stage::StageKind;

/// Scalar value of a passthrough binary flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FlagValue {
    /// Empty text values are never forwarded to a binary.
    pub fn is_empty(&self) -> bool {
        matches!(self, FlagValue::Text(s) if s.is_empty())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Parse a raw flagfile value, preferring the narrowest type.
    pub fn parse(raw: &str) -> Self {
        if let Ok(b) = raw.parse::<bool>() {
            return FlagValue::Bool(b);
        }
        if let Ok(i) = raw.parse::<i64>() {
            return FlagValue::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return FlagValue::Float(f);
        }
        FlagValue::Text(raw.to_string())
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Bool(b) => write!(f, "{b}"),
            FlagValue::Int(i) => write!(f, "{i}"),
            FlagValue::Float(x) => write!(f, "{x}"),
            FlagValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::Text(value.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        FlagValue::Text(value)
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        FlagValue::Bool(value)
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> Self {
        FlagValue::Int(value)
    }
}

fn default_color_type() -> ImageType {
    ImageType::Color
}

fn default_disparity_type() -> ImageType {
    ImageType::Disparity
}

/// One unit of work: a stage applied to a frame chunk.
///
/// Messages are immutable once published; handlers clone before mutating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobMessage {
    /// Stage identifier with an optional `: label` suffix
    pub app: String,

    pub first: FrameName,
    pub last: FrameName,

    pub input_root: String,
    pub output_root: String,

    /// Rig calibration file
    pub rig: String,

    /// Cameras to operate on; empty means every camera in the rig
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cameras: Vec<String>,

    #[serde(default = "default_color_type")]
    pub color_type: ImageType,

    #[serde(default = "default_disparity_type")]
    pub disparity_type: ImageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_frame: Option<FrameName>,

    #[serde(default)]
    pub force_recompute: bool,

    #[serde(default = "num_levels")]
    pub num_levels: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<ImageType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_image_type: Option<ImageType>,

    #[serde(default)]
    pub dst_level: LevelSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_image_type: Option<ImageType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_level: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_start: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_end: Option<u32>,

    /// Binary threshold applied while resizing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,

    /// Widened window read by the temporal filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_first: Option<FrameName>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_last: Option<FrameName>,

    #[serde(default)]
    pub use_foreground_masks: bool,

    #[serde(default)]
    pub run_conversion: bool,

    /// Comma separated output extensions, e.g. `pfm,png`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_formats: Option<String>,

    /// Extension of exported files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_radius: Option<u32>,

    /// Passthrough binary flags and path overrides
    #[serde(flatten)]
    pub flags: BTreeMap<String, FlagValue>,
}

impl JobMessage {
    pub fn new(
        app: impl Into<String>,
        chunk: &FrameChunk,
        input_root: impl Into<String>,
        output_root: impl Into<String>,
        rig: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            first: chunk.first.clone(),
            last: chunk.last.clone(),
            input_root: input_root.into(),
            output_root: output_root.into(),
            rig: rig.into(),
            cameras: Vec::new(),
            color_type: ImageType::Color,
            disparity_type: ImageType::Disparity,
            background_frame: None,
            force_recompute: false,
            num_levels: num_levels(),
            image_type: None,
            level: None,
            dst_image_type: None,
            dst_level: LevelSpec::None,
            src_image_type: None,
            src_level: None,
            level_start: None,
            level_end: None,
            threshold: None,
            filter_first: None,
            filter_last: None,
            use_foreground_masks: false,
            run_conversion: false,
            output_formats: None,
            file_type: None,
            format: None,
            resolution: None,
            time_radius: None,
            flags: BTreeMap::new(),
        }
    }

    /// Stage this message dispatches to.
    pub fn stage(&self) -> ModelResult<StageKind> {
        StageKind::from_app(&self.app)
    }

    pub fn chunk(&self) -> FrameChunk {
        FrameChunk {
            first: self.first.clone(),
            last: self.last.clone(),
        }
    }

    /// Copy of this message retargeted at `chunk`.
    pub fn for_chunk(&self, chunk: &FrameChunk) -> Self {
        let mut msg = self.clone();
        msg.first = chunk.first.clone();
        msg.last = chunk.last.clone();
        msg
    }

    /// Frames of the chunk, inclusive.
    pub fn frames(&self) -> Vec<FrameName> {
        frame_range(&self.first, &self.last)
    }

    pub fn flag(&self, name: &str) -> Option<&FlagValue> {
        self.flags.get(name)
    }

    pub fn set_flag(&mut self, name: impl Into<String>, value: impl Into<FlagValue>) {
        self.flags.insert(name.into(), value.into());
    }

    /// Blank a flag so it is not forwarded to the binary.
    pub fn clear_flag(&mut self, name: impl Into<String>) {
        self.flags.insert(name.into(), FlagValue::Text(String::new()));
    }

    pub fn require_image_type(&self) -> ModelResult<ImageType> {
        self.image_type.ok_or(ModelError::MissingParameter("image_type"))
    }

    pub fn require_dst_image_type(&self) -> ModelResult<ImageType> {
        self.dst_image_type.ok_or(ModelError::MissingParameter("dst_image_type"))
    }

    pub fn require_background_frame(&self) -> ModelResult<FrameName> {
        self.background_frame
            .clone()
            .ok_or(ModelError::MissingParameter("background_frame"))
    }

    /// Output extensions listed in `output_formats`.
    pub fn output_extensions(&self) -> Vec<String> {
        self.output_formats
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|ext| !ext.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn to_json(&self) -> ModelResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> ModelResult<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Render the message as `flag name -> value` for a binary invocation.
    ///
    /// Absent values are omitted; lists are comma joined.
    pub fn to_flag_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        let mut put = |name: &str, value: String| {
            map.insert(name.to_string(), value);
        };

        put("app", self.app.clone());
        put("first", self.first.to_string());
        put("last", self.last.to_string());
        put("input_root", self.input_root.clone());
        put("output_root", self.output_root.clone());
        put("rig", self.rig.clone());
        put("cameras", self.cameras.join(","));
        put("color_type", self.color_type.to_string());
        put("disparity_type", self.disparity_type.to_string());
        put("force_recompute", self.force_recompute.to_string());
        put("num_levels", self.num_levels.to_string());
        put("use_foreground_masks", self.use_foreground_masks.to_string());
        put("run_conversion", self.run_conversion.to_string());

        let optional = [
            ("background_frame", self.background_frame.as_ref().map(ToString::to_string)),
            ("image_type", self.image_type.map(|t| t.to_string())),
            ("level", self.level.map(|l| l.to_string())),
            ("dst_image_type", self.dst_image_type.map(|t| t.to_string())),
            ("src_image_type", self.src_image_type.map(|t| t.to_string())),
            ("src_level", self.src_level.map(|l| l.to_string())),
            ("level_start", self.level_start.map(|l| l.to_string())),
            ("level_end", self.level_end.map(|l| l.to_string())),
            ("threshold", self.threshold.map(|t| t.to_string())),
            ("filter_first", self.filter_first.as_ref().map(ToString::to_string)),
            ("filter_last", self.filter_last.as_ref().map(ToString::to_string)),
            ("output_formats", self.output_formats.clone()),
            ("file_type", self.file_type.clone()),
            ("format", self.format.clone()),
            ("resolution", self.resolution.map(|r| r.to_string())),
            ("time_radius", self.time_radius.map(|r| r.to_string())),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                put(name, value);
            }
        }

        match &self.dst_level {
            LevelSpec::One(level) => put("dst_level", level.to_string()),
            LevelSpec::Many(levels) => put(
                "dst_level",
                levels.iter().map(u32::to_string).collect::<Vec<_>>().join(","),
            ),
            LevelSpec::None => {}
        }

        for (name, value) in &self.flags {
            put(name, value.to_string());
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JobMessage {
        let chunk = FrameChunk::new(FrameName::new(1), FrameName::new(3)).unwrap();
        let mut msg = JobMessage::new("DerpCLI: Level 3", &chunk, "/data/in", "/data/out", "/data/in/rig.json");
        msg.level_start = Some(3);
        msg.dst_level = LevelSpec::One(3);
        msg.dst_image_type = Some(ImageType::Disparity);
        msg.set_flag("min_depth_meters", FlagValue::Float(1.5));
        msg.set_flag("color", "/data/in/video/color_levels");
        msg
    }

    #[test]
    fn test_passthrough_flags_survive_the_wire() {
        let msg = sample();
        let decoded = JobMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.flag("min_depth_meters"), Some(&FlagValue::Float(1.5)));
    }

    #[test]
    fn test_wire_format_is_flat() {
        let value: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(value["app"], "DerpCLI: Level 3");
        assert_eq!(value["first"], "000001");
        assert_eq!(value["dst_level"], 3);
        assert_eq!(value["color"], "/data/in/video/color_levels");
        assert!(value.get("flags").is_none());
        assert!(value.get("level").is_none());
    }

    #[test]
    fn test_unknown_keys_become_flags() {
        let raw = r#"{"app":"Resize: Color","first":"000000","last":"000000",
            "input_root":"/i","output_root":"/o","rig":"/i/rig.json",
            "dst_level":[0,1],"image_type":"color","verbose":true,"var_noise_floor":0.004}"#;
        let msg = JobMessage::from_json(raw).unwrap();
        assert_eq!(msg.stage().unwrap(), StageKind::Resize);
        assert_eq!(msg.dst_level, LevelSpec::Many(vec![0, 1]));
        assert_eq!(msg.flag("verbose"), Some(&FlagValue::Bool(true)));
        assert_eq!(msg.flag("var_noise_floor"), Some(&FlagValue::Float(0.004)));
        assert_eq!(msg.num_levels, 10);
    }

    #[test]
    fn test_flag_map_renders_levels_and_blanks() {
        let mut msg = sample();
        msg.dst_level = LevelSpec::Many(vec![2, 3]);
        msg.clear_flag("disparity");
        let flags = msg.to_flag_map();
        assert_eq!(flags["dst_level"], "2,3");
        assert_eq!(flags["level_start"], "3");
        assert_eq!(flags["last"], "000003");
        assert_eq!(flags["disparity"], "");
        assert!(!flags.contains_key("level"));
    }

    #[test]
    fn test_for_chunk_leaves_original_untouched() {
        let msg = sample();
        let other = msg.for_chunk(&FrameChunk::single(FrameName::new(9)));
        assert_eq!(other.first.as_str(), "000009");
        assert_eq!(msg.first.as_str(), "000001");
    }

    #[test]
    fn test_flag_value_parse() {
        assert_eq!(FlagValue::parse("true"), FlagValue::Bool(true));
        assert_eq!(FlagValue::parse("12"), FlagValue::Int(12));
        assert_eq!(FlagValue::parse("0.5"), FlagValue::Float(0.5));
        assert_eq!(FlagValue::parse("pfm,png"), FlagValue::Text("pfm,png".into()));
    }

    #[test]
    fn test_output_extensions() {
        let mut msg = sample();
        assert!(msg.output_extensions().is_empty());
        msg.output_formats = Some("pfm, png".into());
        assert_eq!(msg.output_extensions(), vec!["pfm", "png"]);
    }
}
