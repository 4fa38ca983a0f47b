//! Frame names and frame chunks.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Width of a zero-padded frame name.
pub const FRAME_NAME_WIDTH: usize = 6;

/// A zero-padded frame identifier, e.g. `000042`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String", into = "String")]
pub struct FrameName(String);

impl FrameName {
    /// Build the frame name of a frame number.
    pub fn new(frame: u32) -> Self {
        Self(format!("{:0width$}", frame, width = FRAME_NAME_WIDTH))
    }

    /// Frame number this name refers to.
    pub fn number(&self) -> u32 {
        // Validated as all digits on construction
        self.0.parse().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for FrameName {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        if s.len() < FRAME_NAME_WIDTH || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ModelError::invalid_frame(s));
        }
        let frame: u32 = s.parse().map_err(|_| ModelError::invalid_frame(s))?;
        // Normalise over-padded names ("0000042") to the canonical width
        Ok(Self::new(frame))
    }
}

impl TryFrom<String> for FrameName {
    type Error = ModelError;

    fn try_from(value: String) -> ModelResult<Self> {
        value.parse()
    }
}

impl From<FrameName> for String {
    fn from(value: FrameName) -> Self {
        value.0
    }
}

/// Numeric order, so seven-digit frames sort after `999999`.
impl Ord for FrameName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number()
            .cmp(&other.number())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for FrameName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FrameName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Frame name for a frame number.
pub fn frame_name(frame: u32) -> FrameName {
    FrameName::new(frame)
}

/// Names of all frames in `[first, last]`, inclusive on both ends.
pub fn frame_range(first: &FrameName, last: &FrameName) -> Vec<FrameName> {
    (first.number()..=last.number()).map(FrameName::new).collect()
}

/// A contiguous inclusive range of frames dispatched as one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct FrameChunk {
    pub first: FrameName,
    pub last: FrameName,
}

impl FrameChunk {
    /// Create a chunk, rejecting `first > last`.
    pub fn new(first: FrameName, last: FrameName) -> ModelResult<Self> {
        if first > last {
            return Err(ModelError::invalid_chunk(format!("{first} > {last}")));
        }
        Ok(Self { first, last })
    }

    /// Chunk covering a single frame.
    pub fn single(frame: FrameName) -> Self {
        Self {
            first: frame.clone(),
            last: frame,
        }
    }

    /// Split `[first, last]` into chunks of `chunk_size` frames.
    ///
    /// The final chunk is truncated at `last`.
    pub fn split(first: &FrameName, last: &FrameName, chunk_size: u32) -> ModelResult<Vec<Self>> {
        if chunk_size == 0 {
            return Err(ModelError::invalid_chunk("chunk size must be positive"));
        }
        if first > last {
            return Err(ModelError::invalid_chunk(format!("{first} > {last}")));
        }

        let (first, last) = (first.number(), last.number());
        let chunks = (first..=last)
            .step_by(chunk_size as usize)
            .map(|start| Self {
                first: FrameName::new(start),
                last: FrameName::new(last.min(start.saturating_add(chunk_size - 1))),
            })
            .collect();
        Ok(chunks)
    }

    /// Chunk spanning from the first frame of `chunks` to the last frame of `chunks`.
    pub fn spanning(chunks: &[FrameChunk]) -> Option<Self> {
        let first = chunks.first()?.first.clone();
        let last = chunks.last()?.last.clone();
        Some(Self { first, last })
    }

    /// All frame names in the chunk.
    pub fn frames(&self) -> Vec<FrameName> {
        frame_range(&self.first, &self.last)
    }

    /// Number of frames in the chunk.
    pub fn len(&self) -> usize {
        (self.last.number() - self.first.number()) as usize + 1
    }

    /// Chunks always hold at least one frame.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `frame` lies inside the chunk.
    pub fn contains(&self, frame: &FrameName) -> bool {
        &self.first <= frame && frame <= &self.last
    }
}

impl fmt::Display for FrameChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> FrameName {
        s.parse().unwrap()
    }

    #[test]
    fn test_frame_name_padding() {
        assert_eq!(frame_name(0).as_str(), "000000");
        assert_eq!(frame_name(1700).as_str(), "001700");
        assert_eq!(name("000042").number(), 42);
    }

    #[test]
    fn test_frame_name_rejects_garbage() {
        assert!("42".parse::<FrameName>().is_err());
        assert!("00004a".parse::<FrameName>().is_err());
        assert!("".parse::<FrameName>().is_err());
    }

    #[test]
    fn test_frames_order_by_number_past_six_digits() {
        let wide = frame_name(1_000_000);
        assert_eq!(wide.as_str(), "1000000");
        assert!(frame_name(999_999) < wide);
        assert!(frame_name(200_000) < wide);

        let chunk = FrameChunk::new(frame_name(999_998), wide.clone()).unwrap();
        assert_eq!(chunk.frames().len(), 3);
        assert!(FrameChunk::new(wide, frame_name(200_000)).is_err());
    }

    #[test]
    fn test_frame_range_is_inclusive() {
        for (first, last) in [(0u32, 0u32), (5, 9), (998, 1003), (0, 99)] {
            let frames = frame_range(&frame_name(first), &frame_name(last));
            assert_eq!(frames.len() as u32, last - first + 1);
            assert_eq!(frames.first().unwrap(), &frame_name(first));
            assert_eq!(frames.last().unwrap(), &frame_name(last));
            for pair in frames.windows(2) {
                assert_eq!(pair[0].number() + 1, pair[1].number());
                assert_eq!(pair[1].as_str().len(), FRAME_NAME_WIDTH);
            }
        }
    }

    #[test]
    fn test_split_truncates_last_chunk() {
        let chunks = FrameChunk::split(&name("000010"), &name("000016"), 3).unwrap();
        let bounds: Vec<_> = chunks.iter().map(|c| c.to_string()).collect();
        assert_eq!(bounds, vec!["000010-000012", "000013-000015", "000016-000016"]);
    }

    #[test]
    fn test_split_single_frame_chunks() {
        let chunks = FrameChunk::split(&name("000000"), &name("000009"), 1).unwrap();
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().all(|c| c.len() == 1));
    }

    #[test]
    fn test_split_rejects_inverted_range() {
        assert!(FrameChunk::split(&name("000005"), &name("000004"), 1).is_err());
        assert!(FrameChunk::new(name("000005"), name("000004")).is_err());
        assert!(FrameChunk::split(&name("000000"), &name("000004"), 0).is_err());
    }

    #[test]
    fn test_chunk_serde_uses_frame_strings() {
        let chunk = FrameChunk::new(name("000001"), name("000003")).unwrap();
        let json = serde_json::to_string(&chunk).unwrap();
        assert_eq!(json, r#"{"first":"000001","last":"000003"}"#);
        assert!(serde_json::from_str::<FrameChunk>(r#"{"first":"1","last":"3"}"#).is_err());
    }
}
