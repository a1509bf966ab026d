//! Classifier module for splitting burst frames by chop position.
//!
//! Each frame carries its own half-cycle tag. Frames of the first half-cycle
//! belong to chop A, frames of the second to chop B, anything else is dropped.

use crate::diagnostics::{DiagnosticCode, Diagnostics};
use crate::exposure::Frame;
use crate::header::HeaderValue;
use crate::nod::Chop;
use ndarray::{s, Array3, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-frame header key carrying the chop half-cycle tag.
pub const CHOP_TAG_KEY: &str = "ESO DET FRAM TYPE";

/// Tag value of the first chop half-cycle.
pub const FIRST_HALF_CYCLE: &str = "HCYCLE1";

/// Tag value of the second chop half-cycle.
pub const SECOND_HALF_CYCLE: &str = "HCYCLE2";

/// Error type for frame classification
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    /// A frame does not have the dimensions of the first frame of its file
    #[error("{file}: frame {frame} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        file: String,
        frame: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// How classified stacks are trimmed to the frames actually written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TrimPolicy {
    /// Keep exactly the frames written to each bucket.
    #[default]
    WrittenCount,
    /// Additionally drop written frames whose first pixel is exactly zero,
    /// matching the legacy content-based trim.
    LegacyZeroPixel,
}

impl std::fmt::Display for TrimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrimPolicy::WrittenCount => write!(f, "written_count"),
            TrimPolicy::LegacyZeroPixel => write!(f, "legacy_zero_pixel"),
        }
    }
}

/// Frames of one file split by chop position.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Chop A stack, shape `(frames, ny, nx)`.
    pub chop_a: Array3<f32>,
    /// Chop B stack, shape `(frames, ny, nx)`.
    pub chop_b: Array3<f32>,
    /// Acquisition positions of the frames kept in `chop_a`.
    pub chop_a_frames: Vec<usize>,
    /// Acquisition positions of the frames kept in `chop_b`.
    pub chop_b_frames: Vec<usize>,
    /// Positions of frames with an unrecognised tag.
    pub dropped: Vec<usize>,
}

impl Classification {
    pub fn stack(&self, chop: Chop) -> &Array3<f32> {
        match chop {
            Chop::A => &self.chop_a,
            Chop::B => &self.chop_b,
        }
    }

    pub fn positions(&self, chop: Chop) -> &[usize] {
        match chop {
            Chop::A => &self.chop_a_frames,
            Chop::B => &self.chop_b_frames,
        }
    }

    /// Number of frames kept in either bucket.
    pub fn classified(&self) -> usize {
        self.chop_a_frames.len() + self.chop_b_frames.len()
    }

    /// Kept frames in acquisition order with their chop position.
    pub fn acquisition_order(&self) -> Vec<(usize, Chop)> {
        let mut order: Vec<(usize, Chop)> = self
            .chop_a_frames
            .iter()
            .map(|&p| (p, Chop::A))
            .chain(self.chop_b_frames.iter().map(|&p| (p, Chop::B)))
            .collect();
        order.sort_by_key(|(p, _)| *p);
        order
    }
}

/// Chop position encoded by a frame's half-cycle tag, if recognised.
pub fn chop_of(frame: &Frame) -> Option<Chop> {
    match frame.header.get(CHOP_TAG_KEY).and_then(HeaderValue::as_str) {
        Some(tag) if tag.trim() == FIRST_HALF_CYCLE => Some(Chop::A),
        Some(tag) if tag.trim() == SECOND_HALF_CYCLE => Some(Chop::B),
        _ => None,
    }
}

/// Classifies the frames of one file into chop A and chop B stacks.
///
/// Classification logic:
/// 1. Allocate both buckets with room for every frame of the file
/// 2. Append each frame to the bucket named by its tag; unknown tags are
///    reported and the frame is left out of both buckets
/// 3. Trim both buckets to the frames written (see [`TrimPolicy`])
/// 4. Report differing bucket sizes
///
/// All frames must share the dimensions of the first one.
pub fn classify_frames(
    frames: &[Frame],
    file: &str,
    policy: TrimPolicy,
    diags: &mut Diagnostics,
) -> Result<Classification, ClassifyError> {
    let (ny, nx) = frames.first().map(|f| f.image.dim()).unwrap_or((0, 0));
    let n = frames.len();
    if let Some((frame, found)) = frames
        .iter()
        .map(|f| f.image.dim())
        .enumerate()
        .find(|(_, dim)| *dim != (ny, nx))
    {
        return Err(ClassifyError::ShapeMismatch {
            file: file.to_string(),
            frame,
            expected: (ny, nx),
            found,
        });
    }

    let mut chop_a = Array3::<f32>::zeros((n, ny, nx));
    let mut chop_b = Array3::<f32>::zeros((n, ny, nx));
    let mut chop_a_frames = Vec::with_capacity(n);
    let mut chop_b_frames = Vec::with_capacity(n);
    let mut dropped = Vec::new();

    for (i, frame) in frames.iter().enumerate() {
        match chop_of(frame) {
            Some(Chop::A) => {
                chop_a
                    .slice_mut(s![chop_a_frames.len(), .., ..])
                    .assign(&frame.image);
                chop_a_frames.push(i);
            }
            Some(Chop::B) => {
                chop_b
                    .slice_mut(s![chop_b_frames.len(), .., ..])
                    .assign(&frame.image);
                chop_b_frames.push(i);
            }
            None => {
                let tag = frame
                    .header
                    .get(CHOP_TAG_KEY)
                    .map(HeaderValue::render)
                    .unwrap_or_else(|| "absent".to_string());
                diags.warn(
                    DiagnosticCode::UnknownChopTag,
                    format!(
                        "{}: chop position ({}) not recognised for frame {} (tag {})",
                        file, CHOP_TAG_KEY, i, tag
                    ),
                );
                dropped.push(i);
            }
        }
    }

    let (chop_a, chop_a_frames) = trim(chop_a, chop_a_frames, policy);
    let (chop_b, chop_b_frames) = trim(chop_b, chop_b_frames, policy);

    if chop_a_frames.len() != chop_b_frames.len() {
        diags.warn(
            DiagnosticCode::ChopImbalance,
            format!(
                "{}: number of frames is not equal for chop A ({}) and chop B ({})",
                file,
                chop_a_frames.len(),
                chop_b_frames.len()
            ),
        );
    }

    Ok(Classification {
        chop_a,
        chop_b,
        chop_a_frames,
        chop_b_frames,
        dropped,
    })
}

fn trim(
    stack: Array3<f32>,
    positions: Vec<usize>,
    policy: TrimPolicy,
) -> (Array3<f32>, Vec<usize>) {
    let written = positions.len();
    match policy {
        TrimPolicy::WrittenCount => {
            let stack = stack.slice(s![..written, .., ..]).to_owned();
            (stack, positions)
        }
        TrimPolicy::LegacyZeroPixel => {
            let keep: Vec<usize> = (0..written)
                .filter(|&k| stack.get((k, 0, 0)).map_or(false, |&v| v != 0.0))
                .collect();
            let positions = keep.iter().map(|&k| positions[k]).collect();
            (stack.select(Axis(0), &keep), positions)
        }
    }
}
