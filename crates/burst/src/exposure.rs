//! Exposure loader mapping a burst FITS file onto its frames.
//!
//! A burst file holds one header-only primary HDU with the general header, one
//! image HDU per frame (each with a small frame header), and a trailing HDU with
//! the average of all frames which is not a frame itself.

use crate::fits::{self, FitsError, FitsWriter, Hdu};
use crate::header::Header;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for exposure loading.
#[derive(Debug, Error)]
pub enum ExposureError {
    /// The underlying FITS container could not be read or written.
    #[error("{path}: {source}")]
    Fits {
        path: PathBuf,
        #[source]
        source: FitsError,
    },

    /// Fewer HDUs than primary + one frame + average.
    #[error("{path}: expected at least 3 HDUs (header, frames, average), found {found}")]
    MissingFrames { path: PathBuf, found: usize },

    /// Frames of one file have different dimensions.
    #[error("{path}: frame {frame} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        path: PathBuf,
        frame: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// One frame of a burst: its image plane and its own small header.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    /// Pixels in native byte order, shape `(ny, nx)`.
    pub image: Array2<f32>,
}

/// A decoded burst file.
#[derive(Debug, Clone, PartialEq)]
pub struct Exposure {
    pub path: PathBuf,
    /// General header from the primary HDU.
    pub primary: Header,
    /// Frames in acquisition order, the averaged HDU excluded.
    pub frames: Vec<Frame>,
}

impl Exposure {
    /// Read and decode the burst file at `path`.
    pub fn load(path: &Path) -> Result<Self, ExposureError> {
        let hdus = fits::read_file(path).map_err(|source| ExposureError::Fits {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_hdus(path, hdus)
    }

    /// Build an exposure from already decoded HDUs.
    pub fn from_hdus(path: &Path, hdus: Vec<Hdu>) -> Result<Self, ExposureError> {
        if hdus.len() < 3 {
            return Err(ExposureError::MissingFrames {
                path: path.to_path_buf(),
                found: hdus.len(),
            });
        }

        let nframes = hdus.len() - 2;
        let mut iter = hdus.into_iter();
        let primary = iter.next().map(|h| h.header).unwrap_or_default();

        let mut frames: Vec<Frame> = Vec::with_capacity(nframes);
        for (i, hdu) in iter.take(nframes).enumerate() {
            let image = hdu.image().map_err(|source| ExposureError::Fits {
                path: path.to_path_buf(),
                source,
            })?;
            if let Some(first) = frames.first() {
                if first.image.dim() != image.dim() {
                    return Err(ExposureError::ShapeMismatch {
                        path: path.to_path_buf(),
                        frame: i,
                        expected: first.image.dim(),
                        found: image.dim(),
                    });
                }
            }
            frames.push(Frame {
                header: hdu.header,
                image,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            primary,
            frames,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Frame dimensions as `(ny, nx)`.
    pub fn frame_shape(&self) -> (usize, usize) {
        self.frames
            .first()
            .map(|f| f.image.dim())
            .unwrap_or((0, 0))
    }

    /// File name without directory.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Write the exposure in burst layout, appending the averaged frame.
    pub fn write_to(&self, path: &Path) -> Result<(), ExposureError> {
        let wrap = |source: FitsError| ExposureError::Fits {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = FitsWriter::create(path).map_err(wrap)?;
        writer.write_header(&self.primary).map_err(wrap)?;
        for frame in &self.frames {
            writer
                .write_image(&frame.header, frame.image.view())
                .map_err(wrap)?;
        }

        let mut average = Array2::<f32>::zeros(self.frame_shape());
        for frame in &self.frames {
            average += &frame.image;
        }
        if !self.frames.is_empty() {
            average /= self.frames.len() as f32;
        }
        writer.write_image(&Header::new(), average.view()).map_err(wrap)?;
        Ok(())
    }
}
