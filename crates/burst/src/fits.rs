//! FITS container access.
//!
//! Pixel data and file creation go through `fitsio` (cfitsio applies
//! BSCALE/BZERO and byte order). Header cards are parsed from the raw
//! 80-byte records instead, so HIERARCH keys and card order survive into the
//! typed [`Header`].

use crate::header::{Header, HeaderValue};
use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use ndarray::{Array2, ArrayView2};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// Size of one FITS block in bytes.
pub const BLOCK_SIZE: usize = 2880;

/// Size of one header card in bytes.
pub const CARD_SIZE: usize = 80;

/// Keys managed by cfitsio itself and never copied from the caller's header.
const STRUCTURAL_KEYS: &[&str] = &[
    "SIMPLE", "XTENSION", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "NAXIS3", "EXTEND", "PCOUNT",
    "GCOUNT", "EXTNAME", "END",
];

/// Commentary cards carry no key/value pair and are not kept.
const COMMENTARY_KEYS: &[&str] = &["COMMENT", "HISTORY", "CONTINUE", ""];

/// Error type for FITS operations.
#[derive(Debug, Error)]
pub enum FitsError {
    /// IO error while scanning the raw header cards.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Error reported by cfitsio.
    #[error("cfitsio error: {0}")]
    Fitsio(#[from] fitsio::errors::Error),

    /// The file ended inside a header or data unit.
    #[error("Truncated FITS file: {0}")]
    Truncated(String),

    /// A mandatory structural keyword is absent or invalid.
    #[error("Invalid FITS header in HDU {hdu}: {reason}")]
    InvalidHeader { hdu: usize, reason: String },

    /// BITPIX value outside the FITS standard.
    #[error("Unsupported BITPIX {0}")]
    UnsupportedBitpix(i64),

    /// HDU does not hold a 2-D image.
    #[error("HDU {hdu} is not a 2-D image (shape {shape:?})")]
    NotAnImage { hdu: usize, shape: Vec<usize> },
}

/// Header and data layout of one HDU as declared by its cards.
#[derive(Debug, Clone)]
pub struct HeaderUnit {
    pub header: Header,
    /// Axis lengths in FITS order: `[NAXIS1, NAXIS2, ...]`.
    pub shape: Vec<usize>,
    /// Size of the data unit in bytes, padding excluded.
    pub data_len: u64,
}

/// One header/data unit.
#[derive(Debug, Clone)]
pub struct Hdu {
    /// Position of the HDU in the file (0 = primary).
    pub index: usize,
    pub header: Header,
    /// Axis lengths in FITS order: `[NAXIS1, NAXIS2, ...]`.
    pub shape: Vec<usize>,
    /// Pixels in native byte order with BSCALE/BZERO applied.
    pub data: Vec<f32>,
}

impl Hdu {
    /// Interpret the data as a 2-D image of shape `(NAXIS2, NAXIS1)`.
    pub fn image(&self) -> Result<Array2<f32>, FitsError> {
        match self.shape.as_slice() {
            [nx, ny] => Array2::from_shape_vec((*ny, *nx), self.data.clone()).map_err(|_| {
                FitsError::NotAnImage {
                    hdu: self.index,
                    shape: self.shape.clone(),
                }
            }),
            _ => Err(FitsError::NotAnImage {
                hdu: self.index,
                shape: self.shape.clone(),
            }),
        }
    }
}

/// Read every HDU of the file at `path`.
///
/// The raw cards are scanned first, which also checks that every declared
/// data unit fits in the file before cfitsio allocates pixel buffers.
pub fn read_file(path: &Path) -> Result<Vec<Hdu>, FitsError> {
    let units = read_headers(BufReader::new(File::open(path)?))?;
    let mut fits = FitsFile::open(path)?;

    let mut hdus = Vec::with_capacity(units.len());
    for (index, unit) in units.into_iter().enumerate() {
        let hdu = fits.hdu(index)?;
        let data: Vec<f32> = match &hdu.info {
            HduInfo::ImageInfo { .. } if unit.data_len == 0 => Vec::new(),
            HduInfo::ImageInfo { .. } => hdu.read_image(&mut fits)?,
            _ => {
                return Err(FitsError::NotAnImage {
                    hdu: index,
                    shape: unit.shape,
                })
            }
        };
        let expected: usize = if unit.data_len == 0 {
            0
        } else {
            unit.shape.iter().product()
        };
        if data.len() != expected {
            return Err(FitsError::InvalidHeader {
                hdu: index,
                reason: format!("read {} pixels, header declares {}", data.len(), expected),
            });
        }
        hdus.push(Hdu {
            index,
            header: unit.header,
            shape: unit.shape,
            data,
        });
    }
    Ok(hdus)
}

/// Parse the header cards of every HDU in `reader`, skipping the data units.
pub fn read_headers<R: Read + Seek>(mut reader: R) -> Result<Vec<HeaderUnit>, FitsError> {
    let total = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let mut units = Vec::new();
    let mut block = [0u8; BLOCK_SIZE];
    let mut pos: u64 = 0;

    while units.is_empty() || pos < total {
        let index = units.len();

        // --- Header blocks ---
        let mut header = Header::new();
        let mut found_end = false;
        while !found_end {
            if !read_block(&mut reader, &mut block)? {
                return Err(FitsError::Truncated(format!(
                    "end of file inside header of HDU {}",
                    index
                )));
            }
            pos += BLOCK_SIZE as u64;
            for rec in block.chunks_exact(CARD_SIZE) {
                match parse_card(rec) {
                    Card::End => {
                        found_end = true;
                        break;
                    }
                    Card::KeyValue(key, value) => header.set(key, value),
                    Card::Commentary => {}
                }
            }
        }

        // --- Data blocks ---
        let shape = declared_shape(&header, index)?;
        let bitpix = header_int(&header, "BITPIX", index)?;
        let data_len = data_len(&shape, bitpix, index)?;
        let remaining = total - pos;
        if data_len > remaining {
            return Err(FitsError::Truncated(format!(
                "data of HDU {} needs {} bytes, {} remain",
                index, data_len, remaining
            )));
        }
        // A missing final pad is tolerated.
        pos = (pos + data_len + padding(data_len)).min(total);
        reader.seek(SeekFrom::Start(pos))?;

        units.push(HeaderUnit {
            header,
            shape,
            data_len,
        });
    }
    Ok(units)
}

/// Fill `block` from `reader`. Returns `Ok(false)` on a clean end of input.
fn read_block<R: Read>(reader: &mut R, block: &mut [u8; BLOCK_SIZE]) -> Result<bool, FitsError> {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = reader.read(&mut block[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    match filled {
        0 => Ok(false),
        BLOCK_SIZE => Ok(true),
        _ => Err(FitsError::Truncated(format!(
            "partial block of {} bytes",
            filled
        ))),
    }
}

fn padding(len: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    match len % block {
        0 => 0,
        rem => block - rem,
    }
}

fn header_int(header: &Header, key: &str, hdu: usize) -> Result<i64, FitsError> {
    header
        .get(key)
        .and_then(HeaderValue::as_i64)
        .ok_or_else(|| FitsError::InvalidHeader {
            hdu,
            reason: format!("missing or non-integer {}", key),
        })
}

fn declared_shape(header: &Header, hdu: usize) -> Result<Vec<usize>, FitsError> {
    let naxis = header.get("NAXIS").and_then(HeaderValue::as_i64).unwrap_or(0);
    if !(0..=999).contains(&naxis) {
        return Err(FitsError::InvalidHeader {
            hdu,
            reason: format!("NAXIS {} out of range", naxis),
        });
    }
    (1..=naxis)
        .map(|axis| {
            let key = format!("NAXIS{}", axis);
            let len = header_int(header, &key, hdu)?;
            usize::try_from(len).map_err(|_| FitsError::InvalidHeader {
                hdu,
                reason: format!("negative {} = {}", key, len),
            })
        })
        .collect()
}

/// Data unit size in bytes, rejecting sizes that do not fit in 64 bits.
fn data_len(shape: &[usize], bitpix: i64, hdu: usize) -> Result<u64, FitsError> {
    let bytes_per_pixel = match bitpix {
        8 | 16 | 32 | 64 | -32 | -64 => bitpix.unsigned_abs() / 8,
        other => return Err(FitsError::UnsupportedBitpix(other)),
    };
    if shape.is_empty() {
        return Ok(0);
    }
    shape
        .iter()
        .try_fold(bytes_per_pixel, |acc, &len| acc.checked_mul(len as u64))
        .ok_or_else(|| FitsError::InvalidHeader {
            hdu,
            reason: format!("data size of shape {:?} overflows", shape),
        })
}

enum Card {
    End,
    KeyValue(String, HeaderValue),
    Commentary,
}

fn parse_card(rec: &[u8]) -> Card {
    let card = String::from_utf8_lossy(rec);
    let card = card.trim_end();

    if card == "END" {
        return Card::End;
    }

    // HIERARCH long keywords: `HIERARCH ESO DET FRAM TYPE = 'HCYCLE1'`
    if let Some(rest) = card.strip_prefix("HIERARCH ") {
        return match rest.split_once('=') {
            Some((key, value)) => Card::KeyValue(
                key.trim().to_string(),
                HeaderValue::parse(strip_comment(value)),
            ),
            None => Card::Commentary,
        };
    }

    let key = card.get(..8).unwrap_or(card).trim();
    if COMMENTARY_KEYS.contains(&key) {
        return Card::Commentary;
    }
    match card.get(8..10) {
        Some("= ") => Card::KeyValue(
            key.to_string(),
            HeaderValue::parse(strip_comment(&card[10..])),
        ),
        _ => Card::Commentary,
    }
}

/// Remove the `/ comment` part of a value field, respecting quoted strings.
fn strip_comment(s: &str) -> &str {
    let s = s.trim();
    if s.starts_with('\'') {
        let bytes = s.as_bytes();
        let mut i = 1;
        while i < bytes.len() {
            if bytes[i] == b'\'' {
                if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                    i += 2;
                } else {
                    return &s[..=i];
                }
            } else {
                i += 1;
            }
        }
        s
    } else {
        match s.find('/') {
            Some(pos) => s[..pos].trim_end(),
            None => s,
        }
    }
}

/// Copy the non-structural cards of `header` into `hdu`.
///
/// Logicals are stored as `'T'`/`'F'` strings, which [`HeaderValue::as_bool`]
/// reads back. Long keys get the HIERARCH convention from cfitsio.
fn write_keys(fits: &mut FitsFile, hdu: &FitsHdu, header: &Header) -> Result<(), FitsError> {
    for (key, value) in header.iter() {
        if STRUCTURAL_KEYS.contains(&key) {
            continue;
        }
        match value {
            HeaderValue::Bool(b) => hdu.write_key(fits, key, if *b { "T" } else { "F" })?,
            HeaderValue::Int(i) => hdu.write_key(fits, key, *i)?,
            HeaderValue::Float(f) => hdu.write_key(fits, key, *f)?,
            HeaderValue::Str(s) => hdu.write_key(fits, key, s.as_str())?,
        }
    }
    Ok(())
}

/// Sequential FITS writer emitting single-precision image HDUs.
///
/// The file is closed when the writer is dropped.
pub struct FitsWriter {
    fits: FitsFile,
    hdus: usize,
}

impl FitsWriter {
    /// Create the file at `path`, replacing an existing one.
    pub fn create(path: &Path) -> Result<Self, FitsError> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let fits = FitsFile::create(path).open()?;
        Ok(Self { fits, hdus: 0 })
    }

    /// Write a header-only HDU. The first call fills the primary HDU.
    pub fn write_header(&mut self, header: &Header) -> Result<(), FitsError> {
        let hdu = if self.hdus == 0 {
            self.fits.primary_hdu()?
        } else {
            let description = ImageDescription {
                data_type: ImageType::Float,
                dimensions: &[],
            };
            self.fits
                .create_image(extension_name(self.hdus), &description)?
        };
        write_keys(&mut self.fits, &hdu, header)?;
        self.hdus += 1;
        Ok(())
    }

    /// Append an image extension holding `image` (rows = NAXIS2, columns = NAXIS1).
    ///
    /// Without a prior [`FitsWriter::write_header`] the primary HDU stays empty.
    pub fn write_image(
        &mut self,
        header: &Header,
        image: ArrayView2<f32>,
    ) -> Result<(), FitsError> {
        if self.hdus == 0 {
            self.hdus = 1;
        }
        let (ny, nx) = image.dim();
        let description = ImageDescription {
            data_type: ImageType::Float,
            dimensions: &[ny, nx],
        };
        let hdu = self
            .fits
            .create_image(extension_name(self.hdus), &description)?;
        write_keys(&mut self.fits, &hdu, header)?;
        let pixels: Vec<f32> = image.iter().copied().collect();
        hdu.write_image(&mut self.fits, &pixels)?;
        self.hdus += 1;
        Ok(())
    }

    /// Number of HDUs in the file so far, the primary included.
    pub fn hdu_count(&self) -> usize {
        self.hdus
    }
}

fn extension_name(index: usize) -> String {
    format!("FRAME{}", index)
}
