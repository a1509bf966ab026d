//! Output streams and the sinks that persist them.
//!
//! An [`OutputStream`] buffers the frames routed to it between flushes and owns
//! the accumulated attributes. Persistence is behind the [`StreamSink`] trait so
//! the router can write into memory (tests, embedding) or a directory tree.

use crate::attributes::StreamAttributes;
use crate::nod::StreamId;
use ndarray::{Array3, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Raw frame data file of a directory stream.
pub const FRAMES_FILE: &str = "frames.f32";

/// Metadata file of a directory stream.
pub const METADATA_FILE: &str = "stream.json";

/// Line dump file of a directory stream.
pub const LINES_FILE: &str = "header.txt";

/// Errors raised by a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid stream name '{0}'")]
    InvalidName(String),
}

/// Errors raised by output streams.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Duplicate output stream name '{0}'")]
    DuplicateName(String),

    #[error("Stream '{stream}' holds frames of shape {expected:?}, got {found:?}")]
    ShapeMismatch {
        stream: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// A history record attached to a stream on finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub module: String,
    pub label: String,
}

/// Persisted description of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub name: String,
    pub frames: usize,
    /// `[ny, nx]` once the first frame has been written.
    pub frame_shape: Option<[usize; 2]>,
    pub attributes: StreamAttributes,
    pub history: Vec<HistoryEntry>,
    pub closed: bool,
}

/// Storage backend for named streams.
pub trait StreamSink {
    /// Discard everything stored under `name`.
    fn clear(&mut self, name: &str) -> Result<(), SinkError>;

    /// Append a block of frames shaped `(n, ny, nx)`.
    fn append_frames(&mut self, name: &str, frames: ArrayView3<'_, f32>) -> Result<(), SinkError>;

    /// Replace the stored metadata of a stream.
    fn write_metadata(&mut self, metadata: &StreamMetadata) -> Result<(), SinkError>;

    /// Replace the line dump stored under `name`.
    fn write_lines(&mut self, name: &str, lines: &[String]) -> Result<(), SinkError>;

    /// Metadata previously stored for `name`, if any.
    fn load_metadata(&self, name: &str) -> Result<Option<StreamMetadata>, SinkError>;
}

/// One of the four demultiplexed output streams.
#[derive(Debug, Clone)]
pub struct OutputStream {
    id: StreamId,
    name: String,
    pending: Vec<Array3<f32>>,
    frame_shape: Option<(usize, usize)>,
    written: usize,
    history: Vec<HistoryEntry>,
    closed: bool,
    pub attributes: StreamAttributes,
}

impl OutputStream {
    pub fn new(id: StreamId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            pending: Vec::new(),
            frame_shape: None,
            written: 0,
            history: Vec::new(),
            closed: false,
            attributes: StreamAttributes::default(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_shape(&self) -> Option<(usize, usize)> {
        self.frame_shape
    }

    /// Frames written plus frames buffered.
    pub fn frames_total(&self) -> usize {
        self.written + self.pending_frames()
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.iter().map(|b| b.len_of(Axis(0))).sum()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Buffer a `(n, ny, nx)` block. Empty blocks are ignored.
    pub fn append(&mut self, block: Array3<f32>) -> Result<(), StreamError> {
        let (n, ny, nx) = block.dim();
        if n == 0 {
            return Ok(());
        }
        match self.frame_shape {
            Some(expected) if expected != (ny, nx) => {
                return Err(StreamError::ShapeMismatch {
                    stream: self.name.clone(),
                    expected,
                    found: (ny, nx),
                })
            }
            Some(_) => {}
            None => self.frame_shape = Some((ny, nx)),
        }
        self.pending.push(block);
        Ok(())
    }

    /// Write buffered frames and the current metadata to `sink`.
    pub fn flush<S: StreamSink>(&mut self, sink: &mut S) -> Result<(), StreamError> {
        for block in self.pending.drain(..) {
            sink.append_frames(&self.name, block.view())?;
            self.written += block.len_of(Axis(0));
        }
        sink.write_metadata(&self.metadata())?;
        Ok(())
    }

    pub fn add_history(&mut self, module: impl Into<String>, label: impl Into<String>) {
        self.history.push(HistoryEntry {
            module: module.into(),
            label: label.into(),
        });
    }

    /// Flush and mark the stream closed.
    pub fn close<S: StreamSink>(&mut self, sink: &mut S) -> Result<(), StreamError> {
        self.closed = true;
        self.flush(sink)
    }

    /// Drop all frames and attributes, both buffered and persisted.
    pub fn reset<S: StreamSink>(&mut self, sink: &mut S) -> Result<(), StreamError> {
        sink.clear(&self.name)?;
        self.pending.clear();
        self.frame_shape = None;
        self.written = 0;
        self.history.clear();
        self.closed = false;
        self.attributes.clear();
        Ok(())
    }

    /// Continue a stream persisted by an earlier run.
    ///
    /// Frames and attributes already stored are kept; new frames are appended.
    pub fn resume(&mut self, metadata: StreamMetadata) {
        self.pending.clear();
        self.written = metadata.frames;
        self.frame_shape = metadata.frame_shape.map(|[ny, nx]| (ny, nx));
        self.attributes = metadata.attributes;
        self.history = metadata.history;
        self.closed = false;
    }

    pub fn metadata(&self) -> StreamMetadata {
        StreamMetadata {
            name: self.name.clone(),
            frames: self.written,
            frame_shape: self.frame_shape.map(|(ny, nx)| [ny, nx]),
            attributes: self.attributes.clone(),
            history: self.history.clone(),
            closed: self.closed,
        }
    }
}

/// The four output streams, addressable by [`StreamId`].
#[derive(Debug, Clone)]
pub struct StreamSet {
    streams: [OutputStream; 4],
}

impl StreamSet {
    /// Build the set from names ordered as [`StreamId::ALL`].
    pub fn new(names: [String; 4]) -> Result<Self, StreamError> {
        {
            let mut seen = HashSet::new();
            for name in &names {
                if !seen.insert(name.as_str()) {
                    return Err(StreamError::DuplicateName(name.clone()));
                }
            }
        }
        let [aa, ab, ba, bb] = names;
        let [id_aa, id_ab, id_ba, id_bb] = StreamId::ALL;
        Ok(Self {
            streams: [
                OutputStream::new(id_aa, aa),
                OutputStream::new(id_ab, ab),
                OutputStream::new(id_ba, ba),
                OutputStream::new(id_bb, bb),
            ],
        })
    }

    pub fn get(&self, id: StreamId) -> &OutputStream {
        &self.streams[id.slot()]
    }

    pub fn get_mut(&mut self, id: StreamId) -> &mut OutputStream {
        &mut self.streams[id.slot()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputStream> {
        self.streams.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OutputStream> {
        self.streams.iter_mut()
    }

    pub fn names(&self) -> Vec<&str> {
        self.streams.iter().map(OutputStream::name).collect()
    }
}

/// In-memory contents of one named stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStream {
    pub data: Vec<f32>,
    pub frame_shape: Option<(usize, usize)>,
    pub metadata: Option<StreamMetadata>,
    pub lines: Vec<String>,
}

/// Sink keeping everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    streams: BTreeMap<String, MemoryStream>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&MemoryStream> {
        self.streams.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    /// Stored frames of `name` as `(n, ny, nx)`.
    pub fn frames(&self, name: &str) -> Option<Array3<f32>> {
        let stream = self.streams.get(name)?;
        let (ny, nx) = stream.frame_shape?;
        let n = if ny * nx == 0 { 0 } else { stream.data.len() / (ny * nx) };
        Array3::from_shape_vec((n, ny, nx), stream.data.clone()).ok()
    }

    pub fn metadata(&self, name: &str) -> Option<&StreamMetadata> {
        self.streams.get(name).and_then(|s| s.metadata.as_ref())
    }

    pub fn lines(&self, name: &str) -> Option<&[String]> {
        self.streams.get(name).map(|s| s.lines.as_slice())
    }
}

impl StreamSink for MemorySink {
    fn clear(&mut self, name: &str) -> Result<(), SinkError> {
        self.streams.remove(name);
        Ok(())
    }

    fn append_frames(&mut self, name: &str, frames: ArrayView3<'_, f32>) -> Result<(), SinkError> {
        let (_, ny, nx) = frames.dim();
        let stream = self.streams.entry(name.to_string()).or_default();
        stream.frame_shape.get_or_insert((ny, nx));
        stream.data.extend(frames.iter().copied());
        Ok(())
    }

    fn write_metadata(&mut self, metadata: &StreamMetadata) -> Result<(), SinkError> {
        self.streams.entry(metadata.name.clone()).or_default().metadata = Some(metadata.clone());
        Ok(())
    }

    fn write_lines(&mut self, name: &str, lines: &[String]) -> Result<(), SinkError> {
        self.streams.entry(name.to_string()).or_default().lines = lines.to_vec();
        Ok(())
    }

    fn load_metadata(&self, name: &str) -> Result<Option<StreamMetadata>, SinkError> {
        Ok(self.metadata(name).cloned())
    }
}

/// Sink persisting each stream into its own directory under `root`.
///
/// Layout per stream: `frames.f32` (little-endian pixels, appended),
/// `stream.json` (metadata, replaced atomically) and `header.txt` (line dumps).
/// Slashes in stream names create nested directories.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding stream `name`.
    pub fn stream_dir(&self, name: &str) -> Result<PathBuf, SinkError> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(SinkError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Read back the metadata of stream `name`.
    pub fn read_metadata(&self, name: &str) -> Result<StreamMetadata, SinkError> {
        let path = self.stream_dir(name)?.join(METADATA_FILE);
        let text = fs::read_to_string(&path).map_err(|source| SinkError::Io { path, source })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Read back the frames of stream `name` as `(n, ny, nx)`.
    pub fn read_frames(&self, name: &str) -> Result<Array3<f32>, SinkError> {
        let metadata = self.read_metadata(name)?;
        let [ny, nx] = metadata.frame_shape.unwrap_or([0, 0]);
        let path = self.stream_dir(name)?.join(FRAMES_FILE);

        let mut bytes = Vec::new();
        if path.exists() {
            File::open(&path)
                .and_then(|mut f| f.read_to_end(&mut bytes))
                .map_err(|source| SinkError::Io {
                    path: path.clone(),
                    source,
                })?;
        }
        let data: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let n = if ny * nx == 0 { 0 } else { data.len() / (ny * nx) };
        let data = data.into_iter().take(n * ny * nx).collect();
        Array3::from_shape_vec((n, ny, nx), data).map_err(|e| SinkError::Io {
            path,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    pub fn read_lines(&self, name: &str) -> Result<Vec<String>, SinkError> {
        let path = self.stream_dir(name)?.join(LINES_FILE);
        let text = fs::read_to_string(&path).map_err(|source| SinkError::Io { path, source })?;
        Ok(text.lines().map(str::to_string).collect())
    }

    fn ensure_dir(&self, name: &str) -> Result<PathBuf, SinkError> {
        let dir = self.stream_dir(name)?;
        fs::create_dir_all(&dir).map_err(|source| SinkError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), SinkError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).map_err(|source| SinkError::Io {
        path: tmp.clone(),
        source,
    })?;
    if let Err(source) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(SinkError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

impl StreamSink for DirectorySink {
    fn clear(&mut self, name: &str) -> Result<(), SinkError> {
        let dir = self.stream_dir(name)?;
        for file in [FRAMES_FILE, METADATA_FILE, LINES_FILE] {
            let path = dir.join(file);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(SinkError::Io { path, source }),
            }
        }
        Ok(())
    }

    fn append_frames(&mut self, name: &str, frames: ArrayView3<'_, f32>) -> Result<(), SinkError> {
        let path = self.ensure_dir(name)?.join(FRAMES_FILE);
        let io_err = |source: std::io::Error| SinkError::Io {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        for value in frames.iter() {
            writer.write_all(&value.to_le_bytes()).map_err(io_err)?;
        }
        writer.flush().map_err(io_err)?;
        Ok(())
    }

    fn write_metadata(&mut self, metadata: &StreamMetadata) -> Result<(), SinkError> {
        let path = self.ensure_dir(&metadata.name)?.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&path, &json)
    }

    fn write_lines(&mut self, name: &str, lines: &[String]) -> Result<(), SinkError> {
        let path = self.ensure_dir(name)?.join(LINES_FILE);
        let mut text = lines.join("\n");
        text.push('\n');
        write_atomic(&path, text.as_bytes())
    }

    fn load_metadata(&self, name: &str) -> Result<Option<StreamMetadata>, SinkError> {
        match self.read_metadata(name) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(SinkError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderValue;
    use crate::nod::{Chop, Nod};
    use tempfile::TempDir;

    fn names() -> [String; 4] {
        ["aa", "ab", "ba", "bb"].map(String::from)
    }

    fn block(n: usize, value: f32) -> Array3<f32> {
        Array3::from_elem((n, 2, 3), value)
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dup = ["x", "y", "x", "z"].map(String::from);
        match StreamSet::new(dup) {
            Err(StreamError::DuplicateName(name)) => assert_eq!(name, "x"),
            other => panic!("expected DuplicateName, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_stream_set_slots_follow_ids() {
        let set = StreamSet::new(names()).unwrap();
        assert_eq!(set.get(StreamId::new(Nod::A, Chop::B)).name(), "ab");
        assert_eq!(set.get(StreamId::new(Nod::B, Chop::A)).name(), "ba");
        assert_eq!(set.names(), vec!["aa", "ab", "ba", "bb"]);
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let mut stream = OutputStream::new(StreamId::new(Nod::A, Chop::A), "aa");
        stream.append(block(2, 1.0)).unwrap();
        let err = stream
            .append(Array3::zeros((1, 4, 4)))
            .expect_err("mismatched block must fail");
        assert!(matches!(err, StreamError::ShapeMismatch { .. }));
        // Empty blocks never set or check a shape.
        stream.append(Array3::zeros((0, 9, 9))).unwrap();
    }

    #[test]
    fn test_flush_moves_pending_to_sink() {
        let mut sink = MemorySink::new();
        let mut stream = OutputStream::new(StreamId::new(Nod::B, Chop::B), "bb");
        stream.append(block(2, 1.0)).unwrap();
        stream.append(block(1, 2.0)).unwrap();
        assert_eq!(stream.pending_frames(), 3);

        stream.flush(&mut sink).unwrap();
        assert_eq!(stream.pending_frames(), 0);
        assert_eq!(stream.frames_total(), 3);

        let frames = sink.frames("bb").unwrap();
        assert_eq!(frames.dim(), (3, 2, 3));
        assert_eq!(frames[[2, 0, 0]], 2.0);
        assert_eq!(sink.metadata("bb").unwrap().frames, 3);
    }

    #[test]
    fn test_reset_clears_sink_and_state() {
        let mut sink = MemorySink::new();
        let mut stream = OutputStream::new(StreamId::new(Nod::A, Chop::A), "aa");
        stream.append(block(1, 1.0)).unwrap();
        stream.attributes.index.push(0);
        stream.flush(&mut sink).unwrap();

        stream.reset(&mut sink).unwrap();
        assert_eq!(stream.frames_total(), 0);
        assert!(stream.attributes.index.is_empty());
        assert!(sink.get("aa").is_none());
    }

    #[test]
    fn test_directory_sink_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = DirectorySink::new(temp_dir.path());
        let mut stream = OutputStream::new(StreamId::new(Nod::A, Chop::B), "noda_chopb");

        stream.append(block(2, 1.5)).unwrap();
        stream.flush(&mut sink).unwrap();
        stream.append(block(1, -4.0)).unwrap();
        stream.attributes.record_static("DIT", HeaderValue::Float(0.01));
        stream.add_history("NearInitialization", "Nod A, Chop B");
        stream.close(&mut sink).unwrap();

        let frames = sink.read_frames("noda_chopb").unwrap();
        assert_eq!(frames.dim(), (3, 2, 3));
        assert_eq!(frames[[0, 1, 2]], 1.5);
        assert_eq!(frames[[2, 0, 0]], -4.0);

        let meta = sink.read_metadata("noda_chopb").unwrap();
        assert!(meta.closed);
        assert_eq!(meta.frames, 3);
        assert_eq!(meta.frame_shape, Some([2, 3]));
        assert_eq!(meta.history[0].label, "Nod A, Chop B");
        assert_eq!(meta.attributes.get_static("DIT"), Some(&HeaderValue::Float(0.01)));
        assert!(!temp_dir.path().join("noda_chopb/stream.json.tmp").exists());
    }

    #[test]
    fn test_directory_sink_nested_lines() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = DirectorySink::new(temp_dir.path());
        let lines = vec!["SIMPLE = T".to_string(), "NAXIS = 3".to_string()];
        sink.write_lines("fits_header/burst_0001.fits", &lines).unwrap();

        assert!(temp_dir
            .path()
            .join("fits_header/burst_0001.fits")
            .join(LINES_FILE)
            .exists());
        assert_eq!(sink.read_lines("fits_header/burst_0001.fits").unwrap(), lines);
    }

    #[test]
    fn test_directory_sink_rejects_escaping_names() {
        let sink = DirectorySink::new("/tmp/out");
        assert!(matches!(sink.stream_dir("../x"), Err(SinkError::InvalidName(_))));
        assert!(matches!(sink.stream_dir(""), Err(SinkError::InvalidName(_))));
        assert!(matches!(sink.stream_dir("/abs"), Err(SinkError::InvalidName(_))));
    }

    #[test]
    fn test_resume_appends_to_persisted_stream() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = DirectorySink::new(temp_dir.path());
        let id = StreamId::new(Nod::B, Chop::A);

        let mut first = OutputStream::new(id, "ba");
        first.append(block(2, 1.0)).unwrap();
        first.attributes.files.push("one.fits".to_string());
        first.close(&mut sink).unwrap();

        let mut second = OutputStream::new(id, "ba");
        let stored = sink.load_metadata("ba").unwrap().unwrap();
        second.resume(stored);
        second.append(block(1, 2.0)).unwrap();
        second.attributes.files.push("two.fits".to_string());
        second.close(&mut sink).unwrap();

        assert_eq!(sink.read_frames("ba").unwrap().dim(), (3, 2, 3));
        let meta = sink.read_metadata("ba").unwrap();
        assert_eq!(meta.frames, 3);
        assert_eq!(meta.attributes.files, vec!["one.fits", "two.fits"]);
        assert!(sink.load_metadata("missing").unwrap().is_none());
    }

    #[test]
    fn test_directory_sink_clear_missing_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let mut sink = DirectorySink::new(temp_dir.path());
        sink.clear("never_written").unwrap();
    }
}
