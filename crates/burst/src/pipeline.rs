//! Pipeline driver for one demultiplexing run.
//!
//! Drives the run through its states:
//! `Uninitialized → Validated → Decompressing → Processing(i) → Finalizing → Done`.
//! Construction validates the options; [`BurstPipeline::run`] does the rest.

use crate::attributes::{AttributeAccumulator, AttributeTable, FileUpdate, MissingKeyReport};
use crate::classify::{classify_frames, ClassifyError, TrimPolicy};
use crate::compose::compose_header;
use crate::concurrency::derive_plan;
use crate::config::Config;
use crate::context::RunContext;
use crate::decompress::{decompress_all, DecompressError};
use crate::diagnostics::Diagnostics;
use crate::exposure::{Exposure, ExposureError};
use crate::nod::{NodScheme, StreamId, UnsupportedScheme};
use crate::router::OutputRouter;
use crate::scan::{scan_compressed_files, scan_fits_files, ScanError};
use crate::stream::{StreamError, StreamSink};
use std::path::PathBuf;
use thiserror::Error;

/// Default output stream names ordered as [`StreamId::ALL`].
pub const DEFAULT_STREAM_NAMES: [&str; 4] =
    ["noda_chopa", "noda_chopb", "nodb_chopa", "nodb_chopb"];

/// Error type for a demultiplexing run
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Two of the four output streams share a name
    #[error("Output stream names must be distinct, '{0}' is used more than once")]
    DuplicateStreamName(String),

    /// Nod scheme literal other than ABBA or ABAB
    #[error(transparent)]
    UnsupportedScheme(#[from] UnsupportedScheme),

    /// The input directory holds no `.fits` files after decompression
    #[error("No input files ending in .fits found in {0}")]
    NoInputFiles(PathBuf),

    /// Input directory could not be listed
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// A decompression worker failed
    #[error(transparent)]
    Decompress(#[from] DecompressError),

    /// Unreadable or malformed burst file
    #[error(transparent)]
    Fits(#[from] ExposureError),

    /// Stream persistence failed or frames did not fit the stream
    #[error(transparent)]
    Sink(StreamError),

    /// Frames of one file could not be stacked
    #[error(transparent)]
    Classify(#[from] ClassifyError),

    /// The processing task panicked or was cancelled
    #[error("Processing task failed: {0}")]
    Join(String),

    /// `run` called on a pipeline that is not freshly validated
    #[error("Pipeline cannot run from state {0:?}")]
    InvalidState(PipelineState),
}

impl From<StreamError> for PipelineError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::DuplicateName(name) => PipelineError::DuplicateStreamName(name),
            other => PipelineError::Sink(other),
        }
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Validated,
    Decompressing,
    /// Processing the file at this 0-based position of the sorted input
    Processing(usize),
    Finalizing,
    Done,
}

/// Construction-time options of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct BurstOptions {
    pub input_dir: PathBuf,
    /// Stream names for (A,A), (A,B), (B,A), (B,B)
    pub names: [String; 4],
    /// Nod scheme literal, `ABBA` or `ABAB`
    pub scheme: String,
    /// Check every configured attribute, not only the required ones
    pub check: bool,
    /// Discard prior contents of the output streams
    pub overwrite: bool,
    pub missing_keys: MissingKeyReport,
    pub trim: TrimPolicy,
}

impl BurstOptions {
    pub fn new(input_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            names: DEFAULT_STREAM_NAMES.map(String::from),
            scheme: NodScheme::default().as_str().to_string(),
            check: true,
            overwrite: true,
            missing_keys: MissingKeyReport::default(),
            trim: TrimPolicy::default(),
        }
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Number of burst files processed
    pub files: usize,
    /// Stream name and frame count, ordered as [`StreamId::ALL`]
    pub frames_per_stream: Vec<(String, usize)>,
    /// Frames left out because their chop tag was not recognised
    pub frames_dropped: usize,
    pub diagnostics: Diagnostics,
    /// Next value of the global frame index, i.e. frames indexed in total
    pub final_index: u64,
}

impl RunReport {
    pub fn frames_in(&self, name: &str) -> Option<usize> {
        self.frames_per_stream
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, count)| *count)
    }
}

/// Per-file processing state, moved onto the blocking pool for the run.
#[derive(Debug)]
struct Demux<S: StreamSink> {
    router: OutputRouter<S>,
    accumulator: AttributeAccumulator,
    trim: TrimPolicy,
    state: PipelineState,
}

impl<S: StreamSink> Demux<S> {
    /// Process `files` in order and close the streams. Returns the frames dropped.
    fn process(
        &mut self,
        files: &[PathBuf],
        ctx: &mut RunContext,
        diags: &mut Diagnostics,
    ) -> Result<usize, PipelineError> {
        let mut frames_dropped = 0;

        for (i, path) in files.iter().enumerate() {
            self.state = PipelineState::Processing(i);
            ctx.begin_file(i);

            let exposure = Exposure::load(path)?;
            let file = exposure.file_name();
            let composed = compose_header(&exposure, i, &mut ctx.nods, diags);
            let classification = classify_frames(&exposure.frames, &file, self.trim, diags)?;

            self.router
                .write_header_dump(&file, &composed.header.dump_lines())?;
            self.router.route(composed.nod, &classification)?;

            let source = path.display().to_string();
            let update = FileUpdate {
                nod: composed.nod,
                header: &composed.header,
                frames: &exposure.frames,
                classification: &classification,
                source: &source,
                file: &file,
            };
            self.accumulator
                .apply(self.router.streams_mut(), &update, ctx, diags);
            self.router.flush(composed.nod)?;

            frames_dropped += classification.dropped.len();
            tracing::info!(
                file = %file,
                nod = %composed.nod,
                chop_a = classification.chop_a_frames.len(),
                chop_b = classification.chop_b_frames.len(),
                dropped = classification.dropped.len(),
                "Processed {}/{}",
                i + 1,
                files.len()
            );
        }

        self.state = PipelineState::Finalizing;
        self.router.finalize()?;
        self.state = PipelineState::Done;
        Ok(frames_dropped)
    }
}

/// Demultiplexes a directory of burst files into four output streams.
pub struct BurstPipeline<S: StreamSink> {
    options: BurstOptions,
    scheme: NodScheme,
    /// Absent only while a run holds it or after its processing task panicked
    demux: Option<Demux<S>>,
    workers: usize,
    state: PipelineState,
}

impl<S: StreamSink + Send + 'static> BurstPipeline<S> {
    /// Validate `options` and prepare the output streams.
    ///
    /// Fails before any input is read on duplicate stream names or an
    /// unsupported scheme. With `overwrite` the four streams are cleared,
    /// otherwise new frames are appended to what the sink already holds.
    pub fn new(options: BurstOptions, config: &Config, sink: S) -> Result<Self, PipelineError> {
        let scheme: NodScheme = options.scheme.parse()?;
        let mut router = OutputRouter::new(options.names.clone(), sink)?;

        if options.overwrite {
            router.clear_all()?;
        } else {
            router.resume_all()?;
        }

        let accumulator = AttributeAccumulator::new(
            AttributeTable::from_entries(&config.attributes),
            options.check,
            options.missing_keys,
            config.instrument.pixscale,
        );
        let workers = derive_plan(config).decompress_workers;

        Ok(Self {
            demux: Some(Demux {
                router,
                accumulator,
                trim: options.trim,
                state: PipelineState::Validated,
            }),
            options,
            scheme,
            workers,
            state: PipelineState::Validated,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn options(&self) -> &BurstOptions {
        &self.options
    }

    pub fn sink(&self) -> Option<&S> {
        self.demux.as_ref().map(|demux| demux.router.sink())
    }

    pub fn into_sink(self) -> Option<S> {
        self.demux.map(|demux| demux.router.into_sink())
    }

    /// Decompress, process every burst file in sorted order and close the streams.
    ///
    /// Files are read and routed one after another on the blocking pool.
    /// Fatal errors abort the run before the streams are closed.
    pub async fn run(&mut self) -> Result<RunReport, PipelineError> {
        if self.state != PipelineState::Validated {
            return Err(PipelineError::InvalidState(self.state));
        }
        let mut diags = Diagnostics::new();
        let input_dir = self.options.input_dir.clone();

        self.state = PipelineState::Decompressing;
        let compressed = scan_compressed_files(&input_dir)?;
        decompress_all(compressed, self.workers, &mut diags).await?;

        let files = scan_fits_files(&input_dir)?;
        if files.is_empty() {
            return Err(PipelineError::NoInputFiles(input_dir));
        }
        tracing::info!(
            files = files.len(),
            scheme = %self.scheme,
            input = %input_dir.display(),
            "Running chop/nod demultiplexer"
        );

        let mut demux = self
            .demux
            .take()
            .ok_or(PipelineError::InvalidState(self.state))?;
        let mut ctx = RunContext::new(self.scheme, files.len());
        self.state = PipelineState::Processing(0);

        let task = tokio::task::spawn_blocking(move || {
            let result = demux.process(&files, &mut ctx, &mut diags);
            (demux, ctx, diags, files.len(), result)
        });
        let (demux, ctx, diags, file_count, result) = task
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))?;
        self.state = demux.state;
        let demux = self.demux.insert(demux);
        let frames_dropped = result?;

        let frames_per_stream = StreamId::ALL
            .iter()
            .map(|id| {
                let stream = demux.router.streams().get(*id);
                (stream.name().to_string(), stream.frames_total())
            })
            .collect();

        Ok(RunReport {
            files: file_count,
            frames_per_stream,
            frames_dropped,
            diagnostics: diags,
            final_index: ctx.frames_indexed(),
        })
    }
}

/// Validate, run and return the report together with the sink.
pub async fn run_burst<S: StreamSink + Send + 'static>(
    options: BurstOptions,
    config: &Config,
    sink: S,
) -> Result<(RunReport, S), PipelineError> {
    let mut pipeline = BurstPipeline::new(options, config, sink)?;
    let report = pipeline.run().await?;
    let state = pipeline.state();
    let sink = pipeline
        .into_sink()
        .ok_or(PipelineError::InvalidState(state))?;
    Ok((report, sink))
}
