//! Chop/nod burst demultiplexer
//!
//! Reads multi-frame FITS burst exposures and routes every frame into one of four
//! output streams keyed by (nod, chop), accumulating the per-stream attributes.

pub mod attributes;
pub mod classify;
pub mod compose;
pub mod concurrency;
pub mod context;
pub mod decompress;
pub mod diagnostics;
pub mod exposure;
pub mod fits;
pub mod header;
pub mod nod;
pub mod pipeline;
pub mod router;
pub mod scan;
pub mod stream;

pub use attributes::{
    AttributeAccumulator, AttributeSource, AttributeSpec, AttributeTable, FileUpdate,
    MissingKeyReport, StaticUpdate, StreamAttributes,
};
pub use chopnod_config as config;
pub use chopnod_config::Config;
pub use classify::{classify_frames, Classification, ClassifyError, TrimPolicy};
pub use compose::{compose_header, ComposedHeader, NodResolver};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use context::RunContext;
pub use decompress::{decompress_all, DecompressError, DecompressTool};
pub use diagnostics::{Diagnostic, DiagnosticCode, Diagnostics, Severity};
pub use exposure::{Exposure, ExposureError, Frame};
pub use fits::{FitsError, FitsWriter, Hdu};
pub use header::{Header, HeaderError, HeaderValue};
pub use nod::{Chop, Nod, NodScheme, StreamId, UnsupportedScheme};
pub use pipeline::{
    run_burst, BurstOptions, BurstPipeline, PipelineError, PipelineState, RunReport,
    DEFAULT_STREAM_NAMES,
};
pub use router::OutputRouter;
pub use scan::{scan_compressed_files, scan_fits_files, ScanError};
pub use stream::{
    DirectorySink, MemorySink, OutputStream, SinkError, StreamError, StreamMetadata, StreamSet,
    StreamSink,
};
