//! Output router dispatching classified stacks into the four streams.

use crate::classify::Classification;
use crate::nod::{Chop, Nod, StreamId};
use crate::stream::{StreamError, StreamSet, StreamSink};

/// Prefix of the per-file header dump streams.
pub const HEADER_DUMP_PREFIX: &str = "fits_header";

/// Module name recorded in each stream's history on finalization.
pub const HISTORY_MODULE: &str = "NearInitialization";

/// Routes stacks by (nod, chop) and owns the sink they are persisted to.
#[derive(Debug)]
pub struct OutputRouter<S: StreamSink> {
    streams: StreamSet,
    sink: S,
}

impl<S: StreamSink> OutputRouter<S> {
    /// Create a router for four distinct stream names ordered as [`StreamId::ALL`].
    pub fn new(names: [String; 4], sink: S) -> Result<Self, StreamError> {
        Ok(Self {
            streams: StreamSet::new(names)?,
            sink,
        })
    }

    pub fn streams(&self) -> &StreamSet {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut StreamSet {
        &mut self.streams
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Discard prior contents of all four streams.
    pub fn clear_all(&mut self) -> Result<(), StreamError> {
        for stream in self.streams.iter_mut() {
            stream.reset(&mut self.sink)?;
        }
        Ok(())
    }

    /// Continue streams persisted by an earlier run instead of clearing them.
    pub fn resume_all(&mut self) -> Result<(), StreamError> {
        for stream in self.streams.iter_mut() {
            if let Some(metadata) = self.sink.load_metadata(stream.name())? {
                stream.resume(metadata);
            }
        }
        Ok(())
    }

    /// Append both chop stacks of a file to the streams of `nod`.
    ///
    /// An empty stack is skipped without error.
    pub fn route(&mut self, nod: Nod, classification: &Classification) -> Result<(), StreamError> {
        for chop in Chop::ALL {
            let stack = classification.stack(chop);
            if stack.is_empty() {
                continue;
            }
            self.streams
                .get_mut(StreamId::new(nod, chop))
                .append(stack.clone())?;
        }
        Ok(())
    }

    /// Flush both streams of `nod`.
    pub fn flush(&mut self, nod: Nod) -> Result<(), StreamError> {
        for chop in Chop::ALL {
            self.streams
                .get_mut(StreamId::new(nod, chop))
                .flush(&mut self.sink)?;
        }
        Ok(())
    }

    /// Store the composite header lines of `file` under `fits_header/<file>`.
    pub fn write_header_dump(&mut self, file: &str, lines: &[String]) -> Result<(), StreamError> {
        let name = format!("{}/{}", HEADER_DUMP_PREFIX, file);
        self.sink.write_lines(&name, lines)?;
        Ok(())
    }

    /// Record the history entry on every stream and close all four.
    pub fn finalize(&mut self) -> Result<(), StreamError> {
        for stream in self.streams.iter_mut() {
            let label = stream.id().label();
            stream.add_history(HISTORY_MODULE, label);
            stream.close(&mut self.sink)?;
        }
        Ok(())
    }
}
