//! Run-scoped processing state.
//!
//! Everything that must persist across files of one run, and depends on the
//! sorted processing order, lives here and is threaded through the driver.

use crate::compose::NodResolver;
use crate::nod::NodScheme;

/// Mutable state of one demultiplexing run.
#[derive(Debug, Clone)]
pub struct RunContext {
    next_index: u64,
    total_files: usize,
    current_file: usize,
    /// Nod resolution with its one-time missing-key warning.
    pub nods: NodResolver,
}

impl RunContext {
    pub fn new(scheme: NodScheme, total_files: usize) -> Self {
        Self {
            next_index: 0,
            total_files,
            current_file: 0,
            nods: NodResolver::new(scheme),
        }
    }

    /// Hand out the next global frame index.
    pub fn next_index(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Number of indices handed out so far.
    pub fn frames_indexed(&self) -> u64 {
        self.next_index
    }

    /// Mark file `sequence` (0-based in sorted order) as the one being processed.
    pub fn begin_file(&mut self, sequence: usize) {
        self.current_file = sequence;
    }

    pub fn sequence(&self) -> usize {
        self.current_file
    }

    pub fn total_files(&self) -> usize {
        self.total_files
    }

    pub fn is_last_file(&self) -> bool {
        self.total_files > 0 && self.current_file + 1 == self.total_files
    }
}
