//! Diagnostics module for recoverable conditions found during a run.
//!
//! Every non-fatal condition is recorded as a structured [`Diagnostic`] so callers
//! and tests can inspect what happened, and is also emitted through `tracing`.

use serde::{Deserialize, Serialize};

/// Severity of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
}

/// Machine-readable code identifying the condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticCode {
    /// The nod position key is absent; nod inferred from the file position.
    NodKeyMissing,
    /// A static attribute differs from the value recorded by an earlier file.
    StaticAttributeChanged,
    /// A frame carries an unrecognised chop half-cycle tag and was dropped.
    UnknownChopTag,
    /// The chop A and chop B stacks of one file have different sizes.
    ChopImbalance,
    /// The instrument reports chopping disabled.
    ChoppingDisabled,
    /// The instrument reports skipped chop cycles.
    ChopCyclesSkipped,
    /// The instrument averaged frames before writing them.
    FramesPreAveraged,
    /// The header key of a static attribute is absent.
    StaticKeyMissing,
    /// The header key of a non-static attribute is absent.
    NonStaticKeyMissing,
    /// An output stream received no frames during the whole run.
    EmptyStream,
    /// The primary decompression utility was unavailable.
    DecompressFallback,
}

impl DiagnosticCode {
    /// Convert code to string for log output
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticCode::NodKeyMissing => "nod_key_missing",
            DiagnosticCode::StaticAttributeChanged => "static_attribute_changed",
            DiagnosticCode::UnknownChopTag => "unknown_chop_tag",
            DiagnosticCode::ChopImbalance => "chop_imbalance",
            DiagnosticCode::ChoppingDisabled => "chopping_disabled",
            DiagnosticCode::ChopCyclesSkipped => "chop_cycles_skipped",
            DiagnosticCode::FramesPreAveraged => "frames_pre_averaged",
            DiagnosticCode::StaticKeyMissing => "static_key_missing",
            DiagnosticCode::NonStaticKeyMissing => "non_static_key_missing",
            DiagnosticCode::EmptyStream => "empty_stream",
            DiagnosticCode::DecompressFallback => "decompress_fallback",
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single recoverable condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    /// Human-readable context (file, frame index, attribute name...).
    pub context: String,
}

/// Ordered collection of diagnostics accumulated during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    records: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning and emit it through `tracing`.
    pub fn warn(&mut self, code: DiagnosticCode, context: impl Into<String>) {
        let context = context.into();
        tracing::warn!(code = code.as_str(), "{}", context);
        self.records.push(Diagnostic {
            severity: Severity::Warning,
            code,
            context,
        });
    }

    /// Record an informational note and emit it through `tracing`.
    pub fn info(&mut self, code: DiagnosticCode, context: impl Into<String>) {
        let context = context.into();
        tracing::info!(code = code.as_str(), "{}", context);
        self.records.push(Diagnostic {
            severity: Severity::Info,
            code,
            context,
        });
    }

    /// Append every record of `other`, keeping order. Records are not logged again.
    pub fn extend(&mut self, other: Diagnostics) {
        self.records.extend(other.records);
    }

    pub fn records(&self) -> &[Diagnostic] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records carrying `code`.
    pub fn count(&self, code: DiagnosticCode) -> usize {
        self.records.iter().filter(|d| d.code == code).count()
    }

    /// Number of warning-level records.
    pub fn warning_count(&self) -> usize {
        self.records
            .iter()
            .filter(|d| d.severity == Severity::Warning)
            .count()
    }
}
