//! Header composer for burst files.
//!
//! Builds the composite header of one file (general header overlaid with the
//! first frame's header plus the stacked dimensionality), determines the nod
//! position and checks the instrument's chopping state.

use crate::diagnostics::{DiagnosticCode, Diagnostics};
use crate::exposure::Exposure;
use crate::header::{Header, HeaderValue};
use crate::nod::{Nod, NodScheme};

/// Header key carrying the nod position.
pub const NOD_KEY: &str = "ESO SEQ NODPOS";

/// Header key reporting whether chopping was enabled.
pub const CHOP_ENABLED_KEY: &str = "ESO DET CHOP ST";

/// Header key with the number of skipped chop cycles.
pub const CHOP_SKIPPED_KEY: &str = "ESO DET CHOP CYCSKIP";

/// Header key reporting whether half-cycles were summed by the instrument.
pub const CHOP_SUMMED_KEY: &str = "ESO DET CHOP CYCSUM";

/// Keys placed right after the structural keys describing the frame stack.
const AXIS_KEYS: [&str; 4] = ["NAXIS", "NAXIS1", "NAXIS2", "NAXIS3"];

/// Composite header of one burst file with its nod position.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedHeader {
    pub header: Header,
    pub nod: Nod,
    /// True when the nod came from the positional scheme rather than the header.
    pub nod_inferred: bool,
}

/// Resolves nod positions over a run, warning once when the header key is absent.
#[derive(Debug, Clone)]
pub struct NodResolver {
    scheme: NodScheme,
    warned: bool,
}

impl NodResolver {
    pub fn new(scheme: NodScheme) -> Self {
        Self {
            scheme,
            warned: false,
        }
    }

    pub fn scheme(&self) -> NodScheme {
        self.scheme
    }

    /// Nod of the file at position `sequence` in the sorted run.
    ///
    /// Returns the nod and whether it was inferred from the scheme.
    pub fn resolve(
        &mut self,
        header: &Header,
        sequence: usize,
        diags: &mut Diagnostics,
    ) -> (Nod, bool) {
        let raw = header.get(NOD_KEY);
        if let Some(nod) = raw.and_then(HeaderValue::as_str).and_then(Nod::from_header) {
            return (nod, false);
        }

        if !self.warned {
            let found = match raw {
                Some(value) => format!(" (found {})", value.render()),
                None => String::new(),
            };
            diags.warn(
                DiagnosticCode::NodKeyMissing,
                format!(
                    "Keyword '{}' cannot be found{}. Assuming {} nod scheme",
                    NOD_KEY, found, self.scheme
                ),
            );
            self.warned = true;
        }
        (self.scheme.infer(sequence), true)
    }
}

/// Compose the header of `exposure` and determine its nod.
///
/// Frame keys take precedence over general keys. Existing axis keys are replaced
/// by `NAXIS = 3` and the three stack dimensions, placed where the axis keys live.
pub fn compose_header(
    exposure: &Exposure,
    sequence: usize,
    nods: &mut NodResolver,
    diags: &mut Diagnostics,
) -> ComposedHeader {
    let mut header = exposure.primary.clone();
    if let Some(first) = exposure.frames.first() {
        header.update(&first.header);
    }

    let (ny, nx) = exposure.frame_shape();
    insert_stack_axes(&mut header, nx, ny, exposure.frame_count());

    let (nod, nod_inferred) = nods.resolve(&header, sequence, diags);
    check_instrument(&header, &exposure.file_name(), diags);

    ComposedHeader {
        header,
        nod,
        nod_inferred,
    }
}

fn insert_stack_axes(header: &mut Header, nx: usize, ny: usize, nframes: usize) {
    let existing = AXIS_KEYS
        .iter()
        .chain(["NAXIS4"].iter())
        .filter_map(|k| header.position(k))
        .min();
    for key in AXIS_KEYS.iter().chain(["NAXIS4"].iter()) {
        header.remove(key);
    }

    // Without axis keys the stack description follows the structural prefix.
    let at = existing.unwrap_or_else(|| {
        ["SIMPLE", "XTENSION", "BITPIX"]
            .iter()
            .filter_map(|k| header.position(k))
            .max()
            .map(|p| p + 1)
            .unwrap_or(0)
    });

    let values = [3, nx, ny, nframes];
    for (offset, (key, value)) in AXIS_KEYS.iter().zip(values).enumerate() {
        header.insert_at(at + offset, *key, value as i64);
    }
}

/// Warn about instrument states that invalidate the chop assumptions.
///
/// Processing is not altered; absent keys are not reported.
pub fn check_instrument(header: &Header, file: &str, diags: &mut Diagnostics) {
    if header.get(CHOP_ENABLED_KEY).and_then(HeaderValue::as_bool) == Some(false) {
        diags.warn(
            DiagnosticCode::ChoppingDisabled,
            format!("{}: chopping has been set to disabled", file),
        );
    }

    if let Some(skipped) = header.get(CHOP_SKIPPED_KEY).and_then(HeaderValue::as_i64) {
        if skipped != 0 {
            diags.warn(
                DiagnosticCode::ChopCyclesSkipped,
                format!("{}: {} chop cycles have been skipped during operation", file, skipped),
            );
        }
    }

    if header.get(CHOP_SUMMED_KEY).and_then(HeaderValue::as_bool) == Some(true) {
        diags.warn(
            DiagnosticCode::FramesPreAveraged,
            format!(
                "{}: frames have been averaged by the instrument; chop separation is unreliable",
                file
            ),
        );
    }
}
