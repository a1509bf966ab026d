//! Attribute accumulator for the demultiplexed streams.
//!
//! Three categories of metadata are kept per output stream:
//! - static attributes, which must stay identical for every file of a stream
//!   (a change is reported and the newer value kept),
//! - non-static attributes, one value appended per frame routed to the stream,
//! - extra bookkeeping: the global frame `INDEX`, source `FILES` and `PIXSCALE`.

use crate::classify::Classification;
use crate::context::RunContext;
use crate::diagnostics::{DiagnosticCode, Diagnostics};
use crate::exposure::Frame;
use crate::header::{Header, HeaderValue};
use crate::nod::{Chop, Nod, StreamId};
use crate::stream::StreamSet;
use chopnod_config::{AttributeEntry, AttributeKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Name of the per-frame global index attribute.
pub const INDEX: &str = "INDEX";

/// Name of the source file list attribute.
pub const FILES: &str = "FILES";

/// Name of the pixel scale attribute.
pub const PIXSCALE: &str = "PIXSCALE";

/// Where an attribute value is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeSource {
    HeaderKey(String),
    NotApplicable,
}

/// Resolved attribute table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSpec {
    pub name: String,
    pub kind: AttributeKind,
    pub source: AttributeSource,
    /// Checked in lenient mode as well.
    pub required: bool,
}

/// Attribute table resolved once from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeTable {
    specs: Vec<AttributeSpec>,
}

impl AttributeTable {
    pub fn from_entries(entries: &BTreeMap<String, AttributeEntry>) -> Self {
        let specs = entries
            .iter()
            .map(|(name, entry)| AttributeSpec {
                name: name.clone(),
                kind: entry.kind,
                source: match entry.header_key() {
                    Some(key) => AttributeSource::HeaderKey(key.to_string()),
                    None => AttributeSource::NotApplicable,
                },
                required: entry.required,
            })
            .collect();
        Self { specs }
    }

    pub fn specs(&self) -> &[AttributeSpec] {
        &self.specs
    }

    /// Entries of `kind` that are checked under the given mode, with their header key.
    ///
    /// Strict mode (`check = true`) covers every entry, lenient mode only the
    /// required ones. Not-applicable entries are never returned.
    pub fn checked(
        &self,
        kind: AttributeKind,
        check: bool,
    ) -> impl Iterator<Item = (&str, &str)> {
        self.specs
            .iter()
            .filter(move |s| s.kind == kind && (check || s.required))
            .filter_map(|s| match &s.source {
                AttributeSource::HeaderKey(key) => Some((s.name.as_str(), key.as_str())),
                AttributeSource::NotApplicable => None,
            })
    }
}

/// Outcome of recording a static attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum StaticUpdate {
    Created,
    Unchanged,
    Updated { previous: HeaderValue },
}

/// Attributes accumulated by one output stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamAttributes {
    #[serde(rename = "static")]
    pub static_values: BTreeMap<String, HeaderValue>,
    pub non_static: BTreeMap<String, Vec<HeaderValue>>,
    #[serde(rename = "INDEX")]
    pub index: Vec<u64>,
    #[serde(rename = "FILES")]
    pub files: Vec<String>,
}

impl StreamAttributes {
    /// Create, confirm or overwrite the static attribute `name`.
    pub fn record_static(&mut self, name: &str, value: HeaderValue) -> StaticUpdate {
        match self.static_values.get_mut(name) {
            None => {
                self.static_values.insert(name.to_string(), value);
                StaticUpdate::Created
            }
            Some(current) if *current == value => StaticUpdate::Unchanged,
            Some(current) => {
                let previous = std::mem::replace(current, value);
                StaticUpdate::Updated { previous }
            }
        }
    }

    pub fn get_static(&self, name: &str) -> Option<&HeaderValue> {
        self.static_values.get(name)
    }

    pub fn append_non_static(&mut self, name: &str, value: HeaderValue) {
        self.non_static
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    pub fn non_static(&self, name: &str) -> &[HeaderValue] {
        self.non_static.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// When missing-header-key warnings are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MissingKeyReport {
    /// Collect silently and report while processing the last file of the run.
    #[default]
    LastFile,
    /// Report on the file where the key is first found missing.
    Immediate,
}

/// Everything the accumulator needs to know about one processed file.
#[derive(Debug, Clone, Copy)]
pub struct FileUpdate<'a> {
    pub nod: Nod,
    /// Composite header of the file.
    pub header: &'a Header,
    pub frames: &'a [Frame],
    pub classification: &'a Classification,
    /// Source path recorded in `FILES`.
    pub source: &'a str,
    /// File name used in diagnostics.
    pub file: &'a str,
}

/// Applies the attribute merge rules for every processed file.
#[derive(Debug, Clone)]
pub struct AttributeAccumulator {
    table: AttributeTable,
    check: bool,
    report: MissingKeyReport,
    pixscale: f64,
    pending: Vec<(StreamId, String, DiagnosticCode)>,
    reported: HashSet<(StreamId, String)>,
    empty_reported: HashSet<StreamId>,
}

impl AttributeAccumulator {
    pub fn new(
        table: AttributeTable,
        check: bool,
        report: MissingKeyReport,
        pixscale: f64,
    ) -> Self {
        Self {
            table,
            check,
            report,
            pixscale,
            pending: Vec::new(),
            reported: HashSet::new(),
            empty_reported: HashSet::new(),
        }
    }

    pub fn table(&self) -> &AttributeTable {
        &self.table
    }

    /// Apply static, non-static and extra attributes of one file to the two
    /// streams of its nod, then surface missing-key warnings per the policy.
    pub fn apply(
        &mut self,
        streams: &mut StreamSet,
        update: &FileUpdate<'_>,
        ctx: &mut RunContext,
        diags: &mut Diagnostics,
    ) {
        self.record_static_attributes(streams, update, diags);
        self.append_non_static_attributes(streams, update);
        self.record_extra(streams, update, ctx, diags);
        self.report_missing(streams, ctx.is_last_file(), diags);
    }

    /// Record every checked static attribute on both streams of the file's nod.
    pub fn record_static_attributes(
        &mut self,
        streams: &mut StreamSet,
        update: &FileUpdate<'_>,
        diags: &mut Diagnostics,
    ) {
        let checked: Vec<(String, String)> = self
            .table
            .checked(AttributeKind::Static, self.check)
            .map(|(n, k)| (n.to_string(), k.to_string()))
            .collect();

        for (name, key) in checked {
            match update.header.get(&key) {
                Some(value) => {
                    record_static_on(streams, update.nod, &name, &key, value, update.file, diags)
                }
                None => {
                    for chop in Chop::ALL {
                        self.mark_missing(
                            StreamId::new(update.nod, chop),
                            &name,
                            DiagnosticCode::StaticKeyMissing,
                        );
                    }
                }
            }
        }
    }

    /// Append one value per routed frame for every checked non-static attribute.
    ///
    /// A frame's own header wins over the composite header. If some routed frame
    /// has no value at all, the attribute is skipped for that stream and file.
    pub fn append_non_static_attributes(
        &mut self,
        streams: &mut StreamSet,
        update: &FileUpdate<'_>,
    ) {
        let checked: Vec<(String, String)> = self
            .table
            .checked(AttributeKind::NonStatic, self.check)
            .map(|(n, k)| (n.to_string(), k.to_string()))
            .collect();

        for chop in Chop::ALL {
            let id = StreamId::new(update.nod, chop);
            let positions = update.classification.positions(chop);
            if positions.is_empty() {
                continue;
            }

            for (name, key) in &checked {
                let values: Option<Vec<HeaderValue>> = positions
                    .iter()
                    .map(|&p| {
                        update
                            .frames
                            .get(p)
                            .and_then(|f| f.header.get(key))
                            .or_else(|| update.header.get(key))
                            .cloned()
                    })
                    .collect();

                match values {
                    Some(values) => {
                        let stream = streams.get_mut(id);
                        for value in values {
                            stream.attributes.append_non_static(name, value);
                        }
                    }
                    None => self.mark_missing(id, name, DiagnosticCode::NonStaticKeyMissing),
                }
            }
        }
    }

    /// Assign global indices to classified frames, record `FILES` and `PIXSCALE`.
    pub fn record_extra(
        &mut self,
        streams: &mut StreamSet,
        update: &FileUpdate<'_>,
        ctx: &mut RunContext,
        diags: &mut Diagnostics,
    ) {
        for (_, chop) in update.classification.acquisition_order() {
            let index = ctx.next_index();
            streams
                .get_mut(StreamId::new(update.nod, chop))
                .attributes
                .index
                .push(index);
        }

        for chop in Chop::ALL {
            streams
                .get_mut(StreamId::new(update.nod, chop))
                .attributes
                .files
                .push(update.source.to_string());
        }

        let pixscale = HeaderValue::Float(self.pixscale);
        record_static_on(streams, update.nod, PIXSCALE, PIXSCALE, &pixscale, update.file, diags);
    }

    /// Surface pending missing-key warnings, and empty streams on the last file.
    ///
    /// Each (stream, attribute) pair is reported at most once per run.
    pub fn report_missing(&mut self, streams: &StreamSet, is_last: bool, diags: &mut Diagnostics) {
        let due = match self.report {
            MissingKeyReport::Immediate => true,
            MissingKeyReport::LastFile => is_last,
        };

        if due {
            for (id, name, code) in std::mem::take(&mut self.pending) {
                if !self.reported.insert((id, name.clone())) {
                    continue;
                }
                let stream = streams.get(id);
                let key = self.header_key(&name).unwrap_or("?");
                diags.warn(
                    code,
                    format!(
                        "Attribute {} (={}) not found in the FITS header for output stream '{}'",
                        name,
                        key,
                        stream.name()
                    ),
                );
            }
        }

        if is_last {
            for stream in streams.iter() {
                if stream.frames_total() == 0 && self.empty_reported.insert(stream.id()) {
                    diags.warn(
                        DiagnosticCode::EmptyStream,
                        format!(
                            "The output stream '{}' is empty. There is no nod position {}. \
                             Add input files that contain both nod A and nod B.",
                            stream.name(),
                            stream.id().nod
                        ),
                    );
                }
            }
        }
    }

    fn mark_missing(&mut self, id: StreamId, name: &str, code: DiagnosticCode) {
        if self.reported.contains(&(id, name.to_string())) {
            return;
        }
        let already = self
            .pending
            .iter()
            .any(|(pid, pname, _)| *pid == id && pname == name);
        if !already {
            self.pending.push((id, name.to_string(), code));
        }
    }

    fn header_key(&self, name: &str) -> Option<&str> {
        self.table
            .specs()
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| match &s.source {
                AttributeSource::HeaderKey(k) => Some(k.as_str()),
                AttributeSource::NotApplicable => None,
            })
    }
}

/// Record a static value on both streams of `nod`, emitting at most one warning.
fn record_static_on(
    streams: &mut StreamSet,
    nod: Nod,
    name: &str,
    key: &str,
    value: &HeaderValue,
    file: &str,
    diags: &mut Diagnostics,
) {
    let mut changed: Vec<(String, HeaderValue)> = Vec::new();
    for chop in Chop::ALL {
        let stream = streams.get_mut(StreamId::new(nod, chop));
        if let StaticUpdate::Updated { previous } =
            stream.attributes.record_static(name, value.clone())
        {
            changed.push((stream.name().to_string(), previous));
        }
    }

    if let Some((_, previous)) = changed.first() {
        let names: Vec<&str> = changed.iter().map(|(n, _)| n.as_str()).collect();
        diags.warn(
            DiagnosticCode::StaticAttributeChanged,
            format!(
                "Static attribute {} ({}) has changed from {} to {}. Possibly the current \
                 file {} does not belong to the data set '{}'. Attribute value is updated.",
                name,
                key,
                previous.render(),
                value.render(),
                file,
                names.join("', '")
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify_frames, TrimPolicy};
    use crate::nod::NodScheme;
    use chopnod_config::default_attribute_table;
    use ndarray::Array2;
    use proptest::prelude::*;

    fn names() -> [String; 4] {
        ["aa", "ab", "ba", "bb"].map(String::from)
    }

    fn table() -> AttributeTable {
        let mut entries = BTreeMap::new();
        entries.insert(
            "INSTRUMENT".to_string(),
            AttributeEntry {
                kind: AttributeKind::Static,
                header: "INSTRUME".to_string(),
                required: true,
            },
        );
        entries.insert(
            "DIT".to_string(),
            AttributeEntry {
                kind: AttributeKind::Static,
                header: "ESO DET SEQ1 DIT".to_string(),
                required: false,
            },
        );
        entries.insert(
            "EXP_NO".to_string(),
            AttributeEntry {
                kind: AttributeKind::NonStatic,
                header: "ESO DET EXP NO".to_string(),
                required: true,
            },
        );
        entries.insert(
            "PUPIL".to_string(),
            AttributeEntry {
                kind: AttributeKind::NonStatic,
                header: "None".to_string(),
                required: true,
            },
        );
        AttributeTable::from_entries(&entries)
    }

    fn frames(tags: &[&str]) -> Vec<Frame> {
        tags.iter()
            .enumerate()
            .map(|(i, tag)| {
                let mut header = Header::new();
                header.set("ESO DET FRAM TYPE", *tag);
                header.set("ESO DET EXP NO", i as i64);
                Frame {
                    header,
                    image: Array2::from_elem((2, 2), 1.0),
                }
            })
            .collect()
    }

    struct Fixture {
        header: Header,
        frames: Vec<Frame>,
        classification: Classification,
    }

    fn fixture(instrument: &str, tags: &[&str]) -> Fixture {
        let mut header = Header::new();
        header.set("INSTRUME", instrument);
        let frames = frames(tags);
        let mut diags = Diagnostics::new();
        let classification =
            classify_frames(&frames, "f", TrimPolicy::WrittenCount, &mut diags).unwrap();
        Fixture {
            header,
            frames,
            classification,
        }
    }

    fn update<'a>(fx: &'a Fixture, nod: Nod) -> FileUpdate<'a> {
        FileUpdate {
            nod,
            header: &fx.header,
            frames: &fx.frames,
            classification: &fx.classification,
            source: "/data/f.fits",
            file: "f.fits",
        }
    }

    #[test]
    fn test_record_static_transitions() {
        let mut attrs = StreamAttributes::default();
        assert_eq!(attrs.record_static("DIT", 0.01.into()), StaticUpdate::Created);
        assert_eq!(attrs.record_static("DIT", 0.01.into()), StaticUpdate::Unchanged);
        assert_eq!(
            attrs.record_static("DIT", 0.02.into()),
            StaticUpdate::Updated {
                previous: HeaderValue::Float(0.01)
            }
        );
        assert_eq!(attrs.get_static("DIT"), Some(&HeaderValue::Float(0.02)));
    }

    #[test]
    fn test_checked_modes_skip_not_applicable() {
        let t = table();
        let strict: Vec<_> = t.checked(AttributeKind::Static, true).map(|(n, _)| n).collect();
        assert_eq!(strict, vec!["DIT", "INSTRUMENT"]);
        let lenient: Vec<_> = t.checked(AttributeKind::Static, false).map(|(n, _)| n).collect();
        assert_eq!(lenient, vec!["INSTRUMENT"]);
        let non_static: Vec<_> = t
            .checked(AttributeKind::NonStatic, true)
            .map(|(n, _)| n)
            .collect();
        assert_eq!(non_static, vec!["EXP_NO"]);
    }

    #[test]
    fn test_default_table_resolves() {
        let t = AttributeTable::from_entries(&default_attribute_table());
        let pupil = t.specs().iter().find(|s| s.name == "PUPIL").unwrap();
        assert_eq!(pupil.source, AttributeSource::NotApplicable);
    }

    #[test]
    fn test_static_change_warns_once_and_keeps_later_value() {
        let mut streams = StreamSet::new(names()).unwrap();
        let mut acc = AttributeAccumulator::new(table(), false, MissingKeyReport::Immediate, 0.045);
        let mut ctx = RunContext::new(NodScheme::Abba, 3);
        let mut diags = Diagnostics::new();

        let first = fixture("VISIR", &["HCYCLE1", "HCYCLE2"]);
        let same = fixture("VISIR", &["HCYCLE1", "HCYCLE2"]);
        let other = fixture("NACO", &["HCYCLE1", "HCYCLE2"]);

        acc.apply(&mut streams, &update(&first, Nod::A), &mut ctx, &mut diags);
        acc.apply(&mut streams, &update(&same, Nod::A), &mut ctx, &mut diags);
        assert_eq!(diags.count(DiagnosticCode::StaticAttributeChanged), 0);

        acc.apply(&mut streams, &update(&other, Nod::A), &mut ctx, &mut diags);
        assert_eq!(diags.count(DiagnosticCode::StaticAttributeChanged), 1);
        for chop in Chop::ALL {
            let stream = streams.get(StreamId::new(Nod::A, chop));
            assert_eq!(
                stream.attributes.get_static("INSTRUMENT"),
                Some(&HeaderValue::from("NACO"))
            );
        }
        // Nod B streams untouched
        assert!(streams
            .get(StreamId::new(Nod::B, Chop::A))
            .attributes
            .static_values
            .is_empty());
    }

    #[test]
    fn test_non_static_and_index_align_with_frames() {
        let mut streams = StreamSet::new(names()).unwrap();
        let mut acc = AttributeAccumulator::new(table(), true, MissingKeyReport::Immediate, 0.045);
        let mut ctx = RunContext::new(NodScheme::Abba, 1);
        let mut diags = Diagnostics::new();

        let fx = fixture("VISIR", &["HCYCLE1", "HCYCLE2", "HCYCLE1", "JUNK", "HCYCLE2"]);
        acc.apply(&mut streams, &update(&fx, Nod::B), &mut ctx, &mut diags);

        let ba = &streams.get(StreamId::new(Nod::B, Chop::A)).attributes;
        let bb = &streams.get(StreamId::new(Nod::B, Chop::B)).attributes;
        assert_eq!(ba.non_static("EXP_NO"), &[HeaderValue::Int(0), HeaderValue::Int(2)]);
        assert_eq!(bb.non_static("EXP_NO"), &[HeaderValue::Int(1), HeaderValue::Int(4)]);
        assert_eq!(ba.index, vec![0, 2]);
        assert_eq!(bb.index, vec![1, 3]);
        assert_eq!(ctx.frames_indexed(), 4);
        assert_eq!(ba.files, vec!["/data/f.fits".to_string()]);
        assert_eq!(ba.get_static(PIXSCALE), Some(&HeaderValue::Float(0.045)));
        assert!(ba.non_static("PUPIL").is_empty());
    }

    #[test]
    fn test_missing_static_key_reported_only_on_last_file() {
        let mut streams = StreamSet::new(names()).unwrap();
        let mut acc = AttributeAccumulator::new(table(), true, MissingKeyReport::LastFile, 0.045);
        let mut ctx = RunContext::new(NodScheme::Abba, 3);
        let mut diags = Diagnostics::new();
        let fx = fixture("VISIR", &["HCYCLE1", "HCYCLE2"]);

        for chop in Chop::ALL {
            let stack = fx.classification.stack(chop).clone();
            streams.get_mut(StreamId::new(Nod::A, chop)).append(stack).unwrap();
        }

        // DIT is never present in the fixture header.
        for seq in 0..2 {
            ctx.begin_file(seq);
            acc.apply(&mut streams, &update(&fx, Nod::A), &mut ctx, &mut diags);
        }
        assert_eq!(diags.count(DiagnosticCode::StaticKeyMissing), 0);

        ctx.begin_file(2);
        acc.apply(&mut streams, &update(&fx, Nod::A), &mut ctx, &mut diags);
        // One per nod A stream, never repeated.
        assert_eq!(diags.count(DiagnosticCode::StaticKeyMissing), 2);
        // Both nod B streams are empty.
        assert_eq!(diags.count(DiagnosticCode::EmptyStream), 2);

        acc.report_missing(&streams, true, &mut diags);
        assert_eq!(diags.count(DiagnosticCode::StaticKeyMissing), 2);
        assert_eq!(diags.count(DiagnosticCode::EmptyStream), 2);
    }

    #[test]
    fn test_missing_key_immediate_policy() {
        let mut streams = StreamSet::new(names()).unwrap();
        let mut acc = AttributeAccumulator::new(table(), true, MissingKeyReport::Immediate, 0.045);
        let mut ctx = RunContext::new(NodScheme::Abba, 5);
        let mut diags = Diagnostics::new();
        let fx = fixture("VISIR", &["HCYCLE1", "HCYCLE2"]);

        acc.apply(&mut streams, &update(&fx, Nod::A), &mut ctx, &mut diags);
        assert_eq!(diags.count(DiagnosticCode::StaticKeyMissing), 2);
        acc.apply(&mut streams, &update(&fx, Nod::A), &mut ctx, &mut diags);
        assert_eq!(diags.count(DiagnosticCode::StaticKeyMissing), 2);
        assert_eq!(diags.count(DiagnosticCode::EmptyStream), 0);
    }

    #[test]
    fn test_non_static_missing_key_skips_attribute() {
        let mut streams = StreamSet::new(names()).unwrap();
        let mut acc = AttributeAccumulator::new(table(), true, MissingKeyReport::Immediate, 0.045);
        let mut ctx = RunContext::new(NodScheme::Abba, 1);
        let mut diags = Diagnostics::new();

        let mut fx = fixture("VISIR", &["HCYCLE1", "HCYCLE2"]);
        for frame in &mut fx.frames {
            frame.header.remove("ESO DET EXP NO");
        }
        acc.apply(&mut streams, &update(&fx, Nod::A), &mut ctx, &mut diags);

        let aa = &streams.get(StreamId::new(Nod::A, Chop::A)).attributes;
        assert!(aa.non_static("EXP_NO").is_empty());
        assert_eq!(aa.index.len(), 1);
        assert_eq!(diags.count(DiagnosticCode::NonStaticKeyMissing), 2);
    }

    // Property: equal static values never warn; a sequence of values warns once
    // per change and always retains the latest value.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_static_changes_counted(values in prop::collection::vec(0i64..3, 1..12)) {
            let mut streams = StreamSet::new(names()).unwrap();
            let mut acc =
                AttributeAccumulator::new(table(), false, MissingKeyReport::Immediate, 0.045);
            let mut ctx = RunContext::new(NodScheme::Abba, values.len());
            let mut diags = Diagnostics::new();

            for (i, v) in values.iter().enumerate() {
                ctx.begin_file(i);
                let fx = fixture(&format!("INST{}", v), &["HCYCLE1", "HCYCLE2"]);
                acc.apply(&mut streams, &update(&fx, Nod::B), &mut ctx, &mut diags);
            }

            let changes = values.windows(2).filter(|w| w[0] != w[1]).count();
            prop_assert_eq!(diags.count(DiagnosticCode::StaticAttributeChanged), changes);
            let last = format!("INST{}", values[values.len() - 1]);
            prop_assert_eq!(
                streams.get(StreamId::new(Nod::B, Chop::B)).attributes.get_static("INSTRUMENT"),
                Some(&HeaderValue::Str(last))
            );
        }
    }
}
