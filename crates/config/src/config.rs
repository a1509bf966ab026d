//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

/// Header key sentinel marking an attribute that does not apply to the instrument
pub const NOT_APPLICABLE: &str = "None";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CpuConfig {
    /// Number of logical cores used as the decompression worker budget (auto-detected if None)
    pub logical_cores: Option<u32>,
}

/// Instrument constants recorded alongside the demultiplexed streams
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentConfig {
    /// Pixel scale in arcsec per pixel, stored as the PIXSCALE attribute
    #[serde(default = "default_pixscale")]
    pub pixscale: f64,
}

fn default_pixscale() -> f64 {
    0.045
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            pixscale: default_pixscale(),
        }
    }
}

/// Whether an attribute is constant across a stream or recorded per frame
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AttributeKind {
    Static,
    NonStatic,
}

/// One row of the attribute table: where an attribute comes from and how it is kept
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributeEntry {
    pub kind: AttributeKind,
    /// FITS header key to read the value from, or `"None"` when not applicable
    pub header: String,
    /// Part of the always-required subset checked in lenient mode
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl AttributeEntry {
    fn new(kind: AttributeKind, header: &str, required: bool) -> Self {
        Self {
            kind,
            header: header.to_string(),
            required,
        }
    }

    /// The header key this attribute is read from, unless marked not applicable
    pub fn header_key(&self) -> Option<&str> {
        if self.header == NOT_APPLICABLE || self.header.is_empty() {
            None
        } else {
            Some(&self.header)
        }
    }
}

/// Built-in attribute table for the VISIR burst mode headers
pub fn default_attribute_table() -> BTreeMap<String, AttributeEntry> {
    use AttributeKind::{NonStatic, Static};

    let rows = [
        ("INSTRUMENT", Static, "INSTRUME", true),
        ("DIT", Static, "ESO DET SEQ1 DIT", true),
        ("LATITUDE", Static, "ESO TEL GEOLAT", true),
        ("LONGITUDE", Static, "ESO TEL GEOLON", true),
        ("NFRAMES", NonStatic, "NAXIS3", true),
        ("EXP_NO", NonStatic, "ESO DET EXP NO", true),
        ("NDIT", NonStatic, "ESO DET NDIT", true),
        ("DATE", NonStatic, "DATE-OBS", true),
        ("RA", NonStatic, "RA", true),
        ("DEC", NonStatic, "DEC", true),
        ("PARANG_START", NonStatic, "ESO ADA POSANG", false),
        ("PARANG_END", NonStatic, "ESO ADA POSANG END", false),
        ("DITHER_X", NonStatic, "ESO SEQ CUMOFFSETX", false),
        ("DITHER_Y", NonStatic, "ESO SEQ CUMOFFSETY", false),
        ("PUPIL", NonStatic, NOT_APPLICABLE, false),
    ];

    rows.into_iter()
        .map(|(name, kind, header, required)| {
            (name.to_string(), AttributeEntry::new(kind, header, required))
        })
        .collect()
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub instrument: InstrumentConfig,
    #[serde(default = "default_attribute_table")]
    pub attributes: BTreeMap<String, AttributeEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpu: CpuConfig::default(),
            instrument: InstrumentConfig::default(),
            attributes: default_attribute_table(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CPU_LOGICAL_CORES -> cpu.logical_cores
    /// - INSTRUMENT_PIXSCALE -> instrument.pixscale
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("CPU_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.cpu.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("INSTRUMENT_PIXSCALE") {
            if let Ok(scale) = val.parse::<f64>() {
                self.instrument.pixscale = scale;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Env var tests must not interleave
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        env::remove_var("CPU_LOGICAL_CORES");
        env::remove_var("INSTRUMENT_PIXSCALE");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            logical_cores in proptest::option::of(1u32..256),
            pixscale in 0.001f64..1.0,
            required in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[cpu]
{}

[instrument]
pixscale = {}

[attributes.EXPTIME]
kind = "static"
header = "EXPTIME"
required = {}
"#,
                logical_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default(),
                pixscale,
                required
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.cpu.logical_cores, logical_cores);
            prop_assert!((config.instrument.pixscale - pixscale).abs() < 1e-12);
            prop_assert_eq!(config.attributes.len(), 1);
            let entry = &config.attributes["EXPTIME"];
            prop_assert_eq!(entry.kind, AttributeKind::Static);
            prop_assert_eq!(entry.header_key(), Some("EXPTIME"));
            prop_assert_eq!(entry.required, required);
        }

        #[test]
        fn prop_env_overrides_cpu_logical_cores(
            initial_cores in proptest::option::of(1u32..128),
            override_cores in 1u32..256,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[cpu]
{}
"#,
                initial_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default()
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CPU_LOGICAL_CORES", override_cores.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.cpu.logical_cores, Some(override_cores));
        }

        #[test]
        fn prop_env_overrides_pixscale(
            initial in 0.001f64..1.0,
            overridden in 0.001f64..1.0,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[instrument]
pixscale = {}
"#,
                initial
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("INSTRUMENT_PIXSCALE", overridden.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert!((config.instrument.pixscale - overridden).abs() < 1e-12);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.cpu.logical_cores, None);
        assert!((config.instrument.pixscale - 0.045).abs() < 1e-12);
        assert_eq!(config.attributes, default_attribute_table());
    }

    #[test]
    fn test_invalid_env_value_is_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("CPU_LOGICAL_CORES", "many");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.cpu.logical_cores, None);
    }

    #[test]
    fn test_not_applicable_header_has_no_key() {
        let table = default_attribute_table();
        assert_eq!(table["PUPIL"].header_key(), None);
        assert_eq!(table["INSTRUMENT"].header_key(), Some("INSTRUME"));
        assert!(!table["DITHER_X"].required);
    }

    #[test]
    fn test_attribute_kind_rejects_unknown_literal() {
        let toml_str = r#"
[attributes.FOO]
kind = "sometimes"
header = "FOO"
"#;
        assert!(matches!(
            Config::parse_toml(toml_str),
            Err(ConfigError::Parse(_))
        ));
    }
}
