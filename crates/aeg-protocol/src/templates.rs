//! Protocol template catalog: the runtime (compiled) form of
//! [`acq_common::ProtocolTemplateConfig`], plus the built-in scale dialects
//! shipped with the engine.

use acq_common::ProtocolTemplateConfig;
use once_cell::sync::Lazy;
use regex::Regex;

/// A compiled protocol template, ready for use by discovery and decoding.
#[derive(Debug, Clone)]
pub struct ProtocolTemplate {
    /// Catalog identifier.
    pub id: String,
    /// Commands tried in order, each sent as raw bytes.
    pub commands: Vec<Vec<u8>>,
    /// Patterns a response is checked against to validate the template (any one match counts).
    pub response_patterns: Vec<Regex>,
    /// Pattern extracting the weight value from a response; first capture group is the number.
    pub weight_pattern: Regex,
    /// Default engineering unit if the pattern has no named unit group.
    pub unit: String,
    /// Substring marking a response as stable (motionless).
    pub stable_marker: Option<String>,
    /// Substrings marking a response as in motion.
    pub motion_markers: Vec<String>,
}

/// A template configuration failed to compile, usually a bad regex.
#[derive(Debug, thiserror::Error)]
#[error("protocol template {id} invalid: {message}")]
pub struct TemplateCompileError {
    /// The offending template's id.
    pub id: String,
    /// What went wrong.
    pub message: String,
}

impl TryFrom<&ProtocolTemplateConfig> for ProtocolTemplate {
    type Error = TemplateCompileError;

    fn try_from(cfg: &ProtocolTemplateConfig) -> Result<Self, Self::Error> {
        let compile = |pattern: &str| -> Result<Regex, TemplateCompileError> {
            Regex::new(pattern).map_err(|e| TemplateCompileError {
                id: cfg.id.clone(),
                message: e.to_string(),
            })
        };

        let response_patterns = cfg
            .response_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let weight_pattern = compile(&cfg.weight_pattern)?;

        Ok(Self {
            id: cfg.id.clone(),
            commands: cfg.commands.iter().map(|c| c.as_bytes().to_vec()).collect(),
            response_patterns,
            weight_pattern,
            unit: cfg.unit.clone(),
            stable_marker: cfg.stable_marker.clone(),
            motion_markers: cfg.motion_markers.clone(),
        })
    }
}

/// The Mettler-Toledo-style continuous-output template: `SI\r\n` polls for
/// one immediate reading, replies of the form `S S  +12.345 kg` (stable) or
/// `S D  +12.345 kg` (in motion).
static MT_CONTINUOUS: Lazy<ProtocolTemplate> = Lazy::new(|| ProtocolTemplate {
    id: "mettler_toledo_continuous".to_string(),
    commands: vec![b"SI\r\n".to_vec()],
    response_patterns: vec![Regex::new(r"(?i)^S\s+[SD]\s").expect("valid built-in regex")],
    weight_pattern: Regex::new(r"(?i)S\s+(?:S|D)\s+([+-]?\d+\.\d+)\s*(kg|lb|g)")
        .expect("valid built-in regex"),
    unit: "kg".to_string(),
    stable_marker: Some("S".to_string()),
    motion_markers: vec!["D".to_string()],
});

/// A generic fallback: matches any line carrying a signed decimal followed
/// by a recognized unit token. Tried only after every specific template has
/// failed to validate.
static GENERIC_FALLBACK: Lazy<ProtocolTemplate> = Lazy::new(|| ProtocolTemplate {
    id: "generic_decimal_weight".to_string(),
    commands: vec![b"\r\n".to_vec()],
    response_patterns: vec![
        Regex::new(r"(?i)[+-]?\d+\.\d+\s*(kg|lb|g)").expect("valid built-in regex"),
    ],
    weight_pattern: Regex::new(r"(?i)([+-]?\d+\.\d+)\s*(kg|lb|g)").expect("valid built-in regex"),
    unit: "kg".to_string(),
    stable_marker: None,
    motion_markers: Vec::new(),
});

/// Built-in templates, in the order discovery should try them: specific
/// dialects first, generic fallback last.
#[must_use]
pub fn builtin_templates() -> Vec<ProtocolTemplate> {
    vec![MT_CONTINUOUS.clone(), GENERIC_FALLBACK.clone()]
}

/// Compile the full discovery catalog: specific built-in dialects, then
/// `configs` (user-added templates, tried in configured order), with the
/// generic fallback always tried last regardless of where it appears in
/// the built-ins.
pub fn compile_catalog(
    configs: &[ProtocolTemplateConfig],
) -> Result<Vec<ProtocolTemplate>, TemplateCompileError> {
    let mut catalog = vec![MT_CONTINUOUS.clone()];
    for cfg in configs {
        catalog.push(ProtocolTemplate::try_from(cfg)?);
    }
    catalog.push(GENERIC_FALLBACK.clone());
    Ok(catalog)
}
