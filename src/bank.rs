//! Input/output bank data model.
//!
//! Field names follow the on-disk JSON format (camelCase), so bank files written
//! by earlier tooling load unchanged.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_GROUP: &str = "default";

// =============================================================================
// FEATURE KINDS AND OUTPUTS
// =============================================================================

/// Closed set of output kinds a plugin can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureKind {
    Translation,
    Phonetics,
    Morphology,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::Translation => "TRANSLATION",
            FeatureKind::Phonetics => "PHONETICS",
            FeatureKind::Morphology => "MORPHOLOGY",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TRANSLATION output: a bare string or a detailed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TranslationOutput {
    Text(String),
    Detailed {
        #[serde(rename = "translatedText")]
        translated_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alternatives: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccentType {
    MultipleMeaning,
    MultipleVariant,
}

/// One word of a PHONETICS output. Unambiguous words are plain strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhoneticsPiece {
    Plain(String),
    Ambiguous {
        accented: String,
        #[serde(rename = "accentType")]
        accent_type: AccentType,
    },
}

/// Output of one feature for one input.
///
/// Serialized without a tag: the feature's `type` in the output bank already
/// names the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureOutput {
    Translation(TranslationOutput),
    Phonetics(Vec<PhoneticsPiece>),
    Morphology(Map<String, Value>),
}

impl FeatureOutput {
    pub fn text(value: impl Into<String>) -> Self {
        FeatureOutput::Translation(TranslationOutput::Text(value.into()))
    }

    pub fn kind(&self) -> FeatureKind {
        match self {
            FeatureOutput::Translation(_) => FeatureKind::Translation,
            FeatureOutput::Phonetics(_) => FeatureKind::Phonetics,
            FeatureOutput::Morphology(_) => FeatureKind::Morphology,
        }
    }
}

// =============================================================================
// INPUT BANK
// =============================================================================

/// One configured provider invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rpm: Option<u32>,
    pub options: Map<String, Value>,
}

impl FeatureConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            id: None,
            group: None,
            provider: provider.into(),
            max_rpm: None,
            options: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Trimmed group, or `"default"` when unset or blank.
    pub fn normalized_group(&self) -> &str {
        normalize_group(self.group.as_deref())
    }

    /// Explicit group as written by the author, if non-blank.
    pub fn explicit_group(&self) -> Option<&str> {
        self.group
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }
}

/// `KIND:group` key shared by features that compete for the same output slot.
pub fn collapse_group_key(kind: FeatureKind, normalized_group: &str) -> String {
    format!("{kind}:{normalized_group}")
}

pub fn normalize_group(group: Option<&str>) -> &str {
    match group.map(str::trim) {
        Some(g) if !g.is_empty() => g,
        _ => DEFAULT_GROUP,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputBank {
    pub schema_version: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub source_language: String,
    pub features: Vec<FeatureConfig>,
    pub data: Vec<String>,
}

// =============================================================================
// OUTPUT BANK
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputBankFeature {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FeatureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub provider: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputBankItemFeatureValue {
    pub output: FeatureOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputBankItem {
    pub input: String,
    pub features: BTreeMap<String, OutputBankItemFeatureValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputBank {
    pub schema_version: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub source_language: String,
    pub generated_at: String,
    pub features: Vec<OutputBankFeature>,
    pub data: Vec<OutputBankItem>,
}

// =============================================================================
// OUTPUT BANK VIEW
// =============================================================================

/// Read-side index over an [`OutputBank`], grouping features by kind and group.
pub struct OutputBankView<'a> {
    bank: &'a OutputBank,
    feature_by_id: HashMap<&'a str, &'a OutputBankFeature>,
    kinds: Vec<FeatureKind>,
    groups_by_kind: HashMap<FeatureKind, Vec<&'a str>>,
    features_by_key: HashMap<String, Vec<&'a OutputBankFeature>>,
}

impl<'a> OutputBankView<'a> {
    pub fn new(bank: &'a OutputBank) -> Self {
        let mut feature_by_id = HashMap::new();
        let mut kinds = Vec::new();
        let mut groups_by_kind: HashMap<FeatureKind, Vec<&'a str>> = HashMap::new();
        let mut features_by_key: HashMap<String, Vec<&'a OutputBankFeature>> = HashMap::new();

        for feature in &bank.features {
            feature_by_id.insert(feature.id.as_str(), feature);
            if !kinds.contains(&feature.kind) {
                kinds.push(feature.kind);
            }
            let group = normalize_group(feature.group.as_deref());
            let groups = groups_by_kind.entry(feature.kind).or_default();
            if !groups.contains(&group) {
                groups.push(group);
            }
            features_by_key
                .entry(collapse_group_key(feature.kind, group))
                .or_default()
                .push(feature);
        }

        Self {
            bank,
            feature_by_id,
            kinds,
            groups_by_kind,
            features_by_key,
        }
    }

    pub fn bank(&self) -> &'a OutputBank {
        self.bank
    }

    /// Kinds present in the bank, in first-seen order.
    pub fn feature_kinds(&self) -> &[FeatureKind] {
        &self.kinds
    }

    pub fn group_for_feature(&self, feature_id: &str) -> Option<&'a str> {
        self.feature_by_id
            .get(feature_id)
            .copied()
            .map(|f| normalize_group(f.group.as_deref()))
    }

    pub fn groups_for_kind(&self, kind: FeatureKind) -> &[&'a str] {
        self.groups_by_kind
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn features_for(&self, kind: FeatureKind, group: &str) -> &[&'a OutputBankFeature] {
        let key = collapse_group_key(kind, normalize_group(Some(group)));
        self.features_by_key
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The single output an item carries for a kind/group bucket.
    ///
    /// Returns `None` when the bucket has no output or more than one.
    pub fn resolve_output(
        &self,
        item: &'a OutputBankItem,
        kind: FeatureKind,
        group: &str,
    ) -> Option<(&'a OutputBankFeature, &'a FeatureOutput)> {
        let mut matches = self
            .features_for(kind, group)
            .iter()
            .filter_map(|feature| {
                item.features
                    .get(&feature.id)
                    .map(|value| (*feature, &value.output))
            });
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first)
    }
}
