//! PHONETICS provider backed by the VDU accent-lookup service.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{parse_options, OptionsError, Plugin, PluginCtx, PluginError};
use crate::bank::{AccentType, FeatureKind, FeatureOutput, PhoneticsPiece};
use crate::gateway::{ExternalCallRequest, TransportRequest};

pub const PROVIDER: &str = "vdu_kirciuoklis";
pub const VERSION: &str = "0.3.1";

const DEFAULT_ENDPOINT: &str = "https://kalbu.vdu.lt/ajax-call";
const DEFAULT_NONCE: &str = "880129de2d";
const TEXT_ACCENTS_OPERATION: &str = "vdu_kirciuoklis.text_accents";
const TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccentMode {
    Text,
    Auto,
    Word,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VduKirciuoklisOptions {
    #[serde(default)]
    pub mode: Option<AccentMode>,
}

#[derive(Debug, Clone)]
pub struct VduKirciuoklisConfig {
    pub endpoint: String,
    pub nonce: String,
    pub item_concurrency: Option<usize>,
}

impl Default for VduKirciuoklisConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            nonce: DEFAULT_NONCE.to_string(),
            item_concurrency: None,
        }
    }
}

impl VduKirciuoklisConfig {
    /// Defaults overridden by `VDU_KIRCIUOKLIS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = std::env::var("VDU_KIRCIUOKLIS_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(nonce) = std::env::var("VDU_KIRCIUOKLIS_NONCE") {
            config.nonce = nonce;
        }
        config.item_concurrency = std::env::var("VDU_KIRCIUOKLIS_ITEM_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok());
        config
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Deserialize)]
struct ApiResponse {
    code: i64,
    /// JSON-encoded payload, or `false` on failure.
    message: Value,
}

#[derive(Deserialize)]
struct RawTextAccents {
    #[serde(rename = "textParts")]
    text_parts: Vec<RawTextPart>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum RawTextPart {
    Word {
        accented: String,
        #[serde(rename = "accentType")]
        accent_type: RawAccentType,
    },
    Separator {
        #[allow(dead_code)]
        string: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RawAccentType {
    One,
    MultipleMeaning,
    MultipleVariant,
}

pub struct VduKirciuoklis {
    config: VduKirciuoklisConfig,
}

impl VduKirciuoklis {
    pub fn new(config: VduKirciuoklisConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Plugin for VduKirciuoklis {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Phonetics
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn item_concurrency(&self) -> Option<usize> {
        self.config.item_concurrency
    }

    fn validate_options(&self, options: &Map<String, Value>) -> Result<(), OptionsError> {
        parse_options::<VduKirciuoklisOptions>(options).map(|_| ())
    }

    async fn run(
        &self,
        input: &str,
        _options: &Map<String, Value>,
        ctx: &PluginCtx<'_>,
    ) -> Result<FeatureOutput, PluginError> {
        let mut form = BTreeMap::new();
        form.insert("action".to_string(), "text_accents".to_string());
        form.insert("nonce".to_string(), self.config.nonce.clone());
        form.insert("body".to_string(), input.to_string());

        let mut identity = Map::new();
        identity.insert("input".into(), json!(input));

        let response: ApiResponse = ctx
            .call_external_as(
                ExternalCallRequest::new(
                    TEXT_ACCENTS_OPERATION,
                    input,
                    TransportRequest::form_post(&self.config.endpoint, form)
                        .with_timeout_ms(TIMEOUT_MS),
                )
                .with_identity("v1", identity),
            )
            .await?;

        let pieces = normalize_response(response)?;
        if pieces.is_empty() {
            return Err(PluginError::NoResult);
        }
        Ok(FeatureOutput::Phonetics(pieces))
    }
}

fn normalize_response(response: ApiResponse) -> Result<Vec<PhoneticsPiece>, PluginError> {
    let message = match (&response.message, response.code) {
        (Value::String(message), 200) => message,
        _ => {
            return Err(PluginError::failed(format!(
                "VDU API error ({})",
                response.code
            )))
        }
    };

    let raw: RawTextAccents = serde_json::from_str(message)
        .map_err(|e| PluginError::failed(format!("VDU API error: {e}")))?;

    let mut pieces = Vec::new();
    for part in raw.text_parts {
        let (accented, accent_type) = match part {
            RawTextPart::Separator { .. } => continue,
            RawTextPart::Word {
                accented,
                accent_type,
            } => (accented, accent_type),
        };
        if accented.is_empty() {
            return Err(PluginError::failed(
                "VDU API error: word.accented must be a non-empty string",
            ));
        }
        pieces.push(match accent_type {
            RawAccentType::One => PhoneticsPiece::Plain(accented),
            RawAccentType::MultipleMeaning => PhoneticsPiece::Ambiguous {
                accented,
                accent_type: AccentType::MultipleMeaning,
            },
            RawAccentType::MultipleVariant => PhoneticsPiece::Ambiguous {
                accented,
                accent_type: AccentType::MultipleVariant,
            },
        });
    }
    Ok(pieces)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(code: i64, message: Value) -> ApiResponse {
        ApiResponse { code, message }
    }

    #[test]
    fn normalizes_words_and_drops_separators() {
        let message = json!({
            "textParts": [
                {"string": "Labas", "accented": "Lãbas", "accentType": "ONE", "type": "WORD"},
                {"string": " ", "type": "SEPARATOR"},
                {"string": "kasa", "accented": "kasà", "accentType": "MULTIPLE_MEANING", "type": "WORD"}
            ]
        })
        .to_string();
        let pieces = normalize_response(response(200, Value::String(message))).unwrap();
        assert_eq!(
            pieces,
            vec![
                PhoneticsPiece::Plain("Lãbas".into()),
                PhoneticsPiece::Ambiguous {
                    accented: "kasà".into(),
                    accent_type: AccentType::MultipleMeaning,
                },
            ]
        );
    }

    #[test]
    fn rejects_failed_and_malformed_payloads() {
        let err = normalize_response(response(500, Value::Bool(false))).unwrap_err();
        assert_eq!(err.to_string(), "VDU API error (500)");

        let bad_type = json!({"textParts": [{"string": "?", "type": "EMOJI"}]}).to_string();
        assert!(normalize_response(response(200, Value::String(bad_type))).is_err());

        let empty_word = json!({
            "textParts": [{"string": "a", "accented": "", "accentType": "ONE", "type": "WORD"}]
        })
        .to_string();
        assert!(normalize_response(response(200, Value::String(empty_word))).is_err());
    }

    #[test]
    fn options_reject_unknown_fields() {
        let plugin = VduKirciuoklis::new(VduKirciuoklisConfig::default());
        let mut options = Map::new();
        options.insert("mode".into(), json!("word"));
        assert!(plugin.validate_options(&options).is_ok());
        options.insert("extra".into(), json!(true));
        assert!(plugin.validate_options(&options).is_err());
    }
}
