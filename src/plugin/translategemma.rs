//! TRANSLATION provider backed by an Ollama `/api/generate` endpoint.

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{parse_options, OptionsError, Plugin, PluginCtx, PluginError};
use crate::bank::{FeatureKind, FeatureOutput, TranslationOutput};
use crate::gateway::{sha256_hex, ExternalCallRequest, TransportRequest};

pub const PROVIDER: &str = "translategemma";
pub const VERSION: &str = "0.1.0";

const DEFAULT_MODEL: &str = "translategemma:12b";
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
const GENERATE_OPERATION: &str = "ollama.generate";
const DEFAULT_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Compact,
    Full,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateGemmaOptions {
    /// Tag such as `lt-lt`.
    pub source_language: String,
    /// Tag such as `ru-ru`.
    pub target_language: String,
    /// Appended to the built-in translator prompt.
    #[serde(default)]
    pub extra_prompt: Option<String>,
    #[serde(default)]
    pub alternatives: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub output_mode: OutputMode,
}

#[derive(Debug, Clone)]
pub struct TranslateGemmaConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub item_concurrency: Option<usize>,
}

impl Default for TranslateGemmaConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            headers: BTreeMap::new(),
            item_concurrency: None,
        }
    }
}

impl TranslateGemmaConfig {
    /// Defaults overridden by `TRANSLATEGEMMA_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("TRANSLATEGEMMA_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(model) = std::env::var("TRANSLATEGEMMA_MODEL") {
            config.model = model;
        }
        if let Some(ms) = std::env::var("TRANSLATEGEMMA_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.timeout_ms = ms;
        }
        config.item_concurrency = std::env::var("TRANSLATEGEMMA_ITEM_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok());
        config
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct TranslateGemma {
    config: TranslateGemmaConfig,
}

impl TranslateGemma {
    pub fn new(config: TranslateGemmaConfig) -> Self {
        Self { config }
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Plugin for TranslateGemma {
    fn kind(&self) -> FeatureKind {
        FeatureKind::Translation
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
        let options: TranslateGemmaOptions = parse_options(options)?;
        resolve_language(&options.source_language, "sourceLanguage")?;
        resolve_language(&options.target_language, "targetLanguage")?;
        Ok(())
    }

    async fn run(
        &self,
        input: &str,
        options: &Map<String, Value>,
        ctx: &PluginCtx<'_>,
    ) -> Result<FeatureOutput, PluginError> {
        let options: TranslateGemmaOptions = parse_options(options)?;
        let prompt = render_prompt(
            &options.source_language,
            &options.target_language,
            input,
            options.extra_prompt.as_deref(),
        )?;

        let mut request = TransportRequest::json_post(
            self.generate_url(),
            json!({
                "model": self.config.model,
                "prompt": prompt,
                "stream": false,
                "options": { "temperature": options.temperature.unwrap_or(0.0) },
            }),
        )
        .with_header("Content-Type", "application/json")
        .with_timeout_ms(self.config.timeout_ms);
        for (name, value) in &self.config.headers {
            request = request.with_header(name, value);
        }

        let mut identity = Map::new();
        identity.insert("model".into(), json!(self.config.model));
        identity.insert("promptHash".into(), json!(sha256_hex(&prompt)));

        let body: GenerateResponse = ctx
            .call_external_as(
                ExternalCallRequest::new(GENERATE_OPERATION, input, request)
                    .with_identity("v1", identity),
            )
            .await?;

        let translated = body.response.trim();
        if translated.is_empty() {
            return Err(PluginError::failed("Ollama returned an empty translation"));
        }
        ctx.emit_progress(1);

        Ok(FeatureOutput::Translation(match options.output_mode {
            OutputMode::Compact => TranslationOutput::Text(translated.to_string()),
            OutputMode::Full => TranslationOutput::Detailed {
                translated_text: translated.to_string(),
                alternatives: Some(Vec::new()),
            },
        }))
    }
}

// =============================================================================
// PROMPT
// =============================================================================

pub fn render_prompt(
    source_tag: &str,
    target_tag: &str,
    input: &str,
    extra_prompt: Option<&str>,
) -> Result<String, OptionsError> {
    let source = resolve_language(source_tag, "sourceLanguage")?;
    let target = resolve_language(target_tag, "targetLanguage")?;
    let (src, src_code) = (escape_html(source.name), source.iso1);
    let (tgt, tgt_code) = (escape_html(target.name), target.iso1);
    let extra = escape_html(extra_prompt.unwrap_or(""));
    let input = escape_html(input);

    let prompt = format!(
        "\nYou are a professional {src} ({src_code}) to {tgt} ({tgt_code}) translator. \
Your goal is to accurately convey the meaning and nuances of the original {src} text \
while adhering to {tgt} grammar, vocabulary, and cultural sensitivities.\n\
{extra}\n\
Produce only the {tgt} translation, without any additional explanations or commentary. \
Please translate the following {src} text into {tgt}:\n\n\n\
{input}"
    );
    Ok(prompt.trim().to_string())
}

/// HTML-escape a template value. Prompt hashes of calls logged by the
/// Handlebars-based tooling depend on this exact character set.
pub fn escape_html(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'', '`', '=']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '`' => out.push_str("&#x60;"),
            '=' => out.push_str("&#x3D;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

// =============================================================================
// LANGUAGES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Language {
    pub iso1: &'static str,
    pub iso2: &'static str,
    pub name: &'static str,
}

const LANGUAGES: &[Language] = &[
    Language { iso1: "ar", iso2: "ara", name: "Arabic" },
    Language { iso1: "be", iso2: "bel", name: "Belarusian" },
    Language { iso1: "bg", iso2: "bul", name: "Bulgarian" },
    Language { iso1: "cs", iso2: "ces", name: "Czech" },
    Language { iso1: "da", iso2: "dan", name: "Danish" },
    Language { iso1: "de", iso2: "deu", name: "German" },
    Language { iso1: "el", iso2: "ell", name: "Greek" },
    Language { iso1: "en", iso2: "eng", name: "English" },
    Language { iso1: "es", iso2: "spa", name: "Spanish" },
    Language { iso1: "et", iso2: "est", name: "Estonian" },
    Language { iso1: "fi", iso2: "fin", name: "Finnish" },
    Language { iso1: "fr", iso2: "fra", name: "French" },
    Language { iso1: "he", iso2: "heb", name: "Hebrew" },
    Language { iso1: "hi", iso2: "hin", name: "Hindi" },
    Language { iso1: "hu", iso2: "hun", name: "Hungarian" },
    Language { iso1: "it", iso2: "ita", name: "Italian" },
    Language { iso1: "ja", iso2: "jpn", name: "Japanese" },
    Language { iso1: "ko", iso2: "kor", name: "Korean" },
    Language { iso1: "lt", iso2: "lit", name: "Lithuanian" },
    Language { iso1: "lv", iso2: "lav", name: "Latvian" },
    Language { iso1: "nl", iso2: "nld", name: "Dutch" },
    Language { iso1: "no", iso2: "nor", name: "Norwegian" },
    Language { iso1: "pl", iso2: "pol", name: "Polish" },
    Language { iso1: "pt", iso2: "por", name: "Portuguese" },
    Language { iso1: "ro", iso2: "ron", name: "Romanian" },
    Language { iso1: "ru", iso2: "rus", name: "Russian" },
    Language { iso1: "sk", iso2: "slk", name: "Slovak" },
    Language { iso1: "sv", iso2: "swe", name: "Swedish" },
    Language { iso1: "tr", iso2: "tur", name: "Turkish" },
    Language { iso1: "uk", iso2: "ukr", name: "Ukrainian" },
    Language { iso1: "zh", iso2: "zho", name: "Chinese" },
];

/// Resolve a tag like `lt`, `lit`, `lt-LT` or `lt_lt`.
pub fn resolve_language(tag: &str, field: &str) -> Result<Language, OptionsError> {
    let primary = tag
        .trim()
        .split(['-', '_'])
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|lang| lang.iso1 == primary || lang.iso2 == primary)
        .copied()
        .or_else(|| iso_language(&primary))
        .ok_or_else(|| OptionsError(format!("Unsupported {field} tag: {tag:?}")))
}

/// ISO 639 lookup for languages outside the table. Only languages with a
/// two-letter code qualify, since the prompt names both codes.
fn iso_language(code: &str) -> Option<Language> {
    let lang = match code.len() {
        2 => isolang::Language::from_639_1(code)?,
        3 => isolang::Language::from_639_3(code)?,
        _ => return None,
    };
    Some(Language {
        iso1: lang.to_639_1()?,
        iso2: lang.to_639_3(),
        name: lang.to_name(),
    })
}
