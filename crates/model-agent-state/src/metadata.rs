//! Extracted model metadata and its conversion into the persisted config

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::entry::{Artifact, ModelConfig};

/// Framework or format descriptor: a name and optional version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamedVersion {
    /// Name, e.g. "transformers" or "safetensors"
    pub name: String,
    /// Version, if known
    pub version: Option<String>,
}

impl NamedVersion {
    /// Descriptor with a name and no version
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// Set the version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::from([("name".to_string(), self.name.clone())]);
        if let Some(version) = &self.version {
            map.insert("version".to_string(), version.clone());
        }
        map
    }
}

/// Weight quantization scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelQuantization {
    /// 8-bit floating point
    Fp8,
    /// FBGEMM 8-bit floating point
    FbgemmFp8,
    /// 4-bit integer
    Int4,
}

impl ModelQuantization {
    /// Wire name of the scheme
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fp8 => "fp8",
            Self::FbgemmFp8 => "fbgemm_fp8",
            Self::Int4 => "int4",
        }
    }
}

impl fmt::Display for ModelQuantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inference API a model can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelApiCapability {
    /// `/v1/chat/completions`
    OpenAiV1ChatCompletions,
    /// `/v1/responses`
    OpenAiV1Responses,
    /// `/v1/embeddings`
    OpenAiV1Embeddings,
    /// `/v1/images/generations`
    OpenAiV1ImagesGenerations,
    /// `/v1/images/edits`
    OpenAiV1ImagesEdits,
    /// `/v1/audio/speech`
    OpenAiV1AudioSpeech,
    /// `/v1/audio/transcriptions`
    OpenAiV1AudioTranscriptions,
    /// `/v1/audio/translations`
    OpenAiV1AudioTranslations,
    /// `/v1/realtime`
    OpenAiV1Realtime,
}

impl ModelApiCapability {
    /// Wire name of the capability
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAiV1ChatCompletions => "OPENAI_V1_CHAT_COMPLETIONS",
            Self::OpenAiV1Responses => "OPENAI_V1_RESPONSES",
            Self::OpenAiV1Embeddings => "OPENAI_V1_EMBEDDINGS",
            Self::OpenAiV1ImagesGenerations => "OPENAI_V1_IMAGES_GENERATIONS",
            Self::OpenAiV1ImagesEdits => "OPENAI_V1_IMAGES_EDITS",
            Self::OpenAiV1AudioSpeech => "OPENAI_V1_AUDIO_SPEECH",
            Self::OpenAiV1AudioTranscriptions => "OPENAI_V1_AUDIO_TRANSCRIPTIONS",
            Self::OpenAiV1AudioTranslations => "OPENAI_V1_AUDIO_TRANSLATIONS",
            Self::OpenAiV1Realtime => "OPENAI_V1_REALTIME",
        }
    }
}

impl fmt::Display for ModelApiCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata the extractor reads from a model's files
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelMetadata {
    /// Model family
    pub model_type: String,
    /// Architecture class name
    pub model_architecture: String,
    /// Framework the model was built with
    pub model_framework: Option<NamedVersion>,
    /// Weight format
    pub model_format: Option<NamedVersion>,
    /// Human-readable parameter count
    pub model_parameter_size: String,
    /// Context length, 0 when unknown
    pub max_tokens: i32,
    /// Task capabilities
    pub model_capabilities: Vec<String>,
    /// Inference APIs the model serves
    pub api_capabilities: Vec<ModelApiCapability>,
    /// Raw configuration file contents, parsed when no decoded form is given
    pub model_configuration: Vec<u8>,
    /// Already-parsed configuration file
    pub decoded_model_configuration: Option<Map<String, Value>>,
    /// Weight quantization, if any
    pub quantization: Option<ModelQuantization>,
    /// Artifact location; `None` and empty children are kept distinct
    pub artifact: Artifact,
}

/// Convert extracted metadata into the `config` block of an entry.
///
/// The result owns all of its data. Collections inside the artifact keep their
/// absent-versus-empty distinction.
pub fn convert_metadata_to_config(metadata: &ModelMetadata) -> ModelConfig {
    let model_format = metadata
        .model_format
        .as_ref()
        .filter(|format| !format.name.is_empty())
        .map(NamedVersion::to_map);

    let api_capabilities = (!metadata.api_capabilities.is_empty()).then(|| {
        metadata
            .api_capabilities
            .iter()
            .map(|capability| capability.as_str().to_string())
            .collect()
    });

    let decoded_model_configuration = metadata
        .decoded_model_configuration
        .clone()
        .or_else(|| parse_configuration(&metadata.model_configuration));

    let artifact = (!metadata.artifact.is_empty()).then(|| metadata.artifact.clone());

    ModelConfig {
        model_type: metadata.model_type.clone(),
        model_architecture: metadata.model_architecture.clone(),
        model_framework: metadata.model_framework.as_ref().map(NamedVersion::to_map),
        model_format,
        model_parameter_size: metadata.model_parameter_size.clone(),
        max_tokens: metadata.max_tokens,
        model_capabilities: (!metadata.model_capabilities.is_empty())
            .then(|| metadata.model_capabilities.clone()),
        api_capabilities,
        decoded_model_configuration,
        quantization: metadata
            .quantization
            .map(|q| q.as_str().to_string())
            .unwrap_or_default(),
        artifact,
        extra: BTreeMap::new(),
    }
}

fn parse_configuration(raw: &[u8]) -> Option<Map<String, Value>> {
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Map<String, Value>>(raw) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            tracing::debug!(error = %e, "Model configuration is not a JSON object, leaving it out");
            None
        }
    }
}
