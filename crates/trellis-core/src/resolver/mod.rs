//! The resolver: one entry point that takes a JSON policy document plus a
//! caller context and returns the document with every template action
//! replaced by its computed value.
//!
//! A resolve call is a fixed pipeline: context validation, registry
//! construction, JSON → YAML, the decrypt pass, the two text rewrites,
//! expansion, YAML → JSON. Every failure aborts the call; no partial
//! document is ever returned.

use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::config::{ConfigError, EncryptionConfig, ResolverConfig, DEFAULT_START_DELIM, DEFAULT_STOP_DELIM};
use crate::crypto::{self, CipherSettings, CryptoError, DecryptPassError, ENCRYPTED_PREFIX};
use crate::engine::{EvalError, ExpansionContext, ParseError, TemplateEngine};
use crate::functions::{builtin_registry, FunctionRegistry};
use crate::lookup::{ClusterState, ScopedClusterState};
use crate::preprocess::Preprocessor;

/// Resolution errors. Everything here is fatal to the resolve call.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("the input context must be a map with string values, {0}")]
    InvalidContext(String),

    #[error("failed to parse the template {input}: {source}")]
    Parse {
        input: String,
        #[source]
        source: ParseError,
    },

    #[error("failed to resolve the template {input}: {source}")]
    Resolve {
        input: String,
        #[source]
        source: EvalError,
    },

    #[error("failed to convert the policy manifest to YAML: {0}")]
    InputCodec(#[source] CodecError),

    #[error("failed to convert the resolved manifest back to JSON: {0}")]
    OutputCodec(#[source] CodecError),

    #[error(transparent)]
    Decrypt(#[from] DecryptPassError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Returns true when `text` contains the start delimiter (default `{{`), or,
/// when `check_for_encrypted` is set, the encrypted-fragment prefix. A cheap
/// pre-check before constructing a resolver.
pub fn has_template(text: &str, start_delim: Option<&str>, check_for_encrypted: bool) -> bool {
    let start = match start_delim {
        Some(delim) if !delim.is_empty() => delim,
        _ => DEFAULT_START_DELIM,
    };

    text.contains(start) || (check_for_encrypted && text.contains(ENCRYPTED_PREFIX))
}

/// Returns true when `text` contains an action that would produce or require
/// encrypted content: one beginning with `fromSecret` or ending in a pipe to
/// `protect`. This is a syntactic predicate, not a correctness check.
pub fn uses_encryption(text: &str, start_delim: Option<&str>, stop_delim: Option<&str>) -> bool {
    let start = match start_delim {
        Some(delim) if !delim.is_empty() => delim,
        _ => DEFAULT_START_DELIM,
    };
    let stop = match stop_delim {
        Some(delim) if !delim.is_empty() => delim,
        _ => DEFAULT_STOP_DELIM,
    };

    let d1 = regex::escape(start);
    let d2 = regex::escape(stop);
    let pattern = Regex::new(&format!(r#"{d1}(\s*fromSecret\s+.*|.*\|\s*protect\s*){d2}"#))
        .expect("the encryption predicate pattern compiles");

    pattern.is_match(text)
}

/// The API for processing templates. Use [`TemplateResolver::new`] so
/// configuration defaults and validation are applied.
pub struct TemplateResolver {
    state: Arc<dyn ClusterState>,
    config: ResolverConfig,
}

impl TemplateResolver {
    /// Validates `config` and builds a resolver reading through `state`.
    pub fn new(state: Arc<dyn ClusterState>, mut config: ResolverConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        config.apply_delimiter_defaults();

        tracing::debug!(
            start_delim = %config.start_delim,
            stop_delim = %config.stop_delim,
            "using the action delimiters"
        );

        Ok(Self { state, config })
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Validates `encryption` and adopts it atomically; on failure the
    /// previous configuration is preserved. Callers must not race this with
    /// in-flight resolves (the exclusive borrow enforces that in-process).
    pub fn set_encryption_config(&mut self, encryption: EncryptionConfig) -> Result<(), ConfigError> {
        encryption.validate()?;
        self.config.encryption = encryption;

        Ok(())
    }

    /// Resolves every template action in the JSON document `input` against
    /// the cluster state and the caller `context`, returning the resolved
    /// document as JSON bytes.
    ///
    /// `context` must be `None` or a JSON object whose values are all
    /// strings; its fields are available to actions by name, e.g.
    /// `{{ .ClusterName }}`.
    pub async fn resolve_template(
        &self,
        input: &[u8],
        context: Option<&Value>,
    ) -> Result<Vec<u8>, TemplateError> {
        let context = expansion_context(context)?;
        let cipher = CipherSettings::from_config(&self.config.encryption)?;
        let registry = self.build_registry(&cipher);

        let yaml = codec::json_to_yaml(input).map_err(TemplateError::InputCodec)?;
        tracing::trace!(%yaml, "working text before preprocessing");

        let mut working = yaml;

        if self.config.encryption.decryption_enabled {
            if let Some(cipher) = &cipher {
                working = crypto::decrypt_embedded(
                    cipher,
                    self.config.encryption.decryption_concurrency,
                    &working,
                )
                .await?;
            }
        }

        let preprocessor = Preprocessor::new(
            &self.config.start_delim,
            &self.config.stop_delim,
            self.config.additional_indentation,
        );

        if working.contains("toInt") || working.contains("toBool") {
            working = preprocessor.strip_datatype_quotes(&working);
        }

        if working.contains("autoindent") {
            working = preprocessor.rewrite_autoindent(&working);
        }

        let engine = TemplateEngine::new(&self.config.start_delim, &self.config.stop_delim);
        let template = engine
            .parse(&working, &registry)
            .map_err(|source| TemplateError::Parse {
                input: input_repr(input),
                source,
            })?;

        let expanded = template
            .expand(&registry, &context)
            .await
            .map_err(|source| TemplateError::Resolve {
                input: input_repr(input),
                source,
            })?;
        tracing::trace!(%expanded, "expanded working text");

        codec::yaml_to_json(&expanded).map_err(TemplateError::OutputCodec)
    }

    /// Builds the per-call function registry: the scoped state adapter, the
    /// encryption-mode function variants, and the disabled-function strip.
    fn build_registry(&self, cipher: &Option<CipherSettings>) -> FunctionRegistry {
        let scoped: Arc<dyn ClusterState> = Arc::new(ScopedClusterState::new(
            Arc::clone(&self.state),
            self.config.lookup_namespace.clone(),
            self.config.cluster_scoped_allow_list.clone(),
        ));

        let protect_cipher = if self.config.encryption.encryption_enabled {
            cipher.clone()
        } else {
            None
        };

        let mut registry =
            builtin_registry(scoped, protect_cipher, self.config.additional_indentation);

        for name in &self.config.disabled_functions {
            registry.remove(name);
        }

        registry
    }
}

fn input_repr(input: &[u8]) -> String {
    String::from_utf8_lossy(input).into_owned()
}

fn expansion_context(context: Option<&Value>) -> Result<ExpansionContext, TemplateError> {
    let mut expansion = ExpansionContext::new();

    match context {
        None | Some(Value::Null) => {}
        Some(Value::Object(fields)) => {
            for (name, value) in fields {
                match value {
                    Value::String(text) => expansion.set(name, text),
                    other => {
                        return Err(TemplateError::InvalidContext(format!(
                            "but field {name} is {}",
                            json_type_name(other)
                        )));
                    }
                }
            }
        }
        Some(other) => {
            return Err(TemplateError::InvalidContext(format!(
                "got {}",
                json_type_name(other)
            )));
        }
    }

    Ok(expansion)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
