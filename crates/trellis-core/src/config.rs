//! Resolver and encryption configuration.
//!
//! Configuration is validated up front (`TemplateResolver::new`) and again on
//! every `set_encryption_config` call, so a resolve call can assume the
//! delimiters and crypto parameters it reads are well formed.

use serde::Deserialize;
use thiserror::Error;

/// Default action start delimiter.
pub const DEFAULT_START_DELIM: &str = "{{";
/// Default action stop delimiter.
pub const DEFAULT_STOP_DELIM: &str = "}}";

/// AES-CBC uses a 128 bit block no matter the key size; the initialization
/// vector must match the block size.
pub const IV_SIZE: usize = 16;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the start and stop delimiters cannot be set independently")]
    DelimiterMismatch,

    #[error("an AES key must be set to use this encryption mode")]
    AesKeyNotSet,

    #[error("the AES key is invalid: unsupported key length {0}")]
    InvalidAesKey(usize),

    #[error("an initialization vector must be set to use this encryption mode")]
    IvNotSet,

    #[error("the initialization vector must be 128 bits")]
    InvalidIv,
}

/// Identifies one cluster-scoped object that lookups may read even when a
/// namespace restriction is in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClusterScopedObjectId {
    /// API version of the object, e.g. `cluster.example.io/v1`. Empty matches
    /// any version.
    pub api_version: String,
    pub kind: String,
    /// Object name. `*` matches any name of the kind.
    pub name: String,
}

impl ClusterScopedObjectId {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Configuration for fragment encryption and the decrypt pass.
///
/// The initialization vector must be random but does not need to be private;
/// it makes equal plaintexts encrypt to distinct ciphertexts across
/// documents. All fragments in one document share the configured IV, so equal
/// plaintexts inside a single document encrypt identically.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// AES key (16, 24, or 32 bytes) for `protect` and the decrypt pass.
    pub aes_key: Option<Vec<u8>>,
    /// Key to retry decryption with when `aes_key` fails. Supports key
    /// rotation over documents encrypted with a prior key.
    pub aes_key_fallback: Option<Vec<u8>>,
    /// Initialization vector, exactly [`IV_SIZE`] bytes.
    pub initialization_vector: Option<Vec<u8>>,
    /// Worker cap for the decrypt pass. 0 and 1 both mean sequential.
    pub decryption_concurrency: u8,
    /// Enables the decrypt pass over embedded ciphertext fragments.
    pub decryption_enabled: bool,
    /// Enables the `protect` function and the protected `fromSecret` variant.
    pub encryption_enabled: bool,
}

impl EncryptionConfig {
    /// Checks that the key material is usable whenever either encryption or
    /// decryption is enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.encryption_enabled && !self.decryption_enabled {
            return Ok(());
        }

        let key = self.aes_key.as_ref().ok_or(ConfigError::AesKeyNotSet)?;
        validate_aes_key(key)?;

        if let Some(fallback) = &self.aes_key_fallback {
            validate_aes_key(fallback)?;
        }

        let iv = self
            .initialization_vector
            .as_ref()
            .ok_or(ConfigError::IvNotSet)?;
        if iv.len() != IV_SIZE {
            return Err(ConfigError::InvalidIv);
        }

        Ok(())
    }
}

fn validate_aes_key(key: &[u8]) -> Result<(), ConfigError> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        other => Err(ConfigError::InvalidAesKey(other)),
    }
}

/// Configuration for a [`TemplateResolver`](crate::resolver::TemplateResolver).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Action start delimiter. Empty means the default `{{`. Must be set
    /// together with `stop_delim` or not at all.
    pub start_delim: String,
    /// Action stop delimiter. Empty means the default `}}`.
    pub stop_delim: String,
    /// Spaces added to every `indent`/`autoindent` result. Useful when the
    /// templated block sits below a logical starting point in the document.
    pub additional_indentation: u32,
    /// Function names removed from the registry before binding. Invoking a
    /// disabled name fails at parse time.
    pub disabled_functions: Vec<String>,
    /// When set, lookups naming any other namespace fail.
    pub lookup_namespace: Option<String>,
    /// When non-empty, cluster-scoped lookups outside this list fail.
    pub cluster_scoped_allow_list: Vec<ClusterScopedObjectId>,
    pub encryption: EncryptionConfig,
}

impl ResolverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a custom delimiter pair, e.g. `{{hub` / `hub}}`.
    pub fn with_delimiters(
        mut self,
        start_delim: impl Into<String>,
        stop_delim: impl Into<String>,
    ) -> Self {
        self.start_delim = start_delim.into();
        self.stop_delim = stop_delim.into();
        self
    }

    pub fn with_additional_indentation(mut self, spaces: u32) -> Self {
        self.additional_indentation = spaces;
        self
    }

    pub fn with_disabled_functions(mut self, names: Vec<String>) -> Self {
        self.disabled_functions = names;
        self
    }

    pub fn with_lookup_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.lookup_namespace = Some(namespace.into());
        self
    }

    pub fn with_cluster_scoped_allow_list(mut self, allowed: Vec<ClusterScopedObjectId>) -> Self {
        self.cluster_scoped_allow_list = allowed;
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = encryption;
        self
    }

    /// Validates the delimiter pair and the embedded encryption config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_delim.is_empty() != self.stop_delim.is_empty() {
            return Err(ConfigError::DelimiterMismatch);
        }

        self.encryption.validate()
    }

    /// Fills in the default delimiter pair when none was configured. Only
    /// `start_delim` needs checking since the pair is validated together.
    pub(crate) fn apply_delimiter_defaults(&mut self) {
        if self.start_delim.is_empty() {
            self.start_delim = DEFAULT_START_DELIM.to_string();
            self.stop_delim = DEFAULT_STOP_DELIM.to_string();
        }
    }
}
