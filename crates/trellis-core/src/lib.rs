//! # Trellis Core
//!
//! Template resolution runtime for policy manifests in a multi-cluster
//! fleet.
//!
//! This crate contains:
//! - The resolver pipeline (JSON → YAML → preprocess → expand → JSON)
//! - The template function registry and builtin functions
//! - The action engine (delimited pipelines with a typed caller context)
//! - AES-CBC fragment protection and the concurrent decrypt pass
//! - The cluster state adapter contract
//!
//! This crate does NOT care about:
//! - How cluster state is fetched (implement [`ClusterState`])
//! - File I/O or multi-document dispatch
//! - Which documents are policies and which are plain manifests

pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod functions;
pub mod lookup;
pub mod preprocess;
pub mod resolver;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{
        ClusterScopedObjectId, ConfigError, EncryptionConfig, ResolverConfig,
    };
    pub use crate::crypto::ENCRYPTED_PREFIX;
    pub use crate::functions::{
        FunctionError, FunctionRegistry, TemplateFunction, TemplateValue,
    };
    pub use crate::lookup::{ClusterClaim, ClusterState, LookupError, ScopedClusterState};
    pub use crate::resolver::{has_template, uses_encryption, TemplateError, TemplateResolver};
}

// Re-export key types at crate root
pub use config::{ClusterScopedObjectId, ConfigError, EncryptionConfig, ResolverConfig};
pub use crypto::ENCRYPTED_PREFIX;
pub use functions::{FunctionError, FunctionRegistry, TemplateFunction, TemplateValue};
pub use lookup::{ClusterClaim, ClusterState, LookupError};
pub use resolver::{has_template, uses_encryption, TemplateError, TemplateResolver};
