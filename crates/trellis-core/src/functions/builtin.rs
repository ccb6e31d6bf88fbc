//! Builtin template functions.
//!
//! One struct per builtin, assembled into a registry by
//! [`builtin_registry`]. Lookup functions hold the (scoped) cluster state;
//! crypto-facing functions hold the validated cipher settings when
//! encryption is enabled.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::{FunctionError, FunctionRegistry, TemplateFunction, TemplateValue};
use crate::crypto::{self, CipherSettings};
use crate::lookup::ClusterState;

fn expect_arity(
    function: &'static str,
    args: &[TemplateValue],
    expected: usize,
) -> Result<(), FunctionError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(FunctionError::Arity {
            function,
            expected,
            got: args.len(),
        })
    }
}

fn string_arg(
    function: &'static str,
    args: &[TemplateValue],
    position: usize,
) -> Result<String, FunctionError> {
    match args.get(position) {
        Some(TemplateValue::String(value)) => Ok(value.clone()),
        _ => Err(FunctionError::ArgumentType {
            function,
            position,
            expected: "string",
        }),
    }
}

fn int_arg(
    function: &'static str,
    args: &[TemplateValue],
    position: usize,
) -> Result<i64, FunctionError> {
    match args.get(position) {
        Some(TemplateValue::Int(value)) => Ok(*value),
        _ => Err(FunctionError::ArgumentType {
            function,
            position,
            expected: "integer",
        }),
    }
}

/// `fromSecret <namespace> <name> <key>`: base64 of the raw secret value.
///
/// In encryption mode the output is additionally piped through `protect`, so
/// the resolved document carries ciphertext instead of the encoded secret.
pub struct FromSecret {
    state: Arc<dyn ClusterState>,
    cipher: Option<CipherSettings>,
}

impl FromSecret {
    pub fn new(state: Arc<dyn ClusterState>, cipher: Option<CipherSettings>) -> Self {
        Self { state, cipher }
    }
}

#[async_trait]
impl TemplateFunction for FromSecret {
    fn name(&self) -> &str {
        "fromSecret"
    }

    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        expect_arity("fromSecret", args, 3)?;
        let namespace = string_arg("fromSecret", args, 0)?;
        let name = string_arg("fromSecret", args, 1)?;
        let key = string_arg("fromSecret", args, 2)?;

        let data = self.state.secret(&namespace, &name).await?;
        let value = data.get(&key).ok_or_else(|| {
            FunctionError::Lookup(crate::lookup::LookupError::KeyNotFound(format!(
                "{key} in secret {namespace}/{name}"
            )))
        })?;

        let encoded = BASE64.encode(value);
        let output = match &self.cipher {
            Some(cipher) => crypto::protect(cipher, &encoded)?,
            None => encoded,
        };

        Ok(TemplateValue::String(output))
    }
}

/// `fromConfigMap <namespace> <name> <key>`: the config map value verbatim.
pub struct FromConfigMap {
    state: Arc<dyn ClusterState>,
}

impl FromConfigMap {
    pub fn new(state: Arc<dyn ClusterState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl TemplateFunction for FromConfigMap {
    fn name(&self) -> &str {
        "fromConfigMap"
    }

    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        expect_arity("fromConfigMap", args, 3)?;
        let namespace = string_arg("fromConfigMap", args, 0)?;
        let name = string_arg("fromConfigMap", args, 1)?;
        let key = string_arg("fromConfigMap", args, 2)?;

        let data = self.state.config_map(&namespace, &name).await?;
        let value = data.get(&key).ok_or_else(|| {
            FunctionError::Lookup(crate::lookup::LookupError::KeyNotFound(format!(
                "{key} in config map {namespace}/{name}"
            )))
        })?;

        Ok(TemplateValue::String(value.clone()))
    }
}

/// `fromClusterClaim <name>`: the claim's value.
pub struct FromClusterClaim {
    state: Arc<dyn ClusterState>,
}

impl FromClusterClaim {
    pub fn new(state: Arc<dyn ClusterState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl TemplateFunction for FromClusterClaim {
    fn name(&self) -> &str {
        "fromClusterClaim"
    }

    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        expect_arity("fromClusterClaim", args, 1)?;
        let name = string_arg("fromClusterClaim", args, 0)?;

        let claim = self.state.cluster_claim(&name).await?;

        Ok(TemplateValue::String(claim.value))
    }
}

/// `lookup <apiVersion> <kind> <namespace> <name>`: the live object as a
/// nested mapping. The generic escape hatch for everything without a
/// dedicated function.
pub struct Lookup {
    state: Arc<dyn ClusterState>,
}

impl Lookup {
    pub fn new(state: Arc<dyn ClusterState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl TemplateFunction for Lookup {
    fn name(&self) -> &str {
        "lookup"
    }

    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        expect_arity("lookup", args, 4)?;
        let api_version = string_arg("lookup", args, 0)?;
        let kind = string_arg("lookup", args, 1)?;
        let namespace = string_arg("lookup", args, 2)?;
        let name = string_arg("lookup", args, 3)?;

        let object = self
            .state
            .resource(&api_version, &kind, &namespace, &name)
            .await?;

        Ok(TemplateValue::Object(object))
    }
}

/// `base64enc`: standard base64 of the input string.
pub struct Base64Encode;

#[async_trait]
impl TemplateFunction for Base64Encode {
    fn name(&self) -> &str {
        "base64enc"
    }

    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        expect_arity("base64enc", args, 1)?;
        let value = string_arg("base64enc", args, 0)?;

        Ok(TemplateValue::String(BASE64.encode(value)))
    }
}

/// `base64dec`: decode standard base64 to a UTF-8 string.
pub struct Base64Decode;

#[async_trait]
impl TemplateFunction for Base64Decode {
    fn name(&self) -> &str {
        "base64dec"
    }

    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        expect_arity("base64dec", args, 1)?;
        let value = string_arg("base64dec", args, 0)?;

        let decoded = BASE64
            .decode(&value)
            .map_err(|err| FunctionError::InvalidBase64(err.to_string()))?;
        let text = String::from_utf8(decoded)
            .map_err(|err| FunctionError::InvalidBase64(err.to_string()))?;

        Ok(TemplateValue::String(text))
    }
}

/// `indent <n> <value>`: prefix a newline and pad every line with
/// `n + additional_indentation` spaces, then trim the surrounding
/// whitespace. Zero and negative widths clamp to no padding, which keeps the
/// rewritten `autoindent` placeholders safe.
pub struct Indent {
    additional_indentation: u32,
}

impl Indent {
    pub fn new(additional_indentation: u32) -> Self {
        Self {
            additional_indentation,
        }
    }
}

#[async_trait]
impl TemplateFunction for Indent {
    fn name(&self) -> &str {
        "indent"
    }

    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        expect_arity("indent", args, 2)?;
        let spaces = int_arg("indent", args, 0)?;
        let value = string_arg("indent", args, 1)?;

        let width = (spaces + i64::from(self.additional_indentation)).max(0) as usize;
        let pad = " ".repeat(width);
        let padded = format!("\n{pad}{}", value.replace('\n', &format!("\n{pad}")));

        Ok(TemplateValue::String(padded.trim().to_string()))
    }
}

/// `autoindent`: a placeholder so the parser accepts the name. The
/// preprocessor rewrites every occurrence to `indent <n>` before expansion;
/// reaching this at execution means the rewrite missed a case.
pub struct Autoindent;

#[async_trait]
impl TemplateFunction for Autoindent {
    fn name(&self) -> &str {
        "autoindent"
    }

    async fn call(&self, _args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        Err(FunctionError::UnexpectedAutoindent)
    }
}

/// `atoi`: parse a string to an integer; unparsable input yields 0.
pub struct Atoi;

#[async_trait]
impl TemplateFunction for Atoi {
    fn name(&self) -> &str {
        "atoi"
    }

    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        expect_arity("atoi", args, 1)?;
        let value = string_arg("atoi", args, 0)?;

        Ok(TemplateValue::Int(parse_int_or_zero(&value)))
    }
}

/// `toInt`: coerce any scalar to an integer; unparsable input yields 0.
pub struct ToInt;

#[async_trait]
impl TemplateFunction for ToInt {
    fn name(&self) -> &str {
        "toInt"
    }

    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        expect_arity("toInt", args, 1)?;

        let value = match &args[0] {
            TemplateValue::Int(value) => *value,
            TemplateValue::Bool(value) => i64::from(*value),
            TemplateValue::String(value) => parse_int_or_zero(value),
            TemplateValue::Object(_) => 0,
        };

        Ok(TemplateValue::Int(value))
    }
}

fn parse_int_or_zero(value: &str) -> i64 {
    value.trim().parse::<i64>().unwrap_or_else(|_| {
        tracing::debug!(value, "coercing an unparsable integer to 0");
        0
    })
}

/// `toBool`: permissive boolean parsing: `1`, `t`, `T`, `TRUE`, `true` and
/// `True` are true; everything else is false.
pub struct ToBool;

#[async_trait]
impl TemplateFunction for ToBool {
    fn name(&self) -> &str {
        "toBool"
    }

    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        expect_arity("toBool", args, 1)?;

        let value = match &args[0] {
            TemplateValue::Bool(value) => *value,
            TemplateValue::String(value) => {
                matches!(value.as_str(), "1" | "t" | "T" | "TRUE" | "true" | "True")
            }
            TemplateValue::Int(value) => *value == 1,
            TemplateValue::Object(_) => false,
        };

        Ok(TemplateValue::Bool(value))
    }
}

/// `protect`: encrypt the input into the wire format. Only available with
/// encryption enabled; otherwise the registered stub fails with a readable
/// error.
pub struct Protect {
    cipher: Option<CipherSettings>,
}

impl Protect {
    pub fn new(cipher: Option<CipherSettings>) -> Self {
        Self { cipher }
    }
}

#[async_trait]
impl TemplateFunction for Protect {
    fn name(&self) -> &str {
        "protect"
    }

    async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or(FunctionError::ProtectNotEnabled)?;

        expect_arity("protect", args, 1)?;
        let value = string_arg("protect", args, 0)?;

        Ok(TemplateValue::String(crypto::protect(cipher, &value)?))
    }
}

/// Builds the full builtin registry for one resolve call.
///
/// `protect_cipher` is set only when encryption is enabled: it switches
/// `fromSecret` to its protected variant and arms `protect` itself.
pub fn builtin_registry(
    state: Arc<dyn ClusterState>,
    protect_cipher: Option<CipherSettings>,
    additional_indentation: u32,
) -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();

    registry.register(Arc::new(FromSecret::new(
        Arc::clone(&state),
        protect_cipher.clone(),
    )));
    registry.register(Arc::new(FromConfigMap::new(Arc::clone(&state))));
    registry.register(Arc::new(FromClusterClaim::new(Arc::clone(&state))));
    registry.register(Arc::new(Lookup::new(state)));
    registry.register(Arc::new(Base64Encode));
    registry.register(Arc::new(Base64Decode));
    registry.register(Arc::new(Indent::new(additional_indentation)));
    registry.register(Arc::new(Autoindent));
    registry.register(Arc::new(Atoi));
    registry.register(Arc::new(ToInt));
    registry.register(Arc::new(ToBool));
    registry.register(Arc::new(Protect::new(protect_cipher)));

    registry
}
