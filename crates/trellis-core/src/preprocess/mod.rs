//! Text rewrites applied to the YAML working text before expansion.
//!
//! Both passes are best-effort and never fail: they assume well-formed YAML
//! produced by the resolver's own emitter, and an unmatched construct simply
//! stays untouched.

use regex::Regex;

/// Compiled rewrite patterns for one delimiter pair.
pub struct Preprocessor {
    datatype_pattern: Regex,
    autoindent_pattern: Regex,
    additional_indentation: u32,
}

impl Preprocessor {
    pub fn new(start_delim: &str, stop_delim: &str, additional_indentation: u32) -> Self {
        let d1 = regex::escape(start_delim);
        let d2 = regex::escape(stop_delim);

        // Optional block-scalar header and quoting around an action that
        // pipes to toInt/toBool. The emitter quotes such actions, which would
        // force the expanded value back to a string.
        let datatype_pattern = Regex::new(&format!(
            r#":\s+(?:[|>]-?\s+)?(?:['"]?\s*)({d1}.*\|\s*(?:toInt|toBool).*{d2})(?:\s*['"]?)"#
        ))
        .expect("the datatype pattern compiles");

        // Leading spaces before an action piping to autoindent; the run
        // length dictates the rewritten indent width.
        let autoindent_pattern = Regex::new(&format!(
            r#"( *)(?:'|")?({d1}.*\| *autoindent *{d2})"#
        ))
        .expect("the autoindent pattern compiles");

        Self {
            datatype_pattern,
            autoindent_pattern,
            additional_indentation,
        }
    }

    /// Removes the quotes (and any block-scalar header) around actions that
    /// pipe to `toInt` or `toBool`, so the expanded scalar parses as its
    /// intended type instead of a string.
    pub fn strip_datatype_quotes(&self, text: &str) -> String {
        let stripped = self.datatype_pattern.replace_all(text, ": $1");
        tracing::trace!(?stripped, "stripped datatype quotes");

        stripped.into_owned()
    }

    /// Rewrites each `… | autoindent` action to `… | indent <n>`, where `n`
    /// is the action's leading-space run minus the configured additional
    /// indentation. A mistaken usage can drive `n` negative; the raw value is
    /// passed through and `indent` clamps it.
    pub fn rewrite_autoindent(&self, text: &str) -> String {
        let mut processed = text.to_string();

        for captures in self.autoindent_pattern.captures_iter(text) {
            let leading = captures.get(1).map_or(0, |m| m.as_str().len());
            let action = &captures[2];

            let width = leading as i64 - i64::from(self.additional_indentation);
            let rewritten = action.replacen("autoindent", &format!("indent {width}"), 1);
            processed = processed.replacen(action, &rewritten, 1);
        }

        processed
    }
}
