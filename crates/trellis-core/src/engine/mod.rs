//! The action engine: a single-pass expander for delimited template actions.
//!
//! A source text is parsed into literal text segments and actions. Each
//! action is a pipeline: a leading value piped through zero or more function
//! calls, evaluated left to right against the caller context. Undefined
//! function names are rejected at parse time; expansion errors discard the
//! partial output and abort the call.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::functions::{FunctionError, FunctionRegistry, TemplateValue};

/// A parse failure, reported against the line the action starts on.
#[derive(Debug, Clone, Error)]
#[error("template: tmpl:{line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// An expansion failure.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("can't evaluate field {0} in the template context")]
    UndefinedField(String),

    #[error("function {0} is not registered")]
    UndefinedFunction(String),

    #[error("error calling {function}: {source}")]
    Function {
        function: String,
        #[source]
        source: FunctionError,
    },
}

/// Named string fields exposed to actions as `.FieldName`.
#[derive(Debug, Clone, Default)]
pub struct ExpansionContext {
    fields: BTreeMap<String, String>,
}

impl ExpansionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Str(String),
    Int(i64),
    Bool(bool),
    Field(String),
    Call { name: String, args: Vec<Expr> },
    Sub(Box<Pipeline>),
}

#[derive(Debug, Clone)]
struct Pipeline {
    first: Expr,
    rest: Vec<Expr>,
}

#[derive(Debug)]
enum Segment {
    Text(String),
    Action(Pipeline),
}

/// A parsed template, ready for expansion.
#[derive(Debug)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Expand every action against the registry and context, in source order.
    pub async fn expand(
        &self,
        registry: &FunctionRegistry,
        context: &ExpansionContext,
    ) -> Result<String, EvalError> {
        let mut output = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Text(text) => output.push_str(text),
                Segment::Action(pipeline) => {
                    let value = eval_pipeline(pipeline, registry, context).await?;
                    output.push_str(&value.render());
                }
            }
        }

        Ok(output)
    }
}

/// The expander itself: delimiters plus parse/expand entry points.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    start_delim: String,
    stop_delim: String,
}

impl TemplateEngine {
    pub fn new(start_delim: impl Into<String>, stop_delim: impl Into<String>) -> Self {
        Self {
            start_delim: start_delim.into(),
            stop_delim: stop_delim.into(),
        }
    }

    /// Parse `source` into segments, validating function names against the
    /// registry.
    pub fn parse(
        &self,
        source: &str,
        registry: &FunctionRegistry,
    ) -> Result<Template, ParseError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut line = 1;

        while let Some(start) = rest.find(&self.start_delim) {
            let (text, tail) = rest.split_at(start);
            if !text.is_empty() {
                line += text.matches('\n').count();
                segments.push(Segment::Text(text.to_string()));
            }

            let body_and_beyond = &tail[self.start_delim.len()..];
            let Some(end) = body_and_beyond.find(&self.stop_delim) else {
                return Err(ParseError::new(line, "unclosed action"));
            };

            let body = &body_and_beyond[..end];
            let tokens = lex(body, line)?;
            let mut parser = Parser {
                tokens,
                pos: 0,
                line,
                registry,
            };
            let pipeline = parser.parse_pipeline()?;
            parser.expect_end()?;
            segments.push(Segment::Action(pipeline));

            line += body.matches('\n').count();
            rest = &body_and_beyond[end + self.stop_delim.len()..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Template { segments })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Field(String),
    Str(String),
    Int(i64),
    Bool(bool),
    Pipe,
    LParen,
    RParen,
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(name) => format!("identifier {name:?}"),
        Token::Field(name) => format!(".{name}"),
        Token::Str(_) => "string literal".to_string(),
        Token::Int(value) => format!("number {value}"),
        Token::Bool(value) => format!("boolean {value}"),
        Token::Pipe => "'|'".to_string(),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
    }
}

fn lex(body: &str, line: usize) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        match c {
            '|' => {
                tokens.push(Token::Pipe);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' => {
                i += 1;
                let mut value = String::new();
                loop {
                    let Some(&next) = chars.get(i) else {
                        return Err(ParseError::new(line, "unterminated quoted string"));
                    };
                    match next {
                        '"' => {
                            i += 1;
                            break;
                        }
                        '\\' => {
                            i += 1;
                            let Some(&escaped) = chars.get(i) else {
                                return Err(ParseError::new(line, "unterminated quoted string"));
                            };
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => other,
                            });
                            i += 1;
                        }
                        other => {
                            value.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '.' => {
                i += 1;
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if start == i {
                    return Err(ParseError::new(line, "expected a field name after '.'"));
                }
                tokens.push(Token::Field(chars[start..i].iter().collect()));
            }
            '-' | '0'..='9' => {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<i64>()
                    .map_err(|_| ParseError::new(line, format!("invalid number {text:?}")))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(match ident.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    _ => Token::Ident(ident),
                });
            }
            other => {
                return Err(ParseError::new(
                    line,
                    format!("unexpected character {other:?} in action"),
                ));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    line: usize,
    registry: &'a FunctionRegistry,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_end(&self) -> Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(ParseError::new(
                self.line,
                format!("unexpected {} in action", describe(token)),
            )),
        }
    }

    fn parse_pipeline(&mut self) -> Result<Pipeline, ParseError> {
        let first = self.parse_command(true)?;
        let mut rest = Vec::new();

        while self.eat(&Token::Pipe) {
            rest.push(self.parse_command(false)?);
        }

        Ok(Pipeline { first, rest })
    }

    /// A pipeline stage. The first stage may be any operand; every later
    /// stage must be a function so the piped value has somewhere to go.
    fn parse_command(&mut self, first: bool) -> Result<Expr, ParseError> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.pos += 1;

                if !self.registry.contains(&name) {
                    return Err(ParseError::new(
                        self.line,
                        format!("function {name:?} not defined"),
                    ));
                }

                let mut args = Vec::new();
                while self.at_operand() {
                    args.push(self.parse_operand()?);
                }

                Ok(Expr::Call { name, args })
            }
            Some(_) if first => {
                let operand = self.parse_operand()?;
                if self.at_operand() {
                    return Err(ParseError::new(
                        self.line,
                        "unexpected argument after a literal value",
                    ));
                }
                Ok(operand)
            }
            Some(token) => Err(ParseError::new(
                self.line,
                format!("expected a function after '|', found {}", describe(&token)),
            )),
            None => Err(ParseError::new(self.line, "missing value in action")),
        }
    }

    fn at_operand(&self) -> bool {
        matches!(
            self.peek(),
            Some(
                Token::Str(_)
                    | Token::Int(_)
                    | Token::Bool(_)
                    | Token::Field(_)
                    | Token::Ident(_)
                    | Token::LParen
            )
        )
    }

    fn parse_operand(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Token::Str(value)) => Ok(Expr::Str(value)),
            Some(Token::Int(value)) => Ok(Expr::Int(value)),
            Some(Token::Bool(value)) => Ok(Expr::Bool(value)),
            Some(Token::Field(name)) => Ok(Expr::Field(name)),
            Some(Token::Ident(name)) => {
                // A bare name in argument position is a zero-argument call.
                if !self.registry.contains(&name) {
                    return Err(ParseError::new(
                        self.line,
                        format!("function {name:?} not defined"),
                    ));
                }
                Ok(Expr::Call {
                    name,
                    args: Vec::new(),
                })
            }
            Some(Token::LParen) => {
                let pipeline = self.parse_pipeline()?;
                if !self.eat(&Token::RParen) {
                    return Err(ParseError::new(self.line, "unclosed '(' in action"));
                }
                Ok(Expr::Sub(Box::new(pipeline)))
            }
            Some(token) => Err(ParseError::new(
                self.line,
                format!("unexpected {} in action", describe(&token)),
            )),
            None => Err(ParseError::new(self.line, "missing operand in action")),
        }
    }
}

async fn eval_pipeline(
    pipeline: &Pipeline,
    registry: &FunctionRegistry,
    context: &ExpansionContext,
) -> Result<TemplateValue, EvalError> {
    let mut value = eval_expr(&pipeline.first, registry, context).await?;

    for stage in &pipeline.rest {
        let Expr::Call { name, args } = stage else {
            // The parser only admits calls after '|'.
            continue;
        };
        value = eval_call(name, args, Some(value), registry, context).await?;
    }

    Ok(value)
}

fn eval_expr<'a>(
    expr: &'a Expr,
    registry: &'a FunctionRegistry,
    context: &'a ExpansionContext,
) -> Pin<Box<dyn Future<Output = Result<TemplateValue, EvalError>> + Send + 'a>> {
    Box::pin(async move {
        match expr {
            Expr::Str(value) => Ok(TemplateValue::String(value.clone())),
            Expr::Int(value) => Ok(TemplateValue::Int(*value)),
            Expr::Bool(value) => Ok(TemplateValue::Bool(*value)),
            Expr::Field(name) => context
                .field(name)
                .map(|value| TemplateValue::String(value.to_string()))
                .ok_or_else(|| EvalError::UndefinedField(name.clone())),
            Expr::Call { name, args } => eval_call(name, args, None, registry, context).await,
            Expr::Sub(pipeline) => eval_pipeline(pipeline, registry, context).await,
        }
    })
}

async fn eval_call(
    name: &str,
    args: &[Expr],
    piped: Option<TemplateValue>,
    registry: &FunctionRegistry,
    context: &ExpansionContext,
) -> Result<TemplateValue, EvalError> {
    let function = registry
        .get(name)
        .ok_or_else(|| EvalError::UndefinedFunction(name.to_string()))?;

    let mut values = Vec::with_capacity(args.len() + 1);
    for arg in args {
        values.push(eval_expr(arg, registry, context).await?);
    }
    if let Some(piped) = piped {
        values.push(piped);
    }

    function
        .call(&values)
        .await
        .map_err(|source| EvalError::Function {
            function: name.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::TemplateFunction;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Upper;

    #[async_trait]
    impl TemplateFunction for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
            let value = args.first().and_then(TemplateValue::as_str).unwrap_or("");
            Ok(TemplateValue::String(value.to_uppercase()))
        }
    }

    struct Repeat;

    #[async_trait]
    impl TemplateFunction for Repeat {
        fn name(&self) -> &str {
            "repeat"
        }

        async fn call(&self, args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
            let count = match args.first() {
                Some(TemplateValue::Int(count)) => *count,
                _ => 0,
            };
            let value = args.get(1).and_then(TemplateValue::as_str).unwrap_or("");
            Ok(TemplateValue::String(value.repeat(count.max(0) as usize)))
        }
    }

    struct Fail;

    #[async_trait]
    impl TemplateFunction for Fail {
        fn name(&self) -> &str {
            "fail"
        }

        async fn call(&self, _args: &[TemplateValue]) -> Result<TemplateValue, FunctionError> {
            Err(FunctionError::ProtectNotEnabled)
        }
    }

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register(Arc::new(Upper));
        registry.register(Arc::new(Repeat));
        registry.register(Arc::new(Fail));
        registry
    }

    fn expand(source: &str, context: &ExpansionContext) -> Result<String, EvalError> {
        let registry = registry();
        let engine = TemplateEngine::new("{{", "}}");
        let template = engine.parse(source, &registry).expect("parse");
        tokio_test::block_on(template.expand(&registry, context))
    }

    #[test]
    fn test_plain_text_passes_through() {
        let output = expand("no actions here\n", &ExpansionContext::new()).expect("expand");
        assert_eq!(output, "no actions here\n");
    }

    #[test]
    fn test_literal_and_pipe() {
        let output = expand(r#"value: {{ "abc" | upper }}"#, &ExpansionContext::new())
            .expect("expand");
        assert_eq!(output, "value: ABC");
    }

    #[test]
    fn test_function_with_arguments_and_piped_input() {
        let output = expand(r#"{{ "ab" | repeat 3 }}"#, &ExpansionContext::new())
            .expect("expand");
        assert_eq!(output, "ababab");
    }

    #[test]
    fn test_field_access() {
        let context = ExpansionContext::new().with_field("ClusterName", "east-1");
        let output = expand("cluster: {{ .ClusterName }}", &context).expect("expand");
        assert_eq!(output, "cluster: east-1");
    }

    #[test]
    fn test_missing_field_fails_expansion() {
        match expand("{{ .Missing }}", &ExpansionContext::new()) {
            Err(EvalError::UndefinedField(name)) => assert_eq!(name, "Missing"),
            other => panic!("expected an undefined field error, got {:?}", other),
        }
    }

    #[test]
    fn test_parenthesized_pipeline_as_argument() {
        let output = expand(r#"{{ repeat 2 ("x" | upper) }}"#, &ExpansionContext::new())
            .expect("expand");
        assert_eq!(output, "XX");
    }

    #[test]
    fn test_undefined_function_is_a_parse_error() {
        let registry = registry();
        let engine = TemplateEngine::new("{{", "}}");
        match engine.parse(r#"test: {{ blah "asdf" }}"#, &registry) {
            Err(err) => {
                assert_eq!(
                    err.to_string(),
                    r#"template: tmpl:1: function "blah" not defined"#
                );
            }
            Ok(_) => panic!("expected a parse error"),
        }
    }

    #[test]
    fn test_parse_error_reports_the_action_line() {
        let registry = registry();
        let engine = TemplateEngine::new("{{", "}}");
        let source = "a: 1\nb: 2\nc: {{ nope }}\n";
        let err = engine.parse(source, &registry).expect_err("parse must fail");
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_unclosed_action_is_rejected() {
        let registry = registry();
        let engine = TemplateEngine::new("{{", "}}");
        let err = engine
            .parse("key: {{ upper \"x\"", &registry)
            .expect_err("parse must fail");
        assert_eq!(err.to_string(), "template: tmpl:1: unclosed action");
    }

    #[test]
    fn test_custom_delimiters() {
        let registry = registry();
        let engine = TemplateEngine::new("{{hub", "hub}}");
        let template = engine
            .parse(r#"value: {{hub "abc" | upper hub}}"#, &registry)
            .expect("parse");
        let output =
            tokio_test::block_on(template.expand(&registry, &ExpansionContext::new()))
                .expect("expand");
        assert_eq!(output, "value: ABC");

        // With custom delimiters, a plain `{{` is ordinary text.
        let template = engine.parse("plain: {{ not an action }}", &registry).expect("parse");
        let output =
            tokio_test::block_on(template.expand(&registry, &ExpansionContext::new()))
                .expect("expand");
        assert_eq!(output, "plain: {{ not an action }}");
    }

    #[test]
    fn test_function_failure_short_circuits() {
        match expand(r#"a: {{ fail }} b: {{ "x" | upper }}"#, &ExpansionContext::new()) {
            Err(EvalError::Function { function, .. }) => assert_eq!(function, "fail"),
            other => panic!("expected a function error, got {:?}", other),
        }
    }

    #[test]
    fn test_actions_evaluate_in_source_order() {
        let context = ExpansionContext::new()
            .with_field("A", "first")
            .with_field("B", "second");
        let output = expand("{{ .A }} then {{ .B }}", &context).expect("expand");
        assert_eq!(output, "first then second");
    }

    #[test]
    fn test_negative_integer_literals_parse() {
        // The autoindent rewrite can produce `indent -2`; the engine must
        // accept the negative literal and hand it through.
        let output = expand(r#"{{ "ab" | repeat -2 }}"#, &ExpansionContext::new())
            .expect("expand");
        assert_eq!(output, "");
    }

    #[test]
    fn test_pipe_into_literal_is_rejected() {
        let registry = registry();
        let engine = TemplateEngine::new("{{", "}}");
        let err = engine
            .parse(r#"{{ "a" | "b" }}"#, &registry)
            .expect_err("parse must fail");
        assert!(err.message.contains("expected a function after '|'"));
    }
}
