//! `# [selector]` line filtering.
//!
//! A selector is a Python-style boolean expression over platform flags,
//! `py`/`np` integers and variant values. Lines whose selector is false are
//! dropped before YAML parsing.

use std::collections::BTreeMap;

use solvable_schema::Subdir;

use super::RenderError;

/// A value in the selector namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl SelectorValue {
    fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Str(s) => !s.is_empty(),
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Int(i) => Some(*i),
            Self::Str(s) => s.parse().ok(),
        }
    }
}

/// `3.12` -> `312`, the form `py` and `np` take in selectors.
fn squash_version(version: &str) -> Option<i64> {
    let mut parts = version.split_whitespace().next()?.split('.');
    let major = parts.next()?;
    let minor = parts.next().unwrap_or_default();
    format!("{major}{minor}").parse().ok()
}

/// Names visible to selector expressions.
#[derive(Debug, Clone, Default)]
pub struct Namespace(BTreeMap<String, SelectorValue>);

impl Namespace {
    /// The conda-build namespace for rendering `target` with a toolchain on
    /// `build`, extended with the variant's values.
    pub fn for_target(target: &Subdir, build: &Subdir, variant: &BTreeMap<String, String>) -> Self {
        let mut ns = Self::default();
        let platform = target.platform();
        let arch = target.arch().unwrap_or_default();

        for key in variant.keys().filter(|k| !k.contains('-')) {
            ns.insert(key, SelectorValue::Str(variant[key].clone()));
        }

        for name in ["linux", "osx", "win"] {
            ns.insert(name, SelectorValue::Bool(platform == name));
        }
        ns.insert("unix", SelectorValue::Bool(target.is_unix()));
        let bits32 = arch == "32";
        let bits64 = !bits32 && !target.is_noarch();
        ns.insert("linux32", SelectorValue::Bool(platform == "linux" && bits32));
        ns.insert("linux64", SelectorValue::Bool(platform == "linux" && arch == "64"));
        ns.insert("win32", SelectorValue::Bool(platform == "win" && bits32));
        ns.insert("win64", SelectorValue::Bool(platform == "win" && bits64));
        ns.insert("x86", SelectorValue::Bool(arch == "32" || arch == "64"));
        ns.insert("x86_64", SelectorValue::Bool(arch == "64"));
        for flag in ["aarch64", "arm64", "ppc64le", "armv7l", "armv6l", "s390x"] {
            ns.insert(flag, SelectorValue::Bool(arch == flag));
        }
        ns.insert("target_platform", SelectorValue::Str(target.to_string()));
        ns.insert("build_platform", SelectorValue::Str(build.to_string()));

        if let Some(py) = variant.get("python").and_then(|v| squash_version(v)) {
            ns.insert("py", SelectorValue::Int(py));
            ns.insert("py3k", SelectorValue::Bool((30..40).contains(&py)));
            ns.insert("py2k", SelectorValue::Bool((20..30).contains(&py)));
            ns.insert(&format!("py{py}"), SelectorValue::Bool(true));
        }
        if let Some(np) = variant.get("numpy").and_then(|v| squash_version(v)) {
            ns.insert("np", SelectorValue::Int(np));
        }
        ns
    }

    pub fn insert(&mut self, name: &str, value: SelectorValue) {
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&SelectorValue> {
        self.0.get(name)
    }

    /// Evaluate a selector expression.
    pub fn evaluate(&self, expr: &str) -> Result<bool, RenderError> {
        let tokens = tokenize(expr)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            ns: self,
        };
        let value = parser.or_expr()?;
        if parser.pos != tokens.len() {
            return Err(RenderError::Template(format!("trailing input in selector [{expr}]")));
        }
        Ok(value.truthy())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, RenderError> {
    const OPS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];
    let mut tokens = Vec::new();
    let mut rest = expr.trim_start();
    while let Some(c) = rest.chars().next() {
        if c == '(' || c == ')' {
            tokens.push(if c == '(' { Token::LParen } else { Token::RParen });
            rest = &rest[1..];
        } else if c == '\'' || c == '"' {
            let end = rest[1..]
                .find(c)
                .ok_or_else(|| RenderError::Template(format!("unterminated string in [{expr}]")))?;
            tokens.push(Token::Str(rest[1..=end].to_string()));
            rest = &rest[end + 2..];
        } else if let Some(op) = OPS.iter().find(|op| rest.starts_with(**op)) {
            tokens.push(Token::Op(op));
            rest = &rest[op.len()..];
        } else if c.is_ascii_alphanumeric() || c == '_' {
            let end = rest
                .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                .unwrap_or(rest.len());
            let word = &rest[..end];
            tokens.push(match word.parse() {
                Ok(int) => Token::Int(int),
                Err(_) => Token::Ident(word.to_string()),
            });
            rest = &rest[end..];
        } else {
            return Err(RenderError::Template(format!(
                "unexpected '{c}' in selector [{expr}]"
            )));
        }
        rest = rest.trim_start();
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    ns: &'a Namespace,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn keyword(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or_expr(&mut self) -> Result<SelectorValue, RenderError> {
        let mut value = self.and_expr()?;
        while self.keyword("or") {
            let rhs = self.and_expr()?;
            value = SelectorValue::Bool(value.truthy() || rhs.truthy());
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> Result<SelectorValue, RenderError> {
        let mut value = self.not_expr()?;
        while self.keyword("and") {
            let rhs = self.not_expr()?;
            value = SelectorValue::Bool(value.truthy() && rhs.truthy());
        }
        Ok(value)
    }

    fn not_expr(&mut self) -> Result<SelectorValue, RenderError> {
        if self.keyword("not") {
            let value = self.not_expr()?;
            return Ok(SelectorValue::Bool(!value.truthy()));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<SelectorValue, RenderError> {
        let lhs = self.atom()?;
        let Some(Token::Op(op)) = self.peek().cloned() else {
            return Ok(lhs);
        };
        self.pos += 1;
        let rhs = self.atom()?;
        let ordering = match (lhs.as_int(), rhs.as_int()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => match (&lhs, &rhs) {
                (SelectorValue::Str(a), SelectorValue::Str(b)) => a.cmp(b),
                _ => return Ok(SelectorValue::Bool(op == "!=")),
            },
        };
        Ok(SelectorValue::Bool(match op {
            "==" => ordering.is_eq(),
            "!=" => ordering.is_ne(),
            ">=" => ordering.is_ge(),
            "<=" => ordering.is_le(),
            ">" => ordering.is_gt(),
            _ => ordering.is_lt(),
        }))
    }

    fn atom(&mut self) -> Result<SelectorValue, RenderError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| RenderError::Template("unexpected end of selector".to_string()))?;
        self.pos += 1;
        match token {
            Token::LParen => {
                let value = self.or_expr()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(RenderError::Template("unbalanced parentheses in selector".to_string()));
                }
                self.pos += 1;
                Ok(value)
            }
            Token::Int(i) => Ok(SelectorValue::Int(i)),
            Token::Str(s) => Ok(SelectorValue::Str(s)),
            Token::Ident(name) => Ok(match name.as_str() {
                "True" => SelectorValue::Bool(true),
                "False" => SelectorValue::Bool(false),
                _ => self.ns.get(&name).cloned().unwrap_or_else(|| {
                    tracing::debug!("undefined selector name {name}, treating it as false");
                    SelectorValue::Bool(false)
                }),
            }),
            Token::RParen | Token::Op(_) => Err(RenderError::Template(format!(
                "unexpected {token:?} in selector"
            ))),
        }
    }
}

/// Split `content  # [expr]` into its content and selector.
fn split_selector(line: &str) -> Option<(&str, &str)> {
    let body = line.trim_end().strip_suffix(']')?;
    let open = body.rfind('[')?;
    let content = body[..open].trim_end().strip_suffix('#')?;
    Some((content.trim_end(), &body[open + 1..]))
}

/// Drop lines whose selector is false and strip the selector comments.
pub fn apply_selectors(text: &str, ns: &Namespace) -> Result<String, RenderError> {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        match split_selector(line) {
            Some((content, expr)) => {
                if ns.evaluate(expr)? {
                    out.push_str(content);
                    out.push('\n');
                }
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    Ok(out)
}
