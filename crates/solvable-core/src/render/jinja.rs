//! The Jinja subset recipes use in requirement sections.
//!
//! Supported: `{{ expr }}`, `{% set name = expr %}`, `{% if %}` blocks,
//! `{# comments #}`, string/number literals, `~` and `+`, filters, a few
//! string methods and calls into a caller-provided function table.
//! Undefined names render empty, as conda-build does with undefined Jinja
//! permitted.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::RenderError;
use super::selectors::{Namespace, SelectorValue};

static TAG: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?s)\{\{(.*?)\}\}|\{%(.*?)%\}|\{#.*?#\}"));

static SET: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?s)^set\s+([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.+)$"));

fn regex(re: &'static LazyLock<Result<Regex, regex::Error>>) -> Result<&'static Regex, RenderError> {
    re.as_ref().map_err(|e| RenderError::Template(e.to_string()))
}

/// A function call in a template, with evaluated arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call<'a> {
    pub name: &'a str,
    pub args: Vec<String>,
    pub kwargs: Vec<(String, String)>,
}

impl Call<'_> {
    /// Positional argument `index`, or keyword `key`.
    pub fn arg(&self, index: usize, key: &str) -> Option<&str> {
        self.kwargs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .or_else(|| self.args.get(index).map(String::as_str))
    }

    /// The call as source text with quoted arguments.
    pub fn to_source(&self) -> String {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| format!("'{a}'"))
            .chain(self.kwargs.iter().map(|(k, v)| format!("{k}='{v}'")))
            .collect();
        format!("{}({})", self.name, args.join(", "))
    }
}

/// The function table: `None` means the function is undefined.
pub type Functions<'a> = dyn Fn(&Call<'_>) -> Option<String> + 'a;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Undefined,
    Str(String),
    List(Vec<String>),
}

impl Value {
    fn render(&self) -> String {
        match self {
            Self::Undefined => String::new(),
            Self::Str(s) => s.clone(),
            Self::List(items) => format!("[{}]", items.join(", ")),
        }
    }

    fn text(self) -> String {
        match self {
            Self::Str(s) => s,
            other => other.render(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(String),
    Ident(String),
    Punct(char),
}

fn tokenize(expr: &str) -> Result<Vec<Token>, RenderError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' || c == '"' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            for (_, ch) in chars.by_ref() {
                if ch == c {
                    closed = true;
                    break;
                }
                text.push(ch);
            }
            if !closed {
                return Err(RenderError::Template(format!("unterminated string in {{{{ {expr} }}}}")));
            }
            tokens.push(Token::Str(text));
        } else if c.is_ascii_digit() {
            let mut end = start;
            while let Some(&(i, ch)) = chars.peek() {
                if !(ch.is_ascii_digit() || ch == '.') {
                    break;
                }
                end = i + ch.len_utf8();
                chars.next();
            }
            tokens.push(Token::Num(expr[start..end].to_string()));
        } else if c.is_alphabetic() || c == '_' {
            let mut end = start;
            while let Some(&(i, ch)) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                end = i + ch.len_utf8();
                chars.next();
            }
            tokens.push(Token::Ident(expr[start..end].to_string()));
        } else if "()[],|~+=.-".contains(c) {
            tokens.push(Token::Punct(c));
            chars.next();
        } else {
            return Err(RenderError::Template(format!("unexpected '{c}' in {{{{ {expr} }}}}")));
        }
    }
    Ok(tokens)
}

/// Template state: variables from the variant plus `{% set %}` definitions.
pub struct Jinja<'a> {
    vars: BTreeMap<String, String>,
    functions: &'a Functions<'a>,
}

impl std::fmt::Debug for Jinja<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jinja").field("vars", &self.vars).finish_non_exhaustive()
    }
}

impl<'a> Jinja<'a> {
    pub fn new(vars: BTreeMap<String, String>, functions: &'a Functions<'a>) -> Self {
        Self { vars, functions }
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: &str, value: String) {
        self.vars.insert(name.to_string(), value);
    }

    /// Render `template`.
    pub fn render(&mut self, template: &str) -> Result<String, RenderError> {
        let tag = regex(&TAG)?;
        let mut out = String::with_capacity(template.len());
        // One entry per open `if`: (this branch is active, a branch was taken).
        let mut blocks: Vec<(bool, bool)> = Vec::new();
        let mut last = 0;
        let mut trim_next = false;

        for caps in tag.captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            let mut text = &template[last..whole.start()];
            if trim_next {
                text = text.trim_start();
            }
            let inner = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            if inner.starts_with('-') {
                text = text.trim_end();
            }
            trim_next = inner.ends_with('-');
            last = whole.end();

            let active = blocks.iter().all(|(on, _)| *on);
            if active {
                out.push_str(text);
            }
            let inner = inner.trim_matches('-').trim();

            if caps.get(1).is_some() {
                if active {
                    out.push_str(&self.eval(inner)?.render());
                }
            } else if caps.get(2).is_some() {
                self.statement(inner, active, &mut blocks)?;
            }
        }
        if !blocks.is_empty() {
            return Err(RenderError::Template("unclosed {% if %} block".to_string()));
        }

        let mut tail = &template[last..];
        if trim_next {
            tail = tail.trim_start();
        }
        out.push_str(tail);
        Ok(out)
    }

    fn statement(&mut self, stmt: &str, active: bool, blocks: &mut Vec<(bool, bool)>) -> Result<(), RenderError> {
        let (keyword, rest) = stmt.split_once(char::is_whitespace).unwrap_or((stmt, ""));
        match keyword {
            "set" => {
                if active {
                    let caps = regex(&SET)?
                        .captures(stmt)
                        .ok_or_else(|| RenderError::Template(format!("malformed {{% {stmt} %}}")))?;
                    let value = self.eval(&caps[2])?.text();
                    self.set(&caps[1], value);
                }
            }
            "if" => {
                let taken = active && self.condition(rest)?;
                blocks.push((taken, taken));
            }
            "elif" => {
                let parent_active = blocks.len() < 2 || blocks[..blocks.len() - 1].iter().all(|(on, _)| *on);
                let (on, taken) = blocks
                    .last_mut()
                    .ok_or_else(|| RenderError::Template("elif without if".to_string()))?;
                *on = !*taken && parent_active && self.condition(rest)?;
                *taken |= *on;
            }
            "else" => {
                let (on, taken) = blocks
                    .last_mut()
                    .ok_or_else(|| RenderError::Template("else without if".to_string()))?;
                *on = !*taken;
                *taken = true;
            }
            "endif" => {
                blocks
                    .pop()
                    .ok_or_else(|| RenderError::Template("endif without if".to_string()))?;
            }
            _ => {
                return Err(RenderError::Template(format!(
                    "unsupported statement {{% {stmt} %}}"
                )));
            }
        }
        Ok(())
    }

    /// `{% if %}` conditions use the selector grammar over the variables.
    fn condition(&self, expr: &str) -> Result<bool, RenderError> {
        let mut ns = Namespace::default();
        for (name, value) in &self.vars {
            ns.insert(name, SelectorValue::Str(value.clone()));
        }
        ns.evaluate(expr)
    }

    /// Evaluate an expression to text.
    pub fn eval_str(&self, expr: &str) -> Result<String, RenderError> {
        self.eval(expr).map(|v| v.render())
    }

    fn eval(&self, expr: &str) -> Result<Value, RenderError> {
        let tokens = tokenize(expr)?;
        let mut parser = ExprParser {
            tokens: &tokens,
            pos: 0,
            env: self,
        };
        let value = parser.concat()?;
        if parser.pos != tokens.len() {
            return Err(RenderError::Template(format!("cannot parse {{{{ {expr} }}}}")));
        }
        Ok(value)
    }
}

struct ExprParser<'t, 'e> {
    tokens: &'t [Token],
    pos: usize,
    env: &'e Jinja<'e>,
}

impl ExprParser<'_, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), RenderError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(RenderError::Template(format!("expected '{c}'")))
        }
    }

    fn ident(&mut self) -> Result<String, RenderError> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(name)
            }
            other => Err(RenderError::Template(format!("expected a name, found {other:?}"))),
        }
    }

    fn concat(&mut self) -> Result<Value, RenderError> {
        let mut value = self.filtered()?;
        loop {
            if self.eat('~') {
                let rhs = self.filtered()?;
                value = Value::Str(value.render() + &rhs.render());
            } else if self.eat('+') {
                let rhs = self.filtered()?;
                let (a, b) = (value.render(), rhs.render());
                value = match (a.parse::<i64>(), b.parse::<i64>()) {
                    (Ok(x), Ok(y)) => Value::Str((x + y).to_string()),
                    _ => Value::Str(a + &b),
                };
            } else {
                return Ok(value);
            }
        }
    }

    fn filtered(&mut self) -> Result<Value, RenderError> {
        let mut value = self.postfix()?;
        while self.eat('|') {
            let name = self.ident()?;
            let (args, _) = if self.eat('(') { self.arguments()? } else { (Vec::new(), Vec::new()) };
            value = apply_filter(&name, value, &args)?;
        }
        Ok(value)
    }

    /// Comma-separated arguments up to the closing parenthesis.
    fn arguments(&mut self) -> Result<(Vec<String>, Vec<(String, String)>), RenderError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.eat(')') {
            let is_kwarg = matches!(
                (self.tokens.get(self.pos), self.tokens.get(self.pos + 1)),
                (Some(Token::Ident(_)), Some(Token::Punct('=')))
            );
            if is_kwarg {
                let key = self.ident()?;
                self.expect('=')?;
                kwargs.push((key, self.concat()?.text()));
            } else {
                args.push(self.concat()?.text());
            }
            if !self.eat(',') {
                self.expect(')')?;
                break;
            }
        }
        Ok((args, kwargs))
    }

    fn postfix(&mut self) -> Result<Value, RenderError> {
        let mut value = self.primary()?;
        loop {
            if self.eat('.') {
                let method = self.ident()?;
                let args = if self.eat('(') { self.arguments()?.0 } else { Vec::new() };
                value = apply_method(&method, value, &args);
            } else if self.eat('[') {
                let index = self.concat()?.render();
                self.expect(']')?;
                value = match (value, index.parse::<i64>()) {
                    (Value::List(items), Ok(i)) => {
                        let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                        let i = if i < 0 { len + i } else { i };
                        usize::try_from(i)
                            .ok()
                            .and_then(|i| items.get(i).cloned())
                            .map_or(Value::Undefined, Value::Str)
                    }
                    _ => Value::Undefined,
                };
            } else {
                return Ok(value);
            }
        }
    }

    fn primary(&mut self) -> Result<Value, RenderError> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| RenderError::Template("empty expression".to_string()))?;
        self.pos += 1;
        match token {
            Token::Str(s) | Token::Num(s) => Ok(Value::Str(s)),
            Token::Punct('(') => {
                let value = self.concat()?;
                self.expect(')')?;
                Ok(value)
            }
            Token::Punct('[') => {
                let mut items = Vec::new();
                while !self.eat(']') {
                    items.push(self.concat()?.text());
                    if !self.eat(',') {
                        self.expect(']')?;
                        break;
                    }
                }
                Ok(Value::List(items))
            }
            Token::Ident(name) => {
                if self.eat('(') {
                    let (args, kwargs) = self.arguments()?;
                    let call = Call {
                        name: &name,
                        args,
                        kwargs,
                    };
                    return Ok((self.env.functions)(&call).map_or(Value::Undefined, Value::Str));
                }
                Ok(match name.as_str() {
                    "True" | "False" | "None" => Value::Str(name),
                    _ => self
                        .env
                        .var(&name)
                        .map_or(Value::Undefined, |v| Value::Str(v.to_string())),
                })
            }
            Token::Punct('-') => Ok(match self.primary()? {
                Value::Str(s) => Value::Str(format!("-{s}")),
                other => other,
            }),
            Token::Punct(c) => Err(RenderError::Template(format!("unexpected '{c}'"))),
        }
    }
}

fn apply_method(method: &str, value: Value, args: &[String]) -> Value {
    let arg = |i: usize| args.get(i).map(String::as_str);
    match (method, value) {
        // `environ.get('X', 'default')` and friends on undefined objects.
        ("get", Value::Undefined) => arg(1).map_or(Value::Undefined, |d| Value::Str(d.to_string())),
        (_, Value::Undefined) => Value::Undefined,
        ("split", v) => {
            let text = v.text();
            Value::List(match arg(0) {
                Some(sep) => text.split(sep).map(str::to_string).collect(),
                None => text.split_whitespace().map(str::to_string).collect(),
            })
        }
        ("replace", v) => match (arg(0), arg(1)) {
            (Some(from), Some(to)) => Value::Str(v.text().replace(from, to)),
            _ => v,
        },
        ("lower", v) => Value::Str(v.text().to_lowercase()),
        ("upper", v) => Value::Str(v.text().to_uppercase()),
        ("strip", v) => Value::Str(v.text().trim().to_string()),
        ("startswith", v) => Value::Str(if arg(0).is_some_and(|p| v.text().starts_with(p)) { "True" } else { "False" }.to_string()),
        _ => Value::Undefined,
    }
}

fn apply_filter(name: &str, value: Value, args: &[String]) -> Result<Value, RenderError> {
    Ok(match name {
        "lower" => Value::Str(value.text().to_lowercase()),
        "upper" => Value::Str(value.text().to_uppercase()),
        "trim" => Value::Str(value.text().trim().to_string()),
        "string" | "int" | "float" => Value::Str(value.text()),
        "replace" => match (args.first(), args.get(1)) {
            (Some(from), Some(to)) => Value::Str(value.text().replace(from.as_str(), to)),
            _ => return Err(RenderError::Template("replace needs two arguments".to_string())),
        },
        "default" | "d" => match value {
            Value::Undefined => args.first().map_or(Value::Undefined, |d| Value::Str(d.clone())),
            other => other,
        },
        "join" => match value {
            Value::List(items) => Value::Str(items.join(args.first().map_or("", String::as_str))),
            other => other,
        },
        "first" => match value {
            Value::List(items) => items.first().cloned().map_or(Value::Undefined, Value::Str),
            other => other,
        },
        "last" => match value {
            Value::List(items) => items.last().cloned().map_or(Value::Undefined, Value::Str),
            other => other,
        },
        "length" => match value {
            Value::List(items) => Value::Str(items.len().to_string()),
            other => Value::Str(other.text().chars().count().to_string()),
        },
        _ => return Err(RenderError::Template(format!("unknown filter '{name}'"))),
    })
}
