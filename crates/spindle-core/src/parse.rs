use thiserror::Error;

use crate::dependency::DependencyTypes;
use crate::spec::{CompilerSpec, DependencySpec, Spec};
use crate::variant::VariantValue;
use crate::version::VersionConstraint;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecParseError {
    #[error("invalid version '{text}': {reason}")]
    InvalidVersion { text: String, reason: String },
    #[error("invalid spec '{input}': {reason}")]
    InvalidSpec { input: String, reason: String },
}

/// Parses whitespace-separated specs: a bare name after a complete spec
/// starts the next one (`hdf5 +mpi ^mpich zlib@1.2`).
pub fn parse_specs(input: &str) -> Result<Vec<Spec>, SpecParseError> {
    let mut parser = Parser::new(input);
    let mut specs = Vec::new();
    while let Some(spec) = parser.parse_one(false)? {
        specs.push(spec);
    }
    Ok(specs)
}

/// Parses a condition such as `@7.4.0:+libquo` or `^python@3:`; the package
/// name is optional.
pub(crate) fn parse_anonymous(input: &str) -> Result<Spec, SpecParseError> {
    let mut parser = Parser::new(input);
    let spec = parser.parse_one(true)?.unwrap_or_else(|| Spec::new(""));
    parser.skip_whitespace();
    if parser.peek().is_some() {
        return Err(parser.error("conditions must describe a single spec"));
    }
    Ok(spec)
}

struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.')
}

fn is_variant_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-')
}

fn is_version_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | ':' | ',' | '=')
}

fn is_value_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | ',' | ':' | '/')
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> SpecParseError {
        SpecParseError::InvalidSpec {
            input: self.input.to_string(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn take_while(&mut self, accept: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(&accept) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn parse_one(&mut self, anonymous: bool) -> Result<Option<Spec>, SpecParseError> {
        self.skip_whitespace();
        if self.peek().is_none() {
            return Ok(None);
        }

        let mut root = Spec::new("");
        if self.peek().is_some_and(is_name_char) {
            let start = self.pos;
            let word = self.take_while(is_name_char);
            if anonymous && self.peek() == Some('=') {
                self.pos = start;
            } else {
                root.name = word;
            }
        }
        if !anonymous && root.name.is_empty() {
            return Err(self.error("expected a package name"));
        }

        let mut dependencies: Vec<Spec> = Vec::new();
        loop {
            let mark = self.pos;
            let spaced = self.skip_whitespace();
            let Some(ch) = self.peek() else {
                break;
            };
            let node = dependencies.last_mut().unwrap_or(&mut root);
            match ch {
                '@' => {
                    self.pos += 1;
                    let text = self.take_while(is_version_char);
                    if text.is_empty() {
                        return Err(self.error("expected a version after '@'"));
                    }
                    let constraint = VersionConstraint::parse(&text)?;
                    node.version = node.version.intersect(&constraint);
                }
                '%' => {
                    self.pos += 1;
                    let name = self.take_while(is_name_char);
                    if name.is_empty() {
                        return Err(self.error("expected a compiler name after '%'"));
                    }
                    let mut version = VersionConstraint::Any;
                    if self.peek() == Some('@') {
                        self.pos += 1;
                        version = VersionConstraint::parse(&self.take_while(is_version_char))?;
                    }
                    if node.compiler.is_some() {
                        return Err(self.error(format!("'{}' names two compilers", node.name)));
                    }
                    node.compiler = Some(CompilerSpec::new(name, version));
                }
                '+' | '~' => {
                    self.pos += 1;
                    self.set_flag(node, ch == '+')?;
                }
                '-' if spaced => {
                    self.pos += 1;
                    self.set_flag(node, false)?;
                }
                '^' => {
                    self.pos += 1;
                    self.skip_whitespace();
                    let name = self.take_while(is_name_char);
                    if name.is_empty() {
                        return Err(self.error("expected a package name after '^'"));
                    }
                    if name == root.name || dependencies.iter().any(|dep| dep.name == name) {
                        return Err(self.error(format!("'{name}' is constrained twice")));
                    }
                    dependencies.push(Spec::new(name));
                }
                ch if is_name_char(ch) => {
                    let word = self.take_while(is_name_char);
                    if self.peek() != Some('=') {
                        if spaced && !anonymous {
                            // A bare name starts the next spec.
                            self.pos = mark;
                            break;
                        }
                        return Err(self.error(format!("unexpected token '{word}'")));
                    }
                    self.pos += 1;
                    let value = self.take_while(is_value_char);
                    if value.is_empty() {
                        return Err(self.error(format!("expected a value for '{word}'")));
                    }
                    match word.as_str() {
                        "arch" | "target" => node.architecture = Some(value),
                        _ => insert_variant(self, node, word, VariantValue::from_text(&value))?,
                    }
                }
                other => return Err(self.error(format!("unexpected character '{other}'"))),
            }
        }

        root.dependencies = dependencies
            .into_iter()
            .map(|spec| DependencySpec::new(spec, DependencyTypes::default()))
            .collect();
        Ok(Some(root))
    }

    fn set_flag(&mut self, node: &mut Spec, value: bool) -> Result<(), SpecParseError> {
        let name = self.take_while(is_variant_char);
        if name.is_empty() {
            return Err(self.error("expected a variant name"));
        }
        insert_variant(self, node, name, VariantValue::Bool(value))
    }
}

fn insert_variant(
    parser: &Parser<'_>,
    node: &mut Spec,
    name: String,
    value: VariantValue,
) -> Result<(), SpecParseError> {
    if let Some(existing) = node.variants.get(&name) {
        if existing != &value {
            return Err(parser.error(format!("variant '{name}' is set twice")));
        }
    }
    node.variants.insert(name, value);
    Ok(())
}
