//! CQL: a small textual query language compiled to [`ComponentFilter`]s.
//!
//! ```text
//! term   := value ( ( "&" | "|" ) value )*
//! value  := "ALL" "(" ")"
//!         | "EXACT" "(" names ")"
//!         | "CONTAINS" "(" names ")"
//!         | "!" value
//!         | "(" term ")"
//! names  := ident ( "," ident )*
//! ```
//!
//! `&` and `|` have equal precedence and fold left to right, so
//! `A | B & C` means `(A | B) & C`. Whitespace is insignificant.

use std::iter::Peekable;
use std::str::CharIndices;

use crate::component::{ComponentRegistry, ComponentTypeId};
use crate::filter::{self, ComponentFilter};

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised while compiling CQL text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CqlError {
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("expected {expected} at offset {offset}, found {found}")]
    UnexpectedToken {
        expected: &'static str,
        found: String,
        offset: usize,
    },

    #[error("{operator} requires at least one component")]
    EmptyComponentList { operator: &'static str },

    #[error("unknown component '{name}' at offset {offset}")]
    UnknownComponent { name: String, offset: usize },
}

// ============================================================================
// LEXER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Ident(String),
    LParen,
    RParen,
    Comma,
    Bang,
    Amp,
    Pipe,
    Eof,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("'{name}'"),
            TokenKind::LParen => "'('".into(),
            TokenKind::RParen => "')'".into(),
            TokenKind::Comma => "','".into(),
            TokenKind::Bang => "'!'".into(),
            TokenKind::Amp => "'&'".into(),
            TokenKind::Pipe => "'|'".into(),
            TokenKind::Eof => "end of input".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    fn tokenize(&mut self) -> Result<Vec<Token>, CqlError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, CqlError> {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let Some(&(offset, c)) = self.chars.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                offset: self.source.len(),
            });
        };

        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            ',' => TokenKind::Comma,
            '!' => TokenKind::Bang,
            '&' => TokenKind::Amp,
            '|' => TokenKind::Pipe,
            c if is_ident_char(c) => return Ok(self.identifier(offset)),
            ch => return Err(CqlError::UnexpectedChar { ch, offset }),
        };
        self.chars.next();
        Ok(Token { kind, offset })
    }

    fn identifier(&mut self, start: usize) -> Token {
        let mut end = start;
        while let Some((i, c)) = self.chars.next_if(|(_, c)| is_ident_char(*c)) {
            end = i + c.len_utf8();
        }
        Token {
            kind: TokenKind::Ident(self.source[start..end].to_owned()),
            offset: start,
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

// ============================================================================
// PARSER
// ============================================================================

struct Parser<F> {
    tokens: Vec<Token>,
    pos: usize,
    lookup: F,
}

impl<F> Parser<F>
where
    F: Fn(&str) -> Option<ComponentTypeId>,
{
    fn current(&self) -> &Token {
        // tokenize() always ends with Eof, and advance() never moves past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn error(&self, expected: &'static str) -> CqlError {
        let token = self.current();
        CqlError::UnexpectedToken {
            expected,
            found: token.kind.describe(),
            offset: token.offset,
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<(), CqlError> {
        if self.check(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(expected))
        }
    }

    fn parse(&mut self) -> Result<ComponentFilter, CqlError> {
        let filter = self.parse_term()?;
        if !self.check(&TokenKind::Eof) {
            return Err(self.error("'&', '|' or end of input"));
        }
        Ok(filter)
    }

    fn parse_term(&mut self) -> Result<ComponentFilter, CqlError> {
        let mut left = self.parse_value()?;
        loop {
            left = match self.current().kind {
                TokenKind::Amp => {
                    self.advance();
                    filter::and(left, self.parse_value()?)
                }
                TokenKind::Pipe => {
                    self.advance();
                    filter::or(left, self.parse_value()?)
                }
                _ => return Ok(left),
            };
        }
    }

    fn parse_value(&mut self) -> Result<ComponentFilter, CqlError> {
        match &self.current().kind {
            TokenKind::Bang => {
                self.advance();
                Ok(filter::not(self.parse_value()?))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_term()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(word) if word == "ALL" => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(filter::all())
            }
            TokenKind::Ident(word) if word == "EXACT" => {
                self.advance();
                Ok(filter::exact(self.parse_names("EXACT")?))
            }
            TokenKind::Ident(word) if word == "CONTAINS" => {
                self.advance();
                Ok(filter::contains(self.parse_names("CONTAINS")?))
            }
            _ => Err(self.error("ALL, EXACT, CONTAINS, '!' or '('")),
        }
    }

    /// `"(" names ")"`, resolving each name. An empty list is a semantic
    /// error rather than a syntax error.
    fn parse_names(&mut self, operator: &'static str) -> Result<Vec<ComponentTypeId>, CqlError> {
        self.expect(TokenKind::LParen, "'('")?;
        if self.check(&TokenKind::RParen) {
            return Err(CqlError::EmptyComponentList { operator });
        }

        let mut ids = Vec::new();
        loop {
            let token = self.current().clone();
            let TokenKind::Ident(name) = token.kind else {
                return Err(self.error("component name"));
            };
            let id = (self.lookup)(&name).ok_or(CqlError::UnknownComponent {
                name,
                offset: token.offset,
            })?;
            ids.push(id);
            self.advance();

            if self.check(&TokenKind::Comma) {
                self.advance();
            } else {
                self.expect(TokenKind::RParen, "',' or ')'")?;
                return Ok(ids);
            }
        }
    }
}

// ============================================================================
// PUBLIC API
// ============================================================================

/// Compile CQL text, resolving component names through `lookup`.
pub fn parse<F>(text: &str, lookup: F) -> Result<ComponentFilter, CqlError>
where
    F: Fn(&str) -> Option<ComponentTypeId>,
{
    let tokens = Lexer::new(text).tokenize()?;
    Parser {
        tokens,
        pos: 0,
        lookup,
    }
    .parse()
}

/// Compile CQL text against the names in a component registry.
pub fn parse_with_registry(
    text: &str,
    registry: &ComponentRegistry,
) -> Result<ComponentFilter, CqlError> {
    parse(text, |name| registry.lookup_by_name(name))
}

/// Render a filter back to CQL text.
///
/// The output parses to an equivalent filter. Nested `And`/`Or` nodes are
/// parenthesized so the left fold does not regroup them.
pub fn format(filter: &ComponentFilter, registry: &ComponentRegistry) -> String {
    let names = |types: &[ComponentTypeId]| {
        types
            .iter()
            .map(|t| registry.name_of(*t))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let join = |children: &[ComponentFilter], op: &str, empty: &str| {
        if children.is_empty() {
            return empty.to_owned();
        }
        let parts: Vec<String> = children
            .iter()
            .map(|child| match child {
                ComponentFilter::And(_) | ComponentFilter::Or(_) => {
                    format!("({})", format(child, registry))
                }
                _ => format(child, registry),
            })
            .collect();
        parts.join(op)
    };

    match filter {
        ComponentFilter::All => "ALL()".to_owned(),
        ComponentFilter::Exact(types) => format!("EXACT({})", names(types)),
        ComponentFilter::Contains(types) => format!("CONTAINS({})", names(types)),
        ComponentFilter::Not(inner) => match **inner {
            ComponentFilter::And(_) | ComponentFilter::Or(_) => {
                format!("!({})", format(inner, registry))
            }
            _ => format!("!{}", format(inner, registry)),
        },
        ComponentFilter::And(children) => join(children, " & ", "ALL()"),
        ComponentFilter::Or(children) => join(children, " | ", "!ALL()"),
    }
}

// ============================================================================
// TESTS
// ============================================================================
