//! Tokenizer shared by the formula and procedure parsers.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Result, validation};

/// Words with a fixed meaning somewhere in the grammar. Identifiers spelled
/// like one of these must be backquoted.
const KEYWORDS: &[&str] = &[
    "true", "false", "if", "count", "oneOf", "toText", "sum", "dummy", "in", "let", "to",
    "set", "add", "from", "remove", "else", "foreach", "delete", "new", "make", "check",
];

/// Two-character symbols first so that the longest match wins.
const SYMBOLS: &[&str] = &[
    ":=", "!=", "<=", ">=", "&&", "||", ".", "[", "]", "(", ")", "{", "}", ",", ":", "|", "$",
    ";", "=", "<", ">", "+", "-", "*", "/", "^", "!",
];

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Number(f64),
    Str(String),
    Date(String),
    /// A bare word. Keywords are bare words too.
    Ident(String),
    /// A backquoted identifier.
    Quoted(String),
    Sym(&'static str),
    Newline,
    Eof,
}

impl Token {
    pub(crate) fn describe(&self) -> String {
        match self {
            Token::Number(x) => x.to_string(),
            Token::Str(s) => format!("{:?}", s),
            Token::Date(s) => format!("d{:?}", s),
            Token::Ident(s) => s.clone(),
            Token::Quoted(s) => format!("`{}`", s),
            Token::Sym(s) => s.to_string(),
            Token::Newline => "end of line".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?").expect("number regex must compile")
    })
}

fn string_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^d?"(?:[^"\\]|\\.)*""#).expect("string regex must compile"))
}

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*").expect("identifier regex must compile"))
}

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^`([^`]*)`").expect("quoted identifier regex must compile"))
}

fn annotation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\((problem|ambiguous|unnamed|deleted)\)")
            .expect("annotation regex must compile")
    })
}

/// Whether `s` can be written without backquotes.
pub(crate) fn is_plain_ident(s: &str) -> bool {
    ident_re().find(s).is_some_and(|m| m.end() == s.len()) && !KEYWORDS.contains(&s)
}

pub(crate) fn is_keyword(s: &str) -> bool {
    KEYWORDS.contains(&s)
}

/// A token stream with one-token lookahead.
#[derive(Debug, Clone)]
pub(crate) struct Lexer {
    tokens: Vec<Token>,
    pos: usize,
}

impl Lexer {
    /// Tokenize `text`. In procedure mode newlines are tokens and `#` starts a
    /// comment; otherwise both are plain whitespace / errors.
    pub(crate) fn new(text: &str, procedure_mode: bool) -> Result<Lexer> {
        let mut tokens = Vec::new();
        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            let offset = text.len() - rest.len();
            if c == '\n' {
                if procedure_mode {
                    tokens.push(Token::Newline);
                }
                rest = &rest[1..];
                continue;
            }
            if c.is_whitespace() {
                rest = &rest[c.len_utf8()..];
                continue;
            }
            if c == '#' && procedure_mode {
                rest = rest.find('\n').map_or("", |i| &rest[i..]);
                continue;
            }
            // Annotations carry no meaning.
            if let Some(m) = annotation_re().find(rest) {
                rest = &rest[m.end()..];
                continue;
            }
            if let Some(m) = string_re().find(rest) {
                let raw = m.as_str();
                let (is_date, literal) = match raw.strip_prefix('d') {
                    Some(lit) => (true, lit),
                    None => (false, raw),
                };
                let s: String = serde_json::from_str(literal).map_err(|e| {
                    validation(format!("Invalid string literal at offset {}: {}", offset, e))
                })?;
                tokens.push(if is_date { Token::Date(s) } else { Token::Str(s) });
                rest = &rest[m.end()..];
                continue;
            }
            if let Some(m) = number_re().find(rest) {
                let x: f64 = m.as_str().parse().map_err(|_| {
                    validation(format!("Invalid number at offset {}", offset))
                })?;
                tokens.push(Token::Number(x));
                rest = &rest[m.end()..];
                continue;
            }
            if let Some(m) = ident_re().find(rest) {
                tokens.push(Token::Ident(m.as_str().to_string()));
                rest = &rest[m.end()..];
                continue;
            }
            if let Some(caps) = quoted_re().captures(rest) {
                tokens.push(Token::Quoted(caps[1].to_string()));
                rest = &rest[caps[0].len()..];
                continue;
            }
            match SYMBOLS.iter().find(|s| rest.starts_with(**s)) {
                Some(sym) => {
                    tokens.push(Token::Sym(*sym));
                    rest = &rest[sym.len()..];
                }
                None => {
                    return Err(validation(format!(
                        "Unexpected character '{}' at offset {}",
                        c, offset
                    )));
                }
            }
        }
        tokens.push(Token::Eof);
        Ok(Lexer { tokens, pos: 0 })
    }

    pub(crate) fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    pub(crate) fn peek_at(&self, n: usize) -> &Token {
        static EOF: Token = Token::Eof;
        self.tokens.get(self.pos + n).unwrap_or(&EOF)
    }

    pub(crate) fn next_token(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    pub(crate) fn at_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Token::Sym(s) if *s == sym)
    }

    pub(crate) fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s == word)
    }

    pub(crate) fn eat_sym(&mut self, sym: &str) -> bool {
        if self.at_sym(sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn eat_keyword(&mut self, word: &str) -> bool {
        if self.at_keyword(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_sym(&mut self, sym: &str) -> Result<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", sym)))
        }
    }

    pub(crate) fn expect_keyword(&mut self, word: &str) -> Result<()> {
        if self.eat_keyword(word) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", word)))
        }
    }

    pub(crate) fn unexpected(&self, wanted: &str) -> crate::EngineError {
        validation(format!(
            "Parse error: expected {}, got {}",
            wanted,
            self.peek().describe()
        ))
    }

    pub(crate) fn skip_newlines(&mut self) {
        while matches!(self.peek(), Token::Newline) {
            self.pos += 1;
        }
    }
}
