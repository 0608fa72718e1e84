//! Minimal JavaScript tokenizer.
//!
//! Produces just enough structure for import scanning and CommonJS export
//! discovery: identifiers, string literals (with byte spans), and single-byte
//! punctuation. Comments, template literals, numbers and regular expressions
//! are consumed so their contents never produce false matches.

/// A lexical token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    /// Identifier or keyword.
    Ident(&'a str),
    /// String literal. `start..end` is the byte span of the raw value
    /// between the quotes.
    Str {
        value: &'a str,
        start: usize,
        end: usize,
    },
    /// Any other single byte (`{`, `.`, `=`, ...).
    Punct(u8),
    /// Template literal (contents skipped).
    Template,
    /// Numeric literal.
    Number,
    /// Regular expression literal.
    Regex,
}

impl<'a> Token<'a> {
    #[must_use]
    pub fn is_ident(&self, name: &str) -> bool {
        matches!(self, Token::Ident(s) if *s == name)
    }

    #[must_use]
    pub fn is_punct(&self, c: u8) -> bool {
        matches!(self, Token::Punct(p) if *p == c)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Token::Str { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Keywords after which a `/` starts a regular expression.
const REGEX_KEYWORDS: &[&str] = &[
    "return", "typeof", "case", "do", "else", "in", "instanceof", "new", "delete", "void",
    "throw", "yield", "await",
];

/// Tokenize a whole source text.
#[must_use]
pub fn tokenize(source: &str) -> Vec<Token<'_>> {
    let bytes = source.as_bytes();
    let len = bytes.len();
    let mut tokens: Vec<Token<'_>> = Vec::new();
    let mut i = 0;

    while i < len {
        let c = bytes[i];

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // Comments
        if c == b'/' && i + 1 < len && bytes[i + 1] == b'/' {
            while i < len && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c == b'/' && i + 1 < len && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < len && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                i += 1;
            }
            i = (i + 2).min(len);
            continue;
        }

        if c == b'\'' || c == b'"' {
            let start = i + 1;
            let end = skip_string(bytes, start, c);
            tokens.push(Token::Str {
                value: &source[start..end],
                start,
                end,
            });
            i = (end + 1).min(len);
            continue;
        }

        if c == b'`' {
            i = skip_template(bytes, i + 1);
            tokens.push(Token::Template);
            continue;
        }

        if c == b'/' && regex_allowed(tokens.last()) {
            i = skip_regex(bytes, i + 1);
            tokens.push(Token::Regex);
            continue;
        }

        if is_ident_start(c) {
            let start = i;
            while i < len && is_ident_part(bytes[i]) {
                i += 1;
            }
            tokens.push(Token::Ident(&source[start..i]));
            continue;
        }

        if c.is_ascii_digit() {
            while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.' || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(Token::Number);
            continue;
        }

        // Bytes >= 0x80 were taken by the identifier branch.
        tokens.push(Token::Punct(c));
        i += 1;
    }

    tokens
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$' || c >= 0x80
}

fn is_ident_part(c: u8) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

/// Whether a `/` following `prev` opens a regular expression.
fn regex_allowed(prev: Option<&Token<'_>>) -> bool {
    match prev {
        None => true,
        Some(Token::Punct(p)) => !matches!(p, b')' | b']' | b'}'),
        Some(Token::Ident(word)) => REGEX_KEYWORDS.contains(word),
        Some(_) => false,
    }
}

/// Return the index of the closing quote (or end of input).
fn skip_string(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            c if c == quote => return i,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Skip a template literal body, including `${ ... }` substitutions.
fn skip_template(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'`' => return i + 1,
            b'$' if i + 1 < bytes.len() && bytes[i + 1] == b'{' => {
                i = skip_substitution(bytes, i + 2);
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Skip a `${ ... }` expression up to and including its closing brace.
fn skip_substitution(bytes: &[u8], mut i: usize) -> usize {
    let mut depth = 1usize;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return i + 1;
                }
            }
            b'\'' | b'"' => {
                i = skip_string(bytes, i + 1, bytes[i]);
            }
            b'`' => {
                i = skip_template(bytes, i + 1);
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    bytes.len()
}

/// Skip a regular expression body and its flags.
fn skip_regex(bytes: &[u8], mut i: usize) -> usize {
    let mut in_class = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'[' => {
                in_class = true;
                i += 1;
            }
            b']' => {
                in_class = false;
                i += 1;
            }
            b'/' if !in_class => {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                    i += 1;
                }
                return i;
            }
            b'\n' => return i,
            _ => i += 1,
        }
    }
    bytes.len()
}
