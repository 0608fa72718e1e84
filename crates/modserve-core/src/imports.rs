//! ES module import specifier scanner.
//!
//! Finds the specifiers of static imports, re-exports and dynamic imports
//! with their byte spans, so a transformer can rewrite them in place without
//! reprinting the module.

use crate::lexer::{tokenize, Token};

/// Kind of import a specifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import x from "a"` or `import "a"`.
    Static,
    /// `export { x } from "a"` or `export * from "a"`.
    ReExport,
    /// `import("a")` with a string literal argument.
    Dynamic,
}

/// An import specifier found in source code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSpan {
    /// Specifier exactly as written.
    pub specifier: String,
    pub kind: ImportKind,
    /// Byte offset of the specifier text (inside the quotes).
    pub start: usize,
    /// Byte offset one past the specifier text.
    pub end: usize,
}

/// Scan an ES module for import specifiers, in source order.
#[must_use]
pub fn scan_imports(source: &str) -> Vec<ImportSpan> {
    let tokens = tokenize(source);
    let mut spans = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        let preceded_by_dot = i > 0 && tokens[i - 1].is_punct(b'.');

        if tokens[i].is_ident("import") && !preceded_by_dot {
            match tokens.get(i + 1) {
                // import("x")
                Some(Token::Punct(b'(')) => {
                    if let (Some(Token::Str { value, start, end }), Some(close)) =
                        (tokens.get(i + 2), tokens.get(i + 3))
                    {
                        if close.is_punct(b')') || close.is_punct(b',') {
                            spans.push(span(value, ImportKind::Dynamic, *start, *end));
                        }
                    }
                    i += 2;
                    continue;
                }
                // import "x"
                Some(Token::Str { value, start, end }) => {
                    spans.push(span(value, ImportKind::Static, *start, *end));
                    i += 2;
                    continue;
                }
                // import.meta
                Some(Token::Punct(b'.')) => {
                    i += 2;
                    continue;
                }
                Some(Token::Ident(_) | Token::Punct(b'{' | b'*')) => {
                    if let Some((found, next)) = find_from_clause(&tokens, i + 1) {
                        spans.push(span(found.0, ImportKind::Static, found.1, found.2));
                        i = next;
                        continue;
                    }
                }
                _ => {}
            }
        }

        if tokens[i].is_ident("export") && !preceded_by_dot {
            if let Some(Token::Punct(b'{' | b'*')) = tokens.get(i + 1) {
                if let Some((found, next)) = find_from_clause(&tokens, i + 1) {
                    spans.push(span(found.0, ImportKind::ReExport, found.1, found.2));
                    i = next;
                    continue;
                }
            }
        }

        i += 1;
    }

    spans
}

fn span(value: &str, kind: ImportKind, start: usize, end: usize) -> ImportSpan {
    ImportSpan {
        specifier: value.to_string(),
        kind,
        start,
        end,
    }
}

/// Look for `from "x"` ahead of `start`, stopping at the statement end.
///
/// Returns the specifier with its span and the index after it.
fn find_from_clause<'a>(
    tokens: &[Token<'a>],
    from: usize,
) -> Option<((&'a str, usize, usize), usize)> {
    let mut j = from;
    while j < tokens.len() {
        match tokens[j] {
            Token::Punct(b';') => return None,
            Token::Ident("import" | "export") if j > from => return None,
            Token::Ident("from") => {
                if let Some(Token::Str { value, start: s, end: e }) = tokens.get(j + 1) {
                    return Some(((*value, *s, *e), j + 2));
                }
            }
            _ => {}
        }
        j += 1;
    }
    None
}

/// Replace specifier spans with new text.
///
/// `replacements` pairs each span with its rewritten specifier; spans must
/// not overlap (as produced by [`scan_imports`]).
#[must_use]
pub fn rewrite_imports(source: &str, replacements: &[(ImportSpan, String)]) -> String {
    let mut ordered: Vec<&(ImportSpan, String)> = replacements.iter().collect();
    ordered.sort_by_key(|(span, _)| span.start);

    let mut out = String::with_capacity(source.len() + 64);
    let mut cursor = 0;
    for (span, replacement) in ordered {
        if span.start < cursor {
            continue;
        }
        out.push_str(&source[cursor..span.start]);
        out.push_str(replacement);
        cursor = span.end;
    }
    out.push_str(&source[cursor..]);
    out
}

/// Whether a source text is authored as an ES module.
///
/// True when it contains a top-level-looking `import`/`export` declaration
/// (dynamic `import()` and `import.meta` alone do not count).
#[must_use]
pub fn has_module_syntax(source: &str) -> bool {
    let tokens = tokenize(source);
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 && tokens[i - 1].is_punct(b'.') {
            continue;
        }
        let next = tokens.get(i + 1);
        if token.is_ident("import") {
            if matches!(
                next,
                Some(Token::Str { .. } | Token::Ident(_) | Token::Punct(b'{' | b'*'))
            ) {
                return true;
            }
        } else if token.is_ident("export") {
            match next {
                Some(Token::Punct(b'{' | b'*')) => return true,
                Some(Token::Ident(word))
                    if matches!(
                        *word,
                        "default" | "const" | "let" | "var" | "function" | "class" | "async"
                    ) =>
                {
                    return true
                }
                _ => {}
            }
        }
    }
    false
}
