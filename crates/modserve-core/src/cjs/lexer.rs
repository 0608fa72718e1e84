//! Static CommonJS export discovery.
//!
//! Recognised forms:
//! - `exports.a = …`, `module.exports.a = …`, `exports["a"] = …`
//! - `Object.defineProperty(exports, "a", …)` (also on `module.exports`)
//! - `module.exports = { a, b: 1, "c": 2, d() {}, ...require("./x") }`
//! - `module.exports = require("./x")`
//! - `__exportStar(require("./x"), exports)` and `__export(require("./x"))`
//!
//! Nothing is evaluated: names assigned through computed keys or loops are
//! invisible to this pass.

use crate::lexer::{tokenize, Token};

/// Exports discovered in one CommonJS source file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CjsExports {
    /// Exported names in first-seen order, deduplicated.
    pub names: Vec<String>,
    /// Specifiers whose exports are forwarded wholesale.
    pub reexports: Vec<String>,
}

impl CjsExports {
    fn add_name(&mut self, name: &str) {
        if !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }
    }

    fn add_reexport(&mut self, specifier: &str) {
        if !self.reexports.iter().any(|r| r == specifier) {
            self.reexports.push(specifier.to_string());
        }
    }
}

/// Scan a CommonJS source for its statically declared exports.
#[must_use]
pub fn parse_cjs_exports(source: &str) -> CjsExports {
    let tokens = tokenize(source);
    let mut exports = CjsExports::default();
    let mut i = 0;

    while i < tokens.len() {
        let preceded_by_dot = i > 0 && tokens[i - 1].is_punct(b'.');

        if preceded_by_dot {
            // `tslib.__exportStar(...)` is still a re-export.
            if let Some(next) = star_reexport(&tokens, i, &mut exports) {
                i = next;
                continue;
            }
            i += 1;
            continue;
        }

        // module.exports ...
        if tokens[i].is_ident("module")
            && at(&tokens, i + 1).is_punct(b'.')
            && at(&tokens, i + 2).is_ident("exports")
        {
            i = exports_target(&tokens, i + 3, &mut exports);
            continue;
        }

        // exports ...
        if tokens[i].is_ident("exports") {
            i = exports_target(&tokens, i + 1, &mut exports);
            continue;
        }

        // Object.defineProperty(exports, "name", ...)
        if tokens[i].is_ident("Object")
            && at(&tokens, i + 1).is_punct(b'.')
            && at(&tokens, i + 2).is_ident("defineProperty")
            && at(&tokens, i + 3).is_punct(b'(')
        {
            let mut j = i + 4;
            if at(&tokens, j).is_ident("module")
                && at(&tokens, j + 1).is_punct(b'.')
                && at(&tokens, j + 2).is_ident("exports")
            {
                j += 3;
            } else if at(&tokens, j).is_ident("exports") {
                j += 1;
            } else {
                i += 1;
                continue;
            }
            if at(&tokens, j).is_punct(b',') {
                if let Some(name) = at(&tokens, j + 1).as_str() {
                    exports.add_name(name);
                }
            }
            i = j;
            continue;
        }

        if let Some(next) = star_reexport(&tokens, i, &mut exports) {
            i = next;
            continue;
        }

        i += 1;
    }

    exports
}

const EOF_TOKEN: Token<'static> = Token::Punct(0);

fn at<'t, 'a>(tokens: &'t [Token<'a>], i: usize) -> &'t Token<'a> {
    tokens.get(i).unwrap_or(&EOF_TOKEN)
}

/// Whether the token at `i` is a plain assignment `=` (not `==` or `=>`).
fn is_assignment(tokens: &[Token<'_>], i: usize) -> bool {
    at(tokens, i).is_punct(b'=')
        && !at(tokens, i + 1).is_punct(b'=')
        && !at(tokens, i + 1).is_punct(b'>')
}

/// Handle what follows `exports` / `module.exports`. Returns the next index.
fn exports_target(tokens: &[Token<'_>], i: usize, exports: &mut CjsExports) -> usize {
    // .name =
    if at(tokens, i).is_punct(b'.') {
        if let Token::Ident(name) = at(tokens, i + 1) {
            if is_assignment(tokens, i + 2) {
                exports.add_name(name);
                return i + 3;
            }
        }
        return i + 1;
    }

    // ["name"] =
    if at(tokens, i).is_punct(b'[') {
        if let Some(name) = at(tokens, i + 1).as_str() {
            if at(tokens, i + 2).is_punct(b']') && is_assignment(tokens, i + 3) {
                exports.add_name(name);
                return i + 4;
            }
        }
        return i + 1;
    }

    if !is_assignment(tokens, i) {
        return i;
    }

    // = require("x")
    if let Some((specifier, next)) = require_call(tokens, i + 1) {
        exports.add_reexport(specifier);
        return next;
    }

    // = { ... }
    if at(tokens, i + 1).is_punct(b'{') {
        return object_literal(tokens, i + 2, exports);
    }

    i + 1
}

/// Match `require("x")` at `i`; returns the specifier and the index after `)`.
fn require_call<'a>(tokens: &[Token<'a>], i: usize) -> Option<(&'a str, usize)> {
    if at(tokens, i).is_ident("require") && at(tokens, i + 1).is_punct(b'(') {
        if let Token::Str { value, .. } = at(tokens, i + 2) {
            if at(tokens, i + 3).is_punct(b')') {
                return Some((value, i + 4));
            }
        }
    }
    None
}

/// Match `__exportStar(require("x")` / `__export(require("x")` at `i`.
fn star_reexport(tokens: &[Token<'_>], i: usize, exports: &mut CjsExports) -> Option<usize> {
    let helper = matches!(at(tokens, i), Token::Ident("__exportStar" | "__export"));
    if helper && at(tokens, i + 1).is_punct(b'(') {
        if let Some((specifier, next)) = require_call(tokens, i + 2) {
            exports.add_reexport(specifier);
            return Some(next);
        }
    }
    None
}

/// Collect keys of an object literal whose `{` precedes `i`.
///
/// Returns the index after the closing `}`.
fn object_literal(tokens: &[Token<'_>], mut i: usize, exports: &mut CjsExports) -> usize {
    loop {
        // Start of a property.
        match at(tokens, i) {
            Token::Punct(b'}') => return i + 1,
            Token::Punct(0) => return i,
            Token::Punct(b'.')
                if at(tokens, i + 1).is_punct(b'.') && at(tokens, i + 2).is_punct(b'.') =>
            {
                if let Some((specifier, _)) = require_call(tokens, i + 3) {
                    exports.add_reexport(specifier);
                }
            }
            Token::Ident(name) => {
                let next = at(tokens, i + 1);
                match next {
                    // get x() {}, set x(v) {}, async x() {}
                    Token::Ident(accessor) if matches!(*name, "get" | "set" | "async") => {
                        exports.add_name(accessor);
                    }
                    Token::Punct(b':' | b',' | b'}' | b'(') => exports.add_name(name),
                    _ => {}
                }
            }
            Token::Str { value, .. } => {
                let next = at(tokens, i + 1);
                if next.is_punct(b':') || next.is_punct(b'(') {
                    exports.add_name(value);
                }
            }
            _ => {}
        }

        // Skip to the next top-level `,` or the closing `}`.
        let mut depth = 0usize;
        loop {
            match at(tokens, i) {
                Token::Punct(0) => return i,
                Token::Punct(b'{' | b'(' | b'[') => depth += 1,
                Token::Punct(b'}' | b')' | b']') => {
                    if depth == 0 {
                        // Closing brace of the literal itself.
                        return i + 1;
                    }
                    depth -= 1;
                }
                Token::Punct(b',') if depth == 0 => {
                    i += 1;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
    }
}
