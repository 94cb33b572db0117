//! Hand-rolled lexer (scanner) for the Buzz language.
//!
//! The [`Lexer`] consumes a source string and produces a flat `Vec<Token>`.
//! Tokens carry [`Span`] information for precise error reporting.
//!
//! # String Interpolation
//!
//! Interpolated strings (`"sum: {a + b}"`) are lexed in a single pass. The
//! interpolated sub-expressions are collected as nested `Vec<Token>` stored
//! inside [`StringPart::Interp`]. The parser receives the outer token stream
//! and recursively re-parses the inner token streams for each `{ }` site.
//!
//! # Error Handling
//!
//! Lexer errors are collected into an internal list rather than immediately
//! aborting. This lets the lexer report multiple problems in a single pass.
//! Call [`Lexer::scan`] to get both the token stream and the error list.

use crate::token::{keyword, Span, StringPart, Token, TokenKind};

// ─────────────────────────────────────────────────────────────────────────────
// Lexer struct
// ─────────────────────────────────────────────────────────────────────────────

/// The Buzz lexical scanner.
///
/// Construct one with [`Lexer::new`] and then call [`Lexer::scan`] to obtain
/// the full token stream. The lexer itself is consumed after scanning.
pub struct Lexer<'src> {
    /// The full source text being scanned.
    #[allow(dead_code)]
    src: &'src str,
    /// Iterator over `(byte_offset, char)` pairs.
    chars: std::str::CharIndices<'src>,
    /// The current character and its byte offset, or `None` at EOF.
    current: Option<(usize, char)>,
    /// The *next* character peeked without consuming (for two-character lookahead).
    peeked: Option<(usize, char)>,
    /// Current source line (1-indexed).
    line: u32,
    /// Current source column in *characters* (1-indexed).
    col: u32,
    /// Byte offset of the character immediately after the most recently consumed one.
    pos: usize,
    /// Accumulated lex errors. Non-fatal; scanning continues after recording.
    errors: Vec<LexError>,
}

/// A non-fatal lexical error. Lexing continues after recording these so
/// the parser sees as many tokens as possible.
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

impl<'src> Lexer<'src> {
    /// Create a new lexer for the given source text.
    pub fn new(src: &'src str) -> Self {
        let mut chars = src.char_indices();
        let current = chars.next();
        let peeked = chars.next();
        Self {
            src,
            chars,
            current,
            peeked,
            line: 1,
            col: 1,
            pos: 0,
            errors: Vec::new(),
        }
    }

    /// Run the full scan, returning `(tokens, errors)`.
    ///
    /// `tokens` always ends with a [`TokenKind::Eof`] sentinel.
    /// `errors` is empty on a clean input.
    pub fn scan(mut self) -> (Vec<Token>, Vec<LexError>) {
        let mut tokens = Vec::new();

        loop {
            self.skip_whitespace_and_comments();

            if self.current.is_none() {
                let span = Span::new(self.pos, self.pos, self.line, self.col);
                tokens.push(Token::new(TokenKind::Eof, span));
                break;
            }

            tokens.push(self.next_token());
        }

        (tokens, self.errors)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal scanning helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Return the current character without consuming it.
    #[inline]
    fn peek(&self) -> Option<char> {
        self.current.map(|(_, c)| c)
    }

    /// Return the next character without consuming either current or next.
    #[inline]
    fn peek2(&self) -> Option<char> {
        self.peeked.map(|(_, c)| c)
    }

    /// Consume the current character and advance the iterator.
    /// Updates line/column counters and `self.pos`.
    fn advance(&mut self) -> Option<char> {
        let result = self.current;
        self.current = self.peeked;
        self.peeked = self.chars.next();

        if let Some((offset, ch)) = result {
            self.pos = offset + ch.len_utf8();
            if ch == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
            Some(ch)
        } else {
            None
        }
    }

    /// Consume the current character only if it equals `expected`.
    /// Returns whether the character was consumed.
    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Build a [`Span`] that begins at the given start position and ends at
    /// the current `self.pos`.
    #[inline]
    fn make_span(&self, start_pos: usize, start_line: u32, start_col: u32) -> Span {
        Span::new(start_pos, self.pos, start_line, start_col)
    }

    /// Skip all whitespace and `//` line comments.
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r' | '\n') => {
                    self.advance();
                }
                Some('/') if self.peek2() == Some('/') => {
                    while self.peek().map(|c| c != '\n').unwrap_or(false) {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    /// Lex the next token from the current position.
    /// Precondition: `self.current` is `Some` (not EOF).
    fn next_token(&mut self) -> Token {
        let start_pos = self.current.map(|(o, _)| o).unwrap_or(self.pos);
        let start_line = self.line;
        let start_col = self.col;

        let ch = self.advance().expect("next_token called at EOF");

        let kind = match ch {
            // ── Single-character unambiguous tokens ──────────────────────────
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            ':' => TokenKind::Colon,
            '+' => TokenKind::Plus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '&' => TokenKind::Ampersand,
            '^' => TokenKind::Caret,
            '|' => TokenKind::Pipe,
            '$' => TokenKind::Dollar,

            // ── Multi-character or overloaded tokens ─────────────────────────
            '-' => {
                if self.eat('>') {
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            '!' => {
                if self.eat('=') {
                    TokenKind::BangEqual
                } else if self.eat('>') {
                    TokenKind::BangGreater
                } else {
                    TokenKind::Bang
                }
            }
            '=' => {
                if self.eat('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                }
            }
            '<' => {
                if self.eat('=') {
                    TokenKind::LessEqual
                } else if self.eat('<') {
                    TokenKind::ShiftLeft
                } else {
                    TokenKind::Less
                }
            }
            '>' => {
                if self.eat('=') {
                    TokenKind::GreaterEqual
                } else if self.eat('>') {
                    TokenKind::ShiftRight
                } else {
                    TokenKind::Greater
                }
            }
            '?' => {
                if self.eat('?') {
                    TokenKind::QuestionQuestion
                } else {
                    TokenKind::Question
                }
            }
            '.' => {
                if self.eat('.') {
                    TokenKind::DotDot
                } else {
                    TokenKind::Dot
                }
            }

            // ── String literal ───────────────────────────────────────────────
            '"' => self.scan_string(start_pos, start_line, start_col),

            // ── Number literals ──────────────────────────────────────────────
            c if c.is_ascii_digit() => self.scan_number(c, start_pos, start_line, start_col),

            // ── Identifiers and keywords ─────────────────────────────────────
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                ident.push(c);
                let tail = self.scan_ident_tail();
                ident.push_str(&tail);
                keyword(&ident).unwrap_or(TokenKind::Identifier(ident))
            }

            other => {
                let span = self.make_span(start_pos, start_line, start_col);
                self.errors.push(LexError {
                    message: format!("unexpected character `{other}`"),
                    span,
                });
                // Emit a dummy token and continue.
                TokenKind::Bang
            }
        };

        let span = self.make_span(start_pos, start_line, start_col);
        Token::new(kind, span)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sub-scanners
    // ─────────────────────────────────────────────────────────────────────────

    /// Scan the tail of an identifier (everything after the first character).
    fn scan_ident_tail(&mut self) -> String {
        let mut s = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                s.push(c);
                self.advance();
            } else {
                break;
            }
        }
        s
    }

    /// Scan a numeric literal starting with the character `first`.
    ///
    /// Handles plain integers (`42`) and floats (`3.14`). Buzz integers are
    /// 32-bit; a literal that overflows `i32` is a lex error ("numeric
    /// overflow"). The `0..10` range form is disambiguated by requiring a
    /// digit after the `.` for the float interpretation.
    fn scan_number(
        &mut self,
        first: char,
        start_pos: usize,
        start_line: u32,
        start_col: u32,
    ) -> TokenKind {
        let mut raw = String::new();
        raw.push(first);

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                raw.push(c);
                self.advance();
            } else {
                break;
            }
        }

        // Fractional part — must have a digit on both sides of `.` so that
        // `0..10` lexes as `0` `..` `10` rather than a malformed float.
        if self.peek() == Some('.') && self.peek2().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            raw.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    raw.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            match raw.parse::<f64>() {
                Ok(v) => TokenKind::Float(v),
                Err(_) => {
                    let span = self.make_span(start_pos, start_line, start_col);
                    self.errors.push(LexError {
                        message: format!("invalid float literal `{raw}`"),
                        span,
                    });
                    TokenKind::Float(0.0)
                }
            }
        } else {
            match raw.parse::<i32>() {
                Ok(v) => TokenKind::Int(v),
                Err(_) => {
                    let span = self.make_span(start_pos, start_line, start_col);
                    self.errors.push(LexError {
                        message: format!("numeric overflow: `{raw}` does not fit in `int`"),
                        span,
                    });
                    TokenKind::Int(0)
                }
            }
        }
    }

    /// Scan a string literal that begins after the opening `"` has been consumed.
    ///
    /// Handles:
    /// - Standard escape sequences: `\n`, `\t`, `\r`, `\0`, `\\`, `\"`, `\{`
    /// - Interpolation sites: `{ expr }`
    ///   The content between `{` and `}` is recursively lexed and stored as
    ///   a [`StringPart::Interp`] containing its own token stream.
    fn scan_string(&mut self, start_pos: usize, start_line: u32, start_col: u32) -> TokenKind {
        let mut parts: Vec<StringPart> = Vec::new();
        let mut current_lit = String::new();

        loop {
            match self.peek() {
                None => {
                    let span = self.make_span(start_pos, start_line, start_col);
                    self.errors.push(LexError {
                        message: "unterminated string literal".into(),
                        span,
                    });
                    break;
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.advance() {
                        Some('n') => current_lit.push('\n'),
                        Some('t') => current_lit.push('\t'),
                        Some('r') => current_lit.push('\r'),
                        Some('0') => current_lit.push('\0'),
                        Some('\\') => current_lit.push('\\'),
                        Some('"') => current_lit.push('"'),
                        Some('{') => current_lit.push('{'),
                        Some('}') => current_lit.push('}'),
                        Some(c) => {
                            let span = self.make_span(start_pos, start_line, start_col);
                            self.errors.push(LexError {
                                message: format!("unknown string escape `\\{c}`"),
                                span,
                            });
                            current_lit.push(c);
                        }
                        None => {
                            let span = self.make_span(start_pos, start_line, start_col);
                            self.errors.push(LexError {
                                message: "unterminated string escape at end of file".into(),
                                span,
                            });
                            break;
                        }
                    }
                }
                Some('{') => {
                    // Flush accumulated literal text.
                    if !current_lit.is_empty() {
                        parts.push(StringPart::Lit(std::mem::take(&mut current_lit)));
                    }
                    self.advance(); // consume `{`

                    let interp_src = self.collect_interp_source(start_pos, start_line, start_col);

                    // Lex the collected source as a nested token stream.
                    let (interp_tokens, mut interp_errors) = Lexer::new(&interp_src).scan();
                    self.errors.append(&mut interp_errors);
                    parts.push(StringPart::Interp(interp_tokens));
                }
                Some(c) => {
                    current_lit.push(c);
                    self.advance();
                }
            }
        }

        if !current_lit.is_empty() {
            parts.push(StringPart::Lit(current_lit));
        }

        TokenKind::Str(parts)
    }

    /// Collect the raw source characters of a `{ }` interpolation site.
    ///
    /// The opening `{` has already been consumed. Characters are collected
    /// until the matching `}`, counting nested `{` / `}` pairs and skipping
    /// over nested string literals so that `"{m["}"]}"` brackets correctly.
    fn collect_interp_source(
        &mut self,
        err_start_pos: usize,
        err_start_line: u32,
        err_start_col: u32,
    ) -> String {
        let mut src = String::new();
        let mut depth = 1usize;

        loop {
            match self.peek() {
                None => {
                    let span = self.make_span(err_start_pos, err_start_line, err_start_col);
                    self.errors.push(LexError {
                        message: "unterminated string interpolation `{ ... }`".into(),
                        span,
                    });
                    break;
                }
                Some('{') => {
                    depth += 1;
                    src.push('{');
                    self.advance();
                }
                Some('}') => {
                    depth -= 1;
                    if depth == 0 {
                        self.advance();
                        break;
                    }
                    src.push('}');
                    self.advance();
                }
                Some('"') => {
                    // Copy a nested string literal verbatim (its braces do not count).
                    src.push('"');
                    self.advance();
                    loop {
                        match self.peek() {
                            None => break,
                            Some('\\') => {
                                src.push('\\');
                                self.advance();
                                if let Some(c) = self.advance() {
                                    src.push(c);
                                }
                            }
                            Some('"') => {
                                src.push('"');
                                self.advance();
                                break;
                            }
                            Some(c) => {
                                src.push(c);
                                self.advance();
                            }
                        }
                    }
                }
                Some(c) => {
                    src.push(c);
                    self.advance();
                }
            }
        }
        src
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public convenience function
// ─────────────────────────────────────────────────────────────────────────────

/// Lex `src` and return `(tokens, errors)`.
///
/// This is the primary entry point for the rest of the compiler.
/// The returned `tokens` always end with `TokenKind::Eof`.
pub fn lex(src: &str) -> (Vec<Token>, Vec<LexError>) {
    Lexer::new(src).scan()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (toks, errs) = lex(src);
        assert!(errs.is_empty(), "unexpected lex errors: {errs:?}");
        toks.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_single_chars() {
        let k = kinds("( ) { } [ ] , ; :");
        assert_eq!(
            k,
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::LeftBracket,
                TokenKind::RightBracket,
                TokenKind::Comma,
                TokenKind::Semicolon,
                TokenKind::Colon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        let k = kinds("+ - * / % == != <= >= < > ! !> ? ?? .. . -> << >> & ^ | $");
        assert_eq!(k[0], TokenKind::Plus);
        assert_eq!(k[1], TokenKind::Minus);
        assert_eq!(k[2], TokenKind::Star);
        assert_eq!(k[3], TokenKind::Slash);
        assert_eq!(k[4], TokenKind::Percent);
        assert_eq!(k[5], TokenKind::EqualEqual);
        assert_eq!(k[6], TokenKind::BangEqual);
        assert_eq!(k[7], TokenKind::LessEqual);
        assert_eq!(k[8], TokenKind::GreaterEqual);
        assert_eq!(k[9], TokenKind::Less);
        assert_eq!(k[10], TokenKind::Greater);
        assert_eq!(k[11], TokenKind::Bang);
        assert_eq!(k[12], TokenKind::BangGreater);
        assert_eq!(k[13], TokenKind::Question);
        assert_eq!(k[14], TokenKind::QuestionQuestion);
        assert_eq!(k[15], TokenKind::DotDot);
        assert_eq!(k[16], TokenKind::Dot);
        assert_eq!(k[17], TokenKind::Arrow);
        assert_eq!(k[18], TokenKind::ShiftLeft);
        assert_eq!(k[19], TokenKind::ShiftRight);
        assert_eq!(k[20], TokenKind::Ampersand);
        assert_eq!(k[21], TokenKind::Caret);
        assert_eq!(k[22], TokenKind::Pipe);
        assert_eq!(k[23], TokenKind::Dollar);
    }

    #[test]
    fn test_keywords() {
        let k = kinds("fun object enum test throw catch foreach do until");
        assert_eq!(k[0], TokenKind::Fun);
        assert_eq!(k[1], TokenKind::Object);
        assert_eq!(k[2], TokenKind::Enum);
        assert_eq!(k[3], TokenKind::Test);
        assert_eq!(k[4], TokenKind::Throw);
        assert_eq!(k[5], TokenKind::Catch);
        assert_eq!(k[6], TokenKind::ForEach);
        assert_eq!(k[7], TokenKind::Do);
        assert_eq!(k[8], TokenKind::Until);
    }

    #[test]
    fn test_type_keywords() {
        let k = kinds("bool int float str void any");
        assert_eq!(k[0], TokenKind::BoolType);
        assert_eq!(k[1], TokenKind::IntType);
        assert_eq!(k[2], TokenKind::FloatType);
        assert_eq!(k[3], TokenKind::StrType);
        assert_eq!(k[4], TokenKind::VoidType);
        assert_eq!(k[5], TokenKind::AnyType);
    }

    #[test]
    fn test_integer_literals() {
        let k = kinds("0 42 2147483647");
        assert_eq!(k[0], TokenKind::Int(0));
        assert_eq!(k[1], TokenKind::Int(42));
        assert_eq!(k[2], TokenKind::Int(i32::MAX));
    }

    #[test]
    fn test_integer_overflow_is_error() {
        let (toks, errs) = lex("2147483648");
        assert_eq!(errs.len(), 1);
        assert!(errs[0].message.contains("numeric overflow"));
        assert_eq!(toks[0].kind, TokenKind::Int(0));
    }

    #[test]
    fn test_float_literals() {
        let k = kinds("3.14 0.5");
        assert_eq!(k[0], TokenKind::Float(3.14));
        assert_eq!(k[1], TokenKind::Float(0.5));
    }

    #[test]
    fn test_range_is_not_a_float() {
        let k = kinds("0..10");
        assert_eq!(k[0], TokenKind::Int(0));
        assert_eq!(k[1], TokenKind::DotDot);
        assert_eq!(k[2], TokenKind::Int(10));
    }

    #[test]
    fn test_plain_string() {
        let k = kinds(r#""hello world""#);
        assert_eq!(k[0], TokenKind::Str(vec![StringPart::Lit("hello world".into())]));
    }

    #[test]
    fn test_string_escapes() {
        let k = kinds(r#""\n\t\\\"\{" "#);
        assert_eq!(k[0], TokenKind::Str(vec![StringPart::Lit("\n\t\\\"{".into())]));
    }

    #[test]
    fn test_interpolated_string() {
        let (toks, errs) = lex(r#""count: {n}!""#);
        assert!(errs.is_empty());
        if let TokenKind::Str(parts) = &toks[0].kind {
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0], StringPart::Lit("count: ".into()));
            if let StringPart::Interp(inner) = &parts[1] {
                assert!(inner.len() >= 2);
                assert_eq!(inner[0].kind, TokenKind::Identifier("n".into()));
            } else {
                panic!("expected Interp part");
            }
            assert_eq!(parts[2], StringPart::Lit("!".into()));
        } else {
            panic!("expected Str token");
        }
    }

    #[test]
    fn test_interpolation_with_nested_braces() {
        let (toks, errs) = lex(r#""{if (a) { 1 } else { 2 }}""#);
        assert!(errs.is_empty());
        if let TokenKind::Str(parts) = &toks[0].kind {
            assert_eq!(parts.len(), 1);
            assert!(matches!(parts[0], StringPart::Interp(_)));
        } else {
            panic!("expected Str token");
        }
    }

    #[test]
    fn test_unterminated_string() {
        let (_, errs) = lex(r#""oops"#);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].message.contains("unterminated string"));
    }

    #[test]
    fn test_identifiers() {
        let k = kinds("foo _bar myVar _123");
        assert_eq!(k[0], TokenKind::Identifier("foo".into()));
        assert_eq!(k[1], TokenKind::Identifier("_bar".into()));
        assert_eq!(k[2], TokenKind::Identifier("myVar".into()));
        assert_eq!(k[3], TokenKind::Identifier("_123".into()));
    }

    #[test]
    fn test_line_comment() {
        let k = kinds("foo // this is a comment\nbar");
        assert_eq!(k[0], TokenKind::Identifier("foo".into()));
        assert_eq!(k[1], TokenKind::Identifier("bar".into()));
    }

    #[test]
    fn test_spans() {
        let (toks, _) = lex("int x = 42;");
        assert_eq!(toks[0].span.col, 1); // int
        assert_eq!(toks[1].span.col, 5); // x
        assert_eq!(toks[2].span.col, 7); // =
        assert_eq!(toks[3].span.col, 9); // 42
    }

    #[test]
    fn test_stray_character() {
        let (_, errs) = lex("let x = #;");
        assert!(errs.iter().any(|e| e.message.contains("unexpected character")));
    }
}
