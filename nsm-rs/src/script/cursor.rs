//! Position-and-line tracking over an immutable input buffer.
//!
//! A [`ParseCursor`] is created per processing invocation and threaded by
//! `&mut` through every scanning function; nothing about the scan position
//! lives on the interpreter itself.

use super::error::{Delim, Location, ParseError, SourceRef};

/// A saved position, for speculative reads that may need to be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    pos: usize,
    line: usize,
}

/// One element of a `{options}` or `(params)` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    /// Trimmed text, or the unescaped contents when `quoted`.
    pub text: String,
    /// The item was wholly enclosed in `"…"` or `'…'`.
    pub quoted: bool,
    pub line: usize,
}

/// Body of a `{…}` block after indentation has been normalised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub text: String,
    /// Line number of the first line of `text`.
    pub line: usize,
    /// Line holding the closing `}`.
    pub end_line: usize,
}

#[derive(Debug, Clone)]
pub struct ParseCursor<'a> {
    pub input: &'a str,
    pub pos: usize,
    pub line: usize,
    pub base_indent: String,
    pub code_block_depth: usize,
    pub html_comment_depth: usize,
    pub source: SourceRef,
}

impl<'a> ParseCursor<'a> {
    pub fn new(input: &'a str, source: SourceRef) -> Self {
        ParseCursor {
            input,
            pos: 0,
            line: 1,
            base_indent: String::new(),
            code_block_depth: 0,
            html_comment_depth: 0,
            source,
        }
    }

    /// Start line numbering at `line` (for text lifted out of a larger file).
    pub fn starting_at(mut self, line: usize) -> Self {
        self.line = line;
        self
    }

    // ── Primitive reads ───────────────────────────────────────────────────────

    pub fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    pub fn rest(&self) -> &'a str {
        &self.input[self.pos.min(self.input.len())..]
    }

    pub fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    pub fn peek_byte(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        self.input.as_bytes().get(self.pos + offset).copied()
    }

    pub fn starts_with(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    /// Consume one character.
    pub fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    /// Consume `n` bytes; `n` must land on a character boundary.
    pub fn advance(&mut self, n: usize) {
        let end = (self.pos + n).min(self.input.len());
        self.line += self.input[self.pos..end].matches('\n').count();
        self.pos = end;
    }

    pub fn mark(&self) -> Mark {
        Mark { pos: self.pos, line: self.line }
    }

    pub fn restore(&mut self, mark: Mark) {
        self.pos = mark.pos;
        self.line = mark.line;
    }

    pub fn location(&self) -> Location {
        Location::new(self.source.clone(), self.line)
    }

    pub fn location_at(&self, line: usize) -> Location {
        Location::new(self.source.clone(), line)
    }

    pub fn count_newlines_since(&self, pos: usize) -> usize {
        let start = pos.min(self.pos);
        self.input[start..self.pos].matches('\n').count()
    }

    // ── Whitespace and comments ───────────────────────────────────────────────

    pub fn skip_inline_ws(&mut self) {
        while matches!(self.peek_byte(), Some(b' ' | b'\t' | b'\r')) {
            self.pos += 1;
        }
    }

    pub fn skip_ws(&mut self) {
        while let Some(b) = self.peek_byte() {
            if !b.is_ascii_whitespace() {
                break;
            }
            self.bump();
        }
    }

    /// Skip whitespace together with `//`, `#`, `/* */` and `<#-- --#>`
    /// comments.  `#--` opens a side-effect comment and is left in place.
    pub fn skip_ws_and_pragma_comments(&mut self) -> Result<(), ParseError> {
        loop {
            self.skip_ws();
            if self.starts_with("//") || (self.starts_with("#") && !self.starts_with("#--")) {
                self.skip_to_eol();
            } else if self.starts_with("/*") {
                let line = self.line;
                self.advance(2);
                self.skip_past("*/", Delim::Comment, line)?;
            } else if self.starts_with("<#--") {
                let line = self.line;
                self.advance(4);
                self.skip_past("--#>", Delim::Comment, line)?;
            } else {
                return Ok(());
            }
        }
    }

    /// Consume up to (not including) the next newline.
    pub fn skip_to_eol(&mut self) -> &'a str {
        let rest = self.rest();
        let n = rest.find('\n').unwrap_or(rest.len());
        self.pos += n;
        &rest[..n]
    }

    /// Consume through the next `close`, returning the text before it.
    pub fn skip_past(
        &mut self,
        close: &str,
        kind: Delim,
        opened_at_line: usize,
    ) -> Result<&'a str, ParseError> {
        let rest = self.rest();
        match rest.find(close) {
            Some(i) => {
                self.advance(i + close.len());
                Ok(&rest[..i])
            }
            None => Err(ParseError::Unterminated { kind, opened_at_line }),
        }
    }

    // ── Structured reads ──────────────────────────────────────────────────────

    /// Read a `"…"` or `'…'` token at the cursor, returning its unescaped
    /// contents.
    pub fn read_quoted(&mut self) -> Result<String, ParseError> {
        let opened_at_line = self.line;
        let quote = match self.bump() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(ParseError::Malformed("expected a quoted string".into())),
        };
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(ParseError::Unterminated { kind: Delim::Quote, opened_at_line }),
                Some('\\') => match self.bump() {
                    Some(c) => out.push(unescape_char(c)),
                    None => {
                        return Err(ParseError::Unterminated { kind: Delim::Quote, opened_at_line })
                    }
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
            }
        }
    }

    /// Read a bracketed region starting at `open`, returning the text between
    /// the delimiters.  Nested pairs of the same kind are honoured, a
    /// backslash protects the next character, and when `quote_aware` is set a
    /// `"…"` run is skipped as a unit.
    pub fn read_balanced(
        &mut self,
        open: u8,
        close: u8,
        quote_aware: bool,
    ) -> Result<&'a str, ParseError> {
        let kind = delim_for(open);
        let opened_at_line = self.line;
        if self.peek_byte() != Some(open) {
            return Err(ParseError::Malformed(format!("expected '{}'", open as char)));
        }
        let bytes = self.input.as_bytes();
        let start = self.pos + 1;
        let mut i = start;
        let mut depth = 1usize;
        let mut in_quote = false;
        while i < bytes.len() {
            let b = bytes[i];
            if b == b'\\' {
                i += 2;
                continue;
            }
            if in_quote {
                if b == b'"' {
                    in_quote = false;
                }
            } else if quote_aware && b == b'"' {
                in_quote = true;
            } else if b == open {
                depth += 1;
            } else if b == close {
                depth -= 1;
                if depth == 0 {
                    let inner = &self.input[start..i];
                    self.advance(i + 1 - self.pos);
                    return Ok(inner);
                }
            }
            i += 1;
        }
        Err(ParseError::Unterminated { kind, opened_at_line })
    }

    /// Read `open … close` and split its contents on top-level `sep`.
    pub fn read_bracketed_list(
        &mut self,
        open: u8,
        close: u8,
        sep: char,
    ) -> Result<(Vec<RawItem>, &'a str), ParseError> {
        let line = self.line;
        let inner = self.read_balanced(open, close, open == b'(')?;
        Ok((split_list(inner, sep, line), inner))
    }

    /// Read a `{ … }` block and normalise its indentation.
    ///
    /// The base indent is the leading whitespace of the line holding `{`.  A
    /// blank first line and a whitespace-only last line are dropped; every
    /// other continuation line must begin with the base indent (which is
    /// removed) unless it is blank or sits inside `<pre>`.
    pub fn read_balanced_block(&mut self) -> Result<Block, ParseError> {
        let line_start = self.input[..self.pos].rfind('\n').map_or(0, |i| i + 1);
        let base: String = self.input[line_start..]
            .chars()
            .take_while(|c| *c == ' ' || *c == '\t')
            .collect();
        let open_line = self.line;
        let inner = self.read_balanced(b'{', b'}', false)?;
        let end_line = self.line;

        let mut lines: Vec<&str> = inner.split('\n').collect();
        let mut first_line = open_line;
        let mut first_is_continuation = false;
        if lines.len() > 1 && lines[0].trim().is_empty() {
            lines.remove(0);
            first_line += 1;
            first_is_continuation = true;
        }
        if lines.len() > 1 && lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }

        let mut text = String::with_capacity(inner.len());
        let mut pre_depth = 0usize;
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                text.push('\n');
            }
            let continuation = i > 0 || first_is_continuation;
            if !continuation {
                text.push_str(line);
            } else if line.trim().is_empty() {
                // blank continuation lines carry no indentation
            } else if let Some(stripped) = line.strip_prefix(base.as_str()) {
                text.push_str(stripped);
            } else if pre_depth > 0 {
                text.push_str(line);
            } else {
                return Err(ParseError::Indentation {
                    line: first_line + i,
                    expected: base,
                });
            }
            pre_depth += line.matches("<pre").count();
            pre_depth = pre_depth.saturating_sub(line.matches("</pre>").count());
        }
        Ok(Block { text, line: first_line, end_line })
    }

    /// Read a call name at the cursor.
    ///
    /// Identifier names may contain `. : -` internally and may end in
    /// `++`, `--` or `+=`; operator names are a run of operator characters
    /// optionally followed by an identifier (`++x`, `:=`, `==`).
    pub fn read_name(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let first = *bytes.first()?;
        let mut end;
        if first.is_ascii_alphabetic() || first == b'_' {
            end = ident_end(bytes, 0);
            let tail = &rest[end..];
            if tail.starts_with("++") || tail.starts_with("--") || tail.starts_with("+=") {
                end += 2;
            }
        } else if is_op_byte(first) {
            end = 1;
            while end < bytes.len() && is_op_byte(bytes[end]) {
                end += 1;
            }
            if end < bytes.len() && (bytes[end].is_ascii_alphabetic() || bytes[end] == b'_') {
                end = ident_end(bytes, end);
            }
        } else {
            return None;
        }
        self.pos += end;
        Some(&rest[..end])
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn delim_for(open: u8) -> Delim {
    match open {
        b'(' => Delim::Paren,
        b'[' => Delim::Bracket,
        b'`' => Delim::Backtick,
        _ => Delim::Brace,
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-')
}

pub(crate) fn is_op_byte(b: u8) -> bool {
    matches!(
        b,
        b'+' | b'-' | b'*' | b'/' | b'%' | b'=' | b'!' | b'<' | b'>' | b'&' | b'|' | b'^' | b'~' | b':'
    )
}

/// End of an identifier starting at `start`, with trailing `. : -` dropped.
fn ident_end(bytes: &[u8], start: usize) -> usize {
    let mut end = start + 1;
    while end < bytes.len() && is_ident_byte(bytes[end]) {
        end += 1;
    }
    while end > start + 1 && matches!(bytes[end - 1], b'.' | b':' | b'-') {
        end -= 1;
    }
    end
}

fn unescape_char(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        other => other,
    }
}

/// If `s` is wholly one quoted string, return its unescaped contents.
pub fn unquote(s: &str) -> Option<String> {
    let mut chars = s.chars();
    let quote = chars.next().filter(|q| *q == '"' || *q == '\'')?;
    let mut out = String::new();
    let mut closed = false;
    while let Some(c) = chars.next() {
        if closed {
            return None;
        }
        match c {
            '\\' => out.push(unescape_char(chars.next()?)),
            c if c == quote => closed = true,
            c => out.push(c),
        }
    }
    closed.then_some(out)
}

/// Split `inner` on `sep` at nesting depth zero, honouring `()[]{}`,
/// quotes and backslash escapes.  A single quote only opens a string at
/// the start of an item, so apostrophes in plain text do not.
pub fn split_list(inner: &str, sep: char, first_line: usize) -> Vec<RawItem> {
    if inner.trim().is_empty() {
        return Vec::new();
    }
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0usize;
    let mut line = first_line;
    let mut item_line = first_line;
    let mut push = |piece: &str, line: usize| {
        let trimmed = piece.trim();
        let item = match unquote(trimmed) {
            Some(text) => RawItem { text, quoted: true, line },
            None => RawItem { text: trimmed.to_owned(), quoted: false, line },
        };
        items.push(item);
    };
    for (i, c) in inner.char_indices() {
        if c == '\n' {
            line += 1;
        }
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            c if quote == Some(c) => quote = None,
            _ if quote.is_some() => {}
            '"' => quote = Some(c),
            '\'' if inner[start..i].trim().is_empty() => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            c if c == sep && depth <= 0 => {
                push(&inner[start..i], item_line);
                start = i + c.len_utf8();
                item_line = line;
            }
            _ => {}
        }
    }
    push(&inner[start..], item_line);
    items
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cur(s: &str) -> ParseCursor<'_> {
        ParseCursor::new(s, SourceRef::new("test"))
    }

    // ── names ──

    #[test]
    fn names_drop_trailing_punctuation() {
        let mut c = cur("title. rest");
        assert_eq!(c.read_name(), Some("title"));
        assert_eq!(c.rest(), ". rest");
    }

    #[test]
    fn names_with_increment_suffix() {
        let mut c = cur("x--;");
        assert_eq!(c.read_name(), Some("x--"));
        let mut c = cur("scope+=(a)");
        assert_eq!(c.read_name(), Some("scope+="));
        let mut c = cur("else-if(1)");
        assert_eq!(c.read_name(), Some("else-if"));
    }

    #[test]
    fn operator_names() {
        let mut c = cur("++x more");
        assert_eq!(c.read_name(), Some("++x"));
        let mut c = cur(":=(int, a)");
        assert_eq!(c.read_name(), Some(":="));
        let mut c = cur("(x)");
        assert_eq!(c.read_name(), None);
    }

    // ── lists ──

    #[test]
    fn balanced_with_nesting_and_quotes() {
        let mut c = cur("(a, f(b, c), \"x)y\") tail");
        let (items, _) = c.read_bracketed_list(b'(', b')', ',').unwrap();
        let texts: Vec<_> = items.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(texts, ["a", "f(b, c)", "x)y"]);
        assert!(items[2].quoted);
        assert_eq!(c.rest(), " tail");
    }

    #[test]
    fn empty_list_has_no_items() {
        let mut c = cur("()");
        let (items, raw) = c.read_bracketed_list(b'(', b')', ',').unwrap();
        assert!(items.is_empty());
        assert_eq!(raw, "");
    }

    #[test]
    fn unterminated_paren_reports_line() {
        let mut c = cur("\n\n(a, b");
        c.skip_ws();
        let err = c.read_balanced(b'(', b')', true).unwrap_err();
        assert_eq!(err, ParseError::Unterminated { kind: Delim::Paren, opened_at_line: 3 });
    }

    #[test]
    fn quoted_token_escapes() {
        let mut c = cur(r#""a\"b\n" x"#);
        assert_eq!(c.read_quoted().unwrap(), "a\"b\n");
        assert_eq!(c.rest(), " x");
    }

    #[test]
    fn unquote_rejects_partial_quotes() {
        assert_eq!(unquote("\"abc\""), Some("abc".into()));
        assert_eq!(unquote("'a' + 'b'"), None);
        assert_eq!(unquote("abc"), None);
    }

    #[test]
    fn single_quoted_items_keep_their_commas() {
        let texts = |inner: &str| -> Vec<(String, bool)> {
            split_list(inner, ',', 1).into_iter().map(|i| (i.text, i.quoted)).collect()
        };
        assert_eq!(texts("'a,b', c"), [("a,b".to_owned(), true), ("c".to_owned(), false)]);
        assert_eq!(texts("\"x, 'y\", z"), [("x, 'y".to_owned(), true), ("z".to_owned(), false)]);
        assert_eq!(texts("don't, stop"), [("don't".to_owned(), false), ("stop".to_owned(), false)]);
    }

    // ── blocks ──

    #[test]
    fn block_strips_base_indent() {
        let src = "\t@if(1)\n\t{\n\t\tline one\n\n\t\tline two\n\t}";
        let mut c = cur(src);
        c.pos = src.find('{').unwrap();
        c.line = 2;
        let b = c.read_balanced_block().unwrap();
        assert_eq!(b.text, "\tline one\n\n\tline two");
        assert_eq!(b.line, 3);
        assert_eq!(b.end_line, 6);
    }

    #[test]
    fn block_indentation_mismatch_is_error() {
        let src = "  {\n  ok\n bad\n  }";
        let mut c = cur(src);
        c.pos = 2;
        let err = c.read_balanced_block().unwrap_err();
        assert_eq!(err, ParseError::Indentation { line: 3, expected: "  ".into() });
    }

    #[test]
    fn block_pre_lines_are_exempt() {
        let src = "  {\n  <pre>\nraw\n  </pre>\n  }";
        let mut c = cur(src);
        c.pos = 2;
        let b = c.read_balanced_block().unwrap();
        assert_eq!(b.text, "<pre>\nraw\n</pre>");
    }

    #[test]
    fn single_line_block_is_verbatim() {
        let mut c = cur("{A}else");
        let b = c.read_balanced_block().unwrap();
        assert_eq!(b.text, "A");
        assert_eq!(c.rest(), "else");
    }

    // ── comments ──

    #[test]
    fn pragma_comments_skipped() {
        let mut c = cur("  // one\n /* two\n */ # three\n<#-- four --#> x");
        c.skip_ws_and_pragma_comments().unwrap();
        assert_eq!(c.rest(), "x");
        assert_eq!(c.line, 4);
    }

    #[test]
    fn side_effect_comment_left_in_place() {
        let mut c = cur("  #-- keep --#");
        c.skip_ws_and_pragma_comments().unwrap();
        assert!(c.starts_with("#--"));
    }
}
