//! Dual-dialect stream processor.
//!
//! [`Interpreter::process`] walks a [`ParseCursor`] in either the `N`
//! (text-first) or `F` (statement-first) dialect, recognising comments,
//! escapes, substitutions and call sites, and appends the resulting text to
//! an [`Output`].  Every nested body (blocks, function bodies, included
//! files, parameters) is processed by a fresh recursive call sharing the
//! same interpreter.

use std::path::Path;

use tracing::trace;

use super::builtins::Builtin;
use super::cursor::{ParseCursor, RawItem};
use super::error::{Delim, ErrorKind, Location, ParseError, ScriptError, SourceRef};
use super::interp::{CallFrame, Interpreter};
use super::signal::{ControlSignal, Flow};
use super::store::{FunctionBody, FunctionDef};
use super::value::TypeTag;

/// Nested processing invocations allowed before giving up.
pub const MAX_DEPTH: usize = 256;

// ── Dialect ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Text passes through; `@` introduces calls.
    N,
    /// Everything is a statement; results are emitted on request.
    F,
}

impl Dialect {
    /// `.f` and `.nsf` files are `F`; everything else is `N`.
    pub fn from_path(path: &Path) -> Dialect {
        match path.extension().and_then(|e| e.to_str()) {
            Some("f" | "nsf") => Dialect::F,
            _ => Dialect::N,
        }
    }

    pub fn parse(s: &str) -> Option<Dialect> {
        match s.trim() {
            "n" | "N" => Some(Dialect::N),
            "f" | "F" => Some(Dialect::F),
            _ => None,
        }
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

/// Output text plus the indentation of the line currently being written.
///
/// `indent` mirrors every character written since the last newline (tabs
/// kept, anything else as a space), so that a multi-line substitution can
/// be re-based to the column its call started at.
#[derive(Debug, Clone, Default)]
pub struct Output {
    text: String,
    indent: String,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    pub fn indent(&self) -> &str {
        &self.indent
    }

    fn extend_indent(&mut self, s: &str) {
        self.indent.extend(s.chars().map(|c| if c == '\t' { '\t' } else { ' ' }));
    }

    pub fn push_char(&mut self, c: char) {
        self.text.push(c);
        if c == '\n' {
            self.indent.clear();
        } else {
            self.indent.push(if c == '\t' { '\t' } else { ' ' });
        }
    }

    pub fn push_str(&mut self, s: &str) {
        self.text.push_str(s);
        match s.rfind('\n') {
            Some(i) => {
                self.indent.clear();
                self.extend_indent(&s[i + 1..]);
            }
            None => self.extend_indent(s),
        }
    }

    /// Append `s`, prefixing each of its continuation lines with the
    /// indentation in effect now.  Empty lines stay empty.
    pub fn push_rebased(&mut self, s: &str, rebase: bool) {
        if !rebase || !s.contains('\n') {
            self.push_str(s);
            return;
        }
        let indent = self.indent.clone();
        for (i, line) in s.split('\n').enumerate() {
            if i > 0 {
                self.push_char('\n');
                if !line.is_empty() {
                    self.push_str(&indent);
                }
            }
            self.push_str(line);
        }
    }

    fn line_start(&self) -> usize {
        self.text.rfind('\n').map_or(0, |i| i + 1)
    }

    pub fn current_line_is_blank(&self) -> bool {
        self.text[self.line_start()..].trim().is_empty()
    }

    pub fn truncate_current_line(&mut self) {
        let start = self.line_start();
        self.text.truncate(start);
        self.indent.clear();
    }
}

// ── CallRecord ────────────────────────────────────────────────────────────────

/// A parsed call site.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub name: String,
    pub options: Vec<String>,
    pub params: Vec<RawItem>,
    /// Text between the parentheses, unsplit; `None` when there were none.
    pub raw_params: Option<String>,
    pub location: Location,
    pub dialect: Dialect,
    /// The call is being evaluated as another call's parameter.
    pub as_param: bool,
}

impl CallRecord {
    pub fn has_option(&self, opt: &str) -> bool {
        self.options.iter().any(|o| o == opt)
    }

    pub fn source(&self) -> &SourceRef {
        &self.location.source
    }

    pub fn err(&self, kind: impl Into<ErrorKind>) -> ScriptError {
        ScriptError::new(kind, self.location.clone())
    }
}

/// How a resolved call's result text is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    /// A value: always in `N`, on request in `F`.
    Value,
    /// Text produced by a body whose own statements chose what to emit.
    Structural,
}

/// Attach a source position to a cursor-level parse failure.
pub(crate) fn parse_err(source: &SourceRef, fallback_line: usize, e: ParseError) -> ScriptError {
    let line = match &e {
        ParseError::Unterminated { opened_at_line, .. } => *opened_at_line,
        ParseError::Indentation { line, .. } => *line,
        _ => fallback_line,
    };
    ScriptError::new(e, Location::new(source.clone(), line))
}

/// `++x`, `x++`, `--x`, `x--` → (x, ±1).
fn sniff_increment(name: &str) -> Option<(&str, i32)> {
    if name.len() <= 2 {
        return None;
    }
    if let Some(v) = name.strip_prefix("++") {
        Some((v, 1))
    } else if let Some(v) = name.strip_prefix("--") {
        Some((v, -1))
    } else if let Some(v) = name.strip_suffix("++") {
        Some((v, 1))
    } else {
        name.strip_suffix("--").map(|v| (v, -1))
    }
}

// ── Processing ────────────────────────────────────────────────────────────────

impl Interpreter {
    /// Process the remainder of `cur` in `dialect`, appending to `out`.
    pub fn process(&mut self, cur: &mut ParseCursor<'_>, out: &mut Output, dialect: Dialect) -> Flow {
        if self.depth >= MAX_DEPTH {
            return Err(ScriptError::new(ParseError::TooDeep { limit: MAX_DEPTH }, cur.location()));
        }
        self.depth += 1;
        let result = match dialect {
            Dialect::N => self.process_n(cur, out),
            Dialect::F => self.process_f(cur, out),
        };
        self.depth -= 1;
        result
    }

    /// Process a standalone piece of text and return what it emitted.
    pub fn process_text(
        &mut self,
        text: &str,
        dialect: Dialect,
        source: &SourceRef,
        line: usize,
    ) -> Result<String, ScriptError> {
        let mut cur = ParseCursor::new(text, source.clone()).starting_at(line);
        let mut out = Output::new();
        match self.process(&mut cur, &mut out, dialect)? {
            ControlSignal::Kill => Err(ScriptError::new(ErrorKind::Killed, cur.location())),
            _ => Ok(out.into_string()),
        }
    }

    fn process_n(&mut self, cur: &mut ParseCursor<'_>, out: &mut Output) -> Flow {
        while let Some(c) = cur.peek() {
            match c {
                '@' => {
                    let sig = self.n_at(cur, out)?;
                    if !sig.is_proceed() {
                        return Ok(sig);
                    }
                }
                '\\' => self.escape(cur, out),
                '$' if matches!(cur.byte_at(1), Some(b'[' | b'{')) => self.substitute(cur, out)?,
                '`' => self.backtick(cur, out)?,
                '<' if cur.starts_with("<#--") => self.drop_comment(cur, out)?,
                '<' if cur.starts_with("<!--") => {
                    cur.html_comment_depth += 1;
                    cur.advance(4);
                    out.push_str("<!--");
                }
                '<' if cur.starts_with("<pre")
                    && matches!(cur.byte_at(4), Some(b'>' | b' ' | b'\t' | b'\n')) =>
                {
                    cur.code_block_depth += 1;
                    cur.advance(4);
                    out.push_str("<pre");
                }
                '<' if cur.starts_with("</pre>") => {
                    cur.code_block_depth = cur.code_block_depth.saturating_sub(1);
                    cur.advance(6);
                    out.push_str("</pre>");
                }
                '-' if cur.html_comment_depth > 0 && cur.starts_with("-->") => {
                    cur.html_comment_depth -= 1;
                    cur.advance(3);
                    out.push_str("-->");
                }
                '#' if cur.starts_with("#--") => {
                    let sig = self.silent_comment(cur)?;
                    if !sig.is_proceed() {
                        return Ok(sig);
                    }
                }
                _ => {
                    cur.bump();
                    out.push_char(c);
                }
            }
        }
        Ok(ControlSignal::Proceed)
    }

    fn process_f(&mut self, cur: &mut ParseCursor<'_>, out: &mut Output) -> Flow {
        loop {
            let line = cur.line;
            cur.skip_ws_and_pragma_comments()
                .map_err(|e| parse_err(&cur.source, line, e))?;
            let Some(c) = cur.peek() else {
                return Ok(ControlSignal::Proceed);
            };
            let sig = match c {
                ';' | ',' | '@' => {
                    cur.bump();
                    continue;
                }
                '{' | '}' | '[' | ']' | '(' | ')' => {
                    cur.bump();
                    out.push_char(c);
                    continue;
                }
                '"' | '\'' => {
                    let line = cur.line;
                    let s = cur.read_quoted().map_err(|e| parse_err(&cur.source, line, e))?;
                    out.push_str(&s);
                    continue;
                }
                '\\' => {
                    self.escape(cur, out);
                    continue;
                }
                '$' if matches!(cur.byte_at(1), Some(b'[' | b'{')) => {
                    self.substitute(cur, out)?;
                    continue;
                }
                '`' => {
                    self.backtick(cur, out)?;
                    continue;
                }
                '#' if cur.starts_with("#--") => self.silent_comment(cur)?,
                '-' if cur.starts_with("--//") => self.silent_line(cur)?,
                c if c.is_ascii_digit()
                    || (c == '-' && cur.byte_at(1).is_some_and(|b| b.is_ascii_digit())) =>
                {
                    let rest = cur.rest();
                    let n = 1 + rest[1..]
                        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
                        .unwrap_or(rest.len() - 1);
                    out.push_str(&rest[..n]);
                    cur.advance(n);
                    continue;
                }
                _ => {
                    let line = cur.line;
                    match cur.read_name() {
                        Some(name) => self.dispatch(name, cur, out, Dialect::F, line)?,
                        None => {
                            return Err(ScriptError::new(
                                ParseError::Malformed(format!("unexpected '{c}'")),
                                cur.location(),
                            ))
                        }
                    }
                }
            };
            if !sig.is_proceed() {
                return Ok(sig);
            }
        }
    }

    // ── Escapes and comments ──────────────────────────────────────────────────

    fn escape(&mut self, cur: &mut ParseCursor<'_>, out: &mut Output) {
        cur.advance(1);
        match cur.peek() {
            Some(c @ ('@' | '#' | '$' | '`' | '\\')) => {
                cur.bump();
                out.push_char(c);
            }
            _ => out.push_char('\\'),
        }
    }

    /// `@` in the `N` dialect: a call, an escape or a line comment.
    fn n_at(&mut self, cur: &mut ParseCursor<'_>, out: &mut Output) -> Flow {
        let line = cur.line;
        cur.advance(1);
        if cur.starts_with("//") {
            let blank = out.current_line_is_blank();
            cur.skip_to_eol();
            drop_blank_line(cur, out, blank);
            return Ok(ControlSignal::Proceed);
        }
        if cur.starts_with("--//") {
            return self.silent_line(cur);
        }
        if cur.peek() == Some('\\') {
            cur.advance(1);
            if let Some(c) = cur.bump() {
                out.push_char(c);
            }
            return Ok(ControlSignal::Proceed);
        }
        match cur.read_name() {
            Some(name) => self.dispatch(name, cur, out, Dialect::N, line),
            None => {
                out.push_char('@');
                Ok(ControlSignal::Proceed)
            }
        }
    }

    /// `<#-- … --#>`: dropped, along with its lines when it fills them.
    fn drop_comment(&mut self, cur: &mut ParseCursor<'_>, out: &mut Output) -> Result<(), ScriptError> {
        let line = cur.line;
        let blank = out.current_line_is_blank();
        cur.advance(4);
        cur.skip_past("--#>", Delim::Comment, line)
            .map_err(|e| parse_err(&cur.source, line, e))?;
        drop_blank_line(cur, out, blank);
        Ok(())
    }

    /// `#-- … --#`: the body is processed for its side effects only.
    fn silent_comment(&mut self, cur: &mut ParseCursor<'_>) -> Flow {
        let line = cur.line;
        cur.advance(3);
        let body = cur
            .skip_past("--#", Delim::Comment, line)
            .map_err(|e| parse_err(&cur.source, line, e))?;
        let mut inner = ParseCursor::new(body, cur.source.clone()).starting_at(line);
        self.process(&mut inner, &mut Output::new(), Dialect::N)
    }

    /// `--//…`: the rest of the line is processed for its side effects only.
    fn silent_line(&mut self, cur: &mut ParseCursor<'_>) -> Flow {
        let line = cur.line;
        cur.advance(4);
        let rest = cur.skip_to_eol();
        let mut inner = ParseCursor::new(rest, cur.source.clone()).starting_at(line);
        self.process(&mut inner, &mut Output::new(), Dialect::N)
    }

    // ── Substitutions ─────────────────────────────────────────────────────────

    /// `$[name]` or `${name}`.
    fn substitute(&mut self, cur: &mut ParseCursor<'_>, out: &mut Output) -> Result<(), ScriptError> {
        let line = cur.line;
        let meta = cur.byte_at(1) == Some(b'{');
        cur.advance(1);
        let inner = if meta {
            cur.read_balanced(b'{', b'}', false)
        } else {
            cur.read_balanced(b'[', b']', false)
        }
        .map_err(|e| parse_err(&cur.source, line, e))?;

        let name = if inner.contains(['@', '$', '`']) {
            self.process_text(inner, Dialect::N, &cur.source, line)?.trim().to_owned()
        } else {
            inner.trim().to_owned()
        };
        let location = cur.location_at(line);
        let mut text = self.variable_text(&name, &location)?;
        if meta {
            text = self.process_text(&text, Dialect::N, &cur.source, line)?;
        }
        out.push_rebased(&text, cur.code_block_depth == 0);
        Ok(())
    }

    /// `` `expr` `` (body processed first) or ` ``expr`` ` (verbatim).
    fn backtick(&mut self, cur: &mut ParseCursor<'_>, out: &mut Output) -> Result<(), ScriptError> {
        let line = cur.line;
        let verbatim = cur.starts_with("``");
        let expr = if verbatim {
            cur.advance(2);
            cur.skip_past("``", Delim::Backtick, line)
                .map_err(|e| parse_err(&cur.source, line, e))?
                .to_owned()
        } else {
            cur.advance(1);
            let body = cur
                .skip_past("`", Delim::Backtick, line)
                .map_err(|e| parse_err(&cur.source, line, e))?;
            self.process_text(body, Dialect::N, &cur.source, line)?
        };
        let x = self.eval_numeric(&expr, &cur.location_at(line))?;
        out.push_str(&self.num_format.format(x));
        Ok(())
    }

    // ── Calls ─────────────────────────────────────────────────────────────────

    /// Read the rest of a call header after its name.
    ///
    /// `{options}` are only recognised when directly followed by
    /// `(params)`; otherwise the braces are left for the call's block.
    pub(crate) fn read_call(
        &mut self,
        name: &str,
        cur: &mut ParseCursor<'_>,
        dialect: Dialect,
        line: usize,
    ) -> Result<CallRecord, ScriptError> {
        let mut options = Vec::new();
        if cur.peek_byte() == Some(b'{') {
            let mark = cur.mark();
            let inner = cur
                .read_balanced(b'{', b'}', false)
                .map_err(|e| parse_err(&cur.source, line, e))?;
            if cur.peek_byte() == Some(b'(') {
                options = inner
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
            } else {
                cur.restore(mark);
            }
        }
        let (params, raw_params) = if cur.peek_byte() == Some(b'(') {
            let (items, raw) = cur
                .read_bracketed_list(b'(', b')', ',')
                .map_err(|e| parse_err(&cur.source, line, e))?;
            (items, Some(raw.to_owned()))
        } else {
            (Vec::new(), None)
        };
        Ok(CallRecord {
            name: name.to_owned(),
            options,
            params,
            raw_params,
            location: Location::new(cur.source.clone(), line).through(cur.line),
            dialect,
            as_param: false,
        })
    }

    /// Parse and execute the call named `name`, emitting its result.
    fn dispatch(
        &mut self,
        name: &str,
        cur: &mut ParseCursor<'_>,
        out: &mut Output,
        dialect: Dialect,
        line: usize,
    ) -> Flow {
        let call = self.read_call(name, cur, dialect, line)?;
        trace!(call = %call.name, line, "dispatch");
        let mut res = String::new();
        let (sig, emission) = self.exec_call(&call, cur, &mut res)?;
        if should_emit(&call, emission) {
            out.push_rebased(&res, cur.code_block_depth == 0);
        }
        Ok(sig)
    }

    /// Resolve and run a call; its result text is appended to `res`.
    pub(crate) fn exec_call(
        &mut self,
        call: &CallRecord,
        cur: &mut ParseCursor<'_>,
        res: &mut String,
    ) -> Result<(ControlSignal, Emission), ScriptError> {
        if let Some((var, delta)) = sniff_increment(&call.name) {
            if self.store.lookup(var).is_some() {
                self.step_variable(var, delta, call)?;
                return Ok((ControlSignal::Proceed, Emission::Value));
            }
        }

        if let Some(builtin) = Builtin::lookup(&call.name) {
            let sig = self.run_builtin(builtin, call, cur, res)?;
            return Ok((sig, builtin.emission()));
        }

        if let Some(def) = self.store.lookup_fn(&call.name).cloned() {
            let sig = self.call_function(&def, call, res)?;
            let emission = if def.emits_output { Emission::Structural } else { Emission::Value };
            return Ok((sig, emission));
        }

        if self.store.struct_def(&call.name).is_some() {
            self.declare_from_call(TypeTag::Struct(call.name.clone()), call, 0)?;
            return Ok((ControlSignal::Proceed, Emission::Value));
        }

        if call.dialect == Dialect::F && !call.as_param {
            self.run_external(call)?;
            return Ok((ControlSignal::Proceed, Emission::Value));
        }

        Err(call.err(ErrorKind::UnknownCall(call.name.clone())))
    }

    /// Invoke a user-defined function or vector method.
    pub(crate) fn call_function(
        &mut self,
        def: &FunctionDef,
        call: &CallRecord,
        res: &mut String,
    ) -> Flow {
        let body = match &def.body {
            FunctionBody::Vector { target, method } => {
                return self.vector_method(target, *method, call, res);
            }
            FunctionBody::Source(body) => body,
        };
        let params = self.eval_params(call)?;
        let depth = self.store.depth();
        if !def.is_unscoped {
            let scope = self.store.current_scope().child(&call.name);
            self.store.push_layer(scope);
        }
        self.frames.push(CallFrame {
            name: call.name.clone(),
            params,
            options: call.options.clone(),
        });
        let mut cur = ParseCursor::new(body, def.defined_at.source.clone())
            .starting_at(def.defined_at.line);
        let mut out = Output::new();
        let result = self.process(&mut cur, &mut out, def.dialect);
        self.frames.pop();
        self.store.truncate_to(depth);

        match result? {
            ControlSignal::Return(Some(value)) => res.push_str(&value),
            sig @ (ControlSignal::Quit | ControlSignal::Exit | ControlSignal::Kill) => {
                res.push_str(out.as_str());
                return Ok(sig);
            }
            _ => res.push_str(out.as_str()),
        }
        Ok(ControlSignal::Proceed)
    }

    // ── Parameters ────────────────────────────────────────────────────────────

    /// Text value of one parameter.
    ///
    /// Quoted parameters are literal.  In `F`, a parameter that is exactly
    /// one call is evaluated as that call.  Everything else is processed
    /// with `N` rules and trimmed.
    pub(crate) fn param_text(&mut self, item: &RawItem, call: &CallRecord) -> Result<String, ScriptError> {
        if item.quoted {
            return Ok(item.text.clone());
        }
        if call.dialect == Dialect::F {
            if let Some(text) = self.try_param_call(item, call.source())? {
                return Ok(text);
            }
        }
        if !item.text.contains(['@', '$', '`', '\\', '#', '<']) {
            return Ok(item.text.clone());
        }
        let text = self.process_text(&item.text, Dialect::N, call.source(), item.line)?;
        Ok(text.trim().to_owned())
    }

    pub(crate) fn eval_params(&mut self, call: &CallRecord) -> Result<Vec<String>, ScriptError> {
        call.params.iter().map(|p| self.param_text(p, call)).collect()
    }

    fn try_param_call(
        &mut self,
        item: &RawItem,
        source: &SourceRef,
    ) -> Result<Option<String>, ScriptError> {
        let text = item.text.strip_prefix('@').unwrap_or(&item.text);
        let mut cur = ParseCursor::new(text, source.clone()).starting_at(item.line);
        let Some(name) = cur.read_name() else {
            return Ok(None);
        };
        if !matches!(cur.peek_byte(), Some(b'(' | b'{')) {
            return Ok(None);
        }
        let mut call = self.read_call(name, &mut cur, Dialect::F, item.line)?;
        if call.raw_params.is_none() || !cur.rest().trim().is_empty() {
            return Ok(None);
        }
        call.as_param = true;
        let mut res = String::new();
        self.exec_call(&call, &mut cur, &mut res)?;
        Ok(Some(res))
    }
}

fn should_emit(call: &CallRecord, emission: Emission) -> bool {
    if call.has_option("!o") {
        return false;
    }
    match call.dialect {
        Dialect::N => true,
        Dialect::F => call.has_option("o") || emission == Emission::Structural,
    }
}

/// After a comment, remove its line entirely if nothing else was on it.
fn drop_blank_line(cur: &mut ParseCursor<'_>, out: &mut Output, line_was_blank: bool) {
    if !line_was_blank {
        return;
    }
    let rest = cur.rest();
    let end = rest.find('\n').unwrap_or(rest.len());
    if rest[..end].trim().is_empty() {
        cur.advance((end + 1).min(rest.len()));
        out.truncate_current_line();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::interp::Interpreter;

    fn n(src: &str) -> String {
        Interpreter::for_tests().process_str(src, Dialect::N).expect("process failed")
    }

    fn f(src: &str) -> String {
        Interpreter::for_tests().process_str(src, Dialect::F).expect("process failed")
    }

    fn n_err(src: &str) -> ErrorKind {
        Interpreter::for_tests().process_str(src, Dialect::N).unwrap_err().kind
    }

    // ── output bookkeeping ──

    #[test]
    fn rebase_uses_call_column() {
        let mut out = Output::new();
        out.push_str("\t  ");
        out.push_rebased("a\nb\n\nc", true);
        assert_eq!(out.as_str(), "\t  a\n\t  b\n\n\t  c");
        assert_eq!(out.indent(), "\t  ");
    }

    #[test]
    fn rebase_disabled_passes_through() {
        let mut out = Output::new();
        out.push_str("  ");
        out.push_rebased("a\nb", false);
        assert_eq!(out.as_str(), "  a\nb");
    }

    // ── N dialect ──

    #[test]
    fn literal_text_passes_through() {
        assert_eq!(n("plain <b>text</b>\n  more"), "plain <b>text</b>\n  more");
    }

    #[test]
    fn escapes() {
        assert_eq!(n(r"\@ \$ \# \\ \x"), r"@ $ # \ \x");
        assert_eq!(n("a@\\@b"), "a@b");
    }

    #[test]
    fn declare_then_add() {
        assert_eq!(n("@=(x, int, 5)@+(x, 3)"), "8");
    }

    #[test]
    fn comment_lines_vanish() {
        assert_eq!(n("a\n  @// note\nb"), "a\nb");
        assert_eq!(n("a\n<#-- gone\n --#>\nb"), "a\nb");
        assert_eq!(n("a <#-- x --#> b"), "a  b");
    }

    #[test]
    fn silent_comments_run_side_effects() {
        assert_eq!(n("#-- @:=(int, y=4) --#$[y]"), "4");
        assert_eq!(n("@--// @:=(int, z=2)\n$[z]"), "\n2");
    }

    #[test]
    fn variable_substitution_rebases() {
        let src = "@:=(string, s=\"one\ntwo\")\n  <p>$[s]</p>";
        assert_eq!(n(src), "\n  <p>one\n     two</p>");
    }

    #[test]
    fn pre_disables_rebasing() {
        let src = "@:=(string, s=\"one\ntwo\")<pre>  $[s]</pre>";
        assert_eq!(n(src), "<pre>  one\ntwo</pre>");
    }

    #[test]
    fn meta_substitution_processes_value() {
        assert_eq!(n(r#"@:=(string, t="@+(1, 2)")${t}"#), "3");
        assert_eq!(n(r#"@:=(string, t="@+(1, 2)")$[t]"#), "@+(1, 2)");
    }

    #[test]
    fn backticks() {
        assert_eq!(n("@:=(int, a=4)`a * 2`"), "8");
        assert_eq!(n("``2 ^ 10``"), "1024");
        assert_eq!(n("`@+(1, 1) + 1`"), "3");
    }

    #[test]
    fn bang_o_suppresses_result() {
        assert_eq!(n("[@+{!o}(1, 2)]"), "[]");
    }

    #[test]
    fn undefined_variable() {
        assert_eq!(n_err("$[nope]"), ErrorKind::UndefinedVariable("nope".into()));
    }

    #[test]
    fn unknown_call_in_n() {
        assert_eq!(n_err("@frobnicate(1)"), ErrorKind::UnknownCall("frobnicate".into()));
    }

    #[test]
    fn lone_at_passes_through() {
        assert_eq!(n("a @ b"), "a @ b");
    }

    #[test]
    fn unterminated_comment_reports_open_line() {
        let err = Interpreter::for_tests().process_str("x\n<#-- open", Dialect::N).unwrap_err();
        assert_eq!(err.location.line, 2);
        assert!(matches!(err.kind, ErrorKind::Parse(ParseError::Unterminated { .. })));
    }

    // ── F dialect ──

    #[test]
    fn f_results_need_o() {
        assert_eq!(f("+(1, 2)"), "");
        assert_eq!(f("+{o}(1, 2)"), "3");
    }

    #[test]
    fn f_literals_and_brackets_pass() {
        assert_eq!(f("\"hi\" (1) // gone\n"), "hi(1)");
    }

    #[test]
    fn f_nested_call_params() {
        assert_eq!(f(":=(int, x=2); console{o}(+(x, 3))"), "");
        assert_eq!(f(":=(int, x=2)\n+{o}(*(x, 3), 1)"), "7");
    }

    #[test]
    fn f_increment_statements() {
        assert_eq!(f("int(i=1)\ni++\n++i\n+{o}(i)"), "3");
    }

    // ── properties ──

    #[test]
    fn too_deep_is_parse_error() {
        let err = Interpreter::for_tests()
            .process_str("@function(r){@r()}@r()", Dialect::N)
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Parse(ParseError::TooDeep { .. })));
    }

    #[test]
    fn sniff() {
        assert_eq!(sniff_increment("++x"), Some(("x", 1)));
        assert_eq!(sniff_increment("y--"), Some(("y", -1)));
        assert_eq!(sniff_increment("++"), None);
    }

    mod call_header {
        use proptest::prelude::*;

        use super::*;

        fn param() -> impl Strategy<Value = String> {
            prop_oneof!["[a-z0-9 ]{0,5}", "[a-z]{1,3}\\([a-z, ]{0,4}\\)", "\"[a-z,(){} ]{0,5}\""]
        }

        proptest! {
            /// After `@name{opts}(params){block}` the cursor sits just past
            /// the block's closing brace.
            #[test]
            fn cursor_stops_after_block(
                name in "[a-z][a-z0-9_]{0,6}",
                options in prop::collection::vec("[a-z!]{1,3}", 0..3),
                params in prop::collection::vec(param(), 0..4),
                body in "[a-z $.,]{0,10}",
                tail in "[a-z <>.,]{0,8}",
            ) {
                let opts = if options.is_empty() { String::new() } else { format!("{{{}}}", options.join(", ")) };
                let header = format!("@{name}{opts}({}){{{body}}}", params.join(", "));
                let input = format!("{header}{tail}");

                let mut interp = Interpreter::for_tests();
                let mut cur = ParseCursor::new(&input, SourceRef::new("t"));
                cur.bump();
                prop_assert_eq!(cur.read_name(), Some(name.as_str()));
                let call = interp.read_call(&name, &mut cur, Dialect::N, 1).unwrap();
                prop_assert_eq!(&call.options, &options);
                let joined_params = params.join(", ");
                prop_assert_eq!(call.raw_params.as_deref(), Some(joined_params.as_str()));
                let block = interp.read_block(&mut cur, &call).unwrap();
                prop_assert_eq!(block.text, body);
                prop_assert_eq!(cur.pos, header.len());
                prop_assert_eq!(cur.rest(), tail.as_str());
            }
        }
    }
}
