//! Template interpreter.
//!
//! One [`Interpreter`] renders one build target.  It owns the variable
//! [`Store`], the call-frame stack, the open-stream table, the dependency
//! set and the pagination state, and it implements [`SymbolTable`] so the
//! numeric engine can read and write template variables directly.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tracing::{debug, info_span};

use super::cursor::{Block, ParseCursor};
use super::error::{ErrorKind, Location, ParseError, ScriptError, SourceRef};
use super::expr::{self, SymbolKind, SymbolTable};
use super::paginate::PagesInfo;
use super::processor::{parse_err, CallRecord, Dialect, Output};
use super::signal::ControlSignal;
use super::store::{DeclOptions, Store};
use super::value::{NumFormat, StreamId, TypeTag, Value};
use crate::console::{Console, UserLock};
use crate::tracked::TrackedInfo;

// ── Call frames ───────────────────────────────────────────────────────────────

/// Parameters and options of the user function currently executing.
#[derive(Debug, Clone, Default)]
pub struct CallFrame {
    pub name: String,
    pub params: Vec<String>,
    pub options: Vec<String>,
}

// ── Streams ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum OpenStream {
    Reader(BufReader<File>),
    Writer(File),
    Both(BufReader<File>, File),
}

// ── BuildOutput ───────────────────────────────────────────────────────────────

/// Everything a successful build produced.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    /// Page 1: the target's own output file.
    pub output: String,
    /// Pages 2.. in order.
    pub extra_pages: Vec<String>,
    /// Directory pages 2.. are written to.
    pub pages_dir: PathBuf,
    /// Every file read while building, in first-read order.
    pub deps: Vec<PathBuf>,
}

// ── Interpreter ───────────────────────────────────────────────────────────────

pub struct Interpreter {
    pub store: Store,
    pub num_format: NumFormat,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) pages: PagesInfo,
    pub(crate) deps: Vec<PathBuf>,
    /// Files currently being processed, outermost first.
    pub(crate) reading: Vec<PathBuf>,
    pub(crate) console: Console,
    pub(crate) console_lock: Option<UserLock>,
    pub(crate) streams: HashMap<StreamId, OpenStream>,
    next_stream: u32,
    /// Base directory for relative paths; changed by `cd`.
    pub(crate) cwd: PathBuf,
    pub(crate) content_path: Option<PathBuf>,
    pub(crate) depth: usize,
    pub(crate) kill_site: Option<Location>,
    #[cfg(feature = "lua")]
    pub(crate) lua: Option<crate::lua::LuaEngine>,
}

impl Interpreter {
    pub fn new(console: Console, root: impl Into<PathBuf>) -> Self {
        Interpreter {
            store: Store::new(),
            num_format: NumFormat::default(),
            frames: Vec::new(),
            pages: PagesInfo::default(),
            deps: Vec::new(),
            reading: Vec::new(),
            console,
            console_lock: None,
            streams: HashMap::new(),
            next_stream: 1,
            cwd: root.into(),
            content_path: None,
            depth: 0,
            kill_site: None,
            #[cfg(feature = "lua")]
            lua: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let (console, _) = Console::captured();
        Interpreter::new(console, std::env::temp_dir())
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    /// Render one tracked target, including pagination.
    pub fn build(&mut self, info: &TrackedInfo) -> Result<BuildOutput, ScriptError> {
        let _span = info_span!("build", name = %info.name).entered();
        let at = Location::new(SourceRef::new(info.template_path.display().to_string()), 0);
        let fixed = [
            ("name", info.name.clone()),
            ("title", info.title.clone()),
            ("content_path", info.content_path.display().to_string()),
            ("output_path", info.output_path.display().to_string()),
            ("template_path", info.template_path.display().to_string()),
        ];
        for (name, value) in fixed {
            let opts = DeclOptions { constant: true, ..DeclOptions::default() };
            self.store
                .declare(name, TypeTag::Str, Value::Str(value), opts)
                .map_err(|e| ScriptError::new(e, at.clone()))?;
        }
        self.content_path = Some(self.resolve(&info.content_path));
        self.pages.pages_dir = info.default_pages_dir();

        let template = self.resolve(&info.template_path);
        let rendered = self.include(&template, false, &at);
        let unlocked = self.finish();
        let (text, sig) = match (rendered, unlocked) {
            (Ok(rendered), Ok(())) => rendered,
            (Ok(_), Err(lock)) => return Err(lock),
            (Err(err), unlocked) => {
                if let Err(lock) = unlocked {
                    self.report(&lock);
                }
                return Err(err);
            }
        };
        if sig == ControlSignal::Kill {
            return Err(self.killed(at));
        }

        let (output, extra_pages) = self.render_pages(text, &at)?;
        debug!(deps = self.deps.len(), pages = extra_pages.len() + 1, "build finished");
        Ok(BuildOutput {
            output,
            extra_pages,
            pages_dir: self.pages.pages_dir.clone(),
            deps: std::mem::take(&mut self.deps),
        })
    }

    /// Process a script file for its output, in the dialect its extension
    /// selects.
    pub fn run_file(&mut self, path: &Path) -> Result<String, ScriptError> {
        self.run_file_as(path, None)
    }

    /// Like [`run_file`](Self::run_file), with the dialect forced when
    /// `dialect` is given.
    pub fn run_file_as(&mut self, path: &Path, dialect: Option<Dialect>) -> Result<String, ScriptError> {
        let at = Location::new(SourceRef::new(path.display().to_string()), 0);
        let path = self.resolve(path);
        let (text, sig) = self.include_as(&path, false, dialect, &at)?;
        if sig == ControlSignal::Kill {
            return Err(self.killed(at));
        }
        Ok(text)
    }

    /// Process a string of template source.
    pub fn process_str(&mut self, src: &str, dialect: Dialect) -> Result<String, ScriptError> {
        self.process_str_signal(src, dialect).map(|(text, _)| text)
    }

    /// Like [`process_str`](Self::process_str), also reporting whether the
    /// source asked to stop (`quit`, `exit`).
    pub fn process_str_signal(
        &mut self,
        src: &str,
        dialect: Dialect,
    ) -> Result<(String, ControlSignal), ScriptError> {
        self.process_entry(src, dialect, &SourceRef::new("<input>"), 1)
    }

    /// Process `src` as if it started on `line` of `source`.
    pub fn process_entry(
        &mut self,
        src: &str,
        dialect: Dialect,
        source: &SourceRef,
        line: usize,
    ) -> Result<(String, ControlSignal), ScriptError> {
        let mut cur = ParseCursor::new(src, source.clone()).starting_at(line);
        let mut out = Output::new();
        let sig = self.process(&mut cur, &mut out, dialect)?;
        if sig == ControlSignal::Kill {
            return Err(self.killed(Location::new(source.clone(), cur.line)));
        }
        Ok((out.into_string(), sig))
    }

    /// End-of-build checks: a console lock still held is released and
    /// reported.
    pub fn finish(&mut self) -> Result<(), ScriptError> {
        self.streams.clear();
        match self.console_lock.take() {
            Some(lock) => {
                let location = lock.location.clone();
                drop(lock);
                Err(ScriptError::new(ErrorKind::ConsoleStillLocked(location.clone()), location))
            }
            None => Ok(()),
        }
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn deps(&self) -> &[PathBuf] {
        &self.deps
    }

    // ── Files ─────────────────────────────────────────────────────────────────

    pub(crate) fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    pub(crate) fn add_dep(&mut self, path: &Path) {
        if !self.deps.iter().any(|d| d == path) {
            self.deps.push(path.to_path_buf());
        }
    }

    /// Read `path` and, unless `raw`, process it in the dialect its
    /// extension selects.  Loop-ending signals stop at the file boundary.
    pub(crate) fn include(
        &mut self,
        path: &Path,
        raw: bool,
        at: &Location,
    ) -> Result<(String, ControlSignal), ScriptError> {
        self.include_as(path, raw, None, at)
    }

    fn include_as(
        &mut self,
        path: &Path,
        raw: bool,
        dialect: Option<Dialect>,
        at: &Location,
    ) -> Result<(String, ControlSignal), ScriptError> {
        if self.reading.iter().any(|p| p == path) {
            return Err(ScriptError::new(ErrorKind::Cycle(path.display().to_string()), at.clone()));
        }
        let text = fs::read_to_string(path)
            .map_err(|e| ScriptError::io(&e, path.display(), at.clone()))?;
        self.add_dep(path);
        if raw {
            return Ok((text, ControlSignal::Proceed));
        }
        debug!(path = %path.display(), "include");
        self.reading.push(path.to_path_buf());
        let mut cur = ParseCursor::new(&text, SourceRef::new(path.display().to_string()));
        let mut out = Output::new();
        let dialect = dialect.unwrap_or_else(|| Dialect::from_path(path));
        let result = self.process(&mut cur, &mut out, dialect);
        self.reading.pop();
        let sig = match result? {
            sig @ (ControlSignal::Quit | ControlSignal::Exit | ControlSignal::Kill) => sig,
            _ => ControlSignal::Proceed,
        };
        Ok((out.into_string(), sig))
    }

    pub(crate) fn killed(&self, fallback: Location) -> ScriptError {
        ScriptError::new(ErrorKind::Killed, self.kill_site.clone().unwrap_or(fallback))
    }

    // ── Streams ───────────────────────────────────────────────────────────────

    pub(crate) fn insert_stream(&mut self, stream: OpenStream) -> StreamId {
        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        self.streams.insert(id, stream);
        id
    }

    // ── Console ───────────────────────────────────────────────────────────────

    pub(crate) fn print(&self, text: &str) {
        self.console.print(self.console_lock.as_ref(), text);
    }

    pub(crate) fn warn(&self, location: &Location, msg: &str) {
        self.console.warning(self.console_lock.as_ref(), location, msg);
    }

    pub(crate) fn report(&self, err: &ScriptError) {
        self.console.error(self.console_lock.as_ref(), err);
    }

    // ── Blocks ────────────────────────────────────────────────────────────────

    /// Read the `{…}` block that must follow `call`.
    pub(crate) fn read_block(
        &mut self,
        cur: &mut ParseCursor<'_>,
        call: &CallRecord,
    ) -> Result<Block, ScriptError> {
        self.optional_block(cur)?.ok_or_else(|| {
            call.err(ParseError::Malformed(format!("{}: expected a {{…}} block", call.name)))
        })
    }

    pub(crate) fn optional_block(
        &mut self,
        cur: &mut ParseCursor<'_>,
    ) -> Result<Option<Block>, ScriptError> {
        let mark = cur.mark();
        cur.skip_ws();
        if cur.peek_byte() != Some(b'{') {
            cur.restore(mark);
            return Ok(None);
        }
        let line = cur.line;
        cur.read_balanced_block()
            .map(Some)
            .map_err(|e| parse_err(&cur.source, line, e))
    }

    /// Run a block in `call`'s dialect, in a new layer unless `scoped` is
    /// off.  Its output is appended to `res`.
    pub(crate) fn run_block(
        &mut self,
        block: &Block,
        call: &CallRecord,
        res: &mut String,
        scoped: bool,
    ) -> Result<ControlSignal, ScriptError> {
        let depth = self.store.depth();
        if scoped {
            let scope = self.store.current_scope().clone();
            self.store.push_layer(scope);
        }
        let mut cur = ParseCursor::new(&block.text, call.source().clone()).starting_at(block.line);
        let mut out = Output::new();
        let result = self.process(&mut cur, &mut out, call.dialect);
        self.store.truncate_to(depth);
        res.push_str(out.as_str());
        result
    }

    // ── Variables ─────────────────────────────────────────────────────────────

    fn index_value(&self, idx: &str) -> Option<usize> {
        let idx = idx.trim();
        if let Ok(n) = idx.parse::<usize>() {
            return Some(n);
        }
        let x = self
            .frame_value(idx)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .or_else(|| self.store.lookup(idx).and_then(|b| b.value.as_f64()))?;
        (x >= 0.0 && x.fract() == 0.0).then_some(x as usize)
    }

    /// `params[i]`, `options[i]`, `params.size`, `options.size` of the
    /// innermost call frame.
    pub(crate) fn frame_value(&self, name: &str) -> Option<String> {
        let frame = self.frames.last()?;
        match name {
            "params.size" => return Some(frame.params.len().to_string()),
            "options.size" => return Some(frame.options.len().to_string()),
            _ => {}
        }
        let (base, idx) = split_index(name)?;
        let list = match base {
            "params" => &frame.params,
            "options" => &frame.options,
            _ => return None,
        };
        list.get(self.index_value(idx)?).cloned()
    }

    /// Text of `$[name]`.
    pub(crate) fn variable_text(&self, name: &str, at: &Location) -> Result<String, ScriptError> {
        if let Some(v) = self.frame_value(name) {
            return Ok(v);
        }
        if let Some(b) = self.store.lookup(name) {
            return Ok(b.value.render(&self.num_format));
        }
        if let Some((base, idx)) = split_index(name) {
            if let Some(b) = self.store.lookup(base) {
                let i = self
                    .index_value(idx)
                    .ok_or_else(|| ScriptError::new(ErrorKind::Type(format!("bad index '{idx}'")), at.clone()))?;
                let out_of_range = || {
                    ScriptError::new(
                        ErrorKind::Type(format!("{base}: index {i} out of range")),
                        at.clone(),
                    )
                };
                return match &b.value {
                    Value::DoubleVec(v) => v.get(i).map(|x| self.num_format.format(*x)).ok_or_else(out_of_range),
                    Value::Str(s) => s.chars().nth(i).map(String::from).ok_or_else(out_of_range),
                    _ => Err(ScriptError::new(
                        ErrorKind::Type(format!("{base} of type {} cannot be indexed", b.ty)),
                        at.clone(),
                    )),
                };
            }
        }
        Err(ScriptError::new(ErrorKind::UndefinedVariable(name.to_owned()), at.clone()))
    }

    /// Evaluate `text` with the numeric engine.
    pub(crate) fn eval_numeric(&mut self, text: &str, at: &Location) -> Result<f64, ScriptError> {
        expr::eval_str(text, self).map_err(|d| {
            ScriptError::new(
                ErrorKind::External { what: "exprtk".into(), diagnostic: d.to_string() },
                at.clone(),
            )
        })
    }
}

/// `name[idx]` → (`name`, `idx`).
pub(crate) fn split_index(name: &str) -> Option<(&str, &str)> {
    let inner = name.strip_suffix(']')?;
    let open = inner.find('[')?;
    Some((&inner[..open], &inner[open + 1..]))
}

// ── SymbolTable ───────────────────────────────────────────────────────────────

impl SymbolTable for Interpreter {
    fn symbol(&self, name: &str) -> Option<SymbolKind> {
        if let Some(v) = self.frame_value(name) {
            return Some(if v.trim().parse::<f64>().is_ok() {
                SymbolKind::Scalar
            } else {
                SymbolKind::Str
            });
        }
        match &self.store.lookup(name)?.value {
            Value::DoubleVec(_) => Some(SymbolKind::Vector),
            Value::Str(_) => Some(SymbolKind::Str),
            Value::Bool(_) | Value::Int(_) | Value::Double(_) | Value::Char(_) | Value::Int64(_) => {
                Some(SymbolKind::Scalar)
            }
            _ => None,
        }
    }

    fn scalar(&self, name: &str) -> Option<f64> {
        match self.frame_value(name) {
            Some(v) => v.trim().parse().ok(),
            None => self.store.lookup(name)?.value.as_f64(),
        }
    }

    fn vector(&self, name: &str) -> Option<Vec<f64>> {
        match &self.store.lookup(name)?.value {
            Value::DoubleVec(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn string(&self, name: &str) -> Option<String> {
        match self.frame_value(name) {
            Some(v) => Some(v),
            None => Some(self.store.lookup(name)?.value.render(&self.num_format)),
        }
    }

    fn set_scalar(&mut self, name: &str, value: f64) -> Result<(), String> {
        let current = self.store.lookup(name).map(|b| b.ty.clone());
        let typed = match current {
            Some(TypeTag::Int) if value.fract() == 0.0 => Value::Int(value as i32),
            Some(TypeTag::Int64) if value.fract() == 0.0 => Value::Int64(value as i64),
            Some(TypeTag::Bool) => Value::Bool(value != 0.0),
            Some(TypeTag::Char) => match char::from_u32(value as u32) {
                Some(c) => Value::Char(c),
                None => return Err(format!("{value} is not a char")),
            },
            _ => Value::Double(value),
        };
        self.store.assign_value(name, typed).map_err(|e| e.to_string())
    }

    fn set_element(&mut self, name: &str, index: usize, value: f64) -> Result<(), String> {
        match self.store.value_mut(name).map_err(|e| e.to_string())? {
            Value::DoubleVec(v) => match v.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(format!("{name}: index {index} out of range")),
            },
            _ => Err(format!("{name} is not a vector")),
        }
    }

    fn set_string(&mut self, name: &str, value: String) -> Result<(), String> {
        self.store.assign_value(name, Value::Str(value)).map_err(|e| e.to_string())
    }

    fn print(&mut self, text: &str) {
        Interpreter::print(self, text);
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        self.resolve(path)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::store::DeclOptions;

    #[test]
    fn split_index_forms() {
        assert_eq!(split_index("v[2]"), Some(("v", "2")));
        assert_eq!(split_index("params[i]"), Some(("params", "i")));
        assert_eq!(split_index("plain"), None);
    }

    #[test]
    fn vector_and_string_indexing() {
        let mut interp = Interpreter::for_tests();
        let out = interp
            .process_str("@:=(vector, v=\"1, 2.5\")@:=(string, s=abc)$[v[1]] $[s[2]]", Dialect::N)
            .unwrap();
        assert_eq!(out, "2.5 c");
    }

    #[test]
    fn index_out_of_range_is_type_error() {
        let mut interp = Interpreter::for_tests();
        let err = interp.process_str("@:=(vector, v)$[v[0]]", Dialect::N).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Type(_)));
    }

    #[test]
    fn engine_writes_keep_binding_type() {
        let mut interp = Interpreter::for_tests();
        interp
            .store
            .declare("n", TypeTag::Int, Value::Int(1), DeclOptions::default())
            .unwrap();
        let at = Location::new(SourceRef::new("t"), 1);
        interp.eval_numeric("n := n + 4", &at).unwrap();
        assert_eq!(interp.store.lookup("n").unwrap().value, Value::Int(5));
    }

    #[test]
    fn finish_reports_held_lock_once() {
        let mut interp = Interpreter::for_tests();
        interp.process_str("@console.lock()", Dialect::N).unwrap();
        let err = interp.finish().unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ConsoleStillLocked(_)));
        assert_eq!(err.location.line, 1);
        assert!(interp.finish().is_ok());
    }

    #[test]
    fn include_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.html");
        fs::write(&a, "x@input(\"a.html\")").unwrap();
        let (console, _) = Console::captured();
        let mut interp = Interpreter::new(console, dir.path());
        let err = interp.run_file(Path::new("a.html")).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Cycle(_)));
    }

    #[test]
    fn deps_are_unique_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.html"), "B").unwrap();
        fs::write(dir.path().join("c.html"), "C").unwrap();
        fs::write(
            dir.path().join("a.html"),
            "@input(\"c.html\")@input(\"b.html\")@input(\"c.html\")",
        )
        .unwrap();
        let (console, _) = Console::captured();
        let mut interp = Interpreter::new(console, dir.path());
        assert_eq!(interp.run_file(Path::new("a.html")).unwrap(), "CBC");
        let names: Vec<_> = interp
            .deps()
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["a.html", "c.html", "b.html"]);
    }
}
