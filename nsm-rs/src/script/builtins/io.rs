//! Console, stream and file input/output built-ins.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use tracing::debug;

use crate::console::Console;
use crate::script::error::{ErrorKind, ScriptError};
use crate::script::interp::{Interpreter, OpenStream};
use crate::script::processor::CallRecord;
use crate::script::signal::{ControlSignal, Flow};
use crate::script::value::{StreamId, TypeTag, Value};

use super::flag;

/// Read one whitespace-delimited token, or `None` at end of input.
fn read_token(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut token = Vec::new();
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            break;
        }
        let mut used = 0;
        let mut done = false;
        for &b in buf {
            if b.is_ascii_whitespace() {
                if token.is_empty() {
                    used += 1;
                    continue;
                }
                done = true;
                break;
            }
            token.push(b);
            used += 1;
        }
        reader.consume(used);
        if done {
            break;
        }
    }
    Ok((!token.is_empty()).then(|| String::from_utf8_lossy(&token).into_owned()))
}

/// Read one line without its terminator, or `None` at end of input.
fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\n', '\r']).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
        _ => Ok(()),
    }
}

impl Interpreter {
    // ── Console ───────────────────────────────────────────────────────────────

    /// `console(params…)`: the params, concatenated, as one line.
    pub(super) fn console_print(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let text: String = self.eval_params(call)?.concat();
        self.print(&format!("{text}\n"));
        Ok(())
    }

    pub(super) fn console_lock_acquire(&mut self, call: &CallRecord) {
        if self.console_lock.is_none() {
            self.console_lock = Some(Console::lock(call.location.clone()));
        }
    }

    pub(super) fn console_lock_release(&mut self, _call: &CallRecord) {
        self.console_lock = None;
    }

    // ── Streams ───────────────────────────────────────────────────────────────

    /// The open stream held by the variable `name`.
    fn stream_of(&self, name: &str, call: &CallRecord) -> Result<StreamId, ScriptError> {
        let binding = self
            .store
            .lookup(name)
            .ok_or_else(|| call.err(ErrorKind::UndefinedVariable(name.to_owned())))?;
        match &binding.value {
            Value::Stream(_, Some(id)) if self.streams.contains_key(id) => Ok(*id),
            Value::Stream(..) => Err(call.err(ErrorKind::Io(format!("{name}: stream is not open")))),
            _ => Err(call.err(ErrorKind::Type(format!("{name} of type {} is not a stream", binding.ty)))),
        }
    }

    fn is_stream_var(&self, name: &str) -> bool {
        self.store.lookup(name).is_some_and(|b| b.ty.is_stream())
    }

    /// Open `path` on the stream variable `name`, closing whatever it held.
    pub(crate) fn open_stream(&mut self, name: &str, path: &str, call: &CallRecord) -> Result<(), ScriptError> {
        let binding = self
            .store
            .lookup(name)
            .ok_or_else(|| call.err(ErrorKind::UndefinedVariable(name.to_owned())))?;
        let ty = binding.ty.clone();
        let previous = match &binding.value {
            Value::Stream(_, id) => *id,
            _ => return Err(call.err(ErrorKind::Type(format!("{name} of type {ty} is not a stream")))),
        };
        let full = self.resolve(path.trim());
        let io_err = |e: io::Error| ScriptError::io(&e, full.display(), call.location.clone());
        let stream = match &ty {
            TypeTag::IStream => {
                let file = File::open(&full).map_err(io_err)?;
                self.add_dep(&full);
                OpenStream::Reader(BufReader::new(file))
            }
            TypeTag::OStream => {
                create_parent(&full).map_err(io_err)?;
                OpenStream::Writer(File::create(&full).map_err(io_err)?)
            }
            _ => {
                create_parent(&full).map_err(io_err)?;
                let file = OpenOptions::new()
                    .read(true)
                    .append(true)
                    .create(true)
                    .open(&full)
                    .map_err(io_err)?;
                let writer = file.try_clone().map_err(io_err)?;
                OpenStream::Both(BufReader::new(file), writer)
            }
        };
        if let Some(old) = previous {
            self.streams.remove(&old);
        }
        let id = self.insert_stream(stream);
        debug!(stream = name, path = %full.display(), "open");
        self.store
            .assign_value(name, Value::Stream(ty, Some(id)))
            .map_err(|e| call.err(e))
    }

    /// `open(stream, path)`
    pub(super) fn open(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let params = self.eval_params(call)?;
        self.open_stream(params[0].trim(), &params[1], call)
    }

    /// `close(stream)`
    pub(super) fn close(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let name = self.first_param(call)?.trim().to_owned();
        let id = self.stream_of(&name, call)?;
        self.streams.remove(&id);
        let ty = self.store.lookup(&name).map_or(TypeTag::IStream, |b| b.ty.clone());
        self.store
            .assign_value(&name, Value::Stream(ty, None))
            .map_err(|e| call.err(e))
    }

    /// `eof(stream)`: `1` once nothing is left to read.
    pub(super) fn eof(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let name = self.first_param(call)?.trim().to_owned();
        let id = self.stream_of(&name, call)?;
        let at_end = match self.streams.get_mut(&id) {
            Some(OpenStream::Reader(r) | OpenStream::Both(r, _)) => r
                .fill_buf()
                .map(<[u8]>::is_empty)
                .map_err(|e| ScriptError::io(&e, &name, call.location.clone()))?,
            _ => true,
        };
        res.push_str(flag(at_end));
        Ok(())
    }

    fn reader_of(&mut self, name: &str, call: &CallRecord) -> Result<&mut BufReader<File>, ScriptError> {
        let id = self.stream_of(name, call)?;
        match self.streams.get_mut(&id) {
            Some(OpenStream::Reader(r) | OpenStream::Both(r, _)) => Ok(r),
            _ => Err(call.err(ErrorKind::Type(format!("{name} is not open for reading")))),
        }
    }

    /// `read(path)` emits the file's text; `read(stream, var)` reads the
    /// next whitespace-delimited token into `var`.
    pub(super) fn read(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let params = self.eval_params(call)?;
        if let [stream, var] = params.as_slice() {
            let (stream, var) = (stream.trim(), var.trim());
            let token = read_token(self.reader_of(stream, call)?)
                .map_err(|e| ScriptError::io(&e, stream, call.location.clone()))?;
            return self
                .store
                .assign(var, &token.unwrap_or_default())
                .map_err(|e| call.err(e));
        }
        let path = self.resolve(params[0].trim());
        let text = fs::read_to_string(&path)
            .map_err(|e| ScriptError::io(&e, path.display(), call.location.clone()))?;
        self.add_dep(&path);
        res.push_str(&text);
        Ok(())
    }

    /// `getline(console|stream, var)`
    pub(super) fn getline(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let params = self.eval_params(call)?;
        let (source, var) = (params[0].trim(), params[1].trim());
        let line = if source == "console" && !self.is_stream_var(source) {
            read_line(&mut io::stdin().lock())
        } else {
            read_line(self.reader_of(source, call)?)
        }
        .map_err(|e| ScriptError::io(&e, source, call.location.clone()))?;
        self.store.assign(var, &line.unwrap_or_default()).map_err(|e| call.err(e))
    }

    /// `write{app}(path|stream, text…)`
    pub(super) fn write(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let params = self.eval_params(call)?;
        let target = params[0].trim();
        let text: String = params[1..].concat();
        if self.is_stream_var(target) {
            let id = self.stream_of(target, call)?;
            let result = match self.streams.get_mut(&id) {
                Some(OpenStream::Writer(w) | OpenStream::Both(_, w)) => w.write_all(text.as_bytes()),
                _ => return Err(call.err(ErrorKind::Type(format!("{target} is not open for writing")))),
            };
            return result.map_err(|e| ScriptError::io(&e, target, call.location.clone()));
        }
        let path = self.resolve(target);
        let io_err = |e: io::Error| ScriptError::io(&e, path.display(), call.location.clone());
        create_parent(&path).map_err(io_err)?;
        let mut file = if call.has_option("app") {
            OpenOptions::new().append(true).create(true).open(&path)
        } else {
            File::create(&path)
        }
        .map_err(io_err)?;
        file.write_all(text.as_bytes()).map_err(io_err)
    }

    // ── Files ─────────────────────────────────────────────────────────────────

    /// `input{if-exists, raw}(path)`: the file's processed (or raw) text.
    pub(super) fn input(&mut self, call: &CallRecord, res: &mut String) -> Flow {
        let target = self.first_param(call)?;
        let path = self.resolve(target.trim());
        if call.has_option("if-exists") && !path.is_file() {
            return Ok(ControlSignal::Proceed);
        }
        let (text, sig) = self.include(&path, call.has_option("raw"), &call.location)?;
        res.push_str(&text);
        Ok(sig)
    }

    /// `content{raw}()`: the current target's content file.
    pub(super) fn content(&mut self, call: &CallRecord, res: &mut String) -> Flow {
        let path = self
            .content_path
            .clone()
            .ok_or_else(|| call.err(ErrorKind::Config("content() outside of a page build".into())))?;
        let (text, sig) = self.include(&path, call.has_option("raw"), &call.location)?;
        res.push_str(&text);
        Ok(sig)
    }

    /// `dep(paths…)`: record extra dependencies.
    pub(super) fn dep(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        for p in self.eval_params(call)? {
            let path = self.resolve(p.trim());
            self.add_dep(&path);
        }
        Ok(())
    }

    /// `precision(n)` sets the significant digits; `precision()` reports
    /// them.
    pub(super) fn precision(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        if call.params.is_empty() {
            if let Some(p) = self.num_format.precision {
                res.push_str(&p.to_string());
            }
            return Ok(());
        }
        let text = self.first_param(call)?;
        let n = text
            .trim()
            .parse::<usize>()
            .map_err(|_| call.err(ErrorKind::Type(format!("precision: '{}' is not a count", text.trim()))))?;
        self.num_format.precision = Some(n);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;

    use super::{read_line, read_token};
    use crate::console::Console;
    use crate::script::error::ErrorKind;
    use crate::script::interp::Interpreter;
    use crate::script::processor::Dialect;

    fn in_dir(dir: &std::path::Path) -> (Interpreter, std::sync::Arc<std::sync::Mutex<String>>) {
        let (console, buf) = Console::captured();
        (Interpreter::new(console, dir), buf)
    }

    #[test]
    fn tokens_and_lines() {
        let mut r = Cursor::new("  alpha beta\n gamma");
        assert_eq!(read_token(&mut r).unwrap().as_deref(), Some("alpha"));
        assert_eq!(read_token(&mut r).unwrap().as_deref(), Some("beta"));
        assert_eq!(read_line(&mut r).unwrap().as_deref(), Some(""));
        assert_eq!(read_line(&mut r).unwrap().as_deref(), Some(" gamma"));
        assert_eq!(read_line(&mut r).unwrap(), None);
        assert_eq!(read_token(&mut r).unwrap(), None);
    }

    #[test]
    fn console_prints_a_line() {
        let dir = tempfile::tempdir().unwrap();
        let (mut interp, buf) = in_dir(dir.path());
        let out = interp.process_str("@console(a, \" b\")x", Dialect::N).unwrap();
        assert_eq!(out, "x");
        assert_eq!(*buf.lock().unwrap(), "a b\n");
    }

    #[test]
    fn write_then_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut interp, _) = in_dir(dir.path());
        let out = interp
            .process_str("@write(out/a.txt, one)@write{app}(out/a.txt, \" two\")@read(out/a.txt)", Dialect::N)
            .unwrap();
        assert_eq!(out, "one two");
        assert_eq!(fs::read_to_string(dir.path().join("out/a.txt")).unwrap(), "one two");
    }

    #[test]
    fn stream_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (mut interp, _) = in_dir(dir.path());
        let src = "@ofstream(o=\"s.txt\")@write(o, \"x y\n\", \"second line\n\")@close(o)\
                   @ifstream(i=\"s.txt\")@string(w, l)\
                   @read(i, w)$[w]|@getline(i, l)[$[l]]@getline(i, l)$[l]|@eof(i)";
        let out = interp.process_str(src, Dialect::N).unwrap();
        assert_eq!(out, "x|[ y]second line|1");
    }

    #[test]
    fn closed_stream_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut interp, _) = in_dir(dir.path());
        fs::write(dir.path().join("f.txt"), "t").unwrap();
        let err = interp
            .process_str("@ifstream(i)@open(i, f.txt)@close(i)@eof(i)", Dialect::N)
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Io(_)));
    }

    #[test]
    fn input_options() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("part.html"), "@+(1, 1)").unwrap();
        let (mut interp, _) = in_dir(dir.path());
        assert_eq!(interp.process_str("@input(part.html)", Dialect::N).unwrap(), "2");
        assert_eq!(interp.process_str("@input{raw}(part.html)", Dialect::N).unwrap(), "@+(1, 1)");
        assert_eq!(interp.process_str("[@input{if-exists}(nope.html)]", Dialect::N).unwrap(), "[]");
        let err = interp.process_str("@input(nope.html)", Dialect::N).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Io(_)));
    }

    #[test]
    fn content_needs_a_page() {
        let err = Interpreter::for_tests().process_str("@content()", Dialect::N).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Config(_)));
    }

    #[test]
    fn dep_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut interp, _) = in_dir(dir.path());
        interp.process_str("@dep(a.css, b.js)", Dialect::N).unwrap();
        assert_eq!(interp.deps(), [dir.path().join("a.css"), dir.path().join("b.js")]);
    }

    #[test]
    fn number_format() {
        let mut interp = Interpreter::for_tests();
        let out = interp.process_str("@precision(3)@precision() @/(1, 3)", Dialect::N).unwrap();
        assert_eq!(out, "3 0.333");
        let out = interp.process_str("@fixed()@/(1, 4)", Dialect::N).unwrap();
        assert_eq!(out, "0.250");
    }

    #[test]
    fn unlock_releases_console() {
        let mut interp = Interpreter::for_tests();
        interp.process_str("@console.lock()@console(held)@console.unlock()", Dialect::N).unwrap();
        assert!(interp.finish().is_ok());
    }
}
