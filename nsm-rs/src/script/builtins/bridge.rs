//! Bridges out of the template language: shell commands, staged scripts,
//! external programs and the optional Lua runtime.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::script::cursor::ParseCursor;
use crate::script::error::{ErrorKind, ScriptError};
use crate::script::interp::Interpreter;
use crate::script::processor::CallRecord;

/// Names staged script copies; unique across every build in the process.
static SCRIPT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Tries at staging, running and removing a script copy.
const ATTEMPTS: usize = 5;

/// Captured stdout with one trailing newline dropped.
fn stdout_text(out: &Output) -> String {
    let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
    if text.ends_with('\n') {
        text.pop();
        if text.ends_with('\r') {
            text.pop();
        }
    }
    text
}

fn exit_failure(what: &str, cmd: &str, out: &Output, call: &CallRecord) -> ScriptError {
    let stderr = String::from_utf8_lossy(&out.stderr);
    let detail = stderr.trim();
    let diagnostic = if detail.is_empty() {
        format!("'{cmd}' exited with {}", out.status)
    } else {
        format!("'{cmd}' exited with {}: {detail}", out.status)
    };
    call.err(ErrorKind::External { what: what.to_owned(), diagnostic })
}

fn text_file_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

impl Interpreter {
    fn shell(&self, cmd: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd).current_dir(&self.cwd);
        command
    }

    /// `sys(cmd…)`: run through `sh -c`; stdout becomes the result.
    pub(super) fn sys(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let cmd = self.eval_params(call)?.join(" ");
        debug!(cmd = %cmd, "sys");
        let out = self
            .shell(&cmd)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ScriptError::io(&e, "sh", call.location.clone()))?;
        if !out.status.success() {
            return Err(exit_failure("sys", &cmd, &out, call));
        }
        res.push_str(&stdout_text(&out));
        Ok(())
    }

    /// `system(cmd…)`: run through `sh -c`; stdout goes to the console.
    pub(super) fn system(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let cmd = self.eval_params(call)?.join(" ");
        debug!(cmd = %cmd, "system");
        let out = self
            .shell(&cmd)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| ScriptError::io(&e, "sh", call.location.clone()))?;
        self.print(&String::from_utf8_lossy(&out.stdout));
        if !out.status.success() {
            return Err(exit_failure("system", &cmd, &out, call));
        }
        Ok(())
    }

    // ── script ────────────────────────────────────────────────────────────────

    /// `script(path, args…)`: run a private executable copy of the script
    /// and capture its stdout.
    pub(super) fn script(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let params = self.eval_params(call)?;
        let path = self.resolve(params[0].trim());
        let body = fs::read(&path).map_err(|e| ScriptError::io(&e, path.display(), call.location.clone()))?;
        self.add_dep(&path);

        let staged = self.stage_script(&path, &body, call)?;
        let args: Vec<&str> = params[1..].iter().map(|a| a.trim()).collect();
        let out = self.run_staged(&staged, &args);
        self.remove_staged(&staged, call);

        let cmd = params.join(" ");
        let out = out.map_err(|e| ScriptError::io(&e, path.display(), call.location.clone()))?;
        if !out.status.success() {
            return Err(exit_failure("script", &cmd, &out, call));
        }
        res.push_str(&stdout_text(&out));
        Ok(())
    }

    fn stage_script(&self, original: &Path, body: &[u8], call: &CallRecord) -> Result<PathBuf, ScriptError> {
        let dir = original.parent().map_or_else(|| self.cwd.clone(), Path::to_path_buf);
        let stem = original.file_name().map_or_else(|| "script".into(), |n| n.to_string_lossy());
        let mut last = None;
        for attempt in 1..=ATTEMPTS {
            let n = SCRIPT_COUNTER.fetch_add(1, Ordering::Relaxed);
            let target = dir.join(format!(".{stem}.{}.{n}.tmp", std::process::id()));
            let staged = tempfile::Builder::new()
                .prefix(".nsm-script")
                .tempfile_in(&dir)
                .and_then(|mut f| f.write_all(body).map(|()| f))
                .and_then(|f| f.persist_noclobber(&target).map_err(|e| e.error))
                .and_then(|file| {
                    drop(file);
                    make_executable(&target)
                });
            match staged {
                Ok(()) => return Ok(target),
                Err(e) => {
                    self.warn(
                        &call.location,
                        &format!("could not stage {} (attempt {attempt}/{ATTEMPTS}): {e}", original.display()),
                    );
                    last = Some(e);
                }
            }
        }
        let e = last.unwrap_or_else(|| io::Error::other("no attempts made"));
        Err(ScriptError::io(&e, original.display(), call.location.clone()))
    }

    fn run_staged(&self, staged: &Path, args: &[&str]) -> io::Result<Output> {
        let mut attempt = 1;
        loop {
            let result = Command::new(staged)
                .args(args)
                .current_dir(&self.cwd)
                .stdin(Stdio::null())
                .output();
            match result {
                // Another thread may still hold the freshly written file open
                // across a fork.
                Err(e) if text_file_busy(&e) && attempt < ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(std::time::Duration::from_millis(10 * attempt as u64));
                }
                other => return other,
            }
        }
    }

    fn remove_staged(&self, staged: &Path, call: &CallRecord) {
        for attempt in 1..=ATTEMPTS {
            match fs::remove_file(staged) {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                Err(e) => self.warn(
                    &call.location,
                    &format!("could not remove {} (attempt {attempt}/{ATTEMPTS}): {e}", staged.display()),
                ),
            }
        }
        warn!(path = %staged.display(), "staged script left behind");
    }

    // ── External programs ─────────────────────────────────────────────────────

    /// An unknown call in `F` runs the program of that name with the
    /// processed params as arguments.
    pub(crate) fn run_external(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let args = self.eval_params(call)?;
        debug!(program = %call.name, ?args, "external");
        let out = Command::new(&call.name)
            .args(&args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output();
        let out = match out {
            Ok(out) => out,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(call.err(ErrorKind::UnknownCall(call.name.clone())))
            }
            Err(e) => return Err(ScriptError::io(&e, &call.name, call.location.clone())),
        };
        self.print(&String::from_utf8_lossy(&out.stdout));
        if !out.status.success() {
            let cmd = std::iter::once(call.name.as_str())
                .chain(args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            return Err(exit_failure(&call.name, &cmd, &out, call));
        }
        Ok(())
    }

    // ── Lua ───────────────────────────────────────────────────────────────────

    /// The chunk of `lua(){chunk}` or `lua(code)`, and the line it starts on.
    fn lua_chunk(&mut self, call: &CallRecord, cur: &mut ParseCursor<'_>) -> Result<(String, usize), ScriptError> {
        if call.params.is_empty() {
            let block = self.read_block(cur, call)?;
            return Ok((block.text, block.line));
        }
        let line = call.params.first().map_or(call.location.line, |p| p.line);
        Ok((call.raw_params.clone().unwrap_or_default(), line))
    }

    #[cfg(feature = "lua")]
    pub(super) fn lua(&mut self, call: &CallRecord, cur: &mut ParseCursor<'_>, res: &mut String) -> Result<(), ScriptError> {
        use crate::lua::LuaEngine;
        use crate::script::error::Location;
        use crate::script::store::DeclOptions;
        use crate::script::value::{TypeTag, Value};

        let (chunk, line) = self.lua_chunk(call, cur)?;
        let failure = |e: mlua::Error| {
            let msg = e.to_string();
            let at = crate::lua::error_line(&msg)
                .map_or_else(|| call.location.clone(), |l| Location::new(call.source().clone(), line + l - 1));
            ScriptError::new(ErrorKind::External { what: "lua".into(), diagnostic: msg }, at)
        };
        if self.lua.is_none() {
            self.lua = Some(LuaEngine::new().map_err(failure)?);
        }
        let vars = self
            .store
            .visible_names()
            .into_iter()
            .filter_map(|n| self.store.text_of(n, &self.num_format).map(|t| (n.to_owned(), t)))
            .collect();
        let Some(engine) = self.lua.as_ref() else {
            return Ok(());
        };
        let (output, writes) = engine.run(&chunk, call.source().as_str(), vars).map_err(failure)?;
        for (name, value) in writes {
            let written = if self.store.lookup(&name).is_some() {
                self.store.assign(&name, &value).map_err(|e| call.err(e))
            } else {
                self.store
                    .declare(&name, TypeTag::Str, Value::Str(value), DeclOptions::default())
                    .map_err(|e| call.err(e))
            };
            written?;
        }
        res.push_str(&output);
        Ok(())
    }

    #[cfg(not(feature = "lua"))]
    pub(super) fn lua(&mut self, call: &CallRecord, cur: &mut ParseCursor<'_>, _res: &mut String) -> Result<(), ScriptError> {
        self.lua_chunk(call, cur)?;
        Err(call.err(ErrorKind::External {
            what: "lua".into(),
            diagnostic: "this build has no Lua runtime (enable the `lua` feature)".into(),
        }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::console::Console;
    use crate::script::error::ErrorKind;
    use crate::script::interp::Interpreter;
    use crate::script::processor::Dialect;

    #[test]
    fn sys_captures_stdout() {
        let mut interp = Interpreter::for_tests();
        assert_eq!(interp.process_str("[@sys(echo, hello)]", Dialect::N).unwrap(), "[hello]");
    }

    #[test]
    fn sys_failure_is_external() {
        let err = Interpreter::for_tests().process_str("@sys(exit 3)", Dialect::N).unwrap_err();
        match err.kind {
            ErrorKind::External { what, diagnostic } => {
                assert_eq!(what, "sys");
                assert!(diagnostic.contains("exit 3"), "{diagnostic}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn system_prints_to_console() {
        let (console, buf) = Console::captured();
        let mut interp = Interpreter::new(console, std::env::temp_dir());
        assert_eq!(interp.process_str("@system(echo, out)", Dialect::N).unwrap(), "");
        assert_eq!(*buf.lock().unwrap(), "out\n");
    }

    #[cfg(unix)]
    #[test]
    fn script_runs_a_private_copy() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hi.sh"), "#!/bin/sh\necho \"hi $1\"\n").unwrap();
        let (console, _) = Console::captured();
        let mut interp = Interpreter::new(console, dir.path());
        assert_eq!(interp.process_str("@script(hi.sh, there)", Dialect::N).unwrap(), "hi there");
        let left: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(left, ["hi.sh"]);
        assert!(interp.deps().iter().any(|d| d.ends_with("hi.sh")));
    }

    #[test]
    fn external_program_in_f() {
        let (console, buf) = Console::captured();
        let mut interp = Interpreter::new(console, std::env::temp_dir());
        interp.process_str("echo(\"from f\")", Dialect::F).unwrap();
        assert_eq!(*buf.lock().unwrap(), "from f\n");
        let err = interp.process_str("no-such-program-nsm()", Dialect::F).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnknownCall(_)));
    }

    #[test]
    fn unknown_call_in_n_is_not_run() {
        let err = Interpreter::for_tests().process_str("@echo(x)", Dialect::N).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnknownCall(_)));
    }

    #[cfg(not(feature = "lua"))]
    #[test]
    fn lua_without_runtime_fails() {
        let err = Interpreter::for_tests().process_str("@lua(){x = 1}", Dialect::N).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::External { .. }));
    }

    #[cfg(feature = "lua")]
    #[test]
    fn lua_reads_and_writes_variables() {
        let mut interp = Interpreter::for_tests();
        let src = "@int(n=4)@lua(){\n  nsm_print(nsm_get('n') * 2)\n  nsm_set('greeting', 'hi')\n}|$[greeting]";
        assert_eq!(interp.process_str(src, Dialect::N).unwrap(), "8|hi");
    }

    #[cfg(feature = "lua")]
    #[test]
    fn lua_error_points_at_chunk_line() {
        let src = "@lua(){\n  x = 1\n  error('boom')\n}";
        let err = Interpreter::for_tests().process_str(src, Dialect::N).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::External { .. }));
        assert_eq!(err.location.line, 3);
    }
}
