//! Filesystem built-ins.  Relative paths are taken from the interpreter's
//! working directory, which `cd` changes.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::script::error::ScriptError;
use crate::script::interp::Interpreter;
use crate::script::processor::CallRecord;

use super::flag;

fn copy_recursive(src: &Path, dest: &Path) -> io::Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
        return Ok(());
    }
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::copy(src, dest).map(drop)
}

/// `path` with its longest existing prefix canonicalised.
fn canonical_prefix(path: &Path) -> PathBuf {
    let mut tail = Vec::new();
    let mut cur = path;
    loop {
        if let Ok(base) = cur.canonicalize() {
            return tail.iter().rev().fold(base, |p: PathBuf, name| p.join(name));
        }
        match (cur.parent(), cur.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_owned());
                cur = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn touch(path: &Path) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = File::options().append(true).create(true).open(path)?;
    file.set_modified(SystemTime::now())
}

impl Interpreter {
    fn paths(&mut self, call: &CallRecord) -> Result<Vec<PathBuf>, ScriptError> {
        Ok(self
            .eval_params(call)?
            .iter()
            .map(|p| self.resolve(p.trim()))
            .collect())
    }

    fn fs_err<'a>(call: &'a CallRecord, path: &'a Path) -> impl Fn(io::Error) -> ScriptError + 'a {
        move |e| ScriptError::io(&e, path.display(), call.location.clone())
    }

    pub(super) fn cpy(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let paths = self.paths(call)?;
        debug!(from = %paths[0].display(), to = %paths[1].display(), "cpy");
        if paths[0].is_dir() && canonical_prefix(&paths[1]).starts_with(canonical_prefix(&paths[0])) {
            let e = io::Error::new(io::ErrorKind::InvalidInput, "destination is inside the source directory");
            return Err(ScriptError::io(&e, format!("cpy {}", paths[0].display()), call.location.clone()));
        }
        copy_recursive(&paths[0], &paths[1]).map_err(|e| {
            ScriptError::io(&e, format!("cpy {}", paths[0].display()), call.location.clone())
        })
    }

    pub(super) fn mve(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let paths = self.paths(call)?;
        let err = |e: io::Error| ScriptError::io(&e, format!("mve {}", paths[0].display()), call.location.clone());
        if let Some(dir) = paths[1].parent() {
            fs::create_dir_all(dir).map_err(err)?;
        }
        fs::rename(&paths[0], &paths[1]).map_err(err)
    }

    pub(super) fn rmv(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        for path in self.paths(call)? {
            let removed = if path.is_dir() { fs::remove_dir_all(&path) } else { fs::remove_file(&path) };
            removed.map_err(Self::fs_err(call, &path))?;
        }
        Ok(())
    }

    /// `lst(dir)`: entry names, sorted, one per line.
    pub(super) fn lst(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let dir = self.paths(call)?.remove(0);
        let err = Self::fs_err(call, &dir);
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(&err)? {
            names.push(entry.map_err(&err)?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        res.push_str(&names.join("\n"));
        Ok(())
    }

    pub(super) fn poke(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        for path in self.paths(call)? {
            touch(&path).map_err(Self::fs_err(call, &path))?;
        }
        Ok(())
    }

    pub(super) fn mkdir(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        for path in self.paths(call)? {
            fs::create_dir_all(&path).map_err(Self::fs_err(call, &path))?;
        }
        Ok(())
    }

    pub(super) fn exists(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let path = self.paths(call)?.remove(0);
        res.push_str(flag(path.exists()));
        Ok(())
    }

    pub(super) fn cd(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let path = self.paths(call)?.remove(0);
        if !path.is_dir() {
            let e = io::Error::new(io::ErrorKind::NotFound, "not a directory");
            return Err(ScriptError::io(&e, path.display(), call.location.clone()));
        }
        self.cwd = path;
        Ok(())
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

    fn interp_in(dir: &std::path::Path) -> Interpreter {
        let (console, _) = Console::captured();
        Interpreter::new(console, dir)
    }

    #[test]
    fn make_touch_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut interp = interp_in(dir.path());
        let out = interp
            .process_str("@mkdir(d/sub)@poke(d/b.txt, d/a.txt)@lst(d)", Dialect::N)
            .unwrap();
        assert_eq!(out, "a.txt\nb.txt\nsub");
    }

    #[test]
    fn copy_move_remove() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "A").unwrap();
        let mut interp = interp_in(dir.path());
        interp
            .process_str("@cpy(a.txt, x/b.txt)@mve(a.txt, y/c.txt)", Dialect::N)
            .unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("x/b.txt")).unwrap(), "A");
        assert_eq!(fs::read_to_string(dir.path().join("y/c.txt")).unwrap(), "A");
        let out = interp
            .process_str("@exists(a.txt)@rmv(x, y/c.txt)@exists(x)@exists(y)", Dialect::N)
            .unwrap();
        assert_eq!(out, "001");
    }

    #[test]
    fn copy_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/inner")).unwrap();
        fs::write(dir.path().join("src/inner/f.txt"), "F").unwrap();
        let mut interp = interp_in(dir.path());
        interp.process_str("@cpy(src, dst)", Dialect::N).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("dst/inner/f.txt")).unwrap(), "F");
    }

    #[test]
    fn copy_into_itself_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d/f.txt"), "F").unwrap();
        let mut interp = interp_in(dir.path());
        let err = interp.process_str("@cpy(d, d/sub)", Dialect::N).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Io(_)));
        assert!(!dir.path().join("d/sub").exists());
        let err = interp.process_str("@cpy(d, d)", Dialect::N).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Io(_)));
        interp.process_str("@cpy(d, d2)", Dialect::N).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("d2/f.txt")).unwrap(), "F");
    }

    #[test]
    fn cd_changes_relative_base() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/here.txt"), "").unwrap();
        let mut interp = interp_in(dir.path());
        assert_eq!(interp.process_str("@cd(sub)@exists(here.txt)", Dialect::N).unwrap(), "1");
        let err = interp.process_str("@cd(missing)", Dialect::N).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Io(_)));
    }

    #[test]
    fn removing_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = interp_in(dir.path()).process_str("@rmv(ghost)", Dialect::N).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Io(_)));
    }
}
