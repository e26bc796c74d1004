//! The build driver.
//!
//! Pages build in parallel: each one is a blocking task on the tokio
//! runtime's blocking pool with its own [`Interpreter`], and a semaphore
//! keeps at most `build_threads` of them running.  The only state shared
//! between builds is the console mutex and the [`Progress`] counters.
//!
//! ```text
//!  build_targets ──► permit ──► spawn_blocking(build_page) ──► JoinSet
//!                                   │
//!                                   ├─ Interpreter::build
//!                                   ├─ write output + pages 2..
//!                                   ├─ delete pages left from a longer run
//!                                   └─ save <info_dir>/<name>.info
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Site;
use crate::console::Console;
use crate::script::{Interpreter, ScriptError};
use crate::tracked::{InfoManifest, ManifestError, TrackedInfo};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("{}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl BuildError {
    pub fn report(&self, console: &Console) {
        match self {
            BuildError::Script(err) => console.error(None, err),
            other => console.failure(None, &other.to_string()),
        }
    }
}

// ── Progress ──────────────────────────────────────────────────────────────────

/// Counters a front end can poll while a build runs.
#[derive(Debug, Default)]
pub struct Progress {
    pub total: AtomicUsize,
    pub done: AtomicUsize,
    pub failed: AtomicUsize,
}

impl Progress {
    pub fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.done.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub built: usize,
    pub failed: usize,
}

impl BuildReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

// ── One page ──────────────────────────────────────────────────────────────────

fn write_file(path: &Path, text: &str) -> Result<(), BuildError> {
    let err = |source| BuildError::Write { path: path.to_path_buf(), source };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(err)?;
    }
    fs::write(path, text).map_err(err)
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
    path.strip_prefix(root).map_or_else(|_| path.to_path_buf(), Path::to_path_buf)
}

/// Delete pages `from..=to` left behind by an earlier build with more pages.
fn remove_stale_pages(info: &TrackedInfo, pages_dir: &Path, from: usize, to: usize) {
    for page_no in from..=to {
        let path = info.page_path(pages_dir, page_no);
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale page"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove stale page"),
        }
    }
}

/// Render one target and write everything it produced.  Returns the number
/// of pages written.
pub fn build_page(site: &Site, info: &TrackedInfo, console: Console) -> Result<usize, BuildError> {
    let root = &site.root;
    let mut interp = Interpreter::new(console, root);
    let built = interp.build(info)?;

    write_file(&root.join(&info.output_path), &built.output)?;
    let pages_dir = root.join(&built.pages_dir);
    for (i, page) in built.extra_pages.iter().enumerate() {
        write_file(&info.page_path(&pages_dir, i + 2), page)?;
    }
    let pages = built.extra_pages.len() + 1;

    let info_path = info.info_path(&site.info_dir());
    if let Some(previous) = InfoManifest::load(&info_path)? {
        if previous.pages > pages {
            let old_dir = previous.pages_dir.as_ref().map_or_else(|| pages_dir.clone(), |d| root.join(d));
            remove_stale_pages(info, &old_dir, pages + 1, previous.pages);
        }
    }

    let deps = built.deps.iter().map(|d| relative_to(d, root)).collect();
    let pages_dir = (pages > 1).then(|| relative_to(&pages_dir, root));
    InfoManifest::new(info, deps, pages, pages_dir).save(&info_path)?;
    debug!(name = %info.name, pages, "wrote target");
    Ok(pages)
}

// ── Many pages ────────────────────────────────────────────────────────────────

/// Build `targets` in parallel, reporting each failure on the console as it
/// happens.
pub async fn build_targets(
    site: Arc<Site>,
    targets: Vec<TrackedInfo>,
    console: Console,
    progress: Arc<Progress>,
) -> BuildReport {
    progress.total.store(targets.len(), Ordering::Relaxed);
    let permits = Arc::new(Semaphore::new(site.threads.max(1)));
    let mut tasks = JoinSet::new();
    let mut report = BuildReport::default();

    for info in targets {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let site = Arc::clone(&site);
        let console = console.clone();
        let progress = Arc::clone(&progress);
        tasks.spawn_blocking(move || {
            let _permit = permit;
            let result = build_page(&site, &info, console.clone());
            match &result {
                Ok(pages) => {
                    info!(name = %info.name, pages, "built");
                    progress.done.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    e.report(&console);
                    progress.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            result.is_ok()
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => report.built += 1,
            Ok(false) => report.failed += 1,
            Err(e) => {
                console.failure(None, &format!("build task failed: {e}"));
                progress.failed.fetch_add(1, Ordering::Relaxed);
                report.failed += 1;
            }
        }
    }
    report
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SiteConfig, UserConfig, PROJECT_FILE};

    fn site(pages: &[&str]) -> (tempfile::TempDir, Site) {
        let dir = tempfile::tempdir().unwrap();
        let mut toml = String::from("build_threads = 2\n");
        for name in pages {
            toml.push_str(&format!("[[page]]\nname = \"{name}\"\n"));
        }
        fs::write(dir.path().join(PROJECT_FILE), toml).unwrap();
        fs::create_dir_all(dir.path().join("template")).unwrap();
        fs::create_dir_all(dir.path().join("content")).unwrap();
        let site = Site::load_with(dir.path(), UserConfig::default()).unwrap();
        (dir, site)
    }

    fn put(dir: &Path, rel: &str, text: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    fn read(dir: &Path, rel: &str) -> String {
        fs::read_to_string(dir.join(rel)).unwrap()
    }

    #[test]
    fn builds_output_and_manifest() {
        let (dir, site) = site(&["index"]);
        put(dir.path(), "template/page.template", "<h1>$[title]</h1>\n@content()");
        put(dir.path(), "content/index.content", "hello");
        let info = site.find("index").unwrap();
        let (console, _) = Console::captured();
        assert_eq!(build_page(&site, &info, console).unwrap(), 1);
        assert_eq!(read(dir.path(), "site/index.html"), "<h1>index</h1>\nhello");

        let manifest = InfoManifest::load(&dir.path().join(".nsm/index.info")).unwrap().unwrap();
        assert_eq!(manifest.pages, 1);
        assert_eq!(
            manifest.deps,
            [PathBuf::from("template/page.template"), PathBuf::from("content/index.content")]
        );
    }

    #[test]
    fn pages_written_and_stale_ones_removed() {
        let (dir, site) = site(&["list"]);
        put(dir.path(), "template/page.template", "@content()");
        put(dir.path(), "content/list.content", "@item(a)@item(b)@item(c)@paginate(1)");
        let info = site.find("list").unwrap();
        let (console, _) = Console::captured();
        assert_eq!(build_page(&site, &info, console.clone()).unwrap(), 3);
        assert_eq!(read(dir.path(), "site/list.html"), "a");
        assert_eq!(read(dir.path(), "site/list/2.html"), "b");
        assert_eq!(read(dir.path(), "site/list/3.html"), "c");

        put(dir.path(), "content/list.content", "@item(a)@item(b)@paginate(1)");
        assert_eq!(build_page(&site, &info, console).unwrap(), 2);
        assert!(dir.path().join("site/list/2.html").exists());
        assert!(!dir.path().join("site/list/3.html").exists());
    }

    #[test]
    fn failed_build_writes_nothing() {
        let (dir, site) = site(&["bad"]);
        put(dir.path(), "template/page.template", "@nosuchcall_xyz()");
        put(dir.path(), "content/bad.content", "");
        let info = site.find("bad").unwrap();
        let (console, _) = Console::captured();
        let err = build_page(&site, &info, console).unwrap_err();
        assert!(matches!(err, BuildError::Script(_)));
        assert!(!dir.path().join("site/bad.html").exists());
        assert!(!dir.path().join(".nsm/bad.info").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn parallel_builds_report_failures() {
        let (dir, site) = site(&["a", "b", "c"]);
        put(dir.path(), "template/page.template", "[@content()]");
        put(dir.path(), "content/a.content", "A");
        put(dir.path(), "content/b.content", "@nosuchcall_xyz()");
        put(dir.path(), "content/c.content", "C");
        let targets = site.tracked();
        let (console, buf) = Console::captured();
        let progress = Arc::new(Progress::default());
        let report = build_targets(Arc::new(site), targets, console, Arc::clone(&progress)).await;

        assert_eq!(report, BuildReport { built: 2, failed: 1 });
        assert_eq!(progress.snapshot(), (2, 1, 3));
        assert_eq!(read(dir.path(), "site/a.html"), "[A]");
        assert_eq!(read(dir.path(), "site/c.html"), "[C]");
        assert!(buf.lock().unwrap().contains("unknown call 'nosuchcall_xyz'"));
    }

    #[test]
    fn default_config_is_usable() {
        let cfg = SiteConfig::default();
        assert!(cfg.pages.is_empty());
        assert_eq!(cfg.info_dir, PathBuf::from(".nsm"));
    }
}
