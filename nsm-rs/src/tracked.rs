//! Build targets and their info manifests.
//!
//! Every tracked page pairs a content file with a template and an output
//! path.  After a successful build the driver records what was read in an
//! info manifest, `<info_dir>/<name>.info`:
//!
//! ```toml
//! name = "blog/index"
//! built = 1760745600
//! pages = 3
//! pages_dir = "site/blog/index"
//! deps = ["template/page.template", "content/blog/index.content"]
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── TrackedInfo ───────────────────────────────────────────────────────────────

/// One page the site tracks.  Paths are relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedInfo {
    pub name: String,
    pub title: String,
    pub content_path: PathBuf,
    pub output_path: PathBuf,
    pub template_path: PathBuf,
}

impl TrackedInfo {
    /// Where pages 2.. go unless the template picks a directory: the
    /// output path without its extension.
    pub fn default_pages_dir(&self) -> PathBuf {
        self.output_path.with_extension("")
    }

    /// The output extension with its leading dot, or empty.
    pub fn output_ext(&self) -> String {
        self.output_path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default()
    }

    /// Path of page `page_no` (2 or more) under `pages_dir`.
    pub fn page_path(&self, pages_dir: &Path, page_no: usize) -> PathBuf {
        pages_dir.join(format!("{page_no}{}", self.output_ext()))
    }

    pub fn info_path(&self, info_dir: &Path) -> PathBuf {
        info_dir.join(format!("{}.info", self.name))
    }
}

// ── InfoManifest ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
}

/// What one build of a target produced and read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoManifest {
    pub name: String,
    /// Seconds since the Unix epoch.
    pub built: u64,
    /// Pages written, counting the output file itself.
    pub pages: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages_dir: Option<PathBuf>,
    /// Every file read, in first-read order.
    pub deps: Vec<PathBuf>,
}

impl InfoManifest {
    pub fn new(info: &TrackedInfo, deps: Vec<PathBuf>, pages: usize, pages_dir: Option<PathBuf>) -> Self {
        let built = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        InfoManifest { name: info.name.clone(), built, pages, pages_dir, deps }
    }

    /// Read a manifest; `None` when the target has never been built.
    pub fn load(path: &Path) -> Result<Option<Self>, ManifestError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ManifestError::Io { path: path.to_path_buf(), source }),
        };
        toml::from_str(&text)
            .map(Some)
            .map_err(|source| ManifestError::Parse { path: path.to_path_buf(), source })
    }

    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        let text = toml::to_string(self)
            .map_err(|source| ManifestError::Write { path: path.to_path_buf(), source })?;
        let io_err = |source| ManifestError::Io { path: path.to_path_buf(), source };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        fs::write(path, text).map_err(io_err)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> TrackedInfo {
        TrackedInfo {
            name: "blog/index".into(),
            title: "Blog".into(),
            content_path: "content/blog/index.content".into(),
            output_path: "site/blog/index.html".into(),
            template_path: "template/page.template".into(),
        }
    }

    #[test]
    fn page_paths() {
        let info = info();
        assert_eq!(info.default_pages_dir(), PathBuf::from("site/blog/index"));
        assert_eq!(info.output_ext(), ".html");
        assert_eq!(
            info.page_path(&info.default_pages_dir(), 2),
            PathBuf::from("site/blog/index/2.html")
        );
        assert_eq!(info.info_path(Path::new(".nsm")), PathBuf::from(".nsm/blog/index.info"));
    }

    #[test]
    fn extensionless_output() {
        let mut info = info();
        info.output_path = "site/README".into();
        assert_eq!(info.output_ext(), "");
        assert_eq!(info.page_path(Path::new("p"), 3), PathBuf::from("p/3"));
    }

    #[test]
    fn manifest_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = info().info_path(dir.path());
        let manifest = InfoManifest::new(
            &info(),
            vec!["template/page.template".into(), "content/blog/index.content".into()],
            2,
            Some("site/blog/index".into()),
        );
        manifest.save(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("name = \"blog/index\""));
        assert_eq!(InfoManifest::load(&path).unwrap(), Some(manifest));
    }

    #[test]
    fn missing_manifest_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(InfoManifest::load(&dir.path().join("ghost.info")).unwrap(), None);
    }

    #[test]
    fn malformed_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.info");
        fs::write(&path, "name = [").unwrap();
        assert!(matches!(InfoManifest::load(&path), Err(ManifestError::Parse { .. })));
    }
}
