//! Site configuration.
//!
//! A project is a directory holding `nsm.toml`:
//!
//! ```toml
//! content_dir = "content"
//! content_ext = ".content"
//! output_dir = "site"
//! output_ext = ".html"
//! info_dir = ".nsm"
//! default_template = "template/page.template"
//! build_threads = 4
//!
//! [[page]]
//! name = "index"
//! title = "Home"
//!
//! [[page]]
//! name = "blog/first"
//! title = "First post"
//! template = "template/post.template"
//! ```
//!
//! A user-level `config.toml` in the platform config directory may set
//! `build_threads` and `color`; values in `nsm.toml` win.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::console::stdout_is_tty;
use crate::tracked::TrackedInfo;

pub const PROJECT_FILE: &str = "nsm.toml";

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: line {line}: {message}", path.display())]
    Syntax { path: PathBuf, line: usize, message: String },
    #[error("{}: {message}", path.display())]
    Invalid { path: PathBuf, message: String },
}

/// 1-based line of byte offset `pos` in `text`.
fn line_of(text: &str, pos: usize) -> usize {
    text.as_bytes()[..pos.min(text.len())].iter().filter(|&&b| b == b'\n').count() + 1
}

fn parse_toml<T: for<'de> Deserialize<'de>>(text: &str, path: &Path) -> Result<T, ConfigError> {
    toml::from_str(text).map_err(|e| ConfigError::Syntax {
        path: path.to_path_buf(),
        line: e.span().map_or(1, |span| line_of(text, span.start)),
        message: e.message().trim().to_owned(),
    })
}

// ── nsm.toml ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageEntry {
    pub name: String,
    pub title: Option<String>,
    pub template: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    pub content_dir: PathBuf,
    pub content_ext: String,
    pub output_dir: PathBuf,
    pub output_ext: String,
    pub info_dir: PathBuf,
    pub default_template: PathBuf,
    pub build_threads: Option<usize>,
    #[serde(rename = "page")]
    pub pages: Vec<PageEntry>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        SiteConfig {
            content_dir: "content".into(),
            content_ext: ".content".into(),
            output_dir: "site".into(),
            output_ext: ".html".into(),
            info_dir: ".nsm".into(),
            default_template: "template/page.template".into(),
            build_threads: None,
            pages: Vec::new(),
        }
    }
}

fn dotted(ext: &str) -> String {
    if ext.is_empty() || ext.starts_with('.') {
        ext.to_owned()
    } else {
        format!(".{ext}")
    }
}

impl SiteConfig {
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: SiteConfig = parse_toml(text, path)?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::Invalid { path: path.to_path_buf(), message };
        if self.build_threads == Some(0) {
            return Err(invalid("build_threads must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for page in &self.pages {
            let name = page.name.trim();
            if name.is_empty() || name.starts_with('/') || name.split('/').any(|part| part == "..") {
                return Err(invalid(format!("'{}' is not a valid page name", page.name)));
            }
            if !seen.insert(name) {
                return Err(invalid(format!("page '{name}' is listed twice")));
            }
        }
        Ok(())
    }

    fn tracked(&self, page: &PageEntry) -> TrackedInfo {
        let name = page.name.trim().to_owned();
        TrackedInfo {
            title: page.title.clone().unwrap_or_else(|| name.clone()),
            content_path: self.content_dir.join(format!("{name}{}", dotted(&self.content_ext))),
            output_path: self.output_dir.join(format!("{name}{}", dotted(&self.output_ext))),
            template_path: page.template.clone().unwrap_or_else(|| self.default_template.clone()),
            name,
        }
    }
}

// ── User config ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UserConfig {
    pub build_threads: Option<usize>,
    pub color: Option<bool>,
}

impl UserConfig {
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "nsm").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Read `path`; a missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => parse_toml(&text, path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(UserConfig::default()),
            Err(source) => Err(ConfigError::Io { path: path.to_path_buf(), source }),
        }
    }
}

// ── Site ──────────────────────────────────────────────────────────────────────

/// A loaded project: its root, its `nsm.toml` and the effective settings.
#[derive(Debug, Clone)]
pub struct Site {
    pub root: PathBuf,
    pub config: SiteConfig,
    pub threads: usize,
    pub color: bool,
}

impl Site {
    /// Load `<root>/nsm.toml` together with the user config, if any.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let user = match UserConfig::default_path() {
            Some(path) => UserConfig::load(&path)?,
            None => UserConfig::default(),
        };
        Self::load_with(root, user)
    }

    pub fn load_with(root: &Path, user: UserConfig) -> Result<Self, ConfigError> {
        let path = root.join(PROJECT_FILE);
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        let config = SiteConfig::parse(&text, &path)?;
        if user.build_threads == Some(0) {
            let path = UserConfig::default_path().unwrap_or_default();
            return Err(ConfigError::Invalid { path, message: "build_threads must be at least 1".into() });
        }
        let threads = config
            .build_threads
            .or(user.build_threads)
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, NonZeroUsize::get));
        Ok(Site {
            root: root.to_path_buf(),
            color: user.color.unwrap_or_else(stdout_is_tty),
            threads,
            config,
        })
    }

    /// Every tracked page, in `nsm.toml` order.
    pub fn tracked(&self) -> Vec<TrackedInfo> {
        self.config.pages.iter().map(|page| self.config.tracked(page)).collect()
    }

    pub fn find(&self, name: &str) -> Option<TrackedInfo> {
        self.config
            .pages
            .iter()
            .find(|page| page.name.trim() == name)
            .map(|page| self.config.tracked(page))
    }

    pub fn info_dir(&self) -> PathBuf {
        self.root.join(&self.config.info_dir)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<SiteConfig, ConfigError> {
        SiteConfig::parse(text, Path::new("nsm.toml"))
    }

    #[test]
    fn defaults_fill_missing_keys() {
        let cfg = parse("[[page]]\nname = \"index\"\n").unwrap();
        assert_eq!(cfg.output_dir, PathBuf::from("site"));
        let info = cfg.tracked(&cfg.pages[0]);
        assert_eq!(info.title, "index");
        assert_eq!(info.content_path, PathBuf::from("content/index.content"));
        assert_eq!(info.output_path, PathBuf::from("site/index.html"));
        assert_eq!(info.template_path, PathBuf::from("template/page.template"));
    }

    #[test]
    fn page_overrides_and_bare_extensions() {
        let cfg = parse(
            "output_ext = \"htm\"\ncontent_ext = \"md\"\n\
             [[page]]\nname = \"blog/first\"\ntitle = \"First\"\ntemplate = \"t/post.f\"\n",
        )
        .unwrap();
        let info = cfg.tracked(&cfg.pages[0]);
        assert_eq!(info.title, "First");
        assert_eq!(info.content_path, PathBuf::from("content/blog/first.md"));
        assert_eq!(info.output_path, PathBuf::from("site/blog/first.htm"));
        assert_eq!(info.template_path, PathBuf::from("t/post.f"));
    }

    #[test]
    fn syntax_errors_carry_the_line() {
        let err = parse("output_dir = \"site\"\n\nbuild_threads = \"many\"\n").unwrap_err();
        match err {
            ConfigError::Syntax { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(parse("outptu_dir = \"x\"\n"), Err(ConfigError::Syntax { .. })));
    }

    #[test]
    fn invalid_pages_are_rejected() {
        let dup = "[[page]]\nname = \"a\"\n[[page]]\nname = \"a\"\n";
        assert!(matches!(parse(dup), Err(ConfigError::Invalid { .. })));
        assert!(matches!(parse("[[page]]\nname = \"../x\"\n"), Err(ConfigError::Invalid { .. })));
        assert!(matches!(parse("build_threads = 0\n"), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn project_threads_win_over_user() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PROJECT_FILE), "build_threads = 3\n").unwrap();
        let user = UserConfig { build_threads: Some(8), color: Some(false) };
        let site = Site::load_with(dir.path(), user).unwrap();
        assert_eq!(site.threads, 3);
        assert!(!site.color);

        fs::write(dir.path().join(PROJECT_FILE), "").unwrap();
        let user = UserConfig { build_threads: Some(8), color: None };
        assert_eq!(Site::load_with(dir.path(), user).unwrap().threads, 8);
    }

    #[test]
    fn missing_project_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Site::load_with(dir.path(), UserConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn user_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(UserConfig::load(&path).unwrap(), UserConfig::default());
        fs::write(&path, "color = true\nbuild_threads = 2\n").unwrap();
        let user = UserConfig::load(&path).unwrap();
        assert_eq!(user, UserConfig { build_threads: Some(2), color: Some(true) });
    }

    #[test]
    fn find_by_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PROJECT_FILE), "[[page]]\nname = \"index\"\ntitle = \"Home\"\n").unwrap();
        let site = Site::load_with(dir.path(), UserConfig::default()).unwrap();
        assert_eq!(site.find("index").map(|i| i.title), Some("Home".to_owned()));
        assert!(site.find("ghost").is_none());
        assert_eq!(site.tracked().len(), 1);
    }
}
