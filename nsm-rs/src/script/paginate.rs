//! Pagination.
//!
//! `item` calls accumulate entries while a target renders; `paginate`
//! leaves a marker in the output.  Once the first pass is done,
//! [`Interpreter::render_pages`] splits the items into pages, renders the
//! page template once per page and substitutes it for the marker, giving
//! one full copy of the target's output per page.

use std::path::PathBuf;

use tracing::debug;

use super::cursor::{Block, ParseCursor};
use super::error::{ErrorKind, Location, ScriptError, SourceRef};
use super::interp::Interpreter;
use super::processor::{CallRecord, Dialect, Output};
use super::store::DeclOptions;
use super::value::{TypeTag, Value};

/// Stand-in for the rendered page in first-pass output.
pub(crate) const MARKER: &str = "\u{0}NSM_PAGINATE\u{0}";

const DEFAULT_TEMPLATE: &str = "$[paginate.page]";

/// The body that renders one page.
#[derive(Debug, Clone)]
pub struct PageTemplate {
    pub text: String,
    pub dialect: Dialect,
    pub source: SourceRef,
    pub line: usize,
}

impl PageTemplate {
    fn from_block(block: Block, call: &CallRecord) -> Self {
        PageTemplate { text: block.text, dialect: call.dialect, source: call.source().clone(), line: block.line }
    }
}

/// Pagination state of one target build.
#[derive(Debug, Clone)]
pub struct PagesInfo {
    pub items: Vec<String>,
    pub items_per_page: usize,
    pub separator: String,
    pub template: Option<PageTemplate>,
    /// Where pages 2.. are written.
    pub pages_dir: PathBuf,
    /// Set once `paginate` has emitted its marker.
    pub used: bool,
}

impl Default for PagesInfo {
    fn default() -> Self {
        PagesInfo {
            items: Vec::new(),
            items_per_page: 1,
            separator: "\n".to_owned(),
            template: None,
            pages_dir: PathBuf::new(),
            used: false,
        }
    }
}

fn page_count(items: usize, per_page: usize) -> usize {
    items.div_ceil(per_page.max(1))
}

impl Interpreter {
    fn per_page_param(&mut self, call: &CallRecord) -> Result<usize, ScriptError> {
        let text = self.first_param(call)?;
        match text.trim().parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(call.err(ErrorKind::Type(format!(
                "{}: '{}' is not a positive item count",
                call.name,
                text.trim()
            )))),
        }
    }

    // ── Built-ins ─────────────────────────────────────────────────────────────

    /// `item(text…){block?}`
    pub(crate) fn item(&mut self, call: &CallRecord, cur: &mut ParseCursor<'_>) -> Result<(), ScriptError> {
        let mut text: String = self.eval_params(call)?.concat();
        if let Some(block) = self.optional_block(cur)? {
            self.run_block(&block, call, &mut text, true)?;
        }
        self.pages.items.push(text);
        Ok(())
    }

    /// `paginate(per_page[, separator]){template?}`
    pub(crate) fn paginate(
        &mut self,
        call: &CallRecord,
        cur: &mut ParseCursor<'_>,
        res: &mut String,
    ) -> Result<(), ScriptError> {
        self.pages.items_per_page = self.per_page_param(call)?;
        if let Some(sep) = call.params.get(1) {
            self.pages.separator = self.param_text(sep, call)?;
        }
        if let Some(block) = self.optional_block(cur)? {
            self.pages.template = Some(PageTemplate::from_block(block, call));
        }
        self.pages.used = true;
        res.push_str(MARKER);
        Ok(())
    }

    pub(crate) fn paginate_items_per_page(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        self.pages.items_per_page = self.per_page_param(call)?;
        Ok(())
    }

    pub(crate) fn paginate_separator(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        self.pages.separator = self.first_param(call)?;
        Ok(())
    }

    pub(crate) fn paginate_dir(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let dir = self.first_param(call)?;
        self.pages.pages_dir = self.resolve(dir.trim());
        Ok(())
    }

    pub(crate) fn paginate_template(&mut self, call: &CallRecord, cur: &mut ParseCursor<'_>) -> Result<(), ScriptError> {
        let block = self.read_block(cur, call)?;
        self.pages.template = Some(PageTemplate::from_block(block, call));
        Ok(())
    }

    // ── Rendering ─────────────────────────────────────────────────────────────

    /// Replace the marker in `text` with each rendered page.  Returns page
    /// 1 and the pages after it.
    pub(crate) fn render_pages(&mut self, text: String, at: &Location) -> Result<(String, Vec<String>), ScriptError> {
        if !self.pages.used {
            return Ok((text, Vec::new()));
        }
        let markers = text.matches(MARKER).count();
        if markers != 1 {
            return Err(ScriptError::new(
                ErrorKind::Config(format!("paginate must be called exactly once per page, found {markers}")),
                at.clone(),
            ));
        }
        let Some((before, after)) = text.split_once(MARKER) else {
            return Ok((text, Vec::new()));
        };
        let items = std::mem::take(&mut self.pages.items);
        if items.is_empty() {
            return Ok((format!("{before}{after}"), Vec::new()));
        }

        let per_page = self.pages.items_per_page.max(1);
        let no_pages = page_count(items.len(), per_page);
        debug!(items = items.len(), pages = no_pages, "paginate");
        let mut pages = Vec::with_capacity(no_pages);
        for (i, chunk) in items.chunks(per_page).enumerate() {
            let page = self.render_page(i + 1, no_pages, chunk, at)?;
            let mut out = Output::new();
            out.push_str(before);
            out.push_rebased(&page, true);
            out.push_str(after);
            pages.push(out.into_string());
        }
        let first = pages.remove(0);
        Ok((first, pages))
    }

    fn render_page(
        &mut self,
        page_no: usize,
        no_pages: usize,
        chunk: &[String],
        at: &Location,
    ) -> Result<String, ScriptError> {
        let depth = self.store.depth();
        let scope = self.store.current_scope().clone();
        self.store.push_layer(scope);
        let result = self.render_page_in_layer(page_no, no_pages, chunk, at);
        self.store.truncate_to(depth);
        result
    }

    fn render_page_in_layer(
        &mut self,
        page_no: usize,
        no_pages: usize,
        chunk: &[String],
        at: &Location,
    ) -> Result<String, ScriptError> {
        let count = |n: usize| Value::Int64(i64::try_from(n).unwrap_or(i64::MAX));
        let bindings = [
            ("paginate.page", TypeTag::Str, Value::Str(chunk.join(&self.pages.separator))),
            ("paginate.page_no", TypeTag::Int64, count(page_no)),
            ("paginate.no_pages", TypeTag::Int64, count(no_pages)),
            ("paginate.separator", TypeTag::Str, Value::Str(self.pages.separator.clone())),
            ("paginate.items_per_page", TypeTag::Int64, count(self.pages.items_per_page)),
        ];
        let opts = DeclOptions { constant: true, ..DeclOptions::default() };
        for (name, ty, value) in bindings {
            self.store
                .declare(name, ty, value, opts)
                .map_err(|e| ScriptError::new(e, at.clone()))?;
        }
        let template = self.pages.template.clone().unwrap_or_else(|| PageTemplate {
            text: DEFAULT_TEMPLATE.to_owned(),
            dialect: Dialect::N,
            source: at.source.clone(),
            line: at.line,
        });
        self.process_text(&template.text, template.dialect, &template.source, template.line)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> Location {
        Location::new(SourceRef::new("page.html"), 1)
    }

    fn render(src: &str) -> Result<(String, Vec<String>), ScriptError> {
        let mut interp = Interpreter::for_tests();
        let text = interp.process_str(src, Dialect::N)?;
        interp.render_pages(text, &at())
    }

    #[test]
    fn counts() {
        assert_eq!(page_count(0, 3), 0);
        assert_eq!(page_count(5, 2), 3);
        assert_eq!(page_count(4, 2), 2);
    }

    #[test]
    fn no_paginate_leaves_text_alone() {
        let (first, rest) = render("plain").unwrap();
        assert_eq!(first, "plain");
        assert!(rest.is_empty());
    }

    #[test]
    fn items_split_into_pages() {
        let src = "@item(a)@item(b)@item(c)<@paginate(2, \",\")>";
        let (first, rest) = render(src).unwrap();
        assert_eq!(first, "<a,b>");
        assert_eq!(rest, ["<c>"]);
    }

    #[test]
    fn template_sees_page_bindings() {
        let src = "@item(x)@item(y)@paginate(1){$[paginate.page_no]/$[paginate.no_pages]:$[paginate.page]}";
        let (first, rest) = render(src).unwrap();
        assert_eq!(first, "1/2:x");
        assert_eq!(rest, ["2/2:y"]);
    }

    #[test]
    fn template_set_separately_and_items_with_blocks() {
        let src = "@paginate.template(){[$[paginate.page]]}@paginate.separator(\"|\")\
                   @item(){@+(1, 1)}@item(z)@paginate(5)";
        let (first, rest) = render(src).unwrap();
        assert_eq!(first, "[2|z]");
        assert!(rest.is_empty());
    }

    #[test]
    fn pages_are_rebased_to_marker_column() {
        let src = "@item(\"a\nb\")<ul>\n  @paginate(1)\n</ul>";
        let (first, _) = render(src).unwrap();
        assert_eq!(first, "<ul>\n  a\n  b\n</ul>");
    }

    #[test]
    fn zero_items_remove_marker() {
        let (first, rest) = render("[@paginate(3)]").unwrap();
        assert_eq!(first, "[]");
        assert!(rest.is_empty());
    }

    #[test]
    fn marker_count_is_checked() {
        let err = render("@item(a)@paginate(1)@paginate(1)").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Config(_)));
    }

    #[test]
    fn bad_page_size() {
        let err = render("@paginate(0)").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Type(_)));
    }

    #[test]
    fn no_items_reports_count() {
        let mut interp = Interpreter::for_tests();
        let out = interp.process_str("@item(a)@item(b)@paginate.no_items()", Dialect::N).unwrap();
        assert_eq!(out, "2");
    }

    #[test]
    fn page_bindings_are_constant() {
        let src = "@item(a)@paginate(1){@=(paginate.page, b)}";
        let err = render(src).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Scope(_)));
    }
}
