//! Layered, scoped variable and function store.
//!
//! The store is a stack of [`Layer`]s.  Lookup walks from the innermost
//! layer outward and returns the first binding with a matching name that is
//! visible from the current scope.  Functions are ordinary bindings of type
//! [`TypeTag::Function`] whose value holds a [`FunctionDef`].
//!
//! One thread owns a store at a time; there is no locking here.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use super::error::{AssignError, DeclError, Location, SourceRef};
use super::processor::Dialect;
use super::value::{NumFormat, TypeTag, Value};

// ── ScopePath ─────────────────────────────────────────────────────────────────

/// Dotted nesting path such as `site.nav.`; the root scope is empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ScopePath(String);

impl ScopePath {
    pub fn root() -> Self {
        ScopePath(String::new())
    }

    /// Build from user text, adding the trailing `.` if it is missing.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s.ends_with('.') {
            ScopePath(s.to_owned())
        } else {
            ScopePath(format!("{s}."))
        }
    }

    pub fn child(&self, name: &str) -> Self {
        ScopePath(format!("{}{}.", self.0, name))
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.').filter(|seg| !seg.is_empty())
    }

    /// `self` is `other` or nested inside it, compared segment by segment.
    pub fn is_within(&self, other: &ScopePath) -> bool {
        let mut mine = self.segments();
        other.segments().all(|seg| mine.next() == Some(seg))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Functions ─────────────────────────────────────────────────────────────────

/// Methods synthesized alongside every vector binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorMethod {
    PushBack,
    PopBack,
    Size,
    At,
    Clear,
}

impl VectorMethod {
    pub const ALL: [(&'static str, VectorMethod); 5] = [
        ("push_back", VectorMethod::PushBack),
        ("pop_back", VectorMethod::PopBack),
        ("size", VectorMethod::Size),
        ("at", VectorMethod::At),
        ("clear", VectorMethod::Clear),
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    /// Source text in the function's dialect.
    Source(String),
    /// A method bound to the vector binding `target`.
    Vector { target: String, method: VectorMethod },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub body: FunctionBody,
    pub dialect: Dialect,
    pub defined_at: Location,
    /// Result text is emitted by default when called from an `F` body.
    pub emits_output: bool,
    /// Runs in the caller's layer instead of opening a new one.
    pub is_unscoped: bool,
}

impl FunctionDef {
    pub fn body_text(&self) -> &str {
        match &self.body {
            FunctionBody::Source(s) => s,
            FunctionBody::Vector { .. } => "",
        }
    }
}

// ── Bindings and layers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct DeclOptions {
    pub constant: bool,
    pub private: bool,
    /// Target layer; the innermost layer when `None`.
    pub layer: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub ty: TypeTag,
    pub value: Value,
    pub layer: usize,
    pub owning_scope: ScopePath,
    pub visible_in: BTreeSet<ScopePath>,
    pub is_constant: bool,
    pub is_private: bool,
    /// Bindings created with this one and removed by [`Store::forget`].
    pub derived: Vec<String>,
}

impl Binding {
    pub fn is_visible_from(&self, scope: &ScopePath) -> bool {
        !self.is_private || self.visible_in.iter().any(|s| scope.is_within(s))
    }

    pub fn function(&self) -> Option<&FunctionDef> {
        match &self.value {
            Value::Function(def) => Some(def),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub scope: ScopePath,
    bindings: HashMap<String, Binding>,
    order: Vec<String>,
}

impl Layer {
    fn new(scope: ScopePath) -> Self {
        Layer { scope, bindings: HashMap::new(), order: Vec::new() }
    }

    fn insert(&mut self, binding: Binding) {
        if !self.bindings.contains_key(&binding.name) {
            self.order.push(binding.name.clone());
        }
        self.bindings.insert(binding.name.clone(), binding);
    }

    fn remove(&mut self, name: &str) -> Option<Binding> {
        let b = self.bindings.remove(name)?;
        self.order.retain(|n| n != name);
        Some(b)
    }

    /// Bindings in declaration order.
    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.order.iter().filter_map(|n| self.bindings.get(n))
    }
}

/// A user-declared `struct`: its body is replayed to build each instance.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    pub name: String,
    pub body: String,
    pub dialect: Dialect,
    pub defined_at: Location,
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Store {
    layers: Vec<Layer>,
    structs: HashMap<String, StructDef>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Store { layers: vec![Layer::new(ScopePath::root())], structs: HashMap::new() }
    }

    // ── Layer stack ───────────────────────────────────────────────────────────

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn current_scope(&self) -> &ScopePath {
        // The root layer is never popped.
        &self.layers[self.layers.len() - 1].scope
    }

    pub fn push_layer(&mut self, scope: ScopePath) {
        self.layers.push(Layer::new(scope));
    }

    /// Pop the innermost layer.  The root layer stays; returns `false` then.
    pub fn pop_layer(&mut self) -> bool {
        if self.layers.len() > 1 {
            self.layers.pop();
            true
        } else {
            false
        }
    }

    /// Pop back to `depth` layers (never below the root).
    pub fn truncate_to(&mut self, depth: usize) {
        self.layers.truncate(depth.max(1));
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    // ── Declaration ───────────────────────────────────────────────────────────

    pub fn declare(
        &mut self,
        name: &str,
        ty: TypeTag,
        value: Value,
        opts: DeclOptions,
    ) -> Result<(), DeclError> {
        if !is_valid_name(name) {
            return Err(DeclError::InvalidName(name.to_owned()));
        }
        if self.structs.contains_key(name) || TypeTag::parse(name).is_some() {
            return Err(DeclError::StructCollision(name.to_owned()));
        }
        let top = self.layers.len() - 1;
        let layer = opts.layer.unwrap_or(top).min(top);
        if self.layers[layer].bindings.contains_key(name) {
            return Err(DeclError::Redeclaration { name: name.to_owned(), layer });
        }
        let scope = self.layers[layer].scope.clone();

        let mut derived = Vec::new();
        if ty == TypeTag::DoubleVec {
            for (suffix, method) in VectorMethod::ALL {
                let method_name = format!("{name}.{suffix}");
                let def = FunctionDef {
                    body: FunctionBody::Vector { target: name.to_owned(), method },
                    dialect: Dialect::F,
                    defined_at: Location::new(SourceRef::new("<builtin>"), 0),
                    emits_output: true,
                    is_unscoped: true,
                };
                self.layers[layer].insert(Binding {
                    name: method_name.clone(),
                    ty: TypeTag::Function,
                    value: Value::Function(def),
                    layer,
                    owning_scope: scope.clone(),
                    visible_in: BTreeSet::from([scope.clone()]),
                    is_constant: true,
                    is_private: opts.private,
                    derived: Vec::new(),
                });
                derived.push(method_name);
            }
        }

        self.layers[layer].insert(Binding {
            name: name.to_owned(),
            ty,
            value,
            layer,
            owning_scope: scope.clone(),
            visible_in: BTreeSet::from([scope]),
            is_constant: opts.constant,
            is_private: opts.private,
            derived,
        });
        Ok(())
    }

    /// Record `child` as owned by `parent`, so forgetting `parent` removes it.
    pub fn add_derived(&mut self, parent: &str, child: &str) {
        if let Some(idx) = self.find_visible(parent) {
            if let Some(b) = self.layers[idx].bindings.get_mut(parent) {
                b.derived.push(child.to_owned());
            }
        }
    }

    pub fn define_struct(&mut self, def: StructDef) -> Result<(), DeclError> {
        if TypeTag::parse(&def.name).is_some() {
            return Err(DeclError::StructCollision(def.name));
        }
        if self.structs.contains_key(&def.name) {
            return Err(DeclError::Redeclaration { name: def.name, layer: 0 });
        }
        self.structs.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn struct_def(&self, name: &str) -> Option<&StructDef> {
        self.structs.get(name)
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    fn find_visible(&self, name: &str) -> Option<usize> {
        let scope = self.current_scope();
        self.layers.iter().rposition(|l| {
            l.bindings.get(name).is_some_and(|b| b.is_visible_from(scope))
        })
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        let idx = self.find_visible(name)?;
        self.layers[idx].bindings.get(name)
    }

    pub fn lookup_fn(&self, name: &str) -> Option<&FunctionDef> {
        let scope = self.current_scope();
        self.layers
            .iter()
            .rev()
            .filter_map(|l| l.bindings.get(name))
            .filter(|b| b.is_visible_from(scope))
            .find_map(Binding::function)
    }

    /// Rendered value of a visible binding.
    pub fn text_of(&self, name: &str, fmt: &NumFormat) -> Option<String> {
        self.lookup(name).map(|b| b.value.render(fmt))
    }

    // ── Mutation ──────────────────────────────────────────────────────────────

    fn binding_for_write(&mut self, name: &str) -> Result<&mut Binding, AssignError> {
        let idx = match self.find_visible(name) {
            Some(idx) => idx,
            None if self.layers.iter().any(|l| l.bindings.contains_key(name)) => {
                return Err(AssignError::PrivateViolation(name.to_owned()))
            }
            None => return Err(AssignError::Undefined(name.to_owned())),
        };
        let b = self.layers[idx]
            .bindings
            .get_mut(name)
            .ok_or_else(|| AssignError::Undefined(name.to_owned()))?;
        if b.is_constant {
            return Err(AssignError::ConstantViolation(name.to_owned()));
        }
        Ok(b)
    }

    /// Assign from template text, coercing to the binding's type.
    pub fn assign(&mut self, name: &str, text: &str) -> Result<(), AssignError> {
        let b = self.binding_for_write(name)?;
        let value = Value::coerce(&b.ty, text).map_err(|reason| AssignError::TypeMismatch {
            name: name.to_owned(),
            ty: b.ty.to_string(),
            reason,
        })?;
        b.value = value;
        Ok(())
    }

    /// Assign a typed value; a value of another type is coerced through its
    /// text form.
    pub fn assign_value(&mut self, name: &str, value: Value) -> Result<(), AssignError> {
        let b = self.binding_for_write(name)?;
        if value.type_tag() == b.ty {
            b.value = value;
            return Ok(());
        }
        let text = value.render(&NumFormat::default());
        let coerced = Value::coerce(&b.ty, &text).map_err(|reason| AssignError::TypeMismatch {
            name: name.to_owned(),
            ty: b.ty.to_string(),
            reason,
        })?;
        b.value = coerced;
        Ok(())
    }

    /// In-place access to a writable binding's value.  Callers must keep the
    /// value's type.
    pub fn value_mut(&mut self, name: &str) -> Result<&mut Value, AssignError> {
        Ok(&mut self.binding_for_write(name)?.value)
    }

    /// Remove a binding and everything derived from it.
    pub fn forget(&mut self, name: &str) -> bool {
        let Some(idx) = self.find_visible(name) else {
            return false;
        };
        let Some(binding) = self.layers[idx].remove(name) else {
            return false;
        };
        for child in &binding.derived {
            if self.layers[idx].bindings.contains_key(child) {
                self.forget_in(idx, child);
            }
        }
        true
    }

    fn forget_in(&mut self, idx: usize, name: &str) {
        if let Some(binding) = self.layers[idx].remove(name) {
            for child in &binding.derived {
                self.forget_in(idx, child);
            }
        }
    }

    /// Make a private binding visible from `scope` as well.
    pub fn add_visibility(&mut self, name: &str, scope: ScopePath) -> Result<(), AssignError> {
        let idx = self
            .find_visible(name)
            .ok_or_else(|| AssignError::Undefined(name.to_owned()))?;
        let b = self.layers[idx]
            .bindings
            .get_mut(name)
            .ok_or_else(|| AssignError::Undefined(name.to_owned()))?;
        b.visible_in.insert(scope);
        Ok(())
    }

    /// Innermost-first list of every visible binding name.
    pub fn visible_names(&self) -> Vec<&str> {
        let scope = self.current_scope();
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for layer in self.layers.iter().rev() {
            for b in layer.bindings() {
                if b.is_visible_from(scope) && seen.insert(b.name.as_str()) {
                    out.push(b.name.as_str());
                }
            }
        }
        out
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && !name.contains(|c: char| {
            c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '{' | '}' | ',' | '"' | '\'' | '@' | '$')
        })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn int(store: &mut Store, name: &str, n: i32) {
        store.declare(name, TypeTag::Int, Value::Int(n), DeclOptions::default()).unwrap();
    }

    #[test]
    fn shadowing_and_pop() {
        let mut s = Store::new();
        int(&mut s, "x", 1);
        s.push_layer(ScopePath::root());
        int(&mut s, "x", 2);
        assert_eq!(s.lookup("x").unwrap().value, Value::Int(2));
        assert!(s.pop_layer());
        assert_eq!(s.lookup("x").unwrap().value, Value::Int(1));
        assert!(!s.pop_layer());
    }

    #[test]
    fn redeclaration_in_same_layer_fails() {
        let mut s = Store::new();
        int(&mut s, "x", 1);
        let err = s.declare("x", TypeTag::Str, Value::default(), DeclOptions::default());
        assert_eq!(err, Err(DeclError::Redeclaration { name: "x".into(), layer: 0 }));
    }

    #[test]
    fn type_names_cannot_be_declared() {
        let mut s = Store::new();
        assert!(matches!(
            s.declare("int", TypeTag::Int, Value::Int(0), DeclOptions::default()),
            Err(DeclError::StructCollision(_))
        ));
        s.define_struct(StructDef {
            name: "Point".into(),
            body: String::new(),
            dialect: Dialect::F,
            defined_at: Location::new(SourceRef::new("t"), 1),
        })
        .unwrap();
        assert!(matches!(
            s.declare("Point", TypeTag::Int, Value::Int(0), DeclOptions::default()),
            Err(DeclError::StructCollision(_))
        ));
    }

    #[test]
    fn constant_assign_leaves_value() {
        let mut s = Store::new();
        s.declare(
            "c",
            TypeTag::Int,
            Value::Int(7),
            DeclOptions { constant: true, ..Default::default() },
        )
        .unwrap();
        assert_eq!(s.assign("c", "9"), Err(AssignError::ConstantViolation("c".into())));
        assert_eq!(s.lookup("c").unwrap().value, Value::Int(7));
    }

    #[test]
    fn assign_type_mismatch() {
        let mut s = Store::new();
        int(&mut s, "n", 0);
        assert!(matches!(s.assign("n", "abc"), Err(AssignError::TypeMismatch { .. })));
        s.assign("n", "12").unwrap();
        assert_eq!(s.lookup("n").unwrap().value, Value::Int(12));
    }

    #[test]
    fn assign_value_coerces_across_types() {
        let mut s = Store::new();
        int(&mut s, "n", 0);
        s.assign_value("n", Value::Double(3.0)).unwrap();
        assert_eq!(s.lookup("n").unwrap().value, Value::Int(3));
    }

    #[test]
    fn private_binding_invisible_outside_scope() {
        let mut s = Store::new();
        let ab = ScopePath::parse("a.b");
        s.push_layer(ab.clone());
        s.declare(
            "inner",
            TypeTag::Int,
            Value::Int(1),
            DeclOptions { private: true, ..Default::default() },
        )
        .unwrap();
        s.push_layer(ab.child("c"));
        assert!(s.lookup("inner").is_some());
        s.push_layer(ScopePath::parse("c"));
        assert!(s.lookup("inner").is_none());
        assert_eq!(s.assign("inner", "2"), Err(AssignError::PrivateViolation("inner".into())));
    }

    #[test]
    fn scope_add_grants_visibility() {
        let mut s = Store::new();
        s.push_layer(ScopePath::parse("a"));
        s.declare(
            "p",
            TypeTag::Int,
            Value::Int(1),
            DeclOptions { private: true, ..Default::default() },
        )
        .unwrap();
        s.add_visibility("p", ScopePath::parse("c")).unwrap();
        s.push_layer(ScopePath::parse("c"));
        assert!(s.lookup("p").is_some());
    }

    #[test]
    fn vector_methods_are_derived() {
        let mut s = Store::new();
        s.declare("v", TypeTag::DoubleVec, Value::DoubleVec(vec![]), DeclOptions::default())
            .unwrap();
        assert!(s.lookup_fn("v.push_back").is_some());
        assert!(s.forget("v"));
        assert!(s.lookup_fn("v.push_back").is_none());
        assert!(s.lookup("v.size").is_none());
    }

    #[test]
    fn truncate_never_drops_root() {
        let mut s = Store::new();
        s.push_layer(ScopePath::root());
        s.push_layer(ScopePath::root());
        s.truncate_to(0);
        assert_eq!(s.depth(), 1);
    }

    #[test]
    fn scope_paths() {
        let root = ScopePath::root();
        let a = root.child("a");
        assert_eq!(a.as_str(), "a.");
        assert!(a.child("b").is_within(&a));
        assert!(!ScopePath::parse("c").is_within(&a));
        assert!(a.is_within(&root));
        let nav = ScopePath::parse("site.nav");
        assert!(!ScopePath::root().child("site").child("navigation").is_within(&nav));
        assert!(!ScopePath(String::from("site.navigation")).is_within(&ScopePath(String::from("site.nav"))));
        assert!(ScopePath(String::from("site.nav.menu")).is_within(&ScopePath(String::from("site.nav"))));
        assert!(!root.is_within(&nav));
    }
}
