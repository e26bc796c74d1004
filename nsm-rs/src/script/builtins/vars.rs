//! Declaration, assignment, scope and introspection built-ins, plus struct
//! instances and vector methods.

use crate::script::cursor::{unquote, ParseCursor, RawItem};
use crate::script::error::{AssignError, ErrorKind, Location, ScriptError};
use crate::script::interp::{split_index, Interpreter};
use crate::script::processor::CallRecord;
use crate::script::signal::{ControlSignal, Flow};
use crate::script::store::{Binding, DeclOptions, FunctionBody, ScopePath, StructDef, VectorMethod};
use crate::script::value::{TypeTag, Value};

use super::ops::{ArithOp, Operand};
use super::flag;

fn decl_options(call: &CallRecord) -> DeclOptions {
    DeclOptions {
        constant: call.has_option("const"),
        private: call.has_option("private"),
        layer: None,
    }
}

/// `a=1` → (`a`, Some(`1`)); `b` → (`b`, None).
fn split_init(item: &RawItem) -> (String, Option<RawItem>) {
    if item.quoted {
        return (item.text.clone(), None);
    }
    match item.text.split_once('=') {
        Some((name, value)) => {
            let value = value.trim();
            let init = match unquote(value) {
                Some(text) => RawItem { text, quoted: true, line: item.line },
                None => RawItem { text: value.to_owned(), quoted: false, line: item.line },
            };
            (name.trim().to_owned(), Some(init))
        }
        None => (item.text.trim().to_owned(), None),
    }
}

impl Interpreter {
    fn name_param(&mut self, item: &RawItem, call: &CallRecord) -> Result<String, ScriptError> {
        Ok(self.param_text(item, call)?.trim().to_owned())
    }

    /// Resolve a type name, including declared structs.
    fn type_named(&self, name: &str, call: &CallRecord) -> Result<TypeTag, ScriptError> {
        if let Some(ty) = TypeTag::parse(name) {
            return Ok(ty);
        }
        if self.store.struct_def(name).is_some() {
            return Ok(TypeTag::Struct(name.to_owned()));
        }
        Err(call.err(ErrorKind::Type(format!("unknown type '{name}'"))))
    }

    // ── Declaration ───────────────────────────────────────────────────────────

    /// `:=(type, a=1, b)`
    pub(super) fn declare(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let ty_name = self.name_param(&call.params[0], call)?;
        let ty = self.type_named(&ty_name, call)?;
        self.declare_from_call(ty, call, 1)
    }

    /// Declare every `name[=init]` parameter after the first `skip`.
    pub(crate) fn declare_from_call(
        &mut self,
        ty: TypeTag,
        call: &CallRecord,
        skip: usize,
    ) -> Result<(), ScriptError> {
        let opts = decl_options(call);
        for item in call.params.iter().skip(skip) {
            let (name, init) = split_init(item);
            let name = if name.contains(['@', '$']) {
                let raw = RawItem { text: name, quoted: false, line: item.line };
                self.name_param(&raw, call)?
            } else {
                name
            };
            self.declare_one(&name, &ty, init.as_ref(), opts, call)?;
        }
        Ok(())
    }

    fn declare_one(
        &mut self,
        name: &str,
        ty: &TypeTag,
        init: Option<&RawItem>,
        opts: DeclOptions,
        call: &CallRecord,
    ) -> Result<(), ScriptError> {
        match ty {
            TypeTag::Struct(struct_name) => {
                let def = self.store.struct_def(struct_name).cloned().ok_or_else(|| {
                    call.err(ErrorKind::Type(format!("unknown struct '{struct_name}'")))
                })?;
                self.instantiate(&def, name, opts, call)
            }
            TypeTag::Function => Err(call.err(ErrorKind::Type(
                "functions are declared with function(name){…}".into(),
            ))),
            ty if ty.is_stream() => {
                self.store
                    .declare(name, ty.clone(), Value::default_for(ty), opts)
                    .map_err(|e| call.err(e))?;
                if let Some(init) = init {
                    let path = self.param_text(init, call)?;
                    self.open_stream(name, &path, call)?;
                }
                Ok(())
            }
            ty => {
                let value = match init {
                    Some(init) => {
                        let text = self.param_text(init, call)?;
                        Value::coerce(ty, &text).map_err(|reason| {
                            call.err(AssignError::TypeMismatch {
                                name: name.to_owned(),
                                ty: ty.to_string(),
                                reason,
                            })
                        })?
                    }
                    None => Value::default_for(ty),
                };
                self.store.declare(name, ty.clone(), value, opts).map_err(|e| call.err(e))
            }
        }
    }

    // ── Structs ───────────────────────────────────────────────────────────────

    /// `struct(Name){member declarations}`
    pub(super) fn define_struct(&mut self, call: &CallRecord, cur: &mut ParseCursor<'_>) -> Result<(), ScriptError> {
        let name = self.name_param(&call.params[0], call)?;
        let block = self.read_block(cur, call)?;
        let def = StructDef {
            name,
            body: block.text,
            dialect: call.dialect,
            defined_at: Location::new(call.source().clone(), block.line),
        };
        self.store.define_struct(def).map_err(|e| call.err(e))
    }

    /// Replay the struct body in a scratch layer and re-home every member it
    /// declared as `inst.member`.
    fn instantiate(
        &mut self,
        def: &StructDef,
        inst: &str,
        opts: DeclOptions,
        call: &CallRecord,
    ) -> Result<(), ScriptError> {
        let ty = TypeTag::Struct(def.name.clone());
        self.store
            .declare(inst, ty, Value::Struct(def.name.clone()), opts)
            .map_err(|e| call.err(e))?;

        let depth = self.store.depth();
        let scope = self.store.current_scope().clone();
        self.store.push_layer(scope);
        let replayed = self.process_text(&def.body, def.dialect, &def.defined_at.source, def.defined_at.line);
        let members: Vec<Binding> = self
            .store
            .layers()
            .last()
            .map(|layer| {
                layer
                    .bindings()
                    .filter(|b| !matches!(b.function().map(|f| &f.body), Some(FunctionBody::Vector { .. })))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.store.truncate_to(depth);
        replayed?;

        for member in members {
            let full = format!("{inst}.{}", member.name);
            let member_opts = DeclOptions {
                constant: member.is_constant || opts.constant,
                private: member.is_private || opts.private,
                layer: None,
            };
            self.store
                .declare(&full, member.ty, member.value, member_opts)
                .map_err(|e| call.err(e))?;
            self.store.add_derived(inst, &full);
        }
        Ok(())
    }

    // ── Assignment ────────────────────────────────────────────────────────────

    /// `=(name, value)` or `=(name, type, value)`.
    pub(super) fn assign(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let name = self.name_param(&call.params[0], call)?;
        if call.params.len() == 3 {
            let ty_name = self.name_param(&call.params[1], call)?;
            let ty = self.type_named(&ty_name, call)?;
            if self.store.lookup(&name).is_none() {
                return self.declare_one(&name, &ty, Some(&call.params[2]), decl_options(call), call);
            }
        }
        let value_item = &call.params[call.params.len() - 1];
        let text = self.param_text(value_item, call)?;

        if self.store.lookup(&name).is_none() {
            if let Some((base, idx)) = split_index(&name) {
                let base = base.to_owned();
                return self.assign_element(&base, idx, &text, call);
            }
        }
        self.store.assign(&name, &text).map_err(|e| call.err(e))
    }

    fn assign_element(&mut self, base: &str, idx: &str, text: &str, call: &CallRecord) -> Result<(), ScriptError> {
        let i: usize = idx
            .trim()
            .parse()
            .ok()
            .or_else(|| self.store.lookup(idx.trim()).and_then(|b| b.value.as_f64()).map(|x| x as usize))
            .ok_or_else(|| call.err(ErrorKind::Type(format!("bad index '{idx}'"))))?;
        let x: f64 = text
            .trim()
            .parse()
            .map_err(|_| call.err(ErrorKind::Type(format!("'{text}' is not a number"))))?;
        match self.store.value_mut(base).map_err(|e| call.err(e))? {
            Value::DoubleVec(v) => match v.get_mut(i) {
                Some(slot) => {
                    *slot = x;
                    Ok(())
                }
                None => Err(call.err(ErrorKind::Type(format!("{base}: index {i} out of range")))),
            },
            _ => Err(call.err(ErrorKind::Type(format!("{base} is not a vector")))),
        }
    }

    /// `+=(x, …)` and friends.
    pub(super) fn compound_assign(&mut self, op: ArithOp, call: &CallRecord) -> Result<(), ScriptError> {
        let name = self.name_param(&call.params[0], call)?;
        let current = self
            .store
            .lookup(&name)
            .map(|b| b.value.clone())
            .ok_or_else(|| call.err(ErrorKind::UndefinedVariable(name.clone())))?;
        let mut operands = vec![Operand::from_value(current, self)];
        operands.extend(self.operands(call, 1)?);
        let value = self.fold_arith(op, call, &operands)?;
        self.store.assign_value(&name, value).map_err(|e| call.err(e))
    }

    /// Add `delta` to a numeric or char variable.
    pub(crate) fn step_variable(&mut self, name: &str, delta: i32, call: &CallRecord) -> Result<(), ScriptError> {
        let overflow = || call.err(ErrorKind::Type(format!("{name}: overflow")));
        let slot = self.store.value_mut(name).map_err(|e| call.err(e))?;
        match slot {
            Value::Int(n) => *n = n.checked_add(delta).ok_or_else(overflow)?,
            Value::Int64(n) => *n = n.checked_add(i64::from(delta)).ok_or_else(overflow)?,
            Value::Double(x) => *x += f64::from(delta),
            Value::Char(c) => {
                let code = i64::from(u32::from(*c)) + i64::from(delta);
                *c = u32::try_from(code).ok().and_then(char::from_u32).ok_or_else(overflow)?;
            }
            other => {
                let ty = other.type_tag();
                return Err(call.err(ErrorKind::Type(format!("cannot step {name} of type {ty}"))));
            }
        }
        Ok(())
    }

    pub(super) fn step_each(&mut self, delta: i32, call: &CallRecord) -> Result<(), ScriptError> {
        for item in &call.params {
            let name = self.name_param(item, call)?;
            self.step_variable(&name, delta, call)?;
        }
        Ok(())
    }

    pub(super) fn forget(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        for item in &call.params {
            let name = self.name_param(item, call)?;
            if !self.store.forget(&name) {
                return Err(call.err(ErrorKind::UndefinedVariable(name)));
            }
        }
        Ok(())
    }

    // ── Scope and introspection ───────────────────────────────────────────────

    /// `scope+=(name, paths…)`
    pub(super) fn scope_add(&mut self, call: &CallRecord) -> Result<(), ScriptError> {
        let name = self.name_param(&call.params[0], call)?;
        for item in &call.params[1..] {
            let path = self.name_param(item, call)?;
            self.store
                .add_visibility(&name, ScopePath::parse(&path))
                .map_err(|e| call.err(e))?;
        }
        Ok(())
    }

    fn visible_binding(&mut self, call: &CallRecord) -> Result<(String, Option<&Binding>), ScriptError> {
        let name = self.name_param(&call.params[0], call)?;
        Ok((name.clone(), self.store.lookup(&name)))
    }

    pub(super) fn type_of(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let name = self.name_param(&call.params[0], call)?;
        if self.frame_value(&name).is_some() {
            res.push_str("string");
            return Ok(());
        }
        let b = self
            .store
            .lookup(&name)
            .ok_or_else(|| call.err(ErrorKind::UndefinedVariable(name.clone())))?;
        res.push_str(b.ty.name());
        Ok(())
    }

    pub(super) fn binding_flag(
        &mut self,
        call: &CallRecord,
        res: &mut String,
        f: impl Fn(&Binding) -> bool,
    ) -> Result<(), ScriptError> {
        let (name, binding) = self.visible_binding(call)?;
        let b = binding.ok_or_else(|| call.err(ErrorKind::UndefinedVariable(name)))?;
        res.push_str(flag(f(b)));
        Ok(())
    }

    pub(super) fn layer_of(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let (name, binding) = self.visible_binding(call)?;
        let b = binding.ok_or_else(|| call.err(ErrorKind::UndefinedVariable(name)))?;
        res.push_str(&b.layer.to_string());
        Ok(())
    }

    pub(super) fn defined(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let name = self.name_param(&call.params[0], call)?;
        let known = self.frame_value(&name).is_some()
            || self.store.lookup(&name).is_some()
            || self.store.struct_def(&name).is_some();
        res.push_str(flag(known));
        Ok(())
    }

    // ── Vector methods ────────────────────────────────────────────────────────

    pub(crate) fn vector_method(
        &mut self,
        target: &str,
        method: VectorMethod,
        call: &CallRecord,
        res: &mut String,
    ) -> Flow {
        let params = self.eval_params(call)?;
        let numbers = |params: &[String]| -> Result<Vec<f64>, ScriptError> {
            params
                .iter()
                .map(|p| {
                    p.trim()
                        .parse::<f64>()
                        .map_err(|_| call.err(ErrorKind::Type(format!("'{p}' is not a number"))))
                })
                .collect()
        };
        let not_vector = || call.err(ErrorKind::Type(format!("{target} is not a vector")));

        match method {
            VectorMethod::Size | VectorMethod::At => {
                let b = self
                    .store
                    .lookup(target)
                    .ok_or_else(|| call.err(ErrorKind::UndefinedVariable(target.to_owned())))?;
                let Value::DoubleVec(v) = &b.value else {
                    return Err(not_vector());
                };
                if method == VectorMethod::Size {
                    res.push_str(&v.len().to_string());
                } else {
                    let i = numbers(&params)?.first().copied().unwrap_or(-1.0);
                    let x = (i >= 0.0)
                        .then(|| v.get(i as usize))
                        .flatten()
                        .ok_or_else(|| call.err(ErrorKind::Type(format!("{target}: index {i} out of range"))))?;
                    res.push_str(&self.num_format.format(*x));
                }
            }
            VectorMethod::PushBack => {
                let xs = numbers(&params)?;
                match self.store.value_mut(target).map_err(|e| call.err(e))? {
                    Value::DoubleVec(v) => v.extend(xs),
                    _ => return Err(not_vector()),
                }
            }
            VectorMethod::PopBack => match self.store.value_mut(target).map_err(|e| call.err(e))? {
                Value::DoubleVec(v) => {
                    if v.pop().is_none() {
                        return Err(call.err(ErrorKind::Type(format!("{target} is empty"))));
                    }
                }
                _ => return Err(not_vector()),
            },
            VectorMethod::Clear => match self.store.value_mut(target).map_err(|e| call.err(e))? {
                Value::DoubleVec(v) => v.clear(),
                _ => return Err(not_vector()),
            },
        }
        Ok(ControlSignal::Proceed)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::script::error::ErrorKind;
    use crate::script::interp::Interpreter;
    use crate::script::processor::Dialect;
    use crate::script::value::Value;

    fn n(src: &str) -> String {
        Interpreter::for_tests().process_str(src, Dialect::N).expect("process failed")
    }

    fn kind(src: &str) -> ErrorKind {
        Interpreter::for_tests().process_str(src, Dialect::N).unwrap_err().kind
    }

    #[test]
    fn declare_forms() {
        assert_eq!(n("@:=(int, a=1, b)$[a]$[b]"), "10");
        assert_eq!(n("@double(d=2.5)$[d]"), "2.5");
        assert_eq!(n("@std::string(s=\"x, y\")$[s]"), "x, y");
        assert_eq!(n("@:=(bool, f=true)$[f]"), "1");
    }

    #[test]
    fn declare_rejects_bad_initialiser() {
        assert!(matches!(kind("@:=(int, a=abc)"), ErrorKind::Type(_)));
        assert!(matches!(kind("@:=(char, c=ab)"), ErrorKind::Type(_)));
        assert!(matches!(kind("@:=(widget, w)"), ErrorKind::Type(_)));
    }

    #[test]
    fn redeclaration_in_same_layer() {
        assert!(matches!(kind("@int(a)@int(a)"), ErrorKind::Type(_)));
    }

    #[test]
    fn const_assignment_is_scope_error() {
        assert!(matches!(kind("@:={const}(int, a=1)@=(a, 2)"), ErrorKind::Scope(_)));
    }

    #[test]
    fn assign_and_declare_or_assign() {
        assert_eq!(n("@=(x, int, 5)@=(x, int, 6)$[x]"), "6");
        assert_eq!(n("@int(x)@=(x, 3.9)$[x]"), "3");
        assert!(matches!(kind("@=(nope, 1)"), ErrorKind::UndefinedVariable(_)));
    }

    #[test]
    fn compound_assignment() {
        assert_eq!(n("@int(x=5)@+=(x, 3)@*=(x, 2)$[x]"), "16");
        assert_eq!(n("@string(s=a)@+=(s, b, c)$[s]"), "abc");
        assert!(matches!(kind("@string(s=a)@-=(s, b)"), ErrorKind::Type(_)));
    }

    #[test]
    fn increments() {
        assert_eq!(n("@int(i=1)@i++@++i@++(i)$[i]"), "4");
        assert_eq!(n("@double(d=0.5)@d--$[d]"), "-0.5");
        assert_eq!(n("@char(c=a)@c++$[c]"), "b");
        assert!(matches!(kind("@string(s)@s++"), ErrorKind::Type(_)));
    }

    #[test]
    fn forget_removes() {
        assert_eq!(n("@int(a)@forget(a)@defined(a)"), "0");
        assert!(matches!(kind("@forget(a)"), ErrorKind::UndefinedVariable(_)));
    }

    #[test]
    fn introspection() {
        assert_eq!(n("@:={const}(int, a)@typeof(a) @is_const(a) @is_private(a) @layer(a)"), "int 1 0 0");
        assert_eq!(n("@scope()"), "");
    }

    #[test]
    fn vector_methods() {
        let src = "@vector(v)@v.push_back(1, 2, 3)@v.pop_back()@v.size() @v.at(1) $[v]";
        assert_eq!(n(src), "2 2 1, 2");
        assert_eq!(n("@vector(v=\"[4 5]\")@v.clear()@v.size()"), "0");
        assert!(matches!(kind("@vector(v)@v.pop_back()"), ErrorKind::Type(_)));
    }

    #[test]
    fn vector_element_assignment() {
        assert_eq!(n("@vector(v=\"1, 2\")@=(v[1], 7)$[v]"), "1, 7");
    }

    #[test]
    fn struct_instances_own_members() {
        let src = "@struct(Point){@int(x=1)@int(y=2)}@Point(p)@:=(Point, q)$[p.x]$[q.y]";
        assert_eq!(n(src), "12");

        let mut interp = Interpreter::for_tests();
        interp
            .process_str("@struct(P){@int(x)@vector(v)}@P(p)@forget(p)", Dialect::N)
            .unwrap();
        assert!(interp.store.lookup("p.x").is_none());
        assert!(interp.store.lookup("p.v").is_none());
    }

    #[test]
    fn struct_member_vectors_get_methods() {
        let mut interp = Interpreter::for_tests();
        let out = interp
            .process_str("@struct(S){@vector(v)}@S(s)@s.v.push_back(9)@s.v.size()", Dialect::N)
            .unwrap();
        assert_eq!(out, "1");
        assert_eq!(interp.store.lookup("s.v").unwrap().value, Value::DoubleVec(vec![9.0]));
    }
}
