//! Control-flow built-ins.

use crate::script::cursor::{split_list, Block, ParseCursor, RawItem};
use crate::script::error::{Arity, ErrorKind, Location, ScriptError};
use crate::script::expr;
use crate::script::interp::Interpreter;
use crate::script::processor::{parse_err, CallRecord, Dialect};
use crate::script::signal::{ControlSignal, Flow};
use crate::script::store::{DeclOptions, FunctionBody, FunctionDef};
use crate::script::value::{parse_bool_literal, TypeTag, Value};

/// What a loop does after one pass over its body.
enum Pass {
    Next,
    Stop,
    Leave(ControlSignal),
}

fn after_pass(sig: ControlSignal) -> Pass {
    match sig {
        ControlSignal::Proceed | ControlSignal::ContinueLoop => Pass::Next,
        ControlSignal::Break => Pass::Stop,
        other => Pass::Leave(other),
    }
}

fn first_line(call: &CallRecord) -> usize {
    call.params.first().map_or(call.location.line, |p| p.line)
}

impl Interpreter {
    // ── Conditions ────────────────────────────────────────────────────────────

    /// Truth of a call's unsplit parameter text.
    pub(crate) fn condition(&mut self, call: &CallRecord) -> Result<bool, ScriptError> {
        let raw = call.raw_params.as_deref().unwrap_or("").trim().to_owned();
        self.eval_condition(&raw, call, first_line(call), true)
    }

    /// A literal bool, then the numeric engine, then a variable's value;
    /// failing those, the text is processed once and tried again.
    fn eval_condition(
        &mut self,
        text: &str,
        call: &CallRecord,
        line: usize,
        retry: bool,
    ) -> Result<bool, ScriptError> {
        if let Some(b) = parse_bool_literal(text) {
            return Ok(b);
        }
        let diagnostic = match expr::compile(text, &*self) {
            Ok(compiled) => match compiled.evaluate(self) {
                Ok(x) => return Ok(x != 0.0),
                Err(d) => d,
            },
            Err(d) => d,
        };
        let from_variable = match self.frame_value(text) {
            Some(v) => Value::Str(v).as_bool(),
            None => self.store.lookup(text).and_then(|b| b.value.as_bool()),
        };
        if let Some(b) = from_variable {
            return Ok(b);
        }
        if retry && text.contains(['@', '$', '`']) {
            let processed = self.process_text(text, Dialect::N, call.source(), line)?;
            return self.eval_condition(processed.trim(), call, line, false);
        }
        Err(call.err(ErrorKind::External {
            what: "exprtk".into(),
            diagnostic: format!("{}: '{text}': {diagnostic}", call.name),
        }))
    }

    // ── if / else-if / else ───────────────────────────────────────────────────

    pub(super) fn run_if(&mut self, call: &CallRecord, cur: &mut ParseCursor<'_>, res: &mut String) -> Flow {
        let block = self.read_block(cur, call)?;
        let mut taken = self.condition(call)?;
        let mut sig = if taken {
            self.run_block(&block, call, res, !call.has_option("!s"))?
        } else {
            ControlSignal::Proceed
        };
        while let Some((branch, is_else)) = self.chained_branch(cur, call)? {
            let block = self.read_block(cur, &branch)?;
            if !taken && (is_else || self.condition(&branch)?) {
                taken = true;
                sig = self.run_block(&block, &branch, res, !branch.has_option("!s"))?;
            }
            if is_else {
                break;
            }
        }
        Ok(sig)
    }

    /// Consume a following `else-if(…){` or `else{` header, if there is one.
    fn chained_branch(
        &mut self,
        cur: &mut ParseCursor<'_>,
        call: &CallRecord,
    ) -> Result<Option<(CallRecord, bool)>, ScriptError> {
        let mark = cur.mark();
        match call.dialect {
            Dialect::N => cur.skip_ws(),
            Dialect::F => {
                let line = cur.line;
                cur.skip_ws_and_pragma_comments()
                    .map_err(|e| parse_err(&cur.source, line, e))?;
            }
        }
        if cur.peek_byte() == Some(b'@') {
            cur.advance(1);
        }
        let line = cur.line;
        let name = match cur.read_name() {
            Some(name @ ("else-if" | "else")) => name,
            _ => {
                cur.restore(mark);
                return Ok(None);
            }
        };
        let branch = self.read_call(name, cur, call.dialect, line)?;
        let is_else = name == "else";
        let well_formed = if is_else {
            let before = cur.mark();
            cur.skip_ws();
            let opens = cur.peek_byte() == Some(b'{');
            cur.restore(before);
            opens
        } else {
            branch.raw_params.is_some()
        };
        if !well_formed {
            cur.restore(mark);
            return Ok(None);
        }
        Ok(Some((branch, is_else)))
    }

    // ── Loops ─────────────────────────────────────────────────────────────────

    pub(super) fn run_while(&mut self, call: &CallRecord, cur: &mut ParseCursor<'_>, res: &mut String) -> Flow {
        let block = self.read_block(cur, call)?;
        let scoped = !call.has_option("!s");
        while self.condition(call)? {
            match after_pass(self.run_block(&block, call, res, scoped)?) {
                Pass::Next => {}
                Pass::Stop => break,
                Pass::Leave(sig) => return Ok(sig),
            }
        }
        Ok(ControlSignal::Proceed)
    }

    pub(super) fn run_do_while(&mut self, call: &CallRecord, cur: &mut ParseCursor<'_>, res: &mut String) -> Flow {
        let block = self.read_block(cur, call)?;
        let scoped = !call.has_option("!s");
        loop {
            match after_pass(self.run_block(&block, call, res, scoped)?) {
                Pass::Next => {}
                Pass::Stop => break,
                Pass::Leave(sig) => return Ok(sig),
            }
            if !self.condition(call)? {
                break;
            }
        }
        Ok(ControlSignal::Proceed)
    }

    /// `for(init; cond; step[; post]){body}`.  `post` runs once, after the
    /// loop ends.
    pub(super) fn run_for(&mut self, call: &CallRecord, cur: &mut ParseCursor<'_>, res: &mut String) -> Flow {
        let block = self.read_block(cur, call)?;
        let raw = call.raw_params.clone().unwrap_or_default();
        let clauses = split_list(&raw, ';', first_line(call));
        if !(3..=4).contains(&clauses.len()) {
            return Err(call.err(ErrorKind::Arity {
                call: call.name.clone(),
                what: "clauses",
                expected: Arity::Between(3, 4),
                got: clauses.len(),
            }));
        }
        let scoped = !call.has_option("!s");
        let depth = self.store.depth();
        if scoped {
            let scope = self.store.current_scope().clone();
            self.store.push_layer(scope);
        }
        let result = self.for_loop(&clauses, &block, call, res, scoped);
        self.store.truncate_to(depth);
        result
    }

    fn for_loop(
        &mut self,
        clauses: &[RawItem],
        block: &Block,
        call: &CallRecord,
        res: &mut String,
        scoped: bool,
    ) -> Flow {
        self.for_clause(&clauses[0], call)?;
        loop {
            let cond = &clauses[1];
            if !cond.text.is_empty() && !self.eval_condition(&cond.text, call, cond.line, true)? {
                break;
            }
            match after_pass(self.run_block(block, call, res, scoped)?) {
                Pass::Next => {}
                Pass::Stop => break,
                Pass::Leave(sig) => return Ok(sig),
            }
            self.for_clause(&clauses[2], call)?;
        }
        if let Some(post) = clauses.get(3) {
            self.for_clause(post, call)?;
        }
        Ok(ControlSignal::Proceed)
    }

    /// Clauses without `++`/`--` that compile as expressions go through the
    /// numeric engine; everything else is processed in the caller's
    /// dialect.
    fn for_clause(&mut self, clause: &RawItem, call: &CallRecord) -> Result<(), ScriptError> {
        let text = clause.text.trim();
        if text.is_empty() {
            return Ok(());
        }
        if !text.contains("++") && !text.contains("--") {
            if let Ok(compiled) = expr::compile(text, &*self) {
                compiled.evaluate(self).map_err(|d| {
                    ScriptError::new(
                        ErrorKind::External { what: "exprtk".into(), diagnostic: d.to_string() },
                        Location::new(call.source().clone(), clause.line),
                    )
                })?;
                return Ok(());
            }
        }
        self.process_text(text, call.dialect, call.source(), clause.line)?;
        Ok(())
    }

    // ── Functions ─────────────────────────────────────────────────────────────

    pub(super) fn define_function(
        &mut self,
        call: &CallRecord,
        cur: &mut ParseCursor<'_>,
        unscoped: bool,
    ) -> Result<(), ScriptError> {
        let name = self.first_param(call)?.trim().to_owned();
        let block = self.read_block(cur, call)?;
        let def = FunctionDef {
            body: FunctionBody::Source(block.text),
            dialect: call.dialect,
            defined_at: Location::new(call.source().clone(), block.line),
            emits_output: call.dialect == Dialect::F || call.has_option("o"),
            is_unscoped: unscoped,
        };
        let opts = DeclOptions {
            constant: call.has_option("const"),
            private: call.has_option("private"),
            layer: None,
        };
        self.store
            .declare(&name, TypeTag::Function, Value::Function(def), opts)
            .map_err(|e| call.err(e))
    }

    pub(super) fn run_return(&mut self, call: &CallRecord) -> Flow {
        let value = match call.params.first() {
            Some(p) => Some(self.param_text(p, call)?),
            None => None,
        };
        Ok(ControlSignal::Return(value))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
