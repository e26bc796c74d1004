//! Built-in calls.
//!
//! [`Builtin::lookup`] maps a call name to a built-in through a static
//! table (plus a few prefix rules); [`Interpreter::run_builtin`] checks the
//! parameter count and dispatches to the handler.  Handlers write their
//! result text into `res` and return a [`ControlSignal`].

mod bridge;
mod flow;
mod fs;
mod io;
mod ops;
mod vars;

use std::collections::HashMap;
use std::sync::OnceLock;

use super::cursor::ParseCursor;
use super::error::{Arity, ErrorKind, ParseError, ScriptError};
use super::interp::Interpreter;
use super::processor::{CallRecord, Emission};
use super::signal::{ControlSignal, Flow};
use super::value::TypeTag;

pub(crate) use ops::{ArithOp, CmpOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    // operators
    Arith(ArithOp),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    // variables
    Declare,
    TypeDecl,
    Assign,
    CompoundAssign(ArithOp),
    Incr,
    Decr,
    Forget,
    Scope,
    ScopeAdd,
    TypeOf,
    IsConst,
    IsPrivate,
    LayerOf,
    Defined,
    Struct,
    // control flow
    If,
    ElseIf,
    Else,
    While,
    DoWhile,
    For,
    Function,
    Lambda,
    Break,
    Continue,
    Return,
    Quit,
    Exit,
    Kill,
    // input/output
    Console,
    ConsoleLock,
    ConsoleUnlock,
    Read,
    Write,
    Getline,
    Open,
    Close,
    Eof,
    Input,
    Content,
    Dep,
    Precision,
    Fixed,
    Scientific,
    // filesystem
    Cpy,
    Mve,
    Rmv,
    Lst,
    Poke,
    Mkdir,
    Exists,
    Cd,
    // pagination
    Item,
    Paginate,
    PaginateItemsPerPage,
    PaginateSeparator,
    PaginateDir,
    PaginateTemplate,
    PaginateNoItems,
    // bridges
    Lua,
    Exprtk,
    Sys,
    System,
    Script,
}

use Arity::{AtLeast, Between, Exactly};

static TABLE: &[(&str, Builtin, Arity)] = &[
    ("+", Builtin::Arith(ArithOp::Add), AtLeast(1)),
    ("-", Builtin::Arith(ArithOp::Sub), AtLeast(1)),
    ("*", Builtin::Arith(ArithOp::Mul), AtLeast(1)),
    ("/", Builtin::Arith(ArithOp::Div), AtLeast(1)),
    ("%", Builtin::Arith(ArithOp::Mod), AtLeast(1)),
    ("==", Builtin::Cmp(CmpOp::Eq), AtLeast(2)),
    ("!=", Builtin::Cmp(CmpOp::Ne), AtLeast(2)),
    ("<", Builtin::Cmp(CmpOp::Lt), AtLeast(2)),
    ("<=", Builtin::Cmp(CmpOp::Le), AtLeast(2)),
    (">", Builtin::Cmp(CmpOp::Gt), AtLeast(2)),
    (">=", Builtin::Cmp(CmpOp::Ge), AtLeast(2)),
    ("&&", Builtin::And, AtLeast(1)),
    ("||", Builtin::Or, AtLeast(1)),
    ("!", Builtin::Not, Exactly(1)),
    (":=", Builtin::Declare, AtLeast(2)),
    ("=", Builtin::Assign, Between(2, 3)),
    ("+=", Builtin::CompoundAssign(ArithOp::Add), AtLeast(2)),
    ("-=", Builtin::CompoundAssign(ArithOp::Sub), AtLeast(2)),
    ("*=", Builtin::CompoundAssign(ArithOp::Mul), AtLeast(2)),
    ("/=", Builtin::CompoundAssign(ArithOp::Div), AtLeast(2)),
    ("%=", Builtin::CompoundAssign(ArithOp::Mod), AtLeast(2)),
    ("++", Builtin::Incr, AtLeast(1)),
    ("--", Builtin::Decr, AtLeast(1)),
    ("forget", Builtin::Forget, AtLeast(1)),
    ("scope", Builtin::Scope, Exactly(0)),
    ("scope+=", Builtin::ScopeAdd, AtLeast(2)),
    ("typeof", Builtin::TypeOf, Exactly(1)),
    ("is_const", Builtin::IsConst, Exactly(1)),
    ("is_private", Builtin::IsPrivate, Exactly(1)),
    ("layer", Builtin::LayerOf, Exactly(1)),
    ("defined", Builtin::Defined, Exactly(1)),
    ("struct", Builtin::Struct, Exactly(1)),
    ("if", Builtin::If, AtLeast(1)),
    ("else-if", Builtin::ElseIf, AtLeast(0)),
    ("else", Builtin::Else, AtLeast(0)),
    ("while", Builtin::While, AtLeast(1)),
    ("do-while", Builtin::DoWhile, AtLeast(1)),
    ("for", Builtin::For, AtLeast(1)),
    ("function", Builtin::Function, Exactly(1)),
    ("lambda", Builtin::Lambda, Exactly(1)),
    ("break", Builtin::Break, Exactly(0)),
    ("continue", Builtin::Continue, Exactly(0)),
    ("return", Builtin::Return, Between(0, 1)),
    ("quit", Builtin::Quit, Exactly(0)),
    ("exit", Builtin::Exit, Exactly(0)),
    ("kill", Builtin::Kill, Exactly(0)),
    ("console", Builtin::Console, AtLeast(0)),
    ("console.lock", Builtin::ConsoleLock, Exactly(0)),
    ("console.unlock", Builtin::ConsoleUnlock, Exactly(0)),
    ("read", Builtin::Read, Between(1, 2)),
    ("write", Builtin::Write, AtLeast(1)),
    ("getline", Builtin::Getline, Exactly(2)),
    ("open", Builtin::Open, Exactly(2)),
    ("close", Builtin::Close, Exactly(1)),
    ("eof", Builtin::Eof, Exactly(1)),
    ("input", Builtin::Input, Exactly(1)),
    ("content", Builtin::Content, Exactly(0)),
    ("dep", Builtin::Dep, AtLeast(1)),
    ("precision", Builtin::Precision, Between(0, 1)),
    ("fixed", Builtin::Fixed, Exactly(0)),
    ("scientific", Builtin::Scientific, Exactly(0)),
    ("cpy", Builtin::Cpy, Exactly(2)),
    ("mve", Builtin::Mve, Exactly(2)),
    ("rmv", Builtin::Rmv, AtLeast(1)),
    ("lst", Builtin::Lst, Exactly(1)),
    ("poke", Builtin::Poke, AtLeast(1)),
    ("mkdir", Builtin::Mkdir, AtLeast(1)),
    ("exists", Builtin::Exists, Exactly(1)),
    ("cd", Builtin::Cd, Exactly(1)),
    ("item", Builtin::Item, AtLeast(0)),
    ("paginate", Builtin::Paginate, Between(1, 2)),
    ("paginate.items_per_page", Builtin::PaginateItemsPerPage, Exactly(1)),
    ("paginate.separator", Builtin::PaginateSeparator, Exactly(1)),
    ("paginate.dir", Builtin::PaginateDir, Exactly(1)),
    ("paginate.template", Builtin::PaginateTemplate, Exactly(0)),
    ("paginate.no_items", Builtin::PaginateNoItems, Exactly(0)),
    ("lua", Builtin::Lua, AtLeast(0)),
    ("exprtk", Builtin::Exprtk, AtLeast(1)),
    ("sys", Builtin::Sys, AtLeast(1)),
    ("system", Builtin::System, AtLeast(1)),
    ("script", Builtin::Script, AtLeast(1)),
];

/// Names that select a built-in by prefix, checked after the table.
static PREFIXES: &[(&str, Builtin)] = &[("exprtk.", Builtin::Exprtk)];

fn index() -> &'static HashMap<&'static str, (Builtin, Arity)> {
    static INDEX: OnceLock<HashMap<&'static str, (Builtin, Arity)>> = OnceLock::new();
    INDEX.get_or_init(|| TABLE.iter().map(|&(name, b, a)| (name, (b, a))).collect())
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Builtin> {
        if TypeTag::parse(name).is_some() {
            return Some(Builtin::TypeDecl);
        }
        if let Some(&(b, _)) = index().get(name) {
            return Some(b);
        }
        PREFIXES.iter().find(|(p, _)| name.starts_with(p)).map(|&(_, b)| b)
    }

    fn arity(name: &str) -> Arity {
        index().get(name).map_or(AtLeast(0), |&(_, a)| a)
    }

    pub fn emission(self) -> Emission {
        match self {
            Builtin::If
            | Builtin::While
            | Builtin::DoWhile
            | Builtin::For
            | Builtin::Paginate => Emission::Structural,
            _ => Emission::Value,
        }
    }
}

fn proceed(r: Result<(), ScriptError>) -> Flow {
    r.map(|()| ControlSignal::Proceed)
}

/// `"1"` / `"0"`.
pub(crate) fn flag(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

impl Interpreter {
    pub(crate) fn run_builtin(
        &mut self,
        b: Builtin,
        call: &CallRecord,
        cur: &mut ParseCursor<'_>,
        res: &mut String,
    ) -> Flow {
        let expected = Builtin::arity(&call.name);
        if !expected.accepts(call.params.len()) {
            return Err(call.err(ErrorKind::Arity {
                call: call.name.clone(),
                what: "params",
                expected,
                got: call.params.len(),
            }));
        }

        match b {
            Builtin::Arith(op) => proceed(self.arith(op, call, res)),
            Builtin::Cmp(op) => proceed(self.compare(op, call, res)),
            Builtin::And => proceed(self.logic(true, call, res)),
            Builtin::Or => proceed(self.logic(false, call, res)),
            Builtin::Not => proceed(self.not(call, res)),

            Builtin::Declare => proceed(self.declare(call)),
            Builtin::TypeDecl => {
                let ty = TypeTag::parse(&call.name).unwrap_or(TypeTag::Str);
                proceed(self.declare_from_call(ty, call, 0))
            }
            Builtin::Assign => proceed(self.assign(call)),
            Builtin::CompoundAssign(op) => proceed(self.compound_assign(op, call)),
            Builtin::Incr => proceed(self.step_each(1, call)),
            Builtin::Decr => proceed(self.step_each(-1, call)),
            Builtin::Forget => proceed(self.forget(call)),
            Builtin::Scope => {
                res.push_str(self.store.current_scope().as_str());
                Ok(ControlSignal::Proceed)
            }
            Builtin::ScopeAdd => proceed(self.scope_add(call)),
            Builtin::TypeOf => proceed(self.type_of(call, res)),
            Builtin::IsConst => proceed(self.binding_flag(call, res, |b| b.is_constant)),
            Builtin::IsPrivate => proceed(self.binding_flag(call, res, |b| b.is_private)),
            Builtin::LayerOf => proceed(self.layer_of(call, res)),
            Builtin::Defined => proceed(self.defined(call, res)),
            Builtin::Struct => proceed(self.define_struct(call, cur)),

            Builtin::If => self.run_if(call, cur, res),
            Builtin::ElseIf | Builtin::Else => Err(call.err(ParseError::Malformed(format!(
                "{} without a preceding if",
                call.name
            )))),
            Builtin::While => self.run_while(call, cur, res),
            Builtin::DoWhile => self.run_do_while(call, cur, res),
            Builtin::For => self.run_for(call, cur, res),
            Builtin::Function => proceed(self.define_function(call, cur, call.has_option("lambda"))),
            Builtin::Lambda => proceed(self.define_function(call, cur, true)),
            Builtin::Break => Ok(ControlSignal::Break),
            Builtin::Continue => Ok(ControlSignal::ContinueLoop),
            Builtin::Return => self.run_return(call),
            Builtin::Quit => Ok(ControlSignal::Quit),
            Builtin::Exit => Ok(ControlSignal::Exit),
            Builtin::Kill => {
                self.kill_site = Some(call.location.clone());
                Ok(ControlSignal::Kill)
            }

            Builtin::Console => proceed(self.console_print(call)),
            Builtin::ConsoleLock => {
                self.console_lock_acquire(call);
                Ok(ControlSignal::Proceed)
            }
            Builtin::ConsoleUnlock => {
                self.console_lock_release(call);
                Ok(ControlSignal::Proceed)
            }
            Builtin::Read => proceed(self.read(call, res)),
            Builtin::Write => proceed(self.write(call)),
            Builtin::Getline => proceed(self.getline(call)),
            Builtin::Open => proceed(self.open(call)),
            Builtin::Close => proceed(self.close(call)),
            Builtin::Eof => proceed(self.eof(call, res)),
            Builtin::Input => self.input(call, res),
            Builtin::Content => self.content(call, res),
            Builtin::Dep => proceed(self.dep(call)),
            Builtin::Precision => proceed(self.precision(call, res)),
            Builtin::Fixed => {
                self.num_format.mode = super::value::FloatMode::Fixed;
                Ok(ControlSignal::Proceed)
            }
            Builtin::Scientific => {
                self.num_format.mode = super::value::FloatMode::Scientific;
                Ok(ControlSignal::Proceed)
            }

            Builtin::Cpy => proceed(self.cpy(call)),
            Builtin::Mve => proceed(self.mve(call)),
            Builtin::Rmv => proceed(self.rmv(call)),
            Builtin::Lst => proceed(self.lst(call, res)),
            Builtin::Poke => proceed(self.poke(call)),
            Builtin::Mkdir => proceed(self.mkdir(call)),
            Builtin::Exists => proceed(self.exists(call, res)),
            Builtin::Cd => proceed(self.cd(call)),

            Builtin::Item => proceed(self.item(call, cur)),
            Builtin::Paginate => proceed(self.paginate(call, cur, res)),
            Builtin::PaginateItemsPerPage => proceed(self.paginate_items_per_page(call)),
            Builtin::PaginateSeparator => proceed(self.paginate_separator(call)),
            Builtin::PaginateDir => proceed(self.paginate_dir(call)),
            Builtin::PaginateTemplate => proceed(self.paginate_template(call, cur)),
            Builtin::PaginateNoItems => {
                res.push_str(&self.pages.items.len().to_string());
                Ok(ControlSignal::Proceed)
            }

            Builtin::Lua => proceed(self.lua(call, cur, res)),
            Builtin::Exprtk => proceed(self.exprtk(call, res)),
            Builtin::Sys => proceed(self.sys(call, res)),
            Builtin::System => proceed(self.system(call)),
            Builtin::Script => proceed(self.script(call, res)),
        }
    }

    /// The single parameter of a one-parameter call, processed.
    pub(crate) fn first_param(&mut self, call: &CallRecord) -> Result<String, ScriptError> {
        match call.params.first() {
            Some(p) => self.param_text(p, call),
            None => Ok(String::new()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
