//! Operator built-ins: arithmetic, comparison, logic and `exprtk`.

use crate::script::error::{ErrorKind, ScriptError};
use crate::script::interp::Interpreter;
use crate::script::processor::{CallRecord, Dialect};
use crate::script::value::{parse_bool_literal, TypeTag, Value};

use super::flag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds<T: PartialOrd>(self, a: &T, b: &T) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }
}

// ── Operands ──────────────────────────────────────────────────────────────────

/// A processed operand: its text, plus the typed value when it named a
/// variable.
#[derive(Debug, Clone)]
pub(crate) struct Operand {
    pub text: String,
    pub value: Option<Value>,
}

impl Operand {
    pub fn from_value(value: Value, interp: &Interpreter) -> Self {
        Operand { text: value.render(&interp.num_format), value: Some(value) }
    }

    fn number(&self) -> Option<f64> {
        match &self.value {
            Some(Value::Str(_)) | None => self.text.trim().parse().ok(),
            Some(v) => v.as_f64(),
        }
    }

    fn integer(&self) -> Option<i64> {
        match &self.value {
            Some(Value::Int(n)) => Some(i64::from(*n)),
            Some(Value::Int64(n)) => Some(*n),
            _ => None,
        }
    }

    fn truth(&self) -> Option<bool> {
        match &self.value {
            Some(v) => v.as_bool(),
            None => parse_bool_literal(&self.text)
                .or_else(|| self.text.trim().parse::<f64>().ok().map(|x| x != 0.0)),
        }
    }
}

/// Whether operands are combined as numbers or as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Numeric,
    Text,
}

impl Interpreter {
    /// Process operands.  An unquoted operand naming a visible variable (or
    /// a call-frame value) stands for that value.
    pub(crate) fn operands(&mut self, call: &CallRecord, skip: usize) -> Result<Vec<Operand>, ScriptError> {
        let mut out = Vec::with_capacity(call.params.len().saturating_sub(skip));
        for item in call.params.iter().skip(skip) {
            let text = self.param_text(item, call)?;
            if item.quoted {
                out.push(Operand { text, value: None });
                continue;
            }
            if let Some(v) = self.frame_value(&text) {
                out.push(Operand { text: v, value: None });
                continue;
            }
            let value = self
                .store
                .lookup(&text)
                .filter(|b| !matches!(b.ty, TypeTag::Function | TypeTag::Struct(_)))
                .map(|b| b.value.clone());
            match value {
                Some(v) => out.push(Operand::from_value(v, self)),
                None => out.push(Operand { text, value: None }),
            }
        }
        Ok(out)
    }

    fn mode(&self, call: &CallRecord, operands: &[Operand]) -> Result<Mode, ScriptError> {
        if call.has_option("s") {
            return Ok(Mode::Text);
        }
        let all_numeric = operands.iter().all(|o| o.number().is_some());
        if call.has_option("d") && !all_numeric {
            let bad = operands.iter().find(|o| o.number().is_none()).map_or("", |o| o.text.as_str());
            return Err(call.err(ErrorKind::Type(format!("{}: '{bad}' is not a number", call.name))));
        }
        Ok(if all_numeric { Mode::Numeric } else { Mode::Text })
    }

    /// Fold `operands` with `op`.  Integer-typed operands alone stay
    /// integral, in 32 bits when every operand is an `int`.
    pub(crate) fn fold_arith(
        &self,
        op: ArithOp,
        call: &CallRecord,
        operands: &[Operand],
    ) -> Result<Value, ScriptError> {
        let type_err = |msg: String| call.err(ErrorKind::Type(format!("{}: {msg}", call.name)));
        if self.mode(call, operands)? == Mode::Text {
            return match op {
                ArithOp::Add => Ok(Value::Str(operands.iter().map(|o| o.text.as_str()).collect())),
                _ => Err(type_err(format!("cannot apply {} to text", op.symbol()))),
            };
        }

        let ints: Option<Vec<i64>> = operands.iter().map(Operand::integer).collect();
        if let Some(ints) = ints {
            let narrow = operands.iter().all(|o| matches!(o.value, Some(Value::Int(_))));
            let mut acc = ints[0];
            if ints.len() == 1 && op == ArithOp::Sub {
                acc = -acc;
            }
            for &n in &ints[1..] {
                if narrow && i32::try_from(acc).is_err() {
                    return Err(type_err("integer overflow".into()));
                }
                acc = match op {
                    ArithOp::Add => acc.checked_add(n),
                    ArithOp::Sub => acc.checked_sub(n),
                    ArithOp::Mul => acc.checked_mul(n),
                    ArithOp::Div | ArithOp::Mod if n == 0 => {
                        return Err(type_err("division by zero".into()))
                    }
                    ArithOp::Div => acc.checked_div(n),
                    ArithOp::Mod => acc.checked_rem(n),
                }
                .ok_or_else(|| type_err("integer overflow".into()))?;
            }
            if !narrow {
                return Ok(Value::Int64(acc));
            }
            return i32::try_from(acc)
                .map(Value::Int)
                .map_err(|_| type_err("integer overflow".into()));
        }

        let nums: Vec<f64> = operands.iter().filter_map(Operand::number).collect();
        let mut acc = nums[0];
        if nums.len() == 1 && op == ArithOp::Sub {
            acc = -acc;
        }
        for &x in &nums[1..] {
            acc = match op {
                ArithOp::Add => acc + x,
                ArithOp::Sub => acc - x,
                ArithOp::Mul => acc * x,
                ArithOp::Div | ArithOp::Mod if x == 0.0 => {
                    return Err(type_err("division by zero".into()))
                }
                ArithOp::Div => acc / x,
                ArithOp::Mod => acc % x,
            };
        }
        Ok(Value::Double(acc))
    }

    pub(super) fn arith(&mut self, op: ArithOp, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let operands = self.operands(call, 0)?;
        let value = self.fold_arith(op, call, &operands)?;
        res.push_str(&value.render(&self.num_format));
        Ok(())
    }

    pub(super) fn compare(&mut self, op: CmpOp, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let operands = self.operands(call, 0)?;
        let holds = match self.mode(call, &operands)? {
            Mode::Numeric => {
                let nums: Vec<f64> = operands.iter().filter_map(Operand::number).collect();
                nums.windows(2).all(|w| op.holds(&w[0], &w[1]))
            }
            Mode::Text => operands.windows(2).all(|w| op.holds(&w[0].text, &w[1].text)),
        };
        res.push_str(flag(holds));
        Ok(())
    }

    fn truths(&mut self, call: &CallRecord) -> Result<Vec<bool>, ScriptError> {
        self.operands(call, 0)?
            .iter()
            .map(|o| {
                o.truth().ok_or_else(|| {
                    call.err(ErrorKind::Type(format!("{}: '{}' is not a bool", call.name, o.text)))
                })
            })
            .collect()
    }

    pub(super) fn logic(&mut self, all: bool, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let truths = self.truths(call)?;
        let value = if all { truths.iter().all(|&t| t) } else { truths.iter().any(|&t| t) };
        res.push_str(flag(value));
        Ok(())
    }

    pub(super) fn not(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let truths = self.truths(call)?;
        res.push_str(flag(!truths[0]));
        Ok(())
    }

    /// `exprtk(expr)`: the unsplit parameter text is the expression.
    pub(super) fn exprtk(&mut self, call: &CallRecord, res: &mut String) -> Result<(), ScriptError> {
        let raw = call.raw_params.clone().unwrap_or_default();
        let text = if raw.contains(['@', '$']) {
            let line = call.params.first().map_or(call.location.line, |p| p.line);
            self.process_text(&raw, Dialect::N, call.source(), line)?
        } else {
            raw
        };
        let x = self.eval_numeric(&text, &call.location)?;
        res.push_str(&self.num_format.format(x));
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::script::error::ErrorKind;
    use crate::script::interp::Interpreter;
    use crate::script::processor::Dialect;

    fn n(src: &str) -> String {
        Interpreter::for_tests().process_str(src, Dialect::N).expect("process failed")
    }

    fn kind(src: &str) -> ErrorKind {
        Interpreter::for_tests().process_str(src, Dialect::N).unwrap_err().kind
    }

    #[test]
    fn numeric_folds() {
        assert_eq!(n("@+(1, 2, 3)"), "6");
        assert_eq!(n("@-(10, 4, 1)"), "5");
        assert_eq!(n("@-(4)"), "-4");
        assert_eq!(n("@*(2, 2.5)"), "5");
        assert_eq!(n("@/(7, 2)"), "3.5");
        assert_eq!(n("@%(7, 4)"), "3");
    }

    #[test]
    fn integer_typed_operands_stay_integral() {
        assert_eq!(n("@int(a=7, b=2)@/(a, b)"), "3");
        assert_eq!(n("@int(a=7)@/(a, 2)"), "3.5");
    }

    #[test]
    fn int_arithmetic_is_32_bit() {
        assert!(matches!(kind("@int(x=2147483647, one=1)@+(x, one)"), ErrorKind::Type(_)));
        assert!(matches!(kind("@int(x=-2147483648, one=1)@-(x, one)"), ErrorKind::Type(_)));
        assert_eq!(n("@int(x=2147483646, one=1)@+(x, one)"), "2147483647");
        assert_eq!(n("@int(x=2147483647)@int64(one=1)@+(x, one)"), "2147483648");
        assert_eq!(n("@int(x=2147483647)@+(x, 1)"), "2147483648");
    }

    #[test]
    fn text_mode_concatenates() {
        assert_eq!(n("@+(foo, \"bar\", 1)"), "foobar1");
        assert_eq!(n("@+{s}(1, 2)"), "12");
        assert!(matches!(kind("@-(a, b)"), ErrorKind::Type(_)));
    }

    #[test]
    fn forced_numeric_rejects_text() {
        assert!(matches!(kind("@+{d}(1, x)"), ErrorKind::Type(_)));
    }

    #[test]
    fn division_by_zero() {
        assert!(matches!(kind("@/(1, 0)"), ErrorKind::Type(_)));
        assert!(matches!(kind("@int(z=0)@%(5, z)"), ErrorKind::Type(_)));
    }

    #[test]
    fn comparisons_are_pairwise() {
        assert_eq!(n("@<(1, 2, 3)"), "1");
        assert_eq!(n("@<(1, 3, 2)"), "0");
        assert_eq!(n("@==(2, 2.0)"), "1");
        assert_eq!(n("@==(abc, abc)"), "1");
        assert_eq!(n("@!=(abc, abd)"), "1");
        assert_eq!(n("@string(s=b)@>(s, a)"), "1");
    }

    #[test]
    fn logic() {
        assert_eq!(n("@&&(1, true, 2)"), "1");
        assert_eq!(n("@||(0, false)"), "0");
        assert_eq!(n("@!(0)"), "1");
        assert!(matches!(kind("@&&(1, maybe)"), ErrorKind::Type(_)));
    }

    #[test]
    fn exprtk_uses_raw_text() {
        assert_eq!(n("@exprtk(max(1, 5) * 2)"), "10");
        assert_eq!(n("@int(x=3)@exprtk(x := x + 1; x * 2)$[x]"), "84");
    }
}
