//! Runtime value types for the template language.
//!
//! Every binding in the [`Store`](super::store::Store) carries a fixed
//! [`TypeTag`]; its [`Value`] is the tagged union matching that tag.  Text
//! arriving from templates is coerced into a typed value with
//! [`Value::coerce`], and rendered back to text with [`Value::render`]
//! using the interpreter's [`NumFormat`].

use std::fmt;

use super::store::FunctionDef;

// ── TypeTag ───────────────────────────────────────────────────────────────────

/// The declared type of a binding.  Never changes after declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeTag {
    Bool,
    Int,
    Double,
    Char,
    Str,
    Int64,
    DoubleVec,
    IStream,
    OStream,
    FStream,
    /// Instance of a user-declared `struct`.
    Struct(String),
    Function,
}

impl TypeTag {
    /// Resolve a built-in type name (or alias) used by declarations.
    ///
    /// Struct names are not resolved here; see
    /// [`Store::struct_def`](super::store::Store::struct_def).
    pub fn parse(name: &str) -> Option<TypeTag> {
        Some(match name.trim() {
            "bool" | "std::bool" => TypeTag::Bool,
            "int" | "std::int" => TypeTag::Int,
            "double" | "std::double" => TypeTag::Double,
            "char" | "std::char" => TypeTag::Char,
            "string" | "std::string" => TypeTag::Str,
            "int64" | "std::int64" | "llint" => TypeTag::Int64,
            "vector" | "std::vector<double>" => TypeTag::DoubleVec,
            "ifstream" | "std::ifstream" => TypeTag::IStream,
            "ofstream" | "std::ofstream" => TypeTag::OStream,
            "fstream" | "std::fstream" => TypeTag::FStream,
            _ => return None,
        })
    }

    /// Canonical name, as reported by `typeof`.
    pub fn name(&self) -> &str {
        match self {
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Double => "double",
            TypeTag::Char => "char",
            TypeTag::Str => "string",
            TypeTag::Int64 => "int64",
            TypeTag::DoubleVec => "vector",
            TypeTag::IStream => "ifstream",
            TypeTag::OStream => "ofstream",
            TypeTag::FStream => "fstream",
            TypeTag::Struct(name) => name,
            TypeTag::Function => "function",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, TypeTag::Int | TypeTag::Int64)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, TypeTag::IStream | TypeTag::OStream | TypeTag::FStream)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Number formatting ─────────────────────────────────────────────────────────

/// Floating-point notation selected by `fixed()` / `scientific()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloatMode {
    #[default]
    General,
    Fixed,
    Scientific,
}

/// How doubles are rendered back to text.
///
/// This is a rendering detail only; arithmetic is unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NumFormat {
    pub precision: Option<usize>,
    pub mode: FloatMode,
}

impl NumFormat {
    pub fn format(&self, x: f64) -> String {
        if !x.is_finite() {
            return if x.is_nan() {
                "nan".to_owned()
            } else if x > 0.0 {
                "inf".to_owned()
            } else {
                "-inf".to_owned()
            };
        }
        match (self.mode, self.precision) {
            (FloatMode::Fixed, p) => format!("{:.*}", p.unwrap_or(6), x),
            (FloatMode::Scientific, p) => format!("{:.*e}", p.unwrap_or(6), x),
            (FloatMode::General, None) => {
                if x.fract() == 0.0 && x.abs() < 1e15 {
                    format!("{}", x as i64)
                } else {
                    format!("{x}")
                }
            }
            (FloatMode::General, Some(p)) => format_significant(x, p.max(1)),
        }
    }
}

/// `%g`-style rendering with `digits` significant digits and trailing
/// zeros removed.
fn format_significant(x: f64, digits: usize) -> String {
    if x == 0.0 {
        return "0".to_owned();
    }
    let exp = x.abs().log10().floor() as i32;
    if exp < -5 || exp >= digits as i32 {
        let s = format!("{:.*e}", digits - 1, x);
        // Trim the mantissa: "1.2300e4" -> "1.23e4".
        match s.split_once('e') {
            Some((mant, e)) => format!("{}e{}", trim_zeros(mant), e),
            None => s,
        }
    } else {
        let decimals = (digits as i32 - 1 - exp).max(0) as usize;
        trim_zeros(&format!("{:.*}", decimals, x)).to_owned()
    }
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

// ── Streams ───────────────────────────────────────────────────────────────────

/// Handle into the interpreter's open-stream table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

// ── Value ─────────────────────────────────────────────────────────────────────

/// A typed runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Double(f64),
    Char(char),
    Str(String),
    Int64(i64),
    DoubleVec(Vec<f64>),
    /// An open (or closed) stream; the tag says which direction.
    Stream(TypeTag, Option<StreamId>),
    /// A struct instance; members live in sibling `name.member` bindings.
    Struct(String),
    Function(FunctionDef),
}

impl Default for Value {
    fn default() -> Self {
        Value::Str(String::new())
    }
}

impl Value {
    /// The tag of this value.
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Double(_) => TypeTag::Double,
            Value::Char(_) => TypeTag::Char,
            Value::Str(_) => TypeTag::Str,
            Value::Int64(_) => TypeTag::Int64,
            Value::DoubleVec(_) => TypeTag::DoubleVec,
            Value::Stream(tag, _) => tag.clone(),
            Value::Struct(name) => TypeTag::Struct(name.clone()),
            Value::Function(_) => TypeTag::Function,
        }
    }

    /// Default value for a freshly declared binding with no initialiser.
    pub fn default_for(tag: &TypeTag) -> Value {
        match tag {
            TypeTag::Bool => Value::Bool(false),
            TypeTag::Int => Value::Int(0),
            TypeTag::Double => Value::Double(0.0),
            TypeTag::Char => Value::Char('\0'),
            TypeTag::Str => Value::Str(String::new()),
            TypeTag::Int64 => Value::Int64(0),
            TypeTag::DoubleVec => Value::DoubleVec(Vec::new()),
            TypeTag::IStream | TypeTag::OStream | TypeTag::FStream => {
                Value::Stream(tag.clone(), None)
            }
            TypeTag::Struct(name) => Value::Struct(name.clone()),
            TypeTag::Function => Value::Str(String::new()),
        }
    }

    /// Coerce template text into a value of type `tag`.
    ///
    /// Fails with a human-readable reason when the text cannot represent a
    /// value of that type.
    pub fn coerce(tag: &TypeTag, text: &str) -> Result<Value, String> {
        let t = text.trim();
        match tag {
            TypeTag::Bool => match t {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" | "" => Ok(Value::Bool(false)),
                _ => match t.parse::<f64>() {
                    Ok(x) => Ok(Value::Bool(x != 0.0)),
                    Err(_) => Err(format!("'{t}' is not a bool")),
                },
            },
            TypeTag::Int => {
                if let Ok(n) = t.parse::<i32>() {
                    return Ok(Value::Int(n));
                }
                match t.parse::<f64>() {
                    Ok(x) if x.is_finite() && x.trunc().abs() <= i32::MAX as f64 => {
                        Ok(Value::Int(x.trunc() as i32))
                    }
                    _ => Err(format!("'{t}' is not an int")),
                }
            }
            TypeTag::Int64 => {
                if let Ok(n) = t.parse::<i64>() {
                    return Ok(Value::Int64(n));
                }
                match t.parse::<f64>() {
                    Ok(x) if x.is_finite() && x.trunc().abs() <= i64::MAX as f64 => {
                        Ok(Value::Int64(x.trunc() as i64))
                    }
                    _ => Err(format!("'{t}' is not an int64")),
                }
            }
            TypeTag::Double => t
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|_| format!("'{t}' is not a double")),
            TypeTag::Char => {
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Ok(Value::Char(c)),
                    _ => Err(format!("'{text}' is not a single char")),
                }
            }
            TypeTag::Str => Ok(Value::Str(text.to_owned())),
            TypeTag::DoubleVec => parse_vector(t).map(Value::DoubleVec),
            TypeTag::IStream | TypeTag::OStream | TypeTag::FStream => {
                Err(format!("cannot assign text to a {tag}"))
            }
            TypeTag::Struct(name) => Err(format!("cannot assign text to struct {name}")),
            TypeTag::Function => Err("cannot assign text to a function".to_owned()),
        }
    }

    /// Render as template text.
    pub fn render(&self, fmt: &NumFormat) -> String {
        match self {
            Value::Bool(b) => if *b { "1" } else { "0" }.to_owned(),
            Value::Int(n) => n.to_string(),
            Value::Double(x) => fmt.format(*x),
            Value::Char(c) => c.to_string(),
            Value::Str(s) => s.clone(),
            Value::Int64(n) => n.to_string(),
            Value::DoubleVec(v) => v
                .iter()
                .map(|x| fmt.format(*x))
                .collect::<Vec<_>>()
                .join(", "),
            Value::Stream(tag, id) => match id {
                Some(StreamId(n)) => format!("<{tag} #{n}>"),
                None => format!("<{tag} closed>"),
            },
            Value::Struct(name) => format!("<struct {name}>"),
            Value::Function(def) => def.body_text().to_owned(),
        }
    }

    /// Numeric view, if the value has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(n) => Some(*n as f64),
            Value::Double(x) => Some(*x),
            Value::Int64(n) => Some(*n as f64),
            Value::Char(c) => Some(*c as u32 as f64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean view: numbers are true when non-zero, strings when they
    /// spell a true literal or a non-zero number.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Str(s) => parse_bool_literal(s).or_else(|| {
                s.trim().parse::<f64>().ok().map(|x| x != 0.0)
            }),
            Value::DoubleVec(v) => Some(!v.is_empty()),
            other => other.as_f64().map(|x| x != 0.0),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Int64(_))
    }
}

/// `true`/`false`/`1`/`0` spelled literally.
pub fn parse_bool_literal(s: &str) -> Option<bool> {
    match s.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_vector(t: &str) -> Result<Vec<f64>, String> {
    let inner = t
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(t);
    inner
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .map_err(|_| format!("'{s}' is not a number in vector literal"))
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_type_names() {
        assert_eq!(TypeTag::parse("int"), Some(TypeTag::Int));
        assert_eq!(TypeTag::parse("std::string"), Some(TypeTag::Str));
        assert_eq!(TypeTag::parse("std::vector<double>"), Some(TypeTag::DoubleVec));
        assert_eq!(TypeTag::parse("Point"), None);
    }

    #[test]
    fn coerce_int() {
        assert_eq!(Value::coerce(&TypeTag::Int, " 42 "), Ok(Value::Int(42)));
        assert_eq!(Value::coerce(&TypeTag::Int, "3.9"), Ok(Value::Int(3)));
        assert!(Value::coerce(&TypeTag::Int, "abc").is_err());
    }

    #[test]
    fn coerce_bool() {
        assert_eq!(Value::coerce(&TypeTag::Bool, "true"), Ok(Value::Bool(true)));
        assert_eq!(Value::coerce(&TypeTag::Bool, "0"), Ok(Value::Bool(false)));
        assert!(Value::coerce(&TypeTag::Bool, "maybe").is_err());
    }

    #[test]
    fn coerce_char_needs_one_char() {
        assert_eq!(Value::coerce(&TypeTag::Char, "x"), Ok(Value::Char('x')));
        assert!(Value::coerce(&TypeTag::Char, "xy").is_err());
    }

    #[test]
    fn coerce_vector() {
        assert_eq!(
            Value::coerce(&TypeTag::DoubleVec, "[1, 2.5 3]"),
            Ok(Value::DoubleVec(vec![1.0, 2.5, 3.0]))
        );
        assert!(Value::coerce(&TypeTag::DoubleVec, "1, x").is_err());
    }

    #[test]
    fn render_doubles_default() {
        let f = NumFormat::default();
        assert_eq!(Value::Double(8.0).render(&f), "8");
        assert_eq!(Value::Double(3.25).render(&f), "3.25");
    }

    #[test]
    fn render_doubles_precision_and_modes() {
        let g = NumFormat { precision: Some(3), mode: FloatMode::General };
        assert_eq!(g.format(3.14159), "3.14");
        assert_eq!(g.format(123456.0), "1.23e5");
        let fixed = NumFormat { precision: Some(2), mode: FloatMode::Fixed };
        assert_eq!(fixed.format(2.0), "2.00");
        let sci = NumFormat { precision: Some(1), mode: FloatMode::Scientific };
        assert_eq!(sci.format(1500.0), "1.5e3");
    }

    #[test]
    fn bool_views() {
        assert_eq!(Value::Str("true".into()).as_bool(), Some(true));
        assert_eq!(Value::Str("2.5".into()).as_bool(), Some(true));
        assert_eq!(Value::Str("nope".into()).as_bool(), None);
        assert_eq!(Value::Int(0).as_bool(), Some(false));
    }
}
