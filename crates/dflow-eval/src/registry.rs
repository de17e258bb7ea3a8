//! Per-type operator dispatch.
//!
//! Polymorphic operators (`add`, `eq`, `item`, ...) resolve against the
//! concrete type of their first operand at evaluation time. The registry is a
//! two-level table: type tag -> operator name -> implementation. Commutative
//! operators get a second chance against the other operand's type, so
//! `Int + Float` finds the float implementation even though the int table
//! has no mixed-mode entry.
//!
//! Implementations return errors with an empty [`Position`]; the evaluator
//! fills in the failing node before recording them.

use indexmap::IndexMap;

use dflow_core::error::{DflowError, Position};

use crate::value::{TypeTag, Value};

/// A dispatched operator implementation.
pub type OpFn = fn(&[Value]) -> Result<Value, DflowError>;

/// Operators where `a op b == b op a`, eligible for reverse dispatch.
const COMMUTATIVE: &[&str] = &["add", "mul", "and", "or", "xor", "eq", "ne"];

/// The dispatch table. Insertion order is kept so diagnostics and
/// introspection list operators the way they were registered.
pub struct Registry {
    table: IndexMap<TypeTag, IndexMap<&'static str, OpFn>>,
}

impl Registry {
    pub fn empty() -> Self {
        Registry {
            table: IndexMap::new(),
        }
    }

    /// The full built-in vocabulary over unit, bool, int, float, str, list.
    pub fn builtin() -> Self {
        let mut r = Registry::empty();
        r.fill_int();
        r.fill_float();
        r.fill_bool();
        r.fill_str();
        r.fill_list();
        r
    }

    pub fn register(&mut self, tag: TypeTag, name: &'static str, f: OpFn) {
        self.table.entry(tag).or_default().insert(name, f);
    }

    fn lookup(&self, tag: TypeTag, name: &str) -> Option<OpFn> {
        self.table.get(&tag)?.get(name).copied()
    }

    /// Resolves `name` against the first operand's type and runs it. For
    /// commutative operators a miss retries against the second operand's
    /// type before giving up.
    pub fn dispatch(&self, name: &str, args: &[Value]) -> Result<Value, DflowError> {
        let first = args.first().ok_or(DflowError::MissingInput {
            at: Position::none(),
        })?;
        if let Some(f) = self.lookup(first.tag(), name) {
            return f(args);
        }
        if COMMUTATIVE.contains(&name) {
            if let Some(second) = args.get(1) {
                if let Some(f) = self.lookup(second.tag(), name) {
                    return f(args);
                }
            }
        }
        Err(DflowError::Unsupported {
            name: name.to_string(),
            tag: first.type_name().to_string(),
            at: Position::none(),
        })
    }

    fn fill_int(&mut self) {
        let t = TypeTag::Int;
        self.register(t, "add", int_add);
        self.register(t, "sub", int_sub);
        self.register(t, "mul", int_mul);
        self.register(t, "div", int_div);
        self.register(t, "rem", int_rem);
        self.register(t, "neg", int_neg);
        self.register(t, "eq", any_eq);
        self.register(t, "ne", any_ne);
        self.register(t, "lt", int_cmp_lt);
        self.register(t, "le", int_cmp_le);
        self.register(t, "gt", int_cmp_gt);
        self.register(t, "ge", int_cmp_ge);
        self.register(t, "and", int_and);
        self.register(t, "or", int_or);
        self.register(t, "xor", int_xor);
        self.register(t, "not", int_not);
    }

    fn fill_float(&mut self) {
        let t = TypeTag::Float;
        self.register(t, "add", float_add);
        self.register(t, "sub", float_sub);
        self.register(t, "mul", float_mul);
        self.register(t, "div", float_div);
        self.register(t, "rem", float_rem);
        self.register(t, "neg", float_neg);
        self.register(t, "eq", any_eq);
        self.register(t, "ne", any_ne);
        self.register(t, "lt", float_cmp_lt);
        self.register(t, "le", float_cmp_le);
        self.register(t, "gt", float_cmp_gt);
        self.register(t, "ge", float_cmp_ge);
    }

    fn fill_bool(&mut self) {
        let t = TypeTag::Bool;
        self.register(t, "and", bool_and);
        self.register(t, "or", bool_or);
        self.register(t, "xor", bool_xor);
        self.register(t, "not", bool_not);
        self.register(t, "eq", any_eq);
        self.register(t, "ne", any_ne);
    }

    fn fill_str(&mut self) {
        let t = TypeTag::Str;
        self.register(t, "add", str_add);
        self.register(t, "eq", any_eq);
        self.register(t, "ne", any_ne);
        self.register(t, "lt", str_cmp_lt);
        self.register(t, "le", str_cmp_le);
        self.register(t, "gt", str_cmp_gt);
        self.register(t, "ge", str_cmp_ge);
        self.register(t, "len", str_len);
        self.register(t, "item", str_item);
    }

    fn fill_list(&mut self) {
        let t = TypeTag::List;
        self.register(t, "add", list_add);
        self.register(t, "eq", any_eq);
        self.register(t, "ne", any_ne);
        self.register(t, "len", list_len);
        self.register(t, "item", list_item);
    }
}

/// Parses a constant's literal text: `true`/`false`, then integer, then
/// float; a double-quoted literal strips its quotes; anything else is taken
/// as a bare string. The empty text is rejected.
pub fn parse_literal(text: &str) -> Result<Value, DflowError> {
    if text.is_empty() {
        return Err(DflowError::BadLiteral {
            text: String::new(),
            at: Position::none(),
        });
    }
    match text {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    if let Ok(x) = text.parse::<f64>() {
        return Ok(Value::Float(x));
    }
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        return Ok(Value::Str(text[1..text.len() - 1].to_string()));
    }
    Ok(Value::Str(text.to_string()))
}

// -- helpers ----------------------------------------------------------------

fn want_int(v: &Value) -> Result<i64, DflowError> {
    v.as_int().ok_or_else(|| DflowError::TypeMismatch {
        expected: "int".to_string(),
        got: v.type_name().to_string(),
        at: Position::none(),
    })
}

fn want_bool(v: &Value) -> Result<bool, DflowError> {
    v.as_bool().ok_or_else(|| DflowError::TypeMismatch {
        expected: "bool".to_string(),
        got: v.type_name().to_string(),
        at: Position::none(),
    })
}

/// Numeric coercion: either operand being a float promotes the pair.
fn want_float(v: &Value) -> Result<f64, DflowError> {
    match v {
        Value::Float(x) => Ok(*x),
        Value::Int(i) => Ok(*i as f64),
        other => Err(DflowError::TypeMismatch {
            expected: "float".to_string(),
            got: other.type_name().to_string(),
            at: Position::none(),
        }),
    }
}

fn want_str(v: &Value) -> Result<&str, DflowError> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(DflowError::TypeMismatch {
            expected: "str".to_string(),
            got: other.type_name().to_string(),
            at: Position::none(),
        }),
    }
}

fn want_list(v: &Value) -> Result<&[Value], DflowError> {
    match v {
        Value::List(items) => Ok(items),
        other => Err(DflowError::TypeMismatch {
            expected: "list".to_string(),
            got: other.type_name().to_string(),
            at: Position::none(),
        }),
    }
}

fn pair(args: &[Value]) -> Result<(&Value, &Value), DflowError> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(DflowError::MissingInput {
            at: Position::none(),
        }),
    }
}

fn single(args: &[Value]) -> Result<&Value, DflowError> {
    match args {
        [a] => Ok(a),
        _ => Err(DflowError::MissingInput {
            at: Position::none(),
        }),
    }
}

/// Index into a container of `len` items, negative indices counting from
/// the end.
fn container_index(raw: i64, len: usize) -> Result<usize, DflowError> {
    let idx = if raw < 0 { raw + len as i64 } else { raw };
    if idx < 0 || idx as usize >= len {
        return Err(DflowError::OutOfRange {
            index: raw,
            len,
            at: Position::none(),
        });
    }
    Ok(idx as usize)
}

// -- int --------------------------------------------------------------------

fn int_add(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    // Mixed int/float promotes to float.
    if matches!(b, Value::Float(_)) {
        return Ok(Value::Float(want_float(a)? + want_float(b)?));
    }
    Ok(Value::Int(want_int(a)?.wrapping_add(want_int(b)?)))
}

fn int_sub(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    if matches!(b, Value::Float(_)) {
        return Ok(Value::Float(want_float(a)? - want_float(b)?));
    }
    Ok(Value::Int(want_int(a)?.wrapping_sub(want_int(b)?)))
}

fn int_mul(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    if matches!(b, Value::Float(_)) {
        return Ok(Value::Float(want_float(a)? * want_float(b)?));
    }
    Ok(Value::Int(want_int(a)?.wrapping_mul(want_int(b)?)))
}

fn int_div(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    if matches!(b, Value::Float(_)) {
        return float_div(args);
    }
    let d = want_int(b)?;
    if d == 0 {
        return Err(DflowError::DivideByZero {
            at: Position::none(),
        });
    }
    Ok(Value::Int(want_int(a)?.wrapping_div(d)))
}

fn int_rem(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    let d = want_int(b)?;
    if d == 0 {
        return Err(DflowError::DivideByZero {
            at: Position::none(),
        });
    }
    Ok(Value::Int(want_int(a)?.wrapping_rem(d)))
}

fn int_neg(args: &[Value]) -> Result<Value, DflowError> {
    Ok(Value::Int(want_int(single(args)?)?.wrapping_neg()))
}

fn int_and(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Int(want_int(a)? & want_int(b)?))
}

fn int_or(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Int(want_int(a)? | want_int(b)?))
}

fn int_xor(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Int(want_int(a)? ^ want_int(b)?))
}

fn int_not(args: &[Value]) -> Result<Value, DflowError> {
    Ok(Value::Int(!want_int(single(args)?)?))
}

// -- float ------------------------------------------------------------------
//
// Float arithmetic follows IEEE semantics; division by zero yields an
// infinity rather than an error.

fn float_add(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Float(want_float(a)? + want_float(b)?))
}

fn float_sub(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Float(want_float(a)? - want_float(b)?))
}

fn float_mul(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Float(want_float(a)? * want_float(b)?))
}

fn float_div(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Float(want_float(a)? / want_float(b)?))
}

fn float_rem(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Float(want_float(a)? % want_float(b)?))
}

fn float_neg(args: &[Value]) -> Result<Value, DflowError> {
    Ok(Value::Float(-want_float(single(args)?)?))
}

// -- bool -------------------------------------------------------------------

fn bool_and(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Bool(want_bool(a)? && want_bool(b)?))
}

fn bool_or(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Bool(want_bool(a)? || want_bool(b)?))
}

fn bool_xor(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Bool(want_bool(a)? ^ want_bool(b)?))
}

fn bool_not(args: &[Value]) -> Result<Value, DflowError> {
    Ok(Value::Bool(!want_bool(single(args)?)?))
}

// -- comparisons ------------------------------------------------------------

fn any_eq(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Bool(a == b))
}

fn any_ne(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    Ok(Value::Bool(a != b))
}

macro_rules! ordered_cmp {
    ($fname:ident, $want:ident, $op:tt) => {
        fn $fname(args: &[Value]) -> Result<Value, DflowError> {
            let (a, b) = pair(args)?;
            Ok(Value::Bool($want(a)? $op $want(b)?))
        }
    };
}

ordered_cmp!(int_cmp_lt, want_int, <);
ordered_cmp!(int_cmp_le, want_int, <=);
ordered_cmp!(int_cmp_gt, want_int, >);
ordered_cmp!(int_cmp_ge, want_int, >=);
ordered_cmp!(float_cmp_lt, want_float, <);
ordered_cmp!(float_cmp_le, want_float, <=);
ordered_cmp!(float_cmp_gt, want_float, >);
ordered_cmp!(float_cmp_ge, want_float, >=);
ordered_cmp!(str_cmp_lt, want_str, <);
ordered_cmp!(str_cmp_le, want_str, <=);
ordered_cmp!(str_cmp_gt, want_str, >);
ordered_cmp!(str_cmp_ge, want_str, >=);

// -- str --------------------------------------------------------------------

fn str_add(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    let mut s = want_str(a)?.to_string();
    s.push_str(want_str(b)?);
    Ok(Value::Str(s))
}

fn str_len(args: &[Value]) -> Result<Value, DflowError> {
    Ok(Value::Int(want_str(single(args)?)?.chars().count() as i64))
}

fn str_item(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    let s = want_str(a)?;
    let chars: Vec<char> = s.chars().collect();
    let idx = container_index(want_int(b)?, chars.len())?;
    Ok(Value::Str(chars[idx].to_string()))
}

// -- list -------------------------------------------------------------------

fn list_add(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    let mut items = want_list(a)?.to_vec();
    items.extend_from_slice(want_list(b)?);
    Ok(Value::List(items))
}

fn list_len(args: &[Value]) -> Result<Value, DflowError> {
    Ok(Value::Int(want_list(single(args)?)?.len() as i64))
}

fn list_item(args: &[Value]) -> Result<Value, DflowError> {
    let (a, b) = pair(args)?;
    let items = want_list(a)?;
    let idx = container_index(want_int(b)?, items.len())?;
    Ok(items[idx].clone())
}
