use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::decimal;
use super::error::RuntimeError;
use super::record::Record;
use super::types::{CtlType, OpKind};

pub type ListRef = Rc<RefCell<Vec<Value>>>;
pub type MapRef = Rc<RefCell<IndexMap<MapKey, Value>>>;
pub type RecordRef = Rc<RefCell<Record>>;

/// Runtime value of any CTL type.
///
/// Lists, maps and records are shared handles: cloning a `Value` aliases
/// them. Use [`Value::deep_copy`] where the language requires a copy.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i32),
    Long(i64),
    Number(f64),
    Decimal(Decimal),
    String(String),
    Boolean(bool),
    Date(DateTime<Utc>),
    List(ListRef),
    Map(MapRef),
    Record(RecordRef),
}

/// Hashable form of a scalar used as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    Null,
    Integer(i32),
    Long(i64),
    Number(u64),
    Decimal(Decimal),
    String(String),
    Boolean(bool),
    Date(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ArithOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

pub fn new_list(items: Vec<Value>) -> Value {
    Value::List(Rc::new(RefCell::new(items)))
}

pub fn new_map(entries: IndexMap<MapKey, Value>) -> Value {
    Value::Map(Rc::new(RefCell::new(entries)))
}

/// Date from epoch milliseconds, the precision CTL dates carry.
pub fn date_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Long(_) => "long",
            Value::Number(_) => "number",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Boolean(_) => "boolean",
            Value::Date(_) => "date",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Record(_) => "record",
        }
    }

    /// Initial value of a declared-but-uninitialized variable.
    pub fn default_for(ty: &CtlType) -> Value {
        match ty {
            CtlType::Integer => Value::Integer(0),
            CtlType::Long => Value::Long(0),
            CtlType::Number => Value::Number(0.0),
            CtlType::Decimal => Value::Decimal(Decimal::ZERO),
            CtlType::String => Value::String(String::new()),
            CtlType::Boolean => Value::Boolean(false),
            CtlType::Date => date_from_millis(0).map_or(Value::Null, Value::Date),
            CtlType::List(_) => new_list(Vec::new()),
            CtlType::Map(..) => new_map(IndexMap::new()),
            CtlType::Record(meta) => Value::Record(Record::new_ref(meta.clone())),
            CtlType::Void | CtlType::Null | CtlType::Any | CtlType::Unknown => Value::Null,
        }
    }

    /// Independent copy: containers and records are cloned recursively.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::List(items) => new_list(items.borrow().iter().map(Value::deep_copy).collect()),
            Value::Map(entries) => new_map(
                entries.borrow().iter().map(|(k, v)| (k.clone(), v.deep_copy())).collect(),
            ),
            Value::Record(rec) => Value::Record(Rc::new(RefCell::new(rec.borrow().deep_copy()))),
            scalar => scalar.clone(),
        }
    }

    /// Widening conversion to `target`. Narrowing or unrelated types fail.
    pub fn coerce_to(self, target: &CtlType) -> Result<Value, RuntimeError> {
        let converted = match (target, self) {
            (_, Value::Null) => Value::Null,
            (CtlType::Any | CtlType::Unknown | CtlType::Void, v) => v,
            (CtlType::Integer, v @ Value::Integer(_)) => v,
            (CtlType::Long, Value::Integer(i)) => Value::Long(i64::from(i)),
            (CtlType::Long, v @ Value::Long(_)) => v,
            (CtlType::Number, Value::Integer(i)) => Value::Number(f64::from(i)),
            #[allow(clippy::cast_precision_loss)]
            (CtlType::Number, Value::Long(l)) => Value::Number(l as f64),
            (CtlType::Number, v @ Value::Number(_)) => v,
            (CtlType::Decimal, Value::Integer(i)) => Value::Decimal(Decimal::from(i)),
            (CtlType::Decimal, Value::Long(l)) => Value::Decimal(Decimal::from(l)),
            (CtlType::Decimal, Value::Number(n)) => Value::Decimal(decimal::from_f64(n)?),
            (CtlType::Decimal, v @ Value::Decimal(_)) => v,
            (CtlType::String, v @ Value::String(_)) => v,
            (CtlType::Boolean, v @ Value::Boolean(_)) => v,
            (CtlType::Date, v @ Value::Date(_)) => v,
            (CtlType::List(_), v @ Value::List(_)) => v,
            (CtlType::Map(..), v @ Value::Map(_)) => v,
            (CtlType::Record(meta), Value::Record(rec)) => {
                if rec.borrow().metadata().name() != meta.name() {
                    return Err(RuntimeError::type_mismatch(
                        meta.name(),
                        rec.borrow().metadata().name(),
                    ));
                }
                Value::Record(rec)
            }
            (target, v) => {
                return Err(RuntimeError::type_mismatch(target.to_string(), v.type_name()));
            }
        };
        Ok(converted)
    }

    pub fn as_bool(&self) -> Result<bool, RuntimeError> {
        match self {
            Value::Boolean(b) => Ok(*b),
            Value::Null => Err(RuntimeError::null_operand("boolean condition")),
            other => Err(RuntimeError::type_mismatch("boolean", other.type_name())),
        }
    }

    pub fn as_i64(&self) -> Result<i64, RuntimeError> {
        match self {
            Value::Integer(i) => Ok(i64::from(*i)),
            Value::Long(l) => Ok(*l),
            Value::Null => Err(RuntimeError::null_operand("integer conversion")),
            other => Err(RuntimeError::type_mismatch("integer", other.type_name())),
        }
    }

    pub fn as_f64(&self) -> Result<f64, RuntimeError> {
        match self {
            Value::Integer(i) => Ok(f64::from(*i)),
            #[allow(clippy::cast_precision_loss)]
            Value::Long(l) => Ok(*l as f64),
            Value::Number(n) => Ok(*n),
            Value::Decimal(d) => d
                .to_f64()
                .ok_or_else(|| RuntimeError::type_mismatch("number", "decimal")),
            Value::Null => Err(RuntimeError::null_operand("number conversion")),
            other => Err(RuntimeError::type_mismatch("number", other.type_name())),
        }
    }

    pub fn as_decimal(&self) -> Result<Decimal, RuntimeError> {
        match self {
            Value::Integer(i) => Ok(Decimal::from(*i)),
            Value::Long(l) => Ok(Decimal::from(*l)),
            Value::Number(n) => Ok(decimal::from_f64(*n)?),
            Value::Decimal(d) => Ok(*d),
            Value::Null => Err(RuntimeError::null_operand("decimal conversion")),
            other => Err(RuntimeError::type_mismatch("decimal", other.type_name())),
        }
    }

    pub fn as_str(&self) -> Result<&str, RuntimeError> {
        match self {
            Value::String(s) => Ok(s),
            Value::Null => Err(RuntimeError::null_operand("string operation")),
            other => Err(RuntimeError::type_mismatch("string", other.type_name())),
        }
    }

    pub fn as_date(&self) -> Result<DateTime<Utc>, RuntimeError> {
        match self {
            Value::Date(d) => Ok(*d),
            Value::Null => Err(RuntimeError::null_operand("date operation")),
            other => Err(RuntimeError::type_mismatch("date", other.type_name())),
        }
    }

    pub fn as_record(&self) -> Result<&RecordRef, RuntimeError> {
        match self {
            Value::Record(r) => Ok(r),
            Value::Null => Err(RuntimeError::null_operand("record access")),
            other => Err(RuntimeError::type_mismatch("record", other.type_name())),
        }
    }
}

impl MapKey {
    pub fn from_value(value: &Value) -> Result<MapKey, RuntimeError> {
        Ok(match value {
            Value::Null => MapKey::Null,
            Value::Integer(i) => MapKey::Integer(*i),
            Value::Long(l) => MapKey::Long(*l),
            Value::Number(n) => MapKey::Number(n.to_bits()),
            Value::Decimal(d) => MapKey::Decimal(d.normalize()),
            Value::String(s) => MapKey::String(s.clone()),
            Value::Boolean(b) => MapKey::Boolean(*b),
            Value::Date(d) => MapKey::Date(d.timestamp_millis()),
            other => return Err(RuntimeError::type_mismatch("map key", other.type_name())),
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Null => Value::Null,
            MapKey::Integer(i) => Value::Integer(*i),
            MapKey::Long(l) => Value::Long(*l),
            MapKey::Number(bits) => Value::Number(f64::from_bits(*bits)),
            MapKey::Decimal(d) => Value::Decimal(*d),
            MapKey::String(s) => Value::String(s.clone()),
            MapKey::Boolean(b) => Value::Boolean(*b),
            MapKey::Date(ms) => date_from_millis(*ms).map_or(Value::Null, Value::Date),
        }
    }
}

// ── Arithmetic ──────────────────────────────────────────────────────

/// Apply `op` with both operands promoted to `kind`.
///
/// `kind` is decided statically by the type checker; `OpKind::String` means
/// concatenation and `OpKind::Other` is list or map concatenation.
pub fn arithmetic(
    op: ArithOp,
    lhs: &Value,
    rhs: &Value,
    kind: OpKind,
) -> Result<Value, RuntimeError> {
    if kind == OpKind::String {
        return Ok(Value::String(format!("{lhs}{rhs}")));
    }
    if lhs.is_null() || rhs.is_null() {
        return Err(RuntimeError::null_operand(format!("operator '{}'", op.symbol())));
    }
    match kind {
        OpKind::Integer => {
            let (a, b) = (lhs.as_i64()?, rhs.as_i64()?);
            #[allow(clippy::cast_possible_truncation)]
            let (a, b) = (a as i32, b as i32);
            Ok(Value::Integer(match op {
                ArithOp::Add => a.wrapping_add(b),
                ArithOp::Sub => a.wrapping_sub(b),
                ArithOp::Mul => a.wrapping_mul(b),
                ArithOp::Div | ArithOp::Mod if b == 0 => return Err(RuntimeError::DivisionByZero),
                ArithOp::Div => a.wrapping_div(b),
                ArithOp::Mod => a.wrapping_rem(b),
            }))
        }
        OpKind::Long => {
            let (a, b) = (lhs.as_i64()?, rhs.as_i64()?);
            Ok(Value::Long(match op {
                ArithOp::Add => a.wrapping_add(b),
                ArithOp::Sub => a.wrapping_sub(b),
                ArithOp::Mul => a.wrapping_mul(b),
                ArithOp::Div | ArithOp::Mod if b == 0 => return Err(RuntimeError::DivisionByZero),
                ArithOp::Div => a.wrapping_div(b),
                ArithOp::Mod => a.wrapping_rem(b),
            }))
        }
        OpKind::Number => {
            let (a, b) = (lhs.as_f64()?, rhs.as_f64()?);
            Ok(Value::Number(match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => a / b,
                ArithOp::Mod => a % b,
            }))
        }
        OpKind::Decimal => {
            let (a, b) = (lhs.as_decimal()?, rhs.as_decimal()?);
            Ok(Value::Decimal(match op {
                ArithOp::Add => decimal::add(a, b)?,
                ArithOp::Sub => decimal::sub(a, b)?,
                ArithOp::Mul => decimal::mul(a, b)?,
                ArithOp::Div => decimal::div(a, b)?,
                ArithOp::Mod => decimal::rem(a, b)?,
            }))
        }
        OpKind::Other if op == ArithOp::Add => concat_containers(lhs, rhs),
        _ => Err(RuntimeError::type_mismatch(
            format!("operands of '{}'", op.symbol()),
            format!("{} and {}", lhs.type_name(), rhs.type_name()),
        )),
    }
}

fn concat_containers(lhs: &Value, rhs: &Value) -> Result<Value, RuntimeError> {
    match (lhs, rhs) {
        (Value::List(a), Value::List(b)) => {
            let mut items: Vec<Value> = a.borrow().iter().map(Value::deep_copy).collect();
            items.extend(b.borrow().iter().map(Value::deep_copy));
            Ok(new_list(items))
        }
        (Value::Map(a), Value::Map(b)) => {
            let mut entries: IndexMap<MapKey, Value> =
                a.borrow().iter().map(|(k, v)| (k.clone(), v.deep_copy())).collect();
            for (k, v) in b.borrow().iter() {
                entries.insert(k.clone(), v.deep_copy());
            }
            Ok(new_map(entries))
        }
        _ => Err(RuntimeError::type_mismatch("list or map", lhs.type_name())),
    }
}

pub fn negate(value: &Value, kind: OpKind) -> Result<Value, RuntimeError> {
    match (kind, value) {
        (_, Value::Null) => Err(RuntimeError::null_operand("unary '-'")),
        (OpKind::Integer, Value::Integer(i)) => Ok(Value::Integer(i.wrapping_neg())),
        (OpKind::Long, v) => Ok(Value::Long(v.as_i64()?.wrapping_neg())),
        (OpKind::Number, v) => Ok(Value::Number(-v.as_f64()?)),
        (OpKind::Decimal, v) => Ok(Value::Decimal(-v.as_decimal()?)),
        (_, v) => Err(RuntimeError::type_mismatch("numeric operand", v.type_name())),
    }
}

/// Add `delta` to a numeric value keeping its type, as `++`/`--` do.
pub fn step(value: &Value, delta: i32) -> Result<Value, RuntimeError> {
    let kind = match value {
        Value::Integer(_) => OpKind::Integer,
        Value::Long(_) => OpKind::Long,
        Value::Number(_) => OpKind::Number,
        Value::Decimal(_) => OpKind::Decimal,
        Value::Null => return Err(RuntimeError::null_operand("increment")),
        other => return Err(RuntimeError::type_mismatch("numeric operand", other.type_name())),
    };
    arithmetic(ArithOp::Add, value, &Value::Integer(delta), kind)
}

// ── Comparison ──────────────────────────────────────────────────────

/// Evaluate a comparison operator.
///
/// Equality treats `null` as a regular value; ordering a `null` fails.
/// `number` operands follow IEEE 754, so every comparison with NaN except
/// `!=` is false.
#[allow(clippy::float_cmp)]
pub fn compare_values(
    op: CompareOp,
    lhs: &Value,
    rhs: &Value,
    kind: OpKind,
) -> Result<bool, RuntimeError> {
    if kind == OpKind::Number && !lhs.is_null() && !rhs.is_null() {
        let (a, b) = (lhs.as_f64()?, rhs.as_f64()?);
        return Ok(match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        });
    }
    match op {
        CompareOp::Eq => equals(lhs, rhs, kind),
        CompareOp::Ne => equals(lhs, rhs, kind).map(|eq| !eq),
        _ => {
            let ord = order(lhs, rhs, kind)?;
            Ok(match op {
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            })
        }
    }
}

#[allow(clippy::float_cmp)]
pub fn equals(lhs: &Value, rhs: &Value, kind: OpKind) -> Result<bool, RuntimeError> {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => Ok(true),
        (Value::Null, _) | (_, Value::Null) => Ok(false),
        _ if kind == OpKind::Other => Ok(structural_eq(lhs, rhs)),
        _ if kind == OpKind::Number => Ok(lhs.as_f64()? == rhs.as_f64()?),
        _ => Ok(order(lhs, rhs, kind)? == Ordering::Equal),
    }
}

/// Total order used by sorting and `min`/`max`; NaN sorts above every
/// other number.
pub fn order(lhs: &Value, rhs: &Value, kind: OpKind) -> Result<Ordering, RuntimeError> {
    if lhs.is_null() || rhs.is_null() {
        return Err(RuntimeError::null_operand("comparison"));
    }
    Ok(match kind {
        OpKind::Integer | OpKind::Long => lhs.as_i64()?.cmp(&rhs.as_i64()?),
        OpKind::Number => lhs.as_f64()?.total_cmp(&rhs.as_f64()?),
        OpKind::Decimal => lhs.as_decimal()?.cmp(&rhs.as_decimal()?),
        OpKind::String => lhs.as_str()?.cmp(rhs.as_str()?),
        OpKind::Boolean => lhs.as_bool()?.cmp(&rhs.as_bool()?),
        OpKind::Date => lhs.as_date()?.cmp(&rhs.as_date()?),
        OpKind::Other => {
            return Err(RuntimeError::type_mismatch(
                "ordered operands",
                format!("{} and {}", lhs.type_name(), rhs.type_name()),
            ))
        }
    })
}

/// Deep equality used for containers, records and `containsValue`.
pub fn structural_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => true,
        (Value::List(a), Value::List(b)) => {
            Rc::ptr_eq(a, b) || {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| structural_eq(x, y))
            }
        }
        (Value::Map(a), Value::Map(b)) => {
            Rc::ptr_eq(a, b) || {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| structural_eq(v, w)))
            }
        }
        (Value::Record(a), Value::Record(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::Date(a), Value::Date(b)) => a == b,
        (a, b) => match (numeric_kind(a), numeric_kind(b)) {
            (Some(ka), Some(kb)) => {
                let kind = if ka >= kb { a } else { b };
                let kind = match kind {
                    Value::Integer(_) => OpKind::Integer,
                    Value::Long(_) => OpKind::Long,
                    Value::Number(_) => OpKind::Number,
                    _ => OpKind::Decimal,
                };
                matches!(order(a, b, kind), Ok(Ordering::Equal))
            }
            _ => false,
        },
    }
}

fn numeric_kind(v: &Value) -> Option<u8> {
    match v {
        Value::Integer(_) => Some(0),
        Value::Long(_) => Some(1),
        Value::Number(_) => Some(2),
        Value::Decimal(_) => Some(3),
        _ => None,
    }
}

// ── Rendering ───────────────────────────────────────────────────────

pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.1}")
    } else {
        format!("{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Long(l) => write!(f, "{l}"),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d %H:%M:%S")),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={v}", k.to_value())?;
                }
                write!(f, "}}")
            }
            Value::Record(rec) => write!(f, "{}", rec.borrow()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn integer_minus_integer() {
        let (ten, hundred) = (Value::Integer(10), Value::Integer(100));
        let r = arithmetic(ArithOp::Sub, &ten, &hundred, OpKind::Integer).unwrap();
        assert!(matches!(r, Value::Integer(-90)));
    }

    #[test]
    fn integer_plus_long_is_long() {
        let r = arithmetic(ArithOp::Add, &Value::Integer(1), &Value::Long(2), OpKind::Long);
        let r = r.unwrap();
        assert!(matches!(r, Value::Long(3)));
    }

    #[test]
    fn decimal_absorbs_number() {
        let r = arithmetic(
            ArithOp::Mul,
            &Value::Number(0.5),
            &Value::Decimal(Decimal::new(4, 0)),
            OpKind::Decimal,
        )
        .unwrap();
        assert_eq!(r.as_decimal().unwrap(), Decimal::new(2, 0));
    }

    #[test]
    fn integer_division_by_zero_fails() {
        let err = arithmetic(ArithOp::Div, &Value::Integer(1), &Value::Integer(0), OpKind::Integer);
        assert!(matches!(err, Err(RuntimeError::DivisionByZero)));
        let err = arithmetic(ArithOp::Mod, &Value::Long(1), &Value::Long(0), OpKind::Long);
        assert!(matches!(err, Err(RuntimeError::DivisionByZero)));
    }

    #[test]
    fn number_division_by_zero_is_infinite() {
        let r = arithmetic(ArithOp::Div, &Value::Number(1.0), &Value::Integer(0), OpKind::Number);
        let r = r.unwrap();
        assert!(r.as_f64().unwrap().is_infinite());
    }

    #[test]
    fn integer_overflow_wraps() {
        let (max, one) = (Value::Integer(i32::MAX), Value::Integer(1));
        let r = arithmetic(ArithOp::Add, &max, &one, OpKind::Integer).unwrap();
        assert!(matches!(r, Value::Integer(i32::MIN)));
    }

    #[test]
    fn min_divided_by_minus_one_wraps() {
        let (min, minus_one) = (Value::Integer(i32::MIN), Value::Integer(-1));
        let r = arithmetic(ArithOp::Div, &min, &minus_one, OpKind::Integer).unwrap();
        assert!(matches!(r, Value::Integer(i32::MIN)));
        let r = arithmetic(ArithOp::Mod, &min, &minus_one, OpKind::Integer).unwrap();
        assert!(matches!(r, Value::Integer(0)));
        let (min, minus_one) = (Value::Long(i64::MIN), Value::Long(-1));
        let r = arithmetic(ArithOp::Div, &min, &minus_one, OpKind::Long).unwrap();
        assert!(matches!(r, Value::Long(i64::MIN)));
        let r = arithmetic(ArithOp::Mod, &min, &minus_one, OpKind::Long).unwrap();
        assert!(matches!(r, Value::Long(0)));
    }

    #[test]
    fn string_concatenation_renders_any_scalar() {
        let concat = |a: Value, b: Value| arithmetic(ArithOp::Add, &a, &b, OpKind::String).unwrap();
        let r = concat(Value::String("n=".into()), Value::Number(2.0));
        assert_eq!(r.to_string(), "n=2.0");
        let r = concat(Value::Boolean(true), Value::String("!".into()));
        assert_eq!(r.to_string(), "true!");
        let r = concat(Value::String("x".into()), Value::Null);
        assert_eq!(r.to_string(), "xnull");
    }

    #[test]
    fn null_operand_in_arithmetic_fails() {
        let err = arithmetic(ArithOp::Add, &Value::Null, &Value::Integer(1), OpKind::Integer);
        assert!(matches!(err, Err(RuntimeError::NullOperand { .. })));
    }

    #[test]
    fn commutativity_across_promoted_pairs() {
        let samples = [
            (Value::Integer(3), OpKind::Integer),
            (Value::Long(5), OpKind::Long),
            (Value::Number(1.5), OpKind::Number),
            (Value::Decimal(Decimal::new(25, 1)), OpKind::Decimal),
        ];
        for (a, ka) in &samples {
            for (b, kb) in &samples {
                let kind = if rank(*ka) >= rank(*kb) { *ka } else { *kb };
                for op in [ArithOp::Add, ArithOp::Mul] {
                    let ab = arithmetic(op, a, b, kind).unwrap();
                    let ba = arithmetic(op, b, a, kind).unwrap();
                    assert!(structural_eq(&ab, &ba), "{a} {} {b}", op.symbol());
                }
            }
        }
    }

    fn rank(kind: OpKind) -> u8 {
        match kind {
            OpKind::Integer => 0,
            OpKind::Long => 1,
            OpKind::Number => 2,
            _ => 3,
        }
    }

    #[test]
    fn equality_with_null() {
        assert!(equals(&Value::Null, &Value::Null, OpKind::Integer).unwrap());
        assert!(!equals(&Value::Integer(1), &Value::Null, OpKind::Integer).unwrap());
        assert!(order(&Value::Null, &Value::Integer(1), OpKind::Integer).is_err());
    }

    #[test]
    fn mixed_numeric_comparison() {
        let (one, one_half) = (Value::Integer(1), Value::Number(1.5));
        assert!(compare_values(CompareOp::Lt, &one, &one_half, OpKind::Number).unwrap());
        let two = Value::Decimal(Decimal::new(20, 1));
        assert!(compare_values(CompareOp::Eq, &Value::Long(2), &two, OpKind::Decimal).unwrap());
    }

    #[test]
    fn nan_compares_false() {
        let nan = Value::Number(f64::NAN);
        let one = Value::Number(1.0);
        for op in [CompareOp::Eq, CompareOp::Lt, CompareOp::Le, CompareOp::Gt, CompareOp::Ge] {
            assert!(!compare_values(op, &nan, &one, OpKind::Number).unwrap());
        }
        assert!(!compare_values(CompareOp::Eq, &nan, &nan, OpKind::Number).unwrap());
        assert!(compare_values(CompareOp::Ne, &nan, &nan, OpKind::Number).unwrap());
        assert_eq!(order(&nan, &one, OpKind::Number).unwrap(), Ordering::Greater);
    }

    #[test]
    fn coerce_widens_but_never_narrows() {
        assert!(matches!(Value::Integer(4).coerce_to(&CtlType::Long).unwrap(), Value::Long(4)));
        assert!(Value::Long(4).coerce_to(&CtlType::Integer).is_err());
        assert!(Value::Null.coerce_to(&CtlType::Date).unwrap().is_null());
    }

    #[test]
    fn deep_copy_detaches_lists() {
        let original = new_list(vec![Value::Integer(1)]);
        let copy = original.deep_copy();
        if let Value::List(items) = &copy {
            items.borrow_mut().push(Value::Integer(2));
        }
        if let Value::List(items) = &original {
            assert_eq!(items.borrow().len(), 1);
        }
    }

    #[test]
    fn defaults_per_type() {
        assert!(matches!(Value::default_for(&CtlType::Integer), Value::Integer(0)));
        assert_eq!(Value::default_for(&CtlType::String).to_string(), "");
        assert_eq!(Value::default_for(&CtlType::Date).to_string(), "1970-01-01 00:00:00");
        assert_eq!(Value::default_for(&CtlType::list_of(CtlType::Integer)).to_string(), "[]");
    }

    #[test]
    fn rendering_of_containers() {
        let mut m = IndexMap::new();
        m.insert(MapKey::String("a".into()), Value::Integer(1));
        m.insert(MapKey::Null, Value::Null);
        assert_eq!(new_map(m).to_string(), "{a=1, null=null}");
        let l = new_list(vec![Value::Integer(1), Value::Null]);
        assert_eq!(l.to_string(), "[1, null]");
    }
}
