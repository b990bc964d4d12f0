use std::cmp::Ordering;

use chrono::{Datelike, Duration, Months, Utc};
use regex::Regex;
use rust_decimal::RoundingStrategy;

use crate::model::record::parse_date;
use crate::model::types::{distance, GENERIC_DISTANCE};
use crate::model::value::{date_from_millis, new_list, order};
use crate::model::{CtlType, ListView, MapView, OpKind, RuntimeError, Value};

/// Parameter type of a builtin. The `Any*` forms are generic and score
/// [`GENERIC_DISTANCE`] during overload resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    Integer,
    Long,
    Number,
    Decimal,
    String,
    Boolean,
    Date,
    Void,
    Any,
    AnyList,
    AnyMap,
    AnyRecord,
}

impl Ty {
    pub fn to_ctl(self) -> CtlType {
        match self {
            Ty::Integer => CtlType::Integer,
            Ty::Long => CtlType::Long,
            Ty::Number => CtlType::Number,
            Ty::Decimal => CtlType::Decimal,
            Ty::String => CtlType::String,
            Ty::Boolean => CtlType::Boolean,
            Ty::Date => CtlType::Date,
            Ty::Void => CtlType::Void,
            Ty::Any | Ty::AnyRecord => CtlType::Any,
            Ty::AnyList => CtlType::list_of(CtlType::Any),
            Ty::AnyMap => CtlType::map_of(CtlType::Any, CtlType::Any),
        }
    }

    /// Cost of passing an argument of type `arg`.
    pub fn distance(self, arg: &CtlType) -> Option<u32> {
        if arg.is_wildcard() {
            return Some(0);
        }
        match (self, arg) {
            (Ty::Any, CtlType::Void) => None,
            (Ty::Any, _) => Some(GENERIC_DISTANCE),
            (Ty::AnyList, CtlType::List(_))
            | (Ty::AnyMap, CtlType::Map(..))
            | (Ty::AnyRecord, CtlType::Record(_)) => Some(GENERIC_DISTANCE),
            (Ty::AnyList | Ty::AnyMap | Ty::AnyRecord, _) => None,
            (scalar, arg) => distance(arg, &scalar.to_ctl()),
        }
    }

    fn coerce(self, value: Value) -> Result<Value, RuntimeError> {
        match self {
            Ty::Integer
            | Ty::Long
            | Ty::Number
            | Ty::Decimal
            | Ty::String
            | Ty::Boolean
            | Ty::Date => value.coerce_to(&self.to_ctl()),
            _ => Ok(value),
        }
    }
}

/// How a builtin's result type is derived from its argument types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ret {
    Ty(Ty),
    /// Same type as argument `n`.
    Arg(usize),
    /// Element type of the list or value type of the map in argument `n`.
    Elem(usize),
    /// `K[]` for the map in argument `n`.
    Keys(usize),
    /// `V[]` for the map in argument `n`.
    Values(usize),
    /// `string[]`.
    Strings,
}

pub type BuiltinEval = fn(&[Value]) -> Result<Value, RuntimeError>;

/// Built-in function: single source of truth for name, signature and
/// implementation. The resolver, both back-ends and the CLI reference
/// listing all read from this table.
#[derive(Debug, Clone)]
pub struct BuiltinFn {
    pub name: &'static str,
    pub params: &'static [(&'static str, Ty)],
    /// The last parameter may repeat.
    pub variadic: bool,
    pub ret: Ret,
    /// A null argument makes the result null without calling `eval`.
    pub propagate_null: bool,
    pub category: &'static str,
    pub description: &'static str,
    pub eval: BuiltinEval,
}

impl BuiltinFn {
    /// Summed conversion distance for a call with `args`, or `None` when
    /// the arity or a type does not fit.
    pub fn distance(&self, args: &[CtlType]) -> Option<u32> {
        let fixed = self.params.len();
        let arity_ok = if self.variadic { args.len() >= fixed } else { args.len() == fixed };
        if !arity_ok {
            return None;
        }
        args.iter()
            .enumerate()
            .map(|(i, arg)| self.param_ty(i).and_then(|ty| ty.distance(arg)))
            .sum()
    }

    fn param_ty(&self, index: usize) -> Option<Ty> {
        self.params
            .get(index)
            .or_else(|| self.params.last().filter(|_| self.variadic))
            .map(|(_, ty)| *ty)
    }

    pub fn return_type(&self, args: &[CtlType]) -> CtlType {
        let arg = |n: usize| {
            args.get(n)
                .filter(|t| !t.is_wildcard())
                .or_else(|| args.iter().skip(n).find(|t| !t.is_wildcard()))
                .cloned()
                .unwrap_or(CtlType::Unknown)
        };
        match self.ret {
            Ret::Ty(ty) => ty.to_ctl(),
            Ret::Arg(n) => arg(n),
            Ret::Elem(n) => arg(n).element_type().cloned().unwrap_or(CtlType::Unknown),
            Ret::Keys(n) => match arg(n) {
                CtlType::Map(k, _) => CtlType::List(k),
                _ => CtlType::list_of(CtlType::Unknown),
            },
            Ret::Values(n) => match arg(n) {
                CtlType::Map(_, v) => CtlType::List(v),
                _ => CtlType::list_of(CtlType::Unknown),
            },
            Ret::Strings => CtlType::list_of(CtlType::String),
        }
    }

    /// One-line signature for listings and diagnostics.
    pub fn signature(&self) -> String {
        let params: Vec<String> =
            self.params.iter().map(|(n, t)| format!("{} {n}", t.to_ctl())).collect();
        let dots = if self.variadic { "..." } else { "" };
        format!("{}({}{dots})", self.name, params.join(", "))
    }
}

/// Indices of every builtin overload called `name`.
pub fn candidates(name: &str) -> impl Iterator<Item = (usize, &'static BuiltinFn)> + '_ {
    BUILTINS.iter().enumerate().filter(move |(_, b)| b.name == name)
}

/// Coerce arguments to the declared parameter types and run builtin `id`.
pub fn invoke(id: usize, args: Vec<Value>) -> Result<Value, RuntimeError> {
    let builtin = BUILTINS.get(id).ok_or_else(|| RuntimeError::UnknownFunction(format!("#{id}")))?;
    if builtin.propagate_null && args.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }
    let args = args
        .into_iter()
        .enumerate()
        .map(|(i, v)| match builtin.param_ty(i) {
            Some(ty) => ty.coerce(v),
            None => Ok(v),
        })
        .collect::<Result<Vec<_>, _>>()?;
    (builtin.eval)(&args)
}

/// All built-in functions available in CTL.
#[rustfmt::skip]
pub static BUILTINS: &[BuiltinFn] = &[
    // ── Strings ─────────────────────────────────────────────────
    BuiltinFn {
        name: "length", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::Integer),
        propagate_null: false, category: "string", description: "Number of characters; 0 for null", eval: length_string,
    },
    BuiltinFn {
        name: "length", params: &[("l", Ty::AnyList)], variadic: false, ret: Ret::Ty(Ty::Integer),
        propagate_null: false, category: "container", description: "Number of elements", eval: length_list,
    },
    BuiltinFn {
        name: "length", params: &[("m", Ty::AnyMap)], variadic: false, ret: Ret::Ty(Ty::Integer),
        propagate_null: false, category: "container", description: "Number of entries", eval: length_map,
    },
    BuiltinFn {
        name: "length", params: &[("r", Ty::AnyRecord)], variadic: false, ret: Ret::Ty(Ty::Integer),
        propagate_null: false, category: "record", description: "Number of fields", eval: num_fields,
    },
    BuiltinFn {
        name: "upperCase", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::String),
        propagate_null: true, category: "string", description: "Convert to upper case", eval: upper_case,
    },
    BuiltinFn {
        name: "lowerCase", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::String),
        propagate_null: true, category: "string", description: "Convert to lower case", eval: lower_case,
    },
    BuiltinFn {
        name: "trim", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::String),
        propagate_null: true, category: "string", description: "Strip leading and trailing whitespace", eval: trim,
    },
    BuiltinFn {
        name: "substring", params: &[("s", Ty::String), ("from", Ty::Integer), ("length", Ty::Integer)], variadic: false,
        ret: Ret::Ty(Ty::String), propagate_null: true, category: "string",
        description: "Characters [from, from + length), clipped at the end of the string", eval: substring,
    },
    BuiltinFn {
        name: "left", params: &[("s", Ty::String), ("n", Ty::Integer)], variadic: false, ret: Ret::Ty(Ty::String),
        propagate_null: true, category: "string", description: "First n characters", eval: left,
    },
    BuiltinFn {
        name: "right", params: &[("s", Ty::String), ("n", Ty::Integer)], variadic: false, ret: Ret::Ty(Ty::String),
        propagate_null: true, category: "string", description: "Last n characters", eval: right,
    },
    BuiltinFn {
        name: "concat", params: &[("s", Ty::String)], variadic: true, ret: Ret::Ty(Ty::String),
        propagate_null: false, category: "string", description: "Concatenate every argument", eval: concat,
    },
    BuiltinFn {
        name: "indexOf", params: &[("s", Ty::String), ("sub", Ty::String)], variadic: false, ret: Ret::Ty(Ty::Integer),
        propagate_null: true, category: "string", description: "Character position of sub, or -1", eval: index_of,
    },
    BuiltinFn {
        name: "indexOf", params: &[("s", Ty::String), ("sub", Ty::String), ("from", Ty::Integer)], variadic: false,
        ret: Ret::Ty(Ty::Integer), propagate_null: true, category: "string",
        description: "Character position of sub at or after from, or -1", eval: index_of,
    },
    BuiltinFn {
        name: "contains", params: &[("s", Ty::String), ("sub", Ty::String)], variadic: false, ret: Ret::Ty(Ty::Boolean),
        propagate_null: true, category: "string", description: "True when sub occurs in s", eval: contains,
    },
    BuiltinFn {
        name: "startsWith", params: &[("s", Ty::String), ("prefix", Ty::String)], variadic: false,
        ret: Ret::Ty(Ty::Boolean), propagate_null: true, category: "string", description: "Prefix test", eval: starts_with,
    },
    BuiltinFn {
        name: "endsWith", params: &[("s", Ty::String), ("suffix", Ty::String)], variadic: false,
        ret: Ret::Ty(Ty::Boolean), propagate_null: true, category: "string", description: "Suffix test", eval: ends_with,
    },
    BuiltinFn {
        name: "replace", params: &[("s", Ty::String), ("regex", Ty::String), ("replacement", Ty::String)],
        variadic: false, ret: Ret::Ty(Ty::String), propagate_null: true, category: "string",
        description: "Replace every match of regex; $1 refers to groups", eval: replace,
    },
    BuiltinFn {
        name: "matches", params: &[("s", Ty::String), ("regex", Ty::String)], variadic: false,
        ret: Ret::Ty(Ty::Boolean), propagate_null: true, category: "string",
        description: "True when the whole string matches regex", eval: matches_regex,
    },
    BuiltinFn {
        name: "split", params: &[("s", Ty::String), ("regex", Ty::String)], variadic: false,
        ret: Ret::Strings, propagate_null: true, category: "string",
        description: "Split around matches of regex into a string[]", eval: split,
    },
    BuiltinFn {
        name: "join", params: &[("separator", Ty::String), ("items", Ty::AnyList)], variadic: false,
        ret: Ret::Ty(Ty::String), propagate_null: false, category: "string",
        description: "String forms of the elements joined by separator", eval: join,
    },
    BuiltinFn {
        name: "isEmpty", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::Boolean),
        propagate_null: false, category: "string", description: "True for null or \"\"", eval: is_empty,
    },
    BuiltinFn {
        name: "isEmpty", params: &[("l", Ty::AnyList)], variadic: false, ret: Ret::Ty(Ty::Boolean),
        propagate_null: false, category: "container", description: "True for null or an empty list", eval: is_empty,
    },
    BuiltinFn {
        name: "isEmpty", params: &[("m", Ty::AnyMap)], variadic: false, ret: Ret::Ty(Ty::Boolean),
        propagate_null: false, category: "container", description: "True for null or an empty map", eval: is_empty,
    },
    // ── Math ────────────────────────────────────────────────────
    BuiltinFn {
        name: "abs", params: &[("x", Ty::Integer)], variadic: false, ret: Ret::Ty(Ty::Integer),
        propagate_null: true, category: "math", description: "Absolute value", eval: abs,
    },
    BuiltinFn {
        name: "abs", params: &[("x", Ty::Long)], variadic: false, ret: Ret::Ty(Ty::Long),
        propagate_null: true, category: "math", description: "Absolute value", eval: abs,
    },
    BuiltinFn {
        name: "abs", params: &[("x", Ty::Number)], variadic: false, ret: Ret::Ty(Ty::Number),
        propagate_null: true, category: "math", description: "Absolute value", eval: abs,
    },
    BuiltinFn {
        name: "abs", params: &[("x", Ty::Decimal)], variadic: false, ret: Ret::Ty(Ty::Decimal),
        propagate_null: true, category: "math", description: "Absolute value", eval: abs,
    },
    BuiltinFn {
        name: "round", params: &[("x", Ty::Number)], variadic: false, ret: Ret::Ty(Ty::Long),
        propagate_null: true, category: "math", description: "Nearest long, halves away from zero", eval: round,
    },
    BuiltinFn {
        name: "round", params: &[("x", Ty::Decimal)], variadic: false, ret: Ret::Ty(Ty::Decimal),
        propagate_null: true, category: "math", description: "Nearest whole decimal, halves away from zero", eval: round,
    },
    BuiltinFn {
        name: "floor", params: &[("x", Ty::Number)], variadic: false, ret: Ret::Ty(Ty::Number),
        propagate_null: true, category: "math", description: "Round down", eval: floor,
    },
    BuiltinFn {
        name: "floor", params: &[("x", Ty::Decimal)], variadic: false, ret: Ret::Ty(Ty::Decimal),
        propagate_null: true, category: "math", description: "Round down", eval: floor,
    },
    BuiltinFn {
        name: "ceil", params: &[("x", Ty::Number)], variadic: false, ret: Ret::Ty(Ty::Number),
        propagate_null: true, category: "math", description: "Round up", eval: ceil,
    },
    BuiltinFn {
        name: "ceil", params: &[("x", Ty::Decimal)], variadic: false, ret: Ret::Ty(Ty::Decimal),
        propagate_null: true, category: "math", description: "Round up", eval: ceil,
    },
    BuiltinFn {
        name: "sqrt", params: &[("x", Ty::Number)], variadic: false, ret: Ret::Ty(Ty::Number),
        propagate_null: true, category: "math", description: "Square root", eval: sqrt,
    },
    BuiltinFn {
        name: "pow", params: &[("base", Ty::Number), ("exp", Ty::Number)], variadic: false, ret: Ret::Ty(Ty::Number),
        propagate_null: true, category: "math", description: "Power", eval: pow,
    },
    BuiltinFn {
        name: "min", params: &[("a", Ty::Integer), ("b", Ty::Integer)], variadic: false, ret: Ret::Ty(Ty::Integer),
        propagate_null: true, category: "math", description: "Smaller argument", eval: min,
    },
    BuiltinFn {
        name: "min", params: &[("a", Ty::Long), ("b", Ty::Long)], variadic: false, ret: Ret::Ty(Ty::Long),
        propagate_null: true, category: "math", description: "Smaller argument", eval: min,
    },
    BuiltinFn {
        name: "min", params: &[("a", Ty::Number), ("b", Ty::Number)], variadic: false, ret: Ret::Ty(Ty::Number),
        propagate_null: true, category: "math", description: "Smaller argument", eval: min,
    },
    BuiltinFn {
        name: "min", params: &[("a", Ty::Decimal), ("b", Ty::Decimal)], variadic: false, ret: Ret::Ty(Ty::Decimal),
        propagate_null: true, category: "math", description: "Smaller argument", eval: min,
    },
    BuiltinFn {
        name: "max", params: &[("a", Ty::Integer), ("b", Ty::Integer)], variadic: false, ret: Ret::Ty(Ty::Integer),
        propagate_null: true, category: "math", description: "Larger argument", eval: max,
    },
    BuiltinFn {
        name: "max", params: &[("a", Ty::Long), ("b", Ty::Long)], variadic: false, ret: Ret::Ty(Ty::Long),
        propagate_null: true, category: "math", description: "Larger argument", eval: max,
    },
    BuiltinFn {
        name: "max", params: &[("a", Ty::Number), ("b", Ty::Number)], variadic: false, ret: Ret::Ty(Ty::Number),
        propagate_null: true, category: "math", description: "Larger argument", eval: max,
    },
    BuiltinFn {
        name: "max", params: &[("a", Ty::Decimal), ("b", Ty::Decimal)], variadic: false, ret: Ret::Ty(Ty::Decimal),
        propagate_null: true, category: "math", description: "Larger argument", eval: max,
    },
    // ── Conversion ──────────────────────────────────────────────
    BuiltinFn {
        name: "num2str", params: &[("x", Ty::Integer)], variadic: false, ret: Ret::Ty(Ty::String),
        propagate_null: true, category: "conversion", description: "Decimal text of a number", eval: to_string,
    },
    BuiltinFn {
        name: "num2str", params: &[("x", Ty::Long)], variadic: false, ret: Ret::Ty(Ty::String),
        propagate_null: true, category: "conversion", description: "Decimal text of a number", eval: to_string,
    },
    BuiltinFn {
        name: "num2str", params: &[("x", Ty::Number)], variadic: false, ret: Ret::Ty(Ty::String),
        propagate_null: true, category: "conversion", description: "Decimal text of a number", eval: to_string,
    },
    BuiltinFn {
        name: "num2str", params: &[("x", Ty::Decimal)], variadic: false, ret: Ret::Ty(Ty::String),
        propagate_null: true, category: "conversion", description: "Decimal text of a number", eval: to_string,
    },
    BuiltinFn {
        name: "str2integer", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::Integer),
        propagate_null: true, category: "conversion", description: "Parse an integer", eval: str2integer,
    },
    BuiltinFn {
        name: "str2long", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::Long),
        propagate_null: true, category: "conversion", description: "Parse a long", eval: str2long,
    },
    BuiltinFn {
        name: "str2double", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::Number),
        propagate_null: true, category: "conversion", description: "Parse a number", eval: str2double,
    },
    BuiltinFn {
        name: "str2decimal", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::Decimal),
        propagate_null: true, category: "conversion", description: "Parse a decimal exactly", eval: str2decimal,
    },
    BuiltinFn {
        name: "str2bool", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::Boolean),
        propagate_null: true, category: "conversion", description: "Parse true/false, yes/no, 1/0", eval: str2bool,
    },
    BuiltinFn {
        name: "date2str", params: &[("d", Ty::Date), ("pattern", Ty::String)], variadic: false,
        ret: Ret::Ty(Ty::String), propagate_null: true, category: "conversion",
        description: "Format a date with a yyyy-MM-dd HH:mm:ss style pattern", eval: date2str,
    },
    BuiltinFn {
        name: "str2date", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::Date),
        propagate_null: true, category: "conversion", description: "Parse an ISO-like date", eval: str2date,
    },
    BuiltinFn {
        name: "str2date", params: &[("s", Ty::String), ("pattern", Ty::String)], variadic: false,
        ret: Ret::Ty(Ty::Date), propagate_null: true, category: "conversion",
        description: "Parse a date with a yyyy-MM-dd HH:mm:ss style pattern", eval: str2date,
    },
    BuiltinFn {
        name: "date2long", params: &[("d", Ty::Date)], variadic: false, ret: Ret::Ty(Ty::Long),
        propagate_null: true, category: "conversion", description: "Milliseconds since the epoch", eval: date2long,
    },
    BuiltinFn {
        name: "long2date", params: &[("ms", Ty::Long)], variadic: false, ret: Ret::Ty(Ty::Date),
        propagate_null: true, category: "conversion", description: "Date from epoch milliseconds", eval: long2date,
    },
    BuiltinFn {
        name: "toString", params: &[("x", Ty::Any)], variadic: false, ret: Ret::Ty(Ty::String),
        propagate_null: false, category: "conversion", description: "String form of any value", eval: to_string,
    },
    // ── Dates ───────────────────────────────────────────────────
    BuiltinFn {
        name: "today", params: &[], variadic: false, ret: Ret::Ty(Ty::Date),
        propagate_null: false, category: "date", description: "Current instant", eval: today,
    },
    BuiltinFn {
        name: "dateAdd", params: &[("d", Ty::Date), ("amount", Ty::Long), ("unit", Ty::String)], variadic: false,
        ret: Ret::Ty(Ty::Date), propagate_null: true, category: "date",
        description: "Shift by amount units (millisec, second, minute, hour, day, week, month, year)", eval: date_add,
    },
    BuiltinFn {
        name: "dateDiff", params: &[("a", Ty::Date), ("b", Ty::Date), ("unit", Ty::String)], variadic: false,
        ret: Ret::Ty(Ty::Long), propagate_null: true, category: "date",
        description: "Whole units between b and a", eval: date_diff,
    },
    // ── Containers ──────────────────────────────────────────────
    BuiltinFn {
        name: "append", params: &[("l", Ty::AnyList), ("x", Ty::Any)], variadic: false, ret: Ret::Arg(0),
        propagate_null: false, category: "container", description: "Add x at the end; returns l", eval: append,
    },
    BuiltinFn {
        name: "push", params: &[("l", Ty::AnyList), ("x", Ty::Any)], variadic: false, ret: Ret::Arg(0),
        propagate_null: false, category: "container", description: "Add x at the end; returns l", eval: append,
    },
    BuiltinFn {
        name: "insert", params: &[("l", Ty::AnyList), ("index", Ty::Integer), ("x", Ty::Any)], variadic: false,
        ret: Ret::Arg(0), propagate_null: false, category: "container", description: "Insert x at index", eval: insert,
    },
    BuiltinFn {
        name: "remove", params: &[("l", Ty::AnyList), ("index", Ty::Integer)], variadic: false, ret: Ret::Elem(0),
        propagate_null: false, category: "container", description: "Remove and return element index", eval: remove,
    },
    BuiltinFn {
        name: "remove", params: &[("m", Ty::AnyMap), ("key", Ty::Any)], variadic: false, ret: Ret::Elem(0),
        propagate_null: false, category: "container", description: "Remove key; returns its value or null", eval: remove,
    },
    BuiltinFn {
        name: "clear", params: &[("l", Ty::AnyList)], variadic: false, ret: Ret::Ty(Ty::Void),
        propagate_null: false, category: "container", description: "Remove every element", eval: clear,
    },
    BuiltinFn {
        name: "clear", params: &[("m", Ty::AnyMap)], variadic: false, ret: Ret::Ty(Ty::Void),
        propagate_null: false, category: "container", description: "Remove every entry", eval: clear,
    },
    BuiltinFn {
        name: "poll", params: &[("l", Ty::AnyList)], variadic: false, ret: Ret::Elem(0),
        propagate_null: false, category: "container", description: "Remove and return the first element", eval: poll,
    },
    BuiltinFn {
        name: "pop", params: &[("l", Ty::AnyList)], variadic: false, ret: Ret::Elem(0),
        propagate_null: false, category: "container", description: "Remove and return the last element", eval: pop,
    },
    BuiltinFn {
        name: "containsKey", params: &[("m", Ty::AnyMap), ("key", Ty::Any)], variadic: false,
        ret: Ret::Ty(Ty::Boolean), propagate_null: false, category: "container", description: "Key test", eval: contains_key,
    },
    BuiltinFn {
        name: "containsValue", params: &[("m", Ty::AnyMap), ("x", Ty::Any)], variadic: false,
        ret: Ret::Ty(Ty::Boolean), propagate_null: false, category: "container", description: "Value test", eval: contains_value,
    },
    BuiltinFn {
        name: "containsValue", params: &[("l", Ty::AnyList), ("x", Ty::Any)], variadic: false,
        ret: Ret::Ty(Ty::Boolean), propagate_null: false, category: "container", description: "Element test", eval: contains_value,
    },
    BuiltinFn {
        name: "getKeys", params: &[("m", Ty::AnyMap)], variadic: false, ret: Ret::Keys(0),
        propagate_null: false, category: "container", description: "Keys in insertion order", eval: get_keys,
    },
    BuiltinFn {
        name: "getValues", params: &[("m", Ty::AnyMap)], variadic: false, ret: Ret::Values(0),
        propagate_null: false, category: "container", description: "Values in insertion order", eval: get_values,
    },
    BuiltinFn {
        name: "sort", params: &[("l", Ty::AnyList)], variadic: false, ret: Ret::Arg(0),
        propagate_null: false, category: "container", description: "Sort in place, nulls first; returns l", eval: sort,
    },
    BuiltinFn {
        name: "reverse", params: &[("l", Ty::AnyList)], variadic: false, ret: Ret::Arg(0),
        propagate_null: false, category: "container", description: "Reverse in place; returns l", eval: reverse,
    },
    BuiltinFn {
        name: "reverse", params: &[("s", Ty::String)], variadic: false, ret: Ret::Ty(Ty::String),
        propagate_null: true, category: "string", description: "Characters in reverse order", eval: reverse,
    },
    BuiltinFn {
        name: "copy", params: &[("to", Ty::AnyList), ("from", Ty::AnyList)], variadic: false, ret: Ret::Arg(0),
        propagate_null: false, category: "container", description: "Append copies of from's elements to to", eval: copy,
    },
    BuiltinFn {
        name: "copy", params: &[("to", Ty::AnyMap), ("from", Ty::AnyMap)], variadic: false, ret: Ret::Arg(0),
        propagate_null: false, category: "container", description: "Put copies of from's entries into to", eval: copy,
    },
    // ── Misc ────────────────────────────────────────────────────
    BuiltinFn {
        name: "isNull", params: &[("x", Ty::Any)], variadic: false, ret: Ret::Ty(Ty::Boolean),
        propagate_null: false, category: "misc", description: "Null test", eval: is_null,
    },
    BuiltinFn {
        name: "nvl", params: &[("x", Ty::Any), ("fallback", Ty::Any)], variadic: false, ret: Ret::Arg(0),
        propagate_null: false, category: "misc", description: "x unless it is null", eval: nvl,
    },
    BuiltinFn {
        name: "nvl2", params: &[("x", Ty::Any), ("if_set", Ty::Any), ("if_null", Ty::Any)], variadic: false,
        ret: Ret::Arg(1), propagate_null: false, category: "misc", description: "Choose by whether x is null", eval: nvl2,
    },
    BuiltinFn {
        name: "iif", params: &[("cond", Ty::Boolean), ("a", Ty::Any), ("b", Ty::Any)], variadic: false,
        ret: Ret::Arg(1), propagate_null: false, category: "misc", description: "a when cond holds, else b", eval: iif,
    },
    BuiltinFn {
        name: "printLog", params: &[("level", Ty::String), ("message", Ty::Any)], variadic: false,
        ret: Ret::Ty(Ty::Void), propagate_null: false, category: "misc",
        description: "Log at trace, debug, info, warn or error", eval: print_log,
    },
    BuiltinFn {
        name: "printErr", params: &[("message", Ty::Any)], variadic: false, ret: Ret::Ty(Ty::Void),
        propagate_null: false, category: "misc", description: "Log at error level", eval: print_err,
    },
    BuiltinFn {
        name: "raiseError", params: &[("message", Ty::String)], variadic: false, ret: Ret::Ty(Ty::Void),
        propagate_null: false, category: "misc", description: "Abort with a user error", eval: raise_error,
    },
    // ── Records ─────────────────────────────────────────────────
    BuiltinFn {
        name: "getNumFields", params: &[("r", Ty::AnyRecord)], variadic: false, ret: Ret::Ty(Ty::Integer),
        propagate_null: false, category: "record", description: "Number of fields", eval: num_fields,
    },
    BuiltinFn {
        name: "getFieldName", params: &[("r", Ty::AnyRecord), ("index", Ty::Integer)], variadic: false,
        ret: Ret::Ty(Ty::String), propagate_null: false, category: "record", description: "Name of field index", eval: field_name,
    },
    BuiltinFn {
        name: "getFieldLabel", params: &[("r", Ty::AnyRecord), ("index", Ty::Integer)], variadic: false,
        ret: Ret::Ty(Ty::String), propagate_null: false, category: "record",
        description: "Label of field index, falling back to its name", eval: field_label,
    },
    BuiltinFn {
        name: "getFieldType", params: &[("r", Ty::AnyRecord), ("index", Ty::Integer)], variadic: false,
        ret: Ret::Ty(Ty::String), propagate_null: false, category: "record", description: "Type name of field index", eval: field_type,
    },
    BuiltinFn {
        name: "getFieldIndex", params: &[("r", Ty::AnyRecord), ("name", Ty::String)], variadic: false,
        ret: Ret::Ty(Ty::Integer), propagate_null: false, category: "record",
        description: "Position of the named field, or -1", eval: field_index,
    },
];

// ── Argument helpers ──────────────────────────────────────────────

fn arg(args: &[Value], index: usize) -> Result<&Value, RuntimeError> {
    args.get(index).ok_or_else(|| RuntimeError::User(format!("missing argument {index}")))
}

fn str_arg(args: &[Value], index: usize) -> Result<&str, RuntimeError> {
    arg(args, index)?.as_str()
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, RuntimeError> {
    arg(args, index)?.as_i64()
}

fn count(n: usize) -> Value {
    Value::Integer(i32::try_from(n).unwrap_or(i32::MAX))
}

fn position(n: Option<usize>) -> Value {
    n.map_or(Value::Integer(-1), count)
}

fn conversion(value: &str, target: &str) -> RuntimeError {
    RuntimeError::Conversion { value: value.to_string(), target: target.to_string() }
}

fn regex(pattern: &str) -> Result<Regex, RuntimeError> {
    Regex::new(pattern).map_err(|_| conversion(pattern, "regular expression"))
}

fn clamp_index(n: i64) -> usize {
    usize::try_from(n.max(0)).unwrap_or(usize::MAX)
}

// ── Strings ───────────────────────────────────────────────────────

fn length_string(args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::Null => Ok(Value::Integer(0)),
        v => Ok(count(v.as_str()?.chars().count())),
    }
}

fn length_list(args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::Null => Ok(Value::Integer(0)),
        v => Ok(count(ListView::wrap(v)?.len())),
    }
}

fn length_map(args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::Null => Ok(Value::Integer(0)),
        v => Ok(count(MapView::wrap(v)?.len())),
    }
}

fn upper_case(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::String(str_arg(args, 0)?.to_uppercase()))
}

fn lower_case(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::String(str_arg(args, 0)?.to_lowercase()))
}

fn trim(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::String(str_arg(args, 0)?.trim().to_string()))
}

fn substring(args: &[Value]) -> Result<Value, RuntimeError> {
    let s = str_arg(args, 0)?;
    let from = int_arg(args, 1)?;
    let length = int_arg(args, 2)?;
    let char_count = s.chars().count();
    if from < 0 || clamp_index(from) > char_count || length < 0 {
        return Err(RuntimeError::IndexOutOfBounds {
            index: from,
            len: char_count,
        });
    }
    Ok(Value::String(s.chars().skip(clamp_index(from)).take(clamp_index(length)).collect()))
}

fn left(args: &[Value]) -> Result<Value, RuntimeError> {
    let s = str_arg(args, 0)?;
    Ok(Value::String(s.chars().take(clamp_index(int_arg(args, 1)?)).collect()))
}

fn right(args: &[Value]) -> Result<Value, RuntimeError> {
    let s = str_arg(args, 0)?;
    let n = clamp_index(int_arg(args, 1)?);
    let skip = s.chars().count().saturating_sub(n);
    Ok(Value::String(s.chars().skip(skip).collect()))
}

fn concat(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::String(args.iter().map(ToString::to_string).collect()))
}

fn index_of(args: &[Value]) -> Result<Value, RuntimeError> {
    let s = str_arg(args, 0)?;
    let sub = str_arg(args, 1)?;
    let from = match args.get(2) {
        Some(v) => clamp_index(v.as_i64()?),
        None => 0,
    };
    let Some(start) =
        s.char_indices().map(|(b, _)| b).chain(std::iter::once(s.len())).nth(from)
    else {
        return Ok(Value::Integer(-1));
    };
    let found = s[start..].find(sub).map(|byte| from + s[start..start + byte].chars().count());
    Ok(position(found))
}

fn contains(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(str_arg(args, 0)?.contains(str_arg(args, 1)?)))
}

fn starts_with(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(str_arg(args, 0)?.starts_with(str_arg(args, 1)?)))
}

fn ends_with(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(str_arg(args, 0)?.ends_with(str_arg(args, 1)?)))
}

fn replace(args: &[Value]) -> Result<Value, RuntimeError> {
    let re = regex(str_arg(args, 1)?)?;
    Ok(Value::String(re.replace_all(str_arg(args, 0)?, str_arg(args, 2)?).into_owned()))
}

fn matches_regex(args: &[Value]) -> Result<Value, RuntimeError> {
    let re = regex(&format!("^(?:{})$", str_arg(args, 1)?))?;
    Ok(Value::Boolean(re.is_match(str_arg(args, 0)?)))
}

fn split(args: &[Value]) -> Result<Value, RuntimeError> {
    let re = regex(str_arg(args, 1)?)?;
    let parts = re.split(str_arg(args, 0)?).map(|p| Value::String(p.to_string())).collect();
    Ok(new_list(parts))
}

fn join(args: &[Value]) -> Result<Value, RuntimeError> {
    let sep = match arg(args, 0)? {
        Value::Null => "",
        v => v.as_str()?,
    };
    let items = ListView::wrap(arg(args, 1)?)?.to_vec();
    Ok(Value::String(items.iter().map(ToString::to_string).collect::<Vec<_>>().join(sep)))
}

fn is_empty(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(match arg(args, 0)? {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::List(l) => l.borrow().is_empty(),
        Value::Map(m) => m.borrow().is_empty(),
        other => return Err(RuntimeError::type_mismatch("string, list or map", other.type_name())),
    }))
}

// ── Math ──────────────────────────────────────────────────────────

fn abs(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(match arg(args, 0)? {
        Value::Integer(i) => Value::Integer(i.wrapping_abs()),
        Value::Long(l) => Value::Long(l.wrapping_abs()),
        Value::Number(n) => Value::Number(n.abs()),
        Value::Decimal(d) => Value::Decimal(d.abs()),
        other => return Err(RuntimeError::type_mismatch("number", other.type_name())),
    })
}

fn round(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(match arg(args, 0)? {
        Value::Decimal(d) => {
            Value::Decimal(d.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
        }
        v => Value::Long(v.as_f64()?.round() as i64),
    })
}

fn floor(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(match arg(args, 0)? {
        Value::Decimal(d) => Value::Decimal(d.floor()),
        v => Value::Number(v.as_f64()?.floor()),
    })
}

fn ceil(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(match arg(args, 0)? {
        Value::Decimal(d) => Value::Decimal(d.ceil()),
        v => Value::Number(v.as_f64()?.ceil()),
    })
}

fn sqrt(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(arg(args, 0)?.as_f64()?.sqrt()))
}

fn pow(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Number(arg(args, 0)?.as_f64()?.powf(arg(args, 1)?.as_f64()?)))
}

fn numeric_kind(value: &Value) -> OpKind {
    match value {
        Value::Integer(_) => OpKind::Integer,
        Value::Long(_) => OpKind::Long,
        Value::Number(_) => OpKind::Number,
        Value::Decimal(_) => OpKind::Decimal,
        Value::String(_) => OpKind::String,
        Value::Boolean(_) => OpKind::Boolean,
        Value::Date(_) => OpKind::Date,
        _ => OpKind::Other,
    }
}

fn min(args: &[Value]) -> Result<Value, RuntimeError> {
    let (a, b) = (arg(args, 0)?, arg(args, 1)?);
    let ord = order(a, b, numeric_kind(a))?;
    Ok(if ord == Ordering::Greater { b.clone() } else { a.clone() })
}

fn max(args: &[Value]) -> Result<Value, RuntimeError> {
    let (a, b) = (arg(args, 0)?, arg(args, 1)?);
    let ord = order(a, b, numeric_kind(a))?;
    Ok(if ord == Ordering::Less { b.clone() } else { a.clone() })
}

// ── Conversion ────────────────────────────────────────────────────

fn to_string(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::String(arg(args, 0)?.to_string()))
}

fn str2integer(args: &[Value]) -> Result<Value, RuntimeError> {
    let s = str_arg(args, 0)?;
    s.trim().parse().map(Value::Integer).map_err(|_| conversion(s, "integer"))
}

fn str2long(args: &[Value]) -> Result<Value, RuntimeError> {
    let s = str_arg(args, 0)?;
    s.trim().parse().map(Value::Long).map_err(|_| conversion(s, "long"))
}

fn str2double(args: &[Value]) -> Result<Value, RuntimeError> {
    let s = str_arg(args, 0)?;
    s.trim().parse().map(Value::Number).map_err(|_| conversion(s, "number"))
}

fn str2decimal(args: &[Value]) -> Result<Value, RuntimeError> {
    let s = str_arg(args, 0)?;
    crate::model::decimal::parse(s).map(Value::Decimal).ok_or_else(|| conversion(s, "decimal"))
}

fn str2bool(args: &[Value]) -> Result<Value, RuntimeError> {
    let s = str_arg(args, 0)?;
    crate::model::record::parse_scalar(&CtlType::Boolean, s).ok_or_else(|| conversion(s, "boolean"))
}

/// Translate a `yyyy-MM-dd HH:mm:ss.SSS` style pattern into chrono's
/// strftime syntax. Unrecognised letters pass through unchanged.
pub fn translate_date_pattern(pattern: &str) -> String {
    const TOKENS: [(&str, &str); 10] = [
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("MMM", "%b"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("SSS", "%3f"),
        ("EEE", "%a"),
    ];
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut rest = pattern;
    'outer: while !rest.is_empty() {
        for (token, replacement) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                // `%3f` prints its own leading dot; drop a literal one before it.
                if token == "SSS" && out.ends_with('.') {
                    out.pop();
                    out.push_str("%.3f");
                } else {
                    out.push_str(replacement);
                }
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push('%');
            }
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

fn date2str(args: &[Value]) -> Result<Value, RuntimeError> {
    let date = arg(args, 0)?.as_date()?;
    let pattern = translate_date_pattern(str_arg(args, 1)?);
    Ok(Value::String(date.format(&pattern).to_string()))
}

fn str2date(args: &[Value]) -> Result<Value, RuntimeError> {
    let s = str_arg(args, 0)?;
    let pattern = match args.get(1) {
        Some(p) => Some(translate_date_pattern(p.as_str()?)),
        None => None,
    };
    parse_date(s, pattern.as_deref()).map(Value::Date).ok_or_else(|| conversion(s, "date"))
}

fn date2long(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Long(arg(args, 0)?.as_date()?.timestamp_millis()))
}

fn long2date(args: &[Value]) -> Result<Value, RuntimeError> {
    let ms = int_arg(args, 0)?;
    date_from_millis(ms).map(Value::Date).ok_or_else(|| conversion(&ms.to_string(), "date"))
}

// ── Dates ─────────────────────────────────────────────────────────

fn today(_args: &[Value]) -> Result<Value, RuntimeError> {
    let now = Utc::now().timestamp_millis();
    Ok(date_from_millis(now).map_or(Value::Null, Value::Date))
}

/// Unit names `dateAdd`/`dateDiff` accept, also written as bare identifiers.
pub const DATE_UNITS: &[&str] = &[
    "millisec", "millisecond", "second", "minute", "hour", "day", "week", "month", "year",
];

fn unit_millis(unit: &str) -> Option<i64> {
    Some(match unit {
        "millisec" | "millisecond" => 1,
        "second" => 1_000,
        "minute" => 60_000,
        "hour" => 3_600_000,
        "day" => 86_400_000,
        "week" => 604_800_000,
        _ => return None,
    })
}

fn date_add(args: &[Value]) -> Result<Value, RuntimeError> {
    let date = arg(args, 0)?.as_date()?;
    let amount = int_arg(args, 1)?;
    let unit = str_arg(args, 2)?;
    let overflow = || conversion(&format!("{date} + {amount} {unit}"), "date");
    let shifted = match unit {
        "month" | "year" => {
            let months =
                if unit == "year" { amount.checked_mul(12).ok_or_else(overflow)? } else { amount };
            let step = Months::new(u32::try_from(months.unsigned_abs()).map_err(|_| overflow())?);
            if months >= 0 { date.checked_add_months(step) } else { date.checked_sub_months(step) }
        }
        other => {
            let millis = unit_millis(other).ok_or_else(|| conversion(other, "date unit"))?;
            let delta = amount.checked_mul(millis).ok_or_else(overflow)?;
            date.checked_add_signed(Duration::milliseconds(delta))
        }
    };
    shifted.map(Value::Date).ok_or_else(overflow)
}

fn date_diff(args: &[Value]) -> Result<Value, RuntimeError> {
    let a = arg(args, 0)?.as_date()?;
    let b = arg(args, 1)?.as_date()?;
    let unit = str_arg(args, 2)?;
    let months = |d: chrono::DateTime<Utc>| i64::from(d.year()) * 12 + i64::from(d.month0());
    let diff = match unit {
        "month" => months(a) - months(b),
        "year" => i64::from(a.year() - b.year()),
        other => {
            let millis = unit_millis(other).ok_or_else(|| conversion(other, "date unit"))?;
            (a - b).num_milliseconds() / millis
        }
    };
    Ok(Value::Long(diff))
}

// ── Containers ────────────────────────────────────────────────────

fn append(args: &[Value]) -> Result<Value, RuntimeError> {
    let list = arg(args, 0)?;
    ListView::wrap(list)?.add(arg(args, 1)?.clone());
    Ok(list.clone())
}

fn insert(args: &[Value]) -> Result<Value, RuntimeError> {
    let list = arg(args, 0)?;
    ListView::wrap(list)?.insert(int_arg(args, 1)?, arg(args, 2)?.clone())?;
    Ok(list.clone())
}

fn remove(args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        map @ Value::Map(_) => {
            Ok(MapView::wrap(map)?.remove(arg(args, 1)?)?.unwrap_or(Value::Null))
        }
        list => ListView::wrap(list)?.remove(int_arg(args, 1)?),
    }
}

fn clear(args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        map @ Value::Map(_) => MapView::wrap(map)?.clear(),
        list => ListView::wrap(list)?.clear(),
    }
    Ok(Value::Null)
}

fn poll(args: &[Value]) -> Result<Value, RuntimeError> {
    let list = ListView::wrap(arg(args, 0)?)?;
    if list.is_empty() {
        return Ok(Value::Null);
    }
    list.remove(0)
}

fn pop(args: &[Value]) -> Result<Value, RuntimeError> {
    let list = ListView::wrap(arg(args, 0)?)?;
    let Some(last) = list.len().checked_sub(1) else {
        return Ok(Value::Null);
    };
    list.remove(i64::try_from(last).unwrap_or(i64::MAX))
}

fn contains_key(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(MapView::wrap(arg(args, 0)?)?.contains_key(arg(args, 1)?)?))
}

fn contains_value(args: &[Value]) -> Result<Value, RuntimeError> {
    let needle = arg(args, 1)?;
    Ok(Value::Boolean(match arg(args, 0)? {
        map @ Value::Map(_) => MapView::wrap(map)?.contains_value(needle),
        list => ListView::wrap(list)?
            .to_vec()
            .iter()
            .any(|v| crate::model::value::structural_eq(v, needle)),
    }))
}

fn get_keys(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(new_list(MapView::wrap(arg(args, 0)?)?.keys()))
}

fn get_values(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(new_list(MapView::wrap(arg(args, 0)?)?.values()))
}

fn sort(args: &[Value]) -> Result<Value, RuntimeError> {
    let list = arg(args, 0)?;
    let view = ListView::wrap(list)?;
    let mut items = view.to_vec();
    let kind = items
        .iter()
        .map(numeric_kind)
        .filter(|k| *k != OpKind::Other)
        .max_by_key(|k| match k {
            OpKind::Decimal => 3,
            OpKind::Number => 2,
            OpKind::Long => 1,
            _ => 0,
        })
        .unwrap_or(OpKind::Other);
    items.sort_by(|a, b| match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => order(a, b, kind).unwrap_or(Ordering::Equal),
    });
    view.clear();
    view.extend(items);
    Ok(list.clone())
}

fn reverse(args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
        list => {
            ListView::wrap(list)?.handle().borrow_mut().reverse();
            Ok(list.clone())
        }
    }
}

fn copy(args: &[Value]) -> Result<Value, RuntimeError> {
    let (to, from) = (arg(args, 0)?, arg(args, 1)?);
    match to {
        Value::Map(_) => {
            let target = MapView::wrap(to)?;
            for (k, v) in MapView::wrap(from)?.entries() {
                target.put(&k, v.deep_copy())?;
            }
        }
        _ => {
            let items: Vec<Value> =
                ListView::wrap(from)?.to_vec().iter().map(Value::deep_copy).collect();
            ListView::wrap(to)?.extend(items);
        }
    }
    Ok(to.clone())
}

// ── Misc ──────────────────────────────────────────────────────────

fn is_null(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(arg(args, 0)?.is_null()))
}

fn nvl(args: &[Value]) -> Result<Value, RuntimeError> {
    let x = arg(args, 0)?;
    Ok(if x.is_null() { arg(args, 1)?.clone() } else { x.clone() })
}

fn nvl2(args: &[Value]) -> Result<Value, RuntimeError> {
    let pick = if arg(args, 0)?.is_null() { 2 } else { 1 };
    Ok(arg(args, pick)?.clone())
}

fn iif(args: &[Value]) -> Result<Value, RuntimeError> {
    let pick = if arg(args, 0)?.as_bool()? { 1 } else { 2 };
    Ok(arg(args, pick)?.clone())
}

fn print_log(args: &[Value]) -> Result<Value, RuntimeError> {
    let level = match arg(args, 0)?.as_str().unwrap_or("info").to_ascii_lowercase().as_str() {
        "trace" => log::Level::Trace,
        "debug" => log::Level::Debug,
        "warn" => log::Level::Warn,
        "error" | "fatal" => log::Level::Error,
        _ => log::Level::Info,
    };
    log::log!(target: "ctl", level, "{}", arg(args, 1)?);
    Ok(Value::Null)
}

fn print_err(args: &[Value]) -> Result<Value, RuntimeError> {
    log::error!(target: "ctl", "{}", arg(args, 0)?);
    Ok(Value::Null)
}

fn raise_error(args: &[Value]) -> Result<Value, RuntimeError> {
    let message = match arg(args, 0)? {
        Value::Null => "null".to_string(),
        v => v.as_str()?.to_string(),
    };
    Err(RuntimeError::User(message))
}

// ── Records ───────────────────────────────────────────────────────

fn num_fields(args: &[Value]) -> Result<Value, RuntimeError> {
    match arg(args, 0)? {
        Value::Null => Ok(Value::Integer(0)),
        v => Ok(count(v.as_record()?.borrow().len())),
    }
}

fn field_meta<T>(
    args: &[Value],
    read: impl FnOnce(&crate::model::FieldMetadata) -> T,
) -> Result<T, RuntimeError> {
    let record = arg(args, 0)?.as_record()?.borrow();
    let index = int_arg(args, 1)?;
    let len = record.len();
    usize::try_from(index)
        .ok()
        .and_then(|i| record.metadata().field(i))
        .map(read)
        .ok_or(RuntimeError::IndexOutOfBounds { index, len })
}

fn field_name(args: &[Value]) -> Result<Value, RuntimeError> {
    field_meta(args, |f| Value::String(f.name.clone()))
}

fn field_label(args: &[Value]) -> Result<Value, RuntimeError> {
    field_meta(args, |f| Value::String(f.label.clone().unwrap_or_else(|| f.name.clone())))
}

fn field_type(args: &[Value]) -> Result<Value, RuntimeError> {
    field_meta(args, |f| Value::String(f.ty.to_string()))
}

fn field_index(args: &[Value]) -> Result<Value, RuntimeError> {
    let record = arg(args, 0)?.as_record()?.borrow();
    Ok(position(record.metadata().field_index(str_arg(args, 1)?)))
}
