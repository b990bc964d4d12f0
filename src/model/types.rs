use std::fmt;
use std::sync::Arc;

use super::record::RecordMetadata;

/// Static type of a CTL expression, variable or field.
#[derive(Debug, Clone, PartialEq)]
pub enum CtlType {
    Void,
    /// Type of the `null` literal; assignable to everything.
    Null,
    Integer,
    Long,
    Number,
    Decimal,
    String,
    Boolean,
    Date,
    List(Box<CtlType>),
    Map(Box<CtlType>, Box<CtlType>),
    Record(Arc<RecordMetadata>),
    /// Generic type variable used by builtin signatures.
    Any,
    /// Produced after a reported error so one mistake does not cascade.
    Unknown,
}

/// Copyable operand class carried by bytecode instructions and used to
/// dispatch arithmetic without re-inspecting full types at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Integer,
    Long,
    Number,
    Decimal,
    String,
    Boolean,
    Date,
    Other,
}

/// Distance assigned to a parameter that is a generic type variable.
pub const GENERIC_DISTANCE: u32 = 10;

impl CtlType {
    pub fn list_of(elem: CtlType) -> Self {
        CtlType::List(Box::new(elem))
    }

    pub fn map_of(key: CtlType, value: CtlType) -> Self {
        CtlType::Map(Box::new(key), Box::new(value))
    }

    /// Position in the numeric lattice `integer < long < number < decimal`.
    pub fn numeric_rank(&self) -> Option<u8> {
        match self {
            CtlType::Integer => Some(0),
            CtlType::Long => Some(1),
            CtlType::Number => Some(2),
            CtlType::Decimal => Some(3),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.numeric_rank().is_some()
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            CtlType::Integer
                | CtlType::Long
                | CtlType::Number
                | CtlType::Decimal
                | CtlType::String
                | CtlType::Boolean
                | CtlType::Date
        )
    }

    pub fn is_record(&self) -> bool {
        matches!(self, CtlType::Record(_))
    }

    /// True for the error-recovery and null types, which unify with anything.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, CtlType::Unknown | CtlType::Null)
    }

    pub fn op_kind(&self) -> OpKind {
        match self {
            CtlType::Integer => OpKind::Integer,
            CtlType::Long => OpKind::Long,
            CtlType::Number => OpKind::Number,
            CtlType::Decimal => OpKind::Decimal,
            CtlType::String => OpKind::String,
            CtlType::Boolean => OpKind::Boolean,
            CtlType::Date => OpKind::Date,
            _ => OpKind::Other,
        }
    }

    /// Element type when iterated by `foreach`. Maps iterate their values.
    pub fn element_type(&self) -> Option<&CtlType> {
        match self {
            CtlType::List(elem) => Some(elem),
            CtlType::Map(_, value) => Some(value),
            _ => None,
        }
    }
}

/// Promote two numeric types to the wider of the pair.
///
/// Returns `None` when either operand is not numeric.
pub fn promote(a: &CtlType, b: &CtlType) -> Option<CtlType> {
    let ra = a.numeric_rank()?;
    let rb = b.numeric_rank()?;
    Some(if ra >= rb { a.clone() } else { b.clone() })
}

/// Conversion cost from an argument type to a parameter type.
///
/// `None` means no implicit conversion exists. Overload resolution sums the
/// distances of every argument and picks the unique minimum.
pub fn distance(from: &CtlType, to: &CtlType) -> Option<u32> {
    if from == to || from.is_wildcard() {
        return Some(0);
    }
    match (from, to) {
        (_, CtlType::Any) => Some(GENERIC_DISTANCE),
        (_, CtlType::Unknown) => Some(0),
        (CtlType::List(a), CtlType::List(b)) => match b.as_ref() {
            CtlType::Any => Some(GENERIC_DISTANCE),
            _ if a.is_wildcard() => Some(0),
            _ => None,
        },
        (CtlType::Map(ka, va), CtlType::Map(kb, vb)) => {
            let key = match kb.as_ref() {
                CtlType::Any => GENERIC_DISTANCE,
                _ if ka == kb || ka.is_wildcard() => 0,
                _ => return None,
            };
            let value = match vb.as_ref() {
                CtlType::Any => GENERIC_DISTANCE,
                _ if va == vb || va.is_wildcard() => 0,
                _ => return None,
            };
            Some(key.max(value))
        }
        _ => {
            let rf = from.numeric_rank()?;
            let rt = to.numeric_rank()?;
            (rf <= rt).then(|| u32::from(rt - rf))
        }
    }
}

/// True when a value of type `value` may be stored into a slot of type
/// `target` without an explicit conversion (identity or numeric widening).
pub fn is_assignable(target: &CtlType, value: &CtlType) -> bool {
    if target.is_wildcard() || *target == CtlType::Any {
        return true;
    }
    match (target, value) {
        // Empty list/map literals take the element type of their target.
        (CtlType::List(_), CtlType::List(elem)) if elem.is_wildcard() => true,
        (CtlType::Map(..), CtlType::Map(k, v)) if k.is_wildcard() && v.is_wildcard() => true,
        (CtlType::Record(a), CtlType::Record(b)) => a.name() == b.name(),
        _ => matches!(distance(value, target), Some(d) if d < GENERIC_DISTANCE),
    }
}

impl fmt::Display for CtlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtlType::Void => write!(f, "void"),
            CtlType::Null => write!(f, "null"),
            CtlType::Integer => write!(f, "integer"),
            CtlType::Long => write!(f, "long"),
            CtlType::Number => write!(f, "number"),
            CtlType::Decimal => write!(f, "decimal"),
            CtlType::String => write!(f, "string"),
            CtlType::Boolean => write!(f, "boolean"),
            CtlType::Date => write!(f, "date"),
            CtlType::List(elem) => write!(f, "{elem}[]"),
            CtlType::Map(k, v) => write!(f, "map[{k}, {v}]"),
            CtlType::Record(meta) => write!(f, "{}", meta.name()),
            CtlType::Any => write!(f, "<any>"),
            CtlType::Unknown => write!(f, "<unknown>"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const NUMERIC: [CtlType; 4] =
        [CtlType::Integer, CtlType::Long, CtlType::Number, CtlType::Decimal];

    #[test]
    fn integer_with_long_promotes_to_long() {
        assert_eq!(promote(&CtlType::Integer, &CtlType::Long), Some(CtlType::Long));
        assert_eq!(promote(&CtlType::Long, &CtlType::Integer), Some(CtlType::Long));
    }

    #[test]
    fn decimal_absorbs_every_numeric() {
        for t in &NUMERIC {
            assert_eq!(promote(t, &CtlType::Decimal), Some(CtlType::Decimal));
            assert_eq!(promote(&CtlType::Decimal, t), Some(CtlType::Decimal));
        }
    }

    #[test]
    fn promotion_is_commutative() {
        for a in &NUMERIC {
            for b in &NUMERIC {
                assert_eq!(promote(a, b), promote(b, a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn non_numeric_does_not_promote() {
        assert_eq!(promote(&CtlType::String, &CtlType::Integer), None);
        assert_eq!(promote(&CtlType::Boolean, &CtlType::Boolean), None);
    }

    #[test]
    fn distance_table() {
        assert_eq!(distance(&CtlType::Integer, &CtlType::Integer), Some(0));
        assert_eq!(distance(&CtlType::Integer, &CtlType::Long), Some(1));
        assert_eq!(distance(&CtlType::Integer, &CtlType::Number), Some(2));
        assert_eq!(distance(&CtlType::Integer, &CtlType::Decimal), Some(3));
        assert_eq!(distance(&CtlType::Number, &CtlType::Decimal), Some(1));
        assert_eq!(distance(&CtlType::Long, &CtlType::Integer), None);
        assert_eq!(distance(&CtlType::Null, &CtlType::Date), Some(0));
        assert_eq!(distance(&CtlType::String, &CtlType::Any), Some(GENERIC_DISTANCE));
        assert_eq!(distance(&CtlType::String, &CtlType::Integer), None);
    }

    #[test]
    fn list_distance_respects_generic_element() {
        let ints = CtlType::list_of(CtlType::Integer);
        assert_eq!(distance(&ints, &CtlType::list_of(CtlType::Any)), Some(GENERIC_DISTANCE));
        assert_eq!(distance(&ints, &ints.clone()), Some(0));
        assert_eq!(distance(&ints, &CtlType::list_of(CtlType::String)), None);
    }

    #[test]
    fn assignability_allows_widening_only() {
        assert!(is_assignable(&CtlType::Long, &CtlType::Integer));
        assert!(!is_assignable(&CtlType::Integer, &CtlType::Long));
        assert!(is_assignable(&CtlType::String, &CtlType::Null));
        assert!(is_assignable(
            &CtlType::list_of(CtlType::String),
            &CtlType::list_of(CtlType::Unknown)
        ));
    }

    #[test]
    fn display_names() {
        assert_eq!(CtlType::list_of(CtlType::Integer).to_string(), "integer[]");
        assert_eq!(
            CtlType::map_of(CtlType::String, CtlType::Decimal).to_string(),
            "map[string, decimal]"
        );
    }
}
