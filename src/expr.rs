//! Selector expression IR and the builder DSL that produces it.
//!
//! Queries are captured as an immutable tree of predicate nodes and only
//! rendered to Mango JSON at compile time. The tree is structurally
//! comparable; a canonical 128-bit fingerprint (commutative `and`/`or`
//! children sorted) keys the translation cache.

use serde_json::Value;

/// One step in a field path: a named member or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Member(String),
    Index(u32),
}

/// A member access chain, as written in the query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parse a dotted member chain: `"address.city"`.
    pub fn parse(dotted: &str) -> Self {
        let segments = dotted
            .split('.')
            .filter(|s| !s.is_empty())
            .map(|s| Segment::Member(s.to_string()))
            .collect();
        Self { segments }
    }

    /// The empty path: the array element itself inside an
    /// `$elemMatch`/`$allMatch` predicate.
    pub fn element() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn push_member(&mut self, name: impl Into<String>) {
        self.segments.push(Segment::Member(name.into()));
    }

    pub fn push_index(&mut self, index: u32) {
        self.segments.push(Segment::Index(index));
    }

    fn absorb(&self, h: &mut Fnv128) {
        for segment in &self.segments {
            match segment {
                Segment::Member(name) => {
                    h.write(name.as_bytes());
                    h.write(&[0xff]);
                }
                Segment::Index(i) => {
                    h.write(&[0xfe]);
                    h.write(&i.to_le_bytes());
                }
            }
        }
    }
}

/// Comparison operator in a `Cmp` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// The comparison equivalent to `not(self)`.
    pub fn inverse(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }

    pub(crate) fn mango_op(self) -> &'static str {
        match self {
            CmpOp::Eq => "$eq",
            CmpOp::Ne => "$ne",
            CmpOp::Lt => "$lt",
            CmpOp::Le => "$lte",
            CmpOp::Gt => "$gt",
            CmpOp::Ge => "$gte",
        }
    }
}

/// JSON type names accepted by `$type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

impl JsonKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JsonKind::Null => "null",
            JsonKind::Boolean => "boolean",
            JsonKind::Number => "number",
            JsonKind::String => "string",
            JsonKind::Array => "array",
            JsonKind::Object => "object",
        }
    }
}

/// A selector predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// A constant predicate. `Const(true)` matches everything and is
    /// produced by constant folding; the translator renders it as `{}`.
    Const(Value),
    Cmp {
        op: CmpOp,
        field: FieldPath,
        value: Value,
    },
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Not(Box<Selector>),
    In {
        field: FieldPath,
        values: Vec<Value>,
    },
    NotIn {
        field: FieldPath,
        values: Vec<Value>,
    },
    Exists {
        field: FieldPath,
        present: bool,
    },
    TypeIs {
        field: FieldPath,
        kind: JsonKind,
    },
    Regex {
        field: FieldPath,
        pattern: String,
    },
    /// Any element of the array field matches the predicate (`$elemMatch`).
    ElemMatch {
        field: FieldPath,
        predicate: Box<Selector>,
    },
    /// Every element of the array field matches the predicate (`$allMatch`).
    AllMatch {
        field: FieldPath,
        predicate: Box<Selector>,
    },
}

impl Selector {
    pub fn and(self, other: Selector) -> Selector {
        Selector::And(vec![self, other])
    }

    pub fn or(self, other: Selector) -> Selector {
        Selector::Or(vec![self, other])
    }

    pub fn negate(self) -> Selector {
        Selector::Not(Box::new(self))
    }

    /// Canonical 128-bit structural fingerprint.
    ///
    /// Post-order walk; `And`/`Or` absorb their children in sorted
    /// fingerprint order, so commutatively-equal trees hash identically.
    pub fn fingerprint(&self) -> u128 {
        let mut h = Fnv128::new();
        self.absorb(&mut h);
        h.finish()
    }

    fn absorb(&self, h: &mut Fnv128) {
        match self {
            Selector::Const(v) => {
                h.write(&[0x01]);
                absorb_value(h, v);
            }
            Selector::Cmp { op, field, value } => {
                h.write(&[0x02, *op as u8]);
                field.absorb(h);
                absorb_value(h, value);
            }
            Selector::And(children) | Selector::Or(children) => {
                h.write(&[if matches!(self, Selector::And(_)) { 0x03 } else { 0x04 }]);
                let mut prints: Vec<u128> = children.iter().map(|c| c.fingerprint()).collect();
                prints.sort_unstable();
                for p in prints {
                    h.write(&p.to_le_bytes());
                }
            }
            Selector::Not(inner) => {
                h.write(&[0x05]);
                inner.absorb(h);
            }
            Selector::In { field, values } | Selector::NotIn { field, values } => {
                h.write(&[if matches!(self, Selector::In { .. }) { 0x06 } else { 0x07 }]);
                field.absorb(h);
                for v in values {
                    absorb_value(h, v);
                }
            }
            Selector::Exists { field, present } => {
                h.write(&[0x08, *present as u8]);
                field.absorb(h);
            }
            Selector::TypeIs { field, kind } => {
                h.write(&[0x09]);
                field.absorb(h);
                h.write(kind.as_str().as_bytes());
            }
            Selector::Regex { field, pattern } => {
                h.write(&[0x0a]);
                field.absorb(h);
                h.write(pattern.as_bytes());
            }
            Selector::ElemMatch { field, predicate } | Selector::AllMatch { field, predicate } => {
                h.write(&[if matches!(self, Selector::ElemMatch { .. }) {
                    0x0b
                } else {
                    0x0c
                }]);
                field.absorb(h);
                predicate.absorb(h);
            }
        }
    }
}

fn absorb_value(h: &mut Fnv128, v: &Value) {
    // serde_json renders numbers and key order canonically for a given
    // Value, which is all the fingerprint needs.
    h.write(v.to_string().as_bytes());
    h.write(&[0xfd]);
}

/// 128-bit FNV-1a, the width the translation cache keys on.
pub(crate) struct Fnv128 {
    state: u128,
}

const FNV128_OFFSET: u128 = 0x6c62272e07bb014262b821756295c58d;
const FNV128_PRIME: u128 = 0x0000000001000000000000000000013b;

impl Fnv128 {
    pub(crate) fn new() -> Self {
        Self {
            state: FNV128_OFFSET,
        }
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state ^= b as u128;
            self.state = self.state.wrapping_mul(FNV128_PRIME);
        }
    }

    pub(crate) fn finish(&self) -> u128 {
        self.state
    }
}

/// Field expression builder for fluent predicate construction.
#[derive(Debug, Clone)]
pub struct FieldExpr {
    path: FieldPath,
}

impl FieldExpr {
    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Append a member segment: `field("tags").index(0).member("label")`.
    pub fn member(mut self, name: impl Into<String>) -> Self {
        self.path.push_member(name);
        self
    }

    /// Append an array index segment.
    pub fn index(mut self, index: u32) -> Self {
        self.path.push_index(index);
        self
    }

    pub fn eq(self, value: impl Into<Value>) -> Selector {
        self.cmp(CmpOp::Eq, value)
    }

    pub fn ne(self, value: impl Into<Value>) -> Selector {
        self.cmp(CmpOp::Ne, value)
    }

    pub fn lt(self, value: impl Into<Value>) -> Selector {
        self.cmp(CmpOp::Lt, value)
    }

    pub fn lte(self, value: impl Into<Value>) -> Selector {
        self.cmp(CmpOp::Le, value)
    }

    pub fn gt(self, value: impl Into<Value>) -> Selector {
        self.cmp(CmpOp::Gt, value)
    }

    pub fn gte(self, value: impl Into<Value>) -> Selector {
        self.cmp(CmpOp::Ge, value)
    }

    pub fn is_in(self, values: Vec<Value>) -> Selector {
        Selector::In {
            field: self.path,
            values,
        }
    }

    pub fn not_in(self, values: Vec<Value>) -> Selector {
        Selector::NotIn {
            field: self.path,
            values,
        }
    }

    pub fn exists(self, present: bool) -> Selector {
        Selector::Exists {
            field: self.path,
            present,
        }
    }

    pub fn type_is(self, kind: JsonKind) -> Selector {
        Selector::TypeIs {
            field: self.path,
            kind,
        }
    }

    pub fn matches(self, pattern: impl Into<String>) -> Selector {
        Selector::Regex {
            field: self.path,
            pattern: pattern.into(),
        }
    }

    /// At least one array element satisfies the predicate.
    pub fn any(self, predicate: Selector) -> Selector {
        Selector::ElemMatch {
            field: self.path,
            predicate: Box::new(predicate),
        }
    }

    /// Every array element satisfies the predicate.
    pub fn all(self, predicate: Selector) -> Selector {
        Selector::AllMatch {
            field: self.path,
            predicate: Box::new(predicate),
        }
    }

    fn cmp(self, op: CmpOp, value: impl Into<Value>) -> Selector {
        Selector::Cmp {
            op,
            field: self.path,
            value: value.into(),
        }
    }
}

/// Start a field expression. Dots split into a member chain.
pub fn field(dotted: &str) -> FieldExpr {
    FieldExpr {
        path: FieldPath::parse(dotted),
    }
}

/// The array element itself, for `any`/`all` predicates:
/// `field("friends").any(elem().eq("Leia"))`.
pub fn elem() -> FieldExpr {
    FieldExpr {
        path: FieldPath::element(),
    }
}

/// Combine selectors with AND.
pub fn and(selectors: Vec<Selector>) -> Selector {
    Selector::And(selectors)
}

/// Combine selectors with OR.
pub fn or(selectors: Vec<Selector>) -> Selector {
    Selector::Or(selectors)
}

/// Negate a selector.
pub fn not(selector: Selector) -> Selector {
    selector.negate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_field_splits_into_members() {
        let f = field("address.city");
        assert_eq!(
            f.path().segments(),
            &[
                Segment::Member("address".to_string()),
                Segment::Member("city".to_string())
            ]
        );
    }

    #[test]
    fn builder_produces_cmp_nodes() {
        let sel = field("age").gte(18);
        assert_eq!(
            sel,
            Selector::Cmp {
                op: CmpOp::Ge,
                field: FieldPath::parse("age"),
                value: json!(18),
            }
        );
    }

    #[test]
    fn and_is_commutative_under_fingerprint() {
        let a = field("age").gte(18).and(field("name").eq("Luke"));
        let b = field("name").eq("Luke").and(field("age").gte(18));
        assert_eq!(a.fingerprint(), b.fingerprint());
        // Shape still differs structurally.
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_ops_and_values() {
        let base = field("age").gte(18).fingerprint();
        assert_ne!(base, field("age").gt(18).fingerprint());
        assert_ne!(base, field("age").gte(19).fingerprint());
        assert_ne!(base, field("years").gte(18).fingerprint());
        assert_eq!(base, field("age").gte(18).fingerprint());
    }

    #[test]
    fn elem_match_vs_all_match_differ() {
        let any = field("friends").any(elem().eq("Leia"));
        let all = field("friends").all(elem().eq("Leia"));
        assert_ne!(any.fingerprint(), all.fingerprint());
    }

    #[test]
    fn cmp_inverse_round_trips() {
        for op in [CmpOp::Eq, CmpOp::Ne, CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge] {
            assert_eq!(op.inverse().inverse(), op);
        }
    }
}
