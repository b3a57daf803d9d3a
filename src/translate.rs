//! Rendering of optimized query plans into Mango JSON.
//!
//! The translator is deterministic: maps are insertion-ordered
//! (`serde_json/preserve_order`), clauses are emitted in IR order, and the
//! top-level key order is fixed by the `MangoQuery` field order. The same
//! plan always serializes to byte-identical JSON.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::expr::Selector;
use crate::naming::PropertyPolicy;
use crate::optimize::QueryPlan;
use crate::query::{Direction, IndexRef};

/// The `_find` request body. Field order is the wire key order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MangoQuery {
    pub selector: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_index: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable: Option<bool>,
}

impl MangoQuery {
    /// The serialized request body.
    pub fn to_body(&self) -> String {
        // A struct of plain JSON values cannot fail to serialize.
        serde_json::to_string(self).expect("MangoQuery serialization")
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("MangoQuery serialization")
    }
}

/// Render a plan into the request body.
pub fn translate(plan: &QueryPlan, policy: &PropertyPolicy) -> Result<MangoQuery> {
    let selector = match &plan.selector {
        Some(sel) => selector_value(sel, policy)?,
        None => Value::Object(Map::new()),
    };

    let sort = match &plan.sort {
        Some((direction, fields)) => {
            let mut entries = Vec::with_capacity(fields.len());
            for f in fields {
                let name = policy
                    .resolve(f)
                    .ok_or_else(|| Error::UnsupportedQuery("cannot sort by the array element".to_string()))?;
                entries.push(match direction {
                    Direction::Asc => Value::String(name),
                    Direction::Desc => json!({ name: "desc" }),
                });
            }
            Some(entries)
        }
        None => None,
    };

    let fields = match &plan.fields {
        Some(paths) => {
            let mut names = Vec::with_capacity(paths.len());
            for p in paths {
                names.push(policy.resolve(p).ok_or_else(|| {
                    Error::UnsupportedQuery("Select must project fields".to_string())
                })?);
            }
            Some(names)
        }
        None => None,
    };

    let use_index = plan.use_index.as_ref().map(|i| match i {
        IndexRef::DesignDoc(ddoc) => Value::String(ddoc.clone()),
        IndexRef::DesignDocAndName(ddoc, name) => json!([ddoc, name]),
    });

    Ok(MangoQuery {
        selector,
        sort,
        fields,
        skip: plan.skip,
        limit: plan.limit,
        bookmark: plan.bookmark.clone(),
        use_index,
        r: plan.r,
        update: plan.update,
        stable: plan.stable,
    })
}

/// Render a selector tree alone. Also used by the changes-feed `_selector`
/// filter, which shares the translation and its failure mode.
pub fn selector_value(selector: &Selector, policy: &PropertyPolicy) -> Result<Value> {
    match selector {
        Selector::Const(Value::Bool(true)) => Ok(Value::Object(Map::new())),
        // Matches no document; every document has an _id.
        Selector::Const(Value::Bool(false)) => Ok(json!({"_id": {"$exists": false}})),
        Selector::Const(other) => Err(Error::UnsupportedQuery(format!(
            "selector must be a boolean expression, got constant {}",
            other
        ))),
        Selector::Cmp { op, field, value } => {
            Ok(wrap(policy.resolve(field), json!({ (op.mango_op()): value })))
        }
        Selector::And(children) => {
            let clauses = children
                .iter()
                .map(|c| selector_value(c, policy))
                .collect::<Result<Vec<_>>>()?;
            Ok(merge_and(clauses))
        }
        Selector::Or(children) => {
            let clauses = children
                .iter()
                .map(|c| selector_value(c, policy))
                .collect::<Result<Vec<_>>>()?;
            Ok(json!({ "$or": clauses }))
        }
        Selector::Not(inner) => {
            let clause = selector_value(inner, policy)?;
            Ok(json!({ "$not": clause }))
        }
        Selector::In { field, values } => {
            Ok(wrap(policy.resolve(field), json!({ "$in": values })))
        }
        Selector::NotIn { field, values } => {
            Ok(wrap(policy.resolve(field), json!({ "$nin": values })))
        }
        Selector::Exists { field, present } => {
            Ok(wrap(policy.resolve(field), json!({ "$exists": present })))
        }
        Selector::TypeIs { field, kind } => {
            Ok(wrap(policy.resolve(field), json!({ "$type": kind.as_str() })))
        }
        Selector::Regex { field, pattern } => {
            Ok(wrap(policy.resolve(field), json!({ "$regex": pattern })))
        }
        Selector::ElemMatch { field, predicate } => {
            let inner = selector_value(predicate, policy)?;
            let name = policy.resolve(field).ok_or_else(|| {
                Error::UnsupportedQuery("$elemMatch requires a named array field".to_string())
            })?;
            Ok(json!({ name: { "$elemMatch": inner } }))
        }
        Selector::AllMatch { field, predicate } => {
            let inner = selector_value(predicate, policy)?;
            let name = policy.resolve(field).ok_or_else(|| {
                Error::UnsupportedQuery("$allMatch requires a named array field".to_string())
            })?;
            Ok(json!({ name: { "$allMatch": inner } }))
        }
    }
}

/// `{field: clause}` for a named path, or the bare operator object for the
/// array-element marker inside `$elemMatch`/`$allMatch`.
fn wrap(resolved: Option<String>, clause: Value) -> Value {
    match resolved {
        Some(name) => json!({ name: clause }),
        None => clause,
    }
}

/// Merge AND clauses into a single object when every clause keys a distinct
/// field; fall back to `$and` otherwise (operator keys, duplicate fields).
fn merge_and(clauses: Vec<Value>) -> Value {
    let mut merged = Map::new();
    for clause in &clauses {
        let obj = match clause.as_object() {
            Some(obj) if obj.len() == 1 => obj,
            _ => return json!({ "$and": clauses }),
        };
        let (key, value) = obj.iter().next().unwrap();
        if key.starts_with('$') || merged.contains_key(key) {
            return json!({ "$and": clauses });
        }
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{elem, field, not, JsonKind, Selector};
    use crate::optimize::{optimize, plan};
    use crate::query::PipelineOp;

    fn render(selector: Selector) -> String {
        let policy = PropertyPolicy::default();
        selector_value(&optimize(selector), &policy)
            .unwrap()
            .to_string()
    }

    #[test]
    fn eq_uses_explicit_operator_form() {
        assert_eq!(render(field("name").eq("Luke")), r#"{"name":{"$eq":"Luke"}}"#);
    }

    #[test]
    fn and_over_distinct_fields_merges() {
        let sel = field("name").eq("Luke").and(field("age").eq(19));
        assert_eq!(
            render(sel),
            r#"{"name":{"$eq":"Luke"},"age":{"$eq":19}}"#
        );
    }

    #[test]
    fn and_with_duplicate_field_keeps_and_array() {
        let sel = field("age").gte(18).and(field("age").lt(65));
        assert_eq!(
            render(sel),
            r#"{"$and":[{"age":{"$gte":18}},{"age":{"$lt":65}}]}"#
        );
    }

    #[test]
    fn or_is_always_an_array() {
        let sel = field("a").eq(1).or(field("b").eq(2));
        assert_eq!(
            render(sel),
            r#"{"$or":[{"a":{"$eq":1}},{"b":{"$eq":2}}]}"#
        );
    }

    #[test]
    fn any_maps_to_elem_match() {
        let sel = field("friends").any(elem().eq("Leia"));
        assert_eq!(
            render(sel),
            r#"{"friends":{"$elemMatch":{"$eq":"Leia"}}}"#
        );
    }

    #[test]
    fn all_maps_to_all_match() {
        let sel = field("friends").all(elem().ne("Vader"));
        assert_eq!(
            render(sel),
            r#"{"friends":{"$allMatch":{"$ne":"Vader"}}}"#
        );
    }

    #[test]
    fn membership_existence_type_regex() {
        assert_eq!(
            render(field("rank").is_in(vec![serde_json::json!(1), serde_json::json!(2)])),
            r#"{"rank":{"$in":[1,2]}}"#
        );
        assert_eq!(
            render(field("rank").not_in(vec![serde_json::json!(3)])),
            r#"{"rank":{"$nin":[3]}}"#
        );
        assert_eq!(render(field("rev").exists(true)), r#"{"rev":{"$exists":true}}"#);
        assert_eq!(
            render(field("age").type_is(JsonKind::Number)),
            r#"{"age":{"$type":"number"}}"#
        );
        assert_eq!(
            render(field("name").matches("^Lu")),
            r#"{"name":{"$regex":"^Lu"}}"#
        );
    }

    #[test]
    fn residual_not_renders_as_operator() {
        assert_eq!(
            render(not(field("name").matches("^L"))),
            r#"{"$not":{"name":{"$regex":"^L"}}}"#
        );
    }

    #[test]
    fn null_equality_stays_an_equality() {
        assert_eq!(
            render(field("middle_name").eq(serde_json::json!(null))),
            r#"{"middle_name":{"$eq":null}}"#
        );
    }

    #[test]
    fn skip_take_map_to_skip_limit() {
        let ops = vec![PipelineOp::Skip(10), PipelineOp::Take(5)];
        let policy = PropertyPolicy::default();
        let query = translate(&plan(&ops).unwrap(), &policy).unwrap();
        assert_eq!(query.to_body(), r#"{"selector":{},"skip":10,"limit":5}"#);
    }

    #[test]
    fn sort_and_fields_render() {
        let ops = vec![
            PipelineOp::OrderBy(crate::expr::FieldPath::parse("age")),
            PipelineOp::ThenBy(crate::expr::FieldPath::parse("name")),
            PipelineOp::Select(vec![
                crate::expr::FieldPath::parse("name"),
                crate::expr::FieldPath::parse("age"),
            ]),
        ];
        let policy = PropertyPolicy::default();
        let query = translate(&plan(&ops).unwrap(), &policy).unwrap();
        assert_eq!(
            query.to_body(),
            r#"{"selector":{},"sort":["age","name"],"fields":["name","age"]}"#
        );
    }

    #[test]
    fn descending_sort_renders_objects() {
        let ops = vec![
            PipelineOp::OrderByDesc(crate::expr::FieldPath::parse("age")),
            PipelineOp::ThenByDesc(crate::expr::FieldPath::parse("name")),
        ];
        let policy = PropertyPolicy::default();
        let query = translate(&plan(&ops).unwrap(), &policy).unwrap();
        assert_eq!(
            query.to_body(),
            r#"{"selector":{},"sort":[{"age":"desc"},{"name":"desc"}]}"#
        );
    }

    #[test]
    fn use_index_forms() {
        let ops = vec![PipelineOp::UseIndex(IndexRef::DesignDocAndName(
            "people".to_string(),
            "by-age".to_string(),
        ))];
        let policy = PropertyPolicy::default();
        let query = translate(&plan(&ops).unwrap(), &policy).unwrap();
        assert_eq!(
            query.to_body(),
            r#"{"selector":{},"use_index":["people","by-age"]}"#
        );
    }

    #[test]
    fn translation_is_deterministic() {
        let build = || {
            let ops = vec![
                PipelineOp::Where(field("name").eq("Luke").and(field("age").eq(19))),
                PipelineOp::OrderBy(crate::expr::FieldPath::parse("age")),
                PipelineOp::Take(5),
            ];
            let policy = PropertyPolicy::default();
            translate(&plan(&ops).unwrap(), &policy).unwrap().to_body()
        };
        assert_eq!(build(), build());
    }
}
