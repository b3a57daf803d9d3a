//! Selector and pipeline normalization.
//!
//! Rewrites run before translation so the translator only ever sees
//! canonical trees: negations pushed into comparisons, `and`/`or` flattened
//! n-ary, constants folded, tautological pipeline terms dropped.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::expr::{FieldPath, Selector};
use crate::query::{Direction, IndexRef, PipelineOp};

/// The normalized form of a captured pipeline, ready for translation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryPlan {
    pub selector: Option<Selector>,
    pub sort: Option<(Direction, Vec<FieldPath>)>,
    pub fields: Option<Vec<FieldPath>>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub bookmark: Option<String>,
    pub use_index: Option<IndexRef>,
    pub r: Option<u32>,
    pub update: Option<bool>,
    pub stable: Option<bool>,
}

/// Rewrite a selector to its fixed point.
pub fn optimize(selector: Selector) -> Selector {
    let mut current = selector;
    loop {
        let next = simplify(current.clone());
        if next == current {
            return next;
        }
        current = next;
    }
}

fn simplify(selector: Selector) -> Selector {
    match selector {
        Selector::Not(inner) => simplify_not(*inner),
        Selector::And(children) => {
            let mut flat = Vec::new();
            for child in children {
                match simplify(child) {
                    // Nested conjunctions flatten n-ary.
                    Selector::And(grand) => flat.extend(grand),
                    Selector::Const(Value::Bool(true)) => {}
                    Selector::Const(Value::Bool(false)) => {
                        return Selector::Const(Value::Bool(false))
                    }
                    other => flat.push(other),
                }
            }
            match flat.len() {
                0 => Selector::Const(Value::Bool(true)),
                1 => flat.into_iter().next().unwrap(),
                _ => Selector::And(flat),
            }
        }
        Selector::Or(children) => {
            let mut flat = Vec::new();
            for child in children {
                match simplify(child) {
                    Selector::Or(grand) => flat.extend(grand),
                    Selector::Const(Value::Bool(false)) => {}
                    Selector::Const(Value::Bool(true)) => {
                        return Selector::Const(Value::Bool(true))
                    }
                    other => flat.push(other),
                }
            }
            match flat.len() {
                0 => Selector::Const(Value::Bool(false)),
                1 => flat.into_iter().next().unwrap(),
                _ => Selector::Or(flat),
            }
        }
        Selector::ElemMatch { field, predicate } => Selector::ElemMatch {
            field,
            predicate: Box::new(simplify(*predicate)),
        },
        Selector::AllMatch { field, predicate } => Selector::AllMatch {
            field,
            predicate: Box::new(simplify(*predicate)),
        },
        other => other,
    }
}

fn simplify_not(inner: Selector) -> Selector {
    match inner {
        // not(not(x)) -> x
        Selector::Not(x) => simplify(*x),
        // De Morgan.
        Selector::And(children) => simplify(Selector::Or(
            children.into_iter().map(Selector::negate).collect(),
        )),
        Selector::Or(children) => simplify(Selector::And(
            children.into_iter().map(Selector::negate).collect(),
        )),
        // not(eq) -> ne and friends. eq(field, null) stays an equality
        // either way; negation never turns it into an existence test.
        Selector::Cmp { op, field, value } => Selector::Cmp {
            op: op.inverse(),
            field,
            value,
        },
        Selector::In { field, values } => Selector::NotIn { field, values },
        Selector::NotIn { field, values } => Selector::In { field, values },
        Selector::Exists { field, present } => Selector::Exists {
            field,
            present: !present,
        },
        Selector::Const(Value::Bool(b)) => Selector::Const(Value::Bool(!b)),
        // No rewrite known; keep the $not wrapper.
        other => Selector::Not(Box::new(simplify(other))),
    }
}

/// Collapse a captured pipeline into a `QueryPlan`.
///
/// Local validation happens here: mixed sort directions, dangling `then_by`,
/// and empty projections are rejected before anything touches the wire.
pub fn plan(ops: &[PipelineOp]) -> Result<QueryPlan> {
    let mut plan = QueryPlan::default();
    let mut predicates: Vec<Selector> = Vec::new();

    for op in ops {
        match op {
            PipelineOp::Where(sel) => predicates.push(sel.clone()),
            PipelineOp::OrderBy(f) => {
                plan.sort = Some((Direction::Asc, vec![f.clone()]));
            }
            PipelineOp::OrderByDesc(f) => {
                plan.sort = Some((Direction::Desc, vec![f.clone()]));
            }
            PipelineOp::ThenBy(f) => match &mut plan.sort {
                Some((Direction::Asc, fields)) => fields.push(f.clone()),
                Some((Direction::Desc, _)) => {
                    return Err(Error::UnsupportedQuery(
                        "cannot order in different directions".to_string(),
                    ))
                }
                None => {
                    return Err(Error::UnsupportedQuery(
                        "then_by requires a leading order_by".to_string(),
                    ))
                }
            },
            PipelineOp::ThenByDesc(f) => match &mut plan.sort {
                Some((Direction::Desc, fields)) => fields.push(f.clone()),
                Some((Direction::Asc, _)) => {
                    return Err(Error::UnsupportedQuery(
                        "cannot order in different directions".to_string(),
                    ))
                }
                None => {
                    return Err(Error::UnsupportedQuery(
                        "then_by requires a leading order_by".to_string(),
                    ))
                }
            },
            PipelineOp::Skip(n) => plan.skip = Some(*n),
            PipelineOp::Take(n) => plan.limit = Some(*n),
            PipelineOp::Select(paths) => {
                if paths.is_empty() {
                    return Err(Error::UnsupportedQuery(
                        "Select must project fields".to_string(),
                    ));
                }
                plan.fields = Some(paths.clone());
            }
            PipelineOp::UseBookmark(b) => plan.bookmark = Some(b.clone()),
            PipelineOp::UseIndex(i) => plan.use_index = Some(i.clone()),
            PipelineOp::WithReadQuorum(r) => plan.r = Some(*r),
            PipelineOp::UpdateIndex(u) => plan.update = Some(*u),
            PipelineOp::FromStable(s) => plan.stable = Some(*s),
        }
    }

    plan.selector = match predicates.len() {
        0 => None,
        1 => Some(optimize(predicates.into_iter().next().unwrap())),
        _ => Some(optimize(Selector::And(predicates))),
    };

    // Where(true) and Skip(0) are tautologies.
    if matches!(plan.selector, Some(Selector::Const(Value::Bool(true)))) {
        plan.selector = None;
    }
    if plan.skip == Some(0) {
        plan.skip = None;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{and, elem, field, not, CmpOp};
    use serde_json::json;

    #[test]
    fn double_negation_cancels() {
        let sel = not(not(field("age").gte(18)));
        assert_eq!(optimize(sel), field("age").gte(18));
    }

    #[test]
    fn de_morgan_pushes_not_down() {
        let sel = not(field("a").eq(1).and(field("b").eq(2)));
        assert_eq!(optimize(sel), field("a").ne(1).or(field("b").ne(2)));
    }

    #[test]
    fn negated_comparison_inverts() {
        assert_eq!(optimize(not(field("age").lt(18))), field("age").gte(18));
        assert_eq!(
            optimize(not(field("tag").is_in(vec![json!("a")]))),
            field("tag").not_in(vec![json!("a")])
        );
        assert_eq!(
            optimize(not(field("tag").exists(true))),
            field("tag").exists(false)
        );
    }

    #[test]
    fn nested_ands_flatten() {
        let sel = field("a")
            .eq(1)
            .and(field("b").eq(2))
            .and(field("c").eq(3));
        let optimized = optimize(sel);
        match optimized {
            Selector::And(children) => assert_eq!(children.len(), 3),
            other => panic!("expected flat And, got {:?}", other),
        }
    }

    #[test]
    fn constants_fold() {
        let sel = and(vec![
            Selector::Const(json!(true)),
            field("a").eq(1),
            Selector::Const(json!(true)),
        ]);
        assert_eq!(optimize(sel), field("a").eq(1));

        let sel = and(vec![Selector::Const(json!(false)), field("a").eq(1)]);
        assert_eq!(optimize(sel), Selector::Const(json!(false)));
    }

    #[test]
    fn null_equality_is_preserved() {
        let sel = optimize(field("middle_name").eq(json!(null)));
        match sel {
            Selector::Cmp { op, value, .. } => {
                assert_eq!(op, CmpOp::Eq);
                assert_eq!(value, json!(null));
            }
            other => panic!("null eq was rewritten: {:?}", other),
        }
    }

    #[test]
    fn unknown_negation_keeps_not_wrapper() {
        let sel = optimize(not(field("name").matches("^L")));
        assert!(matches!(sel, Selector::Not(_)));
    }

    #[test]
    fn elem_match_predicate_is_optimized() {
        let sel = field("friends").any(not(not(elem().eq("Leia"))));
        assert_eq!(optimize(sel), field("friends").any(elem().eq("Leia")));
    }

    #[test]
    fn where_true_and_skip_zero_drop_out() {
        let ops = vec![
            PipelineOp::Where(Selector::Const(json!(true))),
            PipelineOp::Skip(0),
            PipelineOp::Take(5),
        ];
        let plan = plan(&ops).unwrap();
        assert!(plan.selector.is_none());
        assert!(plan.skip.is_none());
        assert_eq!(plan.limit, Some(5));
    }

    #[test]
    fn multiple_wheres_and_together() {
        let ops = vec![
            PipelineOp::Where(field("a").eq(1)),
            PipelineOp::Where(field("b").eq(2)),
        ];
        let plan = plan(&ops).unwrap();
        match plan.selector.unwrap() {
            Selector::And(children) => assert_eq!(children.len(), 2),
            other => panic!("expected And, got {:?}", other),
        }
    }

    #[test]
    fn sort_chains_collapse() {
        let ops = vec![
            PipelineOp::OrderBy(FieldPath::parse("age")),
            PipelineOp::ThenBy(FieldPath::parse("name")),
        ];
        let plan = plan(&ops).unwrap();
        let (dir, fields) = plan.sort.unwrap();
        assert_eq!(dir, Direction::Asc);
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn mixed_sort_directions_fail() {
        let ops = vec![
            PipelineOp::OrderByDesc(FieldPath::parse("age")),
            PipelineOp::ThenBy(FieldPath::parse("name")),
        ];
        match plan(&ops) {
            Err(Error::UnsupportedQuery(msg)) => {
                assert_eq!(msg, "cannot order in different directions")
            }
            other => panic!("expected UnsupportedQuery, got {:?}", other),
        }
    }

    #[test]
    fn later_order_by_restarts_the_sort() {
        let ops = vec![
            PipelineOp::OrderByDesc(FieldPath::parse("age")),
            PipelineOp::OrderBy(FieldPath::parse("name")),
            PipelineOp::ThenBy(FieldPath::parse("age")),
        ];
        let plan = plan(&ops).unwrap();
        let (dir, fields) = plan.sort.unwrap();
        assert_eq!(dir, Direction::Asc);
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn empty_select_fails() {
        let ops = vec![PipelineOp::Select(vec![])];
        assert!(matches!(plan(&ops), Err(Error::UnsupportedQuery(_))));
    }
}
