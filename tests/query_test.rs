//! Query pipeline tests: builder DSL through to Mango JSON.

use loveseat::{
    elem, field, CaseStyle, CouchClient, CouchDatabase, Error, IndexRef, PropertyPolicy,
};

fn database() -> CouchDatabase {
    CouchClient::builder()
        .endpoint("http://localhost:5984")
        .build()
        .unwrap()
        .database("people")
}

fn snake_database() -> CouchDatabase {
    CouchClient::builder()
        .endpoint("http://localhost:5984")
        .property_policy(PropertyPolicy::new(CaseStyle::Snake))
        .build()
        .unwrap()
        .database("people")
}

#[test]
fn conjunction_of_two_fields() {
    let db = database();
    let mango = db
        .query()
        .filter(field("name").eq("Luke").and(field("age").eq(19)))
        .to_mango()
        .unwrap();
    assert_eq!(
        mango.to_string(),
        r#"{"selector":{"name":{"$eq":"Luke"},"age":{"$eq":19}}}"#
    );
}

#[test]
fn sort_chain_renders_flat_field_list() {
    let db = database();
    let mango = db
        .query()
        .order_by("age")
        .then_by("name")
        .to_mango()
        .unwrap();
    assert_eq!(mango.to_string(), r#"{"selector":{},"sort":["age","name"]}"#);
}

#[test]
fn mixed_sort_directions_are_rejected() {
    let db = database();
    let err = db
        .query()
        .order_by_desc("age")
        .then_by("name")
        .to_mango()
        .unwrap_err();
    match err {
        Error::UnsupportedQuery(msg) => {
            assert_eq!(msg, "cannot order in different directions")
        }
        other => panic!("expected UnsupportedQuery, got {:?}", other),
    }
}

#[test]
fn select_projects_fields() {
    let db = database();
    let mango = db.query().select(&["name", "age"]).to_mango().unwrap();
    assert_eq!(
        mango.to_string(),
        r#"{"selector":{},"fields":["name","age"]}"#
    );
}

#[test]
fn any_element_match() {
    let db = database();
    let mango = db
        .query()
        .filter(field("friends").any(elem().eq("Leia")))
        .to_mango()
        .unwrap();
    assert_eq!(
        mango.to_string(),
        r#"{"selector":{"friends":{"$elemMatch":{"$eq":"Leia"}}}}"#
    );
}

#[test]
fn skip_and_take_map_to_skip_and_limit() {
    let db = database();
    let mango = db.query().skip(10).take(5).to_mango().unwrap();
    assert_eq!(mango.to_string(), r#"{"selector":{},"skip":10,"limit":5}"#);
}

#[test]
fn full_option_surface_renders_in_order() {
    let db = database();
    let mango = db
        .query()
        .filter(field("age").gte(18))
        .order_by("age")
        .select(&["name"])
        .skip(5)
        .take(20)
        .use_bookmark("g1AAAA")
        .use_index(IndexRef::DesignDocAndName("people".into(), "by-age".into()))
        .with_read_quorum(2)
        .update_index(false)
        .from_stable(true)
        .to_mango()
        .unwrap();
    assert_eq!(
        mango.to_string(),
        concat!(
            r#"{"selector":{"age":{"$gte":18}},"sort":["age"],"fields":["name"],"#,
            r#""skip":5,"limit":20,"bookmark":"g1AAAA","use_index":["people","by-age"],"#,
            r#""r":2,"update":false,"stable":true}"#
        )
    );
}

#[test]
fn property_policy_renames_members() {
    let db = snake_database();
    let mango = db
        .query()
        .filter(field("FirstName").eq("Luke"))
        .order_by("BirthYear")
        .select(&["FirstName"])
        .to_mango()
        .unwrap();
    assert_eq!(
        mango.to_string(),
        concat!(
            r#"{"selector":{"first_name":{"$eq":"Luke"}},"#,
            r#""sort":["birth_year"],"fields":["first_name"]}"#
        )
    );
}

#[test]
fn negation_normalizes_before_translation() {
    let db = database();
    let mango = db
        .query()
        .filter(loveseat::not(
            field("age").lt(18).or(field("name").eq("Vader")),
        ))
        .to_mango()
        .unwrap();
    assert_eq!(
        mango.to_string(),
        r#"{"selector":{"age":{"$gte":18},"name":{"$ne":"Vader"}}}"#
    );
}

#[test]
fn repeated_queries_hit_the_translation_cache() {
    let db = database();
    for _ in 0..3 {
        db.query()
            .filter(field("age").gte(18))
            .take(10)
            .to_mango()
            .unwrap();
    }
    let stats = db.cache_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.entries, 1);
}

#[test]
fn commutative_filters_share_one_cache_entry() {
    let db = database();
    db.query()
        .filter(field("a").eq(1).and(field("b").eq(2)))
        .to_mango()
        .unwrap();
    let second = db
        .query()
        .filter(field("b").eq(2).and(field("a").eq(1)))
        .to_mango()
        .unwrap();
    // The cached translation of the first ordering is reused verbatim.
    assert_eq!(
        second.to_string(),
        r#"{"selector":{"a":{"$eq":1},"b":{"$eq":2}}}"#
    );
    assert_eq!(db.cache_stats().entries, 1);
}
