mod common;

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use bigdecimal::BigDecimal;
use common::{add_fables, lfs_database, NOTE};
use folio::catalog::Catalog;
use folio::datatype::{CatalogValue, CatalogValues, FieldType, Value};
use folio::error::FolioError;
use folio::metadata::MetadataProperty;
use folio::query::Query;
use folio::results::{SearchResults, SortBy};
use folio::schema::Field;

const TITLES: [&str; 6] = [
    "The Wolf and the Lamb",
    "The Wolf and the Crane",
    "The Wolf and the Kid",
    "The Dog and the Wolf",
    "The Fox and the Grapes",
    "The Lion and the Mouse",
];

fn document(abspath: &str, fields: &[(&str, Value)]) -> CatalogValues {
    let mut values = CatalogValues::new();
    values.insert("abspath".to_string(), CatalogValue::Scalar(Value::from(abspath)));
    for (name, value) in fields {
        values.insert(name.to_string(), CatalogValue::Scalar(value.clone()));
    }
    values
}

fn titles_catalog() -> Catalog {
    common::init_test_logging();
    let mut catalog = Catalog::in_memory().expect("catalog");
    catalog.register_field(Field::new("title", FieldType::Unicode).indexed().stored()).expect("title");
    catalog.register_field(Field::new("rank", FieldType::Integer).indexed().stored()).expect("rank");
    for (i, title) in TITLES.iter().enumerate() {
        let values = document(&format!("/t/{i}"), &[("title", Value::from(*title)), ("rank", Value::Int(i as i64 - 2))]);
        catalog.index_document(&values).expect("index");
    }
    catalog.save_changes().expect("save");
    catalog
}

fn count(catalog: &Catalog, query: Query) -> u64 {
    catalog.search(&query).expect("search").len()
}

#[test]
fn text_query_operators() {
    let catalog = titles_catalog();
    assert_eq!(count(&catalog, Query::text("title", "Wolf")), 4);
    assert_eq!(count(&catalog, Query::text("title", "Wolf -Dog")), 3);
    assert_eq!(count(&catalog, Query::text("title", "\"Wolf and\"")), 3, "exact phrase");
    assert_eq!(count(&catalog, Query::text("title", "Wolf and")), 6, "bag of words");
    assert_eq!(count(&catalog, Query::text("title", "+wolf +lamb")), 1);
    assert_eq!(count(&catalog, Query::text("title", "gra*")), 1);
    assert_eq!(count(&catalog, Query::text("title", "")), 0);
}

#[test]
fn query_algebra() {
    let catalog = titles_catalog();
    let wolf = Query::text("title", "wolf");
    let fox = Query::phrase("title", "fox");
    assert_eq!(count(&catalog, Query::and([wolf.clone(), Query::All])), count(&catalog, wolf.clone()));
    assert_eq!(count(&catalog, Query::or([wolf.clone(), Query::All])), 6);
    assert_eq!(count(&catalog, Query::or([wolf.clone(), fox.clone()])), 5);
    assert_eq!(count(&catalog, Query::and([wolf.clone(), fox])), 0);
    assert_eq!(count(&catalog, Query::not(wolf.clone())), 2);
    assert_eq!(count(&catalog, Query::And(Vec::new())), 0, "an empty intersection matches nothing");
    assert_eq!(count(&catalog, Query::phrase("colour", "blue")), 0, "unknown fields match nothing");
}

#[test]
fn ranges_contain_their_bounds() {
    let catalog = titles_catalog();
    // ranks are -2..=3
    assert_eq!(count(&catalog, Query::range("rank", Some(Value::Int(-1)), Some(Value::Int(1)))), 3);
    assert_eq!(count(&catalog, Query::range("rank", Some(Value::Int(0)), None)), 4);
    assert_eq!(count(&catalog, Query::range("rank", None, Some(Value::Int(-2)))), 1);
    assert_eq!(count(&catalog, Query::range("rank", None, None)), 6);
    assert_eq!(count(&catalog, Query::start("title", "The W")), 3);
    let all = Query::range("rank", None, None);
    assert_eq!(
        count(&catalog, Query::and([Query::range("rank", Some(Value::Int(1)), None), all])),
        count(&catalog, Query::range("rank", Some(Value::Int(1)), None))
    );
}

#[test]
fn index_then_unindex_is_a_no_op() {
    let mut catalog = titles_catalog();
    let before = catalog.doc_count().expect("count");
    let values = document("/extra", &[("title", Value::from("The Wolf in Sheep's Clothing"))]);
    catalog.index_document(&values).expect("index");
    catalog.unindex_document("/extra").expect("unindex");
    catalog.save_changes().expect("save");
    assert_eq!(catalog.doc_count().expect("count"), before);
    assert_eq!(count(&catalog, Query::text("title", "wolf")), 4);
    assert_eq!(count(&catalog, Query::text("title", "sheep")), 0);
    catalog.unindex_document("/never-indexed").expect("a missing document is fine");
}

#[test]
fn reindexing_replaces_the_document() {
    let mut catalog = titles_catalog();
    let values = document("/t/0", &[("title", Value::from("The Eagle and the Arrow"))]);
    catalog.index_document(&values).expect("index");
    assert_eq!(catalog.doc_count().expect("count"), 6);
    assert_eq!(count(&catalog, Query::text("title", "lamb")), 0);
    assert_eq!(count(&catalog, Query::text("title", "eagle")), 1);
}

#[test]
fn aborted_edits_are_rolled_back() {
    let mut catalog = titles_catalog();
    catalog.unindex_document("/t/5").expect("unindex");
    assert_eq!(count(&catalog, Query::text("title", "lion")), 0);
    catalog.abort_changes().expect("abort");
    assert_eq!(count(&catalog, Query::text("title", "lion")), 1);
}

#[test]
fn ranges_need_stored_fields() {
    let mut catalog = Catalog::in_memory().expect("catalog");
    catalog.register_field(Field::new("body", FieldType::Unicode).indexed()).expect("body");
    catalog.index_document(&document("/a", &[("body", Value::from("text"))])).expect("index");
    let result = catalog.search(&Query::range("body", Some(Value::from("a")), None));
    assert!(matches!(result, Err(FolioError::InvalidQuery(_))), "got {result:?}");
}

#[test]
fn conflicting_declarations_are_refused() {
    let mut catalog = Catalog::in_memory().expect("catalog");
    catalog.register_field(Field::new("x", FieldType::Integer).stored()).expect("x");
    let result = catalog.register_field(Field::new("x", FieldType::Unicode).indexed());
    assert!(matches!(result, Err(FolioError::SchemaConflict(_))), "got {result:?}");
}

#[test]
fn multilingual_negotiation() {
    let (_dir, mut db) = lfs_database();
    let mut metadata = db.new_metadata(NOTE);
    for (language, title) in [("en", "Hello world"), ("es", "Hola mundo"), ("de", "Hallo welt"), ("fr", "Bonjour le monde")] {
        metadata
            .set_property("title", MetadataProperty::new(title), Some(language))
            .expect("title");
    }
    db.make_resource("/greetings", metadata).expect("make resource");
    db.save_changes(None).expect("commit");

    assert_eq!(db.search(Query::phrase("title_es", "mundo")).len().expect("search"), 1);
    assert_eq!(db.search(Query::phrase("title_en", "mundo")).len().expect("search"), 0);
    assert_eq!(db.search(Query::text("title", "monde")).len().expect("search"), 1);

    let documents = db.search(Query::All).get_documents(&SortBy::None, false, 0, 0).expect("documents");
    let document = &documents[0];
    assert_eq!(document.get_value("title", Some("fr")).expect("fr"), Some(CatalogValue::Scalar(Value::from("Bonjour le monde"))));
    // first language in order with a value
    assert_eq!(document.get_value("title", None).expect("any"), Some(CatalogValue::Scalar(Value::from("Hallo welt"))));
    assert_eq!(document.get_value("title", Some("it")).expect("it"), None);
}

#[test]
fn search_fields_and_refinement() {
    let (_dir, mut db) = lfs_database();
    add_fables(&mut db);
    let aesop = db.search_fields([("author", Value::from("aesop"))]);
    assert_eq!(aesop.len().expect("search"), 3);
    assert_eq!(aesop.search(Query::text("title", "lion")).len().expect("refine"), 1);
    let both = db.search_fields([("author", Value::from("la fontaine")), ("year", Value::Int(1668))]);
    assert_eq!(both.len().expect("search"), 2);
    assert!(db.search_fields([("colour", Value::from("blue"))]).is_empty().expect("search"));
}

fn decimal(text: &str) -> Value {
    Value::Decimal(BigDecimal::from_str(text).expect("decimal"))
}

fn abspaths(results: &SearchResults, sort_by: &SortBy, reverse: bool) -> Vec<String> {
    results
        .get_documents(sort_by, reverse, 0, 0)
        .expect("documents")
        .iter()
        .map(|d| d.abspath().expect("abspath"))
        .collect()
}

#[test]
fn decimals_are_exact() {
    let mut catalog = Catalog::in_memory().expect("catalog");
    catalog.register_field(Field::new("price", FieldType::Decimal).indexed().stored()).expect("price");
    for (abspath, price) in [
        ("/p/a", decimal("0.1")),
        ("/p/b", decimal("0.10000000000000000001")),
        ("/p/c", Value::from("2.5")),
        ("/p/d", Value::Int(5)),
    ] {
        catalog.index_document(&document(abspath, &[("price", price)])).expect("index");
    }
    catalog.save_changes().expect("save");

    assert_eq!(count(&catalog, Query::range("price", Some(decimal("0.100000000000000000005")), None)), 3);
    assert_eq!(count(&catalog, Query::range("price", Some(Value::Int(1)), None)), 2);
    assert_eq!(count(&catalog, Query::range("price", Some(Value::Int(1)), Some(Value::from("3")))), 1);
    assert_eq!(count(&catalog, Query::phrase("price", Value::Int(5))), 1);
    assert_eq!(count(&catalog, Query::phrase("price", "2.5")), 1);
    assert_eq!(count(&catalog, Query::phrase("price", decimal("2.50"))), 1);
    assert_eq!(count(&catalog, Query::phrase("price", decimal("0.1"))), 1);
    let result = catalog.search(&Query::range("price", Some(Value::Bool(true)), None));
    assert!(matches!(result, Err(FolioError::InvalidValue(_))), "got {result:?}");

    let results = SearchResults::new(Arc::new(Mutex::new(catalog)), Query::All);
    let documents = results.get_documents(&SortBy::from("price"), false, 0, 0).expect("documents");
    let prices: Vec<_> = documents.iter().map(|d| d.get_value("price", None).expect("price")).collect();
    assert_eq!(
        prices,
        vec![
            Some(CatalogValue::Scalar(decimal("0.1"))),
            Some(CatalogValue::Scalar(decimal("0.10000000000000000001"))),
            Some(CatalogValue::Scalar(decimal("2.5"))),
            Some(CatalogValue::Scalar(decimal("5"))),
        ]
    );
}

fn authors_catalog() -> SearchResults {
    let mut catalog = Catalog::in_memory().expect("catalog");
    catalog.register_field(Field::new("author", FieldType::String).indexed().stored()).expect("author");
    catalog.register_field(Field::new("year", FieldType::Integer).indexed().stored()).expect("year");
    for (abspath, author, year) in [("/a", "la fontaine", 1668), ("/b", "aesop", 1484), ("/c", "esope", 1668)] {
        let values = document(abspath, &[("author", Value::from(author)), ("year", Value::Int(year))]);
        catalog.index_document(&values).expect("index");
    }
    catalog.save_changes().expect("save");
    SearchResults::new(Arc::new(Mutex::new(catalog)), Query::All)
}

#[test]
fn later_sort_keys_break_ties() {
    let results = authors_catalog();
    let by_year_then_author = SortBy::Fields(vec!["year".to_string(), "author".to_string()]);
    assert_eq!(abspaths(&results, &by_year_then_author, false), vec!["/b", "/c", "/a"]);
    assert_eq!(abspaths(&results, &by_year_then_author, true), vec!["/a", "/c", "/b"]);
    let page = results.get_documents(&by_year_then_author, false, 1, 1).expect("page");
    assert_eq!(page[0].abspath().expect("abspath"), "/c");
}

#[test]
fn unknown_sort_keys_are_ignored() {
    let results = authors_catalog();
    let with_unknown = SortBy::Fields(vec!["colour".to_string(), "year".to_string()]);
    assert_eq!(abspaths(&results, &with_unknown, false), vec!["/b", "/a", "/c"], "sorted by year only");
    assert_eq!(abspaths(&results, &SortBy::from("colour"), false), vec!["/a", "/b", "/c"], "relevance order");
}

#[test]
fn relevance_order_can_be_reversed() {
    let results = SearchResults::new(Arc::new(Mutex::new(titles_catalog())), Query::text("title", "lamb wolf"));
    assert_eq!(abspaths(&results, &SortBy::None, false), vec!["/t/0", "/t/1", "/t/2", "/t/3"]);
    assert_eq!(abspaths(&results, &SortBy::None, true), vec!["/t/3", "/t/2", "/t/1", "/t/0"]);
}

#[test]
fn cjk_values_are_searched_by_bigrams() {
    let (_dir, mut db) = lfs_database();
    let mut metadata = db.new_metadata(NOTE);
    metadata.set_property("title", MetadataProperty::new("東京都庁"), Some("ja")).expect("ja");
    metadata.set_property("title", MetadataProperty::new("Tokyo city hall"), Some("en")).expect("en");
    db.make_resource("/tokyo", metadata).expect("make resource");
    db.save_changes(None).expect("commit");

    assert_eq!(db.search(Query::phrase("title_ja", "東京都")).len().expect("search"), 1);
    assert_eq!(db.search(Query::phrase("title_ja", "京都")).len().expect("search"), 1);
    assert_eq!(db.search(Query::phrase("title_ja", "都京")).len().expect("search"), 0);
    assert_eq!(db.search(Query::text("title_ja", "東京都 -大阪")).len().expect("search"), 1);
    assert_eq!(db.search(Query::text("title_ja", "+東京都 +大阪")).len().expect("search"), 0);
    assert_eq!(db.search(Query::text("title_en", "hall")).len().expect("search"), 1);
}
