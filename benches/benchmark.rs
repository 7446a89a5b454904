use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use folio::cache::LruCache;
use folio::catalog::{Catalog, Matches};
use folio::datatype::{CatalogValue, CatalogValues, FieldType, Value};
use folio::query::Query;
use folio::schema::Field;
use roaring::RoaringTreemap;

const WORDS: [&str; 12] = [
    "wolf", "lamb", "fox", "grapes", "lion", "mouse", "crow", "cheese", "crane", "dog", "kid", "shepherd",
];

fn title(i: usize) -> String {
    format!("The {} and the {}", WORDS[i % WORDS.len()], WORDS[(i / WORDS.len()) % WORDS.len()])
}

fn catalog(n: usize) -> Catalog {
    let mut catalog = Catalog::in_memory().unwrap();
    catalog.register_field(Field::new("title", FieldType::Unicode).indexed().stored()).unwrap();
    catalog.register_field(Field::new("year", FieldType::Integer).indexed().stored()).unwrap();
    for i in 0..n {
        let mut values = CatalogValues::new();
        values.insert("abspath".to_string(), CatalogValue::Scalar(Value::from(format!("/bench/{i}"))));
        values.insert("title".to_string(), CatalogValue::Scalar(Value::from(title(i))));
        values.insert("year".to_string(), CatalogValue::Scalar(Value::Int(1400 + (i % 400) as i64)));
        catalog.index_document(&values).unwrap();
    }
    catalog.save_changes().unwrap();
    catalog
}

fn matches(range: std::ops::Range<u64>) -> Matches {
    Matches::from_docs(range.collect::<RoaringTreemap>())
}

pub fn criterion_benchmark(c: &mut Criterion) {
    // ------------- cache -------------
    let mut cache = LruCache::new(1000, 2000).unwrap().manual();
    for i in 0..2000u64 {
        cache.insert(i, i);
    }
    c.bench_function("cache get 2k", |b| b.iter(|| cache.get(black_box(&1000))));
    c.bench_function("cache insert + make_room 2k", |b| {
        b.iter(|| {
            let mut cache = LruCache::new(1000, 2000).unwrap().manual();
            for i in 0..2000u64 {
                cache.insert(i, i);
            }
            cache.make_room(|k, _| k % 2 == 0).len()
        })
    });

    // ------------- matches -------------
    c.bench_function("intersect 1k", |b| {
        b.iter(|| matches(0..1000).intersect(matches(500..1500)).len())
    });
    c.bench_function("intersect 100k", |b| {
        b.iter(|| matches(0..100_000).intersect(matches(50_000..150_000)).len())
    });
    c.bench_function("union 100k", |b| {
        b.iter(|| matches(0..100_000).union(matches(50_000..150_000)).len())
    });

    // ------------- catalog -------------
    c.bench_function("index 1k", |b| b.iter(|| catalog(black_box(1000)).doc_count().unwrap()));
    let catalog = catalog(5000);
    let word = Query::text("title", "wolf");
    let phrase = Query::text("title", "\"wolf and\"");
    let range = Query::range("year", Some(Value::Int(1500)), Some(Value::Int(1600)));
    let mixed = Query::and([Query::text("title", "fox -grapes"), range.clone()]);
    c.bench_function("search word 5k", |b| b.iter(|| catalog.search(&word).unwrap().len()));
    c.bench_function("search phrase 5k", |b| b.iter(|| catalog.search(&phrase).unwrap().len()));
    c.bench_function("search range 5k", |b| b.iter(|| catalog.search(&range).unwrap().len()));
    c.bench_function("search mixed 5k", |b| b.iter(|| catalog.search(&mixed).unwrap().len()));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
