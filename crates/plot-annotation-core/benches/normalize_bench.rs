use criterion::{criterion_group, criterion_main, Criterion};
use plot_annotation_core::{ingest, normalize, AnnotationRow, Source};
use serde_json::{json, Map, Value};

fn mk_row(index: usize) -> AnnotationRow {
    let mut columns = Map::new();
    columns.insert("annotator_id".to_string(), json!(format!("annotator-{}", index % 12)));
    columns.insert("is_calibration".to_string(), Value::Bool(index % 5 == 0));
    columns.insert("overall".to_string(), json!(1 + index % 10));
    columns.insert("confidence".to_string(), json!("mid"));
    AnnotationRow::from_map(columns)
}

fn mk_source(batch: usize) -> Source {
    let items = (0..500)
        .map(|index| {
            json!({
                "title": format!("Plot {}", index % 400),
                "seed_id": format!("seed-{batch}"),
                "method_name": "beam",
                "final_plot": "Once upon a time."
            })
        })
        .collect::<Vec<_>>();
    Source::new(format!("batch-{batch}.json"), Value::Array(items).to_string())
}

fn bench_normalize(c: &mut Criterion) {
    let rows = (0..5_000).map(mk_row).collect::<Vec<_>>();
    c.bench_function("normalize_5000_rows", |b| {
        b.iter(|| {
            let normalized = normalize(&rows);
            assert_eq!(normalized.len(), rows.len());
        });
    });
}

fn bench_ingest(c: &mut Criterion) {
    let sources = (0..4).map(mk_source).collect::<Vec<_>>();
    c.bench_function("ingest_4_sources_with_duplicates", |b| {
        b.iter(|| {
            let (plots, report) = ingest(Vec::new(), &sources);
            assert_eq!(plots.len(), report.admitted);
        });
    });
}

criterion_group!(benches, bench_normalize, bench_ingest);
criterion_main!(benches);
