use chrono::{Datelike, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use formula_measures::kpi::{register_crime_kpis, CrimeSchema};
use formula_measures::{
    DataModel, EngineSettings, FilterContext, InMemoryStore, Table, TableSchema, Value,
};
use std::sync::Arc;
use std::time::Duration;

fn bench_rows() -> usize {
    std::env::var("FORMULA_MEASURES_BENCH_ROWS")
        .ok()
        .and_then(|v| v.replace('_', "").parse::<usize>().ok())
        .filter(|&v| (1_000..=1_000_000).contains(&v))
        .unwrap_or(50_000)
}

fn build_model(rows: usize, cache_measures: bool) -> DataModel {
    let districts = 25i64;
    let types = 30i64;
    let first = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let days: Vec<NaiveDate> = first.iter_days().take(366).collect();

    let mut store = InMemoryStore::new();

    let mut dates = Table::new("Date", vec!["Date", "Year", "Month"]);
    for day in &days {
        dates
            .push_row(vec![
                Value::from(*day),
                Value::from(i64::from(day.year())),
                Value::from(i64::from(day.month())),
            ])
            .unwrap();
    }
    store.add_table(dates).unwrap();

    let mut locations = Table::new("Location", vec!["LocationKey", "District", "Population"]);
    for key in 0..districts {
        locations
            .push_row(vec![
                Value::from(key),
                Value::from(format!("District_{key:02}")),
                Value::from(10_000 + key * 500),
            ])
            .unwrap();
    }
    store.add_table(locations).unwrap();

    let mut crime_types = Table::new("Crime Type", vec!["TypeKey", "Primary Type"]);
    for key in 0..types {
        crime_types
            .push_row(vec![Value::from(key), Value::from(format!("TYPE_{key:02}"))])
            .unwrap();
    }
    store.add_table(crime_types).unwrap();

    let columns = vec![
        "CrimeId",
        "Date",
        "Reported Date",
        "LocationKey",
        "TypeKey",
        "Arrest",
        "Domestic",
        "Response Minutes",
    ];
    let mut crimes = Table::new("Crimes", columns.clone());
    for id in 0..rows {
        let day = days[id % days.len()];
        let n = id as i64;
        crimes
            .push_row(vec![
                Value::from(n),
                Value::from(day),
                Value::from(day),
                Value::from(n % districts),
                Value::from((n * 7) % types),
                Value::from(id % 4 == 0),
                Value::from(id % 9 == 0),
                Value::from((id % 45) as f64),
            ])
            .unwrap();
    }
    store.add_table(crimes).unwrap();

    let mut model = DataModel::new(Arc::new(store))
        .with_settings(EngineSettings {
            cache_measures,
            ..EngineSettings::default()
        })
        .unwrap();
    model
        .register_table(TableSchema::dimension(
            "Date",
            vec!["Date", "Year", "Month"],
            "Date",
        ))
        .unwrap();
    model
        .register_table(TableSchema::dimension(
            "Location",
            vec!["LocationKey", "District", "Population"],
            "LocationKey",
        ))
        .unwrap();
    model
        .register_table(TableSchema::dimension(
            "Crime Type",
            vec!["TypeKey", "Primary Type"],
            "TypeKey",
        ))
        .unwrap();
    model
        .register_table(TableSchema::fact("Crimes", columns))
        .unwrap();
    model
        .register_relationship("Crimes", "Date", "Date", "Date", true)
        .unwrap();
    model
        .register_relationship("Crimes", "Reported Date", "Date", "Date", false)
        .unwrap();
    model
        .register_relationship("Crimes", "LocationKey", "Location", "LocationKey", true)
        .unwrap();
    model
        .register_relationship("Crimes", "TypeKey", "Crime Type", "TypeKey", true)
        .unwrap();
    model.mark_date_table("Date", "Date").unwrap();
    register_crime_kpis(&mut model, &CrimeSchema::default()).unwrap();
    model
}

fn bench_moving_average(c: &mut Criterion) {
    let rows = bench_rows();
    let cached = build_model(rows, true);
    let uncached = build_model(rows, false);

    let filter = FilterContext::unrestricted()
        .with_column_equals("Date", "Year", 2024)
        .with_column_equals("Date", "Month", 6)
        .with_column_equals("Location", "District", "District_03");

    // Both configurations must agree before timing them.
    assert_eq!(
        cached.evaluate("7 Day Moving Avg", &filter).unwrap(),
        uncached.evaluate("7 Day Moving Avg", &filter).unwrap()
    );

    let mut group = c.benchmark_group("moving_average");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    group.bench_with_input(BenchmarkId::new("cached", rows), &rows, |b, _| {
        b.iter(|| {
            let value = cached.evaluate("7 Day Moving Avg", &filter).unwrap();
            black_box(value);
        })
    });

    group.bench_with_input(BenchmarkId::new("uncached", rows), &rows, |b, _| {
        b.iter(|| {
            let value = uncached.evaluate("7 Day Moving Avg", &filter).unwrap();
            black_box(value);
        })
    });

    group.finish();

    let measures = ["Total Crimes", "Arrest Rate", "Crimes YTD", "YoY Change %"];
    let mut dashboard = c.benchmark_group("dashboard");
    dashboard.sample_size(10);
    dashboard.measurement_time(Duration::from_secs(5));

    // Prior-year dates fall outside the date table here, so YoY reports an error cell.
    dashboard.bench_with_input(BenchmarkId::new("evaluate_many", rows), &rows, |b, _| {
        b.iter(|| {
            let cells = cached.evaluate_many(&measures, &filter);
            black_box(cells);
        })
    });

    dashboard.finish();
}

criterion_group!(benches, bench_moving_average);
criterion_main!(benches);
