#![allow(dead_code)]

use chrono::{Datelike, NaiveDate};
use formula_measures::kpi::{register_crime_kpis, CrimeSchema};
use formula_measures::{
    AggregateOp, DataModel, InMemoryStore, Predicate, RowIter, Store, StoreError, StoreResult,
    Table, TableSchema, Value,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const DISTRICTS: [(i64, &str, f64); 2] = [(1, "A", 1000.0), (2, "B", 2000.0)];
pub const CRIME_TYPES: [(i64, &str); 4] = [
    (1, "THEFT"),
    (2, "BATTERY"),
    (3, "ROBBERY"),
    (4, "NARCOTICS"),
];

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// One reported crime. Defaults: district A, THEFT, no arrest, not domestic, reported the day it
/// happened.
#[derive(Clone, Debug)]
pub struct Crime {
    pub date: NaiveDate,
    pub reported: NaiveDate,
    pub location: i64,
    pub crime_type: i64,
    pub arrest: bool,
    pub domestic: bool,
    pub response_minutes: Option<f64>,
}

pub fn crime(date: NaiveDate) -> Crime {
    Crime {
        date,
        reported: date,
        location: 1,
        crime_type: 1,
        arrest: false,
        domestic: false,
        response_minutes: None,
    }
}

impl Crime {
    pub fn at(mut self, location: i64) -> Self {
        self.location = location;
        self
    }

    pub fn of_type(mut self, crime_type: i64) -> Self {
        self.crime_type = crime_type;
        self
    }

    pub fn arrested(mut self) -> Self {
        self.arrest = true;
        self
    }

    pub fn domestic(mut self) -> Self {
        self.domestic = true;
        self
    }

    pub fn response(mut self, minutes: f64) -> Self {
        self.response_minutes = Some(minutes);
        self
    }

    pub fn reported_on(mut self, reported: NaiveDate) -> Self {
        self.reported = reported;
        self
    }

    pub fn times(self, n: usize) -> Vec<Crime> {
        vec![self; n]
    }
}

/// Star-schema store: a `Date` table covering 2023 and 2024, `Location`, `Crime Type` and the
/// `Crimes` fact table.
pub fn build_store(crimes: &[Crime]) -> InMemoryStore {
    let mut store = InMemoryStore::new();

    let mut dates = Table::new("Date", vec!["Date", "Year", "Month"]);
    let mut day = date(2023, 1, 1);
    while day <= date(2024, 12, 31) {
        dates
            .push_row(vec![
                day.into(),
                Value::from(i64::from(day.year())),
                Value::from(i64::from(day.month())),
            ])
            .unwrap();
        day = day.succ_opt().unwrap();
    }
    store.add_table(dates).unwrap();

    let mut locations = Table::new("Location", vec!["LocationKey", "District", "Population"]);
    for (key, district, population) in DISTRICTS {
        locations
            .push_row(vec![key.into(), district.into(), population.into()])
            .unwrap();
    }
    store.add_table(locations).unwrap();

    let mut types = Table::new("Crime Type", vec!["TypeKey", "Primary Type"]);
    for (key, name) in CRIME_TYPES {
        types.push_row(vec![key.into(), name.into()]).unwrap();
    }
    store.add_table(types).unwrap();

    let mut fact = Table::new(
        "Crimes",
        vec![
            "CrimeId",
            "Date",
            "Reported Date",
            "LocationKey",
            "TypeKey",
            "Arrest",
            "Domestic",
            "Response Minutes",
        ],
    );
    for (id, c) in crimes.iter().enumerate() {
        fact.push_row(vec![
            Value::from(id as i64),
            c.date.into(),
            c.reported.into(),
            c.location.into(),
            c.crime_type.into(),
            c.arrest.into(),
            c.domestic.into(),
            c.response_minutes.map(Value::from).unwrap_or(Value::Blank),
        ])
        .unwrap();
    }
    store.add_table(fact).unwrap();

    store
}

/// Register the crime schema, its relationships and the date table on an empty model.
pub fn register_schema(model: &mut DataModel) {
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
        .register_table(TableSchema::fact(
            "Crimes",
            vec![
                "CrimeId",
                "Date",
                "Reported Date",
                "LocationKey",
                "TypeKey",
                "Arrest",
                "Domestic",
                "Response Minutes",
            ],
        ))
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
}

pub fn model_over(store: Arc<dyn Store>) -> DataModel {
    let mut model = DataModel::new(store);
    register_schema(&mut model);
    register_crime_kpis(&mut model, &CrimeSchema::default()).unwrap();
    model
}

/// The crime model with the dashboard measures registered.
pub fn build_model(crimes: &[Crime]) -> DataModel {
    model_over(Arc::new(build_store(crimes)))
}

pub fn assert_number(value: &Value, expected: f64) {
    let actual = value
        .as_number()
        .unwrap_or_else(|| panic!("expected a number, got {value}"));
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

/// A [`Store`] that counts the calls it forwards.
#[derive(Debug)]
pub struct CountingStore {
    inner: InMemoryStore,
    pub aggregates: AtomicUsize,
    pub scans: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            aggregates: AtomicUsize::new(0),
            scans: AtomicUsize::new(0),
        }
    }

    pub fn aggregate_calls(&self) -> usize {
        self.aggregates.load(Ordering::SeqCst)
    }
}

impl Store for CountingStore {
    fn aggregate(
        &self,
        table: &str,
        op: AggregateOp,
        column: Option<&str>,
        predicate: &Predicate,
    ) -> StoreResult<Value> {
        self.aggregates.fetch_add(1, Ordering::SeqCst);
        self.inner.aggregate(table, op, column, predicate)
    }

    fn distinct_values(
        &self,
        table: &str,
        column: &str,
        predicate: &Predicate,
    ) -> StoreResult<BTreeSet<Value>> {
        self.inner.distinct_values(table, column, predicate)
    }

    fn rows(&self, table: &str, predicate: Predicate) -> StoreResult<RowIter<'_>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.rows(table, predicate)
    }
}

/// A [`Store`] whose backend is down.
#[derive(Debug)]
pub struct UnavailableStore;

impl Store for UnavailableStore {
    fn aggregate(
        &self,
        _table: &str,
        _op: AggregateOp,
        _column: Option<&str>,
        _predicate: &Predicate,
    ) -> StoreResult<Value> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    fn distinct_values(
        &self,
        _table: &str,
        _column: &str,
        _predicate: &Predicate,
    ) -> StoreResult<BTreeSet<Value>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    fn rows(&self, _table: &str, _predicate: Predicate) -> StoreResult<RowIter<'_>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}
