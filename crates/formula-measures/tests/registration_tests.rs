mod common;

use common::{build_model, register_schema};
use formula_measures::{
    parse, DataModel, FilterContext, InMemoryStore, MeasureDefinition, MeasureError, Relationship,
    Table, TableSchema, Value,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn empty_model() -> DataModel {
    let mut model = DataModel::new(Arc::new(InMemoryStore::new()));
    register_schema(&mut model);
    model
}

fn definition(name: &str, formula: &str) -> MeasureDefinition {
    MeasureDefinition::new(name, parse(formula).unwrap()).with_expression(formula)
}

#[test]
fn mutual_references_are_a_cycle() {
    let mut model = empty_model();
    let err = model
        .register_measures(vec![definition("A", "[B] + 1"), definition("B", "[A] * 2")])
        .unwrap_err();
    match err {
        MeasureError::CyclicMeasure { cycle } => assert_eq!(cycle, vec!["A", "B", "A"]),
        other => panic!("expected CyclicMeasure, got {other:?}"),
    }
    assert!(model.measures().is_empty());
}

#[test]
fn self_reference_is_a_cycle() {
    let mut model = empty_model();
    let err = model.register_measure_text("Loop", "[Loop] + 1").unwrap_err();
    assert!(matches!(err, MeasureError::CyclicMeasure { cycle } if cycle == vec!["Loop", "Loop"]));
}

#[test]
fn unknown_tables_and_columns_are_rejected() {
    let mut model = empty_model();
    assert!(matches!(
        model.register_measure_text("Bad Column", "SUM(Crimes[Nope])"),
        Err(MeasureError::UnknownColumn { table, column }) if table == "Crimes" && column == "Nope"
    ));
    assert!(matches!(
        model.register_measure_text("Bad Table", "COUNTROWS(Nope)"),
        Err(MeasureError::UnknownTable(table)) if table == "Nope"
    ));
}

#[test]
fn references_must_exist_at_registration() {
    let mut model = empty_model();
    let err = model.register_measure_text("Bad", "[Missing] * 2").unwrap_err();
    match err {
        MeasureError::UnknownMeasureReference { measure, reference } => {
            assert_eq!((measure.as_str(), reference.as_str()), ("Bad", "Missing"));
        }
        other => panic!("expected UnknownMeasureReference, got {other:?}"),
    }
}

#[test]
fn conditionals_need_a_default_branch() {
    let mut model = empty_model();
    model
        .register_measure_text("Total Crimes", "COUNTROWS(Crimes)")
        .unwrap();

    assert!(matches!(
        model.register_measure_text("Busy", "IF([Total Crimes] > 100, 1)"),
        Err(MeasureError::MissingDefaultBranch { measure }) if measure == "Busy"
    ));
    assert!(matches!(
        model.register_measure_text("Label", r#"SWITCH([Total Crimes], 0, "none", 1, "one")"#),
        Err(MeasureError::MissingDefaultBranch { .. })
    ));
    model
        .register_measure_text("Busy", r#"IF([Total Crimes] > 100, "busy", "quiet")"#)
        .unwrap();
}

#[test]
fn a_failed_batch_registers_nothing() {
    let mut model = empty_model();
    let err = model
        .register_measures(vec![
            definition("Good", "COUNTROWS(Crimes)"),
            definition("Broken", "[Good] + [Nowhere]"),
        ])
        .unwrap_err();
    assert!(matches!(err, MeasureError::UnknownMeasureReference { .. }));
    assert!(model.measure("Good").is_none());
    assert!(model.measures().is_empty());
}

#[test]
fn batches_may_reference_forward() {
    let mut model = empty_model();
    model
        .register_measures(vec![
            definition("Share", "DIVIDE([Part], [Whole], 0)"),
            definition("Part", "COUNTROWS(FILTER(Crimes, Crimes[Arrest] = TRUE()))"),
            definition("Whole", "COUNTROWS(Crimes)"),
        ])
        .unwrap();
    assert_eq!(model.measures().len(), 3);
}

#[test]
fn measure_names_are_unique_ignoring_case() {
    let mut model = build_model(&[]);
    assert!(matches!(
        model.register_measure_text("total crimes", "COUNTROWS(Crimes)"),
        Err(MeasureError::DuplicateMeasure { measure }) if measure == "total crimes"
    ));
}

/// Sales reach Region through Product and through Store. Product 1 and store 2 sit in North.
fn diamond_model() -> DataModel {
    let mut store = InMemoryStore::new();
    let tables = [
        ("Sales", vec!["ProductKey", "StoreKey", "Amount"], vec![[1, 1, 10], [2, 2, 20], [1, 2, 5]]),
        ("Product", vec!["ProductKey", "RegionKey"], vec![[1, 1, 0], [2, 2, 0]]),
        ("Store", vec!["StoreKey", "RegionKey"], vec![[1, 2, 0], [2, 1, 0]]),
    ];
    for (name, columns, rows) in tables {
        let width = columns.len();
        let mut table = Table::new(name, columns);
        for row in rows {
            table
                .push_row(row[..width].iter().map(|&v| Value::from(v)).collect())
                .unwrap();
        }
        store.add_table(table).unwrap();
    }
    let mut regions = Table::new("Region", vec!["RegionKey", "Name"]);
    regions.push_row(vec![Value::from(1), Value::from("North")]).unwrap();
    regions.push_row(vec![Value::from(2), Value::from("South")]).unwrap();
    store.add_table(regions).unwrap();

    let mut model = DataModel::new(Arc::new(store));
    model
        .register_table(TableSchema::fact(
            "Sales",
            vec!["ProductKey", "StoreKey", "Amount"],
        ))
        .unwrap();
    model
        .register_table(TableSchema::dimension(
            "Product",
            vec!["ProductKey", "RegionKey"],
            "ProductKey",
        ))
        .unwrap();
    model
        .register_table(TableSchema::dimension(
            "Store",
            vec!["StoreKey", "RegionKey"],
            "StoreKey",
        ))
        .unwrap();
    model
        .register_table(TableSchema::dimension(
            "Region",
            vec!["RegionKey", "Name"],
            "RegionKey",
        ))
        .unwrap();
    model
        .register_relationship("Sales", "ProductKey", "Product", "ProductKey", true)
        .unwrap();
    model
        .register_relationship("Sales", "StoreKey", "Store", "StoreKey", true)
        .unwrap();
    model
        .register_relationship("Product", "RegionKey", "Region", "RegionKey", true)
        .unwrap();
    model
        .register_relationship("Store", "RegionKey", "Region", "RegionKey", true)
        .unwrap();
    model
}

#[test]
fn diamond_joins_are_ambiguous() {
    let mut model = diamond_model();
    let err = model
        .register_measure_text("Total Sales", "SUM(Sales[Amount])")
        .unwrap_err();
    match err {
        MeasureError::AmbiguousJoin { from, to, paths } => {
            assert_eq!((from.as_str(), to.as_str()), ("Sales", "Region"));
            assert_eq!(paths.len(), 2);
        }
        other => panic!("expected AmbiguousJoin, got {other:?}"),
    }
}

#[test]
fn userelationship_picks_a_diamond_path() {
    let mut model = diamond_model();
    model
        .register_measure_text(
            "Sales by Store Region",
            "CALCULATE(SUM(Sales[Amount]), USERELATIONSHIP(Store[RegionKey], Region[RegionKey]))",
        )
        .unwrap();
    model
        .register_measure_text(
            "Sales by Product Region",
            "CALCULATE(SUM(Sales[Amount]), USERELATIONSHIP(Product[RegionKey], Region[RegionKey]))",
        )
        .unwrap();

    let north = FilterContext::unrestricted().with_column_equals("Region", "Name", "North");
    assert_eq!(
        model.evaluate("Sales by Store Region", &north).unwrap(),
        Value::from(25)
    );
    assert_eq!(
        model.evaluate("Sales by Product Region", &north).unwrap(),
        Value::from(15)
    );
}

#[test]
fn two_active_relationships_between_the_same_tables() {
    let mut model = empty_model();
    let err = model
        .add_relationship(
            Relationship::new("Crimes", "Reported Date", "Date", "Date").with_name("by report"),
        )
        .unwrap_err();
    assert!(matches!(err, MeasureError::AmbiguousJoin { .. }));
}

#[test]
fn period_functions_need_a_date_table() {
    let mut model = DataModel::new(Arc::new(InMemoryStore::new()));
    model
        .register_table(TableSchema::dimension("Date", vec!["Date"], "Date"))
        .unwrap();
    model
        .register_table(TableSchema::fact("Crimes", vec!["Date"]))
        .unwrap();
    model
        .register_relationship("Crimes", "Date", "Date", "Date", true)
        .unwrap();

    assert!(matches!(
        model.register_measure_text(
            "Last Month",
            "CALCULATE(COUNTROWS(Crimes), PREVIOUSMONTH('Date'[Date]))"
        ),
        Err(MeasureError::NoDateTable)
    ));
}

#[test]
fn rank_over_a_fact_table_is_rejected() {
    let mut model = empty_model();
    assert!(matches!(
        model.register_measure_text("Row Rank", "RANKX(ALL(Crimes), 1)"),
        Err(MeasureError::Type(_))
    ));
}

#[test]
fn userelationship_must_name_a_relationship() {
    let mut model = build_model(&[]);
    assert!(matches!(
        model.register_measure_text(
            "By Type Date",
            "CALCULATE([Total Crimes], USERELATIONSHIP(Crimes[TypeKey], 'Date'[Date]))"
        ),
        Err(MeasureError::UnknownRelationship(_))
    ));
    model
        .register_measure_text(
            "By Report Date",
            "CALCULATE([Total Crimes], USERELATIONSHIP(Crimes[Reported Date], 'Date'[Date]))",
        )
        .unwrap();
}

#[test]
fn malformed_formulas_are_parse_errors() {
    let mut model = build_model(&[]);
    for formula in [
        "SUM(",
        "[Total Crimes] +",
        "undefined_name * 2",
        "'Crimes",
        "DIVIDE(1)",
    ] {
        assert!(
            matches!(
                model.register_measure_text("Broken", formula),
                Err(MeasureError::Parse(_))
            ),
            "{formula}"
        );
    }
    assert!(model.measure("Broken").is_none());
}

#[test]
fn registered_measures_keep_their_source_text() {
    let model = build_model(&[]);
    let measure = model.measure("arrest rate").unwrap();
    assert_eq!(measure.name, "Arrest Rate");
    assert_eq!(
        measure.expression.as_deref(),
        Some("DIVIDE([Total Arrests], [Total Crimes], 0) * 100")
    );
    assert!(measure.dependencies.contains("TOTAL ARRESTS"));
    assert!(measure.dependencies.contains("TOTAL CRIMES"));
}
