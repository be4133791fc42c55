mod common;

use common::{assert_number, build_model, crime, date, Crime};
use formula_measures::{FilterContext, Predicate, Value};
use pretty_assertions::assert_eq;

fn ten_crimes_three_arrests() -> Vec<Crime> {
    let day = date(2024, 3, 1);
    let mut crimes = crime(day).arrested().times(3);
    crimes.extend(crime(day).times(7));
    crimes
}

#[test]
fn arrest_rate_over_ten_crimes_with_three_arrests() {
    let model = build_model(&ten_crimes_three_arrests());
    let ctx = FilterContext::unrestricted();

    assert_eq!(model.evaluate("Total Crimes", &ctx).unwrap(), Value::from(10));
    assert_eq!(model.evaluate("Total Arrests", &ctx).unwrap(), Value::from(3));
    assert_number(&model.evaluate("Arrest Rate", &ctx).unwrap(), 30.0);
}

#[test]
fn arrest_rate_is_zero_when_nothing_is_selected() {
    let model = build_model(&ten_crimes_three_arrests());
    let nowhere = FilterContext::unrestricted().with_column_equals("Location", "District", "Z");

    assert_eq!(model.evaluate("Total Crimes", &nowhere).unwrap(), Value::from(0));
    assert_eq!(model.evaluate("Arrest Rate", &nowhere).unwrap(), Value::from(0));

    let empty = build_model(&[]);
    assert_eq!(
        empty
            .evaluate("Arrest Rate", &FilterContext::unrestricted())
            .unwrap(),
        Value::from(0)
    );
}

#[test]
fn measure_names_are_case_insensitive() {
    let model = build_model(&ten_crimes_three_arrests());
    let ctx = FilterContext::unrestricted();
    assert_eq!(
        model.evaluate("total crimes", &ctx).unwrap(),
        model.evaluate("[Total Crimes]", &ctx).unwrap()
    );
}

#[test]
fn domestic_and_violent_shares() {
    let day = date(2024, 5, 2);
    let crimes = vec![
        crime(day).domestic(),
        crime(day),
        crime(day).of_type(2),
        crime(day).of_type(3),
    ];
    let model = build_model(&crimes);
    let ctx = FilterContext::unrestricted();

    assert_eq!(model.evaluate("Domestic Crimes", &ctx).unwrap(), Value::from(1));
    assert_number(&model.evaluate("Domestic %", &ctx).unwrap(), 25.0);
    assert_eq!(model.evaluate("Violent Crimes", &ctx).unwrap(), Value::from(2));
    assert_number(&model.evaluate("Violent %", &ctx).unwrap(), 50.0);

    // KEEPFILTERS intersects with the incoming crime type selection.
    let thefts = ctx.with_column_equals("Crime Type", "Primary Type", "THEFT");
    assert_eq!(model.evaluate("Violent Crimes", &thefts).unwrap(), Value::from(0));
    assert_eq!(model.evaluate("Violent %", &thefts).unwrap(), Value::from(0));
}

#[test]
fn average_response_time_skips_missing_values() {
    let day = date(2024, 1, 9);
    let model = build_model(&[
        crime(day).response(10.0),
        crime(day).response(20.0),
        crime(day),
    ]);
    assert_number(
        &model
            .evaluate("Avg Response Time", &FilterContext::unrestricted())
            .unwrap(),
        15.0,
    );
}

#[test]
fn crimes_per_day_over_a_month() {
    let mut crimes = Vec::new();
    for d in 1..=31 {
        crimes.extend(crime(date(2024, 3, d)).times(2));
    }
    let model = build_model(&crimes);
    let march = FilterContext::unrestricted()
        .with_column_equals("Date", "Year", 2024)
        .with_column_equals("Date", "Month", 3);

    assert_eq!(model.evaluate("Days In Period", &march).unwrap(), Value::from(31));
    assert_number(&model.evaluate("Avg Crimes Per Day", &march).unwrap(), 2.0);
}

#[test]
fn crime_density_per_thousand_residents() {
    let day = date(2024, 7, 4);
    let mut crimes = crime(day).at(1).times(50);
    crimes.extend(crime(day).at(2).times(20));
    let model = build_model(&crimes);

    let by_district = model
        .evaluate_by(
            "Crime Density",
            "Location",
            "District",
            &FilterContext::unrestricted(),
        )
        .unwrap();
    let members: Vec<Value> = by_district.iter().map(|(m, _)| m.clone()).collect();
    assert_eq!(members, vec![Value::from("A"), Value::from("B")]);
    assert_number(by_district[0].1.as_ref().unwrap(), 50.0);
    assert_number(by_district[1].1.as_ref().unwrap(), 10.0);
}

#[test]
fn crime_type_rank_is_dense_and_descending() {
    let day = date(2024, 2, 1);
    let mut crimes = crime(day).of_type(1).times(50);
    crimes.extend(crime(day).of_type(2).times(20));
    crimes.extend(crime(day).of_type(3).times(50));
    let model = build_model(&crimes);

    let ranks: Vec<(Value, Value)> = model
        .evaluate_by(
            "Crime Type Rank",
            "Crime Type",
            "Primary Type",
            &FilterContext::unrestricted(),
        )
        .unwrap()
        .into_iter()
        .map(|(member, rank)| (member, rank.unwrap()))
        .collect();

    assert_eq!(
        ranks,
        vec![
            (Value::from("BATTERY"), Value::from(2)),
            (Value::from("NARCOTICS"), Value::from(3)),
            (Value::from("ROBBERY"), Value::from(1)),
            (Value::from("THEFT"), Value::from(1)),
        ]
    );
}

#[test]
fn crime_type_shares_add_up_to_the_whole() {
    let day = date(2024, 2, 1);
    let mut crimes = crime(day).of_type(1).times(6);
    crimes.extend(crime(day).of_type(2).times(3));
    crimes.push(crime(day).of_type(3));
    let model = build_model(&crimes);

    let shares = model
        .evaluate_by(
            "Crime Type Share %",
            "Crime Type",
            "Primary Type",
            &FilterContext::unrestricted(),
        )
        .unwrap();
    let expected = [
        ("BATTERY", 30.0),
        ("NARCOTICS", 0.0),
        ("ROBBERY", 10.0),
        ("THEFT", 60.0),
    ];
    assert_eq!(shares.len(), expected.len());
    let mut total = 0.0;
    for ((member, share), (name, pct)) in shares.iter().zip(expected) {
        assert_eq!(*member, Value::from(name));
        let share = share.as_ref().unwrap();
        assert_number(share, pct);
        total += share.as_number().unwrap();
    }
    assert!((total - 100.0).abs() < 1e-9, "{total}");
}

#[test]
fn rank_ties_can_skip() {
    let day = date(2024, 2, 1);
    let mut crimes = crime(day).of_type(1).times(5);
    crimes.extend(crime(day).of_type(2).times(2));
    crimes.extend(crime(day).of_type(3).times(5));
    let model = build_model(&crimes);

    let battery = FilterContext::unrestricted().override_with(
        "Crime Type",
        Predicate::equals("Primary Type", "BATTERY"),
    );
    assert_eq!(
        model
            .evaluate_text("RANKX(ALL('Crime Type'), [Total Crimes], DESC, SKIP)", &battery)
            .unwrap(),
        Value::from(3)
    );
    assert_eq!(
        model
            .evaluate_text("RANKX(ALL('Crime Type'), [Total Crimes], ASC)", &battery)
            .unwrap(),
        Value::from(2)
    );
}
