//! The crime dashboard measure pack.
//!
//! Every measure is defined as formula text against table and column names taken from a
//! [`CrimeSchema`], so the same pack works over differently named models.

use crate::error::MeasureResult;
use crate::measure::MeasureDefinition;
use crate::model::DataModel;

/// Names of the tables and columns the crime measures read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrimeSchema {
    /// Fact table, one row per reported crime.
    pub crimes: String,
    /// Boolean fact column: an arrest was made.
    pub arrest: String,
    /// Boolean fact column: the incident was domestic.
    pub domestic: String,
    /// Numeric fact column: minutes between report and response.
    pub response_minutes: String,
    pub date_table: String,
    pub date_column: String,
    pub location: String,
    /// Resident count per location, used for density.
    pub population: String,
    pub crime_type: String,
    pub primary_type: String,
    /// Primary types counted as violent.
    pub violent_types: Vec<String>,
}

impl Default for CrimeSchema {
    fn default() -> Self {
        Self {
            crimes: "Crimes".into(),
            arrest: "Arrest".into(),
            domestic: "Domestic".into(),
            response_minutes: "Response Minutes".into(),
            date_table: "Date".into(),
            date_column: "Date".into(),
            location: "Location".into(),
            population: "Population".into(),
            crime_type: "Crime Type".into(),
            primary_type: "Primary Type".into(),
            violent_types: ["HOMICIDE", "ASSAULT", "BATTERY", "ROBBERY", "CRIM SEXUAL ASSAULT"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl CrimeSchema {
    fn table(name: &str) -> String {
        format!("'{}'", name.replace('\'', "''"))
    }

    fn column(table: &str, column: &str) -> String {
        format!("{}[{}]", Self::table(table), column.replace(']', "]]"))
    }

    fn crimes(&self) -> String {
        Self::table(&self.crimes)
    }

    fn fact_column(&self, column: &str) -> String {
        Self::column(&self.crimes, column)
    }

    fn date(&self) -> String {
        Self::column(&self.date_table, &self.date_column)
    }

    /// `(name, formula)` for every measure in the pack, in dashboard order.
    pub fn definitions(&self) -> Vec<(&'static str, String)> {
        let crimes = self.crimes();
        let date = self.date();
        let violent_list = self
            .violent_types
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(", ");

        vec![
            ("Total Crimes", format!("COUNTROWS({crimes})")),
            (
                "Total Arrests",
                format!(
                    "COUNTROWS(FILTER({crimes}, {} = TRUE()))",
                    self.fact_column(&self.arrest)
                ),
            ),
            (
                "Arrest Rate",
                "DIVIDE([Total Arrests], [Total Crimes], 0) * 100".to_string(),
            ),
            (
                "Domestic Crimes",
                format!(
                    "COUNTROWS(FILTER({crimes}, {} = TRUE()))",
                    self.fact_column(&self.domestic)
                ),
            ),
            (
                "Domestic %",
                "DIVIDE([Domestic Crimes], [Total Crimes], 0) * 100".to_string(),
            ),
            (
                "Violent Crimes",
                format!(
                    "CALCULATE([Total Crimes], KEEPFILTERS({} IN {{{violent_list}}}))",
                    Self::column(&self.crime_type, &self.primary_type)
                ),
            ),
            (
                "Violent %",
                "DIVIDE([Violent Crimes], [Total Crimes], 0) * 100".to_string(),
            ),
            (
                "Avg Response Time",
                format!("AVERAGE({})", self.fact_column(&self.response_minutes)),
            ),
            (
                "Days In Period",
                format!("COUNTROWS({})", Self::table(&self.date_table)),
            ),
            (
                "Avg Crimes Per Day",
                "DIVIDE([Total Crimes], [Days In Period], 0)".to_string(),
            ),
            (
                "Crimes SPLY",
                format!("CALCULATE([Total Crimes], SAMEPERIODLASTYEAR({date}))"),
            ),
            (
                "YoY Change %",
                "VAR prior = [Crimes SPLY] \
                 RETURN DIVIDE([Total Crimes] - prior, prior, BLANK()) * 100"
                    .to_string(),
            ),
            ("Crimes MTD", format!("TOTALMTD([Total Crimes], {date})")),
            ("Crimes YTD", format!("TOTALYTD([Total Crimes], {date})")),
            (
                "Crimes Previous Month",
                format!("CALCULATE([Total Crimes], PREVIOUSMONTH({date}))"),
            ),
            (
                "7 Day Moving Avg",
                format!(
                    "AVERAGEX(DATESINPERIOD({date}, MAX({date}), -7, DAY), [Total Crimes])"
                ),
            ),
            (
                "Crime Density",
                format!(
                    "DIVIDE([Total Crimes], SUM({}), 0) * 1000",
                    Self::column(&self.location, &self.population)
                ),
            ),
            (
                "Crime Type Rank",
                format!(
                    "RANKX(ALL({}), [Total Crimes], DESC, DENSE)",
                    Self::table(&self.crime_type)
                ),
            ),
            (
                "Crime Type Share %",
                format!(
                    "DIVIDE([Total Crimes], CALCULATE([Total Crimes], ALL({})), 0) * 100",
                    Self::table(&self.crime_type)
                ),
            ),
        ]
    }
}

/// Register the crime dashboard measures on `model` as one batch.
pub fn register_crime_kpis(model: &mut DataModel, schema: &CrimeSchema) -> MeasureResult<()> {
    let mut definitions = Vec::new();
    for (name, formula) in schema.definitions() {
        let expr = crate::parser::parse(&formula)?;
        definitions.push(MeasureDefinition::new(name, expr).with_expression(formula));
    }
    log::debug!("registering {} crime measures", definitions.len());
    model.register_measures(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_formula_parses() {
        for (name, formula) in CrimeSchema::default().definitions() {
            assert!(
                crate::parser::parse(&formula).is_ok(),
                "{name}: {formula}"
            );
        }
    }

    #[test]
    fn names_with_quotes_are_escaped() {
        assert_eq!(CrimeSchema::column("O'Hare", "A]B"), "'O''Hare'[A]]B]");
    }
}
