use crate::{error::DatasetError, ArcStr, PatientId};
use chrono::NaiveDate;
use qu::ick_use::*;

/// A patient/code association from the journal table.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub patient_id: PatientId,
    pub code: ArcStr,
    pub date: NaiveDate,
    pub val1: f64,
    pub val2: f64,
    pub free_text: Option<ArcStr>,
}

impl Event {
    /// Build an event from the fields of one journal row.
    ///
    /// Returns `Ok(None)` when the row has no patient id or no code; such rows are dropped. Some
    /// codes carry their values inline (`2469,v=130,w=80`): only the part before the first comma
    /// is the code, the values are taken from the value columns as usual.
    ///
    /// Dates and values that don't parse are errors, with `line` used for reporting.
    pub fn from_fields(fields: &[String], line: usize) -> Result<Option<Self>> {
        let [patient_id, code, date, val1, val2, free_text] = fields else {
            bail!(
                "line {}: expected 6 journal fields, found {}",
                line,
                fields.len()
            );
        };

        let code = code.split(',').next().unwrap_or("").trim();
        let patient_id = patient_id.trim();
        if code.is_empty() || patient_id.is_empty() {
            return Ok(None);
        }

        let date = parse_date(date, line)?;
        let val1 = parse_value(val1, line)?;
        let val2 = parse_value(val2, line)?;
        let free_text = if is_null(free_text) {
            None
        } else {
            Some(ArcStr::from(free_text.as_str()))
        };

        Ok(Some(Event {
            patient_id: patient_id.into(),
            code: code.into(),
            date,
            val1,
            val2,
            free_text,
        }))
    }
}

fn parse_date(input: &str, line: usize) -> Result<NaiveDate, DatasetError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").map_err(|_| DatasetError::InvalidDate {
        value: input.into(),
        line,
    })
}

/// Missing values are recorded as `null` in the export; they count as 0.
fn parse_value(input: &str, line: usize) -> Result<f64, DatasetError> {
    if is_null(input) {
        return Ok(0.);
    }
    input
        .trim()
        .parse::<f64>()
        .map_err(|_| DatasetError::InvalidValue {
            value: input.into(),
            line,
        })
}

fn is_null(input: &str) -> bool {
    let input = input.trim();
    input.is_empty() || input.eq_ignore_ascii_case("null")
}
