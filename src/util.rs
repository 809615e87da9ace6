use crate::{ArcStr, Sex};
use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer};
use std::{fs, io, path::Path};

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

/// All our tables are tab-separated, unquoted, and rows may differ in length (sparse tables).
pub fn tsv_writer<W: io::Write>(writer: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .flexible(true)
        .from_writer(writer)
}

// Helpers for serde to parse fields with quirks.

/// Date of birth, either as a full `YYYY-MM-DD` date or (more usually, for anonymity) just the
/// year. A year on its own is taken to mean 1st January.
pub fn birth_date<'de, D>(d: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(d)?;
    let s = s.trim();
    if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
        let year = s
            .parse::<i32>()
            .map_err(|e| de::Error::custom(format!("{}", e)))?;
        NaiveDate::from_ymd_opt(year, 1, 1)
            .ok_or_else(|| de::Error::custom(format!("year {} out of range", year)))
    } else {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| de::Error::custom(format!("invalid date of birth \"{}\": {}", s, e)))
    }
}

/// The `isMale` column: '1' for male and '0' for female. Anything else is an error, so we find out
/// if the coding changes.
pub fn is_male<'de, D>(d: D) -> Result<Sex, D::Error>
where
    D: Deserializer<'de>,
{
    let s: u8 = Deserialize::deserialize(d)?;
    match s {
        0 => Ok(Sex::Female),
        1 => Ok(Sex::Male),
        _ => Err(de::Error::custom("expected '0' or '1'")),
    }
}

/// Parse a string, but map "null" to `None` (in addition to the default "" -> None mapping)
pub fn optional_string(s: &str) -> Option<ArcStr> {
    if s.eq_ignore_ascii_case("null") || s.is_empty() {
        None
    } else {
        Some(s.into())
    }
}

#[cfg(test)]
mod test {
    use super::{birth_date, is_male, optional_string};
    use crate::Sex;
    use chrono::NaiveDate;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Row {
        #[serde(deserialize_with = "birth_date")]
        dob: NaiveDate,
        #[serde(deserialize_with = "is_male")]
        sex: Sex,
    }

    fn row(fields: &[&str]) -> Result<Row, csv::Error> {
        csv::StringRecord::from(fields.to_vec()).deserialize(None)
    }

    #[test]
    fn year_of_birth() {
        let row = row(&["1950", "1"]).unwrap();
        assert_eq!(row.dob, NaiveDate::from_ymd_opt(1950, 1, 1).unwrap());
        assert_eq!(row.sex, Sex::Male);
    }

    #[test]
    fn full_date_of_birth() {
        let row = row(&["1996-02-29", "0"]).unwrap();
        assert_eq!(row.dob, NaiveDate::from_ymd_opt(1996, 2, 29).unwrap());
        assert_eq!(row.sex, Sex::Female);
    }

    #[test]
    fn bad_fields() {
        assert!(row(&["null", "1"]).is_err());
        assert!(row(&["1950", "2"]).is_err());
    }

    #[test]
    fn nulls() {
        assert_eq!(optional_string("null"), None);
        assert_eq!(optional_string(""), None);
        assert_eq!(optional_string("1").as_deref(), Some("1"));
    }
}
