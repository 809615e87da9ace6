//! Run configuration.
//!
//! ```json
//! {
//!     "CodesToKeep": ["C10", "2469"],
//!     "CodesToIgnore": ["C10E"],
//!     "MinCodes": 2,
//!     "MinPatients": 10,
//!     "Outputs": { "Axes": ["History", "YearsCumulative"], "Measures": ["CodeCount"] }
//! }
//! ```
//!
//! Every key is optional. The same keys can be written in TOML.
use crate::{
    error::DatasetError,
    filter::Filters,
    output::{Axis, Encoding, Measure},
};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct Config {
    pub codes_to_keep: Vec<String>,
    pub codes_to_ignore: Vec<String>,
    pub patients_to_keep: Vec<String>,
    pub patients_to_ignore: Vec<String>,
    /// Patients with fewer distinct codes than this are dropped.
    pub min_codes: usize,
    /// Codes seen for fewer patients than this are dropped.
    pub min_patients: usize,
    /// Patients with fewer visits than this get no rows in the visit tables.
    pub min_visits: usize,
    /// Patients whose history spans fewer years of age than this get no rows in the year tables.
    pub min_years: usize,
    /// Dates in rebased tables are counted in days from the 1st of January of this year.
    #[serde(rename = "Year0")]
    pub year_0: i32,
    pub iterate_filters: bool,
    pub strict_patient_order: bool,
    pub outputs: Outputs,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            codes_to_keep: vec![],
            codes_to_ignore: vec![],
            patients_to_keep: vec![],
            patients_to_ignore: vec![],
            min_codes: 0,
            min_patients: 0,
            min_visits: 0,
            min_years: 0,
            year_0: 1950,
            iterate_filters: false,
            strict_patient_order: false,
            outputs: Outputs::default(),
        }
    }
}

/// Which tables to write. Every combination of axis, measure and encoding is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields, default)]
pub struct Outputs {
    pub axes: Vec<Axis>,
    pub measures: Vec<Measure>,
    pub encodings: Vec<Encoding>,
    pub rebased: bool,
}

impl Default for Outputs {
    fn default() -> Self {
        Outputs {
            axes: Axis::ALL.to_vec(),
            measures: vec![Measure::Count, Measure::Binary],
            encodings: vec![Encoding::Dense],
            rebased: false,
        }
    }
}

impl Config {
    /// Load from a `.json` or `.toml` file, depending on the extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<Config> {
            let text = fs::read_to_string(path)?;
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => serde_json::from_str(&text).map_err(Error::from),
                Some("toml") => toml::from_str(&text).map_err(Error::from),
                _ => bail!("expected a `.json` or `.toml` file"),
            }
        }
        let path = path.as_ref();
        inner(path).with_context(|| format!("loading configuration \"{}\"", path.display()))
    }

    /// Check the whole configuration, and compile the filters if it is OK.
    ///
    /// All problems are reported at once.
    pub fn validate(&self) -> Result<Filters, DatasetError> {
        let mut errors = vec![];

        for (what, keep, ignore) in [
            ("Codes", &self.codes_to_keep, &self.codes_to_ignore),
            ("Patients", &self.patients_to_keep, &self.patients_to_ignore),
        ] {
            for pattern in keep.iter().filter(|p| ignore.contains(p)) {
                errors.push(format!(
                    "\"{}\" is in both {}ToKeep and {}ToIgnore",
                    pattern, what, what
                ));
            }
            if ignore.iter().any(|p| p.is_empty()) {
                errors.push(format!(
                    "an empty pattern in {}ToIgnore would ignore everything",
                    what
                ));
            }
        }

        if !(1000..=9999).contains(&self.year_0) {
            errors.push(format!("Year0 must be a four-digit year, found {}", self.year_0));
        }

        let outputs = &self.outputs;
        if outputs.axes.is_empty() {
            errors.push("Outputs.Axes is empty, so nothing would be written".into());
        }
        if outputs.measures.is_empty() {
            errors.push("Outputs.Measures is empty, so nothing would be written".into());
        }
        if outputs.encodings.is_empty() {
            errors.push("Outputs.Encodings is empty, so nothing would be written".into());
        }
        if self.min_visits > 0 && !outputs.axes.iter().any(|axis| axis.is_visits()) {
            errors.push("MinVisits is set but no visit table is written".into());
        }
        if self.min_years > 0 && !outputs.axes.iter().any(|axis| axis.is_years()) {
            errors.push("MinYears is set but no year table is written".into());
        }

        let filters = Filters::from_config(self).map_err(|e| errors.extend(e)).ok();
        match filters {
            Some(filters) if errors.is_empty() => Ok(filters),
            _ => Err(DatasetError::InvalidConfig(errors)),
        }
    }
}
