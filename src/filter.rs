//! Deciding which codes and patients make it into the datasets.
//!
//! Admission happens in two steps. First each code and patient id is tested against its keep and
//! ignore patterns. Then minimum support thresholds are applied to what is left:
//!
//! 1. drop patients with fewer than `min_codes` distinct admitted codes,
//! 2. recount, for each code, how many of the *surviving* patients have it, and drop codes
//!    supported by fewer than `min_patients` patients.
//!
//! By default this is done once. Dropping codes in step 2 can leave patients below `min_codes`
//! again; with [`FilterRounds::UntilStable`] the two steps repeat until nothing more is removed.
use crate::{config::Config, ArcStr, PatientId};
use itertools::Itertools;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

/// A keep list and an ignore list of patterns, for one kind of value (codes or patient ids).
///
/// Patterns are regular expressions anchored at the start of the value but not the end, so `C10`
/// matches `C10E`. No keep patterns means keep everything, no ignore patterns means ignore
/// nothing.
#[derive(Debug, Clone, Default)]
pub struct Admission {
    keep: Option<Regex>,
    ignore: Option<Regex>,
}

impl Admission {
    pub fn new(keep: &[String], ignore: &[String]) -> Result<Self, regex::Error> {
        Ok(Admission {
            keep: compile(keep)?,
            ignore: compile(ignore)?,
        })
    }

    pub fn admits(&self, value: &str) -> bool {
        let kept = match &self.keep {
            Some(re) => re.is_match(value),
            None => true,
        };
        let ignored = match &self.ignore {
            Some(re) => re.is_match(value),
            None => false,
        };
        kept && !ignored
    }
}

/// Build one regex that matches if any of the patterns match at the start of the input.
fn compile(patterns: &[String]) -> Result<Option<Regex>, regex::Error> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let alternatives = patterns.iter().map(|p| format!("(?:{})", p)).join("|");
    Regex::new(&format!("^(?:{})", alternatives)).map(Some)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FilterRounds {
    /// Prune patients, then codes, once.
    Single,
    /// Keep pruning until neither patients nor codes change.
    UntilStable,
}

/// Everything that decides membership of the catalog, plus the emission thresholds.
#[derive(Debug, Clone)]
pub struct Filters {
    pub codes: Admission,
    pub patients: Admission,
    pub min_codes: usize,
    pub min_patients: usize,
    pub min_visits: usize,
    pub min_years: usize,
    pub rounds: FilterRounds,
}

impl Default for Filters {
    fn default() -> Self {
        Filters {
            codes: Admission::default(),
            patients: Admission::default(),
            min_codes: 0,
            min_patients: 0,
            min_visits: 0,
            min_years: 0,
            rounds: FilterRounds::Single,
        }
    }
}

impl Filters {
    /// Compile the patterns in a configuration.
    ///
    /// Use [`Config::validate`] rather than calling this directly; it also checks the rest of the
    /// configuration.
    pub(crate) fn from_config(config: &Config) -> Result<Self, Vec<String>> {
        let mut errors = vec![];
        let codes = Admission::new(&config.codes_to_keep, &config.codes_to_ignore)
            .map_err(|e| errors.push(format!("invalid code pattern: {}", e)))
            .unwrap_or_default();
        let patients = Admission::new(&config.patients_to_keep, &config.patients_to_ignore)
            .map_err(|e| errors.push(format!("invalid patient pattern: {}", e)))
            .unwrap_or_default();
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Filters {
            codes,
            patients,
            min_codes: config.min_codes,
            min_patients: config.min_patients,
            min_visits: config.min_visits,
            min_years: config.min_years,
            rounds: if config.iterate_filters {
                FilterRounds::UntilStable
            } else {
                FilterRounds::Single
            },
        })
    }

    /// Whether an event for this patient and code passes the pattern lists.
    pub fn admits(&self, patient_id: &str, code: &str) -> bool {
        self.patients.admits(patient_id) && self.codes.admits(code)
    }

    /// Apply the support thresholds.
    ///
    /// `patient_codes` maps each patient to the distinct codes they have, after pattern filtering.
    pub fn prune(&self, mut patient_codes: BTreeMap<PatientId, BTreeSet<ArcStr>>) -> Pruned {
        let mut rounds = 0;
        let mut dropped_patients = 0;
        let mut dropped_codes = 0;
        loop {
            rounds += 1;

            let before = patient_codes.len();
            if self.min_codes > 0 {
                patient_codes.retain(|_, codes| codes.len() >= self.min_codes);
            }
            let patients_removed = before - patient_codes.len();
            dropped_patients += patients_removed;

            let support = code_support(&patient_codes);
            let removed = support
                .iter()
                .filter(|(_, count)| **count < self.min_patients)
                .map(|(code, _)| code.clone())
                .collect::<BTreeSet<_>>();
            dropped_codes += removed.len();
            for codes in patient_codes.values_mut() {
                codes.retain(|code| !removed.contains(code));
            }

            // Patients' code sets only change when codes are removed.
            if self.rounds == FilterRounds::Single || removed.is_empty() {
                let codes = support
                    .into_keys()
                    .filter(|code| !removed.contains(code))
                    .collect();
                return Pruned {
                    codes,
                    patients: patient_codes.into_keys().collect(),
                    rounds,
                    dropped_patients,
                    dropped_codes,
                };
            }
        }
    }
}

/// Number of patients each code appears for.
fn code_support(patient_codes: &BTreeMap<PatientId, BTreeSet<ArcStr>>) -> BTreeMap<ArcStr, usize> {
    let mut support = BTreeMap::new();
    for codes in patient_codes.values() {
        for code in codes {
            *support.entry(code.clone()).or_insert(0) += 1;
        }
    }
    support
}

/// The result of [`Filters::prune`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pruned {
    pub codes: BTreeSet<ArcStr>,
    pub patients: BTreeSet<PatientId>,
    pub rounds: usize,
    pub dropped_patients: usize,
    pub dropped_codes: usize,
}
