//! The first pass over the journal: which codes exist, which carry values, and who has them.
use crate::{
    event::Event,
    filter::{Filters, Pruned},
    util::tsv_writer,
    ArcStr, PatientId,
};
use qu::ick_use::*;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
    io::{self, Write},
};

/// Counters reported at the end of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    /// Row lines in the journal, whether or not they held a usable event.
    pub events: usize,
    /// Rows with both a patient id and a code.
    pub valid_events: usize,
    pub unique_patients: usize,
    pub unique_codes: usize,
}

impl Statistics {
    /// Write the counters as `Statistics.txt`: one sentence per line.
    pub fn write(&self, mut writer: impl io::Write) -> Result {
        write!(writer, "{}", self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn log(&self) {
        event!(Level::INFO, "{} events found in the dataset", self.events);
        event!(Level::INFO, "{} valid events found in the dataset", self.valid_events);
        event!(Level::INFO, "{} unique patients found in the dataset", self.unique_patients);
        event!(Level::INFO, "{} unique codes found in the dataset", self.unique_codes);
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{} events found in the dataset.", self.events)?;
        writeln!(f, "{} valid events found in the dataset.", self.valid_events)?;
        writeln!(f, "{} unique patients found in the dataset.", self.unique_patients)?;
        writeln!(f, "{} unique codes found in the dataset.", self.unique_codes)
    }
}

/// Whether a code's value slots are ever used.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ValueFlags {
    val1: bool,
    val2: bool,
}

/// Collects what the first pass sees.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    /// Distinct admitted codes per patient.
    patient_codes: BTreeMap<PatientId, BTreeSet<ArcStr>>,
    /// Value flags per patient, so patients dropped by the thresholds don't contribute.
    flags: HashMap<PatientId, HashMap<ArcStr, ValueFlags>>,
    seen_patients: HashSet<PatientId>,
    seen_codes: HashSet<ArcStr>,
    events: usize,
    valid_events: usize,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a journal row, before we know if it holds a valid event.
    pub fn count_row(&mut self) {
        self.events += 1;
    }

    /// Record a valid event. It only contributes to the catalog if the pattern filters admit it.
    pub fn observe(&mut self, event: &Event, filters: &Filters) {
        self.valid_events += 1;
        if !self.seen_patients.contains(&event.patient_id) {
            self.seen_patients.insert(event.patient_id.clone());
        }
        if !self.seen_codes.contains(&event.code) {
            self.seen_codes.insert(event.code.clone());
        }
        if !filters.admits(&event.patient_id, &event.code) {
            return;
        }

        let codes = self
            .patient_codes
            .entry(event.patient_id.clone())
            .or_default();
        if !codes.contains(&event.code) {
            codes.insert(event.code.clone());
        }
        if event.val1 != 0. || event.val2 != 0. {
            let flags = self
                .flags
                .entry(event.patient_id.clone())
                .or_default()
                .entry(event.code.clone())
                .or_default();
            flags.val1 |= event.val1 != 0.;
            flags.val2 |= event.val2 != 0.;
        }
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            events: self.events,
            valid_events: self.valid_events,
            unique_patients: self.seen_patients.len(),
            unique_codes: self.seen_codes.len(),
        }
    }

    /// Apply the support thresholds and fix the column order.
    pub fn finish(self, filters: &Filters) -> Catalog {
        let statistics = self.statistics();
        let candidates = self.patient_codes.len();
        let Pruned {
            codes,
            patients,
            rounds,
            dropped_patients,
            dropped_codes,
        } = filters.prune(self.patient_codes);
        event!(
            Level::INFO,
            "catalog has {} codes and {} of {} patients ({} patients and {} codes dropped \
             by the minimum support thresholds in {} round(s))",
            codes.len(),
            patients.len(),
            candidates,
            dropped_patients,
            dropped_codes,
            rounds
        );

        let mut code_flags: HashMap<ArcStr, ValueFlags> = HashMap::new();
        for (patient_id, flags) in self.flags {
            if !patients.contains(&patient_id) {
                continue;
            }
            for (code, patient_flags) in flags {
                let flags = code_flags.entry(code).or_default();
                flags.val1 |= patient_flags.val1;
                flags.val2 |= patient_flags.val2;
            }
        }

        // `BTreeSet` iterates in sorted order, which fixes the column order.
        let codes = codes
            .into_iter()
            .map(|code| {
                let flags = code_flags.get(&code).copied().unwrap_or_default();
                CodeEntry {
                    code,
                    has_val1: flags.val1,
                    has_val2: flags.val2,
                }
            })
            .collect::<Vec<_>>();
        Catalog::new(codes, patients, statistics)
    }
}

/// An admitted code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeEntry {
    pub code: ArcStr,
    pub has_val1: bool,
    pub has_val2: bool,
}

/// Which value a raw data column holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Slot {
    Val1,
    Val2,
    /// The code never carries a value, so the column holds the number of times it was recorded.
    Count,
}

/// A column of the raw data tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    /// Index of the code in [`Catalog::codes`].
    pub code_idx: usize,
    pub slot: Slot,
}

/// The admitted codes, in output order, and the admitted patients.
///
/// Read-only once built.
#[derive(Debug)]
pub struct Catalog {
    codes: Vec<CodeEntry>,
    code_idx: HashMap<ArcStr, usize>,
    raw_columns: Vec<RawColumn>,
    patients: BTreeSet<PatientId>,
    statistics: Statistics,
}

impl Catalog {
    fn new(codes: Vec<CodeEntry>, patients: BTreeSet<PatientId>, statistics: Statistics) -> Self {
        let code_idx = codes
            .iter()
            .enumerate()
            .map(|(idx, entry)| (entry.code.clone(), idx))
            .collect();
        let mut raw_columns = vec![];
        for (code_idx, entry) in codes.iter().enumerate() {
            if entry.has_val1 {
                raw_columns.push(RawColumn {
                    code_idx,
                    slot: Slot::Val1,
                });
            }
            if entry.has_val2 {
                raw_columns.push(RawColumn {
                    code_idx,
                    slot: Slot::Val2,
                });
            }
            if !(entry.has_val1 || entry.has_val2) {
                raw_columns.push(RawColumn {
                    code_idx,
                    slot: Slot::Count,
                });
            }
        }
        Catalog {
            codes,
            code_idx,
            raw_columns,
            patients,
            statistics,
        }
    }

    pub fn codes(&self) -> &[CodeEntry] {
        &self.codes
    }

    pub fn index_of(&self, code: &str) -> Option<usize> {
        self.code_idx.get(code).copied()
    }

    pub fn raw_columns(&self) -> &[RawColumn] {
        &self.raw_columns
    }

    /// The header name of a raw data column.
    pub fn raw_column_name(&self, column: &RawColumn) -> String {
        let code = &self.codes[column.code_idx].code;
        match column.slot {
            Slot::Val1 => format!("{}_Val1", code),
            Slot::Val2 => format!("{}_Val2", code),
            Slot::Count => code.to_string(),
        }
    }

    pub fn admits_patient(&self, patient_id: &str) -> bool {
        self.patients.contains(patient_id)
    }

    /// Number of admitted patients.
    pub fn patient_count(&self) -> usize {
        self.patients.len()
    }

    /// Counters from the pass that built this catalog.
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Write `Codes.txt`.
    pub fn write_codes(&self, writer: impl io::Write) -> Result {
        let mut out = tsv_writer(writer);
        out.write_record(["Code", "HasVal1Value", "HasVal2Value"])?;
        for entry in &self.codes {
            out.write_record([
                &*entry.code,
                flag(entry.has_val1),
                flag(entry.has_val2),
            ])?;
        }
        out.flush()?;
        Ok(())
    }

    /// Write the code to index mapping used by the sparse count and binary tables.
    pub fn write_code_index(&self, writer: impl io::Write) -> Result {
        let mut out = tsv_writer(writer);
        out.write_record(["Code", "Index"])?;
        for (idx, entry) in self.codes.iter().enumerate() {
            out.write_record([entry.code.to_string(), idx.to_string()])?;
        }
        out.flush()?;
        Ok(())
    }

    /// Write the column to index mapping used by the sparse raw data tables.
    pub fn write_raw_column_index(&self, writer: impl io::Write) -> Result {
        let mut out = tsv_writer(writer);
        out.write_record(["Column", "Index"])?;
        for (idx, column) in self.raw_columns.iter().enumerate() {
            out.write_record([self.raw_column_name(column), idx.to_string()])?;
        }
        out.flush()?;
        Ok(())
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}
