//! The second pass: turn each patient's run of events into per-visit, per-year and whole-history
//! records.
//!
//! Events arrive in journal order. All the events for a patient must be next to each other: when
//! the patient id changes we assume we have seen everything for the previous patient, build their
//! history, and forget their events. An id that turns up again later is treated as a new patient
//! (or rejected, in strict mode).
use crate::{
    catalog::{Catalog, CodeEntry, Slot},
    error::DatasetError,
    event::Event,
    patient::{Patient, Patients},
    PatientId,
};
use chrono::NaiveDate;
use itertools::Itertools;
use qu::ick_use::*;
use std::{
    collections::{BTreeMap, HashSet},
    mem,
};

/// Code counts and values for one bucket, keyed by catalog index.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CodeRecord {
    counts: BTreeMap<usize, u32>,
    val1: BTreeMap<usize, f64>,
    val2: BTreeMap<usize, f64>,
}

impl CodeRecord {
    fn record(&mut self, code_idx: usize, entry: &CodeEntry, event: &Event) {
        *self.counts.entry(code_idx).or_insert(0) += 1;
        // Only slots that are used somewhere get a column, so don't bother with the others.
        if entry.has_val1 {
            self.val1.insert(code_idx, event.val1);
        }
        if entry.has_val2 {
            self.val2.insert(code_idx, event.val2);
        }
    }

    /// Add a later record on to this one. Values from `later` replace ours.
    fn extend(&mut self, later: &CodeRecord) {
        for (idx, count) in &later.counts {
            *self.counts.entry(*idx).or_insert(0) += count;
        }
        self.val1.extend(later.val1.iter().map(|(k, v)| (*k, *v)));
        self.val2.extend(later.val2.iter().map(|(k, v)| (*k, *v)));
    }

    /// Number of times the code was recorded.
    pub fn count(&self, code_idx: usize) -> u32 {
        self.counts.get(&code_idx).copied().unwrap_or(0)
    }

    pub fn is_present(&self, code_idx: usize) -> bool {
        self.count(code_idx) > 0
    }

    /// The most recent value in the given slot, if the code was recorded.
    ///
    /// For [`Slot::Count`] this is the count.
    pub fn value(&self, code_idx: usize, slot: Slot) -> Option<f64> {
        match slot {
            Slot::Val1 => self.val1.get(&code_idx).copied(),
            Slot::Val2 => self.val2.get(&code_idx).copied(),
            Slot::Count => self.counts.get(&code_idx).map(|count| f64::from(*count)),
        }
    }

    /// `(code index, count)` for every recorded code, in catalog order.
    pub fn counts(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.counts.iter().map(|(idx, count)| (*idx, *count))
    }

    /// Number of distinct codes recorded.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// A group of events: a visit (all on one date) or a year of age.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    /// Date of the last event in the bucket.
    pub date: NaiveDate,
    /// Age of the patient on `date`.
    pub age: i32,
    /// This bucket on its own.
    pub record: CodeRecord,
    /// This bucket and all the ones before it.
    pub cumulative: CodeRecord,
}

/// Everything we output for one patient.
#[derive(Debug, Clone)]
pub struct PatientHistory<'a> {
    pub patient: &'a Patient,
    /// In date order. A visit's number is its position here.
    pub visits: Vec<Bucket>,
    /// In age order. Years without events are skipped.
    pub years: Vec<Bucket>,
    /// The whole history. `record` and `cumulative` are the same.
    pub history: Bucket,
}

impl<'a> PatientHistory<'a> {
    /// Build a patient's history from their events, in any order.
    ///
    /// Codes not in the catalog are ignored. Returns `None` if there are no events.
    pub fn build(patient: &'a Patient, mut events: Vec<Event>, catalog: &Catalog) -> Option<Self> {
        // Stable, so events on the same day keep their journal order.
        events.sort_by_key(|evt| evt.date);
        let visits = buckets(patient, &events, catalog, |evt| evt.date);
        let years = buckets(patient, &events, catalog, |evt| patient.age_at(evt.date));
        let last = visits.last()?;
        let history = Bucket {
            date: last.date,
            age: last.age,
            record: last.cumulative.clone(),
            cumulative: last.cumulative.clone(),
        };
        Some(PatientHistory {
            patient,
            visits,
            years,
            history,
        })
    }
}

/// Group date-sorted events into consecutive buckets with equal keys.
fn buckets<K: PartialEq>(
    patient: &Patient,
    events: &[Event],
    catalog: &Catalog,
    mut key: impl FnMut(&Event) -> K,
) -> Vec<Bucket> {
    let mut out = vec![];
    let mut cumulative = CodeRecord::default();
    for (_, group) in &events.iter().group_by(|evt| key(evt)) {
        let mut record = CodeRecord::default();
        let mut date = None;
        for event in group {
            date = Some(event.date);
            if let Some(idx) = catalog.index_of(&event.code) {
                record.record(idx, &catalog.codes()[idx], event);
            }
        }
        let Some(date) = date else {
            continue
        };
        cumulative.extend(&record);
        out.push(Bucket {
            date,
            age: patient.age_at(date),
            record,
            cumulative: cumulative.clone(),
        });
    }
    out
}

/// Collects one patient's events at a time.
///
/// Push admitted events in journal order. When an event for a different patient arrives, the
/// previous patient's [`PatientHistory`] is returned. Call [`HistoryAggregator::finish`] at the
/// end to get the last patient.
pub struct HistoryAggregator<'a> {
    catalog: &'a Catalog,
    patients: &'a Patients,
    current: Option<&'a Patient>,
    events: Vec<Event>,
    /// Only filled in strict mode.
    flushed: Option<HashSet<PatientId>>,
}

impl<'a> HistoryAggregator<'a> {
    pub fn new(catalog: &'a Catalog, patients: &'a Patients) -> Self {
        HistoryAggregator {
            catalog,
            patients,
            current: None,
            events: vec![],
            flushed: None,
        }
    }

    /// Fail if a patient turns up again after we've moved on from them.
    pub fn strict(mut self) -> Self {
        self.flushed = Some(HashSet::new());
        self
    }

    /// Add the next event.
    ///
    /// Fails if the event is for a patient not in the patient table.
    pub fn push(&mut self, event: Event) -> Result<Option<PatientHistory<'a>>> {
        let switching = match self.current {
            Some(patient) => patient.patient_id != event.patient_id,
            None => false,
        };
        let done = if switching { self.flush() } else { None };

        if self.current.is_none() {
            if let Some(flushed) = &self.flushed {
                if flushed.contains(&event.patient_id) {
                    return Err(DatasetError::PatientOutOfOrder {
                        patient_id: event.patient_id,
                    }
                    .into());
                }
            }
            self.current = Some(self.patients.require(&event.patient_id)?);
        }
        self.events.push(event);
        Ok(done)
    }

    /// Build the history for the last patient.
    pub fn finish(&mut self) -> Option<PatientHistory<'a>> {
        self.flush()
    }

    fn flush(&mut self) -> Option<PatientHistory<'a>> {
        let patient = self.current.take()?;
        let events = mem::take(&mut self.events);
        if let Some(flushed) = &mut self.flushed {
            flushed.insert(patient.patient_id.clone());
        }
        PatientHistory::build(patient, events, self.catalog)
    }
}

#[cfg(test)]
mod test {
    use super::{HistoryAggregator, PatientHistory};
    use crate::{
        catalog::{Catalog, CatalogBuilder, Slot},
        error::DatasetError,
        filter::Filters,
        sql::TableLayout,
        Event, Patients,
    };
    use chrono::NaiveDate;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn event(patient: &str, code: &str, day: &str, val1: f64) -> Event {
        Event {
            patient_id: patient.into(),
            code: code.into(),
            date: date(day),
            val1,
            val2: 0.,
            free_text: None,
        }
    }

    fn patients() -> Patients {
        let prefix = TableLayout::patient().prefix().to_string();
        let table = format!(
            "{p}1,'1950',0,1,null,0,0);\n{p}2,'1980-07-01',0,0,null,0,0);\n",
            p = prefix
        );
        Patients::load_sql(table.as_bytes()).unwrap()
    }

    fn catalog(events: &[Event]) -> Catalog {
        let filters = Filters::default();
        let mut builder = CatalogBuilder::new();
        for evt in events {
            builder.count_row();
            builder.observe(evt, &filters);
        }
        builder.finish(&filters)
    }

    #[test]
    fn visits_and_years() {
        let events = vec![
            event("1", "A", "2000-06-01", 0.),
            event("1", "A", "2000-01-01", 0.),
            event("1", "B", "2000-01-01", 0.),
            event("1", "A", "2000-12-01", 0.),
        ];
        let catalog = catalog(&events);
        let patients = patients();
        let patient = patients.find_by_id("1").unwrap();
        let history = PatientHistory::build(patient, events, &catalog).unwrap();
        let (a, b) = (catalog.index_of("A").unwrap(), catalog.index_of("B").unwrap());

        assert_eq!(history.visits.len(), 3);
        let first = &history.visits[0];
        assert_eq!(first.date, date("2000-01-01"));
        // not 50 until the day after the birthday
        assert_eq!(first.age, 49);
        assert_eq!((first.record.count(a), first.record.count(b)), (1, 1));
        assert_eq!(history.visits[1].record.count(b), 0);
        assert_eq!(history.visits[1].cumulative.count(a), 2);
        assert!(history.visits[1].cumulative.is_present(b));

        // 2000-01-01 is age 49, the other two dates are 50
        assert_eq!(history.years.len(), 2);
        assert_eq!(history.years[0].age, 49);
        assert_eq!(history.years[1].age, 50);
        assert_eq!(history.years[1].record.count(a), 2);
        assert_eq!(history.years[1].date, date("2000-12-01"));

        assert_eq!(history.history.age, 50);
        assert_eq!(history.history.record.count(a), 3);
        assert_eq!(history.history.record.len(), 2);
    }

    #[test]
    fn last_cumulative_bucket_is_the_history() {
        let events = vec![
            event("2", "A", "1999-01-01", 1.),
            event("2", "C", "2003-09-09", 0.),
            event("2", "B", "2001-05-05", 2.),
            event("2", "A", "2001-05-05", 3.),
        ];
        let catalog = catalog(&events);
        let patients = patients();
        let patient = patients.find_by_id("2").unwrap();
        let history = PatientHistory::build(patient, events, &catalog).unwrap();
        assert_eq!(history.visits.last().unwrap().cumulative, history.history.record);
        assert_eq!(history.years.last().unwrap().cumulative, history.history.record);
    }

    #[test]
    fn raw_values_are_the_latest() {
        let events = vec![
            event("1", "BP", "2000-02-01", 130.),
            event("1", "BP", "2000-02-01", 125.),
            event("1", "X", "2000-02-01", 0.),
            event("1", "BP", "2000-03-01", 0.),
            event("1", "X", "2000-04-01", 0.),
        ];
        let catalog = catalog(&events);
        let patients = patients();
        let patient = patients.find_by_id("1").unwrap();
        let history = PatientHistory::build(patient, events, &catalog).unwrap();
        let bp = catalog.index_of("BP").unwrap();
        let x = catalog.index_of("X").unwrap();

        assert_eq!(history.visits[0].record.value(bp, Slot::Val1), Some(125.));
        // a recorded zero is still a value
        assert_eq!(history.visits[1].record.value(bp, Slot::Val1), Some(0.));
        assert_eq!(history.visits[2].record.value(bp, Slot::Val1), None);
        assert_eq!(history.visits[2].cumulative.value(bp, Slot::Val1), Some(0.));
        // X never has a value so has no value slots
        assert_eq!(history.visits[0].record.value(x, Slot::Val1), None);
        assert_eq!(history.history.record.value(x, Slot::Count), Some(2.));
    }

    #[test]
    fn patients_are_flushed_on_change() {
        let events = vec![
            event("1", "A", "2000-01-01", 0.),
            event("1", "B", "2000-01-02", 0.),
            event("2", "A", "2000-01-01", 0.),
        ];
        let catalog = catalog(&events);
        let patients = patients();
        let mut agg = HistoryAggregator::new(&catalog, &patients);
        let mut done = vec![];
        for evt in events {
            done.extend(agg.push(evt).unwrap());
        }
        assert_eq!(done.len(), 1);
        assert_eq!(&*done[0].patient.patient_id, "1");
        assert_eq!(done[0].visits.len(), 2);

        let last = agg.finish().unwrap();
        assert_eq!(&*last.patient.patient_id, "2");
        assert!(agg.finish().is_none());
    }

    #[test]
    fn out_of_order_patients() {
        let events = vec![
            event("1", "A", "2000-01-01", 0.),
            event("2", "A", "2000-01-01", 0.),
            event("1", "A", "2000-01-02", 0.),
        ];
        let catalog = catalog(&events);
        let patients = patients();

        let mut agg = HistoryAggregator::new(&catalog, &patients);
        let mut count = 0;
        for evt in events.clone() {
            count += agg.push(evt).unwrap().into_iter().count();
        }
        count += agg.finish().into_iter().count();
        assert_eq!(count, 3);

        let mut agg = HistoryAggregator::new(&catalog, &patients).strict();
        agg.push(events[0].clone()).unwrap();
        agg.push(events[1].clone()).unwrap();
        let err = agg.push(events[2].clone()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::PatientOutOfOrder { .. })
        ));
    }

    #[test]
    fn unknown_patient_is_fatal() {
        let events = vec![event("3", "A", "2000-01-01", 0.)];
        let catalog = catalog(&events);
        let patients = patients();
        let mut agg = HistoryAggregator::new(&catalog, &patients);
        let err = agg.push(events[0].clone()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::MissingPatient { .. })
        ));
    }
}
