//! Writing the dataset tables.
//!
//! Every table starts with the identifying columns `PatientID`, `Age`, `Gender` (then
//! `DaysAfterJan_<year>` in rebased tables, then any disease indicators). After that:
//!
//! - dense tables have one column per catalog code (or per raw data column), in catalog order,
//! - sparse tables have `NumberOfCodes` and then one `index:value` cell per recorded code. The
//!   index refers to `CodeIndexMap.tsv` (or `RawColumnIndexMap.tsv` for raw data).
use crate::{
    aggregate::{Bucket, CodeRecord, PatientHistory},
    catalog::{Catalog, RawColumn, Slot},
    config::Outputs,
    util::tsv_writer,
    ArcStr, Patient,
};
use chrono::NaiveDate;
use itertools::{iproduct, Itertools};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path};

/// Which buckets of a patient's history become rows.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    /// One row per patient.
    History,
    /// One row per visit, counting just that visit.
    VisitsNonCumulative,
    /// One row per visit, counting everything up to and including that visit.
    VisitsCumulative,
    YearsNonCumulative,
    YearsCumulative,
}

impl Axis {
    pub const ALL: [Axis; 5] = [
        Axis::History,
        Axis::VisitsNonCumulative,
        Axis::VisitsCumulative,
        Axis::YearsNonCumulative,
        Axis::YearsCumulative,
    ];

    pub fn is_visits(self) -> bool {
        matches!(self, Axis::VisitsNonCumulative | Axis::VisitsCumulative)
    }

    pub fn is_years(self) -> bool {
        matches!(self, Axis::YearsNonCumulative | Axis::YearsCumulative)
    }

    fn name(self) -> &'static str {
        match self {
            Axis::History => "History",
            Axis::VisitsNonCumulative => "VisitsNonCumulative",
            Axis::VisitsCumulative => "VisitsCumulative",
            Axis::YearsNonCumulative => "YearsNonCumulative",
            Axis::YearsCumulative => "YearsCumulative",
        }
    }

    /// The buckets to write for this axis, with the record to use for each.
    fn rows<'h>(self, history: &'h PatientHistory) -> Vec<(&'h Bucket, &'h CodeRecord)> {
        match self {
            Axis::History => vec![(&history.history, &history.history.record)],
            Axis::VisitsNonCumulative => history.visits.iter().map(|b| (b, &b.record)).collect(),
            Axis::VisitsCumulative => history.visits.iter().map(|b| (b, &b.cumulative)).collect(),
            Axis::YearsNonCumulative => history.years.iter().map(|b| (b, &b.record)).collect(),
            Axis::YearsCumulative => history.years.iter().map(|b| (b, &b.cumulative)).collect(),
        }
    }
}

/// What each code cell holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Measure {
    #[serde(rename = "CodeCount", alias = "Count")]
    Count,
    #[serde(rename = "BinaryIndicator", alias = "Binary")]
    Binary,
    /// The most recent recorded value, for codes that have values.
    #[serde(rename = "RawData", alias = "Raw")]
    Raw,
}

impl Measure {
    fn name(self) -> &'static str {
        match self {
            Measure::Count => "CodeCount",
            Measure::Binary => "BinaryIndicator",
            Measure::Raw => "RawData",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Encoding {
    Dense,
    Sparse,
}

/// One output table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableSpec {
    pub measure: Measure,
    pub axis: Axis,
    pub encoding: Encoding,
    pub rebased: bool,
}

impl TableSpec {
    /// Every table selected in the configuration.
    pub fn all(outputs: &Outputs) -> Vec<TableSpec> {
        iproduct!(&outputs.measures, &outputs.axes, &outputs.encodings)
            .map(|(&measure, &axis, &encoding)| TableSpec {
                measure,
                axis,
                encoding,
                rebased: outputs.rebased,
            })
            .unique()
            .collect()
    }

    /// `<Measure>_<Axis>[_Rebased][_Sparse].tsv`
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}{}{}.tsv",
            self.measure.name(),
            self.axis.name(),
            if self.rebased { "_Rebased" } else { "" },
            if self.encoding == Encoding::Sparse {
                "_Sparse"
            } else {
                ""
            }
        )
    }

    fn signal(&self, record: &CodeRecord, code_idx: usize) -> Signal {
        match self.measure {
            Measure::Binary if record.is_present(code_idx) => Signal::Count(1),
            Measure::Binary => Signal::Absent,
            _ => match record.count(code_idx) {
                0 => Signal::Absent,
                count => Signal::Count(count),
            },
        }
    }
}

/// The content of one code cell.
///
/// Absence is kept separate from zero: a raw value of `0.0` is a real value, and binary tables may
/// render absence as `-1`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Signal {
    Absent,
    Count(u32),
    Value(f64),
}

impl Signal {
    fn render(self, spec: &TableSpec) -> String {
        match self {
            Signal::Count(count) => count.to_string(),
            Signal::Value(value) => value.to_string(),
            Signal::Absent => match spec.measure {
                Measure::Raw => String::new(),
                Measure::Binary if spec.rebased => "-1".into(),
                _ => "0".into(),
            },
        }
    }
}

/// Settings that shape every row.
#[derive(Debug, Clone)]
pub struct RowLayout {
    pub indicator_columns: Vec<ArcStr>,
    /// Rebased tables count days from the 1st January of this year.
    pub year_0: i32,
    pub min_visits: usize,
    pub min_years: usize,
}

impl Default for RowLayout {
    fn default() -> Self {
        RowLayout {
            indicator_columns: vec![],
            year_0: 1950,
            min_visits: 0,
            min_years: 0,
        }
    }
}

struct Table<W: io::Write> {
    spec: TableSpec,
    out: csv::Writer<W>,
    rows: usize,
}

/// Writes each patient's rows to all the selected tables as they come.
pub struct DatasetWriter<'a, W: io::Write> {
    catalog: &'a Catalog,
    layout: RowLayout,
    epoch: NaiveDate,
    tables: Vec<Table<W>>,
}

impl<'a> DatasetWriter<'a, io::BufWriter<fs::File>> {
    /// Create a file for each table in `dir`, plus the index maps if any table is sparse.
    pub fn create(
        dir: &Path,
        catalog: &'a Catalog,
        layout: RowLayout,
        specs: &[TableSpec],
    ) -> Result<Self> {
        let mut writer = DatasetWriter::new(catalog, layout)?;
        for spec in specs {
            let path = dir.join(spec.file_name());
            let file = fs::File::create(&path)
                .with_context(|| format!("creating \"{}\"", path.display()))?;
            writer.add_table(*spec, io::BufWriter::new(file))?;
        }

        let sparse = specs
            .iter()
            .filter(|spec| spec.encoding == Encoding::Sparse)
            .collect::<Vec<_>>();
        if sparse.iter().any(|spec| spec.measure != Measure::Raw) {
            let path = dir.join("CodeIndexMap.tsv");
            fs::File::create(&path)
                .map_err(Error::from)
                .and_then(|file| catalog.write_code_index(io::BufWriter::new(file)))
                .with_context(|| format!("writing \"{}\"", path.display()))?;
        }
        if sparse.iter().any(|spec| spec.measure == Measure::Raw) {
            let path = dir.join("RawColumnIndexMap.tsv");
            fs::File::create(&path)
                .map_err(Error::from)
                .and_then(|file| catalog.write_raw_column_index(io::BufWriter::new(file)))
                .with_context(|| format!("writing \"{}\"", path.display()))?;
        }
        Ok(writer)
    }
}

impl<'a, W: io::Write> DatasetWriter<'a, W> {
    pub fn new(catalog: &'a Catalog, layout: RowLayout) -> Result<Self> {
        let epoch = NaiveDate::from_ymd_opt(layout.year_0, 1, 1)
            .ok_or_else(|| format_err!("year {} is out of range", layout.year_0))?;
        Ok(DatasetWriter {
            catalog,
            layout,
            epoch,
            tables: vec![],
        })
    }

    /// Add a table, writing its header straight away.
    pub fn add_table(&mut self, spec: TableSpec, writer: W) -> Result {
        let mut out = tsv_writer(writer);
        let mut header = vec!["PatientID".to_string(), "Age".into(), "Gender".into()];
        if spec.rebased {
            header.push(format!("DaysAfterJan_{}", self.layout.year_0));
        }
        header.extend(self.layout.indicator_columns.iter().map(|col| col.to_string()));
        match (spec.encoding, spec.measure) {
            (Encoding::Sparse, _) => {
                header.push("NumberOfCodes".into());
                header.push("CodeRecords".into());
            }
            (Encoding::Dense, Measure::Raw) => header.extend(
                self.catalog
                    .raw_columns()
                    .iter()
                    .map(|col| self.catalog.raw_column_name(col)),
            ),
            (Encoding::Dense, _) => header.extend(
                self.catalog
                    .codes()
                    .iter()
                    .map(|entry| entry.code.to_string()),
            ),
        }
        out.write_record(&header)
            .with_context(|| format!("writing header of {}", spec.file_name()))?;
        self.tables.push(Table {
            spec,
            out,
            rows: 0,
        });
        Ok(())
    }

    /// Write all of a patient's rows.
    pub fn write_patient(&mut self, history: &PatientHistory) -> Result {
        let catalog = self.catalog;
        let layout = &self.layout;
        let epoch = self.epoch;
        let visits_ok = history.visits.len() >= layout.min_visits;
        let years_ok = history.years.len() >= layout.min_years;

        for table in &mut self.tables {
            let spec = table.spec;
            if (spec.axis.is_visits() && !visits_ok) || (spec.axis.is_years() && !years_ok) {
                continue;
            }
            for (bucket, record) in spec.axis.rows(history) {
                let mut row = identifying_cells(history.patient, bucket, layout);
                if spec.rebased {
                    let days = bucket.date.signed_duration_since(epoch).num_days();
                    row.insert(3, days.to_string());
                }
                match spec.encoding {
                    Encoding::Dense => row.extend(dense_cells(&spec, catalog, record)),
                    Encoding::Sparse => {
                        let pairs = sparse_cells(&spec, catalog, record);
                        row.push(pairs.len().to_string());
                        row.extend(pairs);
                    }
                }
                table.out.write_record(&row).with_context(|| {
                    format!(
                        "writing patient \"{}\" to {}",
                        history.patient.patient_id,
                        spec.file_name()
                    )
                })?;
                table.rows += 1;
            }
        }
        Ok(())
    }

    /// Flush everything and hand back the underlying writers.
    pub fn finish(self) -> Result<Vec<(TableSpec, W)>> {
        let mut out = vec![];
        for table in self.tables {
            event!(
                Level::DEBUG,
                "{} rows written to {}",
                table.rows,
                table.spec.file_name()
            );
            let inner = table
                .out
                .into_inner()
                .map_err(|e| e.into_error())
                .with_context(|| format!("flushing {}", table.spec.file_name()))?;
            out.push((table.spec, inner));
        }
        Ok(out)
    }
}

fn identifying_cells(patient: &Patient, bucket: &Bucket, layout: &RowLayout) -> Vec<String> {
    let mut row = vec![
        patient.patient_id.to_string(),
        bucket.age.to_string(),
        patient.sex.code().to_string(),
    ];
    for idx in 0..layout.indicator_columns.len() {
        let value = patient.indicators.get(idx).cloned().flatten();
        row.push(value.as_deref().unwrap_or("").to_string());
    }
    row
}

fn dense_cells(spec: &TableSpec, catalog: &Catalog, record: &CodeRecord) -> Vec<String> {
    match spec.measure {
        Measure::Raw => catalog
            .raw_columns()
            .iter()
            .map(|col| raw_signal(record, col).render(spec))
            .collect(),
        _ => (0..catalog.codes().len())
            .map(|idx| spec.signal(record, idx).render(spec))
            .collect(),
    }
}

/// `index:value` for every code with a signal.
fn sparse_cells(spec: &TableSpec, catalog: &Catalog, record: &CodeRecord) -> Vec<String> {
    match spec.measure {
        Measure::Raw => catalog
            .raw_columns()
            .iter()
            .enumerate()
            .filter_map(|(idx, col)| match raw_signal(record, col) {
                Signal::Absent => None,
                signal => Some(format!("{}:{}", idx, signal.render(spec))),
            })
            .collect(),
        _ => record
            .counts()
            .map(|(idx, _)| format!("{}:{}", idx, spec.signal(record, idx).render(spec)))
            .collect(),
    }
}

fn raw_signal(record: &CodeRecord, column: &RawColumn) -> Signal {
    match column.slot {
        Slot::Count => match record.count(column.code_idx) {
            0 => Signal::Absent,
            count => Signal::Count(count),
        },
        slot => match record.value(column.code_idx, slot) {
            Some(value) => Signal::Value(value),
            None => Signal::Absent,
        },
    }
}

#[cfg(test)]
mod test {
    use super::{Axis, DatasetWriter, Encoding, Measure, RowLayout, TableSpec};
    use crate::{
        catalog::{Catalog, CatalogBuilder},
        config::Outputs,
        filter::Filters,
        sql::TableLayout,
        Event, PatientHistory, Patients,
    };
    use chrono::NaiveDate;

    fn event(code: &str, day: &str, val1: f64) -> Event {
        Event {
            patient_id: "1".into(),
            code: code.into(),
            date: NaiveDate::parse_from_str(day, "%Y-%m-%d").unwrap(),
            val1,
            val2: 0.,
            free_text: None,
        }
    }

    fn setup() -> (Catalog, Patients, Vec<Event>) {
        let events = vec![
            event("A", "2000-01-01", 0.),
            event("B", "2000-01-01", 5.),
            event("A", "2000-06-01", 0.),
        ];
        let filters = Filters::default();
        let mut builder = CatalogBuilder::new();
        for evt in &events {
            builder.count_row();
            builder.observe(evt, &filters);
        }
        let table = format!("{}1,'1950',0,1,null,0,0);\n", TableLayout::patient().prefix());
        let patients = Patients::load_sql(table.as_bytes()).unwrap();
        (builder.finish(&filters), patients, events)
    }

    fn spec(measure: Measure, axis: Axis, encoding: Encoding, rebased: bool) -> TableSpec {
        TableSpec {
            measure,
            axis,
            encoding,
            rebased,
        }
    }

    /// Write the patient to a single table and return its text.
    fn render(spec: TableSpec, layout: RowLayout) -> String {
        let (catalog, patients, events) = setup();
        let history =
            PatientHistory::build(patients.find_by_id("1").unwrap(), events, &catalog).unwrap();
        let mut writer = DatasetWriter::new(&catalog, layout).unwrap();
        writer.add_table(spec, vec![]).unwrap();
        writer.write_patient(&history).unwrap();
        let mut tables = writer.finish().unwrap();
        String::from_utf8(tables.remove(0).1).unwrap()
    }

    #[test]
    fn file_names() {
        let name = spec(Measure::Count, Axis::VisitsCumulative, Encoding::Dense, false).file_name();
        assert_eq!(name, "CodeCount_VisitsCumulative.tsv");
        let name = spec(Measure::Binary, Axis::History, Encoding::Sparse, true).file_name();
        assert_eq!(name, "BinaryIndicator_History_Rebased_Sparse.tsv");
    }

    #[test]
    fn every_combination_once() {
        let outputs = Outputs {
            axes: vec![Axis::History, Axis::History, Axis::YearsCumulative],
            measures: vec![Measure::Count, Measure::Raw],
            encodings: vec![Encoding::Dense],
            rebased: false,
        };
        assert_eq!(TableSpec::all(&outputs).len(), 4);
    }

    #[test]
    fn dense_counts() {
        let text = render(
            spec(Measure::Count, Axis::History, Encoding::Dense, false),
            RowLayout::default(),
        );
        assert_eq!(text, "PatientID\tAge\tGender\tA\tB\n1\t50\tM\t2\t1\n");

        let text = render(
            spec(Measure::Count, Axis::VisitsNonCumulative, Encoding::Dense, false),
            RowLayout::default(),
        );
        assert_eq!(
            text,
            "PatientID\tAge\tGender\tA\tB\n1\t49\tM\t1\t1\n1\t50\tM\t1\t0\n"
        );
    }

    #[test]
    fn rebased_binary() {
        let layout = RowLayout {
            year_0: 2000,
            ..RowLayout::default()
        };
        let text = render(
            spec(Measure::Binary, Axis::VisitsNonCumulative, Encoding::Dense, true),
            layout,
        );
        assert_eq!(
            text,
            "PatientID\tAge\tGender\tDaysAfterJan_2000\tA\tB\n\
             1\t49\tM\t0\t1\t1\n\
             1\t50\tM\t152\t1\t-1\n"
        );
    }

    #[test]
    fn raw_values_leave_gaps() {
        let text = render(
            spec(Measure::Raw, Axis::VisitsNonCumulative, Encoding::Dense, false),
            RowLayout::default(),
        );
        assert_eq!(
            text,
            "PatientID\tAge\tGender\tA\tB_Val1\n1\t49\tM\t1\t5\n1\t50\tM\t1\t\n"
        );
    }

    #[test]
    fn sparse() {
        let text = render(
            spec(Measure::Count, Axis::VisitsCumulative, Encoding::Sparse, false),
            RowLayout::default(),
        );
        assert_eq!(
            text,
            "PatientID\tAge\tGender\tNumberOfCodes\tCodeRecords\n\
             1\t49\tM\t2\t0:1\t1:1\n\
             1\t50\tM\t2\t0:2\t1:1\n"
        );

        let text = render(
            spec(Measure::Raw, Axis::VisitsNonCumulative, Encoding::Sparse, false),
            RowLayout::default(),
        );
        assert_eq!(
            text,
            "PatientID\tAge\tGender\tNumberOfCodes\tCodeRecords\n\
             1\t49\tM\t2\t0:1\t1:5\n\
             1\t50\tM\t1\t0:1\n"
        );
    }

    #[test]
    fn min_visits_only_affects_visit_tables() {
        let layout = RowLayout {
            min_visits: 3,
            ..RowLayout::default()
        };
        let text = render(
            spec(Measure::Count, Axis::VisitsCumulative, Encoding::Dense, false),
            layout.clone(),
        );
        assert_eq!(text, "PatientID\tAge\tGender\tA\tB\n");
        let text = render(
            spec(Measure::Count, Axis::YearsCumulative, Encoding::Dense, false),
            layout,
        );
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn min_years_only_affects_year_tables() {
        // two years of age (49 and 50), over two visits
        let layout = RowLayout {
            min_years: 3,
            ..RowLayout::default()
        };
        for axis in [Axis::YearsNonCumulative, Axis::YearsCumulative] {
            let text = render(spec(Measure::Count, axis, Encoding::Dense, false), layout.clone());
            assert_eq!(text, "PatientID\tAge\tGender\tA\tB\n");
        }
        let text = render(
            spec(Measure::Count, Axis::VisitsNonCumulative, Encoding::Dense, false),
            layout.clone(),
        );
        assert_eq!(
            text,
            "PatientID\tAge\tGender\tA\tB\n1\t49\tM\t1\t1\n1\t50\tM\t1\t0\n"
        );
        let text = render(
            spec(Measure::Count, Axis::History, Encoding::Dense, false),
            layout.clone(),
        );
        assert_eq!(text, "PatientID\tAge\tGender\tA\tB\n1\t50\tM\t2\t1\n");

        let layout = RowLayout {
            min_years: 2,
            ..RowLayout::default()
        };
        let text = render(
            spec(Measure::Count, Axis::YearsNonCumulative, Encoding::Dense, false),
            layout,
        );
        assert_eq!(
            text,
            "PatientID\tAge\tGender\tA\tB\n1\t49\tM\t1\t1\n1\t50\tM\t1\t0\n"
        );
    }

    #[test]
    fn indicator_columns() {
        let layout = RowLayout {
            indicator_columns: vec!["chd".into()],
            ..RowLayout::default()
        };
        let text = render(
            spec(Measure::Binary, Axis::History, Encoding::Dense, false),
            layout,
        );
        assert_eq!(text, "PatientID\tAge\tGender\tchd\tA\tB\n1\t50\tM\t\t1\t1\n");
    }
}
