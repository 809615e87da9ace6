use crate::{
    error::DatasetError,
    sql::{self, RawLine, TableLayout},
    util::{birth_date, is_male, optional_string},
    ArcStr, PatientId, Sex,
};
use chrono::NaiveDate;
use qu::ick_use::*;
use serde::{de::IgnoredAny, Deserialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    ops::Deref,
    path::Path,
};

/// A row of the patient table, as exported.
///
/// Only the id, date of birth and sex are used.
#[derive(Debug, Deserialize)]
struct PatientRaw {
    id: PatientId,
    #[serde(deserialize_with = "birth_date")]
    dob: NaiveDate,
    _depscore: IgnoredAny,
    #[serde(deserialize_with = "is_male")]
    sex: Sex,
    _race: IgnoredAny,
    _prac_id: IgnoredAny,
    _imd: IgnoredAny,
}

/// A patient's demographics.
///
/// `indicators` holds the patient's row from the (optional) disease indicator table, in the
/// order of [`Patients::indicator_columns`]. It is empty if the patient has no such row.
#[derive(Debug, Clone, PartialEq)]
pub struct Patient {
    pub patient_id: PatientId,
    pub date_of_birth: NaiveDate,
    pub sex: Sex,
    pub indicators: Vec<Option<ArcStr>>,
}

impl From<PatientRaw> for Patient {
    fn from(from: PatientRaw) -> Self {
        Self {
            patient_id: from.id.trim().into(),
            date_of_birth: from.dob,
            sex: from.sex,
            indicators: vec![],
        }
    }
}

impl Patient {
    pub fn age_at(&self, date: NaiveDate) -> i32 {
        crate::age::age_at(self.date_of_birth, date)
    }
}

/// The parsed list of patients, with a pre-built index for the `id` field.
///
/// Built once before the journal is read, and read-only after that.
#[derive(Debug, Default)]
pub struct Patients {
    els: Vec<Patient>,
    id_idx: HashMap<PatientId, usize>,
    indicator_columns: Vec<ArcStr>,
}

impl Patients {
    /// Load the patient table from an export file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        fs::File::open(path)
            .map_err(Error::from)
            .and_then(|file| Self::load_sql(io::BufReader::new(file)))
            .with_context(|| format!("while loading patients from \"{}\"", path.display()))
    }

    /// Load the patient table from the lines of an export.
    pub fn load_sql(reader: impl io::BufRead) -> Result<Self> {
        let layout = TableLayout::patient();
        let mut els = vec![];
        for line in sql::numbered_lines(reader) {
            let (line_no, line) = line?;
            match layout.parse(&line) {
                RawLine::Row(fields) => {
                    // A bad row only matters if the journal refers to that patient, and then it
                    // is reported as missing.
                    let raw: PatientRaw = match csv::StringRecord::from(fields).deserialize(None) {
                        Ok(raw) => raw,
                        Err(e) => {
                            event!(
                                Level::WARN,
                                "line {}: skipping invalid patient row: {}",
                                line_no,
                                e
                            );
                            continue;
                        }
                    };
                    let patient = Patient::from(raw);
                    if patient.patient_id.is_empty() {
                        event!(Level::DEBUG, "line {}: patient row without an id", line_no);
                        continue;
                    }
                    els.push(patient);
                }
                RawLine::Malformed => {
                    event!(Level::DEBUG, "skipping malformed patient line {}", line_no)
                }
                RawLine::Other => (),
            }
        }
        Ok(Self::new(els))
    }

    /// Join the disease indicator table onto the patients, by id.
    ///
    /// The first column of the indicator table is the patient id; the rest become extra output
    /// columns. Rows for unknown patients are ignored.
    pub fn attach_indicators(&mut self, reader: impl io::BufRead) -> Result {
        let mut layout: Option<TableLayout> = None;
        for line in sql::numbered_lines(reader) {
            let (line_no, line) = line?;
            if layout.is_none() && line.starts_with(sql::INSERT_MARKER) {
                layout = TableLayout::from_insert(&line);
                if let Some(layout) = &layout {
                    ensure!(
                        layout.columns().len() > 1,
                        "indicator table `{}` has no indicator columns",
                        layout.name()
                    );
                    self.indicator_columns = layout.columns()[1..].to_vec();
                }
            }
            let Some(layout) = &layout else {
                continue
            };
            match layout.parse(&line) {
                RawLine::Row(fields) => {
                    let mut fields = fields.into_iter();
                    let id = fields.next().unwrap_or_default();
                    let Some(patient) = self.find_by_id_mut(id.trim()) else {
                        event!(
                            Level::WARN,
                            "line {}: indicators for unknown patient \"{}\"",
                            line_no,
                            id
                        );
                        continue
                    };
                    patient.indicators = fields.map(|v| optional_string(v.trim())).collect();
                }
                RawLine::Malformed => {
                    event!(Level::DEBUG, "skipping malformed indicator line {}", line_no)
                }
                RawLine::Other => (),
            }
        }
        Ok(())
    }

    /// Load indicators from an export file. See [`Patients::attach_indicators`].
    pub fn load_indicators(&mut self, path: impl AsRef<Path>) -> Result {
        let path = path.as_ref();
        fs::File::open(path)
            .map_err(Error::from)
            .and_then(|file| self.attach_indicators(io::BufReader::new(file)))
            .with_context(|| format!("while loading indicators from \"{}\"", path.display()))
    }

    /// Names of the indicator columns, empty if no indicators were loaded.
    pub fn indicator_columns(&self) -> &[ArcStr] {
        &self.indicator_columns
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Patient> {
        let idx = self.id_idx.get(id)?;
        let el = self.els.get(*idx)?;
        Some(el)
    }

    /// Like `find_by_id`, but a missing patient is an error.
    pub fn require(&self, id: &str) -> Result<&Patient, DatasetError> {
        self.find_by_id(id)
            .ok_or_else(|| DatasetError::MissingPatient {
                patient_id: id.into(),
            })
    }

    fn find_by_id_mut(&mut self, id: &str) -> Option<&mut Patient> {
        let idx = self.id_idx.get(id)?;
        let el = self.els.get_mut(*idx)?;
        Some(el)
    }

    pub fn count_sexes(&self) -> BTreeMap<Sex, usize> {
        // B Tree so we get a predictable ordering.
        let mut map = BTreeMap::new();
        // Manually insert to make sure all categories are included.
        map.insert(Sex::Male, 0);
        map.insert(Sex::Female, 0);
        for el in self.els.iter() {
            *map.entry(el.sex).or_insert(0) += 1;
        }
        map
    }

    fn new(els: Vec<Patient>) -> Self {
        let mut this = Patients {
            els,
            id_idx: HashMap::new(),
            indicator_columns: vec![],
        };
        this.rebuild_index();
        this
    }

    fn rebuild_index(&mut self) {
        self.id_idx.clear();
        for (idx, el) in self.els.iter().enumerate() {
            if let Some(prev) = self.id_idx.insert(el.patient_id.clone(), idx) {
                event!(
                    Level::WARN,
                    "patient \"{}\" appears more than once, using the last row (row {} replaced)",
                    el.patient_id,
                    prev
                );
            }
        }
    }
}

impl Deref for Patients {
    type Target = [Patient];
    fn deref(&self) -> &Self::Target {
        &*self.els
    }
}

#[cfg(test)]
mod test {
    use super::Patients;
    use crate::{error::DatasetError, sql::TableLayout, ArcStr, Sex};
    use chrono::NaiveDate;

    fn patient_table() -> String {
        let prefix = TableLayout::patient().prefix().to_string();
        [
            "-- dump of patient".to_string(),
            format!("{}1,'1950',12.5,1,'W',3,4);", prefix),
            format!("{}2,'1996-02-29',null,0,null,3,null);", prefix),
            format!("{}3,'1960',0,1,'W',3", prefix),
        ]
        .join("\n")
    }

    #[test]
    fn load_patients() {
        let patients = Patients::load_sql(patient_table().as_bytes()).unwrap();
        assert_eq!(patients.len(), 2);
        let p1 = patients.find_by_id("1").unwrap();
        assert_eq!(p1.sex, Sex::Male);
        assert_eq!(p1.date_of_birth, NaiveDate::from_ymd_opt(1950, 1, 1).unwrap());
        let p2 = patients.find_by_id("2").unwrap();
        assert_eq!(p2.sex, Sex::Female);
        assert_eq!(p2.age_at(NaiveDate::from_ymd_opt(1999, 3, 1).unwrap()), 3);

        let counts = patients.count_sexes();
        assert_eq!(counts[&Sex::Male], 1);
        assert_eq!(counts[&Sex::Female], 1);
    }

    #[test]
    fn invalid_rows_are_skipped() {
        let prefix = TableLayout::patient().prefix().to_string();
        let table = [
            format!("{}' 1 ','1950',0,1,null,0,0);", prefix),
            format!("{}2,null,0,0,null,0,0);", prefix),
            format!("{}3,'1960',0,7,null,0,0);", prefix),
        ]
        .join("\n");
        let patients = Patients::load_sql(table.as_bytes()).unwrap();
        assert_eq!(patients.len(), 1);
        assert!(patients.require("1").is_ok());
        assert!(matches!(
            patients.require("2"),
            Err(DatasetError::MissingPatient { .. })
        ));
        assert!(patients.find_by_id("3").is_none());
    }

    #[test]
    fn missing_patient() {
        let patients = Patients::load_sql(patient_table().as_bytes()).unwrap();
        assert!(matches!(
            patients.require("3"),
            Err(DatasetError::MissingPatient { .. })
        ));
    }

    #[test]
    fn indicators_join_by_id() {
        let mut patients = Patients::load_sql(patient_table().as_bytes()).unwrap();
        let indicators = "\
insert into `diseases`(`id`,`chd`,`ckd`) values (2,1,null);
insert into `diseases`(`id`,`chd`,`ckd`) values (9,0,0);
";
        patients.attach_indicators(indicators.as_bytes()).unwrap();
        assert_eq!(patients.indicator_columns().len(), 2);
        let p2 = patients.find_by_id("2").unwrap();
        assert_eq!(p2.indicators, vec![Some(ArcStr::from("1")), None]);
        assert!(patients.find_by_id("1").unwrap().indicators.is_empty());
    }
}
