//! Running the whole thing over an export directory.
use crate::{
    aggregate::HistoryAggregator,
    catalog::{CatalogBuilder, Statistics},
    config::Config,
    event::Event,
    file_exists,
    filter::Filters,
    output::{DatasetWriter, RowLayout, TableSpec},
    patient::Patients,
    sql::{self, RawLine, TableLayout},
    util::tsv_writer,
    Sex,
};
use chrono::Datelike;
use itertools::Itertools;
use qu::ick_use::*;
use std::{
    fs,
    io::{self, Write},
    path::Path,
};

pub const JOURNAL_FILE: &str = "journal.sql";
pub const PATIENT_FILE: &str = "patient.sql";
/// Optional.
pub const INDICATOR_FILE: &str = "indicators.sql";

pub const CODES_FILE: &str = "Codes.txt";
pub const STATISTICS_FILE: &str = "Statistics.txt";

/// Log progress after this many patients.
const PROGRESS_EVERY: usize = 100;

/// Produce the datasets for the export in `input_dir`, writing them to `output_dir`.
///
/// The output directory must already exist. Nothing is written there if the configuration is
/// invalid, but a failure part way through leaves whatever has been written so far.
pub fn generate(input_dir: &Path, output_dir: &Path, config: &Config) -> Result<Statistics> {
    let filters = config.validate()?;
    let patients = load_patients(input_dir)?;
    let journal = input_dir.join(JOURNAL_FILE);

    event!(Level::INFO, "first pass: finding codes in \"{}\"", journal.display());
    let mut builder = CatalogBuilder::new();
    for_each_row(&journal, |event| {
        builder.count_row();
        if let Some(event) = event {
            builder.observe(&event, &filters);
        }
        Ok(())
    })?;
    let catalog = builder.finish(&filters);
    catalog.statistics().log();
    write_file(&output_dir.join(CODES_FILE), |out| catalog.write_codes(out))?;
    write_file(&output_dir.join(STATISTICS_FILE), |out| {
        catalog.statistics().write(out)
    })?;

    event!(Level::INFO, "second pass: writing patient histories");
    let layout = RowLayout {
        indicator_columns: patients.indicator_columns().to_vec(),
        year_0: config.year_0,
        min_visits: config.min_visits,
        min_years: config.min_years,
    };
    let specs = TableSpec::all(&config.outputs);
    let mut writer = DatasetWriter::create(output_dir, &catalog, layout, &specs)?;
    let mut aggregator = HistoryAggregator::new(&catalog, &patients);
    if config.strict_patient_order {
        aggregator = aggregator.strict();
    }

    let total = catalog.patient_count();
    let mut saved = 0;
    let progress = |saved: usize| {
        if saved % PROGRESS_EVERY == 0 {
            event!(
                Level::INFO,
                "saved {} of {} patients ({:.1}%)",
                saved,
                total,
                100. * saved as f64 / total.max(1) as f64
            );
        }
    };
    for_each_row(&journal, |event| {
        let Some(event) = event else {
            return Ok(())
        };
        if !catalog.admits_patient(&event.patient_id) || catalog.index_of(&event.code).is_none() {
            return Ok(());
        }
        if let Some(history) = aggregator.push(event)? {
            writer.write_patient(&history)?;
            saved += 1;
            progress(saved);
        }
        Ok(())
    })?;
    if let Some(history) = aggregator.finish() {
        writer.write_patient(&history)?;
        saved += 1;
    }
    writer.finish()?;
    event!(Level::INFO, "finished: {} patients saved", saved);
    Ok(*catalog.statistics())
}

/// Write a standardised copy of the export in `input_dir` to `output_dir`.
///
/// This produces `PatientDemographics.tsv`, `JournalTable.tsv` (each patient's events sorted by
/// date and numbered by visit), and the codes and statistics files for the whole, unfiltered,
/// journal.
pub fn preprocess(input_dir: &Path, output_dir: &Path) -> Result<Statistics> {
    let patients = load_patients(input_dir)?;
    write_file(&output_dir.join("PatientDemographics.tsv"), |out| {
        let mut out = tsv_writer(out);
        out.write_record(["PatientID", "DOB", "Gender"])?;
        for patient in patients.iter() {
            out.write_record([
                patient.patient_id.to_string(),
                patient.date_of_birth.format("%Y-%m-%d").to_string(),
                patient.sex.code().to_string(),
            ])?;
        }
        out.flush()?;
        Ok(())
    })?;

    let journal = input_dir.join(JOURNAL_FILE);
    let filters = Filters::default();
    let mut builder = CatalogBuilder::new();
    let mut patient_events: Vec<Event> = vec![];
    let mut patient_count = 0;
    write_file(&output_dir.join("JournalTable.tsv"), |out| {
        let mut out = tsv_writer(out);
        out.write_record([
            "PatientID",
            "Code",
            "Date",
            "Year",
            "VisitNumber",
            "Val1",
            "Val2",
            "FreeText",
        ])?;
        for_each_row(&journal, |event| {
            builder.count_row();
            let Some(event) = event else {
                return Ok(())
            };
            builder.observe(&event, &filters);
            if let Some(last) = patient_events.last() {
                if last.patient_id != event.patient_id {
                    write_journal_rows(&mut out, &mut patient_events)?;
                    patient_count += 1;
                }
            }
            patient_events.push(event);
            Ok(())
        })?;
        if !patient_events.is_empty() {
            write_journal_rows(&mut out, &mut patient_events)?;
            patient_count += 1;
        }
        out.flush()?;
        Ok(())
    })?;
    event!(Level::INFO, "{} patient histories written", patient_count);

    let catalog = builder.finish(&filters);
    catalog.statistics().log();
    write_file(&output_dir.join(CODES_FILE), |out| catalog.write_codes(out))?;
    write_file(&output_dir.join(STATISTICS_FILE), |out| {
        catalog.statistics().write(out)
    })?;
    Ok(*catalog.statistics())
}

/// Load the patient table, and the indicator table if there is one.
fn load_patients(input_dir: &Path) -> Result<Patients> {
    let mut patients = Patients::load(input_dir.join(PATIENT_FILE))?;
    let sexes = patients.count_sexes();
    event!(
        Level::INFO,
        "{} patients loaded ({} {}, {} {})",
        patients.len(),
        sexes[&Sex::Male],
        Sex::Male,
        sexes[&Sex::Female],
        Sex::Female
    );
    let indicators = input_dir.join(INDICATOR_FILE);
    if file_exists(&indicators)? {
        patients.load_indicators(&indicators)?;
        event!(
            Level::INFO,
            "{} disease indicators loaded",
            patients.indicator_columns().len()
        );
    }
    Ok(patients)
}

/// Call `f` for each row of the journal, with the event or `None` if the row has no patient or
/// code. Lines that aren't journal rows are skipped.
fn for_each_row(path: &Path, mut f: impl FnMut(Option<Event>) -> Result) -> Result {
    let layout = TableLayout::journal();
    let inner = |f: &mut dyn FnMut(Option<Event>) -> Result| -> Result {
        let file = io::BufReader::new(fs::File::open(path)?);
        for line in sql::numbered_lines(file) {
            let (line_no, line) = line?;
            match layout.parse(&line) {
                RawLine::Row(fields) => {
                    let event = Event::from_fields(&fields, line_no)?;
                    if event.is_none() {
                        event!(Level::DEBUG, "line {}: no patient or code", line_no);
                    }
                    f(event)?;
                }
                RawLine::Malformed => {
                    event!(Level::DEBUG, "skipping malformed journal line {}", line_no)
                }
                RawLine::Other => (),
            }
        }
        Ok(())
    };
    inner(&mut f).with_context(|| format!("reading journal \"{}\"", path.display()))
}

/// Write one patient's events in date order, with visit numbers, and clear them.
fn write_journal_rows<W: io::Write>(out: &mut csv::Writer<W>, events: &mut Vec<Event>) -> Result {
    events.sort_by_key(|evt| evt.date);
    for (visit, (_, group)) in (&events.iter().group_by(|evt| evt.date))
        .into_iter()
        .enumerate()
    {
        for evt in group {
            // The table is tab separated and unquoted.
            let free_text = evt
                .free_text
                .as_deref()
                .unwrap_or("")
                .replace(|ch: char| matches!(ch, '\t' | '\n' | '\r'), " ");
            out.write_record([
                evt.patient_id.to_string(),
                evt.code.to_string(),
                evt.date.format("%Y-%m-%d").to_string(),
                evt.date.year().to_string(),
                visit.to_string(),
                evt.val1.to_string(),
                evt.val2.to_string(),
                free_text,
            ])?;
        }
    }
    events.clear();
    Ok(())
}

fn write_file(path: &Path, f: impl FnOnce(&mut io::BufWriter<fs::File>) -> Result) -> Result {
    let inner = || -> Result {
        let mut out = io::BufWriter::new(fs::File::create(path)?);
        f(&mut out)?;
        out.flush()?;
        Ok(())
    };
    inner().with_context(|| format!("writing \"{}\"", path.display()))
}

/// Create the output directory, refusing to reuse an existing one unless `overwrite` is set.
pub fn prepare_output_dir(dir: &Path, overwrite: bool) -> Result {
    ensure!(
        !file_exists(dir)? || overwrite,
        "output directory \"{}\" already exists (use --overwrite to write into it anyway)",
        dir.display()
    );
    fs::create_dir_all(dir).with_context(|| format!("creating \"{}\"", dir.display()))?;
    Ok(())
}
