//! Testing utilities for the Sheetgate workspace
//!
//! Fixture builders for CSV and XLSX buffers, and a scripted memory probe.

#![allow(missing_docs)]

use parking_lot::Mutex;
use sheetgate_monitor::{MemoryProbe, RawMemory};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// CSV buffer with a header row. Fields are quoted as needed.
pub fn csv_bytes(headers: &[&str], rows: &[&[&str]]) -> Vec<u8> {
    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
    writer.write_record(headers).unwrap();
    for row in rows {
        writer.write_record(*row).unwrap();
    }
    writer.into_inner().unwrap()
}

/// `id,name` CSV with `rows` data rows: `1,name-1` ...
pub fn numbered_csv(rows: usize) -> Vec<u8> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["id", "name"]).unwrap();
    for i in 1..=rows {
        writer.write_record([i.to_string(), format!("name-{i}")]).unwrap();
    }
    writer.into_inner().unwrap()
}

/// Single-sheet XLSX buffer. `rows[0]` is the header row. A cell starting
/// with `=` is stored as a formula; an empty string leaves the cell unset.
pub fn xlsx_bytes(sheet_name: &str, rows: &[&[&str]]) -> Vec<u8> {
    xlsx_book(&[(sheet_name, rows)])
}

/// Multi-sheet XLSX buffer, sheets in the given order
pub fn xlsx_book(sheets: &[(&str, &[&[&str]])]) -> Vec<u8> {
    let mut book = umya_spreadsheet::new_file();
    for (index, (name, rows)) in sheets.iter().enumerate() {
        let sheet = if index == 0 {
            let first = book.get_sheet_by_name_mut("Sheet1").unwrap();
            first.set_name(*name);
            first
        } else {
            book.new_sheet(*name).unwrap()
        };
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                if value.is_empty() {
                    continue;
                }
                let coordinate = (c as u32 + 1, r as u32 + 1);
                let cell = sheet.get_cell_mut(coordinate);
                match value.strip_prefix('=') {
                    Some(formula) => {
                        cell.set_formula(formula);
                    }
                    None => {
                        cell.set_value(*value);
                    }
                }
            }
        }
    }
    let mut out = std::io::Cursor::new(Vec::new());
    umya_spreadsheet::writer::xlsx::write_writer(&book, &mut out).unwrap();
    out.into_inner()
}

/// Probe replaying scripted readings
///
/// Each `sample()` pops the next reading; the last one repeats forever.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    readings: Mutex<VecDeque<RawMemory>>,
    last: Mutex<RawMemory>,
    samples: AtomicU64,
    reclaims: AtomicU64,
}

impl ScriptedProbe {
    pub fn new(readings: impl IntoIterator<Item = RawMemory>) -> Self {
        Self {
            readings: Mutex::new(readings.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Always `heap_used` of `heap_total`
    pub fn fixed(heap_used: u64, heap_total: u64) -> Self {
        Self::new([RawMemory::new(heap_used, heap_total, 0)])
    }

    /// Usage ratio `ratio` of a 1 GiB budget
    pub fn at_ratio(ratio: f64) -> Self {
        Self::fixed((GIB as f64 * ratio) as u64, GIB)
    }

    /// Append readings to the script
    pub fn push(&self, reading: RawMemory) {
        self.readings.lock().push_back(reading);
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn reclaim_requests(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }
}

impl MemoryProbe for ScriptedProbe {
    fn sample(&self) -> RawMemory {
        self.samples.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last.lock();
        if let Some(next) = self.readings.lock().pop_front() {
            *last = next;
        }
        *last
    }

    fn request_reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_probe_repeats_last_reading() {
        let probe = ScriptedProbe::new([RawMemory::new(1, 10, 0), RawMemory::new(5, 10, 0)]);
        assert_eq!(probe.sample().heap_used, 1);
        assert_eq!(probe.sample().heap_used, 5);
        assert_eq!(probe.sample().heap_used, 5);
        assert_eq!(probe.samples_taken(), 3);
    }

    #[test]
    fn csv_fixture_quotes_fields() {
        let bytes = csv_bytes(&["a", "b"], &[&["x,y", "z"]]);
        assert_eq!(String::from_utf8(bytes).unwrap(), "a,b\n\"x,y\",z\n");
    }
}
