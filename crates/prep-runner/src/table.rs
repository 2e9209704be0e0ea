use crate::error::{PrepError, PrepResult};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::warn;

const MISSING_TOKENS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "null", "NULL"];

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Missing,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Cell {
    pub fn from_raw(raw: &str) -> Cell {
        if MISSING_TOKENS.contains(&raw.trim()) {
            Cell::Missing
        } else {
            Cell::Text(raw.to_string())
        }
    }

    pub fn is_missing(&self) -> bool {
        match self {
            Cell::Missing => true,
            Cell::Float(v) => v.is_nan(),
            _ => false,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Cell::Missing => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Int(v) => v.to_string(),
            Cell::Float(v) if v.is_nan() => String::new(),
            Cell::Float(v) => v.to_string(),
            Cell::Bool(v) => v.to_string(),
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        let v = match self {
            Cell::Missing => return None,
            Cell::Text(s) => s.trim().parse::<f64>().ok()?,
            Cell::Int(v) => *v as f64,
            Cell::Float(v) => *v,
            Cell::Bool(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
        };
        if v.is_nan() {
            None
        } else {
            Some(v)
        }
    }

    /// Numeric coercion: integral values become `Int`, unparseable ones `Missing`.
    pub fn coerce_numeric(&self) -> Cell {
        match self.to_f64() {
            Some(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => Cell::Int(v as i64),
            Some(v) => Cell::Float(v),
            None => Cell::Missing,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Cell::Missing => false,
            Cell::Bool(v) => *v,
            Cell::Int(v) => *v == 1,
            Cell::Float(v) => *v == 1.0,
            Cell::Text(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"),
        }
    }

    /// Total order used for sorting: numbers before text, missing last.
    pub fn sort_cmp(&self, other: &Cell) -> Ordering {
        fn rank(c: &Cell) -> u8 {
            match c {
                _ if c.is_missing() => 2,
                Cell::Text(s) if s.trim().parse::<f64>().is_err() => 1,
                _ => 0,
            }
        }
        match (rank(self), rank(other)) {
            (0, 0) => {
                let a = self.to_f64().unwrap_or(0.0);
                let b = other.to_f64().unwrap_or(0.0);
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            (1, 1) => self.render().cmp(&other.render()),
            (a, b) => a.cmp(&b),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    #[default]
    Auto,
    Comma,
    Tab,
    Whitespace,
}

impl Delimiter {
    // a single-token header is a one-column comma file
    fn sniff(header_line: &str) -> Delimiter {
        if header_line.contains('\t') {
            Delimiter::Tab
        } else if header_line.contains(',') {
            Delimiter::Comma
        } else if header_line.split_whitespace().nth(1).is_some() {
            Delimiter::Whitespace
        } else {
            Delimiter::Comma
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<Cell>>,
    overlong_rows: usize,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
            overlong_rows: 0,
        }
    }

    pub fn from_records(headers: &[&str], records: &[&[&str]]) -> Self {
        let mut table = Table::new(headers.iter().map(|h| h.to_string()).collect());
        for record in records {
            table.push_row(record.iter().map(|v| Cell::from_raw(v)).collect());
        }
        table
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Pads short rows with missing cells. Rows wider than the header are
    /// cut to width and counted in `overlong_rows`.
    pub fn push_row(&mut self, mut row: Vec<Cell>) {
        if row.len() > self.headers.len() {
            self.overlong_rows += 1;
        }
        row.resize(self.headers.len(), Cell::Missing);
        self.rows.push(row);
    }

    pub fn overlong_rows(&self) -> usize {
        self.overlong_rows
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn column(&self, idx: usize) -> impl Iterator<Item = &Cell> + '_ {
        self.rows.iter().map(move |row| &row[idx])
    }

    pub fn column_by_name(&self, name: &str) -> Option<Vec<Cell>> {
        let idx = self.column_index(name)?;
        Some(self.column(idx).cloned().collect())
    }

    pub fn find_column_ci(&self, name: &str) -> Option<usize> {
        let wanted = name.trim().to_lowercase();
        self.headers.iter().position(|h| h.to_lowercase() == wanted)
    }

    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        &self.rows[row][col]
    }

    pub fn rename_column(&mut self, idx: usize, name: &str) {
        self.headers[idx] = name.to_string();
    }

    /// Replaces the named column, or appends it when absent.
    pub fn set_column(&mut self, name: &str, values: Vec<Cell>) {
        debug_assert_eq!(values.len(), self.rows.len());
        match self.column_index(name) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.headers.push(name.to_string());
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
    }

    pub fn map_column<F>(&mut self, idx: usize, mut f: F)
    where
        F: FnMut(&Cell) -> Cell,
    {
        for row in self.rows.iter_mut() {
            row[idx] = f(&row[idx]);
        }
    }

    /// Drops every column whose header matches `pred`; returns the dropped names.
    pub fn drop_columns<F>(&mut self, pred: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let keep: Vec<bool> = self.headers.iter().map(|h| !pred(h)).collect();
        let dropped = self
            .headers
            .iter()
            .zip(&keep)
            .filter(|(_, k)| !**k)
            .map(|(h, _)| h.clone())
            .collect();
        self.headers = self
            .headers
            .drain(..)
            .zip(&keep)
            .filter(|(_, k)| **k)
            .map(|(h, _)| h)
            .collect();
        for row in self.rows.iter_mut() {
            *row = row
                .drain(..)
                .zip(&keep)
                .filter(|(_, k)| **k)
                .map(|(c, _)| c)
                .collect();
        }
        dropped
    }

    pub fn drop_duplicate_rows(&mut self) -> usize {
        let all: Vec<usize> = (0..self.headers.len()).collect();
        self.drop_duplicate_rows_by(&all)
    }

    /// Keeps the first row of each group equal on `cols`.
    pub fn drop_duplicate_rows_by(&mut self, cols: &[usize]) -> usize {
        let before = self.rows.len();
        let mut seen: HashSet<Vec<String>> = HashSet::new();
        self.rows
            .retain(|row| seen.insert(cols.iter().map(|&c| row[c].render()).collect()));
        before - self.rows.len()
    }

    /// Keeps rows whose `keep` entry is true; returns how many were removed.
    pub fn retain_rows(&mut self, keep: &[bool]) -> usize {
        debug_assert_eq!(keep.len(), self.rows.len());
        let before = self.rows.len();
        let mut flags = keep.iter();
        self.rows.retain(|_| flags.next().copied().unwrap_or(true));
        before - self.rows.len()
    }

    pub fn sort_by_columns(&mut self, cols: &[usize]) {
        self.rows.sort_by(|a, b| {
            for &c in cols {
                let ord = a[c].sort_cmp(&b[c]);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    pub fn select(&self, names: &[String]) -> Table {
        let idxs: Vec<usize> = names
            .iter()
            .filter_map(|n| self.column_index(n))
            .collect();
        let mut out = Table::new(idxs.iter().map(|&i| self.headers[i].clone()).collect());
        for row in &self.rows {
            out.rows.push(idxs.iter().map(|&i| row[i].clone()).collect());
        }
        out
    }

    pub fn to_csv_bytes(&self) -> PrepResult<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(Cell::render))?;
        }
        writer
            .into_inner()
            .map_err(|e| PrepError::Io(e.into_error()))
    }
}

pub fn read_table(path: &Path, delimiter: Delimiter) -> PrepResult<Table> {
    if !path.is_file() {
        return Err(PrepError::InputMissing {
            path: path.to_path_buf(),
        });
    }
    let data = fs::read_to_string(path)?;
    let table = parse_table(&data, delimiter)?;
    if table.overlong_rows() > 0 {
        warn!(
            path = %path.display(),
            rows = table.overlong_rows(),
            "rows wider than the header were truncated"
        );
    }
    Ok(table)
}

pub fn parse_table(data: &str, delimiter: Delimiter) -> PrepResult<Table> {
    let data = data.strip_prefix('\u{feff}').unwrap_or(data);
    let delimiter = match delimiter {
        Delimiter::Auto => Delimiter::sniff(data.lines().next().unwrap_or("")),
        other => other,
    };
    match delimiter {
        Delimiter::Whitespace => Ok(parse_whitespace(data)),
        Delimiter::Tab => parse_delimited(data, b'\t'),
        _ => parse_delimited(data, b','),
    }
}

fn parse_delimited(data: &str, delim: u8) -> PrepResult<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delim)
        .has_headers(true)
        .flexible(true)
        .from_reader(data.as_bytes());
    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut table = Table::new(headers);
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        table.push_row(record.iter().map(Cell::from_raw).collect());
    }
    Ok(table)
}

fn parse_whitespace(data: &str) -> Table {
    let mut lines = data.lines().filter(|l| !l.trim().is_empty());
    let headers = lines
        .next()
        .map(|l| l.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let mut table = Table::new(headers);
    for line in lines {
        table.push_row(line.split_whitespace().map(Cell::from_raw).collect());
    }
    table
}
