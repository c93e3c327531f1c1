use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::envelope::Envelope;
use crate::error::{Result, SdmError};

pub const DEFAULT_SRS: &str = "EPSG:4326";

const X_COLUMNS: &[&str] = &["x", "longitude", "lon", "long", "decimallongitude"];
const Y_COLUMNS: &[&str] = &["y", "latitude", "lat", "decimallatitude"];
const SPECIES_COLUMNS: &[&str] = &["species", "scientificname"];
const PRESENCE_COLUMNS: &[&str] = &["presence", "pa"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Observation {
    pub x: f64,
    pub y: f64,
    pub present: bool,
}

/// Access to a species' point observations on disk.
pub trait ObservationProvider: Sized {
    fn open(path: &Path, species: &str) -> Result<Self>;

    /// Copy the backing file verbatim to `path` and open the copy.
    fn copy_to(&self, path: &Path) -> Result<Self>;

    fn envelope(&self) -> Option<Envelope>;
}

/// Presence/absence points for one species, backed by a delimited text file.
#[derive(Debug, Clone)]
pub struct ObservationSet {
    path: PathBuf,
    species: String,
    srs: String,
    default_srs: String,
    points: Vec<Observation>,
    envelope: Option<Envelope>,
}

impl ObservationSet {
    pub fn empty(path: impl Into<PathBuf>, species: &str, srs: &str) -> Result<Self> {
        if species.trim().is_empty() {
            return Err(SdmError::config("species label must not be empty"));
        }
        Ok(Self {
            path: path.into(),
            species: species.trim().to_string(),
            srs: srs.to_string(),
            default_srs: srs.to_string(),
            points: Vec::new(),
            envelope: None,
        })
    }

    pub fn open_with_default_srs(path: &Path, species: &str, default_srs: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| SdmError::io(path, e))?;
        let mut set = Self::empty(path, species, default_srs)?;
        parse_into(&mut set, path, &raw)?;
        tracing::debug!(
            path = %path.display(),
            species = %set.species,
            points = set.points.len(),
            "opened observations"
        );
        Ok(set)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn species(&self) -> &str {
        &self.species
    }

    pub fn srs(&self) -> &str {
        &self.srs
    }

    pub fn points(&self) -> &[Observation] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn presence_count(&self) -> usize {
        self.points.iter().filter(|p| p.present).count()
    }

    pub fn absence_count(&self) -> usize {
        self.points.len() - self.presence_count()
    }

    pub fn add_point(&mut self, point: Observation) {
        match self.envelope.as_mut() {
            Some(env) => env.expand_to_include(point.x, point.y),
            None => self.envelope = Some(Envelope::from_point(point.x, point.y)),
        }
        self.points.push(point);
    }
}

impl ObservationProvider for ObservationSet {
    fn open(path: &Path, species: &str) -> Result<Self> {
        Self::open_with_default_srs(path, species, DEFAULT_SRS)
    }

    fn copy_to(&self, path: &Path) -> Result<Self> {
        fs::copy(&self.path, path).map_err(|e| SdmError::io(path, e))?;
        Self::open_with_default_srs(path, &self.species, &self.default_srs)
    }

    fn envelope(&self) -> Option<Envelope> {
        self.envelope
    }
}

struct Columns {
    x: usize,
    y: usize,
    species: Option<usize>,
    presence: Option<usize>,
    srs: Option<usize>,
}

fn find_column(header: &[String], names: &[&str]) -> Option<usize> {
    header.iter().position(|h| names.contains(&h.as_str()))
}

fn split_row(line: &str) -> Vec<&str> {
    line.split(',')
        .map(|f| f.trim().trim_matches('"').trim())
        .collect()
}

fn parse_presence(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "presence" | "present" | "yes" => Some(true),
        "0" | "false" | "absence" | "absent" | "no" => Some(false),
        _ => None,
    }
}

fn parse_directive(line: &str) -> Option<String> {
    let body = line.trim_start_matches('#').trim();
    let rest = body.strip_prefix("srs")?;
    let value = rest.trim_start().strip_prefix(|c| c == '=' || c == ':')?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_header(line: &str) -> std::result::Result<Columns, String> {
    let header: Vec<String> = split_row(line)
        .into_iter()
        .map(|h| h.to_ascii_lowercase())
        .collect();
    let x = find_column(&header, X_COLUMNS).ok_or("header has no x/longitude column")?;
    let y = find_column(&header, Y_COLUMNS).ok_or("header has no y/latitude column")?;
    Ok(Columns {
        x,
        y,
        species: find_column(&header, SPECIES_COLUMNS),
        presence: find_column(&header, PRESENCE_COLUMNS),
        srs: find_column(&header, &["srs"]),
    })
}

fn parse_into(set: &mut ObservationSet, path: &Path, raw: &str) -> Result<()> {
    let err = |line: usize, reason: String| SdmError::ObservationParse {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut declared_srs: Option<String> = None;
    let mut columns: Option<Columns> = None;

    for (idx, line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') {
            if columns.is_none() {
                if let Some(srs) = parse_directive(trimmed) {
                    declared_srs = Some(srs);
                }
            }
            continue;
        }

        if columns.is_none() {
            columns = Some(parse_header(trimmed).map_err(|reason| err(line_no, reason))?);
            if let Some(srs) = declared_srs.as_ref() {
                set.srs = srs.clone();
            }
            continue;
        }
        let Some(cols) = columns.as_ref() else {
            continue;
        };

        let fields = split_row(trimmed);
        let get = |i: usize| fields.get(i).copied();

        if let Some(label) = cols.species.and_then(get) {
            if label != set.species {
                continue;
            }
        }

        let x = get(cols.x)
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| err(line_no, format!("invalid x value in '{}'", trimmed)))?;
        let y = get(cols.y)
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| err(line_no, format!("invalid y value in '{}'", trimmed)))?;
        let present = match cols.presence {
            Some(i) => parse_presence(get(i).unwrap_or(""))
                .ok_or_else(|| err(line_no, format!("invalid presence flag in '{}'", trimmed)))?,
            None => true,
        };

        let row_srs = cols.srs.and_then(get).filter(|s| !s.is_empty());
        let expected_srs = declared_srs.clone();
        match (row_srs, expected_srs.as_deref()) {
            (Some(row), Some(expected)) if row != expected => {
                return Err(err(
                    line_no,
                    format!("spatial reference '{}' does not match '{}'", row, expected),
                ));
            }
            (Some(row), None) if set.points.is_empty() => {
                declared_srs = Some(row.to_string());
                set.srs = row.to_string();
            }
            (Some(row), None) => {
                return Err(err(
                    line_no,
                    format!("spatial reference '{}' does not match '{}'", row, set.srs),
                ));
            }
            (None, None) if set.points.is_empty() => {
                declared_srs = Some(set.srs.clone());
            }
            _ => {}
        }

        set.add_point(Observation { x, y, present });
    }

    if columns.is_none() {
        return Err(err(0, "missing header row".to_string()));
    }
    Ok(())
}
