use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::envelope::Envelope;
use crate::error::{Result, SdmError};

pub const GRID_EXTENSION: &str = "asc";

/// One prepared covariate raster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CovariateImage {
    pub path: PathBuf,
    pub srs: String,
    pub envelope: Envelope,
}

impl CovariateImage {
    pub fn new(path: impl Into<PathBuf>, srs: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            path: path.into(),
            srs: srs.into(),
            envelope,
        }
    }

    /// Layer name as the fitter reports it: the file stem.
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Read an ESRI ASCII grid header to derive the envelope.
    pub fn from_ascii_grid(path: &Path, srs: &str) -> Result<Self> {
        let envelope = read_ascii_grid_envelope(path)?;
        Ok(Self::new(path, srs, envelope))
    }
}

/// Source of covariate images for a run.
pub trait CovariateProvider {
    fn list_available(&self) -> &[CovariateImage];

    fn resolve_by_name(&self, name: &str) -> Option<&CovariateImage>;
}

/// Immutable set of covariate images sharing one spatial reference.
#[derive(Debug, Clone, Default)]
pub struct CovariateSet {
    images: Vec<CovariateImage>,
}

impl CovariateSet {
    pub fn new(images: Vec<CovariateImage>) -> Result<Self> {
        let mut seen = HashSet::new();
        for image in &images {
            if !seen.insert(image.path.clone()) {
                return Err(SdmError::config(format!(
                    "covariate {} listed more than once",
                    image.path.display()
                )));
            }
        }
        if let Some(first) = images.first() {
            if let Some(other) = images.iter().find(|i| i.srs != first.srs) {
                return Err(SdmError::config(format!(
                    "covariate {} uses spatial reference '{}' but {} uses '{}'",
                    other.path.display(),
                    other.srs,
                    first.path.display(),
                    first.srs
                )));
            }
        }
        Ok(Self { images })
    }

    /// Load every `.asc` grid under `dir` (non-recursive), sorted by path.
    /// A sibling `.prj` file supplies the spatial reference, else `default_srs`.
    pub fn from_directory(dir: &Path, default_srs: &str) -> Result<Self> {
        let entries = fs::read_dir(dir).map_err(|e| SdmError::io(dir, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SdmError::io(dir, e))?;
            let path = entry.path();
            let is_grid = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(GRID_EXTENSION))
                .unwrap_or(false);
            if is_grid && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut images = Vec::with_capacity(paths.len());
        for path in paths {
            let srs = read_prj_srs(&path)?.unwrap_or_else(|| default_srs.to_string());
            images.push(CovariateImage::from_ascii_grid(&path, &srs)?);
        }
        tracing::debug!(dir = %dir.display(), count = images.len(), "loaded covariate grids");
        Self::new(images)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[CovariateImage] {
        &self.images
    }

    pub fn get(&self, index: usize) -> Option<&CovariateImage> {
        self.images.get(index)
    }

    pub fn srs(&self) -> Option<&str> {
        self.images.first().map(|i| i.srs.as_str())
    }

    /// Union of every image envelope.
    pub fn envelope(&self) -> Option<Envelope> {
        let mut iter = self.images.iter();
        let first = iter.next()?.envelope;
        Some(iter.fold(first, |acc, i| acc.union(&i.envelope)))
    }

    /// Resolve planned indices to images, in plan order.
    pub fn select(&self, indices: &[usize]) -> Result<Vec<CovariateImage>> {
        indices
            .iter()
            .map(|&idx| {
                self.images.get(idx).cloned().ok_or_else(|| {
                    SdmError::config(format!(
                        "covariate index {} out of range (have {})",
                        idx,
                        self.images.len()
                    ))
                })
            })
            .collect()
    }
}

impl CovariateProvider for CovariateSet {
    fn list_available(&self) -> &[CovariateImage] {
        &self.images
    }

    /// First image whose file name contains `name` as a substring.
    /// Parent directories are not searched.
    fn resolve_by_name(&self, name: &str) -> Option<&CovariateImage> {
        if name.is_empty() {
            return None;
        }
        self.images.iter().find(|i| i.file_name().contains(name))
    }
}

fn read_prj_srs(grid: &Path) -> Result<Option<String>> {
    let prj = grid.with_extension("prj");
    if !prj.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&prj).map_err(|e| SdmError::io(&prj, e))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.to_string()))
}

fn read_ascii_grid_envelope(path: &Path) -> Result<Envelope> {
    let file = fs::File::open(path).map_err(|e| SdmError::io(path, e))?;
    let mut header: BTreeMap<String, f64> = BTreeMap::new();
    for line in BufReader::new(file).lines().take(6) {
        let line = line.map_err(|e| SdmError::io(path, e))?;
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            break;
        };
        let key = key.to_ascii_lowercase();
        let Ok(value) = value.parse::<f64>() else {
            break;
        };
        header.insert(key, value);
    }

    let field = |k: &str| {
        header.get(k).copied().ok_or_else(|| {
            SdmError::config(format!(
                "ascii grid {} is missing header field '{}'",
                path.display(),
                k
            ))
        })
    };
    let ncols = field("ncols")?;
    let nrows = field("nrows")?;
    let cellsize = field("cellsize")?;
    let half = cellsize / 2.0;
    let min_x = match header.get("xllcorner") {
        Some(v) => *v,
        None => field("xllcenter")? - half,
    };
    let min_y = match header.get("yllcorner") {
        Some(v) => *v,
        None => field("yllcenter")? - half,
    };
    Ok(Envelope::new(
        min_x,
        min_y,
        min_x + ncols * cellsize,
        min_y + nrows * cellsize,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    fn scratch(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sdm_covariates_{}_{}_{}",
            label,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn write_grid(dir: &Path, name: &str, xll: &str) -> PathBuf {
        let path = dir.join(format!("{}.asc", name));
        let body = format!(
            "ncols 4\nnrows 2\n{} -10.0\nyllcorner 40.0\ncellsize 0.5\nNODATA_value -9999\n1 2 3 4\n5 6 7 8\n",
            xll
        );
        fs::write(&path, body).expect("write grid");
        path
    }

    fn image(path: &str, srs: &str) -> CovariateImage {
        CovariateImage::new(path, srs, Envelope::new(0.0, 0.0, 1.0, 1.0))
    }

    #[test]
    fn ascii_header_gives_envelope() {
        let dir = scratch("header");
        let path = write_grid(&dir, "bio1", "xllcorner");
        let img = CovariateImage::from_ascii_grid(&path, "EPSG:4326").expect("parse header");
        assert_eq!(img.envelope, Envelope::new(-10.0, 40.0, -8.0, 41.0));
        assert_eq!(img.name(), "bio1");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn ascii_header_accepts_cell_center_origin() {
        let dir = scratch("center");
        let path = dir.join("elev.asc");
        fs::write(
            &path,
            "ncols 2\nnrows 2\nxllcenter 0.5\nyllcenter 0.5\ncellsize 1\n0 0\n0 0\n",
        )
        .expect("write grid");
        let img = CovariateImage::from_ascii_grid(&path, "EPSG:4326").expect("parse header");
        assert_eq!(img.envelope, Envelope::new(0.0, 0.0, 2.0, 2.0));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn directory_scan_sorts_and_reads_prj() {
        let dir = scratch("scan");
        write_grid(&dir, "bio2", "xllcorner");
        write_grid(&dir, "bio1", "xllcorner");
        fs::write(dir.join("notes.txt"), "ignored").expect("write notes");
        fs::write(dir.join("bio1.prj"), "\nEPSG:3857\n").expect("write prj");
        fs::write(dir.join("bio2.prj"), "EPSG:3857").expect("write prj");

        let set = CovariateSet::from_directory(&dir, "EPSG:4326").expect("load set");
        let names: Vec<String> = set.images().iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["bio1", "bio2"]);
        assert_eq!(set.srs(), Some("EPSG:3857"));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn mixed_spatial_reference_is_rejected() {
        let err = CovariateSet::new(vec![image("/c/a.asc", "EPSG:4326"), image("/c/b.asc", "EPSG:3857")])
            .expect_err("mixed srs must fail");
        assert!(matches!(err, SdmError::Configuration(_)));
        assert!(err.to_string().contains("EPSG:3857"));
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let err = CovariateSet::new(vec![image("/c/a.asc", "x"), image("/c/a.asc", "x")])
            .expect_err("duplicate path must fail");
        assert!(matches!(err, SdmError::Configuration(_)));
    }

    #[test]
    fn resolve_by_name_uses_substring_containment() {
        let set = CovariateSet::new(vec![
            image("/clim/bio10.asc", "x"),
            image("/clim/bio1.asc", "x"),
        ])
        .expect("set");
        // "bio1" is contained in "bio10.asc", which comes first.
        assert_eq!(
            set.resolve_by_name("bio1").map(|i| i.name()),
            Some("bio10".to_string())
        );
        assert_eq!(
            set.resolve_by_name("bio1.asc").map(|i| i.name()),
            Some("bio1".to_string())
        );
        assert!(set.resolve_by_name("slope").is_none());
        assert!(set.resolve_by_name("").is_none());
    }

    #[test]
    fn resolve_by_name_ignores_directory_names() {
        let set = CovariateSet::new(vec![
            image("/data/tmax_grids/prec.asc", "x"),
            image("/data/tmax_grids/tmax.asc", "x"),
        ])
        .expect("set");
        assert_eq!(
            set.resolve_by_name("tmax").map(|i| i.name()),
            Some("tmax".to_string())
        );
        assert!(set.resolve_by_name("grids").is_none());
    }

    #[test]
    fn select_rejects_out_of_range_index() {
        let set = CovariateSet::new(vec![image("/c/a.asc", "x")]).expect("set");
        assert_eq!(set.select(&[0]).expect("in range").len(), 1);
        assert!(set.select(&[1]).is_err());
    }
}
