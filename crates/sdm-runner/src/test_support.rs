use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sdm_core::CovariateSet;

static SEQ: AtomicU64 = AtomicU64::new(0);

pub fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sdm_runner_{}_{}_{}_{}",
        label,
        std::process::id(),
        chrono::Utc::now().timestamp_micros(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

pub fn write_observations(dir: &Path, species: &str, points: usize) -> PathBuf {
    fs::create_dir_all(dir).expect("observation dir");
    let mut body = String::from("#srs=EPSG:4326\nspecies,x,y,presence\n");
    for i in 0..points {
        body.push_str(&format!("{},{}.5,{}.25,{}\n", species, i, 40 + i, i % 2));
    }
    let path = dir.join("occurrences.csv");
    fs::write(&path, body).expect("write observations");
    path
}

/// `cov0.asc` .. `cov{n-1}.asc`, each with distinct cell values.
pub fn covariate_set(dir: &Path, n: usize) -> CovariateSet {
    fs::create_dir_all(dir).expect("covariate dir");
    for i in 0..n {
        let body = format!(
            "ncols 2\nnrows 2\nxllcorner -5.0\nyllcorner 35.0\ncellsize 10.0\nNODATA_value -9999\n{i} {i}\n{i} {i}\n"
        );
        fs::write(dir.join(format!("cov{}.asc", i)), body).expect("write grid");
    }
    CovariateSet::from_directory(dir, "EPSG:4326").expect("load covariates")
}
