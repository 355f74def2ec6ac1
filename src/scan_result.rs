use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fit::{FitKind, FittedCurve};
use crate::scan_engine::{ScanReport, ScanSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRecord {
    pub kind: FitKind,
    #[serde(with = "series")]
    pub parameters: Vec<f64>,
    #[serde(with = "series")]
    pub fit_x: Vec<f64>,
    #[serde(with = "series")]
    pub fit_y: Vec<f64>,
}

/// Saved scan: observations and the curves fitted to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub label: String,
    pub motor: String,
    pub detector: String,
    #[serde(with = "series")]
    pub x: Vec<f64>,
    #[serde(with = "series")]
    pub y: Vec<f64>,
    pub fits: Vec<FitRecord>,
}

/// JSON has no NaN or infinity: such samples are stored as text
/// (`"NaN"`, `"inf"`, `"-inf"`), a `null` sample reads back as NaN.
mod series {
    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Sample {
        Number(f64),
        Text(String),
        Missing,
    }

    impl Sample {
        fn value(self) -> Result<f64, String> {
            match self {
                Sample::Number(v) => Ok(v),
                Sample::Missing => Ok(f64::NAN),
                Sample::Text(t) => t.parse().map_err(|_| format!("'{t}' is not a number")),
            }
        }
    }

    impl From<f64> for Sample {
        fn from(v: f64) -> Self {
            if v.is_finite() {
                Sample::Number(v)
            } else {
                Sample::Text(v.to_string())
            }
        }
    }

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|v| Sample::from(*v)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Sample>::deserialize(deserializer)?
            .into_iter()
            .map(Sample::value)
            .collect::<Result<_, _>>()
            .map_err(D::Error::custom)
    }
}

#[derive(Debug)]
pub enum ResultFileError {
    Io(PathBuf, std::io::Error),
    Format(PathBuf, serde_json::Error),
    BadPattern(PathBuf),
}

impl std::fmt::Display for ResultFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultFileError::Io(p, e) => write!(f, "{:?}: {}", p, e),
            ResultFileError::Format(p, e) => write!(f, "{:?}: invalid scan file: {}", p, e),
            ResultFileError::BadPattern(p) => write!(f, "Invalid file name pattern {:?}", p),
        }
    }
}

impl std::error::Error for ResultFileError {}

impl ScanResult {
    /// `motor`/`detector` keep the catalog aliases, units belong to `label`.
    pub fn from_snapshot(label: impl Into<String>, snapshot: &ScanSnapshot) -> Self {
        Self {
            label: label.into(),
            motor: snapshot.motor_alias.clone(),
            detector: snapshot.detector_alias.clone(),
            x: snapshot.x.clone(),
            y: snapshot.y.clone(),
            fits: snapshot
                .fits
                .iter()
                .map(|(kind, c)| FitRecord {
                    kind: *kind,
                    parameters: c.parameters.clone(),
                    fit_x: c.dense_x.clone(),
                    fit_y: c.dense_y.clone(),
                })
                .collect(),
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = FitKind> + '_ {
        self.fits.iter().map(|f| f.kind)
    }

    pub fn curves(&self) -> BTreeMap<FitKind, FittedCurve> {
        self.fits
            .iter()
            .map(|f| {
                (
                    f.kind,
                    FittedCurve {
                        parameters: f.parameters.clone(),
                        dense_x: f.fit_x.clone(),
                        dense_y: f.fit_y.clone(),
                    },
                )
            })
            .collect()
    }

    /// Report of the saved coefficients, empty curves skipped
    pub fn report(&self) -> ScanReport {
        let parameters = self
            .fits
            .iter()
            .filter(|f| !f.parameters.is_empty())
            .map(|f| (f.kind, f.parameters.clone()))
            .collect::<BTreeMap<_, _>>();
        let optima = parameters
            .iter()
            .filter_map(|(k, p)| k.optimum(p).map(|o| (*k, o)))
            .collect();
        ScanReport { parameters, optima }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ResultFileError> {
        let path = path.as_ref();
        let file =
            std::fs::File::create(path).map_err(|e| ResultFileError::Io(path.to_owned(), e))?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| ResultFileError::Format(path.to_owned(), e))?;

        tracing::info!("Scan saved to {:?}", path);
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ResultFileError> {
        let path = path.as_ref();
        let file =
            std::fs::File::open(path).map_err(|e| ResultFileError::Io(path.to_owned(), e))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| ResultFileError::Format(path.to_owned(), e))
    }
}

/// `pattern` is a chrono format string, e.g. `scan-%Y%m%d-%H%M%S`
pub fn default_file_name(pattern: &Path) -> Result<PathBuf, ResultFileError> {
    use std::fmt::Write;

    let now = chrono::offset::Local::now();
    let mut path_main = String::new();
    write!(path_main, "{}", now.format(&pattern.to_string_lossy()))
        .map_err(|_| ResultFileError::BadPattern(pattern.to_owned()))?;

    Ok(PathBuf::from(format!("{path_main}-scan.json")))
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::fit::{fit_all, gaussian};
    use crate::scan_table::linspace;

    fn snapshot() -> ScanSnapshot {
        let x = linspace(-1.0, 1.0, 21);
        let y = x
            .iter()
            .map(|x| gaussian(*x, 0.2, 0.3, 2.0) + 1.0 / 3.0)
            .collect::<Vec<_>>();
        let fits = fit_all([FitKind::Linear, FitKind::Gaussian], &x, &y)
            .into_iter()
            .map(|(k, r)| (k, r.unwrap_or_default()))
            .collect();

        ScanSnapshot {
            step: 21,
            total: 21,
            motor: "Z (mm)".to_owned(),
            detector: "Intensity (counts)".to_owned(),
            motor_alias: "Z".to_owned(),
            detector_alias: "Intensity".to_owned(),
            x,
            y,
            fits,
            status: "Finished, 21 points".to_owned(),
        }
    }

    #[test]
    fn file_roundtrip() {
        let snapshot = snapshot();
        let result = ScanResult::from_snapshot("Z vs Intensity", &snapshot);

        let path = std::env::temp_dir().join(format!(
            "stage-scan-result-{}.json",
            std::process::id()
        ));
        result.save(&path).unwrap();
        let loaded = ScanResult::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.x, snapshot.x);
        assert_eq!(loaded.y, snapshot.y);
        assert_eq!(loaded.curves(), snapshot.fits);
        assert_eq!(loaded, result);
        assert_eq!((loaded.motor.as_str(), loaded.detector.as_str()), ("Z", "Intensity"));
    }

    #[test]
    fn non_finite_samples_survive_file() {
        let mut snapshot = snapshot();
        snapshot.y[1] = f64::NAN;
        snapshot.y[2] = f64::INFINITY;
        snapshot.x[3] = f64::NEG_INFINITY;
        let result = ScanResult::from_snapshot("Z vs Intensity", &snapshot);

        let path = std::env::temp_dir().join(format!(
            "stage-scan-nan-{}.json",
            std::process::id()
        ));
        result.save(&path).unwrap();
        let loaded = ScanResult::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(loaded.y[1].is_nan());
        assert_eq!(loaded.y[2], f64::INFINITY);
        assert_eq!(loaded.x[3], f64::NEG_INFINITY);
        assert_eq!(loaded.y[0], snapshot.y[0]);
        assert_eq!(loaded.fits, result.fits);
    }

    #[test]
    fn null_sample_reads_as_nan() {
        let text = r#"{"label": "l", "motor": "Z", "detector": "I",
            "x": [1.0, 2.0, 3.0], "y": [1.0, null, 3.0], "fits": []}"#;
        let loaded: ScanResult = serde_json::from_str(text).unwrap();
        assert_eq!(loaded.x, vec![1.0, 2.0, 3.0]);
        assert!(loaded.y[1].is_nan());

        let text = r#"{"label": "l", "motor": "Z", "detector": "I",
            "x": ["abc"], "y": [1.0], "fits": []}"#;
        assert!(serde_json::from_str::<ScanResult>(text).is_err());
    }

    #[test]
    fn document_layout() {
        let result = ScanResult::from_snapshot("l", &snapshot());
        let v = serde_json::to_value(&result).unwrap();

        for key in ["label", "motor", "detector", "x", "y", "fits"] {
            assert!(v.get(key).is_some(), "{key} missing");
        }
        assert_eq!(v["fits"][0]["kind"], "Linear");
        assert!(v["fits"][0]["fit_x"].is_array());
        assert_eq!(result.kinds().count(), 2);
    }

    #[test]
    fn report_skips_empty() {
        let mut result = ScanResult::from_snapshot("l", &snapshot());
        result.fits.push(FitRecord {
            kind: FitKind::Lorentzian,
            parameters: vec![],
            fit_x: vec![],
            fit_y: vec![],
        });
        let report = result.report();
        assert!(report.parameters.contains_key(&FitKind::Linear));
        assert!(!report.parameters.contains_key(&FitKind::Lorentzian));
        assert!(!report.optima.contains_key(&FitKind::Linear));
    }

    #[test]
    fn file_name_from_pattern() {
        let name = default_file_name(Path::new("scan-%Y")).unwrap();
        let s = name.to_string_lossy();
        assert!(s.starts_with("scan-2"));
        assert!(s.ends_with("-scan.json"));
    }

    #[test]
    fn load_errors() {
        assert!(matches!(
            ScanResult::load("/nonexistent/scan.json"),
            Err(ResultFileError::Io(..))
        ));
    }
}
