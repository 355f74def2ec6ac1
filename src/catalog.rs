use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    Motor,
    Detector,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Motor => write!(f, "Motor"),
            ChannelKind::Detector => write!(f, "Detector"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "Alias")]
    pub alias: String,

    #[serde(rename = "Type")]
    pub kind: ChannelKind,

    #[serde(rename = "PV")]
    pub pv: String,

    #[serde(rename = "EGU")]
    pub egu: String,
}

#[derive(Debug)]
pub enum ConfigurationError {
    Read { path: PathBuf, message: String },
    MissingColumn(&'static str),
    UnknownAlias { kind: ChannelKind, alias: String },
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigurationError::Read { path, message } => {
                write!(f, "Error loading channel catalog {:?}: {}", path, message)
            }
            ConfigurationError::MissingColumn(c) => {
                write!(f, "Column '{c}' not found in the channel catalog")
            }
            ConfigurationError::UnknownAlias { kind, alias } => {
                write!(f, "{kind} '{alias}' not found in the channel catalog")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// Suffixes appended to a motor base name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorSuffixes {
    pub command: String,
    pub readback: String,
}

impl Default for MotorSuffixes {
    fn default() -> Self {
        Self {
            command: ".VAL".to_owned(),
            readback: ".RBV".to_owned(),
        }
    }
}

const COLUMNS: [&str; 4] = ["Alias", "Type", "PV", "EGU"];

/// Alias -> channel table
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelCatalog {
    entries: Vec<CatalogEntry>,
    #[serde(skip)]
    suffixes: MotorSuffixes,
}

impl ChannelCatalog {
    pub fn from_entries(entries: Vec<CatalogEntry>, suffixes: MotorSuffixes) -> Self {
        let mut catalog = Self {
            entries: vec![],
            suffixes,
        };
        for entry in entries {
            if catalog.find(entry.kind, &entry.alias).is_some() {
                tracing::warn!(
                    "Duplicate {} alias '{}' ({}) ignored",
                    entry.kind,
                    entry.alias,
                    entry.pv
                );
            } else {
                catalog.entries.push(entry);
            }
        }
        catalog
    }

    /// Read the first worksheet of an xlsx file with columns Alias, Type, PV, EGU.
    pub fn load_xlsx(
        path: impl AsRef<Path>,
        suffixes: MotorSuffixes,
    ) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let read_err = |message: String| ConfigurationError::Read {
            path: path.to_owned(),
            message,
        };

        let book = umya_spreadsheet::reader::xlsx::read(path).map_err(|e| read_err(e.to_string()))?;
        let sheet = book
            .get_sheet_collection()
            .first()
            .ok_or_else(|| read_err("workbook has no sheets".to_owned()))?;

        let width = sheet.get_highest_column();
        let height = sheet.get_highest_row();

        let header = (1..=width)
            .map(|col| sheet.get_value(cell(col, 1)).trim().to_owned())
            .collect::<Vec<_>>();

        let mut columns = [0u32; COLUMNS.len()];
        for (i, name) in COLUMNS.iter().enumerate() {
            let pos = header
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .ok_or(ConfigurationError::MissingColumn(*name))?;
            columns[i] = pos as u32 + 1;
        }
        let [alias_col, type_col, pv_col, egu_col] = columns;

        let mut entries = vec![];
        for row in 2..=height {
            let alias = sheet.get_value(cell(alias_col, row)).trim().to_owned();
            if alias.is_empty() {
                continue;
            }
            let kind = match sheet.get_value(cell(type_col, row)).trim() {
                t if t.eq_ignore_ascii_case("motor") => ChannelKind::Motor,
                t if t.eq_ignore_ascii_case("detector") => ChannelKind::Detector,
                other => {
                    tracing::warn!("Row {}: unknown channel type '{}', skipped", row, other);
                    continue;
                }
            };
            entries.push(CatalogEntry {
                alias,
                kind,
                pv: sheet.get_value(cell(pv_col, row)).trim().to_owned(),
                egu: sheet.get_value(cell(egu_col, row)).trim().to_owned(),
            });
        }

        tracing::info!("Loaded {} channels from {:?}", entries.len(), path);
        Ok(Self::from_entries(entries, suffixes))
    }

    /// Write the catalog in the same layout [`ChannelCatalog::load_xlsx`] reads.
    pub fn save_xlsx(&self, path: impl AsRef<Path>) -> Result<(), ConfigurationError> {
        let path = path.as_ref();
        let mut book = umya_spreadsheet::new_file();
        let sheet = book
            .get_sheet_by_name_mut("Sheet1")
            .ok_or_else(|| ConfigurationError::Read {
                path: path.to_owned(),
                message: "Can't create worksheet".to_owned(),
            })?;

        for (col, name) in COLUMNS.iter().enumerate() {
            sheet
                .get_cell_value_mut(cell(col as u32 + 1, 1))
                .set_value(name.to_string());
        }
        for (i, e) in self.entries.iter().enumerate() {
            let row = i as u32 + 2;
            let values = [e.alias.clone(), e.kind.to_string(), e.pv.clone(), e.egu.clone()];
            for (col, value) in values.into_iter().enumerate() {
                sheet
                    .get_cell_value_mut(cell(col as u32 + 1, row))
                    .set_value(value);
            }
        }

        umya_spreadsheet::writer::xlsx::write(&book, path).map_err(|e| {
            ConfigurationError::Read {
                path: path.to_owned(),
                message: e.to_string(),
            }
        })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn aliases(&self, kind: ChannelKind) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |e| e.kind == kind)
            .map(|e| e.alias.as_str())
    }

    pub fn find(&self, kind: ChannelKind, alias: &str) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && e.alias == alias)
    }

    fn require(&self, kind: ChannelKind, alias: &str) -> Result<&CatalogEntry, ConfigurationError> {
        self.find(kind, alias)
            .ok_or_else(|| ConfigurationError::UnknownAlias {
                kind,
                alias: alias.to_owned(),
            })
    }

    pub fn resolve(
        &self,
        motor: &str,
        detector: &str,
    ) -> Result<ChannelBinding, ConfigurationError> {
        let m = self.require(ChannelKind::Motor, motor)?;
        let d = self.require(ChannelKind::Detector, detector)?;

        Ok(ChannelBinding {
            motor_alias: m.alias.clone(),
            detector_alias: d.alias.clone(),
            motor_command_channel: format!("{}{}", m.pv, self.suffixes.command),
            motor_readback_channel: format!("{}{}", m.pv, self.suffixes.readback),
            detector_channel: d.pv.clone(),
            motor_units: m.egu.clone(),
            detector_units: d.egu.clone(),
        })
    }

    /// Catalog of the channels served by the simulated instrument.
    pub fn simulator_template(prefix: &str) -> Self {
        let entry = |alias: &str, kind, pv: &str, egu: &str| CatalogEntry {
            alias: alias.to_owned(),
            kind,
            pv: format!("{prefix}{pv}"),
            egu: egu.to_owned(),
        };
        Self::from_entries(
            vec![
                entry("Z", ChannelKind::Motor, "z", "mm"),
                entry("Theta", ChannelKind::Motor, "theta", "deg"),
                entry("Time", ChannelKind::Motor, "time", "s"),
                entry("Intensity", ChannelKind::Detector, "intensity", "counts"),
                entry("Noise", ChannelKind::Detector, "gaussian_noise", "counts"),
            ],
            MotorSuffixes::default(),
        )
    }
}

/// "A1"-style reference, 1-based column and row
fn cell(col: u32, row: u32) -> String {
    let mut letters = vec![];
    let mut n = col;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect::<String>() + &row.to_string()
}
