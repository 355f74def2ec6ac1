use serde::{Deserialize, Serialize};

/// Row count the operator tables carry
pub const DEFAULT_ROWS: usize = 2;

/// Upper bound of points in one scan
pub const MAX_POINTS: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanField {
    Start,
    Middle,
    End,
    Step,
    Count,
    Dwell,
}

impl ScanField {
    pub const ALL: [ScanField; 6] = [
        ScanField::Start,
        ScanField::Middle,
        ScanField::End,
        ScanField::Step,
        ScanField::Count,
        ScanField::Dwell,
    ];
}

impl std::fmt::Display for ScanField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanField::Start => write!(f, "Start"),
            ScanField::Middle => write!(f, "Middle"),
            ScanField::End => write!(f, "End"),
            ScanField::Step => write!(f, "Step"),
            ScanField::Count => write!(f, "Num. of Points"),
            ScanField::Dwell => write!(f, "Time"),
        }
    }
}

impl std::str::FromStr for ScanField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(ScanField::Start),
            "middle" => Ok(ScanField::Middle),
            "end" => Ok(ScanField::End),
            "step" => Ok(ScanField::Step),
            "count" | "num" | "num. of points" => Ok(ScanField::Count),
            "dwell" | "time" => Ok(ScanField::Dwell),
            other => Err(format!("Unknown scan field '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    NoSuchRow(usize),
    NotANumber {
        row: usize,
        field: ScanField,
        text: String,
    },
    OutOfRange {
        row: usize,
        field: ScanField,
        reason: &'static str,
    },
    EmptyScan,
    TooManyPoints(u32),
    NonFiniteRow,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::NoSuchRow(row) => {
                write!(f, "Parameter row {} does not exist", row + 1)
            }
            ValidationError::NotANumber { row, field, text } => write!(
                f,
                "Parameter {}, {}: '{}' is not a valid number",
                row + 1,
                field,
                text
            ),
            ValidationError::OutOfRange { row, field, reason } => {
                write!(f, "Parameter {}, {}: {}", row + 1, field, reason)
            }
            ValidationError::EmptyScan => write!(f, "Scan has no points (count is 0)"),
            ValidationError::TooManyPoints(n) => {
                write!(f, "Scan of {} points exceeds the limit of {}", n, MAX_POINTS)
            }
            ValidationError::NonFiniteRow => write!(f, "Scan parameters must be finite numbers"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// One configured linear sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanParameterRow {
    #[serde(rename = "Start")]
    pub start: f64,

    #[serde(rename = "Middle")]
    pub middle: f64,

    #[serde(rename = "End")]
    pub end: f64,

    #[serde(rename = "Step")]
    pub step: f64,

    #[serde(rename = "Count")]
    pub count: u32,

    /// Detector integration time, seconds
    #[serde(rename = "Dwell")]
    pub dwell: f64,
}

impl ScanParameterRow {
    /// Build a consistent row spanning `start..=end` with `count` points.
    pub fn new(start: f64, end: f64, count: u32, dwell: f64) -> Self {
        let mut row = Self {
            start,
            middle: (start + end) / 2.0,
            end,
            step: 0.0,
            count,
            dwell,
        };
        row.derive_step();
        row
    }

    /// Commanded positions, `count` points evenly spread from start to end.
    pub fn positions(&self) -> Vec<f64> {
        linspace(self.start, self.end, self.count as usize)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if ![self.start, self.middle, self.end, self.step, self.dwell]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(ValidationError::NonFiniteRow);
        }
        if self.count == 0 {
            return Err(ValidationError::EmptyScan);
        }
        if self.count > MAX_POINTS {
            return Err(ValidationError::TooManyPoints(self.count));
        }
        Ok(())
    }

    fn derive_step(&mut self) {
        self.step = match self.count {
            0 => 0.0,
            1 => self.end - self.start,
            n => (self.end - self.start) / (n - 1) as f64,
        };
    }

    /// Points a sweep over this row's span produces at `step`.
    fn points_for_step(&self, step: f64) -> f64 {
        ((self.end - self.start).abs() / step.abs()).round() + 1.0
    }

    fn apply(&mut self, field: ScanField, value: f64) {
        match field {
            ScanField::Start | ScanField::End => {
                if field == ScanField::Start {
                    self.start = value;
                } else {
                    self.end = value;
                }
                self.middle = (self.start + self.end) / 2.0;
                self.derive_step();
            }
            ScanField::Middle => {
                self.middle = value;
                self.end = 2.0 * value - self.start;
                self.derive_step();
            }
            ScanField::Step => {
                if value != 0.0 {
                    if (self.end - self.start) / value < 0.0 {
                        std::mem::swap(&mut self.start, &mut self.end);
                    }
                    self.count = self.points_for_step(value) as u32;
                    // snap to the grid the new count really produces
                    self.derive_step();
                } else {
                    self.step = 0.0;
                    self.count = 0;
                }
            }
            ScanField::Count => {
                self.count = value as u32;
                if self.count <= 1 {
                    self.count = 1;
                }
                self.derive_step();
            }
            ScanField::Dwell => self.dwell = value,
        }
    }
}

/// Two scan parameter rows with their derived-field rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTable {
    rows: Vec<ScanParameterRow>,
}

impl Default for ScanTable {
    fn default() -> Self {
        Self::new(default_rows())
    }
}

impl ScanTable {
    pub fn new(rows: Vec<ScanParameterRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[ScanParameterRow] {
        &self.rows
    }

    pub fn read(&self, row: usize) -> Result<ScanParameterRow, ValidationError> {
        self.rows
            .get(row)
            .copied()
            .ok_or(ValidationError::NoSuchRow(row))
    }

    /// Parse operator input and reconcile the dependent fields of the row.
    pub fn set_field(
        &mut self,
        row: usize,
        field: ScanField,
        text: &str,
    ) -> Result<ScanParameterRow, ValidationError> {
        let value = text
            .trim()
            .parse::<f64>()
            .map_err(|_| ValidationError::NotANumber {
                row,
                field,
                text: text.to_owned(),
            })?;
        self.set_value(row, field, value)
    }

    pub fn set_value(
        &mut self,
        row: usize,
        field: ScanField,
        value: f64,
    ) -> Result<ScanParameterRow, ValidationError> {
        if row >= self.rows.len() {
            return Err(ValidationError::NoSuchRow(row));
        }
        check_value(row, field, value)?;

        let r = &mut self.rows[row];
        if field == ScanField::Step
            && value != 0.0
            && r.points_for_step(value) > MAX_POINTS as f64
        {
            return Err(ValidationError::OutOfRange {
                row,
                field,
                reason: "too many points",
            });
        }
        r.apply(field, value);
        r.apply(field, value);
        tracing::trace!("Scan table row {}: {:?}", row, r);
        Ok(*r)
    }
}

fn check_value(row: usize, field: ScanField, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::OutOfRange {
            row,
            field,
            reason: "value must be finite",
        });
    }
    match field {
        ScanField::Count if value < 0.0 || value.fract() != 0.0 => {
            Err(ValidationError::OutOfRange {
                row,
                field,
                reason: "must be a non-negative integer",
            })
        }
        ScanField::Count if value > MAX_POINTS as f64 => Err(ValidationError::OutOfRange {
            row,
            field,
            reason: "too many points",
        }),
        ScanField::Dwell if value < 0.0 => Err(ValidationError::OutOfRange {
            row,
            field,
            reason: "must not be negative",
        }),
        _ => Ok(()),
    }
}

pub fn default_rows() -> Vec<ScanParameterRow> {
    vec![
        ScanParameterRow::new(0.0, 10.0, 11, 0.5),
        ScanParameterRow::new(0.0, 20.0, 11, 1.0),
    ]
}

pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        n => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}
