use std::collections::BTreeMap;

use itertools::Itertools;
use nalgebra::{DMatrix, DVector};
use num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::scan_table::linspace;

/// Dense curve resolution relative to the observed sample count
pub const DENSE_FACTOR: usize = 10;

/// Minimal number of observations before any nonlinear fit is attempted
pub const MIN_FIT_POINTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FitKind {
    Linear,
    Gaussian,
    Lorentzian,
    ErrorFunction,
}

impl FitKind {
    pub const ALL: [FitKind; 4] = [
        FitKind::Linear,
        FitKind::Gaussian,
        FitKind::Lorentzian,
        FitKind::ErrorFunction,
    ];

    pub fn parameter_names(&self) -> &'static [&'static str] {
        match self {
            FitKind::Linear => &["slope", "intercept"],
            FitKind::Gaussian => &["x0", "width", "scale"],
            FitKind::Lorentzian => &["amplitude", "x0", "gamma"],
            FitKind::ErrorFunction => &["x0", "scale", "width"],
        }
    }

    /// Evaluate the model with coefficients in [`FitKind::parameter_names`] order.
    pub fn evaluate(&self, x: f64, p: &[f64]) -> Option<f64> {
        match (self, p) {
            (FitKind::Linear, [slope, intercept]) => Some(linear(x, *slope, *intercept)),
            (FitKind::Gaussian, [x0, width, scale]) => Some(gaussian(x, *x0, *width, *scale)),
            (FitKind::Lorentzian, [a, x0, gamma]) => Some(lorentzian(x, *a, *x0, *gamma)),
            (FitKind::ErrorFunction, [x0, scale, width]) => {
                Some(error_function(x, *x0, *scale, *width))
            }
            _ => None,
        }
    }

    /// Best aligned position from the fitted coefficients, if the model has one.
    pub fn optimum(&self, p: &[f64]) -> Option<f64> {
        match self {
            FitKind::Gaussian | FitKind::ErrorFunction => p.first().copied(),
            FitKind::Lorentzian => p.get(1).copied(),
            FitKind::Linear => None,
        }
    }

    pub fn fit(&self, x: &[f64], y: &[f64]) -> Result<Vec<f64>, FitError> {
        if x.len() != y.len() {
            return Err(FitError::LengthMismatch(x.len(), y.len()));
        }
        if x.iter().chain(y).any(|v| !v.is_finite()) {
            return Err(FitError::NonFinite);
        }
        match self {
            FitKind::Linear => fit_linear(x, y),
            FitKind::Gaussian => {
                let (x0, width) = peak_guess(x, y);
                // (x0, width) nonlinear, scale linear
                let (p, c) =
                    fit_separable(x, y, gauss_basis, d_gauss_dx0, d_gauss_dw, [x0, width])?;
                // width only enters squared
                Ok(vec![p[0], p[1].abs(), c])
            }
            FitKind::Lorentzian => {
                let (x0, gamma) = peak_guess(x, y);
                let (p, c) =
                    fit_separable(x, y, lorentz_basis, d_lorentz_dx0, d_lorentz_dg, [x0, gamma])?;
                Ok(vec![c, p[0], p[1].abs()])
            }
            FitKind::ErrorFunction => {
                let (x0, width) = edge_guess(x, y);
                let (p, c) =
                    fit_separable(x, y, edge_basis, d_edge_dx0, d_edge_dw, [x0, width])?;
                Ok(vec![p[0], c, p[1]])
            }
        }
    }
}

impl std::fmt::Display for FitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitKind::Linear => write!(f, "Linear"),
            FitKind::Gaussian => write!(f, "Gaussian"),
            FitKind::Lorentzian => write!(f, "Lorentz"),
            FitKind::ErrorFunction => write!(f, "Error function"),
        }
    }
}

impl std::str::FromStr for FitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "linear" | "line" => Ok(FitKind::Linear),
            "gaussian" | "gauss" => Ok(FitKind::Gaussian),
            "lorentz" | "lorentzian" => Ok(FitKind::Lorentzian),
            "errorfunction" | "erf" | "edge" => Ok(FitKind::ErrorFunction),
            _ => Err(format!("Unknown fit function '{s}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FitError {
    LengthMismatch(usize, usize),
    TooFewPoints { required: usize, got: usize },
    Model(String),
    NotConverged(String),
    NonFinite,
}

impl std::fmt::Display for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitError::LengthMismatch(x, y) => write!(f, "x has {x} points but y has {y}"),
            FitError::TooFewPoints { required, got } => {
                write!(f, "at least {required} points required, got {got}")
            }
            FitError::Model(e) => write!(f, "model setup failed: {e}"),
            FitError::NotConverged(reason) => write!(f, "fit did not converge: {reason}"),
            FitError::NonFinite => write!(f, "non-finite data or coefficients"),
        }
    }
}

impl std::error::Error for FitError {}

/// Fitted coefficients together with a smooth curve for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FittedCurve {
    pub parameters: Vec<f64>,
    pub dense_x: Vec<f64>,
    pub dense_y: Vec<f64>,
}

impl FittedCurve {
    /// "No curve yet"
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Resample the model over `[x.first, x.last]` with [`DENSE_FACTOR`] times more points.
    pub fn resample(kind: FitKind, parameters: Vec<f64>, x: &[f64]) -> Self {
        let (Some(first), Some(last)) = (x.first(), x.last()) else {
            return Self {
                parameters,
                ..Default::default()
            };
        };
        let dense_x = linspace(*first, *last, x.len() * DENSE_FACTOR);
        let dense_y = dense_x
            .iter()
            .map(|x| kind.evaluate(*x, &parameters).unwrap_or(f64::NAN))
            .collect();
        Self {
            parameters,
            dense_x,
            dense_y,
        }
    }
}

/// Fit every requested kind independently. Failed kinds are reported
/// separately and never affect the others.
pub fn fit_all(
    kinds: impl IntoIterator<Item = FitKind>,
    x: &[f64],
    y: &[f64],
) -> BTreeMap<FitKind, Result<FittedCurve, FitError>> {
    kinds
        .into_iter()
        .map(|kind| {
            let res = kind
                .fit(x, y)
                .map(|p| FittedCurve::resample(kind, p, x));
            (kind, res)
        })
        .collect()
}

//-----------------------------------------------------------------------------

pub fn error_function<T: Float>(x: T, x0: T, scale: T, width: T) -> T {
    let two = T::one() + T::one();
    scale * (T::one() + ((x - x0) / width).tanh()) / two
}

pub fn gaussian<T: Float>(x: T, x0: T, width: T, scale: T) -> T {
    let two = T::one() + T::one();
    scale * (-(x - x0).powi(2) / (two * width.powi(2))).exp()
}

pub fn linear<T: Float>(x: T, slope: T, intercept: T) -> T {
    slope * x + intercept
}

pub fn lorentzian<T: Float>(x: T, amplitude: T, x0: T, gamma: T) -> T {
    amplitude / (T::one() + ((x - x0) / gamma).powi(2))
}

//-----------------------------------------------------------------------------

fn fit_linear(x: &[f64], y: &[f64]) -> Result<Vec<f64>, FitError> {
    if x.len() < 2 {
        return Err(FitError::TooFewPoints {
            required: 2,
            got: x.len(),
        });
    }
    if x.iter().all(|v| *v == x[0]) {
        return Err(FitError::NotConverged("all x values are equal".to_owned()));
    }

    let a = DMatrix::<f64>::from_fn(x.len(), 2, |i, j| if j == 0 { x[i] } else { 1.0 });
    let b = DVector::<f64>::from_column_slice(y);
    let coeffs = a
        .svd(true, true)
        .solve(&b, f64::EPSILON)
        .map_err(|e| FitError::NotConverged(e.to_owned()))?;

    finite(vec![coeffs[0], coeffs[1]])
}

type Basis = fn(&DVector<f64>, f64, f64) -> DVector<f64>;

/// y = c * f(x, a, b), `c` solved as the linear coefficient.
fn fit_separable(
    x: &[f64],
    y: &[f64],
    f: Basis,
    df_da: Basis,
    df_db: Basis,
    initial: [f64; 2],
) -> Result<([f64; 2], f64), FitError> {
    use varpro::model::SeparableModel;
    use varpro::prelude::*;
    use varpro::solvers::levmar::{LevMarProblemBuilder, LevMarSolver};

    if x.len() < MIN_FIT_POINTS {
        return Err(FitError::TooFewPoints {
            required: MIN_FIT_POINTS,
            got: x.len(),
        });
    }

    let x = DVector::<f64>::from_column_slice(x);
    let y = DVector::<f64>::from_column_slice(y);

    let model = SeparableModelBuilder::<f64>::new(&["a", "b"])
        .independent_variable(x)
        .function(&["a", "b"], f)
        .partial_deriv("a", df_da)
        .partial_deriv("b", df_db)
        .initial_parameters(initial.to_vec())
        .build()
        .map_err(|e| FitError::Model(format!("{e:?}")))?;

    let problem = LevMarProblemBuilder::<SeparableModel<f64>>::new(model)
        .observations(y)
        .build()
        .map_err(|e| FitError::Model(format!("{e:?}")))?;

    let (solved_problem, report) = LevMarSolver::new().minimize(problem);
    if !report.termination.was_successful() {
        return Err(FitError::NotConverged(format!("{:?}", report.termination)));
    }

    let p = solved_problem.params();
    let c = solved_problem
        .linear_coefficients()
        .ok_or_else(|| FitError::NotConverged("no linear coefficients".to_owned()))?;

    let res = finite(vec![p[0], p[1], c[0]])?;
    Ok(([res[0], res[1]], res[2]))
}

fn finite(p: Vec<f64>) -> Result<Vec<f64>, FitError> {
    if p.iter().all(|v| v.is_finite()) {
        Ok(p)
    } else {
        Err(FitError::NonFinite)
    }
}

//-----------------------------------------------------------------------------
// initial guesses

fn span(x: &[f64]) -> f64 {
    let s = match x.iter().copied().minmax_by(|a, b| a.total_cmp(b)).into_option() {
        Some((min, max)) => max - min,
        None => 0.0,
    };
    if s > 0.0 {
        s
    } else {
        1.0
    }
}

/// Peak position and RMS width around it
fn peak_guess(x: &[f64], y: &[f64]) -> (f64, f64) {
    let Some(imax) = y.iter().position_max_by(|a, b| a.total_cmp(b)) else {
        return (0.0, 1.0);
    };
    let x0 = x[imax];
    let floor = y.iter().copied().fold(f64::INFINITY, f64::min);

    let (m2, w) = x
        .iter()
        .zip(y)
        .map(|(x, y)| (*y - floor, (*x - x0).powi(2)))
        .fold((0.0, 0.0), |(m2, w), (weight, d2)| (m2 + weight * d2, w + weight));

    let width = (m2 / w).sqrt();
    if width.is_finite() && width > 0.0 {
        (x0, width)
    } else {
        (x0, span(x) / 4.0)
    }
}

/// Half-height crossing and a width signed by the edge direction
fn edge_guess(x: &[f64], y: &[f64]) -> (f64, f64) {
    let (Some(first), Some(last)) = (y.first(), y.last()) else {
        return (0.0, 1.0);
    };
    let half = (first + last) / 2.0;
    let x0 = x
        .iter()
        .zip(y)
        .min_by(|a, b| (a.1 - half).abs().total_cmp(&(b.1 - half).abs()))
        .map(|(x, _)| *x)
        .unwrap_or(0.0);

    let direction = if (last - first) * (x[x.len() - 1] - x[0]) < 0.0 {
        -1.0
    } else {
        1.0
    };
    (x0, direction * span(x) / 10.0)
}

//-----------------------------------------------------------------------------
// basis functions and their partial derivatives

fn gauss_basis(x: &DVector<f64>, x0: f64, w: f64) -> DVector<f64> {
    x.map(|x| gaussian(x, x0, w, 1.0))
}

fn d_gauss_dx0(x: &DVector<f64>, x0: f64, w: f64) -> DVector<f64> {
    x.map(|x| gaussian(x, x0, w, 1.0) * (x - x0) / w.powi(2))
}

fn d_gauss_dw(x: &DVector<f64>, x0: f64, w: f64) -> DVector<f64> {
    x.map(|x| gaussian(x, x0, w, 1.0) * (x - x0).powi(2) / w.powi(3))
}

fn lorentz_basis(x: &DVector<f64>, x0: f64, g: f64) -> DVector<f64> {
    x.map(|x| lorentzian(x, 1.0, x0, g))
}

fn d_lorentz_dx0(x: &DVector<f64>, x0: f64, g: f64) -> DVector<f64> {
    x.map(|x| {
        let u = (x - x0) / g;
        2.0 * u * lorentzian(x, 1.0, x0, g).powi(2) / g
    })
}

fn d_lorentz_dg(x: &DVector<f64>, x0: f64, g: f64) -> DVector<f64> {
    x.map(|x| {
        let u = (x - x0) / g;
        2.0 * u * u * lorentzian(x, 1.0, x0, g).powi(2) / g
    })
}

fn edge_basis(x: &DVector<f64>, x0: f64, w: f64) -> DVector<f64> {
    x.map(|x| error_function(x, x0, 1.0, w))
}

fn d_edge_dx0(x: &DVector<f64>, x0: f64, w: f64) -> DVector<f64> {
    x.map(|x| {
        let t = ((x - x0) / w).tanh();
        -(1.0 - t * t) / (2.0 * w)
    })
}

fn d_edge_dw(x: &DVector<f64>, x0: f64, w: f64) -> DVector<f64> {
    x.map(|x| {
        let u = (x - x0) / w;
        let t = u.tanh();
        -(1.0 - t * t) * u / (2.0 * w)
    })
}

//-----------------------------------------------------------------------------
