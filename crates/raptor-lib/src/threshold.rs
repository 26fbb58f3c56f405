//! Threshold model
//!
//! Decides how many shared minimisers a bin must reach before a query is
//! called a hit. Constructed once per query run, consulted once per record
//! with the record's minimiser count.
//!
//! Three modes:
//! - `Lemma`: `max(1, |m| - k * e)` for a maximum error count `e`.
//! - `Percentage`: `ceil(|m| * p)` for a fixed fraction `p`.
//! - `Probabilistic`: per-count table from a binomial minimiser-conservation
//!   model; a minimiser survives `e`-rate errors with probability
//!   `(1 - e)^k`, and the threshold is the largest `t` with
//!   `P(shared >= t) >= 1 - alpha`. The table is monotone by construction
//!   and cached on disk keyed by `(w, k, e, alpha, range)`.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::constants::MAX_THRESHOLD_MINIMISERS;
use crate::error::{RaptorError, Result};
use crate::shape::Shape;

/// How the per-record threshold is derived from the minimiser count.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ThresholdMode {
    /// k-mer lemma style bound with a maximum number of errors.
    Lemma {
        /// Maximum number of errors tolerated in the query.
        errors: usize,
    },
    /// Fixed fraction of the query's minimisers.
    Percentage {
        /// Required fraction, in `(0, 1]`.
        fraction: f64,
    },
    /// Probabilistic model over a per-base error rate.
    Probabilistic {
        /// Per-base error rate, in `[0, 1)`.
        error_rate: f64,
        /// Significance level alpha: a true positive reaches the threshold
        /// with probability at least `1 - alpha`.
        p_value: f64,
    },
}

/// Parameters fixed for one query run.
#[derive(Clone, Debug)]
pub struct ThresholdParams {
    /// Window size of the minimiser scheme.
    pub window_size: usize,
    /// Shape of the minimiser scheme (its span is `k`).
    pub shape: Shape,
    /// Mode selection.
    pub mode: ThresholdMode,
    /// Where to cache precomputed tables; `None` disables caching.
    pub cache_dir: Option<PathBuf>,
}

/// A resolved thresholder. `get` is O(1) per record.
pub struct Threshold {
    mode: ThresholdMode,
    k: usize,
    table: Option<Vec<u64>>,
}

impl Threshold {
    /// Build a thresholder, precomputing and (if configured) caching the
    /// probabilistic table.
    pub fn new(params: &ThresholdParams) -> Result<Self> {
        let k = params.shape.span();
        let table = match params.mode {
            ThresholdMode::Lemma { .. } => None,
            ThresholdMode::Percentage { fraction } => {
                if !(fraction > 0.0 && fraction <= 1.0) {
                    return Err(RaptorError::InvalidArgument(format!(
                        "threshold fraction must be in (0, 1], got {fraction}"
                    )));
                }
                None
            }
            ThresholdMode::Probabilistic { error_rate, p_value } => {
                if !(0.0..1.0).contains(&error_rate) {
                    return Err(RaptorError::InvalidArgument(format!(
                        "error rate must be in [0, 1), got {error_rate}"
                    )));
                }
                if !(p_value > 0.0 && p_value < 1.0) {
                    return Err(RaptorError::InvalidArgument(format!(
                        "p-value must be in (0, 1), got {p_value}"
                    )));
                }
                Some(probabilistic_table(params, k, error_rate, p_value)?)
            }
        };
        Ok(Self {
            mode: params.mode,
            k,
            table,
        })
    }

    /// Minimum shared minimiser count for a query with `minimiser_count`
    /// minimisers. Always at least 1.
    pub fn get(&self, minimiser_count: usize) -> usize {
        let tau = match self.mode {
            ThresholdMode::Lemma { errors } => {
                minimiser_count.saturating_sub(self.k * errors)
            }
            ThresholdMode::Percentage { fraction } => {
                (minimiser_count as f64 * fraction).ceil() as usize
            }
            ThresholdMode::Probabilistic { .. } => {
                let table = self.table.as_ref().expect("probabilistic table built in new");
                // Counts beyond the table clamp to its last entry; the table
                // is monotone, so the clamped value is conservative-low.
                let idx = minimiser_count.min(table.len() - 1);
                table[idx] as usize
            }
        };
        tau.max(1)
    }
}

/// Build (or load from cache) the probabilistic table indexed by minimiser
/// count, for counts `0..=MAX_THRESHOLD_MINIMISERS`.
fn probabilistic_table(
    params: &ThresholdParams,
    k: usize,
    error_rate: f64,
    p_value: f64,
) -> Result<Vec<u64>> {
    let cache_path = params.cache_dir.as_ref().map(|dir| {
        dir.join(format!(
            "threshold_w{}_k{}_e{}_a{}_{}.bin",
            params.window_size, k, error_rate, p_value, MAX_THRESHOLD_MINIMISERS
        ))
    });

    if let Some(path) = &cache_path {
        match load_table(path) {
            Ok(Some(table)) => {
                debug!("loaded threshold table from {}", path.display());
                return Ok(table);
            }
            Ok(None) => {}
            Err(e) => warn!("ignoring unreadable threshold cache {}: {e}", path.display()),
        }
    }

    let survive = (1.0 - error_rate).powi(k as i32);
    let mut log_factorial = vec![0.0f64; MAX_THRESHOLD_MINIMISERS + 1];
    for i in 1..=MAX_THRESHOLD_MINIMISERS {
        log_factorial[i] = log_factorial[i - 1] + (i as f64).ln();
    }

    let mut table = vec![0u64; MAX_THRESHOLD_MINIMISERS + 1];
    let mut running_max = 0u64;
    for m in 1..=MAX_THRESHOLD_MINIMISERS {
        let tau = binomial_threshold(m, survive, p_value, &log_factorial);
        running_max = running_max.max(tau as u64);
        table[m] = running_max;
    }

    if let Some(path) = &cache_path {
        if let Err(e) = store_table(path, &table) {
            warn!("could not write threshold cache {}: {e}", path.display());
        }
    }
    Ok(table)
}

/// Largest `t` with `P(Binomial(m, p) >= t) >= 1 - alpha`.
fn binomial_threshold(m: usize, p: f64, alpha: f64, log_factorial: &[f64]) -> usize {
    if p >= 1.0 {
        return m;
    }
    if p <= 0.0 {
        return 0;
    }
    let log_p = p.ln();
    let log_q = (1.0 - p).ln();
    // Walk the upper tail downwards until it holds at least 1 - alpha.
    let mut tail = 0.0f64;
    let mut t = m + 1;
    while t > 0 {
        t -= 1;
        let log_pmf = log_factorial[m] - log_factorial[t] - log_factorial[m - t]
            + t as f64 * log_p
            + (m - t) as f64 * log_q;
        tail += log_pmf.exp();
        if tail >= 1.0 - alpha {
            return t;
        }
    }
    0
}

fn load_table(path: &Path) -> Result<Option<Vec<u64>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = fs::File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    if bytes.len() != (MAX_THRESHOLD_MINIMISERS + 1) * 8 {
        return Err(RaptorError::Format {
            what: "threshold cache",
            detail: format!("unexpected size {}", bytes.len()),
        });
    }
    Ok(Some(
        bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("chunk of 8")))
            .collect(),
    ))
}

fn store_table(path: &Path, table: &[u64]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    for value in table {
        file.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}
