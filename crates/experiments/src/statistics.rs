//! Two-proportion significance testing for winner declaration.
//!
//! A winner is declared only when the leading variant beats the runner-up
//! with a pooled two-proportion z-test at the experiment's confidence
//! threshold. Ties and thin samples report "not yet significant" instead
//! of forcing a winner.

/// z threshold for a one-sided test at the given confidence percentage.
/// Unknown levels fall back to 95%.
pub fn z_threshold(confidence_level: u8) -> f64 {
    match confidence_level {
        90 => 1.645,
        95 => 1.96,
        99 => 2.576,
        _ => 1.96,
    }
}

/// Pooled two-proportion z-score comparing (successes_a / n_a) against
/// (successes_b / n_b). Returns 0.0 when either sample is empty or the
/// pooled variance collapses.
pub fn two_proportion_z(successes_a: u64, n_a: u64, successes_b: u64, n_b: u64) -> f64 {
    if n_a == 0 || n_b == 0 {
        return 0.0;
    }
    let rate_a = successes_a as f64 / n_a as f64;
    let rate_b = successes_b as f64 / n_b as f64;
    let pooled = (successes_a + successes_b) as f64 / (n_a + n_b) as f64;
    let se = (pooled * (1.0 - pooled) * (1.0 / n_a as f64 + 1.0 / n_b as f64)).sqrt();
    if se == 0.0 {
        return 0.0;
    }
    (rate_a - rate_b) / se
}

/// Standard normal CDF via the Abramowitz-Stegun erf approximation.
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Two-tailed p-value for a z-score.
pub fn p_value(z: f64) -> f64 {
    2.0 * (1.0 - normal_cdf(z.abs()))
}

fn erf(x: f64) -> f64 {
    // Abramowitz & Stegun 7.1.26, max error ~1.5e-7.
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    sign * y
}
