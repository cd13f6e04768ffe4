//! Constant-rate birth–death process with incomplete sampling, after
//! Stadler (2009). `birth` and `death` are per-lineage rates, `rho` is the
//! probability that an extant lineage was sampled.

/// Probability that a lineage alive at time `t` before present has no
/// sampled descendants today.
pub fn p0(t: f64, birth: f64, death: f64, rho: f64) -> f64 {
    let e = (-(birth - death) * t).exp();
    1.0 - rho * (birth - death) / (rho * birth + (birth * (1.0 - rho) - death) * e)
}

/// Probability that a lineage alive at time `t` before present has exactly
/// one sampled descendant today.
pub fn p1(t: f64, birth: f64, death: f64, rho: f64) -> f64 {
    let e = (-(birth - death) * t).exp();
    let denom = rho * birth + (birth * (1.0 - rho) - death) * e;
    rho * (birth - death).powi(2) * e / (denom * denom)
}

/// Log-likelihood of the internal-node ages of a reconstructed tree under
/// the sampled birth–death process, conditioned on survival of both crown
/// lineages. `ages` must contain the crown age once; order is irrelevant.
///
/// Returns `NEG_INFINITY` for parameter values outside the support, which
/// lets an optimizer treat the boundary as a soft wall.
pub fn log_likelihood(birth: f64, death: f64, rho: f64, ages: &[f64]) -> f64 {
    assert!(!ages.is_empty(), "age grid must include the crown age");
    let mut ages: Vec<f64> = ages.to_vec();
    ages.sort_by(|a, b| b.total_cmp(a));
    let crown = ages[0];

    let mut lik = 2.0 * p1(crown, birth, death, rho).ln();
    for t in &ages[1..] {
        lik += birth.ln() + p1(*t, birth, death, rho).ln();
    }
    lik -= 2.0 * (1.0 - p0(crown, birth, death, rho)).ln();

    if lik.is_finite() {
        lik
    } else {
        f64::NEG_INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p0_p1_are_probabilities() {
        for t in [0.1, 1.0, 10.0] {
            for rho in [0.2, 1.0] {
                let a = p0(t, 1.0, 0.5, rho);
                let b = p1(t, 1.0, 0.5, rho);
                assert!((0.0..=1.0).contains(&a), "p0({t}) = {a}");
                assert!((0.0..=1.0).contains(&b), "p1({t}) = {b}");
            }
        }
    }

    #[test]
    fn test_pure_birth_p0_complete_sampling() {
        // With no extinction and rho = 1, extinction probability is zero.
        assert!(p0(2.0, 1.0, 0.0, 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_log_likelihood_is_finite_for_sane_rates() {
        let ages = [10.0, 7.0, 3.0, 1.0];
        let lik = log_likelihood(1.0, 0.5, 0.8, &ages);
        assert!(lik.is_finite());
    }

    #[test]
    fn test_log_likelihood_prefers_plausible_rates() {
        // Four divergences over ten units: a diversification rate near
        // ages/time should beat an absurdly fast one.
        let ages = [10.0, 7.0, 3.0, 1.0];
        let sane = log_likelihood(0.3, 0.0, 1.0, &ages);
        let absurd = log_likelihood(50.0, 0.0, 1.0, &ages);
        assert!(sane > absurd);
    }
}
