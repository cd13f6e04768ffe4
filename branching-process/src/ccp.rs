/// Probability that a uniform sample of `n_sampled` of `n_total` extant taxa
/// spans the crown node of their clade.
///
/// Closed form from Sanderson (1996): `1 - 2(n-k) / ((n-1)(k+1))`. Complete
/// sampling always captures the crown; a single tip never does.
pub fn crown_capture_probability(n_total: usize, n_sampled: usize) -> f64 {
    assert!(
        n_sampled <= n_total,
        "sampled {} out of {} taxa",
        n_sampled,
        n_total
    );
    if n_sampled == n_total {
        return 1.0;
    }
    if n_sampled == 0 {
        return 0.0;
    }
    let n = n_total as f64;
    let k = n_sampled as f64;
    1.0 - 2.0 * (n - k) / ((n - 1.0) * (k + 1.0))
}
