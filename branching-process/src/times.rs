use rand::Rng;

use crate::ProcessError;

/// Distribution function of a reconstructed birth–death waiting time,
/// measured from the present: the probability that a surviving lineage's
/// origin lies within `t` of today.
fn reconstructed_cdf(t: f64, birth: f64, death: f64) -> f64 {
    let e = (-(birth - death) * t).exp();
    (1.0 - e) / (1.0 - (death / birth) * e)
}

/// Draw `count` new branching times for a clade whose reconstructed
/// divergences are `ages` (descending or not; the crown age must be the
/// maximum). Times fall in `(t_young, t_old]`, where `t_old` defaults to
/// the crown age, and come back sorted descending.
///
/// Each draw first picks a slice of the age grid with probability
/// proportional to `rank * (F(hi) - F(lo))` -- rank counts the
/// reconstructed lineages crossing the slice -- then inverts the CDF
/// within it. Accepted draws join the grid, so later draws see earlier
/// ones.
pub fn branching_times<R: Rng>(
    rng: &mut R,
    ages: &[f64],
    birth: f64,
    death: f64,
    count: usize,
    t_old: Option<f64>,
    t_young: f64,
) -> Result<Vec<f64>, ProcessError> {
    assert!(birth > death, "need positive diversification, b={birth} d={death}");
    assert!(!ages.is_empty(), "age grid must include the crown age");
    if count == 0 {
        return Ok(vec![]);
    }

    let crown = ages.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let t_old = t_old.unwrap_or(crown);
    if t_old <= t_young {
        return Err(ProcessError::InvalidInterval { t_old, t_young });
    }

    let mut grid: Vec<f64> = vec![t_old];
    grid.extend(ages.iter().copied().filter(|a| *a >= t_young && *a <= t_old));
    grid.push(t_young);
    grid.sort_by(|a, b| b.total_cmp(a));

    let cdf = |t: f64| reconstructed_cdf(t, birth, death);

    let mut drawn = Vec::with_capacity(count);
    while drawn.len() < count {
        let segment = if grid.len() > 2 {
            let weights: Vec<f64> = (1..grid.len())
                .map(|i| i as f64 * (cdf(grid[i - 1]) - cdf(grid[i])))
                .collect();
            let total: f64 = weights.iter().sum();
            let mut pick = rng.gen::<f64>() * total;
            let mut chosen = weights.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                if pick < *w {
                    chosen = i;
                    break;
                }
                pick -= w;
            }
            chosen
        } else {
            0
        };

        let hi = cdf(grid[segment]);
        let lo = cdf(grid[segment + 1]);
        let u = rng.gen::<f64>();
        let target = hi - u * (hi - lo);
        // invert F: t = 1/(b-d) ln((1 - (d/b) F) / (1 - F))
        let t = 1.0 / (birth - death)
            * ((1.0 - (death / birth) * target) / (1.0 - target)).ln();

        drawn.push(t);
        let at = grid
            .iter()
            .position(|g| *g < t)
            .unwrap_or(grid.len());
        grid.insert(at, t);
    }

    drawn.sort_by(|a, b| b.total_cmp(a));
    Ok(drawn)
}
