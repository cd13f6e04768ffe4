use crate::likelihood::log_likelihood;

const MAX_ITERATIONS: usize = 1000;
const TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BirthDeathEstimate {
    pub birth: f64,
    pub death: f64,
    /// False when the iteration cap was hit; the rates are then the best
    /// iterate rather than a converged optimum.
    pub converged: bool,
}

/// Maximum-likelihood birth and death rates for a clade, from the ages of
/// its internal nodes (crown age included) and the fraction of its living
/// species present in the tree.
///
/// The search runs over `(ln r, logit eps)` with `r = birth - death` and
/// `eps = death / birth`, so any iterate maps back to rates satisfying
/// `birth >= death >= 0`. Non-convergence is reported, not raised.
pub fn estimate_birth_death(ages: &[f64], sampling: f64) -> BirthDeathEstimate {
    assert!(
        sampling > 0.0 && sampling <= 1.0,
        "sampling fraction {} outside (0, 1]",
        sampling
    );
    assert!(!ages.is_empty(), "age grid must include the crown age");

    let objective = |y: [f64; 2]| {
        let (birth, death) = rates_from(y);
        -log_likelihood(birth, death, sampling, ages)
    };

    // r = 0.05, eps = 0.5
    let start = [0.05_f64.ln(), 0.0];
    let (best, converged) = nelder_mead(objective, start);
    let (birth, death) = rates_from(best);
    if !converged {
        log::warn!(
            "birth-death optimization hit the iteration cap ({}); using best iterate b={} d={}",
            MAX_ITERATIONS,
            birth,
            death
        );
    }
    BirthDeathEstimate {
        birth,
        death,
        converged,
    }
}

fn rates_from(y: [f64; 2]) -> (f64, f64) {
    let r = y[0].exp();
    // keep eps strictly below 1 so birth stays finite
    let eps = (1.0 / (1.0 + (-y[1]).exp())).min(1.0 - 1e-9);
    let birth = r / (1.0 - eps);
    let death = birth * eps;
    (birth, death)
}

/// Two-parameter Nelder-Mead descent. Returns the best vertex and whether
/// the simplex collapsed before the iteration cap.
fn nelder_mead<F: Fn([f64; 2]) -> f64>(f: F, start: [f64; 2]) -> ([f64; 2], bool) {
    const ALPHA: f64 = 1.0; // reflection
    const GAMMA: f64 = 2.0; // expansion
    const RHO: f64 = 0.5; // contraction
    const SIGMA: f64 = 0.5; // shrink

    let mut simplex = [
        start,
        [start[0] + 0.5, start[1]],
        [start[0], start[1] + 0.5],
    ];
    let mut values = simplex.map(&f);

    for _ in 0..MAX_ITERATIONS {
        // order vertices best to worst
        let mut order = [0usize, 1, 2];
        order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));
        simplex = order.map(|i| simplex[i]);
        values = order.map(|i| values[i]);

        let spread = values[2] - values[0];
        let diameter = (0..2)
            .map(|d| (simplex[2][d] - simplex[0][d]).abs())
            .fold(0.0, f64::max);
        if spread.abs() < TOLERANCE && diameter < TOLERANCE {
            return (simplex[0], true);
        }

        let centroid = [
            (simplex[0][0] + simplex[1][0]) / 2.0,
            (simplex[0][1] + simplex[1][1]) / 2.0,
        ];
        let reflect = |coef: f64| {
            [
                centroid[0] + coef * (centroid[0] - simplex[2][0]),
                centroid[1] + coef * (centroid[1] - simplex[2][1]),
            ]
        };

        let xr = reflect(ALPHA);
        let fr = f(xr);
        if fr < values[0] {
            let xe = reflect(GAMMA);
            let fe = f(xe);
            if fe < fr {
                simplex[2] = xe;
                values[2] = fe;
            } else {
                simplex[2] = xr;
                values[2] = fr;
            }
        } else if fr < values[1] {
            simplex[2] = xr;
            values[2] = fr;
        } else {
            let xc = reflect(-RHO);
            let fc = f(xc);
            if fc < values[2] {
                simplex[2] = xc;
                values[2] = fc;
            } else {
                for i in 1..3 {
                    for d in 0..2 {
                        simplex[i][d] = simplex[0][d] + SIGMA * (simplex[i][d] - simplex[0][d]);
                    }
                    values[i] = f(simplex[i]);
                }
            }
        }
    }

    let mut best = 0;
    for i in 1..3 {
        if values[i] < values[best] {
            best = i;
        }
    }
    (simplex[best], false)
}
