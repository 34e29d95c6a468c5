// =============================================================================
// Angular Math — wraparound-safe operations on compass directions
// =============================================================================
//
// All angles are in degrees. Directions live on a circle, so arithmetic means
// are wrong near 0/360; the circular means decompose each angle into a unit
// vector (cos, sin), average the components and recover the angle with atan2.
//
//   mean = atan2( Σ w·sin θ , Σ w·cos θ )
//
// Functions returning `Option` yield `None` when the mean is undefined.
// =============================================================================

/// Wrap any real degree value into `[0, 360)`.
pub fn normalize(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs.
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Smallest rotation from `a` to `b`, in `(-180, 180]`.
///
/// Positive means `b` is clockwise of `a`:
/// `signed_difference(350, 10) == 20`, `signed_difference(10, 350) == -20`.
pub fn signed_difference(a: f64, b: f64) -> f64 {
    let diff = normalize(b) - normalize(a);
    if diff > 180.0 {
        diff - 360.0
    } else if diff <= -180.0 {
        diff + 360.0
    } else {
        diff
    }
}

/// Unsigned angular distance in `[0, 180]`.
pub fn absolute_difference(a: f64, b: f64) -> f64 {
    signed_difference(a, b).abs()
}

/// Circular mean of `angles`, or `None` for an empty input.
pub fn circular_mean(angles: &[f64]) -> Option<f64> {
    if angles.is_empty() {
        return None;
    }
    let (x, y) = angles.iter().fold((0.0, 0.0), |(x, y), &deg| {
        let rad = deg.to_radians();
        (x + rad.cos(), y + rad.sin())
    });
    Some(vector_angle(x, y))
}

/// Weighted circular mean.
///
/// Returns `None` when the inputs are empty, of mismatched length, or when
/// every weight is zero.
pub fn circular_weighted_mean(angles: &[f64], weights: &[f64]) -> Option<f64> {
    if angles.is_empty() || angles.len() != weights.len() {
        return None;
    }
    if weights.iter().all(|w| *w == 0.0) {
        return None;
    }
    let (x, y) = angles
        .iter()
        .zip(weights)
        .fold((0.0, 0.0), |(x, y), (&deg, &w)| {
            let rad = deg.to_radians();
            (x + w * rad.cos(), y + w * rad.sin())
        });
    Some(vector_angle(x, y))
}

/// Compass angle of the summed vector, snapped to zero when the components
/// cancel to rounding noise.
fn vector_angle(x: f64, y: f64) -> f64 {
    let y = if y.abs() < 1e-12 { 0.0 } else { y };
    normalize(y.atan2(x).to_degrees())
}
