//! Utilities to approximate equality of floating point values.
//!
//! Different weight-gradient strategies accumulate in different orders, so
//! results are compared relative to their magnitude rather than bit for bit.

/// The max relative error accepted on `f32`s.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// The expected relative error between two accumulation orders.
pub const F32_AVG_ERROR: f32 = 1e-4;

/// The best expected relative error on `f32`s.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// Values below this magnitude are compared absolutely.
const ABS_FLOOR: f32 = 1.0;

/// The approximated equality enumerated.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Very strong epsilon.
    Precise = 0,
    /// Good epsilon.
    Partial = 1,
    /// Acceptable epsilon.
    Relative = 2,
    /// No relative equality.
    Scarce = 3,
}

/// Relative distance of `a` and `b`, scaled by the larger magnitude.
///
/// Below unit magnitude the distance degrades to an absolute one.
#[must_use]
pub fn relative_diff(a: f32, b: f32) -> f32 {
    let scale = a.abs().max(b.abs()).max(ABS_FLOOR);
    (a - b).abs() / scale
}

/// Grades the relative distance between two floats.
#[must_use]
pub fn grade(a: f32, b: f32) -> ApproxEquality {
    let dif = relative_diff(a, b);
    if dif < F32_MIN_ERROR {
        ApproxEquality::Precise
    } else if dif < F32_AVG_ERROR {
        ApproxEquality::Partial
    } else if dif < F32_MAX_ERROR {
        ApproxEquality::Relative
    } else {
        ApproxEquality::Scarce
    }
}

/// Worst grade over two equally long slices; `Scarce` on length mismatch.
#[must_use]
pub fn grade_slices(a: &[f32], b: &[f32]) -> ApproxEquality {
    if a.len() != b.len() {
        return ApproxEquality::Scarce;
    }
    a.iter()
        .zip(b)
        .map(|(&x, &y)| grade(x, y))
        .max()
        .unwrap_or(ApproxEquality::Precise)
}

/// Checks that `a` and `b` agree within relative tolerance `tol`.
#[must_use]
pub fn approx_eq(a: f32, b: f32, tol: f32) -> bool {
    relative_diff(a, b) <= tol
}

/// Panics with both values when they differ by more than `tol` relatively.
#[track_caller]
pub fn assert_close(actual: f32, expected: f32, tol: f32) {
    assert!(
        approx_eq(actual, expected, tol),
        "values differ: actual {actual}, expected {expected} (relative diff {}, tolerance {tol})",
        relative_diff(actual, expected)
    );
}

/// Largest distance between two slices, relative to the largest magnitude
/// in `expected`.
///
/// Gradients are small everywhere, so a per-element floor of one would turn
/// a relative tolerance into a loose absolute one. Scaling by the slice
/// keeps the comparison relative for any magnitude. Infinite on length
/// mismatch.
#[must_use]
pub fn slice_relative_diff(actual: &[f32], expected: &[f32]) -> f32 {
    if actual.len() != expected.len() {
        return f32::INFINITY;
    }
    let scale = expected.iter().fold(0.0_f32, |m, v| m.max(v.abs()));
    let worst = actual
        .iter()
        .zip(expected)
        .fold(0.0_f32, |m, (a, e)| m.max((a - e).abs()));
    if scale > 0.0 { worst / scale } else { worst }
}

/// Panics unless `actual` agrees with `expected` within `tol`, relative to
/// the largest magnitude in `expected`.
#[track_caller]
pub fn assert_slices_close_scaled(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "slice lengths differ");
    let dif = slice_relative_diff(actual, expected);
    assert!(
        dif <= tol,
        "slices differ: relative diff {dif}, tolerance {tol}\n actual {actual:?}\n expected {expected:?}"
    );
}

/// Elementwise [`assert_close`] over two slices of equal length.
#[track_caller]
pub fn assert_slices_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "slice lengths differ");
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            approx_eq(a, e, tol),
            "element {i} differs: actual {a}, expected {e} (relative diff {}, tolerance {tol})",
            relative_diff(a, e)
        );
    }
}
