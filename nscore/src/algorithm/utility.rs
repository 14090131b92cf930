use nalgebra::DMatrix;
use ordered_float::OrderedFloat;

/// Integrates `y` against the sample positions `x` with the composite trapezoidal rule.
///
/// The samples are used in the order given; no sorting is performed, so a decreasing
/// stretch of `x` contributes negatively.
///
/// # Example
///
/// ```
/// use nscore::algorithm::utility::trapz;
///
/// let area = trapz(&[0.0, 1.0, 2.0], &[0.0, 1.0, 2.0]);
/// assert!((area - 2.0).abs() < 1e-12);
/// ```
pub fn trapz(y: &[f64], x: &[f64]) -> f64 {
    debug_assert_eq!(y.len(), x.len());
    y.windows(2)
        .zip(x.windows(2))
        .map(|(y, x)| (x[1] - x[0]) * (y[0] + y[1]) / 2.0)
        .sum()
}

/// Maximum of `values` ignoring NaN entries, `0.0` for an empty or all-NaN slice.
pub fn nan_max(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))))
        .unwrap_or(0.0)
}

pub fn filter_with_mask<T: Copy>(vec: &[T], mask: &[bool]) -> Vec<T> {
    vec.iter()
        .zip(mask.iter())
        .filter(|(_, keep)| **keep)
        .map(|(&v, _)| v)
        .collect()
}

/// Row permutation that sorts the rows of `q` lexicographically, first column as primary key.
///
/// The sort is stable, so rows with identical coordinates keep their relative order.
pub fn lexsort_rows(q: &DMatrix<f64>) -> Vec<usize> {
    let ncols = q.ncols();
    let mut order: Vec<usize> = (0..q.nrows()).collect();
    order.sort_by(|&a, &b| {
        (0..ncols)
            .map(|c| OrderedFloat(q[(a, c)]))
            .cmp((0..ncols).map(|c| OrderedFloat(q[(b, c)])))
    });
    order
}

/// Given `indices` already ordered by `values[index]`, returns the sub-range `start..end`
/// whose values lie inside `[lower, upper)`. A degenerate window (`lower == upper`)
/// selects the values equal to `lower`.
pub fn sorted_window(indices: &[usize], values: &[f64], lower: f64, upper: f64) -> (usize, usize) {
    let start = indices.partition_point(|&i| values[i] < lower);
    let end = if upper > lower {
        indices.partition_point(|&i| values[i] < upper)
    } else {
        indices.partition_point(|&i| values[i] <= upper)
    };
    (start, end.max(start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trapz_linear() {
        let x = vec![0.0, 0.5, 1.5, 3.0];
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v).collect();
        // integral of 2x over [0, 3] is 9, exact for the trapezoid rule
        assert!((trapz(&y, &x) - 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_trapz_short_input() {
        assert_eq!(trapz(&[], &[]), 0.0);
        assert_eq!(trapz(&[4.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_trapz_reversed_axis_is_negative() {
        let area = trapz(&[1.0, 1.0], &[1.0, 0.0]);
        assert!((area + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_nan_max() {
        assert_eq!(nan_max(&[1.0, f64::NAN, 3.0, 2.0]), 3.0);
        assert_eq!(nan_max(&[]), 0.0);
        assert_eq!(nan_max(&[f64::NAN]), 0.0);
        assert_eq!(nan_max(&[-2.0, -1.0]), -1.0);
    }

    #[test]
    fn test_filter_with_mask() {
        let values = vec![1, 2, 3, 4];
        let mask = vec![true, false, false, true];
        assert_eq!(filter_with_mask(&values, &mask), vec![1, 4]);
    }

    #[test]
    fn test_lexsort_rows() {
        let q = DMatrix::from_row_slice(4, 2, &[
            1.0, 2.0,
            0.0, 5.0,
            1.0, 1.0,
            0.0, 5.0,
        ]);
        assert_eq!(lexsort_rows(&q), vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_sorted_window_half_open() {
        let values = vec![0.0, 0.1, 0.2, 0.3, 0.4];
        let indices: Vec<usize> = (0..values.len()).collect();
        assert_eq!(sorted_window(&indices, &values, 0.1, 0.3), (1, 3));
        assert_eq!(sorted_window(&indices, &values, 0.2, 0.2), (2, 3));
        assert_eq!(sorted_window(&indices, &values, 0.45, 0.5), (5, 5));
    }
}
