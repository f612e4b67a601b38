//! Loss functions used to train the layer.

use ndarray::{Array, ArrayBase, Data, Dimension, Zip};

/// Computes the mean squared error between the predicted and the target values.
///
/// # Panics
///
/// If the arrays have different shapes.
pub fn mean_squared_error<S1, S2, D>(
    predicted: &ArrayBase<S1, D>,
    target: &ArrayBase<S2, D>,
) -> f32
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    if predicted.is_empty() {
        return 0.;
    }

    let sum = Zip::from(predicted)
        .and(target)
        .fold(0., |acc, predicted, target| {
            let diff = predicted - target;
            acc + diff * diff
        });
    sum / predicted.len() as f32
}

/// Computes the partial derivatives of [`mean_squared_error()`] wrt. the predicted values.
///
/// # Panics
///
/// If the arrays have different shapes.
pub fn mean_squared_error_gradient<S1, S2, D>(
    predicted: &ArrayBase<S1, D>,
    target: &ArrayBase<S2, D>,
) -> Array<f32, D>
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    let scale = 2. / predicted.len().max(1) as f32;
    Zip::from(predicted)
        .and(target)
        .map_collect(|predicted, target| scale * (predicted - target))
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2, Array1};
    use test_utils::assert_approx_eq;

    use super::*;

    #[test]
    fn test_mean_squared_error() {
        let predicted = arr2(&[[1.0f32, 2.], [3., 4.]]);
        let target = arr2(&[[1.0f32, 0.], [4., 4.]]);
        assert_approx_eq!(f32, mean_squared_error(&predicted, &target), 1.25);
        assert_approx_eq!(f32, mean_squared_error(&predicted, &predicted), 0.);
    }

    #[test]
    fn test_mean_squared_error_of_empty_arrays() {
        let empty = Array1::<f32>::zeros(0);
        assert_approx_eq!(f32, mean_squared_error(&empty, &empty), 0.);
        assert_eq!(mean_squared_error_gradient(&empty, &empty).len(), 0);
    }

    #[test]
    fn test_mean_squared_error_gradient() {
        let predicted = arr1(&[1.0f32, 2., 3., 4.]);
        let target = arr1(&[1.0f32, 0., 4., 4.]);
        assert_approx_eq!(
            f32,
            mean_squared_error_gradient(&predicted, &target),
            arr1(&[0., 1., -0.5, 0.])
        );
    }

    #[test]
    #[should_panic]
    fn test_shape_mismatch_panics() {
        mean_squared_error(&arr1(&[1.0f32, 2.]), &arr1(&[1.0f32]));
    }
}
