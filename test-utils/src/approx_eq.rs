use float_cmp::approx_eq;
use ndarray::{ArrayBase, Data, Dimension, IntoDimension, Ix};

/// Asserts that two floats, or two (nested) containers of floats, are approximately equal.
///
/// Containers are compared element wise in logical order, their shapes must match.
///
/// ```
/// use ndarray::{arr1, arr2};
/// use test_utils::assert_approx_eq;
///
/// assert_approx_eq!(f32, 0.15039155, 0.1503916, ulps = 3);
/// assert_approx_eq!(f32, &[[1.0, 2.], [3., 4.]], arr2(&[[1.0, 2.], [3., 4.]]));
/// assert_approx_eq!(f32, arr1(&[1.0, 2.]).into_dyn(), vec![1.0, 2.001], epsilon = 0.01);
/// ```
///
/// Without an explicit margin the values may differ by `2` ulps.
///
/// Two `NaN` values are treated as equal, the assertion checks for an
/// expected outcome and a `NaN` can be the expected outcome (e.g. of
/// a division by zero).
#[macro_export]
macro_rules! assert_approx_eq {
    ($t:ty, $left:expr, $right:expr $(,)?) => {
        $crate::assert_approx_eq!($t, $left, $right, epsilon = 0., ulps = 2)
    };
    ($t:ty, $left:expr, $right:expr, ulps = $ulps:expr $(,)?) => {
        $crate::assert_approx_eq!($t, $left, $right, epsilon = 0., ulps = $ulps)
    };
    ($t:ty, $left:expr, $right:expr, epsilon = $epsilon:expr $(,)?) => {
        $crate::assert_approx_eq!($t, $left, $right, epsilon = $epsilon, ulps = 2)
    };
    ($t:ty, $left:expr, $right:expr, epsilon = $epsilon:expr, ulps = $ulps:expr $(,)?) => {
        $crate::check_approx_eq(&$left, &$right, $epsilon, $ulps)
    };
}

/// Implementation of [`assert_approx_eq!`], use the macro instead.
#[doc(hidden)]
#[track_caller]
pub fn check_approx_eq<'a, L, R>(left: L, right: R, epsilon: f32, ulps: i32)
where
    L: ApproxEqIter<'a, LeafElement = f32>,
    R: ApproxEqIter<'a, LeafElement = f32>,
{
    let mut left = left.indexed_iter_logical_order(Vec::new());
    let mut right = right.indexed_iter_logical_order(Vec::new());
    loop {
        match (left.next(), right.next()) {
            (Some((left_idx, lv)), Some((right_idx, rv))) => {
                assert_eq!(
                    left_idx, right_idx,
                    "Dimensionality mismatch when iterating in logical order: {:?} != {:?}",
                    left_idx, right_idx,
                );
                let both_nan = lv.is_nan() && rv.is_nan();
                assert!(
                    both_nan || approx_eq!(f32, lv, rv, ulps = ulps, epsilon = epsilon),
                    "approximated equal assertion failed (ulps={:?}, epsilon={:?}) at index {:?}: {:?} == {:?}",
                    ulps,
                    epsilon,
                    left_idx,
                    lv,
                    rv,
                );
            }
            (Some((idx, _)), None) => panic!("Left input is longer, starting at index {:?}", idx),
            (None, Some((idx, _))) => panic!("Right input is longer, starting at index {:?}", idx),
            (None, None) => break,
        }
    }
}

/// Iterates the leaf values of a "thing" for [`assert_approx_eq!`].
///
/// It is implemented on `&`-references of the things that can be compared,
/// both containers and leaf values (e.g. `&f32`). Other sequential
/// containers can be added on demand, non sequential ones are not supported.
pub trait ApproxEqIter<'a>: Copy {
    /// The leaf element, e.g. f32.
    type LeafElement;

    /// Iterates over all leaf values together with their index.
    ///
    /// Leaf values yield themselves at `index_prefix`. Containers yield the
    /// leaf values of each element, with the index of the element pushed
    /// onto `index_prefix`.
    fn indexed_iter_logical_order(
        self,
        index_prefix: Vec<Ix>,
    ) -> Box<dyn Iterator<Item = (Vec<Ix>, Self::LeafElement)> + 'a>;
}

type LeafIter<'a, L> = Box<dyn Iterator<Item = (Vec<Ix>, L)> + 'a>;

/// Flattens indexed elements of a sequential container.
fn nested<'a, T>(
    elements: impl Iterator<Item = (Ix, T)> + 'a,
    prefix: Vec<Ix>,
) -> LeafIter<'a, T::LeafElement>
where
    T: ApproxEqIter<'a> + 'a,
{
    Box::new(elements.flat_map(move |(idx, element)| {
        let mut prefix = prefix.clone();
        prefix.push(idx);
        element.indexed_iter_logical_order(prefix)
    }))
}

impl<'a> ApproxEqIter<'a> for &'a f32 {
    type LeafElement = f32;

    fn indexed_iter_logical_order(self, prefix: Vec<Ix>) -> LeafIter<'a, f32> {
        Box::new(std::iter::once((prefix, *self)))
    }
}

impl<'a, T> ApproxEqIter<'a> for &'a &'a T
where
    &'a T: ApproxEqIter<'a>,
    T: 'a + ?Sized,
{
    type LeafElement = <&'a T as ApproxEqIter<'a>>::LeafElement;

    fn indexed_iter_logical_order(self, prefix: Vec<Ix>) -> LeafIter<'a, Self::LeafElement> {
        (*self).indexed_iter_logical_order(prefix)
    }
}

/// `Some` is treated like a container with one element.
impl<'a, T: 'a> ApproxEqIter<'a> for &'a Option<T>
where
    &'a T: ApproxEqIter<'a>,
{
    type LeafElement = <&'a T as ApproxEqIter<'a>>::LeafElement;

    fn indexed_iter_logical_order(self, prefix: Vec<Ix>) -> LeafIter<'a, Self::LeafElement> {
        nested(self.iter().map(|element| (0, element)), prefix)
    }
}

impl<'a, T: 'a> ApproxEqIter<'a> for &'a [T]
where
    &'a T: ApproxEqIter<'a>,
{
    type LeafElement = <&'a T as ApproxEqIter<'a>>::LeafElement;

    fn indexed_iter_logical_order(self, prefix: Vec<Ix>) -> LeafIter<'a, Self::LeafElement> {
        nested(self.iter().enumerate(), prefix)
    }
}

impl<'a, T, const N: usize> ApproxEqIter<'a> for &'a [T; N]
where
    &'a T: ApproxEqIter<'a>,
{
    type LeafElement = <&'a T as ApproxEqIter<'a>>::LeafElement;

    fn indexed_iter_logical_order(self, prefix: Vec<Ix>) -> LeafIter<'a, Self::LeafElement> {
        self[..].indexed_iter_logical_order(prefix)
    }
}

impl<'a, T: 'a> ApproxEqIter<'a> for &'a Vec<T>
where
    &'a T: ApproxEqIter<'a>,
{
    type LeafElement = <&'a T as ApproxEqIter<'a>>::LeafElement;

    fn indexed_iter_logical_order(self, prefix: Vec<Ix>) -> LeafIter<'a, Self::LeafElement> {
        self[..].indexed_iter_logical_order(prefix)
    }
}

/// Arrays of any dimensionality, `IxDyn` arrays compare equal to fixed dimension ones.
impl<'a, S, D> ApproxEqIter<'a> for &'a ArrayBase<S, D>
where
    S: Data,
    S::Elem: Copy,
    &'a S::Elem: ApproxEqIter<'a>,
    D: Dimension,
{
    type LeafElement = S::Elem;

    fn indexed_iter_logical_order(self, prefix: Vec<Ix>) -> LeafIter<'a, S::Elem> {
        Box::new(self.indexed_iter().map(move |(idx, element)| {
            let mut index = prefix.clone();
            index.extend(idx.into_dimension().slice());
            (index, *element)
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::panic::catch_unwind;

    use ndarray::{arr1, arr2, arr3, ArrayD, IxDyn};

    #[test]
    fn test_floats_with_ulps() {
        assert_approx_eq!(f32, 0.15039155, 0.1503916, ulps = 3);
        catch_unwind(|| assert_approx_eq!(f32, 0.15039155, 0.1503916, ulps = 2)).unwrap_err();
    }

    #[test]
    fn test_floats_with_epsilon() {
        assert_approx_eq!(f32, 1.25, 1.3, epsilon = 0.1);
        catch_unwind(|| assert_approx_eq!(f32, 1.25, 1.3, epsilon = 0.01)).unwrap_err();
    }

    #[test]
    fn test_containers_of_different_kinds() {
        assert_approx_eq!(f32, &[0.5, 1.5], vec![0.5, 1.5]);
        assert_approx_eq!(f32, [[0.5], [1.5]], arr2(&[[0.5], [1.5]]));
        assert_approx_eq!(f32, Some(0.5), [0.5]);
        assert_approx_eq!(f32, &arr3(&[[[1.0, 2.]]]), [[[1.0, 2.]]]);
    }

    #[test]
    fn test_dynamic_and_fixed_dimensions() {
        let dynamic = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0f32, 2., 3., 4.]).unwrap();
        assert_approx_eq!(f32, dynamic, arr2(&[[1.0, 2.], [3., 4.]]));
        assert_approx_eq!(f32, dynamic.view(), [[1.0, 2.], [3., 4.]]);
    }

    #[test]
    #[should_panic(expected = "at index [1, 0]")]
    fn test_reports_index_of_mismatch() {
        assert_approx_eq!(f32, [[1.0, 2.], [3.5, 4.]], arr2(&[[1.0, 2.], [3., 4.]]));
    }

    #[test]
    #[should_panic(expected = "Dimensionality mismatch")]
    fn test_shapes_must_match() {
        assert_approx_eq!(f32, arr1(&[1.0, 2.]), arr2(&[[1.0, 2.]]));
    }

    #[test]
    fn test_nan_equals_nan() {
        assert_approx_eq!(f32, [f32::NAN, 1.], arr1(&[f32::NAN, 1.]));
        catch_unwind(|| assert_approx_eq!(f32, [f32::NAN], [1.0])).unwrap_err();
        catch_unwind(|| assert_approx_eq!(f32, f32::INFINITY, f32::NAN)).unwrap_err();
    }

    #[test]
    #[should_panic(expected = "Left input is longer, starting at index [2]")]
    fn test_left_longer() {
        assert_approx_eq!(f32, [1.0, 2., 3.], [1.0, 2.]);
    }

    #[test]
    #[should_panic(expected = "Right input is longer, starting at index [1]")]
    fn test_right_longer() {
        assert_approx_eq!(f32, vec![1.0], vec![1.0, 2.]);
    }
}
