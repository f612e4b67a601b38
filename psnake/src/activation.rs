use ndarray::{ArrayBase, DataMut, DataOwned, Dimension, RemoveAxis};

/// Trait representing a activation functions.
pub trait ActivationFunction<A> {
    /// Applies the activation function to given array.
    ///
    /// In most cases this will call `input.mapv_inplace` and
    /// apply some function element wise.
    ///
    /// # Panics
    ///
    /// Activation functions with parameters might panic when
    /// called with inputs incompatible with the parameters.
    ///
    /// For example a built [`BuiltPSnake`](crate::BuiltPSnake) can't
    /// be applied to inputs which don't match the shape it was built for.
    ///
    /// Any activation function for which this can happen should
    /// document it on the type level documentation.
    fn apply_to<S, D>(&self, input: ArrayBase<S, D>) -> ArrayBase<S, D>
    where
        S: DataOwned<Elem = A> + DataMut<Elem = A>,
        D: Dimension + RemoveAxis;
}
