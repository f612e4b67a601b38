use std::{
    ops::{AddAssign, DivAssign, MulAssign},
    sync::atomic::{AtomicUsize, Ordering},
};

use displaydoc::Display;
use log::{debug, warn};
use ndarray::{
    Array,
    ArrayBase,
    ArrayD,
    ArrayView,
    ArrayViewD,
    Axis,
    Data,
    DataMut,
    DataOwned,
    Dimension,
    IxDyn,
    RemoveAxis,
    Zip,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    activation::ActivationFunction,
    constraint::Constraint,
    initializer::{Initializer, InvalidArguments},
    input_spec::{IncompatibleInput, InputSpec},
    io::{BinParamsWithScope, FailedToRetrieveParams},
    param::{IncompatibleShape, Parameter},
    regularizer::Regularizer,
};

/// Counts the default names handed out so far.
static LAYER_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Returns `psnake` on the first call and `psnake_<n>` afterwards.
fn unique_layer_name() -> String {
    match LAYER_COUNT.fetch_add(1, Ordering::Relaxed) {
        0 => "psnake".into(),
        n => format!("psnake_{}", n),
    }
}

fn default_trainable() -> bool {
    true
}

/// The 1-based non-batch axes along which alpha is shared.
///
/// A single axis converts into a one element list. The axes are only
/// validated once the layer is built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OneOrMany", into = "Vec<usize>")]
pub struct SharedAxes(Vec<usize>);

impl SharedAxes {
    pub fn new(axes: impl IntoIterator<Item = usize>) -> Self {
        Self(axes.into_iter().collect())
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, axis: usize) -> bool {
        self.0.contains(&axis)
    }
}

impl From<usize> for SharedAxes {
    fn from(axis: usize) -> Self {
        Self(vec![axis])
    }
}

impl From<Vec<usize>> for SharedAxes {
    fn from(axes: Vec<usize>) -> Self {
        Self(axes)
    }
}

impl<const N: usize> From<[usize; N]> for SharedAxes {
    fn from(axes: [usize; N]) -> Self {
        Self(axes.to_vec())
    }
}

impl From<&[usize]> for SharedAxes {
    fn from(axes: &[usize]) -> Self {
        Self(axes.to_vec())
    }
}

impl From<SharedAxes> for Vec<usize> {
    fn from(axes: SharedAxes) -> Self {
        axes.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(usize),
    Many(Vec<usize>),
}

impl From<OneOrMany> for SharedAxes {
    fn from(axes: OneOrMany) -> Self {
        match axes {
            OneOrMany::One(axis) => axis.into(),
            OneOrMany::Many(axes) => axes.into(),
        }
    }
}

/// Options every layer has.
///
/// The default name takes the next number of a process wide counter, even if
/// the name is replaced afterwards. The numbers of default names can have gaps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default = "unique_layer_name")]
    pub name: String,
    #[serde(default = "default_trainable")]
    pub trainable: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            name: unique_layer_name(),
            trainable: true,
        }
    }
}

/// Configuration of a [`PSnake`] layer.
///
/// Serializes into a flat map containing the [`LayerConfig`] entries
/// followed by the alpha strategies and the shared axes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PSnakeConfig {
    #[serde(flatten)]
    pub base: LayerConfig,
    #[serde(default)]
    pub alpha_initializer: Initializer,
    #[serde(default)]
    pub alpha_regularizer: Option<Regularizer>,
    #[serde(default)]
    pub alpha_constraint: Option<Constraint>,
    #[serde(default)]
    pub shared_axes: Option<SharedAxes>,
}

impl PSnakeConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.base.name = name.into();
        self
    }

    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.base.trainable = trainable;
        self
    }

    pub fn with_alpha_initializer(mut self, initializer: Initializer) -> Self {
        self.alpha_initializer = initializer;
        self
    }

    pub fn with_alpha_regularizer(mut self, regularizer: impl Into<Option<Regularizer>>) -> Self {
        self.alpha_regularizer = regularizer.into();
        self
    }

    pub fn with_alpha_constraint(mut self, constraint: impl Into<Option<Constraint>>) -> Self {
        self.alpha_constraint = constraint.into();
        self
    }

    pub fn with_shared_axes(mut self, shared_axes: impl Into<SharedAxes>) -> Self {
        self.shared_axes = Some(shared_axes.into());
        self
    }

    fn shared_axes(&self) -> impl Iterator<Item = usize> + '_ {
        self.shared_axes.iter().flat_map(SharedAxes::iter)
    }

    fn to_map(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => unreachable!("structs always serialize into json objects"),
        }
    }
}

/// Building a PSnake layer failed.
#[derive(Debug, Display, Error, PartialEq)]
pub enum BuildError {
    /// Can't build {name} for inputs without a batch axis
    MissingBatchAxis { name: String },
    /// Can't build {name} with unknown size of axis {axis}: {shape:?}
    UnknownAxisSize {
        name: String,
        axis: usize,
        shape: Vec<Option<usize>>,
    },
    /// Can't share alpha of {name} along axis {axis} of inputs with {ndim} dimensions
    InvalidSharedAxis {
        name: String,
        axis: usize,
        ndim: usize,
    },
    /// Can't initialize alpha of {name}: {source}
    InvalidInitializer {
        name: String,
        source: InvalidArguments,
    },
    /// The initializer of {name} created alpha of shape {got:?} instead of {expected:?}
    InvalidInitialAlpha {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

/// Failed to load the PSnake parameters
#[derive(Debug, Display, Error)]
#[prefix_enum_doc_attributes]
pub enum LoadingParamsFailed {
    /// {0}
    FailedToRetrieveParams(#[from] FailedToRetrieveParams),
    /// {0}
    IncompatibleShape(#[from] IncompatibleShape),
}

/// An unbuilt Parametric Snake activation layer.
///
/// The transform of an input `x` with the learnable parameter `alpha` is
///
/// ```text
/// x + (1 - cos(2 * alpha * x)) / (2 * alpha)
/// ```
///
/// `alpha` has the shape of the non-batch axes of the input, with a size
/// of `1` along each shared axis. Its shape is only known once the input
/// shape is known, use [`PSnake::build()`] to allocate it.
///
/// # Zero alpha
///
/// The transform divides by `alpha`, positions with an alpha of exactly
/// zero produce non-finite outputs. Nothing prevents an initializer or an
/// update from producing a zero alpha. If that is possible for a setup use
/// a [`Constraint::Clip`] with a positive `min_value`.
#[derive(Clone, Debug, PartialEq)]
pub struct PSnake {
    config: PSnakeConfig,
}

impl Default for PSnake {
    fn default() -> Self {
        Self::new(PSnakeConfig::default())
    }
}

impl PSnake {
    pub fn new(config: PSnakeConfig) -> Self {
        Self { config }
    }

    /// Creates an unbuilt layer from a config map as returned by [`PSnake::get_config()`].
    pub fn from_config(config: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(config)).map(Self::new)
    }

    pub fn config(&self) -> &PSnakeConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.base.name
    }

    /// Exports the config as json map.
    pub fn get_config(&self) -> Result<Map<String, Value>, serde_json::Error> {
        self.config.to_map()
    }

    /// The output shape for inputs of given shape.
    pub fn compute_output_shape(&self, input_shape: &[Option<usize>]) -> Vec<Option<usize>> {
        input_shape.to_vec()
    }

    /// The output mask for given input mask.
    pub fn compute_mask<M>(&self, mask: Option<M>) -> Option<M> {
        mask
    }

    /// The shape alpha will have when building for inputs of given shape.
    ///
    /// The first axis of the input shape is the batch axis and may be unknown,
    /// as may be the shared axes. All other axes must be known.
    pub fn alpha_shape(&self, input_shape: &[Option<usize>]) -> Result<IxDyn, BuildError> {
        let features = match input_shape.split_first() {
            Some((_batch, features)) => features,
            None => {
                return Err(BuildError::MissingBatchAxis {
                    name: self.name().into(),
                })
            }
        };

        let mut shape = features.to_vec();
        for axis in self.config.shared_axes() {
            if axis == 0 || axis > features.len() {
                return Err(BuildError::InvalidSharedAxis {
                    name: self.name().into(),
                    axis,
                    ndim: input_shape.len(),
                });
            }
            shape[axis - 1] = Some(1);
        }

        shape
            .into_iter()
            .enumerate()
            .map(|(idx, size)| {
                size.ok_or_else(|| BuildError::UnknownAxisSize {
                    name: self.name().into(),
                    axis: idx + 1,
                    shape: input_shape.to_vec(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|shape| IxDyn(&shape))
    }

    /// Builds the layer for inputs of given shape.
    ///
    /// Alpha is initialized with the configured initializer.
    pub fn build(self, input_shape: &[Option<usize>]) -> Result<BuiltPSnake, BuildError> {
        self.build_using(input_shape, Initializer::initialize)
    }

    /// Builds the layer for inputs of given shape, drawing random initial values from `rng`.
    pub fn build_with<R>(
        self,
        rng: &mut R,
        input_shape: &[Option<usize>],
    ) -> Result<BuiltPSnake, BuildError>
    where
        R: Rng + ?Sized,
    {
        self.build_using(input_shape, |initializer, shape| {
            initializer.initialize_with(rng, shape)
        })
    }

    fn build_using(
        self,
        input_shape: &[Option<usize>],
        initialize: impl FnOnce(&Initializer, &IxDyn) -> ArrayD<f32>,
    ) -> Result<BuiltPSnake, BuildError> {
        let alpha_shape = self.alpha_shape(input_shape)?;
        self.config
            .alpha_initializer
            .validate()
            .map_err(|source| BuildError::InvalidInitializer {
                name: self.name().into(),
                source,
            })?;
        let alpha = initialize(&self.config.alpha_initializer, &alpha_shape);
        if alpha.raw_dim() != alpha_shape {
            return Err(BuildError::InvalidInitialAlpha {
                name: self.name().into(),
                expected: alpha_shape.slice().to_vec(),
                got: alpha.shape().to_vec(),
            });
        }

        // alpha_shape succeeded, so all non-shared axes are known
        let input_spec = InputSpec::new(
            input_shape.len(),
            input_shape
                .iter()
                .enumerate()
                .skip(1)
                .filter(|(axis, _)| !self.config.shared_axes().any(|shared| shared == *axis))
                .filter_map(|(axis, size)| size.map(|size| (axis, size))),
        );

        debug!(
            "built {} for inputs of shape {:?} with alpha of shape {:?}",
            self.name(),
            input_shape,
            alpha.shape(),
        );
        if alpha.iter().any(|alpha| *alpha == 0.) {
            warn!(
                "alpha of {} contains zeros, the outputs at those positions are not finite",
                self.name(),
            );
        }

        let alpha = Parameter::new(
            "alpha",
            alpha,
            self.config.alpha_regularizer.clone(),
            self.config.alpha_constraint.clone(),
        );
        Ok(BuiltPSnake {
            config: self.config,
            alpha,
            input_spec,
        })
    }
}

/// A built Parametric Snake activation layer.
///
/// See [`PSnake`] for the transform.
///
/// # Panics
///
/// Using it as [`ActivationFunction`] panics if the input doesn't match
/// the shape the layer was built for. Use [`BuiltPSnake::run()`] to get
/// an error instead.
#[derive(Clone, Debug)]
pub struct BuiltPSnake {
    config: PSnakeConfig,
    alpha: Parameter,
    input_spec: InputSpec,
}

impl BuiltPSnake {
    pub fn config(&self) -> &PSnakeConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.base.name
    }

    /// Exports the config as json map, the current alpha is not part of it.
    pub fn get_config(&self) -> Result<Map<String, Value>, serde_json::Error> {
        self.config.to_map()
    }

    pub fn is_trainable(&self) -> bool {
        self.config.base.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.config.base.trainable = trainable;
    }

    pub fn alpha(&self) -> ArrayViewD<'_, f32> {
        self.alpha.view()
    }

    pub fn input_spec(&self) -> &InputSpec {
        &self.input_spec
    }

    /// The output shape for inputs of given shape.
    ///
    /// Unknown sizes are accepted, known sizes must match the shape the layer was built for.
    pub fn compute_output_shape(
        &self,
        input_shape: &[Option<usize>],
    ) -> Result<Vec<Option<usize>>, IncompatibleInput> {
        self.input_spec.check_partial(input_shape)?;
        Ok(input_shape.to_vec())
    }

    /// The output mask for given input mask.
    pub fn compute_mask<M>(&self, mask: Option<M>) -> Option<M> {
        mask
    }

    /// Applies the transform to a batch of inputs.
    pub fn run<S, D>(&self, input: ArrayBase<S, D>) -> Result<Array<f32, D>, IncompatibleInput>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let mut output = input.into_owned();
        self.transform_inplace(&mut output)?;
        Ok(output)
    }

    fn transform_inplace<S, D>(&self, input: &mut ArrayBase<S, D>) -> Result<(), IncompatibleInput>
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        let alpha = self.broadcast_alpha(&input.raw_dim())?;
        Zip::from(input)
            .and(&alpha)
            .for_each(|x, &alpha| *x = psnake(*x, alpha));
        Ok(())
    }

    fn broadcast_alpha<D>(&self, dim: &D) -> Result<ArrayView<'_, f32, D>, IncompatibleInput>
    where
        D: Dimension,
    {
        self.input_spec.check(dim.slice())?;
        // the input spec only accepts shapes alpha can be broadcast to
        Ok(self
            .alpha
            .value()
            .broadcast(dim.clone())
            .unwrap_or_else(|| unreachable!()))
    }

    /// Computes the gradients of the transform.
    ///
    /// `partials` are the partial derivatives of the loss wrt. the outputs
    /// of this layer for given `input`.
    ///
    /// Returns the partial derivatives wrt. the input and the gradients wrt.
    /// alpha, summed over the batch and the shared axes.
    ///
    /// # Panics
    ///
    /// If `input` and `partials` have different shapes.
    pub fn gradients<S1, S2, D>(
        &self,
        input: ArrayBase<S1, D>,
        partials: ArrayBase<S2, D>,
    ) -> Result<(Array<f32, D>, PSnakeGradientSet), IncompatibleInput>
    where
        S1: Data<Elem = f32>,
        S2: Data<Elem = f32>,
        D: Dimension,
    {
        assert_eq!(
            input.shape(),
            partials.shape(),
            "input and partials of {} have different shapes",
            self.name(),
        );
        let alpha = self.broadcast_alpha(&input.raw_dim())?;

        let mut input_partials = Array::<f32, _>::zeros(input.raw_dim());
        let mut alpha_partials = Array::<f32, _>::zeros(input.raw_dim());
        Zip::from(&mut input_partials)
            .and(&mut alpha_partials)
            .and(&input)
            .and(&partials)
            .and(&alpha)
            .for_each(|dx, da, &x, &partial, &alpha| {
                let (wrt_x, wrt_alpha) = psnake_derivatives(x, alpha);
                *dx = wrt_x * partial;
                *da = wrt_alpha * partial;
            });

        let mut alpha_gradients = alpha_partials.into_dyn().sum_axis(Axis(0));
        for axis in self.config.shared_axes() {
            let axis = Axis(axis - 1);
            alpha_gradients = alpha_gradients.sum_axis(axis).insert_axis(axis);
        }
        debug_assert_eq!(alpha_gradients.shape(), self.alpha.shape());

        Ok((input_partials, PSnakeGradientSet { alpha_gradients }))
    }

    /// Adds the gradients to alpha and applies the constraint.
    ///
    /// Does nothing if the layer is not trainable.
    ///
    /// # Panics
    ///
    /// If the gradient set has a different shape than alpha.
    pub fn add_gradients(&mut self, gradients: &PSnakeGradientSet) {
        if self.is_trainable() {
            self.alpha.update(&gradients.alpha_gradients);
        }
    }

    /// The penalty of the regularizer on alpha.
    pub fn regularization_loss(&self) -> f32 {
        self.alpha.penalty()
    }

    /// The gradients of the regularizer on alpha.
    pub fn regularization_gradient(&self) -> Option<PSnakeGradientSet> {
        self.alpha
            .penalty_gradient()
            .map(|alpha_gradients| PSnakeGradientSet { alpha_gradients })
    }

    pub fn store_params(&self, mut params: BinParamsWithScope) {
        params.insert("alpha", self.alpha.value());
    }

    /// Replaces alpha with a stored one, the constraint is not applied.
    pub fn load_params(&mut self, mut params: BinParamsWithScope) -> Result<(), LoadingParamsFailed> {
        let alpha = params.take::<ArrayD<f32>>("alpha")?;
        self.alpha.assign(alpha)?;
        debug!("loaded alpha of {}", self.name());
        Ok(())
    }
}

impl ActivationFunction<f32> for BuiltPSnake {
    fn apply_to<S, D>(&self, mut input: ArrayBase<S, D>) -> ArrayBase<S, D>
    where
        S: DataOwned<Elem = f32> + DataMut<Elem = f32>,
        D: Dimension + RemoveAxis,
    {
        if let Err(error) = self.transform_inplace(&mut input) {
            panic!("{}: {}", self.name(), error);
        }
        input
    }
}

/// The transform of a single value.
///
/// Uses `1 - cos(2t) = 2 sin²(t)` which is less prone to cancellation
/// for small `alpha * x`.
#[inline]
fn psnake(x: f32, alpha: f32) -> f32 {
    let sin = (alpha * x).sin();
    x + sin * sin / alpha
}

/// The derivatives of the transform of a single value wrt. `x` and `alpha`.
#[inline]
fn psnake_derivatives(x: f32, alpha: f32) -> (f32, f32) {
    let sin = (alpha * x).sin();
    let sin_2ax = (2. * alpha * x).sin();
    let wrt_x = 1. + sin_2ax;
    let wrt_alpha = x * sin_2ax / alpha - sin * sin / (alpha * alpha);
    (wrt_x, wrt_alpha)
}

/// The gradients wrt. alpha of a [`BuiltPSnake`].
#[derive(Clone, Debug, PartialEq)]
pub struct PSnakeGradientSet {
    alpha_gradients: ArrayD<f32>,
}

impl PSnakeGradientSet {
    pub fn new(alpha_gradients: ArrayD<f32>) -> Self {
        Self { alpha_gradients }
    }

    pub fn alpha_gradients(&self) -> ArrayViewD<'_, f32> {
        self.alpha_gradients.view()
    }

    /// Computes the mean of the gradient sets, `None` if there are none.
    pub fn mean_of(sets: impl IntoIterator<Item = Self>) -> Option<Self> {
        let mut sets = sets.into_iter();
        let mut sum = sets.next()?;
        let mut count = 1;
        for set in sets {
            sum += set;
            count += 1;
        }
        sum /= count as f32;
        Some(sum)
    }
}

impl AddAssign for PSnakeGradientSet {
    fn add_assign(&mut self, rhs: Self) {
        self.alpha_gradients += &rhs.alpha_gradients;
    }
}

impl MulAssign<f32> for PSnakeGradientSet {
    fn mul_assign(&mut self, rhs: f32) {
        self.alpha_gradients *= rhs;
    }
}

impl DivAssign<f32> for PSnakeGradientSet {
    fn div_assign(&mut self, rhs: f32) {
        self.alpha_gradients /= rhs;
    }
}

/// Calling a lazily built layer failed.
#[derive(Debug, Display, Error, PartialEq)]
pub enum CallError {
    /// {0}
    Build(#[from] BuildError),
    /// {0}
    Input(#[from] IncompatibleInput),
}

#[derive(Clone, Debug)]
enum LazyState {
    Unbuilt(PSnake),
    Built(BuiltPSnake),
}

/// A PSnake layer which is built on the first call.
#[derive(Clone, Debug)]
pub struct LazyPSnake {
    state: LazyState,
}

impl From<PSnake> for LazyPSnake {
    fn from(layer: PSnake) -> Self {
        Self {
            state: LazyState::Unbuilt(layer),
        }
    }
}

impl From<BuiltPSnake> for LazyPSnake {
    fn from(layer: BuiltPSnake) -> Self {
        Self {
            state: LazyState::Built(layer),
        }
    }
}

impl LazyPSnake {
    pub fn new(config: PSnakeConfig) -> Self {
        PSnake::new(config).into()
    }

    pub fn config(&self) -> &PSnakeConfig {
        match &self.state {
            LazyState::Unbuilt(layer) => layer.config(),
            LazyState::Built(layer) => layer.config(),
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self.state, LazyState::Built(_))
    }

    pub fn built(&self) -> Option<&BuiltPSnake> {
        match &self.state {
            LazyState::Unbuilt(_) => None,
            LazyState::Built(layer) => Some(layer),
        }
    }

    pub fn built_mut(&mut self) -> Option<&mut BuiltPSnake> {
        match &mut self.state {
            LazyState::Unbuilt(_) => None,
            LazyState::Built(layer) => Some(layer),
        }
    }

    /// The output shape for inputs of given shape.
    ///
    /// Once built the shape is checked like [`BuiltPSnake::compute_output_shape()`] does.
    pub fn compute_output_shape(
        &self,
        input_shape: &[Option<usize>],
    ) -> Result<Vec<Option<usize>>, IncompatibleInput> {
        match &self.state {
            LazyState::Unbuilt(layer) => Ok(layer.compute_output_shape(input_shape)),
            LazyState::Built(layer) => layer.compute_output_shape(input_shape),
        }
    }

    /// Applies the transform, building the layer for the shape of the input first if necessary.
    ///
    /// If building fails the layer stays unbuilt.
    pub fn call<S, D>(&mut self, input: ArrayBase<S, D>) -> Result<Array<f32, D>, CallError>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        if let LazyState::Unbuilt(layer) = &self.state {
            let input_shape = input.shape().iter().copied().map(Some).collect::<Vec<_>>();
            self.state = LazyState::Built(layer.clone().build(&input_shape)?);
        }

        match &self.state {
            LazyState::Built(layer) => Ok(layer.run(input)?),
            LazyState::Unbuilt(_) => unreachable!("layer was built above"),
        }
    }
}
