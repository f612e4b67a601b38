use crate::{BuiltPSnake, PSnakeGradientSet};

/// Trait for optimizers updating the parameters of a layer.
pub trait Optimizer {
    /// Runs the next optimization step by applying the given gradients on the given layer.
    fn apply_gradients(
        &mut self,
        layer: &mut BuiltPSnake,
        batch_of_gradient_sets: Vec<PSnakeGradientSet>,
    );
}

/// Mini-Batch Stochastic Gradient Descent
///
/// The gradient of the regularizer of the layer is added to the mean
/// of the batch before scaling it with the learning rate.
#[derive(Clone, Debug)]
pub struct MiniBatchSgd {
    pub learning_rate: f32,
}

impl Optimizer for MiniBatchSgd {
    fn apply_gradients(
        &mut self,
        layer: &mut BuiltPSnake,
        batch_of_gradient_sets: Vec<PSnakeGradientSet>,
    ) {
        if let Some(mut gradient_set) = PSnakeGradientSet::mean_of(batch_of_gradient_sets) {
            if let Some(penalty) = layer.regularization_gradient() {
                gradient_set += penalty;
            }
            gradient_set *= -self.learning_rate;
            layer.add_gradients(&gradient_set);
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, Array2};
    use test_utils::assert_approx_eq;

    use super::*;
    use crate::{
        constraint::Constraint,
        initializer::Initializer,
        regularizer::Regularizer,
        utils::{mean_squared_error, mean_squared_error_gradient},
        PSnake,
        PSnakeConfig,
    };

    fn build(config: PSnakeConfig) -> BuiltPSnake {
        PSnake::new(config).build(&[None, Some(2)]).unwrap()
    }

    #[test]
    fn test_sgd_step_uses_mean_of_batch() {
        let mut layer = build(PSnakeConfig::default());
        let mut sgd = MiniBatchSgd { learning_rate: 0.5 };
        sgd.apply_gradients(
            &mut layer,
            vec![
                PSnakeGradientSet::new(arr1(&[1.0f32, -2.]).into_dyn()),
                PSnakeGradientSet::new(arr1(&[3.0f32, 0.]).into_dyn()),
            ],
        );
        assert_approx_eq!(f32, layer.alpha(), arr1(&[0., 1.5]));
    }

    #[test]
    fn test_sgd_step_with_empty_batch_does_nothing() {
        let mut layer = build(PSnakeConfig::default());
        MiniBatchSgd { learning_rate: 0.5 }.apply_gradients(&mut layer, Vec::new());
        assert_approx_eq!(f32, layer.alpha(), arr1(&[1., 1.]));
    }

    #[test]
    fn test_sgd_step_includes_regularizer() {
        let mut layer = build(
            PSnakeConfig::default()
                .with_alpha_initializer(Initializer::Constant { value: 2. })
                .with_alpha_regularizer(Regularizer::L2 { l2: 0.25 }),
        );
        MiniBatchSgd { learning_rate: 0.1 }.apply_gradients(
            &mut layer,
            vec![PSnakeGradientSet::new(arr1(&[1.0f32, 0.]).into_dyn())],
        );
        // penalty gradient is 2 * 0.25 * 2 = 1
        assert_approx_eq!(f32, layer.alpha(), arr1(&[1.8, 1.9]), epsilon = 1e-6);
    }

    #[test]
    fn test_sgd_step_applies_constraint() {
        let mut layer = build(PSnakeConfig::default().with_alpha_constraint(Constraint::Clip {
            min_value: 0.5,
            max_value: 0.6,
        }));
        MiniBatchSgd { learning_rate: 1. }.apply_gradients(
            &mut layer,
            vec![PSnakeGradientSet::new(arr1(&[-5.0f32, 5.]).into_dyn())],
        );
        assert_approx_eq!(f32, layer.alpha(), arr1(&[0.6, 0.5]));
    }

    #[test]
    fn test_training_moves_alpha_towards_target() {
        let input = Array2::from_shape_fn((64, 2), |(i, _)| 2. * i as f32 / 63. - 1.);
        let target_layer = build(
            PSnakeConfig::default().with_alpha_initializer(Initializer::Constant { value: 1.5 }),
        );
        let target = target_layer.run(input.view()).unwrap();

        let mut layer = build(PSnakeConfig::default());
        let mut sgd = MiniBatchSgd { learning_rate: 1. };
        let initial_loss = mean_squared_error(&layer.run(input.view()).unwrap(), &target);

        for _ in 0..300 {
            let output = layer.run(input.view()).unwrap();
            let partials: Array2<f32> = mean_squared_error_gradient(&output, &target);
            let (_, gradients) = layer.gradients(input.view(), partials).unwrap();
            sgd.apply_gradients(&mut layer, vec![gradients]);
        }

        let loss = mean_squared_error(&layer.run(input.view()).unwrap(), &target);
        assert!(loss < initial_loss * 0.5, "{} >= {} / 2", loss, initial_loss);
        for alpha in layer.alpha().iter() {
            assert!((alpha - 1.5).abs() < 0.5, "alpha {} didn't move towards 1.5", alpha);
        }
    }
}
