// --- File: src/axons/fully_connected.rs ---

//! Module implementing fully connected axons.

use crate::activation::{ActivationFormat, NeuronsActivation};
use crate::axons::{
    apply_input_dropout, check_feature_count, AdjustmentDirection, Axons, AxonsActivation,
    AxonsError, AxonsGradient, AxonsResult, TrainableAxons,
};
use crate::context::ExecutionContext;
use crate::neurons::{Neurons, NeuronsDescriptor};
use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use std::rc::Rc;

/// Fully connected axons between two flat neuron sets.
///
/// Forward rule: `output = W·input + b`, with the bias vector present iff
/// the left neurons carry a bias unit. The reverse push is `Wᵀ·y + b_rtl`,
/// with the reverse bias present iff the right neurons carry a bias unit.
///
/// Weights have shape `(right_count, left_count)`; activations flow in
/// rows-span-features orientation.
pub struct FullyConnectedAxons {
    name: String,
    left: Neurons,
    right: Neurons,
    weights: Array2<f32>,
    left_to_right_biases: Option<Array1<f32>>,
    right_to_left_biases: Option<Array1<f32>>,
}

impl FullyConnectedAxons {
    /// Creates fully connected axons with Xavier-uniform initialised weights
    /// and zero biases.
    pub fn new(name: impl Into<String>, left: Neurons, right: Neurons) -> Self {
        let bound = (6.0 / (left.neuron_count + right.neuron_count) as f32).sqrt();
        let weights = Array2::random(
            (right.neuron_count, left.neuron_count),
            Uniform::new(-bound, bound),
        );
        Self {
            name: name.into(),
            left,
            right,
            weights,
            left_to_right_biases: left.has_bias_unit.then(|| Array1::zeros(right.neuron_count)),
            right_to_left_biases: right.has_bias_unit.then(|| Array1::zeros(left.neuron_count)),
        }
    }

    /// Creates fully connected axons from explicit parameters.
    pub fn with_parameters(
        name: impl Into<String>,
        left: Neurons,
        right: Neurons,
        weights: Array2<f32>,
        left_to_right_biases: Option<Array1<f32>>,
    ) -> AxonsResult<Self> {
        let name = name.into();
        if weights.dim() != (right.neuron_count, left.neuron_count) {
            return Err(AxonsError::ShapeMismatch(format!(
                "FullyConnectedAxons '{}': weights {:?} do not match (right={}, left={})",
                name,
                weights.dim(),
                right.neuron_count,
                left.neuron_count
            )));
        }
        if let Some(b) = &left_to_right_biases {
            if b.len() != right.neuron_count {
                return Err(AxonsError::ShapeMismatch(format!(
                    "FullyConnectedAxons '{}': bias length {} does not match right count {}",
                    name,
                    b.len(),
                    right.neuron_count
                )));
            }
        }
        Ok(Self {
            name,
            left,
            right,
            weights,
            left_to_right_biases,
            right_to_left_biases: right.has_bias_unit.then(|| Array1::zeros(left.neuron_count)),
        })
    }
}

impl Axons for FullyConnectedAxons {
    fn name(&self) -> &str {
        &self.name
    }

    fn left_neurons(&self) -> NeuronsDescriptor {
        self.left.into()
    }

    fn right_neurons(&self) -> NeuronsDescriptor {
        self.right.into()
    }

    fn push_left_to_right(
        &self,
        input: &Rc<NeuronsActivation>,
        _previous_right_to_left: Option<&AxonsActivation>,
        context: &ExecutionContext,
    ) -> AxonsResult<AxonsActivation> {
        check_feature_count(input, &self.left_neurons(), &self.name, "левая")?;

        let dropout = apply_input_dropout(input, context)?;
        let (effective, mask) = match dropout {
            Some((dropped, mask)) => (Rc::new(dropped), Some(mask)),
            None => (Rc::clone(input), None),
        };

        let mut output = self.weights.dot(&effective.as_feature_rows());
        if let Some(biases) = &self.left_to_right_biases {
            output += &biases.view().insert_axis(Axis(1));
        }
        let output = NeuronsActivation::new(output, self.right, ActivationFormat::RowsSpanFeatureSet)?;

        Ok(match mask {
            Some(mask) => AxonsActivation::with_dropout(
                Rc::clone(input),
                effective,
                mask,
                output,
                self.left_neurons(),
                self.right_neurons(),
            ),
            None => AxonsActivation::new(
                Rc::clone(input),
                output,
                self.left_neurons(),
                self.right_neurons(),
            ),
        })
    }

    fn push_right_to_left(
        &self,
        input: &Rc<NeuronsActivation>,
        _previous_left_to_right: Option<&AxonsActivation>,
        _context: &ExecutionContext,
    ) -> AxonsResult<AxonsActivation> {
        check_feature_count(input, &self.right_neurons(), &self.name, "правая")?;

        let mut output = self.weights.t().dot(&input.as_feature_rows());
        if let Some(biases) = &self.right_to_left_biases {
            output += &biases.view().insert_axis(Axis(1));
        }
        let output = NeuronsActivation::new(output, self.left, ActivationFormat::RowsSpanFeatureSet)?;

        Ok(AxonsActivation::new(
            Rc::clone(input),
            output,
            self.left_neurons(),
            self.right_neurons(),
        ))
    }

    fn propagated_gradient(
        &self,
        outer_gradient: &NeuronsActivation,
        forward: &AxonsActivation,
        _context: &ExecutionContext,
    ) -> AxonsResult<NeuronsActivation> {
        check_feature_count(outer_gradient, &self.right_neurons(), &self.name, "правая")?;

        let mut gradient = self.weights.t().dot(&outer_gradient.as_feature_rows());
        if let Some(mask) = forward.dropout_mask() {
            gradient *= mask;
        }
        Ok(NeuronsActivation::new(
            gradient,
            self.left,
            ActivationFormat::RowsSpanFeatureSet,
        )?)
    }

    fn is_trainable(&self, context: &ExecutionContext) -> bool {
        !context.is_frozen()
    }

    fn calculate_gradient(
        &self,
        forward: &AxonsActivation,
        outer_gradient: &NeuronsActivation,
        context: &ExecutionContext,
    ) -> AxonsResult<AxonsGradient> {
        check_feature_count(outer_gradient, &self.right_neurons(), &self.name, "правая")?;

        let g = outer_gradient.as_feature_rows();
        let x = forward.effective_input().as_feature_rows();
        let mut weights_gradient = g.dot(&x.t());

        let lambda = context.regularization_lambda();
        if lambda > 0.0 {
            weights_gradient.scaled_add(lambda, &self.weights);
        }

        let bias_gradient = self
            .left_to_right_biases
            .as_ref()
            .map(|_| g.sum_axis(Axis(1)));

        Ok(AxonsGradient::new(
            self.name.clone(),
            weights_gradient,
            bias_gradient,
            None,
            outer_gradient.example_count(),
        ))
    }
}

impl TrainableAxons for FullyConnectedAxons {
    fn adjust_connection_weights(
        &mut self,
        delta: &Array2<f32>,
        direction: AdjustmentDirection,
    ) -> AxonsResult<()> {
        if delta.dim() != self.weights.dim() {
            return Err(AxonsError::ShapeMismatch(format!(
                "FullyConnectedAxons '{}': weight delta {:?} does not match weights {:?}",
                self.name,
                delta.dim(),
                self.weights.dim()
            )));
        }
        self.weights.scaled_add(direction.signum(), delta);
        Ok(())
    }

    fn adjust_biases(
        &mut self,
        delta: &Array1<f32>,
        direction: AdjustmentDirection,
    ) -> AxonsResult<()> {
        let biases = self.left_to_right_biases.as_mut().ok_or_else(|| {
            AxonsError::IllegalState(format!(
                "FullyConnectedAxons '{}' has no bias unit to adjust",
                self.name
            ))
        })?;
        if delta.len() != biases.len() {
            return Err(AxonsError::ShapeMismatch(format!(
                "FullyConnectedAxons '{}': bias delta length {} does not match {}",
                self.name,
                delta.len(),
                biases.len()
            )));
        }
        biases.scaled_add(direction.signum(), delta);
        Ok(())
    }

    fn detached_weights(&self) -> Array2<f32> {
        self.weights.clone()
    }

    fn detached_biases(&self) -> Option<Array1<f32>> {
        self.left_to_right_biases.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn axons_2_to_3() -> FullyConnectedAxons {
        FullyConnectedAxons::with_parameters(
            "fc1",
            Neurons::new(2, true),
            Neurons::new(3, false),
            array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]],
            Some(array![0.5, -0.5, 0.0]),
        )
        .unwrap()
    }

    fn input(data: Array2<f32>, count: usize) -> Rc<NeuronsActivation> {
        Rc::new(
            NeuronsActivation::new(
                data,
                Neurons::new(count, false),
                ActivationFormat::RowsSpanFeatureSet,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_forward_applies_weights_and_bias() {
        let axons = axons_2_to_3();
        let ctx = ExecutionContext::inference();
        let x = input(array![[1.0, 2.0], [3.0, 4.0]], 2);

        let activation = axons.push_left_to_right(&x, None, &ctx).unwrap();
        let out = activation.output().data().clone();
        assert_eq!(out, array![[1.5, 2.5], [2.5, 3.5], [4.0, 6.0]]);
        assert_eq!(activation.output().feature_count(), 3);
        assert_eq!(activation.output().example_count(), 2);
    }

    #[test]
    fn test_forward_rejects_wrong_feature_count() {
        let axons = axons_2_to_3();
        let ctx = ExecutionContext::inference();
        let x = input(array![[1.0], [2.0], [3.0]], 3);
        assert!(matches!(
            axons.push_left_to_right(&x, None, &ctx),
            Err(AxonsError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_reverse_push_is_transpose() {
        let axons = axons_2_to_3();
        let ctx = ExecutionContext::inference();
        let y = input(array![[1.0], [1.0], [1.0]], 3);

        let activation = axons.push_right_to_left(&y, None, &ctx).unwrap();
        assert_eq!(activation.output().data().clone(), array![[2.0], [2.0]]);
    }

    #[test]
    fn test_gradient_shapes_and_bias_sum() {
        let axons = axons_2_to_3();
        let ctx = ExecutionContext::training();
        let x = input(array![[1.0, 2.0], [3.0, 4.0]], 2);
        let forward = axons.push_left_to_right(&x, None, &ctx).unwrap();

        let g = NeuronsActivation::new(
            array![[1.0, 1.0], [2.0, 0.0], [0.0, 1.0]],
            Neurons::new(3, false),
            ActivationFormat::RowsSpanFeatureSet,
        )
        .unwrap();
        let gradient = axons.calculate_gradient(&forward, &g, &ctx).unwrap();
        assert_eq!(gradient.weights_gradient().dim(), (3, 2));
        assert_eq!(
            gradient.left_to_right_bias_gradient().unwrap().clone(),
            array![2.0, 2.0, 1.0]
        );
        assert_eq!(gradient.example_count(), 2);
    }

    #[test]
    fn test_adjustment_accumulates_with_sign() {
        let mut axons = axons_2_to_3();
        let before = axons.detached_weights();
        let delta = Array2::from_elem((3, 2), 0.5);
        axons
            .adjust_connection_weights(&delta, AdjustmentDirection::Subtraction)
            .unwrap();
        let after = axons.detached_weights();
        assert_eq!(after[[0, 0]], before[[0, 0]] - 0.5);
    }
}
