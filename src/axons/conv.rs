// --- File: src/axons/conv.rs ---

//! Module implementing convolutional axons.

use crate::activation::{ActivationFormat, NeuronsActivation};
use crate::axons::im2col::{
    columns_to_features, columns_to_images, features_to_columns, images_to_columns,
    output_dimensions,
};
use crate::axons::{
    apply_input_dropout, check_feature_count, AdjustmentDirection, Axons, AxonsActivation,
    AxonsError, AxonsGradient, AxonsResult, TrainableAxons,
};
use crate::context::ExecutionContext;
use crate::neurons::{Neurons3D, NeuronsDescriptor};
use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use std::rc::Rc;

/// Configuration for convolutional axons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvolutionConfig {
    /// Convolution kernel size (kH, kW).
    pub kernel_size: (usize, usize),
    /// Convolution stride.
    pub stride: (usize, usize),
    /// Zero padding.
    pub padding: (usize, usize),
}

impl Default for ConvolutionConfig {
    fn default() -> Self {
        Self {
            kernel_size: (3, 3),
            stride: (1, 1),
            padding: (0, 0),
        }
    }
}

impl ConvolutionConfig {
    /// Creates a convolution configuration with the given kernel size.
    pub fn new(kernel_size: (usize, usize)) -> Self {
        Self {
            kernel_size,
            ..Default::default()
        }
    }

    /// Sets convolution stride.
    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    /// Sets zero padding.
    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }
}

/// Convolutional axons between two spatial neuron sets.
///
/// The forward push runs through the image-to-column collaborator: input
/// windows are reformatted into columns, one matrix multiply against the
/// flattened kernel matrix `(out_depth, in_depth*kH*kW)` produces all
/// output positions, and the result is folded back into the feature-major
/// activation layout.
pub struct ConvolutionalAxons {
    name: String,
    left: Neurons3D,
    right: Neurons3D,
    config: ConvolutionConfig,
    weights: Array2<f32>,
    left_to_right_biases: Option<Array1<f32>>,
    right_to_left_biases: Option<Array1<f32>>,
}

impl ConvolutionalAxons {
    /// Creates convolutional axons with Xavier-uniform initialised kernels.
    ///
    /// Fails with a shape-mismatch error if the right neurons do not match
    /// the window geometry implied by the left neurons and the config.
    pub fn new(
        name: impl Into<String>,
        left: Neurons3D,
        right: Neurons3D,
        config: ConvolutionConfig,
    ) -> AxonsResult<Self> {
        let name = name.into();
        let (kh, kw) = config.kernel_size;
        let (ph, pw) = config.padding;
        if kh > left.height + 2 * ph || kw > left.width + 2 * pw {
            return Err(AxonsError::ShapeMismatch(format!(
                "ConvolutionalAxons '{}': kernel {}x{} exceeds padded input {}x{}",
                name,
                kw,
                kh,
                left.width + 2 * pw,
                left.height + 2 * ph
            )));
        }
        let (out_h, out_w) = output_dimensions(&left, &config);
        if right.height != out_h || right.width != out_w {
            return Err(AxonsError::ShapeMismatch(format!(
                "ConvolutionalAxons '{}': window geometry yields {}x{}, right neurons declare {}x{}",
                name, out_h, out_w, right.height, right.width
            )));
        }
        let (kh, kw) = config.kernel_size;
        let fan_in = left.depth * kh * kw;
        let bound = (6.0 / (fan_in + right.depth) as f32).sqrt();
        let weights = Array2::random((right.depth, fan_in), Uniform::new(-bound, bound));
        Ok(Self {
            name,
            left,
            right,
            config,
            weights,
            left_to_right_biases: left.has_bias_unit.then(|| Array1::zeros(right.depth)),
            right_to_left_biases: right
                .has_bias_unit
                .then(|| Array1::zeros(left.neuron_count())),
        })
    }

    /// Creates convolutional axons from an explicit kernel matrix.
    pub fn with_parameters(
        name: impl Into<String>,
        left: Neurons3D,
        right: Neurons3D,
        config: ConvolutionConfig,
        weights: Array2<f32>,
        left_to_right_biases: Option<Array1<f32>>,
    ) -> AxonsResult<Self> {
        let mut axons = Self::new(name, left, right, config)?;
        let (kh, kw) = config.kernel_size;
        let expected = (right.depth, left.depth * kh * kw);
        if weights.dim() != expected {
            return Err(AxonsError::ShapeMismatch(format!(
                "ConvolutionalAxons '{}': kernel matrix {:?} does not match {:?}",
                axons.name,
                weights.dim(),
                expected
            )));
        }
        if let Some(b) = &left_to_right_biases {
            if b.len() != right.depth {
                return Err(AxonsError::ShapeMismatch(format!(
                    "ConvolutionalAxons '{}': bias length {} does not match filter count {}",
                    axons.name,
                    b.len(),
                    right.depth
                )));
            }
        }
        axons.weights = weights;
        axons.left_to_right_biases = left_to_right_biases;
        Ok(axons)
    }

    pub fn config(&self) -> &ConvolutionConfig {
        &self.config
    }

    fn window_count(&self) -> usize {
        self.right.height * self.right.width
    }
}

impl Axons for ConvolutionalAxons {
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

        let examples = effective.example_count();
        let columns = images_to_columns(effective.as_feature_rows(), &self.left, &self.config);
        let mut out_columns = self.weights.dot(&columns);
        if let Some(biases) = &self.left_to_right_biases {
            out_columns += &biases.view().insert_axis(Axis(1));
        }
        let output = columns_to_features(
            out_columns.view(),
            self.right.depth,
            self.window_count(),
            examples,
        );
        let output =
            NeuronsActivation::new(output, self.right, ActivationFormat::RowsSpanFeatureSet)?;

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

        let examples = input.example_count();
        let in_columns = features_to_columns(
            input.as_feature_rows(),
            self.right.depth,
            self.window_count(),
            examples,
        );
        let columns = self.weights.t().dot(&in_columns);
        let mut output = columns_to_images(&columns, &self.left, &self.config, examples);
        if let Some(biases) = &self.right_to_left_biases {
            output += &biases.view().insert_axis(Axis(1));
        }
        let output =
            NeuronsActivation::new(output, self.left, ActivationFormat::RowsSpanFeatureSet)?;

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

        let examples = outer_gradient.example_count();
        let gradient_columns = features_to_columns(
            outer_gradient.as_feature_rows(),
            self.right.depth,
            self.window_count(),
            examples,
        );
        let columns = self.weights.t().dot(&gradient_columns);
        let mut gradient = columns_to_images(&columns, &self.left, &self.config, examples);
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

        let examples = outer_gradient.example_count();
        let gradient_columns = features_to_columns(
            outer_gradient.as_feature_rows(),
            self.right.depth,
            self.window_count(),
            examples,
        );
        let input_columns = images_to_columns(
            forward.effective_input().as_feature_rows(),
            &self.left,
            &self.config,
        );
        let mut weights_gradient = gradient_columns.dot(&input_columns.t());

        let lambda = context.regularization_lambda();
        if lambda > 0.0 {
            weights_gradient.scaled_add(lambda, &self.weights);
        }

        let bias_gradient = self
            .left_to_right_biases
            .as_ref()
            .map(|_| gradient_columns.sum_axis(Axis(1)));

        Ok(AxonsGradient::new(
            self.name.clone(),
            weights_gradient,
            bias_gradient,
            None,
            examples,
        ))
    }
}

impl TrainableAxons for ConvolutionalAxons {
    fn adjust_connection_weights(
        &mut self,
        delta: &Array2<f32>,
        direction: AdjustmentDirection,
    ) -> AxonsResult<()> {
        if delta.dim() != self.weights.dim() {
            return Err(AxonsError::ShapeMismatch(format!(
                "ConvolutionalAxons '{}': kernel delta {:?} does not match {:?}",
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
                "ConvolutionalAxons '{}' has no bias unit to adjust",
                self.name
            ))
        })?;
        if delta.len() != biases.len() {
            return Err(AxonsError::ShapeMismatch(format!(
                "ConvolutionalAxons '{}': bias delta length {} does not match {}",
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

    fn summing_conv() -> ConvolutionalAxons {
        // Один входной канал 3x3, один фильтр 2x2 из единиц: каждый выход -
        // сумма своего окна.
        ConvolutionalAxons::with_parameters(
            "conv1",
            Neurons3D::new(3, 3, 1, true),
            Neurons3D::new(2, 2, 1, false),
            ConvolutionConfig::new((2, 2)),
            array![[1.0, 1.0, 1.0, 1.0]],
            Some(array![0.0]),
        )
        .unwrap()
    }

    fn spatial_input(values: Vec<f32>, shape: Neurons3D) -> Rc<NeuronsActivation> {
        let features = values.len();
        Rc::new(
            NeuronsActivation::new(
                Array2::from_shape_vec((features, 1), values).unwrap(),
                shape,
                ActivationFormat::RowsSpanFeatureSet,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_geometry_mismatch_is_rejected() {
        let result = ConvolutionalAxons::new(
            "conv_bad",
            Neurons3D::new(3, 3, 1, false),
            Neurons3D::new(3, 3, 1, false),
            ConvolutionConfig::new((2, 2)),
        );
        assert!(matches!(result, Err(AxonsError::ShapeMismatch(_))));
    }

    #[test]
    fn test_forward_sums_windows() {
        let axons = summing_conv();
        let ctx = ExecutionContext::inference();
        let input = spatial_input(
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            Neurons3D::new(3, 3, 1, true),
        );

        let activation = axons.push_left_to_right(&input, None, &ctx).unwrap();
        assert_eq!(
            activation.output().data().column(0).to_vec(),
            vec![8.0, 12.0, 20.0, 24.0]
        );
    }

    #[test]
    fn test_gradient_dimensions() {
        let axons = summing_conv();
        let ctx = ExecutionContext::training();
        let input = spatial_input(
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            Neurons3D::new(3, 3, 1, true),
        );
        let forward = axons.push_left_to_right(&input, None, &ctx).unwrap();

        let g = NeuronsActivation::new(
            Array2::from_elem((4, 1), 1.0),
            Neurons3D::new(2, 2, 1, false),
            ActivationFormat::RowsSpanFeatureSet,
        )
        .unwrap();
        let gradient = axons.calculate_gradient(&forward, &g, &ctx).unwrap();
        assert_eq!(gradient.weights_gradient().dim(), (1, 4));
        // Единичный градиент по всем окнам: dW - суммы по окнам входа.
        assert_eq!(
            gradient.weights_gradient().row(0).to_vec(),
            vec![8.0, 12.0, 20.0, 24.0]
        );

        let back = axons.propagated_gradient(&g, &forward, &ctx).unwrap();
        assert_eq!(back.feature_count(), 9);
        // Центральный пиксель входит во все четыре окна.
        assert_eq!(back.data()[[4, 0]], 4.0);
    }
}
