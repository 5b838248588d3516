// --- File: src/axons/pooling.rs ---

//! Module implementing max and average pooling axons.

use crate::activation::{ActivationFormat, NeuronsActivation};
use crate::axons::{
    check_feature_count, Axons, AxonsActivation, AxonsError, AxonsResult,
};
use crate::context::ExecutionContext;
use crate::neurons::{Neurons3D, NeuronsDescriptor};
use ndarray::{Array2, ArrayView2};
use std::rc::Rc;

/// Configuration for pooling axons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolingConfig {
    /// Pooling window size (kH, kW).
    pub kernel_size: (usize, usize),
    /// Pooling stride (usually equals kernel_size).
    pub stride: (usize, usize),
}

impl PoolingConfig {
    pub fn new(kernel_size: (usize, usize), stride: (usize, usize)) -> Self {
        Self {
            kernel_size,
            stride,
        }
    }

    /// Creates a pooling configuration with equal kernel size and stride.
    pub fn square(size: usize) -> Self {
        Self {
            kernel_size: (size, size),
            stride: (size, size),
        }
    }
}

fn validate_geometry(
    name: &str,
    left: &Neurons3D,
    right: &Neurons3D,
    config: &PoolingConfig,
) -> AxonsResult<()> {
    let (kh, kw) = config.kernel_size;
    let (sh, sw) = config.stride;
    if kh > left.height || kw > left.width {
        return Err(AxonsError::ShapeMismatch(format!(
            "Pooling axons '{}': window {}x{} exceeds input {}x{}",
            name, kw, kh, left.width, left.height
        )));
    }
    let out_h = (left.height - kh) / sh + 1;
    let out_w = (left.width - kw) / sw + 1;
    if right.height != out_h || right.width != out_w || right.depth != left.depth {
        return Err(AxonsError::ShapeMismatch(format!(
            "Pooling axons '{}': window geometry yields {}x{}x{}, right neurons declare {}x{}x{}",
            name, out_w, out_h, left.depth, right.width, right.height, right.depth
        )));
    }
    Ok(())
}

/// Iterates all pooling windows, calling `visit(example, out_feature,
/// window_features)` with the flat input feature indices of the window.
fn for_each_window(
    left: &Neurons3D,
    right: &Neurons3D,
    config: &PoolingConfig,
    examples: usize,
    mut visit: impl FnMut(usize, usize, &[usize]),
) {
    let (kh, kw) = config.kernel_size;
    let (sh, sw) = config.stride;
    let plane = left.height * left.width;
    let out_plane = right.height * right.width;
    let mut window = vec![0usize; kh * kw];
    for e in 0..examples {
        for c in 0..left.depth {
            for oy in 0..right.height {
                for ox in 0..right.width {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = oy * sh + ky;
                            let ix = ox * sw + kx;
                            window[ky * kw + kx] = c * plane + iy * left.width + ix;
                        }
                    }
                    let out_feature = c * out_plane + oy * right.width + ox;
                    visit(e, out_feature, &window);
                }
            }
        }
    }
}

/// Max pooling axons: each output neuron is the maximum of its window.
///
/// The reverse push routes values back to the arg-max positions of the
/// recorded forward input, so it requires the record of a prior
/// `push_left_to_right`.
pub struct MaxPoolingAxons {
    name: String,
    left: Neurons3D,
    right: Neurons3D,
    config: PoolingConfig,
}

impl MaxPoolingAxons {
    pub fn new(
        name: impl Into<String>,
        left: Neurons3D,
        right: Neurons3D,
        config: PoolingConfig,
    ) -> AxonsResult<Self> {
        let name = name.into();
        validate_geometry(&name, &left, &right, &config)?;
        Ok(Self {
            name,
            left,
            right,
            config,
        })
    }

    /// Routes right-side values to the arg-max positions of the recorded
    /// forward input.
    fn route_to_argmax(
        &self,
        values: ArrayView2<'_, f32>,
        forward_input: ArrayView2<'_, f32>,
    ) -> Array2<f32> {
        let examples = values.ncols();
        let mut routed = Array2::<f32>::zeros((self.left.neuron_count(), examples));
        for_each_window(&self.left, &self.right, &self.config, examples, |e, out_f, window| {
            let mut best = window[0];
            for &f in window {
                if forward_input[[f, e]] > forward_input[[best, e]] {
                    best = f;
                }
            }
            routed[[best, e]] += values[[out_f, e]];
        });
        routed
    }
}

impl Axons for MaxPoolingAxons {
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
        _context: &ExecutionContext,
    ) -> AxonsResult<AxonsActivation> {
        check_feature_count(input, &self.left_neurons(), &self.name, "левая")?;

        let features = input.as_feature_rows();
        let examples = input.example_count();
        let mut output = Array2::<f32>::zeros((self.right.neuron_count(), examples));
        for_each_window(&self.left, &self.right, &self.config, examples, |e, out_f, window| {
            let mut max = f32::NEG_INFINITY;
            for &f in window {
                max = max.max(features[[f, e]]);
            }
            output[[out_f, e]] = max;
        });
        let output =
            NeuronsActivation::new(output, self.right, ActivationFormat::RowsSpanFeatureSet)?;

        Ok(AxonsActivation::new(
            Rc::clone(input),
            output,
            self.left_neurons(),
            self.right_neurons(),
        ))
    }

    fn push_right_to_left(
        &self,
        input: &Rc<NeuronsActivation>,
        previous_left_to_right: Option<&AxonsActivation>,
        _context: &ExecutionContext,
    ) -> AxonsResult<AxonsActivation> {
        check_feature_count(input, &self.right_neurons(), &self.name, "правая")?;

        let forward = previous_left_to_right.ok_or_else(|| {
            AxonsError::IllegalState(format!(
                "MaxPoolingAxons '{}': push_right_to_left требует записи прямого прохода (индексы максимумов)",
                self.name
            ))
        })?;

        let routed = self.route_to_argmax(
            input.as_feature_rows(),
            forward.effective_input().as_feature_rows(),
        );
        let output =
            NeuronsActivation::new(routed, self.left, ActivationFormat::RowsSpanFeatureSet)?;

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

        let routed = self.route_to_argmax(
            outer_gradient.as_feature_rows(),
            forward.effective_input().as_feature_rows(),
        );
        Ok(NeuronsActivation::new(
            routed,
            self.left,
            ActivationFormat::RowsSpanFeatureSet,
        )?)
    }
}

/// Average pooling axons: each output neuron is the mean of its window.
///
/// The reverse push spreads values uniformly over the window; no forward
/// record is required.
pub struct AveragePoolingAxons {
    name: String,
    left: Neurons3D,
    right: Neurons3D,
    config: PoolingConfig,
}

impl AveragePoolingAxons {
    pub fn new(
        name: impl Into<String>,
        left: Neurons3D,
        right: Neurons3D,
        config: PoolingConfig,
    ) -> AxonsResult<Self> {
        let name = name.into();
        validate_geometry(&name, &left, &right, &config)?;
        Ok(Self {
            name,
            left,
            right,
            config,
        })
    }

    fn spread_uniformly(&self, values: ArrayView2<'_, f32>) -> Array2<f32> {
        let (kh, kw) = self.config.kernel_size;
        let window_len = (kh * kw) as f32;
        let examples = values.ncols();
        let mut spread = Array2::<f32>::zeros((self.left.neuron_count(), examples));
        for_each_window(&self.left, &self.right, &self.config, examples, |e, out_f, window| {
            let share = values[[out_f, e]] / window_len;
            for &f in window {
                spread[[f, e]] += share;
            }
        });
        spread
    }
}

impl Axons for AveragePoolingAxons {
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
        _context: &ExecutionContext,
    ) -> AxonsResult<AxonsActivation> {
        check_feature_count(input, &self.left_neurons(), &self.name, "левая")?;

        let features = input.as_feature_rows();
        let examples = input.example_count();
        let (kh, kw) = self.config.kernel_size;
        let window_len = (kh * kw) as f32;
        let mut output = Array2::<f32>::zeros((self.right.neuron_count(), examples));
        for_each_window(&self.left, &self.right, &self.config, examples, |e, out_f, window| {
            let mut sum = 0.0;
            for &f in window {
                sum += features[[f, e]];
            }
            output[[out_f, e]] = sum / window_len;
        });
        let output =
            NeuronsActivation::new(output, self.right, ActivationFormat::RowsSpanFeatureSet)?;

        Ok(AxonsActivation::new(
            Rc::clone(input),
            output,
            self.left_neurons(),
            self.right_neurons(),
        ))
    }

    fn push_right_to_left(
        &self,
        input: &Rc<NeuronsActivation>,
        _previous_left_to_right: Option<&AxonsActivation>,
        _context: &ExecutionContext,
    ) -> AxonsResult<AxonsActivation> {
        check_feature_count(input, &self.right_neurons(), &self.name, "правая")?;

        let spread = self.spread_uniformly(input.as_feature_rows());
        let output =
            NeuronsActivation::new(spread, self.left, ActivationFormat::RowsSpanFeatureSet)?;

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
        _forward: &AxonsActivation,
        _context: &ExecutionContext,
    ) -> AxonsResult<NeuronsActivation> {
        check_feature_count(outer_gradient, &self.right_neurons(), &self.name, "правая")?;

        let spread = self.spread_uniformly(outer_gradient.as_feature_rows());
        Ok(NeuronsActivation::new(
            spread,
            self.left,
            ActivationFormat::RowsSpanFeatureSet,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn spatial(values: Vec<f32>, shape: Neurons3D) -> Rc<NeuronsActivation> {
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

    fn pool_4x4() -> (Neurons3D, Neurons3D) {
        (Neurons3D::new(4, 4, 1, false), Neurons3D::new(2, 2, 1, false))
    }

    #[test]
    fn test_max_pool_forward() {
        let (left, right) = pool_4x4();
        let axons = MaxPoolingAxons::new("pool1", left, right, PoolingConfig::square(2)).unwrap();
        let ctx = ExecutionContext::inference();
        let input = spatial(
            vec![
                1.0, 2.0, 3.0, 4.0, //
                5.0, 6.0, 7.0, 8.0, //
                9.0, 10.0, 11.0, 12.0, //
                13.0, 14.0, 15.0, 16.0,
            ],
            left,
        );

        let activation = axons.push_left_to_right(&input, None, &ctx).unwrap();
        assert_eq!(
            activation.output().data().column(0).to_vec(),
            vec![6.0, 8.0, 14.0, 16.0]
        );
    }

    #[test]
    fn test_max_pool_backward_requires_forward_record() {
        let (left, right) = pool_4x4();
        let axons = MaxPoolingAxons::new("pool1", left, right, PoolingConfig::square(2)).unwrap();
        let ctx = ExecutionContext::inference();
        let gradient = spatial(vec![1.0, 1.0, 1.0, 1.0], right);

        assert!(matches!(
            axons.push_right_to_left(&gradient, None, &ctx),
            Err(AxonsError::IllegalState(_))
        ));
    }

    #[test]
    fn test_max_pool_gradient_routes_to_argmax() {
        let (left, right) = pool_4x4();
        let axons = MaxPoolingAxons::new("pool1", left, right, PoolingConfig::square(2)).unwrap();
        let ctx = ExecutionContext::inference();
        let input = spatial(
            vec![
                1.0, 2.0, 3.0, 4.0, //
                5.0, 6.0, 7.0, 8.0, //
                9.0, 10.0, 11.0, 12.0, //
                13.0, 14.0, 15.0, 16.0,
            ],
            left,
        );
        let forward = axons.push_left_to_right(&input, None, &ctx).unwrap();

        let gradient = NeuronsActivation::new(
            array![[1.0], [2.0], [3.0], [4.0]],
            right,
            ActivationFormat::RowsSpanFeatureSet,
        )
        .unwrap();
        let back = axons.propagated_gradient(&gradient, &forward, &ctx).unwrap();
        // Максимумы сидят в позициях 5, 7, 13, 15.
        assert_eq!(back.data()[[5, 0]], 1.0);
        assert_eq!(back.data()[[7, 0]], 2.0);
        assert_eq!(back.data()[[13, 0]], 3.0);
        assert_eq!(back.data()[[15, 0]], 4.0);
        assert_eq!(back.data().sum(), 10.0);
    }

    #[test]
    fn test_average_pool_round_trip() {
        let (left, right) = pool_4x4();
        let axons =
            AveragePoolingAxons::new("pool2", left, right, PoolingConfig::square(2)).unwrap();
        let ctx = ExecutionContext::inference();
        let input = spatial(vec![4.0; 16], left);

        let activation = axons.push_left_to_right(&input, None, &ctx).unwrap();
        assert_eq!(
            activation.output().data().column(0).to_vec(),
            vec![4.0, 4.0, 4.0, 4.0]
        );

        let back = axons
            .push_right_to_left(activation.output(), Some(&activation), &ctx)
            .unwrap();
        assert_eq!(back.output().data().column(0).to_vec(), vec![1.0; 16]);
    }
}
