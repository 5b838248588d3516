//! Scale-and-shift аксоны и batch normalization поверх них.
//!
//! `ScaleAndShiftAxons` - пофичевая аффинная трансформация `y = x·γ + β`
//! с точной инверсией в качестве обратного push-а.
//! `BatchNormAxons` нормализует батч по каждому признаку и поддерживает
//! экспоненциально-взвешенные running-статистики, которые читаются в
//! режиме инференса вместо батчевых.

use crate::activation::{ActivationFormat, NeuronsActivation};
use crate::axons::{
    apply_input_dropout, check_feature_count, AdjustmentDirection, Axons, AxonsActivation,
    AxonsError, AxonsGradient, AxonsResult, TrainableAxons,
};
use crate::context::ExecutionContext;
use crate::neurons::{Neurons, NeuronsDescriptor};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::cell::RefCell;
use std::rc::Rc;

/// Малая константа для численной стабильности нормализации.
const EPS: f32 = 1e-5;

/// Momentum по умолчанию: `r_t = momentum·r_{t-1} + (1-momentum)·batch`.
const DEFAULT_MOMENTUM: f32 = 0.9;

fn column(v: &Array1<f32>) -> ndarray::ArrayView2<'_, f32> {
    v.view().insert_axis(Axis(1))
}

/// Пофичевая аффинная трансформация: `y = x·γ + β`.
///
/// Обратный push - точная инверсия `(y − β)/γ`; масштаб обязан быть
/// ненулевым по всем признакам.
pub struct ScaleAndShiftAxons {
    name: String,
    neurons: Neurons,
    scale: Array1<f32>,
    shift: Array1<f32>,
}

impl ScaleAndShiftAxons {
    /// Создаёт аксоны с единичным масштабом и нулевым сдвигом.
    pub fn new(name: impl Into<String>, neurons: Neurons) -> Self {
        Self {
            name: name.into(),
            neurons,
            scale: Array1::ones(neurons.neuron_count),
            shift: Array1::zeros(neurons.neuron_count),
        }
    }

    /// Создаёт аксоны с явными параметрами.
    pub fn with_parameters(
        name: impl Into<String>,
        neurons: Neurons,
        scale: Array1<f32>,
        shift: Array1<f32>,
    ) -> AxonsResult<Self> {
        let name = name.into();
        if scale.len() != neurons.neuron_count || shift.len() != neurons.neuron_count {
            return Err(AxonsError::ShapeMismatch(format!(
                "ScaleAndShiftAxons '{}': параметры длины {}/{} не совпадают с {} нейронами",
                name,
                scale.len(),
                shift.len(),
                neurons.neuron_count
            )));
        }
        Ok(Self {
            name,
            neurons,
            scale,
            shift,
        })
    }

    pub fn scale(&self) -> &Array1<f32> {
        &self.scale
    }

    pub fn shift(&self) -> &Array1<f32> {
        &self.shift
    }
}

impl Axons for ScaleAndShiftAxons {
    fn name(&self) -> &str {
        &self.name
    }

    fn left_neurons(&self) -> NeuronsDescriptor {
        self.neurons.into()
    }

    fn right_neurons(&self) -> NeuronsDescriptor {
        self.neurons.into()
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

        let mut output = effective.as_feature_rows().to_owned();
        output *= &column(&self.scale);
        output += &column(&self.shift);
        let output =
            NeuronsActivation::new(output, self.neurons, ActivationFormat::RowsSpanFeatureSet)?;

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

        let mut output = input.as_feature_rows().to_owned();
        output -= &column(&self.shift);
        output /= &column(&self.scale);
        let output =
            NeuronsActivation::new(output, self.neurons, ActivationFormat::RowsSpanFeatureSet)?;

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

        let mut gradient = outer_gradient.as_feature_rows().to_owned();
        gradient *= &column(&self.scale);
        if let Some(mask) = forward.dropout_mask() {
            gradient *= mask;
        }
        Ok(NeuronsActivation::new(
            gradient,
            self.neurons,
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
        _context: &ExecutionContext,
    ) -> AxonsResult<AxonsGradient> {
        check_feature_count(outer_gradient, &self.right_neurons(), &self.name, "правая")?;

        let g = outer_gradient.as_feature_rows();
        let x = forward.effective_input().as_feature_rows();
        let scale_gradient = (&g.to_owned() * &x).sum_axis(Axis(1));
        let shift_gradient = g.sum_axis(Axis(1));

        Ok(AxonsGradient::new(
            self.name.clone(),
            scale_gradient.insert_axis(Axis(1)),
            Some(shift_gradient),
            None,
            outer_gradient.example_count(),
        ))
    }
}

impl TrainableAxons for ScaleAndShiftAxons {
    fn adjust_connection_weights(
        &mut self,
        delta: &Array2<f32>,
        direction: AdjustmentDirection,
    ) -> AxonsResult<()> {
        if delta.dim() != (self.scale.len(), 1) {
            return Err(AxonsError::ShapeMismatch(format!(
                "ScaleAndShiftAxons '{}': дельта масштаба {:?} не совпадает с ({}, 1)",
                self.name,
                delta.dim(),
                self.scale.len()
            )));
        }
        self.scale
            .scaled_add(direction.signum(), &delta.column(0).to_owned());
        Ok(())
    }

    fn adjust_biases(
        &mut self,
        delta: &Array1<f32>,
        direction: AdjustmentDirection,
    ) -> AxonsResult<()> {
        if delta.len() != self.shift.len() {
            return Err(AxonsError::ShapeMismatch(format!(
                "ScaleAndShiftAxons '{}': дельта сдвига длины {} не совпадает с {}",
                self.name,
                delta.len(),
                self.shift.len()
            )));
        }
        self.shift.scaled_add(direction.signum(), delta);
        Ok(())
    }

    fn detached_weights(&self) -> Array2<f32> {
        self.scale.clone().insert_axis(Axis(1))
    }

    fn detached_biases(&self) -> Option<Array1<f32>> {
        Some(self.shift.clone())
    }
}

/// Батчевые статистики по каждому признаку (строке).
fn batch_statistics(x: ArrayView2<'_, f32>) -> (Array1<f32>, Array1<f32>) {
    let mean = x.mean_axis(Axis(1)).expect("batch is never empty");
    let variance = x.var_axis(Axis(1), 0.0);
    (mean, variance)
}

/// Batch normalization: нормализация батча по каждому признаку с
/// обучаемыми `γ`/`β` и running-статистиками.
///
/// В режиме обучения используются статистики текущего батча, и running
/// обновляется по формуле `r_t = momentum·r_{t-1} + (1-momentum)·batch`.
/// В режиме инференса читаются накопленные running-статистики.
pub struct BatchNormAxons {
    name: String,
    neurons: Neurons,
    scale: Array1<f32>,
    shift: Array1<f32>,
    momentum: f32,
    epsilon: f32,
    running_mean: RefCell<Array1<f32>>,
    running_variance: RefCell<Array1<f32>>,
}

impl BatchNormAxons {
    pub fn new(name: impl Into<String>, neurons: Neurons) -> Self {
        Self {
            name: name.into(),
            neurons,
            scale: Array1::ones(neurons.neuron_count),
            shift: Array1::zeros(neurons.neuron_count),
            momentum: DEFAULT_MOMENTUM,
            epsilon: EPS,
            running_mean: RefCell::new(Array1::zeros(neurons.neuron_count)),
            running_variance: RefCell::new(Array1::ones(neurons.neuron_count)),
        }
    }

    /// Задаёт momentum экспоненциального сглаживания.
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    /// Снимок накопленного running-среднего.
    pub fn running_mean(&self) -> Array1<f32> {
        self.running_mean.borrow().clone()
    }

    /// Снимок накопленной running-дисперсии.
    pub fn running_variance(&self) -> Array1<f32> {
        self.running_variance.borrow().clone()
    }

    fn update_running(&self, mean: &Array1<f32>, variance: &Array1<f32>) {
        let mut running_mean = self.running_mean.borrow_mut();
        let mut running_variance = self.running_variance.borrow_mut();
        running_mean.zip_mut_with(mean, |r, &b| *r = self.momentum * *r + (1.0 - self.momentum) * b);
        running_variance
            .zip_mut_with(variance, |r, &b| *r = self.momentum * *r + (1.0 - self.momentum) * b);
    }

    /// Статистики, действующие в данном контексте: батчевые при обучении,
    /// running при инференсе.
    fn effective_statistics(
        &self,
        x: ArrayView2<'_, f32>,
        context: &ExecutionContext,
    ) -> (Array1<f32>, Array1<f32>) {
        if context.is_training() {
            batch_statistics(x)
        } else {
            (self.running_mean(), self.running_variance())
        }
    }

    fn normalise(
        &self,
        x: ArrayView2<'_, f32>,
        mean: &Array1<f32>,
        variance: &Array1<f32>,
    ) -> Array2<f32> {
        let std = variance.mapv(|v| (v + self.epsilon).sqrt());
        let mut normalised = x.to_owned();
        normalised -= &column(mean);
        normalised /= &column(&std);
        normalised
    }
}

impl Axons for BatchNormAxons {
    fn name(&self) -> &str {
        &self.name
    }

    fn left_neurons(&self) -> NeuronsDescriptor {
        self.neurons.into()
    }

    fn right_neurons(&self) -> NeuronsDescriptor {
        self.neurons.into()
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

        let x = effective.as_feature_rows();
        let (mean, variance) = self.effective_statistics(x, context);
        if context.is_training() {
            self.update_running(&mean, &variance);
        }

        let mut output = self.normalise(x, &mean, &variance);
        output *= &column(&self.scale);
        output += &column(&self.shift);
        let output =
            NeuronsActivation::new(output, self.neurons, ActivationFormat::RowsSpanFeatureSet)?;

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

    /// Обратная трансформация относительно running-статистик:
    /// `x = ((y − β)/γ)·σ_run + μ_run`.
    fn push_right_to_left(
        &self,
        input: &Rc<NeuronsActivation>,
        _previous_left_to_right: Option<&AxonsActivation>,
        _context: &ExecutionContext,
    ) -> AxonsResult<AxonsActivation> {
        check_feature_count(input, &self.right_neurons(), &self.name, "правая")?;

        let running_mean = self.running_mean();
        let std = self
            .running_variance()
            .mapv(|v| (v + self.epsilon).sqrt());

        let mut output = input.as_feature_rows().to_owned();
        output -= &column(&self.shift);
        output /= &column(&self.scale);
        output *= &column(&std);
        output += &column(&running_mean);
        let output =
            NeuronsActivation::new(output, self.neurons, ActivationFormat::RowsSpanFeatureSet)?;

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
        context: &ExecutionContext,
    ) -> AxonsResult<NeuronsActivation> {
        check_feature_count(outer_gradient, &self.right_neurons(), &self.name, "правая")?;

        let g = outer_gradient.as_feature_rows();
        let x = forward.effective_input().as_feature_rows();
        let (mean, variance) = self.effective_statistics(x, context);
        let inv_std = variance.mapv(|v| 1.0 / (v + self.epsilon).sqrt());

        let mut gradient = if context.is_training() {
            // Полный градиент батч-нормализации:
            // dx = istd/m * (m·dxhat − Σdxhat − xhat·Σ(dxhat⊙xhat))
            let m = outer_gradient.example_count() as f32;
            let xhat = self.normalise(x, &mean, &variance);
            let mut dxhat = g.to_owned();
            dxhat *= &column(&self.scale);

            let sum_dxhat = dxhat.sum_axis(Axis(1));
            let sum_dxhat_xhat = (&dxhat * &xhat).sum_axis(Axis(1));

            let mut dx = dxhat.mapv(|v| v * m);
            dx -= &column(&sum_dxhat);
            dx -= &(&xhat * &column(&sum_dxhat_xhat));
            dx *= &column(&inv_std);
            dx.mapv_inplace(|v| v / m);
            dx
        } else {
            let mut dx = g.to_owned();
            dx *= &column(&self.scale);
            dx *= &column(&inv_std);
            dx
        };

        if let Some(mask) = forward.dropout_mask() {
            gradient *= mask;
        }
        Ok(NeuronsActivation::new(
            gradient,
            self.neurons,
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
        let (mean, variance) = self.effective_statistics(x, context);
        let xhat = self.normalise(x, &mean, &variance);

        let scale_gradient = (&g.to_owned() * &xhat).sum_axis(Axis(1));
        let shift_gradient = g.sum_axis(Axis(1));

        Ok(AxonsGradient::new(
            self.name.clone(),
            scale_gradient.insert_axis(Axis(1)),
            Some(shift_gradient),
            None,
            outer_gradient.example_count(),
        ))
    }
}

impl TrainableAxons for BatchNormAxons {
    fn adjust_connection_weights(
        &mut self,
        delta: &Array2<f32>,
        direction: AdjustmentDirection,
    ) -> AxonsResult<()> {
        if delta.dim() != (self.scale.len(), 1) {
            return Err(AxonsError::ShapeMismatch(format!(
                "BatchNormAxons '{}': дельта масштаба {:?} не совпадает с ({}, 1)",
                self.name,
                delta.dim(),
                self.scale.len()
            )));
        }
        self.scale
            .scaled_add(direction.signum(), &delta.column(0).to_owned());
        Ok(())
    }

    fn adjust_biases(
        &mut self,
        delta: &Array1<f32>,
        direction: AdjustmentDirection,
    ) -> AxonsResult<()> {
        if delta.len() != self.shift.len() {
            return Err(AxonsError::ShapeMismatch(format!(
                "BatchNormAxons '{}': дельта сдвига длины {} не совпадает с {}",
                self.name,
                delta.len(),
                self.shift.len()
            )));
        }
        self.shift.scaled_add(direction.signum(), delta);
        Ok(())
    }

    fn detached_weights(&self) -> Array2<f32> {
        self.scale.clone().insert_axis(Axis(1))
    }

    fn detached_biases(&self) -> Option<Array1<f32>> {
        Some(self.shift.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn activation(data: Array2<f32>, count: usize) -> Rc<NeuronsActivation> {
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
    fn test_scale_shift_round_trip_reconstructs_input() {
        let axons = ScaleAndShiftAxons::with_parameters(
            "ss1",
            Neurons::new(2, true),
            array![2.0, 4.0],
            array![1.0, -1.0],
        )
        .unwrap();
        let ctx = ExecutionContext::inference();
        let x = activation(array![[1.0, 2.0], [3.0, 4.0]], 2);

        let forward = axons.push_left_to_right(&x, None, &ctx).unwrap();
        assert_eq!(
            forward.output().data().clone(),
            array![[3.0, 5.0], [11.0, 15.0]]
        );

        let back = axons
            .push_right_to_left(forward.output(), Some(&forward), &ctx)
            .unwrap();
        for (&a, &b) in back.output().data().iter().zip(x.data().iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_scale_shift_gradients() {
        let axons = ScaleAndShiftAxons::with_parameters(
            "ss1",
            Neurons::new(2, true),
            array![2.0, 4.0],
            array![0.0, 0.0],
        )
        .unwrap();
        let ctx = ExecutionContext::training();
        let x = activation(array![[1.0, 2.0], [3.0, 4.0]], 2);
        let forward = axons.push_left_to_right(&x, None, &ctx).unwrap();

        let g = NeuronsActivation::new(
            array![[1.0, 1.0], [1.0, 1.0]],
            Neurons::new(2, false),
            ActivationFormat::RowsSpanFeatureSet,
        )
        .unwrap();

        // Градиент по входу: g·γ.
        let dx = axons.propagated_gradient(&g, &forward, &ctx).unwrap();
        assert_eq!(dx.data().clone(), array![[2.0, 2.0], [4.0, 4.0]]);

        // dγ = Σ g⊙x, dβ = Σ g.
        let gradient = axons.calculate_gradient(&forward, &g, &ctx).unwrap();
        assert_eq!(gradient.weights_gradient().clone(), array![[3.0], [7.0]]);
        assert_eq!(
            gradient.left_to_right_bias_gradient().unwrap().clone(),
            array![2.0, 2.0]
        );
    }

    #[test]
    fn test_batchnorm_training_normalises_batch() {
        let axons = BatchNormAxons::new("bn1", Neurons::new(1, true));
        let ctx = ExecutionContext::training();
        let x = activation(array![[1.0, 2.0, 3.0, 4.0]], 1);

        let forward = axons.push_left_to_right(&x, None, &ctx).unwrap();
        let out = forward.output().data().clone();
        let mean: f32 = out.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        // Дисперсия нормализованного выхода близка к 1.
        let var: f32 = out.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_batchnorm_updates_running_statistics() {
        let axons = BatchNormAxons::new("bn1", Neurons::new(1, true)).with_momentum(0.5);
        let ctx = ExecutionContext::training();
        let x = activation(array![[1.0, 2.0, 3.0, 4.0]], 1);

        axons.push_left_to_right(&x, None, &ctx).unwrap();
        // batch_mean = 2.5, r = 0.5·0 + 0.5·2.5
        assert!((axons.running_mean()[0] - 1.25).abs() < 1e-6);
        // batch_var = 1.25, r = 0.5·1 + 0.5·1.25
        assert!((axons.running_variance()[0] - 1.125).abs() < 1e-6);
    }

    #[test]
    fn test_batchnorm_inference_uses_running_statistics() {
        let axons = BatchNormAxons::new("bn1", Neurons::new(1, true));
        let ctx = ExecutionContext::inference();
        let x = activation(array![[3.0, 5.0]], 1);

        // running mean=0, var=1: выход (x − 0)/√(1+ε) ≈ x.
        let forward = axons.push_left_to_right(&x, None, &ctx).unwrap();
        let out = forward.output().data().clone();
        assert!((out[[0, 0]] - 3.0).abs() < 1e-3);
        assert!((out[[0, 1]] - 5.0).abs() < 1e-3);
    }
}
