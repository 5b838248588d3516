//! Функции активации: поэлементные (и softmax) нелинейности с парным
//! градиентным правилом.
//!
//! `activate` вычисляет выход; `activation_gradient` - поэлементный
//! обратный множитель, вычисляемый по *выходной* активации. У softmax
//! автономного градиента нет: вне канонической пары с кросс-энтропией
//! вызов завершается ошибкой неподдерживаемой операции.

use crate::activation::{ActivationError, NeuronsActivation};
use crate::context::ExecutionContext;
use ndarray::Axis;
use thiserror::Error;

pub type ActivationFunctionResult<T> = std::result::Result<T, ActivationFunctionError>;

#[derive(Error, Debug)]
pub enum ActivationFunctionError {
    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error("Операция не поддерживается: {0}")]
    Unsupported(String),
}

/// Вид функции активации - используется для проверки канонических пар
/// с функциями стоимости.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationFunctionType {
    Linear,
    Relu,
    Sigmoid,
    Softmax,
}

/// Контракт функции активации.
pub trait ActivationFunction {
    fn function_type(&self) -> ActivationFunctionType;

    /// Прямой проход: применяет нелинейность к входу.
    fn activate(
        &self,
        input: &NeuronsActivation,
        context: &ExecutionContext,
    ) -> ActivationFunctionResult<NeuronsActivation>;

    /// Поэлементный множитель обратного прохода, восстановленный из
    /// выходной активации.
    fn activation_gradient(
        &self,
        output: &NeuronsActivation,
        context: &ExecutionContext,
    ) -> ActivationFunctionResult<NeuronsActivation>;
}

/// Тождественная активация.
pub struct LinearActivationFunction;

impl ActivationFunction for LinearActivationFunction {
    fn function_type(&self) -> ActivationFunctionType {
        ActivationFunctionType::Linear
    }

    fn activate(
        &self,
        input: &NeuronsActivation,
        _context: &ExecutionContext,
    ) -> ActivationFunctionResult<NeuronsActivation> {
        Ok(input.with_data(input.data().clone())?)
    }

    fn activation_gradient(
        &self,
        output: &NeuronsActivation,
        _context: &ExecutionContext,
    ) -> ActivationFunctionResult<NeuronsActivation> {
        Ok(output.with_data(output.data().mapv(|_| 1.0))?)
    }
}

/// ReLU: `max(0, x)`.
///
/// Градиент в точке ровно 0 равен 0 - осознанный выбор границы, а не
/// предел.
pub struct ReluActivationFunction;

impl ActivationFunction for ReluActivationFunction {
    fn function_type(&self) -> ActivationFunctionType {
        ActivationFunctionType::Relu
    }

    fn activate(
        &self,
        input: &NeuronsActivation,
        _context: &ExecutionContext,
    ) -> ActivationFunctionResult<NeuronsActivation> {
        Ok(input.with_data(input.data().mapv(|v| v.max(0.0)))?)
    }

    fn activation_gradient(
        &self,
        output: &NeuronsActivation,
        _context: &ExecutionContext,
    ) -> ActivationFunctionResult<NeuronsActivation> {
        // Выход ReLU положителен ровно там, где положителен вход;
        // в нуле множитель равен 0.
        Ok(output.with_data(output.data().mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }))?)
    }
}

/// Сигмоида: `1 / (1 + e^{-x})`.
pub struct SigmoidActivationFunction;

impl ActivationFunction for SigmoidActivationFunction {
    fn function_type(&self) -> ActivationFunctionType {
        ActivationFunctionType::Sigmoid
    }

    fn activate(
        &self,
        input: &NeuronsActivation,
        _context: &ExecutionContext,
    ) -> ActivationFunctionResult<NeuronsActivation> {
        Ok(input.with_data(input.data().mapv(|x| 1.0 / (1.0 + (-x).exp())))?)
    }

    fn activation_gradient(
        &self,
        output: &NeuronsActivation,
        _context: &ExecutionContext,
    ) -> ActivationFunctionResult<NeuronsActivation> {
        // σ'(x) = y(1 − y)
        Ok(output.with_data(output.data().mapv(|y| y * (1.0 - y)))?)
    }
}

/// Softmax по множеству признаков каждого примера, со стабилизацией
/// вычитанием максимума.
pub struct SoftmaxActivationFunction;

impl ActivationFunction for SoftmaxActivationFunction {
    fn function_type(&self) -> ActivationFunctionType {
        ActivationFunctionType::Softmax
    }

    fn activate(
        &self,
        input: &NeuronsActivation,
        _context: &ExecutionContext,
    ) -> ActivationFunctionResult<NeuronsActivation> {
        let mut result = input.as_feature_rows().to_owned();
        result.axis_iter_mut(Axis(1)).for_each(|mut example| {
            let max_val = example.iter().fold(f32::NEG_INFINITY, |max, &v| max.max(v));
            example.mapv_inplace(|v| (v - max_val).exp());
            let sum = example.sum();
            example.mapv_inplace(|v| v / sum);
        });
        Ok(NeuronsActivation::new(
            result,
            *input.neurons(),
            crate::activation::ActivationFormat::RowsSpanFeatureSet,
        )?)
    }

    fn activation_gradient(
        &self,
        _output: &NeuronsActivation,
        _context: &ExecutionContext,
    ) -> ActivationFunctionResult<NeuronsActivation> {
        Err(ActivationFunctionError::Unsupported(
            "Softmax не имеет автономного градиента: используйте каноническую пару с multiclass cross-entropy".to_string(),
        ))
    }
}
