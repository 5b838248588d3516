//! Аксоны: двунаправленные параметрические трансформации между двумя
//! наборами нейронов.
//!
//! Каждый вариант аксонов реализует пару push-операций:
//! `push_left_to_right` (прямой проход) и симметричную
//! `push_right_to_left` (обратная трансформация - для полносвязных аксонов
//! это `Wᵀ·y + b`, для scale-and-shift точная инверсия `(y − β)/γ`).
//! Push - чистая функция своих входов и обучаемого состояния аксонов;
//! входную активацию он никогда не мутирует.
//!
//! Градиентное правило каждого варианта написано вручную
//! (`propagated_gradient` / `calculate_gradient`) - автоматического
//! дифференцирования в этом движке нет.

use crate::activation::{ActivationError, NeuronsActivation};
use crate::context::ExecutionContext;
use crate::neurons::NeuronsDescriptor;
use ndarray::{Array1, Array2};
use rand::Rng;
use std::rc::Rc;
use thiserror::Error;

pub mod conv;
pub mod fully_connected;
pub mod im2col;
pub mod pooling;
pub mod scale_shift;

pub use conv::{ConvolutionConfig, ConvolutionalAxons};
pub use fully_connected::FullyConnectedAxons;
pub use pooling::{AveragePoolingAxons, MaxPoolingAxons, PoolingConfig};
pub use scale_shift::{BatchNormAxons, ScaleAndShiftAxons};

pub type AxonsResult<T> = std::result::Result<T, AxonsError>;

/// Ошибки уровня аксонов.
#[derive(Error, Debug)]
pub enum AxonsError {
    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error("Несовпадение формы: {0}")]
    ShapeMismatch(String),

    #[error("Недопустимое состояние: {0}")]
    IllegalState(String),

    #[error("Операция не поддерживается: {0}")]
    UnsupportedOperation(String),
}

/// Направление корректировки параметров: всегда знаковое накопление,
/// никогда не сырое присваивание.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentDirection {
    Addition,
    Subtraction,
}

impl AdjustmentDirection {
    pub fn signum(&self) -> f32 {
        match self {
            AdjustmentDirection::Addition => 1.0,
            AdjustmentDirection::Subtraction => -1.0,
        }
    }
}

/// Запись одного push-а через аксоны.
///
/// Хранит вход до и после dropout-а, выход и дескрипторы нейронов с обеих
/// сторон - всё, что нужно парному обратному push-у для восстановления
/// локальных производных.
#[derive(Debug, Clone)]
pub struct AxonsActivation {
    input: Rc<NeuronsActivation>,
    dropped_input: Option<Rc<NeuronsActivation>>,
    dropout_mask: Option<Array2<f32>>,
    output: Rc<NeuronsActivation>,
    left_neurons: NeuronsDescriptor,
    right_neurons: NeuronsDescriptor,
}

impl AxonsActivation {
    pub fn new(
        input: Rc<NeuronsActivation>,
        output: NeuronsActivation,
        left_neurons: NeuronsDescriptor,
        right_neurons: NeuronsDescriptor,
    ) -> Self {
        Self {
            input,
            dropped_input: None,
            dropout_mask: None,
            output: Rc::new(output),
            left_neurons,
            right_neurons,
        }
    }

    pub fn with_dropout(
        input: Rc<NeuronsActivation>,
        dropped_input: Rc<NeuronsActivation>,
        dropout_mask: Array2<f32>,
        output: NeuronsActivation,
        left_neurons: NeuronsDescriptor,
        right_neurons: NeuronsDescriptor,
    ) -> Self {
        Self {
            input,
            dropped_input: Some(dropped_input),
            dropout_mask: Some(dropout_mask),
            output: Rc::new(output),
            left_neurons,
            right_neurons,
        }
    }

    /// Вход до dropout-а.
    pub fn input(&self) -> &Rc<NeuronsActivation> {
        &self.input
    }

    /// Вход, который реально участвовал в трансформации
    /// (после dropout-а, если он применялся).
    pub fn effective_input(&self) -> &Rc<NeuronsActivation> {
        self.dropped_input.as_ref().unwrap_or(&self.input)
    }

    /// Маска dropout-а (строки - признаки), если она применялась.
    pub fn dropout_mask(&self) -> Option<&Array2<f32>> {
        self.dropout_mask.as_ref()
    }

    pub fn output(&self) -> &Rc<NeuronsActivation> {
        &self.output
    }

    pub fn left_neurons(&self) -> &NeuronsDescriptor {
        &self.left_neurons
    }

    pub fn right_neurons(&self) -> &NeuronsDescriptor {
        &self.right_neurons
    }
}

/// Накопленный градиент одного экземпляра аксонов: градиент весов плюс
/// опциональные градиенты смещений в обе стороны.
#[derive(Debug, Clone)]
pub struct AxonsGradient {
    axons_name: String,
    weights_gradient: Array2<f32>,
    left_to_right_bias_gradient: Option<Array1<f32>>,
    right_to_left_bias_gradient: Option<Array1<f32>>,
    example_count: usize,
}

impl AxonsGradient {
    pub fn new(
        axons_name: impl Into<String>,
        weights_gradient: Array2<f32>,
        left_to_right_bias_gradient: Option<Array1<f32>>,
        right_to_left_bias_gradient: Option<Array1<f32>>,
        example_count: usize,
    ) -> Self {
        Self {
            axons_name: axons_name.into(),
            weights_gradient,
            left_to_right_bias_gradient,
            right_to_left_bias_gradient,
            example_count,
        }
    }

    /// Имя аксонов, которым принадлежит этот градиент.
    pub fn axons_name(&self) -> &str {
        &self.axons_name
    }

    pub fn weights_gradient(&self) -> &Array2<f32> {
        &self.weights_gradient
    }

    pub fn left_to_right_bias_gradient(&self) -> Option<&Array1<f32>> {
        self.left_to_right_bias_gradient.as_ref()
    }

    pub fn right_to_left_bias_gradient(&self) -> Option<&Array1<f32>> {
        self.right_to_left_bias_gradient.as_ref()
    }

    pub fn example_count(&self) -> usize {
        self.example_count
    }

    /// Средний градиент: суммарный, делённый на количество примеров батча.
    pub fn averaged(&self) -> AxonsGradient {
        let m = self.example_count.max(1) as f32;
        AxonsGradient {
            axons_name: self.axons_name.clone(),
            weights_gradient: self.weights_gradient.mapv(|v| v / m),
            left_to_right_bias_gradient: self
                .left_to_right_bias_gradient
                .as_ref()
                .map(|b| b.mapv(|v| v / m)),
            right_to_left_bias_gradient: self
                .right_to_left_bias_gradient
                .as_ref()
                .map(|b| b.mapv(|v| v / m)),
            example_count: 1,
        }
    }
}

/// Контракт аксонов: пара push-операций плюс ручное градиентное правило.
pub trait Axons {
    fn name(&self) -> &str;

    fn left_neurons(&self) -> NeuronsDescriptor;

    fn right_neurons(&self) -> NeuronsDescriptor;

    /// Прямой push: вход слева, результат справа.
    ///
    /// `previous_right_to_left` - запись предыдущего обратного push-а,
    /// если вариант аксонов в ней нуждается.
    fn push_left_to_right(
        &self,
        input: &Rc<NeuronsActivation>,
        previous_right_to_left: Option<&AxonsActivation>,
        context: &ExecutionContext,
    ) -> AxonsResult<AxonsActivation>;

    /// Обратный push: вход справа, результат слева.
    ///
    /// Для вариантов, которым нужна запись прямого прохода (max-pooling),
    /// вызов без неё - ошибка недопустимого состояния.
    fn push_right_to_left(
        &self,
        input: &Rc<NeuronsActivation>,
        previous_left_to_right: Option<&AxonsActivation>,
        context: &ExecutionContext,
    ) -> AxonsResult<AxonsActivation>;

    /// Градиент по входу левой стороны для данного внешнего градиента.
    fn propagated_gradient(
        &self,
        outer_gradient: &NeuronsActivation,
        forward: &AxonsActivation,
        context: &ExecutionContext,
    ) -> AxonsResult<NeuronsActivation>;

    /// Обучаемы ли эти аксоны в данном контексте.
    fn is_trainable(&self, _context: &ExecutionContext) -> bool {
        false
    }

    /// Градиент обучаемых параметров. Для необучаемых вариантов -
    /// неподдерживаемая операция.
    fn calculate_gradient(
        &self,
        _forward: &AxonsActivation,
        _outer_gradient: &NeuronsActivation,
        _context: &ExecutionContext,
    ) -> AxonsResult<AxonsGradient> {
        Err(AxonsError::UnsupportedOperation(format!(
            "Аксоны '{}' не имеют обучаемых параметров",
            self.name()
        )))
    }
}

/// Дополнительный контракт обучаемых аксонов: знаковая корректировка
/// параметров и read-only снимки текущих значений.
pub trait TrainableAxons: Axons {
    fn adjust_connection_weights(
        &mut self,
        delta: &Array2<f32>,
        direction: AdjustmentDirection,
    ) -> AxonsResult<()>;

    fn adjust_biases(
        &mut self,
        delta: &Array1<f32>,
        direction: AdjustmentDirection,
    ) -> AxonsResult<()>;

    /// Read-only снимок текущих весов.
    fn detached_weights(&self) -> Array2<f32>;

    /// Read-only снимок текущих смещений, если они есть.
    fn detached_biases(&self) -> Option<Array1<f32>>;
}

/// Проверка количества признаков активации против дескриптора стороны.
pub(crate) fn check_feature_count(
    activation: &NeuronsActivation,
    expected: &NeuronsDescriptor,
    axons_name: &str,
    side: &str,
) -> AxonsResult<()> {
    if activation.feature_count() != expected.neuron_count() {
        return Err(AxonsError::ShapeMismatch(format!(
            "Аксоны '{}': активация несёт {} признаков, а {} сторона объявляет {}",
            axons_name,
            activation.feature_count(),
            side,
            expected.neuron_count()
        )));
    }
    Ok(())
}

/// Применяет inverted dropout к входной активации, если контекст этого
/// требует: каждый элемент сохраняется с вероятностью `keep` и
/// масштабируется на `1/keep`, остальные обнуляются.
///
/// Возвращает `None`, когда dropout в этом контексте выключен.
pub(crate) fn apply_input_dropout(
    input: &NeuronsActivation,
    context: &ExecutionContext,
) -> AxonsResult<Option<(NeuronsActivation, Array2<f32>)>> {
    if !context.dropout_enabled() {
        return Ok(None);
    }
    let keep = context.input_dropout_keep_probability();
    let mut rng = rand::thread_rng();
    let features = input.as_feature_rows();
    let mask = Array2::from_shape_fn(features.dim(), |_| {
        if rng.gen::<f32>() < keep {
            1.0 / keep
        } else {
            0.0
        }
    });
    let dropped = NeuronsActivation::new(
        &features.to_owned() * &mask,
        *input.neurons(),
        crate::activation::ActivationFormat::RowsSpanFeatureSet,
    )?;
    Ok(Some((dropped, mask)))
}
