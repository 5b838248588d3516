//! Модуль, определяющий `NeuronsActivation` - единицу данных, протекающую
//! через граф компонентов.
//!
//! Активация - это один плотный 2-D буфер `f32` плюс метаданные:
//! ориентация (какая ось соответствует признакам), дескриптор нейронов и
//! флаг заморозки. Буфер создаётся компонентом как результат трансформации
//! и принадлежит ему единолично, пока не будет потреблён следующим узлом
//! или не разойдётся веером по ветвям.
//!
//! Модель владения: прямой проход производит уникально-владеемый буфер;
//! fan-out явно превращает уникальное владение в разделяемое read-only
//! (`freeze()` + `Rc`). Освобождение буфера происходит автоматически при
//! выходе из владеющей области (`Drop`) - ручной операции `release` нет.

use crate::neurons::NeuronsDescriptor;
use ndarray::{Array2, ArrayView2};
use std::cell::Cell;
use std::rc::Rc;
use thiserror::Error;

pub type ActivationResult<T> = std::result::Result<T, ActivationError>;

/// Ошибки уровня буфера активации.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActivationError {
    #[error("Несовпадение формы: буфер несёт {actual} признаков по оси признаков, а дескриптор нейронов объявляет {expected}")]
    FeatureCountMismatch { expected: usize, actual: usize },

    #[error("Несовпадение формы: {0}")]
    IncompatibleShapes(String),

    #[error("Активация заморожена (разделяемая, read-only); мутация на месте запрещена")]
    FrozenActivation,
}

/// Какая ось буфера соответствует множеству признаков.
///
/// Ориентация фиксируется при создании и не меняется за время жизни буфера.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationFormat {
    /// Строки - признаки, столбцы - примеры.
    RowsSpanFeatureSet,
    /// Столбцы - признаки, строки - примеры.
    ColumnsSpanFeatureSet,
}

/// Батч векторов активации (или карт признаков) плюс метаданные формы.
#[derive(Debug, Clone)]
pub struct NeuronsActivation {
    data: Array2<f32>,
    format: ActivationFormat,
    neurons: NeuronsDescriptor,
    // Cell, а не bool: fan-out замораживает буфер, уже разделяемый через Rc.
    immutable: Cell<bool>,
}

impl NeuronsActivation {
    /// Создаёт активацию, проверяя инвариант: длина оси признаков буфера
    /// обязана совпадать с количеством нейронов дескриптора (без bias).
    pub fn new(
        data: Array2<f32>,
        neurons: impl Into<NeuronsDescriptor>,
        format: ActivationFormat,
    ) -> ActivationResult<Self> {
        let neurons = neurons.into();
        let feature_axis_len = match format {
            ActivationFormat::RowsSpanFeatureSet => data.nrows(),
            ActivationFormat::ColumnsSpanFeatureSet => data.ncols(),
        };
        if feature_axis_len != neurons.neuron_count() {
            return Err(ActivationError::FeatureCountMismatch {
                expected: neurons.neuron_count(),
                actual: feature_axis_len,
            });
        }
        Ok(Self {
            data,
            format,
            neurons,
            immutable: Cell::new(false),
        })
    }

    pub fn format(&self) -> ActivationFormat {
        self.format
    }

    pub fn neurons(&self) -> &NeuronsDescriptor {
        &self.neurons
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    /// Количество признаков, выведенное из ориентации и формы буфера.
    pub fn feature_count(&self) -> usize {
        match self.format {
            ActivationFormat::RowsSpanFeatureSet => self.data.nrows(),
            ActivationFormat::ColumnsSpanFeatureSet => self.data.ncols(),
        }
    }

    /// Количество примеров в батче.
    pub fn example_count(&self) -> usize {
        match self.format {
            ActivationFormat::RowsSpanFeatureSet => self.data.ncols(),
            ActivationFormat::ColumnsSpanFeatureSet => self.data.nrows(),
        }
    }

    /// Вид буфера, в котором строки - это всегда признаки.
    ///
    /// Для `ColumnsSpanFeatureSet` возвращается транспонированный вид без
    /// копирования.
    pub fn as_feature_rows(&self) -> ArrayView2<'_, f32> {
        match self.format {
            ActivationFormat::RowsSpanFeatureSet => self.data.view(),
            ActivationFormat::ColumnsSpanFeatureSet => self.data.t(),
        }
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable.get()
    }

    /// Помечает буфер как разделяемый read-only. После этого любая попытка
    /// мутации на месте завершается `FrozenActivation`.
    pub fn freeze(&self) {
        self.immutable.set(true);
    }

    /// Замораживает и оборачивает в `Rc` - форма, в которой активация
    /// раздаётся нескольким ветвям.
    pub fn into_shared(self) -> Rc<NeuronsActivation> {
        self.freeze();
        Rc::new(self)
    }

    /// Приватная мутабельная копия. Ветвь, которой нужно мутировать
    /// разделяемую активацию, обязана работать на дубликате.
    pub fn duplicate(&self) -> NeuronsActivation {
        NeuronsActivation {
            data: self.data.clone(),
            format: self.format,
            neurons: self.neurons,
            immutable: Cell::new(false),
        }
    }

    fn check_mutable(&self) -> ActivationResult<()> {
        if self.immutable.get() {
            Err(ActivationError::FrozenActivation)
        } else {
            Ok(())
        }
    }

    fn check_same_shape(&self, other: &NeuronsActivation) -> ActivationResult<()> {
        if self.feature_count() != other.feature_count()
            || self.example_count() != other.example_count()
        {
            return Err(ActivationError::IncompatibleShapes(format!(
                "({} призн. x {} прим.) против ({} призн. x {} прим.)",
                self.feature_count(),
                self.example_count(),
                other.feature_count(),
                other.example_count()
            )));
        }
        Ok(())
    }

    /// Поэлементное сложение на месте.
    pub fn add_inline(&mut self, other: &NeuronsActivation) -> ActivationResult<()> {
        self.check_mutable()?;
        self.check_same_shape(other)?;
        self.data += &other.as_oriented_like(self.format);
        Ok(())
    }

    /// Умножение на скаляр на месте.
    pub fn scale_inline(&mut self, factor: f32) -> ActivationResult<()> {
        self.check_mutable()?;
        self.data.mapv_inplace(|v| v * factor);
        Ok(())
    }

    /// Поэлементное умножение на месте.
    pub fn multiply_inline(&mut self, other: &NeuronsActivation) -> ActivationResult<()> {
        self.check_mutable()?;
        self.check_same_shape(other)?;
        self.data *= &other.as_oriented_like(self.format);
        Ok(())
    }

    /// Новая активация с той же ориентацией и дескриптором, но другим буфером.
    pub fn with_data(&self, data: Array2<f32>) -> ActivationResult<NeuronsActivation> {
        NeuronsActivation::new(data, self.neurons, self.format)
    }

    fn as_oriented_like(&self, format: ActivationFormat) -> Array2<f32> {
        if self.format == format {
            self.data.clone()
        } else {
            self.data.t().to_owned()
        }
    }
}
