//! Развилки графа: one-to-many (веер) и many-to-one (слияние).
//!
//! One-to-many раздаёт *ту же самую* активацию N ветвям без копирования,
//! предварительно заморозив её: одновременные мутации на месте из разных
//! ветвей над общей памятью испортили бы соседей. Many-to-one сливает N
//! активаций по стратегии комбинирования, выбранной при конструировании.

use crate::activation::{ActivationFormat, NeuronsActivation};
use crate::components::{ComponentError, ComponentResult};
use crate::neurons::{Neurons3D, NeuronsDescriptor};
use ndarray::Axis;
use std::rc::Rc;

/// Стратегия слияния many-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinationStrategy {
    /// Поэлементная сумма; требует идентичных форм всех ветвей.
    Addition,
    /// Конкатенация по оси каналов; требует пространственных активаций
    /// с одинаковыми шириной и высотой.
    FilterConcat,
}

/// Веер: принимает одну активацию и раздаёт её N путям.
pub struct OneToManyDirectedComponent {
    paths: usize,
}

impl OneToManyDirectedComponent {
    pub fn new(paths: usize) -> ComponentResult<Self> {
        if paths == 0 {
            return Err(ComponentError::IllegalState(
                "one-to-many без путей недопустим".to_string(),
            ));
        }
        Ok(Self { paths })
    }

    pub fn paths(&self) -> usize {
        self.paths
    }

    /// Замораживает вход и раздаёт его как разделяемый read-only снимок.
    pub fn forward(&self, input: Rc<NeuronsActivation>) -> OneToManyActivation {
        input.freeze();
        OneToManyActivation {
            shared: input,
            paths: self.paths,
        }
    }
}

/// Запись прямого прохода через веер.
pub struct OneToManyActivation {
    shared: Rc<NeuronsActivation>,
    paths: usize,
}

impl OneToManyActivation {
    /// Активация, выдаваемая пути `index` - тот же буфер, без копии.
    pub fn path_activation(&self, index: usize) -> ComponentResult<Rc<NeuronsActivation>> {
        if index >= self.paths {
            return Err(ComponentError::IllegalState(format!(
                "путь {} вне диапазона: веер раздаёт {} путей",
                index, self.paths
            )));
        }
        Ok(Rc::clone(&self.shared))
    }

    pub fn paths(&self) -> usize {
        self.paths
    }

    /// Обратный проход: N градиентов ветвей сворачиваются в один
    /// комбинированный градиент - их поэлементную сумму.
    pub fn back_propagate(
        &self,
        gradients: Vec<NeuronsActivation>,
    ) -> ComponentResult<NeuronsActivation> {
        if gradients.len() != self.paths {
            return Err(ComponentError::IllegalState(format!(
                "веер ждёт {} градиентов ветвей, получил {}",
                self.paths,
                gradients.len()
            )));
        }
        let mut combined = gradients[0].as_feature_rows().to_owned();
        for gradient in &gradients[1..] {
            if gradient.feature_count() != gradients[0].feature_count()
                || gradient.example_count() != gradients[0].example_count()
            {
                return Err(ComponentError::ShapeMismatch(format!(
                    "градиент ветви ({} x {}) против ({} x {})",
                    gradient.feature_count(),
                    gradient.example_count(),
                    gradients[0].feature_count(),
                    gradients[0].example_count()
                )));
            }
            combined += &gradient.as_feature_rows();
        }
        Ok(NeuronsActivation::new(
            combined,
            *self.shared.neurons(),
            ActivationFormat::RowsSpanFeatureSet,
        )?)
    }
}

/// Слияние: принимает N активаций и сливает их по стратегии.
pub struct ManyToOneDirectedComponent {
    strategy: CombinationStrategy,
}

impl ManyToOneDirectedComponent {
    pub fn new(strategy: CombinationStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> CombinationStrategy {
        self.strategy
    }

    pub fn forward(
        &self,
        inputs: Vec<Rc<NeuronsActivation>>,
    ) -> ComponentResult<ManyToOneActivation> {
        if inputs.len() < 2 {
            return Err(ComponentError::IllegalState(format!(
                "many-to-one сливает минимум две ветви, получил {}",
                inputs.len()
            )));
        }
        match self.strategy {
            CombinationStrategy::Addition => self.combine_addition(inputs),
            CombinationStrategy::FilterConcat => self.combine_filter_concat(inputs),
        }
    }

    fn combine_addition(
        &self,
        inputs: Vec<Rc<NeuronsActivation>>,
    ) -> ComponentResult<ManyToOneActivation> {
        let first = &inputs[0];
        let mut combined = first.as_feature_rows().to_owned();
        for input in &inputs[1..] {
            if input.feature_count() != first.feature_count()
                || input.example_count() != first.example_count()
            {
                return Err(ComponentError::ShapeMismatch(format!(
                    "ADDITION требует идентичных форм: ({} x {}) против ({} x {})",
                    input.feature_count(),
                    input.example_count(),
                    first.feature_count(),
                    first.example_count()
                )));
            }
            combined += &input.as_feature_rows();
        }
        let output = NeuronsActivation::new(
            combined,
            *first.neurons(),
            ActivationFormat::RowsSpanFeatureSet,
        )?;
        Ok(ManyToOneActivation {
            strategy: self.strategy,
            output: output.into_shared(),
            boundaries: None,
            branch_descriptors: inputs.iter().map(|i| *i.neurons()).collect(),
        })
    }

    fn combine_filter_concat(
        &self,
        inputs: Vec<Rc<NeuronsActivation>>,
    ) -> ComponentResult<ManyToOneActivation> {
        // Решение открытого вопроса исходного дизайна: конкатенация
        // непространственных активаций не поддерживается.
        let mut spatials = Vec::with_capacity(inputs.len());
        for input in &inputs {
            match input.neurons().spatial() {
                Some(s) => spatials.push(*s),
                None => {
                    return Err(ComponentError::UnsupportedOperation(
                        "FILTER_CONCAT поддерживает только пространственные (Neurons3D) активации"
                            .to_string(),
                    ))
                }
            }
        }

        let first = spatials[0];
        let examples = inputs[0].example_count();
        for (input, shape) in inputs.iter().zip(&spatials) {
            if shape.width != first.width || shape.height != first.height {
                return Err(ComponentError::ShapeMismatch(format!(
                    "FILTER_CONCAT требует одинаковых ширины и высоты: {}x{} против {}x{}",
                    shape.width, shape.height, first.width, first.height
                )));
            }
            if input.example_count() != examples {
                return Err(ComponentError::ShapeMismatch(format!(
                    "FILTER_CONCAT: батчи разного размера ({} против {})",
                    input.example_count(),
                    examples
                )));
            }
        }

        // Граница ветви i - суммарное число признаков, на котором её вклад
        // заканчивается внутри слитого буфера.
        let mut boundaries = Vec::with_capacity(inputs.len());
        let mut offset = 0;
        for shape in &spatials {
            offset += shape.neuron_count();
            boundaries.push(offset);
        }

        let views: Vec<_> = inputs.iter().map(|i| i.as_feature_rows()).collect();
        let combined = ndarray::concatenate(Axis(0), &views)
            .map_err(|e| ComponentError::ShapeMismatch(e.to_string()))?;

        let total_depth = spatials.iter().map(|s| s.depth).sum();
        let output = NeuronsActivation::new(
            combined,
            Neurons3D::new(first.width, first.height, total_depth, first.has_bias_unit),
            ActivationFormat::RowsSpanFeatureSet,
        )?;
        Ok(ManyToOneActivation {
            strategy: self.strategy,
            output: output.into_shared(),
            boundaries: Some(boundaries),
            branch_descriptors: inputs.iter().map(|i| *i.neurons()).collect(),
        })
    }
}

/// Запись прямого прохода через слияние.
pub struct ManyToOneActivation {
    strategy: CombinationStrategy,
    output: Rc<NeuronsActivation>,
    boundaries: Option<Vec<usize>>,
    branch_descriptors: Vec<NeuronsDescriptor>,
}

impl ManyToOneActivation {
    /// Слитая активация (заморожена).
    pub fn output(&self) -> Rc<NeuronsActivation> {
        Rc::clone(&self.output)
    }

    /// Границы ветвей внутри слитого буфера (только FILTER_CONCAT).
    pub fn boundaries(&self) -> Option<&[usize]> {
        self.boundaries.as_deref()
    }

    /// Обратный проход: маршрутизирует градиент слитого буфера обратно
    /// по ветвям.
    pub fn back_propagate(
        &self,
        gradient: &NeuronsActivation,
    ) -> ComponentResult<Vec<NeuronsActivation>> {
        if gradient.feature_count() != self.output.feature_count()
            || gradient.example_count() != self.output.example_count()
        {
            return Err(ComponentError::ShapeMismatch(format!(
                "градиент ({} x {}) против слитого выхода ({} x {})",
                gradient.feature_count(),
                gradient.example_count(),
                self.output.feature_count(),
                self.output.example_count()
            )));
        }
        match self.strategy {
            CombinationStrategy::Addition => {
                // Градиент суммы по каждому слагаемому - тождество: каждая
                // ветвь получает внешний градиент без изменений.
                self.branch_descriptors
                    .iter()
                    .map(|descriptor| {
                        Ok(NeuronsActivation::new(
                            gradient.as_feature_rows().to_owned(),
                            *descriptor,
                            ActivationFormat::RowsSpanFeatureSet,
                        )?)
                    })
                    .collect()
            }
            CombinationStrategy::FilterConcat => {
                let boundaries = self
                    .boundaries
                    .as_ref()
                    .expect("FILTER_CONCAT always records boundaries");
                let features = gradient.as_feature_rows();
                let mut start = 0;
                boundaries
                    .iter()
                    .zip(&self.branch_descriptors)
                    .map(|(&end, descriptor)| {
                        let slice = features.slice(ndarray::s![start..end, ..]).to_owned();
                        start = end;
                        Ok(NeuronsActivation::new(
                            slice,
                            *descriptor,
                            ActivationFormat::RowsSpanFeatureSet,
                        )?)
                    })
                    .collect()
            }
        }
    }
}
