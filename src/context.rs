//! Контекст выполнения, передаваемый явным аргументом в каждый вызов
//! прямого и обратного прохода.
//!
//! Исходный дизайн этой системы опирался на thread-local состояние
//! (фабрика матриц + флаг режима обучения). Здесь контекст - обычное
//! значение: ни один фоновый поток не может захватить его неявно, и каждый
//! вложенный вызов получает его от вызывающего.

/// Режим выполнения графа.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionContext {
    training: bool,
    frozen: bool,
    input_dropout_keep_probability: f32,
    regularization_lambda: f32,
}

impl ExecutionContext {
    /// Контекст режима обучения: batch-статистики, dropout включён
    /// (если задана вероятность), аксоны обучаемы.
    pub fn training() -> Self {
        Self {
            training: true,
            frozen: false,
            input_dropout_keep_probability: 1.0,
            regularization_lambda: 0.0,
        }
    }

    /// Контекст инференса: running-статистики, без dropout.
    pub fn inference() -> Self {
        Self {
            training: false,
            frozen: false,
            input_dropout_keep_probability: 1.0,
            regularization_lambda: 0.0,
        }
    }

    /// Замороженный контекст: `is_trainable` всех аксонов, которым он
    /// передан, становится ложным; корректировка весов запрещена.
    pub fn frozen(mut self) -> Self {
        self.frozen = true;
        self
    }

    /// Вероятность *сохранения* входного элемента при dropout.
    ///
    /// # Panics
    /// Паникует, если `p` не в диапазоне (0, 1].
    pub fn with_input_dropout_keep_probability(mut self, p: f32) -> Self {
        assert!(
            p > 0.0 && p <= 1.0,
            "Dropout keep probability must be in (0, 1], got {}",
            p
        );
        self.input_dropout_keep_probability = p;
        self
    }

    /// Коэффициент L2-регуляризации, подмешиваемый в градиенты весов.
    pub fn with_regularization_lambda(mut self, lambda: f32) -> Self {
        self.regularization_lambda = lambda;
        self
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn input_dropout_keep_probability(&self) -> f32 {
        self.input_dropout_keep_probability
    }

    pub fn regularization_lambda(&self) -> f32 {
        self.regularization_lambda
    }

    /// Применяется ли dropout в этом контексте.
    pub fn dropout_enabled(&self) -> bool {
        self.training && self.input_dropout_keep_probability < 1.0
    }
}
