//! Направленные компоненты: единый контракт узла графа и перенос
//! градиента через произвольно вложенные структуры.
//!
//! Алгоритм обратного прохода:
//!  - вызывающий ведёт прямой проход сверху вниз; каждый узел возвращает
//!    активацию, которая умеет распространять градиент назад;
//!  - обратный проход стартует с терминальной активации и разматывает
//!    записанную структуру в обратном порядке;
//!  - каждый шаг *префиксует* собственные отложенные поставщики градиентов
//!    к полученному списку, поэтому итоговый список всегда перечисляет
//!    аксоны в порядке их прохождения слева направо, сколько бы цепочек и
//!    развилок ни было вложено.
//!
//! Градиенты обучаемых параметров отложены (`AxonsGradientSupplier`):
//! градиент необучаемых или замороженных аксонов не материализуется
//! никогда.

use crate::activation::{ActivationError, NeuronsActivation};
use crate::activations::ActivationFunctionError;
use crate::axons::{AxonsError, AxonsGradient, AxonsResult};
use crate::context::ExecutionContext;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

pub mod activation_component;
pub mod axons_component;
pub mod bipole;
pub mod chain;
pub mod fan;
pub mod instrumented;

pub use activation_component::ActivationFunctionComponent;
pub use axons_component::DirectedAxonsComponent;
pub use bipole::BipoleGraph;
pub use chain::{ChainActivation, ComponentChain};
pub use fan::{
    CombinationStrategy, ManyToOneActivation, ManyToOneDirectedComponent, OneToManyActivation,
    OneToManyDirectedComponent,
};
pub use instrumented::{InstrumentedComponent, MetricsSink, PropagationPhase};

pub type ComponentResult<T> = std::result::Result<T, ComponentError>;

/// Ошибки уровня компонентов.
#[derive(Error, Debug)]
pub enum ComponentError {
    #[error(transparent)]
    Axons(#[from] AxonsError),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error(transparent)]
    ActivationFunction(#[from] ActivationFunctionError),

    #[error("Несовпадение формы: {0}")]
    ShapeMismatch(String),

    #[error("Недопустимое состояние: {0}")]
    IllegalState(String),

    #[error("Операция не поддерживается: {0}")]
    UnsupportedOperation(String),
}

/// Отложенный поставщик градиента одного экземпляра аксонов.
///
/// Замыкание захватывает всё необходимое для вычисления; оптимизатор,
/// которому этот градиент не нужен, просто не вызывает `supply`.
pub struct AxonsGradientSupplier {
    axons_name: String,
    compute: Box<dyn Fn() -> AxonsResult<AxonsGradient>>,
}

impl AxonsGradientSupplier {
    pub fn new(
        axons_name: impl Into<String>,
        compute: impl Fn() -> AxonsResult<AxonsGradient> + 'static,
    ) -> Self {
        Self {
            axons_name: axons_name.into(),
            compute: Box::new(compute),
        }
    }

    pub fn axons_name(&self) -> &str {
        &self.axons_name
    }

    /// Материализует градиент.
    pub fn supply(&self) -> AxonsResult<AxonsGradient> {
        (self.compute)()
    }
}

impl fmt::Debug for AxonsGradientSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AxonsGradientSupplier")
            .field("axons_name", &self.axons_name)
            .finish()
    }
}

/// Значение, протекающее назад через граф: градиент по активации плюс
/// упорядоченный список отложенных градиентов аксонов, накопленный по
/// мере разматывания структуры.
#[derive(Debug)]
pub struct DirectedComponentGradient {
    output: NeuronsActivation,
    suppliers: Vec<AxonsGradientSupplier>,
}

impl DirectedComponentGradient {
    /// Градиент без накопленных поставщиков - начальная точка обратного
    /// прохода.
    pub fn new(output: NeuronsActivation) -> Self {
        Self {
            output,
            suppliers: Vec::new(),
        }
    }

    pub fn with_suppliers(output: NeuronsActivation, suppliers: Vec<AxonsGradientSupplier>) -> Self {
        Self { output, suppliers }
    }

    /// Градиент по активации на текущей границе.
    pub fn output(&self) -> &NeuronsActivation {
        &self.output
    }

    /// Поставщики в порядке прохождения аксонов слева направо.
    pub fn suppliers(&self) -> &[AxonsGradientSupplier] {
        &self.suppliers
    }

    pub fn into_parts(self) -> (NeuronsActivation, Vec<AxonsGradientSupplier>) {
        (self.output, self.suppliers)
    }

    /// Суммарные градиенты обучаемых аксонов, в порядке прямого прохода.
    pub fn total_trainable_axons_gradients(&self) -> ComponentResult<Vec<AxonsGradient>> {
        self.suppliers
            .iter()
            .map(|s| s.supply().map_err(ComponentError::from))
            .collect()
    }

    /// Средние градиенты: суммарные, делённые на размер батча.
    pub fn average_trainable_axons_gradients(&self) -> ComponentResult<Vec<AxonsGradient>> {
        Ok(self
            .total_trainable_axons_gradients()?
            .into_iter()
            .map(|g| g.averaged())
            .collect())
    }
}

/// Единый контракт узла графа.
pub trait DirectedComponent {
    /// Прямой проход: потребляет входную активацию, возвращает запись,
    /// умеющую распространять градиент назад.
    fn forward_propagate(
        &self,
        input: Rc<NeuronsActivation>,
        context: &ExecutionContext,
    ) -> ComponentResult<Box<dyn DirectedComponentActivation>>;

    /// Рекурсивно разворачивает узел до списка листовых компонентов.
    /// Цепочки и графы листьями не являются.
    fn decompose(&self) -> Vec<GraphComponent>;
}

/// Запись одного прямого прохода через компонент.
pub trait DirectedComponentActivation {
    /// Выходная активация компонента.
    fn output(&self) -> Rc<NeuronsActivation>;

    /// Обратный проход: принимает градиент с правой границы, возвращает
    /// градиент на левой плюс накопленные поставщики.
    fn back_propagate(
        &self,
        gradient: DirectedComponentGradient,
        context: &ExecutionContext,
    ) -> ComponentResult<DirectedComponentGradient>;
}

/// Вид собранного узла графа.
///
/// Перечисление вместо параллельной иерархии типов: сборщик графа отдаёт
/// ядру уже проверенный список таких узлов, а ядро валидирует только
/// формы во время выполнения.
#[derive(Clone)]
pub enum GraphComponent {
    Axons(DirectedAxonsComponent),
    ActivationFunction(ActivationFunctionComponent),
    Chain(Rc<ComponentChain>),
    Bipole(Rc<BipoleGraph>),
    Instrumented(Rc<InstrumentedComponent>),
}

impl DirectedComponent for GraphComponent {
    fn forward_propagate(
        &self,
        input: Rc<NeuronsActivation>,
        context: &ExecutionContext,
    ) -> ComponentResult<Box<dyn DirectedComponentActivation>> {
        match self {
            GraphComponent::Axons(c) => c.forward_propagate(input, context),
            GraphComponent::ActivationFunction(c) => c.forward_propagate(input, context),
            GraphComponent::Chain(c) => c.forward_propagate(input, context),
            GraphComponent::Bipole(c) => c.forward_propagate(input, context),
            GraphComponent::Instrumented(c) => c.forward_propagate(input, context),
        }
    }

    fn decompose(&self) -> Vec<GraphComponent> {
        match self {
            GraphComponent::Axons(c) => c.decompose(),
            GraphComponent::ActivationFunction(c) => c.decompose(),
            GraphComponent::Chain(c) => c.decompose(),
            GraphComponent::Bipole(c) => c.decompose(),
            GraphComponent::Instrumented(c) => c.decompose(),
        }
    }
}

impl From<DirectedAxonsComponent> for GraphComponent {
    fn from(component: DirectedAxonsComponent) -> Self {
        GraphComponent::Axons(component)
    }
}

impl From<ActivationFunctionComponent> for GraphComponent {
    fn from(component: ActivationFunctionComponent) -> Self {
        GraphComponent::ActivationFunction(component)
    }
}

impl From<ComponentChain> for GraphComponent {
    fn from(chain: ComponentChain) -> Self {
        GraphComponent::Chain(Rc::new(chain))
    }
}

impl From<BipoleGraph> for GraphComponent {
    fn from(graph: BipoleGraph) -> Self {
        GraphComponent::Bipole(Rc::new(graph))
    }
}

impl From<InstrumentedComponent> for GraphComponent {
    fn from(component: InstrumentedComponent) -> Self {
        GraphComponent::Instrumented(Rc::new(component))
    }
}

/// Префиксует собственные поставщики шага к уже накопленным.
pub(crate) fn prepend_suppliers(
    mut own: Vec<AxonsGradientSupplier>,
    downstream: Vec<AxonsGradientSupplier>,
) -> Vec<AxonsGradientSupplier> {
    own.extend(downstream);
    own
}
