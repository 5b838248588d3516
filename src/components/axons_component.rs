//! Листовой компонент, оборачивающий аксоны в единый контракт узла.

use crate::activation::NeuronsActivation;
use crate::axons::{Axons, AxonsActivation};
use crate::components::{
    prepend_suppliers, AxonsGradientSupplier, ComponentResult, DirectedComponent,
    DirectedComponentActivation, DirectedComponentGradient, GraphComponent,
};
use crate::context::ExecutionContext;
use std::cell::RefCell;
use std::rc::Rc;

/// Направленный компонент поверх любых аксонов.
///
/// Аксоны разделяются через `Rc<RefCell<…>>`: тот же экземпляр держит
/// цикл обучения, корректирующий веса между батчами.
#[derive(Clone)]
pub struct DirectedAxonsComponent {
    axons: Rc<RefCell<dyn Axons>>,
}

impl DirectedAxonsComponent {
    pub fn new(axons: Rc<RefCell<dyn Axons>>) -> Self {
        Self { axons }
    }

    /// Оборачивает аксоны, забирая владение.
    pub fn from_axons(axons: impl Axons + 'static) -> Self {
        Self::new(Rc::new(RefCell::new(axons)))
    }

    /// Разделяемая ссылка на обёрнутые аксоны.
    pub fn axons(&self) -> Rc<RefCell<dyn Axons>> {
        Rc::clone(&self.axons)
    }
}

impl DirectedComponent for DirectedAxonsComponent {
    fn forward_propagate(
        &self,
        input: Rc<NeuronsActivation>,
        context: &ExecutionContext,
    ) -> ComponentResult<Box<dyn DirectedComponentActivation>> {
        let record = self
            .axons
            .borrow()
            .push_left_to_right(&input, None, context)?;
        Ok(Box::new(DirectedAxonsComponentActivation {
            axons: Rc::clone(&self.axons),
            record: Rc::new(record),
        }))
    }

    fn decompose(&self) -> Vec<GraphComponent> {
        vec![GraphComponent::Axons(self.clone())]
    }
}

/// Запись прямого прохода через аксоны.
pub struct DirectedAxonsComponentActivation {
    axons: Rc<RefCell<dyn Axons>>,
    record: Rc<AxonsActivation>,
}

impl DirectedAxonsComponentActivation {
    pub fn record(&self) -> &AxonsActivation {
        &self.record
    }
}

impl DirectedComponentActivation for DirectedAxonsComponentActivation {
    fn output(&self) -> Rc<NeuronsActivation> {
        Rc::clone(self.record.output())
    }

    fn back_propagate(
        &self,
        gradient: DirectedComponentGradient,
        context: &ExecutionContext,
    ) -> ComponentResult<DirectedComponentGradient> {
        let (outer, downstream) = gradient.into_parts();
        let outer = Rc::new(outer);

        let axons = self.axons.borrow();
        let propagated = axons.propagated_gradient(&outer, &self.record, context)?;

        let mut own = Vec::new();
        if axons.is_trainable(context) {
            // Градиент параметров откладывается: замыкание захватывает
            // запись прохода и внешний градиент по Rc.
            let axons_ref = Rc::clone(&self.axons);
            let record = Rc::clone(&self.record);
            let outer_gradient = Rc::clone(&outer);
            let thunk_context = *context;
            own.push(AxonsGradientSupplier::new(axons.name(), move || {
                axons_ref
                    .borrow()
                    .calculate_gradient(&record, &outer_gradient, &thunk_context)
            }));
        }
        drop(axons);

        Ok(DirectedComponentGradient::with_suppliers(
            propagated,
            prepend_suppliers(own, downstream),
        ))
    }
}
