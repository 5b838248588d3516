//! Листовой компонент поверх функции активации.

use crate::activation::{ActivationFormat, NeuronsActivation};
use crate::activations::{ActivationFunction, ActivationFunctionType};
use crate::components::{
    ComponentError, ComponentResult, DirectedComponent, DirectedComponentActivation,
    DirectedComponentGradient, GraphComponent,
};
use crate::context::ExecutionContext;
use std::rc::Rc;

/// Направленный компонент поверх функции активации.
///
/// Запоминает вход и выход прямого прохода; автономный обратный проход -
/// поэлементное умножение внешнего градиента на градиент активации,
/// восстановленный из выхода.
#[derive(Clone)]
pub struct ActivationFunctionComponent {
    function: Rc<dyn ActivationFunction>,
}

impl ActivationFunctionComponent {
    pub fn new(function: impl ActivationFunction + 'static) -> Self {
        Self {
            function: Rc::new(function),
        }
    }

    pub fn function_type(&self) -> ActivationFunctionType {
        self.function.function_type()
    }
}

impl DirectedComponent for ActivationFunctionComponent {
    fn forward_propagate(
        &self,
        input: Rc<NeuronsActivation>,
        context: &ExecutionContext,
    ) -> ComponentResult<Box<dyn DirectedComponentActivation>> {
        let output = self.function.activate(&input, context)?;
        Ok(Box::new(ActivationFunctionComponentActivation {
            function: Rc::clone(&self.function),
            input,
            output: Rc::new(output),
        }))
    }

    fn decompose(&self) -> Vec<GraphComponent> {
        vec![GraphComponent::ActivationFunction(self.clone())]
    }
}

/// Запись прямого прохода через функцию активации.
pub struct ActivationFunctionComponentActivation {
    function: Rc<dyn ActivationFunction>,
    input: Rc<NeuronsActivation>,
    output: Rc<NeuronsActivation>,
}

impl ActivationFunctionComponentActivation {
    pub fn input(&self) -> &Rc<NeuronsActivation> {
        &self.input
    }
}

impl DirectedComponentActivation for ActivationFunctionComponentActivation {
    fn output(&self) -> Rc<NeuronsActivation> {
        Rc::clone(&self.output)
    }

    fn back_propagate(
        &self,
        gradient: DirectedComponentGradient,
        context: &ExecutionContext,
    ) -> ComponentResult<DirectedComponentGradient> {
        let (outer, suppliers) = gradient.into_parts();
        if outer.feature_count() != self.output.feature_count()
            || outer.example_count() != self.output.example_count()
        {
            return Err(ComponentError::ShapeMismatch(format!(
                "градиент ({} x {}) против выхода активации ({} x {})",
                outer.feature_count(),
                outer.example_count(),
                self.output.feature_count(),
                self.output.example_count()
            )));
        }

        let factor = self.function.activation_gradient(&self.output, context)?;
        let propagated = &outer.as_feature_rows().to_owned() * &factor.as_feature_rows();
        let propagated = NeuronsActivation::new(
            propagated,
            *self.input.neurons(),
            ActivationFormat::RowsSpanFeatureSet,
        )?;

        // Функция активации не добавляет собственных поставщиков.
        Ok(DirectedComponentGradient::with_suppliers(
            propagated, suppliers,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::{ReluActivationFunction, SoftmaxActivationFunction};
    use crate::neurons::Neurons;
    use ndarray::array;

    fn input(data: ndarray::Array2<f32>, count: usize) -> Rc<NeuronsActivation> {
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
    fn test_relu_component_masks_gradient() {
        let component = ActivationFunctionComponent::new(ReluActivationFunction);
        let ctx = ExecutionContext::training();

        let activation = component
            .forward_propagate(input(array![[-2.0], [0.0], [3.0]], 3), &ctx)
            .unwrap();
        assert_eq!(
            activation.output().data().column(0).to_vec(),
            vec![0.0, 0.0, 3.0]
        );

        let unit = NeuronsActivation::new(
            array![[5.0], [5.0], [5.0]],
            Neurons::new(3, false),
            ActivationFormat::RowsSpanFeatureSet,
        )
        .unwrap();
        let gradient = activation
            .back_propagate(DirectedComponentGradient::new(unit), &ctx)
            .unwrap();
        assert_eq!(
            gradient.output().data().column(0).to_vec(),
            vec![0.0, 0.0, 5.0]
        );
        assert!(gradient.suppliers().is_empty());
    }

    #[test]
    fn test_softmax_component_standalone_backward_fails() {
        let component = ActivationFunctionComponent::new(SoftmaxActivationFunction);
        let ctx = ExecutionContext::training();

        let activation = component
            .forward_propagate(input(array![[1.0], [2.0]], 2), &ctx)
            .unwrap();
        let unit = NeuronsActivation::new(
            array![[1.0], [1.0]],
            Neurons::new(2, false),
            ActivationFormat::RowsSpanFeatureSet,
        )
        .unwrap();
        assert!(matches!(
            activation.back_propagate(DirectedComponentGradient::new(unit), &ctx),
            Err(ComponentError::ActivationFunction(_))
        ));
    }
}
