// --- File: src/components/chain.rs ---

//! Sequential composition of directed components.

use crate::activation::NeuronsActivation;
use crate::components::{
    ComponentError, ComponentResult, DirectedComponent, DirectedComponentActivation,
    DirectedComponentGradient, GraphComponent,
};
use crate::context::ExecutionContext;
use crate::costs::CostFunction;
use std::rc::Rc;

/// An ordered, non-empty list of directed components.
///
/// Forward propagation threads the activation through the components in
/// order; backward walks the recorded activations in reverse, feeding each
/// node's produced gradient into the previous node and prefixing each
/// node's gradient suppliers onto the running list.
pub struct ComponentChain {
    components: Vec<GraphComponent>,
}

impl ComponentChain {
    /// Creates a chain. A chain with zero components is invalid.
    pub fn new(components: Vec<GraphComponent>) -> ComponentResult<Self> {
        if components.is_empty() {
            return Err(ComponentError::IllegalState(
                "цепочка без компонентов недопустима".to_string(),
            ));
        }
        Ok(Self { components })
    }

    pub fn components(&self) -> &[GraphComponent] {
        &self.components
    }

    /// The activation function type of the trailing component, when the
    /// chain ends in one - the precondition for the canonical cost
    /// shortcut.
    fn trailing_activation_function(&self) -> Option<crate::activations::ActivationFunctionType> {
        match self.components.last() {
            Some(GraphComponent::ActivationFunction(f)) => Some(f.function_type()),
            _ => None,
        }
    }

    /// Forward propagation returning the concrete chain activation, so the
    /// caller keeps access to the cost-function shortcut.
    pub fn forward_propagate_chain(
        &self,
        input: Rc<NeuronsActivation>,
        context: &ExecutionContext,
    ) -> ComponentResult<ChainActivation> {
        let mut activations: Vec<Box<dyn DirectedComponentActivation>> =
            Vec::with_capacity(self.components.len());
        let mut current = input;
        for component in &self.components {
            let activation = component.forward_propagate(current, context)?;
            current = activation.output();
            activations.push(activation);
        }
        Ok(ChainActivation {
            activations,
            trailing: self.trailing_activation_function(),
        })
    }
}

impl DirectedComponent for ComponentChain {
    fn forward_propagate(
        &self,
        input: Rc<NeuronsActivation>,
        context: &ExecutionContext,
    ) -> ComponentResult<Box<dyn DirectedComponentActivation>> {
        Ok(Box::new(self.forward_propagate_chain(input, context)?))
    }

    fn decompose(&self) -> Vec<GraphComponent> {
        self.components
            .iter()
            .flat_map(|c| c.decompose())
            .collect()
    }
}

/// The recorded activations of one forward pass through a chain.
pub struct ChainActivation {
    activations: Vec<Box<dyn DirectedComponentActivation>>,
    trailing: Option<crate::activations::ActivationFunctionType>,
}

impl ChainActivation {
    /// Backward pass paired with a cost function: when the chain ends in
    /// the activation function the cost canonically pairs with, the
    /// combined `prediction − target` gradient replaces the generic chain
    /// rule and the trailing component's standalone backward is skipped.
    pub fn back_propagate_with_cost(
        &self,
        cost: &dyn CostFunction,
        targets: &NeuronsActivation,
        context: &ExecutionContext,
    ) -> ComponentResult<DirectedComponentGradient> {
        let trailing = self.trailing.ok_or_else(|| {
            ComponentError::IllegalState(
                "последний компонент цепочки не является функцией активации".to_string(),
            )
        })?;
        if trailing != cost.paired_activation() {
            return Err(ComponentError::IllegalState(format!(
                "функция стоимости канонически парна {:?}, а цепочка завершается {:?}",
                cost.paired_activation(),
                trailing
            )));
        }

        let predictions = self.output();
        let combined = cost.gradient(&predictions, targets)?;
        let mut gradient = DirectedComponentGradient::new(combined);
        for activation in self.activations[..self.activations.len() - 1].iter().rev() {
            gradient = activation.back_propagate(gradient, context)?;
        }
        Ok(gradient)
    }
}

impl DirectedComponentActivation for ChainActivation {
    fn output(&self) -> Rc<NeuronsActivation> {
        self.activations
            .last()
            .expect("chain is never empty")
            .output()
    }

    fn back_propagate(
        &self,
        gradient: DirectedComponentGradient,
        context: &ExecutionContext,
    ) -> ComponentResult<DirectedComponentGradient> {
        let mut gradient = gradient;
        for activation in self.activations.iter().rev() {
            gradient = activation.back_propagate(gradient, context)?;
        }
        Ok(gradient)
    }
}
