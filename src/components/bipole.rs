// --- File: src/components/bipole.rs ---

//! Bipole graph: fan-out into parallel edge chains, merged by a fan-in.
//!
//! The composite models skip connections (`Addition` strategy, one edge
//! being the identity or a short chain) and Inception-style parallel
//! filter banks (`FilterConcat`). Edges see the same frozen input and are
//! mutually independent during forward propagation; the fan-in backward
//! is the join point that combines every edge's gradient before the
//! fan-out backward produces the single upstream gradient.

use crate::activation::NeuronsActivation;
use crate::components::chain::{ChainActivation, ComponentChain};
use crate::components::fan::{
    CombinationStrategy, ManyToOneActivation, ManyToOneDirectedComponent, OneToManyActivation,
    OneToManyDirectedComponent,
};
use crate::components::{
    prepend_suppliers, ComponentError, ComponentResult, DirectedComponent,
    DirectedComponentActivation, DirectedComponentGradient, GraphComponent,
};
use crate::context::ExecutionContext;
use std::rc::Rc;

/// Fan-out → N independent edge chains → fan-in.
pub struct BipoleGraph {
    edges: Vec<ComponentChain>,
    fan_out: OneToManyDirectedComponent,
    fan_in: ManyToOneDirectedComponent,
}

impl BipoleGraph {
    /// Creates a bipole graph over the given edges. At least two edges are
    /// required - a single-edge bipole is just a chain.
    pub fn new(edges: Vec<ComponentChain>, strategy: CombinationStrategy) -> ComponentResult<Self> {
        if edges.len() < 2 {
            return Err(ComponentError::IllegalState(format!(
                "биполярный граф требует минимум двух рёбер, получил {}",
                edges.len()
            )));
        }
        let fan_out = OneToManyDirectedComponent::new(edges.len())?;
        let fan_in = ManyToOneDirectedComponent::new(strategy);
        Ok(Self {
            edges,
            fan_out,
            fan_in,
        })
    }

    pub fn edges(&self) -> &[ComponentChain] {
        &self.edges
    }

    pub fn strategy(&self) -> CombinationStrategy {
        self.fan_in.strategy()
    }
}

impl DirectedComponent for BipoleGraph {
    fn forward_propagate(
        &self,
        input: Rc<NeuronsActivation>,
        context: &ExecutionContext,
    ) -> ComponentResult<Box<dyn DirectedComponentActivation>> {
        let fanned = self.fan_out.forward(input);

        // Edges are order-independent; any single edge failure fails the
        // whole call.
        let mut edge_activations = Vec::with_capacity(self.edges.len());
        for (index, edge) in self.edges.iter().enumerate() {
            let edge_input = fanned.path_activation(index)?;
            edge_activations.push(edge.forward_propagate_chain(edge_input, context)?);
        }

        let outputs: Vec<Rc<NeuronsActivation>> =
            edge_activations.iter().map(|a| a.output()).collect();
        let merged = self.fan_in.forward(outputs)?;

        Ok(Box::new(BipoleGraphActivation {
            fanned,
            edge_activations,
            merged,
        }))
    }

    fn decompose(&self) -> Vec<GraphComponent> {
        self.edges.iter().flat_map(|e| e.decompose()).collect()
    }
}

/// The recorded activations of one forward pass through a bipole graph.
pub struct BipoleGraphActivation {
    fanned: OneToManyActivation,
    edge_activations: Vec<ChainActivation>,
    merged: ManyToOneActivation,
}

impl DirectedComponentActivation for BipoleGraphActivation {
    fn output(&self) -> Rc<NeuronsActivation> {
        self.merged.output()
    }

    fn back_propagate(
        &self,
        gradient: DirectedComponentGradient,
        context: &ExecutionContext,
    ) -> ComponentResult<DirectedComponentGradient> {
        let (outer, downstream) = gradient.into_parts();

        // Split the merged gradient into per-branch gradients; every edge
        // gradient must exist before the fan-out can combine them.
        let branch_gradients = self.merged.back_propagate(&outer)?;

        let mut edge_input_gradients = Vec::with_capacity(self.edge_activations.len());
        let mut own_suppliers = Vec::new();
        for (edge_activation, branch_gradient) in
            self.edge_activations.iter().zip(branch_gradients)
        {
            let edge_gradient = edge_activation
                .back_propagate(DirectedComponentGradient::new(branch_gradient), context)?;
            let (edge_output, edge_suppliers) = edge_gradient.into_parts();
            edge_input_gradients.push(edge_output);
            own_suppliers.extend(edge_suppliers);
        }

        let combined = self.fanned.back_propagate(edge_input_gradients)?;
        Ok(DirectedComponentGradient::with_suppliers(
            combined,
            prepend_suppliers(own_suppliers, downstream),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationFormat;
    use crate::activations::LinearActivationFunction;
    use crate::axons::FullyConnectedAxons;
    use crate::components::{ActivationFunctionComponent, DirectedAxonsComponent};
    use crate::neurons::Neurons;
    use ndarray::array;

    fn identity_edge() -> ComponentChain {
        ComponentChain::new(vec![
            ActivationFunctionComponent::new(LinearActivationFunction).into(),
        ])
        .unwrap()
    }

    fn fc_edge(name: &str, weights: ndarray::Array2<f32>) -> ComponentChain {
        let (right, left) = weights.dim();
        ComponentChain::new(vec![DirectedAxonsComponent::from_axons(
            FullyConnectedAxons::with_parameters(
                name,
                Neurons::new(left, false),
                Neurons::new(right, false),
                weights,
                None,
            )
            .unwrap(),
        )
        .into()])
        .unwrap()
    }

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
    fn test_single_edge_is_rejected() {
        assert!(matches!(
            BipoleGraph::new(vec![identity_edge()], CombinationStrategy::Addition),
            Err(ComponentError::IllegalState(_))
        ));
    }

    #[test]
    fn test_residual_forward_adds_edge_outputs() {
        // identity + 2x weights: выход residual-блока = x + 2x = 3x.
        let graph = BipoleGraph::new(
            vec![identity_edge(), fc_edge("res", array![[2.0, 0.0], [0.0, 2.0]])],
            CombinationStrategy::Addition,
        )
        .unwrap();
        let ctx = ExecutionContext::training();

        let activation = graph
            .forward_propagate(input(array![[1.0], [2.0]], 2), &ctx)
            .unwrap();
        assert_eq!(activation.output().data().clone(), array![[3.0], [6.0]]);
    }

    #[test]
    fn test_backward_joins_both_edges() {
        let graph = BipoleGraph::new(
            vec![identity_edge(), fc_edge("res", array![[2.0, 0.0], [0.0, 2.0]])],
            CombinationStrategy::Addition,
        )
        .unwrap();
        let ctx = ExecutionContext::training();
        let activation = graph
            .forward_propagate(input(array![[1.0], [2.0]], 2), &ctx)
            .unwrap();

        let unit = NeuronsActivation::new(
            array![[1.0], [1.0]],
            Neurons::new(2, false),
            ActivationFormat::RowsSpanFeatureSet,
        )
        .unwrap();
        let gradient = activation
            .back_propagate(DirectedComponentGradient::new(unit), &ctx)
            .unwrap();

        // identity-ребро проводит [1,1], fc-ребро - Wᵀ·[1,1] = [2,2];
        // веер суммирует: [3,3].
        assert_eq!(gradient.output().data().clone(), array![[3.0], [3.0]]);
        // Ровно один поставщик - от единственных обучаемых аксонов.
        assert_eq!(gradient.suppliers().len(), 1);
        assert_eq!(gradient.suppliers()[0].axons_name(), "res");
    }

    #[test]
    fn test_decompose_is_union_of_edges() {
        let graph = BipoleGraph::new(
            vec![
                fc_edge("a", array![[1.0]]),
                fc_edge("b", array![[1.0]]),
                identity_edge(),
            ],
            CombinationStrategy::Addition,
        )
        .unwrap();
        assert_eq!(graph.decompose().len(), 3);
    }
}
