//! # RustyNet: Component-Graph Neural Network Engine in Rust
//!
//! **RustyNet** is a neural-network computation engine built around a graph
//! of composable directed components: linear, convolutional and pooling
//! axons, activation functions, and branch/merge junctions, performing
//! forward propagation and backpropagation over batches of example vectors
//! or feature maps.
//!
//! Gradients are hand-written per component - there is no tracing
//! autodiff. The execution mode (training/inference, dropout, weight
//! decay) is an explicit [`context::ExecutionContext`] value threaded
//! through every call.
//!
//! ## Usage Example
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::rc::Rc;
//! use ndarray::Array2;
//! use rustynet::activation::{ActivationFormat, NeuronsActivation};
//! use rustynet::activations::ReluActivationFunction;
//! use rustynet::axons::FullyConnectedAxons;
//! use rustynet::components::{
//!     ActivationFunctionComponent, ComponentChain, DirectedAxonsComponent,
//!     DirectedComponent, DirectedComponentGradient,
//! };
//! use rustynet::context::ExecutionContext;
//! use rustynet::neurons::Neurons;
//!
//! // 1. Assemble a chain: fully connected axons followed by ReLU.
//! let fc = DirectedAxonsComponent::from_axons(FullyConnectedAxons::new(
//!     "fc1",
//!     Neurons::new(8, true),
//!     Neurons::new(4, false),
//! ));
//! let chain = ComponentChain::new(vec![
//!     fc.into(),
//!     ActivationFunctionComponent::new(ReluActivationFunction).into(),
//! ])?;
//!
//! // 2. Forward propagate a batch of 2 example vectors.
//! let ctx = ExecutionContext::training();
//! let input = Rc::new(NeuronsActivation::new(
//!     Array2::zeros((8, 2)),
//!     Neurons::new(8, false),
//!     ActivationFormat::RowsSpanFeatureSet,
//! )?);
//! let activation = chain.forward_propagate(input, &ctx)?;
//!
//! // 3. Back propagate a unit gradient and collect per-axons gradients.
//! let unit = NeuronsActivation::new(
//!     Array2::ones((4, 2)),
//!     Neurons::new(4, false),
//!     ActivationFormat::RowsSpanFeatureSet,
//! )?;
//! let gradient = activation.back_propagate(DirectedComponentGradient::new(unit), &ctx)?;
//! let per_axons = gradient.average_trainable_axons_gradients()?;
//! assert_eq!(per_axons.len(), 1);
//! # Ok(())
//! # }
//! ```

// Declare public modules that constitute the core library API.
pub mod activation;
pub mod activations;
pub mod axons;
pub mod components;
pub mod context;
pub mod costs;
pub mod neurons;
