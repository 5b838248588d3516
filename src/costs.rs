// --- File: src/costs.rs ---

//! Module containing cost functions and their canonical activation
//! pairings.
//!
//! Each cost function declares the activation function it canonically
//! pairs with. For the canonical pairs the combined gradient of the cost
//! composed with the activation, taken with respect to the activation's
//! *input*, reduces to `prediction − target` - a numerically stable
//! shortcut used by trailing-activation-function chains instead of the
//! generic chain rule:
//!
//! - linear + sum-squared-error
//! - sigmoid + binary cross-entropy
//! - softmax + multiclass cross-entropy

use crate::activation::{ActivationError, ActivationResult, NeuronsActivation};
use crate::activations::ActivationFunctionType;

/// Small value for numerical stability of the log terms.
const LOG_EPS: f32 = 1e-12;

/// Cost function contract.
pub trait CostFunction {
    /// The activation function this cost canonically pairs with.
    fn paired_activation(&self) -> ActivationFunctionType;

    /// Total cost of the predictions against the targets.
    fn cost(
        &self,
        predictions: &NeuronsActivation,
        targets: &NeuronsActivation,
    ) -> ActivationResult<f32>;

    /// Combined gradient of cost∘activation with respect to the
    /// activation input. For every canonical pair this is
    /// `prediction − target`.
    fn gradient(
        &self,
        predictions: &NeuronsActivation,
        targets: &NeuronsActivation,
    ) -> ActivationResult<NeuronsActivation>;
}

fn check_shapes(
    predictions: &NeuronsActivation,
    targets: &NeuronsActivation,
) -> ActivationResult<()> {
    if predictions.feature_count() != targets.feature_count()
        || predictions.example_count() != targets.example_count()
    {
        return Err(ActivationError::IncompatibleShapes(format!(
            "predictions ({} x {}) vs targets ({} x {})",
            predictions.feature_count(),
            predictions.example_count(),
            targets.feature_count(),
            targets.example_count()
        )));
    }
    Ok(())
}

fn prediction_minus_target(
    predictions: &NeuronsActivation,
    targets: &NeuronsActivation,
) -> ActivationResult<NeuronsActivation> {
    check_shapes(predictions, targets)?;
    let difference = &predictions.as_feature_rows().to_owned() - &targets.as_feature_rows();
    NeuronsActivation::new(
        difference,
        *predictions.neurons(),
        crate::activation::ActivationFormat::RowsSpanFeatureSet,
    )
}

// ============================================================================
// Sum Squared Error (pairs with linear output)
// ============================================================================

/// Sum-squared-error cost: `C = 0.5 * Σ (p − t)²`.
pub struct SumSquaredErrorCost;

impl CostFunction for SumSquaredErrorCost {
    fn paired_activation(&self) -> ActivationFunctionType {
        ActivationFunctionType::Linear
    }

    fn cost(
        &self,
        predictions: &NeuronsActivation,
        targets: &NeuronsActivation,
    ) -> ActivationResult<f32> {
        check_shapes(predictions, targets)?;
        let p = predictions.as_feature_rows();
        let t = targets.as_feature_rows();
        Ok(p.iter()
            .zip(t.iter())
            .map(|(&pk, &tk)| 0.5 * (pk - tk) * (pk - tk))
            .sum())
    }

    fn gradient(
        &self,
        predictions: &NeuronsActivation,
        targets: &NeuronsActivation,
    ) -> ActivationResult<NeuronsActivation> {
        prediction_minus_target(predictions, targets)
    }
}

// ============================================================================
// Binary Cross-Entropy (pairs with sigmoid output)
// ============================================================================

/// Binary cross-entropy cost:
/// `C = −Σ [t·ln(p) + (1 − t)·ln(1 − p)]`.
pub struct BinaryCrossEntropyCost;

impl CostFunction for BinaryCrossEntropyCost {
    fn paired_activation(&self) -> ActivationFunctionType {
        ActivationFunctionType::Sigmoid
    }

    fn cost(
        &self,
        predictions: &NeuronsActivation,
        targets: &NeuronsActivation,
    ) -> ActivationResult<f32> {
        check_shapes(predictions, targets)?;
        let p = predictions.as_feature_rows();
        let t = targets.as_feature_rows();
        Ok(-p
            .iter()
            .zip(t.iter())
            .map(|(&pk, &tk)| {
                tk * (pk + LOG_EPS).ln() + (1.0 - tk) * (1.0 - pk + LOG_EPS).ln()
            })
            .sum::<f32>())
    }

    fn gradient(
        &self,
        predictions: &NeuronsActivation,
        targets: &NeuronsActivation,
    ) -> ActivationResult<NeuronsActivation> {
        // Наивное правило цепочки делит на p(1−p) и взрывается на границе;
        // комбинированный градиент сокращается до p − t.
        prediction_minus_target(predictions, targets)
    }
}

// ============================================================================
// Multiclass Cross-Entropy (pairs with softmax output)
// ============================================================================

/// Multiclass cross-entropy cost: `C = −Σ t·ln(p)` over one-hot targets.
pub struct CategoricalCrossEntropyCost;

impl CostFunction for CategoricalCrossEntropyCost {
    fn paired_activation(&self) -> ActivationFunctionType {
        ActivationFunctionType::Softmax
    }

    fn cost(
        &self,
        predictions: &NeuronsActivation,
        targets: &NeuronsActivation,
    ) -> ActivationResult<f32> {
        check_shapes(predictions, targets)?;
        let p = predictions.as_feature_rows();
        let t = targets.as_feature_rows();
        Ok(-p
            .iter()
            .zip(t.iter())
            .map(|(&pk, &tk)| tk * (pk + LOG_EPS).ln())
            .sum::<f32>())
    }

    fn gradient(
        &self,
        predictions: &NeuronsActivation,
        targets: &NeuronsActivation,
    ) -> ActivationResult<NeuronsActivation> {
        prediction_minus_target(predictions, targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationFormat;
    use crate::neurons::Neurons;
    use ndarray::array;

    fn activation(data: ndarray::Array2<f32>, count: usize) -> NeuronsActivation {
        NeuronsActivation::new(
            data,
            Neurons::new(count, false),
            ActivationFormat::RowsSpanFeatureSet,
        )
        .unwrap()
    }

    #[test]
    fn test_sse_cost_and_gradient() {
        let cost = SumSquaredErrorCost;
        let p = activation(array![[2.0], [0.0]], 2);
        let t = activation(array![[1.0], [1.0]], 2);

        assert!((cost.cost(&p, &t).unwrap() - 1.0).abs() < 1e-6);
        let g = cost.gradient(&p, &t).unwrap();
        assert_eq!(g.data().column(0).to_vec(), vec![1.0, -1.0]);
    }

    #[test]
    fn test_bce_is_finite_at_boundary() {
        let cost = BinaryCrossEntropyCost;
        // Предсказания ровно 0 и 1 - лог-члены стабилизированы.
        let p = activation(array![[0.0], [1.0]], 2);
        let t = activation(array![[0.0], [1.0]], 2);
        assert!(cost.cost(&p, &t).unwrap().is_finite());
    }

    #[test]
    fn test_canonical_pairings() {
        assert_eq!(
            SumSquaredErrorCost.paired_activation(),
            ActivationFunctionType::Linear
        );
        assert_eq!(
            BinaryCrossEntropyCost.paired_activation(),
            ActivationFunctionType::Sigmoid
        );
        assert_eq!(
            CategoricalCrossEntropyCost.paired_activation(),
            ActivationFunctionType::Softmax
        );
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let cost = SumSquaredErrorCost;
        let p = activation(array![[1.0], [2.0]], 2);
        let t = activation(array![[1.0]], 1);
        assert!(matches!(
            cost.cost(&p, &t),
            Err(ActivationError::IncompatibleShapes(_))
        ));
    }
}
