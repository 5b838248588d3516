//! Интеграционный тест: проверка ручных градиентов методом конечных
//! разностей.

use ndarray::{array, Array1, Array2};
use rustynet::activation::{ActivationFormat, NeuronsActivation};
use rustynet::activations::LinearActivationFunction;
use rustynet::axons::{BatchNormAxons, FullyConnectedAxons, ScaleAndShiftAxons};
use rustynet::components::{
    ActivationFunctionComponent, ComponentChain, DirectedAxonsComponent,
    DirectedComponentActivation, GraphComponent,
};
use rustynet::context::ExecutionContext;
use rustynet::costs::{CostFunction, SumSquaredErrorCost};
use rustynet::neurons::Neurons;
use std::rc::Rc;

const EPSILON: f32 = 1e-3;
const TOLERANCE: f32 = 1e-2;

/// Сравнивает аналитический и численный градиенты по относительной ошибке.
fn assert_grads_are_close(analytic: &[f32], numeric: &[f32], tolerance: f32) {
    assert_eq!(analytic.len(), numeric.len(), "Gradient sizes do not match!");
    for (&a, &n) in analytic.iter().zip(numeric.iter()) {
        let diff = (a - n).abs();
        let larger = a.abs().max(n.abs());
        if larger == 0.0 {
            continue;
        }
        let relative_error = diff / larger;
        if relative_error > tolerance {
            panic!(
                "Gradients do not match! Analytic: {:.6}, Numeric: {:.6}, Relative Error: {:.6}",
                a, n, relative_error
            );
        }
    }
}

fn rows(data: Array2<f32>) -> NeuronsActivation {
    let features = data.nrows();
    NeuronsActivation::new(
        data,
        Neurons::new(features, false),
        ActivationFormat::RowsSpanFeatureSet,
    )
    .unwrap()
}

/// Цепочка из одного компонента аксонов с линейным хвостом - чтобы
/// работал канонический шорткат с SSE.
fn chain_over(component: GraphComponent) -> ComponentChain {
    ComponentChain::new(vec![
        component,
        ActivationFunctionComponent::new(LinearActivationFunction).into(),
    ])
    .unwrap()
}

fn sse_loss(chain: &ComponentChain, x: &Array2<f32>, t: &Array2<f32>) -> f32 {
    let ctx = ExecutionContext::training();
    let activation = chain
        .forward_propagate_chain(Rc::new(rows(x.clone())), &ctx)
        .unwrap();
    SumSquaredErrorCost
        .cost(&activation.output(), &rows(t.clone()))
        .unwrap()
}

// ---------------------------------------------------------------------------
// Полносвязные аксоны: градиент весов и смещений
// ---------------------------------------------------------------------------

fn fc_chain(weights: &Array2<f32>, biases: &Array1<f32>) -> ComponentChain {
    let (right, left) = weights.dim();
    chain_over(
        DirectedAxonsComponent::from_axons(
            FullyConnectedAxons::with_parameters(
                "fc",
                Neurons::new(left, true),
                Neurons::new(right, false),
                weights.clone(),
                Some(biases.clone()),
            )
            .unwrap(),
        )
        .into(),
    )
}

#[test]
fn test_fully_connected_weight_gradient_matches_finite_differences() {
    let weights = array![[0.4, -0.3, 0.2], [-0.1, 0.5, 0.3]];
    let biases = array![0.1, -0.2];
    let x = array![[1.0, -0.5], [0.3, 0.8], [-1.2, 0.4]];
    let t = array![[0.5, 0.0], [-0.5, 1.0]];

    // Аналитический градиент через обратный проход.
    let ctx = ExecutionContext::training();
    let chain = fc_chain(&weights, &biases);
    let activation = chain
        .forward_propagate_chain(Rc::new(rows(x.clone())), &ctx)
        .unwrap();
    let gradient = activation
        .back_propagate_with_cost(&SumSquaredErrorCost, &rows(t.clone()), &ctx)
        .unwrap();
    let totals = gradient.total_trainable_axons_gradients().unwrap();
    assert_eq!(totals.len(), 1);
    let analytic_weights = totals[0].weights_gradient().clone();
    let analytic_biases = totals[0].left_to_right_bias_gradient().unwrap().clone();

    // Численный градиент весов.
    let mut numeric_weights = Array2::<f32>::zeros(weights.dim());
    for i in 0..weights.nrows() {
        for j in 0..weights.ncols() {
            let mut plus = weights.clone();
            plus[[i, j]] += EPSILON;
            let mut minus = weights.clone();
            minus[[i, j]] -= EPSILON;
            let loss_plus = sse_loss(&fc_chain(&plus, &biases), &x, &t);
            let loss_minus = sse_loss(&fc_chain(&minus, &biases), &x, &t);
            numeric_weights[[i, j]] = (loss_plus - loss_minus) / (2.0 * EPSILON);
        }
    }
    assert_grads_are_close(
        analytic_weights.as_slice().unwrap(),
        numeric_weights.as_slice().unwrap(),
        TOLERANCE,
    );

    // Численный градиент смещений.
    let mut numeric_biases = Array1::<f32>::zeros(biases.len());
    for i in 0..biases.len() {
        let mut plus = biases.clone();
        plus[i] += EPSILON;
        let mut minus = biases.clone();
        minus[i] -= EPSILON;
        let loss_plus = sse_loss(&fc_chain(&weights, &plus), &x, &t);
        let loss_minus = sse_loss(&fc_chain(&weights, &minus), &x, &t);
        numeric_biases[i] = (loss_plus - loss_minus) / (2.0 * EPSILON);
    }
    assert_grads_are_close(
        analytic_biases.as_slice().unwrap(),
        numeric_biases.as_slice().unwrap(),
        TOLERANCE,
    );
}

// ---------------------------------------------------------------------------
// Scale-and-shift: градиенты масштаба и сдвига
// ---------------------------------------------------------------------------

fn scale_shift_chain(scale: &Array1<f32>, shift: &Array1<f32>) -> ComponentChain {
    chain_over(
        DirectedAxonsComponent::from_axons(
            ScaleAndShiftAxons::with_parameters(
                "ss",
                Neurons::new(scale.len(), true),
                scale.clone(),
                shift.clone(),
            )
            .unwrap(),
        )
        .into(),
    )
}

#[test]
fn test_scale_and_shift_gradients_match_finite_differences() {
    let scale = array![1.5, -0.7];
    let shift = array![0.2, 0.4];
    let x = array![[0.5, -1.0, 2.0], [1.0, 0.3, -0.6]];
    let t = array![[0.0, 0.5, 1.0], [1.0, -0.5, 0.0]];

    let ctx = ExecutionContext::training();
    let chain = scale_shift_chain(&scale, &shift);
    let activation = chain
        .forward_propagate_chain(Rc::new(rows(x.clone())), &ctx)
        .unwrap();
    let gradient = activation
        .back_propagate_with_cost(&SumSquaredErrorCost, &rows(t.clone()), &ctx)
        .unwrap();
    let totals = gradient.total_trainable_axons_gradients().unwrap();
    let analytic_scale = totals[0].weights_gradient().column(0).to_owned();
    let analytic_shift = totals[0].left_to_right_bias_gradient().unwrap().clone();

    let mut numeric_scale = Array1::<f32>::zeros(scale.len());
    let mut numeric_shift = Array1::<f32>::zeros(shift.len());
    for i in 0..scale.len() {
        let mut plus = scale.clone();
        plus[i] += EPSILON;
        let mut minus = scale.clone();
        minus[i] -= EPSILON;
        numeric_scale[i] = (sse_loss(&scale_shift_chain(&plus, &shift), &x, &t)
            - sse_loss(&scale_shift_chain(&minus, &shift), &x, &t))
            / (2.0 * EPSILON);

        let mut plus = shift.clone();
        plus[i] += EPSILON;
        let mut minus = shift.clone();
        minus[i] -= EPSILON;
        numeric_shift[i] = (sse_loss(&scale_shift_chain(&scale, &plus), &x, &t)
            - sse_loss(&scale_shift_chain(&scale, &minus), &x, &t))
            / (2.0 * EPSILON);
    }

    assert_grads_are_close(
        analytic_scale.as_slice().unwrap(),
        numeric_scale.as_slice().unwrap(),
        TOLERANCE,
    );
    assert_grads_are_close(
        analytic_shift.as_slice().unwrap(),
        numeric_shift.as_slice().unwrap(),
        TOLERANCE,
    );
}

// ---------------------------------------------------------------------------
// Batch normalization: градиент по входу
// ---------------------------------------------------------------------------

fn batchnorm_chain(features: usize) -> ComponentChain {
    chain_over(
        DirectedAxonsComponent::from_axons(BatchNormAxons::new(
            "bn",
            Neurons::new(features, true),
        ))
        .into(),
    )
}

#[test]
fn test_batchnorm_input_gradient_matches_finite_differences() {
    let x = array![[0.5, -1.0, 2.0, 0.1], [1.0, 0.3, -0.6, -1.4]];
    let t = array![[0.0, 0.5, 1.0, -0.5], [1.0, -0.5, 0.0, 0.5]];

    let ctx = ExecutionContext::training();
    let activation = batchnorm_chain(2)
        .forward_propagate_chain(Rc::new(rows(x.clone())), &ctx)
        .unwrap();
    let gradient = activation
        .back_propagate_with_cost(&SumSquaredErrorCost, &rows(t.clone()), &ctx)
        .unwrap();
    let analytic = gradient.output().data().clone();

    // Численный градиент по каждому элементу входа; аксоны пересоздаются,
    // чтобы running-статистики не накапливались между прогонами.
    let mut numeric = Array2::<f32>::zeros(x.dim());
    for i in 0..x.nrows() {
        for j in 0..x.ncols() {
            let mut plus = x.clone();
            plus[[i, j]] += EPSILON;
            let mut minus = x.clone();
            minus[[i, j]] -= EPSILON;
            let loss_plus = sse_loss(&batchnorm_chain(2), &plus, &t);
            let loss_minus = sse_loss(&batchnorm_chain(2), &minus, &t);
            numeric[[i, j]] = (loss_plus - loss_minus) / (2.0 * EPSILON);
        }
    }

    assert_grads_are_close(
        analytic.as_slice().unwrap(),
        numeric.as_slice().unwrap(),
        TOLERANCE,
    );
}
