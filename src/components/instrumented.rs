// --- File: src/components/instrumented.rs ---

//! Instrumented component: a decorator applied once at graph-assembly
//! time, timing forward and backward passes into an injected metrics
//! sink. Observability lives in the collaborator, not in global state.

use crate::activation::NeuronsActivation;
use crate::components::{
    ComponentResult, DirectedComponent, DirectedComponentActivation, DirectedComponentGradient,
    GraphComponent,
};
use crate::context::ExecutionContext;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Which pass a measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationPhase {
    Forward,
    Backward,
}

/// Injected observability collaborator.
pub trait MetricsSink {
    fn record(&self, component: &str, phase: PropagationPhase, elapsed: Duration);
}

/// A sink that keeps measurements in memory.
#[derive(Default)]
pub struct RecordingMetricsSink {
    records: RefCell<Vec<(String, PropagationPhase, Duration)>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(String, PropagationPhase, Duration)> {
        self.records.borrow().clone()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn record(&self, component: &str, phase: PropagationPhase, elapsed: Duration) {
        self.records
            .borrow_mut()
            .push((component.to_string(), phase, elapsed));
    }
}

/// Decorator timing the inner component's passes.
pub struct InstrumentedComponent {
    name: String,
    inner: GraphComponent,
    sink: Rc<dyn MetricsSink>,
}

impl InstrumentedComponent {
    pub fn new(
        name: impl Into<String>,
        inner: impl Into<GraphComponent>,
        sink: Rc<dyn MetricsSink>,
    ) -> Self {
        Self {
            name: name.into(),
            inner: inner.into(),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl DirectedComponent for InstrumentedComponent {
    fn forward_propagate(
        &self,
        input: Rc<NeuronsActivation>,
        context: &ExecutionContext,
    ) -> ComponentResult<Box<dyn DirectedComponentActivation>> {
        let started = Instant::now();
        let activation = self.inner.forward_propagate(input, context)?;
        self.sink
            .record(&self.name, PropagationPhase::Forward, started.elapsed());
        Ok(Box::new(InstrumentedActivation {
            name: self.name.clone(),
            inner: activation,
            sink: Rc::clone(&self.sink),
        }))
    }

    fn decompose(&self) -> Vec<GraphComponent> {
        self.inner.decompose()
    }
}

struct InstrumentedActivation {
    name: String,
    inner: Box<dyn DirectedComponentActivation>,
    sink: Rc<dyn MetricsSink>,
}

impl DirectedComponentActivation for InstrumentedActivation {
    fn output(&self) -> Rc<NeuronsActivation> {
        self.inner.output()
    }

    fn back_propagate(
        &self,
        gradient: DirectedComponentGradient,
        context: &ExecutionContext,
    ) -> ComponentResult<DirectedComponentGradient> {
        let started = Instant::now();
        let result = self.inner.back_propagate(gradient, context)?;
        self.sink
            .record(&self.name, PropagationPhase::Backward, started.elapsed());
        Ok(result)
    }
}
