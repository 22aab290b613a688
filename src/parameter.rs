//! Shared parameter state that operators read and mutate.
//!
//! Parameters are addressed by [`ParameterId`]. Operators never hold a
//! reference into a [`ParameterSet`] between calls.

use std::fmt::Display;

use itertools::Itertools;

/// Handle of a parameter inside a [`ParameterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId(usize);

impl ParameterId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A change notification emitted by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A single element was written with [`ParameterSet::set_value`].
    Value { parameter: ParameterId, index: usize },
    /// The whole parameter changed.
    All { parameter: ParameterId },
}

#[derive(Debug, Clone)]
struct Parameter {
    name: String,
    values: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    stored: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    parameters: Vec<Parameter>,
    events: Vec<ChangeEvent>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unbounded parameter.
    pub fn add(&mut self, name: impl Into<String>, values: Vec<f64>) -> ParameterId {
        let dim = values.len();
        self.parameters.push(Parameter {
            name: name.into(),
            stored: values.clone(),
            values,
            lower: vec![f64::NEG_INFINITY; dim],
            upper: vec![f64::INFINITY; dim],
        });
        ParameterId(self.parameters.len() - 1)
    }

    /// Add a parameter with the same bounds on every dimension.
    pub fn add_bounded(
        &mut self,
        name: impl Into<String>,
        values: Vec<f64>,
        lower: f64,
        upper: f64,
    ) -> ParameterId {
        let id = self.add(name, values);
        let param = &mut self.parameters[id.0];
        param.lower.fill(lower);
        param.upper.fill(upper);
        id
    }

    pub fn set_bounds(&mut self, id: ParameterId, index: usize, lower: f64, upper: f64) {
        let param = &mut self.parameters[id.0];
        param.lower[index] = lower;
        param.upper[index] = upper;
    }

    pub fn find(&self, name: &str) -> Option<ParameterId> {
        self.parameters
            .iter()
            .position(|param| param.name == name)
            .map(ParameterId)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ParameterId> {
        (0..self.parameters.len()).map(ParameterId)
    }

    pub fn name(&self, id: ParameterId) -> &str {
        &self.parameters[id.0].name
    }

    pub fn dimension(&self, id: ParameterId) -> usize {
        self.parameters[id.0].values.len()
    }

    pub fn value(&self, id: ParameterId, index: usize) -> f64 {
        self.parameters[id.0].values[index]
    }

    pub fn values(&self, id: ParameterId) -> &[f64] {
        &self.parameters[id.0].values
    }

    pub fn bounds(&self, id: ParameterId, index: usize) -> (f64, f64) {
        let param = &self.parameters[id.0];
        (param.lower[index], param.upper[index])
    }

    pub fn in_bounds(&self, id: ParameterId, index: usize, value: f64) -> bool {
        let (lower, upper) = self.bounds(id, index);
        value >= lower && value <= upper
    }

    /// Write one element and emit a [`ChangeEvent::Value`].
    pub fn set_value(&mut self, id: ParameterId, index: usize, value: f64) {
        self.set_value_quietly(id, index, value);
        self.events.push(ChangeEvent::Value {
            parameter: id,
            index,
        });
    }

    /// Write one element without any notification.
    pub fn set_value_quietly(&mut self, id: ParameterId, index: usize, value: f64) {
        self.parameters[id.0].values[index] = value;
    }

    /// Emit a single whole-parameter change event.
    pub fn fire_change(&mut self, id: ParameterId) {
        self.events.push(ChangeEvent::All { parameter: id });
    }

    /// Start a batch of quiet writes.
    ///
    /// Each parameter written through the returned guard gets exactly one
    /// [`ChangeEvent::All`] when the guard is dropped.
    pub fn batch(&mut self) -> BatchUpdate<'_> {
        BatchUpdate {
            set: self,
            touched: Vec::new(),
        }
    }

    /// Remember the current values of every parameter.
    pub fn store(&mut self) {
        for param in self.parameters.iter_mut() {
            param.stored.copy_from_slice(&param.values);
        }
    }

    /// Reset every parameter to the values of the last [`store`](Self::store).
    pub fn restore(&mut self) {
        for param in self.parameters.iter_mut() {
            param.values.copy_from_slice(&param.stored);
        }
    }

    /// Drain the change events emitted since the last call.
    pub fn take_events(&mut self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Scoped batch of quiet writes, see [`ParameterSet::batch`].
pub struct BatchUpdate<'a> {
    set: &'a mut ParameterSet,
    touched: Vec<ParameterId>,
}

impl BatchUpdate<'_> {
    pub fn set_value(&mut self, id: ParameterId, index: usize, value: f64) {
        self.set.set_value_quietly(id, index, value);
        if !self.touched.contains(&id) {
            self.touched.push(id);
        }
    }

    pub fn value(&self, id: ParameterId, index: usize) -> f64 {
        self.set.value(id, index)
    }
}

impl Drop for BatchUpdate<'_> {
    fn drop(&mut self) {
        for id in self.touched.drain(..) {
            self.set.fire_change(id);
        }
    }
}

/// Several parameters viewed as one flat vector.
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundParameter {
    name: String,
    slots: Vec<(ParameterId, usize)>,
}

impl CompoundParameter {
    pub fn new(name: impl Into<String>, slots: Vec<(ParameterId, usize)>) -> Self {
        Self {
            name: name.into(),
            slots,
        }
    }

    /// Concatenate whole parameters in order.
    ///
    /// A single parameter keeps its own name, several are joined with `+`.
    pub fn from_parameters(set: &ParameterSet, ids: &[ParameterId]) -> Self {
        let name = ids.iter().map(|&id| set.name(id)).join("+");
        let slots = ids
            .iter()
            .flat_map(|&id| (0..set.dimension(id)).map(move |index| (id, index)))
            .collect();
        Self { name, slots }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[(ParameterId, usize)] {
        &self.slots
    }

    /// Distinct underlying parameters in order of first appearance.
    pub fn parameters(&self) -> Vec<ParameterId> {
        let mut ids: Vec<ParameterId> = Vec::new();
        for &(id, _) in self.slots.iter() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    pub fn value(&self, set: &ParameterSet, index: usize) -> f64 {
        let (id, inner) = self.slots[index];
        set.value(id, inner)
    }

    pub fn read_into(&self, set: &ParameterSet, out: &mut [f64]) {
        assert!(out.len() == self.slots.len());
        for (out, &(id, index)) in out.iter_mut().zip(self.slots.iter()) {
            *out = set.value(id, index);
        }
    }

    pub fn values(&self, set: &ParameterSet) -> Vec<f64> {
        let mut out = vec![0f64; self.slots.len()];
        self.read_into(set, &mut out);
        out
    }

    pub fn bounds(&self, set: &ParameterSet, index: usize) -> (f64, f64) {
        let (id, inner) = self.slots[index];
        set.bounds(id, inner)
    }

    /// Write all values quietly and notify once per underlying parameter.
    pub fn write(&self, set: &mut ParameterSet, values: &[f64]) {
        assert!(values.len() == self.slots.len());
        let mut batch = set.batch();
        for (&value, &(id, index)) in values.iter().zip(self.slots.iter()) {
            batch.set_value(id, index, value);
        }
    }
}

impl Display for CompoundParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
