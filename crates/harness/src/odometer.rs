//! Parameter Odometer.
//!
//! Replaces the original's publisher/subscriber `IterPublisher` chain with
//! an explicit little-endian carry-propagation vector: each argument owns
//! one [`ParamIter`] slot, `advance()` increments the least-significant
//! slot and ripples a carry into the next slot on wraparound, and the
//! odometer is exhausted once the carry ripples off the most-significant
//! slot. Grounded on `original_source/param_iterators/{ParamIter,ListIter,
//! DictIter,DictListIter}.py` and the Design Notes' own call for a tagged
//! sum in place of pointer-chained publishers.

use std::collections::HashMap;

use crate::error::{HarnessError, Result};

/// A single argument's value space: either a flat list of discrete
/// values, or a binary flag that toggles between present (index 0) and
/// absent (index 1) — two states, matching the original's `BinaryIter`
/// used for non-constant `Flag` arguments.
#[derive(Debug, Clone)]
pub enum ParamIter {
    List(Vec<serde_json::Value>),
    Flag,
}

impl ParamIter {
    fn len(&self) -> usize {
        match self {
            ParamIter::List(values) => values.len().max(1),
            ParamIter::Flag => 2,
        }
    }

    /// `None` means the argument contributes nothing at this position —
    /// either it's a list exhausted past its bound, or a flag currently
    /// toggled off.
    fn value_at(&self, index: usize) -> Option<serde_json::Value> {
        match self {
            ParamIter::List(values) => values.get(index).cloned(),
            ParamIter::Flag => {
                if index == 0 {
                    Some(serde_json::Value::Bool(true))
                } else {
                    None
                }
            }
        }
    }
}

/// Odometer over named argument slots, each independently cycling. Yields
/// every Cartesian combination in little-endian digit order (first slot
/// varies fastest), matching the original's nested-publisher fan-out.
#[derive(Debug, Clone)]
pub struct Odometer {
    names: Vec<String>,
    slots: Vec<ParamIter>,
    positions: Vec<usize>,
    exhausted: bool,
    started: bool,
}

impl Odometer {
    /// Build an odometer over `slots` in the given name order. Name order
    /// doubles as digit order — `slots[0]` is least-significant.
    pub fn new(named_slots: Vec<(String, ParamIter)>) -> Self {
        let mut names = Vec::with_capacity(named_slots.len());
        let mut slots = Vec::with_capacity(named_slots.len());
        for (name, slot) in named_slots {
            names.push(name);
            slots.push(slot);
        }
        let positions = vec![0; slots.len()];
        Odometer {
            names,
            slots,
            positions,
            exhausted: slots_is_empty(&positions),
            started: false,
        }
    }

    /// Current parameter set, without advancing. Returns `Exhausted` once
    /// the odometer has rolled past its final combination.
    pub fn current_params(&self) -> Result<HashMap<String, serde_json::Value>> {
        if self.exhausted {
            return Err(HarnessError::Exhausted);
        }
        let mut out = HashMap::with_capacity(self.names.len());
        for (i, name) in self.names.iter().enumerate() {
            if let Some(value) = self.slots[i].value_at(self.positions[i]) {
                out.insert(name.clone(), value);
            }
        }
        Ok(out)
    }

    /// Returns the current parameter set on first call (without
    /// advancing), then advances and returns each subsequent set,
    /// mirroring `ParamFactory.getParams()` / `getNextParams()`.
    pub fn next_params(&mut self) -> Result<HashMap<String, serde_json::Value>> {
        if !self.started {
            self.started = true;
            return self.current_params();
        }
        self.advance()?;
        self.current_params()
    }

    /// Ripple-carry increment: bump slot 0, and whenever a slot wraps,
    /// reset it to 0 and carry into the next slot. If the carry ripples
    /// off the final slot, the odometer is exhausted.
    fn advance(&mut self) -> Result<()> {
        if self.exhausted {
            return Err(HarnessError::Exhausted);
        }
        let mut carry = true;
        for i in 0..self.positions.len() {
            if !carry {
                break;
            }
            self.positions[i] += 1;
            if self.positions[i] >= self.slots[i].len() {
                self.positions[i] = 0;
                carry = true;
            } else {
                carry = false;
            }
        }
        if carry {
            self.exhausted = true;
        }
        Ok(())
    }

    /// Advance to the next combination without reading it, for callers
    /// that drive the odometer and the parameter read separately (the
    /// scheduler advances every active test's odometer in lockstep, only
    /// once per full core-division cycle).
    pub fn bump(&mut self) -> Result<()> {
        if !self.started {
            self.started = true;
            return Ok(());
        }
        self.advance()
    }

    /// Whether every combination has already been yielded.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Total number of distinct combinations this odometer will produce.
    pub fn total_combinations(&self) -> usize {
        self.slots.iter().map(ParamIter::len).product()
    }
}

fn slots_is_empty(positions: &[usize]) -> bool {
    positions.is_empty()
}
