//! Test Iterator / Scheduler.
//!
//! Round-robins across the active tests, with the core-division list
//! advancing once per full test cycle, and each test's parameter
//! odometer advancing once per full division cycle. A test whose
//! odometer is exhausted drops out of rotation; the run ends once every
//! test has dropped out. This is an explicit state machine in place of
//! the original's publisher/subscriber notification chain, grounded on
//! `original_source/test_factories/TestFactory.py::getNextTest` and
//! `original_source/param_factories/ParamFactory.py`.

use std::collections::HashMap;

use crate::config::{Settings, TestConfig};
use crate::error::{HarnessError, Result};
use crate::odometer::{Odometer, ParamIter};
use crate::partition::CoreGroup;

struct TestSlot {
    name: String,
    binary: String,
    option_order: Vec<(String, bool)>, // (cmdline option, is_flag) in declaration order, non-constant args only
    constants: Vec<(String, String)>,  // cmdline option -> literal value, always present
    odometer: Odometer,
}

/// One fully resolved invocation: a test's binary plus its current
/// argument set, run concurrently across every core in `cores`.
#[derive(Debug, Clone)]
pub struct ScheduledCommand {
    pub sequence: u64,
    pub test_name: String,
    pub command_line: String,
    pub cores: Vec<u32>,
}

pub struct Scheduler {
    tests: Vec<TestSlot>,
    test_index: usize,
    divisions: Vec<CoreGroup>,
    division_index: usize,
    counter: u64,
    started: bool,
}

impl Scheduler {
    pub fn new(settings: &Settings, divisions: Vec<CoreGroup>) -> Result<Self> {
        if divisions.is_empty() {
            return Err(HarnessError::ConfigInvalid(
                "no core divisions resolved for this run".into(),
            ));
        }
        let tests = settings
            .tests
            .iter()
            .map(build_slot)
            .collect::<Result<Vec<_>>>()?;

        Ok(Scheduler {
            tests,
            test_index: 0,
            divisions,
            division_index: 0,
            counter: 0,
            started: false,
        })
    }

    /// Produce the next command to run, or `Exhausted` once every test's
    /// parameter space has been fully walked.
    pub fn next_command(&mut self) -> Result<ScheduledCommand> {
        if self.tests.is_empty() {
            return Err(HarnessError::Exhausted);
        }
        self.counter += 1;

        if self.started {
            self.test_index += 1;
            if self.test_index >= self.tests.len() {
                self.test_index = 0;
                self.division_index += 1;
                if self.division_index >= self.divisions.len() {
                    self.division_index = 0;
                    self.advance_all_odometers()?;
                }
            }
        } else {
            self.started = true;
        }

        let test = &self.tests[self.test_index];
        let params = test.odometer.current_params()?;
        let command_line = build_cmdline(&test.binary, &test.constants, &test.option_order, &params);
        let cores = self.divisions[self.division_index].cores.clone();

        Ok(ScheduledCommand {
            sequence: self.counter,
            test_name: test.name.clone(),
            command_line,
            cores,
        })
    }

    /// Advances every active test's odometer; tests whose odometer is
    /// now exhausted are dropped from rotation. Once all tests have
    /// dropped out, the run is complete.
    fn advance_all_odometers(&mut self) -> Result<()> {
        let mut still_active = Vec::with_capacity(self.tests.len());
        for mut slot in self.tests.drain(..) {
            match slot.odometer.bump() {
                Ok(()) => still_active.push(slot),
                Err(HarnessError::Exhausted) => {}
                Err(e) => return Err(e),
            }
        }
        if still_active.is_empty() {
            return Err(HarnessError::Exhausted);
        }
        self.tests = still_active;
        Ok(())
    }
}

fn build_slot(test: &TestConfig) -> Result<TestSlot> {
    let mut slots = Vec::new();
    let mut option_order = Vec::new();
    let mut constants = Vec::new();

    for arg in &test.arguments {
        if arg.is_constant {
            let literal = if arg.is_flag {
                String::new()
            } else {
                arg.values
                    .first()
                    .map(value_to_cmdline_string)
                    .unwrap_or_default()
            };
            constants.push((arg.cmdline_option.clone(), literal));
        } else {
            let iter = if arg.is_flag {
                ParamIter::Flag
            } else {
                ParamIter::List(arg.values.clone())
            };
            slots.push((arg.cmdline_option.clone(), iter));
            option_order.push((arg.cmdline_option.clone(), arg.is_flag));
        }
    }

    // The odometer is little-endian (`slots[0]` fastest-varying), but the
    // original rebuilds its iterator chain so the LAST-declared arg ends
    // up triggering fastest (ParamFactory.py: `self._triggerIter` is set
    // from the last-built `prevIter`). Reverse declaration order here so
    // `slots[0]` is the last-declared arg, matching that behavior.
    slots.reverse();

    Ok(TestSlot {
        name: test.name.clone(),
        binary: test.binary.clone(),
        option_order,
        constants,
        odometer: Odometer::new(slots),
    })
}

fn value_to_cmdline_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_cmdline(
    binary: &str,
    constants: &[(String, String)],
    option_order: &[(String, bool)],
    params: &HashMap<String, serde_json::Value>,
) -> String {
    let mut cmdline = binary.to_string();
    for (option, literal) in constants {
        if literal.is_empty() {
            cmdline.push_str(&format!(" {option}"));
        } else {
            cmdline.push_str(&format!(" {option} {literal}"));
        }
    }
    for (option, is_flag) in option_order {
        let Some(value) = params.get(option) else {
            continue;
        };
        if *is_flag {
            cmdline.push_str(&format!(" {option}"));
        } else {
            cmdline.push_str(&format!(" {option} {}", value_to_cmdline_string(value)));
        }
    }
    cmdline
}
