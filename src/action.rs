//! Units of analysis (component table "Action/Rule — Unit of
//! analysis; Rule is opcode-dispatched, Action is whole-function") and the
//! fixed-order scheduler that drives them over one `Funcdata`: actions run
//! to completion in a fixed order.

use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Result;

use crate::error::RuleAction;
use crate::funcdata::Funcdata;
use crate::opcode::OpCode;
use crate::pcodeop::OpId;

/// A whole-function analysis pass. Reads the current graph, proposes edits,
/// and commits them through `Funcdata`'s editing primitives.
pub trait Action {
    fn name(&self) -> &str;
    fn apply(&self, f: &mut Funcdata) -> Result<RuleAction>;
}

/// An opcode-dispatched rewrite applied to one op at a time. Returning
/// `RuleAction::NONE` means the pattern did not match at `op` — a
/// recoverable analysis failure, not an error.
pub trait Rule {
    fn name(&self) -> &str;
    fn opcodes(&self) -> &[OpCode];
    fn apply(&self, f: &mut Funcdata, op: OpId) -> Result<RuleAction>;
}

/// Dispatches a set of `Rule`s by opcode over every live op, and doubles as
/// an `Action` that runs its rules to a fixpoint ("applying
/// conditional-execution on a function is a fixpoint: a second run performs
/// zero changes" generalizes to every rule pool).
pub struct RulePool {
    name: String,
    rules: HashMap<OpCode, Vec<Rc<dyn Rule>>>,
}

impl RulePool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), rules: HashMap::new() }
    }

    pub fn register(&mut self, rule: Rc<dyn Rule>) {
        for &opcode in rule.opcodes() {
            self.rules.entry(opcode).or_default().push(rule.clone());
        }
    }

    /// Runs every registered rule once over each currently-alive op whose
    /// opcode it's registered for, in bank-iteration order. A rule that
    /// destroys `op_id` stops the remaining rules for that op from firing
    /// this round, since there's nothing left to apply them to.
    pub fn apply_once(&self, f: &mut Funcdata) -> Result<RuleAction> {
        let mut total = RuleAction::NONE;
        let ops: Vec<OpId> = f.bank().iter_alive().collect();
        for op_id in ops {
            let Some(op) = f.op(op_id) else { continue };
            let opcode = op.opcode;
            let Some(rules) = self.rules.get(&opcode) else { continue };
            for rule in rules {
                if f.op(op_id).is_none() {
                    break;
                }
                total += rule.apply(f, op_id)?;
            }
        }
        Ok(total)
    }
}

impl Action for RulePool {
    fn name(&self) -> &str {
        &self.name
    }

    /// Runs `apply_once` to a fixpoint: each call goes back over the whole
    /// live-op set until a round makes no change. Each rewrite must leave
    /// the graph in a consistent SSA state before returning.
    fn apply(&self, f: &mut Funcdata) -> Result<RuleAction> {
        let mut total = RuleAction::NONE;
        loop {
            let delta = self.apply_once(f)?;
            if !delta.did_anything() {
                break;
            }
            total += delta;
        }
        Ok(total)
    }
}

/// Runs a fixed-order list of `Action`s over one `Funcdata`. The
/// driver may abandon a run between actions; whatever a completed action
/// committed stays valid, since each action leaves the graph SSA-consistent
/// before returning.
pub struct Scheduler {
    actions: Vec<Box<dyn Action>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { actions: Vec::new() }
    }

    pub fn add(&mut self, action: Box<dyn Action>) {
        self.actions.push(action);
    }

    pub fn run(&self, f: &mut Funcdata) -> Result<RuleAction> {
        let mut total = RuleAction::NONE;
        for action in &self.actions {
            log::debug!("running action {}", action.name());
            let delta = action.apply(f)?;
            log::debug!("action {} made {} change(s)", action.name(), delta.count());
            total += delta;
        }
        Ok(total)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::space::{Address, SpaceIndex};

    fn addr(off: u64) -> Address {
        Address::new(SpaceIndex(0), off)
    }

    /// A rule that fires exactly `remaining` times total, then reports no
    /// further matches — models a rewrite that converges to a fixpoint.
    struct CountdownRule {
        remaining: Cell<u32>,
    }

    impl Rule for CountdownRule {
        fn name(&self) -> &str {
            "countdown"
        }
        fn opcodes(&self) -> &[OpCode] {
            &[OpCode::Copy]
        }
        fn apply(&self, _f: &mut Funcdata, _op: OpId) -> Result<RuleAction> {
            if self.remaining.get() == 0 {
                return Ok(RuleAction::NONE);
            }
            self.remaining.set(self.remaining.get() - 1);
            Ok(RuleAction::made(1))
        }
    }

    #[test]
    fn rule_pool_runs_to_fixpoint_then_goes_quiet() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        f.create_op(b, 0, addr(0), 0, OpCode::Copy, 1).unwrap();

        let mut pool = RulePool::new("countdown-pool");
        pool.register(Rc::new(CountdownRule { remaining: Cell::new(2) }));

        let first = pool.apply(&mut f).unwrap();
        assert_eq!(first.count(), 2);
        let second = pool.apply(&mut f).unwrap();
        assert!(!second.did_anything());
    }

    #[test]
    fn scheduler_runs_actions_in_order_and_sums_changes() {
        let mut f = Funcdata::new("t", 8);
        let b = f.blocks.create_block();
        f.create_op(b, 0, addr(0), 0, OpCode::Copy, 1).unwrap();

        let mut pool = RulePool::new("once");
        pool.register(Rc::new(CountdownRule { remaining: Cell::new(1) }));

        let mut scheduler = Scheduler::new();
        scheduler.add(Box::new(pool));
        let total = scheduler.run(&mut f).unwrap();
        assert_eq!(total.count(), 1);
    }
}
