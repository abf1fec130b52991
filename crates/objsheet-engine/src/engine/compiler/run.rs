//! Interpreter for fused IR.

use std::collections::BTreeSet;

use super::{Stmt, Sym};
use crate::engine::formula::read_family_for_formula;
use crate::engine::model::Evaluator;
use crate::engine::store::FamilyStore;
use crate::engine::value::{QFamilyId, Value};
use crate::error::{Result, internal};

#[derive(Debug, Clone, Default)]
enum Reg {
    #[default]
    Unset,
    Value(Value),
    Set(BTreeSet<Value>),
}

pub(crate) struct Machine<'m, 'a, S: FamilyStore> {
    ev: &'m mut Evaluator<'a, S>,
    regs: Vec<Reg>,
    result: Option<BTreeSet<Value>>,
}

impl<'m, 'a, S: FamilyStore> Machine<'m, 'a, S> {
    pub(crate) fn new(ev: &'m mut Evaluator<'a, S>, size: usize) -> Self {
        Machine {
            ev,
            regs: vec![Reg::Unset; size],
            result: None,
        }
    }

    pub(crate) fn bind_set(&mut self, sym: Sym, set: BTreeSet<Value>) {
        self.regs[sym.0] = Reg::Set(set);
    }

    /// Run top-level code, which must yield exactly one collected set.
    pub(crate) fn run(mut self, code: &[Stmt]) -> Result<BTreeSet<Value>> {
        self.exec(code)?;
        self.result
            .ok_or_else(|| internal("compiled formula yielded no result"))
    }

    fn value(&self, sym: Sym) -> Result<&Value> {
        match &self.regs[sym.0] {
            Reg::Value(v) => Ok(v),
            _ => Err(internal("compiled formula read a non-value register")),
        }
    }

    fn set(&self, sym: Sym) -> Result<&BTreeSet<Value>> {
        match &self.regs[sym.0] {
            Reg::Set(s) => Ok(s),
            _ => Err(internal("compiled formula read a non-set register")),
        }
    }

    fn set_mut(&mut self, sym: Sym) -> Result<&mut BTreeSet<Value>> {
        match &mut self.regs[sym.0] {
            Reg::Set(s) => Ok(s),
            _ => Err(internal("compiled formula wrote a non-set register")),
        }
    }

    fn cell(&self, sym: Sym) -> Result<&crate::engine::value::CellId> {
        self.value(sym)?
            .as_cell()
            .ok_or_else(|| internal("compiled navigation reached a non-cell value"))
    }

    fn each(&mut self, bind: Sym, values: impl IntoIterator<Item = Value>, body: &[Stmt]) -> Result<()> {
        for v in values {
            self.regs[bind.0] = Reg::Value(v);
            self.exec(body)?;
        }
        Ok(())
    }

    fn exec(&mut self, code: &[Stmt]) -> Result<()> {
        for stmt in code {
            match stmt {
                Stmt::Each { .. } => return Err(internal("unsubstituted hole in compiled formula")),
                Stmt::Yield(sym) => {
                    let set = self.set(*sym)?.clone();
                    self.result = Some(set);
                }
                Stmt::NewSet(sym) => self.regs[sym.0] = Reg::Set(BTreeSet::new()),
                Stmt::Insert { set, value } => {
                    let v = self.value(*value)?.clone();
                    self.set_mut(*set)?.insert(v);
                }
                Stmt::ForLit { values, bind, body } => self.each(*bind, values.iter().cloned(), body)?,
                Stmt::ForVar { var, bind, body } => {
                    let values = self.set(*var)?.clone();
                    self.each(*bind, values, body)?;
                }
                Stmt::ForFamily {
                    column,
                    cell,
                    bind,
                    body,
                } => {
                    let family = QFamilyId::new(column.clone(), self.cell(*cell)?.clone());
                    let values = read_family_for_formula(self.ev, &family)?.set;
                    self.each(*bind, values, body)?;
                }
                Stmt::Truncate { cell, levels, dst } => {
                    let cell = self.cell(*cell)?;
                    let truncated = cell.truncate(cell.len().saturating_sub(*levels));
                    self.regs[dst.0] = Reg::Value(Value::Ref(truncated));
                }
                Stmt::LastStep { cell, levels, dst } => {
                    let cell = self.cell(*cell)?;
                    let depth = cell.len().saturating_sub(*levels);
                    let key = depth
                        .checked_sub(1)
                        .and_then(|i| cell.steps().get(i))
                        .cloned()
                        .ok_or_else(|| internal("compiled up navigation reached the root"))?;
                    self.regs[dst.0] = Reg::Value(key);
                }
                Stmt::Extend { cell, value, dst } => {
                    let child = self.cell(*cell)?.child(self.value(*value)?.clone());
                    self.regs[dst.0] = Reg::Value(Value::Ref(child));
                }
                Stmt::Dedup { seen, value, body } => {
                    let v = self.value(*value)?.clone();
                    if self.set_mut(*seen)?.insert(v) {
                        self.exec(body)?;
                    }
                }
                Stmt::IfContains { set, value, body } => {
                    if self.set(*set)?.contains(self.value(*value)?) {
                        self.exec(body)?;
                    }
                }
                Stmt::IfTrue { cond, body } => {
                    if *self.value(*cond)? == Value::Bool(true) {
                        self.exec(body)?;
                    }
                }
                Stmt::BindVar { var, value } => {
                    let v = self.value(*value)?.clone();
                    self.regs[var.0] = Reg::Set(BTreeSet::from([v]));
                }
                Stmt::SetEq { lhs, rhs, dst } => {
                    let equal = self.set(*lhs)? == self.set(*rhs)?;
                    self.regs[dst.0] = Reg::Value(Value::Bool(equal));
                }
            }
        }
        Ok(())
    }
}
