//! Stored procedures and canned transactions.

use std::collections::{BTreeMap, BTreeSet};

use objsheet_engine::EngineError;
use objsheet_engine::engine::{
    Evaluator, Param, Procedure, Type, TypedSet, Value, VarValues, execute_procedure,
    parse_procedure, parse_value, stringify_procedure, typecheck_procedure,
};
use serde_json::Value as Json;
use tracing::{debug, info};

use super::Sheet;
use crate::error::{Result, SheetError};
use crate::storage::TransactionCells;

/// A parameter as written by a user: name, type text, singular.
pub type ParamSpec<'a> = (&'a str, &'a str, bool);

impl Sheet {
    /// Parse and store a procedure, replacing any procedure of the same name.
    pub fn define_procedure(&mut self, name: &str, params: &[ParamSpec<'_>], body: &str) -> Result<()> {
        let params = params
            .iter()
            .map(|(param, ty, singular)| {
                Ok(Param::new(*param, self.schema.parse_type_str(ty)?, *singular))
            })
            .collect::<Result<Vec<_>>>()?;
        let procedure = parse_procedure(&mut self.evaluator(), name, params, body)?;
        if self.procedures.insert(name.to_string(), procedure).is_some() {
            debug!(procedure = name, "replaced procedure");
        }
        Ok(())
    }

    pub fn delete_procedure(&mut self, name: &str) -> Result<()> {
        self.procedures
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SheetError::NoSuchProcedure(name.to_string()))
    }

    pub fn procedure(&self, name: &str) -> Option<&Procedure> {
        self.procedures.get(name)
    }

    pub fn procedure_names(&self) -> impl Iterator<Item = &str> {
        self.procedures.keys().map(String::as_str)
    }

    /// The canonical source text of a stored procedure body.
    pub fn procedure_text(&mut self, name: &str) -> Result<String> {
        let procedure = self
            .procedures
            .get(name)
            .cloned()
            .ok_or_else(|| SheetError::NoSuchProcedure(name.to_string()))?;
        Ok(stringify_procedure(&mut self.evaluator(), &procedure)?)
    }

    /// Convert a JSON argument to values of the parameter's type.
    ///
    /// Arrays give several values. Strings go through the same parser as
    /// typed-in cell text, so a reference is named by its display text.
    pub fn argument_from_json(&mut self, procedure: &str, param: &str, json: &Json) -> Result<Vec<Value>> {
        let ty = self
            .procedures
            .get(procedure)
            .ok_or_else(|| SheetError::NoSuchProcedure(procedure.to_string()))?
            .params
            .iter()
            .find(|p| p.name == param)
            .map(|p| p.ty.clone())
            .ok_or_else(|| {
                SheetError::BadArgument(format!("'{}' has no parameter '{}'", procedure, param))
            })?;
        let items = match json {
            Json::Array(items) => items.as_slice(),
            single => std::slice::from_ref(single),
        };
        let mut ev = self.evaluator();
        items
            .iter()
            .map(|item| {
                let text = match (item, &ty) {
                    (Json::String(s), _) => s.clone(),
                    (Json::Bool(b), Type::Bool) => b.to_string(),
                    (Json::Number(n), Type::Number) => n.to_string(),
                    _ => {
                        return Err(SheetError::BadArgument(format!(
                            "{} is not a value of type '{}'",
                            item,
                            ev.schema.stringify_type(&ty)
                        )));
                    }
                };
                parse_value(&mut ev, &ty, &text).map_err(|e| SheetError::BadArgument(e.message()))
            })
            .collect()
    }

    /// Run a stored procedure as one transaction.
    ///
    /// The procedure runs against an overlay of the store, followed by a full
    /// re-evaluation. Only if both succeed are the changes applied; a failed
    /// `check` or any other runtime failure leaves the sheet untouched.
    pub fn execute_canned_transaction(
        &mut self,
        name: &str,
        args: BTreeMap<String, Vec<Value>>,
    ) -> Result<()> {
        let procedure = self
            .procedures
            .get(name)
            .cloned()
            .ok_or_else(|| SheetError::NoSuchProcedure(name.to_string()))?;

        typecheck_procedure(&mut self.evaluator(), &procedure).map_err(|e| match e {
            EngineError::Validation(e) => SheetError::ProcedureIllTyped {
                name: name.to_string(),
                message: e.0,
            },
            other => other.into(),
        })?;

        let mut vars = VarValues::new();
        for param in &procedure.params {
            let values = args.get(&param.name).ok_or_else(|| {
                SheetError::BadArgument(format!("missing argument '{}'", param.name))
            })?;
            if param.singular && values.len() != 1 {
                return Err(SheetError::BadArgument(format!(
                    "'{}' takes exactly one value, got {}",
                    param.name,
                    values.len()
                )));
            }
            let set: BTreeSet<Value> = values.iter().cloned().collect();
            vars.insert(param.name.clone(), TypedSet::new(param.ty.clone(), set));
        }
        if let Some(extra) = args.keys().find(|k| !procedure.params.iter().any(|p| &p.name == *k)) {
            return Err(SheetError::BadArgument(format!("unknown argument '{}'", extra)));
        }

        self.run_transaction(name, |ev| {
            execute_procedure(ev, &procedure, vars)?;
            ev.evaluate_all()
        })
    }

    /// Run `body` against a fresh overlay of the store and commit its writes
    /// only if it succeeds.
    pub(crate) fn run_transaction<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce(&mut Evaluator<'_, TransactionCells>) -> objsheet_engine::Result<()>,
    {
        let mut overlay = TransactionCells::new(self.store.clone());
        let outcome = {
            let mut ev = Evaluator::new(&self.schema, &mut self.engine, &mut overlay, &self.settings);
            body(&mut ev)
        };
        match outcome {
            Ok(()) => {
                let families = overlay.commit();
                info!(procedure = name, families, "transaction committed");
                Ok(())
            }
            Err(EngineError::Evaluation(e)) => {
                info!(procedure = name, error = %e, "transaction rolled back");
                Err(SheetError::TransactionFailed(e.0))
            }
            Err(other) => {
                info!(procedure = name, pending = overlay.pending(), error = %other, "transaction rolled back");
                Err(other.into())
            }
        }
    }
}
