//! Procedure typechecking against the current schema.

use super::{Procedure, Statement, merge_type_maps};
use crate::engine::formula::{
    Formula, VarTypes, check_column_exists, typecheck_formula, val_expect_type,
};
use crate::engine::model::Evaluator;
use crate::engine::store::FamilyStore;
use crate::engine::types::Type;
use crate::error::{Result, validation};

/// Typecheck every statement. Procedures are rechecked before each run since
/// the schema may have changed since they were defined.
pub fn typecheck_procedure<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    procedure: &Procedure,
) -> Result<()> {
    let mut vars = VarTypes::new();
    for param in &procedure.params {
        if let Type::Reference(column) = &param.ty {
            check_column_exists(ev.schema, column)?;
        }
        vars.insert(param.name.clone(), param.ty.clone());
    }
    typecheck_statements(ev, &mut vars, &procedure.body)
}

pub(crate) fn typecheck_statements<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &mut VarTypes,
    body: &[Statement],
) -> Result<()> {
    for statement in body {
        typecheck_statement(ev, vars, statement)?;
    }
    Ok(())
}

/// Type of a mutation target, which must not be a formula column.
fn typecheck_family_ref<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    target: &Formula,
) -> Result<Type> {
    let ty = typecheck_formula(ev, vars, target)?;
    if let Formula::Down { column, .. } = target {
        if ev.schema.column(column)?.formula.is_some() {
            return Err(validation("Cannot mutate a formula column."));
        }
    }
    Ok(ty)
}

fn typecheck_statement<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &mut VarTypes,
    statement: &Statement,
) -> Result<()> {
    match statement {
        Statement::Let { var, value } => {
            let ty = typecheck_formula(ev, vars, value)?;
            vars.insert(var.clone(), ty);
        }
        Statement::Set { target, value } => {
            let target_type = typecheck_family_ref(ev, vars, target)?;
            let value_type = typecheck_formula(ev, vars, value)?;
            val_expect_type("Right operand of ':='", &value_type, &target_type)?;
        }
        Statement::Add { target, value } => {
            let target_type = typecheck_family_ref(ev, vars, target)?;
            let value_type = typecheck_formula(ev, vars, value)?;
            val_expect_type("Right operand of 'add'", &value_type, &target_type)?;
        }
        Statement::Remove { target, value } => {
            let target_type = typecheck_family_ref(ev, vars, target)?;
            let value_type = typecheck_formula(ev, vars, value)?;
            val_expect_type("Right operand of 'remove'", &value_type, &target_type)?;
        }
        Statement::If {
            condition,
            then_body,
            else_body,
        } => {
            let condition_type = typecheck_formula(ev, vars, condition)?;
            val_expect_type("if condition", &condition_type, &Type::Bool)?;
            let mut then_vars = vars.clone();
            typecheck_statements(ev, &mut then_vars, then_body)?;
            let mut else_vars = vars.clone();
            typecheck_statements(ev, &mut else_vars, else_body)?;
            *vars = merge_type_maps(&then_vars, &else_vars);
        }
        Statement::Foreach { var, domain, body } => {
            let domain_type = typecheck_formula(ev, vars, domain)?;
            let mut body_vars = vars.update(var.clone(), domain_type);
            typecheck_statements(ev, &mut body_vars, body)?;
        }
        Statement::Delete(objects) => {
            let ty = typecheck_formula(ev, vars, objects)?;
            if !ty.is_reference() {
                return Err(validation(format!(
                    "Expected a set of cells, got set of '{}'",
                    ty
                )));
            }
        }
        Statement::New { var, target } | Statement::Make { var, target } => {
            let ty = typecheck_family_ref(ev, vars, target)?;
            if let Some(var) = var {
                vars.insert(var.clone(), ty);
            }
        }
        Statement::Check(condition) => {
            let ty = typecheck_formula(ev, vars, condition)?;
            val_expect_type("check condition", &ty, &Type::Bool)?;
        }
    }
    Ok(())
}
