//! Procedure validation: variable scoping and mutation target shape.
//!
//! Two name sets are threaded through the statements: every name in scope
//! (nothing may shadow one of these) and the names assignable in the current
//! block. Branches of an `if` are checked on copies, so both may introduce
//! the same name; a `foreach` body starts a fresh block.

use im::HashSet;

use super::{FamilyRefKind, Procedure, Statement};
use crate::engine::formula::{Formula, validate_formula};
use crate::engine::schema::Schema;
use crate::error::{Result, validation};

type Names = HashSet<String>;

/// Check parameter names and statement scoping.
pub fn validate_procedure(schema: &Schema, procedure: &Procedure) -> Result<()> {
    let mut current = Names::new();
    for param in &procedure.params {
        if current.contains(&param.name) {
            return Err(validation(format!("Duplicate parameter name {}", param.name)));
        }
        current.insert(param.name.clone());
    }
    let mut vars = current.clone();
    validate_statements(schema, &mut vars, &mut current, &procedure.body)
}

fn validate_statements(
    schema: &Schema,
    vars: &mut Names,
    current: &mut Names,
    body: &[Statement],
) -> Result<()> {
    for statement in body {
        validate_statement(schema, vars, current, statement)?;
    }
    Ok(())
}

/// Make `name` assignable, unless that would shadow an outer variable.
fn validate_assignment(vars: &mut Names, current: &mut Names, name: &str) -> Result<()> {
    if !current.contains(name) {
        if vars.contains(name) {
            return Err(validation(format!(
                "Assignment to {} shadows a variable defined outside the current scope (foreach block).",
                name
            )));
        }
        current.insert(name.to_string());
        vars.insert(name.to_string());
    }
    Ok(())
}

pub(crate) fn validate_family_ref(
    schema: &Schema,
    vars: &Names,
    kind: FamilyRefKind,
    target: &Formula,
) -> Result<()> {
    validate_formula(vars, target)?;
    let Formula::Down {
        column,
        keys,
        want_values,
        ..
    } = target
    else {
        return Err(validation("Family reference must be a down navigation."));
    };
    let col = schema.column(column)?;
    if col.is_object != kind.want_object() || *want_values == kind.want_object() {
        return Err(validation(if kind.want_object() {
            "new/make only work on object families."
        } else {
            "set/add/remove only work on leaf families."
        }));
    }
    if keys.is_some() != kind.want_keys() {
        return Err(validation(if kind.want_keys() {
            "make requires a subscript expression."
        } else {
            "A subscript expression is not allowed."
        }));
    }
    Ok(())
}

fn validate_statement(
    schema: &Schema,
    vars: &mut Names,
    current: &mut Names,
    statement: &Statement,
) -> Result<()> {
    match statement {
        Statement::Let { var, value } => {
            validate_formula(vars, value)?;
            validate_assignment(vars, current, var)
        }
        Statement::Set { target, value }
        | Statement::Add { target, value }
        | Statement::Remove { target, value } => {
            validate_family_ref(schema, vars, FamilyRefKind::Leaf, target)?;
            validate_formula(vars, value)
        }
        Statement::If {
            condition,
            then_body,
            else_body,
        } => {
            validate_formula(vars, condition)?;
            let mut assigned = Vec::new();
            for branch in [then_body, else_body] {
                let mut branch_vars = vars.clone();
                let mut branch_current = current.clone();
                validate_statements(schema, &mut branch_vars, &mut branch_current, branch)?;
                assigned.push(branch_current);
            }
            for name in assigned.into_iter().flatten() {
                current.insert(name.clone());
                vars.insert(name);
            }
            Ok(())
        }
        Statement::Foreach { var, domain, body } => {
            validate_formula(vars, domain)?;
            if vars.contains(var) {
                return Err(validation(format!(
                    "foreach binding of {} shadows a variable defined outside the current scope (foreach block).",
                    var
                )));
            }
            let mut body_vars = vars.update(var.clone());
            let mut body_current = Names::unit(var.clone());
            validate_statements(schema, &mut body_vars, &mut body_current, body)
        }
        Statement::Delete(objects) => validate_formula(vars, objects),
        Statement::New { var, target } | Statement::Make { var, target } => {
            let kind = if matches!(statement, Statement::New { .. }) {
                FamilyRefKind::New
            } else {
                FamilyRefKind::Make
            };
            validate_family_ref(schema, vars, kind, target)?;
            match var {
                Some(var) => validate_assignment(vars, current, var),
                None => Ok(()),
            }
        }
        Statement::Check(condition) => validate_formula(vars, condition),
    }
}
