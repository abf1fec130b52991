//! Static typing of formulas against the schema.

use super::{BinaryOp, Formula, VarTypes};
use crate::engine::model::Evaluator;
use crate::engine::schema::Schema;
use crate::engine::store::FamilyStore;
use crate::engine::types::{Type, common_supertype, is_subtype};
use crate::engine::value::ColumnId;
use crate::error::{Result, validation};

/// Fail unless `actual` can be used where `expected` is wanted.
pub(crate) fn val_expect_type(what: &str, actual: &Type, expected: &Type) -> Result<()> {
    if !is_subtype(actual, expected) {
        return Err(validation(format!(
            "{} has type '{}', wanted '{}'",
            what, actual, expected
        )));
    }
    Ok(())
}

pub(crate) fn check_column_exists(schema: &Schema, id: &ColumnId) -> Result<()> {
    if !schema.contains(id) {
        return Err(validation(format!("No column exists with ID '{}'", id)));
    }
    Ok(())
}

/// Value type of a column when a formula reads its values.
pub(crate) fn read_column_type_for_formula<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    column: &ColumnId,
) -> Result<Type> {
    let schema = ev.schema;
    let ty = ev.typecheck_column(column)?;
    if ty == Type::Error {
        return Err(validation(format!(
            "Reference to column '{}' of unknown type.  Correct its formula or manually specify the type if needed to break a cycle.",
            schema.stringify_column_ref(&crate::engine::schema::ColumnRef::new(column.clone(), true))
        )));
    }
    if ty == Type::Token {
        return Err(validation(format!(
            "Attempted to access keys of unkeyed object type '{}'.",
            schema.stringify_column_ref(&crate::engine::schema::ColumnRef::new(column.clone(), false))
        )));
    }
    Ok(ty)
}

/// Typecheck a subformula that must produce cells. Returns their column.
pub(crate) fn typecheck_cells<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    formula: &Formula,
) -> Result<ColumnId> {
    let ty = typecheck_formula(ev, vars, formula)?;
    match ty {
        Type::Reference(column) => Ok(column),
        other => Err(validation(format!(
            "Expected a set of cells, got set of '{}'",
            ev.schema.stringify_type(&other)
        ))),
    }
}

/// Typecheck a formula. Assumes it has passed [`validate_formula`](super::validate_formula).
pub fn typecheck_formula<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    formula: &Formula,
) -> Result<Type> {
    let schema = ev.schema;
    match formula {
        Formula::Lit { ty, .. } => {
            if let Type::Reference(column) = ty {
                check_column_exists(schema, column)?;
            }
            Ok(ty.clone())
        }
        Formula::Date(_) => Ok(Type::Date),
        Formula::Var(name) => match vars.get(name) {
            None => Err(validation(format!("Undefined variable {}", name))),
            Some(Type::Error) => Err(validation(format!(
                "Variable '{}' cannot be read because it does not have a known type at this point.",
                name
            ))),
            Some(ty) => Ok(ty.clone()),
        },
        Formula::Up {
            start,
            column,
            want_values,
        } => {
            let start_column = typecheck_cells(ev, vars, start)?;
            check_column_exists(schema, column)?;
            let (up_path, down_path) = schema.find_common_ancestor_paths(&start_column, column)?;
            if down_path.len() != 1 {
                return Err(validation(format!(
                    "Navigation from {} to {} is not up",
                    start_column, column
                )));
            }
            if *want_values && up_path.len() != 1 {
                return Err(validation(
                    "Direct navigation up to a key of a parent object is not allowed.",
                ));
            }
            if *want_values {
                read_column_type_for_formula(ev, column)
            } else {
                Ok(Type::Reference(column.clone()))
            }
        }
        Formula::Down {
            start,
            column,
            keys,
            want_values,
        } => {
            let start_column = typecheck_cells(ev, vars, start)?;
            check_column_exists(schema, column)?;
            let keys_type = match keys {
                Some(keys) => Some(typecheck_formula(ev, vars, keys)?),
                None => None,
            };
            let target = schema.column(column)?;
            if target.parent.as_ref() != Some(&start_column) {
                return Err(validation(format!(
                    "Navigation from {} to {} is not down",
                    start_column, column
                )));
            }
            if !*want_values && !target.is_object {
                return Err(validation("Target column has no object type to navigate to."));
            }
            if let Some(keys_type) = keys_type {
                if *want_values {
                    return Err(validation("Can only specify keys when navigating to objects."));
                }
                let key_type = read_column_type_for_formula(ev, column)?;
                val_expect_type("Key set", &keys_type, &key_type)?;
            }
            if *want_values {
                read_column_type_for_formula(ev, column)
            } else {
                Ok(Type::Reference(column.clone()))
            }
        }
        Formula::If {
            condition,
            then_branch,
            else_branch,
        } => {
            let condition_type = typecheck_formula(ev, vars, condition)?;
            let then_type = typecheck_formula(ev, vars, then_branch)?;
            let else_type = typecheck_formula(ev, vars, else_branch)?;
            val_expect_type("if condition", &condition_type, &Type::Bool)?;
            let ty = common_supertype(&then_type, &else_type);
            if ty == Type::Error {
                return Err(validation(format!(
                    "Mismatched types in if branches: '{}' and '{}'",
                    schema.stringify_type(&then_type),
                    schema.stringify_type(&else_type)
                )));
            }
            Ok(ty)
        }
        Formula::Count(domain) => {
            typecheck_formula(ev, vars, domain)?;
            Ok(Type::Number)
        }
        Formula::OneOf(domain) => typecheck_formula(ev, vars, domain),
        Formula::Filter { domain, predicate } => {
            let domain_type = typecheck_formula(ev, vars, domain)?;
            let inner = vars.update(predicate.var.clone(), domain_type.clone());
            let predicate_type = typecheck_formula(ev, &inner, &predicate.body)?;
            val_expect_type("Predicate", &predicate_type, &Type::Bool)?;
            Ok(domain_type)
        }
        Formula::Sum { domain, addend } => {
            let domain_type = typecheck_formula(ev, vars, domain)?;
            let inner = vars.update(addend.var.clone(), domain_type);
            let addend_type = typecheck_formula(ev, &inner, &addend.body)?;
            val_expect_type("Element of 'sum'", &addend_type, &Type::Number)?;
            Ok(Type::Number)
        }
        Formula::Binary { op, lhs, rhs } => {
            let lhs_type = typecheck_formula(ev, vars, lhs)?;
            let rhs_type = typecheck_formula(ev, vars, rhs)?;
            typecheck_binary(schema, *op, &lhs_type, &rhs_type)
        }
        Formula::Neg(arg) => {
            let ty = typecheck_formula(ev, vars, arg)?;
            val_expect_type("Operand of unary '-'", &ty, &Type::Number)?;
            Ok(Type::Number)
        }
        Formula::Not(arg) => {
            let ty = typecheck_formula(ev, vars, arg)?;
            val_expect_type("Operand of '!'", &ty, &Type::Bool)?;
            Ok(Type::Bool)
        }
        Formula::Union(parts) => {
            let mut so_far = Type::Empty;
            for part in parts {
                let part_type = typecheck_formula(ev, vars, part)?;
                let joined = common_supertype(&so_far, &part_type);
                if joined == Type::Error {
                    return Err(validation(format!(
                        "Mismatched types in list: '{}' and '{}'",
                        schema.stringify_type(&so_far),
                        schema.stringify_type(&part_type)
                    )));
                }
                so_far = joined;
            }
            Ok(so_far)
        }
        Formula::ToText(arg) => {
            typecheck_formula(ev, vars, arg)?;
            Ok(Type::Text)
        }
        Formula::Dummy => Ok(Type::Empty),
    }
}

/// Whether both operands fit the `(expected, expected)` alternative of an overload.
pub(crate) fn both_fit(lhs: &Type, rhs: &Type, expected: &Type) -> bool {
    is_subtype(lhs, expected) && is_subtype(rhs, expected)
}

fn typecheck_binary(schema: &Schema, op: BinaryOp, lhs: &Type, rhs: &Type) -> Result<Type> {
    let symbol = op.symbol();
    let singleton = |expected: Type, result: Type| -> Result<Type> {
        val_expect_type(&format!("Left operand of '{}'", symbol), lhs, &expected)?;
        val_expect_type(&format!("Right operand of '{}'", symbol), rhs, &expected)?;
        Ok(result)
    };
    match op {
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::In => {
            if common_supertype(lhs, rhs) == Type::Error {
                return Err(validation(format!(
                    "Mismatched types to '{}' operator: '{}' and '{}'",
                    symbol,
                    schema.stringify_type(lhs),
                    schema.stringify_type(rhs)
                )));
            }
            Ok(Type::Bool)
        }
        BinaryOp::Plus => {
            if both_fit(lhs, rhs, &Type::Number) {
                Ok(Type::Number)
            } else {
                Ok(Type::Text)
            }
        }
        BinaryOp::Minus | BinaryOp::Times | BinaryOp::Divide | BinaryOp::Pow => {
            singleton(Type::Number, Type::Number)
        }
        BinaryOp::And | BinaryOp::Or => singleton(Type::Bool, Type::Bool),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if both_fit(lhs, rhs, &Type::Number) || both_fit(lhs, rhs, &Type::Date) {
                Ok(Type::Bool)
            } else {
                Err(no_alternative(schema, op, lhs, rhs))
            }
        }
    }
}

pub(crate) fn no_alternative(
    schema: &Schema,
    op: BinaryOp,
    lhs: &Type,
    rhs: &Type,
) -> crate::error::EngineError {
    validation(format!(
        "No valid alternative of '{}' for argument types '{}', '{}'",
        op.symbol(),
        schema.stringify_type(lhs),
        schema.stringify_type(rhs)
    ))
}

/// Typecheck for display purposes. Failures give `empty`.
pub fn try_typecheck_formula<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    formula: &Formula,
) -> Type {
    typecheck_formula(ev, vars, formula).unwrap_or(Type::Empty)
}
