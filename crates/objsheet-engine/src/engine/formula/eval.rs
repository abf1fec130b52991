//! Formula evaluation.

use std::collections::BTreeSet;

use super::typecheck::{both_fit, no_alternative};
use super::{BinaryOp, Formula};
use crate::engine::model::Evaluator;
use crate::engine::schema::ColumnRef;
use crate::engine::store::FamilyStore;
use crate::engine::text::{parse_date, tset_to_text, value_to_text_ignore_errors};
use crate::engine::types::{Type, TypedSet};
use crate::engine::value::{CellId, ColumnId, QFamilyId, Value};
use crate::error::{Result, evaluation, internal};

/// Variable name to bound value.
pub type VarValues = im::HashMap<String, TypedSet>;

/// Evaluate a family on behalf of a formula. A family that failed, or is
/// still being evaluated, is an evaluation error.
pub fn read_family_for_formula<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    family: &QFamilyId,
) -> Result<TypedSet> {
    if let Some(tset) = ev.evaluate_family(family)? {
        return Ok(tset);
    }
    let schema = ev.schema;
    let col = schema.column(&family.column)?;
    let parent = col
        .parent
        .clone()
        .ok_or_else(|| internal("the root column has no families"))?;
    let object = value_to_text_ignore_errors(
        ev,
        &Type::Reference(parent),
        &Value::Ref(family.parent.clone()),
    );
    Err(evaluation(format!(
        "Reference to column '{}' of object '{}', which failed to evaluate",
        schema.stringify_column_ref(&ColumnRef::new(family.column.clone(), !col.is_object)),
        object
    )))
}

/// Replace each cell with its key, typed as the column's values.
pub(crate) fn get_values<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    column: &ColumnId,
    cells: impl IntoIterator<Item = CellId>,
) -> Result<TypedSet> {
    let ty = ev.typecheck_column(column)?;
    let set = cells
        .into_iter()
        .filter_map(|c| c.last_step().cloned())
        .collect();
    Ok(TypedSet::new(ty, set))
}

fn navigation_result<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    column: &ColumnId,
    cells: BTreeSet<CellId>,
    want_values: bool,
) -> Result<TypedSet> {
    if want_values {
        get_values(ev, column, cells)
    } else {
        Ok(TypedSet::cells(column.clone(), cells))
    }
}

fn single_number(tset: &TypedSet) -> Result<f64> {
    tset.single()?
        .as_number()
        .ok_or_else(|| evaluation(format!("Expected a number, got type '{}'", tset.ty)))
}

fn single_bool(tset: &TypedSet) -> Result<bool> {
    tset.single()?
        .as_bool()
        .ok_or_else(|| evaluation(format!("Expected a bool, got type '{}'", tset.ty)))
}

fn bind(vars: &VarValues, name: &str, ty: &Type, value: &Value) -> VarValues {
    vars.update(name.to_string(), TypedSet::singleton(ty.clone(), value.clone()))
}

/// Evaluate a typechecked formula.
pub fn evaluate_formula<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarValues,
    formula: &Formula,
) -> Result<TypedSet> {
    match formula {
        Formula::Lit { ty, values } => Ok(TypedSet::new(ty.clone(), values.iter().cloned().collect())),
        Formula::Date(text) => Ok(TypedSet::singleton(Type::Date, Value::Date(parse_date(text)?))),
        Formula::Var(name) => vars
            .get(name)
            .cloned()
            .ok_or_else(|| evaluation(format!("Undefined variable {}", name))),
        Formula::Up {
            start,
            column,
            want_values,
        } => {
            let start = evaluate_formula(ev, vars, start)?;
            let cells: BTreeSet<CellId> = match start.ty.referenced_column() {
                Some(start_column) if start_column != column => {
                    let drop = ev.levels_up(start_column, column)?;
                    start
                        .cell_ids()
                        .map(|c| c.truncate(c.len().saturating_sub(drop)))
                        .collect()
                }
                _ => start.cell_ids().cloned().collect(),
            };
            navigation_result(ev, column, cells, *want_values)
        }
        Formula::Down {
            start,
            column,
            keys,
            want_values,
        } => {
            let start = evaluate_formula(ev, vars, start)?;
            let keys = match keys {
                Some(keys) => Some(evaluate_formula(ev, vars, keys)?),
                None => None,
            };
            let mut cells = BTreeSet::new();
            for cell in start.cell_ids() {
                let family = read_family_for_formula(ev, &QFamilyId::new(column.clone(), cell.clone()))?;
                for value in family.set {
                    if keys.as_ref().is_none_or(|k| k.set.contains(&value)) {
                        cells.insert(cell.child(value));
                    }
                }
            }
            navigation_result(ev, column, cells, *want_values)
        }
        Formula::If {
            condition,
            then_branch,
            else_branch,
        } => {
            let condition = evaluate_formula(ev, vars, condition)?;
            if single_bool(&condition)? {
                evaluate_formula(ev, vars, then_branch)
            } else {
                evaluate_formula(ev, vars, else_branch)
            }
        }
        Formula::Count(domain) => {
            let domain = evaluate_formula(ev, vars, domain)?;
            Ok(TypedSet::singleton(Type::Number, Value::number(domain.len() as f64)))
        }
        Formula::OneOf(domain) => {
            let domain = evaluate_formula(ev, vars, domain)?;
            let first = domain
                .iter()
                .next()
                .cloned()
                .ok_or_else(|| evaluation("oneOf on empty set."))?;
            Ok(TypedSet::singleton(domain.ty, first))
        }
        Formula::Filter { domain, predicate } => {
            let domain = evaluate_formula(ev, vars, domain)?;
            let mut kept = BTreeSet::new();
            for x in domain.iter() {
                let inner = bind(vars, &predicate.var, &domain.ty, x);
                if single_bool(&evaluate_formula(ev, &inner, &predicate.body)?)? {
                    kept.insert(x.clone());
                }
            }
            Ok(TypedSet::new(domain.ty, kept))
        }
        Formula::Sum { domain, addend } => {
            let domain = evaluate_formula(ev, vars, domain)?;
            let mut total = 0.0;
            for x in domain.iter() {
                let inner = bind(vars, &addend.var, &domain.ty, x);
                total += single_number(&evaluate_formula(ev, &inner, &addend.body)?)?;
            }
            Ok(TypedSet::singleton(Type::Number, Value::number(total)))
        }
        Formula::Binary { op, lhs, rhs } => {
            let lhs = evaluate_formula(ev, vars, lhs)?;
            let rhs = evaluate_formula(ev, vars, rhs)?;
            evaluate_binary(ev, *op, &lhs, &rhs)
        }
        Formula::Neg(arg) => {
            let x = single_number(&evaluate_formula(ev, vars, arg)?)?;
            Ok(TypedSet::singleton(Type::Number, Value::number(-x)))
        }
        Formula::Not(arg) => {
            let b = single_bool(&evaluate_formula(ev, vars, arg)?)?;
            Ok(TypedSet::singleton(Type::Bool, Value::Bool(!b)))
        }
        Formula::Union(parts) => {
            let mut result = TypedSet::empty(Type::Empty);
            for part in parts {
                result.add_all(evaluate_formula(ev, vars, part)?);
            }
            Ok(result)
        }
        Formula::ToText(arg) => {
            let arg = evaluate_formula(ev, vars, arg)?;
            Ok(TypedSet::singleton(Type::Text, Value::text(tset_to_text(ev, &arg)?)))
        }
        Formula::Dummy => Ok(TypedSet::empty(Type::Empty)),
    }
}

fn evaluate_binary<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    op: BinaryOp,
    lhs: &TypedSet,
    rhs: &TypedSet,
) -> Result<TypedSet> {
    let number = |x: f64| -> Result<TypedSet> { Ok(TypedSet::singleton(Type::Number, Value::number(x))) };
    let boolean = |b: bool| -> Result<TypedSet> { Ok(TypedSet::singleton(Type::Bool, Value::Bool(b))) };
    match op {
        BinaryOp::Eq => boolean(lhs.set == rhs.set),
        BinaryOp::Ne => boolean(lhs.set != rhs.set),
        BinaryOp::In => boolean(rhs.set.is_superset(&lhs.set)),
        BinaryOp::Plus => {
            if both_fit(&lhs.ty, &rhs.ty, &Type::Number) {
                number(single_number(lhs)? + single_number(rhs)?)
            } else {
                let text = tset_to_text(ev, lhs)? + &tset_to_text(ev, rhs)?;
                Ok(TypedSet::singleton(Type::Text, Value::text(text)))
            }
        }
        BinaryOp::Minus => number(single_number(lhs)? - single_number(rhs)?),
        BinaryOp::Times => number(single_number(lhs)? * single_number(rhs)?),
        BinaryOp::Divide => number(single_number(lhs)? / single_number(rhs)?),
        BinaryOp::Pow => number(single_number(lhs)?.powf(single_number(rhs)?)),
        BinaryOp::And => {
            let (a, b) = (single_bool(lhs)?, single_bool(rhs)?);
            boolean(a && b)
        }
        BinaryOp::Or => {
            let (a, b) = (single_bool(lhs)?, single_bool(rhs)?);
            boolean(a || b)
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if !both_fit(&lhs.ty, &rhs.ty, &Type::Number) && !both_fit(&lhs.ty, &rhs.ty, &Type::Date) {
                return Err(no_alternative(ev.schema, op, &lhs.ty, &rhs.ty));
            }
            let ordering = lhs.single()?.cmp(rhs.single()?);
            boolean(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
    }
}
