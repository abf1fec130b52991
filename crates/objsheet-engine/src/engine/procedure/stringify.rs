//! Render procedures back to concrete syntax.

use super::{Procedure, Statement, merge_type_maps};
use crate::engine::formula::{
    Formula, VarTypes, stringify_formula_with_vars, stringify_ident, try_typecheck_formula,
};
use crate::engine::model::Evaluator;
use crate::engine::store::FamilyStore;
use crate::error::Result;

/// The body of `procedure`, one statement per line, blocks indented by two
/// spaces. Parameters are not included.
pub fn stringify_procedure<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    procedure: &Procedure,
) -> Result<String> {
    let mut vars: VarTypes = procedure
        .params
        .iter()
        .map(|p| (p.name.clone(), p.ty.clone()))
        .collect();
    stringify_statements(ev, &mut vars, &procedure.body)
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.is_empty() {
                "\n".to_string()
            } else {
                format!("  {}\n", line)
            }
        })
        .collect()
}

fn stringify_statements<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &mut VarTypes,
    body: &[Statement],
) -> Result<String> {
    let mut out = String::new();
    for statement in body {
        out.push_str(&stringify_statement(ev, vars, statement)?);
    }
    Ok(out)
}

fn text<S: FamilyStore>(ev: &mut Evaluator<'_, S>, vars: &VarTypes, f: &Formula) -> Result<String> {
    stringify_formula_with_vars(ev, vars, f)
}

fn stringify_statement<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &mut VarTypes,
    statement: &Statement,
) -> Result<String> {
    let line = match statement {
        Statement::Let { var, value } => {
            let value_text = text(ev, vars, value)?;
            let ty = try_typecheck_formula(ev, vars, value);
            vars.insert(var.clone(), ty);
            format!("let {} = {}", stringify_ident(var)?, value_text)
        }
        Statement::Set { target, value } => {
            format!("{} := {}", text(ev, vars, target)?, text(ev, vars, value)?)
        }
        Statement::Add { target, value } => format!(
            "to set {} add {}",
            text(ev, vars, target)?,
            text(ev, vars, value)?
        ),
        Statement::Remove { target, value } => format!(
            "from set {} remove {}",
            text(ev, vars, target)?,
            text(ev, vars, value)?
        ),
        Statement::If {
            condition,
            then_body,
            else_body,
        } => {
            let condition_text = text(ev, vars, condition)?;
            let mut then_vars = vars.clone();
            let then_text = stringify_statements(ev, &mut then_vars, then_body)?;
            let mut else_vars = vars.clone();
            let else_text = stringify_statements(ev, &mut else_vars, else_body)?;
            *vars = merge_type_maps(&then_vars, &else_vars);
            let mut out = format!("if ({}) {{\n{}}}", condition_text, indent(&then_text));
            if !else_body.is_empty() {
                out.push_str(&format!(" else {{\n{}}}", indent(&else_text)));
            }
            out
        }
        Statement::Foreach { var, domain, body } => {
            let domain_text = text(ev, vars, domain)?;
            let mut body_vars = vars.update(var.clone(), try_typecheck_formula(ev, vars, domain));
            let body_text = stringify_statements(ev, &mut body_vars, body)?;
            format!(
                "foreach ({} : {}) {{\n{}}}",
                stringify_ident(var)?,
                domain_text,
                indent(&body_text)
            )
        }
        Statement::Delete(objects) => format!("delete {}", text(ev, vars, objects)?),
        Statement::New { var, target } | Statement::Make { var, target } => {
            let keyword = if matches!(statement, Statement::New { .. }) {
                "new"
            } else {
                "make"
            };
            let target_text = text(ev, vars, target)?;
            match var {
                Some(var) => {
                    let ty = try_typecheck_formula(ev, vars, target);
                    vars.insert(var.clone(), ty);
                    format!("let {} = {} {}", stringify_ident(var)?, keyword, target_text)
                }
                None => format!("{} {}", keyword, target_text),
            }
        }
        Statement::Check(condition) => format!("check {}", text(ev, vars, condition)?),
    };
    Ok(line + "\n")
}
