use im::HashSet;

use super::Formula;
use crate::error::{Result, validation};

/// Check variable scoping: every variable is defined and no lambda shadows an
/// outer name. Column formulas start with `{this}`.
pub fn validate_formula(vars: &HashSet<String>, formula: &Formula) -> Result<()> {
    match formula {
        Formula::Var(name) => {
            if !vars.contains(name) {
                return Err(validation(format!("Undefined variable {}", name)));
            }
            Ok(())
        }
        Formula::Filter { domain, predicate: lambda } | Formula::Sum { domain, addend: lambda } => {
            validate_formula(vars, domain)?;
            if vars.contains(&lambda.var) {
                return Err(validation(format!(
                    "Bound variable '{}' shadows an outer variable of the same name",
                    lambda.var
                )));
            }
            validate_formula(&vars.update(lambda.var.clone()), &lambda.body)
        }
        other => {
            for (_, sub) in other.subformulas() {
                validate_formula(vars, sub)?;
            }
            Ok(())
        }
    }
}
