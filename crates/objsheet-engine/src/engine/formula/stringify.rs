//! Canonical concrete syntax for formulas.

use regex::Regex;
use std::sync::OnceLock;

use super::lexer::is_plain_ident;
use super::wire::value_to_json;
use super::{
    Associativity, Formula, PRECEDENCE_ATOMIC, PRECEDENCE_LOWEST, PRECEDENCE_NAV,
    PRECEDENCE_NEG, VarTypes, resolve_navigation, try_typecheck_formula,
};
use crate::engine::model::Evaluator;
use crate::engine::store::FamilyStore;
use crate::engine::types::Type;
use crate::engine::value::{ColumnId, Value};
use crate::error::{Result, validation};

/// Rendered text and the precedence of its outermost operator.
#[derive(Debug, Clone)]
pub(crate) struct Rendered {
    text: String,
    precedence: u8,
}

impl Rendered {
    fn new(text: String, precedence: u8) -> Self {
        Rendered { text, precedence }
    }

    fn atomic(text: String) -> Self {
        Rendered::new(text, PRECEDENCE_ATOMIC)
    }

    /// The text, parenthesized unless it binds at least as tightly as `lowest_safe`.
    pub(crate) fn str_for(&self, lowest_safe: u8) -> String {
        if self.precedence >= lowest_safe {
            self.text.clone()
        } else {
            format!("({})", self.text)
        }
    }
}

fn bracket_step_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[[A-Za-z_][A-Za-z0-9_]*\]$").expect("navigation step regex must compile")
    })
}

/// Write an identifier, backquoting it when needed.
pub fn stringify_ident(ident: &str) -> Result<String> {
    if is_plain_ident(ident) {
        Ok(ident.to_string())
    } else if !ident.contains('`') {
        Ok(format!("`{}`", ident))
    } else {
        Err(validation(format!("Cannot stringify identifier '{}'", ident)))
    }
}

/// Like [`stringify_ident`], but leaves `[field]` fallback names bare.
fn stringify_navigation_step(ident: &str) -> Result<String> {
    if bracket_step_re().is_match(ident) {
        Ok(ident.to_string())
    } else {
        stringify_ident(ident)
    }
}

/// Render a column formula whose `this` has type `this_type`.
pub fn stringify_formula<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    this_type: &Type,
    formula: &Formula,
) -> Result<String> {
    let vars = VarTypes::unit("this".to_string(), this_type.clone());
    stringify_formula_with_vars(ev, &vars, formula)
}

pub fn stringify_formula_with_vars<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    formula: &Formula,
) -> Result<String> {
    Ok(stringify_subformula(ev, vars, formula)?.str_for(PRECEDENCE_LOWEST))
}

/// Re-resolve `name` and flag it if the result is no longer `expected`.
fn annotate_navigation_target<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    start: Option<&Formula>,
    name: Option<String>,
    keys: Option<&Formula>,
    expected: &Formula,
) -> Result<String> {
    let Some(name) = name else {
        return Ok("(unnamed)".to_string());
    };
    let step = stringify_navigation_step(&name)?;
    let actual = resolve_navigation(ev, vars, start.cloned(), &name, keys.cloned());
    if actual.is_ok_and(|f| f == *expected) {
        Ok(step)
    } else {
        Ok(format!("{}(problem)", step))
    }
}

fn stringify_navigation<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    is_down: bool,
    start: &Formula,
    column: &ColumnId,
    keys: Option<&Formula>,
    want_values: bool,
) -> Result<Rendered> {
    let schema = ev.schema;
    let start_rendered = stringify_subformula(ev, vars, start)?;
    let keys_rendered = match keys {
        Some(keys) => Some(stringify_subformula(ev, vars, keys)?),
        None => None,
    };
    let target = match schema.get(column) {
        None => "(deleted)".to_string(),
        Some(col) => {
            let wanted = if is_down {
                Formula::down(start.clone(), column.clone(), keys.cloned(), want_values)
            } else {
                Formula::up(start.clone(), column.clone(), want_values)
            };
            if !want_values {
                annotate_navigation_target(
                    ev,
                    vars,
                    Some(start),
                    col.object_name_with_fallback(),
                    keys,
                    &wanted,
                )?
            } else if is_down && col.is_object {
                // Keyed object reached from its parent: `Obj.key`.
                let intermediate = Formula::down(start.clone(), column.clone(), None, false);
                let object = annotate_navigation_target(
                    ev,
                    vars,
                    Some(start),
                    col.object_name_with_fallback(),
                    None,
                    &intermediate,
                )?;
                let key = annotate_navigation_target(
                    ev,
                    vars,
                    Some(&intermediate),
                    col.field_name.clone(),
                    keys,
                    &wanted,
                )?;
                format!("{}.{}", object, key)
            } else {
                annotate_navigation_target(ev, vars, Some(start), col.field_name.clone(), keys, &wanted)?
            }
        }
    };
    let start_text = start_rendered.str_for(PRECEDENCE_NAV);
    let prefix = match start_text.as_str() {
        "$" => "$".to_string(),
        "this" => String::new(),
        other => format!("{}.", other),
    };
    let keys_text = keys_rendered
        .map(|k| format!("[{}]", k.str_for(PRECEDENCE_LOWEST)))
        .unwrap_or_default();
    Ok(Rendered::new(
        format!("{}{}{}", prefix, target, keys_text),
        PRECEDENCE_NAV,
    ))
}

fn literal_text(value: &Value) -> String {
    value_to_json(value).to_string()
}

pub(crate) fn stringify_subformula<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    formula: &Formula,
) -> Result<Rendered> {
    let rendered = match formula {
        Formula::Lit { ty, values } => {
            if *ty == Type::Reference(ColumnId::root()) {
                Rendered::atomic("$".to_string())
            } else if values.len() == 1 {
                let negative = values[0].as_number().is_some_and(|x| x < 0.0);
                let precedence = if negative { PRECEDENCE_NEG } else { PRECEDENCE_ATOMIC };
                Rendered::new(literal_text(&values[0]), precedence)
            } else {
                let parts: Vec<String> = values.iter().map(literal_text).collect();
                Rendered::atomic(format!("{{{}}}", parts.join(",")))
            }
        }
        Formula::Date(text) => Rendered::atomic(format!("d{}", serde_json::Value::from(text.as_str()))),
        Formula::Var(name) => {
            if name == "this" {
                Rendered::atomic("this".to_string())
            } else {
                let text = annotate_navigation_target(
                    ev,
                    vars,
                    None,
                    Some(name.clone()),
                    None,
                    formula,
                )?;
                Rendered::atomic(text)
            }
        }
        Formula::Up {
            start,
            column,
            want_values,
        } => stringify_navigation(ev, vars, false, start, column, None, *want_values)?,
        Formula::Down {
            start,
            column,
            keys,
            want_values,
        } => stringify_navigation(ev, vars, true, start, column, keys.as_deref(), *want_values)?,
        Formula::If {
            condition,
            then_branch,
            else_branch,
        } => {
            let c = stringify_subformula(ev, vars, condition)?.str_for(PRECEDENCE_LOWEST);
            let t = stringify_subformula(ev, vars, then_branch)?.str_for(PRECEDENCE_LOWEST);
            let e = stringify_subformula(ev, vars, else_branch)?.str_for(PRECEDENCE_LOWEST);
            Rendered::atomic(format!("if({}, {}, {})", c, t, e))
        }
        Formula::Count(arg) => function_call(ev, vars, "count", arg)?,
        Formula::OneOf(arg) => function_call(ev, vars, "oneOf", arg)?,
        Formula::ToText(arg) => function_call(ev, vars, "toText", arg)?,
        Formula::Filter { domain, predicate } => {
            let domain_type = try_typecheck_formula(ev, vars, domain);
            let domain_text = stringify_subformula(ev, vars, domain)?.str_for(PRECEDENCE_LOWEST);
            let inner = vars.update(predicate.var.clone(), domain_type);
            let body = stringify_subformula(ev, &inner, &predicate.body)?.str_for(PRECEDENCE_LOWEST);
            Rendered::atomic(format!(
                "{{{} : {} | {}}}",
                stringify_ident(&predicate.var)?,
                domain_text,
                body
            ))
        }
        Formula::Sum { domain, addend } => {
            let domain_type = try_typecheck_formula(ev, vars, domain);
            let domain_text = stringify_subformula(ev, vars, domain)?.str_for(PRECEDENCE_LOWEST);
            let inner = vars.update(addend.var.clone(), domain_type);
            let body = stringify_subformula(ev, &inner, &addend.body)?.str_for(PRECEDENCE_LOWEST);
            Rendered::atomic(format!(
                "sum[{} : {}]({})",
                stringify_ident(&addend.var)?,
                domain_text,
                body
            ))
        }
        Formula::Binary { op, lhs, rhs } => {
            let precedence = op.precedence();
            let assoc = op.associativity();
            let lhs_min = precedence + u8::from(assoc != Associativity::Left);
            let rhs_min = precedence + u8::from(assoc != Associativity::Right);
            let l = stringify_subformula(ev, vars, lhs)?.str_for(lhs_min);
            let r = stringify_subformula(ev, vars, rhs)?.str_for(rhs_min);
            Rendered::new(format!("{} {} {}", l, op.symbol(), r), precedence)
        }
        Formula::Neg(arg) => {
            let a = stringify_subformula(ev, vars, arg)?.str_for(PRECEDENCE_NEG);
            Rendered::new(format!("-{}", a), PRECEDENCE_NEG)
        }
        Formula::Not(arg) => {
            let a = stringify_subformula(ev, vars, arg)?.str_for(PRECEDENCE_NEG);
            Rendered::new(format!("!{}", a), PRECEDENCE_NEG)
        }
        Formula::Union(parts) => {
            let mut texts = Vec::with_capacity(parts.len());
            for part in parts {
                texts.push(stringify_subformula(ev, vars, part)?.str_for(PRECEDENCE_LOWEST));
            }
            Rendered::atomic(format!("{{{}}}", texts.join(", ")))
        }
        Formula::Dummy => Rendered::atomic("dummy".to_string()),
    };
    Ok(rendered)
}

fn function_call<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    name: &str,
    arg: &Formula,
) -> Result<Rendered> {
    let a = stringify_subformula(ev, vars, arg)?.str_for(PRECEDENCE_LOWEST);
    Ok(Rendered::atomic(format!("{}({})", name, a)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::formula::BinaryOp;
    use crate::engine::model::{FormulaEngine, Settings};
    use crate::engine::schema::Schema;
    use crate::engine::store::MemoryStore;
    use rstest::rstest;

    fn render(formula: &Formula) -> String {
        let schema = Schema::new();
        let mut engine = FormulaEngine::new();
        let mut store = MemoryStore::new();
        let settings = Settings::default();
        let mut ev = Evaluator::new(&schema, &mut engine, &mut store, &settings);
        stringify_formula(&mut ev, &Type::Reference(ColumnId::root()), formula).unwrap()
    }

    fn n(x: f64) -> Formula {
        Formula::number(x)
    }

    #[rstest]
    #[case(Formula::binary(BinaryOp::Minus, Formula::binary(BinaryOp::Minus, n(1.0), n(2.0)), n(3.0)), "1 - 2 - 3")]
    #[case(Formula::binary(BinaryOp::Minus, n(1.0), Formula::binary(BinaryOp::Minus, n(2.0), n(3.0))), "1 - (2 - 3)")]
    #[case(Formula::binary(BinaryOp::Pow, n(2.0), Formula::binary(BinaryOp::Pow, n(3.0), n(4.0))), "2 ^ 3 ^ 4")]
    #[case(Formula::binary(BinaryOp::Pow, Formula::binary(BinaryOp::Pow, n(2.0), n(3.0)), n(4.0)), "(2 ^ 3) ^ 4")]
    #[case(Formula::binary(BinaryOp::Times, Formula::binary(BinaryOp::Plus, n(1.0), n(2.0)), n(3.0)), "(1 + 2) * 3")]
    #[case(Formula::Neg(Box::new(Formula::binary(BinaryOp::Pow, n(2.0), n(2.0)))), "-2 ^ 2")]
    #[case(Formula::binary(BinaryOp::Lt, Formula::binary(BinaryOp::Lt, n(1.0), n(2.0)), Formula::boolean(true)), "(1 < 2) < true")]
    fn test_precedence(#[case] formula: Formula, #[case] expected: &str) {
        assert_eq!(render(&formula), expected);
    }

    #[test]
    fn test_literals_and_functions() {
        assert_eq!(render(&Formula::text("a\"b")), r#""a\"b""#);
        assert_eq!(render(&Formula::Date("2015-01-01".into())), r#"d"2015-01-01""#);
        assert_eq!(render(&Formula::Union(vec![])), "{}");
        assert_eq!(render(&Formula::Count(Box::new(Formula::Dummy))), "count(dummy)");
        assert_eq!(render(&Formula::root()), "$");
    }

    #[rstest]
    #[case("plain", "plain")]
    #[case("two words", "`two words`")]
    #[case("count", "`count`")]
    fn test_stringify_ident(#[case] ident: &str, #[case] expected: &str) {
        assert_eq!(stringify_ident(ident).unwrap(), expected);
    }

    #[test]
    fn test_navigation_step_keeps_fallback_brackets() {
        assert_eq!(stringify_navigation_step("[name]").unwrap(), "[name]");
        assert!(stringify_ident("a`b").is_err());
    }
}
