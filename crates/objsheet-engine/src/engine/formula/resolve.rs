//! Name resolution for concrete navigation syntax.
//!
//! `start.name` (or a bare `name`) may mean a variable, an ancestor object,
//! or a logical child of the start type. Exactly one reading must fit.

use super::{Formula, VarTypes, typecheck_formula, validate_formula};
use crate::engine::model::Evaluator;
use crate::engine::schema::Direction;
use crate::engine::store::FamilyStore;
use crate::engine::types::Type;
use crate::engine::value::ColumnId;
use crate::error::{Result, validation};

/// Validate against the variables in scope, then typecheck.
pub(crate) fn validate_and_typecheck<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    formula: &Formula,
) -> Result<Type> {
    let names: im::HashSet<String> = vars.keys().cloned().collect();
    validate_formula(&names, formula)?;
    typecheck_formula(ev, vars, formula)
}

/// Resolve `start.name[keys]`, or `name[keys]` when `start` is `None`.
pub fn resolve_navigation<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    start: Option<Formula>,
    name: &str,
    keys: Option<Formula>,
) -> Result<Formula> {
    let schema = ev.schema;
    let mut interpretations = Vec::new();
    let start = match start {
        Some(start) => start,
        None => match vars.get("this") {
            Some(this) if this.is_reference() => {
                if name == "this" {
                    return Err(validation(
                        "Explicit \"this\" is not allowed in concrete syntax.  Please use the object name for clarity.",
                    ));
                }
                if vars.contains_key(name) {
                    interpretations.push(Formula::var(name));
                }
                Formula::this()
            }
            _ => {
                return match vars.get(name) {
                    None => Err(validation(format!("Undefined variable '{}'", name))),
                    Some(Type::Error) => Err(validation(format!(
                        "Variable '{}' cannot be read because it does not have a known type at this point.",
                        name
                    ))),
                    Some(_) => Ok(Formula::var(name)),
                };
            }
        },
    };

    let start_type = validate_and_typecheck(ev, vars, &start)?;
    let Type::Reference(start_column) = &start_type else {
        return Err(validation(format!(
            "Expected a set of cells, got set of '{}'",
            schema.stringify_type(&start_type)
        )));
    };

    let (up_path, _) = schema.find_common_ancestor_paths(start_column, &ColumnId::root())?;
    for up in up_path {
        if schema.column(&up)?.object_name_with_fallback().as_deref() == Some(name) {
            interpretations.push(Formula::up(start.clone(), up, false));
        }
    }
    for child in schema.logical_children_by_name(start_column, name)? {
        interpretations.push(match child.direction {
            Direction::Down => {
                Formula::down(start.clone(), child.target.column, None, child.target.is_values)
            }
            Direction::Up => Formula::up(start.clone(), child.target.column, true),
        });
    }

    if interpretations.len() != 1 {
        return Err(validation(format!(
            "{} possible interpretations for <type {}>.{}, wanted one.",
            interpretations.len(),
            schema.stringify_type(&start_type),
            name
        )));
    }
    let mut formula = interpretations.remove(0);
    match &mut formula {
        Formula::Down { keys: slot, .. } => *slot = keys.map(Box::new),
        _ if keys.is_some() => {
            return Err(validation("Only down navigations can be subscripted with keys."));
        }
        _ => {}
    }

    // `(...).Obj.key` reads as the key column directly below `(...)`.
    if let Formula::Up {
        start: up_start,
        column,
        want_values: true,
    } = &formula
    {
        if let Formula::Down {
            start: inner,
            column: down_column,
            keys: None,
            want_values: false,
        } = up_start.as_ref()
        {
            if down_column == column {
                return Ok(Formula::down((**inner).clone(), column.clone(), None, true));
            }
        }
    }
    Ok(formula)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{FormulaEngine, Settings};
    use crate::engine::schema::{Column, Schema};
    use crate::engine::store::MemoryStore;

    /// Person{name}, Person.Pet keyed by name.
    fn schema() -> Schema {
        let mut schema = Schema::new();
        let mut person = Column::new(ColumnId::new("person"), ColumnId::root());
        person.is_object = true;
        person.object_name = Some("Person".into());
        person.specified_type = Some(Type::Token);
        schema.insert(person, 0).unwrap();
        let mut name = Column::new(ColumnId::new("person_name"), ColumnId::new("person"));
        name.field_name = Some("name".into());
        name.specified_type = Some(Type::Text);
        schema.insert(name, 0).unwrap();
        let mut pet = Column::new(ColumnId::new("pet"), ColumnId::new("person"));
        pet.is_object = true;
        pet.object_name = Some("Pet".into());
        pet.field_name = Some("petName".into());
        pet.specified_type = Some(Type::Text);
        schema.insert(pet, 1).unwrap();
        schema
    }

    fn resolve(start: Option<Formula>, name: &str, keys: Option<Formula>) -> Result<Formula> {
        let schema = schema();
        let mut engine = FormulaEngine::new();
        let mut store = MemoryStore::new();
        let settings = Settings::default();
        let mut ev = Evaluator::new(&schema, &mut engine, &mut store, &settings);
        let vars = VarTypes::unit("this".into(), Type::Reference(ColumnId::new("person")));
        resolve_navigation(&mut ev, &vars, start, name, keys)
    }

    #[test]
    fn test_field_resolves_down_with_values() {
        assert_eq!(
            resolve(None, "name", None).unwrap(),
            Formula::down(Formula::this(), ColumnId::new("person_name"), None, true)
        );
    }

    #[test]
    fn test_own_object_name_resolves_up() {
        assert_eq!(
            resolve(None, "Person", None).unwrap(),
            Formula::up(Formula::this(), ColumnId::new("person"), false)
        );
    }

    #[test]
    fn test_object_key_simplifies_to_down() {
        let pets = Formula::down(Formula::this(), ColumnId::new("pet"), None, false);
        assert_eq!(
            resolve(Some(pets), "petName", None).unwrap(),
            Formula::down(Formula::this(), ColumnId::new("pet"), None, true)
        );
    }

    #[test]
    fn test_keys_only_on_down() {
        let err = resolve(None, "Person", Some(Formula::number(1.0))).unwrap_err();
        assert_eq!(err.message(), "Only down navigations can be subscripted with keys.");
    }

    #[test]
    fn test_unknown_name_has_zero_interpretations() {
        let err = resolve(None, "nope", None).unwrap_err();
        assert!(err.message().starts_with("0 possible interpretations"));
    }

    #[test]
    fn test_explicit_this_is_rejected() {
        assert!(resolve(None, "this", None).is_err());
    }
}
