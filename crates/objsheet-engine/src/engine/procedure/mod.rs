//! The procedure (transaction) language.
//!
//! A [`Procedure`] is a named list of [`Statement`]s over typed parameters.
//! Statements mutate state families; formulas inside them are ordinary
//! [`Formula`]s evaluated against the current data.
//!
//! Passes mirror the formula passes:
//!
//! - [`validate_procedure`] - scoping (no shadowing, per-branch scopes) and
//!   family-reference shape, needs only the schema
//! - [`typecheck_procedure`] - types against the current schema, merging
//!   branch environments with [`merge_type_maps`]
//! - [`execute_procedure`] - runs the statements against an [`Evaluator`]
//! - [`parse_procedure`] / [`stringify_procedure`] - concrete syntax
//!
//! [`Evaluator`]: super::model::Evaluator

mod exec;
mod parser;
mod scope;
mod stringify;
mod typecheck;

use super::formula::{Formula, VarTypes};
use super::types::{Type, common_supertype};

pub use exec::execute_procedure;
pub use parser::parse_procedure;
pub use scope::validate_procedure;
pub use stringify::stringify_procedure;
pub use typecheck::typecheck_procedure;

/// A procedure parameter. A singular parameter takes exactly one value.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub singular: bool,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: Type, singular: bool) -> Self {
        Param {
            name: name.into(),
            ty,
            singular,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Statement>,
}

/// Procedure statements. Mutation targets are `down` navigations to a state
/// family, written like any other navigation.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Let {
        var: String,
        value: Formula,
    },
    /// `target := value`
    Set {
        target: Formula,
        value: Formula,
    },
    /// `to set target add value`
    Add {
        target: Formula,
        value: Formula,
    },
    /// `from set target remove value`
    Remove {
        target: Formula,
        value: Formula,
    },
    If {
        condition: Formula,
        then_body: Vec<Statement>,
        else_body: Vec<Statement>,
    },
    Foreach {
        var: String,
        domain: Formula,
        body: Vec<Statement>,
    },
    Delete(Formula),
    /// Add a fresh token object under each target parent cell.
    New {
        var: Option<String>,
        target: Formula,
    },
    /// Ensure the keyed objects named by the target's subscript exist.
    Make {
        var: Option<String>,
        target: Formula,
    },
    Check(Formula),
}

/// What a mutation target must look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FamilyRefKind {
    /// `set`, `add`, `remove`
    Leaf,
    New,
    Make,
}

impl FamilyRefKind {
    fn want_object(self) -> bool {
        self != FamilyRefKind::Leaf
    }

    fn want_keys(self) -> bool {
        self == FamilyRefKind::Make
    }
}

/// Join two branch environments. A variable bound in only one branch
/// becomes `error`.
pub fn merge_type_maps(a: &VarTypes, b: &VarTypes) -> VarTypes {
    let mut merged = VarTypes::new();
    for (name, ty) in a {
        let other = b.get(name).cloned().unwrap_or(Type::Error);
        merged.insert(name.clone(), common_supertype(ty, &other));
    }
    for name in b.keys() {
        if !a.contains_key(name) {
            merged.insert(name.clone(), Type::Error);
        }
    }
    merged
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Schema shared by the procedure tests.

    use crate::engine::formula::Formula;
    use crate::engine::schema::{Column, Schema};
    use crate::engine::types::Type;
    use crate::engine::value::ColumnId;

    /// `Person{name: text, age: number, Pet{name: text}}`, plus a computed
    /// `petCount` under Person and a `Room` object keyed by a text `number`.
    pub(crate) fn schema() -> Schema {
        let mut schema = Schema::new();
        let mut person = Column::new(ColumnId::new("person"), ColumnId::root());
        person.is_object = true;
        person.object_name = Some("Person".into());
        person.specified_type = Some(Type::Token);
        schema.insert(person, 0).unwrap();
        for (i, (id, field, ty)) in [
            ("person_name", "name", Type::Text),
            ("age", "age", Type::Number),
        ]
        .into_iter()
        .enumerate()
        {
            let mut c = Column::new(ColumnId::new(id), ColumnId::new("person"));
            c.field_name = Some(field.into());
            c.specified_type = Some(ty);
            schema.insert(c, i).unwrap();
        }
        let mut pet = Column::new(ColumnId::new("pet"), ColumnId::new("person"));
        pet.is_object = true;
        pet.object_name = Some("Pet".into());
        pet.specified_type = Some(Type::Token);
        schema.insert(pet, 2).unwrap();
        let mut pet_name = Column::new(ColumnId::new("pet_name"), ColumnId::new("pet"));
        pet_name.field_name = Some("name".into());
        pet_name.specified_type = Some(Type::Text);
        schema.insert(pet_name, 0).unwrap();
        let mut pet_count = Column::new(ColumnId::new("pet_count"), ColumnId::new("person"));
        pet_count.field_name = Some("petCount".into());
        pet_count.formula = Some(Formula::Count(Box::new(Formula::down(
            Formula::this(),
            ColumnId::new("pet"),
            None,
            false,
        ))));
        schema.insert(pet_count, 3).unwrap();
        let mut room = Column::new(ColumnId::new("room"), ColumnId::root());
        room.is_object = true;
        room.object_name = Some("Room".into());
        room.field_name = Some("number".into());
        room.specified_type = Some(Type::Text);
        schema.insert(room, 1).unwrap();
        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::value::ColumnId;

    #[test]
    fn test_merge_type_maps() {
        let a = VarTypes::new()
            .update("x".into(), Type::Number)
            .update("y".into(), Type::Text)
            .update("z".into(), Type::Empty);
        let b = VarTypes::new()
            .update("x".into(), Type::Number)
            .update("z".into(), Type::Reference(ColumnId::new("pet")))
            .update("w".into(), Type::Bool);
        let merged = merge_type_maps(&a, &b);
        assert_eq!(merged.get("x"), Some(&Type::Number));
        assert_eq!(merged.get("y"), Some(&Type::Error));
        assert_eq!(merged.get("z"), Some(&Type::Reference(ColumnId::new("pet"))));
        assert_eq!(merged.get("w"), Some(&Type::Error));
    }
}
