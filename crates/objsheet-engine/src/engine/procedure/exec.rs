//! Procedure execution.
//!
//! Procedures are assumed to have passed [`typecheck_procedure`] against the
//! current schema. A failing statement leaves earlier mutations in place;
//! callers that need atomicity run procedures against a transaction overlay.
//!
//! [`typecheck_procedure`]: super::typecheck_procedure

use std::collections::BTreeSet;

use tracing::trace;

use super::{Procedure, Statement};
use crate::engine::formula::{Formula, VarValues, evaluate_formula};
use crate::engine::model::Evaluator;
use crate::engine::store::FamilyStore;
use crate::engine::types::{Type, TypedSet};
use crate::engine::value::{CellId, ColumnId, QFamilyId, Value};
use crate::error::{Result, evaluation, internal};

/// Run `procedure` with `args` bound to its parameters.
pub fn execute_procedure<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    procedure: &Procedure,
    args: VarValues,
) -> Result<()> {
    for param in procedure.params.iter().filter(|p| p.singular) {
        let arg = args
            .get(&param.name)
            .ok_or_else(|| evaluation(format!("Missing argument {}", param.name)))?;
        arg.single()?;
    }
    let mut vars = args;
    execute_statements(ev, &mut vars, &procedure.body)
}

fn execute_statements<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &mut VarValues,
    body: &[Statement],
) -> Result<()> {
    for statement in body {
        execute_statement(ev, vars, statement)?;
    }
    Ok(())
}

/// An evaluated mutation target.
struct FamilyRef {
    parents: Vec<CellId>,
    column: ColumnId,
    keys: Option<TypedSet>,
}

impl FamilyRef {
    fn evaluate<S: FamilyStore>(
        ev: &mut Evaluator<'_, S>,
        vars: &VarValues,
        target: &Formula,
    ) -> Result<FamilyRef> {
        let Formula::Down {
            start,
            column,
            keys,
            ..
        } = target
        else {
            return Err(internal("mutation target is not a down navigation"));
        };
        let parents = evaluate_formula(ev, vars, start)?;
        let keys = match keys {
            Some(keys) => Some(evaluate_formula(ev, vars, keys)?),
            None => None,
        };
        Ok(FamilyRef {
            parents: parents.cell_ids().cloned().collect(),
            column: column.clone(),
            keys,
        })
    }

    fn families(&self) -> impl Iterator<Item = QFamilyId> + '_ {
        self.parents
            .iter()
            .map(|parent| QFamilyId::new(self.column.clone(), parent.clone()))
    }
}

fn single_bool(tset: &TypedSet) -> Result<bool> {
    tset.single()?
        .as_bool()
        .ok_or_else(|| internal("condition is not a bool"))
}

fn execute_statement<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &mut VarValues,
    statement: &Statement,
) -> Result<()> {
    match statement {
        Statement::Let { var, value } => {
            let tset = evaluate_formula(ev, vars, value)?;
            vars.insert(var.clone(), tset);
        }
        Statement::Set { target, value } => {
            let target = FamilyRef::evaluate(ev, vars, target)?;
            let values = evaluate_formula(ev, vars, value)?.set;
            ev.invalidate_data_cache();
            for family in target.families() {
                ev.store
                    .upsert(&family, &mut |r| r.values = Some(values.clone()));
            }
        }
        Statement::Add { target, value } => {
            let target = FamilyRef::evaluate(ev, vars, target)?;
            let values = evaluate_formula(ev, vars, value)?.set;
            ev.invalidate_data_cache();
            for family in target.families() {
                ev.store.upsert(&family, &mut |r| {
                    r.values
                        .get_or_insert_with(BTreeSet::new)
                        .extend(values.iter().cloned())
                });
            }
        }
        Statement::Remove { target, value } => {
            let target = FamilyRef::evaluate(ev, vars, target)?;
            let values = evaluate_formula(ev, vars, value)?.set;
            ev.invalidate_data_cache();
            for family in target.families() {
                ev.store.update(&family, &mut |r| {
                    if let Some(existing) = r.values.as_mut() {
                        existing.retain(|v| !values.contains(v));
                    }
                });
            }
        }
        Statement::If {
            condition,
            then_body,
            else_body,
        } => {
            let condition = evaluate_formula(ev, vars, condition)?;
            let body = if single_bool(&condition)? {
                then_body
            } else {
                else_body
            };
            execute_statements(ev, vars, body)?;
        }
        Statement::Foreach { var, domain, body } => {
            let domain = evaluate_formula(ev, vars, domain)?;
            for element in domain.set {
                let mut inner =
                    vars.update(var.clone(), TypedSet::singleton(domain.ty.clone(), element));
                execute_statements(ev, &mut inner, body)?;
            }
        }
        Statement::Delete(objects) => {
            let objects = evaluate_formula(ev, vars, objects)?;
            let Type::Reference(column) = &objects.ty else {
                return Err(internal("delete of a non-reference set"));
            };
            ev.invalidate_data_cache();
            for cell in objects.cell_ids() {
                ev.recursive_delete_state_cell(column, cell)?;
            }
        }
        Statement::New { var, target } => {
            let target = FamilyRef::evaluate(ev, vars, target)?;
            ev.invalidate_data_cache();
            let mut objects = Vec::new();
            for family in target.families() {
                let token = Value::new_token();
                ev.store.upsert(&family, &mut |r| {
                    r.values
                        .get_or_insert_with(BTreeSet::new)
                        .insert(token.clone());
                });
                trace!(%family, "new object");
                objects.push(family.parent.child(token));
            }
            if let Some(var) = var {
                vars.insert(var.clone(), TypedSet::cells(target.column, objects));
            }
        }
        Statement::Make { var, target } => {
            let target = FamilyRef::evaluate(ev, vars, target)?;
            let keys = target
                .keys
                .as_ref()
                .ok_or_else(|| internal("make without a subscript"))?;
            ev.invalidate_data_cache();
            let mut objects = Vec::new();
            for family in target.families() {
                for key in keys.iter() {
                    ev.store.upsert(&family, &mut |r| {
                        r.values
                            .get_or_insert_with(BTreeSet::new)
                            .insert(key.clone());
                    });
                    objects.push(family.parent.child(key.clone()));
                }
            }
            if let Some(var) = var {
                vars.insert(var.clone(), TypedSet::cells(target.column, objects));
            }
        }
        Statement::Check(condition) => {
            let condition = evaluate_formula(ev, vars, condition)?;
            if !single_bool(&condition)? {
                return Err(evaluation("check condition failed"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::formula::BinaryOp;
    use crate::engine::model::{FormulaEngine, Settings};
    use crate::engine::procedure::{Param, fixtures};
    use crate::engine::schema::Schema;
    use crate::engine::store::{FamilyRecord, MemoryStore};

    fn cid(id: &str) -> ColumnId {
        ColumnId::new(id)
    }

    fn token(s: &str) -> Value {
        Value::Token(s.to_string())
    }

    /// Two people, `a` aged 30 and `b` aged 40, with one pet under `a`.
    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        let root = CellId::root();
        let a = root.child(token("a"));
        let b = root.child(token("b"));
        let family = |column: &str, parent: &CellId, values: Vec<Value>| {
            store.set(
                QFamilyId::new(cid(column), parent.clone()),
                FamilyRecord::with_values(values.into_iter().collect()),
            );
        };
        family("person", &root, vec![token("a"), token("b")]);
        family("age", &a, vec![Value::number(30.0)]);
        family("age", &b, vec![Value::number(40.0)]);
        family("pet", &a, vec![token("p")]);
        family("pet_name", &a.child(token("p")), vec![Value::text("Rex")]);
        store
    }

    fn run(
        schema: &Schema,
        store: &mut MemoryStore,
        params: Vec<Param>,
        args: VarValues,
        body: Vec<Statement>,
    ) -> Result<()> {
        let mut engine = FormulaEngine::new();
        let settings = Settings::default();
        let mut ev = Evaluator::new(schema, &mut engine, store, &settings);
        let procedure = Procedure {
            name: "p".into(),
            params,
            body,
        };
        execute_procedure(&mut ev, &procedure, args)
    }

    fn values(store: &MemoryStore, column: &str, parent: &CellId) -> Option<BTreeSet<Value>> {
        store
            .get(&QFamilyId::new(cid(column), parent.clone()))
            .and_then(|r| r.values)
    }

    fn person_a() -> CellId {
        CellId::root().child(token("a"))
    }

    fn who_is_a() -> (Vec<Param>, VarValues) {
        let param = Param::new("who", Type::Reference(cid("person")), true);
        let args = VarValues::unit(
            "who".to_string(),
            TypedSet::cells(cid("person"), [person_a()]),
        );
        (vec![param], args)
    }

    fn who(column: &str, want_values: bool) -> Formula {
        Formula::down(Formula::var("who"), cid(column), None, want_values)
    }

    #[test]
    fn test_set_replaces_family() {
        let schema = fixtures::schema();
        let mut store = seeded_store();
        let (params, args) = who_is_a();
        let body = vec![Statement::Set {
            target: who("age", true),
            value: Formula::number(31.0),
        }];
        run(&schema, &mut store, params, args, body).unwrap();
        assert_eq!(
            values(&store, "age", &person_a()),
            Some([Value::number(31.0)].into_iter().collect())
        );
    }

    #[test]
    fn test_add_then_remove() {
        let schema = fixtures::schema();
        let mut store = seeded_store();
        let (params, args) = who_is_a();
        let body = vec![
            Statement::Add {
                target: who("person_name", true),
                value: Formula::Union(vec![Formula::text("Ann"), Formula::text("Annie")]),
            },
            Statement::Remove {
                target: who("person_name", true),
                value: Formula::text("Annie"),
            },
        ];
        run(&schema, &mut store, params, args, body).unwrap();
        assert_eq!(
            values(&store, "person_name", &person_a()),
            Some([Value::text("Ann")].into_iter().collect())
        );
    }

    #[test]
    fn test_new_binds_created_object() {
        let schema = fixtures::schema();
        let mut store = seeded_store();
        let (params, args) = who_is_a();
        let body = vec![
            Statement::New {
                var: Some("rover".into()),
                target: who("pet", false),
            },
            Statement::Set {
                target: Formula::down(Formula::var("rover"), cid("pet_name"), None, true),
                value: Formula::text("Rover"),
            },
        ];
        run(&schema, &mut store, params, args, body).unwrap();
        let pets = values(&store, "pet", &person_a()).unwrap();
        assert_eq!(pets.len(), 2);
        let rover = pets.iter().find(|p| **p != token("p")).unwrap();
        assert_eq!(
            values(&store, "pet_name", &person_a().child(rover.clone())),
            Some([Value::text("Rover")].into_iter().collect())
        );
    }

    #[test]
    fn test_make_is_idempotent() {
        let schema = fixtures::schema();
        let mut store = seeded_store();
        let make = Statement::Make {
            var: None,
            target: Formula::down(Formula::root(), cid("room"), Some(Formula::text("101")), false),
        };
        let body = vec![make.clone(), make];
        run(&schema, &mut store, vec![], VarValues::new(), body).unwrap();
        assert_eq!(
            values(&store, "room", &CellId::root()),
            Some([Value::text("101")].into_iter().collect())
        );
    }

    #[test]
    fn test_foreach_visits_each_element() {
        let schema = fixtures::schema();
        let mut store = seeded_store();
        let everyone = Formula::down(Formula::root(), cid("person"), None, false);
        let body = vec![Statement::Foreach {
            var: "p".into(),
            domain: everyone,
            body: vec![Statement::Set {
                target: Formula::down(Formula::var("p"), cid("age"), None, true),
                value: Formula::number(50.0),
            }],
        }];
        run(&schema, &mut store, vec![], VarValues::new(), body).unwrap();
        for who in ["a", "b"] {
            assert_eq!(
                values(&store, "age", &CellId::root().child(token(who))),
                Some([Value::number(50.0)].into_iter().collect())
            );
        }
    }

    #[test]
    fn test_if_runs_one_branch() {
        let schema = fixtures::schema();
        let mut store = seeded_store();
        let (params, args) = who_is_a();
        let condition = Formula::binary(BinaryOp::Gt, who("age", true), Formula::number(35.0));
        let body = vec![Statement::If {
            condition,
            then_body: vec![Statement::Set {
                target: who("age", true),
                value: Formula::number(1.0),
            }],
            else_body: vec![Statement::Set {
                target: who("age", true),
                value: Formula::number(2.0),
            }],
        }];
        run(&schema, &mut store, params, args, body).unwrap();
        assert_eq!(
            values(&store, "age", &person_a()),
            Some([Value::number(2.0)].into_iter().collect())
        );
    }

    #[test]
    fn test_delete_removes_subtree() {
        let schema = fixtures::schema();
        let mut store = seeded_store();
        let (params, args) = who_is_a();
        let body = vec![Statement::Delete(Formula::var("who"))];
        run(&schema, &mut store, params, args, body).unwrap();
        assert_eq!(
            values(&store, "person", &CellId::root()),
            Some([token("b")].into_iter().collect())
        );
        assert_eq!(values(&store, "pet", &person_a()), None);
        assert_eq!(values(&store, "pet_name", &person_a().child(token("p"))), None);
    }

    #[test]
    fn test_failed_check() {
        let schema = fixtures::schema();
        let mut store = seeded_store();
        let body = vec![Statement::Check(Formula::boolean(false))];
        let err = run(&schema, &mut store, vec![], VarValues::new(), body).unwrap_err();
        assert!(err.is_evaluation());
        assert_eq!(err.message(), "check condition failed");
    }

    #[test]
    fn test_singular_parameter_needs_one_value() {
        let schema = fixtures::schema();
        let mut store = seeded_store();
        let param = Param::new("who", Type::Reference(cid("person")), true);
        let both = TypedSet::cells(
            cid("person"),
            [CellId::root().child(token("a")), CellId::root().child(token("b"))],
        );
        let args = VarValues::unit("who".to_string(), both);
        let err = run(&schema, &mut store, vec![param], args, vec![]).unwrap_err();
        assert!(err.is_evaluation());
    }
}
