//! Formula compiler.
//!
//! A subset of the formula language (literals, variables, navigation,
//! filters on `=`, and `=` itself) can be lowered to a flat loop nest instead
//! of being interpreted node by node.
//!
//! Each operator lowers to a fragment: a short [`Stmt`] list whose
//! [`Stmt::Each`] holes stand for "every value yielded by this
//! subformula". [`lower`] compiles the subformulas, then splices each one in
//! place of its hole, with the hole's consumer body substituted at every
//! [`Stmt::Yield`] of the spliced code. Every local is allocated a fresh
//! [`Sym`] from a per-formula counter, so the same consumer can be inlined at
//! many yield sites without capture. The result has no holes left and only
//! materializes sets where a `collect` is needed (keys, `=` operands, the
//! final result). [`run`] executes it.
//!
//! Compiled and interpreted evaluation share [`Evaluator::evaluate_family`],
//! so the family cache and error reporting are the same either way.

mod lower;
mod run;

use std::collections::BTreeSet;
use std::fmt;

use super::formula::{BinaryOp, Formula, VarTypes};
use super::model::Evaluator;
use super::store::FamilyStore;
use super::value::{CellId, ColumnId, Value};
use crate::error::Result;

/// A numbered local of a compiled routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Sym(pub usize);

/// One IR statement. Statements with a `body` run it once per binding.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    /// Hole: run subcomputation `hole`, binding each yielded value to `bind`.
    Each {
        hole: usize,
        bind: Sym,
        body: Vec<Stmt>,
    },
    Yield(Sym),
    NewSet(Sym),
    Insert { set: Sym, value: Sym },
    ForLit {
        values: Vec<Value>,
        bind: Sym,
        body: Vec<Stmt>,
    },
    /// Iterate the set held by a formula variable.
    ForVar {
        var: Sym,
        bind: Sym,
        body: Vec<Stmt>,
    },
    /// Iterate the family of `column` under the cell in `cell`.
    ForFamily {
        column: ColumnId,
        cell: Sym,
        bind: Sym,
        body: Vec<Stmt>,
    },
    Truncate { cell: Sym, levels: usize, dst: Sym },
    /// The key that remains last after dropping `levels` segments.
    LastStep { cell: Sym, levels: usize, dst: Sym },
    /// `dst = cell.child(value)`
    Extend { cell: Sym, value: Sym, dst: Sym },
    /// Run `body` only the first time `value` is seen in `seen`.
    Dedup {
        seen: Sym,
        value: Sym,
        body: Vec<Stmt>,
    },
    IfContains {
        set: Sym,
        value: Sym,
        body: Vec<Stmt>,
    },
    IfTrue { cond: Sym, body: Vec<Stmt> },
    /// Bind a formula variable to the singleton `{value}`.
    BindVar { var: Sym, value: Sym },
    /// `dst = (lhs == rhs)` on two collected sets.
    SetEq { lhs: Sym, rhs: Sym, dst: Sym },
}

impl Stmt {
    /// The same statement with every symbol passed through `f`.
    pub(crate) fn map_syms(&self, f: &impl Fn(Sym) -> Sym) -> Stmt {
        let body = |b: &[Stmt]| b.iter().map(|s| s.map_syms(f)).collect::<Vec<_>>();
        match self {
            Stmt::Each { hole, bind, body: b } => Stmt::Each {
                hole: *hole,
                bind: f(*bind),
                body: body(b),
            },
            Stmt::Yield(s) => Stmt::Yield(f(*s)),
            Stmt::NewSet(s) => Stmt::NewSet(f(*s)),
            Stmt::Insert { set, value } => Stmt::Insert {
                set: f(*set),
                value: f(*value),
            },
            Stmt::ForLit { values, bind, body: b } => Stmt::ForLit {
                values: values.clone(),
                bind: f(*bind),
                body: body(b),
            },
            Stmt::ForVar { var, bind, body: b } => Stmt::ForVar {
                var: f(*var),
                bind: f(*bind),
                body: body(b),
            },
            Stmt::ForFamily {
                column,
                cell,
                bind,
                body: b,
            } => Stmt::ForFamily {
                column: column.clone(),
                cell: f(*cell),
                bind: f(*bind),
                body: body(b),
            },
            Stmt::Truncate { cell, levels, dst } => Stmt::Truncate {
                cell: f(*cell),
                levels: *levels,
                dst: f(*dst),
            },
            Stmt::LastStep { cell, levels, dst } => Stmt::LastStep {
                cell: f(*cell),
                levels: *levels,
                dst: f(*dst),
            },
            Stmt::Extend { cell, value, dst } => Stmt::Extend {
                cell: f(*cell),
                value: f(*value),
                dst: f(*dst),
            },
            Stmt::Dedup { seen, value, body: b } => Stmt::Dedup {
                seen: f(*seen),
                value: f(*value),
                body: body(b),
            },
            Stmt::IfContains { set, value, body: b } => Stmt::IfContains {
                set: f(*set),
                value: f(*value),
                body: body(b),
            },
            Stmt::IfTrue { cond, body: b } => Stmt::IfTrue {
                cond: f(*cond),
                body: body(b),
            },
            Stmt::BindVar { var, value } => Stmt::BindVar {
                var: f(*var),
                value: f(*value),
            },
            Stmt::SetEq { lhs, rhs, dst } => Stmt::SetEq {
                lhs: f(*lhs),
                rhs: f(*rhs),
                dst: f(*dst),
            },
        }
    }

    fn body(&self) -> Option<&[Stmt]> {
        match self {
            Stmt::Each { body, .. }
            | Stmt::ForLit { body, .. }
            | Stmt::ForVar { body, .. }
            | Stmt::ForFamily { body, .. }
            | Stmt::Dedup { body, .. }
            | Stmt::IfContains { body, .. }
            | Stmt::IfTrue { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Whether every operator in `formula` has a compiled form.
pub fn is_compilation_supported(formula: &Formula) -> bool {
    match formula {
        Formula::Lit { .. } | Formula::Var(_) => true,
        Formula::Up { start, .. } => is_compilation_supported(start),
        Formula::Down { start, keys, .. } => {
            is_compilation_supported(start) && keys.as_deref().is_none_or(is_compilation_supported)
        }
        Formula::Filter { domain, predicate } => {
            is_compilation_supported(domain)
                && matches!(*predicate.body, Formula::Binary { op: BinaryOp::Eq, .. })
                && is_compilation_supported(&predicate.body)
        }
        Formula::Binary {
            op: BinaryOp::Eq,
            lhs,
            rhs,
        } => is_compilation_supported(lhs) && is_compilation_supported(rhs),
        _ => false,
    }
}

/// A column formula lowered to a loop nest, ready to run for any parent cell.
#[derive(Debug, Clone)]
pub struct CompiledFormula {
    code: Vec<Stmt>,
    this: Sym,
    names: Vec<String>,
}

impl CompiledFormula {
    /// Evaluate the formula with `this` bound to `parent`.
    pub fn run<S: FamilyStore>(
        &self,
        ev: &mut Evaluator<'_, S>,
        parent: &CellId,
    ) -> Result<BTreeSet<Value>> {
        let mut machine = run::Machine::new(ev, self.names.len());
        machine.bind_set(self.this, BTreeSet::from([Value::Ref(parent.clone())]));
        machine.run(&self.code)
    }

    fn write_block(&self, f: &mut fmt::Formatter<'_>, stmts: &[Stmt], depth: usize) -> fmt::Result {
        for stmt in stmts {
            let n = |s: &Sym| self.names.get(s.0).map_or("?", String::as_str);
            let line = match stmt {
                Stmt::Each { hole, bind, .. } => format!("each {} in hole{}", n(bind), hole),
                Stmt::Yield(s) => format!("yield {}", n(s)),
                Stmt::NewSet(s) => format!("{} = set()", n(s)),
                Stmt::Insert { set, value } => format!("{}.add({})", n(set), n(value)),
                Stmt::ForLit { values, bind, .. } => {
                    let parts: Vec<String> = values.iter().map(Value::to_string).collect();
                    format!("for {} in [{}]", n(bind), parts.join(", "))
                }
                Stmt::ForVar { var, bind, .. } => format!("for {} in {}", n(bind), n(var)),
                Stmt::ForFamily {
                    column, cell, bind, ..
                } => format!("for {} in family({}, {})", n(bind), column, n(cell)),
                Stmt::Truncate { cell, levels, dst } => {
                    format!("{} = truncate({}, {})", n(dst), n(cell), levels)
                }
                Stmt::LastStep { cell, levels, dst } => {
                    format!("{} = last_step({}, {})", n(dst), n(cell), levels)
                }
                Stmt::Extend { cell, value, dst } => {
                    format!("{} = {}.child({})", n(dst), n(cell), n(value))
                }
                Stmt::Dedup { seen, value, .. } => format!("if {} not in {}", n(value), n(seen)),
                Stmt::IfContains { set, value, .. } => format!("if {} in {}", n(value), n(set)),
                Stmt::IfTrue { cond, .. } => format!("if {}", n(cond)),
                Stmt::BindVar { var, value } => format!("{} = {{{}}}", n(var), n(value)),
                Stmt::SetEq { lhs, rhs, dst } => format!("{} = {} == {}", n(dst), n(lhs), n(rhs)),
            };
            writeln!(f, "{:indent$}{}", "", line, indent = depth * 2)?;
            if let Some(body) = stmt.body() {
                self.write_block(f, body, depth + 1)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for CompiledFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_block(f, &self.code, 0)
    }
}

/// Lower a column formula. `vars` must bind `this`.
pub fn compile<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    formula: &Formula,
) -> Result<CompiledFormula> {
    let mut unit = lower::CompilationUnit::new();
    let this = unit.fresh("this");
    let scope = lower::Scope::unit("this".to_string(), this);
    let code = unit.compile(ev, lower::Template::collect(formula, scope, vars.clone()))?;
    Ok(CompiledFormula {
        code,
        this,
        names: unit.into_names(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::formula::Lambda;
    use crate::engine::model::{FormulaEngine, Settings};
    use crate::engine::schema::{Column, Schema};
    use crate::engine::store::{FamilyRecord, MemoryStore};
    use crate::engine::types::Type;
    use crate::engine::value::QFamilyId;

    fn pet_names() -> Formula {
        Formula::down(
            Formula::down(Formula::this(), ColumnId::new("pet"), None, false),
            ColumnId::new("pet_name"),
            None,
            true,
        )
    }

    fn name_is(var: &str, name: &str) -> Formula {
        Formula::binary(
            BinaryOp::Eq,
            Formula::down(Formula::var(var), ColumnId::new("pet_name"), None, true),
            Formula::text(name),
        )
    }

    fn rex_filter() -> Formula {
        Formula::Filter {
            domain: Box::new(Formula::down(Formula::this(), ColumnId::new("pet"), None, false)),
            predicate: Lambda::new("p", name_is("p", "Rex")),
        }
    }

    /// Person{name}, Person.Pet{name}, plus a computed `rex` field under
    /// Person holding the formula under test.
    fn fixture(formula: Formula) -> (Schema, MemoryStore) {
        let mut schema = Schema::new();
        let mut person = Column::new(ColumnId::new("person"), ColumnId::root());
        person.is_object = true;
        person.object_name = Some("Person".into());
        person.specified_type = Some(Type::Token);
        schema.insert(person, 0).unwrap();
        let mut pet = Column::new(ColumnId::new("pet"), ColumnId::new("person"));
        pet.is_object = true;
        pet.object_name = Some("Pet".into());
        pet.specified_type = Some(Type::Token);
        schema.insert(pet, 0).unwrap();
        let mut pet_name = Column::new(ColumnId::new("pet_name"), ColumnId::new("pet"));
        pet_name.field_name = Some("name".into());
        pet_name.specified_type = Some(Type::Text);
        schema.insert(pet_name, 0).unwrap();
        let mut rex = Column::new(ColumnId::new("rex"), ColumnId::new("person"));
        rex.field_name = Some("rex".into());
        rex.formula = Some(formula);
        schema.insert(rex, 1).unwrap();

        let store = MemoryStore::new();
        store.set(
            QFamilyId::new(ColumnId::new("person"), CellId::root()),
            FamilyRecord::with_values([Value::Token("p".into())].into_iter().collect()),
        );
        let p = CellId::root().child(Value::Token("p".into()));
        store.set(
            QFamilyId::new(ColumnId::new("pet"), p.clone()),
            FamilyRecord::with_values(
                [Value::Token("a".into()), Value::Token("b".into())].into_iter().collect(),
            ),
        );
        for (token, name) in [("a", "Rex"), ("b", "Fido")] {
            store.set(
                QFamilyId::new(ColumnId::new("pet_name"), p.child(Value::Token(token.into()))),
                FamilyRecord::with_values([Value::text(name)].into_iter().collect()),
            );
        }
        (schema, store)
    }

    fn evaluate_rex(formula: Formula, compiler: bool) -> (Option<BTreeSet<Value>>, bool) {
        let (schema, mut store) = fixture(formula);
        let mut engine = FormulaEngine::new();
        let settings = Settings { compiler };
        let mut ev = Evaluator::new(&schema, &mut engine, &mut store, &settings);
        ev.evaluate_all().unwrap();
        let p = CellId::root().child(Value::Token("p".into()));
        let values = ev.read_family(&QFamilyId::new(ColumnId::new("rex"), p));
        (values, engine.is_compiled(&ColumnId::new("rex")))
    }

    fn compile_at_person(formula: &Formula) -> CompiledFormula {
        let (schema, mut store) = fixture(Formula::Dummy);
        let mut engine = FormulaEngine::new();
        let settings = Settings::default();
        let mut ev = Evaluator::new(&schema, &mut engine, &mut store, &settings);
        let vars = VarTypes::unit("this".into(), Type::Reference(ColumnId::new("person")));
        compile(&mut ev, &vars, formula).unwrap()
    }

    fn contains_hole(stmts: &[Stmt]) -> bool {
        stmts
            .iter()
            .any(|s| matches!(s, Stmt::Each { .. }) || s.body().is_some_and(contains_hole))
    }

    #[test]
    fn test_supported_subset() {
        assert!(is_compilation_supported(&pet_names()));
        assert!(is_compilation_supported(&rex_filter()));
        let keyed = Formula::down(
            Formula::this(),
            ColumnId::new("pet"),
            Some(Formula::Lit {
                ty: Type::Token,
                values: vec![Value::Token("a".into())],
            }),
            false,
        );
        assert!(is_compilation_supported(&keyed));
    }

    #[test]
    fn test_unsupported_operators() {
        assert!(!is_compilation_supported(&Formula::Count(Box::new(pet_names()))));
        assert!(!is_compilation_supported(&Formula::binary(
            BinaryOp::Plus,
            Formula::number(1.0),
            Formula::number(2.0)
        )));
        let non_eq_filter = Formula::Filter {
            domain: Box::new(Formula::down(Formula::this(), ColumnId::new("pet"), None, false)),
            predicate: Lambda::new("p", Formula::boolean(true)),
        };
        assert!(!is_compilation_supported(&non_eq_filter));
    }

    #[test]
    fn test_compiled_matches_interpreted() {
        let keyed = Formula::down(
            Formula::this(),
            ColumnId::new("pet"),
            Some(Formula::Lit {
                ty: Type::Token,
                values: vec![Value::Token("b".into()), Value::Token("zzz".into())],
            }),
            true,
        );
        let nested = Formula::Filter {
            domain: Box::new(Formula::down(Formula::this(), ColumnId::new("pet"), None, false)),
            predicate: Lambda::new(
                "p",
                Formula::binary(
                    BinaryOp::Eq,
                    Formula::up(Formula::var("p"), ColumnId::new("person"), false),
                    Formula::this(),
                ),
            ),
        };
        for formula in [
            rex_filter(),
            pet_names(),
            keyed,
            nested,
            Formula::up(Formula::this(), ColumnId::new("person"), true),
            Formula::binary(BinaryOp::Eq, pet_names(), Formula::text("Rex")),
        ] {
            let (interpreted, was_compiled) = evaluate_rex(formula.clone(), false);
            assert!(!was_compiled);
            let (compiled, was_compiled) = evaluate_rex(formula.clone(), true);
            assert!(was_compiled, "{:?} should compile", formula);
            assert_eq!(compiled, interpreted, "{:?}", formula);
        }
    }

    #[test]
    fn test_compiled_filter_keeps_matching_cells() {
        let (values, _) = evaluate_rex(rex_filter(), true);
        let p = CellId::root().child(Value::Token("p".into()));
        assert_eq!(
            values,
            Some(BTreeSet::from([Value::Ref(p.child(Value::Token("a".into())))]))
        );
    }

    #[test]
    fn test_fusion_leaves_no_holes() {
        let compiled = compile_at_person(&rex_filter());
        assert!(!contains_hole(&compiled.code));
        // The final collect, one collect per `=` operand, and the dedup set
        // of each of the two downs.
        let dump = compiled.to_string();
        assert_eq!(dump.matches("= set()").count(), 5, "{}", dump);
        assert!(dump.starts_with("s0 = set()\n"), "{}", dump);
    }

    #[test]
    fn test_sibling_bindings_get_fresh_symbols() {
        let pets_named = |name: &str| Formula::Filter {
            domain: Box::new(Formula::down(Formula::this(), ColumnId::new("pet"), None, false)),
            predicate: Lambda::new("p", name_is("p", name)),
        };
        let formula = Formula::binary(BinaryOp::Eq, pets_named("Rex"), pets_named("Fido"));
        let dump = compile_at_person(&formula).to_string();
        assert!(dump.contains("p0 = {"), "{}", dump);
        assert!(dump.contains("p1 = {"), "{}", dump);
    }
}
