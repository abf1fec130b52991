//! Formula to IR lowering and hole substitution.

use std::collections::HashMap;

use super::{Stmt, Sym};
use crate::engine::formula::{BinaryOp, Formula, VarTypes, typecheck_formula};
use crate::engine::model::Evaluator;
use crate::engine::store::FamilyStore;
use crate::engine::types::Type;
use crate::error::{Result, internal};

/// Formula variable name to the symbol holding its set.
pub(crate) type Scope = im::HashMap<String, Sym>;

/// A subcomputation to compile: a formula in its scope, or the collected
/// set of one.
pub(crate) enum Template<'f> {
    Formula {
        formula: &'f Formula,
        scope: Scope,
        vars: VarTypes,
    },
    Collect(Box<Template<'f>>),
}

impl<'f> Template<'f> {
    fn formula(formula: &'f Formula, scope: &Scope, vars: &VarTypes) -> Self {
        Template::Formula {
            formula,
            scope: scope.clone(),
            vars: vars.clone(),
        }
    }

    pub(crate) fn collect(formula: &'f Formula, scope: Scope, vars: VarTypes) -> Self {
        Template::Collect(Box::new(Template::Formula {
            formula,
            scope,
            vars,
        }))
    }
}

/// One operator's code with its holes still open.
struct Fragment<'f> {
    holes: Vec<Template<'f>>,
    body: Vec<Stmt>,
}

/// Symbol allocator for one compiled formula.
#[derive(Debug, Default)]
pub(crate) struct CompilationUnit {
    mnemonics: HashMap<String, usize>,
    names: Vec<String>,
}

impl CompilationUnit {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A symbol never handed out before, named `<base><n>`.
    pub(crate) fn fresh(&mut self, base: &str) -> Sym {
        let n = self.mnemonics.entry(base.to_string()).or_insert(0);
        self.names.push(format!("{}{}", base, n));
        *n += 1;
        Sym(self.names.len() - 1)
    }

    pub(crate) fn into_names(self) -> Vec<String> {
        self.names
    }

    /// Compile a template into hole-free code.
    pub(crate) fn compile<S: FamilyStore>(
        &mut self,
        ev: &mut Evaluator<'_, S>,
        template: Template<'_>,
    ) -> Result<Vec<Stmt>> {
        let fragment = self.fragment(ev, template)?;
        let mut sources = Vec::with_capacity(fragment.holes.len());
        for hole in fragment.holes {
            sources.push(self.compile(ev, hole)?);
        }
        Ok(substitute(&fragment.body, &sources))
    }

    fn fragment<'f, S: FamilyStore>(
        &mut self,
        ev: &mut Evaluator<'_, S>,
        template: Template<'f>,
    ) -> Result<Fragment<'f>> {
        let (formula, scope, vars) = match template {
            Template::Collect(inner) => {
                let s = self.fresh("s");
                let v = self.fresh("v");
                return Ok(Fragment {
                    holes: vec![*inner],
                    body: vec![
                        Stmt::NewSet(s),
                        Stmt::Each {
                            hole: 0,
                            bind: v,
                            body: vec![Stmt::Insert { set: s, value: v }],
                        },
                        Stmt::Yield(s),
                    ],
                });
            }
            Template::Formula {
                formula,
                scope,
                vars,
            } => (formula, scope, vars),
        };
        let fragment = match formula {
            Formula::Lit { values, .. } => {
                let e = self.fresh("e");
                Fragment {
                    holes: Vec::new(),
                    body: vec![Stmt::ForLit {
                        values: values.clone(),
                        bind: e,
                        body: vec![Stmt::Yield(e)],
                    }],
                }
            }
            Formula::Var(name) => {
                let var = *scope.get(name).ok_or_else(|| {
                    internal(format!("unbound variable '{}' in compiled formula", name))
                })?;
                let e = self.fresh("e");
                Fragment {
                    holes: Vec::new(),
                    body: vec![Stmt::ForVar {
                        var,
                        bind: e,
                        body: vec![Stmt::Yield(e)],
                    }],
                }
            }
            Formula::Up {
                start,
                column,
                want_values,
            } => {
                let levels = match typecheck_formula(ev, &vars, start)? {
                    Type::Reference(start_column) => ev.levels_up(&start_column, column)?,
                    other => {
                        return Err(internal(format!(
                            "up navigation from non-reference type {}",
                            other
                        )));
                    }
                };
                let v = self.fresh("v");
                let e = self.fresh("e");
                let step = if *want_values {
                    Stmt::LastStep { cell: v, levels, dst: e }
                } else {
                    Stmt::Truncate { cell: v, levels, dst: e }
                };
                Fragment {
                    holes: vec![Template::formula(start, &scope, &vars)],
                    body: vec![Stmt::Each {
                        hole: 0,
                        bind: v,
                        body: vec![step, Stmt::Yield(e)],
                    }],
                }
            }
            Formula::Down {
                start,
                column,
                keys,
                want_values,
            } => {
                let s = self.fresh("s");
                let v = self.fresh("v");
                let x = self.fresh("x");
                let mut emit = Vec::new();
                let yielded = if *want_values {
                    x
                } else {
                    let e = self.fresh("e");
                    emit.push(Stmt::Extend { cell: v, value: x, dst: e });
                    e
                };
                emit.push(Stmt::Yield(yielded));
                let mut holes = vec![Template::formula(start, &scope, &vars)];
                let (k, per_value) = match keys {
                    Some(keys) => {
                        let k = self.fresh("k");
                        holes.push(Template::Collect(Box::new(Template::formula(
                            keys, &scope, &vars,
                        ))));
                        (Some(k), vec![Stmt::IfContains {
                            set: k,
                            value: x,
                            body: emit,
                        }])
                    }
                    None => (None, emit),
                };
                let scan = Stmt::Each {
                    hole: 0,
                    bind: v,
                    body: vec![Stmt::Dedup {
                        seen: s,
                        value: v,
                        body: vec![Stmt::ForFamily {
                            column: column.clone(),
                            cell: v,
                            bind: x,
                            body: per_value,
                        }],
                    }],
                };
                let body = match k {
                    Some(k) => vec![
                        Stmt::NewSet(s),
                        Stmt::Each {
                            hole: 1,
                            bind: k,
                            body: vec![scan],
                        },
                    ],
                    None => vec![Stmt::NewSet(s), scan],
                };
                Fragment { holes, body }
            }
            Formula::Filter { domain, predicate } => {
                let domain_type = typecheck_formula(ev, &vars, domain)?;
                let bound = self.fresh(&predicate.var);
                let v = self.fresh("v");
                let u = self.fresh("u");
                let inner_scope = scope.update(predicate.var.clone(), bound);
                let inner_vars = vars.update(predicate.var.clone(), domain_type);
                Fragment {
                    holes: vec![
                        Template::formula(domain, &scope, &vars),
                        Template::Formula {
                            formula: &predicate.body,
                            scope: inner_scope,
                            vars: inner_vars,
                        },
                    ],
                    body: vec![Stmt::Each {
                        hole: 0,
                        bind: v,
                        body: vec![
                            Stmt::BindVar { var: bound, value: v },
                            Stmt::Each {
                                hole: 1,
                                bind: u,
                                body: vec![Stmt::IfTrue {
                                    cond: u,
                                    body: vec![Stmt::Yield(v)],
                                }],
                            },
                        ],
                    }],
                }
            }
            Formula::Binary {
                op: BinaryOp::Eq,
                lhs,
                rhs,
            } => {
                let v = self.fresh("v");
                let u = self.fresh("u");
                let c = self.fresh("c");
                Fragment {
                    holes: vec![
                        Template::Collect(Box::new(Template::formula(lhs, &scope, &vars))),
                        Template::Collect(Box::new(Template::formula(rhs, &scope, &vars))),
                    ],
                    body: vec![Stmt::Each {
                        hole: 0,
                        bind: v,
                        body: vec![Stmt::Each {
                            hole: 1,
                            bind: u,
                            body: vec![Stmt::SetEq { lhs: v, rhs: u, dst: c }, Stmt::Yield(c)],
                        }],
                    }],
                }
            }
            other => {
                return Err(internal(format!(
                    "operator '{}' has no compiled form",
                    other.op_name()
                )));
            }
        };
        Ok(fragment)
    }
}

/// Replace every hole in `body` by its compiled source, running the hole's
/// consumer at each of the source's yields.
fn substitute(body: &[Stmt], sources: &[Vec<Stmt>]) -> Vec<Stmt> {
    let mut out = Vec::with_capacity(body.len());
    for stmt in body {
        match stmt {
            Stmt::Each {
                hole,
                bind,
                body: consumer,
            } => {
                let consumer = substitute(consumer, sources);
                out.extend(inline(&sources[*hole], *bind, &consumer));
            }
            other => out.push(with_body(other, |b| substitute(b, sources))),
        }
    }
    out
}

/// `source` with each `Yield(y)` replaced by `consumer` renamed `bind -> y`.
fn inline(source: &[Stmt], bind: Sym, consumer: &[Stmt]) -> Vec<Stmt> {
    let mut out = Vec::new();
    for stmt in source {
        match stmt {
            Stmt::Yield(y) => {
                let y = *y;
                out.extend(
                    consumer
                        .iter()
                        .map(|s| s.map_syms(&|sym| if sym == bind { y } else { sym })),
                );
            }
            other => out.push(with_body(other, |b| inline(b, bind, consumer))),
        }
    }
    out
}

/// `stmt` with its nested body, if any, rewritten by `f`.
fn with_body(stmt: &Stmt, f: impl Fn(&[Stmt]) -> Vec<Stmt>) -> Stmt {
    let mut stmt = stmt.clone();
    match &mut stmt {
        Stmt::Each { body, .. }
        | Stmt::ForLit { body, .. }
        | Stmt::ForVar { body, .. }
        | Stmt::ForFamily { body, .. }
        | Stmt::Dedup { body, .. }
        | Stmt::IfContains { body, .. }
        | Stmt::IfTrue { body, .. } => *body = f(body),
        _ => {}
    }
    stmt
}
