//! The formula language.
//!
//! A formula is a tree of [`Formula`] nodes. Every operator goes through the
//! same four passes:
//!
//! - [`validate_formula`] - variable scoping, no schema needed
//! - [`typecheck_formula`] - schema-aware static checking
//! - [`evaluate_formula`] - computes a [`TypedSet`](super::TypedSet)
//! - [`stringify_formula`] - renders canonical concrete syntax
//!
//! [`parse_formula`] is the inverse of the last pass; [`wire`] converts to and
//! from the stored JSON form.

mod eval;
mod lexer;
mod parser;
mod resolve;
mod stringify;
mod typecheck;
mod validate;
pub mod wire;

use super::types::Type;
use super::value::{ColumnId, Value};

pub use eval::{VarValues, evaluate_formula, read_family_for_formula};
pub(crate) use eval::get_values;
pub(crate) use lexer::{Lexer, Token, is_plain_ident};
pub use parser::{parse_formula, parse_formula_with_vars};
pub(crate) use parser::Parser;
pub use resolve::resolve_navigation;
pub(crate) use resolve::validate_and_typecheck;
pub use stringify::{stringify_formula, stringify_formula_with_vars, stringify_ident};
pub(crate) use stringify::stringify_subformula;
pub use typecheck::{try_typecheck_formula, typecheck_formula};
pub(crate) use typecheck::{check_column_exists, val_expect_type};
pub use validate::validate_formula;

/// Variable name to type, as seen by typechecking and name resolution.
pub type VarTypes = im::HashMap<String, Type>;

pub const PRECEDENCE_OR: u8 = 1;
pub const PRECEDENCE_AND: u8 = 2;
pub const PRECEDENCE_COMPARE: u8 = 3;
pub const PRECEDENCE_PLUS: u8 = 4;
pub const PRECEDENCE_TIMES: u8 = 5;
pub const PRECEDENCE_NEG: u8 = 6;
pub const PRECEDENCE_POW: u8 = 7;
pub const PRECEDENCE_NAV: u8 = 8;
pub const PRECEDENCE_LOWEST: u8 = PRECEDENCE_OR;
pub const PRECEDENCE_ATOMIC: u8 = PRECEDENCE_NAV;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Associativity {
    Left,
    Right,
    None,
}

/// Infix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    Ne,
    In,
    Plus,
    Minus,
    Times,
    Divide,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 14] = [
        BinaryOp::Eq,
        BinaryOp::Ne,
        BinaryOp::In,
        BinaryOp::Plus,
        BinaryOp::Minus,
        BinaryOp::Times,
        BinaryOp::Divide,
        BinaryOp::Pow,
        BinaryOp::Lt,
        BinaryOp::Le,
        BinaryOp::Gt,
        BinaryOp::Ge,
        BinaryOp::And,
        BinaryOp::Or,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::In => "in",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Times => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    pub fn from_symbol(s: &str) -> Option<BinaryOp> {
        BinaryOp::ALL.into_iter().find(|op| op.symbol() == s)
    }

    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => PRECEDENCE_OR,
            BinaryOp::And => PRECEDENCE_AND,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::In
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => PRECEDENCE_COMPARE,
            BinaryOp::Plus | BinaryOp::Minus => PRECEDENCE_PLUS,
            BinaryOp::Times | BinaryOp::Divide => PRECEDENCE_TIMES,
            BinaryOp::Pow => PRECEDENCE_POW,
        }
    }

    pub fn associativity(self) -> Associativity {
        match self.precedence() {
            PRECEDENCE_COMPARE => Associativity::None,
            PRECEDENCE_POW => Associativity::Right,
            _ => Associativity::Left,
        }
    }

    /// Names of the two operands, used by the subformula tree.
    pub fn param_names(self) -> [&'static str; 2] {
        match self {
            BinaryOp::In => ["needle", "haystack"],
            BinaryOp::Pow => ["base", "exponent"],
            _ => ["left", "right"],
        }
    }
}

/// A bound variable and the body evaluated for each binding.
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub var: String,
    pub body: Box<Formula>,
}

impl Lambda {
    pub fn new(var: impl Into<String>, body: Formula) -> Self {
        Lambda {
            var: var.into(),
            body: Box::new(body),
        }
    }
}

/// Formula abstract syntax.
#[derive(Debug, Clone, PartialEq)]
pub enum Formula {
    /// A literal set of `values` of type `ty`.
    Lit { ty: Type, values: Vec<Value> },
    /// A date parsed from text when evaluated.
    Date(String),
    Var(String),
    Up {
        start: Box<Formula>,
        column: ColumnId,
        want_values: bool,
    },
    Down {
        start: Box<Formula>,
        column: ColumnId,
        keys: Option<Box<Formula>>,
        want_values: bool,
    },
    If {
        condition: Box<Formula>,
        then_branch: Box<Formula>,
        else_branch: Box<Formula>,
    },
    Count(Box<Formula>),
    OneOf(Box<Formula>),
    Filter { domain: Box<Formula>, predicate: Lambda },
    Sum { domain: Box<Formula>, addend: Lambda },
    Binary {
        op: BinaryOp,
        lhs: Box<Formula>,
        rhs: Box<Formula>,
    },
    Neg(Box<Formula>),
    Not(Box<Formula>),
    Union(Vec<Formula>),
    ToText(Box<Formula>),
    /// The empty set of type `empty`.
    Dummy,
}

impl Formula {
    pub fn var(name: impl Into<String>) -> Formula {
        Formula::Var(name.into())
    }

    pub fn this() -> Formula {
        Formula::Var("this".to_string())
    }

    /// `$`: the root cell.
    pub fn root() -> Formula {
        Formula::Lit {
            ty: Type::Reference(ColumnId::root()),
            values: vec![Value::Ref(super::value::CellId::root())],
        }
    }

    pub fn number(x: f64) -> Formula {
        Formula::Lit {
            ty: Type::Number,
            values: vec![Value::number(x)],
        }
    }

    pub fn text(s: impl Into<String>) -> Formula {
        Formula::Lit {
            ty: Type::Text,
            values: vec![Value::text(s)],
        }
    }

    pub fn boolean(b: bool) -> Formula {
        Formula::Lit {
            ty: Type::Bool,
            values: vec![Value::Bool(b)],
        }
    }

    pub fn up(start: Formula, column: ColumnId, want_values: bool) -> Formula {
        Formula::Up {
            start: Box::new(start),
            column,
            want_values,
        }
    }

    pub fn down(start: Formula, column: ColumnId, keys: Option<Formula>, want_values: bool) -> Formula {
        Formula::Down {
            start: Box::new(start),
            column,
            keys: keys.map(Box::new),
            want_values,
        }
    }

    pub fn binary(op: BinaryOp, lhs: Formula, rhs: Formula) -> Formula {
        Formula::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self, Formula::Dummy)
    }

    /// Operator name as it appears in the stored form.
    pub fn op_name(&self) -> &'static str {
        wire::Op::of(self).name()
    }

    /// Direct subformulas paired with their parameter names.
    pub fn subformulas(&self) -> Vec<(&'static str, &Formula)> {
        wire::subformulas(self)
    }
}

/// Operator tree of a formula with parameter names, for formula debugging views.
#[derive(Debug, Clone, PartialEq)]
pub struct SubformulaTree {
    pub formula: Formula,
    pub children: Vec<(String, SubformulaTree)>,
}

/// Build the operator tree. List children are named `part1`, `part2`, ... unless
/// there is exactly one.
pub fn get_subformula_tree(formula: &Formula) -> SubformulaTree {
    let subs = formula.subformulas();
    let is_list = matches!(formula, Formula::Union(parts) if parts.len() != 1);
    let children = subs
        .into_iter()
        .enumerate()
        .map(|(i, (name, f))| {
            let name = if is_list {
                format!("{}{}", name, i + 1)
            } else {
                name.to_string()
            };
            (name, get_subformula_tree(f))
        })
        .collect();
    SubformulaTree {
        formula: formula.clone(),
        children,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BinaryOp::Or, PRECEDENCE_OR, Associativity::Left)]
    #[case(BinaryOp::And, PRECEDENCE_AND, Associativity::Left)]
    #[case(BinaryOp::In, PRECEDENCE_COMPARE, Associativity::None)]
    #[case(BinaryOp::Ge, PRECEDENCE_COMPARE, Associativity::None)]
    #[case(BinaryOp::Minus, PRECEDENCE_PLUS, Associativity::Left)]
    #[case(BinaryOp::Divide, PRECEDENCE_TIMES, Associativity::Left)]
    #[case(BinaryOp::Pow, PRECEDENCE_POW, Associativity::Right)]
    fn test_operator_table(#[case] op: BinaryOp, #[case] prec: u8, #[case] assoc: Associativity) {
        assert_eq!(op.precedence(), prec);
        assert_eq!(op.associativity(), assoc);
        assert_eq!(BinaryOp::from_symbol(op.symbol()), Some(op));
    }

    #[test]
    fn test_subformula_tree_names_list_parts() {
        let f = Formula::Union(vec![Formula::number(1.0), Formula::number(2.0)]);
        let tree = get_subformula_tree(&f);
        let names: Vec<&str> = tree.children.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["part1", "part2"]);

        let f = Formula::binary(BinaryOp::In, Formula::number(1.0), Formula::Dummy);
        let tree = get_subformula_tree(&f);
        assert_eq!(tree.children[0].0, "needle");
        assert_eq!(tree.children[1].0, "haystack");
    }
}
