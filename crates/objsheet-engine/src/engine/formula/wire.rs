//! Stored form of formulas: JSON arrays `[op, args...]`.
//!
//! Each operator has a fixed list of [`ArgKind`]s. Decoding walks that list
//! and performs the syntax-only checks (unknown operation, arity, literal
//! shapes); encoding and subformula enumeration use the same table.

use chrono::NaiveDateTime;
use serde_json::{Value as Json, json};

use super::{BinaryOp, Formula, Lambda};
use crate::engine::types::Type;
use crate::engine::value::{CellId, ColumnId, Value};
use crate::error::{Result, validation};

const DATE_WIRE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Operators, one per [`Formula`] variant (binary operators by symbol).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lit,
    Date,
    Var,
    Up,
    Down,
    If,
    Count,
    OneOf,
    Filter,
    Sum,
    Binary(BinaryOp),
    Neg,
    Not,
    Union,
    ToText,
    Dummy,
}

impl Op {
    pub fn of(formula: &Formula) -> Op {
        match formula {
            Formula::Lit { .. } => Op::Lit,
            Formula::Date(_) => Op::Date,
            Formula::Var(_) => Op::Var,
            Formula::Up { .. } => Op::Up,
            Formula::Down { .. } => Op::Down,
            Formula::If { .. } => Op::If,
            Formula::Count(_) => Op::Count,
            Formula::OneOf(_) => Op::OneOf,
            Formula::Filter { .. } => Op::Filter,
            Formula::Sum { .. } => Op::Sum,
            Formula::Binary { op, .. } => Op::Binary(*op),
            Formula::Neg(_) => Op::Neg,
            Formula::Not(_) => Op::Not,
            Formula::Union(_) => Op::Union,
            Formula::ToText(_) => Op::ToText,
            Formula::Dummy => Op::Dummy,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Op::Lit => "lit",
            Op::Date => "date",
            Op::Var => "var",
            Op::Up => "up",
            Op::Down => "down",
            Op::If => "if",
            Op::Count => "count",
            Op::OneOf => "oneOf",
            Op::Filter => "filter",
            Op::Sum => "sum",
            Op::Binary(op) => op.symbol(),
            Op::Neg => "neg",
            Op::Not => "!",
            Op::Union => "union",
            Op::ToText => "toText",
            Op::Dummy => "dummy",
        }
    }

    pub fn from_name(name: &str) -> Option<Op> {
        let op = match name {
            "lit" => Op::Lit,
            "date" => Op::Date,
            "var" => Op::Var,
            "up" => Op::Up,
            "down" => Op::Down,
            "if" => Op::If,
            "count" => Op::Count,
            "oneOf" => Op::OneOf,
            "filter" => Op::Filter,
            "sum" => Op::Sum,
            "neg" => Op::Neg,
            "!" => Op::Not,
            "union" => Op::Union,
            "toText" => Op::ToText,
            "dummy" => Op::Dummy,
            other => Op::Binary(BinaryOp::from_symbol(other)?),
        };
        Some(op)
    }

    pub fn arg_kinds(self) -> &'static [ArgKind] {
        use ArgKind::*;
        match self {
            Op::Lit => &[TypeLiteral, ValueList],
            Op::Date | Op::Var => &[StringLiteral],
            Op::Up => &[EagerSubformulaCells, ColumnLiteral, Flag],
            Op::Down => &[EagerSubformulaCells, ColumnLiteral, OptionalEagerSubformula, Flag],
            Op::If => &[EagerSubformula, LazySubformula, LazySubformula],
            Op::Count | Op::OneOf | Op::Neg | Op::Not | Op::ToText => &[EagerSubformula],
            Op::Filter | Op::Sum => &[EagerSubformula, Lambda],
            Op::Binary(_) => &[EagerSubformula, EagerSubformula],
            Op::Union => &[SubformulaList],
            Op::Dummy => &[],
        }
    }

    /// Parameter name per argument; `None` for non-subformula arguments.
    pub fn param_names(self) -> &'static [Option<&'static str>] {
        match self {
            Op::Lit | Op::Date | Op::Var | Op::Dummy => &[None, None],
            Op::Up => &[Some("start"), None, None],
            Op::Down => &[Some("start"), None, Some("keys"), None],
            Op::If => &[Some("condition"), Some("thenExpr"), Some("elseExpr")],
            Op::Count | Op::OneOf => &[Some("set")],
            Op::Filter => &[Some("set"), Some("predicate")],
            Op::Sum => &[Some("domain"), Some("function")],
            Op::Binary(BinaryOp::In) => &[Some("needle"), Some("haystack")],
            Op::Binary(BinaryOp::Pow) => &[Some("base"), Some("exponent")],
            Op::Binary(_) => &[Some("left"), Some("right")],
            Op::Neg | Op::ToText => &[Some("expr")],
            Op::Not => &[Some("condition")],
            Op::Union => &[Some("part")],
        }
    }
}

/// How one operator argument is stored and interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    EagerSubformula,
    /// A subformula that must evaluate to a set of cells.
    EagerSubformulaCells,
    OptionalEagerSubformula,
    /// Evaluated only on demand (the branches of `if`).
    LazySubformula,
    /// `[var, body]`
    Lambda,
    ColumnLiteral,
    TypeLiteral,
    StringLiteral,
    Flag,
    /// Literal values, typed by the preceding type argument.
    ValueList,
    SubformulaList,
}

/// A decoded argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Formula(Formula),
    Optional(Option<Formula>),
    Lambda(Lambda),
    Column(ColumnId),
    Type(Type),
    Str(String),
    Flag(bool),
    Values(Vec<Value>),
    List(Vec<Formula>),
}

/// A borrowed view of an argument of an existing formula.
#[derive(Debug, Clone, Copy)]
pub enum ArgRef<'a> {
    Formula(&'a Formula),
    Optional(Option<&'a Formula>),
    Lambda(&'a Lambda),
    Column(&'a ColumnId),
    Type(&'a Type),
    Str(&'a str),
    Flag(bool),
    Values(&'a [Value]),
    List(&'a [Formula]),
}

impl ArgKind {
    /// Decode one argument. `earlier` holds the already decoded arguments of
    /// the same operator.
    pub fn decode(self, json: &Json, earlier: &[Arg]) -> Result<Arg> {
        match self {
            ArgKind::EagerSubformula | ArgKind::EagerSubformulaCells | ArgKind::LazySubformula => {
                Ok(Arg::Formula(formula_from_json(json)?))
            }
            ArgKind::OptionalEagerSubformula => match json {
                Json::Null => Ok(Arg::Optional(None)),
                other => Ok(Arg::Optional(Some(formula_from_json(other)?))),
            },
            ArgKind::Lambda => {
                let pair = json
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .ok_or_else(|| validation("Lambda subformula must be a two-element array"))?;
                let var = pair[0]
                    .as_str()
                    .ok_or_else(|| validation("Bound variable must be a string"))?;
                Ok(Arg::Lambda(Lambda::new(var, formula_from_json(&pair[1])?)))
            }
            ArgKind::ColumnLiteral => json
                .as_str()
                .map(|s| Arg::Column(ColumnId::new(s)))
                .ok_or_else(|| validation("Column ID must be a string")),
            ArgKind::TypeLiteral => json
                .as_str()
                .map(|s| Arg::Type(Type::from_name(s)))
                .ok_or_else(|| validation("Type must be a string")),
            ArgKind::StringLiteral => json
                .as_str()
                .map(|s| Arg::Str(s.to_string()))
                .ok_or_else(|| validation("Must be a string")),
            ArgKind::Flag => json
                .as_bool()
                .map(Arg::Flag)
                .ok_or_else(|| validation("wantValues must be a boolean")),
            ArgKind::ValueList => {
                let items = json
                    .as_array()
                    .ok_or_else(|| validation("Set literal must be an array"))?;
                let ty = match earlier.first() {
                    Some(Arg::Type(t)) => t,
                    _ => return Err(validation("Set literal must follow its type")),
                };
                let values = items
                    .iter()
                    .map(|item| value_from_json(ty, item))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Arg::Values(values))
            }
            ArgKind::SubformulaList => {
                let items = json
                    .as_array()
                    .ok_or_else(|| validation("Expected a list of subformulas"))?;
                let list = items
                    .iter()
                    .map(formula_from_json)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Arg::List(list))
            }
        }
    }

    pub fn encode(self, arg: ArgRef<'_>) -> Json {
        match arg {
            ArgRef::Formula(f) => formula_to_json(f),
            ArgRef::Optional(f) => f.map(formula_to_json).unwrap_or(Json::Null),
            ArgRef::Lambda(l) => json!([l.var, formula_to_json(&l.body)]),
            ArgRef::Column(c) => Json::String(c.0.clone()),
            ArgRef::Type(t) => Json::String(t.name().to_string()),
            ArgRef::Str(s) => Json::String(s.to_string()),
            ArgRef::Flag(b) => Json::Bool(b),
            ArgRef::Values(vs) => Json::Array(vs.iter().map(value_to_json).collect()),
            ArgRef::List(fs) => Json::Array(fs.iter().map(formula_to_json).collect()),
        }
    }

    pub fn subformulas<'a>(self, arg: ArgRef<'a>) -> Vec<&'a Formula> {
        match arg {
            ArgRef::Formula(f) => vec![f],
            ArgRef::Optional(f) => f.into_iter().collect(),
            ArgRef::Lambda(l) => vec![l.body.as_ref()],
            ArgRef::List(fs) => fs.iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// Borrowed arguments of a formula, in wire order.
pub fn args_of(formula: &Formula) -> Vec<ArgRef<'_>> {
    match formula {
        Formula::Lit { ty, values } => vec![ArgRef::Type(ty), ArgRef::Values(values)],
        Formula::Date(s) | Formula::Var(s) => vec![ArgRef::Str(s.as_str())],
        Formula::Up {
            start,
            column,
            want_values,
        } => vec![
            ArgRef::Formula(start),
            ArgRef::Column(column),
            ArgRef::Flag(*want_values),
        ],
        Formula::Down {
            start,
            column,
            keys,
            want_values,
        } => vec![
            ArgRef::Formula(start),
            ArgRef::Column(column),
            ArgRef::Optional(keys.as_deref()),
            ArgRef::Flag(*want_values),
        ],
        Formula::If {
            condition,
            then_branch,
            else_branch,
        } => vec![
            ArgRef::Formula(condition),
            ArgRef::Formula(then_branch),
            ArgRef::Formula(else_branch),
        ],
        Formula::Count(e)
        | Formula::OneOf(e)
        | Formula::Neg(e)
        | Formula::Not(e)
        | Formula::ToText(e) => vec![ArgRef::Formula(e)],
        Formula::Filter { domain, predicate: l } | Formula::Sum { domain, addend: l } => {
            vec![ArgRef::Formula(domain), ArgRef::Lambda(l)]
        }
        Formula::Binary { lhs, rhs, .. } => vec![ArgRef::Formula(lhs), ArgRef::Formula(rhs)],
        Formula::Union(parts) => vec![ArgRef::List(parts)],
        Formula::Dummy => Vec::new(),
    }
}

/// Subformulas with parameter names, driven by the operator table.
pub fn subformulas(formula: &Formula) -> Vec<(&'static str, &Formula)> {
    let op = Op::of(formula);
    let names = op.param_names();
    let mut out = Vec::new();
    for (i, (kind, arg)) in op.arg_kinds().iter().zip(args_of(formula)).enumerate() {
        let Some(Some(name)) = names.get(i) else {
            continue;
        };
        for sub in kind.subformulas(arg) {
            out.push((*name, sub));
        }
    }
    out
}

pub fn formula_to_json(formula: &Formula) -> Json {
    let op = Op::of(formula);
    let mut items = vec![Json::String(op.name().to_string())];
    for (kind, arg) in op.arg_kinds().iter().zip(args_of(formula)) {
        items.push(kind.encode(arg));
    }
    Json::Array(items)
}

/// Decode and structurally validate a stored formula.
pub fn formula_from_json(json: &Json) -> Result<Formula> {
    let items = json
        .as_array()
        .ok_or_else(|| validation("Subformula must be an array."))?;
    let name = items
        .first()
        .and_then(Json::as_str)
        .ok_or_else(|| validation("Subformula must begin with an operation name (a string)."))?;
    let op = Op::from_name(name).ok_or_else(|| validation(format!("Unknown operation '{}'", name)))?;
    let kinds = op.arg_kinds();
    let raw = &items[1..];
    if raw.len() != kinds.len() {
        return Err(validation(format!(
            "Wrong number of arguments to '{}' (required {}, got {})",
            name,
            kinds.len(),
            raw.len()
        )));
    }
    let mut args = Vec::with_capacity(kinds.len());
    for (kind, json) in kinds.iter().zip(raw) {
        let arg = kind.decode(json, &args)?;
        args.push(arg);
    }
    build(op, args)
}

pub fn formula_from_str(text: &str) -> Result<Formula> {
    let json: Json = serde_json::from_str(text)
        .map_err(|e| validation(format!("Formula is not valid JSON: {}", e)))?;
    formula_from_json(&json)
}

pub fn formula_to_string(formula: &Formula) -> String {
    formula_to_json(formula).to_string()
}

fn build(op: Op, args: Vec<Arg>) -> Result<Formula> {
    let mut it = args.into_iter();
    let mut next = || it.next().ok_or_else(|| validation("missing argument"));
    let formula = match op {
        Op::Lit => {
            let (Arg::Type(ty), Arg::Values(values)) = (next()?, next()?) else {
                return Err(malformed(op));
            };
            Formula::Lit { ty, values }
        }
        Op::Date => Formula::Date(string_arg(op, next()?)?),
        Op::Var => Formula::Var(string_arg(op, next()?)?),
        Op::Up => {
            let (Arg::Formula(start), Arg::Column(column), Arg::Flag(want_values)) = (next()?, next()?, next()?) else {
                return Err(malformed(op));
            };
            Formula::up(start, column, want_values)
        }
        Op::Down => {
            let (Arg::Formula(start), Arg::Column(column), Arg::Optional(keys), Arg::Flag(want_values)) =
                (next()?, next()?, next()?, next()?)
            else {
                return Err(malformed(op));
            };
            Formula::down(start, column, keys, want_values)
        }
        Op::If => {
            let (Arg::Formula(c), Arg::Formula(t), Arg::Formula(e)) = (next()?, next()?, next()?) else {
                return Err(malformed(op));
            };
            Formula::If {
                condition: Box::new(c),
                then_branch: Box::new(t),
                else_branch: Box::new(e),
            }
        }
        Op::Count | Op::OneOf | Op::Neg | Op::Not | Op::ToText => {
            let Arg::Formula(e) = next()? else {
                return Err(malformed(op));
            };
            let e = Box::new(e);
            match op {
                Op::Count => Formula::Count(e),
                Op::OneOf => Formula::OneOf(e),
                Op::Neg => Formula::Neg(e),
                Op::Not => Formula::Not(e),
                _ => Formula::ToText(e),
            }
        }
        Op::Filter | Op::Sum => {
            let (Arg::Formula(domain), Arg::Lambda(lambda)) = (next()?, next()?) else {
                return Err(malformed(op));
            };
            let domain = Box::new(domain);
            if op == Op::Filter {
                Formula::Filter {
                    domain,
                    predicate: lambda,
                }
            } else {
                Formula::Sum {
                    domain,
                    addend: lambda,
                }
            }
        }
        Op::Binary(bop) => {
            let (Arg::Formula(lhs), Arg::Formula(rhs)) = (next()?, next()?) else {
                return Err(malformed(op));
            };
            Formula::binary(bop, lhs, rhs)
        }
        Op::Union => {
            let Arg::List(parts) = next()? else {
                return Err(malformed(op));
            };
            Formula::Union(parts)
        }
        Op::Dummy => Formula::Dummy,
    };
    Ok(formula)
}

fn string_arg(op: Op, arg: Arg) -> Result<String> {
    match arg {
        Arg::Str(s) => Ok(s),
        _ => Err(malformed(op)),
    }
}

fn malformed(op: Op) -> crate::EngineError {
    validation(format!("Malformed arguments to '{}'", op.name()))
}

pub fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) => {
            let x = n.get();
            if x.fract() == 0.0 && x.abs() < 9.0e15 {
                json!(x as i64)
            } else {
                json!(x)
            }
        }
        Value::Text(s) | Value::Token(s) => Json::String(s.clone()),
        Value::Date(d) => Json::String(d.format(DATE_WIRE_FORMAT).to_string()),
        Value::Unit => Json::String("X".to_string()),
        Value::Ref(cell) => Json::Array(cell.steps().iter().map(value_to_json).collect()),
    }
}

/// Decode a literal element of type `ty`.
pub fn value_from_json(ty: &Type, json: &Json) -> Result<Value> {
    let bad = || {
        validation(format!(
            "Literal {} is not a valid value of type '{}'",
            json, ty
        ))
    };
    match ty {
        Type::Text => json.as_str().map(Value::text).ok_or_else(bad),
        Type::Token => json
            .as_str()
            .map(|s| Value::Token(s.to_string()))
            .ok_or_else(bad),
        Type::Number => json.as_f64().map(Value::number).ok_or_else(bad),
        Type::Bool => json.as_bool().map(Value::Bool).ok_or_else(bad),
        Type::Date => json
            .as_str()
            .and_then(|s| NaiveDateTime::parse_from_str(s, DATE_WIRE_FORMAT).ok())
            .map(Value::Date)
            .ok_or_else(bad),
        Type::Unit => Ok(Value::Unit),
        Type::Reference(column) => match json.as_array() {
            Some(steps) if steps.is_empty() && column.is_root() => Ok(Value::Ref(CellId::root())),
            _ => Err(validation("Reference literals are only supported for the root column")),
        },
        Type::Empty | Type::Error => Err(bad()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_navigation() {
        let json = json!(["down", ["var", "this"], "pet", null, false]);
        let f = formula_from_json(&json).unwrap();
        assert_eq!(
            f,
            Formula::down(Formula::this(), ColumnId::new("pet"), None, false)
        );
        assert_eq!(formula_to_json(&f), json);
    }

    #[test]
    fn test_root_literal() {
        let json = json!(["lit", "_root", [[]]]);
        let f = formula_from_json(&json).unwrap();
        assert_eq!(f, Formula::root());
        assert_eq!(formula_to_json(&f), json);
        assert!(formula_from_json(&json!(["lit", "pet", [["a"]]])).is_err());
    }

    #[test]
    fn test_decode_errors() {
        let cases = [
            (json!("up"), "Subformula must be an array."),
            (json!([3]), "Subformula must begin with an operation name (a string)."),
            (json!(["frob"]), "Unknown operation 'frob'"),
            (
                json!(["count"]),
                "Wrong number of arguments to 'count' (required 1, got 0)",
            ),
            (
                json!(["filter", ["dummy"], ["x"]]),
                "Lambda subformula must be a two-element array",
            ),
            (
                json!(["up", ["var", "this"], "p", 1]),
                "wantValues must be a boolean",
            ),
            (json!(["lit", "number", 5]), "Set literal must be an array"),
        ];
        for (json, message) in cases {
            let err = formula_from_json(&json).unwrap_err();
            assert_eq!(err.message(), message);
        }
    }

    #[test]
    fn test_lambda_and_union_round_trip() {
        let json = json!([
            "filter",
            ["union", [["lit", "number", [1, 2]], ["dummy"]]],
            ["x", [">", ["var", "x"], ["lit", "number", [1]]]]
        ]);
        let f = formula_from_json(&json).unwrap();
        assert!(matches!(&f, Formula::Filter { predicate, .. } if predicate.var == "x"));
        assert_eq!(formula_to_json(&f), json);
        let subs: Vec<&str> = subformulas(&f).into_iter().map(|(n, _)| n).collect();
        assert_eq!(subs, vec!["set", "predicate"]);
    }

    #[test]
    fn test_date_literal_values() {
        let v = value_from_json(&Type::Date, &json!("2015-01-01T10:30:00")).unwrap();
        assert_eq!(value_to_json(&v), json!("2015-01-01T10:30:00"));
        assert!(value_from_json(&Type::Number, &json!("x")).is_err());
    }
}
