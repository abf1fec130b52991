//! Recursive-descent parser for formula concrete syntax.
//!
//! Navigation is resolved while parsing, so the parser needs the schema and
//! the types of the variables in scope.

use super::lexer::{Lexer, Token, is_keyword};
use super::resolve::validate_and_typecheck;
use super::{BinaryOp, Formula, Lambda, VarTypes, resolve_navigation};
use crate::engine::model::Evaluator;
use crate::engine::store::FamilyStore;
use crate::engine::types::Type;
use crate::error::{Result, validation};

/// Parse a column formula whose `this` has type `this_type`.
pub fn parse_formula<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    this_type: &Type,
    text: &str,
) -> Result<Formula> {
    let vars = VarTypes::unit("this".to_string(), this_type.clone());
    parse_formula_with_vars(ev, &vars, text)
}

pub fn parse_formula_with_vars<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    vars: &VarTypes,
    text: &str,
) -> Result<Formula> {
    let mut parser = Parser::new(ev, vars.clone(), Lexer::new(text, false)?);
    let formula = parser.expression()?;
    if *parser.lexer.peek() != Token::Eof {
        return Err(parser.lexer.unexpected("end of formula"));
    }
    Ok(formula)
}

/// Parser state. The procedure parser drives the same struct for the
/// expressions inside statements.
pub(crate) struct Parser<'p, 'a, S: FamilyStore> {
    pub(crate) ev: &'p mut Evaluator<'a, S>,
    pub(crate) vars: VarTypes,
    pub(crate) lexer: Lexer,
}

impl<'p, 'a, S: FamilyStore> Parser<'p, 'a, S> {
    pub(crate) fn new(ev: &'p mut Evaluator<'a, S>, vars: VarTypes, lexer: Lexer) -> Self {
        Parser { ev, vars, lexer }
    }

    /// Bind `name` to the type of `formula` for the rest of the scope.
    pub(crate) fn bind_var(&mut self, name: &str, formula: &Formula) -> Result<()> {
        let ty = validate_and_typecheck(self.ev, &self.vars, formula)?;
        self.vars.insert(name.to_string(), ty);
        Ok(())
    }

    fn navigate(&mut self, start: Option<Formula>, name: &str, keys: Option<Formula>) -> Result<Formula> {
        resolve_navigation(self.ev, &self.vars, start, name, keys)
    }

    /// An identifier for a binding: bare (non-keyword) or backquoted.
    pub(crate) fn ident(&mut self) -> Result<String> {
        match self.lexer.peek().clone() {
            Token::Ident(s) if !is_keyword(&s) => {
                self.lexer.next_token();
                Ok(s)
            }
            Token::Quoted(s) => {
                self.lexer.next_token();
                Ok(s)
            }
            _ => Err(self.lexer.unexpected("an identifier")),
        }
    }

    /// A navigation step name; also accepts the `[field]` fallback form.
    fn step_name(&mut self) -> Result<Option<String>> {
        match self.lexer.peek().clone() {
            Token::Ident(s) if !is_keyword(&s) => {
                self.lexer.next_token();
                Ok(Some(s))
            }
            Token::Quoted(s) => {
                self.lexer.next_token();
                Ok(Some(s))
            }
            Token::Sym("[") => {
                if let (Token::Ident(s), Token::Sym("]")) =
                    (self.lexer.peek_at(1).clone(), self.lexer.peek_at(2).clone())
                {
                    self.lexer.next_token();
                    self.lexer.next_token();
                    self.lexer.next_token();
                    return Ok(Some(format!("[{}]", s)));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn keys(&mut self) -> Result<Option<Formula>> {
        if self.lexer.eat_sym("[") {
            let keys = self.expression()?;
            self.lexer.expect_sym("]")?;
            Ok(Some(keys))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn expression(&mut self) -> Result<Formula> {
        self.or_expr()
    }

    fn left_assoc(
        &mut self,
        ops: &[BinaryOp],
        operand: fn(&mut Self) -> Result<Formula>,
    ) -> Result<Formula> {
        let mut lhs = operand(self)?;
        loop {
            let Some(op) = ops.iter().copied().find(|op| self.at_op(*op)) else {
                return Ok(lhs);
            };
            self.lexer.next_token();
            let rhs = operand(self)?;
            lhs = Formula::binary(op, lhs, rhs);
        }
    }

    fn at_op(&self, op: BinaryOp) -> bool {
        match op {
            BinaryOp::In => self.lexer.at_keyword("in"),
            other => self.lexer.at_sym(other.symbol()),
        }
    }

    fn or_expr(&mut self) -> Result<Formula> {
        self.left_assoc(&[BinaryOp::Or], Self::and_expr)
    }

    fn and_expr(&mut self) -> Result<Formula> {
        self.left_assoc(&[BinaryOp::And], Self::compare_expr)
    }

    fn compare_expr(&mut self) -> Result<Formula> {
        const COMPARE: [BinaryOp; 7] = [
            BinaryOp::Eq,
            BinaryOp::Ne,
            BinaryOp::In,
            BinaryOp::Lt,
            BinaryOp::Le,
            BinaryOp::Gt,
            BinaryOp::Ge,
        ];
        let lhs = self.plus_expr()?;
        let Some(op) = COMPARE.into_iter().find(|op| self.at_op(*op)) else {
            return Ok(lhs);
        };
        self.lexer.next_token();
        let rhs = self.plus_expr()?;
        if COMPARE.iter().any(|op| self.at_op(*op)) {
            return Err(validation(
                "Comparison operators do not associate; use parentheses.",
            ));
        }
        Ok(Formula::binary(op, lhs, rhs))
    }

    fn plus_expr(&mut self) -> Result<Formula> {
        self.left_assoc(&[BinaryOp::Plus, BinaryOp::Minus], Self::times_expr)
    }

    fn times_expr(&mut self) -> Result<Formula> {
        self.left_assoc(&[BinaryOp::Times, BinaryOp::Divide], Self::unary_expr)
    }

    fn unary_expr(&mut self) -> Result<Formula> {
        if self.lexer.eat_sym("-") {
            return Ok(Formula::Neg(Box::new(self.unary_expr()?)));
        }
        if self.lexer.eat_sym("!") {
            return Ok(Formula::Not(Box::new(self.unary_expr()?)));
        }
        self.pow_expr()
    }

    fn pow_expr(&mut self) -> Result<Formula> {
        let base = self.postfix_expr()?;
        if self.lexer.eat_sym("^") {
            let exponent = self.unary_expr()?;
            return Ok(Formula::binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn postfix_expr(&mut self) -> Result<Formula> {
        let mut formula = self.primary()?;
        while self.lexer.eat_sym(".") {
            let name = self
                .step_name()?
                .ok_or_else(|| self.lexer.unexpected("a name after '.'"))?;
            let keys = self.keys()?;
            formula = self.navigate(Some(formula), &name, keys)?;
        }
        Ok(formula)
    }

    fn primary(&mut self) -> Result<Formula> {
        if let Some(name) = self.step_name()? {
            let keys = self.keys()?;
            return self.navigate(None, &name, keys);
        }
        match self.lexer.next_token() {
            Token::Number(x) => Ok(Formula::number(x)),
            Token::Str(s) => Ok(Formula::text(s)),
            Token::Date(s) => Ok(Formula::Date(s)),
            Token::Sym("$") => match self.step_name()? {
                Some(name) => {
                    let keys = self.keys()?;
                    self.navigate(Some(Formula::root()), &name, keys)
                }
                None => Ok(Formula::root()),
            },
            Token::Sym("(") => {
                let inner = self.expression()?;
                self.lexer.expect_sym(")")?;
                Ok(inner)
            }
            Token::Sym("{") => self.braces(),
            Token::Ident(word) => self.keyword_expr(&word),
            other => Err(validation(format!(
                "Parse error: unexpected {}",
                other.describe()
            ))),
        }
    }

    fn keyword_expr(&mut self, word: &str) -> Result<Formula> {
        match word {
            "true" => Ok(Formula::boolean(true)),
            "false" => Ok(Formula::boolean(false)),
            "dummy" => Ok(Formula::Dummy),
            "if" => {
                self.lexer.expect_sym("(")?;
                let condition = self.expression()?;
                self.lexer.expect_sym(",")?;
                let then_branch = self.expression()?;
                self.lexer.expect_sym(",")?;
                let else_branch = self.expression()?;
                self.lexer.expect_sym(")")?;
                Ok(Formula::If {
                    condition: Box::new(condition),
                    then_branch: Box::new(then_branch),
                    else_branch: Box::new(else_branch),
                })
            }
            "count" | "oneOf" | "toText" => {
                self.lexer.expect_sym("(")?;
                let arg = Box::new(self.expression()?);
                self.lexer.expect_sym(")")?;
                Ok(match word {
                    "count" => Formula::Count(arg),
                    "oneOf" => Formula::OneOf(arg),
                    _ => Formula::ToText(arg),
                })
            }
            "sum" => {
                self.lexer.expect_sym("[")?;
                let var = self.ident()?;
                self.lexer.expect_sym(":")?;
                let domain = self.expression()?;
                self.lexer.expect_sym("]")?;
                self.lexer.expect_sym("(")?;
                let body = self.with_bound_var(&var, &domain, Self::expression)?;
                self.lexer.expect_sym(")")?;
                Ok(Formula::Sum {
                    domain: Box::new(domain),
                    addend: Lambda::new(var, body),
                })
            }
            other => Err(validation(format!("Parse error: unexpected '{}'", other))),
        }
    }

    /// `{}`, `{a, b, ...}` or `{x : domain | predicate}`.
    fn braces(&mut self) -> Result<Formula> {
        if self.lexer.eat_sym("}") {
            return Ok(Formula::Union(Vec::new()));
        }
        let is_filter = matches!(self.lexer.peek(), Token::Ident(_) | Token::Quoted(_))
            && matches!(self.lexer.peek_at(1), Token::Sym(":"));
        if is_filter {
            let var = self.ident()?;
            self.lexer.expect_sym(":")?;
            let domain = self.expression()?;
            self.lexer.expect_sym("|")?;
            let predicate = self.with_bound_var(&var, &domain, Self::expression)?;
            self.lexer.expect_sym("}")?;
            return Ok(Formula::Filter {
                domain: Box::new(domain),
                predicate: Lambda::new(var, predicate),
            });
        }
        let mut parts = vec![self.expression()?];
        while self.lexer.eat_sym(",") {
            if self.lexer.at_sym("}") {
                break;
            }
            parts.push(self.expression()?);
        }
        self.lexer.expect_sym("}")?;
        Ok(Formula::Union(parts))
    }

    /// Parse with `var` bound to the element type of `domain`, then unbind it.
    fn with_bound_var(
        &mut self,
        var: &str,
        domain: &Formula,
        body: fn(&mut Self) -> Result<Formula>,
    ) -> Result<Formula> {
        let saved = self.vars.clone();
        self.bind_var(var, domain)?;
        let result = body(self);
        self.vars = saved;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::formula::stringify_formula;
    use crate::engine::model::{FormulaEngine, Settings};
    use crate::engine::schema::{Column, Schema};
    use crate::engine::store::MemoryStore;
    use crate::engine::value::ColumnId;
    use rstest::rstest;

    /// Person{name, age}, Person.Pet{name}
    fn schema() -> Schema {
        let mut schema = Schema::new();
        let mut person = Column::new(ColumnId::new("person"), ColumnId::root());
        person.is_object = true;
        person.object_name = Some("Person".into());
        person.specified_type = Some(Type::Token);
        schema.insert(person, 0).unwrap();
        for (i, (id, field, ty)) in [("person_name", "name", Type::Text), ("age", "age", Type::Number)]
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
        schema
    }

    fn parse_at_person(text: &str) -> Result<Formula> {
        let schema = schema();
        let mut engine = FormulaEngine::new();
        let mut store = MemoryStore::new();
        let settings = Settings::default();
        let mut ev = Evaluator::new(&schema, &mut engine, &mut store, &settings);
        parse_formula(&mut ev, &Type::Reference(ColumnId::new("person")), text)
    }

    fn round_trip(text: &str) -> String {
        let schema = schema();
        let mut engine = FormulaEngine::new();
        let mut store = MemoryStore::new();
        let settings = Settings::default();
        let mut ev = Evaluator::new(&schema, &mut engine, &mut store, &settings);
        let this = Type::Reference(ColumnId::new("person"));
        let f = parse_formula(&mut ev, &this, text).unwrap();
        let printed = stringify_formula(&mut ev, &this, &f).unwrap();
        let reparsed = parse_formula(&mut ev, &this, &printed).unwrap();
        assert_eq!(reparsed, f, "round trip of {:?} via {:?}", text, printed);
        printed
    }

    #[test]
    fn test_pet_names() {
        let f = parse_at_person("Pet.name").unwrap();
        assert_eq!(
            f,
            Formula::down(
                Formula::down(Formula::this(), ColumnId::new("pet"), None, false),
                ColumnId::new("pet_name"),
                None,
                true
            )
        );
    }

    #[rstest]
    #[case("Pet.name", "Pet.name")]
    #[case("age+1", "age + 1")]
    #[case("(age - 1) * 2 ^ 3", "(age - 1) * 2 ^ 3")]
    #[case("{p : Pet | p.name = \"Rex\"}", "{p : Pet | p.name = \"Rex\"}")]
    #[case("sum[p : Pet](1)", "sum[p : Pet](1)")]
    #[case("if(age > 3, name, \"young\")", "if(age > 3, name, \"young\")")]
    #[case("count(Pet) + 1", "count(Pet) + 1")]
    #[case("$Person.name", "$Person.name")]
    #[case("{1, 2,}", "{1, 2}")]
    #[case("!(age in {1, 2})", "!(age in {1, 2})")]
    #[case("d\"2015-01-01\" < d\"now\"", "d\"2015-01-01\" < d\"now\"")]
    #[case("Pet(Problem).name", "Pet.name")]
    fn test_round_trip(#[case] text: &str, #[case] canonical: &str) {
        assert_eq!(round_trip(text), canonical);
    }

    #[test]
    fn test_comparisons_do_not_chain() {
        assert!(parse_at_person("1 < 2 < 3").is_err());
    }

    #[test]
    fn test_empty_braces_are_empty_union() {
        assert_eq!(parse_at_person("{}").unwrap(), Formula::Union(vec![]));
    }

    #[test]
    fn test_unknown_name() {
        let err = parse_at_person("nickname").unwrap_err();
        assert!(err.is_validation());
    }
}
