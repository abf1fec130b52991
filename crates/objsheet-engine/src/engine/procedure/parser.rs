//! Concrete syntax for procedure bodies.
//!
//! Statements are separated by newlines or `;`. Expressions inside
//! statements go through the formula [`Parser`], sharing its variable
//! environment so that `let` bindings resolve in later statements.

use super::{Param, Procedure, Statement, merge_type_maps, validate_procedure};
use crate::engine::formula::{Formula, Lexer, Parser, Token, VarTypes};
use crate::engine::model::Evaluator;
use crate::engine::store::FamilyStore;
use crate::error::Result;

/// Parse `body` as the statements of a procedure named `name`.
pub fn parse_procedure<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    name: &str,
    params: Vec<Param>,
    body: &str,
) -> Result<Procedure> {
    let schema = ev.schema;
    let vars: VarTypes = params
        .iter()
        .map(|p| (p.name.clone(), p.ty.clone()))
        .collect();
    let mut parser = Parser::new(ev, vars, Lexer::new(body, true)?);
    let statements = statements(&mut parser)?;
    if *parser.lexer.peek() != Token::Eof {
        return Err(parser.lexer.unexpected("a statement"));
    }
    let procedure = Procedure {
        name: name.to_string(),
        params,
        body: statements,
    };
    validate_procedure(schema, &procedure)?;
    Ok(procedure)
}

fn skip_separators<S: FamilyStore>(p: &mut Parser<'_, '_, S>) {
    while matches!(p.lexer.peek(), Token::Newline) || p.lexer.at_sym(";") {
        p.lexer.next_token();
    }
}

/// Statements up to a closing brace or the end of input.
fn statements<S: FamilyStore>(p: &mut Parser<'_, '_, S>) -> Result<Vec<Statement>> {
    let mut out = Vec::new();
    loop {
        skip_separators(p);
        if p.lexer.at_sym("}") || *p.lexer.peek() == Token::Eof {
            return Ok(out);
        }
        out.push(statement(p)?);
        let terminated = matches!(p.lexer.peek(), Token::Newline | Token::Eof)
            || p.lexer.at_sym(";")
            || p.lexer.at_sym("}");
        if !terminated {
            return Err(p.lexer.unexpected("end of statement"));
        }
    }
}

fn block<S: FamilyStore>(p: &mut Parser<'_, '_, S>) -> Result<Vec<Statement>> {
    p.lexer.skip_newlines();
    p.lexer.expect_sym("{")?;
    let body = statements(p)?;
    p.lexer.expect_sym("}")?;
    Ok(body)
}

/// A `new` or `make` target, optionally binding `var` to the created objects.
fn creation<S: FamilyStore>(
    p: &mut Parser<'_, '_, S>,
    var: Option<String>,
) -> Result<Statement> {
    let make = if p.lexer.eat_keyword("make") {
        true
    } else {
        p.lexer.expect_keyword("new")?;
        false
    };
    let target = p.expression()?;
    if let Some(var) = &var {
        p.bind_var(var, &target)?;
    }
    Ok(if make {
        Statement::Make { var, target }
    } else {
        Statement::New { var, target }
    })
}

fn statement<S: FamilyStore>(p: &mut Parser<'_, '_, S>) -> Result<Statement> {
    if p.lexer.eat_keyword("let") {
        let var = p.ident()?;
        p.lexer.expect_sym("=")?;
        if p.lexer.at_keyword("new") || p.lexer.at_keyword("make") {
            return creation(p, Some(var));
        }
        let value = p.expression()?;
        p.bind_var(&var, &value)?;
        return Ok(Statement::Let { var, value });
    }
    if p.lexer.at_keyword("new") || p.lexer.at_keyword("make") {
        return creation(p, None);
    }
    if p.lexer.eat_keyword("to") {
        p.lexer.expect_keyword("set")?;
        let target = p.expression()?;
        p.lexer.expect_keyword("add")?;
        let value = p.expression()?;
        return Ok(Statement::Add { target, value });
    }
    if p.lexer.eat_keyword("from") {
        p.lexer.expect_keyword("set")?;
        let target = p.expression()?;
        p.lexer.expect_keyword("remove")?;
        let value = p.expression()?;
        return Ok(Statement::Remove { target, value });
    }
    if p.lexer.eat_keyword("if") {
        p.lexer.expect_sym("(")?;
        let condition = p.expression()?;
        p.lexer.expect_sym(")")?;
        let outer = p.vars.clone();
        let then_body = block(p)?;
        let then_vars = std::mem::replace(&mut p.vars, outer);
        let else_body = if at_else(p) {
            p.lexer.skip_newlines();
            p.lexer.expect_keyword("else")?;
            block(p)?
        } else {
            Vec::new()
        };
        p.vars = merge_type_maps(&then_vars, &p.vars);
        return Ok(Statement::If {
            condition,
            then_body,
            else_body,
        });
    }
    if p.lexer.eat_keyword("foreach") {
        p.lexer.expect_sym("(")?;
        let var = p.ident()?;
        p.lexer.expect_sym(":")?;
        let domain = p.expression()?;
        p.lexer.expect_sym(")")?;
        let outer = p.vars.clone();
        p.bind_var(&var, &domain)?;
        let body = block(p);
        p.vars = outer;
        return Ok(Statement::Foreach {
            var,
            domain,
            body: body?,
        });
    }
    if p.lexer.eat_keyword("delete") {
        return Ok(Statement::Delete(p.expression()?));
    }
    if p.lexer.eat_keyword("check") {
        return Ok(Statement::Check(p.expression()?));
    }
    let target = p.expression()?;
    p.lexer.expect_sym(":=")?;
    let value = p.expression()?;
    Ok(Statement::Set { target, value })
}

/// `else` may follow the closing brace on the same or a later line.
fn at_else<S: FamilyStore>(p: &Parser<'_, '_, S>) -> bool {
    let mut n = 0;
    while matches!(p.lexer.peek_at(n), Token::Newline) {
        n += 1;
    }
    matches!(p.lexer.peek_at(n), Token::Ident(s) if s == "else")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{FormulaEngine, Settings};
    use crate::engine::procedure::fixtures;
    use crate::engine::store::MemoryStore;
    use crate::engine::types::Type;
    use crate::engine::value::ColumnId;

    fn parse(body: &str) -> Result<Procedure> {
        let schema = fixtures::schema();
        let mut engine = FormulaEngine::new();
        let mut store = MemoryStore::new();
        let settings = Settings::default();
        let mut ev = Evaluator::new(&schema, &mut engine, &mut store, &settings);
        let params = vec![Param::new("who", Type::Reference(ColumnId::new("person")), true)];
        parse_procedure(&mut ev, "p", params, body)
    }

    #[test]
    fn test_statement_forms() {
        let procedure = parse(
            "who.age := 3\n\
             to set who.name add \"Al\"; from set who.name remove \"Bo\"\n\
             let rover = new who.Pet\n\
             rover.name := \"Rover\"\n\
             make $Room[\"101\"]\n\
             check who.age = 3\n\
             delete rover",
        )
        .unwrap();
        let kinds: Vec<_> = procedure
            .body
            .iter()
            .map(|s| match s {
                Statement::Let { .. } => "let",
                Statement::Set { .. } => "set",
                Statement::Add { .. } => "add",
                Statement::Remove { .. } => "remove",
                Statement::If { .. } => "if",
                Statement::Foreach { .. } => "foreach",
                Statement::Delete(_) => "delete",
                Statement::New { .. } => "new",
                Statement::Make { .. } => "make",
                Statement::Check(_) => "check",
            })
            .collect();
        assert_eq!(
            kinds,
            ["set", "add", "remove", "new", "set", "make", "check", "delete"]
        );
        let Statement::Set { target, .. } = &procedure.body[0] else {
            panic!("expected a set statement");
        };
        assert_eq!(
            *target,
            Formula::down(Formula::var("who"), ColumnId::new("age"), None, true)
        );
    }

    #[test]
    fn test_blocks_and_comments() {
        let procedure = parse(
            "# bump everyone\n\
             foreach (p : $Person) {\n\
               if (p.age > 30) {\n\
                 p.age := p.age + 1\n\
               }\n\
               else {\n\
                 p.age := 0\n\
               }\n\
             }\n",
        )
        .unwrap();
        assert_eq!(procedure.body.len(), 1);
        let Statement::Foreach { body, .. } = &procedure.body[0] else {
            panic!("expected foreach");
        };
        let Statement::If {
            then_body,
            else_body,
            ..
        } = &body[0]
        else {
            panic!("expected if");
        };
        assert_eq!((then_body.len(), else_body.len()), (1, 1));
    }

    #[test]
    fn test_foreach_variable_goes_out_of_scope() {
        let err = parse("foreach (p : $Person) { check true }\np.age := 1").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_shadowing_is_rejected() {
        let err = parse("foreach (who : $Person) { check true }").unwrap_err();
        assert!(err.message().contains("shadows"));
    }

    #[test]
    fn test_missing_separator() {
        let err = parse("check true check false").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_mutating_an_object_family_is_rejected() {
        let err = parse("who.Pet := who.Pet").unwrap_err();
        assert_eq!(err.message(), "set/add/remove only work on leaf families.");
    }
}
