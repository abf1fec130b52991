//! Conversions between values and their display text.

use chrono::{NaiveDate, NaiveDateTime, Utc};

use super::formula::{read_family_for_formula, wire::value_to_json};
use super::model::Evaluator;
use super::schema::ColumnRef;
use super::store::FamilyStore;
use super::types::{Type, TypedSet};
use super::value::{CellId, QCellId, QFamilyId, Value};
use crate::error::{Result, evaluation};

const DISPLAY_DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// `x` alone, or `{a, b, ...}`.
pub fn set_to_text(parts: Vec<String>) -> String {
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        format!("{{{}}}", parts.join(", "))
    }
}

/// Render one value. References render through their display column.
pub fn value_to_text<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    ty: &Type,
    value: &Value,
) -> Result<String> {
    value_to_text_seen(ev, ty, value, &im::OrdSet::new())
}

pub fn tset_to_text<S: FamilyStore>(ev: &mut Evaluator<'_, S>, tset: &TypedSet) -> Result<String> {
    tset_to_text_seen(ev, tset, &im::OrdSet::new())
}

/// Like [`value_to_text`], rendering any failure as `<?>`. Never use this
/// while evaluating a formula.
pub fn value_to_text_ignore_errors<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    ty: &Type,
    value: &Value,
) -> String {
    value_to_text(ev, ty, value).unwrap_or_else(|_| "<?>".to_string())
}

pub fn tset_to_text_ignore_errors<S: FamilyStore>(ev: &mut Evaluator<'_, S>, tset: &TypedSet) -> String {
    let parts = tset
        .iter()
        .map(|v| value_to_text_ignore_errors(ev, &tset.ty, v))
        .collect();
    set_to_text(parts)
}

fn tset_to_text_seen<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    tset: &TypedSet,
    seen: &im::OrdSet<QCellId>,
) -> Result<String> {
    let mut parts = Vec::with_capacity(tset.len());
    for value in tset.iter() {
        parts.push(value_to_text_seen(ev, &tset.ty, value, seen)?);
    }
    Ok(set_to_text(parts))
}

fn value_to_text_seen<S: FamilyStore>(
    ev: &mut Evaluator<'_, S>,
    ty: &Type,
    value: &Value,
    seen: &im::OrdSet<QCellId>,
) -> Result<String> {
    let Type::Reference(column) = ty else {
        return Ok(primitive_to_text(value));
    };
    let schema = ev.schema;
    let cell = value
        .as_cell()
        .ok_or_else(|| evaluation(format!("Expected a reference, got {}", value)))?;
    let qcell = QCellId {
        column: column.clone(),
        cell: cell.clone(),
    };
    if seen.contains(&qcell) {
        return Err(evaluation(format!(
            "Circular dependency while converting object of type '{}', ID {}, to text",
            schema.stringify_type(ty),
            value_to_json(value)
        )));
    }
    let seen = seen.update(qcell);

    let col = schema.column(column)?;
    let key_type = ev.typecheck_column(column)?;
    let display = col
        .reference_display_column
        .clone()
        .or_else(|| schema.default_reference_display_column(column, &key_type));
    let display_tset = match display {
        None => return Ok("<reference>".to_string()),
        Some(display) if display == *column && key_type != Type::Token => {
            let key = cell.last_step().cloned().ok_or_else(|| {
                evaluation("The root object has no key to display")
            })?;
            TypedSet::singleton(key_type, key)
        }
        Some(display)
            if col.children.contains(&display)
                && schema.get(&display).is_some_and(|c| !c.is_object) =>
        {
            read_family_for_formula(ev, &QFamilyId::new(display, cell.clone()))?
        }
        Some(_) => {
            return Err(evaluation(format!(
                "Invalid reference display column for type '{}'",
                schema.stringify_type(ty)
            )));
        }
    };
    tset_to_text_seen(ev, &display_tset, &seen)
}

fn primitive_to_text(value: &Value) -> String {
    match value {
        Value::Text(s) | Value::Token(s) => s.clone(),
        Value::Date(d) => d.format(DISPLAY_DATE_FORMAT).to_string(),
        other => value_to_json(other).to_string(),
    }
}

/// Parse a date in one of the accepted text forms, or `now` (UTC).
pub fn parse_date(text: &str) -> Result<NaiveDateTime> {
    if text == "now" {
        return Ok(Utc::now().naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(d) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(d);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| evaluation(format!("Invalid date: '{}'", text)))
}

/// Parse user-entered text as a value of `ty`.
///
/// References match `text` against the display text of every live object of
/// the column.
pub fn parse_value<S: FamilyStore>(ev: &mut Evaluator<'_, S>, ty: &Type, text: &str) -> Result<Value> {
    match ty {
        Type::Text => Ok(Value::text(text)),
        Type::Number => serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|j| j.as_f64())
            .map(Value::number)
            .ok_or_else(|| evaluation(format!("Invalid number: '{}'", text))),
        Type::Bool => match text {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(evaluation(format!("Invalid boolean: '{}'", text))),
        },
        Type::Date => parse_date(text).map(Value::Date),
        Type::Unit => Ok(Value::Unit),
        Type::Token => Ok(Value::new_token()),
        Type::Reference(column) => {
            let schema = ev.schema;
            let mut matching: Vec<CellId> = Vec::new();
            for cell in ev.all_cell_ids_in_column(column)? {
                let value = Value::Ref(cell.clone());
                if value_to_text(ev, ty, &value).is_ok_and(|t| t == text) {
                    matching.push(cell);
                }
            }
            let name = schema.stringify_column_ref(&ColumnRef::new(column.clone(), false));
            match matching.len() {
                1 => Ok(Value::Ref(matching.remove(0))),
                0 => Err(evaluation(format!(
                    "The entered text does not match any existing '{}' object.",
                    name
                ))),
                n => Err(evaluation(format!(
                    "The entered text matches {} '{}' objects.  Choose a reference display column for '{}' that has unique values, or define a new computed column if necessary.",
                    n, name, name
                ))),
            }
        }
        Type::Empty | Type::Error => Err(evaluation(format!(
            "Cannot parse a value of type '{}'",
            ty
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::{FormulaEngine, Settings};
    use crate::engine::schema::{Column, Schema};
    use crate::engine::store::{FamilyRecord, MemoryStore};
    use crate::engine::value::ColumnId;
    use rstest::rstest;

    #[rstest]
    #[case(Value::text("hi"), "hi")]
    #[case(Value::number(3.0), "3")]
    #[case(Value::number(2.5), "2.5")]
    #[case(Value::Bool(true), "true")]
    fn test_primitive_to_text(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(primitive_to_text(&value), expected);
    }

    #[test]
    fn test_set_to_text() {
        assert_eq!(set_to_text(vec!["a".into()]), "a");
        assert_eq!(set_to_text(vec!["a".into(), "b".into()]), "{a, b}");
        assert_eq!(set_to_text(vec![]), "{}");
    }

    #[rstest]
    #[case("2015-01-01", "2015-01-01 00:00")]
    #[case("2015-01-01 12:30", "2015-01-01 12:30")]
    #[case("2015-01-01T08:05:00", "2015-01-01 08:05")]
    fn test_parse_date(#[case] text: &str, #[case] expected: &str) {
        let d = parse_date(text).unwrap();
        assert_eq!(d.format(DISPLAY_DATE_FORMAT).to_string(), expected);
    }

    #[test]
    fn test_reference_renders_display_column_and_parses_back() {
        let mut schema = Schema::new();
        let mut person = Column::new(ColumnId::new("person"), ColumnId::root());
        person.is_object = true;
        person.object_name = Some("Person".into());
        person.specified_type = Some(Type::Token);
        schema.insert(person, 0).unwrap();
        let mut name = Column::new(ColumnId::new("name"), ColumnId::new("person"));
        name.field_name = Some("name".into());
        name.specified_type = Some(Type::Text);
        schema.insert(name, 0).unwrap();

        let store = MemoryStore::new();
        let token = Value::Token("t1".into());
        store.set(
            QFamilyId::new(ColumnId::new("person"), CellId::root()),
            FamilyRecord::with_values([token.clone()].into_iter().collect()),
        );
        let cell = CellId::root().child(token);
        store.set(
            QFamilyId::new(ColumnId::new("name"), cell.clone()),
            FamilyRecord::with_values([Value::text("Ann")].into_iter().collect()),
        );

        let mut store = store;
        let mut engine = FormulaEngine::new();
        let settings = Settings::default();
        let mut ev = Evaluator::new(&schema, &mut engine, &mut store, &settings);
        let ty = Type::Reference(ColumnId::new("person"));
        let text = value_to_text(&mut ev, &ty, &Value::Ref(cell.clone())).unwrap();
        assert_eq!(text, "Ann");
        assert_eq!(parse_value(&mut ev, &ty, "Ann").unwrap(), Value::Ref(cell));
        assert!(parse_value(&mut ev, &ty, "Bob").is_err());
    }
}
