use std::collections::{BTreeMap, BTreeSet};

use objsheet_core::{CellId, ColumnId, ColumnSpec, Sheet, SheetError, Tablespace, Type, Value};

const PEOPLE: &str = r#"
[[column]]
object = "Person"

[[column]]
parent = "Person"
field = "name"
type = "text"

[[column]]
parent = "Person"
field = "age"
type = "number"

[[column]]
parent = "Person"
object = "Pet"

[[column]]
parent = "Person:Pet"
field = "name"
type = "text"

[[column]]
field = "total"
formula = "sum[p : Person](p.age)"

[[procedure]]
name = "rename"
params = [["who", "Person", true], ["to", "text", true]]
body = "who.name := to"

[[data]]
column = "Person"
rows = [
  { name = "Ann", age = 30, Pet = [{ name = "Rex" }, { name = "Fido" }] },
  { name = "Bo", age = 12 },
]
"#;

fn people() -> Sheet {
    Sheet::from_definition_str(PEOPLE).unwrap()
}

fn column(sheet: &Sheet, reference: &str) -> ColumnId {
    sheet.schema().parse_column_ref(reference).unwrap().column
}

fn person_named(sheet: &mut Sheet, name: &str) -> CellId {
    let person = column(sheet, "Person");
    let name_column = column(sheet, "Person:name");
    sheet
        .cells(&person)
        .unwrap()
        .into_iter()
        .find(|cell| {
            sheet
                .family(&name_column, cell)
                .unwrap()
                .is_some_and(|names| names.set.contains(&Value::text(name)))
        })
        .unwrap()
}

#[test]
fn test_navigation_from_person_context() {
    let mut sheet = people();
    let person = column(&sheet, "Person");
    let formula = sheet.parse_formula_at(&person, "Pet.name").unwrap();
    let pet_names = sheet
        .define_column(&person, 3, ColumnSpec::computed("petNames", formula))
        .unwrap();
    let ann = person_named(&mut sheet, "Ann");
    let result = sheet.family(&pet_names, &ann).unwrap().unwrap();
    assert_eq!(result.ty, Type::Text);
    assert_eq!(
        result.set,
        BTreeSet::from([Value::text("Rex"), Value::text("Fido")])
    );
}

#[test]
fn test_mutual_cycle_is_a_typecheck_error() {
    let mut sheet = Sheet::from_definition_str(
        "[[column]]\nfield = \"A\"\nformula = \"B\"\n\n[[column]]\nfield = \"B\"\nformula = \"A\"\n",
    )
    .unwrap();
    let a = column(&sheet, "A");
    let b = column(&sheet, "B");
    sheet.evaluate_all().unwrap();
    for id in [&a, &b] {
        assert_eq!(sheet.column_type(id).unwrap(), Type::Error);
        assert!(sheet.typecheck_error(id).unwrap().is_some());
    }
}

#[test]
fn test_branch_scopes_merge() {
    let mut sheet = people();
    sheet
        .define_procedure(
            "pick",
            &[("c", "bool", true)],
            "if (c) { let x = 1 } else { let x = 2 }\ncheck x >= 1",
        )
        .unwrap();
    let args = BTreeMap::from([("c".to_string(), vec![Value::Bool(false)])]);
    sheet.execute_canned_transaction("pick", args).unwrap();

    let one_sided = sheet
        .define_procedure("half", &[("c", "bool", true)], "if (c) { let x = 1 }\ncheck x >= 1")
        .and_then(|()| {
            let args = BTreeMap::from([("c".to_string(), vec![Value::Bool(true)])]);
            sheet.execute_canned_transaction("half", args)
        });
    assert!(matches!(
        one_sided,
        Err(SheetError::Validation(_) | SheetError::ProcedureIllTyped { .. })
    ));
}

#[test]
fn test_failed_check_leaves_store_untouched() {
    let mut sheet = people();
    sheet
        .define_procedure(
            "careless",
            &[("who", "Person", true)],
            "who.age := 99\ncheck who.age < 50",
        )
        .unwrap();
    let ann = person_named(&mut sheet, "Ann");
    sheet.evaluate_all().unwrap();
    let before = sheet.store().snapshot();
    let args = BTreeMap::from([("who".to_string(), vec![Value::Ref(ann)])]);
    match sheet.execute_canned_transaction("careless", args) {
        Err(SheetError::TransactionFailed(message)) => {
            assert_eq!(message, "check condition failed")
        }
        other => panic!("expected a failed transaction, got {:?}", other),
    }
    assert_eq!(sheet.store().snapshot(), before);
}

#[test]
fn test_committed_transaction_updates_computed_columns() {
    let mut sheet = people();
    let (_, before) = sheet.evaluate_formula_text("total").unwrap();
    assert_eq!(before, "42");
    sheet
        .define_procedure("age", &[("who", "Person", true)], "who.age := who.age + 10")
        .unwrap();
    let bo = person_named(&mut sheet, "Bo");
    let args = BTreeMap::from([("who".to_string(), vec![Value::Ref(bo)])]);
    sheet.execute_canned_transaction("age", args).unwrap();
    let (_, after) = sheet.evaluate_formula_text("total").unwrap();
    assert_eq!(after, "52");
}

#[test]
fn test_tablespace_serializes_calls() {
    let mut sheet = people();
    let ann = person_named(&mut sheet, "Ann");
    let tablespace = Tablespace::new("people", sheet).unwrap();
    let args = BTreeMap::from([
        ("who".to_string(), vec![Value::Ref(ann)]),
        ("to".to_string(), vec![Value::text("Anna")]),
    ]);
    tablespace.call("rename", args).unwrap();
    let names = tablespace
        .run(|sheet| sheet.evaluate_formula_text("Person.name").map(|(_, text)| text))
        .unwrap();
    assert_eq!(names, "{Anna, Bo}");
}
