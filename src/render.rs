//! Plain-text rendering of a sheet projection.

use std::collections::BTreeMap;
use std::fmt::Write;

use objsheet_core::{ColumnId, ProjectedCell, ProjectedColumn, ProjectedFamily, Projection};

const INDENT: &str = "  ";

fn index_columns<'a>(column: &'a ProjectedColumn, out: &mut BTreeMap<ColumnId, &'a ProjectedColumn>) {
    out.insert(column.id.clone(), column);
    for child in &column.children {
        index_columns(child, out);
    }
}

fn render_header(column: &ProjectedColumn, depth: usize, out: &mut String) {
    let _ = write!(out, "{}{}: {}", INDENT.repeat(depth), column.name, column.type_text);
    if column.is_object {
        out.push_str(" (object)");
    }
    if let Some(formula) = &column.formula {
        let _ = write!(out, " = {}", formula);
    }
    if let Some(error) = &column.typecheck_error {
        let _ = write!(out, "  !! {}", error);
    }
    out.push('\n');
    for child in &column.children {
        render_header(child, depth + 1, out);
    }
}

fn render_cell(
    cell: &ProjectedCell,
    columns: &BTreeMap<ColumnId, &ProjectedColumn>,
    depth: usize,
    out: &mut String,
) {
    let pad = INDENT.repeat(depth);
    let _ = writeln!(out, "{}{}", pad, cell.text);
    for (column, family) in &cell.families {
        let Some(header) = columns.get(column) else {
            continue;
        };
        let _ = write!(out, "{}{}{}:", pad, INDENT, header.name);
        match family {
            ProjectedFamily::Error(message) => {
                let _ = writeln!(out, " <error: {}>", message);
            }
            ProjectedFamily::Values(cells) if !header.is_object => {
                let texts: Vec<&str> = cells.iter().map(|c| c.text.as_str()).collect();
                let _ = writeln!(out, " {}", texts.join(", "));
            }
            ProjectedFamily::Values(cells) => {
                out.push('\n');
                for child in cells {
                    render_cell(child, columns, depth + 2, out);
                }
            }
        }
    }
}

/// Schema outline followed by the data tree.
pub fn render(projection: &Projection) -> String {
    let mut columns = BTreeMap::new();
    index_columns(&projection.header, &mut columns);
    let mut out = String::new();
    out.push_str("Columns:\n");
    render_header(&projection.header, 1, &mut out);
    out.push_str("Data:\n");
    for cell in &projection.cells {
        render_cell(cell, &columns, 1, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsheet_core::{CellId, Sheet};

    #[test]
    fn test_render_small_sheet() {
        let mut sheet = Sheet::from_definition_str(
            "[[column]]\nobject = \"T\"\n\n[[column]]\nparent = \"T\"\nfield = \"n\"\ntype = \"number\"\n\n\
             [[data]]\ncolumn = \"T\"\nrows = [{ n = 1 }]\n",
        )
        .unwrap();
        let projection = sheet.project(&ColumnId::root()).unwrap();
        let text = render(&projection);
        assert!(text.starts_with("Columns:\n  $: "));
        assert!(text.contains("    T: _token (object)\n"));
        assert!(text.contains("      n: number\n"));
        assert!(text.contains("      n: 1\n"));
        assert_eq!(projection.cells[0].id, CellId::root());
    }
}
