//! Aligned text rendering of source tables for debug logs.

const PADDING: usize = 1;

/// Renders `rows` under `headers` (generated `Column n` headers when empty).
/// Short rows are padded with `N/A`, long rows truncated to the header count.
pub fn generate(headers: &[String], rows: &[Vec<String>]) -> String {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let headers: Vec<String> = if headers.is_empty() {
        (1..=width).map(|i| format!("Column {i}")).collect()
    } else {
        headers.to_vec()
    };
    if headers.is_empty() {
        return "<empty>".to_string();
    }

    let rows: Vec<Vec<&str>> = rows
        .iter()
        .map(|row| {
            (0..headers.len())
                .map(|i| row.get(i).map(String::as_str).unwrap_or("N/A"))
                .collect()
        })
        .collect();

    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| rows.iter().map(|r| r[i].chars().count()).chain([h.chars().count()]).max().unwrap_or(0))
        .collect();

    let separator = {
        let mut line = String::from("+");
        for w in &widths {
            line.push_str(&"-".repeat(w + 2 * PADDING));
            line.push('+');
        }
        line
    };
    let render = |cells: &mut dyn Iterator<Item = &str>| {
        let mut line = String::from("|");
        for (cell, w) in cells.zip(&widths) {
            line.push_str(&format!("{pad}{cell:<w$}{pad}|", pad = " ".repeat(PADDING), w = w));
        }
        line
    };

    let mut out = vec![separator.clone(), render(&mut headers.iter().map(String::as_str)), separator.clone()];
    for row in &rows {
        out.push(render(&mut row.iter().copied()));
    }
    out.push(separator);
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_aligned_columns() {
        let rows = vec![vec!["1".to_string(), "3500".to_string()], vec!["10".to_string()]];
        let text = generate(&[], &rows);
        assert_eq!(
            text,
            "+----------+----------+\n\
             | Column 1 | Column 2 |\n\
             +----------+----------+\n\
             | 1        | 3500     |\n\
             | 10       | N/A      |\n\
             +----------+----------+"
        );
    }

    #[test]
    fn empty_table() {
        assert_eq!(generate(&[], &[]), "<empty>");
    }
}
