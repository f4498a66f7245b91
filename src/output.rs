//! Terminal presentation helpers for the zli binary.

use dialoguer::console::{measure_text_width, style, StyledObject};

pub(crate) mod icons {
    pub const SUCCESS: &str = "✓";
    pub const ERROR: &str = "✗";
    pub const WARNING: &str = "!";
    pub const INFO: &str = "•";
}

pub(crate) fn success<D>(text: D) -> StyledObject<D> {
    style(text).green()
}

pub(crate) fn warning<D>(text: D) -> StyledObject<D> {
    style(text).yellow()
}

pub(crate) fn error<D>(text: D) -> StyledObject<D> {
    style(text).red()
}

pub(crate) fn muted<D>(text: D) -> StyledObject<D> {
    style(text).dim()
}

pub(crate) fn bold<D>(text: D) -> StyledObject<D> {
    style(text).bold()
}

/// Left-aligned columns sized to their widest cell.
#[derive(Default)]
pub(crate) struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header<I, S>(mut self, cells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.header = cells.into_iter().map(Into::into).collect();
        self
    }

    pub fn row<I, S>(mut self, cells: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows.push(cells.into_iter().map(Into::into).collect());
        self
    }

    pub fn render(&self) -> String {
        let columns = self
            .rows
            .iter()
            .map(Vec::len)
            .chain(std::iter::once(self.header.len()))
            .max()
            .unwrap_or(0);
        let mut widths = vec![0usize; columns];
        for row in std::iter::once(&self.header).chain(&self.rows) {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(measure_text_width(cell));
            }
        }

        let line = |row: &[String]| {
            let cells: Vec<String> = row
                .iter()
                .enumerate()
                .map(|(i, cell)| {
                    let pad = widths[i].saturating_sub(measure_text_width(cell));
                    format!("{}{}", cell, " ".repeat(pad))
                })
                .collect();
            format!("  {}", cells.join("  ").trim_end())
        };

        let mut out = Vec::with_capacity(self.rows.len() + 1);
        if !self.header.is_empty() {
            out.push(bold(line(&self.header)).to_string());
        }
        out.extend(self.rows.iter().map(|row| line(row)));
        out.join("\n")
    }

    pub fn print(&self) {
        println!("{}", self.render());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_align_to_widest_cell() {
        let table = Table::new()
            .row(["a", "long-value", "x"])
            .row(["wider", "b", "y"]);
        let rendered = table.render();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines[0], "  a      long-value  x");
        assert_eq!(lines[1], "  wider  b           y");
    }
}
