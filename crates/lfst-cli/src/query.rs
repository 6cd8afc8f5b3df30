// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only
#![allow(clippy::disallowed_methods)] // CLI commands intentionally print to stdout/stderr

use anyhow::Result;
use clap::Args;
use lfst_local_db::QueryResult;

use crate::{open_database, GlobalOptions};

#[derive(Args, Clone, Debug)]
pub struct QueryArgs {
    /// SQL statement
    pub sql: String,
}

impl QueryArgs {
    pub async fn run(self, global: &GlobalOptions) -> Result<()> {
        let config = global.load_config()?;
        let db = open_database(&config)?;
        let result = db.query_raw(&self.sql)?;
        print!("{}", render(&result));
        Ok(())
    }
}

/// Tab-separated header and rows, followed by a row count.
pub fn render(result: &QueryResult) -> String {
    let mut out = String::new();
    if !result.columns.is_empty() {
        out.push_str(&result.columns.join("\t"));
        out.push('\n');
    }
    for row in &result.rows {
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    out.push_str(&format!("({} rows)\n", result.rows.len()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_header_rows_and_count() {
        let result = QueryResult {
            columns: vec!["id".into(), "status".into()],
            rows: vec![
                vec!["1".into(), "completed".into()],
                vec!["2".into(), "running".into()],
            ],
        };
        assert_eq!(
            render(&result),
            "id\tstatus\n1\tcompleted\n2\trunning\n(2 rows)\n"
        );
    }

    #[test]
    fn render_statement_without_columns() {
        let result = QueryResult {
            columns: vec![],
            rows: vec![],
        };
        assert_eq!(render(&result), "(0 rows)\n");
    }
}
