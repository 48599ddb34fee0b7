//! Collects every relation, column reference and function name a parsed
//! statement mentions, plus the query-level facts that make a statement more
//! than a plain read.

use sqlparser::ast::{Expr, Ident, ObjectName, Query, SetExpr, Statement, TableFactor, Visit, Visitor};
use std::ops::ControlFlow;

fn lower(ident: &Ident) -> String {
    ident.value.to_ascii_lowercase()
}

fn lower_parts(name: &ObjectName) -> Vec<String> {
    name.0.iter().map(lower).collect()
}

#[derive(Debug, Default)]
pub struct References {
    /// Relations in `FROM`/`JOIN`, each as lower-cased name parts.
    pub relations: Vec<Vec<String>>,
    /// Relations that were called with arguments (table functions), and
    /// other row sources the descriptor cannot describe.
    pub table_functions: Vec<String>,
    /// Column references, each as lower-cased name parts.
    pub columns: Vec<Vec<String>>,
    pub functions: Vec<String>,
    pub selects_into: bool,
    pub has_locks: bool,
    /// A query body somewhere is not a plain read.
    pub non_read_body: bool,
}

impl References {
    pub fn collect(statement: &Statement) -> Self {
        let mut refs = References::default();
        // The collector never breaks.
        let _ = statement.visit(&mut refs);
        refs
    }

    /// Records the facts of one query node. Queries are reached from the
    /// statement, subquery expressions and derived tables; CTE bodies and
    /// parenthesized bodies are followed from here.
    fn note_query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.note_query(&cte.query);
            }
        }
        if !query.locks.is_empty() {
            self.has_locks = true;
        }
        self.note_set_expr(&query.body);
    }

    fn note_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    self.selects_into = true;
                }
                if !select.lateral_views.is_empty() {
                    self.table_functions.push("LATERAL VIEW".to_string());
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.note_set_expr(left);
                self.note_set_expr(right);
            }
            SetExpr::Query(query) => self.note_query(query),
            SetExpr::Values(_) => {}
            _ => self.non_read_body = true,
        }
    }
}

impl Visitor for References {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        if let Statement::Query(query) = statement {
            self.note_query(query);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Table { name, args, .. } => {
                if args.is_some() {
                    self.table_functions.push(name.to_string());
                }
            }
            TableFactor::Derived { subquery, .. } => self.note_query(subquery),
            TableFactor::NestedJoin { .. } => {}
            other => {
                // UNNEST, pivots, JSON tables and the like read data the
                // descriptor cannot describe.
                self.table_functions.push(other.to_string());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations.push(lower_parts(relation));
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.columns.push(vec![lower(ident)]),
            Expr::CompoundIdentifier(parts) => self.columns.push(parts.iter().map(lower).collect()),
            Expr::Function(function) => {
                if let Some(name) = function.name.0.last() {
                    self.functions.push(lower(name));
                }
            }
            Expr::Subquery(query)
            | Expr::ArraySubquery(query)
            | Expr::Exists { subquery: query, .. }
            | Expr::InSubquery { subquery: query, .. } => self.note_query(query),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn collect(sql: &str) -> References {
        let statements = Parser::parse_sql(&GenericDialect {}, sql).expect("parse");
        References::collect(&statements[0])
    }

    #[test]
    fn collects_relations_and_columns() {
        let refs = collect(
            "SELECT op.prod_id, op.prod_name, ots.status AS tracking_status \
             FROM order_product op \
             JOIN order_tracking_status ots ON op.prod_id = ots.product_id",
        );
        assert_eq!(
            refs.relations,
            vec![
                vec!["order_product".to_string()],
                vec!["order_tracking_status".to_string()]
            ]
        );
        assert!(refs
            .columns
            .contains(&vec!["ots".to_string(), "product_id".to_string()]));
    }

    #[test]
    fn collects_functions_inside_ctes() {
        let refs = collect(
            "WITH accepted AS (SELECT prod_price FROM order_product WHERE status = 'Accepted') \
             SELECT SUM(prod_price) AS total FROM accepted",
        );
        assert!(refs.functions.contains(&"sum".to_string()));
        assert!(!refs.non_read_body);
    }

    #[test]
    fn flags_select_into_and_locks() {
        assert!(collect("SELECT prod_id INTO copy FROM order_product").selects_into);
        assert!(collect("SELECT prod_id FROM order_product FOR UPDATE").has_locks);
    }

    #[test]
    fn finds_facts_in_nested_queries() {
        assert!(
            collect(
                "WITH c AS (SELECT prod_id FROM order_product FOR UPDATE) SELECT prod_id FROM c"
            )
            .has_locks
        );
        assert!(
            collect(
                "SELECT prod_name FROM order_product WHERE prod_id IN \
                 (SELECT prod_id FROM cartdetails FOR UPDATE)"
            )
            .has_locks
        );
        assert!(
            collect("SELECT t.prod_id FROM (SELECT prod_id INTO copy FROM order_product) AS t")
                .selects_into
        );
    }
}
