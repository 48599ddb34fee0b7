//! Name resolution for accepted reads.
//!
//! Every column reference is resolved against the relations of the query it
//! appears in, and only there: select-list aliases are visible to `ORDER BY`
//! alone, and references into an enclosing query must be qualified. Base
//! tables expose exactly the descriptor's columns, so wildcards over them are
//! rewritten into explicit column lists.

use super::ReasonCode;
use crate::schema::SchemaDescriptor;
use sqlparser::ast::{
    ExcludeSelectItem, Expr, Function, FunctionArg, FunctionArgExpr, Ident, JoinConstraint,
    JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr, TableAlias, TableFactor,
    TableWithJoins, VisitMut, VisitorMut, WildcardAdditionalOptions,
};
use sqlparser::keywords::ALL_KEYWORDS;
use std::ops::ControlFlow;
use tracing::debug;

fn lower(ident: &Ident) -> String {
    ident.value.to_ascii_lowercase()
}

/// Identifier for a descriptor name, quoted unless it is a plain word.
fn ident(name: &str) -> Ident {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && ALL_KEYWORDS
            .binary_search(&name.to_ascii_uppercase().as_str())
            .is_err();
    if plain {
        Ident::new(name)
    } else {
        Ident::with_quote('"', name)
    }
}

/// A row source in a `FROM` clause.
#[derive(Debug, Clone)]
struct Relation {
    /// Lower-cased name references qualify with; empty for an unaliased
    /// subquery.
    name: String,
    qualifier: Option<Ident>,
    /// Lower-cased descriptor table name, for base tables.
    table: Option<String>,
    columns: Vec<String>,
}

impl Relation {
    fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }

    fn is_base(&self) -> bool {
        self.table.is_some()
    }
}

#[derive(Debug, Clone)]
struct Cte {
    name: String,
    columns: Vec<String>,
}

struct Scope<'p> {
    relations: Vec<Relation>,
    ctes: Vec<Cte>,
    /// Select-list output names, visible while resolving `ORDER BY`.
    aliases: Vec<String>,
    parent: Option<&'p Scope<'p>>,
}

impl<'p> Scope<'p> {
    fn child(parent: Option<&'p Scope<'p>>) -> Self {
        Self {
            relations: Vec::new(),
            ctes: Vec::new(),
            aliases: Vec::new(),
            parent,
        }
    }

    fn cte(&self, name: &str) -> Option<&Cte> {
        let mut level = Some(self);
        while let Some(scope) = level {
            if let Some(cte) = scope.ctes.iter().find(|c| c.name == name) {
                return Some(cte);
            }
            level = scope.parent;
        }
        None
    }

    fn relation(&self, name: &str) -> Option<&Relation> {
        let mut level = Some(self);
        while let Some(scope) = level {
            if let Some(relation) = scope.relations.iter().find(|r| r.name == name) {
                return Some(relation);
            }
            level = scope.parent;
        }
        None
    }

    fn base_table(&self, table: &str) -> Option<&Relation> {
        let mut level = Some(self);
        while let Some(scope) = level {
            if let Some(relation) = scope
                .relations
                .iter()
                .find(|r| r.table.as_deref() == Some(table))
            {
                return Some(relation);
            }
            level = scope.parent;
        }
        None
    }

    fn resolves(&self, parts: &[String]) -> bool {
        match parts {
            // Outer columns must be qualified.
            [name] => {
                self.relations.iter().any(|r| r.has_column(name))
                    || self.aliases.iter().any(|a| a == name)
            }
            [qualifier, name] => self.relation(qualifier).is_some_and(|r| r.has_column(name)),
            [_, table, name] => self.base_table(table).is_some_and(|r| r.has_column(name)),
            _ => false,
        }
    }
}

/// Resolves every name in `query` against `schema`, rewriting wildcards over
/// descriptor tables in place.
pub fn resolve(query: &mut Query, schema: &SchemaDescriptor) -> Result<(), ReasonCode> {
    Resolver { schema }.query(query, None).map(|_| ())
}

struct Resolver<'s> {
    schema: &'s SchemaDescriptor,
}

impl Resolver<'_> {
    /// Resolves one query and returns the names of its output columns.
    fn query(&self, query: &mut Query, parent: Option<&Scope<'_>>) -> Result<Vec<String>, ReasonCode> {
        let mut scope = Scope::child(parent);

        if let Some(with) = &mut query.with {
            let recursive = with.recursive;
            for cte in &mut with.cte_tables {
                let name = lower(&cte.alias.name);
                if recursive {
                    scope.ctes.push(Cte {
                        name: name.clone(),
                        columns: cte.alias.columns.iter().map(lower).collect(),
                    });
                }
                let columns = self.query(&mut cte.query, Some(&scope))?;
                let columns = rename(columns, &cte.alias.columns)?;
                scope.ctes.retain(|c| c.name != name);
                scope.ctes.push(Cte { name, columns });
            }
        }

        let (columns, relations) = self.set_expr(&mut query.body, &scope)?;

        let ordering = Scope {
            relations,
            ctes: Vec::new(),
            aliases: columns.iter().map(|c| c.to_ascii_lowercase()).collect(),
            parent: Some(&scope),
        };
        self.walk(&mut query.order_by, &ordering)?;
        self.walk(&mut query.limit, &ordering)?;
        self.walk(&mut query.limit_by, &ordering)?;
        self.walk(&mut query.offset, &ordering)?;
        self.walk(&mut query.fetch, &ordering)?;

        Ok(columns)
    }

    /// Output columns of a query body, plus the `FROM` relations when the body
    /// is a single select.
    fn set_expr(
        &self,
        body: &mut SetExpr,
        scope: &Scope<'_>,
    ) -> Result<(Vec<String>, Vec<Relation>), ReasonCode> {
        match body {
            SetExpr::Select(select) => self.select(select, scope),
            SetExpr::Query(query) => Ok((self.query(query, Some(scope))?, Vec::new())),
            SetExpr::SetOperation { left, right, .. } => {
                let (columns, _) = self.set_expr(left, scope)?;
                self.set_expr(right, scope)?;
                Ok((columns, Vec::new()))
            }
            SetExpr::Values(values) => {
                self.walk(values, &Scope::child(Some(scope)))?;
                let width = values.rows.first().map_or(0, Vec::len);
                Ok(((0..width).map(|i| format!("col{i}")).collect(), Vec::new()))
            }
            _ => Err(ReasonCode::DisallowedStatement),
        }
    }

    fn select(
        &self,
        select: &mut Select,
        scope: &Scope<'_>,
    ) -> Result<(Vec<String>, Vec<Relation>), ReasonCode> {
        let mut relations = Vec::new();
        for table in &mut select.from {
            self.table_with_joins(table, &mut relations, scope)?;
        }

        expand_wildcards(&mut select.projection, &relations)?;

        let from = Scope {
            relations,
            ..Scope::child(Some(scope))
        };
        // Projection, filters, grouping and join conditions all see the
        // `FROM` relations and nothing else.
        self.walk(select, &from)?;

        let mut columns = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => columns.push(output_name(expr)),
                SelectItem::ExprWithAlias { alias, .. } => columns.push(lower(alias)),
                SelectItem::QualifiedWildcard(name, _) => {
                    let relation = qualified(&from.relations, name)?;
                    columns.extend(relation.columns.iter().cloned());
                }
                SelectItem::Wildcard(_) => {
                    for relation in &from.relations {
                        columns.extend(relation.columns.iter().cloned());
                    }
                }
            }
        }
        Ok((columns, from.relations))
    }

    fn table_with_joins(
        &self,
        table: &mut TableWithJoins,
        relations: &mut Vec<Relation>,
        scope: &Scope<'_>,
    ) -> Result<(), ReasonCode> {
        self.table_factor(&mut table.relation, relations, scope)?;
        for join in &mut table.joins {
            let split = relations.len();
            self.table_factor(&mut join.relation, relations, scope)?;
            match join_constraint(&join.join_operator) {
                Some(JoinConstraint::Using(columns)) => {
                    let (left, right) = relations.split_at(split);
                    for column in columns {
                        let name = lower(column);
                        if !left.iter().any(|r| r.has_column(&name))
                            || !right.iter().any(|r| r.has_column(&name))
                        {
                            debug!("Unknown USING column in candidate: {}", name);
                            return Err(ReasonCode::UnknownTableOrColumn);
                        }
                    }
                }
                // Joins on whatever columns the stored tables share.
                Some(JoinConstraint::Natural) => return Err(ReasonCode::UnknownTableOrColumn),
                _ => {}
            }
        }
        Ok(())
    }

    fn table_factor(
        &self,
        factor: &mut TableFactor,
        relations: &mut Vec<Relation>,
        scope: &Scope<'_>,
    ) -> Result<(), ReasonCode> {
        match factor {
            TableFactor::Table {
                name,
                alias,
                args: None,
                ..
            } => {
                let relation = self.named_relation(name, alias.as_ref(), scope)?;
                relations.push(relation);
            }
            TableFactor::Derived {
                lateral,
                subquery,
                alias,
            } => {
                let columns = if *lateral {
                    let preceding = Scope {
                        relations: relations.clone(),
                        ..Scope::child(Some(scope))
                    };
                    self.query(subquery, Some(&preceding))?
                } else {
                    self.query(subquery, Some(scope))?
                };
                let relation = match alias {
                    Some(alias) => Relation {
                        name: lower(&alias.name),
                        qualifier: Some(alias.name.clone()),
                        table: None,
                        columns: rename(columns, &alias.columns)?,
                    },
                    None => Relation {
                        name: String::new(),
                        qualifier: None,
                        table: None,
                        columns,
                    },
                };
                relations.push(relation);
            }
            TableFactor::NestedJoin {
                table_with_joins,
                alias: None,
            } => self.table_with_joins(table_with_joins, relations, scope)?,
            _ => return Err(ReasonCode::UnknownTableOrColumn),
        }
        Ok(())
    }

    fn named_relation(
        &self,
        name: &ObjectName,
        alias: Option<&TableAlias>,
        scope: &Scope<'_>,
    ) -> Result<Relation, ReasonCode> {
        let Some(last) = name.0.last() else {
            return Err(ReasonCode::UnknownTableOrColumn);
        };
        let cte = match name.0.as_slice() {
            [only] => scope.cte(&lower(only)),
            _ => None,
        };

        let mut relation = match cte {
            Some(cte) => Relation {
                name: cte.name.clone(),
                qualifier: Some(last.clone()),
                table: None,
                columns: cte.columns.clone(),
            },
            None => {
                let table = self.schema.table(&last.value).ok_or_else(|| {
                    debug!("Unknown table in candidate: {}", name);
                    ReasonCode::UnknownTableOrColumn
                })?;
                Relation {
                    name: lower(last),
                    qualifier: Some(last.clone()),
                    table: Some(table.name.to_ascii_lowercase()),
                    columns: table.columns.iter().map(|c| c.name.clone()).collect(),
                }
            }
        };

        if let Some(alias) = alias {
            if !alias.columns.is_empty() {
                if relation.is_base() {
                    // Positional names would rename stored columns the
                    // descriptor does not list.
                    debug!("Column list on table alias {} in candidate", alias.name);
                    return Err(ReasonCode::UnknownTableOrColumn);
                }
                relation.columns = rename(relation.columns, &alias.columns)?;
            }
            relation.name = lower(&alias.name);
            relation.qualifier = Some(alias.name.clone());
        }
        Ok(relation)
    }

    fn walk<T: VisitMut>(&self, node: &mut T, scope: &Scope<'_>) -> Result<(), ReasonCode> {
        let mut names = NameResolver {
            resolver: self,
            scope,
            depth: 0,
        };
        match node.visit(&mut names) {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(code) => Err(code),
        }
    }
}

fn join_constraint(operator: &JoinOperator) -> Option<&JoinConstraint> {
    match operator {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c)
        | JoinOperator::LeftSemi(c)
        | JoinOperator::RightSemi(c)
        | JoinOperator::LeftAnti(c)
        | JoinOperator::RightAnti(c) => Some(c),
        JoinOperator::CrossJoin | JoinOperator::CrossApply | JoinOperator::OuterApply => None,
    }
}

/// Applies a column list (`AS t(a, b)`) to the outputs of a subquery or CTE.
fn rename(mut columns: Vec<String>, names: &[Ident]) -> Result<Vec<String>, ReasonCode> {
    if names.len() > columns.len() {
        return Err(ReasonCode::UnknownTableOrColumn);
    }
    for (column, name) in columns.iter_mut().zip(names) {
        *column = lower(name);
    }
    Ok(columns)
}

/// Name of an unaliased select item, empty when it is not a plain column.
fn output_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => lower(ident),
        Expr::CompoundIdentifier(parts) => parts.last().map(lower).unwrap_or_default(),
        _ => String::new(),
    }
}

fn qualified<'r>(relations: &'r [Relation], name: &ObjectName) -> Result<&'r Relation, ReasonCode> {
    let found = match name.0.as_slice() {
        [qualifier] => {
            let qualifier = lower(qualifier);
            relations.iter().find(|r| r.name == qualifier)
        }
        _ => None,
    };
    found.ok_or_else(|| {
        debug!("Unknown wildcard qualifier in candidate: {}", name);
        ReasonCode::UnknownTableOrColumn
    })
}

fn excluded_columns(options: &WildcardAdditionalOptions) -> Result<Vec<String>, ReasonCode> {
    if options.opt_rename.is_some() || options.opt_replace.is_some() {
        return Err(ReasonCode::UnknownTableOrColumn);
    }
    let mut excluded = Vec::new();
    match &options.opt_exclude {
        Some(ExcludeSelectItem::Single(column)) => excluded.push(lower(column)),
        Some(ExcludeSelectItem::Multiple(columns)) => excluded.extend(columns.iter().map(lower)),
        None => {}
    }
    if let Some(except) = &options.opt_except {
        excluded.push(lower(&except.first_element));
        excluded.extend(except.additional_elements.iter().map(lower));
    }
    Ok(excluded)
}

/// Rewrites `*` and `t.*` over descriptor tables into the descriptor's column
/// list. Wildcards over subqueries and CTEs stay, since their outputs are
/// already resolved.
fn expand_wildcards(projection: &mut Vec<SelectItem>, relations: &[Relation]) -> Result<(), ReasonCode> {
    let qualify = relations.len() > 1;
    let mut expanded = Vec::with_capacity(projection.len());

    for item in projection.drain(..) {
        match item {
            SelectItem::Wildcard(options) => {
                if !relations.iter().any(Relation::is_base) {
                    expanded.push(SelectItem::Wildcard(options));
                    continue;
                }
                let excluded = excluded_columns(&options)?;
                for relation in relations {
                    expand_relation(relation, qualify, &excluded, &mut expanded)?;
                }
            }
            SelectItem::QualifiedWildcard(name, options) => {
                let relation = qualified(relations, &name)?;
                if !relation.is_base() {
                    expanded.push(SelectItem::QualifiedWildcard(name, options));
                    continue;
                }
                let excluded = excluded_columns(&options)?;
                expand_relation(relation, qualify, &excluded, &mut expanded)?;
            }
            other => expanded.push(other),
        }
    }

    *projection = expanded;
    Ok(())
}

fn expand_relation(
    relation: &Relation,
    qualify: bool,
    excluded: &[String],
    out: &mut Vec<SelectItem>,
) -> Result<(), ReasonCode> {
    if !relation.is_base() && excluded.is_empty() {
        if let Some(qualifier) = &relation.qualifier {
            out.push(SelectItem::QualifiedWildcard(
                ObjectName(vec![qualifier.clone()]),
                WildcardAdditionalOptions::default(),
            ));
            return Ok(());
        }
    }

    for column in &relation.columns {
        if excluded.iter().any(|e| e.eq_ignore_ascii_case(column)) {
            continue;
        }
        if column.is_empty() {
            return Err(ReasonCode::UnknownTableOrColumn);
        }
        let expr = match (&relation.qualifier, qualify) {
            (Some(qualifier), true) => Expr::CompoundIdentifier(vec![qualifier.clone(), ident(column)]),
            (None, true) => return Err(ReasonCode::UnknownTableOrColumn),
            (_, false) => Expr::Identifier(ident(column)),
        };
        out.push(SelectItem::UnnamedExpr(expr));
    }
    Ok(())
}

/// Resolves the expressions of one query level. Subqueries found on the way
/// are resolved on their own, with this level as their parent, and skipped by
/// the walk.
struct NameResolver<'a> {
    resolver: &'a Resolver<'a>,
    scope: &'a Scope<'a>,
    depth: usize,
}

fn opens_query(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Subquery(_) | Expr::ArraySubquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. }
    )
}

impl NameResolver<'_> {
    fn column(&self, parts: &[String]) -> ControlFlow<ReasonCode> {
        if self.scope.resolves(parts) {
            ControlFlow::Continue(())
        } else {
            debug!("Unknown column in candidate: {}", parts.join("."));
            ControlFlow::Break(ReasonCode::UnknownTableOrColumn)
        }
    }

    fn subquery(&self, query: &mut Query) -> ControlFlow<ReasonCode> {
        match self.resolver.query(query, Some(self.scope)) {
            Ok(_) => ControlFlow::Continue(()),
            Err(code) => ControlFlow::Break(code),
        }
    }

    /// `*` arguments are only allowed in `COUNT`.
    fn function(&self, function: &Function) -> ControlFlow<ReasonCode> {
        let is_count = function
            .name
            .0
            .last()
            .is_some_and(|n| n.value.eq_ignore_ascii_case("count"));
        for arg in &function.args {
            let (FunctionArg::Named { arg, .. } | FunctionArg::Unnamed(arg)) = arg;
            let allowed = match arg {
                FunctionArgExpr::Expr(_) => true,
                FunctionArgExpr::Wildcard => is_count,
                FunctionArgExpr::QualifiedWildcard(name) => {
                    is_count
                        && match name.0.as_slice() {
                            [qualifier] => self.scope.relation(&lower(qualifier)).is_some(),
                            _ => false,
                        }
                }
            };
            if !allowed {
                debug!("Wildcard argument to {} in candidate", function.name);
                return ControlFlow::Break(ReasonCode::UnknownTableOrColumn);
            }
        }
        ControlFlow::Continue(())
    }
}

impl VisitorMut for NameResolver<'_> {
    type Break = ReasonCode;

    fn pre_visit_table_factor(&mut self, factor: &mut TableFactor) -> ControlFlow<Self::Break> {
        if matches!(factor, TableFactor::Derived { .. }) {
            self.depth += 1;
        }
        ControlFlow::Continue(())
    }

    fn post_visit_table_factor(&mut self, factor: &mut TableFactor) -> ControlFlow<Self::Break> {
        if matches!(factor, TableFactor::Derived { .. }) {
            self.depth -= 1;
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        if self.depth > 0 {
            if opens_query(expr) {
                self.depth += 1;
            }
            return ControlFlow::Continue(());
        }

        match expr {
            Expr::Identifier(ident) => self.column(&[lower(ident)])?,
            Expr::CompoundIdentifier(parts) => {
                let parts: Vec<String> = parts.iter().map(lower).collect();
                self.column(&parts)?;
            }
            Expr::Function(function) => self.function(function)?,
            Expr::Subquery(query) | Expr::ArraySubquery(query) | Expr::Exists { subquery: query, .. } => {
                self.subquery(query)?;
                self.depth += 1;
            }
            Expr::InSubquery { expr: inner, subquery, .. } => {
                inner.visit(&mut *self)?;
                self.subquery(subquery)?;
                self.depth += 1;
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        if opens_query(expr) {
            self.depth -= 1;
        }
        ControlFlow::Continue(())
    }
}
