//! Static safety analysis of generated SQL.
//!
//! `validate` is a pure function of the candidate text and the schema
//! descriptor. Checks run in a fixed order and the first failure decides the
//! verdict:
//!
//! 1. the text parses (`SYNTAX_INVALID`),
//! 2. it holds exactly one statement (`MULTI_STATEMENT`),
//! 3. that statement is a read (`DISALLOWED_STATEMENT`),
//! 4. it opens no side channel (`FORBIDDEN_KEYWORD`),
//! 5. every table and column resolves against the descriptor
//!    (`UNKNOWN_TABLE_OR_COLUMN`).
//!
//! Accepted statements are re-rendered from the parse tree, which drops
//! comments and normalizes whitespace and keyword case. Wildcards over
//! descriptor tables come back as explicit column lists.

mod keywords;
mod references;
mod scope;

use crate::schema::SchemaDescriptor;
use references::References;
use serde::Serialize;
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    DisallowedStatement,
    ForbiddenKeyword,
    UnknownTableOrColumn,
    SyntaxInvalid,
    MultiStatement,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::DisallowedStatement => "DISALLOWED_STATEMENT",
            ReasonCode::ForbiddenKeyword => "FORBIDDEN_KEYWORD",
            ReasonCode::UnknownTableOrColumn => "UNKNOWN_TABLE_OR_COLUMN",
            ReasonCode::SyntaxInvalid => "SYNTAX_INVALID",
            ReasonCode::MultiStatement => "MULTI_STATEMENT",
        }
    }

    /// Instruction fed back to the model on a corrective attempt.
    pub fn correction_hint(&self) -> &'static str {
        match self {
            ReasonCode::DisallowedStatement => {
                "Only a single read-only SELECT statement is allowed."
            }
            ReasonCode::ForbiddenKeyword => {
                "Do not use file, system or session functions, system catalogs, variables or other databases."
            }
            ReasonCode::UnknownTableOrColumn => {
                "Use only the tables and columns listed in the schema, spelled exactly as shown."
            }
            ReasonCode::SyntaxInvalid => "The previous answer was not valid SQL.",
            ReasonCode::MultiStatement => "Return exactly one statement.",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A statement that passed validation, in sanitized form.
///
/// Only this module can build one, so holding a `ValidatedSql` is proof the
/// text went through [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql(String);

impl ValidatedSql {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ValidatedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Accepted(ValidatedSql),
    Rejected(ReasonCode),
}

impl ValidationVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted(_))
    }
}

pub fn validate(sql: &str, schema: &SchemaDescriptor) -> ValidationVerdict {
    match check(sql, schema) {
        Ok(sanitized) => ValidationVerdict::Accepted(ValidatedSql(sanitized)),
        Err(code) => ValidationVerdict::Rejected(code),
    }
}

fn check(sql: &str, schema: &SchemaDescriptor) -> Result<String, ReasonCode> {
    let dialect = GenericDialect {};

    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|_| ReasonCode::SyntaxInvalid)?;
    if !tokens.iter().any(is_significant) {
        return Err(ReasonCode::SyntaxInvalid);
    }

    let mut statements = Parser::parse_sql(&dialect, sql).map_err(|e| {
        debug!("Candidate failed to parse: {}", e);
        // Writes the dialect cannot parse are still writes.
        if starts_with_write(&tokens) {
            ReasonCode::DisallowedStatement
        } else {
            ReasonCode::SyntaxInvalid
        }
    })?;

    let statement = match statements.as_mut_slice() {
        [] => return Err(ReasonCode::SyntaxInvalid),
        [statement] => statement,
        _ => return Err(ReasonCode::MultiStatement),
    };

    let refs = References::collect(statement);
    let Statement::Query(query) = &mut *statement else {
        return Err(ReasonCode::DisallowedStatement);
    };
    if !is_read_body(&query.body) || refs.non_read_body {
        return Err(ReasonCode::DisallowedStatement);
    }

    check_side_channels(&tokens, &refs, schema)?;
    scope::resolve(query, schema)?;

    Ok(statement.to_string())
}

fn is_significant(token: &Token) -> bool {
    !matches!(token, Token::Whitespace(_) | Token::SemiColon | Token::EOF)
}

fn starts_with_write(tokens: &[Token]) -> bool {
    matches!(
        tokens.iter().find(|t| is_significant(t)),
        Some(Token::Word(word)) if keywords::is_write_keyword(&word.value)
    )
}

fn is_read_body(body: &SetExpr) -> bool {
    matches!(
        body,
        SetExpr::Select(_) | SetExpr::Query(_) | SetExpr::SetOperation { .. } | SetExpr::Values(_)
    )
}

fn check_side_channels(
    tokens: &[Token],
    refs: &References,
    schema: &SchemaDescriptor,
) -> Result<(), ReasonCode> {
    let comment_free: Vec<Token> = tokens
        .iter()
        .filter(|t| {
            !matches!(
                t,
                Token::Whitespace(Whitespace::SingleLineComment { .. })
                    | Token::Whitespace(Whitespace::MultiLineComment(_))
            )
        })
        .cloned()
        .collect();
    if let Some(word) = keywords::first_forbidden_token(&comment_free) {
        debug!("Forbidden token in candidate: {}", word);
        return Err(ReasonCode::ForbiddenKeyword);
    }

    if refs.selects_into || refs.has_locks || !refs.table_functions.is_empty() {
        return Err(ReasonCode::ForbiddenKeyword);
    }

    if let Some(function) = refs
        .functions
        .iter()
        .find(|f| keywords::is_forbidden_function(f))
    {
        debug!("Forbidden function in candidate: {}", function);
        return Err(ReasonCode::ForbiddenKeyword);
    }

    for relation in &refs.relations {
        if relation.iter().any(|part| keywords::is_system_catalog(part)) {
            return Err(ReasonCode::ForbiddenKeyword);
        }
        match relation.as_slice() {
            [_] => {}
            [namespace, _] if schema.is_own_namespace(namespace) => {}
            // Another schema, database or catalog.
            _ => return Err(ReasonCode::ForbiddenKeyword),
        }
    }

    for column in &refs.columns {
        if let [first, _, _, ..] = column.as_slice() {
            if !schema.is_own_namespace(first) {
                return Err(ReasonCode::ForbiddenKeyword);
            }
        }
    }

    Ok(())
}
