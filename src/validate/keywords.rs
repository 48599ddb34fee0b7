use sqlparser::tokenizer::Token;

/// Functions that reach the file system, the network, other databases or the
/// server process, or that stall a connection.
const FORBIDDEN_FUNCTIONS: &[&str] = &[
    "load_file",
    "read_csv",
    "read_csv_auto",
    "read_parquet",
    "parquet_scan",
    "read_json",
    "read_json_auto",
    "read_json_objects",
    "read_text",
    "read_blob",
    "glob",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_sleep",
    "sleep",
    "benchmark",
    "system",
    "sys_exec",
    "xp_cmdshell",
    "dblink",
    "lo_import",
    "lo_export",
    "query",
    "query_table",
    "getvariable",
    "current_setting",
    "set_config",
    "version",
    "user",
    "current_user",
    "session_user",
    // Star expression matching stored column names by pattern.
    "columns",
];

/// Catalog namespaces and tables exposing server metadata.
const SYSTEM_CATALOGS: &[&str] = &[
    "information_schema",
    "pg_catalog",
    "mysql",
    "performance_schema",
    "sys",
    "sqlite_master",
    "sqlite_schema",
    "temp",
    "system",
];

/// Bare words that never belong in a read query.
const FORBIDDEN_WORDS: &[&str] = &[
    "outfile",
    "dumpfile",
    "attach",
    "detach",
    "pragma",
    "copy",
    "export",
    "install",
    "load",
    "call",
    "exec",
    "execute",
    "shutdown",
    "kill",
    "grant",
    "revoke",
];

/// Leading keywords of statements that change data or schema.
const WRITE_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "merge", "upsert", "replace", "truncate", "drop", "alter",
    "create",
];

pub fn is_write_keyword(word: &str) -> bool {
    WRITE_KEYWORDS.contains(&word.to_ascii_lowercase().as_str())
}

pub fn is_forbidden_function(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    FORBIDDEN_FUNCTIONS.contains(&name.as_str())
        || name.starts_with("duckdb_")
        || name.starts_with("pg_")
}

/// True when a lower-cased relation name part points into server metadata.
pub fn is_system_catalog(part: &str) -> bool {
    SYSTEM_CATALOGS.contains(&part) || part.starts_with("duckdb_") || part.starts_with("pg_")
}

/// Returns the first token that opens a side channel: a forbidden bare word,
/// or a session/system variable (`@x`, `@@x`).
pub fn first_forbidden_token(tokens: &[Token]) -> Option<String> {
    tokens.iter().find_map(|token| match token {
        Token::Word(word) if word.quote_style.is_none() => {
            let value = word.value.to_ascii_lowercase();
            if value.starts_with('@') || FORBIDDEN_WORDS.contains(&value.as_str()) {
                Some(word.value.clone())
            } else {
                None
            }
        }
        Token::Word(_) => None,
        other => {
            let text = other.to_string();
            text.starts_with('@').then_some(text)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::tokenizer::Tokenizer;

    fn tokens(sql: &str) -> Vec<Token> {
        Tokenizer::new(&GenericDialect {}, sql)
            .tokenize()
            .expect("tokenize")
    }

    #[test]
    fn ignores_words_inside_literals() {
        let toks = tokens("SELECT prod_name FROM order_product WHERE status = 'copy load exec'");
        assert_eq!(first_forbidden_token(&toks), None);
    }

    #[test]
    fn finds_system_variables() {
        let toks = tokens("SELECT @@version");
        assert!(first_forbidden_token(&toks).is_some());
    }

    #[test]
    fn classifies_functions_and_catalogs() {
        assert!(is_forbidden_function("READ_CSV_AUTO"));
        assert!(is_forbidden_function("duckdb_settings"));
        assert!(!is_forbidden_function("sum"));
        assert!(is_system_catalog("information_schema"));
        assert!(!is_system_catalog("order_product"));
        assert!(is_write_keyword("Delete"));
        assert!(!is_write_keyword("select"));
    }
}
