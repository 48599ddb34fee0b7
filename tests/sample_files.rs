use clap::Parser;
use nl_query::config::{AppConfig, CliArgs};
use nl_query::schema::loader;
use nl_query::{ValidationVerdict, validate};
use std::path::Path;

fn sample(name: &str) -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join(name)
        .to_string_lossy()
        .into_owned()
}

#[test]
fn sample_config_loads() {
    let path = sample("config.example.toml");
    let args = CliArgs::parse_from(["nl-query", "--config", path.as_str()]);
    let config = AppConfig::new(&args).expect("config");

    assert_eq!(config.llm.backend, "ollama");
    assert_eq!(config.examples.len(), 4);
    assert!(!config.pipeline.corrective_retry);
}

#[test]
fn sample_examples_pass_validation() {
    let path = sample("config.example.toml");
    let args = CliArgs::parse_from(["nl-query", "--config", path.as_str()]);
    let config = AppConfig::new(&args).expect("config");
    let schema = loader::from_file(Path::new(&sample("schema.example.toml"))).expect("schema");

    assert_eq!(schema.tables.len(), 4);
    for example in &config.examples {
        assert!(
            matches!(validate(&example.sql, &schema), ValidationVerdict::Accepted(_)),
            "few-shot example rejected: {}",
            example.sql
        );
    }
}
