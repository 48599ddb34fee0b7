mod common;

use common::{ScriptedModel, duckdb_executor, pipeline, settings};
use nl_query::db::record::Value;
use nl_query::{FailureKind, PipelineOutcome, PipelineRequest, ReasonCode};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn answers_fertilizer_question_from_duckdb() {
    let model = ScriptedModel::answering(&[
        "```sql\nSELECT prod_name, prod_price FROM order_product WHERE prod_price < 500\n```",
    ]);
    let executor = duckdb_executor(2, Duration::from_secs(1));
    let pipeline = pipeline(model, executor.clone(), settings()).await;

    let outcome = pipeline
        .run(PipelineRequest::new("find fertilizer products under 500"))
        .await;

    let rows = match outcome {
        PipelineOutcome::Success(rows) => rows,
        other => panic!("expected rows, got {other:?}"),
    };
    assert_eq!(rows.columns, vec!["prod_name", "prod_price"]);
    assert_eq!(rows.row_count, 2);
    let names: Vec<&Value> = rows.records.iter().map(|r| &r["prod_name"]).collect();
    assert!(names.contains(&&Value::Text("Urea fertilizer".to_string())));
    assert!(names.contains(&&Value::Text("Neem cake fertilizer".to_string())));
    assert_eq!(executor.pool().checked_out(), 0);
}

#[tokio::test]
async fn exhausted_pool_waits_then_fails() {
    let model = ScriptedModel::always("SELECT prod_name FROM order_product");
    let executor = duckdb_executor(1, Duration::from_millis(200));
    let pipeline = pipeline(model, executor.clone(), settings()).await;
    let held = executor.pool().acquire().await.expect("connection");

    let started = Instant::now();
    let outcome = pipeline.run(PipelineRequest::new("list products")).await;

    assert!(matches!(
        outcome,
        PipelineOutcome::ExecutionError(FailureKind::ResourceExhausted)
    ));
    assert!(started.elapsed() >= Duration::from_millis(200));

    drop(held);
    let outcome = pipeline.run(PipelineRequest::new("list products")).await;
    assert!(outcome.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_respect_pool_size() {
    let model = ScriptedModel::always("SELECT prod_name, status FROM order_product ORDER BY prod_id");
    let executor = duckdb_executor(2, Duration::from_secs(10));
    let pipeline = Arc::new(pipeline(model, executor.clone(), settings()).await);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let pipeline = Arc::clone(&pipeline);
        tasks.push(tokio::spawn(async move {
            pipeline
                .run(PipelineRequest::new(format!("list products #{i}")))
                .await
        }));
    }
    for task in tasks {
        let outcome = task.await.expect("task");
        assert!(outcome.is_success(), "unexpected outcome {outcome:?}");
    }

    assert!(executor.pool().peak_checked_out() <= 2);
    assert_eq!(executor.pool().checked_out(), 0);
}

#[tokio::test]
async fn empty_result_is_still_success() {
    let model = ScriptedModel::always("SELECT product_id, status FROM order_tracking_status");
    let executor = duckdb_executor(1, Duration::from_secs(1));
    let pipeline = pipeline(model, executor, settings()).await;

    let outcome = pipeline.run(PipelineRequest::new("where are my orders?")).await;

    match outcome {
        PipelineOutcome::Success(rows) => {
            assert_eq!(rows.columns, vec!["product_id", "status"]);
            assert_eq!(rows.row_count, 0);
            assert!(!rows.truncated);
        }
        other => panic!("expected rows, got {other:?}"),
    }
}

#[tokio::test]
async fn abandoned_request_leaves_the_wait_queue() {
    let model = ScriptedModel::always("SELECT prod_name FROM order_product");
    let executor = duckdb_executor(1, Duration::from_secs(10));
    let pipeline = pipeline(model, executor.clone(), settings()).await;
    let held = executor.pool().acquire().await.expect("connection");

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        pipeline.run(PipelineRequest::new("list products")),
    )
    .await;
    assert!(abandoned.is_err(), "request should still be queued");

    drop(held);
    let next = tokio::time::timeout(Duration::from_secs(1), executor.pool().acquire())
        .await
        .expect("slot not taken by the abandoned request")
        .expect("connection");
    assert_eq!(executor.pool().checked_out(), 1);
    drop(next);

    let outcome = pipeline.run(PipelineRequest::new("list products")).await;
    assert!(outcome.is_success());
    assert_eq!(executor.pool().checked_out(), 0);
    assert_eq!(executor.pool().peak_checked_out(), 1);
}

#[tokio::test]
async fn undescribed_columns_stay_hidden() {
    let executor = duckdb_executor(1, Duration::from_secs(1));

    let pipeline_for = |sql: &str| {
        let model = ScriptedModel::always(sql);
        let executor = executor.clone();
        async move { pipeline(model, executor, settings()).await }
    };

    let everything = pipeline_for("SELECT * FROM order_product")
        .await
        .run(PipelineRequest::new("show all product data"))
        .await;
    match everything {
        PipelineOutcome::Success(rows) => {
            assert!(!rows.columns.iter().any(|c| c == "supplier_cost"));
            assert_eq!(rows.columns.len(), 7);
            assert_eq!(rows.row_count, 4);
        }
        other => panic!("expected rows, got {other:?}"),
    }

    for sql in [
        "SELECT supplier_cost AS supplier_cost FROM order_product",
        "SELECT c FROM order_product AS p(a, b, d, e, f, g, h, c)",
        "SELECT prod_name FROM order_product a JOIN order_product b USING (supplier_cost)",
    ] {
        let outcome = pipeline_for(sql)
            .await
            .run(PipelineRequest::new("what do products cost us?"))
            .await;
        assert!(
            matches!(
                outcome,
                PipelineOutcome::RejectedQuery(ReasonCode::UnknownTableOrColumn)
            ),
            "{sql}: {outcome:?}"
        );
    }
}
