//! End-to-end scenarios against the in-memory federation.

mod support;

use std::{
    str::FromStr,
    sync::Arc,
};

use algorithms::{
    AlgorithmPlan,
    Step,
    StepInput,
    StepTarget,
};
use common::{
    task_dtos::UdfArgument,
    RequestId,
    TableInfo,
    TableName,
    TableSchema,
    TableType,
};
use errors::ErrorMetadataAnyhowExt;
use maplit::btreemap;
use serde_json::json;
use worker_client::WorkerClient;

use crate::{
    executor::{
        ExecutionEngine,
        WorkerHandle,
    },
    smpc::testing::FakeSmpcCluster,
    tests::support::{
        data_model,
        worker_rows,
        TestFederation,
        GLOBAL_ADDR,
        LOCAL1_ADDR,
        LOCAL2_ADDR,
    },
    AlgorithmRequest,
    InputData,
};

fn ttest_request() -> AlgorithmRequest {
    AlgorithmRequest {
        inputdata: InputData {
            data_model: data_model(),
            datasets: vec!["ds1".to_owned(), "ds2".to_owned()],
            x: Some(vec!["x1".to_owned()]),
            y: Some(vec!["y1".to_owned()]),
            filters: None,
        },
        parameters: btreemap! {
            "alpha".to_owned() => json!(0.05),
            "alt_hypothesis".to_owned() => json!("two-sided"),
        },
        flags: Default::default(),
    }
}

fn pca_request(transformation: serde_json::Value) -> AlgorithmRequest {
    AlgorithmRequest {
        inputdata: InputData {
            data_model: data_model(),
            datasets: vec!["ds1".to_owned(), "ds2".to_owned()],
            x: None,
            y: Some(vec!["x1".to_owned(), "x2".to_owned()]),
            filters: None,
        },
        parameters: btreemap! {
            "data_transformation".to_owned() => transformation,
        },
        flags: Default::default(),
    }
}

#[tokio::test]
async fn test_paired_ttest_happy_path() {
    let federation = TestFederation::for_ttest(TestFederation::smpc_off()).await;
    let result = federation
        .controller
        .exec_algorithm(RequestId::fresh(), "paired_ttest", ttest_request())
        .await
        .unwrap();

    assert_eq!(result["df"].as_f64().unwrap(), 99.0);
    let t_stat = result["t_stat"].as_f64().unwrap();
    assert!((t_stat - 5.0).abs() < 1e-9, "t_stat was {t_stat}");
    let p = result["p"].as_f64().unwrap();
    assert!(p > 0.0 && p < 1.0, "p was {p}");
    assert_eq!(result["mean_diff"].as_f64().unwrap(), 1.0);
}

#[tokio::test]
async fn test_paired_ttest_smpc_equivalence() {
    let federation_off = TestFederation::for_ttest(TestFederation::smpc_off()).await;
    let plain = federation_off
        .controller
        .exec_algorithm(RequestId::fresh(), "paired_ttest", ttest_request())
        .await
        .unwrap();

    let federation_on = TestFederation::for_ttest(TestFederation::smpc_on()).await;
    let secure = federation_on
        .controller
        .exec_algorithm(RequestId::fresh(), "paired_ttest", ttest_request())
        .await
        .unwrap();

    assert_eq!(plain["df"], secure["df"]);
    let t_plain = plain["t_stat"].as_f64().unwrap();
    let t_secure = secure["t_stat"].as_f64().unwrap();
    assert!(
        (t_plain - t_secure).abs() < 1e-9,
        "SMPC on/off t statistics diverged: {t_plain} vs {t_secure}"
    );
    let p_plain = plain["p"].as_f64().unwrap();
    let p_secure = secure["p"].as_f64().unwrap();
    assert!((p_plain - p_secure).abs() < 1e-9);
}

#[tokio::test]
async fn test_registry_convergence() {
    let federation = TestFederation::for_ttest(TestFederation::smpc_off()).await;
    let snapshot = federation.aggregator.snapshot();

    let worker_ids: Vec<String> = snapshot
        .node_registry
        .workers()
        .map(|w| w.id.to_string())
        .collect();
    assert_eq!(worker_ids, vec!["globalnode", "localnode1", "localnode2"]);
    assert_eq!(
        snapshot.data_model_registry.all_datasets_per_data_model(),
        btreemap! { data_model() => vec!["ds1".to_owned(), "ds2".to_owned()] }
    );
    assert!(snapshot
        .data_model_registry
        .dataset_exists(&data_model(), "ds1"));

    // A worker that stops answering disappears from the next snapshot.
    federation.cluster.set_unreachable(LOCAL2_ADDR);
    federation.aggregator.update_once().await;
    let snapshot = federation.aggregator.snapshot();
    assert!(!snapshot
        .data_model_registry
        .dataset_exists(&data_model(), "ds2"));
    assert!(snapshot
        .data_model_registry
        .dataset_exists(&data_model(), "ds1"));
}

#[tokio::test]
async fn test_incompatible_data_model_is_rejected_end_to_end() {
    let federation = TestFederation::for_ttest(TestFederation::smpc_off()).await;
    // localnode2 re-advertises the data model with a different x1 type.
    let mut cdes = support::test_cdes();
    cdes.values.get_mut("x1").unwrap().sql_type = common::DType::Int;
    federation.cluster.load_data_model(
        LOCAL2_ADDR,
        &data_model(),
        cdes,
        btreemap! {"ds2".to_owned() => "Dataset two".to_owned()},
        vec![],
    );
    federation.aggregator.update_once().await;

    let snapshot = federation.aggregator.snapshot();
    assert!(!snapshot.data_model_registry.data_model_exists(&data_model()));

    let err = federation
        .controller
        .exec_algorithm(RequestId::fresh(), "paired_ttest", ttest_request())
        .await
        .unwrap_err();
    assert!(err.is_bad_user_input());
    assert_eq!(err.short_msg(), "DataModelUnavailable");
}

#[tokio::test]
async fn test_duplicated_dataset_is_dropped_end_to_end() {
    let federation = TestFederation::for_ttest(TestFederation::smpc_off()).await;
    // localnode2 now also claims ds1.
    let (_, rows2) = support::ttest_rows();
    federation.cluster.load_data_model(
        LOCAL2_ADDR,
        &data_model(),
        support::test_cdes(),
        btreemap! {
            "ds1".to_owned() => "Dataset one".to_owned(),
            "ds2".to_owned() => "Dataset two".to_owned(),
        },
        worker_rows("ds2", &rows2),
    );
    federation.aggregator.update_once().await;

    let snapshot = federation.aggregator.snapshot();
    assert!(!snapshot
        .data_model_registry
        .dataset_exists(&data_model(), "ds1"));
    assert!(snapshot
        .data_model_registry
        .dataset_exists(&data_model(), "ds2"));

    let err = federation
        .controller
        .exec_algorithm(RequestId::fresh(), "paired_ttest", ttest_request())
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), "DatasetUnavailable");
    assert!(err.msg().contains("ds1"));
}

#[tokio::test]
async fn test_pca_log_transform_of_non_positive_column() {
    // x1 holds a zero, so the log transformation must refuse.
    let rows: Vec<(f64, f64, f64)> = (0..20).map(|i| (i as f64, 0.0, 1.0 + i as f64)).collect();
    let mut federation = TestFederation::new(
        TestFederation::smpc_off(),
        worker_rows("ds1", &rows),
        worker_rows("ds2", &rows),
    )
    .await;

    let err = federation
        .controller
        .exec_algorithm(
            RequestId::fresh(),
            "pca_with_transformation",
            pca_request(json!({"log": ["x1"]})),
        )
        .await
        .unwrap_err();
    assert!(err.is_bad_user_input());
    assert!(err
        .msg()
        .contains("Log transformation cannot be applied to non-positive values in column"));

    // The failed run's artifacts are dropped by the cleaner.
    let contexts = federation.cluster.contexts(LOCAL1_ADDR);
    assert!(!contexts.is_empty(), "the failed run left artifacts behind");
    federation.sweep().await;
    for address in [GLOBAL_ADDR, LOCAL1_ADDR, LOCAL2_ADDR] {
        assert!(
            federation.cluster.contexts(address).is_empty(),
            "artifacts survived cleanup on {address}"
        );
    }
    assert!(federation.cleaner.pending_contexts().is_empty());
}

#[tokio::test]
async fn test_worker_disappears_mid_algorithm() {
    let rows: Vec<(f64, f64, f64)> = (0..20)
        .map(|i| (1.0 + i as f64, 0.0, 2.0 + ((i * 7) % 11) as f64))
        .collect();
    let mut federation = TestFederation::new(
        TestFederation::smpc_off(),
        worker_rows("ds1", &rows),
        worker_rows("ds2", &rows),
    )
    .await;
    // The PCA plan with a transformation runs five steps; pca_local2 is
    // the fourth. Its dispatch fails twice on localnode2: once on the
    // first attempt, once on the retry under a fresh command id.
    federation
        .cluster
        .fail_udf_unreachable(LOCAL2_ADDR, "pca_local2", 2);

    let err = federation
        .controller
        .exec_algorithm(
            RequestId::fresh(),
            "pca_with_transformation",
            pca_request(json!({"center": ["x1"]})),
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "exhausted retries surface the last error");
    assert_eq!(err.short_msg(), "WorkerUnreachable");
    // Both attempts reached the worker: the transform step, local1, and
    // pca_local2 twice (the retry under a fresh command id).
    let udf_calls = federation.cluster.calls_of("run_udf");
    let to_local2 = udf_calls.iter().filter(|a| *a == LOCAL2_ADDR).count();
    assert_eq!(to_local2, 4);

    // The disappeared worker keeps its artifacts until it is reachable
    // again.
    federation.cluster.set_unreachable(LOCAL2_ADDR);
    federation.sweep().await;
    assert!(federation.cluster.contexts(GLOBAL_ADDR).is_empty());
    assert!(federation.cluster.contexts(LOCAL1_ADDR).is_empty());
    assert!(!federation.cluster.contexts(LOCAL2_ADDR).is_empty());
    assert!(!federation.cleaner.pending_contexts().is_empty());

    federation.cluster.set_reachable(LOCAL2_ADDR);
    federation.sweep().await;
    assert!(federation.cluster.contexts(LOCAL2_ADDR).is_empty());
    assert!(federation.cleaner.pending_contexts().is_empty());
}

#[tokio::test]
async fn test_udf_contract_violation_is_rejected_before_any_database_activity() {
    let federation = TestFederation::for_ttest(TestFederation::smpc_off()).await;
    let client = WorkerClient::new(
        "globalnode".parse().unwrap(),
        GLOBAL_ADDR,
        RequestId::fresh(),
        federation.cluster.clone(),
    );

    // pca_global2 declares prev_state as state(); feed it a transfer
    // table instead.
    let kwargs = btreemap! {
        "local_transfers".to_owned() => UdfArgument::Table {
            info: TableInfo::new(
                "normal_localnode1_ctxa_1_0",
                TableSchema::secure_transfer(),
                TableType::Normal,
            ),
        },
        "prev_state".to_owned() => UdfArgument::Table {
            info: TableInfo::new(
                "normal_globalnode_ctxa_2_0",
                TableSchema::transfer(),
                TableType::Normal,
            ),
        },
    };
    let err = client
        .run_udf(
            &"ctxa".parse().unwrap(),
            &"3".parse().unwrap(),
            "pca_global2",
            Vec::new(),
            kwargs,
            false,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), "UdfBadCall");
    assert!(err.msg().contains("prev_state"));
    assert!(err.msg().contains("transfer argument"));
    // Nothing was created for that context anywhere.
    let context: common::ContextId = "ctxa".parse().unwrap();
    assert!(!federation.cluster.contexts(GLOBAL_ADDR).contains(&context));
}

#[tokio::test]
async fn test_cleanup_completeness_after_successful_run() {
    let mut federation = TestFederation::for_ttest(TestFederation::smpc_off()).await;
    federation
        .controller
        .exec_algorithm(RequestId::fresh(), "paired_ttest", ttest_request())
        .await
        .unwrap();

    // The run leaves artifacts on all three workers until the cleaner
    // visits them.
    assert!(!federation.cluster.contexts(GLOBAL_ADDR).is_empty());
    federation.sweep().await;
    for address in [GLOBAL_ADDR, LOCAL1_ADDR, LOCAL2_ADDR] {
        assert!(
            federation.cluster.contexts(address).is_empty(),
            "artifacts survived cleanup on {address}"
        );
    }
}

#[tokio::test]
async fn test_generated_names_are_unique_and_parse() {
    let federation = TestFederation::for_ttest(TestFederation::smpc_off()).await;
    federation
        .controller
        .exec_algorithm(RequestId::fresh(), "paired_ttest", ttest_request())
        .await
        .unwrap();

    for address in [GLOBAL_ADDR, LOCAL1_ADDR, LOCAL2_ADDR] {
        let contexts = federation.cluster.contexts(address);
        for context_id in &contexts {
            let names = federation.cluster.context_tables(address, context_id);
            let mut parsed: Vec<TableName> = names
                .iter()
                .map(|name| TableName::from_str(name).expect("generated names parse"))
                .collect();
            let before = parsed.len();
            parsed.sort();
            parsed.dedup();
            assert_eq!(parsed.len(), before, "duplicate table name on {address}");
        }
    }
}

#[tokio::test]
async fn test_unshared_local_output_cannot_feed_a_global_step() {
    let federation = TestFederation::for_ttest(TestFederation::smpc_off()).await;
    let snapshot = federation.aggregator.snapshot();
    let channel: Arc<dyn worker_client::TaskChannel> = federation.cluster.clone();
    let handle = |address: &str, id: &str| WorkerHandle {
        info: snapshot
            .node_registry
            .get(&id.parse().unwrap())
            .unwrap()
            .clone(),
        client: WorkerClient::new(
            id.parse().unwrap(),
            address,
            RequestId::fresh(),
            channel.clone(),
        ),
    };
    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
    let engine = ExecutionEngine::new(
        RequestId::fresh(),
        common::ContextId::fresh(),
        data_model(),
        None,
        handle(GLOBAL_ADDR, "globalnode"),
        vec![
            handle(LOCAL1_ADDR, "localnode1"),
            handle(LOCAL2_ADDR, "localnode2"),
        ],
        btreemap! {
            "localnode1".parse().unwrap() => vec!["ds1".to_owned()],
            "localnode2".parse().unwrap() => vec!["ds2".to_owned()],
        },
        false,
        Arc::new(FakeSmpcCluster::new(channel.clone())),
        events_tx,
    );

    let plan = AlgorithmPlan {
        variable_groups: vec![vec!["x1".to_owned()]],
        dropna: true,
        check_min_rows: true,
        steps: vec![
            Step {
                func_name: "test_local_noop".to_owned(),
                target: StepTarget::LocalWorkers,
                keyword_args: vec![("x".to_owned(), StepInput::DataView { group: 0 })],
                share_outputs: vec![false],
                output_schema: None,
            },
            Step {
                func_name: "test_global_consume".to_owned(),
                target: StepTarget::GlobalWorker,
                keyword_args: vec![(
                    "t".to_owned(),
                    StepInput::Previous { step: 0, output: 0 },
                )],
                share_outputs: vec![false],
                output_schema: None,
            },
        ],
        result: Arc::new(|_| Ok(json!(null))),
    };

    let err = engine.run(&plan).await.unwrap_err();
    assert_eq!(err.short_msg(), "InvalidStepPlan");
    assert!(err.msg().contains("was not shared to the global"));
}

#[tokio::test]
async fn test_smpc_flag_rejected_when_not_enabled() {
    let federation = TestFederation::for_ttest(TestFederation::smpc_off()).await;
    let mut request = ttest_request();
    request.flags.insert("smpc".to_owned(), true);
    let err = federation
        .controller
        .exec_algorithm(RequestId::fresh(), "paired_ttest", request)
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), "SmpcNotEnabled");
}

#[tokio::test]
async fn test_unknown_algorithm_is_bad_request() {
    let federation = TestFederation::for_ttest(TestFederation::smpc_off()).await;
    let err = federation
        .controller
        .exec_algorithm(RequestId::fresh(), "mystery", ttest_request())
        .await
        .unwrap_err();
    assert_eq!(err.short_msg(), "UnknownAlgorithm");
    assert_eq!(err.http_status(), http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pca_happy_path_eigenvalues() {
    // Standardized two-variable PCA: the covariance becomes the
    // correlation matrix, whose eigenvalues are 1 +- r.
    let rows: Vec<(f64, f64, f64)> = (0..40)
        .map(|i| {
            let x = i as f64;
            (x, 0.0, 2.0 * x + ((i % 3) as f64))
        })
        .collect();
    let federation = TestFederation::new(
        TestFederation::smpc_off(),
        worker_rows("ds1", &rows[..20]),
        worker_rows("ds2", &rows[20..]),
    )
    .await;

    let result = federation
        .controller
        .exec_algorithm(
            RequestId::fresh(),
            "pca_with_transformation",
            pca_request(json!({})),
        )
        .await
        .unwrap();
    let eigenvalues: Vec<f64> = result["eigenvalues"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_f64().unwrap())
        .collect();
    assert_eq!(eigenvalues.len(), 2);
    // Eigenvalues of a 2x2 correlation matrix sum to 2 and are ordered.
    assert!((eigenvalues[0] + eigenvalues[1] - 2.0).abs() < 1e-9);
    assert!(eigenvalues[0] >= eigenvalues[1]);
    assert_eq!(result["n_obs"].as_f64().unwrap(), 40.0);
}
