//! Test federation harness: an in-memory cluster with native kernels for
//! the shipped algorithms, wired to a real aggregator, controller and
//! cleaner.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use algorithms::default_registries;
use common::{
    CommonDataElement,
    CommonDataElements,
    DType,
    DataModelId,
    NodeRole,
    DATASET_CDE_CODE,
};
use errors::ErrorMetadata;
use landscape::LandscapeAggregator;
use maplit::btreemap;
use serde_json::{
    json,
    Value,
};
use tokio::sync::mpsc;
use udfgen::{
    relation,
    schema_var,
    transfer,
    transfer_out,
    UdfDefinition,
};
use worker_client::testing::{
    InMemoryCluster,
    KernelArg,
    KernelOutput,
};

use crate::{
    cleaner::{
        Cleaner,
        CleanupEvent,
    },
    smpc::testing::FakeSmpcCluster,
    Controller,
    SmpcSettings,
};

pub const GLOBAL_ADDR: &str = "globalnode.example:5672";
pub const LOCAL1_ADDR: &str = "localnode1.example:5672";
pub const LOCAL2_ADDR: &str = "localnode2.example:5672";

pub fn data_model() -> DataModelId {
    "dementia:0.1".parse().unwrap()
}

fn float_cde(code: &str) -> CommonDataElement {
    CommonDataElement {
        code: code.to_owned(),
        label: code.to_owned(),
        sql_type: DType::Float,
        is_categorical: false,
        enumerations: None,
        min: None,
        max: None,
    }
}

pub fn test_cdes() -> CommonDataElements {
    CommonDataElements::new(btreemap! {
        "x1".to_owned() => float_cde("x1"),
        "x2".to_owned() => float_cde("x2"),
        "y1".to_owned() => float_cde("y1"),
        DATASET_CDE_CODE.to_owned() => CommonDataElement {
            code: DATASET_CDE_CODE.to_owned(),
            label: "Dataset".to_owned(),
            sql_type: DType::Str,
            is_categorical: true,
            enumerations: Some(BTreeMap::new()),
            min: None,
            max: None,
        },
    })
}

/// Rows holding `(x1, y1, x2)` for one dataset.
pub fn worker_rows(dataset: &str, values: &[(f64, f64, f64)]) -> Vec<BTreeMap<String, Value>> {
    values
        .iter()
        .map(|(x1, y1, x2)| {
            btreemap! {
                "dataset".to_owned() => json!(dataset),
                "x1".to_owned() => json!(x1),
                "y1".to_owned() => json!(y1),
                "x2".to_owned() => json!(x2),
            }
        })
        .collect()
}

/// The paired t-test fixture of the happy-path scenario: 100 rows total
/// with `mean(x1 - y1) = 1.0` and a sample standard deviation of the
/// differences of exactly 2.0, so `t = 1.0 / (2.0 / sqrt(100)) = 5.0`.
pub fn ttest_rows() -> (Vec<(f64, f64, f64)>, Vec<(f64, f64, f64)>) {
    let mut worker1 = Vec::new();
    worker1.extend(std::iter::repeat_n((4.0, 0.0, 1.0), 22));
    worker1.extend(std::iter::repeat_n((-2.0, 0.0, 1.0), 22));
    worker1.extend(std::iter::repeat_n((1.0, 0.0, 1.0), 6));
    let worker2 = vec![(1.0, 0.0, 1.0); 50];
    (worker1, worker2)
}

// ---------------------------------------------------------------------------
// Numeric helpers for the native kernels
// ---------------------------------------------------------------------------

fn ln_gamma(x: f64) -> f64 {
    // Lanczos approximation, good to ~1e-10 for x > 0.
    const COEFFS: [f64; 6] = [
        76.18009172947146,
        -86.50532032941677,
        24.01409824083091,
        -1.231739572450155,
        0.1208650973866179e-2,
        -0.5395239384953e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut series = 1.000000000190015;
    for coeff in COEFFS {
        y += 1.0;
        series += coeff / y;
    }
    -tmp + (2.5066282746310005 * series / x).ln()
}

fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 200;
    const EPS: f64 = 3e-14;
    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < f64::MIN_POSITIVE {
        d = f64::MIN_POSITIVE;
    }
    d = 1.0 / d;
    let mut h = d;
    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < f64::MIN_POSITIVE {
            d = f64::MIN_POSITIVE;
        }
        c = 1.0 + aa / c;
        if c.abs() < f64::MIN_POSITIVE {
            c = f64::MIN_POSITIVE;
        }
        d = 1.0 / d;
        h *= d * c;
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < f64::MIN_POSITIVE {
            d = f64::MIN_POSITIVE;
        }
        c = 1.0 + aa / c;
        if c.abs() < f64::MIN_POSITIVE {
            c = f64::MIN_POSITIVE;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_bt = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let bt = ln_bt.exp();
    if x < (a + 1.0) / (a + b + 2.0) {
        bt * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - bt * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// P(T <= t) for Student's t with `df` degrees of freedom.
pub fn students_t_cdf(t: f64, df: f64) -> f64 {
    let x = df / (df + t * t);
    let tail = 0.5 * regularized_incomplete_beta(df / 2.0, 0.5, x);
    if t >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Inverse CDF by bisection; plenty accurate for test assertions.
pub fn students_t_ppf(q: f64, df: f64) -> f64 {
    let (mut lo, mut hi) = (-1e6, 1e6);
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if students_t_cdf(mid, df) < q {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

fn relation_columns(arg: &KernelArg) -> anyhow::Result<(Vec<String>, Vec<Vec<f64>>)> {
    let KernelArg::Relation { schema, rows } = arg else {
        anyhow::bail!("Expected a relation argument");
    };
    let names: Vec<String> = schema
        .columns
        .iter()
        .skip(1) // row_id
        .map(|c| c.name.clone())
        .collect();
    let matrix = rows
        .iter()
        .map(|row| {
            row.iter()
                .skip(1)
                .map(|v| {
                    v.as_f64()
                        .ok_or_else(|| anyhow::anyhow!("Non-numeric cell in relation"))
                })
                .collect::<anyhow::Result<Vec<f64>>>()
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok((names, matrix))
}

fn single_column(arg: &KernelArg) -> anyhow::Result<Vec<f64>> {
    let (_, matrix) = relation_columns(arg)?;
    matrix
        .into_iter()
        .map(|row| {
            row.first()
                .copied()
                .ok_or_else(|| anyhow::anyhow!("Relation has no value column"))
        })
        .collect()
}

fn literal_f64(arg: &KernelArg) -> anyhow::Result<f64> {
    let KernelArg::Literal(value) = arg else {
        anyhow::bail!("Expected a literal argument");
    };
    value
        .as_f64()
        .ok_or_else(|| anyhow::anyhow!("Literal is not numeric"))
}

fn secure_value(arg: &KernelArg) -> anyhow::Result<&Value> {
    let KernelArg::SecureTransfer(value) = arg else {
        anyhow::bail!("Expected a secure-transfer argument");
    };
    Ok(value)
}

fn get<'a>(args: &'a BTreeMap<String, KernelArg>, name: &str) -> anyhow::Result<&'a KernelArg> {
    args.get(name)
        .ok_or_else(|| anyhow::anyhow!("Kernel argument {name} missing"))
}

fn f64s(value: &Value) -> Vec<f64> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_f64()).collect())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Native kernels for the shipped algorithms
// ---------------------------------------------------------------------------

fn register_ttest_kernels(cluster: &InMemoryCluster) {
    cluster.register_kernel("paired_ttest_local", |args| {
        let x1 = single_column(get(args, "x")?)?;
        let x2 = single_column(get(args, "y")?)?;
        let n_obs = x1.len() as i64;
        let x1_sum: f64 = x1.iter().sum();
        let x2_sum: f64 = x2.iter().sum();
        let diff: f64 = x1.iter().zip(&x2).map(|(a, b)| a - b).sum();
        let diff_sqrd: f64 = x1.iter().zip(&x2).map(|(a, b)| (a - b) * (a - b)).sum();
        let x1_sqrd_sum: f64 = x1.iter().map(|a| a * a).sum();
        let x2_sqrd_sum: f64 = x2.iter().map(|a| a * a).sum();
        Ok(vec![KernelOutput::SecureTransfer(json!({
            "n_obs": {"data": n_obs, "operation": "sum", "type": "int"},
            "sum_x1": {"data": x1_sum, "operation": "sum", "type": "float"},
            "sum_x2": {"data": x2_sum, "operation": "sum", "type": "float"},
            "diff": {"data": diff, "operation": "sum", "type": "float"},
            "diff_sqrd": {"data": diff_sqrd, "operation": "sum", "type": "float"},
            "x1_sqrd_sum": {"data": x1_sqrd_sum, "operation": "sum", "type": "float"},
            "x2_sqrd_sum": {"data": x2_sqrd_sum, "operation": "sum", "type": "float"},
        }))])
    });

    cluster.register_kernel("paired_ttest_global", |args| {
        let sec = secure_value(get(args, "sec_local_transfer")?)?;
        let alpha = literal_f64(get(args, "alpha")?)?;
        let KernelArg::Literal(alternative) = get(args, "alternative")? else {
            anyhow::bail!("alternative must be a literal");
        };
        let alternative = alternative.as_str().unwrap_or("two-sided").to_owned();

        let n_obs = sec["n_obs"].as_f64().unwrap_or(0.0);
        let sum_x1 = sec["sum_x1"].as_f64().unwrap_or(0.0);
        let sum_x2 = sec["sum_x2"].as_f64().unwrap_or(0.0);
        let diff_sum = sec["diff"].as_f64().unwrap_or(0.0);
        let diff_sqrd_sum = sec["diff_sqrd"].as_f64().unwrap_or(0.0);
        let x1_sqrd_sum = sec["x1_sqrd_sum"].as_f64().unwrap_or(0.0);
        let x2_sqrd_sum = sec["x2_sqrd_sum"].as_f64().unwrap_or(0.0);

        let mean_x1 = sum_x1 / n_obs;
        let mean_x2 = sum_x2 / n_obs;
        let devel_x1 = x1_sqrd_sum - 2.0 * mean_x1 * sum_x1 + mean_x1 * mean_x1 * n_obs;
        let devel_x2 = x2_sqrd_sum - 2.0 * sum_x2 * mean_x2 + mean_x2 * mean_x2 * n_obs;
        let sd_x1 = (devel_x1 / (n_obs - 1.0)).sqrt();
        let sd_x2 = (devel_x2 / (n_obs - 1.0)).sqrt();
        let sd = ((diff_sqrd_sum - diff_sum * diff_sum / n_obs) / (n_obs - 1.0)).sqrt();
        let sed = sd / n_obs.sqrt();
        let t_stat = (mean_x1 - mean_x2) / sed;
        let df = n_obs - 1.0;
        let sample_mean = diff_sum / n_obs;
        let t_quantile = students_t_ppf(1.0 - alpha / 2.0, df);
        let mut ci_lower = json!(sample_mean - t_quantile * sed);
        let mut ci_upper = json!(sample_mean + t_quantile * sed);
        let p = match alternative.as_str() {
            "greater" => {
                ci_upper = json!("Infinity");
                1.0 - students_t_cdf(t_stat, df)
            },
            "less" => {
                ci_lower = json!("-Infinity");
                1.0 - students_t_cdf(-t_stat, df)
            },
            _ => (1.0 - students_t_cdf(t_stat.abs(), df)) * 2.0,
        };
        let cohens_d = (mean_x1 - mean_x2) / ((sd_x1 * sd_x1 + sd_x2 * sd_x2) / 2.0).sqrt();
        Ok(vec![KernelOutput::Transfer(json!({
            "t_stat": t_stat,
            "df": df,
            "p": p,
            "mean_diff": diff_sum / n_obs,
            "se_diff": sed,
            "ci_upper": ci_upper,
            "ci_lower": ci_lower,
            "cohens_d": cohens_d,
        }))])
    });
}

fn register_pca_kernels(cluster: &InMemoryCluster) {
    cluster.register_kernel("pca_local_data_processing", |args| {
        let KernelArg::Relation { schema, rows } = get(args, "data")? else {
            anyhow::bail!("data must be a relation");
        };
        let KernelArg::Literal(transformations) = get(args, "data_transformation_dict")? else {
            anyhow::bail!("data_transformation_dict must be a literal");
        };
        let mut rows = rows.clone();
        let transformations: BTreeMap<String, Vec<String>> =
            serde_json::from_value(transformations.clone())?;
        for (transformation, variables) in &transformations {
            for variable in variables {
                let idx = schema
                    .columns
                    .iter()
                    .position(|c| c.name == *variable)
                    .ok_or_else(|| anyhow::anyhow!("No column {variable}"))?;
                let values: Vec<f64> = rows
                    .iter()
                    .map(|row| row[idx].as_f64().unwrap_or(f64::NAN))
                    .collect();
                let transformed: Vec<f64> = match transformation.as_str() {
                    "log" => {
                        if values.iter().any(|v| *v <= 0.0) {
                            return Err(ErrorMetadata::bad_user_input(
                                "WorkerUserError",
                                format!(
                                    "Log transformation cannot be applied to non-positive \
                                     values in column '{variable}'."
                                ),
                            )
                            .into());
                        }
                        values.iter().map(|v| v.ln()).collect()
                    },
                    "exp" => values.iter().map(|v| v.exp()).collect(),
                    "center" => {
                        let mean = values.iter().sum::<f64>() / values.len() as f64;
                        values.iter().map(|v| v - mean).collect()
                    },
                    "standardize" => {
                        let n = values.len() as f64;
                        let mean = values.iter().sum::<f64>() / n;
                        let std = (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
                            / n)
                            .sqrt();
                        if std == 0.0 {
                            return Err(ErrorMetadata::bad_user_input(
                                "WorkerUserError",
                                format!(
                                    "Standardization cannot be applied to column '{variable}' \
                                     because the standard deviation is zero."
                                ),
                            )
                            .into());
                        }
                        values.iter().map(|v| (v - mean) / std).collect()
                    },
                    other => {
                        return Err(ErrorMetadata::bad_user_input(
                            "WorkerUserError",
                            format!("Unknown transformation: {other}"),
                        )
                        .into());
                    },
                };
                for (row, value) in rows.iter_mut().zip(transformed) {
                    row[idx] = json!(value);
                }
            }
        }
        Ok(vec![KernelOutput::Relation {
            schema: schema.clone(),
            rows,
        }])
    });

    cluster.register_kernel("pca_local1", |args| {
        let (_, matrix) = relation_columns(get(args, "x")?)?;
        let n_obs = matrix.len() as i64;
        let p = matrix.first().map(|r| r.len()).unwrap_or(0);
        let mut sx = vec![0.0; p];
        let mut sxx = vec![0.0; p];
        for row in &matrix {
            for (j, v) in row.iter().enumerate() {
                sx[j] += v;
                sxx[j] += v * v;
            }
        }
        Ok(vec![KernelOutput::SecureTransfer(json!({
            "n_obs": {"data": n_obs, "operation": "sum", "type": "int"},
            "sx": {"data": sx, "operation": "sum", "type": "float"},
            "sxx": {"data": sxx, "operation": "sum", "type": "float"},
        }))])
    });

    cluster.register_kernel("pca_global1", |args| {
        let sec = secure_value(get(args, "local_transfers")?)?;
        let n_obs = sec["n_obs"].as_f64().unwrap_or(0.0);
        let sx = f64s(&sec["sx"]);
        let sxx = f64s(&sec["sxx"]);
        let means: Vec<f64> = sx.iter().map(|s| s / n_obs).collect();
        let sigmas: Vec<f64> = sxx
            .iter()
            .zip(&means)
            .map(|(sxx, mean)| ((sxx - n_obs * mean * mean) / (n_obs - 1.0)).sqrt())
            .collect();
        Ok(vec![
            KernelOutput::State(json!({"n_obs": n_obs})),
            KernelOutput::Transfer(json!({"means": means, "sigmas": sigmas})),
        ])
    });

    cluster.register_kernel("pca_local2", |args| {
        let (_, matrix) = relation_columns(get(args, "x")?)?;
        let KernelArg::Transfers(transfers) = get(args, "global_transfer")? else {
            anyhow::bail!("global_transfer must be a transfer");
        };
        let transfer = transfers
            .first()
            .ok_or_else(|| anyhow::anyhow!("global_transfer is empty"))?;
        let means = f64s(&transfer["means"]);
        let sigmas = f64s(&transfer["sigmas"]);
        let p = means.len();
        let mut gramian = vec![vec![0.0; p]; p];
        for row in &matrix {
            let standardized: Vec<f64> = row
                .iter()
                .enumerate()
                .map(|(j, v)| (v - means[j]) / sigmas[j])
                .collect();
            for i in 0..p {
                for j in 0..p {
                    gramian[i][j] += standardized[i] * standardized[j];
                }
            }
        }
        Ok(vec![KernelOutput::SecureTransfer(json!({
            "gramian": {"data": gramian, "operation": "sum", "type": "float"},
        }))])
    });

    cluster.register_kernel("pca_global2", |args| {
        let sec = secure_value(get(args, "local_transfers")?)?;
        let KernelArg::State(state) = get(args, "prev_state")? else {
            anyhow::bail!("prev_state must be a state");
        };
        let n_obs = state["n_obs"].as_f64().unwrap_or(0.0);
        let gramian: Vec<Vec<f64>> = sec["gramian"]
            .as_array()
            .map(|rows| rows.iter().map(f64s).collect())
            .unwrap_or_default();
        anyhow::ensure!(gramian.len() == 2, "The test kernel handles two variables");
        let cov: Vec<Vec<f64>> = gramian
            .iter()
            .map(|row| row.iter().map(|v| v / (n_obs - 1.0)).collect())
            .collect();
        // Closed-form eigen decomposition of a symmetric 2x2 matrix.
        let (a, b, c) = (cov[0][0], cov[0][1], cov[1][1]);
        let mean = (a + c) / 2.0;
        let delta = (((a - c) / 2.0).powi(2) + b * b).sqrt();
        let eigenvalues = [mean + delta, mean - delta];
        let eigenvectors = if b.abs() < 1e-12 {
            vec![vec![1.0, 0.0], vec![0.0, 1.0]]
        } else {
            let v1 = [eigenvalues[0] - c, b];
            let v2 = [eigenvalues[1] - c, b];
            let norm1 = (v1[0] * v1[0] + v1[1] * v1[1]).sqrt();
            let norm2 = (v2[0] * v2[0] + v2[1] * v2[1]).sqrt();
            vec![
                vec![v1[0] / norm1, v1[1] / norm1],
                vec![v2[0] / norm2, v2[1] / norm2],
            ]
        };
        Ok(vec![KernelOutput::Transfer(json!({
            "n_obs": n_obs,
            "eigenvalues": eigenvalues,
            "eigenvectors": eigenvectors,
        }))])
    });
}

/// Extra UDFs for plan-level tests that do not belong to any shipped
/// algorithm.
fn register_plan_test_udfs(udfs: &mut udfgen::UdfRegistry) -> anyhow::Result<()> {
    udfs.register(
        UdfDefinition::builder("test_local_noop")
            .parameter("x", relation(schema_var("S1")))
            .output(transfer_out())
            .body("result = {'num': 1}")
            .returns(["result"])
            .build()?,
    )?;
    udfs.register(
        UdfDefinition::builder("test_global_consume")
            .parameter("t", transfer())
            .output(transfer_out())
            .body("result = t")
            .returns(["result"])
            .build()?,
    )?;
    Ok(())
}

fn register_plan_test_kernels(cluster: &InMemoryCluster) {
    cluster.register_kernel("test_local_noop", |_args| {
        Ok(vec![KernelOutput::Transfer(json!({"num": 1}))])
    });
    cluster.register_kernel("test_global_consume", |args| {
        let KernelArg::Transfers(transfers) = get(args, "t")? else {
            anyhow::bail!("t must be a transfer");
        };
        Ok(vec![KernelOutput::Transfer(
            transfers.first().cloned().unwrap_or(json!(null)),
        )])
    });
}

pub struct TestFederation {
    pub cluster: Arc<InMemoryCluster>,
    pub aggregator: Arc<LandscapeAggregator>,
    pub controller: Controller,
    pub cleaner: Arc<Cleaner>,
    pub events: mpsc::UnboundedReceiver<CleanupEvent>,
}

impl TestFederation {
    /// Three workers (one global, two locals holding `ds1` and `ds2`),
    /// every shipped kernel registered and the UDF contract enforced.
    pub async fn new(
        smpc_settings: SmpcSettings,
        rows1: Vec<BTreeMap<String, Value>>,
        rows2: Vec<BTreeMap<String, Value>>,
    ) -> Self {
        common::env::config_test();
        let cluster = InMemoryCluster::new();
        cluster.add_worker(GLOBAL_ADDR, "globalnode", NodeRole::Global);
        cluster.add_worker(LOCAL1_ADDR, "localnode1", NodeRole::Local);
        cluster.add_worker(LOCAL2_ADDR, "localnode2", NodeRole::Local);
        cluster.load_data_model(
            LOCAL1_ADDR,
            &data_model(),
            test_cdes(),
            btreemap! {"ds1".to_owned() => "Dataset one".to_owned()},
            rows1,
        );
        cluster.load_data_model(
            LOCAL2_ADDR,
            &data_model(),
            test_cdes(),
            btreemap! {"ds2".to_owned() => "Dataset two".to_owned()},
            rows2,
        );

        let (algorithms, mut udfs) = default_registries().expect("registries build");
        register_plan_test_udfs(&mut udfs).expect("test udfs register");
        cluster.set_udf_registry(Arc::new(udfs));
        register_ttest_kernels(&cluster);
        register_pca_kernels(&cluster);
        register_plan_test_kernels(&cluster);

        let channel: Arc<dyn worker_client::TaskChannel> = cluster.clone();
        let aggregator = Arc::new(LandscapeAggregator::new(
            channel.clone(),
            vec![
                GLOBAL_ADDR.to_owned(),
                LOCAL1_ADDR.to_owned(),
                LOCAL2_ADDR.to_owned(),
            ],
        ));
        aggregator.update_once().await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cleaner = Cleaner::new(channel.clone(), Duration::ZERO);
        let smpc = Arc::new(FakeSmpcCluster::new(channel.clone()));
        let controller = Controller::new(
            channel,
            aggregator.clone(),
            smpc,
            smpc_settings,
            algorithms,
            events_tx,
        );
        Self {
            cluster,
            aggregator,
            controller,
            cleaner,
            events: events_rx,
        }
    }

    pub async fn for_ttest(smpc_settings: SmpcSettings) -> Self {
        let (rows1, rows2) = ttest_rows();
        Self::new(
            smpc_settings,
            worker_rows("ds1", &rows1),
            worker_rows("ds2", &rows2),
        )
        .await
    }

    /// Feed every pending executor event to the cleaner.
    pub fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.cleaner.apply_event(event);
        }
    }

    pub async fn sweep(&mut self) {
        self.drain_events();
        self.cleaner.sweep_once().await;
    }

    pub fn smpc_off() -> SmpcSettings {
        SmpcSettings {
            enabled: false,
            optional: false,
        }
    }

    pub fn smpc_on() -> SmpcSettings {
        SmpcSettings {
            enabled: true,
            optional: false,
        }
    }
}
