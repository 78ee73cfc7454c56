//! Paired t-test.
//!
//! Each local worker reduces its paired columns to secure sums; the global
//! worker turns the federation-wide sums into the t statistic, p-value,
//! confidence interval and effect size.

use std::sync::Arc;

use errors::ErrorMetadata;
use serde_json::json;
use udfgen::{
    literal,
    relation,
    schema_var,
    secure_transfer,
    secure_transfer_out,
    transfer_out,
    UdfDefinition,
    UdfRegistry,
};

use crate::{
    plan::{
        get_transfer_data,
        AlgorithmInput,
        AlgorithmPlan,
        Step,
        StepInput,
        StepTarget,
    },
    registry::{
        AlgorithmDef,
        AlgorithmRegistry,
        AlgorithmSpecification,
        ParameterSpec,
    },
};

pub const ALGORITHM_NAME: &str = "paired_ttest";
const LOCAL_UDF: &str = "paired_ttest_local";
const GLOBAL_UDF: &str = "paired_ttest_global";

const ALTERNATIVES: [&str; 3] = ["two-sided", "less", "greater"];

pub fn register(
    algorithms: &mut AlgorithmRegistry,
    udfs: &mut UdfRegistry,
) -> anyhow::Result<()> {
    udfs.register(
        UdfDefinition::builder(LOCAL_UDF)
            .parameter("x", relation(schema_var("S1")))
            .parameter("y", relation(schema_var("S2")))
            .output(secure_transfer_out(true, false, false))
            .body(
                r#"x1 = x.reset_index(drop=True).to_numpy().squeeze()
x2 = y.reset_index(drop=True).to_numpy().squeeze()
x1_sum = sum(x1)
x2_sum = sum(x2)
n_obs = len(x)
diff = sum(x1 - x2)
diff_sqrd = sum((x1 - x2) ** 2)
x1_sqrd_sum = sum(x1 ** 2)
x2_sqrd_sum = sum(x2 ** 2)
sec_transfer_ = {
    'n_obs': {'data': n_obs, 'operation': 'sum', 'type': 'int'},
    'sum_x1': {'data': x1_sum.item(), 'operation': 'sum', 'type': 'float'},
    'sum_x2': {'data': x2_sum.item(), 'operation': 'sum', 'type': 'float'},
    'diff': {'data': diff.tolist(), 'operation': 'sum', 'type': 'float'},
    'diff_sqrd': {'data': diff_sqrd.tolist(), 'operation': 'sum', 'type': 'float'},
    'x1_sqrd_sum': {'data': x1_sqrd_sum.tolist(), 'operation': 'sum', 'type': 'float'},
    'x2_sqrd_sum': {'data': x2_sqrd_sum.tolist(), 'operation': 'sum', 'type': 'float'},
}"#,
            )
            .returns(["sec_transfer_"])
            .build()?,
    )?;

    udfs.register(
        UdfDefinition::builder(GLOBAL_UDF)
            .parameter("sec_local_transfer", secure_transfer(true, false, false))
            .parameter("alpha", literal())
            .parameter("alternative", literal())
            .output(transfer_out())
            .body(
                r#"from scipy.stats import t
n_obs = sec_local_transfer['n_obs']
sum_x1 = sec_local_transfer['sum_x1']
sum_x2 = sec_local_transfer['sum_x2']
diff_sum = sec_local_transfer['diff']
diff_sqrd_sum = sec_local_transfer['diff_sqrd']
x1_sqrd_sum = sec_local_transfer['x1_sqrd_sum']
x2_sqrd_sum = sec_local_transfer['x2_sqrd_sum']
mean_x1 = sum_x1 / n_obs
mean_x2 = sum_x2 / n_obs
devel_x1 = x1_sqrd_sum - 2 * mean_x1 * sum_x1 + (mean_x1 ** 2) * n_obs
devel_x2 = x2_sqrd_sum - 2 * sum_x2 * mean_x2 + (mean_x2 ** 2) * n_obs
sd_x1 = numpy.sqrt(devel_x1 / (n_obs - 1))
sd_x2 = numpy.sqrt(devel_x2 / (n_obs - 1))
sd = numpy.sqrt((diff_sqrd_sum - (diff_sum ** 2 / n_obs)) / (n_obs - 1))
sed = sd / numpy.sqrt(n_obs)
t_stat = (mean_x1 - mean_x2) / sed
df = n_obs - 1
sample_mean = diff_sum / n_obs
ci_lower, ci_upper = t.interval(alpha=1 - alpha, df=df, loc=sample_mean, scale=sed)
if alternative == 'greater':
    p = 1.0 - t.cdf(t_stat, df)
    ci_upper = 'Infinity'
elif alternative == 'less':
    p = 1.0 - t.cdf(-t_stat, df)
    ci_lower = '-Infinity'
else:
    p = (1.0 - t.cdf(abs(t_stat), df)) * 2.0
cohens_d = (mean_x1 - mean_x2) / numpy.sqrt((sd_x1 ** 2 + sd_x2 ** 2) / 2)
transfer_ = {
    't_stat': t_stat,
    'df': df,
    'p': p,
    'mean_diff': diff_sum / n_obs,
    'se_diff': sed,
    'ci_upper': ci_upper,
    'ci_lower': ci_lower,
    'cohens_d': cohens_d,
}"#,
            )
            .returns(["transfer_"])
            .build()?,
    )?;

    algorithms.register(AlgorithmDef {
        specification: AlgorithmSpecification {
            name: ALGORITHM_NAME.to_owned(),
            label: "Paired t-test".to_owned(),
            description: "Paired samples t-test on two matched numerical variables".to_owned(),
            parameters: vec![
                ParameterSpec {
                    name: "alpha".to_owned(),
                    label: "Significance level".to_owned(),
                    enums: None,
                    min: Some(0.0),
                    max: Some(1.0),
                    notblank: true,
                },
                ParameterSpec {
                    name: "alt_hypothesis".to_owned(),
                    label: "Alternative hypothesis".to_owned(),
                    enums: Some(ALTERNATIVES.iter().map(|s| s.to_string()).collect()),
                    min: None,
                    max: None,
                    notblank: true,
                },
            ],
        },
        build_plan: Arc::new(build_plan),
    })
}

fn build_plan(input: &AlgorithmInput) -> anyhow::Result<AlgorithmPlan> {
    if input.x.is_empty() {
        return Err(user_error("x variables are required").into());
    }
    if input.y.is_empty() {
        return Err(user_error("y variables are required").into());
    }

    let alpha = input
        .parameters
        .get("alpha")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| user_error("The alpha parameter is required"))?;
    if !(0.0..=1.0).contains(&alpha) {
        return Err(user_error("The alpha parameter must be between 0 and 1").into());
    }
    let alternative = input
        .parameters
        .get("alt_hypothesis")
        .and_then(|v| v.as_str())
        .unwrap_or("two-sided")
        .to_owned();
    if !ALTERNATIVES.contains(&alternative.as_str()) {
        return Err(user_error(format!(
            "The alt_hypothesis parameter must be one of {ALTERNATIVES:?}"
        ))
        .into());
    }

    let steps = vec![
        Step {
            func_name: LOCAL_UDF.to_owned(),
            target: StepTarget::LocalWorkers,
            keyword_args: vec![
                ("x".to_owned(), StepInput::DataView { group: 0 }),
                ("y".to_owned(), StepInput::DataView { group: 1 }),
            ],
            share_outputs: vec![true],
            output_schema: None,
        },
        Step {
            func_name: GLOBAL_UDF.to_owned(),
            target: StepTarget::GlobalWorker,
            keyword_args: vec![
                (
                    "sec_local_transfer".to_owned(),
                    StepInput::Previous { step: 0, output: 0 },
                ),
                ("alpha".to_owned(), StepInput::Literal(json!(alpha))),
                ("alternative".to_owned(), StepInput::Literal(json!(alternative))),
            ],
            share_outputs: vec![false],
            output_schema: None,
        },
    ];

    Ok(AlgorithmPlan {
        variable_groups: vec![input.x.clone(), input.y.clone()],
        dropna: true,
        check_min_rows: true,
        steps,
        result: Arc::new(|table_data| get_transfer_data(table_data)),
    })
}

fn user_error(msg: impl Into<std::borrow::Cow<'static, str>>) -> ErrorMetadata {
    ErrorMetadata::bad_user_input("InvalidAlgorithmParameters", msg)
}
