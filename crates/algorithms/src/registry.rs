use std::{
    collections::BTreeMap,
    sync::Arc,
};

use errors::ErrorMetadata;
use serde::Serialize;

use crate::plan::{
    AlgorithmInput,
    AlgorithmPlan,
};

/// Catalog entry describing one algorithm to clients.
#[derive(Clone, Debug, Serialize)]
pub struct ParameterSpec {
    pub name: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enums: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub notblank: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct AlgorithmSpecification {
    pub name: String,
    pub label: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

type PlanBuilder = Arc<dyn Fn(&AlgorithmInput) -> anyhow::Result<AlgorithmPlan> + Send + Sync>;

#[derive(Clone)]
pub struct AlgorithmDef {
    pub specification: AlgorithmSpecification,
    pub build_plan: PlanBuilder,
}

/// The algorithms this controller can run. An explicit owned value built
/// at startup together with the UDF registry the plans reference.
#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    algorithms: BTreeMap<String, AlgorithmDef>,
}

impl AlgorithmRegistry {
    pub fn register(&mut self, def: AlgorithmDef) -> anyhow::Result<()> {
        let name = def.specification.name.clone();
        anyhow::ensure!(
            self.algorithms.insert(name.clone(), def).is_none(),
            "Algorithm {name} is already registered",
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> anyhow::Result<&AlgorithmDef> {
        self.algorithms.get(name).ok_or_else(|| {
            ErrorMetadata::bad_request(
                "UnknownAlgorithm",
                format!("No algorithm named {name} is available"),
            )
            .into()
        })
    }

    pub fn specifications(&self) -> Vec<&AlgorithmSpecification> {
        self.algorithms.values().map(|a| &a.specification).collect()
    }
}

/// Build the production registries: every shipped algorithm plus the UDFs
/// its steps reference.
pub fn default_registries() -> anyhow::Result<(AlgorithmRegistry, udfgen::UdfRegistry)> {
    let mut algorithms = AlgorithmRegistry::default();
    let mut udfs = udfgen::UdfRegistry::new();
    crate::paired_ttest::register(&mut algorithms, &mut udfs)?;
    crate::pca::register(&mut algorithms, &mut udfs)?;
    Ok((algorithms, udfs))
}
