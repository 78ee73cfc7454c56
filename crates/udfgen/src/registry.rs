use std::{
    collections::BTreeMap,
    sync::Arc,
};

use errors::ErrorMetadata;

use crate::iotypes::{
    InputType,
    OutputType,
};

/// The static definition of one step function: its declarative signature
/// and the database-side body the generated artifact wraps.
///
/// Built once at algorithm-load time and looked up by name for every call.
#[derive(Clone, Debug)]
pub struct UdfDefinition {
    pub name: String,
    /// Declared parameters, in call order.
    pub parameters: Vec<(String, InputType)>,
    /// Declared outputs. The first is returned by the database call; the
    /// rest are written through loopback inserts.
    pub output_types: Vec<OutputType>,
    /// The function body in the store's embedded language, referencing the
    /// parameter names. Must not contain the return statement.
    pub body: String,
    /// The body variable holding each output, main output first.
    pub return_names: Vec<String>,
}

impl UdfDefinition {
    pub fn builder(name: impl Into<String>) -> UdfDefinitionBuilder {
        UdfDefinitionBuilder {
            name: name.into(),
            parameters: Vec::new(),
            output_types: Vec::new(),
            body: String::new(),
            return_names: Vec::new(),
        }
    }

    /// Parameters the algorithm flow must supply values for (everything
    /// except loggers and placeholders).
    pub fn supplied_parameters(&self) -> impl Iterator<Item = &(String, InputType)> {
        self.parameters
            .iter()
            .filter(|(_, ptype)| ptype.is_supplied_by_caller())
    }
}

pub struct UdfDefinitionBuilder {
    name: String,
    parameters: Vec<(String, InputType)>,
    output_types: Vec<OutputType>,
    body: String,
    return_names: Vec<String>,
}

impl UdfDefinitionBuilder {
    pub fn parameter(mut self, name: impl Into<String>, ptype: InputType) -> Self {
        self.parameters.push((name.into(), ptype));
        self
    }

    pub fn output(mut self, otype: OutputType) -> Self {
        self.output_types.push(otype);
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn returns<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.return_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> anyhow::Result<UdfDefinition> {
        let def = UdfDefinition {
            name: self.name,
            parameters: self.parameters,
            output_types: self.output_types,
            body: self.body,
            return_names: self.return_names,
        };
        validate(&def)?;
        Ok(def)
    }
}

fn validate(def: &UdfDefinition) -> anyhow::Result<()> {
    let violation = |msg: String| -> anyhow::Error {
        ErrorMetadata::udf_contract_violation("UdfBadDefinition", msg).into()
    };
    if def.output_types.is_empty() {
        return Err(violation(format!("Udf {} declares no outputs", def.name)));
    }
    if def.return_names.len() != def.output_types.len() {
        return Err(violation(format!(
            "Udf {} declares {} outputs but {} return names",
            def.name,
            def.output_types.len(),
            def.return_names.len()
        )));
    }
    let loggers = def
        .parameters
        .iter()
        .filter(|(_, p)| matches!(p, InputType::Logger))
        .count();
    if loggers > 1 {
        return Err(violation(format!(
            "Udf {} declares more than one logger parameter",
            def.name
        )));
    }
    let has_relation = def
        .parameters
        .iter()
        .any(|(_, p)| matches!(p, InputType::Relation { .. }));
    let has_tensor = def.parameters.iter().any(|(_, p)| {
        matches!(
            p,
            InputType::Tensor { .. } | InputType::MergeTensor { .. }
        )
    });
    if has_relation && has_tensor {
        return Err(violation(format!(
            "Udf {} cannot declare both relation and tensor parameters",
            def.name
        )));
    }
    for (i, otype) in def.output_types.iter().enumerate().skip(1) {
        if matches!(
            otype,
            OutputType::Relation { .. } | OutputType::Tensor { .. }
        ) {
            return Err(violation(format!(
                "Udf {}: output {i} is tabular; only the first output can be",
                def.name
            )));
        }
    }
    Ok(())
}

/// Step functions looked up by the executor and the worker's UDF task. An
/// explicit owned value built at startup; shared as an `Arc`.
#[derive(Clone, Default)]
pub struct UdfRegistry {
    udfs: BTreeMap<String, Arc<UdfDefinition>>,
}

impl UdfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: UdfDefinition) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.udfs.contains_key(&def.name),
            "Udf {} is already registered",
            def.name
        );
        self.udfs.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    pub fn get(&self, name: &str) -> anyhow::Result<&Arc<UdfDefinition>> {
        self.udfs.get(name).ok_or_else(|| {
            ErrorMetadata::udf_contract_violation(
                "UnknownUdf",
                format!("No udf named {name} is registered"),
            )
            .into()
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.udfs.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use crate::iotypes::*;

    use super::*;

    #[test]
    fn test_builder_validates_return_names() {
        let result = UdfDefinition::builder("f")
            .parameter("t", literal())
            .output(transfer_out())
            .output(state_out())
            .body("result = {}")
            .returns(["result"])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_mixed_table_kinds() {
        let result = UdfDefinition::builder("f")
            .parameter("r", relation(schema_var("S")))
            .parameter("t", tensor(dtype_var("T"), 2))
            .output(transfer_out())
            .body("result = {}")
            .returns(["result"])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_secondary_table_output() {
        let result = UdfDefinition::builder("f")
            .parameter("t", literal())
            .output(transfer_out())
            .output(tensor_out(known_dtype(common::DType::Float), 2))
            .body("result = {}")
            .returns(["a", "b"])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = UdfRegistry::new();
        registry
            .register(
                UdfDefinition::builder("f")
                    .parameter("t", literal())
                    .output(transfer_out())
                    .body("result = {'num': t}")
                    .returns(["result"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        assert!(registry.get("f").is_ok());
        assert!(registry.get("g").is_err());
    }
}
