use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

use crate::dtype::DType;

/// The common data element whose enumerations are the datasets of a data
/// model. It is the one element allowed to differ across workers.
pub const DATASET_CDE_CODE: &str = "dataset";

/// A versioned schema identifier, written `name:version`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataModelId {
    pub name: String,
    pub version: String,
}

impl DataModelId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for DataModelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

impl FromStr for DataModelId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (name, version) = s
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("Data model {s} is not of the form name:version"))?;
        anyhow::ensure!(
            !name.is_empty() && !version.is_empty(),
            "Data model {s} is not of the form name:version"
        );
        Ok(Self::new(name, version))
    }
}

impl TryFrom<String> for DataModelId {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        s.parse()
    }
}

impl From<DataModelId> for String {
    fn from(id: DataModelId) -> String {
        id.to_string()
    }
}

/// One common data element of a data model: a named, typed column together
/// with its categorical enumerations or numeric bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommonDataElement {
    pub code: String,
    pub label: String,
    pub sql_type: DType,
    pub is_categorical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumerations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl CommonDataElement {
    fn without_enumerations(&self) -> Self {
        Self {
            enumerations: None,
            ..self.clone()
        }
    }
}

/// The full CDE map of one data model as advertised by one worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommonDataElements {
    pub values: BTreeMap<String, CommonDataElement>,
}

impl CommonDataElements {
    pub fn new(values: BTreeMap<String, CommonDataElement>) -> Self {
        Self { values }
    }

    pub fn get(&self, code: &str) -> Option<&CommonDataElement> {
        self.values.get(code)
    }

    /// Two workers' definitions of a data model are compatible iff every
    /// element is identical, except that the `dataset` element may differ
    /// in its enumerations (those are unioned during aggregation).
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        if self.values.len() != other.values.len() {
            return false;
        }
        self.values.iter().all(|(code, cde)| {
            let Some(other_cde) = other.values.get(code) else {
                return false;
            };
            if code == DATASET_CDE_CODE {
                cde.without_enumerations() == other_cde.without_enumerations()
            } else {
                cde == other_cde
            }
        })
    }

    /// Replace the `dataset` element's enumerations with the federation-wide
    /// union computed by the aggregator.
    pub fn with_dataset_enumerations(mut self, enumerations: BTreeMap<String, String>) -> Self {
        if let Some(dataset_cde) = self.values.get_mut(DATASET_CDE_CODE) {
            dataset_cde.enumerations = Some(enumerations);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    pub fn cde(code: &str, sql_type: DType) -> CommonDataElement {
        CommonDataElement {
            code: code.to_owned(),
            label: code.to_owned(),
            sql_type,
            is_categorical: false,
            enumerations: None,
            min: None,
            max: None,
        }
    }

    fn dataset_cde(enums: BTreeMap<String, String>) -> CommonDataElement {
        CommonDataElement {
            code: DATASET_CDE_CODE.to_owned(),
            label: "Dataset".to_owned(),
            sql_type: DType::Str,
            is_categorical: true,
            enumerations: Some(enums),
            min: None,
            max: None,
        }
    }

    #[test]
    fn test_data_model_id_roundtrip() {
        let id: DataModelId = "dementia:0.1".parse().unwrap();
        assert_eq!(id, DataModelId::new("dementia", "0.1"));
        assert_eq!(id.to_string(), "dementia:0.1");
        assert!("dementia".parse::<DataModelId>().is_err());
        assert!(":0.1".parse::<DataModelId>().is_err());
    }

    #[test]
    fn test_compatibility_ignores_dataset_enumerations() {
        let a = CommonDataElements::new(btreemap! {
            "age".to_owned() => cde("age", DType::Int),
            DATASET_CDE_CODE.to_owned() =>
                dataset_cde(btreemap! {"ds1".to_owned() => "DS 1".to_owned()}),
        });
        let b = CommonDataElements::new(btreemap! {
            "age".to_owned() => cde("age", DType::Int),
            DATASET_CDE_CODE.to_owned() =>
                dataset_cde(btreemap! {"ds2".to_owned() => "DS 2".to_owned()}),
        });
        assert!(a.is_compatible_with(&b));
    }

    #[test]
    fn test_compatibility_rejects_differing_sql_type() {
        let a = CommonDataElements::new(btreemap! {
            "age".to_owned() => cde("age", DType::Int),
        });
        let b = CommonDataElements::new(btreemap! {
            "age".to_owned() => cde("age", DType::Float),
        });
        assert!(!a.is_compatible_with(&b));
    }

    #[test]
    fn test_compatibility_rejects_missing_cde() {
        let a = CommonDataElements::new(btreemap! {
            "age".to_owned() => cde("age", DType::Int),
            "bmi".to_owned() => cde("bmi", DType::Float),
        });
        let b = CommonDataElements::new(btreemap! {
            "age".to_owned() => cde("age", DType::Int),
        });
        assert!(!a.is_compatible_with(&b));
        assert!(!b.is_compatible_with(&a));
    }
}
