use std::collections::BTreeMap;

use async_trait::async_trait;
use common::{
    CommonDataElements,
    DataModelId,
};

/// The data-model metadata this worker advertises: which data models are
/// loaded, which datasets each one holds (`code -> label`), and the CDE
/// definitions. Backed by the store's metadata schema, which is an
/// external collaborator.
#[async_trait]
pub trait CatalogSource: Send + Sync + 'static {
    async fn datasets_per_data_model(
        &self,
    ) -> anyhow::Result<BTreeMap<DataModelId, BTreeMap<String, String>>>;

    async fn data_model_cdes(&self, data_model: &DataModelId)
        -> anyhow::Result<CommonDataElements>;

    /// The fully qualified name of the primary data table of a data model.
    fn primary_data_table(&self, data_model: &DataModelId) -> String {
        format!("\"{data_model}\".\"primary_data\"")
    }
}
