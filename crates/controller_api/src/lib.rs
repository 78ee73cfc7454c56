//! HTTP facade of the controller.
//!
//! Three endpoints: run one algorithm, list the catalog, list the
//! federation's datasets. Error classification maps onto status codes
//! here: schema problems are 400, bad user input is 460 so portals can
//! show the message verbatim, everything else is what its `ErrorMetadata`
//! says.

use std::sync::Arc;

use axum::{
    extract::{
        Path,
        State,
    },
    response::{
        IntoResponse,
        Response,
    },
    routing::{
        get,
        post,
    },
    Json,
    Router,
};
use common::RequestId;
use controller::{
    AlgorithmRequest,
    Controller,
};
use errors::ErrorMetadataAnyhowExt;
use http::StatusCode;

/// Converts an `anyhow::Error` chain into the response the facade sends:
/// the status code from the error's classification and a JSON body with
/// the stable tag and the human-readable message.
pub struct HttpResponseError {
    error: anyhow::Error,
}

impl From<anyhow::Error> for HttpResponseError {
    fn from(error: anyhow::Error) -> Self {
        Self { error }
    }
}

impl IntoResponse for HttpResponseError {
    fn into_response(self) -> Response {
        let status = self.error.http_status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            errors::report_error(&self.error);
        }
        let body = serde_json::json!({
            "error": {
                "code": self.error.short_msg(),
                "message": self.error.msg(),
            },
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<Controller>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/algorithms", get(list_algorithms))
        .route("/algorithms/{name}", post(run_algorithm))
        .route("/datasets", get(list_datasets))
        .with_state(state)
}

async fn run_algorithm(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(request): Json<AlgorithmRequest>,
) -> Result<Json<serde_json::Value>, HttpResponseError> {
    let request_id = RequestId::fresh();
    tracing::info!(request_id = %request_id, algorithm = %name, "Received algorithm request");
    let result = state
        .controller
        .exec_algorithm(request_id, &name, request)
        .await?;
    Ok(Json(result))
}

async fn list_algorithms(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.controller.algorithm_specifications()))
}

async fn list_datasets(
    State(state): State<ApiState>,
) -> Result<Json<serde_json::Value>, HttpResponseError> {
    let catalog = state.controller.datasets_catalog();
    Ok(Json(serde_json::to_value(catalog).map_err(anyhow::Error::from)?))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::Arc,
    };

    use axum::body::Body;
    use common::NodeRole;
    use controller::{
        smpc::testing::FakeSmpcCluster,
        SmpcSettings,
    };
    use http::{
        Request,
        StatusCode,
    };
    use landscape::LandscapeAggregator;
    use maplit::btreemap;
    use tower::ServiceExt;
    use worker_client::testing::InMemoryCluster;

    use super::*;

    async fn test_router() -> Router {
        common::env::config_test();
        let cluster = InMemoryCluster::new();
        cluster.add_worker("global.example:5672", "globalnode", NodeRole::Global);
        cluster.add_worker("local1.example:5672", "localnode1", NodeRole::Local);
        cluster.load_data_model(
            "local1.example:5672",
            &"dementia:0.1".parse().unwrap(),
            common::CommonDataElements::new(btreemap! {
                common::DATASET_CDE_CODE.to_owned() => common::CommonDataElement {
                    code: common::DATASET_CDE_CODE.to_owned(),
                    label: "Dataset".to_owned(),
                    sql_type: common::DType::Str,
                    is_categorical: true,
                    enumerations: Some(BTreeMap::new()),
                    min: None,
                    max: None,
                },
            }),
            btreemap! {"ds1".to_owned() => "Dataset one".to_owned()},
            vec![],
        );
        let channel: Arc<dyn worker_client::TaskChannel> = cluster.clone();
        let aggregator = Arc::new(LandscapeAggregator::new(
            channel.clone(),
            vec!["global.example:5672".to_owned(), "local1.example:5672".to_owned()],
        ));
        aggregator.update_once().await;
        let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
        let (algorithms, _udfs) = algorithms::default_registries().unwrap();
        let controller = Controller::new(
            channel.clone(),
            aggregator,
            Arc::new(FakeSmpcCluster::new(channel)),
            SmpcSettings {
                enabled: false,
                optional: false,
            },
            algorithms,
            events_tx,
        );
        router(ApiState {
            controller: Arc::new(controller),
        })
    }

    #[tokio::test]
    async fn test_get_algorithms_lists_the_catalog() {
        let router = test_router().await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/algorithms")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let catalog: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let names: Vec<&str> = catalog
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"paired_ttest"));
        assert!(names.contains(&"pca_with_transformation"));
    }

    #[tokio::test]
    async fn test_get_datasets_returns_the_registry_view() {
        let router = test_router().await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/datasets")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let catalog: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(catalog["dementia:0.1"]["ds1"], "Dataset one");
    }

    #[tokio::test]
    async fn test_bad_user_input_maps_to_460() {
        let router = test_router().await;
        let request = serde_json::json!({
            "inputdata": {
                "data_model": "dementia:0.1",
                "datasets": ["missing_ds"],
                "x": ["x1"],
                "y": ["y1"],
            },
            "parameters": {"alpha": 0.05, "alt_hypothesis": "two-sided"},
        });
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/algorithms/paired_ttest")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 460);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["error"]["code"], "DatasetUnavailable");
    }

    #[tokio::test]
    async fn test_malformed_body_maps_to_4xx() {
        let router = test_router().await;
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/algorithms/paired_ttest")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"not\": \"the schema\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
