//! HTTP surface of the injection webhook
//!
//! Handles AdmissionReview requests for Pods: decodes the Pod, runs the
//! [`PodMutator`] under the admission deadline and turns the outcome into an
//! allowed, patched or denied response.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use tracing::{debug, error, info, warn};

use crate::error::InjectionError;
use crate::mutator::{MutationOutcome, PodMutator};

/// Shared state of the webhook handlers
pub struct WebhookState {
    /// Decision engine
    pub mutator: PodMutator,
    /// Deadline of one admission call
    pub timeout: Duration,
}

/// Router serving `POST /inject` and `GET /healthz`
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/inject", post(inject_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Handle a mutating admission review for a Pod
pub async fn inject_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = admit(&state, &req).await;
    Json(response.into_review())
}

async fn admit(state: &WebhookState, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let uid = req.uid.clone();
    let namespace = req.namespace.clone().unwrap_or_default();

    let Some(obj) = &req.object else {
        debug!(uid = %uid, "No object in request, allowing unchanged");
        return AdmissionResponse::from(req);
    };
    let pod = match decode_pod(obj) {
        Ok(pod) => pod,
        Err(e) => return deny(req, e),
    };

    let mutation = tokio::time::timeout(state.timeout, state.mutator.mutate(&namespace, pod.clone()));
    let outcome = match mutation.await {
        Ok(outcome) => outcome,
        Err(_) => Err(InjectionError::DeadlineExceeded(state.timeout)),
    };

    match outcome {
        Ok(MutationOutcome::Unchanged { note }) => {
            debug!(uid = %uid, namespace = %namespace, note = ?note, "Allowing pod unchanged");
            let mut response = AdmissionResponse::from(req);
            if let Some(note) = note {
                response.result.message = note;
            }
            response
        }
        Ok(MutationOutcome::Patched { pod: mutated, warnings }) => {
            let patch = match build_patch(&pod, &mutated) {
                Ok(patch) => patch,
                Err(e) => return deny(req, e),
            };
            info!(
                uid = %uid,
                namespace = %namespace,
                patch_ops = patch.0.len(),
                "Applying patch to pod"
            );
            match AdmissionResponse::from(req).with_patch(patch) {
                Ok(mut response) => {
                    if !warnings.is_empty() {
                        response.warnings = Some(warnings);
                    }
                    response
                }
                Err(e) => deny(req, InjectionError::PatchSerialization(e.to_string())),
            }
        }
        Err(e) => deny(req, e),
    }
}

fn decode_pod(obj: &DynamicObject) -> Result<Pod, InjectionError> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| InjectionError::Decode(e.to_string()))
}

/// JSON patch turning `original` into `mutated`
pub fn build_patch(original: &Pod, mutated: &Pod) -> Result<json_patch::Patch, InjectionError> {
    let before = serde_json::to_value(original)?;
    let after = serde_json::to_value(mutated)?;
    Ok(json_patch::diff(&before, &after))
}

fn deny(req: &AdmissionRequest<DynamicObject>, e: InjectionError) -> AdmissionResponse {
    let code = e.status_code();
    if e.is_denial() {
        warn!(uid = %req.uid, code, error = %e, "Denying pod");
    } else {
        error!(uid = %req.uid, code, error = %e, "Failed to process pod");
    }
    let mut response = AdmissionResponse::from(req).deny(e.to_string());
    response.result.code = code;
    response
}
