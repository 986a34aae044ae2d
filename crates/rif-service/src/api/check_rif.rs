use {
    crate::api::AppState,
    axum::{
        extract::{Path, State},
        response::Json,
    },
    rif::{Existence, Identifier, ValidationOutcome},
    serde::Serialize,
    std::sync::Arc,
};

#[derive(Serialize)]
pub struct CheckResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rif: Option<Identifier>,
    exists: Existence,
}

/// Live form feedback. Always answers `200`, an unreachable registry shows up
/// as `"exists": "unknown"`.
pub async fn check_rif_handler(
    State(state): State<Arc<AppState>>,
    Path(rif): Path<String>,
) -> Json<CheckResponse> {
    let check = state.validator.validate_interactive(&rif).await;
    let (reason, rif) = match check.format {
        ValidationOutcome::Valid(identifier) => (None, Some(identifier)),
        ValidationOutcome::Invalid(reason) => (Some(reason.as_str()), None),
    };
    Json(CheckResponse {
        valid: rif.is_some(),
        reason,
        rif,
        exists: check.exists,
    })
}
