use {
    crate::api::AppState,
    axum::{
        extract::{Path, State},
        http::StatusCode,
        response::{IntoResponse, Json, Response},
    },
    rif::LookupError,
    std::sync::Arc,
};

/// Registered taxpayer data, used to prefill the registration form.
pub async fn get_taxpayer_handler(
    State(state): State<Arc<AppState>>,
    Path(rif): Path<String>,
) -> Response {
    match state.validator.taxpayer_name(&rif).await {
        Ok(taxpayer) => (StatusCode::OK, Json(taxpayer)).into_response(),
        Err(LookupError::InvalidFormat(reason)) => super::invalid_rif_reply(reason),
        Err(LookupError::NotFoundInRegistry) => (
            StatusCode::NOT_FOUND,
            super::error(
                "NotFoundInRegistry",
                "identifier does not exist in the tax registry",
            ),
        )
            .into_response(),
        Err(LookupError::RegistryUnreachable(cause)) => super::registry_unreachable_reply(cause),
    }
}
