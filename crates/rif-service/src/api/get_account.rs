use {
    crate::api::AppState,
    axum::{
        extract::{Path, State},
        http::StatusCode,
        response::{IntoResponse, Json, Response},
    },
    rif::{Identifier, LoginError},
    serde::Serialize,
    std::sync::Arc,
};

#[derive(Serialize)]
struct AccountResponse {
    rif: Identifier,
    registered: bool,
}

/// Login time check: the identifier must be well formed and bound to an
/// account. The registry is not consulted.
pub async fn get_account_handler(
    State(state): State<Arc<AppState>>,
    Path(rif): Path<String>,
) -> Response {
    match state
        .validator
        .validate_login(&rif, state.accounts.as_ref())
        .await
    {
        Ok(rif) => (
            StatusCode::OK,
            Json(AccountResponse {
                rif,
                registered: true,
            }),
        )
            .into_response(),
        Err(LoginError::InvalidFormat(reason)) => super::invalid_rif_reply(reason),
        Err(LoginError::UserNotRegistered) => (
            StatusCode::NOT_FOUND,
            super::error("UserNotRegistered", "no account uses this identifier"),
        )
            .into_response(),
    }
}
