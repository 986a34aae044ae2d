use {
    crate::api::AppState,
    axum::{
        extract::State,
        http::StatusCode,
        response::{IntoResponse, Json, Response},
    },
    rif::{Identifier, RegistrationError, ValidationOutcome},
    serde::{Deserialize, Serialize},
    std::sync::Arc,
};

/// The identifier either as a single string or split into the three fields
/// of the registration form.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum RegistrationRequest {
    #[serde(rename_all = "camelCase")]
    Parts {
        kind: String,
        number: String,
        check_digit: String,
    },
    Whole {
        rif: String,
    },
}

#[derive(Serialize)]
struct RegistrationResponse {
    rif: Identifier,
}

fn already_registered_reply() -> Response {
    (
        StatusCode::CONFLICT,
        super::error(
            "AlreadyRegistered",
            "identifier is already bound to an account",
        ),
    )
        .into_response()
}

pub async fn post_registration_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegistrationRequest>,
) -> Response {
    let raw = match request {
        RegistrationRequest::Whole { rif } => rif,
        RegistrationRequest::Parts {
            kind,
            number,
            check_digit,
        } => match state.validator.parse_parts(&kind, &number, &check_digit) {
            ValidationOutcome::Valid(identifier) => identifier.canonical(),
            ValidationOutcome::Invalid(reason) => return super::invalid_rif_reply(reason),
        },
    };

    let result = state
        .validator
        .validate_authoritative(&raw, state.accounts.as_ref())
        .await;
    match result {
        Ok(rif) => {
            // A concurrent registration may have bound it in the meantime.
            if !state.accounts.bind(rif) {
                return already_registered_reply();
            }
            tracing::info!(%rif, "registered account");
            (StatusCode::CREATED, Json(RegistrationResponse { rif })).into_response()
        }
        Err(RegistrationError::InvalidFormat(reason)) => super::invalid_rif_reply(reason),
        Err(RegistrationError::AlreadyRegistered) => already_registered_reply(),
        Err(RegistrationError::NotFoundInRegistry) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            super::error(
                "NotFoundInRegistry",
                "identifier does not exist in the tax registry",
            ),
        )
            .into_response(),
        Err(RegistrationError::RegistryUnreachable(cause)) => {
            super::registry_unreachable_reply(cause)
        }
    }
}
