use axum::{
    extract::{FromRef, State},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use tracing::instrument;

use crate::{
    auth::{
        cookie::{clear_session_cookie, session_cookie},
        dto::{
            ApiResponse, LoginRequest, RegisterRequest, ResetPasswordRequest,
            SendResetOtpRequest, VerifyEmailRequest,
        },
        error::AuthError,
        extractors::AuthUser,
        service::AuthService,
    },
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/send-verify-otp", post(send_verify_otp))
        .route("/verify-email", post(verify_email))
        .route("/is-auth", get(is_authenticated))
        .route("/send-reset-otp", post(send_reset_otp))
        .route("/reset-password", post(reset_password))
}

#[instrument(skip(state, jar, payload))]
async fn register(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<RegisterRequest>,
) -> Result<(CookieJar, Json<ApiResponse>), AuthError> {
    let service = AuthService::from_ref(&state);
    let (_, token) = service
        .register(&payload.name, &payload.email, &payload.password)
        .await?;
    let jar = jar.add(session_cookie(
        token,
        state.config.environment.is_production(),
    ));
    Ok((jar, Json(ApiResponse::success())))
}

#[instrument(skip(state, jar, payload))]
async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<(CookieJar, Json<ApiResponse>), AuthError> {
    let service = AuthService::from_ref(&state);
    let (_, token) = service.login(&payload.email, &payload.password).await?;
    let jar = jar.add(session_cookie(
        token,
        state.config.environment.is_production(),
    ));
    Ok((jar, Json(ApiResponse::success())))
}

// Clearing the cookie needs no valid session; logout always succeeds.
#[instrument(skip(state, jar))]
async fn logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Json<ApiResponse>) {
    let jar = jar.add(clear_session_cookie(
        state.config.environment.is_production(),
    ));
    (jar, Json(ApiResponse::ok("Logged out successfully")))
}

#[instrument(skip(state))]
async fn send_verify_otp(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<ApiResponse>, AuthError> {
    let service = AuthService::from_ref(&state);
    service.send_verify_otp(user_id).await?;
    Ok(Json(ApiResponse::ok("Verification OTP sent to your email")))
}

#[instrument(skip(state, payload))]
async fn verify_email(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<VerifyEmailRequest>,
) -> Result<Json<ApiResponse>, AuthError> {
    let service = AuthService::from_ref(&state);
    service.verify_email(user_id, &payload.otp).await?;
    Ok(Json(ApiResponse::ok("Email verified successfully")))
}

// Pure session-liveness probe; the extractor has already done the work.
async fn is_authenticated(AuthUser(_user_id): AuthUser) -> Json<ApiResponse> {
    Json(ApiResponse::success())
}

#[instrument(skip(state, payload))]
async fn send_reset_otp(
    State(state): State<AppState>,
    Json(payload): Json<SendResetOtpRequest>,
) -> Result<Json<ApiResponse>, AuthError> {
    let service = AuthService::from_ref(&state);
    service.send_reset_otp(&payload.email).await?;
    Ok(Json(ApiResponse::ok(
        "Password reset OTP sent to your email",
    )))
}

#[instrument(skip(state, payload))]
async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<ApiResponse>, AuthError> {
    let service = AuthService::from_ref(&state);
    service
        .reset_password(&payload.email, &payload.otp, &payload.new_password)
        .await?;
    Ok(Json(ApiResponse::ok("Password reset successfully")))
}
