use axum::{
    extract::{FromRef, Path, State},
    http::StatusCode,
    middleware,
    routing::{get, patch, post},
    Router,
};
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{
        dto::{
            AuthResponse, ChangePasswordRequest, ForgotPasswordRequest, LoginRequest,
            MessageResponse, PublicUser, RefreshRequest, RegisterRequest, ResetPasswordRequest,
            SetRoleRequest, UpdateProfileRequest,
        },
        extractors::CurrentUser,
        repo_types::{NewUser, Role, User},
        services::{
            generate_token, hash_password, hash_token, is_valid_email, normalize_email,
            verify_password, JwtKeys, PASSWORD_RESET_TTL, VERIFICATION_TTL,
        },
    },
    error::{AppError, AppResult},
    extract::Json,
    mailer,
    rate_limit::{self, Limits},
    state::AppState,
};

pub fn auth_routes(limits: &Limits) -> Router<AppState> {
    let limited = Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/forgot-password", post(forgot_password))
        .route_layer(middleware::from_fn_with_state(
            limits.auth.clone(),
            rate_limit::limit,
        ));
    Router::new()
        .merge(limited)
        .route("/auth/refresh", post(refresh))
        .route("/auth/verify-email/:token", get(verify_email))
        .route("/auth/reset-password/:token", post(reset_password))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/me", get(get_me).patch(update_me).delete(deactivate_me))
        .route("/me/password", post(change_password))
        .route("/admin/users/:id/role", patch(set_role))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(mut payload): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    payload.email = normalize_email(&payload.email);
    payload.validate()?;

    let hash = hash_password(&payload.password)?;
    let token = generate_token();
    let token_hash = hash_token(&token);

    let user = User::insert_if_absent(
        &state.db,
        &NewUser {
            email: &payload.email,
            password_hash: &hash,
            first_name: payload.first_name.as_deref(),
            last_name: payload.last_name.as_deref(),
            role: Role::Student,
            verification_token_hash: Some(&token_hash),
            verification_expires_at: Some(OffsetDateTime::now_utc() + VERIFICATION_TTL),
        },
    )
    .await?
    .ok_or_else(|| {
        warn!(email = %payload.email, "email already registered");
        AppError::Conflict("Email already registered".into())
    })?;

    mailer::spawn_rendered(
        state.mailer.clone(),
        state
            .templates
            .account_verification(&user.email, user.display_name(), &token),
    );

    let tokens = JwtKeys::from_ref(&state).issue(&user)?;
    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((StatusCode::CREATED, Json(tokens)))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(mut payload): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    payload.email = normalize_email(&payload.email);

    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(AppError::invalid("email", "Please provide a valid email address"));
    }

    let user = match User::find_by_email(&state.db, &payload.email).await? {
        Some(u) => u,
        None => {
            warn!(email = %payload.email, "login unknown email");
            return Err(AppError::Unauthorized("Invalid credentials".into()));
        }
    };

    if !verify_password(&payload.password, &user.password_hash)? {
        warn!(email = %payload.email, user_id = %user.id, "login invalid password");
        return Err(AppError::Unauthorized("Invalid credentials".into()));
    }

    if !user.is_active {
        warn!(user_id = %user.id, "login on deactivated account");
        return Err(AppError::Unauthorized("Account is deactivated".into()));
    }

    User::touch_login(&state.db, user.id).await?;
    let tokens = JwtKeys::from_ref(&state).issue(&user)?;
    info!(user_id = %user.id, email = %user.email, "user logged in");
    Ok(Json(tokens))
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<Json<AuthResponse>> {
    let keys = JwtKeys::from_ref(&state);
    let claims = keys
        .verify_refresh(&payload.refresh_token)
        .map_err(|e| AppError::Unauthorized(e.to_string()))?;

    let user = User::find_by_id(&state.db, claims.sub)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| AppError::Unauthorized("User not found".into()))?;

    Ok(Json(keys.issue(&user)?))
}

#[instrument(skip(user))]
pub async fn get_me(user: CurrentUser) -> Json<PublicUser> {
    Json(PublicUser::from(&user.0))
}

#[instrument(skip(state, user, payload))]
pub async fn update_me(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> AppResult<Json<PublicUser>> {
    payload.validate()?;
    let updated = User::update_profile(
        &state.db,
        user.0.id,
        payload.first_name.as_deref().map(str::trim),
        payload.last_name.as_deref().map(str::trim),
        payload.phone.as_deref().map(str::trim),
    )
    .await?;
    info!(user_id = %updated.id, "profile updated");
    Ok(Json(PublicUser::from(&updated)))
}

#[instrument(skip(state, user))]
pub async fn deactivate_me(
    State(state): State<AppState>,
    user: CurrentUser,
) -> AppResult<Json<MessageResponse>> {
    User::deactivate(&state.db, user.0.id).await?;
    info!(user_id = %user.0.id, "account deactivated");
    Ok(Json(MessageResponse::ok("Account deactivated")))
}

#[instrument(skip(state, user, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    payload.validate()?;
    if !verify_password(&payload.current_password, &user.0.password_hash)? {
        warn!(user_id = %user.0.id, "change password with wrong current password");
        return Err(AppError::BadRequest("Current password is incorrect".into()));
    }
    let hash = hash_password(&payload.new_password)?;
    User::set_password(&state.db, user.0.id, &hash).await?;
    info!(user_id = %user.0.id, "password changed");
    Ok(Json(MessageResponse::ok("Password updated")))
}

#[instrument(skip(state, token))]
pub async fn verify_email(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<Json<MessageResponse>> {
    let user = User::verify_by_token(&state.db, &hash_token(&token))
        .await?
        .ok_or_else(|| {
            warn!("invalid or expired verification token");
            AppError::BadRequest("Invalid or expired verification token".into())
        })?;
    info!(user_id = %user.id, "email verified");
    Ok(Json(MessageResponse::ok("Email verified successfully")))
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    let email = normalize_email(&payload.email);
    if let Some(user) = User::find_by_email(&state.db, &email)
        .await?
        .filter(|u| u.is_active)
    {
        let token = generate_token();
        let expires_at = OffsetDateTime::now_utc() + PASSWORD_RESET_TTL;
        User::set_reset_token(&state.db, user.id, &hash_token(&token), expires_at).await?;
        mailer::spawn_rendered(
            state.mailer.clone(),
            state
                .templates
                .password_reset(&user.email, user.display_name(), &token),
        );
        info!(user_id = %user.id, "password reset requested");
    } else {
        info!("password reset requested for unknown email");
    }
    Ok(Json(MessageResponse::ok(
        "If that email is registered, a reset link is on its way",
    )))
}

#[instrument(skip(state, token, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(payload): Json<ResetPasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    payload.validate()?;
    let hash = hash_password(&payload.password)?;
    let user = User::reset_password_by_token(&state.db, &hash_token(&token), &hash)
        .await?
        .ok_or_else(|| {
            warn!("invalid or expired reset token");
            AppError::BadRequest("Invalid or expired reset token".into())
        })?;
    info!(user_id = %user.id, "password reset");
    Ok(Json(MessageResponse::ok("Password has been reset")))
}

#[instrument(skip(state, admin, payload))]
pub async fn set_role(
    State(state): State<AppState>,
    admin: CurrentUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<SetRoleRequest>,
) -> AppResult<Json<PublicUser>> {
    admin.require_role(&[Role::Admin])?;
    let user = User::set_role(&state.db, id, payload.role)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;
    info!(admin_id = %admin.0.id, user_id = %user.id, role = ?user.role, "role changed");
    Ok(Json(PublicUser::from(&user)))
}
