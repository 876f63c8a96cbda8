use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    middleware,
    routing::{delete, get, patch, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
use uuid::Uuid;

use crate::error::ApiErrorWithMeta;
use crate::gateway::MessageReceipt;
use crate::loyalty::{self, PointsMode, PointsUpdate, RewardStatus};
use crate::orders::{self, CreateOrder, OrderCheckout, OrderConfirmation};
use crate::qr::{self, ScanOutcome, VerifyOutcome};
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::subscription::{self, Checkout, ConfirmCheckout, Confirmation, Coverage};
use crate::types::{
    AppState, OrderType, QrCode, RedemptionStatus, RewardRedemption, SubscriptionType, User,
};

type ApiResult<T> = Result<ApiOk<T>, ApiErrorWithMeta>;

/// The request to verify a tag for its owner.
#[derive(Deserialize)]
pub struct VerifyRequest {
    /// The user claiming the tag.
    pub user_id: Uuid,
    /// The pet to link when the tag is still unassigned.
    pub pet_id: Option<Uuid>,
}

/// A finder's message to the owner of a tag.
#[derive(Deserialize)]
pub struct ContactRequest {
    pub message: String,
    pub finder_phone: Option<String>,
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub count: usize,
}

#[derive(Deserialize)]
pub struct ExportRequest {
    pub limit: i64,
}

/// The request to start paying for coverage.
#[derive(Deserialize)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub qr_code_id: Uuid,
    pub plan: SubscriptionType,
}

/// The request to record a completed checkout.
#[derive(Deserialize)]
pub struct ConfirmCheckoutRequest {
    pub user_id: Uuid,
    pub qr_code_id: Uuid,
    pub plan: SubscriptionType,
    /// The payment intent the client completed.
    pub payment_intent_id: String,
    /// The recurring subscription, for monthly and yearly plans.
    pub subscription_id: Option<String>,
}

#[derive(Deserialize)]
pub struct PointsRequest {
    pub points: i64,
    pub mode: PointsMode,
}

#[derive(Deserialize)]
pub struct ReferralRequest {
    pub code: String,
}

#[derive(Deserialize)]
pub struct RedemptionStatusRequest {
    pub status: RedemptionStatus,
}

/// The request to buy a tag or a replacement tag.
#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    pub order_type: OrderType,
    pub pet_name: String,
    #[serde(default)]
    pub is_replacement: bool,
}

/// The response after releasing a user's tags.
#[derive(Serialize)]
pub struct ReleaseResponse {
    /// How many tags went back to the pool.
    pub released: u64,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/qr/batch", post(create_batch_handler))
        .route("/qr/export", post(export_handler))
        // Sibling routes must share the parameter name; verify takes the tag id.
        .route("/qr/{code}/scan", get(scan_handler))
        .route("/qr/{code}/verify", post(verify_handler))
        .route("/qr/{code}/contact", post(contact_handler))
        .route("/subscriptions/checkout", post(checkout_handler))
        .route("/subscriptions/confirm", post(confirm_checkout_handler))
        .route("/users/{id}/coverage", get(coverage_handler))
        .route("/users/{id}/qr-codes", delete(release_codes_handler))
        .route("/users/{id}/points", post(adjust_points_handler))
        .route("/users/{id}/rewards", get(rewards_handler))
        .route("/users/{id}/referral", post(referral_handler))
        .route("/redemptions/{id}", patch(redemption_status_handler))
        .route("/orders", post(create_order_handler))
        .route("/orders/{id}/confirm", post(confirm_order_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn scan_handler(
    State(st): State<AppState>,
    Path(code): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<ScanOutcome> {
    let outcome = qr::scan(st.store.as_ref(), &st.config.public_base_url, &code)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("scan recorded", outcome, meta))
}

async fn verify_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<VerifyRequest>,
) -> ApiResult<VerifyOutcome> {
    let outcome = qr::verify_or_auto_verify(&st, req.user_id, id, req.pet_id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    let message = match outcome {
        VerifyOutcome::Verified { .. } => "QR code verified",
        VerifyOutcome::AlreadyVerified { .. } => "QR code already verified",
        VerifyOutcome::PaymentRequired { .. } => "payment required",
    };
    Ok(ApiOk::ok(message, outcome, meta))
}

async fn contact_handler(
    State(st): State<AppState>,
    Path(code): Path<String>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<ContactRequest>,
) -> ApiResult<MessageReceipt> {
    let receipt = qr::contact_owner(&st, &code, &req.message, req.finder_phone.as_deref())
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("owner contacted", receipt, meta))
}

async fn create_batch_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<Vec<QrCode>> {
    let codes = qr::generate_batch(st.store.as_ref(), req.count)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::created("QR codes created", codes, meta))
}

async fn export_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<ExportRequest>,
) -> ApiResult<Vec<QrCode>> {
    let codes = qr::export_unused(st.store.as_ref(), req.limit)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("QR codes exported", codes, meta))
}

async fn checkout_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Checkout> {
    let checkout = subscription::start_checkout(&st, req.user_id, req.qr_code_id, req.plan)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::created("checkout started", checkout, meta))
}

async fn confirm_checkout_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<ConfirmCheckoutRequest>,
) -> ApiResult<Confirmation> {
    let confirmation = subscription::confirm_checkout(
        &st,
        ConfirmCheckout {
            user_id: req.user_id,
            qr_code_id: req.qr_code_id,
            plan: req.plan,
            payment_intent_id: req.payment_intent_id,
            subscription_id: req.subscription_id,
        },
    )
    .await
    .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("subscription recorded", confirmation, meta))
}

async fn coverage_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<Coverage> {
    let coverage = subscription::coverage_summary(st.store.as_ref(), id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("coverage fetched", coverage, meta))
}

async fn release_codes_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<ReleaseResponse> {
    let released = qr::release_user_codes(st.store.as_ref(), id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("QR codes released", ReleaseResponse { released }, meta))
}

async fn adjust_points_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<PointsRequest>,
) -> ApiResult<PointsUpdate> {
    let update = loyalty::adjust_points(st.store.as_ref(), id, req.points, req.mode)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("points updated", update, meta))
}

async fn rewards_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<RewardStatus> {
    let status = loyalty::reward_status(st.store.as_ref(), id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("rewards fetched", status, meta))
}

async fn referral_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<ReferralRequest>,
) -> ApiResult<User> {
    let user = loyalty::apply_referral(st.store.as_ref(), id, &req.code)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("referral applied", user, meta))
}

async fn redemption_status_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<RedemptionStatusRequest>,
) -> ApiResult<RewardRedemption> {
    let redemption = loyalty::update_redemption_status(st.store.as_ref(), id, req.status)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::ok("redemption updated", redemption, meta))
}

async fn create_order_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<OrderCheckout> {
    let checkout = orders::create_order(
        &st,
        CreateOrder {
            user_id: req.user_id,
            order_type: req.order_type,
            pet_name: req.pet_name,
            is_replacement: req.is_replacement,
        },
    )
    .await
    .map_err(|e| e.into_api(meta.clone()))?;
    Ok(ApiOk::created("order created", checkout, meta))
}

async fn confirm_order_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
) -> ApiResult<OrderConfirmation> {
    let confirmation = orders::confirm_order(&st, id)
        .await
        .map_err(|e| e.into_api(meta.clone()))?;
    let message = if confirmation.provisioning.is_some() {
        "order confirmed"
    } else {
        "order payment failed"
    };
    Ok(ApiOk::ok(message, confirmation, meta))
}
