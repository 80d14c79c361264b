//! HTTP route handlers for the swap, chat, and admin API.
//!
//! Every user-scoped route authenticates the bearer token and enforces that
//! the userId in the request matches the authenticated identity. Admin
//! routes additionally require the admin flag; each admin effect lands in
//! the audit log inside its own transaction.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::aggregator::AggregatorFailure;
use crate::db::queries::{self, CasOutcome, NewOrder};
use crate::error::SwapError;
use crate::intent::SwapIntent;

use super::auth::{ensure_admin, ensure_user_scope, Identity};
use super::server::AppState;

type ApiResponse = (StatusCode, Json<Value>);
type ApiResult = Result<ApiResponse, ApiResponse>;

/// Build all API routes.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/swap-history", get(swap_history))
        .route("/api/chat/history", post(chat_history))
        .route("/api/user/settings", get(user_settings))
        .route("/api/intent", post(submit_intent))
        .route("/api/admin/coins/adjust", post(admin_coins_adjust))
        .route("/api/admin/coins/stats", get(admin_coins_stats))
        .route("/api/admin/coins/gift-all", post(admin_coins_gift_all))
        .route("/health", get(health))
}

fn http_error(err: SwapError) -> ApiResponse {
    match &err {
        SwapError::Validation(failure) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": failure.message, "fields": failure.fields })),
        ),
        SwapError::Unauthorized(msg) => {
            (StatusCode::UNAUTHORIZED, Json(json!({ "error": msg })))
        }
        SwapError::Forbidden(msg) => (StatusCode::FORBIDDEN, Json(json!({ "error": msg }))),
        SwapError::TransientUpstream(msg) => {
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": msg })))
        }
        SwapError::PermanentUpstream { code, message } => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": message, "code": code })),
        ),
        _ => {
            warn!(error = %err, "internal error surfaced to handler");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
        }
    }
}

/// Map an aggregator failure to a response. Permanent rejections carry
/// their classification so the caller knows whether a fresh quote, a fixed
/// input, or nothing will help.
fn aggregator_error(err: AggregatorFailure) -> ApiResponse {
    if err.is_transient() {
        return http_error(SwapError::TransientUpstream(err.to_string()));
    }
    let kind = err.permanent_kind();
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": err.message,
            "code": err.code.unwrap_or_else(|| "UPSTREAM_REJECTED".into()),
            "kind": kind.as_str(),
        })),
    )
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiResponse> {
    state.auth.authenticate(headers).await.map_err(http_error)
}

// ── Swap history ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryParams {
    user_id: String,
    limit: Option<i64>,
}

/// GET /api/swap-history?userId=…&limit=…
async fn swap_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> ApiResult {
    let identity = authenticate(&state, &headers).await?;
    ensure_user_scope(&identity, &params.user_id).map_err(http_error)?;

    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let orders = queries::get_swap_history(&state.db, &params.user_id, limit)
        .await
        .map_err(http_error)?;

    Ok((StatusCode::OK, Json(json!({ "orders": orders }))))
}

// ── Chat history ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    user_id: String,
    role: String,
    content: String,
    #[serde(default)]
    state: Option<Value>,
    #[serde(default)]
    expected_version: Option<i64>,
}

/// POST /api/chat/history — append a message and advance conversation state.
async fn chat_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> ApiResult {
    let identity = authenticate(&state, &headers).await?;
    ensure_user_scope(&identity, &body.user_id).map_err(http_error)?;

    if body.content.trim().is_empty() || !matches!(body.role.as_str(), "user" | "assistant") {
        return Err(http_error(SwapError::validation(
            "role must be user|assistant and content non-empty",
            vec!["role", "content"],
        )));
    }

    let conversation_state = body.state.unwrap_or_else(|| json!({}));
    let outcome = queries::append_chat_message(
        &state.db,
        &body.user_id,
        &body.role,
        &body.content,
        &conversation_state,
        body.expected_version,
    )
    .await
    .map_err(http_error)?;

    match outcome {
        CasOutcome::Applied(version) => {
            Ok((StatusCode::CREATED, Json(json!({ "version": version }))))
        }
        CasOutcome::Conflict(current) => Err(http_error(SwapError::validation(
            format!("stale conversation version; current is {current}"),
            vec!["expectedVersion"],
        ))),
    }
}

// ── User settings ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsParams {
    user_id: String,
}

/// GET /api/user/settings?userId=…
async fn user_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SettingsParams>,
) -> ApiResult {
    let identity = authenticate(&state, &headers).await?;
    ensure_user_scope(&identity, &params.user_id).map_err(http_error)?;

    let settings = queries::get_user_settings(&state.db, &params.user_id)
        .await
        .map_err(http_error)?;

    match settings {
        Some(settings) => Ok((StatusCode::OK, Json(json!({ "settings": settings })))),
        // Defaults for users who never saved settings; same shape as a row.
        None => Ok((
            StatusCode::OK,
            Json(json!({
                "settings": {
                    "user_id": params.user_id,
                    "slippage_tolerance": "0.0100",
                    "notify_on_settle": true,
                }
            })),
        )),
    }
}

// ── Intent dispatch ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntentBody {
    user_id: String,
    #[serde(flatten)]
    intent: SwapIntent,
}

/// POST /api/intent — execute a structured intent from the parser.
async fn submit_intent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IntentBody>,
) -> ApiResult {
    let identity = authenticate(&state, &headers).await?;
    ensure_user_scope(&identity, &body.user_id).map_err(http_error)?;

    body.intent
        .validate()
        .map_err(|f| http_error(SwapError::Validation(f)))?;

    match body.intent {
        SwapIntent::Swap {
            from_asset,
            from_network,
            to_asset,
            to_network,
            amount,
        } => {
            execute_swap(
                &state,
                &body.user_id,
                &from_asset,
                &from_network,
                &to_asset,
                &to_network,
                amount,
            )
            .await
        }
        SwapIntent::Dca {
            from_asset,
            from_network,
            to_asset,
            to_network,
            amount,
            interval_hours,
        } => {
            let plan_id = queries::insert_dca_plan(
                &state.db,
                &body.user_id,
                &from_asset,
                &from_network,
                &to_asset,
                &to_network,
                amount,
                interval_hours,
            )
            .await
            .map_err(http_error)?;
            info!(plan_id, user_id = %body.user_id, "dca plan created");
            Ok((StatusCode::CREATED, Json(json!({ "planId": plan_id }))))
        }
        SwapIntent::LimitOrder {
            from_asset,
            from_network,
            to_asset,
            to_network,
            amount,
            target_price,
            condition,
            reference_asset,
            reference_chain,
        } => {
            let parsed = condition
                .parse()
                .map_err(|_| http_error(SwapError::validation("bad condition", vec!["condition"])))?;
            let limit_id = queries::insert_limit_order(
                &state.db,
                &body.user_id,
                &from_asset,
                &from_network,
                &to_asset,
                &to_network,
                amount,
                target_price,
                parsed,
                &reference_asset,
                &reference_chain,
            )
            .await
            .map_err(http_error)?;
            info!(limit_id, user_id = %body.user_id, "limit order armed");
            Ok((StatusCode::CREATED, Json(json!({ "limitOrderId": limit_id }))))
        }
        SwapIntent::Portfolio { limit } => {
            let orders =
                queries::get_swap_history(&state.db, &body.user_id, limit.unwrap_or(20).clamp(1, 200))
                    .await
                    .map_err(http_error)?;
            let settled = orders.iter().filter(|o| o.status == "settled").count();
            Ok((
                StatusCode::OK,
                Json(json!({
                    "orders": orders,
                    "settledCount": settled,
                })),
            ))
        }
        SwapIntent::Checkout {
            settle_asset,
            settle_network,
            amount,
            settle_address,
        } => {
            let checkout = state
                .aggregator
                .create_checkout(&settle_asset, &settle_network, amount, &settle_address)
                .await
                .map_err(aggregator_error)?;
            Ok((
                StatusCode::CREATED,
                Json(json!({ "checkoutId": checkout.id, "url": checkout.url })),
            ))
        }
        SwapIntent::YieldScout { asset, chain } => {
            let rate = state
                .aggregator
                .get_pair_rate(&asset, "usdc")
                .await
                .map_err(aggregator_error)?;
            Ok((
                StatusCode::OK,
                Json(json!({ "asset": asset, "chain": chain, "rateUsd": rate.rate })),
            ))
        }
    }
}

/// Quote → create → persist → track for an interactive swap.
#[allow(clippy::too_many_arguments)]
async fn execute_swap(
    state: &AppState,
    user_id: &str,
    from_asset: &str,
    from_network: &str,
    to_asset: &str,
    to_network: &str,
    amount: Decimal,
) -> ApiResult {
    let user = queries::get_user(&state.db, user_id)
        .await
        .map_err(http_error)?
        .ok_or_else(|| http_error(SwapError::validation("unknown user", vec!["userId"])))?;

    let Some(settle_address) = user.settle_address.as_deref() else {
        return Err(http_error(SwapError::validation(
            "user has no settlement address",
            vec!["settleAddress"],
        )));
    };

    let quote = state
        .aggregator
        .get_quote(from_asset, from_network, to_asset, to_network, amount)
        .await
        .map_err(aggregator_error)?;

    let created = state
        .aggregator
        .create_order(&quote.id, settle_address, user.refund_address.as_deref())
        .await
        .map_err(aggregator_error)?;

    let order = NewOrder {
        sideshift_order_id: created.id.clone(),
        user_id: user_id.to_string(),
        from_asset: from_asset.to_string(),
        from_network: from_network.to_string(),
        from_amount: amount,
        to_asset: to_asset.to_string(),
        to_network: to_network.to_string(),
        settle_amount: created.settle_amount.or(Some(quote.settle_amount)),
        deposit_address: created.deposit_address.clone(),
        deposit_memo: created.deposit_memo.clone(),
    };
    queries::record_new_order(&state.db, &order)
        .await
        .map_err(http_error)?;

    if let Err(e) = state.monitor.track(&created.id, user_id, Utc::now()).await {
        warn!(order_id = %created.id, error = %e, "monitor registration failed");
    }

    info!(order_id = %created.id, user_id, "swap order created");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "orderId": created.id,
            "depositAddress": created.deposit_address,
            "depositMemo": created.deposit_memo,
            "settleAmount": order.settle_amount,
            "expiresAt": created.expires_at,
        })),
    ))
}

// ── Admin: coin ledger ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdjustBody {
    target_user_id: String,
    action: String,
    amount: Decimal,
    #[serde(default)]
    note: Option<String>,
}

/// POST /api/admin/coins/adjust
async fn admin_coins_adjust(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AdjustBody>,
) -> ApiResult {
    let identity = authenticate(&state, &headers).await?;
    ensure_admin(&identity).map_err(http_error)?;

    if !matches!(body.action.as_str(), "gift" | "deduct" | "reset") {
        return Err(http_error(SwapError::validation(
            "action must be gift|deduct|reset",
            vec!["action"],
        )));
    }
    if body.action != "reset" && body.amount <= Decimal::ZERO {
        return Err(http_error(SwapError::validation(
            "amount must be positive",
            vec!["amount"],
        )));
    }

    let adjustment = queries::adjust_coin_balance(
        &state.db,
        &identity.user_id,
        &body.target_user_id,
        &body.action,
        body.amount,
        body.note.as_deref(),
    )
    .await
    .map_err(http_error)?;

    match adjustment {
        Some(result) => {
            info!(
                admin = %identity.user_id,
                target = %body.target_user_id,
                action = %body.action,
                "coin balance adjusted"
            );
            Ok((
                StatusCode::OK,
                Json(json!({ "newBalance": result.new_balance })),
            ))
        }
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "target user not found" })),
        )),
    }
}

/// GET /api/admin/coins/stats
async fn admin_coins_stats(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let identity = authenticate(&state, &headers).await?;
    ensure_admin(&identity).map_err(http_error)?;

    let (users, supply, gifted) = queries::coin_stats(&state.db).await.map_err(http_error)?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "users": users,
            "totalSupply": supply,
            "totalGifted": gifted,
        })),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GiftAllBody {
    amount: Decimal,
    #[serde(default)]
    note: Option<String>,
}

/// POST /api/admin/coins/gift-all — one transaction across every user.
async fn admin_coins_gift_all(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<GiftAllBody>,
) -> ApiResult {
    let identity = authenticate(&state, &headers).await?;
    ensure_admin(&identity).map_err(http_error)?;

    if body.amount <= Decimal::ZERO {
        return Err(http_error(SwapError::validation(
            "amount must be positive",
            vec!["amount"],
        )));
    }

    let credited = queries::gift_all_users(
        &state.db,
        &identity.user_id,
        body.amount,
        body.note.as_deref(),
    )
    .await
    .map_err(http_error)?;

    info!(admin = %identity.user_id, credited, "broadcast gift applied");
    Ok((StatusCode::OK, Json(json!({ "usersCredited": credited }))))
}

/// GET /health — simple health check.
async fn health() -> &'static str {
    "ok"
}
