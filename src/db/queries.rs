//! SQL query functions for all tables.
//!
//! Multi-statement financial effects (DCA completion, limit execution, coin
//! adjustments) run inside a single transaction here so callers cannot
//! accidentally split them.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgExecutor, PgPool};

use super::models::*;
use crate::error::{Result, SwapError};

const TERMINAL_STATUSES: &str = "('settled', 'expired', 'refunded', 'failed')";

/// Insert parameters for a freshly created aggregator order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub sideshift_order_id: String,
    pub user_id: String,
    pub from_asset: String,
    pub from_network: String,
    pub from_amount: Decimal,
    pub to_asset: String,
    pub to_network: String,
    pub settle_amount: Option<Decimal>,
    pub deposit_address: String,
    pub deposit_memo: Option<String>,
}

// ── Orders ───────────────────────────────────────────────────────

pub async fn insert_order<'e>(exec: impl PgExecutor<'e>, order: &NewOrder) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO orders (sideshift_order_id, user_id, from_asset, from_network, from_amount,
         to_asset, to_network, settle_amount, deposit_address, deposit_memo, status)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending')
         RETURNING id",
    )
    .bind(&order.sideshift_order_id)
    .bind(&order.user_id)
    .bind(&order.from_asset)
    .bind(&order.from_network)
    .bind(order.from_amount)
    .bind(&order.to_asset)
    .bind(&order.to_network)
    .bind(order.settle_amount)
    .bind(&order.deposit_address)
    .bind(&order.deposit_memo)
    .fetch_one(exec)
    .await?;
    Ok(id)
}

pub async fn get_open_orders(pool: &PgPool) -> Result<Vec<DbOrder>> {
    let rows = sqlx::query_as::<_, DbOrder>(&format!(
        "SELECT * FROM orders WHERE status NOT IN {TERMINAL_STATUSES} ORDER BY created_at"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_swap_history(pool: &PgPool, user_id: &str, limit: i64) -> Result<Vec<DbOrder>> {
    let rows = sqlx::query_as::<_, DbOrder>(
        "SELECT * FROM orders WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Register an order for monitoring. Idempotent — a second insert for the
/// same external ID is a no-op.
pub async fn insert_watched_order<'e>(
    exec: impl PgExecutor<'e>,
    sideshift_order_id: &str,
    user_id: &str,
    last_status: OrderStatus,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO watched_orders (sideshift_order_id, user_id, last_status)
         VALUES ($1, $2, $3)
         ON CONFLICT (sideshift_order_id) DO NOTHING",
    )
    .bind(sideshift_order_id)
    .bind(user_id)
    .bind(last_status.as_str())
    .execute(exec)
    .await?;
    Ok(())
}

/// Persist an observed status transition: append to the status log and bring
/// both the order row and its watch row to the new status, atomically.
pub async fn persist_transition(
    pool: &PgPool,
    sideshift_order_id: &str,
    old_status: OrderStatus,
    new_status: OrderStatus,
    payload_fingerprint: Option<&str>,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO status_log (sideshift_order_id, old_status, new_status, payload_fingerprint)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(sideshift_order_id)
    .bind(old_status.as_str())
    .bind(new_status.as_str())
    .bind(payload_fingerprint)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE orders SET status = $1, updated_at = NOW() WHERE sideshift_order_id = $2")
        .bind(new_status.as_str())
        .bind(sideshift_order_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("UPDATE watched_orders SET last_status = $1 WHERE sideshift_order_id = $2")
        .bind(new_status.as_str())
        .bind(sideshift_order_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// Record a freshly created order together with its watch row.
pub async fn record_new_order(pool: &PgPool, order: &NewOrder) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let order_id = insert_order(&mut *tx, order).await?;
    insert_watched_order(
        &mut *tx,
        &order.sideshift_order_id,
        &order.user_id,
        OrderStatus::Pending,
    )
    .await?;
    tx.commit().await?;
    Ok(order_id)
}

// ── DCA plans ────────────────────────────────────────────────────

pub async fn insert_dca_plan(
    pool: &PgPool,
    user_id: &str,
    from_asset: &str,
    from_network: &str,
    to_asset: &str,
    to_network: &str,
    amount: Decimal,
    interval_hours: i32,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO dca_plans (user_id, from_asset, from_network, to_asset, to_network,
         amount, interval_hours, next_execution_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW() + make_interval(hours => $7))
         RETURNING id",
    )
    .bind(user_id)
    .bind(from_asset)
    .bind(from_network)
    .bind(to_asset)
    .bind(to_network)
    .bind(amount)
    .bind(interval_hours)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Atomically claim every due plan. `FOR UPDATE SKIP LOCKED` makes the claim
/// invisible to concurrent scheduler instances; pushing the lock sentinel
/// (`now + max_processing_time`) inside the same transaction keeps the rows
/// "not due" for peers after commit, and reclaimable if we crash mid-flight.
pub async fn claim_due_plans(
    pool: &PgPool,
    max_processing_time: Duration,
) -> Result<Vec<DbDcaPlan>> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query_as::<_, DbDcaPlan>(
        "SELECT * FROM dca_plans
         WHERE is_active = TRUE AND next_execution_at <= NOW()
         ORDER BY next_execution_at
         FOR UPDATE SKIP LOCKED",
    )
    .fetch_all(&mut *tx)
    .await?;

    let sentinel = Utc::now() + max_processing_time;
    for plan in &claimed {
        sqlx::query("UPDATE dca_plans SET next_execution_at = $1 WHERE id = $2")
            .bind(sentinel)
            .bind(plan.id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(claimed)
}

/// Release or retry a claimed plan by moving its due time.
pub async fn reschedule_plan(pool: &PgPool, plan_id: i64, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE dca_plans SET next_execution_at = $1 WHERE id = $2")
        .bind(at)
        .bind(plan_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Finish one DCA execution: order + watch registration + counter bump +
/// next schedule, all in one transaction. The executed_count increment MUST
/// share the transaction with the order insert.
pub async fn complete_dca_execution(
    pool: &PgPool,
    plan: &DbDcaPlan,
    order: &NewOrder,
) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let order_id = insert_order(&mut *tx, order).await?;
    insert_watched_order(
        &mut *tx,
        &order.sideshift_order_id,
        &order.user_id,
        OrderStatus::Pending,
    )
    .await?;

    sqlx::query(
        "UPDATE dca_plans
         SET executed_count = executed_count + 1,
             next_execution_at = NOW() + make_interval(hours => interval_hours)
         WHERE id = $1",
    )
    .bind(plan.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(order_id)
}

// ── Limit orders ─────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn insert_limit_order(
    pool: &PgPool,
    user_id: &str,
    from_asset: &str,
    from_network: &str,
    to_asset: &str,
    to_network: &str,
    amount: Decimal,
    target_price: Decimal,
    condition: PriceCondition,
    reference_asset: &str,
    reference_chain: &str,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO limit_orders (user_id, from_asset, from_network, to_asset, to_network,
         amount, target_price, condition, reference_asset, reference_chain)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         RETURNING id",
    )
    .bind(user_id)
    .bind(from_asset)
    .bind(from_network)
    .bind(to_asset)
    .bind(to_network)
    .bind(amount)
    .bind(target_price)
    .bind(condition.as_str())
    .bind(reference_asset)
    .bind(reference_chain)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Armed limit orders whose retry window (if any) has elapsed.
pub async fn get_due_armed_limit_orders(pool: &PgPool) -> Result<Vec<DbLimitOrder>> {
    let rows = sqlx::query_as::<_, DbLimitOrder>(
        "SELECT * FROM limit_orders
         WHERE status = 'armed' AND (retry_after IS NULL OR retry_after <= NOW())
         ORDER BY created_at",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn mark_limit_triggered(pool: &PgPool, limit_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE limit_orders SET status = 'triggered', updated_at = NOW() WHERE id = $1",
    )
    .bind(limit_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a transient execution failure: bump the retry counter, schedule the
/// next attempt, and re-arm — or move to `dead` when the budget is spent.
pub async fn record_limit_failure(
    pool: &PgPool,
    limit_id: i64,
    retry_after: Option<DateTime<Utc>>,
    last_error: &str,
    dead: bool,
) -> Result<()> {
    let status = if dead { LimitStatus::Dead } else { LimitStatus::Armed };
    sqlx::query(
        "UPDATE limit_orders
         SET status = $1, retry_count = retry_count + 1, retry_after = $2,
             last_error = $3, updated_at = NOW()
         WHERE id = $4",
    )
    .bind(status.as_str())
    .bind(retry_after)
    .bind(last_error)
    .bind(limit_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Permanent upstream rejection: the order can never execute as written.
pub async fn mark_limit_failed(pool: &PgPool, limit_id: i64, last_error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE limit_orders SET status = 'failed', last_error = $1, updated_at = NOW()
         WHERE id = $2",
    )
    .bind(last_error)
    .bind(limit_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Finish a triggered limit order: order insert + watch registration + state
/// move to `executing`, all in one transaction.
pub async fn complete_limit_execution(
    pool: &PgPool,
    limit_id: i64,
    order: &NewOrder,
) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let order_id = insert_order(&mut *tx, order).await?;
    insert_watched_order(
        &mut *tx,
        &order.sideshift_order_id,
        &order.user_id,
        OrderStatus::Pending,
    )
    .await?;

    sqlx::query(
        "UPDATE limit_orders SET status = 'executing', retry_after = NULL, updated_at = NOW()
         WHERE id = $1",
    )
    .bind(limit_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(order_id)
}

// ── Price snapshots ──────────────────────────────────────────────

pub async fn upsert_price_snapshot(
    pool: &PgPool,
    asset: &str,
    chain: &str,
    price: Decimal,
    ttl: Duration,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO price_snapshots (asset, chain, price, updated_at, expires_at)
         VALUES ($1, $2, $3, NOW(), NOW() + make_interval(secs => $4))
         ON CONFLICT (asset, chain)
         DO UPDATE SET price = EXCLUDED.price, updated_at = EXCLUDED.updated_at,
                       expires_at = EXCLUDED.expires_at",
    )
    .bind(asset)
    .bind(chain)
    .bind(price)
    .bind(ttl.num_seconds() as f64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_price_snapshot(
    pool: &PgPool,
    asset: &str,
    chain: &str,
) -> Result<Option<DbPriceSnapshot>> {
    let row = sqlx::query_as::<_, DbPriceSnapshot>(
        "SELECT * FROM price_snapshots WHERE asset = $1 AND chain = $2",
    )
    .bind(asset)
    .bind(chain)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Distinct (asset, chain) pairs the refresher must keep fresh.
pub async fn get_active_reference_pairs(pool: &PgPool) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT DISTINCT reference_asset, reference_chain
         FROM limit_orders WHERE status = 'armed'",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ── Users and settings ───────────────────────────────────────────

pub async fn get_user(pool: &PgPool, user_id: &str) -> Result<Option<DbUser>> {
    let row = sqlx::query_as::<_, DbUser>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_user_settings(pool: &PgPool, user_id: &str) -> Result<Option<DbUserSettings>> {
    let row =
        sqlx::query_as::<_, DbUserSettings>("SELECT * FROM user_settings WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(row)
}

// ── Conversations and chat ───────────────────────────────────────

/// Outcome of a compare-and-swap conversation update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// New version after the write.
    Applied(i64),
    /// Caller's expected version was stale; current version attached.
    Conflict(i64),
}

/// Append a chat message and advance the per-user conversation state under a
/// row lock. When `expected_version` is supplied the update is a
/// compare-and-swap: a mismatch rolls back and reports the current version so
/// the caller can re-read and retry.
pub async fn append_chat_message(
    pool: &PgPool,
    user_id: &str,
    role: &str,
    content: &str,
    state: &serde_json::Value,
    expected_version: Option<i64>,
) -> Result<CasOutcome> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO conversations (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    let current: i64 = sqlx::query_scalar(
        "SELECT version FROM conversations WHERE user_id = $1 FOR UPDATE",
    )
    .bind(user_id)
    .fetch_one(&mut *tx)
    .await?;

    if let Some(expected) = expected_version {
        if expected != current {
            tx.rollback().await?;
            return Ok(CasOutcome::Conflict(current));
        }
    }

    sqlx::query("INSERT INTO chat_messages (user_id, role, content) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(role)
        .bind(content)
        .execute(&mut *tx)
        .await?;

    let next = current + 1;
    sqlx::query(
        "UPDATE conversations SET state = $1, version = $2, updated_at = NOW() WHERE user_id = $3",
    )
    .bind(state)
    .bind(next)
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(CasOutcome::Applied(next))
}

// ── Coin ledger (admin test credits) ─────────────────────────────

/// Result of an admin balance adjustment.
#[derive(Debug, Clone)]
pub struct CoinAdjustment {
    pub new_balance: Decimal,
    pub logged_amount: Decimal,
}

/// Apply a gift/deduct/reset to one user's test-credit balance. Balance
/// mutation, ledger row, and audit row commit together or not at all.
/// Returns None when the target user does not exist.
pub async fn adjust_coin_balance(
    pool: &PgPool,
    admin_id: &str,
    target_user_id: &str,
    action: &str,
    amount: Decimal,
    note: Option<&str>,
) -> Result<Option<CoinAdjustment>> {
    let mut tx = pool.begin().await?;

    let balance: Option<Decimal> =
        sqlx::query_scalar("SELECT coin_balance FROM users WHERE id = $1 FOR UPDATE")
            .bind(target_user_id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some(balance) = balance else {
        tx.rollback().await?;
        return Ok(None);
    };

    // The ledger invariant: signed ledger amounts sum to balance − initial.
    // A reset therefore logs the balance it wiped, as a deduction-sized row.
    let (new_balance, logged_amount) = match action {
        "gift" => (balance + amount, amount),
        "deduct" => {
            if amount > balance {
                tx.rollback().await?;
                return Err(SwapError::validation(
                    "deduction exceeds current balance",
                    vec!["amount"],
                ));
            }
            (balance - amount, amount)
        }
        "reset" => (Decimal::ZERO, balance),
        other => {
            tx.rollback().await?;
            return Err(SwapError::validation(
                format!("unknown action: {other}"),
                vec!["action"],
            ));
        }
    };

    sqlx::query("UPDATE users SET coin_balance = $1 WHERE id = $2")
        .bind(new_balance)
        .bind(target_user_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO coin_gift_logs (admin_id, target_user_id, action, amount, note)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(admin_id)
    .bind(target_user_id)
    .bind(action)
    .bind(logged_amount)
    .bind(note)
    .execute(&mut *tx)
    .await?;

    insert_admin_audit(
        &mut *tx,
        admin_id,
        "coins.adjust",
        serde_json::json!({
            "target": target_user_id,
            "action": action,
            "amount": amount.to_string(),
        }),
    )
    .await?;

    tx.commit().await?;
    Ok(Some(CoinAdjustment {
        new_balance,
        logged_amount,
    }))
}

/// Gift every user the same amount in a single transaction.
pub async fn gift_all_users(
    pool: &PgPool,
    admin_id: &str,
    amount: Decimal,
    note: Option<&str>,
) -> Result<u64> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query("UPDATE users SET coin_balance = coin_balance + $1")
        .bind(amount)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    sqlx::query(
        "INSERT INTO coin_gift_logs (admin_id, target_user_id, action, amount, note)
         SELECT $1, id, 'gift', $2, $3 FROM users",
    )
    .bind(admin_id)
    .bind(amount)
    .bind(note)
    .execute(&mut *tx)
    .await?;

    insert_admin_audit(
        &mut *tx,
        admin_id,
        "coins.gift_all",
        serde_json::json!({ "amount": amount.to_string(), "users": updated }),
    )
    .await?;

    tx.commit().await?;
    Ok(updated)
}

/// Global supply overview for the admin dashboard.
pub async fn coin_stats(pool: &PgPool) -> Result<(i64, Decimal, Decimal)> {
    let (users, supply): (i64, Option<Decimal>) =
        sqlx::query_as("SELECT COUNT(*), SUM(coin_balance) FROM users")
            .fetch_one(pool)
            .await?;
    let gifted: Option<Decimal> = sqlx::query_scalar(
        "SELECT SUM(amount) FROM coin_gift_logs WHERE action = 'gift'",
    )
    .fetch_one(pool)
    .await?;
    Ok((
        users,
        supply.unwrap_or(Decimal::ZERO),
        gifted.unwrap_or(Decimal::ZERO),
    ))
}

pub async fn insert_admin_audit(
    conn: &mut PgConnection,
    admin_id: &str,
    action: &str,
    detail: serde_json::Value,
) -> Result<()> {
    sqlx::query("INSERT INTO admin_audit_log (admin_id, action, detail) VALUES ($1, $2, $3)")
        .bind(admin_id)
        .bind(action)
        .bind(detail)
        .execute(conn)
        .await?;
    Ok(())
}
