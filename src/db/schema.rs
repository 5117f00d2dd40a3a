//! PostgreSQL schema for the cash-in and risk-control tables

use sqlx::PgPool;

/// Create every table and index if missing
pub async fn init_schema(pool: &PgPool) -> anyhow::Result<()> {
    tracing::info!("Initializing PostgreSQL schema...");

    for (name, ddl) in TABLES {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", name, e))?;
    }

    tracing::info!("PostgreSQL schema initialized successfully");
    Ok(())
}

const TABLES: &[(&str, &str)] = &[
    ("cash_in_txs", CREATE_CASH_IN_TXS),
    ("cash_in_txs.gates_claimed", ADD_GATES_CLAIMED),
    ("cash_in_txs_customer_created_idx", CREATE_CUSTOMER_CREATED_INDEX),
    ("cash_in_txs_to_address_idx", CREATE_TO_ADDRESS_INDEX),
    ("bills", CREATE_BILLS),
    ("cash_in_actions", CREATE_CASH_IN_ACTIONS),
    ("blacklist", CREATE_BLACKLIST),
    ("btm_whitelists", CREATE_WHITELISTS),
    ("btm_risk_control_role_limits", CREATE_ROLE_LIMITS),
    ("btm_risk_control_customer_limit_settings", CREATE_LIMIT_SETTINGS),
    ("btm_change_logs", CREATE_CHANGE_LOGS),
    ("btm_invoices", CREATE_INVOICES),
    ("btm_risk_control_evaluation_logs", CREATE_EVALUATION_LOGS),
];

const CREATE_CASH_IN_TXS: &str = r#"
CREATE TABLE IF NOT EXISTS cash_in_txs (
    id UUID PRIMARY KEY,
    customer_id UUID NOT NULL,
    device_id UUID NOT NULL,
    to_address TEXT NOT NULL,
    crypto_code TEXT NOT NULL,
    fiat_code TEXT NOT NULL,
    fiat NUMERIC(14, 5) NOT NULL DEFAULT 0,
    crypto_atoms NUMERIC(30) NOT NULL DEFAULT 0,
    commission_percentage NUMERIC(14, 5) NOT NULL DEFAULT 0,
    send BOOLEAN NOT NULL DEFAULT false,
    send_confirmed BOOLEAN NOT NULL DEFAULT false,
    send_pending BOOLEAN NOT NULL DEFAULT false,
    batched BOOLEAN NOT NULL DEFAULT false,
    operator_completed BOOLEAN NOT NULL DEFAULT false,
    gates_claimed BOOLEAN NOT NULL DEFAULT false,
    compliance_cleared BOOLEAN NOT NULL DEFAULT false,
    error TEXT,
    error_code TEXT,
    tx_hash TEXT,
    fee NUMERIC(30),
    wallet_score INTEGER,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    send_time TIMESTAMPTZ,
    confirmed_at TIMESTAMPTZ
)
"#;

// Ledger window sums
/// Tables created before the gates claim existed
const ADD_GATES_CLAIMED: &str =
    "ALTER TABLE cash_in_txs ADD COLUMN IF NOT EXISTS gates_claimed BOOLEAN NOT NULL DEFAULT false";

const CREATE_CUSTOMER_CREATED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS cash_in_txs_customer_created_idx
    ON cash_in_txs (customer_id, created)
"#;

// Address reuse lookups
const CREATE_TO_ADDRESS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS cash_in_txs_to_address_idx
    ON cash_in_txs (to_address)
"#;

const CREATE_BILLS: &str = r#"
CREATE TABLE IF NOT EXISTS bills (
    id UUID PRIMARY KEY,
    cash_in_txs_id UUID NOT NULL REFERENCES cash_in_txs (id),
    fiat NUMERIC(14, 5) NOT NULL,
    fiat_code TEXT NOT NULL,
    crypto_atoms NUMERIC(30) NOT NULL,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_CASH_IN_ACTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS cash_in_actions (
    id BIGSERIAL PRIMARY KEY,
    tx_id UUID NOT NULL REFERENCES cash_in_txs (id),
    action TEXT NOT NULL,
    error TEXT,
    error_code TEXT,
    tx_hash TEXT,
    created TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_BLACKLIST: &str = r#"
CREATE TABLE IF NOT EXISTS blacklist (
    address TEXT NOT NULL,
    crypto_code TEXT NOT NULL,
    content TEXT,
    PRIMARY KEY (address, crypto_code)
)
"#;

const CREATE_WHITELISTS: &str = r#"
CREATE TABLE IF NOT EXISTS btm_whitelists (
    id BIGSERIAL PRIMARY KEY,
    customer_id UUID NOT NULL,
    address TEXT NOT NULL,
    crypto_code TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    deleted_at TIMESTAMPTZ
)
"#;

const CREATE_ROLE_LIMITS: &str = r#"
CREATE TABLE IF NOT EXISTS btm_risk_control_role_limits (
    role SMALLINT PRIMARY KEY,
    daily_limit NUMERIC(14, 2) NOT NULL,
    monthly_limit NUMERIC(14, 2) NOT NULL,
    level1 NUMERIC(14, 2) NOT NULL,
    level1_days INTEGER NOT NULL,
    level2 NUMERIC(14, 2) NOT NULL,
    level2_days INTEGER NOT NULL
)
"#;

const CREATE_LIMIT_SETTINGS: &str = r#"
CREATE TABLE IF NOT EXISTS btm_risk_control_customer_limit_settings (
    customer_id UUID PRIMARY KEY,
    role SMALLINT NOT NULL DEFAULT 2,
    daily_limit NUMERIC(14, 2),
    monthly_limit NUMERIC(14, 2),
    level1 NUMERIC(14, 2),
    level1_days INTEGER,
    level2 NUMERIC(14, 2),
    level2_days INTEGER,
    last_black_to_normal_at TIMESTAMPTZ,
    edd_type TEXT,
    is_edd BOOLEAN NOT NULL DEFAULT false,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_CHANGE_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS btm_change_logs (
    id BIGSERIAL PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    deleted_at TIMESTAMPTZ,
    operation_user_id BIGINT NOT NULL,
    table_name TEXT NOT NULL,
    operation_type SMALLINT NOT NULL,
    customer_id UUID NOT NULL,
    before_value JSONB NOT NULL,
    after_value JSONB NOT NULL
)
"#;

const CREATE_INVOICES: &str = r#"
CREATE TABLE IF NOT EXISTS btm_invoices (
    id BIGSERIAL PRIMARY KEY,
    customer_id UUID NOT NULL,
    tx_id UUID NOT NULL,
    invoice_no TEXT,
    invoice_date DATE,
    random_number TEXT,
    raw_resp JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_EVALUATION_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS btm_risk_control_evaluation_logs (
    id BIGSERIAL PRIMARY KEY,
    customer_id UUID NOT NULL,
    tx_id UUID NOT NULL,
    daily_add_tx NUMERIC(14, 2) NOT NULL,
    monthly_add_tx NUMERIC(14, 2) NOT NULL,
    now_limit_config JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;
