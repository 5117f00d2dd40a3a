//! BTM Server - operator binary
//!
//! ```text
//! btm-server [--env dev] [--init-schema] [--customer <uuid> [--cib-expiry YYYMMDD]]
//! ```
//!
//! `--init-schema` creates missing tables. `--customer` prints a dry-run
//! risk assessment for one customer (effective limits, window starts,
//! rolling sums, breaches) as JSON on stdout. Nothing is written.

use std::sync::Arc;

use anyhow::Context;

use btm_server::clock::{Clock, SystemClock};
use btm_server::config::AppConfig;
use btm_server::core_types::CustomerId;
use btm_server::db::Database;
use btm_server::risk::{
    CustomerLimitSetting, LimitPolicyResolver, RiskAssessor, RiskStore, SuspensionScheduler,
};
use btm_server::store::PgStore;

fn get_arg(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| names.contains(&a.as_str()))
        .and_then(|i| args.get(i + 1).cloned())
}

fn has_flag(name: &str) -> bool {
    std::env::args().any(|a| a == name)
}

fn get_env() -> String {
    get_arg(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = btm_server::logging::init_logging(&app_config);

    tracing::info!("Starting btm-server in {} mode", env);

    let postgres_url = app_config
        .postgres_url
        .as_deref()
        .context("postgres_url is not configured")?;
    let db = Database::connect(postgres_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.health_check().await?;

    if has_flag("--init-schema") {
        db.init_schema().await?;
    }

    let Some(raw_customer) = get_arg(&["--customer"]) else {
        tracing::info!("No --customer given, nothing to assess");
        return Ok(());
    };
    let customer_id: CustomerId = raw_customer
        .parse()
        .with_context(|| format!("Invalid customer id: {}", raw_customer))?;
    let cib_expiry = get_arg(&["--cib-expiry"])
        .map(|raw| {
            raw.parse::<u32>()
                .with_context(|| format!("Invalid --cib-expiry: {}", raw))
        })
        .transpose()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(
        PgStore::new(db.pool().clone(), clock.clone())
            .with_pending_interval(app_config.pending_interval()),
    );

    // Dry run: an absent row is assessed as the default it would be created with
    let setting = store
        .get_limit_setting(customer_id)
        .await?
        .unwrap_or_else(|| CustomerLimitSetting::new_default(customer_id));

    let assessor = RiskAssessor::new(
        store.clone(),
        LimitPolicyResolver::new(store.clone(), app_config.risk.policy_floor),
        SuspensionScheduler::new(app_config.calendar()),
    );
    let assessment = assessor.assess(&setting, cib_expiry, clock.now()).await?;

    tracing::info!(
        customer_id = %customer_id,
        daily_breach = assessment.daily_breach,
        monthly_breach = assessment.monthly_breach,
        edd = ?assessment.edd_breaches,
        "Dry-run assessment complete"
    );
    println!("{}", serde_json::to_string_pretty(&assessment)?);
    Ok(())
}
