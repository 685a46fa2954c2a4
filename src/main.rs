use portable_atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use zcal::config::{AppConfig, RunMode};
use zcal::db::{self, DbPool};
use zcal::errors::{CalibError, CalibResult};
use zcal::features::{moving_average, rolling_features};
use zcal::instrument::{feature_timestamp_ms, inverse_time_to_expiry, Instrument};
use zcal::models::calibration::{calibrate_z, compare_strategies, next_seed, CalibrationOptions};
use zcal::state::{
    CalibrationResult, DbCommand, Method, PriceObservation, PricingQuery, RunCounters, SettlementPeriod, TradeRecord,
};

const HOURLY: &str = "hourly";
const DAILY: &str = "daily";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("zcal batch runner starting");

    let cfg = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    let db_pool = match db::init_db(&cfg.data_dir) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("database init error: {e}");
            std::process::exit(1);
        }
    };

    let (db_tx, db_rx) = mpsc::channel::<DbCommand>(1024);
    let counters = Arc::new(RunCounters::new());

    // Single writer owns all inserts for the rest of the run.
    let writer = tokio::spawn(db::run_db_writer(db_pool.clone(), db_rx));

    // ── Phase 1: rolling features ──
    let mut jobs: Vec<(String, JoinHandle<CalibResult<usize>>)> = Vec::new();
    let plan = [
        (HOURLY, &cfg.hourly_windows, &cfg.hourly_moving_average_windows),
        (DAILY, &cfg.daily_windows, &cfg.daily_moving_average_windows),
    ];
    for (series, windows, ma_windows) in plan {
        let observations = match db::load_series(&db_pool, series) {
            Ok(obs) => Arc::new(obs),
            Err(e) => {
                tracing::error!(series, "failed to load series: {e}");
                counters.jobs_failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        tracing::info!(series, samples = observations.len(), "series loaded");

        for &window in windows.iter() {
            let handle = spawn_trend_job(series, window, observations.clone(), db_tx.clone(), counters.clone());
            jobs.push((format!("trend {series}/{window}"), handle));
        }
        for &window in ma_windows.iter() {
            let handle = spawn_moving_average_job(series, window, observations.clone(), db_tx.clone());
            jobs.push((format!("sma {series}/{window}"), handle));
        }
    }

    let (labels, handles): (Vec<_>, Vec<_>) = jobs.into_iter().unzip();
    let outcomes = futures_util::future::join_all(handles).await;
    for (label, outcome) in labels.iter().zip(outcomes) {
        match outcome {
            Ok(Ok(rows)) => tracing::info!(job = %label, rows, "feature job done"),
            Ok(Err(e)) => {
                tracing::error!(job = %label, "feature job aborted: {e}");
                counters.jobs_failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(job = %label, "feature job panicked: {e}");
                counters.jobs_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // Covariate lookups read trend rows, so phase 1 must be on disk first.
    if let Err(e) = flush_writer(&db_tx).await {
        tracing::error!("writer flush failed: {e}");
    }

    // ── Phase 2: trade calibration ──
    if let Err(e) = calibrate_trades(&cfg, &db_pool, db_tx.clone(), counters.clone()).await {
        tracing::error!("trade calibration stopped: {e}");
        counters.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    // Closing the last sender lets the writer drain and exit.
    drop(db_tx);
    if let Err(e) = writer.await {
        tracing::error!("db writer task failed: {e}");
    }

    match serde_json::to_string(&counters.summary()) {
        Ok(json) => tracing::info!(summary = %json, "run complete"),
        Err(e) => tracing::error!("failed to serialize run summary: {e}"),
    }
}

async fn flush_writer(tx: &mpsc::Sender<DbCommand>) -> CalibResult<()> {
    let (reply, ack) = oneshot::channel();
    tx.send(DbCommand::Flush { reply })
        .await
        .map_err(|e| CalibError::ChannelClosed(e.to_string()))?;
    ack.await.map_err(|e| CalibError::ChannelClosed(e.to_string()))
}

fn spawn_trend_job(
    series: &'static str,
    window: usize,
    observations: Arc<Vec<PriceObservation>>,
    tx: mpsc::Sender<DbCommand>,
    counters: Arc<RunCounters>,
) -> JoinHandle<CalibResult<usize>> {
    tokio::task::spawn_blocking(move || {
        let prices: Vec<f64> = observations.iter().map(|o| o.price).collect();
        // All-or-nothing: a domain error leaves no partial rows for this job.
        let results = rolling_features(&prices, window)?;
        for r in &results {
            tx.blocking_send(DbCommand::UpsertTrend {
                series: series.to_string(),
                window,
                seq: observations[r.index].seq,
                slope: r.slope,
                dispersion: r.dispersion,
            })
            .map_err(|e| CalibError::ChannelClosed(e.to_string()))?;
            counters.windows_computed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(results.len())
    })
}

fn spawn_moving_average_job(
    series: &'static str,
    window: usize,
    observations: Arc<Vec<PriceObservation>>,
    tx: mpsc::Sender<DbCommand>,
) -> JoinHandle<CalibResult<usize>> {
    tokio::task::spawn_blocking(move || {
        let prices: Vec<f64> = observations.iter().map(|o| o.price).collect();
        let averages = moving_average(&prices, window)?;
        for (obs, value) in observations.iter().zip(averages.iter()) {
            tx.blocking_send(DbCommand::UpsertMovingAverage {
                series: series.to_string(),
                window,
                seq: obs.seq,
                value: *value,
            })
            .map_err(|e| CalibError::ChannelClosed(e.to_string()))?;
        }
        Ok(averages.len())
    })
}

async fn calibrate_trades(
    cfg: &AppConfig,
    db: &DbPool,
    tx: mpsc::Sender<DbCommand>,
    counters: Arc<RunCounters>,
) -> CalibResult<()> {
    let trades = db::load_uncalibrated_trades(db)?;
    if trades.is_empty() {
        tracing::info!("no uncalibrated trades");
        return Ok(());
    }
    tracing::info!(count = trades.len(), mode = ?cfg.mode, "calibrating trades");

    let mode = cfg.mode;
    let options = cfg.calibration_options().validated()?;

    // Sequential: each trade's seed depends on the previous result.
    let db = db.clone();
    let handle =
        tokio::task::spawn_blocking(move || calibrate_trade_batch(&db, &trades, mode, options, &tx, &counters));
    handle
        .await
        .map_err(|e| CalibError::Task(format!("calibration: {e}")))?
}

struct PreparedTrade {
    strike: f64,
    query: PricingQuery,
    inv_t: Option<f64>,
    period: Option<SettlementPeriod>,
}

fn prepare_trade(trade: &TradeRecord) -> Option<PreparedTrade> {
    let instrument = match Instrument::parse(&trade.instrument_name) {
        Ok(i) => i,
        Err(e) => {
            tracing::warn!(trade_id = %trade.trade_id, "skipping trade: {e}");
            return None;
        }
    };
    let query = match PricingQuery::from_trade(trade.price, trade.index_price, instrument.strike) {
        Ok(q) => q,
        Err(e) => {
            tracing::warn!(trade_id = %trade.trade_id, "skipping trade: {e}");
            return None;
        }
    };
    let inv_t = match (trade.creation_timestamp_ms, instrument.expiration_timestamp_ms()) {
        (Some(created), Some(expires)) => inverse_time_to_expiry(trade.timestamp_ms, created, expires),
        _ => None,
    };
    Some(PreparedTrade {
        strike: instrument.strike,
        query,
        inv_t,
        period: trade.settlement_period,
    })
}

/// Attaches E1/E2 from both feature windows of the trade's settlement
/// period. Returns how many covariates were found.
fn attach_covariates(
    db: &DbPool,
    trade: &TradeRecord,
    period: SettlementPeriod,
    tx: &mpsc::Sender<DbCommand>,
) -> CalibResult<usize> {
    let Some(ts) = feature_timestamp_ms(period, trade.timestamp_ms) else {
        tracing::debug!(trade_id = %trade.trade_id, "trade timestamp out of range");
        return Ok(0);
    };
    let (series, windows) = period.covariate_source();
    let mut attached = 0;
    for window in windows {
        match db::lookup_trend(db, series, window, ts)? {
            Some((slope, dispersion)) => {
                tx.blocking_send(DbCommand::UpsertCovariate {
                    trade_id: trade.trade_id.clone(),
                    series: series.to_string(),
                    window,
                    slope,
                    dispersion,
                })
                .map_err(|e| CalibError::ChannelClosed(e.to_string()))?;
                attached += 1;
            }
            None => tracing::debug!(trade_id = %trade.trade_id, series, window, ts, "no feature row"),
        }
    }
    Ok(attached)
}

fn calibrate_trade_batch(
    db: &DbPool,
    trades: &[TradeRecord],
    mode: RunMode,
    mut options: CalibrationOptions,
    tx: &mpsc::Sender<DbCommand>,
    counters: &RunCounters,
) -> CalibResult<()> {
    for (n, trade) in trades.iter().enumerate() {
        let Some(prepared) = prepare_trade(trade) else {
            counters.trades_skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        let results: Vec<CalibrationResult> = match mode {
            RunMode::Single(_) => {
                let result = calibrate_z(&prepared.query, &options)?;
                options.seed = next_seed(&result);
                vec![result]
            }
            RunMode::Compare => {
                let comparison = compare_strategies(&prepared.query, &options)?;
                if let Some(newton) = comparison.get(Method::Newton) {
                    options.seed = next_seed(newton);
                }
                comparison.results.into_vec()
            }
        };

        for result in results {
            if !result.is_solved() {
                counters.no_solutions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(trade_id = %trade.trade_id, method = %result.method, "no solution");
            }
            tx.blocking_send(DbCommand::UpsertCalibration {
                trade_id: trade.trade_id.clone(),
                strike: prepared.strike,
                x: prepared.query.x,
                y: prepared.query.y,
                inv_t: prepared.inv_t,
                method: result.method,
                z: result.z,
                residual: result.residual,
            })
            .map_err(|e| CalibError::ChannelClosed(e.to_string()))?;
        }
        counters.trades_calibrated.fetch_add(1, Ordering::Relaxed);

        if let Some(period) = prepared.period {
            let attached = attach_covariates(db, trade, period, tx)?;
            counters.covariates_attached.fetch_add(attached as u64, Ordering::Relaxed);
        }

        if (n + 1) % 1000 == 0 {
            tracing::info!(done = n + 1, total = trades.len(), "calibration progress");
        }
    }
    Ok(())
}
