use crate::errors::{CalibError, CalibResult};
use crate::state::{DbCommand, PriceObservation, SettlementPeriod, TradeRecord};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type DbPool = Arc<Mutex<Connection>>;

pub fn init_db(data_dir: &Path) -> CalibResult<DbPool> {
    std::fs::create_dir_all(data_dir).map_err(|e| CalibError::Database(format!("create dir: {e}")))?;
    let db_path = data_dir.join("zcal.db");
    let conn = Connection::open(&db_path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA cache_size=-64000;")?;
    apply_schema(&conn)?;

    tracing::info!("database initialized at {}", db_path.display());
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory store with the same schema.
pub fn open_in_memory() -> CalibResult<DbPool> {
    let conn = Connection::open_in_memory()?;
    apply_schema(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn apply_schema(conn: &Connection) -> CalibResult<()> {
    conn.execute_batch(include_str!("../migrations/001_init.sql"))?;
    Ok(())
}

/// Dedicated DB writer task. Reads commands from the bounded channel and
/// executes them; the only task that writes while the runner is active.
pub async fn run_db_writer(db: DbPool, mut rx: mpsc::Receiver<DbCommand>) {
    tracing::info!("db writer task started");

    let mut written = 0u64;
    while let Some(cmd) = rx.recv().await {
        match execute_command(&db, cmd) {
            Ok(()) => written += 1,
            Err(e) => tracing::error!("db write error: {e}"),
        }
    }

    tracing::info!(written, "db writer task shutting down");
}

pub fn execute_command(db: &DbPool, cmd: DbCommand) -> CalibResult<()> {
    let conn = db.lock().map_err(|e| CalibError::Database(format!("lock poisoned: {e}")))?;

    match cmd {
        DbCommand::UpsertTrend { series, window, seq, slope, dispersion } => {
            conn.execute(
                "INSERT OR REPLACE INTO trend_features (series, window_len, seq, slope, dispersion)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![series, window as i64, seq, slope, dispersion],
            )?;
        }
        DbCommand::UpsertMovingAverage { series, window, seq, value } => {
            conn.execute(
                "INSERT OR REPLACE INTO moving_averages (series, window_len, seq, value)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![series, window as i64, seq, value],
            )?;
        }
        DbCommand::UpsertCovariate { trade_id, series, window, slope, dispersion } => {
            conn.execute(
                "INSERT OR REPLACE INTO trade_covariates (trade_id, series, window_len, slope, dispersion)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![trade_id, series, window as i64, slope, dispersion],
            )?;
        }
        DbCommand::Flush { reply } => {
            let _ = reply.send(());
        }
        DbCommand::UpsertCalibration { trade_id, strike, x, y, inv_t, method, z, residual } => {
            conn.execute(
                "INSERT OR REPLACE INTO calibrations (trade_id, method, strike, x, y, inv_t, z, residual)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![trade_id, method.as_str(), strike, x, y, inv_t, z, residual],
            )?;
        }
    }
    Ok(())
}

// ── Loaders (run before the writer starts) ──

pub fn load_series(db: &DbPool, series: &str) -> CalibResult<Vec<PriceObservation>> {
    let conn = db.lock().map_err(|e| CalibError::Database(format!("lock: {e}")))?;
    let mut stmt = conn.prepare("SELECT seq, price FROM price_series WHERE series = ?1 ORDER BY seq ASC")?;
    let rows = stmt.query_map(rusqlite::params![series], |row| {
        Ok(PriceObservation {
            seq: row.get(0)?,
            price: row.get(1)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(CalibError::from)
}

/// Trades with no stored calibration, oldest first.
pub fn load_uncalibrated_trades(db: &DbPool) -> CalibResult<Vec<TradeRecord>> {
    let conn = db.lock().map_err(|e| CalibError::Database(format!("lock: {e}")))?;
    let mut stmt = conn.prepare(
        "SELECT t.trade_id, t.instrument_name, t.price, t.index_price, t.timestamp_ms,
                t.creation_timestamp_ms, t.settlement_period
         FROM trades t
         WHERE NOT EXISTS (SELECT 1 FROM calibrations c WHERE c.trade_id = t.trade_id)
         ORDER BY t.timestamp_ms ASC, t.trade_id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let period: Option<String> = row.get(6)?;
        Ok(TradeRecord {
            trade_id: row.get(0)?,
            instrument_name: row.get(1)?,
            price: row.get(2)?,
            index_price: row.get(3)?,
            timestamp_ms: row.get(4)?,
            creation_timestamp_ms: row.get(5)?,
            settlement_period: period.and_then(|p| p.parse::<SettlementPeriod>().ok()),
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(CalibError::from)
}

/// E1/E2 of `series`/`window` on the feature row stamped `ts_ms`.
pub fn lookup_trend(db: &DbPool, series: &str, window: usize, ts_ms: i64) -> CalibResult<Option<(f64, f64)>> {
    let conn = db.lock().map_err(|e| CalibError::Database(format!("lock: {e}")))?;
    let row = conn
        .query_row(
            "SELECT tf.slope, tf.dispersion
             FROM trend_features tf
             JOIN price_series ps ON ps.series = tf.series AND ps.seq = tf.seq
             WHERE tf.series = ?1 AND tf.window_len = ?2 AND ps.ts = ?3",
            rusqlite::params![series, window as i64, ts_ms],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row)
}

// ── Ingest helpers ──

pub fn insert_observation(db: &DbPool, series: &str, obs: PriceObservation, ts: Option<i64>) -> CalibResult<()> {
    let conn = db.lock().map_err(|e| CalibError::Database(format!("lock: {e}")))?;
    conn.execute(
        "INSERT OR REPLACE INTO price_series (series, seq, ts, price) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![series, obs.seq, ts, obs.price],
    )?;
    Ok(())
}

pub fn insert_trade(db: &DbPool, trade: &TradeRecord) -> CalibResult<()> {
    let conn = db.lock().map_err(|e| CalibError::Database(format!("lock: {e}")))?;
    let period = trade.settlement_period.map(|p| p.as_str());
    conn.execute(
        "INSERT OR REPLACE INTO trades (trade_id, instrument_name, price, index_price, timestamp_ms, creation_timestamp_ms, settlement_period)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            trade.trade_id,
            trade.instrument_name,
            trade.price,
            trade.index_price,
            trade.timestamp_ms,
            trade.creation_timestamp_ms,
            period
        ],
    )?;
    Ok(())
}

// ── Read-back ──

#[derive(Debug, Clone, serde::Serialize)]
pub struct CalibrationRow {
    pub trade_id: String,
    pub method: String,
    pub inv_t: Option<f64>,
    pub z: Option<f64>,
    pub residual: Option<f64>,
}

pub fn get_calibration(db: &DbPool, trade_id: &str, method: &str) -> CalibResult<Option<CalibrationRow>> {
    let conn = db.lock().map_err(|e| CalibError::Database(format!("lock: {e}")))?;
    let row = conn
        .query_row(
            "SELECT trade_id, method, inv_t, z, residual FROM calibrations WHERE trade_id = ?1 AND method = ?2",
            rusqlite::params![trade_id, method],
            |row| {
                Ok(CalibrationRow {
                    trade_id: row.get(0)?,
                    method: row.get(1)?,
                    inv_t: row.get(2)?,
                    z: row.get(3)?,
                    residual: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn count_rows(db: &DbPool, table: &str) -> CalibResult<i64> {
    let table = match table {
        "price_series" | "trend_features" | "moving_averages" | "trades" | "calibrations" | "trade_covariates" => {
            table
        }
        other => return Err(CalibError::Database(format!("unknown table: {other}"))),
    };
    let conn = db.lock().map_err(|e| CalibError::Database(format!("lock: {e}")))?;
    let n = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(n)
}
