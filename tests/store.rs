use tokio::sync::{mpsc, oneshot};
use zcal::db;
use zcal::state::{DbCommand, Method, PriceObservation, SettlementPeriod, TradeRecord};
use zcal::instrument::feature_timestamp_ms;
use zcal::{calibrate_z, rolling_features, CalibrationOptions, Instrument, PricingQuery};

#[tokio::test]
async fn writer_persists_features_and_calibrations() {
    let pool = db::open_in_memory().unwrap();

    for seq in 0..10 {
        let obs = PriceObservation { seq, price: 100.0 * (0.02 * seq as f64).exp() };
        db::insert_observation(&pool, "daily", obs, Some(seq * 86_400_000)).unwrap();
    }
    db::insert_trade(
        &pool,
        &TradeRecord {
            trade_id: "t1".into(),
            instrument_name: "BTC-23DEC24-95500-C".into(),
            price: 0.05,
            index_price: 96_000.0,
            timestamp_ms: 1_733_000_000_000,
            creation_timestamp_ms: Some(1_730_000_000_000),
            settlement_period: Some(SettlementPeriod::Month),
        },
    )
    .unwrap();

    let (tx, rx) = mpsc::channel::<DbCommand>(16);
    let writer = tokio::spawn(db::run_db_writer(pool.clone(), rx));

    let series = db::load_series(&pool, "daily").unwrap();
    let prices: Vec<f64> = series.iter().map(|o| o.price).collect();
    for r in rolling_features(&prices, 4).unwrap() {
        assert!((r.slope - 0.02).abs() < 1e-12);
        tx.send(DbCommand::UpsertTrend {
            series: "daily".into(),
            window: 4,
            seq: series[r.index].seq,
            slope: r.slope,
            dispersion: r.dispersion,
        })
        .await
        .unwrap();
    }

    let trades = db::load_uncalibrated_trades(&pool).unwrap();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    let inst = Instrument::parse(&trade.instrument_name).unwrap();
    let query = PricingQuery::from_trade(trade.price, trade.index_price, inst.strike).unwrap();
    let result = calibrate_z(&query, &CalibrationOptions::default()).unwrap();
    tx.send(DbCommand::UpsertCalibration {
        trade_id: trade.trade_id.clone(),
        strike: inst.strike,
        x: query.x,
        y: query.y,
        inv_t: Some(2.0),
        method: result.method,
        z: result.z,
        residual: result.residual,
    })
    .await
    .unwrap();

    drop(tx);
    writer.await.unwrap();

    assert_eq!(db::count_rows(&pool, "trend_features").unwrap(), 7);
    assert!(db::load_uncalibrated_trades(&pool).unwrap().is_empty());
    let row = db::get_calibration(&pool, "t1", result.method.as_str()).unwrap().expect("stored");
    assert_eq!(row.z, result.z);
    assert_eq!(row.inv_t, Some(2.0));
    assert!(matches!(result.method, Method::Newton | Method::Bisection));
}

#[tokio::test]
async fn flushed_features_join_onto_day_option_trades() {
    let pool = db::open_in_memory().unwrap();
    let hour = 3_600_000_i64;
    // 2024-05-01 00:00 UTC.
    let start = 1_714_521_600_000_i64;
    for seq in 0..80 {
        let obs = PriceObservation { seq, price: 60_000.0 * (0.001 * seq as f64).exp() };
        db::insert_observation(&pool, "hourly", obs, Some(start + seq * hour)).unwrap();
    }

    let (tx, rx) = mpsc::channel::<DbCommand>(256);
    let writer = tokio::spawn(db::run_db_writer(pool.clone(), rx));

    let series = db::load_series(&pool, "hourly").unwrap();
    let prices: Vec<f64> = series.iter().map(|o| o.price).collect();
    for window in [24, 72] {
        for r in rolling_features(&prices, window).unwrap() {
            tx.send(DbCommand::UpsertTrend {
                series: "hourly".into(),
                window,
                seq: series[r.index].seq,
                slope: r.slope,
                dispersion: r.dispersion,
            })
            .await
            .unwrap();
        }
    }
    let (reply, ack) = oneshot::channel();
    tx.send(DbCommand::Flush { reply }).await.unwrap();
    ack.await.unwrap();

    // Trade at 75h40m rounds to the 76h row, which both windows cover.
    let trade_ms = start + 75 * hour + 40 * 60_000;
    let ts = feature_timestamp_ms(SettlementPeriod::Day, trade_ms).unwrap();
    assert_eq!(ts, start + 76 * hour);
    let (series_name, windows) = SettlementPeriod::Day.covariate_source();
    for window in windows {
        let (slope, dispersion) = db::lookup_trend(&pool, series_name, window, ts)
            .unwrap()
            .unwrap_or_else(|| panic!("no {series_name}/{window} feature at {ts}"));
        assert!((slope - 0.001).abs() < 1e-12, "window {window}: slope {slope}");
        assert!(dispersion > 0.0, "window {window}: dispersion {dispersion}");
        tx.send(DbCommand::UpsertCovariate {
            trade_id: "d1".into(),
            series: series_name.to_string(),
            window,
            slope,
            dispersion,
        })
        .await
        .unwrap();
    }

    // The 72h window has no row before index 71.
    let early = start + 30 * hour;
    assert!(db::lookup_trend(&pool, "hourly", 24, early).unwrap().is_some());
    assert!(db::lookup_trend(&pool, "hourly", 72, early).unwrap().is_none());

    drop(tx);
    writer.await.unwrap();
    assert_eq!(db::count_rows(&pool, "trade_covariates").unwrap(), 2);
}
