//! HTTP-level tests for the Binance futures source against a mock server

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use market_data::{
    BinanceFuturesClient, ContractType, InstrumentKey, Interval, MarketDataError,
    MarketDataSource, RetryPolicy, Timeframe,
};
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KLINES_PATH: &str = "/fapi/v1/continuousKlines";

fn timeframe() -> Timeframe {
    Timeframe::new(
        &InstrumentKey::new("BTCUSDT", ContractType::Perpetual),
        Interval::MINUTES_15,
        0.4,
    )
}

fn kline(open_ms: i64, close: &str) -> Value {
    json!([
        open_ms, "100.0", "101.0", "99.0", close, "10.0",
        open_ms + 15 * 60 * 1000 - 1, "1000.0", 12, "4.0", "400.0", "0"
    ])
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

fn client(server: &MockServer, max_retries: u32) -> BinanceFuturesClient {
    BinanceFuturesClient::new(2, fast_retry(max_retries))
        .unwrap()
        .with_base_url(server.uri())
}

#[tokio::test]
async fn test_fetch_bars_parses_closed_klines() {
    let server = MockServer::start().await;
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let t0 = start.timestamp_millis();

    Mock::given(method("GET"))
        .and(path(KLINES_PATH))
        .and(query_param("pair", "BTCUSDT"))
        .and(query_param("contractType", "PERPETUAL"))
        .and(query_param("interval", "15m"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([kline(t0, "100.5"), kline(t0 + 900_000, "100.7")])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let bars = client(&server, 2)
        .fetch_bars(&timeframe(), start, start + ChronoDuration::minutes(30))
        .await
        .unwrap();

    assert_eq!(bars.len(), 2);
    assert!(bars[0].open_time < bars[1].open_time);
    assert_eq!(bars[1].close.to_string(), "100.7");
    assert!(bars.iter().all(|b| b.validate().is_ok()));
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let server = MockServer::start().await;
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    Mock::given(method("GET"))
        .and(path(KLINES_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(KLINES_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([kline(start.timestamp_millis(), "100")])),
        )
        .mount(&server)
        .await;

    let source = client(&server, 2);
    let bars = source
        .fetch_bars(&timeframe(), start, start + ChronoDuration::minutes(15))
        .await
        .unwrap();

    assert_eq!(bars.len(), 1);
    let health = source.health().await;
    assert!(health.is_healthy);
    assert!(health.success_rate < 1.0);
}

#[tokio::test]
async fn test_used_weight_threshold_backs_off() {
    let server = MockServer::start().await;
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let body = json!([kline(start.timestamp_millis(), "100")]);

    Mock::given(method("GET"))
        .and(path(KLINES_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-mbx-used-weight-1m", "4500")
                .set_body_json(body.clone()),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(KLINES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;

    let bars = client(&server, 2)
        .fetch_bars(&timeframe(), start, start + ChronoDuration::minutes(15))
        .await
        .unwrap();
    assert_eq!(bars.len(), 1);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    Mock::given(method("GET"))
        .and(path(KLINES_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_string("{\"code\":-1121}"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, 3)
        .fetch_bars(&timeframe(), start, start + ChronoDuration::hours(1))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketDataError::Api { status: 400, .. }));
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    Mock::given(method("GET"))
        .and(path(KLINES_PATH))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let source = client(&server, 2);
    let err = source
        .fetch_bars(&timeframe(), start, start + ChronoDuration::hours(1))
        .await
        .unwrap_err();

    match err {
        MarketDataError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!source.health().await.is_healthy);
}

#[tokio::test]
async fn test_malformed_payload_is_rejected() {
    let server = MockServer::start().await;
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    Mock::given(method("GET"))
        .and(path(KLINES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"msg": "not klines"})))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, 3)
        .fetch_bars(&timeframe(), start, start + ChronoDuration::hours(1))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketDataError::Malformed(_)));
}

#[tokio::test]
async fn test_forming_bar_is_skipped() {
    let server = MockServer::start().await;
    let now = Utc::now();
    let closed_open = now - ChronoDuration::minutes(40);
    let forming_open = now - ChronoDuration::minutes(5);

    Mock::given(method("GET"))
        .and(path(KLINES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            kline(closed_open.timestamp_millis(), "100"),
            kline(forming_open.timestamp_millis(), "100"),
        ])))
        .mount(&server)
        .await;

    let bars = client(&server, 1)
        .fetch_bars(
            &timeframe(),
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
        )
        .await
        .unwrap();

    assert_eq!(bars.len(), 1);
    assert_eq!(
        bars[0].open_time.timestamp_millis(),
        closed_open.timestamp_millis()
    );
}
