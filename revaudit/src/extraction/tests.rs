use std::time::Duration;

use chrono::NaiveDate;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::RetryConfig;
use crate::http::{HttpResponse, MockHttpClient};

const AGGREGATES: &str = "POST metric-aggregates/";

fn config() -> Config {
    let mut config = Config::default();
    config.api.api_key = Some("test-key".to_string());
    config.rate_limit.tier = RateTier::ExtraLarge;
    config.retry = RetryConfig {
        jitter_ms: 0,
        ..RetryConfig::default()
    };
    config.extraction.stagger = Duration::from_millis(10);
    config
}

fn range() -> DateRange {
    DateRange::from_dates(
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
    )
    .unwrap()
}

fn page(data: Value) -> HttpResponse {
    HttpResponse::json(200, &json!({"data": data, "links": {"next": null}}))
}

fn flat(sum: f64, count: f64) -> HttpResponse {
    HttpResponse::json(
        200,
        &json!({"data": {"type": "metric-aggregate", "attributes": {
            "dates": ["2024-01-01T00:00:00+00:00"],
            "measurements": {"sum_value": [sum], "count": [count]}
        }}}),
    )
}

fn grouped(rows: &[(&str, f64, f64)]) -> HttpResponse {
    let data: Vec<Value> = rows
        .iter()
        .map(|(id, sum, count)| json!({"dimensions": [id], "measurements": {"sum_value": [sum], "count": [count]}}))
        .collect();
    HttpResponse::json(
        200,
        &json!({"data": {"type": "metric-aggregate", "attributes": {
            "dates": ["2024-01-01T00:00:00+00:00"],
            "data": data
        }}}),
    )
}

fn error(status: u16) -> HttpResponse {
    HttpResponse::json(status, &json!({"errors": [{"status": status, "detail": "scripted failure"}]}))
}

/// Listings, catalog, and the total revenue query, shared by every scenario.
fn upstream(total: f64) -> MockHttpClient {
    let mock = MockHttpClient::new();
    mock.set_fallback(
        "GET metrics/",
        page(json!([
            {"id": "GENERIC", "attributes": {"name": "Placed Order", "created": "2019-01-01T00:00:00+00:00",
                "integration": {"key": "api"}}},
            {"id": "REV", "attributes": {"name": "Placed Order", "created": "2021-01-01T00:00:00+00:00",
                "integration": {"key": "shopify", "name": "Shopify"}}},
            {"id": "FORMS", "attributes": {"name": "Submitted Form"}}
        ])),
    );
    mock.set_fallback(
        "GET flows/",
        page(json!([
            {"id": "F1", "attributes": {"name": "Welcome Series", "status": "live", "trigger_type": "Added to List"}},
            {"id": "F2", "attributes": {"name": "Abandoned Cart", "status": "live", "trigger_type": "Metric"}}
        ])),
    );
    mock.add_response_when(
        "GET campaigns/",
        "'email'",
        Ok(page(json!([
            {"id": "C1", "attributes": {"name": "Spring Sale", "status": "Sent", "send_time": "2024-01-10T15:00:00+00:00"}}
        ]))),
    );
    mock.add_response_when("GET campaigns/", "'sms'", Ok(page(json!([]))));
    mock.set_fallback(
        "GET lists/",
        page(json!([{"id": "L1", "attributes": {"name": "Newsletter", "profile_count": 1200}}])),
    );
    mock.set_fallback(
        "GET forms/",
        page(json!([{"id": "FORM1", "attributes": {"name": "Popup", "status": "live"}}])),
    );
    mock.add_response_when(
        AGGREGATES,
        r#""by":["$form_id"]"#,
        Ok(grouped(&[("FORM1", 0.0, 42.0)])),
    );
    // Anything not scripted more specifically is the ungrouped total
    mock.set_fallback(AGGREGATES, flat(total, 500.0));
    mock
}

fn codes_from(snapshot: &ExtractionSnapshot, source: &str) -> Vec<WarningCode> {
    snapshot
        .warnings
        .iter()
        .filter(|w| w.source == source)
        .map(|w| w.code)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_consistent_run_produces_complete_snapshot() {
    let mock = upstream(7_986_007.82);
    mock.add_response_when(
        AGGREGATES,
        r#""by":["$attributed_flow"]"#,
        Ok(grouped(&[("F1", 1_000_000.0, 10.0), ("F2", 601_073.64, 5.0), ("", 90_000.0, 3.0)])),
    );
    mock.add_response_when(
        AGGREGATES,
        r#""by":["$attributed_campaign"]"#,
        Ok(grouped(&[("C1", 1_712_083.72, 20.0)])),
    );

    let extractor = Extractor::new(mock.clone(), &config());
    let snapshot = extractor.extract(range(), CancellationToken::new()).await.unwrap();

    assert!(snapshot.metadata.complete);
    assert!(snapshot.warnings.is_empty(), "{:?}", snapshot.warnings);
    assert_eq!(snapshot.revenue.total_revenue, 7_986_007.82);
    assert_eq!(snapshot.revenue.attributed_revenue, 3_313_157.36);
    assert!((snapshot.revenue.attribution_percentage - 41.49).abs() < 0.01);
    assert_eq!(snapshot.revenue.per_flow_revenue[0].name.as_deref(), Some("Welcome Series"));

    assert_eq!(snapshot.flows[0].id, "F1");
    assert_eq!(snapshot.flows[0].conversions, 10);
    assert_eq!(snapshot.flows[1].revenue, 601_073.64);
    assert_eq!(snapshot.campaigns.len(), 1);
    assert_eq!(snapshot.campaigns[0].revenue, 1_712_083.72);
    assert_eq!(snapshot.lists[0].profile_count, Some(1200));
    assert_eq!(snapshot.forms[0].submissions, Some(42));

    // One coalesced catalog fetch, and the shopify-owned metric was used throughout
    assert_eq!(mock.calls_to("GET metrics/"), 1);
    assert!(
        mock.get_calls()
            .iter()
            .filter(|c| c.route == AGGREGATES)
            .all(|c| !c.body.as_ref().unwrap().to_string().contains("GENERIC"))
    );
    assert_eq!(snapshot.metadata.counters.calls, mock.call_count() as u64);
    assert_eq!(snapshot.metadata.tier, RateTier::ExtraLarge);
}

#[tokio::test(start_paused = true)]
async fn test_failed_flow_extraction_still_returns_other_domains() {
    let mock = upstream(1_000.0);
    mock.set_fallback("GET flows/", error(503));
    for _ in 0..3 {
        mock.add_response_when(AGGREGATES, r#""by":["$attributed_flow"]"#, Ok(error(503)));
    }
    mock.add_response_when(
        AGGREGATES,
        r#""by":["$attributed_campaign"]"#,
        Ok(grouped(&[("C1", 250.0, 2.0)])),
    );

    let extractor = Extractor::new(mock.clone(), &config());
    let snapshot = extractor.extract(range(), CancellationToken::new()).await.unwrap();

    assert!(snapshot.metadata.complete);
    assert!(snapshot.flows.is_empty());
    assert_eq!(codes_from(&snapshot, "flows"), vec![WarningCode::TaskFailed, WarningCode::TaskFailed]);
    assert_eq!(codes_from(&snapshot, "reconciler"), vec![WarningCode::ChannelUnavailable]);

    assert_eq!(snapshot.campaigns.len(), 1);
    assert_eq!(snapshot.lists.len(), 1);
    assert_eq!(snapshot.forms.len(), 1);
    assert_eq!(snapshot.revenue.total_revenue, 1_000.0);
    assert_eq!(snapshot.revenue.attributed_revenue, 250.0);
    // Listing and the grouped query were each tried once and retried twice
    assert_eq!(mock.calls_to("GET flows/"), 3);
    assert!(snapshot.metadata.counters.retries >= 4);
}

#[tokio::test(start_paused = true)]
async fn test_degenerate_flow_query_falls_back_to_per_entity_queries() {
    let mock = upstream(8_720_000.0);
    // Grouped flow query ignores its grouping and answers with the store total
    mock.add_response_when(AGGREGATES, r#""by":["$attributed_flow"]"#, Ok(flat(8_720_000.0, 900.0)));
    mock.add_response_when(AGGREGATES, "equals($attributed_flow,'F1')", Ok(flat(500_000.0, 40.0)));
    mock.add_response_when(AGGREGATES, "equals($attributed_flow,'F2')", Ok(flat(300_000.0, 25.0)));
    mock.add_response_when(
        AGGREGATES,
        r#""by":["$attributed_campaign"]"#,
        Ok(grouped(&[("C1", 1_000_000.0, 50.0)])),
    );

    let extractor = Extractor::new(mock.clone(), &config());
    let snapshot = extractor.extract(range(), CancellationToken::new()).await.unwrap();

    assert_eq!(codes_from(&snapshot, "flows"), vec![WarningCode::DegenerateSeries]);
    assert_eq!(snapshot.revenue.flow_attributed_revenue, 800_000.0);
    assert_eq!(snapshot.revenue.attributed_revenue, 1_800_000.0);
    assert_eq!(snapshot.flows[0].name, "Welcome Series");
    assert_eq!(snapshot.flows[0].conversions, 40);
}

#[tokio::test(start_paused = true)]
async fn test_degenerate_flow_query_without_fallback_is_discarded() {
    let mock = upstream(8_720_000.0);
    mock.add_response_when(AGGREGATES, r#""by":["$attributed_flow"]"#, Ok(flat(8_720_000.0, 900.0)));
    mock.add_response_when(AGGREGATES, "equals($attributed_flow,'F1')", Ok(error(400)));
    mock.add_response_when(AGGREGATES, "equals($attributed_flow,'F2')", Ok(error(400)));
    mock.add_response_when(
        AGGREGATES,
        r#""by":["$attributed_campaign"]"#,
        Ok(grouped(&[("C1", 1_000_000.0, 50.0)])),
    );

    let extractor = Extractor::new(mock, &config());
    let snapshot = extractor.extract(range(), CancellationToken::new()).await.unwrap();

    assert_eq!(
        codes_from(&snapshot, "flows"),
        vec![WarningCode::EntitySkipped, WarningCode::EntitySkipped]
    );
    assert_eq!(codes_from(&snapshot, "reconciler"), vec![WarningCode::DegenerateSeries]);
    assert_eq!(snapshot.revenue.flow_attributed_revenue, 0.0);
    assert_eq!(snapshot.revenue.attributed_revenue, 1_000_000.0);
    assert!(snapshot.flows.iter().all(|f| f.revenue == 0.0));
}

#[tokio::test(start_paused = true)]
async fn test_entity_queries_are_capped() {
    let mock = upstream(1_000.0);
    mock.add_response_when(AGGREGATES, r#""by":["$attributed_flow"]"#, Ok(flat(1_000.0, 9.0)));
    mock.add_response_when(AGGREGATES, "equals($attributed_flow,'F1')", Ok(flat(100.0, 1.0)));
    mock.add_response_when(AGGREGATES, r#""by":["$attributed_campaign"]"#, Ok(grouped(&[])));

    let mut config = config();
    config.extraction.max_entity_queries = 1;
    let extractor = Extractor::new(mock.clone(), &config);
    let snapshot = extractor.extract(range(), CancellationToken::new()).await.unwrap();

    assert_eq!(
        codes_from(&snapshot, "flows"),
        vec![WarningCode::EntitySkipped, WarningCode::DegenerateSeries]
    );
    assert_eq!(snapshot.revenue.flow_attributed_revenue, 100.0);
    assert!(
        !mock
            .get_calls()
            .iter()
            .any(|c| c.body.as_ref().is_some_and(|b| b.to_string().contains("'F2'")))
    );
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_fails_the_run() {
    let mock = upstream(1_000.0);
    mock.set_fallback("GET lists/", error(401));

    let extractor = Extractor::new(mock, &config());
    let result = extractor.extract(range(), CancellationToken::new()).await;

    assert!(matches!(result, Err(Error::Unauthorized { status: 401 })));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_returns_incomplete_snapshot() {
    let mock = upstream(1_000.0);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let extractor = Extractor::new(mock, &config());
    let snapshot = extractor.extract(range(), cancel).await.unwrap();

    assert!(!snapshot.metadata.complete);
    let cancelled = snapshot
        .warnings
        .iter()
        .filter(|w| w.code == WarningCode::TaskCancelled)
        .count();
    assert_eq!(cancelled, 5);
    assert!(snapshot.warnings.iter().any(|w| w.code == WarningCode::TotalRevenueUnavailable));
    assert_eq!(snapshot.revenue.attribution_percentage, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_abandons_slow_domains() {
    let mock = upstream(1_000.0);
    mock.add_response_when(AGGREGATES, r#""by":["$attributed_flow"]"#, Ok(grouped(&[("F1", 100.0, 1.0)])));
    mock.add_response_when(AGGREGATES, r#""by":["$attributed_campaign"]"#, Ok(grouped(&[("C1", 50.0, 1.0)])));
    // Lists keep failing with long backoffs
    mock.set_fallback("GET lists/", error(503));

    let mut config = config();
    config.retry.backoff_ms = 60_000;
    config.retry.max_backoff_ms = 60_000;
    config.extraction.run_timeout = Duration::from_secs(5);
    let extractor = Extractor::new(mock, &config);
    let snapshot = extractor.extract(range(), CancellationToken::new()).await.unwrap();

    assert!(!snapshot.metadata.complete);
    assert_eq!(codes_from(&snapshot, "lists"), vec![WarningCode::TaskCancelled]);
    assert_eq!(snapshot.revenue.attributed_revenue, 150.0);
    assert_eq!(snapshot.flows.len(), 2);
}

/// Records the highest number of HTTP requests in flight at once.
#[derive(Clone)]
struct GaugedClient {
    inner: MockHttpClient,
    in_flight: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    peak: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl GaugedClient {
    fn new(inner: MockHttpClient) -> Self {
        Self {
            inner,
            in_flight: Default::default(),
            peak: Default::default(),
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl crate::http::HttpClient for GaugedClient {
    async fn execute(&self, request: &crate::http::ApiRequest, timeout: Duration) -> Result<HttpResponse> {
        use std::sync::atomic::Ordering;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = self.inner.execute(request, timeout).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    for limit in [1, 2] {
        let mock = upstream(1_000.0);
        mock.add_response_when(AGGREGATES, r#""by":["$attributed_flow"]"#, Ok(grouped(&[])));
        mock.add_response_when(AGGREGATES, r#""by":["$attributed_campaign"]"#, Ok(grouped(&[])));
        let client = GaugedClient::new(mock);

        let mut config = config();
        config.extraction.max_concurrent_calls = limit;
        let extractor = Extractor::new(client.clone(), &config);
        let snapshot = extractor.extract(range(), CancellationToken::new()).await.unwrap();

        assert!(snapshot.metadata.complete);
        assert!(snapshot.warnings.is_empty(), "{:?}", snapshot.warnings);
        // Five domains start together, so the limit is reached but never exceeded
        assert_eq!(client.peak(), limit, "max_concurrent_calls = {limit}");
    }
}
