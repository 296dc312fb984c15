// tests/provider_http.rs
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use event_sync::ingest::enrich::DisabledEnricher;
use event_sync::ingest::providers::meetup::{search_keywords, MeetupAdapter};
use event_sync::ingest::providers::AdapterOptions;
use event_sync::ingest::types::{SearchParams, SourceAdapter, SourceRegistry};
use event_sync::{Aggregator, AggregatorSettings};

/// Read one request (headers plus `content-length` body).
async fn read_request(sock: &mut TcpStream) -> bool {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match sock.read(&mut chunk).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + body_len {
            return true;
        }
    }
}

/// Answers every request with `body` after `delay`, one connection each.
async fn slow_stub(body: String, delay: Duration) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let body = Arc::new(body);
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let body = body.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                if !read_request(&mut sock).await {
                    return;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    (addr, hits)
}

fn meetup_body() -> String {
    let start = (Utc::now() + chrono::Duration::days(3)).to_rfc3339();
    format!(
        r#"{{"data": {{"keywordSearch": {{"count": 1, "edges": [{{"node": {{
            "id": "42", "title": "Gallery Walk", "dateTime": "{start}",
            "eventUrl": "https://www.meetup.com/nyc-art/events/42", "status": "ACTIVE",
            "venue": {{"name": "Zwirner", "address": "537 W 20th St", "lat": 40.7465, "lon": -74.0014}},
            "going": 12
        }}}}]}}}}}}"#
    )
}

#[tokio::test]
async fn meetup_keyword_fanout_survives_the_aggregator_deadline() {
    let (addr, hits) = slow_stub(meetup_body(), Duration::from_millis(150)).await;
    let timeout = Duration::from_secs(1);
    let adapter = MeetupAdapter::new(
        AdapterOptions::new(true, timeout).with_base_url(format!("http://{addr}/gql")),
        Some("token".to_string()),
    )
    .unwrap();

    let params = SearchParams::around(40.7465, -74.0014, 3_000);
    let keywords = search_keywords(&params).len();
    assert_eq!(adapter.requests_per_search(&params), keywords);

    let mut registry = SourceRegistry::new();
    registry.register(Arc::new(adapter));
    let agg = Aggregator::new(
        registry,
        Arc::new(DisabledEnricher),
        AggregatorSettings {
            enabled: true,
            request_timeout: timeout,
            ..AggregatorSettings::default()
        },
    );

    let started = Instant::now();
    let out = agg.discover_events(&params).await;
    // Sequential keyword requests take longer than one request timeout.
    assert!(started.elapsed() > timeout);
    assert_eq!(hits.load(Ordering::SeqCst), keywords);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].source_id, "42");
    assert_eq!(out[0].venue.as_deref(), Some("Zwirner"));
}
