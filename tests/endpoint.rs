//! Scenario tests for endpoints connected in process.

use anyhow::Result;
use script_bridge::endpoint::{connect_pair, longs, ServiceFunction};
use script_bridge::{
    BridgeError, CallMetrics, Endpoint, EndpointConfig, HostException, OutboundCallHandler, ServiceAdapter,
    ServiceScope,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Quote {
    symbol: String,
    #[serde(with = "longs")]
    volume: i64,
}

trait Quotes: Send + Sync {
    fn latest(&self, symbol: String) -> Result<Quote, HostException>;

    fn close(&self) {}
}

struct FixedQuotes {
    closes: AtomicUsize,
}

impl Quotes for FixedQuotes {
    fn latest(&self, symbol: String) -> Result<Quote, HostException> {
        if symbol.is_empty() {
            return Err(HostException::new("IllegalArgumentException", "empty symbol"));
        }
        Ok(Quote {
            symbol,
            volume: i64::MAX - 1,
        })
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct QuotesClient {
    handler: OutboundCallHandler,
}

impl QuotesClient {
    fn latest(&self, symbol: &str) -> script_bridge::Result<Quote> {
        self.handler.call(0, (symbol,))
    }

    async fn watch(&self, symbol: &str, ticks: u32) -> script_bridge::Result<Vec<Quote>> {
        self.handler.call_suspending(1, (symbol, ticks)).await
    }

    fn close(&self) {
        self.handler.close();
    }
}

struct QuotesAdapter;

impl ServiceAdapter for QuotesAdapter {
    type Service = dyn Quotes;
    type Outbound = QuotesClient;

    fn serial_name(&self) -> &str {
        "Quotes"
    }

    fn functions(&self) -> Vec<ServiceFunction<dyn Quotes>> {
        vec![
            ServiceFunction::<dyn Quotes>::returning("fun latest(String): Quote", |quotes, (symbol,): (String,)| {
                quotes.latest(symbol)
            }),
            ServiceFunction::<dyn Quotes>::suspending(
                "suspend fun watch(String, Int): List<Quote>",
                |quotes, (symbol, ticks): (String, u32)| async move {
                    let mut seen = Vec::new();
                    for _ in 0..ticks {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        seen.push(quotes.latest(symbol.clone())?);
                    }
                    Ok::<_, HostException>(seen)
                },
            ),
            ServiceFunction::<dyn Quotes>::close(|quotes| quotes.close()),
        ]
    }

    fn outbound_service(&self, handler: OutboundCallHandler) -> QuotesClient {
        QuotesClient { handler }
    }
}

fn connected(metrics: Arc<CallMetrics>) -> Result<(Endpoint, Endpoint, Arc<FixedQuotes>)> {
    let host = Endpoint::new(EndpointConfig::default())?;
    let guest = Endpoint::with_listener(EndpointConfig::default(), metrics)?;
    connect_pair(&host, &guest);
    let quotes = Arc::new(FixedQuotes {
        closes: AtomicUsize::new(0),
    });
    host.bind::<QuotesAdapter>("quotes", quotes.clone(), &QuotesAdapter)?;
    Ok((host, guest, quotes))
}

#[test]
fn test_trait_object_service() -> Result<()> {
    let metrics = Arc::new(CallMetrics::new());
    let (host, guest, quotes) = connected(metrics.clone())?;

    let client = guest.take("quotes", &QuotesAdapter)?;
    let quote = client.latest("ACME")?;
    assert_eq!(quote.symbol, "ACME");
    assert_eq!(quote.volume, i64::MAX - 1);

    match client.latest("") {
        Err(BridgeError::HostRethrow(ex)) => assert_eq!(ex.to_string(), "IllegalArgumentException: empty symbol"),
        other => panic!("unexpected {other:?}"),
    }

    client.close();
    assert_eq!(quotes.closes.load(Ordering::SeqCst), 1);
    assert!(host.service_names().is_empty());

    let stats = metrics.snapshot();
    assert_eq!(stats.services_taken, 1);
    assert_eq!(stats.total_calls, 3);
    assert_eq!(stats.failed_calls, 1);
    assert_eq!(stats.function_calls["latest"], 2);
    Ok(())
}

#[tokio::test]
async fn test_suspending_scenario() -> Result<()> {
    let metrics = Arc::new(CallMetrics::new());
    let (host, guest, _) = connected(metrics.clone())?;
    let client = guest.take("quotes", &QuotesAdapter)?;

    let seen = client.watch("ACME", 3).await?;
    assert_eq!(seen.len(), 3);

    let err = client.watch("", 1).await.unwrap_err();
    assert_eq!(err.to_string(), "IllegalArgumentException: empty symbol");

    assert_eq!(host.service_names(), vec!["quotes".to_string()]);
    assert!(guest.service_names().is_empty());
    assert_eq!(metrics.snapshot().suspended_calls, 2);
    client.close();
    Ok(())
}

#[tokio::test]
async fn test_scope_closes_everything() -> Result<()> {
    let metrics = Arc::new(CallMetrics::new());
    let (_host, guest, quotes) = connected(metrics.clone())?;
    let scope = ServiceScope::new();

    let first = guest.take_scoped("quotes", &QuotesAdapter, &scope)?;
    let second = guest.take_scoped("quotes", &QuotesAdapter, &scope)?;
    assert_eq!(scope.len(), 2);
    first.latest("A")?;

    scope.close();
    assert!(matches!(second.latest("B"), Err(BridgeError::Closed(_))));
    assert_eq!(quotes.closes.load(Ordering::SeqCst), 1);

    drop(first);
    drop(second);
    assert_eq!(metrics.services_leaked(), 0);
    Ok(())
}

#[test]
fn test_leak_is_counted() -> Result<()> {
    let metrics = Arc::new(CallMetrics::new());
    let (_host, guest, _) = connected(metrics.clone())?;
    drop(guest.take("quotes", &QuotesAdapter)?);
    assert_eq!(metrics.services_leaked(), 1);
    Ok(())
}
