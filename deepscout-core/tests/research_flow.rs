//! End-to-end research session tests.
//!
//! These exercise the full orchestrator loop against scripted components:
//! a queued language model, a canned source adapter, and an in-memory
//! content store. No network or browser is involved.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use deepscout_core::embeddings::HashEmbedder;
use deepscout_core::fetch::MockBrowserEngine;
use deepscout_core::llm::MockLanguageModel;
use deepscout_core::sources::MockSourceAdapter;
use deepscout_core::store::MockContentStore;
use deepscout_core::{
    BudgetAccountant, Fetcher, LlmError, ResearchEvent, ResearchOrchestrator, ResearchPhase,
    ScoutConfig, SourceRegistry, TerminationReason, TokenCounter,
};

/// Scripted component graph around one orchestrator.
struct Harness {
    model: Arc<MockLanguageModel>,
    web: Arc<MockSourceAdapter>,
    github: Arc<MockSourceAdapter>,
    engine: Arc<MockBrowserEngine>,
    store: Arc<MockContentStore>,
    cancel: CancellationToken,
    orchestrator: Arc<ResearchOrchestrator>,
}

fn harness(config: ScoutConfig) -> Harness {
    harness_with_store(config, Arc::new(MockContentStore::new()))
}

/// Builds a harness with fetch concurrency 1 so model calls arrive in a
/// deterministic order: one sufficiency call per iteration, then one gate
/// call per fetched link.
fn harness_with_store(mut config: ScoutConfig, store: Arc<MockContentStore>) -> Harness {
    config.crawler.max_concurrency = 1;

    let model = Arc::new(MockLanguageModel::new());
    let web = Arc::new(MockSourceAdapter::new("web"));
    let github = Arc::new(MockSourceAdapter::new("github"));
    let mut registry = SourceRegistry::new();
    registry.register(web.clone());
    registry.register(github.clone());
    let registry = Arc::new(registry);

    let engine = Arc::new(MockBrowserEngine::new());
    let fetcher = Fetcher::new(
        engine.clone(),
        Arc::clone(&registry),
        None,
        reqwest::Client::new(),
        &config.crawler,
    );
    let cancel = CancellationToken::new();
    let orchestrator = Arc::new(ResearchOrchestrator::new(
        model.clone(),
        registry,
        fetcher,
        store.clone(),
        Arc::new(HashEmbedder::new(64)),
        config,
        cancel.clone(),
    ));

    Harness {
        model,
        web,
        github,
        engine,
        store,
        cancel,
        orchestrator,
    }
}

/// Article text that passes the pre-filter: long enough, diverse, and free
/// of spam or interstitial phrases.
fn article(seed: &str) -> String {
    format!(
        "{seed}: Asynchronous runtimes schedule lightweight tasks over a small \
         pool of worker threads. Executors poll futures until they yield, \
         wakers requeue them when progress becomes possible, and timers plus \
         network drivers integrate through a reactor that parks idle workers."
    )
}

/// A few thousand characters of unique words, for budget-overflow tests.
/// At 300 words this counts as at least 600 tokens under any tokenizer the
/// accountant might pick.
fn bulk_text(seed: &str) -> String {
    (0..300)
        .map(|i| format!("{seed}{i:03}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn not_enough(urls: &[&str]) -> String {
    serde_json::json!({
        "enough": false,
        "search_urls": urls,
        "rationale": "coverage is still thin"
    })
    .to_string()
}

fn enough() -> String {
    r#"{"enough": true, "rationale": "the question is answered"}"#.to_string()
}

fn accept(title: &str) -> String {
    serde_json::json!({
        "accept": true,
        "title": title,
        "reason": "substantive",
        "scenario": "general"
    })
    .to_string()
}

async fn run(
    hx: &Harness,
    query: &str,
) -> (Vec<ResearchEvent>, deepscout_core::ResearchOutcome) {
    let (stream, handle) = hx.orchestrator.start_research(query, None);
    let events: Vec<ResearchEvent> = stream.collect().await;
    let outcome = handle.await.unwrap();
    (events, outcome)
}

// --- Termination reasons ---

#[tokio::test]
async fn test_session_ends_sufficient_below_target() {
    let mut config = ScoutConfig::default();
    config.budget.target_results = 10;
    let hx = harness(config);

    // Iterations 1-2 propose links; iteration 3 judges the evidence enough
    // even though only 7 of the 10 targeted items were gathered.
    hx.model.queue(not_enough(&["https://search.example/async"]));
    for i in 0..4 {
        hx.model.queue(accept(&format!("Source {i}")));
    }
    hx.model
        .queue(not_enough(&["https://search.example/async+scheduling"]));
    for i in 4..7 {
        hx.model.queue(accept(&format!("Source {i}")));
    }
    hx.model.queue(enough());

    let first: Vec<String> = (0..4)
        .map(|i| format!("https://pages.example/{i}"))
        .collect();
    let second: Vec<String> = (4..7)
        .map(|i| format!("https://pages.example/{i}"))
        .collect();
    hx.web
        .queue_links(&first.iter().map(String::as_str).collect::<Vec<_>>());
    hx.web
        .queue_links(&second.iter().map(String::as_str).collect::<Vec<_>>());
    for url in first.iter().chain(second.iter()) {
        hx.web.set_content(url, &article(url));
    }

    let (_events, outcome) = run(&hx, "how do async runtimes schedule tasks").await;

    assert_eq!(outcome.reason, TerminationReason::Sufficient);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(outcome.evidence.len(), 7);
    // 3 sufficiency calls plus 7 gate calls.
    assert_eq!(hx.model.call_count(), 10);
    // Each iteration persisted its own batch.
    assert_eq!(hx.store.write_batch_sizes(), vec![4, 3]);
    // Everything came over the adapter's native path.
    assert_eq!(hx.engine.opened(), 0);
}

#[tokio::test]
async fn test_iteration_cap_ends_the_session() {
    let mut config = ScoutConfig::default();
    config.budget.max_iterations = 4;
    config.budget.target_results = 5;
    let hx = harness(config);

    // One fresh link per iteration, never enough.
    for i in 0..4 {
        hx.model
            .queue(not_enough(&[&format!("https://search.example/page{i}")]));
        hx.model.queue(accept(&format!("Result {i}")));
        let url = format!("https://pages.example/{i}");
        hx.web.queue_links(&[&url]);
        hx.web.set_content(&url, &article(&url));
    }

    let (_events, outcome) = run(&hx, "an inexhaustible topic").await;

    assert_eq!(outcome.reason, TerminationReason::IterationCap);
    assert_eq!(outcome.iterations, 4);
    assert_eq!(outcome.evidence.len(), 4);
    assert!(outcome.evidence.len() <= 5);
}

#[tokio::test]
async fn test_target_reached_skips_remaining_fetches() {
    let mut config = ScoutConfig::default();
    config.budget.target_results = 2;
    let hx = harness(config);

    hx.model.queue(not_enough(&["https://search.example/q"]));
    hx.model.queue(accept("First"));
    hx.model.queue(accept("Second"));
    // Iteration 2 re-evaluates, still not enough, but the target is met.
    hx.model.queue(not_enough(&[]));

    let urls = [
        "https://pages.example/one",
        "https://pages.example/two",
        "https://pages.example/three",
    ];
    hx.web.queue_links(&urls);
    for url in urls {
        hx.web.set_content(url, &article(url));
    }

    let (_events, outcome) = run(&hx, "a narrow question").await;

    assert_eq!(outcome.reason, TerminationReason::TargetReached);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.evidence.len(), 2);
    // The third fetched page was discarded without a gate call.
    assert_eq!(hx.model.call_count(), 4);
}

// --- Deduplication and persistence ---

#[tokio::test]
async fn test_seen_and_stored_urls_are_never_refetched() {
    let mut config = ScoutConfig::default();
    config.budget.max_iterations = 3;
    let store = Arc::new(MockContentStore::with_existing(&[
        "https://pages.example/archived",
    ]));
    let hx = harness_with_store(config, store);

    hx.model.queue(not_enough(&["https://search.example/q"]));
    hx.model.queue(accept("First"));
    hx.model.queue(accept("Second"));
    hx.model.queue(not_enough(&["https://search.example/q"]));
    hx.model.queue(enough());

    hx.web
        .queue_links(&["https://pages.example/one", "https://pages.example/two"]);
    // The second expansion repeats both links and adds a store-known URL;
    // dedup must drop all three.
    hx.web.queue_links(&[
        "https://pages.example/one",
        "https://pages.example/two",
        "https://pages.example/archived",
    ]);
    hx.web
        .set_content("https://pages.example/one", &article("one"));
    hx.web
        .set_content("https://pages.example/two", &article("two"));
    // No canned content for the archived URL: fetching it would force the
    // browser path and show up in `opened()`.

    let (_events, outcome) = run(&hx, "a repetitive topic").await;

    assert_eq!(outcome.reason, TerminationReason::Sufficient);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(outcome.evidence.len(), 2);
    assert_eq!(hx.engine.opened(), 0);
    // Only the first iteration wrote anything.
    assert_eq!(hx.store.write_batch_sizes(), vec![2]);
    assert_eq!(hx.model.call_count(), 5);
}

#[tokio::test]
async fn test_rerun_over_the_same_store_writes_nothing() {
    let store = Arc::new(MockContentStore::new());
    let urls = ["https://pages.example/one", "https://pages.example/two"];

    // First session gathers and persists two pages.
    let first = harness_with_store(ScoutConfig::default(), store.clone());
    first.model.queue(not_enough(&["https://search.example/q"]));
    first.model.queue(accept("One"));
    first.model.queue(accept("Two"));
    first.model.queue(enough());
    first.web.queue_links(&urls);
    for url in urls {
        first.web.set_content(url, &article(url));
    }
    let (_events, outcome) = run(&first, "a stable topic").await;
    assert_eq!(outcome.evidence.len(), 2);
    assert_eq!(store.written().len(), 2);

    // A second session proposes the same URLs; dedup drops them against
    // the shared store and nothing is written twice.
    let second = harness_with_store(ScoutConfig::default(), store.clone());
    second.model.queue(not_enough(&["https://search.example/q"]));
    second.model.queue(enough());
    second.web.queue_links(&urls);
    for url in urls {
        second.web.set_content(url, &article(url));
    }
    let (_events, outcome) = run(&second, "a stable topic").await;

    assert_eq!(outcome.reason, TerminationReason::Sufficient);
    assert!(outcome.evidence.is_empty());
    assert_eq!(store.written().len(), 2);
}

#[tokio::test]
async fn test_store_write_failure_does_not_fail_the_session() {
    let store = Arc::new(MockContentStore::new());
    store.set_fail_writes(true);
    let hx = harness_with_store(ScoutConfig::default(), store);

    hx.model.queue(not_enough(&["https://search.example/q"]));
    hx.model.queue(accept("Only"));
    hx.model.queue(enough());
    hx.web.queue_links(&["https://pages.example/only"]);
    hx.web
        .set_content("https://pages.example/only", &article("only"));

    let (_events, outcome) = run(&hx, "a fragile store").await;

    assert_eq!(outcome.reason, TerminationReason::Sufficient);
    assert_eq!(outcome.evidence.len(), 1);
    assert!(hx.store.written().is_empty());
}

// --- Quality gate and budget ---

#[tokio::test]
async fn test_short_content_never_reaches_the_gate() {
    let mut config = ScoutConfig::default();
    config.budget.max_iterations = 1;
    let hx = harness(config);

    hx.model.queue(not_enough(&["https://search.example/q"]));
    hx.web.queue_links(&["https://pages.example/stub"]);
    hx.web
        .set_content("https://pages.example/stub", "Too short to be an article.");

    let (events, outcome) = run(&hx, "a thin page").await;

    assert_eq!(outcome.reason, TerminationReason::IterationCap);
    assert!(outcome.evidence.is_empty());
    // Only the sufficiency call; the rejected page never cost a gate call.
    assert_eq!(hx.model.call_count(), 1);
    assert!(events.iter().any(|event| matches!(
        event,
        ResearchEvent::Error { message, .. } if message.contains("pre-filter")
    )));
}

#[tokio::test]
async fn test_overflow_invokes_the_compressor() {
    let mut config = ScoutConfig::default();
    // Window 1424 with the default 1024 reserve leaves a 400-token limit
    // and a 360-token effective budget. Neither bulk page can fit, so a
    // compression call follows each gate call no matter which of the two
    // pages completes first.
    config.llm.context_window = Some(1_424);
    let hx = harness(config);

    hx.model.queue(not_enough(&["https://search.example/q"]));
    hx.model.queue(accept("First find"));
    hx.model.queue(
        serde_json::json!({
            "decisions": {"reasoning": "only the key facts matter", "strategy": "condense"},
            "compressed_results": [
                {"original_index": -1, "url": "", "title": "",
                 "content": "first page condensed to the key scheduling facts",
                 "compressed": true}
            ]
        })
        .to_string(),
    );
    hx.model.queue(accept("Second find"));
    hx.model.queue(
        serde_json::json!({
            "decisions": {"reasoning": "keep both in short form", "strategy": "condense"},
            "compressed_results": [
                {"original_index": 0, "url": "", "title": "",
                 "content": "earlier evidence kept in brief", "compressed": true},
                {"original_index": -1, "url": "", "title": "",
                 "content": "second page condensed to the remaining facts",
                 "compressed": true}
            ]
        })
        .to_string(),
    );
    hx.model.queue(enough());

    hx.web.queue_links(&[
        "https://pages.example/alpha",
        "https://pages.example/beta",
    ]);
    hx.web
        .set_content("https://pages.example/alpha", &bulk_text("alpha"));
    hx.web
        .set_content("https://pages.example/beta", &bulk_text("beta"));

    let (events, outcome) = run(&hx, "a heavy topic").await;

    assert_eq!(outcome.reason, TerminationReason::Sufficient);
    assert!(events.iter().any(|event| matches!(
        event,
        ResearchEvent::Status { phase: ResearchPhase::Compressing, .. }
    )));
    assert_eq!(outcome.evidence.len(), 2);
    assert!(outcome.evidence.iter().all(|item| item.compressed));
    // The full texts never survive into the session.
    assert!(outcome.evidence.iter().all(|item| {
        !item.content.contains("alpha299") && !item.content.contains("beta299")
    }));
    // 2 sufficiency calls, 2 gate calls, 2 compression calls.
    assert_eq!(hx.model.call_count(), 6);

    // The surviving set fits the effective budget.
    let budget = BudgetAccountant::new(TokenCounter::for_model("mock-model"), 1_424, 1_024);
    assert!(budget.total(&outcome.evidence) <= budget.effective_limit());
}

// --- Scenario pinning ---

#[tokio::test]
async fn test_pinned_scenario_widens_expansion_sources() {
    let hx = harness(ScoutConfig::default());

    // The first verdict names the technology scenario, whose profile
    // consults both the web and github adapters.
    hx.model.queue(
        serde_json::json!({
            "enough": false,
            "search_urls": ["https://search.example/q"],
            "scenario": "technology"
        })
        .to_string(),
    );
    hx.model.queue(enough());

    let (_events, outcome) = run(&hx, "rust web frameworks").await;

    assert_eq!(outcome.reason, TerminationReason::Sufficient);
    assert_eq!(hx.web.queries(), vec!["https://search.example/q"]);
    assert_eq!(hx.github.queries(), vec!["https://search.example/q"]);
}

// --- Degradation and cancellation ---

#[tokio::test]
async fn test_sufficiency_failure_degrades_and_continues() {
    let mut config = ScoutConfig::default();
    config.budget.max_iterations = 3;
    let hx = harness(config);

    hx.model.queue_error(LlmError::Timeout { timeout_secs: 30 });
    hx.model.queue(enough());

    let (_events, outcome) = run(&hx, "a flaky judge").await;

    assert_eq!(outcome.reason, TerminationReason::Sufficient);
    assert_eq!(outcome.iterations, 2);
    assert!(outcome.evidence.is_empty());
    assert_eq!(hx.model.call_count(), 2);
}

#[tokio::test]
async fn test_cancellation_returns_partial_evidence() {
    let mut config = ScoutConfig::default();
    config.budget.target_results = 10;
    let hx = harness(config);

    hx.model.queue(not_enough(&["https://search.example/q"]));
    for i in 0..3 {
        hx.model.queue(accept(&format!("Page {i}")));
    }
    let urls = [
        "https://pages.example/0",
        "https://pages.example/1",
        "https://pages.example/2",
    ];
    hx.web.queue_links(&urls);
    for url in urls {
        hx.web.set_content(url, &article(url));
    }

    let (mut stream, handle) = hx.orchestrator.start_research("an interrupted topic", None);
    let mut saw_evidence = false;
    while let Some(event) = stream.next().await {
        if !saw_evidence && matches!(event, ResearchEvent::Evidence { .. }) {
            saw_evidence = true;
            hx.cancel.cancel();
        }
    }
    let outcome = handle.await.unwrap();

    assert!(saw_evidence);
    assert_eq!(outcome.reason, TerminationReason::Cancelled);
    assert!(!outcome.evidence.is_empty());
    assert!(*hx.engine.closed.lock().unwrap());
}
