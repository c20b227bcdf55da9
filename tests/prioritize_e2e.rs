use std::sync::Arc;

use deckprio::gateway::TracingUsageSink;
use deckprio::{
    ChatGateway, Config, Item, ItemId, ItemStore, JsonlTraceSink, Priority, Prioritizer,
    ProviderGateway, ProviderKind, RunMode, RunOptions, RunOutcome, ScriptedPresenter,
    SqliteItemStore,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Rates every card it is shown with `id % 4 + 1`. Batches containing
/// `fail_on` get a 500; batches containing `garble_on` get prose.
struct RubricResponder {
    fail_on: Option<ItemId>,
    garble_on: Option<ItemId>,
}

fn ids_in_request(request: &Request) -> Vec<ItemId> {
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    let user = body["messages"][1]["content"].as_str().unwrap().to_string();
    user.lines()
        .filter_map(|line| line.strip_prefix("ID: "))
        .filter_map(|rest| rest.split(" |").next())
        .map(|id| id.parse().unwrap())
        .collect()
}

fn prio_for(id: ItemId) -> i64 {
    id % 4 + 1
}

impl Respond for RubricResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let ids = ids_in_request(request);
        if self.fail_on.is_some_and(|id| ids.contains(&id)) {
            return ResponseTemplate::new(500).set_body_json(json!({
                "error": {"message": "upstream overloaded"}
            }));
        }
        let content = if self.garble_on.is_some_and(|id| ids.contains(&id)) {
            "I think these cards are all quite important.".to_string()
        } else {
            let ratings: Vec<Value> = ids
                .iter()
                .map(|id| json!({"id": id, "prio": prio_for(*id)}))
                .collect();
            json!({ "ratings": ratings }).to_string()
        };
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": content}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 20}
        }))
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<SqliteItemStore>,
    server: MockServer,
}

impl Harness {
    async fn new(items: Vec<Item>, responder: RubricResponder) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteItemStore::new(dir.path().join("cards.sqlite")).unwrap());
        store.import_items(items).await.unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(responder)
            .mount(&server)
            .await;

        Self {
            dir,
            store,
            server,
        }
    }

    fn config(&self) -> Config {
        Config {
            provider: ProviderKind::OpenAi,
            openai_api_key: "sk-e2e".to_string(),
            openai_base_url: Some(self.server.uri()),
            ..Config::default()
        }
    }

    fn prioritizer(&self, presenter: Arc<ScriptedPresenter>) -> Prioritizer {
        let config = self.config();
        let gateway: Arc<dyn ChatGateway> = Arc::new(
            ProviderGateway::for_provider(
                ProviderKind::OpenAi,
                &config.openai_api_key,
                config.openai_base_url.as_deref(),
                config.timeout(),
                Arc::new(TracingUsageSink),
            )
            .unwrap(),
        );
        Prioritizer::new(self.store.clone(), presenter, gateway, config)
    }

    async fn priority(&self, id: ItemId) -> Option<Priority> {
        self.store.get_item(id).await.unwrap().priority()
    }

    async fn calls(&self) -> Vec<Vec<ItemId>> {
        self.server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(ids_in_request)
            .collect()
    }
}

fn bio_cards(n: i64) -> Vec<Item> {
    (1..=n)
        .map(|id| Item::new(id, "Bio", &format!("Question {id}?"), &format!("Answer {id}")))
        .collect()
}

fn completed(outcome: RunOutcome) -> deckprio::RunSummary {
    match outcome {
        RunOutcome::Completed(summary) => summary,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

#[tokio::test]
async fn full_run_tags_every_card_in_three_calls() {
    let h = Harness::new(
        bio_cards(23),
        RubricResponder {
            fail_on: None,
            garble_on: None,
        },
    )
    .await;
    let presenter = Arc::new(ScriptedPresenter::new().choose("Bio"));

    let summary = completed(h.prioritizer(presenter.clone()).run().await.unwrap());

    let sizes: Vec<usize> = h.calls().await.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![10, 10, 3]);
    assert_eq!(summary.stats.prioritized, 23);
    assert_eq!(summary.stats.skipped, 0);
    assert_eq!(summary.provider, "OpenAI");
    for id in 1..=23 {
        assert_eq!(
            h.priority(id).await.map(|p| i64::from(p.value())),
            Some(prio_for(id))
        );
    }
    assert_eq!(
        presenter.infos().last().map(String::as_str),
        Some("Done using OpenAI (gpt-4o-mini)!\n23 prioritized.\n0 skipped.")
    );

    let counts = h.store.label_counts("Bio").await.unwrap();
    assert_eq!(counts.unlabeled, 0);
    assert_eq!(counts.labeled(), 23);
}

#[tokio::test]
async fn failed_and_garbled_batches_contribute_nothing() {
    let h = Harness::new(
        bio_cards(23),
        RubricResponder {
            fail_on: Some(11),
            garble_on: Some(22),
        },
    )
    .await;
    let presenter = Arc::new(ScriptedPresenter::new().choose("Bio"));

    let summary = completed(h.prioritizer(presenter).run().await.unwrap());

    assert_eq!(h.calls().await.len(), 3);
    assert_eq!(summary.stats.prioritized, 10);
    assert_eq!(summary.stats.batches_dispatched, 3);
    assert_eq!(summary.stats.batches_failed, 2);
    assert!(h.priority(1).await.is_some());
    assert!(h.priority(11).await.is_none());
    assert!(h.priority(20).await.is_none());
    assert!(h.priority(23).await.is_none());
}

#[tokio::test]
async fn skip_existing_leaves_tagged_cards_alone() {
    let mut items = bio_cards(12);
    items[0].set_priority(Priority::Four);
    items[5].set_priority(Priority::Four);
    let h = Harness::new(
        items,
        RubricResponder {
            fail_on: None,
            garble_on: None,
        },
    )
    .await;
    let presenter = Arc::new(ScriptedPresenter::new().choose("Bio"));

    let summary = completed(h.prioritizer(presenter).run().await.unwrap());

    let calls = h.calls().await;
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].contains(&1));
    assert!(!calls[0].contains(&6));
    assert_eq!(summary.stats.skipped, 2);
    assert_eq!(summary.stats.prioritized, 10);
    // prio_for(1) would be 2; the old tag survives untouched.
    assert_eq!(h.priority(1).await, Some(Priority::Four));
}

#[tokio::test]
async fn reprioritize_all_replaces_existing_tags() {
    let mut items = bio_cards(4);
    items[0].set_priority(Priority::Four);
    let h = Harness::new(
        items,
        RubricResponder {
            fail_on: None,
            garble_on: None,
        },
    )
    .await;
    let presenter = Arc::new(ScriptedPresenter::new().choose("Bio").with_options(RunOptions {
        mode: RunMode::ReprioritizeAll,
        focus: Some("cell biology exam".to_string()),
    }));

    completed(h.prioritizer(presenter).run().await.unwrap());

    let item = h.store.get_item(1).await.unwrap();
    let prio_tags: Vec<&String> = item.tags.iter().filter(|t| t.starts_with("prio:")).collect();
    assert_eq!(prio_tags, vec!["prio:2"]);

    let requests = h.server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let system = body["messages"][0]["content"].as_str().unwrap();
    assert!(system.contains("USER FOCUS: cell biology exam"));
    assert!(system.contains("'Bio'"));
}

#[tokio::test]
async fn subdecks_are_batched_separately_and_traced() {
    let mut items = Vec::new();
    for id in 1..=12 {
        items.push(Item::new(id, "Sci::Bio", "q", "a"));
    }
    for id in 13..=24 {
        items.push(Item::new(id, "Sci::Chem", "q", "a"));
    }
    let h = Harness::new(
        items,
        RubricResponder {
            fail_on: Some(13),
            garble_on: None,
        },
    )
    .await;
    let trace_path = h.dir.path().join("trace.jsonl");
    let (sink, worker) = JsonlTraceSink::new(&trace_path).unwrap();
    let presenter = Arc::new(ScriptedPresenter::new().choose("Sci"));

    let prioritizer = h.prioritizer(presenter).with_trace(Arc::new(sink));
    let summary = completed(prioritizer.run().await.unwrap());
    drop(prioritizer);
    worker.join().unwrap();

    for call in h.calls().await {
        let bio = call.iter().all(|id| *id <= 12);
        let chem = call.iter().all(|id| *id > 12);
        assert!(bio || chem, "batch mixes subdecks: {call:?}");
    }
    assert_eq!(summary.stats.prioritized, 14);

    let raw = std::fs::read_to_string(&trace_path).unwrap();
    let lines: Vec<Value> = raw
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0]["group"], "Sci::Bio");
    assert_eq!(lines[0]["provider"], "openai");
    assert_eq!(lines[0]["applied"], 10);
    let failed: Vec<&Value> = lines.iter().filter(|l| !l["error"].is_null()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["group"], "Sci::Chem");
    assert!(failed[0]["returned"].is_null());
    assert_eq!(failed[0]["applied"], 0);
}

#[tokio::test]
async fn missing_key_stops_before_any_call() {
    let h = Harness::new(
        bio_cards(3),
        RubricResponder {
            fail_on: None,
            garble_on: None,
        },
    )
    .await;
    let presenter = Arc::new(ScriptedPresenter::new().choose("Bio"));
    let mut config = h.config();
    config.openai_api_key.clear();

    let gateway: Arc<dyn ChatGateway> = Arc::new(
        ProviderGateway::for_provider(
            ProviderKind::OpenAi,
            "sk-unused",
            Some(&h.server.uri()),
            config.timeout(),
            Arc::new(TracingUsageSink),
        )
        .unwrap(),
    );
    let prioritizer = Prioritizer::new(h.store.clone(), presenter.clone(), gateway, config);

    assert!(prioritizer.run().await.is_err());
    assert!(h.calls().await.is_empty());
    assert_eq!(presenter.errors().len(), 1);
    assert!(h.priority(1).await.is_none());
}
