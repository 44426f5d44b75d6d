//! End-to-end dispatch over the loopback backend: commands, asks, help, abort.

use std::sync::Arc;
use std::time::Duration;
use steward::channels::{loopback, ChatBackend, LoopbackClient, OutgoingPayload};
use steward::config::Config;
use steward::{handler, Ask, Orchestrator, Scheduler};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(300);

async fn start(mut orchestrator: Orchestrator) -> (Orchestrator, LoopbackClient) {
    let (transport, client) = loopback("loop");
    orchestrator.add_custom_backend("loop", move |ports| {
        Ok(Arc::new(transport.into_backend(ports)) as Arc<dyn ChatBackend>)
    });
    orchestrator
        .start(&Scheduler::current())
        .await
        .expect("orchestrator starts");
    (orchestrator, client)
}

async fn reply(client: &mut LoopbackClient) -> OutgoingPayload {
    client.next_reply_within(WAIT).await.expect("a reply")
}

fn with_ping(config: Config) -> Orchestrator {
    let mut orchestrator = Orchestrator::new(config);
    orchestrator.register(
        "ping",
        "answers pong",
        handler(|c| async move {
            c.send("pong").await?;
            Ok(())
        }),
    );
    orchestrator
}

#[tokio::test]
async fn ping_yields_exactly_one_pong() {
    let (mut orchestrator, mut client) = start(with_ping(Config::default())).await;
    client.say("X", Some("alice"), "ping").await.expect("say");
    assert_eq!(reply(&mut client).await, OutgoingPayload::new("X", "pong"));
    assert!(client.next_reply_within(QUIET).await.is_none());
    orchestrator.stop().await;
}

#[tokio::test]
async fn sequential_asks_take_the_next_messages_in_order() {
    let mut orchestrator = Orchestrator::new(Config::default());
    orchestrator.register(
        "survey",
        "asks two questions",
        handler(|c| async move {
            let first = c.ask("first?").await.unwrap_or("-".to_string());
            let second = c.ask("second?").await.unwrap_or("-".to_string());
            c.send(format!("got {} and {}", first, second)).await?;
            Ok(())
        }),
    );
    let (mut orchestrator, mut client) = start(orchestrator).await;

    client.say("X", None, "survey").await.expect("say");
    assert_eq!(reply(&mut client).await.text, "first?");
    client.say("X", None, "ping").await.expect("say");
    assert_eq!(reply(&mut client).await.text, "second?");
    client.say("X", None, "b").await.expect("say");
    assert_eq!(reply(&mut client).await.text, "got ping and b");
    orchestrator.stop().await;
}

#[tokio::test]
async fn help_and_slash_help_list_commands() {
    let config = Config::default().with_abort_keyword("stop");
    let (mut orchestrator, mut client) = start(with_ping(config)).await;
    let expected = "steward at yor service:\n\nabort interactions with: stop\n---\nping - answers pong";

    client.say("X", None, "help").await.expect("say");
    assert_eq!(reply(&mut client).await.text, expected);
    client.say("X", None, "/help").await.expect("say");
    assert_eq!(reply(&mut client).await.text, expected);
    orchestrator.stop().await;
}

#[tokio::test]
async fn abort_keyword_cancels_ask_and_handler() {
    let mut orchestrator = Orchestrator::new(Config::default().with_abort_keyword("stop"));
    orchestrator.register(
        "deploy",
        "deploys after confirmation",
        handler(|c| async move {
            let answer = c.ask("sure?").await;
            c.send(format!("continuing after {}", answer)).await?;
            Ok(())
        }),
    );
    let (mut orchestrator, mut client) = start(orchestrator).await;

    client.say("X", None, "deploy").await.expect("say");
    assert_eq!(reply(&mut client).await.text, "sure?");
    client.say("X", None, "stop").await.expect("say");
    assert_eq!(reply(&mut client).await.text, "aborted");
    assert!(client.next_reply_within(QUIET).await.is_none());

    // Outside an ask the keyword is an ordinary, unmatched message.
    client.say("X", None, "stop").await.expect("say");
    assert!(client.next_reply_within(QUIET).await.is_none());
    orchestrator.stop().await;
}

#[tokio::test]
async fn retry_ask_reprompts_until_accepted() {
    let mut orchestrator = Orchestrator::new(Config::default());
    orchestrator.register(
        "number",
        "asks for a number",
        handler(|c| async move {
            let answer = c
                .ask_with_retry(2, "number?", Default::default(), |a| a.parse::<u32>().is_ok())
                .await;
            if let Ask::Answer(n) = answer {
                c.send(format!("thanks for {}", n)).await?;
            }
            Ok(())
        }),
    );
    let (mut orchestrator, mut client) = start(orchestrator).await;

    client.say("X", None, "number").await.expect("say");
    assert_eq!(reply(&mut client).await.text, "number?");
    client.say("X", None, "seven").await.expect("say");
    assert_eq!(reply(&mut client).await.text, "incompatible answer!");
    assert_eq!(reply(&mut client).await.text, "number?");
    client.say("X", None, "7").await.expect("say");
    assert_eq!(reply(&mut client).await.text, "thanks for 7");
    orchestrator.stop().await;
}

#[tokio::test]
async fn failing_handlers_do_not_stop_dispatch() {
    let mut orchestrator = with_ping(Config::default());
    orchestrator
        .register("boom", "panics", handler(|_| async { panic!("boom") }))
        .register(
            "fail",
            "errors",
            handler(|_| async { Err(anyhow::anyhow!("nope")) }),
        );
    let (mut orchestrator, mut client) = start(orchestrator).await;

    client.say("X", None, "boom").await.expect("say");
    client.say("X", None, "fail").await.expect("say");
    client.say("X", None, "ping").await.expect("say");
    assert_eq!(reply(&mut client).await.text, "pong");
    orchestrator.stop().await;
}

#[tokio::test]
async fn imported_commands_are_served() {
    let persona = with_ping(Config::default());
    let mut orchestrator = Orchestrator::new(Config::default().with_name("bot"));
    orchestrator.import_from(&persona);
    let (mut orchestrator, mut client) = start(orchestrator).await;

    client.say("X", None, "bot ping").await.expect("say");
    assert_eq!(reply(&mut client).await.text, "pong");
    orchestrator.stop().await;
}
