//! Built-in commands served by `steward run` and `steward console`.

use steward::{handler, Ask, Orchestrator};
use steward::channels::SendOptions;

const FAVOURITE_NUMBER_RETRIES: usize = 2;

pub fn register_demo_commands(orchestrator: &mut Orchestrator) {
    orchestrator
        .register(
            "ping",
            "answers pong",
            handler(|conversation| async move {
                conversation.send("pong").await?;
                Ok(())
            }),
        )
        .register(
            "echo",
            "repeats the words after echo",
            handler(|conversation| async move {
                let words = conversation.arguments().get(1..).unwrap_or_default().join(" ");
                conversation.send(words).await?;
                Ok(())
            }),
        )
        .register(
            "ask",
            "asks for your favourite number",
            handler(|conversation| async move {
                let answer = conversation
                    .ask_with_retry(
                        FAVOURITE_NUMBER_RETRIES,
                        "what is your favourite number?",
                        SendOptions::new(),
                        |reply| reply.trim().parse::<i64>().is_ok(),
                    )
                    .await;
                if let Ask::Answer(number) = answer {
                    let who = conversation.username().unwrap_or("you");
                    conversation
                        .send(format!("{} is a fine number, {}", number.trim(), who))
                        .await?;
                }
                Ok(())
            }),
        );
}
