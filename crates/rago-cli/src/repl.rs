//! Subcommand: `rago agent chat` -- interactive REPL.
//!
//! Each line is one chat turn in a persisted session. Lines starting with
//! `/` are REPL commands.

use std::io::Write as _;

use anyhow::{Context, Result};
use rago_agent::AgentError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::app::Services;

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Quit,
    ShowSession,
    Clear,
    Help,
    Unknown(&'a str),
    Empty,
    Message(&'a str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    match line {
        "" => Input::Empty,
        "/quit" | "/exit" | "/q" => Input::Quit,
        "/session" => Input::ShowSession,
        "/clear" => Input::Clear,
        "/help" => Input::Help,
        cmd if cmd.starts_with('/') => Input::Unknown(cmd),
        text => Input::Message(text),
    }
}

const HELP: &str = "/quit to exit, /session to show the session id, /clear to forget the history";

pub async fn run(services: &Services, session: Option<String>) -> Result<()> {
    let runtime = &services.runtime;
    let agent = runtime.agent().name.clone();
    let session = runtime
        .sessions()
        .load_or_create(session.as_deref(), &agent)
        .await
        .context("failed to open session")?;
    let session_id = session.id;
    info!(session_id = %session_id, messages = session.messages.len(), "chat started");

    println!("rago chat ({agent}) -- session {session_id}");
    if !session.messages.is_empty() {
        println!("Resumed with {} messages.", session.messages.len());
    }
    println!("{HELP}\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().context("failed to flush stdout")?;
        let Some(line) = lines.next_line().await.context("failed to read input")? else {
            println!();
            break;
        };
        match parse_input(&line) {
            Input::Empty => continue,
            Input::Quit => break,
            Input::Help => println!("{HELP}"),
            Input::ShowSession => println!("{session_id}"),
            Input::Unknown(cmd) => println!("Unknown command {cmd}. {HELP}"),
            Input::Clear => {
                runtime.sessions().clear(&session_id)?;
                runtime.sessions().save(&session_id).await?;
                println!("History cleared.");
            }
            Input::Message(text) => match runtime.chat(text, Some(&session_id)).await {
                Ok(out) => {
                    println!("\n{}\n", out.content.trim());
                    services.llm.report_alerts();
                }
                Err(AgentError::Cancelled) => {
                    // Ctrl-C only stops the turn in flight.
                    println!("\n(cancelled)\n");
                }
                Err(e) => {
                    warn!(error = %e, "chat turn failed");
                    println!("\nerror: {e}\n");
                }
            },
        }
    }
    println!("Session saved: {session_id}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_and_messages() {
        assert_eq!(parse_input("  /quit "), Input::Quit);
        assert_eq!(parse_input("/exit"), Input::Quit);
        assert_eq!(parse_input("/session"), Input::ShowSession);
        assert_eq!(parse_input("/clear"), Input::Clear);
        assert_eq!(parse_input("/nope"), Input::Unknown("/nope"));
        assert_eq!(parse_input("   "), Input::Empty);
        assert_eq!(parse_input(" hello "), Input::Message("hello"));
    }
}
