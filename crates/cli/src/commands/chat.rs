//! `parley chat`: interactive or single-message chat mode.

use crate::load_config;
use anyhow::Context;
use parley_agent::{ChatService, EchoChatService, Orchestrator};
use parley_config::AppConfig;
use parley_core::message::Role;
use serde_json::Value;
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};

pub struct ChatOptions {
    pub message: Option<String>,
    pub offline: bool,
    pub no_tools: bool,
    pub flat: bool,
    pub fresh: bool,
}

/// One line of REPL input.
#[derive(Debug, PartialEq)]
enum Input {
    Empty,
    Message(String),
    Exit,
    Help,
    Clear,
    Stats,
    History,
    Tools(bool),
    Context(bool),
    System(String),
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if line == "exit" || line == "quit" {
        return Input::Exit;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match (name, arg) {
        ("exit" | "quit", _) => Input::Exit,
        ("help", _) => Input::Help,
        ("clear", _) => Input::Clear,
        ("stats", _) => Input::Stats,
        ("history", _) => Input::History,
        ("tools", "on") => Input::Tools(true),
        ("tools", "off") => Input::Tools(false),
        ("context", "on") => Input::Context(true),
        ("context", "off") => Input::Context(false),
        ("system", text) if !text.is_empty() => Input::System(text.to_string()),
        _ => Input::Unknown(line.to_string()),
    }
}

fn apply_flags(config: &mut AppConfig, options: &ChatOptions) {
    if options.no_tools {
        config.tools.enabled = false;
    }
    if options.flat {
        config.context.hierarchical.enabled = false;
    }
    if options.fresh {
        config.persistence.resume = false;
    }
}

pub async fn run(config_path: &Path, options: ChatOptions) -> anyhow::Result<()> {
    let (service, label): (Box<dyn ChatService>, String) = if options.offline {
        (Box::new(EchoChatService::new()), "offline echo".into())
    } else {
        let mut config = load_config(config_path)?;
        apply_flags(&mut config, &options);
        let label = format!("{} ({})", config.backend.kind, config.backend.model);
        let orchestrator = Orchestrator::builder(config)
            .build()
            .await
            .context("starting the conversation")?;
        (Box::new(orchestrator), label)
    };

    let result = match &options.message {
        Some(message) => {
            service
                .send_user_message(message)
                .await
                .map(|text| println!("{text}"))
                .map_err(anyhow::Error::from)
        }
        None => repl(service.as_ref(), &label).await,
    };

    service.close().await.context("closing the session")?;
    result
}

async fn repl(service: &dyn ChatService, label: &str) -> anyhow::Result<()> {
    let loaded = service.history().len();
    println!();
    println!("  Parley: {label}");
    if loaded > 0 {
        println!("  Resumed session with {loaded} messages.");
    }
    println!("  Type /help for commands, 'exit' or Ctrl+C to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Exit => break,
            Input::Help => print_help(),
            Input::Clear => {
                service.clear().await;
                println!("  Conversation cleared.");
            }
            Input::Stats => {
                let stats = Value::Object(service.context_statistics());
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            Input::History => {
                for message in service.history() {
                    let who = match message.role {
                        Role::User => "You",
                        Role::Assistant => "Assistant",
                        Role::System | Role::Summary => "System",
                    };
                    println!("  [{}] {who}: {}", message.level(), message.content);
                }
            }
            Input::Tools(enabled) => {
                service.enable_tools(enabled).await;
                println!("  Tools {}.", if enabled { "enabled" } else { "disabled" });
            }
            Input::Context(enabled) => {
                service.enable_context_management(enabled).await;
                println!(
                    "  Context management {}.",
                    if enabled { "enabled" } else { "disabled" }
                );
            }
            Input::System(text) => {
                service.update_system_prompt(&text).await;
                println!("  System prompt updated.");
            }
            Input::Unknown(text) => println!("  Unknown command: {text} (try /help)"),
            Input::Message(text) => {
                eprint!("  ...");
                let outcome = tokio::select! {
                    reply = service.send_user_message(&text) => Some(reply),
                    _ = tokio::signal::ctrl_c() => None,
                };
                eprint!("\r     \r");
                match outcome {
                    Some(Ok(reply)) => {
                        println!();
                        for line in reply.lines() {
                            println!("  Assistant > {line}");
                        }
                        println!();
                    }
                    Some(Err(e)) => eprintln!("  [Error: {:?}] {e}", e.kind()),
                    None => {
                        eprintln!("  Interrupted.");
                        break;
                    }
                }
            }
        }
    }

    println!();
    Ok(())
}

fn print_help() {
    println!("  /help              Show this help");
    println!("  /clear             Forget the conversation");
    println!("  /stats             Show context statistics");
    println!("  /history           Show the conversation so far");
    println!("  /tools on|off      Toggle tool use");
    println!("  /context on|off    Toggle context management");
    println!("  /system <text>     Replace the system prompt");
    println!("  exit               Save and quit");
}
