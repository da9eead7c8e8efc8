//! Interactive chat mode with readline support.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::{Config, Editor};
use tracing::debug;

use crate::chat_store::{ChatMessage, ChatRole, ChatState, ChatStore};
use crate::config::Settings;

#[derive(Debug, PartialEq)]
enum ChatCommand {
    Quit,
    Help,
    Agents,
    Agent(String),
    Models,
    Model(String),
    New,
    Sessions,
    Open(String),
    Delete(String),
    None(String), // Regular message
}

fn parse_command(input: &str) -> ChatCommand {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return ChatCommand::None(String::new());
    }

    if !trimmed.starts_with('/') {
        return ChatCommand::None(trimmed.to_string());
    }

    let parts: Vec<&str> = trimmed.splitn(2, ' ').collect();
    let cmd = parts[0].to_lowercase();
    let arg = parts.get(1).map(|s| s.trim().to_string()).unwrap_or_default();

    match cmd.as_str() {
        "/quit" | "/exit" | "/q" => ChatCommand::Quit,
        "/help" | "/?" => ChatCommand::Help,
        "/agents" => ChatCommand::Agents,
        "/agent" | "/a" if !arg.is_empty() => ChatCommand::Agent(arg),
        "/models" => ChatCommand::Models,
        "/model" | "/m" if !arg.is_empty() => ChatCommand::Model(arg),
        "/new" | "/n" => ChatCommand::New,
        "/sessions" | "/s" => ChatCommand::Sessions,
        "/open" | "/o" if !arg.is_empty() => ChatCommand::Open(arg),
        "/delete" if !arg.is_empty() => ChatCommand::Delete(arg),
        "/agent" | "/a" | "/model" | "/m" | "/open" | "/o" | "/delete" => {
            eprintln!("{} needs an argument. Type /help for usage.", cmd);
            ChatCommand::None(String::new())
        }
        _ => {
            eprintln!("Unknown command: {}. Type /help for available commands.", cmd);
            ChatCommand::None(String::new())
        }
    }
}

fn print_help() {
    println!(
        r#"
Chat Commands:
  /help, /?         Show this help message
  /quit, /exit      Exit chat mode
  /agents           List agents
  /agent <id>       Switch agent
  /models           List models of the usable providers
  /model <key>      Switch model (<provider>:<model>)
  /new              Start a new conversation
  /sessions         List saved conversations
  /open <id>        Reopen a saved conversation
  /delete <id>      Delete a saved conversation

Tips:
  - Press Ctrl+D to exit
  - Up/Down arrows navigate history
"#
    );
}

/// Run interactive chat mode
pub async fn run_chat(store: Arc<ChatStore>) -> Result<()> {
    let config = Config::builder()
        .history_ignore_space(true)
        .history_ignore_dups(true)?
        .build();

    let history_path = get_history_path();
    let mut rl: Editor<(), FileHistory> = Editor::with_config(config)?;

    if let Some(path) = &history_path {
        let _ = rl.load_history(path);
    }

    println!("Chat mode started. Type /help for commands, /quit to exit.\n");
    print_selection(&store.snapshot());

    loop {
        let readline = tokio::task::block_in_place(|| rl.readline("you> "));

        match readline {
            Ok(line) => {
                let _ = rl.add_history_entry(&line);

                match parse_command(&line) {
                    ChatCommand::Quit => {
                        println!("Goodbye!");
                        break;
                    }
                    ChatCommand::Help => print_help(),
                    ChatCommand::Agents => print_agents(&store.snapshot()),
                    ChatCommand::Agent(id) => match store.select_agent(&id) {
                        Ok(()) => print_selection(&store.snapshot()),
                        Err(e) => eprintln!("{}\n", e),
                    },
                    ChatCommand::Models => print_models(&store.snapshot()),
                    ChatCommand::Model(key) => match store.select_model(&key) {
                        Ok(()) => print_selection(&store.snapshot()),
                        Err(e) => eprintln!("{}\n", e),
                    },
                    ChatCommand::New => {
                        store.new_session();
                        println!("New conversation.\n");
                    }
                    ChatCommand::Sessions => {
                        store.refresh().await;
                        print_sessions(&store.snapshot());
                    }
                    ChatCommand::Open(id) => match store.open_session(&id).await {
                        Ok(()) => print_transcript(&store.snapshot()),
                        Err(e) => eprintln!("{}\n", e),
                    },
                    ChatCommand::Delete(id) => match store.delete_session(&id).await {
                        Ok(()) => println!("Deleted {}.\n", id),
                        Err(e) => eprintln!("{}\n", e),
                    },
                    ChatCommand::None(text) => {
                        if text.is_empty() {
                            continue;
                        }
                        if !store.snapshot().can_send {
                            eprintln!("Select an agent and a model first (/agents, /models).\n");
                            continue;
                        }
                        send_and_print(&store, &text).await;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        let _ = rl.save_history(path);
    }

    Ok(())
}

/// Send one message, printing the reply as it streams in.
async fn send_and_print(store: &ChatStore, text: &str) {
    let mut rx = store.subscribe();
    let start = rx.borrow_and_update().messages.len();
    let mut printer = ReplyPrinter::new(start, io::stdout());

    let send = store.send_message(text);
    tokio::pin!(send);

    loop {
        tokio::select! {
            result = &mut send => {
                printer.render(&store.snapshot());
                printer.finish();
                if let Err(e) = result {
                    debug!(error = %e, "Send finished with error");
                }
                break;
            }
            Ok(()) = rx.changed() => {
                let state = rx.borrow_and_update().clone();
                printer.render(&state);
            }
        }
    }
}

/// Prints assistant messages appended after `start`, incrementally.
struct ReplyPrinter<W: Write> {
    start: usize,
    out: W,
    /// (message id, bytes printed, agent shown in the header)
    printed: Vec<(String, usize, Option<String>)>,
}

impl<W: Write> ReplyPrinter<W> {
    fn new(start: usize, out: W) -> Self {
        Self {
            start,
            out,
            printed: Vec::new(),
        }
    }

    fn render(&mut self, state: &ChatState) {
        let new_messages = state.messages.iter().skip(self.start);
        for message in new_messages.filter(|m| m.role == ChatRole::Assistant) {
            self.render_message(message);
        }
        let _ = self.out.flush();
    }

    fn render_message(&mut self, message: &ChatMessage) {
        let index = match self.printed.iter().position(|(id, _, _)| id == &message.id) {
            Some(index) => index,
            None => {
                if message.content.is_empty() {
                    return;
                }
                if !self.printed.is_empty() {
                    let _ = writeln!(self.out);
                }
                let label = if message.is_error { "error" } else { agent_label(message) };
                let _ = write!(self.out, "{}> ", label);
                self.printed
                    .push((message.id.clone(), 0, message.agent_name.clone()));
                self.printed.len() - 1
            }
        };

        let (_, done, agent) = &mut self.printed[index];
        if message.agent_name.is_some() && message.agent_name != *agent && *done > 0 {
            let _ = write!(self.out, "\n[{}] ", agent_label(message));
        }
        *agent = message.agent_name.clone();

        if let Some(rest) = message.content.get(*done..) {
            let _ = write!(self.out, "{}", rest);
            *done = message.content.len();
        }
    }

    fn finish(&mut self) {
        if !self.printed.is_empty() {
            let _ = writeln!(self.out, "\n");
        }
        let _ = self.out.flush();
    }
}

fn agent_label(message: &ChatMessage) -> &str {
    message.agent_name.as_deref().unwrap_or("assistant")
}

fn print_selection(state: &ChatState) {
    let agent = state
        .selected_agent_id
        .as_ref()
        .and_then(|id| state.agents.iter().find(|a| &a.id == id))
        .map(|a| a.name.as_str());

    match agent {
        Some(name) => println!("Agent: {}", name),
        None if state.agents.is_empty() => {
            println!("No agents yet. Create one with `av agents create`.")
        }
        None => println!("No agent selected. Use /agent <id>."),
    }
    match &state.selected_model_key {
        Some(key) => println!("Model: {}\n", key),
        None => println!("No usable model. Enable a provider in the config file.\n"),
    }
}

fn print_agents(state: &ChatState) {
    if state.agents.is_empty() {
        println!("No agents configured.\n");
        return;
    }
    println!("\nAgents:");
    for agent in &state.agents {
        let marker = if state.selected_agent_id.as_ref() == Some(&agent.id) { "*" } else { " " };
        println!(" {} {}  {}", marker, agent.id, agent.name);
    }
    println!();
}

fn print_models(state: &ChatState) {
    if state.model_groups.is_empty() {
        println!("No usable providers.\n");
        return;
    }
    for group in &state.model_groups {
        println!("\n{}:", group.provider_name);
        for model in &group.models {
            let marker = if state.selected_model_key.as_ref() == Some(&model.key) { "*" } else { " " };
            println!(" {} {}  ({})", marker, model.key, model.display_name);
        }
    }
    println!();
}

fn print_sessions(state: &ChatState) {
    if state.sessions.is_empty() {
        println!("No saved conversations.\n");
        return;
    }
    println!("\nConversations:");
    for session in &state.sessions {
        let updated = chrono::DateTime::from_timestamp_millis(session.updated_at)
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "  {}  {}  {} items  {}",
            session.id,
            updated,
            session.item_count,
            session.name.as_deref().unwrap_or("(untitled)")
        );
    }
    println!();
}

fn print_transcript(state: &ChatState) {
    for message in &state.messages {
        match message.role {
            ChatRole::User => println!("you> {}", message.content),
            ChatRole::Assistant => println!("{}> {}", agent_label(message), message.content),
        }
    }
    println!();
}

fn get_history_path() -> Option<PathBuf> {
    Settings::config_dir().ok().map(|d| d.join("chat_history"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(id: &str, content: &str, agent: Option<&str>) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            role: ChatRole::Assistant,
            content: content.to_string(),
            agent_name: agent.map(str::to_string),
            streaming: true,
            is_error: false,
        }
    }

    fn state(messages: Vec<ChatMessage>) -> ChatState {
        ChatState {
            messages,
            ..ChatState::default()
        }
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("/quit"), ChatCommand::Quit);
        assert_eq!(parse_command("/MODEL local:llama3:8b"), ChatCommand::Model("local:llama3:8b".into()));
        assert_eq!(parse_command("/open  abc "), ChatCommand::Open("abc".into()));
        assert_eq!(parse_command("/agent"), ChatCommand::None(String::new()));
        assert_eq!(parse_command("/bogus"), ChatCommand::None(String::new()));
        assert_eq!(parse_command("  hello there "), ChatCommand::None("hello there".into()));
    }

    #[test]
    fn test_printer_streams_increments() {
        let mut printer = ReplyPrinter::new(1, Vec::new());
        let user = ChatMessage {
            role: ChatRole::User,
            ..assistant("u", "question", None)
        };

        printer.render(&state(vec![user.clone(), assistant("a", "", None)]));
        printer.render(&state(vec![user.clone(), assistant("a", "Hel", Some("Librarian"))]));
        printer.render(&state(vec![user.clone(), assistant("a", "Hello", Some("Librarian"))]));
        printer.finish();

        let out = String::from_utf8(printer.out).unwrap();
        assert_eq!(out, "Librarian> Hello\n\n");
    }

    #[test]
    fn test_printer_marks_handoff() {
        let mut printer = ReplyPrinter::new(0, Vec::new());
        printer.render(&state(vec![assistant("a", "Let me ", Some("Triage"))]));
        printer.render(&state(vec![assistant("a", "Let me check.", Some("Billing"))]));

        let out = String::from_utf8(printer.out).unwrap();
        assert_eq!(out, "Triage> Let me \n[Billing] check.");
    }
}
