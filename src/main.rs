// Terminal client for a subject chat room

use std::collections::BTreeSet;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use subject_chat::chat::{Message, MessageId, Role, Roster};
use subject_chat::{ChatClient, ChatError, Config, ConnectionState, HttpChatApi, RoomHandle, RoomUpdate};

#[derive(Parser)]
#[command(name = "subject-chat")]
#[command(about = "Join a subject chat room from the terminal", long_about = None)]
struct Cli {
    /// Subject (room) id to open
    #[arg(short, long)]
    room: i64,

    /// Bearer token for the chat backend
    #[arg(short, long, env = "CHAT_TOKEN", hide_env_values = true)]
    token: String,

    /// Poll only, never open the push transport
    #[arg(long)]
    no_push: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("subject_chat=info"));
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "✗".red(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ChatError> {
    let mut config = Config::from_env();
    if cli.no_push {
        config.chat.push_url = None;
    }
    config.validate()?;

    let api = Arc::new(HttpChatApi::new(&config.api)?);
    let client = ChatClient::new(api, config.chat);

    println!("{}", format!("Opening room {}...", cli.room).cyan());
    let room = client.open_room(cli.room, &cli.token).await?;

    println!("\n{}", format!("Subject {}", cli.room).bold().green());
    println!("{}", "═".repeat(60).green());
    let mut shown = BTreeSet::new();
    print_new_messages(&room, &mut shown).await;
    print_roster(&room.roster().await);
    println!("Type a message and press enter. {} {} {}\n", "/who".cyan(), "/status".cyan(), "/quit".cyan());

    let mut updates = room.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                match line.trim() {
                    "/quit" | "/exit" => break,
                    "/who" => print_roster(&room.roster().await),
                    "/status" => println!("  Connection: {}", state_label(room.connection_state())),
                    "" => {}
                    text => match client.send(&room, text).await {
                        Ok(()) => {}
                        Err(ChatError::SendInProgress) => {
                            println!("{} Still sending the previous message", "!".yellow());
                        }
                        Err(e) => println!("{} Failed to send: {}", "✗".red(), e),
                    },
                }
            }
            update = updates.recv() => match update {
                Ok(RoomUpdate::Messages) | Err(RecvError::Lagged(_)) => {
                    print_new_messages(&room, &mut shown).await;
                }
                Ok(RoomUpdate::Roster) => {}
                Ok(RoomUpdate::Connection(state)) => {
                    println!("  {} {}", "·".dimmed(), state_label(state));
                }
                Ok(RoomUpdate::AuthRejected(reason)) => {
                    println!("{} Session rejected: {}", "✗".red(), reason);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.close_room(&room).await;
    println!("Goodbye!");
    Ok(())
}

async fn print_new_messages(room: &RoomHandle, shown: &mut BTreeSet<MessageId>) {
    let messages = room.messages().await;
    for message in unseen(&messages, shown) {
        print_message(message);
    }
}

/// Messages not printed yet, in store order. A catch-up can merge ids below
/// ones already shown, so this tracks every id rather than the newest.
fn unseen<'a>(messages: &'a [Message], shown: &mut BTreeSet<MessageId>) -> Vec<&'a Message> {
    messages.iter().filter(|m| shown.insert(m.id)).collect()
}

fn print_message(message: &Message) {
    let name = match message.sender_role {
        Role::Teacher => message.sender_name.bold().yellow(),
        _ if message.own => message.sender_name.bold().cyan(),
        _ => message.sender_name.bold(),
    };
    let time = message.created_at.as_deref().unwrap_or("");
    println!("{} {} {}", time.dimmed(), name, message.content);
}

fn print_roster(roster: &Roster) {
    println!(
        "\n{} {}/{} students online",
        "Participants".bold(),
        roster.online_students,
        roster.total_students
    );
    println!("{}", "─".repeat(60));
    for entry in &roster.participants {
        let marker = if entry.online { "●".green() } else { "○".dimmed() };
        println!("  {} {} ({})", marker, entry.name, entry.role);
    }
    println!();
}

fn state_label(state: ConnectionState) -> ColoredString {
    match state {
        ConnectionState::Connected => "live".green(),
        ConnectionState::Connecting => "connecting".yellow(),
        ConnectionState::Reconnecting => "reconnecting".yellow(),
        ConnectionState::Disconnected => "polling only".cyan(),
        ConnectionState::Closed => "closed".red(),
    }
}
