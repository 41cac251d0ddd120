use std::future::Future;
use std::io::Write;

use opas_client::{
    Arguments, ChatError, ChatResult, ChatSession, ChatSnapshot, FollowUp, InputRequest, Message,
    build_arguments, form_fields, form_title, is_control_record, pending_input_request,
};
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::watch;

use crate::error::{ChatSnafu, CliResult, TerminalSnafu};
use crate::render::TranscriptPrinter;
use crate::settings::ClientSettings;

const HELP: &str = "\
commands:
  <text>            send a message
  /stop             stop the streaming reply (or press Ctrl-C)
  /clear            clear the conversation
  /follow <n>       send suggestion <n>
  /form             fill in the pending input request
  /edit <n> <text>  rewrite your <n>-th message and reload
  /help             show this help
  /quit             exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Stop,
    Clear,
    Follow(usize),
    Form,
    Edit { number: usize, text: String },
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((command, ""));
    match name {
        "stop" => Command::Stop,
        "clear" => Command::Clear,
        "form" => Command::Form,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "follow" => match rest.parse() {
            Ok(number) if number > 0 => Command::Follow(number),
            _ => Command::Invalid("usage: /follow <n>".to_string()),
        },
        "edit" => {
            let (number, text) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            match number.parse() {
                Ok(number) if number > 0 && !text.trim().is_empty() => Command::Edit {
                    number,
                    text: text.trim().to_string(),
                },
                _ => Command::Invalid("usage: /edit <n> <text>".to_string()),
            }
        }
        other => Command::Invalid(format!("unknown command `/{other}`, try /help")),
    }
}

/// Follow-ups of the last reply, or the starter prompts while the conversation
/// is empty.
pub fn suggestions(snapshot: &ChatSnapshot, settings: &ClientSettings) -> Vec<FollowUp> {
    if snapshot.messages.is_empty() {
        settings.starter_prompts.clone()
    } else {
        snapshot.follow_ups().to_vec()
    }
}

/// Position of the `number`-th (1-based) message the user typed.
pub fn user_message_index(messages: &[Message], number: usize) -> Option<usize> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, message)| matches!(message, Message::User(_)) && !is_control_record(message))
        .nth(number.checked_sub(1)?)
        .map(|(index, _)| index)
}

pub async fn run(settings: &ClientSettings) -> CliResult<()> {
    let session = ChatSession::with_options(
        settings.transport(),
        Vec::new(),
        settings.session_options(),
    );
    tracing::info!(endpoint = %settings.chat_endpoint(), stream = settings.stream, "chat session ready");

    greet(settings);
    let printer = tokio::spawn(print_updates(session.subscribe()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context(TerminalSnafu { stage: "read-command" })?,
            _ = tokio::signal::ctrl_c() => {
                if session.stop() {
                    continue;
                }
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        match parse_command(&line) {
            Command::Empty => {}
            Command::Say(text) => send(&session, Message::user_text(text)),
            Command::Stop => {
                if !session.stop() {
                    eprintln!("nothing is streaming");
                }
            }
            Command::Clear => {
                if let Err(error) = session.clear_messages() {
                    eprintln!("{error}");
                }
            }
            Command::Follow(number) => {
                let offered = suggestions(&session.snapshot(), settings);
                match offered.get(number - 1) {
                    Some(suggestion) => {
                        send(&session, Message::user_text(suggestion.prompt.clone()))
                    }
                    None => eprintln!("no suggestion [{number}]"),
                }
            }
            Command::Form => {
                let pending = pending_input_request(&session.messages()).cloned();
                match pending {
                    Some(request) => {
                        if let Some(values) = fill_form(&request, &mut lines).await? {
                            let session = session.clone();
                            spawn_turn(async move { session.submit_input(&request, values).await });
                        }
                    }
                    None => eprintln!("no input request is pending"),
                }
            }
            Command::Edit { number, text } => {
                match user_message_index(&session.messages(), number) {
                    Some(index) => {
                        let session = session.clone();
                        spawn_turn(async move {
                            session.edit(index, Message::user_text(text)).await
                        });
                    }
                    None => eprintln!("no message [{number}]"),
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
            Command::Invalid(message) => eprintln!("{message}"),
        }
    }

    session.stop();
    printer.abort();
    Ok(())
}

pub async fn list_functions(settings: &ClientSettings) -> CliResult<()> {
    let functions = settings
        .catalog()
        .list(&settings.assistant_id)
        .await
        .context(ChatSnafu {
            stage: "list-functions",
        })?;

    if functions.is_empty() {
        println!("{} has no functions", settings.assistant_id);
    }
    for function in functions {
        println!("{} ({})", function.title(), function.id);
        if !function.description.is_empty() {
            println!("  {}", function.description);
        }
        for question in &function.sample_questions {
            println!("  * {question}");
        }
    }
    Ok(())
}

fn greet(settings: &ClientSettings) {
    if let Some(welcome) = &settings.welcome_message {
        println!("{welcome}");
    }
    for (number, prompt) in settings.starter_prompts.iter().enumerate() {
        println!("  [{}] {}", number + 1, prompt.title);
    }
    println!("type /help for commands");
}

fn send(session: &ChatSession, message: Message) {
    if session.is_loading() {
        eprintln!("a reply is still streaming, /stop to cancel it");
        return;
    }
    let session = session.clone();
    spawn_turn(async move { session.append(Some(message)).await });
}

fn spawn_turn<F>(turn: F)
where
    F: Future<Output = ChatResult<opas_client::TurnOutcome>> + Send + 'static,
{
    tokio::spawn(async move {
        match turn.await {
            Ok(outcome) => tracing::debug!(?outcome, "turn finished"),
            // These never reach the transcript.
            Err(error @ (ChatError::TurnInProgress { .. } | ChatError::Schema { .. })) => {
                eprintln!("{error}");
            }
            Err(error) => tracing::debug!(%error, "turn failed"),
        }
    });
}

async fn print_updates(mut updates: watch::Receiver<ChatSnapshot>) {
    let mut printer = TranscriptPrinter::new(std::io::stdout());
    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();
        if let Err(error) = printer.render(&snapshot) {
            tracing::warn!(%error, "failed to write transcript");
            break;
        }
    }
}

/// Prompts for every field. `None` when input ends before the form is done.
async fn fill_form(
    request: &InputRequest,
    lines: &mut Lines<BufReader<Stdin>>,
) -> CliResult<Option<Arguments>> {
    println!("{}", form_title(request));
    let mut values = Arguments::new();

    for field in form_fields(request) {
        if let Some(description) = &field.description {
            println!("  {description}");
        }
        loop {
            let mut prompt = field.display_label();
            if !field.options.is_empty() {
                let options: Vec<String> = field.options.iter().map(ToString::to_string).collect();
                prompt.push_str(&format!(" ({})", options.join(", ")));
            }
            if let Some(prefill) = &field.prefill {
                prompt.push_str(&format!(" [{prefill}]"));
            }
            print!("{prompt}: ");
            std::io::stdout()
                .flush()
                .context(TerminalSnafu { stage: "flush-form-prompt" })?;

            let Some(input) = lines
                .next_line()
                .await
                .context(TerminalSnafu { stage: "read-form-field" })?
            else {
                return Ok(None);
            };
            match field.coerce(&input) {
                Ok(Some(value)) => {
                    values.insert(field.name.clone(), value);
                    break;
                }
                Ok(None) => break,
                Err(error) => eprintln!("{error}"),
            }
        }
    }

    match build_arguments(request, values) {
        Ok(arguments) => Ok(Some(arguments)),
        Err(error) => {
            eprintln!("{error}");
            Ok(None)
        }
    }
}
