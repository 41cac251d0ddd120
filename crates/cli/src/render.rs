use std::io::{self, Write};

use opas_client::{
    ChatSnapshot, Dataframe, FollowUp, Message, Output, TurnId, TurnState, display_content,
    form_title,
};

const MAX_TABLE_ROWS: usize = 20;

/// Writes a conversation to a terminal as snapshots arrive.
///
/// Settled messages are written once. The trailing assistant reply of a
/// streaming turn is written as it grows.
pub struct TranscriptPrinter<W: Write> {
    out: W,
    /// Messages already written in full.
    committed: Vec<Message>,
    tail: Option<StreamingTail>,
    reported_turn: Option<TurnId>,
}

struct StreamingTail {
    index: usize,
    printed: String,
}

impl<W: Write> TranscriptPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            committed: Vec::new(),
            tail: None,
            reported_turn: None,
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }

    pub fn render(&mut self, snapshot: &ChatSnapshot) -> io::Result<()> {
        let messages = &snapshot.messages;
        let kept = self
            .committed
            .iter()
            .zip(messages)
            .take_while(|(written, current)| written == current)
            .count();
        if kept < self.committed.len() {
            if messages.is_empty() {
                writeln!(self.out, "(conversation cleared)")?;
            } else {
                writeln!(self.out, "(history rewritten)")?;
            }
            self.committed.truncate(kept);
            self.tail = None;
        }

        for index in self.committed.len()..messages.len() {
            let message = &messages[index];
            if snapshot.is_loading {
                // Unconfirmed output may still change; hold it and everything after.
                if message.is_provisional() {
                    break;
                }
                if index + 1 == messages.len() {
                    if is_streamable(message) {
                        self.stream_tail(index, message)?;
                    }
                    break;
                }
            }
            self.commit(index, message)?;
        }

        if !snapshot.is_loading {
            self.report_turn(snapshot)?;
        }
        self.out.flush()
    }

    fn stream_tail(&mut self, index: usize, message: &Message) -> io::Result<()> {
        let content = display_content(message);
        if let Some(tail) = self.tail.as_mut().filter(|tail| tail.index == index) {
            match content.strip_prefix(tail.printed.as_str()) {
                Some(delta) => write!(self.out, "{delta}")?,
                None => write!(self.out, "\n{content}")?,
            }
            tail.printed = content.into_owned();
            return Ok(());
        }

        write!(self.out, "assistant> {content}")?;
        self.tail = Some(StreamingTail {
            index,
            printed: content.into_owned(),
        });
        Ok(())
    }

    fn commit(&mut self, index: usize, message: &Message) -> io::Result<()> {
        match self.tail.take() {
            Some(tail) if tail.index == index => {
                let content = display_content(message);
                match content.strip_prefix(tail.printed.as_str()) {
                    Some(delta) => writeln!(self.out, "{delta}")?,
                    None => writeln!(self.out, "\n{content}")?,
                }
                self.write_extras(message)?;
            }
            _ => self.write_message(message)?,
        }
        self.committed.push(message.clone());
        Ok(())
    }

    fn write_message(&mut self, message: &Message) -> io::Result<()> {
        match message {
            Message::User(user) => match &user.input_response {
                Some(response) => writeln!(self.out, "  ✓ submitted {}", response.name)?,
                None => writeln!(self.out, "you> {}", display_content(message))?,
            },
            Message::Assistant(assistant) => match &assistant.function_call {
                Some(call) => writeln!(
                    self.out,
                    "  ↳ {}({})",
                    call.name,
                    serde_json::Value::Object(call.arguments.clone())
                )?,
                None => {
                    let content = display_content(message);
                    if !content.is_empty() {
                        writeln!(self.out, "assistant> {content}")?;
                    }
                    self.write_extras(message)?;
                }
            },
            Message::Function(function) => {
                writeln!(
                    self.out,
                    "  [{}]",
                    function.name.as_deref().unwrap_or("function")
                )?;
                for output in &function.outputs {
                    self.write_output(output)?;
                }
            }
        }
        Ok(())
    }

    fn write_extras(&mut self, message: &Message) -> io::Result<()> {
        if let Message::Assistant(assistant) = message {
            if let Some(request) = &assistant.input_request {
                writeln!(
                    self.out,
                    "  [input requested: {}] type /form to fill it in",
                    form_title(request)
                )?;
            }
        }
        Ok(())
    }

    fn write_output(&mut self, output: &Output) -> io::Result<()> {
        match output {
            Output::Text { text } => writeln!(self.out, "{text}"),
            Output::Dataframe { dataframe, title } => {
                if let Some(title) = title {
                    writeln!(self.out, "{title}")?;
                }
                write!(self.out, "{}", render_table(dataframe))
            }
            Output::Visualization { visualization } => {
                let traces = visualization
                    .data()
                    .and_then(serde_json::Value::as_array)
                    .map_or(0, Vec::len);
                writeln!(self.out, "  [visualization: {traces} trace(s)]")
            }
            Output::FollowUps { .. } => Ok(()),
        }
    }

    fn report_turn(&mut self, snapshot: &ChatSnapshot) -> io::Result<()> {
        let turn = match &snapshot.turn {
            TurnState::Done(turn) | TurnState::Cancelled(turn) => *turn,
            TurnState::Error { turn, .. } => *turn,
            TurnState::Idle | TurnState::Streaming(_) => return Ok(()),
        };
        if self.reported_turn == Some(turn) {
            return Ok(());
        }
        self.reported_turn = Some(turn);

        if matches!(snapshot.turn, TurnState::Cancelled(_)) {
            writeln!(self.out, "(stopped)")?;
        }
        if let Some(error) = &snapshot.error {
            writeln!(self.out, "error: {error}")?;
        }
        self.write_suggestions(snapshot.follow_ups())
    }

    pub fn write_suggestions(&mut self, suggestions: &[FollowUp]) -> io::Result<()> {
        for (number, suggestion) in suggestions.iter().enumerate() {
            writeln!(self.out, "  [{}] {}", number + 1, suggestion.title)?;
        }
        Ok(())
    }
}

/// Only plain assistant text is written while it streams.
fn is_streamable(message: &Message) -> bool {
    matches!(message, Message::Assistant(assistant) if assistant.function_call.is_none())
}

pub fn render_table(dataframe: &Dataframe) -> String {
    let mut widths: Vec<usize> = dataframe
        .cols
        .iter()
        .map(|col| col.chars().count())
        .collect();
    for row in dataframe.rows.iter().take(MAX_TABLE_ROWS) {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut table = table_line(&dataframe.cols, &widths);
    let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
    table.push_str(&format!("|-{}-|\n", rule.join("-|-")));
    for row in dataframe.rows.iter().take(MAX_TABLE_ROWS) {
        table.push_str(&table_line(row, &widths));
    }
    if dataframe.rows.len() > MAX_TABLE_ROWS {
        table.push_str(&format!(
            "... {} more rows\n",
            dataframe.rows.len() - MAX_TABLE_ROWS
        ));
    }
    table
}

fn table_line(cells: &[String], widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect();
    format!("| {} |\n", padded.join(" | "))
}
