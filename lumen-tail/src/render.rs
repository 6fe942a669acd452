//! Terminal output for a tailed room.

use std::collections::HashSet;

use chrono::Local;
use lumen_chat::RoomView;
use lumen_core::{Message, MessageId};

/// One line per message: `[HH:MM:SS] name: text (+N attachments)`.
pub fn format_message(message: &Message) -> String {
    let time = message.created_at.with_timezone(&Local).format("%H:%M:%S");
    let mut line = format!("[{time}] {}:", message.sender.display_name);
    if let Some(content) = &message.content {
        line.push(' ');
        line.push_str(content);
    }
    match message.attachments.len() {
        0 => {}
        1 => line.push_str(" (+1 attachment)"),
        n => line.push_str(&format!(" (+{n} attachments)")),
    }
    line
}

/// Prints each message of a view once.
#[derive(Debug, Default)]
pub struct Printer {
    printed: HashSet<MessageId>,
}

impl Printer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of `view` not printed yet, in view order.
    pub fn unseen<'a>(&mut self, view: &'a RoomView) -> Vec<&'a Message> {
        view.messages
            .iter()
            .filter(|m| self.printed.insert(m.id.clone()))
            .collect()
    }

    pub fn print_new(&mut self, view: &RoomView) {
        for message in self.unseen(view) {
            println!("{}", format_message(message));
        }
    }
}
