use anyhow::Result;
use std::io::Write;
use log::{LevelFilter, Record};
use std::fs::OpenOptions;
use chrono::{DateTime, Local};

use chatsync::models::{DeliveryState, Message, MessageClass, Notification};

pub struct SimpleLogger {
    log_file: Option<std::fs::File>,
}

impl SimpleLogger {
    pub fn new(log_file_path: Option<&str>) -> Result<Self> {
        let log_file = if let Some(path) = log_file_path {
            Some(OpenOptions::new().create(true).append(true).open(path)?)
        } else {
            None
        };

        Ok(SimpleLogger { log_file })
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now: DateTime<Local> = Local::now();
            let log_message = format!(
                "[{}] {} [{}:{}] {}\n",
                now.format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            );

            if let Some(file) = &self.log_file {
                let mut file = file;
                let _ = file.write_all(log_message.as_bytes());
            } else {
                // stdout belongs to the chat, so fall back to stderr
                eprint!("{}", log_message);
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.log_file {
            let mut file = file;
            let _ = file.flush();
        } else {
            let _ = std::io::stderr().flush();
        }
    }
}

/// Read a line of input from stdin, trimming whitespace
pub fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub fn setup_logging(log_file: Option<&str>, level: LevelFilter) -> Result<()> {
    let logger = SimpleLogger::new(log_file)?;
    log::set_boxed_logger(Box::new(logger))
        .map(|()| log::set_max_level(level))?;

    log::info!("Logging initialized at level: {}", level);
    log::info!("App version: {} ({})", env!("CARGO_PKG_VERSION"), env!("CARGO_PKG_NAME"));

    Ok(())
}

/// One line per message: time, sender, class marker, text, delivery ticks
pub fn format_message(message: &Message, self_id: &str) -> String {
    let who = if message.sender_id == self_id { "me" } else { message.sender_id.as_str() };
    let marker = match message.message_class {
        MessageClass::Urgent => "[!] ",
        MessageClass::Task => "[task] ",
        MessageClass::File | MessageClass::Text => "",
    };
    let mut line = format!(
        "{} <{}> {}{}",
        message.sent_at.with_timezone(&Local).format("%H:%M"),
        who,
        marker,
        message.text_or_empty()
    );
    for attachment in &message.attachments {
        line.push_str(&format!(" [{}]", attachment.name));
    }
    if message.sender_id == self_id {
        line.push_str(match message.delivery_state {
            DeliveryState::Optimistic => " ...",
            DeliveryState::Delivered => " ✓",
            DeliveryState::Read => " ✓✓",
        });
    }
    line
}

pub fn format_notification(notification: &Notification) -> String {
    format!(
        "{} {} {}: {}",
        if notification.read { " " } else { "*" },
        notification.id,
        notification.title,
        notification.message
    )
}
