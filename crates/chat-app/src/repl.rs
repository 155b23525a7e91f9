use std::io::Write;
use std::ops::ControlFlow;

use murmur_chat::{ChatSession, ConversationSnapshot, Notice, normalize_bullets};
use murmur_storage::{MessageId, MessageRecord, MessageStatus, Sender};
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use crate::app::{AppResult, ReadInputSnafu, SessionSnafu, WriteOutputSnafu};

const HELP: &str = "\
Commands:
  /stop        stop the reply being generated
  /clear       delete the whole conversation
  /history     list the conversation with message numbers
  /delete <n>  delete message n and everything after it
  /help        show this help
  /quit        exit
Anything else is sent as a prompt.
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Send(String),
    Stop,
    Clear,
    History,
    Delete(usize),
    Help,
    Quit,
    Invalid(String),
    Empty,
}

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }

        let Some(command) = line.strip_prefix('/') else {
            return Self::Send(line.to_string());
        };

        let mut words = command.split_whitespace();
        match (words.next().unwrap_or_default(), words.next(), words.next()) {
            ("stop", None, _) => Self::Stop,
            ("clear", None, _) => Self::Clear,
            ("history", None, _) => Self::History,
            ("delete", Some(number), None) => match number.parse::<usize>() {
                Ok(number) if number > 0 => Self::Delete(number),
                _ => Self::Invalid(delete_usage()),
            },
            ("delete", _, _) => Self::Invalid(delete_usage()),
            ("help" | "h" | "?", None, _) => Self::Help,
            ("quit" | "exit" | "q", None, _) => Self::Quit,
            _ => Self::Invalid(format!(
                "unknown command: {line}. Type /help for commands"
            )),
        }
    }
}

fn delete_usage() -> String {
    "usage: /delete <n>, where n is a message number from /history".to_string()
}

/// Line-oriented front end for one chat session.
pub struct Repl {
    session: ChatSession,
    backend_name: String,
    printer: ReplyPrinter,
}

impl Repl {
    pub fn new(session: ChatSession, backend_name: impl Into<String>) -> Self {
        Self {
            session,
            backend_name: backend_name.into(),
            printer: ReplyPrinter::default(),
        }
    }

    pub async fn run(mut self) -> AppResult<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut snapshots = self.session.subscribe();
        let mut notices = self.session.notices();
        let mut stdout = std::io::stdout();

        let snapshot = snapshots.borrow_and_update().clone();
        self.printer
            .prime(&snapshot, &mut stdout)
            .context(WriteOutputSnafu { stage: "prime" })?;
        write_text(&mut stdout, &self.welcome(&snapshot), "welcome")?;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context(ReadInputSnafu { stage: "read-stdin" })? else {
                        break;
                    };
                    if self.execute(ReplCommand::parse(&line), &mut stdout).await?.is_break() {
                        break;
                    }
                }
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    self.printer
                        .render(&snapshot, &mut stdout)
                        .context(WriteOutputSnafu { stage: "render-reply" })?;
                }
                notice = notices.recv() => match notice {
                    Ok(notice) => report(&notice),
                    Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "notices were dropped"),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }

    async fn execute(
        &mut self,
        command: ReplCommand,
        out: &mut impl Write,
    ) -> AppResult<ControlFlow<()>> {
        match command {
            ReplCommand::Empty => {}
            ReplCommand::Send(text) => {
                self.session
                    .send(text)
                    .await
                    .context(SessionSnafu { stage: "send" })?;
            }
            ReplCommand::Stop => {
                self.session
                    .stop()
                    .await
                    .context(SessionSnafu { stage: "stop" })?;
            }
            ReplCommand::Clear => {
                self.session
                    .clear_history()
                    .await
                    .context(SessionSnafu {
                        stage: "clear-history",
                    })?;
                self.reprime(out)?;
                write_text(out, "history cleared\n", "clear-history")?;
            }
            ReplCommand::History => {
                let snapshot = self.session.snapshot();
                write_text(out, &render_history(&snapshot.messages), "history")?;
            }
            ReplCommand::Delete(number) => {
                let snapshot = self.session.snapshot();
                let Some(from) = number
                    .checked_sub(1)
                    .and_then(|index| snapshot.messages.get(index))
                    .map(|message| message.timestamp)
                else {
                    let text = format!("no message #{number}, see /history\n");
                    write_text(out, &text, "delete-from")?;
                    return Ok(ControlFlow::Continue(()));
                };
                self.session
                    .delete_from(from)
                    .await
                    .context(SessionSnafu {
                        stage: "delete-from",
                    })?;
                self.reprime(out)?;
                let text = format!("deleted message #{number} and everything after it\n");
                write_text(out, &text, "delete-from")?;
            }
            ReplCommand::Help => write_text(out, HELP, "help")?,
            ReplCommand::Quit => return Ok(ControlFlow::Break(())),
            ReplCommand::Invalid(message) => {
                write_text(out, &format!("{message}\n"), "invalid")?;
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    /// The tail changed under the printer; resynchronise it.
    fn reprime(&mut self, out: &mut impl Write) -> AppResult<()> {
        self.printer
            .prime(&self.session.snapshot(), out)
            .context(WriteOutputSnafu { stage: "prime" })
    }

    fn welcome(&self, snapshot: &ConversationSnapshot) -> String {
        format!(
            "murmur, replying with {}. {} message(s) in history. Type /help for commands.\n",
            self.backend_name,
            snapshot.messages.len()
        )
    }
}

fn report(notice: &Notice) {
    eprintln!("! {notice}");
}

fn write_text(out: &mut impl Write, text: &str, stage: &'static str) -> AppResult<()> {
    out.write_all(text.as_bytes())
        .and_then(|()| out.flush())
        .context(WriteOutputSnafu { stage })
}

pub fn render_history(messages: &[MessageRecord]) -> String {
    if messages.is_empty() {
        return "no messages\n".to_string();
    }

    let mut rendered = String::new();
    for (index, message) in messages.iter().enumerate() {
        let speaker = match message.sender {
            Sender::User => "you",
            Sender::Assistant => "assistant",
        };
        let marker = match message.status {
            MessageStatus::Pending => " (streaming)",
            MessageStatus::Failed => " (failed)",
            MessageStatus::Committed => "",
        };
        let text = match message.sender {
            Sender::User => message.text().to_string(),
            Sender::Assistant => normalize_bullets(message.text()),
        };
        let text = text.replace('\n', "\n     ");
        rendered.push_str(&format!("{:>3}. {speaker}{marker}: {text}\n", index + 1));
    }
    rendered
}

/// Streams the newest assistant reply to a terminal incrementally.
///
/// Output only grows: a trailing `*` at a line start is held back until the
/// next fragment shows whether it turns into a bullet.
#[derive(Debug, Default)]
pub struct ReplyPrinter {
    current: Option<MessageId>,
    printed: usize,
    finished: bool,
}

impl ReplyPrinter {
    /// Treats whatever reply ends `snapshot` as already shown.
    pub fn prime(
        &mut self,
        snapshot: &ConversationSnapshot,
        out: &mut impl Write,
    ) -> std::io::Result<()> {
        self.close_open_line(out)?;
        self.current = snapshot
            .last()
            .filter(|message| message.sender == Sender::Assistant)
            .map(|message| message.id);
        self.printed = 0;
        self.finished = true;
        Ok(())
    }

    pub fn render(
        &mut self,
        snapshot: &ConversationSnapshot,
        out: &mut impl Write,
    ) -> std::io::Result<()> {
        let Some(reply) = snapshot
            .last()
            .filter(|message| message.sender == Sender::Assistant)
        else {
            self.close_open_line(out)?;
            return out.flush();
        };

        if self.current != Some(reply.id) {
            self.close_open_line(out)?;
            self.current = Some(reply.id);
            self.printed = 0;
            self.finished = false;
            out.write_all(b"assistant> ")?;
        }
        if self.finished {
            return Ok(());
        }

        let text = normalize_bullets(reply.text());
        let streaming = reply.status == MessageStatus::Pending;
        let visible = if streaming {
            stable_len(&text)
        } else {
            text.len()
        };
        if visible > self.printed {
            out.write_all(&text.as_bytes()[self.printed..visible])?;
            self.printed = visible;
        }

        if !streaming {
            if reply.status == MessageStatus::Failed {
                out.write_all(b" [incomplete]")?;
            }
            out.write_all(b"\n")?;
            self.finished = true;
        }
        out.flush()
    }

    fn close_open_line(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        if self.current.is_some() && !self.finished {
            out.write_all(b"\n")?;
        }
        self.finished = true;
        Ok(())
    }
}

fn stable_len(text: &str) -> usize {
    let Some(before) = text.strip_suffix('*') else {
        return text.len();
    };
    if before.is_empty() || before.ends_with('\n') {
        before.len()
    } else {
        text.len()
    }
}

#[cfg(test)]
mod tests {
    use murmur_storage::{MessageContent, Timestamp};

    use super::*;

    fn record(
        id: MessageId,
        micros: i64,
        sender: Sender,
        text: &str,
        status: MessageStatus,
    ) -> MessageRecord {
        MessageRecord::new(
            id,
            Timestamp::from_micros(micros),
            sender,
            MessageContent::text(text),
            status,
        )
    }

    fn user_prompt() -> MessageRecord {
        record(
            MessageId::new_v7(),
            1,
            Sender::User,
            "Hi",
            MessageStatus::Committed,
        )
    }

    fn assistant(text: &str, status: MessageStatus) -> MessageRecord {
        record(MessageId::new_v7(), 2, Sender::Assistant, text, status)
    }

    fn snapshot(messages: Vec<MessageRecord>) -> ConversationSnapshot {
        let generating = messages
            .iter()
            .any(|message| message.status == MessageStatus::Pending);
        ConversationSnapshot {
            messages,
            generating,
        }
    }

    fn rendered(output: &[u8]) -> String {
        String::from_utf8(output.to_vec()).expect("utf8")
    }

    #[test]
    fn commands_parse() {
        assert_eq!(
            ReplCommand::parse("  hello there "),
            ReplCommand::Send("hello there".to_string())
        );
        assert_eq!(ReplCommand::parse("/stop"), ReplCommand::Stop);
        assert_eq!(ReplCommand::parse("/clear"), ReplCommand::Clear);
        assert_eq!(ReplCommand::parse("/history"), ReplCommand::History);
        assert_eq!(ReplCommand::parse("/delete 3"), ReplCommand::Delete(3));
        assert_eq!(ReplCommand::parse("/quit"), ReplCommand::Quit);
        assert_eq!(ReplCommand::parse("   "), ReplCommand::Empty);
    }

    #[test]
    fn bad_commands_explain_themselves() {
        assert!(matches!(ReplCommand::parse("/delete"), ReplCommand::Invalid(_)));
        assert!(matches!(ReplCommand::parse("/delete 0"), ReplCommand::Invalid(_)));
        assert!(matches!(ReplCommand::parse("/delete two"), ReplCommand::Invalid(_)));
        assert!(matches!(ReplCommand::parse("/stop now"), ReplCommand::Invalid(_)));
        assert!(matches!(ReplCommand::parse("/dance"), ReplCommand::Invalid(_)));
    }

    #[test]
    fn history_is_numbered_and_bullets_are_normalized() {
        let messages = vec![
            record(
                MessageId::new_v7(),
                1,
                Sender::User,
                "list please",
                MessageStatus::Committed,
            ),
            record(
                MessageId::new_v7(),
                2,
                Sender::Assistant,
                "* a\n* b",
                MessageStatus::Failed,
            ),
        ];
        assert_eq!(
            render_history(&messages),
            "  1. you: list please\n  2. assistant (failed): • a\n     • b\n"
        );
        assert_eq!(render_history(&[]), "no messages\n");
    }

    #[test]
    fn reply_streams_incrementally_and_holds_back_a_possible_bullet() {
        let id = MessageId::new_v7();
        let user = user_prompt();
        let mut printer = ReplyPrinter::default();
        let mut output = Vec::new();

        for (text, status) in [
            ("Items:\n*", MessageStatus::Pending),
            ("Items:\n* one", MessageStatus::Pending),
            ("Items:\n* one", MessageStatus::Committed),
        ] {
            let reply = record(id, 2, Sender::Assistant, text, status);
            let view = snapshot(vec![user.clone(), reply]);
            printer.render(&view, &mut output).expect("render");
        }

        assert_eq!(rendered(&output), "assistant> Items:\n• one\n");
    }

    #[test]
    fn primed_history_is_not_reprinted() {
        let old = assistant("old reply", MessageStatus::Committed);
        let mut printer = ReplyPrinter::default();
        let mut output = Vec::new();

        printer.prime(&snapshot(vec![old.clone()]), &mut output).expect("prime");
        printer.render(&snapshot(vec![old]), &mut output).expect("render");

        assert!(output.is_empty());
    }

    #[test]
    fn abandoned_placeholder_closes_the_line() {
        let user = user_prompt();
        let placeholder = assistant("", MessageStatus::Pending);
        let mut printer = ReplyPrinter::default();
        let mut output = Vec::new();

        printer
            .render(&snapshot(vec![user.clone(), placeholder]), &mut output)
            .expect("render");
        printer.render(&snapshot(vec![user]), &mut output).expect("render");

        assert_eq!(rendered(&output), "assistant> \n");
    }

    #[test]
    fn failed_reply_is_marked() {
        let reply = assistant("ab", MessageStatus::Failed);
        let mut printer = ReplyPrinter::default();
        let mut output = Vec::new();

        printer.render(&snapshot(vec![reply]), &mut output).expect("render");

        assert_eq!(rendered(&output), "assistant> ab [incomplete]\n");
    }
}
