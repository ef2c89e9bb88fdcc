//! Terminal rendering for the CLI

use crate::types::{AgentRecord, DmConversation, Message, SearchResult, TopicInfo};
use chrono::{DateTime, Local, Utc};
use std::io::{self, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Stdout stream honouring the `--color` switch
pub fn stdout(color: bool) -> StandardStream {
    let choice = if color {
        ColorChoice::Auto
    } else {
        ColorChoice::Never
    };
    StandardStream::stdout(choice)
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(t) => t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

/// Body on a single line; newlines become spaces so byte offsets stay valid
fn one_line(body: &str) -> String {
    body.replace(['\n', '\r'], " ")
}

fn write_colored<W: WriteColor>(out: &mut W, spec: &ColorSpec, text: &str) -> io::Result<()> {
    out.set_color(spec)?;
    write!(out, "{}", text)?;
    out.reset()
}

fn fg(color: Color) -> ColorSpec {
    let mut spec = ColorSpec::new();
    spec.set_fg(Some(color));
    spec
}

pub fn write_topics<W: WriteColor>(out: &mut W, topics: &[TopicInfo]) -> io::Result<()> {
    for topic in topics {
        write_colored(out, fg(Color::Magenta).set_bold(true), &topic.name)?;
        write!(out, "  {} messages  ", topic.message_count)?;
        write_colored(out, &fg(Color::Green), &format_time(topic.last_activity))?;
        if let Some(last) = &topic.last_message {
            write!(out, "  last from ")?;
            write_colored(out, &fg(Color::Cyan), &last.from)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// One message per line: `<id> <from> -> <to> [tags]: <body>`
pub fn write_message<W: WriteColor>(out: &mut W, message: &Message) -> io::Result<()> {
    write_colored(out, &fg(Color::Green), &message.id)?;
    write!(out, " ")?;
    write_colored(out, &fg(Color::Cyan), &message.from)?;
    write!(out, " -> {}", message.to)?;
    if message.priority == "high" {
        write!(out, " ")?;
        write_colored(out, fg(Color::Red).set_bold(true), "!")?;
    }
    let tags = message.sorted_tags();
    if !tags.is_empty() {
        write!(out, " ")?;
        write_colored(out, &fg(Color::Yellow), &format!("[{}]", tags.join(",")))?;
    }
    writeln!(out, ": {}", one_line(&message.body_text()))
}

pub fn write_messages<W: WriteColor>(out: &mut W, messages: &[Message]) -> io::Result<()> {
    for message in messages {
        write_message(out, message)?;
    }
    Ok(())
}

pub fn write_conversations<W: WriteColor>(out: &mut W, conversations: &[DmConversation]) -> io::Result<()> {
    for conversation in conversations {
        write_colored(out, fg(Color::Cyan).set_bold(true), &format!("@{}", conversation.agent))?;
        write!(out, "  {} messages  ", conversation.message_count)?;
        write_colored(out, &fg(Color::Green), &format_time(conversation.last_activity))?;
        if let Some(last) = &conversation.last_message {
            write!(out, "  {}", one_line(&last.body_text()))?;
        }
        writeln!(out)?;
    }
    Ok(())
}

pub fn write_agents<W: WriteColor>(out: &mut W, agents: &[AgentRecord]) -> io::Result<()> {
    for agent in agents {
        write_colored(out, fg(Color::Cyan).set_bold(true), &agent.name)?;
        if !agent.host.is_empty() {
            write!(out, "@{}", agent.host)?;
        }
        if !agent.status.is_empty() {
            write!(out, "  ({})", agent.status)?;
        }
        write!(out, "  last seen ")?;
        write_colored(out, &fg(Color::Green), &format_time(Some(agent.last_seen)))?;
        writeln!(out)?;
    }
    Ok(())
}

/// Search hits grouped by target, with neighbouring messages as context
pub fn write_search_results<W: WriteColor>(out: &mut W, results: &[SearchResult]) -> io::Result<()> {
    let mut current_target: Option<&str> = None;
    for result in results {
        if current_target != Some(result.topic.as_str()) {
            if current_target.is_some() {
                writeln!(out)?;
            }
            write_colored(out, fg(Color::Magenta).set_bold(true), &result.topic)?;
            writeln!(out)?;
            current_target = Some(result.topic.as_str());
        } else {
            write_colored(out, &fg(Color::Cyan), "--")?;
            writeln!(out)?;
        }

        if let Some(prev) = &result.prev {
            write_context_line(out, prev)?;
        }
        write_match_line(out, result)?;
        if let Some(next) = &result.next {
            write_context_line(out, next)?;
        }
    }
    Ok(())
}

fn write_context_line<W: WriteColor>(out: &mut W, message: &Message) -> io::Result<()> {
    write_colored(out, &fg(Color::Green), &message.id)?;
    write!(out, "-{}-", message.from)?;
    writeln!(out, "{}", one_line(&message.body_text()))
}

fn write_match_line<W: WriteColor>(out: &mut W, result: &SearchResult) -> io::Result<()> {
    let message = &result.message;
    write_colored(out, &fg(Color::Green), &message.id)?;
    write!(out, ":")?;
    write_colored(out, &fg(Color::Cyan), &message.from)?;
    write!(out, ":")?;

    let body = one_line(&message.body_text());
    let Some(start) = result.match_offset.filter(|s| *s <= body.len()) else {
        return writeln!(out, "{}", body);
    };
    let end = (start + result.match_length).min(body.len());
    if !body.is_char_boundary(start) || !body.is_char_boundary(end) {
        return writeln!(out, "{}", body);
    }

    write!(out, "{}", &body[..start])?;
    if end > start {
        write_colored(out, fg(Color::Red).set_bold(true), &body[start..end])?;
    }
    writeln!(out, "{}", &body[end..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use termcolor::{Buffer, NoColor};

    fn msg(id: &str, from: &str, body: &str) -> Message {
        Message {
            id: id.into(),
            from: from.into(),
            to: "task".into(),
            time: Utc::now(),
            body: json!(body),
            reply_to: String::new(),
            priority: String::new(),
            host: String::new(),
            tags: vec!["release".into()],
        }
    }

    fn render(f: impl FnOnce(&mut NoColor<Vec<u8>>) -> io::Result<()>) -> String {
        let mut out = NoColor::new(Vec::new());
        f(&mut out).unwrap();
        String::from_utf8(out.into_inner()).unwrap()
    }

    #[test]
    fn test_message_line() {
        let text = render(|out| write_message(out, &msg("20260101-000000-0001", "alice", "deploy\nready")));
        assert_eq!(text, "20260101-000000-0001 alice -> task [release]: deploy ready\n");
    }

    #[test]
    fn test_search_results_with_context() {
        let result = SearchResult {
            topic: "task".into(),
            message: msg("20260101-000000-0002", "bob", "deploy done"),
            match_offset: Some(0),
            match_length: 6,
            prev: Some(msg("20260101-000000-0001", "alice", "deploy ready")),
            next: None,
        };
        let text = render(|out| write_search_results(out, &[result]));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "task");
        assert_eq!(lines[1], "20260101-000000-0001-alice-deploy ready");
        assert_eq!(lines[2], "20260101-000000-0002:bob:deploy done");
    }

    #[test]
    fn test_highlight_emits_color_codes() {
        let result = SearchResult {
            topic: "task".into(),
            message: msg("20260101-000000-0002", "bob", "deploy done"),
            match_offset: Some(7),
            match_length: 4,
            prev: None,
            next: None,
        };
        let mut out = Buffer::ansi();
        write_match_line(&mut out, &result).unwrap();
        let text = String::from_utf8(out.into_inner()).unwrap();
        assert!(text.contains("\u{1b}["));
        assert!(text.contains("done"));
    }

    #[test]
    fn test_out_of_range_offset_prints_plain() {
        let result = SearchResult {
            topic: "task".into(),
            message: msg("20260101-000000-0002", "bob", "short"),
            match_offset: Some(99),
            match_length: 3,
            prev: None,
            next: None,
        };
        let text = render(|out| write_match_line(out, &result));
        assert_eq!(text, "20260101-000000-0002:bob:short\n");
    }
}
