use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
};
use crate::app::{App, InputMode, Screen};
use crate::conversation::{Message, Phase, Sender, CONNECT_ERROR_TEXT, REPLY_ERROR_TEXT};
use crate::gateway::Source;
use crate::persona::Persona;

/// Parse a line of text and convert **bold** markdown to styled spans
fn parse_markdown_line(text: &str) -> Line<'static> {
    let mut spans: Vec<Span<'static>> = Vec::new();
    let mut chars = text.chars().peekable();
    let mut current_text = String::new();

    while let Some(c) = chars.next() {
        if c == '*' && chars.peek() == Some(&'*') {
            chars.next();

            if !current_text.is_empty() {
                spans.push(Span::raw(std::mem::take(&mut current_text)));
            }

            // Find closing **
            let mut bold_text = String::new();
            let mut found_close = false;
            while let Some(c) = chars.next() {
                if c == '*' && chars.peek() == Some(&'*') {
                    chars.next();
                    found_close = true;
                    break;
                }
                bold_text.push(c);
            }

            if found_close && !bold_text.is_empty() {
                spans.push(Span::styled(
                    bold_text,
                    Style::default().add_modifier(Modifier::BOLD),
                ));
            } else {
                // No closing **, treat as literal
                current_text.push_str("**");
                current_text.push_str(&bold_text);
            }
        } else {
            current_text.push(c);
        }
    }

    if !current_text.is_empty() {
        spans.push(Span::raw(current_text));
    }

    if spans.is_empty() {
        Line::default()
    } else {
        Line::from(spans)
    }
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    // Main layout: header, body, footer
    let [header_area, body_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);

    match app.screen {
        Screen::PersonaPicker => render_persona_picker(app, frame, body_area),
        Screen::Chat => render_chat_screen(app, frame, body_area),
    }

    render_footer(app, frame, footer_area);

    if app.show_api_key_input {
        render_api_key_input(app, frame, area);
    }
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let persona = app
        .active_persona()
        .map(|p| format!(" [{}]", p.display_name()))
        .unwrap_or_default();

    let title = Line::from(vec![
        Span::styled(" FinBot ", Style::default().fg(Color::Cyan).bold()),
        Span::styled("Your Personal Finance Assistant", Style::default().fg(Color::White)),
        Span::styled(persona, Style::default().fg(Color::Yellow)),
        Span::raw(" "),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::DarkGray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let mode_style = match app.input_mode {
        InputMode::Normal => Style::default().bg(Color::Blue).fg(Color::White),
        InputMode::Editing => Style::default().bg(Color::Yellow).fg(Color::Black),
    };

    let mode_text = match (app.screen, app.input_mode) {
        (Screen::PersonaPicker, _) => " PROFILE ",
        (Screen::Chat, InputMode::Normal) => " CHAT ",
        (Screen::Chat, InputMode::Editing) => " TYPE ",
    };

    // Key style: dark background with bright text for visibility on both light/dark terminals
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);
    let hint = |key: &'static str, label: &'static str| {
        [Span::styled(key, key_style), Span::styled(label, label_style)]
    };

    let mut hints: Vec<Span> = Vec::new();
    match (app.screen, app.input_mode) {
        (Screen::PersonaPicker, _) => {
            hints.extend(hint(" j/k ", " nav "));
            hints.extend(hint(" Enter ", " select "));
            hints.extend(hint(" 1/2 ", " quick pick "));
            hints.extend(hint(" K ", " API key "));
            hints.extend(hint(" q ", " quit "));
        }
        (Screen::Chat, InputMode::Normal) => {
            hints.extend(hint(" i ", " type "));
            hints.extend(hint(" j/k ", " scroll "));
            hints.extend(hint(" w ", " web search "));
            hints.extend(hint(" r ", " start over "));
            hints.extend(hint(" K ", " API key "));
            hints.extend(hint(" q ", " quit "));
        }
        (Screen::Chat, InputMode::Editing) => {
            if app.chat.is_busy() {
                hints.extend(hint(" ... ", " waiting for reply "));
            } else {
                hints.extend(hint(" Enter ", " send "));
                hints.extend(hint(" Tab ", " web search "));
            }
            hints.extend(hint(" PgUp/PgDn ", " scroll "));
            hints.extend(hint(" Esc ", " stop typing "));
        }
    }

    let footer_content = Line::from(
        vec![
            Span::styled(mode_text, mode_style),
            Span::styled(" ", label_style),
        ]
        .into_iter()
        .chain(hints)
        .collect::<Vec<_>>(),
    );

    let footer = Paragraph::new(footer_content).style(Style::default().bg(Color::Black));
    frame.render_widget(footer, area);
}

fn render_persona_picker(app: &mut App, frame: &mut Frame, area: Rect) {
    let [intro_area, list_area, status_area] = Layout::vertical([
        Constraint::Length(5),
        Constraint::Min(0),
        Constraint::Length(2),
    ])
    .areas(area);

    let intro = Paragraph::new(vec![
        Line::default(),
        Line::from(Span::styled(
            "Welcome to FinBot!",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        )),
        Line::from(
            "To give you the best financial advice, please tell us a little about yourself. \
             Select the profile that best describes you.",
        ),
    ])
    .centered()
    .wrap(Wrap { trim: true });
    frame.render_widget(intro, intro_area);

    let items: Vec<ListItem> = Persona::all()
        .iter()
        .enumerate()
        .map(|(i, persona)| {
            ListItem::new(vec![
                Line::from(Span::styled(
                    format!("{}. {}", i + 1, persona.card_title()),
                    Style::default().fg(Color::Yellow).bold(),
                )),
                Line::from(format!("   {}", persona.card_description())),
                Line::default(),
            ])
        })
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(" Choose your profile "),
        )
        .highlight_style(
            Style::default()
                .bg(Color::Blue)
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, list_area, &mut app.persona_state);

    let status = if app.client.has_api_key() {
        Line::from(Span::styled(
            format!(" Model: {}", app.client.model()),
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        Line::from(Span::styled(
            " No Gemini API key found. Set GEMINI_API_KEY or press 'K' to enter one.",
            Style::default().fg(Color::Red),
        ))
    };
    frame.render_widget(Paragraph::new(status), status_area);
}

fn bot_label() -> Line<'static> {
    Line::from(Span::styled(
        "FinBot:",
        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
    ))
}

fn waiting_line(label: &str, frame: u8) -> Line<'static> {
    // Animated ellipsis: cycles through ".", "..", "..."
    let dots = ".".repeat((frame as usize) + 1);
    Line::from(Span::styled(
        format!("{}{}", label, dots),
        Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
    ))
}

fn source_lines(sources: &[Source]) -> Vec<Line<'static>> {
    let mut lines = vec![Line::from(Span::styled(
        "SOURCES",
        Style::default().fg(Color::DarkGray).add_modifier(Modifier::BOLD),
    ))];

    for (i, source) in sources.iter().enumerate() {
        let label = if source.title.is_empty() {
            source.uri.clone()
        } else {
            source.title.clone()
        };
        lines.push(Line::from(vec![
            Span::styled(format!("{}. ", i + 1), Style::default().fg(Color::DarkGray)),
            Span::styled(label, Style::default().fg(Color::Cyan)),
        ]));
        if !source.title.is_empty() {
            lines.push(Line::from(Span::styled(
                source.uri.clone(),
                Style::default()
                    .fg(Color::DarkGray)
                    .add_modifier(Modifier::UNDERLINED),
            )));
        }
    }
    lines
}

fn message_lines(app: &App, msg: &Message, lines: &mut Vec<Line<'static>>) {
    let awaiting = app.is_awaiting_text(msg);

    match msg.sender {
        Sender::User => {
            lines.push(Line::from(Span::styled(
                "You:",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            )));
            for line in msg.text.lines() {
                lines.push(Line::from(line.to_string()));
            }
        }
        Sender::Bot => {
            lines.push(bot_label());
            if awaiting {
                lines.push(waiting_line("Thinking", app.animation_frame));
            } else if msg.text == CONNECT_ERROR_TEXT || msg.text == REPLY_ERROR_TEXT {
                lines.push(Line::from(Span::styled(
                    msg.text.clone(),
                    Style::default().fg(Color::Red),
                )));
            } else {
                for line in msg.text.lines() {
                    lines.push(parse_markdown_line(line));
                }
            }
        }
    }
    if msg.text.is_empty() && !awaiting {
        lines.push(Line::default());
    }
    if !msg.sources.is_empty() {
        lines.push(Line::default());
        lines.extend(source_lines(&msg.sources));
    }
    lines.push(Line::default());
}

/// Every line of the message list, before wrapping.
pub fn chat_transcript(app: &App) -> Text<'static> {
    let mut lines: Vec<Line<'static>> = Vec::new();

    if app.is_connecting() {
        lines.push(bot_label());
        lines.push(waiting_line("Connecting", app.animation_frame));
    }

    for msg in app.chat.messages() {
        message_lines(app, msg, &mut lines);
    }

    Text::from(lines)
}

/// Rows the transcript occupies once word-wrapped to `width` columns.
pub fn transcript_rows(app: &App, width: u16) -> usize {
    Paragraph::new(chat_transcript(app))
        .wrap(Wrap { trim: true })
        .line_count(width)
}

fn render_chat_screen(app: &mut App, frame: &mut Frame, area: Rect) {
    let [chat_area, input_area] = Layout::vertical([
        Constraint::Min(0),
        Constraint::Length(3),
    ])
    .areas(area);

    // Store chat area for mouse hit-testing and its inner size for scrolling
    app.chat_area = Some(chat_area);
    app.chat_height = chat_area.height.saturating_sub(2);
    app.chat_width = chat_area.width.saturating_sub(2);

    let border_color = if app.input_mode == InputMode::Normal {
        Color::Cyan
    } else {
        Color::DarkGray
    };
    let title = match app.active_persona() {
        Some(persona) => format!(" {} · {} ", persona.display_name(), app.client.model()),
        None => format!(" {} ", app.client.model()),
    };
    let chat_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(title);

    // Re-anchor with the size just measured so the newest text stays visible
    if app.follow_output {
        app.scroll_chat_to_bottom();
    }

    let chat = Paragraph::new(chat_transcript(app))
        .block(chat_block)
        .wrap(Wrap { trim: true })
        .scroll((app.chat_scroll, 0));

    frame.render_widget(chat, chat_area);

    render_input(app, frame, input_area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let busy = app.chat.is_busy();
    let border_color = if app.input_mode == InputMode::Editing {
        Color::Yellow
    } else {
        Color::DarkGray
    };

    let title = if busy {
        " Waiting for FinBot... "
    } else if app.chat.phase() == Phase::Error {
        " Ask again, or press Esc then 'r' to start over "
    } else {
        " Ask a question about your finances "
    };

    let mut input_block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(title);
    if app.chat.web_search() {
        input_block = input_block.title_top(
            Line::from(Span::styled(" Web search on ", Style::default().fg(Color::Green)))
                .right_aligned(),
        );
    }

    // Inner width = total width - 2 (for borders)
    let (visible_text, cursor_x) = visible_window(
        &app.input,
        app.input_cursor,
        area.width.saturating_sub(2) as usize,
    );

    let text_color = if busy { Color::DarkGray } else { Color::Cyan };
    let input = Paragraph::new(visible_text)
        .style(Style::default().fg(text_color))
        .block(input_block);

    frame.render_widget(input, area);

    // Show cursor when editing
    if app.input_mode == InputMode::Editing && !app.show_api_key_input {
        frame.set_cursor_position((area.x + cursor_x + 1, area.y + 1));
    }
}

/// Slice of a single-line field that fits `width` columns with the cursor in
/// view, plus the cursor column within that slice.
fn visible_window(text: &str, cursor: usize, width: usize) -> (String, u16) {
    let offset = if width > 0 && cursor >= width {
        cursor - width + 1
    } else {
        0
    };
    let visible: String = text.chars().skip(offset).take(width).collect();
    (visible, (cursor - offset) as u16)
}

/// Mask all but the last four characters, one `*` per hidden character
fn mask_key(key: &str) -> String {
    let char_count = key.chars().count();
    let hidden = char_count.saturating_sub(4);
    key.chars()
        .enumerate()
        .map(|(i, c)| if i < hidden { '*' } else { c })
        .collect()
}

fn render_api_key_input(app: &App, frame: &mut Frame, area: Rect) {
    // Calculate popup size and position (centered)
    let popup_width = 60.min(area.width.saturating_sub(4));
    let popup_height = 7;

    let popup_x = area.x + (area.width.saturating_sub(popup_width)) / 2;
    let popup_y = area.y + (area.height.saturating_sub(popup_height)) / 2;

    let popup_area = Rect::new(popup_x, popup_y, popup_width, popup_height).intersection(area);
    if popup_area.is_empty() {
        return;
    }

    // Clear the area behind the popup
    frame.render_widget(Clear, popup_area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" Enter Gemini API Key ");

    let inner = block.inner(popup_area);
    frame.render_widget(block, popup_area);

    let instructions = Paragraph::new("Paste your API key below. Press Enter to save, Esc to cancel.")
        .style(Style::default().fg(Color::DarkGray));
    let row = |offset: u16| Rect::new(inner.x, inner.y + offset, inner.width, 1).intersection(inner);

    frame.render_widget(instructions, row(0));

    // The mask keeps one column per character so the cursor lines up
    let input_area = row(2);
    let (visible_key, cursor_x) = visible_window(
        &mask_key(&app.api_key_input),
        app.api_key_input_cursor,
        input_area.width as usize,
    );
    let input = Paragraph::new(visible_key).style(Style::default().fg(Color::Cyan));
    frame.render_widget(input, input_area);

    if !input_area.is_empty() {
        frame.set_cursor_position((input_area.x + cursor_x, input_area.y));
    }

    let char_count = format!("{} characters", app.api_key_input.chars().count());
    let status = Paragraph::new(char_count).style(Style::default().fg(Color::DarkGray));
    frame.render_widget(status, row(4));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use ratatui::{backend::TestBackend, Terminal};

    use crate::conversation::ChatController;
    use crate::gateway::{ChatSession, Fragment, FragmentStream, Gateway, GatewayError, SendOptions};
    use crate::gemini::GeminiClient;

    /// Backend that greets with a fixed text.
    struct Canned(&'static str);

    #[async_trait]
    impl Gateway for Canned {
        async fn open_session(&self, _instruction: &str) -> Result<Arc<dyn ChatSession>, GatewayError> {
            Ok(Arc::new(Canned(self.0)))
        }
    }

    #[async_trait]
    impl ChatSession for Canned {
        async fn send_streaming(
            &self,
            _utterance: &str,
            _options: SendOptions,
        ) -> Result<FragmentStream, GatewayError> {
            let items: Vec<Result<Fragment, GatewayError>> = vec![Ok(Fragment::from(self.0))];
            Ok(Box::pin(futures_util::stream::iter(items)))
        }
    }

    fn canned_app(greeting: &'static str) -> (App, tokio::sync::mpsc::UnboundedReceiver<crate::conversation::ChatUpdate>) {
        let (chat, rx) = ChatController::new(Arc::new(Canned(greeting)));
        (App::new(chat, GeminiClient::new(None)), rx)
    }

    fn screen_text(terminal: &Terminal<TestBackend>) -> String {
        terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    fn span_texts(line: &Line) -> Vec<String> {
        line.spans.iter().map(|s| s.content.to_string()).collect()
    }

    #[test]
    fn test_markdown_bold_span() {
        let line = parse_markdown_line("Open a **Roth IRA** early");
        assert_eq!(span_texts(&line), vec!["Open a ", "Roth IRA", " early"]);
        assert!(line.spans[1].style.add_modifier.contains(Modifier::BOLD));
        assert!(!line.spans[0].style.add_modifier.contains(Modifier::BOLD));
    }

    #[test]
    fn test_markdown_unclosed_bold_is_literal() {
        let line = parse_markdown_line("rates **may rise");
        assert_eq!(span_texts(&line).concat(), "rates **may rise");
    }

    #[test]
    fn test_markdown_single_star_and_empty() {
        let line = parse_markdown_line("* save 20%");
        assert_eq!(span_texts(&line), vec!["* save 20%"]);
        assert!(parse_markdown_line("").spans.is_empty());
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key(""), "");
        assert_eq!(mask_key("abcd"), "****");
        assert_eq!(mask_key("abcdefgh"), "****efgh");
        assert_eq!(mask_key("AIza€xyz12").chars().count(), 10);
    }

    #[test]
    fn test_visible_window_keeps_cursor_in_view() {
        assert_eq!(visible_window("hello", 5, 10), ("hello".to_string(), 5));
        assert_eq!(visible_window("abcdefgh", 8, 4), ("fgh".to_string(), 3));
        assert_eq!(visible_window("abcdefgh", 2, 4), ("abcd".to_string(), 2));
    }

    #[tokio::test]
    async fn test_auto_scroll_reaches_word_wrapped_tail() {
        let greeting = "aaaaaaaaaaa bbbbbbbbbbb ccccccccccc ddddddddddd eeeeeeeeeee \
                        fffffffffff ggggggggggg hhhhhhhhhhh iiiiiiiiiii LASTWORD";
        let (mut app, mut rx) = canned_app(greeting);
        let mut terminal = Terminal::new(TestBackend::new(22, 12)).unwrap();

        app.select_persona(Persona::Student);
        terminal.draw(|frame| render(&mut app, frame)).unwrap();
        assert_eq!(app.chat_width, 20);

        while app.chat.is_busy() {
            let update = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for update")
                .expect("channel closed");
            app.apply_update(update);
        }

        // One word per row at this width, plus the label and trailing blank line
        assert!(app.chat_line_count() >= 11);
        assert_eq!(app.chat_scroll, app.chat_line_count() - app.chat_height);

        terminal.draw(|frame| render(&mut app, frame)).unwrap();
        let screen = screen_text(&terminal);
        assert!(screen.contains("LASTWORD"), "newest text not visible:\n{screen}");
    }

    #[test]
    fn test_api_key_cursor_follows_masked_text() {
        let mut app = canned_app("unused").0;
        app.show_api_key_input = true;
        app.api_key_input = "AIzaSyExample1234".to_string();
        app.api_key_input_cursor = app.api_key_input.chars().count();

        let mut terminal = Terminal::new(TestBackend::new(80, 24)).unwrap();
        terminal.draw(|frame| render(&mut app, frame)).unwrap();

        // Popup is 60 wide at x=10, y=8; the key sits on the third inner row
        let masked = mask_key(&app.api_key_input);
        assert!(screen_text(&terminal).contains(&masked));
        let cursor = terminal.get_cursor_position().unwrap();
        assert_eq!((cursor.x, cursor.y), (11 + masked.chars().count() as u16, 11));
    }

    #[test]
    fn test_api_key_popup_fits_tiny_terminal() {
        let mut app = canned_app("unused").0;
        app.show_api_key_input = true;
        app.api_key_input = "secret-key".to_string();
        app.api_key_input_cursor = 3;

        for (width, height) in [(40, 5), (12, 3), (3, 2)] {
            let mut terminal = Terminal::new(TestBackend::new(width, height)).unwrap();
            terminal.draw(|frame| render(&mut app, frame)).unwrap();
        }
    }

    #[test]
    fn test_sources_render_under_reply() {
        let sources = vec![
            Source {
                uri: "https://www.irs.gov/retirement-plans".to_string(),
                title: "irs.gov".to_string(),
            },
            Source {
                uri: "https://example.com/rates".to_string(),
                title: String::new(),
            },
        ];
        let lines = source_lines(&sources);
        let texts: Vec<String> = lines.iter().map(|l| span_texts(l).concat()).collect();
        assert_eq!(
            texts,
            vec![
                "SOURCES",
                "1. irs.gov",
                "https://www.irs.gov/retirement-plans",
                "2. https://example.com/rates",
            ]
        );
    }
}
