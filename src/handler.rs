use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseEvent, MouseEventKind};
use ratatui::layout::Rect;
use crate::app::{App, InputMode, Screen};
use crate::persona::Persona;
use crate::tui::AppEvent;

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Single-line text editing shared by the chat input and the API key popup.
/// Returns false when the key is not an editing key.
fn edit_line(text: &mut String, cursor: &mut usize, key: KeyEvent) -> bool {
    match key.code {
        KeyCode::Backspace => {
            if *cursor > 0 {
                *cursor -= 1;
                let byte_pos = char_to_byte_index(text, *cursor);
                text.remove(byte_pos);
            }
        }
        KeyCode::Delete => {
            if *cursor < text.chars().count() {
                let byte_pos = char_to_byte_index(text, *cursor);
                text.remove(byte_pos);
            }
        }
        KeyCode::Left => {
            *cursor = cursor.saturating_sub(1);
        }
        KeyCode::Right => {
            *cursor = (*cursor + 1).min(text.chars().count());
        }
        KeyCode::Home => {
            *cursor = 0;
        }
        KeyCode::End => {
            *cursor = text.chars().count();
        }
        KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
            let byte_pos = char_to_byte_index(text, *cursor);
            text.insert(byte_pos, c);
            *cursor += 1;
        }
        _ => return false,
    }
    true
}

pub fn handle_event(app: &mut App, event: AppEvent) {
    match event {
        AppEvent::Key(key) => handle_key(app, key),
        AppEvent::Mouse(mouse) => handle_mouse(app, mouse),
        AppEvent::Resize => {
            if app.follow_output {
                app.scroll_chat_to_bottom();
            }
        }
        AppEvent::Tick => app.tick_animation(),
        AppEvent::Chat(update) => app.apply_update(update),
    }
}

fn handle_key(app: &mut App, key: KeyEvent) {
    // Global keys that work in any mode
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        app.should_quit = true;
        return;
    }

    if app.show_api_key_input {
        handle_api_key_input(app, key);
        return;
    }

    match (app.screen, app.input_mode) {
        (Screen::PersonaPicker, _) => handle_picker(app, key),
        (Screen::Chat, InputMode::Normal) => handle_chat_normal(app, key),
        (Screen::Chat, InputMode::Editing) => handle_chat_editing(app, key),
    }
}

fn open_api_key_input(app: &mut App) {
    app.show_api_key_input = true;
    app.api_key_input.clear();
    app.api_key_input_cursor = 0;
}

fn handle_api_key_input(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => {
            app.show_api_key_input = false;
            app.api_key_input.clear();
        }
        KeyCode::Enter => {
            let key = std::mem::take(&mut app.api_key_input);
            app.api_key_input_cursor = 0;
            app.show_api_key_input = false;
            app.set_api_key(&key);
        }
        _ => {
            edit_line(&mut app.api_key_input, &mut app.api_key_input_cursor, key);
        }
    }
}

fn handle_picker(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => app.should_quit = true,
        KeyCode::Char('j') | KeyCode::Down | KeyCode::Tab => app.persona_nav_down(),
        KeyCode::Char('k') | KeyCode::Up | KeyCode::BackTab => app.persona_nav_up(),
        KeyCode::Enter | KeyCode::Char('l') | KeyCode::Right => {
            if let Some(persona) = app.selected_persona() {
                app.select_persona(persona);
            }
        }
        KeyCode::Char('1') => app.select_persona(Persona::Student),
        KeyCode::Char('2') => app.select_persona(Persona::Professional),
        KeyCode::Char('K') => open_api_key_input(app),
        _ => {}
    }
}

fn handle_chat_normal(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Char('q') => app.should_quit = true,

        // Back to typing
        KeyCode::Char('i') | KeyCode::Char('a') | KeyCode::Enter => {
            app.input_mode = InputMode::Editing;
        }

        // "Start Over"
        KeyCode::Char('r') => app.start_over(),

        KeyCode::Char('K') => open_api_key_input(app),
        KeyCode::Char('w') => {
            app.toggle_web_search();
        }

        // Scrolling
        KeyCode::Char('j') | KeyCode::Down => app.scroll_chat_down(1),
        KeyCode::Char('k') | KeyCode::Up => app.scroll_chat_up(1),
        KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            let half = app.half_page();
            app.scroll_chat_down(half);
        }
        KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            let half = app.half_page();
            app.scroll_chat_up(half);
        }
        KeyCode::PageDown => {
            let page = app.half_page() * 2;
            app.scroll_chat_down(page);
        }
        KeyCode::PageUp => {
            let page = app.half_page() * 2;
            app.scroll_chat_up(page);
        }
        KeyCode::Char('g') => app.scroll_chat_to_top(),
        KeyCode::Char('G') => app.scroll_chat_to_bottom(),

        _ => {}
    }
}

fn handle_chat_editing(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => {
            app.input_mode = InputMode::Normal;
        }
        KeyCode::Enter => {
            // Ignored while a reply is outstanding; the text stays for later
            app.submit_input();
        }
        KeyCode::Tab => {
            app.toggle_web_search();
        }
        KeyCode::PageUp => {
            let page = app.half_page() * 2;
            app.scroll_chat_up(page);
        }
        KeyCode::PageDown => {
            let page = app.half_page() * 2;
            app.scroll_chat_down(page);
        }
        _ => {
            edit_line(&mut app.input, &mut app.input_cursor, key);
        }
    }
}

/// Check if a point is within a rectangle
fn point_in_rect(x: u16, y: u16, rect: Rect) -> bool {
    x >= rect.x && x < rect.x + rect.width && y >= rect.y && y < rect.y + rect.height
}

fn handle_mouse(app: &mut App, mouse: MouseEvent) {
    if app.screen != Screen::Chat {
        return;
    }

    let in_chat = app
        .chat_area
        .map(|r| point_in_rect(mouse.column, mouse.row, r))
        .unwrap_or(false);
    if !in_chat {
        return;
    }

    match mouse.kind {
        MouseEventKind::ScrollDown => app.scroll_chat_down(3),
        MouseEventKind::ScrollUp => app.scroll_chat_up(3),
        _ => {}
    }
}
