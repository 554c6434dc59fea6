use std::sync::Arc;
use ratatui::layout::Rect;
use ratatui::widgets::ListState;
use crate::config::Config;
use crate::conversation::{ChatController, ChatUpdate, Message, Phase, Sender};
use crate::gemini::GeminiClient;
use crate::persona::Persona;
use crate::ui;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    PersonaPicker,
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub screen: Screen,
    pub input_mode: InputMode,

    // Persona picker
    pub persona_state: ListState,

    // Conversation
    pub chat: ChatController,
    pub input: String,
    pub input_cursor: usize, // cursor position in input, in chars
    pub chat_scroll: u16,
    pub chat_height: u16, // Inner height of the chat area, set during render
    pub chat_width: u16,  // Inner width of the chat area, set during render
    pub follow_output: bool,
    pub chat_area: Option<Rect>,

    // Animation state
    pub animation_frame: u8, // 0-2 for ellipsis animation

    // API key input state
    pub show_api_key_input: bool,
    pub api_key_input: String,
    pub api_key_input_cursor: usize,

    // Backend settings
    pub client: GeminiClient,
}

impl App {
    pub fn new(chat: ChatController, client: GeminiClient) -> Self {
        let mut persona_state = ListState::default();
        persona_state.select(Some(0));

        Self {
            should_quit: false,
            screen: Screen::PersonaPicker,
            input_mode: InputMode::Normal,

            persona_state,

            chat,
            input: String::new(),
            input_cursor: 0,
            chat_scroll: 0,
            chat_height: 0,
            chat_width: 0,
            follow_output: true,
            chat_area: None,

            animation_frame: 0,

            show_api_key_input: false,
            api_key_input: String::new(),
            api_key_input_cursor: 0,

            client,
        }
    }

    // Persona picker
    pub fn selected_persona(&self) -> Option<Persona> {
        self.persona_state
            .selected()
            .and_then(|i| Persona::all().get(i).copied())
    }

    pub fn persona_nav_down(&mut self) {
        let len = Persona::all().len();
        let i = self.persona_state.selected().unwrap_or(0);
        self.persona_state.select(Some((i + 1).min(len - 1)));
    }

    pub fn persona_nav_up(&mut self) {
        let i = self.persona_state.selected().unwrap_or(0);
        self.persona_state.select(Some(i.saturating_sub(1)));
    }

    /// Choose a persona and start its conversation.
    pub fn select_persona(&mut self, persona: Persona) {
        if let Some(i) = Persona::all().iter().position(|p| *p == persona) {
            self.persona_state.select(Some(i));
        }
        self.chat.initialize(persona);
        self.screen = Screen::Chat;
        self.input_mode = InputMode::Editing;
        self.input.clear();
        self.input_cursor = 0;
        self.chat_scroll = 0;
        self.follow_output = true;
    }

    /// Discard the conversation and go back to the persona picker.
    pub fn start_over(&mut self) {
        self.chat.reset();
        self.screen = Screen::PersonaPicker;
        self.input_mode = InputMode::Normal;
        self.input.clear();
        self.input_cursor = 0;
        self.chat_scroll = 0;
    }

    pub fn active_persona(&self) -> Option<Persona> {
        self.chat.conversation().map(|c| c.persona())
    }

    /// Send the input line. The text stays in place if the chat is busy.
    pub fn submit_input(&mut self) -> bool {
        if !self.chat.submit_message(&self.input) {
            return false;
        }
        self.input.clear();
        self.input_cursor = 0;
        self.follow_output = true;
        self.scroll_chat_to_bottom();
        true
    }

    pub fn apply_update(&mut self, update: ChatUpdate) {
        self.chat.apply(update);
        if self.follow_output {
            self.scroll_chat_to_bottom();
        }
    }

    /// Flip web search for the next question. Locked while a reply is streaming.
    pub fn toggle_web_search(&mut self) -> bool {
        if self.chat.is_busy() {
            return false;
        }
        let enabled = !self.chat.web_search();
        self.chat.set_web_search(enabled);
        tracing::debug!(enabled, "web search toggled");
        true
    }

    /// Tick animation frame (called by Tick event)
    pub fn tick_animation(&mut self) {
        if self.chat.is_busy() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    /// Bot message still waiting for its first fragment
    pub fn is_awaiting_text(&self, message: &Message) -> bool {
        message.sender == Sender::Bot
            && message.text.is_empty()
            && self
                .chat
                .conversation()
                .and_then(|c| c.pending_message())
                == Some(message.id)
    }

    /// Greeting requested but nothing streamed yet
    pub fn is_connecting(&self) -> bool {
        self.chat.phase() == Phase::Initializing && self.chat.messages().is_empty()
    }

    // Chat scrolling
    pub fn scroll_chat_down(&mut self, lines: u16) {
        let max_scroll = self.chat_line_count().saturating_sub(self.visible_chat_height());
        self.chat_scroll = self.chat_scroll.saturating_add(lines).min(max_scroll);
        self.follow_output = self.chat_scroll >= max_scroll;
    }

    pub fn scroll_chat_up(&mut self, lines: u16) {
        self.chat_scroll = self.chat_scroll.saturating_sub(lines);
        self.follow_output = false;
    }

    pub fn scroll_chat_to_top(&mut self) {
        self.chat_scroll = 0;
        self.follow_output = false;
    }

    pub fn scroll_chat_to_bottom(&mut self) {
        self.chat_scroll = self
            .chat_line_count()
            .saturating_sub(self.visible_chat_height());
        self.follow_output = true;
    }

    pub fn half_page(&self) -> u16 {
        (self.visible_chat_height() / 2).max(1)
    }

    fn visible_chat_height(&self) -> u16 {
        if self.chat_height > 0 {
            self.chat_height
        } else {
            20
        }
    }

    /// Rendered height of the message list, word-wrapped exactly as the chat pane draws it.
    pub fn chat_line_count(&self) -> u16 {
        // Use actual chat width for wrap calculation, default to 50 if not set
        let wrap_width = if self.chat_width > 0 { self.chat_width } else { 50 };

        ui::transcript_rows(self, wrap_width).min(u16::MAX as usize) as u16
    }

    /// Store a new API key and restart the active conversation with it.
    pub fn set_api_key(&mut self, key: &str) {
        let key = key.trim();
        if key.is_empty() {
            return;
        }

        if let Err(e) = Config::save_api_key(key) {
            tracing::warn!(error = %e, "could not save API key to config");
        }

        self.client = self.client.clone().with_api_key(key);
        self.chat.set_gateway(Arc::new(self.client.clone()));
        tracing::info!("API key updated");

        if let Some(persona) = self.active_persona() {
            self.select_persona(persona);
        }
    }
}
