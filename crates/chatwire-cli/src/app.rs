//! Application state and command handling.
//!
//! Coordinates the connection manager, the session correlator and the REST client
//! on behalf of the line-oriented front end in `main`.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use chatwire_core::{ChatId, RunId};
use chatwire_transport::{
    group_by_recency, ApiClient, ChatListQuery, ConnectionManager, HistoryQuery, LogNotifier,
    PageQuery, SessionCorrelator, SharedToken, TransportConfig,
};

use crate::render;

/// Entries requested per history or chat list page.
const PAGE_SIZE: u32 = 20;

/// What the input loop should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Leave the loop.
    Quit,
}

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Ask a question in the current chat.
    Ask(String),
    /// Stop the latest run.
    Stop,
    /// Stop and resubmit the latest run.
    Refresh,
    /// Load the current chat's history.
    History,
    /// List chats.
    Chats,
    /// Switch to another chat.
    Switch(String),
    /// Print the command list.
    Help,
    /// Disconnect and exit.
    Quit,
}

impl Input {
    /// Parse one line; blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Self::Ask(line.to_string()));
        };

        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(name, rest)| (name, rest.trim()));
        Some(match name {
            "stop" => Self::Stop,
            "refresh" => Self::Refresh,
            "history" => Self::History,
            "chats" => Self::Chats,
            "chat" if !rest.is_empty() => Self::Switch(rest.to_string()),
            "quit" | "exit" => Self::Quit,
            _ => Self::Help,
        })
    }
}

/// Command summary printed at start and on unknown commands.
pub const HELP: &str = "\
commands:
  <text>        ask a question
  /stop         stop the latest answer
  /refresh      stop and ask the latest question again
  /history      load this chat's history
  /chats        list chats
  /chat <id>    switch chat
  /quit         disconnect and exit";

/// Application state.
pub struct App {
    pub connection: ConnectionManager,
    pub session: SessionCorrelator,
    api: ApiClient,
    user_id: String,
    chat_id: Option<ChatId>,
    latest: Option<RunId>,
}

impl App {
    /// Wire up the transport for `config`.
    pub fn new(
        config: &TransportConfig,
        token: &str,
        user_id: String,
        chat_id: Option<ChatId>,
    ) -> anyhow::Result<Self> {
        let tokens = Arc::new(SharedToken::with_token(token));
        let notifier = Arc::new(LogNotifier);

        let connection = ConnectionManager::new(config.clone(), tokens.clone());
        let session = SessionCorrelator::new(
            Arc::new(connection.clone()),
            tokens.clone(),
            notifier.clone(),
            config.client_type,
        );
        session.attach(&connection);
        let api = ApiClient::new(config, tokens, notifier).context("building HTTP client")?;

        Ok(Self {
            connection,
            session,
            api,
            user_id,
            chat_id,
            latest: None,
        })
    }

    /// Handle one parsed input, printing results to stdout.
    pub async fn handle(&mut self, input: Input) -> anyhow::Result<Flow> {
        match input {
            Input::Ask(query) => {
                let chat_id = self.ensure_chat(&query).await?;
                self.latest = Some(self.session.submit(chat_id, query));
            }
            Input::Stop => {
                let run_id = self.latest_run()?;
                self.session.stop(&run_id).await?;
                println!("stop requested");
            }
            Input::Refresh => {
                let run_id = self.latest_run()?;
                self.latest = Some(self.session.refresh(&run_id).await?);
            }
            Input::History => self.load_history().await?,
            Input::Chats => self.list_chats().await?,
            Input::Switch(id) => {
                let chat_id = ChatId::new(id)?;
                println!("switched to chat {chat_id}");
                self.chat_id = Some(chat_id);
                self.latest = None;
            }
            Input::Help => println!("{HELP}"),
            Input::Quit => {
                self.connection.disconnect().await?;
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }

    fn latest_run(&self) -> anyhow::Result<RunId> {
        self.latest.clone().ok_or_else(|| anyhow!("nothing asked yet"))
    }

    /// Current chat, creating one titled after the first question if needed.
    async fn ensure_chat(&mut self, title: &str) -> anyhow::Result<ChatId> {
        if let Some(chat_id) = &self.chat_id {
            return Ok(chat_id.clone());
        }

        let envelope = self.api.add_chat(Some(title)).await?;
        if !envelope.is_success() {
            bail!("creating chat failed: {} {}", envelope.code, envelope.message);
        }
        let chat = envelope
            .result
            .ok_or_else(|| anyhow!("server returned no chat"))?;
        tracing::info!(chat_id = %chat.chat_id, "Chat created");
        println!("new chat {}", chat.chat_id);
        self.chat_id = Some(chat.chat_id.clone());
        Ok(chat.chat_id)
    }

    async fn load_history(&mut self) -> anyhow::Result<()> {
        let chat_id = self
            .chat_id
            .clone()
            .ok_or_else(|| anyhow!("no chat selected"))?;
        let query = HistoryQuery {
            user_id: self.user_id.clone(),
            chat_id: Some(chat_id.clone()),
            page: PageQuery::page(1, PAGE_SIZE),
        };

        let envelope = self.api.message_history(&query).await?;
        if !envelope.is_success() {
            bail!("loading history failed: {} {}", envelope.code, envelope.message);
        }
        let records = envelope.result.map(|page| page.records).unwrap_or_default();
        self.session.replace_history(&chat_id, &records);

        let slots = self.session.conversation(&chat_id);
        self.latest = slots.last().map(|slot| slot.run_id.clone());
        for slot in &slots {
            println!("> {}", slot.query);
            println!("{}", render::render_answer(slot));
        }
        Ok(())
    }

    async fn list_chats(&self) -> anyhow::Result<()> {
        let query = ChatListQuery {
            user_id: self.user_id.clone(),
            page: PageQuery::page(1, PAGE_SIZE),
        };

        let envelope = self.api.chat_list(&query).await?;
        if !envelope.is_success() {
            bail!("loading chats failed: {} {}", envelope.code, envelope.message);
        }
        let records = envelope.result.map(|page| page.records).unwrap_or_default();
        let now = chrono::Local::now().naive_local();
        println!("{}", render::render_groups(&group_by_recency(records, now)));
        Ok(())
    }
}
