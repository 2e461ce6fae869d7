use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use atc_core::report::{split_into_parts, ReportBundle};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("export io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound command surface of the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Progress,
    Report,
    Cancel,
    WhoAmI,
}

impl Command {
    /// Parse a slash command; anything else is free text for the dialog.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().split_whitespace().next()? {
            "/progress" => Some(Self::Progress),
            "/report" => Some(Self::Report),
            "/cancel" => Some(Self::Cancel),
            "/whoami" => Some(Self::WhoAmI),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionInput {
    Command(Command),
    Text(String),
}

/// Per-session dialog state. `WorkInProgress` covers both the report build
/// after /report and the rendering/delivery after a format choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    #[default]
    Idle,
    ChooseFormat,
    WorkInProgress,
    CsvTooLarge,
}

/// Numeric identity of the requester, with the group id when the message
/// came from a group chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: i64,
    pub group_id: Option<i64>,
}

/// Result of the alternate sqlite export: where the file landed and how big
/// it is.
#[derive(Debug, Clone)]
pub struct SqliteExport {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Outbound side of the delivery channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), NotifyError>;

    async fn send_document(
        &self,
        chat_id: i64,
        filename: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<(), NotifyError>;
}

/// The injected callables the front-end consumes: a progress provider, a
/// report provider, and the sqlite export path.
#[async_trait]
pub trait ReportProviders: Send + Sync {
    async fn progress(&self) -> Result<String, NotifyError>;

    async fn build_report(&self) -> Result<ReportBundle, NotifyError>;

    async fn export_sqlite(&self) -> Result<SqliteExport, NotifyError>;
}

#[derive(Debug, Clone)]
pub struct FrontEndConfig {
    /// Maximum payload the delivery channel accepts in one document.
    pub transport_limit: usize,
    /// Headroom kept below the limit when splitting csv parts.
    pub safety_margin: usize,
    pub delimiter: char,
    /// Destinations for unsolicited broadcasts.
    pub chats: Vec<i64>,
}

#[derive(Debug, Default)]
struct Session {
    state: ConversationState,
    cached: Option<ReportBundle>,
}

/// Conversational front-end: dispatches commands, drives the report dialog
/// state machine, and delivers exports within the transport size ceiling.
pub struct FrontEnd<T: Transport, P: ReportProviders> {
    transport: T,
    providers: P,
    config: FrontEndConfig,
    sessions: Mutex<HashMap<i64, Session>>,
}

impl<T: Transport, P: ReportProviders> FrontEnd<T, P> {
    pub fn new(transport: T, providers: P, config: FrontEndConfig) -> Self {
        Self {
            transport,
            providers,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn state(&self, chat_id: i64) -> ConversationState {
        self.sessions
            .lock()
            .await
            .get(&chat_id)
            .map(|session| session.state)
            .unwrap_or_default()
    }

    /// Send a message to every configured notification destination.
    pub async fn broadcast(&self, text: &str) -> Result<(), NotifyError> {
        for chat_id in &self.config.chats {
            self.transport.send_message(*chat_id, text).await?;
        }
        Ok(())
    }

    pub async fn handle_input(
        &self,
        chat_id: i64,
        input: SessionInput,
        caller: Option<CallerIdentity>,
    ) -> Result<(), NotifyError> {
        match input {
            SessionInput::Command(Command::Progress) => {
                let progress = self.providers.progress().await?;
                self.transport.send_message(chat_id, &progress).await
            }
            SessionInput::Command(Command::WhoAmI) => self.send_identity(chat_id, caller).await,
            SessionInput::Command(Command::Cancel) => {
                self.set_state(chat_id, ConversationState::Idle, true).await;
                self.transport.send_message(chat_id, "Cancelled.").await
            }
            SessionInput::Command(Command::Report) => self.start_report(chat_id).await,
            SessionInput::Text(text) => self.handle_text(chat_id, text.trim()).await,
        }
    }

    async fn send_identity(
        &self,
        chat_id: i64,
        caller: Option<CallerIdentity>,
    ) -> Result<(), NotifyError> {
        let Some(caller) = caller else {
            return self
                .transport
                .send_message(chat_id, "Caller identity is not available.")
                .await;
        };
        let mut lines = Vec::new();
        if let Some(group_id) = caller.group_id {
            lines.push(format!("group id is {group_id}"));
        }
        lines.push(format!("your id is {}", caller.user_id));
        self.transport.send_message(chat_id, &lines.join("\n")).await
    }

    async fn start_report(&self, chat_id: i64) -> Result<(), NotifyError> {
        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.entry(chat_id).or_default();
            if session.state != ConversationState::Idle {
                // at most one in-flight report build per requester; concurrent
                // requests are rejected, not queued, and the cache stays put
                drop(sessions);
                return self
                    .transport
                    .send_message(chat_id, "A report is already in progress.")
                    .await;
            }
            session.state = ConversationState::WorkInProgress;
        }

        let bundle = match self.providers.build_report().await {
            Ok(bundle) => bundle,
            Err(err) => {
                self.set_state(chat_id, ConversationState::Idle, true).await;
                return Err(err);
            }
        };

        let summary = bundle.summary.to_string();
        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.entry(chat_id).or_default();
            session.cached = Some(bundle);
            session.state = ConversationState::ChooseFormat;
        }
        self.transport
            .send_message(
                chat_id,
                &format!("{summary}\nChoose the export format: csv or sqlite."),
            )
            .await
    }

    async fn handle_text(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let state = self.state(chat_id).await;
        match (state, text) {
            (ConversationState::ChooseFormat, "csv") => self.deliver_csv(chat_id).await,
            (ConversationState::ChooseFormat, "sqlite") => self.deliver_sqlite(chat_id).await,
            (ConversationState::ChooseFormat, _) => {
                // unrecognized input re-prompts without changing state
                self.transport
                    .send_message(chat_id, "Choose the export format: csv or sqlite.")
                    .await
            }
            (ConversationState::CsvTooLarge, "yes") => self.deliver_csv_parts(chat_id).await,
            (ConversationState::CsvTooLarge, "no") => {
                self.set_state(chat_id, ConversationState::Idle, true).await;
                self.transport
                    .send_message(chat_id, "Ok, skipping the export.")
                    .await
            }
            (ConversationState::CsvTooLarge, _) => {
                self.transport
                    .send_message(chat_id, "Send the export split into parts? (yes/no)")
                    .await
            }
            (state, _) => {
                debug!(chat_id, ?state, "ignoring free text outside the dialog");
                Ok(())
            }
        }
    }

    async fn deliver_csv(&self, chat_id: i64) -> Result<(), NotifyError> {
        let Some(bundle) = self.enter_work(chat_id).await else {
            return self.missing_cache(chat_id).await;
        };

        let csv = bundle.render_csv(self.config.delimiter);
        if csv.len() > self.config.transport_limit {
            self.set_state(chat_id, ConversationState::CsvTooLarge, false)
                .await;
            let prompt = self
                .transport
                .send_message(
                    chat_id,
                    &format!(
                        "The csv export is {} bytes which exceeds the {} byte transport limit. \
                         Send it split into parts? (yes/no)",
                        csv.len(),
                        self.config.transport_limit
                    ),
                )
                .await;
            if prompt.is_err() {
                // the question never reached the requester, so the session
                // must not wait for an answer
                self.set_state(chat_id, ConversationState::Idle, true).await;
            }
            return prompt;
        }

        let caption = bundle.summary.to_string();
        let delivery = self
            .transport
            .send_document(chat_id, "report.csv", csv.into_bytes(), &caption)
            .await;
        self.set_state(chat_id, ConversationState::Idle, true).await;
        delivery
    }

    async fn deliver_csv_parts(&self, chat_id: i64) -> Result<(), NotifyError> {
        let Some(bundle) = self.enter_work(chat_id).await else {
            return self.missing_cache(chat_id).await;
        };

        let header = bundle.header_line(self.config.delimiter);
        let rows: Vec<String> = bundle
            .rows
            .iter()
            .map(|row| row.to_delimited(self.config.delimiter))
            .collect();
        let parts = split_into_parts(
            &header,
            &rows,
            self.config.transport_limit,
            self.config.safety_margin,
        );

        let total = parts.len();
        let mut delivery = Ok(());
        for (index, part) in parts.into_iter().enumerate() {
            let number = index + 1;
            let sent = self
                .transport
                .send_document(
                    chat_id,
                    &format!("report.part{number:02}.csv"),
                    part.into_bytes(),
                    &format!("part {number} of {total}"),
                )
                .await;
            if let Err(err) = sent {
                delivery = Err(err);
                break;
            }
        }
        self.set_state(chat_id, ConversationState::Idle, true).await;
        delivery
    }

    async fn deliver_sqlite(&self, chat_id: i64) -> Result<(), NotifyError> {
        let Some(bundle) = self.enter_work(chat_id).await else {
            return self.missing_cache(chat_id).await;
        };

        let export = match self.providers.export_sqlite().await {
            Ok(export) => export,
            Err(err) => {
                self.set_state(chat_id, ConversationState::Idle, true).await;
                return Err(err);
            }
        };

        let delivery = if export.size_bytes as usize > self.config.transport_limit {
            // too big to deliver in one document; point at the file instead
            // of refusing outright
            self.transport
                .send_message(
                    chat_id,
                    &format!(
                        "The sqlite export is {} bytes which exceeds the {} byte transport \
                         limit. Fetch it out-of-band from {}.",
                        export.size_bytes,
                        self.config.transport_limit,
                        export.path.display()
                    ),
                )
                .await
        } else {
            match tokio::fs::read(&export.path).await {
                Ok(bytes) => {
                    let caption = bundle.summary.to_string();
                    self.transport
                        .send_document(chat_id, "report.sqlite", bytes, &caption)
                        .await
                }
                Err(err) => Err(err.into()),
            }
        };
        self.set_state(chat_id, ConversationState::Idle, true).await;
        delivery
    }

    /// Flip the session into `WorkInProgress` and hand back the cached
    /// bundle, or `None` when the dialog lost its cache.
    async fn enter_work(&self, chat_id: i64) -> Option<ReportBundle> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(chat_id).or_default();
        match session.cached.clone() {
            Some(bundle) => {
                session.state = ConversationState::WorkInProgress;
                Some(bundle)
            }
            None => None,
        }
    }

    async fn missing_cache(&self, chat_id: i64) -> Result<(), NotifyError> {
        warn!(chat_id, "report dialog reached a format choice without cached data");
        self.set_state(chat_id, ConversationState::Idle, true).await;
        self.transport
            .send_message(chat_id, "The report is no longer available, request it again.")
            .await
    }

    async fn set_state(&self, chat_id: i64, state: ConversationState, clear_cache: bool) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(chat_id).or_default();
        session.state = state;
        if clear_cache {
            session.cached = None;
        }
    }
}
