//! Shared test doubles and fixtures for the sift crates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;

use sift_core::error::{Result, SiftError};
use sift_core::mailbox::MailboxSnapshot;
use sift_core::structured::parse_structured;
use sift_core::traits::LanguageModel;
use sift_core::types::{GenerateRequest, Generation, Item, ItemSource, Thread};

type Responder = Box<dyn Fn(&GenerateRequest) -> Result<String> + Send + Sync>;

/// A language model that replays queued responses in order.
///
/// Every request is recorded. When the request carries a schema the raw
/// response goes through the same strict parser the real clients use, so a
/// malformed script entry fails exactly like a malformed completion would.
pub struct ScriptedModel {
    queue: Mutex<VecDeque<Result<String>>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<GenerateRequest>>,
    calls: AtomicUsize,
    tokens_per_call: u64,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self {
            queue: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            responder: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            tokens_per_call: 10,
            delay: None,
        }
    }

    /// Answer every request by calling `f`, for prompts whose order is not
    /// deterministic (concurrent batches).
    pub fn from_fn(f: impl Fn(&GenerateRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        let mut model = Self::new(Vec::<String>::new());
        model.responder = Some(Box::new(f));
        model
    }

    pub fn with_tokens(mut self, tokens_per_call: u64) -> Self {
        self.tokens_per_call = tokens_per_call;
        self
    }

    /// Sleep before answering, for cancellation and timeout tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a transport failure.
    pub fn push_failure(&self, message: &str) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Err(SiftError::LlmRequest(message.to_string())));
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts seen so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|r| r.iter().map(|req| req.prompt.clone()).collect())
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_response(&self, request: &GenerateRequest) -> Result<String> {
        if let Some(responder) = &self.responder {
            return responder(request);
        }
        self.queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Err(SiftError::LlmRequest("script exhausted".into())))
    }
}

impl LanguageModel for ScriptedModel {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let raw = self.next_response(&request)?;
            let parsed = match &request.schema {
                Some(schema) => Some(parse_structured(&raw, schema)?),
                None => None,
            };
            Ok(Generation {
                raw,
                parsed,
                tokens_used: self.tokens_per_call,
            })
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A language model whose every call fails with a transport error.
pub struct FailingModel {
    message: String,
    calls: AtomicUsize,
}

impl FailingModel {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LanguageModel for FailingModel {
    fn generate(&self, _request: GenerateRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SiftError::LlmRequest(self.message.clone()))
        })
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Fixed "current time" shared by fixtures and engine tests.
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
}

/// An email `days_ago` days before [`fixed_now`].
pub fn email(id: &str, sender: &str, subject: &str, body: &str, days_ago: i64) -> Item {
    Item {
        id: id.to_string(),
        source: ItemSource::Email,
        thread_id: Some(format!("thread-{}", id)),
        sender: Some(sender.to_string()),
        recipients: vec!["ada@example.com".to_string()],
        subject: Some(subject.to_string()),
        snippet: Some(body.chars().take(60).collect()),
        body: Some(body.to_string()),
        labels: vec!["INBOX".to_string()],
        unread: true,
        timestamp: fixed_now() - chrono::Duration::days(days_ago),
    }
}

/// The boss is `dana@acme.com`; the user also has a direct report and a
/// newsletter in the inbox.
pub fn boss_mailbox() -> MailboxSnapshot {
    let mut read_report = email(
        "m4",
        "sam@acme.com",
        "Weekly status",
        "All green this week, nothing blocking.",
        2,
    );
    read_report.unread = false;

    let mut invite = email(
        "c1",
        "dana@acme.com",
        "1:1 with Dana",
        "Agenda: budget, hiring plan.",
        1,
    );
    invite.source = ItemSource::Calendar;
    invite.thread_id = None;

    MailboxSnapshot::new(
        vec![
            email(
                "m1",
                "Dana Whitfield <dana@acme.com>",
                "Budget sign-off needed today",
                "Please approve the Q4 budget before 5pm, finance is waiting.",
                0,
            ),
            email(
                "m2",
                "dana@acme.com",
                "Offsite ideas",
                "No rush, send me ideas for the offsite when you can.",
                3,
            ),
            email(
                "m3",
                "news@updates.example.com",
                "This week in tooling",
                "Ten budget tips for engineering teams.",
                1,
            ),
            read_report,
            invite,
        ],
        vec![Thread {
            id: "thread-m1".to_string(),
            subject: Some("Budget sign-off needed today".to_string()),
            messages: vec![
                email(
                    "m1-prev",
                    "finance@acme.com",
                    "Budget sign-off needed today",
                    "Numbers attached.",
                    1,
                ),
                email(
                    "m1",
                    "Dana Whitfield <dana@acme.com>",
                    "Budget sign-off needed today",
                    "Please approve the Q4 budget before 5pm, finance is waiting.",
                    0,
                ),
            ],
        }],
    )
}
