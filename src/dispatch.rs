//! Fan-out of one user message to every active provider.
//!
//! Validation happens up front and synchronously. Once a batch starts, each
//! provider is an independent future; all of them are joined with
//! `join_all`, so one provider failing never cancels or delays the others.

use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::Instrument;

use crate::config::LabConfig;
use crate::context::ContextEvent;
use crate::conversation::Message;
use crate::documents::ReferenceDocument;
use crate::error::{LabError, Result, TransportError, ValidationError};
use crate::gateway::{ProviderGateway, SendRequest};
use crate::providers::ProviderSettings;
use crate::session::{ResponseStats, SharedSession};
use crate::{log_debug, log_error, log_info, log_warn};

/// Default per-request bound
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Outcome text for a reply that arrived after its conversation was cleared or restored
pub const DISCARDED_REPLY: &str = "Reply discarded: the conversation was cleared or restored";

/// One provider a batch should reach, with its request settings
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchTarget {
    pub provider_id: String,
    pub settings: ProviderSettings,
}

impl DispatchTarget {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            settings: ProviderSettings::default(),
        }
    }

    pub fn with_settings(provider_id: impl Into<String>, settings: ProviderSettings) -> Self {
        Self {
            provider_id: provider_id.into(),
            settings,
        }
    }
}

/// How one provider's request settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub provider_id: String,
    /// Reply text on success, error text on failure
    pub result: std::result::Result<String, String>,
    pub stats: ResponseStats,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Result of one `send_to_all`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// One outcome per target, in target order
    pub outcomes: Vec<DispatchOutcome>,
    pub elapsed_ms: u64,
    /// The context-change event recorded for this batch, if any
    pub context_event: Option<ContextEvent>,
}

impl BatchSummary {
    pub fn outcome(&self, provider_id: &str) -> Option<&DispatchOutcome> {
        self.outcomes.iter().find(|o| o.provider_id == provider_id)
    }
}

/// Rendering callbacks; every method defaults to doing nothing
pub trait RenderSink: Send + Sync {
    fn context_changed(&self, _provider_id: &str, _event: &ContextEvent) {}

    fn user_message(&self, _provider_id: &str, _message: &Message) {}

    /// A request for this provider is in flight
    fn pending(&self, _provider_id: &str) {}

    fn reply(&self, _provider_id: &str, _message: &Message, _stats: &ResponseStats) {}

    fn error(&self, _provider_id: &str, _error: &str, _stats: &ResponseStats) {}

    /// The trailing reply was dropped ahead of a regenerate
    fn reply_removed(&self, _provider_id: &str) {}

    /// A reply arrived for a conversation that no longer exists
    fn reply_discarded(&self, _provider_id: &str) {}

    fn batch_complete(&self, _summary: &BatchSummary) {}
}

/// Sink that ignores every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRenderer;

impl RenderSink for NoopRenderer {}

/// Notification forwarded by [`ChannelRenderer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    ContextChanged {
        provider_id: String,
        event: ContextEvent,
    },
    UserMessage {
        provider_id: String,
        message: Message,
    },
    Pending {
        provider_id: String,
    },
    Reply {
        provider_id: String,
        message: Message,
        stats: ResponseStats,
    },
    Error {
        provider_id: String,
        error: String,
        stats: ResponseStats,
    },
    ReplyRemoved {
        provider_id: String,
    },
    ReplyDiscarded {
        provider_id: String,
    },
    BatchComplete(BatchSummary),
}

/// Forwards notifications over an unbounded channel to a UI task
#[derive(Debug, Clone)]
pub struct ChannelRenderer {
    tx: mpsc::UnboundedSender<RenderEvent>,
}

impl ChannelRenderer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RenderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: RenderEvent) {
        // Receiver gone means nobody is rendering anymore
        if self.tx.send(event).is_err() {
            log_debug!("Render receiver dropped");
        }
    }
}

impl RenderSink for ChannelRenderer {
    fn context_changed(&self, provider_id: &str, event: &ContextEvent) {
        self.forward(RenderEvent::ContextChanged {
            provider_id: provider_id.to_string(),
            event: event.clone(),
        });
    }

    fn user_message(&self, provider_id: &str, message: &Message) {
        self.forward(RenderEvent::UserMessage {
            provider_id: provider_id.to_string(),
            message: message.clone(),
        });
    }

    fn pending(&self, provider_id: &str) {
        self.forward(RenderEvent::Pending {
            provider_id: provider_id.to_string(),
        });
    }

    fn reply(&self, provider_id: &str, message: &Message, stats: &ResponseStats) {
        self.forward(RenderEvent::Reply {
            provider_id: provider_id.to_string(),
            message: message.clone(),
            stats: *stats,
        });
    }

    fn error(&self, provider_id: &str, error: &str, stats: &ResponseStats) {
        self.forward(RenderEvent::Error {
            provider_id: provider_id.to_string(),
            error: error.to_string(),
            stats: *stats,
        });
    }

    fn reply_removed(&self, provider_id: &str) {
        self.forward(RenderEvent::ReplyRemoved {
            provider_id: provider_id.to_string(),
        });
    }

    fn reply_discarded(&self, provider_id: &str) {
        self.forward(RenderEvent::ReplyDiscarded {
            provider_id: provider_id.to_string(),
        });
    }

    fn batch_complete(&self, summary: &BatchSummary) {
        self.forward(RenderEvent::BatchComplete(summary.clone()));
    }
}

/// Rough token count: a quarter of the characters exchanged, rounded up
pub fn estimate_tokens(message: &str, reply: &str) -> u64 {
    let chars = message.chars().count() + reply.chars().count();
    u64::try_from(chars.div_ceil(4)).unwrap_or(u64::MAX)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Keep the first target for each provider id
fn dedupe_targets(targets: &[DispatchTarget]) -> Vec<DispatchTarget> {
    let mut seen = HashSet::new();
    targets
        .iter()
        .filter(|t| seen.insert(t.provider_id.as_str()))
        .cloned()
        .collect()
}

fn build_request(
    target: &DispatchTarget,
    message: &str,
    context: &str,
    history: Vec<Message>,
) -> SendRequest {
    SendRequest {
        provider: target.provider_id.clone(),
        message: message.to_string(),
        system_prompt: context.to_string(),
        conversation_history: history,
        model: target.settings.effective_model().map(str::to_string),
        temperature: Some(target.settings.effective_temperature()),
        api_key: target.settings.effective_api_key().map(str::to_string),
    }
}

/// Drives batches and regenerations against a gateway
pub struct DispatchCoordinator<G: ProviderGateway> {
    gateway: G,
    sink: Arc<dyn RenderSink>,
    request_timeout: Duration,
}

impl<G: ProviderGateway> DispatchCoordinator<G> {
    pub fn new(gateway: G) -> Self {
        Self {
            gateway,
            sink: Arc::new(NoopRenderer),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Coordinator using the configured request timeout
    pub fn from_config(gateway: G, config: &LabConfig) -> Self {
        Self::new(gateway).with_timeout(config.request_timeout())
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn RenderSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send one user message to every target and wait for all of them to settle.
    ///
    /// Errors only for invalid input, in which case nothing was recorded or
    /// sent. Provider failures are reported in the summary.
    pub async fn send_to_all(
        &self,
        session: &SharedSession,
        message: &str,
        targets: &[DispatchTarget],
    ) -> Result<BatchSummary> {
        let started = Instant::now();
        let message = message.trim();
        if message.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let targets = dedupe_targets(targets);
        if targets.is_empty() {
            return Err(ValidationError::NoProviderSelected.into());
        }

        let (generation, context_event, requests) = {
            let mut lab = session.write();
            for target in &targets {
                lab.registry().resolve(&target.provider_id)?;
            }

            let ids: Vec<String> = targets.iter().map(|t| t.provider_id.clone()).collect();
            let context_event = lab.record_context_change(&ids)?;
            let context = lab.current_context();

            let mut requests = Vec::with_capacity(targets.len());
            for target in &targets {
                lab.store_mut()
                    .append_message(&target.provider_id, Message::user(message))?;
                let history = lab.store().messages(&target.provider_id)?.to_vec();
                requests.push(build_request(target, message, &context, history));
            }
            (lab.generation(), context_event, requests)
        };

        if let Some(event) = &context_event {
            for target in &targets {
                self.sink.context_changed(&target.provider_id, event);
            }
        }
        let user_message = Message::user(message);
        for target in &targets {
            self.sink.user_message(&target.provider_id, &user_message);
            self.sink.pending(&target.provider_id);
        }

        log_info!("Dispatching to {} providers", requests.len());
        let outcomes = join_all(requests.into_iter().map(|request| {
            let span = tracing::info_span!("provider_send", provider = %request.provider);
            self.send_one(session, generation, request).instrument(span)
        }))
        .await;

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let summary = BatchSummary {
            succeeded,
            failed: outcomes.len() - succeeded,
            outcomes,
            elapsed_ms: elapsed_ms(started),
            context_event,
        };
        log_debug!(
            "Batch finished: {} succeeded, {} failed in {}ms",
            summary.succeeded,
            summary.failed,
            summary.elapsed_ms
        );
        self.sink.batch_complete(&summary);
        Ok(summary)
    }

    /// Drop a provider's latest reply and ask for a new one.
    ///
    /// The trailing user message is resent with the current context. Change
    /// detection is not consulted.
    pub async fn regenerate(
        &self,
        session: &SharedSession,
        provider_id: &str,
        settings: ProviderSettings,
    ) -> Result<DispatchOutcome> {
        let (generation, request) = {
            let mut lab = session.write();
            lab.registry().resolve(provider_id)?;
            lab.pop_last_assistant_message(provider_id)?;

            let history = lab.store().messages(provider_id)?.to_vec();
            let message = history
                .last()
                .map(|m| m.content.clone())
                .ok_or_else(|| LabError::InsufficientHistory {
                    provider_id: provider_id.to_string(),
                })?;
            let target = DispatchTarget::with_settings(provider_id, settings);
            let request = build_request(&target, &message, &lab.current_context(), history);
            (lab.generation(), request)
        };

        self.sink.reply_removed(provider_id);
        self.sink.pending(provider_id);
        log_info!("Regenerating reply for {}", provider_id);

        let span = tracing::info_span!("provider_regenerate", provider = %provider_id);
        Ok(self
            .send_one(session, generation, request)
            .instrument(span)
            .await)
    }

    /// Availability of each known provider as reported by the gateway
    pub async fn provider_availability(
        &self,
        session: &SharedSession,
    ) -> Result<BTreeMap<String, bool>> {
        let statuses = self.gateway.list_providers().await?;
        Ok(session.read().registry().reconcile_availability(&statuses))
    }

    /// Upload a file through the gateway and add it as an enabled document
    pub async fn upload_document(
        &self,
        session: &SharedSession,
        path: &Path,
    ) -> Result<ReferenceDocument> {
        let uploaded = self.gateway.upload_document(path).await?;
        let mut lab = session.write();
        Ok(lab.documents_mut().add_uploaded(uploaded).clone())
    }

    async fn send_one(
        &self,
        session: &SharedSession,
        generation: u64,
        request: SendRequest,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let result = match timeout(self.request_timeout, self.gateway.send(&request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
        };
        self.settle(session, generation, &request, result, elapsed_ms(started))
    }

    fn settle(
        &self,
        session: &SharedSession,
        generation: u64,
        request: &SendRequest,
        result: std::result::Result<String, TransportError>,
        elapsed_ms: u64,
    ) -> DispatchOutcome {
        let provider_id = request.provider.as_str();
        match result {
            Ok(reply) => {
                let stats =
                    ResponseStats::success(estimate_tokens(&request.message, &reply), elapsed_ms);
                let message = Message::assistant(reply.clone());
                let recorded = session.write().record_reply(
                    generation,
                    provider_id,
                    message.clone(),
                    stats,
                );
                match recorded {
                    Ok(true) => {}
                    Ok(false) => {
                        log_warn!("Discarding stale reply from {}", provider_id);
                        self.sink.reply_discarded(provider_id);
                        return DispatchOutcome {
                            provider_id: provider_id.to_string(),
                            result: Err(DISCARDED_REPLY.to_string()),
                            stats: ResponseStats::failure(elapsed_ms),
                        };
                    }
                    Err(e) => log_error!("Could not record reply for {}: {}", provider_id, e),
                }
                self.sink.reply(provider_id, &message, &stats);
                DispatchOutcome {
                    provider_id: provider_id.to_string(),
                    result: Ok(reply),
                    stats,
                }
            }
            Err(e) => {
                let stats = ResponseStats::failure(elapsed_ms);
                let error = e.to_string();
                log_warn!("Request to {} failed: {}", provider_id, error);
                if !session.write().record_failure(generation, provider_id, stats) {
                    log_debug!("Conversation for {} was replaced before the failure", provider_id);
                }
                self.sink.error(provider_id, &error, &stats);
                DispatchOutcome {
                    provider_id: provider_id.to_string(),
                    result: Err(error),
                    stats,
                }
            }
        }
    }
}
