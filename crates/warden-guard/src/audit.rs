//! Signed, append-only audit trail.
//!
//! Every security-relevant step is recorded as an [`AuditEvent`]. The
//! [`AuditLogger`] completes each [`EventDraft`] (sequence, id, timestamp),
//! classifies it, signs it, links it to its predecessor and appends it to an
//! [`AuditBackend`]. If the append fails the caller gets an error and must fail
//! the guarded operation.
//!
//! # Integrity
//!
//! - `security.signature` is an HMAC-SHA256 over the canonical JSON of every
//!   other field, so mutating any field invalidates it.
//! - `prev_hash` is the SHA-256 of the previous event's canonical bytes plus
//!   its signature, making deletions and reorderings detectable.
//!
//! # Ordering
//!
//! Sequence assignment, append and subscriber delivery happen under one lock,
//! so each source's events are stored and observed in causal order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::audit_backend::AuditBackend;
use crate::audit_crypto::{chain_hash, DetailCipher, EventSigner};
use crate::error::AuditError;
use crate::risk::{assess_risk, derive_tags, ComplianceTag, RiskLevel};

/// Who performed an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human user.
    User,
    /// An autonomous agent.
    Agent,
    /// The trust core itself.
    System,
}

impl std::str::FromStr for ActorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ActorType::User),
            "agent" => Ok(ActorType::Agent),
            "system" => Ok(ActorType::System),
            other => Err(format!("unknown actor type '{other}'")),
        }
    }
}

/// The acting principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Principal kind.
    #[serde(rename = "type")]
    pub kind: ActorType,
    /// Principal identifier.
    pub id: String,
}

impl Actor {
    /// An agent actor.
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            kind: ActorType::Agent,
            id: id.into(),
        }
    }

    /// A user actor.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            kind: ActorType::User,
            id: id.into(),
        }
    }

    /// The system actor.
    pub fn system() -> Self {
        Self {
            kind: ActorType::System,
            id: "system".into(),
        }
    }
}

/// What was done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventAction {
    /// Dotted action type (`permission.check`, `sandbox.violation.hard`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Target resource.
    pub target: String,
    /// Free-form details. Empty on disk when encrypted.
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

/// Correlation identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventContext {
    /// Session identifier.
    pub session_id: Option<String>,
    /// Request identifier.
    pub request_id: Option<String>,
    /// The action touched personal data.
    pub pii: bool,
}

/// Outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Completed as requested.
    Success,
    /// Denied or failed.
    Failure,
    /// Completed with a warning.
    Warning,
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            "warning" => Ok(Outcome::Warning),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// Result of the action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventResult {
    /// Status.
    pub status: Outcome,
    /// Optional human-readable message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Security classification and signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityInfo {
    /// Assessed risk.
    pub risk: RiskLevel,
    /// Compliance tags.
    pub tags: BTreeSet<ComplianceTag>,
    /// Details are encrypted at rest.
    pub encrypted: bool,
    /// Hex HMAC-SHA256 over the canonical form.
    pub signature: String,
}

/// An immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Monotonic position in the log, starting at 1.
    pub sequence: u64,
    /// Unique identifier.
    pub id: Uuid,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Who.
    pub actor: Actor,
    /// What.
    pub action: EventAction,
    /// Correlation.
    pub context: EventContext,
    /// Outcome.
    pub result: EventResult,
    /// Classification and signature.
    pub security: SecurityInfo,
    /// Link hash of the previous event; `None` for the first event.
    pub prev_hash: Option<String>,
    /// Sealed details, when encryption is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_details: Option<String>,
}

impl AuditEvent {
    /// Canonical bytes covered by the signature.
    ///
    /// JSON with sorted keys, excluding `security.signature` and
    /// `encrypted_details`. Details must be in plaintext.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, AuditError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("encrypted_details");
            if let Some(security) = obj.get_mut("security").and_then(Value::as_object_mut) {
                security.remove("signature");
            }
        }
        Ok(serde_json::to_vec(&value)?)
    }

    /// Hash that the next event stores as `prev_hash`.
    pub fn link_hash(&self) -> Result<String, AuditError> {
        Ok(chain_hash(&self.canonical_bytes()?, &self.security.signature))
    }

    /// Shortcut for the actor id.
    pub fn agent_id(&self) -> &str {
        &self.actor.id
    }
}

/// A partial event supplied by a caller.
#[derive(Debug, Clone)]
pub struct EventDraft {
    actor: Actor,
    action: EventAction,
    context: EventContext,
    result: EventResult,
    risk: Option<RiskLevel>,
}

impl EventDraft {
    /// Start a draft with a successful outcome.
    pub fn new(actor: Actor, kind: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            actor,
            action: EventAction {
                kind: kind.into(),
                target: target.into(),
                details: BTreeMap::new(),
            },
            context: EventContext::default(),
            result: EventResult {
                status: Outcome::Success,
                message: None,
            },
            risk: None,
        }
    }

    /// Add a detail entry.
    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.action.details.insert(key.into(), value.into());
        self
    }

    /// Set the correlation context.
    pub fn context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }

    /// Set the session id.
    pub fn session(mut self, session_id: Option<String>) -> Self {
        self.context.session_id = session_id;
        self
    }

    /// Mark as touching personal data.
    pub fn pii(mut self, pii: bool) -> Self {
        self.context.pii = pii;
        self
    }

    /// Set the outcome.
    pub fn outcome(mut self, status: Outcome, message: impl Into<String>) -> Self {
        self.result = EventResult {
            status,
            message: Some(message.into()),
        };
        self
    }

    /// Minimum risk; the rule table may raise it.
    pub fn risk(mut self, risk: RiskLevel) -> Self {
        self.risk = Some(risk);
        self
    }
}

/// Receives high and critical events synchronously after they are stored.
pub trait AlertSink: Send + Sync {
    /// Deliver an alert. Failures are logged, never fatal.
    fn alert(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Alert sink that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, event: &AuditEvent) -> Result<(), AuditError> {
        if event.security.risk == RiskLevel::Critical {
            tracing::error!(
                sequence = event.sequence,
                actor = %event.actor.id,
                action = %event.action.kind,
                target = %event.action.target,
                "critical audit event"
            );
        } else {
            tracing::warn!(
                sequence = event.sequence,
                actor = %event.actor.id,
                action = %event.action.kind,
                target = %event.action.target,
                "high-risk audit event"
            );
        }
        Ok(())
    }
}

/// Observes every stored event in append order.
///
/// Called under the logger's write lock: implementations must not log events.
pub trait AuditSubscriber: Send + Sync {
    /// Handle one stored event (details in plaintext).
    fn on_event(&self, event: &AuditEvent);
}

/// Logger configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// HMAC secret for signatures.
    pub secret: String,
    /// Hex-encoded 32-byte key; enables detail encryption.
    pub encryption_key: Option<String>,
}

impl fmt::Debug for AuditConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditConfig")
            .field("secret", &"<redacted>")
            .field("encryption", &self.encryption_key.is_some())
            .finish()
    }
}

/// Query filter. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFilter {
    /// Actor id.
    pub agent: Option<String>,
    /// Actor kind.
    pub actor_type: Option<ActorType>,
    /// Prefix of the action type (`sandbox.`).
    pub action_prefix: Option<String>,
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub to: Option<DateTime<Utc>>,
    /// Events must carry every listed tag.
    pub tags: BTreeSet<ComplianceTag>,
    /// Minimum risk.
    pub min_risk: Option<RiskLevel>,
    /// Outcome status.
    pub outcome: Option<Outcome>,
    /// Return at most this many events (oldest first).
    pub limit: Option<usize>,
}

impl AuditFilter {
    /// Whether the event passes every set criterion.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.agent.as_deref().map_or(true, |a| event.actor.id == a)
            && self.actor_type.map_or(true, |t| event.actor.kind == t)
            && self
                .action_prefix
                .as_deref()
                .map_or(true, |p| event.action.kind.starts_with(p))
            && self.from.map_or(true, |from| event.timestamp >= from)
            && self.to.map_or(true, |to| event.timestamp < to)
            && self.tags.is_subset(&event.security.tags)
            && self.min_risk.map_or(true, |r| event.security.risk >= r)
            && self.outcome.map_or(true, |o| event.result.status == o)
    }
}

struct LoggerInner {
    backend: Box<dyn AuditBackend>,
    next_sequence: u64,
    tail_hash: Option<String>,
}

/// The audit logger.
pub struct AuditLogger {
    inner: Mutex<LoggerInner>,
    signer: EventSigner,
    cipher: Option<DetailCipher>,
    alerts: RwLock<Vec<Arc<dyn AlertSink>>>,
    subscribers: RwLock<Vec<Arc<dyn AuditSubscriber>>>,
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AuditLogger")
            .field("next_sequence", &inner.next_sequence)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

impl AuditLogger {
    /// Open a logger on a backend, resuming its sequence and chain.
    ///
    /// A [`TracingAlertSink`] is installed by default.
    pub fn open(config: &AuditConfig, backend: Box<dyn AuditBackend>) -> Result<Self, AuditError> {
        let signer = EventSigner::new(config.secret.as_bytes())?;
        let cipher = config
            .encryption_key
            .as_deref()
            .map(DetailCipher::from_hex)
            .transpose()?;

        let existing = backend.load_all()?;
        let (next_sequence, tail_hash) = match existing.last() {
            Some(last) => {
                let plain = open_details(last.clone(), cipher.as_ref())?;
                (last.sequence + 1, Some(plain.link_hash()?))
            }
            None => (1, None),
        };

        Ok(Self {
            inner: Mutex::new(LoggerInner {
                backend,
                next_sequence,
                tail_hash,
            }),
            signer,
            cipher,
            alerts: RwLock::new(vec![Arc::new(TracingAlertSink)]),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    /// In-memory logger for tests and embedding.
    pub fn in_memory(secret: &str) -> Result<Self, AuditError> {
        Self::open(
            &AuditConfig {
                secret: secret.to_string(),
                encryption_key: None,
            },
            Box::new(crate::audit_backend::MemoryAuditBackend::default()),
        )
    }

    /// Add an alert sink.
    pub fn add_alert_sink(&self, sink: Arc<dyn AlertSink>) {
        self.alerts.write().push(sink);
    }

    /// Replace all alert sinks.
    pub fn set_alert_sinks(&self, sinks: Vec<Arc<dyn AlertSink>>) {
        *self.alerts.write() = sinks;
    }

    /// Add a subscriber. It sees only events appended after this call.
    pub fn subscribe(&self, subscriber: Arc<dyn AuditSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Whether details are encrypted at rest.
    pub fn encrypts(&self) -> bool {
        self.cipher.is_some()
    }

    /// Complete, sign and append an event.
    ///
    /// Returns the stored event with details in plaintext. On error nothing was
    /// stored and the sequence does not advance.
    pub fn log_event(&self, draft: EventDraft) -> Result<AuditEvent, AuditError> {
        let mut inner = self.inner.lock();

        let table_risk = assess_risk(&draft.action, draft.result.status);
        let risk = draft.risk.map_or(table_risk, |r| r.max(table_risk));
        let tags = derive_tags(&draft.action, &draft.context);

        let mut event = AuditEvent {
            sequence: inner.next_sequence,
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: draft.actor,
            action: draft.action,
            context: draft.context,
            result: draft.result,
            security: SecurityInfo {
                risk,
                tags,
                encrypted: self.cipher.is_some(),
                signature: String::new(),
            },
            prev_hash: inner.tail_hash.clone(),
            encrypted_details: None,
        };

        let canonical = event.canonical_bytes()?;
        event.security.signature = self.signer.sign(&canonical);
        let link = chain_hash(&canonical, &event.security.signature);

        let stored = match &self.cipher {
            Some(cipher) => {
                let mut sealed = event.clone();
                let details = serde_json::to_vec(&sealed.action.details)?;
                sealed.encrypted_details = Some(cipher.seal(&details)?);
                sealed.action.details.clear();
                sealed
            }
            None => event.clone(),
        };

        inner.backend.append(&stored)?;
        inner.next_sequence += 1;
        inner.tail_hash = Some(link);

        for subscriber in self.subscribers.read().iter() {
            subscriber.on_event(&event);
        }
        drop(inner);

        tracing::trace!(
            sequence = event.sequence,
            action = %event.action.kind,
            risk = %event.security.risk,
            "audit event appended"
        );

        if event.security.risk >= RiskLevel::High {
            for sink in self.alerts.read().iter() {
                if let Err(e) = sink.alert(&event) {
                    tracing::warn!(sequence = event.sequence, error = %e, "alert dispatch failed");
                }
            }
        }

        Ok(event)
    }

    /// Every stored event, details decrypted.
    pub fn events(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let stored = self.inner.lock().backend.load_all()?;
        stored
            .into_iter()
            .map(|e| open_details(e, self.cipher.as_ref()))
            .collect()
    }

    /// Events matching a filter, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        let matched = self.events()?.into_iter().filter(|e| filter.matches(e));
        Ok(match filter.limit {
            Some(n) => matched.take(n).collect(),
            None => matched.collect(),
        })
    }

    /// Number of stored events.
    pub fn count(&self) -> Result<usize, AuditError> {
        self.inner.lock().backend.count()
    }

    /// Verify every signature and chain link in the store.
    pub fn verify(&self) -> Result<(), AuditError> {
        verify_events(&self.events()?, &self.signer)
    }

    /// Remove the leading run of events older than `cutoff`.
    ///
    /// Only a prefix is removed so the remaining chain stays verifiable. The
    /// removal is itself recorded as an `audit.retention` event.
    pub fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
        let removed = self.inner.lock().backend.remove_prefix_before(cutoff)?;
        tracing::info!(removed, %cutoff, "audit retention applied");
        self.log_event(
            EventDraft::new(Actor::system(), "audit.retention", "audit-log")
                .detail("removed", removed as u64)
                .detail("cutoff", cutoff.to_rfc3339()),
        )?;
        Ok(removed)
    }
}

/// Decrypt `encrypted_details` back into `action.details`.
pub fn open_details(
    mut event: AuditEvent,
    cipher: Option<&DetailCipher>,
) -> Result<AuditEvent, AuditError> {
    if let Some(sealed) = event.encrypted_details.take() {
        let cipher = cipher.ok_or_else(|| AuditError::Integrity {
            sequence: event.sequence,
            message: "details are encrypted and no key is configured".into(),
        })?;
        let plain = cipher.open(&sealed)?;
        event.action.details = serde_json::from_slice(&plain)?;
    }
    Ok(event)
}

/// Verify signatures and chain links of plaintext events, reporting the first
/// broken one.
///
/// The genesis check (no `prev_hash`) applies only to sequence 1, since
/// retention may have removed the head of the log.
pub fn verify_events(events: &[AuditEvent], signer: &EventSigner) -> Result<(), AuditError> {
    let mut expected_prev: Option<String> = None;

    for (idx, event) in events.iter().enumerate() {
        let canonical = event.canonical_bytes()?;
        if !signer.verify(&canonical, &event.security.signature) {
            return Err(AuditError::Integrity {
                sequence: event.sequence,
                message: "signature mismatch".into(),
            });
        }

        if idx == 0 {
            if event.sequence == 1 && event.prev_hash.is_some() {
                return Err(AuditError::Integrity {
                    sequence: event.sequence,
                    message: "genesis event has a prev_hash".into(),
                });
            }
        } else {
            let prev = &events[idx - 1];
            if event.sequence != prev.sequence + 1 {
                return Err(AuditError::Integrity {
                    sequence: event.sequence,
                    message: format!("sequence gap after {}", prev.sequence),
                });
            }
            if event.prev_hash != expected_prev {
                return Err(AuditError::Integrity {
                    sequence: event.sequence,
                    message: "prev_hash does not match previous event".into(),
                });
            }
        }

        expected_prev = Some(chain_hash(&canonical, &event.security.signature));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn logger() -> AuditLogger {
        AuditLogger::in_memory("test-secret").unwrap()
    }

    #[test]
    fn test_log_completes_event() {
        let log = logger();
        let e1 = log
            .log_event(EventDraft::new(Actor::agent("a1"), "file.read", "./src/lib.rs"))
            .unwrap();
        let e2 = log
            .log_event(EventDraft::new(Actor::agent("a1"), "file.read", "./src/main.rs"))
            .unwrap();

        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);
        assert!(e1.prev_hash.is_none());
        assert_eq!(e2.prev_hash, Some(e1.link_hash().unwrap()));
        assert_ne!(e1.id, e2.id);
        assert_eq!(log.count().unwrap(), 2);
        log.verify().unwrap();
    }

    #[test]
    fn test_caller_risk_only_raised() {
        let log = logger();
        let e = log
            .log_event(
                EventDraft::new(Actor::agent("a1"), "file.delete", "x").risk(RiskLevel::Low),
            )
            .unwrap();
        assert_eq!(e.security.risk, RiskLevel::Medium);

        let e = log
            .log_event(
                EventDraft::new(Actor::agent("a1"), "file.read", "x").risk(RiskLevel::High),
            )
            .unwrap();
        assert_eq!(e.security.risk, RiskLevel::High);
    }

    #[test]
    fn test_mutation_breaks_signature() {
        let log = logger();
        log.log_event(EventDraft::new(Actor::agent("a1"), "file.read", "a"))
            .unwrap();
        let mut events = log.events().unwrap();
        events[0].action.target = "b".into();
        let signer = EventSigner::new("test-secret").unwrap();
        assert!(matches!(
            verify_events(&events, &signer),
            Err(AuditError::Integrity { sequence: 1, .. })
        ));
    }

    #[test]
    fn test_deletion_breaks_chain() {
        let log = logger();
        for i in 0..3 {
            log.log_event(EventDraft::new(Actor::agent("a1"), "file.read", format!("f{i}")))
                .unwrap();
        }
        let mut events = log.events().unwrap();
        events.remove(1);
        let signer = EventSigner::new("test-secret").unwrap();
        assert!(verify_events(&events, &signer).is_err());
    }

    struct CountingSink(AtomicUsize);

    impl AlertSink for CountingSink {
        fn alert(&self, _event: &AuditEvent) -> Result<(), AuditError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_alerts_only_for_high_risk() {
        let log = logger();
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        log.set_alert_sinks(vec![sink.clone()]);

        log.log_event(EventDraft::new(Actor::agent("a1"), "file.read", "x"))
            .unwrap();
        log.log_event(
            EventDraft::new(Actor::agent("a1"), "permission.check", "x")
                .outcome(Outcome::Failure, "denied"),
        )
        .unwrap();
        log.log_event(
            EventDraft::new(Actor::user("u1"), "auth.failure", "login")
                .outcome(Outcome::Failure, "bad password"),
        )
        .unwrap();

        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }

    struct Recorder(Mutex<Vec<u64>>);

    impl AuditSubscriber for Recorder {
        fn on_event(&self, event: &AuditEvent) {
            self.0.lock().push(event.sequence);
        }
    }

    #[test]
    fn test_subscribers_see_append_order() {
        let log = Arc::new(logger());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        log.subscribe(recorder.clone());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        log.log_event(EventDraft::new(
                            Actor::agent(format!("a{t}")),
                            "file.read",
                            format!("f{i}"),
                        ))
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let seen = recorder.0.lock().clone();
        assert_eq!(seen, (1..=100).collect::<Vec<u64>>());
        log.verify().unwrap();
    }

    #[test]
    fn test_encrypted_details() {
        let config = AuditConfig {
            secret: "s".into(),
            encryption_key: Some("11".repeat(32)),
        };
        let log = AuditLogger::open(
            &config,
            Box::new(crate::audit_backend::MemoryAuditBackend::default()),
        )
        .unwrap();

        let e = log
            .log_event(
                EventDraft::new(Actor::agent("a1"), "profile.update", "user")
                    .detail("email", "a@example.com"),
            )
            .unwrap();
        assert!(e.security.encrypted);
        assert!(e.security.tags.contains(&ComplianceTag::Gdpr));

        let back = log.events().unwrap();
        assert_eq!(back[0].action.details["email"], "a@example.com");
        log.verify().unwrap();
    }

    #[test]
    fn test_query_filter() {
        let log = logger();
        log.log_event(EventDraft::new(Actor::agent("a1"), "file.read", "x"))
            .unwrap();
        log.log_event(
            EventDraft::new(Actor::agent("a2"), "permission.check", "y")
                .outcome(Outcome::Failure, "denied"),
        )
        .unwrap();
        log.log_event(EventDraft::new(Actor::system(), "sandbox.create", "a1"))
            .unwrap();

        let by_agent = log
            .query(&AuditFilter {
                agent: Some("a2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_agent.len(), 1);

        let critical = log
            .query(&AuditFilter {
                min_risk: Some(RiskLevel::Critical),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(critical[0].actor.id, "a2");

        let tagged = log
            .query(&AuditFilter {
                tags: BTreeSet::from([ComplianceTag::Iso27001]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tagged[0].action.kind, "sandbox.create");

        let limited = log
            .query(&AuditFilter {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_expire_before_is_audited() {
        let log = logger();
        log.log_event(EventDraft::new(Actor::agent("a1"), "file.read", "x"))
            .unwrap();
        log.log_event(EventDraft::new(Actor::agent("a1"), "file.read", "y"))
            .unwrap();

        let removed = log.expire_before(Utc::now() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(removed, 2);

        let events = log.events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action.kind, "audit.retention");
        assert_eq!(events[0].sequence, 3);
        log.verify().unwrap();
    }
}
