//! Approval gate
//!
//! Owns the approval memory and the table of pending confirmations for one
//! session. Calls that cannot be approved locally are escalated: a
//! [`PendingApproval`] is stored, an [`ApprovalEvent::Required`] is broadcast,
//! and the caller suspends until someone answers through
//! [`ApprovalGate::submit`], the entry goes stale, or the gate is torn down.

use super::{ApprovalMemory, ApprovalMode, MemoryHit, Remember, RiskLevel, ToolCategory};
use crate::config::ApprovalConfig;
use crate::error::ApprovalError;
use crate::tools::ToolDescriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Why a call was allowed without asking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ApprovalSource {
    /// A remembered decision matched
    Memory { hit: MemoryHit },
    /// The tool's own predicate said no confirmation is needed
    Predicate,
    /// The session mode does not require confirmation for this category
    Mode,
    /// Someone confirmed through the escalation channel
    User,
}

/// Local resolution of a call, before any escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved(ApprovalSource),
    NeedsConfirmation,
}

/// Answer delivered to a suspended call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub remember: Remember,
    pub reason: Option<String>,
}

impl ApprovalOutcome {
    fn denied(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            remember: Remember::Once,
            reason: Some(reason.into()),
        }
    }
}

/// Final verdict for one tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Approved(ApprovalSource),
    Denied { reason: String },
    /// The run was canceled while waiting
    Canceled,
}

/// Events published by the gate for external confirmation channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalEvent {
    Required {
        call_id: String,
        tool_name: String,
        params: Value,
        category: ToolCategory,
        risk_level: RiskLevel,
        timeout_ms: u64,
    },
    Resolved {
        call_id: String,
        approved: bool,
        remember: Remember,
    },
    Expired {
        call_id: String,
    },
    Cancelled {
        call_id: String,
    },
}

/// A confirmation waiting for an answer
pub struct PendingApproval {
    pub call_id: String,
    pub tool_name: String,
    pub params: Value,
    pub requested_at: DateTime<Utc>,
    created: Instant,
    response_tx: oneshot::Sender<ApprovalOutcome>,
}

impl PendingApproval {
    pub fn is_stale(&self, horizon: Duration) -> bool {
        self.created.elapsed() > horizon
    }

    fn remaining_ms(&self, horizon: Duration) -> u64 {
        let elapsed = self.created.elapsed().as_millis() as u64;
        (horizon.as_millis() as u64).saturating_sub(elapsed)
    }
}

impl std::fmt::Debug for PendingApproval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingApproval")
            .field("call_id", &self.call_id)
            .field("tool_name", &self.tool_name)
            .field("params", &self.params)
            .field("requested_at", &self.requested_at)
            .finish()
    }
}

/// Snapshot of a pending approval, for status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    pub call_id: String,
    pub tool_name: String,
    pub requested_at: DateTime<Utc>,
    pub remaining_ms: u64,
}

/// Per-session approval gate
pub struct ApprovalGate {
    mode: RwLock<ApprovalMode>,
    memory: Mutex<ApprovalMemory>,
    pending: Mutex<HashMap<String, PendingApproval>>,
    max_pending: usize,
    pending_timeout: Duration,
    sweep_interval: Duration,
    event_tx: broadcast::Sender<ApprovalEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new(&ApprovalConfig::default())
    }
}

impl ApprovalGate {
    pub fn new(config: &ApprovalConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            mode: RwLock::new(config.mode),
            memory: Mutex::new(ApprovalMemory::new(config.memory_capacity)),
            pending: Mutex::new(HashMap::new()),
            max_pending: config.max_pending,
            pending_timeout: Duration::from_secs(config.pending_timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            event_tx,
        }
    }

    /// Gate with default limits and the given mode
    pub fn with_mode(mode: ApprovalMode) -> Self {
        Self::new(&ApprovalConfig {
            mode,
            ..Default::default()
        })
    }

    pub fn mode(&self) -> ApprovalMode {
        *self.mode.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_mode(&self, mode: ApprovalMode) {
        *self.mode.write().unwrap_or_else(PoisonError::into_inner) = mode;
        tracing::info!(mode = ?mode, "Approval mode changed");
    }

    pub fn pending_timeout(&self) -> Duration {
        self.pending_timeout
    }

    /// Subscribe to approval events
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.event_tx.subscribe()
    }

    // ========================================================================
    // Local resolution
    // ========================================================================

    /// Resolve a call without escalating
    ///
    /// `predicate` is the tool's custom `needs_approval` hook; it is only
    /// consulted when memory has no answer. A `Some` verdict is final.
    pub fn check<F>(&self, tool: &ToolDescriptor, params: &Value, predicate: F) -> ApprovalDecision
    where
        F: FnOnce(ApprovalMode) -> Option<bool>,
    {
        if let Some(hit) = lock(&self.memory).check(&tool.name, params) {
            tracing::debug!(tool_name = tool.name.as_str(), hit = ?hit, "Approval memory hit");
            return ApprovalDecision::Approved(ApprovalSource::Memory { hit });
        }

        let mode = self.mode();
        if let Some(needs) = predicate(mode) {
            return if needs {
                ApprovalDecision::NeedsConfirmation
            } else {
                ApprovalDecision::Approved(ApprovalSource::Predicate)
            };
        }

        if mode.requires_approval(tool.category) {
            ApprovalDecision::NeedsConfirmation
        } else {
            ApprovalDecision::Approved(ApprovalSource::Mode)
        }
    }

    /// Full resolution: local check, then escalation if required
    pub async fn authorize<F>(
        &self,
        call_id: &str,
        tool: &ToolDescriptor,
        params: &Value,
        predicate: F,
        cancel: &CancellationToken,
    ) -> Authorization
    where
        F: FnOnce(ApprovalMode) -> Option<bool>,
    {
        match self.check(tool, params, predicate) {
            ApprovalDecision::Approved(source) => Authorization::Approved(source),
            ApprovalDecision::NeedsConfirmation => {
                self.escalate(call_id, tool, params, cancel).await
            }
        }
    }

    /// Register a pending approval and wait for its resolution
    ///
    /// A full or duplicate pending table is reported as a denial.
    pub async fn escalate(
        &self,
        call_id: &str,
        tool: &ToolDescriptor,
        params: &Value,
        cancel: &CancellationToken,
    ) -> Authorization {
        match self.request(call_id, tool, params) {
            Ok(rx) => self.wait_for(call_id, rx, cancel).await,
            Err(e) => Self::rejected(e),
        }
    }

    /// Denial for an escalation the pending table refused
    pub fn rejected(error: ApprovalError) -> Authorization {
        tracing::warn!(error = %error, "Approval escalation rejected");
        Authorization::Denied {
            reason: error.to_string(),
        }
    }

    /// Wait on a receiver returned by [`request`](Self::request)
    ///
    /// Cancellation removes the pending entry. A wait longer than the pending
    /// timeout is treated as an expiry even if no sweeper is running.
    #[tracing::instrument(
        name = "a3s.approval.request",
        skip(self, rx, cancel),
        fields(a3s.tool.id = call_id)
    )]
    pub async fn wait_for(
        &self,
        call_id: &str,
        rx: oneshot::Receiver<ApprovalOutcome>,
        cancel: &CancellationToken,
    ) -> Authorization {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.cancel(call_id);
                return Authorization::Canceled;
            }
            res = tokio::time::timeout(self.pending_timeout, rx) => res,
        };

        match outcome {
            Ok(Ok(outcome)) if outcome.approved => Authorization::Approved(ApprovalSource::User),
            Ok(Ok(outcome)) => Authorization::Denied {
                reason: outcome
                    .reason
                    .unwrap_or_else(|| "Denied by user".to_string()),
            },
            Ok(Err(_)) => Authorization::Denied {
                reason: ApprovalError::ChannelClosed(call_id.to_string()).to_string(),
            },
            Err(_) => {
                self.expire(call_id);
                Authorization::Denied {
                    reason: format!(
                        "Approval timed out after {}s",
                        self.pending_timeout.as_secs()
                    ),
                }
            }
        }
    }

    // ========================================================================
    // Escalation channel
    // ========================================================================

    /// Register a pending approval and announce it
    ///
    /// The returned receiver fires once the call is resolved, cancelled, or
    /// evicted as stale.
    pub fn request(
        &self,
        call_id: &str,
        tool: &ToolDescriptor,
        params: &Value,
    ) -> Result<oneshot::Receiver<ApprovalOutcome>, ApprovalError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(call_id) {
                return Err(ApprovalError::Duplicate(call_id.to_string()));
            }
            if pending.len() >= self.max_pending {
                return Err(ApprovalError::QueueFull {
                    capacity: self.max_pending,
                });
            }
            pending.insert(
                call_id.to_string(),
                PendingApproval {
                    call_id: call_id.to_string(),
                    tool_name: tool.name.clone(),
                    params: params.clone(),
                    requested_at: Utc::now(),
                    created: Instant::now(),
                    response_tx: tx,
                },
            );
        }

        tracing::info!(
            tool_name = tool.name.as_str(),
            call_id = call_id,
            risk = ?tool.risk_level,
            "Tool call awaiting approval"
        );

        let _ = self.event_tx.send(ApprovalEvent::Required {
            call_id: call_id.to_string(),
            tool_name: tool.name.clone(),
            params: params.clone(),
            category: tool.category,
            risk_level: tool.risk_level,
            timeout_ms: self.pending_timeout.as_millis() as u64,
        });

        Ok(rx)
    }

    /// Answer a pending approval
    ///
    /// Approvals with `Always`/`AlwaysTool` are written to memory before the
    /// waiting call is released. Returns false if nothing was pending under
    /// `call_id`.
    pub fn submit(&self, call_id: &str, approved: bool, remember: Remember) -> bool {
        let Some(entry) = lock(&self.pending).remove(call_id) else {
            tracing::debug!(call_id = call_id, "No pending approval to resolve");
            return false;
        };

        if approved && remember != Remember::Once {
            lock(&self.memory).remember(&entry.tool_name, &entry.params, remember);
        }

        tracing::info!(
            call_id = call_id,
            tool_name = entry.tool_name.as_str(),
            approved = approved,
            remember = ?remember,
            "Approval resolved"
        );

        let _ = self.event_tx.send(ApprovalEvent::Resolved {
            call_id: call_id.to_string(),
            approved,
            remember,
        });

        let _ = entry.response_tx.send(ApprovalOutcome {
            approved,
            remember,
            reason: None,
        });
        true
    }

    /// Seed memory ahead of a call
    pub fn pre_approve(&self, tool_name: &str, params: &Value, remember: Remember) {
        lock(&self.memory).remember(tool_name, params, remember);
    }

    pub fn clear_memory(&self) {
        lock(&self.memory).clear();
    }

    pub fn memory_len(&self) -> usize {
        lock(&self.memory).len()
    }

    // ========================================================================
    // Pending table maintenance
    // ========================================================================

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn pending_approvals(&self) -> Vec<PendingSummary> {
        lock(&self.pending)
            .values()
            .map(|p| PendingSummary {
                call_id: p.call_id.clone(),
                tool_name: p.tool_name.clone(),
                requested_at: p.requested_at,
                remaining_ms: p.remaining_ms(self.pending_timeout),
            })
            .collect()
    }

    /// Deny a single pending approval
    pub fn cancel(&self, call_id: &str) -> bool {
        let Some(entry) = lock(&self.pending).remove(call_id) else {
            return false;
        };
        let _ = self.event_tx.send(ApprovalEvent::Cancelled {
            call_id: call_id.to_string(),
        });
        let _ = entry
            .response_tx
            .send(ApprovalOutcome::denied("Approval cancelled"));
        true
    }

    /// Deny every pending approval
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingApproval> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            let _ = self.event_tx.send(ApprovalEvent::Cancelled {
                call_id: entry.call_id.clone(),
            });
            let _ = entry
                .response_tx
                .send(ApprovalOutcome::denied("Approval cancelled"));
        }
        if count > 0 {
            tracing::info!(count = count, "Cancelled pending approvals");
        }
        count
    }

    fn expire(&self, call_id: &str) -> bool {
        let Some(entry) = lock(&self.pending).remove(call_id) else {
            return false;
        };
        let _ = self.event_tx.send(ApprovalEvent::Expired {
            call_id: call_id.to_string(),
        });
        let _ = entry
            .response_tx
            .send(ApprovalOutcome::denied("Approval expired"));
        true
    }

    /// Auto-deny entries older than the pending timeout
    ///
    /// Returns the number of evicted entries.
    pub fn evict_stale(&self) -> usize {
        let stale: Vec<String> = lock(&self.pending)
            .values()
            .filter(|p| p.is_stale(self.pending_timeout))
            .map(|p| p.call_id.clone())
            .collect();

        let evicted = stale.iter().filter(|id| self.expire(id)).count();
        if evicted > 0 {
            tracing::warn!(count = evicted, "Evicted stale pending approvals");
        }
        evicted
    }

    /// Run `evict_stale` on the configured cadence until the gate is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let gate: Weak<Self> = Arc::downgrade(self);
        let every = self.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match gate.upgrade() {
                    Some(gate) => {
                        gate.evict_stale();
                    }
                    None => break,
                }
            }
        })
    }
}

impl Drop for ApprovalGate {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("mode", &self.mode())
            .field("pending", &self.pending_count())
            .field("max_pending", &self.max_pending)
            .field("pending_timeout", &self.pending_timeout)
            .finish()
    }
}
