use std::{
    fmt::{self, Display},
    sync::Arc,
};

use courier_common::{Destination, internal};
use courier_queue::{EntryId, MemoryQueue, PeekLimit, Priority, Queue, QueueEntry, QueueError};
use dashmap::DashMap;
use serde::Deserialize;

use super::DeliveryInterceptor;
use crate::{ConnectionStateEnum, DeliveryError, DeliveryManager, EscalationCause};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Send,
    /// Park the entry in the destination's holdback queue until it is ALIVE
    /// again.
    Queue,
    Destroy,
}

/// What to do with an entry, parsed from strings like `"queue,notify"`.
///
/// A bare `"notify"` holds the entry back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct DispatchAction {
    pub kind: ActionKind,
    pub notify: bool,
}

impl DispatchAction {
    pub const SEND: Self = Self {
        kind: ActionKind::Send,
        notify: false,
    };

    #[must_use]
    pub const fn with_kind(self, kind: ActionKind) -> Self {
        Self {
            kind,
            notify: self.notify,
        }
    }
}

impl Default for DispatchAction {
    fn default() -> Self {
        Self::SEND
    }
}

impl TryFrom<String> for DispatchAction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::str::FromStr for DispatchAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut kind = None;
        let mut notify = false;

        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let parsed = match token.to_ascii_lowercase().as_str() {
                "send" => ActionKind::Send,
                "queue" => ActionKind::Queue,
                "destroy" => ActionKind::Destroy,
                "notify" => {
                    notify = true;
                    continue;
                }
                other => return Err(format!("unknown dispatch action '{other}'")),
            };

            if kind.replace(parsed).is_some() {
                return Err(format!("'{s}' names more than one of send, queue and destroy"));
            }
        }

        match (kind, notify) {
            (None, false) => Err("empty dispatch action".to_string()),
            (kind, notify) => Ok(Self {
                kind: kind.unwrap_or(ActionKind::Queue),
                notify,
            }),
        }
    }
}

impl Display for DispatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self.kind {
            ActionKind::Send => "send",
            ActionKind::Queue => "queue",
            ActionKind::Destroy => "destroy",
        })?;

        if self.notify {
            f.write_str(",notify")?;
        }

        Ok(())
    }
}

/// Action for an inclusive priority range.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PriorityRule {
    pub from: u8,
    pub to: u8,
    pub action: DispatchAction,
}

impl PriorityRule {
    #[must_use]
    pub fn covers(&self, priority: Priority) -> bool {
        (self.from..=self.to).contains(&priority.value())
    }
}

/// Per connection state rules; the first covering rule wins, otherwise
/// `default_action` applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PriorityPolicy {
    #[serde(default)]
    pub alive: Vec<PriorityRule>,
    #[serde(default)]
    pub polling: Vec<PriorityRule>,
    #[serde(default)]
    pub dead: Vec<PriorityRule>,
    #[serde(default)]
    pub default_action: DispatchAction,
}

impl PriorityPolicy {
    #[must_use]
    pub fn action_for(&self, state: ConnectionStateEnum, priority: Priority) -> DispatchAction {
        let rules = match state {
            ConnectionStateEnum::Alive => &self.alive,
            ConnectionStateEnum::Polling => &self.polling,
            ConnectionStateEnum::Dead => &self.dead,
        };

        rules
            .iter()
            .find(|rule| rule.covers(priority))
            .map_or(self.default_action, |rule| rule.action)
    }
}

/// Sends, holds back or destroys entries depending on their priority and the
/// destination's connection state.
///
/// While DEAD the batch it returns is escalated rather than sent, so `send`
/// and `queue` rules both escalate there and only `destroy` drops entries.
///
/// Registered as `"Priority,1.0"`.
#[derive(Debug, Default)]
pub struct PriorityInterceptor {
    policy: PriorityPolicy,
    holdback: DashMap<Destination, Arc<MemoryQueue>, ahash::RandomState>,
}

impl PriorityInterceptor {
    #[must_use]
    pub fn new(policy: PriorityPolicy) -> Self {
        Self {
            policy,
            holdback: DashMap::default(),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &PriorityPolicy {
        &self.policy
    }

    /// Entries currently held back for `destination`.
    #[must_use]
    pub fn holdback_len(&self, destination: &Destination) -> usize {
        self.holdback.get(destination).map_or(0, |queue| queue.len())
    }

    fn holdback_queue(&self, destination: &Destination) -> Arc<MemoryQueue> {
        self.holdback
            .entry(destination.clone())
            .or_insert_with(|| Arc::new(MemoryQueue::new(format!("{destination}/holdback"))))
            .value()
            .clone()
    }

    /// Move every held back entry into the destination's queue.
    fn flush(&self, manager: &DeliveryManager) {
        let Some(holdback) = self
            .holdback
            .get(manager.destination())
            .map(|queue| queue.value().clone())
        else {
            return;
        };

        loop {
            let entries = match holdback.peek(PeekLimit::unlimited()) {
                Ok(entries) if entries.is_empty() => break,
                Ok(entries) => entries,
                Err(e) => {
                    internal!(level = ERROR, "Unable to read {}: {e}", holdback.name());
                    break;
                }
            };

            internal!(
                level = INFO,
                "Flushing {} held back entries into {}",
                entries.len(),
                manager.queue().name()
            );

            let ids: Vec<EntryId> = entries.iter().map(QueueEntry::id).collect();
            for entry in entries {
                if let Err(e) = manager.queue().put(entry.clone()) {
                    manager.escalate(vec![entry], cause_for(e));
                }
            }

            match holdback.remove(&ids) {
                Ok(removed) if removed == ids.len() => {}
                Ok(removed) => {
                    internal!(
                        level = ERROR,
                        "Expected to remove {} entries from {}, removed {removed}",
                        ids.len(),
                        holdback.name()
                    );
                    break;
                }
                Err(e) => {
                    internal!(level = ERROR, "Unable to remove from {}: {e}", holdback.name());
                    break;
                }
            }
        }
    }
}

fn cause_for(error: QueueError) -> EscalationCause {
    if error.is_full() {
        EscalationCause::QueueFull(error)
    } else {
        EscalationCause::Internal(error.to_string())
    }
}

impl DeliveryInterceptor for PriorityInterceptor {
    fn add_delivery_manager(&self, manager: &DeliveryManager) -> Result<(), crate::PluginError> {
        self.holdback_queue(manager.destination());
        Ok(())
    }

    fn do_activate(&self, _manager: &DeliveryManager) -> bool {
        // Holdback and destroy rules also apply while not ALIVE
        true
    }

    fn handle_next_messages(
        &self,
        manager: &DeliveryManager,
        push: Option<Vec<QueueEntry>>,
    ) -> Result<Vec<QueueEntry>, DeliveryError> {
        if let Some(entries) = push {
            return Ok(entries);
        }

        let state = manager.connection().state();
        let limit = manager.config().burst_limit();

        loop {
            let peeked = manager.queue().peek_same_priority(limit)?;
            if peeked.is_empty() {
                return Ok(peeked);
            }

            let mut send = Vec::new();
            let mut settled = Vec::new();

            for entry in manager.prepare_entries(peeked)? {
                let mut action = self.policy.action_for(state, entry.priority());
                if state == ConnectionStateEnum::Dead && action.kind == ActionKind::Queue {
                    // Nothing flushes a holdback once DEAD, the entry is escalated instead
                    action = action.with_kind(ActionKind::Send);
                } else if action.kind == ActionKind::Send && state == ConnectionStateEnum::Polling {
                    internal!(
                        level = WARN,
                        "{} is {state} but {entry} is configured to be sent, holding it back instead",
                        manager.destination()
                    );
                    action = action.with_kind(ActionKind::Queue);
                }

                if action.notify {
                    internal!(
                        level = INFO,
                        "Notification for {}: {entry} handled as '{action}' while {state}",
                        manager.destination()
                    );
                }

                match action.kind {
                    ActionKind::Send => send.push(entry),
                    ActionKind::Queue => {
                        settled.push(entry.id());
                        let holdback = self.holdback_queue(manager.destination());
                        if let Err(e) = holdback.put(entry.clone()) {
                            manager.escalate(vec![entry], cause_for(e));
                        }
                    }
                    ActionKind::Destroy => {
                        internal!(level = DEBUG, "Destroying {entry} for {}", manager.destination());
                        settled.push(entry.id());
                    }
                }
            }

            if !settled.is_empty() {
                manager.queue().remove(&settled)?;
            }

            if !send.is_empty() {
                return Ok(send);
            }
        }
    }

    fn to_alive(&self, manager: &DeliveryManager) {
        self.flush(manager);
    }

    fn to_dead(&self, manager: &DeliveryManager, _error: Option<&str>) {
        // Held back entries get the `dead` rules applied on give-up
        self.flush(manager);
    }

    fn shutdown_manager(&self, manager: &DeliveryManager) {
        self.flush(manager);
        self.holdback.remove(manager.destination());
    }

    fn shutdown(&self) {
        self.holdback.clear();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_actions() {
        assert_eq!("send".parse::<DispatchAction>(), Ok(DispatchAction::SEND));
        assert_eq!(
            "queue, notify".parse::<DispatchAction>(),
            Ok(DispatchAction {
                kind: ActionKind::Queue,
                notify: true
            })
        );
        assert_eq!(
            "NOTIFY".parse::<DispatchAction>(),
            Ok(DispatchAction {
                kind: ActionKind::Queue,
                notify: true
            })
        );
        assert_eq!(
            "destroy".parse::<DispatchAction>().map(|a| a.to_string()),
            Ok("destroy".to_string())
        );
        assert!("".parse::<DispatchAction>().is_err());
        assert!("send,destroy".parse::<DispatchAction>().is_err());
        assert!("bounce".parse::<DispatchAction>().is_err());
    }

    #[test]
    fn test_policy_lookup() {
        let policy: PriorityPolicy = ron::from_str(
            r#"(
                alive: [(from: 0, to: 3, action: "queue,notify")],
                polling: [(from: 7, to: 9, action: "destroy")],
                default_action: "send",
            )"#,
        )
        .unwrap();

        assert_eq!(
            policy.action_for(ConnectionStateEnum::Alive, Priority::LOW).kind,
            ActionKind::Queue
        );
        assert_eq!(
            policy.action_for(ConnectionStateEnum::Alive, Priority::HIGH),
            DispatchAction::SEND
        );
        assert_eq!(
            policy.action_for(ConnectionStateEnum::Polling, Priority::MAX).kind,
            ActionKind::Destroy
        );
        assert_eq!(
            policy.action_for(ConnectionStateEnum::Dead, Priority::MIN),
            DispatchAction::SEND
        );
    }

    #[test]
    fn test_invalid_action_in_config() {
        let result: Result<PriorityPolicy, _> =
            ron::from_str(r#"(alive: [(from: 0, to: 9, action: "bounce")])"#);
        assert!(result.is_err());
    }
}
