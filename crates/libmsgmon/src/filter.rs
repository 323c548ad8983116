use std::collections::BTreeSet;
use std::sync::Arc;

use msgmon_protocol::{Message, MessageType};
use tracing::{debug, warn};

/// Observer of a [`MessageFilter`].
///
/// Errors returned from a callback are logged and isolated; they never reach
/// the caller that mutated the filter and never stop other listeners.
pub trait FilterListener: Send + Sync {
    /// The discovered vocabulary or the selection over it changed.
    fn choices_changed(
        &self,
        known: &BTreeSet<MessageType>,
        selected: &BTreeSet<MessageType>,
    ) -> anyhow::Result<()>;

    /// The acceptance predicate changed; dependent views must be rebuilt.
    fn filter_changed(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Which slice of the traffic a filter considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    /// Messages that carry no domain session id.
    System,
    /// Messages that carry a domain session id.
    DomainSession,
}

impl FilterScope {
    pub fn in_scope(self, message: &Message) -> bool {
        match self {
            FilterScope::System => message.domain_session_id.is_none(),
            FilterScope::DomainSession => message.domain_session_id.is_some(),
        }
    }
}

/// Notifications fired by a filter mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterNotice {
    pub choices_changed: bool,
    pub filter_changed: bool,
}

#[derive(Debug, Clone, Copy)]
enum Notification {
    Choices,
    Filter,
}

/// Visibility predicate for one log.
pub struct MessageFilter {
    scope: FilterScope,
    known: BTreeSet<MessageType>,
    selected: BTreeSet<MessageType>,
    entity_marking: Option<String>,
    listeners: Vec<Arc<dyn FilterListener>>,
}

impl MessageFilter {
    pub fn new(scope: FilterScope) -> Self {
        Self {
            scope,
            known: BTreeSet::new(),
            selected: BTreeSet::new(),
            entity_marking: None,
            listeners: Vec::new(),
        }
    }

    pub fn system() -> Self {
        Self::new(FilterScope::System)
    }

    pub fn domain_session() -> Self {
        Self::new(FilterScope::DomainSession)
    }

    pub fn scope(&self) -> FilterScope {
        self.scope
    }

    pub fn known_choices(&self) -> &BTreeSet<MessageType> {
        &self.known
    }

    pub fn selected_choices(&self) -> &BTreeSet<MessageType> {
        &self.selected
    }

    pub fn entity_marking(&self) -> Option<&str> {
        self.entity_marking.as_deref()
    }

    /// Decide whether `message` is visible, discovering its type on first
    /// sight. Newly discovered types start out selected.
    pub fn accept(&mut self, message: &Message) -> bool {
        if !self.scope.in_scope(message) {
            return false;
        }

        let message_type = message.message_type;
        if self.known.insert(message_type) {
            let _ = self.selected.insert(message_type);
            debug!(scope = ?self.scope, %message_type, "discovered message type");
            self.notify(Notification::Choices);
        }

        if !self.selected.contains(&message_type) {
            return false;
        }

        match self.entity_marking.as_deref() {
            Some(marking) if message_type == MessageType::EntityState => {
                message.entity_marking() == Some(marking)
            }
            _ => true,
        }
    }

    /// Replace the selection wholesale. Types never seen are ignored.
    pub fn set_selected_choices(
        &mut self,
        choices: impl IntoIterator<Item = MessageType>,
    ) -> FilterNotice {
        let mut selected = BTreeSet::new();
        for choice in choices {
            if self.known.contains(&choice) {
                let _ = selected.insert(choice);
            } else {
                debug!(scope = ?self.scope, %choice, "ignoring selection of undiscovered type");
            }
        }
        self.selected = selected;
        self.notify(Notification::Filter);
        FilterNotice {
            choices_changed: false,
            filter_changed: true,
        }
    }

    /// Select every known type.
    pub fn accept_all_choices(&mut self) -> FilterNotice {
        let widened = self.selected != self.known;
        self.selected = self.known.clone();
        self.notify(Notification::Choices);
        if widened {
            self.notify(Notification::Filter);
        }
        FilterNotice {
            choices_changed: true,
            filter_changed: widened,
        }
    }

    /// Restrict entity state messages to one entity marking. An empty value
    /// clears the restriction.
    pub fn set_sub_field_predicate(&mut self, value: &str) -> FilterNotice {
        let value = value.trim();
        self.entity_marking = if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        };
        self.notify(Notification::Filter);
        FilterNotice {
            choices_changed: false,
            filter_changed: true,
        }
    }

    /// Register a listener. Registering the same listener twice is a no-op.
    pub fn add_listener(&mut self, listener: Arc<dyn FilterListener>) {
        if !self.listeners.iter().any(|l| same_listener(l, &listener)) {
            self.listeners.push(listener);
        }
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn FilterListener>) {
        self.listeners.retain(|l| !same_listener(l, listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn notify(&self, notification: Notification) {
        for listener in &self.listeners {
            let result = match notification {
                Notification::Choices => listener.choices_changed(&self.known, &self.selected),
                Notification::Filter => listener.filter_changed(),
            };
            if let Err(e) = result {
                warn!(scope = ?self.scope, ?notification, error = %e, "filter listener failed");
            }
        }
    }
}

fn same_listener(a: &Arc<dyn FilterListener>, b: &Arc<dyn FilterListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
