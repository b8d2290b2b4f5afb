//! Per-message update throttling

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Last acceptance time per message type and discriminator
///
/// Entries are created lazily on the first message of a type.
#[derive(Debug, Default)]
pub struct UpdateTracker {
    last: HashMap<(&'static str, Option<&'static str>), Instant>,
}

impl UpdateTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a message should be processed now
    ///
    /// `present` lists the discriminator sub-fields carried by this message.
    /// Without discriminators one timer covers the whole message type;
    /// with them, the message is accepted when any present discriminator is
    /// due, and only those discriminators are stamped.
    pub fn accept(&mut self, message: &'static str, period: Duration, present: &[&'static str]) -> bool {
        let now = Instant::now();
        let due = |last: Option<&Instant>| last.map_or(true, |t| now.duration_since(*t) >= period);

        if present.is_empty() {
            let key = (message, None);
            if !due(self.last.get(&key)) {
                return false;
            }
            self.last.insert(key, now);
            return true;
        }

        let mut accepted = false;
        for &discriminator in present {
            let key = (message, Some(discriminator));
            if due(self.last.get(&key)) {
                self.last.insert(key, now);
                accepted = true;
            }
        }
        if !accepted {
            tracing::trace!("Throttled {} ({:?})", message, present);
        }
        accepted
    }

    /// Let the very next message of every type through
    pub fn allow_next_update(&mut self) {
        self.last.clear();
    }
}
