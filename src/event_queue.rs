use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    event::Event,
    logging,
    storage::{load_json, save_json, Storage},
    Result,
};

/// Storage key of the persisted queue.
pub(crate) const QUEUE_STATE_KEY: &str = "splyt_depotState";

/// Ordered buffer of events waiting to be delivered.
///
/// Events are only removed once acknowledged, so delivery is at-least-once: a crash between a
/// successful send and [`EventQueue::acknowledge`] re-sends the batch.
#[derive(Debug, Clone)]
pub struct EventQueue {
    events: VecDeque<Event>,
    next_sequence: u64,
    capacity: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueSnapshot {
    next_sequence: u64,
    events: Vec<Event>,
}

impl EventQueue {
    /// Default maximum number of queued events.
    pub const DEFAULT_CAPACITY: usize = 10_000;

    /// Create an empty queue holding at most `capacity` events.
    pub fn new(capacity: usize) -> EventQueue {
        EventQueue {
            events: VecDeque::new(),
            next_sequence: 1,
            capacity: capacity.max(1),
        }
    }

    /// Append an event, assigning it the next sequence number. Returns the sequence number.
    ///
    /// When the queue is full, the oldest event is dropped to make room.
    pub fn enqueue(&mut self, mut event: Event) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        event.sequence = sequence;

        if self.events.len() >= self.capacity {
            if let Some(dropped) = self.events.pop_front() {
                logging::log_warn!(
                    capacity = self.capacity,
                    sequence = dropped.sequence;
                    "event queue is full, dropping oldest event");
            }
        }
        self.events.push_back(event);
        sequence
    }

    /// Return up to `max_batch` oldest events without removing them.
    pub fn drain(&self, max_batch: usize) -> Vec<Event> {
        self.events.iter().take(max_batch).cloned().collect()
    }

    /// Remove delivered events. Returns the number of events removed.
    ///
    /// Only a prefix of the queue is ever removed: removal stops at the first event that is not in
    /// `ids`. Unknown or already removed ids are ignored.
    pub fn acknowledge(&mut self, ids: &[Uuid]) -> usize {
        let ids: HashSet<&Uuid> = ids.iter().collect();
        let mut removed = 0;
        while let Some(front) = self.events.front() {
            if !ids.contains(&front.id) {
                break;
            }
            self.events.pop_front();
            removed += 1;
        }
        removed
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the queue holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate over queued events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Drop every queued event.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Write the queue contents to `storage`.
    pub fn persist(&self, storage: &dyn Storage) -> Result<()> {
        let snapshot = QueueSnapshot {
            next_sequence: self.next_sequence,
            events: self.events.iter().cloned().collect(),
        };
        save_json(storage, QUEUE_STATE_KEY, &snapshot)?;
        logging::log_debug!(events = self.events.len(); "persisted event queue");
        Ok(())
    }

    /// Replace the queue contents with the snapshot in `storage`.
    ///
    /// Does nothing if no snapshot has been persisted. Returns whether a snapshot was found.
    pub fn restore(&mut self, storage: &dyn Storage) -> Result<bool> {
        let Some(snapshot) = load_json::<QueueSnapshot>(storage, QUEUE_STATE_KEY)? else {
            return Ok(false);
        };

        let last_sequence = snapshot.events.last().map_or(0, |event| event.sequence);
        self.next_sequence = snapshot.next_sequence.max(last_sequence + 1);
        self.events = snapshot.events.into();
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        logging::log_debug!(events = self.events.len(); "restored event queue");
        Ok(true)
    }
}

impl Default for EventQueue {
    fn default() -> EventQueue {
        EventQueue::new(EventQueue::DEFAULT_CAPACITY)
    }
}
