use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use eventline_core::EventId;
use eventline_events::{Event, Metadata};

use super::{EventLog, EventLogError, EventStream, LoggedEvent};

#[derive(Debug)]
struct Entries<E> {
    events: Vec<(E, Metadata)>,
    ids: HashSet<EventId>,
}

/// In-memory event log.
///
/// Intended for tests/dev. Events are stored by value and handed back as fresh
/// `Arc`s on every read, the way a durable log would hand back deserialized copies.
#[derive(Debug)]
pub struct InMemoryEventLog<E> {
    entries: RwLock<Entries<E>>,
}

impl<E> InMemoryEventLog<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for InMemoryEventLog<E> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Entries {
                events: Vec::new(),
                ids: HashSet::new(),
            }),
        }
    }
}

impl<E: Event + Clone> InMemoryEventLog<E> {
    /// Ids of every logged event, in log order.
    pub fn event_ids(&self) -> Vec<EventId> {
        self.entries
            .read()
            .map(|e| e.events.iter().map(|(ev, _)| ev.event_id()).collect())
            .unwrap_or_default()
    }
}

impl<E: Event + Clone> EventLog<E> for InMemoryEventLog<E> {
    fn append(&self, batch: &[(Arc<E>, Metadata)]) -> Result<usize, EventLogError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| EventLogError::Storage("lock poisoned".to_string()))?;

        let mut written = 0;
        for (event, metadata) in batch {
            if entries.ids.insert(event.event_id()) {
                entries.events.push((E::clone(event), metadata.clone()));
                written += 1;
            }
        }
        Ok(written)
    }

    fn read(&self) -> Result<EventStream<'_, E>, EventLogError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| EventLogError::Storage("lock poisoned".to_string()))?;

        let logged: Vec<Result<LoggedEvent<E>, EventLogError>> = entries
            .events
            .iter()
            .zip(1u64..)
            .map(|((event, metadata), position)| {
                Ok(LoggedEvent {
                    position,
                    event: Arc::new(event.clone()),
                    metadata: metadata.clone(),
                })
            })
            .collect();
        Ok(Box::new(logged.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use eventline_core::{State, StateKey};
    use serde_json::json;

    #[derive(Debug)]
    struct Nothing;

    impl State for Nothing {
        fn initial(_key: &StateKey) -> Self {
            Nothing
        }
    }

    #[derive(Debug, Clone)]
    struct Noted {
        id: EventId,
    }

    impl Event for Noted {
        type State = Nothing;

        fn event_id(&self) -> EventId {
            self.id
        }

        fn event_type(&self) -> &'static str {
            "test.noted"
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            Utc::now()
        }

        fn states(&self) -> Vec<StateKey> {
            Vec::new()
        }
    }

    fn noted() -> Arc<Noted> {
        Arc::new(Noted { id: EventId::new() })
    }

    #[test]
    fn appending_the_same_event_twice_logs_it_once() {
        let log = InMemoryEventLog::<Noted>::new();
        let event = noted();
        let batch = vec![(event.clone(), Metadata::new())];

        assert_eq!(log.append(&batch).unwrap(), 1);
        assert_eq!(log.append(&batch).unwrap(), 0);
        assert_eq!(log.event_ids(), vec![event.id]);
    }

    #[test]
    fn read_yields_positions_metadata_and_fresh_arcs() {
        let log = InMemoryEventLog::<Noted>::new();
        let first = noted();
        let second = noted();
        let mut metadata = Metadata::new();
        metadata.insert("actor", json!("ops"));
        log.append(&[(first.clone(), metadata.clone()), (second.clone(), Metadata::new())])
            .unwrap();

        let read: Vec<_> = log.read().unwrap().collect::<Result<_, _>>().unwrap();

        assert_eq!(read.len(), 2);
        assert_eq!(read[0].position, 1);
        assert_eq!(read[1].position, 2);
        assert_eq!(read[0].event.id, first.id);
        assert_eq!(read[0].metadata, metadata);
        assert!(!Arc::ptr_eq(&read[0].event, &first));
    }
}
