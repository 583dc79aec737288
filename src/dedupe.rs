use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a scraped message: contact name, text hash and text length.
///
/// The web client exposes no stable message ids, so two identical texts from
/// the same contact collapse into one id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessedMessageId(String);

impl ProcessedMessageId {
    pub fn derive(contact: &str, text: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        Self(format!(
            "{contact}_{:016x}_{}",
            hasher.finish(),
            text.chars().count()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessedMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processed ids kept per contact.
///
/// Each contact keeps its newest `per_contact` ids, so anything still on
/// screen stays known for as long as the contact does. When more than
/// `max_contacts` contacts are tracked, the one seen longest ago is dropped.
pub struct DedupeCache {
    contacts: HashMap<String, ContactIds>,
    per_contact: usize,
    max_contacts: usize,
    tick: u64,
}

struct ContactIds {
    ids: VecDeque<ProcessedMessageId>,
    last_seen: u64,
}

impl DedupeCache {
    pub fn new(per_contact: usize, max_contacts: usize) -> Self {
        Self {
            contacts: HashMap::new(),
            per_contact: per_contact.max(1),
            max_contacts: max_contacts.max(1),
            tick: 0,
        }
    }

    pub fn set_limits(&mut self, per_contact: usize, max_contacts: usize) {
        self.per_contact = per_contact.max(1);
        self.max_contacts = max_contacts.max(1);
        for entry in self.contacts.values_mut() {
            while entry.ids.len() > self.per_contact {
                entry.ids.pop_front();
            }
        }
        self.evict_idle_contacts();
    }

    pub fn contains(&self, contact: &str, id: &ProcessedMessageId) -> bool {
        self.contacts
            .get(contact)
            .is_some_and(|entry| entry.ids.contains(id))
    }

    /// Returns false when the id was already present. Either way the contact
    /// counts as seen now.
    pub fn insert(&mut self, contact: &str, id: ProcessedMessageId) -> bool {
        self.tick += 1;
        let tick = self.tick;
        let entry = self
            .contacts
            .entry(contact.to_owned())
            .or_insert_with(|| ContactIds {
                ids: VecDeque::new(),
                last_seen: tick,
            });
        entry.last_seen = tick;
        if entry.ids.contains(&id) {
            return false;
        }
        entry.ids.push_back(id);
        while entry.ids.len() > self.per_contact {
            entry.ids.pop_front();
        }
        self.evict_idle_contacts();
        true
    }

    pub fn len(&self) -> usize {
        self.contacts.values().map(|entry| entry.ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.values().all(|entry| entry.ids.is_empty())
    }

    fn evict_idle_contacts(&mut self) {
        while self.contacts.len() > self.max_contacts {
            let idle = self
                .contacts
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(contact, _)| contact.clone());
            let Some(contact) = idle else {
                break;
            };
            self.contacts.remove(&contact);
        }
    }
}
