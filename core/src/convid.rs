//! Symmetric conversation id manager (§4.5): one id per unordered pair of
//! screennames, allocated from [10000,65535]. On counter overflow the
//! entire map is reset and the counter restarts at 10000 (§3's "documented
//! wrap behavior" — see DESIGN.md for why in-flight conversations are not
//! preserved across a wrap).

use std::collections::HashMap;
use std::sync::Mutex;

const FIRST_ID: u32 = 10_000;
const LAST_ID: u32 = 65_535;

struct ConvState {
    forward: HashMap<(String, String), u16>,
    inverse: HashMap<u16, (String, String)>,
    counter: u32,
}

pub struct ConversationIdManager {
    state: Mutex<ConvState>,
}

/// Canonicalizes an unordered pair by case-insensitive sort, so argument
/// order and casing don't change which id is returned (§8 property 3, §4.5
/// scenario S4).
fn canonical_key(a: &str, b: &str) -> (String, String) {
    let (la, lb) = (a.to_lowercase(), b.to_lowercase());
    if la <= lb {
        (la, lb)
    } else {
        (lb, la)
    }
}

impl ConversationIdManager {
    pub fn new() -> Self {
        ConversationIdManager {
            state: Mutex::new(ConvState {
                forward: HashMap::new(),
                inverse: HashMap::new(),
                counter: FIRST_ID,
            }),
        }
    }

    pub fn get_or_create(&self, a: &str, b: &str) -> u16 {
        let key = canonical_key(a, b);
        let mut state = self.state.lock().expect("conversation id mutex poisoned");

        if let Some(&id) = state.forward.get(&key) {
            return id;
        }

        if state.counter > LAST_ID {
            state.forward.clear();
            state.inverse.clear();
            state.counter = FIRST_ID;
        }

        let id = state.counter as u16;
        state.counter += 1;
        state.forward.insert(key, id);
        state.inverse.insert(id, (a.to_string(), b.to_string()));
        id
    }

    /// Returns the other participant of conversation `id`, matching
    /// `sender` case-sensitively against the pair as originally created.
    pub fn other_participant(&self, id: u16, sender: &str) -> Option<String> {
        let state = self.state.lock().expect("conversation id mutex poisoned");
        let (x, y) = state.inverse.get(&id)?;

        if x == sender {
            Some(y.clone())
        } else if y == sender {
            Some(x.clone())
        } else {
            None
        }
    }
}

impl Default for ConversationIdManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_id_regardless_of_order_or_casing() {
        let mgr = ConversationIdManager::new();
        let k = mgr.get_or_create("Bobby", "TOSAdvisor");
        assert_eq!(mgr.get_or_create("tosadvisor", "bobby"), k);
        assert_eq!(mgr.other_participant(k, "Bobby").as_deref(), Some("TOSAdvisor"));
    }

    #[test]
    fn distinct_pairs_get_distinct_ids() {
        let mgr = ConversationIdManager::new();
        let k1 = mgr.get_or_create("Alice", "Bob");
        let k2 = mgr.get_or_create("Alice", "Carol");
        assert_ne!(k1, k2);
    }

    #[test]
    fn ids_start_at_10000() {
        let mgr = ConversationIdManager::new();
        assert_eq!(mgr.get_or_create("A", "B"), 10_000);
    }
}
