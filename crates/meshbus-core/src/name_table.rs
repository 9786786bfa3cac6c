//! Authoritative name ownership table.
//!
//! Maps unique names to their registrations and well-known names (aliases)
//! to an ordered queue of claimants whose head is the owner. All mutations
//! and listener dispatch happen under one lock, so listeners observe
//! `NameOwnerChanged` events in exactly the order the mutations commit.
//!
//! Listener callbacks therefore run with the table lock held: they must not
//! call back into the table and must not block. The daemon's listeners only
//! snapshot state guarded by locks that are ordered after this one and push
//! into non-blocking queues.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::BusError;
use crate::name::{
    is_unique_name, is_well_known_name, request_flags, ReleaseNameReply, RequestNameReply,
};

/// Observer of name ownership transitions.
pub trait NameListener: Send + Sync {
    /// Called after the owner of `name` changed from `old_owner` to
    /// `new_owner`. `None` means no owner on that side of the transition.
    fn name_owner_changed(&self, name: &str, old_owner: Option<&str>, new_owner: Option<&str>);
}

#[derive(Debug, Clone)]
struct QueueEntry {
    owner: String,
    flags: u32,
}

#[derive(Default)]
struct TableState {
    unique: HashSet<String>,
    aliases: HashMap<String, VecDeque<QueueEntry>>,
    listeners: Vec<Arc<dyn NameListener>>,
}

type OwnerChange = (String, Option<String>, Option<String>);

impl TableState {
    fn dispatch(&self, changes: &[OwnerChange]) {
        for (name, old, new) in changes {
            for listener in &self.listeners {
                listener.name_owner_changed(name, old.as_deref(), new.as_deref());
            }
        }
    }
}

/// The daemon-wide name table.
#[derive(Default)]
pub struct NameTable {
    state: Mutex<TableState>,
}

impl NameTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `NameOwnerChanged` events.
    pub fn add_listener(&self, listener: Arc<dyn NameListener>) {
        self.state.lock().unwrap().listeners.push(listener);
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&self, listener: &Arc<dyn NameListener>) {
        self.state
            .lock()
            .unwrap()
            .listeners
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Registers a unique name. Emits `NameOwnerChanged(name, none, name)`.
    pub fn add_unique_name(&self, unique: &str) -> Result<(), BusError> {
        if !is_unique_name(unique) {
            return Err(BusError::InvalidArgs(format!("not a unique name: {unique}")));
        }
        let mut state = self.state.lock().unwrap();
        if !state.unique.insert(unique.to_string()) {
            return Err(BusError::AlreadyOwned(unique.to_string()));
        }
        state.dispatch(&[(unique.to_string(), None, Some(unique.to_string()))]);
        Ok(())
    }

    /// Removes a unique name and pops it from every alias queue it sits in.
    /// Aliases whose head changes get a new owner; emptied aliases are
    /// deleted. Returns false if the name was not registered.
    pub fn remove_unique_name(&self, unique: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.unique.remove(unique) {
            return false;
        }
        let mut changes: Vec<OwnerChange> = Vec::new();
        state.aliases.retain(|alias, queue| {
            let was_head = queue.front().is_some_and(|e| e.owner == unique);
            queue.retain(|e| e.owner != unique);
            if was_head {
                changes.push((
                    alias.clone(),
                    Some(unique.to_string()),
                    queue.front().map(|e| e.owner.clone()),
                ));
            }
            !queue.is_empty()
        });
        changes.push((unique.to_string(), Some(unique.to_string()), None));
        state.dispatch(&changes);
        true
    }

    /// Requests ownership of `alias` for `owner` with `flags` (see
    /// [`request_flags`]).
    pub fn request_name(
        &self,
        alias: &str,
        owner: &str,
        flags: u32,
    ) -> Result<RequestNameReply, BusError> {
        if !is_well_known_name(alias) {
            return Err(BusError::InvalidArgs(format!("not a well-known name: {alias}")));
        }
        let mut state = self.state.lock().unwrap();
        if !state.unique.contains(owner) {
            return Err(BusError::NameUnknown(owner.to_string()));
        }

        let entry = QueueEntry {
            owner: owner.to_string(),
            flags,
        };
        if !state.aliases.contains_key(alias) {
            state
                .aliases
                .insert(alias.to_string(), VecDeque::from([entry]));
            state.dispatch(&[(alias.to_string(), None, Some(owner.to_string()))]);
            return Ok(RequestNameReply::PrimaryOwner);
        }
        let queue = state.aliases.get_mut(alias).expect("checked above");

        let head = queue.front_mut().expect("alias queues are never empty");
        if head.owner == owner {
            // Re-request by the current owner updates its flags.
            head.flags = flags;
            return Ok(RequestNameReply::AlreadyOwner);
        }

        let replaceable = head.flags & request_flags::ALLOW_REPLACEMENT != 0;
        if replaceable && flags & request_flags::REPLACE_EXISTING != 0 {
            let old = queue.pop_front().expect("head exists");
            queue.retain(|e| e.owner != owner);
            if old.flags & request_flags::DO_NOT_QUEUE == 0 {
                queue.push_front(old.clone());
            }
            queue.push_front(entry);
            let change = (
                alias.to_string(),
                Some(old.owner),
                Some(owner.to_string()),
            );
            state.dispatch(&[change]);
            return Ok(RequestNameReply::PrimaryOwner);
        }

        if flags & request_flags::DO_NOT_QUEUE != 0 {
            return Ok(RequestNameReply::Exists);
        }
        if let Some(existing) = queue.iter_mut().find(|e| e.owner == owner) {
            existing.flags = flags;
        } else {
            queue.push_back(entry);
        }
        Ok(RequestNameReply::InQueue)
    }

    /// Releases `owner`'s claim on `alias`. If the owner was the head, the
    /// next queued claimant becomes owner.
    pub fn release_name(&self, alias: &str, owner: &str) -> ReleaseNameReply {
        let mut state = self.state.lock().unwrap();
        let Some(queue) = state.aliases.get_mut(alias) else {
            return ReleaseNameReply::NonExistent;
        };
        let Some(pos) = queue.iter().position(|e| e.owner == owner) else {
            return ReleaseNameReply::NotOwner;
        };
        queue.remove(pos);
        if pos == 0 {
            let new_owner = queue.front().map(|e| e.owner.clone());
            if queue.is_empty() {
                state.aliases.remove(alias);
            }
            state.dispatch(&[(alias.to_string(), Some(owner.to_string()), new_owner)]);
        }
        ReleaseNameReply::Released
    }

    /// Resolves a name to the unique name of its owner. Unique names
    /// resolve to themselves when registered.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        if state.unique.contains(name) {
            return Some(name.to_string());
        }
        state
            .aliases
            .get(name)
            .and_then(|q| q.front())
            .map(|e| e.owner.clone())
    }

    /// Whether `unique` is currently registered.
    #[must_use]
    pub fn is_registered(&self, unique: &str) -> bool {
        self.state.lock().unwrap().unique.contains(unique)
    }

    /// Aliases currently owned (head of queue) by `unique`.
    #[must_use]
    pub fn aliases_of(&self, unique: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .aliases
            .iter()
            .filter(|(_, q)| q.front().is_some_and(|e| e.owner == unique))
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    /// Snapshot of every registered unique name with its owned aliases,
    /// optionally restricted by a predicate over the unique name.
    #[must_use]
    pub fn unique_names_and_aliases<F>(&self, mut keep: F) -> Vec<(String, Vec<String>)>
    where
        F: FnMut(&str) -> bool,
    {
        let state = self.state.lock().unwrap();
        let mut out: Vec<(String, Vec<String>)> = state
            .unique
            .iter()
            .filter(|u| keep(u))
            .map(|u| (u.clone(), Vec::new()))
            .collect();
        out.sort();
        for (alias, queue) in &state.aliases {
            if let Some(head) = queue.front() {
                if let Some((_, aliases)) = out.iter_mut().find(|(u, _)| *u == head.owner) {
                    aliases.push(alias.clone());
                }
            }
        }
        out
    }

    /// Applies a remote claim with do-not-queue semantics, used while
    /// processing federation signals. Failures are reported to the caller
    /// but never propagate: a bad entry in a name exchange must not take
    /// the federation link down.
    pub fn apply_remote_claim(&self, alias: &str, owner: &str) -> Option<RequestNameReply> {
        match self.request_name(alias, owner, request_flags::DO_NOT_QUEUE) {
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!(alias, owner, error = %err, "skipping remote name claim");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<OwnerChange>>,
    }

    impl NameListener for Recorder {
        fn name_owner_changed(&self, name: &str, old: Option<&str>, new: Option<&str>) {
            self.events.lock().unwrap().push((
                name.to_string(),
                old.map(str::to_string),
                new.map(str::to_string),
            ));
        }
    }

    fn table_with_recorder() -> (NameTable, Arc<Recorder>) {
        let table = NameTable::new();
        let recorder = Arc::new(Recorder::default());
        table.add_listener(recorder.clone());
        (table, recorder)
    }

    #[test]
    fn first_request_becomes_primary_owner() {
        let (table, recorder) = table_with_recorder();
        table.add_unique_name(":1.0").unwrap();
        table.add_unique_name(":1.1").unwrap();
        recorder.events.lock().unwrap().clear();

        let reply = table.request_name("org.example.A", ":1.0", 0).unwrap();
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(
            recorder.events.lock().unwrap().as_slice(),
            &[("org.example.A".into(), None, Some(":1.0".into()))]
        );

        // Second endpoint with DO_NOT_QUEUE: refused, no listener event.
        let reply = table
            .request_name("org.example.A", ":1.1", request_flags::DO_NOT_QUEUE)
            .unwrap();
        assert_eq!(reply, RequestNameReply::Exists);
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
        assert_eq!(table.lookup("org.example.A").as_deref(), Some(":1.0"));
    }

    #[test]
    fn replacement_transfers_ownership() {
        let (table, recorder) = table_with_recorder();
        table.add_unique_name(":1.0").unwrap();
        table.add_unique_name(":1.1").unwrap();
        table
            .request_name("org.example.A", ":1.0", request_flags::ALLOW_REPLACEMENT)
            .unwrap();
        recorder.events.lock().unwrap().clear();

        let reply = table
            .request_name("org.example.A", ":1.1", request_flags::REPLACE_EXISTING)
            .unwrap();
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(table.lookup("org.example.A").as_deref(), Some(":1.1"));
        assert_eq!(
            recorder.events.lock().unwrap().as_slice(),
            &[(
                "org.example.A".into(),
                Some(":1.0".into()),
                Some(":1.1".into())
            )]
        );

        // The replaced owner queued behind the new one and comes back when
        // the new owner releases.
        table.release_name("org.example.A", ":1.1");
        assert_eq!(table.lookup("org.example.A").as_deref(), Some(":1.0"));
    }

    #[test]
    fn replaced_do_not_queue_owner_is_ejected() {
        let table = NameTable::new();
        table.add_unique_name(":1.0").unwrap();
        table.add_unique_name(":1.1").unwrap();
        table
            .request_name(
                "org.example.A",
                ":1.0",
                request_flags::ALLOW_REPLACEMENT | request_flags::DO_NOT_QUEUE,
            )
            .unwrap();
        table
            .request_name("org.example.A", ":1.1", request_flags::REPLACE_EXISTING)
            .unwrap();

        table.release_name("org.example.A", ":1.1");
        assert_eq!(table.lookup("org.example.A"), None);
    }

    #[test]
    fn request_then_release_restores_prior_owner() {
        let table = NameTable::new();
        table.add_unique_name(":1.0").unwrap();
        table.add_unique_name(":1.1").unwrap();

        // No prior owner.
        table.request_name("org.example.B", ":1.0", 0).unwrap();
        assert_eq!(table.release_name("org.example.B", ":1.0"), ReleaseNameReply::Released);
        assert_eq!(table.lookup("org.example.B"), None);

        // Prior owner restored after a queued claimant releases.
        table.request_name("org.example.B", ":1.0", 0).unwrap();
        assert_eq!(
            table.request_name("org.example.B", ":1.1", 0).unwrap(),
            RequestNameReply::InQueue
        );
        assert_eq!(table.release_name("org.example.B", ":1.1"), ReleaseNameReply::Released);
        assert_eq!(table.lookup("org.example.B").as_deref(), Some(":1.0"));
    }

    #[test]
    fn release_reply_codes() {
        let table = NameTable::new();
        table.add_unique_name(":1.0").unwrap();
        table.add_unique_name(":1.1").unwrap();
        assert_eq!(
            table.release_name("org.example.C", ":1.0"),
            ReleaseNameReply::NonExistent
        );
        table.request_name("org.example.C", ":1.0", 0).unwrap();
        assert_eq!(
            table.release_name("org.example.C", ":1.1"),
            ReleaseNameReply::NotOwner
        );
        assert_eq!(
            table.release_name("org.example.C", ":1.0"),
            ReleaseNameReply::Released
        );
    }

    #[test]
    fn removing_unique_name_promotes_queued_claimants() {
        let (table, recorder) = table_with_recorder();
        table.add_unique_name(":1.0").unwrap();
        table.add_unique_name(":1.1").unwrap();
        table.request_name("org.example.D", ":1.0", 0).unwrap();
        table.request_name("org.example.D", ":1.1", 0).unwrap();
        recorder.events.lock().unwrap().clear();

        assert!(table.remove_unique_name(":1.0"));
        let events = recorder.events.lock().unwrap();
        assert_eq!(
            events.as_slice(),
            &[
                (
                    "org.example.D".into(),
                    Some(":1.0".into()),
                    Some(":1.1".into())
                ),
                (":1.0".into(), Some(":1.0".into()), None),
            ]
        );
        drop(events);
        assert_eq!(table.lookup("org.example.D").as_deref(), Some(":1.1"));
        assert!(!table.is_registered(":1.0"));
    }

    #[test]
    fn duplicate_unique_name_is_rejected() {
        let table = NameTable::new();
        table.add_unique_name(":1.0").unwrap();
        assert!(matches!(
            table.add_unique_name(":1.0"),
            Err(BusError::AlreadyOwned(_))
        ));
        assert!(matches!(
            table.add_unique_name("org.example"),
            Err(BusError::InvalidArgs(_))
        ));
    }

    #[test]
    fn snapshot_lists_owned_aliases() {
        let table = NameTable::new();
        table.add_unique_name(":1.0").unwrap();
        table.add_unique_name(":1.1").unwrap();
        table.request_name("org.example.X", ":1.0", 0).unwrap();
        table.request_name("org.example.Y", ":1.0", 0).unwrap();
        // A queued claim does not show up in the snapshot.
        table.request_name("org.example.X", ":1.1", 0).unwrap();

        let snapshot = table.unique_names_and_aliases(|_| true);
        let (_, mut aliases) = snapshot
            .into_iter()
            .find(|(u, _)| u == ":1.0")
            .expect("registered");
        aliases.sort();
        assert_eq!(aliases, vec!["org.example.X", "org.example.Y"]);
        assert_eq!(table.aliases_of(":1.1"), Vec::<String>::new());
    }
}
