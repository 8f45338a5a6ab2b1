use crate::blocker::{AccessBlocker, BackoffPolicy};
use crate::donor_doc::{DonorState, DonorStateDocument};
use crate::majority::MajorityCommittedChecker;
use crate::state::State;
use meridian_base::{err, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Process-wide tenant -> blocker mapping (spec §2 item 3). Lookups are
/// frequent and mutations rare, so a plain `RwLock` is the right fit (spec
/// §5) — this crate never holds the lock across an `.await`.
#[derive(Default)]
pub struct AccessBlockerRegistry {
    blockers: RwLock<HashMap<String, Arc<AccessBlocker>>>,
}

impl AccessBlockerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new blocker for `tenant_id`. Fails if a non-terminal
    /// blocker for that tenant is already registered — the donor-side state
    /// machine is expected to garbage-collect a terminal one first.
    pub fn register(&self, tenant_id: impl Into<String>, blocker: Arc<AccessBlocker>) -> Result<()> {
        let tenant_id = tenant_id.into();
        let mut blockers = self.blockers.write().expect("registry lock poisoned");
        if let Some(existing) = blockers.get(&tenant_id) {
            if !existing.state().is_terminal() {
                return Err(err(format!("tenant {tenant_id} already has an active migration blocker")));
            }
        }
        blockers.insert(tenant_id, blocker);
        Ok(())
    }

    /// Looks up the blocker governing `database_name`, matching by tenant-id
    /// prefix (spec §2: "database names a tenant under an active TMAB").
    pub fn get(&self, database_name: &str) -> Option<Arc<AccessBlocker>> {
        let blockers = self.blockers.read().expect("registry lock poisoned");
        blockers
            .iter()
            .find(|(tenant_id, _)| database_name.starts_with(tenant_id.as_str()))
            .map(|(_, blocker)| blocker.clone())
    }

    /// Garbage-collection entry point (spec §2 item 3). Refuses to remove a
    /// blocker that has not reached a terminal state.
    pub fn remove_if_terminal(&self, tenant_id: &str) -> Result<()> {
        let mut blockers = self.blockers.write().expect("registry lock poisoned");
        match blockers.get(tenant_id) {
            None => Ok(()),
            Some(blocker) if blocker.state().is_terminal() => {
                blockers.remove(tenant_id);
                Ok(())
            }
            Some(_) => Err(err(format!("tenant {tenant_id}'s migration blocker is not yet terminal"))),
        }
    }

    pub fn len(&self) -> usize {
        self.blockers.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reconstructs and registers a blocker from a donor state document on
    /// recovery (spec §6). Returns `Ok(None)` for a document that is
    /// well-formed but should be skipped (an already-garbage-collected
    /// aborted migration past its `expireAt`).
    pub fn recover_from_state_document(
        &self,
        doc: DonorStateDocument,
        checker: Arc<dyn MajorityCommittedChecker>,
    ) -> Result<Option<Arc<AccessBlocker>>> {
        self.recover_from_state_document_with_backoff(doc, checker, BackoffPolicy::default())
    }

    pub fn recover_from_state_document_with_backoff(
        &self,
        doc: DonorStateDocument,
        checker: Arc<dyn MajorityCommittedChecker>,
        backoff: BackoffPolicy,
    ) -> Result<Option<Arc<AccessBlocker>>> {
        doc.validate()?;
        if doc.should_skip_at_recovery() {
            return Ok(None);
        }

        let state = match doc.state {
            DonorState::DataSync => State::Allow,
            DonorState::Blocking => State::BlockWritesAndReads,
            DonorState::Committed => State::Reject,
            DonorState::Aborted => State::Aborted,
        };

        let blocker = AccessBlocker::from_recovered_state(
            doc.tenant_id.clone(),
            doc.recipient_connection_string,
            checker,
            state,
            doc.block_timestamp,
            doc.commit_or_abort_op_time,
            backoff,
        );
        self.register(doc.tenant_id, blocker.clone())?;
        Ok(Some(blocker))
    }
}
