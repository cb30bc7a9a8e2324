use std::sync::Mutex;

use futures::future::BoxFuture;

use cadence_core::error::{CadenceError, Result};
use cadence_core::traits::SubjectMutator;
use cadence_core::types::SubjectId;

/// One recorded subject update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutatorCall {
    AddTag(SubjectId, String),
    RemoveTag(SubjectId, String),
    SetMark(SubjectId, String),
    SetMenu(SubjectId, String),
}

/// Subject mutator that records every call.
pub struct RecordingMutator {
    calls: Mutex<Vec<MutatorCall>>,
    fail: bool,
}

impl RecordingMutator {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<MutatorCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: MutatorCall) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.fail {
                return Err(CadenceError::SubjectUpdate("simulated failure".into()));
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        })
    }
}

impl Default for RecordingMutator {
    fn default() -> Self {
        Self::new()
    }
}

impl SubjectMutator for RecordingMutator {
    fn add_tag(&self, subject: &SubjectId, tag_id: &str) -> BoxFuture<'_, Result<()>> {
        self.record(MutatorCall::AddTag(subject.clone(), tag_id.to_string()))
    }

    fn remove_tag(&self, subject: &SubjectId, tag_id: &str) -> BoxFuture<'_, Result<()>> {
        self.record(MutatorCall::RemoveTag(subject.clone(), tag_id.to_string()))
    }

    fn set_mark(&self, subject: &SubjectId, mark: &str) -> BoxFuture<'_, Result<()>> {
        self.record(MutatorCall::SetMark(subject.clone(), mark.to_string()))
    }

    fn set_menu(&self, subject: &SubjectId, menu_id: &str) -> BoxFuture<'_, Result<()>> {
        self.record(MutatorCall::SetMenu(subject.clone(), menu_id.to_string()))
    }
}
