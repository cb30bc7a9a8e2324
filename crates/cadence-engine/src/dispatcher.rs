use std::sync::Arc;

use tracing::debug;

use cadence_core::error::Result;
use cadence_core::step::{Step, StepKind};
use cadence_core::traits::{MessageSender, SubjectMutator};
use cadence_core::types::{OutboundMessage, SubjectId};

/// Runs the side effect of a step against the outside world.
///
/// Tag, mark and menu changes are upserts. Sends are not idempotent, so the
/// caller must only dispatch a step after winning its claim.
pub struct ActionDispatcher {
    sender: Arc<dyn MessageSender>,
    mutator: Arc<dyn SubjectMutator>,
}

impl ActionDispatcher {
    pub fn new(sender: Arc<dyn MessageSender>, mutator: Arc<dyn SubjectMutator>) -> Self {
        Self { sender, mutator }
    }

    /// Perform the step's effect. Condition steps have none.
    pub async fn dispatch(&self, subject: &SubjectId, step: &Step) -> Result<()> {
        match &step.kind {
            StepKind::SendText { content } => {
                let message = OutboundMessage::Text {
                    content: content.clone(),
                };
                self.sender.send(subject, &message).await?;
            }
            StepKind::SendTemplate { template_id } => {
                let message = OutboundMessage::Template {
                    template_id: template_id.clone(),
                };
                self.sender.send(subject, &message).await?;
            }
            StepKind::TagAdd { tag_id } => self.mutator.add_tag(subject, tag_id).await?,
            StepKind::TagRemove { tag_id } => self.mutator.remove_tag(subject, tag_id).await?,
            StepKind::MarkChange { mark } => self.mutator.set_mark(subject, mark).await?,
            StepKind::MenuChange { menu_id } => self.mutator.set_menu(subject, menu_id).await?,
            StepKind::Condition { .. } => return Ok(()),
        }
        debug!(
            subject = %subject,
            step_type = step.kind.step_type().as_str(),
            channel = self.sender.name(),
            "Step action dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::rules::RuleSet;
    use cadence_test_utils::{MutatorCall, RecordingMutator, RecordingSender};

    fn dispatcher() -> (ActionDispatcher, Arc<RecordingSender>, Arc<RecordingMutator>) {
        let sender = Arc::new(RecordingSender::new());
        let mutator = Arc::new(RecordingMutator::new());
        (
            ActionDispatcher::new(sender.clone(), mutator.clone()),
            sender,
            mutator,
        )
    }

    #[tokio::test]
    async fn test_send_text() {
        let (d, sender, _) = dispatcher();
        let subject = SubjectId::from("p1");
        d.dispatch(&subject, &Step::send_text("hello")).await.unwrap();
        assert_eq!(
            sender.sent(),
            vec![(
                subject,
                OutboundMessage::Text {
                    content: "hello".into()
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_mutations() {
        let (d, sender, mutator) = dispatcher();
        let subject = SubjectId::from("p1");
        d.dispatch(&subject, &Step::tag_add("vip")).await.unwrap();
        d.dispatch(&subject, &Step::menu_change("m2")).await.unwrap();
        d.dispatch(
            &subject,
            &Step::new(StepKind::MarkChange { mark: "gold".into() }),
        )
        .await
        .unwrap();
        assert!(sender.sent().is_empty());
        assert_eq!(
            mutator.calls(),
            vec![
                MutatorCall::AddTag(subject.clone(), "vip".into()),
                MutatorCall::SetMenu(subject.clone(), "m2".into()),
                MutatorCall::SetMark(subject, "gold".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_condition_has_no_effect() {
        let (d, sender, mutator) = dispatcher();
        let subject = SubjectId::from("p1");
        d.dispatch(&subject, &Step::condition(RuleSet::default(), None, None))
            .await
            .unwrap();
        assert!(sender.sent().is_empty());
        assert!(mutator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sender_failure_propagates() {
        let sender = Arc::new(RecordingSender::failing());
        let d = ActionDispatcher::new(sender, Arc::new(RecordingMutator::new()));
        let result = d.dispatch(&SubjectId::from("p1"), &Step::send_text("x")).await;
        assert!(result.is_err());
    }
}
