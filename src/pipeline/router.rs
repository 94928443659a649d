use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::stages::{StageHandlers, StageOutcome};
use crate::domain::PostEvent;
use crate::eventbus::{Envelope, EventHandler, HandlerError, Shutdown};

/// Routes each post event to the stage that consumes it.
///
/// The event set is closed, so routing is a match rather than a registry.
pub struct PostEventRouter {
    stages: Arc<StageHandlers>,
}

impl PostEventRouter {
    pub fn new(stages: Arc<StageHandlers>) -> Self {
        Self { stages }
    }
}

#[async_trait]
impl EventHandler<PostEvent> for PostEventRouter {
    async fn handle(
        &self,
        event: PostEvent,
        envelope: &Envelope,
        shutdown: &Shutdown,
    ) -> Result<(), HandlerError> {
        let outcome = match &event {
            PostEvent::Created(e) => self.stages.handle_created(e, shutdown).await?,
            PostEvent::HtmlRendered(e) => self.stages.handle_rendered(e, shutdown).await?,
            PostEvent::TextParsed(e) => self.stages.handle_parsed(e, shutdown).await?,
            PostEvent::Summarized(e) => {
                info!(post_id = %e.post_id, "Pipeline complete");
                return Ok(());
            }
            PostEvent::Unknown => {
                debug!(event_id = %envelope.id, "Unhandled event type, acknowledging");
                return Ok(());
            }
        };

        if outcome != StageOutcome::Completed {
            debug!(event = event.type_name(), ?outcome, "No stage work done");
        }
        Ok(())
    }
}
