use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::services::workflow::{run_story_loop, StoryRequest, WorkflowContext};

/// Starts storytelling sessions in the background. Each session owns its
/// talking flag, so sessions never observe each other.
pub struct StoryTeller {
    ctx: Arc<WorkflowContext>,
    next_id: AtomicU64,
}

pub struct SessionHandle {
    id: u64,
    talking: Arc<AtomicBool>,
    task: JoinHandle<Result<()>>,
    finished: bool,
}

impl StoryTeller {
    pub fn new(ctx: Arc<WorkflowContext>) -> Self {
        Self {
            ctx,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn tell(&self, request: StoryRequest) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let talking = Arc::new(AtomicBool::new(false));
        let ctx = self.ctx.clone();
        let flag = talking.clone();

        log::info!("Starting story session {}", id);
        let task = tokio::spawn(async move {
            let result = run_story_loop(ctx, request, flag).await;
            match &result {
                Ok(()) => log::info!("Story session {} finished", id),
                Err(e) => log::error!("Story session {} failed: {:#}", id, e),
            }
            result
        });

        SessionHandle {
            id,
            talking,
            task,
            finished: false,
        }
    }
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_talking(&self) -> bool {
        self.talking.load(Ordering::SeqCst)
    }

    /// Stops the session. Audio that is already playing runs to its end.
    pub fn cancel(&self) {
        log::info!("Cancelling story session {}", self.id);
        self.talking.store(false, Ordering::SeqCst);
        self.task.abort();
    }

    /// Waits for the session to end. Dropping the future before it completes
    /// leaves the session running and waitable.
    pub async fn wait(&mut self) -> Result<()> {
        if self.finished {
            return Err(anyhow!("Story session {} has already been waited on", self.id));
        }
        let outcome = (&mut self.task).await;
        self.finished = true;
        match outcome {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(anyhow!("Story session {} was cancelled", self.id)),
            Err(e) => Err(anyhow!("Story session {} panicked: {}", self.id, e)),
        }
    }
}
