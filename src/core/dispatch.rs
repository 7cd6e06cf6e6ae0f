//! Queue dispatch loop for ChatRelay.
//!
//! A single poller drains `incoming/`, hands each record to a per-agent
//! worker task, and the worker runs the full pipeline: claim, route, update
//! the conversation window, invoke the provider, and emit an outgoing or
//! failed record. One worker per agent keeps same-agent messages strictly in
//! receipt order while different agents process in parallel.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::agent::{execute_with_contract, ExecutionContract};
use crate::config::Settings;
use crate::core::directives::extract_send_files;
use crate::core::history::{ConversationStore, Turn};
use crate::core::queue::{now_millis, FailureRecord, Queue, QueueRecord, ResponseRecord};
use crate::core::routing::resolve_agent;
use crate::error::Error;
use crate::providers::{InvokeRequest, Invoker};
use crate::workspace::{ensure_agent_workspace, update_teammates};

/// Attempts for queue record moves before escalating to failed.
const QUEUE_IO_RETRIES: u32 = 3;

/// Outcome of one processed item, for logging and tests.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

pub struct Dispatcher {
    queue: Arc<Queue>,
    store: Arc<ConversationStore>,
    settings: Arc<Settings>,
    files_root: PathBuf,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<Queue>,
        store: Arc<ConversationStore>,
        settings: Arc<Settings>,
        files_root: PathBuf,
    ) -> Self {
        Self {
            queue,
            store,
            settings,
            files_root,
        }
    }

    /// Run the dispatch loop until ctrl-c.
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        self.queue.ensure_dirs()?;

        let recovered = self.queue.recover_orphaned()?;
        if recovered > 0 {
            tracing::info!("Requeued {} message(s) stranded in processing", recovered);
        }

        tracing::info!("Dispatch loop watching {}", self.queue.root().display());

        let agent_senders: Arc<Mutex<HashMap<String, mpsc::Sender<QueueRecord>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let queued_ids: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
            self.settings.poll_interval_secs(),
        ));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let records = match self.queue.list_incoming() {
                        Ok(records) => records,
                        Err(e) => {
                            tracing::error!("Failed to list incoming queue: {}", e);
                            continue;
                        }
                    };

                    for record in records {
                        {
                            let mut queued = queued_ids.lock().await;
                            if queued.contains(&record.id) {
                                continue;
                            }
                            queued.insert(record.id.clone());
                        }

                        let (agent_id, _) = match resolve_agent(&record, &self.settings) {
                            Ok(routed) => routed,
                            Err(e) => {
                                tracing::error!("Cannot route record {}: {}", record.id, e);
                                queued_ids.lock().await.remove(&record.id);
                                continue;
                            }
                        };

                        let sender =
                            Self::worker_for(&self, &agent_id, &agent_senders, &queued_ids).await;

                        let id = record.id.clone();
                        if sender.send(record).await.is_err() {
                            tracing::error!("Worker for agent {} is gone", agent_id);
                            queued_ids.lock().await.remove(&id);
                            agent_senders.lock().await.remove(&agent_id);
                        }
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutting down dispatch loop...");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Get or spawn the serial worker task for an agent.
    async fn worker_for(
        dispatcher: &Arc<Self>,
        agent_id: &str,
        agent_senders: &Arc<Mutex<HashMap<String, mpsc::Sender<QueueRecord>>>>,
        queued_ids: &Arc<Mutex<HashSet<String>>>,
    ) -> mpsc::Sender<QueueRecord> {
        let mut senders = agent_senders.lock().await;
        if let Some(tx) = senders.get(agent_id) {
            return tx.clone();
        }

        let (tx, mut rx) = mpsc::channel::<QueueRecord>(100);
        let dispatcher = Arc::clone(dispatcher);
        let queued = Arc::clone(queued_ids);
        let worker_agent = agent_id.to_string();

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let id = record.id.clone();
                dispatcher.process(record).await;
                queued.lock().await.remove(&id);
            }
            tracing::debug!("Worker for agent {} stopped", worker_agent);
        });

        senders.insert(agent_id.to_string(), tx.clone());
        tx
    }

    /// Claim one record and run it through the pipeline. Every path leaves a
    /// trace: the record ends in outgoing or failed, never vanishes.
    pub async fn process(&self, record: QueueRecord) -> Outcome {
        let claimed = match self.claim_with_retries(&record.id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                // Lost the race or the producer withdrew it; the record is
                // no longer ours. If it is still in incoming, the next poll
                // picks it up again.
                tracing::debug!("Could not claim {}: {}", record.id, e);
                return Outcome::Failed;
            }
        };

        let preview: String = claimed.data.body.chars().take(50).collect();
        tracing::info!(
            "Processing [{}] from {}: {}...",
            claimed.data.channel,
            claimed.data.sender,
            preview
        );

        match self.handle(&claimed).await {
            Ok((agent_id, response, files)) => {
                let outgoing = ResponseRecord {
                    id: claimed.id.clone(),
                    agent_id,
                    data: claimed.data.clone(),
                    response,
                    files,
                    completed_at: now_millis(),
                };

                match with_io_retries(|| self.queue.complete(&outgoing)) {
                    Ok(()) => Outcome::Completed,
                    Err(e) => {
                        tracing::error!("Failed to write outgoing record {}: {}", claimed.id, e);
                        self.escalate_failure(&claimed, &format!("queue error: {}", e));
                        Outcome::Failed
                    }
                }
            }
            Err(e) => {
                tracing::error!("Agent invocation failed for {}: {}", claimed.id, e);
                self.escalate_failure(&claimed, &e.to_string());
                Outcome::Failed
            }
        }
    }

    /// Claim with a small retry budget; workers for different agents contend
    /// briefly on the claim lock.
    async fn claim_with_retries(&self, id: &str) -> Result<QueueRecord, Error> {
        let mut last = None;
        for attempt in 1..=QUEUE_IO_RETRIES {
            match self.queue.claim(id) {
                Ok(claimed) => return Ok(claimed),
                Err(e) => {
                    tracing::debug!("Claim attempt {}/{} for {} failed: {}", attempt, QUEUE_IO_RETRIES, id, e);
                    last = Some(e);
                }
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }
        Err(last.unwrap_or_else(|| Error::Queue(format!("could not claim {}", id))))
    }

    /// Route, update history, invoke the provider, and post-process the
    /// reply. Returns (agent_id, response, files).
    async fn handle(&self, record: &QueueRecord) -> Result<(String, String, Vec<String>), Error> {
        let (agent_id, body) = resolve_agent(record, &self.settings)?;

        let agent = self
            .settings
            .agents
            .get(&agent_id)
            .ok_or_else(|| Error::Config(format!("Agent '{}' not configured", agent_id)))?;

        let provider = agent.provider.as_deref().unwrap_or("openrouter");
        tracing::info!(
            "Routing {} to agent {} [{}/{}]",
            record.id,
            agent_id,
            provider,
            agent.model.as_deref().unwrap_or("default")
        );

        // A reset opens a fresh window containing exactly this message.
        if record.data.reset {
            self.store.reset(&agent_id);
        }
        self.store.append(&agent_id, Turn::user(body.clone()));

        let agent_dir = self.settings.agent_dir(&agent_id)?;
        ensure_agent_workspace(&agent_dir, &agent_id)?;
        update_teammates(&agent_dir, &agent_id, &self.settings.agents, &self.settings.teams)?;

        let invoker = Invoker::for_agent(agent, &self.settings)?;
        let history = self.store.snapshot(&agent_id);
        let contract = ExecutionContract::for_provider(provider);

        let request = InvokeRequest {
            agent_id: &agent_id,
            model: agent.model.as_deref(),
            message: &body,
            history: &history,
            working_dir: Some(&agent_dir),
            reset: record.data.reset,
        };

        let reply = execute_with_contract(&invoker, &request, &contract).await?;

        let (response, files) = extract_send_files(&reply, &self.files_root);
        let files: Vec<String> = files
            .into_iter()
            .map(|p| p.display().to_string())
            .collect();

        self.store.append(&agent_id, Turn::assistant(response.clone()));

        Ok((agent_id, response, files))
    }

    fn escalate_failure(&self, record: &QueueRecord, error: &str) {
        let failure = FailureRecord {
            id: record.id.clone(),
            agent_id: record.agent.clone(),
            data: record.data.clone(),
            error: error.to_string(),
            failed_at: now_millis(),
        };

        if let Err(e) = with_io_retries(|| self.queue.fail(&failure)) {
            // Last resort: the processing marker stays for startup recovery.
            tracing::error!(
                "Could not record failure for {} ({}); leaving in processing",
                record.id,
                e
            );
        }
    }
}

/// Retry a queue move a bounded number of times before giving up.
fn with_io_retries<F>(mut op: F) -> Result<(), Error>
where
    F: FnMut() -> Result<(), Error>,
{
    let mut last = None;
    for attempt in 1..=QUEUE_IO_RETRIES {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!("Queue move attempt {}/{} failed: {}", attempt, QUEUE_IO_RETRIES, e);
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| Error::Queue("queue move failed".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ProviderModel};
    use crate::core::history::Role;
    use crate::core::queue::{MessageData, QueueState};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Stub CLI that echoes a result whose text includes the prompt, so
    /// ordering is observable end to end.
    const ECHO_CLI: &str = "#!/bin/sh\nfor last; do :; done\nprintf '{\"type\":\"result\",\"result\":\"reply to %s\"}\\n' \"$last\"\n";

    struct Fixture {
        _tmp: TempDir,
        dispatcher: Arc<Dispatcher>,
        queue: Arc<Queue>,
        store: Arc<ConversationStore>,
    }

    fn fixture(cli_script: &str) -> Fixture {
        let tmp = TempDir::new().unwrap();

        let cli = tmp.path().join("stub-cli");
        std::fs::write(&cli, cli_script).unwrap();
        std::fs::set_permissions(&cli, std::fs::Permissions::from_mode(0o755)).unwrap();

        let files_root = tmp.path().join("files");
        std::fs::create_dir_all(&files_root).unwrap();

        let mut settings = Settings::default();
        settings.workspace.path = Some(tmp.path().join("workspace"));
        settings.models.claude = ProviderModel {
            cli_path: Some(cli.display().to_string()),
            ..Default::default()
        };
        settings.agents.insert(
            "default".to_string(),
            AgentConfig {
                name: Some("Default".to_string()),
                provider: Some("claude".to_string()),
                model: None,
                working_directory: None,
            },
        );

        let queue = Arc::new(Queue::new(tmp.path().join("queue")));
        queue.ensure_dirs().unwrap();
        let store = Arc::new(ConversationStore::new());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&store),
            Arc::new(settings),
            files_root,
        ));

        Fixture {
            _tmp: tmp,
            dispatcher,
            queue,
            store,
        }
    }

    fn enqueue(queue: &Queue, body: &str) -> String {
        queue
            .enqueue(QueueRecord::new(MessageData::new("cli", "Alice", "u1", body)))
            .unwrap()
    }

    #[tokio::test]
    async fn same_agent_messages_process_in_receipt_order() {
        let fx = fixture(ECHO_CLI);

        enqueue(&fx.queue, "first question");
        // ULIDs are only ordered across milliseconds.
        std::thread::sleep(std::time::Duration::from_millis(5));
        enqueue(&fx.queue, "second question");

        // The worker drains its channel serially; processing the polled
        // order is exactly what the per-agent worker does.
        for record in fx.queue.list_incoming().unwrap() {
            assert_eq!(fx.dispatcher.process(record).await, Outcome::Completed);
        }

        let turns = fx.store.snapshot("default");
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].content, "first question");
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[2].content, "second question");
        assert_eq!(turns[3].role, Role::Assistant);

        let outgoing = fx.queue.list_outgoing().unwrap();
        assert_eq!(outgoing.len(), 2);
        assert_eq!(outgoing[0].response, "reply to first question");
        assert_eq!(outgoing[1].response, "reply to second question");
    }

    #[tokio::test]
    async fn reset_flag_opens_a_fresh_window() {
        let fx = fixture(ECHO_CLI);

        enqueue(&fx.queue, "old context");
        for record in fx.queue.list_incoming().unwrap() {
            fx.dispatcher.process(record).await;
        }
        assert_eq!(fx.store.len("default"), 2);

        let reset_record = QueueRecord::new(
            MessageData::new("cli", "Alice", "u1", "start over").with_reset(true),
        );
        fx.queue.enqueue(reset_record.clone()).unwrap();
        fx.dispatcher.process(reset_record).await;

        let turns = fx.store.snapshot("default");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "start over");
    }

    #[tokio::test]
    async fn provider_failure_lands_in_failed_with_detail() {
        let fx = fixture("#!/bin/sh\necho 'model backend unreachable' >&2\nexit 2\n");

        let id = enqueue(&fx.queue, "doomed");
        for record in fx.queue.list_incoming().unwrap() {
            assert_eq!(fx.dispatcher.process(record).await, Outcome::Failed);
        }

        assert_eq!(fx.queue.state_of(&id), Some(QueueState::Failed));
        let failed = fx.queue.list_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.contains("model backend unreachable"));

        // The failed reply never reached the conversation window.
        assert_eq!(fx.store.len("default"), 1);
    }

    #[tokio::test]
    async fn item_is_always_in_exactly_one_state() {
        let fx = fixture(ECHO_CLI);

        let id = enqueue(&fx.queue, "track me");
        assert_eq!(fx.queue.state_of(&id), Some(QueueState::Incoming));

        for record in fx.queue.list_incoming().unwrap() {
            fx.dispatcher.process(record).await;
        }

        assert_eq!(fx.queue.state_of(&id), Some(QueueState::Outgoing));
        let stats = fx.queue.stats().unwrap();
        assert_eq!(stats.total(), 1);
    }

    #[tokio::test]
    async fn send_file_directives_are_sandboxed_and_stripped() {
        let fx = fixture(
            "#!/bin/sh\nprintf '{\"type\":\"result\",\"result\":\"Report attached. [send_file: report.txt] [send_file: ../escape.txt]\"}\\n'\n",
        );

        // Place one legitimate file inside the sandbox.
        let files_root = fx.dispatcher.files_root.clone();
        std::fs::write(files_root.join("report.txt"), "data").unwrap();

        enqueue(&fx.queue, "send me the report");
        for record in fx.queue.list_incoming().unwrap() {
            assert_eq!(fx.dispatcher.process(record).await, Outcome::Completed);
        }

        let outgoing = fx.queue.list_outgoing().unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].response, "Report attached.");
        assert_eq!(outgoing[0].files.len(), 1);
        assert!(outgoing[0].files[0].ends_with("report.txt"));
    }

    #[tokio::test]
    async fn workspace_artifacts_appear_before_invocation() {
        let fx = fixture(ECHO_CLI);

        enqueue(&fx.queue, "hello");
        for record in fx.queue.list_incoming().unwrap() {
            fx.dispatcher.process(record).await;
        }

        let agent_dir = fx.dispatcher.settings.agent_dir("default").unwrap();
        assert!(agent_dir.join("AGENT.md").exists());
        assert!(agent_dir.join("TEAMMATES.md").exists());
    }
}
