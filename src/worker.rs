//! The LogWatch worker: an isolated Tokio task owning one [`RuleTree`],
//! reachable only through its command and log channels.
//!
//! Config commands arrive on an unbounded channel. Losing a config
//! command silently would leave a client believing a rule change took
//! effect when it didn't, so the Manager can always push without
//! blocking its event loop. Logs arrive on a small bounded channel; if a
//! worker falls behind, the Manager's `try_send` simply drops the newest
//! record rather than stalling. UDP already tolerates loss, so this is
//! an acceptable place to shed load (see DESIGN.md for why this crate
//! drops newest rather than oldest).

use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};

use crate::error::{CommandError, PersistError};
use crate::predicate::Predicate;
use crate::record::{render, SyslogRecord};
use crate::rule_tree::{Address, Connector, RuleTree};
use crate::LwId;

/// How many in-flight log records a worker will buffer before the
/// Manager starts dropping new ones for that watcher.
pub const LOG_CHANNEL_CAPACITY: usize = 256;

pub type Reply = oneshot::Sender<Result<(), CommandError>>;

/// Tagged commands the Manager pushes to a worker.
pub enum WorkerCommand {
    SetMatch { addr: Address, predicate: Predicate, reply: Reply },
    CombineMatch { addr: Address, predicate: Predicate, connector: Connector, reply: Reply },
    DelMatch { addr: Address, reply: Reply },
    Save { reply: Reply },
    Load { reply: Reply },
}

/// A hit: a record the watcher's rule tree evaluated to true for.
pub struct HitEvent {
    pub watcher: LwId,
    pub line: String,
}

/// The Manager-side handle to a running worker.
pub struct WorkerHandle {
    pub commands: mpsc::UnboundedSender<WorkerCommand>,
    pub logs: mpsc::Sender<SyslogRecord>,
    pub join: tokio::task::JoinHandle<()>,
}

/// Spawns a worker with a fresh, empty rule tree and wires its channels
/// to the shared hit fan-in channel the Manager reads from.
pub fn spawn(id: LwId, state_dir: PathBuf, hits: mpsc::Sender<HitEvent>) -> WorkerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
    let join = tokio::spawn(run(id, state_dir, cmd_rx, log_rx, hits));
    WorkerHandle { commands: cmd_tx, logs: log_tx, join }
}

fn persist_path(state_dir: &Path, id: LwId) -> PathBuf {
    state_dir.join(format!("LogWatch{id}.json"))
}

async fn run(
    id: LwId,
    state_dir: PathBuf,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    mut logs: mpsc::Receiver<SyslogRecord>,
    hits: mpsc::Sender<HitEvent>,
) {
    let mut tree = RuleTree::new();
    let mut logs_closed = false;

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => handle_command(&mut tree, id, &state_dir, cmd).await,
                    None => break,
                }
            }
            record = logs.recv(), if !logs_closed => {
                match record {
                    Some(record) => handle_log(&tree, id, record, &hits).await,
                    None => logs_closed = true,
                }
            }
        }
    }
    tracing::info!(watcher = id, "worker exiting, command channel closed");
}

async fn handle_log(tree: &RuleTree, id: LwId, record: SyslogRecord, hits: &mpsc::Sender<HitEvent>) {
    match tree.evaluate(&record) {
        Ok(true) => {
            let line = render(&record);
            if hits.send(HitEvent { watcher: id, line }).await.is_err() {
                tracing::warn!(watcher = id, "hit fan-in channel closed, manager may be shutting down");
            }
        }
        Ok(false) => {}
        Err(err) => tracing::warn!(watcher = id, error = %err, "predicate evaluation failed"),
    }
}

async fn handle_command(tree: &mut RuleTree, id: LwId, state_dir: &Path, cmd: WorkerCommand) {
    let (result, reply): (Result<(), CommandError>, Reply) = match cmd {
        WorkerCommand::SetMatch { addr, predicate, reply } => {
            (tree.set_match(&addr, predicate).map_err(CommandError::from), reply)
        }
        WorkerCommand::CombineMatch { addr, predicate, connector, reply } => (
            tree.combine_match(&addr, predicate, connector).map_err(CommandError::from),
            reply,
        ),
        WorkerCommand::DelMatch { addr, reply } => (tree.del_match(&addr).map_err(CommandError::from), reply),
        WorkerCommand::Save { reply } => (save(tree, id, state_dir).await.map_err(CommandError::from), reply),
        WorkerCommand::Load { reply } => {
            let outcome = load(id, state_dir).await;
            match outcome {
                Ok(loaded) => {
                    *tree = loaded;
                    (Ok(()), reply)
                }
                Err(err) => (Err(CommandError::from(err)), reply),
            }
        }
    };
    if let Err(err) = &result {
        tracing::warn!(watcher = id, error = %err, "command failed");
    }
    let _ = reply.send(result);
}

async fn save(tree: &RuleTree, id: LwId, state_dir: &Path) -> Result<(), PersistError> {
    let json = tree.to_json()?;
    tokio::fs::write(persist_path(state_dir, id), json).await?;
    Ok(())
}

async fn load(id: LwId, state_dir: &Path) -> Result<RuleTree, PersistError> {
    let text = tokio::fs::read_to_string(persist_path(state_dir, id)).await?;
    RuleTree::from_json(&text)
}
