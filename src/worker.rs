//! Background worker performing mutations of download sources.
//!
//! Commands are sent with [`WorkerHandle::send`], which returns immediately.
//! The outcome of every command is published through [`CompletionNotifier`] with the
//! [`Ticket`] the command was sent with, after the mutation was attempted.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::database::{api, Pool};
use crate::errors::DatabaseError;
use crate::notifier::{Completion, CompletionNotifier, Ticket, Topic};
use crate::SourceId;

/// Mutation command executed by [`SourcesWorker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Remove download source and its downloads.
    DeleteDownloadSource { id: SourceId },
}

impl WorkerCommand {
    /// Topic the completion of this command is published on.
    pub fn topic(&self) -> Topic {
        match *self {
            Self::DeleteDownloadSource { id } => Topic::delete_download_source(id),
        }
    }
}

/// Command together with the subscription waiting for its completion.
type Envelope = (WorkerCommand, Ticket);

/// Sending side of the worker.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<Envelope>,
    notifier: CompletionNotifier,
}

impl WorkerHandle {
    /// Dispatch `command` to the worker without waiting for it.
    ///
    /// Completion is published with `ticket`, obtained by subscribing to [`WorkerCommand::topic`].
    /// If the worker is not running anymore, `Failed` completion is published immediately.
    pub fn send(&self, command: WorkerCommand, ticket: Ticket) {
        debug!("dispatching {:?}", command);
        if let Err(err) = self.sender.send((command, ticket)) {
            error!("worker is not running, dropping {:?}", err.0 .0);
            self.notifier.publish(
                ticket,
                Completion::Failed("worker is not running".to_string()),
            );
        }
    }

    /// Notifier the worker publishes completions to.
    pub fn notifier(&self) -> &CompletionNotifier {
        &self.notifier
    }

    /// Handle without a worker behind it. Commands just pile up in the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(notifier: CompletionNotifier) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender, notifier }, receiver)
    }
}

/// Worker executing [`WorkerCommand`]s one by one on its own task.
pub struct SourcesWorker {
    pool: Pool,
    notifier: CompletionNotifier,
    receiver: mpsc::UnboundedReceiver<Envelope>,
}

impl SourcesWorker {
    /// Spawn worker on the current tokio runtime.
    ///
    /// Worker runs until every [`WorkerHandle`] is dropped.
    pub fn spawn(pool: Pool, notifier: CompletionNotifier) -> (WorkerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = Self {
            pool,
            notifier: notifier.clone(),
            receiver,
        };
        let task = tokio::spawn(worker.run());
        (WorkerHandle { sender, notifier }, task)
    }

    async fn run(mut self) {
        info!("sources worker started");
        while let Some((command, ticket)) = self.receiver.recv().await {
            self.handle(command, ticket).await;
        }
        info!("sources worker stopped");
    }

    async fn handle(&self, command: WorkerCommand, ticket: Ticket) {
        let completion = match self.execute(command).await {
            Ok(()) => Completion::Done,
            Err(err) => {
                error!("'{}' failed: {}", command.topic(), err);
                Completion::Failed(err.to_string())
            }
        };
        self.notifier.publish(ticket, completion);
    }

    async fn execute(&self, command: WorkerCommand) -> Result<(), DatabaseError> {
        match command {
            WorkerCommand::DeleteDownloadSource { id } => {
                let mut connection = self.pool.get().await?;
                if api::delete_source(connection.as_mut(), id).await? {
                    info!("download source {} removed", id);
                } else {
                    debug!("download source {} does not exist", id);
                }
                Ok(())
            }
        }
    }
}
