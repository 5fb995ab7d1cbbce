//! Per-learner session task.
//!
//! Each owner gets one task that owns its `Pipeline`. Handlers talk to it via
//! a bounded mpsc channel and get answers back on oneshot channels, so the
//! pipeline state needs no locking and backend calls never overlap.
//!
//! Ordering rules:
//!   - submits are admitted into the pipeline queue in arrival order, even
//!     while a request is in flight (so a retry exhaustion discards them too)
//!   - any other command waits until the queue has drained
//!   - the caller of a submit is answered before the conversation is saved
//!   - after `session_idle` without commands the task exits; the registry in
//!     `state.rs` then replaces it on next use

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::domain::{Conversation, ImageRef, Message};
use crate::error::PipelineError;
use crate::pipeline::{Notice, Pipeline, Processed};

type Reply<T> = oneshot::Sender<Result<T, PipelineError>>;

/// Answer to a chat submit.
#[derive(Clone, Debug)]
pub struct ChatReply {
  pub message: Message,
  /// `None` until the conversation has been saved once.
  pub conversation_id: Option<String>,
  pub title: Option<String>,
  pub notices: Vec<Notice>,
}

#[derive(Clone, Debug)]
pub struct SessionSnapshot {
  pub conversation_id: Option<String>,
  pub title: Option<String>,
  pub messages: Vec<Message>,
  pub updated_at: Option<DateTime<Utc>>,
  pub pending: usize,
  pub notices: Vec<Notice>,
}

enum Command {
  Submit { prompt: String, image: Option<ImageRef>, reply: Reply<ChatReply> },
  Snapshot { reply: Reply<SessionSnapshot> },
  List { reply: Reply<Vec<Conversation>> },
  Get { id: String, reply: Reply<Conversation> },
  Open { id: String, reply: Reply<SessionSnapshot> },
  New { reply: Reply<SessionSnapshot> },
  Delete { id: String, reply: Reply<()> },
  Rename { id: String, title: Option<String>, reply: Reply<Conversation> },
}

#[derive(Clone)]
pub struct SessionHandle {
  tx: mpsc::Sender<Command>,
  limit: usize,
}

impl SessionHandle {
  /// Spawn the task owning `pipeline`. `capacity` bounds commands waiting in the channel.
  pub fn spawn(pipeline: Pipeline, capacity: usize) -> Self {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let span = info_span!(target: "pipeline", "session", owner_id = %pipeline.owner_id());
    tokio::spawn(run(pipeline, rx).instrument(span));
    Self { tx, limit: capacity }
  }

  /// Queue a prompt and wait for its reply. Fails fast with `QueueFull` when
  /// the session is saturated.
  pub async fn submit(&self, prompt: String, image: Option<ImageRef>) -> Result<ChatReply, PipelineError> {
    let (reply, rx) = oneshot::channel();
    self.tx.try_send(Command::Submit { prompt, image, reply }).map_err(|e| match e {
      mpsc::error::TrySendError::Full(_) => PipelineError::QueueFull { limit: self.limit },
      mpsc::error::TrySendError::Closed(_) => PipelineError::SessionClosed,
    })?;
    rx.await.map_err(|_| PipelineError::SessionClosed)?
  }

  /// The task has shut down (idle or dropped); the handle is useless.
  pub fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  pub async fn snapshot(&self) -> Result<SessionSnapshot, PipelineError> {
    self.call(|reply| Command::Snapshot { reply }).await
  }

  pub async fn list(&self) -> Result<Vec<Conversation>, PipelineError> {
    self.call(|reply| Command::List { reply }).await
  }

  pub async fn get(&self, id: String) -> Result<Conversation, PipelineError> {
    self.call(|reply| Command::Get { id, reply }).await
  }

  pub async fn open(&self, id: String) -> Result<SessionSnapshot, PipelineError> {
    self.call(|reply| Command::Open { id, reply }).await
  }

  pub async fn new_conversation(&self) -> Result<SessionSnapshot, PipelineError> {
    self.call(|reply| Command::New { reply }).await
  }

  pub async fn delete(&self, id: String) -> Result<(), PipelineError> {
    self.call(|reply| Command::Delete { id, reply }).await
  }

  pub async fn rename(&self, id: String, title: Option<String>) -> Result<Conversation, PipelineError> {
    self.call(|reply| Command::Rename { id, title, reply }).await
  }

  async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, PipelineError> {
    let (reply, rx) = oneshot::channel();
    self.tx.send(make(reply)).await.map_err(|_| PipelineError::SessionClosed)?;
    rx.await.map_err(|_| PipelineError::SessionClosed)?
  }
}

async fn run(mut pipeline: Pipeline, mut rx: mpsc::Receiver<Command>) {
  let mut waiting: HashMap<u64, Reply<ChatReply>> = HashMap::new();
  // First non-submit command seen while the queue was busy.
  let mut deferred: Option<Command> = None;
  let mut open = true;
  let idle = pipeline.settings().session_idle();
  debug!(target: "pipeline", "Session started");

  loop {
    if let Some((ticket, request)) = pipeline.take_next() {
      let completion = pipeline.completion().run(request);
      tokio::pin!(completion);
      let (request, outcome) = loop {
        tokio::select! {
          out = &mut completion => break out,
          cmd = rx.recv(), if open && deferred.is_none() => match cmd {
            Some(Command::Submit { prompt, image, reply }) => admit(&mut pipeline, &mut waiting, &prompt, image, reply),
            Some(other) => deferred = Some(other),
            None => open = false,
          },
        }
      };
      let processed = pipeline.finish(ticket, request, outcome);
      let succeeded = processed.result.is_ok();
      deliver(&mut pipeline, &mut waiting, processed);
      if succeeded {
        pipeline.persist().await;
      }
      continue;
    }

    if let Some(cmd) = deferred.take() {
      handle(&mut pipeline, &mut waiting, cmd).await;
      continue;
    }
    if !open {
      break;
    }
    match tokio::time::timeout(idle, rx.recv()).await {
      Ok(Some(cmd)) => handle(&mut pipeline, &mut waiting, cmd).await,
      Ok(None) => break,
      Err(_) => {
        // Refuse new commands; anything already buffered is still served before exit.
        info!(target: "pipeline", ?idle, "Session idle; closing");
        rx.close();
      }
    }
  }
  debug!(target: "pipeline", "Session closed");
}

fn admit(
  pipeline: &mut Pipeline,
  waiting: &mut HashMap<u64, Reply<ChatReply>>,
  prompt: &str,
  image: Option<ImageRef>,
  reply: Reply<ChatReply>,
) {
  match pipeline.enqueue(prompt, image) {
    Ok(ticket) => {
      waiting.insert(ticket, reply);
    }
    Err(e) => {
      debug!(target: "pipeline", error = %e, "Submit rejected");
      let _ = reply.send(Err(e));
    }
  }
}

fn deliver(pipeline: &mut Pipeline, waiting: &mut HashMap<u64, Reply<ChatReply>>, processed: Processed) {
  let Processed { ticket, result, discarded } = processed;
  for t in discarded {
    if let Some(reply) = waiting.remove(&t) {
      let _ = reply.send(Err(PipelineError::Discarded));
    }
  }
  let Some(reply) = waiting.remove(&ticket) else {
    warn!(target: "pipeline", ticket, "No caller waiting for processed request");
    return;
  };
  // Notices stay queued for the next snapshot when there is no reply body to carry them.
  let result = result.map(|exchange| {
    let notices = pipeline.take_notices();
    let active = pipeline.active();
    ChatReply {
      message: exchange.assistant,
      conversation_id: active.id.clone(),
      title: active.title.clone(),
      notices,
    }
  });
  if reply.send(result).is_err() {
    info!(target: "pipeline", ticket, "Caller went away before the reply was ready");
  }
}

fn snapshot(pipeline: &mut Pipeline) -> SessionSnapshot {
  let notices = pipeline.take_notices();
  let active = pipeline.active();
  SessionSnapshot {
    conversation_id: active.id.clone(),
    title: active.title.clone(),
    messages: active.messages.clone(),
    updated_at: active.updated_at,
    pending: pipeline.pending(),
    notices,
  }
}

async fn handle(pipeline: &mut Pipeline, waiting: &mut HashMap<u64, Reply<ChatReply>>, cmd: Command) {
  match cmd {
    Command::Submit { prompt, image, reply } => admit(pipeline, waiting, &prompt, image, reply),
    Command::Snapshot { reply } => {
      let _ = reply.send(Ok(snapshot(pipeline)));
    }
    Command::List { reply } => {
      let _ = reply.send(pipeline.list_conversations().await);
    }
    Command::Get { id, reply } => {
      let _ = reply.send(pipeline.get_conversation(&id).await);
    }
    Command::Open { id, reply } => {
      let res = match pipeline.open_conversation(&id).await {
        Ok(_) => Ok(snapshot(pipeline)),
        Err(e) => Err(e),
      };
      let _ = reply.send(res);
    }
    Command::New { reply } => {
      pipeline.new_conversation();
      let _ = reply.send(Ok(snapshot(pipeline)));
    }
    Command::Delete { id, reply } => {
      let _ = reply.send(pipeline.delete_conversation(&id).await);
    }
    Command::Rename { id, title, reply } => {
      let _ = reply.send(pipeline.rename_conversation(&id, title).await);
    }
  }
}
