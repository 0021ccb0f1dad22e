//! Compaction of UI-element and widget-model update bursts.
//!
//! Dragging a slider produces dozens of updates per second. Every update is
//! placed on both the control queue and the batching queue. When the kernel
//! picks one off the control queue it drains the batching queue and merges
//! everything into as few commands as possible; the mirrored copies still
//! waiting on the control queue are then skipped.
//!
//! Merge rules:
//!
//! - UI-element updates: each token is consumed once; a repeated token is
//!   dropped. Values merge last-write-wins per element id and the merged
//!   command keeps the most recent token.
//! - Widget-model `update` messages: merged per model id, last-write-wins
//!   per state key. A buffer whose root path key is overwritten by a later
//!   update is evicted.
//! - Widget-model `custom` messages pass through one by one.
//! - Merging happens only within a contiguous run of the same kind, so the
//!   relative order of UI and model effects is preserved.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;
use log::debug;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::commands::{
    Command, ModelMethod, ModelUpdateMessage, UpdateUiElement, UpdateWidgetModel,
};

/// Tokens remembered across batches.
const MAX_REMEMBERED_TOKENS: usize = 4096;

/// A queue that can be drained without blocking.
pub trait DrainQueue {
    fn try_pop(&mut self) -> Option<Command>;
}

impl DrainQueue for mpsc::UnboundedReceiver<Command> {
    fn try_pop(&mut self) -> Option<Command> {
        self.try_recv().ok()
    }
}

impl DrainQueue for VecDeque<Command> {
    fn try_pop(&mut self) -> Option<Command> {
        self.pop_front()
    }
}

#[derive(Default)]
struct UiRun {
    order: Vec<String>,
    values: HashMap<String, Value>,
    token: String,
}

impl UiRun {
    fn push(&mut self, update: UpdateUiElement) {
        for (id, value) in update.iter() {
            if self.values.insert(id.clone(), value.clone()).is_none() {
                self.order.push(id.clone());
            }
        }
        self.token = update.token().to_string();
    }

    fn finish(mut self) -> Command {
        let pairs = self
            .order
            .into_iter()
            .filter_map(|id| self.values.remove(&id).map(|value| (id, value)))
            .collect();
        Command::UpdateUiElement(UpdateUiElement::from_pairs(pairs, self.token))
    }
}

enum ModelSlot {
    Update {
        model_id: String,
        state: Map<String, Value>,
        buffers: Vec<(Vec<Value>, Bytes)>,
    },
    Custom(UpdateWidgetModel),
}

#[derive(Default)]
struct ModelRun {
    slots: Vec<ModelSlot>,
    update_index: HashMap<String, usize>,
}

impl ModelRun {
    fn push(&mut self, update: UpdateWidgetModel) {
        if update.message.method == ModelMethod::Custom {
            self.slots.push(ModelSlot::Custom(update));
            return;
        }

        let UpdateWidgetModel {
            model_id,
            message,
            buffers: new_buffers,
        } = update;

        let index = match self.update_index.get(&model_id) {
            Some(&index) => index,
            None => {
                self.slots.push(ModelSlot::Update {
                    model_id: model_id.clone(),
                    state: Map::new(),
                    buffers: Vec::new(),
                });
                self.update_index.insert(model_id, self.slots.len() - 1);
                self.slots.len() - 1
            }
        };

        if let ModelSlot::Update { state, buffers, .. } = &mut self.slots[index] {
            for (key, value) in message.state {
                buffers.retain(|(path, _)| path.first().and_then(Value::as_str) != Some(key.as_str()));
                state.insert(key, value);
            }
            buffers.extend(message.buffer_paths.into_iter().zip(new_buffers));
        }
    }

    fn finish(self, out: &mut Vec<Command>) {
        for slot in self.slots {
            let command = match slot {
                ModelSlot::Update {
                    model_id,
                    state,
                    buffers,
                } => {
                    let (buffer_paths, buffers) = buffers.into_iter().unzip();
                    UpdateWidgetModel {
                        model_id,
                        message: ModelUpdateMessage {
                            method: ModelMethod::Update,
                            state,
                            buffer_paths,
                            content: None,
                        },
                        buffers,
                    }
                }
                ModelSlot::Custom(update) => update,
            };
            out.push(Command::UpdateWidgetModel(command));
        }
    }
}

/// Merges bursts of UI updates. One batcher lives in each kernel loop.
#[derive(Default)]
pub struct UpdateBatcher {
    processed_tokens: HashSet<String>,
    token_order: VecDeque<String>,
    /// Mirrored copies absorbed into earlier batches that are still waiting
    /// on the control queue.
    absorbed: usize,
}

impl UpdateBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true (and consumes one slot) if the next batched update from
    /// the control queue was already folded into an earlier batch.
    pub fn absorb_mirror(&mut self) -> bool {
        if self.absorbed > 0 {
            self.absorbed -= 1;
            true
        } else {
            false
        }
    }

    /// Merge `request` with everything currently waiting in `queue`.
    ///
    /// If the head of `queue` is the mirrored copy of `request` it is
    /// discarded. Every other drained item is counted as absorbed.
    pub fn process_request(
        &mut self,
        request: Command,
        queue: &mut impl DrainQueue,
    ) -> Vec<Command> {
        let mut drained = Vec::new();
        while let Some(command) = queue.try_pop() {
            drained.push(command);
        }
        if drained.first() == Some(&request) {
            drained.remove(0);
        }
        self.absorbed += drained.len();

        let mut out = Vec::new();
        let mut seen_tokens: Vec<String> = Vec::new();
        let mut ui_run: Option<UiRun> = None;
        let mut model_run: Option<ModelRun> = None;

        for command in std::iter::once(request).chain(drained) {
            match command {
                Command::UpdateUiElement(update) => {
                    let token = update.token().to_string();
                    if self.processed_tokens.contains(&token) || seen_tokens.contains(&token) {
                        debug!("[batcher] Dropping UI update with consumed token {}", token);
                        continue;
                    }
                    seen_tokens.push(token);
                    if let Some(run) = model_run.take() {
                        run.finish(&mut out);
                    }
                    ui_run.get_or_insert_with(UiRun::default).push(update);
                }
                Command::UpdateWidgetModel(update) => {
                    if let Some(run) = ui_run.take() {
                        out.push(run.finish());
                    }
                    model_run.get_or_insert_with(ModelRun::default).push(update);
                }
                other => {
                    if let Some(run) = ui_run.take() {
                        out.push(run.finish());
                    }
                    if let Some(run) = model_run.take() {
                        run.finish(&mut out);
                    }
                    out.push(other);
                }
            }
        }
        if let Some(run) = ui_run.take() {
            out.push(run.finish());
        }
        if let Some(run) = model_run.take() {
            run.finish(&mut out);
        }

        for token in seen_tokens {
            self.remember(token);
        }
        out
    }

    fn remember(&mut self, token: String) {
        if self.processed_tokens.insert(token.clone()) {
            self.token_order.push_back(token);
        }
        while self.token_order.len() > MAX_REMEMBERED_TOKENS {
            if let Some(oldest) = self.token_order.pop_front() {
                self.processed_tokens.remove(&oldest);
            }
        }
    }
}
