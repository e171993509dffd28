// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The resource manager core: virtual handle translation and context
//! swapping around every TPM command.

use crate::broker::AccessBroker;
use crate::command::Tpm2Command;
use crate::handle_map::HandleMapEntry;
use crate::message::ControlCode;
use crate::message::Message;
use crate::response::Tpm2Response;
use crate::sink::Sink;
use crate::sink::Source;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tpm2_proto::CommandCode;
use tpm2_proto::MAX_COMMAND_HANDLES;
use tpm2_proto::TssRc;
use tpm2_proto::is_transient;

// Most entries one command can touch: the handle-area slots plus one
// virtualized response handle.
const TOUCHED_ENTRY_BOUND: usize = MAX_COMMAND_HANDLES + 1;

/// The per-process TPM resource manager.
///
/// Owns the single dispatch worker that serializes all TPM access. Clients
/// enqueue [`Message`]s from any thread; responses come back through the
/// sink configured with [`ResourceManager::add_sink`]. Commands are
/// processed strictly in arrival order, one at a time.
pub struct ResourceManager {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Message>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    broker: Arc<dyn AccessBroker>,
    sink: Mutex<Option<Arc<dyn Sink<Tpm2Response>>>>,
    cancel: AtomicBool,
}

impl ResourceManager {
    /// Creates a resource manager that reaches the TPM through `broker`.
    ///
    /// The worker does not run until [`ResourceManager::start`] is called;
    /// messages enqueued before then are buffered.
    pub fn new(broker: Arc<dyn AccessBroker>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            shared: Arc::new(Shared {
                broker,
                sink: Mutex::new(None),
                cancel: AtomicBool::new(false),
            }),
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    /// Configures the downstream sink that receives every response. Ignored
    /// with a warning if a sink is already set.
    pub fn add_sink(&self, sink: Arc<dyn Sink<Tpm2Response>>) {
        let mut slot = self.shared.sink.lock();
        if slot.is_some() {
            tracing::warn!("response sink already configured");
            return;
        }
        *slot = Some(sink);
    }

    /// Accepts a message from any thread. Failures never propagate to the
    /// caller; a command that cannot be processed surfaces as a response on
    /// the sink.
    pub fn enqueue(&self, message: Message) {
        if self.tx.send(message).is_err() {
            tracing::warn!("input queue is closed; dropping message");
        }
    }

    /// Spawns the dispatch worker. A second call is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let Some(rx) = self.rx.lock().take() else {
            tracing::warn!("dispatch worker already started");
            return Ok(());
        };
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("tpm2-resmgr".to_string())
            .spawn(move || run(&shared, rx))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Stops the dispatch worker and waits for it to drain.
    ///
    /// Sets the cancel flag and enqueues a [`ControlCode::CheckCancel`] so
    /// a dequeue blocked on an empty queue wakes immediately.
    pub fn stop(&self) {
        self.shared.cancel.store(true, Ordering::Release);
        let _ = self.tx.send(Message::Control(ControlCode::CheckCancel));
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("dispatch worker panicked");
            }
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Sink<Message> for ResourceManager {
    fn enqueue(&self, message: Message) {
        self.enqueue(message);
    }
}

impl Source<Tpm2Response> for ResourceManager {
    fn add_sink(&self, sink: Arc<dyn Sink<Tpm2Response>>) {
        self.add_sink(sink);
    }
}

/// Worker loop: dequeue, process, repeat until told to exit.
fn run(shared: &Shared, queue: mpsc::Receiver<Message>) {
    tracing::debug!("dispatch worker running");
    loop {
        let message = match queue.recv() {
            Ok(message) => message,
            // Every sender is gone; nothing further can arrive.
            Err(_) => break,
        };
        match message {
            Message::Command(command) => shared.process_command(command),
            Message::Control(ControlCode::Exit) => break,
            Message::Control(ControlCode::CheckCancel) => {
                if shared.cancel.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }
    tracing::debug!("dispatch worker exiting");
}

impl Shared {
    /// Runs one client command through the pipeline and enqueues the
    /// response.
    ///
    /// Touched entries are evicted after the response is enqueued, on
    /// success and on failure alike, so the TPM's transient slots are free
    /// before the next command runs.
    fn process_command(&self, mut command: Tpm2Command) {
        let connection = command.connection().clone();
        tracing::debug!(
            connection = connection.id(),
            code = ?command.command_code(),
            size = command.buffer().len(),
            "processing command"
        );

        if self.is_over_object_quota(&command) {
            tracing::debug!(connection = connection.id(), "transient object quota reached");
            self.enqueue_response(Tpm2Response::from_rc(
                connection,
                TssRc::RESMGR_OBJECT_MEMORY,
            ));
            return;
        }

        let mut touched: Vec<Arc<HandleMapEntry>> = Vec::with_capacity(TOUCHED_ENTRY_BOUND);
        let response = if command.command_code() == CommandCode::FLUSH_CONTEXT {
            self.flush_context(&command)
        } else {
            let loaded = if command.handle_count() > 0 {
                self.load_contexts(&mut command, &mut touched)
            } else {
                Ok(())
            };
            let mut response = match loaded {
                Ok(()) => match self.broker.send_command(&command) {
                    Ok(buffer) => {
                        Tpm2Response::new(connection.clone(), buffer, command.attributes())
                    }
                    Err(rc) => {
                        tracing::warn!("access broker failed to send command: {rc}");
                        Tpm2Response::from_rc(connection.clone(), rc)
                    }
                },
                Err(rc) => Tpm2Response::from_rc(connection.clone(), rc),
            };
            if response.has_handle() {
                if let Some(entry) = self.virtualize_handle(&mut response) {
                    touched.push(entry);
                }
            }
            response
        };

        self.enqueue_response(response);

        for entry in &touched {
            self.flushsave_context(entry);
        }
    }

    /// True when `command` would create a transient object but the
    /// connection's map has no room left for one.
    fn is_over_object_quota(&self, command: &Tpm2Command) -> bool {
        command.command_code().creates_transient_object()
            && command.connection().transient_map().is_full()
    }

    /// Rewrites every managed transient handle in the command's handle area
    /// to a loaded physical handle, recording the touched entries.
    ///
    /// Slots that do not map to a managed entry are left alone; the TPM
    /// rejects them with its own error code. A context-load failure aborts
    /// the command, leaving the already-loaded entries on the touched list
    /// so they still get evicted.
    fn load_contexts(
        &self,
        command: &mut Tpm2Command,
        touched: &mut Vec<Arc<HandleMapEntry>>,
    ) -> Result<(), TssRc> {
        let connection = command.connection().clone();
        for index in 0..command.handle_count() {
            let Some(handle) = command.handle(index) else {
                tracing::warn!(index, "command buffer too short for its declared handle area");
                continue;
            };
            if !is_transient(handle) {
                continue;
            }
            let Some(entry) = connection.transient_map().vlookup(handle) else {
                tracing::warn!("no mapping for virtual handle {handle:#010x}");
                continue;
            };
            self.virt_to_phys(command, &entry, index)?;
            touched.push(entry);
        }
        Ok(())
    }

    /// Ensures the entry's object is loaded on the TPM and substitutes the
    /// physical handle into handle slot `index`.
    ///
    /// An entry already holding a physical handle is not reloaded; this
    /// covers the same virtual handle appearing in two slots, and the
    /// handle a failed eviction left behind.
    fn virt_to_phys(
        &self,
        command: &mut Tpm2Command,
        entry: &Arc<HandleMapEntry>,
        index: usize,
    ) -> Result<(), TssRc> {
        let mut phandle = entry.phandle();
        if phandle == 0 {
            phandle = self.broker.context_load(&entry.context()).inspect_err(|rc| {
                tracing::warn!(
                    "failed to load context for virtual handle {:#010x}: {rc}",
                    entry.vhandle()
                );
            })?;
            entry.set_phandle(phandle);
        }
        tracing::debug!(
            "virtual handle {:#010x} maps to physical handle {phandle:#010x}",
            entry.vhandle()
        );
        command.set_handle(index, phandle);
        Ok(())
    }

    /// Virtualizes a freshly created transient object named in the
    /// response: allocates a virtual handle, maps it, and rewrites the
    /// response in place. Non-transient response handles pass through.
    fn virtualize_handle(&self, response: &mut Tpm2Response) -> Option<Arc<HandleMapEntry>> {
        let phandle = response.handle()?;
        if !is_transient(phandle) {
            return None;
        }
        let connection = response.connection().clone();
        let map = connection.transient_map();
        let vhandle = map.next_vhandle().unwrap_or_else(|| {
            panic!(
                "virtual handle space exhausted for connection {}",
                connection.id()
            )
        });
        let entry = HandleMapEntry::new(phandle, vhandle);
        if let Err(err) = map.insert(vhandle, entry.clone()) {
            // Unreachable: next_vhandle never returns a live key.
            tracing::error!("dropping mapping for new object: {err}");
        }
        tracing::debug!("physical handle {phandle:#010x} virtualized as {vhandle:#010x}");
        response.set_handle(vhandle);
        Some(entry)
    }

    /// Saves and flushes the entry's object off the TPM, releasing its
    /// transient slot.
    ///
    /// On failure the physical handle is left in place: the slot may still
    /// be occupied, and the next command reuses the handle instead of
    /// loading the stale context.
    fn flushsave_context(&self, entry: &HandleMapEntry) {
        let phandle = entry.phandle();
        if !is_transient(phandle) {
            return;
        }
        match self.broker.context_saveflush(phandle) {
            Ok(context) => entry.store_context(context),
            Err(rc) => {
                tracing::warn!("context save+flush failed for {phandle:#010x}: {rc}");
            }
        }
    }

    /// Routes a FlushContext command.
    ///
    /// A managed transient handle is flushed by dropping its mapping; the
    /// object is already saved off the TPM, so the TPM is not contacted. A
    /// transient handle this manager never issued is answered with a
    /// handle/parameter error. Anything else (sessions, persistent
    /// objects) goes to the TPM unchanged.
    fn flush_context(&self, command: &Tpm2Command) -> Tpm2Response {
        let connection = command.connection().clone();
        let Some(handle) = command.flush_handle() else {
            return Tpm2Response::from_rc(connection, TssRc::RESMGR_BAD_FLUSH_HANDLE);
        };
        if is_transient(handle) {
            let rc = match connection.transient_map().remove(handle) {
                Some(_) => {
                    tracing::debug!("flushed virtualized object {handle:#010x}");
                    TssRc::SUCCESS
                }
                None => TssRc::RESMGR_BAD_FLUSH_HANDLE,
            };
            Tpm2Response::from_rc(connection, rc)
        } else {
            match self.broker.send_command(command) {
                Ok(buffer) => Tpm2Response::new(connection, buffer, command.attributes()),
                Err(rc) => Tpm2Response::from_rc(connection, rc),
            }
        }
    }

    fn enqueue_response(&self, response: Tpm2Response) {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.enqueue(response),
            None => tracing::warn!("no response sink configured; dropping response"),
        }
    }
}
