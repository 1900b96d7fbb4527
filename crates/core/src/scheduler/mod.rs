//! A single background thread shared by many cooperative clients.
//!
//! Each registered [`TimeSliceClient`] is called back in turn and answers with
//! the delay it wants before its next slice. The thread only holds weak
//! references, so registering never keeps a client alive, and a client that
//! has been dropped is simply pruned from the registry.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use crate::{Result, ThumbnailError};

/// What a client wants after finishing a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// Call again once the delay has elapsed.
    RunAgainAfter(Duration),
    /// Deregister; the client has nothing left to do.
    Finished,
}

/// Work that can be performed in short, bounded slices.
pub trait TimeSliceClient: Send + Sync {
    fn use_time_slice(&self) -> SliceOutcome;
}

/// Registry handle of a client. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

struct ClientEntry {
    id: ClientId,
    client: Weak<dyn TimeSliceClient>,
    next_run: Instant,
    /// Re-registered while one of its slices was running. A `Finished`
    /// from that slice must not drop the entry.
    rearmed: bool,
}

#[derive(Default)]
struct Registry {
    clients: Vec<ClientEntry>,
    running: Option<ClientId>,
    worker: Option<ThreadId>,
    shutdown: bool,
}

enum Next {
    Run(ClientId, Arc<dyn TimeSliceClient>),
    Sleep(Option<Duration>),
}

impl Registry {
    fn position(&self, id: ClientId) -> Option<usize> {
        self.clients.iter().position(|entry| entry.id == id)
    }

    /// Picks the most overdue live client, pruning dead ones on the way.
    fn next(&mut self, now: Instant) -> Next {
        self.clients.retain(|entry| entry.client.strong_count() > 0);

        let Some(entry) = self.clients.iter().min_by_key(|entry| entry.next_run) else {
            return Next::Sleep(None);
        };
        if entry.next_run > now {
            return Next::Sleep(Some(entry.next_run - now));
        }
        match entry.client.upgrade() {
            Some(client) => Next::Run(entry.id, client),
            None => Next::Sleep(Some(Duration::ZERO)),
        }
    }
}

struct Shared {
    registry: Mutex<Registry>,
    wakeup: Condvar,
    next_id: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background thread that time-slices between its registered clients.
///
/// The thread is started lazily by [`TimeSliceThread::ensure_running`] and is
/// stopped and joined when the handle is dropped.
pub struct TimeSliceThread {
    name: String,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
    spawn_worker: bool,
}

impl TimeSliceThread {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                wakeup: Condvar::new(),
                next_id: AtomicU64::new(1),
            }),
            handle: Mutex::new(None),
            spawn_worker: true,
        }
    }

    /// A thread that never spawns its worker, so tests can drive clients
    /// by hand.
    #[cfg(test)]
    pub(crate) fn without_worker(name: impl Into<String>) -> Self {
        let mut thread = Self::new(name);
        thread.spawn_worker = false;
        thread
    }

    /// Registers a client to be called as soon as possible. Registering a
    /// client that is already present only brings its next slice forward,
    /// and keeps it registered even if the slice running right now answers
    /// `Finished`.
    pub fn add_client(&self, client: Weak<dyn TimeSliceClient>) -> ClientId {
        let mut registry = self.shared.lock();
        let now = Instant::now();
        let running = registry.running;

        let id = match registry
            .clients
            .iter_mut()
            .find(|entry| Weak::ptr_eq(&entry.client, &client))
        {
            Some(entry) => {
                entry.next_run = now;
                entry.rearmed |= running == Some(entry.id);
                entry.id
            }
            None => {
                let id = ClientId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
                registry.clients.push(ClientEntry {
                    id,
                    client,
                    next_run: now,
                    rearmed: false,
                });
                id
            }
        };

        drop(registry);
        self.shared.wakeup.notify_all();
        id
    }

    /// Deregisters a client. If one of its slices is executing on the worker,
    /// this waits for the slice to return before handing control back, unless
    /// it is called from the worker itself.
    pub fn remove_client(&self, id: ClientId) {
        let mut registry = self.shared.lock();
        if let Some(index) = registry.position(id) {
            registry.clients.remove(index);
        }

        let on_worker = registry.worker == Some(thread::current().id());
        while !on_worker && registry.running == Some(id) {
            registry = self
                .shared
                .wakeup
                .wait(registry)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn contains_client(&self, id: ClientId) -> bool {
        self.shared.lock().position(id).is_some()
    }

    pub fn num_clients(&self) -> usize {
        self.shared.lock().clients.len()
    }

    pub fn is_running(&self) -> bool {
        self.lock_handle()
            .map(|guard| guard.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Spawns the worker thread if it is not running yet.
    pub fn ensure_running(&self) -> Result<()> {
        if !self.spawn_worker {
            return Ok(());
        }
        let mut handle = self.lock_handle()?;
        if handle.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        self.shared.lock().shutdown = false;
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run(shared))?;

        tracing::debug!(thread = %self.name, "time slice thread started");
        *handle = Some(spawned);
        Ok(())
    }

    /// Asks the worker to exit after its current slice and joins it.
    pub fn stop(&self) -> Result<()> {
        let handle = self.lock_handle()?.take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let on_worker = {
            let mut registry = self.shared.lock();
            registry.shutdown = true;
            registry.worker == Some(thread::current().id())
        };
        self.shared.wakeup.notify_all();

        // The last handle can be dropped by a client finishing on the worker.
        if on_worker {
            return Ok(());
        }
        handle
            .join()
            .map_err(|_| ThumbnailError::msg("time slice thread panicked"))?;
        tracing::debug!(thread = %self.name, "time slice thread stopped");
        Ok(())
    }

    fn lock_handle(&self) -> Result<MutexGuard<'_, Option<JoinHandle<()>>>> {
        self.handle
            .lock()
            .map_err(|_| ThumbnailError::msg("time slice thread handle has been poisoned"))
    }
}

impl Drop for TimeSliceThread {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(error = %err, "failed to stop time slice thread");
        }
    }
}

impl fmt::Debug for TimeSliceThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeSliceThread")
            .field("name", &self.name)
            .field("clients", &self.num_clients())
            .finish()
    }
}

fn run(shared: Arc<Shared>) {
    let mut registry = shared.lock();
    registry.worker = Some(thread::current().id());

    loop {
        if registry.shutdown {
            break;
        }

        match registry.next(Instant::now()) {
            Next::Sleep(None) => {
                registry = shared
                    .wakeup
                    .wait(registry)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Next::Sleep(Some(delay)) => {
                registry = shared
                    .wakeup
                    .wait_timeout(registry, delay)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            Next::Run(id, client) => {
                registry.running = Some(id);
                drop(registry);

                let outcome = client.use_time_slice();

                {
                    let mut registry = shared.lock();
                    registry.running = None;
                    if let Some(index) = registry.position(id) {
                        let entry = &mut registry.clients[index];
                        let rearmed = std::mem::take(&mut entry.rearmed);
                        match outcome {
                            SliceOutcome::RunAgainAfter(delay) if !rearmed => {
                                entry.next_run = Instant::now() + delay;
                            }
                            SliceOutcome::Finished if !rearmed => {
                                registry.clients.remove(index);
                            }
                            // next_run was already brought forward by add_client
                            _ => {}
                        }
                    }
                }
                shared.wakeup.notify_all();

                // Released outside the lock: the client may deregister on drop.
                drop(client);
                registry = shared.lock();
            }
        }
    }

    registry.worker = None;
}
