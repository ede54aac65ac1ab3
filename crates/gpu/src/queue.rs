//! Command queues.
//!
//! A [`CommandQueue`] wraps one hardware queue and its fence. Command lists
//! are handed out from a pool, recorded by their holder and moved back into
//! the queue on submission. A retirement thread per queue waits for each
//! submission's fence value and returns its lists to the pool.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use crate::{
    command::CommandBuffer,
    command_list::CommandList,
    device::{Device, Fence, HardwareQueue, QueueKind},
    error::Error,
    resource_state::GlobalResourceStates,
    Config,
};

struct InFlight {
    fence_value: u64,
    list: CommandList,
}

/// State shared with the retirement thread.
struct Shared {
    kind: QueueKind,
    fence: Arc<dyn Fence>,
    /// The highest fence value known to have been reached.
    last_completed: AtomicU64,
    available: Mutex<Vec<CommandList>>,
    in_flight: Mutex<usize>,
    retired: Condvar,
}

impl Shared {
    fn poll_fence(&self) -> u64 {
        let completed = self.fence.completed_value();
        self.last_completed.fetch_max(completed, Ordering::AcqRel).max(completed)
    }

    fn is_complete(&self, fence_value: u64) -> bool {
        fence_value <= self.last_completed.load(Ordering::Acquire)
            || fence_value <= self.poll_fence()
    }

    fn wait_until(&self, fence_value: u64) {
        if !self.is_complete(fence_value) {
            self.fence.wait_for(fence_value);
            self.last_completed.fetch_max(fence_value, Ordering::AcqRel);
        }
    }
}

pub struct CommandQueue {
    kind: QueueKind,
    device: Arc<dyn Device>,
    states: Arc<GlobalResourceStates>,
    config: Config,

    hardware: Box<dyn HardwareQueue>,
    /// The last fence value signaled on this queue.
    fence_value: Mutex<u64>,
    next_list_id: AtomicU64,

    shared: Arc<Shared>,
    sender: Option<Sender<InFlight>>,
    worker: Option<JoinHandle<()>>,
}

impl CommandQueue {
    pub fn new(
        kind: QueueKind,
        device: Arc<dyn Device>,
        states: Arc<GlobalResourceStates>,
        config: &Config,
    ) -> Result<Self, Error> {
        let hardware = device.create_queue(kind)?;
        let fence = device.create_fence(0)?;

        let shared = Arc::new(Shared {
            kind,
            fence,
            last_completed: AtomicU64::new(0),
            available: Mutex::new(Vec::new()),
            in_flight: Mutex::new(0),
            retired: Condvar::new(),
        });

        let (sender, receiver) = crossbeam_channel::unbounded();

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("{kind} retirement"))
                .spawn(move || retire(&shared, &receiver))
                .map_err(Error::Spawn)?
        };

        debug!("created {kind} queue");

        Ok(Self {
            kind,
            device,
            states,
            config: config.clone(),
            hardware,
            fence_value: Mutex::new(0),
            next_list_id: AtomicU64::new(0),
            shared,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Takes a command list from the pool, or creates one if every list is
    /// in use.
    pub fn get_command_list(&self) -> Result<CommandList, Error> {
        if let Some(list) = self.shared.available.lock().pop() {
            return Ok(list);
        }

        let id = self.next_list_id.fetch_add(1, Ordering::Relaxed);
        trace!("creating {} command list {id}", self.kind);

        Ok(CommandList::new(
            id,
            self.kind,
            self.device.clone(),
            self.states.clone(),
            &self.config,
        ))
    }

    /// The number of recycled command lists ready to be handed out.
    pub fn available_command_lists(&self) -> usize {
        self.shared.available.lock().len()
    }

    pub fn execute_command_list(&self, list: CommandList) -> Result<u64, Error> {
        self.execute_command_lists(vec![list])
    }

    /// Submits `lists` in order and returns the fence value that is reached
    /// once they have all executed.
    ///
    /// Each list is preceded by a list of the barriers needed to bring its
    /// resources from their globally known states into the states the list
    /// expects. Resolving those barriers and submitting happen under the
    /// global state lock, so no other queue can submit in between.
    ///
    /// ## Errors
    ///
    /// Fails if the device rejects the submission or the queue's retirement
    /// thread is gone.
    pub fn execute_command_lists(&self, mut lists: Vec<CommandList>) -> Result<u64, Error> {
        let mut pending = Vec::with_capacity(lists.len());
        for _ in 0..lists.len() {
            pending.push(self.get_command_list()?);
        }

        let fence_value = {
            let mut global = self.states.lock();

            let needs_pending: Vec<bool> = lists
                .iter_mut()
                .zip(&mut pending)
                .map(|(list, pending)| list.close_with(pending, &mut global))
                .collect();

            let mut buffers: Vec<&CommandBuffer> = Vec::with_capacity(lists.len() * 2);
            for ((list, pending), needed) in lists.iter().zip(&pending).zip(needs_pending) {
                if needed {
                    buffers.push(pending.command_buffer());
                }
                buffers.push(list.command_buffer());
            }

            self.hardware.execute(&buffers)?;
            let fence_value = self.signal()?;

            trace!(
                "{} queue executed {} command buffers for fence value {fence_value}",
                self.kind,
                buffers.len()
            );
            fence_value
        };

        let sender = self.sender.as_ref().ok_or(Error::QueueClosed(self.kind))?;
        *self.shared.in_flight.lock() += lists.len() + pending.len();

        for list in lists.into_iter().chain(pending) {
            sender
                .send(InFlight { fence_value, list })
                .map_err(|_| Error::QueueClosed(self.kind))?;
        }

        Ok(fence_value)
    }

    /// Signals the next fence value from the GPU once all previously
    /// submitted work has completed.
    pub fn signal(&self) -> Result<u64, Error> {
        let mut value = self.fence_value.lock();
        let next = *value + 1;
        self.hardware.signal(&self.shared.fence, next)?;
        *value = next;
        Ok(next)
    }

    pub fn is_fence_complete(&self, fence_value: u64) -> bool {
        self.shared.is_complete(fence_value)
    }

    pub fn completed_fence_value(&self) -> u64 {
        self.shared.poll_fence()
    }

    /// The last fence value signaled on this queue.
    pub fn current_fence_value(&self) -> u64 {
        *self.fence_value.lock()
    }

    /// Blocks until the GPU reaches `fence_value`.
    pub fn wait_for_fence_value(&self, fence_value: u64) {
        self.shared.wait_until(fence_value);
    }

    /// Makes work submitted to this queue from now on wait for everything
    /// submitted to `other` so far. Does not block the calling thread.
    pub fn wait(&self, other: &CommandQueue) -> Result<(), Error> {
        self.hardware
            .wait(&other.shared.fence, other.current_fence_value())?;
        Ok(())
    }

    /// Blocks until every submitted command list has been recycled and the
    /// queue is idle.
    pub fn flush(&self) {
        {
            let mut in_flight = self.shared.in_flight.lock();
            while *in_flight > 0 {
                self.shared.retired.wait(&mut in_flight);
            }
        }

        self.wait_for_fence_value(self.current_fence_value());
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.flush();

        // Closing the channel stops the retirement thread once it drains.
        self.sender = None;

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("{} retirement thread panicked", self.kind);
            }
        }

        debug!("destroyed {} queue", self.kind);
    }
}

fn retire(shared: &Shared, receiver: &Receiver<InFlight>) {
    for InFlight {
        fence_value,
        mut list,
    } in receiver
    {
        shared.wait_until(fence_value);
        list.reset();
        shared.available.lock().push(list);

        let mut in_flight = shared.in_flight.lock();
        *in_flight -= 1;
        if *in_flight == 0 {
            shared.retired.notify_all();
        }
    }

    debug!("{} retirement thread exiting", shared.kind);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{Barrier, Command},
        device::{Format, ResourceDesc},
        headless::HeadlessDevice,
        resource_state::{ResourceStates, Subresource},
    };

    fn queue(kind: QueueKind) -> (Arc<HeadlessDevice>, Arc<GlobalResourceStates>, CommandQueue) {
        let device = Arc::new(HeadlessDevice::new());
        let states = Arc::new(GlobalResourceStates::new());
        let queue = CommandQueue::new(kind, device.clone(), states.clone(), &Config::default())
            .unwrap();
        (device, states, queue)
    }

    #[test]
    fn empty_list_round_trip() {
        let (device, _, queue) = queue(QueueKind::Direct);

        let list = queue.get_command_list().unwrap();
        let fence_value = queue.execute_command_list(list).unwrap();
        assert_eq!(fence_value, 1);
        assert_eq!(queue.current_fence_value(), 1);

        queue.wait_for_fence_value(fence_value);
        assert!(queue.is_fence_complete(fence_value));

        queue.flush();
        // The list and its unused pending list are both back in the pool.
        assert_eq!(queue.available_command_lists(), 2);
        assert_eq!(device.executed(QueueKind::Direct).len(), 1);
    }

    #[test]
    fn fence_values_increase() {
        let (_, _, queue) = queue(QueueKind::Compute);

        assert_eq!(queue.signal().unwrap(), 1);
        assert_eq!(queue.signal().unwrap(), 2);
        let list = queue.get_command_list().unwrap();
        assert_eq!(queue.execute_command_list(list).unwrap(), 3);

        queue.flush();
        assert_eq!(queue.completed_fence_value(), 3);
        // Waiting for a value that was already reached returns immediately.
        queue.wait_for_fence_value(1);
    }

    #[test]
    fn paused_lists_stay_in_flight() {
        let (device, _, queue) = queue(QueueKind::Copy);

        device.pause();
        let list = queue.get_command_list().unwrap();
        let fence_value = queue.execute_command_list(list).unwrap();

        assert!(!queue.is_fence_complete(fence_value));
        assert_eq!(queue.available_command_lists(), 0);

        device.resume();
        queue.flush();
        assert!(queue.is_fence_complete(fence_value));
        assert_eq!(queue.available_command_lists(), 2);
    }

    #[test]
    fn batch_resolves_against_earlier_lists() {
        let (device, states, queue) = queue(QueueKind::Direct);

        let desc = ResourceDesc::texture_2d(16, 16, Format::R8G8B8A8Unorm, 1);
        let texture = device.create_resource(&desc, ResourceStates::COMMON).unwrap();
        states.register(texture, ResourceStates::COMMON, 1);

        let mut first = queue.get_command_list().unwrap();
        first.transition_barrier(texture, ResourceStates::COPY_DEST, Subresource::All, false);
        let mut second = queue.get_command_list().unwrap();
        second.transition_barrier(
            texture,
            ResourceStates::PIXEL_SHADER_RESOURCE,
            Subresource::All,
            false,
        );

        queue.execute_command_lists(vec![first, second]).unwrap();
        queue.flush();

        let executed = device.executed(QueueKind::Direct);
        assert_eq!(executed.len(), 4);

        let transitions: Vec<_> = executed
            .iter()
            .flat_map(|buffer| buffer.commands().iter())
            .flat_map(|command| match command {
                Command::Barriers(barriers) => barriers.to_vec(),
                _ => Vec::new(),
            })
            .collect();

        assert_eq!(
            transitions,
            vec![
                Barrier::transition(
                    texture,
                    Subresource::All,
                    ResourceStates::COMMON,
                    ResourceStates::COPY_DEST
                ),
                Barrier::transition(
                    texture,
                    Subresource::All,
                    ResourceStates::COPY_DEST,
                    ResourceStates::PIXEL_SHADER_RESOURCE
                ),
            ]
        );
        assert!(device.validation_errors().is_empty());
        assert_eq!(
            device.resource_state(texture, 0),
            Some(ResourceStates::PIXEL_SHADER_RESOURCE)
        );
    }

    #[test]
    fn lists_are_recycled() {
        let (_, _, queue) = queue(QueueKind::Direct);

        let list = queue.get_command_list().unwrap();
        let id = list.id();
        queue.execute_command_list(list).unwrap();
        queue.flush();

        let mut ids: Vec<_> = (0..2)
            .map(|_| queue.get_command_list().unwrap())
            .map(|list| list.id())
            .collect();
        ids.sort_unstable();
        assert!(ids.contains(&id));

        let list = queue.get_command_list().unwrap();
        assert!(list.id() >= 2);
        assert!(list.commands().is_empty());
    }
}
