//! Resource state tracking.
//!
//! Every resource has a usage state per subresource. Two views of that state
//! exist:
//!
//! - The global map ([`GlobalResourceStates`]) holds the state each resource
//!   will be in once all submitted work completes. It is shared by every
//!   queue and only touched under its lock.
//! - Each command list has a [`ResourceStateTracker`] holding the state each
//!   resource will be in at the end of that list. While recording, a list
//!   does not know what state a resource starts in, so the first transition
//!   of each subresource is recorded as a pending barrier and resolved
//!   against the global map when the list is submitted.

use std::collections::{hash_map::Entry, BTreeMap};

use log::warn;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::command::{Barrier, Barriers, Command, CommandBuffer};
use crate::device::ResourceId;

bitflags::bitflags! {
    /// Hardware usage states. `COMMON` is the empty set.
    #[derive(Default)]
    pub struct ResourceStates: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits
            | Self::INDEX_BUFFER.bits
            | Self::NON_PIXEL_SHADER_RESOURCE.bits
            | Self::PIXEL_SHADER_RESOURCE.bits
            | Self::INDIRECT_ARGUMENT.bits
            | Self::COPY_SOURCE.bits;
    }
}

impl ResourceStates {
    pub const PRESENT: Self = Self::COMMON;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subresource {
    All,
    Index(u32),
}

/// The state of one resource in the global map.
///
/// Subresources without an override are in the whole-resource state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceState {
    state: ResourceStates,
    subresources: BTreeMap<u32, ResourceStates>,
    subresource_count: u32,
}

impl ResourceState {
    pub fn new(state: ResourceStates, subresource_count: u32) -> Self {
        assert!(subresource_count > 0);
        Self {
            state,
            subresources: BTreeMap::new(),
            subresource_count,
        }
    }

    pub fn subresource_count(&self) -> u32 {
        self.subresource_count
    }

    /// Whether any subresource is in a state different from the whole
    /// resource.
    pub fn is_split(&self) -> bool {
        !self.subresources.is_empty()
    }

    pub fn get(&self, subresource: Subresource) -> ResourceStates {
        match subresource {
            Subresource::All => self.state,
            Subresource::Index(index) => self
                .subresources
                .get(&index)
                .copied()
                .unwrap_or(self.state),
        }
    }

    /// ## Panics
    ///
    /// Panics if the subresource index is out of range.
    pub fn set(&mut self, subresource: Subresource, state: ResourceStates) {
        match subresource {
            Subresource::All => {
                self.state = state;
                self.subresources.clear();
            }
            Subresource::Index(index) => {
                assert!(
                    index < self.subresource_count,
                    "subresource {index} out of range for a resource with {} subresources",
                    self.subresource_count
                );
                self.subresources.insert(index, state);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ResourceStateMap {
    states: FxHashMap<ResourceId, ResourceState>,
}

impl ResourceStateMap {
    pub fn get(&self, resource: ResourceId) -> Option<&ResourceState> {
        self.states.get(&resource)
    }

    pub fn get_mut(&mut self, resource: ResourceId) -> Option<&mut ResourceState> {
        self.states.get_mut(&resource)
    }

    pub fn insert(&mut self, resource: ResourceId, state: ResourceState) {
        self.states.insert(resource, state);
    }

    pub fn remove(&mut self, resource: ResourceId) -> Option<ResourceState> {
        self.states.remove(&resource)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// The process-wide resource state map.
///
/// Barrier resolution and submission must happen under the same lock, so the
/// operations that need it take the locked [`ResourceStateMap`] rather than
/// `&self`.
#[derive(Debug, Default)]
pub struct GlobalResourceStates {
    map: Mutex<ResourceStateMap>,
}

impl GlobalResourceStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ResourceStateMap> {
        self.map.lock()
    }

    /// Starts tracking a newly created resource. Every resource must be
    /// registered before it is used in a command list.
    pub fn register(&self, resource: ResourceId, state: ResourceStates, subresource_count: u32) {
        self.lock()
            .insert(resource, ResourceState::new(state, subresource_count));
    }

    pub fn unregister(&self, resource: ResourceId) {
        self.lock().remove(resource);
    }

    pub fn state(&self, resource: ResourceId, subresource: Subresource) -> Option<ResourceStates> {
        self.lock().get(resource).map(|state| state.get(subresource))
    }
}

/// The subresources covered by a pending barrier.
#[derive(Clone, Debug, PartialEq, Eq)]
enum PendingSubresources {
    One(u32),
    All,
    /// Every subresource except those the list had already touched before
    /// transitioning the whole resource.
    AllExcept(SmallVec<[u32; 4]>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PendingBarrier {
    resource: ResourceId,
    subresources: PendingSubresources,
    after: ResourceStates,
}

/// What a command list knows about a resource's state at the end of the
/// list. The whole-resource state is unknown if the list has only touched
/// individual subresources.
#[derive(Clone, Debug, Default)]
struct TrackedState {
    state: Option<ResourceStates>,
    subresources: BTreeMap<u32, ResourceStates>,
}

impl TrackedState {
    fn known(&self, index: u32) -> Option<ResourceStates> {
        self.subresources.get(&index).copied().or(self.state)
    }
}

#[derive(Debug, Default)]
pub struct ResourceStateTracker {
    barriers: Barriers,
    pending: Vec<PendingBarrier>,
    final_states: FxHashMap<ResourceId, TrackedState>,
}

impl ResourceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a transition of `subresource` to `after`.
    ///
    /// If the list already knows the subresource's state, a barrier is
    /// queued if it differs. Otherwise the transition is deferred until the
    /// list is submitted.
    pub fn transition(&mut self, resource: ResourceId, subresource: Subresource, after: ResourceStates) {
        let tracked = match self.final_states.entry(resource) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut tracked = TrackedState::default();
                let subresources = match subresource {
                    Subresource::All => {
                        tracked.state = Some(after);
                        PendingSubresources::All
                    }
                    Subresource::Index(index) => {
                        tracked.subresources.insert(index, after);
                        PendingSubresources::One(index)
                    }
                };

                self.pending.push(PendingBarrier {
                    resource,
                    subresources,
                    after,
                });
                entry.insert(tracked);
                return;
            }
        };

        match subresource {
            Subresource::Index(index) => {
                match tracked.known(index) {
                    Some(before) if before != after => self
                        .barriers
                        .push(Barrier::transition(resource, subresource, before, after)),
                    Some(_) => {}
                    None => self.pending.push(PendingBarrier {
                        resource,
                        subresources: PendingSubresources::One(index),
                        after,
                    }),
                }

                tracked.subresources.insert(index, after);
            }
            Subresource::All => {
                match tracked.state {
                    Some(whole) if whole == after => {
                        for (&index, &before) in &tracked.subresources {
                            if before != after {
                                self.barriers.push(Barrier::transition(
                                    resource,
                                    Subresource::Index(index),
                                    before,
                                    after,
                                ));
                            }
                        }
                    }
                    Some(whole) => {
                        // Bring split subresources back in line with the rest
                        // of the resource so one barrier can move them all.
                        for (&index, &before) in &tracked.subresources {
                            if before != whole {
                                self.barriers.push(Barrier::transition(
                                    resource,
                                    Subresource::Index(index),
                                    before,
                                    whole,
                                ));
                            }
                        }

                        self.barriers
                            .push(Barrier::transition(resource, Subresource::All, whole, after));
                    }
                    None => {
                        for (&index, &before) in &tracked.subresources {
                            if before != after {
                                self.barriers.push(Barrier::transition(
                                    resource,
                                    Subresource::Index(index),
                                    before,
                                    after,
                                ));
                            }
                        }

                        self.pending.push(PendingBarrier {
                            resource,
                            subresources: PendingSubresources::AllExcept(
                                tracked.subresources.keys().copied().collect(),
                            ),
                            after,
                        });
                    }
                }

                tracked.state = Some(after);
                tracked.subresources.clear();
            }
        }
    }

    /// Records an arbitrary barrier. The `before` state of a transition is
    /// ignored; the tracker knows better.
    pub fn resource_barrier(&mut self, barrier: Barrier) {
        match barrier {
            Barrier::Transition {
                resource,
                subresource,
                after,
                ..
            } => self.transition(resource, subresource, after),
            Barrier::Uav { resource } => self.uav_barrier(resource),
            Barrier::Aliasing { before, after } => self.aliasing_barrier(before, after),
        }
    }

    pub fn uav_barrier(&mut self, resource: Option<ResourceId>) {
        self.barriers.push(Barrier::Uav { resource });
    }

    pub fn aliasing_barrier(&mut self, before: Option<ResourceId>, after: Option<ResourceId>) {
        self.barriers.push(Barrier::Aliasing { before, after });
    }

    pub fn num_queued_barriers(&self) -> usize {
        self.barriers.len()
    }

    pub fn num_pending_barriers(&self) -> usize {
        self.pending.len()
    }

    /// Records all queued barriers into `commands`.
    pub fn flush_resource_barriers(&mut self, commands: &mut CommandBuffer) {
        if !self.barriers.is_empty() {
            commands.push(Command::Barriers(std::mem::take(&mut self.barriers)));
        }
    }

    /// Resolves pending barriers against the global state and records the
    /// barriers that are actually needed into `commands`. Returns the number
    /// of barriers recorded.
    ///
    /// A list never leaves two pending barriers for the same subresource, so
    /// every pending barrier resolves against the state the resource is in
    /// when the list begins executing.
    pub fn flush_pending_resource_barriers(
        &mut self,
        global: &ResourceStateMap,
        commands: &mut CommandBuffer,
    ) -> usize {
        let mut barriers = Barriers::new();

        for pending in self.pending.drain(..) {
            let Some(current) = global.get(pending.resource) else {
                warn!(
                    "pending barrier for unregistered resource {:?} ignored",
                    pending.resource
                );
                continue;
            };

            let mut transition = |subresource: Subresource| {
                let before = current.get(subresource);
                if before != pending.after {
                    barriers.push(Barrier::transition(
                        pending.resource,
                        subresource,
                        before,
                        pending.after,
                    ));
                }
            };

            match &pending.subresources {
                PendingSubresources::One(index) => transition(Subresource::Index(*index)),
                PendingSubresources::All if !current.is_split() => transition(Subresource::All),
                PendingSubresources::All => {
                    for index in 0..current.subresource_count() {
                        transition(Subresource::Index(index));
                    }
                }
                PendingSubresources::AllExcept(skip) => {
                    for index in 0..current.subresource_count() {
                        if !skip.contains(&index) {
                            transition(Subresource::Index(index));
                        }
                    }
                }
            }
        }

        let count = barriers.len();
        if count > 0 {
            commands.push(Command::Barriers(barriers));
        }
        count
    }

    /// Writes the list's final states into the global map.
    pub fn commit_final_resource_states(&mut self, global: &mut ResourceStateMap) {
        for (resource, tracked) in self.final_states.drain() {
            let Some(current) = global.get_mut(resource) else {
                warn!("final state of unregistered resource {resource:?} discarded");
                continue;
            };

            if let Some(state) = tracked.state {
                current.set(Subresource::All, state);
            }

            for (index, state) in tracked.subresources {
                current.set(Subresource::Index(index), state);
            }
        }
    }

    pub fn reset(&mut self) {
        self.barriers.clear();
        self.pending.clear();
        self.final_states.clear();
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;

    fn resources(n: usize) -> Vec<ResourceId> {
        let mut keys = SlotMap::<ResourceId, ()>::with_key();
        (0..n).map(|_| keys.insert(())).collect()
    }

    fn barriers(commands: &CommandBuffer) -> Vec<Barrier> {
        commands
            .commands()
            .iter()
            .flat_map(|command| match command {
                Command::Barriers(barriers) => barriers.to_vec(),
                _ => Vec::new(),
            })
            .collect()
    }

    fn assert_no_redundant_transitions(barriers: &[Barrier]) {
        for barrier in barriers {
            if let Barrier::Transition { before, after, .. } = barrier {
                assert_ne!(before, after);
            }
        }
    }

    #[test]
    fn known_state_emits_local_barrier() {
        let r = resources(1)[0];
        let mut tracker = ResourceStateTracker::new();
        let mut commands = CommandBuffer::default();

        tracker.transition(r, Subresource::All, ResourceStates::COPY_DEST);
        assert_eq!(tracker.num_pending_barriers(), 1);
        assert_eq!(tracker.num_queued_barriers(), 0);

        tracker.transition(r, Subresource::All, ResourceStates::PIXEL_SHADER_RESOURCE);
        tracker.transition(r, Subresource::All, ResourceStates::PIXEL_SHADER_RESOURCE);
        assert_eq!(tracker.num_pending_barriers(), 1);

        tracker.flush_resource_barriers(&mut commands);
        assert_eq!(
            barriers(&commands),
            vec![Barrier::transition(
                r,
                Subresource::All,
                ResourceStates::COPY_DEST,
                ResourceStates::PIXEL_SHADER_RESOURCE
            )]
        );

        // Flushing again records nothing.
        tracker.flush_resource_barriers(&mut commands);
        assert_eq!(commands.commands().len(), 1);
    }

    #[test]
    fn pending_resolves_against_global() {
        let r = resources(1)[0];
        let states = GlobalResourceStates::new();
        states.register(r, ResourceStates::COMMON, 1);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition(r, Subresource::All, ResourceStates::COPY_DEST);

        let mut fixup = CommandBuffer::default();
        let mut global = states.lock();
        assert_eq!(tracker.flush_pending_resource_barriers(&global, &mut fixup), 1);
        tracker.commit_final_resource_states(&mut global);
        drop(global);

        assert_eq!(
            barriers(&fixup),
            vec![Barrier::transition(
                r,
                Subresource::All,
                ResourceStates::COMMON,
                ResourceStates::COPY_DEST
            )]
        );
        assert_eq!(
            states.state(r, Subresource::All),
            Some(ResourceStates::COPY_DEST)
        );
    }

    #[test]
    fn pending_already_in_state_is_dropped() {
        let r = resources(1)[0];
        let states = GlobalResourceStates::new();
        states.register(r, ResourceStates::RENDER_TARGET, 1);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition(r, Subresource::All, ResourceStates::RENDER_TARGET);

        let mut fixup = CommandBuffer::default();
        assert_eq!(
            tracker.flush_pending_resource_barriers(&states.lock(), &mut fixup),
            0
        );
        assert!(fixup.is_empty());
    }

    #[test]
    fn second_list_sees_first_lists_final_state() {
        let r = resources(1)[0];
        let states = GlobalResourceStates::new();
        states.register(r, ResourceStates::COMMON, 1);

        let mut l1 = ResourceStateTracker::new();
        let mut l2 = ResourceStateTracker::new();
        l1.transition(r, Subresource::All, ResourceStates::RENDER_TARGET);
        l2.transition(r, Subresource::All, ResourceStates::PIXEL_SHADER_RESOURCE);

        let mut f1 = CommandBuffer::default();
        let mut f2 = CommandBuffer::default();
        {
            let mut global = states.lock();
            l1.flush_pending_resource_barriers(&global, &mut f1);
            l1.commit_final_resource_states(&mut global);
            l2.flush_pending_resource_barriers(&global, &mut f2);
            l2.commit_final_resource_states(&mut global);
        }

        assert_eq!(
            barriers(&f2),
            vec![Barrier::transition(
                r,
                Subresource::All,
                ResourceStates::RENDER_TARGET,
                ResourceStates::PIXEL_SHADER_RESOURCE
            )]
        );
        assert_eq!(
            states.state(r, Subresource::All),
            Some(ResourceStates::PIXEL_SHADER_RESOURCE)
        );
    }

    #[test]
    fn whole_after_split_subresources() {
        let r = resources(1)[0];
        let mut tracker = ResourceStateTracker::new();
        let mut commands = CommandBuffer::default();

        tracker.transition(r, Subresource::All, ResourceStates::COPY_DEST);
        tracker.transition(r, Subresource::Index(1), ResourceStates::UNORDERED_ACCESS);
        tracker.transition(r, Subresource::Index(2), ResourceStates::PIXEL_SHADER_RESOURCE);
        tracker.transition(r, Subresource::All, ResourceStates::PIXEL_SHADER_RESOURCE);
        tracker.flush_resource_barriers(&mut commands);

        let emitted = barriers(&commands);
        assert_no_redundant_transitions(&emitted);
        assert_eq!(
            emitted,
            vec![
                Barrier::transition(
                    r,
                    Subresource::Index(1),
                    ResourceStates::COPY_DEST,
                    ResourceStates::UNORDERED_ACCESS
                ),
                Barrier::transition(
                    r,
                    Subresource::Index(2),
                    ResourceStates::COPY_DEST,
                    ResourceStates::PIXEL_SHADER_RESOURCE
                ),
                Barrier::transition(
                    r,
                    Subresource::Index(1),
                    ResourceStates::UNORDERED_ACCESS,
                    ResourceStates::COPY_DEST
                ),
                Barrier::transition(
                    r,
                    Subresource::Index(2),
                    ResourceStates::PIXEL_SHADER_RESOURCE,
                    ResourceStates::COPY_DEST
                ),
                Barrier::transition(
                    r,
                    Subresource::All,
                    ResourceStates::COPY_DEST,
                    ResourceStates::PIXEL_SHADER_RESOURCE
                ),
            ]
        );
    }

    #[test]
    fn whole_after_split_subresources_to_same_state() {
        let r = resources(1)[0];
        let mut tracker = ResourceStateTracker::new();
        let mut commands = CommandBuffer::default();

        tracker.transition(r, Subresource::All, ResourceStates::PIXEL_SHADER_RESOURCE);
        tracker.transition(r, Subresource::Index(0), ResourceStates::RENDER_TARGET);
        tracker.transition(r, Subresource::All, ResourceStates::PIXEL_SHADER_RESOURCE);
        tracker.flush_resource_barriers(&mut commands);

        assert_eq!(
            barriers(&commands),
            vec![
                Barrier::transition(
                    r,
                    Subresource::Index(0),
                    ResourceStates::PIXEL_SHADER_RESOURCE,
                    ResourceStates::RENDER_TARGET
                ),
                Barrier::transition(
                    r,
                    Subresource::Index(0),
                    ResourceStates::RENDER_TARGET,
                    ResourceStates::PIXEL_SHADER_RESOURCE
                ),
            ]
        );
    }

    #[test]
    fn whole_after_unknown_subresources_expands_on_resolve() {
        let r = resources(1)[0];
        let states = GlobalResourceStates::new();
        states.register(r, ResourceStates::COMMON, 3);

        let mut tracker = ResourceStateTracker::new();
        let mut commands = CommandBuffer::default();
        let mut fixup = CommandBuffer::default();

        tracker.transition(r, Subresource::Index(1), ResourceStates::RENDER_TARGET);
        tracker.transition(r, Subresource::All, ResourceStates::PIXEL_SHADER_RESOURCE);
        tracker.flush_resource_barriers(&mut commands);

        assert_eq!(
            barriers(&commands),
            vec![Barrier::transition(
                r,
                Subresource::Index(1),
                ResourceStates::RENDER_TARGET,
                ResourceStates::PIXEL_SHADER_RESOURCE
            )]
        );

        {
            let mut global = states.lock();
            assert_eq!(tracker.flush_pending_resource_barriers(&global, &mut fixup), 3);
            tracker.commit_final_resource_states(&mut global);
        }

        // Subresource 1 is brought to the state the list expects it in; the
        // others go straight to the final state.
        assert_eq!(
            barriers(&fixup),
            vec![
                Barrier::transition(
                    r,
                    Subresource::Index(1),
                    ResourceStates::COMMON,
                    ResourceStates::RENDER_TARGET
                ),
                Barrier::transition(
                    r,
                    Subresource::Index(0),
                    ResourceStates::COMMON,
                    ResourceStates::PIXEL_SHADER_RESOURCE
                ),
                Barrier::transition(
                    r,
                    Subresource::Index(2),
                    ResourceStates::COMMON,
                    ResourceStates::PIXEL_SHADER_RESOURCE
                ),
            ]
        );

        let global = states.lock();
        let state = global.get(r).unwrap();
        assert!(!state.is_split());
        assert_eq!(
            state.get(Subresource::All),
            ResourceStates::PIXEL_SHADER_RESOURCE
        );
    }

    #[test]
    fn pending_whole_resource_against_split_global() {
        let r = resources(1)[0];
        let states = GlobalResourceStates::new();
        states.register(r, ResourceStates::PIXEL_SHADER_RESOURCE, 2);
        states
            .lock()
            .get_mut(r)
            .unwrap()
            .set(Subresource::Index(1), ResourceStates::RENDER_TARGET);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition(r, Subresource::All, ResourceStates::PIXEL_SHADER_RESOURCE);

        let mut fixup = CommandBuffer::default();
        assert_eq!(
            tracker.flush_pending_resource_barriers(&states.lock(), &mut fixup),
            1
        );
        assert_eq!(
            barriers(&fixup),
            vec![Barrier::transition(
                r,
                Subresource::Index(1),
                ResourceStates::RENDER_TARGET,
                ResourceStates::PIXEL_SHADER_RESOURCE
            )]
        );
    }

    #[test]
    fn commit_merges_touched_subresources() {
        let r = resources(1)[0];
        let states = GlobalResourceStates::new();
        states.register(r, ResourceStates::PIXEL_SHADER_RESOURCE, 4);

        let mut tracker = ResourceStateTracker::new();
        tracker.transition(r, Subresource::Index(2), ResourceStates::UNORDERED_ACCESS);

        {
            let mut global = states.lock();
            tracker.flush_pending_resource_barriers(&global, &mut CommandBuffer::default());
            tracker.commit_final_resource_states(&mut global);
        }

        assert_eq!(
            states.state(r, Subresource::Index(2)),
            Some(ResourceStates::UNORDERED_ACCESS)
        );
        assert_eq!(
            states.state(r, Subresource::Index(0)),
            Some(ResourceStates::PIXEL_SHADER_RESOURCE)
        );
    }

    #[test]
    fn unregistered_resource_is_skipped() {
        let r = resources(1)[0];
        let states = GlobalResourceStates::new();

        let mut tracker = ResourceStateTracker::new();
        tracker.transition(r, Subresource::All, ResourceStates::COPY_DEST);

        let mut fixup = CommandBuffer::default();
        let mut global = states.lock();
        assert_eq!(tracker.flush_pending_resource_barriers(&global, &mut fixup), 0);
        tracker.commit_final_resource_states(&mut global);
        assert!(global.is_empty());
    }

    #[test]
    fn non_transition_barriers_are_queued_in_order() {
        let rs = resources(2);
        let (a, b) = (rs[0], rs[1]);
        let mut tracker = ResourceStateTracker::new();
        let mut commands = CommandBuffer::default();

        tracker.uav_barrier(Some(a));
        tracker.aliasing_barrier(Some(a), Some(b));
        tracker.uav_barrier(None);
        tracker.flush_resource_barriers(&mut commands);

        assert_eq!(
            barriers(&commands),
            vec![
                Barrier::Uav { resource: Some(a) },
                Barrier::Aliasing {
                    before: Some(a),
                    after: Some(b)
                },
                Barrier::Uav { resource: None },
            ]
        );
    }

    #[test]
    fn reset_forgets_everything() {
        let r = resources(1)[0];
        let mut tracker = ResourceStateTracker::new();

        tracker.transition(r, Subresource::All, ResourceStates::COPY_DEST);
        tracker.transition(r, Subresource::All, ResourceStates::COPY_SOURCE);
        tracker.reset();

        assert_eq!(tracker.num_pending_barriers(), 0);
        assert_eq!(tracker.num_queued_barriers(), 0);

        // The resource is unknown again, so this transition is pending.
        tracker.transition(r, Subresource::All, ResourceStates::COPY_DEST);
        assert_eq!(tracker.num_pending_barriers(), 1);
    }

    #[test]
    fn no_redundant_transitions() {
        let rs = resources(3);
        let states = GlobalResourceStates::new();
        for &r in &rs {
            states.register(r, ResourceStates::COMMON, 4);
        }

        let choices = [
            ResourceStates::COMMON,
            ResourceStates::RENDER_TARGET,
            ResourceStates::PIXEL_SHADER_RESOURCE,
            ResourceStates::COPY_DEST,
            ResourceStates::UNORDERED_ACCESS,
        ];

        let mut seed = 0x9e37_79b9_u32;
        for _ in 0..20 {
            let mut tracker = ResourceStateTracker::new();
            let mut commands = CommandBuffer::default();
            let mut fixup = CommandBuffer::default();

            for _ in 0..30 {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;

                let resource = rs[seed as usize % rs.len()];
                let subresource = match (seed >> 8) % 5 {
                    4 => Subresource::All,
                    i => Subresource::Index(i),
                };
                let after = choices[(seed >> 16) as usize % choices.len()];
                tracker.transition(resource, subresource, after);
            }

            tracker.flush_resource_barriers(&mut commands);
            {
                let mut global = states.lock();
                tracker.flush_pending_resource_barriers(&global, &mut fixup);
                tracker.commit_final_resource_states(&mut global);
            }

            assert_no_redundant_transitions(&barriers(&commands));
            assert_no_redundant_transitions(&barriers(&fixup));
        }
    }
}
