use crate::alloc::FrameAllocator;
use crate::command::{Command, EntityCommands};
use crate::entities::Entity;
use crate::events::EventQueue;

/// Default per-system scratch capacity.
const SCRATCH_CAPACITY: usize = 256 * 1024;

/// Frame-scoped state owned by one system registration.
///
/// Holds the command log the system's buffers flush into, a private event
/// queue, and a frame allocator for scratch data. Only the owning system
/// touches it while a schedule runs; the scheduler drains the log and the
/// events at phase boundaries and resets the scratch afterwards.
pub struct SystemLocalStorage {
    commands: Vec<Command>,
    events: EventQueue,
    scratch: FrameAllocator,
}

impl Default for SystemLocalStorage {
    fn default() -> Self {
        Self::new(SCRATCH_CAPACITY)
    }
}

impl SystemLocalStorage {
    /// Creates storage with `scratch_capacity` bytes of frame scratch.
    pub fn new(scratch_capacity: usize) -> Self {
        Self {
            commands: Vec::new(),
            events: EventQueue::new(),
            scratch: FrameAllocator::new(scratch_capacity),
        }
    }

    /// Moves a command into the log.
    pub fn push_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Queued commands.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Takes every queued command out of the log.
    pub fn drain_commands(&mut self) -> Vec<Command> {
        core::mem::take(&mut self.commands)
    }

    /// The system's private event queue.
    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    /// Mutable access to the private event queue.
    pub fn events_mut(&mut self) -> &mut EventQueue {
        &mut self.events
    }

    /// The system's frame scratch allocator.
    pub fn scratch(&self) -> &FrameAllocator {
        &self.scratch
    }

    /// Rewinds the scratch allocator. Run by the scheduler once the command
    /// log has been drained; nothing allocated from the scratch may survive
    /// this point.
    pub(crate) fn reset_scratch(&mut self) {
        self.scratch.reset();
    }

    /// Opens a command buffer over this storage aimed at `entity`.
    pub fn command_buffer(&mut self, entity: Entity) -> EntityCommands<'_> {
        let Self {
            commands, scratch, ..
        } = self;
        EntityCommands::new(entity, scratch, commands)
    }

    /// Empties the command log and the event queue.
    pub fn clear(&mut self) {
        self.commands.clear();
        self.events.clear_all();
    }

    /// Whether both the log and the event queue are empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.events.is_empty()
    }
}
