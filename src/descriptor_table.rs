//! The global descriptor table singleton (§3, §9: "model as two
//! process-wide singletons with explicit init/teardown hooks").

use crate::config::{Descriptor, DEFAULT_MAX_CONNECTIONS};
use crate::connection::Connection;
use crate::error::{StcpError, StcpResult};

use std::sync::{Arc, Mutex, OnceLock};

pub(crate) struct DescriptorTable {
    slots: Mutex<Vec<Option<Arc<Connection>>>>,
}

impl DescriptorTable {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Finds a free slot and installs the connection built by `make`,
    /// which receives the descriptor it has been assigned.
    pub fn allocate(
        &self,
        make: impl FnOnce(Descriptor) -> StcpResult<Connection>,
    ) -> StcpResult<Arc<Connection>> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(StcpError::Emfile)?;
        let connection = Arc::new(make(Descriptor::new(index))?);
        slots[index] = Some(connection.clone());
        Ok(connection)
    }

    pub fn get(&self, descriptor: Descriptor) -> StcpResult<Arc<Connection>> {
        let slots = self.slots.lock().unwrap();
        slots
            .get(descriptor.index())
            .and_then(|slot| slot.clone())
            .ok_or(StcpError::Ebadf)
    }

    pub fn free(&self, descriptor: Descriptor) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(descriptor.index()) {
            *slot = None;
        }
    }
}

static TABLE: OnceLock<DescriptorTable> = OnceLock::new();
static REQUESTED_CAPACITY: Mutex<Option<usize>> = Mutex::new(None);

/// Sets the descriptor table's capacity. Must be called before the
/// table is first used (by `open()` or otherwise); returns
/// [`StcpError::Einval`] if the table has already been created, or if
/// `capacity` is not a power of two (§3, §6: "process-wide maximum that
/// must be a power of two").
pub fn init_with_capacity(capacity: usize) -> StcpResult<()> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(StcpError::Einval);
    }
    let mut requested = REQUESTED_CAPACITY.lock().unwrap();
    if TABLE.get().is_some() {
        return Err(StcpError::Einval);
    }
    *requested = Some(capacity);
    Ok(())
}

pub(crate) fn table() -> &'static DescriptorTable {
    TABLE.get_or_init(|| {
        let capacity = REQUESTED_CAPACITY
            .lock()
            .unwrap()
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);
        DescriptorTable::new(capacity)
    })
}
