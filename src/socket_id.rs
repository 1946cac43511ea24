use std::sync::Mutex;

/// The first ephemeral socket number. Everything below this range is reserved for well-known
///  service sockets, so the counter wraps back here instead of to zero.
pub const FIRST_EPHEMERAL_SOCKET: u32 = 0x1000;

/// Process-wide allocator for ephemeral connection sockets: a monotonic counter behind a
///  lock, wrapping around inside the ephemeral range. Constructed once at startup and passed
///  by reference to the components that need it - there is deliberately no global instance.
pub struct SocketIdAllocator {
    next: Mutex<u32>,
}

impl SocketIdAllocator {
    pub fn new() -> SocketIdAllocator {
        SocketIdAllocator {
            next: Mutex::new(FIRST_EPHEMERAL_SOCKET),
        }
    }

    pub fn next(&self) -> u32 {
        let mut guard = self.next.lock()
            .expect("socket id allocator lock is never poisoned");
        let allocated = *guard;
        *guard = if allocated == u32::MAX { FIRST_EPHEMERAL_SOCKET } else { allocated + 1 };
        allocated
    }
}

impl Default for SocketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
