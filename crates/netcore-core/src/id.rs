//! Connection identifiers and backend event tokens

use core::fmt;
use core::num::NonZeroU32;

/// Token id used when registering the listening socket.
pub const LISTEN_TOKEN_ID: u32 = 0;

/// Token id used when registering the control pipe.
pub const CONTROL_TOKEN_ID: u32 = u32::MAX;

/// Identifier of a connection slot in a manager's table.
///
/// Ids start at 1; 0 is reserved as the invalid id. The slot for id `n`
/// lives at index `n - 1`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnId(NonZeroU32);

impl ConnId {
    /// Create from a raw id. Returns `None` for 0 and for the control token id.
    #[inline]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw == CONTROL_TOKEN_ID {
            return None;
        }
        match NonZeroU32::new(raw) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// Id for a table index (`index + 1`).
    #[inline]
    pub fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index)
            .ok()
            .and_then(|i| i.checked_add(1))
            .and_then(Self::new)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Table index of this id.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnId({})", self.get())
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.get())
    }
}

/// `(fd, id)` packed into a backend user-data word.
///
/// High 32 bits: native descriptor. Low 32 bits: connection id, or one of
/// the sentinel ids for the listen socket and control pipe. The event to
/// connection mapping needs no secondary lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

impl Token {
    #[inline]
    pub const fn new(fd: i32, id: u32) -> Self {
        Token(((fd as u32 as u64) << 32) | id as u64)
    }

    #[inline]
    pub const fn listen(fd: i32) -> Self {
        Self::new(fd, LISTEN_TOKEN_ID)
    }

    #[inline]
    pub const fn control(fd: i32) -> Self {
        Self::new(fd, CONTROL_TOKEN_ID)
    }

    #[inline]
    pub fn conn(fd: i32, id: ConnId) -> Self {
        Self::new(fd, id.get())
    }

    #[inline]
    pub const fn fd(self) -> i32 {
        (self.0 >> 32) as u32 as i32
    }

    #[inline]
    pub const fn id(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn is_listen(self) -> bool {
        self.id() == LISTEN_TOKEN_ID
    }

    #[inline]
    pub const fn is_control(self) -> bool {
        self.id() == CONTROL_TOKEN_ID
    }

    /// The connection id, if this token refers to a connection.
    #[inline]
    pub const fn conn_id(self) -> Option<ConnId> {
        ConnId::new(self.id())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_listen() {
            write!(f, "Token(listen fd={})", self.fd())
        } else if self.is_control() {
            write!(f, "Token(control fd={})", self.fd())
        } else {
            write!(f, "Token(fd={} id={})", self.fd(), self.id())
        }
    }
}
