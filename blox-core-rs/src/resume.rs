//! Boot continuation across a warm reset
//!
//! Negotiation ends by recording the settled role and resetting the board.
//! The next boot reads the record before anything else, clears it, and enters
//! the role directly. The record lives in memory that survives a warm reset
//! but not a power cycle.

use core::cell::Cell;
use core::ptr;

use crate::types::RoleEntry;

/// Contents of a resume cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeState<E> {
    /// Nothing recorded; negotiate on this boot
    #[default]
    Empty,
    /// Enter this role on the next boot
    Resume(E),
}

/// Storage that survives a warm reset
pub trait ResumeCell<E: RoleEntry> {
    /// Read the record and clear it. The cell is empty before this returns.
    fn take(&self) -> Option<E>;

    /// Record the role to enter on the next boot
    fn store(&self, entry: E);

    /// Is a role recorded?
    fn is_set(&self) -> bool;
}

// ============================================================================
// In-memory cell
// ============================================================================

/// Resume cell in ordinary memory, for hosted nodes and tests
#[derive(Debug)]
pub struct MemoryResumeCell<E: RoleEntry> {
    state: Cell<ResumeState<E>>,
}

impl<E: RoleEntry> Default for MemoryResumeCell<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: RoleEntry> MemoryResumeCell<E> {
    /// Empty cell
    pub const fn new() -> Self {
        Self {
            state: Cell::new(ResumeState::Empty),
        }
    }

    /// Cell holding `state`, as if left over from the previous boot
    pub fn with_state(state: ResumeState<E>) -> Self {
        Self {
            state: Cell::new(state),
        }
    }

    /// Current contents, without clearing
    pub fn state(&self) -> ResumeState<E> {
        self.state.get()
    }
}

impl<E: RoleEntry> ResumeCell<E> for MemoryResumeCell<E> {
    fn take(&self) -> Option<E> {
        match self.state.replace(ResumeState::Empty) {
            ResumeState::Resume(entry) => Some(entry),
            ResumeState::Empty => None,
        }
    }

    fn store(&self, entry: E) {
        self.state.set(ResumeState::Resume(entry));
    }

    fn is_set(&self) -> bool {
        matches!(self.state.get(), ResumeState::Resume(_))
    }
}

// ============================================================================
// Reserved RAM words
// ============================================================================

/// Resume cell over two reserved machine words: a flag and an entry address.
///
/// The linker script keeps the words out of `.bss` so a warm reset leaves
/// them alone. The flag holds [`RawResumeCell::MAGIC`] rather than 1 so that
/// whatever RAM contains after power-up is very unlikely to read as valid.
pub struct RawResumeCell {
    words: *mut usize,
}

impl RawResumeCell {
    /// Flag value marking a recorded entry
    pub const MAGIC: usize = 0xB10C_0001;

    /// Cell over `words[0]` (flag) and `words[1]` (entry address).
    ///
    /// # Safety
    ///
    /// `words` must point to two aligned, writable `usize` words that outlive
    /// the cell and are not accessed by anything else. An entry address found
    /// there must have been written by [`ResumeCell::store`].
    pub const unsafe fn new(words: *mut usize) -> Self {
        Self { words }
    }
}

impl ResumeCell<fn()> for RawResumeCell {
    fn take(&self) -> Option<fn()> {
        // SAFETY: `new` guarantees two valid words behind the pointer.
        let (flag, addr) = unsafe {
            let flag = ptr::read_volatile(self.words);
            let addr = ptr::read_volatile(self.words.add(1));
            ptr::write_volatile(self.words, 0);
            ptr::write_volatile(self.words.add(1), 0);
            (flag, addr)
        };

        if flag != Self::MAGIC || addr == 0 {
            return None;
        }
        // SAFETY: a valid flag means `store` wrote `addr` from a `fn()`.
        Some(unsafe { core::mem::transmute::<usize, fn()>(addr) })
    }

    fn store(&self, entry: fn()) {
        // SAFETY: `new` guarantees two valid words behind the pointer.
        unsafe {
            ptr::write_volatile(self.words.add(1), entry as usize);
            ptr::write_volatile(self.words, Self::MAGIC);
        }
    }

    fn is_set(&self) -> bool {
        // SAFETY: `new` guarantees two valid words behind the pointer.
        unsafe { ptr::read_volatile(self.words) == Self::MAGIC }
    }
}
