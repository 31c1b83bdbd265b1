//! Half-stream lifecycle as an additive bitmask.
//!
//! The initial and reply halves of a stream move through opening, opened,
//! closing and closed independently. Every combination of bits is a valid
//! state; transitions only ever add bits, and a finished stream is dropped
//! rather than reset.

use std::fmt;

/// Lifecycle bits for one stream pair.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct LifecycleState(u32);

impl LifecycleState {
    /// No half has been observed.
    pub const NONE: Self = Self(0);
    /// Reply BEGIN seen.
    pub const REPLY_OPENING: Self = Self(0x01);
    /// Reply half open.
    pub const REPLY_OPENED: Self = Self(0x02);
    /// Reply END or ABORT seen.
    pub const REPLY_CLOSING: Self = Self(0x04);
    /// Reply half closed.
    pub const REPLY_CLOSED: Self = Self(0x08);
    /// Initial BEGIN seen.
    pub const INITIAL_OPENING: Self = Self(0x10);
    /// Initial half open.
    pub const INITIAL_OPENED: Self = Self(0x20);
    /// Initial END, ABORT or RESET seen.
    pub const INITIAL_CLOSING: Self = Self(0x40);
    /// Initial half closed.
    pub const INITIAL_CLOSED: Self = Self(0x80);
    /// Reply half terminated abnormally.
    pub const REPLY_ABORTING: Self = Self(0x100);

    /// Wraps raw bits.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    const fn has(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Marks the initial half as opening.
    pub const fn opening_initial(self) -> Self {
        self.with(Self::INITIAL_OPENING)
    }

    /// Marks the initial half as opening and opened.
    pub const fn open_initial(self) -> Self {
        self.with(Self::INITIAL_OPENING).with(Self::INITIAL_OPENED)
    }

    /// Marks the initial half as closing.
    pub const fn closing_initial(self) -> Self {
        self.with(Self::INITIAL_CLOSING)
    }

    /// Marks the initial half as closing and closed.
    pub const fn close_initial(self) -> Self {
        self.with(Self::INITIAL_CLOSING).with(Self::INITIAL_CLOSED)
    }

    /// Marks the reply half as opening.
    pub const fn opening_reply(self) -> Self {
        self.with(Self::REPLY_OPENING)
    }

    /// Marks the reply half as opening and opened.
    pub const fn open_reply(self) -> Self {
        self.with(Self::REPLY_OPENING).with(Self::REPLY_OPENED)
    }

    /// Marks the reply half as closing.
    pub const fn closing_reply(self) -> Self {
        self.with(Self::REPLY_CLOSING)
    }

    /// Marks the reply half as closing and closed.
    pub const fn close_reply(self) -> Self {
        self.with(Self::REPLY_CLOSING).with(Self::REPLY_CLOSED)
    }

    /// Marks the reply half as aborting.
    pub const fn aborting_reply(self) -> Self {
        self.with(Self::REPLY_ABORTING)
    }

    /// Marks the reply half as aborted and closed.
    pub const fn abort_reply(self) -> Self {
        self.aborting_reply().close_reply()
    }

    /// Whether `INITIAL_OPENING` is set.
    pub const fn initial_opening(self) -> bool {
        self.has(Self::INITIAL_OPENING)
    }

    /// Whether `INITIAL_OPENED` is set.
    pub const fn initial_opened(self) -> bool {
        self.has(Self::INITIAL_OPENED)
    }

    /// Whether `INITIAL_CLOSING` is set.
    pub const fn initial_closing(self) -> bool {
        self.has(Self::INITIAL_CLOSING)
    }

    /// Whether `INITIAL_CLOSED` is set.
    pub const fn initial_closed(self) -> bool {
        self.has(Self::INITIAL_CLOSED)
    }

    /// Whether `REPLY_OPENING` is set.
    pub const fn reply_opening(self) -> bool {
        self.has(Self::REPLY_OPENING)
    }

    /// Whether `REPLY_OPENED` is set.
    pub const fn reply_opened(self) -> bool {
        self.has(Self::REPLY_OPENED)
    }

    /// Whether `REPLY_CLOSING` is set.
    pub const fn reply_closing(self) -> bool {
        self.has(Self::REPLY_CLOSING)
    }

    /// Whether `REPLY_CLOSED` is set.
    pub const fn reply_closed(self) -> bool {
        self.has(Self::REPLY_CLOSED)
    }

    /// Whether `REPLY_ABORTING` is set.
    pub const fn reply_aborting(self) -> bool {
        self.has(Self::REPLY_ABORTING)
    }

    /// Both halves are closing.
    pub const fn closing(self) -> bool {
        self.has(Self::INITIAL_CLOSING.with(Self::REPLY_CLOSING))
    }

    /// Both halves are closed; the pair may be forgotten.
    pub const fn closed(self) -> bool {
        self.has(Self::INITIAL_CLOSED.with(Self::REPLY_CLOSED))
    }

    /// Every half that began opening has closed.
    ///
    /// Differs from [`closed`](Self::closed) when the two halves of a pair are
    /// written to different workers and each side only sees one of them.
    pub const fn settled(self) -> bool {
        (!self.initial_opening() || self.initial_closed())
            && (!self.reply_opening() || self.reply_closed())
    }
}

impl fmt::Debug for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(LifecycleState, &str); 9] = [
            (LifecycleState::INITIAL_OPENING, "INITIAL_OPENING"),
            (LifecycleState::INITIAL_OPENED, "INITIAL_OPENED"),
            (LifecycleState::INITIAL_CLOSING, "INITIAL_CLOSING"),
            (LifecycleState::INITIAL_CLOSED, "INITIAL_CLOSED"),
            (LifecycleState::REPLY_OPENING, "REPLY_OPENING"),
            (LifecycleState::REPLY_OPENED, "REPLY_OPENED"),
            (LifecycleState::REPLY_CLOSING, "REPLY_CLOSING"),
            (LifecycleState::REPLY_CLOSED, "REPLY_CLOSED"),
            (LifecycleState::REPLY_ABORTING, "REPLY_ABORTING"),
        ];

        write!(f, "LifecycleState(")?;
        let mut first = true;
        for (flag, name) in NAMES {
            if self.has(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        write!(f, ")")
    }
}
